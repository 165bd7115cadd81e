//! Reply assembly: turning a sequence of raw lines into a [`Reply`], the
//! unit of data the [`crate::mux`] dispatches to either a waiting caller
//! or the event dispatcher.

use tokio::io::AsyncBufRead;

use crate::codec;
use crate::error::Error;
use crate::tap::TapSink;

/// A single parsed line of a protocol reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    /// Exactly three ASCII decimal digits.
    pub status: [u8; 3],
    /// `-` (mid-reply), `+` (mid-reply, followed by a data body), or ` '
    /// (terminal line of the reply).
    pub divider: u8,
    /// The remainder of the line after the divider, CR already stripped.
    pub message: String,
    /// Present only when `divider == b'+'`: the dot-unescaped body.
    pub data: Option<String>,
}

impl ReplyLine {
    /// `true` for the line that ends a reply (`divider == ' '`).
    pub fn is_terminal(&self) -> bool {
        self.divider == b' '
    }

    pub fn status_str(&self) -> &str {
        std::str::from_utf8(&self.status).expect("status is ASCII digits by construction")
    }
}

/// An ordered, non-empty sequence of [`ReplyLine`] values terminated by
/// the line whose divider is a space.
///
/// The status class of the *first* line governs the whole reply: `2xx`
/// success, `4xx`/`5xx` server error, `6xx` asynchronous event. Mixed
/// classes within one reply are not expected by the protocol.
#[derive(Debug, Clone)]
pub struct Reply {
    lines: Vec<ReplyLine>,
}

impl Reply {
    #[cfg(test)]
    pub(crate) fn __for_tests(lines: Vec<ReplyLine>) -> Self {
        Reply { lines }
    }

    pub fn lines(&self) -> &[ReplyLine] {
        &self.lines
    }

    pub fn first(&self) -> &ReplyLine {
        self.lines.first().expect("a Reply is always non-empty")
    }

    pub fn last(&self) -> &ReplyLine {
        self.lines.last().expect("a Reply is always non-empty")
    }

    /// `true` if the first line's status starts with `6` (an
    /// asynchronous event, never delivered to a waiting caller).
    pub fn is_event(&self) -> bool {
        self.first().status[0] == b'6'
    }

    /// `true` if the first line's status starts with `2` (success).
    pub fn is_success(&self) -> bool {
        self.first().status[0] == b'2'
    }
}

/// Reads successive [`ReplyLine`]s from `reader` until a terminal line,
/// assembling one [`Reply`].
///
/// Returns `Ok(None)` on a clean end-of-stream encountered *before* any
/// line has been read — the [`crate::mux`] reader loop treats this as a
/// clean close rather than a protocol error. An end-of-stream encountered
/// mid-reply is a [`Error::Protocol`].
pub(crate) async fn read_reply<R>(reader: &mut R, tap: &TapSink) -> Result<Option<Reply>, Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = Vec::new();

    loop {
        let raw = match codec::read_line(reader, tap).await? {
            Some(raw) => raw,
            None if lines.is_empty() => return Ok(None),
            None => return Err(Error::protocol("unexpected end of stream mid-reply")),
        };

        let line = parse_line(&raw)?;

        let line = if line.divider == b'+' {
            let data = codec::decode_data_block(reader, tap).await?;
            ReplyLine {
                data: Some(data),
                ..line
            }
        } else {
            line
        };

        let terminal = line.is_terminal();
        lines.push(line);

        if terminal {
            break;
        }
    }

    Ok(Some(Reply { lines }))
}

fn parse_line(raw: &str) -> Result<ReplyLine, Error> {
    let bytes = raw.as_bytes();

    if bytes.len() < 4 {
        return Err(Error::protocol(format!("line too short: {raw:?}")));
    }

    let mut status = [0u8; 3];
    for (i, &b) in bytes[..3].iter().enumerate() {
        if !b.is_ascii_digit() {
            return Err(Error::protocol(format!("non-digit status in line: {raw:?}")));
        }
        status[i] = b;
    }

    let divider = bytes[3];
    if !matches!(divider, b'-' | b'+' | b' ') {
        return Err(Error::protocol(format!("invalid divider {:?} in line: {raw:?}", divider as char)));
    }

    let message = raw[4..].to_owned();

    Ok(ReplyLine {
        status,
        divider,
        message,
        data: None,
    })
}
