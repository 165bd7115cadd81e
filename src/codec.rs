//! Line-oriented I/O primitives: reading a single CRLF/LF-terminated line,
//! writing a command line, quoting a string argument, and dot-stuffing a
//! multi-line data block.
//!
//! These are pure framing helpers; they know nothing about reply status
//! codes or the request/response protocol built on top of them (that's
//! [`crate::reply`] and [`crate::mux`]).

use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::error::Error;
use crate::tap::TapSink;

/// Reads the next line from `reader`, CRLF- or LF-terminated, with the
/// terminator stripped.
///
/// Returns `Ok(None)` on a clean end-of-stream where not a single byte was
/// read (the explicit end-of-stream marker spec.md §4.1 asks for, rather
/// than conflating it with an empty line).
pub(crate) async fn read_line<R>(reader: &mut R, tap: &TapSink) -> Result<Option<String>, Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = String::new();
    let n = reader.read_line(&mut raw).await.map_err(Error::from)?;

    if n == 0 {
        return Ok(None);
    }

    if raw.ends_with('\n') {
        raw.pop();
        if raw.ends_with('\r') {
            raw.pop();
        }
    }

    tap.incoming(&raw);

    Ok(Some(raw))
}

/// Writes `line` terminated by CRLF.
pub(crate) async fn write_line<W>(writer: &mut W, line: &str, tap: &TapSink) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;

    tap.outgoing(line);

    Ok(())
}

/// Wraps `s` in double quotes, escaping `\`, `"`, CR, and LF with a
/// backslash. No other character is escaped — this is the control-spec
/// quoting rule, not general-purpose string escaping.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' | '"' => {
                out.push('\\');
                out.push(c);
            }
            '\r' => out.push_str("\\\r"),
            '\n' => out.push_str("\\\n"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Dot-stuffs `body` (split on `\n`) into the wire form of a data block:
/// every line is CRLF-terminated, a line starting with `.` gets an extra
/// leading `.`, and the block is closed with a lone `.` line.
///
/// This does not write anything; it returns the literal bytes to send so
/// callers (the [`crate::mux`] writer) can emit them under their own
/// write lock alongside the command line.
pub(crate) fn encode_data_block(body: &str) -> String {
    let mut out = String::with_capacity(body.len() + 16);

    for line in body.split('\n') {
        // A bare trailing CR (e.g. the line was "foo\r") is promoted to CRLF
        // rather than left dangling, per spec.md §4.1.
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push_str("\r\n");
    }

    out.push_str(".\r\n");
    out
}

/// Reads a dot-stuffed data block from `reader` until the terminating
/// lone-`.` line, which is consumed but not included in the result.
/// Leading dots on stuffed lines are removed; lines are rejoined with
/// `\n` (no trailing newline after the last line).
pub(crate) async fn decode_data_block<R>(reader: &mut R, tap: &TapSink) -> Result<String, Error>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = Vec::new();

    loop {
        let line = read_line(reader, tap)
            .await?
            .ok_or_else(|| Error::protocol("unexpected end of stream inside data block"))?;

        if line == "." {
            break;
        }

        let unstuffed = line.strip_prefix('.').unwrap_or(&line);
        lines.push(unstuffed.to_owned());
    }

    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn read_line_strips_crlf() {
        let mut cursor = Cursor::new(b"250 OK\r\nrest".to_vec());
        let line = read_line(&mut cursor, &TapSink::new()).await.unwrap().unwrap();
        assert_eq!(line, "250 OK");
    }

    #[tokio::test]
    async fn read_line_tolerates_bare_lf() {
        let mut cursor = Cursor::new(b"250 OK\n".to_vec());
        let line = read_line(&mut cursor, &TapSink::new()).await.unwrap().unwrap();
        assert_eq!(line, "250 OK");
    }

    #[tokio::test]
    async fn read_line_reports_clean_eof() {
        let mut cursor = Cursor::new(Vec::new());
        let line = read_line(&mut cursor, &TapSink::new()).await.unwrap();
        assert!(line.is_none());
    }

    #[test]
    fn quote_escapes_special_characters() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote("a\"b"), "\"a\\\"b\"");
        assert_eq!(quote("a\\b"), "\"a\\\\b\"");
        assert_eq!(quote("a\rb"), "\"a\\\rb\"");
        assert_eq!(quote("a\nb"), "\"a\\\nb\"");
    }

    #[test]
    fn encode_data_block_stuffs_leading_dots() {
        let body = "Nickname X\n.leading-dot-line\nExitPolicy reject *:*";
        let encoded = encode_data_block(body);
        assert_eq!(
            encoded,
            "Nickname X\r\n..leading-dot-line\r\nExitPolicy reject *:*\r\n.\r\n"
        );
    }

    #[tokio::test]
    async fn decode_data_block_round_trips_through_encode() {
        let bodies = [
            "Nickname X\n.leading-dot-line\nExitPolicy reject *:*",
            "",
            ".",
            "a\nb\nc",
            "line with bare\rcr",
        ];

        for body in bodies {
            let encoded = encode_data_block(body);
            let mut cursor = Cursor::new(encoded.into_bytes());
            let decoded = decode_data_block(&mut cursor, &TapSink::new()).await.unwrap();
            let normalized = body.replace('\r', "");
            assert_eq!(decoded, normalized, "round trip for {body:?}");
        }
    }

    #[tokio::test]
    async fn decode_data_block_fails_on_unterminated_input() {
        let mut cursor = Cursor::new(b"line one\r\nline two\r\n".to_vec());
        let err = decode_data_block(&mut cursor, &TapSink::new()).await.unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }
}
