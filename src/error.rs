use core::fmt;

/// Errors produced by the control-protocol engine.
///
/// This mirrors the five kinds described by the control-spec client
/// model rather than wrapping a single opaque string per variant: callers
/// that need to branch on the failure (retry a server error, give up on a
/// closed transport) can match without parsing `Display` output.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Malformed input that violates the wire grammar: a short line, a
    /// non-digit status code, an unterminated data block, a stray
    /// fragment. Fatal for the reader; the error is latched and every
    /// subsequent command fails immediately with a clone of it.
    Protocol { reason: String },

    /// A well-formed reply whose first line's status class was not
    /// `2xx`. Local to the `exec` call that produced it; the connection
    /// remains usable afterwards.
    Server { status: [u8; 3], message: String },

    /// The underlying stream ended or errored. Fatal for the reader;
    /// latched; every pending waiter is canceled with this error.
    TransportClosed { reason: Option<String> },

    /// A waiter was canceled, either by the caller (e.g. a timeout
    /// dropping the future) or by reader shutdown racing the reply.
    Canceled,

    /// Surfaced by the Controller façade before any bytes are sent:
    /// an unknown event name, an empty port list for `ADD_ONION`, a
    /// malformed private-key spec, or a command attempted outside the
    /// connection states that allow it.
    InvalidArgument { reason: String },
}

impl Error {
    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        Error::Protocol { reason: reason.into() }
    }

    pub(crate) fn transport_closed(reason: impl Into<String>) -> Self {
        Error::TransportClosed {
            reason: Some(reason.into()),
        }
    }

    pub(crate) fn invalid_argument(reason: impl Into<String>) -> Self {
        Error::InvalidArgument { reason: reason.into() }
    }

    /// `true` for the two kinds that latch the engine shut: once observed
    /// from `exec`, no further command on this engine can succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Protocol { .. } | Error::TransportClosed { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Protocol { reason } => write!(f, "protocol error: {reason}"),
            Error::Server { status, message } => {
                let status = std::str::from_utf8(status).unwrap_or("???");
                write!(f, "server error {status}: {message}")
            }
            Error::TransportClosed { reason: Some(reason) } => {
                write!(f, "transport closed: {reason}")
            }
            Error::TransportClosed { reason: None } => write!(f, "transport closed"),
            Error::Canceled => write!(f, "request canceled"),
            Error::InvalidArgument { reason } => write!(f, "invalid argument: {reason}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::transport_closed(err.to_string())
    }
}
