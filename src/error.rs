use serde::Serialize;
use thiserror::Error;

/// Typed failures produced by the CDP transport and operation layers.
///
/// These are kinds, not exception types: the core never retries, and every
/// caller is expected to match on the kind to decide recovery (see
/// `exit_code` for how the CLI layer turns a kind into a process exit code).
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The transport is gone; no retry is possible at this layer.
    #[error("connection closed")]
    ConnectionClosed,

    /// The browser rejected a call.
    #[error("protocol error {code}: {message}")]
    Protocol { code: i64, message: String },

    /// The caller's cancellation signal fired before the operation finished.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation's deadline elapsed.
    #[error("operation timed out")]
    Timeout,

    /// A lookup (selector, target, frame, request id) produced no match.
    #[error("not found: {0}")]
    NotFound(String),

    /// A caller-supplied value was malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested capability is not available in the current context.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    #[must_use]
    pub fn invalid_argument(what: impl Into<String>) -> Self {
        Self::InvalidArgument(what.into())
    }

    #[must_use]
    pub fn unsupported(what: impl Into<String>) -> Self {
        Self::Unsupported(what.into())
    }

    /// Maps a typed failure to the process exit code the CLI layer uses:
    /// `1` for usage/not-found/invalid-input, `2` for connection failures,
    /// `3` for timeouts.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NotFound(_) | Error::InvalidArgument(_) | Error::Unsupported(_) => 1,
            Error::ConnectionClosed | Error::Protocol { .. } | Error::Cancelled => 2,
            Error::Timeout => 3,
        }
    }
}

/// Infrastructure errors that can occur before a typed `Error` makes sense,
/// e.g. while discovering the browser or parsing its handshake response.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("url error: {0}")]
    Url(#[from] url::ParseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("browser did not advertise a WebSocket debugger URL")]
    NoWebSocketUrl,
}

/// Serializable projection of `Error`, used when the CLI layer needs to
/// emit structured failures (`{"kind": "...", "message": "..."}`) instead
/// of a plain string.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub kind: &'static str,
    pub message: String,
}

impl From<&Error> for ErrorPayload {
    fn from(e: &Error) -> Self {
        let kind = match e {
            Error::ConnectionClosed => "connection_closed",
            Error::Protocol { .. } => "protocol_error",
            Error::Cancelled => "cancelled",
            Error::Timeout => "timeout",
            Error::NotFound(_) => "not_found",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::Unsupported(_) => "unsupported",
        };
        Self {
            kind,
            message: e.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
