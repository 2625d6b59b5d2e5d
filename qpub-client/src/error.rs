use crate::transport::http::RestError;
use qpub_core::protocol::{ErrorInfo, FrameError};
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors surfaced by the QPub client SDK.
#[derive(Debug, Error)]
pub enum Error {
    /// The operation requires an active streaming session.
    #[error("operation requires an active connection")]
    NotConnected,

    /// The operation did not complete within its deadline.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The server rejected the operation with an ERROR frame.
    #[error("server error: {0}")]
    Protocol(ErrorInfo),

    /// A token was malformed or carried no parseable expiry.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// Token acquisition or refresh failed terminally.
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// The operation was aborted by a reset.
    #[error("operation cancelled by reset")]
    Cancelled,

    /// An inbound frame could not be parsed.
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Websocket transport failure.
    #[error(transparent)]
    Ws(#[from] tungstenite::Error),

    /// HTTP request failure.
    #[error(transparent)]
    Rest(#[from] RestError),

    /// Establishing (or re-establishing) the streaming session failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The instance's background task is gone. This is a bug; please report
    /// it.
    #[error("internal channel closed unexpectedly")]
    DeadChannel,

    /// The client was constructed with unusable options.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<ErrorInfo> for Error {
    fn from(info: ErrorInfo) -> Self {
        Error::Protocol(info)
    }
}

impl From<qpub_auth::Error> for Error {
    fn from(err: qpub_auth::Error) -> Self {
        match err {
            qpub_auth::Error::InvalidKey(msg) => Error::Config(msg),
            qpub_auth::Error::InvalidToken(msg) => Error::InvalidToken(msg),
            qpub_auth::Error::Signing(e) => Error::AuthFailure(e.to_string()),
        }
    }
}
