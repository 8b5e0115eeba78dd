//! Error types for pos-client.

use reqwest::StatusCode;

/// Transport-side failures. None of these are surfaced to the user: the
/// connection task logs them and retries, and the rest of the client keeps
/// working over REST.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("handshake rejected: {0}")]
    Rejected(String),

    #[error("connection closed during handshake")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// REST collaborator failures, returned to the calling UI action.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("session expired, log in again")]
    SessionExpired,

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("invalid url: {0}")]
    Url(String),
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Status { status, .. } if *status == StatusCode::UNAUTHORIZED)
    }
}
