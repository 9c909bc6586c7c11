//! Streaming error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed: code={code}, reason={reason}")]
    ConnectionClosed { code: u16, reason: String },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Heartbeat timeout")]
    HeartbeatTimeout,

    #[error("Authentication failed: {0}")]
    Auth(#[from] autosell_core::AuthError),

    #[error("Tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StreamResult<T> = Result<T, StreamError>;
