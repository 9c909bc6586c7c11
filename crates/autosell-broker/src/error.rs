//! Broker error taxonomy.
//!
//! Callers branch on these variants: transient errors are retried,
//! rate limits trigger a cooldown, rejections are terminal.

use autosell_core::AuthError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Transient broker error: {0}")]
    Transient(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Broker throttled the request: {code}")]
    RateLimited { code: String },

    #[error("Broker rejected the request: {code} {message}")]
    Rejected { code: String, message: String },

    #[error("Unexpected HTTP status: {0}")]
    Http(u16),

    #[error("Malformed broker response: {0}")]
    Parse(String),
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            Self::Transient(e.to_string())
        } else if e.is_decode() {
            Self::Parse(e.to_string())
        } else if let Some(status) = e.status() {
            Self::Http(status.as_u16())
        } else {
            Self::Transient(e.to_string())
        }
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
