//! Credential boundary.
//!
//! Token acquisition and refresh live outside this system; components
//! that talk to the brokerage ask a [`TokenProvider`] for fresh
//! credentials on every request.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
#[error("Authentication failed: {0}")]
pub struct AuthError(pub String);

/// Source of brokerage credentials.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Bearer token for REST requests.
    async fn access_token(&self) -> Result<String, AuthError>;

    /// Approval key for the WebSocket subscription handshake.
    async fn approval_key(&self) -> Result<String, AuthError>;

    /// Discard any cached token so the next call fetches a fresh one.
    /// Called after the brokerage rejects a request as unauthenticated.
    fn invalidate(&self);
}
