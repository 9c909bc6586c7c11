//! Static token provider.
//!
//! Token issuance and refresh are operated outside this process; this
//! provider hands out credentials supplied at startup. Swap in a real
//! token manager by implementing [`TokenProvider`] elsewhere.

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use autosell_core::{AuthError, TokenProvider};

pub struct StaticTokenProvider {
    access_token: RwLock<String>,
    approval_key: String,
}

impl StaticTokenProvider {
    pub fn new(access_token: impl Into<String>, approval_key: impl Into<String>) -> Self {
        Self {
            access_token: RwLock::new(access_token.into()),
            approval_key: approval_key.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String, AuthError> {
        let token = self.access_token.read().clone();
        if token.is_empty() {
            return Err(AuthError("No access token configured".to_string()));
        }
        Ok(token)
    }

    async fn approval_key(&self) -> Result<String, AuthError> {
        if self.approval_key.is_empty() {
            return Err(AuthError("No approval key configured".to_string()));
        }
        Ok(self.approval_key.clone())
    }

    fn invalidate(&self) {
        // A static token has no refresh source. Keep the token so the
        // next attempt can still go through if the rejection was bogus.
        warn!("Token invalidation requested but no refresh source is configured");
    }
}
