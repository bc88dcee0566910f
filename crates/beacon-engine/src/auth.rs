//! Authentication collaborator boundary.
//!
//! Token acquisition lives in the host application; the engine only needs a
//! short-lived access token for the socket URL and REST calls, plus the
//! local user's identity for unread/dedup bookkeeping.

use async_trait::async_trait;
use beacon_core::{EngineError, ErrorCategory};

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Obtain a short-lived access token.
    async fn access_token(&self) -> Result<String, EngineError>;

    /// The local user's id, when a session is active.
    fn current_user_id(&self) -> Option<String>;
}

/// Provider over pre-issued credentials, for tests and hosts that manage
/// refresh themselves.
#[derive(Debug, Clone)]
pub struct StaticAuthProvider {
    token: String,
    user_id: String,
}

impl StaticAuthProvider {
    pub fn new(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn access_token(&self) -> Result<String, EngineError> {
        if self.token.is_empty() {
            return Err(EngineError::new(
                ErrorCategory::Auth,
                "token_unavailable",
                "no access token configured",
            ));
        }
        Ok(self.token.clone())
    }

    fn current_user_id(&self) -> Option<String> {
        Some(self.user_id.clone())
    }
}
