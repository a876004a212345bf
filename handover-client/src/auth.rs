//! Bearer token supply for the Auth handshake.
//!
//! The engine never mints credentials; the application supplies them
//! through an [`AuthProvider`]. `refresh_token()` is called when the
//! server rejects the current token during a reconnect, so providers
//! backed by an identity service can rotate without tearing the
//! engine down.

use async_trait::async_trait;
use thiserror::Error;

/// Errors from token acquisition.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No token is available.
    #[error("no auth token available")]
    NoToken,
    /// The provider could not refresh the token.
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
}

/// Supplies bearer tokens for the session handshake.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// The current bearer token.
    async fn token(&self) -> Result<String, AuthError>;

    /// Obtain a fresh token after the server rejected the current one.
    async fn refresh_token(&self) -> Result<String, AuthError>;
}

/// A fixed token, for tests and short-lived sessions.
pub struct StaticAuth {
    token: String,
}

impl StaticAuth {
    /// Wrap a fixed bearer token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticAuth")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn token(&self) -> Result<String, AuthError> {
        Ok(self.token.clone())
    }

    async fn refresh_token(&self) -> Result<String, AuthError> {
        // A static token has nothing to rotate to.
        Ok(self.token.clone())
    }
}
