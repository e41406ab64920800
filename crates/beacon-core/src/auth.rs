//! Authentication seam for Beacon.
//!
//! The relay never verifies credentials itself. A [`AuthValidator`]
//! implementation (JWT, opaque token introspection, mTLS identity) is
//! injected by the server; the core only cares that an opaque credential
//! resolves to a user identity or fails.

use crate::registry::UserId;
use async_trait::async_trait;
use thiserror::Error;

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The credential did not resolve to an identity.
    #[error("Invalid credential")]
    InvalidCredential,

    /// The validator could not be reached or failed internally.
    #[error("Validator unavailable: {0}")]
    Unavailable(String),
}

/// Resolves an opaque credential to a user identity.
#[async_trait]
pub trait AuthValidator: Send + Sync {
    /// Validate a credential.
    ///
    /// # Errors
    ///
    /// Returns an error if the credential is invalid or the validator is
    /// unavailable; the session rejects the connection either way.
    async fn validate(&self, credential: &str) -> Result<UserId, AuthError>;
}
