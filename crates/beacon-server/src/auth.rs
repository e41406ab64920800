//! Auth validator implementations.
//!
//! The core treats credentials as opaque; these validators give the server
//! something concrete to resolve them with. Anything cryptographic (JWT
//! verification, token introspection) belongs in its own [`AuthValidator`]
//! implementation behind the same trait.

use crate::config::{AuthConfig, AuthMode};
use async_trait::async_trait;
use beacon_core::{AuthError, AuthValidator, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Resolves credentials through a static token table from configuration.
pub struct TokenTableValidator {
    tokens: HashMap<String, String>,
}

impl TokenTableValidator {
    /// Create a validator over a credential to user-id table.
    #[must_use]
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl AuthValidator for TokenTableValidator {
    async fn validate(&self, credential: &str) -> Result<UserId, AuthError> {
        self.tokens
            .get(credential)
            .cloned()
            .ok_or(AuthError::InvalidCredential)
    }
}

/// Accepts the credential itself as the user id. Development only.
pub struct PermissiveValidator;

#[async_trait]
impl AuthValidator for PermissiveValidator {
    async fn validate(&self, credential: &str) -> Result<UserId, AuthError> {
        if credential.is_empty() {
            return Err(AuthError::InvalidCredential);
        }
        Ok(credential.to_string())
    }
}

/// Build the configured validator.
#[must_use]
pub fn build_validator(config: &AuthConfig) -> Arc<dyn AuthValidator> {
    match config.mode {
        AuthMode::Static => {
            if config.tokens.is_empty() {
                warn!("Auth mode is 'static' but no tokens are configured; all connects will be rejected");
            }
            Arc::new(TokenTableValidator::new(config.tokens.clone()))
        }
        AuthMode::Permissive => {
            info!("Auth mode is 'permissive'; credentials are trusted as user ids");
            Arc::new(PermissiveValidator)
        }
    }
}
