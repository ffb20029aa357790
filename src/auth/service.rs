use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::{
    token::TokenConfig,
    types::{Principal, Role},
};
use crate::{shared::AppError, user::repository::UserRepository};

/// Turns an opaque credential into an authenticated identity
#[async_trait]
pub trait CredentialService: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Result<Principal, AppError>;
}

/// Verifies HS256 JWTs and checks the account still exists
pub struct JwtCredentialService {
    token_config: TokenConfig,
    users: Arc<dyn UserRepository>,
}

impl JwtCredentialService {
    pub fn new(token_config: TokenConfig, users: Arc<dyn UserRepository>) -> Self {
        Self {
            token_config,
            users,
        }
    }

    pub fn issue(&self, principal: &Principal) -> Result<String, AppError> {
        self.token_config
            .create_token(principal.user_id, principal.role, &principal.username)
    }
}

#[async_trait]
impl CredentialService for JwtCredentialService {
    #[instrument(skip(self, credential))]
    async fn authenticate(&self, credential: &str) -> Result<Principal, AppError> {
        let token = credential.trim();
        let token = token.strip_prefix("Bearer ").unwrap_or(token).trim();
        if token.is_empty() {
            return Err(AppError::Unauthorized("Missing credential".to_string()));
        }

        let claims = self.token_config.validate_token(token).map_err(|e| {
            warn!("Credential rejected: {}", e);
            AppError::Unauthorized("Invalid token".to_string())
        })?;

        let user = self.users.get_user(claims.id).await?.ok_or_else(|| {
            warn!(user_id = %claims.id, "Credential refers to an unknown account");
            AppError::Unauthorized("Unknown account".to_string())
        })?;

        if user.role != claims.role {
            warn!(user_id = %claims.id, "Credential role does not match account");
            return Err(AppError::Unauthorized("Invalid token".to_string()));
        }

        info!(user_id = %user.id, username = %user.username, "Credential accepted");

        Ok(Principal {
            user_id: user.id,
            role: user.role,
            username: user.username,
        })
    }
}

/// Fails unless the principal is a teacher
pub fn require_teacher(principal: &Principal) -> Result<(), AppError> {
    match principal.role {
        Role::Teacher => Ok(()),
        Role::Student => Err(AppError::Forbidden("Teachers only".to_string())),
    }
}

/// Fails unless the principal is a student
pub fn require_student(principal: &Principal) -> Result<(), AppError> {
    match principal.role {
        Role::Student => Ok(()),
        Role::Teacher => Err(AppError::Forbidden("Students only".to_string())),
    }
}
