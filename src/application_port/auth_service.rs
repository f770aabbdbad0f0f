use crate::domain_model::*;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token is not valid")]
    InvalidToken,
    #[error("internal error: {0}")]
    InternalError(#[from] anyhow::Error),
}

/// Maps a bearer token to an identity. Credential issuance and rotation
/// are someone else's problem; the delivery core only verifies.
#[async_trait::async_trait]
pub trait Authenticator: Send + Sync {
    async fn verify_token(&self, token: &str) -> Result<UserId, AuthError>;
}
