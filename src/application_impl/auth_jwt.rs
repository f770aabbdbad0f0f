use crate::application_port::*;
use crate::domain_model::*;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[allow(dead_code)]
    exp: usize,
}

/// HS256 bearer-token verification; `sub` is the user id. Issuance lives
/// with the identity provider, not here.
pub struct JwtHs256Verifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtHs256Verifier {
    pub fn new(signing_key: &[u8]) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(signing_key),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

#[async_trait::async_trait]
impl Authenticator for JwtHs256Verifier {
    async fn verify_token(&self, token: &str) -> Result<UserId, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|_| AuthError::InvalidToken)?;
        data.claims
            .sub
            .parse::<UserId>()
            .map_err(|_| AuthError::InvalidToken)
    }
}
