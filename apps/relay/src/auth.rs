use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use signal_proto::ParticipantRole;
use thiserror::Error;

/// Identity extracted from a verified token.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub role: ParticipantRole,
    pub display_name: Option<String>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication token required")]
    MissingToken,
    #[error("token validation failed: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("token missing user identifier")]
    MissingSubject,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    role: ParticipantRole,
    #[serde(default)]
    name: Option<String>,
    #[allow(dead_code)]
    exp: u64,
}

/// Stateless HS256 token verifier. Every inbound connection passes
/// through [`TokenVerifier::verify`] before any state mutation.
#[derive(Clone)]
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &[u8], issuer: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }
        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::MissingToken);
        }
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)?;
        let claims = data.claims;
        if claims.sub.trim().is_empty() {
            return Err(AuthError::MissingSubject);
        }
        Ok(AuthenticatedUser {
            user_id: claims.sub,
            role: claims.role,
            display_name: claims.name,
        })
    }
}
