use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Validation, decode, encode, errors::ErrorKind,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid token: {0}")]
    InvalidToken(String),
    #[error("Token expired")]
    TokenExpired,
}

/// The verified identity behind a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub plan: String,
}

/// Collaborator seam for identity verification. The gateway only ever
/// sees this trait; production wires in [`JwtAuthService`].
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default = "default_plan")]
    pub plan: String,
    pub exp: i64,
}

fn default_plan() -> String {
    "free".to_string()
}

/// HS256 bearer tokens carrying the user id and plan tier.
pub struct JwtAuthService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtAuthService {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn issue(&self, user_id: &str, plan: &str, ttl_secs: i64) -> Result<String, AuthError> {
        let claims = Claims {
            sub: user_id.to_string(),
            plan: plan.to_string(),
            exp: chrono::Utc::now().timestamp() + ttl_secs,
        };
        encode(&jsonwebtoken::Header::default(), &claims, &self.encoding)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }
}

impl TokenVerifier for JwtAuthService {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;
        Ok(Identity {
            user_id: data.claims.sub,
            plan: data.claims.plan,
        })
    }
}
