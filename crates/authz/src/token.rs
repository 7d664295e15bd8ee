use std::sync::Arc;

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use folio_kernel::settings::AuthSettings;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credentials")]
    Missing,

    #[error("token expired")]
    Expired,

    #[error("invalid token: {0}")]
    Invalid(String),

    #[error("failed to sign token: {0}")]
    Signing(String),
}

/// Token payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub id: String,
    pub username: String,
    pub iat: i64,
    pub exp: i64,
}

struct Keys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

/// Issues and verifies session tokens. Cheap to clone.
#[derive(Clone)]
pub struct TokenService {
    keys: Arc<Keys>,
    ttl_secs: i64,
    cookie_name: Arc<str>,
}

impl TokenService {
    pub fn new(settings: &AuthSettings) -> Self {
        let secret = settings.jwt_secret.as_bytes();
        Self {
            keys: Arc::new(Keys {
                encoding: EncodingKey::from_secret(secret),
                decoding: DecodingKey::from_secret(secret),
            }),
            ttl_secs: i64::try_from(settings.token_ttl_secs).unwrap_or(i64::MAX),
            cookie_name: Arc::from(settings.token_cookie_name.as_str()),
        }
    }

    /// Name of the cookie carrying the token
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Sign a token for `user_id` valid for the configured lifetime.
    pub fn issue(&self, user_id: &str, username: &str) -> Result<String, AuthError> {
        let iat = Utc::now().timestamp();
        self.sign(&Claims {
            id: user_id.to_string(),
            username: username.to_string(),
            iat,
            exp: iat.saturating_add(self.ttl_secs),
        })
    }

    pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.keys.encoding)
            .map_err(|e| AuthError::Signing(e.to_string()))
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let validation = Validation::new(Algorithm::HS256);
        decode::<Claims>(token, &self.keys.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            })
    }
}
