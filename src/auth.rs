//! Identity gate: bearer-token verification at connect and on room join.
//!
//! The core never issues tokens; it consumes a verification callback
//! provided by the surrounding auth facade. [`JwtVerifier`] is the default
//! facade implementation (HS256 session tokens); [`StaticVerifier`] backs
//! tests and single-user dev setups.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable identity established by the gate. Opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
}

/// Verification failures.
#[derive(Debug, Clone)]
pub enum AuthError {
    /// Token rejected (bad signature, unknown token).
    Rejected,
    /// Token was valid once but has expired.
    Expired,
    /// Token could not be parsed at all.
    Malformed(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Rejected => write!(f, "token rejected"),
            AuthError::Expired => write!(f, "token expired"),
            AuthError::Malformed(e) => write!(f, "malformed token: {e}"),
        }
    }
}

impl std::error::Error for AuthError {}

/// The verification callback consumed by the session endpoint.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Claims carried by facade-issued HS256 session tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionClaims {
    /// User id.
    sub: String,
    /// Display name.
    name: String,
    /// Expiry (seconds since epoch), validated by the decoder.
    exp: i64,
}

/// HS256 JWT verifier over a shared secret.
pub struct JwtVerifier {
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let data = jsonwebtoken::decode::<SessionClaims>(token, &self.decoding, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidSignature => AuthError::Rejected,
                other => AuthError::Malformed(format!("{other:?}")),
            })?;
        let user_id = Uuid::parse_str(&data.claims.sub)
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        Ok(Identity {
            user_id,
            username: data.claims.name,
        })
    }
}

/// Fixed token → identity map for tests and dev.
#[derive(Default)]
pub struct StaticVerifier {
    tokens: HashMap<String, Identity>,
}

impl StaticVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }
}

#[async_trait]
impl TokenVerifier for StaticVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        self.tokens.get(token).cloned().ok_or(AuthError::Rejected)
    }
}
