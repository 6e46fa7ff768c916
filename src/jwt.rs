//! Session token signing and verification.
//!
//! Session tokens are HS256 JWTs carrying the user's id, username, roles and
//! allowed storage locations. They travel either in the signed session cookie
//! or in an `Authorization: Bearer` header.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::auth::Identity;

/// Default lifetime of a session token: 24 hours.
pub const SESSION_TOKEN_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Length of a secret generated at process start.
const EPHEMERAL_SECRET_LEN: usize = 32;

/// JWT claims for session tokens.
///
/// Identity fields are optional on the wire so that a correctly signed token
/// with an incomplete payload is reported as such instead of as a decode error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Value>,
    /// Storage locations the user may browse
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<String>,
    /// Issued at (Unix timestamp)
    #[serde(default)]
    pub iat: u64,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

impl SessionClaims {
    /// Convert verified claims into an identity, rejecting incomplete payloads.
    fn into_identity(self) -> Option<Identity> {
        let roles = match self.roles? {
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(role) => Some(role),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()?,
            _ => return None,
        };

        Some(Identity {
            id: self.id?,
            username: self.username?,
            roles,
            allowed_locations: self.locations,
        })
    }
}

/// A freshly signed session token.
#[derive(Debug, Clone)]
pub struct SignedToken {
    /// The JWT token string
    pub token: String,
    /// Issued at timestamp (Unix seconds)
    pub issued_at: u64,
    /// Expiration timestamp (Unix seconds)
    pub expires_at: u64,
    /// Token duration in seconds
    pub duration: u64,
}

/// Signs and verifies session tokens with a single HMAC secret.
#[derive(Clone)]
pub struct JwtCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtCodec {
    /// Create a codec with the given secret.
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
        }
    }

    /// Create a codec with a random secret that only lives as long as the process.
    /// Tokens signed by it cannot be verified after a restart.
    pub fn ephemeral() -> Self {
        let secret: [u8; EPHEMERAL_SECRET_LEN] = rand::random();
        Self::new(&secret)
    }

    /// Sign a session token for the identity, valid for `ttl`.
    pub fn sign(&self, identity: &Identity, ttl: Duration) -> Result<SignedToken, SignError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| SignError::TimeError)?
            .as_secs();
        let duration = ttl.as_secs();
        let exp = now + duration;

        let claims = SessionClaims {
            id: Some(identity.id.clone()),
            username: Some(identity.username.clone()),
            roles: Some(Value::from(identity.roles.clone())),
            locations: identity.allowed_locations.clone(),
            iat: now,
            exp,
        };

        let token = jsonwebtoken::encode(&Header::default(), &claims, &self.encoding_key)?;

        Ok(SignedToken {
            token,
            issued_at: now,
            expires_at: exp,
            duration,
        })
    }

    /// Verify a session token and extract the identity it carries.
    ///
    /// Signature and expiry are checked before any claim is looked at.
    pub fn verify(&self, token: &str) -> Result<Identity, VerifyError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        let token_data =
            jsonwebtoken::decode::<SessionClaims>(token, &self.decoding_key, &validation)
                .map_err(VerifyError::from)?;

        token_data
            .claims
            .into_identity()
            .ok_or(VerifyError::InvalidPayload)
    }
}

/// Errors that can occur while signing a token.
#[derive(Debug, Error)]
pub enum SignError {
    #[error("Failed to encode token: {0}")]
    Encoding(#[from] jsonwebtoken::errors::Error),
    #[error("System time error")]
    TimeError,
}

/// Why a token failed verification.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// Signature is valid but `exp` has passed
    #[error("Token expired")]
    Expired,
    /// Not a token this codec issued: bad encoding, bad signature, wrong algorithm
    #[error("Malformed token")]
    Malformed,
    /// Signature and expiry are valid but identity claims are missing
    #[error("Invalid token payload")]
    InvalidPayload,
    /// Anything else; indicates a runtime problem rather than a client error
    #[error("Token verification failed: {0}")]
    Other(String),
}

impl From<jsonwebtoken::errors::Error> for VerifyError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        match e.kind() {
            ErrorKind::ExpiredSignature => VerifyError::Expired,
            ErrorKind::InvalidToken
            | ErrorKind::InvalidSignature
            | ErrorKind::InvalidAlgorithm
            | ErrorKind::InvalidAlgorithmName
            | ErrorKind::MissingAlgorithm
            | ErrorKind::MissingRequiredClaim(_)
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_) => VerifyError::Malformed,
            _ => VerifyError::Other(e.to_string()),
        }
    }
}
