//! Connection gate: bearer token verification before a session is joined.
//!
//! Tokens are HS256-signed JWTs issued elsewhere in the product; this module
//! only verifies them. Claims carry the user id (`sub`), an expiry (`exp`)
//! and an optional display name.
//!
//! ## Development mode
//!
//! When `dev_mode` is on, a connection whose token is missing or fails
//! verification (or any connection while no secret is configured) is admitted
//! as an anonymous identity. Dev mode is never inferred from a missing secret:
//! without it, a missing secret rejects every connection.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::AuthError;

/// Claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    /// Expiry (seconds since the Unix epoch)
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Who is behind an admitted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub user_id: String,
    pub display_name: Option<String>,
    /// Admitted without a verified token (development mode only)
    pub anonymous: bool,
}

impl ClientIdentity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
            anonymous: false,
        }
    }

    /// Fresh identity for an unauthenticated development connection.
    pub fn anonymous() -> Self {
        Self {
            user_id: format!("anonymous-{}", Uuid::new_v4()),
            display_name: None,
            anonymous: true,
        }
    }
}

impl From<Claims> for ClientIdentity {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.sub,
            display_name: claims.name,
            anonymous: false,
        }
    }
}

/// Verifies bearer tokens for inbound connections.
#[derive(Clone)]
pub struct ConnectionGate {
    key: Option<DecodingKey>,
    validation: Validation,
    dev_mode: bool,
}

impl ConnectionGate {
    /// Create a gate. `secret` is the shared HS256 signing secret.
    pub fn new(secret: Option<&str>, dev_mode: bool) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            key: secret.map(|s| DecodingKey::from_secret(s.as_bytes())),
            validation,
            dev_mode,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.jwt_secret.as_deref(), config.dev_mode)
    }

    pub fn dev_mode(&self) -> bool {
        self.dev_mode
    }

    pub fn has_secret(&self) -> bool {
        self.key.is_some()
    }

    /// Verify `token` and return the identity it names.
    ///
    /// Falls back to an anonymous identity only in development mode.
    pub fn authenticate(&self, token: Option<&str>) -> Result<ClientIdentity, AuthError> {
        match self.verify(token) {
            Ok(identity) => Ok(identity),
            Err(e) if self.dev_mode => {
                log::warn!("Admitting unauthenticated connection (development mode): {e}");
                Ok(ClientIdentity::anonymous())
            }
            Err(e) => Err(e),
        }
    }

    fn verify(&self, token: Option<&str>) -> Result<ClientIdentity, AuthError> {
        let key = self.key.as_ref().ok_or(AuthError::NoSecret)?;
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;
        let data = decode::<Claims>(token, key, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        Ok(data.claims.into())
    }
}
