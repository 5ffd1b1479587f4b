//! Authentication gate
//!
//! Runs once per upgraded connection before it is registered. Checks, in
//! order: a valid bearer token, an identity header, and that the identity is
//! not already connected.

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::protocol::{Envelope, ErrorCode};
use super::registry::SessionRegistry;
use crate::config::AuthConfig;
use crate::ws::handshake::UpgradeRequest;

/// Claims carried by a client token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// Must match the configured subject
    pub sub: String,
    /// Expiry (seconds since the epoch), honoured when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
}

/// Why a connection attempt was turned away
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct AuthRejection {
    pub code: ErrorCode,
    pub message: String,
}

impl AuthRejection {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            message: code.default_message().to_string(),
        }
    }

    /// The error envelope sent to the peer before closing
    pub fn envelope(&self) -> Envelope {
        Envelope::error(self.code, self.message.clone())
    }
}

/// Verifies bearer tokens and identity headers
pub struct AuthGate {
    decoding_key: DecodingKey,
    validation: Validation,
    token_header: String,
    identity_header: String,
}

impl AuthGate {
    /// Gate accepting HS256 tokens signed with `secret` for `subject`
    pub fn new(secret: &str, subject: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["sub"]);
        validation.sub = Some(subject.to_string());

        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            token_header: "Authorization".to_string(),
            identity_header: "Player-ID".to_string(),
        }
    }

    /// Build the gate from the `[auth]` config section
    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(&config.secret, &config.subject)
            .with_headers(&config.token_header, &config.identity_header)
    }

    /// Override which headers carry the token and the identity
    pub fn with_headers(mut self, token_header: &str, identity_header: &str) -> Self {
        self.token_header = token_header.to_string();
        self.identity_header = identity_header.to_string();
        self
    }

    /// Verify a raw token (without the `Bearer` prefix)
    pub fn verify_token(&self, token: &str) -> Result<Claims, AuthRejection> {
        jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!("Token rejected: {}", e);
                AuthRejection::new(ErrorCode::InvalidToken)
            })
    }

    /// Decide whether the upgrade request may join, returning its identity
    pub async fn admit(
        &self,
        request: &UpgradeRequest,
        registry: &SessionRegistry,
    ) -> Result<String, AuthRejection> {
        let token = request
            .header(&self.token_header)
            .map(strip_bearer)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| AuthRejection::new(ErrorCode::MissingToken))?;
        self.verify_token(token)?;

        let identity = request
            .header(&self.identity_header)
            .map(str::trim)
            .filter(|identity| !identity.is_empty())
            .ok_or_else(|| AuthRejection::new(ErrorCode::MissingPlayerId))?;

        if registry.contains(identity).await {
            return Err(AuthRejection::new(ErrorCode::AlreadyConnected));
        }

        Ok(identity.to_string())
    }
}

/// Drop an optional case-insensitive `Bearer ` scheme prefix
fn strip_bearer(value: &str) -> &str {
    let value = value.trim();
    if value.eq_ignore_ascii_case("bearer") {
        return "";
    }
    match value.get(..7) {
        Some(scheme) if scheme.eq_ignore_ascii_case("bearer ") => value[7..].trim(),
        _ => value,
    }
}
