//! Protocol message definitions
//!
//! Every message in either direction is a JSON envelope
//! `{"event": ..., "data": ...}` with an optional `correlationId` that a
//! request-style caller can use to match the reply.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Event name used for error envelopes sent to the peer
pub const ERROR_EVENT: &str = "error";

/// Maximum event name length
pub const MAX_EVENT_NAME_LENGTH: usize = 256;

// ============================================================================
// Error Types
// ============================================================================

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Envelope
// ============================================================================

/// The JSON envelope carried in every text frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Selects the handler
    pub event: String,
    /// Handler-specific payload
    #[serde(default)]
    pub data: Value,
    /// Echoed back on replies
    #[serde(
        rename = "correlationId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
}

impl Envelope {
    /// Create an envelope without a correlation id
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            correlation_id: None,
        }
    }

    /// Attach a correlation id
    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Build the error envelope sent before closing a rejected connection
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        let body = ErrorBody {
            error: code,
            message: message.into(),
        };
        Self::new(
            ERROR_EVENT,
            serde_json::to_value(body).unwrap_or(Value::Null),
        )
    }

    /// Parse and validate an envelope from JSON
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let envelope: Self = serde_json::from_str(json)?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Validate the envelope fields
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.event.is_empty() {
            return Err(ProtocolError::InvalidMessage(
                "event cannot be empty".to_string(),
            ));
        }
        if self.event.len() > MAX_EVENT_NAME_LENGTH {
            return Err(ProtocolError::InvalidMessage(format!(
                "event exceeds maximum length of {} characters",
                MAX_EVENT_NAME_LENGTH
            )));
        }
        Ok(())
    }

    /// Serialize the envelope to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Error Envelope Body
// ============================================================================

/// Admission error codes surfaced to the peer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    /// No bearer credential was supplied
    #[serde(rename = "ERR_MISSING_TOKEN")]
    MissingToken,
    /// The credential failed verification
    #[serde(rename = "ERR_VALID_TOKEN")]
    InvalidToken,
    /// No identity header was supplied
    #[serde(rename = "ERR_MISSING_PLAYER_ID")]
    MissingPlayerId,
    /// The identity already has a live connection
    #[serde(rename = "ERR_ALREADY_CONNECTED")]
    AlreadyConnected,
}

impl ErrorCode {
    /// Wire representation of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MissingToken => "ERR_MISSING_TOKEN",
            ErrorCode::InvalidToken => "ERR_VALID_TOKEN",
            ErrorCode::MissingPlayerId => "ERR_MISSING_PLAYER_ID",
            ErrorCode::AlreadyConnected => "ERR_ALREADY_CONNECTED",
        }
    }

    /// Human readable message sent alongside the code
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::MissingToken => "Authorization token is required",
            ErrorCode::InvalidToken => "Authorization token is invalid",
            ErrorCode::MissingPlayerId => "Player ID is required",
            ErrorCode::AlreadyConnected => "Player is already connected",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `data` of an error envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub error: ErrorCode,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // -------------------------------------------------------------------------
    // Envelope Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_envelope_serialization() {
        let envelope = Envelope::new("greet", json!({"message": "Hello, Ava!"}));
        assert_eq!(
            envelope.to_json().unwrap(),
            r#"{"event":"greet","data":{"message":"Hello, Ava!"}}"#
        );
    }

    #[test]
    fn test_envelope_correlation_id() {
        let envelope =
            Envelope::new("trade", json!(1)).with_correlation_id(Some("req-9".to_string()));
        let json = envelope.to_json().unwrap();
        assert!(json.contains(r#""correlationId":"req-9""#));

        let parsed = Envelope::from_json(&json).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_envelope_data_defaults_to_null() {
        let parsed = Envelope::from_json(r#"{"event":"ping"}"#).unwrap();
        assert_eq!(parsed.event, "ping");
        assert_eq!(parsed.data, Value::Null);
        assert!(parsed.correlation_id.is_none());
    }

    #[test]
    fn test_envelope_rejects_bad_json() {
        assert!(matches!(
            Envelope::from_json("not json"),
            Err(ProtocolError::SerializationError(_))
        ));
        assert!(Envelope::from_json(r#"{"data":{}}"#).is_err());
        assert!(Envelope::from_json(r#"{"event":42}"#).is_err());
    }

    #[test]
    fn test_envelope_rejects_empty_event() {
        let result = Envelope::from_json(r#"{"event":"","data":null}"#);
        assert!(result.unwrap_err().to_string().contains("cannot be empty"));
    }

    #[test]
    fn test_envelope_rejects_long_event() {
        let json = format!(r#"{{"event":"{}"}}"#, "x".repeat(MAX_EVENT_NAME_LENGTH + 1));
        assert!(Envelope::from_json(&json).is_err());
    }

    // -------------------------------------------------------------------------
    // Error Envelope Tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_error_envelope_shape() {
        let envelope = Envelope::error(ErrorCode::AlreadyConnected, "Player is already connected");
        let value: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "error",
                "data": {
                    "error": "ERR_ALREADY_CONNECTED",
                    "message": "Player is already connected"
                }
            })
        );
    }

    #[test]
    fn test_error_codes_match_wire_names() {
        for code in [
            ErrorCode::MissingToken,
            ErrorCode::InvalidToken,
            ErrorCode::MissingPlayerId,
            ErrorCode::AlreadyConnected,
        ] {
            let serialized = serde_json::to_value(code).unwrap();
            assert_eq!(serialized, Value::String(code.as_str().to_string()));
            assert_eq!(code.to_string(), code.as_str());
        }
    }
}
