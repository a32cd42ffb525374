//! Untyped signaling frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Action name used for protocol-level errors that are not tied to a request.
pub const ERROR_ACTION: &str = "error";

/// One signaling frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub action: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Envelope {
    #[must_use]
    pub fn new(action: impl Into<String>, data: Value) -> Self {
        Self {
            action: action.into(),
            data,
            request_id: None,
            error: None,
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: Option<u64>) -> Self {
        self.request_id = request_id;
        self
    }

    /// Error reply delivered on the response action of a failed request.
    #[must_use]
    pub fn error_response(
        action: impl Into<String>,
        request_id: Option<u64>,
        error: ErrorBody,
    ) -> Self {
        Self {
            action: action.into(),
            data: Value::Null,
            request_id,
            error: Some(error),
        }
    }

    /// Error not attributable to a known response action.
    #[must_use]
    pub fn protocol_error(request_id: Option<u64>, error: ErrorBody) -> Self {
        Self::error_response(ERROR_ACTION, request_id, error)
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Structured error carried in an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorBody {
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Error codes surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    NotFound,
    Conflict,
    Incompatible,
    /// A consumer for the producer already exists or is being created.
    /// Clients treat this as a no-op.
    AlreadyConsuming,
    Forbidden,
    InternalError,
    #[serde(other)]
    Unknown,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_minimal_envelope_omits_optional_fields() {
        let env = Envelope::new("transportConnected", Value::Null);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json, json!({"action": "transportConnected"}));
    }

    #[test]
    fn test_error_response_shape() {
        let env = Envelope::error_response(
            "consumeResponse",
            Some(4),
            ErrorBody::new(ErrorCode::AlreadyConsuming, "Already consuming producer"),
        );
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(
            json,
            json!({
                "action": "consumeResponse",
                "requestId": 4,
                "error": {"code": "ALREADY_CONSUMING", "message": "Already consuming producer"}
            })
        );
        assert!(env.is_error());
    }

    #[test]
    fn test_unknown_error_code_is_tolerated() {
        let body: ErrorBody =
            serde_json::from_value(json!({"code": "RATE_LIMITED", "message": "slow down"}))
                .unwrap();
        assert_eq!(body.code, ErrorCode::Unknown);
    }

    #[test]
    fn test_missing_data_defaults_to_null() {
        let env: Envelope = serde_json::from_str(r#"{"action":"deviceReady"}"#).unwrap();
        assert_eq!(env.data, Value::Null);
        assert_eq!(env.request_id, None);
    }
}
