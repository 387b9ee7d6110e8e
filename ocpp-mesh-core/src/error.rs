//! Caller-visible outcome of an outbound call

use serde_json::Value;
use thiserror::Error;

use crate::envelope::{CallError, ErrorCode, MessageId};

/// Outcome of an outbound call
pub type Reply = Result<Value, RequestError>;

/// Why an outbound call did not produce a payload
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    /// Destination unreachable or the route broke on the way
    #[error("networking error: {description}")]
    Networking { description: String },

    #[error("timeout waiting for response")]
    Timeout,

    #[error("signature error: {0}")]
    Signature(String),

    #[error("format error: {0}")]
    Format(String),

    #[error("remote error {code}: {description}")]
    Generic {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error("request cancelled")]
    Cancelled,

    #[error("message id {0} is already pending")]
    DuplicateId(MessageId),
}

impl RequestError {
    /// Map a CALLERROR received from the mesh onto the caller taxonomy
    pub fn from_call_error(error: &CallError) -> Self {
        match &error.error_code {
            ErrorCode::NotFound => RequestError::Networking {
                description: error.error_description.clone(),
            },
            ErrorCode::SecurityError => RequestError::Signature(error.error_description.clone()),
            ErrorCode::FormatViolation | ErrorCode::FormationViolation => {
                RequestError::Format(error.error_description.clone())
            }
            code => RequestError::Generic {
                code: code.clone(),
                description: error.error_description.clone(),
                details: error.error_details.clone(),
            },
        }
    }

    /// Wire representation `(code, description, details)` of this error
    pub fn to_wire_parts(&self) -> (ErrorCode, String, Value) {
        let empty = || Value::Object(serde_json::Map::new());
        match self {
            RequestError::Networking { description } => {
                (ErrorCode::NotFound, description.clone(), empty())
            }
            RequestError::Timeout => (
                ErrorCode::GenericError,
                "Timeout waiting for response".to_string(),
                empty(),
            ),
            RequestError::Signature(reason) => (ErrorCode::SecurityError, reason.clone(), empty()),
            RequestError::Format(reason) => (ErrorCode::FormatViolation, reason.clone(), empty()),
            RequestError::Generic {
                code,
                description,
                details,
            } => (code.clone(), description.clone(), details.clone()),
            RequestError::Cancelled => (
                ErrorCode::GenericError,
                "Request cancelled".to_string(),
                empty(),
            ),
            RequestError::DuplicateId(id) => (
                ErrorCode::RpcFrameworkError,
                format!("Duplicate message id {}", id),
                empty(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_not_found_maps_to_networking() {
        let error = CallError::new(MessageId::new("1"), ErrorCode::NotFound, "No route to destination");
        assert_eq!(
            RequestError::from_call_error(&error),
            RequestError::Networking {
                description: "No route to destination".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_code_maps_to_generic() {
        let error = CallError::new(MessageId::new("7"), ErrorCode::from("VendorBusy"), "busy")
            .with_details(json!({"retryAfter": 5}));

        match RequestError::from_call_error(&error) {
            RequestError::Generic { code, details, .. } => {
                assert_eq!(code.as_str(), "VendorBusy");
                assert_eq!(details["retryAfter"], 5);
            }
            other => panic!("Expected Generic, got {:?}", other),
        }
    }

    #[test]
    fn test_wire_parts_round_trip_through_call_error() {
        let original = RequestError::Signature("unauthorized signer".to_string());
        let (code, description, details) = original.to_wire_parts();
        let error = CallError::new(MessageId::new("2"), code, description).with_details(details);
        assert_eq!(RequestError::from_call_error(&error), original);
    }
}
