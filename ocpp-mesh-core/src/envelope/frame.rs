//! OCPP-J frame model
//!
//! OCPP uses JSON arrays over WebSocket with a specific message format:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! In overlay networking mode every shape carries `destination, networkPath`
//! right after the type code.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::routing::{NetworkPath, SourceRouting};

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    /// Map a wire type code to a message type
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            2 => Some(MessageType::Call),
            3 => Some(MessageType::CallResult),
            4 => Some(MessageType::CallError),
            _ => None,
        }
    }

    /// Wire type code
    pub fn code(self) -> i64 {
        self as i64
    }

    /// Element count of a plain OCPP-J array
    pub fn standard_arity(self) -> usize {
        match self {
            MessageType::Call => 4,
            MessageType::CallResult => 3,
            MessageType::CallError => 5,
        }
    }

    /// Element count when destination and network path are present
    pub fn overlay_arity(self) -> usize {
        self.standard_arity() + 2
    }
}

/// Identifier correlating a CALL with its reply
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Error code string outside the known set
///
/// Only produced by [`ErrorCode::from`], so a known code never lands here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnknownErrorCode(String);

impl UnknownErrorCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// OCPP error codes
///
/// Codes outside the known set are kept verbatim in [`ErrorCode::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    FormatViolation,
    /// OCPP 1.6 spelling of `FormatViolation`
    FormationViolation,
    GenericError,
    InternalError,
    MessageTypeNotSupported,
    NotImplemented,
    NotSupported,
    OccurrenceConstraintViolation,
    PropertyConstraintViolation,
    ProtocolError,
    RpcFrameworkError,
    SecurityError,
    TypeConstraintViolation,
    /// No route to the destination node
    NotFound,
    Other(UnknownErrorCode),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::FormatViolation => "FormatViolation",
            ErrorCode::FormationViolation => "FormationViolation",
            ErrorCode::GenericError => "GenericError",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::MessageTypeNotSupported => "MessageTypeNotSupported",
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::RpcFrameworkError => "RpcFrameworkError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            ErrorCode::NotFound => "NotFound",
            ErrorCode::Other(code) => code.as_str(),
        }
    }
}

impl From<&str> for ErrorCode {
    fn from(code: &str) -> Self {
        match code {
            "FormatViolation" => ErrorCode::FormatViolation,
            "FormationViolation" => ErrorCode::FormationViolation,
            "GenericError" => ErrorCode::GenericError,
            "InternalError" => ErrorCode::InternalError,
            "MessageTypeNotSupported" => ErrorCode::MessageTypeNotSupported,
            "NotImplemented" => ErrorCode::NotImplemented,
            "NotSupported" => ErrorCode::NotSupported,
            "OccurrenceConstraintViolation" => ErrorCode::OccurrenceConstraintViolation,
            "PropertyConstraintViolation" => ErrorCode::PropertyConstraintViolation,
            "ProtocolError" => ErrorCode::ProtocolError,
            "RpcFrameworkError" => ErrorCode::RpcFrameworkError,
            "SecurityError" => ErrorCode::SecurityError,
            "TypeConstraintViolation" => ErrorCode::TypeConstraintViolation,
            "NotFound" => ErrorCode::NotFound,
            other => ErrorCode::Other(UnknownErrorCode(other.to_string())),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination and hop record carried by overlay frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingHeader {
    pub destination: SourceRouting,
    pub network_path: NetworkPath,
}

impl RoutingHeader {
    pub fn new(destination: SourceRouting, network_path: NetworkPath) -> Self {
        Self {
            destination,
            network_path,
        }
    }
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: MessageId,
    pub action: String,
    pub payload: Value,
    pub routing: Option<RoutingHeader>,
}

impl Call {
    /// Create a new CALL message with auto-generated ID
    pub fn new(action: impl Into<String>, payload: Value) -> Self {
        Self::with_id(MessageId::generate(), action, payload)
    }

    /// Create a CALL with a caller-chosen ID
    pub fn with_id(message_id: MessageId, action: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id,
            action: action.into(),
            payload,
            routing: None,
        }
    }

    /// Attach a routing header
    pub fn routed(mut self, routing: RoutingHeader) -> Self {
        self.routing = Some(routing);
        self
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: MessageId,
    pub payload: Value,
    pub routing: Option<RoutingHeader>,
}

impl CallResult {
    /// Create a new CALLRESULT message
    pub fn new(message_id: MessageId, payload: Value) -> Self {
        Self {
            message_id,
            payload,
            routing: None,
        }
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: MessageId,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
    pub routing: Option<RoutingHeader>,
}

impl CallError {
    /// Create a new CALLERROR message with empty details
    pub fn new(
        message_id: MessageId,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
            routing: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error_details = details;
        self
    }
}

/// Parsed OCPP frame (any type)
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl Frame {
    /// Get the message ID
    pub fn message_id(&self) -> &MessageId {
        match self {
            Frame::Call(c) => &c.message_id,
            Frame::CallResult(r) => &r.message_id,
            Frame::CallError(e) => &e.message_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Call(_) => MessageType::Call,
            Frame::CallResult(_) => MessageType::CallResult,
            Frame::CallError(_) => MessageType::CallError,
        }
    }

    pub fn routing(&self) -> Option<&RoutingHeader> {
        match self {
            Frame::Call(c) => c.routing.as_ref(),
            Frame::CallResult(r) => r.routing.as_ref(),
            Frame::CallError(e) => e.routing.as_ref(),
        }
    }

    /// Replace the routing header
    pub fn with_routing(mut self, routing: Option<RoutingHeader>) -> Self {
        match &mut self {
            Frame::Call(c) => c.routing = routing,
            Frame::CallResult(r) => r.routing = routing,
            Frame::CallError(e) => e.routing = routing,
        }
        self
    }
}
