//! Wire codec for OCPP-J frames
//!
//! Payloads, actions and error details pass through untouched; only the
//! array shape, type code and identifiers are checked here. Anything
//! [`to_value`] can produce parses back to an equal [`Frame`].

use serde_json::Value;
use thiserror::Error;

use super::frame::*;
use crate::routing::{NetworkPath, SourceRouting};

/// Reason a frame could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameErrorKind {
    #[error("invalid JSON: {0}")]
    Json(String),

    #[error("frame is not a JSON array")]
    NotAnArray,

    #[error("missing or non-integer message type")]
    MissingMessageType,

    #[error("unknown message type: {0}")]
    UnknownMessageType(i64),

    #[error("message type {code} expects {standard} or {overlay} elements, got {actual}")]
    Arity {
        code: i64,
        standard: usize,
        overlay: usize,
        actual: usize,
    },

    #[error("message id is not a scalar identifier")]
    InvalidMessageId,

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Parse failure plus whatever could be recovered from the broken frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}")]
pub struct FrameError {
    pub kind: FrameErrorKind,
    /// Message id, when one could be read despite the error
    pub message_id: Option<MessageId>,
    /// Type code, when one could be read despite the error
    pub type_code: Option<i64>,
    /// Routing header of an overlay frame broken after its header
    pub routing: Option<RoutingHeader>,
}

impl FrameError {
    fn bare(kind: FrameErrorKind) -> Self {
        Self {
            kind,
            message_id: None,
            type_code: None,
            routing: None,
        }
    }
}

/// Parse an OCPP frame from JSON bytes
pub fn parse(bytes: &[u8]) -> Result<Frame, FrameError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| FrameError::bare(FrameErrorKind::Json(e.to_string())))?;
    parse_value(value)
}

/// Parse an OCPP frame from an already decoded JSON value
pub fn parse_value(value: Value) -> Result<Frame, FrameError> {
    let Value::Array(items) = value else {
        return Err(FrameError::bare(FrameErrorKind::NotAnArray));
    };

    let type_code = items.first().and_then(Value::as_i64);
    let recovered_id = recover_message_id(&items);
    let fail = |kind: FrameErrorKind| FrameError {
        kind,
        message_id: recovered_id.clone(),
        type_code,
        routing: None,
    };

    let code = type_code.ok_or_else(|| fail(FrameErrorKind::MissingMessageType))?;
    let message_type =
        MessageType::from_code(code).ok_or_else(|| fail(FrameErrorKind::UnknownMessageType(code)))?;

    let overlay = if items.len() == message_type.overlay_arity() {
        true
    } else if items.len() == message_type.standard_arity() {
        false
    } else {
        return Err(fail(FrameErrorKind::Arity {
            code,
            standard: message_type.standard_arity(),
            overlay: message_type.overlay_arity(),
            actual: items.len(),
        }));
    };

    // Arity is checked, so every field below is present
    let mut fields = items.into_iter().skip(1);
    let mut next = move || fields.next().unwrap_or(Value::Null);

    let routing = if overlay {
        let destination = SourceRouting::from_wire(&next()).map_err(|e| {
            fail(FrameErrorKind::InvalidField {
                field: "destination",
                reason: e.to_string(),
            })
        })?;
        let network_path = NetworkPath::from_wire(&next()).map_err(|e| {
            fail(FrameErrorKind::InvalidField {
                field: "networkPath",
                reason: e.to_string(),
            })
        })?;
        Some(RoutingHeader::new(destination, network_path))
    } else {
        None
    };

    // Failures past the header keep it, so the error can travel back along the path
    let header = routing.clone();
    let fail = |kind: FrameErrorKind| FrameError {
        routing: header.clone(),
        ..fail(kind)
    };

    let message_id = scalar_id(&next()).ok_or_else(|| fail(FrameErrorKind::InvalidMessageId))?;

    match message_type {
        MessageType::Call => {
            let action = match next() {
                Value::String(action) => action,
                _ => {
                    return Err(fail(FrameErrorKind::InvalidField {
                        field: "action",
                        reason: "expected a string".to_string(),
                    }))
                }
            };
            Ok(Frame::Call(Call {
                message_id,
                action,
                payload: next(),
                routing,
            }))
        }
        MessageType::CallResult => Ok(Frame::CallResult(CallResult {
            message_id,
            payload: next(),
            routing,
        })),
        MessageType::CallError => {
            let Value::String(code) = next() else {
                return Err(fail(FrameErrorKind::InvalidField {
                    field: "errorCode",
                    reason: "expected a string".to_string(),
                }));
            };
            let Value::String(description) = next() else {
                return Err(fail(FrameErrorKind::InvalidField {
                    field: "errorDescription",
                    reason: "expected a string".to_string(),
                }));
            };
            Ok(Frame::CallError(CallError {
                message_id,
                error_code: ErrorCode::from(code.as_str()),
                error_description: description,
                error_details: next(),
                routing,
            }))
        }
    }
}

/// Serialize a frame to its JSON array form
pub fn to_value(frame: &Frame) -> Value {
    let mut items = vec![Value::from(frame.message_type().code())];

    if let Some(routing) = frame.routing() {
        items.push(routing.destination.to_wire());
        items.push(routing.network_path.to_wire());
    }

    items.push(Value::String(frame.message_id().as_str().to_string()));

    match frame {
        Frame::Call(call) => {
            items.push(Value::String(call.action.clone()));
            items.push(call.payload.clone());
        }
        Frame::CallResult(result) => {
            items.push(result.payload.clone());
        }
        Frame::CallError(error) => {
            items.push(Value::String(error.error_code.as_str().to_string()));
            items.push(Value::String(error.error_description.clone()));
            items.push(error.error_details.clone());
        }
    }

    Value::Array(items)
}

impl Frame {
    /// Parse an OCPP frame from JSON bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        parse(bytes)
    }

    /// Serialize to wire text
    pub fn to_text(&self) -> String {
        to_value(self).to_string()
    }

    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_text().into_bytes()
    }
}

/// Message ids are strings on the wire; integers are tolerated
fn scalar_id(value: &Value) -> Option<MessageId> {
    match value {
        Value::String(id) => Some(MessageId::new(id.clone())),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(MessageId::new(n.to_string())),
        _ => None,
    }
}

/// Best-effort message id lookup on a frame that failed to parse
fn recover_message_id(items: &[Value]) -> Option<MessageId> {
    let overlay = items.get(2).map(Value::is_array).unwrap_or(false);
    let index = if overlay { 3 } else { 1 };
    items.get(index).and_then(scalar_id)
}
