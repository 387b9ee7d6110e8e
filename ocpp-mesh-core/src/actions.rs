//! Action registry
//!
//! Maps action names to parse functions, populated once at startup. The core
//! never looks inside payloads; it only asks the registry whether a payload
//! parses for its action.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::envelope::ErrorCode;

/// A named OCPP action with typed request and response payloads
pub trait Action: 'static {
    const NAME: &'static str;
    type Request: Serialize + DeserializeOwned + Send + 'static;
    type Response: Serialize + DeserializeOwned + Send + 'static;
}

/// Action registry errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("action {0} is not implemented")]
    UnknownAction(String),

    #[error("invalid {action} payload: {reason}")]
    InvalidPayload { action: String, reason: String },

    #[error("failed to serialize payload: {0}")]
    Serialization(String),

    /// A handler declined the request
    #[error("{code}: {description}")]
    Rejected { code: ErrorCode, description: String },
}

type ParseFn = fn(&Value) -> Result<Box<dyn Any + Send>, serde_json::Error>;

fn parse_as<A: Action>(payload: &Value) -> Result<Box<dyn Any + Send>, serde_json::Error> {
    let request: A::Request = A::Request::deserialize(payload)?;
    Ok(Box::new(request))
}

/// Request payload parsed by the registry
pub struct TypedRequest {
    action: String,
    raw: Value,
    parsed: Box<dyn Any + Send>,
}

impl TypedRequest {
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Payload as received
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    /// Whether this request was parsed as `A`
    pub fn is<A: Action>(&self) -> bool {
        self.action == A::NAME && self.parsed.is::<A::Request>()
    }

    pub fn downcast_ref<A: Action>(&self) -> Option<&A::Request> {
        if self.action != A::NAME {
            return None;
        }
        self.parsed.downcast_ref::<A::Request>()
    }

    /// Take the typed request, or get `self` back if it is not an `A`
    pub fn downcast<A: Action>(self) -> Result<A::Request, Self> {
        if !self.is::<A>() {
            return Err(self);
        }
        let Self { action, raw, parsed } = self;
        parsed
            .downcast::<A::Request>()
            .map(|request| *request)
            .map_err(|parsed| Self { action, raw, parsed })
    }
}

impl fmt::Debug for TypedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedRequest")
            .field("action", &self.action)
            .field("raw", &self.raw)
            .finish()
    }
}

/// Action name to parse function table
#[derive(Default, Clone)]
pub struct ActionRegistry {
    parsers: HashMap<&'static str, ParseFn>,
    passthrough: bool,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that also accepts unregistered actions as raw JSON
    pub fn passthrough() -> Self {
        Self {
            parsers: HashMap::new(),
            passthrough: true,
        }
    }

    pub fn register<A: Action>(&mut self) -> &mut Self {
        self.parsers.insert(A::NAME, parse_as::<A>);
        self
    }

    /// Builder form of [`register`](Self::register)
    pub fn with<A: Action>(mut self) -> Self {
        self.register::<A>();
        self
    }

    pub fn contains(&self, action: &str) -> bool {
        self.parsers.contains_key(action)
    }

    /// Registered action names, sorted
    pub fn actions(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.parsers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Parse a request payload for `action`
    pub fn try_parse_request(&self, action: &str, payload: &Value) -> Result<TypedRequest, ActionError> {
        let parsed = match self.parsers.get(action) {
            Some(parse) => parse(payload).map_err(|e| ActionError::InvalidPayload {
                action: action.to_string(),
                reason: e.to_string(),
            })?,
            None if self.passthrough => Box::new(payload.clone()) as Box<dyn Any + Send>,
            None => return Err(ActionError::UnknownAction(action.to_string())),
        };
        Ok(TypedRequest {
            action: action.to_string(),
            raw: payload.clone(),
            parsed,
        })
    }

    /// Serialize a typed response payload
    pub fn serialize_response<T: Serialize>(&self, response: &T) -> Result<Value, ActionError> {
        serde_json::to_value(response).map_err(|e| ActionError::Serialization(e.to_string()))
    }

    /// Wire `(code, description, details)` for an action error
    pub fn serialize_error(&self, error: &ActionError) -> (ErrorCode, String, Value) {
        let details = Value::Object(serde_json::Map::new());
        match error {
            ActionError::UnknownAction(action) => (
                ErrorCode::NotImplemented,
                format!("Action {} not supported", action),
                details,
            ),
            ActionError::InvalidPayload { reason, .. } => (ErrorCode::FormatViolation, reason.clone(), details),
            ActionError::Serialization(reason) => (ErrorCode::InternalError, reason.clone(), details),
            ActionError::Rejected { code, description } => (code.clone(), description.clone(), details),
        }
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.actions())
            .field("passthrough", &self.passthrough)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct ResetRequest {
        #[serde(rename = "type")]
        reset_type: String,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct ResetResponse {
        status: String,
    }

    struct Reset;

    impl Action for Reset {
        const NAME: &'static str = "Reset";
        type Request = ResetRequest;
        type Response = ResetResponse;
    }

    struct Heartbeat;

    impl Action for Heartbeat {
        const NAME: &'static str = "Heartbeat";
        type Request = Value;
        type Response = Value;
    }

    #[test]
    fn test_parse_registered_action() {
        let registry = ActionRegistry::new().with::<Reset>();
        let request = registry
            .try_parse_request("Reset", &json!({"type": "Hard"}))
            .unwrap();

        assert!(request.is::<Reset>());
        assert!(request.downcast_ref::<Heartbeat>().is_none());
        assert_eq!(
            request.downcast::<Reset>().unwrap(),
            ResetRequest {
                reset_type: "Hard".to_string()
            }
        );
    }

    #[test]
    fn test_invalid_payload_is_format_violation() {
        let registry = ActionRegistry::new().with::<Reset>();
        let err = registry
            .try_parse_request("Reset", &json!({"kind": "Hard"}))
            .unwrap_err();

        assert!(matches!(err, ActionError::InvalidPayload { .. }));
        assert_eq!(registry.serialize_error(&err).0, ErrorCode::FormatViolation);
    }

    #[test]
    fn test_unknown_action() {
        let registry = ActionRegistry::new();
        let err = registry.try_parse_request("Reset", &json!({})).unwrap_err();

        let (code, description, _) = registry.serialize_error(&err);
        assert_eq!(code, ErrorCode::NotImplemented);
        assert_eq!(description, "Action Reset not supported");
    }

    #[test]
    fn test_passthrough_keeps_raw_payload() {
        let registry = ActionRegistry::passthrough().with::<Reset>();
        let request = registry
            .try_parse_request("VendorThing", &json!({"x": 1}))
            .unwrap();

        assert_eq!(request.action(), "VendorThing");
        assert_eq!(request.raw(), &json!({"x": 1}));
        assert!(!request.is::<Reset>());

        // Registered actions are still validated
        assert!(registry.try_parse_request("Reset", &json!([])).is_err());
    }

    #[test]
    fn test_serialize_response() {
        let registry = ActionRegistry::new();
        let value = registry
            .serialize_response(&ResetResponse {
                status: "Accepted".to_string(),
            })
            .unwrap();
        assert_eq!(value, json!({"status": "Accepted"}));
    }
}
