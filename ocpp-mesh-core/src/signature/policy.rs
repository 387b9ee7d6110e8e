//! Signature policy table
//!
//! Loaded from JSON, e.g.
//!
//! ```json
//! {
//!   "maxClockSkewSecs": 300,
//!   "entries": [
//!     { "action": "Reset", "direction": "inbound", "requirement": "required", "keyIds": ["csms-root"] },
//!     { "action": "*", "direction": "outbound", "requirement": "optional" }
//!   ]
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::keys::KeyId;
use crate::config::ConfigError;

/// Action pattern matching every action
pub const ANY_ACTION: &str = "*";

/// Whether a message is being received or sent by this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Requirement {
    Required,
    Optional,
}

/// One `(action, direction)` rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignaturePolicyEntry {
    /// Exact action name or `"*"`
    pub action: String,
    pub direction: Direction,
    pub requirement: Requirement,
    /// Outbound: keys to sign with. Inbound: authorized signers (empty means any known key)
    #[serde(default)]
    pub key_ids: Vec<KeyId>,
}

impl SignaturePolicyEntry {
    pub fn required(action: impl Into<String>, direction: Direction) -> Self {
        Self {
            action: action.into(),
            direction,
            requirement: Requirement::Required,
            key_ids: Vec::new(),
        }
    }

    pub fn optional(action: impl Into<String>, direction: Direction) -> Self {
        Self {
            action: action.into(),
            direction,
            requirement: Requirement::Optional,
            key_ids: Vec::new(),
        }
    }

    pub fn with_keys<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<KeyId>,
    {
        self.key_ids = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_wildcard(&self) -> bool {
        self.action == ANY_ACTION
    }

    pub fn is_required(&self) -> bool {
        self.requirement == Requirement::Required
    }
}

/// Set of signature rules
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignaturePolicy {
    #[serde(default)]
    pub entries: Vec<SignaturePolicyEntry>,
    /// Reject signature timestamps further than this from local time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_clock_skew_secs: Option<u64>,
}

impl SignaturePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, entry: SignaturePolicyEntry) -> Self {
        self.entries.push(entry);
        self
    }

    pub fn with_max_clock_skew(mut self, skew: Duration) -> Self {
        self.max_clock_skew_secs = Some(skew.as_secs());
        self
    }

    pub fn max_clock_skew(&self) -> Option<Duration> {
        self.max_clock_skew_secs.map(Duration::from_secs)
    }

    /// Most specific entry for `(action, direction)`; an exact action beats `"*"`
    pub fn lookup(&self, action: &str, direction: Direction) -> Option<&SignaturePolicyEntry> {
        let mut wildcard = None;
        for entry in self.entries.iter().filter(|e| e.direction == direction) {
            if entry.action == action {
                return Some(entry);
            }
            if entry.is_wildcard() && wildcard.is_none() {
                wildcard = Some(entry);
            }
        }
        wildcard
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_exact_beats_wildcard() {
        let policy = SignaturePolicy::new()
            .with_entry(SignaturePolicyEntry::optional("*", Direction::Inbound))
            .with_entry(SignaturePolicyEntry::required("Reset", Direction::Inbound));

        assert!(policy.lookup("Reset", Direction::Inbound).unwrap().is_required());
        assert!(!policy.lookup("Heartbeat", Direction::Inbound).unwrap().is_required());
        assert!(policy.lookup("Reset", Direction::Outbound).is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "maxClockSkewSecs": 120,
                "entries": [
                    {{"action": "Reset", "direction": "inbound", "requirement": "required", "keyIds": ["csms-root"]}},
                    {{"action": "*", "direction": "outbound", "requirement": "optional"}}
                ]
            }}"#
        )
        .unwrap();

        let policy = SignaturePolicy::from_file(file.path()).unwrap();
        assert_eq!(policy.max_clock_skew(), Some(Duration::from_secs(120)));

        let reset = policy.lookup("Reset", Direction::Inbound).unwrap();
        assert_eq!(reset.key_ids, vec![KeyId::from("csms-root")]);
        assert!(policy.lookup("Anything", Direction::Outbound).unwrap().key_ids.is_empty());
    }

    #[test]
    fn test_missing_file() {
        let err = SignaturePolicy::from_file("/nonexistent/policy.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_invalid_json() {
        let err = SignaturePolicy::from_json(r#"{"entries": [{"action": "Reset"}]}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Json(_)));
    }
}
