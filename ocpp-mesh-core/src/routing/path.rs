//! Addressing model for the mesh
//!
//! A [`NetworkPath`] records the hops a CALL has crossed, origin first. Replies
//! use it as a return stack: each hop pops itself off the tail and hands the
//! frame to the new tail, so a reply always retraces the CALL's route.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Destination marker addressing every direct neighbor
pub const BROADCAST_MARKER: &str = "*";

/// Errors in the addressing model
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("networking node id must not be empty")]
    EmptyNodeId,

    #[error("networking node id must not be the broadcast marker")]
    ReservedNodeId,

    #[error("routing loop: {0} is already on the network path")]
    Loop(NetworkingNodeId),

    #[error("invalid network path: {0}")]
    InvalidPath(String),

    #[error("invalid destination: {0}")]
    InvalidDestination(String),
}

/// Identity of an addressable mesh participant
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NetworkingNodeId(String);

impl NetworkingNodeId {
    pub fn new(id: impl Into<String>) -> Result<Self, PathError> {
        let id = id.into();
        if id.is_empty() {
            return Err(PathError::EmptyNodeId);
        }
        if id == BROADCAST_MARKER {
            return Err(PathError::ReservedNodeId);
        }
        Ok(Self(id))
    }

    /// Construct from a literal known to be valid
    pub(crate) fn new_unchecked(id: &str) -> Self {
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NetworkingNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NetworkingNodeId {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for NetworkingNodeId {
    type Error = PathError;

    fn try_from(id: String) -> Result<Self, Self::Error> {
        Self::new(id)
    }
}

impl From<NetworkingNodeId> for String {
    fn from(id: NetworkingNodeId) -> Self {
        id.0
    }
}

fn node_id_from_wire(value: &Value) -> Result<NetworkingNodeId, PathError> {
    value
        .as_str()
        .ok_or_else(|| PathError::InvalidPath(format!("expected a node id string, got {}", value)))
        .and_then(NetworkingNodeId::new)
}

/// Ordered record of the hops a message has crossed
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkPath(Vec<NetworkingNodeId>);

/// Next step for a reply walking a path backward
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnStep {
    /// This node originated the CALL
    Deliver,
    /// Hand the reply to `next` carrying the shortened `path`
    Relay {
        next: NetworkingNodeId,
        path: NetworkPath,
    },
    /// The path tail is not this node
    Misrouted,
}

impl NetworkPath {
    /// Empty path, as used on direct links
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Path for a CALL leaving its origin
    pub fn starting_at(origin: NetworkingNodeId) -> Self {
        Self(vec![origin])
    }

    /// Build a path, rejecting repeated hops
    pub fn from_hops(hops: Vec<NetworkingNodeId>) -> Result<Self, PathError> {
        let mut path = Self::empty();
        for hop in hops {
            path = path.append(&hop)?;
        }
        Ok(path)
    }

    pub fn hops(&self) -> &[NetworkingNodeId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Node that originated the message
    pub fn origin(&self) -> Option<&NetworkingNodeId> {
        self.0.first()
    }

    /// Most recent hop
    pub fn last_hop(&self) -> Option<&NetworkingNodeId> {
        self.0.last()
    }

    pub fn contains(&self, node: &NetworkingNodeId) -> bool {
        self.0.contains(node)
    }

    /// New path with `hop` appended; a hop already on the path is a loop
    pub fn append(&self, hop: &NetworkingNodeId) -> Result<NetworkPath, PathError> {
        if self.contains(hop) {
            return Err(PathError::Loop(hop.clone()));
        }
        let mut hops = self.0.clone();
        hops.push(hop.clone());
        Ok(NetworkPath(hops))
    }

    /// Step a reply back toward the origin from `local`
    pub fn retreat(&self, local: &NetworkingNodeId) -> ReturnStep {
        match self.0.split_last() {
            Some((tail, rest)) if tail == local => match rest.last() {
                None => ReturnStep::Deliver,
                Some(next) => ReturnStep::Relay {
                    next: next.clone(),
                    path: NetworkPath(rest.to_vec()),
                },
            },
            _ => ReturnStep::Misrouted,
        }
    }

    pub fn to_wire(&self) -> Value {
        Value::Array(
            self.0
                .iter()
                .map(|hop| Value::String(hop.as_str().to_string()))
                .collect(),
        )
    }

    pub fn from_wire(value: &Value) -> Result<Self, PathError> {
        let Value::Array(items) = value else {
            return Err(PathError::InvalidPath("expected an array".to_string()));
        };
        let hops = items
            .iter()
            .map(node_id_from_wire)
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_hops(hops)
    }
}

impl fmt::Display for NetworkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hops: Vec<&str> = self.0.iter().map(|h| h.as_str()).collect();
        write!(f, "[{}]", hops.join(" -> "))
    }
}

/// Destination descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRouting {
    /// A single target resolved hop by hop against routing tables
    Node(NetworkingNodeId),
    /// Explicit list of remaining hops, final destination last; an empty
    /// list addresses whichever node holds the frame
    Forced(Vec<NetworkingNodeId>),
    /// Every direct neighbor of the sender
    Broadcast,
}

impl SourceRouting {
    pub fn to(node: NetworkingNodeId) -> Self {
        SourceRouting::Node(node)
    }

    /// Final destination, if the descriptor names one
    pub fn final_destination(&self) -> Option<&NetworkingNodeId> {
        match self {
            SourceRouting::Node(node) => Some(node),
            SourceRouting::Forced(hops) => hops.last(),
            SourceRouting::Broadcast => None,
        }
    }

    pub fn to_wire(&self) -> Value {
        match self {
            SourceRouting::Node(node) => Value::String(node.as_str().to_string()),
            SourceRouting::Forced(hops) => Value::Array(
                hops.iter()
                    .map(|hop| Value::String(hop.as_str().to_string()))
                    .collect(),
            ),
            SourceRouting::Broadcast => Value::String(BROADCAST_MARKER.to_string()),
        }
    }

    pub fn from_wire(value: &Value) -> Result<Self, PathError> {
        match value {
            Value::String(s) if s == BROADCAST_MARKER => Ok(SourceRouting::Broadcast),
            Value::String(s) => NetworkingNodeId::new(s.clone())
                .map(SourceRouting::Node)
                .map_err(|e| PathError::InvalidDestination(e.to_string())),
            // An empty hop list means the sender itself is the destination
            Value::Array(items) => items
                .iter()
                .map(node_id_from_wire)
                .collect::<Result<Vec<_>, _>>()
                .map(SourceRouting::Forced)
                .map_err(|e| PathError::InvalidDestination(e.to_string())),
            other => Err(PathError::InvalidDestination(format!(
                "expected a node id, hop list or \"{}\", got {}",
                BROADCAST_MARKER, other
            ))),
        }
    }
}

impl fmt::Display for SourceRouting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceRouting::Node(node) => write!(f, "{}", node),
            SourceRouting::Forced(hops) => {
                let hops: Vec<&str> = hops.iter().map(|h| h.as_str()).collect();
                write!(f, "forced[{}]", hops.join(" -> "))
            }
            SourceRouting::Broadcast => f.write_str(BROADCAST_MARKER),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(s: &str) -> NetworkingNodeId {
        s.parse().unwrap()
    }

    #[test]
    fn test_node_id_validation() {
        assert_eq!(NetworkingNodeId::new(""), Err(PathError::EmptyNodeId));
        assert_eq!(NetworkingNodeId::new("*"), Err(PathError::ReservedNodeId));
        assert_eq!(id("CS001").as_str(), "CS001");
    }

    #[test]
    fn test_append_is_immutable() {
        let path = NetworkPath::starting_at(id("CSMS"));
        let extended = path.append(&id("GW01")).unwrap();

        assert_eq!(path.len(), 1);
        assert_eq!(extended.hops(), &[id("CSMS"), id("GW01")]);
        assert_eq!(extended.origin(), Some(&id("CSMS")));
        assert_eq!(extended.last_hop(), Some(&id("GW01")));
    }

    #[test]
    fn test_append_rejects_loop() {
        let path = NetworkPath::from_hops(vec![id("CSMS"), id("GW01")]).unwrap();
        assert_eq!(path.append(&id("GW01")), Err(PathError::Loop(id("GW01"))));
        assert_eq!(path.append(&id("CSMS")), Err(PathError::Loop(id("CSMS"))));
    }

    #[test]
    fn test_retreat_walks_backward() {
        let path = NetworkPath::from_hops(vec![id("A"), id("B")]).unwrap();

        let step = path.retreat(&id("B"));
        assert_eq!(
            step,
            ReturnStep::Relay {
                next: id("A"),
                path: NetworkPath::starting_at(id("A")),
            }
        );

        assert_eq!(NetworkPath::starting_at(id("A")).retreat(&id("A")), ReturnStep::Deliver);
        assert_eq!(path.retreat(&id("A")), ReturnStep::Misrouted);
        assert_eq!(NetworkPath::empty().retreat(&id("A")), ReturnStep::Misrouted);
    }

    #[test]
    fn test_source_routing_wire_forms() {
        assert_eq!(
            SourceRouting::from_wire(&json!("CS001")).unwrap(),
            SourceRouting::Node(id("CS001"))
        );
        assert_eq!(
            SourceRouting::from_wire(&json!(["GW01", "CS001"])).unwrap(),
            SourceRouting::Forced(vec![id("GW01"), id("CS001")])
        );
        assert_eq!(SourceRouting::from_wire(&json!("*")).unwrap(), SourceRouting::Broadcast);
        assert_eq!(SourceRouting::from_wire(&json!([])).unwrap(), SourceRouting::Forced(vec![]));
        assert!(SourceRouting::from_wire(&json!(12)).is_err());
        assert_eq!(SourceRouting::Broadcast.to_wire(), json!("*"));
    }

    #[test]
    fn test_path_from_wire_rejects_duplicates() {
        assert!(NetworkPath::from_wire(&json!(["A", "B", "A"])).is_err());
        assert!(NetworkPath::from_wire(&json!(["A", 3])).is_err());
        assert_eq!(NetworkPath::from_wire(&json!([])).unwrap(), NetworkPath::empty());
    }

    #[test]
    fn test_node_id_serde() {
        let parsed: NetworkingNodeId = serde_json::from_value(json!("GW01")).unwrap();
        assert_eq!(parsed, id("GW01"));
        assert!(serde_json::from_value::<NetworkingNodeId>(json!("*")).is_err());
    }
}
