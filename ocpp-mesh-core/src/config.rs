//! Configuration for a mesh node
//!
//! Timeouts, queue sizes and the networking mode used for frames this node
//! originates. Signature policy lives in [`crate::signature::SignaturePolicy`]
//! and is loaded separately.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::routing::NetworkingNodeId;

/// How frames originated by this node are framed on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkingMode {
    /// Plain OCPP-J arrays, direct links only
    Standard,
    /// Arrays carry destination and network path so gateways can relay them
    #[default]
    Overlay,
}

/// Errors loading configuration files
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Identity of this node in the mesh
    pub node_id: NetworkingNodeId,

    /// Framing used for originated frames
    pub networking_mode: NetworkingMode,

    /// Default timeout for outbound calls
    pub request_timeout: Duration,

    /// Upper bound on computing one signature
    pub signing_timeout: Duration,

    /// Capacity of the local delivery channel
    pub inbound_queue_capacity: usize,

    /// Capacity of each connection's outbound channel
    pub outbound_queue_capacity: usize,

    /// Number of shards in the pending request registry
    pub registry_shards: usize,

    /// Consecutive malformed frames a connection owner tolerates
    pub max_format_errors: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NetworkingNodeId::new_unchecked("ocpp-node"),
            networking_mode: NetworkingMode::default(),
            request_timeout: Duration::from_secs(30),
            signing_timeout: Duration::from_secs(5),
            inbound_queue_capacity: 64,
            outbound_queue_capacity: 64,
            registry_shards: 16,
            max_format_errors: 3,
        }
    }
}

impl NodeConfig {
    /// Create config for the given node id
    pub fn new(node_id: NetworkingNodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    /// Set networking mode
    pub fn with_networking_mode(mut self, mode: NetworkingMode) -> Self {
        self.networking_mode = mode;
        self
    }

    /// Set request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set signing timeout
    pub fn with_signing_timeout(mut self, timeout: Duration) -> Self {
        self.signing_timeout = timeout;
        self
    }

    /// Set channel capacities
    pub fn with_queue_capacity(mut self, inbound: usize, outbound: usize) -> Self {
        self.inbound_queue_capacity = inbound.max(1);
        self.outbound_queue_capacity = outbound.max(1);
        self
    }

    /// Set registry shard count
    pub fn with_registry_shards(mut self, shards: usize) -> Self {
        self.registry_shards = shards.max(1);
        self
    }

    /// Set tolerated consecutive format errors
    pub fn with_max_format_errors(mut self, count: u32) -> Self {
        self.max_format_errors = count;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = NodeConfig::new("GW01".parse().unwrap())
            .with_networking_mode(NetworkingMode::Standard)
            .with_request_timeout(Duration::from_secs(10))
            .with_queue_capacity(0, 8)
            .with_registry_shards(4);

        assert_eq!(config.node_id.as_str(), "GW01");
        assert_eq!(config.networking_mode, NetworkingMode::Standard);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.signing_timeout, Duration::from_secs(5));
        assert_eq!(config.inbound_queue_capacity, 1);
        assert_eq!(config.outbound_queue_capacity, 8);
        assert_eq!(config.registry_shards, 4);
    }

    #[test]
    fn test_default_is_overlay() {
        let config = NodeConfig::default();
        assert_eq!(config.networking_mode, NetworkingMode::Overlay);
        assert_eq!(config.max_format_errors, 3);
    }
}
