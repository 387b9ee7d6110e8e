//! Source routing for gateway meshes
//!
//! - `path`: node ids, network paths and destination descriptors
//! - `table`: peer connections, routing table and next-hop resolution

pub mod path;
pub mod table;

pub use path::{NetworkPath, NetworkingNodeId, PathError, ReturnStep, SourceRouting, BROADCAST_MARKER};
pub use table::{resolve_next_hop, Connection, NextHop, RouteLookup, RoutingTable, TransportError};
