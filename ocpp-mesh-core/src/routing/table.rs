//! Connections, routing table and next-hop resolution

use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::path::{NetworkingNodeId, SourceRouting};
use crate::envelope::Frame;

/// Errors sending on a connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection to {0} is closed")]
    Closed(NetworkingNodeId),
}

/// Handle to one peer link
///
/// All frames for the peer go through one bounded channel, drained by a
/// single writer, so wire bytes are never interleaved. Sending waits for
/// channel capacity.
#[derive(Debug, Clone)]
pub struct Connection {
    peer: NetworkingNodeId,
    outbound: mpsc::Sender<String>,
}

impl Connection {
    pub fn new(peer: NetworkingNodeId, outbound: mpsc::Sender<String>) -> Self {
        Self { peer, outbound }
    }

    /// Create a connection and the receiver its writer task drains
    pub fn channel(peer: NetworkingNodeId, capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(peer, tx), rx)
    }

    /// Peer at the other end
    pub fn peer(&self) -> &NetworkingNodeId {
        &self.peer
    }

    /// Queue a frame for the writer
    pub async fn send(&self, frame: &Frame) -> Result<(), TransportError> {
        let text = frame.to_text();
        debug!("Sending to {}: {}", self.peer, text);
        self.outbound
            .send(text)
            .await
            .map_err(|_| TransportError::Closed(self.peer.clone()))
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Whether both handles feed the same writer
    pub fn same_link(&self, other: &Connection) -> bool {
        self.outbound.same_channel(&other.outbound)
    }
}

/// Routing table capability
pub trait RouteLookup: Send + Sync {
    /// Connection to use for reaching `destination`
    fn next_hop_for(&self, destination: &NetworkingNodeId) -> Option<Connection>;

    /// All direct neighbors
    fn neighbors(&self) -> Vec<Connection>;

    /// Direct link to `peer`, ignoring static routes
    fn connection_to(&self, peer: &NetworkingNodeId) -> Option<Connection> {
        self.neighbors().into_iter().find(|c| c.peer() == peer)
    }
}

/// Direct connections plus static `destination -> via` routes
#[derive(Debug, Default)]
pub struct RoutingTable {
    connections: RwLock<HashMap<NetworkingNodeId, Connection>>,
    routes: RwLock<HashMap<NetworkingNodeId, NetworkingNodeId>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a direct connection, replacing any previous one to the same peer
    pub fn add_connection(&self, connection: Connection) -> Option<Connection> {
        info!("Link up: {}", connection.peer());
        self.connections
            .write()
            .insert(connection.peer().clone(), connection)
    }

    /// Remove the connection to `peer` if it is still `connection`
    ///
    /// A newer link to the same peer is left in place.
    pub fn remove_connection(&self, connection: &Connection) -> bool {
        let mut connections = self.connections.write();
        match connections.get(connection.peer()) {
            Some(current) if current.same_link(connection) => {
                connections.remove(connection.peer());
                info!("Link down: {}", connection.peer());
                true
            }
            _ => false,
        }
    }

    /// Reach `destination` through the neighbor `via`
    pub fn add_route(&self, destination: NetworkingNodeId, via: NetworkingNodeId) {
        debug!("Route {} via {}", destination, via);
        self.routes.write().insert(destination, via);
    }

    pub fn remove_route(&self, destination: &NetworkingNodeId) -> Option<NetworkingNodeId> {
        self.routes.write().remove(destination)
    }

    /// Ids of directly connected peers, sorted
    pub fn connected_peers(&self) -> Vec<NetworkingNodeId> {
        let mut peers: Vec<_> = self.connections.read().keys().cloned().collect();
        peers.sort();
        peers
    }
}

impl RouteLookup for RoutingTable {
    fn next_hop_for(&self, destination: &NetworkingNodeId) -> Option<Connection> {
        let connections = self.connections.read();
        if let Some(direct) = connections.get(destination) {
            return Some(direct.clone());
        }

        let via = self.routes.read().get(destination).cloned()?;
        connections.get(&via).cloned()
    }

    fn neighbors(&self) -> Vec<Connection> {
        let mut neighbors: Vec<_> = self.connections.read().values().cloned().collect();
        neighbors.sort_by(|a, b| a.peer().cmp(b.peer()));
        neighbors
    }

    fn connection_to(&self, peer: &NetworkingNodeId) -> Option<Connection> {
        self.connections.read().get(peer).cloned()
    }
}

/// Where a CALL goes next
#[derive(Debug, Clone)]
pub enum NextHop {
    LocalDelivery,
    /// Relay over `connection`, carrying `destination` onward
    Forward {
        connection: Connection,
        destination: SourceRouting,
    },
    Unreachable,
}

/// Resolve a destination descriptor at `local`
pub fn resolve_next_hop(
    destination: &SourceRouting,
    local: &NetworkingNodeId,
    routes: &dyn RouteLookup,
) -> NextHop {
    match destination {
        SourceRouting::Broadcast => NextHop::LocalDelivery,

        SourceRouting::Node(target) if target == local => NextHop::LocalDelivery,

        SourceRouting::Node(target) => match routes.next_hop_for(target) {
            Some(connection) => NextHop::Forward {
                connection,
                destination: destination.clone(),
            },
            None => NextHop::Unreachable,
        },

        SourceRouting::Forced(hops) => {
            let remaining = match hops.split_first() {
                Some((head, rest)) if head == local => rest,
                _ => hops.as_slice(),
            };
            let Some(next) = remaining.first() else {
                return NextHop::LocalDelivery;
            };
            // Forced hops name direct links only
            match routes.connection_to(next) {
                Some(connection) => NextHop::Forward {
                    connection,
                    destination: SourceRouting::Forced(remaining.to_vec()),
                },
                None => NextHop::Unreachable,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Call, MessageId};
    use serde_json::json;

    fn id(s: &str) -> NetworkingNodeId {
        s.parse().unwrap()
    }

    fn peer(name: &str) -> (Connection, mpsc::Receiver<String>) {
        Connection::channel(id(name), 8)
    }

    #[test]
    fn test_local_destination() {
        let table = RoutingTable::new();
        let local = id("GW01");

        assert!(matches!(
            resolve_next_hop(&SourceRouting::to(local.clone()), &local, &table),
            NextHop::LocalDelivery
        ));
        assert!(matches!(
            resolve_next_hop(&SourceRouting::Broadcast, &local, &table),
            NextHop::LocalDelivery
        ));
    }

    #[test]
    fn test_direct_beats_route() {
        let table = RoutingTable::new();
        let (gw, _gw_rx) = peer("GW02");
        let (cs, _cs_rx) = peer("CS001");
        table.add_connection(gw);
        table.add_connection(cs);
        table.add_route(id("CS001"), id("GW02"));

        let hop = table.next_hop_for(&id("CS001")).unwrap();
        assert_eq!(hop.peer(), &id("CS001"));

        // Static routes never answer a direct-link lookup
        table.add_route(id("CS002"), id("GW02"));
        assert!(table.connection_to(&id("CS002")).is_none());
        assert!(table.next_hop_for(&id("CS002")).is_some());
    }

    #[test]
    fn test_static_route() {
        let table = RoutingTable::new();
        let (gw, _rx) = peer("GW02");
        table.add_connection(gw);
        table.add_route(id("CS009"), id("GW02"));

        match resolve_next_hop(&SourceRouting::to(id("CS009")), &id("GW01"), &table) {
            NextHop::Forward { connection, destination } => {
                assert_eq!(connection.peer(), &id("GW02"));
                assert_eq!(destination, SourceRouting::to(id("CS009")));
            }
            other => panic!("Expected Forward, got {:?}", other),
        }

        // Route points at a neighbor we are not connected to
        table.add_route(id("CS010"), id("GW03"));
        assert!(matches!(
            resolve_next_hop(&SourceRouting::to(id("CS010")), &id("GW01"), &table),
            NextHop::Unreachable
        ));
    }

    #[test]
    fn test_forced_hops_strip_local_head() {
        let table = RoutingTable::new();
        let (gw, _rx) = peer("GW02");
        table.add_connection(gw);

        let forced = SourceRouting::Forced(vec![id("GW01"), id("GW02"), id("CS001")]);
        match resolve_next_hop(&forced, &id("GW01"), &table) {
            NextHop::Forward { connection, destination } => {
                assert_eq!(connection.peer(), &id("GW02"));
                assert_eq!(destination, SourceRouting::Forced(vec![id("GW02"), id("CS001")]));
            }
            other => panic!("Expected Forward, got {:?}", other),
        }

        let last = SourceRouting::Forced(vec![id("CS001")]);
        assert!(matches!(
            resolve_next_hop(&last, &id("CS001"), &table),
            NextHop::LocalDelivery
        ));
    }

    #[test]
    fn test_unknown_destination_unreachable() {
        let table = RoutingTable::new();
        assert!(matches!(
            resolve_next_hop(&SourceRouting::to(id("nowhere")), &id("GW01"), &table),
            NextHop::Unreachable
        ));
    }

    #[test]
    fn test_remove_connection_keeps_newer_link() {
        let table = RoutingTable::new();
        let (old, _old_rx) = peer("CS001");
        let (new, _new_rx) = peer("CS001");

        table.add_connection(old.clone());
        table.add_connection(new.clone());

        assert!(!table.remove_connection(&old));
        assert_eq!(table.connected_peers(), vec![id("CS001")]);
        assert!(table.remove_connection(&new));
        assert!(table.connected_peers().is_empty());
    }

    #[tokio::test]
    async fn test_connection_send_preserves_order() {
        let (conn, mut rx) = peer("CS001");

        for n in 0..3 {
            let call = Call::with_id(MessageId::new(n.to_string()), "Heartbeat", json!({}));
            conn.send(&Frame::Call(call)).await.unwrap();
        }

        assert_eq!(rx.recv().await.unwrap(), r#"[2,"0","Heartbeat",{}]"#);
        assert_eq!(rx.recv().await.unwrap(), r#"[2,"1","Heartbeat",{}]"#);
        assert_eq!(rx.recv().await.unwrap(), r#"[2,"2","Heartbeat",{}]"#);

        drop(rx);
        let call = Frame::Call(Call::new("Heartbeat", json!({})));
        assert_eq!(conn.send(&call).await, Err(TransportError::Closed(id("CS001"))));
    }
}
