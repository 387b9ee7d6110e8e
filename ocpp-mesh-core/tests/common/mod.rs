//! In-memory mesh harness: dispatchers linked by channels instead of sockets

#![allow(dead_code)]

use std::sync::Arc;

use ocpp_mesh_core::{
    Connection, DispatchEvent, Dispatcher, DispatcherBuilder, IncomingRequest, NetworkingMode,
    NetworkingNodeId, NodeConfig, RoutingTable,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

pub fn id(s: &str) -> NetworkingNodeId {
    s.parse().unwrap()
}

pub struct TestNode {
    pub id: NetworkingNodeId,
    pub dispatcher: Dispatcher,
    pub routes: Arc<RoutingTable>,
    pub incoming: mpsc::Receiver<IncomingRequest>,
    pub events: Arc<Mutex<Vec<DispatchEvent>>>,
}

impl TestNode {
    pub fn new(name: &str, mode: NetworkingMode) -> Self {
        Self::with(name, mode, |builder| builder)
    }

    /// Build a node, letting the caller adjust the dispatcher builder
    pub fn with(
        name: &str,
        mode: NetworkingMode,
        configure: impl FnOnce(DispatcherBuilder) -> DispatcherBuilder,
    ) -> Self {
        Self::from_config(NodeConfig::new(id(name)).with_networking_mode(mode), configure)
    }

    pub fn from_config(
        config: NodeConfig,
        configure: impl FnOnce(DispatcherBuilder) -> DispatcherBuilder,
    ) -> Self {
        let node_id = config.node_id.clone();
        let routes = Arc::new(RoutingTable::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();

        let builder = Dispatcher::builder(config)
            .routes(routes.clone())
            .observer(move |event| sink.lock().push(event.clone()));
        let (dispatcher, incoming) = configure(builder).build();

        Self {
            id: node_id,
            dispatcher,
            routes,
            incoming,
            events,
        }
    }

    pub fn events(&self) -> Vec<DispatchEvent> {
        self.events.lock().clone()
    }

    /// Answer every incoming request with `payload`
    pub fn serve(&mut self, payload: Value) -> tokio::task::JoinHandle<()> {
        let (_tx, placeholder) = mpsc::channel(1);
        let mut incoming = std::mem::replace(&mut self.incoming, placeholder);
        tokio::spawn(async move {
            while let Some(request) = incoming.recv().await {
                let _ = request.responder.respond(payload.clone()).await;
            }
        })
    }
}

/// Connect two nodes with a pair of pumped channels
///
/// Returns `(a's handle to b, b's handle to a)`.
pub fn link(a: &TestNode, b: &TestNode) -> (Connection, Connection) {
    let (a_to_b, rx_ab) = Connection::channel(b.id.clone(), 64);
    let (b_to_a, rx_ba) = Connection::channel(a.id.clone(), 64);

    a.routes.add_connection(a_to_b.clone());
    b.routes.add_connection(b_to_a.clone());

    pump(rx_ab, b.dispatcher.clone(), b_to_a.clone());
    pump(rx_ba, a.dispatcher.clone(), a_to_b.clone());

    (a_to_b, b_to_a)
}

/// Feed everything written on a channel into `dispatcher` as arriving on `arrival`
pub fn pump(mut rx: mpsc::Receiver<String>, dispatcher: Dispatcher, arrival: Connection) {
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            dispatcher.handle_inbound(&arrival, text.as_bytes()).await;
        }
    });
}
