//! # OCPP Mesh Core
//!
//! Transport and routing layer for OCPP-style RPC over persistent WebSocket
//! links between charging stations, gateways ("networking nodes") and a CSMS.
//!
//! ## Architecture
//!
//! ```text
//!   peer link (WebSocket text frames)
//!         │                     ▲
//!         ▼                     │ ordered mpsc per connection
//! ┌──────────────────────────────────────────────┐
//! │                 Dispatcher                   │
//! │  ┌──────────┐  ┌─────────────┐  ┌──────────┐ │
//! │  │ Envelope │  │  Routing    │  │ Pending  │ │
//! │  │ codec    │  │ path/table  │  │ requests │ │
//! │  └──────────┘  └─────────────┘  └──────────┘ │
//! │  ┌──────────────────┐  ┌──────────────────┐  │
//! │  │ Signature policy │  │ Action registry  │  │
//! │  └──────────────────┘  └──────────────────┘  │
//! └──────────────────────┬───────────────────────┘
//!                        │ IncomingRequest (mpsc)
//!                        ▼
//!                  local handlers
//! ```
//!
//! ## Frame flow
//!
//! | Inbound frame | Destination resolves to | Result |
//! |---------------|-------------------------|--------|
//! | CALL | this node | verify signatures, parse, deliver locally |
//! | CALL | a neighbor / route | append local id to path, relay |
//! | CALL | nothing | synthetic `NotFound` CALLERROR back along the path |
//! | CALLRESULT / CALLERROR | path tail is this node | pop, relay to previous hop |
//! | CALLRESULT / CALLERROR | path empty after pop | complete the pending request |
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use ocpp_mesh_core::{Dispatcher, NetworkingNodeId, NodeConfig, RoutingTable, SourceRouting};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let local: NetworkingNodeId = "GW01".parse()?;
//!     let routes = Arc::new(RoutingTable::new());
//!
//!     let (dispatcher, _incoming) = Dispatcher::builder(NodeConfig::new(local))
//!         .routes(routes.clone())
//!         .build();
//!
//!     let reply = dispatcher
//!         .call(SourceRouting::to("CS001".parse()?), "Reset", serde_json::json!({"type": "Hard"}))
//!         .await;
//!     println!("{:?}", reply);
//!     Ok(())
//! }
//! ```

pub mod actions;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod pending;
pub mod routing;
pub mod signature;

pub use actions::{Action, ActionError, ActionRegistry, TypedRequest};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, NetworkingMode, NodeConfig};
pub use dispatcher::{
    CallOptions, DispatchEvent, Dispatcher, DispatcherBuilder, InboundOutcome, IncomingRequest,
    Observer, Responder,
};
pub use envelope::{
    Call, CallError, CallResult, ErrorCode, Frame, FrameError, MessageId, RoutingHeader, UnknownErrorCode,
};
pub use error::{Reply, RequestError};
pub use pending::{PendingInfo, PendingReply, PendingRequests, RegistryError};
pub use routing::{
    Connection, NetworkPath, NetworkingNodeId, NextHop, PathError, RouteLookup, RoutingTable,
    SourceRouting, TransportError,
};
pub use signature::{
    Direction, InMemoryKeyStore, KeyId, KeyProvider, Requirement, Signature, SignatureError,
    SignaturePolicy, SignaturePolicyEngine, SignaturePolicyEntry, SigningContext, SigningKey,
    Verdict, VerificationOutcome,
};
