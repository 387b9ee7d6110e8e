//! Routing dispatcher
//!
//! Composes codec, routing, pending registry, signatures and the action
//! registry. Every inbound frame goes through [`Dispatcher::handle_inbound`];
//! every originated CALL through [`Dispatcher::call`] and friends.
//!
//! An originated CALL moves through
//! `Created -> Signed -> Sent -> AwaitingReply -> {Completed | TimedOut | Cancelled}`.
//! A CALL relayed by this node goes `Sent -> Forwarded` and is not tracked;
//! its reply finds the way back through the network path.

mod events;
mod inbound;
mod outbound;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::actions::{Action, ActionError, ActionRegistry, TypedRequest};
use crate::clock::{Clock, SystemClock};
use crate::config::NodeConfig;
use crate::envelope::{CallError, CallResult, ErrorCode, Frame, MessageId, RoutingHeader};
use crate::pending::PendingRequests;
use crate::routing::{Connection, NetworkingNodeId, RouteLookup, RoutingTable, TransportError};
use crate::signature::{
    Direction, InMemoryKeyStore, KeyProvider, SignaturePolicy, SignaturePolicyEngine, SigningKey,
};

pub use events::{DispatchEvent, InboundOutcome, Observer};

/// Per-call overrides
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Use this id instead of a generated one
    pub message_id: Option<MessageId>,
    /// Override the configured request timeout
    pub timeout: Option<Duration>,
    /// Sign with exactly these keys
    pub signing_keys: Option<Vec<SigningKey>>,
}

impl CallOptions {
    pub fn with_message_id(mut self, id: impl Into<MessageId>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_signing_keys(mut self, keys: Vec<SigningKey>) -> Self {
        self.signing_keys = Some(keys);
        self
    }
}

/// CALL addressed to this node, parsed and signature-checked
#[derive(Debug)]
pub struct IncomingRequest {
    pub message_id: MessageId,
    pub action: String,
    /// Originating node, when known
    pub origin: Option<NetworkingNodeId>,
    pub request: TypedRequest,
    pub responder: Responder,
}

/// Where the answer to a locally delivered CALL goes
#[derive(Debug, Clone)]
pub(crate) enum ReplyRoute {
    /// Back over the arrival link, with a routing header in overlay mode
    Remote {
        connection: Connection,
        routing: Option<RoutingHeader>,
    },
    /// The CALL was originated here; settle the pending request directly
    Local,
}

/// Answers one incoming CALL
///
/// Consumed by the first response, so a CALL is answered at most once.
#[derive(Debug)]
pub struct Responder {
    shared: Arc<Shared>,
    message_id: MessageId,
    action: String,
    route: ReplyRoute,
}

impl Responder {
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    /// Answer with a CALLRESULT, signed per the outbound policy for the action
    pub async fn respond(self, mut payload: Value) -> Result<(), TransportError> {
        let signed = self
            .shared
            .signatures
            .sign_payload(&self.action, Direction::Outbound, &mut payload, None)
            .await;

        let frame = match signed {
            Ok(_) => Frame::CallResult(CallResult::new(self.message_id.clone(), payload)),
            Err(e) => {
                warn!("Could not sign {} response {}: {}", self.action, self.message_id, e);
                Frame::CallError(CallError::new(
                    self.message_id.clone(),
                    ErrorCode::InternalError,
                    format!("Response signing failed: {}", e),
                ))
            }
        };
        self.shared.answer(&self.route, frame).await
    }

    /// Answer with a typed response payload
    pub async fn respond_typed<A: Action>(self, response: &A::Response) -> Result<(), TransportError> {
        match self.shared.actions.serialize_response(response) {
            Ok(payload) => self.respond(payload).await,
            Err(e) => self.respond_action_error(&e).await,
        }
    }

    /// Answer with a CALLERROR, its details signed per the outbound policy for the action
    pub async fn respond_error(
        self,
        code: ErrorCode,
        description: impl Into<String>,
        details: Value,
    ) -> Result<(), TransportError> {
        let error = self
            .shared
            .signed_error(&self.action, self.message_id.clone(), code, description, details)
            .await;
        self.shared.answer(&self.route, Frame::CallError(error)).await
    }

    /// Answer with the wire form of an action error
    pub async fn respond_action_error(self, error: &ActionError) -> Result<(), TransportError> {
        let (code, description, details) = self.shared.actions.serialize_error(error);
        self.respond_error(code, description, details).await
    }
}

pub(crate) struct Shared {
    config: NodeConfig,
    routes: Arc<dyn RouteLookup>,
    pending: PendingRequests,
    signatures: SignaturePolicyEngine,
    actions: ActionRegistry,
    incoming: mpsc::Sender<IncomingRequest>,
    observer: Option<Observer>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("node_id", &self.config.node_id)
            .field("pending", &self.pending)
            .finish()
    }
}

impl Shared {
    fn local(&self) -> &NetworkingNodeId {
        &self.config.node_id
    }

    fn emit(&self, event: DispatchEvent) {
        if let Some(observer) = &self.observer {
            observer(&event);
        }
    }

    /// CALLERROR with `details` signed per the outbound policy for `action`
    ///
    /// A signing failure is logged and the error goes out unsigned.
    async fn signed_error(
        &self,
        action: &str,
        message_id: MessageId,
        code: ErrorCode,
        description: impl Into<String>,
        mut details: Value,
    ) -> CallError {
        if let Err(e) = self
            .signatures
            .sign_payload(action, Direction::Outbound, &mut details, None)
            .await
        {
            warn!("Could not sign {} error {}: {}", action, message_id, e);
        }
        CallError::new(message_id, code, description).with_details(details)
    }

    /// Send an answer frame along `route`
    async fn answer(&self, route: &ReplyRoute, frame: Frame) -> Result<(), TransportError> {
        match route {
            ReplyRoute::Remote { connection, routing } => {
                let frame = frame.with_routing(routing.clone());
                connection.send(&frame).await
            }
            ReplyRoute::Local => {
                self.settle_local(frame);
                Ok(())
            }
        }
    }
}

/// Routing dispatcher handle; cheap to clone
#[derive(Debug, Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub fn builder(config: NodeConfig) -> DispatcherBuilder {
        DispatcherBuilder::new(config)
    }

    pub fn node_id(&self) -> &NetworkingNodeId {
        self.shared.local()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.shared.config
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.shared.pending
    }

    pub fn routes(&self) -> &Arc<dyn RouteLookup> {
        &self.shared.routes
    }

    /// Cancel the local wait for `message_id`; the CALL already sent is not retracted
    pub fn cancel(&self, message_id: &MessageId) -> bool {
        self.shared.pending.cancel(message_id)
    }

    /// Cancel every pending call, e.g. on shutdown
    pub fn shutdown(&self) -> usize {
        let cancelled = self.shared.pending.cancel_all();
        debug!("Dispatcher {} shut down, {} call(s) cancelled", self.node_id(), cancelled);
        cancelled
    }
}

/// Assembles a [`Dispatcher`]
pub struct DispatcherBuilder {
    config: NodeConfig,
    routes: Option<Arc<dyn RouteLookup>>,
    keys: Option<Arc<dyn KeyProvider>>,
    policy: SignaturePolicy,
    clock: Option<Arc<dyn Clock>>,
    actions: ActionRegistry,
    observer: Option<Observer>,
}

impl DispatcherBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            routes: None,
            keys: None,
            policy: SignaturePolicy::default(),
            clock: None,
            actions: ActionRegistry::passthrough(),
            observer: None,
        }
    }

    pub fn routes(mut self, routes: Arc<dyn RouteLookup>) -> Self {
        self.routes = Some(routes);
        self
    }

    pub fn key_provider(mut self, keys: Arc<dyn KeyProvider>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn policy(mut self, policy: SignaturePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Action registry; defaults to one passing every action through untyped
    pub fn actions(mut self, actions: ActionRegistry) -> Self {
        self.actions = actions;
        self
    }

    pub fn observer(mut self, observer: impl Fn(&DispatchEvent) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Build the dispatcher and the channel local requests are delivered on
    pub fn build(self) -> (Dispatcher, mpsc::Receiver<IncomingRequest>) {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let routes = self.routes.unwrap_or_else(|| Arc::new(RoutingTable::new()));
        let keys = self.keys.unwrap_or_else(|| Arc::new(InMemoryKeyStore::new()));

        let (incoming_tx, incoming_rx) = mpsc::channel(self.config.inbound_queue_capacity.max(1));

        let signatures = SignaturePolicyEngine::new(
            self.policy,
            keys,
            clock.clone(),
            self.config.signing_timeout,
        );
        let pending = PendingRequests::new(self.config.registry_shards, clock.clone());

        let shared = Shared {
            config: self.config,
            routes,
            pending,
            signatures,
            actions: self.actions,
            incoming: incoming_tx,
            observer: self.observer,
            clock,
        };

        (
            Dispatcher {
                shared: Arc::new(shared),
            },
            incoming_rx,
        )
    }
}
