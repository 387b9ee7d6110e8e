//! Calls originated by this node

use futures_util::future::join_all;
use serde_json::Value;
use tracing::{error, info, warn};

use super::{CallOptions, DispatchEvent, Dispatcher, ReplyRoute};
use crate::actions::Action;
use crate::config::NetworkingMode;
use crate::envelope::{Call, CallError, ErrorCode, Frame, MessageId, RoutingHeader};
use crate::error::{Reply, RequestError};
use crate::pending::PendingReply;
use crate::routing::{resolve_next_hop, Connection, NetworkPath, NetworkingNodeId, NextHop, SourceRouting};
use crate::signature::Direction;

/// Description carried by CALLERRORs for undeliverable calls
pub(crate) const NO_ROUTE: &str = "No route to destination";

impl Dispatcher {
    /// Send a CALL and wait for its outcome
    pub async fn call(&self, destination: SourceRouting, action: impl Into<String>, payload: Value) -> Reply {
        self.call_with(destination, action, payload, CallOptions::default()).await
    }

    /// [`call`](Self::call) with per-call overrides
    pub async fn call_with(
        &self,
        destination: SourceRouting,
        action: impl Into<String>,
        payload: Value,
        options: CallOptions,
    ) -> Reply {
        self.start_call(destination, action, payload, options).await?.await
    }

    /// Send a CALL and return the awaitable reply without waiting for it
    ///
    /// Fails only when the message id is already pending; every later failure
    /// (signing, routing, transport) settles the returned reply instead.
    pub async fn start_call(
        &self,
        destination: SourceRouting,
        action: impl Into<String>,
        payload: Value,
        options: CallOptions,
    ) -> Result<PendingReply, RequestError> {
        if destination == SourceRouting::Broadcast {
            return Err(RequestError::Networking {
                description: "Broadcast calls go through Dispatcher::broadcast".to_string(),
            });
        }
        self.originate(destination, action.into(), payload, options, None).await
    }

    /// Typed call for a registered [`Action`]
    pub async fn request<A: Action>(
        &self,
        destination: SourceRouting,
        request: &A::Request,
    ) -> Result<A::Response, RequestError> {
        let payload = serde_json::to_value(request).map_err(|e| RequestError::Format(e.to_string()))?;
        let response = self.call(destination, A::NAME, payload).await?;
        serde_json::from_value(response).map_err(|e| RequestError::Format(e.to_string()))
    }

    /// Send a CALL to every direct neighbor, each under its own message id
    pub async fn broadcast(&self, action: impl Into<String>, payload: Value) -> Vec<(NetworkingNodeId, Reply)> {
        let action = action.into();
        let neighbors = self.shared.routes.neighbors();
        info!("Broadcasting {} to {} neighbor(s)", action, neighbors.len());

        let calls = neighbors.into_iter().map(|connection| {
            let action = action.clone();
            let payload = payload.clone();
            async move {
                let peer = connection.peer().clone();
                let reply = match self
                    .originate(SourceRouting::Broadcast, action, payload, CallOptions::default(), Some(connection))
                    .await
                {
                    Ok(pending) => pending.await,
                    Err(e) => Err(e),
                };
                (peer, reply)
            }
        });
        join_all(calls).await
    }

    async fn originate(
        &self,
        destination: SourceRouting,
        action: String,
        mut payload: Value,
        options: CallOptions,
        via: Option<Connection>,
    ) -> Result<PendingReply, RequestError> {
        let shared = &self.shared;
        let message_id = options.message_id.unwrap_or_else(MessageId::generate);
        let timeout = options.timeout.unwrap_or(shared.config.request_timeout);

        // Created
        let reply = shared
            .pending
            .register(message_id.clone(), action.clone(), Some(destination.clone()), timeout)?;

        // Signed
        if let Err(e) = shared
            .signatures
            .sign_payload(&action, Direction::Outbound, &mut payload, options.signing_keys.as_deref())
            .await
        {
            warn!("Could not sign {} {}: {}", action, message_id, e);
            shared.pending.complete(&message_id, Err(RequestError::Signature(e.to_string())));
            return Ok(reply);
        }

        let call = Call::with_id(message_id.clone(), action, payload);
        let hop = match via {
            Some(connection) => NextHop::Forward {
                connection,
                destination,
            },
            None => resolve_next_hop(&destination, shared.local(), shared.routes.as_ref()),
        };

        // Sent
        match hop {
            NextHop::LocalDelivery => {
                let origin = Some(shared.local().clone());
                self.deliver_local(call, origin, ReplyRoute::Local).await;
            }
            NextHop::Forward {
                connection,
                destination,
            } => self.send_originated(call, connection, destination).await,
            NextHop::Unreachable => self.unroutable_at_origin(&message_id),
        }

        Ok(reply)
    }

    async fn send_originated(&self, call: Call, connection: Connection, destination: SourceRouting) {
        let shared = &self.shared;
        let message_id = call.message_id.clone();
        let action = call.action.clone();

        let call = match shared.config.networking_mode {
            NetworkingMode::Overlay => call.routed(RoutingHeader::new(
                destination,
                NetworkPath::starting_at(shared.local().clone()),
            )),
            NetworkingMode::Standard => {
                // Plain frames cannot be relayed, so only direct peers are reachable
                let direct = match destination.final_destination() {
                    Some(target) => target == connection.peer(),
                    None => true,
                };
                if !direct {
                    warn!(
                        "{} is not a direct peer and standard mode cannot relay; failing {}",
                        destination, message_id
                    );
                    self.unroutable_at_origin(&message_id);
                    return;
                }
                call
            }
        };

        // Recorded before sending; the reply may race the send
        shared.pending.record_egress(&message_id, connection.peer().clone());
        match connection.send(&Frame::Call(call)).await {
            Ok(()) => {
                info!("Sent {} {} via {}", action, message_id, connection.peer());
                shared.emit(DispatchEvent::RequestSent {
                    message_id,
                    action,
                    via: connection.peer().clone(),
                });
            }
            Err(e) => {
                error!("Failed to send {} {}: {}", action, message_id, e);
                shared.pending.complete(
                    &message_id,
                    Err(RequestError::Networking {
                        description: e.to_string(),
                    }),
                );
            }
        }
    }

    /// Settle an originated call with a synthetic NotFound; nothing goes on the wire
    fn unroutable_at_origin(&self, message_id: &MessageId) {
        warn!("No route for {}", message_id);
        let frame = Frame::CallError(CallError::new(message_id.clone(), ErrorCode::NotFound, NO_ROUTE));
        self.shared.emit(DispatchEvent::SyntheticError { frame: frame.clone() });
        self.shared.settle_local(frame);
    }
}
