//! Frames arriving from peers

use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::outbound::NO_ROUTE;
use super::{DispatchEvent, Dispatcher, InboundOutcome, IncomingRequest, ReplyRoute, Responder, Shared};
use crate::config::NetworkingMode;
use crate::envelope::{
    Call, CallError, ErrorCode, Frame, FrameError, FrameErrorKind, MessageId, MessageType, RoutingHeader,
};
use crate::error::{Reply, RequestError};
use crate::pending::PendingInfo;
use crate::routing::{resolve_next_hop, Connection, NetworkPath, NetworkingNodeId, NextHop, ReturnStep, SourceRouting};
use crate::signature::Verdict;

impl Dispatcher {
    /// Process one frame received on `from`
    ///
    /// Frames from one connection must be handed over in arrival order.
    pub async fn handle_inbound(&self, from: &Connection, bytes: &[u8]) -> InboundOutcome {
        debug!("Received from {}: {}", from.peer(), String::from_utf8_lossy(bytes));

        match Frame::parse(bytes) {
            Ok(Frame::Call(call)) => self.handle_call(from, call).await,
            Ok(reply) => self.handle_reply(from, reply).await,
            Err(error) => self.handle_malformed(from, error).await,
        }
    }

    async fn handle_call(&self, from: &Connection, call: Call) -> InboundOutcome {
        let Some(routing) = call.routing.clone() else {
            // Plain frames only travel direct links
            let back = ReplyRoute::Remote {
                connection: from.clone(),
                routing: None,
            };
            return self.deliver_local(call, Some(from.peer().clone()), back).await;
        };

        let reply_routing = return_header(&routing, from);
        let origin = reply_routing.network_path.origin().cloned();
        let path = reply_routing.network_path.clone();
        let back = ReplyRoute::Remote {
            connection: from.clone(),
            routing: Some(reply_routing),
        };

        let shared = &self.shared;
        match resolve_next_hop(&routing.destination, shared.local(), shared.routes.as_ref()) {
            NextHop::LocalDelivery => self.deliver_local(call, origin, back).await,
            NextHop::Forward {
                connection,
                destination,
            } => self.forward(from, call, path, connection, destination, back).await,
            NextHop::Unreachable => {
                warn!("No route to {} for {} {}", routing.destination, call.action, call.message_id);
                self.reject(&call.message_id, &call.action, back, NO_ROUTE).await
            }
        }
    }

    async fn forward(
        &self,
        from: &Connection,
        call: Call,
        path: NetworkPath,
        connection: Connection,
        destination: SourceRouting,
        back: ReplyRoute,
    ) -> InboundOutcome {
        let shared = &self.shared;
        if shared.config.networking_mode == NetworkingMode::Standard {
            warn!("Standard-mode node asked to relay {}; refusing", call.message_id);
            return self.reject(&call.message_id, &call.action, back, NO_ROUTE).await;
        }

        let path = match path.append(shared.local()) {
            Ok(path) => path,
            Err(e) => {
                warn!("Not relaying {}: {}", call.message_id, e);
                return self.reject(&call.message_id, &call.action, back, &e.to_string()).await;
            }
        };

        let message_id = call.message_id.clone();
        let action = call.action.clone();
        let to = connection.peer().clone();
        let frame = Frame::Call(call).with_routing(Some(RoutingHeader::new(destination, path)));

        match connection.send(&frame).await {
            Ok(()) => {
                info!("Forwarded {} {} from {} to {}", action, message_id, from.peer(), to);
                shared.emit(DispatchEvent::CallForwarded {
                    message_id,
                    action,
                    from: from.peer().clone(),
                    to: to.clone(),
                });
                InboundOutcome::Forwarded(to)
            }
            Err(e) => {
                error!("Failed to forward {} to {}: {}", message_id, to, e);
                self.reject(&message_id, &action, back, NO_ROUTE).await
            }
        }
    }

    /// Verify, parse and hand a CALL to local handlers
    pub(super) async fn deliver_local(
        &self,
        call: Call,
        origin: Option<NetworkingNodeId>,
        route: ReplyRoute,
    ) -> InboundOutcome {
        let shared = &self.shared;
        let Call {
            message_id,
            action,
            payload,
            ..
        } = call;

        // Signatures are checked before the payload is even parsed
        match shared.signatures.verify_payload(&action, &payload) {
            Verdict::Accepted(outcome) => {
                shared.emit(DispatchEvent::SignatureChecked {
                    message_id: message_id.clone(),
                    action: action.clone(),
                    outcome,
                });
            }
            Verdict::Rejected(reason) => {
                warn!("Rejected {} {}: {}", action, message_id, reason);
                shared.emit(DispatchEvent::SignatureRejected {
                    message_id: message_id.clone(),
                    action: action.clone(),
                    reason: reason.clone(),
                });
                return self
                    .answer_error(&route, &action, message_id, ErrorCode::SecurityError, reason.to_string())
                    .await;
            }
        }

        let request = match shared.actions.try_parse_request(&action, &payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("Cannot handle {} {}: {}", action, message_id, e);
                let (code, description, _) = shared.actions.serialize_error(&e);
                return self.answer_error(&route, &action, message_id, code, description).await;
            }
        };

        let incoming = IncomingRequest {
            message_id: message_id.clone(),
            action: action.clone(),
            origin,
            request,
            responder: Responder {
                shared: self.shared.clone(),
                message_id,
                action,
                route,
            },
        };

        match shared.incoming.send(incoming).await {
            Ok(()) => InboundOutcome::Delivered,
            Err(rejected) => {
                error!("No local handler for {}", rejected.0.message_id);
                let responder = rejected.0.responder;
                let code = ErrorCode::InternalError;
                match responder.respond_error(code.clone(), "No handler available", empty()).await {
                    Ok(()) => InboundOutcome::Answered(code),
                    Err(_) => InboundOutcome::Dropped,
                }
            }
        }
    }

    async fn handle_reply(&self, from: &Connection, frame: Frame) -> InboundOutcome {
        let shared = &self.shared;
        let Some(routing) = frame.routing().cloned() else {
            return shared.settle_remote(frame, from);
        };

        match routing.network_path.retreat(shared.local()) {
            ReturnStep::Deliver => shared.settle_remote(frame, from),
            ReturnStep::Relay { next, path } => {
                let message_id = frame.message_id().clone();
                // Replies retrace the CALL hop by hop; static routes are not consulted
                let Some(connection) = shared.routes.connection_to(&next) else {
                    warn!("Link to {} is gone; dropping reply {}", next, message_id);
                    return InboundOutcome::Dropped;
                };
                let frame = frame.with_routing(Some(RoutingHeader::new(routing.destination, path)));
                match connection.send(&frame).await {
                    Ok(()) => {
                        debug!("Relayed reply {} to {}", message_id, next);
                        shared.emit(DispatchEvent::ReplyRelayed {
                            message_id,
                            to: next.clone(),
                        });
                        InboundOutcome::Forwarded(next)
                    }
                    Err(e) => {
                        error!("Failed to relay reply {}: {}", message_id, e);
                        InboundOutcome::Dropped
                    }
                }
            }
            ReturnStep::Misrouted => {
                warn!(
                    "Reply {} with path {} does not end at {}; dropping",
                    frame.message_id(),
                    routing.network_path,
                    shared.local()
                );
                InboundOutcome::Dropped
            }
        }
    }

    async fn handle_malformed(&self, from: &Connection, error: FrameError) -> InboundOutcome {
        let shared = &self.shared;
        warn!("Malformed frame from {}: {}", from.peer(), error);
        shared.emit(DispatchEvent::FormatError {
            from: from.peer().clone(),
            error: error.clone(),
        });

        let Some(message_id) = error.message_id.clone() else {
            return InboundOutcome::Malformed { answered: false };
        };

        let is_reply = matches!(
            error.type_code.and_then(MessageType::from_code),
            Some(MessageType::CallResult) | Some(MessageType::CallError)
        );
        if is_reply {
            return self.malformed_reply(from, message_id, error).await;
        }

        let code = match error.kind {
            FrameErrorKind::UnknownMessageType(_) => ErrorCode::MessageTypeNotSupported,
            _ => ErrorCode::RpcFrameworkError,
        };
        let routing = error.routing.as_ref().map(|routing| return_header(routing, from));
        let answer = Frame::CallError(CallError::new(message_id, code, error.to_string())).with_routing(routing);
        let answered = from.send(&answer).await.is_ok();
        InboundOutcome::Malformed { answered }
    }

    /// A broken reply still settles the request it answers, wherever that is
    async fn malformed_reply(&self, from: &Connection, message_id: MessageId, error: FrameError) -> InboundOutcome {
        let shared = &self.shared;
        let step = error
            .routing
            .as_ref()
            .map(|routing| (routing, routing.network_path.retreat(shared.local())));

        match step {
            None | Some((_, ReturnStep::Deliver)) => {
                shared.fail_pending(&message_id, from, RequestError::Format(error.to_string()));
                InboundOutcome::Malformed { answered: false }
            }
            Some((routing, ReturnStep::Relay { next, path })) => {
                let Some(connection) = shared.routes.connection_to(&next) else {
                    warn!("Link to {} is gone; dropping broken reply {}", next, message_id);
                    return InboundOutcome::Malformed { answered: false };
                };
                let frame = Frame::CallError(CallError::new(
                    message_id.clone(),
                    ErrorCode::FormatViolation,
                    error.to_string(),
                ))
                .with_routing(Some(RoutingHeader::new(routing.destination.clone(), path)));
                shared.emit(DispatchEvent::SyntheticError { frame: frame.clone() });
                let answered = match connection.send(&frame).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!("Failed to relay broken reply {}: {}", message_id, e);
                        false
                    }
                };
                InboundOutcome::Malformed { answered }
            }
            Some((routing, ReturnStep::Misrouted)) => {
                warn!(
                    "Broken reply {} with path {} does not end at {}; dropping",
                    message_id,
                    routing.network_path,
                    shared.local()
                );
                InboundOutcome::Malformed { answered: false }
            }
        }
    }

    /// Answer a CALL this node cannot deliver with a NotFound CALLERROR
    async fn reject(
        &self,
        message_id: &MessageId,
        action: &str,
        back: ReplyRoute,
        description: &str,
    ) -> InboundOutcome {
        let error = self
            .shared
            .signed_error(action, message_id.clone(), ErrorCode::NotFound, description, empty())
            .await;
        let frame = Frame::CallError(error);
        self.shared.emit(DispatchEvent::SyntheticError { frame: frame.clone() });
        match self.shared.answer(&back, frame).await {
            Ok(()) => InboundOutcome::Answered(ErrorCode::NotFound),
            Err(e) => {
                error!("Failed to answer {}: {}", message_id, e);
                InboundOutcome::Dropped
            }
        }
    }

    async fn answer_error(
        &self,
        route: &ReplyRoute,
        action: &str,
        message_id: MessageId,
        code: ErrorCode,
        description: String,
    ) -> InboundOutcome {
        let error = self
            .shared
            .signed_error(action, message_id, code.clone(), description, empty())
            .await;
        let frame = Frame::CallError(error);
        match self.shared.answer(route, frame).await {
            Ok(()) => InboundOutcome::Answered(code),
            Err(e) => {
                error!("Failed to send error answer: {}", e);
                InboundOutcome::Dropped
            }
        }
    }
}

impl Shared {
    /// Settle a pending request with a reply that arrived on `from`
    ///
    /// Results and errors alike are checked against the inbound signature
    /// policy of the action they answer.
    pub(super) fn settle_remote(&self, frame: Frame, from: &Connection) -> InboundOutcome {
        let message_id = frame.message_id().clone();
        let info = match self.pending_from(&message_id, from) {
            Ok(info) => info,
            Err(outcome) => return outcome,
        };

        let reply = match frame {
            Frame::CallResult(result) => self
                .check_reply(&message_id, &info.action, &result.payload)
                .map(|()| result.payload),
            Frame::CallError(error) => match self.check_reply(&message_id, &info.action, &error.error_details) {
                Ok(()) => Err(RequestError::from_call_error(&error)),
                Err(e) => Err(e),
            },
            Frame::Call(_) => return InboundOutcome::Dropped,
        };
        self.finish(message_id, reply)
    }

    /// Settle a pending request with an answer produced on this node
    pub(super) fn settle_local(&self, frame: Frame) -> InboundOutcome {
        let message_id = frame.message_id().clone();
        let reply = match frame {
            Frame::CallResult(result) => Ok(result.payload),
            Frame::CallError(error) => Err(RequestError::from_call_error(&error)),
            Frame::Call(_) => return InboundOutcome::Dropped,
        };
        self.finish(message_id, reply)
    }

    /// Fail a pending request whose reply from `from` could not be read
    fn fail_pending(&self, message_id: &MessageId, from: &Connection, error: RequestError) {
        if self.pending_from(message_id, from).is_ok() {
            self.pending.complete(message_id, Err(error));
        }
    }

    /// Pending entry for a reply arriving on `from`, if it may settle it
    fn pending_from(&self, message_id: &MessageId, from: &Connection) -> Result<PendingInfo, InboundOutcome> {
        let Some(info) = self.pending.info(message_id) else {
            warn!("Late or unknown reply {}", message_id);
            self.emit(DispatchEvent::LateReply {
                message_id: message_id.clone(),
            });
            return Err(InboundOutcome::LateReply);
        };
        match &info.via {
            Some(via) if via != from.peer() => {
                warn!(
                    "Reply {} arrived from {} but the call went to {}; dropping",
                    message_id,
                    from.peer(),
                    via
                );
                Err(InboundOutcome::Dropped)
            }
            _ => Ok(info),
        }
    }

    fn check_reply(&self, message_id: &MessageId, action: &str, payload: &Value) -> Result<(), RequestError> {
        match self.signatures.verify_payload(action, payload) {
            Verdict::Accepted(outcome) => {
                self.emit(DispatchEvent::SignatureChecked {
                    message_id: message_id.clone(),
                    action: action.to_string(),
                    outcome,
                });
                Ok(())
            }
            Verdict::Rejected(reason) => {
                warn!("Rejected reply {} ({}): {}", message_id, action, reason);
                self.emit(DispatchEvent::SignatureRejected {
                    message_id: message_id.clone(),
                    action: action.to_string(),
                    reason: reason.clone(),
                });
                Err(RequestError::Signature(reason.to_string()))
            }
        }
    }

    fn finish(&self, message_id: MessageId, reply: Reply) -> InboundOutcome {
        let success = reply.is_ok();
        match self.pending.complete(&message_id, reply) {
            Some(info) => {
                let elapsed = (self.clock.now() - info.issued_at).to_std().unwrap_or_default();
                debug!("Request {} ({}) settled after {:?}", message_id, info.action, elapsed);
                self.emit(DispatchEvent::ResponseReceived {
                    message_id,
                    action: info.action,
                    elapsed,
                    success,
                });
                InboundOutcome::Completed
            }
            None => {
                self.emit(DispatchEvent::LateReply { message_id });
                InboundOutcome::LateReply
            }
        }
    }
}

/// Routing header for answering a CALL: back to its origin along its path
fn return_header(routing: &RoutingHeader, from: &Connection) -> RoutingHeader {
    let path = if routing.network_path.is_empty() {
        NetworkPath::starting_at(from.peer().clone())
    } else {
        routing.network_path.clone()
    };
    let origin = path.origin().cloned().unwrap_or_else(|| from.peer().clone());
    RoutingHeader::new(SourceRouting::Node(origin), path)
}

fn empty() -> Value {
    Value::Object(serde_json::Map::new())
}
