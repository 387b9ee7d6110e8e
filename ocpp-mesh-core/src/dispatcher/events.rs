//! Dispatcher observations and per-frame outcomes

use std::sync::Arc;
use std::time::Duration;

use crate::envelope::{ErrorCode, Frame, FrameError, MessageId};
use crate::routing::NetworkingNodeId;
use crate::signature::{SignatureError, VerificationOutcome};

/// Something the dispatcher did, reported to the host observer
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    /// An originated CALL left this node
    RequestSent {
        message_id: MessageId,
        action: String,
        via: NetworkingNodeId,
    },
    /// An originated CALL was settled by a reply
    ResponseReceived {
        message_id: MessageId,
        action: String,
        elapsed: Duration,
        success: bool,
    },
    CallForwarded {
        message_id: MessageId,
        action: String,
        from: NetworkingNodeId,
        to: NetworkingNodeId,
    },
    ReplyRelayed {
        message_id: MessageId,
        to: NetworkingNodeId,
    },
    /// CALLERROR produced by this node instead of a remote peer
    SyntheticError { frame: Frame },
    /// Reply for a request that is no longer pending
    LateReply { message_id: MessageId },
    SignatureChecked {
        message_id: MessageId,
        action: String,
        outcome: VerificationOutcome,
    },
    SignatureRejected {
        message_id: MessageId,
        action: String,
        reason: SignatureError,
    },
    FormatError {
        from: NetworkingNodeId,
        error: FrameError,
    },
}

/// Host callback receiving every [`DispatchEvent`]
pub type Observer = Arc<dyn Fn(&DispatchEvent) + Send + Sync>;

/// What happened to one inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Handed to local handlers
    Delivered,
    /// Relayed toward the given neighbor
    Forwarded(NetworkingNodeId),
    /// Answered by this node with a CALLERROR
    Answered(ErrorCode),
    /// Settled a pending request
    Completed,
    LateReply,
    /// Unparseable frame; `answered` if a CALLERROR went back
    Malformed { answered: bool },
    Dropped,
}

impl InboundOutcome {
    /// Whether the frame counts toward a connection's format error budget
    pub fn is_format_error(&self) -> bool {
        matches!(self, InboundOutcome::Malformed { .. })
    }
}
