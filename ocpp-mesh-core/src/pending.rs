//! Pending request registry
//!
//! Correlates outbound CALLs with their eventual CALLRESULT/CALLERROR. Each
//! entry is fulfilled exactly once: by the matching reply, by its timer, or by
//! cancellation. Whoever removes the entry from its shard wins; everyone else
//! finds nothing and reports a late reply.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::envelope::MessageId;
use crate::error::{Reply, RequestError};
use crate::routing::{NetworkingNodeId, SourceRouting};

/// Registry errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("message id {0} is already pending")]
    DuplicateId(MessageId),
}

impl From<RegistryError> for RequestError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DuplicateId(id) => RequestError::DuplicateId(id),
        }
    }
}

/// What the registry knows about an outstanding CALL
#[derive(Debug, Clone, PartialEq)]
pub struct PendingInfo {
    pub message_id: MessageId,
    pub action: String,
    pub destination: Option<SourceRouting>,
    /// Neighbor the CALL left through; its reply must come back the same way
    pub via: Option<NetworkingNodeId>,
    pub issued_at: DateTime<Utc>,
    pub timeout: Duration,
}

struct Entry {
    seq: u64,
    info: PendingInfo,
    tx: oneshot::Sender<Reply>,
    timer: AbortHandle,
}

type Shard = Mutex<HashMap<MessageId, Entry>>;

struct Inner {
    shards: Vec<Shard>,
    next_seq: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl Inner {
    fn shard(&self, id: &MessageId) -> &Shard {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    /// Remove an entry, optionally only if it is still registration `seq`
    fn take(&self, id: &MessageId, seq: Option<u64>) -> Option<Entry> {
        let mut shard = self.shard(id).lock();
        match (shard.get(id), seq) {
            (Some(entry), Some(seq)) if entry.seq != seq => None,
            (Some(_), _) => shard.remove(id),
            (None, _) => None,
        }
    }

    fn expire(&self, id: &MessageId, seq: u64) {
        if let Some(entry) = self.take(id, Some(seq)) {
            warn!(
                "Request {} ({}) timed out after {:?}",
                id, entry.info.action, entry.info.timeout
            );
            let _ = entry.tx.send(Err(RequestError::Timeout));
        }
    }

    fn fulfill(&self, id: &MessageId, reply: Reply) -> Option<PendingInfo> {
        let entry = self.take(id, None)?;
        entry.timer.abort();
        // The awaiting side may already be gone; the entry is settled either way
        let _ = entry.tx.send(reply);
        Some(entry.info)
    }
}

/// Sharded table of outstanding requests
#[derive(Clone)]
pub struct PendingRequests {
    inner: Arc<Inner>,
}

impl PendingRequests {
    /// Create a registry with `shards` independently locked partitions
    pub fn new(shards: usize, clock: Arc<dyn Clock>) -> Self {
        let shards = (0..shards.max(1)).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            inner: Arc::new(Inner {
                shards,
                next_seq: AtomicU64::new(0),
                clock,
            }),
        }
    }

    /// Register an outstanding request and start its timer
    ///
    /// Must be called from within a tokio runtime.
    pub fn register(
        &self,
        message_id: MessageId,
        action: impl Into<String>,
        destination: Option<SourceRouting>,
        timeout: Duration,
    ) -> Result<PendingReply, RegistryError> {
        let inner = &self.inner;
        let mut shard = inner.shard(&message_id).lock();
        if shard.contains_key(&message_id) {
            return Err(RegistryError::DuplicateId(message_id));
        }

        let seq = inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        // The timer cannot fire into this shard until the lock is released
        let weak = Arc::downgrade(inner);
        let timer_id = message_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(&timer_id, seq);
            }
        })
        .abort_handle();

        let info = PendingInfo {
            message_id: message_id.clone(),
            action: action.into(),
            destination,
            via: None,
            issued_at: inner.clock.now(),
            timeout,
        };
        debug!("Pending {} ({}), timeout {:?}", message_id, info.action, timeout);
        shard.insert(
            message_id.clone(),
            Entry {
                seq,
                info,
                tx,
                timer,
            },
        );

        Ok(PendingReply {
            message_id,
            seq,
            rx,
            registry: Arc::downgrade(inner),
            settled: false,
        })
    }

    /// Fulfill a pending request with its reply
    ///
    /// Returns `None` for a late or duplicate reply, which is dropped.
    pub fn complete(&self, message_id: &MessageId, reply: Reply) -> Option<PendingInfo> {
        let info = self.inner.fulfill(message_id, reply);
        if info.is_none() {
            warn!("Dropping reply for unknown or settled request {}", message_id);
        }
        info
    }

    /// Cancel one pending request; `false` if it was already settled
    pub fn cancel(&self, message_id: &MessageId) -> bool {
        let cancelled = self
            .inner
            .fulfill(message_id, Err(RequestError::Cancelled))
            .is_some();
        if cancelled {
            debug!("Cancelled request {}", message_id);
        }
        cancelled
    }

    /// Fail every pending request with `error`, returning how many were settled
    pub fn fail_all(&self, error: RequestError) -> usize {
        let mut settled = 0;
        for shard in &self.inner.shards {
            let drained: Vec<Entry> = shard.lock().drain().map(|(_, entry)| entry).collect();
            for entry in drained {
                entry.timer.abort();
                let _ = entry.tx.send(Err(error.clone()));
                settled += 1;
            }
        }
        settled
    }

    /// Cancel everything, e.g. on shutdown
    pub fn cancel_all(&self) -> usize {
        self.fail_all(RequestError::Cancelled)
    }

    pub fn len(&self) -> usize {
        self.inner.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_pending(&self, message_id: &MessageId) -> bool {
        self.inner.shard(message_id).lock().contains_key(message_id)
    }

    /// Action of a pending request
    pub fn action_for(&self, message_id: &MessageId) -> Option<String> {
        self.info(message_id).map(|info| info.action)
    }

    /// Record the neighbor a pending CALL was sent to
    pub fn record_egress(&self, message_id: &MessageId, peer: NetworkingNodeId) -> bool {
        match self.inner.shard(message_id).lock().get_mut(message_id) {
            Some(entry) => {
                entry.info.via = Some(peer);
                true
            }
            None => false,
        }
    }

    pub fn info(&self, message_id: &MessageId) -> Option<PendingInfo> {
        self.inner
            .shard(message_id)
            .lock()
            .get(message_id)
            .map(|entry| entry.info.clone())
    }
}

impl std::fmt::Debug for PendingRequests {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequests")
            .field("shards", &self.inner.shards.len())
            .field("pending", &self.len())
            .finish()
    }
}

/// Awaitable outcome of a registered request
///
/// Dropping it before it resolves cancels the request.
#[derive(Debug)]
pub struct PendingReply {
    message_id: MessageId,
    seq: u64,
    rx: oneshot::Receiver<Reply>,
    registry: Weak<Inner>,
    settled: bool,
}

impl PendingReply {
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }
}

impl Future for PendingReply {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(reply) => {
                self.settled = true;
                Poll::Ready(reply.unwrap_or(Err(RequestError::Cancelled)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(inner) = self.registry.upgrade() {
            if let Some(entry) = inner.take(&self.message_id, Some(self.seq)) {
                entry.timer.abort();
                debug!("Request {} abandoned by caller", self.message_id);
            }
        }
    }
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner").field("shards", &self.shards.len()).finish()
    }
}
