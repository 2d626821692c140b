//! Request id generation and the request/reply correlation table

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use http::Method;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use crate::error::{AgentError, AgentResult};
use crate::wire::ProviderReply;

/// Correlation id stamped on each forwarded request and echoed on its reply
pub type RequestId = u64;

/// Strictly increasing id source, owned by the router
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    next: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(first: RequestId) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Allocate the next id (wraps at u64::MAX)
    pub fn next(&self) -> RequestId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Id the next call to [`next`](Self::next) will hand out
    pub fn peek(&self) -> RequestId {
        self.next.load(Ordering::Relaxed)
    }
}

/// Caller-side handle a reply is written back to
#[derive(Debug)]
pub struct InboundConnection {
    reply_tx: oneshot::Sender<ProviderReply>,
    peer: Option<SocketAddr>,
}

impl InboundConnection {
    /// Create a handle together with the receiving end the caller waits on
    pub fn channel(peer: Option<SocketAddr>) -> (Self, oneshot::Receiver<ProviderReply>) {
        let (reply_tx, reply_rx) = oneshot::channel();
        (Self { reply_tx, peer }, reply_rx)
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.reply_tx.is_closed()
    }

    /// Write the reply out; fails if the caller has gone away
    pub fn deliver(self, id: RequestId, reply: ProviderReply) -> AgentResult<()> {
        self.reply_tx
            .send(reply)
            .map_err(|_| AgentError::InboundClosed(id))
    }
}

/// A forwarded request waiting for its reply
#[derive(Debug)]
pub struct PendingRequest {
    pub inbound: InboundConnection,
    pub endpoint_index: usize,
    pub method: Method,
    pub registered_at: Instant,
}

/// Concurrent `RequestId -> InboundConnection` map.
///
/// Sharded so that routers inserting and dispatchers removing never
/// serialize behind a single lock.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: DashMap<RequestId, PendingRequest>,
    // Maintained alongside the map so reading the size never locks every shard
    count: AtomicUsize,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pending request; an id already present is rejected
    pub fn put(
        &self,
        id: RequestId,
        inbound: InboundConnection,
        endpoint_index: usize,
    ) -> AgentResult<()> {
        self.put_for(id, inbound, endpoint_index, Method::GET)
    }

    /// Like [`put`](Self::put), remembering the method the request was sent with
    pub fn put_for(
        &self,
        id: RequestId,
        inbound: InboundConnection,
        endpoint_index: usize,
        method: Method,
    ) -> AgentResult<()> {
        match self.pending.entry(id) {
            Entry::Occupied(_) => Err(AgentError::DuplicateRequestId(id)),
            Entry::Vacant(entry) => {
                // Counted while the shard is held, so a racing take never sees zero
                self.count.fetch_add(1, Ordering::Relaxed);
                entry.insert(PendingRequest {
                    inbound,
                    endpoint_index,
                    method,
                    registered_at: Instant::now(),
                });
                Ok(())
            }
        }
    }

    /// Remove and return the pending request for `id`
    pub fn take(&self, id: RequestId) -> AgentResult<PendingRequest> {
        let (_, pending) = self
            .pending
            .remove(&id)
            .ok_or(AgentError::UnknownRequestId(id))?;
        self.count.fetch_sub(1, Ordering::Relaxed);
        Ok(pending)
    }

    /// Whether the reply to `id` carries a body on the wire.
    ///
    /// Replies to HEAD requests never do. Unknown ids are assumed to.
    pub fn expects_reply_body(&self, id: RequestId) -> bool {
        self.pending
            .get(&id)
            .is_none_or(|pending| pending.method != Method::HEAD)
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry registered at least `max_age` ago.
    ///
    /// Dropping an entry closes its reply channel, which the waiting caller
    /// observes as a receive error. Returns the evicted ids.
    pub fn evict_older_than(&self, max_age: Duration) -> Vec<RequestId> {
        let now = Instant::now();
        let mut evicted = Vec::new();

        self.pending.retain(|id, pending| {
            if now.duration_since(pending.registered_at) >= max_age {
                evicted.push(*id);
                self.count.fetch_sub(1, Ordering::Relaxed);
                false
            } else {
                true
            }
        });

        evicted
    }
}
