//! Fan-out to N-1 sessions with per-session backpressure.
//!
//! Every session owns a bounded queue drained by its own socket writer.
//! A frame is encoded once and the shared `Arc<str>` is pushed into each
//! queue with `try_send`, so fan-out never waits on a socket: a session
//! whose queue is full loses that frame and nobody else is delayed.
//!
//! ```text
//!                 ┌── queue(cap) ── writer ── socket A
//! broadcast ──────┼── queue(cap) ── writer ── socket B   (stalled: drops)
//!   (skip origin) └── queue(cap) ── writer ── socket C
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};

use crate::protocol::{Frame, ProtocolError};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Counters updated on the hot path without taking the peer lock for writing.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Outbound queues of every live session on this node.
pub struct BroadcastGroup {
    peers: RwLock<HashMap<String, mpsc::Sender<Arc<str>>>>,
    /// Frames buffered per session before drops
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a session and return the receiving end of its queue.
    ///
    /// Re-registering an id replaces the old queue, which closes it.
    pub async fn add_peer(&self, id: impl Into<String>) -> mpsc::Receiver<Arc<str>> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.peers.write().await.insert(id.into(), tx);
        rx
    }

    /// Remove a session. Dropping the sender ends its writer.
    pub async fn remove_peer(&self, id: &str) -> bool {
        self.peers.write().await.remove(id).is_some()
    }

    /// Queue a frame for one session only.
    pub async fn send_to(&self, id: &str, encoded: Arc<str>) -> bool {
        let peers = self.peers.read().await;
        match peers.get(id) {
            Some(tx) => self.offer(id, tx, encoded),
            None => false,
        }
    }

    /// Encode once and queue for every session except `origin`.
    /// Returns the number of sessions the frame was queued for.
    pub async fn broadcast_except(
        &self,
        origin: Option<&str>,
        frame: &Frame,
    ) -> Result<usize, ProtocolError> {
        let encoded: Arc<str> = Arc::from(frame.encode()?);
        Ok(self.broadcast_raw_except(origin, encoded).await)
    }

    /// Queue pre-encoded text for every session except `origin`.
    pub async fn broadcast_raw_except(&self, origin: Option<&str>, encoded: Arc<str>) -> usize {
        let peers = self.peers.read().await;
        let mut delivered = 0;
        for (id, tx) in peers.iter() {
            if Some(id.as_str()) == origin {
                continue;
            }
            if self.offer(id, tx, encoded.clone()) {
                delivered += 1;
            }
        }
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    fn offer(&self, id: &str, tx: &mpsc::Sender<Arc<str>>, encoded: Arc<str>) -> bool {
        match tx.try_send(encoded) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.atomic_stats
                    .messages_dropped
                    .fetch_add(1, Ordering::Relaxed);
                log::warn!("Session {id} is lagging; dropped one frame");
                false
            }
            Err(TrySendError::Closed(_)) => {
                log::trace!("Session {id} queue already closed");
                false
            }
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peer_ids(&self) -> Vec<String> {
        self.peers.read().await.keys().cloned().collect()
    }

    pub async fn has_peer(&self, id: &str) -> bool {
        self.peers.read().await.contains_key(id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
