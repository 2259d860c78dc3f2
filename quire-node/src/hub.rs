//! Session hub: identities, edits, cursors and liveness for one node.
//!
//! ```text
//! connect ──► mint id ──► queue `init` ──► register
//!                                             │
//! text frame ─► decode ─┬─ update (Main) ─► store.set_document ─► fan-out (skip sender)
//!                       ├─ cursor (Main) ─► clamp, dedupe ─────► fan-out (skip sender)
//!                       └─ malformed ────► dropped, connection kept
//!
//! sweep (every interval) ─► evict sessions silent for > ttl, drop their cursors
//!                        └──► drop cursors whose own lastActive is past the ttl
//! role Main → Backup ─► close every session so clients rediscover Main
//! ```
//!
//! Lock order is always store → sessions → broadcast peers. Store mutation
//! and fan-out enqueue happen under the same store guard, so every session
//! sees updates in the order they were accepted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, BroadcastStats};
use crate::election::{Elector, Role};
use crate::protocol::Frame;
use crate::store::{unix_now, SharedStore};

/// What the hub did with an inbound text frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Applied and queued for this many other sessions
    Broadcast(usize),
    /// Cursor did not move; nothing sent
    Redundant,
    /// Write refused because this node is not Main
    NotMain,
    /// Well-formed but not something a client may send
    Ignored,
    /// Could not be parsed
    Malformed,
    /// The session is no longer registered
    UnknownSession,
}

/// Everything a connection task needs after registering.
pub struct SessionHandle {
    pub id: String,
    /// Outbound frames, `init` first
    pub outbound: mpsc::Receiver<Arc<str>>,
    /// Fires when the liveness sweep evicts this session
    pub evicted: oneshot::Receiver<()>,
}

struct SessionEntry {
    last_active: Instant,
    evict: Option<oneshot::Sender<()>>,
}

/// Live sessions of one node.
pub struct Hub {
    store: SharedStore,
    elector: Arc<Elector>,
    group: BroadcastGroup,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    ttl: Duration,
}

impl Hub {
    pub fn new(store: SharedStore, elector: Arc<Elector>, capacity: usize, ttl: Duration) -> Self {
        Self {
            store,
            elector,
            group: BroadcastGroup::new(capacity),
            sessions: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Register a new session and queue its `init` frame.
    pub async fn connect(&self) -> SessionHandle {
        // Held for reading so no update can slip between the snapshot in
        // `init` and the registration that makes this session a recipient.
        let store = self.store.read().await;
        let mut sessions = self.sessions.write().await;

        let mut id = Uuid::new_v4().to_string();
        while sessions.contains_key(&id) {
            id = Uuid::new_v4().to_string();
        }

        let outbound = self.group.add_peer(id.clone()).await;
        match Frame::init(store.document(), id.clone()).encode() {
            Ok(init) => {
                self.group.send_to(&id, Arc::from(init)).await;
            }
            Err(e) => log::error!("Failed to encode init frame: {e}"),
        }

        let (evict_tx, evicted) = oneshot::channel();
        sessions.insert(
            id.clone(),
            SessionEntry {
                last_active: Instant::now(),
                evict: Some(evict_tx),
            },
        );
        log::info!("Session {id} connected ({} live)", sessions.len());

        SessionHandle {
            id,
            outbound,
            evicted,
        }
    }

    /// Refresh a session's last-active timestamp.
    pub async fn touch(&self, id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(id) {
            Some(entry) => {
                entry.last_active = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Apply one inbound text frame from session `id`.
    pub async fn handle_text(&self, id: &str, text: &str) -> FrameOutcome {
        if !self.touch(id).await {
            return FrameOutcome::UnknownSession;
        }

        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::debug!("Dropping frame from {id}: {e}");
                return FrameOutcome::Malformed;
            }
        };

        match frame {
            Frame::Update { data } => self.apply_update(id, data).await,
            Frame::Cursor {
                client_id,
                position,
            } => {
                if let Some(claimed) = client_id.as_deref() {
                    if claimed != id {
                        log::debug!("Session {id} reported cursor as {claimed}; using {id}");
                    }
                }
                self.apply_cursor(id, position).await
            }
            Frame::Init { .. } => {
                log::debug!("Ignoring init frame sent by client {id}");
                FrameOutcome::Ignored
            }
        }
    }

    async fn apply_update(&self, id: &str, data: String) -> FrameOutcome {
        let role = self.elector.role();
        if role != Role::Main {
            log::debug!("Refusing update from {id}: node is {role}");
            return FrameOutcome::NotMain;
        }

        let mut store = self.store.write().await;
        let frame = Frame::update(data.as_str());
        store.set_document(data);
        store.touch_cursor(id, unix_now());
        match self.group.broadcast_except(Some(id), &frame).await {
            Ok(recipients) => FrameOutcome::Broadcast(recipients),
            Err(e) => {
                log::error!("Failed to encode update: {e}");
                FrameOutcome::Broadcast(0)
            }
        }
    }

    async fn apply_cursor(&self, id: &str, position: i64) -> FrameOutcome {
        let role = self.elector.role();
        if role != Role::Main {
            log::trace!("Refusing cursor from {id}: node is {role}");
            return FrameOutcome::NotMain;
        }

        let mut store = self.store.write().await;
        let Some(clamped) = store.set_cursor(id, position, unix_now()) else {
            return FrameOutcome::Redundant;
        };
        match self
            .group
            .broadcast_except(Some(id), &Frame::cursor(id, clamped))
            .await
        {
            Ok(recipients) => FrameOutcome::Broadcast(recipients),
            Err(e) => {
                log::error!("Failed to encode cursor: {e}");
                FrameOutcome::Broadcast(0)
            }
        }
    }

    /// Tear down a session after close, socket error or eviction.
    pub async fn disconnect(&self, id: &str) -> bool {
        let mut store = self.store.write().await;
        let mut sessions = self.sessions.write().await;

        store.remove_cursor(id);
        let known = sessions.remove(id).is_some();
        self.group.remove_peer(id).await;
        if known {
            log::info!("Session {id} disconnected ({} live)", sessions.len());
        }
        known
    }

    /// Evict sessions silent for longer than the TTL as of `now`.
    ///
    /// Cursor entries whose own `lastActive` is older than the TTL are
    /// dropped too, even when their session still answers pings.
    /// Returns the evicted session ids.
    pub async fn sweep(&self, now: Instant) -> Vec<String> {
        let mut store = self.store.write().await;
        let mut sessions = self.sessions.write().await;

        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_active) > self.ttl)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(mut entry) = sessions.remove(id) {
                if let Some(evict) = entry.evict.take() {
                    let _ = evict.send(());
                }
            }
            store.remove_cursor(id);
            self.group.remove_peer(id).await;
            log::info!("Session {id} expired after {:?} of silence", self.ttl);
        }

        let pruned = store.prune_cursors(unix_now() - self.ttl.as_secs_f64());
        if !pruned.is_empty() {
            log::debug!("Pruned {} idle cursors", pruned.len());
        }

        expired
    }

    /// Tell every session to close. Returns how many were signalled.
    pub async fn evict_all(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let mut signalled = 0;
        for entry in sessions.values_mut() {
            if let Some(evict) = entry.evict.take() {
                let _ = evict.send(());
                signalled += 1;
            }
        }
        signalled
    }

    /// Close all sessions whenever this node steps down from Main.
    ///
    /// A demoted node refuses writes, so its clients must reconnect and find
    /// the new Main through `/health`.
    pub async fn run_role_watch(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut roles = self.elector.subscribe();
        let mut previous = roles.borrow_and_update().role;

        loop {
            tokio::select! {
                changed = roles.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let role = roles.borrow_and_update().role;
                    if previous == Role::Main && role != Role::Main {
                        let closed = self.evict_all().await;
                        log::info!("No longer main ({role}); closing {closed} sessions");
                    }
                    previous = role;
                }
                _ = shutdown.changed() => break,
            }
        }
        log::debug!("Role watch stopped");
    }

    /// Periodic liveness sweep; exits when `shutdown` fires.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep(Instant::now()).await;
                }
                _ = shutdown.changed() => break,
            }
        }
        log::debug!("Session sweeper stopped");
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn has_session(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn broadcast_stats(&self) -> BroadcastStats {
        self.group.stats().await
    }
}
