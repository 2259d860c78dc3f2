//! Backup-side replication: poll Main's `/state`, replace, persist.
//!
//! ```text
//!  tick / leader change
//!        │
//!        ▼ role == Backup && leader known?
//!  GET http://<main>/state  (≤ peer timeout)
//!        │ ok                         │ err
//!        ▼                            ▼
//!  store.replace(snapshot)       keep previous state, log
//!  snapshot_file.persist()
//! ```
//!
//! Staleness is bounded by the poll interval plus one round trip. Nothing is
//! acknowledged back to Main.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::election::{ElectionState, Elector, Role};
use crate::peer::PeerClient;
use crate::storage::{SnapshotFile, StorageError};
use crate::store::SharedStore;

/// Result of one replication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Local store replaced with Main's snapshot
    Replicated,
    /// Not a Backup, or no leader address known
    Skipped,
    /// Fetch failed; local state untouched
    Failed,
}

/// Counters for monitoring replication health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationStats {
    pub replicated: u64,
    pub failed: u64,
    pub persisted_bytes: u64,
}

#[derive(Default)]
struct AtomicReplicationStats {
    replicated: AtomicU64,
    failed: AtomicU64,
    persisted_bytes: AtomicU64,
}

/// Keeps a Backup's store in step with the current Main.
pub struct ReplicationAgent {
    store: SharedStore,
    elector: Arc<Elector>,
    client: PeerClient,
    snapshot_file: Option<SnapshotFile>,
    interval: Duration,
    stats: AtomicReplicationStats,
}

impl ReplicationAgent {
    pub fn new(
        store: SharedStore,
        elector: Arc<Elector>,
        client: PeerClient,
        snapshot_file: Option<SnapshotFile>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            elector,
            client,
            snapshot_file,
            interval,
            stats: AtomicReplicationStats::default(),
        }
    }

    /// Load the last durable snapshot into the store.
    ///
    /// Returns `true` when a snapshot was found.
    pub async fn restore(&self) -> Result<bool, StorageError> {
        let Some(file) = &self.snapshot_file else {
            return Ok(false);
        };
        match file.load().await? {
            Some(snapshot) => {
                log::info!(
                    "Restored snapshot from {} ({} chars, {} cursors)",
                    file.path().display(),
                    snapshot.document.chars().count(),
                    snapshot.cursors.len()
                );
                self.store.write().await.replace(snapshot);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// One replication attempt against the currently believed Main.
    pub async fn sync_once(&self) -> SyncOutcome {
        let ElectionState {
            role, leader_addr, ..
        } = self.elector.state();
        if role != Role::Backup {
            return SyncOutcome::Skipped;
        }
        let Some(addr) = leader_addr else {
            return SyncOutcome::Skipped;
        };

        let snapshot = match self.client.state(&addr).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("Replication from {addr} failed: {e}");
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                return SyncOutcome::Failed;
            }
        };

        // Role may have flipped while the fetch was in flight
        if self.elector.role() != Role::Backup {
            return SyncOutcome::Skipped;
        }

        self.store.write().await.replace(snapshot.clone());
        self.stats.replicated.fetch_add(1, Ordering::Relaxed);
        log::trace!("Replicated state from {addr}");

        if let Some(file) = &self.snapshot_file {
            match file.persist(&snapshot).await {
                Ok(bytes) => {
                    self.stats
                        .persisted_bytes
                        .fetch_add(bytes as u64, Ordering::Relaxed);
                }
                Err(e) => log::error!("Failed to persist snapshot: {e}"),
            }
        }
        SyncOutcome::Replicated
    }

    /// Periodic replication loop; exits when `shutdown` fires.
    ///
    /// Besides the fixed cadence, a change of believed Main triggers an
    /// immediate fetch.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut changes = self.elector.subscribe();
        let mut last_leader = changes.borrow().leader_id.clone();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sync_once().await;
                }
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let leader = changes.borrow_and_update().leader_id.clone();
                    if leader != last_leader {
                        last_leader = leader;
                        self.sync_once().await;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        log::debug!("Replication loop stopped");
    }

    pub fn stats(&self) -> ReplicationStats {
        ReplicationStats {
            replicated: self.stats.replicated.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            persisted_bytes: self.stats.persisted_bytes.load(Ordering::Relaxed),
        }
    }
}
