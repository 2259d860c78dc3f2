//! In-memory document and cursor map, the unit of replication.
//!
//! The store is plain data; callers wrap it in [`SharedStore`] so that every
//! read or mutation is serialized across connections and background loops.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

/// Store handle shared by the hub, the replication agent and the HTTP surface.
pub type SharedStore = Arc<RwLock<StateStore>>;

/// Last known cursor of one client.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorState {
    pub position: u64,
    /// Wall-clock seconds since the Unix epoch
    #[serde(rename = "lastActive")]
    pub last_active: f64,
}

/// Serialized `{document, cursors}`, served by `/state` and persisted by backups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub document: String,
    #[serde(default)]
    pub cursors: BTreeMap<String, CursorState>,
}

/// Document text plus per-client cursors.
#[derive(Debug, Default)]
pub struct StateStore {
    document: String,
    cursors: BTreeMap<String, CursorState>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            document: snapshot.document,
            cursors: snapshot.cursors,
        }
    }

    pub fn shared(self) -> SharedStore {
        Arc::new(RwLock::new(self))
    }

    pub fn document(&self) -> &str {
        &self.document
    }

    /// Document length in UTF-16 code units, the unit editor selection
    /// offsets are reported in; the upper bound for cursor offsets.
    pub fn document_len(&self) -> u64 {
        self.document.encode_utf16().count() as u64
    }

    /// Last-write-wins replacement of the whole document.
    pub fn set_document(&mut self, text: String) {
        self.document = text;
    }

    /// Clamp a client-supplied offset to `[0, document_len]`.
    pub fn clamp_position(&self, position: i64) -> u64 {
        if position <= 0 {
            0
        } else {
            (position as u64).min(self.document_len())
        }
    }

    /// Record a cursor move.
    ///
    /// Returns the clamped position when it differs from the stored one, or
    /// `None` when the move is redundant and must not be broadcast.
    pub fn set_cursor(&mut self, client_id: &str, position: i64, now: f64) -> Option<u64> {
        let clamped = self.clamp_position(position);
        if let Some(existing) = self.cursors.get(client_id) {
            if existing.position == clamped {
                return None;
            }
        }
        self.cursors.insert(
            client_id.to_string(),
            CursorState {
                position: clamped,
                last_active: now,
            },
        );
        Some(clamped)
    }

    /// Refresh a cursor's `lastActive` without moving it.
    pub fn touch_cursor(&mut self, client_id: &str, now: f64) -> bool {
        match self.cursors.get_mut(client_id) {
            Some(cursor) => {
                cursor.last_active = now;
                true
            }
            None => false,
        }
    }

    pub fn cursor(&self, client_id: &str) -> Option<&CursorState> {
        self.cursors.get(client_id)
    }

    pub fn remove_cursor(&mut self, client_id: &str) -> Option<CursorState> {
        self.cursors.remove(client_id)
    }

    pub fn cursor_count(&self) -> usize {
        self.cursors.len()
    }

    /// Drop cursors last active before `cutoff`. Returns the removed ids.
    pub fn prune_cursors(&mut self, cutoff: f64) -> Vec<String> {
        let stale: Vec<String> = self
            .cursors
            .iter()
            .filter(|(_, c)| c.last_active < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.cursors.remove(id);
        }
        stale
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            document: self.document.clone(),
            cursors: self.cursors.clone(),
        }
    }

    /// Wholesale replacement; nothing of the previous state survives.
    pub fn replace(&mut self, snapshot: Snapshot) {
        self.document = snapshot.document;
        self.cursors = snapshot.cursors;
    }
}

/// Seconds since the Unix epoch, the unit of `lastActive`.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
