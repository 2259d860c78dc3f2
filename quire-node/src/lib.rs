//! # quire-node: replicated collaborative plaintext editing
//!
//! A small cluster of peer nodes serves one shared plaintext document to
//! browser-style editor clients over WebSocket. Nodes elect the longest-lived
//! reachable member as Main; the others replicate its state and take over
//! when it disappears.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  WebSocket (JSON)  ┌──────────────┐  GET /state   ┌──────────────┐
//! │ EditorClient │ ◄────────────────► │  Node (Main) │ ◄──────────── │ Node (Backup)│
//! │  discovery   │ ── GET /health ──► │  Hub + Store │  GET /uptime  │ Replication  │
//! └──────────────┘                    └──────┬───────┘ ◄──────────►  └──────┬───────┘
//!                                            │         election             │
//!                                     ┌──────┴───────┐               ┌──────┴───────┐
//!                                     │BroadcastGroup│               │ SnapshotFile │
//!                                     │  (fan-out)   │               │ (LZ4+bincode)│
//!                                     └──────────────┘               └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Node configuration and peer registry
//! - [`protocol`]: JSON frames and HTTP report bodies
//! - [`peer`]: Timed HTTP calls to other nodes
//! - [`election`]: Uptime-ranked leader election
//! - [`store`]: Document and cursor state
//! - [`storage`]: Durable snapshot file
//! - [`replication`]: Backup-side state polling
//! - [`broadcast`]: Per-session fan-out with backpressure
//! - [`hub`]: Session lifecycle, edits, cursors, liveness
//! - [`http`]: Discovery endpoints
//! - [`server`]: Node wiring and the shared listener
//! - [`client`]: Editor client with Main discovery

pub mod broadcast;
pub mod client;
pub mod config;
pub mod election;
pub mod http;
pub mod hub;
pub mod peer;
pub mod protocol;
pub mod replication;
pub mod server;
pub mod storage;
pub mod store;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use client::{
    ClientConfig, ClientError, ConnectionState, Discovery, EditorClient, EditorEvent, ServerAddr,
};
pub use config::{ConfigError, NodeConfig, PeerDescriptor};
pub use election::{ElectionState, Elector, Role};
pub use hub::{FrameOutcome, Hub, SessionHandle};
pub use peer::{PeerClient, PeerError};
pub use protocol::{ElectionReport, Frame, HealthReport, ProtocolError, UptimeReport};
pub use replication::{ReplicationAgent, SyncOutcome};
pub use server::{Node, NodeError, NodeHandle, NodeState, ServerStats};
pub use storage::{SnapshotFile, StorageError};
pub use store::{CursorState, SharedStore, Snapshot, StateStore};
