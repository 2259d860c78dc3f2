//! Node configuration and the static peer registry.
//!
//! Loaded once from a JSON file:
//! ```text
//! {
//!   "id": "a", "port": 5001,
//!   "peers": [{ "id": "b", "host": "localhost", "port": 5002 }],
//!   "election_interval_ms": 2000
//! }
//! ```
//! Only `id`, `port` and `peers` are required; every timing knob has a default.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A static cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub id: String,
    pub host: String,
    pub port: u16,
}

impl PeerDescriptor {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
        }
    }

    /// `host:port`, also the key of the failure table.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Per-node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Cluster-unique node id
    pub id: String,
    /// Interface to bind
    #[serde(default = "default_host")]
    pub host: String,
    /// Port serving both HTTP and WebSocket
    pub port: u16,
    /// Every other member of the cluster
    pub peers: Vec<PeerDescriptor>,
    #[serde(default = "default_election_interval_ms")]
    pub election_interval_ms: u64,
    #[serde(default = "default_replication_interval_ms")]
    pub replication_interval_ms: u64,
    /// Upper bound on every outbound peer call
    #[serde(default = "default_peer_timeout_ms")]
    pub peer_timeout_ms: u64,
    /// How long a failed peer is skipped by election
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Sessions silent for longer than this are evicted
    #[serde(default = "default_session_ttl_ms")]
    pub session_ttl_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// WebSocket ping cadence; must stay below the session TTL
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Outbound frames buffered per session before drops
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    /// Durable snapshot written by the replication agent (None = memory only)
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_election_interval_ms() -> u64 {
    2000
}
fn default_replication_interval_ms() -> u64 {
    1000
}
fn default_peer_timeout_ms() -> u64 {
    1000
}
fn default_cooldown_ms() -> u64 {
    5000
}
fn default_session_ttl_ms() -> u64 {
    5000
}
fn default_sweep_interval_ms() -> u64 {
    1000
}
fn default_heartbeat_interval_ms() -> u64 {
    1000
}
fn default_broadcast_capacity() -> usize {
    256
}

impl NodeConfig {
    /// Build a config with default timings.
    pub fn new(id: impl Into<String>, port: u16, peers: Vec<PeerDescriptor>) -> Self {
        Self {
            id: id.into(),
            host: default_host(),
            port,
            peers,
            election_interval_ms: default_election_interval_ms(),
            replication_interval_ms: default_replication_interval_ms(),
            peer_timeout_ms: default_peer_timeout_ms(),
            cooldown_ms: default_cooldown_ms(),
            session_ttl_ms: default_session_ttl_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            broadcast_capacity: default_broadcast_capacity(),
            snapshot_path: None,
        }
    }

    /// Read, parse and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Parse and validate a JSON document.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::Invalid("node id is empty".into()));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero".into()));
        }

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.id.trim().is_empty() {
                return Err(ConfigError::Invalid("peer id is empty".into()));
            }
            if !seen.insert(peer.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate peer id {}", peer.id)));
            }
        }

        let intervals = [
            ("election_interval_ms", self.election_interval_ms),
            ("replication_interval_ms", self.replication_interval_ms),
            ("peer_timeout_ms", self.peer_timeout_ms),
            ("sweep_interval_ms", self.sweep_interval_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        if self.session_ttl_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(
                "session_ttl_ms must exceed heartbeat_interval_ms".into(),
            ));
        }
        if self.broadcast_capacity == 0 {
            return Err(ConfigError::Invalid("broadcast_capacity must be non-zero".into()));
        }
        Ok(())
    }

    /// Address the listener binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Address advertised for this node when it leads.
    pub fn self_addr(&self) -> String {
        format!("localhost:{}", self.port)
    }

    /// Look up a peer in the registry.
    pub fn peer(&self, id: &str) -> Option<&PeerDescriptor> {
        self.peers.iter().find(|p| p.id == id)
    }

    pub fn election_interval(&self) -> Duration {
        Duration::from_millis(self.election_interval_ms)
    }

    pub fn replication_interval(&self) -> Duration {
        Duration::from_millis(self.replication_interval_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_millis(self.session_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}
