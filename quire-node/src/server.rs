//! One replicated editing node: listener, background loops and sessions.
//!
//! Architecture:
//! ```text
//!                     ┌── Upgrade: websocket ──► session task ──► Hub
//! TcpListener ─ peek ─┤                              │  ▲
//!                     └── plain HTTP ────────► /uptime /health /state /election
//!
//! background: Elector::run ─ ReplicationAgent::run ─ Hub::run_sweeper ─ Hub::run_role_watch
//!                  │
//!                  └── watch::Sender<bool> (shutdown) stops all of them
//! ```
//!
//! Every session gets a writer task that drains its outbound queue and pings
//! on the heartbeat, while the connection task reads inbound frames.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::config::{ConfigError, NodeConfig};
use crate::election::{Elector, Role};
use crate::http;
use crate::hub::{Hub, SessionHandle};
use crate::peer::PeerClient;
use crate::replication::ReplicationAgent;
use crate::storage::SnapshotFile;
use crate::store::{SharedStore, StateStore};

/// How long a new connection may take to send its request head.
const HEAD_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a closing session waits for its writer to flush.
const WRITER_GRACE: Duration = Duration::from_secs(1);

/// Startup failures. Nothing after a successful start is fatal.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
}

/// Connection counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub websocket_sessions: u64,
    pub http_requests: u64,
    pub rejected_connections: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    websocket_sessions: AtomicU64,
    http_requests: AtomicU64,
    rejected_connections: AtomicU64,
}

/// Handles shared by every task of one node.
pub struct NodeState {
    config: Arc<NodeConfig>,
    store: SharedStore,
    elector: Arc<Elector>,
    hub: Arc<Hub>,
    replication: Arc<ReplicationAgent>,
    stats: AtomicServerStats,
}

impl NodeState {
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn elector(&self) -> &Arc<Elector> {
        &self.elector
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn replication(&self) -> &Arc<ReplicationAgent> {
        &self.replication
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            websocket_sessions: self.stats.websocket_sessions.load(Ordering::Relaxed),
            http_requests: self.stats.http_requests.load(Ordering::Relaxed),
            rejected_connections: self.stats.rejected_connections.load(Ordering::Relaxed),
        }
    }
}

/// A configured node that has not started listening yet.
pub struct Node {
    state: Arc<NodeState>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;
        let config = Arc::new(config);
        let client = PeerClient::new(config.peer_timeout());

        let store = StateStore::new().shared();
        let elector = Arc::new(Elector::new(config.clone(), client.clone()));
        let hub = Arc::new(Hub::new(
            store.clone(),
            elector.clone(),
            config.broadcast_capacity,
            config.session_ttl(),
        ));
        let replication = Arc::new(ReplicationAgent::new(
            store.clone(),
            elector.clone(),
            client,
            config.snapshot_path.clone().map(SnapshotFile::new),
            config.replication_interval(),
        ));

        Ok(Self {
            state: Arc::new(NodeState {
                config,
                store,
                elector,
                hub,
                replication,
                stats: AtomicServerStats::default(),
            }),
        })
    }

    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    /// Restore the snapshot, bind, and spawn every loop.
    pub async fn start(self) -> Result<NodeHandle, NodeError> {
        let state = self.state;

        if let Err(e) = state.replication.restore().await {
            log::error!("Ignoring unreadable snapshot: {e}");
        }

        let addr = state.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| NodeError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| NodeError::Bind {
            addr: addr.clone(),
            source,
        })?;
        log::info!(
            "Node {} listening on {local_addr} ({} peers)",
            state.config.id,
            state.config.peers.len()
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(accept_loop(listener, state.clone(), shutdown_rx.clone())),
            tokio::spawn(state.elector.clone().run(shutdown_rx.clone())),
            tokio::spawn(state.replication.clone().run(shutdown_rx.clone())),
            tokio::spawn(
                state
                    .hub
                    .clone()
                    .run_sweeper(state.config.sweep_interval(), shutdown_rx.clone()),
            ),
            tokio::spawn(state.hub.clone().run_role_watch(shutdown_rx)),
        ];

        Ok(NodeHandle {
            local_addr,
            shutdown: shutdown_tx,
            tasks,
            state,
        })
    }
}

/// A running node. Dropping it stops every loop as well.
pub struct NodeHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    state: Arc<NodeState>,
}

impl NodeHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    pub fn role(&self) -> Role {
        self.state.elector.role()
    }

    /// Stop accepting, end every loop and close every session.
    pub async fn shutdown(self) {
        log::info!("Node {} shutting down", self.state.config.id);
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                log::warn!("Background task ended abnormally: {e}");
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<NodeState>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    state.stats.total_connections.fetch_add(1, Ordering::Relaxed);
                    let state = state.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, state, shutdown).await {
                            log::debug!("Connection from {addr} ended with error: {e}");
                        }
                    });
                }
                Err(e) => log::warn!("Accept failed: {e}"),
            },
            _ = shutdown.changed() => break,
        }
    }
    log::debug!("Accept loop stopped");
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<NodeState>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let head = match http::peek_head(&stream, HEAD_TIMEOUT).await {
        Ok(head) => head,
        Err(e) => {
            state.stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
            return Err(e.into());
        }
    };

    if head.is_websocket_upgrade() {
        state.stats.websocket_sessions.fetch_add(1, Ordering::Relaxed);
        serve_session(stream, addr, state, shutdown).await
    } else {
        state.stats.http_requests.fetch_add(1, Ordering::Relaxed);
        http::serve(stream, head, &state.elector, &state.store).await?;
        Ok(())
    }
}

async fn serve_session(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<NodeState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let SessionHandle {
        id,
        mut outbound,
        mut evicted,
    } = state.hub.connect().await;
    log::debug!("Session {id} bound to {addr}");

    // Writer: queued frames plus heartbeat pings
    let heartbeat = state.config.heartbeat_interval();
    let mut writer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(text) => {
                        if ws_sender.send(Message::Text(text.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_sender.close().await;
    });

    let mut writer_done = false;
    loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    state.hub.handle_text(&id, text.as_str()).await;
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    state.hub.touch(&id).await;
                }
                Some(Ok(Message::Binary(_))) => {
                    log::debug!("Ignoring binary frame from {id}");
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    log::debug!("Session {id} socket error: {e}");
                    break;
                }
            },
            _ = &mut evicted => {
                log::debug!("Closing evicted session {id}");
                break;
            }
            _ = &mut writer, if !writer_done => {
                writer_done = true;
                break;
            }
            _ = shutdown.changed() => break,
        }
    }

    // Dropping the queue lets the writer send a close frame and finish
    state.hub.disconnect(&id).await;
    if !writer_done {
        let _ = tokio::time::timeout(WRITER_GRACE, &mut writer).await;
    }
    Ok(())
}
