//! Editor client: finds the current Main and keeps a session open to it.
//!
//! ```text
//!            ┌──────────── reconnect delay ◄────────────┐
//!            ▼                                          │
//!  Disconnected ──► Probing ──(GET /health, role=main)──► Connected
//!                      │  skip servers in cooldown          │
//!                      │  failed probe → cooldown           │ socket closed
//!                      └── nobody is Main ──► Disconnected  │ → cooldown
//!                                                           ▼
//!                                                      Disconnected
//! ```
//!
//! The local buffer survives disconnections. Edits made while offline are
//! sent as one `update` once a new session has received its `init`.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::election::{FailureRecord, Role};
use crate::peer::PeerClient;
use crate::protocol::{Frame, ProtocolError};

/// Client connection state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Probing,
    Connected,
}

/// Client-side failures.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to read client config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid client config: {0}")]
    Config(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connecting to {0} timed out")]
    ConnectTimeout(String),
}

/// A server the client may connect to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl ServerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port`, also the cooldown key.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/ws", self.host, self.port)
    }
}

/// Client configuration, usually read from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Candidate servers, probed in order
    pub servers: Vec<ServerAddr>,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// How long a failed server is skipped
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

fn default_probe_timeout_ms() -> u64 {
    1000
}
fn default_cooldown_ms() -> u64 {
    10_000
}
fn default_reconnect_delay_ms() -> u64 {
    2000
}

impl ClientConfig {
    pub fn new(servers: Vec<ServerAddr>) -> Self {
        Self {
            servers,
            probe_timeout_ms: default_probe_timeout_ms(),
            cooldown_ms: default_cooldown_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ClientError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ClientError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ClientError::Config(e.to_string()))?;
        if config.servers.is_empty() {
            return Err(ClientError::Config("no servers listed".into()));
        }
        Ok(config)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Finds the server that currently reports itself as Main.
pub struct Discovery {
    client: PeerClient,
    servers: Vec<ServerAddr>,
    failures: FailureRecord,
}

impl Discovery {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            client: PeerClient::new(config.probe_timeout()),
            servers: config.servers.clone(),
            failures: FailureRecord::new(config.cooldown()),
        }
    }

    /// Probe servers in order and return the first that answers as Main.
    ///
    /// A server that answers but is not Main is simply passed over; one that
    /// does not answer is put in cooldown.
    pub async fn find_main(&mut self) -> Option<ServerAddr> {
        for server in &self.servers {
            let key = server.addr();
            if self.failures.in_cooldown(&key, Instant::now()) {
                log::trace!("Skipping {key} (cooling down)");
                continue;
            }
            match self.client.health(&key).await {
                Ok(report) if report.role == Role::Main => {
                    self.failures.clear(&key);
                    return Some(server.clone());
                }
                Ok(report) => log::debug!("{key} is {}, not main", report.role),
                Err(e) => {
                    log::debug!("Probe of {key} failed: {e}");
                    self.failures.record_failure(key, Instant::now());
                }
            }
        }
        None
    }

    pub fn record_failure(&mut self, server: &ServerAddr) {
        self.failures.record_failure(server.addr(), Instant::now());
    }

    pub fn in_cooldown(&self, server: &ServerAddr) -> bool {
        self.failures.in_cooldown(&server.addr(), Instant::now())
    }
}

/// Events emitted to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditorEvent {
    /// Session open and `init` received
    Connected {
        server: ServerAddr,
        client_id: String,
    },
    /// Session lost; rediscovery follows
    Disconnected,
    /// The document was replaced by the server's copy
    DocumentReplaced(String),
    /// Another client's cursor moved
    RemoteCursor { client_id: String, position: u64 },
}

#[derive(Debug, Default)]
struct LocalBuffer {
    document: String,
    /// Changed while no session could take it
    dirty: bool,
}

struct ClientShared {
    config: ClientConfig,
    state: watch::Sender<ConnectionState>,
    buffer: Mutex<LocalBuffer>,
    client_id: RwLock<Option<String>>,
    outgoing: Mutex<Option<mpsc::Sender<String>>>,
    events: mpsc::Sender<EditorEvent>,
}

impl ClientShared {
    fn emit(&self, event: EditorEvent) {
        if self.events.try_send(event).is_err() {
            log::trace!("Editor event dropped (receiver full or gone)");
        }
    }

    /// Apply one server frame; may return a frame to send back.
    async fn handle_frame(
        &self,
        server: &ServerAddr,
        text: &str,
        tx: &mpsc::Sender<String>,
    ) -> Option<Frame> {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::debug!("Ignoring frame from server: {e}");
                return None;
            }
        };

        match frame {
            Frame::Init { data, client_id } => {
                let mut buffer = self.buffer.lock().await;
                let reply = if buffer.dirty {
                    buffer.dirty = false;
                    log::info!("Sending edits made while offline");
                    Some(Frame::update(buffer.document.clone()))
                } else {
                    buffer.document = data.clone();
                    self.emit(EditorEvent::DocumentReplaced(data));
                    None
                };
                *self.outgoing.lock().await = Some(tx.clone());
                drop(buffer);

                *self.client_id.write().await = Some(client_id.clone());
                self.state.send_replace(ConnectionState::Connected);
                log::info!("Connected to {} as {client_id}", server.addr());
                self.emit(EditorEvent::Connected {
                    server: server.clone(),
                    client_id,
                });
                reply
            }
            Frame::Update { data } => {
                let mut buffer = self.buffer.lock().await;
                if buffer.document != data {
                    buffer.document = data.clone();
                    self.emit(EditorEvent::DocumentReplaced(data));
                }
                None
            }
            Frame::Cursor {
                client_id,
                position,
            } => {
                let Some(client_id) = client_id else {
                    return None;
                };
                if self.client_id.read().await.as_deref() == Some(client_id.as_str()) {
                    return None;
                }
                self.emit(EditorEvent::RemoteCursor {
                    client_id,
                    position: position.max(0) as u64,
                });
                None
            }
        }
    }
}

/// The editor client.
pub struct EditorClient {
    shared: Arc<ClientShared>,
    event_rx: Option<mpsc::Receiver<EditorEvent>>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl EditorClient {
    pub fn new(config: ClientConfig) -> Self {
        let (events, event_rx) = mpsc::channel(256);
        Self {
            shared: Arc::new(ClientShared {
                config,
                state: watch::channel(ConnectionState::Disconnected).0,
                buffer: Mutex::new(LocalBuffer::default()),
                client_id: RwLock::new(None),
                outgoing: Mutex::new(None),
                events,
            }),
            event_rx: Some(event_rx),
            shutdown: watch::channel(false).0,
            task: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<EditorEvent>> {
        self.event_rx.take()
    }

    /// Spawn the discovery/connection supervisor. Calling it twice is a no-op.
    pub fn start(&mut self) {
        if self.task.is_some() {
            return;
        }
        let shared = self.shared.clone();
        let shutdown = self.shutdown.subscribe();
        self.task = Some(tokio::spawn(supervise(shared, shutdown)));
    }

    /// Stop the supervisor and close any open session.
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Replace the local document and send it when connected.
    ///
    /// Waits for room in the session queue; the buffer lock is released
    /// first so the connection task can keep applying server frames.
    pub async fn send_update(&self, text: impl Into<String>) -> Result<(), ClientError> {
        let text = text.into();
        let encoded = Frame::update(text.as_str()).encode()?;
        let outgoing = {
            let mut buffer = self.shared.buffer.lock().await;
            if buffer.document == text {
                return Ok(());
            }
            buffer.document = text;
            let outgoing = self.shared.outgoing.lock().await.clone();
            if outgoing.is_none() {
                buffer.dirty = true;
            }
            outgoing
        };

        if let Some(tx) = outgoing {
            if tx.send(encoded).await.is_err() {
                // Session ended meanwhile; the next init carries it
                self.shared.buffer.lock().await.dirty = true;
            }
        }
        Ok(())
    }

    /// Report the local cursor. Dropped silently while offline.
    pub async fn send_cursor(&self, position: u64) -> Result<(), ClientError> {
        let outgoing = self.shared.outgoing.lock().await.clone();
        if let Some(tx) = outgoing {
            let position = i64::try_from(position).unwrap_or(i64::MAX);
            let _ = tx.send(Frame::local_cursor(position).encode()?).await;
        }
        Ok(())
    }

    pub async fn document(&self) -> String {
        self.shared.buffer.lock().await.document.clone()
    }

    /// Whether local edits are waiting for a session.
    pub async fn has_pending_edits(&self) -> bool {
        self.shared.buffer.lock().await.dirty
    }

    pub async fn client_id(&self) -> Option<String> {
        self.shared.client_id.read().await.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watch connection state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }
}

impl Drop for EditorClient {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn supervise(shared: Arc<ClientShared>, mut shutdown: watch::Receiver<bool>) {
    let mut discovery = Discovery::new(&shared.config);
    let delay = shared.config.reconnect_delay();

    loop {
        if *shutdown.borrow() {
            break;
        }
        shared.state.send_replace(ConnectionState::Probing);

        match discovery.find_main().await {
            Some(server) => {
                if let Err(e) = connect_and_run(&shared, &server, &mut shutdown).await {
                    log::debug!("Session with {} failed: {e}", server.addr());
                }
                let was_connected = *shared.state.borrow() == ConnectionState::Connected;
                *shared.outgoing.lock().await = None;
                shared.state.send_replace(ConnectionState::Disconnected);
                if *shutdown.borrow() {
                    break;
                }
                discovery.record_failure(&server);
                if was_connected {
                    log::info!("Lost connection to {}", server.addr());
                    shared.emit(EditorEvent::Disconnected);
                }
            }
            None => {
                shared.state.send_replace(ConnectionState::Disconnected);
                log::debug!("No main server found");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
    shared.state.send_replace(ConnectionState::Disconnected);
    log::debug!("Editor client stopped");
}

/// Run one session until it closes.
async fn connect_and_run(
    shared: &ClientShared,
    server: &ServerAddr,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), ClientError> {
    let url = server.ws_url();
    let (ws_stream, _) = tokio::time::timeout(
        shared.config.probe_timeout(),
        tokio_tungstenite::connect_async(url.as_str()),
    )
    .await
    .map_err(|_| ClientError::ConnectTimeout(url.clone()))??;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (tx, mut rx) = mpsc::channel::<String>(256);

    loop {
        tokio::select! {
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let reply = shared.handle_frame(server, text.as_str(), &tx).await;
                    if let Some(frame) = reply {
                        ws_sender.send(Message::Text(frame.encode()?.into())).await?;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            },
            Some(text) = rx.recv() => {
                ws_sender.send(Message::Text(text.into())).await?;
            }
            _ = shutdown.changed() => {
                let _ = ws_sender.close().await;
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClientConfig {
        ClientConfig::new(vec![ServerAddr::new("127.0.0.1", 9)])
    }

    #[test]
    fn test_server_addr_urls() {
        let server = ServerAddr::new("localhost", 5001);
        assert_eq!(server.addr(), "localhost:5001");
        assert_eq!(server.ws_url(), "ws://localhost:5001/ws");
    }

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::from_json(
            r#"{"servers":[{"host":"localhost","port":5001},{"host":"localhost","port":5002}]}"#,
        )
        .unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.probe_timeout(), Duration::from_secs(1));
        assert_eq!(config.cooldown(), Duration::from_secs(10));
        assert_eq!(config.reconnect_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_client_config_requires_servers() {
        assert!(ClientConfig::from_json(r#"{"servers":[]}"#).is_err());
        assert!(ClientConfig::from_json("not json").is_err());
    }

    #[tokio::test]
    async fn test_initial_state() {
        let client = EditorClient::new(config());
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert_eq!(client.document().await, "");
        assert!(client.client_id().await.is_none());
    }

    #[tokio::test]
    async fn test_update_waits_for_room_in_full_queue() {
        let client = Arc::new(EditorClient::new(config()));
        let (tx, mut rx) = mpsc::channel::<String>(1);
        tx.try_send("queued".to_string()).unwrap();
        *client.shared.outgoing.lock().await = Some(tx);

        let sender = tokio::spawn({
            let client = client.clone();
            async move { client.send_update("typed").await.unwrap() }
        });

        assert_eq!(rx.recv().await.unwrap(), "queued");
        let sent = Frame::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(sent, Frame::update("typed"));
        sender.await.unwrap();
        assert!(!client.has_pending_edits().await);
        assert_eq!(client.document().await, "typed");
    }

    #[tokio::test]
    async fn test_update_to_closed_session_stays_pending() {
        let client = EditorClient::new(config());
        let (tx, rx) = mpsc::channel::<String>(1);
        drop(rx);
        *client.shared.outgoing.lock().await = Some(tx);

        client.send_update("lost").await.unwrap();
        assert!(client.has_pending_edits().await);
    }

    #[tokio::test]
    async fn test_offline_edits_are_kept() {
        let client = EditorClient::new(config());
        client.send_update("draft").await.unwrap();
        assert_eq!(client.document().await, "draft");
        assert!(client.has_pending_edits().await);

        // Cursor while offline is dropped without error
        client.send_cursor(3).await.unwrap();
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = EditorClient::new(config());
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_discovery_cools_down_dead_server() {
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let server = ServerAddr::new("127.0.0.1", port);
        let mut config = ClientConfig::new(vec![server.clone()]);
        config.probe_timeout_ms = 200;
        let mut discovery = Discovery::new(&config);

        assert!(discovery.find_main().await.is_none());
        assert!(discovery.in_cooldown(&server));
    }

    #[tokio::test]
    async fn test_init_replaces_clean_buffer() {
        let mut client = EditorClient::new(config());
        let mut events = client.take_event_rx().unwrap();
        let server = ServerAddr::new("127.0.0.1", 9);
        let (tx, _rx) = mpsc::channel(4);

        let init = Frame::init("remote", "me").encode().unwrap();
        let reply = client.shared.handle_frame(&server, &init, &tx).await;
        assert!(reply.is_none());
        assert_eq!(client.document().await, "remote");
        assert_eq!(client.connection_state(), ConnectionState::Connected);
        assert_eq!(client.client_id().await.as_deref(), Some("me"));
        assert_eq!(
            events.recv().await,
            Some(EditorEvent::DocumentReplaced("remote".into()))
        );
    }

    #[tokio::test]
    async fn test_init_after_offline_edit_pushes_local_copy() {
        let client = EditorClient::new(config());
        client.send_update("offline work").await.unwrap();
        let server = ServerAddr::new("127.0.0.1", 9);
        let (tx, _rx) = mpsc::channel(4);

        let init = Frame::init("stale", "me").encode().unwrap();
        let reply = client.shared.handle_frame(&server, &init, &tx).await;
        assert_eq!(reply, Some(Frame::update("offline work")));
        assert_eq!(client.document().await, "offline work");
        assert!(!client.has_pending_edits().await);
    }

    #[tokio::test]
    async fn test_own_cursor_is_not_reported() {
        let mut client = EditorClient::new(config());
        let mut events = client.take_event_rx().unwrap();
        let server = ServerAddr::new("127.0.0.1", 9);
        let (tx, _rx) = mpsc::channel(4);
        let init = Frame::init("", "me").encode().unwrap();
        client.shared.handle_frame(&server, &init, &tx).await;
        let _ = events.recv().await; // DocumentReplaced
        let _ = events.recv().await; // Connected

        let own = Frame::cursor("me", 1).encode().unwrap();
        client.shared.handle_frame(&server, &own, &tx).await;
        let other = Frame::cursor("them", 2).encode().unwrap();
        client.shared.handle_frame(&server, &other, &tx).await;

        assert_eq!(
            events.recv().await,
            Some(EditorEvent::RemoteCursor {
                client_id: "them".into(),
                position: 2
            })
        );
    }
}
