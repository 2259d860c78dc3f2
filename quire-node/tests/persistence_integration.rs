//! Persistence integration tests.
//!
//! Verifies:
//! - A Backup writes every replicated state to its snapshot file
//! - A restarted node serves the persisted document to new sessions
//! - Unreadable or missing snapshots never prevent startup

use futures_util::{SinkExt, StreamExt};
use quire_node::config::{NodeConfig, PeerDescriptor};
use quire_node::election::Role;
use quire_node::protocol::Frame;
use quire_node::server::{Node, NodeHandle};
use quire_node::storage::SnapshotFile;
use std::path::Path;
use tempfile::tempdir;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

macro_rules! eventually {
    ($what:expr, $cond:expr) => {{
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if $cond {
                break;
            }
            assert!(Instant::now() < deadline, "timed out waiting for {}", $what);
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }};
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn node_config(id: &str, port: u16, peers: Vec<PeerDescriptor>, snapshot: &Path) -> NodeConfig {
    let mut config = NodeConfig::new(id, port, peers);
    config.host = "127.0.0.1".into();
    config.election_interval_ms = 100;
    config.replication_interval_ms = 100;
    config.peer_timeout_ms = 300;
    config.cooldown_ms = 500;
    config.snapshot_path = Some(snapshot.to_path_buf());
    config
}

async fn start(config: NodeConfig) -> NodeHandle {
    Node::new(config).unwrap().start().await.unwrap()
}

async fn connect(port: u16) -> (Ws, String) {
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/ws"))
        .await
        .unwrap();
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("no init within timeout")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = msg {
            match Frame::decode(text.as_str()).unwrap() {
                Frame::Init { data, .. } => return (ws, data),
                other => panic!("expected init, got {other:?}"),
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_backup_snapshot_survives_restart() {
    let dir = tempdir().unwrap();
    let snap_a = dir.path().join("a.snap");
    let snap_b = dir.path().join("b.snap");
    let (port_a, port_b) = (free_port().await, free_port().await);

    let a = start(node_config(
        "a",
        port_a,
        vec![PeerDescriptor::new("b", "127.0.0.1", port_b)],
        &snap_a,
    ))
    .await;
    eventually!("a to become main", a.role() == Role::Main);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let b_config = node_config(
        "b",
        port_b,
        vec![PeerDescriptor::new("a", "127.0.0.1", port_a)],
        &snap_b,
    );
    let b = start(b_config.clone()).await;
    eventually!("b to become backup", b.role() == Role::Backup);

    let (mut ws, _) = connect(port_a).await;
    ws.send(Message::Text(
        Frame::update("durable text").encode().unwrap().into(),
    ))
    .await
    .unwrap();

    let file = SnapshotFile::new(&snap_b);
    eventually!(
        "snapshot written",
        matches!(file.load().await, Ok(Some(ref s)) if s.document == "durable text")
    );
    // Main does not persist
    assert!(!snap_a.exists());

    a.shutdown().await;
    b.shutdown().await;

    // Restart b alone; it restores, then takes over
    let b = start(b_config).await;
    assert_eq!(b.state().store().read().await.document(), "durable text");
    eventually!("b to become main", b.role() == Role::Main);

    let (_ws, document) = connect(port_b).await;
    assert_eq!(document, "durable text");
    b.shutdown().await;
}

#[tokio::test]
async fn test_corrupt_snapshot_is_ignored() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("node.snap");
    std::fs::write(&path, b"definitely not a snapshot").unwrap();

    let port = free_port().await;
    let node = start(node_config("solo", port, Vec::new(), &path)).await;
    eventually!("node to become main", node.role() == Role::Main);

    let (_ws, document) = connect(port).await;
    assert_eq!(document, "");
    node.shutdown().await;
}

#[tokio::test]
async fn test_missing_snapshot_starts_empty() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("node.snap");

    let port = free_port().await;
    let node = start(node_config("solo", port, Vec::new(), &path)).await;
    assert_eq!(node.state().store().read().await.document(), "");
    assert_eq!(node.state().store().read().await.cursor_count(), 0);
    node.shutdown().await;
}
