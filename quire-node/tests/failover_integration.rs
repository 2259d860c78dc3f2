//! Two-node integration tests: election, replication, write rejection on
//! the Backup and client failover when Main goes away.

use futures_util::{SinkExt, StreamExt};
use quire_node::client::{ClientConfig, ConnectionState, EditorClient, EditorEvent, ServerAddr};
use quire_node::config::{NodeConfig, PeerDescriptor};
use quire_node::election::Role;
use quire_node::peer::PeerClient;
use quire_node::protocol::Frame;
use quire_node::server::{Node, NodeHandle};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
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

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn node_config(id: &str, port: u16, peer_id: &str, peer_port: u16) -> NodeConfig {
    let peers = vec![PeerDescriptor::new(peer_id, "127.0.0.1", peer_port)];
    let mut config = NodeConfig::new(id, port, peers);
    config.host = "127.0.0.1".into();
    config.election_interval_ms = 100;
    config.replication_interval_ms = 100;
    config.peer_timeout_ms = 300;
    config.cooldown_ms = 500;
    config.sweep_interval_ms = 100;
    config
}

/// Start "a" first, then "b"; "a" ends up Main by uptime.
async fn start_pair() -> (NodeHandle, u16, NodeHandle, u16) {
    let (port_a, port_b) = (free_port().await, free_port().await);

    let a = Node::new(node_config("a", port_a, "b", port_b))
        .unwrap()
        .start()
        .await
        .unwrap();
    eventually!("a to become main", a.role() == Role::Main);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let b = Node::new(node_config("b", port_b, "a", port_a))
        .unwrap()
        .start()
        .await
        .unwrap();
    eventually!("b to become backup", b.role() == Role::Backup);
    assert_eq!(b.state().elector().state().leader_id.as_deref(), Some("a"));

    (a, port_a, b, port_b)
}

async fn recv_frame(ws: &mut Ws) -> Option<Frame> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return Some(Frame::decode(text.as_str()).unwrap()),
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
            Some(Ok(_)) => continue,
        }
    }
}

async fn next_frame(ws: &mut Ws) -> Frame {
    timeout(Duration::from_secs(2), recv_frame(ws))
        .await
        .expect("no frame within timeout")
        .expect("connection closed")
}

async fn connect(port: u16) -> (Ws, String) {
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/ws"))
        .await
        .unwrap();
    match next_frame(&mut ws).await {
        Frame::Init { data, .. } => (ws, data),
        other => panic!("expected init, got {other:?}"),
    }
}

async fn send(ws: &mut Ws, frame: Frame) {
    ws.send(Message::Text(frame.encode().unwrap().into()))
        .await
        .unwrap();
}

async fn wait_connected(events: &mut mpsc::Receiver<EditorEvent>) -> ServerAddr {
    loop {
        match timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
            Some(EditorEvent::Connected { server, .. }) => return server,
            Some(_) => continue,
            None => panic!("event channel closed"),
        }
    }
}

#[tokio::test]
async fn test_backup_replicates_main() {
    let (a, port_a, b, port_b) = start_pair().await;
    let (mut c1, _) = connect(port_a).await;
    let (mut c2, _) = connect(port_a).await;

    send(&mut c1, Frame::update("hello")).await;
    assert_eq!(next_frame(&mut c2).await, Frame::update("hello"));

    eventually!(
        "b to replicate",
        b.state().store().read().await.document() == "hello"
    );

    let peers = PeerClient::new(Duration::from_secs(1));
    let health = peers.health(&format!("127.0.0.1:{port_b}")).await.unwrap();
    assert_eq!(health.role, Role::Backup);
    assert_eq!(health.main.as_deref(), Some("a"));

    let election = peers
        .trigger_election(&format!("127.0.0.1:{port_b}"))
        .await
        .unwrap();
    assert_eq!(election.role, Role::Backup);
    assert_eq!(election.main.as_deref(), Some("a"));

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_backup_refuses_writes() {
    let (a, port_a, b, port_b) = start_pair().await;
    let (mut on_a, _) = connect(port_a).await;
    send(&mut on_a, Frame::update("authoritative")).await;
    eventually!(
        "b to replicate",
        b.state().store().read().await.document() == "authoritative"
    );

    let (mut on_b, document) = connect(port_b).await;
    assert_eq!(document, "authoritative");
    send(&mut on_b, Frame::update("diverged")).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(a.state().store().read().await.document(), "authoritative");
    assert_eq!(b.state().store().read().await.document(), "authoritative");

    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test]
async fn test_failover_to_backup() {
    let (a, port_a, b, port_b) = start_pair().await;

    let mut config = ClientConfig::new(vec![
        ServerAddr::new("127.0.0.1", port_a),
        ServerAddr::new("127.0.0.1", port_b),
    ]);
    config.probe_timeout_ms = 300;
    config.reconnect_delay_ms = 100;
    let mut editor = EditorClient::new(config);
    let mut events = editor.take_event_rx().unwrap();
    editor.start();
    assert_eq!(wait_connected(&mut events).await.port, port_a);

    let (mut raw_a, _) = connect(port_a).await;
    editor.send_update("hello").await.unwrap();
    assert_eq!(next_frame(&mut raw_a).await, Frame::update("hello"));
    eventually!(
        "b to replicate",
        b.state().store().read().await.document() == "hello"
    );

    // Main goes away
    a.shutdown().await;
    assert!(timeout(Duration::from_secs(2), recv_frame(&mut raw_a))
        .await
        .unwrap()
        .is_none());

    eventually!("b to take over", b.role() == Role::Main);
    let health = PeerClient::new(Duration::from_secs(1))
        .health(&format!("127.0.0.1:{port_b}"))
        .await
        .unwrap();
    assert_eq!(health.role, Role::Main);
    assert_eq!(health.main.as_deref(), Some("b"));

    // Client rediscovers and lands on the new Main
    assert_eq!(wait_connected(&mut events).await.port, port_b);
    assert_eq!(editor.connection_state(), ConnectionState::Connected);
    assert_eq!(editor.document().await, "hello");

    editor.send_update("hello again").await.unwrap();
    eventually!(
        "new main to accept edits",
        b.state().store().read().await.document() == "hello again"
    );

    let (_raw_b, document) = connect(port_b).await;
    assert_eq!(document, "hello again");

    editor.stop().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_demoted_main_closes_its_sessions() {
    let (port_a, port_b) = (free_port().await, free_port().await);

    // "a" starts its uptime clock now but only listens later
    let a = Node::new(node_config("a", port_a, "b", port_b)).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let b = Node::new(node_config("b", port_b, "a", port_a))
        .unwrap()
        .start()
        .await
        .unwrap();
    eventually!("b to become main", b.role() == Role::Main);

    let mut config = ClientConfig::new(vec![
        ServerAddr::new("127.0.0.1", port_b),
        ServerAddr::new("127.0.0.1", port_a),
    ]);
    config.probe_timeout_ms = 300;
    config.reconnect_delay_ms = 100;
    let mut editor = EditorClient::new(config);
    let mut events = editor.take_event_rx().unwrap();
    editor.start();
    assert_eq!(wait_connected(&mut events).await.port, port_b);
    let (mut raw_b, _) = connect(port_b).await;

    // An older node appears and wins the next round
    let a = a.start().await.unwrap();
    eventually!("a to become main", a.role() == Role::Main);
    eventually!("b to step down", b.role() == Role::Backup);

    let closed = timeout(Duration::from_secs(3), async {
        while recv_frame(&mut raw_b).await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "session on the demoted node stayed open");
    eventually!(
        "b to drop its sessions",
        b.state().hub().session_count().await == 0
    );

    // The editor goes looking for Main again and finds "a"
    assert_eq!(wait_connected(&mut events).await.port, port_a);
    editor.send_update("after failover").await.unwrap();
    eventually!(
        "a to accept edits",
        a.state().store().read().await.document() == "after failover"
    );

    editor.stop().await;
    a.shutdown().await;
    b.shutdown().await;
}
