//! End-to-end session tests against an in-process WebSocket server.
//!
//! The server records every frame the client transmits and can push
//! operations or drop the connection on command; snapshots come from an
//! in-memory source with fetch counters, so the tests can assert exactly
//! how many resyncs each scenario triggers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;

use async_trait::async_trait;
use nodeloom_client::{
    ConnectionConfig, ConnectionManager, SessionHandle, SnapshotError, SnapshotSource, SyncEvent,
    SyncSession,
};
use nodeloom_types::{
    Edge, Frame, GraphSnapshot, Node, NodeId, Position, Stream, Template, TreeSnapshot, ValueMap,
};

// ── Test doubles ─────────────────────────────────────────────────────────

enum ServerCmd {
    Push(Frame),
    Kick,
}

/// One-connection-at-a-time WebSocket server recording inbound frames.
struct TestServer {
    url: String,
    received: Arc<Mutex<Vec<Frame>>>,
    cmd: mpsc::UnboundedSender<ServerCmd>,
}

impl TestServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let received = Arc::new(Mutex::new(Vec::new()));
        let (cmd, mut cmd_rx) = mpsc::unbounded_channel::<ServerCmd>();

        let recorded = Arc::clone(&received);
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let Ok(mut ws) = tokio_tungstenite::accept_async(socket).await else {
                    continue;
                };
                loop {
                    tokio::select! {
                        cmd = cmd_rx.recv() => match cmd {
                            Some(ServerCmd::Push(frame)) => {
                                let text = serde_json::to_string(&frame).unwrap();
                                if ws.send(Message::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                            Some(ServerCmd::Kick) | None => break,
                        },
                        msg = ws.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                recorded.lock().push(serde_json::from_str(&text).unwrap());
                            }
                            Some(Ok(_)) => {}
                            _ => break,
                        },
                    }
                }
            }
        });

        Self { url, received, cmd }
    }

    fn push(&self, stream: &str, data: serde_json::Value) {
        self.cmd.send(ServerCmd::Push(Frame::new(stream, data))).unwrap();
    }

    fn kick(&self) {
        self.cmd.send(ServerCmd::Kick).unwrap();
    }

    fn subscribes_for(&self, stream: &str) -> usize {
        self.received
            .lock()
            .iter()
            .filter(|f| {
                f.stream == "streams"
                    && f.data["action"] == "subscribe"
                    && f.data["streams"][0] == stream
            })
            .count()
    }

    fn frames_on(&self, stream: &str) -> Vec<serde_json::Value> {
        self.received
            .lock()
            .iter()
            .filter(|f| f.stream == stream)
            .map(|f| f.data.clone())
            .collect()
    }
}

/// In-memory snapshot source counting fetches per domain.
struct MockSnapshots {
    graph: Mutex<GraphSnapshot>,
    files: Mutex<TreeSnapshot>,
    graph_fetches: AtomicUsize,
    files_fetches: AtomicUsize,
}

impl MockSnapshots {
    fn new(graph: GraphSnapshot, files: TreeSnapshot) -> Arc<Self> {
        Arc::new(Self {
            graph: Mutex::new(graph),
            files: Mutex::new(files),
            graph_fetches: AtomicUsize::new(0),
            files_fetches: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl SnapshotSource for MockSnapshots {
    async fn fetch_graph(&self) -> Result<GraphSnapshot, SnapshotError> {
        self.graph_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.graph.lock().clone())
    }

    async fn fetch_files(&self) -> Result<TreeSnapshot, SnapshotError> {
        self.files_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.files.lock().clone())
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────────

/// Route session tracing to the test harness; `RUST_LOG` filters as usual.
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn node(id: u64) -> Node {
    Node {
        id: NodeId(id),
        node_type: "loader".to_string(),
        values: ValueMap::new(),
        position: Position::default(),
    }
}

fn graph_snapshot(version: u64, nodes: Vec<Node>) -> GraphSnapshot {
    let mut templates = indexmap::IndexMap::new();
    templates.insert("loader".to_string(), Template::default());
    GraphSnapshot { version, templates, nodes, edges: vec![] }
}

fn files_snapshot(version: u64) -> TreeSnapshot {
    TreeSnapshot {
        version,
        tree: serde_json::from_value(serde_json::json!({"models": {"sd15.ckpt": null}})).unwrap(),
    }
}

async fn start_session(server: &TestServer, snapshots: Arc<MockSnapshots>) -> SessionHandle {
    init_tracing();
    let cfg = ConnectionConfig {
        url: server.url.clone(),
        reconnect_delay: Duration::from_millis(50),
    };
    SyncSession::spawn(ConnectionManager::new(cfg), snapshots)
}

/// Wait for the first event matching `pred`, failing after two seconds.
async fn wait_for(
    rx: &mut broadcast::Receiver<SyncEvent>,
    mut pred: impl FnMut(&SyncEvent) -> bool,
) -> SyncEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll until the server has recorded `expected` subscribe frames for
/// `stream`. The local `Resynced` event races the frame's arrival over the
/// socket, so server-side assertions must await the recorder, not the event.
async fn wait_subscribes(server: &TestServer, stream: &str, expected: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while server.subscribes_for(stream) < expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for subscribe frames");
    assert_eq!(server.subscribes_for(stream), expected);
}

async fn wait_synced(rx: &mut broadcast::Receiver<SyncEvent>) {
    let mut graph = false;
    let mut files = false;
    wait_for(rx, |e| {
        match e {
            SyncEvent::Resynced { stream: Stream::Graph } => graph = true,
            SyncEvent::Resynced { stream: Stream::Files } => files = true,
            _ => {}
        }
        graph && files
    })
    .await;
}

// ── Scenarios ────────────────────────────────────────────────────────────

#[tokio::test]
async fn initial_sync_subscribes_and_fetches_each_domain_once() {
    let server = TestServer::start().await;
    let snapshots = MockSnapshots::new(graph_snapshot(5, vec![node(1)]), files_snapshot(2));
    let handle = start_session(&server, Arc::clone(&snapshots)).await;
    let mut events = handle.subscribe();

    wait_synced(&mut events).await;

    assert_eq!(snapshots.graph_fetches.load(Ordering::SeqCst), 1);
    assert_eq!(snapshots.files_fetches.load(Ordering::SeqCst), 1);
    wait_subscribes(&server, "graph", 1).await;
    wait_subscribes(&server, "files", 1).await;
    assert_eq!(handle.graph_version().await.unwrap(), 5);
    assert_eq!(handle.files_version().await.unwrap(), 2);
    assert_eq!(handle.nodes().await.unwrap().len(), 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn in_order_delete_applies_without_refetch() {
    let server = TestServer::start().await;
    let snapshots = MockSnapshots::new(graph_snapshot(5, vec![node(1)]), files_snapshot(2));
    let handle = start_session(&server, Arc::clone(&snapshots)).await;
    let mut events = handle.subscribe();
    wait_synced(&mut events).await;

    server.push("graph", serde_json::json!({"version": 6, "action": "delete_node", "id": 1}));
    wait_for(&mut events, |e| *e == SyncEvent::GraphChanged { version: 6 }).await;

    assert!(handle.nodes().await.unwrap().is_empty());
    assert_eq!(snapshots.graph_fetches.load(Ordering::SeqCst), 1);

    handle.shutdown().await;
}

#[tokio::test]
async fn version_gap_triggers_exactly_one_refetch() {
    let server = TestServer::start().await;
    let snapshots = MockSnapshots::new(graph_snapshot(5, vec![node(1)]), files_snapshot(2));
    let handle = start_session(&server, Arc::clone(&snapshots)).await;
    let mut events = handle.subscribe();
    wait_synced(&mut events).await;

    // The server is now at v9; make the refetched snapshot reflect that.
    *snapshots.graph.lock() = graph_snapshot(9, vec![node(7)]);
    server.push("graph", serde_json::json!({"version": 9, "action": "delete_node", "id": 1}));

    wait_for(&mut events, |e| *e == SyncEvent::Resynced { stream: Stream::Graph }).await;

    assert_eq!(snapshots.graph_fetches.load(Ordering::SeqCst), 2);
    // The gap only concerned the graph domain.
    assert_eq!(snapshots.files_fetches.load(Ordering::SeqCst), 1);
    // Still subscribed from the initial sync; a gap refetches only.
    wait_subscribes(&server, "graph", 1).await;
    assert_eq!(handle.graph_version().await.unwrap(), 9);
    assert_eq!(handle.nodes().await.unwrap()[0].id, NodeId(7));

    handle.shutdown().await;
}

#[tokio::test]
async fn reconnect_resubscribes_and_resyncs_once_per_domain() {
    let server = TestServer::start().await;
    let snapshots = MockSnapshots::new(graph_snapshot(5, vec![node(1)]), files_snapshot(2));
    let handle = start_session(&server, Arc::clone(&snapshots)).await;
    let mut events = handle.subscribe();
    wait_synced(&mut events).await;
    // Drain the initial subscribe frames before kicking; the server drops
    // unread frames when it honors the kick.
    wait_subscribes(&server, "graph", 1).await;
    wait_subscribes(&server, "files", 1).await;

    // State moved on while we were away.
    *snapshots.graph.lock() = graph_snapshot(11, vec![]);
    server.kick();
    wait_for(&mut events, |e| *e == SyncEvent::Disconnected).await;

    wait_for(&mut events, |e| *e == SyncEvent::Connected).await;
    wait_synced(&mut events).await;

    assert_eq!(snapshots.graph_fetches.load(Ordering::SeqCst), 2);
    assert_eq!(snapshots.files_fetches.load(Ordering::SeqCst), 2);
    wait_subscribes(&server, "graph", 2).await;
    wait_subscribes(&server, "files", 2).await;
    assert_eq!(handle.graph_version().await.unwrap(), 11);
    assert!(handle.nodes().await.unwrap().is_empty());

    handle.shutdown().await;
}

#[tokio::test]
async fn optimistic_add_node_transmits_the_stamped_operation() {
    let server = TestServer::start().await;
    let snapshots = MockSnapshots::new(graph_snapshot(5, vec![]), files_snapshot(2));
    let handle = start_session(&server, Arc::clone(&snapshots)).await;
    let mut events = handle.subscribe();
    wait_synced(&mut events).await;

    let id = handle.add_node("loader", Position::new(1.0, 2.0)).await.unwrap();
    assert_eq!(id, NodeId(6));
    assert_eq!(handle.graph_version().await.unwrap(), 6);

    // The operation reached the wire with the bumped version.
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let ops = server.frames_on("graph");
            if let Some(op) = ops.first() {
                assert_eq!(op["action"], "create_node");
                assert_eq!(op["version"], 6);
                assert_eq!(op["node"]["id"], 6);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("operation never transmitted");

    // The server echo is a duplicate: applied exactly once.
    server.push(
        "graph",
        serde_json::json!({
            "version": 6,
            "action": "create_node",
            "node": {"id": 6, "type": "loader", "values": {}, "position": {"x": 1.0, "y": 2.0}}
        }),
    );
    server.push("graph", serde_json::json!({"version": 7, "action": "delete_node", "id": 6}));
    wait_for(&mut events, |e| *e == SyncEvent::GraphChanged { version: 7 }).await;
    assert!(handle.nodes().await.unwrap().is_empty());

    handle.shutdown().await;
}

#[tokio::test]
async fn file_tree_updates_flow_into_node_defaults() {
    let server = TestServer::start().await;
    let snapshots = MockSnapshots::new(graph_snapshot(5, vec![]), files_snapshot(2));
    let handle = start_session(&server, Arc::clone(&snapshots)).await;
    let mut events = handle.subscribe();
    wait_synced(&mut events).await;

    server.push(
        "files",
        serde_json::json!({
            "version": 3,
            "action": "replace_tree",
            "tree": {"models": {"sd21.safetensors": null}}
        }),
    );
    wait_for(&mut events, |e| *e == SyncEvent::FilesChanged { version: 3 }).await;

    let sub = handle.subtree(vec!["models".to_string()]).await.unwrap();
    assert!(sub.0.contains_key("sd21.safetensors"));
    assert!(!sub.0.contains_key("sd15.ckpt"));

    handle.shutdown().await;
}

#[tokio::test]
async fn mutations_are_rejected_while_disconnected() {
    // No server listening: connect never succeeds.
    init_tracing();
    let snapshots = MockSnapshots::new(graph_snapshot(0, vec![]), files_snapshot(0));
    let cfg = ConnectionConfig {
        url: "ws://127.0.0.1:9".to_string(),
        reconnect_delay: Duration::from_millis(50),
    };
    let handle = SyncSession::spawn(ConnectionManager::new(cfg), snapshots);

    let err = handle.add_node("loader", Position::default()).await.unwrap_err();
    assert!(matches!(err, nodeloom_client::SessionError::NotConnected));
    // Nothing mutated, nothing queued.
    assert_eq!(handle.graph_version().await.unwrap(), 0);
    assert!(handle.nodes().await.unwrap().is_empty());

    handle.shutdown().await;
}

#[tokio::test]
async fn edge_rejection_leaves_state_untouched() {
    let server = TestServer::start().await;

    // Loader outputs a "path"; sampler wants a "number".
    let mut graph = graph_snapshot(5, vec![node(1)]);
    let loader = graph.templates.get_mut("loader").unwrap();
    loader.outputs.insert(
        "ckpt".to_string(),
        nodeloom_types::HandleSpec { name: "Checkpoint".to_string(), ty: "path".to_string() },
    );
    let mut sampler = Template::default();
    sampler.inputs.insert(
        "steps".to_string(),
        nodeloom_types::HandleSpec { name: "Steps".to_string(), ty: "number".to_string() },
    );
    graph.templates.insert("sampler".to_string(), sampler);
    graph.nodes.push(Node {
        id: NodeId(2),
        node_type: "sampler".to_string(),
        values: ValueMap::new(),
        position: Position::default(),
    });

    let snapshots = MockSnapshots::new(graph, files_snapshot(2));
    let handle = start_session(&server, Arc::clone(&snapshots)).await;
    let mut events = handle.subscribe();
    wait_synced(&mut events).await;

    assert!(
        !handle
            .connection_valid(NodeId(1), Some("ckpt"), NodeId(2), Some("steps"))
            .await
            .unwrap()
    );
    let err = handle.add_edge(NodeId(1), "ckpt", NodeId(2), "steps").await.unwrap_err();
    assert!(matches!(err, nodeloom_client::SessionError::Graph(_)));

    assert!(handle.edges().await.unwrap().is_empty());
    assert_eq!(handle.graph_version().await.unwrap(), 5);
    assert!(server.frames_on("graph").is_empty());

    handle.shutdown().await;
}

// Scenario: a valid edge lands on the wire with the derived ID.
#[tokio::test]
async fn valid_edge_is_created_and_transmitted() {
    let server = TestServer::start().await;

    let mut graph = graph_snapshot(5, vec![node(1)]);
    let loader = graph.templates.get_mut("loader").unwrap();
    loader.outputs.insert(
        "unet".to_string(),
        nodeloom_types::HandleSpec { name: "UNet".to_string(), ty: "unet".to_string() },
    );
    let mut sampler = Template::default();
    sampler.inputs.insert(
        "model".to_string(),
        nodeloom_types::HandleSpec { name: "Model".to_string(), ty: "unet".to_string() },
    );
    graph.templates.insert("sampler".to_string(), sampler);
    graph.nodes.push(Node {
        id: NodeId(2),
        node_type: "sampler".to_string(),
        values: ValueMap::new(),
        position: Position::default(),
    });

    let snapshots = MockSnapshots::new(graph, files_snapshot(2));
    let handle = start_session(&server, Arc::clone(&snapshots)).await;
    let mut events = handle.subscribe();
    wait_synced(&mut events).await;

    let id = handle.add_edge(NodeId(1), "unet", NodeId(2), "model").await.unwrap();
    assert_eq!(id, Edge::derive_id(NodeId(1), "unet", NodeId(2), "model"));
    assert_eq!(handle.edges().await.unwrap().len(), 1);

    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let ops = server.frames_on("graph");
            if let Some(op) = ops.first() {
                assert_eq!(op["action"], "create_edge");
                assert_eq!(op["version"], 6);
                assert_eq!(op["edge"]["sourceHandle"], "unet");
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("operation never transmitted");

    handle.shutdown().await;
}
