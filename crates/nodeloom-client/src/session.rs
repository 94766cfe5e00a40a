//! The sync session actor: one task owning both domain stores.
//!
//! All store access is serialized through an mpsc command channel, so the
//! ordering guarantees of the version gates hold without locks around the
//! stores. The actor multiplexes three inputs in a single `select!` loop:
//!
//! ```text
//!   SessionHandle (Clone)        mpsc       SyncSession (tokio::spawn)
//!   ┌──────────────────────┐  ─────────▶  ┌───────────────────────────┐
//!   │ .add_node()          │              │ GraphStore + FileTreeStore│
//!   │ .remove_edge()       │  ◀─────────  │ ConnectionManager events  │
//!   │ .nodes() / .tree()   │   oneshot    │ SnapshotSource fetches    │
//!   └──────────────────────┘              └───────────────────────────┘
//! ```
//!
//! Resync discipline: a connection `Open` triggers subscribe + snapshot
//! fetch for every active stream; a gap, unknown target, or server command
//! triggers a fetch (no re-subscribe) for that stream only. The fetch is
//! awaited inline, so exactly one resync runs per trigger and no operation
//! is applied while it is in flight.

use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use nodeloom_types::{
    CONTROL_STREAM, ControlMessage, DirectoryTree, Edge, EdgeId, Frame, GraphOperation, Node,
    NodeId, Position, Stream, TreeOperation, ValueMap,
};

use crate::connection::{ConnectionConfig, ConnectionManager, LinkError, LinkEvent};
use crate::constants::{DEFAULT_API_URL, DEFAULT_WS_URL, RECONNECT_DELAY, SYNC_EVENT_BUFFER};
use crate::files::FileTreeStore;
use crate::graph::{ConnectionRequest, GraphError, GraphStore};
use crate::snapshot::{HttpSnapshots, SnapshotSource};
use crate::version::{RemoteOutcome, SyncFault};

// ============================================================================
// Configuration
// ============================================================================

/// Session configuration: endpoints plus the reconnect cadence.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Duplex endpoint.
    pub ws_url: String,
    /// Snapshot API base.
    pub api_url: String,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: std::time::Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            reconnect_delay: RECONNECT_DELAY,
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

/// Errors surfaced to [`SessionHandle`] callers.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Mutations are rejected while the link is down; nothing is queued.
    #[error("not connected to server")]
    NotConnected,
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("session shut down")]
    Shutdown,
}

// ============================================================================
// Observer Events
// ============================================================================

/// Notifications published to session observers (a UI layer, tests).
#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// Graph state changed (remote apply, local mutation, or snapshot).
    GraphChanged { version: u64 },
    /// File mirror changed.
    FilesChanged { version: u64 },
    /// A full resync of `stream` completed.
    Resynced { stream: Stream },
    /// A protocol fault or failed snapshot fetch on `stream`.
    Fault { stream: Stream, message: String },
}

// ============================================================================
// Commands (internal)
// ============================================================================

/// Internal command sent from SessionHandle → SyncSession via mpsc.
enum Command {
    // Graph mutation
    AddNode {
        node_type: String,
        position: Position,
        reply: oneshot::Sender<Result<NodeId, SessionError>>,
    },
    RemoveNode {
        id: NodeId,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    UpdateNodePosition {
        id: NodeId,
        position: Position,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    UpdateNodeValues {
        id: NodeId,
        values: ValueMap,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    AddEdge {
        source: NodeId,
        source_handle: String,
        target: NodeId,
        target_handle: String,
        reply: oneshot::Sender<Result<EdgeId, SessionError>>,
    },
    RemoveEdge {
        id: EdgeId,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },

    // Validation
    ConnectionValid {
        source: NodeId,
        source_handle: Option<String>,
        target: NodeId,
        target_handle: Option<String>,
        reply: oneshot::Sender<Result<bool, SessionError>>,
    },

    // State reads
    Nodes {
        reply: oneshot::Sender<Vec<Node>>,
    },
    Edges {
        reply: oneshot::Sender<Vec<Edge>>,
    },
    Templates {
        reply: oneshot::Sender<IndexMap<String, nodeloom_types::Template>>,
    },
    GraphVersion {
        reply: oneshot::Sender<u64>,
    },
    Subtree {
        path: Vec<String>,
        reply: oneshot::Sender<DirectoryTree>,
    },
    FilesVersion {
        reply: oneshot::Sender<u64>,
    },

    // Subscription control
    SetActive {
        stream: Stream,
        active: bool,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },

    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ============================================================================
// SessionHandle (public API)
// ============================================================================

/// Cloneable handle to a running [`SyncSession`].
///
/// Each method sends a command via mpsc and awaits the oneshot reply.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SyncEvent>,
}

impl SessionHandle {
    /// Subscribe to session notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    // ── Graph mutation ───────────────────────────────────────────────────

    /// Create a node of `node_type` at `position` with template defaults,
    /// apply it locally, and transmit it. Returns the tentative node ID.
    pub async fn add_node(
        &self,
        node_type: &str,
        position: Position,
    ) -> Result<NodeId, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::AddNode { node_type: node_type.to_string(), position, reply })
            .map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)?
    }

    /// Delete a node and its incident edges.
    pub async fn remove_node(&self, id: NodeId) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::RemoveNode { id, reply }).map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)?
    }

    /// Move a node.
    pub async fn update_node_position(
        &self,
        id: NodeId,
        position: Position,
    ) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::UpdateNodePosition { id, position, reply })
            .map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)?
    }

    /// Merge parameter values into a node.
    pub async fn update_node_values(
        &self,
        id: NodeId,
        values: ValueMap,
    ) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::UpdateNodeValues { id, values, reply })
            .map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)?
    }

    /// Connect an output handle to an input handle of matching type.
    pub async fn add_edge(
        &self,
        source: NodeId,
        source_handle: &str,
        target: NodeId,
        target_handle: &str,
    ) -> Result<EdgeId, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::AddEdge {
                source,
                source_handle: source_handle.to_string(),
                target,
                target_handle: target_handle.to_string(),
                reply,
            })
            .map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)?
    }

    /// Disconnect an edge.
    pub async fn remove_edge(&self, id: EdgeId) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::RemoveEdge { id, reply }).map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)?
    }

    /// Check whether a proposed connection would be type-valid.
    pub async fn connection_valid(
        &self,
        source: NodeId,
        source_handle: Option<&str>,
        target: NodeId,
        target_handle: Option<&str>,
    ) -> Result<bool, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::ConnectionValid {
                source,
                source_handle: source_handle.map(String::from),
                target,
                target_handle: target_handle.map(String::from),
                reply,
            })
            .map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)?
    }

    // ── State reads ──────────────────────────────────────────────────────

    pub async fn nodes(&self) -> Result<Vec<Node>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Nodes { reply }).map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)
    }

    pub async fn edges(&self) -> Result<Vec<Edge>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Edges { reply }).map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)
    }

    pub async fn templates(
        &self,
    ) -> Result<IndexMap<String, nodeloom_types::Template>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Templates { reply }).map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)
    }

    pub async fn graph_version(&self) -> Result<u64, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::GraphVersion { reply }).map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)
    }

    /// The file subtree under `path` (empty for unresolvable paths).
    pub async fn subtree(&self, path: Vec<String>) -> Result<DirectoryTree, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Subtree { path, reply }).map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)
    }

    pub async fn files_version(&self) -> Result<u64, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::FilesVersion { reply }).map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)
    }

    // ── Subscription control ─────────────────────────────────────────────

    /// Activate or deactivate a domain stream. Activation resyncs it
    /// immediately if the link is open; deactivation unsubscribes.
    pub async fn set_active(&self, stream: Stream, active: bool) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::SetActive { stream, active, reply })
            .map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)?
    }

    /// Close the connection and stop the actor. Resolves once the actor
    /// has drained.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

// ============================================================================
// SyncSession (the actor)
// ============================================================================

/// The actor task. Owns both stores; never shared.
pub struct SyncSession {
    conn: ConnectionManager,
    snapshots: Arc<dyn SnapshotSource>,
    graph: GraphStore,
    files: FileTreeStore,
    /// Streams the session keeps subscribed and synced.
    active: Vec<Stream>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncSession {
    /// Start a session from configuration, wiring the production transport
    /// and snapshot client.
    pub fn start(cfg: SessionConfig) -> SessionHandle {
        let conn = ConnectionManager::new(ConnectionConfig {
            url: cfg.ws_url,
            reconnect_delay: cfg.reconnect_delay,
        });
        Self::spawn(conn, Arc::new(HttpSnapshots::new(cfg.api_url)))
    }

    /// Spawn a session over `conn`, subscribed to both domains.
    ///
    /// Starts the connection run loop itself so the first `Open` is never
    /// missed.
    pub fn spawn(conn: ConnectionManager, snapshots: Arc<dyn SnapshotSource>) -> SessionHandle {
        let (events, _) = broadcast::channel(SYNC_EVENT_BUFFER);
        let (tx, rx) = mpsc::unbounded_channel();

        let link_rx = conn.subscribe();
        conn.connect();

        let session = SyncSession {
            conn,
            snapshots,
            graph: GraphStore::new(),
            files: FileTreeStore::new(),
            active: vec![Stream::Graph, Stream::Files],
            events: events.clone(),
        };
        tokio::spawn(session.run(rx, link_rx));

        SessionHandle { tx, events }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut link: broadcast::Receiver<LinkEvent>,
    ) {
        loop {
            tokio::select! {
                event = link.recv() => match event {
                    Ok(LinkEvent::Open) => {
                        let _ = self.events.send(SyncEvent::Connected);
                        self.resync_all(true).await;
                    }
                    Ok(LinkEvent::Closed) => {
                        let _ = self.events.send(SyncEvent::Disconnected);
                    }
                    Ok(LinkEvent::Frame(frame)) => self.handle_frame(frame).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        // Dropped frames are indistinguishable from a gap.
                        warn!("link events lagged by {missed}, resyncing");
                        self.resync_all(false).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        self.conn.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    // All handles dropped.
                    None => {
                        self.conn.shutdown();
                        break;
                    }
                },
            }
        }
        info!("sync session stopped");
    }

    // ── Inbound frames ───────────────────────────────────────────────────

    async fn handle_frame(&mut self, frame: Frame) {
        let Some(stream) = Stream::parse(&frame.stream) else {
            debug!("ignoring frame for unknown stream `{}`", frame.stream);
            return;
        };
        if !self.active.contains(&stream) {
            debug!("ignoring frame for inactive stream `{stream}`");
            return;
        }
        let outcome = match stream {
            Stream::Graph => match serde_json::from_value::<GraphOperation>(frame.data) {
                Ok(op) => self.graph.apply_remote(op),
                Err(e) => Err(SyncFault::Malformed { stream: "graph", source: e }),
            },
            Stream::Files => match serde_json::from_value::<TreeOperation>(frame.data) {
                Ok(op) => self.files.apply_remote(op),
                Err(e) => Err(SyncFault::Malformed { stream: "files", source: e }),
            },
        };
        match outcome {
            Ok(RemoteOutcome::Applied { version }) => {
                let _ = self.events.send(match stream {
                    Stream::Graph => SyncEvent::GraphChanged { version },
                    Stream::Files => SyncEvent::FilesChanged { version },
                });
            }
            Ok(RemoteOutcome::Stale) => {}
            Ok(RemoteOutcome::ResyncNeeded(reason)) => {
                info!("resyncing `{stream}`: {reason:?}");
                // Already subscribed; only the state needs refetching.
                self.resync(stream, false).await;
            }
            Err(fault) => {
                warn!("{fault}");
                let _ = self.events.send(SyncEvent::Fault { stream, message: fault.to_string() });
            }
        }
    }

    // ── Resync ───────────────────────────────────────────────────────────

    async fn resync_all(&mut self, resubscribe: bool) {
        for stream in self.active.clone() {
            self.resync(stream, resubscribe).await;
        }
    }

    /// One full resync of `stream`: optional subscribe, then an inline
    /// snapshot fetch and wholesale install. Awaiting the fetch here keeps
    /// the actor from applying operations against pre-snapshot state.
    async fn resync(&mut self, stream: Stream, resubscribe: bool) {
        if resubscribe && let Err(e) = self.send_control(ControlMessage::subscribe(stream)) {
            warn!("subscribe to `{stream}` failed: {e}");
            return;
        }
        match stream {
            Stream::Graph => {
                self.graph.begin_sync();
                match self.snapshots.fetch_graph().await {
                    Ok(snapshot) => {
                        let version = snapshot.version;
                        self.graph.install_snapshot(snapshot);
                        let _ = self.events.send(SyncEvent::Resynced { stream });
                        let _ = self.events.send(SyncEvent::GraphChanged { version });
                    }
                    Err(e) => {
                        warn!("graph snapshot fetch failed: {e}");
                        self.graph.invalidate();
                        let _ = self
                            .events
                            .send(SyncEvent::Fault { stream, message: e.to_string() });
                    }
                }
            }
            Stream::Files => {
                self.files.begin_sync();
                match self.snapshots.fetch_files().await {
                    Ok(snapshot) => {
                        let version = snapshot.version;
                        self.files.install_snapshot(snapshot);
                        let _ = self.events.send(SyncEvent::Resynced { stream });
                        let _ = self.events.send(SyncEvent::FilesChanged { version });
                    }
                    Err(e) => {
                        warn!("files snapshot fetch failed: {e}");
                        self.files.invalidate();
                        let _ = self
                            .events
                            .send(SyncEvent::Fault { stream, message: e.to_string() });
                    }
                }
            }
        }
    }

    fn send_control(&self, msg: ControlMessage) -> Result<(), LinkError> {
        self.conn.send(CONTROL_STREAM, serde_json::to_value(&msg)?)
    }

    // ── Commands ─────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::AddNode { node_type, position, reply } => {
                let result = self.mutate(|s| {
                    let tree = s.files.tree().clone();
                    s.graph.add_node(&node_type, position, &tree)
                });
                let _ = reply.send(result);
            }
            Command::RemoveNode { id, reply } => {
                let result = self.mutate(|s| s.graph.remove_node(id).map(|op| ((), op)));
                let _ = reply.send(result);
            }
            Command::UpdateNodePosition { id, position, reply } => {
                let result =
                    self.mutate(|s| s.graph.update_node_position(id, position).map(|op| ((), op)));
                let _ = reply.send(result);
            }
            Command::UpdateNodeValues { id, values, reply } => {
                let result =
                    self.mutate(|s| s.graph.update_node_values(id, values).map(|op| ((), op)));
                let _ = reply.send(result);
            }
            Command::AddEdge { source, source_handle, target, target_handle, reply } => {
                let result = self
                    .mutate(|s| s.graph.add_edge(source, &source_handle, target, &target_handle));
                let _ = reply.send(result);
            }
            Command::RemoveEdge { id, reply } => {
                let result = self.mutate(|s| s.graph.remove_edge(&id).map(|op| ((), op)));
                let _ = reply.send(result);
            }
            Command::ConnectionValid { source, source_handle, target, target_handle, reply } => {
                let request = ConnectionRequest {
                    source,
                    source_handle: source_handle.as_deref(),
                    target,
                    target_handle: target_handle.as_deref(),
                };
                let _ = reply.send(self.graph.connection_valid(&request).map_err(Into::into));
            }
            Command::Nodes { reply } => {
                let _ = reply.send(self.graph.nodes().cloned().collect());
            }
            Command::Edges { reply } => {
                let _ = reply.send(self.graph.edges().cloned().collect());
            }
            Command::Templates { reply } => {
                let _ = reply.send(self.graph.templates().clone());
            }
            Command::GraphVersion { reply } => {
                let _ = reply.send(self.graph.version());
            }
            Command::Subtree { path, reply } => {
                let _ = reply.send(self.files.subtree(&path).clone());
            }
            Command::FilesVersion { reply } => {
                let _ = reply.send(self.files.version());
            }
            Command::SetActive { stream, active, reply } => {
                let _ = reply.send(self.set_active(stream, active).await);
            }
            // Handled in the run loop.
            Command::Shutdown { .. } => unreachable!("shutdown is handled by the run loop"),
        }
    }

    /// Shared optimistic-mutation path: reject while disconnected, run the
    /// store mutator, transmit the operation it hands back, notify
    /// observers.
    fn mutate<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<(T, GraphOperation), GraphError>,
    ) -> Result<T, SessionError> {
        if !self.conn.is_open() {
            return Err(SessionError::NotConnected);
        }
        let (value, op) = f(self)?;
        // A send race against a disconnect is repaired by the reconnect
        // resync, so the local apply stands either way.
        if let Err(e) = serde_json::to_value(&op).map_err(LinkError::from).and_then(|data| {
            self.conn.send(Stream::Graph.as_str(), data)
        }) {
            warn!("operation transmit failed: {e}");
        }
        let _ = self.events.send(SyncEvent::GraphChanged { version: self.graph.version() });
        Ok(value)
    }

    async fn set_active(&mut self, stream: Stream, active: bool) -> Result<(), SessionError> {
        if active {
            if !self.active.contains(&stream) {
                self.active.push(stream);
                if self.conn.is_open() {
                    self.resync(stream, true).await;
                }
            }
        } else {
            self.active.retain(|s| *s != stream);
            if self.conn.is_open() {
                self.send_control(ControlMessage::unsubscribe(stream))?;
            }
        }
        Ok(())
    }
}
