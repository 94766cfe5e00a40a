//! Wire protocol: frames, control messages, and versioned operations.
//!
//! Everything on the duplex connection is one JSON frame:
//! `{ "stream": <name>, "data": <payload> }`. The `streams` control stream
//! carries subscribe/unsubscribe messages; each domain stream carries
//! versioned operations.
//!
//! # Action vocabulary
//!
//! One consistent, snake-case tag set per domain:
//!
//! - graph: `create_node`, `update_node`, `delete_node`, `create_edge`,
//!   `delete_edge`, plus the server-commanded `sync_graph` (full refetch).
//! - files: `replace_tree`, `create_entry`, `delete_entry`.
//!
//! `update_node` is a partial merge — only the fields present on the patch
//! overwrite local state.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graph::{Edge, EdgeId, Node, NodeId, NodePatch};
use crate::template::Template;
use crate::tree::DirectoryTree;

/// The control stream multiplexing subscriptions.
pub const CONTROL_STREAM: &str = "streams";

/// Logical domain streams multiplexed over the one connection.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum Stream {
    Graph,
    Files,
}

impl Stream {
    pub fn as_str(self) -> &'static str {
        match self {
            Stream::Graph => "graph",
            Stream::Files => "files",
        }
    }

    /// Resolve a frame's stream field. Unrecognized names yield `None` and
    /// the frame is ignored.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "graph" => Some(Stream::Graph),
            "files" => Some(Stream::Files),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One framed message on the duplex connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub stream: String,
    pub data: Value,
}

impl Frame {
    pub fn new(stream: impl Into<String>, data: Value) -> Self {
        Self { stream: stream.into(), data }
    }
}

/// Subscription control payload, sent on [`CONTROL_STREAM`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub action: ControlAction,
    pub streams: Vec<String>,
}

impl ControlMessage {
    pub fn subscribe(stream: Stream) -> Self {
        Self { action: ControlAction::Subscribe, streams: vec![stream.as_str().to_string()] }
    }

    pub fn unsubscribe(stream: Stream) -> Self {
        Self { action: ControlAction::Unsubscribe, streams: vec![stream.as_str().to_string()] }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Subscribe,
    Unsubscribe,
}

/// A versioned graph-stream operation.
///
/// `version` is absent only on the `sync_graph` command; a versionless
/// entity operation is a protocol violation the store rejects before
/// touching any state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphOperation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(flatten)]
    pub action: GraphAction,
}

impl GraphOperation {
    pub fn new(version: u64, action: GraphAction) -> Self {
        Self { version: Some(version), action }
    }
}

/// Graph entity operations. Each action is handled exclusively.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum GraphAction {
    CreateNode { node: Node },
    UpdateNode { node: NodePatch },
    DeleteNode { id: NodeId },
    CreateEdge { edge: Edge },
    DeleteEdge { id: EdgeId },
    /// Server-commanded full resync (e.g. after it rejects a stale write).
    SyncGraph,
}

/// A versioned file-stream operation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TreeOperation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(flatten)]
    pub action: TreeAction,
}

impl TreeOperation {
    pub fn new(version: u64, action: TreeAction) -> Self {
        Self { version: Some(version), action }
    }
}

/// File-tree operations. The server is the only producer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TreeAction {
    /// Wholesale replacement — what the server's file watcher emits on any
    /// filesystem change.
    ReplaceTree { tree: DirectoryTree },
    CreateEntry { path: Vec<String>, directory: bool },
    DeleteEntry { path: Vec<String> },
}

/// Full authoritative graph state, fetched on every (re)sync.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub version: u64,
    #[serde(default)]
    pub templates: indexmap::IndexMap<String, Template>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// Full authoritative file-tree state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub version: u64,
    pub tree: DirectoryTree,
}
