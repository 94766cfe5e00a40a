//! The graph domain: nodes, edges, templates, and optimistic mutation.
//!
//! [`GraphStore`] is pure state plus decision logic — no I/O, no channels —
//! so the whole protocol is unit-testable. The session actor owns one
//! instance, feeds it remote operations, and transmits the operations its
//! mutators hand back.
//!
//! # Optimistic mutation contract
//!
//! Every mutator validates its target against local state (error, no state
//! change, if it fails), applies the change immediately, advances the
//! version, and returns the equivalent operation stamped with the new
//! version for transmission. The server broadcasts that operation to all
//! subscribers including the originator, whose echo then arrives as stale
//! and is discarded.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde_json::Value;
use tracing::trace;

use nodeloom_types::{
    Component, DirectoryTree, Edge, EdgeId, GraphAction, GraphOperation, GraphSnapshot, Node,
    NodeId, NodePatch, Position, Template, ValueMap,
};

use crate::version::{RemoteOutcome, ResyncReason, SyncFault, SyncState, VersionGate};

/// Errors surfaced synchronously to a caller of a local mutator or of
/// [`GraphStore::connection_valid`]. None of these change state.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("unknown node ID {0}")]
    UnknownNode(NodeId),
    #[error("unknown edge ID {0}")]
    UnknownEdge(EdgeId),
    #[error("unknown node type `{0}`")]
    UnknownTemplate(String),
    #[error("node type `{node_type}` has no {side} handle `{handle}`")]
    UnknownHandle {
        node_type: String,
        side: &'static str,
        handle: String,
    },
    #[error("connection requires a {0} handle")]
    MissingHandle(&'static str),
    #[error("incompatible connection: output `{output}` != input `{input}`")]
    IncompatibleTypes { output: String, input: String },
}

/// A proposed connection as the caller hands it over — handles may be
/// absent, which is an error distinct from a type mismatch.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionRequest<'a> {
    pub source: NodeId,
    pub source_handle: Option<&'a str>,
    pub target: NodeId,
    pub target_handle: Option<&'a str>,
}

/// Local authoritative snapshot of the graph domain.
#[derive(Debug, Default)]
pub struct GraphStore {
    gate: VersionGate,
    templates: IndexMap<String, Template>,
    nodes: BTreeMap<NodeId, Node>,
    edges: BTreeMap<EdgeId, Edge>,
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn version(&self) -> u64 {
        self.gate.version()
    }

    pub fn state(&self) -> SyncState {
        self.gate.state()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn edge(&self, id: &EdgeId) -> Option<&Edge> {
        self.edges.get(id)
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    pub fn templates(&self) -> &IndexMap<String, Template> {
        &self.templates
    }

    // ── Resync protocol ──────────────────────────────────────────────────

    /// Mark a resync as started. Local state is kept as a speculative
    /// snapshot until [`install_snapshot`](Self::install_snapshot).
    pub fn begin_sync(&mut self) {
        self.gate.begin_sync();
    }

    /// A snapshot fetch failed; the domain needs a fresh sync attempt.
    pub fn invalidate(&mut self) {
        self.gate.invalidate();
    }

    /// Replace local state wholesale with an authoritative snapshot —
    /// a full overwrite, never a merge.
    pub fn install_snapshot(&mut self, snapshot: GraphSnapshot) {
        self.templates = snapshot.templates;
        self.nodes = snapshot.nodes.into_iter().map(|n| (n.id, n)).collect();
        self.edges = snapshot.edges.into_iter().map(|e| (e.id.clone(), e)).collect();
        self.gate.install(snapshot.version);
    }

    /// Offer one remote operation to the store.
    ///
    /// Stale operations are discarded silently; gaps, unknown targets, and
    /// server resync commands report [`RemoteOutcome::ResyncNeeded`];
    /// protocol violations error out before any state is touched.
    pub fn apply_remote(&mut self, op: GraphOperation) -> Result<RemoteOutcome, SyncFault> {
        if op.action == GraphAction::SyncGraph {
            return Ok(RemoteOutcome::ResyncNeeded(ResyncReason::Commanded));
        }
        let Some(version) = op.version else {
            return Err(SyncFault::MissingVersion { stream: "graph" });
        };
        if self.gate.state() != SyncState::Synced {
            return Ok(RemoteOutcome::ResyncNeeded(ResyncReason::NotSynced));
        }
        match self.gate.admit(version) {
            crate::version::Admission::Stale => {
                trace!("discarding stale graph operation v{version} (local v{})", self.gate.version());
                Ok(RemoteOutcome::Stale)
            }
            crate::version::Admission::Gap => Ok(RemoteOutcome::ResyncNeeded(ResyncReason::Gap {
                incoming: version,
                local: self.gate.version(),
            })),
            crate::version::Admission::InOrder => Ok(self.apply_in_order(version, op.action)),
        }
    }

    /// Apply an admitted in-order action. Each action is handled
    /// exclusively; an unknown target aborts without advancing the version.
    fn apply_in_order(&mut self, version: u64, action: GraphAction) -> RemoteOutcome {
        match action {
            GraphAction::CreateNode { node } => {
                self.nodes.insert(node.id, node);
            }
            GraphAction::UpdateNode { node } => {
                let Some(local) = self.nodes.get_mut(&node.id) else {
                    return RemoteOutcome::ResyncNeeded(ResyncReason::UnknownTarget(format!(
                        "node {}",
                        node.id
                    )));
                };
                merge_patch(local, node);
            }
            GraphAction::DeleteNode { id } => {
                if self.nodes.remove(&id).is_none() {
                    return RemoteOutcome::ResyncNeeded(ResyncReason::UnknownTarget(format!(
                        "node {id}"
                    )));
                }
                self.prune_edges_of(id);
            }
            GraphAction::CreateEdge { edge } => {
                self.edges.insert(edge.id.clone(), edge);
            }
            GraphAction::DeleteEdge { id } => {
                if self.edges.remove(&id).is_none() {
                    return RemoteOutcome::ResyncNeeded(ResyncReason::UnknownTarget(format!(
                        "edge {id}"
                    )));
                }
            }
            // Handled before gating.
            GraphAction::SyncGraph => unreachable!("sync_graph is intercepted before gating"),
        }
        self.gate.advance(version);
        RemoteOutcome::Applied { version }
    }

    // ── Local optimistic mutation ────────────────────────────────────────

    /// Create a node of `node_type` at `position`, resolving default values
    /// from the template — path-typed parameters walk `tree` under their
    /// configured directory.
    ///
    /// The tentative node ID equals the operation's version; the server
    /// adopts it when it applies the create.
    pub fn add_node(
        &mut self,
        node_type: &str,
        position: Position,
        tree: &DirectoryTree,
    ) -> Result<(NodeId, GraphOperation), GraphError> {
        let template = self
            .templates
            .get(node_type)
            .ok_or_else(|| GraphError::UnknownTemplate(node_type.to_string()))?;

        let mut values = ValueMap::new();
        for (key, spec) in &template.values {
            let value = match &spec.component {
                Component::FileDropdown { directory } => {
                    let segments = tree.subtree(directory).first_path();
                    Value::Array(segments.into_iter().map(Value::String).collect())
                }
                other => other.static_default().unwrap_or(Value::Null),
            };
            values.insert(key.clone(), value);
        }

        let version = self.gate.bump();
        let node = Node {
            id: NodeId(version),
            node_type: node_type.to_string(),
            values,
            position,
        };
        self.nodes.insert(node.id, node.clone());
        let op = GraphOperation::new(version, GraphAction::CreateNode { node: node.clone() });
        Ok((node.id, op))
    }

    /// Remove a node (and its incident edges) by ID.
    pub fn remove_node(&mut self, id: NodeId) -> Result<GraphOperation, GraphError> {
        if self.nodes.remove(&id).is_none() {
            return Err(GraphError::UnknownNode(id));
        }
        self.prune_edges_of(id);
        let version = self.gate.bump();
        Ok(GraphOperation::new(version, GraphAction::DeleteNode { id }))
    }

    /// Move a node.
    pub fn update_node_position(
        &mut self,
        id: NodeId,
        position: Position,
    ) -> Result<GraphOperation, GraphError> {
        let node = self.nodes.get_mut(&id).ok_or(GraphError::UnknownNode(id))?;
        node.position = position;
        let version = self.gate.bump();
        let patch = NodePatch { id, values: None, position: Some(position) };
        Ok(GraphOperation::new(version, GraphAction::UpdateNode { node: patch }))
    }

    /// Merge new parameter values into a node. Only the keys present in
    /// `values` overwrite existing ones.
    pub fn update_node_values(
        &mut self,
        id: NodeId,
        values: ValueMap,
    ) -> Result<GraphOperation, GraphError> {
        let node = self.nodes.get_mut(&id).ok_or(GraphError::UnknownNode(id))?;
        node.values.extend(values.clone());
        let version = self.gate.bump();
        let patch = NodePatch { id, values: Some(values), position: None };
        Ok(GraphOperation::new(version, GraphAction::UpdateNode { node: patch }))
    }

    /// Connect a node output to a node input. The connection must pass
    /// validation: both nodes and handles must exist, and the declared
    /// output type must equal the declared input type.
    pub fn add_edge(
        &mut self,
        source: NodeId,
        source_handle: &str,
        target: NodeId,
        target_handle: &str,
    ) -> Result<(EdgeId, GraphOperation), GraphError> {
        let (output, input) = self.edge_types(source, source_handle, target, target_handle)?;
        if output != input {
            return Err(GraphError::IncompatibleTypes { output, input });
        }
        let edge = Edge::new(source, source_handle, target, target_handle);
        let id = edge.id.clone();
        self.edges.insert(id.clone(), edge.clone());
        let version = self.gate.bump();
        Ok((id, GraphOperation::new(version, GraphAction::CreateEdge { edge })))
    }

    /// Disconnect an edge by ID.
    pub fn remove_edge(&mut self, id: &EdgeId) -> Result<GraphOperation, GraphError> {
        if self.edges.remove(id).is_none() {
            return Err(GraphError::UnknownEdge(id.clone()));
        }
        let version = self.gate.bump();
        Ok(GraphOperation::new(version, GraphAction::DeleteEdge { id: id.clone() }))
    }

    // ── Validation ───────────────────────────────────────────────────────

    /// Check whether a proposed connection is type-compatible.
    ///
    /// Missing nodes or handles are errors; a type mismatch is an ordinary
    /// `false`.
    pub fn connection_valid(&self, request: &ConnectionRequest<'_>) -> Result<bool, GraphError> {
        let source_handle = request.source_handle.ok_or(GraphError::MissingHandle("source"))?;
        let target_handle = request.target_handle.ok_or(GraphError::MissingHandle("target"))?;
        let (output, input) =
            self.edge_types(request.source, source_handle, request.target, target_handle)?;
        Ok(output == input)
    }

    /// Resolve the declared types of both ends of a proposed connection.
    fn edge_types(
        &self,
        source: NodeId,
        source_handle: &str,
        target: NodeId,
        target_handle: &str,
    ) -> Result<(String, String), GraphError> {
        let source_node = self.nodes.get(&source).ok_or(GraphError::UnknownNode(source))?;
        let target_node = self.nodes.get(&target).ok_or(GraphError::UnknownNode(target))?;

        let source_template = self
            .templates
            .get(&source_node.node_type)
            .ok_or_else(|| GraphError::UnknownTemplate(source_node.node_type.clone()))?;
        let target_template = self
            .templates
            .get(&target_node.node_type)
            .ok_or_else(|| GraphError::UnknownTemplate(target_node.node_type.clone()))?;

        let output = source_template.outputs.get(source_handle).ok_or_else(|| {
            GraphError::UnknownHandle {
                node_type: source_node.node_type.clone(),
                side: "output",
                handle: source_handle.to_string(),
            }
        })?;
        let input = target_template.inputs.get(target_handle).ok_or_else(|| {
            GraphError::UnknownHandle {
                node_type: target_node.node_type.clone(),
                side: "input",
                handle: target_handle.to_string(),
            }
        })?;

        Ok((output.ty.clone(), input.ty.clone()))
    }

    fn prune_edges_of(&mut self, id: NodeId) {
        self.edges.retain(|_, edge| edge.source != id && edge.target != id);
    }
}

/// Partial-field merge: only fields present on the patch overwrite.
fn merge_patch(node: &mut Node, patch: NodePatch) {
    if let Some(values) = patch.values {
        node.values.extend(values);
    }
    if let Some(position) = patch.position {
        node.position = position;
    }
}

// ============================================================================
// TESTS
// ============================================================================
