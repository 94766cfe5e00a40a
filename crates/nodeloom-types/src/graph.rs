//! Node and edge entities.
//!
//! Identity rules: node IDs are non-negative integers assigned per domain
//! tick (the server adopts the client's tentative ID on optimistic
//! creation); edge IDs are strings derived from their endpoints so the same
//! connection always hashes to the same ID on every client.
//!
//! Mutability: a node's `values` and `position` change over its lifetime;
//! its `id` and `node_type` never do.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A node identifier — server-authoritative, integer on the wire.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for NodeId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// An edge identifier — a string derived from both endpoints.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(pub String);

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for EdgeId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

/// A 2D canvas position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Parameter name → value mapping for a node.
pub type ValueMap = BTreeMap<String, Value>;

/// A graph node: immutable identity and type, mutable values and position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Type tag referencing a [`Template`](crate::Template) by name.
    #[serde(rename = "type")]
    pub node_type: String,
    pub values: ValueMap,
    pub position: Position,
}

/// Partial node update: only the fields present overwrite local state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodePatch {
    pub id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<ValueMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
}

/// A directed, typed connection between two node handles.
///
/// Invariant (enforced by the graph engine, not by construction): both
/// endpoints reference existing nodes and declared handles, and the output
/// handle's declared type equals the input handle's declared type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: EdgeId,
    pub source: NodeId,
    pub source_handle: String,
    pub target: NodeId,
    pub target_handle: String,
}

impl Edge {
    /// Build an edge with its derived ID.
    pub fn new(
        source: NodeId,
        source_handle: impl Into<String>,
        target: NodeId,
        target_handle: impl Into<String>,
    ) -> Self {
        let source_handle = source_handle.into();
        let target_handle = target_handle.into();
        let id = Self::derive_id(source, &source_handle, target, &target_handle);
        Self { id, source, source_handle, target, target_handle }
    }

    /// The canonical edge ID: `e{source}{sourceHandle}-{target}{targetHandle}`.
    pub fn derive_id(
        source: NodeId,
        source_handle: &str,
        target: NodeId,
        target_handle: &str,
    ) -> EdgeId {
        EdgeId(format!("e{source}{source_handle}-{target}{target_handle}"))
    }
}
