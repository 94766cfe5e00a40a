//! Shared entity and wire types for nodeloom.
//!
//! This crate is the pure leaf: graph entities, node-type templates, the
//! mirrored directory tree, and the JSON wire protocol. It has **no
//! internal nodeloom dependencies** and no I/O — everything here is plain
//! data that both the sync core and any consumer build on.
//!
//! # Entity Overview
//!
//! ```text
//! Template (per node type, server-authoritative)
//!     └── inputs / outputs : ordered HandleSpec (id, name, type)
//!     └── values           : ValueSpec (id, name, UI Component)
//!
//! Node (NodeId)
//!     └── node_type → Template
//!     └── values (mutable), position (mutable)
//!
//! Edge (EdgeId, derived from endpoints)
//!     └── source NodeId + output handle
//!     └── target NodeId + input handle
//!     └── invariant: output type == input type
//!
//! DirectoryTree
//!     └── name → subtree | file marker (no identity beyond path)
//! ```

pub mod graph;
pub mod template;
pub mod tree;
pub mod wire;

// Re-export primary types at crate root for convenience.
pub use graph::{Edge, EdgeId, Node, NodeId, NodePatch, Position, ValueMap};
pub use template::{Component, HandleSpec, Template, ValueSpec};
pub use tree::{DirectoryTree, TreeEntry};
pub use wire::{
    CONTROL_STREAM, ControlAction, ControlMessage, Frame, GraphAction, GraphOperation,
    GraphSnapshot, Stream, TreeAction, TreeOperation, TreeSnapshot,
};
