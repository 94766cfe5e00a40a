//! Node-type schemas.
//!
//! A [`Template`] describes everything a client needs to render and validate
//! one node type: its input/output handles (id, name, declared type) and its
//! configurable value parameters with their UI component descriptors.
//! Templates are server-authoritative — fetched with every graph snapshot,
//! never mutated locally.
//!
//! Handle maps are order-preserving (`IndexMap`) because the server declares
//! handles in layout order.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One input or output handle: display name plus declared wire type.
///
/// The `ty` string is the unit of connection compatibility — an edge is
/// valid iff the source output's `ty` equals the target input's `ty`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

/// A configurable node parameter: display name plus its UI component.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValueSpec {
    pub name: String,
    pub component: Component,
}

/// UI component descriptors for value parameters.
///
/// `FileDropdown` carries no static default — its default is derived at
/// node-creation time by walking the synchronized file tree under
/// `directory`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Component {
    Checkbox {
        default: bool,
    },
    FloatSlider {
        default: f64,
        minimum: f64,
        maximum: f64,
        step: f64,
    },
    Dropdown {
        default: String,
        options: Vec<String>,
    },
    FileDropdown {
        /// Path segments naming the subtree the selection is made from.
        directory: Vec<String>,
    },
}

impl Component {
    /// The component's static default value, if it has one.
    ///
    /// Returns `None` for path-typed components, whose default depends on
    /// the current file tree.
    pub fn static_default(&self) -> Option<Value> {
        match self {
            Component::Checkbox { default } => Some(Value::Bool(*default)),
            Component::FloatSlider { default, .. } => serde_json::to_value(default).ok(),
            Component::Dropdown { default, .. } => Some(Value::String(default.clone())),
            Component::FileDropdown { .. } => None,
        }
    }
}

/// Per-node-type schema: handles in declaration order plus value parameters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Template {
    #[serde(default)]
    pub inputs: IndexMap<String, HandleSpec>,
    #[serde(default)]
    pub outputs: IndexMap<String, HandleSpec>,
    #[serde(default)]
    pub values: IndexMap<String, ValueSpec>,
}
