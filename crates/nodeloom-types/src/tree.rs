//! The mirrored directory tree.
//!
//! A recursive name → entry mapping with no identity beyond the path. On the
//! wire a file is `null` and a directory is a nested mapping, exactly as the
//! server's file watcher emits it:
//!
//! ```json
//! { "models": { "checkpoints": { "sd21.safetensors": null } }, "README": null }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A directory entry: `None` marks a file, `Some` a subdirectory.
pub type TreeEntry = Option<DirectoryTree>;

/// Shared empty subtree, returned by [`DirectoryTree::subtree`] for
/// unresolvable paths.
static EMPTY: DirectoryTree = DirectoryTree(BTreeMap::new());

/// Recursive directory mapping, sorted by name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DirectoryTree(pub BTreeMap<String, TreeEntry>);

impl DirectoryTree {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Resolve a path by descending the mapping.
    ///
    /// An unresolvable path (missing entry, or a file where a directory was
    /// expected) yields the empty subtree rather than an error, so dependent
    /// code never has to branch on lookup failure.
    pub fn subtree(&self, path: &[String]) -> &DirectoryTree {
        let mut current = self;
        for segment in path {
            match current.0.get(segment) {
                Some(Some(dir)) => current = dir,
                _ => return &EMPTY,
            }
        }
        current
    }

    /// Derive a default path by first-available descent: at each level,
    /// prefer the first file; otherwise descend into the first directory.
    ///
    /// An empty (sub)tree contributes a single empty segment, mirroring the
    /// "no selection" default the UI expects.
    pub fn first_path(&self) -> Vec<String> {
        let mut path = Vec::new();
        let mut current = self;
        loop {
            if let Some((name, _)) = current.0.iter().find(|(_, entry)| entry.is_none()) {
                path.push(name.clone());
                return path;
            }
            match current.0.iter().next() {
                Some((name, Some(dir))) => {
                    path.push(name.clone());
                    current = dir;
                }
                _ => {
                    path.push(String::new());
                    return path;
                }
            }
        }
    }

    /// Insert an entry at `path`. The parent directory must already exist;
    /// returns false (tree untouched) if it does not.
    pub fn insert_at(&mut self, path: &[String], entry: TreeEntry) -> bool {
        let Some((name, parents)) = path.split_last() else {
            return false;
        };
        let Some(parent) = self.descend_mut(parents) else {
            return false;
        };
        parent.0.insert(name.clone(), entry);
        true
    }

    /// Remove the entry at `path`. Returns false if it does not exist.
    pub fn remove_at(&mut self, path: &[String]) -> bool {
        let Some((name, parents)) = path.split_last() else {
            return false;
        };
        let Some(parent) = self.descend_mut(parents) else {
            return false;
        };
        parent.0.remove(name).is_some()
    }

    fn descend_mut(&mut self, path: &[String]) -> Option<&mut DirectoryTree> {
        let mut current = self;
        for segment in path {
            match current.0.get_mut(segment) {
                Some(Some(dir)) => current = dir,
                _ => return None,
            }
        }
        Some(current)
    }
}
