//! The file-tree domain: a read-only mirror of the server's watched
//! directory.
//!
//! [`FileTreeStore`] follows the same gate-then-apply shape as the graph
//! store, but the server is the only producer — there are no local
//! mutators. Its single consumer-facing job is answering "what files exist
//! under this directory right now" for path-typed node parameters.

use tracing::trace;

use nodeloom_types::{DirectoryTree, TreeAction, TreeOperation, TreeSnapshot};

use crate::version::{RemoteOutcome, ResyncReason, SyncFault, SyncState, VersionGate};

/// Local mirror of the server's file tree.
#[derive(Debug, Default)]
pub struct FileTreeStore {
    gate: VersionGate,
    tree: DirectoryTree,
}

impl FileTreeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.gate.version()
    }

    pub fn state(&self) -> SyncState {
        self.gate.state()
    }

    pub fn tree(&self) -> &DirectoryTree {
        &self.tree
    }

    /// Resolve the subtree under `path` (empty for unresolvable paths).
    pub fn subtree(&self, path: &[String]) -> &DirectoryTree {
        self.tree.subtree(path)
    }

    pub fn begin_sync(&mut self) {
        self.gate.begin_sync();
    }

    pub fn invalidate(&mut self) {
        self.gate.invalidate();
    }

    /// Replace the mirror wholesale with an authoritative snapshot.
    pub fn install_snapshot(&mut self, snapshot: TreeSnapshot) {
        self.tree = snapshot.tree;
        self.gate.install(snapshot.version);
    }

    /// Offer one remote operation to the mirror, under the same version
    /// gate as the graph: stale is discarded, a gap or unknown target
    /// requests a resync, in-order applies and advances.
    pub fn apply_remote(&mut self, op: TreeOperation) -> Result<RemoteOutcome, SyncFault> {
        let Some(version) = op.version else {
            return Err(SyncFault::MissingVersion { stream: "files" });
        };
        if self.gate.state() != SyncState::Synced {
            return Ok(RemoteOutcome::ResyncNeeded(ResyncReason::NotSynced));
        }
        match self.gate.admit(version) {
            crate::version::Admission::Stale => {
                trace!("discarding stale tree operation v{version} (local v{})", self.gate.version());
                Ok(RemoteOutcome::Stale)
            }
            crate::version::Admission::Gap => Ok(RemoteOutcome::ResyncNeeded(ResyncReason::Gap {
                incoming: version,
                local: self.gate.version(),
            })),
            crate::version::Admission::InOrder => Ok(self.apply_in_order(version, op.action)),
        }
    }

    fn apply_in_order(&mut self, version: u64, action: TreeAction) -> RemoteOutcome {
        match action {
            TreeAction::ReplaceTree { tree } => {
                self.tree = tree;
            }
            TreeAction::CreateEntry { path, directory } => {
                let entry = if directory { Some(DirectoryTree::new()) } else { None };
                if !self.tree.insert_at(&path, entry) {
                    return RemoteOutcome::ResyncNeeded(ResyncReason::UnknownTarget(format!(
                        "parent of {}",
                        path.join("/")
                    )));
                }
            }
            TreeAction::DeleteEntry { path } => {
                if !self.tree.remove_at(&path) {
                    return RemoteOutcome::ResyncNeeded(ResyncReason::UnknownTarget(
                        path.join("/"),
                    ));
                }
            }
        }
        self.gate.advance(version);
        RemoteOutcome::Applied { version }
    }
}
