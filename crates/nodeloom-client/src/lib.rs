//! Client-side synchronization for nodeloom.
//!
//! Keeps a local node/edge graph and a mirrored directory tree consistent
//! with a remote server over one duplex connection: versioned operations
//! stream in, a per-domain gate orders them, and any divergence is repaired
//! by refetching a full snapshot. Local mutations apply optimistically and
//! transmit the equivalent operation.

pub mod connection;
pub mod constants;
pub mod files;
pub mod graph;
pub mod session;
pub mod snapshot;
pub mod version;

pub use connection::{ConnectionConfig, ConnectionManager, LinkError, LinkEvent, LinkState};
pub use files::FileTreeStore;
pub use graph::{ConnectionRequest, GraphError, GraphStore};
pub use session::{SessionConfig, SessionError, SessionHandle, SyncEvent, SyncSession};
pub use snapshot::{HttpSnapshots, SnapshotError, SnapshotSource};
pub use version::{Admission, RemoteOutcome, ResyncReason, SyncFault, SyncState, VersionGate};

/// Connect to a server and return a session handle synced to both domains.
///
/// `ws_url` is the duplex endpoint, `api_url` the snapshot API base.
pub fn connect(ws_url: impl Into<String>, api_url: impl Into<String>) -> SessionHandle {
    SyncSession::start(SessionConfig {
        ws_url: ws_url.into(),
        api_url: api_url.into(),
        ..SessionConfig::default()
    })
}
