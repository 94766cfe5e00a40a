//! Version gating for the per-domain resync protocol.
//!
//! Every synchronized domain carries one server-assigned monotonic version:
//! the count of operations applied since the domain's inception. The gate
//! decides, for each incoming operation, whether it is stale, in-order, or
//! evidence of a gap — and tracks where the domain is in its sync lifecycle.
//!
//! # State Machine
//!
//! ```text
//! +---------------+
//! | Uninitialized |  no snapshot yet
//! +-------+-------+
//!         | begin_sync() — subscribe + snapshot fetch issued
//!         v
//! +---------------+
//! |    Syncing    |  fetch in flight; inbound ops are not applied
//! +-------+-------+
//!         | install(version) — snapshot replaces local state
//!         v
//! +---------------+
//! |    Synced     |  incremental ops gated by version
//! +-------+-------+
//!         | gap detected OR reconnection
//!         v
//!      Syncing (full resync; local state kept as speculative snapshot)
//! ```
//!
//! The version never regresses except through `install`, which resets it to
//! whatever the fresh snapshot reports.

/// Result of offering one remote operation to a domain store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// Applied in-order; the local version advanced to `version`.
    Applied { version: u64 },
    /// Stale or duplicate — discarded silently (idempotent no-op).
    Stale,
    /// The operation was discarded and a full resync must run.
    ResyncNeeded(ResyncReason),
}

/// Why a full resync is required.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResyncReason {
    /// `incoming > local + 1`: one or more operations were missed.
    Gap { incoming: u64, local: u64 },
    /// An update or delete referenced an entity this client does not hold.
    UnknownTarget(String),
    /// The server commanded a resync.
    Commanded,
    /// An operation arrived before the domain ever synced.
    NotSynced,
}

/// Hard protocol violations. Unlike stale messages these are not silently
/// dropped — they surface as errors, and the store is left untouched.
#[derive(Debug, thiserror::Error)]
pub enum SyncFault {
    /// An entity operation without a version cannot be gated.
    #[error("operation on stream `{stream}` is missing its version")]
    MissingVersion { stream: &'static str },
    /// Missing action, missing payload for the action, or an unknown
    /// action tag.
    #[error("malformed operation on stream `{stream}`: {source}")]
    Malformed {
        stream: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Where a domain is in its sync lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// Never synced.
    Uninitialized,
    /// Subscribe sent and snapshot fetch in flight.
    Syncing,
    /// Converged; applying incremental operations.
    Synced,
}

/// The tie-break for one incoming operation version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// `version <= local` — duplicate or stale; discard silently.
    Stale,
    /// `version == local + 1` — apply, then advance.
    InOrder,
    /// `version > local + 1` — one or more operations were missed; discard
    /// and trigger a full resync.
    Gap,
}

/// Per-domain version counter plus sync lifecycle state.
#[derive(Clone, Debug)]
pub struct VersionGate {
    version: u64,
    state: SyncState,
}

impl Default for VersionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionGate {
    pub fn new() -> Self {
        Self { version: 0, state: SyncState::Uninitialized }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_synced(&self) -> bool {
        self.state == SyncState::Synced
    }

    /// Classify an incoming operation version against local state.
    pub fn admit(&self, incoming: u64) -> Admission {
        if incoming <= self.version {
            Admission::Stale
        } else if incoming == self.version + 1 {
            Admission::InOrder
        } else {
            Admission::Gap
        }
    }

    /// Record an in-order operation as applied.
    ///
    /// Callers must only pass versions admitted as [`Admission::InOrder`];
    /// the debug assertion guards the monotonicity invariant in tests.
    pub fn advance(&mut self, applied: u64) {
        debug_assert_eq!(applied, self.version + 1, "advance must be in-order");
        self.version = applied;
    }

    /// Advance by one for a local optimistic mutation and return the new
    /// version the outgoing operation is stamped with. The server's echo of
    /// that operation then arrives as [`Admission::Stale`] and is discarded.
    pub fn bump(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    /// Mark a resync as started (subscribe/fetch issued). Local state is
    /// retained as a speculative snapshot until `install` overwrites it.
    pub fn begin_sync(&mut self) {
        self.state = SyncState::Syncing;
    }

    /// Install a fresh authoritative snapshot version. The only operation
    /// allowed to move the counter backwards.
    pub fn install(&mut self, snapshot_version: u64) {
        self.version = snapshot_version;
        self.state = SyncState::Synced;
    }

    /// Drop back to Uninitialized (snapshot fetch failed); the next inbound
    /// event or connection open retriggers a resync.
    pub fn invalidate(&mut self) {
        self.state = SyncState::Uninitialized;
    }
}
