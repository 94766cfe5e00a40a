//! Full-snapshot endpoints.
//!
//! Snapshots travel outside the push channel as plain request/response
//! round trips. [`SnapshotSource`] is the seam: the sync protocol only
//! needs "give me the authoritative state plus its version", so tests can
//! substitute an in-memory source while production uses
//! [`HttpSnapshots`] over the backend's REST API.

use async_trait::async_trait;
use reqwest::header::ACCEPT;

use nodeloom_types::{GraphSnapshot, TreeSnapshot};

/// Errors from snapshot fetching.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("snapshot source unavailable: {0}")]
    Unavailable(String),
}

/// Authoritative state provider for the versioned domains.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// `{version, templates, nodes, edges}` for the graph domain.
    async fn fetch_graph(&self) -> Result<GraphSnapshot, SnapshotError>;
    /// `{version, tree}` for the file-tree domain.
    async fn fetch_files(&self) -> Result<TreeSnapshot, SnapshotError>;
}

/// Snapshot fetching over the backend's HTTP API.
pub struct HttpSnapshots {
    base: String,
    client: reqwest::Client,
}

impl HttpSnapshots {
    /// `base` is the API root, e.g. `http://localhost:8000/api/v1/`.
    pub fn new(base: impl Into<String>) -> Self {
        let mut base = base.into();
        if !base.ends_with('/') {
            base.push('/');
        }
        Self { base, client: reqwest::Client::new() }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshots {
    async fn fetch_graph(&self) -> Result<GraphSnapshot, SnapshotError> {
        let snapshot = self
            .client
            .get(self.endpoint("graph/"))
            .header(ACCEPT, "application/json")
            .send()
            .await?
            .error_for_status()?
            .json::<GraphSnapshot>()
            .await?;
        Ok(snapshot)
    }

    async fn fetch_files(&self) -> Result<TreeSnapshot, SnapshotError> {
        let snapshot = self
            .client
            .get(self.endpoint("files/data/structure"))
            .header(ACCEPT, "application/json")
            .send()
            .await?
            .error_for_status()?
            .json::<TreeSnapshot>()
            .await?;
        Ok(snapshot)
    }
}
