use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

/// Node version used for conditional updates and deletes.
pub type Version = i32;

/// Errors surfaced by the coordination service.
///
/// Callers branch on these: expected absence is swallowed, `NodeExists` on a
/// completion record means a peer won the race, `BadVersion` means re-read
/// and retry the decision, `ConnectionLoss` pauses the affected loop.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("node not found: {0}")]
    NoNode(String),

    #[error("version conflict at {path}: expected {expected}, actual {actual}")]
    BadVersion {
        path: String,
        expected: Version,
        actual: Version,
    },

    #[error("coordinator connection lost")]
    ConnectionLoss,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    /// Deleted automatically when the creating session ends.
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// Thin client over a strongly-consistent hierarchical key-value store.
///
/// One handle corresponds to one session: ephemeral nodes created through a
/// handle vanish when that session dies. All engine coordination reduces to
/// these primitives plus the leader election recipe built on top of them.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Create a node, creating missing parents as persistent nodes. For
    /// sequential modes a zero-padded counter is appended to `path`; the
    /// actual created path is returned.
    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, CoordinatorError>;

    /// Data and version of a node, or `None` when absent.
    async fn get_data(&self, path: &str) -> Result<Option<(Vec<u8>, Version)>, CoordinatorError>;

    /// Conditional update: fails with `BadVersion` unless the stored version
    /// equals `expected`. Returns the new version.
    async fn set_data(
        &self,
        path: &str,
        data: Vec<u8>,
        expected: Version,
    ) -> Result<Version, CoordinatorError>;

    /// Delete a node. `expected = None` deletes unconditionally; a missing
    /// node yields `NoNode`.
    async fn delete(&self, path: &str, expected: Option<Version>) -> Result<(), CoordinatorError>;

    async fn exists(&self, path: &str) -> Result<bool, CoordinatorError>;

    /// Child node names (not full paths), sorted. A missing parent yields an
    /// empty listing.
    async fn children(&self, path: &str) -> Result<Vec<String>, CoordinatorError>;

    /// Change feed: each item is the path of a node whose data changed, or
    /// the parent path of a created/deleted node. Receivers filter for the
    /// paths they watch; a lagged receiver should treat the gap as a change.
    fn subscribe(&self) -> broadcast::Receiver<String>;

    /// Identifier of this handle's session.
    fn session_id(&self) -> u64;
}

/// Block until the change feed reports one of `paths`. A lagged receiver
/// counts as a change; a closed feed parks forever (callers pair this with a
/// bounded poll interval in a `select!`).
pub(crate) async fn await_change(rx: &mut broadcast::Receiver<String>, paths: &[&str]) {
    loop {
        match rx.recv().await {
            Ok(changed) if paths.iter().any(|p| *p == changed) => return,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => return,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

/// Parent path of `path`, or "/" at the root.
pub(crate) fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}
