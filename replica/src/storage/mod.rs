//! Storage engine interface consumed by the replica executor.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub mod memory;

pub use memory::MemoryStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    /// The engine refused to execute the operation.
    #[error("operation rejected: {0}")]
    Rejected(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot encoding error: {0}")]
    Snapshot(#[from] bincode::Error),
}

/// Opaque name of a snapshot produced by [`StorageAdapter::checkpoint`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHandle(PathBuf);

impl SnapshotHandle {
    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl From<PathBuf> for SnapshotHandle {
    fn from(path: PathBuf) -> Self {
        SnapshotHandle(path)
    }
}

impl From<&str> for SnapshotHandle {
    fn from(path: &str) -> Self {
        SnapshotHandle(PathBuf::from(path))
    }
}

impl fmt::Display for SnapshotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Executes already-ordered operations. All calls are synchronous.
pub trait StorageAdapter: Send + 'static {
    /// Applies one operation and returns its result.
    fn execute(&mut self, operation: &str) -> Result<String, StorageError>;

    /// Exports the current state to a new snapshot.
    fn checkpoint(&mut self, label: &str) -> Result<SnapshotHandle, StorageError>;

    /// Replaces the current state with the contents of `handle`.
    fn restore(&mut self, handle: &SnapshotHandle) -> Result<(), StorageError>;
}
