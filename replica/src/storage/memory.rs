//! In-memory table of applied operations with file snapshots.

use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::{SnapshotHandle, StorageAdapter, StorageError};

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    keyspace: String,
    label: String,
    rows: Vec<String>,
}

/// Append-only table of operations for one keyspace.
///
/// Every executed operation becomes a row; the row number is the result.
#[derive(Debug)]
pub struct MemoryStorage {
    keyspace: String,
    snapshot_dir: PathBuf,
    rows: Vec<String>,
    last_snapshot_millis: u128,
}

impl MemoryStorage {
    pub fn new(keyspace: &str, snapshot_dir: impl Into<PathBuf>) -> Self {
        MemoryStorage {
            keyspace: keyspace.to_string(),
            snapshot_dir: snapshot_dir.into(),
            rows: Vec::new(),
            last_snapshot_millis: 0,
        }
    }

    pub fn rows(&self) -> &[String] {
        &self.rows
    }

    /// Timestamps strictly increase, so two checkpoints never share a file.
    fn snapshot_path(&mut self) -> PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let millis = now.max(self.last_snapshot_millis + 1);
        self.last_snapshot_millis = millis;
        self.snapshot_dir
            .join(format!("state-{}_{}.bin", self.keyspace, millis))
    }
}

impl StorageAdapter for MemoryStorage {
    fn execute(&mut self, operation: &str) -> Result<String, StorageError> {
        if operation.trim().is_empty() {
            return Err(StorageError::Rejected("empty operation".to_string()));
        }
        self.rows.push(operation.to_string());
        Ok(format!("row {}", self.rows.len() - 1))
    }

    fn checkpoint(&mut self, label: &str) -> Result<SnapshotHandle, StorageError> {
        fs::create_dir_all(&self.snapshot_dir)?;
        let path = self.snapshot_path();
        let snapshot = SnapshotFile {
            keyspace: self.keyspace.clone(),
            label: label.to_string(),
            rows: self.rows.clone(),
        };
        let data = bincode::serialize(&snapshot)?;

        // Write to temporary file first
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &data)?;
        fs::rename(&temp_path, &path)?;
        log::info!(
            "checkpoint {} of keyspace {} ({} rows) saved to {}",
            label,
            self.keyspace,
            self.rows().len(),
            path.display()
        );
        Ok(SnapshotHandle::from(path))
    }

    fn restore(&mut self, handle: &SnapshotHandle) -> Result<(), StorageError> {
        let data = fs::read(handle.path())?;
        let snapshot: SnapshotFile = bincode::deserialize(&data)?;
        if snapshot.keyspace != self.keyspace {
            log::warn!(
                "restoring snapshot of keyspace {} into keyspace {}",
                snapshot.keyspace,
                self.keyspace
            );
        }
        self.rows = snapshot.rows;
        log::info!(
            "restored {} rows from {} (checkpoint {})",
            self.rows.len(),
            handle,
            snapshot.label
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_execute_appends_rows() {
        let dir = TempDir::new().unwrap();
        let mut storage = MemoryStorage::new("demo", dir.path());

        assert_eq!(storage.execute("INSERT x").unwrap(), "row 0");
        assert_eq!(storage.execute("INSERT x").unwrap(), "row 1");
        assert_eq!(storage.rows(), ["INSERT x", "INSERT x"]);
    }

    #[test]
    fn test_operation_stored_verbatim() {
        let dir = TempDir::new().unwrap();
        let mut storage = MemoryStorage::new("demo", dir.path());

        storage.execute("  INSERT x\t").unwrap();
        assert_eq!(storage.rows(), ["  INSERT x\t"]);
    }

    #[test]
    fn test_back_to_back_checkpoints_kept_apart() {
        let dir = TempDir::new().unwrap();
        let mut storage = MemoryStorage::new("demo", dir.path());
        storage.execute("INSERT a").unwrap();
        let first = storage.checkpoint("n1-1").unwrap();
        storage.execute("INSERT b").unwrap();
        let second = storage.checkpoint("n1-2").unwrap();

        assert_ne!(first.path(), second.path());
        storage.restore(&first).unwrap();
        assert_eq!(storage.rows(), ["INSERT a"]);
        storage.restore(&second).unwrap();
        assert_eq!(storage.rows(), ["INSERT a", "INSERT b"]);
    }

    #[test]
    fn test_empty_operation_rejected() {
        let dir = TempDir::new().unwrap();
        let mut storage = MemoryStorage::new("demo", dir.path());

        assert!(matches!(
            storage.execute("   "),
            Err(StorageError::Rejected(_))
        ));
        assert!(storage.rows().is_empty());
    }

    #[test]
    fn test_checkpoint_and_restore() {
        let dir = TempDir::new().unwrap();
        let mut storage = MemoryStorage::new("demo", dir.path().join("snapshots"));
        storage.execute("INSERT a").unwrap();
        storage.execute("INSERT b").unwrap();

        let handle = storage.checkpoint("n1-2").unwrap();
        let name = handle.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("state-demo_"), "unexpected name {}", name);
        assert!(handle.path().exists());

        storage.execute("INSERT c").unwrap();
        storage.restore(&handle).unwrap();
        assert_eq!(storage.rows(), ["INSERT a", "INSERT b"]);

        let mut other = MemoryStorage::new("demo", dir.path());
        other.restore(&handle).unwrap();
        assert_eq!(other.rows(), storage.rows());
    }

    #[test]
    fn test_restore_missing_snapshot_fails() {
        let dir = TempDir::new().unwrap();
        let mut storage = MemoryStorage::new("demo", dir.path());
        let handle = SnapshotHandle::from(dir.path().join("state-demo_0.bin"));
        assert!(matches!(storage.restore(&handle), Err(StorageError::Io(_))));
    }
}
