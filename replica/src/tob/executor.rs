//! Replica-side execution of proposals.

use slog::{debug, error, Logger};

use super::message::Message;
use super::NodeId;
use crate::error::Result;
use crate::metrics;
use crate::storage::{SnapshotHandle, StorageAdapter};

/// Applies proposals to local storage and produces acknowledgements.
///
/// Proposals are applied in arrival order. Nothing is deduplicated: a
/// redelivered proposal is executed again.
pub struct ReplicaExecutor<S: StorageAdapter> {
    id: NodeId,
    storage: S,
    applied: u64,
    logger: Logger,
}

impl<S: StorageAdapter> ReplicaExecutor<S> {
    pub fn new(id: NodeId, storage: S, logger: &Logger) -> Self {
        ReplicaExecutor {
            id,
            storage,
            applied: 0,
            logger: logger.clone(),
        }
    }

    /// Executes `request` and returns the acknowledgement for `reqnum`.
    ///
    /// On a storage failure no acknowledgement is produced, so the leader
    /// keeps waiting for this node.
    pub fn on_proposal(&mut self, reqnum: u64, request: &str) -> Result<Message> {
        let storage = &mut self.storage;
        let result = metrics::record_metrics("execute", || storage.execute(request));

        match result {
            Ok(output) => {
                self.applied += 1;
                debug!(self.logger, "applied proposal"; "reqnum" => reqnum, "result" => output);
                Ok(Message::Acknowledgement {
                    reqnum,
                    response: self.id.clone(),
                })
            }
            Err(e) => {
                error!(self.logger, "failed to apply proposal"; "reqnum" => reqnum, "error" => %e);
                Err(e.into())
            }
        }
    }

    /// Number of proposals applied successfully since startup.
    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn checkpoint(&mut self, label: &str) -> Result<SnapshotHandle> {
        Ok(self.storage.checkpoint(label)?)
    }

    pub fn restore(&mut self, handle: &SnapshotHandle) -> Result<()> {
        Ok(self.storage.restore(handle)?)
    }
}
