//! Error types shared by the protocol core and its collaborators.

use thiserror::Error;

use crate::storage::StorageError;
use crate::tob::NodeId;

#[derive(Debug, Error)]
pub enum Error {
    /// Inbound bytes that do not decode into a wire message.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A leader-only message reached a node that is not the leader.
    #[error("{kind} from {from} received by a node that is not the leader")]
    UnexpectedRole { kind: &'static str, from: NodeId },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
