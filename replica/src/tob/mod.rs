//! Leader-sequenced total-order broadcast.
//!
//! The leader assigns every REQUEST a sequence number, broadcasts one
//! PROPOSAL at a time to all members and moves on only after every member
//! has acknowledged it.

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod ack_tracker;
pub mod election;
pub mod executor;
pub mod message;
pub mod node;
pub mod sequencer;

/// Identity of a member node, drawn from the static membership list.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        NodeId(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        NodeId(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Bytes delivered to a node together with the sender's identity.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: NodeId,
    pub data: Vec<u8>,
}

/// Bytes a node wants delivered to `to`.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub to: NodeId,
    pub data: Vec<u8>,
}
