//! Wire messages exchanged between nodes.
//!
//! Each message is a flat JSON object whose `type` field selects the kind:
//!
//! ```text
//! {"type":"REQUEST","request":"INSERT x"}
//! {"type":"PROPOSAL","request":"INSERT x","reqnum":0}
//! {"type":"ACKNOWLEDGEMENT","reqnum":0,"response":"n2"}
//! ```

use serde::{Deserialize, Serialize};

use super::NodeId;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    /// A client operation forwarded to the leader, not yet ordered.
    #[serde(rename = "REQUEST")]
    Request { request: String },

    /// An ordered operation broadcast by the leader.
    #[serde(rename = "PROPOSAL")]
    Proposal { request: String, reqnum: u64 },

    /// A replica's confirmation that it executed `reqnum`.
    #[serde(rename = "ACKNOWLEDGEMENT")]
    Acknowledgement { reqnum: u64, response: NodeId },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Request { .. } => "REQUEST",
            Message::Proposal { .. } => "PROPOSAL",
            Message::Acknowledgement { .. } => "ACKNOWLEDGEMENT",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}
