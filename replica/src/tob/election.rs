//! Leader selection.
//!
//! The leader is chosen once at startup and never changes. Selection sits
//! behind [`LeaderSelector`] so a real election can replace it without
//! touching sequencing or acknowledgement handling.

use super::NodeId;

pub trait LeaderSelector {
    /// Returns the leader for `members`, or `None` if there is none.
    fn select(&self, members: &[NodeId]) -> Option<NodeId>;
}

/// Picks the first id of the static membership list.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstMember;

impl LeaderSelector for FirstMember {
    fn select(&self, members: &[NodeId]) -> Option<NodeId> {
        members.first().cloned()
    }
}
