//! Acknowledgement bookkeeping for the proposal in flight.

use std::collections::BTreeSet;

use super::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The ack was counted; this many members still owe one.
    Pending(usize),
    /// The ack was counted and it was the last one owed.
    Complete,
    /// The sender did not owe an ack. Nothing changed.
    Unexpected,
}

/// Tracks which members still owe an acknowledgement.
///
/// Empty exactly when no proposal is in flight.
#[derive(Debug, Default)]
pub struct AckTracker {
    outstanding: BTreeSet<NodeId>,
    reqnum: Option<u64>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts waiting on every member for `reqnum`.
    pub fn begin(&mut self, reqnum: u64, members: &[NodeId]) {
        debug_assert!(self.is_idle(), "proposal {:?} still in flight", self.reqnum);
        self.outstanding = members.iter().cloned().collect();
        self.reqnum = Some(reqnum);
    }

    /// Removes `node` from the outstanding set.
    ///
    /// The ack's sequence number is not compared with the proposal in
    /// flight; the caller decides whether a mismatch is worth reporting.
    pub fn record(&mut self, node: &NodeId) -> AckOutcome {
        if !self.outstanding.remove(node) {
            return AckOutcome::Unexpected;
        }
        if self.outstanding.is_empty() {
            self.reqnum = None;
            AckOutcome::Complete
        } else {
            AckOutcome::Pending(self.outstanding.len())
        }
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// Sequence number of the proposal in flight.
    pub fn in_flight(&self) -> Option<u64> {
        self.reqnum
    }

    pub fn outstanding(&self) -> impl Iterator<Item = &NodeId> {
        self.outstanding.iter()
    }
}
