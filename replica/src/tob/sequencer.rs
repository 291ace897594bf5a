//! Leader-side sequencing.
//!
//! Requests are numbered in arrival order and proposed strictly one at a
//! time. Per sequence position the leader moves through
//!
//! ```text
//! EMPTY -> QUEUED -> PROPOSED -> COMMITTED -> EMPTY (next position)
//! ```
//!
//! A position stays PROPOSED until every member has acknowledged it. There
//! is no timeout, so a member that never acknowledges blocks every later
//! request.

use std::collections::BTreeMap;

use slog::{debug, error, info, o, warn, Logger};

use super::ack_tracker::{AckOutcome, AckTracker};
use super::NodeId;

/// A proposal the leader must send to every member in `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broadcast {
    pub reqnum: u64,
    pub request: String,
    pub to: Vec<NodeId>,
}

pub struct Sequencer {
    members: Vec<NodeId>,
    pending: BTreeMap<u64, String>, // reqnum -> request, not yet proposed
    next_assign: u64,
    next_expected: u64,
    acks: AckTracker,
    logger: Logger,
}

impl Sequencer {
    pub fn new(members: Vec<NodeId>, logger: &Logger) -> Self {
        Sequencer {
            members,
            pending: BTreeMap::new(),
            next_assign: 0,
            next_expected: 0,
            acks: AckTracker::new(),
            logger: logger.new(o!("role" => "leader")),
        }
    }

    /// Assigns the next sequence number to `request` and queues it.
    ///
    /// Returns the proposal to broadcast if the pipeline was idle.
    pub fn on_request(&mut self, request: String) -> Option<Broadcast> {
        let reqnum = self.next_assign;
        self.next_assign += 1;
        self.pending.insert(reqnum, request);
        debug!(self.logger, "queued request"; "reqnum" => reqnum, "pending" => self.pending.len());
        self.try_advance()
    }

    /// Counts an acknowledgement from `from`.
    ///
    /// Returns the next proposal to broadcast once the one in flight is fully
    /// acknowledged and another request is waiting.
    pub fn on_ack(&mut self, from: &NodeId, reqnum: u64) -> Option<Broadcast> {
        let in_flight = self.acks.in_flight();
        if in_flight.is_some() && in_flight != Some(reqnum) {
            // Counted anyway: acks are matched by sender only.
            warn!(self.logger, "ack does not match proposal in flight";
                "from" => %from, "reqnum" => reqnum, "in_flight" => ?in_flight);
        }

        match self.acks.record(from) {
            AckOutcome::Unexpected => {
                error!(self.logger, "no ack outstanding from node";
                    "from" => %from, "reqnum" => reqnum, "in_flight" => ?in_flight);
                None
            }
            AckOutcome::Pending(left) => {
                debug!(self.logger, "ack recorded";
                    "from" => %from, "reqnum" => reqnum, "left" => left);
                None
            }
            AckOutcome::Complete => {
                info!(self.logger, "proposal committed"; "reqnum" => self.next_expected);
                self.next_expected += 1;
                self.try_advance()
            }
        }
    }

    fn try_advance(&mut self) -> Option<Broadcast> {
        if !self.acks.is_idle() {
            return None;
        }

        let reqnum = self.next_expected;
        let Some(request) = self.pending.remove(&reqnum) else {
            if reqnum < self.next_assign {
                info!(self.logger, "ready to propose but request is gone"; "reqnum" => reqnum);
            }
            return None;
        };

        self.acks.begin(reqnum, &self.members);
        info!(self.logger, "broadcasting proposal"; "reqnum" => reqnum, "request" => &request);
        Some(Broadcast {
            reqnum,
            request,
            to: self.members.clone(),
        })
    }

    pub fn next_assign(&self) -> u64 {
        self.next_assign
    }

    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight(&self) -> Option<u64> {
        self.acks.in_flight()
    }

    pub fn outstanding_acks(&self) -> usize {
        self.acks.outstanding().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequencer() -> Sequencer {
        let logger = Logger::root(slog::Discard, o!());
        let members = ["n1", "n2", "n3"].into_iter().map(NodeId::from).collect();
        Sequencer::new(members, &logger)
    }

    fn ack_all(seq: &mut Sequencer, reqnum: u64) -> Option<Broadcast> {
        let mut next = None;
        for id in ["n1", "n2", "n3"] {
            let out = seq.on_ack(&NodeId::from(id), reqnum);
            assert!(next.is_none(), "broadcast before every member acked");
            next = out;
        }
        next
    }

    #[test]
    fn test_insert_scenario() {
        let mut seq = sequencer();

        let first = seq.on_request("INSERT x".to_string()).unwrap();
        assert_eq!(first.reqnum, 0);
        assert_eq!(first.request, "INSERT x");
        let to: Vec<_> = first.to.iter().map(|n| n.as_str()).collect();
        assert_eq!(to, vec!["n1", "n2", "n3"]);

        // Arrives while 0 is in flight: buffered at 1.
        assert!(seq.on_request("INSERT y".to_string()).is_none());
        assert_eq!(seq.pending(), 1);
        assert_eq!(seq.in_flight(), Some(0));

        assert!(seq.on_ack(&NodeId::from("n1"), 0).is_none());
        assert!(seq.on_ack(&NodeId::from("n2"), 0).is_none());
        assert_eq!(seq.next_expected(), 0);
        let second = seq.on_ack(&NodeId::from("n3"), 0).unwrap();

        assert_eq!(seq.next_expected(), 1);
        assert_eq!(second.reqnum, 1);
        assert_eq!(second.request, "INSERT y");
        assert_eq!(seq.pending(), 0);
    }

    #[test]
    fn test_sequence_numbers_are_contiguous() {
        let mut seq = sequencer();
        let mut proposed = Vec::new();
        if let Some(b) = seq.on_request("op-0".to_string()) {
            proposed.push(b.reqnum);
        }
        for i in 1..10 {
            assert!(seq.on_request(format!("op-{}", i)).is_none());
        }
        assert_eq!(seq.next_assign(), 10);

        for reqnum in 0..10 {
            if let Some(b) = ack_all(&mut seq, reqnum) {
                assert_eq!(b.request, format!("op-{}", b.reqnum));
                proposed.push(b.reqnum);
            }
        }
        assert_eq!(proposed, (0..10).collect::<Vec<_>>());
        assert_eq!(seq.next_expected(), 10);
        assert_eq!(seq.in_flight(), None);
    }

    #[test]
    fn test_single_proposal_in_flight() {
        let mut seq = sequencer();
        assert!(seq.on_request("a".to_string()).is_some());
        for i in 0..5 {
            assert!(seq.on_request(format!("b{}", i)).is_none());
            assert_eq!(seq.in_flight(), Some(0));
            assert_eq!(seq.outstanding_acks(), 3);
        }
        assert!(seq.next_expected() <= seq.next_assign());
    }

    #[test]
    fn test_silent_member_stalls_forever() {
        let mut seq = sequencer();
        seq.on_request("a".to_string());
        seq.on_request("b".to_string());
        seq.on_request("c".to_string());

        seq.on_ack(&NodeId::from("n1"), 0);
        seq.on_ack(&NodeId::from("n2"), 0);
        // Repeated acks from the responsive members change nothing.
        for _ in 0..3 {
            assert!(seq.on_ack(&NodeId::from("n1"), 0).is_none());
            assert!(seq.on_ack(&NodeId::from("n2"), 0).is_none());
        }

        assert_eq!(seq.next_expected(), 0);
        assert_eq!(seq.in_flight(), Some(0));
        assert_eq!(seq.pending(), 2);
        assert_eq!(seq.outstanding_acks(), 1);
    }

    #[test]
    fn test_stray_ack_while_idle_does_not_advance() {
        let mut seq = sequencer();
        assert!(seq.on_ack(&NodeId::from("n2"), 0).is_none());
        assert_eq!(seq.next_expected(), 0);

        seq.on_request("a".to_string());
        ack_all(&mut seq, 0);
        assert_eq!(seq.next_expected(), 1);

        // Late duplicate after commit.
        assert!(seq.on_ack(&NodeId::from("n3"), 0).is_none());
        assert_eq!(seq.next_expected(), 1);
        assert_eq!(seq.on_request("b".to_string()).unwrap().reqnum, 1);
    }

    #[test]
    fn test_ack_matched_by_sender_not_reqnum() {
        let mut seq = sequencer();
        seq.on_request("a".to_string());
        seq.on_request("b".to_string());
        ack_all(&mut seq, 0);
        assert_eq!(seq.in_flight(), Some(1));

        // A stale reqnum still clears the sender for the proposal in flight.
        seq.on_ack(&NodeId::from("n2"), 0);
        assert_eq!(seq.outstanding_acks(), 2);
        seq.on_ack(&NodeId::from("n1"), 1);
        seq.on_ack(&NodeId::from("n3"), 1);
        assert_eq!(seq.next_expected(), 2);
    }
}
