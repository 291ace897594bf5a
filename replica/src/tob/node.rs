//! Per-node protocol actor.
//!
//! One task owns all protocol state of a node: the sequencer (leader only)
//! and the replica executor. Inbound envelopes from every peer are funneled
//! through a single mailbox, so assigning a sequence number, proposing and
//! counting acknowledgements never interleave.

use std::io;
use std::time::Duration;

use slog::{debug, error, info, o, warn, Logger};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::time::{self, Interval, MissedTickBehavior};

use super::election::LeaderSelector;
use super::executor::ReplicaExecutor;
use super::message::Message;
use super::sequencer::{Broadcast, Sequencer};
use super::{Envelope, NodeId, Outbound};
use crate::error::{Error, Result};
use crate::metrics;
use crate::storage::{SnapshotHandle, StorageAdapter};

/// Point-in-time view of a node's protocol state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeStatus {
    pub next_assign: u64,
    pub next_expected: u64,
    pub pending: usize,
    pub in_flight: Option<u64>,
    pub applied: u64,
}

/// Channel ends handed out when a node is created.
pub struct Mailboxes {
    /// Delivers inbound envelopes to the node.
    pub inbox: UnboundedSender<Envelope>,
    /// Queues outbound messages; shared with the client gateway.
    pub outbox: UnboundedSender<Outbound>,
    /// Drained by the outbound dispatcher, in order.
    pub outgoing: UnboundedReceiver<Outbound>,
    pub status: watch::Receiver<NodeStatus>,
}

pub struct Node<S: StorageAdapter> {
    id: NodeId,
    leader: NodeId,
    sequencer: Option<Sequencer>, // only on the leader
    executor: ReplicaExecutor<S>,
    my_mailbox: UnboundedReceiver<Envelope>,
    out_mailbox: UnboundedSender<Outbound>,
    status: watch::Sender<NodeStatus>,
    snapshot_interval: Option<Duration>,
    last_checkpoint: u64,
    logger: Logger,
}

impl<S: StorageAdapter> Node<S> {
    pub fn new(
        id: NodeId,
        members: Vec<NodeId>,
        selector: &dyn LeaderSelector,
        storage: S,
        logger: &Logger,
    ) -> Result<(Self, Mailboxes)> {
        if !members.contains(&id) {
            return Err(Error::Config(format!("{} is not a member", id)));
        }
        let leader = selector
            .select(&members)
            .ok_or_else(|| Error::Config("membership is empty".to_string()))?;

        let logger = logger.new(o!("tag" => format!("peer_{}", id)));
        let sequencer = if leader == id {
            Some(Sequencer::new(members, &logger))
        } else {
            None
        };
        info!(logger, "node created"; "leader" => %leader, "is_leader" => sequencer.is_some());

        let (inbox, my_mailbox) = mpsc::unbounded_channel();
        let (outbox, outgoing) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(NodeStatus::default());
        let node = Node {
            executor: ReplicaExecutor::new(id.clone(), storage, &logger),
            id,
            leader,
            sequencer,
            my_mailbox,
            out_mailbox: outbox.clone(),
            status,
            snapshot_interval: None,
            last_checkpoint: 0,
            logger,
        };
        let mailboxes = Mailboxes {
            inbox,
            outbox,
            outgoing,
            status: status_rx,
        };
        Ok((node, mailboxes))
    }

    /// Checkpoints storage every `interval` while proposals keep being applied.
    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.snapshot_interval = Some(interval).filter(|i| !i.is_zero());
        self
    }

    pub fn leader(&self) -> &NodeId {
        &self.leader
    }

    /// Loads a snapshot into storage. Sequencing state is not restored.
    pub fn restore(&mut self, handle: &SnapshotHandle) -> Result<()> {
        self.executor.restore(handle)?;
        info!(self.logger, "storage restored"; "snapshot" => %handle);
        Ok(())
    }

    /// Processes messages until every inbox sender is dropped.
    pub async fn run(mut self) {
        let mut snapshot_timer = self.snapshot_interval.map(|period| {
            let mut timer = time::interval_at(time::Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });

        loop {
            tokio::select! {
                envelope = self.my_mailbox.recv() => match envelope {
                    Some(envelope) => {
                        self.on_envelope(envelope);
                        while let Ok(envelope) = self.my_mailbox.try_recv() {
                            self.on_envelope(envelope);
                        }
                        self.publish_status();
                    }
                    None => break,
                },
                _ = tick(&mut snapshot_timer) => self.handle_save_snapshot(),
            }
        }
        info!(self.logger, "mailbox closed, node stopped");
    }

    fn on_envelope(&mut self, envelope: Envelope) {
        let message = match Message::decode(&envelope.data) {
            Ok(message) => message,
            Err(e) => {
                metrics::MALFORMED_COUNTER.inc();
                warn!(self.logger, "dropping malformed message";
                    "from" => %envelope.from, "error" => %e);
                return;
            }
        };
        metrics::MESSAGE_COUNTER_VEC
            .with_label_values(&[message.kind()])
            .inc();
        debug!(self.logger, "received message"; "from" => %envelope.from, "message" => ?message);

        match self.handle_message(envelope.from, message) {
            Ok(()) => {}
            Err(e @ Error::UnexpectedRole { .. }) => {
                error!(self.logger, "message should not be here"; "error" => %e);
            }
            Err(e) => {
                error!(self.logger, "failed to handle message"; "error" => %e);
            }
        }
    }

    fn handle_message(&mut self, from: NodeId, message: Message) -> Result<()> {
        match message {
            Message::Request { request } => {
                let sequencer = self.sequencer.as_mut().ok_or(Error::UnexpectedRole {
                    kind: "REQUEST",
                    from,
                })?;
                if let Some(proposal) = sequencer.on_request(request) {
                    self.broadcast(proposal)?;
                }
            }
            Message::Proposal { request, reqnum } => {
                let ack = self.executor.on_proposal(reqnum, &request)?;
                self.send(from, &ack)?;
            }
            Message::Acknowledgement { reqnum, response } => {
                let sequencer = self.sequencer.as_mut().ok_or(Error::UnexpectedRole {
                    kind: "ACKNOWLEDGEMENT",
                    from,
                })?;
                let committed = sequencer.next_expected();
                let next = sequencer.on_ack(&response, reqnum);
                if sequencer.next_expected() > committed {
                    metrics::COMMITTED_COUNTER.inc();
                }
                if let Some(proposal) = next {
                    self.broadcast(proposal)?;
                }
            }
        }
        Ok(())
    }

    fn broadcast(&self, proposal: Broadcast) -> Result<()> {
        let data = Message::Proposal {
            request: proposal.request,
            reqnum: proposal.reqnum,
        }
        .encode()?;
        for to in proposal.to {
            self.post(Outbound {
                to,
                data: data.clone(),
            })?;
        }
        Ok(())
    }

    fn send(&self, to: NodeId, message: &Message) -> Result<()> {
        self.post(Outbound {
            to,
            data: message.encode()?,
        })
    }

    fn post(&self, outbound: Outbound) -> Result<()> {
        self.out_mailbox.send(outbound).map_err(|_| {
            Error::Transport(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "outbound mailbox closed",
            ))
        })
    }

    fn publish_status(&self) {
        let mut status = NodeStatus {
            applied: self.executor.applied(),
            ..Default::default()
        };
        if let Some(sequencer) = &self.sequencer {
            status.next_assign = sequencer.next_assign();
            status.next_expected = sequencer.next_expected();
            status.pending = sequencer.pending();
            status.in_flight = sequencer.in_flight();
            metrics::PENDING_GAUGE.set(sequencer.pending() as i64);
            metrics::OUTSTANDING_GAUGE.set(sequencer.outstanding_acks() as i64);
        }
        self.status.send_replace(status);
    }

    /// Checkpoints storage if anything was applied since the last checkpoint.
    fn handle_save_snapshot(&mut self) {
        let applied = self.executor.applied();
        if applied <= self.last_checkpoint {
            return;
        }
        let label = format!("{}-{}", self.id, applied);
        match self.executor.checkpoint(&label) {
            Ok(handle) => {
                info!(self.logger, "saved snapshot"; "applied" => applied, "snapshot" => %handle);
                self.last_checkpoint = applied;
            }
            Err(e) => {
                error!(self.logger, "failed to save snapshot"; "error" => %e);
            }
        }
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tob::election::FirstMember;
    use crate::tob::executor::tests::RecordingStorage;
    use crate::transport::{run_out_messages, LocalTransport};
    use std::collections::HashMap;
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_secs(5);

    struct TestCluster {
        inboxes: HashMap<NodeId, UnboundedSender<Envelope>>,
        outboxes: HashMap<NodeId, UnboundedSender<Outbound>>,
        storages: HashMap<NodeId, RecordingStorage>,
        status: HashMap<NodeId, watch::Receiver<NodeStatus>>,
    }

    impl TestCluster {
        /// Starts `ids` as one cluster; `deliver(from, to)` decides which
        /// messages the network carries.
        fn start<F>(ids: &[&str], deliver: F) -> TestCluster
        where
            F: Fn(&NodeId, &NodeId) -> bool + Send + Sync + 'static,
        {
            let logger = Logger::root(slog::Discard, o!());
            let members: Vec<NodeId> = ids.iter().map(|id| NodeId::from(*id)).collect();
            let deliver = Arc::new(deliver);

            let mut cluster = TestCluster {
                inboxes: HashMap::new(),
                outboxes: HashMap::new(),
                storages: HashMap::new(),
                status: HashMap::new(),
            };
            let mut nodes = Vec::new();
            for id in &members {
                let storage = RecordingStorage::default();
                let (node, mailboxes) =
                    Node::new(id.clone(), members.clone(), &FirstMember, storage.clone(), &logger)
                        .unwrap();
                cluster.inboxes.insert(id.clone(), mailboxes.inbox);
                cluster.outboxes.insert(id.clone(), mailboxes.outbox);
                cluster.storages.insert(id.clone(), storage);
                cluster.status.insert(id.clone(), mailboxes.status);
                nodes.push((id.clone(), node, mailboxes.outgoing));
            }

            for (id, node, outgoing) in nodes {
                let deliver = deliver.clone();
                let transport = LocalTransport::new(
                    id,
                    cluster.inboxes.clone(),
                    move |from: &NodeId, to: &NodeId| deliver(from, to),
                );
                tokio::spawn(run_out_messages(transport, outgoing));
                tokio::spawn(node.run());
            }
            cluster
        }

        /// Submits `request` at `at` the way the client gateway does.
        fn submit(&self, at: &str, request: &str) {
            let data = Message::Request {
                request: request.to_string(),
            }
            .encode()
            .unwrap();
            self.outboxes[&NodeId::from(at)]
                .send(Outbound {
                    to: NodeId::from("n1"),
                    data,
                })
                .unwrap();
        }

        fn ops(&self, id: &str) -> Vec<String> {
            self.storages[&NodeId::from(id)].ops.lock().unwrap().clone()
        }

        async fn wait_leader<P>(&self, predicate: P) -> NodeStatus
        where
            P: FnMut(&NodeStatus) -> bool,
        {
            let mut status = self.status[&NodeId::from("n1")].clone();
            let status = time::timeout(WAIT, status.wait_for(predicate))
                .await
                .expect("timed out waiting for leader")
                .unwrap();
            status.clone()
        }
    }

    #[tokio::test]
    async fn test_requests_applied_in_order_everywhere() {
        let cluster = TestCluster::start(&["n1", "n2", "n3"], |_, _| true);
        let requests: Vec<String> = (0..20).map(|i| format!("INSERT k{}", i)).collect();
        for (i, request) in requests.iter().enumerate() {
            let at = ["n1", "n2", "n3"][i % 3];
            cluster.submit(at, request);
        }

        let status = cluster.wait_leader(|s| s.next_expected == 20).await;
        assert_eq!(status.next_assign, 20);
        assert_eq!(status.pending, 0);
        assert_eq!(status.in_flight, None);

        // Every replica saw the leader's order, which is a permutation of the input.
        let order = cluster.ops("n1");
        let mut sorted = order.clone();
        sorted.sort();
        let mut expected = requests.clone();
        expected.sort();
        assert_eq!(sorted, expected);
        assert_eq!(cluster.ops("n2"), order);
        assert_eq!(cluster.ops("n3"), order);
    }

    #[tokio::test]
    async fn test_single_client_order_preserved() {
        let cluster = TestCluster::start(&["n1", "n2", "n3"], |_, _| true);
        cluster.submit("n2", "INSERT x");
        cluster.submit("n2", "INSERT y");
        cluster.submit("n2", "INSERT z");

        cluster.wait_leader(|s| s.next_expected == 3).await;
        for id in ["n1", "n2", "n3"] {
            assert_eq!(cluster.ops(id), vec!["INSERT x", "INSERT y", "INSERT z"]);
        }
    }

    #[tokio::test]
    async fn test_silent_replica_stalls_leader() {
        let n1 = NodeId::from("n1");
        let n3 = NodeId::from("n3");
        // n3 executes proposals but its acks never reach the leader.
        let cluster =
            TestCluster::start(&["n1", "n2", "n3"], move |from, to| !(from == &n3 && to == &n1));
        cluster.submit("n2", "INSERT a");
        cluster.submit("n2", "INSERT b");
        cluster.submit("n2", "INSERT c");

        cluster
            .wait_leader(|s| s.next_assign == 3 && s.applied == 1)
            .await;
        time::sleep(Duration::from_millis(200)).await;

        let status = cluster.status[&NodeId::from("n1")].borrow().clone();
        assert_eq!(status.next_expected, 0);
        assert_eq!(status.in_flight, Some(0));
        assert_eq!(status.pending, 2);
        for id in ["n1", "n2", "n3"] {
            assert_eq!(cluster.ops(id), vec!["INSERT a"]);
        }
    }

    #[tokio::test]
    async fn test_follower_drops_leader_only_messages() {
        let cluster = TestCluster::start(&["n1", "n2", "n3"], |_, _| true);
        let inbox = &cluster.inboxes[&NodeId::from("n2")];
        for message in [
            Message::Request {
                request: "INSERT x".to_string(),
            },
            Message::Acknowledgement {
                reqnum: 0,
                response: NodeId::from("n3"),
            },
        ] {
            inbox
                .send(Envelope {
                    from: NodeId::from("n3"),
                    data: message.encode().unwrap(),
                })
                .unwrap();
        }
        inbox
            .send(Envelope {
                from: NodeId::from("n3"),
                data: b"{broken".to_vec(),
            })
            .unwrap();

        let mut status = cluster.status[&NodeId::from("n2")].clone();
        time::timeout(WAIT, status.changed()).await.unwrap().unwrap();
        assert_eq!(*status.borrow(), NodeStatus::default());
        assert!(cluster.ops("n2").is_empty());
        assert!(cluster.ops("n1").is_empty());
    }

    #[tokio::test]
    async fn test_redelivered_proposal_reexecuted() {
        let cluster = TestCluster::start(&["n1", "n2", "n3"], |_, _| true);
        cluster.submit("n1", "INSERT x");
        cluster.wait_leader(|s| s.next_expected == 1).await;

        let proposal = Message::Proposal {
            request: "INSERT x".to_string(),
            reqnum: 0,
        };
        cluster.inboxes[&NodeId::from("n2")]
            .send(Envelope {
                from: NodeId::from("n1"),
                data: proposal.encode().unwrap(),
            })
            .unwrap();

        let mut status = cluster.status[&NodeId::from("n2")].clone();
        time::timeout(WAIT, status.wait_for(|s| s.applied == 2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cluster.ops("n2"), vec!["INSERT x", "INSERT x"]);
        // The late ack is an anomaly for the leader, not a new commit.
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cluster.status[&NodeId::from("n1")].borrow().next_expected, 1);
    }

    #[test]
    fn test_non_member_rejected() {
        let logger = Logger::root(slog::Discard, o!());
        let members = vec![NodeId::from("n1"), NodeId::from("n2")];
        let result = Node::new(
            NodeId::from("n9"),
            members,
            &FirstMember,
            RecordingStorage::default(),
            &logger,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
