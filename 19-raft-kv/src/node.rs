//! Core Raft node implementation.
//!
//! This module wraps the tikv/raft library to provide a simplified interface for
//! running a Raft consensus node. [`RaftNode`] combines the raw Raft state machine
//! with the replicated [`KvStateMachine`], and handles everything that happens when
//! entries commit: command application, membership changes, snapshots and
//! read-index responses.

use std::collections::HashMap;

use anyhow::{Context, Result};
use prost::Message as ProstMessage;
use raft::prelude::{
    ConfChange, ConfChangeType, Config, Entry, EntryType, Message, MessageType, RawNode, ReadState,
    Snapshot,
};
use raft::{StateRole, Storage};
use serde::{Deserialize, Serialize};
use slog::{o, Logger};
use tracing::{debug, info, warn};

use crate::error::KvResult;
use crate::fsm::{Applied, KvStateMachine};
use crate::storage::NodeStorage;
use crate::store::StoreState;

/// Applied entries between two automatic snapshots.
pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 1000;

/// Creates a logger that discards all output.
///
/// The tikv/raft library requires a logger, but we handle logging at the application
/// level with `tracing` instead.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// Identifies a proposal in the entry context: proposer id, then sequence number.
pub fn proposal_context(node_id: u64, seq: u64) -> Vec<u8> {
    let mut ctx = Vec::with_capacity(16);
    ctx.extend_from_slice(&node_id.to_be_bytes());
    ctx.extend_from_slice(&seq.to_be_bytes());
    ctx
}

/// Inverse of [`proposal_context`].
pub fn parse_proposal_context(ctx: &[u8]) -> Option<(u64, u64)> {
    if ctx.len() != 16 {
        return None;
    }
    let (node, seq) = ctx.split_at(8);
    Some((
        u64::from_be_bytes(node.try_into().ok()?),
        u64::from_be_bytes(seq.try_into().ok()?),
    ))
}

/// Snapshot payload as stored in the Raft log: the state machine blob plus the
/// address book, so a node fast-forwarded by snapshot can reach every member.
#[derive(Serialize, Deserialize)]
struct SnapshotEnvelope {
    state: Vec<u8>,
    peers: HashMap<u64, String>,
}

/// Membership change carried by a committed configuration entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberChange {
    Added,
    Removed,
}

/// What applying one committed entry did.
#[derive(Debug)]
pub enum ApplyOutcome {
    Command(KvResult<Applied>),
    ConfChange { node_id: u64, change: MemberChange },
    ConfChangeRejected(String),
    /// Leader no-op or a configuration change Raft refused and blanked.
    Noop,
}

/// Records details when an entry is applied.
///
/// The runtime uses these reports to answer the client that proposed the
/// entry, matched by the proposal id in the entry context.
#[derive(Debug)]
pub struct ApplyReport {
    pub index: u64,
    pub term: u64,
    /// `(proposer id, sequence)` from the entry context, if any.
    pub proposal: Option<(u64, u64)>,
    pub outcome: ApplyOutcome,
}

/// Output from processing a Raft ready state.
///
/// - **messages**: Raft messages to send to other nodes
/// - **applied**: committed entries applied locally, in log order
/// - **read_states**: read-index confirmations for pending linearizable reads
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub applied: Vec<ApplyReport>,
    pub read_states: Vec<ReadState>,
}

/// A Raft consensus node with the integrated key-value state machine.
///
/// The node exposes a simplified interface: `propose` to submit commands,
/// `step` to process incoming Raft messages, `poll_ready` to advance state.
pub struct RaftNode {
    id: u64,
    raw: RawNode<NodeStorage>,
    storage: NodeStorage,
    fsm: KvStateMachine,
    /// Raft address of every member this node has heard of, including itself.
    peers: HashMap<u64, String>,
    snapshot_interval: u64,
    conf_changed: bool,
}

impl RaftNode {
    /// Creates a new Raft node.
    ///
    /// `storage` decides whether the node starts as a voter of the initial
    /// configuration ([`NodeStorage::with_voters`]) or waits for the leader
    /// to add it ([`NodeStorage::joining`]).
    ///
    /// # Raft timing configuration
    ///
    /// - `election_tick: 10`: Elections triggered after ~1 second of no leader heartbeats
    /// - `heartbeat_tick: 3`: Leader sends heartbeats every ~300ms
    /// - `check_quorum`: a leader that cannot reach a quorum steps down
    /// - Assumes each `tick()` call happens every 100ms (set by runtime)
    pub fn new(id: u64, storage: NodeStorage, fsm: KvStateMachine) -> Result<Self> {
        let cfg = Config {
            id,
            election_tick: 10,
            heartbeat_tick: 3,
            max_inflight_msgs: 256,
            check_quorum: true,
            ..Default::default()
        };
        let logger = silent_logger();
        let raw = RawNode::new(&cfg, storage.clone(), &logger)
            .with_context(|| format!("failed to construct RawNode {id}"))?;
        Ok(Self {
            id,
            raw,
            storage,
            fsm,
            peers: HashMap::new(),
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            conf_changed: false,
        })
    }

    pub fn with_peers(mut self, peers: HashMap<u64, String>) -> Self {
        self.peers.extend(peers);
        self
    }

    pub fn with_snapshot_interval(mut self, interval: u64) -> Self {
        self.snapshot_interval = interval.max(1);
        self
    }

    /// Advances Raft's logical clock by one tick.
    pub fn tick(&mut self) {
        self.raw.tick();
    }

    /// Starts an election to become leader.
    pub fn campaign(&mut self) -> Result<()> {
        self.raw.campaign().context("campaign failed")
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> StateRole {
        self.raw.raft.state
    }

    /// Returns the current leader's ID, or 0 if no leader is known.
    pub fn leader_id(&self) -> u64 {
        self.raw.raft.leader_id
    }

    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    pub fn committed_index(&self) -> u64 {
        self.raw.raft.raft_log.committed
    }

    /// Whether the commit index includes an entry from the current term.
    ///
    /// Until it does, a new leader's commit index may trail the cluster's.
    pub fn committed_in_current_term(&self) -> bool {
        let log = &self.raw.raft.raft_log;
        log.term(log.committed).map_or(false, |term| term == self.term())
    }

    pub fn applied_index(&self) -> u64 {
        self.fsm.applied_index()
    }

    pub fn fsm(&self) -> &KvStateMachine {
        &self.fsm
    }

    pub fn storage(&self) -> &NodeStorage {
        &self.storage
    }

    pub fn voters(&self) -> Vec<u64> {
        let mut voters = self
            .storage
            .conf_state()
            .map(|cs| cs.voters)
            .unwrap_or_default();
        voters.sort_unstable();
        voters
    }

    pub fn peer_address(&self, id: u64) -> Option<&str> {
        self.peers.get(&id).map(String::as_str)
    }

    /// Records where `id` can be reached, unless an address is already known.
    ///
    /// A node that joined with an empty address book learns the leader this
    /// way, from the first frame the leader sends it.
    pub fn learn_peer(&mut self, id: u64, address: &str) {
        if id == 0 || address.is_empty() || self.peers.contains_key(&id) {
            return;
        }
        debug!(node = self.id, peer = id, %address, "learned peer address");
        self.peers.insert(id, address.to_owned());
    }

    /// Proposes an encoded [`crate::command::Command`] to be replicated.
    ///
    /// Returns the log index the entry was appended at. Success only means
    /// "added to the leader's log"; `poll_ready()` reports when it applies.
    pub fn propose(&mut self, context: Vec<u8>, command: Vec<u8>) -> Result<u64> {
        self.raw.propose(context, command).context("propose failed")?;
        Ok(self.raw.raft.raft_log.last_index())
    }

    /// Proposes adding `node_id` as a voter reachable at `address`.
    pub fn propose_add_voter(
        &mut self,
        context: Vec<u8>,
        node_id: u64,
        address: &str,
    ) -> Result<u64> {
        let mut cc = ConfChange::default();
        cc.set_change_type(ConfChangeType::AddNode);
        cc.node_id = node_id;
        cc.context = address.as_bytes().to_vec().into();
        self.propose_conf_change(context, cc)
    }

    pub fn propose_remove_voter(&mut self, context: Vec<u8>, node_id: u64) -> Result<u64> {
        let mut cc = ConfChange::default();
        cc.set_change_type(ConfChangeType::RemoveNode);
        cc.node_id = node_id;
        self.propose_conf_change(context, cc)
    }

    fn propose_conf_change(&mut self, context: Vec<u8>, cc: ConfChange) -> Result<u64> {
        self.raw
            .propose_conf_change(context, cc)
            .context("propose conf change failed")?;
        Ok(self.raw.raft.raft_log.last_index())
    }

    /// Requests a read-index barrier tagged with `context`.
    ///
    /// On a follower this asks the leader to confirm its commit index with a
    /// quorum; the answer arrives as a [`ReadState`] in a later bundle.
    pub fn read_index(&mut self, context: Vec<u8>) {
        self.raw.read_index(context);
    }

    /// Processes a Raft message from another node.
    ///
    /// A snapshot whose payload does not decode is refused here, before raft
    /// adopts its metadata, so the node keeps its current state.
    pub fn step(&mut self, msg: Message) -> Result<()> {
        if msg.msg_type() == MessageType::MsgSnapshot {
            let envelope: SnapshotEnvelope = bincode::deserialize(&msg.get_snapshot().data)
                .context("refused snapshot with undecodable envelope")?;
            bincode::deserialize::<StoreState>(&envelope.state)
                .context("refused snapshot with undecodable state")?;
        }
        self.raw.step(msg).context("step failed")
    }

    /// Checks if Raft has work to do, processes it, and returns results.
    ///
    /// # Processing flow
    ///
    /// **Ready**:
    /// 1. Collect messages that may be sent before persistence
    /// 2. Install any snapshot received from the leader
    /// 3. Apply committed entries to the state machine
    /// 4. Append new log entries and persist hard state
    /// 5. Collect messages that required persistence, and read states
    ///
    /// **LightReady** (after `advance`):
    /// 1. Update commit index if it advanced
    /// 2. Apply any additional committed entries
    /// 3. Collect additional outbound messages
    ///
    /// Finally a snapshot is taken if enough entries were applied or the
    /// membership changed.
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>> {
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut applied = Vec::new();
        let mut outbound = ready.take_messages();

        if !ready.snapshot().is_empty() {
            self.install_snapshot(ready.snapshot().clone())?;
        }

        applied.extend(self.apply_entries(ready.take_committed_entries())?);

        if !ready.entries().is_empty() {
            self.storage
                .mem()
                .wl()
                .append(ready.entries())
                .context("append entries failed")?;
        }

        if let Some(hard_state) = ready.hs() {
            self.storage.mem().wl().set_hardstate(hard_state.clone());
        }

        outbound.extend(ready.take_persisted_messages());
        let read_states = ready.take_read_states();

        let mut light_ready = self.raw.advance(ready);

        if let Some(commit) = light_ready.commit_index() {
            self.storage.mem().wl().mut_hard_state().set_commit(commit);
        }

        outbound.extend(light_ready.take_messages());
        applied.extend(self.apply_entries(light_ready.take_committed_entries())?);

        self.raw.advance_apply();
        self.maybe_snapshot()?;

        Ok(Some(ReadyBundle {
            messages: outbound,
            applied,
            read_states,
        }))
    }

    /// Applies committed entries to the state machine, in log order.
    ///
    /// Entries that carry no command still advance the applied index, so a
    /// read barrier at a leader no-op or a membership change can complete.
    fn apply_entries(&mut self, entries: Vec<Entry>) -> Result<Vec<ApplyReport>> {
        let mut applied = Vec::with_capacity(entries.len());
        for entry in entries {
            let outcome = match entry.entry_type() {
                EntryType::EntryNormal if entry.data.is_empty() => {
                    self.fsm.skip(entry.index);
                    ApplyOutcome::Noop
                }
                EntryType::EntryNormal => {
                    let result = self.fsm.apply(entry.index, &entry.data);
                    if let Err(err) = &result {
                        warn!(node = self.id, index = entry.index, error = %err, "rejected log entry");
                    }
                    ApplyOutcome::Command(result)
                }
                EntryType::EntryConfChange => {
                    let outcome = self.apply_conf_change(&entry)?;
                    self.fsm.skip(entry.index);
                    outcome
                }
                EntryType::EntryConfChangeV2 => {
                    warn!(node = self.id, index = entry.index, "ignoring joint conf change entry");
                    self.fsm.skip(entry.index);
                    ApplyOutcome::Noop
                }
            };
            debug!(node = self.id, index = entry.index, term = entry.term, ?outcome, "applied entry");
            applied.push(ApplyReport {
                index: entry.index,
                term: entry.term,
                proposal: parse_proposal_context(&entry.context),
                outcome,
            });
        }
        Ok(applied)
    }

    fn apply_conf_change(&mut self, entry: &Entry) -> Result<ApplyOutcome> {
        let cc = match ConfChange::decode(&entry.data[..]) {
            Ok(cc) => cc,
            Err(err) => {
                warn!(node = self.id, index = entry.index, error = %err, "undecodable conf change");
                return Ok(ApplyOutcome::ConfChangeRejected(err.to_string()));
            }
        };
        let conf_state = match self.raw.apply_conf_change(&cc) {
            Ok(conf_state) => conf_state,
            Err(err) => {
                warn!(node = self.id, target = cc.node_id, error = %err, "conf change rejected");
                return Ok(ApplyOutcome::ConfChangeRejected(err.to_string()));
            }
        };
        self.storage.mem().wl().set_conf_state(conf_state);
        self.conf_changed = true;

        let change = match cc.change_type() {
            ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                if !cc.context.is_empty() {
                    let address = String::from_utf8_lossy(&cc.context).into_owned();
                    self.peers.insert(cc.node_id, address);
                }
                MemberChange::Added
            }
            ConfChangeType::RemoveNode => MemberChange::Removed,
        };
        info!(node = self.id, target = cc.node_id, ?change, voters = ?self.voters(), "membership changed");
        Ok(ApplyOutcome::ConfChange {
            node_id: cc.node_id,
            change,
        })
    }

    /// Replaces local state with a snapshot shipped by the leader.
    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let index = snapshot.get_metadata().index;
        let envelope: SnapshotEnvelope =
            bincode::deserialize(&snapshot.data).context("decode snapshot envelope failed")?;
        self.fsm.restore(index, &envelope.state)?;
        for (id, address) in envelope.peers {
            self.peers.entry(id).or_insert(address);
        }
        self.storage
            .install(snapshot)
            .context("apply snapshot failed")?;
        info!(node = self.id, index, "installed snapshot from leader");
        Ok(())
    }

    /// Snapshots the state machine and compacts the log when due.
    ///
    /// Taken every `snapshot_interval` applied entries, and after each
    /// membership change so that new members are caught up by snapshot.
    fn maybe_snapshot(&mut self) -> Result<()> {
        let applied = self.fsm.applied_index();
        let last_snapshot = self.storage.latest_snapshot_index();
        if applied <= last_snapshot {
            self.conf_changed = false;
            return Ok(());
        }
        if !self.conf_changed && applied - last_snapshot < self.snapshot_interval {
            return Ok(());
        }
        self.conf_changed = false;

        let envelope = SnapshotEnvelope {
            state: self.fsm.snapshot()?,
            peers: self.peers.clone(),
        };
        let mut snapshot = Snapshot::default();
        snapshot.data = bincode::serialize(&envelope)
            .context("encode snapshot envelope failed")?
            .into();
        let meta = snapshot.mut_metadata();
        meta.index = applied;
        meta.term = self.storage.term(applied).context("snapshot term lookup failed")?;
        meta.set_conf_state(self.storage.conf_state()?);

        self.storage
            .compact_to(snapshot)
            .context("log compaction failed")?;
        info!(node = self.id, index = applied, "took snapshot and compacted log");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::store::KvStore;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn new_node(id: u64, storage: NodeStorage) -> Result<RaftNode> {
        let fsm = KvStateMachine::new(Arc::new(KvStore::new()));
        let peers = (1..=4).map(|i| (i, format!("node-{i}"))).collect();
        Ok(RaftNode::new(id, storage, fsm)?.with_peers(peers))
    }

    /// Test harness for simulating a Raft cluster without networking.
    ///
    /// Routes messages between nodes in-memory for deterministic testing
    /// of election, replication and read barriers.
    struct TestCluster {
        nodes: HashMap<u64, RaftNode>,
        read_states: HashMap<u64, Vec<ReadState>>,
        reports: HashMap<u64, Vec<ApplyReport>>,
        seq: u64,
    }

    impl TestCluster {
        /// Creates a cluster of N voters with sequential IDs starting from 1.
        fn new(n: usize) -> Result<Self> {
            let ids: Vec<u64> = (1..=n as u64).collect();
            let mut nodes = HashMap::new();
            for &id in &ids {
                nodes.insert(id, new_node(id, NodeStorage::with_voters(&ids))?);
            }
            Ok(Self {
                nodes,
                read_states: HashMap::new(),
                reports: HashMap::new(),
                seq: 0,
            })
        }

        /// Three voters, node 1 elected.
        fn with_leader() -> Result<Self> {
            let mut cluster = Self::new(3)?;
            cluster.node_mut(1).campaign()?;
            cluster.stabilize(10)?;
            assert_eq!(cluster.assert_single_leader(), 1);
            Ok(cluster)
        }

        fn node_mut(&mut self, id: u64) -> &mut RaftNode {
            self.nodes.get_mut(&id).expect("node not found")
        }

        fn node(&self, id: u64) -> &RaftNode {
            self.nodes.get(&id).expect("node not found")
        }

        fn tick_all(&mut self) {
            for node in self.nodes.values_mut() {
                node.tick();
            }
        }

        fn put(&mut self, leader: u64, key: &str, value: &str) -> Result<u64> {
            self.seq += 1;
            let ctx = proposal_context(leader, self.seq);
            let data = Command::put(key, value).encode()?;
            self.node_mut(leader).propose(ctx, data)
        }

        fn deliver_messages(&mut self) -> Result<usize> {
            self.deliver_filtered(|_| true)
        }

        /// Processes ready states for all nodes and routes the messages that
        /// `keep` accepts, until no node has anything left to say.
        ///
        /// Returns number of messages delivered.
        fn deliver_filtered(&mut self, keep: impl Fn(&Message) -> bool) -> Result<usize> {
            let mut total_delivered = 0;
            loop {
                let mut messages = Vec::new();

                for node in self.nodes.values_mut() {
                    if let Some(bundle) = node.poll_ready()? {
                        messages.extend(bundle.messages);
                        self.read_states
                            .entry(node.id())
                            .or_default()
                            .extend(bundle.read_states);
                        self.reports
                            .entry(node.id())
                            .or_default()
                            .extend(bundle.applied);
                    }
                }

                if messages.is_empty() {
                    break;
                }

                for msg in messages {
                    if !keep(&msg) {
                        continue;
                    }
                    if let Some(node) = self.nodes.get_mut(&msg.to) {
                        total_delivered += 1;
                        // Responses from peers outside the configuration are
                        // refused by raft; the runtime drops them as well.
                        if let Err(err) = node.step(msg) {
                            match err.downcast_ref::<raft::Error>() {
                                Some(raft::Error::StepPeerNotFound) => {}
                                _ => return Err(err),
                            }
                        }
                    }
                }
            }
            Ok(total_delivered)
        }

        /// Runs ticks + message delivery until messages stop flowing or max iterations.
        fn stabilize(&mut self, max_iters: usize) -> Result<usize> {
            for i in 0..max_iters {
                self.tick_all();
                let delivered = self.deliver_messages()?;
                if delivered == 0 {
                    return Ok(i + 1);
                }
            }
            Ok(max_iters)
        }

        /// Runs exactly `iters` rounds of ticks + delivery.
        fn run_for(&mut self, iters: usize) -> Result<()> {
            for _ in 0..iters {
                self.tick_all();
                self.deliver_messages()?;
            }
            Ok(())
        }

        fn assert_single_leader(&self) -> u64 {
            let leaders: Vec<u64> = self
                .nodes
                .iter()
                .filter(|(_, n)| n.role() == StateRole::Leader)
                .map(|(id, _)| *id)
                .collect();
            assert_eq!(leaders.len(), 1, "expected exactly one leader, found: {:?}", leaders);
            leaders[0]
        }

        fn value(&self, id: u64, key: &str) -> Option<Vec<u8>> {
            self.node(id).fsm().store().get(key)
        }
    }

    #[test]
    fn test_basic_three_node_election() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;

        for id in 1..=3 {
            assert_eq!(cluster.node(id).role(), StateRole::Follower);
            assert_eq!(cluster.node(id).leader_id(), 0);
        }

        cluster.node_mut(1).campaign()?;
        cluster.stabilize(10)?;

        assert_eq!(cluster.assert_single_leader(), 1);
        for id in 1..=3 {
            assert_eq!(cluster.node(id).leader_id(), 1);
        }
        Ok(())
    }

    #[test]
    fn test_no_split_brain_during_forced_campaign() -> Result<()> {
        let mut cluster = TestCluster::with_leader()?;

        cluster.node_mut(2).campaign()?;
        for _ in 0..20 {
            cluster.tick_all();
            cluster.deliver_messages()?;
            let leader_count = cluster
                .nodes
                .values()
                .filter(|n| n.role() == StateRole::Leader)
                .count();
            assert!(leader_count <= 1, "SPLIT BRAIN DETECTED: {} leaders", leader_count);
        }

        // check_quorum may force the old leader down; give the re-election time.
        cluster.run_for(40)?;
        cluster.assert_single_leader();
        Ok(())
    }

    #[test]
    fn test_committed_writes_converge_on_every_replica() -> Result<()> {
        let mut cluster = TestCluster::with_leader()?;

        cluster.put(1, "a", "1")?;
        cluster.put(1, "b", "2")?;
        cluster.put(1, "a", "3")?;
        cluster.stabilize(10)?;

        let expected = cluster.node(1).fsm().store().dump();
        assert_eq!(expected.get("a"), Some(&b"3".to_vec()));
        for id in 2..=3 {
            assert_eq!(cluster.node(id).fsm().store().dump(), expected);
            assert_eq!(cluster.node(id).applied_index(), cluster.node(1).applied_index());
        }
        Ok(())
    }

    #[test]
    fn test_apply_report_carries_proposal_context() -> Result<()> {
        let mut cluster = TestCluster::with_leader()?;
        let index = cluster.node_mut(1).propose(
            proposal_context(1, 99),
            Command::put("k", "v").encode()?,
        )?;
        cluster.stabilize(10)?;

        let report = cluster
            .reports
            .get(&1)
            .and_then(|reports| reports.iter().find(|r| r.index == index))
            .expect("proposal should apply on the leader");
        assert_eq!(report.proposal, Some((1, 99)));
        assert!(matches!(report.outcome, ApplyOutcome::Command(Ok(Applied::Put))));

        let follower = cluster
            .reports
            .get(&2)
            .and_then(|reports| reports.iter().find(|r| r.index == index))
            .expect("proposal should apply on followers too");
        assert_eq!(follower.proposal, Some((1, 99)));
        Ok(())
    }

    #[test]
    fn test_malformed_entry_is_rejected_identically_everywhere() -> Result<()> {
        let mut cluster = TestCluster::with_leader()?;
        cluster.put(1, "keep", "me")?;
        cluster
            .node_mut(1)
            .propose(proposal_context(1, 1000), b"\x09\x00\x00\x00nonsense".to_vec())?;
        cluster.stabilize(10)?;

        for id in 1..=3 {
            assert_eq!(cluster.value(id, "keep"), Some(b"me".to_vec()));
            assert_eq!(cluster.node(id).fsm().store().len(), 1);
        }
        Ok(())
    }

    #[test]
    fn test_follower_read_barrier_waits_for_lagging_apply() -> Result<()> {
        let mut cluster = TestCluster::with_leader()?;
        cluster.put(1, "a", "1")?;
        cluster.stabilize(10)?;
        assert_eq!(cluster.value(3, "a"), Some(b"1".to_vec()));

        // Node 3 stops receiving log entries but still hears heartbeats.
        let starve_node_3 = |m: &Message| !(m.to == 3 && m.msg_type() == MessageType::MsgAppend);
        cluster.put(1, "a", "2")?;
        cluster.deliver_filtered(starve_node_3)?;
        assert_eq!(cluster.value(1, "a"), Some(b"2".to_vec()));
        assert_eq!(cluster.value(3, "a"), Some(b"1".to_vec()));

        cluster.node_mut(3).read_index(b"read-1".to_vec());
        cluster.deliver_filtered(starve_node_3)?;

        let state = cluster
            .read_states
            .get(&3)
            .and_then(|states| states.iter().find(|s| s.request_ctx == b"read-1"))
            .cloned()
            .expect("leader should confirm the read index");
        assert!(state.index >= cluster.node(1).fsm().applied_index());
        assert!(cluster.node(3).applied_index() < state.index);

        // The barrier must not let node 3 answer from its stale store.
        let applied = cluster.node(3).fsm().applied();
        assert!(!applied.wait_for(state.index, Instant::now() + Duration::from_millis(20)));

        cluster.run_for(10)?;
        assert!(applied.wait_for(state.index, Instant::now() + Duration::from_millis(20)));
        assert_eq!(cluster.value(3, "a"), Some(b"2".to_vec()));
        Ok(())
    }

    #[test]
    fn test_isolated_follower_gets_no_read_index() -> Result<()> {
        let mut cluster = TestCluster::with_leader()?;
        cluster.put(1, "a", "1")?;
        cluster.stabilize(10)?;

        cluster.node_mut(3).read_index(b"cut-off".to_vec());
        cluster.deliver_filtered(|m| m.to != 3 && m.from != 3)?;

        let confirmed = cluster
            .read_states
            .get(&3)
            .map_or(false, |states| states.iter().any(|s| s.request_ctx == b"cut-off"));
        assert!(!confirmed, "a partitioned follower must not obtain a read index");
        Ok(())
    }

    #[test]
    fn test_snapshot_taken_after_interval() -> Result<()> {
        let mut cluster = TestCluster::new(3)?;
        for node in cluster.nodes.values_mut() {
            node.snapshot_interval = 3;
        }
        cluster.node_mut(1).campaign()?;
        cluster.stabilize(10)?;

        for i in 0..5 {
            cluster.put(1, &format!("k{i}"), "v")?;
        }
        cluster.stabilize(10)?;

        for id in 1..=3 {
            let node = cluster.node(id);
            assert!(node.storage().latest_snapshot_index() > 0);
            assert!(node.storage().first_index()? > 1);
            assert_eq!(node.fsm().store().len(), 5);
        }
        Ok(())
    }

    #[test]
    fn test_joining_node_catches_up_from_snapshot() -> Result<()> {
        let mut cluster = TestCluster::with_leader()?;
        cluster.put(1, "before", "join")?;
        cluster.stabilize(10)?;

        // The joiner knows no addresses; the snapshot envelope supplies them.
        let fsm = KvStateMachine::new(Arc::new(KvStore::new()));
        let joiner = RaftNode::new(4, NodeStorage::joining(), fsm)?;
        assert_eq!(joiner.peer_address(1), None);
        cluster.nodes.insert(4, joiner);
        cluster
            .node_mut(1)
            .propose_add_voter(proposal_context(1, 500), 4, "node-4-new")?;
        cluster.run_for(20)?;

        assert_eq!(cluster.node(1).voters(), vec![1, 2, 3, 4]);
        assert_eq!(cluster.node(4).voters(), vec![1, 2, 3, 4]);
        assert_eq!(cluster.value(4, "before"), Some(b"join".to_vec()));
        assert_eq!(cluster.node(2).peer_address(4), Some("node-4-new"));
        for id in 1..=3 {
            assert_eq!(cluster.node(4).peer_address(id), Some(format!("node-{id}").as_str()));
        }

        cluster.put(1, "after", "join")?;
        cluster.run_for(5)?;
        assert_eq!(cluster.value(4, "after"), Some(b"join".to_vec()));
        assert_eq!(
            cluster.node(4).fsm().store().dump(),
            cluster.node(1).fsm().store().dump()
        );
        Ok(())
    }

    #[test]
    fn test_remove_voter_shrinks_configuration() -> Result<()> {
        let mut cluster = TestCluster::with_leader()?;
        cluster
            .node_mut(1)
            .propose_remove_voter(proposal_context(1, 600), 3)?;
        cluster.run_for(5)?;

        assert_eq!(cluster.node(1).voters(), vec![1, 2]);
        assert_eq!(cluster.node(2).voters(), vec![1, 2]);

        cluster.put(1, "two", "voters")?;
        cluster.run_for(5)?;
        assert_eq!(cluster.value(2, "two"), Some(b"voters".to_vec()));
        Ok(())
    }

    #[test]
    fn test_corrupt_snapshot_is_refused_and_node_keeps_replicating() -> Result<()> {
        let mut cluster = TestCluster::with_leader()?;
        cluster.put(1, "a", "1")?;
        cluster.stabilize(10)?;
        let applied_before = cluster.node(3).applied_index();

        let mut snapshot = Snapshot::default();
        snapshot.data = b"not an envelope".to_vec().into();
        let meta = snapshot.mut_metadata();
        meta.index = 100;
        meta.term = cluster.node(1).term();
        meta.set_conf_state(raft::prelude::ConfState::from((vec![1, 2, 3], vec![])));

        let mut msg = Message::default();
        msg.set_msg_type(MessageType::MsgSnapshot);
        msg.from = 1;
        msg.to = 3;
        msg.term = cluster.node(1).term();
        msg.set_snapshot(snapshot);

        assert!(cluster.node_mut(3).step(msg).is_err());
        assert!(cluster.node_mut(3).poll_ready().is_ok());
        assert_eq!(cluster.node(3).applied_index(), applied_before);
        assert_eq!(cluster.value(3, "a"), Some(b"1".to_vec()));

        cluster.put(1, "a", "2")?;
        cluster.stabilize(10)?;
        assert_eq!(cluster.value(3, "a"), Some(b"2".to_vec()));
        Ok(())
    }

    #[test]
    fn test_undecodable_conf_change_is_skipped() -> Result<()> {
        let mut node = new_node(1, NodeStorage::with_voters(&[1]))?;
        let mut entry = Entry::default();
        entry.set_entry_type(EntryType::EntryConfChange);
        entry.index = 1;
        entry.term = 1;
        entry.data = b"\xff\xff\xff".to_vec().into();

        let reports = node.apply_entries(vec![entry])?;
        assert!(matches!(reports[0].outcome, ApplyOutcome::ConfChangeRejected(_)));
        assert_eq!(node.applied_index(), 1);
        assert_eq!(node.voters(), vec![1]);
        Ok(())
    }
}
