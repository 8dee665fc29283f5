//! Worker runtime and network handling for Raft nodes.
//!
//! This module orchestrates the threading model and network communication:
//!
//! - **Worker thread**: Runs the Raft event loop, processes engine requests
//! - **Network listener thread**: Accepts TCP connections from peers
//! - **Connection handler threads**: Short-lived threads that read messages and forward to worker
//! - **Outbox threads**: One per peer address, writes outbound messages
//!
//! Every frame names the raft address of its sender, so a node that joined
//! with an empty address book can still answer whoever contacts it.
//!
//! Communication uses crossbeam channels to keep the worker single-threaded
//! while network I/O runs concurrently. [`NodeHandle`] is the only way in,
//! and implements [`ConsensusEngine`] on top of those channels.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use prost::Message as ProstMessage;
use raft::prelude::{Message, MessageType, ReadState};
use raft::StateRole;
use tracing::{debug, error, info, warn};

use crate::engine::{ConsensusEngine, EngineStatus, LeaderInfo, NodeRole};
use crate::error::EngineError;
use crate::fsm::KvStateMachine;
use crate::node::{
    parse_proposal_context, proposal_context, ApplyOutcome, ApplyReport, RaftNode,
    DEFAULT_SNAPSHOT_INTERVAL,
};
use crate::storage::NodeStorage;

/// Raft logical clock interval.
///
/// The worker calls `node.tick()` every 100ms, which drives Raft's timeout logic:
/// - Heartbeat timeout: 3 ticks = 300ms
/// - Election timeout: 10 ticks = 1000ms
const TICK_INTERVAL: Duration = Duration::from_millis(100);

const CONNECT_TIMEOUT: Duration = Duration::from_millis(250);
const WRITE_TIMEOUT: Duration = Duration::from_millis(500);

/// Largest raft message accepted from a peer.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// A raft message as read off the wire, with the sender's raft address.
struct Inbound {
    sender: String,
    msg: Message,
}

/// Configuration for spawning a Raft node.
///
/// Specifies the node's identity and how to reach the cluster members.
pub struct NodeConfig {
    pub id: u64,
    /// Address to bind for incoming Raft messages (e.g., "127.0.0.1:7101")
    pub listen_addr: String,
    /// Map of node ID to raft address. For a bootstrap member this is the
    /// initial voter set and must include this node.
    pub peers: HashMap<u64, String>,
    /// Start with an empty configuration and wait for the leader to add us.
    pub join: bool,
    pub snapshot_interval: u64,
}

impl NodeConfig {
    pub fn new(id: u64, listen_addr: impl Into<String>, peers: HashMap<u64, String>) -> Self {
        Self {
            id,
            listen_addr: listen_addr.into(),
            peers,
            join: false,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
        }
    }
}

/// What the worker last reported about itself. Read without a round trip.
struct Published {
    status: EngineStatus,
    leader_address: Option<String>,
}

/// Handle for sending requests to a running Raft node.
///
/// The worker thread owns the actual `RaftNode` and processes requests via
/// a channel. Every call waits at most its own timeout for the answer.
#[derive(Clone)]
pub struct NodeHandle {
    request_tx: Sender<ClientRequest>,
    published: Arc<RwLock<Published>>,
}

impl NodeHandle {
    /// Forces this node to start an election campaign.
    pub fn campaign(&self) -> Result<()> {
        let (resp_tx, resp_rx) = unbounded();
        self.request_tx
            .send(ClientRequest::Campaign {
                respond_to: resp_tx,
            })
            .context("failed to send campaign request")?;
        resp_rx.recv().context("campaign response channel closed")?
    }

    /// Signals the worker to shut down gracefully.
    pub fn shutdown(&self) -> Result<()> {
        self.request_tx
            .send(ClientRequest::Shutdown)
            .context("failed to send shutdown")?;
        Ok(())
    }

    fn call(
        &self,
        timeout: Duration,
        request: impl FnOnce(Reply) -> ClientRequest,
    ) -> Result<u64, EngineError> {
        let (resp_tx, resp_rx) = unbounded();
        let deadline = Instant::now() + timeout;
        self.request_tx
            .send(request(resp_tx))
            .map_err(|_| EngineError::Unavailable("raft worker stopped".into()))?;
        match resp_rx.recv_deadline(deadline) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(EngineError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                Err(EngineError::Unavailable("raft worker dropped the request".into()))
            }
        }
    }
}

impl ConsensusEngine for NodeHandle {
    fn propose(&self, command: Vec<u8>, timeout: Duration) -> Result<u64, EngineError> {
        let deadline = Instant::now() + timeout;
        self.call(timeout, |respond_to| ClientRequest::Propose {
            command,
            deadline,
            respond_to,
        })
    }

    fn role(&self) -> NodeRole {
        self.published.read().status.role
    }

    fn leader(&self) -> Option<LeaderInfo> {
        let published = self.published.read();
        published.status.leader_id.map(|id| LeaderInfo {
            id,
            address: published.leader_address.clone(),
        })
    }

    fn read_index(&self, timeout: Duration) -> Result<u64, EngineError> {
        let deadline = Instant::now() + timeout;
        self.call(timeout, |respond_to| ClientRequest::ReadIndex {
            deadline,
            respond_to,
        })
    }

    fn add_voter(&self, id: u64, address: String, timeout: Duration) -> Result<(), EngineError> {
        let deadline = Instant::now() + timeout;
        self.call(timeout, |respond_to| ClientRequest::AddVoter {
            id,
            address,
            deadline,
            respond_to,
        })
        .map(|_| ())
    }

    fn remove_voter(&self, id: u64, timeout: Duration) -> Result<(), EngineError> {
        let deadline = Instant::now() + timeout;
        self.call(timeout, |respond_to| ClientRequest::RemoveVoter {
            id,
            deadline,
            respond_to,
        })
        .map(|_| ())
    }

    fn status(&self) -> EngineStatus {
        self.published.read().status.clone()
    }
}

type Reply = Sender<Result<u64, EngineError>>;

/// Requests sent from engine handles to the worker thread.
///
/// Uses the request-response pattern: most variants include a one-shot
/// channel for the worker to send back the result.
enum ClientRequest {
    Propose {
        command: Vec<u8>,
        deadline: Instant,
        respond_to: Reply,
    },
    AddVoter {
        id: u64,
        address: String,
        deadline: Instant,
        respond_to: Reply,
    },
    RemoveVoter {
        id: u64,
        deadline: Instant,
        respond_to: Reply,
    },
    ReadIndex {
        deadline: Instant,
        respond_to: Reply,
    },
    Campaign {
        respond_to: Sender<Result<()>>,
    },
    Shutdown,
}

/// A proposal appended to the leader's log but not yet applied.
///
/// Matched against apply reports by the `(node id, seq)` carried in the
/// entry context and by log index.
struct PendingProposal {
    seq: u64,
    index: u64,
    respond_to: Reply,
}

struct PendingRead {
    seq: u64,
    deadline: Instant,
    respond_to: Reply,
}

/// Spawns a Raft node and returns a handle to interact with it.
///
/// The raft listener is bound before this returns, so peers may start
/// sending as soon as the handle exists.
///
/// # Errors
///
/// Returns error if:
/// - `config.id` is not present in `config.peers` for a bootstrap member
/// - Network listener fails to bind to `config.listen_addr`
/// - Failed to create RaftNode
pub fn spawn_node(config: NodeConfig, fsm: KvStateMachine) -> Result<NodeHandle> {
    let NodeConfig {
        id,
        listen_addr,
        mut peers,
        join,
        snapshot_interval,
    } = config;

    let storage = if join {
        peers.insert(id, listen_addr.clone());
        NodeStorage::joining()
    } else {
        if !peers.contains_key(&id) {
            bail!("listen node id {id} missing from peers map");
        }
        let mut voters: Vec<u64> = peers.keys().copied().collect();
        voters.sort_unstable();
        NodeStorage::with_voters(&voters)
    };

    let node = RaftNode::new(id, storage, fsm)?
        .with_peers(peers)
        .with_snapshot_interval(snapshot_interval);
    let published = Arc::new(RwLock::new(Published {
        status: status_of(&node),
        leader_address: None,
    }));

    let (client_tx, client_rx) = unbounded();
    let (network_tx, network_rx) = unbounded();
    spawn_network_listener(&listen_addr, network_tx)?;

    let worker_published = Arc::clone(&published);
    let worker_addr = listen_addr.clone();
    thread::Builder::new()
        .name(format!("raft-worker-{id}"))
        .spawn(move || {
            let mut worker = Worker::new(
                node,
                worker_addr,
                client_rx,
                network_rx,
                Arc::clone(&worker_published),
            );
            let result = worker.run();
            mark_stopped(&worker_published);
            if let Err(err) = result {
                error!(node = id, error = ?err, "raft worker crashed");
            }
        })
        .context("failed to spawn raft worker")?;

    info!(node = id, listen = %listen_addr, join, "raft node started");
    Ok(NodeHandle {
        request_tx: client_tx,
        published,
    })
}

/// Stops the handle from reporting the last role the worker saw.
fn mark_stopped(published: &RwLock<Published>) {
    let mut published = published.write();
    published.status.role = NodeRole::Stopped;
    published.status.leader_id = None;
    published.leader_address = None;
}

fn status_of(node: &RaftNode) -> EngineStatus {
    let leader_id = node.leader_id();
    EngineStatus {
        role: node.role().into(),
        leader_id: (leader_id != 0).then_some(leader_id),
        term: node.term(),
        commit_index: node.committed_index(),
        applied_index: node.applied_index(),
        voters: node.voters(),
    }
}

/// The worker that runs the Raft event loop.
///
/// Owns the RaftNode and processes three types of events:
/// 1. **Engine requests** (propose, read index, membership) from handles
/// 2. **Network messages** (Raft protocol) from peers
/// 3. **Tick events** (every 100ms) to drive Raft timeouts
struct Worker {
    node: RaftNode,
    /// Our own raft address, stamped on every outgoing frame.
    listen_addr: String,
    client_rx: Receiver<ClientRequest>,
    network_rx: Receiver<Inbound>,
    published: Arc<RwLock<Published>>,
    outboxes: HashMap<String, Sender<Vec<u8>>>,
    pending_proposals: VecDeque<PendingProposal>,
    pending_reads: Vec<PendingRead>,
    next_seq: u64,
    last_role: StateRole,
    last_term: u64,
}

impl Worker {
    fn new(
        node: RaftNode,
        listen_addr: String,
        client_rx: Receiver<ClientRequest>,
        network_rx: Receiver<Inbound>,
        published: Arc<RwLock<Published>>,
    ) -> Self {
        let last_role = node.role();
        let last_term = node.term();
        Self {
            node,
            listen_addr,
            client_rx,
            network_rx,
            published,
            outboxes: HashMap::new(),
            pending_proposals: VecDeque::new(),
            pending_reads: Vec::new(),
            next_seq: 0,
            last_role,
            last_term,
        }
    }

    /// Runs the main event loop until shutdown.
    ///
    /// Each iteration:
    /// 1. Wait (with timeout) for an engine request or network message
    /// 2. Tick if 100ms have passed, expiring abandoned requests
    /// 3. Process any Ready state from Raft
    /// 4. Handle role changes and publish status
    fn run(&mut self) -> Result<()> {
        let mut last_tick = Instant::now();
        loop {
            let timeout = TICK_INTERVAL
                .checked_sub(last_tick.elapsed())
                .unwrap_or(Duration::from_secs(0));

            crossbeam_channel::select! {
                recv(self.client_rx) -> req => {
                    match req {
                        Ok(req) => {
                            if !self.handle_client_request(req) {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                recv(self.network_rx) -> inbound => {
                    match inbound {
                        Ok(Inbound { sender, msg }) => {
                            self.node.learn_peer(msg.from, &sender);
                            self.step(msg);
                        }
                        Err(_) => break,
                    }
                }
                default(timeout) => {}
            }

            if last_tick.elapsed() >= TICK_INTERVAL {
                self.node.tick();
                self.expire_pending(Instant::now());
                last_tick = Instant::now();
            }

            self.process_ready()?;
            self.handle_role_change();
            self.publish();
        }

        info!(node = self.node.id(), "raft worker stopped");
        Ok(())
    }

    fn next_context(&mut self) -> (u64, Vec<u8>) {
        self.next_seq += 1;
        (self.next_seq, proposal_context(self.node.id(), self.next_seq))
    }

    fn not_leader(&self) -> EngineError {
        let id = self.node.leader_id();
        let leader = (id != 0).then(|| LeaderInfo {
            id,
            address: self.node.peer_address(id).map(str::to_owned),
        });
        EngineError::NotLeader { leader }
    }

    /// Handles a request from an engine handle.
    ///
    /// Returns `false` if shutdown was requested, `true` otherwise.
    fn handle_client_request(&mut self, req: ClientRequest) -> bool {
        match req {
            ClientRequest::Propose {
                command,
                deadline,
                respond_to,
            } => {
                self.propose_with(deadline, respond_to, |node, ctx| node.propose(ctx, command));
            }
            ClientRequest::AddVoter {
                id,
                address,
                deadline,
                respond_to,
            } => {
                self.propose_with(deadline, respond_to, |node, ctx| {
                    node.propose_add_voter(ctx, id, &address)
                });
            }
            ClientRequest::RemoveVoter {
                id,
                deadline,
                respond_to,
            } => {
                self.propose_with(deadline, respond_to, |node, ctx| {
                    node.propose_remove_voter(ctx, id)
                });
            }
            ClientRequest::ReadIndex {
                deadline,
                respond_to,
            } => self.read_index(deadline, respond_to),
            ClientRequest::Campaign { respond_to } => {
                let previous = self.node.role();
                let result = self.node.campaign();
                if result.is_ok() {
                    info!(node = self.node.id(), ?previous, "campaign initiated");
                }
                let _ = respond_to.send(result);
            }
            ClientRequest::Shutdown => return false,
        }
        true
    }

    fn propose_with(
        &mut self,
        deadline: Instant,
        respond_to: Reply,
        propose: impl FnOnce(&mut RaftNode, Vec<u8>) -> Result<u64>,
    ) {
        if self.node.role() != StateRole::Leader {
            let _ = respond_to.send(Err(self.not_leader()));
            return;
        }
        // Caller already timed out.
        if Instant::now() >= deadline {
            return;
        }
        let (seq, ctx) = self.next_context();
        match propose(&mut self.node, ctx) {
            Ok(index) => self.pending_proposals.push_back(PendingProposal {
                seq,
                index,
                respond_to,
            }),
            Err(err) => {
                warn!(node = self.node.id(), error = %err, "proposal refused");
                let _ = respond_to.send(Err(EngineError::Rejected(err.to_string())));
            }
        }
    }

    /// Starts a read barrier.
    ///
    /// A leader that has committed an entry in its own term knows the
    /// cluster commit index and answers at once. Otherwise the index is
    /// confirmed through a read-index round trip with the leader.
    fn read_index(&mut self, deadline: Instant, respond_to: Reply) {
        let role = self.node.role();
        match role {
            StateRole::Leader if self.node.committed_in_current_term() => {
                let _ = respond_to.send(Ok(self.node.committed_index()));
            }
            StateRole::Leader => self.start_read(deadline, respond_to),
            StateRole::Follower if self.node.leader_id() != 0 => {
                self.start_read(deadline, respond_to)
            }
            other => {
                let _ = respond_to.send(Err(EngineError::Indeterminate(other.into())));
            }
        }
    }

    fn start_read(&mut self, deadline: Instant, respond_to: Reply) {
        let (seq, ctx) = self.next_context();
        self.node.read_index(ctx);
        self.pending_reads.push(PendingRead {
            seq,
            deadline,
            respond_to,
        });
    }

    fn step(&mut self, msg: Message) {
        let from = msg.from;
        let snapshot = msg.msg_type() == MessageType::MsgSnapshot;
        match self.node.step(msg) {
            Ok(()) => {}
            Err(err) if snapshot => {
                warn!(node = self.node.id(), from, error = ?err, "refused snapshot");
            }
            Err(err) => debug!(node = self.node.id(), from, error = %err, "dropped raft message"),
        }
    }

    /// Drains all ready state from Raft and processes it.
    ///
    /// Raft may produce multiple Ready batches in quick succession
    /// (e.g., processing a burst of incoming messages). We loop until
    /// `poll_ready()` returns None to ensure we're fully caught up.
    fn process_ready(&mut self) -> Result<()> {
        while let Some(bundle) = self.node.poll_ready()? {
            for msg in bundle.messages {
                self.dispatch_message(msg);
            }
            for report in bundle.applied {
                self.notify_proposer(report);
            }
            for state in bundle.read_states {
                self.notify_reader(state);
            }
        }
        Ok(())
    }

    /// Sends a Raft message to its destination.
    ///
    /// Messages addressed to this node are fed back into `node.step()`.
    /// Messages for other nodes are handed to that peer's outbox.
    fn dispatch_message(&mut self, msg: Message) {
        if msg.to == self.node.id() {
            self.step(msg);
            return;
        }

        let to = msg.to;
        let Some(addr) = self.node.peer_address(to).map(str::to_owned) else {
            warn!(node = self.node.id(), to, "no address for peer, dropping message");
            return;
        };
        let bytes = encode_frame(&self.listen_addr, &msg);
        let outbox = self
            .outboxes
            .entry(addr.clone())
            .or_insert_with(|| spawn_outbox(addr.clone()));
        if outbox.send(bytes).is_err() {
            self.outboxes.remove(&addr);
        }
    }

    /// Answers the client waiting on an applied entry, if this node proposed it.
    ///
    /// Proposals whose index was reached by a different entry can never
    /// commit and are failed as dropped.
    fn notify_proposer(&mut self, report: ApplyReport) {
        let own = report
            .proposal
            .filter(|(node, _)| *node == self.node.id())
            .map(|(_, seq)| seq);

        while let Some(front) = self.pending_proposals.front() {
            if front.index > report.index {
                break;
            }
            let Some(pending) = self.pending_proposals.pop_front() else {
                break;
            };
            if pending.index == report.index && own == Some(pending.seq) {
                let _ = pending.respond_to.send(proposal_result(&report));
                break;
            }
            debug!(node = self.node.id(), index = pending.index, "proposal superseded");
            let _ = pending.respond_to.send(Err(EngineError::Dropped {
                index: pending.index,
            }));
        }
    }

    fn notify_reader(&mut self, state: ReadState) {
        let Some((node, seq)) = parse_proposal_context(&state.request_ctx) else {
            return;
        };
        if node != self.node.id() {
            return;
        }
        if let Some(pos) = self.pending_reads.iter().position(|read| read.seq == seq) {
            let read = self.pending_reads.swap_remove(pos);
            let _ = read.respond_to.send(Ok(state.index));
        }
    }

    /// Forgets read barriers whose caller has already given up.
    ///
    /// Proposals are not expired here: they are resolved by the apply
    /// report at their index or by loss of leadership.
    fn expire_pending(&mut self, now: Instant) {
        self.pending_reads.retain(|read| {
            let live = read.deadline > now;
            if !live {
                let _ = read.respond_to.send(Err(EngineError::Timeout(Duration::ZERO)));
            }
            live
        });
    }

    /// Reacts to role and term changes.
    ///
    /// A deposed leader fails its outstanding proposals with an unknown
    /// outcome. Read barriers are tied to the leader they were sent to and
    /// are failed on any term change.
    fn handle_role_change(&mut self) {
        let current = self.node.role();
        let term = self.node.term();
        if current != self.last_role {
            info!(
                node = self.node.id(),
                from = ?self.last_role,
                to = ?current,
                term,
                leader = self.node.leader_id(),
                "role changed"
            );
            if self.last_role == StateRole::Leader {
                for pending in self.pending_proposals.drain(..) {
                    let _ = pending.respond_to.send(Err(EngineError::LeadershipLost));
                }
            }
        }
        if current != self.last_role || term != self.last_term {
            for read in self.pending_reads.drain(..) {
                let _ = read
                    .respond_to
                    .send(Err(EngineError::Indeterminate(current.into())));
            }
        }
        self.last_role = current;
        self.last_term = term;
    }

    fn publish(&self) {
        let status = status_of(&self.node);
        let leader_address = status
            .leader_id
            .and_then(|id| self.node.peer_address(id))
            .map(str::to_owned);
        {
            let published = self.published.read();
            if published.status == status && published.leader_address == leader_address {
                return;
            }
        }
        *self.published.write() = Published {
            status,
            leader_address,
        };
    }
}

fn proposal_result(report: &ApplyReport) -> Result<u64, EngineError> {
    match &report.outcome {
        ApplyOutcome::Command(Ok(_)) | ApplyOutcome::ConfChange { .. } => Ok(report.index),
        ApplyOutcome::Command(Err(err)) => Err(EngineError::Rejected(err.to_string())),
        ApplyOutcome::ConfChangeRejected(reason) => Err(EngineError::Rejected(reason.clone())),
        ApplyOutcome::Noop => Err(EngineError::Rejected(
            "configuration change refused while another is pending".into(),
        )),
    }
}

/// Binds the raft address and spawns a thread accepting peer connections.
///
/// Each accepted connection gets a short-lived handler thread that reads
/// one message and forwards it to the worker via `tx`.
fn spawn_network_listener(addr: &str, tx: Sender<Inbound>) -> Result<()> {
    let listener = TcpListener::bind(addr).with_context(|| format!("failed to bind {addr}"))?;
    thread::Builder::new()
        .name(format!("raft-net-listener-{addr}"))
        .spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let tx = tx.clone();
                        thread::spawn(move || {
                            if let Err(err) = handle_connection(stream, tx) {
                                debug!(error = %err, "raft connection error");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "raft accept error"),
                }
            }
        })
        .map(|_| ())
        .context("failed to spawn network listener")
}

/// Encodes one frame.
///
/// # Protocol
///
/// Frames are length-prefixed:
/// - 4 bytes: length of the rest of the frame (big-endian u32)
/// - 2 bytes: length of the sender address (big-endian u16)
/// - sender's raft address, UTF-8
/// - protobuf-encoded Message
fn encode_frame(sender: &str, msg: &Message) -> Vec<u8> {
    let body = msg.encode_to_vec();
    let len = 2 + sender.len() + body.len();
    let mut frame = Vec::with_capacity(4 + len);
    frame.extend_from_slice(&(len as u32).to_be_bytes());
    frame.extend_from_slice(&(sender.len() as u16).to_be_bytes());
    frame.extend_from_slice(sender.as_bytes());
    frame.extend_from_slice(&body);
    frame
}

/// Decodes a frame body, i.e. everything after the 4-byte length prefix.
fn decode_frame(buf: &[u8]) -> io::Result<Inbound> {
    let invalid = |what: &str| io::Error::new(io::ErrorKind::InvalidData, what.to_string());
    if buf.len() < 2 {
        return Err(invalid("frame too short for sender address"));
    }
    let (len_bytes, rest) = buf.split_at(2);
    let addr_len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
    if rest.len() < addr_len {
        return Err(invalid("sender address overruns frame"));
    }
    let (addr, body) = rest.split_at(addr_len);
    let sender = std::str::from_utf8(addr)
        .map_err(|_| invalid("sender address is not UTF-8"))?
        .to_owned();
    let msg = Message::decode(body).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    Ok(Inbound { sender, msg })
}

/// Reads a single frame from a TCP connection and forwards it to the worker.
fn handle_connection(mut stream: TcpStream, tx: Sender<Inbound>) -> Result<()> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(anyhow!("frame of {len} bytes exceeds limit"));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    let inbound = decode_frame(&buf)?;
    tx.send(inbound)
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "worker gone"))?;
    Ok(())
}

/// Spawns the sender thread for one peer address.
///
/// Each message opens a new TCP connection. A slow or dead peer only delays
/// its own outbox.
fn spawn_outbox(addr: String) -> Sender<Vec<u8>> {
    let (tx, rx) = unbounded::<Vec<u8>>();
    let name = format!("raft-outbox-{addr}");
    let spawned = thread::Builder::new().name(name).spawn(move || {
        let mut failing = false;
        for bytes in rx {
            match try_send(&addr, &bytes) {
                Ok(()) if failing => {
                    info!(peer = %addr, "peer reachable again");
                    failing = false;
                }
                Ok(()) => {}
                Err(err) if !failing => {
                    warn!(peer = %addr, error = %err, "failed to send raft message");
                    failing = true;
                }
                Err(_) => {}
            }
        }
    });
    if let Err(err) = spawned {
        error!(error = %err, "failed to spawn raft outbox");
    }
    tx
}

/// Opens a connection, writes one encoded frame, closes connection.
fn try_send(addr: &str, frame: &[u8]) -> io::Result<()> {
    let target: SocketAddr = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address did not resolve"))?;
    let mut stream = TcpStream::connect_timeout(&target, CONNECT_TIMEOUT)?;
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    stream.write_all(frame)?;
    Ok(())
}
