//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use parking_lot::{Mutex, MutexGuard};

use raft_kv::engine::{ConsensusEngine, EngineStatus, LeaderInfo, NodeRole};
use raft_kv::error::EngineError;
use raft_kv::fsm::{AppliedIndex, KvStateMachine};
use raft_kv::runtime::{spawn_node, NodeConfig, NodeHandle};
use raft_kv::service::{KvService, ServiceConfig};
use raft_kv::store::KvStore;

pub fn raft_addr(base_port: u16, id: u64) -> String {
    format!("127.0.0.1:{}", base_port + id as u16 - 1)
}

/// Polls `check` every 50ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, what: &str, mut check: impl FnMut() -> bool) -> Result<()> {
    let start = Instant::now();
    while !check() {
        if start.elapsed() > timeout {
            bail!("timeout waiting for {what}");
        }
        thread::sleep(Duration::from_millis(50));
    }
    Ok(())
}

pub struct ClusterNode {
    pub handle: NodeHandle,
    pub service: Arc<KvService>,
    pub store: Arc<KvStore>,
}

/// Cluster of real Raft nodes talking TCP on localhost.
pub struct TestCluster {
    base_port: u16,
    nodes: BTreeMap<u64, ClusterNode>,
}

impl TestCluster {
    /// Spawns N voters with sequential ports starting from base_port.
    pub fn spawn(n: u64, base_port: u16) -> Result<Self> {
        let peers: HashMap<u64, String> =
            (1..=n).map(|id| (id, raft_addr(base_port, id))).collect();

        let mut cluster = Self {
            base_port,
            nodes: BTreeMap::new(),
        };
        for id in 1..=n {
            cluster.start(id, peers.clone(), false)?;
        }
        Ok(cluster)
    }

    /// Starts a node with an empty configuration, waiting to be added.
    pub fn spawn_joiner(&mut self, id: u64) -> Result<String> {
        self.start(id, HashMap::new(), true)?;
        Ok(raft_addr(self.base_port, id))
    }

    fn start(&mut self, id: u64, peers: HashMap<u64, String>, join: bool) -> Result<()> {
        let listen_addr = raft_addr(self.base_port, id);
        let store = Arc::new(KvStore::new());
        let fsm = KvStateMachine::new(Arc::clone(&store));
        let applied = fsm.applied();

        let mut config = NodeConfig::new(id, listen_addr.clone(), peers.clone());
        config.join = join;
        let handle = spawn_node(config, fsm)?;

        let service = KvService::new(
            ServiceConfig {
                node_id: id,
                http_address: format!("127.0.0.1:{}", 9000 + id),
                raft_address: listen_addr,
                peers,
                propose_timeout: Duration::from_secs(5),
                read_timeout: Duration::from_secs(3),
            },
            Arc::new(handle.clone()),
            Arc::clone(&store),
            applied,
        );
        self.nodes.insert(
            id,
            ClusterNode {
                handle,
                service: Arc::new(service),
                store,
            },
        );
        Ok(())
    }

    pub fn node(&self, id: u64) -> &ClusterNode {
        &self.nodes[&id]
    }

    pub fn addr(&self, id: u64) -> String {
        raft_addr(self.base_port, id)
    }

    /// Makes `id` campaign until every node follows it.
    ///
    /// A campaign against a leader holding its quorum lease is ignored, and
    /// the election that follows may be won by another node, so it retries.
    pub fn elect(&self, id: u64, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        loop {
            self.node(id).handle.campaign()?;
            let elected = wait_until(Duration::from_secs(3), "leader to be recognized", || {
                self.node(id).handle.is_leader()
                    && self
                        .nodes
                        .values()
                        .all(|node| node.handle.status().leader_id == Some(id))
            });
            if elected.is_ok() {
                return Ok(());
            }
            if start.elapsed() > timeout {
                bail!("node {id} did not become leader within {timeout:?}");
            }
        }
    }

    pub fn shutdown(self) {
        for node in self.nodes.values() {
            let _ = node.handle.shutdown();
        }
        thread::sleep(Duration::from_millis(100));
    }
}

pub struct FakeState {
    pub role: NodeRole,
    pub leader: Option<LeaderInfo>,
    pub commit_index: u64,
    /// Answer to `read_index`; `None` never answers.
    pub read_index: Option<u64>,
    pub voters: Vec<(u64, String)>,
}

/// Engine that applies proposals synchronously into its own state machine.
pub struct FakeEngine {
    state: Mutex<FakeState>,
    fsm: Mutex<KvStateMachine>,
    applied: Arc<AppliedIndex>,
}

impl FakeEngine {
    pub fn new(role: NodeRole, store: Arc<KvStore>) -> Arc<Self> {
        let fsm = KvStateMachine::new(store);
        let applied = fsm.applied();
        let leader = match role {
            NodeRole::Leader => Some(LeaderInfo {
                id: 1,
                address: Some("127.0.0.1:7101".into()),
            }),
            _ => Some(LeaderInfo {
                id: 2,
                address: Some("127.0.0.1:7102".into()),
            }),
        };
        Arc::new(Self {
            state: Mutex::new(FakeState {
                role,
                leader,
                commit_index: 0,
                read_index: Some(0),
                voters: vec![(1, "127.0.0.1:7101".into())],
            }),
            fsm: Mutex::new(fsm),
            applied,
        })
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock()
    }

    pub fn applied(&self) -> Arc<AppliedIndex> {
        Arc::clone(&self.applied)
    }

    fn leader_only(&self) -> Result<MutexGuard<'_, FakeState>, EngineError> {
        let state = self.state();
        if state.role != NodeRole::Leader {
            return Err(EngineError::NotLeader {
                leader: state.leader.clone(),
            });
        }
        Ok(state)
    }
}

impl ConsensusEngine for FakeEngine {
    fn propose(&self, command: Vec<u8>, _timeout: Duration) -> Result<u64, EngineError> {
        let mut state = self.leader_only()?;
        state.commit_index += 1;
        let index = state.commit_index;
        self.fsm
            .lock()
            .apply(index, &command)
            .map_err(|err| EngineError::Rejected(err.to_string()))?;
        Ok(index)
    }

    fn role(&self) -> NodeRole {
        self.state().role
    }

    fn leader(&self) -> Option<LeaderInfo> {
        self.state().leader.clone()
    }

    fn read_index(&self, timeout: Duration) -> Result<u64, EngineError> {
        let state = self.state();
        match state.role {
            NodeRole::Leader => Ok(state.commit_index),
            _ => state.read_index.ok_or(EngineError::Timeout(timeout)),
        }
    }

    fn add_voter(&self, id: u64, address: String, _timeout: Duration) -> Result<(), EngineError> {
        let mut state = self.leader_only()?;
        state.voters.push((id, address));
        Ok(())
    }

    fn remove_voter(&self, id: u64, _timeout: Duration) -> Result<(), EngineError> {
        let mut state = self.leader_only()?;
        state.voters.retain(|(voter, _)| *voter != id);
        Ok(())
    }

    fn status(&self) -> EngineStatus {
        let state = self.state();
        EngineStatus {
            role: state.role,
            leader_id: state.leader.as_ref().map(|leader| leader.id),
            term: 3,
            commit_index: state.commit_index,
            applied_index: self.applied.get(),
            voters: state.voters.iter().map(|(id, _)| *id).collect(),
        }
    }
}

/// Service backed by a [`FakeEngine`], as the HTTP layer sees it.
pub fn fake_service(role: NodeRole) -> (Arc<FakeEngine>, Arc<KvStore>, Arc<KvService>) {
    let store = Arc::new(KvStore::new());
    let engine = FakeEngine::new(role, Arc::clone(&store));
    let service = KvService::new(
        ServiceConfig {
            node_id: 1,
            http_address: "127.0.0.1:9001".into(),
            raft_address: "127.0.0.1:7101".into(),
            peers: HashMap::from([
                (1, "127.0.0.1:7101".to_string()),
                (2, "127.0.0.1:7102".to_string()),
                (3, "127.0.0.1:7103".to_string()),
            ]),
            propose_timeout: Duration::from_millis(200),
            read_timeout: Duration::from_millis(100),
        },
        Arc::clone(&engine) as Arc<dyn ConsensusEngine>,
        Arc::clone(&store),
        engine.applied(),
    );
    (engine, store, Arc::new(service))
}
