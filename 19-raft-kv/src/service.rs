//! Per-node bundle of the store, the engine handle and the components that
//! use them.
//!
//! One [`KvService`] is built at startup and shared by reference with every
//! request handler. There is no process-wide state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::ConsensusEngine;
use crate::error::{KvError, KvResult};
use crate::fsm::AppliedIndex;
use crate::membership::{ClusterMember, MembershipManager};
use crate::read::ReadConsistency;
use crate::store::KvStore;
use crate::write_path::WriteCoordinator;

pub const DEFAULT_PROPOSE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub node_id: u64,
    pub http_address: String,
    pub raft_address: String,
    pub peers: HashMap<u64, String>,
    pub propose_timeout: Duration,
    pub read_timeout: Duration,
}

pub struct KvService {
    store: Arc<KvStore>,
    writes: WriteCoordinator,
    reads: ReadConsistency,
    membership: MembershipManager,
    read_timeout: Duration,
}

impl KvService {
    /// `applied` must be the applied index of the state machine that
    /// `engine` delivers into `store`.
    pub fn new(
        config: ServiceConfig,
        engine: Arc<dyn ConsensusEngine>,
        store: Arc<KvStore>,
        applied: Arc<AppliedIndex>,
    ) -> Self {
        let ServiceConfig {
            node_id,
            http_address,
            raft_address,
            peers,
            propose_timeout,
            read_timeout,
        } = config;
        Self {
            writes: WriteCoordinator::new(Arc::clone(&engine), Arc::clone(&store), propose_timeout),
            reads: ReadConsistency::new(Arc::clone(&engine), applied),
            membership: MembershipManager::new(
                engine,
                ClusterMember {
                    id: node_id,
                    address: raft_address,
                },
                http_address,
                peers,
                propose_timeout,
            ),
            store,
            read_timeout,
        }
    }

    pub fn put(&self, key: &str, value: Vec<u8>) -> KvResult<u64> {
        self.writes.put(key, value)
    }

    /// Linearizable read: passes the read barrier, then reads locally.
    pub fn get(&self, key: &str) -> KvResult<Vec<u8>> {
        if key.is_empty() {
            return Err(KvError::EmptyKey);
        }
        self.reads.verify_read(self.read_timeout)?;
        self.store.get(key).ok_or(KvError::KeyNotFound)
    }

    pub fn delete(&self, key: &str) -> KvResult<u64> {
        self.writes.delete(key)
    }

    pub fn membership(&self) -> &MembershipManager {
        &self.membership
    }
}
