//! Cluster membership changes and the configured member list.
//!
//! Joins and removals are configuration-change entries proposed through the
//! same log as data commands, so no write can be attributed to a membership
//! that has not committed yet.
//!
//! The member list returned by [`MembershipManager::members`] is this node's
//! configuration: the peers it was started with plus the changes it made
//! itself. It is not the engine's committed membership and must not be used
//! for quorum reasoning; `EngineStatus::voters` is the committed view.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use crate::engine::{ConsensusEngine, EngineStatus};
use crate::error::{KvError, KvResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterMember {
    pub id: u64,
    pub address: String,
}

/// Body of `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: u64,
    /// Client-facing address of this node.
    pub address: String,
    /// Raft addresses of the other configured members.
    pub peers: Vec<String>,
    pub raft: EngineStatus,
}

pub struct MembershipManager {
    engine: Arc<dyn ConsensusEngine>,
    node_id: u64,
    http_address: String,
    raft_address: String,
    /// Raft address of every configured member other than this node.
    peers: RwLock<BTreeMap<u64, String>>,
    timeout: Duration,
}

impl MembershipManager {
    pub fn new(
        engine: Arc<dyn ConsensusEngine>,
        self_member: ClusterMember,
        http_address: String,
        peers: impl IntoIterator<Item = (u64, String)>,
        timeout: Duration,
    ) -> Self {
        let peers = peers
            .into_iter()
            .filter(|(id, _)| *id != self_member.id)
            .collect();
        Self {
            engine,
            node_id: self_member.id,
            http_address,
            raft_address: self_member.address,
            peers: RwLock::new(peers),
            timeout,
        }
    }

    /// Adds `id` as a voting member reachable at the raft `address`.
    ///
    /// Leader-only. Returns once the configuration change has committed.
    pub fn join(&self, id: u64, address: &str) -> KvResult<()> {
        if id == 0 {
            return Err(KvError::InvalidMember("node id 0 is reserved".into()));
        }
        if address.is_empty() {
            return Err(KvError::InvalidMember("address is required".into()));
        }
        self.ensure_leader()?;
        self.engine
            .add_voter(id, address.to_owned(), self.timeout)
            .map_err(KvError::membership)?;
        if id != self.node_id {
            self.peers.write().insert(id, address.to_owned());
        }
        info!(id, address, "member joined");
        Ok(())
    }

    /// Removes `id` from the voting members. Leader-only.
    pub fn remove(&self, id: u64) -> KvResult<()> {
        if id == self.node_id {
            return Err(KvError::InvalidMember(
                "a node cannot remove itself; transfer leadership first".into(),
            ));
        }
        self.ensure_leader()?;
        self.engine
            .remove_voter(id, self.timeout)
            .map_err(KvError::membership)?;
        self.peers.write().remove(&id);
        info!(id, "member removed");
        Ok(())
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.node_id,
            address: self.http_address.clone(),
            peers: self.peers.read().values().cloned().collect(),
            raft: self.engine.status(),
        }
    }

    /// This node followed by the configured peers, in id order.
    pub fn members(&self) -> Vec<ClusterMember> {
        let mut members = vec![ClusterMember {
            id: self.node_id,
            address: self.raft_address.clone(),
        }];
        members.extend(
            self.peers
                .read()
                .iter()
                .map(|(id, address)| ClusterMember {
                    id: *id,
                    address: address.clone(),
                }),
        );
        members
    }

    fn ensure_leader(&self) -> KvResult<()> {
        if self.engine.is_leader() {
            return Ok(());
        }
        Err(KvError::NotLeader {
            leader: self.engine.leader(),
        })
    }
}
