//! Contract between the replicated state machine and the consensus engine.
//!
//! The write path, read path and membership manager only talk to the engine
//! through [`ConsensusEngine`]. The shipped implementation is
//! [`crate::runtime::NodeHandle`], which drives tikv/raft on a worker thread;
//! tests substitute an in-process fake.
//!
//! The engine delivers committed entries to [`crate::fsm::KvStateMachine`]
//! exactly once per index, in log order. Every answer it gives about
//! leadership may be stale the moment it returns.

use std::fmt;
use std::time::Duration;

use raft::StateRole;
use serde::Serialize;

use crate::error::EngineError;

/// Role assigned to this node by the consensus engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Follower,
    PreCandidate,
    Candidate,
    Leader,
    /// The worker driving the engine has exited.
    Stopped,
}

impl From<StateRole> for NodeRole {
    fn from(role: StateRole) -> Self {
        match role {
            StateRole::Follower => Self::Follower,
            StateRole::PreCandidate => Self::PreCandidate,
            StateRole::Candidate => Self::Candidate,
            StateRole::Leader => Self::Leader,
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Follower => "follower",
            Self::PreCandidate => "pre-candidate",
            Self::Candidate => "candidate",
            Self::Leader => "leader",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Best-known leader, used to redirect clients that hit a follower.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderInfo {
    pub id: u64,
    /// Raft address of the leader, when this node has one on record.
    pub address: Option<String>,
}

/// Point-in-time view of the engine, reported by `GET /status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub role: NodeRole,
    pub leader_id: Option<u64>,
    pub term: u64,
    pub commit_index: u64,
    pub applied_index: u64,
    pub voters: Vec<u64>,
}

pub trait ConsensusEngine: Send + Sync {
    /// Replicates `command` and blocks until it is committed and applied
    /// locally, returning its log index.
    ///
    /// On [`EngineError::Timeout`] or [`EngineError::LeadershipLost`] the
    /// entry may still commit later. Callers must not assume either outcome.
    fn propose(&self, command: Vec<u8>, timeout: Duration) -> Result<u64, EngineError>;

    fn role(&self) -> NodeRole;

    fn is_leader(&self) -> bool {
        self.role() == NodeRole::Leader
    }

    fn leader(&self) -> Option<LeaderInfo>;

    /// Asks the leader for its committed index through a read-index round
    /// trip. The returned index is at least the cluster commit index at the
    /// time of the call.
    fn read_index(&self, timeout: Duration) -> Result<u64, EngineError>;

    /// Proposes a configuration change adding `id` as a voter reachable at
    /// `address`, and waits for it to commit.
    fn add_voter(&self, id: u64, address: String, timeout: Duration) -> Result<(), EngineError>;

    fn remove_voter(&self, id: u64, timeout: Duration) -> Result<(), EngineError>;

    fn status(&self) -> EngineStatus;
}
