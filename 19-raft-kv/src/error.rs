//! Error taxonomy shared by the write path, read path and membership manager.
//!
//! Nothing here is fatal: every failure is returned to the caller, and the
//! HTTP layer maps each variant to a status code in [`crate::api`].

use std::time::Duration;

use thiserror::Error;

use crate::engine::{LeaderInfo, NodeRole};

pub type KvResult<T> = std::result::Result<T, KvError>;

/// Failures reported by a [`crate::engine::ConsensusEngine`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not the leader")]
    NotLeader { leader: Option<LeaderInfo> },

    /// The commit outcome is unknown to the caller.
    #[error("timed out after {0:?}, commit outcome unknown")]
    Timeout(Duration),

    /// Another entry was committed at the proposal's index; it will never apply.
    #[error("proposal superseded by another entry at index {index}")]
    Dropped { index: u64 },

    /// The proposer stepped down before the entry committed. It may still commit.
    #[error("leadership lost before commit, outcome unknown")]
    LeadershipLost,

    #[error("rejected by state machine: {0}")]
    Rejected(String),

    #[error("node is {0} and cannot serve this request")]
    Indeterminate(NodeRole),

    #[error("consensus engine unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum KvError {
    #[error("Key is required")]
    EmptyKey,

    #[error("Not the leader")]
    NotLeader { leader: Option<LeaderInfo> },

    #[error("Key not found")]
    KeyNotFound,

    #[error("Failed to apply command: {0}")]
    Proposal(EngineError),

    #[error("Failed to verify read: {0}")]
    ConsistencyUnavailable(String),

    #[error("Failed to change membership: {0}")]
    Membership(EngineError),

    #[error("Invalid member: {0}")]
    InvalidMember(String),

    #[error("command decode failed: {0}")]
    Decode(#[from] bincode::Error),

    #[error("snapshot failed: {0}")]
    Snapshot(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl KvError {
    /// Leader hint carried by a not-leader rejection, if the engine knew one.
    pub fn leader_hint(&self) -> Option<&LeaderInfo> {
        match self {
            Self::NotLeader { leader } => leader.as_ref(),
            _ => None,
        }
    }

    /// Maps an engine failure during a configuration change.
    pub fn membership(err: EngineError) -> Self {
        match err {
            EngineError::NotLeader { leader } => Self::NotLeader { leader },
            other => Self::Membership(other),
        }
    }
}

impl From<EngineError> for KvError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotLeader { leader } => Self::NotLeader { leader },
            other => Self::Proposal(other),
        }
    }
}
