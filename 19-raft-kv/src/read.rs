//! Linearizable read barrier.
//!
//! A read may be served from the local store only once the local applied
//! index is at least the cluster commit index as of the moment the read
//! began. The engine's read index supplies that commit index:
//!
//! - a leader that has committed an entry in its term answers from its own
//!   commit index without a round trip;
//! - a follower asks the leader, which confirms its leadership with a
//!   quorum heartbeat before answering;
//! - a node mid-election has no leader to ask and fails the read.
//!
//! Knowing the role alone is not enough: a follower can be arbitrarily far
//! behind the leader, so the barrier always waits on the applied index.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::engine::{ConsensusEngine, NodeRole};
use crate::error::{KvError, KvResult};
use crate::fsm::AppliedIndex;

pub struct ReadConsistency {
    engine: Arc<dyn ConsensusEngine>,
    applied: Arc<AppliedIndex>,
}

impl ReadConsistency {
    pub fn new(engine: Arc<dyn ConsensusEngine>, applied: Arc<AppliedIndex>) -> Self {
        Self { engine, applied }
    }

    /// Blocks until a local read would be linearizable, at most `timeout`.
    ///
    /// Returns the barrier index that has been applied. Fails with
    /// [`KvError::ConsistencyUnavailable`] instead of answering from a store
    /// that may be stale.
    pub fn verify_read(&self, timeout: Duration) -> KvResult<u64> {
        let deadline = Instant::now() + timeout;

        let role = self.engine.role();
        if !matches!(role, NodeRole::Leader | NodeRole::Follower) {
            return Err(KvError::ConsistencyUnavailable(format!(
                "node is {role}, no leader to confirm the commit index"
            )));
        }

        let target = self
            .engine
            .read_index(timeout)
            .map_err(|err| KvError::ConsistencyUnavailable(err.to_string()))?;

        if !self.applied.wait_for(target, deadline) {
            return Err(KvError::ConsistencyUnavailable(format!(
                "applied index {} did not reach read index {target} within {timeout:?}",
                self.applied.get()
            )));
        }
        debug!(%role, target, "read barrier passed");
        Ok(target)
    }
}
