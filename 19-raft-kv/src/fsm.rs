//! Deterministic state machine driven by the consensus log.
//!
//! [`KvStateMachine`] interprets committed [`Command`]s against the shared
//! [`KvStore`], and produces/consumes the opaque snapshot blob. It is owned by
//! the engine's apply thread: `apply` and `restore` take `&mut self`, so the
//! borrow checker keeps them mutually exclusive.
//!
//! [`AppliedIndex`] publishes how far the machine has caught up. The read
//! path blocks on it until a barrier index has been applied.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::command::Command;
use crate::error::{KvError, KvResult};
use crate::store::{KvStore, StoreState};

/// Highest log index whose effects are visible in the local store.
#[derive(Default)]
pub struct AppliedIndex {
    index: Mutex<u64>,
    advanced: Condvar,
}

impl AppliedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u64 {
        *self.index.lock()
    }

    fn set(&self, index: u64) {
        *self.index.lock() = index;
        self.advanced.notify_all();
    }

    /// Blocks until the applied index reaches `target` or `deadline` passes.
    ///
    /// Returns whether `target` was reached.
    pub fn wait_for(&self, target: u64, deadline: Instant) -> bool {
        let mut applied = self.index.lock();
        while *applied < target {
            if self.advanced.wait_until(&mut applied, deadline).timed_out() {
                return *applied >= target;
            }
        }
        true
    }
}

/// Effect of one applied command, reported back to the proposer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Put,
    Delete { found: bool },
}

pub struct KvStateMachine {
    store: Arc<KvStore>,
    applied: Arc<AppliedIndex>,
}

impl KvStateMachine {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self {
            store,
            applied: Arc::new(AppliedIndex::new()),
        }
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }

    /// Shared handle on the applied index, for read barriers.
    pub fn applied(&self) -> Arc<AppliedIndex> {
        Arc::clone(&self.applied)
    }

    pub fn applied_index(&self) -> u64 {
        self.applied.get()
    }

    /// Applies the command committed at `index`.
    ///
    /// A payload that does not decode to a known command is rejected before
    /// the store is touched. Every replica sees the same bytes and so rejects
    /// the same entries. The index counts as consumed either way.
    pub fn apply(&mut self, index: u64, data: &[u8]) -> KvResult<Applied> {
        let result = Command::decode(data)
            .map_err(KvError::from)
            .map(|command| self.execute(command));
        self.applied.set(index);
        result
    }

    fn execute(&self, command: Command) -> Applied {
        match command {
            Command::Put { key, value } => {
                self.store.put(key, value);
                Applied::Put
            }
            Command::Delete { key } => Applied::Delete {
                found: self.store.delete(&key),
            },
        }
    }

    /// Marks `index` as applied for entries that carry no command, such as
    /// leader no-ops and configuration changes.
    pub fn skip(&mut self, index: u64) {
        self.applied.set(index);
    }

    /// Serializes a deep copy of the store.
    ///
    /// Only the copy happens under the store lock; encoding runs after it
    /// has been released.
    pub fn snapshot(&self) -> KvResult<Vec<u8>> {
        let state = self.store.dump();
        bincode::serialize(&state).map_err(|err| KvError::Snapshot(err.to_string()))
    }

    /// Replaces all store contents with the snapshot taken at `index`.
    ///
    /// Nothing is modified when the blob fails to decode.
    pub fn restore(&mut self, index: u64, blob: &[u8]) -> KvResult<()> {
        let state: StoreState =
            bincode::deserialize(blob).map_err(|err| KvError::Snapshot(err.to_string()))?;
        debug!(index, keys = state.len(), "restoring state machine from snapshot");
        self.store.load(state);
        self.applied.set(index);
        Ok(())
    }
}
