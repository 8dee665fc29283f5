//! Leadership gate for mutating requests.
//!
//! Leadership is re-checked on every request: it can change between the
//! request arriving and the proposal being made, and an engine that lost it
//! in the meantime rejects the proposal anyway. Nothing here ever writes to
//! the local store; mutations only happen when the engine applies the
//! committed entry.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::command::Command;
use crate::engine::ConsensusEngine;
use crate::error::{KvError, KvResult};
use crate::store::KvStore;

pub struct WriteCoordinator {
    engine: Arc<dyn ConsensusEngine>,
    store: Arc<KvStore>,
    timeout: Duration,
}

impl WriteCoordinator {
    pub fn new(engine: Arc<dyn ConsensusEngine>, store: Arc<KvStore>, timeout: Duration) -> Self {
        Self {
            engine,
            store,
            timeout,
        }
    }

    /// Replicates an upsert and returns the log index it was applied at.
    ///
    /// On a timeout or engine failure the write may or may not have
    /// committed. It is not retried.
    pub fn put(&self, key: &str, value: Vec<u8>) -> KvResult<u64> {
        self.check_key(key)?;
        self.ensure_leader()?;
        self.submit(Command::put(key, value))
    }

    /// Replicates a delete of an existing key.
    ///
    /// Fails with [`KvError::KeyNotFound`] without proposing anything when
    /// the key is absent from the local store.
    pub fn delete(&self, key: &str) -> KvResult<u64> {
        self.check_key(key)?;
        self.ensure_leader()?;
        if !self.store.contains(key) {
            return Err(KvError::KeyNotFound);
        }
        self.submit(Command::delete(key))
    }

    fn check_key(&self, key: &str) -> KvResult<()> {
        if key.is_empty() {
            return Err(KvError::EmptyKey);
        }
        Ok(())
    }

    fn ensure_leader(&self) -> KvResult<()> {
        if self.engine.is_leader() {
            return Ok(());
        }
        Err(KvError::NotLeader {
            leader: self.engine.leader(),
        })
    }

    fn submit(&self, command: Command) -> KvResult<u64> {
        let payload = command.encode()?;
        let index = self.engine.propose(payload, self.timeout)?;
        debug!(key = command.key(), index, "write committed");
        Ok(index)
    }
}
