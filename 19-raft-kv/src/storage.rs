//! Raft log storage that can hand out state machine snapshots.
//!
//! `MemStorage` keeps the log, hard state and conf state, but the snapshot it
//! builds carries metadata only. [`NodeStorage`] wraps it and remembers the
//! last snapshot this node produced or installed, data included, so that the
//! leader can fast-forward followers whose entries were compacted away.

use std::sync::Arc;

use parking_lot::RwLock;
use raft::prelude::{ConfState, Entry, Snapshot};
use raft::storage::{GetEntriesContext, MemStorage, RaftState, Storage};
use raft::{Error as RaftError, StorageError};

#[derive(Clone)]
pub struct NodeStorage {
    mem: MemStorage,
    snapshot: Arc<RwLock<Option<Snapshot>>>,
}

impl NodeStorage {
    /// Storage for a node that starts as part of the initial `voters`.
    pub fn with_voters(voters: &[u64]) -> Self {
        Self::from_mem(MemStorage::new_with_conf_state(ConfState::from((
            voters.to_vec(),
            vec![],
        ))))
    }

    /// Storage for a node that waits to be added by the leader.
    ///
    /// The conf state is empty until the leader ships a snapshot.
    pub fn joining() -> Self {
        Self::from_mem(MemStorage::new())
    }

    fn from_mem(mem: MemStorage) -> Self {
        Self {
            mem,
            snapshot: Arc::new(RwLock::new(None)),
        }
    }

    pub fn mem(&self) -> &MemStorage {
        &self.mem
    }

    pub fn conf_state(&self) -> raft::Result<ConfState> {
        Ok(self.mem.initial_state()?.conf_state)
    }

    pub fn latest_snapshot_index(&self) -> u64 {
        self.snapshot
            .read()
            .as_ref()
            .map_or(0, |snap| snap.get_metadata().index)
    }

    /// Records a snapshot taken locally at `snap.metadata.index` and drops
    /// log entries before it.
    pub fn compact_to(&self, snap: Snapshot) -> raft::Result<()> {
        let index = snap.get_metadata().index;
        *self.snapshot.write() = Some(snap);
        self.mem.wl().compact(index)
    }

    /// Installs a snapshot received from the leader.
    pub fn install(&self, snap: Snapshot) -> raft::Result<()> {
        self.mem.wl().apply_snapshot(snap.clone())?;
        *self.snapshot.write() = Some(snap);
        Ok(())
    }
}

impl Storage for NodeStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.mem.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.mem.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        if let Some(snap) = self.snapshot.read().as_ref() {
            let meta = snap.get_metadata();
            if meta.index == idx {
                return Ok(meta.term);
            }
        }
        self.mem.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.mem.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.mem.last_index()
    }

    fn snapshot(&self, request_index: u64, to: u64) -> raft::Result<Snapshot> {
        match self.snapshot.read().as_ref() {
            Some(snap) if snap.get_metadata().index >= request_index => Ok(snap.clone()),
            Some(_) => Err(RaftError::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            )),
            None => self.mem.snapshot(request_index, to),
        }
    }
}
