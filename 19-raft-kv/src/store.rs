//! In-memory key-value storage for the Raft state machine.
//!
//! This module holds the data that Raft replicates. Mutations arrive only
//! through [`crate::fsm::KvStateMachine`] in log order; HTTP handlers read it
//! directly once the read barrier has been passed.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Wholesale contents of a [`KvStore`], as exported for snapshots.
pub type StoreState = HashMap<String, Vec<u8>>;

/// Thread-safe key-value store used by each node.
///
/// Reads share the lock, mutations take it exclusively. `parking_lot` locks
/// do not poison, so a panicking reader cannot wedge the apply path.
#[derive(Default)]
pub struct KvStore {
    data: RwLock<StoreState>,
}

impl KvStore {
    /// Creates an empty key-value store.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
        }
    }

    /// Stores a key-value pair, overwriting any existing value.
    pub fn put(&self, key: String, value: Vec<u8>) {
        self.data.write().insert(key, value);
    }

    /// Retrieves a copy of the current value for a key.
    ///
    /// This is a local read: it returns whatever this node has applied. Use
    /// [`crate::read::ReadConsistency`] first when the read must be
    /// linearizable.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.data.read().get(key).cloned()
    }

    /// Removes a key, returning whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.data.write().remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Returns a deep copy of every key-value pair.
    ///
    /// The read lock is held only for the clone, so the result can be
    /// serialized or sent over the network without blocking writers.
    pub fn dump(&self) -> StoreState {
        self.data.read().clone()
    }

    /// Replaces the whole store with `state` in one exclusive section.
    ///
    /// Readers observe either the old contents or the new ones, never a mix.
    pub fn load(&self, state: StoreState) {
        *self.data.write() = state;
    }
}
