//! Shadow directory: update-side bookkeeping for trie nodes.
//!
//! Trie nodes are sized for read-path cache locality; their mutex,
//! child count, and fallback counter live in this side table instead,
//! keyed by node address in a concurrent hash map. Readers never look
//! here.
//!
//! The mutable state sits behind an `Arc<Mutex<..>>` shared between the
//! pre- and post-recompaction versions of the same logical node, so the
//! mutex identity (and the counters it protects) survive recompaction:
//! [`ShadowDir::set`] with an `inherit_from` record clones the `Arc`.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};

use crate::tagged::TaggedRef;

/// Counters of one logical node, protected by the shared mutex.
pub(crate) struct ShadowState {
    /// Live children (holes excluded).
    pub(crate) nr_child: u32,
    /// Removals left before a fallback pigeon node tries to shrink.
    /// Zero on non-fallback nodes.
    pub(crate) fallback_removal_count: i32,
}

pub(crate) struct ShadowRecord {
    pub(crate) state: Arc<Mutex<ShadowState>>,
    pub(crate) level: usize,
}

/// An acquired shadow mutex. The guard owns the `Arc`, so it stays
/// valid even if the map entry is concurrently replaced.
pub(crate) type ShadowGuard = ArcMutexGuard<RawMutex, ShadowState>;

pub(crate) struct ShadowDir {
    map: DashMap<usize, ShadowRecord>,
}

impl ShadowDir {
    pub(crate) fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    /// Register a record for `node`. `inherit_from` shares the mutex
    /// (and counters) of an existing record, preserving mutex identity
    /// across recompaction; `None` creates fresh state with the given
    /// initial child count.
    pub(crate) fn set(
        &self,
        node: TaggedRef,
        level: usize,
        nr_child: u32,
        inherit_from: Option<&Arc<Mutex<ShadowState>>>,
    ) -> Arc<Mutex<ShadowState>> {
        let state = match inherit_from {
            Some(existing) => Arc::clone(existing),
            None => Arc::new(Mutex::new(ShadowState {
                nr_child,
                fallback_removal_count: 0,
            })),
        };
        let prev = self.map.insert(
            node.ptr().addr(),
            ShadowRecord {
                state: Arc::clone(&state),
                level,
            },
        );
        debug_assert!(prev.is_none(), "shadow record already present");
        state
    }

    /// Lock the shadow mutex of `node` and return the guard, or `None`
    /// if the node was concurrently recompacted or detached (the caller
    /// retries from the root).
    pub(crate) fn lookup_lock(&self, node: TaggedRef) -> Option<ShadowGuard> {
        let addr = node.ptr().addr();
        // Clone the Arc out and drop the map ref before blocking: never
        // sleep while holding a shard lock.
        let state = Arc::clone(&self.map.get(&addr)?.state);
        let guard = state.lock_arc();
        // Re-validate: the node may have been cleared (and the address
        // even reused) between the map read and the lock acquisition.
        match self.map.get(&addr) {
            Some(record) if Arc::ptr_eq(&record.state, &state) => Some(guard),
            _ => {
                drop(guard);
                None
            }
        }
    }

    /// The `Arc` behind `node`'s record, for `inherit_from`.
    pub(crate) fn state_of(&self, node: TaggedRef) -> Option<Arc<Mutex<ShadowState>>> {
        self.map
            .get(&node.ptr().addr())
            .map(|record| Arc::clone(&record.state))
    }

    /// Unlink the record of `node`. The caller holds the node's shadow
    /// mutex and has already unpublished the node; storage reclamation
    /// is the caller's business (it knows whether the node was ever
    /// published).
    pub(crate) fn clear(&self, node: TaggedRef) {
        let removed = self.map.remove(&node.ptr().addr());
        debug_assert!(removed.is_some(), "shadow record missing on clear");
    }

    /// Snapshot `(nr_child, fallback_removal_count)` of `node`.
    /// Advisory only; every decision taken from it is re-validated
    /// under the lock. Must not be called while already holding this
    /// node's shadow mutex.
    pub(crate) fn peek_counts(&self, node: TaggedRef) -> Option<(u32, i32)> {
        // Clone the Arc out before blocking on the mutex: the holder
        // may be inserting into this map shard right now.
        let state = Arc::clone(&self.map.get(&node.ptr().addr())?.state);
        let state = state.lock();
        Some((state.nr_child, state.fallback_removal_count))
    }

    /// Number of records (tests and validation).
    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn level_of(&self, node: TaggedRef) -> Option<usize> {
        self.map.get(&node.ptr().addr()).map(|record| record.level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trie::node::{alloc_node, free_node};

    #[test]
    fn lock_and_validate() {
        let dir = ShadowDir::new();
        let node = alloc_node(0);
        dir.set(node, 2, 1, None);

        let guard = dir.lookup_lock(node).expect("record present");
        assert_eq!(guard.nr_child, 1);
        drop(guard);

        dir.clear(node);
        assert!(dir.lookup_lock(node).is_none());
        // SAFETY: never published.
        unsafe { free_node(node) };
    }

    #[test]
    fn inherit_preserves_mutex_identity_and_counters() {
        let dir = ShadowDir::new();
        let old = alloc_node(0);
        let new = alloc_node(1);

        let old_state = dir.set(old, 0, 1, None);
        old_state.lock().fallback_removal_count = 3;

        let inherited = dir.set(new, 0, 2, Some(&old_state));
        assert!(Arc::ptr_eq(&old_state, &inherited));
        dir.clear(old);

        let guard = dir.lookup_lock(new).expect("new record present");
        assert_eq!(guard.fallback_removal_count, 3);
        drop(guard);

        // SAFETY: never published.
        unsafe {
            free_node(old);
            free_node(new);
        }
    }
}
