//! Read-side lookups.
//!
//! All variants are lock-free walks over published slots. During an
//! update that replaces neighbouring keys (the range layer shrinking
//! one span while growing the next), `lookup_below_equal` /
//! `lookup_above_equal` may transiently find nothing for a key in the
//! middle; callers retry.

use crate::reclaim::ReadGuard;
use crate::tagged::TaggedRef;

use super::{JudyTrie, TrieEntry, node};

impl<T: TrieEntry> JudyTrie<T> {
    /// Exact-match lookup: the head of `key`'s duplicate chain.
    #[must_use]
    pub fn lookup<'g>(&self, key: u64, _guard: &'g ReadGuard<'_>) -> Option<&'g T> {
        if key > self.key_max() {
            return None;
        }
        let walk = self.walk(key);
        if walk.complete() {
            // SAFETY: leaf slots hold entry pointers published with
            // Release; the guard keeps the entry alive.
            Some(unsafe { &*walk.leaf.cast::<T>() })
        } else {
            None
        }
    }

    /// The chain for the greatest key `k' <= key`.
    ///
    /// Descends toward `key`; at a missing slot it rewinds to the last
    /// ancestor with a populated smaller digit and takes that subtree's
    /// maximum.
    #[must_use]
    pub fn lookup_below_equal<'g>(&self, key: u64, _guard: &'g ReadGuard<'_>) -> Option<&'g T> {
        let key = key.min(self.key_max());
        let walk = self.walk(key);
        if walk.complete() {
            // SAFETY: as in lookup.
            return Some(unsafe { &*walk.leaf.cast::<T>() });
        }
        for lvl in (0..=walk.stop_level).rev() {
            // SAFETY: recorded node words were published slots read
            // inside this read section.
            let found = unsafe { node::left_of(walk.nodes[lvl], Some(self.digit(key, lvl))) };
            if let Some((_, child)) = found {
                // SAFETY: as above.
                return self
                    .descend_extreme(child, lvl + 1, Extreme::Max)
                    .map(|leaf| unsafe { &*leaf.cast::<T>() });
            }
        }
        None
    }

    /// The chain for the smallest key `k' >= key`. Mirror of
    /// [`JudyTrie::lookup_below_equal`].
    #[must_use]
    pub fn lookup_above_equal<'g>(&self, key: u64, _guard: &'g ReadGuard<'_>) -> Option<&'g T> {
        if key > self.key_max() {
            return None;
        }
        let walk = self.walk(key);
        if walk.complete() {
            // SAFETY: as in lookup.
            return Some(unsafe { &*walk.leaf.cast::<T>() });
        }
        for lvl in (0..=walk.stop_level).rev() {
            // SAFETY: as in lookup_below_equal.
            let found = unsafe { node::right_of(walk.nodes[lvl], Some(self.digit(key, lvl))) };
            if let Some((_, child)) = found {
                // SAFETY: as above.
                return self
                    .descend_extreme(child, lvl + 1, Extreme::Min)
                    .map(|leaf| unsafe { &*leaf.cast::<T>() });
            }
        }
        None
    }

    /// Follow min or max children from `child` (the node or leaf at
    /// `level`) down to a leaf. `None` only under a concurrent
    /// structural update.
    fn descend_extreme(&self, mut child: *mut u8, mut level: usize, dir: Extreme) -> Option<*mut u8> {
        while level < self.depth() {
            let word = TaggedRef::from_raw(child);
            // SAFETY: child was read from a published slot in this read
            // section.
            let next = unsafe {
                match dir {
                    Extreme::Max => node::left_of(word, None),
                    Extreme::Min => node::right_of(word, None),
                }
            };
            let (_, next_child) = next?;
            child = next_child;
            level += 1;
        }
        Some(child)
    }
}

#[derive(Clone, Copy)]
enum Extreme {
    Min,
    Max,
}
