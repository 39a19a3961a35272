//! Update-side operations: add, add_unique, del, recompaction.
//!
//! # Locking protocol
//!
//! Every slot modification of a node holds that node's shadow mutex.
//! Publishing a node's replacement (recompaction) additionally holds
//! the parent's mutex, because it rewrites the parent's slot; the root
//! node's "parent slot" is the trie's root word and needs no extra
//! lock. Multi-node acquisitions always run top-down along one
//! root-to-leaf path, which totally orders conflicting writers.
//!
//! After locking, the writer re-walks from the root and re-reads every
//! datum its plan depends on; any mismatch drops the locks and retries
//! from scratch. Lost races therefore never surface to the caller.

use std::ptr::NonNull;

use crate::error::TrieError;
use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::reclaim::ReadGuard;
use crate::tagged::TaggedRef;
use crate::tracing_helpers::{debug_log, trace_log};

use super::layout::{FALLBACK_REMOVAL_COUNT, JA_TYPES, NodeClass, PIGEON_TYPE};
use super::node::{self, SetError};
use super::shadow::ShadowGuard;
use super::{JudyTrie, TrieEntry, Walk, entry_ptr};

/// Where a recompacted node gets republished.
enum ParentSlot {
    Root,
    Node { word: TaggedRef, digit: u8 },
}

impl ParentSlot {
    /// # Safety
    ///
    /// For `Node`, the parent's shadow mutex must be held and `digit`
    /// must be populated.
    unsafe fn publish<T: TrieEntry>(&self, trie: &JudyTrie<T>, new: TaggedRef) {
        match self {
            Self::Root => trie.publish_root(new),
            Self::Node { word, digit } => {
                // SAFETY: per contract.
                unsafe { node::replace_nth(*word, *digit, new.raw()) };
            }
        }
    }
}

impl<T: TrieEntry> JudyTrie<T> {
    // ========================================================================
    //  Public API
    // ========================================================================

    /// Add `entry` at `key`, allowing duplicates (appended at the chain
    /// tail).
    ///
    /// # Safety
    ///
    /// The caller keeps ownership of `entry` and must keep it valid
    /// until a grace period after it is removed; the entry's link must
    /// not be used by anything else while stored.
    pub unsafe fn add(
        &self,
        key: u64,
        entry: NonNull<T>,
        guard: &ReadGuard<'_>,
    ) -> Result<(), TrieError> {
        // SAFETY: forwarded caller contract.
        unsafe { self.add_impl(key, entry, false, guard) }.map(|_| ())
    }

    /// Add `entry` at `key` unless the key is already populated.
    ///
    /// Returns `Ok(None)` when added, or `Ok(Some(head))` with the
    /// existing chain head (acting as a lookup under the same guard).
    ///
    /// # Safety
    ///
    /// As [`JudyTrie::add`].
    pub unsafe fn add_unique<'g>(
        &self,
        key: u64,
        entry: NonNull<T>,
        guard: &'g ReadGuard<'_>,
    ) -> Result<Option<&'g T>, TrieError> {
        // SAFETY: forwarded caller contract; the returned head stays
        // valid for the guard's lifetime.
        unsafe {
            self.add_impl(key, entry, true, guard)
                .map(|existing| existing.map(|ptr| &*ptr.cast::<T>()))
        }
    }

    /// Remove `entry` from `key`'s duplicate chain.
    ///
    /// Empties out the branch above it when `entry` was the last entry
    /// below, and shrinks the surviving node when its child count falls
    /// into the previous class window.
    ///
    /// # Safety
    ///
    /// `entry` must be the same pointer previously passed to `add` /
    /// `add_unique` for `key`. The caller must not release the entry
    /// until a grace period has elapsed.
    pub unsafe fn del(
        &self,
        key: u64,
        entry: NonNull<T>,
        guard: &ReadGuard<'_>,
    ) -> Result<(), TrieError> {
        if key > self.key_max() {
            return Err(TrieError::Invalid);
        }
        let eptr = entry.as_ptr();

        loop {
            let walk = self.walk(key);
            if !walk.complete() {
                return Err(TrieError::NotFound);
            }
            let leaf_level = self.depth() - 1;
            let head = walk.leaf.cast::<T>();

            // SAFETY: head is published; we are inside the caller's
            // read section.
            let sole = head == eptr && unsafe { (*head).link().next.load(READ_ORD).is_null() };

            let outcome = if sole {
                // SAFETY: per caller contract; retries on any raced state.
                unsafe { self.del_sole(key, &walk, eptr, guard) }
            } else {
                // SAFETY: as above.
                unsafe { self.del_chained(key, &walk, eptr, leaf_level) }
            };
            match outcome {
                DelOutcome::Done => return Ok(()),
                DelOutcome::NotFound => return Err(TrieError::NotFound),
                DelOutcome::Retry => {}
            }
        }
    }

    // ========================================================================
    //  add implementation
    // ========================================================================

    /// Returns `Ok(Some(head))` when `unique` and the key is populated.
    unsafe fn add_impl(
        &self,
        key: u64,
        entry: NonNull<T>,
        unique: bool,
        guard: &ReadGuard<'_>,
    ) -> Result<Option<*mut u8>, TrieError> {
        if key > self.key_max() {
            return Err(TrieError::Invalid);
        }
        let eptr = entry_ptr(entry);
        // SAFETY: the caller owns the entry; it is not yet shared.
        unsafe {
            entry.as_ref().link().next.store(std::ptr::null_mut(), RELAXED);
        }

        // Level whose node should be recompacted on the next attempt,
        // requiring its parent locked for republication.
        let mut widen_level: Option<usize> = None;

        loop {
            let walk = self.walk(key);
            let modify_level = if walk.complete() {
                self.depth() - 1
            } else {
                walk.stop_level
            };

            if walk.complete() && unique {
                return Ok(Some(walk.leaf));
            }

            let _parent_guard: Option<ShadowGuard> =
                if widen_level == Some(modify_level) && modify_level > 0 {
                    match self.shadow().lookup_lock(walk.nodes[modify_level - 1]) {
                        Some(g) => Some(g),
                        None => continue,
                    }
                } else {
                    None
                };
            let Some(mut node_guard) = self.shadow().lookup_lock(walk.nodes[modify_level]) else {
                continue;
            };

            if !self.path_is_current(key, &walk, modify_level) {
                continue;
            }

            let digit = self.digit(key, modify_level);
            // SAFETY: the node is reachable and its mutex is held.
            let cur = unsafe { node::get_nth(walk.nodes[modify_level], digit) };

            if modify_level == self.depth() - 1 && !cur.is_null() {
                if unique {
                    return Ok(Some(cur));
                }
                // Append at the chain tail: a single Release store.
                // SAFETY: chain entries stay valid under the read
                // section; the leaf node's mutex serializes chain
                // updates.
                unsafe {
                    let mut tail = cur.cast::<T>();
                    loop {
                        let next = (*tail).link().next.load(RELAXED);
                        if next.is_null() {
                            break;
                        }
                        tail = next;
                    }
                    (*tail).link().next.store(entry.as_ptr(), WRITE_ORD);
                }
                return Ok(None);
            }

            if !cur.is_null() {
                // A concurrent add attached a deeper branch; descend
                // through it on the next attempt.
                continue;
            }

            // Build the missing branch bottom-up, then attach it with a
            // single slot publication.
            let mut child: *mut u8 = eptr;
            let mut built: Vec<TaggedRef> = Vec::new();
            for lvl in ((modify_level + 1)..self.depth()).rev() {
                let word = node::alloc_node(0);
                // SAFETY: word is fresh and exclusively ours.
                if unsafe { node::set_nth(word, self.digit(key, lvl), child) }.is_err() {
                    unreachable!("fresh single-slot node cannot be full");
                }
                self.shadow().set(word, lvl, 1, None);
                built.push(word);
                child = word.raw();
            }

            // SAFETY: mutex held, path validated.
            match unsafe { node::set_nth(walk.nodes[modify_level], digit, child) } {
                Ok(()) => {
                    node_guard.nr_child += 1;
                    return Ok(None);
                }
                Err(SetError::Exists) => unreachable!("slot re-checked under the node mutex"),
                Err(SetError::NoSpace) => {
                    if modify_level > 0 && _parent_guard.is_none() {
                        // Republication rewrites the parent slot; retry
                        // with the parent locked as well.
                        self.dispose_built(&built);
                        widen_level = Some(modify_level);
                        continue;
                    }
                    let parent_slot = if modify_level == 0 {
                        ParentSlot::Root
                    } else {
                        ParentSlot::Node {
                            word: walk.nodes[modify_level - 1],
                            digit: self.digit(key, modify_level - 1),
                        }
                    };
                    // SAFETY: node and (where needed) parent mutexes
                    // held; path validated.
                    unsafe {
                        self.recompact_grow(
                            walk.nodes[modify_level],
                            modify_level,
                            &parent_slot,
                            (digit, child),
                            &mut node_guard,
                            guard,
                        );
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Free a never-published attach chain.
    fn dispose_built(&self, built: &[TaggedRef]) {
        for word in built {
            self.shadow().clear(*word);
            // SAFETY: the chain was never published; no reader can
            // hold it.
            unsafe { node::free_node(*word) };
        }
    }

    // ========================================================================
    //  del implementation
    // ========================================================================

    /// Unlink `eptr` from a chain that keeps other entries.
    unsafe fn del_chained(
        &self,
        key: u64,
        walk: &Walk,
        eptr: *mut T,
        leaf_level: usize,
    ) -> DelOutcome {
        let Some(_node_guard) = self.shadow().lookup_lock(walk.nodes[leaf_level]) else {
            return DelOutcome::Retry;
        };
        if !self.path_is_current(key, walk, leaf_level) {
            return DelOutcome::Retry;
        }

        let digit = self.digit(key, leaf_level);
        // SAFETY: mutex held; path validated.
        let cur = unsafe { node::get_nth(walk.nodes[leaf_level], digit) };
        if cur.is_null() {
            return DelOutcome::NotFound;
        }

        // Re-scan the chain under the lock.
        let mut prev: *mut T = std::ptr::null_mut();
        let mut it = cur.cast::<T>();
        // SAFETY: chain entries are kept alive by their owners until a
        // grace period after removal; we are inside a read section.
        unsafe {
            loop {
                if it.is_null() {
                    return DelOutcome::NotFound;
                }
                if it == eptr {
                    break;
                }
                prev = it;
                it = (*it).link().next.load(RELAXED);
            }
            let next = (*eptr).link().next.load(RELAXED);
            if prev.is_null() {
                if next.is_null() {
                    // Became the sole entry since the preview; the slot
                    // itself must go.
                    return DelOutcome::Retry;
                }
                node::replace_nth(walk.nodes[leaf_level], digit, next.cast());
            } else {
                (*prev).link().next.store(next, WRITE_ORD);
            }
        }
        DelOutcome::Done
    }

    /// Remove the only entry below `key`: clear a slot, drop the now
    /// childless branch, shrink the surviving node if indicated.
    unsafe fn del_sole(
        &self,
        key: u64,
        walk: &Walk,
        eptr: *mut T,
        guard: &ReadGuard<'_>,
    ) -> DelOutcome {
        let leaf_level = self.depth() - 1;

        // Plan from advisory counts; every decision is re-validated
        // under the locks.
        let mut clear_level = leaf_level;
        while clear_level > 0 {
            let (nr_child, _) = match self.shadow().peek_counts(walk.nodes[clear_level]) {
                Some(counts) => counts,
                None => return DelOutcome::Retry,
            };
            if nr_child > 1 {
                break;
            }
            clear_level -= 1;
        }

        let (nr_child, fallback) = match self.shadow().peek_counts(walk.nodes[clear_level]) {
            Some(counts) => counts,
            None => return DelOutcome::Retry,
        };
        let ty = &JA_TYPES[walk.nodes[clear_level].type_index()];
        let may_shrink = fallback > 0
            || (walk.nodes[clear_level].type_index() > 0
                && nr_child.saturating_sub(1) < ty.min_child as u32);
        let want_parent = may_shrink && clear_level > 0;

        // Lock top-down along the path: optional parent, survivor, then
        // every node of the dying branch.
        let parent_guard: Option<ShadowGuard> = if want_parent {
            match self.shadow().lookup_lock(walk.nodes[clear_level - 1]) {
                Some(g) => Some(g),
                None => return DelOutcome::Retry,
            }
        } else {
            None
        };
        let Some(mut clear_guard) = self.shadow().lookup_lock(walk.nodes[clear_level]) else {
            return DelOutcome::Retry;
        };
        let mut doomed_guards: Vec<ShadowGuard> = Vec::new();
        for lvl in (clear_level + 1)..=leaf_level {
            match self.shadow().lookup_lock(walk.nodes[lvl]) {
                Some(g) => doomed_guards.push(g),
                None => return DelOutcome::Retry,
            }
        }

        // Validate the whole plan under the locks.
        if !self.path_is_current(key, walk, leaf_level) {
            return DelOutcome::Retry;
        }
        for g in &doomed_guards {
            if g.nr_child != 1 {
                return DelOutcome::Retry;
            }
        }
        if clear_level > 0 && clear_guard.nr_child <= 1 {
            return DelOutcome::Retry;
        }
        let digit_leaf = self.digit(key, leaf_level);
        // SAFETY: locks held; path validated.
        let cur = unsafe { node::get_nth(walk.nodes[leaf_level], digit_leaf) };
        if cur != eptr.cast::<u8>() {
            return DelOutcome::Retry;
        }
        // SAFETY: eptr is the published head; owner keeps it valid.
        if unsafe { !(*eptr).link().next.load(RELAXED).is_null() } {
            // A duplicate was appended meanwhile.
            return DelOutcome::Retry;
        }

        // Commit: one store unpublishes the entry and the dying branch.
        let digit_clear = self.digit(key, clear_level);
        // SAFETY: survivor mutex held.
        let cleared = unsafe { node::clear_nth(walk.nodes[clear_level], digit_clear) };
        debug_assert!(cleared, "validated slot vanished under its mutex");
        clear_guard.nr_child -= 1;

        for lvl in (clear_level + 1)..=leaf_level {
            trace_log!(tree_level = lvl, "trie del: detaching emptied node");
            self.shadow().clear(walk.nodes[lvl]);
            // SAFETY: unreachable since the clear_nth above; readers
            // may still hold it, hence deferred.
            unsafe { node::defer_free_node(guard, walk.nodes[lvl]) };
        }
        drop(doomed_guards);

        let parent_slot = match (clear_level, &parent_guard) {
            (0, _) => Some(ParentSlot::Root),
            (_, Some(_)) => Some(ParentSlot::Node {
                word: walk.nodes[clear_level - 1],
                digit: self.digit(key, clear_level - 1),
            }),
            (_, None) => None,
        };
        // SAFETY: survivor (and parent where present) mutexes held.
        unsafe {
            self.maybe_shrink(
                walk.nodes[clear_level],
                clear_level,
                parent_slot.as_ref(),
                &mut clear_guard,
                guard,
            );
        }
        DelOutcome::Done
    }

    // ========================================================================
    //  Recompaction
    // ========================================================================

    /// Re-walk from the root and compare against the recorded path up
    /// to `upto` (inclusive). Any divergence means the plan is stale.
    fn path_is_current(&self, key: u64, walk: &Walk, upto: usize) -> bool {
        let mut word = self.root_word();
        if word != walk.nodes[0] {
            return false;
        }
        for lvl in 0..upto {
            // SAFETY: word is the published node at lvl; we are inside
            // a read section.
            let child = unsafe { node::get_nth(word, self.digit(key, lvl)) };
            if child.is_null() {
                return false;
            }
            word = TaggedRef::from_raw(child);
            if word != walk.nodes[lvl + 1] {
                return false;
            }
        }
        true
    }

    /// Replace `old` with a node of the next larger class (or the
    /// pigeon fallback), adding `(digit, child)`, and publish it with a
    /// single store into `parent_slot`.
    ///
    /// # Safety
    ///
    /// `old`'s mutex is held (as `state`), the parent's mutex is held
    /// for non-root slots, and the path is validated.
    unsafe fn recompact_grow(
        &self,
        old: TaggedRef,
        level: usize,
        parent_slot: &ParentSlot,
        add: (u8, *mut u8),
        state: &mut ShadowGuard,
        guard: &ReadGuard<'_>,
    ) {
        let old_index = old.type_index();
        let live = state.nr_child;

        let mut new_index = old_index + 1;
        if JA_TYPES[old_index].class == NodeClass::Pool
            && live + 1 <= JA_TYPES[old_index].max_child as u32
        {
            // A sub-pool filled before the logical capacity: skew falls
            // back straight to the dense layout.
            new_index = PIGEON_TYPE;
        }

        loop {
            debug_assert!(new_index < JA_TYPES.len());
            let new = node::alloc_node(new_index);
            // SAFETY: old's mutex is held; new is exclusively ours.
            let filled = unsafe { fill_node(new, old, add) };
            if !filled {
                // The target's pool distribution overflowed as well.
                // SAFETY: never published.
                unsafe { node::free_node(new) };
                new_index = PIGEON_TYPE;
                continue;
            }

            let fallback =
                new_index == PIGEON_TYPE && live + 1 < JA_TYPES[PIGEON_TYPE].min_child as u32;
            debug_log!(
                tree_level = level,
                old_class = old_index,
                new_class = new_index,
                fallback,
                "trie recompaction (grow)"
            );

            let inherit = self.shadow().state_of(old);
            self.shadow().set(new, level, 0, inherit.as_ref());
            // SAFETY: publication contract of ParentSlot.
            unsafe { parent_slot.publish(self, new) };
            self.shadow().clear(old);
            // SAFETY: old is unreachable from the published trie.
            unsafe { node::defer_free_node(guard, old) };

            state.nr_child = live + 1;
            if fallback && state.fallback_removal_count == 0 {
                state.fallback_removal_count = FALLBACK_REMOVAL_COUNT;
                self.count_fallback();
            }
            return;
        }
    }

    /// Shrink `old` when its live count fell out of its class window
    /// (or its fallback budget ran out). Skipped when the parent slot
    /// is unavailable; the next removal re-triggers it.
    ///
    /// # Safety
    ///
    /// As [`JudyTrie::recompact_grow`].
    unsafe fn maybe_shrink(
        &self,
        old: TaggedRef,
        level: usize,
        parent_slot: Option<&ParentSlot>,
        state: &mut ShadowGuard,
        guard: &ReadGuard<'_>,
    ) {
        let old_index = old.type_index();
        let live = state.nr_child;
        if live == 0 {
            // Only the root can empty out; it keeps its smallest class.
            return;
        }

        let mut smallest_fit = false;
        if state.fallback_removal_count > 0 {
            state.fallback_removal_count -= 1;
            if state.fallback_removal_count > 0 {
                return;
            }
            if live >= JA_TYPES[PIGEON_TYPE].min_child as u32 {
                // Grew into a legitimate pigeon meanwhile.
                return;
            }
            smallest_fit = true;
        } else {
            if old_index == 0 || live >= JA_TYPES[old_index].min_child as u32 {
                return;
            }
        }

        let Some(parent_slot) = parent_slot else {
            // The advisory plan missed; re-arm so a later removal
            // retries with the parent locked.
            if smallest_fit {
                state.fallback_removal_count = 1;
            }
            return;
        };

        let mut new_index = if smallest_fit {
            let mut idx = 0;
            while (JA_TYPES[idx].max_child as u32) < live {
                idx += 1;
            }
            idx
        } else {
            old_index - 1
        };

        loop {
            if new_index >= old_index {
                // Nothing smaller fits this distribution.
                return;
            }
            let new = node::alloc_node(new_index);
            // SAFETY: old's mutex is held; new is exclusively ours.
            let filled = unsafe { fill_node_copy(new, old) };
            if !filled {
                // SAFETY: never published.
                unsafe { node::free_node(new) };
                new_index += 1;
                continue;
            }

            debug_log!(
                tree_level = level,
                old_class = old_index,
                new_class = new_index,
                "trie recompaction (shrink)"
            );

            let inherit = self.shadow().state_of(old);
            self.shadow().set(new, level, 0, inherit.as_ref());
            // SAFETY: publication contract of ParentSlot.
            unsafe { parent_slot.publish(self, new) };
            self.shadow().clear(old);
            // SAFETY: old is unreachable from the published trie.
            unsafe { node::defer_free_node(guard, old) };
            return;
        }
    }
}

enum DelOutcome {
    Done,
    NotFound,
    Retry,
}

/// Copy every live pair of `old` plus `add` into `new`. False when a
/// linear area of `new` overflows.
///
/// # Safety
///
/// `old`'s mutex is held; `new` is unpublished.
unsafe fn fill_node(new: TaggedRef, old: TaggedRef, add: (u8, *mut u8)) -> bool {
    // SAFETY: per contract.
    unsafe {
        for (d, c) in node::children_of(old) {
            if node::set_nth(new, d, c).is_err() {
                return false;
            }
        }
        node::set_nth(new, add.0, add.1).is_ok()
    }
}

/// Copy every live pair of `old` into `new` (shrink path).
///
/// # Safety
///
/// As [`fill_node`].
unsafe fn fill_node_copy(new: TaggedRef, old: TaggedRef) -> bool {
    // SAFETY: per contract.
    unsafe {
        for (d, c) in node::children_of(old) {
            if node::set_nth(new, d, c).is_err() {
                return false;
            }
        }
    }
    true
}
