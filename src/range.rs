//! Range-interval layer: a total partition of the key space.
//!
//! A [`RangeMap`] keeps `[0, KEY_MAX]` tiled by [`Segment`]s that are
//! either free or allocated; removed segments are transient, already
//! unlinked and awaiting reclamation. Segments live in a 64-bit
//! [`JudyTrie`] keyed by their start.
//!
//! Splitting and merging replace segments rather than resizing them:
//! replacements are inserted *before* the originals are removed, so a
//! concurrent `lookup_below_equal` sees either the old or the new
//! partition under the trie's duplicate-key cover. State only ever
//! moves `free -> removed` or `allocated -> removed`.
//!
//! Writers lock the affected segments in increasing key order (and
//! release in reverse), re-validating against `removed` after each
//! acquisition; any lost race retries from scratch and never surfaces
//! to the caller.

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::AtomicU8;

use parking_lot::{Mutex, MutexGuard};

use crate::error::RangeError;
use crate::ordering::{READ_ORD, WRITE_ORD};
use crate::reclaim::{Domain, ReadGuard, reclaim_boxed};
use crate::trie::{DupLink, JudyTrie, TrieEntry};

/// Largest key the partition covers; the topmost key is reserved.
pub const KEY_MAX: u64 = u64::MAX - 1;

// ============================================================================
//  Segment
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum SegmentState {
    Free = 0,
    Allocated = 1,
    /// Unlinked from the trie, awaiting reclamation.
    Removed = 2,
}

/// One maximal piece of the key space, `[start, end]` inclusive.
pub struct Segment<P> {
    link: DupLink<Segment<P>>,
    start: u64,
    end: u64,
    state: AtomicU8,
    payload: Option<P>,
    lock: Mutex<()>,
}

impl<P: Send + Sync> TrieEntry for Segment<P> {
    fn link(&self) -> &DupLink<Self> {
        &self.link
    }
}

impl<P> Segment<P> {
    fn new(start: u64, end: u64, state: SegmentState, payload: Option<P>) -> Self {
        Self {
            link: DupLink::new(),
            start,
            end,
            state: AtomicU8::new(state as u8),
            payload,
            lock: Mutex::new(()),
        }
    }

    /// Inclusive start key.
    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Inclusive end key.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.end
    }

    #[must_use]
    pub fn state(&self) -> SegmentState {
        match self.state.load(READ_ORD) {
            0 => SegmentState::Free,
            1 => SegmentState::Allocated,
            _ => SegmentState::Removed,
        }
    }

    /// The opaque payload of an allocated segment.
    #[must_use]
    pub fn payload(&self) -> Option<&P> {
        self.payload.as_ref()
    }

    fn mark_removed(&self) {
        self.state.store(SegmentState::Removed as u8, WRITE_ORD);
    }

    /// Take the segment's mutex for exclusion against removal. `None`
    /// if the segment was removed meanwhile; existence until then is
    /// the caller's read section's business.
    #[must_use]
    pub fn lock(&self) -> Option<SegmentGuard<'_, P>> {
        let guard = self.lock.lock();
        if self.state() == SegmentState::Removed {
            return None;
        }
        Some(SegmentGuard {
            segment: self,
            _guard: guard,
        })
    }
}

/// Holds a segment's mutex; removal of the segment waits for the drop.
pub struct SegmentGuard<'a, P> {
    segment: &'a Segment<P>,
    _guard: MutexGuard<'a, ()>,
}

impl<P> std::ops::Deref for SegmentGuard<'_, P> {
    type Target = Segment<P>;

    fn deref(&self) -> &Segment<P> {
        self.segment
    }
}

// ============================================================================
//  RangeMap
// ============================================================================

/// A concurrent partition of `[0, KEY_MAX]` into free and allocated
/// segments.
pub struct RangeMap<P: Send + Sync + 'static> {
    trie: JudyTrie<Segment<P>>,
}

impl<P: Send + Sync + 'static> RangeMap<P> {
    /// Create a partition consisting of one free segment covering
    /// everything.
    #[must_use]
    pub fn new(domain: Arc<Domain>) -> Self {
        let trie = JudyTrie::new(domain, 64);
        let seed = alloc_segment::<P>(0, KEY_MAX, SegmentState::Free, None);
        {
            let guard = trie.domain().enter();
            // SAFETY: seed is fresh and owned by this map from now on.
            if unsafe { trie.add(0, seed, &guard) }.is_err() {
                unreachable!("seeding an empty trie cannot fail");
            }
        }
        Self { trie }
    }

    /// Allocate `[start, end]` (inclusive) with `payload`.
    ///
    /// Fails with `AlreadyExists` when the span is not entirely inside
    /// one free segment (straddling a boundary is an error; free ranges
    /// merge only on [`RangeMap::del`]).
    pub fn add<'g>(
        &self,
        start: u64,
        end: u64,
        payload: P,
        guard: &'g ReadGuard<'_>,
    ) -> Result<&'g Segment<P>, RangeError> {
        if start > end || end > KEY_MAX {
            return Err(RangeError::Invalid);
        }
        let mut payload = Some(payload);

        loop {
            let Some(head) = self.trie.lookup_below_equal(start, guard) else {
                // Transient boundary gap under a concurrent update.
                continue;
            };
            let old = self.last_duplicate(head, guard);

            match old.state() {
                SegmentState::Allocated => return Err(RangeError::AlreadyExists),
                SegmentState::Removed => continue,
                SegmentState::Free => {}
            }
            if old.end < start {
                // Gap: the covering segment is mid-replacement.
                continue;
            }
            if end > old.end {
                return Err(RangeError::AlreadyExists);
            }

            let old_guard = old.lock.lock();
            if old.state() == SegmentState::Removed {
                drop(old_guard);
                continue;
            }

            // Build the replacement partition of `old`: at most two
            // free remainders around the allocated middle, every
            // replacement born locked.
            let mut replacements: Vec<NonNull<Segment<P>>> = Vec::with_capacity(3);
            if start > old.start {
                replacements.push(alloc_segment(old.start, start - 1, SegmentState::Free, None));
            }
            let middle = alloc_segment(start, end, SegmentState::Allocated, payload.take());
            replacements.push(middle);
            if end < old.end {
                replacements.push(alloc_segment(end + 1, old.end, SegmentState::Free, None));
            }

            let born_locked: Vec<MutexGuard<'_, ()>> = replacements
                .iter()
                // SAFETY: fresh segments, unpublished until added below.
                .map(|seg| unsafe { &(*seg.as_ptr()).lock }.lock())
                .collect();

            // Insert the replacements before removing the original, so
            // concurrent traversals always see one or the other (the
            // trie keeps duplicate keys visible).
            for seg in &replacements {
                // SAFETY: fresh segments owned by this map.
                let key = unsafe { seg.as_ref().start };
                if unsafe { self.trie.add(key, *seg, guard) }.is_err() {
                    unreachable!("replacement keys are in range and duplicates are allowed");
                }
            }

            let old_ptr = NonNull::from(old);
            // SAFETY: old is the entry previously added under old.start.
            if unsafe { self.trie.del(old.start, old_ptr, guard) }.is_err() {
                unreachable!("old segment is pinned by its mutex");
            }
            old.mark_removed();
            drop(old_guard);
            // SAFETY: old is unlinked; no new reader can find it.
            unsafe { guard.defer_reclaim(old_ptr.as_ptr(), reclaim_boxed::<Segment<P>>) };

            drop(born_locked);
            // SAFETY: middle is published and protected by the guard.
            return Ok(unsafe { &*middle.as_ptr() });
        }
    }

    /// Free an allocated segment, merging with abutting free segments
    /// into one maximal free segment.
    pub fn del(&self, segment: &Segment<P>, guard: &ReadGuard<'_>) -> Result<(), RangeError> {
        loop {
            if segment.state() == SegmentState::Removed {
                return Err(RangeError::NotFound);
            }

            // Locate the abutting neighbours; allocated ones stay as
            // they are but get locked to serialize concurrent deletions
            // of touching segments.
            let left = if segment.start > 0 {
                let Some(head) = self.trie.lookup_below_equal(segment.start - 1, guard) else {
                    continue;
                };
                let left = self.last_duplicate(head, guard);
                if left.end != segment.start - 1 {
                    // Mid-replacement boundary; retry.
                    continue;
                }
                Some(left)
            } else {
                None
            };
            let right = if segment.end < KEY_MAX {
                let Some(head) = self.trie.lookup_above_equal(segment.end + 1, guard) else {
                    continue;
                };
                let right = self.last_duplicate(head, guard);
                if right.start != segment.end + 1 {
                    continue;
                }
                Some(right)
            } else {
                None
            };

            // Lock in increasing key order; drops run in reverse.
            let _left_guard = left.map(|l| l.lock.lock());
            let _self_guard = segment.lock.lock();
            let _right_guard = right.map(|r| r.lock.lock());

            if segment.state() != SegmentState::Allocated {
                return Err(RangeError::NotFound);
            }
            if left.is_some_and(|l| l.state() == SegmentState::Removed)
                || right.is_some_and(|r| r.state() == SegmentState::Removed)
            {
                continue;
            }

            // The contiguous non-allocated run around the segment.
            let merge_left = left.filter(|l| l.state() == SegmentState::Free);
            let merge_right = right.filter(|r| r.state() == SegmentState::Free);
            let run_start = merge_left.map_or(segment.start, |l| l.start);
            let run_end = merge_right.map_or(segment.end, |r| r.end);

            let merged = alloc_segment::<P>(run_start, run_end, SegmentState::Free, None);
            // SAFETY: fresh segment, unpublished.
            let _merged_guard = unsafe { &(*merged.as_ptr()).lock }.lock();
            // SAFETY: merged is owned by this map from now on.
            if unsafe { self.trie.add(run_start, merged, guard) }.is_err() {
                unreachable!("merged key is in range and duplicates are allowed");
            }

            for member in [merge_left, Some(segment), merge_right].into_iter().flatten() {
                let ptr = NonNull::from(member);
                // SAFETY: member is pinned by the lock held above.
                if unsafe { self.trie.del(member.start, ptr, guard) }.is_err() {
                    unreachable!("run member is pinned by its mutex");
                }
                member.mark_removed();
                // SAFETY: member is unlinked; no new reader can find it.
                unsafe { guard.defer_reclaim(ptr.as_ptr(), reclaim_boxed::<Segment<P>>) };
            }
            return Ok(());
        }
    }

    /// The allocated segment containing `key`, or `None` (including
    /// when a concurrent update leaves the boundary transiently
    /// unresolved: that reads as "no allocated range here").
    #[must_use]
    pub fn lookup<'g>(&self, key: u64, guard: &'g ReadGuard<'_>) -> Option<&'g Segment<P>> {
        if key > KEY_MAX {
            return None;
        }
        let head = self.trie.lookup_below_equal(key, guard)?;
        // New segments are appended to the duplicate chain as they
        // replace old ones on the same start key, so the last entry is
        // the current one.
        let segment = self.last_duplicate(head, guard);
        if segment.state() == SegmentState::Allocated && segment.start <= key && key <= segment.end
        {
            Some(segment)
        } else {
            None
        }
    }

    /// Check the partition invariants with all writers quiesced:
    /// non-removed segments exactly tile `[0, KEY_MAX]` and no two free
    /// segments abut. Returns the segment count.
    pub fn validate(&self) -> usize {
        let guard = self.trie.domain().enter();
        let mut expected = 0u64;
        let mut count = 0usize;
        let mut prev_free = false;
        loop {
            let Some(head) = self.trie.lookup_above_equal(expected, &guard) else {
                panic!("partition gap at {expected}");
            };
            let segment = self.last_duplicate(head, &guard);
            assert_eq!(segment.start, expected, "partition gap or overlap");
            assert_ne!(
                segment.state(),
                SegmentState::Removed,
                "removed segment still reachable after quiesce"
            );
            let free = segment.state() == SegmentState::Free;
            assert!(!(prev_free && free), "adjacent free segments");
            prev_free = free;
            count += 1;
            if segment.end >= KEY_MAX {
                assert_eq!(segment.end, KEY_MAX, "partition overruns KEY_MAX");
                return count;
            }
            expected = segment.end + 1;
        }
    }

    fn last_duplicate<'g>(
        &self,
        head: &'g Segment<P>,
        guard: &'g ReadGuard<'_>,
    ) -> &'g Segment<P> {
        self.trie.duplicates(head, guard).last().unwrap_or(head)
    }
}

impl<P: Send + Sync + 'static> Drop for RangeMap<P> {
    fn drop(&mut self) {
        // Sole owner: unlink and free every segment synchronously.
        let guard = self.trie.domain().enter();
        let mut key = 0u64;
        loop {
            let Some(head) = self.trie.lookup_above_equal(key, &guard) else {
                break;
            };
            let start = head.start;
            let chain: Vec<*mut Segment<P>> = self
                .trie
                .duplicates(head, &guard)
                .map(|seg| seg as *const Segment<P> as *mut Segment<P>)
                .collect();
            for ptr in chain {
                // SAFETY: sole owner; ptr came from Box::into_raw in
                // alloc_segment.
                unsafe {
                    let _ = self.trie.del(start, NonNull::new_unchecked(ptr), &guard);
                    drop(Box::from_raw(ptr));
                }
            }
            let Some(next) = start.checked_add(1) else {
                break;
            };
            key = next;
        }
    }
}

fn alloc_segment<P>(
    start: u64,
    end: u64,
    state: SegmentState,
    payload: Option<P>,
) -> NonNull<Segment<P>> {
    let boxed = Box::new(Segment::new(start, end, state, payload));
    // SAFETY: Box::into_raw never returns null.
    unsafe { NonNull::new_unchecked(Box::into_raw(boxed)) }
}
