//! Trie node storage and per-class slot operations.
//!
//! Three storage families back the eight classes: a linear area (count
//! byte plus parallel digit/pointer arrays), a pool of 2 or 4 linear
//! areas selected by the top bits of the digit, and a dense 256-slot
//! pigeon array. Per-class capacity is enforced by the class table, not
//! by distinct allocation sizes.
//!
//! # Read protocol (linear areas)
//!
//! Readers load the count with Acquire, then scan `digits[0..count]`;
//! on a match they load the pointer slot. Writers append by storing the
//! pointer, then the digit, then the incremented count, all Release, so
//! a reader either stops before the new slot or sees it fully
//! populated. A populated digit whose pointer slot is null is a hole
//! left by removal and reads as absent.

use std::ptr as StdPtr;
use std::sync::atomic::{AtomicPtr, AtomicU8};

use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::reclaim::{ReadGuard, reclaim_boxed};
use crate::tagged::TaggedRef;

use super::layout::{ENTRY_PER_NODE, JA_TYPES, JaType, MAX_LINEAR_CHILD, MAX_POOLS, NodeClass};

pub(crate) enum SetError {
    /// The digit is already populated.
    Exists,
    /// The linear area is out of slots; the node must recompact.
    NoSpace,
}

// ============================================================================
//  Storage
// ============================================================================

#[repr(C)]
pub(crate) struct LinearNode {
    nr_child: AtomicU8,
    digits: [AtomicU8; MAX_LINEAR_CHILD],
    children: [AtomicPtr<u8>; MAX_LINEAR_CHILD],
}

#[repr(C)]
pub(crate) struct PoolNode {
    pools: [LinearNode; MAX_POOLS],
}

#[repr(C)]
pub(crate) struct PigeonNode {
    children: [AtomicPtr<u8>; ENTRY_PER_NODE],
}

impl LinearNode {
    fn new() -> Self {
        Self {
            nr_child: AtomicU8::new(0),
            digits: std::array::from_fn(|_| AtomicU8::new(0)),
            children: std::array::from_fn(|_| AtomicPtr::new(StdPtr::null_mut())),
        }
    }

    /// Read-side slot lookup.
    fn get(&self, ty: &JaType, digit: u8) -> *mut u8 {
        let nr = self.nr_child.load(READ_ORD) as usize;
        debug_assert!(nr <= ty.max_linear_child as usize);
        for i in 0..nr {
            if self.digits[i].load(READ_ORD) == digit {
                return self.children[i].load(READ_ORD);
            }
        }
        StdPtr::null_mut()
    }

    /// Update-side insert; the node's shadow mutex is held.
    fn set(&self, ty: &JaType, digit: u8, child: *mut u8) -> Result<(), SetError> {
        debug_assert!(!child.is_null());
        let nr = self.nr_child.load(RELAXED) as usize;
        for i in 0..nr {
            if self.digits[i].load(RELAXED) == digit {
                if self.children[i].load(RELAXED).is_null() {
                    // Revive a removal hole in place.
                    self.children[i].store(child, WRITE_ORD);
                    return Ok(());
                }
                return Err(SetError::Exists);
            }
        }
        if nr >= ty.max_linear_child as usize {
            return Err(SetError::NoSpace);
        }
        // Publish pointer, then digit, then count: a reader accepting
        // the new count sees both.
        self.children[nr].store(child, WRITE_ORD);
        self.digits[nr].store(digit, WRITE_ORD);
        self.nr_child.store((nr + 1) as u8, WRITE_ORD);
        Ok(())
    }

    /// Swap the pointer of an existing digit (same logical child, new
    /// representation). The slot must be populated.
    fn replace(&self, digit: u8, child: *mut u8) {
        let nr = self.nr_child.load(RELAXED) as usize;
        for i in 0..nr {
            if self.digits[i].load(RELAXED) == digit {
                debug_assert!(!self.children[i].load(RELAXED).is_null());
                self.children[i].store(child, WRITE_ORD);
                return;
            }
        }
        debug_assert!(false, "replace of an absent digit");
    }

    /// Null the pointer of `digit`, leaving a hole. Returns false if
    /// the digit was absent or already a hole.
    fn clear(&self, digit: u8) -> bool {
        let nr = self.nr_child.load(RELAXED) as usize;
        for i in 0..nr {
            if self.digits[i].load(RELAXED) == digit {
                if self.children[i].load(RELAXED).is_null() {
                    return false;
                }
                self.children[i].store(StdPtr::null_mut(), WRITE_ORD);
                return true;
            }
        }
        false
    }

    /// Largest populated digit strictly below `bound` (exclusive), or
    /// any digit when `bound` is `None`.
    fn left_of(&self, bound: Option<u8>) -> Option<(u8, *mut u8)> {
        let nr = self.nr_child.load(READ_ORD) as usize;
        let mut best: Option<(u8, *mut u8)> = None;
        for i in 0..nr.min(MAX_LINEAR_CHILD) {
            let d = self.digits[i].load(READ_ORD);
            if let Some(b) = bound
                && d >= b
            {
                continue;
            }
            if best.is_some_and(|(bd, _)| bd >= d) {
                continue;
            }
            let ptr = self.children[i].load(READ_ORD);
            if !ptr.is_null() {
                best = Some((d, ptr));
            }
        }
        best
    }

    /// Smallest populated digit strictly above `bound` (exclusive), or
    /// any digit when `bound` is `None`.
    fn right_of(&self, bound: Option<u8>) -> Option<(u8, *mut u8)> {
        let nr = self.nr_child.load(READ_ORD) as usize;
        let mut best: Option<(u8, *mut u8)> = None;
        for i in 0..nr.min(MAX_LINEAR_CHILD) {
            let d = self.digits[i].load(READ_ORD);
            if let Some(b) = bound
                && d <= b
            {
                continue;
            }
            if best.is_some_and(|(bd, _)| bd <= d) {
                continue;
            }
            let ptr = self.children[i].load(READ_ORD);
            if !ptr.is_null() {
                best = Some((d, ptr));
            }
        }
        best
    }

    fn snapshot(&self, out: &mut Vec<(u8, *mut u8)>) {
        let nr = self.nr_child.load(RELAXED) as usize;
        for i in 0..nr.min(MAX_LINEAR_CHILD) {
            let ptr = self.children[i].load(RELAXED);
            if !ptr.is_null() {
                out.push((self.digits[i].load(RELAXED), ptr));
            }
        }
    }
}

impl PoolNode {
    fn new() -> Self {
        Self {
            pools: std::array::from_fn(|_| LinearNode::new()),
        }
    }

    /// The linear area responsible for `digit`.
    fn area(&self, ty: &JaType, digit: u8) -> &LinearNode {
        let idx = (digit >> (8 - ty.nr_pool_order)) as usize;
        &self.pools[idx]
    }

    fn nr_pools(ty: &JaType) -> usize {
        1 << ty.nr_pool_order
    }
}

impl PigeonNode {
    fn new() -> Self {
        Self {
            children: std::array::from_fn(|_| AtomicPtr::new(StdPtr::null_mut())),
        }
    }
}

// ============================================================================
//  Class-dispatched slot operations
// ============================================================================

/// Read the child word for `digit`. Null means absent.
///
/// # Safety
///
/// `word` must reference a live internal node (reader: inside a read
/// section; writer: under any shadow mutex or the walk protocol).
pub(crate) unsafe fn get_nth(word: TaggedRef, digit: u8) -> *mut u8 {
    let ty = &JA_TYPES[word.type_index()];
    // SAFETY: word references a live node of the tagged class.
    unsafe {
        match ty.class {
            NodeClass::Linear => (*word.ptr().cast::<LinearNode>()).get(ty, digit),
            NodeClass::Pool => (*word.ptr().cast::<PoolNode>()).area(ty, digit).get(ty, digit),
            NodeClass::Pigeon => (*word.ptr().cast::<PigeonNode>()).children[digit as usize]
                .load(READ_ORD),
        }
    }
}

/// Insert `(digit, child)`. The node's shadow mutex must be held.
///
/// # Safety
///
/// As [`get_nth`], plus exclusive update access to the node.
pub(crate) unsafe fn set_nth(word: TaggedRef, digit: u8, child: *mut u8) -> Result<(), SetError> {
    let ty = &JA_TYPES[word.type_index()];
    // SAFETY: per contract.
    unsafe {
        match ty.class {
            NodeClass::Linear => (*word.ptr().cast::<LinearNode>()).set(ty, digit, child),
            NodeClass::Pool => (*word.ptr().cast::<PoolNode>()).area(ty, digit).set(ty, digit, child),
            NodeClass::Pigeon => {
                let slot = &(*word.ptr().cast::<PigeonNode>()).children[digit as usize];
                if !slot.load(RELAXED).is_null() {
                    return Err(SetError::Exists);
                }
                slot.store(child, WRITE_ORD);
                Ok(())
            }
        }
    }
}

/// Replace the child word of a populated digit in place.
///
/// # Safety
///
/// As [`set_nth`]; the digit must be populated.
pub(crate) unsafe fn replace_nth(word: TaggedRef, digit: u8, child: *mut u8) {
    let ty = &JA_TYPES[word.type_index()];
    // SAFETY: per contract.
    unsafe {
        match ty.class {
            NodeClass::Linear => (*word.ptr().cast::<LinearNode>()).replace(digit, child),
            NodeClass::Pool => (*word.ptr().cast::<PoolNode>()).area(ty, digit).replace(digit, child),
            NodeClass::Pigeon => {
                let slot = &(*word.ptr().cast::<PigeonNode>()).children[digit as usize];
                debug_assert!(!slot.load(RELAXED).is_null());
                slot.store(child, WRITE_ORD);
            }
        }
    }
}

/// Null out the child of `digit` (linear areas keep the hole until the
/// next recompaction). Returns false if already absent.
///
/// # Safety
///
/// As [`set_nth`].
pub(crate) unsafe fn clear_nth(word: TaggedRef, digit: u8) -> bool {
    let ty = &JA_TYPES[word.type_index()];
    // SAFETY: per contract.
    unsafe {
        match ty.class {
            NodeClass::Linear => (*word.ptr().cast::<LinearNode>()).clear(digit),
            NodeClass::Pool => (*word.ptr().cast::<PoolNode>()).area(ty, digit).clear(digit),
            NodeClass::Pigeon => {
                let slot = &(*word.ptr().cast::<PigeonNode>()).children[digit as usize];
                if slot.load(RELAXED).is_null() {
                    return false;
                }
                slot.store(StdPtr::null_mut(), WRITE_ORD);
                true
            }
        }
    }
}

/// Largest populated digit strictly below `bound`, or the node maximum
/// when `bound` is `None`.
///
/// # Safety
///
/// As [`get_nth`].
pub(crate) unsafe fn left_of(word: TaggedRef, bound: Option<u8>) -> Option<(u8, *mut u8)> {
    let ty = &JA_TYPES[word.type_index()];
    // SAFETY: per contract.
    unsafe {
        match ty.class {
            NodeClass::Linear => (*word.ptr().cast::<LinearNode>()).left_of(bound),
            NodeClass::Pool => {
                let pool = &*word.ptr().cast::<PoolNode>();
                let top = match bound {
                    Some(b) => (b >> (8 - ty.nr_pool_order)) as usize,
                    None => PoolNode::nr_pools(ty) - 1,
                };
                for idx in (0..=top).rev() {
                    // Only the sub-pool holding `bound` needs the bound;
                    // lower sub-pools hold strictly smaller digits.
                    let area_bound = if Some(idx) == bound.map(|b| (b >> (8 - ty.nr_pool_order)) as usize)
                    {
                        bound
                    } else {
                        None
                    };
                    if let Some(found) = pool.pools[idx].left_of(area_bound) {
                        return Some(found);
                    }
                }
                None
            }
            NodeClass::Pigeon => {
                let pigeon = &*word.ptr().cast::<PigeonNode>();
                let start = bound.map_or(ENTRY_PER_NODE, usize::from);
                for d in (0..start).rev() {
                    let ptr = pigeon.children[d].load(READ_ORD);
                    if !ptr.is_null() {
                        return Some((d as u8, ptr));
                    }
                }
                None
            }
        }
    }
}

/// Smallest populated digit strictly above `bound`, or the node minimum
/// when `bound` is `None`.
///
/// # Safety
///
/// As [`get_nth`].
pub(crate) unsafe fn right_of(word: TaggedRef, bound: Option<u8>) -> Option<(u8, *mut u8)> {
    let ty = &JA_TYPES[word.type_index()];
    // SAFETY: per contract.
    unsafe {
        match ty.class {
            NodeClass::Linear => (*word.ptr().cast::<LinearNode>()).right_of(bound),
            NodeClass::Pool => {
                let pool = &*word.ptr().cast::<PoolNode>();
                let bottom = match bound {
                    Some(b) => (b >> (8 - ty.nr_pool_order)) as usize,
                    None => 0,
                };
                for idx in bottom..PoolNode::nr_pools(ty) {
                    let area_bound = if Some(idx) == bound.map(|b| (b >> (8 - ty.nr_pool_order)) as usize)
                    {
                        bound
                    } else {
                        None
                    };
                    if let Some(found) = pool.pools[idx].right_of(area_bound) {
                        return Some(found);
                    }
                }
                None
            }
            NodeClass::Pigeon => {
                let pigeon = &*word.ptr().cast::<PigeonNode>();
                let start = bound.map_or(0, |b| b as usize + 1);
                for d in start..ENTRY_PER_NODE {
                    let ptr = pigeon.children[d].load(READ_ORD);
                    if !ptr.is_null() {
                        return Some((d as u8, ptr));
                    }
                }
                None
            }
        }
    }
}

/// Collect every populated `(digit, child)` pair. Update side only.
///
/// # Safety
///
/// As [`set_nth`].
pub(crate) unsafe fn children_of(word: TaggedRef) -> Vec<(u8, *mut u8)> {
    let ty = &JA_TYPES[word.type_index()];
    let mut out = Vec::with_capacity(ty.max_child as usize);
    // SAFETY: per contract.
    unsafe {
        match ty.class {
            NodeClass::Linear => (*word.ptr().cast::<LinearNode>()).snapshot(&mut out),
            NodeClass::Pool => {
                let pool = &*word.ptr().cast::<PoolNode>();
                for idx in 0..PoolNode::nr_pools(ty) {
                    pool.pools[idx].snapshot(&mut out);
                }
            }
            NodeClass::Pigeon => {
                let pigeon = &*word.ptr().cast::<PigeonNode>();
                for d in 0..ENTRY_PER_NODE {
                    let ptr = pigeon.children[d].load(RELAXED);
                    if !ptr.is_null() {
                        out.push((d as u8, ptr));
                    }
                }
            }
        }
    }
    out
}

// ============================================================================
//  Allocation
// ============================================================================

/// Allocate a zeroed node of the given class.
pub(crate) fn alloc_node(type_index: usize) -> TaggedRef {
    let ptr: *mut u8 = match JA_TYPES[type_index].class {
        NodeClass::Linear => Box::into_raw(Box::new(LinearNode::new())).cast(),
        NodeClass::Pool => Box::into_raw(Box::new(PoolNode::new())).cast(),
        NodeClass::Pigeon => Box::into_raw(Box::new(PigeonNode::new())).cast(),
    };
    TaggedRef::new(ptr, type_index)
}

/// Free node storage immediately (never-published nodes and teardown).
///
/// # Safety
///
/// `word` must come from [`alloc_node`], be unreachable, and have no
/// readers.
pub(crate) unsafe fn free_node(word: TaggedRef) {
    // SAFETY: per contract; the tag identifies the allocated type.
    unsafe {
        match JA_TYPES[word.type_index()].class {
            NodeClass::Linear => drop(Box::from_raw(word.ptr().cast::<LinearNode>())),
            NodeClass::Pool => drop(Box::from_raw(word.ptr().cast::<PoolNode>())),
            NodeClass::Pigeon => drop(Box::from_raw(word.ptr().cast::<PigeonNode>())),
        }
    }
}

/// Defer node storage to the reclamation domain.
///
/// # Safety
///
/// `word` must come from [`alloc_node`] and be unreachable from the
/// published trie.
pub(crate) unsafe fn defer_free_node(guard: &ReadGuard<'_>, word: TaggedRef) {
    // SAFETY: per contract.
    unsafe {
        match JA_TYPES[word.type_index()].class {
            NodeClass::Linear => {
                guard.defer_reclaim(word.ptr().cast::<LinearNode>(), reclaim_boxed::<LinearNode>);
            }
            NodeClass::Pool => {
                guard.defer_reclaim(word.ptr().cast::<PoolNode>(), reclaim_boxed::<PoolNode>);
            }
            NodeClass::Pigeon => {
                guard.defer_reclaim(word.ptr().cast::<PigeonNode>(), reclaim_boxed::<PigeonNode>);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dangling(addr: usize) -> *mut u8 {
        // Aligned non-null markers for slot round-trips.
        std::ptr::without_provenance_mut(addr << 3)
    }

    #[test]
    fn linear_set_get_clear_round_trip() {
        let word = alloc_node(4);
        // SAFETY: freshly allocated, exclusively owned.
        unsafe {
            for d in 0..28u8 {
                set_nth(word, d, dangling(d as usize + 1)).ok().unwrap();
            }
            assert!(matches!(set_nth(word, 5, dangling(99)), Err(SetError::Exists)));
            assert!(matches!(set_nth(word, 200, dangling(99)), Err(SetError::NoSpace)));

            for d in 0..28u8 {
                assert_eq!(get_nth(word, d), dangling(d as usize + 1));
            }
            assert!(get_nth(word, 200).is_null());

            assert!(clear_nth(word, 7));
            assert!(!clear_nth(word, 7));
            assert!(get_nth(word, 7).is_null());

            // Holes revive in place without consuming a fresh slot.
            set_nth(word, 7, dangling(77)).ok().unwrap();
            assert_eq!(get_nth(word, 7), dangling(77));

            free_node(word);
        }
    }

    #[test]
    fn pool_routes_digits_by_top_bits() {
        let word = alloc_node(5);
        // SAFETY: freshly allocated, exclusively owned.
        unsafe {
            set_nth(word, 10, dangling(1)).ok().unwrap();
            set_nth(word, 200, dangling(2)).ok().unwrap();
            assert_eq!(get_nth(word, 10), dangling(1));
            assert_eq!(get_nth(word, 200), dangling(2));
            assert!(get_nth(word, 11).is_null());
            free_node(word);
        }
    }

    #[test]
    fn pigeon_is_direct_indexed() {
        let word = alloc_node(7);
        // SAFETY: freshly allocated, exclusively owned.
        unsafe {
            for d in [0u8, 100, 255] {
                set_nth(word, d, dangling(d as usize + 1)).ok().unwrap();
                assert_eq!(get_nth(word, d), dangling(d as usize + 1));
            }
            assert!(matches!(set_nth(word, 100, dangling(9)), Err(SetError::Exists)));
            free_node(word);
        }
    }

    #[test]
    fn neighbour_scans_skip_holes() {
        let word = alloc_node(4);
        // SAFETY: freshly allocated, exclusively owned.
        unsafe {
            for d in [3u8, 9, 17, 40] {
                set_nth(word, d, dangling(d as usize)).ok().unwrap();
            }
            clear_nth(word, 17);

            assert_eq!(left_of(word, Some(40)).map(|(d, _)| d), Some(9));
            assert_eq!(right_of(word, Some(9)).map(|(d, _)| d), Some(40));
            assert_eq!(left_of(word, None).map(|(d, _)| d), Some(40));
            assert_eq!(right_of(word, None).map(|(d, _)| d), Some(3));
            assert_eq!(left_of(word, Some(3)), None);

            let mut digits: Vec<u8> = children_of(word).into_iter().map(|(d, _)| d).collect();
            digits.sort_unstable();
            assert_eq!(digits, vec![3, 9, 40]);

            free_node(word);
        }
    }
}
