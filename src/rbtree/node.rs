//! Node representation for the interval red-black tree.
//!
//! Nodes are immutable after publication except for `color` (recoloured
//! in place by fixups, consulted only by the update side) and the packed
//! parent word (reparented late, consulted only by the update side and
//! the mutex-protected next/prev walks). Interval endpoints and `max_end`
//! are plain fields: they are written on unpublished copies only and
//! never change once a node is reachable.

use std::ptr as StdPtr;
use std::sync::atomic::{AtomicPtr, AtomicU8};

use crate::ordering::{READ_ORD, RELAXED, WRITE_ORD};
use crate::tagged::{is_pos_right, with_pos_right, without_pos};

pub(crate) const COLOR_RED: u8 = 0;
pub(crate) const COLOR_BLACK: u8 = 1;

// ============================================================================
//  RbNode
// ============================================================================

/// One interval `[begin, end)` in the tree.
///
/// `max_end` is the interval-search augmentation: the maximum `end` over
/// this node and its whole subtree. A distinguished per-tree nil node
/// (always black) stands in for absent children; its endpoint fields hold
/// `K::default()` and are never consulted.
#[repr(C)]
pub struct RbNode<K> {
    pub(crate) begin: K,
    pub(crate) end: K,
    pub(crate) max_end: K,

    /// [`COLOR_RED`] or [`COLOR_BLACK`]. Update side only.
    pub(crate) color: AtomicU8,

    /// Parent pointer with the position bit packed into bit 0
    /// (set = this node is its parent's right child; arbitrary for the
    /// root). Update side and next/prev walks only.
    pub(crate) parent_and_pos: AtomicPtr<RbNode<K>>,

    pub(crate) left: AtomicPtr<RbNode<K>>,
    pub(crate) right: AtomicPtr<RbNode<K>>,

    /// Forwarding pointer to the newest copy of this node, set when a
    /// copy-on-update supersedes it. Null in steady state. Writers
    /// holding a stale pointer follow the chain to its tail; readers
    /// never look at it because published entry points always reach the
    /// newest copies.
    pub(crate) decay_next: AtomicPtr<RbNode<K>>,

    /// True only for the per-tree nil sentinel.
    pub(crate) nil: bool,
}

impl<K: Clone + Default> RbNode<K> {
    /// A fresh red node for `[begin, end)`, not yet linked anywhere.
    pub(crate) fn new(begin: K, end: K) -> Self {
        let max_end = end.clone();
        Self {
            begin,
            end,
            max_end,
            color: AtomicU8::new(COLOR_RED),
            parent_and_pos: AtomicPtr::new(StdPtr::null_mut()),
            left: AtomicPtr::new(StdPtr::null_mut()),
            right: AtomicPtr::new(StdPtr::null_mut()),
            decay_next: AtomicPtr::new(StdPtr::null_mut()),
            nil: false,
        }
    }

    /// The nil sentinel: black, endpoints defaulted and never read.
    pub(crate) fn new_nil() -> Self {
        Self {
            begin: K::default(),
            end: K::default(),
            max_end: K::default(),
            color: AtomicU8::new(COLOR_BLACK),
            parent_and_pos: AtomicPtr::new(StdPtr::null_mut()),
            left: AtomicPtr::new(StdPtr::null_mut()),
            right: AtomicPtr::new(StdPtr::null_mut()),
            decay_next: AtomicPtr::new(StdPtr::null_mut()),
            nil: true,
        }
    }

    /// An unpublished copy of `src`: same interval, colour, links; fresh
    /// decay chain.
    pub(crate) fn copy_of(src: &Self) -> Self {
        Self {
            begin: src.begin.clone(),
            end: src.end.clone(),
            max_end: src.max_end.clone(),
            color: AtomicU8::new(src.color.load(RELAXED)),
            parent_and_pos: AtomicPtr::new(src.parent_and_pos.load(RELAXED)),
            left: AtomicPtr::new(src.left.load(RELAXED)),
            right: AtomicPtr::new(src.right.load(RELAXED)),
            decay_next: AtomicPtr::new(StdPtr::null_mut()),
            nil: false,
        }
    }
}

impl<K> RbNode<K> {
    /// Inclusive start of the interval.
    #[inline]
    #[must_use]
    pub fn begin(&self) -> &K {
        debug_assert!(!self.nil);
        &self.begin
    }

    /// Exclusive end of the interval.
    #[inline]
    #[must_use]
    pub fn end(&self) -> &K {
        debug_assert!(!self.nil);
        &self.end
    }

    /// Maximum `end` over this node's subtree.
    #[inline]
    #[must_use]
    pub fn max_end(&self) -> &K {
        debug_assert!(!self.nil);
        &self.max_end
    }

    #[inline]
    pub(crate) fn parent(&self) -> *mut RbNode<K> {
        without_pos(self.parent_and_pos.load(READ_ORD))
    }

    /// Whether this node sits in its parent's right slot. Arbitrary for
    /// the root.
    #[inline]
    pub(crate) fn is_right_child(&self) -> bool {
        is_pos_right(self.parent_and_pos.load(READ_ORD))
    }

    /// Publish a new parent + position. Only the update side stores
    /// here; next/prev walks (under the tree mutex) read it.
    #[inline]
    pub(crate) fn set_parent(&self, parent: *mut RbNode<K>, right: bool) {
        let packed = if right { with_pos_right(parent) } else { parent };
        self.parent_and_pos.store(packed, WRITE_ORD);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_node_is_red_and_unlinked() {
        let node: RbNode<u64> = RbNode::new(3, 9);
        assert_eq!(node.color.load(RELAXED), COLOR_RED);
        assert!(node.left.load(RELAXED).is_null());
        assert!(node.decay_next.load(RELAXED).is_null());
        assert_eq!(*node.begin(), 3);
        assert_eq!(*node.end(), 9);
        assert_eq!(*node.max_end(), 9);
    }

    #[test]
    fn parent_pos_round_trip() {
        let node: RbNode<u64> = RbNode::new(0, 1);
        let parent: RbNode<u64> = RbNode::new(2, 4);
        let parent_ptr = &parent as *const RbNode<u64> as *mut RbNode<u64>;

        node.set_parent(parent_ptr, true);
        assert_eq!(node.parent(), parent_ptr);
        assert!(node.is_right_child());

        node.set_parent(parent_ptr, false);
        assert_eq!(node.parent(), parent_ptr);
        assert!(!node.is_right_child());
    }

    #[test]
    fn copy_preserves_interval_and_colour() {
        let node: RbNode<u64> = RbNode::new(5, 11);
        node.color.store(COLOR_BLACK, RELAXED);
        let copy = RbNode::copy_of(&node);
        assert_eq!(copy.color.load(RELAXED), COLOR_BLACK);
        assert_eq!(*copy.begin(), 5);
        assert_eq!(*copy.max_end(), 11);
        assert!(copy.decay_next.load(RELAXED).is_null());
        assert!(!copy.nil);
    }
}
