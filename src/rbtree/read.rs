//! Read-side operations.
//!
//! Every pointer chase here is an Acquire load pairing with the writer's
//! Release publication, so a reader always sees fully wired clusters.
//! All entry points require a live [`ReadGuard`]; the guard's lifetime
//! bounds the returned references.

use std::cmp::Ordering as CmpOrdering;

use crate::ordering::READ_ORD;
use crate::reclaim::ReadGuard;

use super::node::RbNode;
use super::{EndpointCmp, IntervalTree, NodeAlloc};

impl<K, C, A> IntervalTree<K, C, A>
where
    K: Clone + Default + Send + Sync,
    C: EndpointCmp<K>,
    A: NodeAlloc<K>,
{
    /// Find a node whose interval `[begin, end)` contains `point`.
    ///
    /// Descends with `max_end` pruning: if the left subtree's maximum
    /// end exceeds `point`, the match (if any) is on the left; otherwise
    /// the current node or the right subtree decides.
    #[must_use]
    pub fn search<'g>(&self, point: &K, _guard: &'g ReadGuard<'_>) -> Option<&'g RbNode<K>> {
        let nil = self.nil;
        let mut x = self.root.load(READ_ORD);

        while x != nil {
            // SAFETY: x was loaded from a published slot inside the
            // caller's read section; deferred reclamation keeps it valid.
            let node = unsafe { &*x };
            let left = node.left.load(READ_ORD);

            if left != nil {
                // SAFETY: as above.
                let left_max = unsafe { &(*left).max_end };
                if self.cmp.cmp_endpoints(left_max, point) == CmpOrdering::Greater {
                    x = left;
                    continue;
                }
            }
            if self.cmp.cmp_endpoints(&node.begin, point) != CmpOrdering::Greater
                && self.cmp.cmp_endpoints(point, &node.end) == CmpOrdering::Less
            {
                return Some(node);
            }
            if self.cmp.cmp_endpoints(point, &node.begin) == CmpOrdering::Greater {
                x = node.right.load(READ_ORD);
                continue;
            }
            return None;
        }
        None
    }

    /// Find a node whose interval covers all of `[begin, end)`.
    ///
    /// Searches by `begin` and filters out a hit that ends before `end`.
    /// Only useful when the tree holds no partially overlapping ranges;
    /// fully nested ranges are fine.
    #[must_use]
    pub fn search_range<'g>(
        &self,
        begin: &K,
        end: &K,
        guard: &'g ReadGuard<'_>,
    ) -> Option<&'g RbNode<K>> {
        let node = self.search(begin, guard)?;
        if self.cmp.cmp_endpoints(&node.end, end) == CmpOrdering::Less {
            None
        } else {
            Some(node)
        }
    }

    /// Classical BST lookup on `begin` alone.
    #[must_use]
    pub fn search_begin<'g>(&self, begin: &K, _guard: &'g ReadGuard<'_>) -> Option<&'g RbNode<K>> {
        let nil = self.nil;
        let mut x = self.root.load(READ_ORD);

        while x != nil {
            // SAFETY: published node inside the caller's read section.
            let node = unsafe { &*x };
            match self.cmp.cmp_endpoints(begin, &node.begin) {
                CmpOrdering::Less => x = node.left.load(READ_ORD),
                CmpOrdering::Greater => x = node.right.load(READ_ORD),
                CmpOrdering::Equal => return Some(node),
            }
        }
        None
    }

    /// The interval with the smallest `begin`, if any.
    #[must_use]
    pub fn first<'g>(&self, _guard: &'g ReadGuard<'_>) -> Option<&'g RbNode<K>> {
        let x = self.root.load(READ_ORD);
        if x == self.nil {
            return None;
        }
        // SAFETY: published node inside the caller's read section.
        Some(unsafe { &*self.subtree_min(x) })
    }

    /// The interval with the largest `begin`, if any.
    #[must_use]
    pub fn last<'g>(&self, _guard: &'g ReadGuard<'_>) -> Option<&'g RbNode<K>> {
        let nil = self.nil;
        let mut x = self.root.load(READ_ORD);
        if x == nil {
            return None;
        }
        loop {
            // SAFETY: published node inside the caller's read section.
            let right = unsafe { (*x).right.load(READ_ORD) };
            if right == nil {
                // SAFETY: as above.
                return Some(unsafe { &*x });
            }
            x = right;
        }
    }

    /// Leftmost node of the subtree rooted at `x` (`x` must not be nil).
    pub(crate) fn subtree_min(&self, mut x: *mut RbNode<K>) -> *mut RbNode<K> {
        let nil = self.nil;
        debug_assert!(x != nil);
        loop {
            // SAFETY: caller hands in a reachable non-nil node.
            let left = unsafe { (*x).left.load(READ_ORD) };
            if left == nil {
                return x;
            }
            x = left;
        }
    }

    /// Rightmost node of the subtree rooted at `x` (`x` must not be nil).
    pub(crate) fn subtree_max(&self, mut x: *mut RbNode<K>) -> *mut RbNode<K> {
        let nil = self.nil;
        debug_assert!(x != nil);
        loop {
            // SAFETY: caller hands in a reachable non-nil node.
            let right = unsafe { (*x).right.load(READ_ORD) };
            if right == nil {
                return x;
            }
            x = right;
        }
    }
}
