//! Structural invariant checker, for tests and debugging.
//!
//! Run with all writers quiesced (the checker itself takes the writer
//! handle, so concurrent writers are excluded by construction; readers
//! are harmless).

use std::cmp::Ordering as CmpOrdering;

use crate::ordering::RELAXED;

use super::node::{COLOR_BLACK, COLOR_RED, RbNode};
use super::{EndpointCmp, NodeAlloc, RbWriter};

impl<K, C, A> RbWriter<'_, K, C, A>
where
    K: Clone + Default + Send + Sync,
    C: EndpointCmp<K>,
    A: NodeAlloc<K>,
{
    /// Check every steady-state invariant, panicking on violation:
    ///
    /// - root is black; red nodes have black children;
    /// - every root-to-nil path has the same black height;
    /// - `max_end(x) = max(end(x), max_end(left), max_end(right))`;
    /// - children point back at their parent with the correct position
    ///   bit;
    /// - no node has a pending decay chain;
    /// - `begin` keys are in BST order.
    ///
    /// Returns the number of nodes.
    pub fn validate(&self) -> usize {
        let nil = self.nil();
        let root = self.tree.root.load(RELAXED);
        if root == nil {
            return 0;
        }
        // SAFETY: writer mutex held; the tree is quiescent for updates.
        unsafe {
            assert_eq!(
                (*root).color.load(RELAXED),
                COLOR_BLACK,
                "root must be black"
            );
            let mut count = 0;
            self.validate_subtree(root, nil, &mut count);
            count
        }
    }

    /// Returns the black height of the subtree at `x`.
    unsafe fn validate_subtree(
        &self,
        x: *mut RbNode<K>,
        parent: *mut RbNode<K>,
        count: &mut usize,
    ) -> usize {
        let nil = self.nil();
        if x == nil {
            return 1;
        }
        *count += 1;
        // SAFETY: x is a reachable node and no writer is running.
        unsafe {
            let node = &*x;

            assert!(
                node.decay_next.load(RELAXED).is_null(),
                "decay chain pending in steady state"
            );
            if parent != nil {
                assert_eq!(node.parent(), parent, "parent pointer mismatch");
                let expected_right = x == (*parent).right.load(RELAXED);
                assert_eq!(
                    node.is_right_child(),
                    expected_right,
                    "position bit mismatch"
                );
            }

            let left = node.left.load(RELAXED);
            let right = node.right.load(RELAXED);
            let color = node.color.load(RELAXED);

            if color == COLOR_RED {
                for child in [left, right] {
                    if child != nil {
                        assert_eq!(
                            (*child).color.load(RELAXED),
                            COLOR_BLACK,
                            "red node with red child"
                        );
                    }
                }
            }

            // BST order on begin (ties to the right on insert, so left
            // is strictly less and right is greater-or-equal).
            if left != nil {
                assert_ne!(
                    self.tree.cmp.cmp_endpoints(&(*left).begin, &node.begin),
                    CmpOrdering::Greater,
                    "left child begin out of order"
                );
            }
            if right != nil {
                assert_ne!(
                    self.tree.cmp.cmp_endpoints(&(*right).begin, &node.begin),
                    CmpOrdering::Less,
                    "right child begin out of order"
                );
            }

            // Interval augmentation law.
            let mut expect = node.end.clone();
            for child in [left, right] {
                if child != nil
                    && self.tree.cmp.cmp_endpoints(&(*child).max_end, &expect)
                        == CmpOrdering::Greater
                {
                    expect = (*child).max_end.clone();
                }
            }
            assert_eq!(
                self.tree.cmp.cmp_endpoints(&node.max_end, &expect),
                CmpOrdering::Equal,
                "max_end augmentation broken"
            );

            let lh = self.validate_subtree(left, x, count);
            let rh = self.validate_subtree(right, x, count);
            assert_eq!(lh, rh, "black height mismatch");

            lh + usize::from(color == COLOR_BLACK)
        }
    }
}
