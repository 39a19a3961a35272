//! Update-side operations: copy-on-update insert and remove.
//!
//! Nothing reachable is rewired in place. A rotation or transplant
//! builds copies of the affected cluster, then:
//!
//! 1. wires the copies to the post-operation topology and recomputes
//!    their `max_end`,
//! 2. issues a Release fence,
//! 3. chains the superseded nodes to their copies via `decay_next`,
//! 4. publishes the cluster with a single store to the parent slot,
//! 5. reparents the unchanged children hanging off the cluster (parent
//!    pointers are consulted only update-side, so this may be late),
//! 6. defers the superseded nodes to the reclamation domain.
//!
//! After any rotation a writer's local pointers may be stale; `live`
//! follows `decay_next` chains to the newest copy before every re-use.

use std::cmp::Ordering as CmpOrdering;

use crate::error::RbError;
use crate::ordering::{RELAXED, WRITE_ORD, release_fence};
use crate::reclaim::ReadGuard;
use crate::tracing_helpers::trace_log;

use super::node::{COLOR_BLACK, COLOR_RED, RbNode};
use super::{EndpointCmp, NodeAlloc, RbWriter, reclaim_node};

impl<K, C, A> RbWriter<'_, K, C, A>
where
    K: Clone + Default + Send + Sync,
    C: EndpointCmp<K>,
    A: NodeAlloc<K>,
{
    // ========================================================================
    //  Public API
    // ========================================================================

    /// Insert the interval `[begin, end)`.
    ///
    /// Duplicate and overlapping intervals are permitted; ordering is by
    /// `begin` with ties to the right.
    pub fn insert(&mut self, begin: K, end: K) -> Result<(), RbError> {
        let guard = self.tree.domain.enter();
        let nil = self.nil();

        let z = self.tree.alloc.alloc_node(RbNode::new(begin, end));
        if z.is_null() {
            return Err(RbError::OutOfMemory);
        }

        // SAFETY: the writer mutex is held; z is fresh and unpublished
        // until the child-slot store below.
        unsafe {
            let mut y = nil;
            let mut x = self.tree.root.load(RELAXED);
            let mut go_left = false;
            while x != nil {
                y = x;
                go_left = self.less(&(*z).begin, &(*x).begin);
                x = if go_left {
                    (*x).left.load(RELAXED)
                } else {
                    (*x).right.load(RELAXED)
                };
            }

            (*z).left.store(nil, RELAXED);
            (*z).right.store(nil, RELAXED);
            (*z).set_parent(y, !go_left && y != nil);

            // Order the initialization of z before the store that makes
            // it visible to the rest of the tree.
            release_fence();

            if y == nil {
                self.tree.root.store(z, WRITE_ORD);
            } else if go_left {
                (*y).left.store(z, WRITE_ORD);
            } else {
                (*y).right.store(z, WRITE_ORD);
            }

            trace_log!(?y, "rbtree insert: linked, propagating max_end");
            self.propagate_max_end(y, &guard);
            self.insert_fixup(z, &guard);
        }
        Ok(())
    }

    /// Unlink `node` and hand it to deferred reclamation.
    ///
    /// `node` must be the current version, freshly obtained from a
    /// search under this writer; a stale pointer from before an earlier
    /// update on this handle is re-resolved through its decay chain.
    pub fn remove(&mut self, node: &RbNode<K>) {
        let guard = self.tree.domain.enter();
        let nil = self.nil();

        // SAFETY: the writer mutex is held; all nodes reached below are
        // live versions owned by this tree.
        unsafe {
            let z = self.live(node as *const RbNode<K> as *mut RbNode<K>);
            let zl = (*z).left.load(RELAXED);
            let zr = (*z).right.load(RELAXED);
            let zp = (*z).parent();

            let mut fixup_color = self.color(z);
            let x;
            let prop_start;

            if zl == nil {
                x = self.transplant(z, zr, &guard);
                prop_start = zp;
            } else if zr == nil {
                x = self.transplant(z, zl, &guard);
                prop_start = zp;
            } else {
                let y = self.writer_subtree_min(zr);
                fixup_color = self.color(y);
                let (fixup_x, start) = self.remove_nonil(z, y, &guard);
                x = fixup_x;
                prop_start = start;
            }

            self.defer(z, &guard);
            self.propagate_max_end(prop_start, &guard);
            if fixup_color == COLOR_BLACK {
                self.remove_fixup(x, &guard);
            }
        }
    }

    /// In-order successor of `x`.
    ///
    /// Walks parent pointers when `x` has no right subtree, stopping at
    /// the first ancestor approached from the left. Requires this writer
    /// handle because only the writer mutex keeps parent pointers
    /// coherent.
    #[must_use]
    pub fn next<'w>(&'w self, x: &RbNode<K>) -> Option<&'w RbNode<K>> {
        let nil = self.nil();
        // SAFETY: writer mutex held; decay chains and parent pointers
        // are coherent.
        unsafe {
            let mut x = self.live(x as *const RbNode<K> as *mut RbNode<K>);
            let right = (*x).right.load(RELAXED);
            if right != nil {
                return Some(&*self.tree.subtree_min(right));
            }
            let mut y = (*x).parent();
            while y != nil && (*x).is_right_child() {
                x = y;
                y = (*x).parent();
            }
            if y == nil { None } else { Some(&*y) }
        }
    }

    /// In-order predecessor of `x`. See [`RbWriter::next`].
    #[must_use]
    pub fn prev<'w>(&'w self, x: &RbNode<K>) -> Option<&'w RbNode<K>> {
        let nil = self.nil();
        // SAFETY: writer mutex held.
        unsafe {
            let mut x = self.live(x as *const RbNode<K> as *mut RbNode<K>);
            let left = (*x).left.load(RELAXED);
            if left != nil {
                return Some(&*self.tree.subtree_max(left));
            }
            let mut y = (*x).parent();
            while y != nil && !(*x).is_right_child() {
                x = y;
                y = (*x).parent();
            }
            if y == nil { None } else { Some(&*y) }
        }
    }

    // ========================================================================
    //  Shared helpers
    // ========================================================================

    #[inline(always)]
    pub(crate) fn nil(&self) -> *mut RbNode<K> {
        self.tree.nil
    }

    #[inline(always)]
    fn less(&self, a: &K, b: &K) -> bool {
        self.tree.cmp.cmp_endpoints(a, b) == CmpOrdering::Less
    }

    /// Follow the decay chain to the newest copy of `x`.
    pub(crate) unsafe fn live(&self, mut x: *mut RbNode<K>) -> *mut RbNode<K> {
        loop {
            // SAFETY: deferred reclamation keeps superseded copies valid
            // while this writer (which defers them) is still running.
            let next = unsafe { (*x).decay_next.load(RELAXED) };
            if next.is_null() {
                return x;
            }
            x = next;
        }
    }

    #[inline]
    unsafe fn color(&self, x: *mut RbNode<K>) -> u8 {
        // SAFETY: caller hands in a valid node.
        unsafe { (*x).color.load(RELAXED) }
    }

    #[inline]
    unsafe fn set_color(&self, x: *mut RbNode<K>, color: u8) {
        // SAFETY: caller hands in a valid node; writer mutex held.
        unsafe {
            debug_assert!(!(*x).nil || color == COLOR_BLACK);
            (*x).color.store(color, RELAXED);
        }
    }

    unsafe fn defer(&self, ptr: *mut RbNode<K>, guard: &ReadGuard<'_>) {
        // SAFETY: ptr was just unlinked from the published structure.
        unsafe { guard.defer_reclaim(ptr, reclaim_node::<K, A>) };
    }

    /// Allocate an unpublished copy of `x`.
    unsafe fn alloc_copy(&self, x: *mut RbNode<K>) -> *mut RbNode<K> {
        // SAFETY: x is a valid node.
        let copy = RbNode::copy_of(unsafe { &*x });
        let ptr = self.tree.alloc.alloc_node(copy);
        assert!(!ptr.is_null(), "allocator failed during cluster copy");
        ptr
    }

    /// Store `new` into the slot that `old_parent`/`old_is_right`
    /// describe, or into the root slot.
    unsafe fn publish_at(&self, old_parent: *mut RbNode<K>, old_is_right: bool, new: *mut RbNode<K>) {
        if old_parent == self.nil() {
            self.tree.root.store(new, WRITE_ORD);
        } else if old_is_right {
            // SAFETY: old_parent is a live node.
            unsafe { (*old_parent).right.store(new, WRITE_ORD) };
        } else {
            // SAFETY: as above.
            unsafe { (*old_parent).left.store(new, WRITE_ORD) };
        }
    }

    /// `max(end, max_end(left), max_end(right))` over current child slots.
    unsafe fn subtree_max_end(&self, x: *mut RbNode<K>) -> K {
        let nil = self.nil();
        // SAFETY: x is a valid non-nil node.
        unsafe {
            let mut m = (*x).end.clone();
            for child in [(*x).left.load(RELAXED), (*x).right.load(RELAXED)] {
                if child != nil
                    && self.tree.cmp.cmp_endpoints(&(*child).max_end, &m) == CmpOrdering::Greater
                {
                    m = (*child).max_end.clone();
                }
            }
            m
        }
    }

    /// Recompute `max_end` on an unpublished copy from its child slots.
    unsafe fn refresh_max_end(&self, x: *mut RbNode<K>) {
        // SAFETY: x is unpublished, exclusively ours; the plain field
        // write cannot race.
        unsafe {
            let m = self.subtree_max_end(x);
            (*x).max_end = m;
        }
    }

    /// Leftmost node under `x`, update-side.
    unsafe fn writer_subtree_min(&self, mut x: *mut RbNode<K>) -> *mut RbNode<K> {
        let nil = self.nil();
        debug_assert!(x != nil);
        loop {
            // SAFETY: x is a valid node.
            let left = unsafe { (*x).left.load(RELAXED) };
            if left == nil {
                return x;
            }
            x = left;
        }
    }

    // ========================================================================
    //  Rotations
    // ========================================================================

    /// Left-rotate around `x`, replacing the cluster `{x, x.right}` with
    /// copies. Returns the copy of `x` (now the left child of the copy
    /// of `x.right`).
    unsafe fn left_rotate(&mut self, x: *mut RbNode<K>, guard: &ReadGuard<'_>) -> *mut RbNode<K> {
        let nil = self.nil();
        // SAFETY: writer mutex held; x and y are live nodes.
        unsafe {
            let x = self.live(x);
            debug_assert!(x != nil);
            let y = (*x).right.load(RELAXED);
            debug_assert!(y != nil);

            let xp = (*x).parent();
            let x_right = (*x).is_right_child();

            let xc = self.alloc_copy(x);
            let yc = self.alloc_copy(y);

            // Wire the copies to the post-rotation topology.
            (*xc).right.store((*y).left.load(RELAXED), RELAXED);
            (*xc).set_parent(yc, false);
            (*yc).left.store(xc, RELAXED);
            (*yc).set_parent(xp, x_right);

            self.refresh_max_end(xc);
            self.refresh_max_end(yc);

            // Order stores to the copies before the stores that make
            // them visible to the rest of the tree.
            release_fence();

            (*x).decay_next.store(xc, WRITE_ORD);
            (*y).decay_next.store(yc, WRITE_ORD);

            release_fence();

            self.publish_at(xp, x_right, yc);

            // Reparent the unchanged children to the copies.
            let xl = (*xc).left.load(RELAXED);
            if xl != nil {
                (*xl).set_parent(xc, false);
            }
            let xr = (*xc).right.load(RELAXED);
            if xr != nil {
                (*xr).set_parent(xc, true);
            }
            let yr = (*yc).right.load(RELAXED);
            if yr != nil {
                (*yr).set_parent(yc, true);
            }
            // yc.left is xc; its parent is already set in the copy.

            self.defer(x, guard);
            self.defer(y, guard);
            xc
        }
    }

    /// Mirror of [`Self::left_rotate`]: rotate around `x` and its left
    /// child. Returns the copy of `x`.
    unsafe fn right_rotate(&mut self, x: *mut RbNode<K>, guard: &ReadGuard<'_>) -> *mut RbNode<K> {
        let nil = self.nil();
        // SAFETY: writer mutex held; x and y are live nodes.
        unsafe {
            let x = self.live(x);
            debug_assert!(x != nil);
            let y = (*x).left.load(RELAXED);
            debug_assert!(y != nil);

            let xp = (*x).parent();
            let x_right = (*x).is_right_child();

            let xc = self.alloc_copy(x);
            let yc = self.alloc_copy(y);

            (*xc).left.store((*y).right.load(RELAXED), RELAXED);
            (*xc).set_parent(yc, true);
            (*yc).right.store(xc, RELAXED);
            (*yc).set_parent(xp, x_right);

            self.refresh_max_end(xc);
            self.refresh_max_end(yc);

            release_fence();

            (*x).decay_next.store(xc, WRITE_ORD);
            (*y).decay_next.store(yc, WRITE_ORD);

            release_fence();

            self.publish_at(xp, x_right, yc);

            let xl = (*xc).left.load(RELAXED);
            if xl != nil {
                (*xl).set_parent(xc, false);
            }
            let xr = (*xc).right.load(RELAXED);
            if xr != nil {
                (*xr).set_parent(xc, true);
            }
            let yl = (*yc).left.load(RELAXED);
            if yl != nil {
                (*yl).set_parent(yc, false);
            }

            self.defer(x, guard);
            self.defer(y, guard);
            xc
        }
    }

    // ========================================================================
    //  Max-end propagation
    // ========================================================================

    /// Walk up from `start`, copying each ancestor whose recomputed
    /// `max_end` differs from its stored value, until an ancestor is
    /// unchanged or the root has been republished.
    unsafe fn propagate_max_end(&mut self, start: *mut RbNode<K>, guard: &ReadGuard<'_>) {
        let nil = self.nil();
        let mut x = start;
        // SAFETY: writer mutex held throughout.
        unsafe {
            loop {
                if x == nil {
                    return;
                }
                x = self.live(x);
                let m = self.subtree_max_end(x);
                if self.tree.cmp.cmp_endpoints(&m, &(*x).max_end) == CmpOrdering::Equal {
                    return;
                }

                let xp = (*x).parent();
                let x_right = (*x).is_right_child();

                let xc = self.alloc_copy(x);
                (*xc).max_end = m;

                release_fence();
                (*x).decay_next.store(xc, WRITE_ORD);
                release_fence();

                self.publish_at(xp, x_right, xc);

                let l = (*xc).left.load(RELAXED);
                if l != nil {
                    (*l).set_parent(xc, false);
                }
                let r = (*xc).right.load(RELAXED);
                if r != nil {
                    (*r).set_parent(xc, true);
                }

                self.defer(x, guard);
                x = xp;
            }
        }
    }

    // ========================================================================
    //  Insert fixup
    // ========================================================================

    unsafe fn insert_fixup(&mut self, mut z: *mut RbNode<K>, guard: &ReadGuard<'_>) {
        let nil = self.nil();
        // SAFETY: writer mutex held throughout.
        unsafe {
            loop {
                z = self.live(z);
                let zp = self.live((*z).parent());
                if zp == nil || self.color(zp) != COLOR_RED {
                    break;
                }
                // A red parent is never the root, so the grandparent exists.
                let zpp = self.live((*zp).parent());
                debug_assert!(zpp != nil);

                if zp == (*zpp).left.load(RELAXED) {
                    let uncle = (*zpp).right.load(RELAXED);
                    if uncle != nil && self.color(uncle) == COLOR_RED {
                        self.set_color(zp, COLOR_BLACK);
                        self.set_color(uncle, COLOR_BLACK);
                        self.set_color(zpp, COLOR_RED);
                        z = zpp;
                    } else {
                        if z == (*zp).right.load(RELAXED) {
                            z = self.left_rotate(zp, guard);
                        }
                        let z_live = self.live(z);
                        let parent = self.live((*z_live).parent());
                        self.set_color(parent, COLOR_BLACK);
                        let grandparent = self.live((*parent).parent());
                        self.set_color(grandparent, COLOR_RED);
                        self.right_rotate(grandparent, guard);
                    }
                } else {
                    let uncle = (*zpp).left.load(RELAXED);
                    if uncle != nil && self.color(uncle) == COLOR_RED {
                        self.set_color(zp, COLOR_BLACK);
                        self.set_color(uncle, COLOR_BLACK);
                        self.set_color(zpp, COLOR_RED);
                        z = zpp;
                    } else {
                        if z == (*zp).left.load(RELAXED) {
                            z = self.right_rotate(zp, guard);
                        }
                        let z_live = self.live(z);
                        let parent = self.live((*z_live).parent());
                        self.set_color(parent, COLOR_BLACK);
                        let grandparent = self.live((*parent).parent());
                        self.set_color(grandparent, COLOR_RED);
                        self.left_rotate(grandparent, guard);
                    }
                }
            }
            let root = self.tree.root.load(RELAXED);
            if root != nil {
                self.set_color(root, COLOR_BLACK);
            }
        }
    }

    // ========================================================================
    //  Remove
    // ========================================================================

    /// Transplant `v` (one of `u`'s children, possibly nil) into `u`'s
    /// position. Returns the published copy of `v`, or nil.
    unsafe fn transplant(
        &mut self,
        u: *mut RbNode<K>,
        v: *mut RbNode<K>,
        guard: &ReadGuard<'_>,
    ) -> *mut RbNode<K> {
        let nil = self.nil();
        // SAFETY: writer mutex held.
        unsafe {
            let up = (*u).parent();
            let u_right = (*u).is_right_child();

            let vc = if v != nil {
                let vc = self.alloc_copy(v);
                (*vc).set_parent(up, u_right);

                release_fence();
                (*v).decay_next.store(vc, WRITE_ORD);
                release_fence();
                vc
            } else {
                // The remove fixup may start from nil; give it a way up.
                (*nil).set_parent(up, u_right);
                nil
            };

            self.publish_at(up, u_right, vc);

            if v != nil {
                // vc kept v's children; reparent them.
                let l = (*vc).left.load(RELAXED);
                if l != nil {
                    (*l).set_parent(vc, false);
                }
                let r = (*vc).right.load(RELAXED);
                if r != nil {
                    (*r).set_parent(vc, true);
                }
                self.defer(v, guard);
            }
            vc
        }
    }

    /// Remove a node with two children by splicing its in-order
    /// successor `y` into its position ("teleportation").
    ///
    /// The replacement cluster is fully assembled before any live
    /// pointer is redirected at it; each publication is a single store,
    /// so readers see the pre- or post-teleport shape, never a hybrid.
    ///
    /// Returns `(x, start)` where `x` is the node the RB fixup runs on
    /// (the successor's old right child, possibly nil) and `start` is
    /// where max-end propagation begins.
    unsafe fn remove_nonil(
        &mut self,
        z: *mut RbNode<K>,
        y: *mut RbNode<K>,
        guard: &ReadGuard<'_>,
    ) -> (*mut RbNode<K>, *mut RbNode<K>) {
        let nil = self.nil();
        // SAFETY: writer mutex held.
        unsafe {
            let x = (*y).right.load(RELAXED);
            let yp = (*y).parent();
            let y_right = (*y).is_right_child();
            let zp = (*z).parent();
            let z_right = (*z).is_right_child();
            let z_color = self.color(z);

            let yc = self.alloc_copy(y);
            (*yc).left.store((*z).left.load(RELAXED), RELAXED);
            (*yc).set_parent(zp, z_right);
            self.set_color(yc, z_color);

            if yp == z {
                // y is z's own right child: one copy suffices. yc keeps
                // x as its right child and takes z's left child, colour,
                // and position.
                self.refresh_max_end(yc);

                release_fence();
                (*y).decay_next.store(yc, WRITE_ORD);
                release_fence();

                self.publish_at(zp, z_right, yc);

                let l = (*yc).left.load(RELAXED);
                if l != nil {
                    (*l).set_parent(yc, false);
                }
                if x != nil {
                    (*x).set_parent(yc, true);
                } else {
                    (*nil).set_parent(yc, true);
                }

                self.defer(y, guard);
                (x, self.live(zp))
            } else {
                // y sits deeper: its right child x transplants into y's
                // slot, and yc takes over z's slot with both of z's
                // children.
                (*yc).right.store((*z).right.load(RELAXED), RELAXED);

                let xc = if x != nil {
                    let xc = self.alloc_copy(x);
                    (*xc).set_parent(yp, y_right);
                    self.refresh_max_end(xc);
                    xc
                } else {
                    (*nil).set_parent(yp, y_right);
                    nil
                };
                self.refresh_max_end(yc);

                release_fence();
                if x != nil {
                    (*x).decay_next.store(xc, WRITE_ORD);
                }
                (*y).decay_next.store(yc, WRITE_ORD);
                release_fence();

                // Publish x's copy into y's old slot first, then the
                // successor copy into z's slot; both orders are single
                // ordered stores.
                self.publish_at(yp, y_right, xc);
                self.publish_at(zp, z_right, yc);

                if x != nil {
                    let l = (*xc).left.load(RELAXED);
                    if l != nil {
                        (*l).set_parent(xc, false);
                    }
                    let r = (*xc).right.load(RELAXED);
                    if r != nil {
                        (*r).set_parent(xc, true);
                    }
                    self.defer(x, guard);
                }
                let l = (*yc).left.load(RELAXED);
                if l != nil {
                    (*l).set_parent(yc, false);
                }
                let r = (*yc).right.load(RELAXED);
                if r != nil {
                    (*r).set_parent(yc, true);
                }

                self.defer(y, guard);
                (xc, self.live(yp))
            }
        }
    }

    unsafe fn remove_fixup(&mut self, mut x: *mut RbNode<K>, guard: &ReadGuard<'_>) {
        let nil = self.nil();
        // SAFETY: writer mutex held throughout; when x is nil its parent
        // was set transiently by the caller.
        unsafe {
            loop {
                x = self.live(x);
                let root = self.tree.root.load(RELAXED);
                if x == root || self.color(x) != COLOR_BLACK {
                    break;
                }
                let mut xp = self.live((*x).parent());

                if x == (*xp).left.load(RELAXED) {
                    let mut w = (*xp).right.load(RELAXED);
                    debug_assert!(w != nil, "sibling missing: black-height broken");
                    if self.color(w) == COLOR_RED {
                        self.set_color(w, COLOR_BLACK);
                        self.set_color(xp, COLOR_RED);
                        // x is a left child and is not copied by this
                        // rotation; its new parent is the copy of xp.
                        xp = self.left_rotate(xp, guard);
                        w = (*xp).right.load(RELAXED);
                    }
                    let wl = (*w).left.load(RELAXED);
                    let wr = (*w).right.load(RELAXED);
                    if self.color(wl) == COLOR_BLACK && self.color(wr) == COLOR_BLACK {
                        self.set_color(w, COLOR_RED);
                        x = xp;
                    } else {
                        if self.color(wr) == COLOR_BLACK {
                            self.set_color(wl, COLOR_BLACK);
                            self.set_color(w, COLOR_RED);
                            self.right_rotate(w, guard);
                            xp = self.live(xp);
                            w = (*xp).right.load(RELAXED);
                        }
                        self.set_color(w, self.color(xp));
                        self.set_color(xp, COLOR_BLACK);
                        let wr = (*w).right.load(RELAXED);
                        if wr != nil {
                            self.set_color(wr, COLOR_BLACK);
                        }
                        self.left_rotate(xp, guard);
                        x = self.tree.root.load(RELAXED);
                    }
                } else {
                    let mut w = (*xp).left.load(RELAXED);
                    debug_assert!(w != nil, "sibling missing: black-height broken");
                    if self.color(w) == COLOR_RED {
                        self.set_color(w, COLOR_BLACK);
                        self.set_color(xp, COLOR_RED);
                        xp = self.right_rotate(xp, guard);
                        w = (*xp).left.load(RELAXED);
                    }
                    let wl = (*w).left.load(RELAXED);
                    let wr = (*w).right.load(RELAXED);
                    if self.color(wl) == COLOR_BLACK && self.color(wr) == COLOR_BLACK {
                        self.set_color(w, COLOR_RED);
                        x = xp;
                    } else {
                        if self.color(wl) == COLOR_BLACK {
                            self.set_color(wr, COLOR_BLACK);
                            self.set_color(w, COLOR_RED);
                            self.left_rotate(w, guard);
                            xp = self.live(xp);
                            w = (*xp).left.load(RELAXED);
                        }
                        self.set_color(w, self.color(xp));
                        self.set_color(xp, COLOR_BLACK);
                        let wl = (*w).left.load(RELAXED);
                        if wl != nil {
                            self.set_color(wl, COLOR_BLACK);
                        }
                        self.right_rotate(xp, guard);
                        x = self.tree.root.load(RELAXED);
                    }
                }
            }
            if x != nil {
                self.set_color(x, COLOR_BLACK);
            }
        }
    }
}
