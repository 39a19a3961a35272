//! RCU-safe interval red-black tree.
//!
//! An ordered map over opaque interval endpoints `[begin, end)` with the
//! classic interval augmentation: every node carries the maximum `end`
//! of its subtree, so point and interval searches prune whole subtrees.
//!
//! # Concurrency model
//!
//! Readers traverse the published tree with Acquire loads inside a
//! [`ReadGuard`] section: no locks, no retries, no atomic
//! read-modify-writes. Writers serialize on the tree-wide mutex (see
//! [`IntervalTree::writer`]) and never mutate reachable topology in
//! place. Every rotation or transplant allocates copies of the affected
//! node cluster, wires the copies to the post-operation topology,
//! recomputes their `max_end`, and publishes the whole cluster with a
//! single Release store into the parent slot. Superseded nodes are
//! chained to their replacement through `decay_next` (so the writer can
//! re-find the live copy) and handed to deferred reclamation.
//!
//! `next`/`prev` walk parent pointers, which are only reparented after
//! publication; they therefore require the writer mutex, not just a read
//! section.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use seize::Collector;

use crate::ordering::RELAXED;
use crate::reclaim::Domain;

mod node;
mod read;
mod validate;
mod write;

pub use node::RbNode;

use std::sync::atomic::AtomicPtr;

// ============================================================================
//  Injection points
// ============================================================================

/// Total order over interval endpoints, injected at tree construction.
pub trait EndpointCmp<K>: Send + Sync {
    fn cmp_endpoints(&self, a: &K, b: &K) -> CmpOrdering;
}

/// Comparator delegating to `Ord`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NaturalCmp;

impl<K: Ord> EndpointCmp<K> for NaturalCmp {
    #[inline(always)]
    fn cmp_endpoints(&self, a: &K, b: &K) -> CmpOrdering {
        a.cmp(b)
    }
}

/// Node allocation, injected at tree construction.
///
/// `alloc_node` returns a stable pointer or null on exhaustion.
/// `dealloc_node` is an associated function (no `&self`) so it can serve
/// as a deferred-reclamation callback; allocators therefore must not
/// need per-instance state to free.
pub trait NodeAlloc<K>: Send + Sync {
    /// Move `node` into stable storage. Null return means out of memory;
    /// public insert surfaces that as [`crate::RbError::OutOfMemory`].
    fn alloc_node(&self, node: RbNode<K>) -> *mut RbNode<K>;

    /// Free storage previously returned by `alloc_node`.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `alloc_node` of a compatible allocator and
    /// must not have been freed.
    unsafe fn dealloc_node(ptr: *mut RbNode<K>);
}

/// Default allocator over `Box`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BoxAlloc;

impl<K: Send + Sync> NodeAlloc<K> for BoxAlloc {
    #[inline]
    fn alloc_node(&self, node: RbNode<K>) -> *mut RbNode<K> {
        Box::into_raw(Box::new(node))
    }

    #[inline]
    unsafe fn dealloc_node(ptr: *mut RbNode<K>) {
        // SAFETY: alloc_node produced ptr via Box::into_raw.
        unsafe { drop(Box::from_raw(ptr)) };
    }
}

/// Deferred-reclamation callback routing node frees through the
/// injected allocator.
pub(crate) unsafe fn reclaim_node<K, A: NodeAlloc<K>>(
    ptr: *mut RbNode<K>,
    _collector: &Collector,
) {
    // SAFETY: ptr was produced by A::alloc_node and unlinked by the writer.
    unsafe { A::dealloc_node(ptr) };
}

// ============================================================================
//  IntervalTree
// ============================================================================

/// A concurrent interval map.
///
/// Read operations take a [`ReadGuard`](crate::ReadGuard); returned node
/// references stay valid for the guard's lifetime even if a writer
/// unlinks them meanwhile. Update operations go through the handle
/// returned by [`IntervalTree::writer`].
pub struct IntervalTree<K, C = NaturalCmp, A = BoxAlloc>
where
    A: NodeAlloc<K>,
{
    pub(crate) root: AtomicPtr<RbNode<K>>,
    pub(crate) nil: *mut RbNode<K>,
    pub(crate) cmp: C,
    pub(crate) alloc: A,
    pub(crate) writer_lock: Mutex<()>,
    pub(crate) domain: Arc<Domain>,
}

// SAFETY: all shared node state is reached through atomics with the
// protocols described at module level; the raw nil pointer is owned by
// the tree and freed only in Drop.
unsafe impl<K: Send + Sync, C: Send + Sync, A: Send + Sync + NodeAlloc<K>> Send
    for IntervalTree<K, C, A>
{
}
unsafe impl<K: Send + Sync, C: Send + Sync, A: Send + Sync + NodeAlloc<K>> Sync
    for IntervalTree<K, C, A>
{
}

impl<K: Clone + Default + Ord + Send + Sync> IntervalTree<K> {
    /// Create a tree ordered by `Ord`, allocating nodes with `Box`.
    #[must_use]
    pub fn new(domain: Arc<Domain>) -> Self {
        Self::with_parts(domain, NaturalCmp, BoxAlloc)
    }
}

impl<K, C, A> IntervalTree<K, C, A>
where
    K: Clone + Default + Send + Sync,
    C: EndpointCmp<K>,
    A: NodeAlloc<K>,
{
    /// Create a tree with an injected comparator and allocator.
    ///
    /// # Panics
    ///
    /// Panics if the allocator cannot provide the nil sentinel.
    #[must_use]
    pub fn with_parts(domain: Arc<Domain>, cmp: C, alloc: A) -> Self {
        let nil = alloc.alloc_node(RbNode::new_nil());
        assert!(!nil.is_null(), "allocator failed for the nil sentinel");
        // Nil stands in for its own children; parent is set transiently
        // during remove fixups.
        // SAFETY: nil was just allocated and is exclusively ours.
        unsafe {
            (*nil).left.store(nil, RELAXED);
            (*nil).right.store(nil, RELAXED);
            (*nil).set_parent(nil, false);
        }
        Self {
            root: AtomicPtr::new(nil),
            nil,
            cmp,
            alloc,
            writer_lock: Mutex::new(()),
            domain,
        }
    }

    /// Acquire the tree-wide update mutex and return the writer handle.
    ///
    /// Writers block each other; readers are unaffected.
    #[must_use]
    pub fn writer(&self) -> RbWriter<'_, K, C, A> {
        RbWriter {
            tree: self,
            _serial: self.writer_lock.lock(),
        }
    }

    /// Whether the tree has no intervals.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.load(crate::ordering::READ_ORD) == self.nil
    }
}

impl<K, C, A> Drop for IntervalTree<K, C, A>
where
    A: NodeAlloc<K>,
{
    fn drop(&mut self) {
        // Sole owner: free every node synchronously, nil last. Nodes
        // already handed to the domain are freed by the domain.
        let nil = self.nil;
        let mut stack = vec![self.root.load(RELAXED)];
        while let Some(x) = stack.pop() {
            if x == nil || x.is_null() {
                continue;
            }
            // SAFETY: x is a live node reachable only from this tree.
            unsafe {
                stack.push((*x).left.load(RELAXED));
                stack.push((*x).right.load(RELAXED));
                A::dealloc_node(x);
            }
        }
        // SAFETY: nil was allocated in with_parts and nothing else
        // references it now.
        unsafe { A::dealloc_node(nil) };
    }
}

// ============================================================================
//  RbWriter
// ============================================================================

/// Exclusive update handle; holds the tree-wide mutex for its lifetime.
///
/// Mutating operations take `&mut self`, so node references obtained
/// from [`RbWriter::next`]/[`RbWriter::prev`] cannot outlive the next
/// mutation on this handle.
pub struct RbWriter<'t, K, C = NaturalCmp, A = BoxAlloc>
where
    A: NodeAlloc<K>,
{
    pub(crate) tree: &'t IntervalTree<K, C, A>,
    _serial: MutexGuard<'t, ()>,
}
