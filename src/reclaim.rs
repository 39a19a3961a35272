//! Grace-period facade.
//!
//! [`Domain`] is the process-wide reclamation context: it owns the seize
//! [`Collector`] and is shared by every structure in the crate through an
//! `Arc`. Read-side critical sections are [`ReadGuard`]s obtained from
//! [`Domain::enter`]; a node handed to [`ReadGuard::defer_reclaim`] is
//! freed only after every section active at the time of the call has
//! ended.
//!
//! # Protocol
//!
//! ```text
//! 1. guard = domain.enter()              // read_lock
//! 2. chase published pointers (Acquire loads only; no locks, no allocation)
//! 3. drop(guard)                         // read_unlock
//! ```
//!
//! Writers hold their structure's update mutex, unlink nodes, and defer
//! them through a guard of their own. Reclamation callbacks never run
//! synchronously with the deferring call.

use seize::{Collector, Guard, LocalGuard};

// ============================================================================
//  Domain
// ============================================================================

/// A reclamation domain.
///
/// One `Domain` is typically shared by all structures that exchange
/// pointers, so a reader traversing from one structure into another stays
/// protected by a single guard. Dropping the domain reclaims everything
/// still pending; the caller guarantees no guards are live at that point
/// (enforced by `Arc` reference counting in practice).
pub struct Domain {
    collector: Collector,
}

impl Default for Domain {
    fn default() -> Self {
        Self::new()
    }
}

impl Domain {
    /// Create a fresh domain with no pending reclamations.
    #[must_use]
    pub fn new() -> Self {
        Self {
            collector: Collector::new(),
        }
    }

    /// Enter a read-side critical section.
    ///
    /// Sections may be nested freely; each guard is independent. No
    /// blocking operation may be performed while a guard is held.
    #[must_use]
    #[inline(always)]
    pub fn enter(&self) -> ReadGuard<'_> {
        ReadGuard {
            inner: self.collector.enter(),
        }
    }

    /// Wait for all pending deferred reclamations to run.
    ///
    /// # Safety
    ///
    /// No read section may be active on any thread, and no concurrent
    /// update may be in flight. Intended for teardown and for tests that
    /// have quiesced all workers.
    pub unsafe fn barrier(&self) {
        // SAFETY: quiescence is guaranteed by the caller.
        unsafe { self.collector.reclaim_all() };
    }

    #[inline(always)]
    pub(crate) const fn collector(&self) -> &Collector {
        &self.collector
    }
}

// ============================================================================
//  ReadGuard
// ============================================================================

/// A read-side critical section.
///
/// Any pointer loaded from a shared slot while the guard is live remains
/// valid until the guard drops, even if a writer unlinks and defers the
/// node meanwhile.
pub struct ReadGuard<'d> {
    inner: LocalGuard<'d>,
}

impl ReadGuard<'_> {
    /// Schedule `reclaim(ptr, _)` to run after all currently active read
    /// sections end. Never runs `reclaim` synchronously.
    ///
    /// # Safety
    ///
    /// `ptr` must be unreachable from the structure (no new reader can
    /// find it), valid for `reclaim`, and not already deferred.
    pub unsafe fn defer_reclaim<T>(&self, ptr: *mut T, reclaim: unsafe fn(*mut T, &Collector)) {
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.defer_retire(ptr, reclaim) };
    }
}

/// Reclaimer for nodes allocated with `Box::into_raw`.
///
/// # Safety
///
/// `ptr` must come from `Box::into_raw` and must not have been freed.
pub(crate) unsafe fn reclaim_boxed<T>(ptr: *mut T, _collector: &Collector) {
    // SAFETY: caller guarantees ptr came from Box::into_raw and seize
    // has determined no reader can still hold it.
    unsafe { drop(Box::from_raw(ptr)) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DROPS: AtomicUsize = AtomicUsize::new(0);

    struct Tracked;

    impl Drop for Tracked {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn defer_does_not_run_synchronously() {
        DROPS.store(0, Ordering::SeqCst);
        let domain = Arc::new(Domain::new());

        let guard = domain.enter();
        let ptr = Box::into_raw(Box::new(Tracked));
        // SAFETY: ptr is unreachable (never published) and from Box::into_raw.
        unsafe { guard.defer_reclaim(ptr, reclaim_boxed::<Tracked>) };
        assert_eq!(DROPS.load(Ordering::SeqCst), 0);
        drop(guard);

        // SAFETY: no guards are live.
        unsafe { domain.barrier() };
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
    }
}
