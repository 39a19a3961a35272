//! Standard memory orderings for concurrent node access.
//!
//! These constants ensure consistent ordering usage across the codebase
//! and make the intent clear at each access point.

use std::sync::atomic::{Ordering, fence};

/// Ordering for reading node fields during lock-free traversal.
/// Pairs with writer's Release stores.
pub const READ_ORD: Ordering = Ordering::Acquire;

/// Ordering for publishing node fields from the update side.
/// Pairs with reader's Acquire loads.
pub const WRITE_ORD: Ordering = Ordering::Release;

/// Ordering for loads and stores that only the update side observes
/// (serialized by the relevant mutex).
pub const RELAXED: Ordering = Ordering::Relaxed;

/// Order all prior stores (a fully initialized node copy or cluster)
/// before the single store that publishes it.
#[inline(always)]
pub fn release_fence() {
    fence(Ordering::Release);
}

/// Order a raced load before subsequent dependent loads.
#[inline(always)]
pub fn acquire_fence() {
    fence(Ordering::Acquire);
}
