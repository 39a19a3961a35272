//! # gracemap
//!
//! Concurrent ordered maps whose readers observe a consistent,
//! lock-free view while writers mutate in place: readers never take a
//! lock, never retry, and never perform atomic read-modify-writes on
//! the hot path.
//!
//! Three interoperable structures share one read-copy-update
//! discipline:
//!
//! - [`IntervalTree`]: an ordered red-black tree over opaque interval
//!   endpoints, augmented for interval search, updated through
//!   copy-on-update node clusters published with single ordered stores.
//! - [`JudyTrie`]: a sparse integer map as a 256-ary compressed radix
//!   trie whose nodes adapt their layout (linear, pooled, dense) to
//!   their child count, recompacting transparently on growth and
//!   shrink.
//! - [`RangeMap`]: a partition of the integer key space into
//!   non-overlapping allocated/free segments built above the trie, with
//!   automatic split-on-add and merge-on-delete.
//!
//! ## Usage
//!
//! Every read-side call runs inside a [`ReadGuard`] obtained from the
//! shared [`Domain`]; the guard's lifetime bounds every reference the
//! call returns. Unlinked nodes go to the domain for deferred
//! reclamation and are freed only after all read sections active at
//! unlink time have ended.
//!
//! ```
//! use std::sync::Arc;
//! use gracemap::{Domain, IntervalTree};
//!
//! let domain = Arc::new(Domain::new());
//! let tree: IntervalTree<u64> = IntervalTree::new(Arc::clone(&domain));
//!
//! let mut writer = tree.writer();
//! writer.insert(0, 10).unwrap();
//! writer.insert(30, 40).unwrap();
//! drop(writer);
//!
//! let guard = domain.enter();
//! assert!(tree.search(&7, &guard).is_some());
//! assert!(tree.search(&25, &guard).is_none());
//! ```

pub mod error;
pub mod ordering;
pub mod range;
pub mod rbtree;
pub mod reclaim;
pub mod trie;

mod tagged;
mod tracing_helpers;

pub use error::{RangeError, RbError, TrieError};
pub use range::{KEY_MAX, RangeMap, Segment, SegmentGuard, SegmentState};
pub use rbtree::{BoxAlloc, EndpointCmp, IntervalTree, NaturalCmp, NodeAlloc, RbNode, RbWriter};
pub use reclaim::{Domain, ReadGuard};
pub use trie::{DupLink, Duplicates, JudyTrie, TrieEntry};
