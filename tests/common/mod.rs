//! Shared test fixtures.

#![allow(dead_code)]

use std::ptr::NonNull;

use gracemap::{DupLink, TrieEntry};

/// Minimal intrusive entry: a key plus a sequence number to tell
/// duplicates apart.
pub struct KeyEntry {
    pub link: DupLink<KeyEntry>,
    pub key: u64,
    pub seq: u64,
}

impl TrieEntry for KeyEntry {
    fn link(&self) -> &DupLink<Self> {
        &self.link
    }
}

impl KeyEntry {
    pub fn boxed(key: u64, seq: u64) -> NonNull<KeyEntry> {
        let entry = Box::new(KeyEntry {
            link: DupLink::new(),
            key,
            seq,
        });
        NonNull::new(Box::into_raw(entry)).expect("boxed entry")
    }
}

/// Free an entry previously produced by [`KeyEntry::boxed`].
///
/// # Safety
///
/// The entry must be out of every trie and past a grace period (or the
/// trie must be quiescent).
pub unsafe fn free_entry(ptr: NonNull<KeyEntry>) {
    // SAFETY: per contract.
    unsafe { drop(Box::from_raw(ptr.as_ptr())) };
}
