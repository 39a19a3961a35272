//! Trie scenario tests: dense 8-bit population, sparse 32-bit keys
//! with duplicate chains, neighbour lookups, and recompaction
//! visibility under a concurrent reader.

#![allow(clippy::unwrap_used)]

mod common;

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use common::{KeyEntry, free_entry};
use gracemap::{Domain, JudyTrie, TrieError};

#[test]
fn dense_8bit_population() {
    let domain = Arc::new(Domain::new());
    let trie: JudyTrie<KeyEntry> = JudyTrie::new(Arc::clone(&domain), 8);
    assert_eq!(trie.key_max(), 0xff);

    let entries: Vec<NonNull<KeyEntry>> = (0..200).map(|k| KeyEntry::boxed(k, 0)).collect();

    {
        let guard = domain.enter();
        for (k, entry) in entries.iter().enumerate() {
            // SAFETY: entries outlive the trie and a final barrier.
            unsafe { trie.add(k as u64, *entry, &guard) }.unwrap();
        }

        for k in 0..200u64 {
            let found = trie.lookup(k, &guard).expect("inserted key");
            assert_eq!(found.key, k);
        }
        for k in 200..240u64 {
            assert!(trie.lookup(k, &guard).is_none());
        }
        // Keys beyond the configured width are rejected outright.
        let stray = KeyEntry::boxed(300, 0);
        // SAFETY: stray never enters the trie.
        assert_eq!(
            unsafe { trie.add(300, stray, &guard) },
            Err(TrieError::Invalid)
        );
        // SAFETY: stray was rejected, still exclusively ours.
        unsafe { free_entry(stray) };

        assert_eq!(trie.validate(), 200);

        for (k, entry) in entries.iter().enumerate() {
            // SAFETY: same pointers that were added above.
            unsafe { trie.del(k as u64, *entry, &guard) }.unwrap();
        }
        for k in 0..200u64 {
            assert!(trie.lookup(k, &guard).is_none());
        }
        assert_eq!(trie.validate(), 0);
    }

    // SAFETY: all guards dropped, no writers running.
    unsafe { domain.barrier() };
    for entry in entries {
        // SAFETY: deleted above and past the barrier.
        unsafe { free_entry(entry) };
    }
}

#[test]
fn sparse_32bit_with_duplicates() {
    const STRIDE: u64 = 1 << 24;
    let domain = Arc::new(Domain::new());
    let trie: JudyTrie<KeyEntry> = JudyTrie::new(Arc::clone(&domain), 32);

    let mut keys: Vec<u64> = (0..256).map(|i| i * STRIDE).collect();
    keys.push(u32::MAX as u64);

    let mut entries: Vec<(u64, NonNull<KeyEntry>)> = Vec::new();
    {
        let guard = domain.enter();
        for &k in &keys {
            for seq in 0..3 {
                let entry = KeyEntry::boxed(k, seq);
                // SAFETY: entries outlive the trie and a final barrier.
                unsafe { trie.add(k, entry, &guard) }.unwrap();
                entries.push((k, entry));
            }
        }

        for &k in &keys {
            let head = trie.lookup(k, &guard).expect("inserted key");
            let seqs: Vec<u64> = trie.duplicates(head, &guard).map(|e| e.seq).collect();
            // Duplicates append at the tail, preserving insertion order.
            assert_eq!(seqs, vec![0, 1, 2], "chain broken at key {k:#x}");
            assert!(trie.lookup(k + 42, &guard).is_none());
        }

        assert_eq!(trie.validate(), keys.len());

        for &(k, entry) in &entries {
            // SAFETY: same pointers that were added above.
            unsafe { trie.del(k, entry, &guard) }.unwrap();
        }
        assert_eq!(trie.validate(), 0);
    }

    // SAFETY: all guards dropped, no writers running.
    unsafe { domain.barrier() };
    for (_, entry) in entries {
        // SAFETY: deleted above and past the barrier.
        unsafe { free_entry(entry) };
    }
}

#[test]
fn add_unique_returns_existing_head() {
    let domain = Arc::new(Domain::new());
    let trie: JudyTrie<KeyEntry> = JudyTrie::new(Arc::clone(&domain), 16);

    let first = KeyEntry::boxed(7, 0);
    let second = KeyEntry::boxed(7, 1);

    {
        let guard = domain.enter();
        // SAFETY: entries outlive the trie.
        assert!(unsafe { trie.add_unique(7, first, &guard) }.unwrap().is_none());
        let existing = unsafe { trie.add_unique(7, second, &guard) }
            .unwrap()
            .expect("key already populated");
        assert_eq!(existing.seq, 0);

        unsafe { trie.del(7, first, &guard) }.unwrap();
    }

    // SAFETY: quiesced.
    unsafe { domain.barrier() };
    // SAFETY: first was deleted; second never entered the trie.
    unsafe {
        free_entry(first);
        free_entry(second);
    }
}

#[test]
fn below_and_above_equal_neighbours() {
    let domain = Arc::new(Domain::new());
    let trie: JudyTrie<KeyEntry> = JudyTrie::new(Arc::clone(&domain), 32);

    let keys = [0x0000_0100u64, 0x0001_0000, 0x0300_0000, 0x0300_0042];
    let entries: Vec<NonNull<KeyEntry>> = keys.iter().map(|&k| KeyEntry::boxed(k, 0)).collect();

    {
        let guard = domain.enter();
        for (&k, entry) in keys.iter().zip(&entries) {
            // SAFETY: entries outlive the trie.
            unsafe { trie.add(k, *entry, &guard) }.unwrap();
        }

        // Exact hits.
        for &k in &keys {
            assert_eq!(trie.lookup_below_equal(k, &guard).unwrap().key, k);
            assert_eq!(trie.lookup_above_equal(k, &guard).unwrap().key, k);
        }
        // Between keys: rewind to the populated neighbour.
        assert_eq!(
            trie.lookup_below_equal(0x0000_ffff, &guard).unwrap().key,
            0x0000_0100
        );
        assert_eq!(
            trie.lookup_above_equal(0x0000_ffff, &guard).unwrap().key,
            0x0001_0000
        );
        assert_eq!(
            trie.lookup_below_equal(u32::MAX as u64, &guard).unwrap().key,
            0x0300_0042
        );
        assert_eq!(
            trie.lookup_above_equal(0x0300_0001, &guard).unwrap().key,
            0x0300_0042
        );
        // Below the smallest / above the largest.
        assert!(trie.lookup_below_equal(0x0000_00ff, &guard).is_none());
        assert!(trie.lookup_above_equal(0x0400_0000, &guard).is_none());

        for (&k, entry) in keys.iter().zip(&entries) {
            // SAFETY: same pointers that were added above.
            unsafe { trie.del(k, *entry, &guard) }.unwrap();
        }
    }

    // SAFETY: quiesced.
    unsafe { domain.barrier() };
    for entry in entries {
        // SAFETY: deleted above and past the barrier.
        unsafe { free_entry(entry) };
    }
}

/// Fill one node through every class boundary while a reader
/// continuously re-verifies everything inserted so far: recompaction
/// must never make a published key transiently invisible.
#[test]
fn recompaction_keeps_keys_visible() {
    let domain = Arc::new(Domain::new());
    let trie: Arc<JudyTrie<KeyEntry>> = Arc::new(JudyTrie::new(Arc::clone(&domain), 8));

    let watermark = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let domain = Arc::clone(&domain);
        let trie = Arc::clone(&trie);
        let watermark = Arc::clone(&watermark);
        let failed = Arc::clone(&failed);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                let upto = watermark.load(Ordering::Acquire);
                let guard = domain.enter();
                for k in 0..upto {
                    if trie.lookup(k, &guard).is_none() {
                        failed.store(true, Ordering::Release);
                        return;
                    }
                }
            }
        })
    };

    let entries: Vec<NonNull<KeyEntry>> = {
        let guard = domain.enter();
        (0..256u64)
            .map(|k| {
                let entry = KeyEntry::boxed(k, 0);
                // SAFETY: entries outlive the trie and a final barrier.
                unsafe { trie.add(k, entry, &guard) }.unwrap();
                watermark.store(k + 1, Ordering::Release);
                entry
            })
            .collect()
    };

    done.store(true, Ordering::Release);
    reader.join().unwrap();
    assert!(
        !failed.load(Ordering::Acquire),
        "a published key went missing during recompaction"
    );

    assert_eq!(trie.validate(), 256);

    {
        let guard = domain.enter();
        for (k, entry) in entries.iter().enumerate() {
            // SAFETY: same pointers that were added above.
            unsafe { trie.del(k as u64, *entry, &guard) }.unwrap();
        }
    }
    assert_eq!(trie.validate(), 0);

    // SAFETY: reader joined, guards dropped.
    unsafe { domain.barrier() };
    for entry in entries {
        // SAFETY: deleted above and past the barrier.
        unsafe { free_entry(entry) };
    }
}
