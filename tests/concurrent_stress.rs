//! Concurrent stress: writers churn structure while readers verify
//! that a pinned working set never goes missing; quiesce and validate.

#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use common::{KeyEntry, free_entry};
use gracemap::{Domain, JudyTrie, RangeMap};

#[test]
fn range_churn_with_pinned_readers() {
    const WRITERS: usize = 2;
    const READERS: usize = 2;
    const ITERS: usize = 200;

    let domain = Arc::new(Domain::new());
    let map: Arc<RangeMap<u64>> = Arc::new(RangeMap::new(Arc::clone(&domain)));

    // Pinned spans that no writer ever touches.
    {
        let guard = domain.enter();
        map.add(50, 59, 50, &guard).unwrap();
        map.add(70, 79, 70, &guard).unwrap();
    }

    let done = Arc::new(AtomicBool::new(false));
    let reader_failures = Arc::new(AtomicUsize::new(0));

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let domain = Arc::clone(&domain);
            let map = Arc::clone(&map);
            let done = Arc::clone(&done);
            let failures = Arc::clone(&reader_failures);
            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    let guard = domain.enter();
                    for (key, payload) in [(55u64, 50u64), (75, 70)] {
                        match map.lookup(key, &guard) {
                            Some(seg) if seg.payload() == Some(&payload) => {}
                            _ => {
                                failures.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    // Churned spans may or may not be present; either
                    // answer is consistent.
                    let _ = map.lookup(1500, &guard);
                    let _ = map.lookup(2500, &guard);
                }
            })
        })
        .collect();

    let writers: Vec<_> = (0..WRITERS)
        .map(|w| {
            let domain = Arc::clone(&domain);
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for iter in 0..ITERS {
                    let guard = domain.enter();
                    let base = 1000 + (w as u64) * 1000;
                    let mut live = Vec::new();
                    for i in 0..8u64 {
                        let start = base + i * 100 + (iter as u64 % 3);
                        let seg = map.add(start, start + 50, start, &guard).unwrap();
                        live.push(seg);
                    }
                    for seg in &live {
                        assert_eq!(
                            map.lookup(seg.start() + 7, &guard).map(|s| s.start()),
                            Some(seg.start())
                        );
                    }
                    for seg in live {
                        map.del(seg, &guard).unwrap();
                    }
                }
            })
        })
        .collect();

    for writer in writers {
        writer.join().unwrap();
    }
    done.store(true, Ordering::Release);
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(
        reader_failures.load(Ordering::Relaxed),
        0,
        "a pinned span went missing mid-run"
    );

    // Quiesced: the two pinned allocations and three free segments.
    assert_eq!(map.validate(), 5);
    {
        let guard = domain.enter();
        assert!(map.lookup(1500, &guard).is_none());
    }
}

#[test]
fn trie_churn_with_pinned_readers() {
    const WRITERS: usize = 4;
    const READERS: usize = 2;
    const ITERS: usize = 60;
    const PINNED: u64 = 64;

    let domain = Arc::new(Domain::new());
    let trie: Arc<JudyTrie<KeyEntry>> = Arc::new(JudyTrie::new(Arc::clone(&domain), 16));

    let pinned: Vec<_> = {
        let guard = domain.enter();
        (0..PINNED)
            .map(|k| {
                let entry = KeyEntry::boxed(k, 0);
                // SAFETY: pinned entries outlive the trie and the final
                // barrier.
                unsafe { trie.add(k, entry, &guard) }.unwrap();
                entry
            })
            .collect()
    };

    let done = Arc::new(AtomicBool::new(false));
    let reader_failures = Arc::new(AtomicUsize::new(0));

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let domain = Arc::clone(&domain);
            let trie = Arc::clone(&trie);
            let done = Arc::clone(&done);
            let failures = Arc::clone(&reader_failures);
            thread::spawn(move || {
                while !done.load(Ordering::Acquire) {
                    let guard = domain.enter();
                    for k in 0..PINNED {
                        if trie.lookup(k, &guard).is_none() {
                            failures.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect();

    // Each writer churns its own key band; spent entries are returned
    // as addresses for reclamation after the global quiesce.
    let writers: Vec<_> = (0..WRITERS)
        .map(|w| {
            let domain = Arc::clone(&domain);
            let trie = Arc::clone(&trie);
            thread::spawn(move || -> Vec<usize> {
                let base = 0x1000 + (w as u64) * 0x800;
                let mut spent = Vec::new();
                for _ in 0..ITERS {
                    let guard = domain.enter();
                    let batch: Vec<_> = (0..32u64)
                        .map(|i| {
                            let key = base + i * 37;
                            let entry = KeyEntry::boxed(key, 0);
                            // SAFETY: freed only after the final barrier.
                            unsafe { trie.add(key, entry, &guard) }.unwrap();
                            (key, entry)
                        })
                        .collect();
                    for &(key, _) in &batch {
                        assert!(trie.lookup(key, &guard).is_some());
                    }
                    for (key, entry) in batch {
                        // SAFETY: the pointer added above.
                        unsafe { trie.del(key, entry, &guard) }.unwrap();
                        spent.push(entry.as_ptr() as usize);
                    }
                }
                spent
            })
        })
        .collect();

    let mut spent_entries = Vec::new();
    for writer in writers {
        spent_entries.extend(writer.join().unwrap());
    }
    done.store(true, Ordering::Release);
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(
        reader_failures.load(Ordering::Relaxed),
        0,
        "a pinned key went missing mid-run"
    );
    assert_eq!(trie.validate(), PINNED as usize);

    {
        let guard = domain.enter();
        for (k, entry) in pinned.iter().enumerate() {
            // SAFETY: the pointers added at setup.
            unsafe { trie.del(k as u64, *entry, &guard) }.unwrap();
        }
    }
    assert_eq!(trie.validate(), 0);

    // SAFETY: all threads joined, all guards dropped.
    unsafe { domain.barrier() };
    for entry in pinned {
        // SAFETY: deleted above, past the barrier.
        unsafe { free_entry(entry) };
    }
    for addr in spent_entries {
        // SAFETY: deleted by the owning writer, past the barrier.
        unsafe { free_entry(std::ptr::NonNull::new(addr as *mut common::KeyEntry).unwrap()) };
    }
}
