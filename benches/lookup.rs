//! Read-path microbenchmarks: trie lookups and interval searches over
//! pre-populated structures, measured inside a single read section.

use std::ptr::NonNull;
use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use gracemap::{Domain, DupLink, IntervalTree, JudyTrie, TrieEntry};

struct BenchEntry {
    link: DupLink<BenchEntry>,
    key: u64,
}

impl TrieEntry for BenchEntry {
    fn link(&self) -> &DupLink<Self> {
        &self.link
    }
}

fn bench_trie_lookup(c: &mut Criterion) {
    let domain = Arc::new(Domain::new());
    let trie: JudyTrie<BenchEntry> = JudyTrie::new(Arc::clone(&domain), 32);

    let keys: Vec<u64> = (0..10_000u64).map(|i| i.wrapping_mul(0x9e37_79b9) & 0xffff_ffff).collect();
    let entries: Vec<NonNull<BenchEntry>> = {
        let guard = domain.enter();
        keys.iter()
            .map(|&key| {
                let entry = NonNull::from(Box::leak(Box::new(BenchEntry {
                    link: DupLink::new(),
                    key,
                })));
                // SAFETY: entries are leaked for the benchmark lifetime.
                unsafe { trie.add(key, entry, &guard) }.unwrap();
                entry
            })
            .collect()
    };

    let mut group = c.benchmark_group("trie");
    group.bench_function("lookup_hit", |b| {
        let guard = domain.enter();
        let mut i = 0;
        b.iter(|| {
            let key = keys[i % keys.len()];
            i += 1;
            black_box(trie.lookup(black_box(key), &guard))
        });
    });
    group.bench_function("lookup_below_equal", |b| {
        let guard = domain.enter();
        let mut i = 0;
        b.iter(|| {
            let key = keys[i % keys.len()].wrapping_add(1);
            i += 1;
            black_box(trie.lookup_below_equal(black_box(key), &guard))
        });
    });
    group.finish();

    drop(entries);
}

fn bench_rbtree_search(c: &mut Criterion) {
    let domain = Arc::new(Domain::new());
    let tree: IntervalTree<u64> = IntervalTree::new(Arc::clone(&domain));

    {
        let mut writer = tree.writer();
        for i in 0..10_000u64 {
            let begin = i * 16;
            writer.insert(begin, begin + 12).unwrap();
        }
    }

    let mut group = c.benchmark_group("rbtree");
    group.bench_function("search_hit", |b| {
        let guard = domain.enter();
        let mut i = 0u64;
        b.iter(|| {
            let point = (i % 10_000) * 16 + 6;
            i += 1;
            black_box(tree.search(black_box(&point), &guard))
        });
    });
    group.bench_function("search_miss", |b| {
        let guard = domain.enter();
        let mut i = 0u64;
        b.iter(|| {
            let point = (i % 10_000) * 16 + 14;
            i += 1;
            black_box(tree.search(black_box(&point), &guard))
        });
    });
    group.finish();
}

criterion_group!(benches, bench_trie_lookup, bench_rbtree_search);
criterion_main!(benches);
