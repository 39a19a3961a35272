//! Property tests for the range layer, differential against a
//! reference partition: the set of allocated spans fully determines
//! the partition (free space is always maximal), so a `BTreeMap` of
//! allocated spans is a complete oracle.

#![allow(clippy::unwrap_used)]

use std::collections::BTreeMap;
use std::sync::Arc;

use gracemap::{Domain, RangeError, RangeMap};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Add { start: u64, len: u64 },
    Del(usize),
    Lookup(u64),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    // A small domain keeps spans colliding and merging.
    let start = 0u64..4000;
    prop_oneof![
        4 => (start.clone(), 0u64..400).prop_map(|(start, len)| Op::Add { start, len }),
        3 => any::<usize>().prop_map(Op::Del),
        2 => start.prop_map(Op::Lookup),
    ]
}

/// Allocated spans as `start -> end` (inclusive, disjoint).
type Model = BTreeMap<u64, u64>;

fn model_hit(model: &Model, key: u64) -> Option<u64> {
    model
        .range(..=key)
        .next_back()
        .filter(|&(_, &end)| end >= key)
        .map(|(&start, _)| start)
}

fn model_intersects(model: &Model, start: u64, end: u64) -> bool {
    // A span is addable iff it touches no allocated span: free space
    // is always one maximal segment between allocations.
    model
        .range(..=end)
        .next_back()
        .is_some_and(|(_, &prev_end)| prev_end >= start)
}

fn run_ops(ops: Vec<Op>) {
    let domain = Arc::new(Domain::new());
    let map: RangeMap<u64> = RangeMap::new(Arc::clone(&domain));
    let mut model: Model = BTreeMap::new();

    let guard = domain.enter();
    for op in ops {
        match op {
            Op::Add { start, len } => {
                let end = start + len;
                let outcome = map.add(start, end, start, &guard);
                if model_intersects(&model, start, end) {
                    assert_eq!(outcome.err(), Some(RangeError::AlreadyExists));
                } else {
                    let seg = outcome.unwrap();
                    assert_eq!((seg.start(), seg.end()), (start, end));
                    model.insert(start, end);
                }
            }
            Op::Del(pick) => {
                if model.is_empty() {
                    continue;
                }
                let start = *model.keys().nth(pick % model.len()).unwrap();
                let seg = map.lookup(start, &guard).expect("allocated span present");
                map.del(seg, &guard).unwrap();
                model.remove(&start);
            }
            Op::Lookup(key) => {
                let got = map.lookup(key, &guard).map(|seg| seg.start());
                assert_eq!(got, model_hit(&model, key), "lookup mismatch at {key}");
            }
        }
    }

    // Quiesced sweep: segment count is allocations plus the free
    // segments around them, and the invariants hold.
    let segments = map.validate();
    assert!(segments >= model.len());
    for (&start, &end) in &model {
        assert_eq!(map.lookup(start, &guard).map(|s| s.end()), Some(end));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn matches_partition_reference(ops in prop::collection::vec(op_strategy(), 0..100)) {
        run_ops(ops);
    }
}

#[test]
fn regression_merge_both_sides() {
    run_ops(vec![
        Op::Add { start: 100, len: 50 },
        Op::Add { start: 151, len: 49 },
        Op::Add { start: 201, len: 99 },
        Op::Del(1),
        Op::Lookup(175),
        Op::Del(0),
        Op::Del(0),
        Op::Lookup(150),
    ]);
}
