//! Property tests for the bounded collections and marker-trait checks
//!
//! Sequential operation sequences are checked against simple std models.

use needlework_concurrency::{
    FixedSizeBucket, FixedSizeQueue, LazyNeedle, LockableContext, LockableNeedle, Scope,
    SlotArray,
};
use proptest::prelude::*;
use static_assertions::{assert_impl_all, assert_not_impl_any};
use std::collections::VecDeque;

assert_impl_all!(SlotArray<String>: Send, Sync);
assert_impl_all!(FixedSizeBucket<String>: Send, Sync);
assert_impl_all!(FixedSizeQueue<String>: Send, Sync);
assert_impl_all!(LazyNeedle<String, String>: Send, Sync);
assert_impl_all!(LockableContext: Send, Sync, Clone);
assert_impl_all!(LockableNeedle<u64>: Send, Sync, Clone);
assert_not_impl_any!(Scope: Send, Sync);

#[derive(Debug, Clone)]
enum QueueOp {
    Add(u16),
    Take,
    Peek,
}

fn queue_op() -> impl Strategy<Value = QueueOp> {
    prop_oneof![
        any::<u16>().prop_map(QueueOp::Add),
        Just(QueueOp::Take),
        Just(QueueOp::Peek),
    ]
}

proptest! {
    #[test]
    fn queue_matches_bounded_fifo(
        capacity in 1usize..12,
        ops in prop::collection::vec(queue_op(), 0..200)
    ) {
        let queue = FixedSizeQueue::new(capacity).unwrap();
        let mut model = VecDeque::new();

        for op in ops {
            match op {
                QueueOp::Add(v) => {
                    let admitted = queue.add(v);
                    prop_assert_eq!(admitted, model.len() < capacity);
                    if admitted {
                        model.push_back(v);
                    }
                }
                QueueOp::Take => prop_assert_eq!(queue.try_take(), model.pop_front()),
                QueueOp::Peek => prop_assert_eq!(queue.try_peek(), model.front().copied()),
            }
            prop_assert_eq!(queue.count(), model.len());
        }
        prop_assert_eq!(queue.snapshot(), model.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn bucket_never_exceeds_capacity(
        capacity in 1usize..16,
        items in prop::collection::vec(any::<i32>(), 0..40)
    ) {
        let (bucket, rejected) = FixedSizeBucket::with_contents(capacity, items.clone()).unwrap();
        let kept = items.len().min(capacity);
        prop_assert_eq!(bucket.count(), kept);
        prop_assert_eq!(&rejected[..], &items[kept..]);

        let mut held = bucket.values();
        let mut expected = items[..kept].to_vec();
        held.sort_unstable();
        expected.sort_unstable();
        prop_assert_eq!(held, expected);
    }

    #[test]
    fn slot_versions_grow_per_occupancy(rounds in 1usize..20) {
        let slots = SlotArray::new(1).unwrap();
        let mut last = None;
        for round in 0..rounds {
            let slot = slots.try_claim(round).unwrap();
            if let Some(previous) = last {
                prop_assert!(slot.version > previous);
            }
            last = Some(slot.version);
            prop_assert_eq!(slots.release(slot.index).unwrap(), round);
        }
    }

    #[test]
    fn sequential_updates_sum(
        start in -1_000i64..1_000,
        deltas in prop::collection::vec(-50i64..50, 0..30)
    ) {
        let context = LockableContext::new(1).unwrap();
        let needle = LockableNeedle::new(&context, start);
        for delta in &deltas {
            needle.update(|v| v + delta).unwrap();
        }
        prop_assert_eq!(needle.value(), start + deltas.iter().sum::<i64>());
        prop_assert_eq!(needle.version(), deltas.len() as u64);
    }
}
