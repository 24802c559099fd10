//! Slot Array Benchmarks
//!
//! Measures the fail-fast paths and scaling under contention:
//! - Single-threaded claim/release round trips
//! - Queue add/take with 1..8 threads sharing one queue
//! - Needle updates with 1..8 threads sharing one needle
//!
//! Run with: cargo bench --bench slot_array

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use needlework_concurrency::{FixedSizeQueue, LockableContext, LockableNeedle, SlotArray};
use std::sync::Arc;
use std::thread;

const ITERATIONS_PER_THREAD: usize = 1000;

fn bench_claim_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("slot_array/claim_release");
    group.throughput(Throughput::Elements(1));

    for capacity in [16, 256, 4096] {
        let slots = SlotArray::new(capacity).unwrap();
        // Half full so the scan has something to skip
        for i in 0..capacity / 2 {
            slots.try_claim(i).unwrap();
        }
        group.bench_function(BenchmarkId::from_parameter(capacity), |b| {
            b.iter(|| {
                let slot = slots.try_claim(black_box(7)).unwrap();
                slots.release(slot.index).unwrap()
            });
        });
    }

    group.finish();
}

fn bench_queue_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue/add_take");
    group.throughput(Throughput::Elements(ITERATIONS_PER_THREAD as u64));

    for threads in [1, 2, 4, 8] {
        group.bench_function(BenchmarkId::new("threads", threads), |b| {
            b.iter(|| {
                let queue = Arc::new(FixedSizeQueue::new(64).unwrap());
                let handles: Vec<_> = (0..threads)
                    .map(|_| {
                        let queue = Arc::clone(&queue);
                        thread::spawn(move || {
                            for i in 0..ITERATIONS_PER_THREAD {
                                if queue.add(i) {
                                    black_box(queue.try_take());
                                }
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_needle_updates(c: &mut Criterion) {
    let mut group = c.benchmark_group("needle/update");
    group.throughput(Throughput::Elements(ITERATIONS_PER_THREAD as u64));

    for threads in [1, 2, 4, 8] {
        group.bench_function(BenchmarkId::new("threads", threads), |b| {
            b.iter(|| {
                let context = LockableContext::new(threads).unwrap();
                let needle = LockableNeedle::new(&context, 0u64);
                let handles: Vec<_> = (0..threads)
                    .map(|_| {
                        let needle = needle.clone();
                        thread::spawn(move || {
                            for _ in 0..ITERATIONS_PER_THREAD {
                                needle.update(|v| v + 1).unwrap();
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }
                assert_eq!(needle.value(), (threads * ITERATIONS_PER_THREAD) as u64);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_claim_release,
    bench_queue_contention,
    bench_needle_updates
);
criterion_main!(benches);
