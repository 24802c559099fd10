//! Fixed-size FIFO queue
//!
//! Pairs a [`SlotArray`] with head/tail ticket counters. An adder reserves
//! ticket `t` by advancing `tail`, a taker reserves ticket `t` by advancing
//! `head`; both then meet at slot `t % capacity`.
//!
//! Each slot also carries a turn counter naming the only ticket allowed to write
//! into it next. A taker hands the slot over to ticket `t + capacity` after
//! removing ticket `t`, which keeps a fast adder from overtaking a slow taker
//! one lap behind. Entries are tagged with their ticket so a taker never
//! removes an item belonging to a different lap.
//!
//! A ticket is only reserved once its slot is ready: an adder first checks that
//! the slot's turn has come, a taker first checks that the slot already holds
//! the entry for its ticket. A slot whose counterpart is still in flight is
//! reported as full (or empty) instead of being waited on. The only spinning
//! left is over a single slot operation of another thread, such as a
//! concurrent `snapshot` cloning the very entry being taken.

use crate::backoff::Backoff;
use crate::slot_array::SlotArray;
use needlework_core::Result;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Entry<T> {
    ticket: usize,
    item: T,
}

/// Fixed-capacity first-in first-out queue
pub struct FixedSizeQueue<T> {
    slots: SlotArray<Entry<T>>,
    turns: Box<[AtomicUsize]>,
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl<T> FixedSizeQueue<T> {
    /// Create an empty queue
    pub fn new(capacity: usize) -> Result<Self> {
        let slots = SlotArray::new(capacity)?;
        let turns = (0..capacity).map(AtomicUsize::new).collect();
        Ok(FixedSizeQueue {
            slots,
            turns,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        })
    }

    /// Create a queue pre-populated from `items`
    ///
    /// Items that did not fit come back in the second tuple element, in input
    /// order.
    pub fn with_contents<I>(capacity: usize, items: I) -> Result<(Self, Vec<T>)>
    where
        I: IntoIterator<Item = T>,
    {
        let queue = Self::new(capacity)?;
        let rejected = items
            .into_iter()
            .filter_map(|item| queue.try_add(item).err())
            .collect();
        Ok((queue, rejected))
    }

    /// Capacity, fixed at construction
    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// Number of admitted items not yet taken (best-effort)
    pub fn count(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.saturating_sub(head).min(self.capacity())
    }

    /// True if the queue holds no items
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Enqueue an item; `false` if the queue is full
    pub fn add(&self, item: T) -> bool {
        self.try_add(item).is_ok()
    }

    /// Enqueue an item, handing it back if the queue is full
    ///
    /// A slot still being emptied by a take from the previous lap counts as
    /// full.
    pub fn try_add(&self, item: T) -> std::result::Result<(), T> {
        let capacity = self.capacity();
        let mut backoff = Backoff::new();
        let ticket = loop {
            let tail = self.tail.load(Ordering::Acquire);
            let head = self.head.load(Ordering::Acquire);
            let ready = tail.wrapping_sub(head) < capacity
                && self.turns[tail % capacity].load(Ordering::Acquire) == tail;
            if !ready {
                // `head` may have been read after `tail` moved on; only a
                // stable tail proves the queue was full.
                if self.tail.load(Ordering::Acquire) == tail {
                    return Err(item);
                }
                continue;
            }
            if self
                .tail
                .compare_exchange_weak(tail, tail + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break tail;
            }
            backoff.snooze();
        };

        // Our turn means the previous lap's entry is gone and no one else may
        // write here, so the insert lands on the first attempt.
        let index = ticket % capacity;
        let mut entry = Entry { ticket, item };
        let mut backoff = Backoff::new();
        loop {
            match self.slots.insert_at(index, entry) {
                Ok(_) => return Ok(()),
                Err(back) => entry = back,
            }
            backoff.snooze();
        }
    }

    /// True if the slot for `ticket` holds that ticket's entry
    fn is_written(&self, ticket: usize) -> bool {
        self.slots.update(ticket % self.capacity(), |entry| entry.ticket == ticket) == Some(true)
    }

    /// Dequeue the oldest item
    ///
    /// An item whose add is still in flight is not yet admitted, so the
    /// queue reads as empty up to it.
    pub fn try_take(&self) -> Option<T> {
        let capacity = self.capacity();
        let mut backoff = Backoff::new();
        let ticket = loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            if head == tail {
                return None;
            }
            if !self.is_written(head) {
                if self.head.load(Ordering::Acquire) == head {
                    return None;
                }
                continue;
            }
            if self
                .head
                .compare_exchange_weak(head, head + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break head;
            }
            backoff.snooze();
        };

        let index = ticket % capacity;
        let mut backoff = Backoff::new();
        loop {
            if let Some(entry) = self.slots.release_if(index, |entry| entry.ticket == ticket) {
                self.turns[index].store(ticket + capacity, Ordering::Release);
                return Some(entry.item);
            }
            backoff.snooze();
        }
    }

    /// Clone of the oldest item without removing it
    pub fn try_peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let capacity = self.capacity();
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            if head == tail {
                return None;
            }
            let found = self.slots.update(head % capacity, |entry| {
                (entry.ticket == head).then(|| entry.item.clone())
            });
            if let Some(Some(item)) = found {
                return Some(item);
            }
            if self.head.load(Ordering::Acquire) == head {
                return None;
            }
        }
    }

    /// Remove every item, oldest first
    pub fn clear(&self) -> Vec<T> {
        std::iter::from_fn(|| self.try_take()).collect()
    }

    /// Clone the queued items, oldest first
    ///
    /// Items still being written by an in-flight adder are skipped.
    pub fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        let capacity = self.capacity();
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (head..tail.max(head))
            .filter_map(|ticket| {
                self.slots
                    .update(ticket % capacity, |entry| {
                        (entry.ticket == ticket).then(|| entry.item.clone())
                    })
                    .flatten()
            })
            .collect()
    }
}

impl<T> fmt::Debug for FixedSizeQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedSizeQueue")
            .field("capacity", &self.capacity())
            .field("count", &self.count())
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct QueueRepr<T> {
    capacity: usize,
    items: Vec<T>,
}

impl<T: Clone + Serialize> Serialize for FixedSizeQueue<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        QueueRepr {
            capacity: self.capacity(),
            items: self.snapshot(),
        }
        .serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for FixedSizeQueue<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let repr = QueueRepr::<T>::deserialize(deserializer)?;
        let (queue, rejected) =
            FixedSizeQueue::with_contents(repr.capacity, repr.items).map_err(D::Error::custom)?;
        if !rejected.is_empty() {
            return Err(D::Error::custom(format!(
                "{} queued items exceed capacity {}",
                rejected.len(),
                repr.capacity
            )));
        }
        Ok(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_capacity_64_fifo_scenario() {
        let queue = FixedSizeQueue::new(64).unwrap();
        for i in 0..64 {
            assert!(queue.add(i));
        }
        assert!(!queue.add(999));

        let taken: Vec<_> = std::iter::from_fn(|| queue.try_take()).collect();
        assert_eq!(taken, (0..64).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_try_add_hands_back_item() {
        let queue = FixedSizeQueue::new(1).unwrap();
        queue.try_add("a").unwrap();
        assert_eq!(queue.try_add("b"), Err("b"));
    }

    #[test]
    fn test_wraps_around_many_laps() {
        let queue = FixedSizeQueue::new(3).unwrap();
        let mut next_in = 0;
        let mut next_out = 0;

        // Keep one item parked so head and tail land on different slots
        assert!(queue.add(next_in));
        next_in += 1;

        for _ in 0..50 {
            for _ in 0..2 {
                assert!(queue.add(next_in));
                next_in += 1;
            }
            assert!(!queue.add(-1));
            for _ in 0..2 {
                assert_eq!(queue.try_take(), Some(next_out));
                next_out += 1;
            }
        }
        assert_eq!(queue.clear(), vec![next_out]);
    }

    #[test]
    fn test_peek_does_not_remove() {
        let queue = FixedSizeQueue::new(4).unwrap();
        assert_eq!(queue.try_peek(), None::<i32>);
        queue.add(7);
        queue.add(8);
        assert_eq!(queue.try_peek(), Some(7));
        assert_eq!(queue.count(), 2);
        assert_eq!(queue.try_take(), Some(7));
        assert_eq!(queue.try_peek(), Some(8));
    }

    #[test]
    fn test_snapshot_fifo_order() {
        let (queue, rejected) = FixedSizeQueue::with_contents(4, vec!['a', 'b', 'c']).unwrap();
        assert!(rejected.is_empty());
        queue.try_take();
        queue.add('d');
        assert_eq!(queue.snapshot(), vec!['b', 'c', 'd']);
    }

    #[test]
    fn test_with_contents_rejects_overflow() {
        let (queue, rejected) = FixedSizeQueue::with_contents(2, 10..15).unwrap();
        assert_eq!(queue.count(), 2);
        assert_eq!(rejected, vec![12, 13, 14]);
        assert_eq!(queue.clear(), vec![10, 11]);
    }

    #[test]
    fn test_serde_round_trip_keeps_order() {
        let queue = FixedSizeQueue::new(5).unwrap();
        for word in ["one", "two", "three"] {
            queue.add(word.to_string());
        }
        queue.try_take();

        let json = serde_json::to_string(&queue).unwrap();
        let restored: FixedSizeQueue<String> = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.capacity(), 5);
        assert_eq!(restored.clear(), vec!["two".to_string(), "three".to_string()]);
    }

    #[test]
    fn test_deserialize_rejects_overfull() {
        let json = r#"{"capacity": 1, "items": [1, 2]}"#;
        assert!(serde_json::from_str::<FixedSizeQueue<i32>>(json).is_err());
    }

    #[test]
    fn test_concurrent_mpmc_no_loss_no_duplicates() {
        let queue = Arc::new(FixedSizeQueue::new(8).unwrap());
        let producers = 4;
        let per_producer = 500;
        let barrier = Arc::new(Barrier::new(producers * 2));

        let producer_handles: Vec<_> = (0..producers)
            .map(|p| {
                let queue = Arc::clone(&queue);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..per_producer {
                        let mut item = p * per_producer + i;
                        while let Err(back) = queue.try_add(item) {
                            item = back;
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let consumer_handles: Vec<_> = (0..producers)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mut taken = Vec::new();
                    while taken.len() < per_producer {
                        match queue.try_take() {
                            Some(item) => taken.push(item),
                            None => thread::yield_now(),
                        }
                    }
                    taken
                })
            })
            .collect();

        for handle in producer_handles {
            handle.join().unwrap();
        }
        let mut seen = HashSet::new();
        for handle in consumer_handles {
            let taken = handle.join().unwrap();
            // Items from one producer reach one consumer in production order
            for p in 0..producers {
                let from_p: Vec<_> = taken
                    .iter()
                    .filter(|item| **item / per_producer == p)
                    .collect();
                assert!(from_p.windows(2).all(|w| w[0] < w[1]));
            }
            for item in taken {
                assert!(seen.insert(item), "item {} taken twice", item);
            }
        }
        assert_eq!(seen.len(), producers * per_producer);
        assert!(queue.is_empty());
    }
}
