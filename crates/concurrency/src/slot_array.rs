//! Bounded slot array
//!
//! Fixed-capacity, index-addressable array of optional slots. Every slot
//! carries an atomic state tag:
//!
//! ```text
//! EMPTY ──claim──> BUSY ──publish──> OCCUPIED
//!   ^                                   │
//!   └──────── BUSY <──── release ───────┘
//! ```
//!
//! `BUSY` is held only for the duration of a single slot operation (store,
//! take, clone, in-place update). Readers and writers of different slots never
//! interact; readers of the same slot wait out a `BUSY` window with a short
//! spin. Only claimers ever move a slot out of `EMPTY`: reads, updates and
//! releases give up on an empty slot without touching its tag, so they can
//! never make a concurrent claim miss a free slot.
//!
//! # Claims never block
//!
//! `try_claim` starts scanning at a round-robin cursor and moves on to the next
//! index whenever its CAS on a slot fails. A full array is reported through the
//! return value (the rejected payload comes back as `Err(value)`); waiting for
//! free capacity is layered on top by callers such as the lockable context.
//!
//! # Versions
//!
//! Each store into a slot bumps that slot's version. A [`SlotRef`] names one
//! particular occupancy, so a recycled index is distinguishable from the
//! occupancy it replaced.

use crate::backoff::Backoff;
use needlework_core::{Error, Result, SlotArrayConfig};
use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use tracing::trace;

const EMPTY: u8 = 0;
const OCCUPIED: u8 = 1;
const BUSY: u8 = 2;

/// One occupancy of one slot: index plus the version written by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotRef {
    /// Position in the array
    pub index: usize,
    /// Slot version assigned by the store that produced this occupancy
    pub version: u64,
}

/// Outcome of a claim: the claimed slot, or the payload handed back
pub type Claim<T> = std::result::Result<SlotRef, T>;

struct Slot<T> {
    state: AtomicU8,
    version: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Slot {
            state: AtomicU8::new(EMPTY),
            version: AtomicU64::new(0),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Take exclusive access whatever the current occupancy, spinning past BUSY
    ///
    /// Only for writers that store into the slot: an EMPTY slot locked here
    /// always ends up claimed.
    fn lock(&self) -> SlotGuard<'_, T> {
        let mut backoff = Backoff::new();
        loop {
            let current = self.state.load(Ordering::Relaxed);
            if current != BUSY
                && self
                    .state
                    .compare_exchange_weak(current, BUSY, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return SlotGuard {
                    slot: self,
                    occupied: current == OCCUPIED,
                };
            }
            backoff.snooze();
        }
    }

    /// Take exclusive access to an occupied slot, spinning past BUSY
    ///
    /// Returns `None` as soon as the slot is seen EMPTY, so readers and
    /// releasers never hold a free slot busy under a concurrent claimer.
    fn lock_occupied(&self) -> Option<SlotGuard<'_, T>> {
        let mut backoff = Backoff::new();
        loop {
            match self.state.load(Ordering::Relaxed) {
                EMPTY => return None,
                OCCUPIED => {
                    if let Some(guard) = self.try_lock(OCCUPIED) {
                        return Some(guard);
                    }
                }
                _ => {}
            }
            backoff.snooze();
        }
    }

    /// Take exclusive access only if the slot is currently in `expected`
    fn try_lock(&self, expected: u8) -> Option<SlotGuard<'_, T>> {
        self.state
            .compare_exchange(expected, BUSY, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SlotGuard {
                slot: self,
                occupied: expected == OCCUPIED,
            })
    }
}

/// Exclusive access to one slot; publishes the final occupancy on drop
///
/// Callers adjust the occupied count while still holding the guard, so
/// increments and decrements for one slot can never be observed out of order.
struct SlotGuard<'a, T> {
    slot: &'a Slot<T>,
    occupied: bool,
}

impl<T> SlotGuard<'_, T> {
    fn get(&self) -> Option<&T> {
        if self.occupied {
            // SAFETY: the slot is BUSY (exclusively ours) and `occupied` means
            // the value was initialized by a previous store.
            Some(unsafe { (*self.slot.value.get()).assume_init_ref() })
        } else {
            None
        }
    }

    fn get_mut(&mut self) -> Option<&mut T> {
        if self.occupied {
            // SAFETY: as in `get`, and the BUSY tag excludes every other accessor.
            Some(unsafe { (*self.slot.value.get()).assume_init_mut() })
        } else {
            None
        }
    }

    fn version(&self) -> u64 {
        self.slot.version.load(Ordering::Relaxed)
    }

    fn take(&mut self) -> Option<T> {
        if self.occupied {
            self.occupied = false;
            // SAFETY: initialized (occupied) and exclusively held; clearing
            // `occupied` first ensures the value is never read twice.
            Some(unsafe { (*self.slot.value.get()).assume_init_read() })
        } else {
            None
        }
    }

    /// Store `value`, returning the displaced payload and the new version
    fn store(&mut self, value: T) -> (Option<T>, u64) {
        let previous = self.take();
        // SAFETY: the slot is exclusively held and currently uninitialized.
        unsafe { (*self.slot.value.get()).write(value) };
        self.occupied = true;
        let version = self.slot.version.fetch_add(1, Ordering::Relaxed) + 1;
        (previous, version)
    }
}

impl<T> Drop for SlotGuard<'_, T> {
    fn drop(&mut self) {
        let state = if self.occupied { OCCUPIED } else { EMPTY };
        self.slot.state.store(state, Ordering::Release);
    }
}

/// Fixed-capacity array of atomically claimed slots
///
/// The substrate for the bucket and queue collections and for the lockable
/// context's transaction slots.
///
/// Indexed reads (`get`, `iter`) hand out clones: a slot may be released by
/// another thread at any moment, so no reference into the array ever escapes a
/// slot operation.
pub struct SlotArray<T> {
    slots: Box<[Slot<T>]>,
    cursor: AtomicUsize,
    count: AtomicUsize,
}

// SAFETY: payloads are only ever touched by the thread holding the slot BUSY,
// which gives the same exclusion guarantee as a mutex per slot.
unsafe impl<T: Send> Send for SlotArray<T> {}
unsafe impl<T: Send> Sync for SlotArray<T> {}

impl<T> SlotArray<T> {
    /// Create an empty array of `capacity` slots
    ///
    /// Fails with an argument error if `capacity` is zero or above
    /// [`needlework_core::MAX_CAPACITY`].
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_config(SlotArrayConfig::new(capacity))
    }

    /// Create an empty array from a validated configuration
    pub fn with_config(config: SlotArrayConfig) -> Result<Self> {
        config.validate()?;
        let slots = (0..config.capacity).map(|_| Slot::new()).collect();
        Ok(SlotArray {
            slots,
            cursor: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
        })
    }

    /// Number of slots, fixed at construction
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots
    ///
    /// Best-effort snapshot: exact when the array is quiescent, approximate
    /// under concurrent claims and releases.
    #[inline]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire).min(self.capacity())
    }

    /// True if no slot is occupied (best-effort)
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// True if every slot is occupied (best-effort)
    pub fn is_full(&self) -> bool {
        self.count() >= self.capacity()
    }

    fn slot(&self, index: usize) -> Result<&Slot<T>> {
        self.slots.get(index).ok_or(Error::IndexOutOfRange {
            index,
            capacity: self.capacity(),
        })
    }

    /// Claim any empty slot and store `value` in it
    ///
    /// Returns `Err(value)` if no empty slot was found. Never blocks: a slot
    /// that is mid-operation for another thread is skipped, not waited on.
    pub fn try_claim(&self, value: T) -> Claim<T> {
        let capacity = self.capacity();
        if self.count.load(Ordering::Acquire) >= capacity {
            return Err(value);
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % capacity;
        for offset in 0..capacity {
            let index = (start + offset) % capacity;
            if let Some(mut guard) = self.slots[index].try_lock(EMPTY) {
                let (_, version) = guard.store(value);
                self.count.fetch_add(1, Ordering::AcqRel);
                drop(guard);
                trace!(target: "needlework::slots", index, version, "Slot claimed");
                return Ok(SlotRef { index, version });
            }
        }
        Err(value)
    }

    /// Claim the slot at `index` only if it is empty
    ///
    /// The inner `Err(value)` hands the payload back when the slot is occupied.
    pub fn insert(&self, index: usize, value: T) -> Result<Claim<T>> {
        self.slot(index)?;
        Ok(self.insert_at(index, value))
    }

    /// `insert` for callers that already hold a valid index
    pub(crate) fn insert_at(&self, index: usize, value: T) -> Claim<T> {
        let mut guard = self.slots[index].lock();
        if guard.occupied {
            return Err(value);
        }
        let (_, version) = guard.store(value);
        self.count.fetch_add(1, Ordering::AcqRel);
        drop(guard);
        trace!(target: "needlework::slots", index, version, "Slot claimed");
        Ok(SlotRef { index, version })
    }

    /// Store `value` at `index` whether or not it is occupied
    ///
    /// Returns the displaced payload, if any.
    pub fn set(&self, index: usize, value: T) -> Result<Option<T>> {
        let mut guard = self.slot(index)?.lock();
        let (previous, _) = guard.store(value);
        if previous.is_none() {
            self.count.fetch_add(1, Ordering::AcqRel);
        }
        Ok(previous)
    }

    /// Exchange the payload of an occupied slot, keeping its occupancy
    ///
    /// The inner `Err(value)` hands the payload back when the slot is empty.
    pub fn swap(&self, index: usize, value: T) -> Result<std::result::Result<T, T>> {
        let Some(mut guard) = self.slot(index)?.lock_occupied() else {
            return Ok(Err(value));
        };
        Ok(match guard.get_mut() {
            Some(current) => Ok(std::mem::replace(current, value)),
            None => Err(value),
        })
    }

    /// Release the slot at `index`, returning its payload
    ///
    /// Releasing an empty slot is a caller bug and surfaces as
    /// [`Error::SlotNotOccupied`].
    pub fn release(&self, index: usize) -> Result<T> {
        self.slot(index)?;
        self.try_release(index)
            .ok_or(Error::SlotNotOccupied { index })
    }

    /// Release the slot at `index` if it is occupied
    ///
    /// Returns `None` for an empty slot or an out-of-range index.
    pub fn try_release(&self, index: usize) -> Option<T> {
        self.release_if(index, |_| true)
    }

    /// Release the slot at `index` only if its payload satisfies `predicate`
    pub fn release_if<P>(&self, index: usize, predicate: P) -> Option<T>
    where
        P: FnOnce(&T) -> bool,
    {
        let mut guard = self.slots.get(index)?.lock_occupied()?;
        if !predicate(guard.get()?) {
            return None;
        }
        let value = guard.take();
        self.count.fetch_sub(1, Ordering::AcqRel);
        drop(guard);
        trace!(target: "needlework::slots", index, "Slot released");
        value
    }

    /// Release whichever occupied slot the scan reaches first
    ///
    /// Scans from the round-robin cursor; gives up (returns `None`) once every
    /// slot has been looked at without finding an occupied one. A slot busy
    /// with another thread's single-slot operation is waited out rather than
    /// skipped, so a concurrent reader never makes a non-empty array look
    /// empty.
    pub fn try_take(&self) -> Option<(usize, T)> {
        if self.count.load(Ordering::Acquire) == 0 {
            return None;
        }
        let capacity = self.capacity();
        let start = self.cursor.load(Ordering::Relaxed) % capacity;
        for offset in 0..capacity {
            let index = (start + offset) % capacity;
            if let Some(mut guard) = self.slots[index].lock_occupied() {
                let value = guard.take();
                self.count.fetch_sub(1, Ordering::AcqRel);
                drop(guard);
                trace!(target: "needlework::slots", index, "Slot released");
                return value.map(|value| (index, value));
            }
        }
        None
    }

    /// Clone of the payload at `index`
    ///
    /// Returns `None` for an empty slot or an out-of-range index.
    pub fn get(&self, index: usize) -> Option<T>
    where
        T: Clone,
    {
        self.slots.get(index)?.lock_occupied()?.get().cloned()
    }

    /// Reference to the current occupancy of `index`
    pub fn get_ref(&self, index: usize) -> Option<SlotRef> {
        let guard = self.slots.get(index)?.lock_occupied()?;
        guard.get()?;
        Some(SlotRef {
            index,
            version: guard.version(),
        })
    }

    /// Mutate the payload at `index` in place
    ///
    /// Returns `None` (without calling `f`) if the slot is empty or out of range.
    /// The slot stays occupied even if `f` panics. `f` runs with the slot held
    /// busy and must not access the same array.
    pub fn update<F, R>(&self, index: usize, f: F) -> Option<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        let mut guard = self.slots.get(index)?.lock_occupied()?;
        guard.get_mut().map(f)
    }

    /// Release every slot whose payload satisfies `predicate`
    ///
    /// Returns the removed payloads in index order.
    pub fn remove_where<P>(&self, mut predicate: P) -> Vec<T>
    where
        P: FnMut(&T) -> bool,
    {
        (0..self.capacity())
            .filter_map(|index| self.release_if(index, &mut predicate))
            .collect()
    }

    /// Release every occupied slot, returning the payloads in index order
    pub fn drain(&self) -> Vec<T> {
        self.remove_where(|_| true)
    }

    /// Iterate over occupied slots in index order
    ///
    /// No snapshot isolation: slots claimed or released while the iterator
    /// runs may or may not be observed.
    pub fn iter(&self) -> Iter<'_, T>
    where
        T: Clone,
    {
        Iter {
            array: self,
            index: 0,
        }
    }

    /// Collect the occupied slots into a vector of `(index, value)` pairs
    pub fn snapshot(&self) -> Vec<(usize, T)>
    where
        T: Clone,
    {
        self.iter().collect()
    }
}

impl<T> Drop for SlotArray<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            if *slot.state.get_mut() == OCCUPIED {
                // SAFETY: `&mut self` excludes every other accessor and the
                // OCCUPIED tag means the value is initialized.
                unsafe { slot.value.get_mut().assume_init_drop() };
            }
        }
    }
}

impl<T> fmt::Debug for SlotArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotArray")
            .field("capacity", &self.capacity())
            .field("count", &self.count())
            .finish()
    }
}

/// Iterator over the occupied slots of a [`SlotArray`]
pub struct Iter<'a, T> {
    array: &'a SlotArray<T>,
    index: usize,
}

impl<T: Clone> Iterator for Iter<'_, T> {
    type Item = (usize, T);

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < self.array.capacity() {
            let index = self.index;
            self.index += 1;
            if let Some(value) = self.array.get(index) {
                return Some((index, value));
            }
        }
        None
    }
}
