//! Fixed-size bucket
//!
//! An unordered, fixed-capacity collection over [`SlotArray`]. Items live at
//! stable indices until removed; `try_take` removes whichever item the scan
//! reaches first.
//!
//! Serialization writes the occupied slots as `(index, value)` pairs plus the
//! capacity, so a round trip restores every item at its original index.

use crate::slot_array::{Iter, SlotArray};
use needlework_core::{Error, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Fixed-capacity unordered collection
pub struct FixedSizeBucket<T> {
    slots: SlotArray<T>,
}

impl<T> FixedSizeBucket<T> {
    /// Create an empty bucket
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(FixedSizeBucket {
            slots: SlotArray::new(capacity)?,
        })
    }

    /// Create a bucket pre-populated from `items`
    ///
    /// Items are added with the same contract as [`add`](Self::add); those
    /// that did not fit come back in the second tuple element, in input order.
    pub fn with_contents<I>(capacity: usize, items: I) -> Result<(Self, Vec<T>)>
    where
        I: IntoIterator<Item = T>,
    {
        let bucket = Self::new(capacity)?;
        let rejected = items
            .into_iter()
            .filter_map(|item| bucket.try_add(item).err())
            .collect();
        Ok((bucket, rejected))
    }

    /// Capacity, fixed at construction
    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// Number of items (best-effort under concurrent mutation)
    pub fn count(&self) -> usize {
        self.slots.count()
    }

    /// True if the bucket holds no items
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// True if every slot is taken
    pub fn is_full(&self) -> bool {
        self.slots.is_full()
    }

    /// Add an item; `false` if the bucket is full
    pub fn add(&self, item: T) -> bool {
        self.try_add(item).is_ok()
    }

    /// Add an item, returning its index, or the item itself if the bucket is full
    pub fn try_add(&self, item: T) -> std::result::Result<usize, T> {
        self.slots.try_claim(item).map(|slot| slot.index)
    }

    /// Put an item at `index` only if that slot is free
    pub fn insert(&self, index: usize, item: T) -> Result<std::result::Result<(), T>> {
        Ok(self.slots.insert(index, item)?.map(|_| ()))
    }

    /// Put an item at `index`, returning whatever it displaced
    pub fn set(&self, index: usize, item: T) -> Result<Option<T>> {
        self.slots.set(index, item)
    }

    /// Exchange the item at `index`; the new item comes back if the slot is empty
    pub fn swap(&self, index: usize, item: T) -> Result<std::result::Result<T, T>> {
        self.slots.swap(index, item)
    }

    /// Clone of the item at `index`
    pub fn get(&self, index: usize) -> Option<T>
    where
        T: Clone,
    {
        self.slots.get(index)
    }

    /// Mutate the item at `index` in place
    pub fn update<F, R>(&self, index: usize, f: F) -> Option<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        self.slots.update(index, f)
    }

    /// Remove any one item
    pub fn try_take(&self) -> Option<T> {
        self.slots.try_take().map(|(_, item)| item)
    }

    /// Remove the item at `index`
    pub fn remove_at(&self, index: usize) -> Option<T> {
        self.slots.try_release(index)
    }

    /// Remove every item matching `predicate`, in index order
    pub fn remove_where<P>(&self, predicate: P) -> Vec<T>
    where
        P: FnMut(&T) -> bool,
    {
        self.slots.remove_where(predicate)
    }

    /// Remove every item, in index order
    pub fn clear(&self) -> Vec<T> {
        self.slots.drain()
    }

    /// Iterate over `(index, item)` pairs in index order
    pub fn iter(&self) -> Iter<'_, T>
    where
        T: Clone,
    {
        self.slots.iter()
    }

    /// Collect `(index, item)` pairs in index order
    pub fn snapshot(&self) -> Vec<(usize, T)>
    where
        T: Clone,
    {
        self.slots.snapshot()
    }

    /// Collect the items in index order
    pub fn values(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.iter().map(|(_, item)| item).collect()
    }
}

impl<T> fmt::Debug for FixedSizeBucket<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedSizeBucket")
            .field("capacity", &self.capacity())
            .field("count", &self.count())
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct BucketRepr<T> {
    capacity: usize,
    items: Vec<(usize, T)>,
}

impl<T: Clone + Serialize> Serialize for FixedSizeBucket<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        BucketRepr {
            capacity: self.capacity(),
            items: self.snapshot(),
        }
        .serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for FixedSizeBucket<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let repr = BucketRepr::<T>::deserialize(deserializer)?;
        let bucket = FixedSizeBucket::new(repr.capacity).map_err(D::Error::custom)?;
        for (index, item) in repr.items {
            match bucket.insert(index, item).map_err(D::Error::custom)? {
                Ok(()) => {}
                Err(_) => {
                    return Err(D::Error::custom(Error::InvalidArgument(format!(
                        "duplicate bucket index {index}"
                    ))))
                }
            }
        }
        Ok(bucket)
    }
}
