//! Needlework - bounded lock-free slots, memoizing cells and scope-guarded needles
//!
//! # Quick Start
//!
//! ```
//! use needlework::{FixedSizeQueue, LazyNeedle, LockableContext, LockableNeedle};
//!
//! let queue = FixedSizeQueue::new(4)?;
//! assert!(queue.add(1));
//! assert_eq!(queue.try_take(), Some(1));
//!
//! let table = LazyNeedle::new(|| vec![1, 2, 3]);
//! assert_eq!(table.value().unwrap().len(), 3);
//!
//! let context = LockableContext::new(8)?;
//! let counter = LockableNeedle::new(&context, 0);
//! counter.update(|v| v + 1)?;
//! assert_eq!(counter.value(), 1);
//! # Ok::<(), needlework::Error>(())
//! ```
//!
//! # Architecture
//!
//! `needlework-core` holds the error and configuration types;
//! `needlework-concurrency` holds every primitive. This crate re-exports both.

pub use needlework_concurrency::*;
pub use needlework_core::{
    ConfigError, ContextConfig, Error, LazyConfig, Result, SlotArrayConfig, MAX_CAPACITY,
};
