//! Concurrency primitives for needlework
//!
//! This crate implements the bounded, lock-free building blocks and the
//! scope-based coordination layered on top of them:
//! - SlotArray: fixed-capacity lock-free slot storage
//! - FixedSizeBucket / FixedSizeQueue: unordered and FIFO views over it
//! - LazyNeedle: exactly-once memoizing cell with optional fault caching
//! - LockableContext: bounded pool of thread-affine transaction scopes
//! - LockableNeedle: cell whose writes require a scope and a capture
//!
//! Capacity exhaustion is never an error. `try_*` and `add` calls fail fast
//! with a return value; only `enter`, `capture` and lazy resolution block.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod backoff;
pub mod bucket;
pub mod context;
pub mod lazy;
pub mod needle;
pub mod queue;
pub mod slot_array;

pub use bucket::FixedSizeBucket;
pub use context::{LockableContext, Scope, ScopeId};
pub use lazy::{LazyError, LazyNeedle};
pub use needle::LockableNeedle;
pub use queue::FixedSizeQueue;
pub use slot_array::{Claim, SlotArray, SlotRef};
