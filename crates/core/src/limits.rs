//! Hard limits
//!
//! Slot arrays are allocated eagerly at construction, so capacity is capped
//! to keep a mistyped capacity from reserving gigabytes up front.

/// Largest capacity accepted by any bounded primitive (16M slots)
pub const MAX_CAPACITY: usize = 1 << 24;

/// Number of busy-wait iterations before a waiter starts yielding its timeslice
pub const SPIN_LIMIT: u32 = 64;
