//! Error types for needlework
//!
//! This module defines the error hierarchy shared by every primitive.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Capacity exhaustion and emptiness are NOT errors. They are expected
//! steady-state outcomes and are reported through `bool`/`Option`/`Result<_, T>`
//! returns by the collections. The variants here cover contract violations
//! (invalid operations), bad arguments and expired blocking calls.

use crate::config::ConfigError;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for needlework operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for needlework
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Argument rejected at construction or call time (e.g. zero capacity)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Slot index outside `0..capacity`
    #[error("Index {index} out of range for capacity {capacity}")]
    IndexOutOfRange {
        /// Requested index
        index: usize,
        /// Capacity of the array
        capacity: usize,
    },

    /// Release of a slot that holds nothing (double release)
    #[error("Invalid operation: slot {index} is not occupied")]
    SlotNotOccupied {
        /// Index of the empty slot
        index: usize,
    },

    /// The calling thread has not entered the needle's context
    #[error("Invalid operation: the current thread has not entered the lockable context")]
    NotInScope,

    /// The current scope does not hold the capture of this needle
    #[error("Invalid operation: the needle is not captured by the current scope")]
    NotCaptured,

    /// An explicit scope handle belongs to a different context
    #[error("Invalid operation: scope belongs to a different lockable context")]
    ForeignScope,

    /// A blocking call gave up before it could proceed
    #[error("Timed out after {waited:?} waiting to {operation}")]
    Timeout {
        /// What the caller was waiting for
        operation: &'static str,
        /// How long the caller waited
        waited: Duration,
    },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    /// True for programming-contract violations
    ///
    /// These are raised synchronously at the point of violation and never
    /// mutate shared state.
    pub fn is_invalid_operation(&self) -> bool {
        matches!(
            self,
            Error::SlotNotOccupied { .. }
                | Error::NotInScope
                | Error::NotCaptured
                | Error::ForeignScope
        )
    }

    /// True for argument errors (bad capacity, bad index, bad config)
    pub fn is_argument_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidArgument(_) | Error::IndexOutOfRange { .. } | Error::Config(_)
        )
    }

    /// True if a blocking call expired
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}
