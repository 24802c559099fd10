//! Core types for needlework
//!
//! This crate defines the foundational types shared by the primitives:
//! - Error: Error type hierarchy (invalid operations, argument errors, timeouts)
//! - Config: Construction-time configuration (capacity, timeouts, fault caching)
//! - Limits: Hard caps applied by the constructors

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod limits;

pub use config::{ConfigError, ContextConfig, LazyConfig, SlotArrayConfig};
pub use error::{Error, Result};
pub use limits::{MAX_CAPACITY, SPIN_LIMIT};
