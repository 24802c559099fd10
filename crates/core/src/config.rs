//! Construction-time configuration.
//!
//! Every bounded primitive is configured with a capacity. The context and the
//! lazy cell take a few more knobs. All configs follow the same shape: a
//! `Default`, builder-style `with_*` setters and a `validate()` that is run
//! by the constructors.

use crate::limits::MAX_CAPACITY;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Capacity configuration for a slot array and the collections built on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotArrayConfig {
    /// Number of slots (must be positive, at most `MAX_CAPACITY`).
    pub capacity: usize,
}

impl Default for SlotArrayConfig {
    fn default() -> Self {
        SlotArrayConfig { capacity: 64 }
    }
}

impl SlotArrayConfig {
    /// Create a configuration with the given capacity.
    pub fn new(capacity: usize) -> Self {
        SlotArrayConfig { capacity }
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_capacity(self.capacity)
    }
}

/// Lockable context configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Maximum number of concurrently active scopes.
    pub capacity: usize,

    /// Default timeout for `enter` in milliseconds (None = wait forever).
    pub enter_timeout_ms: Option<u64>,

    /// Default timeout for needle captures in milliseconds (None = wait forever).
    pub capture_timeout_ms: Option<u64>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig {
            capacity: 16,
            enter_timeout_ms: None,
            capture_timeout_ms: None,
        }
    }
}

impl ContextConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scope capacity (builder pattern).
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the default enter timeout (builder pattern).
    pub fn with_enter_timeout(mut self, timeout: Duration) -> Self {
        self.enter_timeout_ms = Some(millis_rounded_up(timeout));
        self
    }

    /// Set the default capture timeout (builder pattern).
    pub fn with_capture_timeout(mut self, timeout: Duration) -> Self {
        self.capture_timeout_ms = Some(millis_rounded_up(timeout));
        self
    }

    /// Default enter timeout as a `Duration`.
    pub fn enter_timeout(&self) -> Option<Duration> {
        self.enter_timeout_ms.map(Duration::from_millis)
    }

    /// Default capture timeout as a `Duration`.
    pub fn capture_timeout(&self) -> Option<Duration> {
        self.capture_timeout_ms.map(Duration::from_millis)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_capacity(self.capacity)?;
        if self.enter_timeout_ms == Some(0) || self.capture_timeout_ms == Some(0) {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

/// Lazy cell configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LazyConfig {
    /// Keep a factory failure forever instead of retrying on next access.
    pub cache_faults: bool,
}

impl LazyConfig {
    /// Create a configuration with default values (faults are not cached).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set fault caching (builder pattern).
    pub fn with_cache_faults(mut self, cache_faults: bool) -> Self {
        self.cache_faults = cache_faults;
        self
    }
}

fn validate_capacity(capacity: usize) -> Result<(), ConfigError> {
    if capacity == 0 {
        return Err(ConfigError::ZeroCapacity);
    }
    if capacity > MAX_CAPACITY {
        return Err(ConfigError::CapacityTooLarge {
            capacity,
            max: MAX_CAPACITY,
        });
    }
    Ok(())
}

/// Whole milliseconds covering `timeout`, so a non-zero timeout never stores as 0
fn millis_rounded_up(timeout: Duration) -> u64 {
    let millis = timeout.as_nanos().saturating_add(999_999) / 1_000_000;
    u64::try_from(millis).unwrap_or(u64::MAX)
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Capacity must be positive.
    #[error("Capacity must be positive")]
    ZeroCapacity,

    /// Capacity exceeds the supported maximum.
    #[error("Capacity {capacity} exceeds maximum {max}")]
    CapacityTooLarge {
        /// Requested capacity
        capacity: usize,
        /// Largest supported capacity
        max: usize,
    },

    /// A timeout of zero would make every blocking call fail immediately.
    #[error("Timeouts must be positive; use the try_* operations instead")]
    ZeroTimeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs_validate() {
        assert!(SlotArrayConfig::default().validate().is_ok());
        assert!(ContextConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert_eq!(
            SlotArrayConfig::new(0).validate(),
            Err(ConfigError::ZeroCapacity)
        );
        assert_eq!(
            ContextConfig::new().with_capacity(0).validate(),
            Err(ConfigError::ZeroCapacity)
        );
    }

    #[test]
    fn test_capacity_too_large_rejected() {
        let config = SlotArrayConfig::new(MAX_CAPACITY + 1);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::CapacityTooLarge { .. })
        ));
        assert!(SlotArrayConfig::new(MAX_CAPACITY).validate().is_ok());
    }

    #[test]
    fn test_context_builder_pattern() {
        let config = ContextConfig::new()
            .with_capacity(4)
            .with_enter_timeout(Duration::from_millis(250))
            .with_capture_timeout(Duration::from_secs(1));

        assert_eq!(config.capacity, 4);
        assert_eq!(config.enter_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.capture_timeout(), Some(Duration::from_secs(1)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = ContextConfig::new().with_enter_timeout(Duration::ZERO);
        assert_eq!(config.validate(), Err(ConfigError::ZeroTimeout));
    }

    #[test]
    fn test_sub_millisecond_timeout_rounds_up() {
        let config = ContextConfig::new()
            .with_enter_timeout(Duration::from_micros(500))
            .with_capture_timeout(Duration::from_micros(1_500));
        assert_eq!(config.enter_timeout(), Some(Duration::from_millis(1)));
        assert_eq!(config.capture_timeout(), Some(Duration::from_millis(2)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_lazy_config_defaults_to_retry() {
        assert!(!LazyConfig::default().cache_faults);
        assert!(LazyConfig::new().with_cache_faults(true).cache_faults);
    }

    #[test]
    fn test_context_config_from_json() {
        let config: ContextConfig =
            serde_json::from_str(r#"{"capacity": 8, "enter_timeout_ms": 100}"#).unwrap();
        assert_eq!(config.capacity, 8);
        assert_eq!(config.enter_timeout(), Some(Duration::from_millis(100)));
        assert_eq!(config.capture_timeout(), None);
    }

    #[test]
    fn test_lazy_config_from_empty_json() {
        let config: LazyConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, LazyConfig::default());
    }
}
