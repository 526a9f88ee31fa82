//! Correlation engine configuration.
//!
//! Two durations govern the whole engine: how often the reaper sweeps and how
//! long an untouched entry may live. Nothing else is externally configurable.
//!
//! # Traceability
//! - Implements: REQ-CFG-001 (Configuration Surface)

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Default interval between reaper sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Default age after which an untouched entry is considered abandoned.
///
/// Four sweeps per staleness window: low eviction latency without aggressive
/// polling.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(120);

/// Configuration for the correlation store's reaper.
///
/// Implements: REQ-CFG-001 §2
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationConfig {
    /// Time between reaper sweeps.
    pub sweep_interval: Duration,
    /// Idle age at which an unfinished entry is evicted and force-closed.
    pub stale_after: Duration,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

impl CorrelationConfig {
    /// Creates a configuration with explicit durations.
    #[must_use]
    pub fn new(sweep_interval: Duration, stale_after: Duration) -> Self {
        Self {
            sweep_interval,
            stale_after,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `TRACESTITCH_SWEEP_INTERVAL_SECS` | `30` | Seconds between sweeps |
    /// | `TRACESTITCH_STALE_AFTER_SECS` | `120` | Idle seconds before eviction |
    ///
    /// Unparseable values fall back to the default with a logged warning.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            sweep_interval: env_duration("TRACESTITCH_SWEEP_INTERVAL_SECS", defaults.sweep_interval),
            stale_after: env_duration("TRACESTITCH_STALE_AFTER_SECS", defaults.stale_after),
        }
    }

    /// Validates the configuration.
    ///
    /// Both durations must be non-zero and a sweep must fit inside the
    /// staleness window, otherwise entries could only ever be evicted one
    /// full window late.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ZeroSweepInterval);
        }
        if self.stale_after.is_zero() {
            return Err(ConfigError::ZeroStaleAfter);
        }
        if self.sweep_interval > self.stale_after {
            return Err(ConfigError::SweepExceedsStaleness {
                sweep_interval: self.sweep_interval,
                stale_after: self.stale_after,
            });
        }
        Ok(())
    }
}

fn env_duration(variable: &str, default: Duration) -> Duration {
    match std::env::var(variable) {
        Ok(raw) => match raw.parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(_) => {
                warn!(variable, value = %raw, default_secs = default.as_secs(), "unparseable duration, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Errors produced by [`CorrelationConfig::validate`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// `sweep_interval` was zero.
    #[error("sweep_interval must be non-zero")]
    ZeroSweepInterval,

    /// `stale_after` was zero.
    #[error("stale_after must be non-zero")]
    ZeroStaleAfter,

    /// The sweep interval exceeds the staleness window.
    #[error("sweep_interval ({sweep_interval:?}) must not exceed stale_after ({stale_after:?})")]
    SweepExceedsStaleness {
        /// Configured sweep interval.
        sweep_interval: Duration,
        /// Configured staleness window.
        stale_after: Duration,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CorrelationConfig::default();
        assert_eq!(config.sweep_interval, Duration::from_secs(30));
        assert_eq!(config.stale_after, Duration::from_secs(120));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_durations() {
        let config = CorrelationConfig::new(Duration::ZERO, Duration::from_secs(120));
        assert_eq!(config.validate(), Err(ConfigError::ZeroSweepInterval));

        let config = CorrelationConfig::new(Duration::from_secs(30), Duration::ZERO);
        assert_eq!(config.validate(), Err(ConfigError::ZeroStaleAfter));
    }

    #[test]
    fn test_validate_rejects_sweep_longer_than_staleness() {
        let config = CorrelationConfig::new(Duration::from_secs(300), Duration::from_secs(120));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SweepExceedsStaleness { .. })
        ));
    }

    #[test]
    fn test_explicit_construction() {
        let config = CorrelationConfig::new(Duration::from_millis(10), Duration::from_millis(40));
        assert!(config.validate().is_ok());
        assert_eq!(config.sweep_interval, Duration::from_millis(10));
    }
}
