//! Watcher settings loaded through the `config` crate.

use crate::error::{FlagError, Result};
use crate::sources::WatchTiming;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Prefix for environment overrides, e.g. `HOTSWAP_FLAGS__STOP_GRACE_MS=500`.
pub const ENV_PREFIX: &str = "HOTSWAP_FLAGS";

/// Retry policy applied when a source reports a transient error.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffPolicy {
    /// First retry delay (unit: milliseconds)
    pub base_delay_ms: u64,

    /// Upper bound on any single delay (unit: milliseconds)
    pub max_delay_ms: u64,

    /// Fraction of each delay that is randomized, between 0.0 and 1.0
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            jitter: 0.5,
        }
    }
}

/// Settings for the reconciliation watcher and the sources it drives.
///
/// # Examples
///
/// ```rust
/// use hotswap_flags::watcher::WatcherConfig;
/// use std::time::Duration;
///
/// let config = WatcherConfig::default();
/// assert_eq!(config.stop_grace(), Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatcherConfig {
    /// Backoff after transient source errors
    pub backoff: BackoffPolicy,

    /// Deadline of one remote long poll (unit: milliseconds)
    pub poll_timeout_ms: u64,

    /// How long `stop` waits for the loop before aborting it (unit: milliseconds)
    pub stop_grace_ms: u64,

    /// Settle time after a directory swap (unit: milliseconds)
    pub debounce_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            poll_timeout_ms: 60_000,
            stop_grace_ms: 5_000,
            debounce_ms: 100,
        }
    }
}

impl WatcherConfig {
    /// Load settings from an optional file plus `HOTSWAP_FLAGS__*` environment overrides.
    ///
    /// The file format is detected from the extension (`.yaml`, `.toml`,
    /// `.json`). Missing keys fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`FlagError::Settings`] if the file cannot be read or a value
    /// has the wrong type.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder
            .build()
            .map_err(|e| FlagError::Settings(format!("Failed to build settings: {}", e)))?;

        settings
            .try_deserialize::<Self>()
            .map_err(|e| FlagError::Settings(format!("Failed to deserialize settings: {}", e)))
    }

    /// Grace period granted to the loop on `stop`.
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Timing handed to every subscription the watcher opens.
    pub fn watch_timing(&self) -> WatchTiming {
        WatchTiming {
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            debounce: Duration::from_millis(self.debounce_ms),
        }
    }
}
