//! Engine Configuration
//!
//! Tick intervals, concurrency caps and retry defaults. Values can be
//! loaded from YAML; missing keys keep their defaults.
//!
//! ```yaml
//! dispatch_interval_ms: 250
//! monitor_interval_ms: 1000
//! max_active: 16
//! default_backoff: linear
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::workflow::{BackoffStrategy, RetryPolicy};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Dispatcher tick
    pub dispatch_interval_ms: u64,

    /// Monitor tick; bounds timeout detection granularity
    pub monitor_interval_ms: u64,

    /// Node contexts allowed to run at once, engine-wide
    pub max_active: usize,

    /// Consecutive failed readiness checks, counted only while the
    /// instance has nothing running or delayed, before it is failed with a
    /// dependency deadlock
    pub merge_recheck_limit: u32,

    /// Fail RUNNING instances idle for longer than this (0 disables)
    pub stall_timeout_ms: u64,

    /// Warn about contexts running longer than this
    pub long_running_warn_ms: u64,

    pub default_max_retries: u32,
    pub default_retry_delay_ms: u64,
    pub default_backoff: BackoffStrategy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatch_interval_ms: 1_000,
            monitor_interval_ms: 5_000,
            max_active: num_cpus::get() * 4,
            merge_recheck_limit: 1_000,
            stall_timeout_ms: 0,
            long_running_warn_ms: 300_000,
            default_max_retries: 3,
            default_retry_delay_ms: 5_000,
            default_backoff: BackoffStrategy::Exponential,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: EngineConfig = serde_yaml::from_str(&content)?;
        info!("Loaded engine configuration from {}", path.display());
        Ok(config)
    }

    /// Retry policy applied to nodes that do not set their own.
    pub fn retry_defaults(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.default_max_retries,
            backoff_strategy: self.default_backoff,
            retry_delay: self.default_retry_delay_ms,
        }
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms.max(1))
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        (self.stall_timeout_ms > 0).then(|| Duration::from_millis(self.stall_timeout_ms))
    }

    pub fn long_running_warn(&self) -> Duration {
        Duration::from_millis(self.long_running_warn_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.dispatch_interval_ms, 1_000);
        assert_eq!(config.monitor_interval_ms, 5_000);
        assert!(config.max_active >= 4);
        assert!(config.stall_timeout().is_none());
        assert_eq!(config.retry_defaults(), RetryPolicy::default());
    }

    #[test]
    fn test_load_partial_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "dispatch_interval_ms: 10").unwrap();
        writeln!(file, "default_backoff: linear").unwrap();
        writeln!(file, "stall_timeout_ms: 2000").unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.dispatch_interval(), Duration::from_millis(10));
        assert_eq!(config.monitor_interval_ms, 5_000);
        assert_eq!(config.retry_defaults().backoff_strategy, BackoffStrategy::Linear);
        assert_eq!(config.stall_timeout(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_zero_interval_clamped() {
        let config = EngineConfig {
            dispatch_interval_ms: 0,
            ..EngineConfig::default()
        };
        assert_eq!(config.dispatch_interval(), Duration::from_millis(1));
    }
}
