//! Runtime Configuration
//!
//! Configuration for the thread store, the transition protocol's slow paths
//! and allocation sampling. Configuration can be set programmatically or
//! loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `SAFEPOINT_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `SAFEPOINT_SAMPLING_ENABLED` | Enable randomized allocation sampling ("true"/"false") | false |
//! | `SAFEPOINT_SAMPLING_MEAN` | Mean bytes between sampled allocations | 102400 |
//! | `SAFEPOINT_SAMPLING_SEED` | Fixed PRNG seed (unset = OS entropy) | unset |
//! | `SAFEPOINT_REENTRY_POLICY` | Slow reverse-transition policy ("retry"/"block") | retry |
//! | `SAFEPOINT_REENTRY_ATTEMPTS` | Fast-path attempts before blocking (retry policy) | 3 |
//! | `SAFEPOINT_SUSPEND_TIMEOUT_MS` | Max time `suspend_all` waits for threads | 5000 |
//! | `SAFEPOINT_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//!
//! # Example
//!
//! ```rust,ignore
//! use safepoint_runtime::config::RuntimeConfig;
//!
//! // Load from environment with defaults
//! let config = RuntimeConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = RuntimeConfig::builder()
//!     .sampling_enabled(true)
//!     .sampling_mean(64 * 1024)
//!     .build()?;
//! ```

use std::env;
use std::time::Duration;

use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::alloc_context::SAMPLING_DISTRIBUTION_MEAN;

/// Log level for runtime logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages (default).
    #[default]
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// The equivalent `tracing` filter, for installing a subscriber.
    pub fn to_level_filter(&self) -> LevelFilter {
        match self {
            LogLevel::Off => LevelFilter::OFF,
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// What the slow reverse-transition path does when the fast path is refused
/// because a collection is pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReentryPolicy {
    /// Wait for the collection while still Preemptive, then retry the fast
    /// path, up to `max_attempts` times before blocking.
    RetryFastPath {
        /// Total fast-path attempts, including the first one.
        max_attempts: u32,
    },
    /// Go straight to the blocking wait-for-collection route.
    AlwaysBlock,
}

impl Default for ReentryPolicy {
    fn default() -> Self {
        ReentryPolicy::RetryFastPath { max_attempts: 3 }
    }
}

impl ReentryPolicy {
    /// Parse a policy name ("retry" or "block").
    pub fn from_str(s: &str, max_attempts: u32) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "retry" | "fast" => Some(ReentryPolicy::RetryFastPath { max_attempts }),
            "block" | "always-block" => Some(ReentryPolicy::AlwaysBlock),
            _ => None,
        }
    }
}

/// Allocation sampling configuration.
#[derive(Debug, Clone)]
pub struct SamplingConfig {
    /// Whether randomized sampling starts enabled.
    /// Default: false.
    pub enabled: bool,

    /// Mean distance in bytes between two sampled allocations.
    /// Default: 100KB (102400 bytes).
    pub mean_bytes: usize,

    /// Fixed seed for the per-thread generators.
    /// Default: None (each thread seeds from OS entropy).
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mean_bytes: SAMPLING_DISTRIBUTION_MEAN,
            seed: None,
        }
    }
}

/// Suspension and slow-path configuration.
#[derive(Debug, Clone)]
pub struct SuspensionConfig {
    /// Slow reverse-transition policy.
    /// Default: retry the fast path 3 times.
    pub reentry_policy: ReentryPolicy,

    /// How long `suspend_all` waits for threads to leave cooperative mode.
    /// Default: 5 seconds.
    pub suspend_timeout: Duration,
}

impl Default for SuspensionConfig {
    fn default() -> Self {
        Self {
            reentry_policy: ReentryPolicy::default(),
            suspend_timeout: Duration::from_secs(5),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Log level.
    /// Default: Info.
    pub level: LogLevel,
}

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::default()` for sensible defaults, or
/// `RuntimeConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Allocation sampling configuration.
    pub sampling: SamplingConfig,

    /// Suspension configuration.
    pub suspension: SuspensionConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are unset or invalid leave the default in place.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Sampling configuration
        if let Some(val) = parse_env_bool("SAFEPOINT_SAMPLING_ENABLED") {
            config.sampling.enabled = val;
        }

        if let Some(val) = parse_env_usize("SAFEPOINT_SAMPLING_MEAN") {
            if val > 0 {
                config.sampling.mean_bytes = val;
            } else {
                tracing::warn!(value = val, "ignoring SAFEPOINT_SAMPLING_MEAN: must be positive");
            }
        }

        if let Ok(val) = env::var("SAFEPOINT_SAMPLING_SEED") {
            match val.parse::<u64>() {
                Ok(seed) => config.sampling.seed = Some(seed),
                Err(_) => tracing::warn!(value = %val, "ignoring invalid SAFEPOINT_SAMPLING_SEED"),
            }
        }

        // Suspension configuration
        let attempts = parse_env_usize("SAFEPOINT_REENTRY_ATTEMPTS")
            .filter(|&n| n > 0)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(3);

        if let Ok(val) = env::var("SAFEPOINT_REENTRY_POLICY") {
            match ReentryPolicy::from_str(&val, attempts) {
                Some(policy) => config.suspension.reentry_policy = policy,
                None => tracing::warn!(value = %val, "ignoring unknown SAFEPOINT_REENTRY_POLICY"),
            }
        } else {
            config.suspension.reentry_policy = ReentryPolicy::RetryFastPath {
                max_attempts: attempts,
            };
        }

        if let Some(val) = parse_env_usize("SAFEPOINT_SUSPEND_TIMEOUT_MS") {
            if val > 0 {
                config.suspension.suspend_timeout = Duration::from_millis(val as u64);
            }
        }

        // Logging configuration
        if let Ok(val) = env::var("SAFEPOINT_LOG_LEVEL") {
            if let Some(level) = LogLevel::from_str(&val) {
                config.log.level = level;
            }
        }

        config
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sampling.mean_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sampling.mean_bytes".into(),
                message: "must be at least 1".into(),
            });
        }

        if let ReentryPolicy::RetryFastPath { max_attempts: 0 } = self.suspension.reentry_policy {
            return Err(ConfigError::InvalidValue {
                field: "suspension.reentry_policy".into(),
                message: "max_attempts must be at least 1".into(),
            });
        }

        if self.suspension.suspend_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "suspension.suspend_timeout".into(),
                message: "must be non-zero".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
}

/// Builder for RuntimeConfig.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable randomized allocation sampling.
    pub fn sampling_enabled(mut self, enabled: bool) -> Self {
        self.config.sampling.enabled = enabled;
        self
    }

    /// Set the mean sampling distance in bytes.
    pub fn sampling_mean(mut self, bytes: usize) -> Self {
        self.config.sampling.mean_bytes = bytes;
        self
    }

    /// Seed every thread's generator deterministically.
    pub fn sampling_seed(mut self, seed: u64) -> Self {
        self.config.sampling.seed = Some(seed);
        self
    }

    /// Set the slow reverse-transition policy.
    pub fn reentry_policy(mut self, policy: ReentryPolicy) -> Self {
        self.config.suspension.reentry_policy = policy;
        self
    }

    /// Set how long `suspend_all` waits for threads.
    pub fn suspend_timeout(mut self, timeout: Duration) -> Self {
        self.config.suspension.suspend_timeout = timeout;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| {
        match s.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert!(!config.sampling.enabled);
        assert_eq!(config.sampling.mean_bytes, 100 * 1024);
        assert!(config.sampling.seed.is_none());
        assert_eq!(
            config.suspension.reentry_policy,
            ReentryPolicy::RetryFastPath { max_attempts: 3 }
        );
        assert_eq!(config.suspension.suspend_timeout, Duration::from_secs(5));
        assert_eq!(config.log.level, LogLevel::Info);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::builder()
            .sampling_enabled(true)
            .sampling_mean(4096)
            .sampling_seed(17)
            .reentry_policy(ReentryPolicy::AlwaysBlock)
            .suspend_timeout(Duration::from_millis(250))
            .log_level(LogLevel::Debug)
            .build()
            .unwrap();

        assert!(config.sampling.enabled);
        assert_eq!(config.sampling.mean_bytes, 4096);
        assert_eq!(config.sampling.seed, Some(17));
        assert_eq!(config.suspension.reentry_policy, ReentryPolicy::AlwaysBlock);
        assert_eq!(config.suspension.suspend_timeout, Duration::from_millis(250));
        assert_eq!(config.log.level, LogLevel::Debug);
    }

    #[test]
    fn test_validation_zero_mean() {
        let result = RuntimeConfig::builder().sampling_mean(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_zero_attempts() {
        let result = RuntimeConfig::builder()
            .reentry_policy(ReentryPolicy::RetryFastPath { max_attempts: 0 })
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_zero_timeout() {
        let result = RuntimeConfig::builder()
            .suspend_timeout(Duration::ZERO)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_log_level_from_str() {
        assert_eq!(LogLevel::from_str("off"), Some(LogLevel::Off));
        assert_eq!(LogLevel::from_str("ERROR"), Some(LogLevel::Error));
        assert_eq!(LogLevel::from_str("warn"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_str("INFO"), Some(LogLevel::Info));
        assert_eq!(LogLevel::from_str("debug"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::from_str("TRACE"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::from_str("invalid"), None);
    }

    #[test]
    fn test_log_level_filter() {
        assert_eq!(LogLevel::Off.to_level_filter(), LevelFilter::OFF);
        assert_eq!(LogLevel::Trace.to_level_filter(), LevelFilter::TRACE);
    }

    #[test]
    fn test_reentry_policy_from_str() {
        assert_eq!(
            ReentryPolicy::from_str("retry", 5),
            Some(ReentryPolicy::RetryFastPath { max_attempts: 5 })
        );
        assert_eq!(ReentryPolicy::from_str("BLOCK", 5), Some(ReentryPolicy::AlwaysBlock));
        assert_eq!(ReentryPolicy::from_str("sometimes", 5), None);
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            field: "sampling.mean_bytes".into(),
            message: "must be positive".into(),
        };
        assert!(err.to_string().contains("sampling.mean_bytes"));
        assert!(err.to_string().contains("must be positive"));
    }

    #[test]
    fn test_from_env_with_no_vars() {
        env::remove_var("SAFEPOINT_SAMPLING_MEAN");
        env::remove_var("SAFEPOINT_REENTRY_POLICY");
        env::remove_var("SAFEPOINT_REENTRY_ATTEMPTS");

        let config = RuntimeConfig::from_env();
        assert_eq!(config.sampling.mean_bytes, SAMPLING_DISTRIBUTION_MEAN);
        assert_eq!(
            config.suspension.reentry_policy,
            ReentryPolicy::RetryFastPath { max_attempts: 3 }
        );
    }
}
