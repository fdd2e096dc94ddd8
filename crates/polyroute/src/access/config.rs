//! Access manager configuration.
//!
//! [`AccessConfig`] is a plain value passed to
//! [`AccessManager::new`](crate::access::AccessManager::new). Build it
//! directly, through [`AccessConfig::builder`], or deserialize it.
//! Durations are written in humantime format (`"250ms"`, `"30s"`); bare
//! integers are read as milliseconds.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use polyroute::access::{AccessConfig, ExecutionMode};
//! use polyroute::core::BackendKind;
//!
//! let config = AccessConfig::builder()
//!     .mode(ExecutionMode::Failover)
//!     .pool_limit(BackendKind::TimeSeries, 32)
//!     .request_timeout(Duration::from_secs(10))
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(config.pool_limit_for(BackendKind::TimeSeries), 32);
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::BackendKind;

/// How the access manager picks executors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Route through the rule catalog, rotating among instances of the chosen kind.
    #[default]
    AutoRoute,
    /// Send everything to one kind, bypassing the rule catalog.
    Pinned(BackendKind),
    /// Route through the rule catalog and fail over to every other live executor.
    Failover,
    /// Route through the rule catalog and pick the least-loaded instance.
    LoadBalanced,
}

/// Retry configuration for dispatches that fail with a retryable error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries against the same executor before failing over.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry.
    #[serde(with = "duration_format", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Upper bound on the delay between retries.
    #[serde(with = "duration_format", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Backoff multiplier.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Disables retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.min(30) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        self.initial_delay.mul_f64(factor).min(self.max_delay)
    }
}

/// Health monitoring configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Interval between background health checks.
    #[serde(with = "duration_format", default = "default_health_interval")]
    pub check_interval: Duration,

    /// Timeout for a single executor probe.
    #[serde(with = "duration_format", default = "default_health_timeout")]
    pub timeout: Duration,

    /// Consecutive failures before an instance is marked unhealthy.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive successes before an instance is marked healthy again.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_health_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_failure_threshold() -> u32 {
    1
}

fn default_success_threshold() -> u32 {
    1
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: default_health_interval(),
            timeout: default_health_timeout(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
        }
    }
}

/// Complete access manager configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Execution mode.
    pub mode: ExecutionMode,

    /// Run the optimizer before routing.
    pub enable_optimization: bool,

    /// Cache read results.
    pub enable_caching: bool,

    /// Maximum cached results.
    pub cache_max_entries: usize,

    /// Age after which a cached result is stale.
    #[serde(with = "duration_format")]
    pub cache_ttl: Duration,

    /// Maximum concurrent dispatches per kind.
    pub pool_limits: HashMap<BackendKind, usize>,

    /// Limit for kinds without an entry in `pool_limits`.
    pub default_pool_limit: usize,

    /// Timeout for a single dispatch.
    #[serde(with = "duration_format")]
    pub request_timeout: Duration,

    /// Retry policy.
    pub retry: RetryConfig,

    /// Try alternative candidates after a failed dispatch.
    pub enable_failover: bool,

    /// Health monitoring.
    pub health: HealthConfig,

    /// Reject routes resolved through the fallback order.
    pub strict_routing: bool,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            enable_optimization: true,
            enable_caching: true,
            cache_max_entries: 1000,
            cache_ttl: Duration::from_secs(300),
            pool_limits: HashMap::new(),
            default_pool_limit: 16,
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            enable_failover: true,
            health: HealthConfig::default(),
            strict_routing: false,
        }
    }
}

impl AccessConfig {
    /// Returns a builder starting from the defaults.
    pub fn builder() -> AccessConfigBuilder {
        AccessConfigBuilder::new()
    }

    /// Concurrent dispatch limit for a kind.
    pub fn pool_limit_for(&self, kind: BackendKind) -> usize {
        self.pool_limits
            .get(&kind)
            .copied()
            .unwrap_or(self.default_pool_limit)
    }

    /// Validates the configuration.
    ///
    /// Returns non-fatal warnings on success.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        let mut warnings = Vec::new();

        if self.request_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("request_timeout"));
        }
        if self.health.check_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("health.check_interval"));
        }
        if self.enable_caching && self.cache_max_entries == 0 {
            return Err(ConfigError::ZeroCacheCapacity);
        }
        if self.default_pool_limit == 0 {
            return Err(ConfigError::ZeroPoolLimit("default".to_string()));
        }
        if let Some((kind, _)) = self.pool_limits.iter().find(|(_, limit)| **limit == 0) {
            return Err(ConfigError::ZeroPoolLimit(kind.to_string()));
        }
        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoffMultiplier(self.retry.backoff_multiplier));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(ConfigError::InvalidRetryDelays {
                initial: self.retry.initial_delay,
                max: self.retry.max_delay,
            });
        }
        if self.health.failure_threshold == 0 || self.health.success_threshold == 0 {
            return Err(ConfigError::ZeroHealthThreshold);
        }

        if self.mode == ExecutionMode::Failover && !self.enable_failover {
            warnings.push(ConfigWarning::FailoverModeWithoutFailover);
        }
        if self.health.timeout >= self.health.check_interval {
            warnings.push(ConfigWarning::HealthTimeoutExceedsInterval {
                timeout: self.health.timeout,
                interval: self.health.check_interval,
            });
        }
        if let ExecutionMode::Pinned(kind) = self.mode {
            if self.strict_routing {
                warnings.push(ConfigWarning::StrictRoutingIgnored(kind));
            }
        }

        Ok(warnings)
    }
}

/// Builder for [`AccessConfig`].
#[derive(Debug, Default)]
pub struct AccessConfigBuilder {
    config: AccessConfig,
}

impl AccessConfigBuilder {
    /// Creates a builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the execution mode.
    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Pins every request to one kind.
    pub fn pinned(self, kind: BackendKind) -> Self {
        self.mode(ExecutionMode::Pinned(kind))
    }

    /// Enables or disables the optimizer.
    pub fn optimization(mut self, enabled: bool) -> Self {
        self.config.enable_optimization = enabled;
        self
    }

    /// Enables or disables result caching.
    pub fn caching(mut self, enabled: bool) -> Self {
        self.config.enable_caching = enabled;
        self
    }

    /// Sets the cache capacity.
    pub fn cache_max_entries(mut self, entries: usize) -> Self {
        self.config.cache_max_entries = entries;
        self
    }

    /// Sets the cache TTL.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl = ttl;
        self
    }

    /// Sets the concurrent dispatch limit for one kind.
    pub fn pool_limit(mut self, kind: BackendKind, limit: usize) -> Self {
        self.config.pool_limits.insert(kind, limit);
        self
    }

    /// Sets the limit for kinds without an explicit entry.
    pub fn default_pool_limit(mut self, limit: usize) -> Self {
        self.config.default_pool_limit = limit;
        self
    }

    /// Sets the per-dispatch timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Sets the retry policy.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Enables or disables failover.
    pub fn failover(mut self, enabled: bool) -> Self {
        self.config.enable_failover = enabled;
        self
    }

    /// Sets the health monitoring configuration.
    pub fn health(mut self, health: HealthConfig) -> Self {
        self.config.health = health;
        self
    }

    /// Sets the background health-check interval.
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.config.health.check_interval = interval;
        self
    }

    /// Rejects ambiguous routes.
    pub fn strict_routing(mut self, strict: bool) -> Self {
        self.config.strict_routing = strict;
        self
    }

    /// Builds the configuration, validating it first.
    pub fn build(self) -> Result<AccessConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Builds the configuration and returns warnings.
    pub fn build_with_warnings(self) -> Result<(AccessConfig, Vec<ConfigWarning>), ConfigError> {
        let warnings = self.config.validate()?;
        Ok((self.config, warnings))
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    /// A duration that must be positive is zero.
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    /// Caching is enabled with no capacity.
    #[error("cache_max_entries must be greater than zero when caching is enabled")]
    ZeroCacheCapacity,

    /// A pool limit is zero.
    #[error("pool limit for '{0}' must be greater than zero")]
    ZeroPoolLimit(String),

    /// Backoff would shrink delays.
    #[error("retry backoff multiplier must be finite and at least 1.0, got {0}")]
    InvalidBackoffMultiplier(f64),

    /// Initial retry delay exceeds the maximum.
    #[error("retry initial delay {initial:?} exceeds max delay {max:?}")]
    InvalidRetryDelays {
        /// Initial delay.
        initial: Duration,
        /// Maximum delay.
        max: Duration,
    },

    /// A health threshold is zero.
    #[error("health failure and success thresholds must be at least 1")]
    ZeroHealthThreshold,
}

/// Configuration warnings (non-fatal issues).
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigWarning {
    /// Failover mode selected with failover disabled.
    FailoverModeWithoutFailover,

    /// Probes may still be running when the next check starts.
    HealthTimeoutExceedsInterval {
        /// Probe timeout.
        timeout: Duration,
        /// Check interval.
        interval: Duration,
    },

    /// Pinned routes are never ambiguous, so strict routing has no effect.
    StrictRoutingIgnored(BackendKind),
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::FailoverModeWithoutFailover => {
                write!(f, "failover mode selected but failover is disabled - no alternatives will be tried")
            }
            ConfigWarning::HealthTimeoutExceedsInterval { timeout, interval } => {
                write!(
                    f,
                    "health probe timeout {:?} is not shorter than the check interval {:?}",
                    timeout, interval
                )
            }
            ConfigWarning::StrictRoutingIgnored(kind) => {
                write!(f, "strict routing has no effect while pinned to {}", kind)
            }
        }
    }
}

/// Durations as humantime strings (`"250ms"`), or bare integers read as
/// milliseconds. Always written back as a humantime string.
mod duration_format {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Text(String),
        Millis(u64),
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match RawDuration::deserialize(deserializer)? {
            RawDuration::Text(text) => humantime::parse_duration(text.trim())
                .map_err(|err| D::Error::custom(format!("invalid duration {:?}: {}", text, err))),
            RawDuration::Millis(ms) => Ok(Duration::from_millis(ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AccessConfig::default();
        assert_eq!(config.validate(), Ok(Vec::new()));
        assert_eq!(config.mode, ExecutionMode::AutoRoute);
        assert_eq!(config.pool_limit_for(BackendKind::Relational), 16);
    }

    #[test]
    fn test_builder() {
        let config = AccessConfig::builder()
            .pinned(BackendKind::TimeSeries)
            .caching(false)
            .pool_limit(BackendKind::TimeSeries, 4)
            .health_check_interval(Duration::from_secs(60))
            .build()
            .unwrap();

        assert_eq!(config.mode, ExecutionMode::Pinned(BackendKind::TimeSeries));
        assert!(!config.enable_caching);
        assert_eq!(config.pool_limit_for(BackendKind::TimeSeries), 4);
        assert_eq!(config.health.check_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_validation_errors() {
        let result = AccessConfig::builder().request_timeout(Duration::ZERO).build();
        assert_eq!(result, Err(ConfigError::ZeroDuration("request_timeout")));

        let result = AccessConfig::builder()
            .pool_limit(BackendKind::Relational, 0)
            .build();
        assert!(matches!(result, Err(ConfigError::ZeroPoolLimit(_))));

        let result = AccessConfig::builder()
            .retry(RetryConfig {
                backoff_multiplier: 0.5,
                ..Default::default()
            })
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidBackoffMultiplier(_))));

        // Zero capacity is fine when caching is off
        let result = AccessConfig::builder().caching(false).cache_max_entries(0).build();
        assert!(result.is_ok());
    }

    #[test]
    fn test_validation_warnings() {
        let (_, warnings) = AccessConfig::builder()
            .mode(ExecutionMode::Failover)
            .failover(false)
            .health_check_interval(Duration::from_secs(1))
            .build_with_warnings()
            .unwrap();

        assert_eq!(warnings.len(), 2);
        assert!(warnings.contains(&ConfigWarning::FailoverModeWithoutFailover));
    }

    #[test]
    fn test_retry_backoff() {
        let retry = RetryConfig {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
        };
        assert_eq!(retry.delay_for(0), Duration::from_millis(100));
        assert_eq!(retry.delay_for(1), Duration::from_millis(200));
        assert_eq!(retry.delay_for(2), Duration::from_millis(400));
        assert_eq!(retry.delay_for(3), Duration::from_millis(500));
    }

    #[test]
    fn test_retry_backoff_saturates_at_max_delay() {
        let retry = RetryConfig {
            max_retries: 12,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 1e200,
        };
        assert_eq!(retry.delay_for(0), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2), Duration::from_secs(2));
        assert_eq!(retry.delay_for(30), Duration::from_secs(2));

        let steep = RetryConfig {
            backoff_multiplier: 100.0,
            ..retry
        };
        assert_eq!(steep.delay_for(12), Duration::from_secs(2));
    }

    #[test]
    fn test_non_finite_backoff_rejected() {
        for multiplier in [f64::INFINITY, f64::NAN] {
            let result = AccessConfig::builder()
                .retry(RetryConfig {
                    backoff_multiplier: multiplier,
                    ..Default::default()
                })
                .build();
            assert!(matches!(result, Err(ConfigError::InvalidBackoffMultiplier(_))));
        }
    }

    #[test]
    fn test_deserialize_millisecond_durations() {
        let json = r#"{"request_timeout": 1500, "retry": {"initial_delay": " 20ms "}}"#;
        let config: AccessConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.retry.initial_delay, Duration::from_millis(20));

        let text = serde_json::to_value(&config).unwrap();
        assert_eq!(text["request_timeout"], "1s 500ms");

        let bad = serde_json::from_str::<AccessConfig>(r#"{"request_timeout": "soon"}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_deserialize_humantime() {
        let json = r#"{
            "mode": {"pinned": "time-series"},
            "request_timeout": "250ms",
            "pool_limits": {"relational": 8},
            "retry": {"max_retries": 1, "initial_delay": "10ms"},
            "health": {"check_interval": "1m"}
        }"#;
        let config: AccessConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.mode, ExecutionMode::Pinned(BackendKind::TimeSeries));
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.pool_limit_for(BackendKind::Relational), 8);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(10));
        assert_eq!(config.retry.max_delay, Duration::from_secs(2));
        assert_eq!(config.health.check_interval, Duration::from_secs(60));
        assert_eq!(config.health.timeout, Duration::from_secs(5));
        assert!(config.enable_caching);
    }

    #[test]
    fn test_serialize_roundtrips_durations() {
        let config = AccessConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["cache_ttl"], "5m");
        assert_eq!(json["mode"], "auto_route");
    }
}
