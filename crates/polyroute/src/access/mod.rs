//! Caller-facing access layer.
//!
//! - [`config`] - access configuration, retry and health settings
//! - [`cache`] - TTL-bounded result cache with entity invalidation
//! - [`metrics`] - request, cache, failover and per-backend counters
//! - [`manager`] - the [`AccessManager`] facade

pub mod cache;
pub mod config;
pub mod manager;
pub mod metrics;

pub use cache::{CacheStats, ResultCache};
pub use config::{
    AccessConfig, AccessConfigBuilder, ConfigError, ConfigWarning, ExecutionMode, HealthConfig,
    RetryConfig,
};
pub use manager::{AccessManager, TransactionHandle};
pub use metrics::{AccessMetrics, BackendUsage, MetricsSnapshot};
