//! Backend executor abstraction.
//!
//! This module defines the [`BackendExecutor`] trait, the uniform contract
//! every storage engine adapter implements so the router and access manager
//! can treat relational and time-series engines interchangeably.

use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::core::capabilities::CapabilityProfile;
use crate::error::{BackendError, BackendResult};
use crate::query::{QueryDescriptor, QueryResult};

/// Identifies the family of a storage engine.
///
/// Routing decisions, capability profiles and pool limits are all keyed by
/// kind. Several executors may share one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendKind {
    /// General-purpose relational engine (joins, transactions, window functions).
    Relational,
    /// Append-optimized time-series engine (super tables, tag indexes).
    TimeSeries,
    /// Custom or unknown engine.
    Custom(&'static str),
}

impl BackendKind {
    /// Fixed fallback order used when no routing rule matches.
    pub const FALLBACK_ORDER: [BackendKind; 2] = [BackendKind::Relational, BackendKind::TimeSeries];

    /// Returns true for kinds with a built-in baseline profile.
    pub fn is_builtin(&self) -> bool {
        !matches!(self, BackendKind::Custom(_))
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Relational => write!(f, "relational"),
            BackendKind::TimeSeries => write!(f, "time-series"),
            BackendKind::Custom(name) => write!(f, "{}", name),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "relational" | "postgres" | "postgresql" => Ok(BackendKind::Relational),
            "time-series" | "timeseries" | "time_series" | "tdengine" => Ok(BackendKind::TimeSeries),
            other => Err(format!("unknown backend kind: {}", other)),
        }
    }
}

impl Serialize for BackendKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Only built-in kinds can be deserialized; custom kinds are registered in code.
impl<'de> Deserialize<'de> for BackendKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Connection settings shared by executor implementations.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Connection string or URL.
    pub connection_string: String,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            max_connections: 10,
            connect_timeout_ms: 5000,
        }
    }
}

impl ExecutorConfig {
    /// Creates a new configuration with the given connection string.
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            ..Default::default()
        }
    }

    /// Sets the maximum number of connections.
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the connection timeout.
    pub fn with_connect_timeout_ms(mut self, timeout: u64) -> Self {
        self.connect_timeout_ms = timeout;
        self
    }
}

/// Connection pool statistics reported by an executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Connections currently executing work.
    pub active: u32,
    /// Idle connections.
    pub idle: u32,
    /// Maximum pool size.
    pub max: u32,
    /// Callers waiting for a connection.
    pub pending: u32,
}

impl PoolStats {
    /// Fraction of the pool in use, in `[0, 1]`.
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (self.active as f64 / self.max as f64).min(1.0)
    }
}

/// An adapter that executes descriptors against one storage engine instance.
///
/// Implementations must be safe to call concurrently. Transaction methods
/// default to [`BackendError::UnsupportedCapability`]; engines that support
/// transactions override all four.
///
/// # Example
///
/// ```ignore
/// use polyroute::core::{BackendExecutor, BackendKind};
///
/// if executor.supports_feature("window_functions") {
///     // Push the window down
/// }
/// let result = executor.execute_query(&descriptor).await?;
/// ```
#[async_trait]
pub trait BackendExecutor: Send + Sync + Debug {
    /// Unique identifier of this instance.
    fn id(&self) -> &str;

    /// Returns the kind of engine.
    fn kind(&self) -> BackendKind;

    /// Opens the connection pool.
    async fn connect(&self) -> BackendResult<()>;

    /// Closes the connection pool.
    async fn disconnect(&self) -> BackendResult<()>;

    /// Returns true while the pool is open.
    fn is_connected(&self) -> bool;

    /// Executes a descriptor.
    async fn execute_query(&self, query: &QueryDescriptor) -> BackendResult<QueryResult>;

    /// Introspects the engine's capabilities.
    fn capabilities(&self) -> BackendResult<CapabilityProfile>;

    /// Probes the engine. Returns false rather than erroring.
    async fn health_check(&self) -> bool;

    /// Returns current pool statistics.
    fn pool_stats(&self) -> PoolStats;

    /// Checks a named feature against the introspected profile.
    fn supports_feature(&self, feature: &str) -> bool {
        self.capabilities()
            .map(|profile| profile.supports(feature))
            .unwrap_or(false)
    }

    /// Begins a transaction and returns the engine's transaction id.
    async fn begin_transaction(&self) -> BackendResult<String> {
        Err(self.unsupported("transactions"))
    }

    /// Executes a descriptor inside an open transaction.
    async fn execute_in_transaction(
        &self,
        transaction_id: &str,
        query: &QueryDescriptor,
    ) -> BackendResult<QueryResult> {
        let _ = (transaction_id, query);
        Err(self.unsupported("transactions"))
    }

    /// Commits a transaction.
    async fn commit_transaction(&self, transaction_id: &str) -> BackendResult<()> {
        let _ = transaction_id;
        Err(self.unsupported("transactions"))
    }

    /// Rolls back a transaction.
    async fn rollback_transaction(&self, transaction_id: &str) -> BackendResult<()> {
        let _ = transaction_id;
        Err(self.unsupported("transactions"))
    }

    /// Builds an unsupported-capability error naming this executor.
    fn unsupported(&self, capability: &str) -> BackendError {
        BackendError::UnsupportedCapability {
            backend_name: self.id().to_string(),
            capability: capability.to_string(),
        }
    }
}

/// Shared, dynamically dispatched executor.
pub type DynExecutor = Arc<dyn BackendExecutor>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_display() {
        assert_eq!(BackendKind::Relational.to_string(), "relational");
        assert_eq!(BackendKind::TimeSeries.to_string(), "time-series");
        assert_eq!(BackendKind::Custom("document").to_string(), "document");
    }

    #[test]
    fn test_backend_kind_from_str() {
        assert_eq!("relational".parse::<BackendKind>(), Ok(BackendKind::Relational));
        assert_eq!("TimeSeries".parse::<BackendKind>(), Ok(BackendKind::TimeSeries));
        assert!("graph".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_backend_kind_serializes_as_string() {
        let json = serde_json::to_string(&BackendKind::TimeSeries).unwrap();
        assert_eq!(json, "\"time-series\"");
    }

    #[test]
    fn test_pool_stats_utilization() {
        let stats = PoolStats {
            active: 5,
            idle: 5,
            max: 10,
            pending: 0,
        };
        assert!((stats.utilization() - 0.5).abs() < f64::EPSILON);
        assert_eq!(PoolStats::default().utilization(), 0.0);
    }

    #[test]
    fn test_executor_config_builder() {
        let config = ExecutorConfig::new("taos://localhost:6030")
            .with_max_connections(20)
            .with_connect_timeout_ms(10000);

        assert_eq!(config.connection_string, "taos://localhost:6030");
        assert_eq!(config.max_connections, 20);
        assert_eq!(config.connect_timeout_ms, 10000);
    }
}
