//! Backend capability profiles and the capability registry.
//!
//! A [`CapabilityProfile`] is a static description of what an engine kind can
//! do, grouped by [`FeatureCategory`], together with its limitations,
//! performance characteristics and recommended configuration. The
//! [`CapabilityRegistry`] hands out profiles by kind, introspecting a
//! registered executor when one exists and falling back to baseline profiles
//! otherwise. It never fails: an engine that cannot be introspected gets a
//! minimal profile carrying a warning limitation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::backend::{BackendKind, DynExecutor};
use crate::query::OperationKind;

/// Feature categories used to group capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureCategory {
    /// Transaction semantics.
    Transactions,
    /// Concurrency control.
    Concurrency,
    /// Index structures.
    Indexing,
    /// Supported data types.
    DataTypes,
    /// Query language features.
    QueryFeatures,
    /// Schema and storage layout features.
    SchemaFeatures,
    /// Security features.
    Security,
}

impl std::fmt::Display for FeatureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FeatureCategory::Transactions => "transactions",
            FeatureCategory::Concurrency => "concurrency",
            FeatureCategory::Indexing => "indexing",
            FeatureCategory::DataTypes => "data_types",
            FeatureCategory::QueryFeatures => "query_features",
            FeatureCategory::SchemaFeatures => "schema_features",
            FeatureCategory::Security => "security",
        };
        write!(f, "{}", name)
    }
}

/// Qualitative performance level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceLevel {
    /// Not supported or very slow.
    Poor,
    /// Acceptable.
    Moderate,
    /// Good.
    High,
    /// Best in class.
    Excellent,
}

/// Static description of an engine kind's capabilities.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityProfile {
    /// Engine kind.
    pub kind: BackendKind,
    /// Engine version, if known.
    pub version: String,
    /// Supported features grouped by category.
    pub features: BTreeMap<FeatureCategory, BTreeSet<String>>,
    /// Known limitations.
    pub limitations: Vec<String>,
    /// Performance characteristics keyed by workload.
    pub performance: BTreeMap<String, PerformanceLevel>,
    /// Recommended configuration values.
    pub recommended_config: BTreeMap<String, String>,
}

impl CapabilityProfile {
    /// Creates an empty profile.
    pub fn new(kind: BackendKind, version: impl Into<String>) -> Self {
        Self {
            kind,
            version: version.into(),
            features: BTreeMap::new(),
            limitations: Vec::new(),
            performance: BTreeMap::new(),
            recommended_config: BTreeMap::new(),
        }
    }

    /// Adds features under a category.
    pub fn with_features<I, S>(mut self, category: FeatureCategory, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features
            .entry(category)
            .or_default()
            .extend(features.into_iter().map(Into::into));
        self
    }

    /// Adds a limitation.
    pub fn with_limitation(mut self, limitation: impl Into<String>) -> Self {
        self.limitations.push(limitation.into());
        self
    }

    /// Sets a performance characteristic.
    pub fn with_performance(mut self, workload: impl Into<String>, level: PerformanceLevel) -> Self {
        self.performance.insert(workload.into(), level);
        self
    }

    /// Sets a recommended configuration value.
    pub fn with_recommended(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.recommended_config.insert(key.into(), value.into());
        self
    }

    /// Baseline profile for a relational engine.
    pub fn relational() -> Self {
        Self::new(BackendKind::Relational, "baseline")
            .with_features(FeatureCategory::Transactions, ["acid", "transactions", "savepoints"])
            .with_features(FeatureCategory::Concurrency, ["mvcc", "row_locking"])
            .with_features(
                FeatureCategory::Indexing,
                ["btree", "hash", "gin", "secondary_indexes", "composite_indexes"],
            )
            .with_features(
                FeatureCategory::DataTypes,
                ["json", "arrays", "numeric", "timestamp", "uuid"],
            )
            .with_features(
                FeatureCategory::QueryFeatures,
                [
                    "joins",
                    "subqueries",
                    "window_functions",
                    "cte",
                    "group_by",
                    "row_updates",
                    "upsert",
                ],
            )
            .with_features(FeatureCategory::SchemaFeatures, ["partitioning", "foreign_keys"])
            .with_features(FeatureCategory::Security, ["row_level_security", "roles"])
            .with_limitation("append-heavy ingestion is slower than a dedicated time-series engine")
            .with_performance("point_lookup", PerformanceLevel::Excellent)
            .with_performance("complex_join", PerformanceLevel::Excellent)
            .with_performance("aggregation", PerformanceLevel::High)
            .with_performance("bulk_insert", PerformanceLevel::Moderate)
            .with_performance("time_range_scan", PerformanceLevel::Moderate)
            .with_recommended("max_connections", "20")
            .with_recommended("statement_timeout", "30s")
    }

    /// Baseline profile for a time-series engine.
    pub fn time_series() -> Self {
        Self::new(BackendKind::TimeSeries, "baseline")
            .with_features(FeatureCategory::Concurrency, ["high_write_throughput"])
            .with_features(FeatureCategory::Indexing, ["timestamp_index", "tag_index"])
            .with_features(
                FeatureCategory::DataTypes,
                ["timestamp", "numeric", "binary", "nchar"],
            )
            .with_features(
                FeatureCategory::QueryFeatures,
                ["time_window_aggregation", "interpolation", "downsampling", "group_by"],
            )
            .with_features(
                FeatureCategory::SchemaFeatures,
                ["super_tables", "automatic_partitioning", "retention_policies"],
            )
            .with_limitation("no cross-entity joins")
            .with_limitation("no multi-row transactions")
            .with_limitation("limited updates of existing rows")
            .with_limitation("secondary indexes only on tag columns")
            .with_performance("bulk_insert", PerformanceLevel::Excellent)
            .with_performance("time_range_scan", PerformanceLevel::Excellent)
            .with_performance("aggregation", PerformanceLevel::High)
            .with_performance("point_lookup", PerformanceLevel::Moderate)
            .with_performance("complex_join", PerformanceLevel::Poor)
            .with_recommended("batch_size", "1000")
            .with_recommended("keep_days", "3650")
    }

    /// Minimal profile for an engine that could not be described.
    pub fn minimal(kind: BackendKind, reason: impl Into<String>) -> Self {
        Self::new(kind, "unknown").with_limitation(format!("capabilities unknown: {}", reason.into()))
    }

    /// Baseline profile for a kind.
    pub fn baseline(kind: BackendKind) -> Self {
        match kind {
            BackendKind::Relational => Self::relational(),
            BackendKind::TimeSeries => Self::time_series(),
            BackendKind::Custom(name) => {
                Self::minimal(kind, format!("no baseline profile for '{}'", name))
            }
        }
    }

    /// Returns true if any category contains the named feature.
    pub fn supports(&self, feature: &str) -> bool {
        self.features.values().any(|set| set.contains(feature))
    }

    /// Returns true if the category contains the named feature.
    pub fn supports_in(&self, category: FeatureCategory, feature: &str) -> bool {
        self.features
            .get(&category)
            .is_some_and(|set| set.contains(feature))
    }

    /// Returns true if the engine declares transaction support.
    pub fn supports_transactions(&self) -> bool {
        self.supports_in(FeatureCategory::Transactions, "transactions")
    }

    /// Returns the performance level for a workload.
    pub fn performance_for(&self, workload: &str) -> Option<PerformanceLevel> {
        self.performance.get(workload).copied()
    }

    /// Returns true if this profile was produced because introspection failed.
    pub fn is_minimal(&self) -> bool {
        self.limitations
            .iter()
            .any(|l| l.starts_with("capabilities unknown"))
    }
}

/// Hands out capability profiles by backend kind.
///
/// Profiles are cached per kind and rebuilt on [`refresh`](Self::refresh).
/// When an executor is registered as the introspection source for a kind,
/// its [`capabilities`](crate::core::BackendExecutor::capabilities) result is
/// preferred over the baseline.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    profiles: RwLock<HashMap<BackendKind, Arc<CapabilityProfile>>>,
    sources: RwLock<HashMap<BackendKind, DynExecutor>>,
}

impl CapabilityRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an executor as the introspection source for its kind.
    ///
    /// The first executor registered for a kind wins.
    pub fn register_source(&self, executor: DynExecutor) {
        let kind = executor.kind();
        let mut sources = self.sources.write();
        if !sources.contains_key(&kind) {
            debug!(kind = %kind, executor = executor.id(), "registered capability source");
            sources.insert(kind, executor);
            self.profiles.write().remove(&kind);
        }
    }

    /// Returns the capability profile for a kind.
    pub fn describe(&self, kind: BackendKind) -> Arc<CapabilityProfile> {
        if let Some(profile) = self.profiles.read().get(&kind) {
            return profile.clone();
        }

        let profile = Arc::new(self.build_profile(kind));
        self.profiles.write().insert(kind, profile.clone());
        profile
    }

    /// Rebuilds the cached profile for a kind.
    pub fn refresh(&self, kind: BackendKind) -> Arc<CapabilityProfile> {
        let profile = Arc::new(self.build_profile(kind));
        self.profiles.write().insert(kind, profile.clone());
        profile
    }

    /// Rebuilds every cached or sourced profile.
    pub fn refresh_all(&self) {
        let mut kinds: Vec<BackendKind> = self.profiles.read().keys().copied().collect();
        for kind in self.sources.read().keys() {
            if !kinds.contains(kind) {
                kinds.push(*kind);
            }
        }
        for kind in kinds {
            self.refresh(kind);
        }
    }

    /// Returns true if the named feature appears in any category of the profile.
    pub fn is_feature_supported(profile: &CapabilityProfile, feature: &str) -> bool {
        profile.supports(feature)
    }

    /// Kind-specific advice for running an operation against a profile.
    pub fn recommendations_for(
        profile: &CapabilityProfile,
        operation: OperationKind,
    ) -> Vec<String> {
        let mut advice = Vec::new();

        match profile.kind {
            BackendKind::TimeSeries => {
                if operation.is_append() {
                    let batch = profile
                        .recommended_config
                        .get("batch_size")
                        .map(String::as_str)
                        .unwrap_or("1000");
                    advice.push(format!("batch inserts in groups of {} rows", batch));
                    advice.push("write through the super table with tag values".to_string());
                }
                if operation == OperationKind::Read {
                    advice.push("bound reads with a timestamp range to prune partitions".to_string());
                    advice.push("filter on tag columns to use the tag index".to_string());
                }
                if operation.is_mutation() {
                    advice.push(
                        "prefer re-inserting rows with the same timestamp over updates".to_string(),
                    );
                }
            }
            BackendKind::Relational => {
                if operation == OperationKind::Read {
                    advice.push("index columns used in filters and join keys".to_string());
                    advice.push("project only the needed columns".to_string());
                }
                if operation.is_append() {
                    advice.push("use multi-row inserts inside a transaction".to_string());
                }
                if operation.is_mutation() {
                    advice.push("filter mutations on indexed columns to avoid table locks".to_string());
                }
            }
            BackendKind::Custom(_) => {}
        }

        if profile.is_minimal() {
            advice.push("capabilities unknown; only basic reads and writes are assumed".to_string());
        }

        advice
    }

    fn build_profile(&self, kind: BackendKind) -> CapabilityProfile {
        let source = self.sources.read().get(&kind).cloned();
        match source {
            Some(executor) => match executor.capabilities() {
                Ok(profile) => profile,
                Err(e) => {
                    warn!(kind = %kind, executor = executor.id(), error = %e, "capability introspection failed");
                    CapabilityProfile::minimal(kind, e.to_string())
                }
            },
            None => CapabilityProfile::baseline(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relational_baseline() {
        let profile = CapabilityProfile::relational();
        assert!(profile.supports_transactions());
        assert!(profile.supports("joins"));
        assert!(profile.supports("window_functions"));
        assert!(profile.supports_in(FeatureCategory::Indexing, "btree"));
        assert!(!profile.is_minimal());
    }

    #[test]
    fn test_time_series_baseline() {
        let profile = CapabilityProfile::time_series();
        assert!(!profile.supports_transactions());
        assert!(!profile.supports("joins"));
        assert!(profile.supports("super_tables"));
        assert!(profile.supports_in(FeatureCategory::Indexing, "tag_index"));
        assert!(profile.limitations.iter().any(|l| l.contains("joins")));
        assert_eq!(
            profile.performance_for("bulk_insert"),
            Some(PerformanceLevel::Excellent)
        );
    }

    #[test]
    fn test_custom_kind_gets_minimal_profile() {
        let registry = CapabilityRegistry::new();
        let profile = registry.describe(BackendKind::Custom("graph"));
        assert!(profile.is_minimal());
        assert!(profile.features.is_empty());
        assert!(!profile.supports("basic_read"));
    }

    #[test]
    fn test_failed_introspection_claims_no_features() {
        let executor = Arc::new(crate::backends::MemoryExecutor::new(
            "pg-1",
            BackendKind::Relational,
        ));
        executor.set_introspection_fails(true);

        let registry = CapabilityRegistry::new();
        registry.register_source(executor);
        let profile = registry.describe(BackendKind::Relational);

        assert!(profile.is_minimal());
        assert!(profile.features.is_empty());
        assert!(!profile.supports_transactions());
        assert_eq!(profile.limitations.len(), 1);
    }

    #[test]
    fn test_describe_caches_profiles() {
        let registry = CapabilityRegistry::new();
        let first = registry.describe(BackendKind::Relational);
        let second = registry.describe(BackendKind::Relational);
        assert!(Arc::ptr_eq(&first, &second));

        let refreshed = registry.refresh(BackendKind::Relational);
        assert!(!Arc::ptr_eq(&first, &refreshed));
        assert_eq!(*first, *refreshed);
    }

    #[test]
    fn test_recommendations_by_kind() {
        let ts = CapabilityProfile::time_series();
        let advice = CapabilityRegistry::recommendations_for(&ts, OperationKind::BatchInsert);
        assert!(advice.iter().any(|a| a.contains("1000")));

        let rel = CapabilityProfile::relational();
        let advice = CapabilityRegistry::recommendations_for(&rel, OperationKind::Read);
        assert!(advice.iter().any(|a| a.contains("join keys")));

        let minimal = CapabilityProfile::minimal(BackendKind::Custom("x"), "boom");
        let advice = CapabilityRegistry::recommendations_for(&minimal, OperationKind::Read);
        assert!(advice.iter().any(|a| a.contains("capabilities unknown")));
    }

    #[test]
    fn test_feature_lookup_helper() {
        let profile = CapabilityProfile::relational();
        assert!(CapabilityRegistry::is_feature_supported(&profile, "mvcc"));
        assert!(!CapabilityRegistry::is_feature_supported(&profile, "super_tables"));
    }
}
