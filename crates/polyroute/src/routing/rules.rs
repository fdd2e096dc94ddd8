//! Routing rules.
//!
//! A [`RoutingRule`] pairs a predicate over a [`QueryDescriptor`] with a
//! target [`BackendKind`] and an integer priority. The router evaluates every
//! enabled rule and prefers the highest-priority match.
//!
//! # Built-in Rules
//!
//! | Rule | Matches | Target | Priority |
//! |------|---------|--------|----------|
//! | `transactional_requirement` | caller requires transactions | relational | 10 |
//! | `relational_joins` | any join clause | relational | 8 |
//! | `time_series_entity` | time-series entity name, no joins | time-series | 7 |
//! | `time_series_append` | append write of time-series-like data | time-series | 6 |
//! | `relational_analytics` | group-by, having or windows | relational | 5 |
//! | `temporal_filter` | temporal filter key, no joins | time-series | 4 |
//! | `relational_mutations` | update, delete or upsert | relational | 3 |
//!
//! None of them is a catch-all. A descriptor no rule matches is routed
//! through the fixed fallback order and flagged as ambiguous.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::core::BackendKind;
use crate::query::QueryDescriptor;

use super::analyzer::{self, QueryAnalyzer};

/// Predicate deciding whether a rule applies to a descriptor.
pub type RoutePredicate = Arc<dyn Fn(&QueryDescriptor) -> bool + Send + Sync>;

/// What kind of affinity a rule expresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// A declared feature requirement.
    FeatureRequirement,
    /// Work that only a relational engine does well.
    RelationalAffinity,
    /// Work shaped like time-series data.
    TimeSeriesAffinity,
    /// Append-optimized writes.
    WriteOptimized,
    /// Aggregations and analytics.
    Analytical,
    /// Caller-defined.
    Custom,
}

/// A routing rule.
#[derive(Clone)]
pub struct RoutingRule {
    /// Unique rule name.
    pub name: String,

    /// Backend kind this rule routes to.
    pub target: BackendKind,

    /// Affinity expressed by the rule.
    pub strategy: RoutingStrategy,

    /// Priority (higher = stronger).
    pub priority: u8,

    /// Whether the rule participates in routing.
    pub enabled: bool,

    /// Human-readable description.
    pub description: String,

    predicate: RoutePredicate,
}

impl RoutingRule {
    /// Creates an enabled custom rule with priority 1.
    pub fn new<F>(name: impl Into<String>, target: BackendKind, predicate: F) -> Self
    where
        F: Fn(&QueryDescriptor) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            target,
            strategy: RoutingStrategy::Custom,
            priority: 1,
            enabled: true,
            description: String::new(),
            predicate: Arc::new(predicate),
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the strategy.
    pub fn with_strategy(mut self, strategy: RoutingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Returns true if the rule is enabled and its predicate holds.
    pub fn matches(&self, query: &QueryDescriptor) -> bool {
        self.enabled && (self.predicate)(query)
    }
}

impl fmt::Debug for RoutingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingRule")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("strategy", &self.strategy)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

/// Returns the built-in routing rules.
pub fn default_routing_rules(analyzer: &QueryAnalyzer) -> Vec<RoutingRule> {
    let ts_entity = analyzer.clone();
    let ts_append = analyzer.clone();

    vec![
        RoutingRule::new("transactional_requirement", BackendKind::Relational, |q| {
            q.requires_feature("transactions")
        })
        .with_priority(10)
        .with_strategy(RoutingStrategy::FeatureRequirement)
        .with_description("transactions are only available on relational engines"),
        RoutingRule::new("relational_joins", BackendKind::Relational, |q| {
            q.has_joins()
        })
        .with_priority(8)
        .with_strategy(RoutingStrategy::RelationalAffinity)
        .with_description("cross-entity joins"),
        RoutingRule::new("time_series_entity", BackendKind::TimeSeries, move |q| {
            !q.has_joins() && ts_entity.is_time_series_entity(&q.entity)
        })
        .with_priority(7)
        .with_strategy(RoutingStrategy::TimeSeriesAffinity)
        .with_description("entity named like a time-series table"),
        RoutingRule::new("time_series_append", BackendKind::TimeSeries, move |q| {
            analyzer::is_append_write(q)
                && !q.requires_feature("transactions")
                && ts_append.is_time_series_like(q)
        })
        .with_priority(6)
        .with_strategy(RoutingStrategy::WriteOptimized)
        .with_description("append writes of time-series data"),
        RoutingRule::new("relational_analytics", BackendKind::Relational, |q| {
            q.has_aggregation() || !q.windows.is_empty()
        })
        .with_priority(5)
        .with_strategy(RoutingStrategy::Analytical)
        .with_description("group-by, having and window functions"),
        RoutingRule::new("temporal_filter", BackendKind::TimeSeries, |q| {
            !q.has_joins() && analyzer::has_temporal_filter(q)
        })
        .with_priority(4)
        .with_strategy(RoutingStrategy::TimeSeriesAffinity)
        .with_description("filters on a temporal column"),
        RoutingRule::new("relational_mutations", BackendKind::Relational, |q| {
            q.operation.is_mutation()
        })
        .with_priority(3)
        .with_strategy(RoutingStrategy::RelationalAffinity)
        .with_description("updates and deletes of existing rows"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{FilterValue, JoinClause};

    fn rule(rules: &[RoutingRule], name: &str) -> RoutingRule {
        rules.iter().find(|r| r.name == name).cloned().unwrap()
    }

    #[test]
    fn test_default_rules_are_unique_and_enabled() {
        let rules = default_routing_rules(&QueryAnalyzer::new());
        assert_eq!(rules.len(), 7);
        for r in &rules {
            assert!(r.enabled);
            assert_eq!(rules.iter().filter(|o| o.name == r.name).count(), 1);
        }
    }

    #[test]
    fn test_time_series_entity_rule() {
        let rules = default_routing_rules(&QueryAnalyzer::new());
        let r = rule(&rules, "time_series_entity");

        assert!(r.matches(&QueryDescriptor::read("tick_data")));
        assert!(!r.matches(&QueryDescriptor::read("orders")));
        assert!(!r.matches(&QueryDescriptor::read("tick_data").with_join(JoinClause::inner("symbols"))));
    }

    #[test]
    fn test_temporal_filter_rule() {
        let rules = default_routing_rules(&QueryAnalyzer::new());
        let r = rule(&rules, "temporal_filter");

        let query = QueryDescriptor::read("positions")
            .with_filter("snapshot_date", FilterValue::gte("2024-01-01"));
        assert!(r.matches(&query));
        assert!(!r.matches(&QueryDescriptor::read("positions")));
    }

    #[test]
    fn test_disabled_rule_never_matches() {
        let rules = default_routing_rules(&QueryAnalyzer::new());
        let mut r = rule(&rules, "relational_joins");
        let query = QueryDescriptor::read("orders").with_join(JoinClause::inner("users"));
        assert!(r.matches(&query));

        r.enabled = false;
        assert!(!r.matches(&query));
    }

    #[test]
    fn test_custom_rule_builder() {
        let r = RoutingRule::new("audit_to_custom", BackendKind::Custom("ledger"), |q| {
            q.entity.starts_with("audit_")
        })
        .with_priority(9)
        .with_description("audit trail");

        assert_eq!(r.strategy, RoutingStrategy::Custom);
        assert_eq!(r.priority, 9);
        assert!(r.matches(&QueryDescriptor::read("audit_log")));
        assert!(format!("{:?}", r).contains("audit_to_custom"));
    }
}
