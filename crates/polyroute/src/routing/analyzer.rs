//! Query feature detection and analysis.
//!
//! This module provides the pure heuristics the router and the optimizer use
//! to classify a [`QueryDescriptor`].
//!
//! # Feature Detection Rules
//!
//! | Feature | Detection |
//! |---------|-----------|
//! | TimeSeriesEntity | Entity name contains a time-series token (`tick`, `kline`, `ohlc`, ...) |
//! | TemporalFilter | A filter key contains a temporal token (`timestamp`, `ts`, `date`, ...) |
//! | TagFilter | A filter key names a tag column (`symbol`, `exchange`, `device`, ...) |
//! | Join | Any join clause |
//! | Aggregation | Group-by or having clauses |
//! | Window | Any window function |
//! | AppendWrite | Insert or batch insert |
//! | Mutation | Update, delete, upsert or batch update |
//!
//! Names are split into lowercase tokens on `_`, `-`, `.` and camel-case
//! boundaries before matching, so `tick_data`, `TickData` and `market.ticks`
//! all classify as time-series entities while `orders` does not.

use std::collections::BTreeSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::query::{OperationKind, QueryDescriptor};

const TIME_SERIES_ENTITY_TOKENS: &[&str] = &[
    "tick", "ticks", "kline", "klines", "candle", "candles", "bar", "bars", "ohlc", "ohlcv",
    "quote", "quotes", "metric", "metrics", "timeseries", "ts", "minute", "minutely", "hourly",
    "daily", "intraday", "realtime", "telemetry", "sensor", "readings",
];

const TEMPORAL_KEY_TOKENS: &[&str] = &[
    "time", "timestamp", "ts", "date", "datetime", "at", "period", "epoch",
];

const TAG_KEY_TOKENS: &[&str] = &[
    "symbol", "ticker", "exchange", "market", "code", "tag", "tags", "device", "host", "sensor",
    "region", "instrument",
];

/// Features detected in a query descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryFeature {
    /// Entity name matches time-series naming.
    TimeSeriesEntity,
    /// Filters on a temporal column.
    TemporalFilter,
    /// Filters on a tag column.
    TagFilter,
    /// Range predicates.
    RangeFilter,
    /// Join clauses.
    Join,
    /// Group-by or having.
    Aggregation,
    /// Window functions.
    Window,
    /// Ordering.
    Sorting,
    /// Limit or offset.
    Pagination,
    /// Append-style write.
    AppendWrite,
    /// Rewrite of existing rows.
    Mutation,
    /// Caller requires transactions.
    RequiresTransaction,
}

impl QueryFeature {
    /// Returns true if this feature favors a time-series engine.
    pub fn favors_time_series(&self) -> bool {
        matches!(
            self,
            QueryFeature::TimeSeriesEntity | QueryFeature::TemporalFilter | QueryFeature::TagFilter
        )
    }

    /// Returns true if this feature favors a relational engine.
    pub fn favors_relational(&self) -> bool {
        matches!(
            self,
            QueryFeature::Join
                | QueryFeature::Aggregation
                | QueryFeature::Window
                | QueryFeature::Mutation
                | QueryFeature::RequiresTransaction
        )
    }
}

/// Coarse complexity classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryComplexity {
    /// Single-entity filter or write.
    Simple,
    /// One structural clause beyond filtering.
    Moderate,
    /// Joins combined with aggregation or windows.
    Complex,
}

impl QueryComplexity {
    /// Classifies a complexity score.
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=2 => QueryComplexity::Simple,
            3..=4 => QueryComplexity::Moderate,
            _ => QueryComplexity::Complex,
        }
    }
}

/// Result of analyzing a descriptor.
#[derive(Debug, Clone)]
pub struct QueryAnalysis {
    /// All detected features.
    pub features: BTreeSet<QueryFeature>,

    /// Estimated complexity score (1-10).
    pub complexity_score: u8,

    /// Complexity class derived from the score.
    pub complexity: QueryComplexity,

    /// Filter keys classified as temporal.
    pub temporal_keys: Vec<String>,

    /// Filter keys classified as tags.
    pub tag_keys: Vec<String>,
}

impl QueryAnalysis {
    /// Returns true if the feature was detected.
    pub fn has(&self, feature: QueryFeature) -> bool {
        self.features.contains(&feature)
    }

    /// Returns true if the descriptor looks like time-series work.
    pub fn is_time_series_like(&self) -> bool {
        self.has(QueryFeature::TimeSeriesEntity) || self.has(QueryFeature::TemporalFilter)
    }
}

/// Detects features in query descriptors.
#[derive(Debug, Clone, Default)]
pub struct QueryAnalyzer {
    /// Extra entity patterns classified as time-series.
    entity_patterns: Vec<Regex>,
}

impl QueryAnalyzer {
    /// Creates an analyzer using only the built-in token lists.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a regular expression matched against entity names.
    pub fn with_entity_pattern(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.entity_patterns.push(Regex::new(pattern)?);
        Ok(self)
    }

    /// Analyzes a descriptor.
    pub fn analyze(&self, query: &QueryDescriptor) -> QueryAnalysis {
        let mut features = BTreeSet::new();
        let mut temporal_keys = Vec::new();
        let mut tag_keys = Vec::new();

        if self.is_time_series_entity(&query.entity) {
            features.insert(QueryFeature::TimeSeriesEntity);
        }

        for (key, filter) in &query.filters {
            if is_temporal_key(key) {
                features.insert(QueryFeature::TemporalFilter);
                temporal_keys.push(key.clone());
            } else if is_tag_key(key) {
                features.insert(QueryFeature::TagFilter);
                tag_keys.push(key.clone());
            }
            if filter.op().is_range() {
                features.insert(QueryFeature::RangeFilter);
            }
        }

        if query.has_joins() {
            features.insert(QueryFeature::Join);
        }
        if query.has_aggregation() {
            features.insert(QueryFeature::Aggregation);
        }
        if !query.windows.is_empty() {
            features.insert(QueryFeature::Window);
        }
        if !query.order_by.is_empty() {
            features.insert(QueryFeature::Sorting);
        }
        if query.limit.is_some() || query.offset.is_some() {
            features.insert(QueryFeature::Pagination);
        }
        if query.operation.is_append() {
            features.insert(QueryFeature::AppendWrite);
        }
        if query.operation.is_mutation() {
            features.insert(QueryFeature::Mutation);
        }
        if query.requires_feature("transactions") {
            features.insert(QueryFeature::RequiresTransaction);
        }

        let complexity_score = calculate_complexity(query);

        QueryAnalysis {
            features,
            complexity_score,
            complexity: QueryComplexity::from_score(complexity_score),
            temporal_keys,
            tag_keys,
        }
    }

    /// Returns true if the entity name matches time-series naming.
    pub fn is_time_series_entity(&self, entity: &str) -> bool {
        tokens(entity)
            .iter()
            .any(|t| TIME_SERIES_ENTITY_TOKENS.contains(&t.as_str()))
            || self.entity_patterns.iter().any(|p| p.is_match(entity))
    }

    /// Returns true if the descriptor looks like time-series work.
    pub fn is_time_series_like(&self, query: &QueryDescriptor) -> bool {
        self.is_time_series_entity(&query.entity) || has_temporal_filter(query)
    }
}

/// Returns true if a column name looks temporal.
pub fn is_temporal_key(key: &str) -> bool {
    tokens(key)
        .iter()
        .any(|t| TEMPORAL_KEY_TOKENS.contains(&t.as_str()))
}

/// Returns true if a column name looks like a time-series tag.
pub fn is_tag_key(key: &str) -> bool {
    tokens(key)
        .iter()
        .any(|t| TAG_KEY_TOKENS.contains(&t.as_str()))
}

/// Returns true if any filter key is temporal.
pub fn has_temporal_filter(query: &QueryDescriptor) -> bool {
    query.filters.keys().any(|k| is_temporal_key(k))
}

/// Returns true if the operation is an append-style write.
pub fn is_append_write(query: &QueryDescriptor) -> bool {
    query.operation.is_append()
}

/// Returns true for append writes that are not part of a transaction.
pub fn is_bulk_append(query: &QueryDescriptor) -> bool {
    query.operation == OperationKind::BatchInsert && !query.requires_feature("transactions")
}

/// Calculates a complexity score (1-10).
pub fn calculate_complexity(query: &QueryDescriptor) -> u8 {
    let mut score = 1u8;

    let joins = u8::try_from(query.joins.len()).unwrap_or(u8::MAX);
    score = score.saturating_add(joins.saturating_mul(2));

    if !query.group_by.is_empty() {
        score = score.saturating_add(2);
    }
    if !query.having.is_empty() {
        score = score.saturating_add(1);
    }
    if !query.windows.is_empty() {
        score = score.saturating_add(2);
    }
    if !query.order_by.is_empty() {
        score = score.saturating_add(1);
    }
    if query.filters.len() > 3 {
        score = score.saturating_add(1);
    }

    score.min(10)
}

/// Splits an identifier into lowercase tokens.
fn tokens(name: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;

    for c in name.trim().chars() {
        if c == '_' || c == '-' || c == '.' || c.is_whitespace() {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        current.extend(c.to_lowercase());
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{FilterValue, JoinClause, WindowSpec};

    #[test]
    fn test_tokenize() {
        assert_eq!(tokens("tick_data"), vec!["tick", "data"]);
        assert_eq!(tokens("TickData"), vec!["tick", "data"]);
        assert_eq!(tokens("market.ticks"), vec!["market", "ticks"]);
        assert_eq!(tokens("min_timestamp"), vec!["min", "timestamp"]);
    }

    #[test]
    fn test_detect_time_series_entity() {
        let analyzer = QueryAnalyzer::new();
        assert!(analyzer.is_time_series_entity("tick_data"));
        assert!(analyzer.is_time_series_entity("kline_1m"));
        assert!(analyzer.is_time_series_entity("daily_bars"));
        assert!(!analyzer.is_time_series_entity("orders"));
        assert!(!analyzer.is_time_series_entity("users"));
    }

    #[test]
    fn test_custom_entity_pattern() {
        let analyzer = QueryAnalyzer::new()
            .with_entity_pattern("^snap_.*")
            .unwrap();
        assert!(analyzer.is_time_series_entity("snap_positions"));
        assert!(QueryAnalyzer::new().with_entity_pattern("(").is_err());
    }

    #[test]
    fn test_temporal_and_tag_keys() {
        assert!(is_temporal_key("min_timestamp"));
        assert!(is_temporal_key("created_at"));
        assert!(is_temporal_key("trade_date"));
        assert!(!is_temporal_key("status"));
        assert!(!is_temporal_key("category"));

        assert!(is_tag_key("symbol"));
        assert!(is_tag_key("exchange_code"));
        assert!(!is_tag_key("price"));
    }

    #[test]
    fn test_analyze_tick_query() {
        let query = QueryDescriptor::read("tick_data")
            .with_filter("symbol", FilterValue::eq("AAPL"))
            .with_filter("min_timestamp", FilterValue::gte("2024-01-01T00:00:00Z"));

        let analysis = QueryAnalyzer::new().analyze(&query);
        assert!(analysis.has(QueryFeature::TimeSeriesEntity));
        assert!(analysis.has(QueryFeature::TemporalFilter));
        assert!(analysis.has(QueryFeature::TagFilter));
        assert!(analysis.has(QueryFeature::RangeFilter));
        assert!(analysis.is_time_series_like());
        assert_eq!(analysis.temporal_keys, vec!["min_timestamp"]);
        assert_eq!(analysis.tag_keys, vec!["symbol"]);
        assert_eq!(analysis.complexity, QueryComplexity::Simple);
    }

    #[test]
    fn test_complexity_score() {
        let simple = QueryDescriptor::read("orders");
        assert_eq!(calculate_complexity(&simple), 1);

        let join_group = QueryDescriptor::read("orders")
            .with_join(JoinClause::inner("users"))
            .with_group_by(["users.id"]);
        assert_eq!(calculate_complexity(&join_group), 5);
        assert_eq!(
            QueryAnalyzer::new().analyze(&join_group).complexity,
            QueryComplexity::Complex
        );

        let windowed = QueryDescriptor::read("orders").with_window(WindowSpec {
            function: "row_number".to_string(),
            partition_by: vec!["user_id".to_string()],
            order_by: vec![],
        });
        assert_eq!(
            QueryAnalyzer::new().analyze(&windowed).complexity,
            QueryComplexity::Moderate
        );
    }

    #[test]
    fn test_complexity_is_capped() {
        let mut query = QueryDescriptor::read("orders");
        for i in 0..10 {
            query = query.with_join(JoinClause::inner(format!("t{}", i)));
        }
        assert_eq!(calculate_complexity(&query), 10);
    }

    #[test]
    fn test_write_features() {
        let insert = QueryDescriptor::insert(
            "tick_data",
            vec![serde_json::json!({"v": 1}), serde_json::json!({"v": 2})],
        );
        let analysis = QueryAnalyzer::new().analyze(&insert);
        assert!(analysis.has(QueryFeature::AppendWrite));
        assert!(is_bulk_append(&insert));
        assert!(!is_bulk_append(&insert.clone().requiring("transactions")));
    }
}
