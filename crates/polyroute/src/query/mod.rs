//! Backend-neutral query descriptors.
//!
//! A [`QueryDescriptor`] is the unit of work that flows through the
//! optimizer, the router and finally a backend executor. It describes the
//! operation, the target entity and every clause the router and optimizer
//! inspect, and it carries two pieces of bookkeeping that only the optimizer
//! writes: planner [`QueryHint`]s and an optimization lineage.
//!
//! # Example
//!
//! ```
//! use polyroute::query::{FilterValue, JoinClause, QueryDescriptor};
//!
//! let query = QueryDescriptor::read("orders")
//!     .with_join(JoinClause::inner("users"))
//!     .with_group_by(["users.id"])
//!     .with_filter("status", FilterValue::eq("shipped"));
//!
//! assert!(query.has_joins());
//! assert_eq!(query.cache_key(), query.clone().cache_key());
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// The kind of operation a descriptor performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Read rows.
    Read,
    /// Insert a single row.
    Insert,
    /// Update matching rows.
    Update,
    /// Delete matching rows.
    Delete,
    /// Insert or update a single row.
    Upsert,
    /// Insert many rows.
    BatchInsert,
    /// Update many rows.
    BatchUpdate,
}

impl OperationKind {
    /// Returns true for operations that mutate data.
    pub fn is_write(&self) -> bool {
        !matches!(self, OperationKind::Read)
    }

    /// Returns true for append-style writes.
    pub fn is_append(&self) -> bool {
        matches!(self, OperationKind::Insert | OperationKind::BatchInsert)
    }

    /// Returns true for operations that rewrite existing rows.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            OperationKind::Update
                | OperationKind::Delete
                | OperationKind::Upsert
                | OperationKind::BatchUpdate
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Read => "read",
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Upsert => "upsert",
            OperationKind::BatchInsert => "batch_insert",
            OperationKind::BatchUpdate => "batch_update",
        };
        write!(f, "{}", name)
    }
}

/// Comparison operators usable in a [`Predicate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonOp {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Membership in an array value.
    In,
    /// SQL-style pattern with `%` wildcards.
    Like,
}

impl ComparisonOp {
    /// Returns true for range operators.
    pub fn is_range(&self) -> bool {
        matches!(
            self,
            ComparisonOp::Gt | ComparisonOp::Gte | ComparisonOp::Lt | ComparisonOp::Lte
        )
    }
}

/// A filter with an explicit comparison operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    /// The operator.
    pub op: ComparisonOp,
    /// The operand.
    pub value: Value,
}

/// A filter value: either a plain equality or an explicit predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    /// Explicit predicate.
    Predicate(Predicate),
    /// Equality against a scalar.
    Eq(Value),
}

impl FilterValue {
    /// Equality filter.
    pub fn eq(value: impl Into<Value>) -> Self {
        FilterValue::Eq(value.into())
    }

    /// Predicate filter.
    pub fn predicate(op: ComparisonOp, value: impl Into<Value>) -> Self {
        FilterValue::Predicate(Predicate {
            op,
            value: value.into(),
        })
    }

    /// Greater-or-equal filter.
    pub fn gte(value: impl Into<Value>) -> Self {
        Self::predicate(ComparisonOp::Gte, value)
    }

    /// Less-than filter.
    pub fn lt(value: impl Into<Value>) -> Self {
        Self::predicate(ComparisonOp::Lt, value)
    }

    /// Returns the effective operator.
    pub fn op(&self) -> ComparisonOp {
        match self {
            FilterValue::Eq(_) => ComparisonOp::Eq,
            FilterValue::Predicate(p) => p.op,
        }
    }

    /// Returns the operand.
    pub fn value(&self) -> &Value {
        match self {
            FilterValue::Eq(v) => v,
            FilterValue::Predicate(p) => &p.value,
        }
    }

    /// Returns true if a row value satisfies this filter.
    pub fn matches(&self, candidate: Option<&Value>) -> bool {
        let Some(candidate) = candidate else {
            return false;
        };
        let operand = self.value();
        match self.op() {
            ComparisonOp::Eq => values_equal(candidate, operand),
            ComparisonOp::Ne => !values_equal(candidate, operand),
            ComparisonOp::Gt => compare_values(candidate, operand).is_some_and(|o| o.is_gt()),
            ComparisonOp::Gte => compare_values(candidate, operand).is_some_and(|o| o.is_ge()),
            ComparisonOp::Lt => compare_values(candidate, operand).is_some_and(|o| o.is_lt()),
            ComparisonOp::Lte => compare_values(candidate, operand).is_some_and(|o| o.is_le()),
            ComparisonOp::In => operand
                .as_array()
                .is_some_and(|items| items.iter().any(|item| values_equal(candidate, item))),
            ComparisonOp::Like => match (candidate.as_str(), operand.as_str()) {
                (Some(text), Some(pattern)) => like_matches(text, pattern),
                _ => false,
            },
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Orders two JSON scalars. Numbers compare numerically, strings lexically.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn like_matches(text: &str, pattern: &str) -> bool {
    let parts: Vec<&str> = pattern.split('%').collect();
    if parts.len() == 1 {
        return text == pattern;
    }
    let mut rest = text;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

/// Join type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    /// Inner join.
    #[default]
    Inner,
    /// Left outer join.
    Left,
    /// Right outer join.
    Right,
    /// Full outer join.
    Full,
}

/// An equality condition between two qualified columns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JoinCondition {
    /// Left column, optionally qualified as `entity.column`.
    pub left: String,
    /// Right column, optionally qualified as `entity.column`.
    pub right: String,
}

/// A join against another entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JoinClause {
    /// Joined entity.
    pub entity: String,
    /// Join type.
    #[serde(default)]
    pub join_type: JoinType,
    /// Join conditions. When empty, the key is inferred by naming convention.
    #[serde(default)]
    pub on: Vec<JoinCondition>,
}

impl JoinClause {
    /// Inner join with an inferred key.
    pub fn inner(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            join_type: JoinType::Inner,
            on: Vec::new(),
        }
    }

    /// Left join with an inferred key.
    pub fn left(entity: impl Into<String>) -> Self {
        Self {
            join_type: JoinType::Left,
            ..Self::inner(entity)
        }
    }

    /// Adds an explicit join condition.
    pub fn on(mut self, left: impl Into<String>, right: impl Into<String>) -> Self {
        self.on.push(JoinCondition {
            left: left.into(),
            right: right.into(),
        });
        self
    }

    /// Resolves the join key as `(entity, column)` pairs.
    ///
    /// Without explicit conditions the base entity is assumed to hold a
    /// foreign key named after the singular joined entity (`users` gives
    /// `user_id`) referencing its `id`.
    pub fn key_columns(&self, base_entity: &str) -> Vec<(String, String)> {
        if self.on.is_empty() {
            let singular = self.entity.strip_suffix('s').unwrap_or(&self.entity);
            return vec![
                (base_entity.to_string(), format!("{}_id", singular)),
                (self.entity.clone(), "id".to_string()),
            ];
        }

        let mut keys = Vec::new();
        for condition in &self.on {
            keys.push(split_qualified(&condition.left, base_entity));
            keys.push(split_qualified(&condition.right, &self.entity));
        }
        keys
    }
}

fn split_qualified(column: &str, default_entity: &str) -> (String, String) {
    match column.split_once('.') {
        Some((entity, col)) => (entity.to_string(), col.to_string()),
        None => (default_entity.to_string(), column.to_string()),
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    /// Ascending.
    #[default]
    Asc,
    /// Descending.
    Desc,
}

/// An ordering clause.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    /// Column to sort by.
    pub column: String,
    /// Direction.
    #[serde(default)]
    pub direction: SortDirection,
}

/// A window function specification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowSpec {
    /// Function name, e.g. `row_number` or `avg`.
    pub function: String,
    /// Partition columns.
    #[serde(default)]
    pub partition_by: Vec<String>,
    /// Ordering within the partition.
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
}

/// Planner hints injected by optimization rules.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "hint", rename_all = "snake_case")]
pub enum QueryHint {
    /// Prefer an index scan on these columns.
    IndexScan { columns: Vec<String> },
    /// Prune partitions outside the filtered time range.
    TimeRangePruning { column: String },
    /// Push tag filters down to the storage engine.
    TagFilter { tags: Vec<String> },
    /// Scan through the super table rather than per-series child tables.
    SuperTableScan,
    /// Evaluate joins in this entity order.
    JoinOrder { entities: Vec<String> },
    /// Share one sort across windows with the same partitioning.
    WindowPartitioning { partition_by: Vec<String> },
    /// Write rows in batches of this size.
    BulkWrite { batch_size: usize },
    /// Scan partitions in parallel.
    ParallelScan,
    /// Read rows already sorted from an index on these columns.
    SortedIndexScan { columns: Vec<String> },
}

/// One entry of a descriptor's optimization lineage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedOptimization {
    /// Rule name.
    pub rule: String,
    /// Estimated improvement contributed by the rule.
    pub improvement: f64,
}

/// A backend-neutral description of one query or write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    /// The operation.
    pub operation: OperationKind,
    /// Target entity (table, super table, collection).
    pub entity: String,
    /// Projected columns. `None` selects everything.
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    /// Filters keyed by column.
    #[serde(default)]
    pub filters: BTreeMap<String, FilterValue>,
    /// Joins.
    #[serde(default)]
    pub joins: Vec<JoinClause>,
    /// Group-by columns.
    #[serde(default)]
    pub group_by: Vec<String>,
    /// Having conditions keyed by aggregate expression.
    #[serde(default)]
    pub having: BTreeMap<String, FilterValue>,
    /// Ordering.
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    /// Row limit.
    #[serde(default)]
    pub limit: Option<u64>,
    /// Row offset.
    #[serde(default)]
    pub offset: Option<u64>,
    /// Window functions.
    #[serde(default)]
    pub windows: Vec<WindowSpec>,
    /// Rows for inserts, or a single change-set object for updates.
    #[serde(default)]
    pub payload: Vec<Value>,
    /// Features the caller requires, e.g. `transactions`.
    #[serde(default)]
    pub required_features: BTreeSet<String>,
    /// Planner hints. Written only by the optimizer.
    #[serde(default)]
    pub hints: Vec<QueryHint>,
    /// Optimization lineage. Written only by the optimizer.
    #[serde(default)]
    pub lineage: Vec<AppliedOptimization>,
}

impl QueryDescriptor {
    /// Creates an empty descriptor.
    pub fn new(operation: OperationKind, entity: impl Into<String>) -> Self {
        Self {
            operation,
            entity: entity.into(),
            columns: None,
            filters: BTreeMap::new(),
            joins: Vec::new(),
            group_by: Vec::new(),
            having: BTreeMap::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            windows: Vec::new(),
            payload: Vec::new(),
            required_features: BTreeSet::new(),
            hints: Vec::new(),
            lineage: Vec::new(),
        }
    }

    /// Creates a read descriptor.
    pub fn read(entity: impl Into<String>) -> Self {
        Self::new(OperationKind::Read, entity)
    }

    /// Creates an insert descriptor. More than one row makes it a batch insert.
    pub fn insert(entity: impl Into<String>, rows: Vec<Value>) -> Self {
        let operation = if rows.len() > 1 {
            OperationKind::BatchInsert
        } else {
            OperationKind::Insert
        };
        Self::new(operation, entity).with_payload(rows)
    }

    /// Creates an update descriptor applying `changes` to matching rows.
    pub fn update(
        entity: impl Into<String>,
        filters: BTreeMap<String, FilterValue>,
        changes: Value,
    ) -> Self {
        let mut query = Self::new(OperationKind::Update, entity).with_payload(vec![changes]);
        query.filters = filters;
        query
    }

    /// Creates a delete descriptor.
    pub fn delete(entity: impl Into<String>, filters: BTreeMap<String, FilterValue>) -> Self {
        let mut query = Self::new(OperationKind::Delete, entity);
        query.filters = filters;
        query
    }

    /// Sets the projection.
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Adds a filter.
    pub fn with_filter(mut self, column: impl Into<String>, value: FilterValue) -> Self {
        self.filters.insert(column.into(), value);
        self
    }

    /// Adds a join.
    pub fn with_join(mut self, join: JoinClause) -> Self {
        self.joins.push(join);
        self
    }

    /// Sets the group-by columns.
    pub fn with_group_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a having condition.
    pub fn with_having(mut self, expression: impl Into<String>, value: FilterValue) -> Self {
        self.having.insert(expression.into(), value);
        self
    }

    /// Adds an ordering clause.
    pub fn with_order_by(mut self, column: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by.push(OrderBy {
            column: column.into(),
            direction,
        });
        self
    }

    /// Sets the limit.
    pub fn with_limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the offset.
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Adds a window function.
    pub fn with_window(mut self, window: WindowSpec) -> Self {
        self.windows.push(window);
        self
    }

    /// Sets the payload.
    pub fn with_payload(mut self, payload: Vec<Value>) -> Self {
        self.payload = payload;
        self
    }

    /// Declares a required feature.
    pub fn requiring(mut self, feature: impl Into<String>) -> Self {
        self.required_features.insert(feature.into());
        self
    }

    /// Returns true if the descriptor has join clauses.
    pub fn has_joins(&self) -> bool {
        !self.joins.is_empty()
    }

    /// Returns true if the descriptor aggregates rows.
    pub fn has_aggregation(&self) -> bool {
        !self.group_by.is_empty() || !self.having.is_empty()
    }

    /// Returns true if the caller declared this feature as required.
    pub fn requires_feature(&self, feature: &str) -> bool {
        self.required_features.contains(feature)
    }

    /// Returns true if the optimizer already applied this rule.
    pub fn was_optimized_by(&self, rule: &str) -> bool {
        self.lineage.iter().any(|entry| entry.rule == rule)
    }

    /// Total improvement recorded in the lineage.
    pub fn lineage_improvement(&self) -> f64 {
        self.lineage.iter().map(|entry| entry.improvement).sum()
    }

    /// Returns true if a hint equal to `hint` is present.
    pub fn has_hint(&self, hint: &QueryHint) -> bool {
        self.hints.contains(hint)
    }

    /// Adds a hint unless an equal one is present.
    pub fn push_hint(&mut self, hint: QueryHint) {
        if !self.has_hint(&hint) {
            self.hints.push(hint);
        }
    }

    /// Every entity this descriptor reads or writes.
    pub fn touched_entities(&self) -> Vec<String> {
        let mut entities = vec![self.entity.clone()];
        for join in &self.joins {
            if !entities.contains(&join.entity) {
                entities.push(join.entity.clone());
            }
        }
        entities
    }

    /// Computes a deterministic cache key.
    ///
    /// The key covers the operation, entity, projection, filters, joins,
    /// grouping, ordering, paging and windows. Hints, lineage and payload are
    /// excluded so an optimized descriptor shares its key with the
    /// descriptor it was derived from.
    pub fn cache_key(&self) -> CacheKey {
        let mut hasher = Sha256::new();
        hasher.update(self.operation.to_string().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.entity.trim().to_lowercase().as_bytes());
        hasher.update([0u8]);

        if let Some(ref columns) = self.columns {
            for column in columns {
                hasher.update(column.as_bytes());
                hasher.update([b',']);
            }
        }
        hasher.update([0u8]);

        let canonical = serde_json::json!({
            "filters": canonical_filters(&self.filters),
            "joins": self.joins.iter().map(|j| {
                serde_json::json!({
                    "entity": j.entity,
                    "type": format!("{:?}", j.join_type),
                    "on": j.on.iter().map(|c| format!("{}={}", c.left, c.right)).collect::<Vec<_>>(),
                })
            }).collect::<Vec<_>>(),
            "group_by": self.group_by,
            "having": canonical_filters(&self.having),
            "order_by": self.order_by.iter().map(|o| format!("{}:{:?}", o.column, o.direction)).collect::<Vec<_>>(),
            "windows": self.windows.iter().map(|w| {
                format!("{}({})[{}]", w.function, w.partition_by.join(","),
                    w.order_by.iter().map(|o| o.column.as_str()).collect::<Vec<_>>().join(","))
            }).collect::<Vec<_>>(),
            "limit": self.limit,
            "offset": self.offset,
        });
        hasher.update(canonical.to_string().as_bytes());

        CacheKey(format!("{:x}", hasher.finalize()))
    }
}

fn canonical_filters(filters: &BTreeMap<String, FilterValue>) -> Vec<String> {
    filters
        .iter()
        .map(|(column, filter)| format!("{}:{:?}:{}", column, filter.op(), filter.value()))
        .collect()
}

/// A hex-encoded SHA-256 digest identifying a cacheable descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Returns the hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The result of executing a descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Returned rows.
    pub rows: Vec<Value>,
    /// Rows written or removed by a write.
    pub affected_rows: u64,
    /// Identifier of the executor that produced the result.
    pub executor_id: Option<String>,
}

impl QueryResult {
    /// A result carrying rows.
    pub fn from_rows(rows: Vec<Value>) -> Self {
        Self {
            rows,
            ..Default::default()
        }
    }

    /// A result for a write.
    pub fn affected(count: u64) -> Self {
        Self {
            affected_rows: count,
            ..Default::default()
        }
    }

    /// Number of returned rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if no rows were returned.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
