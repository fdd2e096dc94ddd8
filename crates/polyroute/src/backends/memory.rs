//! In-process executor.
//!
//! [`MemoryExecutor`] keeps rows as JSON objects in per-entity tables and
//! evaluates descriptors directly: filters, inner and left joins, grouping
//! with counts, ordering, paging and projection. Its capability profile
//! decides which features it accepts, so a time-series instance rejects
//! joins and transactions the way a real time-series engine would.
//!
//! Faults, latency and health can be scripted, which makes it the executor
//! used throughout the test suite and by the probe binary.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::core::{BackendExecutor, BackendKind, CapabilityProfile, ExecutorConfig, PoolStats};
use crate::error::{BackendError, BackendResult};
use crate::query::{
    FilterValue, JoinClause, JoinType, OperationKind, QueryDescriptor, QueryResult, SortDirection,
    compare_values,
};

type Tables = HashMap<String, Vec<Value>>;

/// An open transaction: a private view for its own reads, plus the writes to
/// replay against the live tables on commit.
#[derive(Debug)]
struct PendingTransaction {
    view: Tables,
    writes: Vec<QueryDescriptor>,
}

/// Error a scripted fault produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// [`BackendError::Unavailable`].
    Unavailable,
    /// [`BackendError::ConnectionFailed`].
    ConnectionFailed,
    /// [`BackendError::PoolExhausted`].
    PoolExhausted,
    /// [`BackendError::QueryError`].
    Query,
}

#[derive(Debug, Default)]
struct Faults {
    remaining: u32,
    always: bool,
    kind: Option<FaultKind>,
}

impl Faults {
    fn take(&mut self) -> Option<FaultKind> {
        if self.always {
            return self.kind;
        }
        if self.remaining > 0 {
            self.remaining -= 1;
            return self.kind;
        }
        None
    }
}

struct ActiveGuard<'a>(&'a AtomicU32);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicU32) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Executor holding its data in process memory.
#[derive(Debug)]
pub struct MemoryExecutor {
    id: String,
    kind: BackendKind,
    config: ExecutorConfig,
    profile: CapabilityProfile,
    connected: AtomicBool,
    healthy: AtomicBool,
    introspection_fails: AtomicBool,
    faults: Mutex<Faults>,
    latency: Mutex<Duration>,
    active: AtomicU32,
    tables: RwLock<Tables>,
    transactions: Mutex<HashMap<String, PendingTransaction>>,
    executed: Mutex<Vec<QueryDescriptor>>,
}

fn table_name(entity: &str) -> String {
    entity.trim().to_lowercase()
}

impl MemoryExecutor {
    /// Creates a connected, healthy executor with the baseline profile of its kind.
    pub fn new(id: impl Into<String>, kind: BackendKind) -> Self {
        Self {
            id: id.into(),
            kind,
            config: ExecutorConfig::new("memory://"),
            profile: CapabilityProfile::baseline(kind),
            connected: AtomicBool::new(true),
            healthy: AtomicBool::new(true),
            introspection_fails: AtomicBool::new(false),
            faults: Mutex::new(Faults::default()),
            latency: Mutex::new(Duration::ZERO),
            active: AtomicU32::new(0),
            tables: RwLock::new(HashMap::new()),
            transactions: Mutex::new(HashMap::new()),
            executed: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the capability profile.
    pub fn with_profile(mut self, profile: CapabilityProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Replaces the connection settings.
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    // ========================================================================
    // Scripting
    // ========================================================================

    /// Sets the result of health probes.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    /// Makes capability introspection fail.
    pub fn set_introspection_fails(&self, fails: bool) {
        self.introspection_fails.store(fails, Ordering::Relaxed);
    }

    /// Fails the next `count` queries with `kind`.
    pub fn fail_next(&self, count: u32, kind: FaultKind) {
        let mut faults = self.faults.lock();
        faults.remaining = count;
        faults.always = false;
        faults.kind = Some(kind);
    }

    /// Fails every query with `kind` until cleared.
    pub fn fail_always(&self, kind: FaultKind) {
        let mut faults = self.faults.lock();
        faults.always = true;
        faults.kind = Some(kind);
    }

    /// Clears scripted faults.
    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    /// Delays every query by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Adds rows to an entity without going through a query.
    pub fn insert_rows(&self, entity: &str, rows: impl IntoIterator<Item = Value>) {
        self.tables
            .write()
            .entry(table_name(entity))
            .or_default()
            .extend(rows);
    }

    /// Rows currently stored for an entity.
    pub fn rows(&self, entity: &str) -> Vec<Value> {
        self.tables
            .read()
            .get(&table_name(entity))
            .cloned()
            .unwrap_or_default()
    }

    /// Every descriptor received, in order.
    pub fn executed_queries(&self) -> Vec<QueryDescriptor> {
        self.executed.lock().clone()
    }

    /// Number of descriptors received.
    pub fn execution_count(&self) -> usize {
        self.executed.lock().len()
    }

    /// Open transactions.
    pub fn open_transactions(&self) -> usize {
        self.transactions.lock().len()
    }

    fn fault_error(&self, kind: FaultKind) -> BackendError {
        let backend_name = self.id.clone();
        match kind {
            FaultKind::Unavailable => BackendError::Unavailable {
                backend_name,
                message: "scripted outage".to_string(),
            },
            FaultKind::ConnectionFailed => BackendError::ConnectionFailed {
                backend_name,
                message: "scripted connection failure".to_string(),
            },
            FaultKind::PoolExhausted => BackendError::PoolExhausted { backend_name },
            FaultKind::Query => BackendError::QueryError {
                backend_name,
                message: "scripted query failure".to_string(),
            },
        }
    }

    fn check_supported(&self, query: &QueryDescriptor) -> BackendResult<()> {
        if query.has_joins() && !self.profile.supports("joins") {
            return Err(self.unsupported("joins"));
        }
        if let Some(feature) = query
            .required_features
            .iter()
            .find(|f| !self.profile.supports(f))
        {
            return Err(self.unsupported(feature));
        }
        Ok(())
    }

    async fn prepare(&self, query: &QueryDescriptor) -> BackendResult<()> {
        self.executed.lock().push(query.clone());

        if !self.is_connected() {
            return Err(BackendError::ConnectionFailed {
                backend_name: self.id.clone(),
                message: "not connected".to_string(),
            });
        }
        let fault = self.faults.lock().take();
        if let Some(kind) = fault {
            trace!(executor = %self.id, fault = ?kind, "injecting fault");
            return Err(self.fault_error(kind));
        }
        self.check_supported(query)?;

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    fn stamp(&self, mut result: QueryResult) -> QueryResult {
        result.executor_id = Some(self.id.clone());
        result
    }
}

#[async_trait]
impl BackendExecutor for MemoryExecutor {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn connect(&self) -> BackendResult<()> {
        self.connected.store(true, Ordering::Relaxed);
        debug!(executor = %self.id, "connected");
        Ok(())
    }

    async fn disconnect(&self) -> BackendResult<()> {
        self.connected.store(false, Ordering::Relaxed);
        debug!(executor = %self.id, "disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn execute_query(&self, query: &QueryDescriptor) -> BackendResult<QueryResult> {
        let _active = ActiveGuard::enter(&self.active);
        self.prepare(query).await?;

        let result = if query.operation.is_write() {
            let mut tables = self.tables.write();
            apply_write(&mut tables, query)?
        } else {
            let tables = self.tables.read();
            evaluate_read(&tables, query)?
        };
        Ok(self.stamp(result))
    }

    fn capabilities(&self) -> BackendResult<CapabilityProfile> {
        if self.introspection_fails.load(Ordering::Relaxed) {
            return Err(BackendError::Internal {
                backend_name: self.id.clone(),
                message: "introspection failed".to_string(),
                source: None,
            });
        }
        Ok(self.profile.clone())
    }

    async fn health_check(&self) -> bool {
        self.is_connected() && self.healthy.load(Ordering::Relaxed)
    }

    fn pool_stats(&self) -> PoolStats {
        let active = self.active.load(Ordering::Relaxed);
        let max = self.config.max_connections;
        PoolStats {
            active,
            idle: max.saturating_sub(active),
            max,
            pending: active.saturating_sub(max),
        }
    }

    async fn begin_transaction(&self) -> BackendResult<String> {
        if !self.profile.supports_transactions() {
            return Err(self.unsupported("transactions"));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let view = self.tables.read().clone();
        self.transactions.lock().insert(
            id.clone(),
            PendingTransaction {
                view,
                writes: Vec::new(),
            },
        );
        debug!(executor = %self.id, transaction = %id, "began transaction");
        Ok(id)
    }

    async fn execute_in_transaction(
        &self,
        transaction_id: &str,
        query: &QueryDescriptor,
    ) -> BackendResult<QueryResult> {
        let _active = ActiveGuard::enter(&self.active);
        self.prepare(query).await?;

        let mut transactions = self.transactions.lock();
        let pending = transactions
            .get_mut(transaction_id)
            .ok_or_else(|| BackendError::QueryError {
                backend_name: self.id.clone(),
                message: format!("unknown transaction {}", transaction_id),
            })?;

        let result = if query.operation.is_write() {
            let result = apply_write(&mut pending.view, query)?;
            pending.writes.push(query.clone());
            result
        } else {
            evaluate_read(&pending.view, query)?
        };
        Ok(self.stamp(result))
    }

    async fn commit_transaction(&self, transaction_id: &str) -> BackendResult<()> {
        let pending = self
            .transactions
            .lock()
            .remove(transaction_id)
            .ok_or_else(|| BackendError::QueryError {
                backend_name: self.id.clone(),
                message: format!("unknown transaction {}", transaction_id),
            })?;
        // Replay only this transaction's writes
        let mut tables = self.tables.write();
        for write in &pending.writes {
            apply_write(&mut tables, write)?;
        }
        debug!(executor = %self.id, transaction = %transaction_id, "committed transaction");
        Ok(())
    }

    async fn rollback_transaction(&self, transaction_id: &str) -> BackendResult<()> {
        match self.transactions.lock().remove(transaction_id) {
            Some(_) => {
                debug!(executor = %self.id, transaction = %transaction_id, "rolled back transaction");
                Ok(())
            }
            None => Err(BackendError::QueryError {
                backend_name: self.id.clone(),
                message: format!("unknown transaction {}", transaction_id),
            }),
        }
    }
}

// ============================================================================
// Evaluation
// ============================================================================

/// Looks up a possibly qualified column in a row.
fn column_value<'a>(row: &'a Value, base_entity: &str, column: &str) -> Option<&'a Value> {
    let local = column
        .strip_prefix(base_entity)
        .and_then(|rest| rest.strip_prefix('.'))
        .unwrap_or(column);
    row.get(local)
}

fn row_matches(row: &Value, base_entity: &str, filters: &std::collections::BTreeMap<String, FilterValue>) -> bool {
    filters
        .iter()
        .all(|(column, filter)| filter.matches(column_value(row, base_entity, column)))
}

fn join_rows(
    base_rows: Vec<Value>,
    base_entity: &str,
    join: &JoinClause,
    joined_rows: &[Value],
) -> Result<Vec<Value>, String> {
    if matches!(join.join_type, JoinType::Right | JoinType::Full) {
        return Err(format!("{:?} joins are not supported in memory", join.join_type).to_lowercase());
    }

    let keys = join.key_columns(base_entity);
    let conditions: Vec<(&(String, String), &(String, String))> =
        keys.chunks(2).filter_map(|pair| Some((pair.first()?, pair.get(1)?))).collect();

    let key_matches = |base: &Value, other: &Value| {
        conditions.iter().all(|((left_entity, left_col), (_, right_col))| {
            let left = if left_entity == base_entity {
                base.get(left_col.as_str())
            } else {
                base.get(format!("{}.{}", left_entity, left_col).as_str())
            };
            match (left, other.get(right_col.as_str())) {
                (Some(a), Some(b)) => compare_values(a, b) == Some(CmpOrdering::Equal) || a == b,
                _ => false,
            }
        })
    };

    let mut out = Vec::new();
    for base in base_rows {
        let mut matched = false;
        for other in joined_rows.iter().filter(|other| key_matches(&base, other)) {
            matched = true;
            let mut merged = base.as_object().cloned().unwrap_or_default();
            if let Some(fields) = other.as_object() {
                for (key, value) in fields {
                    merged.insert(format!("{}.{}", join.entity, key), value.clone());
                }
            }
            out.push(Value::Object(merged));
        }
        if !matched && join.join_type == JoinType::Left {
            out.push(base);
        }
    }
    Ok(out)
}

fn group_rows(rows: Vec<Value>, query: &QueryDescriptor) -> Vec<Value> {
    let mut groups: Vec<(Vec<Value>, u64)> = Vec::new();
    for row in &rows {
        let key: Vec<Value> = query
            .group_by
            .iter()
            .map(|c| column_value(row, &query.entity, c).cloned().unwrap_or(Value::Null))
            .collect();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, count)) => *count += 1,
            None => groups.push((key, 1)),
        }
    }

    groups
        .into_iter()
        .map(|(key, count)| {
            let mut row = Map::new();
            for (column, value) in query.group_by.iter().zip(key) {
                row.insert(column.clone(), value);
            }
            row.insert("count".to_string(), Value::from(count));
            Value::Object(row)
        })
        .filter(|row| {
            query
                .having
                .iter()
                .all(|(expr, filter)| filter.matches(row.get(expr.as_str())))
        })
        .collect()
}

fn evaluate_read(tables: &Tables, query: &QueryDescriptor) -> BackendResult<QueryResult> {
    let query_error = |message: String| BackendError::QueryError {
        backend_name: "memory".to_string(),
        message,
    };

    let mut rows = tables
        .get(&table_name(&query.entity))
        .cloned()
        .unwrap_or_default();

    for join in &query.joins {
        let joined = tables
            .get(&table_name(&join.entity))
            .map(Vec::as_slice)
            .unwrap_or_default();
        rows = join_rows(rows, &query.entity, join, joined).map_err(query_error)?;
    }

    rows.retain(|row| row_matches(row, &query.entity, &query.filters));

    if !query.group_by.is_empty() {
        rows = group_rows(rows, query);
    }

    if !query.order_by.is_empty() {
        rows.sort_by(|a, b| {
            for order in &query.order_by {
                let left = column_value(a, &query.entity, &order.column);
                let right = column_value(b, &query.entity, &order.column);
                let ordering = match (left, right) {
                    (Some(x), Some(y)) => compare_values(x, y).unwrap_or(CmpOrdering::Equal),
                    (Some(_), None) => CmpOrdering::Less,
                    (None, Some(_)) => CmpOrdering::Greater,
                    (None, None) => CmpOrdering::Equal,
                };
                let ordering = match order.direction {
                    SortDirection::Asc => ordering,
                    SortDirection::Desc => ordering.reverse(),
                };
                if ordering != CmpOrdering::Equal {
                    return ordering;
                }
            }
            CmpOrdering::Equal
        });
    }

    let offset = usize::try_from(query.offset.unwrap_or(0)).unwrap_or(usize::MAX);
    let limit = query
        .limit
        .map(|l| usize::try_from(l).unwrap_or(usize::MAX))
        .unwrap_or(usize::MAX);
    let rows: Vec<Value> = rows.into_iter().skip(offset).take(limit).collect();

    let rows = match &query.columns {
        Some(columns) => rows
            .into_iter()
            .map(|row| {
                let mut projected = Map::new();
                for column in columns {
                    if let Some(value) = column_value(&row, &query.entity, column) {
                        projected.insert(column.clone(), value.clone());
                    }
                }
                Value::Object(projected)
            })
            .collect(),
        None => rows,
    };

    Ok(QueryResult::from_rows(rows))
}

fn apply_write(tables: &mut Tables, query: &QueryDescriptor) -> BackendResult<QueryResult> {
    let table = tables.entry(table_name(&query.entity)).or_default();

    let affected = match query.operation {
        OperationKind::Insert | OperationKind::BatchInsert => {
            table.extend(query.payload.iter().cloned());
            query.payload.len()
        }
        OperationKind::Upsert => {
            for row in &query.payload {
                let existing = row
                    .get("id")
                    .and_then(|id| table.iter_mut().find(|r| r.get("id") == Some(id)));
                match existing {
                    Some(slot) => *slot = row.clone(),
                    None => table.push(row.clone()),
                }
            }
            query.payload.len()
        }
        OperationKind::Update | OperationKind::BatchUpdate => {
            let changes = query
                .payload
                .first()
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let mut count = 0;
            for row in table.iter_mut() {
                if !row_matches(row, &query.entity, &query.filters) {
                    continue;
                }
                if let Some(fields) = row.as_object_mut() {
                    for (key, value) in &changes {
                        fields.insert(key.clone(), value.clone());
                    }
                }
                count += 1;
            }
            count
        }
        OperationKind::Delete => {
            let before = table.len();
            table.retain(|row| !row_matches(row, &query.entity, &query.filters));
            before - table.len()
        }
        OperationKind::Read => 0,
    };

    Ok(QueryResult::affected(affected as u64))
}
