//! The optimization pipeline.
//!
//! [`QueryOptimizer::optimize`] selects every enabled rule whose predicate
//! holds for the input descriptor and that has not already been applied to
//! it, orders the selection by priority tier (registration order within a
//! tier), and folds the transforms over the descriptor. A failing or
//! panicking transform is downgraded to a warning and the fold continues
//! with the descriptor as it was before that rule.
//!
//! Every successful transform appends an entry to the descriptor's lineage,
//! so re-optimizing an optimized descriptor applies nothing new and the
//! aggregate improvement never decreases. The aggregate is capped at 0.9.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::core::BackendKind;
use crate::error::AccessError;
use crate::query::{AppliedOptimization, QueryDescriptor};
use crate::routing::analyzer::{QueryAnalyzer, QueryComplexity};

use super::cost::{CostConfig, CostModel, ExecutionPlan};
use super::indexes::{IndexAdvisor, IndexRecommendation};
use super::rules::{OptimizationRule, default_optimization_rules};
use super::{BoundedCache, DEFAULT_CACHE_CAPACITY, plan_key};

/// Upper bound on the aggregate estimated improvement.
pub const MAX_IMPROVEMENT: f64 = 0.9;

/// Default number of optimization records kept for statistics.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;

/// Result of optimizing one descriptor.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationResult {
    /// Input descriptor.
    pub original: QueryDescriptor,
    /// Rewritten descriptor.
    pub optimized: QueryDescriptor,
    /// Kind optimized for.
    pub backend_kind: BackendKind,
    /// Rules applied in this pass, in order.
    pub applied_rules: Vec<String>,
    /// Aggregate improvement including earlier passes, capped at 0.9.
    pub estimated_improvement: f64,
    /// Descriptions of the applied rules.
    pub recommendations: Vec<String>,
    /// Non-fatal rule failures.
    pub warnings: Vec<String>,
    /// Complexity class of the input.
    pub complexity: QueryComplexity,
    /// Index recommendations for the input.
    pub index_recommendations: Vec<IndexRecommendation>,
    /// Time spent optimizing.
    pub duration: Duration,
}

impl OptimizationResult {
    /// Returns true if at least one rule was applied in this pass.
    pub fn changed(&self) -> bool {
        !self.applied_rules.is_empty()
    }
}

#[derive(Debug, Clone)]
struct OptimizationRecord {
    applied_rules: Vec<String>,
    improvement: f64,
    duration: Duration,
}

/// Aggregated optimizer statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OptimizationStatistics {
    /// Optimizations performed since creation.
    pub total_optimizations: u64,
    /// Records currently in the history window.
    pub history_size: usize,
    /// Mean improvement over the history window.
    pub average_improvement: f64,
    /// Mean optimization latency over the history window, in milliseconds.
    pub average_latency_ms: f64,
    /// Rule failures since creation.
    pub rule_failures: u64,
    /// Applications per rule since creation.
    pub rule_usage: BTreeMap<String, u64>,
    /// The five most applied rules.
    pub most_applied_rules: Vec<(String, u64)>,
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    failures: u64,
    rule_usage: BTreeMap<String, u64>,
}

/// Rewrites descriptors for a target backend kind.
pub struct QueryOptimizer {
    rules: RwLock<Vec<OptimizationRule>>,
    cost_model: CostModel,
    advisor: IndexAdvisor,
    analyzer: QueryAnalyzer,
    plans: BoundedCache<String, ExecutionPlan>,
    history: Mutex<VecDeque<OptimizationRecord>>,
    history_capacity: usize,
    counters: Mutex<Counters>,
}

impl Default for QueryOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryOptimizer {
    /// Creates an optimizer with the built-in rules and default capacities.
    pub fn new() -> Self {
        Self::with_analyzer(QueryAnalyzer::new())
    }

    /// Creates an optimizer using a custom analyzer.
    pub fn with_analyzer(analyzer: QueryAnalyzer) -> Self {
        Self::with_capacity(analyzer, DEFAULT_HISTORY_CAPACITY, DEFAULT_CACHE_CAPACITY)
    }

    /// Creates an optimizer with explicit history and cache capacities.
    pub fn with_capacity(analyzer: QueryAnalyzer, history_capacity: usize, cache_capacity: usize) -> Self {
        Self {
            rules: RwLock::new(default_optimization_rules(&analyzer)),
            cost_model: CostModel::new(CostConfig::default(), analyzer.clone()),
            advisor: IndexAdvisor::new(cache_capacity),
            analyzer,
            plans: BoundedCache::new(cache_capacity),
            history: Mutex::new(VecDeque::new()),
            history_capacity: history_capacity.max(1),
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Replaces the cost model configuration.
    pub fn with_cost_config(mut self, config: CostConfig) -> Self {
        self.cost_model = CostModel::new(config, self.analyzer.clone());
        self
    }

    // ========================================================================
    // Rules
    // ========================================================================

    /// Adds a rule, replacing any rule with the same name.
    pub fn add_rule(&self, rule: OptimizationRule) {
        let mut rules = self.rules.write();
        if let Some(existing) = rules.iter_mut().find(|r| r.name == rule.name) {
            *existing = rule;
        } else {
            rules.push(rule);
        }
    }

    /// Removes a rule by name. Returns true if it existed.
    pub fn remove_rule(&self, name: &str) -> bool {
        let mut rules = self.rules.write();
        let before = rules.len();
        rules.retain(|r| r.name != name);
        rules.len() != before
    }

    /// Enables or disables a rule. Returns true if it exists.
    pub fn set_rule_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.rules.write().iter_mut().find(|r| r.name == name) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Returns a copy of the rule set.
    pub fn rules(&self) -> Vec<OptimizationRule> {
        self.rules.read().clone()
    }

    // ========================================================================
    // Optimization
    // ========================================================================

    /// Optimizes a descriptor for a backend kind.
    #[instrument(skip(self, query), fields(entity = %query.entity, kind = %kind))]
    pub fn optimize(&self, query: &QueryDescriptor, kind: BackendKind) -> OptimizationResult {
        let start = Instant::now();

        let mut selected: Vec<OptimizationRule> = self
            .rules
            .read()
            .iter()
            .filter(|r| !query.was_optimized_by(&r.name) && r.applies_to(query, kind))
            .cloned()
            .collect();
        selected.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut current = query.clone();
        let mut applied = Vec::new();
        let mut recommendations = Vec::new();
        let mut warnings = Vec::new();

        for rule in &selected {
            let outcome = catch_unwind(AssertUnwindSafe(|| rule.apply(&current, kind)));
            let failure = match outcome {
                Ok(Ok(mut next)) => {
                    next.lineage.push(AppliedOptimization {
                        rule: rule.name.clone(),
                        improvement: rule.estimated_improvement,
                    });
                    current = next;
                    applied.push(rule.name.clone());
                    if !rule.description.is_empty() {
                        recommendations.push(rule.description.clone());
                    }
                    continue;
                }
                Ok(Err(message)) => message,
                Err(payload) => panic_message(payload.as_ref()),
            };

            let err = AccessError::OptimizationRuleFailure {
                rule: rule.name.clone(),
                message: failure,
            };
            warn!(rule = %rule.name, error = %err, "optimization rule failed");
            warnings.push(err.to_string());
        }

        let estimated_improvement = current.lineage_improvement().clamp(0.0, MAX_IMPROVEMENT);
        let analysis = self.analyzer.analyze(query);
        let index_recommendations = self.advisor.recommend(query, kind);
        let duration = start.elapsed();

        self.record(&applied, warnings.len(), estimated_improvement, duration);

        debug!(
            applied = ?applied,
            improvement = estimated_improvement,
            warnings = warnings.len(),
            "optimized query"
        );

        OptimizationResult {
            original: query.clone(),
            optimized: current,
            backend_kind: kind,
            applied_rules: applied,
            estimated_improvement,
            recommendations,
            warnings,
            complexity: analysis.complexity,
            index_recommendations,
            duration,
        }
    }

    /// Recommends indexes for a descriptor on a backend kind.
    pub fn suggest_indexes(&self, query: &QueryDescriptor, kind: BackendKind) -> Vec<IndexRecommendation> {
        self.advisor.recommend(query, kind)
    }

    /// Estimates the execution plan of a descriptor on a backend kind.
    pub fn analyze_execution_plan(&self, query: &QueryDescriptor, kind: BackendKind) -> ExecutionPlan {
        let key = plan_key(query, kind);
        if let Some(plan) = self.plans.get(&key) {
            return plan;
        }
        let plan = self.cost_model.plan(query, kind);
        self.plans.insert(key, plan.clone());
        plan
    }

    /// Estimated cost of a descriptor on a backend kind.
    pub fn estimate_cost(&self, query: &QueryDescriptor, kind: BackendKind) -> f64 {
        self.cost_model.estimate_cost(query, kind).total()
    }

    /// Drops cached plans and index recommendations.
    pub fn clear_cache(&self) {
        self.plans.clear();
        self.advisor.clear();
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    /// Returns aggregated statistics.
    pub fn statistics(&self) -> OptimizationStatistics {
        let history = self.history.lock();
        let counters = self.counters.lock();

        let n = history.len();
        let (improvement, latency) = history.iter().fold((0.0, 0.0), |(i, l), r| {
            (i + r.improvement, l + r.duration.as_secs_f64() * 1000.0)
        });

        let mut most_applied: Vec<(String, u64)> = counters
            .rule_usage
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        most_applied.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        most_applied.truncate(5);

        OptimizationStatistics {
            total_optimizations: counters.total,
            history_size: n,
            average_improvement: if n == 0 { 0.0 } else { improvement / n as f64 },
            average_latency_ms: if n == 0 { 0.0 } else { latency / n as f64 },
            rule_failures: counters.failures,
            rule_usage: counters.rule_usage.clone(),
            most_applied_rules: most_applied,
        }
    }

    fn record(&self, applied: &[String], failures: usize, improvement: f64, duration: Duration) {
        {
            let mut counters = self.counters.lock();
            counters.total += 1;
            counters.failures += failures as u64;
            for rule in applied {
                *counters.rule_usage.entry(rule.clone()).or_default() += 1;
            }
        }

        let mut history = self.history.lock();
        history.push_back(OptimizationRecord {
            applied_rules: applied.to_vec(),
            improvement,
            duration,
        });
        while history.len() > self.history_capacity {
            history.pop_front();
        }
    }

    /// Rules applied by the most recent optimization, if any.
    pub fn last_applied_rules(&self) -> Option<Vec<String>> {
        self.history.lock().back().map(|r| r.applied_rules.clone())
    }
}

impl std::fmt::Debug for QueryOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryOptimizer")
            .field("rules", &self.rules.read().len())
            .field("history_capacity", &self.history_capacity)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
