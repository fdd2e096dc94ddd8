//! Query routing across backend kinds.
//!
//! This module determines which executor handles a descriptor, based on
//! routing rules, executor liveness and capability requirements.
//!
//! # Algorithm
//!
//! 1. Evaluate every enabled [`RoutingRule`] against the descriptor.
//! 2. Score each match: `0.7 + min(priority * 0.05, 0.2) + feature signal`,
//!    capped at 1.0.
//! 3. Order matches by priority, then confidence. Ties keep registration
//!    order.
//! 4. The first match whose kind satisfies the descriptor's required
//!    features and has a live executor wins.
//! 5. Without a usable match, the fixed fallback order
//!    (relational, then time-series, then any other registered kind) picks
//!    the first kind with a live executor. Such decisions are flagged
//!    ambiguous and carry a confidence below the confident threshold.
//! 6. Up to two alternatives are drawn from the remaining matches, then
//!    from other live instances.
//!
//! Routing fails with [`RoutingError::NoBackendAvailable`] only when no kind
//! has a live executor.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::core::{BackendKind, CapabilityRegistry, DynExecutor};
use crate::query::QueryDescriptor;

use super::analyzer::{QueryAnalysis, QueryAnalyzer, QueryFeature};
use super::health::HealthReport;
use super::rules::{RoutingRule, default_routing_rules};

/// Confidence at or above which a decision is considered confident.
pub const CONFIDENT_THRESHOLD: f64 = 0.7;

/// Confidence assigned to fallback-order decisions.
pub const FALLBACK_CONFIDENCE: f64 = 0.5;

const MAX_ALTERNATIVES: usize = 2;

/// How an executor is picked among live instances of one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionPolicy {
    /// Rotate through instances.
    #[default]
    RoundRobin,
    /// Pick the instance with the fewest active connections.
    LeastLoaded,
}

/// A routing target.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Backend kind.
    pub kind: BackendKind,

    /// Selected executor.
    pub executor: DynExecutor,

    /// Rule that nominated this candidate, if any.
    pub rule: Option<String>,
}

impl Candidate {
    /// Identifier of the selected executor.
    pub fn executor_id(&self) -> &str {
        self.executor.id()
    }
}

/// Routing decision for a descriptor.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    /// Primary target.
    pub primary: Candidate,

    /// Up to two fallback targets, in order.
    pub alternatives: Vec<Candidate>,

    /// Confidence in `[0, 1]`.
    pub confidence: f64,

    /// Human-readable rationale.
    pub rationale: String,

    /// Names of every matching rule, strongest first.
    pub matched_rules: Vec<String>,

    /// True if the decision came from the fallback order.
    pub ambiguous: bool,

    /// Analysis used for this decision.
    pub analysis: QueryAnalysis,
}

impl RoutingDecision {
    /// Kind of the primary target.
    pub fn backend_kind(&self) -> BackendKind {
        self.primary.kind
    }

    /// Executor id of the primary target.
    pub fn executor_id(&self) -> &str {
        self.primary.executor_id()
    }

    /// Primary followed by alternatives.
    pub fn candidates(&self) -> impl Iterator<Item = &Candidate> {
        std::iter::once(&self.primary).chain(self.alternatives.iter())
    }

    /// Returns true if confidence meets the confident threshold.
    pub fn is_confident(&self) -> bool {
        self.confidence >= CONFIDENT_THRESHOLD
    }
}

/// Routing counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoutingMetrics {
    /// Decisions made.
    pub total_routes: u64,

    /// Decisions made through the fallback order.
    pub fallback_routes: u64,

    /// Decisions pinned to a kind by the caller.
    pub pinned_routes: u64,

    /// Decisions by target kind.
    pub routes_by_kind: BTreeMap<String, u64>,

    /// Winning rule counts.
    pub rule_hits: BTreeMap<String, u64>,

    /// Mean confidence over all decisions.
    pub average_confidence: f64,

    #[serde(skip)]
    confidence_total: f64,
}

impl RoutingMetrics {
    fn record(&mut self, decision: &RoutingDecision, pinned: bool) {
        self.total_routes += 1;
        if decision.ambiguous {
            self.fallback_routes += 1;
        }
        if pinned {
            self.pinned_routes += 1;
        }
        *self
            .routes_by_kind
            .entry(decision.primary.kind.to_string())
            .or_default() += 1;
        if let Some(ref rule) = decision.primary.rule {
            *self.rule_hits.entry(rule.clone()).or_default() += 1;
        }
        self.confidence_total += decision.confidence;
        self.average_confidence = self.confidence_total / self.total_routes as f64;
    }
}

/// Errors raised while routing.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    /// No kind has a live executor.
    #[error("no live backend available for '{entity}'")]
    NoBackendAvailable {
        /// Entity being routed.
        entity: String,
        /// Rules that matched but could not be served.
        skipped: Vec<String>,
    },
}

#[derive(Debug, Default)]
struct KindPool {
    executors: Vec<DynExecutor>,
    cursor: AtomicUsize,
}

/// Routes descriptors to backend executors.
pub struct QueryRouter {
    analyzer: QueryAnalyzer,
    registry: Arc<CapabilityRegistry>,
    rules: RwLock<Vec<RoutingRule>>,
    pools: RwLock<BTreeMap<BackendKind, KindPool>>,
    live: RwLock<HashMap<String, bool>>,
    metrics: Mutex<RoutingMetrics>,
}

impl QueryRouter {
    /// Creates a router with the built-in rules.
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self::with_analyzer(registry, QueryAnalyzer::new())
    }

    /// Creates a router with a custom analyzer and the built-in rules.
    pub fn with_analyzer(registry: Arc<CapabilityRegistry>, analyzer: QueryAnalyzer) -> Self {
        let rules = default_routing_rules(&analyzer);
        Self {
            analyzer,
            registry,
            rules: RwLock::new(rules),
            pools: RwLock::new(BTreeMap::new()),
            live: RwLock::new(HashMap::new()),
            metrics: Mutex::new(RoutingMetrics::default()),
        }
    }

    /// Returns the analyzer.
    pub fn analyzer(&self) -> &QueryAnalyzer {
        &self.analyzer
    }

    // ========================================================================
    // Executors
    // ========================================================================

    /// Declares a kind the router is expected to serve, even without executors.
    pub fn declare_kind(&self, kind: BackendKind) {
        self.pools.write().entry(kind).or_default();
    }

    /// Registers an executor. Newly registered executors are live.
    pub fn register(&self, executor: DynExecutor) {
        let kind = executor.kind();
        let id = executor.id().to_string();
        {
            let mut pools = self.pools.write();
            let pool = pools.entry(kind).or_default();
            pool.executors.retain(|e| e.id() != id);
            pool.executors.push(executor);
        }
        self.live.write().insert(id.clone(), true);
        info!(kind = %kind, executor = %id, "registered executor");
    }

    /// Removes an executor by id. Returns true if it was registered.
    pub fn deregister(&self, executor_id: &str) -> bool {
        let mut removed = false;
        for pool in self.pools.write().values_mut() {
            let before = pool.executors.len();
            pool.executors.retain(|e| e.id() != executor_id);
            removed |= pool.executors.len() != before;
        }
        self.live.write().remove(executor_id);
        removed
    }

    /// Returns every registered executor.
    pub fn executors(&self) -> Vec<DynExecutor> {
        self.pools
            .read()
            .values()
            .flat_map(|p| p.executors.iter().cloned())
            .collect()
    }

    /// Returns registered executors of one kind.
    pub fn executors_of(&self, kind: BackendKind) -> Vec<DynExecutor> {
        self.pools
            .read()
            .get(&kind)
            .map(|p| p.executors.clone())
            .unwrap_or_default()
    }

    /// Returns every declared or registered kind.
    pub fn kinds(&self) -> Vec<BackendKind> {
        self.pools.read().keys().copied().collect()
    }

    /// Marks an executor live or not.
    pub fn set_live(&self, executor_id: &str, live: bool) {
        if let Some(flag) = self.live.write().get_mut(executor_id) {
            if *flag != live {
                debug!(executor = executor_id, live, "executor liveness changed");
            }
            *flag = live;
        }
    }

    /// Returns true if the executor is registered and live.
    pub fn is_live(&self, executor_id: &str) -> bool {
        self.live.read().get(executor_id).copied().unwrap_or(false)
    }

    /// Returns true if the kind has at least one live executor.
    pub fn has_live_executor(&self, kind: BackendKind) -> bool {
        let pools = self.pools.read();
        let live = self.live.read();
        pools.get(&kind).is_some_and(|p| {
            p.executors
                .iter()
                .any(|e| live.get(e.id()).copied().unwrap_or(false))
        })
    }

    /// Picks a live executor of `kind`, skipping `exclude`.
    pub fn select_executor(
        &self,
        kind: BackendKind,
        policy: SelectionPolicy,
        exclude: &[String],
    ) -> Option<DynExecutor> {
        self.select(kind, policy, exclude, true)
    }

    fn select(
        &self,
        kind: BackendKind,
        policy: SelectionPolicy,
        exclude: &[String],
        advance: bool,
    ) -> Option<DynExecutor> {
        let pools = self.pools.read();
        let pool = pools.get(&kind)?;
        let live = self.live.read();

        let eligible: Vec<&DynExecutor> = pool
            .executors
            .iter()
            .filter(|e| live.get(e.id()).copied().unwrap_or(false))
            .filter(|e| !exclude.iter().any(|x| x == e.id()))
            .collect();

        if eligible.is_empty() {
            return None;
        }

        match policy {
            SelectionPolicy::RoundRobin => {
                let start = if advance {
                    pool.cursor.fetch_add(1, Ordering::Relaxed)
                } else {
                    pool.cursor.load(Ordering::Relaxed)
                };
                Some(eligible[start % eligible.len()].clone())
            }
            SelectionPolicy::LeastLoaded => eligible
                .into_iter()
                .min_by_key(|e| {
                    let stats = e.pool_stats();
                    (stats.active, stats.pending)
                })
                .cloned(),
        }
    }

    // ========================================================================
    // Rules
    // ========================================================================

    /// Adds a rule, replacing any rule with the same name.
    pub fn add_rule(&self, rule: RoutingRule) {
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
    pub fn rules(&self) -> Vec<RoutingRule> {
        self.rules.read().clone()
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Routes a descriptor, rotating through instances of the chosen kind.
    pub fn route(&self, query: &QueryDescriptor) -> Result<RoutingDecision, RoutingError> {
        self.route_with_policy(query, SelectionPolicy::RoundRobin)
    }

    /// Routes a descriptor with an explicit instance selection policy.
    #[instrument(skip(self, query), fields(entity = %query.entity, operation = %query.operation))]
    pub fn route_with_policy(
        &self,
        query: &QueryDescriptor,
        policy: SelectionPolicy,
    ) -> Result<RoutingDecision, RoutingError> {
        let decision = self.decide(query, policy, true)?;
        self.metrics.lock().record(&decision, false);
        debug!(
            kind = %decision.primary.kind,
            executor = decision.executor_id(),
            confidence = decision.confidence,
            ambiguous = decision.ambiguous,
            "routed query"
        );
        Ok(decision)
    }

    /// Routes a descriptor to a fixed kind.
    pub fn route_pinned(
        &self,
        query: &QueryDescriptor,
        kind: BackendKind,
        policy: SelectionPolicy,
    ) -> Result<RoutingDecision, RoutingError> {
        let analysis = self.analyzer.analyze(query);
        let primary = self.select(kind, policy, &[], true).ok_or_else(|| {
            RoutingError::NoBackendAvailable {
                entity: query.entity.clone(),
                skipped: vec![format!("pinned kind {} has no live executor", kind)],
            }
        })?;

        let mut used = vec![primary.id().to_string()];
        let mut alternatives = Vec::new();
        while alternatives.len() < MAX_ALTERNATIVES {
            match self.select(kind, policy, &used, false) {
                Some(executor) => {
                    used.push(executor.id().to_string());
                    alternatives.push(Candidate {
                        kind,
                        executor,
                        rule: None,
                    });
                }
                None => break,
            }
        }

        let decision = RoutingDecision {
            primary: Candidate {
                kind,
                executor: primary,
                rule: None,
            },
            alternatives,
            confidence: 1.0,
            rationale: format!("pinned to {}", kind),
            matched_rules: Vec::new(),
            ambiguous: false,
            analysis,
        };
        self.metrics.lock().record(&decision, true);
        Ok(decision)
    }

    /// Resolves the kind a descriptor would route to, without side effects.
    pub fn resolve_kind(&self, query: &QueryDescriptor) -> Result<BackendKind, RoutingError> {
        self.decide(query, SelectionPolicy::RoundRobin, false)
            .map(|d| d.primary.kind)
    }

    /// Returns every live executor not already part of the decision.
    ///
    /// The decision's kind comes first, then the fallback order.
    pub fn failover_candidates(&self, decision: &RoutingDecision) -> Vec<Candidate> {
        let used: Vec<String> = decision
            .candidates()
            .map(|c| c.executor_id().to_string())
            .collect();

        let mut out = Vec::new();
        for kind in self.kind_order(Some(decision.primary.kind)) {
            for executor in self.executors_of(kind) {
                if self.is_live(executor.id()) && !used.iter().any(|u| u == executor.id()) {
                    out.push(Candidate {
                        kind,
                        executor,
                        rule: None,
                    });
                }
            }
        }
        out
    }

    fn decide(
        &self,
        query: &QueryDescriptor,
        policy: SelectionPolicy,
        commit: bool,
    ) -> Result<RoutingDecision, RoutingError> {
        let analysis = self.analyzer.analyze(query);

        let mut matches: Vec<(String, BackendKind, u8, f64)> = self
            .rules
            .read()
            .iter()
            .filter(|r| r.matches(query))
            .map(|r| {
                let confidence = confidence_for(r.priority, r.target, &analysis);
                (r.name.clone(), r.target, r.priority, confidence)
            })
            .collect();

        matches.sort_by(|a, b| {
            b.2.cmp(&a.2)
                .then(b.3.partial_cmp(&a.3).unwrap_or(std::cmp::Ordering::Equal))
        });

        let matched_rules: Vec<String> = matches.iter().map(|m| m.0.clone()).collect();
        let mut skipped = Vec::new();
        let mut chosen: Option<(usize, Candidate, f64)> = None;

        for (i, (name, kind, _, confidence)) in matches.iter().enumerate() {
            if !self.satisfies_requirements(*kind, query) {
                skipped.push(format!("{} ({} lacks a required feature)", name, kind));
                continue;
            }
            match self.select(*kind, policy, &[], commit) {
                Some(executor) => {
                    chosen = Some((
                        i,
                        Candidate {
                            kind: *kind,
                            executor,
                            rule: Some(name.clone()),
                        },
                        *confidence,
                    ));
                    break;
                }
                None => skipped.push(format!("{} (no live {} executor)", name, kind)),
            }
        }

        let (primary, confidence, rationale, ambiguous, next_match) = match chosen {
            Some((i, candidate, confidence)) => {
                let rationale = format!(
                    "rule '{}' routed to {}",
                    candidate.rule.as_deref().unwrap_or_default(),
                    candidate.kind
                );
                (candidate, confidence, rationale, false, i + 1)
            }
            None => {
                let mut fallback = None;
                for kind in self.kind_order(None) {
                    if let Some(executor) = self.select(kind, policy, &[], commit) {
                        fallback = Some(Candidate {
                            kind,
                            executor,
                            rule: None,
                        });
                        break;
                    }
                }
                let Some(candidate) = fallback else {
                    return Err(RoutingError::NoBackendAvailable {
                        entity: query.entity.clone(),
                        skipped,
                    });
                };
                let rationale = if matches.is_empty() {
                    format!("no rule matched; fallback order chose {}", candidate.kind)
                } else {
                    format!(
                        "matched rules unusable [{}]; fallback order chose {}",
                        skipped.join(", "),
                        candidate.kind
                    )
                };
                (candidate, FALLBACK_CONFIDENCE, rationale, true, matches.len())
            }
        };

        let mut used = vec![primary.executor_id().to_string()];
        let mut alternatives = Vec::new();

        for (name, kind, _, _) in matches.iter().skip(next_match) {
            if alternatives.len() >= MAX_ALTERNATIVES {
                break;
            }
            if let Some(executor) = self.select(*kind, policy, &used, false) {
                used.push(executor.id().to_string());
                alternatives.push(Candidate {
                    kind: *kind,
                    executor,
                    rule: Some(name.clone()),
                });
            }
        }

        for kind in self.kind_order(Some(primary.kind)) {
            while alternatives.len() < MAX_ALTERNATIVES {
                match self.select(kind, policy, &used, false) {
                    Some(executor) => {
                        used.push(executor.id().to_string());
                        alternatives.push(Candidate {
                            kind,
                            executor,
                            rule: None,
                        });
                    }
                    None => break,
                }
            }
        }

        Ok(RoutingDecision {
            primary,
            alternatives,
            confidence,
            rationale,
            matched_rules,
            ambiguous,
            analysis,
        })
    }

    fn satisfies_requirements(&self, kind: BackendKind, query: &QueryDescriptor) -> bool {
        if query.required_features.is_empty() {
            return true;
        }
        let profile = self.registry.describe(kind);
        query.required_features.iter().all(|f| profile.supports(f))
    }

    /// Kinds in fallback order, optionally led by `first`.
    fn kind_order(&self, first: Option<BackendKind>) -> Vec<BackendKind> {
        let mut order: Vec<BackendKind> = first.into_iter().collect();
        for kind in BackendKind::FALLBACK_ORDER {
            if !order.contains(&kind) {
                order.push(kind);
            }
        }
        for kind in self.kinds() {
            if !order.contains(&kind) {
                order.push(kind);
            }
        }
        order
    }

    // ========================================================================
    // Health and metrics
    // ========================================================================

    /// Probes every executor and updates liveness from the raw result.
    pub async fn health_check(&self) -> HealthReport {
        for executor in self.executors() {
            let healthy = executor.health_check().await;
            self.set_live(executor.id(), healthy);
        }
        self.health_report()
    }

    /// Builds a health report from current liveness without probing.
    pub fn health_report(&self) -> HealthReport {
        let pools = self.pools.read();
        let live = self.live.read();
        let kinds: Vec<BackendKind> = pools.keys().copied().collect();
        let instances = pools
            .iter()
            .flat_map(|(kind, pool)| {
                pool.executors.iter().map(|e| {
                    (
                        *kind,
                        e.id().to_string(),
                        live.get(e.id()).copied().unwrap_or(false),
                    )
                })
            })
            .collect::<Vec<_>>();
        HealthReport::from_instances(&kinds, instances)
    }

    /// Returns a snapshot of routing counters.
    pub fn metrics(&self) -> RoutingMetrics {
        self.metrics.lock().clone()
    }
}

impl std::fmt::Debug for QueryRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRouter")
            .field("kinds", &self.kinds())
            .field("rules", &self.rules.read().len())
            .finish_non_exhaustive()
    }
}

/// Computes the confidence of a rule match.
pub fn confidence_for(priority: u8, target: BackendKind, analysis: &QueryAnalysis) -> f64 {
    let base = CONFIDENT_THRESHOLD + (priority as f64 * 0.05).min(0.2);

    let signal = match target {
        BackendKind::TimeSeries => {
            let mut s = 0.0;
            if analysis.is_time_series_like() {
                s += 0.2;
            }
            if analysis.has(QueryFeature::AppendWrite) {
                s += 0.15;
            }
            s
        }
        BackendKind::Relational => {
            if analysis.has(QueryFeature::Join) {
                0.25
            } else if analysis.has(QueryFeature::Window) {
                0.2
            } else if analysis.has(QueryFeature::Aggregation) {
                0.15
            } else {
                0.0
            }
        }
        BackendKind::Custom(_) => 0.0,
    };

    (base + signal).min(1.0)
}
