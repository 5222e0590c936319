//! The routing decision function.
//!
//! [`Router`] composes the classifier, resolver, breaker and ledger into a
//! single synchronous call. It never touches the network: the caller performs
//! the provider call on the returned channel and reports the outcome back.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::store::ConfigStore;
use crate::config::validation::ConfigError;
use crate::metrics;
use crate::telemetry::{TelemetryEmitter, TelemetryEvent, TelemetryKind};
use crate::RoutingError;

use super::breaker::CircuitBreaker;
use super::budget::{estimate_cost, BudgetLedger, BudgetOutcome};
use super::classifier::TaskClassifier;
use super::fallback::FallbackResolver;
use super::task::{Category, ChannelId, TaskSpec};

/// A routing decision handed back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedRoute {
    /// Correlates with the `route_decision` telemetry event.
    pub decision_id: Uuid,
    /// Channel to call.
    pub channel: ChannelId,
    /// Category the task was classified into.
    pub category: Category,
    /// Untried tail of the candidate list, for local retries.
    pub remaining: Vec<ChannelId>,
    /// Budget outcome of the reservation on `channel`.
    pub budget_outcome: BudgetOutcome,
    /// Amount reserved on `channel`, in USD.
    pub estimated_cost_usd: f64,
    /// UTC budget window the reservation was taken in.
    pub window: NaiveDate,
    /// Whether this request is the half-open breaker trial for `channel`.
    pub half_open_trial: bool,
    /// Informational latency target of the category.
    pub latency_target_ms: Option<u64>,
}

impl SelectedRoute {
    /// Whether the caller should prefer a cheaper channel next time.
    pub fn soft_cap_exceeded(&self) -> bool {
        self.budget_outcome == BudgetOutcome::SoftCapExceeded
    }
}

/// Channel router.
///
/// `Send + Sync`; share it behind an [`Arc`].
#[derive(Debug)]
pub struct Router {
    store: Arc<ConfigStore>,
    classifier: TaskClassifier,
    resolver: FallbackResolver,
    breaker: Arc<CircuitBreaker>,
    ledger: BudgetLedger,
    telemetry: Arc<TelemetryEmitter>,
}

impl Router {
    /// Build a router over a validated configuration.
    pub fn new(store: ConfigStore) -> Self {
        let store = Arc::new(store);
        let telemetry = Arc::new(TelemetryEmitter::new(store.telemetry_capacity()));
        let breaker = Arc::new(CircuitBreaker::new(&store, Arc::clone(&telemetry)));
        let ledger = BudgetLedger::new(&store, Arc::clone(&telemetry));
        let classifier = TaskClassifier::new(&store);
        let resolver = FallbackResolver::new(Arc::clone(&store), Arc::clone(&breaker));
        Self {
            store,
            classifier,
            resolver,
            breaker,
            ledger,
            telemetry,
        }
    }

    /// Load a TOML configuration file and build a router from it.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::Config`] if the file cannot be read, parsed or
    /// validated.
    pub fn from_file(path: &Path) -> Result<Self, RoutingError> {
        Ok(Self::new(ConfigStore::load(path)?))
    }

    /// Build a router from TOML content.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::Config`] if the content cannot be parsed or
    /// validated.
    pub fn from_toml(content: &str) -> Result<Self, RoutingError> {
        Ok(Self::new(ConfigStore::from_toml(content)?))
    }

    /// Choose a channel for `task`.
    ///
    /// Walks the category's fallback chain in order. A candidate refused by
    /// its breaker is skipped without consulting the budget. A candidate
    /// whose budget is blocked is skipped with nothing reserved. The first
    /// admitted candidate is returned.
    ///
    /// # Errors
    ///
    /// - [`RoutingError::AllChannelsUnavailable`] if no candidate is admitted.
    /// - [`RoutingError::Config`] if the classified category has no chain.
    pub fn route(&self, task: &TaskSpec) -> Result<SelectedRoute, RoutingError> {
        self.route_at(task, Instant::now(), Utc::now())
    }

    /// As [`Router::route`], with breaker time `now` and budget time `wall`.
    ///
    /// # Errors
    ///
    /// See [`Router::route`].
    pub fn route_at(
        &self,
        task: &TaskSpec,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> Result<SelectedRoute, RoutingError> {
        let started = Instant::now();
        let category = self.classifier.classify(task);
        let result = self.select(task, &category, now, wall);
        metrics::record_route_duration(category.as_str(), started.elapsed());
        result
    }

    fn select(
        &self,
        task: &TaskSpec,
        category: &Category,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> Result<SelectedRoute, RoutingError> {
        let candidates = self
            .resolver
            .resolve_at(category, now)
            .ok_or_else(|| ConfigError::UnknownCategory(category.to_string()))?;

        let mut skipped = Vec::new();
        for (position, channel) in candidates.iter().enumerate() {
            let Some(half_open_trial) = self.breaker.admit_at(channel, now) else {
                debug!(channel = %channel, category = %category, "candidate skipped: breaker open");
                skipped.push(channel.clone());
                continue;
            };

            let estimated_cost_usd = self
                .store
                .channel(channel)
                .map(|c| estimate_cost(task.context_tokens, c.cost_per_1k_tokens))
                .unwrap_or(0.0);

            let outcome = self.ledger.check_and_reserve_at(channel, estimated_cost_usd, wall);
            if outcome == BudgetOutcome::Blocked {
                if half_open_trial {
                    self.breaker.abandon_trial(channel);
                }
                debug!(channel = %channel, category = %category, "candidate skipped: budget blocked");
                skipped.push(channel.clone());
                continue;
            }

            let route = SelectedRoute {
                decision_id: Uuid::new_v4(),
                channel: channel.clone(),
                category: category.clone(),
                remaining: candidates[position + 1..].to_vec(),
                budget_outcome: outcome,
                estimated_cost_usd,
                window: wall.date_naive(),
                half_open_trial,
                latency_target_ms: self.store.latency_target_ms(category),
            };

            debug!(
                decision_id = %route.decision_id,
                channel = %route.channel,
                category = %category,
                outcome = ?outcome,
                estimate_usd = estimated_cost_usd,
                "route selected"
            );

            self.telemetry.emit(TelemetryKind::RouteDecision {
                decision_id: route.decision_id,
                category: category.clone(),
                matched_rule: self.classifier.explain(task),
                channel: route.channel.clone(),
                outcome,
                estimated_cost_usd,
                skipped,
                half_open_trial,
            });
            return Ok(route);
        }

        let considered = self
            .store
            .chain(category)
            .map(<[ChannelId]>::to_vec)
            .unwrap_or_default();
        warn!(
            category = %category,
            considered = ?considered,
            "route exhausted: every channel open or over budget"
        );
        self.telemetry.emit(TelemetryKind::RouteExhausted {
            category: category.clone(),
            considered: considered.clone(),
        });
        Err(RoutingError::AllChannelsUnavailable {
            category: category.clone(),
            considered,
        })
    }

    /// Feed the result of a provider call on `channel` back into its breaker.
    pub fn report_outcome(&self, channel: &ChannelId, success: bool) {
        self.report_outcome_at(channel, success, Instant::now());
    }

    /// As [`Router::report_outcome`], evaluated at `now`.
    pub fn report_outcome_at(&self, channel: &ChannelId, success: bool, now: Instant) {
        if success {
            self.breaker.on_success_at(channel, now);
        } else {
            self.breaker.on_error_at(channel, now);
        }
    }

    /// Replace the reservation made for `route` with the call's measured
    /// cost. Returns `false` for unknown channels and for routes whose budget
    /// window has since closed.
    pub fn reconcile_spend(&self, route: &SelectedRoute, actual_usd: f64) -> bool {
        self.reconcile_spend_at(route, actual_usd, Utc::now())
    }

    /// As [`Router::reconcile_spend`], evaluated at `wall`.
    pub fn reconcile_spend_at(
        &self,
        route: &SelectedRoute,
        actual_usd: f64,
        wall: DateTime<Utc>,
    ) -> bool {
        self.ledger.reconcile_at(
            &route.channel,
            route.window,
            route.estimated_cost_usd,
            actual_usd,
            wall,
        )
    }

    /// Retained telemetry, oldest first.
    pub fn snapshot_telemetry(&self) -> Vec<TelemetryEvent> {
        self.telemetry.snapshot()
    }

    /// Subscribe to telemetry emitted from now on.
    pub fn subscribe_telemetry(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.telemetry.subscribe()
    }

    /// The configuration this router was built from.
    pub fn config(&self) -> &ConfigStore {
        &self.store
    }

    /// The task classifier.
    pub fn classifier(&self) -> &TaskClassifier {
        &self.classifier
    }

    /// The fallback resolver.
    pub fn resolver(&self) -> &FallbackResolver {
        &self.resolver
    }

    /// The per-channel circuit breakers.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// The per-channel budget ledger.
    pub fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    /// The telemetry emitter.
    pub fn telemetry(&self) -> &TelemetryEmitter {
        &self.telemetry
    }
}
