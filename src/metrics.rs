//! Prometheus metrics for the routing core.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The recording helpers are
//! no-ops if `init_metrics` was never called, so routing is always safe to
//! run and observability simply degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `router_decisions_total` | Counter | `category`, `channel`, `outcome` |
//! | `router_exhausted_total` | Counter | `category` |
//! | `router_budget_admissions_total` | Counter | `channel`, `outcome` |
//! | `router_breaker_transitions_total` | Counter | `channel`, `to` |
//! | `router_route_duration_seconds` | Histogram | `category` |

use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

use crate::routing::{BudgetOutcome, CircuitStatus};
use crate::telemetry::TelemetryKind;
use crate::RoutingError;

/// All Prometheus metrics for the router, stored in a single [`OnceLock`].
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Successful routing decisions.
    pub decisions_total: CounterVec,
    /// Routes that exhausted every candidate.
    pub exhausted_total: CounterVec,
    /// Budget reservation attempts by outcome.
    pub budget_admissions_total: CounterVec,
    /// Breaker transitions by target state.
    pub breaker_transitions_total: CounterVec,
    /// Time spent inside `route()`.
    pub route_duration: HistogramVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn init_error(e: prometheus::Error) -> RoutingError {
    RoutingError::Other(format!("metrics init failed: {e}"))
}

fn counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<CounterVec, RoutingError> {
    let c = CounterVec::new(Opts::new(name, help), labels).map_err(init_error)?;
    registry.register(Box::new(c.clone())).map_err(init_error)?;
    Ok(c)
}

/// Initialise all metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`RoutingError::Other`] if metric construction or registration fails.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), RoutingError> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let decisions_total = counter(
        &registry,
        "router_decisions_total",
        "Routing decisions by category, channel and budget outcome",
        &["category", "channel", "outcome"],
    )?;
    let exhausted_total = counter(
        &registry,
        "router_exhausted_total",
        "Routes with no admissible channel",
        &["category"],
    )?;
    let budget_admissions_total = counter(
        &registry,
        "router_budget_admissions_total",
        "Budget reservation attempts by outcome",
        &["channel", "outcome"],
    )?;
    let breaker_transitions_total = counter(
        &registry,
        "router_breaker_transitions_total",
        "Circuit breaker transitions by target state",
        &["channel", "to"],
    )?;

    let route_duration = HistogramVec::new(
        HistogramOpts::new("router_route_duration_seconds", "Time spent deciding a route")
            .buckets(vec![1e-6, 5e-6, 1e-5, 5e-5, 1e-4, 5e-4, 1e-3, 5e-3]),
        &["category"],
    )
    .map_err(init_error)?;
    registry
        .register(Box::new(route_duration.clone()))
        .map_err(init_error)?;

    // If another thread raced us the first one wins; both are identical.
    let _ = METRICS.set(Metrics {
        registry,
        decisions_total,
        exhausted_total,
        budget_admissions_total,
        breaker_transitions_total,
        route_duration,
    });

    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

fn outcome_label(outcome: BudgetOutcome) -> &'static str {
    match outcome {
        BudgetOutcome::Allow => "allow",
        BudgetOutcome::SoftCapExceeded => "soft_cap_exceeded",
        BudgetOutcome::Blocked => "blocked",
    }
}

fn status_label(status: CircuitStatus) -> &'static str {
    match status {
        CircuitStatus::Closed => "closed",
        CircuitStatus::Open => "open",
        CircuitStatus::HalfOpen => "half_open",
    }
}

fn inc(vec: &CounterVec, labels: &[&str]) {
    if let Ok(c) = vec.get_metric_with_label_values(labels) {
        c.inc();
    }
}

/// Mirror a telemetry event into the counters.
///
/// No-op if metrics have not been initialised.
pub fn record_event(kind: &TelemetryKind) {
    let Some(m) = metrics() else {
        return;
    };
    match kind {
        TelemetryKind::RouteDecision {
            category,
            channel,
            outcome,
            ..
        } => inc(
            &m.decisions_total,
            &[category.as_str(), channel.as_str(), outcome_label(*outcome)],
        ),
        TelemetryKind::RouteExhausted { category, .. } => {
            inc(&m.exhausted_total, &[category.as_str()])
        }
        TelemetryKind::BudgetAdmission {
            channel, outcome, ..
        } => inc(
            &m.budget_admissions_total,
            &[channel.as_str(), outcome_label(*outcome)],
        ),
        TelemetryKind::BreakerTransition { channel, to, .. } => inc(
            &m.breaker_transitions_total,
            &[channel.as_str(), status_label(*to)],
        ),
        TelemetryKind::BudgetWindowRollover { .. } => {}
    }
}

/// Record how long a `route()` call took.
///
/// No-op if metrics have not been initialised.
pub fn record_route_duration(category: &str, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(h) = m.route_duration.get_metric_with_label_values(&[category]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised.
pub fn gather_metrics() -> String {
    let Some(m) = metrics() else {
        return String::new();
    };
    let mut buf = Vec::new();
    if TextEncoder::new().encode(&m.registry.gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{Category, ChannelId};

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_recorded_decision_appears_in_output() {
        init_metrics().expect("test: init");
        record_event(&TelemetryKind::RouteDecision {
            decision_id: uuid::Uuid::new_v4(),
            category: Category::new("metrics-test"),
            matched_rule: None,
            channel: ChannelId::new("metrics-chan"),
            outcome: BudgetOutcome::SoftCapExceeded,
            estimated_cost_usd: 0.1,
            skipped: vec![],
            half_open_trial: false,
        });
        record_route_duration("metrics-test", Duration::from_micros(3));
        let out = gather_metrics();
        assert!(out.contains("router_decisions_total"));
        assert!(out.contains("soft_cap_exceeded"));
        assert!(out.contains("router_route_duration_seconds"));
    }

    #[test]
    fn test_labels_are_snake_case() {
        assert_eq!(outcome_label(BudgetOutcome::Blocked), "blocked");
        assert_eq!(status_label(CircuitStatus::HalfOpen), "half_open");
    }
}
