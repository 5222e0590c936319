//! # llm-channel-router
//!
//! Decision core for routing LLM work across provider channels.
//!
//! ## Architecture
//!
//! ```text
//! TaskSpec → TaskClassifier → FallbackResolver → [CircuitBreaker → BudgetLedger]* → SelectedRoute
//!                                                                   ↘ TelemetryEmitter
//! ```
//!
//! The [`Router`] never performs the provider call. Callers execute the call
//! on the returned channel and report the outcome back with
//! [`Router::report_outcome`].

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod metrics;
pub mod routing;
pub mod telemetry;

// Re-exports for convenience
pub use config::store::ConfigStore;
pub use config::validation::ConfigError;
pub use config::{LogFormat, RouterConfig};
pub use routing::{
    BudgetLedger, BudgetOutcome, BudgetSnapshot, Category, ChannelId, CircuitBreaker,
    CircuitStats, CircuitStatus, FallbackResolver, Router, SelectedRoute, TaskClassifier,
    TaskKind, TaskSpec,
};
pub use telemetry::{TelemetryEmitter, TelemetryEvent, TelemetryKind};

/// Initialise the global tracing subscriber.
///
/// `format` is normally `[observability].log_format` from the loaded config.
/// The `LOG_FORMAT` environment variable overrides it when set to `"json"`
/// or `"pretty"`; other values are ignored.
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=llm_channel_router=debug`).
///
/// # Errors
///
/// Returns [`RoutingError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
///
/// # Example
///
/// ```no_run
/// # use llm_channel_router::{init_tracing, Router, RoutingError};
/// # fn example() -> Result<(), RoutingError> {
/// let router = Router::from_file(std::path::Path::new("router.toml"))?;
/// init_tracing(&router.config().config().observability.log_format)?;
/// # Ok(()) }
/// ```
pub fn init_tracing(format: &LogFormat) -> Result<(), RoutingError> {
    let env = std::env::var("LOG_FORMAT").ok();

    let result = match resolve_log_format(format, env.as_deref()) {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| RoutingError::Other(format!("tracing init failed: {e}")))
}

fn resolve_log_format(configured: &LogFormat, env: Option<&str>) -> LogFormat {
    match env {
        Some("json") => LogFormat::Json,
        Some("pretty") => LogFormat::Pretty,
        _ => configured.clone(),
    }
}

/// Top-level routing errors.
///
/// Only the [`Router`] produces these; the budget ledger and the circuit
/// breaker report through outcome values instead.
#[derive(Error, Debug)]
pub enum RoutingError {
    /// Configuration is missing or invalid. Fatal at startup; at request time
    /// this only appears if a classified category has no configured chain.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Every candidate channel for the category was circuit-open or
    /// budget-blocked. Not retried internally.
    #[error("all channels unavailable for category '{category}' (considered: {considered:?})")]
    AllChannelsUnavailable {
        /// Category the task was classified into.
        category: Category,
        /// Channels configured for the category, in chain order.
        considered: Vec<ChannelId>,
    },

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

impl RoutingError {
    /// Return `true` for [`RoutingError::AllChannelsUnavailable`].
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::AllChannelsUnavailable { .. })
    }
}
