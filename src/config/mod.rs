//! # Stage: Declarative Routing Configuration
//!
//! ## Responsibility
//! Parse and validate the TOML file that defines channels, spend caps,
//! breaker thresholds, category chains and classification rules, and expose
//! it through a read-only [`store::ConfigStore`].
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `RouterConfig`
//! - Validated: all semantic constraints are checked before a store is built
//! - Immutable: nothing in this module changes after startup
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Per-channel mutable state (that belongs to `routing::budget` and `routing::breaker`)
//! - Hot reload (configuration is loaded once per process)

pub mod loader;
pub mod store;
pub mod validation;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::routing::TaskKind;

// ── Default value functions ──────────────────────────────────────────────

/// Default category used when no rule matches.
fn default_category() -> String {
    "general".to_string()
}

/// Default telemetry ring-buffer capacity.
fn default_telemetry_capacity() -> usize {
    1024
}

/// Default consecutive failures before a breaker opens.
fn default_failure_threshold() -> u32 {
    5
}

/// Default breaker cooldown: 300 seconds.
fn default_cooldown_s() -> u64 {
    300
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root routing configuration.
///
/// # Example
///
/// ```toml
/// [router]
/// name = "production"
///
/// [[channels]]
/// id = "claude-main"
/// provider = "anthropic"
/// model = "claude-sonnet"
/// cost_per_1k_tokens = 0.003
/// soft_cap_usd = 5.0
/// hard_cap_usd = 20.0
///
/// [[categories]]
/// name = "general"
/// chain = ["claude-main"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RouterConfig {
    /// Router identity and global settings.
    pub router: RouterSection,
    /// Default breaker settings, overridable per channel.
    #[serde(default)]
    pub breaker: BreakerSection,
    /// Routable channels.
    pub channels: Vec<ChannelConfig>,
    /// Category → ordered channel chain.
    pub categories: Vec<CategoryConfig>,
    /// Classification rules, in declaration order.
    #[serde(default)]
    pub rules: Vec<CategoryRule>,
    /// Logging settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Router identity and global settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RouterSection {
    /// Human-readable router name (e.g. "production").
    pub name: String,
    /// Category used when no rule matches a task.
    #[serde(default = "default_category")]
    pub default_category: String,
    /// Number of telemetry events retained in memory.
    #[serde(default = "default_telemetry_capacity")]
    pub telemetry_capacity: usize,
}

/// Breaker defaults applied to every channel without an override.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BreakerSection {
    /// Consecutive failures before the breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds to stay open before allowing a half-open trial.
    #[serde(default = "default_cooldown_s")]
    pub cooldown_s: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_s: default_cooldown_s(),
        }
    }
}

// ── Channels ─────────────────────────────────────────────────────────────

/// One routable backend binding (a "virtual key").
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ChannelConfig {
    /// Stable channel identifier referenced by category chains.
    pub id: String,
    /// Provider name, informational (e.g. "anthropic").
    #[serde(default)]
    pub provider: String,
    /// Model name, informational (e.g. "claude-sonnet").
    #[serde(default)]
    pub model: String,
    /// Estimated cost per 1 000 context tokens in USD.
    #[serde(default)]
    pub cost_per_1k_tokens: f64,
    /// Advisory spend threshold per daily window (USD).
    pub soft_cap_usd: f64,
    /// Strict spend ceiling per daily window (USD).
    pub hard_cap_usd: f64,
    /// Per-channel override of `breaker.failure_threshold`.
    pub failure_threshold: Option<u32>,
    /// Per-channel override of `breaker.cooldown_s`.
    pub cooldown_s: Option<u64>,
}

// ── Categories and rules ─────────────────────────────────────────────────

/// A routing bucket and its ordered fallback chain.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CategoryConfig {
    /// Category name (e.g. "coding").
    pub name: String,
    /// Channel ids, primary first.
    pub chain: Vec<String>,
    /// Latency target for the category. Informational, not enforced.
    pub latency_target_ms: Option<u64>,
}

/// Maps a predicate over task fields to a category.
///
/// Every field except `category` is optional; an unset field matches any
/// task. The more fields a rule sets, the earlier it is evaluated.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CategoryRule {
    /// Category assigned when the predicate matches.
    pub category: String,
    /// Task kinds this rule applies to. Empty matches any kind.
    #[serde(default)]
    pub kinds: Vec<TaskKind>,
    /// Matches tasks whose latency bound is at most this many milliseconds.
    pub max_latency_ms: Option<u64>,
    /// Matches tasks with at least this many context tokens.
    pub min_context_tokens: Option<u64>,
    /// Matches tasks with at most this many context tokens.
    pub max_context_tokens: Option<u64>,
    /// Exact match on the task's `creative` flag.
    pub creative: Option<bool>,
    /// Exact match on the task's `strict_quality` flag.
    pub strict_quality: Option<bool>,
}

// ── Observability ────────────────────────────────────────────────────────

/// Logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ObservabilityConfig {
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log output format.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable, colorized log output.
    #[default]
    Pretty,
    /// Structured JSON log output for machine consumption.
    Json,
}

/// Export the JSON Schema for [`RouterConfig`].
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(RouterConfig);
    serde_json::to_string_pretty(&schema)
}
