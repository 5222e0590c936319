//! # Stage: Channel Routing
//!
//! ## Responsibility
//! Decide which configured channel should execute a task: classify the task
//! into a category, expand the category into its fallback chain, and walk the
//! chain consulting each channel's circuit breaker and spend budget until one
//! admits the request.
//!
//! ## Guarantees
//! - Deterministic: classification is a pure function of the task and the
//!   loaded rules.
//! - Non-blocking: the whole decision path is in-memory; no I/O, no timers.
//! - Per-channel locking: budget and breaker state each sit behind one mutex
//!   per channel, never a global lock.
//! - Side-effect scoped: spend is only reserved on the channel actually
//!   selected.
//!
//! ## NOT Responsible For
//! - Calling the provider (the caller does that and reports the outcome)
//! - Persisting spend or breaker state across restarts
//! - Retrying with backoff (fallback traversal is the only retry)

pub mod breaker;
pub mod budget;
pub mod classifier;
pub mod fallback;
pub mod router;
pub mod task;

// Re-exports for convenience
pub use breaker::{CircuitBreaker, CircuitStats, CircuitStatus};
pub use budget::{estimate_cost, BudgetLedger, BudgetOutcome, BudgetSnapshot};
pub use classifier::TaskClassifier;
pub use fallback::FallbackResolver;
pub use router::{Router, SelectedRoute};
pub use task::{Category, ChannelId, TaskKind, TaskSpec};
