//! # Telemetry Emitter
//!
//! An in-process, bounded record of every routing decision, budget admission
//! and breaker transition.
//!
//! ## Guarantees
//! - Non-blocking: [`TelemetryEmitter::emit`] takes a short critical section
//!   and never waits on consumers.
//! - Bounded: when the ring buffer is full the *oldest* event is dropped.
//! - Ordered: sequence numbers are assigned under the buffer lock, so
//!   [`TelemetryEmitter::snapshot`] is strictly increasing in `seq`.
//! - Immutable: events are never modified after emission.
//!
//! ## Forwarding
//! Events are also published on a `tokio::sync::broadcast` channel so an
//! external sink (log shipper, metrics aggregator) can subscribe. Publishing
//! never blocks; a lagging subscriber loses events, not the router.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::metrics;
use crate::routing::{BudgetOutcome, Category, ChannelId, CircuitStatus};

/// Default ring-buffer capacity.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Largest ring-buffer capacity accepted; larger requests are clamped.
pub const MAX_CAPACITY: usize = 1_048_576;

/// Slots in the forwarding channel, independent of the ring size.
const BROADCAST_CAPACITY: usize = 1024;

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryKind {
    /// A channel was selected for a task.
    RouteDecision {
        /// Correlates with [`crate::SelectedRoute::decision_id`].
        decision_id: Uuid,
        /// Category the task was classified into.
        category: Category,
        /// Configuration index of the matching rule; `None` for the default category.
        matched_rule: Option<usize>,
        /// Selected channel.
        channel: ChannelId,
        /// Budget outcome of the selected channel.
        outcome: BudgetOutcome,
        /// Reserved estimate in USD.
        estimated_cost_usd: f64,
        /// Candidates passed over before the selection.
        skipped: Vec<ChannelId>,
        /// Whether the selection is a half-open breaker trial.
        half_open_trial: bool,
    },
    /// No candidate could be admitted.
    RouteExhausted {
        /// Category the task was classified into.
        category: Category,
        /// Channels configured for the category.
        considered: Vec<ChannelId>,
    },
    /// Result of a budget reservation attempt.
    BudgetAdmission {
        /// Channel checked.
        channel: ChannelId,
        /// Admission result.
        outcome: BudgetOutcome,
        /// Estimate presented for reservation, in USD.
        estimated_cost_usd: f64,
        /// Cumulative spend after the attempt, in USD.
        spent_usd: f64,
    },
    /// A channel's daily accounting window rolled over.
    BudgetWindowRollover {
        /// Channel whose spend was reset.
        channel: ChannelId,
        /// Spend recorded in the window that closed, in USD.
        previous_spent_usd: f64,
    },
    /// A breaker changed state.
    BreakerTransition {
        /// Channel whose breaker moved.
        channel: ChannelId,
        /// State before the transition.
        from: CircuitStatus,
        /// State after the transition.
        to: CircuitStatus,
        /// Consecutive failures at the time of the transition.
        consecutive_failures: u32,
    },
}

impl TelemetryKind {
    /// Stable event name, as used in the serialized `event` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RouteDecision { .. } => "route_decision",
            Self::RouteExhausted { .. } => "route_exhausted",
            Self::BudgetAdmission { .. } => "budget_admission",
            Self::BudgetWindowRollover { .. } => "budget_window_rollover",
            Self::BreakerTransition { .. } => "breaker_transition",
        }
    }
}

/// One emitted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Monotonic sequence number, starting at 0.
    pub seq: u64,
    /// Wall-clock time of emission.
    pub timestamp: DateTime<Utc>,
    /// Event payload.
    #[serde(flatten)]
    pub kind: TelemetryKind,
}

#[derive(Debug)]
struct Ring {
    events: VecDeque<TelemetryEvent>,
    next_seq: u64,
}

/// Bounded, concurrent-safe event recorder.
#[derive(Debug)]
pub struct TelemetryEmitter {
    capacity: usize,
    ring: Mutex<Ring>,
    dropped: AtomicU64,
    sink: broadcast::Sender<TelemetryEvent>,
}

impl TelemetryEmitter {
    /// Create an emitter retaining at most `capacity` events, clamped to
    /// `1..=MAX_CAPACITY`. The buffer grows on demand.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_CAPACITY);
        let (sink, _) = broadcast::channel(capacity.min(BROADCAST_CAPACITY));
        Self {
            capacity,
            ring: Mutex::new(Ring {
                events: VecDeque::new(),
                next_seq: 0,
            }),
            dropped: AtomicU64::new(0),
            sink,
        }
    }

    /// Record an event, returning its sequence number.
    ///
    /// Drops the oldest retained event if the buffer is full.
    pub fn emit(&self, kind: TelemetryKind) -> u64 {
        metrics::record_event(&kind);

        let event = {
            let mut ring = self.ring.lock();
            let event = TelemetryEvent {
                seq: ring.next_seq,
                timestamp: Utc::now(),
                kind,
            };
            ring.next_seq += 1;
            if ring.events.len() >= self.capacity {
                ring.events.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            ring.events.push_back(event.clone());
            event
        };

        let seq = event.seq;
        // No subscribers is not an error.
        let _ = self.sink.send(event);
        seq
    }

    /// Retained events, oldest first.
    pub fn snapshot(&self) -> Vec<TelemetryEvent> {
        self.ring.lock().events.iter().cloned().collect()
    }

    /// Subscribe to events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.sink.subscribe()
    }

    /// Number of events evicted because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Total events emitted since construction.
    pub fn emitted(&self) -> u64 {
        self.ring.lock().next_seq
    }

    /// Configured retention.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for TelemetryEmitter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
