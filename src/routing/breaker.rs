//! Per-channel circuit breakers.
//!
//! Prevents routing to a channel that keeps failing.
//!
//! ## States
//! - **Closed**: normal operation, every admission succeeds
//! - **Open**: channel failing, admissions refused
//! - **Half-Open**: cooldown elapsed, exactly one trial admission allowed
//!
//! The Open → Half-Open transition is lazy: it happens on the first query
//! after `cooldown` has elapsed since the last failure. No timers run.
//!
//! Each channel's state sits behind its own [`parking_lot::Mutex`], so a
//! transition is linearizable per channel and unrelated channels never
//! contend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::store::{BreakerSettings, ConfigStore};
use crate::telemetry::{TelemetryEmitter, TelemetryKind};

use super::task::ChannelId;

/// Current state of one channel's breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    /// Requests flow normally.
    Closed,
    /// Requests are refused until the cooldown elapses.
    Open,
    /// One trial request may probe recovery.
    HalfOpen,
}

#[derive(Debug)]
struct ChannelCircuit {
    status: CircuitStatus,
    consecutive_failures: u32,
    total_failures: u64,
    total_successes: u64,
    last_failure: Option<Instant>,
    last_transition: Instant,
    /// Set while a half-open trial is in flight.
    trial_claimed_at: Option<Instant>,
    settings: BreakerSettings,
}

impl ChannelCircuit {
    fn new(settings: BreakerSettings, now: Instant) -> Self {
        Self {
            status: CircuitStatus::Closed,
            consecutive_failures: 0,
            total_failures: 0,
            total_successes: 0,
            last_failure: None,
            last_transition: now,
            trial_claimed_at: None,
            settings,
        }
    }

    /// Whether the cooldown measured from `since` has elapsed at `now`.
    fn cooled(&self, since: Instant, now: Instant) -> bool {
        now.saturating_duration_since(since) >= self.settings.cooldown
    }

    /// A claimed trial that has stayed unreported past the cooldown is
    /// considered abandoned.
    fn trial_in_flight(&self, now: Instant) -> bool {
        self.trial_claimed_at.is_some_and(|at| !self.cooled(at, now))
    }
}

/// Point-in-time view of one channel's breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitStats {
    /// Current state.
    pub status: CircuitStatus,
    /// Failures since the last success or reset.
    pub consecutive_failures: u32,
    /// Failures reported over the process lifetime.
    pub total_failures: u64,
    /// Successes reported over the process lifetime.
    pub total_successes: u64,
    /// Effective threshold for this channel.
    pub failure_threshold: u32,
    /// Effective cooldown for this channel.
    pub cooldown: Duration,
    /// Whether a half-open trial is currently claimed.
    pub trial_in_flight: bool,
    /// Time spent in the current state.
    pub time_in_current_state: Duration,
}

/// Breaker state for every configured channel.
#[derive(Debug)]
pub struct CircuitBreaker {
    circuits: HashMap<ChannelId, Mutex<ChannelCircuit>>,
    telemetry: Arc<TelemetryEmitter>,
}

impl CircuitBreaker {
    /// Create a closed breaker per configured channel.
    pub fn new(store: &ConfigStore, telemetry: Arc<TelemetryEmitter>) -> Self {
        let now = Instant::now();
        let circuits = store
            .channel_ids()
            .into_iter()
            .map(|id| {
                let settings = store.breaker_settings(&id);
                (id, Mutex::new(ChannelCircuit::new(settings, now)))
            })
            .collect();
        Self {
            circuits,
            telemetry,
        }
    }

    fn circuit(&self, channel: &ChannelId, op: &'static str) -> Option<&Mutex<ChannelCircuit>> {
        let circuit = self.circuits.get(channel);
        if circuit.is_none() {
            warn!(channel = %channel, op, "circuit breaker: unknown channel");
        }
        circuit
    }

    /// Move `state` to `to` and record the transition.
    ///
    /// Called with the channel lock held so telemetry for one channel is
    /// emitted in transition order.
    fn transition(&self, channel: &ChannelId, state: &mut ChannelCircuit, to: CircuitStatus, now: Instant) {
        let from = state.status;
        if from == to {
            return;
        }
        state.status = to;
        state.last_transition = now;
        if to != CircuitStatus::HalfOpen {
            state.trial_claimed_at = None;
        }

        match to {
            CircuitStatus::Open => warn!(
                channel = %channel,
                from = ?from,
                failures = state.consecutive_failures,
                threshold = state.settings.failure_threshold,
                "circuit breaker: opening"
            ),
            CircuitStatus::HalfOpen => info!(
                channel = %channel,
                "circuit breaker: transitioning to half-open"
            ),
            CircuitStatus::Closed => info!(
                channel = %channel,
                from = ?from,
                "circuit breaker: closing (channel recovered)"
            ),
        }

        self.telemetry.emit(TelemetryKind::BreakerTransition {
            channel: channel.clone(),
            from,
            to,
            consecutive_failures: state.consecutive_failures,
        });
    }

    /// Lazy Open → HalfOpen once the cooldown since the last failure elapsed.
    fn refresh(&self, channel: &ChannelId, state: &mut ChannelCircuit, now: Instant) {
        if state.status != CircuitStatus::Open {
            return;
        }
        let since = state.last_failure.unwrap_or(state.last_transition);
        if state.cooled(since, now) {
            state.trial_claimed_at = None;
            self.transition(channel, state, CircuitStatus::HalfOpen, now);
        }
    }

    // ── Admission ──────────────────────────────────────────────────────

    /// Ask to send one request to `channel`.
    ///
    /// Closed admits everyone. Open refuses until the cooldown elapses.
    /// Half-open admits exactly one caller (the trial) and refuses the rest
    /// until the trial is reported or abandoned. Unknown channels are refused.
    pub fn try_admit(&self, channel: &ChannelId) -> bool {
        self.try_admit_at(channel, Instant::now())
    }

    /// As [`CircuitBreaker::try_admit`], evaluated at `now`.
    pub fn try_admit_at(&self, channel: &ChannelId, now: Instant) -> bool {
        self.admit_at(channel, now).is_some()
    }

    /// Like [`CircuitBreaker::try_admit_at`], but also reports whether the
    /// admission claimed the half-open trial.
    pub(crate) fn admit_at(&self, channel: &ChannelId, now: Instant) -> Option<bool> {
        let circuit = self.circuit(channel, "admit")?;
        let mut state = circuit.lock();
        self.refresh(channel, &mut state, now);
        let status = state.status;
        match status {
            CircuitStatus::Closed => Some(false),
            CircuitStatus::Open => {
                debug!(channel = %channel, "circuit breaker: admission refused (open)");
                None
            }
            CircuitStatus::HalfOpen => {
                if state.trial_in_flight(now) {
                    debug!(channel = %channel, "circuit breaker: admission refused (trial in flight)");
                    None
                } else {
                    state.trial_claimed_at = Some(now);
                    debug!(channel = %channel, "circuit breaker: half-open trial claimed");
                    Some(true)
                }
            }
        }
    }

    /// Give back a claimed half-open trial without a result.
    pub fn abandon_trial(&self, channel: &ChannelId) {
        let Some(circuit) = self.circuit(channel, "abandon_trial") else {
            return;
        };
        let mut state = circuit.lock();
        if state.status == CircuitStatus::HalfOpen && state.trial_claimed_at.take().is_some() {
            debug!(channel = %channel, "circuit breaker: half-open trial returned unused");
        }
    }

    /// Whether `channel` currently refuses requests.
    ///
    /// True while Open, and while Half-Open with a trial in flight. Performs
    /// the lazy Open → Half-Open transition. Unknown channels are open.
    pub fn is_open(&self, channel: &ChannelId) -> bool {
        self.is_open_at(channel, Instant::now())
    }

    /// As [`CircuitBreaker::is_open`], evaluated at `now`.
    pub fn is_open_at(&self, channel: &ChannelId, now: Instant) -> bool {
        let Some(circuit) = self.circuit(channel, "is_open") else {
            return true;
        };
        let mut state = circuit.lock();
        self.refresh(channel, &mut state, now);
        match state.status {
            CircuitStatus::Closed => false,
            CircuitStatus::Open => true,
            CircuitStatus::HalfOpen => state.trial_in_flight(now),
        }
    }

    // ── Reporting ──────────────────────────────────────────────────────

    /// Report a successful call on `channel`.
    pub fn on_success(&self, channel: &ChannelId) {
        self.on_success_at(channel, Instant::now());
    }

    /// As [`CircuitBreaker::on_success`], evaluated at `now`.
    pub fn on_success_at(&self, channel: &ChannelId, now: Instant) {
        let Some(circuit) = self.circuit(channel, "on_success") else {
            return;
        };
        let mut state = circuit.lock();
        state.total_successes += 1;
        let status = state.status;
        match status {
            CircuitStatus::Closed => state.consecutive_failures = 0,
            CircuitStatus::HalfOpen => {
                state.consecutive_failures = 0;
                self.transition(channel, &mut state, CircuitStatus::Closed, now);
            }
            // A late success from a request admitted before the trip does not
            // close the circuit.
            CircuitStatus::Open => {}
        }
        debug!(
            channel = %channel,
            status = ?state.status,
            "circuit breaker: success recorded"
        );
    }

    /// Report a failed call on `channel`.
    pub fn on_error(&self, channel: &ChannelId) {
        self.on_error_at(channel, Instant::now());
    }

    /// As [`CircuitBreaker::on_error`], evaluated at `now`.
    pub fn on_error_at(&self, channel: &ChannelId, now: Instant) {
        let Some(circuit) = self.circuit(channel, "on_error") else {
            return;
        };
        let mut state = circuit.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.total_failures += 1;
        state.last_failure = Some(now);

        debug!(
            channel = %channel,
            status = ?state.status,
            failures = state.consecutive_failures,
            threshold = state.settings.failure_threshold,
            "circuit breaker: failure recorded"
        );

        let status = state.status;
        match status {
            CircuitStatus::Closed => {
                if state.consecutive_failures >= state.settings.failure_threshold {
                    self.transition(channel, &mut state, CircuitStatus::Open, now);
                }
            }
            CircuitStatus::HalfOpen => {
                self.transition(channel, &mut state, CircuitStatus::Open, now);
            }
            CircuitStatus::Open => {}
        }
    }

    // ── Inspection and manual control ──────────────────────────────────

    /// Current state of `channel`, or `None` if unknown.
    pub fn status(&self, channel: &ChannelId) -> Option<CircuitStatus> {
        let circuit = self.circuits.get(channel)?;
        let mut state = circuit.lock();
        self.refresh(channel, &mut state, Instant::now());
        Some(state.status)
    }

    /// Statistics for `channel`, or `None` if unknown.
    pub fn stats(&self, channel: &ChannelId) -> Option<CircuitStats> {
        let now = Instant::now();
        let circuit = self.circuits.get(channel)?;
        let mut state = circuit.lock();
        self.refresh(channel, &mut state, now);
        Some(CircuitStats {
            status: state.status,
            consecutive_failures: state.consecutive_failures,
            total_failures: state.total_failures,
            total_successes: state.total_successes,
            failure_threshold: state.settings.failure_threshold,
            cooldown: state.settings.cooldown,
            trial_in_flight: state.trial_in_flight(now),
            time_in_current_state: now.saturating_duration_since(state.last_transition),
        })
    }

    /// Force `channel` closed and clear its failure counter.
    pub fn reset(&self, channel: &ChannelId) {
        let Some(circuit) = self.circuit(channel, "reset") else {
            return;
        };
        let mut state = circuit.lock();
        state.consecutive_failures = 0;
        self.transition(channel, &mut state, CircuitStatus::Closed, Instant::now());
        info!(channel = %channel, "circuit breaker: manually reset to closed");
    }

    /// Force `channel` open, starting a fresh cooldown.
    pub fn trip(&self, channel: &ChannelId) {
        self.trip_at(channel, Instant::now());
    }

    /// As [`CircuitBreaker::trip`], evaluated at `now`.
    pub fn trip_at(&self, channel: &ChannelId, now: Instant) {
        let Some(circuit) = self.circuit(channel, "trip") else {
            return;
        };
        let mut state = circuit.lock();
        state.last_failure = Some(now);
        self.transition(channel, &mut state, CircuitStatus::Open, now);
        warn!(channel = %channel, "circuit breaker: manually tripped to open");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOML: &str = r#"
[router]
name = "breaker-test"

[breaker]
failure_threshold = 5
cooldown_s = 300

[[channels]]
id = "v"
soft_cap_usd = 1.0
hard_cap_usd = 1.0

[[channels]]
id = "quick"
soft_cap_usd = 1.0
hard_cap_usd = 1.0
failure_threshold = 2
cooldown_s = 10

[[categories]]
name = "general"
chain = ["v", "quick"]
"#;

    const COOLDOWN: Duration = Duration::from_secs(300);

    fn breaker() -> (CircuitBreaker, Arc<TelemetryEmitter>) {
        let store = ConfigStore::from_toml(TOML).expect("test: config");
        let telemetry = Arc::new(TelemetryEmitter::new(256));
        (CircuitBreaker::new(&store, Arc::clone(&telemetry)), telemetry)
    }

    fn v() -> ChannelId {
        ChannelId::new("v")
    }

    fn open_v(b: &CircuitBreaker, at: Instant) {
        for _ in 0..5 {
            b.on_error_at(&v(), at);
        }
    }

    fn transitions(t: &TelemetryEmitter) -> Vec<(CircuitStatus, CircuitStatus)> {
        t.snapshot()
            .into_iter()
            .filter_map(|e| match e.kind {
                TelemetryKind::BreakerTransition { from, to, .. } => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    // -- closed ------------------------------------------------------------

    #[test]
    fn test_new_breaker_is_closed_and_admits() {
        let (b, _) = breaker();
        let now = Instant::now();
        assert_eq!(b.status(&v()), Some(CircuitStatus::Closed));
        assert!(!b.is_open_at(&v(), now));
        assert!(b.try_admit_at(&v(), now));
    }

    #[test]
    fn test_opens_after_exactly_threshold_errors() {
        let (b, _) = breaker();
        let now = Instant::now();
        for _ in 0..4 {
            b.on_error_at(&v(), now);
        }
        assert!(!b.is_open_at(&v(), now));
        b.on_error_at(&v(), now);
        assert!(b.is_open_at(&v(), now));
        assert!(!b.try_admit_at(&v(), now));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let (b, _) = breaker();
        let now = Instant::now();
        for _ in 0..4 {
            b.on_error_at(&v(), now);
        }
        b.on_success_at(&v(), now);
        assert_eq!(b.stats(&v()).map(|s| s.consecutive_failures), Some(0));
        for _ in 0..4 {
            b.on_error_at(&v(), now);
        }
        assert!(!b.is_open_at(&v(), now));
    }

    #[test]
    fn test_per_channel_threshold_override() {
        let (b, _) = breaker();
        let now = Instant::now();
        let quick = ChannelId::new("quick");
        b.on_error_at(&quick, now);
        b.on_error_at(&quick, now);
        assert!(b.is_open_at(&quick, now));
        assert!(!b.is_open_at(&v(), now));
    }

    // -- open → half-open --------------------------------------------------

    #[test]
    fn test_stays_open_before_cooldown() {
        let (b, _) = breaker();
        let t0 = Instant::now();
        open_v(&b, t0);
        assert!(b.is_open_at(&v(), t0 + COOLDOWN - Duration::from_secs(1)));
    }

    #[test]
    fn test_half_open_after_cooldown_admits_one_trial() {
        let (b, _) = breaker();
        let t0 = Instant::now();
        open_v(&b, t0);
        let later = t0 + COOLDOWN;
        assert!(!b.is_open_at(&v(), later));
        assert!(b.try_admit_at(&v(), later));
        assert!(!b.try_admit_at(&v(), later));
        assert!(b.is_open_at(&v(), later));
    }

    #[test]
    fn test_trial_success_closes() {
        let (b, telemetry) = breaker();
        let t0 = Instant::now();
        open_v(&b, t0);
        let later = t0 + COOLDOWN;
        assert!(b.try_admit_at(&v(), later));
        b.on_success_at(&v(), later);
        assert!(b.try_admit_at(&v(), later));
        assert!(b.try_admit_at(&v(), later));
        assert_eq!(
            transitions(&telemetry),
            vec![
                (CircuitStatus::Closed, CircuitStatus::Open),
                (CircuitStatus::Open, CircuitStatus::HalfOpen),
                (CircuitStatus::HalfOpen, CircuitStatus::Closed),
            ]
        );
    }

    #[test]
    fn test_trial_failure_reopens_and_restarts_cooldown() {
        let (b, _) = breaker();
        let t0 = Instant::now();
        open_v(&b, t0);
        let t1 = t0 + COOLDOWN;
        assert!(b.try_admit_at(&v(), t1));
        b.on_error_at(&v(), t1);
        assert!(b.is_open_at(&v(), t1 + COOLDOWN - Duration::from_secs(1)));
        assert!(b.try_admit_at(&v(), t1 + COOLDOWN));
    }

    #[test]
    fn test_abandoned_trial_can_be_reclaimed() {
        let (b, _) = breaker();
        let t0 = Instant::now();
        open_v(&b, t0);
        let later = t0 + COOLDOWN;
        assert!(b.try_admit_at(&v(), later));
        b.abandon_trial(&v());
        assert!(b.try_admit_at(&v(), later));
    }

    #[test]
    fn test_stale_trial_expires_after_cooldown() {
        let (b, _) = breaker();
        let t0 = Instant::now();
        open_v(&b, t0);
        let t1 = t0 + COOLDOWN;
        assert!(b.try_admit_at(&v(), t1));
        assert!(!b.try_admit_at(&v(), t1 + Duration::from_secs(10)));
        assert!(b.try_admit_at(&v(), t1 + COOLDOWN));
    }

    // -- manual control ------------------------------------------------------

    #[test]
    fn test_trip_and_reset() {
        let (b, _) = breaker();
        b.trip(&v());
        assert_eq!(b.status(&v()), Some(CircuitStatus::Open));
        b.reset(&v());
        assert_eq!(b.status(&v()), Some(CircuitStatus::Closed));
        assert_eq!(b.stats(&v()).map(|s| s.consecutive_failures), Some(0));
    }

    #[test]
    fn test_stats_report_effective_settings() {
        let (b, _) = breaker();
        let stats = b.stats(&ChannelId::new("quick")).expect("test: stats");
        assert_eq!(stats.failure_threshold, 2);
        assert_eq!(stats.cooldown, Duration::from_secs(10));
        assert!(!stats.trial_in_flight);
    }

    #[test]
    fn test_unknown_channel_is_open_and_refused() {
        let (b, _) = breaker();
        let ghost = ChannelId::new("ghost");
        assert!(b.is_open(&ghost));
        assert!(!b.try_admit(&ghost));
        b.on_error(&ghost);
        b.on_success(&ghost);
        assert!(b.status(&ghost).is_none());
        assert!(b.stats(&ghost).is_none());
    }

    // -- concurrency ---------------------------------------------------------

    #[test]
    fn test_concurrent_half_open_admits_single_trial() {
        use std::thread;

        let (b, _) = breaker();
        let b = Arc::new(b);
        let t0 = Instant::now();
        open_v(&b, t0);
        let later = t0 + COOLDOWN;

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let b = Arc::clone(&b);
                thread::spawn(move || b.try_admit_at(&v(), later))
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().expect("test: join"))
            .filter(|&ok| ok)
            .count();
        assert_eq!(admitted, 1);
    }

    #[test]
    fn test_concurrent_errors_open_exactly_once() {
        use std::thread;

        let (b, telemetry) = breaker();
        let b = Arc::new(b);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let b = Arc::clone(&b);
                thread::spawn(move || {
                    for _ in 0..10 {
                        b.on_error(&v());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("test: join");
        }
        assert_eq!(b.status(&v()), Some(CircuitStatus::Open));
        assert_eq!(transitions(&telemetry).len(), 1);
    }
}
