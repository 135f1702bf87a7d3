//! Circuit breaker state machine
//!
//! A named breaker tracks failures of one downstream service inside a
//! rolling window and fails fast once the service is deemed unhealthy,
//! trading slow likely failure for fast predictable failure. States:
//!
//! - `Closed`: calls execute normally; dense failures accumulate.
//! - `Open`: calls are rejected immediately; a supervised one-shot task
//!   moves the breaker to half-open after the reset timeout.
//! - `HalfOpen`: exactly one trial call is admitted at a time; its outcome
//!   decides between closing and re-opening with a full fresh cooldown. A
//!   trial abandoned without an outcome (caller cancelled) releases the
//!   gate so a later caller can run the trial.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ResilienceConfig;
use crate::error::ResilienceError;
use crate::events::{ResilienceEvent, ResilienceEventKind, ResilienceListener};
use crate::timeout::TimeoutGuard;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Calls blocked, cooling down
    Open,
    /// Testing recovery with a single trial call
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Point-in-time snapshot of a breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    /// Current state
    pub state: CircuitState,
    /// Failures inside the current rolling window
    pub failure_count: u32,
    /// Lifetime successful calls
    pub success_count: u64,
    /// Lifetime fail-fast rejections
    pub rejection_count: u64,
    /// Wall-clock time of the most recent failure
    pub last_failure: Option<DateTime<Utc>>,
    /// Wall-clock time of the most recent state change
    pub last_state_change: DateTime<Utc>,
}

/// Mutable breaker state, all mutated under one lock.
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u64,
    rejection_count: u64,
    /// Monotonic time of the previous recorded failure, for windowing
    last_failure_at: Option<Instant>,
    /// Wall-clock mirror of the failure time, for stats
    last_failure_wall: Option<DateTime<Utc>>,
    last_state_change: DateTime<Utc>,
    /// Bumped each time the breaker opens or resets; a reset task only fires
    /// if its generation is still current
    open_generation: u64,
    reset_task: Option<JoinHandle<()>>,
}

struct BreakerInner {
    name: String,
    failure_threshold: u32,
    failure_window: Duration,
    reset_timeout: Duration,
    call_timeout: Duration,
    state: RwLock<BreakerState>,
    /// One permit; held by the in-flight half-open trial call
    trial_gate: Arc<Semaphore>,
    listeners: Vec<Arc<dyn ResilienceListener>>,
}

/// Admission to run one protected call, returned by
/// [`CircuitBreaker::try_acquire`].
///
/// For a half-open trial this holds the trial gate. Dropping the admission
/// without a recorded outcome releases the gate, so a caller that cancels
/// mid-call (its future is dropped) neither closes nor re-opens the
/// circuit and never wedges it in half-open.
#[must_use]
#[derive(Debug)]
pub struct CircuitAdmission {
    _trial: Option<OwnedSemaphorePermit>,
}

impl BreakerInner {
    async fn emit_all(&self, kinds: Vec<ResilienceEventKind>) {
        if self.listeners.is_empty() {
            return;
        }
        for kind in kinds {
            let event = ResilienceEvent::now(&self.name, kind);
            for listener in &self.listeners {
                listener.on_event(&event).await;
            }
        }
    }

    /// Transition helper; events are collected and emitted by the caller
    /// after the state lock is released.
    fn transition(
        &self,
        st: &mut BreakerState,
        to: CircuitState,
        events: &mut Vec<ResilienceEventKind>,
    ) {
        let from = st.state;
        if from == to {
            return;
        }
        st.state = to;
        st.last_state_change = Utc::now();
        events.push(ResilienceEventKind::StateChange { from, to });
        match to {
            CircuitState::Open => events.push(ResilienceEventKind::Opened),
            CircuitState::HalfOpen => events.push(ResilienceEventKind::HalfOpened),
            CircuitState::Closed => {
                st.failure_count = 0;
                st.last_failure_at = None;
                if let Some(task) = st.reset_task.take() {
                    task.abort();
                }
                events.push(ResilienceEventKind::Closed);
            }
        }
    }

    /// Fired by the supervised reset task once the cooldown elapses.
    async fn half_open_if_current(&self, generation: u64) {
        let mut events = Vec::new();
        {
            let mut st = self.state.write().await;
            if st.state != CircuitState::Open || st.open_generation != generation {
                // A newer open period or a manual reset superseded this timer.
                return;
            }
            st.reset_task = None;
            self.transition(&mut st, CircuitState::HalfOpen, &mut events);
            info!(circuit = %self.name, "circuit breaker transitioning to half-open");
        }
        self.emit_all(events).await;
    }
}

/// Circuit breaker for one named downstream service.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<BreakerInner>,
}

impl CircuitBreaker {
    /// Create a breaker from the service's resolved configuration.
    pub fn new(name: impl Into<String>, config: &ResilienceConfig) -> Self {
        Self::with_listeners(name, config, Vec::new())
    }

    /// Create a breaker with event listeners attached.
    pub fn with_listeners(
        name: impl Into<String>,
        config: &ResilienceConfig,
        listeners: Vec<Arc<dyn ResilienceListener>>,
    ) -> Self {
        Self {
            inner: Arc::new(BreakerInner {
                name: name.into(),
                failure_threshold: config.failure_threshold.max(1),
                failure_window: config.failure_window,
                reset_timeout: config.reset_timeout,
                call_timeout: config.call_timeout,
                state: RwLock::new(BreakerState {
                    state: CircuitState::Closed,
                    failure_count: 0,
                    success_count: 0,
                    rejection_count: 0,
                    last_failure_at: None,
                    last_failure_wall: None,
                    last_state_change: Utc::now(),
                    open_generation: 0,
                    reset_task: None,
                }),
                trial_gate: Arc::new(Semaphore::new(1)),
                listeners,
            }),
        }
    }

    /// Service name this breaker protects.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current state.
    pub async fn state(&self) -> CircuitState {
        self.inner.state.read().await.state
    }

    /// Admission check. Returns an error without invoking anything when the
    /// circuit is open or a half-open trial is already in flight. Hold the
    /// returned [`CircuitAdmission`] across the protected call and answer
    /// it with [`record_success`] or [`record_failure`]; dropping it
    /// unanswered abandons the call without classifying an outcome (for
    /// example when the bulkhead rejects it or the caller cancels).
    ///
    /// [`record_success`]: Self::record_success
    /// [`record_failure`]: Self::record_failure
    pub async fn try_acquire<E>(&self) -> Result<CircuitAdmission, ResilienceError<E>> {
        let rejected_in;
        let mut events = Vec::new();
        {
            let mut st = self.inner.state.write().await;
            match st.state {
                CircuitState::Closed => return Ok(CircuitAdmission { _trial: None }),
                CircuitState::HalfOpen => {
                    if let Ok(permit) = self.inner.trial_gate.clone().try_acquire_owned() {
                        debug!(circuit = %self.inner.name, "admitting half-open trial call");
                        return Ok(CircuitAdmission {
                            _trial: Some(permit),
                        });
                    }
                    st.rejection_count += 1;
                    events.push(ResilienceEventKind::Rejected);
                    rejected_in = CircuitState::HalfOpen;
                }
                CircuitState::Open => {
                    st.rejection_count += 1;
                    events.push(ResilienceEventKind::Rejected);
                    rejected_in = CircuitState::Open;
                }
            }
        }
        debug!(circuit = %self.inner.name, state = %rejected_in, "rejecting call, failing fast");
        self.inner.emit_all(events).await;
        Err(ResilienceError::CircuitOpen {
            name: self.inner.name.clone(),
            state: rejected_in,
        })
    }

    /// Record a successful call outcome.
    pub async fn record_success(&self) {
        let mut events = vec![ResilienceEventKind::Success];
        {
            let mut st = self.inner.state.write().await;
            st.success_count += 1;
            if st.state == CircuitState::HalfOpen {
                self.inner
                    .transition(&mut st, CircuitState::Closed, &mut events);
                info!(circuit = %self.inner.name, "trial call succeeded, circuit breaker closed");
            }
        }
        self.inner.emit_all(events).await;
    }

    /// Record a failed call outcome (including timeouts).
    ///
    /// Windowing rule: if the previous recorded failure is older than the
    /// rolling window, the count restarts at 1, so sparse intermittent
    /// failures never accumulate to the threshold.
    pub async fn record_failure(&self, error: &str) {
        let mut events = vec![ResilienceEventKind::Failure {
            error: error.to_string(),
        }];
        {
            let mut st = self.inner.state.write().await;
            let now = Instant::now();
            st.last_failure_wall = Some(Utc::now());
            match st.state {
                CircuitState::Closed => {
                    st.failure_count = match st.last_failure_at {
                        Some(prev) if now.duration_since(prev) > self.inner.failure_window => 1,
                        _ => st.failure_count + 1,
                    };
                    st.last_failure_at = Some(now);
                    if st.failure_count >= self.inner.failure_threshold {
                        warn!(
                            circuit = %self.inner.name,
                            failures = st.failure_count,
                            "failure threshold reached, opening circuit breaker"
                        );
                        self.inner
                            .transition(&mut st, CircuitState::Open, &mut events);
                        self.schedule_reset(&mut st);
                    }
                }
                CircuitState::HalfOpen => {
                    // A failed trial re-opens with a full fresh cooldown.
                    st.last_failure_at = Some(now);
                    warn!(circuit = %self.inner.name, "trial call failed, re-opening circuit breaker");
                    self.inner
                        .transition(&mut st, CircuitState::Open, &mut events);
                    self.schedule_reset(&mut st);
                }
                CircuitState::Open => {
                    // Straggler from a call admitted before the circuit
                    // opened; the running timer is left untouched.
                    debug!(circuit = %self.inner.name, "failure recorded while already open");
                }
            }
        }
        self.inner.emit_all(events).await;
    }

    /// Execute `operation` under breaker admission and the configured call
    /// timeout. Standalone entry point for callers not going through a
    /// [`crate::manager::ResilienceManager`].
    pub async fn execute<T, E, F, Fut>(
        &self,
        operation: &str,
        f: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let admission = self.try_acquire().await?;
        let result = TimeoutGuard::run(operation, self.inner.call_timeout, f()).await;
        match &result {
            Ok(_) => self.record_success().await,
            Err(e) => self.record_failure(&e.to_string()).await,
        }
        drop(admission);
        result
    }

    /// Snapshot of the breaker's counters and state.
    pub async fn stats(&self) -> CircuitBreakerStats {
        let st = self.inner.state.read().await;
        CircuitBreakerStats {
            state: st.state,
            failure_count: st.failure_count,
            success_count: st.success_count,
            rejection_count: st.rejection_count,
            last_failure: st.last_failure_wall,
            last_state_change: st.last_state_change,
        }
    }

    /// Force-close the breaker and zero all counters. Administrative
    /// operation; any pending reset timer is cancelled.
    pub async fn reset(&self) {
        let mut events = Vec::new();
        {
            let mut st = self.inner.state.write().await;
            if let Some(task) = st.reset_task.take() {
                task.abort();
            }
            st.open_generation += 1;
            self.inner
                .transition(&mut st, CircuitState::Closed, &mut events);
            st.failure_count = 0;
            st.success_count = 0;
            st.rejection_count = 0;
            st.last_failure_at = None;
            st.last_failure_wall = None;
            info!(circuit = %self.inner.name, "circuit breaker reset to closed");
        }
        self.inner.emit_all(events).await;
    }

    /// Arm the one-shot open→half-open timer. Any previous timer is
    /// aborted first; timers never stack, and a new failure while open
    /// never shortens the running cooldown.
    fn schedule_reset(&self, st: &mut BreakerState) {
        if let Some(task) = st.reset_task.take() {
            task.abort();
        }
        st.open_generation += 1;
        let generation = st.open_generation;
        let delay = self.inner.reset_timeout;
        let weak: Weak<BreakerInner> = Arc::downgrade(&self.inner);
        st.reset_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.half_open_if_current(generation).await;
            }
        }));
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.name)
            .field("failure_threshold", &self.inner.failure_threshold)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::test_support::CollectingListener;
    use tokio::time::sleep;

    fn config(threshold: u32, window_ms: u64, reset_ms: u64) -> ResilienceConfig {
        ResilienceConfig {
            failure_threshold: threshold,
            failure_window: Duration::from_millis(window_ms),
            reset_timeout: Duration::from_millis(reset_ms),
            call_timeout: Duration::from_secs(1),
            ..ResilienceConfig::standard()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_recovers() {
        let breaker = CircuitBreaker::new("llm", &config(3, 60_000, 100));

        assert_eq!(breaker.state().await, CircuitState::Closed);
        for _ in 0..3 {
            let admission = breaker.try_acquire::<&str>().await.unwrap();
            breaker.record_failure("connection refused").await;
            drop(admission);
        }
        assert_eq!(breaker.state().await, CircuitState::Open);

        // Fail fast without invoking anything.
        let err = breaker.try_acquire::<&str>().await.unwrap_err();
        assert!(matches!(err, ResilienceError::CircuitOpen { .. }));
        assert_eq!(breaker.stats().await.rejection_count, 1);

        // Cooldown elapses, trial admitted, success closes the circuit.
        sleep(Duration::from_millis(150)).await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        let admission = breaker.try_acquire::<&str>().await.unwrap();
        breaker.record_success().await;
        drop(admission);

        let stats = breaker.stats().await;
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.success_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sparse_failures_do_not_accumulate() {
        let breaker = CircuitBreaker::new("db", &config(2, 100, 1_000));

        breaker.record_failure("err").await;
        sleep(Duration::from_millis(150)).await;
        // Window expired: this failure restarts the count at 1.
        breaker.record_failure("err").await;

        let stats = breaker.stats().await;
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_exactly_one_trial() {
        let breaker = CircuitBreaker::new("llm", &config(1, 60_000, 100));
        breaker.record_failure("err").await;
        sleep(Duration::from_millis(150)).await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        let trial = breaker.try_acquire::<&str>().await.unwrap();
        let err = breaker.try_acquire::<&str>().await.unwrap_err();
        match err {
            ResilienceError::CircuitOpen { state, .. } => {
                assert_eq!(state, CircuitState::HalfOpen);
            }
            other => panic!("expected fail-fast, got {other:?}"),
        }

        // Dropping an unanswered admission frees the gate for the next caller.
        drop(trial);
        let _trial = breaker.try_acquire::<&str>().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_trial_does_not_wedge_half_open() {
        let breaker = CircuitBreaker::new("llm", &config(1, 60_000, 100));
        breaker.record_failure("err").await;
        sleep(Duration::from_millis(150)).await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        // The admitted caller goes away without recording any outcome,
        // as when its execute future is dropped mid-call.
        let admission = breaker.try_acquire::<&str>().await.unwrap();
        drop(admission);

        // No outcome was classified and the gate admits a fresh trial,
        // which can still close the circuit.
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        let trial = breaker.try_acquire::<&str>().await.unwrap();
        breaker.record_success().await;
        drop(trial);
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_restarts_full_cooldown() {
        let breaker = CircuitBreaker::new("llm", &config(1, 60_000, 200));
        breaker.record_failure("err").await;
        sleep(Duration::from_millis(250)).await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        let trial = breaker.try_acquire::<&str>().await.unwrap();
        breaker.record_failure("still down").await;
        drop(trial);
        assert_eq!(breaker.state().await, CircuitState::Open);

        // 150ms into the new period: still open, not the old remainder.
        sleep(Duration::from_millis(150)).await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        sleep(Duration::from_millis(60)).await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_classifies_timeout_as_failure() {
        let breaker = CircuitBreaker::new(
            "slow-service",
            &ResilienceConfig {
                failure_threshold: 1,
                call_timeout: Duration::from_millis(50),
                ..ResilienceConfig::standard()
            },
        );

        let result: Result<(), _> = breaker
            .execute("slow-call", || async {
                sleep(Duration::from_secs(10)).await;
                Ok::<_, std::io::Error>(())
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::Timeout { .. })));
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_returns_pristine_stats() {
        let breaker = CircuitBreaker::new("llm", &config(1, 60_000, 10_000));
        breaker.record_failure("err").await;
        let _ = breaker.try_acquire::<&str>().await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        breaker.reset().await;
        let stats = breaker.stats().await;
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
        assert_eq!(stats.success_count, 0);
        assert_eq!(stats.rejection_count, 0);

        // The stale timer must not fire into the reset breaker.
        sleep(Duration::from_millis(11_000)).await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn listeners_observe_transitions() {
        let listener = CollectingListener::new();
        let breaker = CircuitBreaker::with_listeners(
            "llm",
            &config(1, 60_000, 100),
            vec![listener.clone()],
        );

        breaker.record_failure("err").await;
        sleep(Duration::from_millis(150)).await;
        let admission = breaker.try_acquire::<&str>().await.unwrap();
        breaker.record_success().await;
        drop(admission);

        let kinds = listener.kinds().await;
        assert!(kinds.contains(&ResilienceEventKind::Opened));
        assert!(kinds.contains(&ResilienceEventKind::HalfOpened));
        assert!(kinds.contains(&ResilienceEventKind::Closed));
        assert!(kinds.contains(&ResilienceEventKind::StateChange {
            from: CircuitState::Closed,
            to: CircuitState::Open,
        }));
    }
}
