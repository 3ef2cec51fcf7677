//! Failure-rate circuit breaker shared by all recognition calls in a process.
//!
//! Outcomes are sampled over a rolling window. Once the window holds at least
//! `min_throughput` outcomes and the failure ratio reaches `failure_ratio`, the circuit opens
//! for `break_duration`. The first caller after the cooldown becomes the half-open trial;
//! everyone else keeps failing fast until the trial settles.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

/// Breaker tuning.
#[derive(Debug, Clone, Copy)]
pub struct BreakerPolicy {
    /// Rolling window over which outcomes are sampled.
    pub sampling_window: Duration,
    /// Minimum outcomes in the window before the ratio is evaluated.
    pub min_throughput: usize,
    /// Failure ratio (0.0..=1.0) that opens the circuit.
    pub failure_ratio: f64,
    /// How long the circuit stays open before admitting a trial call.
    pub break_duration: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            sampling_window: Duration::from_secs(120),
            min_throughput: 7,
            failure_ratio: 0.5,
            break_duration: Duration::from_secs(120),
        }
    }
}

/// Externally visible circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls fail fast.
    Open,
    /// A single trial call decides whether to close or reopen.
    HalfOpen,
}

#[derive(Debug)]
enum Phase {
    Closed,
    Open { until: Instant },
    HalfOpen { trial_in_flight: bool },
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    window: VecDeque<(Instant, bool)>,
}

/// Returned when the circuit refuses a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitOpen;

/// Shared circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    policy: BreakerPolicy,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<CircuitState>,
    openings: AtomicU64,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(policy: BreakerPolicy) -> Self {
        let (state_tx, _) = watch::channel(CircuitState::Closed);
        Self {
            policy,
            inner: Mutex::new(Inner {
                phase: Phase::Closed,
                window: VecDeque::new(),
            }),
            state_tx,
            openings: AtomicU64::new(0),
        }
    }

    /// Current state, accounting for an elapsed cooldown.
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        match inner.phase {
            Phase::Closed => CircuitState::Closed,
            Phase::Open { until } if Instant::now() >= until => CircuitState::HalfOpen,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    /// Number of times the circuit has opened since construction.
    pub fn opened_count(&self) -> u64 {
        self.openings.load(Ordering::Relaxed)
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<CircuitState> {
        self.state_tx.subscribe()
    }

    /// Ask permission to issue a call.
    ///
    /// The returned permit must be settled with [`CallPermit::succeeded`] or
    /// [`CallPermit::failed`]; dropping it unsettled leaves the statistics untouched.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>, CircuitOpen> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let now = Instant::now();
        match inner.phase {
            Phase::Closed => Ok(CallPermit::new(self, false)),
            Phase::Open { until } if now >= until => {
                inner.phase = Phase::HalfOpen {
                    trial_in_flight: true,
                };
                self.publish(CircuitState::HalfOpen);
                Ok(CallPermit::new(self, true))
            }
            Phase::Open { .. } => Err(CircuitOpen),
            Phase::HalfOpen {
                trial_in_flight: false,
            } => {
                inner.phase = Phase::HalfOpen {
                    trial_in_flight: true,
                };
                Ok(CallPermit::new(self, true))
            }
            Phase::HalfOpen {
                trial_in_flight: true,
            } => Err(CircuitOpen),
        }
    }

    fn record(&self, trial: bool, success: bool) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let now = Instant::now();

        if trial {
            if success {
                inner.window.clear();
                inner.phase = Phase::Closed;
                self.publish(CircuitState::Closed);
            } else {
                self.trip(inner, now);
            }
            return;
        }

        // Calls admitted before the circuit opened may settle afterwards.
        if !matches!(inner.phase, Phase::Closed) {
            return;
        }

        inner.window.push_back((now, success));
        self.prune(inner, now);

        let total = inner.window.len();
        if total < self.policy.min_throughput {
            return;
        }
        let failures = inner.window.iter().filter(|(_, ok)| !ok).count();
        if failures as f64 / total as f64 >= self.policy.failure_ratio {
            tracing::warn!(
                failures,
                total,
                ratio = self.policy.failure_ratio,
                "Failure ratio reached"
            );
            self.trip(inner, now);
        }
    }

    fn release_trial(&self) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if let Phase::HalfOpen { .. } = inner.phase {
            inner.phase = Phase::HalfOpen {
                trial_in_flight: false,
            };
        }
    }

    fn trip(&self, inner: &mut Inner, now: Instant) {
        inner.window.clear();
        inner.phase = Phase::Open {
            until: now + self.policy.break_duration,
        };
        self.openings.fetch_add(1, Ordering::Relaxed);
        self.publish(CircuitState::Open);
    }

    fn prune(&self, inner: &mut Inner, now: Instant) {
        while let Some((at, _)) = inner.window.front() {
            if now.duration_since(*at) > self.policy.sampling_window {
                inner.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn publish(&self, state: CircuitState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            match state {
                CircuitState::Open => tracing::warn!(
                    from = ?previous,
                    break_secs = self.policy.break_duration.as_secs(),
                    "Recognition circuit opened"
                ),
                CircuitState::HalfOpen => {
                    tracing::info!(from = ?previous, "Recognition circuit half-open; admitting trial call")
                }
                CircuitState::Closed => {
                    tracing::info!(from = ?previous, "Recognition circuit closed")
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Permission to perform one call through the breaker.
#[derive(Debug)]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    /// Whether this permit is the half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Record a successful call.
    pub fn succeeded(mut self) {
        self.settled = true;
        self.breaker.record(self.trial, true);
    }

    /// Record a failed call.
    pub fn failed(mut self) {
        self.settled = true;
        self.breaker.record(self.trial, false);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(breaker: &CircuitBreaker, outcomes: &[bool]) {
        for &ok in outcomes {
            let permit = breaker.try_acquire().expect("closed");
            if ok {
                permit.succeeded();
            } else {
                permit.failed();
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_min_throughput_at_failure_ratio() {
        let breaker = CircuitBreaker::new(BreakerPolicy::default());
        feed(&breaker, &[true, true, true, false, false, false]);
        assert_eq!(breaker.state(), CircuitState::Closed);

        feed(&breaker, &[false]);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.opened_count(), 1);
        assert_eq!(breaker.try_acquire().map(|_| ()), Err(CircuitOpen));
    }

    #[tokio::test(start_paused = true)]
    async fn trailing_successes_still_trip_once_ratio_is_met() {
        let breaker = CircuitBreaker::new(BreakerPolicy::default());
        feed(&breaker, &[false, false, false, false, true, true, true]);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn stays_closed_below_ratio() {
        let breaker = CircuitBreaker::new(BreakerPolicy::default());
        feed(&breaker, &[true, false, true, false, true, false, true, true]);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn old_failures_fall_out_of_the_window() {
        let breaker = CircuitBreaker::new(BreakerPolicy::default());
        feed(&breaker, &[false, false, false, false]);
        tokio::time::advance(Duration::from_secs(121)).await;
        feed(&breaker, &[true, true, true]);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_trial_closes_after_cooldown() {
        let breaker = CircuitBreaker::new(BreakerPolicy::default());
        let mut states = breaker.subscribe();
        feed(&breaker, &[false; 7]);
        assert_eq!(*states.borrow_and_update(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(119)).await;
        assert!(breaker.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        let trial = breaker.try_acquire().expect("trial admitted");
        assert!(trial.is_trial());
        assert!(breaker.try_acquire().is_err(), "only one trial at a time");
        trial.succeeded();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(*states.borrow_and_update(), CircuitState::Closed);
        assert!(!breaker.try_acquire().expect("closed").is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens() {
        let breaker = CircuitBreaker::new(BreakerPolicy::default());
        feed(&breaker, &[false; 7]);
        tokio::time::advance(Duration::from_secs(120)).await;

        breaker.try_acquire().expect("trial").failed();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(breaker.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_trial_frees_the_slot() {
        let breaker = CircuitBreaker::new(BreakerPolicy::default());
        feed(&breaker, &[false; 7]);
        tokio::time::advance(Duration::from_secs(120)).await;

        drop(breaker.try_acquire().expect("trial"));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_acquire().expect("second trial").is_trial());
    }
}
