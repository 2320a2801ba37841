//! Circuit breaker: per-call admission control.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::state::{State, StateCell};

struct BreakerInner {
    cell: StateCell,
    trip_threshold: u32,
    reset_timeout: Duration,
    consecutive_failures: AtomicU32,
    trial_in_flight: AtomicBool,
}

/// A circuit breaker guarding one protected call.
///
/// While closed, every call is admitted and consecutive failures are
/// counted; reaching the trip threshold opens the breaker. While open, all
/// calls are rejected until the reset timeout elapses, at which point
/// exactly one caller is admitted as a half-open trial. The trial's outcome
/// either closes the breaker or reopens it with a fresh timeout.
///
/// Handles are cheap to clone; clones share state. Decisions are pure state
/// reads and writes and never block on I/O.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a breaker that trips after `trip_threshold` consecutive
    /// failures and stays open for `reset_timeout` before admitting a trial.
    ///
    /// # Panics
    ///
    /// Panics if `trip_threshold` is zero.
    pub fn new(trip_threshold: u32, reset_timeout: Duration) -> Self {
        assert!(trip_threshold >= 1, "trip_threshold must be at least 1");

        Self {
            inner: Arc::new(BreakerInner {
                cell: StateCell::new(),
                trip_threshold,
                reset_timeout,
                consecutive_failures: AtomicU32::new(0),
                trial_in_flight: AtomicBool::new(false),
            }),
        }
    }

    /// The current state.
    pub fn state(&self) -> State {
        self.inner.cell.current()
    }

    /// Consecutive failures counted since the last success while closed.
    pub fn consecutive_failures(&self) -> u32 {
        self.inner.consecutive_failures.load(Ordering::Acquire)
    }

    /// Whether a call may proceed right now.
    ///
    /// In the open state, the first caller after the reset timeout claims
    /// the trial token and is admitted half-open; every other caller keeps
    /// getting `false` until the trial's outcome is recorded.
    pub fn allow(&self) -> bool {
        match self.inner.cell.current() {
            State::Closed => true,
            State::Open => {
                if self.inner.cell.time_in_state() < self.inner.reset_timeout {
                    return false;
                }

                // Claim the trial token first so at most one caller can win
                // the transition below.
                if self
                    .inner
                    .trial_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return false;
                }

                if self.inner.cell.begin_trial() {
                    tracing::debug!("breaker half-open, trial admitted");
                    true
                } else {
                    // The state moved under us; release the token.
                    self.inner.trial_in_flight.store(false, Ordering::Release);
                    false
                }
            }
            State::HalfOpen => false,
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        self.inner.consecutive_failures.store(0, Ordering::Release);

        if self.inner.cell.current() == State::HalfOpen {
            if self.inner.cell.close() {
                tracing::debug!("breaker closed after successful trial");
            }
            self.inner.trial_in_flight.store(false, Ordering::Release);
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        match self.inner.cell.current() {
            State::HalfOpen => {
                if self.inner.cell.reopen() {
                    tracing::debug!("breaker reopened after failed trial");
                }
                self.inner.consecutive_failures.store(0, Ordering::Release);
                self.inner.trial_in_flight.store(false, Ordering::Release);
            }
            State::Closed => {
                let failures = self
                    .inner
                    .consecutive_failures
                    .fetch_add(1, Ordering::AcqRel)
                    + 1;
                if failures >= self.inner.trip_threshold && self.inner.cell.trip() {
                    tracing::debug!(failures, "breaker tripped open");
                }
            }
            // A call admitted earlier may finish after the breaker opened.
            State::Open => {}
        }
    }

    /// Releases an admitted trial whose caller never ran an attempt.
    ///
    /// The breaker returns to open with a fresh timeout and no failure is
    /// counted. A caller admitted as the trial that abandons the call
    /// before its first attempt, such as a deadline expiring first, must
    /// release the claim this way; recording an outcome releases it
    /// otherwise.
    pub fn abort_trial(&self) {
        if self.inner.cell.current() == State::HalfOpen {
            if self.inner.cell.reopen() {
                tracing::debug!("breaker reopened after abandoned trial");
            }
            self.inner.trial_in_flight.store(false, Ordering::Release);
        }
    }
}
