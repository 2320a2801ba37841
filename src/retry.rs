//! Bounded retry loop with exponential backoff and jitter.

use std::thread;
use std::time::{Duration, Instant};

use crate::error::{AttemptError, CompoundFailure, Outcome};

// Backoff delays are capped so the computed duration stays finite even for
// extreme multiplier/attempt combinations.
const MAX_DELAY_SECS: f64 = 86_400.0;

/// Immutable retry configuration.
///
/// Attempt `n` (1-based) that fails is followed by a sleep of
/// `backoff_base * backoff_multiplier^(n-1)`, scaled by a uniform draw in
/// `[1 - jitter_fraction, 1 + jitter_fraction]`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff_base: Duration,
    backoff_multiplier: f64,
    jitter_fraction: f64,
}

impl RetryPolicy {
    /// Creates a policy.
    ///
    /// # Panics
    ///
    /// Panics if `max_attempts` is zero or `jitter_fraction` is outside
    /// `[0, 1]`.
    pub fn new(
        max_attempts: u32,
        backoff_base: Duration,
        backoff_multiplier: f64,
        jitter_fraction: f64,
    ) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        assert!(
            (0.0..=1.0).contains(&jitter_fraction),
            "jitter_fraction must be within [0, 1]"
        );

        Self {
            max_attempts,
            backoff_base,
            backoff_multiplier,
            jitter_fraction,
        }
    }

    /// Number of attempts the loop may run.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Jittered backoff delay following the given 1-based attempt.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let scale = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let nominal = self.backoff_base.as_secs_f64() * scale;
        let spread = self.jitter_fraction * (2.0 * fastrand::f64() - 1.0);
        let secs = (nominal * (1.0 + spread)).clamp(0.0, MAX_DELAY_SECS);

        Duration::from_secs_f64(secs)
    }

    /// Runs `op` until it succeeds or attempts are exhausted.
    ///
    /// On exhaustion, fails with a [`CompoundFailure`] carrying every
    /// recorded attempt in order.
    pub fn run<T, E, F>(&self, op: F) -> Result<T, CompoundFailure<E>>
    where
        F: FnMut() -> Result<T, E>,
    {
        self.run_until(None, op)
    }

    /// Same as [`RetryPolicy::run`], aborting once `deadline` passes.
    ///
    /// The deadline is honored between attempts and bounds each backoff
    /// sleep; an attempt already running is not interrupted. An abort fails
    /// with outcome [`Outcome::TimedOut`] carrying whatever attempts
    /// completed so far.
    pub fn run_until<T, E, F>(
        &self,
        deadline: Option<Instant>,
        mut op: F,
    ) -> Result<T, CompoundFailure<E>>
    where
        F: FnMut() -> Result<T, E>,
    {
        let mut attempts = Vec::new();

        for attempt in 1..=self.max_attempts {
            if deadline.map_or(false, |d| Instant::now() >= d) {
                tracing::debug!(attempt, "deadline expired before attempt");
                return Err(CompoundFailure::new(attempts, Outcome::TimedOut));
            }

            let started = Instant::now();
            match op() {
                Ok(value) => return Ok(value),
                Err(error) => {
                    tracing::debug!(attempt, max = self.max_attempts, "attempt failed");
                    attempts.push(AttemptError {
                        attempt,
                        elapsed: started.elapsed(),
                        error,
                    });
                }
            }

            if attempt == self.max_attempts {
                break;
            }

            let delay = self.backoff_delay(attempt);
            match deadline {
                None => thread::sleep(delay),
                Some(d) => {
                    let remaining = d.saturating_duration_since(Instant::now());
                    if delay >= remaining {
                        if !remaining.is_zero() {
                            thread::sleep(remaining);
                        }
                        tracing::debug!(attempt, "deadline expired during backoff");
                        return Err(CompoundFailure::new(attempts, Outcome::TimedOut));
                    }
                    thread::sleep(delay);
                }
            }
        }

        tracing::debug!(attempts = attempts.len(), "attempts exhausted");
        Err(CompoundFailure::new(attempts, Outcome::Exhausted))
    }
}
