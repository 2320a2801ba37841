//! The composed resilient call path.

use std::error::Error;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::breaker::CircuitBreaker;
use crate::cache::SingleFlightCache;
use crate::config::ExecutorBuilder;
use crate::error::{CacheError, CallError, CallResult, CompoundFailure, Outcome};
use crate::harness::Harness;
use crate::metrics::{CallMetrics, CallOutcome};
use crate::retry::RetryPolicy;

pub(crate) type FallbackFn<V> = Arc<dyn Fn() -> V + Send + Sync>;

pub(crate) struct CacheLayer<K, V, E> {
    pub(crate) cache: SingleFlightCache<K, V, CompoundFailure<E>>,
    pub(crate) ttl: Duration,
}

/// Executes a protected call through the full resilience path: breaker
/// admission, optional single-flight caching, bounded retries, and metrics.
///
/// An executor is assembled once via [`Executor::builder`] and then shared
/// (behind an [`Arc`]) by any number of concurrent callers.
pub struct Executor<K, V, E> {
    pub(crate) breaker: CircuitBreaker,
    pub(crate) retry: RetryPolicy,
    pub(crate) metrics: CallMetrics,
    pub(crate) harness: Harness,
    pub(crate) cache: Option<CacheLayer<K, V, E>>,
    pub(crate) call_timeout: Option<Duration>,
    pub(crate) fallback: Option<FallbackFn<V>>,
}

impl<K, V, E> Executor<K, V, E>
where
    K: Hash + Eq + Clone,
    V: Clone,
    E: Error + 'static,
{
    /// Creates a builder with default settings.
    pub fn builder() -> ExecutorBuilder<K, V, E> {
        ExecutorBuilder::new()
    }

    /// The breaker guarding this call.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Live statistics for this call.
    pub fn metrics(&self) -> &CallMetrics {
        &self.metrics
    }

    /// The observation tap failures are reported to.
    pub fn harness(&self) -> &Harness {
        &self.harness
    }

    /// Evicts the cached value under `key`, if caching is configured.
    pub fn invalidate(&self, key: &K) {
        if let Some(layer) = &self.cache {
            layer.cache.invalidate(key);
        }
    }

    /// Invokes `user_fn` through the resilience path.
    ///
    /// A rejected call is recorded as short-circuited and fails (or falls
    /// back) without invoking `user_fn`. Otherwise the call runs through
    /// the cache when one is configured, with the retry loop as the
    /// computation, and the outcome plus end-to-end latency is recorded.
    /// When a fallback is configured it substitutes for any failure; the
    /// failure is still recorded and observed.
    ///
    /// # Panics
    ///
    /// Panics if the recomputation this call ran or attached to panicked.
    pub fn call<F>(&self, key: K, user_fn: F) -> CallResult<V, E>
    where
        F: FnMut() -> Result<V, E>,
    {
        if !self.breaker.allow() {
            self.metrics.record(CallOutcome::ShortCircuited, None);
            let error = CallError::ShortCircuited;
            self.harness.observe(&error);
            return match &self.fallback {
                Some(fallback) => Ok(fallback()),
                None => Err(error),
            };
        }

        let started = Instant::now();
        let deadline = self.call_timeout.map(|timeout| started + timeout);
        let result = self.dispatch(key, deadline, user_fn);
        let latency = started.elapsed();

        match result {
            Ok(value) => {
                self.breaker.record_success();
                self.metrics.record(CallOutcome::Success, Some(latency));
                Ok(value)
            }
            Err(error) => {
                if influences_breaker(&error) {
                    self.breaker.record_failure();
                } else {
                    // This caller may hold the half-open trial even though
                    // none of its attempts ran; the claim must be released.
                    self.breaker.abort_trial();
                }
                let outcome = if error.outcome() == Outcome::TimedOut {
                    CallOutcome::Timeout
                } else {
                    CallOutcome::Failure
                };
                self.metrics.record(outcome, Some(latency));
                self.harness.observe(&error);
                match &self.fallback {
                    Some(fallback) => Ok(fallback()),
                    None => Err(error),
                }
            }
        }
    }

    fn dispatch<F>(&self, key: K, deadline: Option<Instant>, mut user_fn: F) -> CallResult<V, E>
    where
        F: FnMut() -> Result<V, E>,
    {
        match &self.cache {
            Some(layer) => layer
                .cache
                .get_or_compute_until(key, layer.ttl, deadline, || {
                    self.retry.run_until(deadline, &mut user_fn)
                })
                .map_err(|error| match error {
                    CacheError::Compute(failure) => CallError::Attempts(failure),
                    CacheError::Shared(failure) => CallError::Recompute(failure),
                    // A panicked computation poisons every waiter, the way
                    // the standard library's once cells do.
                    CacheError::Poisoned => panic!("in-flight recompute panicked"),
                    CacheError::WaitTimeout => CallError::Attempts(Arc::new(
                        CompoundFailure::new(Vec::new(), Outcome::TimedOut),
                    )),
                }),
            None => self
                .retry
                .run_until(deadline, user_fn)
                .map_err(|failure| CallError::Attempts(Arc::new(failure))),
        }
    }
}

/// A caller cancelled before any of its own attempts ran must not count
/// against the breaker; shared recompute failures do.
fn influences_breaker<E>(error: &CallError<E>) -> bool {
    match error {
        CallError::ShortCircuited => false,
        CallError::Attempts(_) => error.attempted(),
        CallError::Recompute(_) => true,
    }
}
