//! Builder for assembling an executor.

use std::error::Error;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crate::breaker::CircuitBreaker;
use crate::cache::{RefreshCurve, SingleFlightCache};
use crate::error::CompoundFailure;
use crate::executor::{CacheLayer, Executor, FallbackFn};
use crate::harness::Harness;
use crate::metrics::{CallMetrics, CallOutcome};
use crate::retry::RetryPolicy;

/// Builder for [`Executor`] instances.
///
/// Out-of-range settings panic at the setter; they are programmer errors,
/// not runtime conditions.
pub struct ExecutorBuilder<K, V, E> {
    trip_threshold: u32,
    reset_timeout: Duration,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_multiplier: f64,
    jitter_fraction: f64,
    metrics_window: Duration,
    cache_ttl: Option<Duration>,
    refresh_threshold: f64,
    refresh_curve: RefreshCurve,
    call_timeout: Option<Duration>,
    fallback: Option<FallbackFn<V>>,
    harness: Harness,
    _types: PhantomData<(K, E)>,
}

impl<K, V, E> Default for ExecutorBuilder<K, V, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, E> ExecutorBuilder<K, V, E> {
    /// Creates a builder with default settings.
    pub fn new() -> Self {
        Self {
            trip_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            max_attempts: 3,
            backoff_base: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            jitter_fraction: 0.1,
            metrics_window: Duration::from_secs(60),
            cache_ttl: None,
            refresh_threshold: 0.5,
            refresh_curve: RefreshCurve::Linear,
            call_timeout: None,
            fallback: None,
            harness: Harness::new(),
            _types: PhantomData,
        }
    }

    /// Consecutive failures that trip the breaker. Must be at least 1.
    pub fn trip_threshold(mut self, threshold: u32) -> Self {
        assert!(threshold >= 1, "trip_threshold must be at least 1");
        self.trip_threshold = threshold;
        self
    }

    /// How long the breaker stays open before admitting a trial.
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Attempts the retry loop may run per call. Must be at least 1.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        assert!(attempts >= 1, "max_attempts must be at least 1");
        self.max_attempts = attempts;
        self
    }

    /// Backoff before the second attempt.
    pub fn backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    /// Factor applied to the backoff after each further attempt.
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Uniform jitter applied to each backoff, as a fraction in `[0, 1]`.
    pub fn jitter_fraction(mut self, fraction: f64) -> Self {
        assert!(
            (0.0..=1.0).contains(&fraction),
            "jitter_fraction must be within [0, 1]"
        );
        self.jitter_fraction = fraction;
        self
    }

    /// Rolling window for call statistics. Must be non-zero.
    pub fn metrics_window(mut self, window: Duration) -> Self {
        assert!(!window.is_zero(), "metrics_window must be non-zero");
        self.metrics_window = window;
        self
    }

    /// Enables caching with the given time-to-live per computed value.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Fraction of the time-to-live after which early refreshes may be
    /// drawn. Must lie strictly between 0 and 1.
    pub fn refresh_threshold(mut self, threshold: f64) -> Self {
        assert!(
            threshold > 0.0 && threshold < 1.0,
            "refresh_threshold must be within (0, 1)"
        );
        self.refresh_threshold = threshold;
        self
    }

    /// Shape of the early-refresh probability curve.
    pub fn refresh_curve(mut self, curve: RefreshCurve) -> Self {
        self.refresh_curve = curve;
        self
    }

    /// Per-call deadline covering attempts, backoff sleeps, and in-flight
    /// waits.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Zero-argument substitute invoked whenever the call fails; the
    /// failure is still recorded and observed.
    pub fn fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn() -> V + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    /// Shares an existing observation tap instead of the executor's own.
    pub fn harness(mut self, harness: Harness) -> Self {
        self.harness = harness;
        self
    }
}

impl<K, V, E> ExecutorBuilder<K, V, E>
where
    K: Hash + Eq + Clone,
    V: Clone,
    E: Error + 'static,
{
    /// Builds the executor.
    pub fn build(self) -> Executor<K, V, E> {
        let metrics = CallMetrics::new(self.metrics_window);
        let harness = self.harness;

        let cache = self.cache_ttl.map(|ttl| {
            let refresh_metrics = metrics.clone();
            let refresh_harness = harness.clone();
            let cache = SingleFlightCache::new(self.refresh_threshold)
                .refresh_curve(self.refresh_curve)
                .on_refresh_error(move |failure: &CompoundFailure<E>| {
                    refresh_metrics.record(CallOutcome::Failure, None);
                    refresh_harness.observe(failure);
                });
            CacheLayer { cache, ttl }
        });

        Executor {
            breaker: CircuitBreaker::new(self.trip_threshold, self.reset_timeout),
            retry: RetryPolicy::new(
                self.max_attempts,
                self.backoff_base,
                self.backoff_multiplier,
                self.jitter_fraction,
            ),
            metrics,
            harness,
            cache,
            call_timeout: self.call_timeout,
            fallback: self.fallback,
        }
    }
}
