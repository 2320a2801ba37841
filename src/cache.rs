//! Single-flight cache with probabilistic early refresh.
//!
//! Values are cached per key with a nominal time-to-live. A fresh hit may
//! additionally be selected for an early refresh: the refresh probability is
//! zero until the value's age reaches a configurable fraction of its
//! time-to-live, then rises linearly to one at expiry. Spreading refreshes
//! out this way keeps a hot key from expiring under a burst of callers.
//!
//! Recomputation is single-flight: for any key, at most one computation
//! runs at a time. Callers that observe a miss or an expired value while a
//! computation is in flight attach to it and receive its result, value or
//! error, instead of starting their own. A computation that panics poisons
//! its flight: waiters are woken with [`CacheError::Poisoned`] and the
//! panic resumes in the caller that ran it.

use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::{Condvar, Mutex};

use crate::error::CacheError;

type RefreshErrorFn<E> = Box<dyn Fn(&E) + Send + Sync>;

/// Shape of the early-refresh probability curve between the refresh
/// threshold and expiry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RefreshCurve {
    /// Probability rises linearly from zero to one.
    Linear,

    /// Probability rises as the given power of the normalized age; higher
    /// exponents defer most refreshes towards expiry.
    Exponential(f64),
}

/// A cached value with its freshness bookkeeping.
struct Stored<V> {
    value: V,
    computed_at: Instant,
    ttl: Duration,
}

impl<V> Stored<V> {
    fn age(&self) -> Duration {
        self.computed_at.elapsed()
    }

    fn is_fresh(&self) -> bool {
        self.age() < self.ttl
    }
}

/// What one in-flight computation produced for its waiters.
enum FlightOutcome<V, E> {
    Done(Result<V, Arc<E>>),
    Poisoned,
}

impl<V: Clone, E> Clone for FlightOutcome<V, E> {
    fn clone(&self) -> Self {
        match self {
            FlightOutcome::Done(result) => FlightOutcome::Done(result.clone()),
            FlightOutcome::Poisoned => FlightOutcome::Poisoned,
        }
    }
}

/// Shared cell for one in-flight computation. Waiters block on `done` until
/// the owner publishes an outcome.
struct Flight<V, E> {
    outcome: Mutex<Option<FlightOutcome<V, E>>>,
    done: Condvar,
}

impl<V, E> Flight<V, E> {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }
}

impl<V: Clone, E> Flight<V, E> {
    fn finish(&self, outcome: FlightOutcome<V, E>) {
        *self.outcome.lock() = Some(outcome);
        self.done.notify_all();
    }

    /// Blocks until the owner publishes, or `deadline` passes.
    fn wait(&self, deadline: Option<Instant>) -> Option<FlightOutcome<V, E>> {
        let mut slot = self.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return Some(outcome.clone());
            }
            match deadline {
                None => self.done.wait(&mut slot),
                Some(d) => {
                    if self.done.wait_until(&mut slot, d).timed_out() {
                        return slot.as_ref().cloned();
                    }
                }
            }
        }
    }
}

struct Slot<V, E> {
    stored: Option<Stored<V>>,
    flight: Option<Arc<Flight<V, E>>>,
}

impl<V, E> Default for Slot<V, E> {
    fn default() -> Self {
        Self {
            stored: None,
            flight: None,
        }
    }
}

enum Action<V, E> {
    Hit(V),
    HitRefresh(V, Arc<Flight<V, E>>),
    Attach(Arc<Flight<V, E>>),
    Lead(Arc<Flight<V, E>>),
}

/// Cache keyed by `K` holding cloneable values, with computation errors of
/// type `E` shared across waiters.
pub struct SingleFlightCache<K, V, E> {
    slots: Mutex<AHashMap<K, Slot<V, E>>>,
    refresh_threshold: f64,
    curve: RefreshCurve,
    on_refresh_error: Option<RefreshErrorFn<E>>,
}

impl<K, V, E> SingleFlightCache<K, V, E>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Creates a cache whose early-refresh window starts at
    /// `refresh_threshold` (a fraction of each entry's time-to-live).
    ///
    /// # Panics
    ///
    /// Panics if `refresh_threshold` is outside the open interval `(0, 1)`.
    pub fn new(refresh_threshold: f64) -> Self {
        assert!(
            refresh_threshold > 0.0 && refresh_threshold < 1.0,
            "refresh_threshold must be within (0, 1)"
        );

        Self {
            slots: Mutex::new(AHashMap::new()),
            refresh_threshold,
            curve: RefreshCurve::Linear,
            on_refresh_error: None,
        }
    }

    /// Selects the early-refresh probability curve.
    ///
    /// # Panics
    ///
    /// Panics if an exponential curve has a non-positive exponent.
    pub fn refresh_curve(mut self, curve: RefreshCurve) -> Self {
        if let RefreshCurve::Exponential(exponent) = curve {
            assert!(exponent > 0.0, "curve exponent must be positive");
        }
        self.curve = curve;
        self
    }

    /// Registers a sink for speculative-refresh failures.
    ///
    /// Those failures never reach callers, which already hold a valid
    /// value; the sink is the only place they surface.
    pub fn on_refresh_error<F>(mut self, sink: F) -> Self
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.on_refresh_error = Some(Box::new(sink));
        self
    }

    /// Chance that a value of `age` is refreshed ahead of expiry: zero
    /// below `refresh_threshold * ttl`, one from `ttl` on, rising along
    /// the configured curve in between.
    pub fn refresh_probability(&self, age: Duration, ttl: Duration) -> f64 {
        let ttl_s = ttl.as_secs_f64();
        if ttl_s <= 0.0 || age >= ttl {
            return 1.0;
        }

        let age_s = age.as_secs_f64();
        let start = ttl_s * self.refresh_threshold;
        let base = ((age_s - start) / (ttl_s - start)).clamp(0.0, 1.0);
        match self.curve {
            RefreshCurve::Linear => base,
            RefreshCurve::Exponential(exponent) => base.powf(exponent),
        }
    }

    /// Returns the value for `key`, computing it when missing or expired.
    ///
    /// See [`SingleFlightCache::get_or_compute_until`]; this variant never
    /// gives up waiting on an in-flight computation.
    pub fn get_or_compute<F>(&self, key: K, ttl: Duration, compute: F) -> Result<V, CacheError<E>>
    where
        F: FnOnce() -> Result<V, E>,
    {
        self.get_or_compute_until(key, ttl, None, compute)
    }

    /// Returns the value for `key`, computing it when missing or expired,
    /// waiting on an in-flight computation no later than `deadline`.
    ///
    /// A fresh hit returns the cached value immediately; a refresh draw may
    /// make this caller recompute the entry ahead of expiry, but it still
    /// returns the value it found. A miss or expired hit either runs the
    /// computation (when none is in flight) or attaches to the one that is;
    /// either way every caller observes the same published result. Should
    /// the computation panic, attached waiters fail with
    /// [`CacheError::Poisoned`] and the panic resumes in the caller that
    /// ran it.
    pub fn get_or_compute_until<F>(
        &self,
        key: K,
        ttl: Duration,
        deadline: Option<Instant>,
        compute: F,
    ) -> Result<V, CacheError<E>>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let action = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(key.clone()).or_default();

            let fresh = slot
                .stored
                .as_ref()
                .filter(|stored| stored.is_fresh())
                .map(|stored| (stored.value.clone(), stored.age(), stored.ttl));

            match fresh {
                Some((value, age, nominal_ttl)) => {
                    // At most one recompute per key: no refresh draw while
                    // one is already in flight.
                    if slot.flight.is_none() {
                        let p = self.refresh_probability(age, nominal_ttl);
                        if p > 0.0 && fastrand::f64() < p {
                            let flight = Arc::new(Flight::new());
                            slot.flight = Some(Arc::clone(&flight));
                            Action::HitRefresh(value, flight)
                        } else {
                            Action::Hit(value)
                        }
                    } else {
                        Action::Hit(value)
                    }
                }
                None => match &slot.flight {
                    Some(flight) => Action::Attach(Arc::clone(flight)),
                    None => {
                        let flight = Arc::new(Flight::new());
                        slot.flight = Some(Arc::clone(&flight));
                        Action::Lead(flight)
                    }
                },
            }
        };

        match action {
            Action::Hit(value) => Ok(value),
            Action::HitRefresh(value, flight) => {
                tracing::debug!("early refresh drawn, recomputing ahead of expiry");
                if let Err(error) = self.compute_and_install(&key, ttl, &flight, compute) {
                    if let Some(sink) = &self.on_refresh_error {
                        sink(&error);
                    }
                }
                Ok(value)
            }
            Action::Lead(flight) => self
                .compute_and_install(&key, ttl, &flight, compute)
                .map_err(CacheError::Compute),
            Action::Attach(flight) => match flight.wait(deadline) {
                Some(FlightOutcome::Done(Ok(value))) => Ok(value),
                Some(FlightOutcome::Done(Err(error))) => Err(CacheError::Shared(error)),
                Some(FlightOutcome::Poisoned) => Err(CacheError::Poisoned),
                None => Err(CacheError::WaitTimeout),
            },
        }
    }

    /// Runs the computation this caller owns, publishes the outcome to any
    /// attached waiters, and installs a successful value under `key`.
    ///
    /// The computation is run under `catch_unwind` so a panic still wakes
    /// the waiters; they observe the poisoning and the panic resumes here.
    fn compute_and_install<F>(
        &self,
        key: &K,
        ttl: Duration,
        flight: &Arc<Flight<V, E>>,
        compute: F,
    ) -> Result<V, Arc<E>>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let outcome = panic::catch_unwind(AssertUnwindSafe(compute))
            .map(|result| result.map_err(Arc::new));

        {
            let mut slots = self.slots.lock();
            let slot = slots.entry(key.clone()).or_default();
            match &outcome {
                Ok(Ok(value)) => {
                    slot.stored = Some(Stored {
                        value: value.clone(),
                        computed_at: Instant::now(),
                        ttl,
                    });
                }
                Ok(Err(_)) | Err(_) => {
                    // A failed speculative refresh keeps the still-fresh
                    // value; a failed mandatory recompute leaves nothing.
                    if slot.stored.as_ref().map_or(false, |s| !s.is_fresh()) {
                        slot.stored = None;
                    }
                }
            }
            slot.flight = None;
            if slot.stored.is_none() {
                slots.remove(key);
            }
        }

        match outcome {
            Ok(result) => {
                flight.finish(FlightOutcome::Done(result.clone()));
                result
            }
            Err(payload) => {
                flight.finish(FlightOutcome::Poisoned);
                panic::resume_unwind(payload)
            }
        }
    }

    /// Evicts the value stored under `key`, if any. An in-flight
    /// computation is unaffected and will install its result as usual.
    pub fn invalidate(&self, key: &K) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(key) {
            slot.stored = None;
            if slot.flight.is_none() {
                slots.remove(key);
            }
        }
    }

    /// Number of keys currently holding a value.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.stored.is_some())
            .count()
    }

    /// Whether no key currently holds a value.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
