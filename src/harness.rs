//! Observation tap: forwards failures to a logger and an optional observer.

use std::error::Error;
use std::sync::Arc;

use parking_lot::RwLock;

type ObserverFn = Arc<dyn Fn(&(dyn Error + 'static)) + Send + Sync + 'static>;

/// Side-effect-only error tap.
///
/// Every failure on the call path is reported here, including speculative
/// refresh failures the caller never sees. Observing logs the error and
/// forwards it to the registered observer; it never alters what the caller
/// receives.
#[derive(Clone)]
pub struct Harness {
    observer: Arc<RwLock<Option<ObserverFn>>>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    /// Creates a tap with no observer registered.
    pub fn new() -> Self {
        Self {
            observer: Arc::new(RwLock::new(None)),
        }
    }

    /// Registers the observer invoked on every reported failure.
    pub fn set_observer<F>(&self, observer: F)
    where
        F: Fn(&(dyn Error + 'static)) + Send + Sync + 'static,
    {
        *self.observer.write() = Some(Arc::new(observer));
    }

    /// Reports a failure.
    pub fn observe(&self, error: &(dyn Error + 'static)) {
        tracing::error!(%error, "observed failure");
        if let Some(observer) = self.observer.read().as_ref() {
            observer(error);
        }
    }
}
