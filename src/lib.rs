//! # callguard
//!
//! Per-call resilience for invoking a potentially failing, potentially slow,
//! remote-or-expensive operation with bounded blast radius.
//!
//! An [`Executor`] composes four pieces into one call path:
//!
//! - a **circuit breaker** that rejects calls while a dependency is failing
//!   and probes recovery with a single half-open trial;
//! - a **single-flight cache** that serves values for a configurable
//!   time-to-live and guarantees at most one recomputation per key, so a
//!   burst of callers observing expiry cannot stampede the dependency;
//! - a **retry engine** that runs a bounded attempt loop with exponential
//!   backoff and jitter, reporting every recorded attempt on exhaustion;
//! - a **metrics collector** tracking rolling outcome counts and latency
//!   percentiles, snapshottable while calls are in flight.
//!
//! The cache also performs probabilistic early refresh: as a value ages past
//! a configurable fraction of its time-to-live, callers are increasingly
//! likely to recompute it ahead of expiry while still being served the
//! current value.
//!
//! ## Basic usage
//!
//! ```rust
//! use callguard::{CallError, Executor};
//! use std::fmt;
//! use std::time::Duration;
//!
//! #[derive(Debug)]
//! struct ServiceError(String);
//!
//! impl fmt::Display for ServiceError {
//!     fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
//!         write!(f, "service error: {}", self.0)
//!     }
//! }
//!
//! impl std::error::Error for ServiceError {}
//!
//! let executor = Executor::<&str, String, ServiceError>::builder()
//!     .trip_threshold(3)
//!     .reset_timeout(Duration::from_secs(30))
//!     .max_attempts(2)
//!     .build();
//!
//! match executor.call("greeting", || Ok("hello".to_string())) {
//!     Ok(value) => println!("call succeeded: {}", value),
//!     Err(CallError::ShortCircuited) => println!("breaker is open"),
//!     Err(err) => println!("call failed: {}", err),
//! }
//! ```
//!
//! ## Caching
//!
//! Configuring a time-to-live routes the call through the single-flight
//! cache, with the retry loop as the computation:
//!
//! ```rust
//! # fn main() -> Result<(), callguard::CallError<std::io::Error>> {
//! use callguard::Executor;
//! use std::io;
//! use std::time::Duration;
//!
//! let executor = Executor::<String, u64, io::Error>::builder()
//!     .cache_ttl(Duration::from_secs(60))
//!     .refresh_threshold(0.5)
//!     .build();
//!
//! let value = executor.call("stock-level".to_string(), || Ok(42))?;
//! assert_eq!(value, 42);
//!
//! // A second call within the time-to-live is served from the cache.
//! let again = executor.call("stock-level".to_string(), || Ok(0))?;
//! assert_eq!(again, 42);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod breaker;
mod cache;
mod config;
mod error;
mod executor;
mod harness;
mod metrics;
pub mod prelude;
mod registry;
mod retry;
mod state;

// Re-exports
pub use breaker::CircuitBreaker;
pub use cache::{RefreshCurve, SingleFlightCache};
pub use config::ExecutorBuilder;
pub use error::{
    AttemptError, CacheError, CallError, CallResult, CompoundFailure, NotRegistered, Outcome,
};
pub use executor::Executor;
pub use harness::Harness;
pub use metrics::{CallMetrics, CallOutcome, MetricsSnapshot};
pub use registry::Registry;
pub use retry::RetryPolicy;
pub use state::State;
