//! Re-exports for the common call path.
//!
//! ```rust,no_run
//! use callguard::prelude::*;
//! ```

pub use crate::config::ExecutorBuilder;
pub use crate::error::{CallError, CallResult, CompoundFailure, Outcome};
pub use crate::executor::Executor;
pub use crate::metrics::{CallOutcome, MetricsSnapshot};
pub use crate::retry::RetryPolicy;
pub use crate::state::State;
