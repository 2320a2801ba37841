//! Error types for the resilient call path.

use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

/// Result type for executor calls.
pub type CallResult<T, E> = Result<T, CallError<E>>;

/// Final classification of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every permitted attempt ran and failed.
    Exhausted,

    /// The breaker rejected the call before any attempt ran.
    ShortCircuited,

    /// The call deadline expired mid-loop or mid-wait.
    TimedOut,
}

impl Display for Outcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Exhausted => write!(f, "exhausted"),
            Outcome::ShortCircuited => write!(f, "short-circuited"),
            Outcome::TimedOut => write!(f, "timed out"),
        }
    }
}

/// One failed attempt recorded by the retry engine.
#[derive(Debug)]
pub struct AttemptError<E> {
    /// 1-based index of the attempt.
    pub attempt: u32,

    /// Time the attempt spent running before it failed.
    pub elapsed: Duration,

    /// The error the protected call returned.
    pub error: E,
}

/// Aggregate failure for one call: every attempt that actually ran, in
/// order, plus the final outcome.
///
/// The number of recorded attempts never exceeds the policy's
/// `max_attempts`; it is smaller only when the call was short-circuited or
/// timed out before the loop finished.
#[derive(Debug)]
pub struct CompoundFailure<E> {
    attempts: Vec<AttemptError<E>>,
    outcome: Outcome,
}

impl<E> CompoundFailure<E> {
    pub(crate) fn new(attempts: Vec<AttemptError<E>>, outcome: Outcome) -> Self {
        Self { attempts, outcome }
    }

    /// The recorded attempts, oldest first.
    pub fn attempts(&self) -> &[AttemptError<E>] {
        &self.attempts
    }

    /// Why the call was given up on.
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }
}

impl<E> Display for CompoundFailure<E>
where
    E: Display,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "call {} after {} attempt(s)",
            self.outcome,
            self.attempts.len()
        )?;
        if let Some(last) = self.attempts.last() {
            write!(f, ", last error: {}", last.error)?;
        }
        Ok(())
    }
}

impl<E> Error for CompoundFailure<E>
where
    E: Error + 'static,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.attempts
            .last()
            .map(|a| &a.error as &(dyn Error + 'static))
    }
}

/// Error type for executor calls.
#[derive(Debug)]
pub enum CallError<E> {
    /// The breaker is open and no fallback is configured.
    ShortCircuited,

    /// The attempt loop this caller drove gave up.
    Attempts(Arc<CompoundFailure<E>>),

    /// A recomputation this caller attached to failed; the same failure is
    /// shared by every waiter.
    Recompute(Arc<CompoundFailure<E>>),
}

impl<E> CallError<E> {
    /// Final classification of the failure.
    pub fn outcome(&self) -> Outcome {
        match self {
            CallError::ShortCircuited => Outcome::ShortCircuited,
            CallError::Attempts(failure) | CallError::Recompute(failure) => failure.outcome(),
        }
    }

    /// Whether any of this caller's own attempts actually ran and failed.
    pub fn attempted(&self) -> bool {
        match self {
            CallError::ShortCircuited => false,
            CallError::Attempts(failure) | CallError::Recompute(failure) => {
                !failure.attempts().is_empty()
            }
        }
    }
}

impl<E> Display for CallError<E>
where
    E: Display,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CallError::ShortCircuited => write!(f, "call rejected by open circuit breaker"),
            CallError::Attempts(failure) => write!(f, "{}", failure),
            CallError::Recompute(failure) => write!(f, "shared recompute failed: {}", failure),
        }
    }
}

impl<E> Error for CallError<E>
where
    E: Error + 'static,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CallError::ShortCircuited => None,
            CallError::Attempts(failure) | CallError::Recompute(failure) => {
                Some(failure.as_ref() as &(dyn Error + 'static))
            }
        }
    }
}

/// Error type for cache lookups.
#[derive(Debug)]
pub enum CacheError<E> {
    /// This caller ran the computation and it failed.
    Compute(Arc<E>),

    /// The in-flight computation this caller attached to failed.
    Shared(Arc<E>),

    /// The in-flight computation this caller attached to panicked before
    /// publishing a result.
    Poisoned,

    /// The deadline expired while attached to an in-flight computation.
    WaitTimeout,
}

impl<E> Display for CacheError<E>
where
    E: Display,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Compute(error) => write!(f, "recompute failed: {}", error),
            CacheError::Shared(error) => write!(f, "in-flight recompute failed: {}", error),
            CacheError::Poisoned => write!(f, "in-flight recompute panicked"),
            CacheError::WaitTimeout => {
                write!(f, "deadline expired waiting on in-flight recompute")
            }
        }
    }
}

impl<E> Error for CacheError<E>
where
    E: Error + 'static,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CacheError::Compute(error) | CacheError::Shared(error) => {
                Some(error.as_ref() as &(dyn Error + 'static))
            }
            CacheError::Poisoned | CacheError::WaitTimeout => None,
        }
    }
}

/// A registry tag with no provider and no configured fallback.
#[derive(Debug)]
pub struct NotRegistered {
    tag: String,
}

impl NotRegistered {
    pub(crate) fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
        }
    }

    /// The tag that failed to resolve.
    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl Display for NotRegistered {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "no provider registered for tag \"{}\"", self.tag)
    }
}

impl Error for NotRegistered {}
