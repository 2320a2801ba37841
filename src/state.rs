//! Breaker state machine primitives.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// The possible states of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Calls are admitted; consecutive failures are being counted.
    Closed,

    /// Calls are rejected until the reset timeout elapses.
    Open,

    /// A single trial call is probing whether the dependency recovered.
    HalfOpen,
}

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

impl State {
    fn as_u8(self) -> u8 {
        match self {
            State::Closed => CLOSED,
            State::Open => OPEN,
            State::HalfOpen => HALF_OPEN,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            OPEN => State::Open,
            HALF_OPEN => State::HalfOpen,
            _ => State::Closed,
        }
    }
}

/// Compare-and-swap state cell with a transition timestamp.
///
/// Transitions are totally ordered per cell: each one is a single CAS, and
/// losers of a race observe the winner's state on their next read.
pub(crate) struct StateCell {
    state: AtomicU8,
    transitioned_at: Mutex<Instant>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(CLOSED),
            transitioned_at: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn current(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Time since the last successful transition.
    pub(crate) fn time_in_state(&self) -> Duration {
        self.transitioned_at.lock().elapsed()
    }

    fn swap(&self, from: State, to: State) -> bool {
        let swapped = self
            .state
            .compare_exchange(
                from.as_u8(),
                to.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        if swapped {
            *self.transitioned_at.lock() = Instant::now();
        }

        swapped
    }

    /// Closed to open, after the failure threshold is reached.
    pub(crate) fn trip(&self) -> bool {
        self.swap(State::Closed, State::Open)
    }

    /// Open to half-open, admitting the single trial.
    pub(crate) fn begin_trial(&self) -> bool {
        self.swap(State::Open, State::HalfOpen)
    }

    /// Half-open to closed, after a successful trial.
    pub(crate) fn close(&self) -> bool {
        self.swap(State::HalfOpen, State::Closed)
    }

    /// Half-open back to open, after a failed trial. Restarts the timeout.
    pub(crate) fn reopen(&self) -> bool {
        self.swap(State::HalfOpen, State::Open)
    }
}
