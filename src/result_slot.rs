//! One-shot result cell bridging the worker and the waiting producer.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Outcome written by the worker: the value or a rendered failure cause.
pub type Outcome<T> = Result<T, String>;

/// Result of a bounded wait on a slot.
#[derive(Debug, PartialEq, Eq)]
pub enum TimedTake<T> {
    Ready(Outcome<T>),
    Consumed,
    TimedOut,
}

enum SlotState<T> {
    Pending,
    Ready(Outcome<T>),
    Taken,
}

/// Single-writer, single-reader cell. Written once by the worker and taken
/// once by the owning producer.
pub struct ResultSlot<T> {
    state: Mutex<SlotState<T>>,
    filled: Condvar,
}

impl<T> ResultSlot<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending),
            filled: Condvar::new(),
        }
    }

    /// Publish the outcome and wake the reader. A second fill is ignored.
    pub fn fill(&self, outcome: Outcome<T>) {
        let mut guard = self.state.lock().expect("result slot mutex poisoned");
        if !matches!(*guard, SlotState::Pending) {
            debug_assert!(false, "result slot filled twice");
            tracing::error!("result slot filled twice; keeping first outcome");
            return;
        }
        *guard = SlotState::Ready(outcome);
        self.filled.notify_all();
    }

    /// Whether an outcome is waiting to be taken.
    pub fn is_ready(&self) -> bool {
        let guard = self.state.lock().expect("result slot mutex poisoned");
        matches!(*guard, SlotState::Ready(_))
    }

    /// Block until the outcome is available and move it out.
    ///
    /// Returns `None` if the outcome was already taken.
    pub fn take(&self) -> Option<Outcome<T>> {
        let mut guard = self.state.lock().expect("result slot mutex poisoned");
        loop {
            match std::mem::replace(&mut *guard, SlotState::Taken) {
                SlotState::Ready(outcome) => return Some(outcome),
                SlotState::Taken => return None,
                SlotState::Pending => {
                    *guard = SlotState::Pending;
                    guard = self.filled.wait(guard).expect("condvar wait failed");
                }
            }
        }
    }

    /// Like `take`, but gives up after `timeout`.
    ///
    /// The slot stays pending on `TimedOut`, so the caller may retry.
    pub fn take_timeout(&self, timeout: Duration) -> TimedTake<T> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.state.lock().expect("result slot mutex poisoned");
        loop {
            match std::mem::replace(&mut *guard, SlotState::Taken) {
                SlotState::Ready(outcome) => return TimedTake::Ready(outcome),
                SlotState::Taken => return TimedTake::Consumed,
                SlotState::Pending => {
                    *guard = SlotState::Pending;
                    let now = Instant::now();
                    if now >= deadline {
                        return TimedTake::TimedOut;
                    }
                    let (next, _) = self
                        .filled
                        .wait_timeout(guard, deadline - now)
                        .expect("condvar wait failed");
                    guard = next;
                }
            }
        }
    }
}

impl<T> Default for ResultSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}
