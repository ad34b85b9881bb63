/// One-shot wait gates
///
/// A gate is split into a `GateSignal` (held by whoever will deliver the
/// outcome, usually the event bridge) and a `GateWaiter` (held by the blocked
/// caller). Both halves are consumed by use, so a gate fires at most once and
/// is never waited on twice. Dropping an unfired signal abandons the gate and
/// wakes the waiter.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Errors returned to a waiter
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateError {
    #[error("Gate timed out after {0:?}")]
    TimedOut(Duration),
    #[error("Gate abandoned before it fired")]
    Abandoned,
}

enum Slot<T> {
    Pending,
    Fired(T),
    Abandoned,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
}

/// Sending half of a one-shot gate
pub struct GateSignal<T> {
    shared: Arc<Shared<T>>,
    fired: bool,
}

/// Receiving half of a one-shot gate
pub struct GateWaiter<T> {
    shared: Arc<Shared<T>>,
}

/// Create a fresh, unfired gate
pub fn one_shot<T>() -> (GateSignal<T>, GateWaiter<T>) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot::Pending),
        cond: Condvar::new(),
    });
    (
        GateSignal {
            shared: shared.clone(),
            fired: false,
        },
        GateWaiter { shared },
    )
}

impl<T> GateSignal<T> {
    /// Deliver the outcome and wake the waiter
    pub fn fire(mut self, value: T) {
        self.fired = true;
        let mut slot = self.shared.slot.lock();
        *slot = Slot::Fired(value);
        drop(slot);
        self.shared.cond.notify_all();
    }
}

impl<T> Drop for GateSignal<T> {
    fn drop(&mut self) {
        if self.fired {
            return;
        }
        let mut slot = self.shared.slot.lock();
        if matches!(*slot, Slot::Pending) {
            *slot = Slot::Abandoned;
        }
        drop(slot);
        self.shared.cond.notify_all();
    }
}

impl<T> GateWaiter<T> {
    /// Block until the gate fires, is abandoned, or `timeout` elapses
    pub fn wait_timeout(self, timeout: Duration) -> Result<T, GateError> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.slot.lock();
        loop {
            match std::mem::replace(&mut *slot, Slot::Abandoned) {
                Slot::Fired(value) => return Ok(value),
                Slot::Abandoned => return Err(GateError::Abandoned),
                Slot::Pending => {
                    *slot = Slot::Pending;
                    // Spurious wakeups re-check the slot; only the deadline ends the loop.
                    if self.shared.cond.wait_until(&mut slot, deadline).timed_out()
                        && matches!(*slot, Slot::Pending)
                    {
                        return Err(GateError::TimedOut(timeout));
                    }
                }
            }
        }
    }
}
