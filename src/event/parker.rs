use core::time::Duration;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Event on an OS mutex and condition variable.
pub(super) struct ParkerEvent {
    closed: Mutex<bool>,
    cond: Condvar,
}

impl ParkerEvent {
    pub(super) fn new(should_wait: bool) -> Self {
        Self {
            closed: Mutex::new(should_wait),
            cond: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, bool> {
        self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn set(&self, should_wait: bool) {
        let mut closed = self.state();
        *closed = should_wait;
        if !should_wait {
            self.cond.notify_all();
        }
    }

    pub(super) fn is_set(&self) -> bool {
        *self.state()
    }

    pub(super) fn wait(&self) {
        let mut closed = self.state();
        while *closed {
            closed = self.cond.wait(closed).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub(super) fn wait_timed(&self, timeout: Duration) -> bool {
        if Instant::now().checked_add(timeout).is_none() {
            self.wait();
            return true;
        }
        let closed = self.state();
        let (closed, _) = self
            .cond
            .wait_timeout_while(closed, timeout, |closed| *closed)
            .unwrap_or_else(PoisonError::into_inner);
        !*closed
    }
}
