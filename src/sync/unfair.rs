//! Mutual exclusion without ordering among waiters.
//!
//! Waiting allocates nothing, which makes this the lock of choice inside
//! allocators and other code that must not recurse into the heap.

use super::spinlock::SpinCell;
use super::{acquire_with, RawLock};
use crate::event::{Event, EventBackend};
use core::time::Duration;

pub struct UnfairMutex {
    taken: SpinCell<bool>,
    event: Event,
}

impl UnfairMutex {
    pub fn new() -> Self {
        Self::with_backend(EventBackend::detect())
    }

    pub fn with_backend(backend: EventBackend) -> Self {
        Self {
            taken: SpinCell::new(false),
            event: Event::with_backend(backend, false),
        }
    }

    /// Advisory: whether the mutex is held right now.
    pub fn is_locked(&self) -> bool {
        self.taken.with(|taken| *taken)
    }

    fn acquire(&self) -> bool {
        self.taken.with(|taken| {
            if *taken {
                false
            } else {
                *taken = true;
                self.event.set(true);
                true
            }
        })
    }
}

impl Default for UnfairMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl RawLock for UnfairMutex {
    fn lock(&self) {
        acquire_with(&self.event, None, || self.acquire());
    }

    fn try_lock(&self) -> bool {
        self.acquire()
    }

    fn try_timed_lock(&self, timeout: Duration) -> bool {
        acquire_with(&self.event, Some(timeout), || self.acquire())
    }

    fn unlock(&self) {
        self.taken.with(|taken| {
            debug_assert!(*taken, "unlocking an unlocked UnfairMutex");
            *taken = false;
            self.event.set(false);
        });
    }
}

impl core::fmt::Debug for UnfairMutex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UnfairMutex")
            .field("locked", &self.is_locked())
            .finish()
    }
}
