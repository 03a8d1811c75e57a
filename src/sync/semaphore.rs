//! Counting semaphore.

use super::acquire_with;
use super::spinlock::SpinCell;
use crate::error::{SyncError, SyncResult};
use crate::event::{Event, EventBackend};
use core::time::Duration;
use portable_atomic::{AtomicU32, Ordering};

/// A counting resource gate.
///
/// The event is set exactly while the count is zero: a decrement to zero
/// arms it, an increment from zero disarms it.
pub struct Semaphore {
    count: SpinCell<u32>,
    advisory: AtomicU32,
    event: Event,
}

impl Semaphore {
    pub fn new(initial: u32) -> Self {
        Self::with_backend(initial, EventBackend::detect())
    }

    pub fn with_backend(initial: u32, backend: EventBackend) -> Self {
        Self {
            count: SpinCell::new(initial),
            advisory: AtomicU32::new(initial),
            event: Event::with_backend(backend, initial == 0),
        }
    }

    /// Release one unit.
    pub fn increment(&self) -> SyncResult<()> {
        self.count.with(|count| {
            if *count == u32::MAX {
                return Err(SyncError::SemaphoreOverflow);
            }
            *count += 1;
            self.advisory.store(*count, Ordering::Relaxed);
            if *count == 1 {
                self.event.set(false);
            }
            Ok(())
        })
    }

    /// Take one unit, blocking while none is available.
    pub fn decrement(&self) {
        acquire_with(&self.event, None, || self.try_decrement());
    }

    /// Take one unit if one is available right now.
    pub fn try_decrement(&self) -> bool {
        self.count.with(|count| {
            if *count == 0 {
                return false;
            }
            *count -= 1;
            self.advisory.store(*count, Ordering::Relaxed);
            if *count == 0 {
                self.event.set(true);
            }
            true
        })
    }

    /// Take one unit, waiting at most `timeout` for it.
    pub fn try_timed_decrement(&self, timeout: Duration) -> bool {
        acquire_with(&self.event, Some(timeout), || self.try_decrement())
    }

    /// Advisory count; may be stale by the time the caller looks at it.
    pub fn value(&self) -> u32 {
        self.advisory.load(Ordering::Relaxed)
    }
}

impl core::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Semaphore")
            .field("value", &self.value())
            .finish()
    }
}
