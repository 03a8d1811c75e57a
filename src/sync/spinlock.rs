//! Busy-wait lock for very short, allocation-free critical sections.

use super::RawLock;
use core::cell::UnsafeCell;
use core::time::Duration;
use portable_atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Spins between deadline checks in [`SpinLock::try_timed_lock`].
const SPINS_PER_CLOCK_READ: u32 = 64;

/// A test-and-set spin lock.
#[derive(Debug)]
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Advisory: whether someone holds the lock right now.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RawLock for SpinLock {
    fn lock(&self) {
        loop {
            if !self.locked.swap(true, Ordering::Acquire) {
                return;
            }
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn try_timed_lock(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.lock();
            return true;
        };
        loop {
            for _ in 0..SPINS_PER_CLOCK_READ {
                if self.try_lock() {
                    return true;
                }
                core::hint::spin_loop();
            }
            if Instant::now() >= deadline {
                return false;
            }
        }
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// A value guarded by a [`SpinLock`], reached through short closures.
pub(crate) struct SpinCell<T> {
    lock: SpinLock,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinCell<T> {}
unsafe impl<T: Send> Sync for SpinCell<T> {}

struct Unlock<'a>(&'a SpinLock);

impl Drop for Unlock<'_> {
    fn drop(&mut self) {
        self.0.unlock();
    }
}

impl<T> SpinCell<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self {
            lock: SpinLock::new(),
            value: UnsafeCell::new(value),
        }
    }

    /// Run `f` with exclusive access to the value.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.lock.lock();
        let _unlock = Unlock(&self.lock);
        f(unsafe { &mut *self.value.get() })
    }
}
