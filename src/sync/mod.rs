//! Synchronization primitives built on [`Event`](crate::event::Event).
//!
//! Every lock exposes a raw enter/leave interface, mirrored by RAII guards.
//! Timed variants take a [`Duration`] and report a timeout as `false`.
//!
//! Entering the write side of a non-reentrant read/write lock while holding
//! its read side (or the other way round) deadlocks. That is a caller error
//! and is not detected.

pub mod barrier;
pub mod condvar;
pub mod fair_rwlock;
pub mod reentrant;
pub mod rwlock;
pub mod semaphore;
pub mod spinlock;
pub mod unfair;

pub use barrier::{Barrier, BarrierWaitResult};
pub use condvar::Condvar;
pub use fair_rwlock::FairRwLock;
pub use reentrant::{ReentrantContext, ReentrantRwLock, ThreadReentrantRwLock};
pub use rwlock::RwLock;
pub use semaphore::Semaphore;
pub use spinlock::SpinLock;
pub use unfair::UnfairMutex;

use crate::event::Event;
use core::time::Duration;
use std::time::Instant;

/// A mutual exclusion lock with raw lock/unlock calls.
///
/// Unlocking a lock the caller does not hold is a caller error.
pub trait RawLock {
    fn lock(&self);
    fn try_lock(&self) -> bool;
    fn try_timed_lock(&self, timeout: Duration) -> bool;
    fn unlock(&self);

    /// Lock and return a guard that unlocks on drop.
    fn guard(&self) -> LockGuard<'_, Self>
    where
        Self: Sized,
    {
        self.lock();
        LockGuard { lock: self }
    }

    /// Try to lock without blocking.
    fn try_guard(&self) -> Option<LockGuard<'_, Self>>
    where
        Self: Sized,
    {
        if self.try_lock() {
            Some(LockGuard { lock: self })
        } else {
            None
        }
    }
}

/// RAII guard for any [`RawLock`].
pub struct LockGuard<'a, L: RawLock + ?Sized> {
    lock: &'a L,
}

impl<'a, L: RawLock + ?Sized> LockGuard<'a, L> {
    /// The lock this guard holds.
    pub fn raw(&self) -> &'a L {
        self.lock
    }
}

impl<L: RawLock + ?Sized> Drop for LockGuard<'_, L> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// A read/write lock with raw enter/leave calls.
pub trait RawRwLock {
    fn enter_read(&self);
    fn try_enter_read(&self) -> bool;
    fn try_timed_enter_read(&self, timeout: Duration) -> bool;
    fn leave_read(&self);

    fn enter_write(&self);
    fn try_enter_write(&self) -> bool;
    fn try_timed_enter_write(&self, timeout: Duration) -> bool;
    fn leave_write(&self);

    /// Enter the read side and return a guard that leaves it on drop.
    fn read(&self) -> ReadGuard<'_, Self>
    where
        Self: Sized,
    {
        self.enter_read();
        ReadGuard { lock: self }
    }

    /// Enter the write side and return a guard that leaves it on drop.
    fn write(&self) -> WriteGuard<'_, Self>
    where
        Self: Sized,
    {
        self.enter_write();
        WriteGuard { lock: self }
    }

    /// View the write side as a plain [`RawLock`], e.g. for a [`Condvar`].
    fn write_lock(&self) -> WriteLock<'_, Self>
    where
        Self: Sized,
    {
        WriteLock { lock: self }
    }
}

pub struct ReadGuard<'a, R: RawRwLock> {
    lock: &'a R,
}

impl<R: RawRwLock> Drop for ReadGuard<'_, R> {
    fn drop(&mut self) {
        self.lock.leave_read();
    }
}

pub struct WriteGuard<'a, R: RawRwLock> {
    lock: &'a R,
}

impl<R: RawRwLock> Drop for WriteGuard<'_, R> {
    fn drop(&mut self) {
        self.lock.leave_write();
    }
}

/// The write side of a read/write lock as a [`RawLock`].
pub struct WriteLock<'a, R: RawRwLock> {
    lock: &'a R,
}

impl<R: RawRwLock> RawLock for WriteLock<'_, R> {
    fn lock(&self) {
        self.lock.enter_write();
    }

    fn try_lock(&self) -> bool {
        self.lock.try_enter_write()
    }

    fn try_timed_lock(&self, timeout: Duration) -> bool {
        self.lock.try_timed_enter_write(timeout)
    }

    fn unlock(&self) {
        self.lock.leave_write();
    }
}

/// Retry `attempt` until it succeeds, sleeping on `event` in between.
///
/// `event` must be set whenever `attempt` cannot succeed, so a cleared event
/// always means "try again". Returns `false` once `timeout` ran out. A
/// timeout too large to form a deadline waits without one.
pub(crate) fn acquire_with(
    event: &Event,
    timeout: Option<Duration>,
    mut attempt: impl FnMut() -> bool,
) -> bool {
    if attempt() {
        return true;
    }
    let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
    loop {
        match deadline {
            None => event.wait(),
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return false;
                }
                event.wait_timed(remaining);
            }
        }
        if attempt() {
            return true;
        }
    }
}
