//! Condition variable usable with any [`RawLock`].
//!
//! Each wait registers its own event in the waiter list and pushes a hazard
//! that opens that event, so a thread or fiber terminated while waiting
//! wakes up and reaches the termination checkpoint instead of hanging.

use super::spinlock::SpinCell;
use super::{LockGuard, RawLock};
use crate::event::{Event, EventBackend};
use crate::hazard::{HazardEntry, HazardScope};
use core::time::Duration;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Default)]
struct Waiters {
    list: VecDeque<(u64, Arc<Event>)>,
    next_id: u64,
}

pub struct Condvar {
    backend: EventBackend,
    waiters: SpinCell<Waiters>,
}

impl Condvar {
    pub fn new() -> Self {
        Self::with_backend(EventBackend::detect())
    }

    pub fn with_backend(backend: EventBackend) -> Self {
        Self {
            backend,
            waiters: SpinCell::new(Waiters::default()),
        }
    }

    /// Release the guarded lock, wait for a signal, then re-acquire it.
    pub fn wait<L: RawLock + ?Sized>(&self, guard: &mut LockGuard<'_, L>) {
        self.block(guard.raw(), None);
    }

    /// Like [`wait`](Self::wait) with a timeout. Returns `true` if a signal
    /// arrived. The lock is re-acquired either way.
    pub fn wait_timed<L: RawLock + ?Sized>(
        &self,
        guard: &mut LockGuard<'_, L>,
        timeout: Duration,
    ) -> bool {
        self.block(guard.raw(), Some(timeout))
    }

    /// [`wait`](Self::wait) for callers that hold `lock` without a guard.
    pub fn wait_raw<L: RawLock + ?Sized>(&self, lock: &L) {
        self.block(lock, None);
    }

    pub fn wait_timed_raw<L: RawLock + ?Sized>(&self, lock: &L, timeout: Duration) -> bool {
        self.block(lock, Some(timeout))
    }

    /// Wake every current waiter. Returns how many were woken.
    pub fn signal(&self) -> usize {
        self.signal_count(usize::MAX)
    }

    /// Wake at most `count` waiters, longest waiting first.
    pub fn signal_count(&self, count: usize) -> usize {
        let woken: Vec<Arc<Event>> = self.waiters.with(|w| {
            let n = count.min(w.list.len());
            w.list.drain(..n).map(|(_, event)| event).collect()
        });
        for event in &woken {
            event.set(false);
        }
        woken.len()
    }

    /// Advisory number of blocked waiters.
    pub fn waiter_count(&self) -> usize {
        self.waiters.with(|w| w.list.len())
    }

    fn block<L: RawLock + ?Sized>(&self, lock: &L, timeout: Option<Duration>) -> bool {
        let event = Arc::new(Event::with_backend(self.backend, true));
        let id = self.waiters.with(|w| {
            let id = w.next_id;
            w.next_id += 1;
            w.list.push_back((id, event.clone()));
            id
        });

        let interrupt = {
            let event = event.clone();
            HazardScope::push_current(HazardEntry::owned(move || event.set(false)))
        };
        // A request that came before the hazard was pushed found nothing to purge.
        if crate::manager::termination_pending() {
            event.set(false);
        }

        lock.unlock();
        match timeout {
            None => event.wait(),
            Some(timeout) => {
                event.wait_timed(timeout);
            }
        }
        drop(interrupt);

        // Still queued means nobody signalled us: a timeout or an interrupt.
        let still_queued = self.waiters.with(|w| {
            match w.list.iter().position(|(waiter, _)| *waiter == id) {
                Some(pos) => {
                    w.list.remove(pos);
                    true
                }
                None => false,
            }
        });

        lock.lock();
        crate::checkpoint();
        !still_queued
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Condvar {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Condvar")
            .field("waiters", &self.waiter_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{RawRwLock, RwLock, SpinLock, UnfairMutex};

    #[test]
    fn test_timed_wait_reacquires_lock() {
        let cond = Condvar::new();
        let mutex = UnfairMutex::new();
        let mut guard = mutex.guard();
        assert!(!cond.wait_timed(&mut guard, Duration::from_millis(10)));
        assert!(mutex.is_locked());
        assert_eq!(cond.waiter_count(), 0);
    }

    #[test]
    fn test_signal_wakes_spin_lock_waiter() {
        let cond = Arc::new(Condvar::new());
        let lock = Arc::new(SpinLock::new());
        let waiter = {
            let (cond, lock) = (cond.clone(), lock.clone());
            std::thread::spawn(move || {
                let mut guard = lock.guard();
                cond.wait_timed(&mut guard, Duration::from_secs(5))
            })
        };
        while cond.waiter_count() == 0 {
            std::thread::yield_now();
        }
        // Taking the lock proves the waiter released it.
        drop(lock.guard());
        assert_eq!(cond.signal(), 1);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_write_lock_view_works_with_wait() {
        let cond = Condvar::new();
        let rw = RwLock::new();
        let view = rw.write_lock();
        let mut guard = view.guard();
        assert!(!cond.wait_timed(&mut guard, Duration::from_millis(5)));
        assert!(rw.is_write_locked());
    }

    #[test]
    fn test_unbounded_timed_wait_is_signalled() {
        let cond = Arc::new(Condvar::new());
        let mutex = Arc::new(UnfairMutex::new());
        let waiter = {
            let (cond, mutex) = (cond.clone(), mutex.clone());
            std::thread::spawn(move || {
                let mut guard = mutex.guard();
                cond.wait_timed(&mut guard, Duration::MAX)
            })
        };
        while cond.waiter_count() == 0 {
            std::thread::yield_now();
        }
        drop(mutex.guard());
        assert_eq!(cond.signal(), 1);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_wait_after_termination_request_returns() {
        use crate::{Manager, ThreadStatus};
        use portable_atomic::{AtomicBool, Ordering};

        let manager = Manager::create().unwrap();
        let cond = Arc::new(Condvar::new());
        let mutex = Arc::new(UnfairMutex::new());
        let go = Arc::new(AtomicBool::new(false));
        let woke = Arc::new(AtomicBool::new(false));
        let thread = {
            let (cond, mutex) = (cond.clone(), mutex.clone());
            let (go, woke) = (go.clone(), woke.clone());
            manager
                .create_thread(move |_| {
                    while !go.load(Ordering::SeqCst) {
                        std::thread::yield_now();
                    }
                    let mut guard = mutex.guard();
                    cond.wait(&mut guard);
                    woke.store(true, Ordering::SeqCst);
                })
                .unwrap()
        };
        thread.resume().unwrap();

        thread.terminate(false).unwrap();
        go.store(true, Ordering::SeqCst);
        assert!(thread.join_timed(Duration::from_secs(2)).unwrap());
        assert_eq!(thread.status(), ThreadStatus::Terminated);
        assert!(!woke.load(Ordering::SeqCst));
        assert!(!mutex.is_locked());
        assert_eq!(cond.waiter_count(), 0);
        manager.delete();
    }
}
