//! First-come, first-served read/write lock.
//!
//! Waiters queue in arrival order, each with its own event. Releasing the
//! lock hands it to the front of the queue directly: either one writer or
//! the whole run of readers at the front. Nobody can barge past a queued
//! waiter, which is what makes the order strict.

use super::spinlock::SpinCell;
use super::RawRwLock;
use crate::event::{Event, EventBackend};
use core::time::Duration;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

struct Waiter {
    id: u64,
    access: Access,
    event: Arc<Event>,
}

#[derive(Default)]
struct FairState {
    readers: usize,
    writer: bool,
    queue: VecDeque<Waiter>,
    next_id: u64,
}

impl FairState {
    fn can_grant(&self, access: Access) -> bool {
        match access {
            Access::Read => !self.writer,
            Access::Write => !self.writer && self.readers == 0,
        }
    }

    fn grant(&mut self, access: Access) {
        match access {
            Access::Read => self.readers += 1,
            Access::Write => self.writer = true,
        }
    }

    /// Hand the lock to the front waiters that can take it now.
    fn grant_waiting(&mut self) {
        while let Some(front) = self.queue.front() {
            if !self.can_grant(front.access) {
                break;
            }
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };
            self.grant(waiter.access);
            waiter.event.set(false);
            if waiter.access == Access::Write {
                break;
            }
        }
    }
}

pub struct FairRwLock {
    backend: EventBackend,
    state: SpinCell<FairState>,
}

impl FairRwLock {
    pub fn new() -> Self {
        Self::with_backend(EventBackend::detect())
    }

    pub fn with_backend(backend: EventBackend) -> Self {
        Self {
            backend,
            state: SpinCell::new(FairState::default()),
        }
    }

    /// Advisory number of queued waiters.
    pub fn queued(&self) -> usize {
        self.state.with(|s| s.queue.len())
    }

    fn try_enter(&self, access: Access) -> bool {
        self.state.with(|s| {
            if s.queue.is_empty() && s.can_grant(access) {
                s.grant(access);
                true
            } else {
                false
            }
        })
    }

    fn enter(&self, access: Access, timeout: Option<Duration>) -> bool {
        let ticket = self.state.with(|s| {
            if s.queue.is_empty() && s.can_grant(access) {
                s.grant(access);
                return None;
            }
            let event = Arc::new(Event::with_backend(self.backend, true));
            let id = s.next_id;
            s.next_id += 1;
            s.queue.push_back(Waiter {
                id,
                access,
                event: event.clone(),
            });
            Some((id, event))
        });

        let Some((id, event)) = ticket else {
            return true;
        };

        let Some(timeout) = timeout else {
            event.wait();
            return true;
        };
        if event.wait_timed(timeout) {
            return true;
        }

        // Timed out, unless a release granted us in the meantime.
        self.state.with(|s| match s.queue.iter().position(|w| w.id == id) {
            Some(pos) => {
                s.queue.remove(pos);
                s.grant_waiting();
                false
            }
            None => true,
        })
    }
}

impl Default for FairRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RawRwLock for FairRwLock {
    fn enter_read(&self) {
        self.enter(Access::Read, None);
    }

    fn try_enter_read(&self) -> bool {
        self.try_enter(Access::Read)
    }

    fn try_timed_enter_read(&self, timeout: Duration) -> bool {
        self.enter(Access::Read, Some(timeout))
    }

    fn leave_read(&self) {
        self.state.with(|s| {
            debug_assert!(s.readers > 0, "leaving an unread FairRwLock");
            s.readers -= 1;
            s.grant_waiting();
        });
    }

    fn enter_write(&self) {
        self.enter(Access::Write, None);
    }

    fn try_enter_write(&self) -> bool {
        self.try_enter(Access::Write)
    }

    fn try_timed_enter_write(&self, timeout: Duration) -> bool {
        self.enter(Access::Write, Some(timeout))
    }

    fn leave_write(&self) {
        self.state.with(|s| {
            debug_assert!(s.writer, "leaving an unwritten FairRwLock");
            s.writer = false;
            s.grant_waiting();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn wait_for_queue(lock: &FairRwLock, len: usize) {
        while lock.queued() < len {
            std::thread::yield_now();
        }
    }

    #[test]
    fn test_reader_queues_behind_writer_waiter() {
        let lock = Arc::new(FairRwLock::new());
        lock.enter_read();

        let writer = {
            let lock = lock.clone();
            std::thread::spawn(move || {
                lock.enter_write();
                lock.leave_write();
            })
        };
        wait_for_queue(&lock, 1);

        // A queued writer blocks new readers even though only readers hold it.
        assert!(!lock.try_enter_read());
        lock.leave_read();
        writer.join().unwrap();
        assert!(lock.try_enter_read());
        lock.leave_read();
    }

    #[test]
    fn test_timed_out_waiter_leaves_queue() {
        let lock = FairRwLock::new();
        lock.enter_write();
        assert!(!lock.try_timed_enter_read(Duration::from_millis(10)));
        assert_eq!(lock.queued(), 0);
        lock.leave_write();
        assert!(lock.try_enter_write());
        lock.leave_write();
    }

    #[test]
    fn test_grants_follow_arrival_order() {
        let lock = Arc::new(FairRwLock::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        lock.enter_write();

        let mut handles = Vec::new();
        for n in 0..3 {
            let (shared, order) = (lock.clone(), order.clone());
            handles.push(std::thread::spawn(move || {
                shared.enter_write();
                order.lock().unwrap().push(n);
                shared.leave_write();
            }));
            wait_for_queue(&lock, n + 1);
        }

        lock.leave_write();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_unbounded_timed_enters() {
        let lock = Arc::new(FairRwLock::new());
        assert!(lock.try_timed_enter_write(Duration::MAX));
        let reader = {
            let lock = lock.clone();
            std::thread::spawn(move || {
                let got = lock.try_timed_enter_read(Duration::MAX);
                lock.leave_read();
                got
            })
        };
        wait_for_queue(&lock, 1);
        lock.leave_write();
        assert!(reader.join().unwrap());
        assert_eq!(lock.queued(), 0);
    }
}
