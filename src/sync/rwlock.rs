//! Read/write lock without ordering guarantees.

use super::spinlock::SpinCell;
use super::{acquire_with, RawRwLock};
use crate::event::{Event, EventBackend};
use core::time::Duration;

#[derive(Debug, Default)]
struct RwState {
    readers: usize,
    writer: bool,
}

/// Many readers or one writer. Writers may starve under steady reads.
pub struct RwLock {
    state: SpinCell<RwState>,
    /// Closed while a writer holds the lock.
    read_event: Event,
    /// Closed while a writer or any reader holds the lock.
    write_event: Event,
}

impl RwLock {
    pub fn new() -> Self {
        Self::with_backend(EventBackend::detect())
    }

    pub fn with_backend(backend: EventBackend) -> Self {
        Self {
            state: SpinCell::new(RwState::default()),
            read_event: Event::with_backend(backend, false),
            write_event: Event::with_backend(backend, false),
        }
    }

    /// Advisory reader count.
    pub fn readers(&self) -> usize {
        self.state.with(|s| s.readers)
    }

    /// Advisory: whether a writer holds the lock.
    pub fn is_write_locked(&self) -> bool {
        self.state.with(|s| s.writer)
    }

    fn publish(&self, s: &RwState) {
        self.read_event.set(s.writer);
        self.write_event.set(s.writer || s.readers > 0);
    }

    fn acquire_read(&self) -> bool {
        self.state.with(|s| {
            if s.writer {
                return false;
            }
            s.readers += 1;
            self.publish(s);
            true
        })
    }

    fn acquire_write(&self) -> bool {
        self.state.with(|s| {
            if s.writer || s.readers > 0 {
                return false;
            }
            s.writer = true;
            self.publish(s);
            true
        })
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RawRwLock for RwLock {
    fn enter_read(&self) {
        acquire_with(&self.read_event, None, || self.acquire_read());
    }

    fn try_enter_read(&self) -> bool {
        self.acquire_read()
    }

    fn try_timed_enter_read(&self, timeout: Duration) -> bool {
        acquire_with(&self.read_event, Some(timeout), || self.acquire_read())
    }

    fn leave_read(&self) {
        self.state.with(|s| {
            debug_assert!(s.readers > 0, "leaving an unread RwLock");
            s.readers -= 1;
            self.publish(s);
        });
    }

    fn enter_write(&self) {
        acquire_with(&self.write_event, None, || self.acquire_write());
    }

    fn try_enter_write(&self) -> bool {
        self.acquire_write()
    }

    fn try_timed_enter_write(&self, timeout: Duration) -> bool {
        acquire_with(&self.write_event, Some(timeout), || self.acquire_write())
    }

    fn leave_write(&self) {
        self.state.with(|s| {
            debug_assert!(s.writer, "leaving an unwritten RwLock");
            s.writer = false;
            self.publish(s);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_readers_share() {
        let lock = RwLock::new();
        let _a = lock.read();
        let _b = lock.read();
        assert_eq!(lock.readers(), 2);
        assert!(!lock.try_enter_write());
    }

    #[test]
    fn test_writer_excludes_readers() {
        let lock = Arc::new(RwLock::new());
        lock.enter_write();
        let reader = {
            let lock = lock.clone();
            std::thread::spawn(move || lock.try_timed_enter_read(Duration::from_millis(20)))
        };
        assert!(!reader.join().unwrap());
        lock.leave_write();
        assert!(lock.try_enter_read());
        lock.leave_read();
    }

    #[test]
    fn test_writer_waits_for_last_reader() {
        let lock = Arc::new(RwLock::new());
        lock.enter_read();
        let writer = {
            let lock = lock.clone();
            std::thread::spawn(move || {
                let _guard = lock.write();
                lock.is_write_locked()
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!lock.is_write_locked());
        lock.leave_read();
        assert!(writer.join().unwrap());
    }

    #[test]
    fn test_unbounded_timed_enters() {
        let lock = Arc::new(RwLock::new());
        assert!(lock.try_timed_enter_read(Duration::MAX));
        let writer = {
            let lock = lock.clone();
            std::thread::spawn(move || {
                let got = lock.try_timed_enter_write(Duration::MAX);
                lock.leave_write();
                got
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        lock.leave_read();
        assert!(writer.join().unwrap());
        assert!(!lock.is_write_locked());
    }
}
