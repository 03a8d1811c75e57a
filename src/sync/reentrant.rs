//! Recursive read/write locks.
//!
//! Ownership is tracked by an owner id plus a recursion depth. The write
//! owner may also enter the read side; other readers are counted as usual.
//! Entering the write side while holding only the read side deadlocks.

use super::spinlock::SpinCell;
use super::{acquire_with, RawRwLock};
use crate::event::{Event, EventBackend};
use crate::thread::local::thread_key;
use core::cell::Cell;
use core::time::Duration;
use portable_atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
struct RecursiveState {
    readers: usize,
    owner: Option<u64>,
    depth: u32,
    owner_reads: u32,
}

/// State machine shared by both reentrant locks.
struct RecursiveCore {
    state: SpinCell<RecursiveState>,
    read_event: Event,
    write_event: Event,
}

impl RecursiveCore {
    fn new(backend: EventBackend) -> Self {
        Self {
            state: SpinCell::new(RecursiveState::default()),
            read_event: Event::with_backend(backend, false),
            write_event: Event::with_backend(backend, false),
        }
    }

    fn publish(&self, s: &RecursiveState) {
        self.read_event.set(s.owner.is_some());
        self.write_event.set(s.owner.is_some() || s.readers > 0);
    }

    fn try_write(&self, id: u64) -> bool {
        self.state.with(|s| match s.owner {
            Some(owner) if owner == id => {
                s.depth += 1;
                true
            }
            None if s.readers == 0 => {
                s.owner = Some(id);
                s.depth = 1;
                self.publish(s);
                true
            }
            _ => false,
        })
    }

    fn write(&self, id: u64, timeout: Option<Duration>) -> bool {
        acquire_with(&self.write_event, timeout, || self.try_write(id))
    }

    fn leave_write(&self, id: u64) {
        self.state.with(|s| {
            debug_assert_eq!(s.owner, Some(id), "leaving a write lock held elsewhere");
            s.depth -= 1;
            if s.depth == 0 {
                s.owner = None;
                // Reads taken under the write lock outlive it as plain reads.
                s.readers += s.owner_reads as usize;
                s.owner_reads = 0;
                self.publish(s);
            }
        });
    }

    fn try_read(&self, id: u64) -> bool {
        self.state.with(|s| match s.owner {
            Some(owner) if owner == id => {
                s.owner_reads += 1;
                true
            }
            Some(_) => false,
            None => {
                s.readers += 1;
                self.publish(s);
                true
            }
        })
    }

    fn read(&self, id: u64, timeout: Option<Duration>) -> bool {
        acquire_with(&self.read_event, timeout, || self.try_read(id))
    }

    fn leave_read(&self, id: u64) {
        self.state.with(|s| {
            if s.owner == Some(id) && s.owner_reads > 0 {
                s.owner_reads -= 1;
            } else {
                debug_assert!(s.readers > 0, "leaving an unread reentrant lock");
                s.readers -= 1;
                self.publish(s);
            }
        });
    }

    fn write_depth(&self, id: u64) -> u32 {
        self.state.with(|s| if s.owner == Some(id) { s.depth } else { 0 })
    }
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one logical owner of a [`ReentrantRwLock`].
///
/// A context is neither `Send` nor `Sync`; it belongs to the code path that
/// created it and tracks how deep that path currently holds its locks.
#[derive(Debug)]
pub struct ReentrantContext {
    id: u64,
    write_depth: Cell<u32>,
    read_depth: Cell<u32>,
}

impl ReentrantContext {
    pub fn new() -> Self {
        Self {
            // Context ids live in the upper half so they never match a thread key.
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed) | (1 << 63),
            write_depth: Cell::new(0),
            read_depth: Cell::new(0),
        }
    }

    /// Write recursion depth held through this context.
    pub fn write_depth(&self) -> u32 {
        self.write_depth.get()
    }

    /// Read entries held through this context.
    pub fn read_depth(&self) -> u32 {
        self.read_depth.get()
    }
}

impl Default for ReentrantContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Recursive read/write lock keyed by an explicit [`ReentrantContext`].
pub struct ReentrantRwLock {
    core: RecursiveCore,
}

impl ReentrantRwLock {
    pub fn new() -> Self {
        Self::with_backend(EventBackend::detect())
    }

    pub fn with_backend(backend: EventBackend) -> Self {
        Self {
            core: RecursiveCore::new(backend),
        }
    }

    pub fn enter_write(&self, ctx: &ReentrantContext) {
        self.core.write(ctx.id, None);
        ctx.write_depth.set(ctx.write_depth.get() + 1);
    }

    pub fn try_enter_write(&self, ctx: &ReentrantContext) -> bool {
        let entered = self.core.try_write(ctx.id);
        if entered {
            ctx.write_depth.set(ctx.write_depth.get() + 1);
        }
        entered
    }

    pub fn try_timed_enter_write(&self, ctx: &ReentrantContext, timeout: Duration) -> bool {
        let entered = self.core.write(ctx.id, Some(timeout));
        if entered {
            ctx.write_depth.set(ctx.write_depth.get() + 1);
        }
        entered
    }

    pub fn leave_write(&self, ctx: &ReentrantContext) {
        self.core.leave_write(ctx.id);
        ctx.write_depth.set(ctx.write_depth.get().saturating_sub(1));
    }

    pub fn enter_read(&self, ctx: &ReentrantContext) {
        self.core.read(ctx.id, None);
        ctx.read_depth.set(ctx.read_depth.get() + 1);
    }

    pub fn try_enter_read(&self, ctx: &ReentrantContext) -> bool {
        let entered = self.core.try_read(ctx.id);
        if entered {
            ctx.read_depth.set(ctx.read_depth.get() + 1);
        }
        entered
    }

    pub fn try_timed_enter_read(&self, ctx: &ReentrantContext, timeout: Duration) -> bool {
        let entered = self.core.read(ctx.id, Some(timeout));
        if entered {
            ctx.read_depth.set(ctx.read_depth.get() + 1);
        }
        entered
    }

    pub fn leave_read(&self, ctx: &ReentrantContext) {
        self.core.leave_read(ctx.id);
        ctx.read_depth.set(ctx.read_depth.get().saturating_sub(1));
    }
}

impl Default for ReentrantRwLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Recursive read/write lock keyed by the calling OS thread.
pub struct ThreadReentrantRwLock {
    core: RecursiveCore,
}

impl ThreadReentrantRwLock {
    pub fn new() -> Self {
        Self::with_backend(EventBackend::detect())
    }

    pub fn with_backend(backend: EventBackend) -> Self {
        Self {
            core: RecursiveCore::new(backend),
        }
    }

    /// How many times the calling thread holds the write side.
    pub fn write_depth(&self) -> u32 {
        self.core.write_depth(thread_key())
    }
}

impl Default for ThreadReentrantRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RawRwLock for ThreadReentrantRwLock {
    fn enter_read(&self) {
        self.core.read(thread_key(), None);
    }

    fn try_enter_read(&self) -> bool {
        self.core.try_read(thread_key())
    }

    fn try_timed_enter_read(&self, timeout: Duration) -> bool {
        self.core.read(thread_key(), Some(timeout))
    }

    fn leave_read(&self) {
        self.core.leave_read(thread_key());
    }

    fn enter_write(&self) {
        self.core.write(thread_key(), None);
    }

    fn try_enter_write(&self) -> bool {
        self.core.try_write(thread_key())
    }

    fn try_timed_enter_write(&self, timeout: Duration) -> bool {
        self.core.write(thread_key(), Some(timeout))
    }

    fn leave_write(&self) {
        self.core.leave_write(thread_key());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_context_depth_tracks_recursion() {
        let lock = ReentrantRwLock::new();
        let ctx = ReentrantContext::new();
        lock.enter_write(&ctx);
        lock.enter_write(&ctx);
        lock.enter_read(&ctx);
        assert_eq!(ctx.write_depth(), 2);
        assert_eq!(ctx.read_depth(), 1);

        let other = ReentrantContext::new();
        assert!(!lock.try_enter_read(&other));
        assert!(!lock.try_enter_write(&other));

        lock.leave_read(&ctx);
        lock.leave_write(&ctx);
        lock.leave_write(&ctx);
        assert!(lock.try_enter_write(&other));
        lock.leave_write(&other);
    }

    #[test]
    fn test_read_under_write_survives_release() {
        let lock = ReentrantRwLock::new();
        let ctx = ReentrantContext::new();
        let other = ReentrantContext::new();
        lock.enter_write(&ctx);
        lock.enter_read(&ctx);
        lock.leave_write(&ctx);

        assert!(lock.try_enter_read(&other));
        assert!(!lock.try_enter_write(&other));
        lock.leave_read(&other);
        lock.leave_read(&ctx);
        assert!(lock.try_enter_write(&other));
        lock.leave_write(&other);
    }

    #[test]
    fn test_thread_keyed_recursion() {
        let lock = Arc::new(ThreadReentrantRwLock::new());
        lock.enter_write();
        lock.enter_write();
        assert_eq!(lock.write_depth(), 2);

        let contender = {
            let lock = lock.clone();
            std::thread::spawn(move || lock.try_timed_enter_write(Duration::from_millis(10)))
        };
        assert!(!contender.join().unwrap());

        lock.leave_write();
        lock.leave_write();
        assert_eq!(lock.write_depth(), 0);
    }

    #[test]
    fn test_unbounded_timed_enters() {
        let lock = ReentrantRwLock::new();
        let ctx = ReentrantContext::new();
        assert!(lock.try_timed_enter_write(&ctx, Duration::MAX));
        assert!(lock.try_timed_enter_read(&ctx, Duration::MAX));
        lock.leave_read(&ctx);
        lock.leave_write(&ctx);

        let shared = Arc::new(ThreadReentrantRwLock::new());
        shared.enter_read();
        let writer = {
            let shared = shared.clone();
            std::thread::spawn(move || {
                let got = shared.try_timed_enter_write(Duration::MAX);
                shared.leave_write();
                got
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        shared.leave_read();
        assert!(writer.join().unwrap());
    }
}
