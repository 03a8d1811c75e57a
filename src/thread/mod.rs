//! Runtime view of OS threads.
//!
//! A [`Thread`] is a shared handle. Owned threads are spawned by a manager
//! through [`ThreadBuilder`]; remote threads are descriptors created on demand
//! for OS threads the runtime did not spawn, and they reject lifecycle
//! requests with [`ThreadError::RemoteThread`].
//!
//! Every thread keeps its fiber stack: the fibers currently nested on it,
//! innermost last.

pub mod builder;
pub mod local;

pub use builder::ThreadBuilder;

use crate::error::{ThreadError, ThreadResult};
use crate::event::{Event, EventBackend};
use crate::fiber::{Fiber, TerminationScope, TerminationSignal};
use crate::plugin::{ExtensionSlots, PluginKey, PluginRegistry};
use core::any::Any;
use core::fmt;
use core::num::NonZeroU64;
use core::time::Duration;
use portable_atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Unique identifier for threads. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(NonZeroU64);

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

impl ThreadId {
    fn next() -> Self {
        let raw = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

/// Thread lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadStatus {
    Suspended = 0,
    Running = 1,
    Terminating = 2,
    Terminated = 3,
}

impl ThreadStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ThreadStatus::Suspended,
            1 => ThreadStatus::Running,
            2 => ThreadStatus::Terminating,
            _ => ThreadStatus::Terminated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    /// Spawned by a manager.
    Owned,
    /// An OS thread the runtime found running code that called into it.
    Remote,
}

/// Observer of owned thread lifetimes, registered on a manager.
pub trait ThreadActivity: Send + Sync {
    /// Called on the new thread before its entry point runs.
    fn on_start(&self, _thread: &Thread) {}
    /// Called on the thread after its entry point returned or unwound.
    fn on_exit(&self, _thread: &Thread) {}
}

type Cleanup = Box<dyn FnOnce() + Send>;

pub(crate) struct ThreadInner {
    id: ThreadId,
    kind: ThreadKind,
    name: Option<String>,
    manager_id: u64,
    os_key: AtomicU64,
    status: AtomicU8,
    cancelling: AtomicBool,
    panicked: AtomicBool,
    /// Closed while the thread is suspended.
    gate: Event,
    /// Closed until the thread has terminated.
    done: Event,
    fibers: spin::Mutex<Vec<Fiber>>,
    slots: ExtensionSlots,
    plugins: Arc<PluginRegistry>,
    cleanups: spin::Mutex<Vec<Cleanup>>,
    os_handle: spin::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Drop for ThreadInner {
    fn drop(&mut self) {
        let cleanups = core::mem::take(&mut *self.cleanups.lock());
        for cleanup in cleanups.into_iter().rev() {
            cleanup();
        }
        self.slots.clear();
    }
}

/// Shared handle to a runtime thread.
#[derive(Clone)]
pub struct Thread {
    pub(crate) inner: Arc<ThreadInner>,
}

impl Thread {
    pub(crate) fn new(
        kind: ThreadKind,
        name: Option<String>,
        manager_id: u64,
        backend: EventBackend,
        plugins: Arc<PluginRegistry>,
    ) -> Self {
        let (status, os_key) = match kind {
            ThreadKind::Owned => (ThreadStatus::Suspended, 0),
            ThreadKind::Remote => (ThreadStatus::Running, local::thread_key()),
        };
        Self {
            inner: Arc::new(ThreadInner {
                id: ThreadId::next(),
                kind,
                name,
                manager_id,
                os_key: AtomicU64::new(os_key),
                status: AtomicU8::new(status as u8),
                cancelling: AtomicBool::new(false),
                panicked: AtomicBool::new(false),
                gate: Event::with_backend(backend, kind == ThreadKind::Owned),
                done: Event::with_backend(backend, true),
                fibers: spin::Mutex::new(Vec::new()),
                slots: ExtensionSlots::new(),
                plugins,
                cleanups: spin::Mutex::new(Vec::new()),
                os_handle: spin::Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.inner.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn kind(&self) -> ThreadKind {
        self.inner.kind
    }

    pub fn is_remote(&self) -> bool {
        self.inner.kind == ThreadKind::Remote
    }

    pub fn status(&self) -> ThreadStatus {
        ThreadStatus::from_u8(self.inner.status.load(Ordering::Acquire))
    }

    pub fn is_terminating(&self) -> bool {
        self.status() == ThreadStatus::Terminating
    }

    pub(crate) fn manager_id(&self) -> u64 {
        self.inner.manager_id
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<ThreadInner> {
        Arc::downgrade(&self.inner)
    }

    /// Whether the calling OS thread is this thread.
    pub fn is_current(&self) -> bool {
        self.inner.os_key.load(Ordering::Acquire) == local::thread_key()
    }

    /// Number of live handles to this thread.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Release this handle. The descriptor goes away with the last one.
    pub fn close(self) {}

    /// Raise the non-fatal cancellation flag (or lower it again).
    pub fn set_cancelling(&self, cancelling: bool) {
        self.inner.cancelling.store(cancelling, Ordering::Release);
    }

    pub fn is_cancelling(&self) -> bool {
        self.inner.cancelling.load(Ordering::Acquire)
    }

    /// Run `cleanup` once, after the OS thread exited and the last handle
    /// dropped. Callbacks run in reverse registration order.
    pub fn register_cleanup(&self, cleanup: impl FnOnce() + Send + 'static) {
        self.inner.cleanups.lock().push(Box::new(cleanup));
    }

    /// This thread's value for a thread plugin.
    pub fn plugin<T: Any + Send + Sync>(&self, key: &PluginKey<T>) -> Option<Arc<T>> {
        self.inner.plugins.resolve(&self.inner.slots, key)
    }

    /// The innermost fiber running on this thread.
    pub fn current_fiber(&self) -> Option<Fiber> {
        self.inner.fibers.lock().last().cloned()
    }

    /// How many fibers are nested on this thread right now.
    pub fn fiber_depth(&self) -> usize {
        self.inner.fibers.lock().len()
    }

    /// Push `fiber` and return the fiber it nests in.
    pub(crate) fn push_fiber(&self, fiber: Fiber) -> Option<Fiber> {
        let mut fibers = self.inner.fibers.lock();
        let parent = fibers.last().cloned();
        fibers.push(fiber);
        parent
    }

    /// Pop the innermost fiber if it is `fiber`.
    pub(crate) fn pop_fiber(&self, fiber: &Fiber) -> bool {
        let popped = {
            let mut fibers = self.inner.fibers.lock();
            match fibers.last() {
                Some(top) if top.same_as(fiber) => fibers.pop(),
                _ => None,
            }
        };
        popped.is_some()
    }

    /// Resume a suspended thread. A freshly spawned thread starts here.
    pub fn resume(&self) -> ThreadResult<()> {
        self.owned()?;
        let resumed = self
            .inner
            .status
            .compare_exchange(
                ThreadStatus::Suspended as u8,
                ThreadStatus::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if resumed {
            self.inner.gate.set(false);
        }
        Ok(())
    }

    /// Suspend the thread.
    ///
    /// Suspending the calling thread blocks until someone resumes it. Any
    /// other thread stops at its next checkpoint.
    pub fn suspend(&self) -> ThreadResult<()> {
        self.owned()?;
        let suspended = self
            .inner
            .status
            .compare_exchange(
                ThreadStatus::Running as u8,
                ThreadStatus::Suspended as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        match self.status() {
            ThreadStatus::Terminating | ThreadStatus::Terminated => Err(ThreadError::Terminated),
            _ => {
                if suspended {
                    self.inner.gate.set(true);
                    if self.is_current() {
                        self.checkpoint();
                    }
                }
                Ok(())
            }
        }
    }

    /// Cooperative checkpoint for the calling thread: block while suspended
    /// and unwind if termination was requested.
    ///
    /// Does nothing when called for a thread other than the caller.
    pub fn checkpoint(&self) {
        if !self.is_current() {
            return;
        }
        if self.status() == ThreadStatus::Suspended && self.inner.kind == ThreadKind::Owned {
            self.inner.gate.wait();
        }
        if self.is_terminating() {
            TerminationSignal::raise(TerminationScope::Thread);
        }
    }

    /// Request termination.
    ///
    /// On the calling thread this unwinds immediately. Otherwise the hazards
    /// of every fiber nested on the target (innermost first) and of the
    /// thread itself are purged, so blocked waits return, and the target
    /// unwinds at its next checkpoint. With `wait` set, block until it is
    /// gone.
    pub fn terminate(&self, wait: bool) -> ThreadResult<()> {
        self.owned()?;
        if self.is_current() {
            self.inner
                .status
                .store(ThreadStatus::Terminating as u8, Ordering::Release);
            TerminationSignal::raise(TerminationScope::Thread);
        }

        let requested = self.request_termination();
        if requested {
            log::debug!("termination requested for thread {}", self.id().get());
            self.purge_hazards();
        }
        if wait {
            match self.join() {
                Ok(()) | Err(ThreadError::Panicked) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Mark the thread terminating and open its gate. `false` if it was
    /// already terminating or gone.
    fn request_termination(&self) -> bool {
        let mut current = self.inner.status.load(Ordering::Acquire);
        loop {
            match ThreadStatus::from_u8(current) {
                ThreadStatus::Terminating | ThreadStatus::Terminated => return false,
                _ => {}
            }
            match self.inner.status.compare_exchange_weak(
                current,
                ThreadStatus::Terminating as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.inner.gate.set(false);
        true
    }

    fn purge_hazards(&self) {
        let nested: Vec<Fiber> = self.inner.fibers.lock().iter().rev().cloned().collect();
        for fiber in &nested {
            fiber.notify_terminate();
        }
        self.inner.plugins.notify_terminate(&self.inner.slots);
    }

    /// Wait for the thread to finish.
    pub fn join(&self) -> ThreadResult<()> {
        self.owned()?;
        if self.is_current() {
            return Err(ThreadError::JoinSelf);
        }
        self.inner.done.wait();
        self.reap()
    }

    /// Like [`join`](Self::join) with a timeout. `Ok(false)` on timeout.
    pub fn join_timed(&self, timeout: Duration) -> ThreadResult<bool> {
        self.owned()?;
        if self.is_current() {
            return Err(ThreadError::JoinSelf);
        }
        if !self.inner.done.wait_timed(timeout) {
            return Ok(false);
        }
        self.reap().map(|()| true)
    }

    fn reap(&self) -> ThreadResult<()> {
        let handle = self.inner.os_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        if self.inner.panicked.load(Ordering::Acquire) {
            Err(ThreadError::Panicked)
        } else {
            Ok(())
        }
    }

    fn owned(&self) -> ThreadResult<()> {
        match self.inner.kind {
            ThreadKind::Owned => Ok(()),
            ThreadKind::Remote => Err(ThreadError::RemoteThread),
        }
    }

    pub(crate) fn same_as(&self, other: &Thread) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Body of an owned OS thread, from the start gate to the final status.
    pub(crate) fn run_owned(
        &self,
        entry: Box<dyn FnOnce(&Thread) + Send>,
        activities: &[Arc<dyn ThreadActivity>],
    ) {
        self.inner
            .os_key
            .store(local::thread_key(), Ordering::Release);
        self.inner.gate.wait();

        if !self.is_terminating() {
            log::debug!("thread {} started", self.id().get());
            for activity in activities {
                activity.on_start(self);
            }
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| entry(self)));
            if let Err(payload) = outcome {
                self.absorb(payload);
            }
            for activity in activities {
                activity.on_exit(self);
            }
        }

        self.inner.plugins.notify_terminate(&self.inner.slots);
        self.inner.fibers.lock().clear();
        self.inner
            .status
            .store(ThreadStatus::Terminated as u8, Ordering::Release);
        log::debug!("thread {} exited", self.id().get());
        self.inner.done.set(false);
    }

    fn absorb(&self, payload: Box<dyn Any + Send>) {
        if TerminationSignal::is_termination(payload.as_ref()) {
            return;
        }
        log::warn!(
            "thread {} entry point panicked: {}",
            self.id().get(),
            panic_message(payload.as_ref())
        );
        self.inner.panicked.store(true, Ordering::Release);
    }

    pub(crate) fn set_os_handle(&self, handle: std::thread::JoinHandle<()>) {
        *self.inner.os_handle.lock() = Some(handle);
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string payload"
    }
}

impl PartialEq for Thread {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for Thread {}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("kind", &self.kind())
            .field("status", &self.status())
            .finish()
    }
}
