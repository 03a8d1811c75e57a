//! Cooperative fibers with their own stacks.
//!
//! Resuming a fiber pushes it on the calling thread's fiber stack and
//! switches to it; yielding or finishing pops it and switches back to the
//! resumer. Fibers nest, so the innermost one is always the stack's top and
//! it is the only one `Running` on that thread.
//!
//! Termination is an unwind. A [`TerminationSignal`] raised inside a fiber
//! travels up its stack like a panic; the fiber's first frame catches it.
//! A fiber-scoped signal ends there. A thread-scoped one is handed to the
//! resumer, which raises it again on its own stack.
//!
//! A fiber belongs to the first OS thread that resumes it. Resuming or
//! terminating it from any other OS thread fails with
//! [`FiberError::ForeignThread`].

mod context;

use crate::arch::{fibers_supported, Arch, DefaultArch};
use crate::error::{FiberError, FiberResult};
use crate::group::ExecutiveGroup;
use crate::manager::ManagerInner;
use crate::mem::Stack;
use crate::plugin::{ExtensionSlots, PluginKey};
use crate::thread::local::{bound_thread, thread_key};
use crate::thread::{panic_message, Thread, ThreadInner};
use context::{fiber_trampoline, Registers};
use core::any::Any;
use core::cell::UnsafeCell;
use core::fmt;
use core::num::NonZeroU64;
use portable_atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Unique identifier for fibers. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(NonZeroU64);

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

impl FiberId {
    fn next() -> Self {
        let raw = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed);
        Self(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberStatus {
    Suspended = 0,
    Running = 1,
    Terminating = 2,
    Terminated = 3,
}

impl FiberStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => FiberStatus::Suspended,
            1 => FiberStatus::Running,
            2 => FiberStatus::Terminating,
            _ => FiberStatus::Terminated,
        }
    }
}

/// What a termination signal shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationScope {
    /// The fiber it is raised in.
    Fiber,
    /// The whole thread, every nested fiber included.
    Thread,
}

/// Unwind payload used for forced termination.
///
/// Code that has to use `catch_unwind` must hand this payload back to
/// `resume_unwind` untouched; swallowing it leaves the context half dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationSignal {
    scope: TerminationScope,
}

impl TerminationSignal {
    pub fn scope(&self) -> TerminationScope {
        self.scope
    }

    /// Start unwinding the current stack. The panic hook is not invoked.
    pub fn raise(scope: TerminationScope) -> ! {
        resume_unwind(Box::new(TerminationSignal { scope }))
    }

    /// The signal carried by an unwind payload, if it is one.
    pub fn from_payload(payload: &(dyn Any + Send)) -> Option<&TerminationSignal> {
        payload.downcast_ref::<TerminationSignal>()
    }

    pub fn is_termination(payload: &(dyn Any + Send)) -> bool {
        Self::from_payload(payload).is_some()
    }
}

type Entry = Box<dyn FnOnce(&Fiber) + Send>;

pub(crate) struct FiberInner {
    id: FiberId,
    manager: Arc<ManagerInner>,
    status: AtomicU8,
    regs: UnsafeCell<Registers>,
    stack: Stack,
    entry: spin::Mutex<Option<Entry>>,
    unhandled: spin::Mutex<Option<Box<dyn Any + Send>>>,
    group: spin::Mutex<ExecutiveGroup>,
    resumed_at: spin::Mutex<Option<Instant>>,
    host: spin::Mutex<Weak<ThreadInner>>,
    owner_key: AtomicU64,
    started: AtomicBool,
    on_stack: AtomicBool,
    slots: ExtensionSlots,
}

// `regs` is only touched by the owning OS thread, while switching.
unsafe impl Sync for FiberInner {}

impl Drop for FiberInner {
    fn drop(&mut self) {
        self.group.lock().leave();
        self.slots.clear();
    }
}

/// Shared handle to a fiber.
#[derive(Clone)]
pub struct Fiber {
    pub(crate) inner: Arc<FiberInner>,
}

impl Fiber {
    pub(crate) fn spawn(
        manager: &Arc<ManagerInner>,
        stack_size: usize,
        entry: Entry,
    ) -> FiberResult<Fiber> {
        if !fibers_supported() {
            return Err(FiberError::Unsupported);
        }
        if manager.is_terminating() {
            return Err(FiberError::ManagerTerminating);
        }

        let size = if stack_size == 0 {
            manager.config.default_stack_size
        } else {
            stack_size
        };
        let stack = Stack::new(
            manager.stack_allocator.clone(),
            manager.memory.clone(),
            size,
        )
        .ok_or(FiberError::OutOfMemory)?;
        let sp = unsafe { DefaultArch::init_stack(stack.top(), fiber_trampoline) };

        let group = manager.default_group.clone();
        group.enter();

        let fiber = Fiber {
            inner: Arc::new(FiberInner {
                id: FiberId::next(),
                manager: manager.clone(),
                status: AtomicU8::new(FiberStatus::Suspended as u8),
                regs: UnsafeCell::new(Registers { sp, caller_sp: 0 }),
                stack,
                entry: spin::Mutex::new(Some(entry)),
                unhandled: spin::Mutex::new(None),
                group: spin::Mutex::new(group),
                resumed_at: spin::Mutex::new(None),
                host: spin::Mutex::new(Weak::new()),
                owner_key: AtomicU64::new(0),
                started: AtomicBool::new(false),
                on_stack: AtomicBool::new(false),
                slots: ExtensionSlots::new(),
            }),
        };
        manager.register_fiber(&fiber);
        Ok(fiber)
    }

    pub fn id(&self) -> FiberId {
        self.inner.id
    }

    pub fn status(&self) -> FiberStatus {
        FiberStatus::from_u8(self.inner.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: FiberStatus) {
        self.inner.status.store(status as u8, Ordering::Release);
    }

    fn swap_status(&self, from: FiberStatus, to: FiberStatus) -> bool {
        self.inner
            .status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_terminated(&self) -> bool {
        self.status() == FiberStatus::Terminated
    }

    /// Whether the fiber has been resumed at least once.
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Usable bytes of the fiber's stack.
    pub fn stack_size(&self) -> usize {
        self.inner.stack.usable_size()
    }

    pub fn group(&self) -> ExecutiveGroup {
        self.inner.group.lock().clone()
    }

    pub(crate) fn set_group(&self, group: ExecutiveGroup) {
        let mut current = self.inner.group.lock();
        if current.same_as(&group) {
            return;
        }
        group.enter();
        current.leave();
        *current = group;
    }

    /// This fiber's value for a fiber plugin.
    pub fn plugin<T: Any + Send + Sync>(&self, key: &PluginKey<T>) -> Option<Arc<T>> {
        self.inner
            .manager
            .fiber_plugins
            .resolve(&self.inner.slots, key)
    }

    pub(crate) fn same_as(&self, other: &Fiber) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> Weak<FiberInner> {
        Arc::downgrade(&self.inner)
    }

    /// Run the terminate hooks of every fiber plugin (hazard purge).
    pub(crate) fn notify_terminate(&self) {
        self.inner
            .manager
            .fiber_plugins
            .notify_terminate(&self.inner.slots);
    }

    fn host(&self) -> Option<Thread> {
        self.inner
            .host
            .lock()
            .upgrade()
            .map(|inner| Thread { inner })
    }

    /// Whether this is the innermost fiber of the calling thread.
    pub fn is_current(&self) -> bool {
        bound_thread(self.inner.manager.id)
            .and_then(|thread| thread.current_fiber())
            .map_or(false, |top| top.same_as(self))
    }

    /// Pin the fiber to the calling OS thread on first use.
    fn claim_owner(&self) -> FiberResult<()> {
        let me = thread_key();
        match self
            .inner
            .owner_key
            .compare_exchange(0, me, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(owner) if owner == me => Ok(()),
            Err(_) => Err(FiberError::ForeignThread),
        }
    }

    /// The host thread, provided this fiber is the caller's innermost one.
    fn require_current(&self) -> FiberResult<Thread> {
        let owner = self.inner.owner_key.load(Ordering::Acquire);
        if owner != 0 && owner != thread_key() {
            return Err(FiberError::ForeignThread);
        }
        let host = bound_thread(self.inner.manager.id).ok_or(FiberError::NotCurrent)?;
        match host.current_fiber() {
            Some(top) if top.same_as(self) => Ok(host),
            _ => Err(FiberError::NotCurrent),
        }
    }

    fn elapsed(&self) -> core::time::Duration {
        self.inner
            .resumed_at
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    fn account_time(&self) {
        let elapsed = self.elapsed();
        self.group().account(elapsed);
    }

    /// Switch into the fiber until it yields or finishes.
    ///
    /// When the fiber ends with a thread termination or a panic, that unwind
    /// continues in the caller. When the caller is itself a fiber that was
    /// asked to terminate while this one ran, it starts unwinding here.
    ///
    /// # Errors
    ///
    /// [`FiberError::ForeignThread`] from a thread that does not own the
    /// fiber, [`FiberError::AlreadyRunning`] if it is on a fiber stack
    /// already, [`FiberError::Terminated`] once it has finished.
    pub fn resume(&self) -> FiberResult<()> {
        self.claim_owner()?;
        match self.status() {
            FiberStatus::Terminated => return Err(FiberError::Terminated),
            FiberStatus::Running => return Err(FiberError::AlreadyRunning),
            FiberStatus::Suspended | FiberStatus::Terminating => {}
        }
        if self.inner.on_stack.load(Ordering::Acquire) {
            return Err(FiberError::AlreadyRunning);
        }

        let host = self.inner.manager.current_thread();
        let parent = host.push_fiber(self.clone());
        if let Some(parent) = &parent {
            parent.swap_status(FiberStatus::Running, FiberStatus::Suspended);
        }
        self.inner.on_stack.store(true, Ordering::Release);
        *self.inner.host.lock() = host.downgrade();
        self.swap_status(FiberStatus::Suspended, FiberStatus::Running);
        *self.inner.resumed_at.lock() = Some(Instant::now());

        let arg = if self.inner.started.swap(true, Ordering::AcqRel) {
            0
        } else {
            Arc::into_raw(self.inner.clone()) as usize
        };
        unsafe {
            let regs = self.inner.regs.get();
            let to = (*regs).sp;
            DefaultArch::swap(&mut (*regs).caller_sp, to, arg);
        }

        // Back on the resumer's stack; the fiber popped itself.
        if let Some(parent) = &parent {
            parent.swap_status(FiberStatus::Suspended, FiberStatus::Running);
        }
        if self.is_terminated() {
            let unhandled = self.inner.unhandled.lock().take();
            if let Some(payload) = unhandled {
                resume_unwind(payload);
            }
        }
        if let Some(parent) = &parent {
            if parent.status() == FiberStatus::Terminating {
                TerminationSignal::raise(TerminationScope::Fiber);
            }
        }
        host.checkpoint();
        Ok(())
    }

    /// Suspend the calling fiber and switch back to its resumer.
    ///
    /// Unwinds instead of returning if the fiber or its thread is asked to
    /// terminate, either before the call or while suspended.
    pub fn yield_now(&self) -> FiberResult<()> {
        let host = self.require_current()?;
        if self.status() == FiberStatus::Terminating {
            TerminationSignal::raise(TerminationScope::Fiber);
        }
        self.account_time();
        host.pop_fiber(self);
        drop(host);
        self.inner.on_stack.store(false, Ordering::Release);
        self.set_status(FiberStatus::Suspended);

        unsafe {
            let regs = self.inner.regs.get();
            let to = (*regs).caller_sp;
            DefaultArch::swap(&mut (*regs).sp, to, 0);
        }

        self.poll_termination();
        Ok(())
    }

    /// Yield if the fiber has used up its group's budget since it was last
    /// resumed. Returns whether it yielded.
    pub fn yield_proc(&self) -> FiberResult<bool> {
        self.check_termination()?;
        let group = self.group();
        if group.over_budget(self.elapsed()) {
            self.yield_now()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Unwind if the fiber or its thread was asked to terminate; block while
    /// the thread is suspended.
    pub fn check_termination(&self) -> FiberResult<()> {
        self.require_current()?;
        self.poll_termination();
        Ok(())
    }

    fn poll_termination(&self) {
        if self.status() == FiberStatus::Terminating {
            TerminationSignal::raise(TerminationScope::Fiber);
        }
        if let Some(host) = self.host() {
            host.checkpoint();
        }
    }

    /// Terminate the fiber.
    ///
    /// A fiber that never ran is finished on the spot. The calling fiber
    /// unwinds immediately. A fiber nested below the caller unwinds once
    /// control comes back to it. A suspended fiber is resumed so that it
    /// unwinds now. Its hazards are purged first in every case.
    pub fn terminate(&self) -> FiberResult<()> {
        self.claim_owner()?;
        if self.is_terminated() {
            return Ok(());
        }
        if !self.is_started() {
            self.set_status(FiberStatus::Terminated);
            let entry = self.inner.entry.lock().take();
            drop(entry);
            log::debug!("fiber {} terminated before it ran", self.id().get());
            return Ok(());
        }

        self.set_status(FiberStatus::Terminating);
        self.notify_terminate();
        if self.is_current() {
            TerminationSignal::raise(TerminationScope::Fiber);
        }
        if self.inner.on_stack.load(Ordering::Acquire) {
            return Ok(());
        }
        self.resume()
    }

    /// Release this handle, terminating the fiber first if it is suspended
    /// mid-run.
    pub fn close(self) -> FiberResult<()> {
        if self.is_started() && !self.is_terminated() && !self.inner.on_stack.load(Ordering::Acquire)
        {
            self.terminate()?;
        }
        Ok(())
    }

    /// Body of the fiber's first frame. Never unwinds.
    fn run_to_end(&self) {
        let entry = self.inner.entry.lock().take();
        let outcome = match entry {
            Some(entry) if self.status() != FiberStatus::Terminating => {
                catch_unwind(AssertUnwindSafe(|| entry(self)))
            }
            _ => Ok(()),
        };
        if let Err(payload) = outcome {
            let absorbed = TerminationSignal::from_payload(payload.as_ref())
                .map_or(false, |signal| signal.scope() == TerminationScope::Fiber);
            if !absorbed {
                *self.inner.unhandled.lock() = Some(payload);
            }
        }

        // Hazards left over by an unwind are purged at the boundary.
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.notify_terminate())) {
            log::warn!(
                "fiber {} hazard handler panicked: {}",
                self.id().get(),
                panic_message(payload.as_ref())
            );
        }
        self.account_time();
        if let Some(host) = self.host() {
            host.pop_fiber(self);
        }
        self.inner.on_stack.store(false, Ordering::Release);
        self.set_status(FiberStatus::Terminated);
        log::debug!("fiber {} terminated", self.id().get());
    }
}

impl PartialEq for Fiber {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for Fiber {}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id())
            .field("status", &self.status())
            .field("stack_size", &self.stack_size())
            .finish()
    }
}
