//! The manager: root object that owns every runtime service.
//!
//! A [`Manager`] picks the event backend, hands out threads, fibers, groups
//! and synchronization primitives, keeps the plugin registries and tracks
//! everything it created so that [`Manager::delete`] can shut it all down.

use crate::config::ManagerConfig;
use crate::error::{FiberError, FiberResult, ManagerError, ManagerResult, TaskResult, ThreadResult};
use crate::event::{Event, EventBackend};
use crate::fiber::{Fiber, FiberInner, FiberStatus};
use crate::group::{ExecutiveGroup, GroupInner};
use crate::hazard::{HazardEntry, HazardId, HazardPlugins, HazardScope, HazardStack};
use crate::mem::{default_stack_allocator, MemoryCounters, Placed, StackAllocator};
use crate::plugin::{ExtensionSlots, PluginKey, PluginRegistry};
use crate::stats::Statistics;
use crate::sync::{
    Barrier, Condvar, FairRwLock, ReentrantContext, ReentrantRwLock, RwLock, Semaphore, SpinLock,
    ThreadReentrantRwLock, UnfairMutex,
};
use crate::task::{Task, TaskScheduler};
use crate::thread::{local, Thread, ThreadActivity, ThreadBuilder, ThreadInner, ThreadKind};
use core::any::Any;
use core::fmt;
use core::mem::MaybeUninit;
use portable_atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct ManagerInner {
    pub(crate) id: u64,
    pub(crate) config: ManagerConfig,
    pub(crate) event_backend: EventBackend,
    pub(crate) stack_allocator: Arc<dyn StackAllocator>,
    pub(crate) memory: Arc<MemoryCounters>,
    pub(crate) thread_plugins: Arc<PluginRegistry>,
    pub(crate) fiber_plugins: Arc<PluginRegistry>,
    manager_plugins: PluginRegistry,
    manager_slots: ExtensionSlots,
    pub(crate) hazards: HazardPlugins,
    pub(crate) default_group: ExecutiveGroup,
    terminating: AtomicBool,
    threads: spin::Mutex<Vec<Weak<ThreadInner>>>,
    fibers: spin::Mutex<Vec<Weak<FiberInner>>>,
    groups: spin::Mutex<Vec<Weak<GroupInner>>>,
    activities: spin::RwLock<Vec<Arc<dyn ThreadActivity>>>,
    scheduler: spin::Mutex<Option<TaskScheduler>>,
    tasks_executed: AtomicU64,
}

impl ManagerInner {
    pub(crate) fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    pub(crate) fn activities(&self) -> Vec<Arc<dyn ThreadActivity>> {
        self.activities.read().clone()
    }

    pub(crate) fn register_thread(&self, thread: &Thread) {
        let mut threads = self.threads.lock();
        threads.retain(|weak| weak.strong_count() > 0);
        threads.push(thread.downgrade());
    }

    pub(crate) fn register_fiber(&self, fiber: &Fiber) {
        let mut fibers = self.fibers.lock();
        fibers.retain(|weak| weak.strong_count() > 0);
        fibers.push(fiber.downgrade());
    }

    fn register_group(&self, group: &ExecutiveGroup) {
        let mut groups = self.groups.lock();
        groups.retain(|weak| weak.strong_count() > 0);
        groups.push(Arc::downgrade(&group.inner));
    }

    /// The calling OS thread's descriptor, created as a remote thread the
    /// first time this manager sees it.
    pub(crate) fn current_thread(self: &Arc<Self>) -> Thread {
        if let Some(thread) = local::bound_thread(self.id) {
            return thread;
        }
        let thread = Thread::new(
            ThreadKind::Remote,
            std::thread::current().name().map(String::from),
            self.id,
            self.event_backend,
            self.thread_plugins.clone(),
        );
        local::bind(self, thread.clone());
        self.register_thread(&thread);
        log::trace!(
            "adopted OS thread as remote thread {} of manager {}",
            thread.id().get(),
            self.id
        );
        thread
    }

    /// Hazard stack of the innermost fiber on `thread`, or of the thread.
    fn context_hazards(&self, thread: &Thread) -> Arc<HazardStack> {
        let stack = match thread.current_fiber() {
            Some(fiber) => fiber.plugin(&self.hazards.fiber),
            None => thread.plugin(&self.hazards.thread),
        };
        // The hazard keys are private to the manager and never unregistered.
        stack.unwrap_or_default()
    }

    fn live_threads(&self) -> Vec<Thread> {
        self.threads
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .map(|inner| Thread { inner })
            .collect()
    }

    fn live_fibers(&self) -> Vec<Fiber> {
        self.fibers
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .map(|inner| Fiber { inner })
            .collect()
    }
}

/// Hazard stack of the current context for the most recently bound manager.
pub(crate) fn current_hazard_stack() -> Option<Arc<HazardStack>> {
    let (manager, thread) = local::bindings().into_iter().next()?;
    Some(manager.context_hazards(&thread))
}

/// Whether a context the calling OS thread runs has been asked to terminate.
pub(crate) fn termination_pending() -> bool {
    local::bindings().into_iter().any(|(_, thread)| {
        thread.is_terminating()
            || thread
                .current_fiber()
                .map_or(false, |fiber| fiber.status() == FiberStatus::Terminating)
    })
}

/// Checkpoint every context the calling OS thread has with any manager.
///
/// Does nothing while the thread is already unwinding.
pub(crate) fn checkpoint_current() {
    if std::thread::panicking() {
        return;
    }
    for (_, thread) in local::bindings() {
        match thread.current_fiber() {
            Some(fiber) => {
                let _ = fiber.check_termination();
            }
            None => thread.checkpoint(),
        }
    }
}

/// Handle to a runtime manager.
///
/// Handles are cheap to clone. The runtime lives until [`Manager::delete`]
/// is called and the last object created from it is gone.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Manager {
    /// Create a manager with the default configuration.
    pub fn create() -> ManagerResult<Manager> {
        Self::with_config(ManagerConfig::default())
    }

    /// Create a manager.
    ///
    /// # Errors
    ///
    /// [`ManagerError::EventUnavailable`] when `config` forces an event
    /// backend this platform does not have.
    pub fn with_config(config: ManagerConfig) -> ManagerResult<Manager> {
        let event_backend = match config.event_backend {
            Some(backend) if !backend.is_available() => {
                return Err(ManagerError::EventUnavailable);
            }
            Some(backend) => backend,
            None => EventBackend::detect(),
        };
        let stack_allocator = config
            .stack_allocator
            .clone()
            .unwrap_or_else(default_stack_allocator);

        let thread_plugins = Arc::new(PluginRegistry::new());
        let fiber_plugins = Arc::new(PluginRegistry::new());
        let hazards = HazardPlugins::register(&thread_plugins, &fiber_plugins);
        let default_group = ExecutiveGroup::new(config.default_group_budget);

        let inner = Arc::new(ManagerInner {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            config,
            event_backend,
            stack_allocator,
            memory: Arc::new(MemoryCounters::new()),
            thread_plugins,
            fiber_plugins,
            manager_plugins: PluginRegistry::new(),
            manager_slots: ExtensionSlots::new(),
            hazards,
            default_group: default_group.clone(),
            terminating: AtomicBool::new(false),
            threads: spin::Mutex::new(Vec::new()),
            fibers: spin::Mutex::new(Vec::new()),
            groups: spin::Mutex::new(Vec::new()),
            activities: spin::RwLock::new(Vec::new()),
            scheduler: spin::Mutex::new(None),
            tasks_executed: AtomicU64::new(0),
        });
        inner.register_group(&default_group);
        log::debug!(
            "manager {} created with {:?} events",
            inner.id,
            inner.event_backend
        );
        Ok(Manager { inner })
    }

    pub(crate) fn from_inner(inner: Arc<ManagerInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<ManagerInner> {
        &self.inner
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn event_backend(&self) -> EventBackend {
        self.inner.event_backend
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Shut the runtime down.
    ///
    /// Stops the task scheduler, terminates the fibers this OS thread can
    /// terminate, then terminates every owned thread and waits for it. Fibers
    /// pinned to other OS threads are left to finish on their own.
    pub fn delete(self) {
        log::debug!("deleting manager {}", self.inner.id);
        let scheduler = self.inner.scheduler.lock().take();
        if let Some(scheduler) = scheduler {
            let executed = scheduler.executed();
            scheduler.shutdown();
            self.inner.tasks_executed.fetch_add(executed, Ordering::Relaxed);
        }
        self.purge_active_runtimes();
        self.inner.groups.lock().clear();
        self.mark_as_terminating();
        self.purge_active_threads();
        drop(local::unbind(self.inner.id));
    }

    /// Refuse to create threads, fibers and tasks from now on.
    pub fn mark_as_terminating(&self) {
        if !self.inner.terminating.swap(true, Ordering::AcqRel) {
            log::debug!("manager {} is terminating", self.inner.id);
        }
    }

    pub fn is_terminating(&self) -> bool {
        self.inner.is_terminating()
    }

    /// Terminate every live owned thread other than the caller and wait for
    /// each one.
    pub fn purge_active_threads(&self) {
        for thread in self.inner.live_threads() {
            if thread.is_remote() || thread.is_current() {
                continue;
            }
            if let Err(e) = thread.terminate(true) {
                log::warn!("thread {} did not terminate: {}", thread.id().get(), e);
            }
        }
    }

    /// Terminate every unfinished fiber the calling OS thread may terminate.
    pub fn purge_active_runtimes(&self) {
        for fiber in self.inner.live_fibers() {
            if fiber.is_terminated() || fiber.is_current() {
                continue;
            }
            match fiber.terminate() {
                Ok(()) => {}
                Err(FiberError::ForeignThread) => log::warn!(
                    "fiber {} belongs to another OS thread and is left running",
                    fiber.id().get()
                ),
                Err(e) => log::warn!("fiber {} did not terminate: {}", fiber.id().get(), e),
            }
        }
    }

    /// The calling OS thread's descriptor.
    pub fn current_thread(&self) -> Thread {
        self.inner.current_thread()
    }

    /// The innermost fiber running on the calling OS thread.
    pub fn current_fiber(&self) -> Option<Fiber> {
        local::bound_thread(self.inner.id).and_then(|thread| thread.current_fiber())
    }

    pub fn thread_builder(&self) -> ThreadBuilder {
        ThreadBuilder::new()
    }

    /// Spawn a suspended owned thread. Call [`Thread::resume`] to start it.
    pub fn create_thread<F>(&self, entry: F) -> ThreadResult<Thread>
    where
        F: FnOnce(&Thread) + Send + 'static,
    {
        ThreadBuilder::new().spawn(self, entry)
    }

    /// Create a suspended fiber. A `stack_size` of 0 uses the configured
    /// default.
    pub fn create_fiber<F>(&self, stack_size: usize, entry: F) -> FiberResult<Fiber>
    where
        F: FnOnce(&Fiber) + Send + 'static,
    {
        Fiber::spawn(&self.inner, stack_size, Box::new(entry))
    }

    /// A new executive group with the configured budget.
    pub fn create_group(&self) -> ExecutiveGroup {
        let group = ExecutiveGroup::new(self.inner.config.default_group_budget);
        self.inner.register_group(&group);
        group
    }

    /// The group every new fiber starts in.
    pub fn default_group(&self) -> ExecutiveGroup {
        self.inner.default_group.clone()
    }

    /// Push a handler on the current context's hazard stack.
    pub fn push_hazard(&self, entry: HazardEntry) -> HazardId {
        let thread = self.inner.current_thread();
        self.inner.context_hazards(&thread).push(entry)
    }

    /// Pop the top handler of the current context, running it if `execute`.
    pub fn pop_hazard(&self, execute: bool) -> bool {
        let thread = self.inner.current_thread();
        self.inner.context_hazards(&thread).pop(execute)
    }

    /// Push a handler that is popped again when the returned scope drops.
    pub fn hazard_scope(&self, entry: HazardEntry) -> HazardScope {
        let thread = self.inner.current_thread();
        HazardScope::push(self.inner.context_hazards(&thread), entry)
    }

    /// Hazard stack of the current context.
    pub fn current_hazards(&self) -> Arc<HazardStack> {
        let thread = self.inner.current_thread();
        self.inner.context_hazards(&thread)
    }

    /// Observe start and exit of threads spawned from now on.
    pub fn register_thread_activity(&self, activity: Arc<dyn ThreadActivity>) {
        self.inner.activities.write().push(activity);
    }

    pub fn register_thread_plugin<T, F>(&self, construct: F) -> PluginKey<T>
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.inner.thread_plugins.register(construct)
    }

    pub fn unregister_thread_plugin<T>(&self, key: PluginKey<T>) -> bool {
        self.inner.thread_plugins.unregister(key)
    }

    pub fn register_fiber_plugin<T, F>(&self, construct: F) -> PluginKey<T>
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.inner.fiber_plugins.register(construct)
    }

    pub fn unregister_fiber_plugin<T>(&self, key: PluginKey<T>) -> bool {
        self.inner.fiber_plugins.unregister(key)
    }

    pub fn register_manager_plugin<T, F>(&self, construct: F) -> PluginKey<T>
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.inner.manager_plugins.register(construct)
    }

    pub fn unregister_manager_plugin<T>(&self, key: PluginKey<T>) -> bool {
        self.inner.manager_plugins.unregister(key)
    }

    /// The manager's own value for a manager plugin.
    pub fn manager_plugin<T: Any + Send + Sync>(&self, key: &PluginKey<T>) -> Option<Arc<T>> {
        self.inner
            .manager_plugins
            .resolve(&self.inner.manager_slots, key)
    }

    /// The task scheduler, created on first use.
    pub fn task_scheduler(&self) -> ManagerResult<TaskScheduler> {
        if self.is_terminating() {
            return Err(ManagerError::Terminating);
        }
        let mut scheduler = self.inner.scheduler.lock();
        Ok(scheduler
            .get_or_insert_with(|| TaskScheduler::new(&self.inner))
            .clone())
    }

    /// Create a task running `body` on the scheduler thread.
    ///
    /// A restartable task may be executed again after it finished; each run
    /// gets a fresh fiber.
    pub fn create_task<F>(&self, stack_size: usize, restartable: bool, body: F) -> TaskResult<Task>
    where
        F: Fn(&Fiber) + Send + Sync + 'static,
    {
        let scheduler = self
            .task_scheduler()
            .map_err(|_| FiberError::ManagerTerminating)?;
        Task::new(&self.inner, scheduler, stack_size, restartable, Arc::new(body))
    }

    pub fn collect_statistics(&self) -> Statistics {
        let threads = self.inner.live_threads();
        let remote_threads = threads.iter().filter(|t| t.is_remote()).count();
        let owned_threads = threads
            .iter()
            .filter(|t| !t.is_remote() && t.status() != crate::thread::ThreadStatus::Terminated)
            .count();
        let fibers = self
            .inner
            .live_fibers()
            .iter()
            .filter(|f| !f.is_terminated())
            .count();
        let groups = self
            .inner
            .groups
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count();
        let scheduled = self
            .inner
            .scheduler
            .lock()
            .as_ref()
            .map_or(0, TaskScheduler::executed);

        Statistics {
            threads: owned_threads,
            remote_threads,
            fibers,
            groups,
            reserved_stack_bytes: self.inner.memory.reserved_bytes(),
            live_stacks: self.inner.memory.live_stacks(),
            thread_plugins: self.inner.thread_plugins.len(),
            fiber_plugins: self.inner.fiber_plugins.len(),
            manager_plugins: self.inner.manager_plugins.len(),
            tasks_executed: self.inner.tasks_executed.load(Ordering::Relaxed) + scheduled,
        }
    }
}

/// `create_*` boxes a primitive wired to the manager's event backend;
/// `place_*` builds the same primitive in caller memory.
macro_rules! primitive_factories {
    ($($create:ident, $place:ident => $ty:ty = |$m:ident $(, $arg:ident: $arg_ty:ty)*| $make:expr;)*) => {
        impl Manager {
            $(
                pub fn $create(&self $(, $arg: $arg_ty)*) -> Box<$ty> {
                    let $m = &self.inner;
                    Box::new($make)
                }

                pub fn $place<'a>(&self, slot: &'a mut MaybeUninit<$ty> $(, $arg: $arg_ty)*) -> Placed<'a, $ty> {
                    let $m = &self.inner;
                    Placed::new(slot, $make)
                }
            )*
        }
    };
}

primitive_factories! {
    create_event, place_event => Event = |m, should_wait: bool| Event::with_backend(m.event_backend, should_wait);
    create_unfair_mutex, place_unfair_mutex => UnfairMutex = |m| UnfairMutex::with_backend(m.event_backend);
    create_spin_lock, place_spin_lock => SpinLock = |_m| SpinLock::new();
    create_semaphore, place_semaphore => Semaphore = |m, initial: u32| Semaphore::with_backend(initial, m.event_backend);
    create_rwlock, place_rwlock => RwLock = |m| RwLock::with_backend(m.event_backend);
    create_fair_rwlock, place_fair_rwlock => FairRwLock = |m| FairRwLock::with_backend(m.event_backend);
    create_reentrant_rwlock, place_reentrant_rwlock => ReentrantRwLock = |m| ReentrantRwLock::with_backend(m.event_backend);
    create_thread_reentrant_rwlock, place_thread_reentrant_rwlock => ThreadReentrantRwLock = |m| ThreadReentrantRwLock::with_backend(m.event_backend);
    create_reentrant_context, place_reentrant_context => ReentrantContext = |_m| ReentrantContext::new();
    create_condvar, place_condvar => Condvar = |m| Condvar::with_backend(m.event_backend);
    create_barrier, place_barrier => Barrier = |m, count: usize| Barrier::with_backend(count, m.event_backend);
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("id", &self.inner.id)
            .field("event_backend", &self.inner.event_backend)
            .field("terminating", &self.is_terminating())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::RawLock;
    use portable_atomic::AtomicUsize;

    #[test]
    fn test_forced_backend_must_exist() {
        let config = ManagerConfig {
            event_backend: Some(EventBackend::Parker),
            ..ManagerConfig::default()
        };
        let manager = Manager::with_config(config).unwrap();
        assert_eq!(manager.event_backend(), EventBackend::Parker);
        manager.delete();

        #[cfg(not(target_os = "linux"))]
        {
            let config = ManagerConfig {
                event_backend: Some(EventBackend::Futex),
                ..ManagerConfig::default()
            };
            assert_eq!(
                Manager::with_config(config).unwrap_err(),
                ManagerError::EventUnavailable
            );
        }
    }

    #[test]
    fn test_terminating_manager_refuses_new_objects() {
        let manager = Manager::create().unwrap();
        manager.mark_as_terminating();
        assert!(manager.is_terminating());
        assert!(matches!(
            manager.create_thread(|_| {}),
            Err(crate::ThreadError::ManagerTerminating)
        ));
        assert!(manager.task_scheduler().is_err());
        manager.delete();
    }

    #[test]
    fn test_current_thread_is_remote_and_stable() {
        let manager = Manager::create().unwrap();
        let first = manager.current_thread();
        assert!(first.is_remote());
        assert_eq!(first, manager.current_thread());
        assert!(manager.current_fiber().is_none());
        assert_eq!(manager.collect_statistics().remote_threads, 1);
        manager.delete();
    }

    #[test]
    fn test_manager_plugin_is_built_once() {
        let manager = Manager::create().unwrap();
        let built = Arc::new(AtomicUsize::new(0));
        let key = {
            let built = built.clone();
            manager.register_manager_plugin(move || built.fetch_add(1, Ordering::SeqCst))
        };
        assert_eq!(*manager.manager_plugin(&key).unwrap(), 0);
        assert_eq!(*manager.manager_plugin(&key).unwrap(), 0);
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert!(manager.unregister_manager_plugin(key));
        assert!(manager.manager_plugin(&key).is_none());
        manager.delete();
    }

    #[test]
    fn test_placed_primitives_use_caller_memory() {
        let manager = Manager::create().unwrap();
        let mut slot = MaybeUninit::uninit();
        let mutex = manager.place_unfair_mutex(&mut slot);
        mutex.lock();
        assert!(mutex.is_locked());
        mutex.unlock();

        let semaphore = manager.create_semaphore(2);
        assert!(semaphore.try_decrement());
        assert_eq!(semaphore.value(), 1);
        manager.delete();
    }

    #[test]
    fn test_hazards_follow_the_current_context() {
        let manager = Manager::create().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = hits.clone();
            manager.push_hazard(HazardEntry::owned(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(manager.current_hazards().len(), 1);
        assert!(manager.pop_hazard(true));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!manager.pop_hazard(true));
        manager.delete();
    }

    #[test]
    fn test_statistics_track_groups_and_threads() {
        let manager = Manager::create().unwrap();
        let group = manager.create_group();
        let thread = manager.create_thread(|_| {}).unwrap();
        let stats = manager.collect_statistics();
        assert_eq!(stats.groups, 2);
        assert_eq!(stats.threads, 1);
        assert_eq!(stats.thread_plugins, 1);
        assert_eq!(stats.fiber_plugins, 1);
        thread.resume().unwrap();
        thread.join().unwrap();
        group.close();
        assert_eq!(manager.collect_statistics().groups, 1);
        manager.delete();
    }

    #[test]
    fn test_thread_plugin_is_per_thread() {
        let manager = Manager::create().unwrap();
        let key = manager.register_thread_plugin(|| AtomicUsize::new(0));

        let here = manager.current_thread();
        let mine = here.plugin(&key).unwrap();
        mine.fetch_add(1, Ordering::SeqCst);
        assert!(Arc::ptr_eq(&mine, &here.plugin(&key).unwrap()));

        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        let thread = {
            let seen = seen.clone();
            manager
                .create_thread(move |me| {
                    let value = me.plugin(&key).unwrap();
                    seen.store(value.load(Ordering::SeqCst), Ordering::SeqCst);
                })
                .unwrap()
        };
        thread.resume().unwrap();
        thread.join().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert_eq!(mine.load(Ordering::SeqCst), 1);
        manager.delete();
    }

    #[test]
    #[cfg(all(unix, any(target_arch = "x86_64", target_arch = "aarch64")))]
    fn test_fiber_plugin_is_per_fiber() {
        let manager = Manager::create().unwrap();
        let key = manager.register_fiber_plugin(|| AtomicUsize::new(0));

        let first = manager
            .create_fiber(0, move |fiber| {
                fiber.plugin(&key).unwrap().fetch_add(5, Ordering::SeqCst);
            })
            .unwrap();
        let second = manager.create_fiber(0, |_| {}).unwrap();
        first.resume().unwrap();

        assert_eq!(first.plugin(&key).unwrap().load(Ordering::SeqCst), 5);
        assert_eq!(second.plugin(&key).unwrap().load(Ordering::SeqCst), 0);
        assert!(manager.unregister_fiber_plugin(key));
        assert!(first.plugin(&key).is_none());
        second.resume().unwrap();
        manager.delete();
    }
}
