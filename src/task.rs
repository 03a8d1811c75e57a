//! Fiber-backed tasks driven by a single scheduler thread.
//!
//! [`Task::execute`] queues the task's fiber. The scheduler thread, started
//! on first use, pops fibers in FIFO order and resumes each until it yields
//! or finishes; yielded fibers go to the back of the queue. It is a
//! cooperative pool of exactly one worker.

use crate::error::{FiberError, TaskError, TaskResult};
use crate::fiber::{Fiber, TerminationSignal};
use crate::manager::{Manager, ManagerInner};
use crate::sync::{Condvar, RawLock, UnfairMutex};
use crate::thread::{Thread, ThreadBuilder};
use core::cell::UnsafeCell;
use core::fmt;
use portable_atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::collections::VecDeque;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

type TaskBody = Arc<dyn Fn(&Fiber) + Send + Sync>;

struct TaskInner {
    manager: Weak<ManagerInner>,
    scheduler: TaskScheduler,
    body: TaskBody,
    restartable: bool,
    stack_size: usize,
    fiber: spin::Mutex<Fiber>,
    /// Non-zero from `execute` until the fiber finished.
    usage: AtomicUsize,
    runs: AtomicU64,
}

/// A unit of work run on the scheduler thread inside its own fiber.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

fn task_fiber(manager: &Arc<ManagerInner>, stack_size: usize, body: &TaskBody) -> TaskResult<Fiber> {
    let body = body.clone();
    let fiber = Fiber::spawn(manager, stack_size, Box::new(move |fiber: &Fiber| body(fiber)))?;
    Ok(fiber)
}

impl Task {
    pub(crate) fn new(
        manager: &Arc<ManagerInner>,
        scheduler: TaskScheduler,
        stack_size: usize,
        restartable: bool,
        body: TaskBody,
    ) -> TaskResult<Task> {
        let fiber = task_fiber(manager, stack_size, &body)?;
        Ok(Task {
            inner: Arc::new(TaskInner {
                manager: Arc::downgrade(manager),
                scheduler,
                body,
                restartable,
                stack_size,
                fiber: spin::Mutex::new(fiber),
                usage: AtomicUsize::new(0),
                runs: AtomicU64::new(0),
            }),
        })
    }

    /// The fiber backing the current (or last) run.
    pub fn fiber(&self) -> Fiber {
        self.inner.fiber.lock().clone()
    }

    pub fn is_restartable(&self) -> bool {
        self.inner.restartable
    }

    /// Whether the task is queued or running.
    pub fn is_pending(&self) -> bool {
        self.inner.usage.load(Ordering::Acquire) != 0
    }

    /// Completed runs.
    pub fn run_count(&self) -> u64 {
        self.inner.runs.load(Ordering::Relaxed)
    }

    /// Queue the task on the scheduler thread.
    ///
    /// A pending task is left alone. A finished task runs again on a fresh
    /// fiber if it is restartable.
    ///
    /// # Errors
    ///
    /// [`TaskError::Finished`] for a finished task that is not restartable,
    /// [`TaskError::QueueFull`] when the scheduler queue is at capacity.
    pub fn execute(&self) -> TaskResult<()> {
        if self
            .inner
            .usage
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        if let Err(e) = self.refresh_fiber() {
            self.inner.usage.store(0, Ordering::Release);
            return Err(e);
        }
        if let Err(e) = self.inner.scheduler.enqueue(self.clone()) {
            self.inner.usage.store(0, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    fn refresh_fiber(&self) -> TaskResult<()> {
        let mut fiber = self.inner.fiber.lock();
        if !fiber.is_terminated() {
            return Ok(());
        }
        if !self.inner.restartable {
            return Err(TaskError::Finished);
        }
        let manager = self
            .inner
            .manager
            .upgrade()
            .ok_or(TaskError::Fiber(FiberError::ManagerTerminating))?;
        *fiber = task_fiber(&manager, self.inner.stack_size, &self.inner.body)?;
        Ok(())
    }

    /// Block until the task is no longer pending, polling.
    pub fn wait_for_finish(&self) {
        while self.is_pending() {
            std::thread::yield_now();
        }
    }

    fn finish(&self) {
        self.inner.runs.fetch_add(1, Ordering::Relaxed);
        self.inner.usage.store(0, Ordering::Release);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("fiber", &self.fiber().id())
            .field("pending", &self.is_pending())
            .field("restartable", &self.inner.restartable)
            .finish()
    }
}

/// Queue contents, only touched with `SchedulerInner::lock` held.
struct Queue {
    items: VecDeque<Task>,
    running: Option<Task>,
    shutdown: bool,
}

struct SchedulerInner {
    manager: Weak<ManagerInner>,
    capacity: usize,
    lock: UnfairMutex,
    queue: UnsafeCell<Queue>,
    wake: Condvar,
    worker: spin::Mutex<Option<Thread>>,
    started: AtomicBool,
    executed: AtomicU64,
}

// `queue` is only accessed under `lock`.
unsafe impl Sync for SchedulerInner {}

/// Handle to a manager's task scheduler.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    pub(crate) fn new(manager: &Arc<ManagerInner>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                manager: Arc::downgrade(manager),
                capacity: manager.config.task_queue_capacity.max(1),
                lock: UnfairMutex::with_backend(manager.event_backend),
                queue: UnsafeCell::new(Queue {
                    items: VecDeque::new(),
                    running: None,
                    shutdown: false,
                }),
                wake: Condvar::with_backend(manager.event_backend),
                worker: spin::Mutex::new(None),
                started: AtomicBool::new(false),
                executed: AtomicU64::new(0),
            }),
        }
    }

    /// Run `f` on the queue with the scheduler lock held.
    fn with_queue<R>(&self, f: impl FnOnce(&mut Queue) -> R) -> R {
        let _guard = self.inner.lock.guard();
        f(unsafe { &mut *self.inner.queue.get() })
    }

    /// Tasks waiting in the queue, excluding the one running.
    pub fn queued(&self) -> usize {
        self.with_queue(|q| q.items.len())
    }

    /// Task runs completed so far.
    pub fn executed(&self) -> u64 {
        self.inner.executed.load(Ordering::Relaxed)
    }

    /// The scheduler thread, once started.
    pub fn worker(&self) -> Option<Thread> {
        self.inner.worker.lock().clone()
    }

    fn enqueue(&self, task: Task) -> TaskResult<()> {
        self.ensure_worker()?;
        let capacity = self.inner.capacity;
        self.with_queue(|q| {
            if q.shutdown {
                return Err(TaskError::Fiber(FiberError::ManagerTerminating));
            }
            if q.items.len() >= capacity {
                return Err(TaskError::QueueFull);
            }
            q.items.push_back(task);
            Ok(())
        })?;
        self.inner.wake.signal_count(1);
        Ok(())
    }

    fn ensure_worker(&self) -> TaskResult<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(manager) = self.inner.manager.upgrade() else {
            self.inner.started.store(false, Ordering::Release);
            return Err(TaskError::Fiber(FiberError::ManagerTerminating));
        };
        let scheduler = self.clone();
        let spawned = ThreadBuilder::new()
            .name("task-scheduler")
            .start_suspended(false)
            .spawn(&Manager::from_inner(manager), move |thread| scheduler.worker_main(thread));
        match spawned {
            Ok(thread) => {
                log::debug!("task scheduler started on thread {}", thread.id().get());
                *self.inner.worker.lock() = Some(thread);
                Ok(())
            }
            Err(e) => {
                self.inner.started.store(false, Ordering::Release);
                Err(e.into())
            }
        }
    }

    fn worker_main(&self, _thread: &Thread) {
        let outcome = catch_unwind(AssertUnwindSafe(|| self.drive()));
        // Fibers are pinned to this thread, so only it can finish them off.
        self.abandon_all();
        if let Err(payload) = outcome {
            resume_unwind(payload);
        }
    }

    fn drive(&self) {
        loop {
            let Some(task) = self.next_task() else {
                return;
            };
            let fiber = task.fiber();
            match catch_unwind(AssertUnwindSafe(|| fiber.resume())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("task fiber {} not resumable: {}", fiber.id().get(), e),
                Err(payload) => {
                    if TerminationSignal::is_termination(payload.as_ref()) {
                        resume_unwind(payload);
                    }
                    log::warn!("task fiber {} panicked", fiber.id().get());
                }
            }

            let finished = fiber.is_terminated() || !fiber.is_started();
            self.with_queue(|q| {
                q.running = None;
                if !finished {
                    q.items.push_back(task.clone());
                }
            });
            if finished {
                self.inner.executed.fetch_add(1, Ordering::Relaxed);
                task.finish();
            }
        }
    }

    /// Wait for the next task. `None` once the scheduler shuts down.
    fn next_task(&self) -> Option<Task> {
        let mut guard = self.inner.lock.guard();
        loop {
            let queue = unsafe { &mut *self.inner.queue.get() };
            if queue.shutdown {
                return None;
            }
            if let Some(task) = queue.items.pop_front() {
                queue.running = Some(task.clone());
                return Some(task);
            }
            self.inner.wake.wait(&mut guard);
        }
    }

    /// Terminate every queued fiber once the worker stops.
    fn abandon_all(&self) {
        let abandoned: Vec<Task> = self.with_queue(|q| {
            q.shutdown = true;
            q.running.take().into_iter().chain(q.items.drain(..)).collect()
        });
        for task in abandoned {
            let fiber = task.fiber();
            // Resuming a fiber on a terminating thread raises again; ignore it.
            let _ = catch_unwind(AssertUnwindSafe(|| fiber.terminate()));
            task.inner.usage.store(0, Ordering::Release);
        }
    }

    /// Stop the worker and terminate whatever it still had queued.
    pub(crate) fn shutdown(&self) {
        self.with_queue(|q| q.shutdown = true);
        self.inner.wake.signal();
        let worker = self.inner.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.terminate(true) {
                log::warn!("task scheduler did not stop cleanly: {}", e);
            }
        }
        self.abandon_all();
    }
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("queued", &self.queued())
            .field("executed", &self.executed())
            .finish()
    }
}

#[cfg(all(test, unix, any(target_arch = "x86_64", target_arch = "aarch64")))]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;

    #[test]
    fn test_finished_task_rejects_execute() {
        let manager = Manager::create().unwrap();
        let task = manager.create_task(0, false, |_| {}).unwrap();
        task.execute().unwrap();
        task.wait_for_finish();
        assert!(task.fiber().is_terminated());
        assert!(matches!(task.execute(), Err(TaskError::Finished)));
        manager.delete();
    }

    #[test]
    fn test_restartable_task_runs_again() {
        let manager = Manager::create().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let task = {
            let hits = hits.clone();
            manager
                .create_task(0, true, move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
        };
        for _ in 0..3 {
            task.execute().unwrap();
            task.wait_for_finish();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(task.run_count(), 3);
        manager.delete();
    }

    #[test]
    fn test_yielding_tasks_interleave() {
        let manager = Manager::create().unwrap();
        let trace = Arc::new(spin::Mutex::new(Vec::new()));
        let tasks: Vec<Task> = (0..2)
            .map(|n| {
                let trace = trace.clone();
                manager
                    .create_task(0, false, move |fiber| {
                        for step in 0..2 {
                            trace.lock().push((n, step));
                            fiber.yield_now().unwrap();
                        }
                    })
                    .unwrap()
            })
            .collect();

        for task in &tasks {
            task.execute().unwrap();
        }
        for task in &tasks {
            task.wait_for_finish();
        }
        let trace = trace.lock().clone();
        assert_eq!(trace.len(), 4);
        for n in 0..2 {
            let steps: Vec<_> = trace.iter().filter(|(t, _)| *t == n).map(|(_, s)| *s).collect();
            assert_eq!(steps, vec![0, 1]);
        }
        manager.delete();
    }

    #[test]
    fn test_queue_capacity_is_enforced() {
        let config = ManagerConfig {
            task_queue_capacity: 1,
            ..ManagerConfig::default()
        };
        let manager = Manager::with_config(config).unwrap();
        let release = Arc::new(AtomicBool::new(false));
        let blocker = {
            let release = release.clone();
            manager
                .create_task(0, false, move |_| {
                    while !release.load(Ordering::SeqCst) {
                        std::thread::yield_now();
                    }
                })
                .unwrap()
        };
        blocker.execute().unwrap();
        // Wait until the worker picked the blocker up, leaving the queue empty.
        let scheduler = manager.task_scheduler().unwrap();
        while scheduler.queued() != 0 {
            std::thread::yield_now();
        }

        let a = manager.create_task(0, false, |_| {}).unwrap();
        let b = manager.create_task(0, false, |_| {}).unwrap();
        a.execute().unwrap();
        assert!(matches!(b.execute(), Err(TaskError::QueueFull)));
        assert!(!b.is_pending());

        release.store(true, Ordering::SeqCst);
        blocker.wait_for_finish();
        a.wait_for_finish();
        manager.delete();
    }
}
