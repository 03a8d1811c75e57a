//! Smoke tests to verify basic functionality

#![cfg(all(unix, any(target_arch = "x86_64", target_arch = "aarch64")))]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fiber_executive::{
    Fiber, FiberStatus, HazardEntry, Manager, Thread, ThreadActivity, ThreadStatus,
};

fn wait_until(flag: &AtomicBool) {
    while !flag.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Five tasks each bump a shared counter once
#[test]
fn test_task_scheduler_runs_every_task() {
    let manager = Manager::create().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let counter = counter.clone();
            manager
                .create_task(0, false, move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
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

    assert_eq!(counter.load(Ordering::SeqCst), 5);
    for task in &tasks {
        assert_eq!(task.fiber().status(), FiberStatus::Terminated);
    }
    assert_eq!(manager.collect_statistics().tasks_executed, 5);
    manager.delete();
}

/// A thread blocked on an event is released by its hazard and terminates
#[test]
fn test_forced_termination_runs_hazard_once() {
    let manager = Manager::create().unwrap();
    let hazard_runs = Arc::new(AtomicUsize::new(0));
    let ready = Arc::new(AtomicBool::new(false));
    let reached_end = Arc::new(AtomicBool::new(false));

    let thread = {
        let manager = manager.clone();
        let hazard_runs = hazard_runs.clone();
        let ready = ready.clone();
        let reached_end = reached_end.clone();
        manager
            .clone()
            .create_thread(move |_| {
                let gate = Arc::new(manager.create_event(true));
                {
                    let gate = gate.clone();
                    manager.push_hazard(HazardEntry::owned(move || {
                        hazard_runs.fetch_add(1, Ordering::SeqCst);
                        gate.set(false);
                    }));
                }
                ready.store(true, Ordering::SeqCst);
                gate.wait();
                fiber_executive::checkpoint();
                reached_end.store(true, Ordering::SeqCst);
            })
            .unwrap()
    };
    thread.resume().unwrap();
    wait_until(&ready);

    thread.terminate(true).unwrap();
    assert_eq!(thread.status(), ThreadStatus::Terminated);
    assert_eq!(hazard_runs.load(Ordering::SeqCst), 1);
    assert!(!reached_end.load(Ordering::SeqCst));
    manager.delete();
}

/// Terminating a thread unwinds the fiber it is blocked in as well
#[test]
fn test_thread_termination_reaches_nested_fiber() {
    let manager = Manager::create().unwrap();
    let ready = Arc::new(AtomicBool::new(false));
    let nested: Arc<Mutex<Option<Fiber>>> = Arc::new(Mutex::new(None));

    let thread = {
        let manager = manager.clone();
        let ready = ready.clone();
        let nested = nested.clone();
        manager
            .clone()
            .create_thread(move |_| {
                let inner_manager = manager.clone();
                let fiber = manager
                    .create_fiber(0, move |_| {
                        let gate = Arc::new(inner_manager.create_event(true));
                        let _scope = {
                            let gate = gate.clone();
                            inner_manager.hazard_scope(HazardEntry::owned(move || gate.set(false)))
                        };
                        ready.store(true, Ordering::SeqCst);
                        gate.wait();
                        fiber_executive::checkpoint();
                    })
                    .unwrap();
                *nested.lock().unwrap() = Some(fiber.clone());
                let _ = fiber.resume();
            })
            .unwrap()
    };
    thread.resume().unwrap();
    wait_until(&ready);

    thread.terminate(true).unwrap();
    let fiber = nested.lock().unwrap().take().unwrap();
    assert_eq!(fiber.status(), FiberStatus::Terminated);
    assert_eq!(thread.status(), ThreadStatus::Terminated);
    manager.delete();
}

/// Nested fibers push and pop on the thread's fiber stack in order
#[test]
fn test_nested_fibers_keep_stack_discipline() {
    let manager = Manager::create().unwrap();
    let depths = Arc::new(Mutex::new(Vec::new()));

    let outer = {
        let manager = manager.clone();
        let depths = depths.clone();
        manager.clone().create_fiber(0, move |outer| {
            let record = |depths: &Mutex<Vec<usize>>, manager: &Manager| {
                depths
                    .lock()
                    .unwrap()
                    .push(manager.current_thread().fiber_depth());
            };
            let inner = {
                let manager = manager.clone();
                let depths = depths.clone();
                manager.clone().create_fiber(0, move |inner| {
                    assert_eq!(manager.current_fiber().as_ref(), Some(inner));
                    record(&depths, &manager);
                    inner.yield_now().unwrap();
                    record(&depths, &manager);
                })
            }
            .unwrap();

            inner.resume().unwrap();
            assert_eq!(manager.current_fiber().as_ref(), Some(outer));
            record(&depths, &manager);
            outer.yield_now().unwrap();
            inner.resume().unwrap();
            assert!(inner.is_terminated());
            record(&depths, &manager);
        })
    }
    .unwrap();

    outer.resume().unwrap();
    assert_eq!(manager.current_thread().fiber_depth(), 0);
    assert!(manager.current_fiber().is_none());
    outer.resume().unwrap();
    assert!(outer.is_terminated());
    assert_eq!(*depths.lock().unwrap(), vec![2, 1, 2, 1]);
    manager.delete();
}

/// Hazards run last-in first-out when a context purges them
#[test]
fn test_hazard_stack_is_lifo() {
    let manager = Manager::create().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    for tag in 1..=3 {
        let order = order.clone();
        manager.push_hazard(HazardEntry::owned(move || order.lock().unwrap().push(tag)));
    }
    assert_eq!(manager.current_hazards().purge(), 3);
    assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
    manager.delete();
}

#[derive(Default)]
struct Lifetimes {
    started: AtomicUsize,
    exited: AtomicUsize,
}

impl ThreadActivity for Lifetimes {
    fn on_start(&self, thread: &Thread) {
        assert!(thread.is_current());
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_exit(&self, _thread: &Thread) {
        self.exited.fetch_add(1, Ordering::SeqCst);
    }
}

/// Thread activities see every owned thread start and exit
#[test]
fn test_thread_activity_observes_lifetimes() {
    let manager = Manager::create().unwrap();
    let lifetimes = Arc::new(Lifetimes::default());
    manager.register_thread_activity(lifetimes.clone());

    let threads: Vec<_> = (0..3)
        .map(|_| manager.create_thread(|_| {}).unwrap())
        .collect();
    for thread in &threads {
        thread.resume().unwrap();
    }
    for thread in &threads {
        thread.join().unwrap();
    }

    assert_eq!(lifetimes.started.load(Ordering::SeqCst), 3);
    assert_eq!(lifetimes.exited.load(Ordering::SeqCst), 3);
    manager.delete();
}

/// Deleting a manager terminates its suspended threads and fibers
#[test]
fn test_delete_cleans_up_everything() {
    let manager = Manager::create().unwrap();
    let ran = Arc::new(AtomicBool::new(false));
    let thread = {
        let ran = ran.clone();
        manager
            .create_thread(move |_| ran.store(true, Ordering::SeqCst))
            .unwrap()
    };
    let fiber = manager
        .create_fiber(0, |fiber| loop {
            fiber.yield_now().unwrap();
        })
        .unwrap();
    fiber.resume().unwrap();

    manager.clone().delete();
    assert!(manager.is_terminating());
    assert!(fiber.is_terminated());
    assert_eq!(thread.status(), ThreadStatus::Terminated);
    assert!(!ran.load(Ordering::SeqCst));
    assert!(manager.create_fiber(0, |_| {}).is_err());
}
