//! Benchmarks for the hot paths of the runtime:
//! - fiber resume/yield round trip
//! - uncontended lock and semaphore operations
//! - event set/reset

use criterion::{criterion_group, criterion_main, Criterion};
use fiber_executive::{Manager, RawLock, RawRwLock};
use std::hint::black_box;

fn bench_fiber_switch(c: &mut Criterion) {
    if !fiber_executive::arch::fibers_supported() {
        return;
    }
    let manager = Manager::create().unwrap();
    let fiber = manager
        .create_fiber(64 * 1024, |fiber| loop {
            fiber.yield_now().unwrap();
        })
        .unwrap();

    c.bench_function("fiber_resume_yield", |b| {
        b.iter(|| fiber.resume().unwrap());
    });
    manager.delete();
}

fn bench_fiber_create(c: &mut Criterion) {
    if !fiber_executive::arch::fibers_supported() {
        return;
    }
    let manager = Manager::create().unwrap();
    c.bench_function("fiber_create_run", |b| {
        b.iter(|| {
            let fiber = manager.create_fiber(64 * 1024, |_| {}).unwrap();
            fiber.resume().unwrap();
            black_box(fiber)
        });
    });
    manager.delete();
}

fn bench_locks(c: &mut Criterion) {
    let manager = Manager::create().unwrap();
    let unfair = manager.create_unfair_mutex();
    let spin = manager.create_spin_lock();
    let rwlock = manager.create_rwlock();
    let fair = manager.create_fair_rwlock();

    c.bench_function("unfair_mutex_lock_unlock", |b| {
        b.iter(|| {
            let guard = unfair.guard();
            black_box(&guard);
        });
    });
    c.bench_function("spin_lock_lock_unlock", |b| {
        b.iter(|| {
            let guard = spin.guard();
            black_box(&guard);
        });
    });
    c.bench_function("rwlock_read", |b| {
        b.iter(|| {
            let guard = rwlock.read();
            black_box(&guard);
        });
    });
    c.bench_function("fair_rwlock_write", |b| {
        b.iter(|| {
            let guard = fair.write();
            black_box(&guard);
        });
    });
    manager.delete();
}

fn bench_semaphore(c: &mut Criterion) {
    let manager = Manager::create().unwrap();
    let semaphore = manager.create_semaphore(0);
    c.bench_function("semaphore_increment_decrement", |b| {
        b.iter(|| {
            semaphore.increment().unwrap();
            semaphore.decrement();
        });
    });
    manager.delete();
}

fn bench_event(c: &mut Criterion) {
    let manager = Manager::create().unwrap();
    let event = manager.create_event(false);
    c.bench_function("event_set_wait", |b| {
        b.iter(|| {
            event.set(false);
            event.wait();
            event.set(true);
        });
    });
    manager.delete();
}

criterion_group!(
    benches,
    bench_fiber_switch,
    bench_fiber_create,
    bench_locks,
    bench_semaphore,
    bench_event
);
criterion_main!(benches);
