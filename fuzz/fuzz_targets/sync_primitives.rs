#![no_main]

use arbitrary::{Arbitrary, Unstructured};
use fiber_executive::{RawLock, RawRwLock, RwLock, Semaphore, ThreadReentrantRwLock, UnfairMutex};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
enum SyncOperation {
    MutexTryLock,
    MutexUnlock,
    SemaphoreIncrement,
    SemaphoreTryDecrement,
    RwTryRead,
    RwLeaveRead,
    RwTryWrite,
    RwLeaveWrite,
    ReentrantEnter,
    ReentrantLeave,
}

fuzz_target!(|data: &[u8]| {
    let mut u = Unstructured::new(data);
    let operations: Result<Vec<SyncOperation>, _> = (0..100)
        .map(|_| SyncOperation::arbitrary(&mut u))
        .collect();

    if let Ok(ops) = operations {
        fuzz_single_threaded(ops);
    }
});

/// Drive every primitive from one thread against a simple model. Only
/// non-blocking operations are used, so nothing can deadlock.
fn fuzz_single_threaded(ops: Vec<SyncOperation>) {
    let mutex = UnfairMutex::new();
    let semaphore = Semaphore::new(0);
    let rwlock = RwLock::new();
    let reentrant = ThreadReentrantRwLock::new();

    let mut mutex_held = false;
    let mut permits = 0u32;
    let mut readers = 0usize;
    let mut writer = false;
    let mut depth = 0u32;

    for op in ops {
        match op {
            SyncOperation::MutexTryLock => {
                assert_eq!(mutex.try_lock(), !mutex_held);
                mutex_held = true;
            }
            SyncOperation::MutexUnlock => {
                if mutex_held {
                    mutex.unlock();
                    mutex_held = false;
                }
            }
            SyncOperation::SemaphoreIncrement => {
                semaphore.increment().unwrap();
                permits += 1;
            }
            SyncOperation::SemaphoreTryDecrement => {
                assert_eq!(semaphore.try_decrement(), permits > 0);
                permits = permits.saturating_sub(1);
            }
            SyncOperation::RwTryRead => {
                let got = rwlock.try_enter_read();
                assert_eq!(got, !writer);
                if got {
                    readers += 1;
                }
            }
            SyncOperation::RwLeaveRead => {
                if readers > 0 {
                    rwlock.leave_read();
                    readers -= 1;
                }
            }
            SyncOperation::RwTryWrite => {
                let got = rwlock.try_enter_write();
                assert_eq!(got, !writer && readers == 0);
                writer |= got;
            }
            SyncOperation::RwLeaveWrite => {
                if writer {
                    rwlock.leave_write();
                    writer = false;
                }
            }
            SyncOperation::ReentrantEnter => {
                assert!(reentrant.try_enter_write());
                depth += 1;
            }
            SyncOperation::ReentrantLeave => {
                if depth > 0 {
                    reentrant.leave_write();
                    depth -= 1;
                }
            }
        }
        assert_eq!(mutex.is_locked(), mutex_held);
        assert_eq!(semaphore.value(), permits);
        assert_eq!(reentrant.write_depth(), depth);
    }
}
