//! Per-OS-thread bookkeeping: which runtime thread descriptor the calling
//! OS thread is, for every manager it has touched.

use super::Thread;
use crate::manager::ManagerInner;
use core::cell::{Cell, RefCell};
use portable_atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

pub(crate) struct Binding {
    pub(crate) manager_id: u64,
    pub(crate) manager: Weak<ManagerInner>,
    pub(crate) thread: Thread,
}

thread_local! {
    static KEY: Cell<u64> = const { Cell::new(0) };
    static BINDINGS: RefCell<Vec<Binding>> = const { RefCell::new(Vec::new()) };
}

/// A process-unique, never reused number for the calling OS thread.
///
/// Returns 0 while the thread's locals are being torn down.
pub fn thread_key() -> u64 {
    KEY.try_with(|key| {
        if key.get() == 0 {
            key.set(NEXT_KEY.fetch_add(1, Ordering::Relaxed));
        }
        key.get()
    })
    .unwrap_or(0)
}

pub(crate) fn bind(manager: &Arc<ManagerInner>, thread: Thread) {
    let binding = Binding {
        manager_id: manager.id,
        manager: Arc::downgrade(manager),
        thread,
    };
    let replaced = unbind(binding.manager_id);
    let _ = BINDINGS.try_with(|bindings| bindings.borrow_mut().push(binding));
    // Dropped outside the borrow: a last handle runs cleanup callbacks.
    drop(replaced);
}

pub(crate) fn unbind(manager_id: u64) -> Option<Thread> {
    BINDINGS
        .try_with(|bindings| {
            let mut bindings = bindings.borrow_mut();
            let pos = bindings.iter().position(|b| b.manager_id == manager_id)?;
            Some(bindings.remove(pos).thread)
        })
        .ok()
        .flatten()
}

/// The calling OS thread's descriptor for `manager_id`, if it has one.
pub(crate) fn bound_thread(manager_id: u64) -> Option<Thread> {
    BINDINGS
        .try_with(|bindings| {
            bindings
                .borrow()
                .iter()
                .find(|b| b.manager_id == manager_id)
                .map(|b| b.thread.clone())
        })
        .ok()
        .flatten()
}

/// Every live binding, most recently bound manager first.
pub(crate) fn bindings() -> Vec<(Arc<ManagerInner>, Thread)> {
    BINDINGS
        .try_with(|bindings| {
            bindings
                .borrow()
                .iter()
                .rev()
                .filter_map(|b| Some((b.manager.upgrade()?, b.thread.clone())))
                .collect()
        })
        .unwrap_or_default()
}
