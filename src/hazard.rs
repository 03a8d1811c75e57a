//! Cleanup handlers that survive forced termination.
//!
//! Every thread and fiber gets a LIFO [`HazardStack`] through a plugin slot.
//! Code that blocks or holds a resource pushes a handler; if its context is
//! terminated, the handlers are purged (top first) before the unwind is
//! delivered, which is what lets a blocked wait return.
//!
//! Entries are removed under the stack lock before they run, so each handler
//! executes at most once no matter how many purges race.

use crate::plugin::{PluginKey, PluginRegistry};
use core::fmt;
use portable_atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A cleanup action. Must not block indefinitely and must not panic.
pub trait Hazard: Send + Sync {
    fn on_hazard(&self);
}

impl<F> Hazard for F
where
    F: Fn() + Send + Sync,
{
    fn on_hazard(&self) {
        self()
    }
}

/// A handler on a hazard stack.
///
/// `Owned` handlers are dropped when their entry is removed; `Shared` ones
/// only release the stack's reference.
pub enum HazardEntry {
    Owned(Box<dyn Hazard>),
    Shared(Arc<dyn Hazard>),
}

impl HazardEntry {
    pub fn owned(handler: impl Hazard + 'static) -> Self {
        Self::Owned(Box::new(handler))
    }

    pub fn shared(handler: Arc<dyn Hazard>) -> Self {
        Self::Shared(handler)
    }

    /// Whether removing the entry frees the handler.
    pub fn deletes_on_removal(&self) -> bool {
        matches!(self, Self::Owned(_))
    }

    fn run(&self) {
        match self {
            Self::Owned(handler) => handler.on_hazard(),
            Self::Shared(handler) => handler.on_hazard(),
        }
    }
}

impl fmt::Debug for HazardEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owned(_) => f.write_str("HazardEntry::Owned"),
            Self::Shared(_) => f.write_str("HazardEntry::Shared"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HazardId(u64);

#[derive(Default)]
pub struct HazardStack {
    entries: spin::Mutex<Vec<(HazardId, HazardEntry)>>,
    next_id: AtomicU64,
}

impl HazardStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: HazardEntry) -> HazardId {
        let id = HazardId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push((id, entry));
        id
    }

    /// Remove the top entry, running it first if `execute` is set.
    /// Returns `false` on an empty stack.
    pub fn pop(&self, execute: bool) -> bool {
        let top = self.entries.lock().pop();
        match top {
            Some((_, entry)) => {
                if execute {
                    entry.run();
                }
                true
            }
            None => false,
        }
    }

    /// Like [`pop`](Self::pop), but only if the top entry is `id`.
    pub fn pop_if_top(&self, id: HazardId, execute: bool) -> bool {
        let top = {
            let mut entries = self.entries.lock();
            match entries.last() {
                Some((top, _)) if *top == id => entries.pop(),
                _ => None,
            }
        };
        match top {
            Some((_, entry)) => {
                if execute {
                    entry.run();
                }
                true
            }
            None => false,
        }
    }

    /// Run and remove every entry, top to bottom. Returns how many ran.
    pub fn purge(&self) -> usize {
        let mut ran = 0;
        loop {
            let top = self.entries.lock().pop();
            let Some((_, entry)) = top else {
                break;
            };
            entry.run();
            ran += 1;
        }
        ran
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for HazardStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HazardStack")
            .field("len", &self.len())
            .finish()
    }
}

/// Plugin keys under which hazard stacks hang off threads and fibers.
#[derive(Clone, Copy, Debug)]
pub(crate) struct HazardPlugins {
    pub(crate) thread: PluginKey<HazardStack>,
    pub(crate) fiber: PluginKey<HazardStack>,
}

impl HazardPlugins {
    pub(crate) fn register(threads: &PluginRegistry, fibers: &PluginRegistry) -> Self {
        Self {
            thread: threads.register_with_terminate(HazardStack::new, purge_on_terminate),
            fiber: fibers.register_with_terminate(HazardStack::new, purge_on_terminate),
        }
    }
}

fn purge_on_terminate(stack: &HazardStack) {
    let ran = stack.purge();
    if ran > 0 {
        log::debug!("purged {} hazard(s) on termination", ran);
    }
}

/// Pushes a handler on construction and pops it on every exit path.
///
/// On a normal exit the handler is dropped without running. When the scope
/// is left by a panic the handler runs; when it is left by forced
/// termination the handler has already been run by the purge.
#[must_use = "the hazard is popped as soon as the scope is dropped"]
pub struct HazardScope {
    stack: Arc<HazardStack>,
    id: HazardId,
}

impl HazardScope {
    pub(crate) fn push(stack: Arc<HazardStack>, entry: HazardEntry) -> Self {
        let id = stack.push(entry);
        Self { stack, id }
    }

    /// Push onto the current context of the most recently bound manager on
    /// this OS thread. `None` if this thread never touched a manager.
    pub fn push_current(entry: HazardEntry) -> Option<Self> {
        let stack = crate::manager::current_hazard_stack()?;
        Some(Self::push(stack, entry))
    }

    pub fn id(&self) -> HazardId {
        self.id
    }
}

impl Drop for HazardScope {
    fn drop(&mut self) {
        self.stack.pop_if_top(self.id, std::thread::panicking());
    }
}

impl fmt::Debug for HazardScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HazardScope").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder(log: &Arc<Mutex<Vec<u32>>>, tag: u32) -> HazardEntry {
        let log = log.clone();
        HazardEntry::owned(move || log.lock().unwrap().push(tag))
    }

    #[test]
    fn test_purge_runs_lifo_once() {
        let stack = HazardStack::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in 1..=3 {
            stack.push(recorder(&log, tag));
        }
        assert_eq!(stack.purge(), 3);
        assert_eq!(stack.purge(), 0);
        assert_eq!(*log.lock().unwrap(), vec![3, 2, 1]);
    }

    #[test]
    fn test_pop_without_execute_discards() {
        let stack = HazardStack::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        stack.push(recorder(&log, 1));
        stack.push(recorder(&log, 2));
        assert!(stack.pop(false));
        assert!(stack.pop(true));
        assert!(!stack.pop(true));
        assert_eq!(*log.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_pop_if_top_ignores_buried_entry() {
        let stack = HazardStack::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let buried = stack.push(recorder(&log, 1));
        stack.push(recorder(&log, 2));
        assert!(!stack.pop_if_top(buried, true));
        assert_eq!(stack.len(), 2);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_shared_entry_survives_removal() {
        let handler: Arc<dyn Hazard> = Arc::new(|| {});
        let entry = HazardEntry::shared(handler.clone());
        assert!(!entry.deletes_on_removal());
        let stack = HazardStack::new();
        stack.push(entry);
        stack.pop(true);
        assert_eq!(Arc::strong_count(&handler), 1);
    }

    #[test]
    fn test_scope_runs_handler_only_on_panic() {
        let stack = Arc::new(HazardStack::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let _scope = HazardScope::push(stack.clone(), recorder(&log, 1));
        }
        assert!(log.lock().unwrap().is_empty());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _scope = HazardScope::push(stack.clone(), recorder(&log, 2));
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(*log.lock().unwrap(), vec![2]);
        assert!(stack.is_empty());
    }
}
