//! Typed extension slots for threads, fibers and the manager.
//!
//! A subsystem registers a constructor once and receives a [`PluginKey`].
//! Each entity carries an [`ExtensionSlots`] map; resolving a key against it
//! builds the value on first use. Slot numbers are never reused, so a key
//! that was unregistered simply stops resolving.

use core::any::Any;
use core::fmt;
use core::marker::PhantomData;
use portable_atomic::{AtomicUsize, Ordering};
use std::collections::BTreeMap;
use std::sync::Arc;

type SlotValue = Arc<dyn Any + Send + Sync>;
type Constructor = Box<dyn Fn() -> SlotValue + Send + Sync>;
type TerminateHook = Box<dyn Fn(&SlotValue) + Send + Sync>;

/// Handle to a registered plugin producing values of type `T`.
pub struct PluginKey<T> {
    slot: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> PluginKey<T> {
    /// Slot number inside the owning registry.
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl<T> Clone for PluginKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PluginKey<T> {}

impl<T> fmt::Debug for PluginKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PluginKey").field(&self.slot).finish()
    }
}

struct PluginEntry {
    construct: Constructor,
    on_terminate: Option<TerminateHook>,
}

/// The registered plugins for one kind of entity.
pub struct PluginRegistry {
    next_slot: AtomicUsize,
    entries: spin::RwLock<BTreeMap<usize, Arc<PluginEntry>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            next_slot: AtomicUsize::new(0),
            entries: spin::RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a plugin whose per-entity value is built by `construct`.
    pub fn register<T, F>(&self, construct: F) -> PluginKey<T>
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.insert(PluginEntry {
            construct: Box::new(move || Arc::new(construct()) as SlotValue),
            on_terminate: None,
        })
    }

    /// Register a plugin that is also told when its entity is being
    /// forcibly terminated, before the unwind is delivered.
    pub fn register_with_terminate<T, F, H>(&self, construct: F, on_terminate: H) -> PluginKey<T>
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
        H: Fn(&T) + Send + Sync + 'static,
    {
        self.insert(PluginEntry {
            construct: Box::new(move || Arc::new(construct()) as SlotValue),
            on_terminate: Some(Box::new(move |value: &SlotValue| {
                if let Some(value) = value.downcast_ref::<T>() {
                    on_terminate(value);
                }
            })),
        })
    }

    fn insert<T>(&self, entry: PluginEntry) -> PluginKey<T> {
        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        self.entries.write().insert(slot, Arc::new(entry));
        PluginKey {
            slot,
            _marker: PhantomData,
        }
    }

    /// Remove a plugin. Returns `false` if it was not registered.
    pub fn unregister<T>(&self, key: PluginKey<T>) -> bool {
        self.entries.write().remove(&key.slot).is_some()
    }

    pub fn is_registered<T>(&self, key: &PluginKey<T>) -> bool {
        self.entries.read().contains_key(&key.slot)
    }

    /// Number of registered plugins.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The entity's value for `key`, built on first use.
    ///
    /// `None` once the plugin has been unregistered.
    pub fn resolve<T: Any + Send + Sync>(
        &self,
        slots: &ExtensionSlots,
        key: &PluginKey<T>,
    ) -> Option<Arc<T>> {
        let entry = self.entries.read().get(&key.slot).cloned()?;
        if let Some(value) = slots.get(key.slot) {
            return value.downcast::<T>().ok();
        }
        let fresh = (entry.construct)();
        slots.insert_if_absent(key.slot, fresh).downcast::<T>().ok()
    }

    /// The entity's value for `key` if one was already built.
    pub fn peek<T: Any + Send + Sync>(
        &self,
        slots: &ExtensionSlots,
        key: &PluginKey<T>,
    ) -> Option<Arc<T>> {
        if !self.is_registered(key) {
            return None;
        }
        slots.get(key.slot)?.downcast::<T>().ok()
    }

    /// Tell every plugin with a terminate hook that `slots`' entity is going
    /// down. Values that were never built are skipped.
    pub(crate) fn notify_terminate(&self, slots: &ExtensionSlots) {
        let hooked: Vec<(usize, Arc<PluginEntry>)> = self
            .entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.on_terminate.is_some())
            .map(|(slot, entry)| (*slot, entry.clone()))
            .collect();

        for (slot, entry) in hooked {
            if let (Some(value), Some(hook)) = (slots.get(slot), entry.on_terminate.as_ref()) {
                hook(&value);
            }
        }
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("registered", &self.len())
            .finish()
    }
}

/// Per-entity plugin values.
#[derive(Default)]
pub struct ExtensionSlots {
    values: spin::Mutex<BTreeMap<usize, SlotValue>>,
}

impl ExtensionSlots {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, slot: usize) -> Option<SlotValue> {
        self.values.lock().get(&slot).cloned()
    }

    fn insert_if_absent(&self, slot: usize, value: SlotValue) -> SlotValue {
        self.values.lock().entry(slot).or_insert(value).clone()
    }

    /// Number of values built so far.
    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every value. Values are released outside the slot lock.
    pub(crate) fn clear(&self) {
        let values = core::mem::take(&mut *self.values.lock());
        drop(values);
    }
}

impl fmt::Debug for ExtensionSlots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionSlots")
            .field("values", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portable_atomic::AtomicU32;

    #[test]
    fn test_resolve_builds_once_per_entity() {
        let registry = PluginRegistry::new();
        let built = Arc::new(AtomicU32::new(0));
        let key = {
            let built = built.clone();
            registry.register(move || {
                built.fetch_add(1, Ordering::SeqCst);
                AtomicU32::new(7)
            })
        };

        let a = ExtensionSlots::new();
        let b = ExtensionSlots::new();
        let first = registry.resolve(&a, &key).unwrap();
        first.store(9, Ordering::SeqCst);
        assert_eq!(registry.resolve(&a, &key).unwrap().load(Ordering::SeqCst), 9);
        assert_eq!(registry.resolve(&b, &key).unwrap().load(Ordering::SeqCst), 7);
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unregistered_key_stops_resolving() {
        let registry = PluginRegistry::new();
        let key = registry.register(|| String::from("slot"));
        let slots = ExtensionSlots::new();
        assert!(registry.resolve(&slots, &key).is_some());
        assert!(registry.unregister(key));
        assert!(!registry.unregister(key));
        assert!(registry.resolve(&slots, &key).is_none());
        assert!(registry.is_empty());

        // Slot numbers are not recycled.
        let next = registry.register(|| 0u8);
        assert_ne!(next.slot(), key.slot());
    }

    #[test]
    fn test_terminate_hook_sees_built_values_only() {
        let registry = PluginRegistry::new();
        let key = registry.register_with_terminate(
            || AtomicU32::new(0),
            |value: &AtomicU32| {
                value.fetch_add(1, Ordering::SeqCst);
            },
        );

        let untouched = ExtensionSlots::new();
        registry.notify_terminate(&untouched);
        assert!(untouched.is_empty());

        let slots = ExtensionSlots::new();
        let value = registry.resolve(&slots, &key).unwrap();
        registry.notify_terminate(&slots);
        assert_eq!(value.load(Ordering::SeqCst), 1);
        assert!(registry.peek(&untouched, &key).is_none());
    }
}
