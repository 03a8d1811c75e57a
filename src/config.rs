//! Manager configuration.

use crate::event::EventBackend;
use crate::mem::StackAllocator;
use core::time::Duration;
use std::sync::Arc;

/// Default usable size of a fiber stack.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Default per-pulse execution budget of an executive group.
pub const DEFAULT_GROUP_BUDGET: Duration = Duration::from_millis(16);

/// Default capacity of the task scheduler queue.
pub const DEFAULT_TASK_QUEUE_CAPACITY: usize = 256;

/// Configuration consumed by [`Manager::with_config`](crate::Manager::with_config).
#[derive(Clone)]
pub struct ManagerConfig {
    /// Force an event backend instead of detecting the best one.
    pub event_backend: Option<EventBackend>,
    /// Fiber stack size used when a caller asks for 0 bytes.
    pub default_stack_size: usize,
    /// Budget of the default executive group and of new groups.
    pub default_group_budget: Duration,
    /// How many scheduled items the task queue holds.
    pub task_queue_capacity: usize,
    /// Source of fiber stacks. `None` picks the platform default.
    pub stack_allocator: Option<Arc<dyn StackAllocator>>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            event_backend: None,
            default_stack_size: DEFAULT_STACK_SIZE,
            default_group_budget: DEFAULT_GROUP_BUDGET,
            task_queue_capacity: DEFAULT_TASK_QUEUE_CAPACITY,
            stack_allocator: None,
        }
    }
}

impl core::fmt::Debug for ManagerConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ManagerConfig")
            .field("event_backend", &self.event_backend)
            .field("default_stack_size", &self.default_stack_size)
            .field("default_group_budget", &self.default_group_budget)
            .field("task_queue_capacity", &self.task_queue_capacity)
            .field("custom_stack_allocator", &self.stack_allocator.is_some())
            .finish()
    }
}
