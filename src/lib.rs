//! Cooperative fiber and thread runtime.
//!
//! A [`Manager`] owns the runtime: it spawns threads, creates fibers that
//! run on stacks of their own, and hands out blocking primitives built on a
//! single [`Event`] abstraction. Termination of threads and fibers is
//! cooperative and hazard-safe: handlers pushed on a context's hazard stack
//! run when that context is forcibly terminated, which is how blocked waits
//! get released.

pub mod arch;
pub mod config;
pub mod error;
pub mod event;
pub mod fiber;
pub mod group;
pub mod hazard;
pub mod manager;
pub mod mem;
pub mod plugin;
pub mod stats;
pub mod sync;
pub mod task;
pub mod thread;

pub use config::ManagerConfig;
pub use error::{
    FiberError, FiberResult, ManagerError, ManagerResult, SyncError, SyncResult, TaskError,
    TaskResult, ThreadError, ThreadResult,
};
pub use event::{Event, EventBackend};
pub use fiber::{Fiber, FiberId, FiberStatus, TerminationScope, TerminationSignal};
pub use group::{ExecutiveGroup, GroupId};
pub use hazard::{Hazard, HazardEntry, HazardId, HazardScope, HazardStack};
pub use manager::Manager;
pub use mem::Placed;
pub use plugin::{ExtensionSlots, PluginKey, PluginRegistry};
pub use stats::Statistics;
pub use sync::{
    Barrier, Condvar, FairRwLock, RawLock, RawRwLock, ReentrantContext, ReentrantRwLock, RwLock,
    Semaphore, SpinLock, ThreadReentrantRwLock, UnfairMutex,
};
pub use task::{Task, TaskScheduler};
pub use thread::{Thread, ThreadActivity, ThreadBuilder, ThreadId, ThreadKind, ThreadStatus};

/// Cooperative termination point for the calling context.
///
/// Blocks while the calling thread is suspended and unwinds with a
/// [`TerminationSignal`] if termination of the current fiber or thread was
/// requested. Does nothing on OS threads no manager knows about.
pub fn checkpoint() {
    manager::checkpoint_current();
}
