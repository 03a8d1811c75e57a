//! Thread builder for configuring thread creation.

use super::{local, Thread, ThreadKind};
use crate::error::{ThreadError, ThreadResult};
use crate::manager::Manager;

/// Builder for configuring and creating owned threads.
///
/// Similar to `std::thread::Builder`, except that the thread is created
/// suspended by default and only starts running its entry point once
/// [`Thread::resume`] is called.
#[derive(Debug, Clone)]
pub struct ThreadBuilder {
    name: Option<String>,
    stack_size: Option<usize>,
    start_suspended: bool,
}

impl ThreadBuilder {
    pub fn new() -> Self {
        Self {
            name: None,
            stack_size: None,
            start_suspended: true,
        }
    }

    /// Set the thread name, used for the OS thread and in log output.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the OS stack size in bytes. 0 keeps the platform default.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = if size == 0 { None } else { Some(size) };
        self
    }

    /// Whether the thread waits for [`Thread::resume`] before running.
    pub fn start_suspended(mut self, suspended: bool) -> Self {
        self.start_suspended = suspended;
        self
    }

    /// Spawn the thread under `manager`.
    ///
    /// # Errors
    ///
    /// [`ThreadError::ManagerTerminating`] once the manager is shutting down,
    /// [`ThreadError::Spawn`] if the OS refuses a new thread.
    pub fn spawn<F>(self, manager: &Manager, entry: F) -> ThreadResult<Thread>
    where
        F: FnOnce(&Thread) + Send + 'static,
    {
        let shared = manager.inner();
        if shared.is_terminating() {
            return Err(ThreadError::ManagerTerminating);
        }

        let thread = Thread::new(
            ThreadKind::Owned,
            self.name.clone(),
            shared.id,
            shared.event_backend,
            shared.thread_plugins.clone(),
        );

        let mut os = std::thread::Builder::new();
        if let Some(name) = &self.name {
            os = os.name(name.clone());
        }
        if let Some(size) = self.stack_size {
            os = os.stack_size(size);
        }

        let body = {
            let thread = thread.clone();
            let manager = shared.clone();
            let activities = shared.activities();
            let entry: Box<dyn FnOnce(&Thread) + Send> = Box::new(entry);
            move || {
                local::bind(&manager, thread.clone());
                drop(manager);
                thread.run_owned(entry, &activities);
                drop(local::unbind(thread.manager_id()));
            }
        };

        let handle = os.spawn(body)?;
        thread.set_os_handle(handle);
        shared.register_thread(&thread);

        if !self.start_suspended {
            thread.resume()?;
        }
        Ok(thread)
    }
}

impl Default for ThreadBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadStatus;
    use core::time::Duration;
    use portable_atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_builder_starts_suspended() {
        let manager = Manager::create().unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let thread = {
            let ran = ran.clone();
            ThreadBuilder::new()
                .name("suspended-worker")
                .spawn(&manager, move |_| ran.store(true, Ordering::SeqCst))
                .unwrap()
        };

        assert_eq!(thread.name(), Some("suspended-worker"));
        assert_eq!(thread.status(), ThreadStatus::Suspended);
        assert_eq!(thread.join_timed(Duration::from_millis(20)).unwrap(), false);
        assert!(!ran.load(Ordering::SeqCst));

        thread.resume().unwrap();
        thread.join().unwrap();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(thread.status(), ThreadStatus::Terminated);
        manager.delete();
    }

    #[test]
    fn test_builder_can_start_running() {
        let manager = Manager::create().unwrap();
        let thread = ThreadBuilder::new()
            .start_suspended(false)
            .stack_size(128 * 1024)
            .spawn(&manager, |thread| assert!(thread.is_current()))
            .unwrap();
        thread.join().unwrap();
        manager.delete();
    }

    #[test]
    fn test_panicking_entry_is_reported() {
        let manager = Manager::create().unwrap();
        let thread = ThreadBuilder::new()
            .start_suspended(false)
            .spawn(&manager, |_| panic!("entry failure"))
            .unwrap();
        assert!(matches!(thread.join(), Err(ThreadError::Panicked)));
        manager.delete();
    }
}
