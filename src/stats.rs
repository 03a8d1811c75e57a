//! Point-in-time counters describing a manager.

use core::fmt;

/// Snapshot returned by [`Manager::collect_statistics`](crate::Manager::collect_statistics).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Owned threads that have not terminated.
    pub threads: usize,
    /// Remote descriptors still referenced.
    pub remote_threads: usize,
    /// Fibers that have not terminated.
    pub fibers: usize,
    /// Executive groups with a live handle, the default one included.
    pub groups: usize,
    /// Bytes reserved for fiber stacks, guard pages included.
    pub reserved_stack_bytes: usize,
    pub live_stacks: usize,
    pub thread_plugins: usize,
    pub fiber_plugins: usize,
    pub manager_plugins: usize,
    /// Task runs completed by the scheduler.
    pub tasks_executed: u64,
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "threads:          {} owned, {} remote", self.threads, self.remote_threads)?;
        writeln!(f, "fibers:           {}", self.fibers)?;
        writeln!(f, "groups:           {}", self.groups)?;
        writeln!(
            f,
            "stacks:           {} live, {} bytes reserved",
            self.live_stacks, self.reserved_stack_bytes
        )?;
        writeln!(
            f,
            "plugins:          {} thread, {} fiber, {} manager",
            self.thread_plugins, self.fiber_plugins, self.manager_plugins
        )?;
        write!(f, "tasks executed:   {}", self.tasks_executed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_lists_every_counter() {
        let stats = Statistics {
            threads: 2,
            fibers: 5,
            tasks_executed: 9,
            ..Statistics::default()
        };
        let text = stats.to_string();
        assert!(text.contains("2 owned, 0 remote"));
        assert!(text.contains("fibers:           5"));
        assert!(text.ends_with("tasks executed:   9"));
    }
}
