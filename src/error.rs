use thiserror::Error;

/// Failures of manager construction and manager-wide operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ManagerError {
    #[error("no event backend is available on this platform")]
    EventUnavailable,
    #[error("manager is terminating and no longer creates objects")]
    Terminating,
}

impl ManagerError {
    pub fn as_str(self) -> &'static str {
        match self {
            ManagerError::EventUnavailable => "Event backend unavailable",
            ManagerError::Terminating => "Manager is terminating",
        }
    }
}

/// Failures of thread operations.
#[derive(Debug, Error)]
pub enum ThreadError {
    #[error("operation is not allowed on a thread this runtime does not own")]
    RemoteThread,
    #[error("manager is terminating and no longer creates threads")]
    ManagerTerminating,
    #[error("failed to spawn OS thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("a thread cannot join itself")]
    JoinSelf,
    #[error("thread entry point panicked")]
    Panicked,
    #[error("thread has already terminated")]
    Terminated,
}

impl ThreadError {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadError::RemoteThread => "Thread is not owned by this runtime",
            ThreadError::ManagerTerminating => "Manager is terminating",
            ThreadError::Spawn(_) => "OS thread spawn failed",
            ThreadError::JoinSelf => "Thread cannot join itself",
            ThreadError::Panicked => "Thread entry point panicked",
            ThreadError::Terminated => "Thread has terminated",
        }
    }
}

/// Failures of fiber operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FiberError {
    #[error("fibers are not supported on this target")]
    Unsupported,
    #[error("failed to allocate a fiber stack")]
    OutOfMemory,
    #[error("manager is terminating and no longer creates fibers")]
    ManagerTerminating,
    #[error("fiber is already running or on a fiber stack")]
    AlreadyRunning,
    #[error("fiber has terminated")]
    Terminated,
    #[error("fiber belongs to another OS thread")]
    ForeignThread,
    #[error("fiber is not the current fiber of the calling thread")]
    NotCurrent,
}

impl FiberError {
    pub fn as_str(self) -> &'static str {
        match self {
            FiberError::Unsupported => "Fibers unsupported on this target",
            FiberError::OutOfMemory => "Fiber stack allocation failed",
            FiberError::ManagerTerminating => "Manager is terminating",
            FiberError::AlreadyRunning => "Fiber is already running",
            FiberError::Terminated => "Fiber has terminated",
            FiberError::ForeignThread => "Fiber belongs to another thread",
            FiberError::NotCurrent => "Fiber is not current",
        }
    }
}

/// Failures of synchronization primitives that are not timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("semaphore count is already at its maximum")]
    SemaphoreOverflow,
}

impl SyncError {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncError::SemaphoreOverflow => "Semaphore overflow",
        }
    }
}

/// Failures of the task scheduler.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task queue is full")]
    QueueFull,
    #[error("task has finished and cannot run again")]
    Finished,
    #[error(transparent)]
    Fiber(#[from] FiberError),
    #[error(transparent)]
    Thread(#[from] ThreadError),
}

impl TaskError {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskError::QueueFull => "Task queue is full",
            TaskError::Finished => "Task has finished",
            TaskError::Fiber(e) => e.as_str(),
            TaskError::Thread(e) => e.as_str(),
        }
    }
}

pub type ManagerResult<T> = Result<T, ManagerError>;
pub type ThreadResult<T> = Result<T, ThreadError>;
pub type FiberResult<T> = Result<T, FiberError>;
pub type SyncResult<T> = Result<T, SyncError>;
pub type TaskResult<T> = Result<T, TaskError>;
