//! Shared identifiers and task model used across the service.

use std::fmt;

/// Unique, monotonically increasing identifier for a submitted task.
pub type TaskId = u64;

/// Identifier distinguishing one service instance from another.
pub(crate) type InstanceId = u64;

/// A queued unit of work. A task failure is reported as a rendered cause.
pub(crate) type Job<T> = Box<dyn FnOnce() -> Result<T, String> + Send + 'static>;

/// Token returned by `submit`; the only way to retrieve a task's result.
///
/// Handles are `Copy` so they can be passed between threads freely. Only the
/// first `wait` on a handle yields the value; later calls report
/// `HandleAlreadyConsumed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    pub(crate) instance: InstanceId,
    pub(crate) id: TaskId,
}

impl TaskHandle {
    pub(crate) fn new(instance: InstanceId, id: TaskId) -> Self {
        Self { instance, id }
    }

    /// Task id this handle refers to.
    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.id)
    }
}

/// Lifecycle of a service instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Running,
}

/// Counters describing what the worker has done so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServiceStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
}
