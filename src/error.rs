use crate::types::TaskId;

/// Errors surfaced by `TaskService` operations.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("service is not running")]
    ServiceNotRunning,
    #[error("service is already running")]
    AlreadyRunning,
    #[error("service was stopped and cannot be restarted")]
    NotRestartable,
    #[error("handle for task {0} does not belong to this service")]
    UnknownHandle(TaskId),
    #[error("result of task {0} was already consumed")]
    HandleAlreadyConsumed(TaskId),
    #[error("task {id} failed: {cause}")]
    TaskFailed { id: TaskId, cause: String },
    #[error("timed out waiting for task {0}")]
    Timeout(TaskId),
    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[from] std::io::Error),
}
