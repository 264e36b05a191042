/// Default name given to the worker thread.
pub const DEFAULT_WORKER_NAME: &str = "task-worker";

/// Construction-time settings for a `TaskService`.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    /// Thread name for the worker; shows up in logs and panic messages.
    pub worker_name: String,
}

impl ServiceConfig {
    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            worker_name: DEFAULT_WORKER_NAME.to_string(),
        }
    }
}
