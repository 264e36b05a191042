//! Serial task service: one background worker, many producers.
//!
//! Producers `submit` closures and get back a `TaskHandle`. The worker runs
//! tasks one at a time in id order and publishes each outcome into a
//! per-task `ResultSlot`, which the producer later consumes with `wait`.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::config::ServiceConfig;
use crate::error::ServiceError;
use crate::result_slot::{Outcome, ResultSlot, TimedTake};
use crate::task_queue::TaskQueue;
use crate::types::{InstanceId, Job, ServiceState, ServiceStats, TaskHandle, TaskId};

/// Source of per-instance ids that tie a `TaskHandle` to its service.
static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(0);

/// A queued job together with the slot its outcome goes to.
struct QueuedTask<T> {
    job: Job<T>,
    slot: Arc<ResultSlot<T>>,
}

/// State shared between the service handle and its worker thread.
struct Shared<T> {
    queue: TaskQueue<QueuedTask<T>>,
    slots: Mutex<HashMap<TaskId, Arc<ResultSlot<T>>>>,
    completed: AtomicU64,
    failed: AtomicU64,
}

enum Lifecycle {
    Fresh,
    Running(JoinHandle<()>),
    Stopped,
}

/// Runs submitted tasks serially, in submission order, on a single worker.
///
/// `start` and `stop` may be called once each; a stopped service cannot be
/// restarted. `submit` fails with `ServiceNotRunning` outside that window.
/// Results stay retrievable after `stop` returns.
///
/// A task must not call `stop` on its own service or `wait` on a task
/// queued after it; both would block the worker on itself.
pub struct TaskService<T> {
    instance: InstanceId,
    config: ServiceConfig,
    shared: Arc<Shared<T>>,
    lifecycle: Mutex<Lifecycle>,
    running: AtomicBool,
}

impl<T: Send + 'static> TaskService<T> {
    /// Create a stopped service with the default configuration.
    pub fn new() -> Self {
        Self::with_config(ServiceConfig::default())
    }

    pub fn with_config(config: ServiceConfig) -> Self {
        Self {
            instance: NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
            config,
            shared: Arc::new(Shared {
                queue: TaskQueue::new(),
                slots: Mutex::new(HashMap::new()),
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
            lifecycle: Mutex::new(Lifecycle::Fresh),
            running: AtomicBool::new(false),
        }
    }

    /// Spawn the worker and begin accepting tasks.
    pub fn start(&self) -> Result<(), ServiceError> {
        let mut lifecycle = self.lifecycle.lock().expect("lifecycle mutex poisoned");
        match *lifecycle {
            Lifecycle::Running(_) => return Err(ServiceError::AlreadyRunning),
            Lifecycle::Stopped => return Err(ServiceError::NotRestartable),
            Lifecycle::Fresh => {}
        }

        self.shared.queue.open();
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(self.config.worker_name.clone())
            .spawn(move || run_worker(shared));
        let worker = match spawned {
            Ok(worker) => worker,
            Err(err) => {
                self.shared.queue.close();
                return Err(ServiceError::WorkerSpawn(err));
            }
        };

        *lifecycle = Lifecycle::Running(worker);
        self.running.store(true, Ordering::SeqCst);
        info!(worker = %self.config.worker_name, "task service started");
        Ok(())
    }

    /// Queue a task for execution; a panic inside it becomes `TaskFailed`.
    pub fn submit<F>(&self, task: F) -> Result<TaskHandle, ServiceError>
    where
        F: FnOnce() -> T + Send + 'static,
    {
        self.enqueue(Box::new(move || -> Outcome<T> { Ok(task()) }))
    }

    /// Queue a task whose `Err` is reported to `wait` as `TaskFailed`.
    pub fn submit_fallible<F, E>(&self, task: F) -> Result<TaskHandle, ServiceError>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        E: Display,
    {
        self.enqueue(Box::new(move || task().map_err(|err| err.to_string())))
    }

    fn enqueue(&self, job: Job<T>) -> Result<TaskHandle, ServiceError> {
        let slot = Arc::new(ResultSlot::new());
        let queued = QueuedTask {
            job,
            slot: Arc::clone(&slot),
        };
        let id = self
            .shared
            .queue
            .push(queued)
            .map_err(|_| ServiceError::ServiceNotRunning)?;
        // The handle is not visible to anyone until we return, so inserting
        // after the push cannot race with a `wait` on this id.
        self.shared
            .slots
            .lock()
            .expect("slot table mutex poisoned")
            .insert(id, slot);
        trace!(task = id, "task queued");
        Ok(TaskHandle::new(self.instance, id))
    }

    /// Block until the task behind `handle` has run and return its value.
    ///
    /// Each handle yields its value once; a second call returns
    /// `HandleAlreadyConsumed`. There is no timeout here; use `wait_timeout`
    /// or `is_ready` when the caller needs to stay responsive.
    pub fn wait(&self, handle: TaskHandle) -> Result<T, ServiceError> {
        let slot = self.lookup(handle)?;
        let outcome = slot.take();
        self.forget(handle.id);
        match outcome {
            Some(outcome) => finish(handle.id, outcome),
            None => Err(ServiceError::HandleAlreadyConsumed(handle.id)),
        }
    }

    /// Like `wait`, but gives up after `timeout` and keeps the handle valid.
    pub fn wait_timeout(&self, handle: TaskHandle, timeout: Duration) -> Result<T, ServiceError> {
        let slot = self.lookup(handle)?;
        match slot.take_timeout(timeout) {
            TimedTake::Ready(outcome) => {
                self.forget(handle.id);
                finish(handle.id, outcome)
            }
            TimedTake::Consumed => {
                self.forget(handle.id);
                Err(ServiceError::HandleAlreadyConsumed(handle.id))
            }
            TimedTake::TimedOut => Err(ServiceError::Timeout(handle.id)),
        }
    }

    /// Whether the result behind `handle` can be taken without blocking.
    pub fn is_ready(&self, handle: TaskHandle) -> Result<bool, ServiceError> {
        self.check_instance(handle)?;
        let ready = self
            .shared
            .slots
            .lock()
            .expect("slot table mutex poisoned")
            .get(&handle.id)
            .map(|slot| slot.is_ready());
        match ready {
            Some(ready) => Ok(ready),
            None => Err(self.missing_slot_error(handle.id)),
        }
    }

    /// Close the queue, let the worker drain it, and join the worker.
    ///
    /// Every task accepted before this call runs to completion. Calling
    /// `stop` again, or before `start`, does nothing.
    pub fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().expect("lifecycle mutex poisoned");
        let worker = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running(worker) => worker,
            other => {
                *lifecycle = other;
                return;
            }
        };

        debug!(pending = self.shared.queue.len(), "stopping task service");
        self.shared.queue.close();
        if worker.join().is_err() {
            error!("task worker thread panicked");
        }
        self.running.store(false, Ordering::SeqCst);
        info!("task service stopped");
    }

    pub fn state(&self) -> ServiceState {
        if self.running.load(Ordering::SeqCst) {
            ServiceState::Running
        } else {
            ServiceState::Stopped
        }
    }

    /// Number of tasks queued but not yet picked up by the worker.
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            submitted: self.shared.queue.issued(),
            completed: self.shared.completed.load(Ordering::SeqCst),
            failed: self.shared.failed.load(Ordering::SeqCst),
        }
    }

    /// Share the slot with the caller; the slot itself hands the value out
    /// once, so concurrent callers on one handle all see a truthful state.
    fn lookup(&self, handle: TaskHandle) -> Result<Arc<ResultSlot<T>>, ServiceError> {
        self.check_instance(handle)?;
        let slot = self
            .shared
            .slots
            .lock()
            .expect("slot table mutex poisoned")
            .get(&handle.id)
            .map(Arc::clone);
        slot.ok_or_else(|| self.missing_slot_error(handle.id))
    }

    /// Drop the table entry once its value has been taken.
    fn forget(&self, id: TaskId) {
        self.shared
            .slots
            .lock()
            .expect("slot table mutex poisoned")
            .remove(&id);
    }

    fn check_instance(&self, handle: TaskHandle) -> Result<(), ServiceError> {
        if handle.instance != self.instance {
            return Err(ServiceError::UnknownHandle(handle.id));
        }
        Ok(())
    }

    fn missing_slot_error(&self, id: TaskId) -> ServiceError {
        if id < self.shared.queue.issued() {
            ServiceError::HandleAlreadyConsumed(id)
        } else {
            ServiceError::UnknownHandle(id)
        }
    }
}

impl<T: Send + 'static> Default for TaskService<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for TaskService<T> {
    fn drop(&mut self) {
        let lifecycle = match self.lifecycle.get_mut() {
            Ok(lifecycle) => lifecycle,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Lifecycle::Running(worker) = std::mem::replace(lifecycle, Lifecycle::Stopped) {
            self.shared.queue.close();
            if worker.join().is_err() {
                error!("task worker thread panicked");
            }
        }
    }
}

fn finish<T>(id: TaskId, outcome: Outcome<T>) -> Result<T, ServiceError> {
    outcome.map_err(|cause| ServiceError::TaskFailed { id, cause })
}

fn run_worker<T>(shared: Arc<Shared<T>>) {
    info!("worker started");
    while let Some((id, queued)) = shared.queue.pop_blocking_or_closed() {
        trace!(task = id, "executing task");
        let outcome = match panic::catch_unwind(AssertUnwindSafe(queued.job)) {
            Ok(outcome) => outcome,
            Err(payload) => Err(panic_message(payload.as_ref())),
        };
        match &outcome {
            Ok(_) => {
                shared.completed.fetch_add(1, Ordering::SeqCst);
            }
            Err(cause) => {
                shared.failed.fetch_add(1, Ordering::SeqCst);
                warn!(task = id, %cause, "task failed");
            }
        }
        queued.slot.fill(outcome);
    }
    info!("worker drained and exited");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("task panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("task panicked: {message}")
    } else {
        "task panicked".to_string()
    }
}
