//! Serial task execution service.
//!
//! A [`TaskService`] owns one background worker that runs submitted
//! closures strictly in submission order. Producers on any thread get a
//! [`TaskHandle`] back from `submit` and later block on `wait` for that
//! task's value.

pub mod clients;
pub mod config;
pub mod error;
pub mod logging;
pub mod result_slot;
pub mod service;
pub mod task_queue;
pub mod types;

pub use config::ServiceConfig;
pub use error::ServiceError;
pub use service::TaskService;
pub use types::{ServiceState, ServiceStats, TaskHandle, TaskId};
