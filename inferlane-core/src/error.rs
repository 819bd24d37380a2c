use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The watch root could not be monitored. Fatal to that watcher only.
    #[error("failed to watch {path}: {reason}")]
    WatchSetup { path: String, reason: String },

    /// Transient OS-level watch failure. Logged and absorbed by the coalescer.
    #[error("watch runtime error: {0}")]
    WatchRuntime(String),

    /// The work unit itself returned an error or panicked.
    #[error("execution failed: {0}")]
    Execution(String),

    /// The work unit exceeded its deadline.
    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("request cancelled: {0}")]
    Cancelled(String),

    #[error("request id already live: {0}")]
    DuplicateId(String),

    #[error("scheduler is shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
