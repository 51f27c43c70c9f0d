use cadence_core::CadenceError;
use cadence_store::StoreError;
use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Registry error: {0}")]
    Registry(#[from] CadenceError),

    /// A firing of this task is still queued, running or waiting to retry.
    #[error("Task already in flight: {task}")]
    AlreadyRunning { task: String },

    /// The dispatcher stopped before the execution could start.
    #[error("Dispatcher is shutting down")]
    ShuttingDown,

    /// The task driving an execution panicked or was aborted.
    #[error("Execution task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
