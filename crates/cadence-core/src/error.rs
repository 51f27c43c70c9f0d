use thiserror::Error;

use cadence_schedule::ScheduleError;

#[derive(Debug, Error)]
pub enum CadenceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task `{task}` is invalid: {reason}")]
    InvalidTask { task: String, reason: String },

    #[error("Task `{task}` has an invalid schedule: {source}")]
    Schedule {
        task: String,
        #[source]
        source: ScheduleError,
    },

    #[error("Task `{task}`: executable `{program}` not found on the configured PATH")]
    ExecutableNotFound { task: String, program: String },

    #[error("Unknown task: {0}")]
    UnknownTask(String),
}

impl CadenceError {
    /// Stable short code, printed by the CLI next to the message.
    pub fn code(&self) -> &'static str {
        match self {
            CadenceError::Config(_) => "CONFIG_ERROR",
            CadenceError::InvalidTask { .. } => "INVALID_TASK",
            CadenceError::Schedule { .. } => "INVALID_SCHEDULE",
            CadenceError::ExecutableNotFound { .. } => "EXECUTABLE_NOT_FOUND",
            CadenceError::UnknownTask(_) => "UNKNOWN_TASK",
        }
    }
}

pub type Result<T> = std::result::Result<T, CadenceError>;
