//! Process exit statuses.
//!
//! A supervisor restarts on `1`. `78` and `69` mean restarting will not help
//! until an operator fixes the configuration or the store location.

use cadence_core::{CadenceError, Execution, ExecutionStatus};
use cadence_store::StoreError;
use thiserror::Error;

/// EX_CONFIG: configuration or task registry invalid.
pub const EX_CONFIG: u8 = 78;
/// EX_UNAVAILABLE: the result store could not be opened.
pub const EX_UNAVAILABLE: u8 = 69;
/// Any other failure.
pub const EX_FAILURE: u8 = 1;
/// Ad-hoc run exceeded its timeout.
pub const EX_TIMEOUT: u8 = 124;
/// Ad-hoc program could not be started.
pub const EX_NOT_STARTED: u8 = 127;

/// Failures that happen before any task runs and need operator action.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration invalid: {0}")]
    Config(#[from] CadenceError),

    #[error("result store unavailable: {0}")]
    Store(#[from] StoreError),
}

/// Exit status for an error that ended the command.
pub fn for_error(error: &anyhow::Error) -> u8 {
    match error.downcast_ref::<StartupError>() {
        Some(StartupError::Config(_)) => EX_CONFIG,
        Some(StartupError::Store(_)) => EX_UNAVAILABLE,
        None => EX_FAILURE,
    }
}

/// Exit status mirroring how an ad-hoc execution ended.
pub fn for_execution(execution: &Execution) -> u8 {
    match execution.status {
        ExecutionStatus::Succeeded => 0,
        ExecutionStatus::TimedOut => EX_TIMEOUT,
        ExecutionStatus::Failed => execution
            .exit_code
            .and_then(|code| u8::try_from(code).ok())
            .filter(|code| *code != 0)
            .unwrap_or(EX_FAILURE),
        ExecutionStatus::Crashed => match execution.signal {
            Some(signal) => u8::try_from(128 + signal).unwrap_or(EX_FAILURE),
            None => EX_NOT_STARTED,
        },
        ExecutionStatus::Pending | ExecutionStatus::Running => EX_FAILURE,
    }
}
