//! Error types for the cadence-runner crate.

use thiserror::Error;

/// Failures that happen before a process is started.
///
/// A process that cannot be spawned is not an error here: it is reported as
/// [`crate::ProcessExit::SpawnFailed`] so the dispatcher can record it.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The parameter payload could not be serialized in the requested format.
    #[error("Cannot encode parameters as {format}: {reason}")]
    Encode { format: &'static str, reason: String },

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, RunnerError>;
