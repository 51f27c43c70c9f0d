//! cadence-runner: runs task executables under the calling contract.
//!
//! - [`process`]: the [`ProcessRunner`] interface and its OS implementation
//!   (process groups, cleared environment, timeout, SIGTERM then SIGKILL)
//! - [`contract`]: parameter encoding, report parsing, status classification
//! - [`state`]: the fd 3 / fd 4 task state channel

pub mod contract;
pub mod error;
pub mod process;
pub mod state;
pub mod truncate;
pub mod types;

pub use error::{Result, RunnerError};
pub use process::{OsProcessRunner, ProcessRunner};
pub use types::{
    ProcessExit, ProcessOutcome, ProcessSpec, DEFAULT_KILL_GRACE, MAX_STATE_BYTES, MAX_STDERR_BYTES,
    MAX_STDOUT_BYTES,
};
