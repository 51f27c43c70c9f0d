//! Shared data types for cadence-runner.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use cadence_core::Task;
use chrono::{DateTime, Utc};

pub use crate::state::MAX_STATE_BYTES;

/// Default wait between SIGTERM and SIGKILL.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// stdout kept in memory per process; a report larger than this is dropped.
pub const MAX_STDOUT_BYTES: usize = 16 * 1024 * 1024;

/// stderr kept at each end of the stream while the process runs.
pub const MAX_STDERR_BYTES: usize = 256 * 1024;

// ---------------------------------------------------------------------------
// ProcessSpec
// ---------------------------------------------------------------------------

/// Everything needed to start one process. Nothing is inherited from the
/// daemon: the environment below is the complete environment of the child.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    /// Written to stdin, which is then closed. `None` closes stdin at once.
    pub stdin: Option<Vec<u8>>,
    /// Previous task state, readable by the task on fd 3.
    pub state: Vec<u8>,
    /// Mandatory; measured from spawn.
    pub timeout: Duration,
    /// Wait between the graceful and the forced termination signal.
    pub kill_grace: Duration,
}

impl ProcessSpec {
    /// Spec for `task` with its own program, arguments and environment.
    pub fn for_task(task: &Task, stdin: Option<Vec<u8>>, kill_grace: Duration) -> Self {
        Self {
            program: task.program.clone(),
            args: task.args.clone(),
            env: task.env.clone(),
            cwd: task.cwd.clone(),
            stdin,
            state: Vec::new(),
            timeout: task.timeout,
            kill_grace,
        }
    }

    /// Offer `state` to the task on fd 3.
    pub fn with_state(mut self, state: Vec<u8>) -> Self {
        self.state = state;
        self
    }

    /// Add one environment variable, replacing any previous value.
    pub fn with_env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.insert(key.to_string(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// ProcessOutcome
// ---------------------------------------------------------------------------

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exited on its own with this status code.
    Exited(i32),
    /// Died from a signal it did not handle, without us sending one.
    Signaled(i32),
    /// Stopped by us after exceeding its timeout. `forced` means the graceful
    /// signal was ignored and SIGKILL was needed.
    TimedOut { forced: bool },
    /// Stopped by us because the caller cancelled it.
    Cancelled { forced: bool },
    /// Could not be started at all.
    SpawnFailed(String),
}

/// Captured result of one process run.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub exit: ProcessExit,
    /// At most [`MAX_STDOUT_BYTES`]; see `stdout_omitted`.
    pub stdout: Vec<u8>,
    /// Bytes of stdout read past the limit and dropped.
    pub stdout_omitted: u64,
    /// Head and tail of stderr when it ran past [`MAX_STDERR_BYTES`].
    pub stderr: Vec<u8>,
    /// What the task wrote on fd 4. `None` when the channel was unavailable
    /// or the task wrote more than [`MAX_STATE_BYTES`].
    pub state: Option<Vec<u8>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pid: Option<u32>,
}

impl ProcessOutcome {
    pub(crate) fn spawn_failed(reason: String, started_at: DateTime<Utc>) -> Self {
        Self {
            exit: ProcessExit::SpawnFailed(reason),
            stdout: Vec::new(),
            stdout_omitted: 0,
            stderr: Vec::new(),
            state: None,
            started_at,
            finished_at: Utc::now(),
            pid: None,
        }
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}
