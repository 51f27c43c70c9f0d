//! Shared data types for the cadence workspace.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use cadence_schedule::Schedule;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A validated, ready-to-run task. Immutable once placed in a registry.
#[derive(Debug, Clone)]
pub struct Task {
    /// Stable identifier; unique within a registry, never contains `/`.
    pub name: String,
    /// Absolute path of the executable, resolved against the configured `PATH`.
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Complete environment of the spawned process (global `[env]` plus overlay).
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub schedule: Schedule,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub enabled: bool,
    pub params: Option<ParamPayload>,
    pub report_format: ReportFormat,
}

impl Task {
    /// A disabled, never-due task for one-off runs of an arbitrary program.
    pub fn adhoc(
        name: &str,
        program: PathBuf,
        args: Vec<String>,
        env: BTreeMap<String, String>,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.to_string(),
            program,
            args,
            env,
            cwd: None,
            // Already in the past, so it is never due.
            schedule: Schedule::Once {
                at: DateTime::<Utc>::UNIX_EPOCH,
            },
            timeout,
            retry: RetryPolicy::default(),
            enabled: false,
            params: None,
            report_format: ReportFormat::Auto,
        }
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// How many times a failing task is attempted and how long to wait in between.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first; `1` disables retries.
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Spawn failures are final unless this is set.
    pub retry_on_spawn_error: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Fixed(Duration::from_secs(1)),
            retry_on_spawn_error: false,
        }
    }
}

/// Shape of the delay between consecutive attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed(Duration),
    /// `initial * multiplier^(attempt - 1)`, capped at `max`.
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl Backoff {
    /// Delay to wait after `failed_attempt` (1-based) before the next one.
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let exponent = failed_attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let secs = initial.as_secs_f64() * multiplier.powi(exponent);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    *max
                } else {
                    Duration::from_secs_f64(secs.max(0.0))
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Contract formats
// ---------------------------------------------------------------------------

/// Serialization used for the parameter payload written to a task's stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamFormat {
    #[default]
    Json,
    Toml,
    Yaml,
}

/// How a task's stdout is interpreted as a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    /// Try JSON, then TOML, then YAML.
    #[default]
    Auto,
    Json,
    Toml,
    Yaml,
    /// Keep stdout as raw text without attempting to parse it.
    None,
}

/// Parameters handed to a task on stdin.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamPayload {
    /// Written verbatim.
    Raw(String),
    /// Serialized in `format` before being written.
    Structured {
        value: serde_json::Value,
        format: ParamFormat,
    },
}

// ---------------------------------------------------------------------------
// ExecutionId
// ---------------------------------------------------------------------------

/// `"{task}/{uuid-v7}"`: the task id plus a time-ordered, process-monotonic
/// component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new(task: &str) -> Self {
        Self(format!("{task}/{}", Uuid::now_v7()))
    }

    /// Task component of the id.
    pub fn task(&self) -> &str {
        self.0.rsplit_once('/').map(|(task, _)| task).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ExecutionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ExecutionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Lifecycle state of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Crashed,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    /// Terminal states the retry policy reacts to.
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Failed | ExecutionStatus::TimedOut | ExecutionStatus::Crashed
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::TimedOut => "timed_out",
            ExecutionStatus::Crashed => "crashed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "succeeded" => Ok(ExecutionStatus::Succeeded),
            "failed" => Ok(ExecutionStatus::Failed),
            "timed_out" => Ok(ExecutionStatus::TimedOut),
            "crashed" => Ok(ExecutionStatus::Crashed),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Structured result a task printed on stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "content", rename_all = "snake_case")]
pub enum Report {
    /// Parsed mapping or sequence, normalised to JSON.
    Structured(serde_json::Value),
    /// stdout that did not parse in the expected format.
    Unstructured(String),
}

/// One attempt of one task. Terminal records are written to the store once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub task: String,
    /// 1-based; strictly increasing across retries of one firing.
    pub attempt: u32,
    pub status: ExecutionStatus,
    /// Due instant that triggered the firing; absent for ad-hoc runs.
    pub scheduled_for: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    /// Signal that ended the process, when it did not exit on its own.
    pub signal: Option<i32>,
    pub report: Option<Report>,
    /// Why stdout was not accepted as a structured report.
    pub contract_violation: Option<String>,
    pub stderr: String,
    /// Set when the attempt was stopped by cancellation rather than its timeout.
    pub cancelled: bool,
}

impl Execution {
    /// A fresh attempt, marked running as of now.
    pub fn begin(task: &str, attempt: u32, scheduled_for: Option<DateTime<Utc>>) -> Self {
        Self {
            id: ExecutionId::new(task),
            task: task.to_string(),
            attempt,
            status: ExecutionStatus::Running,
            scheduled_for,
            started_at: Utc::now(),
            finished_at: None,
            exit_code: None,
            signal: None,
            report: None,
            contract_violation: None,
            stderr: String::new(),
            cancelled: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }
}

/// A due firing that was dropped because the previous one was still running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedFiring {
    pub task: String,
    pub due_at: DateTime<Utc>,
    pub skipped_at: DateTime<Utc>,
    /// Execution that was still in flight.
    pub blocking_execution: Option<ExecutionId>,
}
