use cadence_core::{Execution, ExecutionId, ExecutionStatus, SkippedFiring};
use chrono::{DateTime, Utc};

use crate::error::Result;

/// Lazy, finite listing of executions in `(started_at, id)` order.
pub type ExecutionIter<'a> = Box<dyn Iterator<Item = Result<Execution>> + Send + 'a>;

/// Durable record of terminal executions.
///
/// Implementations must make `put` atomic for readers: a concurrent `get` or
/// `list` sees either nothing or the complete record.
pub trait ExecutionStore: Send + Sync {
    /// Persist a terminal execution. Returns `false` when a record with the
    /// same id already exists; the stored record is never overwritten.
    fn put(&self, execution: &Execution) -> Result<bool>;

    fn get(&self, id: &ExecutionId) -> Result<Option<Execution>>;

    /// Executions matching `filter`. Each call starts a fresh listing bounded
    /// by what was stored when it was called.
    fn list(&self, filter: ExecutionFilter) -> Result<ExecutionIter<'_>>;

    /// Delete executions (and skip events) that started before `cutoff`.
    /// The only destructive operation.
    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    fn record_skip(&self, skip: &SkippedFiring) -> Result<()>;

    /// Most recent skip events first.
    fn list_skips(&self, task: Option<&str>, limit: usize) -> Result<Vec<SkippedFiring>>;

    /// Last instant the scheduler finished evaluating, if any.
    fn load_baseline(&self) -> Result<Option<DateTime<Utc>>>;

    fn save_baseline(&self, instant: DateTime<Utc>) -> Result<()>;

    /// State the task committed on its last successful execution.
    fn load_task_state(&self, task: &str) -> Result<Option<Vec<u8>>>;

    /// Replace the committed state of `task`.
    fn save_task_state(&self, task: &str, state: &[u8]) -> Result<()>;
}

/// Which executions a listing yields. Every field narrows the result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionFilter {
    pub task: Option<String>,
    pub status: Option<ExecutionStatus>,
    /// Inclusive lower bound on `started_at`.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `started_at`.
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ExecutionFilter {
    pub fn for_task(task: &str) -> Self {
        Self {
            task: Some(task.to_string()),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
