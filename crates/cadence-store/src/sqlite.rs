//! [`ExecutionStore`] on an embedded SQLite database.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use cadence_core::{Execution, ExecutionId, ExecutionStatus, Report, SkippedFiring};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::db::init_db;
use crate::error::{Result, StoreError};
use crate::store::{ExecutionFilter, ExecutionIter, ExecutionStore};

/// Rows fetched per round trip while a listing is consumed.
const PAGE_SIZE: usize = 256;

const BASELINE_KEY: &str = "scheduler.last_evaluated";

const EXECUTION_COLUMNS: &str = "id, task, attempt, status, scheduled_for, started_at, finished_at,
     exit_code, signal, report, contract_violation, stderr, cancelled";

/// Result store backed by one SQLite connection.
///
/// SQLite admits one writer at a time, so all access goes through a single
/// connection behind a mutex. Every `put` runs in its own transaction.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA busy_timeout=5000;")?;
        info!(path = %path.display(), "result store opened");
        Self::new(conn)
    }

    /// Fresh private database, mainly for tests and unrecorded ad-hoc runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot_seq(&self) -> Result<i64> {
        let db = self.lock();
        let seq: Option<i64> = db.query_row("SELECT MAX(seq) FROM executions", [], |row| row.get(0))?;
        Ok(seq.unwrap_or(0))
    }

    /// One page of the listing, strictly after `cursor` in listing order.
    fn page(
        &self,
        filter: &ExecutionFilter,
        snapshot_seq: i64,
        cursor: Option<&(String, String)>,
        limit: usize,
    ) -> Result<Vec<Execution>> {
        let mut sql = format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE seq <= ?");
        let mut args: Vec<Value> = vec![Value::Integer(snapshot_seq)];

        if let Some(task) = &filter.task {
            sql.push_str(" AND task = ?");
            args.push(Value::Text(task.clone()));
        }
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            args.push(Value::Text(status.to_string()));
        }
        if let Some(since) = filter.since {
            sql.push_str(" AND started_at >= ?");
            args.push(Value::Text(encode_time(&since)));
        }
        if let Some(until) = filter.until {
            sql.push_str(" AND started_at < ?");
            args.push(Value::Text(encode_time(&until)));
        }
        if let Some((started_at, id)) = cursor {
            sql.push_str(" AND (started_at > ? OR (started_at = ? AND id > ?))");
            args.push(Value::Text(started_at.clone()));
            args.push(Value::Text(started_at.clone()));
            args.push(Value::Text(id.clone()));
        }
        sql.push_str(" ORDER BY started_at, id LIMIT ?");
        args.push(Value::Integer(limit as i64));

        let db = self.lock();
        let mut stmt = db.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args), read_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(StoredRow::into_execution).collect()
    }
}

impl ExecutionStore for SqliteStore {
    fn put(&self, execution: &Execution) -> Result<bool> {
        if !execution.is_terminal() {
            return Err(StoreError::NotTerminal {
                id: execution.id.to_string(),
                status: execution.status.to_string(),
            });
        }
        let report = execution.report.as_ref().map(serde_json::to_string).transpose()?;

        let mut db = self.lock();
        let tx = db.transaction().map_err(write_error)?;
        let inserted = tx.execute(
            "INSERT INTO executions (id, task, attempt, status, scheduled_for, started_at,
             finished_at, exit_code, signal, report, contract_violation, stderr, cancelled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(id) DO NOTHING",
            params![
                execution.id.as_str(),
                execution.task,
                execution.attempt,
                execution.status.to_string(),
                execution.scheduled_for.as_ref().map(encode_time),
                encode_time(&execution.started_at),
                execution.finished_at.as_ref().map(encode_time),
                execution.exit_code,
                execution.signal,
                report,
                execution.contract_violation,
                execution.stderr,
                execution.cancelled,
            ],
        )
        .map_err(write_error)?;
        tx.commit().map_err(write_error)?;

        if inserted == 0 {
            debug!(execution_id = %execution.id, "execution already stored");
        }
        Ok(inserted > 0)
    }

    fn get(&self, id: &ExecutionId) -> Result<Option<Execution>> {
        let db = self.lock();
        let row = db
            .query_row(
                &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1"),
                params![id.as_str()],
                read_row,
            )
            .optional()?;
        drop(db);
        row.map(StoredRow::into_execution).transpose()
    }

    fn list(&self, filter: ExecutionFilter) -> Result<ExecutionIter<'_>> {
        let snapshot_seq = self.snapshot_seq()?;
        Ok(Box::new(ExecutionPages {
            store: self,
            remaining: filter.limit,
            filter,
            snapshot_seq,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }))
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff = encode_time(&cutoff);
        let mut db = self.lock();
        let tx = db.transaction()?;
        let executions = tx.execute("DELETE FROM executions WHERE started_at < ?1", params![cutoff])?;
        let skips = tx.execute("DELETE FROM skipped_firings WHERE due_at < ?1", params![cutoff])?;
        tx.commit()?;
        info!(executions, skips, cutoff = %cutoff, "purged old records");
        Ok(executions)
    }

    fn record_skip(&self, skip: &SkippedFiring) -> Result<()> {
        let db = self.lock();
        db.execute(
            "INSERT INTO skipped_firings (task, due_at, skipped_at, blocking_execution)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                skip.task,
                encode_time(&skip.due_at),
                encode_time(&skip.skipped_at),
                skip.blocking_execution.as_ref().map(ExecutionId::as_str),
            ],
        )
        .map_err(write_error)?;
        Ok(())
    }

    fn list_skips(&self, task: Option<&str>, limit: usize) -> Result<Vec<SkippedFiring>> {
        let db = self.lock();
        let mut stmt = db.prepare(
            "SELECT task, due_at, skipped_at, blocking_execution FROM skipped_firings
             WHERE (?1 IS NULL OR task = ?1)
             ORDER BY seq DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![task, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(task, due_at, skipped_at, blocking)| {
                Ok(SkippedFiring {
                    due_at: decode_time(&task, &due_at)?,
                    skipped_at: decode_time(&task, &skipped_at)?,
                    blocking_execution: blocking.map(ExecutionId::from),
                    task,
                })
            })
            .collect()
    }

    fn load_baseline(&self) -> Result<Option<DateTime<Utc>>> {
        let db = self.lock();
        let value: Option<String> = db
            .query_row("SELECT value FROM state WHERE key = ?1", params![BASELINE_KEY], |row| row.get(0))
            .optional()?;
        value.map(|v| decode_time(BASELINE_KEY, &v)).transpose()
    }

    fn save_baseline(&self, instant: DateTime<Utc>) -> Result<()> {
        let db = self.lock();
        db.execute(
            "INSERT INTO state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![BASELINE_KEY, encode_time(&instant)],
        )
        .map_err(write_error)?;
        Ok(())
    }

    fn load_task_state(&self, task: &str) -> Result<Option<Vec<u8>>> {
        let db = self.lock();
        Ok(db
            .query_row("SELECT value FROM task_state WHERE task = ?1", params![task], |row| row.get(0))
            .optional()?)
    }

    fn save_task_state(&self, task: &str, state: &[u8]) -> Result<()> {
        let db = self.lock();
        db.execute(
            "INSERT INTO task_state (task, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(task) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![task, state, encode_time(&Utc::now())],
        )
        .map_err(write_error)?;
        debug!(task, bytes = state.len(), "task state committed");
        Ok(())
    }
}

/// Writes that fail because the database is busy, locked, full or its
/// disk errored can succeed later; report them as such.
fn write_error(e: rusqlite::Error) -> StoreError {
    use rusqlite::ErrorCode;
    match e.sqlite_error_code() {
        Some(
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::DiskFull
            | ErrorCode::SystemIoFailure
            | ErrorCode::CannotOpen
            | ErrorCode::ReadOnly,
        ) => StoreError::Unavailable(e.to_string()),
        _ => StoreError::Database(e),
    }
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// Keyset-paged iterator. Rows inserted after the listing started have a
/// higher `seq` and are never yielded, so the sequence is finite.
struct ExecutionPages<'a> {
    store: &'a SqliteStore,
    filter: ExecutionFilter,
    snapshot_seq: i64,
    /// `(started_at, id)` of the last row yielded.
    cursor: Option<(String, String)>,
    buffer: VecDeque<Execution>,
    remaining: Option<usize>,
    exhausted: bool,
}

impl Iterator for ExecutionPages<'_> {
    type Item = Result<Execution>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == Some(0) {
            return None;
        }
        if self.buffer.is_empty() && !self.exhausted {
            let page_size = self.remaining.map_or(PAGE_SIZE, |r| r.min(PAGE_SIZE));
            match self
                .store
                .page(&self.filter, self.snapshot_seq, self.cursor.as_ref(), page_size)
            {
                Ok(page) => {
                    self.exhausted = page.len() < page_size;
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }

        let execution = self.buffer.pop_front()?;
        self.cursor = Some((encode_time(&execution.started_at), execution.id.to_string()));
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(Ok(execution))
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

struct StoredRow {
    id: String,
    task: String,
    attempt: u32,
    status: String,
    scheduled_for: Option<String>,
    started_at: String,
    finished_at: Option<String>,
    exit_code: Option<i32>,
    signal: Option<i32>,
    report: Option<String>,
    contract_violation: Option<String>,
    stderr: String,
    cancelled: bool,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRow> {
    Ok(StoredRow {
        id: row.get(0)?,
        task: row.get(1)?,
        attempt: row.get(2)?,
        status: row.get(3)?,
        scheduled_for: row.get(4)?,
        started_at: row.get(5)?,
        finished_at: row.get(6)?,
        exit_code: row.get(7)?,
        signal: row.get(8)?,
        report: row.get(9)?,
        contract_violation: row.get(10)?,
        stderr: row.get(11)?,
        cancelled: row.get(12)?,
    })
}

impl StoredRow {
    fn into_execution(self) -> Result<Execution> {
        let status: ExecutionStatus = self.status.parse().map_err(|reason| StoreError::Corrupt {
            id: self.id.clone(),
            reason,
        })?;
        let report: Option<Report> = self.report.as_deref().map(serde_json::from_str).transpose()?;
        Ok(Execution {
            scheduled_for: self.scheduled_for.as_deref().map(|t| decode_time(&self.id, t)).transpose()?,
            started_at: decode_time(&self.id, &self.started_at)?,
            finished_at: self.finished_at.as_deref().map(|t| decode_time(&self.id, t)).transpose()?,
            id: ExecutionId::from(self.id),
            task: self.task,
            attempt: self.attempt,
            status,
            exit_code: self.exit_code,
            signal: self.signal,
            report,
            contract_violation: self.contract_violation,
            stderr: self.stderr,
            cancelled: self.cancelled,
        })
    }
}

/// Fixed-width UTC text, so string order equals time order.
fn encode_time(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_time(id: &str, text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            id: id.to_string(),
            reason: format!("bad timestamp `{text}`: {e}"),
        })
}
