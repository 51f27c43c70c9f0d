use rusqlite::Connection;

use crate::error::Result;

/// Initialise the result-store schema in `conn`.
///
/// `seq` is an insertion counter: listings are bounded by the highest `seq`
/// seen when they start, so a listing never grows while it is consumed.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS executions (
            seq                 INTEGER PRIMARY KEY AUTOINCREMENT,
            id                  TEXT    NOT NULL UNIQUE,   -- task/uuid-v7
            task                TEXT    NOT NULL,
            attempt             INTEGER NOT NULL,
            status              TEXT    NOT NULL,
            scheduled_for       TEXT,                      -- RFC 3339 or NULL (ad-hoc)
            started_at          TEXT    NOT NULL,          -- RFC 3339, UTC, fixed width
            finished_at         TEXT,
            exit_code           INTEGER,
            signal              INTEGER,
            report              TEXT,                      -- JSON-encoded Report
            contract_violation  TEXT,
            stderr              TEXT    NOT NULL DEFAULT '',
            cancelled           INTEGER NOT NULL DEFAULT 0
        ) STRICT;

        -- Listing order: started_at, then id
        CREATE INDEX IF NOT EXISTS idx_executions_started ON executions (started_at, id);
        CREATE INDEX IF NOT EXISTS idx_executions_task ON executions (task, started_at, id);

        CREATE TABLE IF NOT EXISTS skipped_firings (
            seq                 INTEGER PRIMARY KEY AUTOINCREMENT,
            task                TEXT    NOT NULL,
            due_at              TEXT    NOT NULL,
            skipped_at          TEXT    NOT NULL,
            blocking_execution  TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_skipped_task ON skipped_firings (task, due_at);

        -- Small daemon state, e.g. the scheduler's last evaluated instant
        CREATE TABLE IF NOT EXISTS state (
            key     TEXT NOT NULL PRIMARY KEY,
            value   TEXT NOT NULL
        ) STRICT;

        -- What each task last wrote on fd 4 and exited 0; never purged
        CREATE TABLE IF NOT EXISTS task_state (
            task        TEXT NOT NULL PRIMARY KEY,
            value       BLOB NOT NULL,
            updated_at  TEXT NOT NULL
        ) STRICT;
        ",
    )?;
    Ok(())
}
