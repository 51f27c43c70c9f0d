//! `cadence-store`: durable execution history on embedded SQLite.
//!
//! # Overview
//!
//! Terminal executions are written once to the `executions` table and never
//! updated. Listings are lazy and keyset-paged in `(started_at, id)` order.
//! The same database holds skipped-firing events and the scheduler's
//! evaluation baseline.
//!
//! # Tables
//!
//! | Table             | Contents                                         |
//! |-------------------|--------------------------------------------------|
//! | `executions`      | One row per terminal attempt, report as JSON     |
//! | `skipped_firings` | Due firings dropped while a prior one still ran  |
//! | `state`           | Daemon key/value state (last evaluated instant)  |

pub mod db;
pub mod error;
pub mod sqlite;
pub mod store;

pub use error::{Result, StoreError};
pub use sqlite::SqliteStore;
pub use store::{ExecutionFilter, ExecutionIter, ExecutionStore};
