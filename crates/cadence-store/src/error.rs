use thiserror::Error;

/// Errors that can occur within the result store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A report or timestamp column could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Only terminal executions are persisted.
    #[error("Execution {id} is not terminal ({status})")]
    NotTerminal { id: String, status: String },

    /// A stored row no longer decodes into an execution.
    #[error("Corrupt row {id}: {reason}")]
    Corrupt { id: String, reason: String },

    /// The database file or its directory could not be prepared.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store is temporarily unable to accept writes.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
