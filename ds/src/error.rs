//! Store error types

use thiserror::Error;

/// Errors surfaced by store primitives
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("task execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("event sequence conflict for run {run_id} at seq {seq}")]
    SeqConflict { run_id: String, seq: i64 },

    #[error("run {0} is terminal; write rejected")]
    RunTerminal(String),

    #[error("invalid stored value for {field}: {value}")]
    InvalidColumn { field: &'static str, value: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Whether a rusqlite error is a unique/constraint violation
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}
