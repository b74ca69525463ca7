use crate::types::RowId;
use std::time::Duration;
use thiserror::Error;

/// Result type alias used throughout the store.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the object store.
///
/// Every mutation error aborts only the enclosing write transaction. Committed
/// state is never affected by a failed commit.
#[derive(Debug, Error)]
pub enum Error {
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("unknown object type: {0}")]
    UnknownType(String),

    #[error("duplicate primary key {key} in {object_type}")]
    DuplicateKey { object_type: String, key: String },

    #[error("{object_type} row {row} not found")]
    NotFound { object_type: String, row: RowId },

    #[error("{object_type} row {owner} field {field} references missing {target_type} row {target}")]
    DanglingReference {
        object_type: String,
        owner: RowId,
        field: String,
        target_type: String,
        target: RowId,
    },

    #[error("storage fault: {0}")]
    StorageFault(#[from] std::io::Error),

    #[error("database file is corrupted: {0}")]
    Corrupted(String),

    #[error("database is full ({capacity} bytes mapped)")]
    DatabaseFull { capacity: u64 },

    #[error("record of {size} bytes exceeds the {max} byte limit")]
    RecordTooLarge { size: usize, max: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("timed out after {0:?} waiting for the write lock")]
    WriteLockTimeout(Duration),
}
