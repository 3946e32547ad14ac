//! Error types for the registry.

use rusqlite::ErrorCode;
use thiserror::Error;

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors that can occur in registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row could not be decoded.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A previous holder of the connection panicked.
    #[error("registry connection lock poisoned")]
    Poisoned,
}

impl RegistryError {
    /// True for failures worth retrying: the database was busy or locked by
    /// another writer.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// True when the failure is a UNIQUE/constraint violation.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            Self::Database(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation
        )
    }
}
