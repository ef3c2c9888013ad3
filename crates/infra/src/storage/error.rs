//! Storage engine errors.

use thiserror::Error;

use jobvault_core::JobError;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Local scratch file I/O failed.
    #[error("storage i/o failure: {0}")]
    Io(String),

    /// Stored lengths disagree with the bytes actually present.
    #[error("corrupt stored data: {0}")]
    Corrupt(String),

    #[error("storage key not found: {0}")]
    NotFound(String),

    /// Duplicate head, use after close, or similar sequencing mistakes.
    #[error("illegal storage state: {0}")]
    IllegalState(String),

    #[error("storage database failure: {0}")]
    Database(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        // errors raised by the reader's AsyncRead come back unchanged
        match err.get_ref().and_then(|inner| inner.downcast_ref::<StorageError>()) {
            Some(inner) => inner.clone(),
            None => StorageError::Io(err.to_string()),
        }
    }
}

impl From<StorageError> for std::io::Error {
    fn from(err: StorageError) -> Self {
        let kind = match err {
            StorageError::Corrupt(_) => std::io::ErrorKind::InvalidData,
            StorageError::NotFound(_) => std::io::ErrorKind::NotFound,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

impl From<StorageError> for JobError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => JobError::not_found(format!("storage key [{key}]")),
            StorageError::IllegalState(msg) => JobError::illegal_state(msg),
            other => JobError::storage(other.to_string()),
        }
    }
}

/// Map a SQLx error from `operation` onto the storage error taxonomy.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string());
            let msg = format!(
                "database error in {} [{}]: {}",
                operation,
                code.as_deref().unwrap_or("-"),
                db_err.message()
            );

            match code.as_deref() {
                // unique violation
                Some("23505") => StorageError::IllegalState(msg),
                _ => StorageError::Database(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StorageError::Database(format!("connection pool closed in {}", operation))
        }
        _ => StorageError::Database(format!("sqlx error in {}: {}", operation, err)),
    }
}
