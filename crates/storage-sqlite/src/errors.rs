//! Storage-specific error types for SQLite operations.

use diesel::result::Error as DieselError;
use optionsdesk_acquisition::storage::StoreError;
use thiserror::Error;

/// Errors raised by the SQLite layer.
///
/// Converted to [`StoreError`] at the [`KeyValueStore`](optionsdesk_acquisition::KeyValueStore)
/// boundary.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(#[from] diesel::ConnectionError),

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("Query execution failed: {0}")]
    QueryFailed(#[from] DieselError),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(e) => StoreError::Io(e),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
