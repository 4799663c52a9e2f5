//! Error types for the storage crate.

use thiserror::Error;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Storage error types.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Backend/database error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Not found error.
    #[error("resource not found: {0}")]
    NotFound(String),
}

impl From<Error> for canopy_core::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => canopy_core::Error::Storage(e.to_string()),
            Error::Serialization(s) => canopy_core::Error::Serialization(s),
            Error::Storage(s) => canopy_core::Error::Storage(s),
            Error::NotFound(s) => canopy_core::Error::NotFound(s),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Error::Storage(format!("redb transaction error: {e}"))
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        Error::Storage(format!("redb table error: {e}"))
    }
}

impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Self {
        Error::Storage(format!("redb storage error: {e}"))
    }
}

impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Self {
        Error::Storage(format!("redb commit error: {e}"))
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Error::Storage(format!("redb database error: {e}"))
    }
}
