//! Error types for collecte-core

use rusqlite::ErrorCode;
use thiserror::Error;

/// Main error type for the collecte-core library
#[derive(Error, Debug)]
pub enum Error {
    /// The store could not be opened or migrated because another connection holds it
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Duplicate key on a create-only insert
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Device storage limit reached
    #[error("storage quota exceeded")]
    QuotaExceeded,

    /// Database error that does not fall into one of the categories above
    #[error("database error: {0}")]
    Database(rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Entity not found
    #[error("entity not found: {0}")]
    EntityNotFound(i64),

    /// No response from the remote endpoint (connect error, timeout, retries exhausted)
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// The remote endpoint answered with a non-success status
    #[error("server rejected request ({status}): {body}")]
    ServerRejected { status: u16, body: String },

    /// A single mapping entry could not be applied (never fatal to a flush)
    #[error("mapping apply failure: {0}")]
    MappingApplyFailure(String),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => Error::ConstraintViolation(err.to_string()),
            Some(ErrorCode::DiskFull) => Error::QuotaExceeded,
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                Error::StoreUnavailable(err.to_string())
            }
            _ => Error::Database(err),
        }
    }
}

impl Error {
    /// Whether the failure means no response was obtained from the network
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::TransportFailure(_))
    }
}

/// Result type alias for collecte-core
pub type Result<T> = std::result::Result<T, Error>;
