//! Error types for the coffer-store crate.
//!
//! All storage operations return [`StoreError`] via [`StoreResult`].
//! Callers that only care about the broad failure class can match on
//! [`StoreError::code`] instead of individual variants.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the storage engine.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An argument or the existing value at a path has the wrong kind.
    #[error("invalid type at `{path}`: {reason}")]
    InvalidType { path: String, reason: String },

    /// A path is malformed or conflicts with the document structure.
    #[error("invalid path `{path}`: {reason}")]
    InvalidPath { path: String, reason: String },

    /// Filesystem I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A configuration file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// A schema migration failed.
    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    /// The backing document file exists but cannot be used.
    #[error("corrupt data file {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    /// The remote document store rejected or failed a request.
    #[error("remote store error: {0}")]
    Remote(String),

    /// A remote call did not complete within its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// A remote call was aborted through its cancellation token.
    #[error("{operation} was cancelled")]
    Cancelled { operation: &'static str },

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),

    /// A thread panicked while holding the named lock.
    #[error("{what} lock poisoned")]
    LockPoisoned { what: &'static str },
}

/// Broad failure classes surfaced to store consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Wrong kind of argument or existing value.
    InvalidType,
    /// Structural conflict while descending a path.
    InvalidPath,
    /// File, database or remote-call failure.
    StorageIo,
}

impl StoreError {
    /// Classify this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidType { .. } => ErrorCode::InvalidType,
            Self::InvalidPath { .. } => ErrorCode::InvalidPath,
            _ => ErrorCode::StorageIo,
        }
    }

    pub(crate) fn invalid_type(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidType {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

impl From<toml::de::Error> for StoreError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_taxonomy() {
        assert_eq!(
            StoreError::invalid_type("a.b", "not a number").code(),
            ErrorCode::InvalidType
        );
        assert_eq!(
            StoreError::invalid_path("a.b", "a is a number").code(),
            ErrorCode::InvalidPath
        );
        let timeout = StoreError::Timeout {
            operation: "fetch",
            after: Duration::from_millis(10),
        };
        assert_eq!(timeout.code(), ErrorCode::StorageIo);
        assert_eq!(
            StoreError::Cancelled { operation: "apply" }.code(),
            ErrorCode::StorageIo
        );
        let poisoned = StoreError::LockPoisoned { what: "document tree" };
        assert_eq!(poisoned.code(), ErrorCode::StorageIo);
        assert_eq!(poisoned.to_string(), "document tree lock poisoned");
    }

    #[test]
    fn display_includes_path() {
        let err = StoreError::invalid_type("g1.u1.money", "existing value is a string");
        assert_eq!(
            err.to_string(),
            "invalid type at `g1.u1.money`: existing value is a string"
        );
    }
}
