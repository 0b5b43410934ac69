//! Error types for the storage module.

use thiserror::Error;

/// Errors returned by object store operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No object exists at the path.
    #[error("Object not found: {path}")]
    NotFound { path: String },

    /// The path cannot be mapped into the store.
    #[error("Invalid object path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    /// Backend specific failure.
    #[error("Storage backend error: {reason}")]
    Backend { reason: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Creates a new invalid path error.
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new backend error.
    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend {
            reason: reason.into(),
        }
    }

    /// Whether this error means the object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
