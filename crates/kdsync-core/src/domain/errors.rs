//! Domain error types
//!
//! Validation failures, invalid state transitions and path errors raised
//! while constructing or mutating domain entities.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid absolute path
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Invalid path relative to a session root
    #[error("Invalid relative path: {0}")]
    InvalidRelativePath(String),

    /// Invalid content hash
    #[error("Invalid hash format: {0}")]
    InvalidHash(String),

    /// Invalid state transition attempt
    #[error("Invalid state transition from {from} to {to}")]
    InvalidState {
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Path is not within the session root
    #[error("Path not within sync root: {0}")]
    PathNotInSyncRoot(String),

    /// Invalid remote root path
    #[error("Invalid remote path: {0}")]
    InvalidRemotePath(String),

    /// Invalid remote ID
    #[error("Invalid remote ID: {0}")]
    InvalidRemoteId(String),

    /// Invalid change feed cursor
    #[error("Invalid change cursor: {0}")]
    InvalidCursor(String),

    /// ID parsing error
    #[error("Invalid ID format: {0}")]
    InvalidId(String),

    /// Unknown enum tag read back from storage or configuration
    #[error("Unknown {kind}: {value}")]
    UnknownVariant {
        /// Name of the enum being parsed
        kind: &'static str,
        /// The offending value
        value: String,
    },
}
