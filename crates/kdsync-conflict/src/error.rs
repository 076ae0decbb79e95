//! Error types for conflict handling and the blacklist

use kdsync_core::domain::{ConflictKind, ConflictPolicy, DomainError};
use thiserror::Error;

/// Errors that can occur while classifying, resolving or blacklisting
#[derive(Debug, Error)]
pub enum ConflictError {
    /// Conflict not found in repository
    #[error("conflict not found: {0}")]
    NotFound(String),

    /// Conflict already resolved
    #[error("conflict already resolved: {0}")]
    AlreadyResolved(String),

    /// The chosen policy cannot resolve this kind of conflict
    #[error("policy {policy} does not apply to {kind} conflicts")]
    PolicyNotApplicable {
        kind: ConflictKind,
        policy: ConflictPolicy,
    },

    /// Item referenced by a conflict or blacklist operation does not exist
    #[error("item not found: {0}")]
    ItemNotFound(String),

    /// Invalid glob pattern in a conflict rule or exclusion template
    #[error("invalid glob pattern: {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// A domain invariant rejected the operation
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}
