//! Error types of the placeholder manager

use thiserror::Error;

use kdsync_core::domain::{RelativePath, SessionId, SyncErrorCode, UniqueId};

/// Errors that can occur while hydrating or dehydrating items
#[derive(Debug, Error)]
pub enum PlaceholderError {
    #[error("Item not found: {0}")]
    ItemNotFound(UniqueId),

    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// The item was never uploaded, so there is nothing to fetch
    #[error("Item {0} has no remote counterpart")]
    NoRemoteId(UniqueId),

    #[error("Item {0} is a folder")]
    IsDirectory(UniqueId),

    /// Content could not be fetched; nothing was left at the path
    #[error("Hydration of {path} failed: {detail}")]
    HydrationFailed { path: RelativePath, detail: String },

    /// The item was excluded from sync, its content is not fetched
    #[error("{0} is excluded from sync")]
    Excluded(RelativePath),

    #[error("Cannot dehydrate {path}: {reason}")]
    DehydrationRefused { path: RelativePath, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PlaceholderError {
    /// User-facing code for the hydration and dehydration failures
    #[must_use]
    pub fn error_code(&self) -> Option<SyncErrorCode> {
        match self {
            PlaceholderError::HydrationFailed { path, detail } => {
                Some(SyncErrorCode::HydrationFailed {
                    path: path.clone(),
                    detail: detail.clone(),
                })
            }
            PlaceholderError::DehydrationRefused { path, .. } => {
                Some(SyncErrorCode::DehydrationRefused { path: path.clone() })
            }
            _ => None,
        }
    }
}

/// Callers that speak `std::io` get an `Other` error carrying the message
impl From<PlaceholderError> for std::io::Error {
    fn from(err: PlaceholderError) -> Self {
        match err {
            PlaceholderError::Io(io) => io,
            other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        }
    }
}
