//! Error types of the sync engine
//!
//! [`SyncError`] is returned by the command API and the session loop.
//! Failures of individual actions never surface as `SyncError`: they are
//! classified into an [`ActionFailure`] that tells the session consumer
//! whether to retry, blacklist the item or pause the session.

use std::path::PathBuf;

use thiserror::Error;

use kdsync_conflict::ConflictError;
use kdsync_core::domain::{
    BlacklistReason, ConflictId, DomainError, RelativePath, SessionId, SyncErrorCode, UniqueId,
};
use kdsync_core::ports::RemoteError;
use kdsync_litesync::PlaceholderError;

/// Errors that can occur in the sync engine and its command API
#[derive(Debug, Error)]
pub enum SyncError {
    /// An I/O error occurred outside of an action
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Unknown session
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// Unknown item
    #[error("Item not found: {0}")]
    ItemNotFound(UniqueId),

    /// Unknown conflict
    #[error("Conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    /// The new root contains, or is contained by, an existing session root
    #[error("{path} nests with the root of session {existing}")]
    NestedSession { path: PathBuf, existing: PathBuf },

    /// The session is being removed
    #[error("Session {0} is being deleted")]
    SessionBeingDeleted(SessionId),

    /// The local root is missing or unreadable
    #[error("Sync root unavailable: {0}")]
    RootUnavailable(PathBuf),

    /// `confirm_large_folder` on an item that is not waiting for it
    #[error("Item {0} is not awaiting large-folder confirmation")]
    NotPendingConfirmation(UniqueId),

    /// `exclude_folder` refused; nothing was removed
    #[error("Cannot exclude {path}: {reason}")]
    CannotExclude { path: RelativePath, reason: String },

    /// A domain-level error propagated from kdsync-core
    #[error("Domain error: {0}")]
    DomainError(#[from] DomainError),

    /// Conflict or blacklist handling failed
    #[error("Conflict error: {0}")]
    ConflictError(#[from] ConflictError),

    /// Lite Sync operation failed
    #[error("Placeholder error: {0}")]
    PlaceholderError(#[from] PlaceholderError),

    /// Store or adapter failure
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    /// User-facing error code, for errors that have one
    #[must_use]
    pub fn error_code(&self) -> Option<SyncErrorCode> {
        match self {
            SyncError::NestedSession { path, existing } => Some(SyncErrorCode::NestedSession {
                path: path.display().to_string(),
                existing: existing.display().to_string(),
            }),
            SyncError::SessionBeingDeleted(_) => Some(SyncErrorCode::SessionBeingDeleted),
            SyncError::RootUnavailable(path) => Some(SyncErrorCode::SyncRootUnavailable {
                path: path.display().to_string(),
            }),
            _ => None,
        }
    }
}

/// Marker error for actions interrupted by session cancellation
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Action cancelled")]
pub struct Cancelled;

// ============================================================================
// Action failure classification
// ============================================================================

/// What the session consumer does about a failed action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Item stays `SyncPending`; `counted` failures count toward the retry limit
    Transient { counted: bool },
    /// Item is blacklisted
    Blacklist(BlacklistReason),
    /// The whole session is put in `Error`
    PauseSession,
    /// Interrupted by cancellation; rolled back to `SyncPending`
    Cancelled,
}

/// A classified action failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionFailure {
    pub kind: FailureKind,
    pub error: SyncErrorCode,
}

impl ActionFailure {
    /// Classifies `err`, raised while acting on `path`
    ///
    /// The cause chain is searched for [`Cancelled`], [`RemoteError`],
    /// [`PlaceholderError`] and `std::io::Error`; anything else is a
    /// counted transient technical error.
    pub fn classify(err: &anyhow::Error, path: &RelativePath) -> Self {
        for cause in err.chain() {
            if cause.downcast_ref::<Cancelled>().is_some() {
                return Self::cancelled(path);
            }
            if let Some(remote) = cause.downcast_ref::<RemoteError>() {
                return Self::from_remote(remote, path);
            }
            if let Some(placeholder) = cause.downcast_ref::<PlaceholderError>() {
                return Self {
                    kind: FailureKind::Transient { counted: true },
                    error: SyncErrorCode::HydrationFailed {
                        path: path.clone(),
                        detail: placeholder.to_string(),
                    },
                };
            }
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                return Self::from_io(io, path);
            }
        }
        Self::technical(path, format!("{err:#}"))
    }

    pub fn cancelled(path: &RelativePath) -> Self {
        Self {
            kind: FailureKind::Cancelled,
            error: SyncErrorCode::TechnicalError {
                path: path.clone(),
                detail: "cancelled".to_string(),
            },
        }
    }

    fn technical(path: &RelativePath, detail: String) -> Self {
        Self {
            kind: FailureKind::Transient { counted: true },
            error: SyncErrorCode::TechnicalError {
                path: path.clone(),
                detail,
            },
        }
    }

    fn from_remote(err: &RemoteError, path: &RelativePath) -> Self {
        let path = path.clone();
        match err {
            RemoteError::Network(_) => Self {
                kind: FailureKind::Transient { counted: false },
                error: SyncErrorCode::NetworkUnavailable,
            },
            RemoteError::Locked(_) => Self {
                kind: FailureKind::Transient { counted: false },
                error: SyncErrorCode::ItemLocked { path },
            },
            RemoteError::CursorExpired => Self {
                kind: FailureKind::Transient { counted: false },
                error: SyncErrorCode::TechnicalError {
                    path,
                    detail: err.to_string(),
                },
            },
            RemoteError::NotFound(_) | RemoteError::AlreadyExists(_) => {
                Self::technical(&path, err.to_string())
            }
            RemoteError::QuotaExceeded => Self {
                kind: FailureKind::Blacklist(BlacklistReason::QuotaExceeded),
                error: SyncErrorCode::QuotaExceeded { path },
            },
            RemoteError::TooLarge { .. } => Self {
                kind: FailureKind::Blacklist(BlacklistReason::TooLarge),
                error: SyncErrorCode::FileTooLarge { path },
            },
            RemoteError::Forbidden(_) => Self {
                kind: FailureKind::Blacklist(BlacklistReason::ForbiddenOperation),
                error: SyncErrorCode::OperationForbidden { path },
            },
            RemoteError::Unauthorized => Self {
                kind: FailureKind::PauseSession,
                error: SyncErrorCode::Unauthorized,
            },
        }
    }

    fn from_io(err: &std::io::Error, path: &RelativePath) -> Self {
        // ENOSPC
        if err.raw_os_error() == Some(28) {
            return Self {
                kind: FailureKind::PauseSession,
                error: SyncErrorCode::DiskFull,
            };
        }
        match err.kind() {
            std::io::ErrorKind::OutOfMemory => Self {
                kind: FailureKind::PauseSession,
                error: SyncErrorCode::InsufficientMemory,
            },
            std::io::ErrorKind::PermissionDenied => Self {
                kind: FailureKind::Blacklist(BlacklistReason::ForbiddenOperation),
                error: SyncErrorCode::LocalAccessDenied { path: path.clone() },
            },
            _ => Self::technical(path, err.to_string()),
        }
    }

    /// Whether the consumer stops the cycle
    pub fn pauses_session(&self) -> bool {
        self.kind == FailureKind::PauseSession
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    fn path() -> RelativePath {
        RelativePath::new("docs/a.txt").unwrap()
    }

    #[test]
    fn test_remote_errors_are_classified_through_context() {
        let err = Err::<(), _>(RemoteError::QuotaExceeded)
            .context("uploading docs/a.txt")
            .unwrap_err();
        let failure = ActionFailure::classify(&err, &path());
        assert_eq!(
            failure.kind,
            FailureKind::Blacklist(BlacklistReason::QuotaExceeded)
        );
        assert_eq!(failure.error, SyncErrorCode::QuotaExceeded { path: path() });
    }

    #[test]
    fn test_network_and_lock_errors_do_not_count() {
        let err = anyhow::Error::new(RemoteError::Network("timeout".into()));
        assert_eq!(
            ActionFailure::classify(&err, &path()).kind,
            FailureKind::Transient { counted: false }
        );
        let err = anyhow::Error::new(RemoteError::Locked("a.txt".into()));
        let failure = ActionFailure::classify(&err, &path());
        assert_eq!(failure.kind, FailureKind::Transient { counted: false });
        assert_eq!(failure.error, SyncErrorCode::ItemLocked { path: path() });
    }

    #[test]
    fn test_unauthorized_pauses_the_session() {
        let err = anyhow::Error::new(RemoteError::Unauthorized);
        let failure = ActionFailure::classify(&err, &path());
        assert!(failure.pauses_session());
        assert_eq!(failure.error, SyncErrorCode::Unauthorized);
    }

    #[test]
    fn test_forbidden_blacklists_temporarily() {
        let err = anyhow::Error::new(RemoteError::Forbidden("read-only".into()));
        assert_eq!(
            ActionFailure::classify(&err, &path()).kind,
            FailureKind::Blacklist(BlacklistReason::ForbiddenOperation)
        );
    }

    #[test]
    fn test_io_errors() {
        let err = anyhow::Error::new(std::io::Error::from_raw_os_error(28));
        assert_eq!(
            ActionFailure::classify(&err, &path()).error,
            SyncErrorCode::DiskFull
        );

        let err = anyhow::Error::new(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        let failure = ActionFailure::classify(&err, &path());
        assert_eq!(failure.error, SyncErrorCode::LocalAccessDenied { path: path() });

        let err = anyhow::Error::new(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(
            ActionFailure::classify(&err, &path()).kind,
            FailureKind::Transient { counted: true }
        );
    }

    #[test]
    fn test_cancellation() {
        let err = anyhow::Error::new(Cancelled).context("downloading");
        assert_eq!(
            ActionFailure::classify(&err, &path()).kind,
            FailureKind::Cancelled
        );
    }

    #[test]
    fn test_unknown_errors_are_technical() {
        let err = anyhow::anyhow!("something odd");
        let failure = ActionFailure::classify(&err, &path());
        assert_eq!(failure.kind, FailureKind::Transient { counted: true });
        assert!(matches!(
            failure.error,
            SyncErrorCode::TechnicalError { .. }
        ));
    }

    #[test]
    fn test_nested_session_error_code() {
        let err = SyncError::NestedSession {
            path: PathBuf::from("/home/u/a/b"),
            existing: PathBuf::from("/home/u/a"),
        };
        assert!(matches!(
            err.error_code(),
            Some(SyncErrorCode::NestedSession { .. })
        ));
    }
}
