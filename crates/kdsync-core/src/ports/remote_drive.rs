//! Remote drive port (driven/secondary port)
//!
//! The interface the engine uses to read the remote change feed and to
//! apply operations to the remote folder of a session.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result`; adapters wrap classifiable failures in
//!   [`RemoteError`] so the executor can downcast and decide between
//!   retrying, blacklisting and pausing the session.
//! - Paths in [`RemoteEntry`] are relative to the session's remote root.
//! - Content hashes must use the same algorithm as the local filesystem
//!   adapter (SHA-256) so fingerprints compare across sides.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::newtypes::{ChangeCursor, RelativePath, RemoteId, RemotePath};
use crate::domain::sync_item::Fingerprint;

// ============================================================================
// RemoteEntry / RemoteChangeBatch
// ============================================================================

/// One item as reported by the remote drive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Identifier assigned by the remote
    pub remote_id: RemoteId,
    /// Path relative to the session's remote root
    pub path: RelativePath,
    pub is_directory: bool,
    pub fingerprint: Fingerprint,
    /// The remote refuses modifications of this item
    pub read_only: bool,
    /// Reported as deleted since the previous cursor
    pub deleted: bool,
}

/// Result of one change-feed query
#[derive(Debug, Clone)]
pub struct RemoteChangeBatch {
    /// Changed entries, in feed order
    pub entries: Vec<RemoteEntry>,
    /// Cursor to pass on the next query
    pub cursor: ChangeCursor,
    /// `entries` is a complete listing; items missing from it are gone
    pub full_resync: bool,
}

// ============================================================================
// RemoteError
// ============================================================================

/// Classified remote failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Remote unreachable or timed out
    #[error("Network error: {0}")]
    Network(String),

    /// Item does not exist remotely
    #[error("Remote item not found: {0}")]
    NotFound(String),

    /// Storage quota exhausted
    #[error("Quota exceeded")]
    QuotaExceeded,

    /// File larger than the remote accepts
    #[error("File too large: {size} bytes (limit {limit})")]
    TooLarge { size: u64, limit: u64 },

    /// Remote refused the operation on this item
    #[error("Operation forbidden: {0}")]
    Forbidden(String),

    /// Item locked by another user
    #[error("Item locked: {0}")]
    Locked(String),

    /// Another item already exists at the destination
    #[error("Item already exists: {0}")]
    AlreadyExists(String),

    /// Credentials rejected for the whole drive
    #[error("Unauthorized")]
    Unauthorized,

    /// The cursor is no longer valid; a full listing is required
    #[error("Change cursor expired")]
    CursorExpired,
}

impl RemoteError {
    /// Whether retrying later may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Network(_) | RemoteError::Locked(_))
    }
}

// ============================================================================
// IRemoteDrive trait
// ============================================================================

/// Progress callback reporting `(bytes_transferred, total_bytes)`
pub type ProgressFn = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Port trait for remote drive operations
///
/// Every method takes the session's remote root; paths are relative to it.
#[async_trait::async_trait]
pub trait IRemoteDrive: Send + Sync {
    /// Queries changes since `cursor`
    ///
    /// With `None` the adapter returns a full listing with `full_resync`
    /// set. An expired cursor is reported as [`RemoteError::CursorExpired`].
    async fn fetch_changes(
        &self,
        root: &RemotePath,
        cursor: Option<&ChangeCursor>,
    ) -> anyhow::Result<RemoteChangeBatch>;

    /// Downloads file content into `dest`
    ///
    /// Returns the fingerprint of the downloaded content. `dest` may be left
    /// partially written on failure; the caller owns its cleanup.
    async fn download(
        &self,
        root: &RemotePath,
        remote_id: &RemoteId,
        dest: &Path,
        progress: Option<ProgressFn>,
    ) -> anyhow::Result<Fingerprint>;

    /// Uploads `source` to `path`
    ///
    /// With `existing` the content of that item is replaced; otherwise a new
    /// item is created.
    async fn upload(
        &self,
        root: &RemotePath,
        path: &RelativePath,
        source: &Path,
        existing: Option<&RemoteId>,
    ) -> anyhow::Result<RemoteEntry>;

    /// Creates a folder (parents must exist)
    async fn create_folder(&self, root: &RemotePath, path: &RelativePath)
        -> anyhow::Result<RemoteEntry>;

    /// Moves or renames an item; descendants of a folder follow it
    async fn move_item(
        &self,
        root: &RemotePath,
        remote_id: &RemoteId,
        to: &RelativePath,
    ) -> anyhow::Result<RemoteEntry>;

    /// Deletes an item (recursively for folders)
    async fn delete_item(&self, root: &RemotePath, remote_id: &RemoteId) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RemoteError::Network("timeout".to_string()).is_transient());
        assert!(RemoteError::Locked("a.txt".to_string()).is_transient());
        assert!(!RemoteError::QuotaExceeded.is_transient());
        assert!(!RemoteError::Unauthorized.is_transient());
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = RemoteError::TooLarge {
            size: 10,
            limit: 5,
        }
        .into();
        assert!(matches!(
            err.downcast_ref::<RemoteError>(),
            Some(RemoteError::TooLarge { size: 10, limit: 5 })
        ));
    }
}
