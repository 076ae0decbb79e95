//! Local filesystem port (driven/secondary port)
//!
//! Scanning, hashing and mutating the local root of a session.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because filesystem errors are adapter-specific.
//! - Content is never written in place: writers obtain a sibling temp path,
//!   fill it, then `commit` it with an atomic rename. A crash leaves either
//!   the old file or the new one, plus a stray temp file the scanner skips.
//! - Change notification lives in the sync crate's watcher, not here.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::newtypes::{FileHash, RelativePath, SyncPath};
use crate::domain::sync_item::Fingerprint;

/// File name prefix of in-flight temp files; never synchronized
pub const TEMP_FILE_PREFIX: &str = ".kdsync-tmp-";

/// Whether a file name denotes an engine temp file
#[must_use]
pub fn is_temp_file_name(name: &str) -> bool {
    name.starts_with(TEMP_FILE_PREFIX)
}

// ============================================================================
// LocalEntry
// ============================================================================

/// Snapshot of one local entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEntry {
    /// Path relative to the session root
    pub path: RelativePath,
    pub is_directory: bool,
    /// Size in bytes (0 for directories)
    pub size: u64,
    pub mtime: DateTime<Utc>,
    /// Inode number (or platform equivalent)
    pub node_id: Option<u64>,
    /// Number of hard links
    pub link_count: u64,
    /// Content hash, when already computed
    pub hash: Option<FileHash>,
}

impl LocalEntry {
    /// Fingerprint of this entry
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        if self.is_directory {
            Fingerprint::directory()
        } else {
            Fingerprint::file(self.hash.clone(), self.size, self.mtime)
        }
    }

    /// Whether a regular file has more than one hard link
    #[must_use]
    pub fn is_hard_link(&self) -> bool {
        !self.is_directory && self.link_count > 1
    }
}

// ============================================================================
// ILocalFileSystem trait
// ============================================================================

/// Port trait for local filesystem operations
#[async_trait::async_trait]
pub trait ILocalFileSystem: Send + Sync {
    /// Lists every entry below `root` (the root itself excluded)
    ///
    /// Temp files are skipped. Hashes are left empty; see `hash_file`.
    async fn scan(&self, root: &SyncPath) -> anyhow::Result<Vec<LocalEntry>>;

    /// Stats one entry; `None` if it does not exist
    async fn stat(&self, root: &SyncPath, path: &RelativePath)
        -> anyhow::Result<Option<LocalEntry>>;

    /// Computes the SHA-256 of a file
    async fn hash_file(&self, root: &SyncPath, path: &RelativePath) -> anyhow::Result<FileHash>;

    /// Creates a directory and any missing parents
    async fn create_dir_all(&self, root: &SyncPath, path: &RelativePath) -> anyhow::Result<()>;

    /// Renames an entry, creating the destination's parents
    async fn rename(
        &self,
        root: &SyncPath,
        from: &RelativePath,
        to: &RelativePath,
    ) -> anyhow::Result<()>;

    /// Removes a file, or a directory recursively; missing entries are ignored
    async fn remove(&self, root: &SyncPath, path: &RelativePath) -> anyhow::Result<()>;

    /// Sibling temp path for writing `path`
    fn temp_path(&self, root: &SyncPath, path: &RelativePath) -> PathBuf;

    /// Atomically moves a completed temp file into place
    async fn commit(
        &self,
        root: &SyncPath,
        temp: &Path,
        path: &RelativePath,
    ) -> anyhow::Result<LocalEntry>;

    /// Deletes a temp file, ignoring a missing file
    async fn discard(&self, temp: &Path) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_file_names() {
        assert!(is_temp_file_name(".kdsync-tmp-1234-a.txt"));
        assert!(!is_temp_file_name("a.txt"));
    }

    #[test]
    fn test_hard_link_detection() {
        let mut entry = LocalEntry {
            path: RelativePath::new("a.txt").unwrap(),
            is_directory: false,
            size: 1,
            mtime: Utc::now(),
            node_id: Some(7),
            link_count: 2,
            hash: None,
        };
        assert!(entry.is_hard_link());
        entry.is_directory = true;
        assert!(!entry.is_hard_link());
        assert_eq!(entry.fingerprint(), Fingerprint::directory());
    }
}
