//! Local filesystem adapter (secondary/driven adapter)
//!
//! Implements [`ILocalFileSystem`] over `tokio::fs`, with `walkdir` scans
//! and SHA-256 hashing on blocking threads.
//!
//! ## Design Decisions
//!
//! - **Atomic writes**: content lands in a `.kdsync-tmp-` sibling and is
//!   renamed into place by `commit`, so a crash or a cancelled download
//!   never leaves a partial file at the real path.
//! - **Move detection**: entries carry the inode number and link count
//!   (unix) so the delta computation can match moves and spot hard links.
//! - **Symlinks** are not followed and not reported.

use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};
use walkdir::WalkDir;

use kdsync_core::domain::{FileHash, RelativePath, SyncPath};
use kdsync_core::ports::{is_temp_file_name, ILocalFileSystem, LocalEntry, TEMP_FILE_PREFIX};

const HASH_BUFFER_SIZE: usize = 64 * 1024;

// ============================================================================
// Helpers shared with the directory-backed remote
// ============================================================================

/// SHA-256 of a file, computed on the calling thread
pub fn hash_file_blocking(path: &Path) -> std::io::Result<FileHash> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(FileHash::from_digest(&hasher.finalize()))
}

/// SHA-256 of a file, computed on a blocking thread
pub async fn hash_file_async(path: PathBuf) -> anyhow::Result<FileHash> {
    let hash = tokio::task::spawn_blocking(move || hash_file_blocking(&path)).await??;
    Ok(hash)
}

/// Modification time of `metadata` as UTC
pub fn modified_at(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .ok()
        .and_then(|st| st.duration_since(std::time::UNIX_EPOCH).ok())
        .and_then(|dur| DateTime::from_timestamp(dur.as_secs() as i64, dur.subsec_nanos()))
        .unwrap_or_default()
}

#[cfg(unix)]
fn node_info(metadata: &std::fs::Metadata) -> (Option<u64>, u64) {
    use std::os::unix::fs::MetadataExt;
    (Some(metadata.ino()), metadata.nlink())
}

#[cfg(not(unix))]
fn node_info(_metadata: &std::fs::Metadata) -> (Option<u64>, u64) {
    (None, 1)
}

fn entry_from_metadata(path: RelativePath, metadata: &std::fs::Metadata) -> LocalEntry {
    let (node_id, link_count) = node_info(metadata);
    let is_directory = metadata.is_dir();
    LocalEntry {
        path,
        is_directory,
        size: if is_directory { 0 } else { metadata.len() },
        mtime: modified_at(metadata),
        node_id,
        link_count,
        hash: None,
    }
}

fn scan_blocking(root: &Path) -> anyhow::Result<Vec<LocalEntry>> {
    let mut entries = Vec::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !e.file_name().to_str().is_some_and(is_temp_file_name));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if entry.file_type().is_symlink() {
            debug!(path = %entry.path().display(), "Skipping symlink");
            continue;
        }
        if entry.file_name().to_str().is_none() {
            warn!(path = %entry.path().display(), "Skipping entry with a non UTF-8 name");
            continue;
        }
        let path = match RelativePath::from_absolute(root, entry.path()) {
            Ok(path) => path,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "Skipping entry");
                continue;
            }
        };
        match entry.metadata() {
            Ok(metadata) => entries.push(entry_from_metadata(path, &metadata)),
            Err(e) => warn!(path = %path, error = %e, "Entry vanished during scan"),
        }
    }
    Ok(entries)
}

// ============================================================================
// LocalFileSystem
// ============================================================================

/// Adapter that bridges the [`ILocalFileSystem`] port to the real filesystem.
///
/// Zero-sized: every operation takes the session root it works under.
#[derive(Debug, Clone, Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl ILocalFileSystem for LocalFileSystem {
    #[instrument(skip(self), fields(root = %root))]
    async fn scan(&self, root: &SyncPath) -> anyhow::Result<Vec<LocalEntry>> {
        let root_path = root.as_path().to_path_buf();
        let entries = tokio::task::spawn_blocking(move || scan_blocking(&root_path)).await??;
        debug!(entries = entries.len(), "Scan complete");
        Ok(entries)
    }

    async fn stat(
        &self,
        root: &SyncPath,
        path: &RelativePath,
    ) -> anyhow::Result<Option<LocalEntry>> {
        match tokio::fs::symlink_metadata(root.resolve(path)).await {
            Ok(metadata) => Ok(Some(entry_from_metadata(path.clone(), &metadata))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, root), fields(path = %path))]
    async fn hash_file(&self, root: &SyncPath, path: &RelativePath) -> anyhow::Result<FileHash> {
        hash_file_async(root.resolve(path)).await
    }

    async fn create_dir_all(&self, root: &SyncPath, path: &RelativePath) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(root.resolve(path)).await?;
        debug!(path = %path, "Directory created");
        Ok(())
    }

    #[instrument(skip(self, root))]
    async fn rename(
        &self,
        root: &SyncPath,
        from: &RelativePath,
        to: &RelativePath,
    ) -> anyhow::Result<()> {
        let source = root.resolve(from);
        let target = root.resolve(to);
        if tokio::fs::symlink_metadata(&target).await.is_ok() {
            return Err(std::io::Error::new(
                ErrorKind::AlreadyExists,
                format!("{to} already exists"),
            )
            .into());
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&source, &target).await?;
        debug!("Rename complete");
        Ok(())
    }

    #[instrument(skip(self, root), fields(path = %path))]
    async fn remove(&self, root: &SyncPath, path: &RelativePath) -> anyhow::Result<()> {
        let target = root.resolve(path);
        let metadata = match tokio::fs::symlink_metadata(&target).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Already gone");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&target).await
        } else {
            tokio::fs::remove_file(&target).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn temp_path(&self, root: &SyncPath, path: &RelativePath) -> PathBuf {
        let target = root.resolve(path);
        let name = format!("{TEMP_FILE_PREFIX}{}", uuid::Uuid::new_v4().simple());
        match target.parent() {
            Some(parent) => parent.join(name),
            None => root.as_path().join(name),
        }
    }

    #[instrument(skip(self, root, temp), fields(path = %path))]
    async fn commit(
        &self,
        root: &SyncPath,
        temp: &Path,
        path: &RelativePath,
    ) -> anyhow::Result<LocalEntry> {
        let target = root.resolve(path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(temp, &target).await?;
        let metadata = tokio::fs::symlink_metadata(&target).await?;
        debug!("Committed");
        Ok(entry_from_metadata(path.clone(), &metadata))
    }

    async fn discard(&self, temp: &Path) -> anyhow::Result<()> {
        match tokio::fs::remove_file(temp).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Unit tests
// ============================================================================

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn root(dir: &TempDir) -> SyncPath {
        SyncPath::new(dir.path().to_path_buf()).expect("temp dir paths are absolute")
    }

    fn path(s: &str) -> RelativePath {
        RelativePath::new(s).unwrap()
    }

    // ------------------------------------------------------------------
    // scan / stat
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_scan_lists_nested_entries_and_skips_temp_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("docs/sub")).unwrap();
        std::fs::write(dir.path().join("docs/a.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("docs/sub/b.txt"), b"x").unwrap();
        std::fs::write(dir.path().join(".kdsync-tmp-123"), b"partial").unwrap();

        let entries = LocalFileSystem::new().scan(&root(&dir)).await.unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["docs", "docs/a.txt", "docs/sub", "docs/sub/b.txt"]);

        let file = entries.iter().find(|e| e.path.as_str() == "docs/a.txt").unwrap();
        assert!(!file.is_directory);
        assert_eq!(file.size, 5);
        assert!(file.hash.is_none());
        assert!(entries[0].is_directory);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scan_reports_node_ids_and_hard_links() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"shared").unwrap();
        std::fs::hard_link(dir.path().join("a.txt"), dir.path().join("b.txt")).unwrap();

        let entries = LocalFileSystem::new().scan(&root(&dir)).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(LocalEntry::is_hard_link));
        assert_eq!(entries[0].node_id, entries[1].node_id);
    }

    #[tokio::test]
    async fn test_stat_missing_entry() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFileSystem::new();
        assert!(fs.stat(&root(&dir), &path("nope.txt")).await.unwrap().is_none());
    }

    // ------------------------------------------------------------------
    // hashing
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_hash_is_sha256_hex() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("abc.txt"), b"abc").unwrap();
        let hash = LocalFileSystem::new()
            .hash_file(&root(&dir), &path("abc.txt"))
            .await
            .unwrap();
        assert_eq!(
            hash.as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    // ------------------------------------------------------------------
    // mutations
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_rename_creates_parents_and_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFileSystem::new();
        let r = root(&dir);
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"b").unwrap();

        fs.rename(&r, &path("a.txt"), &path("x/y/a.txt")).await.unwrap();
        assert!(dir.path().join("x/y/a.txt").exists());

        let err = fs.rename(&r, &path("b.txt"), &path("x/y/a.txt")).await.unwrap_err();
        let io = err.downcast_ref::<std::io::Error>().unwrap();
        assert_eq!(io.kind(), ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn test_remove_file_directory_and_missing() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFileSystem::new();
        let r = root(&dir);
        std::fs::create_dir_all(dir.path().join("d/e")).unwrap();
        std::fs::write(dir.path().join("d/e/f.txt"), b"f").unwrap();
        std::fs::write(dir.path().join("g.txt"), b"g").unwrap();

        fs.remove(&r, &path("d")).await.unwrap();
        fs.remove(&r, &path("g.txt")).await.unwrap();
        fs.remove(&r, &path("never-existed")).await.unwrap();
        assert!(!dir.path().join("d").exists());
        assert!(!dir.path().join("g.txt").exists());
    }

    #[tokio::test]
    async fn test_temp_then_commit() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFileSystem::new();
        let r = root(&dir);
        std::fs::create_dir(dir.path().join("docs")).unwrap();

        let temp = fs.temp_path(&r, &path("docs/new.txt"));
        assert_eq!(temp.parent().unwrap(), dir.path().join("docs"));
        assert!(is_temp_file_name(temp.file_name().unwrap().to_str().unwrap()));

        std::fs::write(&temp, b"content").unwrap();
        let entry = fs.commit(&r, &temp, &path("docs/new.txt")).await.unwrap();
        assert_eq!(entry.size, 7);
        assert!(!temp.exists());
        assert_eq!(std::fs::read(dir.path().join("docs/new.txt")).unwrap(), b"content");
    }

    #[tokio::test]
    async fn test_discard_ignores_missing_temp() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFileSystem::new();
        let temp = fs.temp_path(&root(&dir), &path("a.txt"));
        std::fs::write(&temp, b"partial").unwrap();
        fs.discard(&temp).await.unwrap();
        fs.discard(&temp).await.unwrap();
        assert!(!temp.exists());
    }
}
