//! Directory-backed remote drive (secondary/driven adapter)
//!
//! Implements [`IRemoteDrive`] over a plain directory, e.g. a network
//! mount. Everything the engine needs from a real drive is kept next to the
//! content in a JSON state file:
//!
//! - **Stable ids**: an index maps each id to its current path, size,
//!   mtime, SHA-256 and read-only flag.
//! - **Change feed**: every mutation appends a sequence-numbered record to
//!   a bounded journal. A cursor is the last sequence a client saw; cursors
//!   older than the journal are answered with `CursorExpired`.
//! - **Other writers**: each feed query first rescans the session's remote
//!   folder and journals anything created, modified or removed behind the
//!   adapter's back.
//!
//! Content writes go through a temp sibling and an atomic rename, and the
//! state file is replaced the same way.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use kdsync_core::domain::{
    ChangeCursor, FileHash, Fingerprint, RelativePath, RemoteId, RemotePath,
};
use kdsync_core::ports::{
    is_temp_file_name, IRemoteDrive, ProgressFn, RemoteChangeBatch, RemoteEntry, RemoteError,
    TEMP_FILE_PREFIX,
};

use crate::filesystem::{hash_file_async, modified_at};

/// Name of the state file at the top of the drive directory
pub const STATE_FILE_NAME: &str = ".kdsync-drive.json";

const DEFAULT_JOURNAL_LIMIT: usize = 10_000;

// ============================================================================
// Persisted state
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IndexEntry {
    /// Path relative to the drive directory
    path: RelativePath,
    is_directory: bool,
    size: u64,
    mtime: DateTime<Utc>,
    hash: Option<FileHash>,
    #[serde(default)]
    read_only: bool,
}

impl IndexEntry {
    fn fingerprint(&self) -> Fingerprint {
        if self.is_directory {
            Fingerprint::directory()
        } else {
            Fingerprint::file(self.hash.clone(), self.size, self.mtime)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct JournalRecord {
    sequence: u64,
    id: String,
    path: RelativePath,
    /// Path before a move, when the record is a move
    previous_path: Option<RelativePath>,
    is_directory: bool,
    deleted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DriveState {
    next_id: u64,
    sequence: u64,
    /// Oldest cursor still answerable from the journal
    floor: u64,
    items: BTreeMap<String, IndexEntry>,
    journal: VecDeque<JournalRecord>,
}

impl DriveState {
    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        format!("item-{:08}", self.next_id)
    }

    fn id_at(&self, path: &RelativePath) -> Option<String> {
        self.items
            .iter()
            .find(|(_, entry)| &entry.path == path)
            .map(|(id, _)| id.clone())
    }

    fn record(
        &mut self,
        id: &str,
        entry: &IndexEntry,
        previous_path: Option<RelativePath>,
        deleted: bool,
        limit: usize,
    ) {
        self.sequence += 1;
        self.journal.push_back(JournalRecord {
            sequence: self.sequence,
            id: id.to_string(),
            path: entry.path.clone(),
            previous_path,
            is_directory: entry.is_directory,
            deleted,
        });
        while self.journal.len() > limit {
            if let Some(dropped) = self.journal.pop_front() {
                self.floor = dropped.sequence;
            }
        }
    }

    fn used_bytes(&self) -> u64 {
        self.items
            .values()
            .filter(|e| !e.is_directory)
            .map(|e| e.size)
            .sum()
    }

    /// Ids of `path` and everything below it
    fn subtree(&self, path: &RelativePath) -> Vec<String> {
        self.items
            .iter()
            .filter(|(_, e)| e.path.starts_with(path))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Entry seen on disk during a rescan
struct Observed {
    path: RelativePath,
    is_directory: bool,
    size: u64,
    mtime: DateTime<Utc>,
}

fn walk_blocking(base: &Path, folder: &Path) -> Vec<Observed> {
    let mut observed = Vec::new();
    let walker = WalkDir::new(folder)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            e.file_name()
                .to_str()
                .is_some_and(|n| n != STATE_FILE_NAME && !is_temp_file_name(n))
        });
    for entry in walker.flatten() {
        if entry.file_type().is_symlink() {
            continue;
        }
        let Ok(path) = RelativePath::from_absolute(base, entry.path()) else {
            continue;
        };
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let is_directory = metadata.is_dir();
        observed.push(Observed {
            path,
            is_directory,
            size: if is_directory { 0 } else { metadata.len() },
            mtime: modified_at(&metadata),
        });
    }
    observed
}

// ============================================================================
// DirectoryRemoteDrive
// ============================================================================

/// [`IRemoteDrive`] over a local directory
pub struct DirectoryRemoteDrive {
    base_dir: PathBuf,
    state: Mutex<DriveState>,
    journal_limit: usize,
    max_file_size: Option<u64>,
    quota_bytes: Option<u64>,
}

impl DirectoryRemoteDrive {
    /// Opens the drive rooted at `base_dir`, creating it if needed
    ///
    /// # Errors
    /// Fails if the directory cannot be created or the state file is
    /// unreadable.
    pub async fn open(base_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let base_dir = base_dir.into();
        tokio::fs::create_dir_all(&base_dir).await?;
        let state_path = base_dir.join(STATE_FILE_NAME);
        let state = match tokio::fs::read(&state_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == ErrorKind::NotFound => DriveState::default(),
            Err(e) => return Err(e.into()),
        };
        info!(base_dir = %base_dir.display(), "Opened directory drive");
        Ok(Self {
            base_dir,
            state: Mutex::new(state),
            journal_limit: DEFAULT_JOURNAL_LIMIT,
            max_file_size: None,
            quota_bytes: None,
        })
    }

    /// Keep at most `limit` journal records
    #[must_use]
    pub fn with_journal_limit(mut self, limit: usize) -> Self {
        self.journal_limit = limit.max(1);
        self
    }

    /// Reject uploads larger than `bytes`
    #[must_use]
    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = Some(bytes);
        self
    }

    /// Reject uploads once file content would exceed `bytes`
    #[must_use]
    pub fn with_quota(mut self, bytes: u64) -> Self {
        self.quota_bytes = Some(bytes);
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Marks the item at `path` (drive-relative) read-only or writable
    ///
    /// The change is journaled so clients see the new permission.
    pub async fn set_read_only(&self, path: &RelativePath, read_only: bool) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let id = state
            .id_at(path)
            .ok_or_else(|| RemoteError::NotFound(path.to_string()))?;
        let entry = match state.items.get_mut(&id) {
            Some(entry) => {
                entry.read_only = read_only;
                entry.clone()
            }
            None => return Err(RemoteError::NotFound(path.to_string()).into()),
        };
        state.record(&id, &entry, None, false, self.journal_limit);
        self.persist(&state).await
    }

    fn absolute(&self, path: &RelativePath) -> PathBuf {
        path.to_path(&self.base_dir)
    }

    async fn persist(&self, state: &DriveState) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(state)?;
        let temp = self
            .base_dir
            .join(format!("{TEMP_FILE_PREFIX}{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&temp, &bytes).await?;
        tokio::fs::rename(&temp, self.base_dir.join(STATE_FILE_NAME)).await?;
        Ok(())
    }

    fn drive_path(root: &RemotePath, path: &RelativePath) -> RelativePath {
        let base = root.as_relative();
        path.rebase(&RelativePath::root(), &base)
            .unwrap_or_else(|| path.clone())
    }

    fn to_remote_entry(
        id: &str,
        entry: &IndexEntry,
        root: &RelativePath,
    ) -> anyhow::Result<Option<RemoteEntry>> {
        let Some(path) = entry.path.rebase(root, &RelativePath::root()) else {
            return Ok(None);
        };
        if path.is_root() {
            return Ok(None);
        }
        Ok(Some(RemoteEntry {
            remote_id: RemoteId::new(id.to_string())?,
            path,
            is_directory: entry.is_directory,
            fingerprint: entry.fingerprint(),
            read_only: entry.read_only,
            deleted: false,
        }))
    }

    /// Checks that the parent of `path` exists as a folder
    fn check_parent(state: &DriveState, root: &RelativePath, path: &RelativePath) -> anyhow::Result<()> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        if parent == *root || parent.is_root() {
            return Ok(());
        }
        let parent_is_folder = state
            .items
            .values()
            .any(|e| e.path == parent && e.is_directory);
        if parent_is_folder {
            Ok(())
        } else {
            Err(RemoteError::NotFound(format!("parent folder {parent}")).into())
        }
    }

    /// Journals changes made directly in the drive directory
    ///
    /// Returns whether anything changed.
    async fn rescan(&self, state: &mut DriveState, root: &RelativePath) -> anyhow::Result<bool> {
        let folder = self.absolute(root);
        tokio::fs::create_dir_all(&folder).await?;
        let base = self.base_dir.clone();
        let observed =
            tokio::task::spawn_blocking(move || walk_blocking(&base, &folder)).await?;

        let by_path: HashMap<RelativePath, String> = state
            .items
            .iter()
            .filter(|(_, e)| e.path.is_descendant_of(root) || root.is_root())
            .map(|(id, e)| (e.path.clone(), id.clone()))
            .collect();
        let mut seen: HashSet<String> = HashSet::new();
        let mut changed = false;

        for obs in observed {
            let known = by_path.get(&obs.path).cloned();
            match known {
                Some(id) if state.items.get(&id).is_some_and(|e| e.is_directory == obs.is_directory) => {
                    seen.insert(id.clone());
                    let Some(current) = state.items.get(&id).cloned() else {
                        continue;
                    };
                    if obs.is_directory
                        || (current.size == obs.size && current.mtime == obs.mtime)
                    {
                        continue;
                    }
                    let hash = hash_file_async(self.absolute(&obs.path)).await?;
                    let updated = IndexEntry {
                        size: obs.size,
                        mtime: obs.mtime,
                        hash: Some(hash),
                        ..current
                    };
                    debug!(path = %obs.path, "Detected external modification");
                    state.items.insert(id.clone(), updated.clone());
                    state.record(&id, &updated, None, false, self.journal_limit);
                    changed = true;
                }
                _ => {
                    let hash = if obs.is_directory {
                        None
                    } else {
                        Some(hash_file_async(self.absolute(&obs.path)).await?)
                    };
                    let id = state.allocate_id();
                    let entry = IndexEntry {
                        path: obs.path.clone(),
                        is_directory: obs.is_directory,
                        size: obs.size,
                        mtime: obs.mtime,
                        hash,
                        read_only: false,
                    };
                    debug!(path = %obs.path, id = %id, "Detected external creation");
                    state.items.insert(id.clone(), entry.clone());
                    state.record(&id, &entry, None, false, self.journal_limit);
                    seen.insert(id);
                    changed = true;
                }
            }
        }

        let vanished: Vec<String> = by_path
            .values()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for id in vanished {
            if let Some(entry) = state.items.remove(&id) {
                debug!(path = %entry.path, id = %id, "Detected external removal");
                state.record(&id, &entry, None, true, self.journal_limit);
                changed = true;
            }
        }
        Ok(changed)
    }
}

#[async_trait::async_trait]
impl IRemoteDrive for DirectoryRemoteDrive {
    #[instrument(skip(self), fields(root = %root))]
    async fn fetch_changes(
        &self,
        root: &RemotePath,
        cursor: Option<&ChangeCursor>,
    ) -> anyhow::Result<RemoteChangeBatch> {
        let root_rel = root.as_relative();
        let mut state = self.state.lock().await;

        let since = match cursor {
            Some(c) => {
                let seq: u64 = c.as_str().parse().map_err(|_| RemoteError::CursorExpired)?;
                if seq < state.floor || seq > state.sequence {
                    return Err(RemoteError::CursorExpired.into());
                }
                Some(seq)
            }
            None => None,
        };

        if self.rescan(&mut state, &root_rel).await? {
            self.persist(&state).await?;
        }

        let mut entries = Vec::new();
        let full_resync = since.is_none();
        match since {
            None => {
                for (id, entry) in &state.items {
                    if let Some(remote) = Self::to_remote_entry(id, entry, &root_rel)? {
                        entries.push(remote);
                    }
                }
            }
            Some(seq) => {
                // Last record per id, in feed order
                let mut last: HashMap<&str, &JournalRecord> = HashMap::new();
                let mut order: Vec<&str> = Vec::new();
                for record in state.journal.iter().filter(|r| r.sequence > seq) {
                    if last.insert(record.id.as_str(), record).is_none() {
                        order.push(record.id.as_str());
                    }
                }
                order.sort_by_key(|id| last.get(id).map(|r| r.sequence));

                for id in order {
                    let Some(record) = last.get(id) else {
                        continue;
                    };
                    let inside = record.path.is_descendant_of(&root_rel);
                    let was_inside = record
                        .previous_path
                        .as_ref()
                        .is_some_and(|p| p.is_descendant_of(&root_rel));
                    if !inside && !was_inside {
                        continue;
                    }
                    let current = state.items.get(id);
                    match current {
                        Some(entry) if !record.deleted && inside => {
                            if let Some(remote) = Self::to_remote_entry(id, entry, &root_rel)? {
                                entries.push(remote);
                            }
                        }
                        _ => {
                            let old = record.previous_path.as_ref().unwrap_or(&record.path);
                            let Some(path) = old.rebase(&root_rel, &RelativePath::root()) else {
                                continue;
                            };
                            entries.push(RemoteEntry {
                                remote_id: RemoteId::new(id.to_string())?,
                                path,
                                is_directory: record.is_directory,
                                fingerprint: Fingerprint::directory(),
                                read_only: false,
                                deleted: true,
                            });
                        }
                    }
                }
            }
        }

        debug!(
            entries = entries.len(),
            full_resync,
            sequence = state.sequence,
            "Change feed answered"
        );
        Ok(RemoteChangeBatch {
            entries,
            cursor: ChangeCursor::new(state.sequence.to_string())?,
            full_resync,
        })
    }

    #[instrument(skip(self, progress), fields(root = %root, remote_id = %remote_id))]
    async fn download(
        &self,
        root: &RemotePath,
        remote_id: &RemoteId,
        dest: &Path,
        progress: Option<ProgressFn>,
    ) -> anyhow::Result<Fingerprint> {
        let entry = {
            let state = self.state.lock().await;
            state
                .items
                .get(remote_id.as_str())
                .cloned()
                .ok_or_else(|| RemoteError::NotFound(remote_id.to_string()))?
        };
        if entry.is_directory {
            return Err(RemoteError::Forbidden(format!("{} is a folder", entry.path)).into());
        }

        let source = self.absolute(&entry.path);
        let copied = match tokio::fs::copy(&source, dest).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(RemoteError::NotFound(entry.path.to_string()).into())
            }
            Err(e) => return Err(RemoteError::Network(e.to_string()).into()),
        };
        if let Some(progress) = progress {
            progress(copied, copied);
        }

        let hash = hash_file_async(dest.to_path_buf()).await?;
        debug!(bytes = copied, "Download complete");
        Ok(Fingerprint::file(Some(hash), copied, entry.mtime))
    }

    #[instrument(skip(self, source, existing), fields(root = %root, path = %path))]
    async fn upload(
        &self,
        root: &RemotePath,
        path: &RelativePath,
        source: &Path,
        existing: Option<&RemoteId>,
    ) -> anyhow::Result<RemoteEntry> {
        let root_rel = root.as_relative();
        let size = tokio::fs::metadata(source).await?.len();
        if let Some(limit) = self.max_file_size {
            if size > limit {
                return Err(RemoteError::TooLarge { size, limit }.into());
            }
        }

        let mut state = self.state.lock().await;
        let (id, target, read_only, previous_size) = match existing {
            Some(remote_id) => {
                let entry = state
                    .items
                    .get(remote_id.as_str())
                    .ok_or_else(|| RemoteError::NotFound(remote_id.to_string()))?;
                if entry.read_only {
                    return Err(RemoteError::Forbidden(entry.path.to_string()).into());
                }
                (
                    remote_id.as_str().to_string(),
                    entry.path.clone(),
                    entry.read_only,
                    entry.size,
                )
            }
            None => {
                let target = Self::drive_path(root, path);
                if state.id_at(&target).is_some() {
                    return Err(RemoteError::AlreadyExists(path.to_string()).into());
                }
                Self::check_parent(&state, &root_rel, &target)?;
                (state.allocate_id(), target, false, 0)
            }
        };

        if let Some(quota) = self.quota_bytes {
            if state.used_bytes() - previous_size + size > quota {
                return Err(RemoteError::QuotaExceeded.into());
            }
        }

        let destination = self.absolute(&target);
        let parent = destination
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.base_dir.clone());
        tokio::fs::create_dir_all(&parent).await?;
        let temp = parent.join(format!("{TEMP_FILE_PREFIX}{}", uuid::Uuid::new_v4().simple()));
        if let Err(e) = tokio::fs::copy(source, &temp).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        tokio::fs::rename(&temp, &destination).await?;

        let metadata = tokio::fs::metadata(&destination).await?;
        let hash = hash_file_async(destination.clone()).await?;
        let entry = IndexEntry {
            path: target,
            is_directory: false,
            size: metadata.len(),
            mtime: modified_at(&metadata),
            hash: Some(hash),
            read_only,
        };
        state.items.insert(id.clone(), entry.clone());
        state.record(&id, &entry, None, false, self.journal_limit);
        self.persist(&state).await?;

        debug!(id = %id, bytes = entry.size, "Upload complete");
        Self::to_remote_entry(&id, &entry, &root_rel)?
            .ok_or_else(|| anyhow::anyhow!("uploaded item {id} is outside the session root"))
    }

    #[instrument(skip(self), fields(root = %root, path = %path))]
    async fn create_folder(&self, root: &RemotePath, path: &RelativePath) -> anyhow::Result<RemoteEntry> {
        let root_rel = root.as_relative();
        let target = Self::drive_path(root, path);
        let mut state = self.state.lock().await;

        if let Some(id) = state.id_at(&target) {
            let entry = state.items.get(&id).cloned();
            return match entry {
                Some(entry) if entry.is_directory => Self::to_remote_entry(&id, &entry, &root_rel)?
                    .ok_or_else(|| anyhow::anyhow!("folder {id} is outside the session root")),
                _ => Err(RemoteError::AlreadyExists(path.to_string()).into()),
            };
        }
        Self::check_parent(&state, &root_rel, &target)?;

        tokio::fs::create_dir_all(self.absolute(&target)).await?;
        let id = state.allocate_id();
        let entry = IndexEntry {
            path: target,
            is_directory: true,
            size: 0,
            mtime: Utc::now(),
            hash: None,
            read_only: false,
        };
        state.items.insert(id.clone(), entry.clone());
        state.record(&id, &entry, None, false, self.journal_limit);
        self.persist(&state).await?;

        debug!(id = %id, "Folder created");
        Self::to_remote_entry(&id, &entry, &root_rel)?
            .ok_or_else(|| anyhow::anyhow!("folder {id} is outside the session root"))
    }

    #[instrument(skip(self), fields(root = %root, remote_id = %remote_id, to = %to))]
    async fn move_item(
        &self,
        root: &RemotePath,
        remote_id: &RemoteId,
        to: &RelativePath,
    ) -> anyhow::Result<RemoteEntry> {
        let root_rel = root.as_relative();
        let target = Self::drive_path(root, to);
        let mut state = self.state.lock().await;

        let entry = state
            .items
            .get(remote_id.as_str())
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(remote_id.to_string()))?;
        if entry.read_only {
            return Err(RemoteError::Forbidden(entry.path.to_string()).into());
        }
        if entry.path == target {
            return Self::to_remote_entry(remote_id.as_str(), &entry, &root_rel)?
                .ok_or_else(|| anyhow::anyhow!("item {remote_id} is outside the session root"));
        }
        if state.id_at(&target).is_some() {
            return Err(RemoteError::AlreadyExists(to.to_string()).into());
        }
        Self::check_parent(&state, &root_rel, &target)?;

        let source_path = entry.path.clone();
        tokio::fs::rename(self.absolute(&source_path), self.absolute(&target))
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => anyhow::Error::new(RemoteError::NotFound(source_path.to_string())),
                _ => anyhow::Error::new(e),
            })?;

        for id in state.subtree(&source_path) {
            let Some(current) = state.items.get(&id).cloned() else {
                continue;
            };
            let Some(new_path) = current.path.rebase(&source_path, &target) else {
                continue;
            };
            let moved = IndexEntry {
                path: new_path,
                ..current.clone()
            };
            state.items.insert(id.clone(), moved.clone());
            state.record(&id, &moved, Some(current.path), false, self.journal_limit);
        }
        self.persist(&state).await?;

        let moved = state
            .items
            .get(remote_id.as_str())
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(remote_id.to_string()))?;
        debug!("Move complete");
        Self::to_remote_entry(remote_id.as_str(), &moved, &root_rel)?
            .ok_or_else(|| anyhow::anyhow!("item {remote_id} moved outside the session root"))
    }

    #[instrument(skip(self), fields(root = %root, remote_id = %remote_id))]
    async fn delete_item(&self, root: &RemotePath, remote_id: &RemoteId) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let entry = state
            .items
            .get(remote_id.as_str())
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(remote_id.to_string()))?;
        if entry.read_only {
            return Err(RemoteError::Forbidden(entry.path.to_string()).into());
        }

        let absolute = self.absolute(&entry.path);
        let result = if entry.is_directory {
            tokio::fs::remove_dir_all(&absolute).await
        } else {
            tokio::fs::remove_file(&absolute).await
        };
        match result {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(path = %entry.path, "Content already gone");
            }
            Err(e) => return Err(e.into()),
        }

        let mut removed: Vec<(String, IndexEntry)> = state
            .subtree(&entry.path)
            .into_iter()
            .filter_map(|id| state.items.get(&id).cloned().map(|e| (id, e)))
            .collect();
        // Children first, like a recursive delete would report them
        removed.sort_by_key(|(_, e)| std::cmp::Reverse(e.path.depth()));
        for (id, removed_entry) in removed {
            state.items.remove(&id);
            state.record(&id, &removed_entry, None, true, self.journal_limit);
        }
        self.persist(&state).await?;
        debug!("Delete complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn path(s: &str) -> RelativePath {
        RelativePath::new(s).unwrap()
    }

    fn remote_root(s: &str) -> RemotePath {
        RemotePath::new(s.to_string()).unwrap()
    }

    fn remote_error(err: &anyhow::Error) -> Option<&RemoteError> {
        err.downcast_ref::<RemoteError>()
    }

    async fn source_file(dir: &TempDir, name: &str, content: &[u8]) -> PathBuf {
        let p = dir.path().join(name);
        tokio::fs::write(&p, content).await.unwrap();
        p
    }

    mod feed {
        use super::*;

        #[tokio::test]
        async fn test_full_listing_picks_up_external_writes_with_stable_ids() {
            let base = TempDir::new().unwrap();
            std::fs::create_dir_all(base.path().join("Docs/sub")).unwrap();
            std::fs::write(base.path().join("Docs/a.txt"), b"aaa").unwrap();
            std::fs::write(base.path().join("Docs/sub/b.txt"), b"bb").unwrap();
            std::fs::write(base.path().join("outside.txt"), b"o").unwrap();

            let drive = DirectoryRemoteDrive::open(base.path()).await.unwrap();
            let root = remote_root("/Docs");
            let first = drive.fetch_changes(&root, None).await.unwrap();
            assert!(first.full_resync);
            let mut paths: Vec<&str> = first.entries.iter().map(|e| e.path.as_str()).collect();
            paths.sort();
            assert_eq!(paths, vec!["a.txt", "sub", "sub/b.txt"]);
            let a = first.entries.iter().find(|e| e.path.as_str() == "a.txt").unwrap();
            assert!(a.fingerprint.hash.is_some());
            assert_eq!(a.fingerprint.size, 3);

            let second = drive.fetch_changes(&root, None).await.unwrap();
            let a2 = second.entries.iter().find(|e| e.path.as_str() == "a.txt").unwrap();
            assert_eq!(a.remote_id, a2.remote_id);

            let idle = drive.fetch_changes(&root, Some(&second.cursor)).await.unwrap();
            assert!(!idle.full_resync);
            assert!(idle.entries.is_empty());
        }

        #[tokio::test]
        async fn test_incremental_changes_after_mutations() {
            let base = TempDir::new().unwrap();
            let scratch = TempDir::new().unwrap();
            let drive = DirectoryRemoteDrive::open(base.path()).await.unwrap();
            let root = remote_root("/");
            let start = drive.fetch_changes(&root, None).await.unwrap();
            assert!(start.entries.is_empty());

            let folder = drive.create_folder(&root, &path("d")).await.unwrap();
            let src = source_file(&scratch, "f", b"hello").await;
            let file = drive.upload(&root, &path("d/f.txt"), &src, None).await.unwrap();

            let batch = drive.fetch_changes(&root, Some(&start.cursor)).await.unwrap();
            let ids: Vec<&RemoteId> = batch.entries.iter().map(|e| &e.remote_id).collect();
            assert_eq!(ids, vec![&folder.remote_id, &file.remote_id]);

            drive.move_item(&root, &folder.remote_id, &path("e")).await.unwrap();
            let moved = drive.fetch_changes(&root, Some(&batch.cursor)).await.unwrap();
            let mut paths: Vec<&str> = moved.entries.iter().map(|e| e.path.as_str()).collect();
            paths.sort();
            assert_eq!(paths, vec!["e", "e/f.txt"]);

            drive.delete_item(&root, &folder.remote_id).await.unwrap();
            let deleted = drive.fetch_changes(&root, Some(&moved.cursor)).await.unwrap();
            assert_eq!(deleted.entries.len(), 2);
            assert!(deleted.entries.iter().all(|e| e.deleted));
            assert!(!base.path().join("e").exists());
        }

        #[tokio::test]
        async fn test_external_modification_and_removal() {
            let base = TempDir::new().unwrap();
            std::fs::write(base.path().join("a.txt"), b"v1").unwrap();
            std::fs::write(base.path().join("b.txt"), b"b").unwrap();
            let drive = DirectoryRemoteDrive::open(base.path()).await.unwrap();
            let root = remote_root("/");
            let listing = drive.fetch_changes(&root, None).await.unwrap();

            std::fs::write(base.path().join("a.txt"), b"version two").unwrap();
            std::fs::remove_file(base.path().join("b.txt")).unwrap();

            let batch = drive.fetch_changes(&root, Some(&listing.cursor)).await.unwrap();
            let a = batch.entries.iter().find(|e| e.path.as_str() == "a.txt").unwrap();
            assert!(!a.deleted);
            assert_eq!(a.fingerprint.size, 11);
            let b = batch.entries.iter().find(|e| e.path.as_str() == "b.txt").unwrap();
            assert!(b.deleted);
        }

        #[tokio::test]
        async fn test_expired_cursor() {
            let base = TempDir::new().unwrap();
            let drive = DirectoryRemoteDrive::open(base.path())
                .await
                .unwrap()
                .with_journal_limit(2);
            let root = remote_root("/");
            let start = drive.fetch_changes(&root, None).await.unwrap();
            for name in ["a", "b", "c", "d"] {
                drive.create_folder(&root, &path(name)).await.unwrap();
            }
            let err = drive.fetch_changes(&root, Some(&start.cursor)).await.unwrap_err();
            assert_eq!(remote_error(&err), Some(&RemoteError::CursorExpired));

            let garbage = ChangeCursor::new("not-a-number".to_string()).unwrap();
            let err = drive.fetch_changes(&root, Some(&garbage)).await.unwrap_err();
            assert_eq!(remote_error(&err), Some(&RemoteError::CursorExpired));
        }

        #[tokio::test]
        async fn test_state_survives_reopen() {
            let base = TempDir::new().unwrap();
            let root = remote_root("/");
            let id = {
                let drive = DirectoryRemoteDrive::open(base.path()).await.unwrap();
                drive.create_folder(&root, &path("keep")).await.unwrap().remote_id
            };
            let drive = DirectoryRemoteDrive::open(base.path()).await.unwrap();
            let listing = drive.fetch_changes(&root, None).await.unwrap();
            assert_eq!(listing.entries.len(), 1);
            assert_eq!(listing.entries[0].remote_id, id);
        }
    }

    mod operations {
        use super::*;

        #[tokio::test]
        async fn test_upload_then_download_roundtrip() {
            let base = TempDir::new().unwrap();
            let scratch = TempDir::new().unwrap();
            let drive = DirectoryRemoteDrive::open(base.path()).await.unwrap();
            let root = remote_root("/Docs");

            let src = source_file(&scratch, "src", b"payload").await;
            let entry = drive.upload(&root, &path("p.bin"), &src, None).await.unwrap();
            assert_eq!(entry.path.as_str(), "p.bin");
            assert!(base.path().join("Docs/p.bin").exists());

            let dest = scratch.path().join("dest");
            let fp = drive.download(&root, &entry.remote_id, &dest, None).await.unwrap();
            assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
            assert_eq!(fp.hash, entry.fingerprint.hash);

            let again = drive.upload(&root, &path("p.bin"), &src, None).await.unwrap_err();
            assert!(matches!(remote_error(&again), Some(RemoteError::AlreadyExists(_))));
        }

        #[tokio::test]
        async fn test_upload_requires_parent_folder() {
            let base = TempDir::new().unwrap();
            let scratch = TempDir::new().unwrap();
            let drive = DirectoryRemoteDrive::open(base.path()).await.unwrap();
            let src = source_file(&scratch, "src", b"x").await;
            let err = drive
                .upload(&remote_root("/"), &path("missing/x.txt"), &src, None)
                .await
                .unwrap_err();
            assert!(matches!(remote_error(&err), Some(RemoteError::NotFound(_))));
        }

        #[tokio::test]
        async fn test_limits() {
            let base = TempDir::new().unwrap();
            let scratch = TempDir::new().unwrap();
            let root = remote_root("/");
            let drive = DirectoryRemoteDrive::open(base.path())
                .await
                .unwrap()
                .with_max_file_size(10)
                .with_quota(12);

            let big = source_file(&scratch, "big", &[0u8; 11]).await;
            let err = drive.upload(&root, &path("big"), &big, None).await.unwrap_err();
            assert_eq!(
                remote_error(&err),
                Some(&RemoteError::TooLarge { size: 11, limit: 10 })
            );

            let eight = source_file(&scratch, "eight", &[1u8; 8]).await;
            drive.upload(&root, &path("one"), &eight, None).await.unwrap();
            let err = drive.upload(&root, &path("two"), &eight, None).await.unwrap_err();
            assert_eq!(remote_error(&err), Some(&RemoteError::QuotaExceeded));
        }

        #[tokio::test]
        async fn test_read_only_items_refuse_changes() {
            let base = TempDir::new().unwrap();
            let scratch = TempDir::new().unwrap();
            let root = remote_root("/");
            let drive = DirectoryRemoteDrive::open(base.path()).await.unwrap();
            let src = source_file(&scratch, "src", b"v1").await;
            let entry = drive.upload(&root, &path("ro.txt"), &src, None).await.unwrap();
            let cursor = drive.fetch_changes(&root, None).await.unwrap().cursor;

            drive.set_read_only(&path("ro.txt"), true).await.unwrap();
            let batch = drive.fetch_changes(&root, Some(&cursor)).await.unwrap();
            assert!(batch.entries[0].read_only);

            let err = drive
                .upload(&root, &path("ro.txt"), &src, Some(&entry.remote_id))
                .await
                .unwrap_err();
            assert!(matches!(remote_error(&err), Some(RemoteError::Forbidden(_))));
            let err = drive.delete_item(&root, &entry.remote_id).await.unwrap_err();
            assert!(matches!(remote_error(&err), Some(RemoteError::Forbidden(_))));
        }

        #[tokio::test]
        async fn test_create_folder_is_idempotent() {
            let base = TempDir::new().unwrap();
            let drive = DirectoryRemoteDrive::open(base.path()).await.unwrap();
            let root = remote_root("/");
            let a = drive.create_folder(&root, &path("f")).await.unwrap();
            let b = drive.create_folder(&root, &path("f")).await.unwrap();
            assert_eq!(a.remote_id, b.remote_id);
        }

        #[tokio::test]
        async fn test_download_of_unknown_item() {
            let base = TempDir::new().unwrap();
            let drive = DirectoryRemoteDrive::open(base.path()).await.unwrap();
            let err = drive
                .download(
                    &remote_root("/"),
                    &RemoteId::new("item-99999999".to_string()).unwrap(),
                    &base.path().join("x"),
                    None,
                )
                .await
                .unwrap_err();
            assert!(matches!(remote_error(&err), Some(RemoteError::NotFound(_))));
        }
    }
}
