//! Remote change feed ingestion
//!
//! Pulls one batch from [`IRemoteDrive::fetch_changes`] and writes the
//! remote observation of every affected item to the store. The reconciler
//! later derives remote deltas from those observations.
//!
//! ## Design Notes
//!
//! - An expired cursor falls back to a full listing. In a full listing,
//!   known items that are missing are treated as remotely deleted.
//! - A remote entry with an unknown id is attached to a local item that
//!   was never synced and sits at the same path, so two independent
//!   creations meet on one item (merged or raised as create-create).
//! - A remote folder created with a subtree above the large-folder
//!   threshold is excluded, subtree included, until the user confirms it.
//! - The cursor is saved only after the batch is stored.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use kdsync_core::domain::{
    ItemKind, RelativePath, RemoteId, SyncErrorCode, SyncEvent, SyncItem, SyncSession, SyncState,
    UniqueId,
};
use kdsync_core::ports::{
    IEventSink, IRemoteDrive, IStateRepository, ItemFilter, RemoteChangeBatch, RemoteEntry,
    RemoteError,
};

use crate::retry::{with_retry, RetryPolicy};

/// Counters of one ingested batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Folders held back for large-folder confirmation
    pub large_folders: usize,
    pub full_resync: bool,
}

impl FeedSummary {
    pub fn is_empty(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.deleted == 0
    }
}

/// Ingests the remote change feed of a session
pub struct RemoteFeed {
    remote: Arc<dyn IRemoteDrive>,
    repository: Arc<dyn IStateRepository>,
    events: Arc<dyn IEventSink>,
    retry: RetryPolicy,
}

impl RemoteFeed {
    pub fn new(
        remote: Arc<dyn IRemoteDrive>,
        repository: Arc<dyn IStateRepository>,
        events: Arc<dyn IEventSink>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            remote,
            repository,
            events,
            retry,
        }
    }

    /// Fetches and stores one batch, then advances the session cursor
    ///
    /// `large_folder_bytes` of 0 disables the large-folder check.
    #[instrument(skip(self, session), fields(session_id = %session.id()))]
    pub async fn ingest(
        &self,
        session: &mut SyncSession,
        large_folder_bytes: u64,
    ) -> anyhow::Result<FeedSummary> {
        let batch = self.fetch(session).await?;
        let mut items = self
            .repository
            .query_items(&ItemFilter::new().with_session(*session.id()))
            .await?;

        let mut changed: HashSet<usize> = HashSet::new();
        let mut created: Vec<usize> = Vec::new();
        let mut summary = FeedSummary {
            full_resync: batch.full_resync,
            ..FeedSummary::default()
        };

        let mut by_remote: HashMap<RemoteId, usize> = items
            .iter()
            .enumerate()
            .filter_map(|(idx, item)| item.remote_id().map(|rid| (rid.clone(), idx)))
            .collect();
        let listed: HashSet<&RemoteId> = batch.entries.iter().map(|e| &e.remote_id).collect();

        for entry in &batch.entries {
            if entry.deleted {
                let Some(&idx) = by_remote.get(&entry.remote_id) else {
                    continue;
                };
                for victim in Self::deletion_scope(&items, idx) {
                    if !items[victim].remote_deleted() {
                        items[victim].observe_remote_deletion();
                        changed.insert(victim);
                        summary.deleted += 1;
                    }
                }
                continue;
            }

            if let Some(&idx) = by_remote.get(&entry.remote_id) {
                let item = &mut items[idx];
                let unchanged = !item.remote_deleted()
                    && item.remote_path() == &entry.path
                    && item.remote_fingerprint() == Some(&entry.fingerprint)
                    && item.read_only() == entry.read_only;
                if !unchanged {
                    item.observe_remote(entry.path.clone(), entry.fingerprint.clone(), entry.read_only);
                    changed.insert(idx);
                    summary.updated += 1;
                }
                continue;
            }

            let idx = match Self::local_twin(&items, entry) {
                Some(idx) => {
                    let item = &mut items[idx];
                    item.assign_remote_id(entry.remote_id.clone())?;
                    item.observe_remote(entry.path.clone(), entry.fingerprint.clone(), entry.read_only);
                    debug!(path = %entry.path, remote_id = %entry.remote_id, "Remote entry attached to local item");
                    summary.updated += 1;
                    idx
                }
                None => {
                    let kind = if entry.is_directory {
                        ItemKind::Directory
                    } else {
                        ItemKind::File
                    };
                    let mut item = SyncItem::new_remote(
                        *session.id(),
                        kind,
                        entry.remote_id.clone(),
                        entry.path.clone(),
                        entry.fingerprint.clone(),
                    );
                    item.observe_remote(entry.path.clone(), entry.fingerprint.clone(), entry.read_only);
                    items.push(item);
                    summary.created += 1;
                    let idx = items.len() - 1;
                    created.push(idx);
                    idx
                }
            };
            by_remote.insert(entry.remote_id.clone(), idx);
            changed.insert(idx);
        }

        if batch.full_resync {
            for (idx, item) in items.iter_mut().enumerate() {
                let missing = item
                    .remote_id()
                    .is_some_and(|rid| !listed.contains(rid));
                if missing && !item.remote_deleted() {
                    item.observe_remote_deletion();
                    changed.insert(idx);
                    summary.deleted += 1;
                }
            }
        }

        if large_folder_bytes > 0 {
            summary.large_folders =
                self.hold_large_folders(session, &mut items, &created, &batch.entries, large_folder_bytes);
        }

        let mut dirty: Vec<usize> = changed.into_iter().collect();
        dirty.sort_unstable();
        let to_save: Vec<SyncItem> = dirty.iter().map(|&idx| items[idx].clone()).collect();
        if !to_save.is_empty() {
            self.repository.save_items(&to_save).await?;
        }

        self.repository
            .set_session_cursor(session.id(), Some(&batch.cursor))
            .await?;
        session.set_cursor(Some(batch.cursor));

        if !summary.is_empty() {
            info!(
                created = summary.created,
                updated = summary.updated,
                deleted = summary.deleted,
                full_resync = summary.full_resync,
                "Remote changes ingested"
            );
        }
        Ok(summary)
    }

    async fn fetch(&self, session: &SyncSession) -> anyhow::Result<RemoteChangeBatch> {
        let root = session.remote_root();
        let result = with_retry(&self.retry, "fetch_changes", || {
            self.remote.fetch_changes(root, session.cursor())
        })
        .await;
        match result {
            Ok(batch) => Ok(batch),
            Err(e) if is_cursor_expired(&e) => {
                warn!("Change cursor expired, requesting a full listing");
                with_retry(&self.retry, "fetch_changes", || {
                    self.remote.fetch_changes(root, None)
                })
                .await
            }
            Err(e) => Err(e),
        }
    }

    /// The deleted item and, for a folder, everything below it
    fn deletion_scope(items: &[SyncItem], idx: usize) -> Vec<usize> {
        let root = &items[idx];
        if !root.is_directory() {
            return vec![idx];
        }
        let folder = root.remote_path().clone();
        items
            .iter()
            .enumerate()
            .filter(|(i, item)| {
                *i == idx || (item.remote_id().is_some() && item.remote_path().is_descendant_of(&folder))
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// A never-synced local item occupying the entry's path
    fn local_twin(items: &[SyncItem], entry: &RemoteEntry) -> Option<usize> {
        items.iter().position(|item| {
            item.remote_id().is_none()
                && !item.was_synced()
                && item.local_path() == &entry.path
                && item.is_directory() == entry.is_directory
        })
    }

    fn hold_large_folders(
        &self,
        session: &SyncSession,
        items: &mut [SyncItem],
        created: &[usize],
        entries: &[RemoteEntry],
        threshold: u64,
    ) -> usize {
        let mut held: Vec<RelativePath> = Vec::new();
        let mut folders: Vec<usize> = created
            .iter()
            .copied()
            .filter(|&idx| items[idx].is_directory())
            .collect();
        folders.sort_by(|a, b| items[*a].remote_path().cmp(items[*b].remote_path()));

        for idx in folders {
            let path = items[idx].remote_path().clone();
            if held.iter().any(|h| path.is_descendant_of(h)) {
                continue;
            }
            let size: u64 = entries
                .iter()
                .filter(|e| !e.deleted && !e.is_directory && e.path.is_descendant_of(&path))
                .map(|e| e.fingerprint.size)
                .sum();
            if size <= threshold {
                continue;
            }

            let item_id: UniqueId = *items[idx].id();
            for &member in created {
                let inside = member == idx || items[member].remote_path().is_descendant_of(&path);
                if !inside {
                    continue;
                }
                if let Err(e) = items[member].transition_to(SyncState::Excluded) {
                    debug!(item_id = %items[member].id(), error = %e, "Item not excluded");
                }
            }
            info!(path = %path, size_bytes = size, "Large remote folder awaits confirmation");
            self.events.emit(SyncEvent::LargeFolderPending {
                session_id: *session.id(),
                item_id,
                size_bytes: size,
                error: SyncErrorCode::LargeFolderPending {
                    path: path.clone(),
                    size_mb: size / (1024 * 1024),
                },
            });
            held.push(path);
        }
        held.len()
    }
}

fn is_cursor_expired(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|c| c.downcast_ref::<RemoteError>())
        .any(|e| matches!(e, RemoteError::CursorExpired))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use kdsync_cache::{DatabasePool, SqliteStateRepository};
    use kdsync_core::domain::{Fingerprint, RemotePath, SyncPath};
    use kdsync_core::ports::NullEventSink;
    use tempfile::TempDir;

    use super::*;
    use crate::remote_dir::DirectoryRemoteDrive;

    fn path(s: &str) -> RelativePath {
        RelativePath::new(s).unwrap()
    }

    struct Fixture {
        _remote_dir: TempDir,
        drive: Arc<DirectoryRemoteDrive>,
        repository: Arc<SqliteStateRepository>,
        feed: RemoteFeed,
        session: SyncSession,
        source: TempDir,
    }

    async fn fixture() -> Fixture {
        let remote_dir = TempDir::new().unwrap();
        let drive = Arc::new(DirectoryRemoteDrive::open(remote_dir.path()).await.unwrap());
        let pool = DatabasePool::in_memory().await.unwrap();
        let repository = Arc::new(SqliteStateRepository::new(pool.pool().clone()));
        let session = SyncSession::new(
            "feed",
            SyncPath::new(PathBuf::from("/srv/kdsync-feed")).unwrap(),
            RemotePath::root(),
        );
        repository.save_session(&session).await.unwrap();
        let feed = RemoteFeed::new(
            drive.clone(),
            repository.clone(),
            Arc::new(NullEventSink),
            RetryPolicy::new(1, std::time::Duration::from_millis(1)),
        );
        Fixture {
            _remote_dir: remote_dir,
            drive,
            repository,
            feed,
            session,
            source: TempDir::new().unwrap(),
        }
    }

    async fn upload(fx: &Fixture, at: &str, content: &[u8]) -> RemoteEntry {
        let source = fx.source.path().join("payload");
        std::fs::write(&source, content).unwrap();
        fx.drive
            .upload(&RemotePath::root(), &path(at), &source, None)
            .await
            .unwrap()
    }

    async fn stored(fx: &Fixture) -> Vec<SyncItem> {
        fx.repository
            .query_items(&ItemFilter::new().with_session(*fx.session.id()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_batch_creates_items_and_saves_cursor() {
        let mut fx = fixture().await;
        upload(&fx, "docs/a.txt", b"alpha").await;

        let mut session = fx.session.clone();
        let summary = fx.feed.ingest(&mut session, 0).await.unwrap();
        fx.session = session;

        assert!(summary.full_resync);
        assert!(summary.created >= 2);
        assert!(fx.session.cursor().is_some());
        let items = stored(&fx).await;
        let file = items.iter().find(|i| i.remote_path() == &path("docs/a.txt")).unwrap();
        assert_eq!(file.state(), SyncState::Unsynced);
        assert!(file.remote_id().is_some());
        assert!(!file.was_synced());
    }

    #[tokio::test]
    async fn test_second_batch_only_reports_changes() {
        let fx = fixture().await;
        upload(&fx, "a.txt", b"alpha").await;
        let mut session = fx.session.clone();
        fx.feed.ingest(&mut session, 0).await.unwrap();

        let summary = fx.feed.ingest(&mut session, 0).await.unwrap();
        assert!(!summary.full_resync);
        assert!(summary.is_empty());

        upload(&fx, "b.txt", b"beta").await;
        let summary = fx.feed.ingest(&mut session, 0).await.unwrap();
        assert_eq!(summary.created, 1);
    }

    #[tokio::test]
    async fn test_remote_delete_marks_item() {
        let fx = fixture().await;
        let entry = upload(&fx, "a.txt", b"alpha").await;
        let mut session = fx.session.clone();
        fx.feed.ingest(&mut session, 0).await.unwrap();

        fx.drive
            .delete_item(&RemotePath::root(), &entry.remote_id)
            .await
            .unwrap();
        let summary = fx.feed.ingest(&mut session, 0).await.unwrap();
        assert_eq!(summary.deleted, 1);
        let items = stored(&fx).await;
        assert!(items[0].remote_deleted());
    }

    #[tokio::test]
    async fn test_full_listing_marks_missing_items_deleted() {
        let fx = fixture().await;
        let mut ghost = SyncItem::new_remote(
            *fx.session.id(),
            ItemKind::File,
            RemoteId::new("gone".to_string()).unwrap(),
            path("ghost.txt"),
            Fingerprint::file(None, 1, chrono::Utc::now()),
        );
        ghost.mark_converged(path("ghost.txt"), Fingerprint::file(None, 1, chrono::Utc::now()));
        fx.repository.save_item(&ghost).await.unwrap();

        let mut session = fx.session.clone();
        let summary = fx.feed.ingest(&mut session, 0).await.unwrap();
        assert!(summary.full_resync);
        assert_eq!(summary.deleted, 1);
        let reloaded = fx.repository.get_item(ghost.id()).await.unwrap().unwrap();
        assert!(reloaded.remote_deleted());
    }

    #[tokio::test]
    async fn test_remote_entry_attaches_to_unsynced_local_item() {
        let fx = fixture().await;
        let local = SyncItem::new_local(
            *fx.session.id(),
            ItemKind::File,
            path("same.txt"),
            Fingerprint::file(None, 5, chrono::Utc::now()),
            None,
        );
        fx.repository.save_item(&local).await.unwrap();
        upload(&fx, "same.txt", b"other").await;

        let mut session = fx.session.clone();
        fx.feed.ingest(&mut session, 0).await.unwrap();
        let items = stored(&fx).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id(), local.id());
        assert!(items[0].remote_id().is_some());
    }

    #[tokio::test]
    async fn test_large_folder_is_held_back() {
        let fx = fixture().await;
        upload(&fx, "big/one.bin", &[0u8; 2048]).await;
        upload(&fx, "big/two.bin", &[0u8; 2048]).await;
        upload(&fx, "small.txt", b"s").await;

        let mut session = fx.session.clone();
        let summary = fx.feed.ingest(&mut session, 1024).await.unwrap();
        assert_eq!(summary.large_folders, 1);
        let items = stored(&fx).await;
        for item in &items {
            let inside = item.remote_path() == &path("big") || item.remote_path().is_descendant_of(&path("big"));
            let expected = if inside { SyncState::Excluded } else { SyncState::Unsynced };
            assert_eq!(item.state(), expected, "{}", item.remote_path());
        }
    }
}
