//! Placeholder manager tests against the SQLite store and a scripted drive

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use kdsync_cache::{DatabasePool, SqliteStateRepository};
use kdsync_core::config::LiteSyncConfig;
use kdsync_core::domain::{
    BlacklistEntry, ChangeCursor, ConflictId, ConflictRecord, FileHash, Fingerprint, ItemKind,
    PlaceholderState, RelativePath, RemoteId, RemotePath, SessionId, SessionStatus, SyncEvent,
    SyncItem, SyncPath, SyncSession, SyncState, UniqueId,
};
use kdsync_core::ports::{
    ActivityRecord, IRemoteDrive, IStateRepository, ItemFilter, NullEventSink, ProgressFn,
    RemoteChangeBatch, RemoteEntry, RemoteError,
};
use kdsync_litesync::{PlaceholderError, PlaceholderManager};

const CONTENT: &[u8] = b"remote content";

/// Drive that serves a fixed payload and can be told to fail or stall
#[derive(Default)]
struct ScriptedDrive {
    downloads: AtomicUsize,
    fail: bool,
    delay: Option<Duration>,
    /// Cancelled once this many downloads completed
    stop_after: Option<(usize, CancellationToken)>,
}

#[async_trait::async_trait]
impl IRemoteDrive for ScriptedDrive {
    async fn fetch_changes(
        &self,
        _root: &RemotePath,
        _cursor: Option<&ChangeCursor>,
    ) -> anyhow::Result<RemoteChangeBatch> {
        Err(RemoteError::Network("not scripted".to_string()).into())
    }

    async fn download(
        &self,
        _root: &RemotePath,
        _remote_id: &RemoteId,
        dest: &Path,
        _progress: Option<ProgressFn>,
    ) -> anyhow::Result<Fingerprint> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            // leave a partial file behind, the manager must clean it up
            tokio::fs::write(dest, b"part").await?;
            return Err(RemoteError::Network("connection reset".to_string()).into());
        }
        tokio::fs::write(dest, CONTENT).await?;
        let done = self.downloads.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((limit, token)) = &self.stop_after {
            if done >= *limit {
                token.cancel();
            }
        }
        Ok(Fingerprint::file(
            Some(FileHash::new("abcd".to_string()).unwrap()),
            CONTENT.len() as u64,
            Utc::now(),
        ))
    }

    async fn upload(
        &self,
        _root: &RemotePath,
        _path: &RelativePath,
        _source: &Path,
        _existing: Option<&RemoteId>,
    ) -> anyhow::Result<RemoteEntry> {
        Err(RemoteError::Forbidden("read only".to_string()).into())
    }

    async fn create_folder(
        &self,
        _root: &RemotePath,
        _path: &RelativePath,
    ) -> anyhow::Result<RemoteEntry> {
        Err(RemoteError::Forbidden("read only".to_string()).into())
    }

    async fn move_item(
        &self,
        _root: &RemotePath,
        _remote_id: &RemoteId,
        _to: &RelativePath,
    ) -> anyhow::Result<RemoteEntry> {
        Err(RemoteError::Forbidden("read only".to_string()).into())
    }

    async fn delete_item(&self, _root: &RemotePath, _remote_id: &RemoteId) -> anyhow::Result<()> {
        Err(RemoteError::Forbidden("read only".to_string()).into())
    }
}

/// Store whose single-item saves fail while `failing` is set
struct FlakyRepository {
    inner: Arc<dyn IStateRepository>,
    failing: AtomicBool,
}

#[async_trait::async_trait]
impl IStateRepository for FlakyRepository {
    async fn save_session(&self, session: &SyncSession) -> anyhow::Result<()> {
        self.inner.save_session(session).await
    }

    async fn get_session(&self, id: &SessionId) -> anyhow::Result<Option<SyncSession>> {
        self.inner.get_session(id).await
    }

    async fn list_sessions(&self) -> anyhow::Result<Vec<SyncSession>> {
        self.inner.list_sessions().await
    }

    async fn set_session_cursor(
        &self,
        id: &SessionId,
        cursor: Option<&ChangeCursor>,
    ) -> anyhow::Result<()> {
        self.inner.set_session_cursor(id, cursor).await
    }

    async fn set_session_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
        detail: Option<&str>,
    ) -> anyhow::Result<()> {
        self.inner.set_session_status(id, status, detail).await
    }

    async fn set_session_lite_sync(&self, id: &SessionId, enabled: bool) -> anyhow::Result<()> {
        self.inner.set_session_lite_sync(id, enabled).await
    }

    async fn record_session_cycle(
        &self,
        id: &SessionId,
        at: chrono::DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.inner.record_session_cycle(id, at).await
    }

    async fn delete_session(&self, id: &SessionId) -> anyhow::Result<()> {
        self.inner.delete_session(id).await
    }

    async fn save_item(&self, item: &SyncItem) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("disk I/O error");
        }
        self.inner.save_item(item).await
    }

    async fn save_items(&self, items: &[SyncItem]) -> anyhow::Result<()> {
        self.inner.save_items(items).await
    }

    async fn get_item(&self, id: &UniqueId) -> anyhow::Result<Option<SyncItem>> {
        self.inner.get_item(id).await
    }

    async fn get_item_by_path(
        &self,
        session_id: &SessionId,
        path: &RelativePath,
    ) -> anyhow::Result<Option<SyncItem>> {
        self.inner.get_item_by_path(session_id, path).await
    }

    async fn get_item_by_remote_id(
        &self,
        session_id: &SessionId,
        remote_id: &RemoteId,
    ) -> anyhow::Result<Option<SyncItem>> {
        self.inner.get_item_by_remote_id(session_id, remote_id).await
    }

    async fn query_items(&self, filter: &ItemFilter) -> anyhow::Result<Vec<SyncItem>> {
        self.inner.query_items(filter).await
    }

    async fn delete_item(&self, id: &UniqueId) -> anyhow::Result<()> {
        self.inner.delete_item(id).await
    }

    async fn set_placeholder_state(
        &self,
        id: &UniqueId,
        state: PlaceholderState,
    ) -> anyhow::Result<()> {
        self.inner.set_placeholder_state(id, state).await
    }

    async fn admit_to_blacklist(&self, entry: &BlacklistEntry) -> anyhow::Result<()> {
        self.inner.admit_to_blacklist(entry).await
    }

    async fn release_from_blacklist(&self, item_id: &UniqueId) -> anyhow::Result<bool> {
        self.inner.release_from_blacklist(item_id).await
    }

    async fn get_blacklist_entry(
        &self,
        item_id: &UniqueId,
    ) -> anyhow::Result<Option<BlacklistEntry>> {
        self.inner.get_blacklist_entry(item_id).await
    }

    async fn list_blacklist(
        &self,
        session_id: Option<&SessionId>,
    ) -> anyhow::Result<Vec<BlacklistEntry>> {
        self.inner.list_blacklist(session_id).await
    }

    async fn save_conflict(&self, conflict: &ConflictRecord) -> anyhow::Result<()> {
        self.inner.save_conflict(conflict).await
    }

    async fn get_conflict(&self, id: &ConflictId) -> anyhow::Result<Option<ConflictRecord>> {
        self.inner.get_conflict(id).await
    }

    async fn list_conflicts(
        &self,
        session_id: Option<&SessionId>,
        unresolved_only: bool,
    ) -> anyhow::Result<Vec<ConflictRecord>> {
        self.inner.list_conflicts(session_id, unresolved_only).await
    }

    async fn open_conflict_for_item(
        &self,
        item_id: &UniqueId,
    ) -> anyhow::Result<Option<ConflictRecord>> {
        self.inner.open_conflict_for_item(item_id).await
    }

    async fn enqueue_hydration(
        &self,
        session_id: &SessionId,
        item_ids: &[UniqueId],
    ) -> anyhow::Result<usize> {
        self.inner.enqueue_hydration(session_id, item_ids).await
    }

    async fn pending_hydrations(&self, session_id: &SessionId) -> anyhow::Result<Vec<UniqueId>> {
        self.inner.pending_hydrations(session_id).await
    }

    async fn complete_hydration(&self, item_id: &UniqueId) -> anyhow::Result<()> {
        self.inner.complete_hydration(item_id).await
    }

    async fn record_activity(&self, event: &SyncEvent) -> anyhow::Result<()> {
        self.inner.record_activity(event).await
    }

    async fn recent_activity(
        &self,
        session_id: Option<&SessionId>,
        limit: u32,
    ) -> anyhow::Result<Vec<ActivityRecord>> {
        self.inner.recent_activity(session_id, limit).await
    }

    async fn get_setting(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.inner.get_setting(key).await
    }

    async fn set_setting(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.inner.set_setting(key, value).await
    }
}

struct Fixture {
    dir: TempDir,
    repository: Arc<dyn IStateRepository>,
    session: SyncSession,
}

impl Fixture {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let pool = DatabasePool::in_memory().await.unwrap();
        let repository: Arc<dyn IStateRepository> =
            Arc::new(SqliteStateRepository::new(pool.pool().clone()));
        let session = SyncSession::new(
            "docs",
            SyncPath::new(dir.path().to_path_buf()).unwrap(),
            RemotePath::root(),
        )
        .with_lite_sync(true);
        repository.save_session(&session).await.unwrap();
        Self {
            dir,
            repository,
            session,
        }
    }

    fn manager(&self, drive: ScriptedDrive) -> PlaceholderManager {
        PlaceholderManager::new(
            Arc::clone(&self.repository),
            Arc::new(drive),
            Arc::new(NullEventSink),
            &LiteSyncConfig {
                hydration_concurrency: 2,
            },
        )
    }

    /// Stores `count` dehydrated, synced files
    async fn placeholders(&self, count: usize) -> Vec<UniqueId> {
        let items: Vec<SyncItem> = (0..count)
            .map(|i| {
                let fingerprint = Fingerprint::file(
                    Some(FileHash::new("abcd".to_string()).unwrap()),
                    CONTENT.len() as u64,
                    Utc::now(),
                );
                let mut item = SyncItem::new_remote(
                    *self.session.id(),
                    ItemKind::File,
                    RemoteId::new(format!("r{i}")).unwrap(),
                    RelativePath::new(format!("f{i}.bin")).unwrap(),
                    fingerprint.clone(),
                );
                item.mark_converged(item.local_path().clone(), fingerprint);
                item.make_virtual();
                item.transition_to(SyncState::Synced).unwrap();
                item
            })
            .collect();
        self.repository.save_items(&items).await.unwrap();
        items.iter().map(|i| *i.id()).collect()
    }

    fn path_of(&self, index: usize) -> std::path::PathBuf {
        self.dir.path().join(format!("f{index}.bin"))
    }

    async fn placeholder_state(&self, id: &UniqueId) -> PlaceholderState {
        self.repository
            .get_item(id)
            .await
            .unwrap()
            .unwrap()
            .placeholder()
    }
}

mod hydration {
    use super::*;

    #[tokio::test]
    async fn test_open_hydrates_and_returns_content() {
        let fixture = Fixture::new().await;
        let ids = fixture.placeholders(1).await;
        let manager = fixture.manager(ScriptedDrive::default());

        let mut file = manager.open(&ids[0]).await.unwrap();
        let mut content = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut file, &mut content)
            .await
            .unwrap();
        assert_eq!(content, CONTENT);
        assert_eq!(
            fixture.placeholder_state(&ids[0]).await,
            PlaceholderState::Hydrated
        );
    }

    #[tokio::test]
    async fn test_concurrent_opens_share_one_download() {
        let fixture = Fixture::new().await;
        let ids = fixture.placeholders(1).await;
        let drive = Arc::new(ScriptedDrive {
            delay: Some(Duration::from_millis(50)),
            ..ScriptedDrive::default()
        });
        let manager = PlaceholderManager::new(
            Arc::clone(&fixture.repository),
            Arc::clone(&drive) as Arc<dyn IRemoteDrive>,
            Arc::new(NullEventSink),
            &LiteSyncConfig::default(),
        );

        let (a, b, c) = tokio::join!(
            manager.open(&ids[0]),
            manager.open(&ids[0]),
            manager.hydrate(&ids[0]),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(drive.downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_hydration_leaves_no_file() {
        let fixture = Fixture::new().await;
        let ids = fixture.placeholders(1).await;
        let manager = fixture.manager(ScriptedDrive {
            fail: true,
            ..ScriptedDrive::default()
        });

        let err = manager.open(&ids[0]).await.unwrap_err();
        assert!(matches!(err, PlaceholderError::HydrationFailed { .. }));
        let io: std::io::Error = err.into();
        assert_eq!(io.kind(), std::io::ErrorKind::Other);

        assert!(!fixture.path_of(0).exists());
        let leftovers: Vec<_> = std::fs::read_dir(fixture.dir.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "temp file left behind");
        assert_eq!(
            fixture.placeholder_state(&ids[0]).await,
            PlaceholderState::Dehydrated
        );
    }

    #[tokio::test]
    async fn test_user_file_at_placeholder_path_is_kept() {
        let fixture = Fixture::new().await;
        let ids = fixture.placeholders(1).await;
        std::fs::write(fixture.path_of(0), b"USER EDIT - not synced").unwrap();
        let drive = Arc::new(ScriptedDrive::default());
        let manager = PlaceholderManager::new(
            Arc::clone(&fixture.repository),
            Arc::clone(&drive) as Arc<dyn IRemoteDrive>,
            Arc::new(NullEventSink),
            &LiteSyncConfig::default(),
        );

        let err = manager.hydrate(&ids[0]).await.unwrap_err();
        assert!(matches!(err, PlaceholderError::HydrationFailed { .. }), "{err:?}");
        assert_eq!(
            std::fs::read(fixture.path_of(0)).unwrap(),
            b"USER EDIT - not synced"
        );
        assert_eq!(drive.downloads.load(Ordering::SeqCst), 0);
        assert_eq!(
            fixture.placeholder_state(&ids[0]).await,
            PlaceholderState::Dehydrated
        );
        let entries = std::fs::read_dir(fixture.dir.path()).unwrap().count();
        assert_eq!(entries, 1, "temp file left behind");
    }

    #[tokio::test]
    async fn test_store_failure_after_fetch_rolls_back() {
        let fixture = Fixture::new().await;
        let ids = fixture.placeholders(1).await;
        let flaky = Arc::new(FlakyRepository {
            inner: Arc::clone(&fixture.repository),
            failing: AtomicBool::new(true),
        });
        let manager = PlaceholderManager::new(
            Arc::clone(&flaky) as Arc<dyn IStateRepository>,
            Arc::new(ScriptedDrive::default()),
            Arc::new(NullEventSink),
            &LiteSyncConfig::default(),
        );

        let err = manager.hydrate(&ids[0]).await.unwrap_err();
        assert!(matches!(err, PlaceholderError::HydrationFailed { .. }), "{err:?}");
        assert!(!fixture.path_of(0).exists());
        assert_eq!(
            fixture.placeholder_state(&ids[0]).await,
            PlaceholderState::Dehydrated
        );

        flaky.failing.store(false, Ordering::SeqCst);
        manager.hydrate(&ids[0]).await.unwrap();
        assert_eq!(std::fs::read(fixture.path_of(0)).unwrap(), CONTENT);
        assert_eq!(
            fixture.placeholder_state(&ids[0]).await,
            PlaceholderState::Hydrated
        );
    }

    #[tokio::test]
    async fn test_cancel_stops_download_and_restores_placeholder() {
        let fixture = Fixture::new().await;
        let ids = fixture.placeholders(1).await;
        let manager = fixture.manager(ScriptedDrive {
            delay: Some(Duration::from_secs(30)),
            ..ScriptedDrive::default()
        });

        let pending = {
            let manager = manager.clone();
            let id = ids[0];
            tokio::spawn(async move { manager.hydrate(&id).await })
        };
        for _ in 0..200 {
            if fixture.placeholder_state(&ids[0]).await == PlaceholderState::Hydrating {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(manager.cancel_hydration(&ids[0]).await);
        assert!(!manager.is_hydrating(&ids[0]));
        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, PlaceholderError::HydrationFailed { .. }), "{err:?}");
        assert_eq!(
            fixture.placeholder_state(&ids[0]).await,
            PlaceholderState::Dehydrated
        );
        let entries = std::fs::read_dir(fixture.dir.path()).unwrap().count();
        assert_eq!(entries, 0);

        assert!(!manager.cancel_hydration(&ids[0]).await);
    }

    #[tokio::test]
    async fn test_excluded_item_is_not_hydrated() {
        let fixture = Fixture::new().await;
        let ids = fixture.placeholders(1).await;
        let mut item = fixture.repository.get_item(&ids[0]).await.unwrap().unwrap();
        item.exclude_from_sync();
        fixture.repository.save_item(&item).await.unwrap();
        let drive = Arc::new(ScriptedDrive::default());
        let manager = PlaceholderManager::new(
            Arc::clone(&fixture.repository),
            Arc::clone(&drive) as Arc<dyn IRemoteDrive>,
            Arc::new(NullEventSink),
            &LiteSyncConfig::default(),
        );

        assert!(manager.hydrate(&ids[0]).await.is_err());
        assert_eq!(drive.downloads.load(Ordering::SeqCst), 0);
        assert!(!fixture.path_of(0).exists());
    }
}

mod dehydration {
    use super::*;

    #[tokio::test]
    async fn test_dehydrate_removes_content() {
        let fixture = Fixture::new().await;
        let ids = fixture.placeholders(1).await;
        let manager = fixture.manager(ScriptedDrive::default());
        manager.hydrate(&ids[0]).await.unwrap();
        assert!(fixture.path_of(0).exists());

        manager.dehydrate(&ids[0]).await.unwrap();
        assert!(!fixture.path_of(0).exists());
        assert_eq!(
            fixture.placeholder_state(&ids[0]).await,
            PlaceholderState::Dehydrated
        );
        let virtual_entries = manager.virtual_entries(&fixture.session).await.unwrap();
        assert_eq!(virtual_entries.len(), 1);
    }

    #[tokio::test]
    async fn test_refuses_locally_modified_file() {
        let fixture = Fixture::new().await;
        let ids = fixture.placeholders(1).await;
        let manager = fixture.manager(ScriptedDrive::default());
        manager.hydrate(&ids[0]).await.unwrap();

        // the scanner saw an edit that is not synced yet
        let mut item = fixture.repository.get_item(&ids[0]).await.unwrap().unwrap();
        let edited = Fingerprint::file(
            Some(FileHash::new("ffff".to_string()).unwrap()),
            99,
            Utc::now(),
        );
        item.observe_local(item.local_path().clone(), edited, None);
        fixture.repository.save_item(&item).await.unwrap();

        let err = manager.dehydrate(&ids[0]).await.unwrap_err();
        assert!(matches!(err, PlaceholderError::DehydrationRefused { .. }));
        assert!(fixture.path_of(0).exists());
    }

    #[tokio::test]
    async fn test_refuses_unsynced_item() {
        let fixture = Fixture::new().await;
        let ids = fixture.placeholders(1).await;
        let manager = fixture.manager(ScriptedDrive::default());
        manager.hydrate(&ids[0]).await.unwrap();

        let mut item = fixture.repository.get_item(&ids[0]).await.unwrap().unwrap();
        item.transition_to(SyncState::SyncPending).unwrap();
        fixture.repository.save_item(&item).await.unwrap();

        let err = manager.dehydrate(&ids[0]).await.unwrap_err();
        assert_eq!(err.error_code().unwrap().code(), "dehydration_refused");
    }
}

mod bulk_queue {
    use super::*;

    #[tokio::test]
    async fn test_disable_resumes_with_remaining_rows_only() {
        let fixture = Fixture::new().await;
        fixture.placeholders(1000).await;

        let first_run = CancellationToken::new();
        let manager = fixture.manager(ScriptedDrive {
            stop_after: Some((400, first_run.clone())),
            ..ScriptedDrive::default()
        });
        let queued = manager
            .set_lite_sync(fixture.session.id(), false)
            .await
            .unwrap();
        assert_eq!(queued, 1000);

        let report = manager
            .resume_pending(fixture.session.id(), &first_run)
            .await
            .unwrap();
        assert_eq!(report.hydrated, 400);
        assert_eq!(report.remaining, 600);
        assert_eq!(
            fixture
                .repository
                .pending_hydrations(fixture.session.id())
                .await
                .unwrap()
                .len(),
            600
        );

        // a new manager stands in for the restarted daemon
        let drive = Arc::new(ScriptedDrive::default());
        let restarted = PlaceholderManager::new(
            Arc::clone(&fixture.repository),
            Arc::clone(&drive) as Arc<dyn IRemoteDrive>,
            Arc::new(NullEventSink),
            &LiteSyncConfig::default(),
        );
        let report = restarted
            .resume_pending(fixture.session.id(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.hydrated, 600);
        assert_eq!(report.remaining, 0);
        assert_eq!(drive.downloads.load(Ordering::SeqCst), 600);

        let dehydrated = fixture
            .repository
            .query_items(
                &ItemFilter::new()
                    .with_session(*fixture.session.id())
                    .with_placeholder(PlaceholderState::Dehydrated),
            )
            .await
            .unwrap();
        assert!(dehydrated.is_empty());
        let session = fixture
            .repository
            .get_session(fixture.session.id())
            .await
            .unwrap()
            .unwrap();
        assert!(!session.lite_sync());
    }

    #[tokio::test]
    async fn test_excluded_items_leave_the_queue() {
        let fixture = Fixture::new().await;
        let ids = fixture.placeholders(2).await;
        let drive = Arc::new(ScriptedDrive::default());
        let manager = PlaceholderManager::new(
            Arc::clone(&fixture.repository),
            Arc::clone(&drive) as Arc<dyn IRemoteDrive>,
            Arc::new(NullEventSink),
            &LiteSyncConfig::default(),
        );
        let queued = manager
            .set_lite_sync(fixture.session.id(), false)
            .await
            .unwrap();
        assert_eq!(queued, 2);

        let mut item = fixture.repository.get_item(&ids[0]).await.unwrap().unwrap();
        item.exclude_from_sync();
        fixture.repository.save_item(&item).await.unwrap();

        let report = manager
            .resume_pending(fixture.session.id(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.hydrated, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.remaining, 0);
        assert_eq!(drive.downloads.load(Ordering::SeqCst), 1);
        assert!(!fixture.path_of(0).exists());
        assert!(fixture
            .repository
            .pending_hydrations(fixture.session.id())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_enable_queues_nothing() {
        let fixture = Fixture::new().await;
        fixture.placeholders(3).await;
        let manager = fixture.manager(ScriptedDrive::default());
        let queued = manager
            .set_lite_sync(fixture.session.id(), true)
            .await
            .unwrap();
        assert_eq!(queued, 0);
    }
}
