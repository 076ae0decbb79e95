//! Integration tests for SqliteStateRepository
//!
//! These tests verify the IStateRepository methods using an in-memory
//! SQLite database. Each test function creates a fresh database to
//! ensure test isolation.

use std::path::PathBuf;

use chrono::{Duration, Utc};

use kdsync_cache::{DatabasePool, SqliteStateRepository, SCHEMA_VERSION};
use kdsync_core::domain::{
    newtypes::{FileHash, RelativePath, RemoteId, RemotePath, SessionId, SyncPath, UniqueId},
    BlacklistEntry, BlacklistReason, BlacklistScope, ConflictKind, ConflictPolicy,
    ConflictRecord, Direction, Fingerprint, ItemKind, PlaceholderState, SessionStatus, SyncEvent,
    SyncItem, SyncSession, SyncState,
};
use kdsync_core::ports::{IStateRepository, ItemFilter};

// ============================================================================
// Test helpers
// ============================================================================

/// Create a fresh in-memory repository for each test
async fn setup() -> SqliteStateRepository {
    let pool = DatabasePool::in_memory()
        .await
        .expect("Failed to create in-memory database");
    SqliteStateRepository::new(pool.pool().clone())
}

async fn create_session(repo: &SqliteStateRepository, root: &str) -> SyncSession {
    let session = SyncSession::new(
        "Documents",
        SyncPath::new(PathBuf::from(root)).unwrap(),
        RemotePath::new("/Documents".to_string()).unwrap(),
    );
    repo.save_session(&session).await.unwrap();
    session
}

fn path(s: &str) -> RelativePath {
    RelativePath::new(s).unwrap()
}

fn file_fp(byte: &str, size: u64) -> Fingerprint {
    Fingerprint::file(Some(FileHash::new(byte.repeat(32)).unwrap()), size, Utc::now())
}

fn local_file(session: &SyncSession, p: &str) -> SyncItem {
    SyncItem::new_local(
        *session.id(),
        ItemKind::File,
        path(p),
        file_fp("aa", 1024),
        Some(42),
    )
}

// ============================================================================
// Session tests
// ============================================================================

#[tokio::test]
async fn test_save_and_get_session() {
    let repo = setup().await;
    let session = create_session(&repo, "/home/user/Documents").await;

    let retrieved = repo.get_session(session.id()).await.unwrap().unwrap();
    assert_eq!(retrieved.name(), "Documents");
    assert_eq!(retrieved.local_root().to_string(), "/home/user/Documents");
    assert_eq!(retrieved.remote_root().as_str(), "/Documents");
    assert_eq!(retrieved.status(), SessionStatus::Active);
    assert!(!retrieved.lite_sync());
    assert!(retrieved.cursor().is_none());
}

#[tokio::test]
async fn test_update_session_status_and_cursor() {
    let repo = setup().await;
    let mut session = create_session(&repo, "/home/user/Documents").await;

    session
        .transition_to(SessionStatus::Paused, Some("Paused by user".to_string()))
        .unwrap();
    session.set_lite_sync(true);
    session.set_cursor(Some(
        kdsync_core::domain::ChangeCursor::new("17".to_string()).unwrap(),
    ));
    repo.save_session(&session).await.unwrap();

    let retrieved = repo.get_session(session.id()).await.unwrap().unwrap();
    assert_eq!(retrieved.status(), SessionStatus::Paused);
    assert_eq!(retrieved.status_detail(), Some("Paused by user"));
    assert!(retrieved.lite_sync());
    assert_eq!(retrieved.cursor().unwrap().as_str(), "17");
}

#[tokio::test]
async fn test_session_setters_touch_one_column() {
    let repo = setup().await;
    let session = create_session(&repo, "/home/user/Documents").await;
    let cursor = kdsync_core::domain::ChangeCursor::new("42".to_string()).unwrap();

    repo.set_session_lite_sync(session.id(), true).await.unwrap();
    repo.set_session_cursor(session.id(), Some(&cursor))
        .await
        .unwrap();
    repo.set_session_status(session.id(), SessionStatus::Error, Some("root gone"))
        .await
        .unwrap();
    let at = Utc::now();
    repo.record_session_cycle(session.id(), at).await.unwrap();

    let retrieved = repo.get_session(session.id()).await.unwrap().unwrap();
    assert!(retrieved.lite_sync());
    assert_eq!(retrieved.cursor().unwrap().as_str(), "42");
    assert_eq!(retrieved.status(), SessionStatus::Error);
    assert_eq!(retrieved.status_detail(), Some("root gone"));
    assert_eq!(
        retrieved.last_cycle_at().unwrap().timestamp(),
        at.timestamp()
    );
    assert_eq!(retrieved.name(), "Documents");

    let missing = repo.set_session_cursor(&SessionId::new(), None).await;
    assert!(missing.is_err());
}

#[tokio::test]
async fn test_list_sessions() {
    let repo = setup().await;
    create_session(&repo, "/home/user/A").await;
    create_session(&repo, "/home/user/B").await;

    let sessions = repo.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 2);
}

#[tokio::test]
async fn test_delete_session_removes_owned_rows_only() {
    let repo = setup().await;
    let session = create_session(&repo, "/home/user/A").await;
    let other = create_session(&repo, "/home/user/B").await;

    let item = local_file(&session, "a.txt");
    let kept = local_file(&other, "b.txt");
    repo.save_items(&[item.clone(), kept.clone()]).await.unwrap();
    repo.enqueue_hydration(session.id(), &[*item.id()])
        .await
        .unwrap();
    let conflict = ConflictRecord::new(
        *session.id(),
        *item.id(),
        path("a.txt"),
        ConflictKind::EditEdit,
        ConflictPolicy::Manual,
        Utc::now(),
    );
    repo.save_conflict(&conflict).await.unwrap();

    repo.delete_session(session.id()).await.unwrap();

    assert!(repo.get_session(session.id()).await.unwrap().is_none());
    assert!(repo.get_item(item.id()).await.unwrap().is_none());
    assert!(repo.get_conflict(conflict.id()).await.unwrap().is_none());
    assert!(repo
        .pending_hydrations(session.id())
        .await
        .unwrap()
        .is_empty());
    assert!(repo.get_item(kept.id()).await.unwrap().is_some());
}

// ============================================================================
// SyncItem tests
// ============================================================================

#[tokio::test]
async fn test_save_and_get_item() {
    let repo = setup().await;
    let session = create_session(&repo, "/home/user/Documents").await;
    let item = local_file(&session, "docs/report.txt");

    repo.save_item(&item).await.unwrap();

    let retrieved = repo.get_item(item.id()).await.unwrap().unwrap();
    assert_eq!(retrieved.id(), item.id());
    assert_eq!(retrieved.session_id(), session.id());
    assert_eq!(retrieved.local_path().as_str(), "docs/report.txt");
    assert_eq!(retrieved.kind(), ItemKind::File);
    assert_eq!(retrieved.local_node_id(), Some(42));
    assert_eq!(retrieved.state(), SyncState::Unsynced);
    assert_eq!(
        retrieved.local_fingerprint().unwrap().size,
        item.local_fingerprint().unwrap().size
    );
    assert!(retrieved.synced_fingerprint().is_none());
}

#[tokio::test]
async fn test_get_item_not_found() {
    let repo = setup().await;
    let result = repo.get_item(&UniqueId::new()).await.unwrap();
    assert!(result.is_none());
}

#[tokio::test]
async fn test_get_item_by_path_and_remote_id() {
    let repo = setup().await;
    let session = create_session(&repo, "/home/user/Documents").await;
    let remote_id = RemoteId::new("r-17".to_string()).unwrap();
    let item = SyncItem::new_remote(
        *session.id(),
        ItemKind::File,
        remote_id.clone(),
        path("remote_file.txt"),
        file_fp("bb", 2048),
    );
    repo.save_item(&item).await.unwrap();

    let by_path = repo
        .get_item_by_path(session.id(), &path("remote_file.txt"))
        .await
        .unwrap();
    assert_eq!(by_path.unwrap().id(), item.id());

    let by_remote = repo
        .get_item_by_remote_id(session.id(), &remote_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_remote.id(), item.id());
    assert_eq!(by_remote.remote_id(), Some(&remote_id));

    // Lookups are scoped to the session
    let other = SessionId::new();
    assert!(repo
        .get_item_by_remote_id(&other, &remote_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_save_item_upsert_keeps_placeholder_state() {
    let repo = setup().await;
    let session = create_session(&repo, "/home/user/Documents").await;
    let mut item = local_file(&session, "a.txt");
    repo.save_item(&item).await.unwrap();

    repo.set_placeholder_state(item.id(), PlaceholderState::Dehydrated)
        .await
        .unwrap();

    // An in-memory copy still says Hydrated; saving it must not undo the change
    let fp = file_fp("cc", 10);
    item.mark_converged(path("a.txt"), fp);
    item.transition_to(SyncState::Synced).unwrap();
    repo.save_item(&item).await.unwrap();

    let retrieved = repo.get_item(item.id()).await.unwrap().unwrap();
    assert_eq!(retrieved.placeholder(), PlaceholderState::Dehydrated);
    assert_eq!(retrieved.state(), SyncState::Synced);
    assert!(retrieved.synced_fingerprint().is_some());
}

#[tokio::test]
async fn test_set_placeholder_state_unknown_item_fails() {
    let repo = setup().await;
    let result = repo
        .set_placeholder_state(&UniqueId::new(), PlaceholderState::Hydrated)
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_query_items_with_filters() {
    let repo = setup().await;
    let session = create_session(&repo, "/home/user/Documents").await;

    let mut synced = local_file(&session, "docs/a.txt");
    synced.mark_converged(path("docs/a.txt"), file_fp("aa", 1));
    synced.transition_to(SyncState::Synced).unwrap();
    let nested = local_file(&session, "docs/sub/b.txt");
    let sibling = local_file(&session, "docs_old/c.txt");
    let underscore = local_file(&session, "doc_s/d.txt");
    repo.save_items(&[synced.clone(), nested, sibling, underscore])
        .await
        .unwrap();

    let all = repo
        .query_items(&ItemFilter::new().with_session(*session.id()))
        .await
        .unwrap();
    assert_eq!(all.len(), 4);

    let in_docs = repo
        .query_items(
            &ItemFilter::new()
                .with_session(*session.id())
                .with_path_prefix(path("docs")),
        )
        .await
        .unwrap();
    let paths: Vec<&str> = in_docs.iter().map(|i| i.local_path().as_str()).collect();
    assert_eq!(paths, vec!["docs/a.txt", "docs/sub/b.txt"]);

    // `_` in the prefix is literal
    let literal = repo
        .query_items(&ItemFilter::new().with_path_prefix(path("doc_s")))
        .await
        .unwrap();
    assert_eq!(literal.len(), 1);

    let only_synced = repo
        .query_items(&ItemFilter::new().with_state(SyncState::Synced))
        .await
        .unwrap();
    assert_eq!(only_synced.len(), 1);
    assert_eq!(only_synced[0].id(), synced.id());
}

#[tokio::test]
async fn test_delete_item() {
    let repo = setup().await;
    let session = create_session(&repo, "/home/user/Documents").await;
    let item = local_file(&session, "a.txt");
    repo.save_item(&item).await.unwrap();

    repo.delete_item(item.id()).await.unwrap();
    assert!(repo.get_item(item.id()).await.unwrap().is_none());
}

// ============================================================================
// Blacklist tests
// ============================================================================

fn entry_for(item: &SyncItem, reason: BlacklistReason) -> BlacklistEntry {
    let now = Utc::now();
    BlacklistEntry::new(
        *item.id(),
        *item.session_id(),
        item.local_path().clone(),
        reason,
        reason.default_scope(),
        now,
        Some(now + Duration::hours(1)),
    )
}

#[tokio::test]
async fn test_admit_to_blacklist_sets_state_atomically() {
    let repo = setup().await;
    let session = create_session(&repo, "/home/user/Documents").await;
    let item = local_file(&session, "Report.txt");
    repo.save_item(&item).await.unwrap();

    let entry = entry_for(&item, BlacklistReason::DuplicateCaseInsensitiveName);
    repo.admit_to_blacklist(&entry).await.unwrap();

    let retrieved = repo.get_item(item.id()).await.unwrap().unwrap();
    assert_eq!(
        retrieved.state(),
        SyncState::Blacklisted(BlacklistScope::Temporary)
    );
    let attached = retrieved.blacklist().unwrap();
    assert_eq!(attached.reason(), BlacklistReason::DuplicateCaseInsensitiveName);

    let listed = repo.list_blacklist(Some(session.id())).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].item_id(), item.id());
}

#[tokio::test]
async fn test_admit_unknown_item_fails_without_entry() {
    let repo = setup().await;
    let session = create_session(&repo, "/home/user/Documents").await;
    let ghost = local_file(&session, "ghost.txt");

    let entry = entry_for(&ghost, BlacklistReason::TechnicalError);
    assert!(repo.admit_to_blacklist(&entry).await.is_err());
    assert!(repo.get_blacklist_entry(ghost.id()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_release_from_blacklist_readmits_item() {
    let repo = setup().await;
    let session = create_session(&repo, "/home/user/Documents").await;
    let item = local_file(&session, "CON");
    repo.save_item(&item).await.unwrap();
    repo.admit_to_blacklist(&entry_for(&item, BlacklistReason::ReservedName))
        .await
        .unwrap();

    assert!(repo.release_from_blacklist(item.id()).await.unwrap());
    assert!(!repo.release_from_blacklist(item.id()).await.unwrap());

    let retrieved = repo.get_item(item.id()).await.unwrap().unwrap();
    assert_eq!(retrieved.state(), SyncState::Unsynced);
    assert!(retrieved.blacklist().is_none());
    assert!(repo.list_blacklist(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_save_item_leaving_blacklist_drops_entry() {
    let repo = setup().await;
    let session = create_session(&repo, "/home/user/Documents").await;
    let item = local_file(&session, "a.txt");
    repo.save_item(&item).await.unwrap();
    repo.admit_to_blacklist(&entry_for(&item, BlacklistReason::TooLarge))
        .await
        .unwrap();

    let mut item = repo.get_item(item.id()).await.unwrap().unwrap();
    item.transition_to(SyncState::Unsynced).unwrap();
    item.transition_to(SyncState::Synced).unwrap();
    repo.save_item(&item).await.unwrap();

    // Never Synced and blacklisted at the same time
    assert!(repo.get_blacklist_entry(item.id()).await.unwrap().is_none());
}

// ============================================================================
// Conflict tests
// ============================================================================

#[tokio::test]
async fn test_save_and_resolve_conflict() {
    let repo = setup().await;
    let session = create_session(&repo, "/home/user/Documents").await;
    let item = local_file(&session, "a.txt");
    repo.save_item(&item).await.unwrap();

    let mut conflict = ConflictRecord::new(
        *session.id(),
        *item.id(),
        path("a.txt"),
        ConflictKind::EditEdit,
        ConflictPolicy::Manual,
        Utc::now(),
    )
    .with_versions(Some(file_fp("aa", 1)), Some(file_fp("bb", 2)));
    repo.save_conflict(&conflict).await.unwrap();

    let open = repo.open_conflict_for_item(item.id()).await.unwrap().unwrap();
    assert_eq!(open.id(), conflict.id());
    assert!(open.awaits_user());
    assert_eq!(open.remote().unwrap().size, 2);

    conflict.resolve(ConflictPolicy::KeepBoth, Utc::now());
    repo.save_conflict(&conflict).await.unwrap();

    assert!(repo.open_conflict_for_item(item.id()).await.unwrap().is_none());
    assert!(repo
        .list_conflicts(Some(session.id()), true)
        .await
        .unwrap()
        .is_empty());
    let all = repo.list_conflicts(None, false).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].policy(), ConflictPolicy::KeepBoth);
}

// ============================================================================
// Hydration queue tests
// ============================================================================

#[tokio::test]
async fn test_hydration_queue_order_and_dedup() {
    let repo = setup().await;
    let session = create_session(&repo, "/home/user/Documents").await;
    let ids: Vec<UniqueId> = (0..5).map(|_| UniqueId::new()).collect();

    assert_eq!(repo.enqueue_hydration(session.id(), &ids).await.unwrap(), 5);
    assert_eq!(
        repo.enqueue_hydration(session.id(), &ids[..2]).await.unwrap(),
        0
    );

    repo.complete_hydration(&ids[0]).await.unwrap();
    repo.complete_hydration(&ids[3]).await.unwrap();

    let pending = repo.pending_hydrations(session.id()).await.unwrap();
    assert_eq!(pending, vec![ids[1], ids[2], ids[4]]);
}

// ============================================================================
// Activity and settings tests
// ============================================================================

#[tokio::test]
async fn test_record_and_list_activity() {
    let repo = setup().await;
    let sid = SessionId::new();

    for name in ["a.txt", "b.txt", "c.txt"] {
        repo.record_activity(&SyncEvent::ItemAdded {
            session_id: sid,
            item_id: UniqueId::new(),
            path: path(name),
            direction: Direction::Down,
        })
        .await
        .unwrap();
    }
    repo.record_activity(&SyncEvent::SessionResumed {
        session_id: SessionId::new(),
    })
    .await
    .unwrap();

    let recent = repo.recent_activity(Some(&sid), 2).await.unwrap();
    assert_eq!(recent.len(), 2);
    match &recent[0].event {
        SyncEvent::ItemAdded { path, .. } => assert_eq!(path.as_str(), "c.txt"),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(repo.recent_activity(None, 10).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_settings_roundtrip() {
    let repo = setup().await;
    assert!(repo.get_setting("max_concurrent_actions").await.unwrap().is_none());

    repo.set_setting("max_concurrent_actions", "4").await.unwrap();
    repo.set_setting("max_concurrent_actions", "8").await.unwrap();
    assert_eq!(
        repo.get_setting("max_concurrent_actions").await.unwrap(),
        Some("8".to_string())
    );
}

// ============================================================================
// Migration tests
// ============================================================================

#[tokio::test]
async fn test_legacy_blacklist_rows_survive_upgrade() {
    let db = DatabasePool::in_memory_unmigrated().await.unwrap();
    db.migrate_to(1).await.unwrap();
    assert_eq!(db.schema_version().await.unwrap(), 1);

    // Populate the v1 layout
    let session = SyncSession::new(
        "Legacy",
        SyncPath::new(PathBuf::from("/home/user/Legacy")).unwrap(),
        RemotePath::root(),
    );
    let repo = SqliteStateRepository::new(db.pool().clone());
    repo.save_session(&session).await.unwrap();
    let temporary = local_file(&session, "big.iso");
    let permanent = local_file(&session, "AUX");

    // Rows written by the previous release, straight into the v1 tables
    for (item, state) in [
        (&temporary, "blacklisted_temporary"),
        (&permanent, "blacklisted_permanent"),
    ] {
        sqlx::query(
            "INSERT INTO sync_items (id, session_id, kind, local_path, remote_path, state, updated_at) \
             VALUES (?, ?, 'file', ?, ?, ?, ?)",
        )
        .bind(item.id().to_string())
        .bind(session.id().to_string())
        .bind(item.local_path().as_str())
        .bind(item.local_path().as_str())
        .bind(state)
        .bind(Utc::now().to_rfc3339())
        .execute(db.pool())
        .await
        .unwrap();
    }
    let first_seen = "2025-06-01T08:00:00+00:00";
    for (item, reason, permanent_flag) in [
        (&temporary, "too-large", 0),
        (&permanent, "reserved-name", 1),
    ] {
        sqlx::query(
            "INSERT INTO blacklist (item_id, session_id, path, reason, is_permanent, first_seen) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(item.id().to_string())
        .bind(session.id().to_string())
        .bind(item.local_path().as_str())
        .bind(reason)
        .bind(permanent_flag)
        .bind(first_seen)
        .execute(db.pool())
        .await
        .unwrap();
    }

    // Upgrade
    assert_eq!(db.migrate().await.unwrap(), 1);
    assert_eq!(db.schema_version().await.unwrap(), SCHEMA_VERSION);

    let entries = repo.list_blacklist(Some(session.id())).await.unwrap();
    assert_eq!(entries.len(), 2);

    let temp = repo.get_blacklist_entry(temporary.id()).await.unwrap().unwrap();
    assert_eq!(temp.reason(), BlacklistReason::TooLarge);
    assert_eq!(temp.scope(), BlacklistScope::Temporary);
    assert!(temp.is_due(Utc::now()));

    let perm = repo.get_blacklist_entry(permanent.id()).await.unwrap().unwrap();
    assert_eq!(perm.reason(), BlacklistReason::ReservedName);
    assert_eq!(perm.scope(), BlacklistScope::Permanent);
    assert!(perm.retry_at().is_none());
    assert_eq!(perm.first_seen().to_rfc3339(), first_seen);

    let item = repo.get_item(permanent.id()).await.unwrap().unwrap();
    assert_eq!(item.blacklist().unwrap().reason(), BlacklistReason::ReservedName);
}
