//! Local scanning and per-side delta computation
//!
//! The scanner walks the session root and matches every entry to a stored
//! item: first by path, then by node id (moves), then by rebasing onto a
//! moved ancestor for platforms without stable node ids. Entries left over
//! become new items.
//!
//! ## Design Notes
//!
//! - An item's `local_path` stays at the last-synced path while its move
//!   is pending; the current location travels in the scan result. The
//!   baseline only moves once the move has been applied on both sides.
//! - Files are hashed only when size or mtime differ from the last
//!   observation that carried a hash.
//! - Dehydrated items have no file on disk and are never matched. A file
//!   found at a placeholder's path is the user's own and is reported in
//!   [`LocalScan::over_placeholders`]; it never takes over the placeholder.
//! - Paths of placeholders being hydrated or dehydrated are skipped until
//!   the transfer settles.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use kdsync_core::domain::{
    ItemDelta, ItemKind, PlaceholderState, RelativePath, Side, SyncItem, SyncSession, UniqueId,
};
use kdsync_core::ports::{ILocalFileSystem, LocalEntry};

/// Result of one local scan
#[derive(Debug, Default)]
pub struct LocalScan {
    /// Current entry of every matched item, hashes filled in
    pub entries: HashMap<UniqueId, LocalEntry>,
    /// Entries that matched no stored item
    pub new_items: Vec<SyncItem>,
    /// Existing items whose local observation changed
    pub observed: HashSet<UniqueId>,
    /// Unsynced items sitting at a placeholder's path, with the placeholder
    pub over_placeholders: HashMap<UniqueId, UniqueId>,
}

impl LocalScan {
    pub fn entry(&self, item_id: &UniqueId) -> Option<&LocalEntry> {
        self.entries.get(item_id)
    }
}

/// Scans a session root and matches entries to items
pub struct LocalScanner {
    fs: Arc<dyn ILocalFileSystem>,
}

impl LocalScanner {
    pub fn new(fs: Arc<dyn ILocalFileSystem>) -> Self {
        Self { fs }
    }

    /// Scans `session`'s root, updating the local observation of `items`
    #[instrument(skip(self, session, items), fields(session_id = %session.id()))]
    pub async fn scan(
        &self,
        session: &SyncSession,
        items: &mut [SyncItem],
    ) -> anyhow::Result<LocalScan> {
        let root = session.local_root();
        let entries = self.fs.scan(root).await?;

        let placeholders: HashMap<RelativePath, UniqueId> = items
            .iter()
            .filter(|i| i.placeholder() == PlaceholderState::Dehydrated)
            .map(|i| (i.local_path().clone(), *i.id()))
            .collect();
        let in_transfer: HashSet<RelativePath> = items
            .iter()
            .filter(|i| {
                matches!(
                    i.placeholder(),
                    PlaceholderState::Hydrating | PlaceholderState::Dehydrating
                )
            })
            .map(|i| i.local_path().clone())
            .collect();
        // A folder over a placeholder is left alone with its content
        let shadowing: Vec<RelativePath> = entries
            .iter()
            .filter(|e| e.is_directory && placeholders.contains_key(&e.path))
            .map(|e| e.path.clone())
            .collect();
        for folder in &shadowing {
            warn!(path = %folder, "Folder at a placeholder's path, skipping it");
        }
        let mut unmatched: HashMap<RelativePath, LocalEntry> = entries
            .into_iter()
            .filter(|e| !in_transfer.contains(&e.path))
            .filter(|e| {
                !shadowing
                    .iter()
                    .any(|f| e.path == *f || e.path.is_descendant_of(f))
            })
            .map(|e| (e.path.clone(), e))
            .collect();

        let candidates: Vec<usize> = items
            .iter()
            .enumerate()
            .filter(|(_, i)| i.placeholder() == PlaceholderState::Hydrated)
            .map(|(idx, _)| idx)
            .collect();
        let mut matched: HashMap<usize, LocalEntry> = HashMap::new();

        // 1. Same path, same kind
        for &idx in &candidates {
            let item = &items[idx];
            let fits = unmatched
                .get(item.local_path())
                .is_some_and(|e| e.is_directory == item.is_directory());
            if fits {
                if let Some(entry) = unmatched.remove(item.local_path()) {
                    matched.insert(idx, entry);
                }
            }
        }

        // 2. Node id, for items that were present locally
        let mut by_node: HashMap<u64, RelativePath> = unmatched
            .values()
            .filter(|e| !placeholders.contains_key(&e.path))
            .filter_map(|e| e.node_id.map(|n| (n, e.path.clone())))
            .collect();
        for &idx in &candidates {
            if matched.contains_key(&idx) {
                continue;
            }
            let item = &items[idx];
            if !item.present_locally() {
                continue;
            }
            let Some(node) = item.local_node_id() else {
                continue;
            };
            let Some(path) = by_node.get(&node).cloned() else {
                continue;
            };
            let fits = unmatched
                .get(&path)
                .is_some_and(|e| e.is_directory == item.is_directory());
            if fits {
                by_node.remove(&node);
                if let Some(entry) = unmatched.remove(&path) {
                    debug!(from = %item.local_path(), to = %path, "Move detected by node id");
                    matched.insert(idx, entry);
                }
            }
        }

        // 3. Children of a moved folder, when node ids are unavailable
        let moved_dirs: Vec<(RelativePath, RelativePath)> = matched
            .iter()
            .filter(|(idx, e)| e.is_directory && e.path != *items[**idx].local_path())
            .map(|(idx, e)| (items[*idx].local_path().clone(), e.path.clone()))
            .collect();
        if !moved_dirs.is_empty() {
            for &idx in &candidates {
                if matched.contains_key(&idx) || !items[idx].present_locally() {
                    continue;
                }
                let item = &items[idx];
                let rebased = moved_dirs
                    .iter()
                    .find_map(|(from, to)| item.local_path().rebase(from, to));
                let Some(path) = rebased else {
                    continue;
                };
                if placeholders.contains_key(&path) {
                    continue;
                }
                let fits = unmatched
                    .get(&path)
                    .is_some_and(|e| e.is_directory == item.is_directory());
                if fits {
                    if let Some(entry) = unmatched.remove(&path) {
                        matched.insert(idx, entry);
                    }
                }
            }
        }

        let mut scan = LocalScan::default();

        for (idx, mut entry) in matched {
            let item = &mut items[idx];
            if !entry.is_directory {
                let reusable = item
                    .local_fingerprint()
                    .filter(|fp| fp.hash.is_some() && fp.same_metadata(&entry.fingerprint()))
                    .and_then(|fp| fp.hash.clone());
                entry.hash = match reusable {
                    Some(hash) => Some(hash),
                    None => match self.fs.hash_file(root, &entry.path).await {
                        Ok(hash) => Some(hash),
                        Err(e) => {
                            warn!(path = %entry.path, error = %e, "Could not hash file, skipping");
                            continue;
                        }
                    },
                };
            }
            let fingerprint = entry.fingerprint();
            let changed = item.local_fingerprint() != Some(&fingerprint)
                || (entry.node_id.is_some() && item.local_node_id() != entry.node_id);
            if changed {
                let baseline = item.local_path().clone();
                item.observe_local(baseline, fingerprint, entry.node_id);
                scan.observed.insert(*item.id());
            }
            if let Some(placeholder) = placeholders.get(&entry.path) {
                if !item.was_synced() {
                    scan.over_placeholders.insert(*item.id(), *placeholder);
                }
            }
            scan.entries.insert(*item.id(), entry);
        }

        let mut leftovers: Vec<LocalEntry> = unmatched.into_values().collect();
        leftovers.sort_by(|a, b| a.path.cmp(&b.path));
        for mut entry in leftovers {
            if !entry.is_directory {
                match self.fs.hash_file(root, &entry.path).await {
                    Ok(hash) => entry.hash = Some(hash),
                    Err(e) => {
                        warn!(path = %entry.path, error = %e, "Could not hash new file, skipping");
                        continue;
                    }
                }
            }
            let kind = if entry.is_directory {
                ItemKind::Directory
            } else {
                ItemKind::File
            };
            let item = SyncItem::new_local(
                *session.id(),
                kind,
                entry.path.clone(),
                entry.fingerprint(),
                entry.node_id,
            );
            if let Some(placeholder) = placeholders.get(&entry.path) {
                debug!(path = %entry.path, "Local file written over a placeholder");
                scan.over_placeholders.insert(*item.id(), *placeholder);
            }
            scan.entries.insert(*item.id(), entry);
            scan.new_items.push(item);
        }

        debug!(
            matched = scan.entries.len() - scan.new_items.len(),
            new = scan.new_items.len(),
            observed = scan.observed.len(),
            "Local scan complete"
        );
        Ok(scan)
    }
}

// ============================================================================
// Delta computation
// ============================================================================

/// Local change of `item`, given its current entry (if any)
pub fn local_delta(item: &SyncItem, entry: Option<&LocalEntry>) -> Option<ItemDelta> {
    if item.placeholder() != PlaceholderState::Hydrated {
        return None;
    }
    let id = *item.id();
    let remote_id = item.remote_id().cloned();

    let Some(entry) = entry else {
        let was_local = item.was_synced() || item.local_fingerprint().is_some();
        return was_local.then(|| {
            ItemDelta::deleted(id, Side::Local, item.local_path().clone(), item.is_directory())
                .with_remote_id(remote_id)
        });
    };

    let fingerprint = entry.fingerprint();
    let Some(synced) = item.synced_fingerprint() else {
        return Some(
            ItemDelta::created(id, Side::Local, entry.path.clone(), fingerprint, entry.is_directory)
                .with_remote_id(remote_id)
                .with_link_count(entry.link_count),
        );
    };

    let content_changed = !entry.is_directory && !fingerprint.same_content(synced);
    let delta = if entry.path != *item.local_path() {
        ItemDelta::moved(
            id,
            Side::Local,
            item.local_path().clone(),
            entry.path.clone(),
            fingerprint,
            content_changed,
            entry.is_directory,
        )
    } else if content_changed {
        ItemDelta::edited(id, Side::Local, entry.path.clone(), fingerprint)
    } else {
        return None;
    };
    Some(
        delta
            .with_remote_id(remote_id)
            .with_link_count(entry.link_count),
    )
}

/// Remote change of `item`, from its persisted remote observation
pub fn remote_delta(item: &SyncItem) -> Option<ItemDelta> {
    let remote_id = item.remote_id()?.clone();
    let id = *item.id();

    if item.remote_deleted() {
        return Some(
            ItemDelta::deleted(id, Side::Remote, item.local_path().clone(), item.is_directory())
                .with_remote_id(Some(remote_id)),
        );
    }

    let fingerprint = item.remote_fingerprint()?.clone();
    let delta = match item.synced_fingerprint() {
        None => ItemDelta::created(
            id,
            Side::Remote,
            item.remote_path().clone(),
            fingerprint,
            item.is_directory(),
        ),
        Some(synced) => {
            let content_changed = !item.is_directory() && !fingerprint.same_content(synced);
            if item.remote_path() != item.local_path() {
                ItemDelta::moved(
                    id,
                    Side::Remote,
                    item.local_path().clone(),
                    item.remote_path().clone(),
                    fingerprint,
                    content_changed,
                    item.is_directory(),
                )
            } else if content_changed {
                ItemDelta::edited(id, Side::Remote, item.remote_path().clone(), fingerprint)
            } else {
                return None;
            }
        }
    };
    Some(
        delta
            .with_remote_id(Some(remote_id))
            .with_read_only(item.read_only()),
    )
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    use kdsync_core::domain::{
        DeltaKind, FileHash, Fingerprint, RemoteId, RemotePath, SessionId, SyncPath,
    };

    use super::*;
    use crate::filesystem::LocalFileSystem;

    fn path(s: &str) -> RelativePath {
        RelativePath::new(s).unwrap()
    }

    fn fp(hash: &str, size: u64) -> Fingerprint {
        Fingerprint::file(
            Some(FileHash::new(hash.to_string()).unwrap()),
            size,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    fn synced_file(at: &str, content: Fingerprint) -> SyncItem {
        let mut item = SyncItem::new_remote(
            SessionId::new(),
            ItemKind::File,
            RemoteId::new(format!("r-{at}")).unwrap(),
            path(at),
            content.clone(),
        );
        item.mark_converged(path(at), content);
        item
    }

    mod deltas {
        use super::*;

        #[test]
        fn test_unchanged_item_has_no_deltas() {
            let item = synced_file("a.txt", fp("aa", 3));
            let entry = LocalEntry {
                path: path("a.txt"),
                is_directory: false,
                size: 3,
                mtime: Utc::now(),
                node_id: None,
                link_count: 1,
                hash: Some(FileHash::new("aa".to_string()).unwrap()),
            };
            assert!(local_delta(&item, Some(&entry)).is_none());
            assert!(remote_delta(&item).is_none());
        }

        #[test]
        fn test_local_move_with_edit() {
            let item = synced_file("a.txt", fp("aa", 3));
            let entry = LocalEntry {
                path: path("docs/a.txt"),
                is_directory: false,
                size: 5,
                mtime: Utc::now(),
                node_id: Some(7),
                link_count: 1,
                hash: Some(FileHash::new("bb".to_string()).unwrap()),
            };
            let delta = local_delta(&item, Some(&entry)).unwrap();
            assert_eq!(delta.kind, DeltaKind::Moved);
            assert_eq!(delta.previous_path, Some(path("a.txt")));
            assert!(delta.content_changed);
            assert_eq!(delta.remote_id, item.remote_id().cloned());
        }

        #[test]
        fn test_local_deletion_only_for_items_seen_locally() {
            let synced = synced_file("a.txt", fp("aa", 3));
            assert_eq!(
                local_delta(&synced, None).map(|d| d.kind),
                Some(DeltaKind::Deleted)
            );

            let remote_only = SyncItem::new_remote(
                SessionId::new(),
                ItemKind::File,
                RemoteId::new("r9".to_string()).unwrap(),
                path("b.txt"),
                fp("bb", 2),
            );
            assert!(local_delta(&remote_only, None).is_none());
            assert_eq!(
                remote_delta(&remote_only).map(|d| d.kind),
                Some(DeltaKind::Created)
            );
        }

        #[test]
        fn test_dehydrated_items_have_no_local_delta() {
            let mut item = synced_file("a.txt", fp("aa", 3));
            item.make_virtual();
            assert!(local_delta(&item, None).is_none());
        }

        #[test]
        fn test_remote_move_edit_and_deletion() {
            let mut item = synced_file("a.txt", fp("aa", 3));
            item.observe_remote(path("b.txt"), fp("aa", 3), false);
            let delta = remote_delta(&item).unwrap();
            assert_eq!(delta.kind, DeltaKind::Moved);
            assert!(!delta.content_changed);

            item.observe_remote(path("a.txt"), fp("cc", 9), true);
            let delta = remote_delta(&item).unwrap();
            assert_eq!(delta.kind, DeltaKind::Edited);
            assert!(delta.read_only);

            item.observe_remote_deletion();
            let delta = remote_delta(&item).unwrap();
            assert_eq!(delta.kind, DeltaKind::Deleted);
            assert_eq!(delta.path, path("a.txt"));
        }
    }

    mod scanner {
        use super::*;

        fn session(dir: &TempDir) -> SyncSession {
            SyncSession::new(
                "test",
                SyncPath::new(dir.path().to_path_buf()).unwrap(),
                RemotePath::root(),
            )
        }

        fn scanner() -> LocalScanner {
            LocalScanner::new(Arc::new(LocalFileSystem::new()))
        }

        #[tokio::test]
        async fn test_new_entries_become_items() {
            let dir = TempDir::new().unwrap();
            std::fs::create_dir(dir.path().join("docs")).unwrap();
            std::fs::write(dir.path().join("docs/a.txt"), b"abc").unwrap();
            let session = session(&dir);

            let scan = scanner().scan(&session, &mut []).await.unwrap();
            assert_eq!(scan.new_items.len(), 2);
            let file = scan
                .new_items
                .iter()
                .find(|i| i.local_path().as_str() == "docs/a.txt")
                .unwrap();
            let entry = scan.entry(file.id()).unwrap();
            assert!(entry.hash.is_some());
            assert_eq!(
                local_delta(file, Some(entry)).map(|d| d.kind),
                Some(DeltaKind::Created)
            );
        }

        #[tokio::test]
        async fn test_rescan_of_unchanged_tree_is_quiet() {
            let dir = TempDir::new().unwrap();
            std::fs::write(dir.path().join("a.txt"), b"abc").unwrap();
            let session = session(&dir);
            let scanner = scanner();

            let first = scanner.scan(&session, &mut []).await.unwrap();
            let mut items = first.new_items.clone();
            let entry = first.entry(items[0].id()).unwrap().clone();
            items[0].mark_converged(entry.path.clone(), entry.fingerprint());

            let second = scanner.scan(&session, &mut items).await.unwrap();
            assert!(second.new_items.is_empty());
            assert!(local_delta(&items[0], second.entry(items[0].id())).is_none());
        }

        #[tokio::test]
        async fn test_edit_and_deletion_are_detected() {
            let dir = TempDir::new().unwrap();
            std::fs::write(dir.path().join("a.txt"), b"abc").unwrap();
            std::fs::write(dir.path().join("b.txt"), b"bbb").unwrap();
            let session = session(&dir);
            let scanner = scanner();

            let first = scanner.scan(&session, &mut []).await.unwrap();
            let mut items = first.new_items.clone();
            for item in &mut items {
                let entry = first.entry(item.id()).unwrap().clone();
                item.mark_converged(entry.path.clone(), entry.fingerprint());
            }

            std::fs::write(dir.path().join("a.txt"), b"longer content").unwrap();
            std::fs::remove_file(dir.path().join("b.txt")).unwrap();

            let second = scanner.scan(&session, &mut items).await.unwrap();
            let kinds: HashMap<&str, DeltaKind> = items
                .iter()
                .filter_map(|i| {
                    local_delta(i, second.entry(i.id())).map(|d| (i.local_path().as_str(), d.kind))
                })
                .collect();
            assert_eq!(kinds.get("a.txt"), Some(&DeltaKind::Edited));
            assert_eq!(kinds.get("b.txt"), Some(&DeltaKind::Deleted));
            assert!(second.observed.contains(items[0].id()) || second.observed.contains(items[1].id()));
        }

        #[tokio::test]
        async fn test_file_over_placeholder_is_reported() {
            let dir = TempDir::new().unwrap();
            std::fs::write(dir.path().join("big.iso"), b"USER EDIT - not synced").unwrap();
            let session = session(&dir);
            let mut placeholder = synced_file("big.iso", fp("ff", 4096));
            placeholder.make_virtual();
            let mut items = vec![placeholder.clone()];

            let scan = scanner().scan(&session, &mut items).await.unwrap();
            assert_eq!(scan.new_items.len(), 1);
            let mine = &scan.new_items[0];
            assert_eq!(mine.local_path(), &path("big.iso"));
            assert_eq!(scan.over_placeholders.get(mine.id()), Some(placeholder.id()));
            assert!(scan.entry(placeholder.id()).is_none());
        }

        #[tokio::test]
        async fn test_folder_rename_moves_children() {
            let dir = TempDir::new().unwrap();
            std::fs::create_dir(dir.path().join("old")).unwrap();
            std::fs::write(dir.path().join("old/x.txt"), b"x").unwrap();
            let session = session(&dir);
            let scanner = scanner();

            let first = scanner.scan(&session, &mut []).await.unwrap();
            let mut items = first.new_items.clone();
            for item in &mut items {
                let entry = first.entry(item.id()).unwrap().clone();
                item.mark_converged(entry.path.clone(), entry.fingerprint());
                item.set_local_node_id(entry.node_id);
            }

            std::fs::rename(dir.path().join("old"), dir.path().join("new")).unwrap();

            let second = scanner.scan(&session, &mut items).await.unwrap();
            assert!(second.new_items.is_empty());
            for item in &items {
                let delta = local_delta(item, second.entry(item.id())).unwrap();
                assert_eq!(delta.kind, DeltaKind::Moved);
                assert!(delta.path.starts_with(&path("new")));
                assert!(!delta.content_changed);
            }
        }
    }
}
