//! Conflict detection logic
//!
//! Decides whether the local and remote deltas of one item clash. Only
//! the clash itself is classified here; simple propagation and
//! convergence (both sides made the same change) are left to the
//! reconciler.

use kdsync_core::domain::{ConflictKind, DeltaKind, ItemDelta, Side, SyncItem};
use tracing::debug;

/// Facts about the item's surroundings that a single item cannot see
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeFacts {
    /// The local change lands under a folder deleted remotely
    pub local_target_parent_deleted_remotely: bool,
    /// The remote change lands under a folder deleted locally
    pub remote_target_parent_deleted_locally: bool,
}

/// A detected conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectedConflict {
    pub kind: ConflictKind,
    /// Side whose change is at risk and must be preserved or undone
    pub side: Side,
}

impl DetectedConflict {
    fn new(kind: ConflictKind, side: Side) -> Self {
        Self { kind, side }
    }
}

/// Detects conflicts between the local and remote changes of an item
pub struct ConflictDetector;

impl ConflictDetector {
    /// Classifies the pair of deltas of `item`
    ///
    /// Returns `None` when the changes can be propagated (or merged)
    /// without losing anything.
    pub fn detect(
        item: &SyncItem,
        local: Option<&ItemDelta>,
        remote: Option<&ItemDelta>,
        tree: TreeFacts,
    ) -> Option<DetectedConflict> {
        let detected = match (local, remote) {
            (Some(l), Some(r)) => Self::both_changed(l, r),
            (Some(l), None) => Self::local_only(item, l, tree),
            (None, Some(r)) => Self::remote_only(r, tree),
            (None, None) => None,
        };

        if let Some(conflict) = detected {
            debug!(
                item_id = %item.id(),
                path = %item.local_path(),
                kind = %conflict.kind,
                side = conflict.side.as_str(),
                "Conflict detected"
            );
        }
        detected
    }

    fn both_changed(local: &ItemDelta, remote: &ItemDelta) -> Option<DetectedConflict> {
        use DeltaKind::*;
        match (local.kind, remote.kind) {
            (Deleted, Deleted) => None,
            (Created, Created) => {
                if local.is_directory && remote.is_directory {
                    None
                } else if Self::same_content(local, remote) {
                    None
                } else {
                    Some(DetectedConflict::new(ConflictKind::CreateCreate, Side::Local))
                }
            }
            (_, Deleted) => local
                .changes_content()
                .then(|| DetectedConflict::new(ConflictKind::EditDelete, Side::Local)),
            (Deleted, _) => remote
                .changes_content()
                .then(|| DetectedConflict::new(ConflictKind::DeleteEdit, Side::Remote)),
            _ => {
                if local.changes_path() && remote.changes_path() && local.path != remote.path {
                    return Some(DetectedConflict::new(ConflictKind::RenameRace, Side::Local));
                }
                if local.changes_content()
                    && remote.changes_content()
                    && !Self::same_content(local, remote)
                {
                    return Some(DetectedConflict::new(ConflictKind::EditEdit, Side::Local));
                }
                None
            }
        }
    }

    fn local_only(item: &SyncItem, local: &ItemDelta, tree: TreeFacts) -> Option<DetectedConflict> {
        match local.kind {
            DeltaKind::Created if tree.local_target_parent_deleted_remotely => Some(
                DetectedConflict::new(ConflictKind::CreateInDeletedParent, Side::Local),
            ),
            DeltaKind::Moved if tree.local_target_parent_deleted_remotely => Some(
                DetectedConflict::new(ConflictKind::MoveIntoDeletedParent, Side::Local),
            ),
            _ if local.changes_content() && item.read_only() && item.was_synced() => Some(
                DetectedConflict::new(ConflictKind::EditForbidden, Side::Local),
            ),
            _ => None,
        }
    }

    fn remote_only(remote: &ItemDelta, tree: TreeFacts) -> Option<DetectedConflict> {
        match remote.kind {
            DeltaKind::Created if tree.remote_target_parent_deleted_locally => Some(
                DetectedConflict::new(ConflictKind::CreateInDeletedParent, Side::Remote),
            ),
            DeltaKind::Moved if tree.remote_target_parent_deleted_locally => Some(
                DetectedConflict::new(ConflictKind::MoveIntoDeletedParent, Side::Remote),
            ),
            _ => None,
        }
    }

    fn same_content(local: &ItemDelta, remote: &ItemDelta) -> bool {
        match (&local.fingerprint, &remote.fingerprint) {
            (Some(l), Some(r)) => l.same_content(r),
            _ => false,
        }
    }
}
