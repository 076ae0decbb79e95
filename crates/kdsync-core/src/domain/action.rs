//! Planned sync actions
//!
//! The reconciler turns deltas into `SyncAction`s. Each action belongs to
//! an execution phase; phases run in order, and within a phase actions may
//! run concurrently.
//!
//! ## Phases
//!
//! | Phase     | Actions                                  | Order        |
//! |-----------|------------------------------------------|--------------|
//! | Preserve  | conflict copies, rescues                 | any          |
//! | Structure | create folders                           | parents first|
//! | Move      | moves and renames                        | parents first|
//! | Content   | transfers, placeholders, metadata        | any          |
//! | Delete    | deletions, forgotten records             | deepest first|

use std::fmt;

use serde::{Deserialize, Serialize};

use super::event::{ActivityKind, Direction};
use super::newtypes::{ConflictId, RelativePath, RemoteId, UniqueId};

/// Execution phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Preserve,
    Structure,
    Move,
    Content,
    Delete,
}

impl Phase {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Preserve => "preserve",
            Phase::Structure => "structure",
            Phase::Move => "move",
            Phase::Content => "content",
            Phase::Delete => "delete",
        }
    }
}

/// What an action does
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    /// Fetch remote content into `path` (temp file, then atomic rename)
    Download { remote_id: RemoteId, path: RelativePath },
    /// Push local content; overwrites `remote_id` when present
    Upload {
        path: RelativePath,
        remote_id: Option<RemoteId>,
    },
    CreateLocalFolder { path: RelativePath },
    CreateRemoteFolder { path: RelativePath },
    /// Apply a remote move locally
    MoveLocal { from: RelativePath, to: RelativePath },
    /// Apply a local move remotely
    MoveRemote {
        remote_id: RemoteId,
        from: RelativePath,
        to: RelativePath,
    },
    DeleteLocal { path: RelativePath },
    DeleteRemote {
        remote_id: RemoteId,
        path: RelativePath,
    },
    /// Move local content out of the way so it survives a conflict
    ///
    /// The content becomes the new item `new_item`. With `forget_original`
    /// the original record is dropped (rescue of a remotely deleted item).
    SetAside {
        from: RelativePath,
        to: RelativePath,
        new_item: UniqueId,
        forget_original: bool,
    },
    /// Fetch the remote content of `remote_id` into a new local item at `to`
    ///
    /// Preserves the remote version before the local one overwrites it.
    DownloadCopy {
        remote_id: RemoteId,
        to: RelativePath,
        new_item: UniqueId,
    },
    /// Materialize a dehydrated item before a content operation
    Hydrate { remote_id: RemoteId, path: RelativePath },
    /// Record a remote item as a virtual entry
    CreatePlaceholder { path: RelativePath },
    /// Refresh a virtual entry's metadata (path or fingerprint)
    UpdatePlaceholder { path: RelativePath },
    /// Both sides already agree; record the synced state
    Link { path: RelativePath },
    /// Both sides are gone; drop the record
    Forget { path: RelativePath },
}

impl ActionKind {
    /// Storage/log name
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Download { .. } => "download",
            ActionKind::Upload { .. } => "upload",
            ActionKind::CreateLocalFolder { .. } => "create_local_folder",
            ActionKind::CreateRemoteFolder { .. } => "create_remote_folder",
            ActionKind::MoveLocal { .. } => "move_local",
            ActionKind::MoveRemote { .. } => "move_remote",
            ActionKind::DeleteLocal { .. } => "delete_local",
            ActionKind::DeleteRemote { .. } => "delete_remote",
            ActionKind::SetAside { .. } => "set_aside",
            ActionKind::DownloadCopy { .. } => "download_copy",
            ActionKind::Hydrate { .. } => "hydrate",
            ActionKind::CreatePlaceholder { .. } => "create_placeholder",
            ActionKind::UpdatePlaceholder { .. } => "update_placeholder",
            ActionKind::Link { .. } => "link",
            ActionKind::Forget { .. } => "forget",
        }
    }

    /// Phase the action runs in
    #[must_use]
    pub fn phase(&self) -> Phase {
        match self {
            ActionKind::SetAside { .. } | ActionKind::DownloadCopy { .. } => Phase::Preserve,
            ActionKind::CreateLocalFolder { .. } | ActionKind::CreateRemoteFolder { .. } => {
                Phase::Structure
            }
            ActionKind::MoveLocal { .. } | ActionKind::MoveRemote { .. } => Phase::Move,
            ActionKind::Download { .. }
            | ActionKind::Upload { .. }
            | ActionKind::Hydrate { .. }
            | ActionKind::CreatePlaceholder { .. }
            | ActionKind::UpdatePlaceholder { .. }
            | ActionKind::Link { .. } => Phase::Content,
            ActionKind::DeleteLocal { .. }
            | ActionKind::DeleteRemote { .. }
            | ActionKind::Forget { .. } => Phase::Delete,
        }
    }

    /// Path the action ends up touching
    #[must_use]
    pub fn path(&self) -> &RelativePath {
        match self {
            ActionKind::Download { path, .. }
            | ActionKind::Upload { path, .. }
            | ActionKind::CreateLocalFolder { path }
            | ActionKind::CreateRemoteFolder { path }
            | ActionKind::DeleteLocal { path }
            | ActionKind::DeleteRemote { path, .. }
            | ActionKind::Hydrate { path, .. }
            | ActionKind::CreatePlaceholder { path }
            | ActionKind::UpdatePlaceholder { path }
            | ActionKind::Link { path }
            | ActionKind::Forget { path } => path,
            ActionKind::MoveLocal { to, .. }
            | ActionKind::MoveRemote { to, .. }
            | ActionKind::SetAside { to, .. }
            | ActionKind::DownloadCopy { to, .. } => to,
        }
    }

    /// Whether the action transfers data over the network
    #[must_use]
    pub fn transfers_content(&self) -> bool {
        matches!(
            self,
            ActionKind::Download { .. }
                | ActionKind::Upload { .. }
                | ActionKind::Hydrate { .. }
                | ActionKind::DownloadCopy { .. }
        )
    }

    /// Whether the action only touches the metadata store
    #[must_use]
    pub fn is_store_only(&self) -> bool {
        matches!(
            self,
            ActionKind::CreatePlaceholder { .. }
                | ActionKind::UpdatePlaceholder { .. }
                | ActionKind::Link { .. }
                | ActionKind::Forget { .. }
        )
    }

    /// Which side the action writes to
    #[must_use]
    pub fn direction(&self) -> Direction {
        match self {
            ActionKind::Upload { .. }
            | ActionKind::CreateRemoteFolder { .. }
            | ActionKind::MoveRemote { .. }
            | ActionKind::DeleteRemote { .. } => Direction::Up,
            ActionKind::Download { .. }
            | ActionKind::Hydrate { .. }
            | ActionKind::CreateLocalFolder { .. }
            | ActionKind::MoveLocal { .. }
            | ActionKind::DeleteLocal { .. }
            | ActionKind::SetAside { .. }
            | ActionKind::DownloadCopy { .. } => Direction::Down,
            ActionKind::CreatePlaceholder { .. }
            | ActionKind::UpdatePlaceholder { .. }
            | ActionKind::Link { .. }
            | ActionKind::Forget { .. } => Direction::None,
        }
    }

    /// Activity feed classification
    #[must_use]
    pub fn activity(&self, existed_before: bool) -> ActivityKind {
        match self {
            ActionKind::MoveLocal { .. } | ActionKind::MoveRemote { .. } | ActionKind::SetAside { .. } => {
                ActivityKind::Moved
            }
            ActionKind::DeleteLocal { .. }
            | ActionKind::DeleteRemote { .. }
            | ActionKind::Forget { .. } => ActivityKind::Removed,
            _ if existed_before => ActivityKind::Updated,
            _ => ActivityKind::Added,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::MoveLocal { from, to }
            | ActionKind::MoveRemote { from, to, .. }
            | ActionKind::SetAside { from, to, .. } => {
                write!(f, "{} {from} -> {to}", self.name())
            }
            other => write!(f, "{} {}", other.name(), other.path()),
        }
    }
}

/// One planned action on one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAction {
    /// Item the action applies to
    pub item_id: UniqueId,
    pub kind: ActionKind,
    /// Skip this action if that item failed earlier in the cycle
    pub requires: Option<UniqueId>,
    /// Conflict resolved once the action succeeds
    pub conflict_id: Option<ConflictId>,
}

impl SyncAction {
    #[must_use]
    pub fn new(item_id: UniqueId, kind: ActionKind) -> Self {
        Self {
            item_id,
            kind,
            requires: None,
            conflict_id: None,
        }
    }

    #[must_use]
    pub fn requiring(mut self, item_id: UniqueId) -> Self {
        self.requires = Some(item_id);
        self
    }

    #[must_use]
    pub fn resolving(mut self, conflict_id: ConflictId) -> Self {
        self.conflict_id = Some(conflict_id);
        self
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.kind.phase()
    }

    #[must_use]
    pub fn path(&self) -> &RelativePath {
        self.kind.path()
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind.fmt(f)
    }
}
