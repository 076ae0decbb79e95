//! Per-side change deltas
//!
//! A delta describes how one side of an item differs from its
//! last-known-synced state. Path changes and content changes are tracked
//! independently: a `Moved` delta may also carry `content_changed`.

use serde::{Deserialize, Serialize};

use super::newtypes::{RelativePath, RemoteId, UniqueId};
use super::sync_item::Fingerprint;

/// Which replica a delta was observed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Local => "local",
            Side::Remote => "remote",
        }
    }

    #[must_use]
    pub fn opposite(&self) -> Side {
        match self {
            Side::Local => Side::Remote,
            Side::Remote => Side::Local,
        }
    }
}

/// The shape of a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaKind {
    /// Not known to the last-known-synced state
    Created,
    /// Same path, different content
    Edited,
    /// Different path; `content_changed` tells whether content moved too
    Moved,
    /// Gone from this side
    Deleted,
}

/// One observed change on one side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDelta {
    /// Item the change belongs to
    pub item_id: UniqueId,
    /// Replica the change was seen on
    pub side: Side,
    pub kind: DeltaKind,
    /// Current path; last known path for deletions
    pub path: RelativePath,
    /// Path before a move
    pub previous_path: Option<RelativePath>,
    /// Observed content; `None` for deletions
    pub fingerprint: Option<Fingerprint>,
    /// Whether content differs from the last-known-synced content
    pub content_changed: bool,
    pub is_directory: bool,
    /// Remote identifier (remote deltas, or local items already known remotely)
    pub remote_id: Option<RemoteId>,
    /// Hard link count of a local entry
    pub link_count: u64,
    /// Remote marks the item read-only
    pub read_only: bool,
}

impl ItemDelta {
    fn base(item_id: UniqueId, side: Side, kind: DeltaKind, path: RelativePath) -> Self {
        Self {
            item_id,
            side,
            kind,
            path,
            previous_path: None,
            fingerprint: None,
            content_changed: false,
            is_directory: false,
            remote_id: None,
            link_count: 1,
            read_only: false,
        }
    }

    #[must_use]
    pub fn created(
        item_id: UniqueId,
        side: Side,
        path: RelativePath,
        fingerprint: Fingerprint,
        is_directory: bool,
    ) -> Self {
        let mut delta = Self::base(item_id, side, DeltaKind::Created, path);
        delta.fingerprint = Some(fingerprint);
        delta.content_changed = !is_directory;
        delta.is_directory = is_directory;
        delta
    }

    #[must_use]
    pub fn edited(
        item_id: UniqueId,
        side: Side,
        path: RelativePath,
        fingerprint: Fingerprint,
    ) -> Self {
        let mut delta = Self::base(item_id, side, DeltaKind::Edited, path);
        delta.fingerprint = Some(fingerprint);
        delta.content_changed = true;
        delta
    }

    #[must_use]
    pub fn moved(
        item_id: UniqueId,
        side: Side,
        from: RelativePath,
        to: RelativePath,
        fingerprint: Fingerprint,
        content_changed: bool,
        is_directory: bool,
    ) -> Self {
        let mut delta = Self::base(item_id, side, DeltaKind::Moved, to);
        delta.previous_path = Some(from);
        delta.fingerprint = Some(fingerprint);
        delta.content_changed = content_changed;
        delta.is_directory = is_directory;
        delta
    }

    #[must_use]
    pub fn deleted(item_id: UniqueId, side: Side, path: RelativePath, is_directory: bool) -> Self {
        let mut delta = Self::base(item_id, side, DeltaKind::Deleted, path);
        delta.is_directory = is_directory;
        delta
    }

    #[must_use]
    pub fn with_remote_id(mut self, remote_id: Option<RemoteId>) -> Self {
        self.remote_id = remote_id;
        self
    }

    #[must_use]
    pub fn with_link_count(mut self, link_count: u64) -> Self {
        self.link_count = link_count;
        self
    }

    #[must_use]
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Whether the change alters the item's path
    #[must_use]
    pub fn changes_path(&self) -> bool {
        self.kind == DeltaKind::Moved
    }

    /// Whether the change alters content (creations and edits included)
    #[must_use]
    pub fn changes_content(&self) -> bool {
        match self.kind {
            DeltaKind::Created | DeltaKind::Edited => !self.is_directory,
            DeltaKind::Moved => self.content_changed,
            DeltaKind::Deleted => false,
        }
    }
}
