//! Conflict domain entities
//!
//! Types for recording conflicts between concurrent local and remote
//! changes, the policy chosen to resolve them and when they were resolved.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{ConflictId, RelativePath, SessionId, UniqueId};
use super::sync_item::Fingerprint;

/// The shape of a conflict between a local and a remote change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both sides edited the content
    EditEdit,
    /// Local edit, remote delete
    EditDelete,
    /// Local delete, remote edit
    DeleteEdit,
    /// Both sides created different content at the same path
    CreateCreate,
    /// Item moved into a directory the other side deleted
    MoveIntoDeletedParent,
    /// Both sides moved or renamed the item to different destinations
    RenameRace,
    /// Item created inside a directory the other side deleted
    CreateInDeletedParent,
    /// Local edit of an item the remote marks read-only
    EditForbidden,
}

impl ConflictKind {
    /// All kinds, in storage order
    pub const ALL: [ConflictKind; 8] = [
        ConflictKind::EditEdit,
        ConflictKind::EditDelete,
        ConflictKind::DeleteEdit,
        ConflictKind::CreateCreate,
        ConflictKind::MoveIntoDeletedParent,
        ConflictKind::RenameRace,
        ConflictKind::CreateInDeletedParent,
        ConflictKind::EditForbidden,
    ];

    /// Storage representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::EditEdit => "edit_edit",
            ConflictKind::EditDelete => "edit_delete",
            ConflictKind::DeleteEdit => "delete_edit",
            ConflictKind::CreateCreate => "create_create",
            ConflictKind::MoveIntoDeletedParent => "move_into_deleted_parent",
            ConflictKind::RenameRace => "rename_race",
            ConflictKind::CreateInDeletedParent => "create_in_deleted_parent",
            ConflictKind::EditForbidden => "edit_forbidden",
        }
    }

    /// Policy applied when no rule overrides it
    #[must_use]
    pub fn default_policy(&self) -> ConflictPolicy {
        match self {
            ConflictKind::EditEdit => ConflictPolicy::RenameLocalAndDownloadRemote,
            ConflictKind::EditDelete => ConflictPolicy::RescueToRoot,
            ConflictKind::DeleteEdit => ConflictPolicy::RestoreToOriginalLocation,
            ConflictKind::CreateCreate => ConflictPolicy::RenameLocalAndDownloadRemote,
            ConflictKind::MoveIntoDeletedParent => ConflictPolicy::RestoreToOriginalLocation,
            ConflictKind::RenameRace => ConflictPolicy::CancelLocalOperation,
            ConflictKind::CreateInDeletedParent => ConflictPolicy::RescueToRoot,
            ConflictKind::EditForbidden => ConflictPolicy::RenameLocalAndDownloadRemote,
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| DomainError::UnknownVariant {
                kind: "conflict kind",
                value: s.to_string(),
            })
    }
}

/// How a conflict is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Move the local copy aside under a conflict name, then take the remote version
    RenameLocalAndDownloadRemote,
    /// Keep both versions; the local one is renamed
    KeepBoth,
    /// Undo the local operation and take the remote state
    CancelLocalOperation,
    /// Put the item back where it was before the move
    RestoreToOriginalLocation,
    /// Move the local content to the session root as a new item
    RescueToRoot,
    /// Hold the item until the user decides
    Manual,
}

impl ConflictPolicy {
    /// All policies, in storage order
    pub const ALL: [ConflictPolicy; 6] = [
        ConflictPolicy::RenameLocalAndDownloadRemote,
        ConflictPolicy::KeepBoth,
        ConflictPolicy::CancelLocalOperation,
        ConflictPolicy::RestoreToOriginalLocation,
        ConflictPolicy::RescueToRoot,
        ConflictPolicy::Manual,
    ];

    /// Storage representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::RenameLocalAndDownloadRemote => "rename_local_and_download_remote",
            ConflictPolicy::KeepBoth => "keep_both",
            ConflictPolicy::CancelLocalOperation => "cancel_local_operation",
            ConflictPolicy::RestoreToOriginalLocation => "restore_to_original_location",
            ConflictPolicy::RescueToRoot => "rescue_to_root",
            ConflictPolicy::Manual => "manual",
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|p| p.as_str() == s)
            .copied()
            .ok_or_else(|| DomainError::UnknownVariant {
                kind: "conflict policy",
                value: s.to_string(),
            })
    }
}

/// A detected conflict
///
/// Records are kept after resolution as history; `resolved_at` tells them
/// apart from pending ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    id: ConflictId,
    session_id: SessionId,
    item_id: UniqueId,
    path: RelativePath,
    kind: ConflictKind,
    local: Option<Fingerprint>,
    remote: Option<Fingerprint>,
    policy: ConflictPolicy,
    copy_path: Option<RelativePath>,
    detected_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl ConflictRecord {
    /// Creates an unresolved record
    #[must_use]
    pub fn new(
        session_id: SessionId,
        item_id: UniqueId,
        path: RelativePath,
        kind: ConflictKind,
        policy: ConflictPolicy,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            session_id,
            item_id,
            path,
            kind,
            local: None,
            remote: None,
            policy,
            copy_path: None,
            detected_at,
            resolved_at: None,
        }
    }

    /// Rebuild from storage
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn restore(
        id: ConflictId,
        session_id: SessionId,
        item_id: UniqueId,
        path: RelativePath,
        kind: ConflictKind,
        local: Option<Fingerprint>,
        remote: Option<Fingerprint>,
        policy: ConflictPolicy,
        copy_path: Option<RelativePath>,
        detected_at: DateTime<Utc>,
        resolved_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            session_id,
            item_id,
            path,
            kind,
            local,
            remote,
            policy,
            copy_path,
            detected_at,
            resolved_at,
        }
    }

    /// Attach the fingerprints of both sides at detection time
    #[must_use]
    pub fn with_versions(mut self, local: Option<Fingerprint>, remote: Option<Fingerprint>) -> Self {
        self.local = local;
        self.remote = remote;
        self
    }

    /// Attach the path of the preserved local copy
    #[must_use]
    pub fn with_copy_path(mut self, copy_path: RelativePath) -> Self {
        self.copy_path = Some(copy_path);
        self
    }

    pub fn id(&self) -> &ConflictId {
        &self.id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn item_id(&self) -> &UniqueId {
        &self.item_id
    }

    pub fn path(&self) -> &RelativePath {
        &self.path
    }

    pub fn kind(&self) -> ConflictKind {
        self.kind
    }

    /// Local fingerprint at detection, `None` when the local side was deleted
    pub fn local(&self) -> Option<&Fingerprint> {
        self.local.as_ref()
    }

    /// Remote fingerprint at detection, `None` when the remote side was deleted
    pub fn remote(&self) -> Option<&Fingerprint> {
        self.remote.as_ref()
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Where the losing local content was preserved, if anywhere
    pub fn copy_path(&self) -> Option<&RelativePath> {
        self.copy_path.as_ref()
    }

    pub fn detected_at(&self) -> DateTime<Utc> {
        self.detected_at
    }

    pub fn resolved_at(&self) -> Option<DateTime<Utc>> {
        self.resolved_at
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    /// Whether the record waits for a user decision
    pub fn awaits_user(&self) -> bool {
        !self.is_resolved() && self.policy == ConflictPolicy::Manual
    }

    /// Record the policy chosen for a pending conflict
    ///
    /// The record stays unresolved until the planned actions succeed.
    pub fn decide(&mut self, policy: ConflictPolicy) {
        self.policy = policy;
    }

    /// Mark resolved with the policy that was actually applied
    pub fn resolve(&mut self, policy: ConflictPolicy, at: DateTime<Utc>) {
        self.policy = policy;
        self.resolved_at = Some(at);
    }
}
