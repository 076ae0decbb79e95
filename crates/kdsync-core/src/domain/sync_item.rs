//! SyncItem domain entity
//!
//! A `SyncItem` is the durable record of one filesystem entry shared between
//! a session's local root and its remote folder.
//!
//! ## Sync state machine
//!
//! ```text
//!   Unsynced ──► SyncPending ──► Synced
//!      │  ▲          │  ▲          │
//!      │  └──────────┼──┼──────────┤ (clear / re-admit)
//!      ▼             ▼  │          ▼
//!   Excluded     Conflicted ───► Blacklisted(temporary|permanent)
//! ```
//!
//! Transitions are requested by the reconciliation engine only. `Synced`
//! never goes straight back to `Unsynced`, and a blacklisted item must be
//! released (back to `Unsynced`) before it can sync again.
//!
//! ## Placeholder state machine
//!
//! ```text
//!   Dehydrated ──► Hydrating ──► Hydrated ──► Dehydrating ──► Dehydrated
//!        ▲             │             ▲              │
//!        └─────────────┘ (failure)   └──────────────┘ (failure)
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::blacklist::{BlacklistEntry, BlacklistScope};
use super::errors::DomainError;
use super::newtypes::{FileHash, RelativePath, RemoteId, SessionId, UniqueId};

// ============================================================================
// Fingerprint
// ============================================================================

/// Content fingerprint: hash, size and modification time
///
/// Content equality prefers the hash when both sides carry one. Otherwise it
/// falls back to size plus mtime at second precision, since filesystems
/// disagree on sub-second timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Content hash, when known
    pub hash: Option<FileHash>,
    /// Size in bytes
    pub size: u64,
    /// Last modification time
    pub mtime: DateTime<Utc>,
}

impl Fingerprint {
    /// Fingerprint of a regular file
    #[must_use]
    pub fn file(hash: Option<FileHash>, size: u64, mtime: DateTime<Utc>) -> Self {
        Self { hash, size, mtime }
    }

    /// Fingerprint of a directory; all directory fingerprints compare equal
    #[must_use]
    pub fn directory() -> Self {
        Self {
            hash: None,
            size: 0,
            mtime: DateTime::<Utc>::default(),
        }
    }

    /// Whether both fingerprints describe the same content
    #[must_use]
    pub fn same_content(&self, other: &Fingerprint) -> bool {
        match (&self.hash, &other.hash) {
            (Some(a), Some(b)) => a == b,
            _ => self.size == other.size && self.mtime.timestamp() == other.mtime.timestamp(),
        }
    }

    /// Whether size and mtime match, i.e. a previously computed hash can be reused
    #[must_use]
    pub fn same_metadata(&self, other: &Fingerprint) -> bool {
        self.size == other.size && self.mtime.timestamp() == other.mtime.timestamp()
    }

    /// Copy of this fingerprint carrying `hash`
    #[must_use]
    pub fn with_hash(mut self, hash: FileHash) -> Self {
        self.hash = Some(hash);
        self
    }
}

// ============================================================================
// ItemKind
// ============================================================================

/// Whether an item is a regular file or a directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Regular file
    File,
    /// Directory
    Directory,
}

impl ItemKind {
    /// Storage representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::File => "file",
            ItemKind::Directory => "directory",
        }
    }
}

impl FromStr for ItemKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(ItemKind::File),
            "directory" => Ok(ItemKind::Directory),
            other => Err(DomainError::UnknownVariant {
                kind: "item kind",
                value: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// SyncState
// ============================================================================

/// Reconciliation state of an item
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Known but never reconciled, or re-admitted after a blacklist clear
    #[default]
    Unsynced,
    /// An action is planned or a transient failure awaits retry
    SyncPending,
    /// Both sides agree with the last-known-synced fingerprint
    Synced,
    /// Held by an unresolved conflict
    Conflicted,
    /// Excluded by the blacklist
    Blacklisted(BlacklistScope),
    /// Excluded by an exclusion template or a pending large-folder confirmation
    Excluded,
}

impl SyncState {
    /// Storage representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Unsynced => "unsynced",
            SyncState::SyncPending => "sync_pending",
            SyncState::Synced => "synced",
            SyncState::Conflicted => "conflicted",
            SyncState::Blacklisted(BlacklistScope::Temporary) => "blacklisted_temporary",
            SyncState::Blacklisted(BlacklistScope::Permanent) => "blacklisted_permanent",
            SyncState::Excluded => "excluded",
        }
    }

    /// Whether deltas for the item take part in reconciliation
    #[must_use]
    pub fn is_reconcilable(&self) -> bool {
        matches!(
            self,
            SyncState::Unsynced | SyncState::SyncPending | SyncState::Synced
        )
    }

    /// Whether the item is blacklisted (any scope)
    #[must_use]
    pub fn is_blacklisted(&self) -> bool {
        matches!(self, SyncState::Blacklisted(_))
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unsynced" => Ok(SyncState::Unsynced),
            "sync_pending" => Ok(SyncState::SyncPending),
            "synced" => Ok(SyncState::Synced),
            "conflicted" => Ok(SyncState::Conflicted),
            "blacklisted_temporary" => Ok(SyncState::Blacklisted(BlacklistScope::Temporary)),
            "blacklisted_permanent" => Ok(SyncState::Blacklisted(BlacklistScope::Permanent)),
            "excluded" => Ok(SyncState::Excluded),
            other => Err(DomainError::UnknownVariant {
                kind: "sync state",
                value: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// PlaceholderState
// ============================================================================

/// Lite Sync materialization state of an item
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceholderState {
    /// Full content is present locally
    #[default]
    Hydrated,
    /// Only a virtual entry exists; content lives on the remote
    Dehydrated,
    /// Content is being downloaded
    Hydrating,
    /// Local content is being released
    Dehydrating,
}

impl PlaceholderState {
    /// Storage representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaceholderState::Hydrated => "hydrated",
            PlaceholderState::Dehydrated => "dehydrated",
            PlaceholderState::Hydrating => "hydrating",
            PlaceholderState::Dehydrating => "dehydrating",
        }
    }

    /// Checks a placeholder transition
    ///
    /// Failed hydration falls back to `Dehydrated`, failed dehydration to
    /// `Hydrated`.
    #[must_use]
    pub fn can_transition_to(&self, target: PlaceholderState) -> bool {
        use PlaceholderState::*;
        matches!(
            (self, target),
            (Dehydrated, Hydrating)
                | (Hydrating, Hydrated)
                | (Hydrating, Dehydrated)
                | (Hydrated, Dehydrating)
                | (Dehydrating, Dehydrated)
                | (Dehydrating, Hydrated)
        )
    }

    /// Whether a transfer is in progress
    #[must_use]
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            PlaceholderState::Hydrating | PlaceholderState::Dehydrating
        )
    }
}

impl fmt::Display for PlaceholderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlaceholderState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hydrated" => Ok(PlaceholderState::Hydrated),
            "dehydrated" => Ok(PlaceholderState::Dehydrated),
            "hydrating" => Ok(PlaceholderState::Hydrating),
            "dehydrating" => Ok(PlaceholderState::Dehydrating),
            other => Err(DomainError::UnknownVariant {
                kind: "placeholder state",
                value: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// ItemIdentity
// ============================================================================

/// Identity key of an item: the remote id once known, else the local path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ItemIdentity {
    /// Assigned by the remote drive
    Remote(RemoteId),
    /// Not yet known remotely
    Local(RelativePath),
}

impl fmt::Display for ItemIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemIdentity::Remote(id) => write!(f, "remote:{id}"),
            ItemIdentity::Local(path) => write!(f, "local:{path}"),
        }
    }
}

// ============================================================================
// SyncItem
// ============================================================================

/// Durable record of one synchronized filesystem entry
///
/// `local_path` is where the store last saw the entry locally and
/// `remote_path` where it last saw it remotely. Both are equal once the
/// item is synced. The three fingerprints hold the last local observation,
/// the last remote observation and the last-known-synced content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncItem {
    id: UniqueId,
    session_id: SessionId,
    remote_id: Option<RemoteId>,
    kind: ItemKind,
    local_path: RelativePath,
    remote_path: RelativePath,
    local_fingerprint: Option<Fingerprint>,
    remote_fingerprint: Option<Fingerprint>,
    synced_fingerprint: Option<Fingerprint>,
    local_node_id: Option<u64>,
    remote_deleted: bool,
    read_only: bool,
    state: SyncState,
    placeholder: PlaceholderState,
    blacklist: Option<BlacklistEntry>,
    error_count: u32,
    last_synced_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl SyncItem {
    /// Item first observed on the local side
    #[must_use]
    pub fn new_local(
        session_id: SessionId,
        kind: ItemKind,
        path: RelativePath,
        fingerprint: Fingerprint,
        node_id: Option<u64>,
    ) -> Self {
        Self {
            id: UniqueId::new(),
            session_id,
            remote_id: None,
            kind,
            local_path: path.clone(),
            remote_path: path,
            local_fingerprint: Some(fingerprint),
            remote_fingerprint: None,
            synced_fingerprint: None,
            local_node_id: node_id,
            remote_deleted: false,
            read_only: false,
            state: SyncState::Unsynced,
            placeholder: PlaceholderState::Hydrated,
            blacklist: None,
            error_count: 0,
            last_synced_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Item first observed in the remote change feed
    #[must_use]
    pub fn new_remote(
        session_id: SessionId,
        kind: ItemKind,
        remote_id: RemoteId,
        path: RelativePath,
        fingerprint: Fingerprint,
    ) -> Self {
        Self {
            id: UniqueId::new(),
            session_id,
            remote_id: Some(remote_id),
            kind,
            local_path: path.clone(),
            remote_path: path,
            local_fingerprint: None,
            remote_fingerprint: Some(fingerprint),
            synced_fingerprint: None,
            local_node_id: None,
            remote_deleted: false,
            read_only: false,
            state: SyncState::Unsynced,
            placeholder: PlaceholderState::Hydrated,
            blacklist: None,
            error_count: 0,
            last_synced_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Replace the generated id with one allocated in advance
    ///
    /// Used when an action plan refers to an item before it is stored.
    #[must_use]
    pub fn with_id(mut self, id: UniqueId) -> Self {
        self.id = id;
        self
    }

    /// Rebuild an item from persisted fields
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn restore(
        id: UniqueId,
        session_id: SessionId,
        remote_id: Option<RemoteId>,
        kind: ItemKind,
        local_path: RelativePath,
        remote_path: RelativePath,
        local_fingerprint: Option<Fingerprint>,
        remote_fingerprint: Option<Fingerprint>,
        synced_fingerprint: Option<Fingerprint>,
        local_node_id: Option<u64>,
        remote_deleted: bool,
        read_only: bool,
        state: SyncState,
        placeholder: PlaceholderState,
        blacklist: Option<BlacklistEntry>,
        error_count: u32,
        last_synced_at: Option<DateTime<Utc>>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            session_id,
            remote_id,
            kind,
            local_path,
            remote_path,
            local_fingerprint,
            remote_fingerprint,
            synced_fingerprint,
            local_node_id,
            remote_deleted,
            read_only,
            state,
            placeholder,
            blacklist,
            error_count,
            last_synced_at,
            updated_at,
        }
    }

    // --- getters ---

    /// Internal identifier
    pub fn id(&self) -> &UniqueId {
        &self.id
    }

    /// Owning session
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Remote identifier, once assigned
    pub fn remote_id(&self) -> Option<&RemoteId> {
        self.remote_id.as_ref()
    }

    /// Identity key (remote id, else local path)
    pub fn identity(&self) -> ItemIdentity {
        match &self.remote_id {
            Some(id) => ItemIdentity::Remote(id.clone()),
            None => ItemIdentity::Local(self.local_path.clone()),
        }
    }

    /// File or directory
    pub fn kind(&self) -> ItemKind {
        self.kind
    }

    /// Whether the item is a directory
    pub fn is_directory(&self) -> bool {
        self.kind == ItemKind::Directory
    }

    /// Last known local path
    pub fn local_path(&self) -> &RelativePath {
        &self.local_path
    }

    /// Last known remote path
    pub fn remote_path(&self) -> &RelativePath {
        &self.remote_path
    }

    /// Last observed local content
    pub fn local_fingerprint(&self) -> Option<&Fingerprint> {
        self.local_fingerprint.as_ref()
    }

    /// Last observed remote content
    pub fn remote_fingerprint(&self) -> Option<&Fingerprint> {
        self.remote_fingerprint.as_ref()
    }

    /// Last-known-synced content
    pub fn synced_fingerprint(&self) -> Option<&Fingerprint> {
        self.synced_fingerprint.as_ref()
    }

    /// Local inode (or equivalent), used for move detection
    pub fn local_node_id(&self) -> Option<u64> {
        self.local_node_id
    }

    /// Whether the remote feed reported a deletion not yet applied locally
    pub fn remote_deleted(&self) -> bool {
        self.remote_deleted
    }

    /// Whether the remote side forbids modifications
    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// Reconciliation state
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Lite Sync state
    pub fn placeholder(&self) -> PlaceholderState {
        self.placeholder
    }

    /// Blacklist entry, if the item is blacklisted
    pub fn blacklist(&self) -> Option<&BlacklistEntry> {
        self.blacklist.as_ref()
    }

    /// Consecutive transient failures
    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    /// When the item last converged
    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.last_synced_at
    }

    /// Last modification of the record
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Whether the item has converged at least once
    pub fn was_synced(&self) -> bool {
        self.synced_fingerprint.is_some()
    }

    /// Whether the item currently exists on the local side (virtual entries excluded)
    pub fn present_locally(&self) -> bool {
        self.placeholder != PlaceholderState::Dehydrated
            && (self.local_fingerprint.is_some() || self.was_synced())
    }

    /// Whether both sides hold the last-known-synced content
    pub fn is_converged(&self) -> bool {
        match (
            &self.local_fingerprint,
            &self.remote_fingerprint,
            &self.synced_fingerprint,
        ) {
            (Some(l), Some(r), Some(s)) => {
                l.same_content(s) && r.same_content(s) && self.local_path == self.remote_path
            }
            _ => false,
        }
    }

    // --- mutators ---

    /// Assign the remote identifier
    ///
    /// # Errors
    /// Returns `DomainError::ValidationFailed` if a different id is already
    /// assigned; the remote id of an item never changes.
    pub fn assign_remote_id(&mut self, remote_id: RemoteId) -> Result<(), DomainError> {
        match &self.remote_id {
            Some(existing) if existing != &remote_id => Err(DomainError::ValidationFailed(
                format!("Item {} already has remote id {existing}", self.id),
            )),
            _ => {
                self.remote_id = Some(remote_id);
                self.touch();
                Ok(())
            }
        }
    }

    /// Record a local observation
    pub fn observe_local(
        &mut self,
        path: RelativePath,
        fingerprint: Fingerprint,
        node_id: Option<u64>,
    ) {
        self.local_path = path;
        self.local_fingerprint = Some(fingerprint);
        if node_id.is_some() {
            self.local_node_id = node_id;
        }
        self.touch();
    }

    /// Record a remote observation from the change feed
    pub fn observe_remote(&mut self, path: RelativePath, fingerprint: Fingerprint, read_only: bool) {
        self.remote_path = path;
        self.remote_fingerprint = Some(fingerprint);
        self.remote_deleted = false;
        self.read_only = read_only;
        self.touch();
    }

    /// Record a remote deletion from the change feed
    pub fn observe_remote_deletion(&mut self) {
        self.remote_deleted = true;
        self.touch();
    }

    /// Record that both sides now hold `fingerprint` at `path`
    pub fn mark_converged(&mut self, path: RelativePath, fingerprint: Fingerprint) {
        self.local_path = path.clone();
        self.remote_path = path;
        self.local_fingerprint = Some(fingerprint.clone());
        self.remote_fingerprint = Some(fingerprint.clone());
        self.synced_fingerprint = Some(fingerprint);
        self.remote_deleted = false;
        self.error_count = 0;
        self.last_synced_at = Some(Utc::now());
        self.touch();
    }

    /// Move the item on both sides without touching content
    pub fn relocate(&mut self, path: RelativePath) {
        self.local_path = path.clone();
        self.remote_path = path;
        self.touch();
    }

    /// Set the local path only
    pub fn set_local_path(&mut self, path: RelativePath) {
        self.local_path = path;
        self.touch();
    }

    /// Set the local node id
    pub fn set_local_node_id(&mut self, node_id: Option<u64>) {
        self.local_node_id = node_id;
        self.touch();
    }

    /// Set the placeholder state, checking the transition
    ///
    /// # Errors
    /// Returns `DomainError::InvalidState` for a forbidden transition
    pub fn set_placeholder(&mut self, target: PlaceholderState) -> Result<(), DomainError> {
        if self.placeholder == target {
            return Ok(());
        }
        if !self.placeholder.can_transition_to(target) {
            return Err(DomainError::InvalidState {
                from: self.placeholder.to_string(),
                to: target.to_string(),
            });
        }
        self.placeholder = target;
        self.touch();
        Ok(())
    }

    /// Create the item directly as a virtual (dehydrated) entry
    pub fn make_virtual(&mut self) {
        self.placeholder = PlaceholderState::Dehydrated;
        self.local_fingerprint = None;
        self.local_node_id = None;
        self.touch();
    }

    /// Attach or detach the blacklist entry (state is handled by `transition_to`)
    pub fn set_blacklist(&mut self, entry: Option<BlacklistEntry>) {
        self.blacklist = entry;
        self.touch();
    }

    /// Increment the transient failure counter, returning the new count
    pub fn record_failure(&mut self) -> u32 {
        self.error_count = self.error_count.saturating_add(1);
        self.touch();
        self.error_count
    }

    /// Reset the transient failure counter
    pub fn clear_failures(&mut self) {
        self.error_count = 0;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ============================================================================
// SyncItem state transitions
// ============================================================================

impl SyncItem {
    /// Checks whether a sync state transition is valid
    ///
    /// Valid transitions:
    /// - Unsynced -> SyncPending, Synced, Conflicted, Blacklisted, Excluded
    /// - SyncPending -> SyncPending, Synced, Conflicted, Blacklisted, Excluded
    /// - Synced -> SyncPending, Conflicted, Blacklisted, Excluded
    /// - Conflicted -> SyncPending, Synced, Unsynced, Blacklisted
    /// - Blacklisted -> Unsynced, Blacklisted (scope change)
    /// - Excluded -> Unsynced
    pub fn can_transition_to(&self, target: SyncState) -> bool {
        use SyncState::*;
        match (self.state, target) {
            (Unsynced, Unsynced) => false,
            (Unsynced, _) => true,
            (SyncPending, Unsynced) => false,
            (SyncPending, _) => true,
            (Synced, Unsynced) | (Synced, Synced) => false,
            (Synced, _) => true,
            (Conflicted, SyncPending | Synced | Unsynced | Blacklisted(_)) => true,
            (Conflicted, _) => false,
            (Blacklisted(_), Unsynced | Blacklisted(_)) => true,
            (Blacklisted(_), _) => false,
            (Excluded, Unsynced) => true,
            (Excluded, _) => false,
        }
    }

    /// Attempts to transition to a new sync state
    ///
    /// # Errors
    /// Returns `DomainError::InvalidState` if the transition is not allowed
    pub fn transition_to(&mut self, target: SyncState) -> Result<(), DomainError> {
        if !self.can_transition_to(target) {
            return Err(DomainError::InvalidState {
                from: self.state.to_string(),
                to: target.to_string(),
            });
        }

        if !target.is_blacklisted() {
            self.blacklist = None;
        }
        self.state = target;
        self.touch();
        Ok(())
    }

    /// Force a state without transition checks (used when restoring from storage)
    pub fn set_state_unchecked(&mut self, state: SyncState) {
        self.state = state;
        self.touch();
    }

    /// Take the item out of sync at the user's request, forgetting its local side
    ///
    /// Without a baseline the item is re-admitted as a remote creation, so
    /// it is downloaded again rather than taken for a local deletion.
    pub fn exclude_from_sync(&mut self) {
        self.state = SyncState::Excluded;
        self.blacklist = None;
        self.local_path = self.remote_path.clone();
        self.local_fingerprint = None;
        self.synced_fingerprint = None;
        self.local_node_id = None;
        self.placeholder = PlaceholderState::Hydrated;
        self.error_count = 0;
        self.touch();
    }
}
