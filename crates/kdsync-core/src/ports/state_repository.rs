//! State repository port (driven/secondary port)
//!
//! Persistence for sessions, items, blacklist entries, conflict records,
//! the bulk hydration queue, the activity log and engine settings.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific
//!   and callers only need to propagate them.
//! - Blacklist admission and release update the item state in the same
//!   transaction, so a crash never leaves a blacklist row without the
//!   matching `Blacklisted` state (or the reverse).
//! - The placeholder state column is written only through
//!   `set_placeholder_state`; `save_item` leaves it alone on existing rows.
//! - Writers that hold a session across awaits (the reconciliation cycle)
//!   use the single-column session setters, so a concurrent pause or Lite
//!   Sync toggle is never reverted by a stale copy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    newtypes::{ChangeCursor, ConflictId, RelativePath, RemoteId, SessionId, UniqueId},
    BlacklistEntry, ConflictRecord, PlaceholderState, SessionStatus, SyncEvent, SyncItem,
    SyncSession, SyncState,
};

// ============================================================================
// ItemFilter
// ============================================================================

/// Filter criteria for querying sync items
///
/// All fields are optional; when `None`, no filtering is applied for that
/// field. Filters are combined with AND logic.
///
/// # Example
///
/// ```
/// use kdsync_core::domain::{SessionId, SyncState};
/// use kdsync_core::ports::ItemFilter;
///
/// let filter = ItemFilter::new()
///     .with_session(SessionId::new())
///     .with_state(SyncState::Conflicted);
/// assert!(!filter.is_empty());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    /// Filter by owning session
    pub session_id: Option<SessionId>,
    /// Filter by sync state
    pub state: Option<SyncState>,
    /// Filter by placeholder state
    pub placeholder: Option<PlaceholderState>,
    /// Items whose local path is this path or lies below it
    pub path_prefix: Option<RelativePath>,
    /// Items updated after this timestamp
    pub modified_since: Option<DateTime<Utc>>,
}

impl ItemFilter {
    /// Creates a new empty filter (matches all items)
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_state(mut self, state: SyncState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_placeholder(mut self, placeholder: PlaceholderState) -> Self {
        self.placeholder = Some(placeholder);
        self
    }

    pub fn with_path_prefix(mut self, prefix: RelativePath) -> Self {
        self.path_prefix = Some(prefix);
        self
    }

    pub fn with_modified_since(mut self, since: DateTime<Utc>) -> Self {
        self.modified_since = Some(since);
        self
    }

    /// Returns true if no filters are set
    pub fn is_empty(&self) -> bool {
        self.session_id.is_none()
            && self.state.is_none()
            && self.placeholder.is_none()
            && self.path_prefix.is_none()
            && self.modified_since.is_none()
    }
}

// ============================================================================
// Activity log
// ============================================================================

/// A persisted event, as listed by `recent_activity`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub recorded_at: DateTime<Utc>,
    pub event: SyncEvent,
}

// ============================================================================
// IStateRepository trait
// ============================================================================

/// Port trait for persistent state storage
#[async_trait::async_trait]
pub trait IStateRepository: Send + Sync {
    // --- Sessions ---

    /// Saves a session (insert or update)
    async fn save_session(&self, session: &SyncSession) -> anyhow::Result<()>;

    async fn get_session(&self, id: &SessionId) -> anyhow::Result<Option<SyncSession>>;

    /// All sessions, oldest first
    async fn list_sessions(&self) -> anyhow::Result<Vec<SyncSession>>;

    /// Updates the change cursor column only
    async fn set_session_cursor(
        &self,
        id: &SessionId,
        cursor: Option<&ChangeCursor>,
    ) -> anyhow::Result<()>;

    /// Updates the status and status detail columns only
    async fn set_session_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
        detail: Option<&str>,
    ) -> anyhow::Result<()>;

    async fn set_session_lite_sync(&self, id: &SessionId, enabled: bool) -> anyhow::Result<()>;

    /// Updates the last cycle timestamp only
    async fn record_session_cycle(&self, id: &SessionId, at: DateTime<Utc>) -> anyhow::Result<()>;

    /// Removes a session and every row it owns
    ///
    /// Only store rows are removed; files on either side are untouched.
    async fn delete_session(&self, id: &SessionId) -> anyhow::Result<()>;

    // --- Items ---

    /// Saves an item (insert or update)
    async fn save_item(&self, item: &SyncItem) -> anyhow::Result<()>;

    /// Saves several items in one transaction
    async fn save_items(&self, items: &[SyncItem]) -> anyhow::Result<()>;

    async fn get_item(&self, id: &UniqueId) -> anyhow::Result<Option<SyncItem>>;

    /// Looks an item up by its last known local path
    async fn get_item_by_path(
        &self,
        session_id: &SessionId,
        path: &RelativePath,
    ) -> anyhow::Result<Option<SyncItem>>;

    async fn get_item_by_remote_id(
        &self,
        session_id: &SessionId,
        remote_id: &RemoteId,
    ) -> anyhow::Result<Option<SyncItem>>;

    /// Queries items matching the filter, ordered by local path
    async fn query_items(&self, filter: &ItemFilter) -> anyhow::Result<Vec<SyncItem>>;

    /// Deletes an item together with its blacklist row and queue entry
    async fn delete_item(&self, id: &UniqueId) -> anyhow::Result<()>;

    /// Updates the placeholder state column only
    async fn set_placeholder_state(
        &self,
        id: &UniqueId,
        state: PlaceholderState,
    ) -> anyhow::Result<()>;

    // --- Blacklist ---

    /// Stores the entry and sets the item to `Blacklisted(scope)` atomically
    async fn admit_to_blacklist(&self, entry: &BlacklistEntry) -> anyhow::Result<()>;

    /// Removes the entry and sets the item to `Unsynced` atomically
    ///
    /// Returns `false` if the item had no entry.
    async fn release_from_blacklist(&self, item_id: &UniqueId) -> anyhow::Result<bool>;

    async fn get_blacklist_entry(&self, item_id: &UniqueId)
        -> anyhow::Result<Option<BlacklistEntry>>;

    /// Entries of one session, or of all sessions
    async fn list_blacklist(
        &self,
        session_id: Option<&SessionId>,
    ) -> anyhow::Result<Vec<BlacklistEntry>>;

    // --- Conflicts ---

    /// Saves a conflict record (insert or update)
    async fn save_conflict(&self, conflict: &ConflictRecord) -> anyhow::Result<()>;

    async fn get_conflict(&self, id: &ConflictId) -> anyhow::Result<Option<ConflictRecord>>;

    /// Conflict records, newest first
    async fn list_conflicts(
        &self,
        session_id: Option<&SessionId>,
        unresolved_only: bool,
    ) -> anyhow::Result<Vec<ConflictRecord>>;

    /// The unresolved record holding an item, if any
    async fn open_conflict_for_item(
        &self,
        item_id: &UniqueId,
    ) -> anyhow::Result<Option<ConflictRecord>>;

    // --- Bulk hydration queue ---

    /// Queues items for hydration; already queued items are ignored
    ///
    /// Returns how many new rows were added.
    async fn enqueue_hydration(
        &self,
        session_id: &SessionId,
        item_ids: &[UniqueId],
    ) -> anyhow::Result<usize>;

    /// Queued items in enqueue order
    async fn pending_hydrations(&self, session_id: &SessionId) -> anyhow::Result<Vec<UniqueId>>;

    /// Removes an item from the queue
    async fn complete_hydration(&self, item_id: &UniqueId) -> anyhow::Result<()>;

    // --- Activity log ---

    async fn record_activity(&self, event: &SyncEvent) -> anyhow::Result<()>;

    /// Most recent events, newest first
    async fn recent_activity(
        &self,
        session_id: Option<&SessionId>,
        limit: u32,
    ) -> anyhow::Result<Vec<ActivityRecord>>;

    // --- Settings ---

    async fn get_setting(&self, key: &str) -> anyhow::Result<Option<String>>;

    async fn set_setting(&self, key: &str, value: &str) -> anyhow::Result<()>;
}
