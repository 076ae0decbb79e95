//! Events published by the engine
//!
//! Item-level outcomes, conflicts, blacklist changes, session lifecycle and
//! hydration are all published as `SyncEvent`s through the event sink port.
//! Subscribers receive them in emission order.

use serde::{Deserialize, Serialize};

use super::blacklist::{BlacklistReason, BlacklistScope};
use super::conflict::{ConflictKind, ConflictPolicy};
use super::error_code::SyncErrorCode;
use super::newtypes::{ConflictId, RelativePath, SessionId, UniqueId};

/// What happened to an item, as shown in the activity feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Added,
    Removed,
    Updated,
    Moved,
}

impl ActivityKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Added => "added",
            ActivityKind::Removed => "removed",
            ActivityKind::Updated => "updated",
            ActivityKind::Moved => "moved",
        }
    }
}

/// Which side an applied change was written to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Local change propagated to the remote
    Up,
    /// Remote change applied locally
    Down,
    /// Metadata only, no transfer
    None,
}

/// Counters for one completed cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub actions_planned: usize,
    pub actions_succeeded: usize,
    pub actions_failed: usize,
    pub actions_skipped: usize,
    pub conflicts: usize,
    pub blacklisted: usize,
    pub duration_ms: u64,
}

/// An engine event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    ItemAdded {
        session_id: SessionId,
        item_id: UniqueId,
        path: RelativePath,
        direction: Direction,
    },
    ItemRemoved {
        session_id: SessionId,
        item_id: UniqueId,
        path: RelativePath,
        direction: Direction,
    },
    ItemUpdated {
        session_id: SessionId,
        item_id: UniqueId,
        path: RelativePath,
        direction: Direction,
    },
    ItemMoved {
        session_id: SessionId,
        item_id: UniqueId,
        from: RelativePath,
        to: RelativePath,
        direction: Direction,
    },
    /// A transient failure on one item; it will be retried
    ItemFailed {
        session_id: SessionId,
        item_id: UniqueId,
        error: SyncErrorCode,
    },
    ConflictRaised {
        session_id: SessionId,
        conflict_id: ConflictId,
        item_id: UniqueId,
        kind: ConflictKind,
        policy: ConflictPolicy,
        error: SyncErrorCode,
    },
    ConflictResolved {
        session_id: SessionId,
        conflict_id: ConflictId,
        policy: ConflictPolicy,
    },
    ItemBlacklisted {
        session_id: SessionId,
        item_id: UniqueId,
        reason: BlacklistReason,
        scope: BlacklistScope,
        error: SyncErrorCode,
    },
    BlacklistCleared {
        session_id: SessionId,
        item_ids: Vec<UniqueId>,
    },
    ItemExcluded {
        session_id: SessionId,
        item_id: UniqueId,
        error: SyncErrorCode,
    },
    LargeFolderPending {
        session_id: SessionId,
        item_id: UniqueId,
        size_bytes: u64,
        error: SyncErrorCode,
    },
    SessionAdded {
        session_id: SessionId,
        local_root: String,
    },
    SessionRemoved {
        session_id: SessionId,
    },
    SessionPaused {
        session_id: SessionId,
        reason: String,
    },
    SessionResumed {
        session_id: SessionId,
    },
    SessionError {
        session_id: SessionId,
        error: SyncErrorCode,
    },
    HydrationStarted {
        session_id: SessionId,
        item_id: UniqueId,
        path: RelativePath,
    },
    HydrationCompleted {
        session_id: SessionId,
        item_id: UniqueId,
        path: RelativePath,
        bytes: u64,
    },
    HydrationFailed {
        session_id: SessionId,
        item_id: UniqueId,
        error: SyncErrorCode,
    },
    Dehydrated {
        session_id: SessionId,
        item_id: UniqueId,
        path: RelativePath,
    },
    LiteSyncToggled {
        session_id: SessionId,
        enabled: bool,
    },
    CycleCompleted {
        session_id: SessionId,
        summary: CycleSummary,
    },
}

impl SyncEvent {
    /// Session the event belongs to
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        match self {
            SyncEvent::ItemAdded { session_id, .. }
            | SyncEvent::ItemRemoved { session_id, .. }
            | SyncEvent::ItemUpdated { session_id, .. }
            | SyncEvent::ItemMoved { session_id, .. }
            | SyncEvent::ItemFailed { session_id, .. }
            | SyncEvent::ConflictRaised { session_id, .. }
            | SyncEvent::ConflictResolved { session_id, .. }
            | SyncEvent::ItemBlacklisted { session_id, .. }
            | SyncEvent::BlacklistCleared { session_id, .. }
            | SyncEvent::ItemExcluded { session_id, .. }
            | SyncEvent::LargeFolderPending { session_id, .. }
            | SyncEvent::SessionAdded { session_id, .. }
            | SyncEvent::SessionRemoved { session_id }
            | SyncEvent::SessionPaused { session_id, .. }
            | SyncEvent::SessionResumed { session_id }
            | SyncEvent::SessionError { session_id, .. }
            | SyncEvent::HydrationStarted { session_id, .. }
            | SyncEvent::HydrationCompleted { session_id, .. }
            | SyncEvent::HydrationFailed { session_id, .. }
            | SyncEvent::Dehydrated { session_id, .. }
            | SyncEvent::LiteSyncToggled { session_id, .. }
            | SyncEvent::CycleCompleted { session_id, .. } => session_id,
        }
    }

    /// Short event name for logs and storage
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::ItemAdded { .. } => "item_added",
            SyncEvent::ItemRemoved { .. } => "item_removed",
            SyncEvent::ItemUpdated { .. } => "item_updated",
            SyncEvent::ItemMoved { .. } => "item_moved",
            SyncEvent::ItemFailed { .. } => "item_failed",
            SyncEvent::ConflictRaised { .. } => "conflict_raised",
            SyncEvent::ConflictResolved { .. } => "conflict_resolved",
            SyncEvent::ItemBlacklisted { .. } => "item_blacklisted",
            SyncEvent::BlacklistCleared { .. } => "blacklist_cleared",
            SyncEvent::ItemExcluded { .. } => "item_excluded",
            SyncEvent::LargeFolderPending { .. } => "large_folder_pending",
            SyncEvent::SessionAdded { .. } => "session_added",
            SyncEvent::SessionRemoved { .. } => "session_removed",
            SyncEvent::SessionPaused { .. } => "session_paused",
            SyncEvent::SessionResumed { .. } => "session_resumed",
            SyncEvent::SessionError { .. } => "session_error",
            SyncEvent::HydrationStarted { .. } => "hydration_started",
            SyncEvent::HydrationCompleted { .. } => "hydration_completed",
            SyncEvent::HydrationFailed { .. } => "hydration_failed",
            SyncEvent::Dehydrated { .. } => "dehydrated",
            SyncEvent::LiteSyncToggled { .. } => "lite_sync_toggled",
            SyncEvent::CycleCompleted { .. } => "cycle_completed",
        }
    }

    /// The error code carried by the event, if any
    #[must_use]
    pub fn error(&self) -> Option<&SyncErrorCode> {
        match self {
            SyncEvent::ItemFailed { error, .. }
            | SyncEvent::ConflictRaised { error, .. }
            | SyncEvent::ItemBlacklisted { error, .. }
            | SyncEvent::ItemExcluded { error, .. }
            | SyncEvent::LargeFolderPending { error, .. }
            | SyncEvent::SessionError { error, .. }
            | SyncEvent::HydrationFailed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Activity classification of item events
    #[must_use]
    pub fn activity(&self) -> Option<ActivityKind> {
        match self {
            SyncEvent::ItemAdded { .. } => Some(ActivityKind::Added),
            SyncEvent::ItemRemoved { .. } => Some(ActivityKind::Removed),
            SyncEvent::ItemUpdated { .. } => Some(ActivityKind::Updated),
            SyncEvent::ItemMoved { .. } => Some(ActivityKind::Moved),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> RelativePath {
        RelativePath::new(s).unwrap()
    }

    #[test]
    fn test_accessors() {
        let sid = SessionId::new();
        let event = SyncEvent::ItemMoved {
            session_id: sid,
            item_id: UniqueId::new(),
            from: path("a"),
            to: path("b"),
            direction: Direction::Up,
        };
        assert_eq!(event.session_id(), &sid);
        assert_eq!(event.activity(), Some(ActivityKind::Moved));
        assert!(event.error().is_none());

        let event = SyncEvent::SessionError {
            session_id: sid,
            error: SyncErrorCode::DiskFull,
        };
        assert_eq!(event.name(), "session_error");
        assert_eq!(event.error(), Some(&SyncErrorCode::DiskFull));
        assert_eq!(event.activity(), None);
    }

    #[test]
    fn test_serializes_with_tag() {
        let event = SyncEvent::LiteSyncToggled {
            session_id: SessionId::new(),
            enabled: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "lite_sync_toggled");
        assert_eq!(json["enabled"], true);

        let back: SyncEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
