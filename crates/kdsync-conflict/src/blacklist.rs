//! Blacklist manager
//!
//! Admits items to the blacklist, releases them, and schedules retries of
//! temporary entries.
//!
//! ## Design Notes
//!
//! - Every admission and release goes through the repository's atomic
//!   operations, so the entry row and the item's `SyncState` change in one
//!   transaction.
//! - Retry deadlines come from the injected [`Clock`]; nothing here sleeps.
//! - Temporary entries are released either when their deadline passes or
//!   at startup, whichever comes first.

use std::sync::Arc;

use chrono::Duration;
use tracing::{info, warn};

use kdsync_core::{
    config::BlacklistConfig,
    domain::{
        BlacklistEntry, BlacklistReason, BlacklistScope, DomainError, SessionId, SyncErrorCode,
        SyncEvent, SyncItem, SyncState, UniqueId,
    },
    ports::{Clock, IEventSink, IStateRepository},
};

use crate::error::ConflictError;

/// Outcome of recording a transient failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The item will be retried next cycle
    Retry { attempts: u32 },
    /// The retry budget is spent; the item is now blacklisted
    Blacklisted(BlacklistEntry),
}

/// Manages blacklist admission, release and retry scheduling
pub struct BlacklistManager {
    repository: Arc<dyn IStateRepository>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn IEventSink>,
    config: BlacklistConfig,
}

impl BlacklistManager {
    pub fn new(
        repository: Arc<dyn IStateRepository>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn IEventSink>,
        config: BlacklistConfig,
    ) -> Self {
        Self {
            repository,
            clock,
            events,
            config,
        }
    }

    /// Retry interval of temporary entries
    pub fn retry_interval(&self) -> Duration {
        Duration::seconds(i64::try_from(self.config.retry_interval_secs).unwrap_or(i64::MAX))
    }

    /// Blacklists `item` for `reason`
    ///
    /// `scope` defaults to the reason's scope. An item that is already
    /// blacklisted keeps its first-seen time and counts another attempt.
    /// The item must already be stored.
    pub async fn blacklist(
        &self,
        item: &mut SyncItem,
        reason: BlacklistReason,
        scope: Option<BlacklistScope>,
    ) -> Result<BlacklistEntry, ConflictError> {
        let scope = scope.unwrap_or_else(|| reason.default_scope());
        let target = SyncState::Blacklisted(scope);
        if !item.can_transition_to(target) {
            return Err(DomainError::InvalidState {
                from: item.state().to_string(),
                to: target.to_string(),
            }
            .into());
        }

        let now = self.clock.now();
        let retry_at = match scope {
            BlacklistScope::Temporary => Some(now + self.retry_interval()),
            BlacklistScope::Permanent => None,
        };

        let entry = match item.blacklist() {
            Some(existing) => {
                let mut entry = existing.clone();
                entry.readmit(reason, scope, retry_at);
                entry.set_path(item.local_path().clone());
                entry
            }
            None => BlacklistEntry::new(
                *item.id(),
                *item.session_id(),
                item.local_path().clone(),
                reason,
                scope,
                now,
                retry_at,
            ),
        };

        self.repository.admit_to_blacklist(&entry).await?;
        item.transition_to(target)?;
        item.set_blacklist(Some(entry.clone()));

        warn!(
            item_id = %item.id(),
            path = %item.local_path(),
            reason = %reason,
            scope = %scope,
            attempts = entry.attempts(),
            "Item blacklisted"
        );
        self.events.emit(SyncEvent::ItemBlacklisted {
            session_id: *item.session_id(),
            item_id: *item.id(),
            reason,
            scope,
            error: SyncErrorCode::for_blacklist(reason, item.local_path().clone()),
        });

        Ok(entry)
    }

    /// Releases one item; it is reconciled again next cycle
    ///
    /// Returns `false` if the item was not blacklisted.
    pub async fn clear_blacklist(&self, item_id: &UniqueId) -> Result<bool, ConflictError> {
        let Some(entry) = self.repository.get_blacklist_entry(item_id).await? else {
            return Ok(false);
        };
        let released = self.repository.release_from_blacklist(item_id).await?;
        if released {
            info!(item_id = %item_id, path = %entry.path(), "Blacklist entry cleared");
            self.events.emit(SyncEvent::BlacklistCleared {
                session_id: *entry.session_id(),
                item_ids: vec![*item_id],
            });
        }
        Ok(released)
    }

    /// Every entry of a session (or of all sessions)
    pub async fn list_pending(
        &self,
        session_id: Option<&SessionId>,
    ) -> Result<Vec<BlacklistEntry>, ConflictError> {
        Ok(self.repository.list_blacklist(session_id).await?)
    }

    /// Temporary entries whose retry time has come
    pub async fn due_for_retry(
        &self,
        session_id: Option<&SessionId>,
    ) -> Result<Vec<BlacklistEntry>, ConflictError> {
        let now = self.clock.now();
        Ok(self
            .repository
            .list_blacklist(session_id)
            .await?
            .into_iter()
            .filter(|entry| entry.is_due(now))
            .collect())
    }

    /// Releases every due entry of a session, returning the released items
    pub async fn release_due(&self, session_id: &SessionId) -> Result<Vec<UniqueId>, ConflictError> {
        let due = self.due_for_retry(Some(session_id)).await?;
        self.release_all(session_id, due).await
    }

    /// Releases all temporary entries when configured to do so at startup
    pub async fn release_temporary_on_startup(&self) -> Result<Vec<UniqueId>, ConflictError> {
        if !self.config.clear_temporary_on_startup {
            return Ok(Vec::new());
        }

        let mut released = Vec::new();
        for session in self.repository.list_sessions().await? {
            let temporary: Vec<BlacklistEntry> = self
                .repository
                .list_blacklist(Some(session.id()))
                .await?
                .into_iter()
                .filter(|entry| entry.scope() == BlacklistScope::Temporary)
                .collect();
            released.extend(self.release_all(session.id(), temporary).await?);
        }

        if !released.is_empty() {
            info!(count = released.len(), "Released temporary blacklist entries at startup");
        }
        Ok(released)
    }

    /// Counts a transient failure of `item`
    ///
    /// Below `max_retries` the item goes back to `SyncPending` (the caller
    /// persists it). At the limit it is blacklisted temporarily with
    /// `technical-error`.
    pub async fn record_transient_failure(
        &self,
        item: &mut SyncItem,
        max_retries: u32,
    ) -> Result<FailureOutcome, ConflictError> {
        let attempts = item.record_failure();
        if attempts >= max_retries.max(1) {
            item.clear_failures();
            let entry = self
                .blacklist(item, BlacklistReason::TechnicalError, None)
                .await?;
            return Ok(FailureOutcome::Blacklisted(entry));
        }

        if item.state() != SyncState::SyncPending && item.can_transition_to(SyncState::SyncPending) {
            item.transition_to(SyncState::SyncPending)?;
        }
        Ok(FailureOutcome::Retry { attempts })
    }

    async fn release_all(
        &self,
        session_id: &SessionId,
        entries: Vec<BlacklistEntry>,
    ) -> Result<Vec<UniqueId>, ConflictError> {
        let mut released = Vec::new();
        for entry in entries {
            if self.repository.release_from_blacklist(entry.item_id()).await? {
                released.push(*entry.item_id());
            }
        }
        if !released.is_empty() {
            info!(
                session_id = %session_id,
                count = released.len(),
                "Blacklist entries released for retry"
            );
            self.events.emit(SyncEvent::BlacklistCleared {
                session_id: *session_id,
                item_ids: released.clone(),
            });
        }
        Ok(released)
    }
}
