//! Sync session entity
//!
//! A `SyncSession` pairs one local root with one remote folder. It owns
//! its items, blacklist, conflicts and change-feed cursor.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{ChangeCursor, RemotePath, SessionId, SyncPath};

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Cycles run
    #[default]
    Active,
    /// No cycles run until resumed
    Paused,
    /// In-flight actions are finishing; no new ones start
    Draining,
    /// Stopped on an error that needs attention (disk full, unauthorized)
    Error,
}

impl SessionStatus {
    /// Storage representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Draining => "draining",
            SessionStatus::Error => "error",
        }
    }

    /// Checks a status transition
    ///
    /// Any running state may drain; draining ends paused (or removed).
    #[must_use]
    pub fn can_transition_to(&self, target: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, target),
            (Active, Paused)
                | (Active, Draining)
                | (Active, Error)
                | (Paused, Active)
                | (Paused, Draining)
                | (Draining, Paused)
                | (Error, Active)
                | (Error, Paused)
                | (Error, Draining)
        )
    }

    /// Whether cycles may run
    #[must_use]
    pub fn is_running(&self) -> bool {
        *self == SessionStatus::Active
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "paused" => Ok(SessionStatus::Paused),
            "draining" => Ok(SessionStatus::Draining),
            "error" => Ok(SessionStatus::Error),
            other => Err(DomainError::UnknownVariant {
                kind: "session status",
                value: other.to_string(),
            }),
        }
    }
}

/// One local root paired with one remote folder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSession {
    id: SessionId,
    name: String,
    local_root: SyncPath,
    remote_root: RemotePath,
    status: SessionStatus,
    lite_sync: bool,
    cursor: Option<ChangeCursor>,
    status_detail: Option<String>,
    created_at: DateTime<Utc>,
    last_cycle_at: Option<DateTime<Utc>>,
}

impl SyncSession {
    /// Creates a new active session
    #[must_use]
    pub fn new(name: impl Into<String>, local_root: SyncPath, remote_root: RemotePath) -> Self {
        Self {
            id: SessionId::new(),
            name: name.into(),
            local_root,
            remote_root,
            status: SessionStatus::Active,
            lite_sync: false,
            cursor: None,
            status_detail: None,
            created_at: Utc::now(),
            last_cycle_at: None,
        }
    }

    /// Rebuild from storage
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn restore(
        id: SessionId,
        name: String,
        local_root: SyncPath,
        remote_root: RemotePath,
        status: SessionStatus,
        lite_sync: bool,
        cursor: Option<ChangeCursor>,
        status_detail: Option<String>,
        created_at: DateTime<Utc>,
        last_cycle_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            name,
            local_root,
            remote_root,
            status,
            lite_sync,
            cursor,
            status_detail,
            created_at,
            last_cycle_at,
        }
    }

    /// Enable or disable Lite Sync at creation time
    #[must_use]
    pub fn with_lite_sync(mut self, enabled: bool) -> Self {
        self.lite_sync = enabled;
        self
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_root(&self) -> &SyncPath {
        &self.local_root
    }

    pub fn remote_root(&self) -> &RemotePath {
        &self.remote_root
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Human readable reason for `Paused` or `Error`
    pub fn status_detail(&self) -> Option<&str> {
        self.status_detail.as_deref()
    }

    pub fn lite_sync(&self) -> bool {
        self.lite_sync
    }

    /// Opaque change-feed position; `None` forces a full listing
    pub fn cursor(&self) -> Option<&ChangeCursor> {
        self.cursor.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_cycle_at(&self) -> Option<DateTime<Utc>> {
        self.last_cycle_at
    }

    /// Change status, checking the transition
    ///
    /// # Errors
    /// Returns `DomainError::InvalidState` for a forbidden transition
    pub fn transition_to(
        &mut self,
        target: SessionStatus,
        detail: Option<String>,
    ) -> Result<(), DomainError> {
        if self.status == target {
            self.status_detail = detail;
            return Ok(());
        }
        if !self.status.can_transition_to(target) {
            return Err(DomainError::InvalidState {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }
        self.status = target;
        self.status_detail = detail;
        Ok(())
    }

    pub fn set_lite_sync(&mut self, enabled: bool) {
        self.lite_sync = enabled;
    }

    pub fn set_cursor(&mut self, cursor: Option<ChangeCursor>) {
        self.cursor = cursor;
    }

    pub fn record_cycle(&mut self, at: DateTime<Utc>) {
        self.last_cycle_at = Some(at);
    }
}
