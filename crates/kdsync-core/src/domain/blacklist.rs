//! Blacklist entries
//!
//! Items that cannot be synchronized are parked on a per-session blacklist
//! with a reason and a scope. Temporary entries carry a retry time and are
//! re-admitted automatically; permanent entries wait for an explicit clear
//! or for the offending condition to disappear.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{RelativePath, SessionId, UniqueId};

/// How long an item stays blacklisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlacklistScope {
    /// Retried after the retry interval and on startup
    Temporary,
    /// Kept until cleared or until the cause is fixed
    Permanent,
}

impl BlacklistScope {
    /// Storage representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            BlacklistScope::Temporary => "temporary",
            BlacklistScope::Permanent => "permanent",
        }
    }
}

impl fmt::Display for BlacklistScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlacklistScope {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temporary" => Ok(BlacklistScope::Temporary),
            "permanent" => Ok(BlacklistScope::Permanent),
            other => Err(DomainError::UnknownVariant {
                kind: "blacklist scope",
                value: other.to_string(),
            }),
        }
    }
}

/// Why an item was blacklisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlacklistReason {
    /// Name contains a character the target platform rejects
    UnsupportedCharacter,
    /// Name is reserved by the target platform
    ReservedName,
    /// A single name component is too long
    NameTooLong,
    /// The full path is too long
    PathTooLong,
    /// Another sibling has the same name under case folding
    DuplicateCaseInsensitiveName,
    /// Local entry has more than one hard link
    HardLink,
    /// Matched a user exclusion template that asked for a warning
    CustomTemplateExclusion,
    /// Remote quota exhausted
    QuotaExceeded,
    /// File exceeds the maximum upload size
    TooLarge,
    /// Remote refused the operation
    ForbiddenOperation,
    /// Repeated technical failures
    TechnicalError,
}

impl BlacklistReason {
    /// All reasons, in storage order
    pub const ALL: [BlacklistReason; 11] = [
        BlacklistReason::UnsupportedCharacter,
        BlacklistReason::ReservedName,
        BlacklistReason::NameTooLong,
        BlacklistReason::PathTooLong,
        BlacklistReason::DuplicateCaseInsensitiveName,
        BlacklistReason::HardLink,
        BlacklistReason::CustomTemplateExclusion,
        BlacklistReason::QuotaExceeded,
        BlacklistReason::TooLarge,
        BlacklistReason::ForbiddenOperation,
        BlacklistReason::TechnicalError,
    ];

    /// Storage representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            BlacklistReason::UnsupportedCharacter => "unsupported-character",
            BlacklistReason::ReservedName => "reserved-name",
            BlacklistReason::NameTooLong => "name-too-long",
            BlacklistReason::PathTooLong => "path-too-long",
            BlacklistReason::DuplicateCaseInsensitiveName => "duplicate-case-insensitive-name",
            BlacklistReason::HardLink => "hard-link",
            BlacklistReason::CustomTemplateExclusion => "custom-template-exclusion",
            BlacklistReason::QuotaExceeded => "quota-exceeded",
            BlacklistReason::TooLarge => "too-large",
            BlacklistReason::ForbiddenOperation => "forbidden-operation",
            BlacklistReason::TechnicalError => "technical-error",
        }
    }

    /// Scope used when the reason is admitted without an explicit override
    #[must_use]
    pub fn default_scope(&self) -> BlacklistScope {
        match self {
            BlacklistReason::UnsupportedCharacter
            | BlacklistReason::NameTooLong
            | BlacklistReason::DuplicateCaseInsensitiveName
            | BlacklistReason::TooLarge
            | BlacklistReason::ForbiddenOperation
            | BlacklistReason::TechnicalError => BlacklistScope::Temporary,
            BlacklistReason::ReservedName
            | BlacklistReason::PathTooLong
            | BlacklistReason::HardLink
            | BlacklistReason::CustomTemplateExclusion
            | BlacklistReason::QuotaExceeded => BlacklistScope::Permanent,
        }
    }
}

impl fmt::Display for BlacklistReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlacklistReason {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|r| r.as_str() == s)
            .copied()
            .ok_or_else(|| DomainError::UnknownVariant {
                kind: "blacklist reason",
                value: s.to_string(),
            })
    }
}

/// A blacklisted item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    item_id: UniqueId,
    session_id: SessionId,
    path: RelativePath,
    reason: BlacklistReason,
    scope: BlacklistScope,
    first_seen: DateTime<Utc>,
    retry_at: Option<DateTime<Utc>>,
    attempts: u32,
}

impl BlacklistEntry {
    /// Creates a new entry
    #[must_use]
    pub fn new(
        item_id: UniqueId,
        session_id: SessionId,
        path: RelativePath,
        reason: BlacklistReason,
        scope: BlacklistScope,
        first_seen: DateTime<Utc>,
        retry_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            item_id,
            session_id,
            path,
            reason,
            scope,
            first_seen,
            retry_at,
            attempts: 1,
        }
    }

    /// Rebuild an entry from storage
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn restore(
        item_id: UniqueId,
        session_id: SessionId,
        path: RelativePath,
        reason: BlacklistReason,
        scope: BlacklistScope,
        first_seen: DateTime<Utc>,
        retry_at: Option<DateTime<Utc>>,
        attempts: u32,
    ) -> Self {
        Self {
            item_id,
            session_id,
            path,
            reason,
            scope,
            first_seen,
            retry_at,
            attempts,
        }
    }

    pub fn item_id(&self) -> &UniqueId {
        &self.item_id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn path(&self) -> &RelativePath {
        &self.path
    }

    pub fn reason(&self) -> BlacklistReason {
        self.reason
    }

    pub fn scope(&self) -> BlacklistScope {
        self.scope
    }

    pub fn first_seen(&self) -> DateTime<Utc> {
        self.first_seen
    }

    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        self.retry_at
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether a temporary entry has reached its retry time
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scope == BlacklistScope::Temporary && self.retry_at.map_or(true, |at| at <= now)
    }

    /// Re-admission of an item that failed again
    ///
    /// Keeps `first_seen`, bumps the attempt counter and takes the new
    /// reason, scope and retry time.
    pub fn readmit(
        &mut self,
        reason: BlacklistReason,
        scope: BlacklistScope,
        retry_at: Option<DateTime<Utc>>,
    ) {
        self.reason = reason;
        self.scope = scope;
        self.retry_at = retry_at;
        self.attempts = self.attempts.saturating_add(1);
    }

    /// Update the path after the item moved
    pub fn set_path(&mut self, path: RelativePath) {
        self.path = path;
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn test_reason_roundtrip() {
        for reason in BlacklistReason::ALL {
            assert_eq!(reason.as_str().parse::<BlacklistReason>().unwrap(), reason);
        }
        assert!("nope".parse::<BlacklistReason>().is_err());
    }

    #[test]
    fn test_default_scopes() {
        assert_eq!(
            BlacklistReason::NameTooLong.default_scope(),
            BlacklistScope::Temporary
        );
        assert_eq!(
            BlacklistReason::ReservedName.default_scope(),
            BlacklistScope::Permanent
        );
        assert_eq!(
            BlacklistReason::HardLink.default_scope(),
            BlacklistScope::Permanent
        );
        assert_eq!(
            BlacklistReason::TechnicalError.default_scope(),
            BlacklistScope::Temporary
        );
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let entry = BlacklistEntry::new(
            UniqueId::new(),
            SessionId::new(),
            RelativePath::new("a").unwrap(),
            BlacklistReason::TechnicalError,
            BlacklistScope::Temporary,
            now,
            Some(now + Duration::hours(1)),
        );
        assert!(!entry.is_due(now));
        assert!(entry.is_due(now + Duration::hours(1)));

        let permanent = BlacklistEntry::new(
            UniqueId::new(),
            SessionId::new(),
            RelativePath::new("b").unwrap(),
            BlacklistReason::HardLink,
            BlacklistScope::Permanent,
            now,
            None,
        );
        assert!(!permanent.is_due(now + Duration::days(365)));
    }

    #[test]
    fn test_readmit_keeps_first_seen() {
        let now = Utc::now();
        let mut entry = BlacklistEntry::new(
            UniqueId::new(),
            SessionId::new(),
            RelativePath::new("a").unwrap(),
            BlacklistReason::ForbiddenOperation,
            BlacklistScope::Temporary,
            now,
            Some(now),
        );
        entry.readmit(
            BlacklistReason::TechnicalError,
            BlacklistScope::Temporary,
            Some(now + Duration::hours(2)),
        );
        assert_eq!(entry.first_seen(), now);
        assert_eq!(entry.attempts(), 2);
        assert_eq!(entry.reason(), BlacklistReason::TechnicalError);
    }
}
