//! User-facing error taxonomy
//!
//! Every failure the engine reports to the user is a `SyncErrorCode`: a
//! stable code, a category, a message template and its parameters.
//! Rendering happens in one place so the daemon, the CLI and the event
//! stream all show the same wording.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::blacklist::BlacklistReason;
use super::conflict::ConflictKind;
use super::newtypes::RelativePath;

/// Broad family of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Will be retried automatically
    Transient,
    /// Blocked by a platform or user rule
    Policy,
    /// The remote or the local system refused access
    Permission,
    /// Concurrent changes were reconciled with a policy
    Conflict,
    /// Storage limits
    Quota,
    /// Affects a whole session
    Session,
}

impl ErrorCategory {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Policy => "policy",
            ErrorCategory::Permission => "permission",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::Quota => "quota",
            ErrorCategory::Session => "session",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-facing sync error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum SyncErrorCode {
    // --- transient ---
    /// Remote unreachable
    NetworkUnavailable,
    /// Local disk is full
    DiskFull,
    /// Out of memory
    InsufficientMemory,
    /// Item locked by another user online
    ItemLocked { path: RelativePath },
    /// Unexpected failure on an item, will be retried
    TechnicalError { path: RelativePath, detail: String },

    // --- policy ---
    UnsupportedCharacter { path: RelativePath },
    NameOnlySpaces { path: RelativePath },
    TrailingSpace { path: RelativePath },
    ReservedName { path: RelativePath },
    NameTooLong { path: RelativePath },
    PathTooLong { path: RelativePath },
    DuplicateCaseInsensitiveName { path: RelativePath },
    HardLink { path: RelativePath },
    ExcludedByTemplate { path: RelativePath },
    /// Folder above the size threshold awaits confirmation
    LargeFolderPending { path: RelativePath, size_mb: u64 },

    // --- permission ---
    OperationForbidden { path: RelativePath },
    EditForbidden { path: RelativePath },
    MoveForbidden { path: RelativePath, destination: RelativePath },
    DeleteForbidden { path: RelativePath },
    LocalAccessDenied { path: RelativePath },
    Unauthorized,

    // --- conflict ---
    EditEditConflict { path: RelativePath, copy: RelativePath },
    EditDeleteConflict { path: RelativePath, rescued: RelativePath },
    DeleteEditConflict { path: RelativePath },
    CreateCreateConflict { path: RelativePath, copy: RelativePath },
    MoveIntoDeletedParent { path: RelativePath, restored: RelativePath },
    RenameRace { path: RelativePath },
    CreateInDeletedParent { path: RelativePath, rescued: RelativePath },
    ConflictAwaitingUser { path: RelativePath },

    // --- quota ---
    QuotaExceeded { path: RelativePath },
    FileTooLarge { path: RelativePath },

    // --- session ---
    NestedSession { path: String, existing: String },
    SessionBeingDeleted,
    SyncRootUnavailable { path: String },
    HydrationFailed { path: RelativePath, detail: String },
    DehydrationRefused { path: RelativePath },
}

impl SyncErrorCode {
    /// Stable machine-readable code
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            SyncErrorCode::NetworkUnavailable => "network_unavailable",
            SyncErrorCode::DiskFull => "disk_full",
            SyncErrorCode::InsufficientMemory => "insufficient_memory",
            SyncErrorCode::ItemLocked { .. } => "item_locked",
            SyncErrorCode::TechnicalError { .. } => "technical_error",
            SyncErrorCode::UnsupportedCharacter { .. } => "unsupported_character",
            SyncErrorCode::NameOnlySpaces { .. } => "name_only_spaces",
            SyncErrorCode::TrailingSpace { .. } => "trailing_space",
            SyncErrorCode::ReservedName { .. } => "reserved_name",
            SyncErrorCode::NameTooLong { .. } => "name_too_long",
            SyncErrorCode::PathTooLong { .. } => "path_too_long",
            SyncErrorCode::DuplicateCaseInsensitiveName { .. } => "duplicate_case_insensitive_name",
            SyncErrorCode::HardLink { .. } => "hard_link",
            SyncErrorCode::ExcludedByTemplate { .. } => "excluded_by_template",
            SyncErrorCode::LargeFolderPending { .. } => "large_folder_pending",
            SyncErrorCode::OperationForbidden { .. } => "operation_forbidden",
            SyncErrorCode::EditForbidden { .. } => "edit_forbidden",
            SyncErrorCode::MoveForbidden { .. } => "move_forbidden",
            SyncErrorCode::DeleteForbidden { .. } => "delete_forbidden",
            SyncErrorCode::LocalAccessDenied { .. } => "local_access_denied",
            SyncErrorCode::Unauthorized => "unauthorized",
            SyncErrorCode::EditEditConflict { .. } => "edit_edit_conflict",
            SyncErrorCode::EditDeleteConflict { .. } => "edit_delete_conflict",
            SyncErrorCode::DeleteEditConflict { .. } => "delete_edit_conflict",
            SyncErrorCode::CreateCreateConflict { .. } => "create_create_conflict",
            SyncErrorCode::MoveIntoDeletedParent { .. } => "move_into_deleted_parent",
            SyncErrorCode::RenameRace { .. } => "rename_race",
            SyncErrorCode::CreateInDeletedParent { .. } => "create_in_deleted_parent",
            SyncErrorCode::ConflictAwaitingUser { .. } => "conflict_awaiting_user",
            SyncErrorCode::QuotaExceeded { .. } => "quota_exceeded",
            SyncErrorCode::FileTooLarge { .. } => "file_too_large",
            SyncErrorCode::NestedSession { .. } => "nested_session",
            SyncErrorCode::SessionBeingDeleted => "session_being_deleted",
            SyncErrorCode::SyncRootUnavailable { .. } => "sync_root_unavailable",
            SyncErrorCode::HydrationFailed { .. } => "hydration_failed",
            SyncErrorCode::DehydrationRefused { .. } => "dehydration_refused",
        }
    }

    /// Error family
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        use SyncErrorCode::*;
        match self {
            NetworkUnavailable | DiskFull | InsufficientMemory | ItemLocked { .. }
            | TechnicalError { .. } => ErrorCategory::Transient,
            UnsupportedCharacter { .. }
            | NameOnlySpaces { .. }
            | TrailingSpace { .. }
            | ReservedName { .. }
            | NameTooLong { .. }
            | PathTooLong { .. }
            | DuplicateCaseInsensitiveName { .. }
            | HardLink { .. }
            | ExcludedByTemplate { .. }
            | LargeFolderPending { .. } => ErrorCategory::Policy,
            OperationForbidden { .. }
            | EditForbidden { .. }
            | MoveForbidden { .. }
            | DeleteForbidden { .. }
            | LocalAccessDenied { .. }
            | Unauthorized => ErrorCategory::Permission,
            EditEditConflict { .. }
            | EditDeleteConflict { .. }
            | DeleteEditConflict { .. }
            | CreateCreateConflict { .. }
            | MoveIntoDeletedParent { .. }
            | RenameRace { .. }
            | CreateInDeletedParent { .. }
            | ConflictAwaitingUser { .. } => ErrorCategory::Conflict,
            QuotaExceeded { .. } | FileTooLarge { .. } => ErrorCategory::Quota,
            NestedSession { .. }
            | SessionBeingDeleted
            | SyncRootUnavailable { .. }
            | HydrationFailed { .. }
            | DehydrationRefused { .. } => ErrorCategory::Session,
        }
    }

    /// Message template with `{name}` placeholders
    #[must_use]
    pub fn template(&self) -> &'static str {
        use SyncErrorCode::*;
        match self {
            NetworkUnavailable => "The remote drive cannot be reached. Synchronization will resume when the connection is back.",
            DiskFull => "There is not enough space left on your computer. The synchronization has been stopped.",
            InsufficientMemory => "There is not enough memory left on your machine. The synchronization has been stopped.",
            ItemLocked { .. } => "{path} is currently locked by another user online. We will retry uploading your changes later.",
            TechnicalError { .. } => "Failed to synchronize {path} ({detail}). It has been temporarily blacklisted. Another attempt to sync it will be done in one hour or on next application startup.",
            UnsupportedCharacter { .. } => "The name of {path} contains an unsupported character. It has been temporarily blacklisted.",
            NameOnlySpaces { .. } => "The name of {path} contains only spaces. It has been temporarily blacklisted.",
            TrailingSpace { .. } => "The name of {path} ends with a space, which is forbidden on your operating system. It has been temporarily blacklisted.",
            ReservedName { .. } => "The name of {path} is reserved by your operating system. It has been blacklisted.",
            NameTooLong { .. } => "The name of {path} is too long. It has been temporarily blacklisted.",
            PathTooLong { .. } => "The path of {path} is too long. It has been ignored.",
            DuplicateCaseInsensitiveName { .. } => "An existing item has an identical name with the same case options as {path}. It has been temporarily blacklisted.",
            HardLink { .. } => "{path} has been excluded from sync because it is a hard link.",
            ExcludedByTemplate { .. } => "{path} has been excluded from sync by a custom template.",
            LargeFolderPending { .. } => "The folder {path} ({size_mb} MB) exceeds the size limit and waits for your confirmation before being synchronized.",
            OperationForbidden { .. } => "The operation performed on {path} is forbidden. The item has been temporarily blacklisted.",
            EditForbidden { .. } => "You are not allowed to edit {path}. Your modifications have been saved in a copy.",
            MoveForbidden { .. } => "You are not allowed to move {path} to {destination}. It has been restored to its original location.",
            DeleteForbidden { .. } => "You are not allowed to delete {path}. It has been restored.",
            LocalAccessDenied { .. } => "Access to {path} was denied by your computer. It has been temporarily blacklisted.",
            Unauthorized => "You are not authorised to access this drive. Synchronization has been paused.",
            EditEditConflict { .. } => "{path} was modified at the same time by another user. Your modifications have been saved in {copy}.",
            EditDeleteConflict { .. } => "{path} has been modified locally while it has been deleted on the remote drive. The local copy has been saved as {rescued}.",
            DeleteEditConflict { .. } => "{path} has been deleted locally while it has been modified on the remote drive. It has been restored.",
            CreateCreateConflict { .. } => "{path} was created at the same time on both sides. Your version has been saved in {copy}.",
            MoveIntoDeletedParent { .. } => "{path} was moved into a folder that has been deleted on the other side. It has been restored to {restored}.",
            RenameRace { .. } => "{path} was renamed on both sides at the same time. The remote name has been kept.",
            CreateInDeletedParent { .. } => "{path} was created in a folder that has been deleted on the other side. It has been saved as {rescued}.",
            ConflictAwaitingUser { .. } => "{path} is in conflict and waits for your decision.",
            QuotaExceeded { .. } => "You have exceeded your quota while uploading {path}. Increase your space quota to re-enable file upload.",
            FileTooLarge { .. } => "{path} is too large to be uploaded. It has been temporarily blacklisted.",
            NestedSession { .. } => "Nested synchronizations are prohibited: {path} overlaps {existing}.",
            SessionBeingDeleted => "This synchronization is being deleted.",
            SyncRootUnavailable { .. } => "The synchronization folder {path} is not accessible. The synchronization has been stopped.",
            HydrationFailed { .. } => "{path} could not be downloaded ({detail}).",
            DehydrationRefused { .. } => "{path} has local changes that are not synchronized yet and cannot be freed up.",
        }
    }

    /// Template parameters
    #[must_use]
    pub fn params(&self) -> Vec<(&'static str, String)> {
        use SyncErrorCode::*;
        match self {
            NetworkUnavailable | DiskFull | InsufficientMemory | Unauthorized
            | SessionBeingDeleted => Vec::new(),
            ItemLocked { path }
            | UnsupportedCharacter { path }
            | NameOnlySpaces { path }
            | TrailingSpace { path }
            | ReservedName { path }
            | NameTooLong { path }
            | PathTooLong { path }
            | DuplicateCaseInsensitiveName { path }
            | HardLink { path }
            | ExcludedByTemplate { path }
            | OperationForbidden { path }
            | EditForbidden { path }
            | DeleteForbidden { path }
            | LocalAccessDenied { path }
            | DeleteEditConflict { path }
            | RenameRace { path }
            | ConflictAwaitingUser { path }
            | QuotaExceeded { path }
            | FileTooLarge { path }
            | DehydrationRefused { path } => vec![("path", path.to_string())],
            TechnicalError { path, detail } | HydrationFailed { path, detail } => {
                vec![("path", path.to_string()), ("detail", detail.clone())]
            }
            LargeFolderPending { path, size_mb } => {
                vec![("path", path.to_string()), ("size_mb", size_mb.to_string())]
            }
            MoveForbidden { path, destination } => vec![
                ("path", path.to_string()),
                ("destination", destination.to_string()),
            ],
            EditEditConflict { path, copy } | CreateCreateConflict { path, copy } => {
                vec![("path", path.to_string()), ("copy", copy.to_string())]
            }
            EditDeleteConflict { path, rescued } | CreateInDeletedParent { path, rescued } => {
                vec![("path", path.to_string()), ("rescued", rescued.to_string())]
            }
            MoveIntoDeletedParent { path, restored } => {
                vec![("path", path.to_string()), ("restored", restored.to_string())]
            }
            NestedSession { path, existing } => {
                vec![("path", path.clone()), ("existing", existing.clone())]
            }
            SyncRootUnavailable { path } => vec![("path", path.clone())],
        }
    }

    /// Render the message
    #[must_use]
    pub fn render(&self) -> String {
        let mut message = self.template().to_string();
        for (name, value) in self.params() {
            message = message.replace(&format!("{{{name}}}"), &value);
        }
        message
    }

    /// Whether the item will be retried without user action
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Error reported when an item is blacklisted for `reason`
    #[must_use]
    pub fn for_blacklist(reason: BlacklistReason, path: RelativePath) -> Self {
        match reason {
            BlacklistReason::UnsupportedCharacter => {
                let name = path.file_name();
                if !name.is_empty() && name.chars().all(|c| c == ' ') {
                    SyncErrorCode::NameOnlySpaces { path }
                } else if name.ends_with(' ') {
                    SyncErrorCode::TrailingSpace { path }
                } else {
                    SyncErrorCode::UnsupportedCharacter { path }
                }
            }
            BlacklistReason::ReservedName => SyncErrorCode::ReservedName { path },
            BlacklistReason::NameTooLong => SyncErrorCode::NameTooLong { path },
            BlacklistReason::PathTooLong => SyncErrorCode::PathTooLong { path },
            BlacklistReason::DuplicateCaseInsensitiveName => {
                SyncErrorCode::DuplicateCaseInsensitiveName { path }
            }
            BlacklistReason::HardLink => SyncErrorCode::HardLink { path },
            BlacklistReason::CustomTemplateExclusion => SyncErrorCode::ExcludedByTemplate { path },
            BlacklistReason::QuotaExceeded => SyncErrorCode::QuotaExceeded { path },
            BlacklistReason::TooLarge => SyncErrorCode::FileTooLarge { path },
            BlacklistReason::ForbiddenOperation => SyncErrorCode::OperationForbidden { path },
            BlacklistReason::TechnicalError => SyncErrorCode::TechnicalError {
                path,
                detail: "repeated failures".to_string(),
            },
        }
    }

    /// Error reported when a conflict was resolved
    ///
    /// `copy` is where the local content was preserved or restored to, if
    /// the policy moved it.
    #[must_use]
    pub fn for_conflict(kind: ConflictKind, path: RelativePath, copy: Option<RelativePath>) -> Self {
        let copy_or_path = copy.unwrap_or_else(|| path.clone());
        match kind {
            ConflictKind::EditEdit => SyncErrorCode::EditEditConflict {
                path,
                copy: copy_or_path,
            },
            ConflictKind::EditDelete => SyncErrorCode::EditDeleteConflict {
                path,
                rescued: copy_or_path,
            },
            ConflictKind::DeleteEdit => SyncErrorCode::DeleteEditConflict { path },
            ConflictKind::CreateCreate => SyncErrorCode::CreateCreateConflict {
                path,
                copy: copy_or_path,
            },
            ConflictKind::MoveIntoDeletedParent => SyncErrorCode::MoveIntoDeletedParent {
                path,
                restored: copy_or_path,
            },
            ConflictKind::RenameRace => SyncErrorCode::RenameRace { path },
            ConflictKind::CreateInDeletedParent => SyncErrorCode::CreateInDeletedParent {
                path,
                rescued: copy_or_path,
            },
            ConflictKind::EditForbidden => SyncErrorCode::EditForbidden { path },
        }
    }
}

impl fmt::Display for SyncErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}
