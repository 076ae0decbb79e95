//! Domain entities and business logic
//!
//! Core types of the reconciliation engine:
//! - Newtypes for identifiers and validated paths
//! - `SyncItem` with its sync and placeholder state machines
//! - Blacklist entries and conflict records
//! - Sessions, deltas and planned actions
//! - User-facing error codes and engine events

pub mod action;
pub mod blacklist;
pub mod conflict;
pub mod delta;
pub mod error_code;
pub mod errors;
pub mod event;
pub mod newtypes;
pub mod session;
pub mod sync_item;

// Re-export commonly used types
pub use action::{ActionKind, Phase, SyncAction};
pub use blacklist::{BlacklistEntry, BlacklistReason, BlacklistScope};
pub use conflict::{ConflictKind, ConflictPolicy, ConflictRecord};
pub use delta::{DeltaKind, ItemDelta, Side};
pub use error_code::{ErrorCategory, SyncErrorCode};
pub use errors::DomainError;
pub use event::{ActivityKind, CycleSummary, Direction, SyncEvent};
pub use newtypes::*;
pub use session::{SessionStatus, SyncSession};
pub use sync_item::{Fingerprint, ItemIdentity, ItemKind, PlaceholderState, SyncItem, SyncState};
