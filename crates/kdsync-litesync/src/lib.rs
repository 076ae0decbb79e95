//! kdsync Lite Sync - placeholder management
//!
//! Remote items of a Lite Sync session arrive as placeholders: a store row
//! with no content on disk. This crate hydrates them on access, dehydrates
//! synced files to reclaim space, and works the persisted hydration queue
//! when Lite Sync is turned off.
//!
//! ## Modules
//!
//! - [`manager`] - [`PlaceholderManager`]: hydrate, open, dehydrate
//! - [`queue`] - Lite Sync toggling and resumable bulk hydration
//! - [`error`] - [`PlaceholderError`]

pub mod error;
pub mod manager;
pub mod queue;

pub use error::PlaceholderError;
pub use manager::PlaceholderManager;
pub use queue::QueueReport;
