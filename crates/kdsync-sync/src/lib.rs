//! kdsync Sync - reconciliation engine and session service
//!
//! Keeps a local directory and a remote drive tree in agreement, one sync
//! session per pair.
//!
//! ## Flow
//!
//! ```text
//!  SessionWatcher ─┐                         ┌─→ LocalScanner ─┐
//!  poll / request ─┼─→ SessionScheduler ──→ SessionConsumer   ├─→ Reconciler ─→ ActionExecutor
//!                  │                         └─→ RemoteFeed ───┘        │
//!  CLI / daemon ───┴─→ SyncService (commands, SessionRegistry)     state store
//! ```
//!
//! ## Modules
//!
//! - [`service`] - [`SyncService`]: the command API over all sessions
//! - [`registry`] - session lifecycle, nesting checks, per-session locks
//! - [`consumer`] - one reconciliation cycle of a session
//! - [`reconciler`] - deltas to a dependency-ordered [`Plan`](reconciler::Plan)
//! - [`executor`] - runs plan waves under the [`ResourceCeiling`]
//! - [`delta`] - local scanning and per-item delta detection
//! - [`remote_feed`] - remote change-feed ingestion
//! - [`validator`] - name validation and case-collision detection
//! - [`filesystem`] - the local filesystem adapter
//! - [`remote_dir`] - a directory-backed remote drive
//! - [`watcher`] / [`scheduler`] - change notification and cycle triggers
//! - [`throttle`] / [`retry`] - resource ceiling and transient retries

pub mod consumer;
pub mod delta;
pub mod error;
pub mod executor;
pub mod filesystem;
pub mod plan;
pub mod reconciler;
pub mod registry;
pub mod remote_dir;
pub mod remote_feed;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod throttle;
pub mod validator;
pub mod watcher;

pub use consumer::{EngineDeps, SessionConsumer};
pub use error::{ActionFailure, FailureKind, SyncError};
pub use filesystem::LocalFileSystem;
pub use registry::SessionRegistry;
pub use remote_dir::DirectoryRemoteDrive;
pub use scheduler::{SchedulerHandle, SessionScheduler};
pub use service::{ServiceStatus, SessionReport, SyncService};
pub use throttle::ResourceCeiling;
pub use watcher::{LocalChange, SessionWatcher};
