//! Port definitions (hexagonal architecture interfaces)
//!
//! Traits at the boundaries of the engine. Implementations live in adapter
//! crates (`kdsync-cache` for the store, `kdsync-sync` for the filesystem
//! and directory-backed remote, `kdsync-activity` for event sinks,
//! `kdsync-litesync` for hydration).
//!
//! ## Ports Overview
//!
//! - [`IStateRepository`] - Metadata store
//! - [`IRemoteDrive`] - Remote change feed and remote operations
//! - [`ILocalFileSystem`] - Local scanning and atomic writes
//! - [`IEventSink`] - Event publication
//! - [`IPlaceholderHydrator`] - On-demand content materialization
//! - [`Clock`] - Time source

pub mod clock;
pub mod event_sink;
pub mod hydrator;
pub mod local_filesystem;
pub mod remote_drive;
pub mod state_repository;

pub use clock::{Clock, ManualClock, SystemClock};
pub use event_sink::{IEventSink, NullEventSink};
pub use hydrator::IPlaceholderHydrator;
pub use local_filesystem::{is_temp_file_name, ILocalFileSystem, LocalEntry, TEMP_FILE_PREFIX};
pub use remote_drive::{IRemoteDrive, ProgressFn, RemoteChangeBatch, RemoteEntry, RemoteError};
pub use state_repository::{ActivityRecord, IStateRepository, ItemFilter};
