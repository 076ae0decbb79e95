//! kdsync core - domain model and ports
//!
//! This crate holds the hexagonal core of the sync engine:
//! - **Domain entities** - `SyncItem`, `SyncSession`, `ConflictRecord`, `BlacklistEntry`
//! - **Port definitions** - `IStateRepository`, `IRemoteDrive`, `ILocalFileSystem`,
//!   `IEventSink`, `IPlaceholderHydrator`, `Clock`
//! - **Configuration** - YAML-backed `Config` with validation
//!
//! Adapter crates implement the ports; the sync crate drives them.

pub mod config;
pub mod domain;
pub mod ports;
