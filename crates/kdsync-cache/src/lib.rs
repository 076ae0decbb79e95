//! Metadata Store for kdsync
//!
//! Sessions, sync items, blacklist entries, conflict records, the Lite Sync
//! hydration queue, the activity log and engine settings all live in one
//! SQLite file. [`SqliteStateRepository`] implements `IStateRepository`;
//! [`DatabasePool`] opens the file and brings its schema up to
//! [`SCHEMA_VERSION`] without dropping rows written by older builds.
//!
//! ```no_run
//! use std::path::Path;
//! use kdsync_cache::{DatabasePool, SqliteStateRepository};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pool = DatabasePool::new(Path::new("/var/tmp/kdsync/state.db")).await?;
//! let repository = SqliteStateRepository::new(pool.pool().clone());
//! # let _ = repository;
//! # Ok(())
//! # }
//! ```

pub mod pool;
pub mod repository;

pub use pool::{DatabasePool, SCHEMA_VERSION};
pub use repository::SqliteStateRepository;

/// Store failures
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cannot open metadata store: {0}")]
    ConnectionFailed(String),

    #[error("Store query failed: {0}")]
    QueryFailed(String),

    /// A migration step failed; the transaction was rolled back
    #[error("Schema migration failed: {0}")]
    MigrationFailed(String),

    #[error("Cannot encode or decode stored value: {0}")]
    SerializationError(String),

    #[error("No such row: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::QueryFailed(e.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::SerializationError(e.to_string())
    }
}
