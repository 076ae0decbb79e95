//! SQLite pool and schema migrations
//!
//! Every migration runs in its own transaction and is recorded in
//! `schema_migrations`, so a store is upgraded one version at a time and a
//! failed step leaves the previous version intact.

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::CacheError;

/// A schema migration: version, name and SQL
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Migrations in application order. Versions are never reused.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial",
        sql: include_str!("migrations/001_initial.sql"),
    },
    Migration {
        version: 2,
        name: "blacklist_v2",
        sql: include_str!("migrations/002_blacklist_v2.sql"),
    },
];

/// Highest schema version this build knows about
pub const SCHEMA_VERSION: i64 = 2;

/// Connection pool over the metadata store
///
/// File stores use WAL with a 5 s busy timeout so the daemon and the CLI can
/// share one file. In-memory stores hold a single connection, since each
/// SQLite connection would otherwise see its own empty database.
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Opens (creating if needed) the store at `db_path` and migrates it
    pub async fn new(db_path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CacheError::ConnectionFailed(format!(
                    "cannot create {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| {
                CacheError::ConnectionFailed(format!(
                    "{}: {}",
                    db_path.display(),
                    e
                ))
            })?;

        let this = Self { pool };
        this.migrate().await?;

        tracing::info!(
            path = %db_path.display(),
            "Metadata store opened"
        );

        Ok(this)
    }

    /// Fully migrated in-memory store, used by tests
    pub async fn in_memory() -> Result<Self, CacheError> {
        let this = Self::in_memory_unmigrated().await?;
        this.migrate().await?;
        tracing::debug!("In-memory database pool initialized");
        Ok(this)
    }

    /// In-memory pool with no schema applied
    ///
    /// Lets upgrade tests apply migrations one version at a time.
    pub async fn in_memory_unmigrated() -> Result<Self, CacheError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| {
                CacheError::ConnectionFailed(format!("Failed to create in-memory database: {}", e))
            })?;

        sqlx::raw_sql("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .map_err(|e| {
                CacheError::MigrationFailed(format!("Failed to enable foreign keys: {}", e))
            })?;

        Ok(Self { pool })
    }

    /// Returns a reference to the underlying SQLite connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Applies every pending migration
    ///
    /// Returns the number of migrations applied.
    pub async fn migrate(&self) -> Result<usize, CacheError> {
        self.migrate_to(SCHEMA_VERSION).await
    }

    /// Applies pending migrations up to and including `target`
    pub async fn migrate_to(&self, target: i64) -> Result<usize, CacheError> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version     INTEGER PRIMARY KEY NOT NULL,
                name        TEXT NOT NULL,
                applied_at  TEXT NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            CacheError::MigrationFailed(format!("Failed to create schema_migrations: {}", e))
        })?;

        let current = self.schema_version().await?;
        let mut applied = 0;

        for migration in MIGRATIONS
            .iter()
            .filter(|m| m.version > current && m.version <= target)
        {
            // Each migration and its bookkeeping row commit together
            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(migration.sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    CacheError::MigrationFailed(format!(
                        "Migration {} ({}) failed: {}",
                        migration.version, migration.name, e
                    ))
                })?;
            sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)")
                .bind(migration.version)
                .bind(migration.name)
                .bind(chrono::Utc::now().to_rfc3339())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;

            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applied schema migration"
            );
            applied += 1;
        }

        tracing::debug!(applied, "Database migrations completed");
        Ok(applied)
    }

    /// Highest applied migration version, 0 for an empty database
    pub async fn schema_version(&self) -> Result<i64, CacheError> {
        let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
            .fetch_one(&self.pool)
            .await?;
        Ok(version.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_applies_all_migrations() {
        let db = DatabasePool::in_memory().await.unwrap();
        assert_eq!(db.schema_version().await.unwrap(), SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let db = DatabasePool::in_memory().await.unwrap();
        assert_eq!(db.migrate().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_file_database_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("kdsync.db");

        let db = DatabasePool::new(&path).await.unwrap();
        sqlx::query("INSERT INTO settings (key, value) VALUES ('k', 'v')")
            .execute(db.pool())
            .await
            .unwrap();
        db.pool().close().await;

        let reopened = DatabasePool::new(&path).await.unwrap();
        let value: String = sqlx::query_scalar("SELECT value FROM settings WHERE key = 'k'")
            .fetch_one(reopened.pool())
            .await
            .unwrap();
        assert_eq!(value, "v");
        assert_eq!(reopened.schema_version().await.unwrap(), SCHEMA_VERSION);
    }
}
