//! SQLite implementation of IStateRepository
//!
//! This module provides the concrete SQLite-based implementation of the
//! state repository port defined in kdsync-core. It handles all domain
//! type serialization/deserialization and SQL query construction.
//!
//! ## Type Mapping
//!
//! | Domain Type                      | SQL Type | Strategy                                  |
//! |----------------------------------|----------|-------------------------------------------|
//! | UniqueId, SessionId, ConflictId  | TEXT     | UUID string via `.to_string()` / `FromStr` |
//! | RelativePath, RemoteId           | TEXT     | String via `.as_str()` / `new()`          |
//! | SyncPath                         | TEXT     | Path string via `.to_string()` / `SyncPath::new()` |
//! | DateTime<Utc>                    | TEXT     | ISO 8601 via `to_rfc3339()`               |
//! | SyncState, PlaceholderState, ... | TEXT     | `as_str()` / `FromStr`                    |
//! | Fingerprint                      | TEXT     | serde_json serialization                  |
//! | SyncEvent                        | TEXT     | serde_json serialization                  |
//!
//! ## Ownership of columns
//!
//! `placeholder_state` is written on insert and through
//! `set_placeholder_state` only. The blacklist table is kept in step with the
//! item's `state` column inside the same transaction by every write path.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use kdsync_core::domain::{
    newtypes::{
        ChangeCursor, ConflictId, RelativePath, RemoteId, RemotePath, SessionId, SyncPath,
        UniqueId,
    },
    BlacklistEntry, ConflictRecord, Fingerprint, PlaceholderState, SessionStatus, SyncEvent,
    SyncItem, SyncSession, SyncState,
};
use kdsync_core::ports::{ActivityRecord, IStateRepository, ItemFilter};

use crate::CacheError;

/// SQLite-based implementation of the state repository port
///
/// Provides persistent storage for all domain entities using SQLite.
/// All operations are performed through a connection pool for concurrency.
#[derive(Clone)]
pub struct SqliteStateRepository {
    pool: SqlitePool,
}

impl SqliteStateRepository {
    /// Creates a new repository instance with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// Item columns joined with the blacklist entry, if any
const ITEM_SELECT: &str = "SELECT i.*, \
     b.path AS bl_path, b.reason AS bl_reason, b.scope AS bl_scope, \
     b.first_seen AS bl_first_seen, b.retry_at AS bl_retry_at, b.attempts AS bl_attempts \
     FROM sync_items i LEFT JOIN blacklist_entries b ON b.item_id = i.id";

// ============================================================================
// Helper functions for type conversion
// ============================================================================

/// Parse a stored string through `FromStr`, naming the type on failure
fn parse_column<T>(value: &str, what: &str) -> Result<T, CacheError>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .parse::<T>()
        .map_err(|e| CacheError::SerializationError(format!("Invalid {what} '{value}': {e}")))
}

fn relative_path(value: String) -> Result<RelativePath, CacheError> {
    RelativePath::new(value.clone()).map_err(|e| {
        CacheError::SerializationError(format!("Invalid RelativePath '{value}': {e}"))
    })
}

/// Parse a DateTime<Utc> from an ISO 8601 string
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, CacheError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // SQLite's own datetime() format
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .or_else(|_| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
                .map(|ndt| ndt.and_utc())
        })
        .map_err(|e| {
            CacheError::SerializationError(format!("Failed to parse datetime '{}': {}", s, e))
        })
}

/// Parse an optional DateTime<Utc> from an optional string
fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, CacheError> {
    match s {
        Some(ref val) if !val.is_empty() => parse_datetime(val).map(Some),
        _ => Ok(None),
    }
}

fn fingerprint_to_json(fp: Option<&Fingerprint>) -> Result<Option<String>, CacheError> {
    fp.map(serde_json::to_string).transpose().map_err(Into::into)
}

fn fingerprint_from_json(s: Option<String>) -> Result<Option<Fingerprint>, CacheError> {
    match s {
        Some(ref val) if !val.is_empty() => Ok(Some(serde_json::from_str(val)?)),
        _ => Ok(None),
    }
}

/// Escape `%`, `_` and the escape character for a LIKE pattern
fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// ============================================================================
// Row mapping functions
// ============================================================================

fn blacklist_entry_from_row(
    row: &SqliteRow,
    prefix: &str,
    item_id: UniqueId,
    session_id: SessionId,
) -> Result<Option<BlacklistEntry>, CacheError> {
    let reason: Option<String> = row.try_get(format!("{prefix}reason").as_str())?;
    let Some(reason) = reason else {
        return Ok(None);
    };
    let path: String = row.try_get(format!("{prefix}path").as_str())?;
    let scope: String = row.try_get(format!("{prefix}scope").as_str())?;
    let first_seen: String = row.try_get(format!("{prefix}first_seen").as_str())?;
    let retry_at: Option<String> = row.try_get(format!("{prefix}retry_at").as_str())?;
    let attempts: i64 = row.try_get(format!("{prefix}attempts").as_str())?;

    Ok(Some(BlacklistEntry::restore(
        item_id,
        session_id,
        relative_path(path)?,
        parse_column(&reason, "BlacklistReason")?,
        parse_column(&scope, "BlacklistScope")?,
        parse_datetime(&first_seen)?,
        parse_optional_datetime(retry_at)?,
        u32::try_from(attempts).unwrap_or(u32::MAX),
    )))
}

/// Reconstruct a SyncItem from a row of [`ITEM_SELECT`]
fn sync_item_from_row(row: &SqliteRow) -> Result<SyncItem, CacheError> {
    let id_str: String = row.try_get("id")?;
    let session_id_str: String = row.try_get("session_id")?;
    let remote_id_str: Option<String> = row.try_get("remote_id")?;
    let kind_str: String = row.try_get("kind")?;
    let local_path_str: String = row.try_get("local_path")?;
    let remote_path_str: String = row.try_get("remote_path")?;
    let local_fp: Option<String> = row.try_get("local_fingerprint")?;
    let remote_fp: Option<String> = row.try_get("remote_fingerprint")?;
    let synced_fp: Option<String> = row.try_get("synced_fingerprint")?;
    let local_node_id: Option<i64> = row.try_get("local_node_id")?;
    let remote_deleted: bool = row.try_get("remote_deleted")?;
    let read_only: bool = row.try_get("read_only")?;
    let state_str: String = row.try_get("state")?;
    let placeholder_str: String = row.try_get("placeholder_state")?;
    let error_count: i64 = row.try_get("error_count")?;
    let last_synced_at: Option<String> = row.try_get("last_synced_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    let id: UniqueId = parse_column(&id_str, "UniqueId")?;
    let session_id: SessionId = parse_column(&session_id_str, "SessionId")?;
    let remote_id = remote_id_str
        .map(|r| {
            RemoteId::new(r.clone()).map_err(|e| {
                CacheError::SerializationError(format!("Invalid RemoteId '{r}': {e}"))
            })
        })
        .transpose()?;
    let blacklist = blacklist_entry_from_row(row, "bl_", id, session_id)?;

    Ok(SyncItem::restore(
        id,
        session_id,
        remote_id,
        parse_column(&kind_str, "ItemKind")?,
        relative_path(local_path_str)?,
        relative_path(remote_path_str)?,
        fingerprint_from_json(local_fp)?,
        fingerprint_from_json(remote_fp)?,
        fingerprint_from_json(synced_fp)?,
        local_node_id.map(|n| n as u64),
        remote_deleted,
        read_only,
        parse_column::<SyncState>(&state_str, "SyncState")?,
        parse_column::<PlaceholderState>(&placeholder_str, "PlaceholderState")?,
        blacklist,
        u32::try_from(error_count).unwrap_or(u32::MAX),
        parse_optional_datetime(last_synced_at)?,
        parse_datetime(&updated_at)?,
    ))
}

/// Reconstruct a SyncSession from a database row
fn session_updated(id: &SessionId, rows: u64) -> anyhow::Result<()> {
    if rows == 0 {
        return Err(CacheError::NotFound(format!("session {id}")).into());
    }
    Ok(())
}

fn session_from_row(row: &SqliteRow) -> Result<SyncSession, CacheError> {
    let id_str: String = row.try_get("id")?;
    let name: String = row.try_get("name")?;
    let local_root_str: String = row.try_get("local_root")?;
    let remote_root_str: String = row.try_get("remote_root")?;
    let status_str: String = row.try_get("status")?;
    let status_detail: Option<String> = row.try_get("status_detail")?;
    let lite_sync: bool = row.try_get("lite_sync")?;
    let cursor_str: Option<String> = row.try_get("cursor")?;
    let created_at: String = row.try_get("created_at")?;
    let last_cycle_at: Option<String> = row.try_get("last_cycle_at")?;

    let local_root = SyncPath::new(PathBuf::from(&local_root_str)).map_err(|e| {
        CacheError::SerializationError(format!("Invalid SyncPath '{}': {}", local_root_str, e))
    })?;
    let remote_root = RemotePath::new(remote_root_str.clone()).map_err(|e| {
        CacheError::SerializationError(format!("Invalid RemotePath '{}': {}", remote_root_str, e))
    })?;
    let cursor = match cursor_str {
        Some(c) if !c.is_empty() => Some(ChangeCursor::new(c.clone()).map_err(|e| {
            CacheError::SerializationError(format!("Invalid ChangeCursor '{}': {}", c, e))
        })?),
        _ => None,
    };

    Ok(SyncSession::restore(
        parse_column(&id_str, "SessionId")?,
        name,
        local_root,
        remote_root,
        parse_column(&status_str, "SessionStatus")?,
        lite_sync,
        cursor,
        status_detail,
        parse_datetime(&created_at)?,
        parse_optional_datetime(last_cycle_at)?,
    ))
}

/// Reconstruct a ConflictRecord from a database row
fn conflict_from_row(row: &SqliteRow) -> Result<ConflictRecord, CacheError> {
    let id_str: String = row.try_get("id")?;
    let session_id_str: String = row.try_get("session_id")?;
    let item_id_str: String = row.try_get("item_id")?;
    let path: String = row.try_get("path")?;
    let kind: String = row.try_get("kind")?;
    let local_fp: Option<String> = row.try_get("local_fingerprint")?;
    let remote_fp: Option<String> = row.try_get("remote_fingerprint")?;
    let policy: String = row.try_get("policy")?;
    let copy_path: Option<String> = row.try_get("copy_path")?;
    let detected_at: String = row.try_get("detected_at")?;
    let resolved_at: Option<String> = row.try_get("resolved_at")?;

    Ok(ConflictRecord::restore(
        parse_column::<ConflictId>(&id_str, "ConflictId")?,
        parse_column(&session_id_str, "SessionId")?,
        parse_column(&item_id_str, "UniqueId")?,
        relative_path(path)?,
        parse_column(&kind, "ConflictKind")?,
        fingerprint_from_json(local_fp)?,
        fingerprint_from_json(remote_fp)?,
        parse_column(&policy, "ConflictPolicy")?,
        copy_path.map(relative_path).transpose()?,
        parse_datetime(&detected_at)?,
        parse_optional_datetime(resolved_at)?,
    ))
}

fn blacklist_standalone_from_row(row: &SqliteRow) -> Result<BlacklistEntry, CacheError> {
    let item_id: String = row.try_get("item_id")?;
    let session_id: String = row.try_get("session_id")?;
    blacklist_entry_from_row(
        row,
        "",
        parse_column(&item_id, "UniqueId")?,
        parse_column(&session_id, "SessionId")?,
    )?
    .ok_or_else(|| CacheError::SerializationError("Blacklist row without reason".into()))
}

// ============================================================================
// Transaction helpers
// ============================================================================

async fn upsert_item(tx: &mut Transaction<'_, Sqlite>, item: &SyncItem) -> Result<(), CacheError> {
    let id = item.id().to_string();

    sqlx::query(
        "INSERT INTO sync_items \
         (id, session_id, remote_id, kind, local_path, remote_path, \
          local_fingerprint, remote_fingerprint, synced_fingerprint, local_node_id, \
          remote_deleted, read_only, state, placeholder_state, error_count, \
          last_synced_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET \
          session_id = excluded.session_id, \
          remote_id = excluded.remote_id, \
          kind = excluded.kind, \
          local_path = excluded.local_path, \
          remote_path = excluded.remote_path, \
          local_fingerprint = excluded.local_fingerprint, \
          remote_fingerprint = excluded.remote_fingerprint, \
          synced_fingerprint = excluded.synced_fingerprint, \
          local_node_id = excluded.local_node_id, \
          remote_deleted = excluded.remote_deleted, \
          read_only = excluded.read_only, \
          state = excluded.state, \
          error_count = excluded.error_count, \
          last_synced_at = excluded.last_synced_at, \
          updated_at = excluded.updated_at",
    )
    .bind(&id)
    .bind(item.session_id().to_string())
    .bind(item.remote_id().map(|r| r.as_str().to_string()))
    .bind(item.kind().as_str())
    .bind(item.local_path().as_str())
    .bind(item.remote_path().as_str())
    .bind(fingerprint_to_json(item.local_fingerprint())?)
    .bind(fingerprint_to_json(item.remote_fingerprint())?)
    .bind(fingerprint_to_json(item.synced_fingerprint())?)
    .bind(item.local_node_id().map(|n| n as i64))
    .bind(item.remote_deleted())
    .bind(item.read_only())
    .bind(item.state().as_str())
    .bind(item.placeholder().as_str())
    .bind(i64::from(item.error_count()))
    .bind(item.last_synced_at().map(|dt| dt.to_rfc3339()))
    .bind(item.updated_at().to_rfc3339())
    .execute(&mut **tx)
    .await?;

    // Keep the blacklist table in step with the state column
    match (item.state(), item.blacklist()) {
        (SyncState::Blacklisted(_), Some(entry)) => upsert_blacklist_entry(tx, entry).await?,
        (SyncState::Blacklisted(_), None) => {}
        _ => {
            sqlx::query("DELETE FROM blacklist_entries WHERE item_id = ?")
                .bind(&id)
                .execute(&mut **tx)
                .await?;
        }
    }

    Ok(())
}

async fn upsert_blacklist_entry(
    tx: &mut Transaction<'_, Sqlite>,
    entry: &BlacklistEntry,
) -> Result<(), CacheError> {
    sqlx::query(
        "INSERT OR REPLACE INTO blacklist_entries \
         (item_id, session_id, path, reason, scope, first_seen, retry_at, attempts) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(entry.item_id().to_string())
    .bind(entry.session_id().to_string())
    .bind(entry.path().as_str())
    .bind(entry.reason().as_str())
    .bind(entry.scope().as_str())
    .bind(entry.first_seen().to_rfc3339())
    .bind(entry.retry_at().map(|dt| dt.to_rfc3339()))
    .bind(i64::from(entry.attempts()))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// ============================================================================
// IStateRepository implementation
// ============================================================================

#[async_trait::async_trait]
impl IStateRepository for SqliteStateRepository {
    // --- Sessions ---

    async fn save_session(&self, session: &SyncSession) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO sessions \
             (id, name, local_root, remote_root, status, status_detail, lite_sync, \
              cursor, created_at, last_cycle_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
              name = excluded.name, \
              local_root = excluded.local_root, \
              remote_root = excluded.remote_root, \
              status = excluded.status, \
              status_detail = excluded.status_detail, \
              lite_sync = excluded.lite_sync, \
              cursor = excluded.cursor, \
              last_cycle_at = excluded.last_cycle_at",
        )
        .bind(session.id().to_string())
        .bind(session.name())
        .bind(session.local_root().to_string())
        .bind(session.remote_root().as_str())
        .bind(session.status().as_str())
        .bind(session.status_detail())
        .bind(session.lite_sync())
        .bind(session.cursor().map(|c| c.as_str().to_string()))
        .bind(session.created_at().to_rfc3339())
        .bind(session.last_cycle_at().map(|dt| dt.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        tracing::trace!(session_id = %session.id(), "Saved session");
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> anyhow::Result<Option<SyncSession>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(session_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn list_sessions(&self) -> anyhow::Result<Vec<SyncSession>> {
        let rows = sqlx::query("SELECT * FROM sessions ORDER BY created_at ASC, rowid ASC")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|r| session_from_row(r).map_err(Into::into))
            .collect()
    }

    async fn set_session_cursor(
        &self,
        id: &SessionId,
        cursor: Option<&ChangeCursor>,
    ) -> anyhow::Result<()> {
        let result = sqlx::query("UPDATE sessions SET cursor = ? WHERE id = ?")
            .bind(cursor.map(|c| c.as_str().to_string()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        session_updated(id, result.rows_affected())
    }

    async fn set_session_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
        detail: Option<&str>,
    ) -> anyhow::Result<()> {
        let result =
            sqlx::query("UPDATE sessions SET status = ?, status_detail = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(detail)
                .bind(id.to_string())
                .execute(&self.pool)
                .await?;
        session_updated(id, result.rows_affected())
    }

    async fn set_session_lite_sync(&self, id: &SessionId, enabled: bool) -> anyhow::Result<()> {
        let result = sqlx::query("UPDATE sessions SET lite_sync = ? WHERE id = ?")
            .bind(enabled)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        session_updated(id, result.rows_affected())
    }

    async fn record_session_cycle(&self, id: &SessionId, at: DateTime<Utc>) -> anyhow::Result<()> {
        let result = sqlx::query("UPDATE sessions SET last_cycle_at = ? WHERE id = ?")
            .bind(at.to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        session_updated(id, result.rows_affected())
    }

    async fn delete_session(&self, id: &SessionId) -> anyhow::Result<()> {
        let id_str = id.to_string();
        let mut tx = self.pool.begin().await?;

        for table in [
            "hydration_queue",
            "blacklist_entries",
            "conflicts",
            "sync_items",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE session_id = ?"))
                .bind(&id_str)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(&id_str)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::debug!(session_id = %id, "Deleted session rows");
        Ok(())
    }

    // --- Items ---

    async fn save_item(&self, item: &SyncItem) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        upsert_item(&mut tx, item).await?;
        tx.commit().await?;

        tracing::trace!(item_id = %item.id(), "Saved sync item");
        Ok(())
    }

    async fn save_items(&self, items: &[SyncItem]) -> anyhow::Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for item in items {
            upsert_item(&mut tx, item).await?;
        }
        tx.commit().await?;

        tracing::trace!(count = items.len(), "Saved sync items");
        Ok(())
    }

    async fn get_item(&self, id: &UniqueId) -> anyhow::Result<Option<SyncItem>> {
        let row = sqlx::query(&format!("{ITEM_SELECT} WHERE i.id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(sync_item_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn get_item_by_path(
        &self,
        session_id: &SessionId,
        path: &RelativePath,
    ) -> anyhow::Result<Option<SyncItem>> {
        let row = sqlx::query(&format!(
            "{ITEM_SELECT} WHERE i.session_id = ? AND i.local_path = ? \
             ORDER BY i.updated_at DESC LIMIT 1"
        ))
        .bind(session_id.to_string())
        .bind(path.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(sync_item_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn get_item_by_remote_id(
        &self,
        session_id: &SessionId,
        remote_id: &RemoteId,
    ) -> anyhow::Result<Option<SyncItem>> {
        let row = sqlx::query(&format!(
            "{ITEM_SELECT} WHERE i.session_id = ? AND i.remote_id = ? LIMIT 1"
        ))
        .bind(session_id.to_string())
        .bind(remote_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(sync_item_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn query_items(&self, filter: &ItemFilter) -> anyhow::Result<Vec<SyncItem>> {
        let mut sql = format!("{ITEM_SELECT} WHERE 1=1");
        let mut binds: Vec<String> = Vec::new();

        if let Some(ref session_id) = filter.session_id {
            sql.push_str(" AND i.session_id = ?");
            binds.push(session_id.to_string());
        }

        if let Some(ref state) = filter.state {
            sql.push_str(" AND i.state = ?");
            binds.push(state.as_str().to_string());
        }

        if let Some(ref placeholder) = filter.placeholder {
            sql.push_str(" AND i.placeholder_state = ?");
            binds.push(placeholder.as_str().to_string());
        }

        if let Some(ref prefix) = filter.path_prefix {
            if !prefix.is_root() {
                sql.push_str(" AND (i.local_path = ? OR i.local_path LIKE ? ESCAPE '\\')");
                binds.push(prefix.as_str().to_string());
                binds.push(format!("{}/%", escape_like(prefix.as_str())));
            }
        }

        if let Some(ref modified_since) = filter.modified_since {
            sql.push_str(" AND i.updated_at > ?");
            binds.push(modified_since.to_rfc3339());
        }

        sql.push_str(" ORDER BY i.local_path ASC");

        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| sync_item_from_row(r).map_err(Into::into))
            .collect()
    }

    async fn delete_item(&self, id: &UniqueId) -> anyhow::Result<()> {
        let id_str = id.to_string();
        let mut tx = self.pool.begin().await?;

        for sql in [
            "DELETE FROM blacklist_entries WHERE item_id = ?",
            "DELETE FROM hydration_queue WHERE item_id = ?",
            "DELETE FROM sync_items WHERE id = ?",
        ] {
            sqlx::query(sql).bind(&id_str).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        tracing::trace!(item_id = %id, "Deleted sync item");
        Ok(())
    }

    async fn set_placeholder_state(
        &self,
        id: &UniqueId,
        state: PlaceholderState,
    ) -> anyhow::Result<()> {
        let result = sqlx::query(
            "UPDATE sync_items SET placeholder_state = ?, updated_at = ? WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CacheError::NotFound(format!("sync item {id}")).into());
        }
        Ok(())
    }

    // --- Blacklist ---

    async fn admit_to_blacklist(&self, entry: &BlacklistEntry) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("UPDATE sync_items SET state = ?, updated_at = ? WHERE id = ?")
            .bind(SyncState::Blacklisted(entry.scope()).as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(entry.item_id().to_string())
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CacheError::NotFound(format!("sync item {}", entry.item_id())).into());
        }
        upsert_blacklist_entry(&mut tx, entry).await?;

        tx.commit().await?;
        tracing::debug!(
            item_id = %entry.item_id(),
            reason = %entry.reason(),
            scope = %entry.scope(),
            "Item admitted to blacklist"
        );
        Ok(())
    }

    async fn release_from_blacklist(&self, item_id: &UniqueId) -> anyhow::Result<bool> {
        let id_str = item_id.to_string();
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query("DELETE FROM blacklist_entries WHERE item_id = ?")
            .bind(&id_str)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if removed == 0 {
            return Ok(false);
        }

        sqlx::query("UPDATE sync_items SET state = ?, updated_at = ? WHERE id = ?")
            .bind(SyncState::Unsynced.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(&id_str)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::debug!(item_id = %item_id, "Item released from blacklist");
        Ok(true)
    }

    async fn get_blacklist_entry(
        &self,
        item_id: &UniqueId,
    ) -> anyhow::Result<Option<BlacklistEntry>> {
        let row = sqlx::query("SELECT * FROM blacklist_entries WHERE item_id = ?")
            .bind(item_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(blacklist_standalone_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn list_blacklist(
        &self,
        session_id: Option<&SessionId>,
    ) -> anyhow::Result<Vec<BlacklistEntry>> {
        let rows = match session_id {
            Some(sid) => {
                sqlx::query(
                    "SELECT * FROM blacklist_entries WHERE session_id = ? \
                     ORDER BY first_seen ASC, path ASC",
                )
                .bind(sid.to_string())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM blacklist_entries ORDER BY first_seen ASC, path ASC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter()
            .map(|r| blacklist_standalone_from_row(r).map_err(Into::into))
            .collect()
    }

    // --- Conflicts ---

    async fn save_conflict(&self, conflict: &ConflictRecord) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO conflicts \
             (id, session_id, item_id, path, kind, local_fingerprint, remote_fingerprint, \
              policy, copy_path, detected_at, resolved_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(conflict.id().to_string())
        .bind(conflict.session_id().to_string())
        .bind(conflict.item_id().to_string())
        .bind(conflict.path().as_str())
        .bind(conflict.kind().as_str())
        .bind(fingerprint_to_json(conflict.local())?)
        .bind(fingerprint_to_json(conflict.remote())?)
        .bind(conflict.policy().as_str())
        .bind(conflict.copy_path().map(|p| p.as_str().to_string()))
        .bind(conflict.detected_at().to_rfc3339())
        .bind(conflict.resolved_at().map(|dt| dt.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        tracing::trace!(conflict_id = %conflict.id(), "Saved conflict");
        Ok(())
    }

    async fn get_conflict(&self, id: &ConflictId) -> anyhow::Result<Option<ConflictRecord>> {
        let row = sqlx::query("SELECT * FROM conflicts WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(conflict_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn list_conflicts(
        &self,
        session_id: Option<&SessionId>,
        unresolved_only: bool,
    ) -> anyhow::Result<Vec<ConflictRecord>> {
        let mut sql = String::from("SELECT * FROM conflicts WHERE 1=1");
        if session_id.is_some() {
            sql.push_str(" AND session_id = ?");
        }
        if unresolved_only {
            sql.push_str(" AND resolved_at IS NULL");
        }
        sql.push_str(" ORDER BY detected_at DESC, rowid DESC");

        let mut query = sqlx::query(&sql);
        if let Some(sid) = session_id {
            query = query.bind(sid.to_string());
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| conflict_from_row(r).map_err(Into::into))
            .collect()
    }

    async fn open_conflict_for_item(
        &self,
        item_id: &UniqueId,
    ) -> anyhow::Result<Option<ConflictRecord>> {
        let row = sqlx::query(
            "SELECT * FROM conflicts WHERE item_id = ? AND resolved_at IS NULL \
             ORDER BY detected_at DESC, rowid DESC LIMIT 1",
        )
        .bind(item_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(conflict_from_row(r)?)),
            None => Ok(None),
        }
    }

    // --- Bulk hydration queue ---

    async fn enqueue_hydration(
        &self,
        session_id: &SessionId,
        item_ids: &[UniqueId],
    ) -> anyhow::Result<usize> {
        let now = Utc::now().to_rfc3339();
        let sid = session_id.to_string();
        let mut tx = self.pool.begin().await?;
        let mut added = 0usize;

        for item_id in item_ids {
            added += sqlx::query(
                "INSERT OR IGNORE INTO hydration_queue (item_id, session_id, enqueued_at) \
                 VALUES (?, ?, ?)",
            )
            .bind(item_id.to_string())
            .bind(&sid)
            .bind(&now)
            .execute(&mut *tx)
            .await?
            .rows_affected() as usize;
        }

        tx.commit().await?;
        tracing::debug!(session_id = %session_id, added, "Queued items for hydration");
        Ok(added)
    }

    async fn pending_hydrations(&self, session_id: &SessionId) -> anyhow::Result<Vec<UniqueId>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT item_id FROM hydration_queue WHERE session_id = ? ORDER BY position ASC",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        ids.iter()
            .map(|s| parse_column::<UniqueId>(s, "UniqueId").map_err(Into::into))
            .collect()
    }

    async fn complete_hydration(&self, item_id: &UniqueId) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM hydration_queue WHERE item_id = ?")
            .bind(item_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Activity log ---

    async fn record_activity(&self, event: &SyncEvent) -> anyhow::Result<()> {
        let payload = serde_json::to_string(event)
            .map_err(|e| anyhow::anyhow!("Failed to serialize event: {}", e))?;

        sqlx::query(
            "INSERT INTO activity_log (session_id, event, payload, recorded_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(event.session_id().to_string())
        .bind(event.name())
        .bind(&payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_activity(
        &self,
        session_id: Option<&SessionId>,
        limit: u32,
    ) -> anyhow::Result<Vec<ActivityRecord>> {
        let rows = match session_id {
            Some(sid) => {
                sqlx::query(
                    "SELECT payload, recorded_at FROM activity_log WHERE session_id = ? \
                     ORDER BY id DESC LIMIT ?",
                )
                .bind(sid.to_string())
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT payload, recorded_at FROM activity_log ORDER BY id DESC LIMIT ?",
                )
                .bind(i64::from(limit))
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter()
            .map(|row| -> anyhow::Result<ActivityRecord> {
                let payload: String = row.try_get("payload")?;
                let recorded_at: String = row.try_get("recorded_at")?;
                Ok(ActivityRecord {
                    recorded_at: parse_datetime(&recorded_at)?,
                    event: serde_json::from_str(&payload)?,
                })
            })
            .collect()
    }

    // --- Settings ---

    async fn get_setting(&self, key: &str) -> anyhow::Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set_setting(&self, key: &str, value: &str) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("a_b%c\\d"), "a\\_b\\%c\\\\d");
        assert_eq!(escape_like("plain/dir"), "plain/dir");
    }

    #[test]
    fn test_parse_datetime_formats() {
        assert!(parse_datetime("2026-01-15T10:30:00+00:00").is_ok());
        assert!(parse_datetime("2026-01-15 10:30:00").is_ok());
        assert!(parse_datetime("yesterday").is_err());
        assert_eq!(parse_optional_datetime(Some(String::new())).unwrap(), None);
    }
}
