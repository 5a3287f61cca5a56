//! Durable mirror of the reconciled console state.
//!
//! Three independently-lifecycled records (workspace snapshots, active
//! filters, last cursor), so each can be invalidated on its own (a filter
//! change clears the cursor without touching the filter record, and so on).
//! Loads are corrupt-tolerant: a row that no longer deserializes is skipped,
//! never surfaced as an error, because cached data is a rendering hint, not
//! a source of truth.

use chrono::Utc;
use flightdeck_core::{ConsoleFilters, WorkspaceSnapshot};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use tracing::warn;

pub const CACHE_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

pub struct ConsoleCache {
    conn: Connection,
}

impl ConsoleCache {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let cache = Self { conn };
        cache.migrate()?;
        Ok(cache)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let cache = Self { conn };
        cache.migrate()?;
        Ok(cache)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > CACHE_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: CACHE_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_console_cache.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    /// Replace the cached snapshot set wholesale. One transaction so a crash
    /// mid-save never leaves a half-mixed generation behind.
    pub fn save_workspaces(&mut self, snapshots: &[WorkspaceSnapshot]) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM cached_workspaces", [])?;
        for snapshot in snapshots {
            let snapshot_json = serde_json::to_string(snapshot)
                .map_err(|err| StorageError::Serialization(err.to_string()))?;
            tx.execute(
                "
                INSERT INTO cached_workspaces (workspace_id, snapshot_json, sort_updated_at, version)
                VALUES (?1, ?2, ?3, ?4)
                ",
                params![
                    snapshot.workspace.id,
                    snapshot_json,
                    snapshot.workspace.updated_at.to_rfc3339(),
                    snapshot.workspace.version,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Load cached snapshots in display order. Rows that fail to parse are
    /// skipped with a warning; the next revalidation replaces them anyway.
    pub fn load_workspaces(&self) -> Result<Vec<WorkspaceSnapshot>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT workspace_id, snapshot_json
            FROM cached_workspaces
            ORDER BY sort_updated_at DESC, workspace_id DESC
            ",
        )?;

        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut snapshots = Vec::new();
        for row in rows {
            let (workspace_id, snapshot_json) = row?;
            match serde_json::from_str::<WorkspaceSnapshot>(&snapshot_json) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(err) => {
                    warn!(workspace_id, error = %err, "skipping corrupt cached workspace");
                }
            }
        }
        Ok(snapshots)
    }

    pub fn save_filters(&self, filters: &ConsoleFilters) -> Result<(), StorageError> {
        let filters_json = serde_json::to_string(filters)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        self.conn.execute(
            "
            INSERT INTO console_filters (slot, filters_json, saved_at)
            VALUES (0, ?1, ?2)
            ON CONFLICT(slot) DO UPDATE SET
                filters_json=excluded.filters_json,
                saved_at=excluded.saved_at
            ",
            params![filters_json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn load_filters(&self) -> Result<Option<ConsoleFilters>, StorageError> {
        let filters_json: Option<String> = self
            .conn
            .query_row(
                "SELECT filters_json FROM console_filters WHERE slot = 0",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let Some(filters_json) = filters_json else {
            return Ok(None);
        };

        match serde_json::from_str(&filters_json) {
            Ok(filters) => Ok(Some(filters)),
            Err(err) => {
                warn!(error = %err, "discarding corrupt cached filters");
                Ok(None)
            }
        }
    }

    pub fn save_cursor(&self, cursor: Option<i64>) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO console_cursor (slot, cursor, saved_at)
            VALUES (0, ?1, ?2)
            ON CONFLICT(slot) DO UPDATE SET
                cursor=excluded.cursor,
                saved_at=excluded.saved_at
            ",
            params![cursor, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn load_cursor(&self) -> Result<Option<i64>, StorageError> {
        let cursor: Option<Option<i64>> = self
            .conn
            .query_row(
                "SELECT cursor FROM console_cursor WHERE slot = 0",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cursor.flatten())
    }
}
