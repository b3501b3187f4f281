// SQLite persistence for prediction groups.
//
// Two logical collections keyed by group name: `active_groups` holds open
// groups as full JSON records, `finished_groups` holds the immutable record
// of every resolved group together with its scores.

use std::sync::{Mutex, MutexGuard};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::group::PredictionGroup;
use crate::scoring::Resolution;

/// A resolved group as kept in the finished collection.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedRecord {
    pub group: PredictionGroup,
    pub resolution: Resolution,
    pub resolved_at: DateTime<Utc>,
}

/// SQLite-backed key-value store for group records.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) a SQLite database at `path` and ensure both
    /// collections exist. Pass `":memory:"` for an ephemeral database.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS active_groups (
                name       TEXT PRIMARY KEY,
                record     TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS finished_groups (
                name        TEXT PRIMARY KEY,
                record      TEXT NOT NULL,
                resolution  TEXT NOT NULL,
                resolved_at TEXT NOT NULL
            );
            ",
        )
        .context("failed to create database schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the database connection.
    ///
    /// Panics if the mutex is poisoned (another thread panicked while
    /// holding the lock). This should never happen in normal operation.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    /// Write the full record of an open group, replacing any previous one.
    /// A single statement, so the row is either fully old or fully new.
    pub fn save(&self, group: &PredictionGroup) -> Result<()> {
        if group.is_resolved() {
            bail!("refusing to save resolved group `{}` as active", group.name());
        }
        let record = serde_json::to_string(group).context("failed to serialize group")?;
        let conn = self.conn();
        conn.execute(
            "INSERT OR REPLACE INTO active_groups (name, record, updated_at)
             VALUES (?1, ?2, ?3)",
            params![group.name(), record, Utc::now().to_rfc3339()],
        )
        .with_context(|| format!("failed to save group `{}`", group.name()))?;
        Ok(())
    }

    /// Load an active group by name. Returns `None` if there is none.
    pub fn load(&self, name: &str) -> Result<Option<PredictionGroup>> {
        let conn = self.conn();
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM active_groups WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to load group `{name}`"))?;

        record
            .map(|json| {
                serde_json::from_str(&json)
                    .with_context(|| format!("failed to deserialize group `{name}`"))
            })
            .transpose()
    }

    /// Remove an active group. Returns `true` if a row was deleted.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let conn = self.conn();
        let deleted = conn
            .execute("DELETE FROM active_groups WHERE name = ?1", params![name])
            .with_context(|| format!("failed to delete group `{name}`"))?;
        Ok(deleted > 0)
    }

    /// Names of all active groups, alphabetically.
    pub fn list_active(&self) -> Result<Vec<String>> {
        self.list_names("SELECT name FROM active_groups ORDER BY name")
    }

    /// Names of all finished groups, alphabetically.
    pub fn list_finished(&self) -> Result<Vec<String>> {
        self.list_names("SELECT name FROM finished_groups ORDER BY name")
    }

    fn list_names(&self, sql: &str) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql).context("failed to prepare list query")?;
        let names = stmt
            .query_map([], |row| row.get(0))
            .context("failed to list groups")?
            .collect::<std::result::Result<Vec<String>, _>>()
            .context("failed to map group rows")?;
        Ok(names)
    }

    /// Load every active group (used on startup).
    pub fn load_all_active(&self) -> Result<Vec<PredictionGroup>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT name, record FROM active_groups ORDER BY name")
            .context("failed to prepare load_all_active query")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .context("failed to query active groups")?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to map active group rows")?;

        rows.into_iter()
            .map(|(name, json)| {
                serde_json::from_str(&json)
                    .with_context(|| format!("failed to deserialize group `{name}`"))
            })
            .collect()
    }

    /// Whether a group with this name exists in either collection.
    pub fn exists(&self, name: &str) -> Result<bool> {
        let conn = self.conn();
        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM active_groups WHERE name = ?1)
                     OR EXISTS(SELECT 1 FROM finished_groups WHERE name = ?1)",
                params![name],
                |row| row.get(0),
            )
            .context("failed to check group existence")?;
        Ok(exists)
    }

    /// Relocate a resolved group from the active to the finished collection,
    /// in one transaction.
    pub fn move_to_finished(&self, group: &PredictionGroup, resolution: &Resolution) -> Result<()> {
        if !group.is_resolved() {
            bail!("group `{}` is not resolved", group.name());
        }
        let record = serde_json::to_string(group).context("failed to serialize group")?;
        let resolution_json =
            serde_json::to_string(resolution).context("failed to serialize resolution")?;

        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin transaction")?;
        tx.execute(
            "DELETE FROM active_groups WHERE name = ?1",
            params![group.name()],
        )
        .context("failed to remove active group")?;
        tx.execute(
            "INSERT INTO finished_groups (name, record, resolution, resolved_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                group.name(),
                record,
                resolution_json,
                Utc::now().to_rfc3339()
            ],
        )
        .with_context(|| format!("failed to archive group `{}`", group.name()))?;
        tx.commit().context("failed to commit move_to_finished")?;
        Ok(())
    }

    /// Load the historical record of a finished group.
    pub fn load_finished(&self, name: &str) -> Result<Option<FinishedRecord>> {
        let conn = self.conn();
        let row: Option<(String, String, String)> = conn
            .query_row(
                "SELECT record, resolution, resolved_at FROM finished_groups WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .with_context(|| format!("failed to load finished group `{name}`"))?;

        let Some((record, resolution, resolved_at)) = row else {
            return Ok(None);
        };
        Ok(Some(FinishedRecord {
            group: serde_json::from_str(&record).context("failed to deserialize finished group")?,
            resolution: serde_json::from_str(&resolution)
                .context("failed to deserialize resolution")?,
            resolved_at: DateTime::parse_from_rfc3339(&resolved_at)
                .context("failed to parse resolved_at")?
                .with_timezone(&Utc),
        }))
    }
}
