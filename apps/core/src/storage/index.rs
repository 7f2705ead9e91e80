//! SQLite index of content directories and their pipeline status.
//!
//! The index is a cache; the markers on disk are the source of truth. Every
//! call opens its own connection and keeps the lock only for that call, so
//! writers on different names never wait on each other for longer than one
//! statement.

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::status::Status;

/// Lets concurrent writers wait for the database lock instead of failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Text format of `creation_date` in the table and in JSON output.
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One cached content directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub name: String,
    pub status: Status,
    #[serde(rename = "date", with = "date_format")]
    pub creation_date: NaiveDateTime,
}

impl DirectoryRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let date: String = row.get(2)?;
        let creation_date = NaiveDateTime::parse_from_str(&date, DATE_FORMAT)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
        Ok(Self {
            name: row.get(0)?,
            status: row.get(1)?,
            creation_date,
        })
    }
}

mod date_format {
    use super::DATE_FORMAT;
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(date: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&date.format(DATE_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, DATE_FORMAT).map_err(serde::de::Error::custom)
    }
}

/// Result of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Status differed and was rewritten.
    Updated,
    Unchanged,
}

/// Result of a status-only update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    Unchanged,
    /// No record for that name (e.g. already reaped by the reconciler).
    Missing,
}

/// Persistent `(name, status, creation_date)` table, unique on name.
#[derive(Debug)]
pub struct IndexStore {
    db_path: PathBuf,
    fresh: bool,
}

impl IndexStore {
    /// Open or create the index database.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Cannot create index directory: {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Cannot open index database: {}", db_path.display()))?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
        ",
        )?;

        let existed: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'directories')",
            [],
            |row| row.get(0),
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS directories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                creation_date TEXT NOT NULL
            )",
            [],
        )?;

        if !existed {
            info!("[IndexStore] Created directories table in {}", db_path.display());
        }

        Ok(Self {
            db_path: db_path.to_path_buf(),
            fresh: !existed,
        })
    }

    /// Whether `open` had to create the table (nothing was cached before).
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path).with_context(|| {
            format!("Cannot open index database: {}", self.db_path.display())
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Insert `name` if absent; otherwise rewrite its status when it differs.
    ///
    /// `creation_date` is only written on insert.
    pub fn upsert(
        &self,
        name: &str,
        status: Status,
        creation_date: NaiveDateTime,
    ) -> Result<UpsertOutcome> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<Status> = tx
            .query_row(
                "SELECT status FROM directories WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = match existing {
            Some(current) if current == status => UpsertOutcome::Unchanged,
            Some(current) => {
                tx.execute(
                    "UPDATE directories SET status = ?2 WHERE name = ?1",
                    params![name, status],
                )?;
                debug!(
                    "[IndexStore] Updating {}: {} -> {}",
                    name, current, status
                );
                UpsertOutcome::Updated
            }
            None => {
                tx.execute(
                    "INSERT INTO directories (name, status, creation_date) VALUES (?1, ?2, ?3)",
                    params![name, status, creation_date.format(DATE_FORMAT).to_string()],
                )?;
                debug!(
                    "[IndexStore] Inserting {}: {} ({})",
                    name,
                    status,
                    creation_date.format(DATE_FORMAT)
                );
                UpsertOutcome::Inserted
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// Update the status of an existing record. Never inserts.
    pub fn update_status(&self, name: &str, status: Status) -> Result<UpdateOutcome> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<Status> = tx
            .query_row(
                "SELECT status FROM directories WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;

        let outcome = match existing {
            None => {
                debug!("[IndexStore] {} not in index, ignoring status {}", name, status);
                UpdateOutcome::Missing
            }
            Some(current) if current == status => UpdateOutcome::Unchanged,
            Some(current) => {
                tx.execute(
                    "UPDATE directories SET status = ?2 WHERE name = ?1",
                    params![name, status],
                )?;
                debug!(
                    "[IndexStore] Updating {}: {} -> {}",
                    name, current, status
                );
                UpdateOutcome::Updated
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// Remove the record for `name`. Returns false when there was none.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let conn = self.connect()?;
        let affected = conn.execute("DELETE FROM directories WHERE name = ?1", params![name])?;
        Ok(affected > 0)
    }

    /// Get a single record.
    pub fn get(&self, name: &str) -> Result<Option<DirectoryRecord>> {
        let conn = self.connect()?;
        let record = conn
            .query_row(
                "SELECT name, status, creation_date FROM directories WHERE name = ?1",
                params![name],
                DirectoryRecord::from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Every record, in insertion order. Sorting for display is up to the caller.
    pub fn list_all(&self) -> Result<Vec<DirectoryRecord>> {
        let conn = self.connect()?;
        let mut stmt =
            conn.prepare("SELECT name, status, creation_date FROM directories ORDER BY id")?;

        let rows = stmt.query_map([], DirectoryRecord::from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }

        Ok(records)
    }

    /// All cached names.
    pub fn names(&self) -> Result<BTreeSet<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare("SELECT name FROM directories")?;

        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut names = BTreeSet::new();
        for row in rows {
            names.insert(row?);
        }

        Ok(names)
    }

    /// Count cached records.
    pub fn count(&self) -> Result<usize> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM directories", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// JSON shape served to the web layer: `{"data": [{name, status, date}, ...]}`.
pub fn records_to_json(records: &[DirectoryRecord]) -> serde_json::Value {
    serde_json::json!({ "data": records })
}
