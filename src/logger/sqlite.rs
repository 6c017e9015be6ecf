//! Activity history store backed by SQLite.
//!
//! The database runs in WAL mode so `ssp history` can read while a scheduled
//! sync is appending.

#![allow(missing_docs)]

use std::path::Path;

use rusqlite::{Connection, OpenFlags, Row, params};
use serde::Serialize;

use crate::core::errors::{Result, SspError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS activity_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    event_type TEXT NOT NULL,
    severity TEXT NOT NULL,
    path TEXT,
    rule TEXT,
    rules_fingerprint TEXT,
    count INTEGER,
    duration_ms INTEGER,
    success INTEGER NOT NULL DEFAULT 1,
    error_code TEXT,
    error_message TEXT,
    details TEXT
);
CREATE INDEX IF NOT EXISTS idx_activity_event_time ON activity_log(event_type, timestamp);
CREATE INDEX IF NOT EXISTS idx_activity_time ON activity_log(timestamp);
";

/// Column list shared by insert and select, in `ActivityRow` field order.
const COLUMNS: &str = "timestamp, event_type, severity, path, rule, rules_fingerprint, \
                       count, duration_ms, success, error_code, error_message, details";

/// One persisted activity event.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityRow {
    pub timestamp: String,
    pub event_type: String,
    pub severity: String,
    pub path: Option<String>,
    pub rule: Option<String>,
    pub rules_fingerprint: Option<String>,
    pub count: Option<i64>,
    pub duration_ms: Option<i64>,
    pub success: i32,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub details: Option<String>,
}

impl ActivityRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            timestamp: row.get(0)?,
            event_type: row.get(1)?,
            severity: row.get(2)?,
            path: row.get(3)?,
            rule: row.get(4)?,
            rules_fingerprint: row.get(5)?,
            count: row.get(6)?,
            duration_ms: row.get(7)?,
            success: row.get(8)?,
            error_code: row.get(9)?,
            error_message: row.get(10)?,
            details: row.get(11)?,
        })
    }
}

pub struct SqliteLogger {
    conn: Connection,
}

impl SqliteLogger {
    /// Open or create the database, creating parent directories as needed.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| SspError::io(parent, source))?;
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        let journal: String = conn.query_row("PRAGMA journal_mode", [], |r| r.get(0))?;
        if !journal.eq_ignore_ascii_case("wal") {
            eprintln!("[SSP-SQLITE] journal mode is '{journal}', concurrent readers may block");
        }
        conn.execute_batch(SCHEMA)?;

        Ok(Self { conn })
    }

    pub fn log_activity(&self, row: &ActivityRow) -> Result<()> {
        let sql = format!(
            "INSERT INTO activity_log ({COLUMNS}) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)"
        );
        self.conn.prepare_cached(&sql)?.execute(params![
            row.timestamp,
            row.event_type,
            row.severity,
            row.path,
            row.rule,
            row.rules_fingerprint,
            row.count,
            row.duration_ms,
            row.success,
            row.error_code,
            row.error_message,
            row.details,
        ])?;
        Ok(())
    }

    /// Newest rows first.
    pub fn recent_activity(&self, limit: u32) -> Result<Vec<ActivityRow>> {
        let sql = format!("SELECT {COLUMNS} FROM activity_log ORDER BY id DESC LIMIT ?1");
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params![limit], ActivityRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Newest rows of one event type, e.g. `archive_purged`.
    pub fn recent_events(&self, event_type: &str, limit: u32) -> Result<Vec<ActivityRow>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM activity_log WHERE event_type = ?1 ORDER BY id DESC LIMIT ?2"
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt
            .query_map(params![event_type, limit], ActivityRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Drop rows older than `days`. Returns the number removed.
    pub fn prune_older_than(&self, days: u32) -> Result<usize> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(i64::from(days)))
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let removed = self
            .conn
            .execute("DELETE FROM activity_log WHERE timestamp < ?1", params![cutoff])?;
        Ok(removed)
    }

    #[cfg(test)]
    fn journal_mode(&self) -> String {
        self.conn
            .query_row("PRAGMA journal_mode", [], |r| r.get(0))
            .unwrap_or_default()
    }
}
