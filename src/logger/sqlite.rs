//! SQLite activity store: WAL-mode table of admission events for querying.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags, params};
use serde::Serialize;

use crate::core::errors::{Result, UgkError};
use crate::logger::jsonl::LogEntry;

pub struct SqliteLogger {
    conn: Connection,
    path: PathBuf,
}

impl SqliteLogger {
    /// Open (or create) the database, applying PRAGMAs and schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| UgkError::io(parent, source))?;
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        apply_pragmas(&conn)?;
        apply_schema(&conn)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log_activity(&self, row: &ActivityRow) -> Result<()> {
        self.conn
            .prepare_cached(
                "INSERT INTO activity_log (
                timestamp, event_type, severity, device_node, vendor_id, product_id,
                serial, decision, source, action, mount_point, success,
                error_code, error_message, details
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            )?
            .execute(params![
                row.timestamp,
                row.event_type,
                row.severity,
                row.device_node,
                row.vendor_id,
                row.product_id,
                row.serial,
                row.decision,
                row.source,
                row.action,
                row.mount_point,
                row.success,
                row.error_code,
                row.error_message,
                row.details,
            ])?;
        Ok(())
    }

    /// Newest first.
    pub fn recent_activity(&self, limit: u32) -> Result<Vec<ActivityRow>> {
        self.query_rows(
            "SELECT timestamp, event_type, severity, device_node, vendor_id, product_id,
                    serial, decision, source, action, mount_point, success,
                    error_code, error_message, details
             FROM activity_log ORDER BY id DESC LIMIT ?1",
            params![limit],
        )
    }

    /// Newest first, restricted to one device node.
    pub fn device_activity(&self, device_node: &str, limit: u32) -> Result<Vec<ActivityRow>> {
        self.query_rows(
            "SELECT timestamp, event_type, severity, device_node, vendor_id, product_id,
                    serial, decision, source, action, mount_point, success,
                    error_code, error_message, details
             FROM activity_log WHERE device_node = ?1 ORDER BY id DESC LIMIT ?2",
            params![device_node, limit],
        )
    }

    pub fn count_events_since(&self, event_type: &str, since: &str) -> Result<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM activity_log WHERE event_type = ?1 AND timestamp >= ?2",
            params![event_type, since],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Delete rows older than `retention_days`. Returns rows deleted.
    pub fn prune_activity_log(&self, retention_days: u32) -> Result<usize> {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(retention_days));
        let cutoff = cutoff.to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        Ok(self.conn.execute(
            "DELETE FROM activity_log WHERE timestamp < ?1",
            params![cutoff],
        )?)
    }

    pub fn is_wal_mode(&self) -> bool {
        self.conn
            .query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0))
            .map(|mode| mode.eq_ignore_ascii_case("wal"))
            .unwrap_or(false)
    }

    fn query_rows(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<ActivityRow>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt
            .query_map(params, |row| {
                Ok(ActivityRow {
                    timestamp: row.get(0)?,
                    event_type: row.get(1)?,
                    severity: row.get(2)?,
                    device_node: row.get(3)?,
                    vendor_id: row.get(4)?,
                    product_id: row.get(5)?,
                    serial: row.get(6)?,
                    decision: row.get(7)?,
                    source: row.get(8)?,
                    action: row.get(9)?,
                    mount_point: row.get(10)?,
                    success: row.get(11)?,
                    error_code: row.get(12)?,
                    error_message: row.get(13)?,
                    details: row.get(14)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// Row of `activity_log`; mirrors [`LogEntry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityRow {
    pub timestamp: String,
    pub event_type: String,
    pub severity: String,
    pub device_node: Option<String>,
    pub vendor_id: Option<String>,
    pub product_id: Option<String>,
    pub serial: Option<String>,
    pub decision: Option<String>,
    pub source: Option<String>,
    pub action: Option<String>,
    pub mount_point: Option<String>,
    pub success: i32,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub details: Option<String>,
}

impl From<&LogEntry> for ActivityRow {
    fn from(entry: &LogEntry) -> Self {
        Self {
            timestamp: entry.ts.clone(),
            event_type: entry.event.map_or("unknown", |e| e.as_str()).to_string(),
            severity: entry.severity.map_or("info", |s| s.as_str()).to_string(),
            device_node: entry.device_node.clone(),
            vendor_id: entry.vendor_id.clone(),
            product_id: entry.product_id.clone(),
            serial: entry.serial.clone(),
            decision: entry.decision.clone(),
            source: entry.source.clone(),
            action: entry.action.clone(),
            mount_point: entry.mount_point.clone(),
            success: i32::from(entry.ok.unwrap_or(true)),
            error_code: entry.error_code.clone(),
            error_message: entry.error_message.clone(),
            details: entry.details.clone(),
        }
    }
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA temp_store = MEMORY;
         PRAGMA busy_timeout = 5000;",
    )?;
    let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        eprintln!("[UGK-SQLITE] WARNING: requested WAL mode but got '{mode}'");
    }
    Ok(())
}

fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS activity_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            device_node TEXT,
            vendor_id TEXT,
            product_id TEXT,
            serial TEXT,
            decision TEXT,
            source TEXT,
            action TEXT,
            mount_point TEXT,
            success INTEGER NOT NULL DEFAULT 1,
            error_code TEXT,
            error_message TEXT,
            details TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_activity_timestamp ON activity_log(timestamp);
        CREATE INDEX IF NOT EXISTS idx_activity_type_time ON activity_log(event_type, timestamp);
        CREATE INDEX IF NOT EXISTS idx_activity_device ON activity_log(device_node);",
    )?;
    Ok(())
}
