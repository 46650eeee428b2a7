//! Applied Ledger
//!
//! Persistent record of the write commands a replica has applied, keyed by
//! command id. A redelivered write whose id is already here is acknowledged
//! without touching the store again.
//!
//! The store write and the ledger insert are not atomic: a crash between the
//! two applies the command a second time on redelivery.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::protocol::CommandId;

/// Applied write ids backed by SQLite
pub struct AppliedLedger {
    /// Database connection
    conn: Mutex<Connection>,
    /// Replica this ledger belongs to
    replica_id: String,
}

impl AppliedLedger {
    /// Create or open the ledger database at `path`
    pub fn open(path: &Path, replica_id: impl Into<String>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?, replica_id.into())
    }

    /// Ledger that lives only as long as the process
    pub fn in_memory(replica_id: impl Into<String>) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, replica_id.into())
    }

    fn init(conn: Connection, replica_id: String) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS applied_commands (
                command_id TEXT PRIMARY KEY,
                source TEXT NOT NULL DEFAULT '',
                applied_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_applied_commands_at
                ON applied_commands(applied_at);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            replica_id,
        })
    }

    /// Record that a write command has been applied
    pub async fn record_applied(&self, id: &CommandId, source: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT OR IGNORE INTO applied_commands (command_id, source, applied_at)
            VALUES (?1, ?2, ?3)
            "#,
            params![id.as_str(), source, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }

    /// Check if a command has been applied
    pub async fn is_applied(&self, id: &CommandId) -> Result<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM applied_commands WHERE command_id = ?1",
            params![id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Get count of applied commands
    pub async fn applied_count(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM applied_commands", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Most recently applied command and when it was applied
    pub async fn last_applied(&self) -> Result<Option<(CommandId, DateTime<Utc>)>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                r#"
                SELECT command_id, applied_at FROM applied_commands
                ORDER BY applied_at DESC, rowid DESC LIMIT 1
                "#,
                [],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?;

        Ok(row.and_then(|(id, millis)| {
            Utc.timestamp_millis_opt(millis)
                .single()
                .map(|at| (CommandId::from(id), at))
        }))
    }

    /// Remove entries applied before `cutoff`
    pub async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM applied_commands WHERE applied_at < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        Ok(deleted as u64)
    }

    /// Remove entries older than `retention`
    pub async fn prune_older_than(&self, retention: Duration) -> Result<u64> {
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        match cutoff {
            Some(cutoff) => self.prune_before(cutoff).await,
            // Older than anything representable
            None => Ok(0),
        }
    }

    /// Get replica ID
    pub fn replica_id(&self) -> &str {
        &self.replica_id
    }
}
