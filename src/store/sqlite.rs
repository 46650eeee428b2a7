//! SQLite Store
//!
//! Embedded replica store. Statements run on a single connection guarded by
//! an async mutex.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex;

use super::Store;
use crate::error::Result;
use crate::protocol::{preview, Record};

/// Replica store backed by a SQLite database
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database file
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory database
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }
}

fn map_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    Ok(Record {
        id: row.get(0)?,
        key: row.get(1)?,
        value: row.get(2)?,
        created_at: row.get::<_, DateTime<Utc>>(3)?,
    })
}

/// Rows changed by every statement run on this connection so far
fn total_changes(conn: &Connection) -> Result<u64> {
    let total: i64 = conn.query_row("SELECT total_changes()", [], |row| row.get(0))?;
    Ok(total.max(0) as u64)
}

#[async_trait]
impl Store for SqliteStore {
    async fn execute(&self, statement: &str) -> Result<u64> {
        tracing::debug!("Executing: {}", preview(statement));
        let conn = self.conn.lock().await;
        let before = total_changes(&conn)?;
        conn.execute_batch(statement)?;
        Ok(total_changes(&conn)?.saturating_sub(before))
    }

    async fn query(&self, statement: &str) -> Result<Vec<Record>> {
        tracing::debug!("Querying: {}", preview(statement));
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(statement)?;
        let rows = stmt.query_map([], map_record)?;

        let mut records = Vec::new();
        for row in rows {
            match row {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping row: {}", e),
            }
        }
        Ok(records)
    }

    async fn health_check(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    async fn ensure_schema(&self, table: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );
            "#
        ))?;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    async fn store() -> SqliteStore {
        let store = SqliteStore::in_memory().unwrap();
        store.ensure_schema("test_data").await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_execute_and_query() {
        let store = store().await;
        store
            .execute("INSERT INTO test_data (key, value) VALUES ('k1', 'v1')")
            .await
            .unwrap();
        store
            .execute("INSERT INTO test_data (key, value) VALUES ('k2', 'v2')")
            .await
            .unwrap();

        let all = store.query("SELECT * FROM test_data").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].key, "k1");

        let latest = store
            .query("SELECT * FROM test_data ORDER BY id DESC LIMIT 1")
            .await
            .unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].value, "v2");
    }

    #[tokio::test]
    async fn test_rows_affected() {
        let store = store().await;
        for i in 0..3 {
            store
                .execute(&format!("INSERT INTO test_data (key, value) VALUES ('k{i}', 'v')"))
                .await
                .unwrap();
        }
        let changed = store
            .execute("UPDATE test_data SET value = 'w' WHERE key != 'k0'")
            .await
            .unwrap();
        assert_eq!(changed, 2);

        // DDL and statements matching nothing report no rows
        assert_eq!(store.execute("CREATE TABLE other (id INTEGER)").await.unwrap(), 0);
        assert_eq!(
            store
                .execute("DELETE FROM test_data WHERE key = 'none'")
                .await
                .unwrap(),
            0
        );
        let batch = store
            .execute("INSERT INTO other VALUES (1); INSERT INTO other VALUES (2);")
            .await
            .unwrap();
        assert_eq!(batch, 2);
    }

    #[tokio::test]
    async fn test_unmappable_rows_skipped() {
        let store = store().await;
        store
            .execute("INSERT INTO test_data (key, value, created_at) VALUES ('ok', 'v', '2024-05-01T10:00:00Z')")
            .await
            .unwrap();
        store
            .execute("INSERT INTO test_data (key, value, created_at) VALUES ('bad', 'v', 'not a time')")
            .await
            .unwrap();

        let rows = store.query("SELECT * FROM test_data").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "ok");
    }

    #[tokio::test]
    async fn test_errors_carry_code() {
        let store = store().await;
        let err = store.execute("INSERT INTO missing VALUES (1)").await.unwrap_err();
        assert!(matches!(err, Error::Store { .. }));
        assert!(err.store_code().is_some());
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("replica.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.ensure_schema("test_data").await.unwrap();
            store
                .execute("INSERT INTO test_data (key, value) VALUES ('k', 'v')")
                .await
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.query("SELECT * FROM test_data").await.unwrap().len(), 1);
        store.health_check().await.unwrap();
    }
}
