//! Local Store Module
//!
//! The database a replica applies commands to. Each replica owns its store
//! exclusively; nothing here is shared across replicas.

mod postgres;
mod sqlite;

pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{StoreConfig, StoreKind};
use crate::error::{Error, Result};
use crate::protocol::Record;

/// Statement execution against a replica's database.
///
/// Failures surface as [`Error::Store`] or [`Error::Database`]; both carry
/// the backend error code (`Error::store_code`) and a retryable flag
/// (`Error::is_retryable`).
#[async_trait]
pub trait Store: Send + Sync {
    /// Execute a mutation, returning the number of affected rows
    async fn execute(&self, statement: &str) -> Result<u64>;

    /// Run a query and map its rows as `(id, key, value, created_at)` records.
    ///
    /// Rows that fail to map are skipped.
    async fn query(&self, statement: &str) -> Result<Vec<Record>>;

    /// Verify the store is reachable
    async fn health_check(&self) -> Result<()>;

    /// Create the record table if it does not exist
    async fn ensure_schema(&self, table: &str) -> Result<()>;

    /// Backend name (for logging)
    fn kind(&self) -> &'static str;
}

/// Open the store named by the configuration and check it is reachable
pub async fn open(config: &StoreConfig) -> Result<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match config.kind {
        StoreKind::Postgres => Arc::new(PostgresStore::connect(config).await?),
        StoreKind::Sqlite => {
            let path = config
                .path
                .as_ref()
                .ok_or_else(|| Error::Config("store.path is required for the sqlite store".into()))?;
            Arc::new(SqliteStore::open(path)?)
        }
    };

    if config.bootstrap_schema {
        store.ensure_schema(&config.table).await?;
        tracing::info!("Ensured table {} exists", config.table);
    }

    store.health_check().await?;
    tracing::info!("Store ready ({})", store.kind());
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_sqlite_with_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            kind: StoreKind::Sqlite,
            path: Some(dir.path().join("replica.db")),
            bootstrap_schema: true,
            ..StoreConfig::default()
        };

        let store = open(&config).await.unwrap();
        assert_eq!(store.kind(), "sqlite");
        assert_eq!(
            store
                .execute("INSERT INTO test_data (key, value) VALUES ('a', '1')")
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.query("SELECT * FROM test_data").await.unwrap().len(), 1);
    }
}
