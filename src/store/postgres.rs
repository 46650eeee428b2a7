//! PostgreSQL Store
//!
//! Executes replicated statements against a PostgreSQL database through a
//! `sqlx` pool. Statements are sent through the simple query protocol so a
//! command may carry several `;`-separated statements.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::{Executor, Row};

use super::Store;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::protocol::{preview, Record};

/// Replica store backed by PostgreSQL
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and ping, retrying `connect_attempts` times
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let options = config.connect_options();
        let attempts = config.connect_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match Self::try_connect(options.clone(), config.pool_size).await {
                Ok(pool) => {
                    tracing::info!("Connected to PostgreSQL at {}", config.display_url());
                    return Ok(Self { pool });
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to connect to PostgreSQL (attempt {}/{}): {}",
                        attempt,
                        attempts,
                        e
                    );
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(config.connect_retry()).await;
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Internal("no connection attempt made".into())))
    }

    async fn try_connect(options: PgConnectOptions, pool_size: u32) -> Result<PgPool> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_size.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;
        pool.execute("SELECT 1").await?;
        Ok(pool)
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Map a row positionally as `(id, key, value, created_at)`
fn record_from_row(row: &PgRow) -> std::result::Result<Record, sqlx::Error> {
    let id = match row.try_get::<i64, _>(0) {
        Ok(id) => id,
        Err(_) => row.try_get::<i32, _>(0)? as i64,
    };
    let created_at = match row.try_get::<DateTime<Utc>, _>(3) {
        Ok(ts) => ts,
        Err(_) => row.try_get::<NaiveDateTime, _>(3)?.and_utc(),
    };

    Ok(Record {
        id,
        key: row.try_get(1)?,
        value: row.try_get(2)?,
        created_at,
    })
}

#[async_trait]
impl Store for PostgresStore {
    async fn execute(&self, statement: &str) -> Result<u64> {
        tracing::debug!("Executing: {}", preview(statement));
        let result = self.pool.execute(statement).await?;
        Ok(result.rows_affected())
    }

    async fn query(&self, statement: &str) -> Result<Vec<Record>> {
        tracing::debug!("Querying: {}", preview(statement));
        let rows = self.pool.fetch_all(statement).await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            match record_from_row(row) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping row: {}", e),
            }
        }
        Ok(records)
    }

    async fn health_check(&self) -> Result<()> {
        self.pool.execute("SELECT 1").await?;
        Ok(())
    }

    async fn ensure_schema(&self, table: &str) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (\
                id SERIAL PRIMARY KEY, \
                key TEXT NOT NULL, \
                value TEXT NOT NULL, \
                created_at TIMESTAMPTZ NOT NULL DEFAULT now())"
        );
        self.pool.execute(ddl.as_str()).await?;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "postgres"
    }
}
