//! Reader Client
//!
//! Broadcasts a query and waits for the first correlated reply. Any replica
//! may answer; the reply queue is single-use and removed afterwards.

use std::sync::Arc;
use std::time::Duration;

use crate::bus::MessageBus;
use crate::config::ReaderConfig;
use crate::error::{Error, Result};
use crate::protocol::{Command, CommandId, Record, COMMAND_EXCHANGE};

use super::correlation::CorrelationArena;

/// Default originator label on read commands
pub const DEFAULT_READER_SOURCE: &str = "client-reader";

/// Canned reads against the record table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadMode {
    /// Every row
    All,
    /// The row with the highest id
    Latest,
    /// Caller-supplied statement
    Sql(String),
}

impl ReadMode {
    /// Statement text for this mode
    pub fn statement(&self, table: &str) -> String {
        match self {
            ReadMode::All => format!("SELECT * FROM {}", table),
            ReadMode::Latest => format!("SELECT * FROM {} ORDER BY id DESC LIMIT 1", table),
            ReadMode::Sql(sql) => sql.clone(),
        }
    }
}

/// Issues correlated reads
pub struct Reader {
    bus: Arc<dyn MessageBus>,
    arena: CorrelationArena,
    timeout: Duration,
    table: String,
    source: String,
}

impl Reader {
    pub fn new(bus: Arc<dyn MessageBus>, config: &ReaderConfig) -> Self {
        Self {
            bus,
            arena: CorrelationArena::new(),
            timeout: config.timeout(),
            table: config.table.clone(),
            source: DEFAULT_READER_SOURCE.to_string(),
        }
    }

    /// Override the reply deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Label read commands with `source`
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Requests currently waiting for a reply
    pub fn in_flight(&self) -> usize {
        self.arena.in_flight()
    }

    /// Run one of the canned reads
    pub async fn query_mode(&self, mode: ReadMode) -> Result<Vec<Record>> {
        self.query(&mode.statement(&self.table)).await
    }

    /// Broadcast `sql` and return the rows of the first reply
    pub async fn query(&self, sql: &str) -> Result<Vec<Record>> {
        self.query_with_id(CommandId::generate(), sql).await
    }

    /// Broadcast `sql` under a caller-chosen request id.
    ///
    /// Fails with `DuplicateRequestId` if this reader already waits on `id`.
    pub async fn query_with_id(&self, id: CommandId, sql: &str) -> Result<Vec<Record>> {
        let sql = sql.trim();
        if sql.is_empty() {
            return Err(Error::EmptyStatement);
        }

        // Reply queue exists before the command can reach any replica
        let mut slot = self.arena.open(Arc::clone(&self.bus), id.clone()).await?;

        let command = Command::read(id.clone(), sql, self.source.as_str());
        let outcome = match self
            .bus
            .publish(COMMAND_EXCHANGE, "", command.encode()?.into())
            .await
        {
            Ok(()) => {
                tracing::debug!("Published read {}: {}", id, command.preview());
                match tokio::time::timeout(self.timeout, slot.recv()).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::ReplyTimeout {
                        request_id: id.to_string(),
                        after: self.timeout,
                    }),
                }
            }
            Err(e) => Err(e),
        };

        if let Err(e) = slot.close().await {
            tracing::warn!("Failed to remove reply queue {}: {}", id, e);
        }

        let reply = outcome?;
        tracing::info!("Read {} answered with {} row(s)", id, reply.data.len());
        Ok(reply.data)
    }
}
