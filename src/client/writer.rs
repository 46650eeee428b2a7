//! Writer Client
//!
//! Publishes a mutation once to the command exchange. Replicas apply it on
//! their own schedule; the writer gets no acknowledgment that any did.

use std::sync::Arc;

use crate::bus::MessageBus;
use crate::error::{Error, Result};
use crate::protocol::{Command, CommandId, COMMAND_EXCHANGE};

/// Default originator label on published commands
pub const DEFAULT_WRITER_SOURCE: &str = "client-writer";

/// Broadcasts write commands
pub struct Writer {
    bus: Arc<dyn MessageBus>,
    source: String,
}

impl Writer {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            source: DEFAULT_WRITER_SOURCE.to_string(),
        }
    }

    /// Label published commands with `source`
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Publish a write command and return its id
    pub async fn submit(&self, query: &str) -> Result<CommandId> {
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::EmptyStatement);
        }

        let command = Command::write(query, self.source.as_str());
        self.bus
            .publish(COMMAND_EXCHANGE, "", command.encode()?.into())
            .await?;

        tracing::info!("Published write {}: {}", command.id, command.preview());
        Ok(command.id)
    }
}
