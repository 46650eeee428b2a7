//! Reply Correlation
//!
//! Each in-flight read owns a private reply queue named after its request
//! id. The arena tracks which ids are in flight; a [`ReplySlot`] owns one
//! queue from creation to teardown.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::bus::{MessageBus, QueueOptions, Subscription};
use crate::error::{Error, Result};
use crate::protocol::{CommandId, Reply, RESPONSE_EXCHANGE};

/// Registry of request ids with an open reply queue
#[derive(Clone, Default)]
pub struct CorrelationArena {
    in_flight: Arc<Mutex<HashSet<CommandId>>>,
}

impl CorrelationArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of reply queues currently open
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    /// Check whether a request id currently owns a reply queue
    pub fn contains(&self, id: &CommandId) -> bool {
        self.lock().contains(id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<CommandId>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, id: &CommandId) {
        self.lock().remove(id);
    }

    /// Create, bind and start consuming the reply queue for `id`
    pub async fn open(&self, bus: Arc<dyn MessageBus>, id: CommandId) -> Result<ReplySlot> {
        if !self.lock().insert(id.clone()) {
            return Err(Error::DuplicateRequestId(id.to_string()));
        }

        // From here on the slot owns the id and releases it on every path
        let mut slot = ReplySlot {
            id,
            bus,
            arena: self.clone(),
            subscription: None,
            closed: false,
        };

        let queue = slot.id.as_str().to_string();
        slot.bus.declare_queue(&queue, QueueOptions::ephemeral()).await?;
        slot.bus.bind_queue(&queue, RESPONSE_EXCHANGE, &queue).await?;
        slot.subscription = Some(slot.bus.consume(&queue).await?);

        tracing::debug!("Opened reply queue {}", queue);
        Ok(slot)
    }
}

/// One request's reply destination
pub struct ReplySlot {
    id: CommandId,
    bus: Arc<dyn MessageBus>,
    arena: CorrelationArena,
    subscription: Option<Subscription>,
    closed: bool,
}

impl ReplySlot {
    /// Request id this slot answers to
    pub fn id(&self) -> &CommandId {
        &self.id
    }

    /// Wait for the reply carrying this slot's request id.
    ///
    /// Replies for other ids and undecodable bodies are dropped. Fails with
    /// `ChannelClosed` if the bus ends the subscription.
    pub async fn recv(&mut self) -> Result<Reply> {
        let subscription = self.subscription.as_mut().ok_or(Error::ChannelClosed)?;

        loop {
            let delivery = subscription.recv().await.ok_or(Error::ChannelClosed)?;

            match Reply::decode(&delivery.body) {
                Ok(reply) if reply.request_id == self.id => {
                    delivery.ack()?;
                    return Ok(reply);
                }
                Ok(reply) => {
                    tracing::warn!(
                        "Ignoring reply for {} on queue of {}",
                        reply.request_id,
                        self.id
                    );
                    delivery.discard()?;
                }
                Err(e) => {
                    tracing::warn!("Ignoring malformed reply on queue of {}: {}", self.id, e);
                    delivery.discard()?;
                }
            }
        }
    }

    /// Stop consuming, delete the queue and release the id
    pub async fn close(mut self) -> Result<()> {
        self.closed = true;
        self.subscription.take();
        let result = self.bus.delete_queue(self.id.as_str()).await;
        self.arena.release(&self.id);

        match result {
            // Auto-delete may already have removed it
            Err(Error::QueueNotFound(_)) => Ok(()),
            other => other,
        }
    }
}

impl std::fmt::Debug for ReplySlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplySlot")
            .field("id", &self.id)
            .field("consuming", &self.subscription.is_some())
            .finish()
    }
}

impl Drop for ReplySlot {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Cancelling the consumer lets the bus auto-delete the queue
        self.subscription.take();

        // The id stays reserved until the delete lands so a reopened slot
        // cannot lose its queue to this one's teardown
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let bus = Arc::clone(&self.bus);
                let arena = self.arena.clone();
                let id = self.id.clone();
                handle.spawn(async move {
                    if let Err(e) = bus.delete_queue(id.as_str()).await {
                        tracing::trace!("Reply queue {} already gone: {}", id, e);
                    }
                    arena.release(&id);
                });
            }
            Err(_) => self.arena.release(&self.id),
        }
    }
}
