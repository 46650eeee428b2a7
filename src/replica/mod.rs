//! Replica
//!
//! Long-lived consumer of the replica's durable queue. Every command is
//! applied to the local store; reads are answered on the response exchange
//! under the request id. Nothing is acknowledged before it is applied,
//! answered, or found unprocessable.

mod stats;

pub use stats::{ReplicaStats, StatsSnapshot};

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::bus::{declare_topology, Delivery, MessageBus, QueueOptions, Settlement, Subscription};
use crate::config::ReplicaConfig;
use crate::error::{Error, Result};
use crate::protocol::{Command, Reply, COMMAND_EXCHANGE, RESPONSE_EXCHANGE};
use crate::state::AppliedLedger;
use crate::store::Store;

/// How often the applied ledger is pruned
const LEDGER_PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// What happened to one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Write executed and acknowledged
    Applied { rows: u64 },
    /// Read answered and acknowledged
    Answered { rows: usize },
    /// Write already in the ledger; acknowledged without executing
    Duplicate,
    /// Undecodable body; dropped without redelivery
    Discarded,
    /// Failed; put back on the queue
    Requeued,
}

/// A replica bound to one store and one durable queue
pub struct Replica {
    /// Replica identity
    id: String,
    /// Durable queue name (`replica_<id>`)
    queue: String,
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn Store>,
    ledger: Arc<AppliedLedger>,
    config: ReplicaConfig,
    stats: Arc<ReplicaStats>,
}

impl Replica {
    /// Create a replica with an existing ledger
    pub fn new(
        config: &ReplicaConfig,
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn Store>,
        ledger: Arc<AppliedLedger>,
    ) -> Self {
        Self {
            id: config.id.clone(),
            queue: config.queue_name(),
            bus,
            store,
            ledger,
            config: config.clone(),
            stats: Arc::new(ReplicaStats::default()),
        }
    }

    /// Create a replica whose ledger lives under `config.data_dir`
    pub fn open(
        config: &ReplicaConfig,
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn Store>,
    ) -> Result<Self> {
        let ledger = AppliedLedger::open(&config.ledger_path(), config.id.clone())?;
        Ok(Self::new(config, bus, store, Arc::new(ledger)))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn stats(&self) -> Arc<ReplicaStats> {
        Arc::clone(&self.stats)
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<AppliedLedger> {
        &self.ledger
    }

    /// Declare the exchanges and this replica's durable queue and binding
    pub async fn declare(&self) -> Result<()> {
        declare_topology(self.bus.as_ref()).await?;
        let options = QueueOptions::durable().with_max_deliveries(self.config.max_deliveries);
        self.bus.declare_queue(&self.queue, options).await?;
        self.bus.bind_queue(&self.queue, COMMAND_EXCHANGE, "").await?;
        Ok(())
    }

    /// Run on a background task until `shutdown` is cancelled
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Consume until `shutdown` is cancelled or the bus closes the queue
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.declare().await?;

        let workers = self.config.consumers.max(1);
        let mut subscriptions = Vec::with_capacity(workers);
        for _ in 0..workers {
            subscriptions.push(self.bus.consume(&self.queue).await?);
        }
        tracing::info!(
            "Replica {} consuming {} with {} worker(s)",
            self.id,
            self.queue,
            workers
        );

        // A failing worker stops its siblings
        let stop = shutdown.child_token();
        let consumers = subscriptions
            .into_iter()
            .enumerate()
            .map(|(n, sub)| self.consume_loop(n, sub, stop.clone()));

        let (results, ()) =
            tokio::join!(join_all(consumers), self.prune_loop(stop.clone()));

        tracing::info!("Replica {} stopped", self.id);
        results.into_iter().collect()
    }

    async fn consume_loop(
        &self,
        worker: usize,
        mut subscription: Subscription,
        stop: CancellationToken,
    ) -> Result<()> {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(()),
                d = subscription.recv() => d,
            };

            let Some(delivery) = delivery else {
                tracing::error!("Replica {} worker {}: queue consumer closed", self.id, worker);
                stop.cancel();
                return Err(Error::ChannelClosed);
            };

            let outcome = self.handle_delivery(delivery).await;
            tracing::trace!("Replica {} worker {}: {:?}", self.id, worker, outcome);
        }
    }

    async fn prune_loop(&self, stop: CancellationToken) {
        let Some(retention) = self.config.ledger_retention() else {
            return;
        };

        let mut ticks = IntervalStream::new(tokio::time::interval(LEDGER_PRUNE_INTERVAL));
        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                tick = ticks.next() => {
                    if tick.is_none() {
                        return;
                    }
                    match self.ledger.prune_older_than(retention).await {
                        Ok(0) => {}
                        Ok(n) => tracing::info!("Pruned {} applied ledger entries", n),
                        Err(e) => tracing::warn!("Failed to prune applied ledger: {}", e),
                    }
                }
            }
        }
    }

    /// Process one delivery and settle it
    pub async fn handle_delivery(&self, delivery: Delivery) -> Outcome {
        self.stats.record_received();

        let command = match Command::decode(&delivery.body) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!("Discarding malformed command: {}", e);
                self.settle(delivery, Settlement::Discard);
                self.stats.record_discarded();
                return Outcome::Discarded;
            }
        };

        if delivery.is_redelivery() {
            tracing::debug!(
                "Command {} redelivered (delivery {})",
                command.id,
                delivery.delivery_count
            );
        }

        if command.is_read {
            self.handle_read(delivery, command).await
        } else {
            self.handle_write(delivery, command).await
        }
    }

    async fn handle_read(&self, delivery: Delivery, command: Command) -> Outcome {
        tracing::info!("Received read {}: {}", command.id, command.preview());

        let rows = match self.store.query(&command.query).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(
                    "Error executing read {}{}: {}",
                    command.id,
                    code_label(&e),
                    e
                );
                return self.requeue(delivery).await;
            }
        };

        let count = rows.len();
        let published = match Reply::new(command.id.clone(), rows).encode() {
            Ok(body) => {
                self.bus
                    .publish(RESPONSE_EXCHANGE, command.id.as_str(), body.into())
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = published {
            tracing::warn!("Failed to publish reply for {}: {}", command.id, e);
            return self.requeue(delivery).await;
        }

        self.settle(delivery, Settlement::Ack);
        self.stats.record_answered();
        tracing::debug!("Answered read {} with {} row(s)", command.id, count);
        Outcome::Answered { rows: count }
    }

    async fn handle_write(&self, delivery: Delivery, command: Command) -> Outcome {
        match self.ledger.is_applied(&command.id).await {
            Ok(true) => {
                tracing::info!("Write {} already applied, acknowledging", command.id);
                self.settle(delivery, Settlement::Ack);
                self.stats.record_duplicate();
                return Outcome::Duplicate;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!("Applied ledger lookup failed for {}: {}", command.id, e);
                return self.requeue(delivery).await;
            }
        }

        tracing::info!("Received write {}: {}", command.id, command.preview());

        let rows = match self.store.execute(&command.query).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(
                    "Error executing write {}{}: {}",
                    command.id,
                    code_label(&e),
                    e
                );
                return self.requeue(delivery).await;
            }
        };

        if let Err(e) = self.ledger.record_applied(&command.id, &command.source).await {
            // Applied but unrecorded: a redelivery would apply it again
            tracing::warn!("Failed to record write {} as applied: {}", command.id, e);
        }

        self.settle(delivery, Settlement::Ack);
        self.stats.record_applied();
        tracing::debug!("Applied write {} ({} row(s))", command.id, rows);
        Outcome::Applied { rows }
    }

    async fn requeue(&self, delivery: Delivery) -> Outcome {
        let delay = self.config.requeue_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.settle(delivery, Settlement::Requeue);
        self.stats.record_requeued();
        Outcome::Requeued
    }

    fn settle(&self, delivery: Delivery, settlement: Settlement) {
        let tag = delivery.tag();
        if let Err(e) = delivery.settle(settlement) {
            tracing::warn!("Failed to {:?} delivery {}: {}", settlement, tag, e);
        }
    }
}

fn code_label(e: &Error) -> String {
    e.store_code()
        .map(|code| format!(" (code {})", code))
        .unwrap_or_default()
}
