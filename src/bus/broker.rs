//! Broker
//!
//! In-process routing engine: exchanges, queues, consumers and the
//! outstanding-delivery ledger that backs ack / requeue / discard.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

use super::{
    BusChannel, Delivery, DeliveryHandle, ExchangeKind, MessageBus, QueueOptions, Settlement,
    Subscription,
};
use crate::error::{Error, Result};

/// Identity of one client connection to the broker
pub type ConnectionId = u64;

/// Counters over the broker lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub published: u64,
    pub unroutable: u64,
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
    pub discarded: u64,
    /// Dropped after reaching the queue's delivery limit
    pub dead_lettered: u64,
}

/// Messages waiting in a queue and messages handed out but not yet settled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub ready: usize,
    pub unacked: usize,
    pub consumers: usize,
}

#[derive(Debug, Clone)]
struct Message {
    body: Bytes,
    exchange: String,
    routing_key: String,
    delivery_count: u32,
}

struct Binding {
    queue: String,
    routing_key: String,
}

struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

struct Consumer {
    tag: u64,
    connection: ConnectionId,
    tx: mpsc::UnboundedSender<Delivery>,
    channel: Arc<dyn BusChannel>,
}

struct Queue {
    options: QueueOptions,
    owner: Option<ConnectionId>,
    ready: VecDeque<Message>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
}

struct Unacked {
    queue: String,
    connection: ConnectionId,
    message: Message,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
    next_consumer: u64,
    stats: BrokerStats,
}

/// Message broker shared by every connection in the process
pub struct Broker {
    state: Mutex<BrokerState>,
    next_connection: AtomicU64,
}

impl Broker {
    /// Create an empty broker
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BrokerState::default()),
            next_connection: AtomicU64::new(1),
        })
    }

    /// Open a new in-process connection
    pub fn connect(self: &Arc<Self>) -> MemoryBus {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Broker connection {} opened", connection);
        MemoryBus {
            broker: Arc::clone(self),
            connection,
        }
    }

    /// Snapshot of the lifetime counters
    pub fn stats(&self) -> BrokerStats {
        self.lock().stats
    }

    /// Depth of a queue, `None` if it does not exist
    pub fn queue_depth(&self, queue: &str) -> Option<QueueDepth> {
        let state = self.lock();
        let q = state.queues.get(queue)?;
        Some(QueueDepth {
            ready: q.ready.len(),
            unacked: state.unacked.values().filter(|u| u.queue == queue).count(),
            consumers: q.consumers.len(),
        })
    }

    /// Names of all existing queues, sorted
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A poisoned lock only means another thread panicked mid-update; the maps stay usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        let mut state = self.lock();
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(Error::Transport(format!(
                "exchange {} already declared as {:?}",
                name, existing.kind
            ))),
            Some(_) => Ok(()),
            None => {
                tracing::debug!("Declared {:?} exchange {}", kind, name);
                state.exchanges.insert(
                    name.to_string(),
                    Exchange {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn declare_queue(&self, connection: ConnectionId, name: &str, options: QueueOptions) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Transport("queue name cannot be empty".into()));
        }

        let mut state = self.lock();
        if let Some(existing) = state.queues.get(name) {
            check_owner(name, existing, connection)?;
            return Ok(());
        }

        tracing::debug!("Declared queue {} ({:?})", name, options);
        state.queues.insert(
            name.to_string(),
            Queue {
                options,
                owner: options.exclusive.then_some(connection),
                ready: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
            },
        );
        Ok(())
    }

    fn bind_queue(&self, connection: ConnectionId, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.lock();
        let q = state
            .queues
            .get(queue)
            .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;
        check_owner(queue, q, connection)?;

        let ex = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| Error::ExchangeNotFound(exchange.to_string()))?;
        let exists = ex
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.routing_key == routing_key);
        if !exists {
            ex.bindings.push(Binding {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    fn delete_queue(&self, connection: ConnectionId, queue: &str) -> Result<()> {
        let mut state = self.lock();
        let q = state
            .queues
            .get(queue)
            .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;
        check_owner(queue, q, connection)?;
        remove_queue(&mut state, queue);
        Ok(())
    }

    fn publish(&self, exchange: &str, routing_key: &str, body: Bytes) -> Result<()> {
        let mut state = self.lock();
        let ex = state
            .exchanges
            .get(exchange)
            .ok_or_else(|| Error::ExchangeNotFound(exchange.to_string()))?;

        let targets: Vec<String> = ex
            .bindings
            .iter()
            .filter(|b| ex.kind == ExchangeKind::Fanout || b.routing_key == routing_key)
            .map(|b| b.queue.clone())
            .collect();

        state.stats.published += 1;
        if targets.is_empty() {
            state.stats.unroutable += 1;
            tracing::debug!("Dropped unroutable message on {} ({})", exchange, routing_key);
            return Ok(());
        }

        let message = Message {
            body,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            delivery_count: 0,
        };
        for queue in targets {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_back(message.clone());
            }
            dispatch(&mut state, &queue);
        }
        Ok(())
    }

    fn consume(
        self: &Arc<Self>,
        connection: ConnectionId,
        queue: &str,
    ) -> Result<Subscription> {
        let channel: Arc<dyn BusChannel> = Arc::new(LocalChannel {
            broker: Arc::downgrade(self),
            connection,
        });
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.lock();
        let q = state
            .queues
            .get(queue)
            .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;
        check_owner(queue, q, connection)?;

        state.next_consumer += 1;
        let tag = state.next_consumer;
        if let Some(q) = state.queues.get_mut(queue) {
            q.consumers.push(Consumer {
                tag,
                connection,
                tx,
                channel: Arc::clone(&channel),
            });
        }
        dispatch(&mut state, queue);
        drop(state);

        tracing::debug!("Consumer {} attached to {}", tag, queue);
        Ok(Subscription::new(tag, queue.to_string(), rx, channel))
    }

    fn settle(&self, tag: u64, settlement: Settlement) -> Result<()> {
        let mut state = self.lock();
        let Some(unacked) = state.unacked.remove(&tag) else {
            // Queue was deleted, or the connection already closed and reclaimed it
            tracing::debug!("Settlement {:?} for unknown delivery {}", settlement, tag);
            return Ok(());
        };

        match settlement {
            Settlement::Ack => state.stats.acked += 1,
            Settlement::Discard => {
                state.stats.discarded += 1;
                tracing::debug!("Discarded delivery {} from {}", tag, unacked.queue);
            }
            Settlement::Requeue => {
                requeue(&mut state, unacked);
            }
        }
        Ok(())
    }

    fn cancel(&self, consumer_tag: u64) {
        let mut state = self.lock();
        let mut emptied = None;
        for (name, q) in state.queues.iter_mut() {
            let before = q.consumers.len();
            q.consumers.retain(|c| c.tag != consumer_tag);
            if q.consumers.len() != before {
                if q.consumers.is_empty() && q.options.auto_delete {
                    emptied = Some(name.clone());
                }
                break;
            }
        }

        if let Some(queue) = emptied {
            tracing::debug!("Auto-deleting queue {} after last consumer left", queue);
            remove_queue(&mut state, &queue);
        }
    }

    fn close_connection(&self, connection: ConnectionId) {
        let mut state = self.lock();

        // Detach consumers first so requeued messages cannot land on this connection again
        let mut doomed = Vec::new();
        for (name, q) in state.queues.iter_mut() {
            let before = q.consumers.len();
            q.consumers.retain(|c| c.connection != connection);
            let lost_last = before > 0 && q.consumers.is_empty() && q.options.auto_delete;
            if q.owner == Some(connection) || lost_last {
                doomed.push(name.clone());
            }
        }

        // Return everything this connection held, oldest first at the head
        let mut tags: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, u)| u.connection == connection)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(unacked) = state.unacked.remove(&tag) {
                requeue(&mut state, unacked);
            }
        }

        for queue in doomed {
            tracing::debug!("Removing queue {} with closed connection {}", queue, connection);
            remove_queue(&mut state, &queue);
        }

        tracing::debug!("Broker connection {} closed", connection);
    }
}

fn check_owner(name: &str, queue: &Queue, connection: ConnectionId) -> Result<()> {
    match queue.owner {
        Some(owner) if owner != connection => Err(Error::ResourceLocked(name.to_string())),
        _ => Ok(()),
    }
}

fn remove_queue(state: &mut BrokerState, queue: &str) {
    state.queues.remove(queue);
    for ex in state.exchanges.values_mut() {
        ex.bindings.retain(|b| b.queue != queue);
    }
    state.unacked.retain(|_, u| u.queue != queue);
}

/// Put a message back at the head of its queue, or drop it at the delivery limit
fn requeue(state: &mut BrokerState, unacked: Unacked) {
    let Some(q) = state.queues.get_mut(&unacked.queue) else {
        return;
    };

    if let Some(limit) = q.options.max_deliveries {
        if unacked.message.delivery_count >= limit {
            tracing::warn!(
                "Dropping message from {} after {} deliveries",
                unacked.queue,
                unacked.message.delivery_count
            );
            state.stats.dead_lettered += 1;
            return;
        }
    }

    q.ready.push_front(unacked.message);
    state.stats.requeued += 1;
    let queue = unacked.queue;
    dispatch(state, &queue);
}

/// Hand ready messages to consumers round-robin
fn dispatch(state: &mut BrokerState, queue: &str) {
    loop {
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        if q.consumers.is_empty() || q.ready.is_empty() {
            return;
        }

        let idx = q.next_consumer % q.consumers.len();
        q.next_consumer = idx + 1;
        let Some(mut message) = q.ready.pop_front() else {
            return;
        };
        message.delivery_count += 1;

        state.next_tag += 1;
        let tag = state.next_tag;
        let consumer = &q.consumers[idx];
        let connection = consumer.connection;
        let delivery = Delivery::new(
            message.body.clone(),
            message.exchange.clone(),
            message.routing_key.clone(),
            message.delivery_count,
            DeliveryHandle::new(tag, Arc::clone(&consumer.channel)),
        );

        match consumer.tx.send(delivery) {
            Ok(()) => {
                state.stats.delivered += 1;
                state.unacked.insert(
                    tag,
                    Unacked {
                        queue: queue.to_string(),
                        connection,
                        message,
                    },
                );
            }
            Err(mpsc::error::SendError(delivery)) => {
                // Receiver is gone; the handle must not call back into the locked broker
                let (_, _, _, _, handle) = delivery.into_parts();
                handle.defuse();
                message.delivery_count -= 1;
                q.ready.push_front(message);
                q.consumers.remove(idx);
            }
        }
    }
}

/// Channel view handed to deliveries and subscriptions of an in-process connection
struct LocalChannel {
    broker: Weak<Broker>,
    connection: ConnectionId,
}

impl BusChannel for LocalChannel {
    fn settle(&self, tag: u64, settlement: Settlement) -> Result<()> {
        let broker = self.broker.upgrade().ok_or(Error::ChannelClosed)?;
        broker.settle(tag, settlement)
    }

    fn cancel(&self, consumer_tag: u64) {
        if let Some(broker) = self.broker.upgrade() {
            tracing::trace!("Connection {} cancels consumer {}", self.connection, consumer_tag);
            broker.cancel(consumer_tag);
        }
    }
}

/// In-process connection to a [`Broker`]. Dropping it closes the connection.
pub struct MemoryBus {
    broker: Arc<Broker>,
    connection: ConnectionId,
}

impl MemoryBus {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }
}

impl Drop for MemoryBus {
    fn drop(&mut self) {
        self.broker.close_connection(self.connection);
    }
}

#[async_trait::async_trait]
impl MessageBus for MemoryBus {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        self.broker.declare_exchange(name, kind)
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        self.broker.declare_queue(self.connection, name, options)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.broker.bind_queue(self.connection, queue, exchange, routing_key)
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.broker.delete_queue(self.connection, queue)
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: Bytes) -> Result<()> {
        self.broker.publish(exchange, routing_key, body)
    }

    async fn consume(&self, queue: &str) -> Result<Subscription> {
        self.broker.consume(self.connection, queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next(sub: &mut Subscription) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("delivery timed out")
            .expect("subscription closed")
    }

    async fn fanout_with_queues(bus: &MemoryBus, queues: &[&str]) {
        bus.declare_exchange("fan", ExchangeKind::Fanout).await.unwrap();
        for q in queues {
            bus.declare_queue(q, QueueOptions::durable()).await.unwrap();
            bus.bind_queue(q, "fan", "").await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_fanout_copies_to_every_queue() {
        let broker = Broker::new();
        let bus = broker.connect();
        fanout_with_queues(&bus, &["a", "b", "c"]).await;

        bus.publish("fan", "", Bytes::from_static(b"hello")).await.unwrap();

        for q in ["a", "b", "c"] {
            let mut sub = bus.consume(q).await.unwrap();
            let d = next(&mut sub).await;
            assert_eq!(&d.body[..], b"hello");
            assert_eq!(d.delivery_count, 1);
            d.ack().unwrap();
        }
        assert_eq!(broker.stats().acked, 3);
    }

    #[tokio::test]
    async fn test_direct_routes_by_key() {
        let broker = Broker::new();
        let bus = broker.connect();
        bus.declare_exchange("resp", ExchangeKind::Direct).await.unwrap();
        bus.declare_queue("r1", QueueOptions::ephemeral()).await.unwrap();
        bus.declare_queue("r2", QueueOptions::ephemeral()).await.unwrap();
        bus.bind_queue("r1", "resp", "r1").await.unwrap();
        bus.bind_queue("r2", "resp", "r2").await.unwrap();

        bus.publish("resp", "r2", Bytes::from_static(b"for-r2")).await.unwrap();
        bus.publish("resp", "nobody", Bytes::from_static(b"lost")).await.unwrap();

        assert_eq!(broker.queue_depth("r1").unwrap().ready, 0);
        assert_eq!(broker.queue_depth("r2").unwrap().ready, 1);
        assert_eq!(broker.stats().unroutable, 1);
    }

    #[tokio::test]
    async fn test_requeue_redelivers_at_head() {
        let broker = Broker::new();
        let bus = broker.connect();
        fanout_with_queues(&bus, &["q"]).await;
        bus.publish("fan", "", Bytes::from_static(b"first")).await.unwrap();
        bus.publish("fan", "", Bytes::from_static(b"second")).await.unwrap();

        let mut sub = bus.consume("q").await.unwrap();
        let first = next(&mut sub).await;
        let second = next(&mut sub).await;
        assert_eq!(&second.body[..], b"second");
        second.ack().unwrap();

        first.requeue().unwrap();
        let again = next(&mut sub).await;
        assert_eq!(&again.body[..], b"first");
        assert_eq!(again.delivery_count, 2);
        assert!(again.is_redelivery());
        again.ack().unwrap();

        assert_eq!(broker.queue_depth("q").unwrap(), QueueDepth { ready: 0, unacked: 0, consumers: 1 });
    }

    #[tokio::test]
    async fn test_discard_is_final() {
        let broker = Broker::new();
        let bus = broker.connect();
        fanout_with_queues(&bus, &["q"]).await;
        bus.publish("fan", "", Bytes::from_static(b"junk")).await.unwrap();

        let mut sub = bus.consume("q").await.unwrap();
        next(&mut sub).await.discard().unwrap();

        let depth = broker.queue_depth("q").unwrap();
        assert_eq!(depth.ready + depth.unacked, 0);
        assert_eq!(broker.stats().discarded, 1);
    }

    #[tokio::test]
    async fn test_dropped_delivery_is_requeued() {
        let broker = Broker::new();
        let bus = broker.connect();
        fanout_with_queues(&bus, &["q"]).await;
        bus.publish("fan", "", Bytes::from_static(b"m")).await.unwrap();

        let mut sub = bus.consume("q").await.unwrap();
        drop(next(&mut sub).await);

        let d = next(&mut sub).await;
        assert_eq!(d.delivery_count, 2);
        d.ack().unwrap();
    }

    #[tokio::test]
    async fn test_delivery_limit_drops_message() {
        let broker = Broker::new();
        let bus = broker.connect();
        bus.declare_exchange("fan", ExchangeKind::Fanout).await.unwrap();
        bus.declare_queue("q", QueueOptions::durable().with_max_deliveries(Some(2)))
            .await
            .unwrap();
        bus.bind_queue("q", "fan", "").await.unwrap();
        bus.publish("fan", "", Bytes::from_static(b"poison")).await.unwrap();

        let mut sub = bus.consume("q").await.unwrap();
        next(&mut sub).await.requeue().unwrap();
        next(&mut sub).await.requeue().unwrap();

        assert_eq!(broker.queue_depth("q").unwrap().ready, 0);
        assert_eq!(broker.stats().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_round_robin_between_consumers() {
        let broker = Broker::new();
        let bus = broker.connect();
        fanout_with_queues(&bus, &["q"]).await;

        let mut a = bus.consume("q").await.unwrap();
        let mut b = bus.consume("q").await.unwrap();
        for i in 0..4u8 {
            bus.publish("fan", "", Bytes::from(vec![i])).await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..2 {
            let d = next(&mut a).await;
            seen.push(d.body[0]);
            d.ack().unwrap();
            let d = next(&mut b).await;
            seen.push(d.body[0]);
            d.ack().unwrap();
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_exclusive_queue_lifecycle() {
        let broker = Broker::new();
        let owner = broker.connect();
        let other = broker.connect();

        owner.declare_queue("private", QueueOptions::ephemeral()).await.unwrap();
        assert!(matches!(
            other.consume("private").await,
            Err(Error::ResourceLocked(_))
        ));
        assert!(matches!(
            other.delete_queue("private").await,
            Err(Error::ResourceLocked(_))
        ));

        drop(owner);
        assert!(broker.queue_depth("private").is_none());
    }

    #[tokio::test]
    async fn test_auto_delete_after_last_consumer() {
        let broker = Broker::new();
        let bus = broker.connect();
        bus.declare_queue("tmp", QueueOptions::ephemeral()).await.unwrap();

        let sub = bus.consume("tmp").await.unwrap();
        assert_eq!(broker.queue_depth("tmp").unwrap().consumers, 1);
        drop(sub);
        assert!(broker.queue_depth("tmp").is_none());
    }

    #[tokio::test]
    async fn test_closing_connection_requeues_unacked() {
        let broker = Broker::new();
        let admin = broker.connect();
        fanout_with_queues(&admin, &["q"]).await;
        admin.publish("fan", "", Bytes::from_static(b"work")).await.unwrap();

        let worker = broker.connect();
        let mut sub = worker.consume("q").await.unwrap();
        let d = next(&mut sub).await;
        assert_eq!(broker.queue_depth("q").unwrap().unacked, 1);

        // Connection dies while the message is in hand
        std::mem::forget(d);
        drop(sub);
        drop(worker);

        let depth = broker.queue_depth("q").unwrap();
        assert_eq!(depth.ready, 1);
        assert_eq!(depth.unacked, 0);
    }

    #[tokio::test]
    async fn test_unknown_exchange_and_queue() {
        let broker = Broker::new();
        let bus = broker.connect();
        assert!(matches!(
            bus.publish("missing", "", Bytes::new()).await,
            Err(Error::ExchangeNotFound(_))
        ));
        assert!(matches!(bus.consume("missing").await, Err(Error::QueueNotFound(_))));
        assert!(matches!(
            bus.declare_exchange("fan", ExchangeKind::Fanout).await,
            Ok(())
        ));
        assert!(bus.declare_exchange("fan", ExchangeKind::Direct).await.is_err());
    }
}
