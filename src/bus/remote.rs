//! Remote Bus Client
//!
//! One TCP connection to a `BrokerServer`. Requests are correlated to their
//! responses by sequence number; deliveries are routed to the matching
//! subscription by consumer tag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::frame::{read_frame, write_frame, Frame, Operation, Outcome, WireError};
use super::{
    BusChannel, Delivery, DeliveryHandle, ExchangeKind, MessageBus, QueueOptions, Settlement,
    Subscription,
};
use crate::error::{Error, Result};

type ResponseTx = oneshot::Sender<std::result::Result<Outcome, WireError>>;

/// A request waiting for its response
struct Waiter {
    tx: ResponseTx,
    /// Registered by the reader task on `ConsumeOk`, before any delivery can arrive
    consumer: Option<mpsc::UnboundedSender<Delivery>>,
}

#[derive(Default)]
struct Routing {
    waiters: HashMap<u64, Waiter>,
    consumers: HashMap<u64, mpsc::UnboundedSender<Delivery>>,
    closed: bool,
}

type SharedRouting = Arc<Mutex<Routing>>;

fn lock(routing: &SharedRouting) -> std::sync::MutexGuard<'_, Routing> {
    routing.lock().unwrap_or_else(|e| e.into_inner())
}

/// Settlement and cancellation path back to the broker
struct RemoteChannel {
    out_tx: mpsc::UnboundedSender<Frame>,
    routing: SharedRouting,
}

impl BusChannel for RemoteChannel {
    fn settle(&self, tag: u64, settlement: Settlement) -> Result<()> {
        self.out_tx
            .send(Frame::Settle { tag, settlement })
            .map_err(|_| Error::ChannelClosed)
    }

    fn cancel(&self, consumer_tag: u64) {
        lock(&self.routing).consumers.remove(&consumer_tag);
        let _ = self.out_tx.send(Frame::Cancel { consumer_tag });
    }
}

/// Message bus connection over TCP
pub struct RemoteBus {
    address: String,
    channel: Arc<RemoteChannel>,
    routing: SharedRouting,
    next_seq: AtomicU64,
    request_timeout: Duration,
    reader_task: JoinHandle<()>,
}

impl RemoteBus {
    /// Connect to a broker server
    pub async fn connect(
        address: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let stream = match timeout(connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::ConnectionFailed {
                    address: address.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(Error::ConnectionTimeout(address.to_string())),
        };
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    tracing::warn!("Bus write failed: {}", e);
                    break;
                }
            }
        });

        let routing: SharedRouting = Arc::new(Mutex::new(Routing::default()));
        let channel = Arc::new(RemoteChannel {
            out_tx,
            routing: Arc::clone(&routing),
        });

        let reader_routing = Arc::clone(&routing);
        let reader_channel: Arc<dyn BusChannel> = Arc::clone(&channel) as Arc<dyn BusChannel>;
        let peer = address.to_string();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader).await {
                    Ok(frame) => route_frame(frame, &reader_routing, &reader_channel),
                    Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        tracing::info!("Bus connection to {} closed", peer);
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Bus connection to {} failed: {}", peer, e);
                        break;
                    }
                }
            }
            close_routing(&reader_routing);
        });

        Ok(Self {
            address: address.to_string(),
            channel,
            routing,
            next_seq: AtomicU64::new(1),
            request_timeout,
            reader_task,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send a request and wait for its response
    async fn request(
        &self,
        op: Operation,
        consumer: Option<mpsc::UnboundedSender<Delivery>>,
    ) -> Result<Outcome> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let name = op.type_name();
        let (tx, rx) = oneshot::channel();

        {
            let mut routing = lock(&self.routing);
            if routing.closed {
                return Err(Error::ChannelClosed);
            }
            routing.waiters.insert(seq, Waiter { tx, consumer });
        }

        if self.channel.out_tx.send(Frame::Request { seq, op }).is_err() {
            lock(&self.routing).waiters.remove(&seq);
            return Err(Error::ChannelClosed);
        }

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result.map_err(Error::from),
            Ok(Err(_)) => Err(Error::ChannelClosed),
            Err(_) => {
                lock(&self.routing).waiters.remove(&seq);
                Err(Error::ConnectionTimeout(format!("{} ({})", self.address, name)))
            }
        }
    }
}

impl Drop for RemoteBus {
    fn drop(&mut self) {
        self.reader_task.abort();
        close_routing(&self.routing);
        // The writer drains and closes the socket once the last delivery handle is gone
    }
}

/// Dispatch one frame received from the broker
fn route_frame(frame: Frame, routing: &SharedRouting, channel: &Arc<dyn BusChannel>) {
    match frame {
        Frame::Response { seq, result } => {
            let mut guard = lock(routing);
            let Some(waiter) = guard.waiters.remove(&seq) else {
                drop(guard);
                tracing::debug!("Response for abandoned request #{}", seq);
                if let Ok(Outcome::ConsumeOk { consumer_tag }) = result {
                    channel.cancel(consumer_tag);
                }
                return;
            };
            if let (Ok(Outcome::ConsumeOk { consumer_tag }), Some(consumer)) =
                (&result, waiter.consumer)
            {
                guard.consumers.insert(*consumer_tag, consumer);
            }
            drop(guard);
            let _ = waiter.tx.send(result);
        }
        Frame::Deliver {
            consumer_tag,
            tag,
            exchange,
            routing_key,
            delivery_count,
            body,
        } => {
            let delivery = Delivery::new(
                Bytes::from(body),
                exchange,
                routing_key,
                delivery_count,
                DeliveryHandle::new(tag, Arc::clone(channel)),
            );
            let consumer = lock(routing).consumers.get(&consumer_tag).cloned();
            match consumer {
                // A failed send drops the delivery, which requeues it
                Some(tx) => {
                    let _ = tx.send(delivery);
                }
                None => {
                    tracing::debug!("Delivery {} for cancelled consumer {}", tag, consumer_tag);
                    // Stop the consumer before the dropped delivery is requeued to it
                    channel.cancel(consumer_tag);
                    drop(delivery);
                }
            }
        }
        Frame::ConsumerClosed { consumer_tag } => {
            lock(routing).consumers.remove(&consumer_tag);
        }
        other => {
            tracing::warn!("Unexpected {} frame from broker", other.type_name());
        }
    }
}

fn close_routing(routing: &SharedRouting) {
    let mut routing = lock(routing);
    routing.closed = true;
    // Dropping the senders fails pending requests and ends subscriptions
    routing.waiters.clear();
    routing.consumers.clear();
}

#[async_trait::async_trait]
impl MessageBus for RemoteBus {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        self.request(
            Operation::DeclareExchange {
                name: name.to_string(),
                kind,
            },
            None,
        )
        .await
        .map(|_| ())
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        self.request(
            Operation::DeclareQueue {
                name: name.to_string(),
                options,
            },
            None,
        )
        .await
        .map(|_| ())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.request(
            Operation::Bind {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            },
            None,
        )
        .await
        .map(|_| ())
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.request(
            Operation::DeleteQueue {
                name: queue.to_string(),
            },
            None,
        )
        .await
        .map(|_| ())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: Bytes) -> Result<()> {
        self.request(
            Operation::Publish {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: body.to_vec(),
            },
            None,
        )
        .await
        .map(|_| ())
    }

    async fn consume(&self, queue: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let outcome = self
            .request(
                Operation::Consume {
                    queue: queue.to_string(),
                },
                Some(tx),
            )
            .await?;

        match outcome {
            Outcome::ConsumeOk { consumer_tag } => Ok(Subscription::new(
                consumer_tag,
                queue.to_string(),
                rx,
                Arc::clone(&self.channel) as Arc<dyn BusChannel>,
            )),
            Outcome::Done => Err(Error::Transport("broker did not return a consumer tag".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Broker, BrokerServer};
    use tokio::net::TcpListener;

    async fn start_server() -> (Arc<BrokerServer>, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let server = Arc::new(BrokerServer::new(address.clone(), Broker::new()));
        let running = Arc::clone(&server);
        tokio::spawn(async move { running.serve(listener).await });
        (server, address)
    }

    async fn connect(address: &str) -> RemoteBus {
        RemoteBus::connect(address, Duration::from_secs(1), Duration::from_secs(2))
            .await
            .unwrap()
    }

    async fn next(sub: &mut Subscription) -> Delivery {
        tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("delivery timed out")
            .expect("subscription closed")
    }

    #[tokio::test]
    async fn test_connection_failure() {
        let result = RemoteBus::connect(
            "127.0.0.1:1",
            Duration::from_millis(200),
            Duration::from_millis(200),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_publish_consume_ack_over_tcp() {
        let (server, address) = start_server().await;
        let bus = connect(&address).await;

        bus.declare_exchange("fan", ExchangeKind::Fanout).await.unwrap();
        bus.declare_queue("q", QueueOptions::durable()).await.unwrap();
        bus.bind_queue("q", "fan", "").await.unwrap();
        bus.publish("fan", "", Bytes::from_static(b"payload")).await.unwrap();

        let mut sub = bus.consume("q").await.unwrap();
        let d = next(&mut sub).await;
        assert_eq!(&d.body[..], b"payload");
        assert_eq!(d.exchange, "fan");
        d.ack().unwrap();

        // Settle frames are fire-and-forget; a round trip orders them before the check
        bus.declare_exchange("fan", ExchangeKind::Fanout).await.unwrap();
        assert_eq!(server.broker().stats().acked, 1);
        assert_eq!(server.broker().queue_depth("q").unwrap().unacked, 0);
    }

    #[tokio::test]
    async fn test_remote_errors_map_back() {
        let (_server, address) = start_server().await;
        let bus = connect(&address).await;

        assert!(matches!(
            bus.publish("nope", "", Bytes::new()).await,
            Err(Error::ExchangeNotFound(_))
        ));
        assert!(matches!(bus.consume("nope").await, Err(Error::QueueNotFound(_))));
    }

    #[tokio::test]
    async fn test_requeue_over_tcp() {
        let (_server, address) = start_server().await;
        let bus = connect(&address).await;
        bus.declare_exchange("fan", ExchangeKind::Fanout).await.unwrap();
        bus.declare_queue("q", QueueOptions::durable()).await.unwrap();
        bus.bind_queue("q", "fan", "").await.unwrap();
        bus.publish("fan", "", Bytes::from_static(b"retry-me")).await.unwrap();

        let mut sub = bus.consume("q").await.unwrap();
        next(&mut sub).await.requeue().unwrap();
        let again = next(&mut sub).await;
        assert_eq!(again.delivery_count, 2);
        again.ack().unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_removes_exclusive_queue() {
        let (server, address) = start_server().await;
        let bus = connect(&address).await;
        bus.declare_queue("mine", QueueOptions::ephemeral()).await.unwrap();
        assert!(server.broker().queue_depth("mine").is_some());

        drop(bus);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while server.broker().queue_depth("mine").is_some() {
            assert!(tokio::time::Instant::now() < deadline, "queue was not removed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
