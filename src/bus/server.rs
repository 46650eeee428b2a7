//! Broker Server
//!
//! TCP front end for a [`Broker`]. Every accepted socket becomes one broker
//! connection; closing the socket requeues whatever it held unsettled and
//! removes its exclusive queues.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::frame::{read_frame, write_frame, Frame, Operation, Outcome, WireError};
use super::{Broker, Delivery, MemoryBus, MessageBus};
use crate::error::{Error, Result};

/// Deliveries handed to a remote client and not yet settled by it
type Outstanding = Arc<Mutex<HashMap<u64, Delivery>>>;

/// Network server exposing a broker
pub struct BrokerServer {
    /// Bind address
    bind_address: String,
    /// Broker shared by all connections
    broker: Arc<Broker>,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl BrokerServer {
    pub fn new(bind_address: String, broker: Arc<Broker>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            bind_address,
            broker,
            shutdown: shutdown_tx,
        }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Bind and serve until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!("Broker listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let bus = self.broker.connect();
                            let shutdown_rx = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                tracing::debug!("Bus client {} connected", peer_addr);
                                if let Err(e) = handle_connection(socket, bus, shutdown_rx).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                                tracing::debug!("Bus client {} disconnected", peer_addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Broker server stopped");
        Ok(())
    }

    /// Stop accepting and drop every connection
    ///
    /// Takes effect even when called before `serve` starts.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Serve one client socket until it closes
async fn handle_connection(
    socket: TcpStream,
    bus: MemoryBus,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                tracing::debug!("Write to bus client failed: {}", e);
                break;
            }
        }
    });

    let outstanding: Outstanding = Arc::new(Mutex::new(HashMap::new()));
    let mut consumers: HashMap<u64, CancellationToken> = HashMap::new();

    let result = loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break Ok(());
                }
                continue;
            }
        };

        match frame {
            Ok(Frame::Request { seq, op }) => {
                tracing::trace!("Bus request {} #{}", op.type_name(), seq);
                let result = match execute(&bus, op).await {
                    Ok(Executed::Done) => Ok(Outcome::Done),
                    Ok(Executed::Consuming(sub)) => {
                        let consumer_tag = sub.consumer_tag();
                        let token = CancellationToken::new();
                        consumers.insert(consumer_tag, token.clone());

                        // Response is queued before any delivery for this consumer
                        let _ = out_tx.send(Frame::Response {
                            seq,
                            result: Ok(Outcome::ConsumeOk { consumer_tag }),
                        });
                        tokio::spawn(forward_deliveries(
                            sub,
                            token,
                            out_tx.clone(),
                            Arc::clone(&outstanding),
                        ));
                        continue;
                    }
                    Err(e) => Err(WireError::from(&e)),
                };
                if out_tx.send(Frame::Response { seq, result }).is_err() {
                    break Err(Error::ChannelClosed);
                }
            }
            Ok(Frame::Settle { tag, settlement }) => {
                let delivery = outstanding
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&tag);
                match delivery {
                    Some(delivery) => {
                        if let Err(e) = delivery.settle(settlement) {
                            tracing::warn!("Failed to settle delivery {}: {}", tag, e);
                        }
                    }
                    None => tracing::debug!("Client settled unknown delivery {}", tag),
                }
            }
            Ok(Frame::Cancel { consumer_tag }) => {
                if let Some(token) = consumers.remove(&consumer_tag) {
                    token.cancel();
                }
            }
            Ok(other) => {
                tracing::warn!("Unexpected {} frame from bus client", other.type_name());
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break Ok(());
            }
            Err(e) => break Err(e),
        }
    };

    for token in consumers.values() {
        token.cancel();
    }
    // Unsettled deliveries go back to their queues before the connection closes
    let unsettled: Vec<Delivery> = outstanding
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .drain()
        .map(|(_, d)| d)
        .collect();
    drop(unsettled);
    drop(out_tx);
    drop(bus);
    writer_task.abort();

    result
}

enum Executed {
    Done,
    Consuming(super::Subscription),
}

async fn execute(bus: &MemoryBus, op: Operation) -> Result<Executed> {
    match op {
        Operation::DeclareExchange { name, kind } => bus.declare_exchange(&name, kind).await?,
        Operation::DeclareQueue { name, options } => bus.declare_queue(&name, options).await?,
        Operation::Bind {
            queue,
            exchange,
            routing_key,
        } => bus.bind_queue(&queue, &exchange, &routing_key).await?,
        Operation::DeleteQueue { name } => bus.delete_queue(&name).await?,
        Operation::Publish {
            exchange,
            routing_key,
            body,
        } => bus.publish(&exchange, &routing_key, Bytes::from(body)).await?,
        Operation::Consume { queue } => return Ok(Executed::Consuming(bus.consume(&queue).await?)),
    }
    Ok(Executed::Done)
}

/// Relay one consumer's deliveries to the socket, parking them until settled
async fn forward_deliveries(
    mut sub: super::Subscription,
    token: CancellationToken,
    out_tx: mpsc::UnboundedSender<Frame>,
    outstanding: Outstanding,
) {
    let consumer_tag = sub.consumer_tag();

    loop {
        let delivery = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            d = sub.recv() => d,
        };
        let Some(delivery) = delivery else {
            let _ = out_tx.send(Frame::ConsumerClosed { consumer_tag });
            return;
        };

        let frame = Frame::Deliver {
            consumer_tag,
            tag: delivery.tag(),
            exchange: delivery.exchange.clone(),
            routing_key: delivery.routing_key.clone(),
            delivery_count: delivery.delivery_count,
            body: delivery.body.to_vec(),
        };
        // Park before sending so a fast settle finds it
        outstanding
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(delivery.tag(), delivery);
        if out_tx.send(frame).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_server_stop() {
        let server = Arc::new(BrokerServer::new("127.0.0.1:0".to_string(), Broker::new()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let running = Arc::clone(&server);
        let handle = tokio::spawn(async move { running.serve(listener).await });
        server.stop();

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_stop_before_serve() {
        let server = BrokerServer::new("127.0.0.1:0".to_string(), Broker::new());
        server.stop();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let result = tokio::time::timeout(std::time::Duration::from_secs(1), server.serve(listener))
            .await
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_stop_closes_connections() {
        let server = Arc::new(BrokerServer::new("127.0.0.1:0".to_string(), Broker::new()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let running = Arc::clone(&server);
        let handle = tokio::spawn(async move { running.serve(listener).await });

        let mut socket = TcpStream::connect(address).await.unwrap();
        // A round trip proves the connection task is running
        let request = Frame::Request {
            seq: 1,
            op: Operation::Publish {
                exchange: "missing".into(),
                routing_key: String::new(),
                body: Vec::new(),
            },
        };
        write_frame(&mut socket, &request).await.unwrap();
        match read_frame(&mut socket).await.unwrap() {
            Frame::Response { seq, result } => {
                assert_eq!(seq, 1);
                assert!(matches!(result, Err(WireError::ExchangeNotFound(_))));
            }
            other => panic!("Wrong frame type: {}", other.type_name()),
        }

        server.stop();

        let closed = tokio::time::timeout(std::time::Duration::from_secs(1), read_frame(&mut socket))
            .await
            .unwrap();
        assert!(closed.is_err());
        handle.await.unwrap().unwrap();
    }
}
