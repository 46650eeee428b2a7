//! Bus Wire Frames
//!
//! Length-prefixed, CRC-checked bincode frames exchanged between
//! `RemoteBus` clients and a `BrokerServer`.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ExchangeKind, QueueOptions, Settlement};
use crate::error::{Error, Result};

/// Upper bound on a single frame body
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Broker operation requested by a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    DeclareExchange { name: String, kind: ExchangeKind },
    DeclareQueue { name: String, options: QueueOptions },
    Bind { queue: String, exchange: String, routing_key: String },
    DeleteQueue { name: String },
    Publish { exchange: String, routing_key: String, body: Vec<u8> },
    Consume { queue: String },
}

impl Operation {
    /// Get the operation name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Operation::DeclareExchange { .. } => "DeclareExchange",
            Operation::DeclareQueue { .. } => "DeclareQueue",
            Operation::Bind { .. } => "Bind",
            Operation::DeleteQueue { .. } => "DeleteQueue",
            Operation::Publish { .. } => "Publish",
            Operation::Consume { .. } => "Consume",
        }
    }
}

/// Successful outcome of an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Done,
    ConsumeOk { consumer_tag: u64 },
}

/// Broker error carried back to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireError {
    ExchangeNotFound(String),
    QueueNotFound(String),
    ResourceLocked(String),
    Other(String),
}

impl From<&Error> for WireError {
    fn from(e: &Error) -> Self {
        match e {
            Error::ExchangeNotFound(name) => WireError::ExchangeNotFound(name.clone()),
            Error::QueueNotFound(name) => WireError::QueueNotFound(name.clone()),
            Error::ResourceLocked(name) => WireError::ResourceLocked(name.clone()),
            other => WireError::Other(other.to_string()),
        }
    }
}

impl From<WireError> for Error {
    fn from(e: WireError) -> Self {
        match e {
            WireError::ExchangeNotFound(name) => Error::ExchangeNotFound(name),
            WireError::QueueNotFound(name) => Error::QueueNotFound(name),
            WireError::ResourceLocked(name) => Error::ResourceLocked(name),
            WireError::Other(message) => Error::Transport(message),
        }
    }
}

/// Frames exchanged over a bus connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    // ========== Client -> Broker ==========
    /// Operation awaiting a `Response` with the same sequence number
    Request { seq: u64, op: Operation },

    /// Settle a delivery previously received through `Deliver`
    Settle { tag: u64, settlement: Settlement },

    /// Stop a consumer
    Cancel { consumer_tag: u64 },

    // ========== Broker -> Client ==========
    /// Result of a `Request`
    Response {
        seq: u64,
        result: std::result::Result<Outcome, WireError>,
    },

    /// Message for a consumer
    Deliver {
        consumer_tag: u64,
        tag: u64,
        exchange: String,
        routing_key: String,
        delivery_count: u32,
        body: Vec<u8>,
    },

    /// The broker closed a consumer (its queue was deleted)
    ConsumerClosed { consumer_tag: u64 },
}

impl Frame {
    /// Serialize frame to bytes
    pub fn serialize(&self) -> std::result::Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize frame from bytes
    pub fn deserialize(bytes: &[u8]) -> std::result::Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the frame type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Frame::Request { .. } => "Request",
            Frame::Settle { .. } => "Settle",
            Frame::Cancel { .. } => "Cancel",
            Frame::Response { .. } => "Response",
            Frame::Deliver { .. } => "Deliver",
            Frame::ConsumerClosed { .. } => "ConsumerClosed",
        }
    }
}

/// Frame header for length-prefixed frames
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Body length
    pub length: u32,
    /// Body checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}

/// Read a framed message from a reader
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.length > MAX_FRAME_LEN {
        return Err(Error::Transport(format!(
            "frame of {} bytes exceeds limit",
            header.length
        )));
    }

    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    if crc32fast::hash(&body) != header.checksum {
        return Err(Error::Transport("Frame checksum mismatch".into()));
    }

    Ok(Frame::deserialize(&body)?)
}

/// Write a framed message to a writer
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let body = frame.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_over_pipe() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let frame = Frame::Request {
            seq: 7,
            op: Operation::Publish {
                exchange: "replication".into(),
                routing_key: String::new(),
                body: b"{}".to_vec(),
            },
        };
        write_frame(&mut client, &frame).await.unwrap();

        match read_frame(&mut server).await.unwrap() {
            Frame::Request { seq, op: Operation::Publish { exchange, body, .. } } => {
                assert_eq!(seq, 7);
                assert_eq!(exchange, "replication");
                assert_eq!(body, b"{}");
            }
            other => panic!("Wrong frame type: {}", other.type_name()),
        }
    }

    #[tokio::test]
    async fn test_corrupted_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let body = Frame::Cancel { consumer_tag: 1 }.serialize().unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 0xdead_beef;

        use tokio::io::AsyncWriteExt;
        client.write_all(&header.to_bytes()).await.unwrap();
        client.write_all(&body).await.unwrap();

        assert!(matches!(read_frame(&mut server).await, Err(Error::Transport(_))));
    }

    #[test]
    fn test_wire_error_mapping() {
        let err: Error = WireError::from(&Error::QueueNotFound("q".into())).into();
        assert!(matches!(err, Error::QueueNotFound(ref q) if q == "q"));

        let err: Error = WireError::from(&Error::Cancelled).into();
        assert!(matches!(err, Error::Transport(_)));
    }
}
