//! Replibus - Broadcast SQL Replication over a Message Bus
//!
//! Writers broadcast SQL mutations to every replica through a fan-out
//! exchange; readers broadcast a query and take the first reply routed back
//! to their private, single-use queue.
//!
//! # Architecture
//!
//! Roles never talk to each other directly. Each replica consumes its own
//! durable queue `replica_<id>` bound to the `replication` exchange and
//! applies every command to its local store. Replies travel through the
//! `response` direct exchange under the request id.
//!
//! Replicas apply writes independently: there is no ordering across
//! concurrent writers and no detection of divergence between replicas.
//!
//! # Features
//!
//! - In-process broker with fan-out and direct exchanges, served over TCP
//! - At-least-once delivery with ack / requeue / discard settlement
//! - Applied ledger that keeps redelivered writes from being re-applied
//! - Correlated reads with a mandatory reply deadline
//! - PostgreSQL and SQLite replica stores
//! - HTTP status API for replicas

pub mod api;
pub mod bus;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod replica;
pub mod state;
pub mod store;

pub use config::ReplibusConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::bus::{Broker, BrokerServer, Delivery, MemoryBus, MessageBus, RemoteBus};
    pub use crate::client::{ReadMode, Reader, Writer};
    pub use crate::config::ReplibusConfig;
    pub use crate::error::{Error, Result};
    pub use crate::protocol::{Command, CommandId, Record, Reply};
    pub use crate::replica::Replica;
    pub use crate::state::AppliedLedger;
    pub use crate::store::{SqliteStore, Store};
}
