//! Broker connectivity.
//!
//! The pool and transport are generic over three small traits so any broker
//! client can sit underneath:
//!
//! - `Connector` dials a `BrokerConnection`
//! - `BrokerConnection` opens `BrokerChannel`s
//! - `BrokerChannel` declares exchanges and publishes
//!
//! `InMemoryBroker` implements all three for tests and demos.
//!
//! ```ignore
//! let broker = InMemoryBroker::new();
//! let pool = ChannelPool::new(broker.clone(), BrokerOptions::default());
//! {
//!     let mut channel = pool.rent()?;
//!     channel.publish("orders.created", &publishing, timeout)?;
//! } // channel goes back to the pool here
//! pool.dispose();
//! ```

mod in_memory;
mod options;
mod pool;

use std::time::Duration;

use thiserror::Error;

pub use in_memory::{Delivery, InMemoryBroker, InMemoryChannel, InMemoryConnection};
pub use options::{BrokerOptions, ExchangeKind, DEFAULT_POOL_SIZE};
pub use pool::{ChannelPool, PooledChannel};

/// Failures while connecting, opening channels or preparing them for use.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("failed to connect to broker: {0}")]
    Connect(String),

    #[error("failed to open channel: {0}")]
    Channel(String),

    #[error("failed to declare exchange {name}: {reason}")]
    Exchange { name: String, reason: String },

    #[error("failed to enable publisher confirms: {0}")]
    Confirm(String),

    #[error("channel pool is disposed")]
    PoolDisposed,

    #[error("broker lock poisoned during {0}")]
    LockPoisoned(&'static str),
}

/// Failures of a single publish on an open channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("broker rejected message: {0}")]
    Rejected(String),

    #[error("publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("channel is closed")]
    ChannelClosed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    Transient,
    Persistent,
}

/// A message as handed to the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Publishing {
    pub content_type: String,
    pub delivery_mode: DeliveryMode,
    pub message_id: String,
    pub body: Vec<u8>,
}

pub trait BrokerChannel: Send {
    /// Declare `name` if it does not exist yet. Redeclaring is a no-op.
    fn declare_exchange(&mut self, name: &str, kind: ExchangeKind, durable: bool) -> Result<(), ConnectionError>;

    fn enable_confirms(&mut self) -> Result<(), ConnectionError>;

    /// Publish and, in confirm mode, wait up to `timeout` for the ack.
    fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        publishing: &Publishing,
        timeout: Duration,
    ) -> Result<(), DeliveryError>;

    fn is_closed(&self) -> bool;

    fn close(&mut self);
}

pub trait BrokerConnection: Send {
    type Channel: BrokerChannel;

    fn open_channel(&mut self) -> Result<Self::Channel, ConnectionError>;

    fn is_closed(&self) -> bool;

    fn close(&mut self);
}

pub trait Connector: Send + Sync + 'static {
    type Connection: BrokerConnection;

    fn connect(&self, options: &BrokerOptions) -> Result<Self::Connection, ConnectionError>;
}
