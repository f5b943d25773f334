pub mod broker;
pub mod dispatch;
pub mod message;
pub mod publish;
pub mod storage;
pub mod transport;

pub use broker::{
    BrokerChannel, BrokerConnection, BrokerOptions, ChannelPool, ConnectionError, Connector, DeliveryError,
    DeliveryMode, ExchangeKind, InMemoryBroker, PooledChannel, Publishing,
};
pub use dispatch::{Dispatch, DispatchError, Dispatcher, DispatcherConfig, DispatcherState, DispatcherStats};
pub use message::{headers, Envelope, Message, MessageStatus, OutboxOptions};
pub use publish::{OutboxPublisher, Publish, PublishError, PublisherConfig};
pub use storage::{
    DataStorage, InMemoryStorage, InMemoryTransaction, StorageError, StorageInitializer, Transaction,
    TransactionHandle, TransactionRegistry,
};
#[cfg(feature = "sqlite")]
pub use storage::{SqliteInitializer, SqliteStorage, SqliteTransaction};
#[cfg(feature = "emitter")]
pub use transport::EmitterTransport;
pub use transport::{BrokerTransport, LogTransport, Transport, TransportError};

// Re-export the EventEmitter from the event_emitter_rs crate
#[cfg(feature = "emitter")]
pub use event_emitter_rs::EventEmitter;
