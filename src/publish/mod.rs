//! The outbox coordinator.
//!
//! `publish` persists the envelope first, inside the caller's transaction when
//! one is registered for the message id, and only then hands it to the
//! dispatcher:
//!
//! ```ignore
//! let publisher = OutboxPublisher::new(storage.clone(), dispatcher.clone(), PublisherConfig::default());
//!
//! // standalone
//! publisher.publish("orders.created", Message::encode(id, &order)?)?;
//!
//! // joined to the caller's own writes
//! let tx = publisher.begin_transaction(id)?;
//! insert_order(&tx, &order)?;
//! publisher.publish("orders.created", Message::encode(id, &order)?)?; // commits `tx`
//! ```

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::dispatch::Dispatch;
use crate::message::{headers, Envelope, Message};
use crate::storage::{DataStorage, StorageError, Transaction, TransactionHandle};

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to persist message: {0}")]
    Persistence(#[from] StorageError),
}

pub trait Publish: Send + Sync {
    fn publish(&self, route: &str, message: Message) -> Result<(), PublishError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublisherConfig {
    /// Attach `msg-name`, `msg-type`, `msg-sent-time` and `msg-id` headers.
    pub stamp_headers: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self { stamp_headers: true }
    }
}

impl PublisherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stamp_headers(mut self, stamp_headers: bool) -> Self {
        self.stamp_headers = stamp_headers;
        self
    }
}

/// Persists messages, then enqueues them for delivery.
///
/// Envelopes carry the protocol version from the storage's `OutboxOptions`.
///
/// A failed enqueue never fails the publish: the row is already stored as
/// `Scheduled`, which is the durable record of intent.
pub struct OutboxPublisher {
    storage: Arc<dyn DataStorage>,
    dispatcher: Arc<dyn Dispatch>,
    config: PublisherConfig,
}

impl OutboxPublisher {
    pub fn new(storage: Arc<dyn DataStorage>, dispatcher: Arc<dyn Dispatch>, config: PublisherConfig) -> Self {
        Self {
            storage,
            dispatcher,
            config,
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Open a transaction that a later `publish` of message `id` will join.
    pub fn begin_transaction(&self, id: i64) -> Result<TransactionHandle, PublishError> {
        Ok(self.storage.begin_transaction(id)?)
    }

    pub fn set_tx(&self, id: i64, handle: TransactionHandle) {
        self.storage.set_tx(id, handle);
    }

    pub fn get_tx(&self, id: i64) -> Option<TransactionHandle> {
        self.storage.get_tx(id)
    }

    /// Serialize `payload` into a message and publish it.
    pub fn publish_payload<T: Serialize>(&self, route: &str, id: i64, payload: &T) -> Result<(), PublishError> {
        self.publish(route, Message::encode(id, payload)?)
    }

    /// Publish inside `tx`, then commit it. `tx` is rolled back if the
    /// envelope insert fails.
    pub fn publish_in(&self, tx: &dyn Transaction, route: &str, message: Message) -> Result<(), PublishError> {
        let envelope = self.prepare(route, message)?;
        // The handle is consumed here, so it must not be joined again.
        self.storage.registry().take(envelope.id);
        self.storage.store_message_in(tx, &envelope)?;
        debug!(id = envelope.id, route = %route, "Stored message in caller transaction");
        self.enqueue(envelope);
        Ok(())
    }

    fn prepare(&self, route: &str, mut message: Message) -> Result<Envelope, PublishError> {
        let sent = Utc::now();
        if self.config.stamp_headers {
            let type_tag = message.type_tag().to_string();
            message.headers.insert(headers::NAME.to_string(), route.to_string());
            message.headers.insert(headers::TYPE.to_string(), type_tag);
            message.headers.insert(headers::SENT_TIME.to_string(), sent.to_rfc3339());
            message.headers.insert(headers::ID.to_string(), message.id.to_string());
        }
        let mut envelope = Envelope::for_message(route, &message, &self.storage.options().version)?;
        envelope.added = sent;
        Ok(envelope)
    }

    fn enqueue(&self, envelope: Envelope) {
        let id = envelope.id;
        if let Err(err) = self.dispatcher.enqueue_to_publish(envelope) {
            warn!(id, error = %err, "Message stored but not enqueued, it stays scheduled");
        }
    }
}

impl Publish for OutboxPublisher {
    fn publish(&self, route: &str, message: Message) -> Result<(), PublishError> {
        let envelope = self.prepare(route, message)?;

        if self.storage.get_tx(envelope.id).is_some() {
            self.storage.store_message_with_transaction(&envelope)?;
            debug!(id = envelope.id, route = %route, "Stored message in registered transaction");
        } else {
            self.storage.store_message(&envelope)?;
            debug!(id = envelope.id, route = %route, "Stored message");
        }

        self.enqueue(envelope);
        Ok(())
    }
}
