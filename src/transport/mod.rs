//! Delivery of persisted envelopes.
//!
//! A `Transport` sends one envelope to one route. The dispatcher owns a
//! transport and closes it once its queue is drained.
//!
//! - `BrokerTransport` - pooled channels on a broker `Connector`
//! - `LogTransport` - `[OUTBOX] route body` lines to a buffer or the log
//! - `EmitterTransport` - in-process listeners (requires `emitter` feature)

mod broker;
#[cfg(feature = "emitter")]
mod emitter;
mod log;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::broker::{ConnectionError, DeliveryError};
use crate::message::Envelope;

pub use broker::{BrokerTransport, CONTENT_TYPE, DEFAULT_PUBLISH_TIMEOUT};
#[cfg(feature = "emitter")]
pub use emitter::EmitterTransport;
pub use log::LogTransport;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to rent a channel: {0}")]
    Connection(#[from] ConnectionError),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to publish message: {0}")]
    Publish(String),

    #[error("publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport lock poisoned during {0}")]
    LockPoisoned(&'static str),
}

impl From<DeliveryError> for TransportError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::Timeout(waited) => TransportError::Timeout(waited),
            other => TransportError::Publish(other.to_string()),
        }
    }
}

pub trait Transport: Send + Sync {
    /// Send the envelope's payload to `route`. No retries.
    fn send(&self, route: &str, envelope: &Envelope) -> Result<(), TransportError>;

    /// Release broker resources. Safe to call more than once.
    fn close(&self) -> Result<(), TransportError>;

    /// Protocol version the destination is bound to, if it has one.
    fn version(&self) -> Option<&str> {
        None
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, route: &str, envelope: &Envelope) -> Result<(), TransportError> {
        (**self).send(route, envelope)
    }

    fn close(&self) -> Result<(), TransportError> {
        (**self).close()
    }

    fn version(&self) -> Option<&str> {
        (**self).version()
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&self, route: &str, envelope: &Envelope) -> Result<(), TransportError> {
        (**self).send(route, envelope)
    }

    fn close(&self) -> Result<(), TransportError> {
        (**self).close()
    }

    fn version(&self) -> Option<&str> {
        (**self).version()
    }
}
