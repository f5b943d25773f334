use std::time::Duration;

use tracing::{debug, info, warn};

use super::{Transport, TransportError};
use crate::broker::{BrokerOptions, ChannelPool, Connector, DeliveryMode, Publishing};
use crate::message::Envelope;

pub const CONTENT_TYPE: &str = "text/plain";
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Sends envelopes over channels rented from a `ChannelPool`.
pub struct BrokerTransport<C: Connector> {
    pool: ChannelPool<C>,
    publish_timeout: Duration,
}

impl<C: Connector> BrokerTransport<C> {
    pub fn new(connector: C, options: BrokerOptions) -> Self {
        Self {
            pool: ChannelPool::new(connector, options),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn pool(&self) -> &ChannelPool<C> {
        &self.pool
    }
}

impl<C: Connector> Transport for BrokerTransport<C> {
    fn send(&self, route: &str, envelope: &Envelope) -> Result<(), TransportError> {
        let body = envelope.body()?;
        let mut channel = self.pool.rent()?;

        let publishing = Publishing {
            content_type: CONTENT_TYPE.to_string(),
            delivery_mode: DeliveryMode::Persistent,
            message_id: envelope.id.to_string(),
            body,
        };
        if let Err(err) = channel.publish(route, &publishing, self.publish_timeout) {
            warn!(id = envelope.id, route = %route, error = %err, "Failed to publish message");
            return Err(err.into());
        }

        debug!(
            id = envelope.id,
            route = %route,
            exchange = %self.pool.exchange(),
            body = %String::from_utf8_lossy(&publishing.body),
            "Sent message"
        );
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        info!("Closing broker transport");
        self.pool.dispose();
        Ok(())
    }

    fn version(&self) -> Option<&str> {
        Some(self.pool.options().outbox.version.as_str())
    }
}
