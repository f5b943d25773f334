use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use super::{
    BrokerChannel, BrokerConnection, BrokerOptions, ConnectionError, Connector, DeliveryError, ExchangeKind,
    Publishing,
};

/// A message accepted by the in-memory broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub publishing: Publishing,
}

impl Delivery {
    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.publishing.body)
    }
}

#[derive(Default)]
struct BrokerState {
    deliveries: Mutex<Vec<Delivery>>,
    exchanges: Mutex<HashMap<String, ExchangeKind>>,
    refuse_connections: AtomicBool,
    failing_publishes: AtomicUsize,
    publish_delay_ms: AtomicUsize,
    connection_generation: AtomicUsize,
    channel_generation: AtomicUsize,
    connections_opened: AtomicUsize,
    connections_open: AtomicUsize,
    channels_opened: AtomicUsize,
}

/// Broker living in process memory, with hooks for injecting faults.
///
/// Clones share the same state, so a test can keep one handle while the
/// pool owns another.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.state
            .deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn deliveries_to(&self, routing_key: &str) -> Vec<Delivery> {
        self.deliveries()
            .into_iter()
            .filter(|delivery| delivery.routing_key == routing_key)
            .collect()
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.state
            .exchanges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Reject the next `count` publishes.
    pub fn fail_next_publishes(&self, count: usize) {
        self.state.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Delay every publish by `delay`. A delay longer than the publish
    /// timeout makes the publish time out.
    pub fn set_publish_delay(&self, delay: Duration) {
        let millis = usize::try_from(delay.as_millis()).unwrap_or(usize::MAX);
        self.state.publish_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Drop every open connection, as if the broker went away.
    pub fn close_connections(&self) {
        self.state.connection_generation.fetch_add(1, Ordering::SeqCst);
        self.state.connections_open.store(0, Ordering::SeqCst);
    }

    /// Close every open channel while keeping connections up.
    pub fn close_channels(&self) {
        self.state.channel_generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connections_opened(&self) -> usize {
        self.state.connections_opened.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self) -> usize {
        self.state.connections_open.load(Ordering::SeqCst)
    }

    pub fn channels_opened(&self) -> usize {
        self.state.channels_opened.load(Ordering::SeqCst)
    }
}

impl Connector for InMemoryBroker {
    type Connection = InMemoryConnection;

    fn connect(&self, options: &BrokerOptions) -> Result<InMemoryConnection, ConnectionError> {
        if self.state.refuse_connections.load(Ordering::SeqCst) {
            return Err(ConnectionError::Connect(format!(
                "connection refused by {}:{}",
                options.host, options.port
            )));
        }
        self.state.connections_opened.fetch_add(1, Ordering::SeqCst);
        self.state.connections_open.fetch_add(1, Ordering::SeqCst);
        Ok(InMemoryConnection {
            state: Arc::clone(&self.state),
            generation: self.state.connection_generation.load(Ordering::SeqCst),
            closed: false,
        })
    }
}

pub struct InMemoryConnection {
    state: Arc<BrokerState>,
    generation: usize,
    closed: bool,
}

impl BrokerConnection for InMemoryConnection {
    type Channel = InMemoryChannel;

    fn open_channel(&mut self) -> Result<InMemoryChannel, ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Channel("connection is closed".to_string()));
        }
        self.state.channels_opened.fetch_add(1, Ordering::SeqCst);
        Ok(InMemoryChannel {
            state: Arc::clone(&self.state),
            connection_generation: self.generation,
            generation: self.state.channel_generation.load(Ordering::SeqCst),
            closed: false,
            confirms: false,
        })
    }

    fn is_closed(&self) -> bool {
        self.closed || self.generation != self.state.connection_generation.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        if !self.is_closed() {
            self.state.connections_open.fetch_sub(1, Ordering::SeqCst);
        }
        self.closed = true;
    }
}

pub struct InMemoryChannel {
    state: Arc<BrokerState>,
    connection_generation: usize,
    generation: usize,
    closed: bool,
    confirms: bool,
}

impl InMemoryChannel {
    pub fn confirms_enabled(&self) -> bool {
        self.confirms
    }
}

impl BrokerChannel for InMemoryChannel {
    fn declare_exchange(&mut self, name: &str, kind: ExchangeKind, _durable: bool) -> Result<(), ConnectionError> {
        let mut exchanges = self
            .state
            .exchanges
            .lock()
            .map_err(|_| ConnectionError::LockPoisoned("declare exchange"))?;
        match exchanges.get(name) {
            Some(existing) if *existing != kind => Err(ConnectionError::Exchange {
                name: name.to_string(),
                reason: format!("already declared as {}", existing.as_str()),
            }),
            Some(_) => Ok(()),
            None => {
                exchanges.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    fn enable_confirms(&mut self) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Confirm("channel is closed".to_string()));
        }
        self.confirms = true;
        Ok(())
    }

    fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        publishing: &Publishing,
        timeout: Duration,
    ) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::ChannelClosed);
        }

        let delay = Duration::from_millis(self.state.publish_delay_ms.load(Ordering::SeqCst) as u64);
        if delay > timeout {
            thread::sleep(timeout);
            return Err(DeliveryError::Timeout(timeout));
        }
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let injected = self
            .state
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(DeliveryError::Rejected("injected publish failure".to_string()));
        }

        let declared = self
            .state
            .exchanges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(exchange);
        if !declared {
            // A real broker closes the channel on a publish to a missing exchange.
            self.closed = true;
            return Err(DeliveryError::Rejected(format!("no exchange '{exchange}'")));
        }

        self.state
            .deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Delivery {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                publishing: publishing.clone(),
            });
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
            || self.generation != self.state.channel_generation.load(Ordering::SeqCst)
            || self.connection_generation != self.state.connection_generation.load(Ordering::SeqCst)
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
