use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{
    BrokerChannel, BrokerConnection, BrokerOptions, ConnectionError, Connector, DeliveryError, Publishing,
};

type ChannelOf<C> = <<C as Connector>::Connection as BrokerConnection>::Channel;

/// Bounded free list of broker channels over one lazily opened connection.
///
/// Rented channels come back through `PooledChannel`'s `Drop`. Channels that
/// are closed, or that would push the free list past capacity, are closed
/// instead of pooled.
pub struct ChannelPool<C: Connector> {
    connector: C,
    options: BrokerOptions,
    exchange: String,
    capacity: AtomicUsize,
    occupancy: AtomicUsize,
    free: Mutex<Vec<ChannelOf<C>>>,
    connection: Mutex<Option<C::Connection>>,
    disposed: AtomicBool,
}

impl<C: Connector> ChannelPool<C> {
    pub fn new(connector: C, options: BrokerOptions) -> Self {
        let exchange = options.effective_exchange();
        info!(
            host = %options.host,
            port = options.port,
            username = %options.username,
            exchange = %exchange,
            pool_size = options.pool_size,
            "Broker channel pool configured"
        );
        Self {
            connector,
            capacity: AtomicUsize::new(options.pool_size),
            occupancy: AtomicUsize::new(0),
            free: Mutex::new(Vec::with_capacity(options.pool_size)),
            connection: Mutex::new(None),
            disposed: AtomicBool::new(false),
            exchange,
            options,
        }
    }

    /// Exchange every channel from this pool declares and publishes to.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.options
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Number of idle channels waiting in the free list.
    pub fn occupancy(&self) -> usize {
        self.occupancy.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Take an idle channel, or open a new one on the shared connection.
    pub fn rent(&self) -> Result<PooledChannel<'_, C>, ConnectionError> {
        if self.is_disposed() {
            return Err(ConnectionError::PoolDisposed);
        }

        while let Some(mut channel) = self.pop_free()? {
            if channel.is_closed() {
                debug!("Discarding closed pooled channel");
                channel.close();
                continue;
            }
            return Ok(PooledChannel::new(self, channel));
        }

        let channel = self.open_channel()?;
        Ok(PooledChannel::new(self, channel))
    }

    /// Put `channel` back into the free list, or close it.
    pub fn give_back(&self, mut channel: ChannelOf<C>) {
        if channel.is_closed() {
            channel.close();
            return;
        }

        let mut free = match self.free.lock() {
            Ok(free) => free,
            Err(_) => {
                warn!("Channel pool lock poisoned, closing returned channel");
                channel.close();
                return;
            }
        };
        if self.is_disposed() || free.len() >= self.capacity() {
            drop(free);
            channel.close();
            return;
        }
        free.push(channel);
        self.occupancy.store(free.len(), Ordering::SeqCst);
    }

    /// Close every idle channel and the connection. Later rents fail with
    /// `PoolDisposed`. Safe to call more than once.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.capacity.store(0, Ordering::SeqCst);

        let idle: Vec<_> = match self.free.lock() {
            Ok(mut free) => free.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        self.occupancy.store(0, Ordering::SeqCst);
        let closed = idle.len();
        for mut channel in idle {
            channel.close();
        }

        let connection = match self.connection.lock() {
            Ok(mut connection) => connection.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(mut connection) = connection {
            if !connection.is_closed() {
                connection.close();
            }
        }
        info!(channels = closed, "Broker channel pool disposed");
    }

    fn pop_free(&self) -> Result<Option<ChannelOf<C>>, ConnectionError> {
        let mut free = self
            .free
            .lock()
            .map_err(|_| ConnectionError::LockPoisoned("rent"))?;
        let channel = free.pop();
        self.occupancy.store(free.len(), Ordering::SeqCst);
        Ok(channel)
    }

    fn connection(&self) -> Result<MutexGuard<'_, Option<C::Connection>>, ConnectionError> {
        let mut guard = self
            .connection
            .lock()
            .map_err(|_| ConnectionError::LockPoisoned("connection"))?;

        let usable = guard.as_ref().is_some_and(|conn| !conn.is_closed());
        if !usable {
            if guard.is_some() {
                warn!("Broker connection closed, reconnecting");
            }
            *guard = Some(self.connector.connect(&self.options)?);
            info!(host = %self.options.host, port = self.options.port, "Connected to broker");
        }
        Ok(guard)
    }

    fn open_channel(&self) -> Result<ChannelOf<C>, ConnectionError> {
        let mut channel = {
            let mut guard = self.connection()?;
            match guard.as_mut() {
                Some(connection) => connection.open_channel()?,
                None => return Err(ConnectionError::Connect("no connection".to_string())),
            }
        };

        let prepared = channel
            .declare_exchange(&self.exchange, self.options.exchange_kind, true)
            .and_then(|()| {
                if self.options.publish_confirms {
                    channel.enable_confirms()
                } else {
                    Ok(())
                }
            });
        if let Err(err) = prepared {
            channel.close();
            return Err(err);
        }
        debug!(exchange = %self.exchange, "Opened broker channel");
        Ok(channel)
    }
}

/// A rented channel. Returned to its pool when dropped.
pub struct PooledChannel<'a, C: Connector> {
    pool: &'a ChannelPool<C>,
    channel: Option<ChannelOf<C>>,
}

impl<'a, C: Connector> PooledChannel<'a, C> {
    fn new(pool: &'a ChannelPool<C>, channel: ChannelOf<C>) -> Self {
        Self {
            pool,
            channel: Some(channel),
        }
    }

    /// Publish to the pool's exchange with `routing_key`.
    pub fn publish(
        &mut self,
        routing_key: &str,
        publishing: &Publishing,
        timeout: Duration,
    ) -> Result<(), DeliveryError> {
        let exchange = self.pool.exchange();
        match self.channel.as_mut() {
            Some(channel) => channel.publish(exchange, routing_key, publishing, timeout),
            None => Err(DeliveryError::ChannelClosed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.channel.as_ref().map_or(true, |channel| channel.is_closed())
    }

    pub fn channel_mut(&mut self) -> Option<&mut ChannelOf<C>> {
        self.channel.as_mut()
    }
}

impl<C: Connector> Drop for PooledChannel<'_, C> {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            self.pool.give_back(channel);
        }
    }
}
