//! Bounded hand-off between publishers and the transport.
//!
//! Many threads enqueue persisted envelopes; one consumer thread sends them in
//! admission order and marks each delivered row `Succeeded`.
//!
//! ```ignore
//! let dispatcher = Arc::new(Dispatcher::new(transport, storage, DispatcherConfig::default()));
//! dispatcher.start()?;
//! // publishers call dispatcher.enqueue_to_publish(envelope)
//! dispatcher.stop()?; // drains the queue, closes the transport
//! ```

mod completion;
mod dispatcher;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::message::Envelope;

pub use dispatcher::Dispatcher;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("timed out after {waited:?} enqueueing message {id}")]
    EnqueueTimeout { id: i64, waited: Duration },

    #[error("dispatcher is stopped")]
    Stopped,

    #[error("dispatcher already started")]
    AlreadyStarted,

    #[error("failed to spawn dispatcher thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("transport publishes protocol version {transport} but storage writes {storage}")]
    VersionMismatch { transport: String, storage: String },

    #[error("dispatcher lock poisoned during {0}")]
    LockPoisoned(&'static str),
}

pub trait Dispatch: Send + Sync {
    /// Hand `envelope` to the consumer, backing off while the queue is full.
    fn enqueue_to_publish(&self, envelope: Envelope) -> Result<(), DispatchError>;

    fn start(&self) -> Result<(), DispatchError>;

    /// Close the queue and wait until everything admitted has been handled.
    fn stop(&self) -> Result<(), DispatchError>;
}

impl<D: Dispatch + ?Sized> Dispatch for Arc<D> {
    fn enqueue_to_publish(&self, envelope: Envelope) -> Result<(), DispatchError> {
        (**self).enqueue_to_publish(envelope)
    }

    fn start(&self) -> Result<(), DispatchError> {
        (**self).start()
    }

    fn stop(&self) -> Result<(), DispatchError> {
        (**self).stop()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatcherState {
    Created,
    Running,
    Stopping,
    Stopped,
}

impl DispatcherState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            DispatcherState::Created => 0,
            DispatcherState::Running => 1,
            DispatcherState::Stopping => 2,
            DispatcherState::Stopped => 3,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => DispatcherState::Created,
            1 => DispatcherState::Running,
            2 => DispatcherState::Stopping,
            _ => DispatcherState::Stopped,
        }
    }
}

/// Counters from the dispatcher.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatcherStats {
    pub sent: u64,
    pub failed: u64,
    pub state_update_failures: u64,
    pub enqueue_timeouts: u64,
}

const DEFAULT_QUEUE_CAPACITY: usize = 10;
const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_BACKOFF: Duration = Duration::from_millis(50);
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);
/// Shortest pause between enqueue attempts on a full queue.
pub(crate) const MIN_BACKOFF: Duration = Duration::from_millis(1);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub queue_capacity: usize,
    /// Longest a producer waits for queue space before giving up.
    pub enqueue_timeout: Duration,
    /// Sleep between attempts while the queue is full.
    pub backoff: Duration,
    /// Send attempts per envelope, including the first.
    pub max_send_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            enqueue_timeout: DEFAULT_ENQUEUE_TIMEOUT,
            backoff: DEFAULT_BACKOFF,
            max_send_attempts: 1,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

impl DispatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue capacity, at least 1.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_enqueue_timeout(mut self, timeout: Duration) -> Self {
        self.enqueue_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff.max(MIN_BACKOFF);
        self
    }

    /// Send attempts per envelope, at least 1.
    pub fn with_max_send_attempts(mut self, attempts: u32) -> Self {
        self.max_send_attempts = attempts.max(1);
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}
