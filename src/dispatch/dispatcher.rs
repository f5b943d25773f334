use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::completion::Completion;
use super::{Dispatch, DispatchError, DispatcherConfig, DispatcherState, DispatcherStats, MIN_BACKOFF};
use crate::message::{Envelope, MessageStatus};
use crate::storage::DataStorage;
use crate::transport::Transport;

/// Single-consumer dispatcher over a bounded queue.
///
/// The dispatcher owns its transport and closes it after the queue drains.
/// Envelopes enqueued before `start` wait in the queue until the consumer runs.
pub struct Dispatcher {
    inner: Arc<Inner>,
    receiver: Mutex<Option<Receiver<Envelope>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    config: DispatcherConfig,
    sender: Mutex<Option<SyncSender<Envelope>>>,
    state: AtomicU8,
    stopping: AtomicBool,
    transport: Box<dyn Transport>,
    storage: Arc<dyn DataStorage>,
    done: Completion,
    sent: AtomicU64,
    failed: AtomicU64,
    state_update_failures: AtomicU64,
    enqueue_timeouts: AtomicU64,
}

impl Dispatcher {
    pub fn new<T>(transport: T, storage: Arc<dyn DataStorage>, config: DispatcherConfig) -> Self
    where
        T: Transport + 'static,
    {
        let (sender, receiver) = sync_channel(config.queue_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                sender: Mutex::new(Some(sender)),
                state: AtomicU8::new(DispatcherState::Created.as_u8()),
                stopping: AtomicBool::new(false),
                transport: Box::new(transport),
                storage,
                done: Completion::new(),
                sent: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                state_update_failures: AtomicU64::new(0),
                enqueue_timeouts: AtomicU64::new(0),
            }),
            receiver: Mutex::new(Some(receiver)),
            handle: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    pub fn state(&self) -> DispatcherState {
        self.inner.state()
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            sent: self.inner.sent.load(Ordering::SeqCst),
            failed: self.inner.failed.load(Ordering::SeqCst),
            state_update_failures: self.inner.state_update_failures.load(Ordering::SeqCst),
            enqueue_timeouts: self.inner.enqueue_timeouts.load(Ordering::SeqCst),
        }
    }

    fn spawn_consumer(&self, receiver: Receiver<Envelope>) -> Result<(), DispatchError> {
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("outbox-dispatcher".to_string())
            .spawn(move || inner.consume(receiver))
            .map_err(DispatchError::Spawn)?;

        let mut slot = self
            .handle
            .lock()
            .map_err(|_| DispatchError::LockPoisoned("start"))?;
        *slot = Some(handle);
        Ok(())
    }
}

impl Dispatch for Dispatcher {
    fn enqueue_to_publish(&self, envelope: Envelope) -> Result<(), DispatchError> {
        if self.inner.stopping.load(Ordering::SeqCst) {
            return Err(DispatchError::Stopped);
        }
        let sender = self
            .inner
            .sender
            .lock()
            .map_err(|_| DispatchError::LockPoisoned("enqueue"))?
            .clone()
            .ok_or(DispatchError::Stopped)?;

        let id = envelope.id;
        let timeout = self.inner.config.enqueue_timeout;
        let started = Instant::now();
        let mut pending = envelope;
        loop {
            match sender.try_send(pending) {
                Ok(()) => {
                    debug!(id, "Enqueued message");
                    return Ok(());
                }
                Err(TrySendError::Full(returned)) => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        self.inner.enqueue_timeouts.fetch_add(1, Ordering::SeqCst);
                        warn!(id, waited_ms = waited.as_millis() as u64, "Timed out enqueueing message, it stays scheduled");
                        return Err(DispatchError::EnqueueTimeout { id, waited });
                    }
                    debug!(id, "Dispatch queue is full, backing off");
                    thread::sleep(self.inner.config.backoff.max(MIN_BACKOFF).min(timeout - waited));
                    pending = returned;
                }
                Err(TrySendError::Disconnected(_)) => return Err(DispatchError::Stopped),
            }
        }
    }

    fn start(&self) -> Result<(), DispatchError> {
        self.inner.check_version()?;

        let created = DispatcherState::Created.as_u8();
        let running = DispatcherState::Running.as_u8();
        if let Err(current) = self
            .inner
            .state
            .compare_exchange(created, running, Ordering::SeqCst, Ordering::SeqCst)
        {
            return match DispatcherState::from_u8(current) {
                DispatcherState::Running => Err(DispatchError::AlreadyStarted),
                _ => Err(DispatchError::Stopped),
            };
        }

        let receiver = self
            .receiver
            .lock()
            .map_err(|_| DispatchError::LockPoisoned("start"))?
            .take()
            .ok_or(DispatchError::AlreadyStarted)?;

        if let Err(err) = self.spawn_consumer(receiver) {
            error!(error = %err, "Failed to start dispatcher");
            self.inner.stopping.store(true, Ordering::SeqCst);
            self.inner.close_queue();
            self.inner.finish();
            return Err(err);
        }
        info!(capacity = self.inner.config.queue_capacity, "Dispatcher started");
        Ok(())
    }

    fn stop(&self) -> Result<(), DispatchError> {
        if !self.inner.stopping.swap(true, Ordering::SeqCst) {
            info!("Stopping dispatcher");
            let running = DispatcherState::Running.as_u8();
            let stopping = DispatcherState::Stopping.as_u8();
            let was_running = self
                .inner
                .state
                .compare_exchange(running, stopping, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok();
            self.inner.close_queue();

            if !was_running {
                self.shut_down_unstarted();
            }
        }

        self.inner.done.wait()?;

        let handle = self
            .handle
            .lock()
            .map_err(|_| DispatchError::LockPoisoned("stop"))?
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Dispatcher thread panicked");
            }
        }
        Ok(())
    }
}

impl Dispatcher {
    fn shut_down_unstarted(&self) {
        let created = DispatcherState::Created.as_u8();
        let stopped = DispatcherState::Stopped.as_u8();
        if self
            .inner
            .state
            .compare_exchange(created, stopped, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // start() won the race and owns the consumer now.
            return;
        }

        let receiver = match self.receiver.lock() {
            Ok(mut receiver) => receiver.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let abandoned = receiver.map_or(0, |receiver| receiver.try_iter().count());
        if abandoned > 0 {
            warn!(count = abandoned, "Dispatcher stopped before start, queued messages stay scheduled");
        }
        if let Err(err) = self.inner.transport.close() {
            warn!(error = %err, "Failed to close transport");
        }
        self.inner.done.complete();
        info!("Dispatcher stopped");
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Let a running consumer drain and exit on its own.
        self.inner.close_queue();
    }
}

/// Marks the dispatcher stopped and releases `stop` callers, even if the
/// consumer unwinds.
struct ConsumerExit<'a>(&'a Inner);

impl Drop for ConsumerExit<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

impl Inner {
    fn state(&self) -> DispatcherState {
        DispatcherState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Rows must name the version of the exchange they are published to.
    fn check_version(&self) -> Result<(), DispatchError> {
        let storage = self.storage.options().version.as_str();
        match self.transport.version() {
            Some(transport) if transport != storage => Err(DispatchError::VersionMismatch {
                transport: transport.to_string(),
                storage: storage.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn close_queue(&self) {
        let sender = match self.sender.lock() {
            Ok(mut sender) => sender.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);
    }

    fn finish(&self) {
        self.state.store(DispatcherState::Stopped.as_u8(), Ordering::SeqCst);
        self.done.complete();
    }

    fn consume(&self, receiver: Receiver<Envelope>) {
        let _exit = ConsumerExit(self);

        for envelope in receiver.iter() {
            self.deliver(&envelope);
        }

        if let Err(err) = self.transport.close() {
            warn!(error = %err, "Failed to close transport");
        }
        info!(sent = self.sent.load(Ordering::SeqCst), "Dispatcher stopped");
    }

    fn deliver(&self, envelope: &Envelope) {
        let attempts = self.config.max_send_attempts.max(1);
        let mut attempt = 1;
        loop {
            debug!(id = envelope.id, route = %envelope.name, attempt, "Sending message");
            match self.transport.send(&envelope.name, envelope) {
                Ok(()) => break,
                Err(err) if attempt < attempts => {
                    warn!(id = envelope.id, attempt, error = %err, "Send failed, retrying");
                    thread::sleep(self.config.retry_backoff);
                    attempt += 1;
                }
                Err(err) => {
                    self.failed.fetch_add(1, Ordering::SeqCst);
                    warn!(
                        id = envelope.id,
                        route = %envelope.name,
                        error = %err,
                        "Failed to send message, it stays scheduled"
                    );
                    return;
                }
            }
        }
        self.sent.fetch_add(1, Ordering::SeqCst);

        let table = self.storage.published_table();
        if let Err(err) = self
            .storage
            .change_state(&table, envelope.id, MessageStatus::Succeeded)
        {
            self.state_update_failures.fetch_add(1, Ordering::SeqCst);
            error!(id = envelope.id, error = %err, "Failed to mark message succeeded");
        }
    }
}
