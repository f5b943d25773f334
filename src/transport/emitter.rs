use std::sync::Mutex;

use event_emitter_rs::EventEmitter;

use super::{Transport, TransportError};
use crate::message::Envelope;

/// Emits each envelope's JSON body to in-process listeners registered under
/// the route name. `send` returns once every listener has run.
pub struct EmitterTransport {
    emitter: Mutex<EventEmitter>,
}

impl EmitterTransport {
    pub fn new(emitter: EventEmitter) -> Self {
        EmitterTransport {
            emitter: Mutex::new(emitter),
        }
    }

    /// Register a listener for `route`. It receives the JSON body as a string.
    pub fn on<F>(&self, route: &str, listener: F) -> Result<String, TransportError>
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let mut emitter = self
            .emitter
            .lock()
            .map_err(|_| TransportError::LockPoisoned("emitter subscribe"))?;
        Ok(emitter.on(route, listener))
    }
}

impl Transport for EmitterTransport {
    fn send(&self, route: &str, envelope: &Envelope) -> Result<(), TransportError> {
        let body = serde_json::to_string(&envelope.payload)?;
        let handles = {
            let mut emitter = self
                .emitter
                .lock()
                .map_err(|_| TransportError::LockPoisoned("emitter send"))?;
            emitter.emit(route, body)
        };
        for handle in handles {
            handle
                .join()
                .map_err(|_| TransportError::Publish(format!("listener for {route} panicked")))?;
        }
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
