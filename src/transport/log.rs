use std::sync::{Arc, Mutex};

use tracing::info;

use super::{Transport, TransportError};
use crate::message::Envelope;

/// Writes each envelope as an `[OUTBOX] route body` line, to a shared buffer
/// or to the log.
#[derive(Default)]
pub struct LogTransport {
    buffer: Option<Arc<Mutex<Vec<String>>>>,
}

impl LogTransport {
    pub fn new() -> Self {
        LogTransport { buffer: None }
    }

    pub fn with_buffer(buffer: Arc<Mutex<Vec<String>>>) -> Self {
        LogTransport {
            buffer: Some(buffer),
        }
    }
}

impl Transport for LogTransport {
    fn send(&self, route: &str, envelope: &Envelope) -> Result<(), TransportError> {
        let body = serde_json::to_string(&envelope.payload)?;
        let line = format!("[OUTBOX] {} {}", route, body);
        if let Some(buffer) = &self.buffer {
            let mut buffer = buffer
                .lock()
                .map_err(|_| TransportError::LockPoisoned("log buffer"))?;
            buffer.push(line);
        } else {
            info!(id = envelope.id, "{}", line);
        }
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
