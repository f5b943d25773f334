//! Outbox persistence.
//!
//! Storage owns the envelope rows and their status, plus a registry of open
//! local transactions that a later `publish` can join:
//!
//! ```ignore
//! let tx = storage.begin_transaction(message.id)?;
//! tx_insert_order(&tx, &order)?;              // caller's own domain write
//! publisher.publish("orders.created", message)?; // joins `tx`, then commits
//! ```
//!
//! Implementations:
//! - `InMemoryStorage` - tests and single-process use
//! - `SqliteStorage` - file-backed SQLite (requires `sqlite` feature)

mod error;
mod in_memory;
mod registry;
#[cfg(feature = "sqlite")]
mod sqlite;

use std::sync::Arc;

use tracing::warn;

use crate::message::{Envelope, MessageStatus, OutboxOptions};

pub use error::StorageError;
pub use in_memory::{InMemoryStorage, InMemoryTransaction};
pub use registry::TransactionRegistry;
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteInitializer, SqliteStorage, SqliteTransaction};

/// An open local-database transaction.
///
/// Methods take `&self` so a handle can be shared between the caller doing its
/// domain writes and the registry that lets `publish` join it. Once committed
/// or rolled back, every further call fails with `TransactionFinished`.
pub trait Transaction: Send + Sync {
    fn insert_envelope(&self, table: &str, envelope: &Envelope) -> Result<(), StorageError>;

    fn commit(&self) -> Result<(), StorageError>;

    fn rollback(&self) -> Result<(), StorageError>;

    fn is_finished(&self) -> bool;
}

pub type TransactionHandle = Arc<dyn Transaction>;

/// Schema setup and table naming.
pub trait StorageInitializer: Send + Sync {
    /// Create the outbox tables. Safe to call more than once.
    fn initialize(&self) -> Result<(), StorageError>;

    fn published_table_name(&self) -> String;

    fn received_table_name(&self) -> String;
}

/// Persistence contract shared by the publisher and the dispatcher.
pub trait DataStorage: Send + Sync {
    fn close(&self) -> Result<(), StorageError>;

    /// Table envelopes are written to by `store_message*`.
    fn published_table(&self) -> String;

    /// Insert `envelope` as a standalone write.
    fn store_message(&self, envelope: &Envelope) -> Result<(), StorageError>;

    /// Move a stored envelope to `status`, following the status state machine.
    fn change_state(&self, table: &str, id: i64, status: MessageStatus) -> Result<(), StorageError>;

    fn find_message(&self, table: &str, id: i64) -> Result<Option<Envelope>, StorageError>;

    /// Open a new transaction without registering it.
    fn begin(&self) -> Result<TransactionHandle, StorageError>;

    fn registry(&self) -> &TransactionRegistry;

    /// Protocol version and retention applied to every row written here.
    fn options(&self) -> &OutboxOptions;

    /// Open a transaction and register it for message `id`.
    fn begin_transaction(&self, id: i64) -> Result<TransactionHandle, StorageError> {
        let tx = self.begin()?;
        self.set_tx(id, Arc::clone(&tx));
        Ok(tx)
    }

    fn set_tx(&self, id: i64, handle: TransactionHandle) {
        if let Some(previous) = self.registry().insert(id, handle) {
            if !previous.is_finished() {
                warn!(id, "Replaced an open transaction in the registry");
            }
        }
    }

    fn get_tx(&self, id: i64) -> Option<TransactionHandle> {
        self.registry().get(id)
    }

    /// Insert `envelope` inside `tx` and commit; roll back if the insert fails.
    fn store_message_in(&self, tx: &dyn Transaction, envelope: &Envelope) -> Result<(), StorageError> {
        let table = self.published_table();
        if let Err(err) = tx.insert_envelope(&table, envelope) {
            warn!(id = envelope.id, error = %err, "Rolling back transaction after failed insert");
            if let Err(rollback) = tx.rollback() {
                return Err(StorageError::Rollback {
                    source: Box::new(err),
                    rollback: rollback.to_string(),
                });
            }
            return Err(err);
        }
        tx.commit()
    }

    /// Insert `envelope` inside the transaction registered for its id.
    ///
    /// The registry entry is removed before the commit (or rollback), so the
    /// same handle is never used for a second envelope insert.
    fn store_message_with_transaction(&self, envelope: &Envelope) -> Result<(), StorageError> {
        let tx = self
            .registry()
            .take(envelope.id)
            .ok_or(StorageError::TransactionNotFound(envelope.id))?;
        self.store_message_in(tx.as_ref(), envelope)
    }
}
