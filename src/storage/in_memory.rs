use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use tracing::debug;

use super::{DataStorage, StorageError, StorageInitializer, Transaction, TransactionHandle, TransactionRegistry};
use crate::message::{Envelope, MessageStatus, OutboxOptions};

#[derive(Default)]
struct Tables {
    envelopes: HashMap<String, BTreeMap<i64, Envelope>>,
    rows: HashMap<String, BTreeMap<String, serde_json::Value>>,
}

impl Tables {
    fn contains_envelope(&self, table: &str, id: i64) -> bool {
        self.envelopes
            .get(table)
            .is_some_and(|rows| rows.contains_key(&id))
    }
}

/// Thread-safe in-memory outbox storage.
///
/// Cloning creates another handle to the same tables and registry. Besides
/// envelopes it keeps arbitrary JSON "domain rows" so tests can check that a
/// caller's own writes commit or roll back together with the envelope.
#[derive(Clone)]
pub struct InMemoryStorage {
    tables: Arc<RwLock<Tables>>,
    registry: Arc<TransactionRegistry>,
    options: OutboxOptions,
    table_prefix: String,
    failing_inserts: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::with_options(OutboxOptions::default())
    }

    pub fn with_options(options: OutboxOptions) -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            registry: Arc::new(TransactionRegistry::new()),
            options,
            table_prefix: "outbox".to_string(),
            failing_inserts: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    /// Make the next `count` envelope inserts fail, standalone or transactional.
    pub fn fail_next_inserts(&self, count: usize) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    /// All envelopes in `table`, ordered by id.
    pub fn messages(&self, table: &str) -> Vec<Envelope> {
        self.tables
            .read()
            .map(|tables| {
                tables
                    .envelopes
                    .get(table)
                    .map(|rows| rows.values().cloned().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Envelopes in the published table with the given status.
    pub fn published_with_status(&self, status: MessageStatus) -> Vec<Envelope> {
        self.messages(&self.published_table())
            .into_iter()
            .filter(|envelope| envelope.status == status)
            .collect()
    }

    /// Committed domain row, if any.
    pub fn row(&self, table: &str, key: &str) -> Option<serde_json::Value> {
        self.tables
            .read()
            .ok()?
            .rows
            .get(table)?
            .get(key)
            .cloned()
    }

    /// Insert a domain row outside any transaction.
    pub fn put_row(&self, table: &str, key: &str, value: serde_json::Value) -> Result<(), StorageError> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| StorageError::LockPoisoned("row write"))?;
        tables
            .rows
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    /// Open a concrete in-memory transaction, for callers that want to stage domain rows.
    pub fn begin_in_memory(&self) -> Result<Arc<InMemoryTransaction>, StorageError> {
        self.ensure_open()?;
        Ok(Arc::new(InMemoryTransaction {
            tables: Arc::clone(&self.tables),
            failing_inserts: Arc::clone(&self.failing_inserts),
            staged: Mutex::new(Some(Staged::default())),
        }))
    }

    /// Same as `begin_transaction`, keeping the concrete type.
    pub fn begin_in_memory_transaction(&self, id: i64) -> Result<Arc<InMemoryTransaction>, StorageError> {
        let tx = self.begin_in_memory()?;
        self.set_tx(id, tx.clone());
        Ok(tx)
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

fn take_injected_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl StorageInitializer for InMemoryStorage {
    fn initialize(&self) -> Result<(), StorageError> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| StorageError::LockPoisoned("initialize"))?;
        tables.envelopes.entry(self.published_table_name()).or_default();
        tables.envelopes.entry(self.received_table_name()).or_default();
        Ok(())
    }

    fn published_table_name(&self) -> String {
        format!("{}_published", self.table_prefix)
    }

    fn received_table_name(&self) -> String {
        format!("{}_received", self.table_prefix)
    }
}

impl DataStorage for InMemoryStorage {
    fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn published_table(&self) -> String {
        self.published_table_name()
    }

    fn store_message(&self, envelope: &Envelope) -> Result<(), StorageError> {
        self.ensure_open()?;
        if take_injected_failure(&self.failing_inserts) {
            return Err(StorageError::Database("injected insert failure".into()));
        }

        let table = self.published_table_name();
        let mut tables = self
            .tables
            .write()
            .map_err(|_| StorageError::LockPoisoned("store message"))?;
        if tables.contains_envelope(&table, envelope.id) {
            return Err(StorageError::DuplicateId(envelope.id));
        }
        let mut row = envelope.clone();
        row.status = MessageStatus::Scheduled;
        tables.envelopes.entry(table).or_default().insert(row.id, row);
        debug!(id = envelope.id, "Stored message");
        Ok(())
    }

    fn change_state(&self, table: &str, id: i64, status: MessageStatus) -> Result<(), StorageError> {
        self.ensure_open()?;
        let mut tables = self
            .tables
            .write()
            .map_err(|_| StorageError::LockPoisoned("change state"))?;
        let row = tables
            .envelopes
            .get_mut(table)
            .and_then(|rows| rows.get_mut(&id))
            .ok_or(StorageError::NotFound(id))?;

        if !row.status.can_transition_to(status) {
            return Err(StorageError::InvalidTransition {
                id,
                from: row.status,
                to: status,
            });
        }
        row.status = status;
        row.expires_at = self.options.retention_for(status).map(|ttl| Utc::now() + ttl);
        debug!(id, status = %status, "Changed message state");
        Ok(())
    }

    fn options(&self) -> &OutboxOptions {
        &self.options
    }

    fn find_message(&self, table: &str, id: i64) -> Result<Option<Envelope>, StorageError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| StorageError::LockPoisoned("find message"))?;
        Ok(tables
            .envelopes
            .get(table)
            .and_then(|rows| rows.get(&id))
            .cloned())
    }

    fn begin(&self) -> Result<TransactionHandle, StorageError> {
        let tx: TransactionHandle = self.begin_in_memory()?;
        Ok(tx)
    }

    fn registry(&self) -> &TransactionRegistry {
        &self.registry
    }
}

#[derive(Default)]
struct Staged {
    envelopes: Vec<(String, Envelope)>,
    rows: Vec<(String, String, serde_json::Value)>,
}

/// Transaction over `InMemoryStorage`.
///
/// Writes are staged and applied under one write lock on commit, so readers
/// never see half of a transaction.
pub struct InMemoryTransaction {
    tables: Arc<RwLock<Tables>>,
    failing_inserts: Arc<AtomicUsize>,
    staged: Mutex<Option<Staged>>,
}

impl InMemoryTransaction {
    /// Stage a domain row write.
    pub fn stage(&self, table: &str, key: &str, value: serde_json::Value) -> Result<(), StorageError> {
        let mut staged = self
            .staged
            .lock()
            .map_err(|_| StorageError::LockPoisoned("stage row"))?;
        let staged = staged.as_mut().ok_or(StorageError::TransactionFinished)?;
        staged.rows.push((table.to_string(), key.to_string(), value));
        Ok(())
    }

    fn finish(&self) -> Result<Staged, StorageError> {
        self.staged
            .lock()
            .map_err(|_| StorageError::LockPoisoned("finish transaction"))?
            .take()
            .ok_or(StorageError::TransactionFinished)
    }
}

impl Transaction for InMemoryTransaction {
    fn insert_envelope(&self, table: &str, envelope: &Envelope) -> Result<(), StorageError> {
        let mut staged = self
            .staged
            .lock()
            .map_err(|_| StorageError::LockPoisoned("stage envelope"))?;
        let staged = staged.as_mut().ok_or(StorageError::TransactionFinished)?;

        if take_injected_failure(&self.failing_inserts) {
            return Err(StorageError::Database("injected insert failure".into()));
        }

        let already_committed = self
            .tables
            .read()
            .map_err(|_| StorageError::LockPoisoned("stage envelope"))?
            .contains_envelope(table, envelope.id);
        let already_staged = staged
            .envelopes
            .iter()
            .any(|(t, e)| t == table && e.id == envelope.id);
        if already_committed || already_staged {
            return Err(StorageError::DuplicateId(envelope.id));
        }

        let mut row = envelope.clone();
        row.status = MessageStatus::Scheduled;
        staged.envelopes.push((table.to_string(), row));
        Ok(())
    }

    fn commit(&self) -> Result<(), StorageError> {
        let staged = self.finish()?;
        let mut tables = self
            .tables
            .write()
            .map_err(|_| StorageError::LockPoisoned("commit"))?;

        if let Some((_, envelope)) = staged
            .envelopes
            .iter()
            .find(|(table, envelope)| tables.contains_envelope(table, envelope.id))
        {
            return Err(StorageError::DuplicateId(envelope.id));
        }

        for (table, envelope) in staged.envelopes {
            tables.envelopes.entry(table).or_default().insert(envelope.id, envelope);
        }
        for (table, key, value) in staged.rows {
            tables.rows.entry(table).or_default().insert(key, value);
        }
        Ok(())
    }

    fn rollback(&self) -> Result<(), StorageError> {
        self.finish().map(drop)
    }

    fn is_finished(&self) -> bool {
        self.staged.lock().map(|s| s.is_none()).unwrap_or(true)
    }
}
