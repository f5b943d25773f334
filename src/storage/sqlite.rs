use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Params};
use tracing::{debug, info, warn};

use super::{DataStorage, StorageError, StorageInitializer, Transaction, TransactionHandle, TransactionRegistry};
use crate::message::{Envelope, MessageStatus, OutboxOptions};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_IDLE_CONNECTIONS: usize = 4;

fn open_connection(path: &Path) -> Result<Connection, StorageError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Creates the published and received tables in a SQLite database file.
pub struct SqliteInitializer {
    path: PathBuf,
    table_prefix: String,
    initialized: Mutex<bool>,
}

impl SqliteInitializer {
    pub fn new(path: impl Into<PathBuf>, table_prefix: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            table_prefix: table_prefix.into(),
            initialized: Mutex::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn create_tables_script(&self) -> String {
        let received = self.received_table_name();
        let published = self.published_table_name();
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{received}" (
                "Id"         INTEGER NOT NULL PRIMARY KEY,
                "Version"    TEXT,
                "Name"       TEXT NOT NULL,
                "Group"      TEXT,
                "Content"    TEXT,
                "Retries"    INTEGER,
                "Added"      TEXT NOT NULL,
                "ExpiresAt"  TEXT,
                "StatusName" TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS "IX_{received}_ExpiresAt" ON "{received}" ("ExpiresAt");
            CREATE TABLE IF NOT EXISTS "{published}" (
                "Id"         INTEGER NOT NULL PRIMARY KEY,
                "Version"    TEXT,
                "Name"       TEXT NOT NULL,
                "Content"    TEXT,
                "Retries"    INTEGER,
                "Added"      TEXT NOT NULL,
                "ExpiresAt"  TEXT,
                "StatusName" TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS "IX_{published}_ExpiresAt" ON "{published}" ("ExpiresAt");
            "#
        )
    }
}

impl StorageInitializer for SqliteInitializer {
    fn initialize(&self) -> Result<(), StorageError> {
        let mut initialized = self
            .initialized
            .lock()
            .map_err(|_| StorageError::LockPoisoned("initialize"))?;
        if *initialized {
            return Ok(());
        }

        let conn = open_connection(&self.path)?;
        let journal: String = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.execute_batch(&self.create_tables_script())?;
        *initialized = true;
        info!(path = %self.path.display(), prefix = %self.table_prefix, journal = %journal, "Outbox tables initialized");
        Ok(())
    }

    fn published_table_name(&self) -> String {
        format!("{}_published", self.table_prefix)
    }

    fn received_table_name(&self) -> String {
        format!("{}_received", self.table_prefix)
    }
}

/// Outbox storage over a SQLite database file.
///
/// Standalone writes borrow a connection from a small idle list and hold no
/// lock while SQLite waits on a busy database. Every transaction gets its own
/// connection and starts `DEFERRED`, so it takes the write lock only at its
/// first write.
///
/// SQLite admits one writer at a time. Once a caller transaction has written,
/// other writers (including the dispatcher's state updates) wait for its
/// commit for up to the busy timeout, then fail. Keep caller transactions short.
pub struct SqliteStorage {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
    closed: AtomicBool,
    registry: TransactionRegistry,
    options: OutboxOptions,
    published_table: String,
}

impl SqliteStorage {
    /// Open the database and check it is reachable.
    pub fn open(initializer: &SqliteInitializer, options: OutboxOptions) -> Result<Self, StorageError> {
        let path = initializer.path().to_path_buf();
        let conn = open_connection(&path)?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;

        Ok(Self {
            path,
            idle: Mutex::new(vec![conn]),
            closed: AtomicBool::new(false),
            registry: TransactionRegistry::new(),
            options,
            published_table: initializer.published_table_name(),
        })
    }

    /// Run `f` against a connection outside any caller transaction.
    pub fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StorageError> {
        self.with_pooled(|conn| Ok(f(conn)?))
    }

    /// Open a concrete SQLite transaction, for callers doing their own writes.
    pub fn begin_sqlite(&self) -> Result<Arc<SqliteTransaction>, StorageError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed);
        }
        let conn = open_connection(&self.path)?;
        conn.execute_batch("BEGIN DEFERRED")?;
        Ok(Arc::new(SqliteTransaction {
            conn: Mutex::new(Some(conn)),
        }))
    }

    /// Same as `begin_transaction`, keeping the concrete type.
    pub fn begin_sqlite_transaction(&self, id: i64) -> Result<Arc<SqliteTransaction>, StorageError> {
        let tx = self.begin_sqlite()?;
        self.set_tx(id, tx.clone());
        Ok(tx)
    }

    fn with_pooled<T>(&self, f: impl FnOnce(&Connection) -> Result<T, StorageError>) -> Result<T, StorageError> {
        let conn = self.acquire()?;
        let result = f(&conn);
        self.release(conn);
        result
    }

    fn acquire(&self) -> Result<Connection, StorageError> {
        let pooled = {
            let mut idle = self.idle()?;
            if self.closed.load(Ordering::SeqCst) {
                return Err(StorageError::Closed);
            }
            idle.pop()
        };
        match pooled {
            Some(conn) => Ok(conn),
            None => open_connection(&self.path),
        }
    }

    fn release(&self, conn: Connection) {
        let Ok(mut idle) = self.idle.lock() else {
            return;
        };
        if !self.closed.load(Ordering::SeqCst) && idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(conn);
        }
    }

    fn idle(&self) -> Result<MutexGuard<'_, Vec<Connection>>, StorageError> {
        self.idle
            .lock()
            .map_err(|_| StorageError::LockPoisoned("connection"))
    }
}

fn insert_envelope(conn: &Connection, table: &str, envelope: &Envelope) -> Result<(), StorageError> {
    let sql = format!(
        r#"INSERT INTO "{table}" ("Id", "Version", "Name", "Content", "Retries", "Added", "ExpiresAt", "StatusName")
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#
    );
    let result = conn.execute(
        &sql,
        params![
            envelope.id,
            envelope.version,
            envelope.name,
            envelope.content,
            envelope.retries,
            envelope.added,
            Option::<DateTime<Utc>>::None,
            MessageStatus::Scheduled.as_str(),
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == ErrorCode::ConstraintViolation => {
            Err(StorageError::DuplicateId(envelope.id))
        }
        Err(err) => Err(err.into()),
    }
}

fn read_envelope(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Envelope, String)> {
    let envelope = Envelope {
        id: row.get(0)?,
        version: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
        name: row.get(2)?,
        content: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        retries: row.get::<_, Option<u32>>(4)?.unwrap_or_default(),
        added: row.get(5)?,
        expires_at: row.get(6)?,
        status: MessageStatus::Scheduled,
        payload: serde_json::Value::Null,
    };
    Ok((envelope, row.get(7)?))
}

impl DataStorage for SqliteStorage {
    fn close(&self) -> Result<(), StorageError> {
        let drained: Vec<Connection> = {
            let mut idle = self.idle()?;
            if self.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            idle.drain(..).collect()
        };
        for conn in drained {
            conn.close().map_err(|(_, err)| StorageError::Sqlite(err))?;
        }
        info!(path = %self.path.display(), "Outbox storage closed");
        Ok(())
    }

    fn published_table(&self) -> String {
        self.published_table.clone()
    }

    fn store_message(&self, envelope: &Envelope) -> Result<(), StorageError> {
        self.with_pooled(|conn| insert_envelope(conn, &self.published_table, envelope))?;
        debug!(id = envelope.id, "Stored message");
        Ok(())
    }

    fn change_state(&self, table: &str, id: i64, status: MessageStatus) -> Result<(), StorageError> {
        self.with_pooled(|conn| self.update_state(conn, table, id, status))?;
        debug!(id, status = %status, "Changed message state");
        Ok(())
    }

    fn find_message(&self, table: &str, id: i64) -> Result<Option<Envelope>, StorageError> {
        let found = self.with_pooled(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        r#"SELECT "Id", "Version", "Name", "Content", "Retries", "Added", "ExpiresAt", "StatusName"
                           FROM "{table}" WHERE "Id" = ?1"#
                    ),
                    [id],
                    read_envelope,
                )
                .optional()?)
        })?;

        let Some((mut envelope, status)) = found else {
            return Ok(None);
        };
        envelope.status = status
            .parse()
            .map_err(|err: crate::message::UnknownStatus| StorageError::Database(err.to_string()))?;
        Ok(Some(envelope.with_payload_from_content()?))
    }

    fn begin(&self) -> Result<TransactionHandle, StorageError> {
        let tx: TransactionHandle = self.begin_sqlite()?;
        Ok(tx)
    }

    fn registry(&self) -> &TransactionRegistry {
        &self.registry
    }

    fn options(&self) -> &OutboxOptions {
        &self.options
    }
}

impl SqliteStorage {
    fn update_state(&self, conn: &Connection, table: &str, id: i64, status: MessageStatus) -> Result<(), StorageError> {
        let current: Option<String> = conn
            .query_row(
                &format!(r#"SELECT "StatusName" FROM "{table}" WHERE "Id" = ?1"#),
                [id],
                |row| row.get(0),
            )
            .optional()?;
        let current = current
            .ok_or(StorageError::NotFound(id))?
            .parse::<MessageStatus>()
            .map_err(|err| StorageError::Database(err.to_string()))?;
        if !current.can_transition_to(status) {
            return Err(StorageError::InvalidTransition {
                id,
                from: current,
                to: status,
            });
        }

        let expires_at = self.options.retention_for(status).map(|ttl| Utc::now() + ttl);
        let updated = conn.execute(
            &format!(
                r#"UPDATE "{table}" SET "StatusName" = ?1, "ExpiresAt" = ?2
                   WHERE "Id" = ?3 AND "StatusName" = ?4"#
            ),
            params![status.as_str(), expires_at, id, current.as_str()],
        )?;
        if updated == 0 {
            // Lost a race with another writer.
            return Err(StorageError::InvalidTransition {
                id,
                from: current,
                to: status,
            });
        }
        Ok(())
    }
}

/// Transaction on a dedicated SQLite connection.
///
/// Dropping an unfinished transaction closes its connection, which rolls it back.
pub struct SqliteTransaction {
    conn: Mutex<Option<Connection>>,
}

impl SqliteTransaction {
    /// Run a domain statement inside this transaction.
    pub fn execute<P: Params>(&self, sql: &str, params: P) -> Result<usize, StorageError> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| StorageError::LockPoisoned("transaction execute"))?;
        let conn = guard.as_ref().ok_or(StorageError::TransactionFinished)?;
        Ok(conn.execute(sql, params)?)
    }

    fn finish(&self, statement: &str) -> Result<(), StorageError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StorageError::LockPoisoned("transaction finish"))?
            .take()
            .ok_or(StorageError::TransactionFinished)?;
        conn.execute_batch(statement)?;
        Ok(())
    }
}

impl Transaction for SqliteTransaction {
    fn insert_envelope(&self, table: &str, envelope: &Envelope) -> Result<(), StorageError> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| StorageError::LockPoisoned("transaction insert"))?;
        let conn = guard.as_ref().ok_or(StorageError::TransactionFinished)?;
        insert_envelope(conn, table, envelope)
    }

    fn commit(&self) -> Result<(), StorageError> {
        self.finish("COMMIT")
    }

    fn rollback(&self) -> Result<(), StorageError> {
        self.finish("ROLLBACK")
    }

    fn is_finished(&self) -> bool {
        self.conn.lock().map(|c| c.is_none()).unwrap_or(true)
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if !self.is_finished() {
            warn!("Dropping an unfinished transaction, changes are rolled back");
        }
    }
}
