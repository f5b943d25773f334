use thiserror::Error;

use crate::message::MessageStatus;

/// Errors raised by outbox storage.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(String),

    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("message {0} is already stored")]
    DuplicateId(i64),

    #[error("message {0} not found")]
    NotFound(i64),

    #[error("message {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: MessageStatus,
        to: MessageStatus,
    },

    #[error("transaction already committed or rolled back")]
    TransactionFinished,

    #[error("no open transaction registered for message {0}")]
    TransactionNotFound(i64),

    #[error("{source}; rollback also failed: {rollback}")]
    Rollback {
        #[source]
        source: Box<StorageError>,
        rollback: String,
    },

    #[error("storage is closed")]
    Closed,

    #[error("storage lock poisoned during {0}")]
    LockPoisoned(&'static str),
}
