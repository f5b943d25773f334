use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use super::TransactionHandle;

/// Open transactions keyed by the id of the message that will join them.
///
/// Lookups take the read lock and may run concurrently; registration and
/// removal take the write lock.
#[derive(Default)]
pub struct TransactionRegistry {
    entries: RwLock<HashMap<i64, TransactionHandle>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` for `id`, replacing any previous entry.
    pub fn insert(&self, id: i64, handle: TransactionHandle) -> Option<TransactionHandle> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, handle)
    }

    pub fn get(&self, id: i64) -> Option<TransactionHandle> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Remove and return the entry for `id`.
    pub fn take(&self, id: i64) -> Option<TransactionHandle> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    pub fn contains(&self, id: i64) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
