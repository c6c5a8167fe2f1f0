use crate::catalog::ParsedItem;
use crate::storage::Storage;
use crate::{IngestError, Result};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Outcome of merging one parsed item into storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpsertResult {
    /// No product with this external id existed
    Created,
    /// Source-owned fields differed and were overwritten
    Updated,
    /// Source-owned fields matched; nothing was written
    Unchanged,
}

impl UpsertResult {
    /// True for items that were previously unseen
    pub fn is_new(&self) -> bool {
        matches!(self, Self::Created)
    }
}

impl fmt::Display for UpsertResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Updated => write!(f, "updated"),
            Self::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// Merges parsed items into storage without touching user-owned fields
pub struct UpsertEngine<S: Storage> {
    storage: Arc<Mutex<S>>,
}

impl<S: Storage> UpsertEngine<S> {
    pub fn new(storage: Arc<Mutex<S>>) -> Self {
        Self { storage }
    }

    /// Looks the item up by external id and writes it only if it is new or
    /// its source-owned fields changed
    ///
    /// The lookup, diff and write happen under one storage lock so the
    /// decision cannot be invalidated by another writer in this process.
    pub fn upsert(&self, item: &ParsedItem) -> Result<UpsertResult> {
        let mut storage = self.storage.lock().map_err(|_| IngestError::LockPoisoned)?;

        let result = match storage.find_product_by_external_id(&item.external_id)? {
            None => UpsertResult::Created,
            Some(existing) if existing.source == item.source => UpsertResult::Unchanged,
            Some(_) => UpsertResult::Updated,
        };

        if result != UpsertResult::Unchanged {
            storage.upsert_product(item)?;
        }

        tracing::debug!("Upsert {} -> {}", item.external_id, result);
        Ok(result)
    }
}
