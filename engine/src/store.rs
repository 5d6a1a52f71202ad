//! The persisted store boundary.
//!
//! [`PersistedStore`] is the asynchronous key-value backend the engine writes
//! into. Implementations are opaque to the engine; only the operation set and
//! id-keyed semantics matter. [`MemoryStore`] is the in-crate implementation,
//! and [`MemoryBackend`] hands out one store per collection name so that
//! collections never see each other's entries.

use crate::error::Result;
use crate::{CollectionName, DocId, PersistedEntry};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

/// An asynchronous key-value store scoped to one collection.
///
/// `remove` of an absent id is a no-op, not an error.
#[async_trait]
pub trait PersistedStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<PersistedEntry>>;

    async fn get_all(&self) -> Result<HashMap<DocId, PersistedEntry>>;

    async fn set(&self, id: &str, entry: PersistedEntry) -> Result<()>;

    async fn set_all(&self, entries: HashMap<DocId, PersistedEntry>) -> Result<()>;

    async fn remove(&self, id: &str) -> Result<()>;

    async fn remove_all(&self, ids: &[DocId]) -> Result<()>;

    async fn clear(&self) -> Result<()>;
}

/// An in-memory persisted store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<DocId, PersistedEntry>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl PersistedStore for MemoryStore {
    async fn get(&self, id: &str) -> Result<Option<PersistedEntry>> {
        Ok(self.entries.get(id).map(|entry| entry.value().clone()))
    }

    async fn get_all(&self) -> Result<HashMap<DocId, PersistedEntry>> {
        Ok(self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect())
    }

    async fn set(&self, id: &str, entry: PersistedEntry) -> Result<()> {
        self.entries.insert(id.to_string(), entry);
        Ok(())
    }

    async fn set_all(&self, entries: HashMap<DocId, PersistedEntry>) -> Result<()> {
        for (id, entry) in entries {
            self.entries.insert(id, entry);
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.entries.remove(id);
        Ok(())
    }

    async fn remove_all(&self, ids: &[DocId]) -> Result<()> {
        for id in ids {
            self.entries.remove(id);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }
}

/// A registry of in-memory stores keyed by collection name.
///
/// The same name always resolves to the same store instance.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    stores: DashMap<CollectionName, Arc<MemoryStore>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store scoped to `name`, created on first use.
    pub fn collection(&self, name: &str) -> Arc<MemoryStore> {
        self.stores
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryStore::new()))
            .value()
            .clone()
    }
}
