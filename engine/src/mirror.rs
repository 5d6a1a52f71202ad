//! The mirror facade: persisters, bulk store access, reconciliation.
//!
//! A [`Mirror`] binds one live collection to one persisted store. Persisters
//! are attached per selector; each owns an independent write queue, so
//! distinct persisters never block each other and writes within one persister
//! stay strictly ordered.

use crate::collection::{CollectionConfig, LiveCollection, ObserveOptions, Selector};
use crate::connectivity::ConnectivityGate;
use crate::document::{Document, PersistedEntry};
use crate::error::{Error, Result};
use crate::observer::PersistObserver;
use crate::queue::{RetryPolicy, WriteQueue};
use crate::reconcile::{classify, ReconcileSummary, SyncStatus};
use crate::store::PersistedStore;
use crate::{DocId, PersisterId, SubscriptionId};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Which persisted entries an operation addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdSelector {
    One(DocId),
    Many(Vec<DocId>),
    All,
}

impl IdSelector {
    /// Parse a JSON-shaped id argument: a string, an array of strings, or
    /// null. Anything else is an invalid-argument error, raised before any
    /// store call.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::String(id) => Ok(IdSelector::One(id.clone())),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        Error::InvalidArgument(format!("expected an id string, got {item}"))
                    })
                })
                .collect::<Result<Vec<_>>>()
                .map(IdSelector::Many),
            Value::Null => Ok(IdSelector::All),
            other => Err(Error::InvalidArgument(format!(
                "expected an id, an array of ids, or null, got {other}"
            ))),
        }
    }
}

impl From<&str> for IdSelector {
    fn from(id: &str) -> Self {
        IdSelector::One(id.to_string())
    }
}

impl From<String> for IdSelector {
    fn from(id: String) -> Self {
        IdSelector::One(id)
    }
}

impl From<Vec<String>> for IdSelector {
    fn from(ids: Vec<String>) -> Self {
        IdSelector::Many(ids)
    }
}

/// The live binding of one observed collection subset to the store.
struct Persister {
    queue: Arc<WriteQueue>,
    subscription: SubscriptionId,
}

/// A durable local mirror of a live document collection.
pub struct Mirror {
    collection: Arc<dyn LiveCollection>,
    store: Arc<dyn PersistedStore>,
    gate: Arc<dyn ConnectivityGate>,
    config: CollectionConfig,
    retry: RetryPolicy,
    persisters: DashMap<PersisterId, Persister>,
    next_persister: AtomicU64,
    status: watch::Sender<SyncStatus>,
}

impl Mirror {
    pub fn new(
        collection: Arc<dyn LiveCollection>,
        store: Arc<dyn PersistedStore>,
        gate: Arc<dyn ConnectivityGate>,
        config: CollectionConfig,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::Idle);
        Self {
            collection,
            store,
            gate,
            config,
            retry: RetryPolicy::default(),
            persisters: DashMap::new(),
            next_persister: AtomicU64::new(1),
            status,
        }
    }

    /// Override the write-queue retry policy for persisters attached later.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> CollectionConfig {
        self.config
    }

    /// Write documents straight into the store, keyed by id, in one batch.
    /// No offline markers are attached.
    pub async fn persist(&self, docs: Vec<Document>) -> Result<()> {
        let entries: HashMap<DocId, PersistedEntry> = docs
            .iter()
            .map(|doc| (doc.id.clone(), PersistedEntry::doc(doc)))
            .collect();
        self.store.set_all(entries).await
    }

    /// Fetch persisted entries: one id, a set of ids, or the whole store.
    /// Absent ids are simply missing from the result.
    pub async fn fetch(
        &self,
        ids: impl Into<IdSelector>,
    ) -> Result<HashMap<DocId, PersistedEntry>> {
        match ids.into() {
            IdSelector::One(id) => {
                let mut out = HashMap::new();
                if let Some(entry) = self.store.get(&id).await? {
                    out.insert(id, entry);
                }
                Ok(out)
            }
            IdSelector::Many(ids) => {
                let mut out = HashMap::new();
                for id in ids {
                    if let Some(entry) = self.store.get(&id).await? {
                        out.insert(id, entry);
                    }
                }
                Ok(out)
            }
            IdSelector::All => self.store.get_all().await,
        }
    }

    /// Fetch a single persisted entry.
    pub async fn fetch_one(&self, id: &str) -> Result<Option<PersistedEntry>> {
        self.store.get(id).await
    }

    /// Remove persisted entries. Absent ids are no-ops; `All` clears the
    /// store.
    pub async fn remove_persisted(&self, ids: impl Into<IdSelector>) -> Result<()> {
        match ids.into() {
            IdSelector::One(id) => self.store.remove(&id).await,
            IdSelector::Many(ids) => self.store.remove_all(&ids).await,
            IdSelector::All => self.store.clear().await,
        }
    }

    /// Drop every persisted entry for this collection.
    pub async fn clear_persisted(&self) -> Result<()> {
        self.store.clear().await
    }

    /// Merge the persisted snapshot into the live collection and classify
    /// every entry.
    ///
    /// A snapshot read failure aborts the run before anything is applied.
    /// Tombstoned ids are reported but neither installed nor compacted;
    /// call [`compact`](Self::compact) once the remote source confirms the
    /// deletions.
    pub async fn reconcile(&self) -> Result<ReconcileSummary> {
        self.status.send_replace(SyncStatus::Reconciling);

        let snapshot = match self.store.get_all().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.status.send_replace(SyncStatus::Idle);
                return Err(err);
            }
        };

        let (summary, hydrate) = classify(snapshot, self.config.is_common);
        tracing::debug!(
            inserted = summary.inserted.len(),
            updated = summary.updated.len(),
            removed = summary.removed.len(),
            hydrated = hydrate.len(),
            "reconciled persisted snapshot"
        );

        self.collection.install_many(hydrate);
        self.collection.recompute_queries();

        self.status.send_replace(SyncStatus::Idle);
        Ok(summary)
    }

    /// Start persisting the subset of the collection matching `selector`.
    ///
    /// Returns a handle for [`detach`](Self::detach) and
    /// [`flush`](Self::flush). Must be called from within a tokio runtime
    /// (the write queue spawns its worker task).
    pub fn attach(&self, selector: Selector, options: ObserveOptions) -> PersisterId {
        let queue = Arc::new(WriteQueue::new(self.store.clone(), self.retry));
        let observer = Arc::new(PersistObserver::new(
            queue.clone(),
            self.gate.clone(),
            self.config.is_common,
        ));
        let subscription = self.collection.observe(selector, options, observer);

        let id = self.next_persister.fetch_add(1, Ordering::Relaxed);
        self.persisters.insert(
            id,
            Persister {
                queue,
                subscription,
            },
        );
        id
    }

    /// Stop a persister: its subscription ends immediately and its
    /// queued-but-unwritten items are abandoned. Callers needing durability
    /// await [`flush`](Self::flush) first.
    pub fn detach(&self, id: PersisterId) -> Result<()> {
        let (_, persister) = self
            .persisters
            .remove(&id)
            .ok_or(Error::UnknownPersister(id))?;
        self.collection.unobserve(persister.subscription);
        persister.queue.shutdown();
        Ok(())
    }

    /// Detach every attached persister.
    pub fn detach_all(&self) {
        let ids: Vec<PersisterId> = self.persisters.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            let _ = self.detach(id);
        }
    }

    /// Wait until a persister's queue has fully drained.
    pub async fn flush(&self, id: PersisterId) -> Result<()> {
        let queue = self
            .persisters
            .get(&id)
            .map(|persister| persister.queue.clone())
            .ok_or(Error::UnknownPersister(id))?;
        queue.flush().await;
        Ok(())
    }

    /// Wait until every attached persister's queue has fully drained.
    pub async fn flush_all(&self) {
        let queues: Vec<Arc<WriteQueue>> = self
            .persisters
            .iter()
            .map(|entry| entry.value().queue.clone())
            .collect();
        for queue in queues {
            queue.flush().await;
        }
    }

    /// Compact tombstones whose deletion the remote source has confirmed.
    ///
    /// Only entries among `ids` that are tombstones are removed; documents
    /// are left alone. Returns the ids actually compacted.
    pub async fn compact(&self, ids: &[DocId]) -> Result<Vec<DocId>> {
        let mut compacted = Vec::new();
        for id in ids {
            if let Some(PersistedEntry::Tombstone) = self.store.get(id).await? {
                self.store.remove(id).await?;
                compacted.push(id.clone());
            }
        }
        Ok(compacted)
    }

    /// Number of attached persisters.
    pub fn persister_count(&self) -> usize {
        self.persisters.len()
    }

    /// Current engine phase.
    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    /// Watch engine phase transitions.
    pub fn status_changes(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }
}
