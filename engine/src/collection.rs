//! The live-collection boundary.
//!
//! The engine never reaches into a collection's internals. It observes
//! mutations through [`CollectionObserver`] callbacks, hydrates persisted
//! state back in through the bulk [`LiveCollection::install_many`] entry
//! point, and asks for a single query recomputation once hydration is done.
//!
//! [`LocalCollection`] is the in-crate implementation: an in-memory document
//! set with equality-object selectors and synchronous observer dispatch. The
//! reactive query engine itself is out of scope, so query recomputation is a
//! counter that an embedding application replaces with its own machinery.

use crate::{DocId, Document, SubscriptionId};
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Construction-time collection configuration.
///
/// `is_common` marks a collection that synchronizes with a remote source of
/// truth. Only common collections tag offline mutations and classify entries
/// during reconciliation; local-only collections are mirrored verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CollectionConfig {
    pub is_common: bool,
}

impl CollectionConfig {
    /// A collection shared with a remote source.
    pub fn common() -> Self {
        Self { is_common: true }
    }

    /// A purely local collection.
    pub fn local_only() -> Self {
        Self { is_common: false }
    }
}

/// A subset selector over a collection.
///
/// Matches by field equality: a document matches when every selector field is
/// present with an equal value. [`Selector::all`] matches every document.
#[derive(Debug, Clone, Default)]
pub struct Selector(Option<Map<String, Value>>);

impl Selector {
    /// Match every document.
    pub fn all() -> Self {
        Self(None)
    }

    /// Match documents whose fields equal the given JSON object.
    ///
    /// A non-object value matches every document.
    pub fn matching(fields: Value) -> Self {
        Self(fields.as_object().cloned())
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match &self.0 {
            None => true,
            Some(fields) => fields
                .iter()
                .all(|(name, value)| doc.fields.get(name) == Some(value)),
        }
    }
}

/// Opaque observation options, passed verbatim to the collection
/// implementation. The engine never inspects them.
#[derive(Debug, Clone, Default)]
pub struct ObserveOptions(pub Map<String, Value>);

impl ObserveOptions {
    pub fn none() -> Self {
        Self::default()
    }
}

/// Callbacks invoked for live-collection mutations, in emission order.
pub trait CollectionObserver: Send + Sync {
    fn added(&self, doc: &Document);
    fn changed(&self, doc: &Document);
    fn removed(&self, doc: &Document);
}

/// The live, query-serving document set the engine mirrors.
pub trait LiveCollection: Send + Sync {
    /// Subscribe an observer to future mutations matching `selector`.
    ///
    /// No initial snapshot is delivered: only mutations emitted after this
    /// call reach the observer.
    fn observe(
        &self,
        selector: Selector,
        options: ObserveOptions,
        observer: Arc<dyn CollectionObserver>,
    ) -> SubscriptionId;

    /// Stop a subscription. No callbacks fire after this returns.
    fn unobserve(&self, subscription: SubscriptionId);

    /// Install documents directly into the backing set, keyed by id.
    ///
    /// This is the trusted bulk hydration path: no mutation events are
    /// emitted and no validation runs.
    fn install_many(&self, docs: Vec<Document>);

    /// Recompute every active query over the collection once.
    fn recompute_queries(&self);
}

struct Observation {
    selector: Selector,
    observer: Arc<dyn CollectionObserver>,
}

/// An in-memory live collection with synchronous observer dispatch.
///
/// Selector transitions are not modeled: an update is dispatched as `changed`
/// to observers matching the new document state.
pub struct LocalCollection {
    name: String,
    docs: DashMap<DocId, Document>,
    observations: DashMap<SubscriptionId, Observation>,
    next_subscription: AtomicU64,
    recomputes: AtomicU64,
}

impl LocalCollection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            docs: DashMap::new(),
            observations: DashMap::new(),
            next_subscription: AtomicU64::new(1),
            recomputes: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert a document and notify matching observers.
    pub fn insert(&self, doc: Document) {
        self.docs.insert(doc.id.clone(), doc.clone());
        for observer in self.matching_observers(&doc) {
            observer.added(&doc);
        }
    }

    /// Replace a document and notify matching observers.
    pub fn update(&self, doc: Document) {
        self.docs.insert(doc.id.clone(), doc.clone());
        for observer in self.matching_observers(&doc) {
            observer.changed(&doc);
        }
    }

    /// Remove a document and notify observers that matched it.
    pub fn remove(&self, id: &str) -> Option<Document> {
        let (_, doc) = self.docs.remove(id)?;
        for observer in self.matching_observers(&doc) {
            observer.removed(&doc);
        }
        Some(doc)
    }

    pub fn get(&self, id: &str) -> Option<Document> {
        self.docs.get(id).map(|doc| doc.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.docs.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// How many times the active queries have been recomputed.
    pub fn recompute_count(&self) -> u64 {
        self.recomputes.load(Ordering::Relaxed)
    }

    // Snapshot the matching observers before dispatch so no map guard is
    // held while observer code runs.
    fn matching_observers(&self, doc: &Document) -> Vec<Arc<dyn CollectionObserver>> {
        self.observations
            .iter()
            .filter(|observation| observation.selector.matches(doc))
            .map(|observation| observation.observer.clone())
            .collect()
    }
}

impl LiveCollection for LocalCollection {
    fn observe(
        &self,
        selector: Selector,
        _options: ObserveOptions,
        observer: Arc<dyn CollectionObserver>,
    ) -> SubscriptionId {
        let subscription = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.observations
            .insert(subscription, Observation { selector, observer });
        subscription
    }

    fn unobserve(&self, subscription: SubscriptionId) {
        self.observations.remove(&subscription);
    }

    fn install_many(&self, docs: Vec<Document>) {
        for doc in docs {
            self.docs.insert(doc.id.clone(), doc);
        }
    }

    fn recompute_queries(&self) {
        self.recomputes.fetch_add(1, Ordering::Relaxed);
    }
}
