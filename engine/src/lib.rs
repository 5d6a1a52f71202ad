//! # Mirror Engine
//!
//! A durable local mirror for live document collections.
//!
//! This crate keeps an in-memory, reactively-queried document set consistent
//! with an asynchronous local key-value store, so the set survives process
//! restarts and can be mutated while disconnected from a remote source of
//! truth. Live mutations are captured, serialized into the store exactly once
//! and in order, tagged when they happen offline, and merged back into the
//! live set on demand with every entry classified as inserted, updated, or
//! removed.
//!
//! ## Design Principles
//!
//! - **One writer per store**: each persister owns a FIFO write queue with a
//!   single in-flight write - no reordering, no overlap
//! - **Explicit failure policy**: failed writes retry with backoff, then drop
//!   and advance; the queue never stalls silently
//! - **Boundaries as traits**: the storage backend, the connectivity signal,
//!   and the live collection are collaborators behind small traits
//! - **Additive reconciliation**: merging persisted state back never deletes
//!   from the store or the collection
//!
//! ## Core Concepts
//!
//! ### Persisters
//!
//! [`Mirror::attach`] binds an observed subset of the collection (a
//! [`Selector`]) to the store. Every mutation matching the selector flows
//! through the persister's [`WriteQueue`] in emission order. Detaching stops
//! the subscription immediately and abandons unwritten items; call
//! [`Mirror::flush`] first when durability matters.
//!
//! ### Offline markers and tombstones
//!
//! On a *common* collection (one that syncs with a remote source), mutations
//! made while [`ConnectivityGate`] reports disconnected are tagged: inserts
//! and updates carry transient markers in the store, removals leave a
//! [`PersistedEntry::Tombstone`] until the deletion is confirmed. Local-only
//! collections are mirrored without annotation.
//!
//! ### Reconciliation
//!
//! [`Mirror::reconcile`] reads the whole store snapshot in one call,
//! classifies every entry by its markers, bulk-installs the surviving
//! documents into the live collection, recomputes active queries exactly
//! once, and returns a [`ReconcileSummary`]. Markers never survive into the
//! live set.
//!
//! ## Quick Start
//!
//! ```rust
//! use mirror_engine::{
//!     CollectionConfig, Document, LocalCollection, MemoryBackend, Mirror,
//!     ObserveOptions, Selector, SharedGate,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> mirror_engine::Result<()> {
//! let collection = Arc::new(LocalCollection::new("notes"));
//! let backend = MemoryBackend::new();
//! let gate = Arc::new(SharedGate::new(true));
//!
//! let mirror = Mirror::new(
//!     collection.clone(),
//!     backend.collection("notes"),
//!     gate.clone(),
//!     CollectionConfig::common(),
//! );
//!
//! // Persist every mutation of the collection.
//! let persister = mirror.attach(Selector::all(), ObserveOptions::none());
//!
//! // Mutations made while offline are tagged in the store.
//! gate.set_connected(false);
//! collection.insert(Document::new("note-1", json!({"title": "groceries"})));
//! mirror.flush(persister).await?;
//!
//! // Back online: merge the persisted state into a fresh collection.
//! let summary = mirror.reconcile().await?;
//! assert_eq!(summary.inserted.len(), 1);
//! assert_eq!(collection.get("note-1").unwrap().fields["title"], "groceries");
//! # Ok(())
//! # }
//! ```

pub mod collection;
pub mod connectivity;
pub mod document;
pub mod error;
pub mod mirror;
pub mod observer;
pub mod queue;
pub mod reconcile;
pub mod store;

// Re-export main types at crate root
pub use collection::{
    CollectionConfig, CollectionObserver, LiveCollection, LocalCollection, ObserveOptions,
    Selector,
};
pub use connectivity::{ConnectivityGate, SharedGate};
pub use document::{ChangeKind, Document, PersistedDoc, PersistedEntry};
pub use error::{Error, Result};
pub use mirror::{IdSelector, Mirror};
pub use queue::{QueueItem, QueueOp, QueueState, RetryPolicy, WriteQueue};
pub use reconcile::{ReconcileSummary, SyncStatus};
pub use store::{MemoryBackend, MemoryStore, PersistedStore};

/// Type aliases for clarity
pub type DocId = String;
pub type CollectionName = String;
pub type PersisterId = u64;
pub type SubscriptionId = u64;
