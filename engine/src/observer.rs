//! Change capture: live-collection mutations into the write queue.
//!
//! One [`PersistObserver`] sits behind every persister subscription. It maps
//! mutation events to queued store writes, tagging documents created or
//! edited while disconnected so reconciliation can classify them later.
//!
//! Removals ride the same queue as inserts and updates, so a removal that
//! chases a still-queued insert of the same id can never be reordered ahead
//! of it.

use crate::collection::CollectionObserver;
use crate::connectivity::ConnectivityGate;
use crate::document::{ChangeKind, Document, PersistedDoc, PersistedEntry};
use crate::queue::{QueueItem, QueueOp, WriteQueue};
use std::sync::Arc;

/// Maps one persister's mutation stream onto its write queue.
pub struct PersistObserver {
    queue: Arc<WriteQueue>,
    gate: Arc<dyn ConnectivityGate>,
    common: bool,
}

impl PersistObserver {
    pub fn new(
        queue: Arc<WriteQueue>,
        gate: Arc<dyn ConnectivityGate>,
        common: bool,
    ) -> Self {
        Self {
            queue,
            gate,
            common,
        }
    }

    // Offline markers only apply to collections that sync with a remote
    // source; local-only collections are mirrored without annotation.
    fn tag_offline(&self) -> bool {
        self.common && !self.gate.is_connected()
    }
}

impl CollectionObserver for PersistObserver {
    fn added(&self, doc: &Document) {
        let mut persisted = PersistedDoc::from_document(doc);
        persisted.inserted_offline = self.tag_offline();
        self.queue.enqueue(QueueItem {
            id: doc.id.clone(),
            op: QueueOp::Set(PersistedEntry::Doc(persisted)),
            kind: ChangeKind::Inserted,
        });
    }

    fn changed(&self, doc: &Document) {
        let mut persisted = PersistedDoc::from_document(doc);
        persisted.updated_offline = self.tag_offline();
        self.queue.enqueue(QueueItem {
            id: doc.id.clone(),
            op: QueueOp::Set(PersistedEntry::Doc(persisted)),
            kind: ChangeKind::Updated,
        });
    }

    fn removed(&self, doc: &Document) {
        // Offline on a common collection: keep a tombstone until the remote
        // source confirms the deletion. Otherwise drop the entry outright.
        let op = if self.tag_offline() {
            QueueOp::Set(PersistedEntry::Tombstone)
        } else {
            QueueOp::Remove
        };
        self.queue.enqueue(QueueItem {
            id: doc.id.clone(),
            op,
            kind: ChangeKind::Removed,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::SharedGate;
    use crate::queue::RetryPolicy;
    use crate::store::{MemoryStore, PersistedStore};
    use serde_json::json;

    fn make_observer(
        store: Arc<MemoryStore>,
        connected: bool,
        common: bool,
    ) -> (PersistObserver, Arc<WriteQueue>) {
        let queue = Arc::new(WriteQueue::new(store, RetryPolicy::default()));
        let gate = Arc::new(SharedGate::new(connected));
        (PersistObserver::new(queue.clone(), gate, common), queue)
    }

    #[tokio::test]
    async fn online_insert_is_unmarked() {
        let store = Arc::new(MemoryStore::new());
        let (observer, queue) = make_observer(store.clone(), true, true);

        observer.added(&Document::new("a", json!({"title": "one"})));
        queue.flush().await;

        let entry = store.get("a").await.unwrap().unwrap();
        let doc = entry.as_doc().unwrap();
        assert!(!doc.is_marked());
        assert_eq!(doc.fields["title"], json!("one"));
        assert!(doc.fields.get("id").is_none());
    }

    #[tokio::test]
    async fn offline_insert_is_tagged() {
        let store = Arc::new(MemoryStore::new());
        let (observer, queue) = make_observer(store.clone(), false, true);

        observer.added(&Document::new("a", json!({"title": "one"})));
        queue.flush().await;

        let entry = store.get("a").await.unwrap().unwrap();
        let doc = entry.as_doc().unwrap();
        assert!(doc.inserted_offline);
        assert!(!doc.updated_offline);
    }

    #[tokio::test]
    async fn offline_update_is_tagged() {
        let store = Arc::new(MemoryStore::new());
        let (observer, queue) = make_observer(store.clone(), false, true);

        observer.changed(&Document::new("a", json!({"title": "two"})));
        queue.flush().await;

        let entry = store.get("a").await.unwrap().unwrap();
        let doc = entry.as_doc().unwrap();
        assert!(!doc.inserted_offline);
        assert!(doc.updated_offline);
    }

    #[tokio::test]
    async fn local_only_collections_are_never_tagged() {
        let store = Arc::new(MemoryStore::new());
        let (observer, queue) = make_observer(store.clone(), false, false);

        observer.added(&Document::new("a", json!({})));
        observer.changed(&Document::new("b", json!({})));
        queue.flush().await;

        assert!(!store.get("a").await.unwrap().unwrap().as_doc().unwrap().is_marked());
        assert!(!store.get("b").await.unwrap().unwrap().as_doc().unwrap().is_marked());
    }

    #[tokio::test]
    async fn offline_removal_writes_a_tombstone() {
        let store = Arc::new(MemoryStore::new());
        let (observer, queue) = make_observer(store.clone(), false, true);

        observer.removed(&Document::new("a", json!({"title": "one"})));
        queue.flush().await;

        assert!(store.get("a").await.unwrap().unwrap().is_tombstone());
    }

    #[tokio::test]
    async fn online_removal_deletes_the_entry() {
        let store = Arc::new(MemoryStore::new());
        store
            .set("a", PersistedEntry::doc(&Document::new("a", json!({}))))
            .await
            .unwrap();
        let (observer, queue) = make_observer(store.clone(), true, true);

        observer.removed(&Document::new("a", json!({})));
        queue.flush().await;

        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn removal_after_queued_insert_is_not_reordered() {
        let store = Arc::new(MemoryStore::new());
        let (observer, queue) = make_observer(store.clone(), true, true);

        observer.added(&Document::new("a", json!({"title": "one"})));
        observer.removed(&Document::new("a", json!({"title": "one"})));
        queue.flush().await;

        assert!(store.get("a").await.unwrap().is_none());
    }
}
