//! Reconciliation: merging persisted state back into the live collection.
//!
//! Reconciliation is a one-shot classification, not a merge of divergent
//! histories. The full store snapshot is read in one call, every entry is
//! classified by its offline markers, surviving documents are bulk-installed
//! into the live collection, and the active queries recompute exactly once.
//!
//! Classification is a pure function over the snapshot: ids are processed in
//! sorted order so the same snapshot always produces the same summary, and a
//! malformed entry can never poison the entries after it.

use crate::document::{Document, PersistedEntry};
use crate::DocId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Engine phase, observable while a reconciliation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Reconciling,
}

/// What one reconciliation run found.
///
/// Only offline-tagged entries and tombstones are reported; unmarked entries
/// are hydrated silently. On a local-only collection every list is empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSummary {
    /// Documents inserted while offline, markers stripped
    pub inserted: Vec<Document>,
    /// Documents updated while offline, markers stripped
    pub updated: Vec<Document>,
    /// Ids deleted while offline and still awaiting confirmation
    pub removed: Vec<DocId>,
}

impl ReconcileSummary {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Classify a store snapshot.
///
/// Returns the summary plus every document to hydrate into the live
/// collection. Tombstones are never hydrated; on a common collection the
/// offline markers are stripped before a document re-enters the canonical
/// shape.
pub(crate) fn classify(
    snapshot: HashMap<DocId, PersistedEntry>,
    common: bool,
) -> (ReconcileSummary, Vec<Document>) {
    // Sorted iteration keeps the summary deterministic regardless of the
    // snapshot's map order.
    let ordered: BTreeMap<DocId, PersistedEntry> = snapshot.into_iter().collect();

    let mut summary = ReconcileSummary::default();
    let mut hydrate = Vec::new();

    for (id, entry) in ordered {
        match entry {
            PersistedEntry::Tombstone => {
                if common {
                    summary.removed.push(id);
                }
            }
            PersistedEntry::Doc(mut persisted) => {
                let inserted = persisted.inserted_offline;
                let updated = persisted.updated_offline;
                if common {
                    persisted.strip_markers();
                }
                let doc = persisted.into_document(id);
                if common {
                    if inserted {
                        summary.inserted.push(doc.clone());
                    } else if updated {
                        summary.updated.push(doc.clone());
                    }
                }
                hydrate.push(doc);
            }
        }
    }

    (summary, hydrate)
}
