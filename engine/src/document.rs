//! Document types for the live collection and its persisted mirror.
//!
//! A [`Document`] is the canonical in-memory shape: an id plus a field map.
//! A [`PersistedDoc`] is what lands in the store: the same fields plus two
//! transient offline markers that record whether the mutation happened while
//! disconnected. Markers never appear on a [`Document`] - they are stripped
//! when persisted state is merged back into the live collection.

use crate::DocId;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// The kind of live-collection mutation that produced a queued write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Inserted,
    Updated,
    Removed,
}

/// A document in the live collection's canonical shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Unique identifier for this document
    pub id: DocId,
    /// The document fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Document {
    /// Create a new document from a JSON object of fields.
    ///
    /// Non-object values yield an empty field map.
    pub fn new(id: impl Into<DocId>, fields: Value) -> Self {
        Self {
            id: id.into(),
            fields: fields.as_object().cloned().unwrap_or_default(),
        }
    }
}

/// A document as it is written to the persisted store.
///
/// The id is the store key, so it is not part of the value. The offline
/// markers are serialized as `insertedOffline` / `updatedOffline` next to the
/// fields and omitted entirely when unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedDoc {
    /// Set when the document was inserted while disconnected
    #[serde(default, skip_serializing_if = "is_false")]
    pub inserted_offline: bool,
    /// Set when the document was updated while disconnected
    #[serde(default, skip_serializing_if = "is_false")]
    pub updated_offline: bool,
    /// The document fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

impl PersistedDoc {
    /// Create an unmarked persisted doc from a field map.
    pub fn new(fields: Map<String, Value>) -> Self {
        Self {
            inserted_offline: false,
            updated_offline: false,
            fields,
        }
    }

    /// Create an unmarked persisted doc from a live document, dropping the id.
    pub fn from_document(doc: &Document) -> Self {
        Self::new(doc.fields.clone())
    }

    /// Whether either offline marker is set.
    pub fn is_marked(&self) -> bool {
        self.inserted_offline || self.updated_offline
    }

    /// Clear both offline markers.
    pub fn strip_markers(&mut self) {
        self.inserted_offline = false;
        self.updated_offline = false;
    }

    /// Assign an id back onto the fields, producing a canonical document.
    pub fn into_document(self, id: impl Into<DocId>) -> Document {
        Document {
            id: id.into(),
            fields: self.fields,
        }
    }
}

/// A value stored under a document id.
///
/// Tombstones mark "deleted while offline, not yet confirmed against the
/// remote source" and persist as the JSON literal `false`, so stores written
/// by older implementations read back unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistedEntry {
    /// A persisted document, possibly carrying offline markers
    Doc(PersistedDoc),
    /// A deletion awaiting confirmation
    Tombstone,
}

impl PersistedEntry {
    /// Build an unmarked document entry from a live document.
    pub fn doc(doc: &Document) -> Self {
        PersistedEntry::Doc(PersistedDoc::from_document(doc))
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, PersistedEntry::Tombstone)
    }

    /// The inner document, if this entry is not a tombstone.
    pub fn as_doc(&self) -> Option<&PersistedDoc> {
        match self {
            PersistedEntry::Doc(doc) => Some(doc),
            PersistedEntry::Tombstone => None,
        }
    }
}

impl Serialize for PersistedEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PersistedEntry::Doc(doc) => doc.serialize(serializer),
            PersistedEntry::Tombstone => serializer.serialize_bool(false),
        }
    }
}

impl<'de> Deserialize<'de> for PersistedEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::Bool(false) => Ok(PersistedEntry::Tombstone),
            Value::Object(_) => serde_json::from_value(value)
                .map(PersistedEntry::Doc)
                .map_err(D::Error::custom),
            other => Err(D::Error::custom(format!(
                "expected a document object or the tombstone literal `false`, got {other}"
            ))),
        }
    }
}
