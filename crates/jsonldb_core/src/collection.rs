//! Per-collection in-memory state and snapshots.
//!
//! Each live collection owns an insertion-ordered identifier → document
//! mapping published behind an `Arc`. Mutations never touch the published
//! map: the store builds a modified copy and swaps it in after the journal
//! write succeeds, so a [`Snapshot`] taken by a reader observes either the
//! old mapping or the new one, never a half-updated map.

use crate::registry::Descriptor;
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Arc;

/// Insertion-ordered mapping from document identifier to document.
pub type DocumentMap = IndexMap<String, Value>;

/// The live state of one collection.
#[derive(Debug, Clone)]
pub struct CollectionState {
    descriptor: Arc<Descriptor>,
    documents: Arc<DocumentMap>,
    actual_schema_version: String,
    readonly: bool,
}

impl CollectionState {
    /// Creates state for a collection loaded from disk.
    ///
    /// The collection is read-only when the file's schema version differs
    /// from the descriptor's.
    #[must_use]
    pub fn new(
        descriptor: Arc<Descriptor>,
        documents: DocumentMap,
        actual_schema_version: impl Into<String>,
    ) -> Self {
        let actual_schema_version = actual_schema_version.into();
        let readonly = actual_schema_version != descriptor.schema_version();
        Self {
            descriptor,
            documents: Arc::new(documents),
            actual_schema_version,
            readonly,
        }
    }

    /// Creates state for a freshly created, empty collection.
    #[must_use]
    pub fn empty(descriptor: Arc<Descriptor>) -> Self {
        let version = descriptor.schema_version().to_string();
        Self::new(descriptor, DocumentMap::new(), version)
    }

    /// The collection's descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &Arc<Descriptor> {
        &self.descriptor
    }

    /// The published document mapping.
    #[must_use]
    pub fn documents(&self) -> &Arc<DocumentMap> {
        &self.documents
    }

    /// Schema version read from the file header.
    #[must_use]
    pub fn actual_schema_version(&self) -> &str {
        &self.actual_schema_version
    }

    /// Whether the collection rejects mutations.
    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Takes an immutable snapshot. O(1): clones two `Arc`s.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            documents: Arc::clone(&self.documents),
            descriptor: Arc::clone(&self.descriptor),
        }
    }

    /// Builds a mutable copy of the mapping for a copy-on-write update.
    #[must_use]
    pub fn working_copy(&self) -> DocumentMap {
        self.documents.as_ref().clone()
    }

    /// Publishes a new mapping. Snapshots taken earlier are unaffected.
    pub fn publish(&mut self, documents: DocumentMap) {
        self.documents = Arc::new(documents);
    }

    /// Records a successful schema migration: the file now carries the
    /// descriptor's version and the read-only flag is cleared.
    pub fn mark_migrated(&mut self) {
        self.actual_schema_version = self.descriptor.schema_version().to_string();
        self.readonly = false;
    }
}

/// An immutable view of a collection's mapping at a point in time.
#[derive(Debug, Clone)]
pub struct Snapshot {
    documents: Arc<DocumentMap>,
    descriptor: Arc<Descriptor>,
}

impl Snapshot {
    /// The collection's descriptor.
    #[must_use]
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// Looks up a document by identifier.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Value> {
        self.documents.get(id)
    }

    /// Returns `true` if a document with the identifier exists.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.documents.contains_key(id)
    }

    /// Number of documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Whether the collection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Iterates documents in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.documents.iter()
    }

    /// Iterates document values in insertion order.
    pub fn documents(&self) -> impl Iterator<Item = &Value> {
        self.documents.values()
    }
}
