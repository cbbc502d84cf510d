//! The collection store.
//!
//! Owns the set of live collections and enforces the mutation contract:
//! every operation either fully succeeds (new mapping published, file
//! rewritten) or fails leaving memory and disk untouched. Writers build a
//! copy of the current mapping, persist it through the journal, and only
//! then publish it, so readers holding a [`Snapshot`] never observe a
//! half-applied mutation.
//!
//! Locking: one `parking_lot::RwLock` per collection around its state, and
//! an outer lock around the name → collection map that is held only long
//! enough to fetch a handle. Multi-collection operations (backup, restore)
//! take per-collection locks in lexicographic name order.

use crate::cipher::FieldCipher;
use crate::codec::SchemaHeader;
use crate::collection::{CollectionState, DocumentMap, Snapshot};
use crate::error::{DbError, DbResult};
use crate::journal::Journal;
use crate::registry::{Descriptor, Registry};
use crate::schema::CollectionSchemaUpdate;
use crate::update::Update;
use crate::watcher;
use jsonldb_query::Query;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

type Cell = Arc<RwLock<CollectionState>>;

/// The set of live collections and their files.
pub struct CollectionStore {
    journal: Journal,
    cipher: Option<FieldCipher>,
    registry: Arc<Registry>,
    collections: RwLock<HashMap<String, Cell>>,
}

impl CollectionStore {
    /// Creates a store over the given journal.
    pub fn new(journal: Journal, cipher: Option<FieldCipher>, registry: Arc<Registry>) -> Self {
        Self {
            journal,
            cipher,
            registry,
            collections: RwLock::new(HashMap::new()),
        }
    }

    /// The journal this store persists through.
    #[must_use]
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    fn cell(&self, name: &str) -> DbResult<Cell> {
        self.collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::collection_not_found(name))
    }

    /// Rejects mutations issued from a change-listener callback for the
    /// same collection.
    fn guard_reentrancy(&self, name: &str) -> DbResult<()> {
        if watcher::is_dispatching(name) {
            return Err(DbError::reentrant_mutation(name));
        }
        Ok(())
    }

    fn check_writable(&self, name: &str, state: &CollectionState) -> DbResult<()> {
        if state.is_readonly() {
            return Err(DbError::CollectionReadOnly {
                name: name.to_string(),
                actual: state.actual_schema_version().to_string(),
                declared: state.descriptor().schema_version().to_string(),
            });
        }
        Ok(())
    }

    fn encrypt_doc(&self, mut doc: Value, descriptor: &Descriptor) -> DbResult<Value> {
        if let Some(cipher) = &self.cipher {
            cipher.encrypt_document(&mut doc, descriptor)?;
        }
        Ok(doc)
    }

    fn decrypt_doc(&self, mut doc: Value, descriptor: &Descriptor) -> DbResult<Value> {
        if let Some(cipher) = &self.cipher {
            cipher.decrypt_document(&mut doc, descriptor)?;
        }
        Ok(doc)
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    /// Creates an empty collection: a fresh file with only the header.
    ///
    /// # Errors
    ///
    /// `CollectionExists` if the collection is live or its file exists
    /// non-empty; `CollectionNotFound` if no descriptor is registered for
    /// the name.
    pub fn create(&self, name: &str) -> DbResult<()> {
        self.guard_reentrancy(name)?;
        let descriptor = self.registry.describe(name)?;

        let mut collections = self.collections.write();
        if collections.contains_key(name) || self.journal.exists_non_empty(name) {
            return Err(DbError::collection_exists(name));
        }

        let header = SchemaHeader::new(descriptor.schema_version());
        self.journal.rewrite(name, &header, std::iter::empty())?;
        collections.insert(
            name.to_string(),
            Arc::new(RwLock::new(CollectionState::empty(descriptor))),
        );
        info!(collection = name, "created collection");
        Ok(())
    }

    /// Drops a collection: discards the mapping and deletes the file.
    pub fn drop_collection(&self, name: &str) -> DbResult<()> {
        self.guard_reentrancy(name)?;

        let mut collections = self.collections.write();
        let removed = collections.remove(name);
        if removed.is_none() && !self.journal.exists(name) {
            return Err(DbError::collection_not_found(name));
        }
        if self.journal.exists(name) {
            self.journal.remove(name)?;
        }
        info!(collection = name, "dropped collection");
        Ok(())
    }

    /// Loads (or reloads) a collection from its file.
    ///
    /// Compares the file's schema version with the descriptor's and marks
    /// the collection read-only on mismatch. A load error leaves the live
    /// set unchanged: nothing is partially installed.
    pub fn load(&self, name: &str) -> DbResult<()> {
        let descriptor = self.registry.describe(name)?;
        if !self.journal.exists(name) {
            return Err(DbError::collection_not_found(name));
        }

        let loaded = self.journal.load(name)?;
        let mut map = DocumentMap::with_capacity(loaded.documents.len());
        for doc in loaded.documents {
            let id = descriptor.id_of(&doc)?;
            if map.insert(id.clone(), doc).is_some() {
                return Err(DbError::duplicate_id(name, id));
            }
        }

        let state = CollectionState::new(descriptor, map, loaded.schema_version);
        if state.is_readonly() {
            info!(
                collection = name,
                file_version = state.actual_schema_version(),
                declared_version = state.descriptor().schema_version(),
                "schema version mismatch, collection is read-only"
            );
        }

        let mut collections = self.collections.write();
        match collections.get(name) {
            Some(cell) => *cell.write() = state,
            None => {
                collections.insert(name.to_string(), Arc::new(RwLock::new(state)));
            }
        }
        debug!(collection = name, "loaded collection");
        Ok(())
    }

    /// Loads every registered collection that has a file on disk.
    pub fn load_all(&self) -> DbResult<()> {
        for name in self.journal.list_collections()? {
            if self.registry.get(&name).is_some() {
                self.load(&name)?;
            } else {
                debug!(collection = %name, "file has no registered descriptor, skipping");
            }
        }
        Ok(())
    }

    /// Removes a collection from the live set without touching its file.
    ///
    /// Used when the watcher observes the file's deletion. Returns `true`
    /// if the collection was live.
    pub fn evict(&self, name: &str) -> bool {
        self.collections.write().remove(name).is_some()
    }

    // ---------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------

    /// Takes an O(1) snapshot of a collection.
    ///
    /// Never blocks behind writers for longer than the handle fetch.
    pub fn snapshot(&self, name: &str) -> DbResult<Snapshot> {
        Ok(self.cell(name)?.read().snapshot())
    }

    /// Names of the live collections, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns `true` if the collection is live.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.collections.read().contains_key(name)
    }

    /// Returns the read-only flag of a collection.
    pub fn is_readonly(&self, name: &str) -> DbResult<bool> {
        Ok(self.cell(name)?.read().is_readonly())
    }

    /// Looks up a document by identifier, decrypting secret fields.
    pub fn find_by_id(&self, name: &str, id: &str) -> DbResult<Option<Value>> {
        let snapshot = self.snapshot(name)?;
        match snapshot.get(id) {
            Some(doc) => Ok(Some(self.decrypt_doc(doc.clone(), snapshot.descriptor())?)),
            None => Ok(None),
        }
    }

    /// Returns all documents in iteration order, decrypted.
    pub fn all_documents(&self, name: &str) -> DbResult<Vec<Value>> {
        let snapshot = self.snapshot(name)?;
        snapshot
            .documents()
            .map(|doc| self.decrypt_doc(doc.clone(), snapshot.descriptor()))
            .collect()
    }

    /// Evaluates a query over a snapshot; results preserve iteration order.
    pub fn find(&self, name: &str, query: &Query) -> DbResult<Vec<Value>> {
        let snapshot = self.snapshot(name)?;
        snapshot
            .documents()
            .filter(|doc| query.matches(doc))
            .map(|doc| self.decrypt_doc(doc.clone(), snapshot.descriptor()))
            .collect()
    }

    /// Returns the first match in iteration order, if any.
    pub fn find_one(&self, name: &str, query: &Query) -> DbResult<Option<Value>> {
        let snapshot = self.snapshot(name)?;
        let found = snapshot.documents().find(|doc| query.matches(doc)).cloned();
        match found {
            Some(doc) => Ok(Some(self.decrypt_doc(doc, snapshot.descriptor())?)),
            None => Ok(None),
        }
    }

    // ---------------------------------------------------------------
    // Mutations
    // ---------------------------------------------------------------

    /// Inserts a batch of documents, all-or-nothing.
    ///
    /// Identifier uniqueness is checked against the current mapping and
    /// within the batch. Pure inserts persist through the append fast
    /// path.
    pub fn insert(&self, name: &str, docs: Vec<Value>) -> DbResult<()> {
        self.guard_reentrancy(name)?;
        let cell = self.cell(name)?;
        let mut state = cell.write();
        self.check_writable(name, &state)?;

        let descriptor = Arc::clone(state.descriptor());
        let mut working = state.working_copy();
        let mut appended = Vec::with_capacity(docs.len());

        for doc in docs {
            let id = descriptor.id_of(&doc)?;
            let doc = self.encrypt_doc(doc, &descriptor)?;
            if working.contains_key(&id) {
                return Err(DbError::duplicate_id(name, id));
            }
            working.insert(id, doc.clone());
            appended.push(doc);
        }

        self.journal.append(name, appended.iter())?;
        state.publish(working);
        Ok(())
    }

    /// Replaces an existing document.
    ///
    /// # Errors
    ///
    /// `DocumentNotFound` if no document with the identifier exists.
    pub fn save(&self, name: &str, doc: Value) -> DbResult<()> {
        self.guard_reentrancy(name)?;
        let cell = self.cell(name)?;
        let mut state = cell.write();
        self.check_writable(name, &state)?;

        let descriptor = Arc::clone(state.descriptor());
        let id = descriptor.id_of(&doc)?;
        let mut working = state.working_copy();
        if !working.contains_key(&id) {
            return Err(DbError::document_not_found(name, id));
        }

        let doc = self.encrypt_doc(doc, &descriptor)?;
        // Replacing under an existing key keeps the original position.
        working.insert(id, doc);

        let header = SchemaHeader::new(state.actual_schema_version());
        self.journal.rewrite(name, &header, working.values())?;
        state.publish(working);
        Ok(())
    }

    /// Inserts or replaces each document by identifier; never fails on
    /// pre-existence.
    pub fn upsert(&self, name: &str, docs: Vec<Value>) -> DbResult<()> {
        self.guard_reentrancy(name)?;
        let cell = self.cell(name)?;
        let mut state = cell.write();
        self.check_writable(name, &state)?;

        let descriptor = Arc::clone(state.descriptor());
        let mut working = state.working_copy();
        for doc in docs {
            let id = descriptor.id_of(&doc)?;
            let doc = self.encrypt_doc(doc, &descriptor)?;
            working.insert(id, doc);
        }

        let header = SchemaHeader::new(state.actual_schema_version());
        self.journal.rewrite(name, &header, working.values())?;
        state.publish(working);
        Ok(())
    }

    /// Removes documents by identifier, all-or-nothing.
    ///
    /// # Errors
    ///
    /// `DocumentNotFound` if any identifier is missing; no partial removal
    /// happens.
    pub fn remove(&self, name: &str, ids: &[String]) -> DbResult<usize> {
        self.guard_reentrancy(name)?;
        let cell = self.cell(name)?;
        let mut state = cell.write();
        self.check_writable(name, &state)?;

        let mut working = state.working_copy();
        for id in ids {
            // shift_remove keeps the remaining documents in order.
            if working.shift_remove(id).is_none() {
                return Err(DbError::document_not_found(name, id.clone()));
            }
        }

        let header = SchemaHeader::new(state.actual_schema_version());
        self.journal.rewrite(name, &header, working.values())?;
        state.publish(working);
        Ok(ids.len())
    }

    /// Applies an update to every document matched by the query.
    ///
    /// Returns the number of modified documents. Matching runs over the
    /// current mapping in iteration order; updates see decrypted secret
    /// fields and results are re-encrypted before persisting.
    pub fn find_and_modify(&self, name: &str, query: &Query, update: &Update) -> DbResult<usize> {
        self.guard_reentrancy(name)?;
        let cell = self.cell(name)?;
        let mut state = cell.write();
        self.check_writable(name, &state)?;

        let descriptor = Arc::clone(state.descriptor());
        let mut working = state.working_copy();

        let matched: Vec<String> = working
            .iter()
            .filter(|(_, doc)| query.matches(doc))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &matched {
            let doc = working
                .get(id)
                .cloned()
                .ok_or_else(|| DbError::document_not_found(name, id.clone()))?;
            let mut doc = self.decrypt_doc(doc, &descriptor)?;
            update.apply(&mut doc)?;
            if descriptor.id_of(&doc)? != *id {
                return Err(DbError::invalid_document(
                    "update may not modify the identifier field",
                ));
            }
            let doc = self.encrypt_doc(doc, &descriptor)?;
            working.insert(id.clone(), doc);
        }

        if !matched.is_empty() {
            let header = SchemaHeader::new(state.actual_schema_version());
            self.journal.rewrite(name, &header, working.values())?;
            state.publish(working);
        }
        Ok(matched.len())
    }

    /// Removes every document matched by the query; returns the count.
    pub fn find_and_remove(&self, name: &str, query: &Query) -> DbResult<usize> {
        self.guard_reentrancy(name)?;
        let cell = self.cell(name)?;
        let mut state = cell.write();
        self.check_writable(name, &state)?;

        let mut working = state.working_copy();
        let matched: Vec<String> = working
            .iter()
            .filter(|(_, doc)| query.matches(doc))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &matched {
            working.shift_remove(id);
        }

        if !matched.is_empty() {
            let header = SchemaHeader::new(state.actual_schema_version());
            self.journal.rewrite(name, &header, working.values())?;
            state.publish(working);
        }
        Ok(matched.len())
    }

    /// Applies a declarative schema update to every document.
    ///
    /// On success the file is rewritten with the descriptor's version
    /// header and the read-only flag is cleared. Any per-document
    /// violation leaves the collection unchanged.
    pub fn update_collection_schema(
        &self,
        name: &str,
        update: &CollectionSchemaUpdate,
    ) -> DbResult<()> {
        self.guard_reentrancy(name)?;
        let cell = self.cell(name)?;
        let mut state = cell.write();

        let descriptor = Arc::clone(state.descriptor());
        let mut migrated = DocumentMap::with_capacity(state.documents().len());
        for (id, doc) in state.documents().iter() {
            let new_doc = update.apply_to(doc, descriptor.id_field_path())?;
            let new_id = descriptor
                .id_of(&new_doc)
                .map_err(|e| DbError::schema_migration_failed(e.to_string()))?;
            if new_id != *id {
                return Err(DbError::schema_migration_failed(format!(
                    "identifier of document {id:?} changed during migration"
                )));
            }
            migrated.insert(new_id, new_doc);
        }

        let header = SchemaHeader::new(descriptor.schema_version());
        self.journal.rewrite(name, &header, migrated.values())?;
        state.publish(migrated);
        state.mark_migrated();
        info!(
            collection = name,
            version = descriptor.schema_version(),
            "schema migration applied"
        );
        Ok(())
    }

    // ---------------------------------------------------------------
    // Backup and restore
    // ---------------------------------------------------------------

    /// Writes every live collection into a fresh file tree at `dest`.
    ///
    /// Per-collection read locks are taken in lexicographic order, so each
    /// backed-up file is a consistent point-in-time copy of its
    /// collection. Secret fields stay encrypted: ciphertext is copied
    /// verbatim.
    pub fn backup(&self, dest: &Path) -> DbResult<()> {
        std::fs::create_dir_all(dest)?;
        let backup_journal = Journal::new(dest, true);

        let cells: Vec<(String, Cell)> = {
            let collections = self.collections.read();
            let mut cells: Vec<_> = collections
                .iter()
                .map(|(name, cell)| (name.clone(), Arc::clone(cell)))
                .collect();
            cells.sort_by(|a, b| a.0.cmp(&b.0));
            cells
        };

        // Lock in lexicographic order, snapshot, release before any I/O.
        let mut snapshots = Vec::with_capacity(cells.len());
        {
            let guards: Vec<_> = cells.iter().map(|(_, cell)| cell.read()).collect();
            for ((name, _), guard) in cells.iter().zip(&guards) {
                snapshots.push((
                    name.clone(),
                    guard.actual_schema_version().to_string(),
                    guard.snapshot(),
                ));
            }
        }

        for (name, version, snapshot) in snapshots {
            let header = SchemaHeader::new(version);
            backup_journal.rewrite(&name, &header, snapshot.documents())?;
        }
        info!(path = %dest.display(), "backup complete");
        Ok(())
    }

    /// Loads collection files from `src`.
    ///
    /// With `merge = false` existing collections are replaced entirely;
    /// with `merge = true` each restored document is upserted by
    /// identifier and wins on collision. Files without a registered
    /// descriptor are skipped. Restored documents carry ciphertext as-is;
    /// nothing is re-encrypted.
    pub fn restore(&self, src: &Path, merge: bool) -> DbResult<()> {
        let source = Journal::new(src, false);
        let mut names: Vec<String> = source
            .list_collections()?
            .into_iter()
            .filter(|name| {
                let known = self.registry.get(name).is_some();
                if !known {
                    warn!(collection = %name, "restore file has no registered descriptor, skipping");
                }
                known
            })
            .collect();
        names.sort();

        for name in names {
            self.guard_reentrancy(&name)?;
            let descriptor = self.registry.describe(&name)?;
            let loaded = source.load(&name)?;

            let mut restored = DocumentMap::with_capacity(loaded.documents.len());
            for doc in loaded.documents {
                let id = descriptor.id_of(&doc)?;
                restored.insert(id, doc);
            }

            // Bind before matching so the map guard is released first.
            let existing = self.collections.read().get(&name).cloned();
            match existing {
                Some(cell) => {
                    let mut state = cell.write();
                    self.check_writable(&name, &state)?;

                    let (map, version) = if merge {
                        let mut working = state.working_copy();
                        for (id, doc) in restored {
                            // Restored document wins on id collision.
                            working.insert(id, doc);
                        }
                        (working, state.actual_schema_version().to_string())
                    } else {
                        (restored, loaded.schema_version)
                    };

                    let header = SchemaHeader::new(version.as_str());
                    self.journal.rewrite(&name, &header, map.values())?;
                    *state = CollectionState::new(Arc::clone(&descriptor), map, version);
                }
                None => {
                    // Nothing live to merge into; both modes install fresh.
                    let header = SchemaHeader::new(loaded.schema_version.as_str());
                    self.journal.rewrite(&name, &header, restored.values())?;
                    let state =
                        CollectionState::new(descriptor, restored, loaded.schema_version);
                    self.collections
                        .write()
                        .insert(name.clone(), Arc::new(RwLock::new(state)));
                }
            }
            info!(collection = %name, merge, "restored collection");
        }
        Ok(())
    }
}

impl std::fmt::Debug for CollectionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionStore")
            .field("collections", &self.names())
            .finish_non_exhaustive()
    }
}
