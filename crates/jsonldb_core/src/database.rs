//! Database facade.
//!
//! `Database` is the primary entry point. It owns the collection store,
//! the file watcher and the listener set, and offers two parallel entry
//! points for each operation: one keyed by entity type (`insert`, `find`,
//! ...) and one keyed by collection name over raw JSON documents
//! (`insert_into`, `find_in`, ...). Both end in identical store calls.
//!
//! # Opening a database
//!
//! ```no_run
//! use jsonldb_core::{Config, Database, Entity, Registry};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Site {
//!     id: String,
//!     location: String,
//! }
//!
//! impl Entity for Site {
//!     fn collection() -> &'static str {
//!         "sites"
//!     }
//!
//!     fn schema_version() -> &'static str {
//!         "1.0"
//!     }
//! }
//!
//! # fn main() -> jsonldb_core::DbResult<()> {
//! let mut registry = Registry::new();
//! registry.register::<Site>()?;
//!
//! let db = Database::open(Config::new("my_database"), registry)?;
//! db.create_collection::<Site>()?;
//! db.insert(&Site { id: "s1".into(), location: "US-East".into() })?;
//!
//! let found: Option<Site> = db.find_by_id("s1")?;
//! db.shutdown();
//! # Ok(())
//! # }
//! ```

use crate::cipher::FieldCipher;
use crate::codec::{from_document, to_document};
use crate::config::Config;
use crate::error::{DbError, DbResult};
use crate::journal::Journal;
use crate::registry::{Entity, Registry};
use crate::schema::CollectionSchemaUpdate;
use crate::store::CollectionStore;
use crate::update::Update;
use crate::watcher::{ChangeKind, CollectionFileChangeListener, FileWatcher, ListenerSet};
use fs2::FileExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Advisory lock file guarding the database directory.
const LOCK_FILE: &str = "LOCK";

/// The main database handle.
///
/// Cheap to share behind an `Arc`; all methods take `&self` and
/// synchronize internally (per-collection readers–writer locks).
pub struct Database {
    registry: Arc<Registry>,
    store: Arc<CollectionStore>,
    listeners: Arc<ListenerSet>,
    watcher: Mutex<Option<FileWatcher>>,
    /// Held for the lifetime of the handle; released on drop.
    _lock_file: File,
}

impl Database {
    /// Opens a database.
    ///
    /// Creates the directory if missing, acquires an exclusive advisory
    /// lock, discards stale rewrite temporaries, loads every registered
    /// collection that has a file, and starts the file watcher.
    ///
    /// # Errors
    ///
    /// - `DatabaseLocked` if another process holds the directory lock
    /// - `CipherError` if a descriptor declares secret fields but no
    ///   cipher key is configured
    /// - any load error from the existing collection files
    pub fn open(config: Config, registry: Registry) -> DbResult<Self> {
        let dir = config.db_files_location.clone();
        std::fs::create_dir_all(&dir)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(DbError::DatabaseLocked);
        }

        if registry.has_secret_fields() && config.cipher_key.is_none() {
            return Err(DbError::cipher(
                "a cipher key is required: a registered descriptor declares secret fields",
            ));
        }

        let registry = Arc::new(registry);
        let journal = Journal::new(&dir, config.sync_on_write);
        journal.discard_stale_temps()?;

        let cipher = config.cipher_key.as_ref().map(FieldCipher::new);
        let store = Arc::new(CollectionStore::new(
            journal,
            cipher,
            Arc::clone(&registry),
        ));
        store.load_all()?;

        let listeners = Arc::new(ListenerSet::new());

        let watcher = if config.watch_files {
            let handler_store = Arc::clone(&store);
            let handler_registry = Arc::clone(&registry);
            let handler_listeners = Arc::clone(&listeners);
            Some(FileWatcher::start(
                &dir,
                config.debounce_window,
                move |kind, name| {
                    if handler_registry.get(name).is_none() {
                        return;
                    }
                    match kind {
                        ChangeKind::Deleted => {
                            handler_store.evict(name);
                        }
                        ChangeKind::Added | ChangeKind::Modified => {
                            // Reload failures must not poison unrelated
                            // operations; log and move on.
                            if let Err(error) = handler_store.load(name) {
                                warn!(collection = name, %error, "reload after file change failed");
                                return;
                            }
                        }
                    }
                    handler_listeners.notify(kind, name);
                },
            )?)
        } else {
            None
        };

        info!(path = %dir.display(), collections = store.names().len(), "database open");
        Ok(Self {
            registry,
            store,
            listeners,
            watcher: Mutex::new(watcher),
            _lock_file: lock_file,
        })
    }

    /// Stops the watcher and drains pending reloads.
    ///
    /// Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        if let Some(mut watcher) = self.watcher.lock().take() {
            watcher.shutdown();
            info!("database shut down");
        }
    }

    // ---------------------------------------------------------------
    // Listeners
    // ---------------------------------------------------------------

    /// Registers a collection file change listener.
    pub fn add_collection_file_change_listener(
        &self,
        listener: Arc<dyn CollectionFileChangeListener>,
    ) {
        self.listeners.add(listener);
    }

    /// Removes a previously registered listener.
    pub fn remove_collection_file_change_listener(
        &self,
        listener: &Arc<dyn CollectionFileChangeListener>,
    ) {
        self.listeners.remove(listener);
    }

    // ---------------------------------------------------------------
    // Collection management
    // ---------------------------------------------------------------

    /// Creates the collection for an entity type.
    pub fn create_collection<T: Entity>(&self) -> DbResult<()> {
        let descriptor = self.registry.describe_type::<T>()?;
        self.store.create(descriptor.collection_name())
    }

    /// Creates a collection by name.
    pub fn create_collection_named(&self, name: &str) -> DbResult<()> {
        self.store.create(name)
    }

    /// Drops the collection for an entity type.
    pub fn drop_collection<T: Entity>(&self) -> DbResult<()> {
        let descriptor = self.registry.describe_type::<T>()?;
        self.store.drop_collection(descriptor.collection_name())
    }

    /// Drops a collection by name.
    pub fn drop_collection_named(&self, name: &str) -> DbResult<()> {
        self.store.drop_collection(name)
    }

    /// Names of the live collections, sorted.
    #[must_use]
    pub fn collection_names(&self) -> Vec<String> {
        self.store.names()
    }

    /// The collection name an entity type maps to.
    pub fn collection_name_of<T: Entity>(&self) -> DbResult<String> {
        Ok(self
            .registry
            .describe_type::<T>()?
            .collection_name()
            .to_string())
    }

    /// Returns `true` if the entity type's collection is live.
    pub fn collection_exists<T: Entity>(&self) -> DbResult<bool> {
        let descriptor = self.registry.describe_type::<T>()?;
        Ok(self.store.exists(descriptor.collection_name()))
    }

    /// Returns `true` if the named collection is live.
    #[must_use]
    pub fn collection_exists_named(&self, name: &str) -> bool {
        self.store.exists(name)
    }

    /// Read-only flag of an entity type's collection.
    pub fn is_collection_readonly<T: Entity>(&self) -> DbResult<bool> {
        let descriptor = self.registry.describe_type::<T>()?;
        self.store.is_readonly(descriptor.collection_name())
    }

    /// Read-only flag of a named collection.
    pub fn is_collection_readonly_named(&self, name: &str) -> DbResult<bool> {
        self.store.is_readonly(name)
    }

    /// Re-reads every registered collection file from disk.
    ///
    /// Useful when another process edited the files directly.
    pub fn reload_db(&self) -> DbResult<()> {
        self.store.load_all()
    }

    /// Re-reads one collection file from disk.
    pub fn reload_collection(&self, name: &str) -> DbResult<()> {
        self.store.load(name)
    }

    // ---------------------------------------------------------------
    // Typed reads
    // ---------------------------------------------------------------

    /// Finds documents matching an XPath-like query expression.
    pub fn find<T: Entity>(&self, query: &str) -> DbResult<Vec<T>> {
        let descriptor = self.registry.describe_type::<T>()?;
        let query = jsonldb_query::parse(query)?;
        self.store
            .find(descriptor.collection_name(), &query)?
            .into_iter()
            .map(from_document)
            .collect()
    }

    /// Returns the first match in iteration order, or `None`.
    pub fn find_one<T: Entity>(&self, query: &str) -> DbResult<Option<T>> {
        let descriptor = self.registry.describe_type::<T>()?;
        let query = jsonldb_query::parse(query)?;
        self.store
            .find_one(descriptor.collection_name(), &query)?
            .map(from_document)
            .transpose()
    }

    /// Returns all documents of a collection in iteration order.
    pub fn find_all<T: Entity>(&self) -> DbResult<Vec<T>> {
        let descriptor = self.registry.describe_type::<T>()?;
        self.store
            .all_documents(descriptor.collection_name())?
            .into_iter()
            .map(from_document)
            .collect()
    }

    /// Looks up a document by identifier.
    pub fn find_by_id<T: Entity>(&self, id: &str) -> DbResult<Option<T>> {
        let descriptor = self.registry.describe_type::<T>()?;
        self.store
            .find_by_id(descriptor.collection_name(), id)?
            .map(from_document)
            .transpose()
    }

    // ---------------------------------------------------------------
    // Typed mutations
    // ---------------------------------------------------------------

    /// Inserts one entity.
    pub fn insert<T: Entity>(&self, entity: &T) -> DbResult<()> {
        let descriptor = self.registry.describe_type::<T>()?;
        self.store
            .insert(descriptor.collection_name(), vec![to_document(entity)?])
    }

    /// Inserts a batch of entities in a single journal write.
    pub fn insert_batch<T: Entity>(&self, entities: &[T]) -> DbResult<()> {
        let descriptor = self.registry.describe_type::<T>()?;
        let docs = entities.iter().map(to_document).collect::<DbResult<Vec<_>>>()?;
        self.store.insert(descriptor.collection_name(), docs)
    }

    /// Inserts an entity into an explicitly named collection.
    ///
    /// # Errors
    ///
    /// `BadDescriptor` if the entity type resolves to a different
    /// collection than the supplied name.
    pub fn insert_named<T: Entity>(&self, entity: &T, collection: &str) -> DbResult<()> {
        self.check_collection_match::<T>(collection)?;
        self.store.insert(collection, vec![to_document(entity)?])
    }

    /// Replaces an existing entity.
    pub fn save<T: Entity>(&self, entity: &T) -> DbResult<()> {
        let descriptor = self.registry.describe_type::<T>()?;
        self.store.save(descriptor.collection_name(), to_document(entity)?)
    }

    /// Replaces an existing entity in an explicitly named collection.
    pub fn save_named<T: Entity>(&self, entity: &T, collection: &str) -> DbResult<()> {
        self.check_collection_match::<T>(collection)?;
        self.store.save(collection, to_document(entity)?)
    }

    /// Inserts or replaces one entity by identifier.
    pub fn upsert<T: Entity>(&self, entity: &T) -> DbResult<()> {
        let descriptor = self.registry.describe_type::<T>()?;
        self.store
            .upsert(descriptor.collection_name(), vec![to_document(entity)?])
    }

    /// Inserts or replaces a batch of entities in a single journal write.
    pub fn upsert_batch<T: Entity>(&self, entities: &[T]) -> DbResult<()> {
        let descriptor = self.registry.describe_type::<T>()?;
        let docs = entities.iter().map(to_document).collect::<DbResult<Vec<_>>>()?;
        self.store.upsert(descriptor.collection_name(), docs)
    }

    /// Removes one entity by its identifier.
    pub fn remove<T: Entity>(&self, entity: &T) -> DbResult<()> {
        self.remove_batch(std::slice::from_ref(entity)).map(|_| ())
    }

    /// Removes a batch of entities; every identifier must exist.
    ///
    /// Returns the number of removed documents.
    pub fn remove_batch<T: Entity>(&self, entities: &[T]) -> DbResult<usize> {
        let descriptor = self.registry.describe_type::<T>()?;
        let ids = entities
            .iter()
            .map(|entity| descriptor.id_of(&to_document(entity)?))
            .collect::<DbResult<Vec<_>>>()?;
        self.store.remove(descriptor.collection_name(), &ids)
    }

    /// Applies an update to every entity matched by the query.
    ///
    /// Returns the count of modified documents.
    pub fn find_and_modify<T: Entity>(&self, query: &str, update: &Update) -> DbResult<usize> {
        let descriptor = self.registry.describe_type::<T>()?;
        let query = jsonldb_query::parse(query)?;
        self.store
            .find_and_modify(descriptor.collection_name(), &query, update)
    }

    /// Removes every entity matched by the query; returns the count.
    pub fn find_and_remove<T: Entity>(&self, query: &str) -> DbResult<usize> {
        let descriptor = self.registry.describe_type::<T>()?;
        let query = jsonldb_query::parse(query)?;
        self.store
            .find_and_remove(descriptor.collection_name(), &query)
    }

    /// Applies a schema update to the entity type's collection.
    pub fn update_collection_schema<T: Entity>(
        &self,
        update: &CollectionSchemaUpdate,
    ) -> DbResult<()> {
        let descriptor = self.registry.describe_type::<T>()?;
        self.store
            .update_collection_schema(descriptor.collection_name(), update)
    }

    // ---------------------------------------------------------------
    // Name-keyed operations over raw documents
    // ---------------------------------------------------------------

    /// Inserts raw documents into a named collection.
    pub fn insert_into(&self, name: &str, docs: Vec<Value>) -> DbResult<()> {
        self.store.insert(name, docs)
    }

    /// Replaces an existing raw document in a named collection.
    pub fn save_in(&self, name: &str, doc: Value) -> DbResult<()> {
        self.store.save(name, doc)
    }

    /// Inserts or replaces raw documents in a named collection.
    pub fn upsert_into(&self, name: &str, docs: Vec<Value>) -> DbResult<()> {
        self.store.upsert(name, docs)
    }

    /// Removes raw documents (by their identifiers) from a named
    /// collection. Returns the number removed.
    pub fn remove_from(&self, name: &str, docs: &[Value]) -> DbResult<usize> {
        let descriptor = self.registry.describe(name)?;
        let ids = docs
            .iter()
            .map(|doc| descriptor.id_of(doc))
            .collect::<DbResult<Vec<_>>>()?;
        self.store.remove(name, &ids)
    }

    /// Finds raw documents matching a query in a named collection.
    pub fn find_in(&self, name: &str, query: &str) -> DbResult<Vec<Value>> {
        let query = jsonldb_query::parse(query)?;
        self.store.find(name, &query)
    }

    /// First raw match in iteration order, or `None`.
    pub fn find_one_in(&self, name: &str, query: &str) -> DbResult<Option<Value>> {
        let query = jsonldb_query::parse(query)?;
        self.store.find_one(name, &query)
    }

    /// All raw documents of a named collection in iteration order.
    pub fn find_all_in(&self, name: &str) -> DbResult<Vec<Value>> {
        self.store.all_documents(name)
    }

    /// Raw document lookup by identifier.
    pub fn find_by_id_in(&self, name: &str, id: &str) -> DbResult<Option<Value>> {
        self.store.find_by_id(name, id)
    }

    /// Applies an update to every document matched in a named collection.
    pub fn find_and_modify_in(
        &self,
        name: &str,
        query: &str,
        update: &Update,
    ) -> DbResult<usize> {
        let query = jsonldb_query::parse(query)?;
        self.store.find_and_modify(name, &query, update)
    }

    /// Removes every matched document in a named collection.
    pub fn find_and_remove_in(&self, name: &str, query: &str) -> DbResult<usize> {
        let query = jsonldb_query::parse(query)?;
        self.store.find_and_remove(name, &query)
    }

    /// Applies a schema update to a named collection.
    pub fn update_collection_schema_named(
        &self,
        name: &str,
        update: &CollectionSchemaUpdate,
    ) -> DbResult<()> {
        self.store.update_collection_schema(name, update)
    }

    // ---------------------------------------------------------------
    // Backup and restore
    // ---------------------------------------------------------------

    /// Writes every live collection into a fresh file tree at `path`.
    ///
    /// Secret fields stay encrypted; the key is not embedded.
    pub fn backup(&self, path: impl AsRef<Path>) -> DbResult<()> {
        self.store.backup(path.as_ref())
    }

    /// Loads collection files from `path`.
    ///
    /// With `merge = false` existing collections are replaced entirely;
    /// with `merge = true` restored documents are upserted by identifier
    /// and win on collision.
    pub fn restore(&self, path: impl AsRef<Path>, merge: bool) -> DbResult<()> {
        self.store.restore(path.as_ref(), merge)
    }

    fn check_collection_match<T: Entity>(&self, supplied: &str) -> DbResult<()> {
        let descriptor = self.registry.describe_type::<T>()?;
        if descriptor.collection_name() != supplied {
            return Err(DbError::bad_descriptor(format!(
                "entity type belongs to collection {:?}, not {supplied:?}",
                descriptor.collection_name()
            )));
        }
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("collections", &self.store.names())
            .field("watching", &self.watcher.lock().is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Site {
        id: String,
        location: String,
    }

    impl Entity for Site {
        fn collection() -> &'static str {
            "sites"
        }

        fn schema_version() -> &'static str {
            "1.0"
        }
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register::<Site>().unwrap();
        registry
    }

    fn open(dir: &Path) -> Database {
        // Watching is covered separately; keep unit tests deterministic.
        let config = Config::new(dir).watch_files(false);
        Database::open(config, registry()).unwrap()
    }

    #[test]
    fn typed_round_trip() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());

        db.create_collection::<Site>().unwrap();
        let site = Site { id: "s1".into(), location: "US-East".into() };
        db.insert(&site).unwrap();

        let found: Site = db.find_by_id("s1").unwrap().unwrap();
        assert_eq!(found, site);

        let all: Vec<Site> = db.find_all().unwrap();
        assert_eq!(all, vec![site]);
    }

    #[test]
    fn typed_and_named_paths_are_equivalent() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        db.create_collection_named("sites").unwrap();

        db.insert(&Site { id: "a".into(), location: "X".into() }).unwrap();
        db.insert_into("sites", vec![json!({"id": "b", "location": "Y"})]).unwrap();

        let typed: Vec<Site> = db.find("/.[location = 'Y']").unwrap();
        assert_eq!(typed[0].id, "b");

        let raw = db.find_in("sites", "/.[location = 'X']").unwrap();
        assert_eq!(raw[0]["id"], "a");
    }

    #[test]
    fn mismatched_explicit_collection_is_rejected() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        db.create_collection::<Site>().unwrap();

        let site = Site { id: "s1".into(), location: "US".into() };
        let result = db.insert_named(&site, "instances");
        assert!(matches!(result, Err(DbError::BadDescriptor { .. })));

        db.insert_named(&site, "sites").unwrap();
    }

    #[test]
    fn malformed_query_fails_before_touching_store() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        // Collection intentionally not created: a parse failure must win.
        let result: DbResult<Vec<Site>> = db.find("/.[oops = ");
        assert!(matches!(result, Err(DbError::InvalidQuery(_))));
    }

    #[test]
    fn second_open_is_locked_out() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());

        let config = Config::new(dir.path()).watch_files(false);
        let second = Database::open(config, registry());
        assert!(matches!(second, Err(DbError::DatabaseLocked)));

        drop(db);
        let config = Config::new(dir.path()).watch_files(false);
        Database::open(config, registry()).unwrap();
    }

    #[test]
    fn open_requires_cipher_for_secret_descriptors() {
        let dir = tempdir().unwrap();
        let mut registry = Registry::new();
        registry
            .register_descriptor(
                crate::registry::Descriptor::new("vault", "1.0", "id").secret_field("token"),
            )
            .unwrap();

        let config = Config::new(dir.path()).watch_files(false);
        let result = Database::open(config, registry);
        assert!(matches!(result, Err(DbError::CipherError { .. })));
    }

    #[test]
    fn reopen_loads_existing_collections() {
        let dir = tempdir().unwrap();
        {
            let db = open(dir.path());
            db.create_collection::<Site>().unwrap();
            db.insert(&Site { id: "s1".into(), location: "US".into() }).unwrap();
        }

        let db = open(dir.path());
        assert_eq!(db.collection_names(), vec!["sites"]);
        let found: Option<Site> = db.find_by_id("s1").unwrap();
        assert_eq!(found.unwrap().location, "US");
    }

    #[test]
    fn remove_batch_and_counts() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        db.create_collection::<Site>().unwrap();

        let sites: Vec<Site> = (0..3)
            .map(|i| Site { id: format!("s{i}"), location: "X".into() })
            .collect();
        db.insert_batch(&sites).unwrap();

        let removed = db.remove_batch(&sites[..2]).unwrap();
        assert_eq!(removed, 2);
        let all: Vec<Site> = db.find_all().unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn find_and_modify_typed() {
        let dir = tempdir().unwrap();
        let db = open(dir.path());
        db.create_collection::<Site>().unwrap();
        db.insert_batch(&[
            Site { id: "a".into(), location: "EU".into() },
            Site { id: "b".into(), location: "EU".into() },
            Site { id: "c".into(), location: "US".into() },
        ])
        .unwrap();

        let update = Update::new().set("location", json!("X"));
        let count = db.find_and_modify::<Site>("/.[location = 'EU']", &update).unwrap();
        assert_eq!(count, 2);

        let moved: Vec<Site> = db.find("/.[location = 'X']").unwrap();
        assert_eq!(moved.len(), 2);
    }
}
