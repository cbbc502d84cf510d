//! End-to-end tests exercising the full database: create, insert, query,
//! schema versioning, secret fields, find-and-modify, and watcher-driven
//! reload of external edits.

use jsonldb_core::{
    ChangeKind, CipherKey, CollectionFileChangeListener, Config, Database, DbError, Entity,
    Registry, Update,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
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

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Instance {
    id: String,
    hostname: String,
    #[serde(rename = "privateKey")]
    private_key: String,
    #[serde(rename = "publicKey")]
    public_key: String,
}

impl Entity for Instance {
    fn collection() -> &'static str {
        "instances"
    }

    fn schema_version() -> &'static str {
        "1.0"
    }

    fn secret_fields() -> &'static [&'static str] {
        &["privateKey"]
    }
}

fn registry() -> Registry {
    let mut registry = Registry::new();
    registry.register::<Site>().unwrap();
    registry.register::<Instance>().unwrap();
    registry
}

fn open(dir: &Path) -> Database {
    let config = Config::new(dir)
        .cipher_key(CipherKey::generate())
        .watch_files(false);
    Database::open(config, registry()).unwrap()
}

fn open_watching(dir: &Path, debounce: Duration) -> Database {
    let config = Config::new(dir)
        .cipher_key(CipherKey::generate())
        .debounce_window(debounce);
    Database::open(config, registry()).unwrap()
}

#[test]
fn create_and_insert() {
    let dir = tempdir().unwrap();
    let db = open(dir.path());

    db.create_collection::<Site>().unwrap();
    let site = Site { id: "s1".into(), location: "US-East".into() };
    db.insert(&site).unwrap();

    let found: Site = db.find_by_id("s1").unwrap().unwrap();
    assert_eq!(found, site);

    // Header plus exactly one document line.
    let content = fs::read_to_string(dir.path().join("sites.json")).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], r#"{"schemaVersion":"1.0"}"#);
}

#[test]
fn schema_mismatch_marks_collection_readonly() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join("sites.json"),
        "{\"schemaVersion\":\"2.0\"}\n{\"id\":\"s1\",\"location\":\"EU\"}\n",
    )
    .unwrap();

    let db = open(dir.path());
    assert!(db.is_collection_readonly::<Site>().unwrap());

    let result = db.insert(&Site { id: "s2".into(), location: "US".into() });
    assert!(matches!(result, Err(DbError::CollectionReadOnly { .. })));

    // Reads still work against the read-only collection.
    let found: Site = db.find_by_id("s1").unwrap().unwrap();
    assert_eq!(found.location, "EU");
}

#[test]
fn secret_field_is_encrypted_at_rest() {
    let dir = tempdir().unwrap();
    let db = open(dir.path());

    db.create_collection::<Instance>().unwrap();
    db.insert(&Instance {
        id: "i1".into(),
        hostname: "a".into(),
        private_key: "pk".into(),
        public_key: "pub".into(),
    })
    .unwrap();

    let content = fs::read_to_string(dir.path().join("instances.json")).unwrap();
    assert!(!content.contains("\"pk\""), "plaintext secret leaked to disk");
    assert!(content.contains("\"pub\""), "non-secret fields stay cleartext");

    let found: Instance = db.find_by_id("i1").unwrap().unwrap();
    assert_eq!(found.private_key, "pk");
}

#[test]
fn query_selects_matching_documents() {
    let dir = tempdir().unwrap();
    let db = open(dir.path());
    db.create_collection::<Instance>().unwrap();

    for hostname in ["a", "b", "c"] {
        db.insert(&Instance {
            id: format!("i-{hostname}"),
            hostname: hostname.into(),
            private_key: format!("pk-{hostname}"),
            public_key: format!("pub-{hostname}"),
        })
        .unwrap();
    }

    let matches: Vec<Instance> = db.find("/.[hostname = 'b']").unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].id, "i-b");
    // Matches come back decrypted.
    assert_eq!(matches[0].private_key, "pk-b");
}

#[test]
fn find_and_modify_updates_matches_and_reports_count() {
    let dir = tempdir().unwrap();
    let db = open(dir.path());
    db.create_collection::<Site>().unwrap();

    db.insert_batch(&[
        Site { id: "1".into(), location: "EU-West".into() },
        Site { id: "2".into(), location: "EU-West".into() },
        Site { id: "3".into(), location: "US-East".into() },
    ])
    .unwrap();

    let update = Update::new().set("location", json!("X"));
    let count = db
        .find_and_modify::<Site>("/.[location = 'EU-West']", &update)
        .unwrap();
    assert_eq!(count, 2);

    let moved: Vec<Site> = db.find("/.[location = 'X']").unwrap();
    assert_eq!(moved.len(), 2);
    let untouched: Site = db.find_by_id("3").unwrap().unwrap();
    assert_eq!(untouched.location, "US-East");
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<(ChangeKind, String)>>,
}

impl CollectionFileChangeListener for Recorder {
    fn on_collection_file_modified(&self, collection: &str) {
        self.events
            .lock()
            .push((ChangeKind::Modified, collection.to_string()));
    }

    fn on_collection_file_added(&self, collection: &str) {
        self.events
            .lock()
            .push((ChangeKind::Added, collection.to_string()));
    }

    fn on_collection_file_deleted(&self, collection: &str) {
        self.events
            .lock()
            .push((ChangeKind::Deleted, collection.to_string()));
    }
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let limit = Instant::now() + deadline;
    while Instant::now() < limit {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(25));
    }
    done()
}

#[test]
fn external_edit_is_picked_up_by_the_watcher() {
    let dir = tempdir().unwrap();
    let db = open_watching(dir.path(), Duration::from_millis(60));

    db.create_collection::<Site>().unwrap();
    db.insert(&Site { id: "s1".into(), location: "US".into() }).unwrap();

    let recorder = Arc::new(Recorder::default());
    let listener: Arc<dyn CollectionFileChangeListener> = recorder.clone();
    db.add_collection_file_change_listener(Arc::clone(&listener));

    // Another process rewrites the collection file with one more record.
    fs::write(
        dir.path().join("sites.json"),
        "{\"schemaVersion\":\"1.0\"}\n\
         {\"id\":\"s1\",\"location\":\"US\"}\n\
         {\"id\":\"s2\",\"location\":\"EU\"}\n",
    )
    .unwrap();

    let notified = wait_until(Duration::from_secs(5), || {
        recorder
            .events
            .lock()
            .iter()
            .any(|(kind, name)| *kind == ChangeKind::Modified && name == "sites")
    });
    assert!(notified, "listener never observed the external edit");

    let reloaded = wait_until(Duration::from_secs(5), || {
        db.find_by_id::<Site>("s2").unwrap().is_some()
    });
    assert!(reloaded, "external record never became visible");

    db.shutdown();
}

#[test]
fn external_file_deletion_evicts_the_collection() {
    let dir = tempdir().unwrap();
    let db = open_watching(dir.path(), Duration::from_millis(60));
    db.create_collection::<Site>().unwrap();

    let recorder = Arc::new(Recorder::default());
    let listener: Arc<dyn CollectionFileChangeListener> = recorder.clone();
    db.add_collection_file_change_listener(listener);

    fs::remove_file(dir.path().join("sites.json")).unwrap();

    let deleted = wait_until(Duration::from_secs(5), || {
        recorder
            .events
            .lock()
            .iter()
            .any(|(kind, name)| *kind == ChangeKind::Deleted && name == "sites")
    });
    assert!(deleted, "listener never observed the deletion");

    assert!(wait_until(Duration::from_secs(5), || {
        !db.collection_exists_named("sites")
    }));

    db.shutdown();
}

#[test]
fn mutating_listener_is_rejected_as_reentrant() {
    #[derive(Default)]
    struct Mutator {
        db: Mutex<Option<Arc<Database>>>,
        outcome: Mutex<Option<Result<(), DbError>>>,
    }

    impl CollectionFileChangeListener for Mutator {
        fn on_collection_file_modified(&self, collection: &str) {
            if let Some(db) = self.db.lock().as_ref() {
                let result = db.insert_into(collection, vec![json!({"id": "from-listener"})]);
                *self.outcome.lock() = Some(result);
            }
        }
    }

    let dir = tempdir().unwrap();
    let db = Arc::new(open_watching(dir.path(), Duration::from_millis(60)));
    db.create_collection::<Site>().unwrap();

    let mutator = Arc::new(Mutator::default());
    *mutator.db.lock() = Some(Arc::clone(&db));
    let listener: Arc<dyn CollectionFileChangeListener> = mutator.clone();
    db.add_collection_file_change_listener(listener);

    fs::write(
        dir.path().join("sites.json"),
        "{\"schemaVersion\":\"1.0\"}\n{\"id\":\"s1\",\"location\":\"US\"}\n",
    )
    .unwrap();

    let fired = wait_until(Duration::from_secs(5), || mutator.outcome.lock().is_some());
    assert!(fired, "listener never fired");
    assert!(matches!(
        mutator.outcome.lock().take(),
        Some(Err(DbError::ReentrantMutation { .. }))
    ));

    // Break the listener ↔ database cycle before dropping.
    *mutator.db.lock() = None;
    db.shutdown();
}

#[test]
fn concurrent_readers_and_writers_stay_consistent() {
    let dir = tempdir().unwrap();
    let db = Arc::new(open(dir.path()));
    db.create_collection::<Site>().unwrap();

    let writers: Vec<_> = (0..4)
        .map(|w| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for i in 0..25 {
                    db.insert(&Site {
                        id: format!("w{w}-{i}"),
                        location: "X".into(),
                    })
                    .unwrap();
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for _ in 0..50 {
                    // Every observed state is a complete snapshot.
                    let all: Vec<Site> = db.find_all().unwrap();
                    for site in &all {
                        assert_eq!(site.location, "X");
                    }
                }
            })
        })
        .collect();

    for handle in writers {
        handle.join().unwrap();
    }
    for handle in readers {
        handle.join().unwrap();
    }

    let all: Vec<Site> = db.find_all().unwrap();
    assert_eq!(all.len(), 100);

    // Disk agrees with memory after the dust settles.
    db.reload_collection("sites").unwrap();
    let reloaded: Vec<Site> = db.find_all().unwrap();
    assert_eq!(reloaded.len(), 100);
}

#[test]
fn backup_and_restore_round_trip() {
    let dir = tempdir().unwrap();
    let db = open(dir.path());
    db.create_collection::<Site>().unwrap();
    db.insert_batch(&[
        Site { id: "a".into(), location: "1".into() },
        Site { id: "b".into(), location: "2".into() },
    ])
    .unwrap();

    let backup = tempdir().unwrap();
    db.backup(backup.path()).unwrap();

    db.remove(&Site { id: "a".into(), location: "1".into() }).unwrap();
    db.insert(&Site { id: "c".into(), location: "3".into() }).unwrap();

    db.restore(backup.path(), false).unwrap();
    let mut ids: Vec<String> = db.find_all::<Site>().unwrap().into_iter().map(|s| s.id).collect();
    ids.sort();
    assert_eq!(ids, ["a", "b"]);
}

#[test]
fn upsert_never_fails_on_preexistence() {
    let dir = tempdir().unwrap();
    let db = open(dir.path());
    db.create_collection::<Site>().unwrap();

    let site = Site { id: "s1".into(), location: "US".into() };
    db.upsert(&site).unwrap();
    db.upsert(&Site { id: "s1".into(), location: "EU".into() }).unwrap();

    let found: Site = db.find_by_id("s1").unwrap().unwrap();
    assert_eq!(found.location, "EU");
    assert_eq!(db.find_all::<Site>().unwrap().len(), 1);
}
