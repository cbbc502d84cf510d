//! File watching and change-listener dispatch.
//!
//! A native watcher observes the database directory and maps each event to
//! a collection name by filename stem. Bursts of events for the same
//! collection are coalesced within a debounce window by a dispatcher
//! thread; each coalesced event triggers one reload through the handler
//! installed by the database, followed by listener notification. The
//! dispatcher never holds store locks while listeners run: the handler
//! finishes its store work before notification starts.
//!
//! Listeners may not mutate the collection they are being notified about;
//! the store rejects such calls with `ReentrantMutation` via a
//! thread-local dispatch guard instead of deadlocking.

use crate::error::{DbError, DbResult};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// The kind of change observed on a collection file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// The file appeared.
    Added,
    /// The file's content changed.
    Modified,
    /// The file was deleted.
    Deleted,
}

/// Receives post-reload notifications about collection file changes.
///
/// All methods have empty default bodies so implementors subscribe only to
/// the events they care about. Callbacks run on the watcher thread;
/// mutating the same collection from within one yields
/// `ReentrantMutation`.
pub trait CollectionFileChangeListener: Send + Sync {
    /// An existing collection file was modified externally.
    fn on_collection_file_modified(&self, _collection: &str) {}

    /// A collection file appeared.
    fn on_collection_file_added(&self, _collection: &str) {}

    /// A collection file was deleted.
    fn on_collection_file_deleted(&self, _collection: &str) {}
}

thread_local! {
    /// Collections currently being dispatched to listeners on this thread.
    static DISPATCHING: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Returns `true` if a listener callback for this collection is running on
/// the current thread.
pub(crate) fn is_dispatching(collection: &str) -> bool {
    DISPATCHING.with(|stack| stack.borrow().iter().any(|name| name == collection))
}

struct DispatchGuard;

impl DispatchGuard {
    fn enter(collection: &str) -> Self {
        DISPATCHING.with(|stack| stack.borrow_mut().push(collection.to_string()));
        Self
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        DISPATCHING.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// The registered change listeners.
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<Vec<Arc<dyn CollectionFileChangeListener>>>,
}

impl ListenerSet {
    /// Creates an empty listener set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener.
    pub fn add(&self, listener: Arc<dyn CollectionFileChangeListener>) {
        self.listeners.write().push(listener);
    }

    /// Removes a previously registered listener (by identity).
    pub fn remove(&self, listener: &Arc<dyn CollectionFileChangeListener>) {
        self.listeners
            .write()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Whether no listeners are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Dispatches one event to every listener.
    ///
    /// The listener list is cloned out of the lock first, so listeners can
    /// add or remove listeners without deadlocking.
    pub(crate) fn notify(&self, kind: ChangeKind, collection: &str) {
        let listeners = self.listeners.read().clone();
        if listeners.is_empty() {
            return;
        }
        let _guard = DispatchGuard::enter(collection);
        for listener in listeners {
            match kind {
                ChangeKind::Added => listener.on_collection_file_added(collection),
                ChangeKind::Modified => listener.on_collection_file_modified(collection),
                ChangeKind::Deleted => listener.on_collection_file_deleted(collection),
            }
        }
    }
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet").field("len", &self.len()).finish()
    }
}

enum Message {
    Event { collection: String, kind: ChangeKind },
    Shutdown,
}

/// Watches the database directory for external edits.
///
/// Owns the native watcher and the debouncing dispatcher thread. Dropping
/// the watcher shuts both down; [`shutdown`](Self::shutdown) does the same
/// explicitly and drains pending reloads first.
pub struct FileWatcher {
    // Field order matters on drop: stop the native watcher before the
    // channel sender goes away.
    _watcher: RecommendedWatcher,
    sender: Sender<Message>,
    handle: Option<JoinHandle<()>>,
}

impl FileWatcher {
    /// Starts watching `dir`.
    ///
    /// `handler` runs on the dispatcher thread once per coalesced event,
    /// before listeners are notified of the same event.
    pub fn start<F>(dir: &Path, debounce: Duration, handler: F) -> DbResult<Self>
    where
        F: Fn(ChangeKind, &str) + Send + 'static,
    {
        let (sender, receiver) = channel::<Message>();

        let event_sender = sender.clone();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            match result {
                Ok(event) => {
                    let Some(kind) = map_event_kind(&event.kind) else {
                        return;
                    };
                    for path in &event.paths {
                        if let Some(collection) = collection_name(path) {
                            let _ = event_sender.send(Message::Event {
                                collection: collection.to_string(),
                                kind,
                            });
                        }
                    }
                }
                Err(error) => warn!(%error, "file watcher error"),
            }
        })
        .map_err(notify_io)?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(notify_io)?;

        let handle = thread::Builder::new()
            .name("jsonldb-watcher".to_string())
            .spawn(move || {
                let mut pending: HashMap<String, (ChangeKind, Instant)> = HashMap::new();

                loop {
                    let message = if pending.is_empty() {
                        match receiver.recv() {
                            Ok(message) => Some(message),
                            Err(_) => break,
                        }
                    } else {
                        // Sleep until the earliest pending entry is due.
                        let deadline = pending
                            .values()
                            .map(|(_, seen)| *seen + debounce)
                            .min()
                            .unwrap_or_else(Instant::now);
                        let now = Instant::now();
                        if deadline <= now {
                            None
                        } else {
                            match receiver.recv_timeout(deadline - now) {
                                Ok(message) => Some(message),
                                Err(RecvTimeoutError::Timeout) => None,
                                Err(RecvTimeoutError::Disconnected) => break,
                            }
                        }
                    };

                    match message {
                        Some(Message::Shutdown) => break,
                        Some(Message::Event { collection, kind }) => {
                            let entry = pending
                                .entry(collection)
                                .or_insert((kind, Instant::now()));
                            entry.0 = merge_kind(entry.0, kind);
                            entry.1 = Instant::now();
                        }
                        None => {
                            let now = Instant::now();
                            let due: Vec<String> = pending
                                .iter()
                                .filter(|(_, (_, seen))| *seen + debounce <= now)
                                .map(|(name, _)| name.clone())
                                .collect();
                            for name in due {
                                if let Some((kind, _)) = pending.remove(&name) {
                                    debug!(collection = %name, ?kind, "dispatching file change");
                                    handler(kind, &name);
                                }
                            }
                        }
                    }
                }

                // Drain whatever is still pending before exiting.
                for (name, (kind, _)) in pending.drain() {
                    handler(kind, &name);
                }
            })?;

        Ok(Self {
            _watcher: watcher,
            sender,
            handle: Some(handle),
        })
    }

    /// Stops the watcher and drains pending reloads.
    pub fn shutdown(&mut self) {
        let _ = self.sender.send(Message::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher")
            .field("running", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}

fn notify_io(error: notify::Error) -> DbError {
    DbError::Io(io::Error::other(error))
}

/// Maps a filesystem event to a change kind. Access events are ignored.
fn map_event_kind(kind: &EventKind) -> Option<ChangeKind> {
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Added),
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        EventKind::Remove(_) => Some(ChangeKind::Deleted),
        _ => None,
    }
}

/// Extracts the collection name from an event path.
///
/// Only `<name>.json` files count; rewrite temporaries (`.json.tmp`) and
/// unrelated files are ignored.
fn collection_name(path: &Path) -> Option<&str> {
    if path.extension()?.to_str()? != "json" {
        return None;
    }
    path.file_stem()?.to_str()
}

fn merge_kind(old: ChangeKind, new: ChangeKind) -> ChangeKind {
    match (old, new) {
        // A freshly created file that is then written within the window is
        // still an addition from the observer's point of view.
        (ChangeKind::Added, ChangeKind::Modified) => ChangeKind::Added,
        (_, new) => new,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::tempdir;

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

    #[test]
    fn listener_set_add_remove_notify() {
        let set = ListenerSet::new();
        let recorder = Arc::new(Recorder::default());
        let listener: Arc<dyn CollectionFileChangeListener> = recorder.clone();

        set.add(Arc::clone(&listener));
        assert_eq!(set.len(), 1);

        set.notify(ChangeKind::Modified, "sites");
        set.notify(ChangeKind::Deleted, "sites");
        assert_eq!(
            *recorder.events.lock(),
            vec![
                (ChangeKind::Modified, "sites".to_string()),
                (ChangeKind::Deleted, "sites".to_string()),
            ]
        );

        set.remove(&listener);
        assert!(set.is_empty());
        set.notify(ChangeKind::Modified, "sites");
        assert_eq!(recorder.events.lock().len(), 2);
    }

    #[test]
    fn dispatch_guard_flags_current_collection_only() {
        struct Probe;
        impl CollectionFileChangeListener for Probe {
            fn on_collection_file_modified(&self, collection: &str) {
                assert!(is_dispatching(collection));
                assert!(!is_dispatching("other"));
            }
        }

        let set = ListenerSet::new();
        set.add(Arc::new(Probe));
        assert!(!is_dispatching("sites"));
        set.notify(ChangeKind::Modified, "sites");
        assert!(!is_dispatching("sites"));
    }

    #[test]
    fn collection_name_filters_temporaries() {
        assert_eq!(collection_name(&PathBuf::from("/db/sites.json")), Some("sites"));
        assert_eq!(collection_name(&PathBuf::from("/db/sites.json.tmp")), None);
        assert_eq!(collection_name(&PathBuf::from("/db/notes.txt")), None);
    }

    #[test]
    fn merge_keeps_added_over_modified() {
        assert_eq!(
            merge_kind(ChangeKind::Added, ChangeKind::Modified),
            ChangeKind::Added
        );
        assert_eq!(
            merge_kind(ChangeKind::Modified, ChangeKind::Deleted),
            ChangeKind::Deleted
        );
    }

    #[test]
    fn watcher_debounces_bursts_into_one_dispatch() {
        let dir = tempdir().unwrap();
        let seen: Arc<Mutex<Vec<(ChangeKind, String)>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let mut watcher = FileWatcher::start(
            dir.path(),
            Duration::from_millis(80),
            move |kind, name| {
                sink.lock().push((kind, name.to_string()));
            },
        )
        .unwrap();

        // A burst of writes to the same collection file.
        let path = dir.path().join("sites.json");
        for i in 0..5 {
            fs::write(&path, format!("{{\"schemaVersion\":\"1.0\"}}\nburst {i}\n")).unwrap();
        }

        // Wait out the debounce window plus epsilon.
        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.lock().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        watcher.shutdown();

        let events = seen.lock();
        assert_eq!(events.len(), 1, "burst should coalesce: {events:?}");
        assert_eq!(events[0].1, "sites");
    }

    #[test]
    fn watcher_reports_deletion() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sites.json");
        fs::write(&path, "{\"schemaVersion\":\"1.0\"}\n").unwrap();

        let seen: Arc<Mutex<Vec<(ChangeKind, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut watcher = FileWatcher::start(
            dir.path(),
            Duration::from_millis(40),
            move |kind, name| {
                sink.lock().push((kind, name.to_string()));
            },
        )
        .unwrap();

        fs::remove_file(&path).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.lock().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        watcher.shutdown();

        let events = seen.lock();
        assert!(
            events.contains(&(ChangeKind::Deleted, "sites".to_string())),
            "expected a deletion event: {events:?}"
        );
    }
}
