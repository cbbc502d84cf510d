//! Database configuration.

use crate::cipher::CipherKey;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the collection files.
    pub db_files_location: PathBuf,

    /// Key for encrypting secret fields.
    ///
    /// Required if any registered descriptor declares secret fields.
    pub cipher_key: Option<CipherKey>,

    /// Debounce window for coalescing file-change events.
    pub debounce_window: Duration,

    /// Whether to fsync collection files on every write (safer but slower).
    pub sync_on_write: bool,

    /// Whether to watch collection files for external edits.
    pub watch_files: bool,
}

impl Config {
    /// Creates a configuration rooted at the given database directory.
    #[must_use]
    pub fn new(db_files_location: impl Into<PathBuf>) -> Self {
        Self {
            db_files_location: db_files_location.into(),
            cipher_key: None,
            debounce_window: Duration::from_millis(150),
            sync_on_write: true,
            watch_files: true,
        }
    }

    /// Sets the key used for secret-field encryption.
    #[must_use]
    pub fn cipher_key(mut self, key: CipherKey) -> Self {
        self.cipher_key = Some(key);
        self
    }

    /// Sets the file-watcher debounce window.
    #[must_use]
    pub const fn debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window = window;
        self
    }

    /// Sets whether to fsync collection files on every write.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Sets whether to watch collection files for external edits.
    #[must_use]
    pub const fn watch_files(mut self, value: bool) -> Self {
        self.watch_files = value;
        self
    }
}
