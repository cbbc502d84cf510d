//! The file journal.
//!
//! Persists one collection per file under the database directory:
//!
//! ```text
//! <db_path>/
//! ├─ sites.json          # line 1: header, lines 2..N: one document each
//! ├─ instances.json
//! └─ sites.json.tmp      # in-flight rewrite (discarded at load if stale)
//! ```
//!
//! The primary operation is the **atomic rewrite**: the new content is
//! written to a sibling temporary file, flushed and synced, then renamed
//! over the target, and the directory entry is fsynced. A crash leaves
//! either the old file or the new file, never a mix.
//!
//! The secondary operation is **append**, used as a fast path for pure
//! inserts. A crash mid-append can leave a truncated final line; the
//! loader accepts any prefix of complete lines and ignores a trailing
//! partial line without a terminating newline.

use crate::codec::{decode_line, encode_line, SchemaHeader};
use crate::error::{DbError, DbResult};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Extension of collection files.
const COLLECTION_EXT: &str = "json";
/// Suffix of in-flight rewrite temporaries.
const TEMP_SUFFIX: &str = ".tmp";

/// Content of one collection file, as loaded from disk.
#[derive(Debug, Clone)]
pub struct LoadedCollection {
    /// Schema version from the header line.
    pub schema_version: String,
    /// Documents in file order.
    pub documents: Vec<Value>,
}

/// Reads and writes collection files under the database directory.
#[derive(Debug)]
pub struct Journal {
    dir: PathBuf,
    sync_on_write: bool,
}

impl Journal {
    /// Creates a journal rooted at the given directory.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, sync_on_write: bool) -> Self {
        Self {
            dir: dir.into(),
            sync_on_write,
        }
    }

    /// The directory holding the collection files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a collection's file.
    #[must_use]
    pub fn collection_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{COLLECTION_EXT}"))
    }

    fn temp_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{COLLECTION_EXT}{TEMP_SUFFIX}"))
    }

    /// Returns `true` if the collection has a file on disk.
    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.collection_path(name).exists()
    }

    /// Returns `true` if the collection file exists and has any content.
    #[must_use]
    pub fn exists_non_empty(&self, name: &str) -> bool {
        fs::metadata(self.collection_path(name))
            .map(|m| m.len() > 0)
            .unwrap_or(false)
    }

    /// Lists the collection names that have files on disk, sorted.
    pub fn list_collections(&self) -> DbResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(COLLECTION_EXT) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Removes stale rewrite temporaries left by a crash.
    pub fn discard_stale_temps(&self) -> DbResult<()> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(TEMP_SUFFIX));
            if is_temp {
                debug!(path = %path.display(), "discarding stale rewrite temporary");
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    /// Loads a collection file.
    ///
    /// Any stale rewrite temporary for the collection is discarded first.
    /// A trailing partial line without a terminating newline (a crashed
    /// append) is ignored; a malformed interior line aborts the load.
    ///
    /// # Errors
    ///
    /// - `SchemaHeaderMissing` if the file is empty or line 1 is not a
    ///   header record
    /// - `CorruptCollection` with the 1-based line number of the first
    ///   unparseable document line
    /// - `IoError` for filesystem failures
    pub fn load(&self, name: &str) -> DbResult<LoadedCollection> {
        let temp = self.temp_path(name);
        if temp.exists() {
            debug!(collection = name, "discarding stale rewrite temporary");
            fs::remove_file(&temp)?;
        }

        let content = fs::read_to_string(self.collection_path(name))?;
        let ends_with_newline = content.ends_with('\n');

        let mut lines = content.split('\n').collect::<Vec<_>>();
        // A terminated final line leaves one empty trailing element.
        if ends_with_newline {
            lines.pop();
        }

        let Some((header_line, doc_lines)) = lines.split_first() else {
            return Err(DbError::SchemaHeaderMissing { collection: name.to_string() });
        };
        let header = SchemaHeader::decode(header_line).ok_or_else(|| DbError::SchemaHeaderMissing {
            collection: name.to_string(),
        })?;

        let mut documents = Vec::with_capacity(doc_lines.len());
        for (index, line) in doc_lines.iter().enumerate() {
            match decode_line(line) {
                Ok(doc) => documents.push(doc),
                Err(_) => {
                    let is_last = index + 1 == doc_lines.len();
                    if is_last && !ends_with_newline {
                        // Truncated append; the prefix is the collection.
                        debug!(collection = name, "ignoring truncated trailing line");
                        break;
                    }
                    return Err(DbError::CorruptCollection {
                        collection: name.to_string(),
                        // Header is line 1; documents start at line 2.
                        line: index + 2,
                    });
                }
            }
        }

        Ok(LoadedCollection {
            schema_version: header.schema_version,
            documents,
        })
    }

    /// Atomically replaces a collection file with the given content.
    ///
    /// Writes to a sibling temporary in the same directory, flushes and
    /// syncs it, renames it over the target, then fsyncs the directory so
    /// the replacement survives a crash.
    pub fn rewrite<'a, I>(&self, name: &str, header: &SchemaHeader, documents: I) -> DbResult<()>
    where
        I: IntoIterator<Item = &'a Value>,
    {
        let temp = self.temp_path(name);
        let target = self.collection_path(name);

        let mut buffer = String::new();
        buffer.push_str(&header.encode());
        buffer.push('\n');
        for doc in documents {
            buffer.push_str(&encode_line(doc)?);
            buffer.push('\n');
        }

        let mut file = File::create(&temp)?;
        file.write_all(buffer.as_bytes())?;
        file.flush()?;
        if self.sync_on_write {
            file.sync_all()?;
        }
        drop(file);

        fs::rename(&temp, &target)?;
        self.sync_dir()?;
        Ok(())
    }

    /// Appends documents to an existing collection file.
    ///
    /// All lines are written in a single buffered write and synced once.
    /// Only usable for pure inserts; every other mutation goes through
    /// [`rewrite`](Self::rewrite).
    pub fn append<'a, I>(&self, name: &str, documents: I) -> DbResult<()>
    where
        I: IntoIterator<Item = &'a Value>,
    {
        let mut buffer = String::new();
        for doc in documents {
            buffer.push_str(&encode_line(doc)?);
            buffer.push('\n');
        }

        let mut file = OpenOptions::new()
            .append(true)
            .open(self.collection_path(name))?;
        file.write_all(buffer.as_bytes())?;
        file.flush()?;
        if self.sync_on_write {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Deletes a collection file.
    pub fn remove(&self, name: &str) -> DbResult<()> {
        fs::remove_file(self.collection_path(name))?;
        self.sync_dir()?;
        Ok(())
    }

    /// Syncs the directory entry so renames and deletions are durable.
    #[cfg(unix)]
    fn sync_dir(&self) -> DbResult<()> {
        if self.sync_on_write {
            let dir = File::open(&self.dir)?;
            dir.sync_all()?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> DbResult<()> {
        // NTFS journaling covers directory metadata durability.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn journal(dir: &Path) -> Journal {
        Journal::new(dir, true)
    }

    #[test]
    fn rewrite_then_load_round_trip() {
        let temp = tempdir().unwrap();
        let journal = journal(temp.path());

        let docs = vec![json!({"id": "a", "n": 1}), json!({"id": "b", "n": 2})];
        journal
            .rewrite("sites", &SchemaHeader::new("1.0"), docs.iter())
            .unwrap();

        let loaded = journal.load("sites").unwrap();
        assert_eq!(loaded.schema_version, "1.0");
        assert_eq!(loaded.documents, docs);
    }

    #[test]
    fn file_layout_is_header_plus_one_line_per_document() {
        let temp = tempdir().unwrap();
        let journal = journal(temp.path());

        journal
            .rewrite("sites", &SchemaHeader::new("1.0"), [&json!({"id": "s1"})])
            .unwrap();

        let content = fs::read_to_string(journal.collection_path("sites")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], r#"{"schemaVersion":"1.0"}"#);
        assert_eq!(lines[1], r#"{"id":"s1"}"#);
    }

    #[test]
    fn missing_header_is_rejected() {
        let temp = tempdir().unwrap();
        let journal = journal(temp.path());
        let path = journal.collection_path("sites");

        fs::write(&path, "").unwrap();
        assert!(matches!(
            journal.load("sites"),
            Err(DbError::SchemaHeaderMissing { .. })
        ));

        fs::write(&path, "{\"id\":\"no-header\"}\n").unwrap();
        assert!(matches!(
            journal.load("sites"),
            Err(DbError::SchemaHeaderMissing { .. })
        ));
    }

    #[test]
    fn corrupt_interior_line_reports_line_number() {
        let temp = tempdir().unwrap();
        let journal = journal(temp.path());
        let path = journal.collection_path("sites");

        fs::write(
            &path,
            "{\"schemaVersion\":\"1.0\"}\n{\"id\":\"a\"}\nnot json\n{\"id\":\"b\"}\n",
        )
        .unwrap();

        match journal.load("sites") {
            Err(DbError::CorruptCollection { collection, line }) => {
                assert_eq!(collection, "sites");
                assert_eq!(line, 3);
            }
            other => panic!("expected CorruptCollection, got {other:?}"),
        }
    }

    #[test]
    fn truncated_trailing_line_is_ignored() {
        let temp = tempdir().unwrap();
        let journal = journal(temp.path());
        let path = journal.collection_path("sites");

        fs::write(
            &path,
            "{\"schemaVersion\":\"1.0\"}\n{\"id\":\"a\"}\n{\"id\":\"b",
        )
        .unwrap();

        let loaded = journal.load("sites").unwrap();
        assert_eq!(loaded.documents, vec![json!({"id": "a"})]);
    }

    #[test]
    fn complete_unterminated_trailing_line_is_kept() {
        let temp = tempdir().unwrap();
        let journal = journal(temp.path());
        let path = journal.collection_path("sites");

        fs::write(&path, "{\"schemaVersion\":\"1.0\"}\n{\"id\":\"a\"}").unwrap();

        let loaded = journal.load("sites").unwrap();
        assert_eq!(loaded.documents, vec![json!({"id": "a"})]);
    }

    #[test]
    fn append_extends_existing_file() {
        let temp = tempdir().unwrap();
        let journal = journal(temp.path());

        journal
            .rewrite("sites", &SchemaHeader::new("1.0"), [&json!({"id": "a"})])
            .unwrap();
        journal.append("sites", [&json!({"id": "b"})]).unwrap();

        let loaded = journal.load("sites").unwrap();
        assert_eq!(loaded.documents.len(), 2);
        assert_eq!(loaded.documents[1], json!({"id": "b"}));
    }

    #[test]
    fn stale_temp_discarded_on_load() {
        let temp = tempdir().unwrap();
        let journal = journal(temp.path());

        journal
            .rewrite("sites", &SchemaHeader::new("1.0"), [&json!({"id": "a"})])
            .unwrap();

        let temp_path = temp.path().join("sites.json.tmp");
        fs::write(&temp_path, "partial rewrite").unwrap();

        let loaded = journal.load("sites").unwrap();
        assert_eq!(loaded.documents.len(), 1);
        assert!(!temp_path.exists());
    }

    #[test]
    fn discard_stale_temps_sweeps_directory() {
        let temp = tempdir().unwrap();
        let journal = journal(temp.path());

        fs::write(temp.path().join("a.json.tmp"), "x").unwrap();
        fs::write(temp.path().join("b.json.tmp"), "y").unwrap();
        journal.discard_stale_temps().unwrap();

        assert!(!temp.path().join("a.json.tmp").exists());
        assert!(!temp.path().join("b.json.tmp").exists());
    }

    #[test]
    fn list_collections_skips_temporaries() {
        let temp = tempdir().unwrap();
        let journal = journal(temp.path());

        journal
            .rewrite("sites", &SchemaHeader::new("1.0"), std::iter::empty::<&Value>())
            .unwrap();
        journal
            .rewrite("instances", &SchemaHeader::new("1.0"), std::iter::empty::<&Value>())
            .unwrap();
        fs::write(temp.path().join("sites.json.tmp"), "x").unwrap();
        fs::write(temp.path().join("notes.txt"), "x").unwrap();

        assert_eq!(journal.list_collections().unwrap(), vec!["instances", "sites"]);
    }

    #[test]
    fn remove_deletes_file() {
        let temp = tempdir().unwrap();
        let journal = journal(temp.path());

        journal
            .rewrite("sites", &SchemaHeader::new("1.0"), std::iter::empty::<&Value>())
            .unwrap();
        assert!(journal.exists("sites"));

        journal.remove("sites").unwrap();
        assert!(!journal.exists("sites"));
    }
}
