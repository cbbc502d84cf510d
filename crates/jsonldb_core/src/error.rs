//! Error types for jsonldb core.

use std::io;
use thiserror::Error;

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// Errors that can occur in jsonldb operations.
///
/// Every mutating operation either fully succeeds or fails with one of
/// these while leaving the target collection unchanged in memory and on
/// disk.
#[derive(Debug, Error)]
pub enum DbError {
    /// The named collection is not loaded and has no file on disk.
    #[error("collection not found: {name}")]
    CollectionNotFound {
        /// Name of the collection.
        name: String,
    },

    /// A collection with this name already exists.
    #[error("collection already exists: {name}")]
    CollectionExists {
        /// Name of the collection.
        name: String,
    },

    /// The collection is read-only due to a schema version mismatch.
    #[error("collection is read-only: {name} (file schema {actual}, descriptor schema {declared})")]
    CollectionReadOnly {
        /// Name of the collection.
        name: String,
        /// Schema version found in the file header.
        actual: String,
        /// Schema version the descriptor declares.
        declared: String,
    },

    /// A document with the given identifier does not exist.
    #[error("document not found in collection {collection}: id {id:?}")]
    DocumentNotFound {
        /// Collection that was searched.
        collection: String,
        /// The missing identifier.
        id: String,
    },

    /// A document with the given identifier already exists.
    #[error("duplicate id in collection {collection}: {id:?}")]
    DuplicateId {
        /// Collection the insert targeted.
        collection: String,
        /// The colliding identifier.
        id: String,
    },

    /// A document failed structural validation.
    #[error("invalid document: {message}")]
    InvalidDocument {
        /// Description of the violation.
        message: String,
    },

    /// The query expression could not be parsed.
    #[error("invalid query: {0}")]
    InvalidQuery(#[from] jsonldb_query::QueryError),

    /// A collection file contains an unparseable document line.
    #[error("corrupt collection {collection}: bad document at line {line}")]
    CorruptCollection {
        /// Name of the collection.
        collection: String,
        /// 1-based line number of the offending line.
        line: usize,
    },

    /// A collection file is missing its schema-version header line.
    #[error("collection {collection} has no schema header line")]
    SchemaHeaderMissing {
        /// Name of the collection.
        collection: String,
    },

    /// A declarative schema update could not be applied.
    #[error("schema migration failed: {message}")]
    SchemaMigrationFailed {
        /// Description of the violation.
        message: String,
    },

    /// Encryption or decryption of a secret field failed.
    #[error("cipher error: {message}")]
    CipherError {
        /// Description of the failure.
        message: String,
    },

    /// An entity descriptor is malformed or conflicts with another.
    #[error("bad descriptor: {message}")]
    BadDescriptor {
        /// Description of the problem.
        message: String,
    },

    /// An underlying filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A change listener called a mutating operation on the collection it
    /// is being notified about.
    #[error("reentrant mutation of collection {collection} from change listener")]
    ReentrantMutation {
        /// Name of the collection.
        collection: String,
    },

    /// Another process holds the database directory lock.
    #[error("database locked: another process has exclusive access")]
    DatabaseLocked,
}

impl DbError {
    /// Creates a `CollectionNotFound` error.
    pub fn collection_not_found(name: impl Into<String>) -> Self {
        Self::CollectionNotFound { name: name.into() }
    }

    /// Creates a `CollectionExists` error.
    pub fn collection_exists(name: impl Into<String>) -> Self {
        Self::CollectionExists { name: name.into() }
    }

    /// Creates a `DocumentNotFound` error.
    pub fn document_not_found(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self::DocumentNotFound {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Creates a `DuplicateId` error.
    pub fn duplicate_id(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self::DuplicateId {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// Creates an `InvalidDocument` error.
    pub fn invalid_document(message: impl Into<String>) -> Self {
        Self::InvalidDocument {
            message: message.into(),
        }
    }

    /// Creates a `SchemaMigrationFailed` error.
    pub fn schema_migration_failed(message: impl Into<String>) -> Self {
        Self::SchemaMigrationFailed {
            message: message.into(),
        }
    }

    /// Creates a `CipherError`.
    pub fn cipher(message: impl Into<String>) -> Self {
        Self::CipherError {
            message: message.into(),
        }
    }

    /// Creates a `BadDescriptor` error.
    pub fn bad_descriptor(message: impl Into<String>) -> Self {
        Self::BadDescriptor {
            message: message.into(),
        }
    }

    /// Creates a `ReentrantMutation` error.
    pub fn reentrant_mutation(collection: impl Into<String>) -> Self {
        Self::ReentrantMutation {
            collection: collection.into(),
        }
    }
}
