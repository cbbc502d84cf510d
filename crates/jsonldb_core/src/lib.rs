//! # jsonldb Core
//!
//! An embedded, file-backed document database. Each collection is one
//! newline-delimited JSON file under the database directory: line 1 is a
//! schema-version header, every further line is one document.
//!
//! This crate provides:
//! - the collection store: insertion-ordered in-memory mappings with
//!   copy-on-write snapshots and all-or-nothing mutations
//! - the file journal: crash-safe atomic rewrites and an append fast path
//! - schema versioning: collections with a mismatched file version load
//!   read-only until a declarative schema update reconciles them
//! - secret fields: AES-256-GCM encryption at rest for designated paths
//! - a file watcher that reconciles external edits and notifies listeners
//! - XPath-like ad-hoc queries (via the `jsonldb_query` crate)
//!
//! See [`Database`] for the public entry point.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cipher;
pub mod codec;
pub mod collection;
pub mod config;
pub mod database;
pub mod error;
pub mod journal;
pub mod registry;
pub mod schema;
pub mod store;
pub mod update;
pub mod watcher;

pub use cipher::{CipherKey, FieldCipher};
pub use codec::SchemaHeader;
pub use collection::{DocumentMap, Snapshot};
pub use config::Config;
pub use database::Database;
pub use error::{DbError, DbResult};
pub use registry::{Descriptor, Entity, Registry};
pub use schema::CollectionSchemaUpdate;
pub use store::CollectionStore;
pub use update::Update;
pub use watcher::{ChangeKind, CollectionFileChangeListener};

// Re-exported so callers can pre-parse query expressions.
pub use jsonldb_query::{parse as parse_query, Query};
