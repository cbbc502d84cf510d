//! Declarative schema updates.
//!
//! A collection whose file header carries a different schema version than
//! its descriptor is loaded read-only. A [`CollectionSchemaUpdate`]
//! reconciles the documents with the descriptor's shape: it is applied to
//! every document, the file is rewritten with the descriptor's version
//! header, and the read-only flag is cleared. Any per-document violation
//! fails the whole migration and leaves the collection unchanged.

use crate::codec::{get_path, remove_path, set_path};
use crate::error::{DbError, DbResult};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Converter used by a retype operation.
///
/// Receives the current field value and returns the converted one.
pub type RetypeFn = Arc<dyn Fn(&Value) -> DbResult<Value> + Send + Sync>;

/// One schema operation on a field path.
#[derive(Clone)]
enum SchemaOp {
    Rename { from: String, to: String },
    Add { path: String, default: Value },
    Remove { path: String },
    Retype { path: String, converter: RetypeFn },
}

impl fmt::Debug for SchemaOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaOp::Rename { from, to } => {
                f.debug_struct("Rename").field("from", from).field("to", to).finish()
            }
            SchemaOp::Add { path, default } => {
                f.debug_struct("Add").field("path", path).field("default", default).finish()
            }
            SchemaOp::Remove { path } => f.debug_struct("Remove").field("path", path).finish(),
            SchemaOp::Retype { path, .. } => f
                .debug_struct("Retype")
                .field("path", path)
                .field("converter", &"<fn>")
                .finish(),
        }
    }
}

/// An ordered list of schema operations applied to every document of a
/// collection.
///
/// # Example
///
/// ```
/// use jsonldb_core::CollectionSchemaUpdate;
/// use serde_json::json;
///
/// let update = CollectionSchemaUpdate::new()
///     .rename("host", "hostname")
///     .add("zone", json!("default"))
///     .remove("legacy")
///     .retype("port", |value| {
///         let text = value.as_str().unwrap_or_default();
///         Ok(json!(text.parse::<u16>().unwrap_or(0)))
///     });
/// ```
#[derive(Debug, Clone, Default)]
pub struct CollectionSchemaUpdate {
    ops: Vec<SchemaOp>,
}

impl CollectionSchemaUpdate {
    /// Creates an empty schema update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a field rename.
    #[must_use]
    pub fn rename(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.ops.push(SchemaOp::Rename {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    /// Appends a field addition with a default value.
    ///
    /// Documents that already carry the field keep their value.
    #[must_use]
    pub fn add(mut self, path: impl Into<String>, default: Value) -> Self {
        self.ops.push(SchemaOp::Add {
            path: path.into(),
            default,
        });
        self
    }

    /// Appends a field removal.
    #[must_use]
    pub fn remove(mut self, path: impl Into<String>) -> Self {
        self.ops.push(SchemaOp::Remove { path: path.into() });
        self
    }

    /// Appends a field retype with a converter.
    #[must_use]
    pub fn retype<F>(mut self, path: impl Into<String>, converter: F) -> Self
    where
        F: Fn(&Value) -> DbResult<Value> + Send + Sync + 'static,
    {
        self.ops.push(SchemaOp::Retype {
            path: path.into(),
            converter: Arc::new(converter),
        });
        self
    }

    /// Number of operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the update carries no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Applies all operations to one document, in declared order.
    ///
    /// The identifier field must survive: renaming or removing it is a
    /// violation.
    ///
    /// # Errors
    ///
    /// Returns `SchemaMigrationFailed` on any violation; the input
    /// document is not modified on error (the caller receives a new one).
    pub fn apply_to(&self, doc: &Value, id_field: &str) -> DbResult<Value> {
        let mut doc = doc.clone();

        for op in &self.ops {
            match op {
                SchemaOp::Rename { from, to } => {
                    if from == id_field {
                        return Err(DbError::schema_migration_failed(format!(
                            "cannot rename identifier field {id_field:?}"
                        )));
                    }
                    if get_path(&doc, to).is_some() {
                        return Err(DbError::schema_migration_failed(format!(
                            "rename target {to:?} already exists"
                        )));
                    }
                    if let Some(value) = remove_path(&mut doc, from) {
                        set_path(&mut doc, to, value)
                            .map_err(|e| DbError::schema_migration_failed(e.to_string()))?;
                    }
                }
                SchemaOp::Add { path, default } => {
                    if get_path(&doc, path).is_none() {
                        set_path(&mut doc, path, default.clone())
                            .map_err(|e| DbError::schema_migration_failed(e.to_string()))?;
                    }
                }
                SchemaOp::Remove { path } => {
                    if path == id_field {
                        return Err(DbError::schema_migration_failed(format!(
                            "cannot remove identifier field {id_field:?}"
                        )));
                    }
                    remove_path(&mut doc, path);
                }
                SchemaOp::Retype { path, converter } => {
                    if let Some(value) = get_path(&doc, path) {
                        let converted = converter(value)
                            .map_err(|e| DbError::schema_migration_failed(e.to_string()))?;
                        set_path(&mut doc, path, converted)
                            .map_err(|e| DbError::schema_migration_failed(e.to_string()))?;
                    }
                }
            }
        }

        Ok(doc)
    }
}
