//! Entity descriptors and the descriptor registry.
//!
//! A [`Descriptor`] links an entity type to its persistence metadata: the
//! owning collection name, the declared schema version, the identifier
//! field and the set of secret field paths. Descriptors are registered
//! once, before the database opens, and the [`Registry`] is immutable
//! afterwards — the rest of the system is descriptor-driven and never
//! inspects entity types directly.
//!
//! Two registration paths exist:
//!
//! - compile-time metadata via the [`Entity`] trait
//!   (`registry.register::<Site>()`), or
//! - dynamic registration via [`Descriptor::new`]
//!   (`registry.register_descriptor(...)`) for collections with no Rust
//!   type behind them.

use crate::codec::{get_path, set_path};
use crate::error::{DbError, DbResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::TypeId;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Compile-time persistence metadata for a document type.
///
/// # Example
///
/// ```
/// use jsonldb_core::Entity;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Site {
///     id: String,
///     location: String,
/// }
///
/// impl Entity for Site {
///     fn collection() -> &'static str {
///         "sites"
///     }
///
///     fn schema_version() -> &'static str {
///         "1.0"
///     }
/// }
/// ```
pub trait Entity: Serialize + DeserializeOwned + 'static {
    /// Name of the collection this type is stored in.
    fn collection() -> &'static str;

    /// Declared schema version for the collection.
    fn schema_version() -> &'static str;

    /// Field holding the document identifier.
    fn id_field() -> &'static str {
        "id"
    }

    /// Field paths that are encrypted at rest.
    fn secret_fields() -> &'static [&'static str] {
        &[]
    }
}

/// Persistence metadata for one collection.
///
/// Immutable once registered. The store addresses documents exclusively
/// through descriptors; entity types never reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    collection: String,
    schema_version: String,
    id_field: String,
    secret_fields: BTreeSet<String>,
}

impl Descriptor {
    /// Creates a descriptor for a collection.
    #[must_use]
    pub fn new(
        collection: impl Into<String>,
        schema_version: impl Into<String>,
        id_field: impl Into<String>,
    ) -> Self {
        Self {
            collection: collection.into(),
            schema_version: schema_version.into(),
            id_field: id_field.into(),
            secret_fields: BTreeSet::new(),
        }
    }

    /// Marks a field path as secret (encrypted at rest).
    #[must_use]
    pub fn secret_field(mut self, path: impl Into<String>) -> Self {
        self.secret_fields.insert(path.into());
        self
    }

    /// Builds a descriptor from an [`Entity`] implementation.
    #[must_use]
    pub fn of<T: Entity>() -> Self {
        let mut descriptor = Self::new(T::collection(), T::schema_version(), T::id_field());
        for path in T::secret_fields() {
            descriptor.secret_fields.insert((*path).to_string());
        }
        descriptor
    }

    /// Name of the collection.
    #[must_use]
    pub fn collection_name(&self) -> &str {
        &self.collection
    }

    /// Declared schema version.
    #[must_use]
    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    /// Path of the identifier field.
    #[must_use]
    pub fn id_field_path(&self) -> &str {
        &self.id_field
    }

    /// Paths of the secret fields.
    #[must_use]
    pub fn secret_field_paths(&self) -> &BTreeSet<String> {
        &self.secret_fields
    }

    /// Returns a fresh document with only the id field, set to null.
    #[must_use]
    pub fn new_empty_document(&self) -> Value {
        let mut doc = Value::Object(Default::default());
        // set_path cannot fail on an empty object.
        let _ = set_path(&mut doc, &self.id_field, Value::Null);
        doc
    }

    /// Extracts the document identifier in its stable string form.
    ///
    /// # Errors
    ///
    /// Returns `InvalidDocument` if the id field is absent, null, or has
    /// no stable string form (arrays and objects do not).
    pub fn id_of(&self, doc: &Value) -> DbResult<String> {
        match get_path(doc, &self.id_field) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            Some(Value::Bool(b)) => Ok(b.to_string()),
            Some(Value::Null) | None => Err(DbError::invalid_document(format!(
                "document has no {:?} identifier field",
                self.id_field
            ))),
            Some(_) => Err(DbError::invalid_document(format!(
                "identifier field {:?} has no stable string form",
                self.id_field
            ))),
        }
    }

    /// Writes the identifier into a document.
    pub fn set_id(&self, doc: &mut Value, id: &str) -> DbResult<()> {
        set_path(doc, &self.id_field, Value::String(id.to_string()))
    }

    fn validate(&self) -> DbResult<()> {
        if self.collection.is_empty() {
            return Err(DbError::bad_descriptor("collection name is empty"));
        }
        if self.schema_version.is_empty() {
            return Err(DbError::bad_descriptor(format!(
                "collection {:?} declares an empty schema version",
                self.collection
            )));
        }
        if self.id_field.is_empty() {
            return Err(DbError::bad_descriptor(format!(
                "collection {:?} declares no identifier field",
                self.collection
            )));
        }
        if self.secret_fields.contains(&self.id_field) {
            return Err(DbError::bad_descriptor(format!(
                "collection {:?} marks its identifier field {:?} as secret",
                self.collection, self.id_field
            )));
        }
        if self.secret_fields.iter().any(String::is_empty) {
            return Err(DbError::bad_descriptor(format!(
                "collection {:?} declares an empty secret field path",
                self.collection
            )));
        }
        Ok(())
    }
}

/// The set of registered descriptors.
///
/// Built before the database opens; read lock-free afterwards.
#[derive(Debug, Default)]
pub struct Registry {
    by_name: HashMap<String, Arc<Descriptor>>,
    by_type: HashMap<TypeId, Arc<Descriptor>>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entity type.
    ///
    /// # Errors
    ///
    /// Returns `BadDescriptor` if the descriptor is malformed, the type is
    /// already registered, or the collection name is taken.
    pub fn register<T: Entity>(&mut self) -> DbResult<()> {
        if self.by_type.contains_key(&TypeId::of::<T>()) {
            return Err(DbError::bad_descriptor(format!(
                "type for collection {:?} registered twice",
                T::collection()
            )));
        }
        let descriptor = self.register_descriptor(Descriptor::of::<T>())?;
        self.by_type.insert(TypeId::of::<T>(), descriptor);
        Ok(())
    }

    /// Registers a dynamic descriptor with no entity type behind it.
    ///
    /// # Errors
    ///
    /// Returns `BadDescriptor` if the descriptor is malformed or the
    /// collection name is already registered.
    pub fn register_descriptor(&mut self, descriptor: Descriptor) -> DbResult<Arc<Descriptor>> {
        descriptor.validate()?;
        if self.by_name.contains_key(descriptor.collection_name()) {
            return Err(DbError::bad_descriptor(format!(
                "duplicate collection name {:?}",
                descriptor.collection_name()
            )));
        }
        let descriptor = Arc::new(descriptor);
        self.by_name
            .insert(descriptor.collection_name().to_string(), Arc::clone(&descriptor));
        Ok(descriptor)
    }

    /// Resolves a descriptor by collection name.
    ///
    /// # Errors
    ///
    /// Returns `CollectionNotFound` for unregistered names.
    pub fn describe(&self, name: &str) -> DbResult<Arc<Descriptor>> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::collection_not_found(name))
    }

    /// Resolves a descriptor by entity type.
    ///
    /// # Errors
    ///
    /// Returns `BadDescriptor` if the type was never registered.
    pub fn describe_type<T: Entity>(&self) -> DbResult<Arc<Descriptor>> {
        self.by_type
            .get(&TypeId::of::<T>())
            .cloned()
            .ok_or_else(|| {
                DbError::bad_descriptor(format!(
                    "type for collection {:?} is not registered",
                    T::collection()
                ))
            })
    }

    /// Looks up a descriptor without treating absence as an error.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Descriptor>> {
        self.by_name.get(name).cloned()
    }

    /// Returns the registered collection names, sorted.
    #[must_use]
    pub fn names(&self) -> BTreeSet<String> {
        self.by_name.keys().cloned().collect()
    }

    /// Returns `true` if any registered descriptor declares secret fields.
    #[must_use]
    pub fn has_secret_fields(&self) -> bool {
        self.by_name.values().any(|d| !d.secret_field_paths().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Serialize, Deserialize)]
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

    #[derive(Serialize, Deserialize)]
    struct Instance {
        id: String,
        private_key: String,
    }

    impl Entity for Instance {
        fn collection() -> &'static str {
            "instances"
        }

        fn schema_version() -> &'static str {
            "1.0"
        }

        fn secret_fields() -> &'static [&'static str] {
            &["private_key"]
        }
    }

    #[test]
    fn register_and_describe_both_ways() {
        let mut registry = Registry::new();
        registry.register::<Site>().unwrap();

        let by_name = registry.describe("sites").unwrap();
        let by_type = registry.describe_type::<Site>().unwrap();
        assert_eq!(by_name, by_type);
        assert_eq!(by_name.schema_version(), "1.0");
        assert_eq!(by_name.id_field_path(), "id");
    }

    #[test]
    fn secret_fields_carried_from_trait() {
        let mut registry = Registry::new();
        registry.register::<Instance>().unwrap();

        let descriptor = registry.describe("instances").unwrap();
        assert!(descriptor.secret_field_paths().contains("private_key"));
        assert!(registry.has_secret_fields());
    }

    #[test]
    fn duplicate_collection_name_rejected() {
        let mut registry = Registry::new();
        registry.register::<Site>().unwrap();

        let result = registry.register_descriptor(Descriptor::new("sites", "2.0", "id"));
        assert!(matches!(result, Err(DbError::BadDescriptor { .. })));
    }

    #[test]
    fn malformed_descriptors_rejected() {
        let mut registry = Registry::new();
        assert!(registry
            .register_descriptor(Descriptor::new("", "1.0", "id"))
            .is_err());
        assert!(registry
            .register_descriptor(Descriptor::new("a", "", "id"))
            .is_err());
        assert!(registry
            .register_descriptor(Descriptor::new("b", "1.0", ""))
            .is_err());
        assert!(registry
            .register_descriptor(Descriptor::new("c", "1.0", "id").secret_field("id"))
            .is_err());
    }

    #[test]
    fn unknown_lookups_fail() {
        let registry = Registry::new();
        assert!(matches!(
            registry.describe("nope"),
            Err(DbError::CollectionNotFound { .. })
        ));
        assert!(registry.describe_type::<Site>().is_err());
    }

    #[test]
    fn id_extraction_and_stable_string_form() {
        let descriptor = Descriptor::new("sites", "1.0", "id");

        assert_eq!(descriptor.id_of(&json!({"id": "s1"})).unwrap(), "s1");
        assert_eq!(descriptor.id_of(&json!({"id": 42})).unwrap(), "42");
        assert!(descriptor.id_of(&json!({"id": null})).is_err());
        assert!(descriptor.id_of(&json!({"other": 1})).is_err());
        assert!(descriptor.id_of(&json!({"id": [1]})).is_err());
    }

    #[test]
    fn nested_id_field() {
        let descriptor = Descriptor::new("nodes", "1.0", "meta.id");
        let mut doc = descriptor.new_empty_document();
        descriptor.set_id(&mut doc, "n1").unwrap();
        assert_eq!(doc, json!({"meta": {"id": "n1"}}));
        assert_eq!(descriptor.id_of(&doc).unwrap(), "n1");
    }
}
