//! Declarative document updates for find-and-modify.

use crate::codec::{get_path, remove_path, set_path};
use crate::error::{DbError, DbResult};
use serde_json::{Number, Value};

/// One update operation on a field path.
#[derive(Debug, Clone)]
enum UpdateOp {
    /// Set the field to a value, creating it if absent.
    Set(Value),
    /// Remove the field.
    Unset,
    /// Add to a numeric field. A missing field counts as zero.
    Increment(f64),
}

/// An ordered list of field updates, applied to every matched document.
///
/// Operations apply in declared order, so later operations observe the
/// effect of earlier ones.
///
/// # Example
///
/// ```
/// use jsonldb_core::Update;
/// use serde_json::json;
///
/// let update = Update::new()
///     .set("location", json!("X"))
///     .increment("revision", 1.0)
///     .unset("draft");
/// ```
#[derive(Debug, Clone, Default)]
pub struct Update {
    ops: Vec<(String, UpdateOp)>,
}

impl Update {
    /// Creates an empty update.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a set operation.
    #[must_use]
    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.ops.push((path.into(), UpdateOp::Set(value.into())));
        self
    }

    /// Appends an unset operation.
    #[must_use]
    pub fn unset(mut self, path: impl Into<String>) -> Self {
        self.ops.push((path.into(), UpdateOp::Unset));
        self
    }

    /// Appends an increment operation.
    #[must_use]
    pub fn increment(mut self, path: impl Into<String>, amount: f64) -> Self {
        self.ops.push((path.into(), UpdateOp::Increment(amount)));
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

    /// Applies all operations to a document, in declared order.
    ///
    /// # Errors
    ///
    /// Returns `InvalidDocument` if an increment targets a non-numeric
    /// field or a set path runs through a non-object value.
    pub fn apply(&self, doc: &mut Value) -> DbResult<()> {
        for (path, op) in &self.ops {
            match op {
                UpdateOp::Set(value) => set_path(doc, path, value.clone())?,
                UpdateOp::Unset => {
                    remove_path(doc, path);
                }
                UpdateOp::Increment(amount) => {
                    let current = match get_path(doc, path) {
                        None | Some(Value::Null) => 0.0,
                        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
                        Some(_) => {
                            return Err(DbError::invalid_document(format!(
                                "cannot increment non-numeric field {path:?}"
                            )))
                        }
                    };
                    set_path(doc, path, number_value(current + amount))?;
                }
            }
        }
        Ok(())
    }
}

/// Renders a float as an integer JSON number when it is one.
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n >= i64::MIN as f64 && n <= i64::MAX as f64 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}
