//! Query evaluation over JSON values.
//!
//! Evaluation is pure: it borrows the document, never clones or mutates it,
//! and runs in a single pass per step.

use crate::ast::{Axis, CompareOp, FieldPath, Literal, Predicate, Query, Step};
use serde_json::Value;
use std::cmp::Ordering;

impl Query {
    /// Returns `true` if the document is selected by this query.
    ///
    /// A document matches when the query's step sequence selects at least
    /// one node within it.
    pub fn matches(&self, doc: &Value) -> bool {
        !self.select(doc).is_empty()
    }

    /// Returns the nodes this query selects within the document.
    ///
    /// Node order follows document order (top-down, left-to-right).
    pub fn select<'a>(&self, doc: &'a Value) -> Vec<&'a Value> {
        let mut nodes = vec![doc];
        for step in &self.steps {
            nodes = apply_step(step, &nodes);
            if nodes.is_empty() {
                break;
            }
        }
        nodes
    }
}

fn apply_step<'a>(step: &Step, nodes: &[&'a Value]) -> Vec<&'a Value> {
    let mut selected: Vec<&Value> = Vec::new();

    for node in nodes {
        match step.axis {
            Axis::SelfNode => selected.push(node),
            Axis::Child => {
                let name = step.name.as_deref().unwrap_or_default();
                if let Some(child) = node.get(name) {
                    selected.push(child);
                }
            }
            Axis::Descendant => {
                let name = step.name.as_deref().unwrap_or_default();
                collect_descendants(node, name, &mut selected);
            }
        }
    }

    if let Some(predicate) = &step.predicate {
        selected.retain(|node| eval_predicate(predicate, node));
    }

    selected
}

/// Collects every member value named `name` at any depth, document order.
fn collect_descendants<'a>(node: &'a Value, name: &str, out: &mut Vec<&'a Value>) {
    match node {
        Value::Object(map) => {
            for (key, value) in map {
                if key == name {
                    out.push(value);
                }
                collect_descendants(value, name, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_descendants(item, name, out);
            }
        }
        _ => {}
    }
}

fn eval_predicate(predicate: &Predicate, context: &Value) -> bool {
    match predicate {
        Predicate::Compare { path, op, value } => match resolve(path, context) {
            Some(node) => compare(node, *op, value),
            None => false,
        },
        Predicate::Contains { path, value } => match resolve(path, context) {
            Some(node) => contains(node, value),
            None => false,
        },
        Predicate::And(left, right) => {
            eval_predicate(left, context) && eval_predicate(right, context)
        }
        Predicate::Or(left, right) => {
            eval_predicate(left, context) || eval_predicate(right, context)
        }
        Predicate::Not(inner) => !eval_predicate(inner, context),
    }
}

/// Resolves a dotted field path relative to the context node.
///
/// A missing segment resolves to `None`; a predicate over an absent field
/// selects nothing, for every operator.
fn resolve<'a>(path: &FieldPath, context: &'a Value) -> Option<&'a Value> {
    let mut node = context;
    for segment in &path.segments {
        node = node.get(segment)?;
    }
    Some(node)
}

fn compare(node: &Value, op: CompareOp, literal: &Literal) -> bool {
    match (node, literal) {
        (Value::String(s), Literal::Text(t)) => ordering_holds(s.as_str().cmp(t.as_str()), op),
        (Value::Number(n), Literal::Number(m)) => match n.as_f64() {
            Some(n) => n.partial_cmp(m).is_some_and(|ord| ordering_holds(ord, op)),
            None => false,
        },
        (Value::Bool(b), Literal::Bool(l)) => match op {
            CompareOp::Eq => b == l,
            CompareOp::Ne => b != l,
            _ => false,
        },
        (value, Literal::Null) => match op {
            CompareOp::Eq => value.is_null(),
            CompareOp::Ne => !value.is_null(),
            _ => false,
        },
        // Mismatched types never compare equal and never order.
        _ => matches!(op, CompareOp::Ne),
    }
}

fn ordering_holds(ord: Ordering, op: CompareOp) -> bool {
    match op {
        CompareOp::Eq => ord == Ordering::Equal,
        CompareOp::Ne => ord != Ordering::Equal,
        CompareOp::Lt => ord == Ordering::Less,
        CompareOp::Le => ord != Ordering::Greater,
        CompareOp::Gt => ord == Ordering::Greater,
        CompareOp::Ge => ord != Ordering::Less,
    }
}

fn contains(node: &Value, literal: &Literal) -> bool {
    match node {
        Value::String(haystack) => match literal {
            Literal::Text(needle) => haystack.contains(needle.as_str()),
            _ => false,
        },
        Value::Array(items) => items.iter().any(|item| literal_eq(item, literal)),
        _ => false,
    }
}

fn literal_eq(value: &Value, literal: &Literal) -> bool {
    match (value, literal) {
        (Value::String(s), Literal::Text(t)) => s == t,
        (Value::Number(n), Literal::Number(m)) => n.as_f64() == Some(*m),
        (Value::Bool(b), Literal::Bool(l)) => b == l,
        (Value::Null, Literal::Null) => true,
        _ => false,
    }
}
