//! Abstract syntax tree for query expressions.

use std::fmt;

/// A parsed query expression.
///
/// A query is a sequence of location steps, each optionally filtered by a
/// predicate. Construct one with [`crate::parse`].
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// The location steps, in source order.
    pub steps: Vec<Step>,
}

/// One location step of a query.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// How this step navigates from the current node set.
    pub axis: Axis,
    /// Field name for child/descendant steps; `None` for the self step.
    pub name: Option<String>,
    /// Optional predicate filtering the nodes selected by this step.
    pub predicate: Option<Predicate>,
}

/// The navigation axis of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// `/.` — keep the current node.
    SelfNode,
    /// `/name` — a direct member of the current object.
    Child,
    /// `//name` — a member at any depth below the current node.
    Descendant,
}

/// A boolean predicate inside `[...]`.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `<path> <op> <literal>`
    Compare {
        /// The field path, resolved relative to the context node.
        path: FieldPath,
        /// The comparison operator.
        op: CompareOp,
        /// The right-hand literal.
        value: Literal,
    },
    /// `contains(<path>, <literal>)`
    Contains {
        /// The field path, resolved relative to the context node.
        path: FieldPath,
        /// The needle.
        value: Literal,
    },
    /// Both sides must hold.
    And(Box<Predicate>, Box<Predicate>),
    /// Either side must hold.
    Or(Box<Predicate>, Box<Predicate>),
    /// The inner predicate must not hold.
    Not(Box<Predicate>),
}

/// Comparison operators available in predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        };
        f.write_str(s)
    }
}

/// A literal value on the right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// A string literal.
    Text(String),
    /// A numeric literal.
    Number(f64),
    /// `true` or `false`.
    Bool(bool),
    /// `null`.
    Null,
}

/// A dotted field path used inside predicates.
///
/// An empty path (`.`) refers to the context node itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    /// Path segments, outermost first. Empty means the context node.
    pub segments: Vec<String>,
}

impl FieldPath {
    /// The context node itself (`.`).
    pub fn context() -> Self {
        Self { segments: Vec::new() }
    }

    /// A path from dotted segments.
    pub fn new(segments: Vec<String>) -> Self {
        Self { segments }
    }

    /// Whether this path refers to the context node itself.
    pub fn is_context(&self) -> bool {
        self.segments.is_empty()
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_context() {
            f.write_str(".")
        } else {
            f.write_str(&self.segments.join("."))
        }
    }
}
