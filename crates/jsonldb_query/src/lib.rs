//! # jsonldb Query
//!
//! XPath-like query expressions evaluated over JSON documents.
//!
//! Expressions are parsed once into an AST and then evaluated by recursive
//! descent against `serde_json::Value` documents. The engine knows nothing
//! about entity types or collections; callers hand it one document at a
//! time.
//!
//! ## Expression language
//!
//! - `/.` — the document itself (self step)
//! - `/<field>` — a top-level field (child step)
//! - `//<field>` — a field at any depth (descendant step)
//! - `[<field> <op> <literal>]` — predicate with `=`, `!=`, `<`, `<=`,
//!   `>`, `>=`
//! - `contains(<field>, <literal>)` — substring / element containment
//! - `and`, `or`, `not(...)` — boolean combinators
//!
//! Field paths inside predicates may be dotted (`address.city`). String
//! literals accept single or double quotes.
//!
//! ## Usage
//!
//! ```
//! use jsonldb_query::parse;
//! use serde_json::json;
//!
//! let query = parse("/.[hostname = 'b' and port > 1000]").unwrap();
//!
//! let doc = json!({"hostname": "b", "port": 8080});
//! assert!(query.matches(&doc));
//!
//! let other = json!({"hostname": "a", "port": 8080});
//! assert!(!query.matches(&other));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod ast;
mod error;
mod eval;
mod lexer;
mod parser;

pub use ast::{Axis, CompareOp, FieldPath, Literal, Predicate, Query, Step};
pub use error::{QueryError, QueryResult};
pub use parser::parse;
