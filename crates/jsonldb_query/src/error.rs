//! Error types for query parsing.

use thiserror::Error;

/// Result type for query operations.
pub type QueryResult<T> = Result<T, QueryError>;

/// Errors produced while parsing a query expression.
///
/// All variants are raised before any document is touched; evaluation
/// itself is infallible.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    /// The expression was empty or whitespace-only.
    #[error("empty query expression")]
    Empty,

    /// An unexpected character was found while tokenizing.
    #[error("unexpected character {found:?} at position {position}")]
    UnexpectedChar {
        /// Byte offset into the expression.
        position: usize,
        /// The offending character.
        found: char,
    },

    /// A string literal was not closed.
    #[error("unterminated string literal starting at position {position}")]
    UnterminatedString {
        /// Byte offset of the opening quote.
        position: usize,
    },

    /// A numeric literal could not be parsed.
    #[error("invalid number {text:?} at position {position}")]
    InvalidNumber {
        /// Byte offset of the literal.
        position: usize,
        /// The literal text as written.
        text: String,
    },

    /// The parser found a token it did not expect.
    #[error("expected {expected} but found {found} at position {position}")]
    UnexpectedToken {
        /// Byte offset of the token.
        position: usize,
        /// What the parser was looking for.
        expected: &'static str,
        /// Human-readable description of what it found.
        found: String,
    },

    /// The expression ended while more input was expected.
    #[error("unexpected end of expression, expected {expected}")]
    UnexpectedEnd {
        /// What the parser was looking for.
        expected: &'static str,
    },

    /// Input remained after a complete expression.
    #[error("trailing input after expression at position {position}")]
    TrailingInput {
        /// Byte offset where the leftover input begins.
        position: usize,
    },
}
