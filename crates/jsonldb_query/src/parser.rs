//! Recursive-descent parser for query expressions.

use crate::ast::{Axis, CompareOp, FieldPath, Literal, Predicate, Query, Step};
use crate::error::{QueryError, QueryResult};
use crate::lexer::{tokenize, Token, TokenKind};

/// Parses a query expression into a [`Query`].
///
/// The grammar, informally:
///
/// ```text
/// query      := step+
/// step       := '/' '.' predicate?
///             | '/' ident predicate?
///             | '//' ident predicate?
/// predicate  := '[' or-expr ']'
/// or-expr    := and-expr ('or' and-expr)*
/// and-expr   := term ('and' term)*
/// term       := 'not' '(' or-expr ')'
///             | '(' or-expr ')'
///             | 'contains' '(' path ',' literal ')'
///             | path op literal
/// path       := '.' | ident ('.' ident)*
/// ```
///
/// # Errors
///
/// Returns a [`QueryError`] describing the first syntax problem; the store
/// is never consulted for a malformed expression.
pub fn parse(input: &str) -> QueryResult<Query> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(QueryError::Empty);
    }

    let mut parser = Parser { tokens, pos: 0 };
    let query = parser.query()?;

    if let Some(token) = parser.peek() {
        return Err(QueryError::TrailingInput { position: token.position });
    }

    Ok(query)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, kind: &TokenKind, expected: &'static str) -> QueryResult<Token> {
        match self.advance() {
            Some(token) if token.kind == *kind => Ok(token),
            Some(token) => Err(QueryError::UnexpectedToken {
                position: token.position,
                expected,
                found: token.kind.describe(),
            }),
            None => Err(QueryError::UnexpectedEnd { expected }),
        }
    }

    fn query(&mut self) -> QueryResult<Query> {
        let mut steps = Vec::new();
        steps.push(self.step()?);
        while matches!(
            self.peek().map(|t| &t.kind),
            Some(TokenKind::Slash | TokenKind::DoubleSlash)
        ) {
            steps.push(self.step()?);
        }
        Ok(Query { steps })
    }

    fn step(&mut self) -> QueryResult<Step> {
        let axis_token = match self.advance() {
            Some(token) => token,
            None => return Err(QueryError::UnexpectedEnd { expected: "'/' or '//'" }),
        };

        let (axis, name) = match axis_token.kind {
            TokenKind::Slash => match self.advance() {
                Some(Token { kind: TokenKind::Dot, .. }) => (Axis::SelfNode, None),
                Some(Token { kind: TokenKind::Ident(name), .. }) => (Axis::Child, Some(name)),
                Some(token) => {
                    return Err(QueryError::UnexpectedToken {
                        position: token.position,
                        expected: "field name or '.'",
                        found: token.kind.describe(),
                    })
                }
                None => return Err(QueryError::UnexpectedEnd { expected: "field name or '.'" }),
            },
            TokenKind::DoubleSlash => match self.advance() {
                Some(Token { kind: TokenKind::Ident(name), .. }) => (Axis::Descendant, Some(name)),
                Some(token) => {
                    return Err(QueryError::UnexpectedToken {
                        position: token.position,
                        expected: "field name",
                        found: token.kind.describe(),
                    })
                }
                None => return Err(QueryError::UnexpectedEnd { expected: "field name" }),
            },
            other => {
                return Err(QueryError::UnexpectedToken {
                    position: axis_token.position,
                    expected: "'/' or '//'",
                    found: other.describe(),
                })
            }
        };

        let predicate = if matches!(self.peek().map(|t| &t.kind), Some(TokenKind::LBracket)) {
            self.advance();
            let predicate = self.or_expr()?;
            self.expect(&TokenKind::RBracket, "']'")?;
            Some(predicate)
        } else {
            None
        };

        Ok(Step { axis, name, predicate })
    }

    fn or_expr(&mut self) -> QueryResult<Predicate> {
        let mut left = self.and_expr()?;
        while self.eat_keyword("or") {
            let right = self.and_expr()?;
            left = Predicate::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> QueryResult<Predicate> {
        let mut left = self.term()?;
        while self.eat_keyword("and") {
            let right = self.term()?;
            left = Predicate::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> QueryResult<Predicate> {
        if self.eat_keyword("not") {
            self.expect(&TokenKind::LParen, "'('")?;
            let inner = self.or_expr()?;
            self.expect(&TokenKind::RParen, "')'")?;
            return Ok(Predicate::Not(Box::new(inner)));
        }

        if matches!(self.peek().map(|t| &t.kind), Some(TokenKind::LParen)) {
            self.advance();
            let inner = self.or_expr()?;
            self.expect(&TokenKind::RParen, "')'")?;
            return Ok(inner);
        }

        if self.peek_keyword("contains") {
            self.advance();
            self.expect(&TokenKind::LParen, "'('")?;
            let path = self.path()?;
            self.expect(&TokenKind::Comma, "','")?;
            let value = self.literal()?;
            self.expect(&TokenKind::RParen, "')'")?;
            return Ok(Predicate::Contains { path, value });
        }

        let path = self.path()?;
        let op = self.compare_op()?;
        let value = self.literal()?;
        Ok(Predicate::Compare { path, op, value })
    }

    fn path(&mut self) -> QueryResult<FieldPath> {
        match self.advance() {
            Some(Token { kind: TokenKind::Dot, .. }) => Ok(FieldPath::context()),
            Some(Token { kind: TokenKind::Ident(first), .. }) => {
                let mut segments = vec![first];
                while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Dot)) {
                    self.advance();
                    match self.advance() {
                        Some(Token { kind: TokenKind::Ident(next), .. }) => segments.push(next),
                        Some(token) => {
                            return Err(QueryError::UnexpectedToken {
                                position: token.position,
                                expected: "field name after '.'",
                                found: token.kind.describe(),
                            })
                        }
                        None => {
                            return Err(QueryError::UnexpectedEnd { expected: "field name after '.'" })
                        }
                    }
                }
                Ok(FieldPath::new(segments))
            }
            Some(token) => Err(QueryError::UnexpectedToken {
                position: token.position,
                expected: "field path",
                found: token.kind.describe(),
            }),
            None => Err(QueryError::UnexpectedEnd { expected: "field path" }),
        }
    }

    fn compare_op(&mut self) -> QueryResult<CompareOp> {
        match self.advance() {
            Some(token) => match token.kind {
                TokenKind::Eq => Ok(CompareOp::Eq),
                TokenKind::Ne => Ok(CompareOp::Ne),
                TokenKind::Lt => Ok(CompareOp::Lt),
                TokenKind::Le => Ok(CompareOp::Le),
                TokenKind::Gt => Ok(CompareOp::Gt),
                TokenKind::Ge => Ok(CompareOp::Ge),
                other => Err(QueryError::UnexpectedToken {
                    position: token.position,
                    expected: "comparison operator",
                    found: other.describe(),
                }),
            },
            None => Err(QueryError::UnexpectedEnd { expected: "comparison operator" }),
        }
    }

    fn literal(&mut self) -> QueryResult<Literal> {
        match self.advance() {
            Some(token) => match token.kind {
                TokenKind::Text(text) => Ok(Literal::Text(text)),
                TokenKind::Number(n) => Ok(Literal::Number(n)),
                TokenKind::Ident(word) => match word.as_str() {
                    "true" => Ok(Literal::Bool(true)),
                    "false" => Ok(Literal::Bool(false)),
                    "null" => Ok(Literal::Null),
                    _ => Err(QueryError::UnexpectedToken {
                        position: token.position,
                        expected: "literal",
                        found: format!("identifier {word:?}"),
                    }),
                },
                other => Err(QueryError::UnexpectedToken {
                    position: token.position,
                    expected: "literal",
                    found: other.describe(),
                }),
            },
            None => Err(QueryError::UnexpectedEnd { expected: "literal" }),
        }
    }

    fn peek_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token { kind: TokenKind::Ident(w), .. }) if w == word)
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        if self.peek_keyword(word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }
}
