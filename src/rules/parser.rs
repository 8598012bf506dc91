//! Text form of the rule language:
//!
//! ```text
//! expr := '(' ['-'] ( 'not' expr | 'and' expr+ | 'or' expr+
//!                   | 'type' ("node"|"way"|"relation")
//!                   | 'tag' key [value+] ) ')'
//! ```
//!
//! Keywords are case insensitive and strings use single or double quotes. A
//! `-` right before or right after the opening bracket disables the
//! subexpression.

use std::fmt;

use crate::data::osm::{Element, FeatureKind};
use crate::data::tags::TagStore;

use super::expr::{Expression, TriState};
use super::Fingerprint;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    /// Byte offset into the rule text.
    pub offset: usize,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at offset {}", self.message, self.offset)
    }
}

enum Operator {
    Not,
    And,
    Or,
    Tag,
    Type,
}

/// Deepest accepted nesting of subexpressions.
pub const MAX_DEPTH: usize = 64;

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    depth: usize,
    tags: &'a TagStore,
}

type ParseResult<T> = std::result::Result<T, ParseError>;

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.text.as_bytes().get(self.pos).copied()
    }

    fn eat_space(&mut self) {
        while self.peek().map_or(false, |c| c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn fail<T>(&self, message: &str, offset: usize) -> ParseResult<T> {
        Err(ParseError { message: message.to_string(), offset })
    }

    /// A quoted string, or `None` if the next token does not start one.
    fn string(&mut self) -> ParseResult<Option<&'a str>> {
        self.eat_space();
        let quote = match self.peek() {
            Some(q @ (b'"' | b'\'')) => q,
            _ => return Ok(None),
        };
        let start = self.pos + 1;
        let Some(len) = self.text.as_bytes()[start..].iter().position(|&c| c == quote) else {
            let message = format!("expected {} for end of string", quote as char);
            return self.fail(&message, self.text.len());
        };
        self.pos = start + len + 1;
        Ok(Some(&self.text[start..start + len]))
    }

    fn operator(&mut self) -> ParseResult<Operator> {
        let start = self.pos;
        while self.peek().map_or(false, |c| c.is_ascii_alphabetic()) {
            self.pos += 1;
        }
        match self.text[start..self.pos].to_ascii_lowercase().as_str() {
            "not" => Ok(Operator::Not),
            "and" => Ok(Operator::And),
            "or" => Ok(Operator::Or),
            "tag" => Ok(Operator::Tag),
            "type" => Ok(Operator::Type),
            _ => self.fail("unknown operator", start),
        }
    }

    fn children(&mut self) -> ParseResult<Vec<Expression>> {
        let starts_child = |c: Option<u8>| matches!(c, Some(b'(' | b'-'));
        self.eat_space();
        if !starts_child(self.peek()) {
            return self.fail("expected subexpression", self.pos);
        }
        let mut children = Vec::new();
        while starts_child(self.peek()) {
            children.push(self.single()?);
            self.eat_space();
        }
        Ok(children)
    }

    fn disable_marker(&mut self) -> bool {
        self.eat_space();
        let marked = self.peek() == Some(b'-');
        if marked {
            self.pos += 1;
            self.eat_space();
        }
        marked
    }

    fn single(&mut self) -> ParseResult<Expression> {
        let mut disabled = self.disable_marker();
        match self.peek() {
            None => return self.fail("unexpected end of expression", self.pos),
            Some(b'(') if self.depth == MAX_DEPTH => return self.fail("expression nested too deeply", self.pos),
            Some(b'(') => self.pos += 1,
            Some(_) => return self.fail("expected '('", self.pos),
        }
        self.depth += 1;
        disabled |= self.disable_marker();

        let expr = match self.operator()? {
            Operator::Not => Expression::not(self.single()?),
            Operator::And => Expression::and(self.children()?),
            Operator::Or => Expression::or(self.children()?),
            Operator::Type => {
                self.eat_space();
                let at = self.pos;
                let kind = match self.string()?.map(str::to_ascii_lowercase).as_deref() {
                    Some("node") => FeatureKind::Node,
                    Some("way") => FeatureKind::Way,
                    Some("relation") => FeatureKind::Relation,
                    Some(_) => return self.fail("invalid type", at),
                    None => return self.fail("expected type name", at),
                };
                Expression::type_of(kind)
            },
            Operator::Tag => {
                self.eat_space();
                let Some(key) = self.string()? else {
                    return self.fail("expected tag key", self.pos);
                };
                let mut values = Vec::new();
                while let Some(value) = self.string()? {
                    values.push(value);
                }
                match values.as_slice() {
                    [] => Expression::tag(key, None, self.tags),
                    [value] => Expression::tag(key, Some(*value), self.tags),
                    _ => Expression::or(
                        values.iter()
                            .map(|&v| Expression::tag(key, Some(v), self.tags))
                            .collect(),
                    ),
                }
            },
        };

        self.eat_space();
        if self.peek() != Some(b')') {
            return self.fail("expected ')'", self.pos);
        }
        self.pos += 1;
        self.depth -= 1;

        Ok(if disabled { expr.with_disabled(true) } else { expr })
    }
}

/// Parses one rule expression and brings it into canonical child order.
/// Tag nodes are bound against `tags`.
pub fn parse(text: &str, tags: &TagStore) -> Result<Expression, ParseError> {
    let mut parser = Parser { text, pos: 0, depth: 0, tags };
    let mut expr = parser.single()?;
    parser.eat_space();
    if parser.pos < text.len() {
        return parser.fail("unexpected text after expression", parser.pos);
    }
    expr.reorder();
    Ok(expr)
}

/// Rule text together with its parse outcome. An invalid rule evaluates to
/// `Ignore` everywhere.
#[derive(Debug, Clone)]
pub struct Rule {
    text: String,
    expr: Option<Expression>,
    error: Option<ParseError>,
}

impl Rule {
    pub fn new(text: &str, tags: &TagStore) -> Rule {
        match parse(text, tags) {
            Ok(expr) => Rule { text: text.to_string(), expr: Some(expr), error: None },
            Err(error) => Rule { text: text.to_string(), expr: None, error: Some(error) },
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn expression(&self) -> Option<&Expression> {
        self.expr.as_ref()
    }

    pub fn error(&self) -> Option<&ParseError> {
        self.error.as_ref()
    }

    pub fn is_valid(&self) -> bool {
        self.expr.is_some()
    }

    pub fn bind(&mut self, tags: &TagStore) {
        if let Some(expr) = &mut self.expr {
            expr.bind(tags);
        }
    }

    pub fn evaluate(&self, element: &Element) -> TriState {
        self.expr.as_ref().map_or(TriState::Ignore, |e| e.evaluate(element))
    }

    /// All invalid rules share the zero fingerprint.
    pub fn fingerprint(&self) -> Fingerprint {
        self.expr.as_ref().map(Expression::fingerprint).unwrap_or_default()
    }

    pub fn differs(&self, other: &Rule) -> bool {
        self.fingerprint() != other.fingerprint()
    }
}
