//! Node tag filters.
//!
//! A filter is a boolean expression over node tags:
//!
//! ```text
//! expr  := and ('|' and)*
//! and   := unary ('&' unary)*
//! unary := '!' unary | '(' expr ')' | TAG
//! TAG   := [A-Za-z0-9_./:-]+
//! ```
//!
//! The empty filter matches every node.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

fn is_tag_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | ':' | '-')
}

/// Validate a single user tag (as attached to a node).
pub fn validate_tag(tag: &str) -> CoreResult<()> {
    if tag.is_empty() {
        return Err(CoreError::InvalidTag {
            tag: tag.to_string(),
            reason: "tag is empty".to_string(),
        });
    }
    if let Some(c) = tag.chars().find(|c| !is_tag_char(*c)) {
        return Err(CoreError::InvalidTag {
            tag: tag.to_string(),
            reason: format!("unexpected character {c:?}"),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Tag(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self, tags: &BTreeSet<String>) -> bool {
        match self {
            Expr::Tag(t) => tags.contains(t),
            Expr::Not(e) => !e.eval(tags),
            Expr::And(a, b) => a.eval(tags) && b.eval(tags),
            Expr::Or(a, b) => a.eval(tags) || b.eval(tags),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Tag(String),
    Not,
    And,
    Or,
    Open,
    Close,
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = src.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            '&' => {
                chars.next();
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                tokens.push(Token::Or);
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            c if is_tag_char(c) => {
                let mut tag = String::new();
                while let Some(&c) = chars.peek() {
                    if !is_tag_char(c) {
                        break;
                    }
                    tag.push(c);
                    chars.next();
                }
                tokens.push(Token::Tag(tag));
            }
            other => return Err(format!("unexpected character {other:?}")),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expr(&mut self) -> Result<Expr, String> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, String> {
        let mut lhs = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Not) => Ok(Expr::Not(Box::new(self.unary()?))),
            Some(Token::Open) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err("missing closing parenthesis".to_string()),
                }
            }
            Some(Token::Tag(t)) => Ok(Expr::Tag(t)),
            Some(other) => Err(format!("unexpected token {other:?}")),
            None => Err("unexpected end of filter".to_string()),
        }
    }
}

/// Parsed boolean tag expression.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TagFilter {
    source: String,
    expr: Option<Expr>,
}

impl TagFilter {
    /// The filter matching every node.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn parse(src: &str) -> CoreResult<Self> {
        let trimmed = src.trim();
        if trimmed.is_empty() {
            return Ok(Self::any());
        }
        let invalid = |reason: String| CoreError::InvalidTagFilter {
            filter: src.to_string(),
            reason,
        };
        let tokens = tokenize(trimmed).map_err(invalid)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr().map_err(invalid)?;
        if parser.pos != parser.tokens.len() {
            return Err(invalid("trailing tokens".to_string()));
        }
        Ok(Self {
            source: trimmed.to_string(),
            expr: Some(expr),
        })
    }

    pub fn is_any(&self) -> bool {
        self.expr.is_none()
    }

    pub fn matches(&self, tags: &BTreeSet<String>) -> bool {
        self.expr.as_ref().is_none_or(|e| e.eval(tags))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl TryFrom<String> for TagFilter {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TagFilter> for String {
    fn from(value: TagFilter) -> Self {
        value.source
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_filter_matches_everything() {
        let f = TagFilter::parse("  ").unwrap();
        assert!(f.is_any());
        assert!(f.matches(&tags(&[])));
    }

    #[test]
    fn negation_excludes_tagged_nodes() {
        let f = TagFilter::parse("!custom").unwrap();
        assert!(!f.matches(&tags(&["custom"])));
        assert!(f.matches(&tags(&["other"])));
    }

    #[test]
    fn precedence_and_binds_tighter_than_or() {
        let f = TagFilter::parse("a | b & c").unwrap();
        assert!(f.matches(&tags(&["a"])));
        assert!(!f.matches(&tags(&["b"])));
        assert!(f.matches(&tags(&["b", "c"])));

        let g = TagFilter::parse("(a | b) & !c").unwrap();
        assert!(g.matches(&tags(&["b"])));
        assert!(!g.matches(&tags(&["b", "c"])));
    }

    #[test]
    fn malformed_filters_are_rejected() {
        assert!(TagFilter::parse("a &").is_err());
        assert!(TagFilter::parse("(a | b").is_err());
        assert!(TagFilter::parse("a b").is_err());
        assert!(TagFilter::parse("a $ b").is_err());
    }

    #[test]
    fn tag_validation_rejects_operator_characters() {
        assert!(validate_tag("custom").is_ok());
        assert!(validate_tag("rack:1/a").is_ok());
        assert!(validate_tag("custom!").is_err());
        assert!(validate_tag("").is_err());
    }

    #[test]
    fn serde_roundtrip_keeps_source() {
        let f = TagFilter::parse("ssd & !decom").unwrap();
        let json = serde_json::to_string(&f).unwrap();
        assert_eq!(json, "\"ssd & !decom\"");
        let back: TagFilter = serde_json::from_str(&json).unwrap();
        assert_eq!(back, f);
    }
}
