//! L1: tag-based boolean filter query engine (spec.md §4 L1).
//!
//! Three surfaces over the same `TagFilter` tree:
//! - simple: comma-separated tags, OR'd together (`"a,b,c"`)
//! - advanced: infix `AND`/`OR`/`NOT` with parens (`"a AND (b OR NOT c)"`)
//! - JSON: `{"tag": "a"}` / `{"$and": [...]}` / `{"$or": [...]}` / `{"$not": ...}`
//!
//! Plus a three-state `TagSelector` (required / forbidden / ignored) used by
//! callers that want per-tag toggles rather than a boolean expression.

use std::collections::HashSet;
use std::fmt;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagFilter {
    Tag(String),
    And(Vec<TagFilter>),
    Or(Vec<TagFilter>),
    Not(Box<TagFilter>),
    /// The empty filter: matches everything.
    Any,
}

#[derive(Debug, thiserror::Error)]
pub enum TagQueryError {
    #[error("unexpected end of tag query")]
    UnexpectedEof,
    #[error("unexpected token '{0}' in tag query")]
    UnexpectedToken(String),
    #[error("unbalanced parentheses in tag query")]
    UnbalancedParens,
    #[error("invalid JSON tag filter: {0}")]
    InvalidJson(String),
}

impl TagFilter {
    pub fn matches(&self, tags: &HashSet<String>) -> bool {
        match self {
            TagFilter::Any => true,
            TagFilter::Tag(t) => tags.iter().any(|tag| tag.eq_ignore_ascii_case(t)),
            TagFilter::And(children) => children.iter().all(|c| c.matches(tags)),
            TagFilter::Or(children) => children.iter().any(|c| c.matches(tags)),
            TagFilter::Not(inner) => !inner.matches(tags),
        }
    }

    /// Parse the simple comma-OR syntax. Empty/whitespace-only input matches
    /// everything.
    pub fn parse_simple(input: &str) -> TagFilter {
        let tags: Vec<TagFilter> = input
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| TagFilter::Tag(s.to_string()))
            .collect();
        match tags.len() {
            0 => TagFilter::Any,
            1 => tags.into_iter().next().unwrap(),
            _ => TagFilter::Or(tags),
        }
    }

    /// Parse the advanced infix syntax: `AND`, `OR`, `NOT`, parens, bare tag
    /// tokens. Keywords are case-insensitive; tag names may contain any
    /// non-whitespace, non-paren character.
    pub fn parse_advanced(input: &str) -> Result<TagFilter, TagQueryError> {
        let tokens = tokenize(input);
        if tokens.is_empty() {
            return Ok(TagFilter::Any);
        }
        let mut parser = Parser { tokens: &tokens, pos: 0 };
        let filter = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(TagQueryError::UnexpectedToken(parser.tokens[parser.pos].to_string()));
        }
        Ok(filter)
    }

    pub fn from_json(value: &Value) -> Result<TagFilter, TagQueryError> {
        match value {
            Value::String(s) => Ok(TagFilter::Tag(s.clone())),
            Value::Object(map) => {
                if let Some(tag) = map.get("tag") {
                    let Value::String(s) = tag else {
                        return Err(TagQueryError::InvalidJson("'tag' must be a string".into()));
                    };
                    return Ok(TagFilter::Tag(s.clone()));
                }
                if let Some(and) = map.get("$and") {
                    return Ok(TagFilter::And(parse_json_array(and)?));
                }
                if let Some(or) = map.get("$or") {
                    return Ok(TagFilter::Or(parse_json_array(or)?));
                }
                if let Some(not) = map.get("$not") {
                    return Ok(TagFilter::Not(Box::new(TagFilter::from_json(not)?)));
                }
                Err(TagQueryError::InvalidJson(
                    "expected one of 'tag', '$and', '$or', '$not'".into(),
                ))
            }
            _ => Err(TagQueryError::InvalidJson(
                "tag filter must be a string or object".into(),
            )),
        }
    }
}

fn parse_json_array(value: &Value) -> Result<Vec<TagFilter>, TagQueryError> {
    let Value::Array(items) = value else {
        return Err(TagQueryError::InvalidJson("expected a JSON array".into()));
    };
    items.iter().map(TagFilter::from_json).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    And,
    Or,
    Not,
    LParen,
    RParen,
    Tag(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::And => write!(f, "AND"),
            Token::Or => write!(f, "OR"),
            Token::Not => write!(f, "NOT"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Tag(t) => write!(f, "{t}"),
        }
    }
}

fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    let mut buf = String::new();

    fn flush(buf: &mut String, tokens: &mut Vec<Token>) {
        if buf.is_empty() {
            return;
        }
        let token = match buf.to_ascii_uppercase().as_str() {
            "AND" => Token::And,
            "OR" => Token::Or,
            "NOT" => Token::Not,
            _ => Token::Tag(buf.clone()),
        };
        tokens.push(token);
        buf.clear();
    }

    while let Some(&c) = chars.peek() {
        match c {
            '(' => {
                flush(&mut buf, &mut tokens);
                tokens.push(Token::LParen);
                chars.next();
            }
            ')' => {
                flush(&mut buf, &mut tokens);
                tokens.push(Token::RParen);
                chars.next();
            }
            c if c.is_whitespace() => {
                flush(&mut buf, &mut tokens);
                chars.next();
            }
            _ => {
                buf.push(c);
                chars.next();
            }
        }
    }
    flush(&mut buf, &mut tokens);
    tokens
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn parse_or(&mut self) -> Result<TagFilter, TagQueryError> {
        let mut terms = vec![self.parse_and()?];
        while matches!(self.peek(), Some(Token::Or)) {
            self.pos += 1;
            terms.push(self.parse_and()?);
        }
        Ok(if terms.len() == 1 {
            terms.into_iter().next().unwrap()
        } else {
            TagFilter::Or(terms)
        })
    }

    fn parse_and(&mut self) -> Result<TagFilter, TagQueryError> {
        let mut terms = vec![self.parse_unary()?];
        while matches!(self.peek(), Some(Token::And)) {
            self.pos += 1;
            terms.push(self.parse_unary()?);
        }
        Ok(if terms.len() == 1 {
            terms.into_iter().next().unwrap()
        } else {
            TagFilter::And(terms)
        })
    }

    fn parse_unary(&mut self) -> Result<TagFilter, TagQueryError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.pos += 1;
            return Ok(TagFilter::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<TagFilter, TagQueryError> {
        match self.peek() {
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                match self.peek() {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(TagQueryError::UnbalancedParens),
                }
            }
            Some(Token::Tag(t)) => {
                let t = t.clone();
                self.pos += 1;
                Ok(TagFilter::Tag(t))
            }
            Some(other) => Err(TagQueryError::UnexpectedToken(other.to_string())),
            None => Err(TagQueryError::UnexpectedEof),
        }
    }
}

/// Three-state per-tag toggle: a tag is required, forbidden, or ignored.
/// Matches iff every required tag is present and no forbidden tag is present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSelector {
    pub required: HashSet<String>,
    pub forbidden: HashSet<String>,
}

impl TagSelector {
    pub fn matches(&self, tags: &HashSet<String>) -> bool {
        let has = |t: &str| tags.iter().any(|tag| tag.eq_ignore_ascii_case(t));
        self.required.iter().all(|t| has(t)) && self.forbidden.iter().all(|t| !has(t))
    }

    pub fn require(mut self, tag: impl Into<String>) -> Self {
        self.required.insert(tag.into());
        self
    }

    pub fn forbid(mut self, tag: impl Into<String>) -> Self {
        self.forbidden.insert(tag.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn simple_empty_matches_everything() {
        let f = TagFilter::parse_simple("   ");
        assert!(f.matches(&tags(&[])));
    }

    #[test]
    fn simple_is_or() {
        let f = TagFilter::parse_simple("a, b");
        assert!(f.matches(&tags(&["b"])));
        assert!(!f.matches(&tags(&["c"])));
    }

    #[test]
    fn advanced_and_or_not_precedence() {
        let f = TagFilter::parse_advanced("a AND (b OR NOT c)").unwrap();
        assert!(f.matches(&tags(&["a", "b"])));
        assert!(f.matches(&tags(&["a"])));
        assert!(!f.matches(&tags(&["a", "c"])));
    }

    #[test]
    fn advanced_unbalanced_parens_errors() {
        let err = TagFilter::parse_advanced("(a AND b").unwrap_err();
        assert!(matches!(err, TagQueryError::UnbalancedParens));
    }

    #[test]
    fn json_and_or_not_form() {
        let json: Value = serde_json::json!({
            "$and": [{"tag": "a"}, {"$not": {"tag": "b"}}]
        });
        let f = TagFilter::from_json(&json).unwrap();
        assert!(f.matches(&tags(&["a"])));
        assert!(!f.matches(&tags(&["a", "b"])));
    }

    #[test]
    fn tag_selector_three_state() {
        let selector = TagSelector::default().require("a").forbid("b");
        assert!(selector.matches(&tags(&["a", "c"])));
        assert!(!selector.matches(&tags(&["a", "b"])));
        assert!(!selector.matches(&tags(&["c"])));
    }

    #[test]
    fn filter_matching_is_case_insensitive() {
        let f = TagFilter::parse_simple("Web");
        assert!(f.matches(&tags(&["web"])));
        assert!(f.matches(&tags(&["WEB"])));

        let advanced = TagFilter::parse_advanced("API and not Beta").unwrap();
        assert!(advanced.matches(&tags(&["api"])));
        assert!(!advanced.matches(&tags(&["API", "beta"])));
    }

    #[test]
    fn selector_matching_is_case_insensitive() {
        let selector = TagSelector::default().require("Api").forbid("Beta");
        assert!(selector.matches(&tags(&["api"])));
        assert!(!selector.matches(&tags(&["API", "BETA"])));
    }
}
