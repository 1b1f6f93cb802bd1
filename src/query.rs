//! OData query parameters and filter expressions.
//!
//! `$top`, `$skip`, `$orderby`, `$filter`, `$select`, `$count` and `$expand`
//! are parsed from the request query string; `$filter` carries a small
//! expression language parsed by recursive descent into an AST that is
//! evaluated per document.

use std::cmp::Ordering;

use serde_json::Value;
use thiserror::Error;

use crate::document::{self, canonical_string};
use crate::Document;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct QueryError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Default)]
pub struct QueryOptions {
    pub top: Option<usize>,
    pub skip: Option<usize>,
    pub orderby: Option<(String, Direction)>,
    pub filter: Option<FilterExpr>,
    pub select: Option<Vec<String>>,
    pub count: bool,
}

impl QueryOptions {
    pub fn parse(params: &[(String, String)]) -> Result<QueryOptions, QueryError> {
        let mut options = QueryOptions::default();
        for (name, value) in params {
            match name.as_str() {
                "$top" => options.top = Some(non_negative(name, value)?),
                "$skip" => options.skip = Some(non_negative(name, value)?),
                "$orderby" => {
                    let mut parts = value.split_whitespace();
                    let field = parts
                        .next()
                        .ok_or_else(|| QueryError("$orderby needs a field name".into()))?;
                    let direction = match parts.next() {
                        None => Direction::Ascending,
                        Some(d) if d.eq_ignore_ascii_case("asc") => Direction::Ascending,
                        Some(d) if d.eq_ignore_ascii_case("desc") => Direction::Descending,
                        Some(d) => {
                            return Err(QueryError(format!("unknown $orderby direction '{d}'")))
                        }
                    };
                    if parts.next().is_some() {
                        return Err(QueryError(format!("malformed $orderby '{value}'")));
                    }
                    options.orderby = Some((field.to_string(), direction));
                }
                "$filter" => options.filter = Some(FilterExpr::parse(value)?),
                "$select" => {
                    let fields: Vec<String> = value
                        .split(',')
                        .map(str::trim)
                        .filter(|f| !f.is_empty())
                        .map(str::to_string)
                        .collect();
                    if fields.is_empty() {
                        return Err(QueryError("$select needs at least one field".into()));
                    }
                    options.select = Some(fields);
                }
                "$count" => {
                    options.count = match value.as_str() {
                        "true" => true,
                        "false" => false,
                        other => {
                            return Err(QueryError(format!("$count must be true or false, got '{other}'")))
                        }
                    }
                }
                // Accepted and ignored; there is no relation model to expand.
                "$expand" => {}
                other => return Err(QueryError(format!("unknown query parameter '{other}'"))),
            }
        }
        Ok(options)
    }
}

fn non_negative(name: &str, value: &str) -> Result<usize, QueryError> {
    let n: i64 = value
        .parse()
        .map_err(|_| QueryError(format!("{name} must be an integer, got '{value}'")))?;
    if n < 0 {
        return Err(QueryError(format!("{name} must not be negative, got {n}")));
    }
    Ok(n as usize)
}

/// Retain only the listed fields plus `_id`, in document order.
pub(crate) fn project(doc: &Document, fields: &[String]) -> Document {
    doc.iter()
        .filter(|(key, _)| *key == "_id" || fields.iter().any(|f| f == *key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Stable in-memory sort on one field. Missing fields sort last; values of
/// different types group by a fixed type rank.
pub(crate) fn sort_documents(documents: &mut [Document], field: &str, direction: Direction) {
    documents.sort_by(|a, b| {
        let ordering = order_field(a.get(field), b.get(field));
        match direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    });
}

fn order_field(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => document::compare(a, b).unwrap_or_else(|| {
            type_rank(a)
                .cmp(&type_rank(b))
                .then_with(|| canonical_string(a).cmp(&canonical_string(b)))
        }),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringFunction {
    StartsWith,
    EndsWith,
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl Literal {
    fn to_value(&self) -> Value {
        match self {
            Literal::Str(s) => Value::from(s.clone()),
            Literal::Int(i) => Value::from(*i),
            Literal::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Literal::Bool(b) => Value::from(*b),
            Literal::Null => Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    Or(Box<FilterExpr>, Box<FilterExpr>),
    And(Box<FilterExpr>, Box<FilterExpr>),
    Not(Box<FilterExpr>),
    Compare {
        field: String,
        op: CompareOp,
        literal: Literal,
    },
    Function {
        function: StringFunction,
        field: String,
        literal: Literal,
    },
}

impl FilterExpr {
    pub fn parse(input: &str) -> Result<FilterExpr, QueryError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or_expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(QueryError(format!("trailing input in $filter '{input}'")));
        }
        Ok(expr)
    }

    pub fn eval(&self, doc: &Document) -> bool {
        match self {
            FilterExpr::Or(a, b) => a.eval(doc) || b.eval(doc),
            FilterExpr::And(a, b) => a.eval(doc) && b.eval(doc),
            FilterExpr::Not(inner) => !inner.eval(doc),
            FilterExpr::Compare { field, op, literal } => {
                let Some(actual) = doc.get(field) else {
                    // A missing field fails every comparison except "ne".
                    return *op == CompareOp::Ne;
                };
                let expected = literal.to_value();
                match op {
                    CompareOp::Eq => document::values_equal(actual, &expected),
                    CompareOp::Ne => !document::values_equal(actual, &expected),
                    CompareOp::Gt => document::compare(actual, &expected) == Some(Ordering::Greater),
                    CompareOp::Ge => matches!(
                        document::compare(actual, &expected),
                        Some(Ordering::Greater | Ordering::Equal)
                    ),
                    CompareOp::Lt => document::compare(actual, &expected) == Some(Ordering::Less),
                    CompareOp::Le => matches!(
                        document::compare(actual, &expected),
                        Some(Ordering::Less | Ordering::Equal)
                    ),
                }
            }
            FilterExpr::Function {
                function,
                field,
                literal,
            } => {
                let Some(Value::String(actual)) = doc.get(field) else {
                    return false;
                };
                let Literal::Str(operand) = literal else {
                    return false;
                };
                match function {
                    StringFunction::StartsWith => actual.starts_with(operand),
                    StringFunction::EndsWith => actual.ends_with(operand),
                    StringFunction::Contains => actual.contains(operand),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Str(String),
    Number(String),
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>, QueryError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '\'' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => s.push(c),
                        None => return Err(QueryError("unterminated string literal".into())),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut s = String::new();
                s.push(c);
                chars.next();
                let mut seen_dot = false;
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || (c == '.' && !seen_dot) {
                        seen_dot |= c == '.';
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Number(s));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        s.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Word(s));
            }
            other => return Err(QueryError(format!("unexpected character '{other}' in $filter"))),
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
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn or_expr(&mut self) -> Result<FilterExpr, QueryError> {
        let mut left = self.and_expr()?;
        while self.peek_keyword("or") {
            self.pos += 1;
            let right = self.and_expr()?;
            left = FilterExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<FilterExpr, QueryError> {
        let mut left = self.not_expr()?;
        while self.peek_keyword("and") {
            self.pos += 1;
            let right = self.not_expr()?;
            left = FilterExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<FilterExpr, QueryError> {
        if self.peek_keyword("not") {
            self.pos += 1;
            return Ok(FilterExpr::Not(Box::new(self.not_expr()?)));
        }
        self.unary()
    }

    fn unary(&mut self) -> Result<FilterExpr, QueryError> {
        if matches!(self.peek(), Some(Token::LParen)) {
            self.pos += 1;
            let expr = self.or_expr()?;
            match self.next() {
                Some(Token::RParen) => return Ok(expr),
                _ => return Err(QueryError("expected ')' in $filter".into())),
            }
        }

        let Some(Token::Word(word)) = self.next() else {
            return Err(QueryError("expected field name or function in $filter".into()));
        };

        let function = match word.to_ascii_lowercase().as_str() {
            "startswith" => Some(StringFunction::StartsWith),
            "endswith" => Some(StringFunction::EndsWith),
            "contains" => Some(StringFunction::Contains),
            _ => None,
        };

        if let (Some(function), Some(Token::LParen)) = (function, self.peek()) {
            self.pos += 1;
            let Some(Token::Word(field)) = self.next() else {
                return Err(QueryError("expected field name in function call".into()));
            };
            match self.next() {
                Some(Token::Comma) => {}
                _ => return Err(QueryError("expected ',' in function call".into())),
            }
            let literal = self.literal()?;
            match self.next() {
                Some(Token::RParen) => {}
                _ => return Err(QueryError("expected ')' after function call".into())),
            }
            return Ok(FilterExpr::Function {
                function,
                field,
                literal,
            });
        }

        let Some(Token::Word(op_word)) = self.next() else {
            return Err(QueryError(format!("expected comparison operator after '{word}'")));
        };
        let op = match op_word.to_ascii_lowercase().as_str() {
            "eq" => CompareOp::Eq,
            "ne" => CompareOp::Ne,
            "gt" => CompareOp::Gt,
            "ge" => CompareOp::Ge,
            "lt" => CompareOp::Lt,
            "le" => CompareOp::Le,
            other => return Err(QueryError(format!("unknown comparison operator '{other}'"))),
        };
        let literal = self.literal()?;
        Ok(FilterExpr::Compare {
            field: word,
            op,
            literal,
        })
    }

    fn literal(&mut self) -> Result<Literal, QueryError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Literal::Str(s)),
            Some(Token::Number(n)) => {
                if n.contains('.') {
                    n.parse()
                        .map(Literal::Float)
                        .map_err(|_| QueryError(format!("malformed number '{n}'")))
                } else {
                    n.parse()
                        .map(Literal::Int)
                        .map_err(|_| QueryError(format!("malformed number '{n}'")))
                }
            }
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("true") => Ok(Literal::Bool(true)),
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("false") => Ok(Literal::Bool(false)),
            Some(Token::Word(w)) if w.eq_ignore_ascii_case("null") => Ok(Literal::Null),
            _ => Err(QueryError("expected literal in $filter".into())),
        }
    }
}
