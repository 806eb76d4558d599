//! Condition expressions.
//!
//! The grammar is deliberately tiny:
//!
//! ```text
//! expr  := conj ( "or" conj )*
//! conj  := atom ( "and" atom )*
//! atom  := IDENT "==" ( STRING | INT ) | "(" expr ")"
//! ```
//!
//! Expressions are evaluated against an explicit binding map with
//! three-valued logic: a comparison on an unbound variable is unknown, and
//! only decides the outcome when the other operand can't.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::ManifestError;

/// A value a configuration variable can take.
///
/// `Int` sorts before `Str`, which keeps tuple ordering stable regardless of
/// how the values were written.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConfigValue {
    Int(i64),
    Str(String),
}

impl ConfigValue {
    /// Interprets a command-line style `NAME=value` right hand side.
    pub fn parse(raw: &str) -> Self {
        match raw.parse::<i64>() {
            Ok(int) => ConfigValue::Int(int),
            Err(_) => ConfigValue::Str(raw.to_string()),
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Int(int) => write!(f, "{int}"),
            ConfigValue::Str(str) => write!(f, "{str:?}"),
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::Str(value.to_string())
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        ConfigValue::Int(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Eq { variable: String, value: ConfigValue },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn parse(source: &str) -> Result<Self, ManifestError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            source,
            tokens,
            pos: 0,
        };

        let expr = parser.disjunction()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error("unexpected trailing tokens"));
        }

        Ok(expr)
    }

    /// `None` when the result depends on a variable missing from `bindings`.
    pub fn eval(&self, bindings: &BTreeMap<&str, &ConfigValue>) -> Option<bool> {
        match self {
            Expr::Eq { variable, value } => bindings
                .get(variable.as_str())
                .map(|bound| *bound == value),
            Expr::And(lhs, rhs) => match (lhs.eval(bindings), rhs.eval(bindings)) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            },
            Expr::Or(lhs, rhs) => match (lhs.eval(bindings), rhs.eval(bindings)) {
                (Some(true), _) | (_, Some(true)) => Some(true),
                (Some(false), Some(false)) => Some(false),
                _ => None,
            },
        }
    }

    /// Records every value each variable is compared against.
    pub fn comparisons(&self, out: &mut BTreeMap<String, BTreeSet<ConfigValue>>) {
        match self {
            Expr::Eq { variable, value } => {
                out.entry(variable.clone())
                    .or_default()
                    .insert(value.clone());
            }
            Expr::And(lhs, rhs) | Expr::Or(lhs, rhs) => {
                lhs.comparisons(out);
                rhs.comparisons(out);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    EqEq,
    And,
    Or,
    Open,
    Close,
}

fn invalid(source: &str, message: impl Into<String>) -> ManifestError {
    ManifestError::Condition {
        expr: source.to_string(),
        message: message.into(),
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, ManifestError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '=' => {
                chars.next();
                match chars.next() {
                    Some((_, '=')) => tokens.push(Token::EqEq),
                    _ => return Err(invalid(source, "only `==` comparisons are allowed")),
                }
            }
            '\'' | '"' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some((_, q)) if q == c => break,
                        Some((_, '\\')) => return Err(invalid(source, "escapes are not allowed")),
                        Some((_, ch)) => text.push(ch),
                        None => return Err(invalid(source, "unterminated string")),
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut end = start + c.len_utf8();
                chars.next();
                while let Some(&(i, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    end = i + 1;
                    chars.next();
                }
                let int = source[start..end]
                    .parse::<i64>()
                    .map_err(|_| invalid(source, "invalid integer literal"))?;
                tokens.push(Token::Int(int));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = start;
                while let Some(&(i, d)) = chars.peek() {
                    if !(d.is_ascii_alphanumeric() || d == '_') {
                        break;
                    }
                    end = i + 1;
                    chars.next();
                }
                let token = match &source[start..end] {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" | "in" | "is" | "if" | "else" | "lambda" => {
                        return Err(invalid(
                            source,
                            format!("keyword `{}` is not allowed", &source[start..end]),
                        ));
                    }
                    ident => Token::Ident(ident.to_string()),
                };
                tokens.push(token);
            }
            other => {
                return Err(invalid(source, format!("unexpected character `{other}`")));
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, message: &str) -> ManifestError {
        invalid(self.source, message)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.tokens.get(self.pos) == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn disjunction(&mut self) -> Result<Expr, ManifestError> {
        let mut expr = self.conjunction()?;
        while self.eat(&Token::Or) {
            expr = Expr::Or(Box::new(expr), Box::new(self.conjunction()?));
        }
        Ok(expr)
    }

    fn conjunction(&mut self) -> Result<Expr, ManifestError> {
        let mut expr = self.atom()?;
        while self.eat(&Token::And) {
            expr = Expr::And(Box::new(expr), Box::new(self.atom()?));
        }
        Ok(expr)
    }

    fn atom(&mut self) -> Result<Expr, ManifestError> {
        match self.next() {
            Some(Token::Open) => {
                let expr = self.disjunction()?;
                if !self.eat(&Token::Close) {
                    return Err(self.error("missing `)`"));
                }
                Ok(expr)
            }
            Some(Token::Ident(variable)) => {
                if !self.eat(&Token::EqEq) {
                    return Err(self.error("expected `==` after a variable name"));
                }
                let value = match self.next() {
                    Some(Token::Str(str)) => ConfigValue::Str(str),
                    Some(Token::Int(int)) => ConfigValue::Int(int),
                    _ => return Err(self.error("expected a string or integer literal")),
                };
                Ok(Expr::Eq { variable, value })
            }
            _ => Err(self.error("expected a comparison or `(`")),
        }
    }
}
