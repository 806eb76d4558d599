//! Reader for the restricted literal syntax manifests are written in.
//!
//! Accepted values: dicts with string keys, lists, tuples, single or double
//! quoted strings (adjacent strings are concatenated), integers, `True`,
//! `False` and `None`. `#` starts a comment that runs to the end of the line.
//! Trailing commas are allowed. Nothing is ever evaluated.

use serde_json::{Map, Value};

use crate::error::ManifestError;

pub(crate) fn parse(source: &str, location: &str) -> Result<Value, ManifestError> {
    let mut parser = Parser {
        src: source.as_bytes(),
        pos: 0,
        location,
    };

    let value = parser.value()?;
    parser.skip_trivia();

    if parser.pos != parser.src.len() {
        return Err(parser.error("unexpected trailing content"));
    }

    Ok(value)
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    location: &'a str,
}

impl Parser<'_> {
    fn error(&self, message: impl Into<String>) -> ManifestError {
        ManifestError::Syntax {
            location: self.location.to_string(),
            offset: self.pos,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn skip_trivia(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                b' ' | b'\t' | b'\r' | b'\n' => self.pos += 1,
                b'#' => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), ManifestError> {
        self.skip_trivia();
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected `{}`", byte as char)))
        }
    }

    fn value(&mut self) -> Result<Value, ManifestError> {
        self.skip_trivia();

        match self.peek() {
            Some(b'{') => self.dict(),
            Some(b'[') => self.sequence(b'[', b']'),
            Some(b'(') => self.sequence(b'(', b')'),
            Some(b'\'' | b'"') => self.strings().map(Value::String),
            Some(b'-' | b'0'..=b'9') => self.integer(),
            Some(c) if c.is_ascii_alphabetic() => self.keyword(),
            Some(c) => Err(self.error(format!("unexpected character `{}`", c as char))),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn dict(&mut self) -> Result<Value, ManifestError> {
        self.expect(b'{')?;
        let mut map = Map::new();

        loop {
            self.skip_trivia();
            if self.peek() == Some(b'}') {
                self.pos += 1;
                return Ok(Value::Object(map));
            }

            let key = match self.peek() {
                Some(b'\'' | b'"') => self.strings()?,
                _ => return Err(self.error("dictionary keys must be strings")),
            };

            self.expect(b':')?;
            let value = self.value()?;

            if map.insert(key.clone(), value).is_some() {
                return Err(self.error(format!("duplicate key `{key}`")));
            }

            if !self.separator(b'}')? {
                self.expect(b'}')?;
                return Ok(Value::Object(map));
            }
        }
    }

    fn sequence(&mut self, open: u8, close: u8) -> Result<Value, ManifestError> {
        self.expect(open)?;
        let mut items = Vec::new();

        loop {
            self.skip_trivia();
            if self.peek() == Some(close) {
                self.pos += 1;
                return Ok(Value::Array(items));
            }

            items.push(self.value()?);

            if !self.separator(close)? {
                self.expect(close)?;
                return Ok(Value::Array(items));
            }
        }
    }

    /// Consumes a `,` if present. Returns false when the container must end.
    fn separator(&mut self, close: u8) -> Result<bool, ManifestError> {
        self.skip_trivia();
        match self.peek() {
            Some(b',') => {
                self.pos += 1;
                Ok(true)
            }
            Some(c) if c == close => Ok(false),
            _ => Err(self.error(format!("expected `,` or `{}`", close as char))),
        }
    }

    fn strings(&mut self) -> Result<String, ManifestError> {
        let mut out = self.string()?;

        loop {
            let save = self.pos;
            self.skip_trivia();
            match self.peek() {
                Some(b'\'' | b'"') => out.push_str(&self.string()?),
                _ => {
                    self.pos = save;
                    return Ok(out);
                }
            }
        }
    }

    fn string(&mut self) -> Result<String, ManifestError> {
        let quote = self.peek().ok_or_else(|| self.error("expected a string"))?;
        self.pos += 1;
        let mut bytes = Vec::new();

        loop {
            match self.peek() {
                None | Some(b'\n') => return Err(self.error("unterminated string")),
                Some(c) if c == quote => {
                    self.pos += 1;
                    break;
                }
                Some(b'\\') => {
                    self.pos += 1;
                    let escaped = match self.peek() {
                        Some(b'n') => b'\n',
                        Some(b't') => b'\t',
                        Some(b'r') => b'\r',
                        Some(b'\\') => b'\\',
                        Some(b'\'') => b'\'',
                        Some(b'"') => b'"',
                        _ => return Err(self.error("unsupported escape sequence")),
                    };
                    bytes.push(escaped);
                    self.pos += 1;
                }
                Some(c) => {
                    bytes.push(c);
                    self.pos += 1;
                }
            }
        }

        String::from_utf8(bytes).map_err(|_| self.error("string is not valid UTF-8"))
    }

    fn integer(&mut self) -> Result<Value, ManifestError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }

        std::str::from_utf8(&self.src[start..self.pos])
            .ok()
            .and_then(|text| text.parse::<i64>().ok())
            .map(Value::from)
            .ok_or_else(|| self.error("invalid integer"))
    }

    fn keyword(&mut self) -> Result<Value, ManifestError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == b'_') {
            self.pos += 1;
        }

        match &self.src[start..self.pos] {
            b"True" | b"true" => Ok(Value::Bool(true)),
            b"False" | b"false" => Ok(Value::Bool(false)),
            b"None" | b"null" => Ok(Value::Null),
            _ => {
                self.pos = start;
                Err(self.error("names are not allowed in manifests"))
            }
        }
    }
}
