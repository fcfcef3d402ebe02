//! Graph configuration loading.
//!
//! Configurations are written in protobuf text format. Only the fields the
//! host understands (`input_stream`, `output_stream`, `node`) are
//! interpreted; everything else is parsed and kept so calculators can read
//! their own options.

use std::{fs, iter::Peekable, path::Path, str::CharIndices, str::FromStr};

use tracing::warn;

use crate::error::GraphError;

/// A parsed text-format value.
#[derive(Clone, Debug, PartialEq)]
pub enum TextValue {
    Scalar(String),
    Message(TextMessage),
}

/// Ordered list of `name: value` entries. Repeated names are kept in order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TextMessage {
    fields: Vec<(String, TextValue)>,
}

impl TextMessage {
    pub fn parse(source: &str) -> Result<Self, GraphError> {
        let mut parser = Parser {
            lexer: Lexer::new(source),
        };
        parser.fields(None)
    }

    pub fn fields(&self) -> &[(String, TextValue)] {
        &self.fields
    }

    /// First scalar stored under `key`.
    pub fn scalar(&self, key: &str) -> Option<&str> {
        self.fields.iter().find_map(|(name, value)| match value {
            TextValue::Scalar(s) if name == key => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn scalars<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields.iter().filter_map(move |(name, value)| match value {
            TextValue::Scalar(s) if name == key => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn messages<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a TextMessage> + 'a {
        self.fields.iter().filter_map(move |(name, value)| match value {
            TextValue::Message(m) if name == key => Some(m),
            _ => None,
        })
    }

    fn push(&mut self, name: String, value: TextValue) {
        self.fields.push((name, value));
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Word(String),
    Str(String),
    Punct(char),
}

struct Lexer<'a> {
    chars: Peekable<CharIndices<'a>>,
    line: usize,
    peeked: Option<Token>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.char_indices().peekable(),
            line: 1,
            peeked: None,
        }
    }

    fn error(&self, message: impl Into<String>) -> GraphError {
        GraphError::Parse {
            line: self.line,
            message: message.into(),
        }
    }

    fn peek(&mut self) -> Result<Option<&Token>, GraphError> {
        if self.peeked.is_none() {
            self.peeked = self.scan()?;
        }
        Ok(self.peeked.as_ref())
    }

    fn next(&mut self) -> Result<Option<Token>, GraphError> {
        if let Some(tok) = self.peeked.take() {
            return Ok(Some(tok));
        }
        self.scan()
    }

    fn skip_trivia(&mut self) {
        while let Some(&(_, c)) = self.chars.peek() {
            if c == '\n' {
                self.line += 1;
                self.chars.next();
            } else if c.is_whitespace() {
                self.chars.next();
            } else if c == '#' {
                while let Some(&(_, c)) = self.chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.chars.next();
                }
            } else {
                break;
            }
        }
    }

    fn scan(&mut self) -> Result<Option<Token>, GraphError> {
        self.skip_trivia();
        let Some(&(_, c)) = self.chars.peek() else {
            return Ok(None);
        };
        match c {
            '{' | '}' | '<' | '>' | ':' | ',' | ';' | '[' | ']' => {
                self.chars.next();
                Ok(Some(Token::Punct(c)))
            }
            '"' | '\'' => {
                self.chars.next();
                self.string(c).map(|s| Some(Token::Str(s)))
            }
            c if is_word_char(c) => {
                let mut word = String::new();
                while let Some(&(_, c)) = self.chars.peek() {
                    if !is_word_char(c) {
                        break;
                    }
                    word.push(c);
                    self.chars.next();
                }
                Ok(Some(Token::Word(word)))
            }
            other => Err(self.error(format!("unexpected character {other:?}"))),
        }
    }

    /// Read a quoted literal. Escapes may produce arbitrary bytes, so the
    /// literal is assembled as bytes and must decode as UTF-8 at the end.
    fn string(&mut self, quote: char) -> Result<String, GraphError> {
        let mut out = Vec::new();
        loop {
            let Some((_, c)) = self.chars.next() else {
                return Err(self.error("unterminated string"));
            };
            match c {
                '\n' => return Err(self.error("newline inside string")),
                c if c == quote => {
                    return String::from_utf8(out)
                        .map_err(|_| self.error("string literal is not valid UTF-8"));
                }
                '\\' => self.escape(&mut out)?,
                c => push_char(&mut out, c),
            }
        }
    }

    fn escape(&mut self, out: &mut Vec<u8>) -> Result<(), GraphError> {
        let Some((_, esc)) = self.chars.next() else {
            return Err(self.error("unterminated escape"));
        };
        let byte = match esc {
            'a' => 0x07,
            'b' => 0x08,
            'f' => 0x0c,
            'n' => b'\n',
            'r' => b'\r',
            't' => b'\t',
            'v' => 0x0b,
            '\\' | '\'' | '"' | '?' => esc as u8,
            '0'..='7' => {
                let first = esc.to_digit(8).unwrap_or_default();
                let (rest, count) = self.digits(8, 2);
                let value = first * 8u32.pow(count) + rest;
                u8::try_from(value)
                    .map_err(|_| self.error(format!("octal escape \\{value:o} out of range")))?
            }
            'x' | 'X' => {
                let (value, count) = self.digits(16, 2);
                if count == 0 {
                    return Err(self.error("\\x escape without hex digits"));
                }
                value as u8
            }
            'u' | 'U' => {
                let width = if esc == 'u' { 4 } else { 8 };
                let (value, count) = self.digits(16, width);
                let c = (count == width as u32)
                    .then(|| char::from_u32(value))
                    .flatten()
                    .ok_or_else(|| self.error(format!("invalid \\{esc} escape")))?;
                push_char(out, c);
                return Ok(());
            }
            other => return Err(self.error(format!("unknown escape \\{other}"))),
        };
        out.push(byte);
        Ok(())
    }

    /// Consume up to `max` digits in `radix`, returning their value and how
    /// many were read.
    fn digits(&mut self, radix: u32, max: usize) -> (u32, u32) {
        let mut value = 0u32;
        let mut count = 0u32;
        while (count as usize) < max {
            let Some(digit) = self.chars.peek().and_then(|&(_, c)| c.to_digit(radix)) else {
                break;
            };
            self.chars.next();
            value = value * radix + digit;
            count += 1;
        }
        (value, count)
    }
}

fn push_char(out: &mut Vec<u8>, c: char) {
    let mut buf = [0; 4];
    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '+' | '/')
}

struct Parser<'a> {
    lexer: Lexer<'a>,
}

impl Parser<'_> {
    fn fields(&mut self, close: Option<char>) -> Result<TextMessage, GraphError> {
        let mut message = TextMessage::default();
        loop {
            let token = match self.lexer.next()? {
                None if close.is_some() => return Err(self.lexer.error("unexpected end of input")),
                None => return Ok(message),
                Some(token) => token,
            };
            let name = match token {
                Token::Punct(',' | ';') => continue,
                Token::Punct(c) if Some(c) == close => return Ok(message),
                Token::Punct('[') => self.extension_name()?,
                Token::Word(word) => word,
                other => {
                    return Err(self.lexer.error(format!("expected field name, found {other:?}")));
                }
            };

            let had_colon = matches!(self.lexer.peek()?, Some(Token::Punct(':')));
            if had_colon {
                self.lexer.next()?;
            }

            match self.lexer.next()? {
                Some(Token::Punct(open @ ('{' | '<'))) => {
                    let nested = self.fields(Some(closing_for(open)))?;
                    message.push(name, TextValue::Message(nested));
                }
                Some(Token::Punct('[')) if had_colon => {
                    for value in self.list()? {
                        message.push(name.clone(), value);
                    }
                }
                Some(Token::Str(s)) if had_colon => {
                    message.push(name, TextValue::Scalar(self.concat_strings(s)?));
                }
                Some(Token::Word(w)) if had_colon => {
                    message.push(name, TextValue::Scalar(w));
                }
                Some(other) => {
                    return Err(self
                        .lexer
                        .error(format!("unexpected {other:?} after field {name:?}")));
                }
                None => return Err(self.lexer.error(format!("missing value for {name:?}"))),
            }
        }
    }

    fn extension_name(&mut self) -> Result<String, GraphError> {
        let mut name = String::from("[");
        loop {
            match self.lexer.next()? {
                Some(Token::Word(w)) => name.push_str(&w),
                Some(Token::Punct(']')) => {
                    name.push(']');
                    return Ok(name);
                }
                _ => return Err(self.lexer.error("malformed extension name")),
            }
        }
    }

    fn list(&mut self) -> Result<Vec<TextValue>, GraphError> {
        let mut values = Vec::new();
        loop {
            match self.lexer.next()? {
                Some(Token::Punct(']')) => return Ok(values),
                Some(Token::Punct(',')) => {}
                Some(Token::Str(s)) => values.push(TextValue::Scalar(self.concat_strings(s)?)),
                Some(Token::Word(w)) => values.push(TextValue::Scalar(w)),
                Some(Token::Punct(open @ ('{' | '<'))) => {
                    values.push(TextValue::Message(self.fields(Some(closing_for(open)))?));
                }
                _ => return Err(self.lexer.error("malformed list")),
            }
        }
    }

    /// Adjacent string literals are joined, as protobuf text format allows.
    fn concat_strings(&mut self, mut first: String) -> Result<String, GraphError> {
        while matches!(self.lexer.peek()?, Some(Token::Str(_))) {
            if let Some(Token::Str(next)) = self.lexer.next()? {
                first.push_str(&next);
            }
        }
        Ok(first)
    }
}

fn closing_for(open: char) -> char {
    if open == '<' { '>' } else { '}' }
}

/// Reference to a stream as written in a node or graph declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamRef {
    pub tag: Option<String>,
    pub index: usize,
    pub name: String,
}

impl FromStr for StreamRef {
    type Err = GraphError;

    /// Accepts `name`, `TAG:name` and `TAG:index:name`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = raw.split(':').collect();
        let invalid = || GraphError::InvalidConfig(format!("malformed stream reference {raw:?}"));
        let (tag, index, name) = match parts.as_slice() {
            [name] => (None, 0, *name),
            [tag, name] => (Some(*tag), 0, *name),
            [tag, index, name] => (Some(*tag), index.parse().map_err(|_| invalid())?, *name),
            _ => return Err(invalid()),
        };
        if name.is_empty() || tag.is_some_and(str::is_empty) {
            return Err(invalid());
        }
        Ok(Self {
            tag: tag.map(str::to_string),
            index,
            name: name.to_string(),
        })
    }
}

/// One `node { ... }` entry.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeConfig {
    pub name: Option<String>,
    pub calculator: String,
    pub input_streams: Vec<StreamRef>,
    pub output_streams: Vec<StreamRef>,
    /// Positions in `input_streams` marked `back_edge: true`. They carry
    /// feedback from later nodes and are not part of the execution order.
    pub back_edges: Vec<usize>,
    /// The full node message, for calculators that read their own options.
    pub raw: TextMessage,
}

impl NodeConfig {
    /// Name used in logs and errors.
    pub fn display_name(&self, position: usize) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{}#{position}", self.calculator),
        }
    }
}

/// The subset of a graph description the host executes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CalculatorGraphConfig {
    pub input_streams: Vec<String>,
    pub output_streams: Vec<String>,
    pub nodes: Vec<NodeConfig>,
}

impl CalculatorGraphConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, GraphError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| GraphError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        contents.parse()
    }

    fn from_message(message: &TextMessage) -> Result<Self, GraphError> {
        for key in ["input_side_packet", "output_side_packet", "executor"] {
            if message.fields().iter().any(|(name, _)| name == key) {
                warn!("Graph config field {key:?} is not supported by this host; ignoring");
            }
        }

        let input_streams = message
            .scalars("input_stream")
            .map(|s| s.parse::<StreamRef>().map(|r| r.name))
            .collect::<Result<_, _>>()?;
        let output_streams = message
            .scalars("output_stream")
            .map(|s| s.parse::<StreamRef>().map(|r| r.name))
            .collect::<Result<_, _>>()?;

        let nodes = message
            .messages("node")
            .enumerate()
            .map(|(position, node)| {
                let calculator = node
                    .scalar("calculator")
                    .ok_or_else(|| {
                        GraphError::InvalidConfig(format!("node #{position} has no calculator"))
                    })?
                    .to_string();
                if node.scalar("input_side_packet").is_some() {
                    warn!("Node {calculator} declares side packets; they are ignored");
                }
                let input_streams: Vec<StreamRef> = node
                    .scalars("input_stream")
                    .map(str::parse::<StreamRef>)
                    .collect::<Result<_, _>>()?;
                let back_edges = back_edge_positions(node, &input_streams, &calculator)?;
                Ok(NodeConfig {
                    name: node.scalar("name").map(str::to_string),
                    calculator,
                    input_streams,
                    output_streams: node
                        .scalars("output_stream")
                        .map(str::parse::<StreamRef>)
                        .collect::<Result<_, _>>()?,
                    back_edges,
                    raw: node.clone(),
                })
            })
            .collect::<Result<_, GraphError>>()?;

        Ok(Self {
            input_streams,
            output_streams,
            nodes,
        })
    }
}

/// Resolve `input_stream_info { tag_index: ... back_edge: true }` entries.
fn back_edge_positions(
    node: &TextMessage,
    inputs: &[StreamRef],
    calculator: &str,
) -> Result<Vec<usize>, GraphError> {
    let mut positions = Vec::new();
    for info in node.messages("input_stream_info") {
        if info.scalar("back_edge") != Some("true") {
            continue;
        }
        let tag_index = info.scalar("tag_index").unwrap_or_default();
        let (tag, index) = match tag_index.split_once(':') {
            Some((tag, index)) => (tag, index.parse::<usize>().ok()),
            None => (tag_index, Some(0)),
        };
        let tag = (!tag.is_empty()).then_some(tag);
        let position = index.and_then(|index| {
            inputs
                .iter()
                .position(|r| r.tag.as_deref() == tag && r.index == index)
        });
        match position {
            Some(position) => positions.push(position),
            None => {
                return Err(GraphError::InvalidConfig(format!(
                    "{calculator}: back edge {tag_index:?} matches no input stream"
                )));
            }
        }
    }
    Ok(positions)
}

impl FromStr for CalculatorGraphConfig {
    type Err = GraphError;

    fn from_str(contents: &str) -> Result<Self, Self::Err> {
        Self::from_message(&TextMessage::parse(contents)?)
    }
}
