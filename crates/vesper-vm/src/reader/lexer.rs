// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Lexer for Vesper source text.
//!
//! Converts a port's character stream into tokens. Comments (line,
//! nested block, and `#!` directives) are consumed here; `#;` datum
//! comments surface as a token because discarding the next datum is
//! the parser's job.

use crate::port::PortError;
use crate::realm::Realm;
use crate::types::ObjRef;
use crate::value::Value;
use crate::value::object::ObjKind;

/// A token of Vesper syntax.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// `(`
    LParen,
    /// `)`
    RParen,
    /// `#(`
    VecOpen,
    /// `#u8(`
    ByteVecOpen,
    /// `.` in list position
    Dot,
    /// `'`
    Quote,
    /// `` ` ``
    Quasiquote,
    /// `,`
    Unquote,
    /// `,@`
    UnquoteSplicing,
    /// `#'`
    Syntax,
    /// `` #` ``
    Quasisyntax,
    /// `#,`
    Unsyntax,
    /// `#,@`
    UnsyntaxSplicing,
    /// `#t` / `#f`
    Bool(bool),
    /// `#\...`
    Char(char),
    /// Exact integer literal
    Fixnum(i64),
    /// Inexact literal
    Flonum(f64),
    /// String literal (contents, unescaped)
    String(String),
    /// Symbol
    Symbol(String),
    /// `#N=`
    LabelDef(u32),
    /// `#N#`
    LabelRef(u32),
    /// `#;`
    DatumComment,
    /// End of input
    Eof,
}

/// Reader failure, converted to a `read` exception at the public
/// entry point.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadError {
    /// Input ended inside a datum.
    UnexpectedEof,
    /// A character that cannot start a datum.
    UnexpectedChar(char),
    /// `)` with no open list.
    UnmatchedClose,
    /// `.` outside the tail position of a list.
    MisplacedDot,
    /// Unknown string escape.
    BadEscape(char),
    /// Unknown character name after `#\`.
    BadCharName(String),
    /// Malformed numeric literal.
    BadNumber(String),
    /// Numerically valid but outside the supported tower.
    UnsupportedNumber(String),
    /// `#N#` with no `#N=` in the same datum.
    UndefinedLabel(u32),
    /// Heap exhausted while building the datum.
    OutOfMemory,
    /// The underlying port failed.
    Port(PortError),
}

impl core::fmt::Display for ReadError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of input"),
            Self::UnexpectedChar(c) => write!(f, "unexpected character: {c:?}"),
            Self::UnmatchedClose => write!(f, "unmatched )"),
            Self::MisplacedDot => write!(f, "misplaced dot"),
            Self::BadEscape(c) => write!(f, "invalid escape sequence: \\{c}"),
            Self::BadCharName(name) => write!(f, "unknown character name: {name}"),
            Self::BadNumber(s) => write!(f, "invalid number: {s}"),
            Self::UnsupportedNumber(s) => {
                write!(f, "number outside the supported tower: {s}")
            }
            Self::UndefinedLabel(n) => write!(f, "reference to undefined label #{n}#"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::Port(e) => write!(f, "{e}"),
        }
    }
}

impl From<PortError> for ReadError {
    fn from(e: PortError) -> Self {
        Self::Port(e)
    }
}

/// Characters that terminate an atom.
fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | '"' | ';' | '\'' | '`' | ',' | '|')
}

/// Lexer state over one port.
pub struct Lexer {
    port: Value,
}

impl Lexer {
    /// Create a lexer reading from a port value.
    #[must_use]
    pub const fn new(port: Value) -> Self {
        Self { port }
    }

    /// The port this lexer reads from.
    #[must_use]
    pub const fn port(&self) -> Value {
        self.port
    }

    fn port_ref(&self) -> Option<ObjRef> {
        let Value::Port(r) = self.port else {
            return None;
        };
        Some(r)
    }

    fn getc(&self, realm: &mut Realm) -> Result<Option<char>, ReadError> {
        let Some(r) = self.port_ref() else {
            return Err(ReadError::Port(PortError::Closed));
        };
        match &mut realm.heap.get_mut(r).kind {
            ObjKind::Port(p) => p.read_char().map_err(ReadError::Port),
            _ => Err(ReadError::Port(PortError::Closed)),
        }
    }

    fn peekc(&self, realm: &mut Realm) -> Result<Option<char>, ReadError> {
        let Some(r) = self.port_ref() else {
            return Err(ReadError::Port(PortError::Closed));
        };
        match &mut realm.heap.get_mut(r).kind {
            ObjKind::Port(p) => p.peek_char().map_err(ReadError::Port),
            _ => Err(ReadError::Port(PortError::Closed)),
        }
    }

    /// Whether symbols read from this port fold case.
    #[must_use]
    pub fn fold_case(&self, realm: &Realm) -> bool {
        self.port_ref().is_some_and(|r| match &realm.heap.get(r).kind {
            ObjKind::Port(p) => p.fold_case(),
            _ => false,
        })
    }

    fn set_fold_case(&self, realm: &mut Realm, fold: bool) {
        if let Some(r) = self.port_ref()
            && let ObjKind::Port(p) = &mut realm.heap.get_mut(r).kind
        {
            if fold {
                p.flags.insert(crate::port::PortFlags::FOLD_CASE);
            } else {
                p.flags.remove(crate::port::PortFlags::FOLD_CASE);
            }
        }
    }

    /// Current line of the underlying port.
    #[must_use]
    pub fn line(&self, realm: &Realm) -> u32 {
        self.port_ref().map_or(1, |r| match &realm.heap.get(r).kind {
            ObjKind::Port(p) => p.line,
            _ => 1,
        })
    }

    /// Produce the next token.
    ///
    /// # Errors
    ///
    /// Returns [`ReadError`] on malformed input or a failing port.
    pub fn next_token(&mut self, realm: &mut Realm) -> Result<Token, ReadError> {
        loop {
            self.skip_atmosphere(realm)?;
            let Some(c) = self.getc(realm)? else {
                return Ok(Token::Eof);
            };
            return match c {
                '(' => Ok(Token::LParen),
                ')' => Ok(Token::RParen),
                '\'' => Ok(Token::Quote),
                '`' => Ok(Token::Quasiquote),
                ',' => {
                    if self.peekc(realm)? == Some('@') {
                        self.getc(realm)?;
                        Ok(Token::UnquoteSplicing)
                    } else {
                        Ok(Token::Unquote)
                    }
                }
                '"' => self.lex_string(realm),
                '|' => self.lex_pipe_symbol(realm),
                '#' => {
                    let token = self.lex_hash(realm)?;
                    match token {
                        Some(token) => Ok(token),
                        // A #! directive was consumed; resume the scan.
                        None => continue,
                    }
                }
                '.' => {
                    match self.peekc(realm)? {
                        Some(c) if !is_delimiter(c) => self.lex_atom(realm, '.'),
                        _ => Ok(Token::Dot),
                    }
                }
                c => self.lex_atom(realm, c),
            };
        }
    }

    /// Skip whitespace, line comments, and nested block comments.
    fn skip_atmosphere(&mut self, realm: &mut Realm) -> Result<(), ReadError> {
        loop {
            match self.peekc(realm)? {
                Some(c) if c.is_whitespace() => {
                    self.getc(realm)?;
                }
                Some(';') => {
                    while let Some(c) = self.getc(realm)? {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Consume a nested `#| ... |#` block comment; the opening `#|`
    /// has been read.
    fn skip_block_comment(&mut self, realm: &mut Realm) -> Result<(), ReadError> {
        let mut depth = 1usize;
        while depth > 0 {
            let Some(c) = self.getc(realm)? else {
                return Err(ReadError::UnexpectedEof);
            };
            match c {
                '|' if self.peekc(realm)? == Some('#') => {
                    self.getc(realm)?;
                    depth -= 1;
                }
                '#' if self.peekc(realm)? == Some('|') => {
                    self.getc(realm)?;
                    depth += 1;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Lex after a consumed `#`. Returns `None` when a directive was
    /// consumed and scanning should restart.
    fn lex_hash(&mut self, realm: &mut Realm) -> Result<Option<Token>, ReadError> {
        let Some(c) = self.getc(realm)? else {
            return Err(ReadError::UnexpectedEof);
        };
        match c {
            '(' => Ok(Some(Token::VecOpen)),
            't' | 'T' | 'f' | 'F' => {
                let mut word = String::from(c);
                while let Some(next) = self.peekc(realm)? {
                    if is_delimiter(next) || next == '(' {
                        break;
                    }
                    self.getc(realm)?;
                    word.push(next);
                }
                match word.to_ascii_lowercase().as_str() {
                    "t" | "true" => Ok(Some(Token::Bool(true))),
                    "f" | "false" => Ok(Some(Token::Bool(false))),
                    _ => Err(ReadError::BadNumber(format!("#{word}"))),
                }
            }
            'u' | 'U' => {
                if self.getc(realm)? == Some('8') && self.getc(realm)? == Some('(') {
                    Ok(Some(Token::ByteVecOpen))
                } else {
                    Err(ReadError::UnexpectedChar('u'))
                }
            }
            '\\' => self.lex_char(realm).map(Some),
            '|' => {
                self.skip_block_comment(realm)?;
                Ok(None)
            }
            ';' => Ok(Some(Token::DatumComment)),
            '!' => {
                let mut word = String::new();
                while let Some(next) = self.peekc(realm)? {
                    if is_delimiter(next) {
                        break;
                    }
                    self.getc(realm)?;
                    word.push(next);
                }
                match word.as_str() {
                    "fold-case" => self.set_fold_case(realm, true),
                    "no-fold-case" => self.set_fold_case(realm, false),
                    // Unknown directives are ignored, matching the
                    // tolerant treatment of #!eof-style markers.
                    _ => {}
                }
                Ok(None)
            }
            '\'' => Ok(Some(Token::Syntax)),
            '`' => Ok(Some(Token::Quasisyntax)),
            ',' => {
                if self.peekc(realm)? == Some('@') {
                    self.getc(realm)?;
                    Ok(Some(Token::UnsyntaxSplicing))
                } else {
                    Ok(Some(Token::Unsyntax))
                }
            }
            '0'..='9' => {
                let mut n: u32 = c.to_digit(10).unwrap_or(0);
                loop {
                    match self.getc(realm)? {
                        Some(d) if d.is_ascii_digit() => {
                            n = n
                                .checked_mul(10)
                                .and_then(|n| n.checked_add(d.to_digit(10).unwrap_or(0)))
                                .ok_or_else(|| ReadError::BadNumber(format!("#{n}...")))?;
                        }
                        Some('=') => return Ok(Some(Token::LabelDef(n))),
                        Some('#') => return Ok(Some(Token::LabelRef(n))),
                        Some(c) => return Err(ReadError::UnexpectedChar(c)),
                        None => return Err(ReadError::UnexpectedEof),
                    }
                }
            }
            'b' | 'B' | 'o' | 'O' | 'd' | 'D' | 'x' | 'X' | 'e' | 'E' | 'i' | 'I' => {
                let mut atom = String::new();
                atom.push('#');
                atom.push(c);
                loop {
                    match self.peekc(realm)? {
                        Some(next) if !is_delimiter(next) => {
                            self.getc(realm)?;
                            atom.push(next);
                        }
                        _ => break,
                    }
                }
                parse_number(&atom).map(Some)
            }
            c => Err(ReadError::UnexpectedChar(c)),
        }
    }

    /// Lex a character literal; `#\` has been consumed.
    fn lex_char(&mut self, realm: &mut Realm) -> Result<Token, ReadError> {
        let Some(first) = self.getc(realm)? else {
            return Err(ReadError::UnexpectedEof);
        };
        if !first.is_alphanumeric() {
            return Ok(Token::Char(first));
        }
        let mut name = String::from(first);
        while let Some(next) = self.peekc(realm)? {
            if is_delimiter(next) {
                break;
            }
            self.getc(realm)?;
            name.push(next);
        }
        if name.chars().count() == 1 {
            return Ok(Token::Char(first));
        }
        let lowered = if self.fold_case(realm) {
            name.to_lowercase()
        } else {
            name.clone()
        };
        if let Some(hex) = lowered.strip_prefix('x')
            && let Ok(code) = u32::from_str_radix(hex, 16)
        {
            return char::from_u32(code)
                .map(Token::Char)
                .ok_or(ReadError::BadCharName(name));
        }
        let named = match lowered.as_str() {
            "space" => Some(' '),
            "newline" | "linefeed" => Some('\n'),
            "tab" => Some('\t'),
            "return" => Some('\r'),
            "null" | "nul" => Some('\0'),
            "alarm" => Some('\x07'),
            "backspace" => Some('\x08'),
            "delete" | "rubout" => Some('\x7f'),
            "escape" | "altmode" => Some('\x1b'),
            _ => None,
        };
        named.map(Token::Char).ok_or(ReadError::BadCharName(name))
    }

    /// Lex a string literal; the opening quote has been consumed.
    fn lex_string(&mut self, realm: &mut Realm) -> Result<Token, ReadError> {
        let mut s = String::new();
        loop {
            let Some(c) = self.getc(realm)? else {
                return Err(ReadError::UnexpectedEof);
            };
            match c {
                '"' => return Ok(Token::String(s)),
                '\\' => {
                    let Some(escaped) = self.getc(realm)? else {
                        return Err(ReadError::UnexpectedEof);
                    };
                    match escaped {
                        'n' => s.push('\n'),
                        't' => s.push('\t'),
                        'r' => s.push('\r'),
                        'a' => s.push('\x07'),
                        'b' => s.push('\x08'),
                        '0' => s.push('\0'),
                        '\\' => s.push('\\'),
                        '"' => s.push('"'),
                        'x' | 'X' => {
                            let mut hex = String::new();
                            loop {
                                match self.getc(realm)? {
                                    Some(';') => break,
                                    Some(d) if d.is_ascii_hexdigit() => hex.push(d),
                                    Some(d) => return Err(ReadError::BadEscape(d)),
                                    None => return Err(ReadError::UnexpectedEof),
                                }
                            }
                            let code = u32::from_str_radix(&hex, 16)
                                .map_err(|_| ReadError::BadEscape('x'))?;
                            s.push(char::from_u32(code).ok_or(ReadError::BadEscape('x'))?);
                        }
                        '\n' => {
                            // Line continuation: swallow leading
                            // whitespace on the next line.
                            while let Some(next) = self.peekc(realm)? {
                                if next == ' ' || next == '\t' {
                                    self.getc(realm)?;
                                } else {
                                    break;
                                }
                            }
                        }
                        c => return Err(ReadError::BadEscape(c)),
                    }
                }
                c => s.push(c),
            }
        }
    }

    /// Lex a `|...|` symbol; the opening pipe has been consumed.
    fn lex_pipe_symbol(&mut self, realm: &mut Realm) -> Result<Token, ReadError> {
        let mut s = String::new();
        loop {
            let Some(c) = self.getc(realm)? else {
                return Err(ReadError::UnexpectedEof);
            };
            match c {
                '|' => return Ok(Token::Symbol(s)),
                '\\' => {
                    let Some(escaped) = self.getc(realm)? else {
                        return Err(ReadError::UnexpectedEof);
                    };
                    match escaped {
                        'n' => s.push('\n'),
                        't' => s.push('\t'),
                        '\\' => s.push('\\'),
                        '|' => s.push('|'),
                        c => return Err(ReadError::BadEscape(c)),
                    }
                }
                c => s.push(c),
            }
        }
    }

    /// Lex an atom (number or symbol) starting with `first`.
    fn lex_atom(&mut self, realm: &mut Realm, first: char) -> Result<Token, ReadError> {
        let mut atom = String::from(first);
        while let Some(next) = self.peekc(realm)? {
            if is_delimiter(next) {
                break;
            }
            self.getc(realm)?;
            atom.push(next);
        }
        match parse_number(&atom) {
            Ok(token) => Ok(token),
            Err(ReadError::BadNumber(_)) if !starts_numeric(&atom) => {
                let name = if self.fold_case(realm) {
                    atom.to_lowercase()
                } else {
                    atom
                };
                Ok(Token::Symbol(name))
            }
            Err(e) => Err(e),
        }
    }
}

/// Whether an atom can only be a number (so a parse failure is an
/// error rather than a symbol).
fn starts_numeric(atom: &str) -> bool {
    let mut chars = atom.chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() => true,
        Some('+' | '-' | '.') => chars.next().is_some_and(|c| c.is_ascii_digit()),
        Some('#') => true,
        _ => false,
    }
}

/// Parse a numeric literal, honoring `#b`/`#o`/`#d`/`#x` radix and
/// `#e`/`#i` exactness prefixes in any order.
///
/// # Errors
///
/// [`ReadError::BadNumber`] when the text is not a number;
/// [`ReadError::UnsupportedNumber`] for complex literals and exact
/// non-integers, which belong to the external tower.
pub fn parse_number(atom: &str) -> Result<Token, ReadError> {
    let mut radix: Option<u32> = None;
    let mut exactness: Option<bool> = None; // Some(true) = exact
    let mut rest = atom;

    while let Some(tail) = rest.strip_prefix('#') {
        let mut chars = tail.chars();
        let Some(marker) = chars.next() else {
            return Err(ReadError::BadNumber(atom.to_string()));
        };
        match marker.to_ascii_lowercase() {
            'b' => radix = Some(2),
            'o' => radix = Some(8),
            'd' => radix = Some(10),
            'x' => radix = Some(16),
            'e' => exactness = Some(true),
            'i' => exactness = Some(false),
            _ => return Err(ReadError::BadNumber(atom.to_string())),
        }
        rest = chars.as_str();
    }
    let radix = radix.unwrap_or(10);

    if rest.is_empty() {
        return Err(ReadError::BadNumber(atom.to_string()));
    }

    // Specials first.
    match rest {
        "+inf.0" => return Ok(Token::Flonum(f64::INFINITY)),
        "-inf.0" => return Ok(Token::Flonum(f64::NEG_INFINITY)),
        "+nan.0" | "-nan.0" => return Ok(Token::Flonum(f64::NAN)),
        _ => {}
    }

    // Complex literals are lexically valid but outside the supported
    // tower.
    if rest.ends_with('i') || rest.ends_with('I') {
        let body = &rest[..rest.len() - 1];
        if body
            .chars()
            .all(|c| c.is_ascii_hexdigit() || matches!(c, '+' | '-' | '.' | '/' | 'e' | 'E'))
            && body.chars().any(|c| c.is_ascii_digit())
        {
            return Err(ReadError::UnsupportedNumber(atom.to_string()));
        }
    }

    // Rational N/M.
    if let Some((num, den)) = rest.split_once('/') {
        let n = i64::from_str_radix(num, radix)
            .map_err(|_| ReadError::BadNumber(atom.to_string()))?;
        let d = i64::from_str_radix(den, radix)
            .map_err(|_| ReadError::BadNumber(atom.to_string()))?;
        if d == 0 {
            return Err(ReadError::BadNumber(atom.to_string()));
        }
        if n % d == 0 {
            return Ok(Token::Fixnum(n / d));
        }
        if exactness == Some(true) {
            return Err(ReadError::UnsupportedNumber(atom.to_string()));
        }
        return Ok(Token::Flonum(n as f64 / d as f64));
    }

    // Integer in the requested radix.
    if let Ok(n) = i64::from_str_radix(rest, radix) {
        return Ok(match exactness {
            Some(false) => Token::Flonum(n as f64),
            _ => Token::Fixnum(n),
        });
    }

    // Decimal notation is radix 10 only. The shape is validated first
    // because the host float parser also accepts words like "inf".
    let decimal_shape = rest
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E'))
        && rest.chars().any(|c| c.is_ascii_digit());
    if radix == 10 && decimal_shape && let Ok(f) = rest.parse::<f64>() {
        if exactness == Some(true) {
            if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                return Ok(Token::Fixnum(f as i64));
            }
            return Err(ReadError::UnsupportedNumber(atom.to_string()));
        }
        return Ok(Token::Flonum(f));
    }

    Err(ReadError::BadNumber(atom.to_string()))
}
