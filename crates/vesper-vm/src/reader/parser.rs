// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Parser for Vesper source text.
//!
//! Converts a token stream into runtime values. Partially built
//! structures are kept on the context's saved-root stack so a
//! collection triggered by any allocation sees them. Datum labels are
//! patched by a final pass over the finished datum.

use std::collections::HashMap;

use crate::realm::{GlobalSlot, OutOfMemory, Realm};
use crate::types::{CtxId, ObjRef};
use crate::value::Value;
use crate::value::object::ObjKind;

use super::lexer::{Lexer, ReadError, Token};

/// Parser state for one read.
pub struct Parser {
    lexer: Lexer,
    /// Datum labels: `None` while the defining datum is still being
    /// parsed, `Some` once complete.
    labels: HashMap<u32, Option<Value>>,
}

impl Parser {
    /// Create a parser reading from a port value.
    #[must_use]
    pub fn new(port: Value) -> Self {
        Self {
            lexer: Lexer::new(port),
            labels: HashMap::new(),
        }
    }

    /// Read one datum. Returns `Value::Eof` at end of input.
    ///
    /// # Errors
    ///
    /// Returns [`ReadError`] on malformed input.
    pub fn read_datum(&mut self, realm: &mut Realm, ctx: CtxId) -> Result<Value, ReadError> {
        let token = self.lexer.next_token(realm)?;
        if token == Token::Eof {
            return Ok(Value::Eof);
        }
        let datum = self.parse(realm, ctx, token)?;
        self.patch_labels(realm, datum)
    }

    /// Parse the next datum, skipping `#;` comments. Errors at end of
    /// input.
    fn parse_next(&mut self, realm: &mut Realm, ctx: CtxId) -> Result<Value, ReadError> {
        loop {
            let token = self.lexer.next_token(realm)?;
            match token {
                Token::Eof => return Err(ReadError::UnexpectedEof),
                Token::DatumComment => {
                    self.parse_next(realm, ctx)?;
                }
                token => return self.parse(realm, ctx, token),
            }
        }
    }

    fn parse(&mut self, realm: &mut Realm, ctx: CtxId, token: Token) -> Result<Value, ReadError> {
        match token {
            Token::Eof => Err(ReadError::UnexpectedEof),
            Token::Fixnum(n) => Ok(Value::Fixnum(n)),
            Token::Flonum(f) => realm.make_flonum(ctx, f).map_err(oom),
            Token::Bool(b) => Ok(Value::bool(b)),
            Token::Char(c) => Ok(Value::Char(c)),
            Token::String(s) => realm.make_string(ctx, &s).map_err(oom),
            Token::Symbol(name) => realm.intern(ctx, &name).map_err(oom),
            Token::LParen => self.parse_list(realm, ctx),
            Token::VecOpen => self.parse_vector(realm, ctx),
            Token::ByteVecOpen => self.parse_bytevector(realm, ctx),
            Token::Quote => self.parse_wrapped(realm, ctx, GlobalSlot::QuoteSymbol),
            Token::Quasiquote => self.parse_wrapped(realm, ctx, GlobalSlot::QuasiquoteSymbol),
            Token::Unquote => self.parse_wrapped(realm, ctx, GlobalSlot::UnquoteSymbol),
            Token::UnquoteSplicing => {
                self.parse_wrapped(realm, ctx, GlobalSlot::UnquoteSplicingSymbol)
            }
            Token::Syntax => self.parse_wrapped(realm, ctx, GlobalSlot::SyntaxSymbol),
            Token::Quasisyntax => self.parse_wrapped(realm, ctx, GlobalSlot::QuasisyntaxSymbol),
            Token::Unsyntax => self.parse_wrapped(realm, ctx, GlobalSlot::UnsyntaxSymbol),
            Token::UnsyntaxSplicing => {
                self.parse_wrapped(realm, ctx, GlobalSlot::UnsyntaxSplicingSymbol)
            }
            Token::RParen => Err(ReadError::UnmatchedClose),
            Token::Dot => Err(ReadError::MisplacedDot),
            Token::LabelDef(n) => {
                self.labels.insert(n, None);
                let datum = self.parse_next(realm, ctx)?;
                self.labels.insert(n, Some(datum));
                Ok(datum)
            }
            Token::LabelRef(n) => match self.labels.get(&n) {
                Some(Some(v)) => Ok(*v),
                // Inside the defining datum, or a forward reference:
                // leave a placeholder for the patch pass.
                _ => Ok(Value::ReaderLabel(n)),
            },
            Token::DatumComment => {
                self.parse_next(realm, ctx)?;
                self.parse_next(realm, ctx)
            }
        }
    }

    fn parse_wrapped(
        &mut self,
        realm: &mut Realm,
        ctx: CtxId,
        slot: GlobalSlot,
    ) -> Result<Value, ReadError> {
        let datum = self.parse_next(realm, ctx)?;
        let sym = realm.global(slot);
        realm.list2(ctx, sym, datum).map_err(oom)
    }

    fn parse_list(&mut self, realm: &mut Realm, ctx: CtxId) -> Result<Value, ReadError> {
        let depth = realm.ctx(ctx).root_depth();
        let result = self.parse_list_inner(realm, ctx, depth);
        realm.ctx_mut(ctx).release_to(depth);
        result
    }

    fn parse_list_inner(
        &mut self,
        realm: &mut Realm,
        ctx: CtxId,
        depth: usize,
    ) -> Result<Value, ReadError> {
        loop {
            let token = self.lexer.next_token(realm)?;
            match token {
                Token::Eof => return Err(ReadError::UnexpectedEof),
                Token::RParen => {
                    let elems = realm.ctx(ctx).saved_roots()[depth..].to_vec();
                    return realm.list(ctx, &elems).map_err(oom);
                }
                Token::Dot => {
                    if realm.ctx(ctx).root_depth() == depth {
                        return Err(ReadError::MisplacedDot);
                    }
                    let tail = self.parse_next(realm, ctx)?;
                    if self.lexer.next_token(realm)? != Token::RParen {
                        return Err(ReadError::MisplacedDot);
                    }
                    let elems = realm.ctx(ctx).saved_roots()[depth..].to_vec();
                    return realm.list_star(ctx, &elems, tail).map_err(oom);
                }
                Token::DatumComment => {
                    self.parse_next(realm, ctx)?;
                }
                token => {
                    let elem = self.parse(realm, ctx, token)?;
                    realm.ctx_mut(ctx).preserve(elem);
                }
            }
        }
    }

    fn parse_vector(&mut self, realm: &mut Realm, ctx: CtxId) -> Result<Value, ReadError> {
        let depth = realm.ctx(ctx).root_depth();
        let result = self.parse_vector_inner(realm, ctx, depth);
        realm.ctx_mut(ctx).release_to(depth);
        result
    }

    fn parse_vector_inner(
        &mut self,
        realm: &mut Realm,
        ctx: CtxId,
        depth: usize,
    ) -> Result<Value, ReadError> {
        loop {
            let token = self.lexer.next_token(realm)?;
            match token {
                Token::Eof => return Err(ReadError::UnexpectedEof),
                Token::RParen => {
                    let elems = realm.ctx(ctx).saved_roots()[depth..].to_vec();
                    return realm.vector(ctx, &elems).map_err(oom);
                }
                Token::Dot => return Err(ReadError::MisplacedDot),
                Token::DatumComment => {
                    self.parse_next(realm, ctx)?;
                }
                token => {
                    let elem = self.parse(realm, ctx, token)?;
                    realm.ctx_mut(ctx).preserve(elem);
                }
            }
        }
    }

    fn parse_bytevector(&mut self, realm: &mut Realm, ctx: CtxId) -> Result<Value, ReadError> {
        let mut bytes = Vec::new();
        loop {
            let token = self.lexer.next_token(realm)?;
            match token {
                Token::Eof => return Err(ReadError::UnexpectedEof),
                Token::RParen => return realm.make_bytes(ctx, bytes).map_err(oom),
                Token::Fixnum(n) if (0..=255).contains(&n) => bytes.push(n as u8),
                Token::Fixnum(n) => return Err(ReadError::BadNumber(n.to_string())),
                Token::DatumComment => {
                    self.parse_next(realm, ctx)?;
                }
                _ => return Err(ReadError::BadNumber("bytevector element".to_string())),
            }
        }
    }

    /// Final fix-up pass: replace `ReaderLabel` placeholders with the
    /// labelled values, walking shared structure once.
    fn patch_labels(&mut self, realm: &mut Realm, root: Value) -> Result<Value, ReadError> {
        if self.labels.is_empty() {
            if let Value::ReaderLabel(n) = root {
                return Err(ReadError::UndefinedLabel(n));
            }
            return Ok(root);
        }

        let root = self.resolve(root)?;
        let mut visited: std::collections::HashSet<ObjRef> = std::collections::HashSet::new();
        let mut stack: Vec<ObjRef> = Vec::new();
        if let Some(r) = root.heap_ref() {
            stack.push(r);
        }
        while let Some(r) = stack.pop() {
            if !visited.insert(r) {
                continue;
            }
            // Patch in place, collecting children to visit.
            let mut children: Vec<Value> = Vec::new();
            match &mut realm.heap.get_mut(r).kind {
                ObjKind::Pair(pair) => {
                    children.push(pair.car);
                    children.push(pair.cdr);
                }
                ObjKind::Vector(elems) => children.extend_from_slice(elems),
                _ => {}
            }
            let mut resolved = Vec::with_capacity(children.len());
            for child in &children {
                resolved.push(self.resolve(*child)?);
            }
            match &mut realm.heap.get_mut(r).kind {
                ObjKind::Pair(pair) => {
                    pair.car = resolved[0];
                    pair.cdr = resolved[1];
                }
                ObjKind::Vector(elems) => elems.copy_from_slice(&resolved),
                _ => {}
            }
            for v in resolved {
                if let Some(child) = v.heap_ref() {
                    stack.push(child);
                }
            }
        }
        Ok(root)
    }

    /// Resolve a possibly labelled value, following label chains.
    fn resolve(&self, v: Value) -> Result<Value, ReadError> {
        let mut v = v;
        for _ in 0..=self.labels.len() {
            let Value::ReaderLabel(n) = v else {
                return Ok(v);
            };
            match self.labels.get(&n) {
                Some(Some(resolved)) => v = *resolved,
                _ => return Err(ReadError::UndefinedLabel(n)),
            }
        }
        // A label defined as itself never resolves.
        match v {
            Value::ReaderLabel(n) => Err(ReadError::UndefinedLabel(n)),
            v => Ok(v),
        }
    }
}

fn oom(_: OutOfMemory) -> ReadError {
    ReadError::OutOfMemory
}

/// Read one datum from a port value.
///
/// Returns `Ok(Value::Eof)` at end of input. Errors are first-class
/// `read` exceptions carrying the port, line, and message; the port
/// position is not rewound past the failure point.
///
/// # Errors
///
/// Returns the exception value describing the syntactic failure.
pub fn read(realm: &mut Realm, ctx: CtxId, port: Value) -> Result<Value, Value> {
    let depth = realm.ctx(ctx).root_depth();
    realm.ctx_mut(ctx).preserve(port);
    let mut parser = Parser::new(port);
    let result = parser.read_datum(realm, ctx);
    let line = parser_line(realm, port);
    realm.ctx_mut(ctx).release_to(depth);

    match result {
        Ok(v) => Ok(v),
        Err(ReadError::OutOfMemory) => Err(realm.global(GlobalSlot::OomError)),
        Err(e) => Err(read_exception(realm, ctx, port, line, &e)),
    }
}

/// Read one datum from a string.
///
/// # Errors
///
/// Returns the exception value describing the syntactic failure.
pub fn read_str(realm: &mut Realm, ctx: CtxId, input: &str) -> Result<Value, Value> {
    let port = crate::port::PortData::string_input("string", input);
    let port = realm
        .make_port(ctx, port)
        .map_err(|_| realm.global(GlobalSlot::OomError))?;
    read(realm, ctx, port)
}

fn parser_line(realm: &Realm, port: Value) -> u32 {
    let Value::Port(r) = port else { return 1 };
    match &realm.heap.get(r).kind {
        ObjKind::Port(p) => p.line,
        _ => 1,
    }
}

fn read_exception(realm: &mut Realm, ctx: CtxId, port: Value, line: u32, e: &ReadError) -> Value {
    let depth = realm.ctx(ctx).root_depth();
    realm.ctx_mut(ctx).preserve(port);
    let exn = (|| {
        let name = {
            let Value::Port(r) = port else {
                return realm.make_exception_simple(ctx, "read", &e.to_string());
            };
            match &realm.heap.get(r).kind {
                ObjKind::Port(p) => p.name.clone(),
                _ => String::from("?"),
            }
        };
        let name_str = realm.make_string(ctx, &name)?;
        let source = realm.cons(ctx, name_str, Value::Fixnum(i64::from(line)))?;
        let irritants = realm.list(ctx, &[port])?;
        let depth2 = realm.ctx(ctx).root_depth();
        realm.ctx_mut(ctx).preserve(source);
        realm.ctx_mut(ctx).preserve(irritants);
        let result = realm.make_exception(
            ctx,
            "read",
            &e.to_string(),
            irritants,
            Value::False,
            source,
        );
        realm.ctx_mut(ctx).release_to(depth2);
        result
    })();
    realm.ctx_mut(ctx).release_to(depth);
    exn.unwrap_or_else(|_| realm.global(GlobalSlot::OomError))
}
