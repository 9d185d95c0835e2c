// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Printer for Vesper values.
//!
//! `Display` mode writes human-readable output; `Write` mode writes
//! machine-readable output that the reader can round-trip, labelling
//! cyclic structure with `#N=`/`#N#`; `WriteShared` additionally
//! labels all shared (not just cyclic) structure.

use std::collections::{HashMap, HashSet};

use crate::heap::Heap;
use crate::types::{ObjRef, TypeRegistry};

use super::Value;
use super::object::ObjKind;

/// Output style.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// Human-readable: strings and characters print raw.
    Display,
    /// Machine-readable: escapes applied, cycles labelled.
    Write,
    /// Machine-readable with labels on every shared object.
    WriteShared,
}

/// Render a value to a string.
#[must_use]
pub fn write_value(heap: &Heap, types: &TypeRegistry, v: Value, mode: WriteMode) -> String {
    let labels = match mode {
        WriteMode::Display | WriteMode::Write => find_labels(heap, v, false),
        WriteMode::WriteShared => find_labels(heap, v, true),
    };
    let mut printer = Printer {
        heap,
        types,
        mode,
        labels,
        emitted: HashMap::new(),
        next_label: 0,
        out: String::new(),
    };
    printer.emit(v);
    printer.out
}

/// Escape a string the way `write` renders string literals,
/// surrounding quotes included.
#[must_use]
pub fn write_string_repr(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            c if c.is_control() => {
                out.push_str(&format!("\\x{:x};", u32::from(c)));
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Render a flonum so the reader recovers the same value.
#[must_use]
pub fn format_flonum(f: f64) -> String {
    if f.is_nan() {
        return "+nan.0".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "+inf.0" } else { "-inf.0" }.to_string();
    }
    let s = format!("{f:?}");
    if s.contains('.') || s.contains('e') || s.contains('E') {
        s
    } else {
        format!("{s}.0")
    }
}

/// Objects that need `#N=` labels: every object on a cycle, or every
/// object reached more than once when `label_all` is set.
fn find_labels(heap: &Heap, root: Value, label_all: bool) -> HashSet<ObjRef> {
    let mut counts: HashMap<ObjRef, u32> = HashMap::new();
    let mut cyclic: HashSet<ObjRef> = HashSet::new();
    let mut path: HashSet<ObjRef> = HashSet::new();

    // Iterative DFS with an explicit enter/leave stack so deep lists
    // cannot exhaust the native stack.
    enum Walk {
        Enter(Value),
        Leave(ObjRef),
    }
    let mut stack = vec![Walk::Enter(root)];
    while let Some(item) = stack.pop() {
        match item {
            Walk::Enter(v) => {
                let Some(r) = v.heap_ref() else { continue };
                if !traversable(heap, r) {
                    continue;
                }
                let count = counts.entry(r).or_insert(0);
                *count += 1;
                if *count > 1 {
                    if path.contains(&r) {
                        cyclic.insert(r);
                    }
                    continue;
                }
                path.insert(r);
                stack.push(Walk::Leave(r));
                match &heap.get(r).kind {
                    ObjKind::Pair(p) => {
                        stack.push(Walk::Enter(p.cdr));
                        stack.push(Walk::Enter(p.car));
                    }
                    ObjKind::Vector(elems) => {
                        for &e in elems.iter().rev() {
                            stack.push(Walk::Enter(e));
                        }
                    }
                    _ => {}
                }
            }
            Walk::Leave(r) => {
                path.remove(&r);
            }
        }
    }

    counts
        .into_iter()
        .filter(|&(r, count)| cyclic.contains(&r) || (label_all && count > 1))
        .map(|(r, _)| r)
        .collect()
}

fn traversable(heap: &Heap, r: ObjRef) -> bool {
    matches!(heap.get(r).kind, ObjKind::Pair(_) | ObjKind::Vector(_))
}

struct Printer<'a> {
    heap: &'a Heap,
    types: &'a TypeRegistry,
    mode: WriteMode,
    labels: HashSet<ObjRef>,
    emitted: HashMap<ObjRef, u32>,
    next_label: u32,
    out: String,
}

impl Printer<'_> {
    fn emit(&mut self, v: Value) {
        match v {
            Value::Fixnum(n) => self.out.push_str(&n.to_string()),
            Value::Char(c) => self.emit_char(c),
            Value::Cursor(offset) => {
                self.out.push_str(&format!("#<string-cursor {offset}>"));
            }
            Value::ReaderLabel(n) => self.out.push_str(&format!("#<reader-label {n}>")),
            Value::Null => self.out.push_str("()"),
            Value::True => self.out.push_str("#t"),
            Value::False => self.out.push_str("#f"),
            Value::Eof => self.out.push_str("#<eof>"),
            Value::Void => self.out.push_str("#<void>"),
            Value::Undefined => self.out.push_str("#<undef>"),
            Value::Type(id) => {
                let name = self.types.get(id).map_or("?", |d| d.name.as_str());
                self.out.push_str(&format!("#<type {name}>"));
            }
            Value::Context(id) => self.out.push_str(&format!("#<context {}>", id.index())),
            Value::Pair(r) => self.emit_labeled(r, Self::emit_list),
            Value::Vector(r) => self.emit_labeled(r, Self::emit_vector),
            Value::Bytes(_) => self.emit_bytes(v),
            Value::String(_) => self.emit_string(v),
            Value::Symbol(_) => {
                let name = self.heap.symbol_name(v).unwrap_or("?");
                self.out.push_str(name);
            }
            Value::Flonum(_) => {
                let f = self.heap.flonum(v).unwrap_or(f64::NAN);
                self.out.push_str(&format_flonum(f));
            }
            Value::Port(r) => {
                let name = match &self.heap.get(r).kind {
                    ObjKind::Port(p) => p.name.clone(),
                    _ => String::from("?"),
                };
                self.out.push_str(&format!("#<port {name}>"));
            }
            Value::Exception(r) => self.emit_exception(r),
            Value::Procedure(r) => {
                let name = self.procedure_name(r);
                self.out.push_str(&format!("#<procedure {name}>"));
            }
            Value::Bytecode(_) => self.out.push_str("#<bytecode>"),
            Value::Env(_) => self.out.push_str("#<environment>"),
            Value::Macro(_) => self.out.push_str("#<macro>"),
            Value::Synclo(_) => self.out.push_str("#<syntactic-closure>"),
            Value::Record(r) => self.emit_record(r),
            Value::CPointer(_) => self.out.push_str("#<cpointer>"),
            Value::Promise(_) => self.out.push_str("#<promise>"),
            Value::Ephemeron(_) => self.out.push_str("#<ephemeron>"),
            Value::Continuation(_) => self.out.push_str("#<continuation>"),
            Value::Parameter(_) => self.out.push_str("#<parameter>"),
        }
    }

    fn emit_labeled(&mut self, r: ObjRef, body: fn(&mut Self, ObjRef)) {
        if let Some(&label) = self.emitted.get(&r) {
            self.out.push_str(&format!("#{label}#"));
            return;
        }
        if self.labels.contains(&r) {
            let label = self.next_label;
            self.next_label += 1;
            self.emitted.insert(r, label);
            self.out.push_str(&format!("#{label}="));
        }
        body(self, r);
    }

    fn emit_list(&mut self, r: ObjRef) {
        self.out.push('(');
        let mut cur = Value::Pair(r);
        let mut first = true;
        loop {
            let Some(pair) = self.heap.pair(cur) else {
                break;
            };
            let (car, cdr) = (pair.car, pair.cdr);
            if !first {
                self.out.push(' ');
            }
            first = false;
            self.emit(car);
            match cdr {
                Value::Null => break,
                Value::Pair(next) => {
                    // A labelled tail must print as a dotted
                    // reference, not flattened into the list.
                    if self.emitted.contains_key(&next) || self.labels.contains(&next) {
                        self.out.push_str(" . ");
                        self.emit(cdr);
                        break;
                    }
                    cur = cdr;
                }
                _ => {
                    self.out.push_str(" . ");
                    self.emit(cdr);
                    break;
                }
            }
        }
        self.out.push(')');
    }

    fn emit_vector(&mut self, r: ObjRef) {
        self.out.push_str("#(");
        let elems = match &self.heap.get(r).kind {
            ObjKind::Vector(elems) => elems.clone(),
            _ => Vec::new(),
        };
        for (i, e) in elems.iter().enumerate() {
            if i > 0 {
                self.out.push(' ');
            }
            self.emit(*e);
        }
        self.out.push(')');
    }

    fn emit_bytes(&mut self, v: Value) {
        self.out.push_str("#u8(");
        if let Some(data) = self.heap.bytes(v) {
            let rendered: Vec<String> = data.iter().map(u8::to_string).collect();
            self.out.push_str(&rendered.join(" "));
        }
        self.out.push(')');
    }

    fn emit_string(&mut self, v: Value) {
        let Some(data) = self.heap.string(v) else {
            self.out.push_str("\"\"");
            return;
        };
        if self.mode == WriteMode::Display {
            self.out.push_str(data.as_str());
        } else {
            let repr = write_string_repr(data.as_str());
            self.out.push_str(&repr);
        }
    }

    fn emit_char(&mut self, c: char) {
        if self.mode == WriteMode::Display {
            self.out.push(c);
            return;
        }
        let name = match c {
            ' ' => Some("space"),
            '\n' => Some("newline"),
            '\t' => Some("tab"),
            '\r' => Some("return"),
            '\0' => Some("null"),
            '\x07' => Some("alarm"),
            '\x08' => Some("backspace"),
            '\x7f' => Some("delete"),
            '\x1b' => Some("escape"),
            _ => None,
        };
        match name {
            Some(name) => self.out.push_str(&format!("#\\{name}")),
            None if c.is_control() => {
                self.out.push_str(&format!("#\\x{:x}", u32::from(c)));
            }
            None => self.out.push_str(&format!("#\\{c}")),
        }
    }

    fn emit_exception(&mut self, r: ObjRef) {
        let (kind, message) = match &self.heap.get(r).kind {
            ObjKind::Exception(e) => (e.kind, e.message),
            _ => (Value::False, Value::False),
        };
        let kind = self.heap.symbol_name(kind).unwrap_or("?").to_string();
        let message = self
            .heap
            .string(message)
            .map_or(String::new(), |s| s.as_str().to_string());
        self.out.push_str(&format!("#<exception {kind}: {message}>"));
    }

    fn emit_record(&mut self, r: ObjRef) {
        let type_id = self.heap.get(r).header.type_id;
        let name = self
            .types
            .get(type_id)
            .map_or("record", |d| d.name.as_str())
            .to_string();
        self.out.push_str(&format!("#<{name}>"));
    }

    fn procedure_name(&self, r: ObjRef) -> String {
        let ObjKind::Procedure(pd) = &self.heap.get(r).kind else {
            return String::from("?");
        };
        let Value::Bytecode(code) = pd.code else {
            return String::from("?");
        };
        let name = match &self.heap.get(code).kind {
            ObjKind::Bytecode(bc) => bc.name,
            _ => Value::False,
        };
        self.heap
            .symbol_name(name)
            .map_or_else(|| String::from("anonymous"), ToString::to_string)
    }
}
