// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! The realm: shared machine state for one runtime instance.
//!
//! A realm owns the heap, the globals table, the symbol table, the
//! type registry, the context table, the host preservation table, the
//! primitive table, and the scheduler. Every allocation routes through
//! the realm so the collect-then-grow policy and root discipline sit
//! in one place: on allocation failure the realm collects and retries;
//! on a second failure it grows the heap; if growth is refused the
//! caller receives [`OutOfMemory`] and surfaces the pre-allocated
//! out-of-memory exception.

#[cfg(test)]
mod realm_test;

use std::collections::HashMap;

use crate::bytecode::BytecodeData;
use crate::config::Config;
use crate::context::{Context, ContextTable};
use crate::heap::gc::{RootSet, SweepStats, collect};
use crate::heap::{Heap, HeapConfig};
use crate::port::{PortData, PortFlags};
use crate::sched::Scheduler;
use crate::types::{CtxId, ObjRef, TypeId, TypeRegistry};
use crate::value::object::{
    CPointerData, EnvData, EphemeronData, ExceptionData, MacroData, Obj, ObjKind, PairData,
    ParameterData, ProcFlags, ProcedureData, PromiseData, RecordData, StringData, SyncloData,
};
use crate::value::Value;

/// Allocation failed even after collecting and growing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;

/// Well-known globals table slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum GlobalSlot {
    /// Current exception handler procedure, or `#f`.
    ExceptionHandler = 0,
    /// Pre-allocated out-of-memory exception.
    OomError,
    /// Pre-allocated out-of-stack exception.
    StackOverflowError,
    /// Top-level environment object.
    GlobalEnv,
    /// Module search path (list of strings) for the external loader.
    ModulePath,
    /// Current input port.
    CurrentInput,
    /// Current output port.
    CurrentOutput,
    /// Current error port.
    CurrentError,
    /// Signal runner context value, or `#f`.
    SignalRunner,
    /// `quote` symbol.
    QuoteSymbol,
    /// `quasiquote` symbol.
    QuasiquoteSymbol,
    /// `unquote` symbol.
    UnquoteSymbol,
    /// `unquote-splicing` symbol.
    UnquoteSplicingSymbol,
    /// `syntax` symbol.
    SyntaxSymbol,
    /// `quasisyntax` symbol.
    QuasisyntaxSymbol,
    /// `unsyntax` symbol.
    UnsyntaxSymbol,
    /// `unsyntax-splicing` symbol.
    UnsyntaxSplicingSymbol,
}

impl GlobalSlot {
    /// Number of globals table slots.
    pub const COUNT: usize = Self::UnsyntaxSplicingSymbol as usize + 1;
}

/// A registered foreign primitive.
#[derive(Clone, Copy)]
pub struct Primitive {
    /// Name for traces and errors.
    pub name: &'static str,
    /// Required argument count.
    pub arity: u8,
    /// Whether extra arguments are accepted.
    pub variadic: bool,
    /// The implementation.
    pub func: PrimFn,
}

/// Result of a foreign primitive call.
pub enum PrimResult {
    /// Push this result and continue.
    Value(Value),
    /// Raise this exception. A trampoline exception instead bounces
    /// the packaged `(procedure . args)` call through the interpreter.
    Raise(Value),
    /// Suspend the calling context for a duration (the call's value
    /// is unspecified).
    Sleep(std::time::Duration),
}

/// Signature of a foreign primitive.
pub type PrimFn = fn(&mut Realm, CtxId, &[Value]) -> PrimResult;

/// One runtime instance.
pub struct Realm {
    /// The object heap.
    pub heap: Heap,
    /// Globals table, indexed by [`GlobalSlot`].
    globals: Vec<Value>,
    /// Symbol intern table.
    pub(crate) symbols: HashMap<Box<str>, Value>,
    /// Runtime type registry.
    pub types: TypeRegistry,
    /// Live contexts.
    pub contexts: ContextTable,
    /// Host preservation table: object → refcount.
    preserved: HashMap<ObjRef, usize>,
    /// Registered foreign primitives.
    pub(crate) primitives: Vec<Primitive>,
    /// Green-thread scheduler state.
    pub sched: Scheduler,
    /// Environment-derived configuration.
    pub config: Config,
}

impl Realm {
    /// Create a realm with the given heap sizing, a root context, the
    /// standard ports, and the core primitives installed.
    #[must_use]
    pub fn new(heap_config: HeapConfig) -> Self {
        let mut realm = Self {
            heap: Heap::new(heap_config),
            globals: vec![Value::Void; GlobalSlot::COUNT],
            symbols: HashMap::new(),
            types: TypeRegistry::with_builtins(),
            contexts: ContextTable::new(),
            preserved: HashMap::new(),
            primitives: Vec::new(),
            sched: Scheduler::new(),
            config: Config::from_env(),
        };
        let root = realm.contexts.create();
        realm.bootstrap(root);
        realm
    }

    /// Create a realm with default sizing.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(HeapConfig::default())
    }

    /// The root context created at realm construction.
    #[must_use]
    pub fn root_ctx(&self) -> CtxId {
        CtxId::new(0)
    }

    fn bootstrap(&mut self, ctx: CtxId) {
        self.set_global(GlobalSlot::ExceptionHandler, Value::False);
        self.set_global(GlobalSlot::SignalRunner, Value::False);

        // Quote-family symbols, interned once for the reader.
        let quote_slots = [
            (GlobalSlot::QuoteSymbol, "quote"),
            (GlobalSlot::QuasiquoteSymbol, "quasiquote"),
            (GlobalSlot::UnquoteSymbol, "unquote"),
            (GlobalSlot::UnquoteSplicingSymbol, "unquote-splicing"),
            (GlobalSlot::SyntaxSymbol, "syntax"),
            (GlobalSlot::QuasisyntaxSymbol, "quasisyntax"),
            (GlobalSlot::UnsyntaxSymbol, "unsyntax"),
            (GlobalSlot::UnsyntaxSplicingSymbol, "unsyntax-splicing"),
        ];
        for (slot, name) in quote_slots {
            let sym = self.intern(ctx, name).unwrap_or(Value::Void);
            self.set_global(slot, sym);
        }

        // Pre-allocated fatal exceptions; never raised via an
        // allocating path.
        let oom = self
            .make_exception_simple(ctx, "out-of-memory", "out of memory")
            .unwrap_or(Value::Void);
        self.set_global(GlobalSlot::OomError, oom);
        let oos = self
            .make_exception_simple(ctx, "out-of-stack", "out of stack space")
            .unwrap_or(Value::Void);
        self.set_global(GlobalSlot::StackOverflowError, oos);

        // Top-level environment.
        let env = self
            .make_env(ctx, Value::False, Value::False)
            .unwrap_or(Value::Void);
        self.set_global(GlobalSlot::GlobalEnv, env);

        // Standard ports over the process's descriptors (not owned).
        let stdin = PortData::from_fd("stdin", 0, PortFlags::INPUT);
        let stdout = PortData::from_fd("stdout", 1, PortFlags::OUTPUT);
        let stderr = PortData::from_fd("stderr", 2, PortFlags::OUTPUT);
        let stdin = self.make_port(ctx, stdin).unwrap_or(Value::Void);
        let stdout = self.make_port(ctx, stdout).unwrap_or(Value::Void);
        let stderr = self.make_port(ctx, stderr).unwrap_or(Value::Void);
        self.set_global(GlobalSlot::CurrentInput, stdin);
        self.set_global(GlobalSlot::CurrentOutput, stdout);
        self.set_global(GlobalSlot::CurrentError, stderr);

        // Module search path for the external loader.
        let path = self.config.module_path.clone();
        let mut list = Value::Null;
        for dir in path.iter().rev() {
            let s = self
                .make_string(ctx, &dir.to_string_lossy())
                .unwrap_or(Value::Void);
            list = self.cons(ctx, s, list).unwrap_or(Value::Null);
        }
        self.set_global(GlobalSlot::ModulePath, list);

        crate::vm::primitives::install(self);
    }

    // --- Globals ---------------------------------------------------------

    /// Read a globals table slot.
    #[inline]
    #[must_use]
    pub fn global(&self, slot: GlobalSlot) -> Value {
        self.globals[slot as usize]
    }

    /// Write a globals table slot.
    #[inline]
    pub fn set_global(&mut self, slot: GlobalSlot, v: Value) {
        self.globals[slot as usize] = v;
    }

    // --- Collection ------------------------------------------------------

    /// Run one collection cycle.
    pub fn collect(&mut self) -> SweepStats {
        let Self {
            heap,
            globals,
            symbols,
            types,
            contexts,
            preserved,
            ..
        } = self;
        let roots = RootSet {
            globals: globals.as_slice(),
            contexts: &*contexts,
            preserved: &*preserved,
            symbols: &*symbols,
        };
        collect(heap, types, &roots)
    }

    // --- Host preservation table -----------------------------------------

    /// Add a value to the process-wide preservation table. Each call
    /// increments the object's refcount.
    pub fn preserve_object(&mut self, v: Value) {
        if let Some(r) = v.heap_ref() {
            *self.preserved.entry(r).or_insert(0) += 1;
        }
    }

    /// Drop one preservation refcount added by
    /// [`Realm::preserve_object`].
    pub fn release_object(&mut self, v: Value) {
        if let Some(r) = v.heap_ref()
            && let Some(count) = self.preserved.get_mut(&r)
        {
            *count -= 1;
            if *count == 0 {
                self.preserved.remove(&r);
            }
        }
    }

    // --- Allocation ------------------------------------------------------

    /// Allocate a heap object.
    ///
    /// `roots` must cover every heap value reachable from `kind` that
    /// is not otherwise rooted; they are registered on the context's
    /// saved-root stack for the duration of a potential collection.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the heap is exhausted, a cycle
    /// freed nothing, and growth was refused.
    pub fn alloc(
        &mut self,
        ctx: CtxId,
        roots: &[Value],
        kind: ObjKind,
    ) -> Result<ObjRef, OutOfMemory> {
        let kind = match self.heap.allocate(kind) {
            Ok(r) => return Ok(r),
            Err(kind) => kind,
        };

        let depth = self.contexts.get(ctx).root_depth();
        for &root in roots {
            self.contexts.get_mut(ctx).preserve(root);
        }
        self.collect();

        let kind = match self.heap.allocate(kind) {
            Ok(r) => {
                self.contexts.get_mut(ctx).release_to(depth);
                return Ok(r);
            }
            Err(kind) => kind,
        };

        let result = if self.heap.try_grow() {
            self.heap.allocate(kind).map_err(|_| OutOfMemory)
        } else {
            Err(OutOfMemory)
        };
        self.contexts.get_mut(ctx).release_to(depth);
        result
    }

    /// Allocate a pair.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the heap cannot satisfy the
    /// request.
    pub fn cons(&mut self, ctx: CtxId, car: Value, cdr: Value) -> Result<Value, OutOfMemory> {
        self.alloc(
            ctx,
            &[car, cdr],
            ObjKind::Pair(PairData {
                car,
                cdr,
                source: Value::False,
            }),
        )
        .map(Value::Pair)
    }

    /// Allocate a two-element list.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the heap cannot satisfy the
    /// request.
    pub fn list2(&mut self, ctx: CtxId, a: Value, b: Value) -> Result<Value, OutOfMemory> {
        let tail = self.cons(ctx, b, Value::Null)?;
        self.cons(ctx, a, tail)
    }

    /// Allocate a list from a slice, preserving order.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the heap cannot satisfy the
    /// request.
    pub fn list(&mut self, ctx: CtxId, elems: &[Value]) -> Result<Value, OutOfMemory> {
        let mut out = Value::Null;
        let depth = self.contexts.get(ctx).root_depth();
        for &e in elems {
            self.contexts.get_mut(ctx).preserve(e);
        }
        for &e in elems.iter().rev() {
            match self.cons(ctx, e, out) {
                Ok(v) => out = v,
                Err(e) => {
                    self.contexts.get_mut(ctx).release_to(depth);
                    return Err(e);
                }
            }
        }
        self.contexts.get_mut(ctx).release_to(depth);
        Ok(out)
    }

    /// Allocate an improper list `(e0 e1 ... . tail)`.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the heap cannot satisfy the
    /// request.
    pub fn list_star(
        &mut self,
        ctx: CtxId,
        elems: &[Value],
        tail: Value,
    ) -> Result<Value, OutOfMemory> {
        let mut out = tail;
        let depth = self.contexts.get(ctx).root_depth();
        for &e in elems {
            self.contexts.get_mut(ctx).preserve(e);
        }
        for &e in elems.iter().rev() {
            match self.cons(ctx, e, out) {
                Ok(v) => out = v,
                Err(e) => {
                    self.contexts.get_mut(ctx).release_to(depth);
                    return Err(e);
                }
            }
        }
        self.contexts.get_mut(ctx).release_to(depth);
        Ok(out)
    }

    /// Allocate a vector from a slice.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the heap cannot satisfy the
    /// request.
    pub fn vector(&mut self, ctx: CtxId, elems: &[Value]) -> Result<Value, OutOfMemory> {
        self.alloc(ctx, elems, ObjKind::Vector(elems.to_vec()))
            .map(Value::Vector)
    }

    /// Allocate a vector of `len` copies of `fill`.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the heap cannot satisfy the
    /// request.
    pub fn make_vector(
        &mut self,
        ctx: CtxId,
        len: usize,
        fill: Value,
    ) -> Result<Value, OutOfMemory> {
        self.alloc(ctx, &[fill], ObjKind::Vector(vec![fill; len]))
            .map(Value::Vector)
    }

    /// Allocate a string.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the heap cannot satisfy the
    /// request.
    pub fn make_string(&mut self, ctx: CtxId, s: &str) -> Result<Value, OutOfMemory> {
        self.alloc(ctx, &[], ObjKind::String(StringData::from_str(s)))
            .map(Value::String)
    }

    /// Allocate a bytevector.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the heap cannot satisfy the
    /// request.
    pub fn make_bytes(&mut self, ctx: CtxId, bytes: Vec<u8>) -> Result<Value, OutOfMemory> {
        self.alloc(ctx, &[], ObjKind::Bytes(bytes)).map(Value::Bytes)
    }

    /// Allocate a boxed flonum.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the heap cannot satisfy the
    /// request.
    pub fn make_flonum(&mut self, ctx: CtxId, f: f64) -> Result<Value, OutOfMemory> {
        self.alloc(ctx, &[], ObjKind::Flonum(f)).map(Value::Flonum)
    }

    /// Intern a symbol, returning the existing object for a known
    /// name.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the heap cannot satisfy the
    /// request.
    pub fn intern(&mut self, ctx: CtxId, name: &str) -> Result<Value, OutOfMemory> {
        if let Some(&sym) = self.symbols.get(name) {
            return Ok(sym);
        }
        let sym = self
            .alloc(ctx, &[], ObjKind::Symbol(name.into()))
            .map(Value::Symbol)?;
        self.symbols.insert(name.into(), sym);
        Ok(sym)
    }

    /// Allocate a port object.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the heap cannot satisfy the
    /// request.
    pub fn make_port(&mut self, ctx: CtxId, port: PortData) -> Result<Value, OutOfMemory> {
        self.alloc(ctx, &[], ObjKind::Port(port)).map(Value::Port)
    }

    /// Allocate a procedure.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the heap cannot satisfy the
    /// request.
    pub fn make_procedure(
        &mut self,
        ctx: CtxId,
        code: Value,
        vars: Value,
        flags: ProcFlags,
        num_args: u16,
    ) -> Result<Value, OutOfMemory> {
        self.alloc(
            ctx,
            &[code, vars],
            ObjKind::Procedure(ProcedureData {
                code,
                vars,
                flags,
                num_args,
            }),
        )
        .map(Value::Procedure)
    }

    /// Allocate a bytecode object.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the heap cannot satisfy the
    /// request.
    pub fn make_bytecode(&mut self, ctx: CtxId, data: BytecodeData) -> Result<Value, OutOfMemory> {
        let mut roots = vec![data.name];
        roots.extend_from_slice(&data.literals);
        roots.extend(data.source_map.iter().map(|&(_, src)| src));
        self.alloc(ctx, &roots, ObjKind::Bytecode(data))
            .map(Value::Bytecode)
    }

    /// Allocate a promise. A delayed promise holds its thunk; a
    /// resolved one holds its value.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the heap cannot satisfy the
    /// request.
    pub fn make_promise(
        &mut self,
        ctx: CtxId,
        done: bool,
        value: Value,
    ) -> Result<Value, OutOfMemory> {
        self.alloc(ctx, &[value], ObjKind::Promise(PromiseData { done, value }))
            .map(Value::Promise)
    }

    /// Allocate an ephemeron.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the heap cannot satisfy the
    /// request.
    pub fn make_ephemeron(
        &mut self,
        ctx: CtxId,
        key: Value,
        value: Value,
    ) -> Result<Value, OutOfMemory> {
        self.alloc(ctx, &[key, value], ObjKind::Ephemeron(EphemeronData { key, value }))
            .map(Value::Ephemeron)
    }

    /// Allocate a parameter object.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the heap cannot satisfy the
    /// request.
    pub fn make_parameter(
        &mut self,
        ctx: CtxId,
        value: Value,
        converter: Value,
    ) -> Result<Value, OutOfMemory> {
        self.alloc(
            ctx,
            &[value, converter],
            ObjKind::Parameter(ParameterData { value, converter }),
        )
        .map(Value::Parameter)
    }

    /// Allocate an environment with no bindings.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the heap cannot satisfy the
    /// request.
    pub fn make_env(
        &mut self,
        ctx: CtxId,
        parent: Value,
        lambda: Value,
    ) -> Result<Value, OutOfMemory> {
        self.alloc(
            ctx,
            &[parent, lambda],
            ObjKind::Env(EnvData {
                parent,
                lambda,
                bindings: Value::Null,
                renames: Value::False,
            }),
        )
        .map(Value::Env)
    }

    /// Allocate a macro binding for the expander.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the heap cannot satisfy the
    /// request.
    pub fn make_macro(
        &mut self,
        ctx: CtxId,
        procedure: Value,
        env: Value,
        source: Value,
    ) -> Result<Value, OutOfMemory> {
        self.alloc(
            ctx,
            &[procedure, env, source],
            ObjKind::Macro(MacroData {
                procedure,
                env,
                source,
            }),
        )
        .map(Value::Macro)
    }

    /// Allocate a syntactic closure.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the heap cannot satisfy the
    /// request.
    pub fn make_synclo(
        &mut self,
        ctx: CtxId,
        env: Value,
        free_vars: Value,
        expr: Value,
    ) -> Result<Value, OutOfMemory> {
        self.alloc(
            ctx,
            &[env, free_vars, expr],
            ObjKind::Synclo(SyncloData {
                env,
                free_vars,
                expr,
                rename: Value::False,
            }),
        )
        .map(Value::Synclo)
    }

    /// Allocate a foreign pointer. The destructor, if any, runs from
    /// the collector's finalizer queue.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the heap cannot satisfy the
    /// request.
    pub fn make_cpointer(
        &mut self,
        ctx: CtxId,
        addr: usize,
        parent: Value,
        free: Option<fn(usize)>,
    ) -> Result<Value, OutOfMemory> {
        self.alloc(
            ctx,
            &[parent],
            ObjKind::CPointer(CPointerData { addr, parent, free }),
        )
        .map(Value::CPointer)
    }

    /// Allocate a record instance of a registered type, with all slots
    /// set to `#f`.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the heap cannot satisfy the
    /// request.
    pub fn make_record(&mut self, ctx: CtxId, type_id: TypeId) -> Result<Value, OutOfMemory> {
        let len = self.types.get(type_id).map_or(0, |d| d.slot_names.len());
        self.alloc(
            ctx,
            &[],
            ObjKind::Record(RecordData {
                type_id,
                slots: vec![Value::False; len],
            }),
        )
        .map(Value::Record)
    }

    // --- Exceptions ------------------------------------------------------

    /// Allocate an exception.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the heap cannot satisfy the
    /// request.
    pub fn make_exception(
        &mut self,
        ctx: CtxId,
        kind: &str,
        message: &str,
        irritants: Value,
        procedure: Value,
        source: Value,
    ) -> Result<Value, OutOfMemory> {
        let depth = self.contexts.get(ctx).root_depth();
        self.contexts.get_mut(ctx).preserve(irritants);
        self.contexts.get_mut(ctx).preserve(procedure);
        self.contexts.get_mut(ctx).preserve(source);
        let result = (|| {
            let kind_sym = self.intern(ctx, kind)?;
            let msg = self.make_string(ctx, message)?;
            self.alloc(
                ctx,
                &[kind_sym, msg, irritants, procedure, source],
                ObjKind::Exception(ExceptionData {
                    kind: kind_sym,
                    message: msg,
                    irritants,
                    procedure,
                    source,
                    stack_trace: Value::False,
                }),
            )
            .map(Value::Exception)
        })();
        self.contexts.get_mut(ctx).release_to(depth);
        result
    }

    /// Allocate an exception with no irritants or source.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the heap cannot satisfy the
    /// request.
    pub fn make_exception_simple(
        &mut self,
        ctx: CtxId,
        kind: &str,
        message: &str,
    ) -> Result<Value, OutOfMemory> {
        self.make_exception(ctx, kind, message, Value::Null, Value::False, Value::False)
    }

    /// Allocate a `type` exception for an unexpected value.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the heap cannot satisfy the
    /// request.
    pub fn type_error(
        &mut self,
        ctx: CtxId,
        expected: &str,
        found: Value,
    ) -> Result<Value, OutOfMemory> {
        let irritants = self.list(ctx, &[found])?;
        let message = format!("expected a {expected}, found {}", found.type_name());
        self.make_exception(ctx, "type", &message, irritants, Value::False, Value::False)
    }

    /// Allocate a trampoline exception carrying a bounced call.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the heap cannot satisfy the
    /// request.
    pub fn make_trampoline(
        &mut self,
        ctx: CtxId,
        procedure: Value,
        args: Value,
    ) -> Result<Value, OutOfMemory> {
        let depth = self.contexts.get(ctx).root_depth();
        self.contexts.get_mut(ctx).preserve(procedure);
        self.contexts.get_mut(ctx).preserve(args);
        let result = (|| {
            let kind_sym = self.intern(ctx, "trampoline")?;
            let msg = self.make_string(ctx, "trampoline")?;
            self.alloc(
                ctx,
                &[kind_sym, msg, args, procedure],
                ObjKind::Exception(ExceptionData {
                    kind: kind_sym,
                    message: msg,
                    irritants: args,
                    procedure,
                    source: Value::False,
                    stack_trace: Value::False,
                }),
            )
            .map(Value::Exception)
        })();
        self.contexts.get_mut(ctx).release_to(depth);
        result
    }

    /// Whether an exception value carries a bounced trampoline call.
    #[must_use]
    pub fn is_trampoline(&self, v: Value) -> bool {
        let Value::Exception(r) = v else { return false };
        let ObjKind::Exception(e) = &self.heap.get(r).kind else {
            return false;
        };
        self.heap.symbol_name(e.kind) == Some("trampoline")
    }

    // --- Top-level environment -------------------------------------------

    /// Define (or redefine) a top-level binding, returning its cell.
    ///
    /// # Errors
    ///
    /// Returns [`OutOfMemory`] when the heap cannot satisfy the
    /// request.
    pub fn global_define(
        &mut self,
        ctx: CtxId,
        sym: Value,
        value: Value,
    ) -> Result<Value, OutOfMemory> {
        if let Some(cell) = self.global_cell(sym) {
            if let Some(pair) = self.heap.pair_mut(cell) {
                pair.cdr = value;
            }
            return Ok(cell);
        }
        let env = self.global(GlobalSlot::GlobalEnv);
        let cell = self.cons(ctx, sym, value)?;
        let Value::Env(env_ref) = env else {
            return Ok(cell);
        };
        let bindings = match &self.heap.get(env_ref).kind {
            ObjKind::Env(data) => data.bindings,
            _ => Value::Null,
        };
        let new_bindings = self.cons(ctx, cell, bindings)?;
        if let ObjKind::Env(data) = &mut self.heap.get_mut(env_ref).kind {
            data.bindings = new_bindings;
        }
        Ok(cell)
    }

    /// Find the binding cell `(symbol . value)` of a top-level
    /// variable.
    #[must_use]
    pub fn global_cell(&self, sym: Value) -> Option<Value> {
        let Value::Env(env_ref) = self.global(GlobalSlot::GlobalEnv) else {
            return None;
        };
        let ObjKind::Env(data) = &self.heap.get(env_ref).kind else {
            return None;
        };
        let mut cur = data.bindings;
        while let Value::Pair(_) = cur {
            let cell = self.heap.car(cur)?;
            if self.heap.car(cell) == Some(sym) {
                return Some(cell);
            }
            cur = self.heap.cdr(cur)?;
        }
        None
    }

    // --- Primitives ------------------------------------------------------

    /// Register a foreign primitive, returning its table index for
    /// `FCALL` immediates.
    pub fn register_primitive(&mut self, prim: Primitive) -> u32 {
        self.primitives.push(prim);
        (self.primitives.len() - 1) as u32
    }

    /// Look up a primitive by name.
    #[must_use]
    pub fn primitive_index(&self, name: &str) -> Option<u32> {
        self.primitives
            .iter()
            .position(|p| p.name == name)
            .map(|i| i as u32)
    }

    // --- Context helpers -------------------------------------------------

    /// Borrow a context.
    #[inline]
    #[must_use]
    pub fn ctx(&self, id: CtxId) -> &Context {
        self.contexts.get(id)
    }

    /// Mutably borrow a context.
    #[inline]
    #[must_use]
    pub fn ctx_mut(&mut self, id: CtxId) -> &mut Context {
        self.contexts.get_mut(id)
    }

    /// Read an object, asserting liveness in debug builds.
    #[inline]
    #[must_use]
    pub fn obj(&self, r: ObjRef) -> &Obj {
        self.heap.get(r)
    }
}
