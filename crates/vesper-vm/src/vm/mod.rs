// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Stack-based bytecode interpreter.
//!
//! All execution state lives in the current [`crate::context::Context`]:
//! the value stack, frame pointer, instruction pointer, and current
//! procedure. A frame is a three-slot marker (previous frame pointer,
//! return ip, caller procedure) followed by the callee's parameter and
//! local slots, so locals are `stack[fp + i]` and the marker sits at
//! `fp-3..fp`. `TAIL_CALL` replaces the parameter slots in place and
//! reuses the marker, bounding stack growth by the program's non-tail
//! call depth.
//!
//! The raise path is a state transition inside the dispatch loop, not
//! unwinding: the installed handler is called on a frame whose return
//! ip is a sentinel, so a handler that returns normally surfaces the
//! original exception to the host (non-continuable semantics), while a
//! handler that escapes through a continuation proceeds as usual.

pub mod primitives;


use std::time::Instant;

use crate::bytecode::{Opcode, read_u32};
use crate::context::{DEFAULT_REFUEL, MAX_STACK_DEPTH};
use crate::port::{PortData, PortError};
use crate::realm::{GlobalSlot, PrimResult, Realm};
use crate::types::{CtxId, ObjRef, TypeId, registry::tag};
use crate::value::Value;
use crate::value::object::{ContinuationData, ObjKind, ProcFlags, ProcedureData, PromiseData};

/// Return-ip sentinel marking a frame entered from the raise path; a
/// normal return through it propagates the pending exception.
const HANDLER_RETURN: i64 = -1;

/// Result of resuming a context.
#[derive(Debug)]
pub enum RunOutcome {
    /// The outermost frame returned.
    Done(Value),
    /// An exception reached the host uncaught.
    Errored(Value),
    /// Refuel exhausted or explicit `YIELD`.
    Yielded,
    /// Parked on a descriptor.
    Blocked {
        /// Descriptor to wait on.
        fd: i32,
        /// Wait for writability rather than readability.
        write: bool,
    },
    /// Parked until a deadline.
    Sleeping {
        /// Wakeup time.
        deadline: Instant,
    },
}

/// Internal per-instruction control flow.
enum Flow {
    Continue,
    Outcome(RunOutcome),
}

/// Set up `ctx` to apply `procedure` to `args` when next resumed.
///
/// # Errors
///
/// Returns an exception value when the operator is not applicable or
/// the arity does not match.
pub fn prepare(
    realm: &mut Realm,
    ctx: CtxId,
    procedure: Value,
    args: &[Value],
) -> Result<(), Value> {
    {
        let state = realm.ctx_mut(ctx);
        state.stack.clear();
        state.fp = 0;
        state.ip = 0;
        state.procedure = Value::False;
        for &arg in args {
            state.stack.push(arg);
        }
        state.stack.push(procedure);
    }
    let mut vm = Vm { realm, ctx };
    match vm.do_call(args.len(), false, false) {
        Ok(_) => Ok(()),
        Err(exn) => Err(exn),
    }
}

/// Resume a prepared or suspended context until it yields, blocks,
/// finishes, or fails.
pub fn resume(realm: &mut Realm, ctx: CtxId) -> RunOutcome {
    Vm { realm, ctx }.run(None)
}

/// Resume a context, raising `exn` in it first (scheduler-injected
/// timeouts and interrupts).
pub fn resume_with_raise(realm: &mut Realm, ctx: CtxId, exn: Value) -> RunOutcome {
    Vm { realm, ctx }.run(Some(exn))
}

/// Apply `procedure` to `args` on `ctx` and run to completion.
///
/// This is the host entry point: yields are absorbed and would-block
/// conditions wait synchronously, so it must not be called from code
/// that expects cooperative scheduling (use [`crate::sched::run`] for
/// that).
///
/// # Errors
///
/// Returns the uncaught exception value.
pub fn apply(
    realm: &mut Realm,
    ctx: CtxId,
    procedure: Value,
    args: &[Value],
) -> Result<Value, Value> {
    let (saved_fp, saved_ip, saved_proc, base_len, root_depth) = {
        let state = realm.ctx_mut(ctx);
        let saved = (
            state.fp,
            state.ip,
            state.procedure,
            state.stack.len(),
            state.root_depth(),
        );
        // The suspended procedure leaves the register during the
        // nested run; keep it rooted.
        state.preserve(state.procedure);
        // A false caller makes the new frame a barrier: its return
        // surfaces as Done instead of resuming the suspended code.
        state.procedure = Value::False;
        for &arg in args {
            state.stack.push(arg);
        }
        state.stack.push(procedure);
        saved
    };

    let mut vm = Vm { realm, ctx };
    let result = match vm.do_call(args.len(), false, false) {
        Ok(_) => run_to_completion(realm, ctx),
        Err(exn) => Err(exn),
    };

    let state = realm.ctx_mut(ctx);
    state.release_to(root_depth);
    state.stack.truncate(base_len);
    state.fp = saved_fp;
    state.ip = saved_ip;
    state.procedure = saved_proc;
    result
}

fn run_to_completion(realm: &mut Realm, ctx: CtxId) -> Result<Value, Value> {
    loop {
        match resume(realm, ctx) {
            RunOutcome::Done(v) => break Ok(v),
            RunOutcome::Errored(exn) => break Err(exn),
            RunOutcome::Yielded => {}
            RunOutcome::Blocked { fd, write } => wait_on_fd(fd, write),
            RunOutcome::Sleeping { deadline } => {
                let now = Instant::now();
                if deadline > now {
                    std::thread::sleep(deadline - now);
                }
            }
        }
    }
}

/// Synchronous wait used by the host-level [`apply`].
fn wait_on_fd(fd: i32, write: bool) {
    let mut pollfd = libc::pollfd {
        fd,
        events: if write { libc::POLLOUT } else { libc::POLLIN },
        revents: 0,
    };
    // SAFETY: pollfd is a live stack value for the duration of the
    // call.
    unsafe {
        libc::poll(&raw mut pollfd, 1, -1);
    }
}

/// Typed-access failure, turned into an exception by the dispatcher.
enum AccessErr {
    /// Wrong type; carries the expected type name.
    Type(&'static str),
    /// Index or cursor out of range.
    Range,
}

struct Vm<'r> {
    realm: &'r mut Realm,
    ctx: CtxId,
}

impl Vm<'_> {
    fn run(&mut self, inject: Option<Value>) -> RunOutcome {
        if let Some(exn) = inject {
            match self.do_raise(exn) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Outcome(outcome)) => return outcome,
                Err(exn) => return RunOutcome::Errored(exn),
            }
        }
        loop {
            {
                let state = self.realm.ctx_mut(self.ctx);
                state.refuel -= 1;
                if state.refuel <= 0 {
                    state.refuel = DEFAULT_REFUEL;
                    return RunOutcome::Yielded;
                }
            }
            match self.step() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Outcome(outcome)) => return outcome,
                Err(exn) => return RunOutcome::Errored(exn),
            }
        }
    }

    // --- Stack helpers ---------------------------------------------------

    fn push(&mut self, v: Value) {
        self.realm.ctx_mut(self.ctx).stack.push(v);
    }

    fn pop(&mut self) -> Value {
        self.realm
            .ctx_mut(self.ctx)
            .stack
            .pop()
            .unwrap_or(Value::Void)
    }

    fn top(&self) -> Value {
        *self.realm.ctx(self.ctx).stack.last().unwrap_or(&Value::Void)
    }

    fn stack_len(&self) -> usize {
        self.realm.ctx(self.ctx).stack.len()
    }

    // --- Contained heap accessors ----------------------------------------
    //
    // Every accessor returns owned data so the dispatcher never holds
    // a heap borrow while constructing an exception.

    fn procedure_data(&self, v: Value) -> Option<ProcedureData> {
        let Value::Procedure(r) = v else { return None };
        match &self.realm.heap.get(r).kind {
            ObjKind::Procedure(pd) => Some(*pd),
            _ => None,
        }
    }

    fn current_proc_data(&self) -> Option<ProcedureData> {
        self.procedure_data(self.realm.ctx(self.ctx).procedure)
    }

    fn code_ref(&self) -> Option<ObjRef> {
        let pd = self.current_proc_data()?;
        let Value::Bytecode(r) = pd.code else {
            return None;
        };
        Some(r)
    }

    fn code_byte(&self, code: ObjRef, ip: usize) -> Option<u8> {
        match &self.realm.heap.get(code).kind {
            ObjKind::Bytecode(bc) => bc.code.get(ip).copied(),
            _ => None,
        }
    }

    fn code_word(&self, code: ObjRef, ip: usize) -> Option<u32> {
        match &self.realm.heap.get(code).kind {
            ObjKind::Bytecode(bc) if ip + 4 <= bc.code.len() => Some(read_u32(&bc.code, ip)),
            _ => None,
        }
    }

    fn code_literal(&self, code: ObjRef, index: u32) -> Option<Value> {
        match &self.realm.heap.get(code).kind {
            ObjKind::Bytecode(bc) => bc.literals.get(index as usize).copied(),
            _ => None,
        }
    }

    fn fetch_op(&mut self) -> Result<Opcode, Value> {
        let Some(code) = self.code_ref() else {
            return Err(self.simple_exn("abi", "no bytecode to execute"));
        };
        let ip = self.realm.ctx(self.ctx).ip;
        let Some(byte) = self.code_byte(code, ip) else {
            return Err(self.simple_exn("abi", "instruction pointer out of bounds"));
        };
        self.realm.ctx_mut(self.ctx).ip = ip + 1;
        Opcode::try_from(byte).map_err(|_| self.simple_exn("abi", "invalid opcode"))
    }

    fn fetch_u32(&mut self) -> Result<u32, Value> {
        let Some(code) = self.code_ref() else {
            return Err(self.simple_exn("abi", "no bytecode to execute"));
        };
        let ip = self.realm.ctx(self.ctx).ip;
        let Some(word) = self.code_word(code, ip) else {
            return Err(self.simple_exn("abi", "truncated immediate"));
        };
        self.realm.ctx_mut(self.ctx).ip = ip + 4;
        Ok(word)
    }

    fn fetch_i32(&mut self) -> Result<i32, Value> {
        self.fetch_u32().map(|w| w as i32)
    }

    fn literal(&mut self, index: u32) -> Result<Value, Value> {
        let Some(code) = self.code_ref() else {
            return Err(self.simple_exn("abi", "no bytecode to execute"));
        };
        match self.code_literal(code, index) {
            Some(v) => Ok(v),
            None => Err(self.simple_exn("abi", "literal index out of bounds")),
        }
    }

    /// Source annotation at the current ip, for error construction.
    fn current_source(&self) -> Value {
        let Some(code) = self.code_ref() else {
            return Value::False;
        };
        let ip = self.realm.ctx(self.ctx).ip;
        match &self.realm.heap.get(code).kind {
            ObjKind::Bytecode(bc) => bc.source_at(ip),
            _ => Value::False,
        }
    }

    fn with_port<T>(&mut self, r: ObjRef, f: impl FnOnce(&mut PortData) -> T) -> Option<T> {
        match &mut self.realm.heap.get_mut(r).kind {
            ObjKind::Port(p) => Some(f(p)),
            _ => None,
        }
    }

    fn parameter_value(&self, v: Value) -> Option<Value> {
        let Value::Parameter(r) = v else { return None };
        match &self.realm.heap.get(r).kind {
            ObjKind::Parameter(p) => Some(p.value),
            _ => None,
        }
    }

    fn continuation_data(&self, v: Value) -> Option<ContinuationData> {
        let Value::Continuation(r) = v else { return None };
        match &self.realm.heap.get(r).kind {
            ObjKind::Continuation(data) => Some(ContinuationData {
                stack: data.stack.clone(),
                fp: data.fp,
                ip: data.ip,
                procedure: data.procedure,
                winders: data.winders,
            }),
            _ => None,
        }
    }

    fn vec_get(&self, v: Value, index: Value) -> Result<Value, AccessErr> {
        let n = index.as_fixnum().ok_or(AccessErr::Type("fixnum"))?;
        let elems = self.realm.heap.vector(v).ok_or(AccessErr::Type("vector"))?;
        usize::try_from(n)
            .ok()
            .and_then(|i| elems.get(i).copied())
            .ok_or(AccessErr::Range)
    }

    fn vec_set(&mut self, v: Value, index: Value, value: Value) -> Result<(), AccessErr> {
        let n = index.as_fixnum().ok_or(AccessErr::Type("fixnum"))?;
        let elems = self
            .realm
            .heap
            .vector_mut(v)
            .ok_or(AccessErr::Type("vector"))?;
        let slot = usize::try_from(n)
            .ok()
            .filter(|&i| i < elems.len())
            .ok_or(AccessErr::Range)?;
        elems[slot] = value;
        Ok(())
    }

    fn vec_len(&self, v: Value) -> Result<i64, AccessErr> {
        self.realm
            .heap
            .vector(v)
            .map(|elems| elems.len() as i64)
            .ok_or(AccessErr::Type("vector"))
    }

    fn bytes_get(&self, v: Value, index: Value) -> Result<Value, AccessErr> {
        let n = index.as_fixnum().ok_or(AccessErr::Type("fixnum"))?;
        let data = self
            .realm
            .heap
            .bytes(v)
            .ok_or(AccessErr::Type("bytevector"))?;
        usize::try_from(n)
            .ok()
            .and_then(|i| data.get(i).copied())
            .map(|b| Value::Fixnum(i64::from(b)))
            .ok_or(AccessErr::Range)
    }

    fn bytes_set(&mut self, v: Value, index: Value, value: Value) -> Result<(), AccessErr> {
        let n = index.as_fixnum().ok_or(AccessErr::Type("fixnum"))?;
        let byte = value
            .as_fixnum()
            .and_then(|b| u8::try_from(b).ok())
            .ok_or(AccessErr::Range)?;
        let data = self
            .realm
            .heap
            .bytes_mut(v)
            .ok_or(AccessErr::Type("bytevector"))?;
        let slot = usize::try_from(n)
            .ok()
            .filter(|&i| i < data.len())
            .ok_or(AccessErr::Range)?;
        data[slot] = byte;
        Ok(())
    }

    fn bytes_len(&self, v: Value) -> Result<i64, AccessErr> {
        self.realm
            .heap
            .bytes(v)
            .map(|data| data.len() as i64)
            .ok_or(AccessErr::Type("bytevector"))
    }

    fn string_char_at(&self, v: Value, cursor: Value) -> Result<char, AccessErr> {
        let offset = cursor.as_cursor().ok_or(AccessErr::Type("string-cursor"))?;
        let data = self.realm.heap.string(v).ok_or(AccessErr::Type("string"))?;
        data.char_at(offset).ok_or(AccessErr::Range)
    }

    fn string_set_at(&mut self, v: Value, cursor: Value, c: Value) -> Result<(), AccessErr> {
        let offset = cursor.as_cursor().ok_or(AccessErr::Type("string-cursor"))?;
        let c = c.as_char().ok_or(AccessErr::Type("char"))?;
        let old = self
            .realm
            .heap
            .string(v)
            .ok_or(AccessErr::Type("string"))?
            .char_at(offset)
            .ok_or(AccessErr::Range)?;
        let data = self
            .realm
            .heap
            .string_mut(v)
            .ok_or(AccessErr::Type("string"))?;
        let at = offset as usize;
        let mut encoded = [0u8; 4];
        let new_bytes = c.encode_utf8(&mut encoded).as_bytes().to_vec();
        data.bytes.splice(at..at + old.len_utf8(), new_bytes);
        data.char_len = None;
        Ok(())
    }

    fn string_len(&mut self, v: Value) -> Result<i64, AccessErr> {
        self.realm
            .heap
            .string_mut(v)
            .map(|data| i64::from(data.char_count()))
            .ok_or(AccessErr::Type("string"))
    }

    fn string_cursor_step(&self, v: Value, cursor: Value, forward: bool) -> Result<u32, AccessErr> {
        let offset = cursor.as_cursor().ok_or(AccessErr::Type("string-cursor"))?;
        let data = self.realm.heap.string(v).ok_or(AccessErr::Type("string"))?;
        let next = if forward {
            data.cursor_next(offset)
        } else {
            data.cursor_prev(offset)
        };
        next.ok_or(AccessErr::Range)
    }

    fn string_cursor_end(&self, v: Value) -> Result<u32, AccessErr> {
        self.realm
            .heap
            .string(v)
            .map(|data| data.cursor_end())
            .ok_or(AccessErr::Type("string"))
    }

    // --- Exception construction ------------------------------------------

    fn simple_exn(&mut self, kind: &str, message: &str) -> Value {
        let source = self.current_source();
        let procedure = self.realm.ctx(self.ctx).procedure;
        self.realm
            .make_exception(self.ctx, kind, message, Value::Null, procedure, source)
            .unwrap_or_else(|_| self.realm.global(GlobalSlot::OomError))
    }

    fn type_exn(&mut self, expected: &str, found: Value) -> Value {
        self.realm
            .type_error(self.ctx, expected, found)
            .unwrap_or_else(|_| self.realm.global(GlobalSlot::OomError))
    }

    fn range_exn(&mut self, index: Value) -> Value {
        let source = self.current_source();
        let procedure = self.realm.ctx(self.ctx).procedure;
        let irritants = self.realm.list(self.ctx, &[index]).unwrap_or(Value::Null);
        self.realm
            .make_exception(
                self.ctx,
                "range",
                "index out of range",
                irritants,
                procedure,
                source,
            )
            .unwrap_or_else(|_| self.realm.global(GlobalSlot::OomError))
    }

    fn access_exn(&mut self, err: &AccessErr, subject: Value) -> Value {
        match err {
            AccessErr::Type(expected) => self.type_exn(expected, subject),
            AccessErr::Range => self.range_exn(subject),
        }
    }

    fn undefined_exn(&mut self, sym: Value) -> Value {
        let name = self.realm.heap.symbol_name(sym).unwrap_or("?").to_string();
        self.simple_exn("user", &format!("undefined variable: {name}"))
    }

    fn port_exn(&mut self, e: PortError) -> Value {
        let kind = match e {
            PortError::Io { .. } | PortError::Closed => "file",
            _ => "type",
        };
        self.simple_exn(kind, &e.to_string())
    }

    fn oom(&mut self) -> Value {
        self.realm.global(GlobalSlot::OomError)
    }

    /// Capture the current frame chain as a list of procedures.
    fn capture_trace(&mut self) -> Value {
        let mut procs = vec![self.realm.ctx(self.ctx).procedure];
        let mut fp = self.realm.ctx(self.ctx).fp;
        while fp >= 3 {
            let (prev_fp, caller) = {
                let stack = &self.realm.ctx(self.ctx).stack;
                let Value::Fixnum(prev_fp) = stack[fp - 3] else {
                    break;
                };
                (prev_fp, stack[fp - 1])
            };
            if !caller.is_truthy() {
                break;
            }
            procs.push(caller);
            fp = prev_fp as usize;
        }
        self.realm.list(self.ctx, &procs).unwrap_or(Value::Null)
    }

    // --- Raise path ------------------------------------------------------

    /// Raise `exn`: attach a stack trace, then transfer to the
    /// installed handler on a sentinel frame, or hand the exception to
    /// the host when no handler is installed.
    fn do_raise(&mut self, exn: Value) -> Result<Flow, Value> {
        if let Value::Exception(r) = exn {
            let needs_trace = matches!(
                &self.realm.heap.get(r).kind,
                ObjKind::Exception(e) if e.stack_trace == Value::False
            );
            if needs_trace {
                let trace = self.capture_trace();
                if let ObjKind::Exception(e) = &mut self.realm.heap.get_mut(r).kind {
                    e.stack_trace = trace;
                }
            }
        }

        let handler = self.realm.global(GlobalSlot::ExceptionHandler);
        if !handler.is_applicable() {
            return Err(exn);
        }
        self.realm.ctx_mut(self.ctx).pending_exn = exn;
        self.push(exn);
        self.push(handler);
        self.do_call(1, false, true)
    }

    // --- Calling convention ----------------------------------------------

    /// Invoke the operator on top of the stack with the `argc` values
    /// below it. `tail` reuses the current frame; `handler` marks the
    /// new frame with the sentinel return ip.
    fn do_call(&mut self, argc: usize, tail: bool, handler: bool) -> Result<Flow, Value> {
        let operator = self.pop();
        match operator {
            Value::Procedure(_) => {
                let Some(pd) = self.procedure_data(operator) else {
                    let exn = self.type_exn("procedure", operator);
                    return self.do_raise(exn);
                };
                self.call_procedure(operator, pd, argc, tail, handler)
            }
            Value::Continuation(_) => {
                if argc != 1 {
                    let exn = self.simple_exn("arity", "continuation expects one value");
                    return self.do_raise(exn);
                }
                let value = self.pop();
                self.restore_continuation(operator, value)?;
                Ok(Flow::Continue)
            }
            Value::Parameter(_) => {
                if argc != 0 {
                    let exn = self.simple_exn("arity", "parameter takes no arguments");
                    return self.do_raise(exn);
                }
                let value = self.parameter_value(operator).unwrap_or(Value::Void);
                self.push(value);
                Ok(Flow::Continue)
            }
            _ => {
                for _ in 0..argc {
                    self.pop();
                }
                let exn = self.type_exn("procedure", operator);
                self.do_raise(exn)
            }
        }
    }

    fn call_procedure(
        &mut self,
        operator: Value,
        pd: ProcedureData,
        argc: usize,
        tail: bool,
        handler: bool,
    ) -> Result<Flow, Value> {
        let required = pd.num_args as usize;

        if argc < required || (argc > required && !pd.is_variadic()) {
            for _ in 0..argc {
                self.pop();
            }
            let exn = self.simple_exn("arity", "wrong number of arguments");
            return self.do_raise(exn);
        }

        let mut param_slots = required;
        if pd.is_variadic() {
            let rest_len = argc - required;
            if pd.flags.contains(ProcFlags::UNUSED_REST) {
                // The rest list is never referenced; drop the extras.
                for _ in 0..rest_len {
                    self.pop();
                }
            } else {
                // The rest values stay on the stack and are therefore
                // rooted while the list is built.
                let base = self.stack_len() - rest_len;
                let rest_values: Vec<Value> = self.realm.ctx(self.ctx).stack[base..].to_vec();
                let rest = match self.realm.list(self.ctx, &rest_values) {
                    Ok(v) => v,
                    Err(_) => {
                        let exn = self.oom();
                        return self.do_raise(exn);
                    }
                };
                self.realm.ctx_mut(self.ctx).stack.truncate(base);
                self.push(rest);
                param_slots += 1;
            }
        }

        if self.stack_len() + 3 > MAX_STACK_DEPTH {
            let exn = self.realm.global(GlobalSlot::StackOverflowError);
            return self.do_raise(exn);
        }

        if tail {
            // Replace the current frame's parameter and local slots
            // with the new arguments; the marker stays in place.
            let state = self.realm.ctx_mut(self.ctx);
            let fp = state.fp;
            let base = state.stack.len() - param_slots;
            state.stack.copy_within(base.., fp);
            state.stack.truncate(fp + param_slots);
            state.ip = 0;
            state.procedure = operator;
        } else {
            let state = self.realm.ctx_mut(self.ctx);
            let base = state.stack.len() - param_slots;
            let params = state.stack.split_off(base);
            let ret_ip = if handler { HANDLER_RETURN } else { state.ip as i64 };
            state.stack.push(Value::Fixnum(state.fp as i64));
            state.stack.push(Value::Fixnum(ret_ip));
            state.stack.push(state.procedure);
            state.fp = state.stack.len();
            state.stack.extend(params);
            state.ip = 0;
            state.procedure = operator;
        }
        Ok(Flow::Continue)
    }

    /// Pop the current frame; `Done` when the outermost frame returns,
    /// the pending exception when a handler frame returns normally.
    fn do_ret(&mut self) -> Result<Flow, Value> {
        let result = self.pop();
        let fp = self.realm.ctx(self.ctx).fp;
        if fp < 3 {
            return Ok(Flow::Outcome(RunOutcome::Done(result)));
        }
        let (prev_fp, ret_ip, caller) = {
            let stack = &self.realm.ctx(self.ctx).stack;
            let (Value::Fixnum(prev_fp), Value::Fixnum(ret_ip)) = (stack[fp - 3], stack[fp - 2])
            else {
                return Err(self.simple_exn("abi", "corrupt frame"));
            };
            (prev_fp, ret_ip, stack[fp - 1])
        };
        if ret_ip == HANDLER_RETURN {
            // Non-continuable: the handler returned instead of
            // escaping, so the original exception goes to the host.
            let exn = self.realm.ctx(self.ctx).pending_exn;
            self.realm.ctx_mut(self.ctx).pending_exn = Value::Void;
            return Err(exn);
        }
        if !caller.is_truthy() {
            return Ok(Flow::Outcome(RunOutcome::Done(result)));
        }
        let state = self.realm.ctx_mut(self.ctx);
        state.stack.truncate(fp - 3);
        state.stack.push(result);
        state.fp = prev_fp as usize;
        state.ip = ret_ip as usize;
        state.procedure = caller;
        Ok(Flow::Continue)
    }

    // --- Continuations and dynamic-wind ----------------------------------

    /// Capture the current execution state into a continuation value.
    fn capture_continuation(&mut self) -> Result<Value, Value> {
        let data = {
            let state = self.realm.ctx(self.ctx);
            ContinuationData {
                stack: state.stack.clone(),
                fp: state.fp,
                ip: state.ip,
                procedure: state.procedure,
                winders: state.winders,
            }
        };
        let mut roots = data.stack.clone();
        roots.push(data.procedure);
        roots.push(data.winders);
        self.realm
            .alloc(self.ctx, &roots, ObjKind::Continuation(data))
            .map(Value::Continuation)
            .map_err(|_| self.oom())
    }

    /// Restore a captured continuation, running dynamic-wind thunks
    /// between the current dynamic extent and the target's.
    fn restore_continuation(&mut self, k: Value, value: Value) -> Result<(), Value> {
        let Some(data) = self.continuation_data(k) else {
            return Err(self.type_exn("continuation", k));
        };

        self.rewind_winders(data.winders)?;

        let state = self.realm.ctx_mut(self.ctx);
        state.stack = data.stack;
        state.fp = data.fp;
        state.ip = data.ip;
        state.procedure = data.procedure;
        state.winders = data.winders;
        self.push(value);
        Ok(())
    }

    /// Run after-thunks out of the current extent (innermost first)
    /// and before-thunks into the target extent (outermost first),
    /// stopping at the nearest common tail.
    fn rewind_winders(&mut self, target: Value) -> Result<(), Value> {
        let current = self.realm.ctx(self.ctx).winders;
        if current == target {
            return Ok(());
        }
        let cur_chain = self.winder_chain(current);
        let tgt_chain = self.winder_chain(target);

        let mut shared = 0;
        while shared < cur_chain.len()
            && shared < tgt_chain.len()
            && cur_chain[cur_chain.len() - 1 - shared] == tgt_chain[tgt_chain.len() - 1 - shared]
        {
            shared += 1;
        }

        // Leave the current extent, innermost first.
        for &winder in &cur_chain[..cur_chain.len() - shared] {
            let after = self.realm.heap.cdr(winder).unwrap_or(Value::False);
            let rest = self.realm.ctx(self.ctx).winders;
            let rest = self.realm.heap.cdr(rest).unwrap_or(Value::Null);
            self.realm.ctx_mut(self.ctx).winders = rest;
            if after.is_applicable() {
                apply(self.realm, self.ctx, after, &[])?;
            }
        }

        // Enter the target extent, outermost first.
        let entering = tgt_chain.len() - shared;
        for (i, &winder) in tgt_chain[..entering].iter().enumerate().rev() {
            let before = self.realm.heap.car(winder).unwrap_or(Value::False);
            if before.is_applicable() {
                apply(self.realm, self.ctx, before, &[])?;
            }
            // The winder tail including this entry.
            let mut tail = target;
            for _ in 0..i {
                tail = self.realm.heap.cdr(tail).unwrap_or(Value::Null);
            }
            self.realm.ctx_mut(self.ctx).winders = tail;
        }
        Ok(())
    }

    /// The winder list as a vector of `(before . after)` pairs,
    /// innermost first.
    fn winder_chain(&self, winders: Value) -> Vec<Value> {
        let mut chain = Vec::new();
        let mut cur = winders;
        while let Value::Pair(_) = cur {
            if let Some(w) = self.realm.heap.car(cur) {
                chain.push(w);
            }
            cur = self.realm.heap.cdr(cur).unwrap_or(Value::Null);
        }
        chain
    }

    // --- Numeric helpers -------------------------------------------------

    fn number_of(&mut self, v: Value) -> Result<Num, Value> {
        match v {
            Value::Fixnum(n) => Ok(Num::Fix(n)),
            Value::Flonum(_) => {
                let f = self.realm.heap.flonum(v).unwrap_or(f64::NAN);
                Ok(Num::Flo(f))
            }
            _ => Err(self.type_exn("number", v)),
        }
    }

    fn pop_numbers(&mut self) -> Result<(Num, Num), Value> {
        let b = self.pop();
        let a = self.pop();
        Ok((self.number_of(a)?, self.number_of(b)?))
    }

    fn push_flonum(&mut self, f: f64) -> Result<(), Value> {
        let v = self
            .realm
            .make_flonum(self.ctx, f)
            .map_err(|_| self.oom())?;
        self.push(v);
        Ok(())
    }

    fn arith(&mut self, op: Opcode) -> Result<(), Value> {
        let (a, b) = self.pop_numbers()?;
        match (a, b) {
            (Num::Fix(x), Num::Fix(y)) => {
                let fixed = match op {
                    Opcode::Add => x.checked_add(y),
                    Opcode::Sub => x.checked_sub(y),
                    Opcode::Mul => x.checked_mul(y),
                    _ => None,
                };
                if let Some(n) = fixed {
                    self.push(Value::Fixnum(n));
                } else {
                    // Fixnum overflow promotes to the boxed float
                    // stand-in for the external tower.
                    let (x, y) = (x as f64, y as f64);
                    let f = match op {
                        Opcode::Add => x + y,
                        Opcode::Sub => x - y,
                        Opcode::Mul => x * y,
                        _ => f64::NAN,
                    };
                    self.push_flonum(f)?;
                }
            }
            (a, b) => {
                let (x, y) = (a.as_f64(), b.as_f64());
                let f = match op {
                    Opcode::Add => x + y,
                    Opcode::Sub => x - y,
                    Opcode::Mul => x * y,
                    _ => f64::NAN,
                };
                self.push_flonum(f)?;
            }
        }
        Ok(())
    }

    fn compare(&mut self, op: Opcode) -> Result<(), Value> {
        let (a, b) = self.pop_numbers()?;
        let result = match (a, b) {
            (Num::Fix(x), Num::Fix(y)) => match op {
                Opcode::Lt => x < y,
                Opcode::Le => x <= y,
                _ => x == y,
            },
            (a, b) => {
                let (x, y) = (a.as_f64(), b.as_f64());
                match op {
                    Opcode::Lt => x < y,
                    Opcode::Le => x <= y,
                    _ => x == y,
                }
            }
        };
        self.push(Value::bool(result));
        Ok(())
    }

    // --- Dispatch --------------------------------------------------------

    #[expect(
        clippy::too_many_lines,
        reason = "single dispatch loop over the full opcode set"
    )]
    fn step(&mut self) -> Result<Flow, Value> {
        let op_start = self.realm.ctx(self.ctx).ip;
        let op = self.fetch_op()?;
        match op {
            Opcode::Noop => {}

            Opcode::Raise => {
                let exn = self.pop();
                return self.do_raise(exn);
            }

            Opcode::Resumecc => {
                let index = self.fetch_u32()?;
                let k = self.literal(index)?;
                let value = self.pop();
                self.restore_continuation(k, value)?;
            }

            Opcode::Callcc => {
                let receiver = self.pop();
                let k = self.capture_continuation()?;
                self.push(k);
                self.push(receiver);
                return self.do_call(1, false, false);
            }

            Opcode::Apply1 => {
                // Stack: [args-list, procedure] with the procedure on
                // top; applies in tail position.
                let procedure = self.pop();
                let list = self.pop();
                let Some(args) = self.realm.heap.list_to_vec(list) else {
                    let exn = self.type_exn("list", list);
                    return self.do_raise(exn);
                };
                for &arg in &args {
                    self.push(arg);
                }
                self.push(procedure);
                return self.do_call(args.len(), true, false);
            }

            Opcode::TailCall => {
                let argc = self.fetch_u32()? as usize;
                return self.do_call(argc, true, false);
            }

            Opcode::Call => {
                let argc = self.fetch_u32()? as usize;
                return self.do_call(argc, false, false);
            }

            Opcode::Fcall0 | Opcode::Fcall1 | Opcode::Fcall2 | Opcode::Fcall3 | Opcode::Fcall4 => {
                let index = self.fetch_u32()?;
                let argc = match op {
                    Opcode::Fcall0 => 0,
                    Opcode::Fcall1 => 1,
                    Opcode::Fcall2 => 2,
                    Opcode::Fcall3 => 3,
                    _ => 4,
                };
                return self.do_fcall(index, argc);
            }

            Opcode::Fcalln => {
                let index = self.fetch_u32()?;
                let argc = self.fetch_u32()? as usize;
                return self.do_fcall(index, argc);
            }

            Opcode::JumpUnless => {
                let disp = self.fetch_i32()?;
                let test = self.pop();
                if !test.is_truthy() {
                    self.jump(disp)?;
                }
            }

            Opcode::Jump => {
                let disp = self.fetch_i32()?;
                self.jump(disp)?;
            }

            Opcode::Push => {
                let index = self.fetch_u32()?;
                let v = self.literal(index)?;
                self.push(v);
            }

            Opcode::Reserve => {
                let count = self.fetch_u32()? as usize;
                if self.stack_len() + count > MAX_STACK_DEPTH {
                    let exn = self.realm.global(GlobalSlot::StackOverflowError);
                    return self.do_raise(exn);
                }
                for _ in 0..count {
                    self.push(Value::Void);
                }
            }

            Opcode::Drop => {
                self.pop();
            }

            Opcode::GlobalRef => {
                let index = self.fetch_u32()?;
                let sym = self.literal(index)?;
                let value = self
                    .realm
                    .global_cell(sym)
                    .and_then(|cell| self.realm.heap.cdr(cell));
                match value {
                    Some(v) if v != Value::Undefined => self.push(v),
                    _ => {
                        let exn = self.undefined_exn(sym);
                        return self.do_raise(exn);
                    }
                }
            }

            Opcode::GlobalKnownRef => {
                let index = self.fetch_u32()?;
                let cell = self.literal(index)?;
                let value = self.realm.heap.cdr(cell).unwrap_or(Value::Undefined);
                self.push(value);
            }

            Opcode::ParameterRef => {
                let index = self.fetch_u32()?;
                let param = self.literal(index)?;
                match self.parameter_value(param) {
                    Some(v) => self.push(v),
                    None => {
                        let exn = self.type_exn("parameter", param);
                        return self.do_raise(exn);
                    }
                }
            }

            Opcode::StackRef => {
                let n = self.fetch_u32()? as usize;
                let len = self.stack_len();
                let v = self.realm.ctx(self.ctx).stack[len - 1 - n];
                self.push(v);
            }

            Opcode::LocalRef => {
                let n = self.fetch_u32()? as usize;
                let fp = self.realm.ctx(self.ctx).fp;
                let v = self.realm.ctx(self.ctx).stack[fp + n];
                self.push(v);
            }

            Opcode::LocalSet => {
                let n = self.fetch_u32()? as usize;
                let v = self.pop();
                let fp = self.realm.ctx(self.ctx).fp;
                self.realm.ctx_mut(self.ctx).stack[fp + n] = v;
            }

            Opcode::ClosureRef => {
                let n = self.fetch_u32()? as usize;
                let vars = self.current_proc_data().map_or(Value::False, |pd| pd.vars);
                let v = self
                    .realm
                    .heap
                    .vector(vars)
                    .and_then(|elems| elems.get(n).copied())
                    .unwrap_or(Value::Void);
                self.push(v);
            }

            Opcode::ClosureVars => {
                let vars = self.current_proc_data().map_or(Value::False, |pd| pd.vars);
                self.push(vars);
            }

            Opcode::VectorRef => {
                let index = self.pop();
                let vec = self.pop();
                match self.vec_get(vec, index) {
                    Ok(v) => self.push(v),
                    Err(err) => {
                        let subject = if matches!(err, AccessErr::Range) { index } else { vec };
                        let exn = self.access_exn(&err, subject);
                        return self.do_raise(exn);
                    }
                }
            }

            Opcode::VectorSet => {
                let value = self.pop();
                let index = self.pop();
                let vec = self.pop();
                match self.vec_set(vec, index, value) {
                    Ok(()) => self.push(Value::Void),
                    Err(err) => {
                        let subject = if matches!(err, AccessErr::Range) { index } else { vec };
                        let exn = self.access_exn(&err, subject);
                        return self.do_raise(exn);
                    }
                }
            }

            Opcode::VectorLength => {
                let vec = self.pop();
                match self.vec_len(vec) {
                    Ok(len) => self.push(Value::Fixnum(len)),
                    Err(err) => {
                        let exn = self.access_exn(&err, vec);
                        return self.do_raise(exn);
                    }
                }
            }

            Opcode::BytesRef => {
                let index = self.pop();
                let bytes = self.pop();
                match self.bytes_get(bytes, index) {
                    Ok(v) => self.push(v),
                    Err(err) => {
                        let subject = if matches!(err, AccessErr::Range) { index } else { bytes };
                        let exn = self.access_exn(&err, subject);
                        return self.do_raise(exn);
                    }
                }
            }

            Opcode::BytesSet => {
                let value = self.pop();
                let index = self.pop();
                let bytes = self.pop();
                match self.bytes_set(bytes, index, value) {
                    Ok(()) => self.push(Value::Void),
                    Err(err) => {
                        let subject = if matches!(err, AccessErr::Range) { index } else { bytes };
                        let exn = self.access_exn(&err, subject);
                        return self.do_raise(exn);
                    }
                }
            }

            Opcode::BytesLength => {
                let bytes = self.pop();
                match self.bytes_len(bytes) {
                    Ok(len) => self.push(Value::Fixnum(len)),
                    Err(err) => {
                        let exn = self.access_exn(&err, bytes);
                        return self.do_raise(exn);
                    }
                }
            }

            Opcode::StringRef => {
                let cursor = self.pop();
                let string = self.pop();
                match self.string_char_at(string, cursor) {
                    Ok(c) => self.push(Value::Char(c)),
                    Err(err) => {
                        let subject = if matches!(err, AccessErr::Range) { cursor } else { string };
                        let exn = self.access_exn(&err, subject);
                        return self.do_raise(exn);
                    }
                }
            }

            Opcode::StringSet => {
                let value = self.pop();
                let cursor = self.pop();
                let string = self.pop();
                match self.string_set_at(string, cursor, value) {
                    Ok(()) => self.push(Value::Void),
                    Err(err) => {
                        let subject = if matches!(err, AccessErr::Range) { cursor } else { string };
                        let exn = self.access_exn(&err, subject);
                        return self.do_raise(exn);
                    }
                }
            }

            Opcode::StringLength => {
                let string = self.pop();
                match self.string_len(string) {
                    Ok(len) => self.push(Value::Fixnum(len)),
                    Err(err) => {
                        let exn = self.access_exn(&err, string);
                        return self.do_raise(exn);
                    }
                }
            }

            Opcode::StringCursorNext | Opcode::StringCursorPrev => {
                let cursor = self.pop();
                let string = self.pop();
                let forward = op == Opcode::StringCursorNext;
                match self.string_cursor_step(string, cursor, forward) {
                    Ok(next) => self.push(Value::Cursor(next)),
                    Err(err) => {
                        let subject = if matches!(err, AccessErr::Range) { cursor } else { string };
                        let exn = self.access_exn(&err, subject);
                        return self.do_raise(exn);
                    }
                }
            }

            Opcode::StringCursorEnd => {
                let string = self.pop();
                match self.string_cursor_end(string) {
                    Ok(end) => self.push(Value::Cursor(end)),
                    Err(err) => {
                        let exn = self.access_exn(&err, string);
                        return self.do_raise(exn);
                    }
                }
            }

            Opcode::MakeProcedure => {
                let flags = self.fetch_u32()?;
                let num_args = self.fetch_u32()?;
                let code = self.pop();
                let vars = self.pop();
                let flags = ProcFlags::from_bits_truncate(flags as u8);
                match self
                    .realm
                    .make_procedure(self.ctx, code, vars, flags, num_args as u16)
                {
                    Ok(v) => self.push(v),
                    Err(_) => {
                        let exn = self.oom();
                        return self.do_raise(exn);
                    }
                }
            }

            Opcode::MakeVector => {
                let fill = self.pop();
                let len = self.pop();
                let Some(n) = len.as_fixnum().and_then(|n| usize::try_from(n).ok()) else {
                    let exn = self.type_exn("fixnum", len);
                    return self.do_raise(exn);
                };
                match self.realm.make_vector(self.ctx, n, fill) {
                    Ok(v) => self.push(v),
                    Err(_) => {
                        let exn = self.oom();
                        return self.do_raise(exn);
                    }
                }
            }

            Opcode::MakeException => {
                let irritants = self.pop();
                let message = self.pop();
                let kind = self.pop();
                let kind_name = self
                    .realm
                    .heap
                    .symbol_name(kind)
                    .unwrap_or("user")
                    .to_string();
                let msg = self
                    .realm
                    .heap
                    .string(message)
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_default();
                let source = self.current_source();
                let procedure = self.realm.ctx(self.ctx).procedure;
                match self
                    .realm
                    .make_exception(self.ctx, &kind_name, &msg, irritants, procedure, source)
                {
                    Ok(v) => self.push(v),
                    Err(_) => {
                        let exn = self.oom();
                        return self.do_raise(exn);
                    }
                }
            }

            Opcode::And => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::bool(a.is_truthy() && b.is_truthy()));
            }

            Opcode::Nullp => {
                let v = self.pop();
                self.push(Value::bool(v.is_null()));
            }

            Opcode::Fixnump => {
                let v = self.pop();
                self.push(Value::bool(v.is_fixnum()));
            }

            Opcode::Symbolp => {
                let v = self.pop();
                self.push(Value::bool(v.is_symbol()));
            }

            Opcode::Charp => {
                let v = self.pop();
                self.push(Value::bool(v.is_char()));
            }

            Opcode::Eofp => {
                let v = self.pop();
                self.push(Value::bool(v.is_eof()));
            }

            Opcode::Typep => {
                let type_id = TypeId::new(self.fetch_u32()?);
                let v = self.pop();
                self.push(Value::bool(self.value_isa(v, type_id)));
            }

            Opcode::Make => {
                let type_id = TypeId::new(self.fetch_u32()?);
                match self.realm.make_record(self.ctx, type_id) {
                    Ok(v) => self.push(v),
                    Err(_) => {
                        let exn = self.oom();
                        return self.do_raise(exn);
                    }
                }
            }

            Opcode::SlotRef => {
                let type_id = TypeId::new(self.fetch_u32()?);
                let index = self.fetch_u32()? as usize;
                let obj = self.pop();
                if !self.value_isa(obj, type_id) {
                    let exn = self.type_exn("record", obj);
                    return self.do_raise(exn);
                }
                match self.record_slot(obj, index) {
                    Some(v) => self.push(v),
                    None => {
                        let exn = self.range_exn(Value::Fixnum(index as i64));
                        return self.do_raise(exn);
                    }
                }
            }

            Opcode::SlotSet => {
                let type_id = TypeId::new(self.fetch_u32()?);
                let index = self.fetch_u32()? as usize;
                let value = self.pop();
                let obj = self.pop();
                if !self.value_isa(obj, type_id) {
                    let exn = self.type_exn("record", obj);
                    return self.do_raise(exn);
                }
                if self.set_record_slot(obj, index, value) {
                    self.push(Value::Void);
                } else {
                    let exn = self.range_exn(Value::Fixnum(index as i64));
                    return self.do_raise(exn);
                }
            }

            Opcode::Isa => {
                let ty = self.pop();
                let v = self.pop();
                let Value::Type(type_id) = ty else {
                    let exn = self.type_exn("type", ty);
                    return self.do_raise(exn);
                };
                self.push(Value::bool(self.value_isa(v, type_id)));
            }

            Opcode::SlotnRef => {
                let index = self.pop();
                let obj = self.pop();
                let Some(n) = index.as_fixnum().and_then(|n| usize::try_from(n).ok()) else {
                    let exn = self.type_exn("fixnum", index);
                    return self.do_raise(exn);
                };
                match self.record_slot(obj, n) {
                    Some(v) => self.push(v),
                    None => {
                        let exn = self.range_exn(index);
                        return self.do_raise(exn);
                    }
                }
            }

            Opcode::SlotnSet => {
                let value = self.pop();
                let index = self.pop();
                let obj = self.pop();
                let Some(n) = index.as_fixnum().and_then(|n| usize::try_from(n).ok()) else {
                    let exn = self.type_exn("fixnum", index);
                    return self.do_raise(exn);
                };
                if self.set_record_slot(obj, n, value) {
                    self.push(Value::Void);
                } else {
                    let exn = self.range_exn(index);
                    return self.do_raise(exn);
                }
            }

            Opcode::Car => {
                let v = self.pop();
                match self.realm.heap.car(v) {
                    Some(car) => self.push(car),
                    None => {
                        let exn = self.type_exn("pair", v);
                        return self.do_raise(exn);
                    }
                }
            }

            Opcode::Cdr => {
                let v = self.pop();
                match self.realm.heap.cdr(v) {
                    Some(cdr) => self.push(cdr),
                    None => {
                        let exn = self.type_exn("pair", v);
                        return self.do_raise(exn);
                    }
                }
            }

            Opcode::SetCar => {
                let value = self.pop();
                let v = self.pop();
                let ok = self
                    .realm
                    .heap
                    .pair_mut(v)
                    .map(|pair| pair.car = value)
                    .is_some();
                if ok {
                    self.push(Value::Void);
                } else {
                    let exn = self.type_exn("pair", v);
                    return self.do_raise(exn);
                }
            }

            Opcode::SetCdr => {
                let value = self.pop();
                let v = self.pop();
                let ok = self
                    .realm
                    .heap
                    .pair_mut(v)
                    .map(|pair| pair.cdr = value)
                    .is_some();
                if ok {
                    self.push(Value::Void);
                } else {
                    let exn = self.type_exn("pair", v);
                    return self.do_raise(exn);
                }
            }

            Opcode::Cons => {
                let cdr = self.pop();
                let car = self.pop();
                match self.realm.cons(self.ctx, car, cdr) {
                    Ok(v) => self.push(v),
                    Err(_) => {
                        let exn = self.oom();
                        return self.do_raise(exn);
                    }
                }
            }

            Opcode::Add | Opcode::Sub | Opcode::Mul => {
                if let Err(exn) = self.arith(op) {
                    return self.do_raise(exn);
                }
            }

            Opcode::Div => match self.pop_numbers() {
                Ok((Num::Fix(x), Num::Fix(y))) => {
                    if y == 0 {
                        let exn = self.simple_exn("divide-by-zero", "division by zero");
                        return self.do_raise(exn);
                    }
                    if x % y == 0 {
                        self.push(Value::Fixnum(x / y));
                    } else if let Err(exn) = self.push_flonum(x as f64 / y as f64) {
                        return self.do_raise(exn);
                    }
                }
                Ok((a, b)) => {
                    if let Err(exn) = self.push_flonum(a.as_f64() / b.as_f64()) {
                        return self.do_raise(exn);
                    }
                }
                Err(exn) => return self.do_raise(exn),
            },

            Opcode::Quotient | Opcode::Remainder => {
                let b = self.pop();
                let a = self.pop();
                let (Some(x), Some(y)) = (a.as_fixnum(), b.as_fixnum()) else {
                    let exn = self.type_exn("fixnum", a);
                    return self.do_raise(exn);
                };
                if y == 0 {
                    let exn = self.simple_exn("divide-by-zero", "division by zero");
                    return self.do_raise(exn);
                }
                let result = if op == Opcode::Quotient { x / y } else { x % y };
                self.push(Value::Fixnum(result));
            }

            Opcode::Lt | Opcode::Le | Opcode::Eqn => {
                if let Err(exn) = self.compare(op) {
                    return self.do_raise(exn);
                }
            }

            Opcode::Eq => {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::bool(a == b));
            }

            Opcode::Char2Int => {
                let v = self.pop();
                let Some(c) = v.as_char() else {
                    let exn = self.type_exn("char", v);
                    return self.do_raise(exn);
                };
                self.push(Value::Fixnum(i64::from(u32::from(c))));
            }

            Opcode::Int2Char => {
                let v = self.pop();
                let c = v
                    .as_fixnum()
                    .and_then(|n| u32::try_from(n).ok())
                    .and_then(char::from_u32);
                match c {
                    Some(c) => self.push(Value::Char(c)),
                    None => {
                        let exn = self.range_exn(v);
                        return self.do_raise(exn);
                    }
                }
            }

            Opcode::CharUpcase => {
                let v = self.pop();
                let Some(c) = v.as_char() else {
                    let exn = self.type_exn("char", v);
                    return self.do_raise(exn);
                };
                let up = c.to_uppercase().next().unwrap_or(c);
                self.push(Value::Char(up));
            }

            Opcode::CharDowncase => {
                let v = self.pop();
                let Some(c) = v.as_char() else {
                    let exn = self.type_exn("char", v);
                    return self.do_raise(exn);
                };
                let down = c.to_lowercase().next().unwrap_or(c);
                self.push(Value::Char(down));
            }

            Opcode::WriteChar | Opcode::WriteString => {
                // Operands stay on the stack until the write succeeds
                // so a would-block retry sees them again.
                let len = self.stack_len();
                if len < 2 {
                    return Err(self.simple_exn("abi", "stack underflow"));
                }
                let port = self.realm.ctx(self.ctx).stack[len - 1];
                let value = self.realm.ctx(self.ctx).stack[len - 2];
                let Value::Port(r) = port else {
                    self.pop();
                    self.pop();
                    let exn = self.type_exn("port", port);
                    return self.do_raise(exn);
                };
                let result = if op == Opcode::WriteChar {
                    let Some(c) = value.as_char() else {
                        self.pop();
                        self.pop();
                        let exn = self.type_exn("char", value);
                        return self.do_raise(exn);
                    };
                    self.with_port(r, |p| p.write_char(c))
                } else {
                    let text = self
                        .realm
                        .heap
                        .string(value)
                        .map(|s| s.as_str().to_string());
                    let Some(s) = text else {
                        self.pop();
                        self.pop();
                        let exn = self.type_exn("string", value);
                        return self.do_raise(exn);
                    };
                    self.with_port(r, move |p| p.write_str(&s))
                };
                match result {
                    Some(Ok(())) => {
                        self.pop();
                        self.pop();
                        self.push(Value::Void);
                    }
                    Some(Err(PortError::WouldBlock { fd, write })) => {
                        self.realm.ctx_mut(self.ctx).ip = op_start;
                        return Ok(Flow::Outcome(RunOutcome::Blocked { fd, write }));
                    }
                    Some(Err(e)) => {
                        self.pop();
                        self.pop();
                        let exn = self.port_exn(e);
                        return self.do_raise(exn);
                    }
                    None => {
                        self.pop();
                        self.pop();
                        let exn = self.type_exn("port", port);
                        return self.do_raise(exn);
                    }
                }
            }

            Opcode::ReadChar | Opcode::PeekChar => {
                // The port operand stays on the stack until the read
                // succeeds so a would-block retry sees it again.
                let port = self.top();
                let Value::Port(r) = port else {
                    self.pop();
                    let exn = self.type_exn("port", port);
                    return self.do_raise(exn);
                };
                let peek = op == Opcode::PeekChar;
                let result = self.with_port(r, |p| {
                    if peek { p.peek_char() } else { p.read_char() }
                });
                match result {
                    Some(Ok(Some(c))) => {
                        self.pop();
                        self.push(Value::Char(c));
                    }
                    Some(Ok(None)) => {
                        self.pop();
                        self.push(Value::Eof);
                    }
                    Some(Err(PortError::WouldBlock { fd, write })) => {
                        self.realm.ctx_mut(self.ctx).ip = op_start;
                        return Ok(Flow::Outcome(RunOutcome::Blocked { fd, write }));
                    }
                    Some(Err(e)) => {
                        self.pop();
                        let exn = self.port_exn(e);
                        return self.do_raise(exn);
                    }
                    None => {
                        self.pop();
                        let exn = self.type_exn("port", port);
                        return self.do_raise(exn);
                    }
                }
            }

            Opcode::Yield => {
                self.push(Value::Void);
                return Ok(Flow::Outcome(RunOutcome::Yielded));
            }

            Opcode::Force => {
                let v = self.pop();
                let Value::Promise(r) = v else {
                    // Forcing a non-promise returns it unchanged.
                    self.push(v);
                    return Ok(Flow::Continue);
                };
                let data = match &self.realm.heap.get(r).kind {
                    ObjKind::Promise(p) => *p,
                    _ => PromiseData {
                        done: true,
                        value: Value::Void,
                    },
                };
                if data.done {
                    self.push(data.value);
                } else {
                    let result = apply(self.realm, self.ctx, data.value, &[])?;
                    if let ObjKind::Promise(p) = &mut self.realm.heap.get_mut(r).kind {
                        p.done = true;
                        p.value = result;
                    }
                    self.push(result);
                }
            }

            Opcode::Ret => return self.do_ret(),

            Opcode::Done => {
                let result = self.pop();
                return Ok(Flow::Outcome(RunOutcome::Done(result)));
            }

            Opcode::Scp => {
                let v = self.pop();
                self.push(Value::bool(v.is_cursor()));
            }

            Opcode::ScLt | Opcode::ScLe => {
                let b = self.pop();
                let a = self.pop();
                let (Some(x), Some(y)) = (a.as_cursor(), b.as_cursor()) else {
                    let exn = self.type_exn("string-cursor", a);
                    return self.do_raise(exn);
                };
                let result = if op == Opcode::ScLt { x < y } else { x <= y };
                self.push(Value::bool(result));
            }
        }
        Ok(Flow::Continue)
    }

    // --- Opcode helpers --------------------------------------------------

    fn jump(&mut self, disp: i32) -> Result<(), Value> {
        let ip = self.realm.ctx(self.ctx).ip as i64 + i64::from(disp);
        if ip < 0 {
            return Err(self.simple_exn("abi", "branch out of bounds"));
        }
        self.realm.ctx_mut(self.ctx).ip = ip as usize;
        Ok(())
    }

    fn do_fcall(&mut self, index: u32, argc: usize) -> Result<Flow, Value> {
        let Some(prim) = self.realm.primitives.get(index as usize).copied() else {
            let exn = self.simple_exn("abi", "unknown primitive");
            return self.do_raise(exn);
        };
        if argc < prim.arity as usize || (argc > prim.arity as usize && !prim.variadic) {
            let exn = self.simple_exn("arity", "wrong number of arguments to primitive");
            return self.do_raise(exn);
        }
        let base = self.stack_len() - argc;
        let args: Vec<Value> = self.realm.ctx(self.ctx).stack[base..].to_vec();
        // The arguments stay on the stack (rooted) while the primitive
        // runs and are dropped before the result is pushed.
        let result = (prim.func)(self.realm, self.ctx, &args);
        self.realm.ctx_mut(self.ctx).stack.truncate(base);
        match result {
            PrimResult::Value(v) => {
                self.push(v);
                Ok(Flow::Continue)
            }
            PrimResult::Raise(exn) => {
                if self.realm.is_trampoline(exn) {
                    // Bounce the packaged call back through the
                    // interpreter.
                    let (procedure, args) = self.trampoline_payload(exn);
                    for &arg in &args {
                        self.push(arg);
                    }
                    self.push(procedure);
                    return self.do_call(args.len(), false, false);
                }
                self.do_raise(exn)
            }
            PrimResult::Sleep(duration) => {
                self.push(Value::Void);
                Ok(Flow::Outcome(RunOutcome::Sleeping {
                    deadline: Instant::now() + duration,
                }))
            }
        }
    }

    fn trampoline_payload(&self, exn: Value) -> (Value, Vec<Value>) {
        let Value::Exception(r) = exn else {
            return (Value::False, Vec::new());
        };
        let (procedure, irritants) = match &self.realm.heap.get(r).kind {
            ObjKind::Exception(e) => (e.procedure, e.irritants),
            _ => (Value::False, Value::Null),
        };
        let args = self.realm.heap.list_to_vec(irritants).unwrap_or_default();
        (procedure, args)
    }

    fn value_isa(&self, v: Value, type_id: TypeId) -> bool {
        let concrete = match v {
            Value::Record(r) => self.realm.heap.get(r).header.type_id,
            _ => v.type_tag(),
        };
        if concrete == type_id {
            return true;
        }
        if concrete == tag::RECORD || concrete.is_user() {
            return self
                .realm
                .types
                .get(concrete)
                .is_some_and(|desc| desc.isa(type_id));
        }
        false
    }

    fn record_slot(&self, obj: Value, index: usize) -> Option<Value> {
        let Value::Record(r) = obj else { return None };
        match &self.realm.heap.get(r).kind {
            ObjKind::Record(rec) => rec.slots.get(index).copied(),
            _ => None,
        }
    }

    fn set_record_slot(&mut self, obj: Value, index: usize, value: Value) -> bool {
        let Value::Record(r) = obj else { return false };
        match &mut self.realm.heap.get_mut(r).kind {
            ObjKind::Record(rec) => {
                if index < rec.slots.len() {
                    rec.slots[index] = value;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }
}

/// Clamp a second count from Scheme code into a sleep duration.
#[must_use]
pub fn sleep_duration(seconds: f64) -> std::time::Duration {
    if seconds.is_finite() && seconds > 0.0 {
        std::time::Duration::from_secs_f64(seconds)
    } else {
        std::time::Duration::ZERO
    }
}

/// A number popped from the stack.
#[derive(Clone, Copy)]
enum Num {
    Fix(i64),
    Flo(f64),
}

impl Num {
    fn as_f64(self) -> f64 {
        match self {
            Self::Fix(n) => n as f64,
            Self::Flo(f) => f,
        }
    }
}
