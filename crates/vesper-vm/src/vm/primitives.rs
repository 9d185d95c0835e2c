// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Core foreign primitives, installed at realm construction.
//!
//! Primitives dispatch through the `FCALL` opcodes by table index.
//! They receive their arguments as a slice (still rooted on the
//! caller's stack) and return a [`PrimResult`]; raising a trampoline
//! exception bounces a packaged call back through the interpreter.

use crate::realm::{GlobalSlot, PrimResult, Primitive, Realm};
use crate::types::CtxId;
use crate::value::object::ObjKind;
use crate::value::printer::{WriteMode, write_value};
use crate::value::Value;

/// Register the core primitive set.
pub fn install(realm: &mut Realm) {
    let prims: &[Primitive] = &[
        Primitive {
            name: "display",
            arity: 1,
            variadic: true,
            func: prim_display,
        },
        Primitive {
            name: "write",
            arity: 1,
            variadic: true,
            func: prim_write,
        },
        Primitive {
            name: "newline",
            arity: 0,
            variadic: true,
            func: prim_newline,
        },
        Primitive {
            name: "list",
            arity: 0,
            variadic: true,
            func: prim_list,
        },
        Primitive {
            name: "apply",
            arity: 2,
            variadic: false,
            func: prim_apply,
        },
        Primitive {
            name: "current-input-port",
            arity: 0,
            variadic: false,
            func: prim_current_input,
        },
        Primitive {
            name: "current-output-port",
            arity: 0,
            variadic: false,
            func: prim_current_output,
        },
        Primitive {
            name: "%sleep",
            arity: 1,
            variadic: false,
            func: prim_sleep,
        },
        Primitive {
            name: "%dynamic-wind",
            arity: 3,
            variadic: false,
            func: prim_dynamic_wind,
        },
    ];
    for &prim in prims {
        realm.register_primitive(prim);
    }
}

fn output_port(realm: &Realm, args: &[Value], at: usize) -> Value {
    args.get(at)
        .copied()
        .unwrap_or_else(|| realm.global(GlobalSlot::CurrentOutput))
}

fn write_to_port(realm: &mut Realm, ctx: CtxId, port: Value, text: &str) -> PrimResult {
    let Value::Port(r) = port else {
        return PrimResult::Raise(
            realm
                .type_error(ctx, "port", port)
                .unwrap_or_else(|_| realm.global(GlobalSlot::OomError)),
        );
    };
    let result = match &mut realm.heap.get_mut(r).kind {
        ObjKind::Port(p) => p.write_str(text),
        _ => Ok(()),
    };
    match result {
        Ok(()) => PrimResult::Value(Value::Void),
        Err(e) => PrimResult::Raise(
            realm
                .make_exception_simple(ctx, "file", &e.to_string())
                .unwrap_or_else(|_| realm.global(GlobalSlot::OomError)),
        ),
    }
}

fn prim_display(realm: &mut Realm, ctx: CtxId, args: &[Value]) -> PrimResult {
    let text = write_value(&realm.heap, &realm.types, args[0], WriteMode::Display);
    let port = output_port(realm, args, 1);
    write_to_port(realm, ctx, port, &text)
}

fn prim_write(realm: &mut Realm, ctx: CtxId, args: &[Value]) -> PrimResult {
    let text = write_value(&realm.heap, &realm.types, args[0], WriteMode::Write);
    let port = output_port(realm, args, 1);
    write_to_port(realm, ctx, port, &text)
}

fn prim_newline(realm: &mut Realm, ctx: CtxId, args: &[Value]) -> PrimResult {
    let port = output_port(realm, args, 0);
    write_to_port(realm, ctx, port, "\n")
}

fn prim_list(realm: &mut Realm, ctx: CtxId, args: &[Value]) -> PrimResult {
    match realm.list(ctx, args) {
        Ok(v) => PrimResult::Value(v),
        Err(_) => PrimResult::Raise(realm.global(GlobalSlot::OomError)),
    }
}

/// `(apply proc args)` bounces through the interpreter as a
/// trampoline so the call runs on the VM stack rather than the host
/// stack.
fn prim_apply(realm: &mut Realm, ctx: CtxId, args: &[Value]) -> PrimResult {
    match realm.make_trampoline(ctx, args[0], args[1]) {
        Ok(exn) => PrimResult::Raise(exn),
        Err(_) => PrimResult::Raise(realm.global(GlobalSlot::OomError)),
    }
}

fn prim_current_input(realm: &mut Realm, _ctx: CtxId, _args: &[Value]) -> PrimResult {
    PrimResult::Value(realm.global(GlobalSlot::CurrentInput))
}

fn prim_current_output(realm: &mut Realm, _ctx: CtxId, _args: &[Value]) -> PrimResult {
    PrimResult::Value(realm.global(GlobalSlot::CurrentOutput))
}

fn prim_sleep(realm: &mut Realm, ctx: CtxId, args: &[Value]) -> PrimResult {
    let seconds = match args[0] {
        Value::Fixnum(n) => n as f64,
        v @ Value::Flonum(_) => realm.heap.flonum(v).unwrap_or(0.0),
        v => {
            return PrimResult::Raise(
                realm
                    .type_error(ctx, "number", v)
                    .unwrap_or_else(|_| realm.global(GlobalSlot::OomError)),
            );
        }
    };
    PrimResult::Sleep(super::sleep_duration(seconds))
}

/// `(dynamic-wind before thunk after)`.
///
/// The winder pair is pushed while the thunk runs so continuations
/// captured inside see it; `after` runs on both the normal and the
/// raising path.
fn prim_dynamic_wind(realm: &mut Realm, ctx: CtxId, args: &[Value]) -> PrimResult {
    let (before, thunk, after) = (args[0], args[1], args[2]);

    if let Err(exn) = super::apply(realm, ctx, before, &[]) {
        return PrimResult::Raise(exn);
    }

    let winder = match realm.cons(ctx, before, after) {
        Ok(v) => v,
        Err(_) => return PrimResult::Raise(realm.global(GlobalSlot::OomError)),
    };
    let winders = realm.ctx(ctx).winders;
    let winders = match realm.cons(ctx, winder, winders) {
        Ok(v) => v,
        Err(_) => return PrimResult::Raise(realm.global(GlobalSlot::OomError)),
    };
    realm.ctx_mut(ctx).winders = winders;

    let result = super::apply(realm, ctx, thunk, &[]);

    let rest = realm
        .heap
        .cdr(realm.ctx(ctx).winders)
        .unwrap_or(Value::Null);
    realm.ctx_mut(ctx).winders = rest;

    let after_result = super::apply(realm, ctx, after, &[]);

    match (result, after_result) {
        (Ok(v), Ok(_)) => PrimResult::Value(v),
        (Err(exn), _) | (_, Err(exn)) => PrimResult::Raise(exn),
    }
}
