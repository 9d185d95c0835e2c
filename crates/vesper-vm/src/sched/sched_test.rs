// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for the cooperative scheduler.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;
use crate::bytecode::{BytecodeBuilder, Opcode};
use crate::context::ContextStatus;
use crate::heap::HeapConfig;
use crate::realm::Realm;
use crate::types::CtxId;
use crate::value::Value;
use crate::value::object::ProcFlags;

fn setup() -> (Realm, CtxId) {
    let realm = Realm::new(HeapConfig {
        chunk_slots: 1024,
        initial_chunks: 1,
        max_slots: 1 << 18,
    });
    let ctx = realm.root_ctx();
    (realm, ctx)
}

fn procedure(realm: &mut Realm, ctx: CtxId, builder: BytecodeBuilder) -> Value {
    let code = realm
        .make_bytecode(ctx, builder.finish(Value::False))
        .unwrap();
    realm
        .make_procedure(ctx, code, Value::False, ProcFlags::empty(), 0)
        .unwrap()
}

#[test]
fn main_runs_to_completion() {
    let (mut realm, _root) = setup();
    let mut b = BytecodeBuilder::new();
    let lit = b.add_literal(Value::Fixnum(5));
    b.emit_op1(Opcode::Push, lit);
    b.emit(Opcode::Ret);
    let ctx = realm.root_ctx();
    let f = procedure(&mut realm, ctx, b);

    let main = spawn(&mut realm, f).unwrap();
    let result = run(&mut realm, main).unwrap();
    assert_eq!(result, Value::Fixnum(5));
    assert_eq!(realm.ctx(main).status, ContextStatus::Done);
}

#[test]
fn yielding_threads_interleave() {
    let (mut realm, root) = setup();

    // Each thread conses its tag onto a shared global list, yielding
    // between the two steps.
    let order_sym = realm.intern(root, "order").unwrap();
    realm.global_define(root, order_sym, Value::Null).unwrap();
    let cell = realm.global_cell(order_sym).unwrap();

    let recorder = |realm: &mut Realm, tag: i64| {
        let mut b = BytecodeBuilder::new();
        let tag_lit = b.add_literal(Value::Fixnum(tag));
        let cell_lit = b.add_literal(cell);
        // record tag, yield, record tag again
        for _ in 0..2 {
            b.emit_op1(Opcode::Push, cell_lit);
            b.emit_op1(Opcode::Push, tag_lit);
            b.emit_op1(Opcode::GlobalKnownRef, cell_lit);
            b.emit(Opcode::Cons);
            b.emit(Opcode::SetCdr);
            b.emit(Opcode::Drop);
            b.emit(Opcode::Yield);
            b.emit(Opcode::Drop);
        }
        let lit = b.add_literal(Value::Fixnum(0));
        b.emit_op1(Opcode::Push, lit);
        b.emit(Opcode::Ret);
        procedure(realm, root, b)
    };

    let f1 = recorder(&mut realm, 1);
    let f2 = recorder(&mut realm, 2);
    let t1 = spawn(&mut realm, f1).unwrap();
    let _t2 = spawn(&mut realm, f2).unwrap();
    run(&mut realm, t1).unwrap();

    // Let the second thread drain too.
    let order = loop {
        match crate::vm::resume(&mut realm, _t2) {
            crate::vm::RunOutcome::Done(_) => break realm.heap.cdr(cell).unwrap(),
            crate::vm::RunOutcome::Yielded => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    };

    let tags: Vec<Value> = realm.heap.list_to_vec(order).unwrap();
    // Cooperative rotation interleaves the two recorders.
    assert_eq!(tags.len(), 4);
    assert!(tags.contains(&Value::Fixnum(1)));
    assert!(tags.contains(&Value::Fixnum(2)));
}

#[test]
fn sleeping_context_wakes_after_deadline() {
    let (mut realm, root) = setup();
    let sleep_idx = realm.primitive_index("%sleep").unwrap();

    let mut b = BytecodeBuilder::new();
    let duration = b.add_literal(Value::Fixnum(0));
    let lit = b.add_literal(Value::Fixnum(9));
    b.emit_op1(Opcode::Push, duration);
    b.emit_op1(Opcode::Fcall1, sleep_idx);
    b.emit(Opcode::Drop);
    b.emit_op1(Opcode::Push, lit);
    b.emit(Opcode::Ret);
    let f = procedure(&mut realm, root, b);

    let main = spawn(&mut realm, f).unwrap();
    let result = run(&mut realm, main).unwrap();
    assert_eq!(result, Value::Fixnum(9));
}

#[test]
fn interrupt_flag_injects_exception() {
    let (mut realm, root) = setup();

    // An endless yielding loop; only the injected interrupt stops it.
    let mut b = BytecodeBuilder::new();
    b.emit(Opcode::Yield);
    b.emit(Opcode::Drop);
    b.emit(Opcode::Jump);
    let at = b.here();
    b.emit_i32(0);
    b.patch_jump(at, 0);
    let f = procedure(&mut realm, root, b);

    let main = spawn(&mut realm, f).unwrap();
    realm.ctx_mut(main).interruptp = true;
    let exn = run(&mut realm, main).unwrap_err();
    assert!(exn.is_exception());
    assert_eq!(realm.ctx(main).status, ContextStatus::Failed);
    assert!(realm.ctx(main).errorp);
}

#[test]
fn scheduler_queues() {
    let mut sched = Scheduler::new();
    assert!(!sched.has_work());

    let a = CtxId::new(1);
    let b = CtxId::new(2);
    sched.enqueue(a);
    sched.enqueue(b);
    sched.enqueue(a); // duplicates are ignored
    assert_eq!(sched.take_ready(), Some(a));
    sched.enqueue_front(b);
    assert_eq!(sched.take_ready(), Some(b));
    assert_eq!(sched.take_ready(), None);
}
