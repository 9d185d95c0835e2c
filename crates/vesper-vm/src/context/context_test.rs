// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for contexts and the root-preservation protocol.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;
use crate::types::CtxId;
use crate::value::Value;

#[test]
fn preserve_release_is_lifo() {
    let mut ctx = Context::new(CtxId::new(0));
    assert_eq!(ctx.root_depth(), 0);

    ctx.preserve(Value::Fixnum(1));
    ctx.preserve(Value::Fixnum(2));
    assert_eq!(ctx.root_depth(), 2);
    assert_eq!(ctx.saved_roots(), &[Value::Fixnum(1), Value::Fixnum(2)]);

    ctx.release();
    assert_eq!(ctx.root_depth(), 1);
    ctx.release();
    assert_eq!(ctx.root_depth(), 0);
}

#[test]
fn release_to_restores_scope_depth() {
    let mut ctx = Context::new(CtxId::new(0));
    ctx.preserve(Value::Fixnum(1));
    let depth = ctx.root_depth();
    ctx.preserve(Value::Fixnum(2));
    ctx.preserve(Value::Fixnum(3));
    ctx.release_to(depth);
    assert_eq!(ctx.root_depth(), depth);
    assert_eq!(ctx.saved_roots(), &[Value::Fixnum(1)]);
}

#[test]
fn update_root_replaces_cell() {
    let mut ctx = Context::new(CtxId::new(0));
    let slot = ctx.preserve(Value::Null);
    ctx.update_root(slot, Value::Fixnum(42));
    assert_eq!(ctx.saved_roots(), &[Value::Fixnum(42)]);
}

#[test]
fn reset_clears_execution_state() {
    let mut ctx = Context::new(CtxId::new(3));
    ctx.stack.push(Value::Fixnum(1));
    ctx.fp = 3;
    ctx.ip = 17;
    ctx.preserve(Value::Fixnum(2));
    ctx.errorp = true;
    ctx.status = ContextStatus::Failed;

    ctx.reset();
    assert!(ctx.stack.is_empty());
    assert_eq!(ctx.fp, 0);
    assert_eq!(ctx.ip, 0);
    assert_eq!(ctx.root_depth(), 0);
    assert!(!ctx.errorp);
    assert_eq!(ctx.status, ContextStatus::Ready);
    assert_eq!(ctx.id, CtxId::new(3));
}

#[test]
fn table_creates_and_reuses_slots() {
    let mut table = ContextTable::new();
    let a = table.create();
    let b = table.create();
    assert_ne!(a, b);
    assert_eq!(table.len(), 2);

    table.remove(a);
    assert_eq!(table.len(), 1);

    // The freed slot is reused.
    let c = table.create();
    assert_eq!(c, a);
    assert_eq!(table.iter().count(), 2);
}
