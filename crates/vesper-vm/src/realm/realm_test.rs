// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for realm bootstrap, interning, and the globals table.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;
use crate::heap::HeapConfig;
use crate::types::CtxId;
use crate::value::Value;

fn setup() -> (Realm, CtxId) {
    let realm = Realm::new(HeapConfig {
        chunk_slots: 1024,
        initial_chunks: 1,
        max_slots: 1 << 18,
    });
    let ctx = realm.root_ctx();
    (realm, ctx)
}

#[test]
fn bootstrap_interns_quote_family() {
    let (realm, _ctx) = setup();
    let quote = realm.global(GlobalSlot::QuoteSymbol);
    assert!(quote.is_symbol());
    assert_eq!(realm.heap.symbol_name(quote), Some("quote"));
    assert!(realm.global(GlobalSlot::UnquoteSplicingSymbol).is_symbol());
}

#[test]
fn bootstrap_preallocates_fatal_exceptions() {
    let (realm, _ctx) = setup();
    assert!(realm.global(GlobalSlot::OomError).is_exception());
    assert!(realm.global(GlobalSlot::StackOverflowError).is_exception());
}

#[test]
fn interning_returns_identical_symbols() {
    let (mut realm, ctx) = setup();
    let a = realm.intern(ctx, "widget").unwrap();
    let b = realm.intern(ctx, "widget").unwrap();
    let c = realm.intern(ctx, "gadget").unwrap();
    assert_eq!(a, b);
    assert_ne!(a, c);
}

#[test]
fn interned_symbols_survive_collection() {
    let (mut realm, ctx) = setup();
    let sym = realm.intern(ctx, "persistent").unwrap();
    realm.collect();
    assert_eq!(realm.heap.symbol_name(sym), Some("persistent"));
    // Interning again finds the same object.
    assert_eq!(realm.intern(ctx, "persistent").unwrap(), sym);
}

#[test]
fn global_define_and_lookup() {
    let (mut realm, ctx) = setup();
    let sym = realm.intern(ctx, "x").unwrap();
    assert!(realm.global_cell(sym).is_none());

    realm.global_define(ctx, sym, Value::Fixnum(10)).unwrap();
    let cell = realm.global_cell(sym).unwrap();
    assert_eq!(realm.heap.cdr(cell), Some(Value::Fixnum(10)));

    // Redefinition updates the same cell.
    realm.global_define(ctx, sym, Value::Fixnum(20)).unwrap();
    assert_eq!(realm.global_cell(sym), Some(cell));
    assert_eq!(realm.heap.cdr(cell), Some(Value::Fixnum(20)));
}

#[test]
fn list_builders() {
    let (mut realm, ctx) = setup();
    let elems = [Value::Fixnum(1), Value::Fixnum(2), Value::Fixnum(3)];
    let list = realm.list(ctx, &elems).unwrap();
    assert_eq!(realm.heap.list_length(list), Some(3));
    assert_eq!(realm.heap.list_to_vec(list).unwrap(), elems.to_vec());

    let dotted = realm
        .list_star(ctx, &elems[..2], Value::Fixnum(3))
        .unwrap();
    assert_eq!(realm.heap.list_length(dotted), None);
    let second = realm.heap.cdr(dotted).unwrap();
    assert_eq!(realm.heap.cdr(second), Some(Value::Fixnum(3)));
}

#[test]
fn trampoline_detection() {
    let (mut realm, ctx) = setup();
    let args = realm.list(ctx, &[Value::Fixnum(1)]).unwrap();
    let tramp = realm.make_trampoline(ctx, Value::False, args).unwrap();
    assert!(realm.is_trampoline(tramp));

    let plain = realm
        .make_exception_simple(ctx, "user", "plain")
        .unwrap();
    assert!(!realm.is_trampoline(plain));
}

#[test]
fn module_path_is_a_string_list() {
    let (realm, _ctx) = setup();
    let path = realm.global(GlobalSlot::ModulePath);
    // Either empty or a proper list of strings.
    let mut cur = path;
    while cur.is_pair() {
        let head = realm.heap.car(cur).unwrap();
        assert!(head.is_string());
        cur = realm.heap.cdr(cur).unwrap();
    }
    assert!(cur.is_null());
}

#[test]
fn type_registry_registers_records() {
    let (mut realm, _ctx) = setup();
    let base = realm
        .types
        .register("shape", vec!["area".to_string()], None, 0, None);
    let derived = realm.types.register(
        "circle",
        vec!["area".to_string(), "radius".to_string()],
        Some(base),
        0,
        None,
    );
    let desc = realm.types.get(derived).unwrap();
    assert!(desc.isa(base));
    assert!(desc.isa(derived));
    assert!(!realm.types.get(base).unwrap().isa(derived));
}
