// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Crate-level smoke tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;

#[test]
fn version_is_set() {
    assert!(!VERSION.is_empty());
}

#[test]
fn realm_boots_with_defaults() {
    let realm = Realm::with_defaults();
    assert!(realm.global(GlobalSlot::OomError).is_exception());
    assert!(realm.global(GlobalSlot::QuoteSymbol).is_symbol());
    assert!(realm.global(GlobalSlot::CurrentOutput).is_port());
    assert_eq!(realm.contexts.len(), 1);
}

#[test]
fn end_to_end_read_and_inspect() {
    let mut realm = Realm::with_defaults();
    let ctx = realm.root_ctx();
    let datum = reader::read_str(&mut realm, ctx, "(define (id x) x)").unwrap();
    assert_eq!(realm.heap.list_length(datum), Some(3));
    let head = realm.heap.car(datum).unwrap();
    assert_eq!(realm.heap.symbol_name(head), Some("define"));
}

#[test]
fn read_collect_read_is_stable() {
    let mut realm = Realm::with_defaults();
    let ctx = realm.root_ctx();
    let datum = reader::read_str(&mut realm, ctx, "(1 (2 3) #(4))").unwrap();
    realm.preserve_object(datum);
    realm.collect();
    let text = value::write_value(
        &realm.heap,
        &realm.types,
        datum,
        value::WriteMode::Write,
    );
    assert_eq!(text, "(1 (2 3) #(4))");
    realm.release_object(datum);
}
