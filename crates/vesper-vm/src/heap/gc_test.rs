// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for the mark-and-sweep collector.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::heap::HeapConfig;
use crate::realm::Realm;
use crate::types::CtxId;
use crate::value::Value;
use crate::value::object::ObjKind;

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
fn rooted_chain_survives_collection() {
    let (mut realm, ctx) = setup();
    const LINKS: usize = 10_000;

    let slot = realm.ctx_mut(ctx).preserve(Value::Null);
    let mut chain = Value::Null;
    for i in 0..LINKS {
        chain = realm.cons(ctx, Value::Fixnum(i as i64), chain).unwrap();
        realm.ctx_mut(ctx).update_root(slot, chain);
    }

    let stats = realm.collect();
    assert!(stats.live >= LINKS);
    assert_eq!(realm.heap.list_length(chain), Some(LINKS));
    assert_eq!(realm.heap.car(chain), Some(Value::Fixnum(LINKS as i64 - 1)));
    realm.ctx_mut(ctx).release();
}

#[test]
fn garbage_is_freed_and_space_returns() {
    let (mut realm, ctx) = setup();
    for i in 0..500 {
        realm.cons(ctx, Value::Fixnum(i), Value::Null).unwrap();
    }
    let free_before = realm.heap.free_slots();
    let stats = realm.collect();
    assert!(stats.freed >= 500);
    assert!(realm.heap.free_slots() > free_before);

    // Marks are clear outside a cycle.
    let v = realm.cons(ctx, Value::Fixnum(1), Value::Null).unwrap();
    let Value::Pair(r) = v else { panic!() };
    assert!(!realm.heap.get(r).is_marked());
}

#[test]
fn preserve_release_depth_restored() {
    let (mut realm, ctx) = setup();
    let depth = realm.ctx(ctx).root_depth();
    let v = realm.cons(ctx, Value::Fixnum(1), Value::Null).unwrap();
    realm.ctx_mut(ctx).preserve(v);
    for i in 0..100 {
        realm.cons(ctx, Value::Fixnum(i), Value::Null).unwrap();
    }
    realm.collect();
    realm.ctx_mut(ctx).release();
    assert_eq!(realm.ctx(ctx).root_depth(), depth);
}

#[test]
fn preservation_table_roots_objects() {
    let (mut realm, ctx) = setup();
    let v = realm.cons(ctx, Value::Fixnum(9), Value::Null).unwrap();
    realm.preserve_object(v);
    realm.preserve_object(v);

    realm.collect();
    assert_eq!(realm.heap.car(v), Some(Value::Fixnum(9)));

    // Refcounted: one release keeps it alive.
    realm.release_object(v);
    realm.collect();
    assert_eq!(realm.heap.car(v), Some(Value::Fixnum(9)));

    realm.release_object(v);
    let Value::Pair(r) = v else { panic!() };
    realm.collect();
    assert!(realm.heap.get_raw(r).is_free());
}

#[test]
fn ephemeron_breaks_when_key_dies() {
    let (mut realm, ctx) = setup();
    let key = realm.cons(ctx, Value::Fixnum(1), Value::Null).unwrap();
    let value = realm.cons(ctx, Value::Fixnum(2), Value::Null).unwrap();
    let eph = realm.make_ephemeron(ctx, key, value).unwrap();
    realm.preserve_object(eph);

    realm.collect();

    let Value::Ephemeron(r) = eph else { panic!() };
    let ObjKind::Ephemeron(data) = &realm.heap.get(r).kind else {
        panic!("corrupt ephemeron");
    };
    assert_eq!(data.key, Value::False);
    assert_eq!(data.value, Value::False);
}

#[test]
fn ephemeron_value_survives_while_key_lives() {
    let (mut realm, ctx) = setup();
    let key = realm.cons(ctx, Value::Fixnum(1), Value::Null).unwrap();
    let value = realm.cons(ctx, Value::Fixnum(2), Value::Null).unwrap();
    let eph = realm.make_ephemeron(ctx, key, value).unwrap();
    realm.preserve_object(eph);
    realm.preserve_object(key);

    realm.collect();

    let Value::Ephemeron(r) = eph else { panic!() };
    let ObjKind::Ephemeron(data) = &realm.heap.get(r).kind else {
        panic!("corrupt ephemeron");
    };
    assert_eq!(data.key, key);
    assert_eq!(data.value, value);
    assert_eq!(realm.heap.car(value), Some(Value::Fixnum(2)));
}

#[test]
fn record_weak_tail_is_zeroed() {
    let (mut realm, ctx) = setup();
    let ty = realm.types.register(
        "weak-box",
        vec!["strong".to_string(), "weak".to_string()],
        None,
        1,
        None,
    );
    let record = realm.make_record(ctx, ty).unwrap();
    realm.preserve_object(record);

    let strong = realm.cons(ctx, Value::Fixnum(1), Value::Null).unwrap();
    let weak = realm.cons(ctx, Value::Fixnum(2), Value::Null).unwrap();
    let Value::Record(r) = record else { panic!() };
    if let ObjKind::Record(rec) = &mut realm.heap.get_mut(r).kind {
        rec.slots[0] = strong;
        rec.slots[1] = weak;
    }

    realm.collect();

    let ObjKind::Record(rec) = &realm.heap.get(r).kind else {
        panic!("corrupt record");
    };
    // The strong slot kept its referent alive; the weak one did not.
    assert_eq!(rec.slots[0], strong);
    assert_eq!(rec.slots[1], Value::False);
}

static FINALIZED: AtomicUsize = AtomicUsize::new(0);

fn count_finalization(_addr: usize) {
    FINALIZED.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn finalizers_run_after_sweep() {
    let (mut realm, ctx) = setup();
    FINALIZED.store(0, Ordering::SeqCst);
    realm
        .make_cpointer(ctx, 7, Value::False, Some(count_finalization))
        .unwrap();

    let stats = realm.collect();
    assert_eq!(FINALIZED.load(Ordering::SeqCst), 1);
    assert!(stats.finalized >= 1);
}

#[test]
fn port_finalizer_closes_port() {
    let (mut realm, ctx) = setup();
    let port = realm
        .make_port(ctx, crate::port::PortData::string_output("doomed"))
        .unwrap();
    let Value::Port(r) = port else { panic!() };

    realm.collect();
    assert!(realm.heap.get_raw(r).is_free());
}

#[test]
fn allocation_triggers_collection_before_growth() {
    // A heap of one small chunk with garbage cycles through
    // collection rather than failing.
    let mut realm = Realm::new(HeapConfig {
        chunk_slots: 256,
        initial_chunks: 1,
        max_slots: 512,
    });
    let ctx = realm.root_ctx();
    for i in 0..2_000 {
        realm.cons(ctx, Value::Fixnum(i), Value::Null).unwrap();
    }
    assert!(realm.heap.stats().gc_count > 0);
}
