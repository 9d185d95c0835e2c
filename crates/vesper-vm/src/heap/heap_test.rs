// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for the chunked heap allocator.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;
use crate::value::Value;
use crate::value::object::{ObjKind, PairData};

fn small_heap() -> Heap {
    Heap::new(HeapConfig {
        chunk_slots: 8,
        initial_chunks: 1,
        max_slots: 32,
    })
}

fn pair(car: Value, cdr: Value) -> ObjKind {
    ObjKind::Pair(PairData {
        car,
        cdr,
        source: Value::False,
    })
}

#[test]
fn allocate_writes_header_and_payload() {
    let mut heap = small_heap();
    let r = heap
        .allocate(pair(Value::Fixnum(1), Value::Fixnum(2)))
        .unwrap();
    let obj = heap.get(r);
    assert!(!obj.is_free());
    assert!(!obj.is_marked());
    assert_eq!(heap.car(Value::Pair(r)), Some(Value::Fixnum(1)));
    assert_eq!(heap.cdr(Value::Pair(r)), Some(Value::Fixnum(2)));
    assert_eq!(heap.live(), 1);
}

#[test]
fn exhaustion_returns_payload() {
    let mut heap = small_heap();
    for _ in 0..8 {
        heap.allocate(pair(Value::Null, Value::Null)).unwrap();
    }
    assert!(heap.allocate(pair(Value::Null, Value::Null)).is_err());
}

#[test]
fn grow_links_new_chunk() {
    let mut heap = small_heap();
    for _ in 0..8 {
        heap.allocate(pair(Value::Null, Value::Null)).unwrap();
    }
    assert!(heap.try_grow());
    assert_eq!(heap.capacity(), 16);
    assert!(heap.allocate(pair(Value::Null, Value::Null)).is_ok());
}

#[test]
fn grow_refused_at_max() {
    let mut heap = small_heap();
    assert!(heap.try_grow());
    assert!(heap.try_grow());
    assert!(heap.try_grow());
    // 4 chunks of 8 = max 32.
    assert!(!heap.try_grow());
}

#[test]
fn freed_slot_is_flagged_and_reused() {
    let mut heap = small_heap();
    let r = heap
        .allocate(pair(Value::Fixnum(1), Value::Null))
        .unwrap();
    heap.free(r);
    assert!(heap.get_raw(r).is_free());
    assert_eq!(heap.live(), 0);
    assert_eq!(heap.free_slots(), 8);

    // First-fit hands the slot back.
    let r2 = heap
        .allocate(pair(Value::Fixnum(2), Value::Null))
        .unwrap();
    assert_eq!(r, r2);
}

#[test]
fn list_helpers() {
    let mut heap = small_heap();
    // (1 2)
    let tail = heap.allocate(pair(Value::Fixnum(2), Value::Null)).unwrap();
    let head = heap
        .allocate(pair(Value::Fixnum(1), Value::Pair(tail)))
        .unwrap();
    let list = Value::Pair(head);
    assert_eq!(heap.list_length(list), Some(2));
    assert_eq!(
        heap.list_to_vec(list),
        Some(vec![Value::Fixnum(1), Value::Fixnum(2)])
    );

    // Improper list has no length.
    let dotted = heap
        .allocate(pair(Value::Fixnum(1), Value::Fixnum(2)))
        .unwrap();
    assert_eq!(heap.list_length(Value::Pair(dotted)), None);

    // A cycle terminates the scan.
    let cyc = heap.allocate(pair(Value::Fixnum(1), Value::Null)).unwrap();
    if let ObjKind::Pair(p) = &mut heap.get_mut(cyc).kind {
        p.cdr = Value::Pair(cyc);
    }
    assert_eq!(heap.list_length(Value::Pair(cyc)), None);
}
