// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for the parser.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::{read, read_str};
use crate::heap::HeapConfig;
use crate::port::PortData;
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
fn read_atoms() {
    let (mut realm, ctx) = setup();
    assert_eq!(read_str(&mut realm, ctx, "42").unwrap(), Value::Fixnum(42));
    assert_eq!(read_str(&mut realm, ctx, "#t").unwrap(), Value::True);
    assert_eq!(read_str(&mut realm, ctx, "#\\a").unwrap(), Value::Char('a'));

    let f = read_str(&mut realm, ctx, "2.5").unwrap();
    assert_eq!(realm.heap.flonum(f), Some(2.5));

    let s = read_str(&mut realm, ctx, "\"hi\"").unwrap();
    assert_eq!(realm.heap.string(s).unwrap().as_str(), "hi");

    let sym = read_str(&mut realm, ctx, "foo").unwrap();
    assert_eq!(realm.heap.symbol_name(sym), Some("foo"));
}

#[test]
fn read_empty_input_is_eof() {
    let (mut realm, ctx) = setup();
    assert_eq!(read_str(&mut realm, ctx, "").unwrap(), Value::Eof);
    assert_eq!(read_str(&mut realm, ctx, "  ; just a comment").unwrap(), Value::Eof);
}

#[test]
fn read_proper_list() {
    let (mut realm, ctx) = setup();
    let v = read_str(&mut realm, ctx, "(1 2 3)").unwrap();
    assert_eq!(
        realm.heap.list_to_vec(v).unwrap(),
        vec![Value::Fixnum(1), Value::Fixnum(2), Value::Fixnum(3)]
    );
    assert_eq!(read_str(&mut realm, ctx, "()").unwrap(), Value::Null);
}

#[test]
fn read_dotted_pair() {
    // "(1 2 . 3)" -> car 1, cadr 2, cddr 3.
    let (mut realm, ctx) = setup();
    let v = read_str(&mut realm, ctx, "(1 2 . 3)").unwrap();
    assert_eq!(realm.heap.car(v), Some(Value::Fixnum(1)));
    let rest = realm.heap.cdr(v).unwrap();
    assert_eq!(realm.heap.car(rest), Some(Value::Fixnum(2)));
    assert_eq!(realm.heap.cdr(rest), Some(Value::Fixnum(3)));
}

#[test]
fn read_nested_lists() {
    let (mut realm, ctx) = setup();
    let v = read_str(&mut realm, ctx, "(1 (2 3) 4)").unwrap();
    let inner = realm.heap.list_to_vec(v).unwrap()[1];
    assert_eq!(
        realm.heap.list_to_vec(inner).unwrap(),
        vec![Value::Fixnum(2), Value::Fixnum(3)]
    );
}

#[test]
fn read_quote_forms() {
    let (mut realm, ctx) = setup();
    let cases = [
        ("'x", "quote"),
        ("`x", "quasiquote"),
        (",x", "unquote"),
        (",@x", "unquote-splicing"),
        ("#'x", "syntax"),
        ("#`x", "quasisyntax"),
        ("#,x", "unsyntax"),
        ("#,@x", "unsyntax-splicing"),
    ];
    for (input, symbol) in cases {
        let v = read_str(&mut realm, ctx, input).unwrap();
        let head = realm.heap.car(v).unwrap();
        assert_eq!(realm.heap.symbol_name(head), Some(symbol), "{input}");
        assert_eq!(realm.heap.list_length(v), Some(2), "{input}");
    }
}

#[test]
fn read_vector_and_bytevector() {
    let (mut realm, ctx) = setup();
    let v = read_str(&mut realm, ctx, "#(1 #t x)").unwrap();
    let elems = realm.heap.vector(v).unwrap();
    assert_eq!(elems.len(), 3);
    assert_eq!(elems[0], Value::Fixnum(1));
    assert_eq!(elems[1], Value::True);

    let bv = read_str(&mut realm, ctx, "#u8(0 255 32)").unwrap();
    assert_eq!(realm.heap.bytes(bv).unwrap(), &[0, 255, 32]);
}

#[test]
fn read_datum_comment_discards_datum() {
    let (mut realm, ctx) = setup();
    let v = read_str(&mut realm, ctx, "(1 #;(2 3) 4)").unwrap();
    assert_eq!(
        realm.heap.list_to_vec(v).unwrap(),
        vec![Value::Fixnum(1), Value::Fixnum(4)]
    );
}

#[test]
fn read_shared_label_cycle() {
    // "#1=(a b . #1#)": a two-element improper list whose cddr is
    // itself.
    let (mut realm, ctx) = setup();
    let v = read_str(&mut realm, ctx, "#1=(a b . #1#)").unwrap();
    assert!(v.is_pair());
    let a = realm.heap.car(v).unwrap();
    assert_eq!(realm.heap.symbol_name(a), Some("a"));
    let second = realm.heap.cdr(v).unwrap();
    let b = realm.heap.car(second).unwrap();
    assert_eq!(realm.heap.symbol_name(b), Some("b"));
    assert_eq!(realm.heap.cdr(second), Some(v));

    // Structural equality terminates via shared-structure detection.
    assert!(crate::value::equal(&realm.heap, &realm.types, v, v));
}

#[test]
fn read_shared_label_in_vector() {
    let (mut realm, ctx) = setup();
    let v = read_str(&mut realm, ctx, "#0=#(1 #0#)").unwrap();
    let elems = realm.heap.vector(v).unwrap();
    assert_eq!(elems[0], Value::Fixnum(1));
    assert_eq!(elems[1], v);
}

#[test]
fn read_forward_label_reference() {
    let (mut realm, ctx) = setup();
    let v = read_str(&mut realm, ctx, "(#1=5 #1#)").unwrap();
    assert_eq!(
        realm.heap.list_to_vec(v).unwrap(),
        vec![Value::Fixnum(5), Value::Fixnum(5)]
    );
}

#[test]
fn read_errors_are_read_exceptions() {
    let (mut realm, ctx) = setup();
    for input in [")", "(1 2", "(1 . 2 3)", "#2#", "\"open"] {
        let exn = read_str(&mut realm, ctx, input).unwrap_err();
        let Value::Exception(r) = exn else {
            panic!("expected an exception for {input}");
        };
        let ObjKind::Exception(e) = &realm.heap.get(r).kind else {
            panic!("corrupt exception");
        };
        assert_eq!(realm.heap.symbol_name(e.kind), Some("read"), "{input}");
    }
}

#[test]
fn read_error_carries_port_line() {
    let (mut realm, ctx) = setup();
    let port = realm
        .make_port(ctx, PortData::string_input("test.scm", "1\n2\n(3"))
        .unwrap();
    read(&mut realm, ctx, port).unwrap();
    read(&mut realm, ctx, port).unwrap();
    let exn = read(&mut realm, ctx, port).unwrap_err();
    let Value::Exception(r) = exn else { panic!() };
    let ObjKind::Exception(e) = &realm.heap.get(r).kind else {
        panic!()
    };
    let (name, line) = {
        let pair = realm.heap.pair(e.source).unwrap();
        (pair.car, pair.cdr)
    };
    assert_eq!(realm.heap.string(name).unwrap().as_str(), "test.scm");
    assert_eq!(line, Value::Fixnum(3));
}

#[test]
fn read_consecutive_data_from_one_port() {
    let (mut realm, ctx) = setup();
    let port = realm
        .make_port(ctx, PortData::string_input("stream", "1 (2) three"))
        .unwrap();
    assert_eq!(read(&mut realm, ctx, port).unwrap(), Value::Fixnum(1));
    let second = read(&mut realm, ctx, port).unwrap();
    assert_eq!(realm.heap.list_length(second), Some(1));
    let third = read(&mut realm, ctx, port).unwrap();
    assert_eq!(realm.heap.symbol_name(third), Some("three"));
    assert_eq!(read(&mut realm, ctx, port).unwrap(), Value::Eof);
}

#[test]
fn write_read_round_trip() {
    use crate::value::printer::{WriteMode, write_value};

    let (mut realm, ctx) = setup();
    let samples = [
        "42",
        "-7",
        "3.5",
        "#t",
        "#f",
        "()",
        "(1 2 3)",
        "(1 2 . 3)",
        "(a (b \"c\") #\\d)",
        "#(1 #t \"x\")",
        "#u8(1 2 3)",
    ];
    for input in samples {
        let v = read_str(&mut realm, ctx, input).unwrap();
        let text = write_value(&realm.heap, &realm.types, v, WriteMode::Write);
        let back = read_str(&mut realm, ctx, &text).unwrap();
        assert!(
            crate::value::equal(&realm.heap, &realm.types, v, back),
            "round trip failed: {input} -> {text}"
        );
    }
}
