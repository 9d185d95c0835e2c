// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for the bytecode format.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;
use crate::value::Value;

#[test]
fn opcode_numbering_is_fixed() {
    // Spot checks over the normative numbering.
    assert_eq!(u8::from(Opcode::Noop), 0);
    assert_eq!(u8::from(Opcode::Raise), 1);
    assert_eq!(u8::from(Opcode::Call), 6);
    assert_eq!(u8::from(Opcode::Fcall0), 7);
    assert_eq!(u8::from(Opcode::Push), 15);
    assert_eq!(u8::from(Opcode::GlobalRef), 18);
    assert_eq!(u8::from(Opcode::VectorRef), 26);
    assert_eq!(u8::from(Opcode::StringCursorEnd), 37);
    assert_eq!(u8::from(Opcode::Car), 54);
    assert_eq!(u8::from(Opcode::Cons), 58);
    assert_eq!(u8::from(Opcode::Add), 59);
    assert_eq!(u8::from(Opcode::Eq), 68);
    assert_eq!(u8::from(Opcode::Yield), 77);
    assert_eq!(u8::from(Opcode::Ret), 79);
    assert_eq!(u8::from(Opcode::Done), 80);
    assert_eq!(u8::from(Opcode::ScLe), 83);
}

#[test]
fn opcode_byte_round_trip() {
    for byte in 0..=u8::from(Opcode::ScLe) {
        let op = Opcode::try_from(byte).unwrap();
        assert_eq!(u8::from(op), byte);
    }
    assert!(Opcode::try_from(u8::from(Opcode::ScLe) + 1).is_err());
}

#[test]
fn immediate_word_counts() {
    assert_eq!(Opcode::Noop.immediate_words(), 0);
    assert_eq!(Opcode::Push.immediate_words(), 1);
    assert_eq!(Opcode::SlotRef.immediate_words(), 2);
    assert_eq!(Opcode::Fcalln.immediate_words(), 2);
    assert_eq!(Opcode::Push.encoded_len(), 5);
}

#[test]
fn builder_emits_little_endian_immediates() {
    let mut b = BytecodeBuilder::new();
    b.emit_op1(Opcode::Push, 0x1122_3344);
    let data = b.finish(Value::False);
    assert_eq!(data.code[0], u8::from(Opcode::Push));
    assert_eq!(&data.code[1..5], &[0x44, 0x33, 0x22, 0x11]);
    assert_eq!(read_u32(&data.code, 1), 0x1122_3344);
}

#[test]
fn builder_deduplicates_literals() {
    let mut b = BytecodeBuilder::new();
    let a = b.add_literal(Value::Fixnum(7));
    let b2 = b.add_literal(Value::Fixnum(7));
    let c = b.add_literal(Value::Fixnum(8));
    assert_eq!(a, b2);
    assert_ne!(a, c);
}

#[test]
fn patch_jump_encodes_relative_displacement() {
    let mut b = BytecodeBuilder::new();
    b.emit(Opcode::Jump);
    let at = b.here();
    b.emit_i32(0);
    b.emit(Opcode::Noop);
    b.emit(Opcode::Noop);
    let target = b.here();
    b.patch_jump(at, target);
    let data = b.finish(Value::False);
    // Displacement from the end of the immediate: two NOOP bytes.
    assert_eq!(read_i32(&data.code, at), 2);
}

#[test]
fn source_map_lookup() {
    let mut b = BytecodeBuilder::new();
    b.note_source(Value::Fixnum(1));
    b.emit(Opcode::Noop);
    b.emit(Opcode::Noop);
    b.note_source(Value::Fixnum(2));
    b.emit(Opcode::Noop);
    let data = b.finish(Value::False);
    assert_eq!(data.source_at(0), Value::Fixnum(1));
    assert_eq!(data.source_at(1), Value::Fixnum(1));
    assert_eq!(data.source_at(2), Value::Fixnum(2));
}

#[test]
fn negative_jump_round_trips() {
    let mut b = BytecodeBuilder::new();
    let loop_start = b.here();
    b.emit(Opcode::Noop);
    b.emit(Opcode::Jump);
    let at = b.here();
    b.emit_i32(0);
    b.patch_jump(at, loop_start);
    let data = b.finish(Value::False);
    assert_eq!(read_i32(&data.code, at), -6);
}
