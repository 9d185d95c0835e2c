// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Tests for handle newtypes and the type registry.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;
use crate::types::registry::tag;

#[test]
fn handles_round_trip_indices() {
    assert_eq!(ObjRef::new(17).index(), 17);
    assert_eq!(CtxId::new(3).index(), 3);
    assert_eq!(TypeId::new(5).index(), 5);
}

#[test]
fn handle_identity() {
    assert_eq!(ObjRef::new(1), ObjRef::new(1));
    assert_ne!(ObjRef::new(1), ObjRef::new(2));
}

#[test]
fn user_type_ids_start_after_builtins() {
    assert!(!tag::PAIR.is_user());
    assert!(!tag::RECORD.is_user());
    assert!(TypeId::FIRST_USER.is_user());
    assert!(TypeId::new(100).is_user());
}

#[test]
fn registry_has_builtin_descriptors() {
    let registry = TypeRegistry::with_builtins();
    assert_eq!(registry.len(), TypeId::FIRST_USER.index() as usize);
    assert_eq!(registry.get(tag::PAIR).unwrap().name, "pair");
    assert_eq!(registry.get(tag::STRING).unwrap().name, "string");
    assert_eq!(registry.get(tag::EPHEMERON).unwrap().name, "ephemeron");
}

#[test]
fn registered_types_append_and_inherit() {
    let mut registry = TypeRegistry::with_builtins();
    let base = registry.register("base", vec!["a".to_string()], None, 0, None);
    assert_eq!(base, TypeId::FIRST_USER);

    let child = registry.register(
        "child",
        vec!["a".to_string(), "b".to_string(), "cache".to_string()],
        Some(base),
        1,
        None,
    );
    let desc = registry.get(child).unwrap();
    assert!(desc.isa(base));
    assert_eq!(desc.weak_len, 1);
    // Weak tail excluded from the equality prefix.
    assert_eq!(desc.field_eq_len, 2);
}
