// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Identity and structural equality.
//!
//! `eq?` is plain value identity (`==` on [`Value`]). `eqv?` adds
//! numeric equality for boxed flonums. `equal?` descends structurally,
//! terminating on cyclic structure by treating any revisited pair of
//! objects as equal, and compares record instances over the leading
//! slot prefix their type descriptor declares.

use std::collections::HashSet;

use crate::heap::Heap;
use crate::types::{ObjRef, TypeRegistry};

use super::Value;
use super::object::ObjKind;

/// `eqv?`: identity, plus value equality for flonums.
#[must_use]
pub fn eqv(heap: &Heap, a: Value, b: Value) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (Value::Flonum(_), Value::Flonum(_)) => {
            heap.flonum(a).is_some_and(|x| heap.flonum(b) == Some(x))
        }
        _ => false,
    }
}

/// `equal?`: structural equality with shared-structure termination.
#[must_use]
pub fn equal(heap: &Heap, types: &TypeRegistry, a: Value, b: Value) -> bool {
    let mut visited: HashSet<(ObjRef, ObjRef)> = HashSet::new();
    equal_rec(heap, types, a, b, &mut visited)
}

fn equal_rec(
    heap: &Heap,
    types: &TypeRegistry,
    a: Value,
    b: Value,
    visited: &mut HashSet<(ObjRef, ObjRef)>,
) -> bool {
    if eqv(heap, a, b) {
        return true;
    }
    let (Some(ra), Some(rb)) = (a.heap_ref(), b.heap_ref()) else {
        return false;
    };
    // A revisited pair of nodes means the structures agree on this
    // path; cycles terminate here.
    if !visited.insert((ra, rb)) {
        return true;
    }
    match (&heap.get(ra).kind, &heap.get(rb).kind) {
        (ObjKind::Pair(pa), ObjKind::Pair(pb)) => {
            let (ca, da) = (pa.car, pa.cdr);
            let (cb, db) = (pb.car, pb.cdr);
            equal_rec(heap, types, ca, cb, visited) && equal_rec(heap, types, da, db, visited)
        }
        (ObjKind::Vector(va), ObjKind::Vector(vb)) => {
            if va.len() != vb.len() {
                return false;
            }
            let (va, vb) = (va.clone(), vb.clone());
            va.iter()
                .zip(vb.iter())
                .all(|(&x, &y)| equal_rec(heap, types, x, y, visited))
        }
        (ObjKind::String(sa), ObjKind::String(sb)) => sa.bytes == sb.bytes,
        (ObjKind::Bytes(ba), ObjKind::Bytes(bb)) => ba == bb,
        (ObjKind::Record(rec_a), ObjKind::Record(rec_b)) => {
            if rec_a.type_id != rec_b.type_id {
                return false;
            }
            let eq_len = types
                .get(rec_a.type_id)
                .map_or(rec_a.slots.len(), |desc| desc.field_eq_len)
                .min(rec_a.slots.len())
                .min(rec_b.slots.len());
            let (sa, sb) = (rec_a.slots.clone(), rec_b.slots.clone());
            sa.iter()
                .take(eq_len)
                .zip(sb.iter())
                .all(|(&x, &y)| equal_rec(heap, types, x, y, visited))
        }
        _ => false,
    }
}
