// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Precise, non-moving, stop-the-world mark-and-sweep collector.
//!
//! Marking uses an explicit mark stack to bound native recursion; if
//! the stack overflows, marking falls back to repeated full-heap
//! rescan passes until no new objects become reachable. Ephemerons
//! are resolved with the standard fixed-point loop after ordinary
//! marking. Weak slots whose referent did not survive are zeroed to
//! `#f`. Unreachable objects with finalizers are enqueued during the
//! sweep and finalized afterwards, while still addressable, before
//! their slots return to the free lists.

use std::collections::HashMap;
use std::time::Instant;

use tracing::debug;

use crate::context::ContextTable;
use crate::types::{ObjRef, TypeRegistry};
use crate::value::Value;
use crate::value::object::{ObjFlags, ObjKind};

use super::Heap;

/// Mark-stack segment bound; past this, marking records an overflow
/// and falls back to rescan passes.
const MARK_STACK_LIMIT: usize = 1 << 16;

/// Everything the collector treats as a root.
pub struct RootSet<'a> {
    /// The globals table (fixed well-known slots).
    pub globals: &'a [Value],
    /// Every live context: stacks, saved roots, winders, registers.
    pub contexts: &'a ContextTable,
    /// Host preservation table (object → refcount).
    pub preserved: &'a HashMap<ObjRef, usize>,
    /// Symbol-table buckets.
    pub symbols: &'a HashMap<Box<str>, Value>,
}

/// Outcome of one collection cycle.
#[derive(Clone, Copy, Debug, Default)]
pub struct SweepStats {
    /// Objects freed this cycle.
    pub freed: usize,
    /// Objects that survived this cycle.
    pub live: usize,
    /// Finalizers run this cycle.
    pub finalized: usize,
}

struct Marker {
    stack: Vec<ObjRef>,
    overflowed: bool,
    ephemerons: Vec<ObjRef>,
}

impl Marker {
    fn push(&mut self, heap: &mut Heap, r: ObjRef) {
        let obj = heap.get_mut(r);
        if obj.header.flags.contains(ObjFlags::MARKED) {
            return;
        }
        obj.header.flags.insert(ObjFlags::MARKED);
        if matches!(obj.kind, ObjKind::Ephemeron(_)) {
            self.ephemerons.push(r);
            return;
        }
        if self.stack.len() < MARK_STACK_LIMIT {
            self.stack.push(r);
        } else {
            self.overflowed = true;
        }
    }

    fn push_value(&mut self, heap: &mut Heap, v: Value) {
        if let Some(r) = v.heap_ref() {
            self.push(heap, r);
        }
    }

    /// Drain the mark stack, tracing children.
    fn drain(&mut self, heap: &mut Heap, registry: &TypeRegistry) {
        let mut buf = Vec::new();
        while let Some(r) = self.stack.pop() {
            buf.clear();
            strong_children(heap, registry, r, &mut buf);
            for &child in &buf {
                self.push_value(heap, child);
            }
        }
    }
}

/// Collect the strong children of a marked object into `buf`.
///
/// Ephemerons contribute nothing here (both slots are weak until the
/// fixed-point pass); record instances exclude their trailing weak
/// slots per the type descriptor.
fn strong_children(heap: &Heap, registry: &TypeRegistry, r: ObjRef, buf: &mut Vec<Value>) {
    match &heap.get(r).kind {
        ObjKind::Free { .. }
        | ObjKind::Bytes(_)
        | ObjKind::String(_)
        | ObjKind::Symbol(_)
        | ObjKind::Flonum(_)
        | ObjKind::Port(_)
        | ObjKind::Ephemeron(_) => {}
        ObjKind::Pair(p) => buf.extend([p.car, p.cdr, p.source]),
        ObjKind::Vector(elems) => buf.extend_from_slice(elems),
        ObjKind::Exception(e) => buf.extend([
            e.kind,
            e.message,
            e.irritants,
            e.procedure,
            e.source,
            e.stack_trace,
        ]),
        ObjKind::Procedure(p) => buf.extend([p.code, p.vars]),
        ObjKind::Bytecode(bc) => {
            buf.push(bc.name);
            buf.extend_from_slice(&bc.literals);
            buf.extend(bc.source_map.iter().map(|&(_, src)| src));
        }
        ObjKind::Env(env) => buf.extend([env.parent, env.lambda, env.bindings, env.renames]),
        ObjKind::Macro(m) => buf.extend([m.procedure, m.env, m.source]),
        ObjKind::Synclo(sc) => buf.extend([sc.env, sc.free_vars, sc.expr, sc.rename]),
        ObjKind::Record(rec) => {
            let weak_len = registry
                .get(rec.type_id)
                .map_or(0, |desc| desc.weak_len)
                .min(rec.slots.len());
            let strong_len = rec.slots.len() - weak_len;
            buf.extend_from_slice(&rec.slots[..strong_len]);
        }
        ObjKind::CPointer(cp) => buf.push(cp.parent),
        ObjKind::Promise(p) => buf.push(p.value),
        ObjKind::Continuation(k) => {
            buf.extend_from_slice(&k.stack);
            buf.extend([k.procedure, k.winders]);
        }
        ObjKind::Parameter(p) => buf.extend([p.value, p.converter]),
    }
}

/// Run one collection cycle over `heap`.
pub fn collect(heap: &mut Heap, registry: &TypeRegistry, roots: &RootSet<'_>) -> SweepStats {
    let start = Instant::now();
    let mut marker = Marker {
        stack: Vec::new(),
        overflowed: false,
        ephemerons: Vec::new(),
    };

    mark_roots(heap, registry, roots, &mut marker);

    // Mark-stack overflow: conservative restart via repeated full
    // rescans until the marked set stops growing.
    while marker.overflowed {
        marker.overflowed = false;
        rescan(heap, registry, &mut marker);
    }

    ephemeron_fixpoint(heap, registry, &mut marker);
    zero_weak_slots(heap, registry, &marker.ephemerons);

    let stats = sweep(heap, registry);

    let usecs = start.elapsed().as_micros() as u64;
    heap.stats.gc_count += 1;
    heap.stats.gc_usecs += usecs;
    heap.stats.last_swept = stats.freed;
    debug!(
        freed = stats.freed,
        live = stats.live,
        finalized = stats.finalized,
        usecs,
        "collection cycle"
    );
    stats
}

fn mark_roots(heap: &mut Heap, registry: &TypeRegistry, roots: &RootSet<'_>, marker: &mut Marker) {
    for &v in roots.globals {
        marker.push_value(heap, v);
    }
    for &v in roots.symbols.values() {
        marker.push_value(heap, v);
    }
    for (&r, &count) in roots.preserved {
        if count > 0 {
            marker.push(heap, r);
        }
    }
    for ctx in roots.contexts.iter() {
        for &v in &ctx.stack {
            marker.push_value(heap, v);
        }
        for &v in ctx.saved_roots() {
            marker.push_value(heap, v);
        }
        for v in [
            ctx.procedure,
            ctx.winders,
            ctx.parent,
            ctx.child,
            ctx.name,
            ctx.specific,
            ctx.result,
            ctx.pending_exn,
        ] {
            marker.push_value(heap, v);
        }
    }
    marker.drain(heap, registry);
}

/// Overflow fallback: walk the whole heap, pushing unmarked children
/// of marked objects, until a pass discovers nothing new.
fn rescan(heap: &mut Heap, registry: &TypeRegistry, marker: &mut Marker) {
    let mut buf = Vec::new();
    loop {
        let mut changed = false;
        let total = heap.capacity() as u32;
        for index in 0..total {
            let r = ObjRef::new(index);
            {
                let obj = heap.get_raw(r);
                if obj.is_free() || !obj.is_marked() || matches!(obj.kind, ObjKind::Ephemeron(_)) {
                    continue;
                }
            }
            buf.clear();
            strong_children(heap, registry, r, &mut buf);
            for &child in &buf {
                if let Some(cr) = child.heap_ref()
                    && !heap.get(cr).is_marked()
                {
                    changed = true;
                    marker.push(heap, cr);
                }
            }
            marker.drain(heap, registry);
        }
        if !changed {
            break;
        }
    }
}

/// Ephemeron protocol: a value slot is marked only once its key is
/// reachable by other means. Repeats until no new values surface.
fn ephemeron_fixpoint(heap: &mut Heap, registry: &TypeRegistry, marker: &mut Marker) {
    loop {
        let mut changed = false;
        for i in 0..marker.ephemerons.len() {
            let r = marker.ephemerons[i];
            let ObjKind::Ephemeron(data) = &heap.get(r).kind else {
                continue;
            };
            let data = *data;
            let key_live = match data.key.heap_ref() {
                Some(kr) => heap.get(kr).is_marked(),
                None => true, // immediate keys are always reachable
            };
            if key_live
                && let Some(vr) = data.value.heap_ref()
                && !heap.get(vr).is_marked()
            {
                marker.push(heap, vr);
                marker.drain(heap, registry);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
}

/// Zero weak slots whose referent did not survive marking: break dead
/// ephemerons and clear dead trailing weak slots of records.
fn zero_weak_slots(heap: &mut Heap, registry: &TypeRegistry, ephemerons: &[ObjRef]) {
    for &r in ephemerons {
        let ObjKind::Ephemeron(data) = &heap.get(r).kind else {
            continue;
        };
        let data = *data;
        let key_dead = data
            .key
            .heap_ref()
            .is_some_and(|kr| !heap.get(kr).is_marked());
        if key_dead {
            let ObjKind::Ephemeron(data) = &mut heap.get_mut(r).kind else {
                continue;
            };
            data.key = Value::False;
            data.value = Value::False;
        }
    }

    let total = heap.capacity() as u32;
    for index in 0..total {
        let r = ObjRef::new(index);
        let (weak_len, len) = {
            let obj = heap.get_raw(r);
            if obj.is_free() || !obj.is_marked() {
                continue;
            }
            let ObjKind::Record(rec) = &obj.kind else {
                continue;
            };
            let weak_len = registry
                .get(rec.type_id)
                .map_or(0, |desc| desc.weak_len)
                .min(rec.slots.len());
            (weak_len, rec.slots.len())
        };
        if weak_len == 0 {
            continue;
        }
        for slot in len - weak_len..len {
            let dead = {
                let ObjKind::Record(rec) = &heap.get(r).kind else {
                    continue;
                };
                rec.slots[slot]
                    .heap_ref()
                    .is_some_and(|sr| !heap.get(sr).is_marked())
            };
            if dead && let ObjKind::Record(rec) = &mut heap.get_mut(r).kind {
                rec.slots[slot] = Value::False;
            }
        }
    }
}

/// Sweep every chunk: clear marks on survivors, enqueue finalizable
/// garbage, free the rest, then run the finalizer queue and free its
/// entries. Finalizer order within a cycle is chunk-scan order and
/// must not be relied upon.
fn sweep(heap: &mut Heap, registry: &TypeRegistry) -> SweepStats {
    let mut stats = SweepStats::default();
    let mut finalize_queue: Vec<ObjRef> = Vec::new();

    let chunk_slots = heap.chunks.first().map_or(0, |c| c.slots.len());
    for chunk_idx in 0..heap.chunks.len() {
        for slot in 0..chunk_slots {
            let r = ObjRef::new((chunk_idx * chunk_slots + slot) as u32);
            let obj = &mut heap.chunks[chunk_idx].slots[slot];
            if obj.is_free() {
                continue;
            }
            if obj.is_marked() {
                obj.header.flags.remove(ObjFlags::MARKED);
                stats.live += 1;
                continue;
            }
            let registered_finalizer = registry
                .get(obj.header.type_id)
                .and_then(|desc| desc.finalizer)
                .is_some();
            if obj.needs_finalizer() || registered_finalizer {
                finalize_queue.push(r);
            } else {
                heap.free(r);
                stats.freed += 1;
            }
        }
    }

    // Finalizer queue: each finalizer runs with the object still
    // addressable, then the slot is freed.
    for r in finalize_queue {
        {
            let type_id = heap.get_raw(r).header.type_id;
            let finalizer = registry.get(type_id).and_then(|desc| desc.finalizer);
            let obj = heap.get_mut(r);
            match &mut obj.kind {
                ObjKind::Port(port) => port.close(),
                ObjKind::CPointer(cp) => {
                    if let Some(free) = cp.free.take() {
                        free(cp.addr);
                    }
                }
                _ => {}
            }
            if let Some(f) = finalizer {
                f(obj);
            }
        }
        heap.free(r);
        stats.freed += 1;
        stats.finalized += 1;
    }

    stats
}
