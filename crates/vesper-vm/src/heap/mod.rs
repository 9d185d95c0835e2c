// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Heap manager for the Vesper runtime.
//!
//! The heap is a list of fixed-capacity chunks of object slots. Each
//! chunk threads an intrusive free list through its freed slots.
//! Allocation is first-fit over the chunk list; when every chunk is
//! exhausted the caller is expected to collect and retry, then to
//! grow the heap (bounded by `max_slots`), and finally to surface the
//! pre-allocated out-of-memory exception.
//!
//! The heap is non-moving: an [`ObjRef`] stays valid until the
//! collector frees the object.

#[cfg(test)]
mod heap_test;

#[cfg(test)]
mod gc_test;

pub mod gc;

use tracing::debug;

use crate::types::ObjRef;
use crate::value::object::{HEADER_MAGIC, Obj, ObjFlags, ObjKind, PairData, StringData};
use crate::value::Value;

/// Default number of object slots per chunk.
pub const DEFAULT_CHUNK_SLOTS: usize = 4096;

/// Default maximum heap size in slots.
pub const DEFAULT_MAX_SLOTS: usize = 1 << 20;

/// Heap sizing parameters.
#[derive(Clone, Copy, Debug)]
pub struct HeapConfig {
    /// Slots per chunk.
    pub chunk_slots: usize,
    /// Chunks allocated up front.
    pub initial_chunks: usize,
    /// Upper bound on total slots; growth past this is refused.
    pub max_slots: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            chunk_slots: DEFAULT_CHUNK_SLOTS,
            initial_chunks: 2,
            max_slots: DEFAULT_MAX_SLOTS,
        }
    }
}

/// Collection and allocation accounting, updated per cycle.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapStats {
    /// Completed collection cycles.
    pub gc_count: u64,
    /// Total microseconds spent collecting.
    pub gc_usecs: u64,
    /// Objects allocated over the heap's lifetime.
    pub total_allocated: u64,
    /// Objects freed by the last sweep.
    pub last_swept: usize,
}

/// One fixed-capacity run of object slots.
pub(crate) struct Chunk {
    pub(crate) slots: Vec<Obj>,
    /// Head of the intrusive free list (slot index within the chunk).
    pub(crate) free_head: Option<u32>,
    /// Number of slots on the free list.
    pub(crate) free_count: usize,
}

impl Chunk {
    fn new(slots: usize) -> Self {
        let mut chunk = Self {
            slots: Vec::with_capacity(slots),
            free_head: Some(0),
            free_count: slots,
        };
        for i in 0..slots {
            let next = if i + 1 < slots {
                Some(i as u32 + 1)
            } else {
                None
            };
            let mut obj = Obj::new(ObjKind::Free { next });
            obj.header.flags.insert(ObjFlags::FREED);
            chunk.slots.push(obj);
        }
        chunk
    }

    /// Take the first slot off the free list.
    fn take_free(&mut self) -> Option<u32> {
        let head = self.free_head?;
        let ObjKind::Free { next } = self.slots[head as usize].kind else {
            // Free-list corruption; treat the chunk as full.
            self.free_head = None;
            return None;
        };
        self.free_head = next;
        self.free_count -= 1;
        Some(head)
    }

    /// Return a slot to the free list.
    fn release(&mut self, index: u32) {
        let obj = &mut self.slots[index as usize];
        obj.kind = ObjKind::Free {
            next: self.free_head,
        };
        obj.header.flags = ObjFlags::FREED;
        self.free_head = Some(index);
        self.free_count += 1;
    }
}

/// The object heap.
pub struct Heap {
    pub(crate) chunks: Vec<Chunk>,
    chunk_slots: usize,
    max_slots: usize,
    live: usize,
    pub(crate) stats: HeapStats,
}

impl Heap {
    /// Create a heap with the given sizing.
    #[must_use]
    pub fn new(config: HeapConfig) -> Self {
        let chunks = (0..config.initial_chunks.max(1))
            .map(|_| Chunk::new(config.chunk_slots))
            .collect();
        Self {
            chunks,
            chunk_slots: config.chunk_slots,
            max_slots: config.max_slots,
            live: 0,
            stats: HeapStats::default(),
        }
    }

    /// Number of live objects.
    #[inline]
    #[must_use]
    pub const fn live(&self) -> usize {
        self.live
    }

    /// Total slot capacity across all chunks.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.chunks.len() * self.chunk_slots
    }

    /// Free slots across all chunks.
    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.chunks.iter().map(|c| c.free_count).sum()
    }

    /// Collection accounting.
    #[inline]
    #[must_use]
    pub const fn stats(&self) -> &HeapStats {
        &self.stats
    }

    /// Allocate a slot for `kind`, writing a fresh header.
    ///
    /// First-fit over the chunk list. When every chunk is exhausted
    /// the payload is handed back so the caller can collect or grow
    /// and retry.
    ///
    /// # Errors
    ///
    /// Returns the payload unchanged when no free slot exists.
    pub fn allocate(&mut self, kind: ObjKind) -> Result<ObjRef, ObjKind> {
        for (chunk_idx, chunk) in self.chunks.iter_mut().enumerate() {
            if let Some(slot) = chunk.take_free() {
                let obj = &mut chunk.slots[slot as usize];
                *obj = Obj::new(kind);
                self.live += 1;
                self.stats.total_allocated += 1;
                return Ok(ObjRef::new((chunk_idx * self.chunk_slots) as u32 + slot));
            }
        }
        Err(kind)
    }

    /// Link in one more chunk, if the configured maximum allows.
    pub fn try_grow(&mut self) -> bool {
        if self.capacity() + self.chunk_slots > self.max_slots {
            return false;
        }
        self.chunks.push(Chunk::new(self.chunk_slots));
        debug!(
            capacity = self.capacity(),
            chunks = self.chunks.len(),
            "heap grown"
        );
        true
    }

    /// Return an object's slot to its chunk's free list.
    ///
    /// Used by the collector after finalization.
    pub(crate) fn free(&mut self, r: ObjRef) {
        let (chunk, slot) = self.split(r);
        self.chunks[chunk].release(slot);
        self.live -= 1;
    }

    #[inline]
    fn split(&self, r: ObjRef) -> (usize, u32) {
        let index = r.index() as usize;
        (index / self.chunk_slots, (index % self.chunk_slots) as u32)
    }

    /// Borrow an object.
    #[inline]
    #[must_use]
    pub fn get(&self, r: ObjRef) -> &Obj {
        let (chunk, slot) = self.split(r);
        let obj = &self.chunks[chunk].slots[slot as usize];
        debug_assert_eq!(obj.header.magic, HEADER_MAGIC);
        debug_assert!(!obj.is_free(), "access to freed object {r:?}");
        obj
    }

    /// Mutably borrow an object.
    #[inline]
    #[must_use]
    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        let (chunk, slot) = self.split(r);
        let obj = &mut self.chunks[chunk].slots[slot as usize];
        debug_assert_eq!(obj.header.magic, HEADER_MAGIC);
        obj
    }

    /// Borrow a slot without liveness checks. Collector-internal: the
    /// sweep walks freed slots too.
    #[inline]
    #[must_use]
    pub(crate) fn get_raw(&self, r: ObjRef) -> &Obj {
        let (chunk, slot) = self.split(r);
        &self.chunks[chunk].slots[slot as usize]
    }

    // --- Typed accessors -------------------------------------------------

    /// View a value as a pair.
    #[must_use]
    pub fn pair(&self, v: Value) -> Option<&PairData> {
        let Value::Pair(r) = v else { return None };
        match &self.get(r).kind {
            ObjKind::Pair(data) => Some(data),
            _ => None,
        }
    }

    /// Mutably view a value as a pair.
    pub fn pair_mut(&mut self, v: Value) -> Option<&mut PairData> {
        let Value::Pair(r) = v else { return None };
        match &mut self.get_mut(r).kind {
            ObjKind::Pair(data) => Some(data),
            _ => None,
        }
    }

    /// The car of a pair.
    #[must_use]
    pub fn car(&self, v: Value) -> Option<Value> {
        self.pair(v).map(|p| p.car)
    }

    /// The cdr of a pair.
    #[must_use]
    pub fn cdr(&self, v: Value) -> Option<Value> {
        self.pair(v).map(|p| p.cdr)
    }

    /// View a value as a vector.
    #[must_use]
    pub fn vector(&self, v: Value) -> Option<&[Value]> {
        let Value::Vector(r) = v else { return None };
        match &self.get(r).kind {
            ObjKind::Vector(elems) => Some(elems),
            _ => None,
        }
    }

    /// Mutably view a value as a vector.
    pub fn vector_mut(&mut self, v: Value) -> Option<&mut Vec<Value>> {
        let Value::Vector(r) = v else { return None };
        match &mut self.get_mut(r).kind {
            ObjKind::Vector(elems) => Some(elems),
            _ => None,
        }
    }

    /// View a value as a bytevector.
    #[must_use]
    pub fn bytes(&self, v: Value) -> Option<&[u8]> {
        let Value::Bytes(r) = v else { return None };
        match &self.get(r).kind {
            ObjKind::Bytes(data) => Some(data),
            _ => None,
        }
    }

    /// Mutably view a value as a bytevector.
    pub fn bytes_mut(&mut self, v: Value) -> Option<&mut Vec<u8>> {
        let Value::Bytes(r) = v else { return None };
        match &mut self.get_mut(r).kind {
            ObjKind::Bytes(data) => Some(data),
            _ => None,
        }
    }

    /// View a value as a string payload.
    #[must_use]
    pub fn string(&self, v: Value) -> Option<&StringData> {
        let Value::String(r) = v else { return None };
        match &self.get(r).kind {
            ObjKind::String(data) => Some(data),
            _ => None,
        }
    }

    /// Mutably view a value as a string payload.
    pub fn string_mut(&mut self, v: Value) -> Option<&mut StringData> {
        let Value::String(r) = v else { return None };
        match &mut self.get_mut(r).kind {
            ObjKind::String(data) => Some(data),
            _ => None,
        }
    }

    /// The name of a symbol.
    #[must_use]
    pub fn symbol_name(&self, v: Value) -> Option<&str> {
        let Value::Symbol(r) = v else { return None };
        match &self.get(r).kind {
            ObjKind::Symbol(name) => Some(name),
            _ => None,
        }
    }

    /// The value of a boxed flonum.
    #[must_use]
    pub fn flonum(&self, v: Value) -> Option<f64> {
        let Value::Flonum(r) = v else { return None };
        match &self.get(r).kind {
            ObjKind::Flonum(f) => Some(*f),
            _ => None,
        }
    }

    // --- List helpers ----------------------------------------------------

    /// Length of a proper list, `None` for improper or cyclic lists.
    ///
    /// Uses the tortoise-and-hare scan so cyclic structures terminate.
    #[must_use]
    pub fn list_length(&self, v: Value) -> Option<usize> {
        let mut slow = v;
        let mut fast = v;
        let mut len = 0usize;
        loop {
            match fast {
                Value::Null => return Some(len),
                Value::Pair(_) => {
                    fast = self.cdr(fast)?;
                    len += 1;
                    match fast {
                        Value::Null => return Some(len),
                        Value::Pair(_) => {
                            fast = self.cdr(fast)?;
                            len += 1;
                            slow = self.cdr(slow)?;
                            if slow == fast {
                                return None; // cycle
                            }
                        }
                        _ => return None,
                    }
                }
                _ => return None,
            }
        }
    }

    /// Collect a proper list's elements into a `Vec`.
    #[must_use]
    pub fn list_to_vec(&self, v: Value) -> Option<Vec<Value>> {
        let len = self.list_length(v)?;
        let mut out = Vec::with_capacity(len);
        let mut cur = v;
        while let Value::Pair(_) = cur {
            out.push(self.car(cur)?);
            cur = self.cdr(cur)?;
        }
        Some(out)
    }
}
