// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Execution contexts and the root-preservation protocol.
//!
//! A context is the first-class execution state of one green thread:
//! its value stack, frame and instruction pointers, current procedure,
//! dynamic-wind stack, thread links and flags, the green-thread refuel
//! counter, and the saved-root stack host code uses to keep values
//! alive across allocation points.
//!
//! Root preservation contract: any host path that allocates between
//! uses of a value must [`Context::preserve`] it first and
//! [`Context::release`] on every exit path, in LIFO order. The
//! collector walks the saved-root stack of every live context.

#[cfg(test)]
mod context_test;

use crate::types::CtxId;
use crate::value::Value;

/// Opcodes executed before a context must offer to yield.
pub const DEFAULT_REFUEL: i64 = 4096;

/// Hard bound on a context's value-stack depth. Exceeding it raises
/// the pre-allocated `out-of-stack` exception.
pub const MAX_STACK_DEPTH: usize = 1 << 16;

/// Scheduling state of a context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextStatus {
    /// Runnable, waiting for a scheduler slot.
    Ready,
    /// Currently executing.
    Running,
    /// Parked on a file descriptor.
    Blocked,
    /// Parked until a deadline.
    Sleeping,
    /// Finished with a result.
    Done,
    /// Finished with an uncaught exception.
    Failed,
}

/// One green thread's execution state.
pub struct Context {
    /// This context's id in the context table.
    pub id: CtxId,
    /// Value stack; grows upward.
    pub stack: Vec<Value>,
    /// Frame pointer: index just above the current frame marker.
    pub fp: usize,
    /// Instruction pointer into the current procedure's bytecode.
    pub ip: usize,
    /// Currently executing procedure, `#f` at the top level.
    pub procedure: Value,
    /// Saved-root stack (LIFO), walked by the collector.
    saves: Vec<Value>,
    /// Dynamic-wind stack: list of `(before . after)` pairs.
    pub winders: Value,
    /// Parent context value or `#f`.
    pub parent: Value,
    /// Most recently spawned child or `#f`.
    pub child: Value,
    /// Thread name or `#f`.
    pub name: Value,
    /// Thread-specific slot.
    pub specific: Value,
    /// Final result once `status` is `Done`.
    pub result: Value,
    /// Exception injected by the scheduler, raised at next dispatch.
    /// `Void` when none is pending.
    pub pending_exn: Value,
    /// Opcodes left before the next yield checkpoint.
    pub refuel: i64,
    /// A timeout fired for this context.
    pub timeoutp: bool,
    /// The context is in a wait set.
    pub waitp: bool,
    /// The context terminated with an error.
    pub errorp: bool,
    /// An interrupt was requested.
    pub interruptp: bool,
    /// Tracing requested for this context.
    pub tracep: bool,
    /// Scheduling state.
    pub status: ContextStatus,
}

impl Context {
    /// Create a fresh context.
    #[must_use]
    pub fn new(id: CtxId) -> Self {
        Self {
            id,
            stack: Vec::new(),
            fp: 0,
            ip: 0,
            procedure: Value::False,
            saves: Vec::new(),
            winders: Value::Null,
            parent: Value::False,
            child: Value::False,
            name: Value::False,
            specific: Value::Void,
            result: Value::Void,
            pending_exn: Value::Void,
            refuel: DEFAULT_REFUEL,
            timeoutp: false,
            waitp: false,
            errorp: false,
            interruptp: false,
            tracep: false,
            status: ContextStatus::Ready,
        }
    }

    /// Register a value on the saved-root stack. Returns the depth
    /// before registration, usable with [`Context::release_to`].
    pub fn preserve(&mut self, v: Value) -> usize {
        let depth = self.saves.len();
        self.saves.push(v);
        depth
    }

    /// Deregister the most recent saved root.
    ///
    /// Calls must pair with [`Context::preserve`] in LIFO order.
    pub fn release(&mut self) {
        debug_assert!(!self.saves.is_empty(), "release without preserve");
        self.saves.pop();
    }

    /// Deregister saved roots down to `depth` (an earlier
    /// [`Context::preserve`] return value). Restores the chain on all
    /// exit paths of a scope at once.
    pub fn release_to(&mut self, depth: usize) {
        debug_assert!(depth <= self.saves.len());
        self.saves.truncate(depth);
    }

    /// Current saved-root depth.
    #[inline]
    #[must_use]
    pub fn root_depth(&self) -> usize {
        self.saves.len()
    }

    /// The saved-root stack, for the collector's root walk.
    #[inline]
    #[must_use]
    pub fn saved_roots(&self) -> &[Value] {
        &self.saves
    }

    /// Replace the saved root at `depth` (for hosts that must update a
    /// preserved cell in place after an allocation).
    pub fn update_root(&mut self, depth: usize, v: Value) {
        self.saves[depth] = v;
    }

    /// Reset execution state for reuse as a fresh thread.
    pub fn reset(&mut self) {
        self.stack.clear();
        self.fp = 0;
        self.ip = 0;
        self.procedure = Value::False;
        self.saves.clear();
        self.winders = Value::Null;
        self.result = Value::Void;
        self.pending_exn = Value::Void;
        self.refuel = DEFAULT_REFUEL;
        self.timeoutp = false;
        self.waitp = false;
        self.errorp = false;
        self.interruptp = false;
        self.status = ContextStatus::Ready;
    }
}

/// Table of live contexts.
///
/// Every entry is a collector root; slots free up when a context is
/// removed after it completes and nothing references it anymore.
#[derive(Default)]
pub struct ContextTable {
    entries: Vec<Option<Context>>,
}

impl ContextTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh context and return its id.
    pub fn create(&mut self) -> CtxId {
        if let Some(index) = self.entries.iter().position(Option::is_none) {
            let id = CtxId::new(index as u32);
            self.entries[index] = Some(Context::new(id));
            return id;
        }
        let id = CtxId::new(self.entries.len() as u32);
        self.entries.push(Some(Context::new(id)));
        id
    }

    /// Borrow a context.
    ///
    /// # Panics
    ///
    /// Panics if the id does not denote a live context; context ids
    /// are only minted by [`ContextTable::create`].
    #[must_use]
    pub fn get(&self, id: CtxId) -> &Context {
        self.entries[id.index() as usize]
            .as_ref()
            .unwrap_or_else(|| panic!("dead context {id:?}"))
    }

    /// Mutably borrow a context.
    ///
    /// # Panics
    ///
    /// Panics if the id does not denote a live context.
    #[must_use]
    pub fn get_mut(&mut self, id: CtxId) -> &mut Context {
        self.entries[id.index() as usize]
            .as_mut()
            .unwrap_or_else(|| panic!("dead context {id:?}"))
    }

    /// Remove a completed context from the table.
    pub fn remove(&mut self, id: CtxId) {
        self.entries[id.index() as usize] = None;
    }

    /// Iterate over live contexts.
    pub fn iter(&self) -> impl Iterator<Item = &Context> {
        self.entries.iter().filter_map(Option::as_ref)
    }

    /// Number of live contexts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    /// Whether no contexts are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
