// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! # Vesper VM
//!
//! Embeddable Scheme (R7RS-leaning) core runtime.
//!
//! This crate provides:
//! - A uniform tagged value representation over a non-moving heap
//! - A precise mark-and-sweep collector with ephemerons, weak slots,
//!   and finalizers
//! - An S-expression reader with datum labels and shared structure
//! - A stack-based bytecode VM with tail calls, first-class
//!   continuations, exceptions, and trampolines
//! - A cooperative green-thread scheduler over one OS thread
//! - A buffered port layer over descriptors, memory, and custom
//!   callbacks
//!
//! The front-end compiler, module loader, and standard library are
//! external collaborators: they produce bytecode objects and consume
//! the reader and VM through [`Realm`].
//!
//! ```
//! use vesper_vm::{Realm, reader};
//!
//! let mut realm = Realm::with_defaults();
//! let ctx = realm.root_ctx();
//! let datum = reader::read_str(&mut realm, ctx, "(1 2 . 3)").unwrap();
//! assert!(datum.is_pair());
//! ```

pub mod bytecode;
pub mod config;
pub mod context;
pub mod heap;
pub mod port;
pub mod reader;
pub mod realm;
pub mod sched;
pub mod types;
pub mod value;
pub mod vm;

// Re-export commonly used types at the crate root.
pub use context::{Context, ContextStatus};
pub use heap::{Heap, HeapConfig};
pub use realm::{GlobalSlot, Realm};
pub use types::{CtxId, ObjRef, TypeId};
pub use value::Value;

/// Crate version.
pub const VERSION: &str = match option_env!("VESPER_VERSION") {
    Some(v) => v,
    None => env!("CARGO_PKG_VERSION"),
};

#[cfg(test)]
mod lib_test;
