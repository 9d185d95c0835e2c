// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Runtime type descriptors.
//!
//! Every heap tag has a descriptor; record types registered at runtime
//! append to the table. Descriptors carry the information the
//! collector, structural equality, and the printer need to walk an
//! instance generically: slot names, how many leading slots take part
//! in `equal?`, how many trailing slots are weak, and an optional
//! finalizer that runs before the object's slot is returned to the
//! free list.

use crate::value::object::Obj;

use super::TypeId;

/// Fixed ids of the built-in heap tags and immediate pseudo-types.
pub mod tag {
    use super::TypeId;

    pub const PAIR: TypeId = TypeId::new(0);
    pub const VECTOR: TypeId = TypeId::new(1);
    pub const BYTES: TypeId = TypeId::new(2);
    pub const STRING: TypeId = TypeId::new(3);
    pub const SYMBOL: TypeId = TypeId::new(4);
    pub const FLONUM: TypeId = TypeId::new(5);
    pub const PORT: TypeId = TypeId::new(6);
    pub const EXCEPTION: TypeId = TypeId::new(7);
    pub const PROCEDURE: TypeId = TypeId::new(8);
    pub const BYTECODE: TypeId = TypeId::new(9);
    pub const ENV: TypeId = TypeId::new(10);
    pub const MACRO: TypeId = TypeId::new(11);
    pub const SYNCLO: TypeId = TypeId::new(12);
    pub const CONTEXT: TypeId = TypeId::new(13);
    pub const CPOINTER: TypeId = TypeId::new(14);
    pub const PROMISE: TypeId = TypeId::new(15);
    pub const EPHEMERON: TypeId = TypeId::new(16);
    pub const TYPE: TypeId = TypeId::new(17);
    pub const CONTINUATION: TypeId = TypeId::new(18);
    pub const PARAMETER: TypeId = TypeId::new(19);

    // Immediate pseudo-types, present so reflection can name every value.
    pub const FIXNUM: TypeId = TypeId::new(20);
    pub const CHAR: TypeId = TypeId::new(21);
    pub const BOOLEAN: TypeId = TypeId::new(22);
    pub const EOF: TypeId = TypeId::new(23);
    pub const CURSOR: TypeId = TypeId::new(24);
    pub const NULL: TypeId = TypeId::new(25);
    pub const VOID: TypeId = TypeId::new(26);

    /// Generic tag reported by `Value::type_tag` for record instances;
    /// the heap header carries the registered record type id.
    pub const RECORD: TypeId = TypeId::new(27);
}

/// Finalizer hook: runs during the post-sweep finalizer queue with the
/// object still addressable.
pub type Finalizer = fn(&mut Obj);

/// Descriptor of one runtime type.
pub struct TypeDesc {
    /// Id of this type (its registry index).
    pub id: TypeId,
    /// Human-readable type name, used in error messages and printing.
    pub name: String,
    /// Class-precedence list, most derived first. Always contains `id`.
    pub cpl: Vec<TypeId>,
    /// Record slot names (empty for built-in tags).
    pub slot_names: Vec<String>,
    /// Number of leading slots compared by structural equality.
    pub field_eq_len: usize,
    /// Number of trailing weak slots (zeroed when the referent dies).
    pub weak_len: usize,
    /// Finalizer to run before the object is freed, if any.
    pub finalizer: Option<Finalizer>,
}

impl TypeDesc {
    /// Whether `self` is `other` or inherits from it.
    #[must_use]
    pub fn isa(&self, other: TypeId) -> bool {
        self.cpl.contains(&other)
    }
}

/// The runtime type table.
///
/// Built-in tags occupy the fixed prefix; record types registered at
/// runtime are appended starting at [`TypeId::FIRST_USER`].
pub struct TypeRegistry {
    descs: Vec<TypeDesc>,
}

impl TypeRegistry {
    /// Create a registry pre-populated with the built-in tags.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self { descs: Vec::new() };

        let builtin_names: &[(&str, TypeId)] = &[
            ("pair", tag::PAIR),
            ("vector", tag::VECTOR),
            ("bytevector", tag::BYTES),
            ("string", tag::STRING),
            ("symbol", tag::SYMBOL),
            ("flonum", tag::FLONUM),
            ("port", tag::PORT),
            ("exception", tag::EXCEPTION),
            ("procedure", tag::PROCEDURE),
            ("bytecode", tag::BYTECODE),
            ("environment", tag::ENV),
            ("macro", tag::MACRO),
            ("syntactic-closure", tag::SYNCLO),
            ("context", tag::CONTEXT),
            ("cpointer", tag::CPOINTER),
            ("promise", tag::PROMISE),
            ("ephemeron", tag::EPHEMERON),
            ("type", tag::TYPE),
            ("continuation", tag::CONTINUATION),
            ("parameter", tag::PARAMETER),
            ("fixnum", tag::FIXNUM),
            ("char", tag::CHAR),
            ("boolean", tag::BOOLEAN),
            ("eof-object", tag::EOF),
            ("string-cursor", tag::CURSOR),
            ("null", tag::NULL),
            ("void", tag::VOID),
            ("record", tag::RECORD),
        ];

        for i in 0..TypeId::FIRST_USER.index() {
            let id = TypeId::new(i);
            let name = builtin_names
                .iter()
                .find(|(_, t)| *t == id)
                .map_or("reserved", |(n, _)| n);
            registry.descs.push(TypeDesc {
                id,
                name: name.to_string(),
                cpl: vec![id],
                slot_names: Vec::new(),
                field_eq_len: 0,
                weak_len: 0,
                finalizer: None,
            });
        }

        registry
    }

    /// Look up a descriptor. Returns `None` for ids never registered.
    #[must_use]
    pub fn get(&self, id: TypeId) -> Option<&TypeDesc> {
        self.descs.get(id.index() as usize)
    }

    /// Number of registered descriptors (built-ins included).
    #[must_use]
    pub fn len(&self) -> usize {
        self.descs.len()
    }

    /// Whether the registry is empty. Never true in practice.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.descs.is_empty()
    }

    /// Register a record type at runtime, appending to the table.
    ///
    /// `parent` extends the class-precedence list; `weak_len` trailing
    /// slots are treated as weak by the collector. The number of
    /// leading slots compared by `equal?` defaults to all slots.
    pub fn register(
        &mut self,
        name: &str,
        slot_names: Vec<String>,
        parent: Option<TypeId>,
        weak_len: usize,
        finalizer: Option<Finalizer>,
    ) -> TypeId {
        let id = TypeId::new(self.descs.len() as u32);
        let mut cpl = vec![id];
        if let Some(p) = parent
            && let Some(parent_desc) = self.get(p)
        {
            cpl.extend(parent_desc.cpl.iter().copied());
        }
        let field_eq_len = slot_names.len().saturating_sub(weak_len);
        self.descs.push(TypeDesc {
            id,
            name: name.to_string(),
            cpl,
            slot_names,
            field_eq_len,
            weak_len,
            finalizer,
        });
        id
    }
}
