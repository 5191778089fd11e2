//! Shadow-code inline caching for the Umbra bytecode interpreter.
//!
//! This crate accelerates the dynamic opcodes (`LOAD_ATTR`,
//! `LOAD_METHOD`, `STORE_ATTR`, `LOAD_GLOBAL`, `BINARY_SUBSCR`) by
//! observing what each site resolves against and rewriting it into a
//! specialized opcode backed by a per-site cache entry:
//!
//! - **Bytecode**: two-byte units; the generic opcodes are cache-aware
//!   and the specialized ones carry a cache-table index in their operand
//! - **Shadow arena**: per-code-object rewritable bytecode copy plus the
//!   typed cache tables ([`shadow::ShadowCode`])
//! - **Entry kinds**: nine instance storage shapes, module entries,
//!   global entries, polymorphic arrays ([`shadow::entries`])
//! - **Dispatcher**: classifies an observed (owner, name) pair, builds or
//!   reuses an entry, and patches the site
//! - **Fast paths**: guard-then-load handlers per specialized opcode
//! - **Invalidation**: type mutations eagerly poison dependent entries;
//!   module and split-dict drift is caught lazily by version and identity
//!   guards ([`shadow::invalidate`])
//!
//! Execution is single-threaded per interpreter instance; fast paths and
//! bytecode rewrites take no locks.
//!
//! # Example
//!
//! ```ignore
//! use umbra_vm::{bytecode::*, shadow};
//!
//! let code = CodeObject::new(name, units, names, consts);
//! let mut arena = shadow::init_shadow(&code);
//! // First execution specializes the site; later ones hit the cache.
//! let value = shadow::load_attr(&mut arena, ip, owner, &attr)?;
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::new_without_default)]

pub mod bytecode;
pub mod error;
pub mod shadow;

pub use bytecode::{CodeObject, CodeUnit, Opcode};
pub use error::{RuntimeError, RuntimeErrorKind, VmResult};
pub use shadow::{
    binary_subscr, cache_cast_type, cache_field, cast, clear_shadow, init_shadow, load_attr,
    load_field, load_global, load_method, on_type_modified, reset_stats, stats, store_attr,
    store_field, ShadowCode,
};
