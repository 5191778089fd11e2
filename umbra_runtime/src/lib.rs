//! Object model for the Umbra runtime.
//!
//! This crate implements the host-side object model the interpreter and its
//! caches operate on:
//!
//! - **Objects**: manually reference-counted heap objects behind a common
//!   `#[repr(C)]` header, addressed through raw pointers
//! - **Types**: attribute namespaces with MRO lookup, descriptor
//!   classification, slot layouts, and instance dict placement
//! - **Dicts**: combined and split-key dictionaries with version tags; the
//!   split-key table is shared across instances of a class
//! - **Modules**: a name plus a versioned dict
//! - **Descriptors**: slot descriptors, properties, and functions binding
//!   to methods
//!
//! Execution is single-threaded per interpreter; reference counts and
//! object interiors use `Cell`/`RefCell` accordingly.

#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::new_without_default)]

pub mod object;
pub mod types;

pub use object::descriptor::{classify_attr, descr_get, descr_set, has_descr_get, AttrKind};
pub use object::instance::{alloc_instance, instance_dict, materialize_instance_dict};
pub use object::type_obj::{builtin_types, ClassBuilder, TypeFlags, TypeObject};
pub use object::{kind_of, type_name_of, type_of, ObjectHeader, ObjectKind};
pub use types::dict::{DictKeys, DictObject};
pub use types::scalar::{int_value, unbox_int};
