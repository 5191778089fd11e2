//! Core value representation and shared infrastructure for Umbra.
//!
//! This crate provides the pieces every other Umbra crate builds on:
//!
//! - **Tagged values**: a machine-word `Value` that carries either a heap
//!   object pointer or an immediate small integer, discriminated by the low
//!   bits of the word
//! - **String interning**: pointer-equality interned names for attribute,
//!   global, and dictionary keys
//! - **Errors**: the `RuntimeError` type threaded through every fallible
//!   runtime operation

#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod intern;
pub mod value;

pub use error::{RuntimeError, RuntimeErrorKind, UmbraResult};
pub use intern::{intern, InternedString};
pub use value::Value;

/// Umbra version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
