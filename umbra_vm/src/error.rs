//! VM error surface.
//!
//! Re-exports the shared runtime error types under the names the
//! interpreter uses.

pub use umbra_core::error::{RuntimeError, RuntimeErrorKind};

/// Result alias for VM operations.
pub type VmResult<T> = Result<T, RuntimeError>;
