//! Runtime error types.
//!
//! Every fallible runtime operation returns [`UmbraResult`]. Errors carry a
//! kind (mapping to the guest-language exception class) and a formatted
//! message. Errors from descriptors and dictionary lookups propagate
//! verbatim through the cache layer; allocation failure is fatal and aborts
//! via the global allocator's own handler.

/// Classification of a runtime error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeErrorKind {
    /// Attribute lookup failed.
    AttributeError,
    /// Operation applied to an unsuitable type.
    TypeError,
    /// Dictionary key not found.
    KeyError,
    /// Sequence index out of range.
    IndexError,
    /// Global or builtin name not found.
    NameError,
    /// Integer overflowed its representation.
    OverflowError,
}

impl RuntimeErrorKind {
    /// Guest-facing exception class name.
    pub fn name(self) -> &'static str {
        match self {
            RuntimeErrorKind::AttributeError => "AttributeError",
            RuntimeErrorKind::TypeError => "TypeError",
            RuntimeErrorKind::KeyError => "KeyError",
            RuntimeErrorKind::IndexError => "IndexError",
            RuntimeErrorKind::NameError => "NameError",
            RuntimeErrorKind::OverflowError => "OverflowError",
        }
    }
}

/// A runtime error with kind and message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    /// Error classification.
    pub kind: RuntimeErrorKind,
    /// Human-readable message.
    pub message: String,
}

impl RuntimeError {
    /// Create an error with an explicit kind and message.
    pub fn new(kind: RuntimeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// `'T' object has no attribute 'name'`.
    pub fn attribute_error(type_name: &str, attr: &str) -> Self {
        Self::new(
            RuntimeErrorKind::AttributeError,
            format!("'{type_name}' object has no attribute '{attr}'"),
        )
    }

    /// `module 'm' has no attribute 'name'`.
    pub fn module_attribute_error(module_name: &str, attr: &str) -> Self {
        Self::new(
            RuntimeErrorKind::AttributeError,
            format!("module '{module_name}' has no attribute '{attr}'"),
        )
    }

    /// Generic type error.
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::TypeError, message)
    }

    /// Missing dictionary key.
    pub fn key_error(key: &str) -> Self {
        Self::new(RuntimeErrorKind::KeyError, format!("'{key}'"))
    }

    /// Sequence index out of range.
    pub fn index_error(type_name: &str) -> Self {
        Self::new(
            RuntimeErrorKind::IndexError,
            format!("{type_name} index out of range"),
        )
    }

    /// `name 'x' is not defined`.
    pub fn name_error(name: &str) -> Self {
        Self::new(
            RuntimeErrorKind::NameError,
            format!("name '{name}' is not defined"),
        )
    }

    /// Integer too large for its destination representation.
    pub fn overflow_error(message: impl Into<String>) -> Self {
        Self::new(RuntimeErrorKind::OverflowError, message)
    }
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.name(), self.message)
    }
}

impl std::error::Error for RuntimeError {}

/// Result alias used throughout the runtime.
pub type UmbraResult<T> = Result<T, RuntimeError>;
