//! Tagged value word.
//!
//! A `Value` is a single machine word that carries either a pointer to a
//! heap object or an immediate small integer. The low three bits form the
//! tag:
//!
//! ```text
//! Tag  | Meaning             | Encoding
//! -----|---------------------|----------------------------------
//! 0    | heap object pointer | the pointer itself (8-byte aligned)
//! 1    | small integer       | value << 3 | 1  (signed 61-bit)
//! 2..7 | reserved (floats)   | never produced
//! ```
//!
//! The all-zero word is the null value. Null is object-tagged, so
//! `is_object` holds for it; use [`Value::is_null`] to distinguish.
//!
//! Encoding and decoding are pure bit operations. Reference counts are
//! tracked only for the heap-object case; `incref`/`decref` on an integer
//! word are no-ops.
//!
//! # Layout contract
//!
//! Refcount operations assume every heap object begins with its reference
//! count as a `Cell<usize>` first word. The runtime's object header
//! guarantees this with a compile-time assertion on field order.

use std::cell::Cell;
use std::sync::OnceLock;

/// Mask covering the tag bits.
pub const TAG_MASK: u64 = 0b111;

/// Tag value for heap object pointers.
pub const TAG_OBJECT: u64 = 0;

/// Tag value for immediate integers.
pub const TAG_INT: u64 = 1;

/// Number of bits occupied by the tag.
pub const TAG_BITS: u32 = 3;

/// Smallest integer representable as an immediate.
pub const SMALL_INT_MIN: i64 = -(1 << 60);

/// Largest integer representable as an immediate.
pub const SMALL_INT_MAX: i64 = (1 << 60) - 1;

/// Deallocation hook invoked when an object's reference count reaches zero.
///
/// Installed once by the runtime crate; the value layer itself has no
/// knowledge of concrete object layouts.
pub type DeallocFn = unsafe fn(*mut ());

static DEALLOC: OnceLock<DeallocFn> = OnceLock::new();

/// Install the object deallocation hook. Later calls are ignored.
pub fn register_dealloc(f: DeallocFn) {
    let _ = DEALLOC.set(f);
}

/// A tagged machine word: heap object pointer or immediate integer.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Value(u64);

impl Value {
    /// The null value: the all-zero word.
    #[inline(always)]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Raw bit pattern.
    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Reconstruct from a raw bit pattern.
    #[inline(always)]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    // =========================================================================
    // Classification
    // =========================================================================

    /// Check for the null word.
    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check for an immediate integer.
    #[inline(always)]
    pub const fn is_int(self) -> bool {
        self.0 & TAG_MASK == TAG_INT
    }

    /// Check for a heap object pointer (including null).
    #[inline(always)]
    pub const fn is_object(self) -> bool {
        self.0 & TAG_MASK == TAG_OBJECT
    }

    // =========================================================================
    // Integers
    // =========================================================================

    /// Encode an immediate integer. The argument must be within
    /// [`SMALL_INT_MIN`]..=[`SMALL_INT_MAX`]; out-of-range integers must be
    /// boxed as heap objects instead.
    #[inline(always)]
    pub fn from_int(value: i64) -> Self {
        debug_assert!(
            (SMALL_INT_MIN..=SMALL_INT_MAX).contains(&value),
            "immediate integer out of range: {value}"
        );
        Self(((value << TAG_BITS) as u64) | TAG_INT)
    }

    /// Checked immediate encoding; `None` when the integer needs boxing.
    #[inline]
    pub fn int(value: i64) -> Option<Self> {
        if (SMALL_INT_MIN..=SMALL_INT_MAX).contains(&value) {
            Some(Self::from_int(value))
        } else {
            None
        }
    }

    /// Decode an immediate integer. Sign extension falls out of the
    /// arithmetic shift.
    #[inline(always)]
    pub fn as_int(self) -> i64 {
        debug_assert!(self.is_int());
        (self.0 as i64) >> TAG_BITS
    }

    // =========================================================================
    // Objects
    // =========================================================================

    /// Encode a heap object pointer. Requires 8-byte alignment so the tag
    /// bits of the address are zero; a null pointer encodes the null value.
    #[inline(always)]
    pub fn from_object<T>(ptr: *mut T) -> Self {
        let addr = ptr as u64;
        debug_assert!(addr & TAG_MASK == 0, "unaligned object pointer");
        Self(addr)
    }

    /// Decode a heap object pointer. Null for the null value.
    #[inline(always)]
    pub fn as_object(self) -> *mut () {
        debug_assert!(self.is_object());
        self.0 as *mut ()
    }

    /// Decode as a pointer to a concrete object type.
    ///
    /// # Safety
    ///
    /// The word must be object-tagged and actually point at a `T` (or be
    /// null).
    #[inline(always)]
    pub unsafe fn as_object_ptr<T>(self) -> *mut T {
        debug_assert!(self.is_object());
        self.0 as *mut T
    }

    // =========================================================================
    // Reference counting
    // =========================================================================

    /// Increment the reference count. No-op for integers and null.
    #[inline]
    pub fn incref(self) {
        if self.is_object() && !self.is_null() {
            // First word of every heap object is the refcount.
            let count = unsafe { &*(self.0 as *const Cell<usize>) };
            count.set(count.get() + 1);
        }
    }

    /// Decrement the reference count, deallocating at zero. No-op for
    /// integers and null.
    #[inline]
    pub fn decref(self) {
        if self.is_object() && !self.is_null() {
            let count = unsafe { &*(self.0 as *const Cell<usize>) };
            let n = count.get();
            debug_assert!(n > 0, "refcount underflow");
            if n == 1 {
                let dealloc = DEALLOC
                    .get()
                    .expect("object deallocation hook not installed");
                unsafe { dealloc(self.0 as *mut ()) };
            } else {
                count.set(n - 1);
            }
        }
    }

    /// Replace a slot with null, releasing the previous contents.
    #[inline]
    pub fn clear(slot: &mut Value) {
        let old = *slot;
        if !old.is_null() {
            *slot = Value::null();
            old.decref();
        }
    }

    /// Current reference count of an object word; `None` for non-objects
    /// and null.
    #[inline]
    pub fn refcount(self) -> Option<usize> {
        if self.is_object() && !self.is_null() {
            let count = unsafe { &*(self.0 as *const Cell<usize>) };
            Some(count.get())
        } else {
            None
        }
    }
}

impl Default for Value {
    #[inline]
    fn default() -> Self {
        Self::null()
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "Null")
        } else if self.is_int() {
            write!(f, "Int({})", self.as_int())
        } else {
            write!(f, "Object({:#x})", self.0)
        }
    }
}
