//! Global string interning.
//!
//! Attribute names, global names, and dictionary keys are interned so that
//! equality is a pointer comparison and hashing is a pointer hash. The
//! interner is process-wide and append-only.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::{Arc, OnceLock};

/// An interned string with pointer-equality semantics.
///
/// Two `InternedString`s produced by [`intern`] compare equal iff they are
/// the same string, and the comparison is a single pointer compare.
#[derive(Clone)]
pub struct InternedString(Arc<str>);

impl InternedString {
    /// The string contents.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Stable address identifying this interned string.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.0.as_ptr()
    }
}

impl PartialEq for InternedString {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for InternedString {}

impl std::hash::Hash for InternedString {
    #[inline]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as *const u8 as usize).hash(state);
    }
}

impl std::ops::Deref for InternedString {
    type Target = str;

    #[inline]
    fn deref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for InternedString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl std::fmt::Display for InternedString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide interner table.
struct Interner {
    strings: RwLock<FxHashMap<Box<str>, Arc<str>>>,
}

static INTERNER: OnceLock<Interner> = OnceLock::new();

fn interner() -> &'static Interner {
    INTERNER.get_or_init(|| Interner {
        strings: RwLock::new(FxHashMap::default()),
    })
}

/// Intern a string, returning the canonical shared copy.
pub fn intern(s: &str) -> InternedString {
    let table = interner();

    if let Some(existing) = table.strings.read().get(s) {
        return InternedString(Arc::clone(existing));
    }

    let mut strings = table.strings.write();
    // Re-check under the write lock; another caller may have won the race.
    if let Some(existing) = strings.get(s) {
        return InternedString(Arc::clone(existing));
    }
    let shared: Arc<str> = Arc::from(s);
    strings.insert(Box::from(s), Arc::clone(&shared));
    InternedString(shared)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_same_pointer() {
        let a = intern("attribute_name");
        let b = intern("attribute_name");
        assert_eq!(a, b);
        assert_eq!(a.as_ptr(), b.as_ptr());
    }

    #[test]
    fn test_intern_distinct() {
        let a = intern("foo");
        let b = intern("bar");
        assert_ne!(a, b);
        assert_eq!(a.as_str(), "foo");
        assert_eq!(b.as_str(), "bar");
    }

    #[test]
    fn test_intern_hash_consistency() {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let a = intern("hash_me");
        let b = intern("hash_me");
        let mut ha = DefaultHasher::new();
        let mut hb = DefaultHasher::new();
        a.hash(&mut ha);
        b.hash(&mut hb);
        assert_eq!(ha.finish(), hb.finish());
    }

    #[test]
    fn test_intern_empty_string() {
        let a = intern("");
        let b = intern("");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "");
    }
}
