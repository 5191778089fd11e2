//! Dictionaries with combined and split-key storage.
//!
//! A dict stores interned-name keys in one of two layouts:
//!
//! - **Combined**: an ordinary hash map of name → value
//! - **Split**: the keys live in a [`DictKeys`] table *shared across all
//!   dicts of the same class*; this dict holds only a values array indexed
//!   by key slot
//!
//! Split storage is what instance dicts use: every instance of a class
//! that assigns attributes in the same order shares one keys table, and a
//! cache that has validated the keys table identity can read an attribute
//! with a single indexed load.
//!
//! Every mutation stamps the dict with a fresh value from a process-wide
//! version counter; module and global caches compare these tags.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;

use umbra_core::{InternedString, UmbraResult, Value};

use crate::object::type_obj::builtin_types;
use crate::object::{alloc, ObjectHeader, ObjectKind};

// =============================================================================
// Version tags
// =============================================================================

static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

#[inline]
fn next_version() -> u64 {
    NEXT_VERSION.fetch_add(1, Ordering::Relaxed)
}

// =============================================================================
// Shared keys table
// =============================================================================

struct KeysInner {
    order: Vec<InternedString>,
    index: FxHashMap<InternedString, u32>,
}

/// A shared, append-only table of dict keys.
///
/// The table's address is its identity: caches compare it by pointer, and
/// mark a remembered table by setting the low bit of the address (a
/// "poisoned" pointer that is never dereferenced).
pub struct DictKeys {
    inner: RwLock<KeysInner>,
}

impl DictKeys {
    /// Create an empty keys table.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(KeysInner {
                order: Vec::new(),
                index: FxHashMap::default(),
            }),
        }
    }

    /// Number of keys in the table. Grows monotonically.
    #[inline]
    pub fn nentries(&self) -> usize {
        self.inner.read().expect("keys table lock poisoned").order.len()
    }

    /// Slot of a key, if present.
    #[inline]
    pub fn split_index(&self, name: &InternedString) -> Option<u32> {
        self.inner
            .read()
            .expect("keys table lock poisoned")
            .index
            .get(name)
            .copied()
    }

    /// Slot of a key, appending it if absent.
    pub fn add(&self, name: &InternedString) -> u32 {
        let mut inner = self.inner.write().expect("keys table lock poisoned");
        if let Some(&idx) = inner.index.get(name) {
            return idx;
        }
        let idx = inner.order.len() as u32;
        inner.order.push(name.clone());
        inner.index.insert(name.clone(), idx);
        idx
    }

    /// Key stored at a slot.
    pub fn key_at(&self, idx: usize) -> Option<InternedString> {
        self.inner
            .read()
            .expect("keys table lock poisoned")
            .order
            .get(idx)
            .cloned()
    }
}

/// Stable identity address of a shared keys table.
#[inline]
pub fn keys_address(keys: &Arc<DictKeys>) -> usize {
    Arc::as_ptr(keys) as usize
}

// =============================================================================
// Dict object
// =============================================================================

enum DictStorage {
    Combined(FxHashMap<InternedString, Value>),
    Split {
        keys: Arc<DictKeys>,
        values: Vec<Value>,
    },
}

/// A dictionary object.
#[repr(C)]
pub struct DictObject {
    /// Object header.
    pub header: ObjectHeader,
    storage: RefCell<DictStorage>,
    version: Cell<u64>,
    used: Cell<usize>,
}

impl DictObject {
    /// Allocate an empty combined dict.
    pub fn alloc_combined() -> Value {
        let builtins = builtin_types();
        Value::from_object(builtins.dict_type).incref();
        alloc(DictObject {
            header: ObjectHeader::new(ObjectKind::Dict, builtins.dict_type),
            storage: RefCell::new(DictStorage::Combined(FxHashMap::default())),
            version: Cell::new(next_version()),
            used: Cell::new(0),
        })
    }

    /// Allocate an empty split dict over a shared keys table.
    pub fn alloc_split(keys: Arc<DictKeys>) -> Value {
        let builtins = builtin_types();
        Value::from_object(builtins.dict_type).incref();
        alloc(DictObject {
            header: ObjectHeader::new(ObjectKind::Dict, builtins.dict_type),
            storage: RefCell::new(DictStorage::Split {
                keys,
                values: Vec::new(),
            }),
            version: Cell::new(next_version()),
            used: Cell::new(0),
        })
    }

    /// Current version tag. Changes on every mutation.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.get()
    }

    #[inline]
    fn bump_version(&self) {
        self.version.set(next_version());
    }

    /// Number of set entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.used.get()
    }

    /// Check for an empty dict.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.used.get() == 0
    }

    /// Check for split-key storage.
    #[inline]
    pub fn is_split(&self) -> bool {
        matches!(&*self.storage.borrow(), DictStorage::Split { .. })
    }

    /// Identity address of the shared keys table; zero for combined dicts.
    #[inline]
    pub fn keys_address(&self) -> usize {
        match &*self.storage.borrow() {
            DictStorage::Split { keys, .. } => keys_address(keys),
            DictStorage::Combined(_) => 0,
        }
    }

    /// The shared keys table, if split.
    pub fn keys_arc(&self) -> Option<Arc<DictKeys>> {
        match &*self.storage.borrow() {
            DictStorage::Split { keys, .. } => Some(Arc::clone(keys)),
            DictStorage::Combined(_) => None,
        }
    }

    /// Number of entries in the shared keys table; zero for combined dicts.
    #[inline]
    pub fn keys_nentries(&self) -> usize {
        match &*self.storage.borrow() {
            DictStorage::Split { keys, .. } => keys.nentries(),
            DictStorage::Combined(_) => 0,
        }
    }

    /// Look up a name. Returns a borrowed value.
    pub fn get(&self, name: &InternedString) -> Option<Value> {
        match &*self.storage.borrow() {
            DictStorage::Combined(map) => map.get(name).copied(),
            DictStorage::Split { keys, values } => {
                let idx = keys.split_index(name)? as usize;
                match values.get(idx) {
                    Some(v) if !v.is_null() => Some(*v),
                    _ => None,
                }
            }
        }
    }

    /// Look up a name with error signaling.
    ///
    /// Interned-name lookups cannot run user code today; the `Result`
    /// channel is the contract for hosts whose key comparison can.
    #[inline]
    pub fn get_with_error(&self, name: &InternedString) -> UmbraResult<Option<Value>> {
        Ok(self.get(name))
    }

    /// Bind a name, retaining the value.
    ///
    /// Split dicts append previously unseen names to the shared keys table
    /// so sibling instances keep their indexed layout.
    pub fn set(&self, name: &InternedString, value: Value) {
        value.incref();
        let mut storage = self.storage.borrow_mut();
        match &mut *storage {
            DictStorage::Combined(map) => {
                let old = map.insert(name.clone(), value);
                match old {
                    Some(old) => old.decref(),
                    None => self.used.set(self.used.get() + 1),
                }
            }
            DictStorage::Split { keys, values } => {
                let idx = keys.add(name) as usize;
                if values.len() <= idx {
                    values.resize(idx + 1, Value::null());
                }
                let old = std::mem::replace(&mut values[idx], value);
                if old.is_null() {
                    self.used.set(self.used.get() + 1);
                } else {
                    old.decref();
                }
            }
        }
        drop(storage);
        self.bump_version();
    }

    /// Value stored at a split slot; null when unset or out of range.
    ///
    /// Only meaningful for split dicts.
    #[inline]
    pub fn split_value(&self, idx: usize) -> Value {
        match &*self.storage.borrow() {
            DictStorage::Split { values, .. } => values.get(idx).copied().unwrap_or(Value::null()),
            DictStorage::Combined(_) => Value::null(),
        }
    }

    /// Store directly into a split slot, retaining the value.
    ///
    /// Returns false (and stores nothing) if the dict is not split.
    pub fn split_set(&self, idx: usize, value: Value) -> bool {
        let mut storage = self.storage.borrow_mut();
        match &mut *storage {
            DictStorage::Split { values, .. } => {
                if values.len() <= idx {
                    values.resize(idx + 1, Value::null());
                }
                value.incref();
                let old = std::mem::replace(&mut values[idx], value);
                if old.is_null() {
                    self.used.set(self.used.get() + 1);
                } else {
                    old.decref();
                }
                drop(storage);
                self.bump_version();
                true
            }
            DictStorage::Combined(_) => false,
        }
    }

    /// Remove a name. Split dicts convert to combined storage first:
    /// deletion punches a hole the shared layout cannot express.
    pub fn delete(&self, name: &InternedString) -> bool {
        self.make_combined();
        let mut storage = self.storage.borrow_mut();
        let DictStorage::Combined(map) = &mut *storage else {
            unreachable!("dict not combined after conversion");
        };
        match map.remove(name) {
            Some(old) => {
                old.decref();
                self.used.set(self.used.get() - 1);
                drop(storage);
                self.bump_version();
                true
            }
            None => false,
        }
    }

    /// Convert split storage to combined storage. No-op for combined
    /// dicts. The keys-table identity observed by caches disappears, so
    /// the version is bumped.
    pub fn make_combined(&self) {
        let mut storage = self.storage.borrow_mut();
        let converted = match &mut *storage {
            DictStorage::Split { keys, values } => {
                let mut map = FxHashMap::default();
                for (idx, value) in values.drain(..).enumerate() {
                    if value.is_null() {
                        continue;
                    }
                    let name = keys.key_at(idx).expect("split value without key");
                    map.insert(name, value);
                }
                Some(map)
            }
            DictStorage::Combined(_) => None,
        };
        if let Some(map) = converted {
            *storage = DictStorage::Combined(map);
            drop(storage);
            self.bump_version();
        }
    }

    /// Snapshot of the entries, in unspecified order. Values are borrowed.
    pub fn items(&self) -> Vec<(InternedString, Value)> {
        match &*self.storage.borrow() {
            DictStorage::Combined(map) => map.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            DictStorage::Split { keys, values } => values
                .iter()
                .enumerate()
                .filter(|(_, v)| !v.is_null())
                .map(|(i, v)| (keys.key_at(i).expect("split value without key"), *v))
                .collect(),
        }
    }
}

impl Drop for DictObject {
    fn drop(&mut self) {
        match &mut *self.storage.borrow_mut() {
            DictStorage::Combined(map) => {
                for (_, v) in map.drain() {
                    v.decref();
                }
            }
            DictStorage::Split { values, .. } => {
                for v in values.drain(..) {
                    v.decref();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_core::intern;

    fn dict_ref<'a>(v: Value) -> &'a DictObject {
        unsafe { crate::object::object_ref::<DictObject>(v) }
    }

    #[test]
    fn test_combined_set_get_delete() {
        let d = DictObject::alloc_combined();
        let dict = dict_ref(d);
        let k = intern("answer");

        assert!(dict.get(&k).is_none());
        dict.set(&k, Value::from_int(42));
        assert_eq!(dict.get(&k).unwrap().as_int(), 42);
        assert_eq!(dict.len(), 1);

        assert!(dict.delete(&k));
        assert!(dict.get(&k).is_none());
        assert!(!dict.delete(&k));
        d.decref();
    }

    #[test]
    fn test_version_bumps_on_mutation() {
        let d = DictObject::alloc_combined();
        let dict = dict_ref(d);
        let v0 = dict.version();

        dict.set(&intern("a"), Value::from_int(1));
        let v1 = dict.version();
        assert!(v1 > v0);

        dict.set(&intern("a"), Value::from_int(2));
        assert!(dict.version() > v1);
        d.decref();
    }

    #[test]
    fn test_version_stable_across_reads() {
        let d = DictObject::alloc_combined();
        let dict = dict_ref(d);
        dict.set(&intern("k"), Value::from_int(1));
        let v = dict.version();
        for _ in 0..100 {
            let _ = dict.get(&intern("k"));
        }
        assert_eq!(dict.version(), v);
        d.decref();
    }

    #[test]
    fn test_split_shares_keys() {
        let keys = Arc::new(DictKeys::new());
        let d1 = DictObject::alloc_split(Arc::clone(&keys));
        let d2 = DictObject::alloc_split(Arc::clone(&keys));
        let a = dict_ref(d1);
        let b = dict_ref(d2);

        a.set(&intern("x"), Value::from_int(1));
        assert_eq!(keys.nentries(), 1);
        // b sees the key slot but holds no value for it.
        assert!(b.get(&intern("x")).is_none());

        b.set(&intern("x"), Value::from_int(2));
        assert_eq!(keys.nentries(), 1);
        assert_eq!(a.get(&intern("x")).unwrap().as_int(), 1);
        assert_eq!(b.get(&intern("x")).unwrap().as_int(), 2);
        d1.decref();
        d2.decref();
    }

    #[test]
    fn test_split_index_and_direct_slot_access() {
        let keys = Arc::new(DictKeys::new());
        let d = DictObject::alloc_split(Arc::clone(&keys));
        let dict = dict_ref(d);

        dict.set(&intern("first"), Value::from_int(10));
        dict.set(&intern("second"), Value::from_int(20));

        let idx = keys.split_index(&intern("second")).unwrap() as usize;
        assert_eq!(dict.split_value(idx).as_int(), 20);

        assert!(dict.split_set(idx, Value::from_int(21)));
        assert_eq!(dict.get(&intern("second")).unwrap().as_int(), 21);
        d.decref();
    }

    #[test]
    fn test_delete_converts_split_to_combined() {
        let keys = Arc::new(DictKeys::new());
        let d = DictObject::alloc_split(Arc::clone(&keys));
        let dict = dict_ref(d);

        dict.set(&intern("x"), Value::from_int(1));
        dict.set(&intern("y"), Value::from_int(2));
        assert!(dict.is_split());

        assert!(dict.delete(&intern("x")));
        assert!(!dict.is_split());
        assert_eq!(dict.keys_address(), 0);
        assert_eq!(dict.get(&intern("y")).unwrap().as_int(), 2);
        assert!(dict.get(&intern("x")).is_none());
        d.decref();
    }

    #[test]
    fn test_keys_address_identity() {
        let keys = Arc::new(DictKeys::new());
        let d1 = DictObject::alloc_split(Arc::clone(&keys));
        let d2 = DictObject::alloc_split(Arc::clone(&keys));
        assert_eq!(dict_ref(d1).keys_address(), dict_ref(d2).keys_address());
        assert_ne!(dict_ref(d1).keys_address(), 0);
        d1.decref();
        d2.decref();
    }

    #[test]
    fn test_nentries_grows_with_sibling_writes() {
        let keys = Arc::new(DictKeys::new());
        let d1 = DictObject::alloc_split(Arc::clone(&keys));
        let d2 = DictObject::alloc_split(Arc::clone(&keys));

        dict_ref(d1).set(&intern("a"), Value::from_int(1));
        assert_eq!(dict_ref(d2).keys_nentries(), 1);
        dict_ref(d2).set(&intern("b"), Value::from_int(2));
        assert_eq!(dict_ref(d1).keys_nentries(), 2);
        d1.decref();
        d2.decref();
    }
}
