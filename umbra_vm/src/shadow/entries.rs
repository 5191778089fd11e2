//! Cache entry kinds.
//!
//! A cache entry records one observed attribute resolution. Instance
//! entries come in nine kinds, one per storage shape (slot / combined
//! dict / split dict, with or without a descriptor, and the method
//! variants used by LOAD_METHOD). Each kind owns a row in a function
//! table pairing it with its fast-path handlers and the specialized
//! opcodes it patches in: a tagged union with an explicit discriminator
//! standing in for per-kind subclassing.
//!
//! Entries hold only *non-owning* references to types, descriptors, and
//! keys tables. Liveness is the invalidation protocol's job: an entry is
//! cleared before anything it points at is freed, and a cleared entry
//! fails its guard on the next execution.

use std::cell::Cell;
use std::sync::Arc;

use umbra_core::{InternedString, Value};
use umbra_runtime::object::module::ModuleObject;
use umbra_runtime::TypeObject;

use super::arena::ShadowCode;
use super::handlers;
use crate::bytecode::Opcode;
use crate::error::VmResult;

/// Capacity of a polymorphic cache array.
pub const POLYMORPHIC_CACHE_SIZE: usize = 4;

/// Mark a keys-table address as "previously observed, no split slot".
///
/// The low bit distinguishes the remembered shape from the live pointer;
/// a poisoned address is never dereferenced.
#[inline]
pub fn poisoned_keys(addr: usize) -> usize {
    addr | 1
}

// =============================================================================
// Instance entries
// =============================================================================

/// Storage-shape kinds for instance attribute entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CacheKind {
    /// Combined dict, no descriptor.
    DictNoDescr = 0,
    /// Combined dict plus non-data descriptor.
    DictDescr,
    /// Split dict, no descriptor.
    SplitDict,
    /// Split dict plus non-data descriptor.
    SplitDictDescr,
    /// Fixed-offset slot.
    Slot,
    /// No dict; descriptor only.
    NoDictDescr,
    /// Combined dict, unbound function for LOAD_METHOD.
    DictMethod,
    /// No dict, unbound function for LOAD_METHOD.
    NoDictMethod,
    /// Split dict, unbound function for LOAD_METHOD.
    SplitDictMethod,
}

/// Per-site record of one observed instance attribute resolution.
///
/// Shared between the arena's tables, the per-type dependency map, and
/// the type's second-level cache; mutation goes through `Cell` fields
/// under the single-threaded execution contract.
pub struct InstanceAttrEntry {
    /// Attribute name.
    pub name: InternedString,
    /// Storage-shape kind.
    pub kind: CacheKind,
    type_: Cell<*mut TypeObject>,
    value: Cell<Value>,
    dictoffset: Cell<isize>,
    splitoffset: Cell<isize>,
    nentries: Cell<usize>,
    keys: Cell<usize>,
}

impl InstanceAttrEntry {
    /// Create an entry for a resolution against `type_`.
    pub fn new(
        name: InternedString,
        kind: CacheKind,
        type_: *mut TypeObject,
        value: Value,
        dictoffset: isize,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            kind,
            type_: Cell::new(type_),
            value: Cell::new(value),
            dictoffset: Cell::new(dictoffset),
            splitoffset: Cell::new(-1),
            nentries: Cell::new(0),
            keys: Cell::new(0),
        })
    }

    /// Guarded type; null once invalidated.
    #[inline]
    pub fn type_ptr(&self) -> *mut TypeObject {
        self.type_.get()
    }

    /// Descriptor or resolved value (borrowed); null for no-descriptor
    /// kinds and invalidated entries.
    #[inline]
    pub fn value(&self) -> Value {
        self.value.get()
    }

    /// Instance dict offset as recorded on the type (may be negative).
    #[inline]
    pub fn dictoffset(&self) -> isize {
        self.dictoffset.get()
    }

    /// Split-dict slot index, or slot byte offset for the `Slot` kind;
    /// -1 means none.
    #[inline]
    pub fn splitoffset(&self) -> isize {
        self.splitoffset.get()
    }

    /// Keys-table entry count observed with `keys`.
    #[inline]
    pub fn nentries(&self) -> usize {
        self.nentries.get()
    }

    /// Observed keys-table address, possibly poisoned; 0 when none.
    #[inline]
    pub fn keys(&self) -> usize {
        self.keys.get()
    }

    /// Record the split-dict view: slot index (or a poisoned keys address
    /// when the key has no slot) plus the table's entry count.
    #[inline]
    pub fn set_split_view(&self, keys: usize, splitoffset: isize, nentries: usize) {
        self.keys.set(keys);
        self.splitoffset.set(splitoffset);
        self.nentries.set(nentries);
    }

    /// Record a slot byte offset (the `Slot` kind reuses `splitoffset`).
    #[inline]
    pub fn set_slot_offset(&self, offset: usize) {
        self.splitoffset.set(offset as isize);
    }

    /// Check the type guard against an owner's type.
    #[inline]
    pub fn matches_type(&self, tp: *mut TypeObject) -> bool {
        let t = self.type_.get();
        !t.is_null() && t == tp
    }

    /// Check whether the entry has been invalidated.
    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.type_.get().is_null()
    }

    /// Clear the entry: every guard fails until the site respecializes.
    pub fn invalidate(&self) {
        self.type_.set(std::ptr::null_mut());
        self.value.set(Value::null());
        self.keys.set(0);
        self.splitoffset.set(-1);
        self.nentries.set(0);
    }
}

impl std::fmt::Debug for InstanceAttrEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceAttrEntry")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("type", &self.type_.get())
            .field("splitoffset", &self.splitoffset.get())
            .field("valid", &self.is_valid())
            .finish()
    }
}

// =============================================================================
// Module entries
// =============================================================================

/// Per-site record of a module attribute resolution, validated by the
/// module dict's version tag.
pub struct ModuleAttrEntry {
    /// Attribute name.
    pub name: InternedString,
    module: Cell<*mut ModuleObject>,
    version: Cell<u64>,
    value: Cell<Value>,
}

impl ModuleAttrEntry {
    /// Create an entry for `name` resolved in `module` at `version`.
    pub fn new(
        name: InternedString,
        module: *mut ModuleObject,
        version: u64,
        value: Value,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            module: Cell::new(module),
            version: Cell::new(version),
            value: Cell::new(value),
        })
    }

    /// Guarded module; null once invalidated.
    #[inline]
    pub fn module_ptr(&self) -> *mut ModuleObject {
        self.module.get()
    }

    /// Version tag the cached value was read at.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.get()
    }

    /// Cached value (borrowed).
    #[inline]
    pub fn value(&self) -> Value {
        self.value.get()
    }

    /// Refresh after a version drift.
    #[inline]
    pub fn refresh(&self, version: u64, value: Value) {
        self.version.set(version);
        self.value.set(value);
    }

    /// Clear the entry.
    pub fn invalidate(&self) {
        self.module.set(std::ptr::null_mut());
        self.version.set(0);
        self.value.set(Value::null());
    }
}

// =============================================================================
// Global entries
// =============================================================================

/// Per-site record of a global/builtin resolution, validated by the
/// combined version of the globals and builtins dicts.
pub struct GlobalCacheEntry {
    /// Global name.
    pub name: InternedString,
    version: Cell<u64>,
    value: Cell<Value>,
}

impl GlobalCacheEntry {
    /// Create an entry.
    pub fn new(name: InternedString, version: u64, value: Value) -> Self {
        Self {
            name,
            version: Cell::new(version),
            value: Cell::new(value),
        }
    }

    /// Check validity against the combined version counter.
    #[inline]
    pub fn is_valid(&self, combined_version: u64) -> bool {
        self.version.get() == combined_version
    }

    /// Cached value (borrowed).
    #[inline]
    pub fn value(&self) -> Value {
        self.value.get()
    }

    /// Refresh after a version drift.
    #[inline]
    pub fn refresh(&self, version: u64, value: Value) {
        self.version.set(version);
        self.value.set(value);
    }
}

// =============================================================================
// Field caches
// =============================================================================

/// Primitive field types a field cache can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveField {
    /// 64-bit signed integer.
    Int64,
    /// 32-bit signed integer.
    Int32,
}

/// Cache for a primitive-typed field at a fixed byte offset.
#[derive(Debug, Clone, Copy)]
pub struct FieldCache {
    /// Byte offset within the object.
    pub offset: u32,
    /// Field representation.
    pub field_type: PrimitiveField,
}

// =============================================================================
// Polymorphic caches
// =============================================================================

/// Fixed-capacity array of instance entries for a site that observes
/// multiple types. Scanned linearly; a full array evicts FIFO.
pub struct PolymorphicCache {
    entries: [Option<Arc<InstanceAttrEntry>>; POLYMORPHIC_CACHE_SIZE],
    next_evict: usize,
}

impl PolymorphicCache {
    /// Create an empty array.
    pub fn new() -> Self {
        Self {
            entries: [None, None, None, None],
            next_evict: 0,
        }
    }

    /// Find the entry guarding `tp`.
    #[inline]
    pub fn lookup(&self, tp: *mut TypeObject) -> Option<Arc<InstanceAttrEntry>> {
        for slot in self.entries.iter().flatten() {
            if slot.matches_type(tp) {
                return Some(Arc::clone(slot));
            }
        }
        None
    }

    /// Insert an entry, evicting the oldest when full.
    pub fn insert(&mut self, entry: Arc<InstanceAttrEntry>) {
        for slot in self.entries.iter_mut() {
            if slot.is_none() {
                *slot = Some(entry);
                return;
            }
        }
        self.entries[self.next_evict] = Some(entry);
        self.next_evict = (self.next_evict + 1) % POLYMORPHIC_CACHE_SIZE;
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    /// Check for an empty array.
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.is_none())
    }

    /// Snapshot of the occupied slots, in insertion order.
    pub fn entries(&self) -> Vec<Arc<InstanceAttrEntry>> {
        self.entries.iter().flatten().cloned().collect()
    }
}

// =============================================================================
// Per-kind behavior table
// =============================================================================

/// Fast-path LOAD_ATTR handler.
pub type LoadAttrFn =
    fn(&mut ShadowCode, usize, &Arc<InstanceAttrEntry>, Value) -> VmResult<Value>;

/// Fast-path LOAD_METHOD handler, returning `(self_or_null, method)`.
pub type LoadMethodFn =
    fn(&mut ShadowCode, usize, &Arc<InstanceAttrEntry>, Value) -> VmResult<(Value, Value)>;

/// Fast-path STORE_ATTR handler.
pub type StoreAttrFn =
    fn(&mut ShadowCode, usize, &Arc<InstanceAttrEntry>, Value, Value) -> VmResult<()>;

/// Behavior row for one cache kind: its handlers and the specialized
/// opcodes it owns.
pub struct CacheKindOps {
    /// Opcode patched in for LOAD_ATTR sites.
    pub load_attr_opcode: Opcode,
    /// Opcode patched in for LOAD_METHOD sites.
    pub load_method_opcode: Opcode,
    /// Opcode patched in for STORE_ATTR sites.
    pub store_attr_opcode: Opcode,
    /// LOAD_ATTR fast path.
    pub load_attr: LoadAttrFn,
    /// LOAD_METHOD fast path.
    pub load_method: LoadMethodFn,
    /// STORE_ATTR fast path.
    pub store_attr: StoreAttrFn,
    /// Invalidation behavior.
    pub invalidate: fn(&InstanceAttrEntry),
}

static CACHE_KIND_OPS: [CacheKindOps; 9] = [
    // DictNoDescr
    CacheKindOps {
        load_attr_opcode: Opcode::LoadAttrDictNoDescr,
        load_method_opcode: Opcode::LoadMethodDictDescr,
        store_attr_opcode: Opcode::StoreAttrDict,
        load_attr: handlers::load_attr_dict_no_descr,
        load_method: handlers::load_method_dict_descr,
        store_attr: handlers::store_attr_dict,
        invalidate: InstanceAttrEntry::invalidate,
    },
    // DictDescr
    CacheKindOps {
        load_attr_opcode: Opcode::LoadAttrDictDescr,
        load_method_opcode: Opcode::LoadMethodDictDescr,
        store_attr_opcode: Opcode::StoreAttrDict,
        load_attr: handlers::load_attr_dict_descr,
        load_method: handlers::load_method_dict_descr,
        store_attr: handlers::store_attr_dict,
        invalidate: InstanceAttrEntry::invalidate,
    },
    // SplitDict
    CacheKindOps {
        load_attr_opcode: Opcode::LoadAttrSplitDict,
        load_method_opcode: Opcode::LoadMethodSplitDictDescr,
        store_attr_opcode: Opcode::StoreAttrSplitDict,
        load_attr: handlers::load_attr_split_dict,
        load_method: handlers::load_method_split_dict_descr,
        store_attr: handlers::store_attr_split_dict,
        invalidate: InstanceAttrEntry::invalidate,
    },
    // SplitDictDescr
    CacheKindOps {
        load_attr_opcode: Opcode::LoadAttrSplitDictDescr,
        load_method_opcode: Opcode::LoadMethodSplitDictDescr,
        store_attr_opcode: Opcode::StoreAttrSplitDict,
        load_attr: handlers::load_attr_split_dict_descr,
        load_method: handlers::load_method_split_dict_descr,
        store_attr: handlers::store_attr_split_dict,
        invalidate: InstanceAttrEntry::invalidate,
    },
    // Slot
    CacheKindOps {
        load_attr_opcode: Opcode::LoadAttrSlot,
        load_method_opcode: Opcode::LoadMethodNoDictDescr,
        store_attr_opcode: Opcode::StoreAttrSlot,
        load_attr: handlers::load_attr_slot,
        load_method: handlers::load_method_no_dict_descr,
        store_attr: handlers::store_attr_slot,
        invalidate: InstanceAttrEntry::invalidate,
    },
    // NoDictDescr
    CacheKindOps {
        load_attr_opcode: Opcode::LoadAttrNoDictDescr,
        load_method_opcode: Opcode::LoadMethodNoDictDescr,
        store_attr_opcode: Opcode::StoreAttrDescr,
        load_attr: handlers::load_attr_no_dict_descr,
        load_method: handlers::load_method_no_dict_descr,
        store_attr: handlers::store_attr_descr,
        invalidate: InstanceAttrEntry::invalidate,
    },
    // DictMethod
    CacheKindOps {
        load_attr_opcode: Opcode::LoadAttrDictDescr,
        load_method_opcode: Opcode::LoadMethodDictMethod,
        store_attr_opcode: Opcode::StoreAttrDict,
        load_attr: handlers::load_attr_dict_descr,
        load_method: handlers::load_method_dict_method,
        store_attr: handlers::store_attr_dict,
        invalidate: InstanceAttrEntry::invalidate,
    },
    // NoDictMethod
    CacheKindOps {
        load_attr_opcode: Opcode::LoadAttrNoDictDescr,
        load_method_opcode: Opcode::LoadMethodNoDictMethod,
        store_attr_opcode: Opcode::StoreAttrDescr,
        load_attr: handlers::load_attr_no_dict_descr,
        load_method: handlers::load_method_no_dict_method,
        store_attr: handlers::store_attr_descr,
        invalidate: InstanceAttrEntry::invalidate,
    },
    // SplitDictMethod
    CacheKindOps {
        load_attr_opcode: Opcode::LoadAttrSplitDictDescr,
        load_method_opcode: Opcode::LoadMethodSplitDictMethod,
        store_attr_opcode: Opcode::StoreAttrSplitDict,
        load_attr: handlers::load_attr_split_dict_descr,
        load_method: handlers::load_method_split_dict_method,
        store_attr: handlers::store_attr_split_dict,
        invalidate: InstanceAttrEntry::invalidate,
    },
];

impl CacheKind {
    /// The behavior row for this kind.
    #[inline]
    pub fn ops(self) -> &'static CacheKindOps {
        &CACHE_KIND_OPS[self as usize]
    }

    /// LOAD_METHOD kinds carry an unbound function as their value.
    #[inline]
    pub fn is_method(self) -> bool {
        matches!(
            self,
            CacheKind::DictMethod | CacheKind::NoDictMethod | CacheKind::SplitDictMethod
        )
    }
}
