//! Type objects.
//!
//! A `TypeObject` is an attribute namespace plus an instance layout
//! description: how many fixed slots an instance carries, at which byte
//! offsets, and where (if anywhere) its dict pointer lives. Attribute
//! resolution walks the type's own dict and then its MRO, classifying what
//! it finds as a data descriptor, non-data descriptor, slot descriptor, or
//! plain value.
//!
//! Any mutation that can change attribute resolution funnels through
//! [`TypeObject::set_attr`] / [`TypeObject::del_attr`] / [`TypeObject::set_mro`],
//! which notify the caching layer through the registered hook.

use std::cell::RefCell;
use std::sync::{Arc, OnceLock};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use umbra_core::{intern, InternedString, Value};

use super::descriptor::{classify_attr, AttrKind, SlotDescriptor};
use super::{notify_type_modified, ObjectHeader, ObjectKind};
use crate::types::dict::DictKeys;

bitflags::bitflags! {
    /// Behavior flags for a type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeFlags: u32 {
        /// Instances may be weakly referenced; required for cache
        /// directories to attach.
        const SUPPORTS_WEAKREFS = 1 << 0;
        /// The type overrides generic attribute lookup; resolution results
        /// cannot be cached.
        const CUSTOM_GETATTRIBUTE = 1 << 1;
    }
}

/// Size of the common object header, where instance storage begins.
pub const INSTANCE_HEADER_SIZE: usize = std::mem::size_of::<ObjectHeader>();

/// Size of one instance storage word.
pub const WORD: usize = std::mem::size_of::<Value>();

// =============================================================================
// TypeObject
// =============================================================================

/// A type: attribute namespace plus instance layout.
#[repr(C)]
pub struct TypeObject {
    /// Object header.
    pub header: ObjectHeader,
    /// Type name.
    pub name: InternedString,
    /// Behavior flags.
    pub flags: TypeFlags,
    /// Total instance allocation size in bytes.
    pub basicsize: usize,
    /// Byte offset of the instance dict pointer. Zero means instances have
    /// no dict; negative offsets are computed from the end of the instance.
    pub dictoffset: isize,
    /// Slot names and their byte offsets within an instance.
    pub slots: Vec<(InternedString, usize)>,
    dict: RefCell<FxHashMap<InternedString, Value>>,
    mro: RefCell<SmallVec<[*mut TypeObject; 4]>>,
    cached_keys: RefCell<Option<Arc<DictKeys>>>,
}

impl TypeObject {
    /// Check whether attribute resolutions against this type may be cached.
    #[inline]
    pub fn is_cacheable(&self) -> bool {
        self.flags.contains(TypeFlags::SUPPORTS_WEAKREFS)
            && !self.flags.contains(TypeFlags::CUSTOM_GETATTRIBUTE)
    }

    /// Check whether instances carry a dict pointer.
    #[inline]
    pub fn has_instance_dict(&self) -> bool {
        self.dictoffset != 0
    }

    /// Resolved byte offset of the instance dict pointer.
    ///
    /// Negative offsets address from the end of the instance allocation.
    #[inline]
    pub fn resolved_dictoffset(&self) -> Option<usize> {
        match self.dictoffset {
            0 => None,
            d if d > 0 => Some(d as usize),
            d => Some((self.basicsize as isize + d) as usize),
        }
    }

    /// Look up a name in this type's own dict. Returns a borrowed value.
    #[inline]
    pub fn get_attr_local(&self, name: &InternedString) -> Option<Value> {
        self.dict.borrow().get(name).copied()
    }

    /// Resolve a name along this type and its MRO, classifying the result.
    ///
    /// Returns a borrowed value; callers take their own reference before
    /// running arbitrary code.
    pub fn lookup_mro(&self, name: &InternedString) -> Option<(Value, AttrKind)> {
        if let Some(v) = self.get_attr_local(name) {
            return Some((v, classify_attr(v)));
        }
        for &base in self.mro.borrow().iter() {
            let base_ref = unsafe { &*base };
            if let Some(v) = base_ref.get_attr_local(name) {
                return Some((v, classify_attr(v)));
            }
        }
        None
    }

    /// Bind a name in the type's dict.
    ///
    /// Notifies the caching layer: any cached resolution involving this
    /// type may now be stale.
    pub fn set_attr(&self, name: InternedString, value: Value) {
        value.incref();
        let old = self.dict.borrow_mut().insert(name, value);
        if let Some(old) = old {
            old.decref();
        }
        notify_type_modified(self.as_ptr());
    }

    /// Remove a name from the type's dict.
    pub fn del_attr(&self, name: &InternedString) -> bool {
        let old = self.dict.borrow_mut().remove(name);
        let found = old.is_some();
        if let Some(old) = old {
            old.decref();
        }
        if found {
            notify_type_modified(self.as_ptr());
        }
        found
    }

    /// Replace the MRO tail (everything after the type itself).
    pub fn set_mro(&self, bases: &[*mut TypeObject]) {
        let mut mro = self.mro.borrow_mut();
        for &old in mro.iter() {
            Value::from_object(old).decref();
        }
        mro.clear();
        for &base in bases {
            Value::from_object(base).incref();
            mro.push(base);
        }
        drop(mro);
        notify_type_modified(self.as_ptr());
    }

    /// MRO tail snapshot (bases, excluding the type itself).
    pub fn mro_bases(&self) -> SmallVec<[*mut TypeObject; 4]> {
        self.mro.borrow().clone()
    }

    /// Shared split-keys table handed to new instance dicts, created on
    /// first use.
    pub fn cached_keys(&self) -> Arc<DictKeys> {
        let mut slot = self.cached_keys.borrow_mut();
        match &*slot {
            Some(keys) => Arc::clone(keys),
            None => {
                let keys = Arc::new(DictKeys::new());
                *slot = Some(Arc::clone(&keys));
                keys
            }
        }
    }

    /// Raw pointer to this type.
    #[inline]
    pub fn as_ptr(&self) -> *mut TypeObject {
        self as *const TypeObject as *mut TypeObject
    }
}

impl Drop for TypeObject {
    fn drop(&mut self) {
        for (_, v) in self.dict.borrow_mut().drain() {
            v.decref();
        }
        for &base in self.mro.borrow().iter() {
            Value::from_object(base).decref();
        }
    }
}

// =============================================================================
// Class builder
// =============================================================================

/// Builder for user-defined classes.
pub struct ClassBuilder {
    name: InternedString,
    base: Option<*mut TypeObject>,
    slots: Vec<InternedString>,
    with_dict: bool,
    trailing_dict: bool,
    flags: TypeFlags,
}

impl ClassBuilder {
    /// Start building a class. Instances carry a dict by default.
    pub fn new(name: &str) -> Self {
        Self {
            name: intern(name),
            base: None,
            slots: Vec::new(),
            with_dict: true,
            trailing_dict: false,
            flags: TypeFlags::SUPPORTS_WEAKREFS,
        }
    }

    /// Set the base class.
    pub fn base(mut self, base: *mut TypeObject) -> Self {
        self.base = Some(base);
        self
    }

    /// Declare a fixed slot; instances store it inline at a fixed offset.
    pub fn slot(mut self, name: &str) -> Self {
        self.slots.push(intern(name));
        self
    }

    /// Instances carry no dict (slots only).
    pub fn no_dict(mut self) -> Self {
        self.with_dict = false;
        self
    }

    /// Place the dict pointer at the end of the instance; the recorded
    /// dict offset is negative and resolved per access.
    pub fn trailing_dict(mut self) -> Self {
        self.trailing_dict = true;
        self
    }

    /// Mark the class as overriding generic attribute lookup.
    pub fn custom_getattribute(mut self) -> Self {
        self.flags |= TypeFlags::CUSTOM_GETATTRIBUTE;
        self
    }

    /// Allocate the type object.
    pub fn build(self) -> *mut TypeObject {
        let builtins = builtin_types();

        let nslots = self.slots.len();
        let slots_size = nslots * WORD;
        let dict_size = if self.with_dict { WORD } else { 0 };
        let basicsize = INSTANCE_HEADER_SIZE + slots_size + dict_size;
        let dictoffset: isize = if !self.with_dict {
            0
        } else if self.trailing_dict {
            -(WORD as isize)
        } else {
            (INSTANCE_HEADER_SIZE + slots_size) as isize
        };

        let slots: Vec<(InternedString, usize)> = self
            .slots
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), INSTANCE_HEADER_SIZE + i * WORD))
            .collect();

        let mut mro: SmallVec<[*mut TypeObject; 4]> = SmallVec::new();
        if let Some(base) = self.base {
            Value::from_object(base).incref();
            mro.push(base);
            for &ancestor in unsafe { &*base }.mro.borrow().iter() {
                Value::from_object(ancestor).incref();
                mro.push(ancestor);
            }
        }

        Value::from_object(builtins.type_type).incref();
        let ty = Box::into_raw(Box::new(TypeObject {
            header: ObjectHeader::new(ObjectKind::Type, builtins.type_type),
            name: self.name,
            flags: self.flags,
            basicsize,
            dictoffset,
            slots: slots.clone(),
            dict: RefCell::new(FxHashMap::default()),
            mro: RefCell::new(mro),
            cached_keys: RefCell::new(None),
        }));

        // Slot descriptors live in the type dict like any other attribute.
        for (name, offset) in slots {
            let descr = SlotDescriptor::alloc(name.clone(), offset);
            unsafe { &*ty }.dict.borrow_mut().insert(name, descr);
        }

        ty
    }
}

// =============================================================================
// Builtin types
// =============================================================================

/// The builtin type objects. These are immortal: created once per process
/// and never torn down.
pub struct BuiltinTypes {
    pub object_type: *mut TypeObject,
    pub type_type: *mut TypeObject,
    pub int_type: *mut TypeObject,
    pub str_type: *mut TypeObject,
    pub dict_type: *mut TypeObject,
    pub list_type: *mut TypeObject,
    pub tuple_type: *mut TypeObject,
    pub module_type: *mut TypeObject,
    pub function_type: *mut TypeObject,
    pub bound_method_type: *mut TypeObject,
    pub property_type: *mut TypeObject,
    pub slot_descr_type: *mut TypeObject,
    pub super_type: *mut TypeObject,
}

// Raw pointers to immortal objects; handed out read-only.
unsafe impl Send for BuiltinTypes {}
unsafe impl Sync for BuiltinTypes {}

static BUILTIN_TYPES: OnceLock<BuiltinTypes> = OnceLock::new();

fn new_builtin(name: &str, metatype: *mut TypeObject, flags: TypeFlags) -> *mut TypeObject {
    Box::into_raw(Box::new(TypeObject {
        header: ObjectHeader::new(ObjectKind::Type, metatype),
        name: intern(name),
        flags,
        basicsize: INSTANCE_HEADER_SIZE,
        dictoffset: 0,
        slots: Vec::new(),
        dict: RefCell::new(FxHashMap::default()),
        mro: RefCell::new(SmallVec::new()),
        cached_keys: RefCell::new(None),
    }))
}

/// The builtin type registry, creating it on first use.
pub fn builtin_types() -> &'static BuiltinTypes {
    BUILTIN_TYPES.get_or_init(|| {
        super::init_dealloc();

        // `type` is its own type; the self link is a bootstrap edge and is
        // not counted.
        let type_type = new_builtin("type", std::ptr::null_mut(), TypeFlags::SUPPORTS_WEAKREFS);
        unsafe { &mut *type_type }.header.type_obj = type_type;

        let plain = TypeFlags::empty();
        let weakref = TypeFlags::SUPPORTS_WEAKREFS;
        BuiltinTypes {
            object_type: new_builtin("object", type_type, weakref),
            type_type,
            int_type: new_builtin("int", type_type, plain),
            str_type: new_builtin("str", type_type, plain),
            dict_type: new_builtin("dict", type_type, plain),
            list_type: new_builtin("list", type_type, plain),
            tuple_type: new_builtin("tuple", type_type, plain),
            module_type: new_builtin("module", type_type, weakref),
            function_type: new_builtin("function", type_type, plain),
            bound_method_type: new_builtin("method", type_type, plain),
            property_type: new_builtin("property", type_type, plain),
            slot_descr_type: new_builtin("member_descriptor", type_type, plain),
            super_type: new_builtin("super", type_type, plain),
        }
    })
}

/// A type object as a tagged value.
pub fn type_value(ty: *mut TypeObject) -> Value {
    Value::from_object(ty)
}
