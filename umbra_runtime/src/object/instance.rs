//! Instances of user-defined classes.
//!
//! An instance is a single allocation described entirely by its type:
//! the common header, then one word per declared slot at a fixed byte
//! offset, then (if the type says so) the dict pointer word. Slot words
//! and the dict pointer start out null; the dict is materialized on first
//! use, sharing the type's split-keys table.

use std::alloc::{alloc_zeroed, dealloc, Layout};

use umbra_core::Value;

use super::type_obj::TypeObject;
use super::{ObjectHeader, ObjectKind};
use crate::types::dict::DictObject;

/// Allocate a fresh instance of `ty` with all slots unset and no dict.
pub fn alloc_instance(ty: *mut TypeObject) -> Value {
    let ty_ref = unsafe { &*ty };
    let layout = Layout::from_size_align(ty_ref.basicsize, 8).expect("bad instance layout");
    let ptr = unsafe { alloc_zeroed(layout) } as *mut ObjectHeader;
    if ptr.is_null() {
        std::alloc::handle_alloc_error(layout);
    }
    Value::from_object(ty).incref();
    unsafe { ptr.write(ObjectHeader::new(ObjectKind::Instance, ty)) };
    Value::from_object(ptr)
}

/// Load the word at a byte offset within an instance. Returns a borrowed
/// value; null means the slot is unset.
///
/// # Safety
///
/// `obj` must be a live instance and `offset` a slot offset declared by
/// its type.
#[inline]
pub unsafe fn slot_load(obj: Value, offset: usize) -> Value {
    let base = obj.as_object() as *const u8;
    unsafe { *(base.add(offset) as *const Value) }
}

/// Store a word at a byte offset within an instance, retaining the new
/// value and releasing the old one.
///
/// # Safety
///
/// Same requirements as [`slot_load`].
#[inline]
pub unsafe fn slot_store(obj: Value, offset: usize, value: Value) {
    let base = obj.as_object() as *mut u8;
    let slot = unsafe { &mut *(base.add(offset) as *mut Value) };
    value.incref();
    let old = std::mem::replace(slot, value);
    old.decref();
}

/// Address of the instance's dict pointer word, or `None` when the type
/// allocates no dict. Negative dict offsets are resolved here.
#[inline]
pub fn dict_slot_ptr(obj: Value) -> Option<*mut *mut DictObject> {
    let header = unsafe { super::header_of(obj) };
    let ty = unsafe { &*header.type_obj };
    let offset = ty.resolved_dictoffset()?;
    let base = obj.as_object() as *mut u8;
    Some(unsafe { base.add(offset) } as *mut *mut DictObject)
}

/// The instance's dict, or null if absent or not yet materialized.
#[inline]
pub fn instance_dict(obj: Value) -> *mut DictObject {
    match dict_slot_ptr(obj) {
        Some(slot) => unsafe { *slot },
        None => std::ptr::null_mut(),
    }
}

/// The instance's dict, creating it on first use. New dicts are split and
/// share the type's cached keys table. Returns null when the type
/// allocates no dict.
pub fn materialize_instance_dict(obj: Value) -> *mut DictObject {
    let Some(slot) = dict_slot_ptr(obj) else {
        return std::ptr::null_mut();
    };
    let existing = unsafe { *slot };
    if !existing.is_null() {
        return existing;
    }
    let header = unsafe { super::header_of(obj) };
    let ty = unsafe { &*header.type_obj };
    let dict = DictObject::alloc_split(ty.cached_keys());
    let ptr = unsafe { dict.as_object_ptr::<DictObject>() };
    unsafe { *slot = ptr };
    ptr
}

/// Tear down an instance: release slot contents, the dict, and the type
/// reference, then free the allocation.
pub(crate) unsafe fn dealloc_instance(ptr: *mut ObjectHeader) {
    let obj = Value::from_object(ptr);
    let ty = unsafe { &*ptr }.type_obj;
    let ty_ref = unsafe { &*ty };

    for &(_, offset) in &ty_ref.slots {
        let v = unsafe { slot_load(obj, offset) };
        v.decref();
    }
    if let Some(slot) = dict_slot_ptr(obj) {
        let dict = unsafe { *slot };
        if !dict.is_null() {
            Value::from_object(dict).decref();
        }
    }

    let layout = Layout::from_size_align(ty_ref.basicsize, 8).expect("bad instance layout");
    unsafe { dealloc(ptr as *mut u8, layout) };
    Value::from_object(ty).decref();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::type_obj::ClassBuilder;
    use umbra_core::intern;

    #[test]
    fn test_slots_start_unset() {
        let ty = ClassBuilder::new("P").slot("x").slot("y").no_dict().build();
        let obj = alloc_instance(ty);
        let ty_ref = unsafe { &*ty };
        for &(_, offset) in &ty_ref.slots {
            assert!(unsafe { slot_load(obj, offset) }.is_null());
        }
        obj.decref();
    }

    #[test]
    fn test_slot_store_and_load() {
        let ty = ClassBuilder::new("Q").slot("x").no_dict().build();
        let obj = alloc_instance(ty);
        let offset = unsafe { &*ty }.slots[0].1;

        unsafe { slot_store(obj, offset, Value::from_int(42)) };
        assert_eq!(unsafe { slot_load(obj, offset) }.as_int(), 42);

        unsafe { slot_store(obj, offset, Value::from_int(-1)) };
        assert_eq!(unsafe { slot_load(obj, offset) }.as_int(), -1);
        obj.decref();
    }

    #[test]
    fn test_dict_materialization_is_split() {
        let ty = ClassBuilder::new("R").build();
        let obj = alloc_instance(ty);

        assert!(instance_dict(obj).is_null());
        let dict = materialize_instance_dict(obj);
        assert!(!dict.is_null());
        assert!(unsafe { &*dict }.is_split());
        // Second call returns the same dict.
        assert_eq!(materialize_instance_dict(obj), dict);
        obj.decref();
    }

    #[test]
    fn test_instances_share_keys_table() {
        let ty = ClassBuilder::new("S").build();
        let a = alloc_instance(ty);
        let b = alloc_instance(ty);
        let da = unsafe { &*materialize_instance_dict(a) };
        let db = unsafe { &*materialize_instance_dict(b) };
        assert_eq!(da.keys_address(), db.keys_address());

        da.set(&intern("v"), Value::from_int(1));
        // The key lands in the shared table; b's dict sees the slot.
        assert_eq!(db.keys_address(), da.keys_address());
        a.decref();
        b.decref();
    }

    #[test]
    fn test_trailing_dict_materializes() {
        let ty = ClassBuilder::new("T2").trailing_dict().build();
        let obj = alloc_instance(ty);
        let dict = materialize_instance_dict(obj);
        assert!(!dict.is_null());
        obj.decref();
    }
}
