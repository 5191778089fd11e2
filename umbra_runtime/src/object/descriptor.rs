//! Descriptor protocol.
//!
//! Three descriptor species participate in attribute resolution:
//!
//! - [`SlotDescriptor`]: reads/writes a fixed word offset in the instance
//! - [`PropertyObject`]: data descriptor with native get/set functions
//! - functions: non-data descriptors that bind into methods
//!
//! [`classify_attr`] maps a resolved type-dict value to the kind the
//! resolution algorithm cares about.

use std::cell::Cell;

use umbra_core::{InternedString, RuntimeError, UmbraResult, Value};

use super::instance::{slot_load, slot_store};
use super::type_obj::{builtin_types, TypeObject};
use super::{alloc, kind_of, type_name_of, ObjectHeader, ObjectKind};
use crate::types::function::BoundMethodObject;

/// How a value found on a type participates in attribute resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKind {
    /// Data descriptor: takes precedence over the instance dict.
    DataDescr,
    /// Non-data descriptor: instance dict wins, descriptor binds otherwise.
    NonDataDescr,
    /// Slot descriptor: fixed-offset instance storage.
    SlotDescr,
    /// Plain value: no descriptor protocol.
    Plain,
}

/// Classify a value found in a type dict.
#[inline]
pub fn classify_attr(value: Value) -> AttrKind {
    match kind_of(value) {
        Some(ObjectKind::SlotDescr) => AttrKind::SlotDescr,
        Some(ObjectKind::Property) => AttrKind::DataDescr,
        Some(ObjectKind::Function) => AttrKind::NonDataDescr,
        _ => AttrKind::Plain,
    }
}

/// Check whether a value has descriptor-get behavior.
#[inline]
pub fn has_descr_get(value: Value) -> bool {
    matches!(
        kind_of(value),
        Some(ObjectKind::SlotDescr | ObjectKind::Property | ObjectKind::Function)
    )
}

// =============================================================================
// Slot descriptors
// =============================================================================

/// Descriptor for a fixed-offset instance slot.
#[repr(C)]
pub struct SlotDescriptor {
    /// Object header.
    pub header: ObjectHeader,
    /// Slot name, for error messages.
    pub name: InternedString,
    /// Byte offset of the slot word within the instance.
    pub offset: usize,
}

impl SlotDescriptor {
    /// Allocate a slot descriptor.
    pub fn alloc(name: InternedString, offset: usize) -> Value {
        let builtins = builtin_types();
        Value::from_object(builtins.slot_descr_type).incref();
        alloc(SlotDescriptor {
            header: ObjectHeader::new(ObjectKind::SlotDescr, builtins.slot_descr_type),
            name,
            offset,
        })
    }
}

// =============================================================================
// Properties
// =============================================================================

/// Native getter: `(property, instance) -> value`.
pub type PropertyGetFn = fn(&PropertyObject, Value) -> UmbraResult<Value>;

/// Native setter: `(property, instance, value) -> ()`.
pub type PropertySetFn = fn(&PropertyObject, Value, Value) -> UmbraResult<()>;

/// A data descriptor backed by native functions.
#[repr(C)]
pub struct PropertyObject {
    /// Object header.
    pub header: ObjectHeader,
    get: Option<PropertyGetFn>,
    set: Option<PropertySetFn>,
    /// Scratch value available to the native functions.
    pub payload: Cell<Value>,
}

impl PropertyObject {
    /// Allocate a property. `payload` is retained.
    pub fn alloc(get: Option<PropertyGetFn>, set: Option<PropertySetFn>, payload: Value) -> Value {
        let builtins = builtin_types();
        Value::from_object(builtins.property_type).incref();
        payload.incref();
        alloc(PropertyObject {
            header: ObjectHeader::new(ObjectKind::Property, builtins.property_type),
            get,
            set,
            payload: Cell::new(payload),
        })
    }
}

impl Drop for PropertyObject {
    fn drop(&mut self) {
        self.payload.get().decref();
    }
}

// =============================================================================
// Descriptor get / set
// =============================================================================

/// Invoke descriptor-get: resolve `descr` against `obj`.
///
/// `obj` may be null when the descriptor was found on the owner itself
/// (type-level access). Returns a new reference.
pub fn descr_get(descr: Value, obj: Value, _objtype: *mut TypeObject) -> UmbraResult<Value> {
    match kind_of(descr) {
        Some(ObjectKind::Function) => {
            if obj.is_null() {
                descr.incref();
                Ok(descr)
            } else {
                Ok(BoundMethodObject::alloc(descr, obj))
            }
        }
        Some(ObjectKind::Property) => {
            let prop = unsafe { super::object_ref::<PropertyObject>(descr) };
            match prop.get {
                Some(get) => get(prop, obj),
                None => Err(RuntimeError::attribute_error(
                    type_name_of(obj),
                    "unreadable attribute",
                )),
            }
        }
        Some(ObjectKind::SlotDescr) => {
            let slot = unsafe { super::object_ref::<SlotDescriptor>(descr) };
            if obj.is_null() {
                descr.incref();
                return Ok(descr);
            }
            let value = unsafe { slot_load(obj, slot.offset) };
            if value.is_null() {
                Err(RuntimeError::attribute_error(
                    type_name_of(obj),
                    slot.name.as_str(),
                ))
            } else {
                value.incref();
                Ok(value)
            }
        }
        _ => {
            descr.incref();
            Ok(descr)
        }
    }
}

/// Invoke descriptor-set: store `value` through `descr` on `obj`.
pub fn descr_set(descr: Value, obj: Value, value: Value) -> UmbraResult<()> {
    match kind_of(descr) {
        Some(ObjectKind::Property) => {
            let prop = unsafe { super::object_ref::<PropertyObject>(descr) };
            match prop.set {
                Some(set) => set(prop, obj, value),
                None => Err(RuntimeError::attribute_error(
                    type_name_of(obj),
                    "can't set attribute",
                )),
            }
        }
        Some(ObjectKind::SlotDescr) => {
            let slot = unsafe { super::object_ref::<SlotDescriptor>(descr) };
            unsafe { slot_store(obj, slot.offset, value) };
            Ok(())
        }
        _ => Err(RuntimeError::type_error(format!(
            "'{}' object is not a descriptor",
            type_name_of(descr)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_core::intern;

    #[test]
    fn test_classify_plain_values() {
        assert_eq!(classify_attr(Value::from_int(1)), AttrKind::Plain);
        assert_eq!(classify_attr(Value::null()), AttrKind::Plain);
    }

    #[test]
    fn test_classify_slot_descriptor() {
        let descr = SlotDescriptor::alloc(intern("x"), 32);
        assert_eq!(classify_attr(descr), AttrKind::SlotDescr);
        assert!(has_descr_get(descr));
        descr.decref();
    }

    #[test]
    fn test_property_is_data_descriptor() {
        fn get_payload(prop: &PropertyObject, _obj: Value) -> UmbraResult<Value> {
            let v = prop.payload.get();
            v.incref();
            Ok(v)
        }
        let prop = PropertyObject::alloc(Some(get_payload), None, Value::from_int(11));
        assert_eq!(classify_attr(prop), AttrKind::DataDescr);

        let got = descr_get(prop, Value::null(), std::ptr::null_mut()).unwrap();
        assert_eq!(got.as_int(), 11);
        prop.decref();
    }

    #[test]
    fn test_property_without_setter_rejects_set() {
        let prop = PropertyObject::alloc(None, None, Value::null());
        let err = descr_set(prop, Value::null(), Value::from_int(1)).unwrap_err();
        assert_eq!(err.kind, umbra_core::RuntimeErrorKind::AttributeError);
        prop.decref();
    }
}
