//! Super proxies.
//!
//! A super proxy redirects attribute resolution to the MRO *after* a given
//! class. Resolution through a proxy depends on where in the hierarchy the
//! access happens, so proxies are never cacheable owners.

use umbra_core::Value;

use super::type_obj::{builtin_types, TypeObject};
use super::{alloc, ObjectHeader, ObjectKind};

/// A proxy resolving attributes on the MRO after `start_type`.
#[repr(C)]
pub struct SuperObject {
    /// Object header.
    pub header: ObjectHeader,
    /// The receiver.
    pub obj: Value,
    /// Resolution starts after this class in the receiver's MRO.
    pub start_type: *mut TypeObject,
}

impl SuperObject {
    /// Allocate a super proxy, retaining the receiver.
    pub fn alloc(obj: Value, start_type: *mut TypeObject) -> Value {
        let builtins = builtin_types();
        Value::from_object(builtins.super_type).incref();
        obj.incref();
        Value::from_object(start_type).incref();
        alloc(SuperObject {
            header: ObjectHeader::new(ObjectKind::Super, builtins.super_type),
            obj,
            start_type,
        })
    }
}

impl Drop for SuperObject {
    fn drop(&mut self) {
        self.obj.decref();
        Value::from_object(self.start_type).decref();
    }
}
