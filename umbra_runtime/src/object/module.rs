//! Module objects: a name plus a versioned dict.

use umbra_core::{InternedString, Value};

use super::type_obj::builtin_types;
use super::{alloc, object_ref, ObjectHeader, ObjectKind};
use crate::types::dict::DictObject;

/// A module: attribute access reads its dict, and caches validate against
/// the dict's version tag.
#[repr(C)]
pub struct ModuleObject {
    /// Object header.
    pub header: ObjectHeader,
    /// Module name.
    pub name: InternedString,
    dict: Value,
}

impl ModuleObject {
    /// Allocate a module with an empty combined dict.
    pub fn alloc(name: InternedString) -> Value {
        let builtins = builtin_types();
        Value::from_object(builtins.module_type).incref();
        alloc(ModuleObject {
            header: ObjectHeader::new(ObjectKind::Module, builtins.module_type),
            name,
            dict: DictObject::alloc_combined(),
        })
    }

    /// The module's dict.
    #[inline]
    pub fn dict(&self) -> &DictObject {
        unsafe { object_ref::<DictObject>(self.dict) }
    }

    /// The module's version: its dict's version tag.
    #[inline]
    pub fn version(&self) -> u64 {
        self.dict().version()
    }

    /// Bind a module attribute.
    pub fn set(&self, name: &InternedString, value: Value) {
        self.dict().set(name, value);
    }

    /// Read a module attribute. Returns a borrowed value.
    pub fn get(&self, name: &InternedString) -> Option<Value> {
        self.dict().get(name)
    }
}

impl Drop for ModuleObject {
    fn drop(&mut self) {
        self.dict.decref();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_core::intern;

    #[test]
    fn test_module_version_follows_dict() {
        let m = ModuleObject::alloc(intern("toplevel"));
        let module = unsafe { object_ref::<ModuleObject>(m) };

        let v0 = module.version();
        module.set(&intern("flag"), Value::from_int(1));
        assert!(module.version() > v0);
        assert_eq!(module.get(&intern("flag")).unwrap().as_int(), 1);
        m.decref();
    }
}
