//! Generic attribute resolution.
//!
//! The uncached paths: full-protocol lookups the dispatcher falls back to
//! for uncacheable sites and uses to seed new cache entries. Resolution
//! order for instances is the standard one: data descriptor, instance
//! dict, non-data descriptor or class attribute, error.

use umbra_core::{InternedString, RuntimeError, Value};
use umbra_runtime::object::instance::{instance_dict, materialize_instance_dict, slot_load};
use umbra_runtime::object::module::ModuleObject;
use umbra_runtime::object::super_obj::SuperObject;
use umbra_runtime::object::{descriptor::SlotDescriptor, object_ref};
use umbra_runtime::types::dict::DictObject;
use umbra_runtime::types::scalar::str_key;
use umbra_runtime::types::sequence::{ListObject, TupleObject};
use umbra_runtime::{
    descr_get, descr_set, kind_of, type_name_of, type_of, AttrKind, ObjectKind, TypeObject,
};

use crate::error::VmResult;

fn attr_error(owner: Value, name: &InternedString) -> RuntimeError {
    RuntimeError::attribute_error(type_name_of(owner), name)
}

/// Full-protocol attribute load. Returns a new reference.
pub fn get_attr(owner: Value, name: &InternedString) -> VmResult<Value> {
    match kind_of(owner) {
        Some(ObjectKind::Type) => {
            type_getattr(unsafe { object_ref::<TypeObject>(owner) }, name)
        }
        Some(ObjectKind::Module) => {
            module_getattr(unsafe { object_ref::<ModuleObject>(owner) }, name)
        }
        Some(ObjectKind::Super) => {
            super_getattr(unsafe { object_ref::<SuperObject>(owner) }, name)
        }
        _ => instance_getattr(owner, name),
    }
}

fn instance_getattr(owner: Value, name: &InternedString) -> VmResult<Value> {
    let tp = type_of(owner);
    if tp.is_null() {
        return Err(attr_error(owner, name));
    }
    let tp_ref = unsafe { &*tp };
    let resolved = tp_ref.lookup_mro(name);

    match resolved {
        Some((descr, AttrKind::SlotDescr)) => {
            let slot = unsafe { object_ref::<SlotDescriptor>(descr) };
            let v = unsafe { slot_load(owner, slot.offset) };
            if v.is_null() {
                Err(attr_error(owner, name))
            } else {
                v.incref();
                Ok(v)
            }
        }
        Some((descr, AttrKind::DataDescr)) => {
            descr.incref();
            let res = descr_get(descr, owner, tp);
            descr.decref();
            res
        }
        other => {
            // Instance dict next; only real instances carry one.
            if kind_of(owner) == Some(ObjectKind::Instance) && tp_ref.has_instance_dict() {
                let dict = instance_dict(owner);
                if !dict.is_null() {
                    if let Some(v) = unsafe { &*dict }.get_with_error(name)? {
                        v.incref();
                        return Ok(v);
                    }
                }
            }
            match other {
                Some((descr, _)) => {
                    descr.incref();
                    let res = descr_get(descr, owner, tp);
                    descr.decref();
                    res
                }
                None => Err(attr_error(owner, name)),
            }
        }
    }
}

/// Full-protocol attribute store.
pub fn set_attr(owner: Value, name: &InternedString, value: Value) -> VmResult<()> {
    let tp = type_of(owner);
    if tp.is_null() {
        return Err(attr_error(owner, name));
    }
    let tp_ref = unsafe { &*tp };

    match tp_ref.lookup_mro(name) {
        Some((descr, AttrKind::SlotDescr)) | Some((descr, AttrKind::DataDescr)) => {
            descr.incref();
            let res = descr_set(descr, owner, value);
            descr.decref();
            res
        }
        _ => {
            if kind_of(owner) == Some(ObjectKind::Instance) && tp_ref.has_instance_dict() {
                let dict = materialize_instance_dict(owner);
                if !dict.is_null() {
                    unsafe { &*dict }.set(name, value);
                    return Ok(());
                }
            }
            Err(attr_error(owner, name))
        }
    }
}

/// Full-protocol method load: `(self_or_null, method)`, both new
/// references when non-null.
pub fn load_method(owner: Value, name: &InternedString) -> VmResult<(Value, Value)> {
    if kind_of(owner) == Some(ObjectKind::Instance) {
        let tp = type_of(owner);
        let tp_ref = unsafe { &*tp };
        if let Some((descr, AttrKind::NonDataDescr)) = tp_ref.lookup_mro(name) {
            if kind_of(descr) == Some(ObjectKind::Function) {
                descr.incref();
                if tp_ref.has_instance_dict() {
                    let dict = instance_dict(owner);
                    if !dict.is_null() {
                        match unsafe { &*dict }.get_with_error(name) {
                            Ok(Some(attr)) => {
                                descr.decref();
                                attr.incref();
                                return Ok((Value::null(), attr));
                            }
                            Ok(None) => {}
                            Err(e) => {
                                descr.decref();
                                return Err(e);
                            }
                        }
                    }
                }
                owner.incref();
                return Ok((owner, descr));
            }
        }
    }
    let bound = get_attr(owner, name)?;
    Ok((Value::null(), bound))
}

/// Attribute load with a type as the owner.
pub fn type_getattr(ty: &TypeObject, name: &InternedString) -> VmResult<Value> {
    match ty.lookup_mro(name) {
        Some((v, _)) => {
            v.incref();
            if umbra_runtime::has_descr_get(v) {
                // Found on the owner itself: no instance argument.
                let res = descr_get(v, Value::null(), ty.as_ptr());
                v.decref();
                res
            } else {
                Ok(v)
            }
        }
        None => Err(RuntimeError::new(
            umbra_core::RuntimeErrorKind::AttributeError,
            format!("type object '{}' has no attribute '{}'", ty.name, name),
        )),
    }
}

/// Attribute load with a module as the owner.
pub fn module_getattr(module: &ModuleObject, name: &InternedString) -> VmResult<Value> {
    match module.get(name) {
        Some(v) => {
            v.incref();
            Ok(v)
        }
        None => Err(RuntimeError::module_attribute_error(&module.name, name)),
    }
}

/// Attribute load through a super proxy: resolution starts after the
/// proxy's start class.
pub fn super_getattr(sup: &SuperObject, name: &InternedString) -> VmResult<Value> {
    let start = unsafe { &*sup.start_type };
    for &base in start.mro_bases().iter() {
        let base_ref = unsafe { &*base };
        if let Some(v) = base_ref.get_attr_local(name) {
            v.incref();
            let res = descr_get(v, sup.obj, type_of(sup.obj));
            v.decref();
            return res;
        }
    }
    Err(attr_error(sup.obj, name))
}

/// Generic subscript.
pub fn subscr(container: Value, sub: Value) -> VmResult<Value> {
    match kind_of(container) {
        Some(ObjectKind::List) => {
            let list = unsafe { object_ref::<ListObject>(container) };
            let v = index_into(sub, list.len())
                .and_then(|i| list.get(i))
                .ok_or_else(|| RuntimeError::index_error("list"))?;
            v.incref();
            Ok(v)
        }
        Some(ObjectKind::Tuple) => {
            let tuple = unsafe { object_ref::<TupleObject>(container) };
            let v = index_into(sub, tuple.len())
                .and_then(|i| tuple.get(i))
                .ok_or_else(|| RuntimeError::index_error("tuple"))?;
            v.incref();
            Ok(v)
        }
        Some(ObjectKind::Dict) => {
            let key = str_key(sub).ok_or_else(|| {
                RuntimeError::type_error(format!("unhashable key: '{}'", type_name_of(sub)))
            })?;
            let dict = unsafe { object_ref::<DictObject>(container) };
            match dict.get_with_error(&key)? {
                Some(v) => {
                    v.incref();
                    Ok(v)
                }
                None => Err(RuntimeError::key_error(&key)),
            }
        }
        _ => Err(RuntimeError::type_error(format!(
            "'{}' object is not subscriptable",
            type_name_of(container)
        ))),
    }
}

fn index_into(sub: Value, len: usize) -> Option<usize> {
    if !sub.is_int() {
        return None;
    }
    let i = sub.as_int();
    let idx = if i < 0 { i + len as i64 } else { i };
    if idx < 0 || idx as usize >= len {
        None
    } else {
        Some(idx as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_core::intern;
    use umbra_runtime::object::instance::{alloc_instance, slot_store};
    use umbra_runtime::types::function::FunctionObject;
    use umbra_runtime::ClassBuilder;

    #[test]
    fn test_instance_dict_shadows_class_attr() {
        let ty = ClassBuilder::new("Shadowing").build();
        let name = intern("color");
        unsafe { &*ty }.set_attr(name.clone(), Value::from_int(1));

        let obj = alloc_instance(ty);
        assert_eq!(get_attr(obj, &name).unwrap().as_int(), 1);

        set_attr(obj, &name, Value::from_int(2)).unwrap();
        assert_eq!(get_attr(obj, &name).unwrap().as_int(), 2);
        obj.decref();
    }

    #[test]
    fn test_slot_access() {
        let ty = ClassBuilder::new("Slotty").slot("x").no_dict().build();
        let obj = alloc_instance(ty);
        let name = intern("x");

        let err = get_attr(obj, &name).unwrap_err();
        assert_eq!(err.kind, umbra_core::RuntimeErrorKind::AttributeError);

        let offset = unsafe { &*ty }.slots[0].1;
        unsafe { slot_store(obj, offset, Value::from_int(5)) };
        assert_eq!(get_attr(obj, &name).unwrap().as_int(), 5);
        obj.decref();
    }

    #[test]
    fn test_method_load_unbound() {
        let ty = ClassBuilder::new("WithMethod").build();
        let name = intern("run");
        let func = FunctionObject::alloc(name.clone());
        unsafe { &*ty }.set_attr(name.clone(), func);

        let obj = alloc_instance(ty);
        let (self_v, meth) = load_method(obj, &name).unwrap();
        assert_eq!(self_v, obj);
        assert_eq!(meth, func);
        self_v.decref();
        meth.decref();
        obj.decref();
        func.decref();
    }

    #[test]
    fn test_subscr_kinds() {
        let list = ListObject::alloc(vec![Value::from_int(7)]);
        assert_eq!(subscr(list, Value::from_int(0)).unwrap().as_int(), 7);
        assert_eq!(subscr(list, Value::from_int(-1)).unwrap().as_int(), 7);
        assert!(subscr(list, Value::from_int(1)).is_err());
        assert!(subscr(Value::from_int(1), Value::from_int(0)).is_err());
        list.decref();
    }
}
