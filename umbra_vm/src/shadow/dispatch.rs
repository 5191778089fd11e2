//! Specialization dispatcher.
//!
//! Given an observed (owner, name) pair at a cache-aware site, pick the
//! most specific cache variant, build or reuse an entry, register it with
//! the owner type's directory, and patch the site's opcode. The variant
//! preference follows hit-path cost: slot, then split dict, then combined
//! dict, then descriptor, with the method forms chosen only when the site
//! is an actual method load.
//!
//! A site that already holds an entry for a *different* type is promoted
//! to a polymorphic array (LOAD_ATTR only); uncacheable observations pin
//! the site to its family's uncachable opcode and fall back to generic
//! resolution.

use std::sync::Arc;

use umbra_core::{InternedString, Value};
use umbra_runtime::object::descriptor::SlotDescriptor;
use umbra_runtime::object::instance::instance_dict;
use umbra_runtime::object::module::ModuleObject;
use umbra_runtime::object::object_ref;
use umbra_runtime::types::dict::{keys_address, DictObject};
use umbra_runtime::{kind_of, type_of, AttrKind, ObjectKind, TypeFlags, TypeObject};

use super::arena::ShadowCode;
use super::entries::{poisoned_keys, CacheKind, InstanceAttrEntry, ModuleAttrEntry};
use super::generic;
use super::entries::GlobalCacheEntry;
use super::registry::{self, Dependent};
use super::stats::{record_stat, record_uncachable, UncachableKind};
use crate::bytecode::Opcode;
use crate::error::VmResult;

// =============================================================================
// Classification
// =============================================================================

enum Classified {
    Entry(Arc<InstanceAttrEntry>),
    Uncachable(UncachableKind),
}

/// Current split-ness of an instance's dict shape. A dict that has not
/// been materialized yet will be split when it is, sharing the type's
/// cached keys.
fn split_shape(owner: Value, tref: &TypeObject) -> bool {
    if !tref.has_instance_dict() {
        return false;
    }
    let dict = if kind_of(owner) == Some(ObjectKind::Instance) {
        instance_dict(owner)
    } else {
        std::ptr::null_mut()
    };
    if dict.is_null() {
        true
    } else {
        unsafe { &*dict }.is_split()
    }
}

/// Record the entry's view of the owner's split keys table: the slot of
/// the name, or the poisoned table address when the name has no slot.
fn fill_split_view(entry: &InstanceAttrEntry, owner: Value, tref: &TypeObject) {
    let dict = if kind_of(owner) == Some(ObjectKind::Instance) {
        instance_dict(owner)
    } else {
        std::ptr::null_mut()
    };
    let keys = if dict.is_null() {
        tref.cached_keys()
    } else {
        match unsafe { &*dict }.keys_arc() {
            Some(keys) => keys,
            None => tref.cached_keys(),
        }
    };
    let addr = keys_address(&keys);
    match keys.split_index(&entry.name) {
        Some(idx) => entry.set_split_view(addr, idx as isize, keys.nentries()),
        None => entry.set_split_view(poisoned_keys(addr), -1, keys.nentries()),
    }
}

fn classify_load(
    tp: *mut TypeObject,
    owner: Value,
    name: &InternedString,
    for_method: bool,
) -> Classified {
    let tref = unsafe { &*tp };
    let dictoffset = tref.dictoffset;
    let has_dict = dictoffset != 0;
    let split = split_shape(owner, tref);

    match tref.lookup_mro(name) {
        Some((v, AttrKind::SlotDescr)) => {
            let slot = unsafe { object_ref::<SlotDescriptor>(v) };
            let entry = InstanceAttrEntry::new(name.clone(), CacheKind::Slot, tp, v, 0);
            entry.set_slot_offset(slot.offset);
            Classified::Entry(entry)
        }
        Some((v, AttrKind::DataDescr)) => {
            if has_dict {
                Classified::Uncachable(UncachableKind::DictDescrMix)
            } else {
                Classified::Entry(InstanceAttrEntry::new(
                    name.clone(),
                    CacheKind::NoDictDescr,
                    tp,
                    v,
                    0,
                ))
            }
        }
        Some((v, AttrKind::NonDataDescr)) | Some((v, AttrKind::Plain)) => {
            let is_function = kind_of(v) == Some(ObjectKind::Function);
            let kind = if for_method && is_function {
                if !has_dict {
                    CacheKind::NoDictMethod
                } else if split {
                    CacheKind::SplitDictMethod
                } else {
                    CacheKind::DictMethod
                }
            } else if !has_dict {
                CacheKind::NoDictDescr
            } else if split {
                CacheKind::SplitDictDescr
            } else {
                CacheKind::DictDescr
            };
            let entry = InstanceAttrEntry::new(name.clone(), kind, tp, v, dictoffset);
            if matches!(
                kind,
                CacheKind::SplitDictDescr | CacheKind::SplitDictMethod
            ) {
                fill_split_view(&entry, owner, tref);
            }
            Classified::Entry(entry)
        }
        None => {
            if !has_dict {
                Classified::Uncachable(UncachableKind::GetattrUnknown)
            } else if split {
                let entry = InstanceAttrEntry::new(
                    name.clone(),
                    CacheKind::SplitDict,
                    tp,
                    Value::null(),
                    dictoffset,
                );
                fill_split_view(&entry, owner, tref);
                Classified::Entry(entry)
            } else {
                Classified::Entry(InstanceAttrEntry::new(
                    name.clone(),
                    CacheKind::DictNoDescr,
                    tp,
                    Value::null(),
                    dictoffset,
                ))
            }
        }
    }
}

fn classify_store(tp: *mut TypeObject, owner: Value, name: &InternedString) -> Classified {
    let tref = unsafe { &*tp };
    let dictoffset = tref.dictoffset;
    let has_dict = dictoffset != 0;
    let split = split_shape(owner, tref);

    match tref.lookup_mro(name) {
        Some((v, AttrKind::SlotDescr)) => {
            let slot = unsafe { object_ref::<SlotDescriptor>(v) };
            let entry = InstanceAttrEntry::new(name.clone(), CacheKind::Slot, tp, v, 0);
            entry.set_slot_offset(slot.offset);
            Classified::Entry(entry)
        }
        Some((v, AttrKind::DataDescr)) => {
            if has_dict {
                Classified::Uncachable(UncachableKind::DictDescrMix)
            } else {
                Classified::Entry(InstanceAttrEntry::new(
                    name.clone(),
                    CacheKind::NoDictDescr,
                    tp,
                    v,
                    0,
                ))
            }
        }
        _ if has_dict => {
            let kind = if split {
                CacheKind::SplitDict
            } else {
                CacheKind::DictNoDescr
            };
            let entry =
                InstanceAttrEntry::new(name.clone(), kind, tp, Value::null(), dictoffset);
            if kind == CacheKind::SplitDict {
                fill_split_view(&entry, owner, tref);
            }
            Classified::Entry(entry)
        }
        _ => Classified::Uncachable(UncachableKind::GetattrUnknown),
    }
}

// =============================================================================
// Registration and reuse
// =============================================================================

/// A still-valid second-level entry whose recorded shape is compatible
/// with the owner's current shape.
fn reuse_l2(
    tp: *mut TypeObject,
    owner: Value,
    name: &InternedString,
) -> Option<Arc<InstanceAttrEntry>> {
    let entry = registry::find_for_type(tp)?.l2_lookup(name)?;
    if !entry.matches_type(tp) {
        return None;
    }
    let split_now = split_shape(owner, unsafe { &*tp });
    let kind_split = matches!(
        entry.kind,
        CacheKind::SplitDict | CacheKind::SplitDictDescr | CacheKind::SplitDictMethod
    );
    // A split-shaped entry over a combined dict would never stop missing.
    if kind_split && !split_now {
        return None;
    }
    Some(entry)
}

fn register_entry(
    shadow: &ShadowCode,
    tp: *mut TypeObject,
    name: &InternedString,
    entry: &Arc<InstanceAttrEntry>,
) {
    if let Some(dir) = registry::get_or_create_for_type(tp) {
        dir.set_metatype(unsafe { &*tp }.header.type_obj);
        dir.record_dependency(shadow.arena_id(), name, Dependent::Instance(Arc::clone(entry)));
        dir.l2_insert(name, Arc::clone(entry));
    }
}

// =============================================================================
// Site patching
// =============================================================================

fn patch_load_attr_site(shadow: &mut ShadowCode, ip: usize, entry: &Arc<InstanceAttrEntry>) {
    let unit = shadow.unit(ip);
    let opcode = entry.kind.ops().load_attr_opcode;

    if unit.opcode.is_instance_load_attr() {
        let existing = shadow.instance_entry(unit.arg);
        if Arc::ptr_eq(&existing, entry) {
            if unit.opcode != opcode {
                shadow.patch(ip, opcode, unit.arg);
            }
            return;
        }
        if !existing.is_valid() || existing.type_ptr() == entry.type_ptr() {
            shadow.replace_instance_entry(unit.arg, Arc::clone(entry));
            shadow.patch(ip, opcode, unit.arg);
            return;
        }
        // Second live type at one site: promote to a polymorphic array.
        match shadow.add_polymorphic([existing, Arc::clone(entry)]) {
            Some(pidx) => {
                shadow.patch(ip, Opcode::LoadAttrPolymorphic, pidx);
            }
            None => {
                shadow.patch(ip, Opcode::LoadAttrUncachable, 0);
            }
        }
        return;
    }

    if unit.opcode == Opcode::LoadAttrPolymorphic {
        shadow.polymorphic_mut(unit.arg).insert(Arc::clone(entry));
        return;
    }

    if let Some(idx) = shadow.add_instance_entry(Arc::clone(entry)) {
        shadow.patch(ip, opcode, idx);
    }
}

fn patch_load_method_site(shadow: &mut ShadowCode, ip: usize, entry: &Arc<InstanceAttrEntry>) {
    let unit = shadow.unit(ip);
    let opcode = entry.kind.ops().load_method_opcode;

    if unit.opcode.is_instance_load_method() {
        shadow.replace_instance_entry(unit.arg, Arc::clone(entry));
        if unit.opcode != opcode {
            shadow.patch(ip, opcode, unit.arg);
        }
        return;
    }
    if let Some(idx) = shadow.add_instance_entry(Arc::clone(entry)) {
        shadow.patch(ip, opcode, idx);
    }
}

fn patch_store_attr_site(shadow: &mut ShadowCode, ip: usize, entry: &Arc<InstanceAttrEntry>) {
    let unit = shadow.unit(ip);
    let opcode = entry.kind.ops().store_attr_opcode;

    if unit.opcode.is_instance_store_attr() {
        shadow.replace_instance_entry(unit.arg, Arc::clone(entry));
        if unit.opcode != opcode {
            shadow.patch(ip, opcode, unit.arg);
        }
        return;
    }
    if let Some(idx) = shadow.add_instance_entry(Arc::clone(entry)) {
        shadow.patch(ip, opcode, idx);
    }
}

// =============================================================================
// Owner-kind entry points
// =============================================================================

/// Family of the site being specialized.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Family {
    Attr,
    Method,
}

fn specialize_type_owner(
    shadow: &mut ShadowCode,
    ip: usize,
    tp: *mut TypeObject,
    name: &InternedString,
    family: Family,
) {
    let tref = unsafe { &*tp };
    let generic_op = match family {
        Family::Attr => Opcode::LoadAttr,
        Family::Method => Opcode::LoadMethod,
    };
    let metatype = tref.header.type_obj;
    let meta_custom = !metatype.is_null()
        && unsafe { &*metatype }
            .flags
            .contains(TypeFlags::CUSTOM_GETATTRIBUTE);
    if meta_custom || !tref.is_cacheable() {
        record_uncachable(generic_op, UncachableKind::GetattrType);
        shadow.patch(ip, generic_op.family_uncachable(), 0);
        return;
    }

    let Some((v, _)) = tref.lookup_mro(name) else {
        // Missing type attribute: the generic path raises; nothing to cache.
        return;
    };

    let entry = InstanceAttrEntry::new(name.clone(), CacheKind::NoDictDescr, tp, v, 0);
    record_stat!(
        match family {
            Family::Attr => Opcode::LoadAttrType,
            Family::Method => Opcode::LoadMethodType,
        },
        Entries
    );
    register_entry(shadow, tp, name, &entry);
    // Type-owner resolutions also depend on the metatype.
    if !metatype.is_null() {
        if let Some(mdir) = registry::get_or_create_for_type(metatype) {
            mdir.record_dependency(shadow.arena_id(), name, Dependent::Instance(Arc::clone(&entry)));
        }
    }

    let opcode = match family {
        Family::Attr => Opcode::LoadAttrType,
        Family::Method => Opcode::LoadMethodType,
    };
    let unit = shadow.unit(ip);
    if unit.opcode == opcode {
        shadow.replace_instance_entry(unit.arg, entry);
    } else if let Some(idx) = shadow.add_instance_entry(entry) {
        shadow.patch(ip, opcode, idx);
    }
}

fn specialize_module_owner(
    shadow: &mut ShadowCode,
    ip: usize,
    module_ptr: *mut ModuleObject,
    name: &InternedString,
    family: Family,
) {
    let module = unsafe { &*module_ptr };
    let Some(v) = module.get(name) else {
        return;
    };

    let entry = ModuleAttrEntry::new(name.clone(), module_ptr, module.version(), v);
    let opcode = match family {
        Family::Attr => Opcode::LoadAttrModule,
        Family::Method => Opcode::LoadMethodModule,
    };
    record_stat!(opcode, Entries);
    if let Some(dir) = registry::get_or_create_for_module(module_ptr) {
        dir.record_dependency(shadow.arena_id(), name, Dependent::Module(Arc::clone(&entry)));
    }

    let unit = shadow.unit(ip);
    if unit.opcode == opcode {
        shadow.replace_module_entry(unit.arg, entry);
    } else if let Some(idx) = shadow.add_module_entry(entry) {
        shadow.patch(ip, opcode, idx);
    }
}

// =============================================================================
// LOAD_ATTR
// =============================================================================

/// Resolve a LOAD_ATTR site generically and specialize it for the
/// observed owner.
pub(crate) fn load_attr_with_cache(
    shadow: &mut ShadowCode,
    ip: usize,
    owner: Value,
    name: &InternedString,
) -> VmResult<Value> {
    match kind_of(owner) {
        Some(ObjectKind::Type) => {
            let tp = owner.as_object() as *mut TypeObject;
            specialize_type_owner(shadow, ip, tp, name, Family::Attr);
            generic::type_getattr(unsafe { &*tp }, name)
        }
        Some(ObjectKind::Module) => {
            let module = owner.as_object() as *mut ModuleObject;
            specialize_module_owner(shadow, ip, module, name, Family::Attr);
            generic::module_getattr(unsafe { &*module }, name)
        }
        Some(ObjectKind::Super) => {
            record_uncachable(Opcode::LoadAttr, UncachableKind::GetattrSuper);
            shadow.patch(ip, Opcode::LoadAttrUncachable, 0);
            generic::get_attr(owner, name)
        }
        Some(ObjectKind::Instance) => {
            let tp = type_of(owner);
            let tref = unsafe { &*tp };
            if !tref.is_cacheable() {
                let cat = if tref.flags.contains(TypeFlags::CUSTOM_GETATTRIBUTE) {
                    UncachableKind::GetattrType
                } else {
                    UncachableKind::GetattrUnknown
                };
                record_uncachable(Opcode::LoadAttr, cat);
                shadow.patch(ip, Opcode::LoadAttrUncachable, 0);
                return generic::get_attr(owner, name);
            }

            let (entry, created) = match reuse_l2(tp, owner, name) {
                Some(entry) => (entry, false),
                None => match classify_load(tp, owner, name, false) {
                    Classified::Entry(entry) => (entry, true),
                    Classified::Uncachable(cat) => {
                        record_uncachable(Opcode::LoadAttr, cat);
                        shadow.patch(ip, Opcode::LoadAttrUncachable, 0);
                        return generic::get_attr(owner, name);
                    }
                },
            };
            if created {
                record_stat!(entry.kind.ops().load_attr_opcode, Entries);
            }
            register_entry(shadow, tp, name, &entry);
            patch_load_attr_site(shadow, ip, &entry);
            // The specializing execution itself resolves generically; the
            // rewritten opcode takes over from the next execution.
            generic::get_attr(owner, name)
        }
        _ => {
            record_uncachable(Opcode::LoadAttr, UncachableKind::GetattrUnknown);
            shadow.patch(ip, Opcode::LoadAttrUncachable, 0);
            generic::get_attr(owner, name)
        }
    }
}

// =============================================================================
// LOAD_METHOD
// =============================================================================

/// Resolve a LOAD_METHOD site generically and specialize it for the
/// observed owner.
pub(crate) fn load_method_with_cache(
    shadow: &mut ShadowCode,
    ip: usize,
    owner: Value,
    name: &InternedString,
) -> VmResult<(Value, Value)> {
    match kind_of(owner) {
        Some(ObjectKind::Type) => {
            let tp = owner.as_object() as *mut TypeObject;
            specialize_type_owner(shadow, ip, tp, name, Family::Method);
            let v = generic::type_getattr(unsafe { &*tp }, name)?;
            Ok((Value::null(), v))
        }
        Some(ObjectKind::Module) => {
            let module = owner.as_object() as *mut ModuleObject;
            specialize_module_owner(shadow, ip, module, name, Family::Method);
            let v = generic::module_getattr(unsafe { &*module }, name)?;
            Ok((Value::null(), v))
        }
        Some(ObjectKind::Super) => {
            record_uncachable(Opcode::LoadMethod, UncachableKind::GetattrSuper);
            shadow.patch(ip, Opcode::LoadMethodUncachable, 0);
            generic::load_method(owner, name)
        }
        Some(ObjectKind::Instance) => {
            let tp = type_of(owner);
            let tref = unsafe { &*tp };
            if !tref.is_cacheable() {
                let cat = if tref.flags.contains(TypeFlags::CUSTOM_GETATTRIBUTE) {
                    UncachableKind::GetattrType
                } else {
                    UncachableKind::GetattrUnknown
                };
                record_uncachable(Opcode::LoadMethod, cat);
                shadow.patch(ip, Opcode::LoadMethodUncachable, 0);
                return generic::load_method(owner, name);
            }

            let (entry, created) = match reuse_l2(tp, owner, name) {
                Some(entry) => (entry, false),
                None => match classify_load(tp, owner, name, true) {
                    Classified::Entry(entry) => (entry, true),
                    Classified::Uncachable(cat) => {
                        record_uncachable(Opcode::LoadMethod, cat);
                        shadow.patch(ip, Opcode::LoadMethodUncachable, 0);
                        return generic::load_method(owner, name);
                    }
                },
            };
            if created {
                record_stat!(entry.kind.ops().load_method_opcode, Entries);
            }
            register_entry(shadow, tp, name, &entry);
            patch_load_method_site(shadow, ip, &entry);
            generic::load_method(owner, name)
        }
        _ => {
            record_uncachable(Opcode::LoadMethod, UncachableKind::GetattrUnknown);
            shadow.patch(ip, Opcode::LoadMethodUncachable, 0);
            generic::load_method(owner, name)
        }
    }
}

// =============================================================================
// STORE_ATTR
// =============================================================================

/// Resolve a STORE_ATTR site generically and specialize it for the
/// observed owner.
pub(crate) fn store_attr_with_cache(
    shadow: &mut ShadowCode,
    ip: usize,
    owner: Value,
    name: &InternedString,
    value: Value,
) -> VmResult<()> {
    if kind_of(owner) != Some(ObjectKind::Instance) {
        record_uncachable(Opcode::StoreAttr, UncachableKind::GetattrUnknown);
        shadow.patch(ip, Opcode::StoreAttrUncachable, 0);
        return generic::set_attr(owner, name, value);
    }

    let tp = type_of(owner);
    let tref = unsafe { &*tp };
    if !tref.is_cacheable() {
        let cat = if tref.flags.contains(TypeFlags::CUSTOM_GETATTRIBUTE) {
            UncachableKind::GetattrType
        } else {
            UncachableKind::GetattrUnknown
        };
        record_uncachable(Opcode::StoreAttr, cat);
        shadow.patch(ip, Opcode::StoreAttrUncachable, 0);
        return generic::set_attr(owner, name, value);
    }

    let (entry, created) = match reuse_l2(tp, owner, name) {
        Some(entry) => (entry, false),
        None => match classify_store(tp, owner, name) {
            Classified::Entry(entry) => (entry, true),
            Classified::Uncachable(cat) => {
                record_uncachable(Opcode::StoreAttr, cat);
                shadow.patch(ip, Opcode::StoreAttrUncachable, 0);
                return generic::set_attr(owner, name, value);
            }
        },
    };
    if created {
        record_stat!(entry.kind.ops().store_attr_opcode, Entries);
    }
    register_entry(shadow, tp, name, &entry);
    patch_store_attr_site(shadow, ip, &entry);
    generic::set_attr(owner, name, value)
}

// =============================================================================
// LOAD_GLOBAL
// =============================================================================

/// Resolve a LOAD_GLOBAL site and cache the binding with the combined
/// globals/builtins version.
pub(crate) fn load_global_with_cache(
    shadow: &mut ShadowCode,
    ip: usize,
    globals: &DictObject,
    builtins: &DictObject,
    name: &InternedString,
) -> VmResult<Value> {
    let v = globals
        .get(name)
        .or_else(|| builtins.get(name))
        .ok_or_else(|| umbra_core::RuntimeError::name_error(name))?;

    let combined = globals.version().max(builtins.version());
    let entry = GlobalCacheEntry::new(name.clone(), combined, v);
    if let Some(idx) = shadow.add_global_entry(entry) {
        record_stat!(Opcode::LoadGlobalCached, Entries);
        shadow.patch(ip, Opcode::LoadGlobalCached, idx);
    }
    v.incref();
    Ok(v)
}

// =============================================================================
// BINARY_SUBSCR
// =============================================================================

/// Resolve a BINARY_SUBSCR site generically and specialize by container
/// kind.
pub(crate) fn binary_subscr_with_cache(
    shadow: &mut ShadowCode,
    ip: usize,
    container: Value,
    sub: Value,
    _oparg: u8,
) -> VmResult<Value> {
    let current = shadow.unit(ip).opcode;
    match kind_of(container) {
        Some(ObjectKind::List) if sub.is_int() => {
            shadow.patch(ip, Opcode::BinarySubscrList, 0);
        }
        Some(ObjectKind::Tuple) if sub.is_int() => {
            let i = sub.as_int();
            // A repeating small constant index gets the dedicated form;
            // once it stops repeating, fall back to the general one.
            if (0..=u8::MAX as i64).contains(&i)
                && current != Opcode::BinarySubscrTupleConstInt
                && current != Opcode::BinarySubscrTuple
            {
                shadow.patch(ip, Opcode::BinarySubscrTupleConstInt, i as u8);
            } else {
                shadow.patch(ip, Opcode::BinarySubscrTuple, 0);
            }
        }
        Some(ObjectKind::Dict) if umbra_runtime::types::scalar::str_key(sub).is_some() => {
            shadow.patch(ip, Opcode::BinarySubscrDict, 0);
        }
        _ => {
            record_uncachable(Opcode::BinarySubscr, UncachableKind::GetattrUnknown);
        }
    }
    generic::subscr(container, sub)
}
