//! Fast-path opcode handlers.
//!
//! Each specialized opcode resolves in a short sequence: check the entry's
//! type guard (pointer equality), then read through the cached shape. A
//! failed guard takes the cold miss path, which records the miss and hands
//! the site back to the dispatcher to respecialize.
//!
//! Reference discipline on hit paths: any value the handler will still
//! need after a dict lookup or descriptor call is retained *first*. Those
//! operations can run arbitrary user code, which may invalidate the entry;
//! nothing is re-read from the entry afterwards, and errors propagate
//! verbatim.

use std::sync::Arc;

use umbra_core::{RuntimeError, Value};
use umbra_runtime::object::instance::{materialize_instance_dict, slot_load, slot_store};
use umbra_runtime::object::module::ModuleObject;
use umbra_runtime::types::dict::{keys_address, DictObject};
use umbra_runtime::{descr_get, descr_set, has_descr_get, kind_of, type_name_of, type_of, ObjectKind};

use super::arena::ShadowCode;
use super::dispatch;
use super::entries::{poisoned_keys, InstanceAttrEntry};
use super::stats::record_stat;
use crate::bytecode::Opcode;
use crate::error::VmResult;

// =============================================================================
// Shared helpers
// =============================================================================

/// The instance dict behind the entry's recorded dict offset; null when
/// absent or not yet materialized. Negative offsets resolve against the
/// guarded type's instance size.
#[inline]
fn entry_dict(owner: Value, entry: &InstanceAttrEntry) -> *mut DictObject {
    let off = entry.dictoffset();
    if off == 0 {
        return std::ptr::null_mut();
    }
    let resolved = if off >= 0 {
        off as usize
    } else {
        let tp = unsafe { &*entry.type_ptr() };
        (tp.basicsize as isize + off) as usize
    };
    let base = owner.as_object() as *mut u8;
    unsafe { *(base.add(resolved) as *mut *mut DictObject) }
}

fn attr_error(owner: Value, entry: &InstanceAttrEntry) -> RuntimeError {
    RuntimeError::attribute_error(type_name_of(owner), &entry.name)
}

/// Outcome of a split-dict probe.
enum SplitLookup {
    /// The instance-level value: a new reference, or null when the key is
    /// legitimately absent (negative hit).
    Value(Value),
    /// The dict is no longer split; the shape is gone and the site must
    /// respecialize.
    Shapeless,
}

/// Probe a split dict through a cache entry.
///
/// Three-way compare: matching keys table → indexed hit; poisoned keys
/// table with unchanged entry count → negative hit (the key is still
/// absent, no re-probe needed); anything else → refresh the entry's view
/// of the table (slight miss).
#[inline]
fn try_split_dict_lookup(
    entry: &InstanceAttrEntry,
    dict: *mut DictObject,
    opcode: Opcode,
) -> SplitLookup {
    if dict.is_null() {
        // No dict yet: nothing at instance level.
        return SplitLookup::Value(Value::null());
    }
    let d = unsafe { &*dict };
    let addr = d.keys_address();
    if addr == 0 {
        return SplitLookup::Shapeless;
    }
    if entry.keys() == addr {
        record_stat!(opcode, Hits);
        debug_assert!(entry.splitoffset() >= 0);
        let v = d.split_value(entry.splitoffset() as usize);
        if !v.is_null() {
            v.incref();
        }
        return SplitLookup::Value(v);
    }
    if entry.keys() == poisoned_keys(addr) && entry.nentries() == d.keys_nentries() {
        // Negative hit: same table, same entry count, key still absent.
        return SplitLookup::Value(Value::null());
    }
    record_stat!(opcode, SlightMisses);
    SplitLookup::Value(update_fast_cache(entry, d))
}

/// Refresh an entry's view of a split dict's keys table and fetch the
/// value, if any. Returns a new reference or null.
fn update_fast_cache(entry: &InstanceAttrEntry, d: &DictObject) -> Value {
    let Some(keys) = d.keys_arc() else {
        return Value::null();
    };
    let addr = keys_address(&keys);
    match keys.split_index(&entry.name) {
        Some(idx) => {
            entry.set_split_view(addr, idx as isize, keys.nentries());
            let v = d.split_value(idx as usize);
            if !v.is_null() {
                v.incref();
            }
            v
        }
        None => {
            entry.set_split_view(poisoned_keys(addr), -1, keys.nentries());
            Value::null()
        }
    }
}

// =============================================================================
// Miss paths
// =============================================================================

#[cold]
fn load_attr_miss(
    shadow: &mut ShadowCode,
    ip: usize,
    entry: &Arc<InstanceAttrEntry>,
    owner: Value,
    opcode: Opcode,
) -> VmResult<Value> {
    record_stat!(opcode, Misses);
    let name = entry.name.clone();
    dispatch::load_attr_with_cache(shadow, ip, owner, &name)
}

#[cold]
fn load_method_miss(
    shadow: &mut ShadowCode,
    ip: usize,
    entry: &Arc<InstanceAttrEntry>,
    owner: Value,
    opcode: Opcode,
) -> VmResult<(Value, Value)> {
    record_stat!(opcode, Misses);
    let name = entry.name.clone();
    dispatch::load_method_with_cache(shadow, ip, owner, &name)
}

#[cold]
fn store_attr_miss(
    shadow: &mut ShadowCode,
    ip: usize,
    entry: &Arc<InstanceAttrEntry>,
    owner: Value,
    value: Value,
    opcode: Opcode,
) -> VmResult<()> {
    record_stat!(opcode, Misses);
    let name = entry.name.clone();
    dispatch::store_attr_with_cache(shadow, ip, owner, &name, value)
}

// =============================================================================
// LOAD_ATTR fast paths
// =============================================================================

pub(crate) fn load_attr_dict_no_descr(
    shadow: &mut ShadowCode,
    ip: usize,
    entry: &Arc<InstanceAttrEntry>,
    owner: Value,
) -> VmResult<Value> {
    if !entry.matches_type(type_of(owner)) {
        return load_attr_miss(shadow, ip, entry, owner, Opcode::LoadAttrDictNoDescr);
    }
    record_stat!(Opcode::LoadAttrDictNoDescr, Hits);

    let dict = entry_dict(owner, entry);
    if !dict.is_null() {
        if let Some(v) = unsafe { &*dict }.get_with_error(&entry.name)? {
            v.incref();
            return Ok(v);
        }
    }
    Err(attr_error(owner, entry))
}

pub(crate) fn load_attr_dict_descr(
    shadow: &mut ShadowCode,
    ip: usize,
    entry: &Arc<InstanceAttrEntry>,
    owner: Value,
) -> VmResult<Value> {
    let tp = type_of(owner);
    if !entry.matches_type(tp) {
        return load_attr_miss(shadow, ip, entry, owner, Opcode::LoadAttrDictDescr);
    }
    record_stat!(Opcode::LoadAttrDictDescr, Hits);

    // The dict lookup may run user code; keep the descriptor alive and do
    // not touch the entry again after it.
    let descr = entry.value();
    descr.incref();

    let dict = entry_dict(owner, entry);
    if !dict.is_null() {
        match unsafe { &*dict }.get_with_error(&entry.name) {
            Ok(Some(v)) => {
                v.incref();
                descr.decref();
                return Ok(v);
            }
            Ok(None) => {}
            Err(e) => {
                descr.decref();
                return Err(e);
            }
        }
    }

    if has_descr_get(descr) {
        let res = descr_get(descr, owner, tp);
        descr.decref();
        res
    } else {
        Ok(descr)
    }
}

pub(crate) fn load_attr_slot(
    shadow: &mut ShadowCode,
    ip: usize,
    entry: &Arc<InstanceAttrEntry>,
    owner: Value,
) -> VmResult<Value> {
    if !entry.matches_type(type_of(owner)) {
        return load_attr_miss(shadow, ip, entry, owner, Opcode::LoadAttrSlot);
    }
    record_stat!(Opcode::LoadAttrSlot, Hits);

    let v = unsafe { slot_load(owner, entry.splitoffset() as usize) };
    if v.is_null() {
        Err(attr_error(owner, entry))
    } else {
        v.incref();
        Ok(v)
    }
}

pub(crate) fn load_attr_split_dict(
    shadow: &mut ShadowCode,
    ip: usize,
    entry: &Arc<InstanceAttrEntry>,
    owner: Value,
) -> VmResult<Value> {
    if !entry.matches_type(type_of(owner)) {
        return load_attr_miss(shadow, ip, entry, owner, Opcode::LoadAttrSplitDict);
    }
    let dict = entry_dict(owner, entry);
    match try_split_dict_lookup(entry, dict, Opcode::LoadAttrSplitDict) {
        SplitLookup::Value(v) if !v.is_null() => Ok(v),
        SplitLookup::Value(_) => Err(attr_error(owner, entry)),
        SplitLookup::Shapeless => {
            load_attr_miss(shadow, ip, entry, owner, Opcode::LoadAttrSplitDict)
        }
    }
}

pub(crate) fn load_attr_split_dict_descr(
    shadow: &mut ShadowCode,
    ip: usize,
    entry: &Arc<InstanceAttrEntry>,
    owner: Value,
) -> VmResult<Value> {
    let tp = type_of(owner);
    if !entry.matches_type(tp) {
        return load_attr_miss(shadow, ip, entry, owner, Opcode::LoadAttrSplitDictDescr);
    }
    let descr = entry.value();
    descr.incref();

    let dict = entry_dict(owner, entry);
    match try_split_dict_lookup(entry, dict, Opcode::LoadAttrSplitDictDescr) {
        SplitLookup::Value(v) if !v.is_null() => {
            descr.decref();
            Ok(v)
        }
        SplitLookup::Value(_) => {
            // Nothing at instance level: the cached descriptor answers.
            record_stat!(Opcode::LoadAttrSplitDictDescr, Hits);
            if has_descr_get(descr) {
                let res = descr_get(descr, owner, tp);
                descr.decref();
                res
            } else {
                Ok(descr)
            }
        }
        SplitLookup::Shapeless => {
            descr.decref();
            load_attr_miss(shadow, ip, entry, owner, Opcode::LoadAttrSplitDictDescr)
        }
    }
}

pub(crate) fn load_attr_no_dict_descr(
    shadow: &mut ShadowCode,
    ip: usize,
    entry: &Arc<InstanceAttrEntry>,
    owner: Value,
) -> VmResult<Value> {
    let tp = type_of(owner);
    if !entry.matches_type(tp) {
        return load_attr_miss(shadow, ip, entry, owner, Opcode::LoadAttrNoDictDescr);
    }
    record_stat!(Opcode::LoadAttrNoDictDescr, Hits);

    let descr = entry.value();
    descr.incref();
    if has_descr_get(descr) {
        let res = descr_get(descr, owner, tp);
        descr.decref();
        res
    } else {
        Ok(descr)
    }
}

/// Type-owner fast path: the guard compares the owner itself.
pub(crate) fn load_attr_type(
    shadow: &mut ShadowCode,
    ip: usize,
    idx: u8,
    owner: Value,
) -> VmResult<Value> {
    let entry = shadow.instance_entry(idx);
    if entry.is_valid() && entry.type_ptr() as *mut () == owner.as_object() {
        record_stat!(Opcode::LoadAttrType, Hits);
        let v = entry.value();
        v.incref();
        if has_descr_get(v) {
            // Found on the owner itself: descriptor-get with no instance.
            record_stat!(Opcode::LoadAttrType, SlightMisses);
            let res = descr_get(v, Value::null(), entry.type_ptr());
            v.decref();
            return res;
        }
        return Ok(v);
    }
    record_stat!(Opcode::LoadAttrType, Misses);
    let name = entry.name.clone();
    dispatch::load_attr_with_cache(shadow, ip, owner, &name)
}

/// Module fast path: validated by the module dict's version tag, refreshed
/// in place when the tag drifts.
pub(crate) fn load_attr_module(
    shadow: &mut ShadowCode,
    ip: usize,
    idx: u8,
    owner: Value,
) -> VmResult<Value> {
    let entry = shadow.module_entry(idx);
    let module_ptr = owner.as_object() as *mut ModuleObject;
    if !module_ptr.is_null() && entry.module_ptr() == module_ptr {
        let module = unsafe { &*module_ptr };
        if entry.version() != module.version() {
            match module.get(&entry.name) {
                Some(v) => {
                    record_stat!(Opcode::LoadAttrModule, SlightMisses);
                    entry.refresh(module.version(), v);
                }
                None => {
                    record_stat!(Opcode::LoadAttrModule, Misses);
                    entry.invalidate();
                    return Err(RuntimeError::module_attribute_error(
                        &module.name,
                        &entry.name,
                    ));
                }
            }
        } else {
            record_stat!(Opcode::LoadAttrModule, Hits);
        }
        let v = entry.value();
        v.incref();
        return Ok(v);
    }
    record_stat!(Opcode::LoadAttrModule, Misses);
    let name = entry.name.clone();
    dispatch::load_attr_with_cache(shadow, ip, owner, &name)
}

/// Polymorphic fast path: linear scan of up to four entries.
pub(crate) fn load_attr_polymorphic(
    shadow: &mut ShadowCode,
    ip: usize,
    idx: u8,
    owner: Value,
    name: &umbra_core::InternedString,
) -> VmResult<Value> {
    let hit = shadow.polymorphic(idx).lookup(type_of(owner));
    match hit {
        Some(entry) => (entry.kind.ops().load_attr)(shadow, ip, &entry, owner),
        None => {
            record_stat!(Opcode::LoadAttrPolymorphic, Misses);
            dispatch::load_attr_with_cache(shadow, ip, owner, name)
        }
    }
}

// =============================================================================
// LOAD_METHOD fast paths
// =============================================================================

pub(crate) fn load_method_no_dict_method(
    shadow: &mut ShadowCode,
    ip: usize,
    entry: &Arc<InstanceAttrEntry>,
    owner: Value,
) -> VmResult<(Value, Value)> {
    if !entry.matches_type(type_of(owner)) {
        return load_method_miss(shadow, ip, entry, owner, Opcode::LoadMethodNoDictMethod);
    }
    record_stat!(Opcode::LoadMethodNoDictMethod, Hits);

    let meth = entry.value();
    meth.incref();
    owner.incref();
    Ok((owner, meth))
}

pub(crate) fn load_method_dict_method(
    shadow: &mut ShadowCode,
    ip: usize,
    entry: &Arc<InstanceAttrEntry>,
    owner: Value,
) -> VmResult<(Value, Value)> {
    if !entry.matches_type(type_of(owner)) {
        return load_method_miss(shadow, ip, entry, owner, Opcode::LoadMethodDictMethod);
    }
    record_stat!(Opcode::LoadMethodDictMethod, Hits);

    let meth = entry.value();
    meth.incref();

    let dict = entry_dict(owner, entry);
    if !dict.is_null() {
        match unsafe { &*dict }.get_with_error(&entry.name) {
            Ok(Some(attr)) => {
                meth.decref();
                attr.incref();
                return Ok((Value::null(), attr));
            }
            Ok(None) => {}
            Err(e) => {
                meth.decref();
                return Err(e);
            }
        }
    }
    owner.incref();
    Ok((owner, meth))
}

pub(crate) fn load_method_split_dict_method(
    shadow: &mut ShadowCode,
    ip: usize,
    entry: &Arc<InstanceAttrEntry>,
    owner: Value,
) -> VmResult<(Value, Value)> {
    if !entry.matches_type(type_of(owner)) {
        return load_method_miss(shadow, ip, entry, owner, Opcode::LoadMethodSplitDictMethod);
    }
    record_stat!(Opcode::LoadMethodSplitDictMethod, Hits);

    let meth = entry.value();
    meth.incref();

    let dict = entry_dict(owner, entry);
    match try_split_dict_lookup(entry, dict, Opcode::LoadMethodSplitDictMethod) {
        SplitLookup::Value(attr) if !attr.is_null() => {
            meth.decref();
            Ok((Value::null(), attr))
        }
        SplitLookup::Value(_) => {
            owner.incref();
            Ok((owner, meth))
        }
        SplitLookup::Shapeless => {
            meth.decref();
            load_method_miss(shadow, ip, entry, owner, Opcode::LoadMethodSplitDictMethod)
        }
    }
}

pub(crate) fn load_method_dict_descr(
    shadow: &mut ShadowCode,
    ip: usize,
    entry: &Arc<InstanceAttrEntry>,
    owner: Value,
) -> VmResult<(Value, Value)> {
    let tp = type_of(owner);
    if !entry.matches_type(tp) {
        return load_method_miss(shadow, ip, entry, owner, Opcode::LoadMethodDictDescr);
    }
    record_stat!(Opcode::LoadMethodDictDescr, Hits);

    let meth = entry.value();
    meth.incref();

    let dict = entry_dict(owner, entry);
    if !dict.is_null() {
        match unsafe { &*dict }.get_with_error(&entry.name) {
            Ok(Some(attr)) => {
                meth.decref();
                attr.incref();
                return Ok((Value::null(), attr));
            }
            Ok(None) => {}
            Err(e) => {
                meth.decref();
                return Err(e);
            }
        }
    }

    if meth.is_null() {
        return Err(attr_error(owner, entry));
    }
    if has_descr_get(meth) {
        let bound = descr_get(meth, owner, tp);
        meth.decref();
        return Ok((Value::null(), bound?));
    }
    Ok((Value::null(), meth))
}

pub(crate) fn load_method_split_dict_descr(
    shadow: &mut ShadowCode,
    ip: usize,
    entry: &Arc<InstanceAttrEntry>,
    owner: Value,
) -> VmResult<(Value, Value)> {
    let tp = type_of(owner);
    if !entry.matches_type(tp) {
        return load_method_miss(shadow, ip, entry, owner, Opcode::LoadMethodSplitDictDescr);
    }
    record_stat!(Opcode::LoadMethodSplitDictDescr, Hits);

    let meth = entry.value();
    meth.incref();

    let dict = entry_dict(owner, entry);
    match try_split_dict_lookup(entry, dict, Opcode::LoadMethodSplitDictDescr) {
        SplitLookup::Value(attr) if !attr.is_null() => {
            meth.decref();
            Ok((Value::null(), attr))
        }
        SplitLookup::Value(_) => {
            if meth.is_null() {
                return Err(attr_error(owner, entry));
            }
            if has_descr_get(meth) {
                let bound = descr_get(meth, owner, tp);
                meth.decref();
                return Ok((Value::null(), bound?));
            }
            Ok((Value::null(), meth))
        }
        SplitLookup::Shapeless => {
            meth.decref();
            load_method_miss(shadow, ip, entry, owner, Opcode::LoadMethodSplitDictDescr)
        }
    }
}

pub(crate) fn load_method_no_dict_descr(
    shadow: &mut ShadowCode,
    ip: usize,
    entry: &Arc<InstanceAttrEntry>,
    owner: Value,
) -> VmResult<(Value, Value)> {
    let tp = type_of(owner);
    if !entry.matches_type(tp) {
        return load_method_miss(shadow, ip, entry, owner, Opcode::LoadMethodNoDictDescr);
    }
    record_stat!(Opcode::LoadMethodNoDictDescr, Hits);

    let meth = entry.value();
    meth.incref();
    if has_descr_get(meth) {
        let bound = descr_get(meth, owner, tp);
        meth.decref();
        return Ok((Value::null(), bound?));
    }
    Ok((Value::null(), meth))
}

/// Type-owner LOAD_METHOD fast path.
pub(crate) fn load_method_type(
    shadow: &mut ShadowCode,
    ip: usize,
    idx: u8,
    owner: Value,
) -> VmResult<(Value, Value)> {
    let entry = shadow.instance_entry(idx);
    if entry.is_valid() && entry.type_ptr() as *mut () == owner.as_object() {
        record_stat!(Opcode::LoadMethodType, Hits);
        let meth = entry.value();
        meth.incref();
        if has_descr_get(meth) {
            let bound = descr_get(meth, Value::null(), entry.type_ptr());
            meth.decref();
            return Ok((Value::null(), bound?));
        }
        return Ok((Value::null(), meth));
    }
    record_stat!(Opcode::LoadMethodType, Misses);
    let name = entry.name.clone();
    dispatch::load_method_with_cache(shadow, ip, owner, &name)
}

/// Module LOAD_METHOD fast path.
pub(crate) fn load_method_module(
    shadow: &mut ShadowCode,
    ip: usize,
    idx: u8,
    owner: Value,
) -> VmResult<(Value, Value)> {
    let entry = shadow.module_entry(idx);
    let module_ptr = owner.as_object() as *mut ModuleObject;
    if !module_ptr.is_null() && entry.module_ptr() == module_ptr {
        let module = unsafe { &*module_ptr };
        if entry.version() != module.version() {
            match module.get(&entry.name) {
                Some(v) => {
                    record_stat!(Opcode::LoadMethodModule, SlightMisses);
                    entry.refresh(module.version(), v);
                }
                None => {
                    record_stat!(Opcode::LoadMethodModule, Misses);
                    entry.invalidate();
                    return Err(RuntimeError::module_attribute_error(
                        &module.name,
                        &entry.name,
                    ));
                }
            }
        } else {
            record_stat!(Opcode::LoadMethodModule, Hits);
        }
        let v = entry.value();
        v.incref();
        return Ok((Value::null(), v));
    }
    record_stat!(Opcode::LoadMethodModule, Misses);
    let name = entry.name.clone();
    dispatch::load_method_with_cache(shadow, ip, owner, &name)
}

// =============================================================================
// STORE_ATTR fast paths
// =============================================================================

pub(crate) fn store_attr_dict(
    shadow: &mut ShadowCode,
    ip: usize,
    entry: &Arc<InstanceAttrEntry>,
    owner: Value,
    value: Value,
) -> VmResult<()> {
    if !entry.matches_type(type_of(owner)) {
        return store_attr_miss(shadow, ip, entry, owner, value, Opcode::StoreAttrDict);
    }
    record_stat!(Opcode::StoreAttrDict, Hits);

    let dict = materialize_instance_dict(owner);
    if dict.is_null() {
        return Err(attr_error(owner, entry));
    }
    unsafe { &*dict }.set(&entry.name, value);
    Ok(())
}

pub(crate) fn store_attr_split_dict(
    shadow: &mut ShadowCode,
    ip: usize,
    entry: &Arc<InstanceAttrEntry>,
    owner: Value,
    value: Value,
) -> VmResult<()> {
    if !entry.matches_type(type_of(owner)) {
        return store_attr_miss(shadow, ip, entry, owner, value, Opcode::StoreAttrSplitDict);
    }

    let dict = materialize_instance_dict(owner);
    if dict.is_null() {
        return Err(attr_error(owner, entry));
    }
    let d = unsafe { &*dict };
    let so = entry.splitoffset();

    // Indexed store is valid only while the slot either extends the dict
    // in insertion order or overwrites an already-set value.
    if d.is_split()
        && entry.keys() == d.keys_address()
        && so >= 0
        && (d.len() == so as usize || !d.split_value(so as usize).is_null())
    {
        record_stat!(Opcode::StoreAttrSplitDict, Hits);
        d.split_set(so as usize, value);
        return Ok(());
    }

    d.set(&entry.name, value);
    if so < 0 && d.is_split() {
        if let Some(keys) = d.keys_arc() {
            if let Some(idx) = keys.split_index(&entry.name) {
                entry.set_split_view(keys_address(&keys), idx as isize, keys.nentries());
            }
        }
    }
    Ok(())
}

pub(crate) fn store_attr_slot(
    shadow: &mut ShadowCode,
    ip: usize,
    entry: &Arc<InstanceAttrEntry>,
    owner: Value,
    value: Value,
) -> VmResult<()> {
    if !entry.matches_type(type_of(owner)) {
        return store_attr_miss(shadow, ip, entry, owner, value, Opcode::StoreAttrSlot);
    }
    record_stat!(Opcode::StoreAttrSlot, Hits);
    unsafe { slot_store(owner, entry.splitoffset() as usize, value) };
    Ok(())
}

pub(crate) fn store_attr_descr(
    shadow: &mut ShadowCode,
    ip: usize,
    entry: &Arc<InstanceAttrEntry>,
    owner: Value,
    value: Value,
) -> VmResult<()> {
    if !entry.matches_type(type_of(owner)) {
        return store_attr_miss(shadow, ip, entry, owner, value, Opcode::StoreAttrDescr);
    }
    record_stat!(Opcode::StoreAttrDescr, Hits);

    let descr = entry.value();
    if matches!(
        kind_of(descr),
        Some(ObjectKind::Property | ObjectKind::SlotDescr)
    ) {
        descr.incref();
        let res = descr_set(descr, owner, value);
        descr.decref();
        res
    } else {
        // The descriptor is gone or changed species; resolve generically.
        super::generic::set_attr(owner, &entry.name, value)
    }
}

// =============================================================================
// LOAD_GLOBAL fast path
// =============================================================================

/// Cached global read, validated by the combined globals/builtins version.
pub(crate) fn load_global_cached(
    shadow: &mut ShadowCode,
    idx: u8,
    globals: &DictObject,
    builtins: &DictObject,
) -> VmResult<Value> {
    let combined = globals.version().max(builtins.version());
    let entry = shadow.global_entry(idx);
    if entry.is_valid(combined) {
        record_stat!(Opcode::LoadGlobalCached, Hits);
        let v = entry.value();
        v.incref();
        return Ok(v);
    }

    // One of the dicts moved; re-read the binding and refresh.
    record_stat!(Opcode::LoadGlobalCached, SlightMisses);
    let name = entry.name.clone();
    match globals.get(&name).or_else(|| builtins.get(&name)) {
        Some(v) => {
            shadow.global_entry(idx).refresh(combined, v);
            v.incref();
            Ok(v)
        }
        None => {
            record_stat!(Opcode::LoadGlobalCached, Misses);
            Err(RuntimeError::name_error(&name))
        }
    }
}

// =============================================================================
// BINARY_SUBSCR fast paths
// =============================================================================

fn subscr_index(sub: Value, len: usize) -> Option<usize> {
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

pub(crate) fn binary_subscr_list(
    shadow: &mut ShadowCode,
    ip: usize,
    container: Value,
    sub: Value,
) -> VmResult<Value> {
    if kind_of(container) == Some(ObjectKind::List) && sub.is_int() {
        record_stat!(Opcode::BinarySubscrList, Hits);
        let list =
            unsafe { umbra_runtime::object::object_ref::<umbra_runtime::types::sequence::ListObject>(container) };
        return match subscr_index(sub, list.len()) {
            Some(idx) => {
                let v = list.get(idx).expect("index validated");
                v.incref();
                Ok(v)
            }
            None => Err(RuntimeError::index_error("list")),
        };
    }
    record_stat!(Opcode::BinarySubscrList, Misses);
    dispatch::binary_subscr_with_cache(shadow, ip, container, sub, 0)
}

pub(crate) fn binary_subscr_tuple(
    shadow: &mut ShadowCode,
    ip: usize,
    container: Value,
    sub: Value,
) -> VmResult<Value> {
    if kind_of(container) == Some(ObjectKind::Tuple) && sub.is_int() {
        record_stat!(Opcode::BinarySubscrTuple, Hits);
        let tuple = unsafe {
            umbra_runtime::object::object_ref::<umbra_runtime::types::sequence::TupleObject>(container)
        };
        return match subscr_index(sub, tuple.len()) {
            Some(idx) => {
                let v = tuple.get(idx).expect("index validated");
                v.incref();
                Ok(v)
            }
            None => Err(RuntimeError::index_error("tuple")),
        };
    }
    record_stat!(Opcode::BinarySubscrTuple, Misses);
    dispatch::binary_subscr_with_cache(shadow, ip, container, sub, 0)
}

/// Tuple read with the constant index carried in the operand byte.
pub(crate) fn binary_subscr_tuple_const_int(
    shadow: &mut ShadowCode,
    ip: usize,
    arg: u8,
    container: Value,
    sub: Value,
) -> VmResult<Value> {
    if kind_of(container) == Some(ObjectKind::Tuple) && sub.is_int() && sub.as_int() == arg as i64 {
        record_stat!(Opcode::BinarySubscrTupleConstInt, Hits);
        let tuple = unsafe {
            umbra_runtime::object::object_ref::<umbra_runtime::types::sequence::TupleObject>(container)
        };
        return match tuple.get(arg as usize) {
            Some(v) => {
                v.incref();
                Ok(v)
            }
            None => Err(RuntimeError::index_error("tuple")),
        };
    }
    record_stat!(Opcode::BinarySubscrTupleConstInt, Misses);
    dispatch::binary_subscr_with_cache(shadow, ip, container, sub, arg)
}

pub(crate) fn binary_subscr_dict(
    shadow: &mut ShadowCode,
    ip: usize,
    container: Value,
    sub: Value,
) -> VmResult<Value> {
    if kind_of(container) == Some(ObjectKind::Dict) {
        if let Some(key) = umbra_runtime::types::scalar::str_key(sub) {
            record_stat!(Opcode::BinarySubscrDict, Hits);
            let dict = unsafe { umbra_runtime::object::object_ref::<DictObject>(container) };
            return match dict.get_with_error(&key)? {
                Some(v) => {
                    v.incref();
                    Ok(v)
                }
                None => Err(RuntimeError::key_error(&key)),
            };
        }
    }
    record_stat!(Opcode::BinarySubscrDict, Misses);
    dispatch::binary_subscr_with_cache(shadow, ip, container, sub, 0)
}

// =============================================================================
// Cast and primitive-field paths
// =============================================================================

/// Type-cast guard: the checked value passes through unchanged when its
/// type is the cached type or a subtype of it.
pub(crate) fn cast_check(shadow: &ShadowCode, idx: u8, obj: Value) -> VmResult<Value> {
    let expected = shadow.cast_type(idx);
    let tp = type_of(obj);
    let ok = tp == expected
        || (!tp.is_null()
            && unsafe { &*tp }
                .mro_bases()
                .iter()
                .any(|&base| base == expected));
    if ok {
        record_stat!(Opcode::Cast, Hits);
        obj.incref();
        Ok(obj)
    } else {
        record_stat!(Opcode::Cast, Misses);
        Err(RuntimeError::type_error(format!(
            "expected '{}', got '{}'",
            unsafe { &*expected }.name,
            type_name_of(obj)
        )))
    }
}

/// Read a primitive field at a cached byte offset, producing a tagged (or
/// boxed) integer.
pub(crate) fn load_field(shadow: &ShadowCode, idx: u8, owner: Value) -> VmResult<Value> {
    let cache = shadow.field_cache(idx);
    let base = owner.as_object() as *const u8;
    let raw = match cache.field_type {
        super::entries::PrimitiveField::Int64 => unsafe {
            *(base.add(cache.offset as usize) as *const i64)
        },
        super::entries::PrimitiveField::Int32 => unsafe {
            *(base.add(cache.offset as usize) as *const i32) as i64
        },
    };
    record_stat!(Opcode::LoadField, Hits);
    Ok(umbra_runtime::int_value(raw))
}

/// Write a primitive field at a cached byte offset.
pub(crate) fn store_field(shadow: &ShadowCode, idx: u8, owner: Value, value: Value) -> VmResult<()> {
    let cache = shadow.field_cache(idx);
    let Some(raw) = umbra_runtime::unbox_int(value) else {
        return Err(RuntimeError::type_error(format!(
            "expected 'int', got '{}'",
            type_name_of(value)
        )));
    };
    let base = owner.as_object() as *mut u8;
    match cache.field_type {
        super::entries::PrimitiveField::Int64 => unsafe {
            *(base.add(cache.offset as usize) as *mut i64) = raw;
        },
        super::entries::PrimitiveField::Int32 => {
            let narrowed = i32::try_from(raw).map_err(|_| {
                RuntimeError::overflow_error("value does not fit a 32-bit field")
            })?;
            unsafe { *(base.add(cache.offset as usize) as *mut i32) = narrowed };
        }
    }
    record_stat!(Opcode::StoreField, Hits);
    Ok(())
}
