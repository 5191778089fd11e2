//! End-to-end shadow code tests: specialize, hit, invalidate,
//! respecialize.
//!
//! Each test drives the public entry points the way the interpreter
//! would: build a code object, create its arena, and execute one site
//! repeatedly. Statistics counters are process-wide, so every test takes
//! the shared lock and asserts on counter deltas.

use std::sync::{Mutex, MutexGuard, OnceLock};

use umbra_core::{intern, Value};
use umbra_runtime::object::descriptor::PropertyObject;
use umbra_runtime::object::instance::{alloc_instance, materialize_instance_dict, slot_store};
use umbra_runtime::object::module::ModuleObject;
use umbra_runtime::object::{object_ref, ObjectKind};
use umbra_runtime::types::dict::DictObject;
use umbra_runtime::types::function::{BoundMethodObject, FunctionObject};
use umbra_runtime::types::scalar::IntObject;
use umbra_runtime::types::sequence::{ListObject, TupleObject};
use umbra_runtime::{builtin_types, kind_of, type_of, ClassBuilder};
use umbra_vm::shadow::{self, stats as stats_snapshot, PrimitiveField, POLYMORPHIC_CACHE_SIZE};
use umbra_vm::{
    binary_subscr, cache_cast_type, cache_field, cast, clear_shadow, init_shadow, load_attr,
    load_field, load_global, load_method, on_type_modified, store_attr, store_field, CodeObject,
    CodeUnit, Opcode,
};

fn lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

fn attr_code(sites: usize, opcode: Opcode, name: &str) -> CodeObject {
    CodeObject::new(
        intern("test_code"),
        vec![CodeUnit::new(opcode, 0); sites],
        vec![intern(name)],
        vec![],
    )
}

const LOAD_ATTR_FAMILY: [Opcode; 10] = [
    Opcode::LoadAttr,
    Opcode::LoadAttrSlot,
    Opcode::LoadAttrDictNoDescr,
    Opcode::LoadAttrDictDescr,
    Opcode::LoadAttrSplitDict,
    Opcode::LoadAttrSplitDictDescr,
    Opcode::LoadAttrNoDictDescr,
    Opcode::LoadAttrType,
    Opcode::LoadAttrModule,
    Opcode::LoadAttrPolymorphic,
];

fn family_stats(snap: &shadow::CacheStatsSnapshot) -> shadow::OpcodeCacheStats {
    snap.sum(LOAD_ATTR_FAMILY)
}

// =============================================================================
// Monomorphic slot site
// =============================================================================

#[test]
fn test_monomorphic_slot_hits() {
    let _guard = lock();
    let ty = ClassBuilder::new("SlotPoint").slot("x").no_dict().build();
    let obj = alloc_instance(ty);
    let offset = unsafe { &*ty }.slots[0].1;
    unsafe { slot_store(obj, offset, Value::from_int(42)) };

    let name = intern("x");
    let code = attr_code(1, Opcode::LoadAttr, "x");
    let mut arena = init_shadow(&code);

    // First execution specializes the site.
    let v = load_attr(&mut arena, 0, obj, &name).unwrap();
    assert_eq!(v.as_int(), 42);
    assert_eq!(arena.unit(0).opcode, Opcode::LoadAttrSlot);

    let before = stats_snapshot().opcode(Opcode::LoadAttrSlot);
    for _ in 0..1000 {
        let v = load_attr(&mut arena, 0, obj, &name).unwrap();
        assert_eq!(v.as_int(), 42);
    }
    let after = stats_snapshot().opcode(Opcode::LoadAttrSlot);
    assert_eq!(after.hits - before.hits, 1000);
    assert_eq!(after.misses, before.misses);

    obj.decref();
}

#[test]
fn test_slot_unset_raises() {
    let _guard = lock();
    let ty = ClassBuilder::new("SlotEmpty").slot("x").no_dict().build();
    let obj = alloc_instance(ty);
    let name = intern("x");
    let code = attr_code(1, Opcode::LoadAttr, "x");
    let mut arena = init_shadow(&code);

    // Both the generic and the cached execution must raise.
    for _ in 0..2 {
        let err = load_attr(&mut arena, 0, obj, &name).unwrap_err();
        assert_eq!(err.kind, umbra_vm::RuntimeErrorKind::AttributeError);
    }
    assert_eq!(arena.unit(0).opcode, Opcode::LoadAttrSlot);
    obj.decref();
}

// =============================================================================
// Polymorphic promotion
// =============================================================================

#[test]
fn test_polymorphic_promotion_sequence() {
    let _guard = lock();
    let name = intern("name");
    let make = |label: &str, value: i64| {
        let ty = ClassBuilder::new(label).build();
        unsafe { &*ty }.set_attr(name.clone(), Value::from_int(value));
        (ty, alloc_instance(ty))
    };
    let (ty_a, a) = make("PolyA", 1);
    let (ty_b, b) = make("PolyB", 2);
    let (ty_c, c) = make("PolyC", 3);

    let code = attr_code(1, Opcode::LoadAttr, "name");
    let mut arena = init_shadow(&code);
    let before = family_stats(&stats_snapshot());

    // A, B, A, C: three distinct-type observations, one repeat hit.
    assert_eq!(load_attr(&mut arena, 0, a, &name).unwrap().as_int(), 1);
    assert_eq!(load_attr(&mut arena, 0, b, &name).unwrap().as_int(), 2);
    assert_eq!(load_attr(&mut arena, 0, a, &name).unwrap().as_int(), 1);
    assert_eq!(load_attr(&mut arena, 0, c, &name).unwrap().as_int(), 3);

    let after = family_stats(&stats_snapshot());
    assert_eq!(after.misses - before.misses, 3);
    assert_eq!(after.hits - before.hits, 1);

    let unit = arena.unit(0);
    assert_eq!(unit.opcode, Opcode::LoadAttrPolymorphic);
    let entries = arena.polymorphic(unit.arg).entries();
    let types: Vec<_> = entries.iter().map(|e| e.type_ptr()).collect();
    assert_eq!(types, vec![ty_a, ty_b, ty_c]);

    a.decref();
    b.decref();
    c.decref();
}

#[test]
fn test_polymorphic_capacity_fifo() {
    let _guard = lock();
    let name = intern("tag");
    let mut types = Vec::new();
    let mut objs = Vec::new();
    for i in 0..5 {
        let ty = ClassBuilder::new(&format!("Fifo{i}")).build();
        unsafe { &*ty }.set_attr(name.clone(), Value::from_int(i as i64));
        types.push(ty);
        objs.push(alloc_instance(ty));
    }

    let code = attr_code(1, Opcode::LoadAttr, "tag");
    let mut arena = init_shadow(&code);
    for (i, &obj) in objs.iter().enumerate() {
        assert_eq!(load_attr(&mut arena, 0, obj, &name).unwrap().as_int(), i as i64);
    }

    let unit = arena.unit(0);
    assert_eq!(unit.opcode, Opcode::LoadAttrPolymorphic);
    let poly = arena.polymorphic(unit.arg);
    assert_eq!(poly.len(), POLYMORPHIC_CACHE_SIZE);
    // The first type was evicted FIFO; the rest remain.
    assert!(poly.lookup(types[0]).is_none());
    for &ty in &types[1..] {
        assert!(poly.lookup(ty).is_some());
    }

    for obj in objs {
        obj.decref();
    }
}

// =============================================================================
// Invalidation on type mutation
// =============================================================================

#[test]
fn test_type_mutation_invalidates_site() {
    let _guard = lock();
    let ty = ClassBuilder::new("Mutable").build();
    let obj = alloc_instance(ty);
    let name = intern("foo");

    // Instance attribute through a split dict.
    let dict = materialize_instance_dict(obj);
    unsafe { &*dict }.set(&name, Value::from_int(9));

    let code = attr_code(1, Opcode::LoadAttr, "foo");
    let mut arena = init_shadow(&code);
    assert_eq!(load_attr(&mut arena, 0, obj, &name).unwrap().as_int(), 9);
    let unit = arena.unit(0);
    assert_eq!(unit.opcode, Opcode::LoadAttrSplitDict);
    let entry = arena.instance_entry(unit.arg);
    assert!(entry.is_valid());

    let count_before = shadow::invalidate_count(ty);
    on_type_modified(ty);
    assert_eq!(shadow::invalidate_count(ty), count_before + 1);
    assert!(!entry.is_valid());

    // Next execution takes the miss path and still produces the value.
    let before = family_stats(&stats_snapshot());
    assert_eq!(load_attr(&mut arena, 0, obj, &name).unwrap().as_int(), 9);
    let after = family_stats(&stats_snapshot());
    assert_eq!(after.misses - before.misses, 1);
    assert!(arena.instance_entry(arena.unit(0).arg).is_valid());

    obj.decref();
}

#[test]
fn test_set_attr_triggers_invalidation() {
    let _guard = lock();
    let ty = ClassBuilder::new("HookedClass").build();
    let name = intern("limit");
    unsafe { &*ty }.set_attr(name.clone(), Value::from_int(10));
    let obj = alloc_instance(ty);

    let code = attr_code(1, Opcode::LoadAttr, "limit");
    let mut arena = init_shadow(&code);
    assert_eq!(load_attr(&mut arena, 0, obj, &name).unwrap().as_int(), 10);

    // Rebinding the class attribute funnels through the mutation hook.
    unsafe { &*ty }.set_attr(name.clone(), Value::from_int(20));
    assert_eq!(load_attr(&mut arena, 0, obj, &name).unwrap().as_int(), 20);
    assert_eq!(load_attr(&mut arena, 0, obj, &name).unwrap().as_int(), 20);

    obj.decref();
}

// =============================================================================
// Split-dict negative hits
// =============================================================================

#[test]
fn test_split_dict_negative_hit() {
    let _guard = lock();
    let ty = ClassBuilder::new("WithMethodDict").build();
    let m = intern("m");
    let func = FunctionObject::alloc(m.clone());
    unsafe { &*ty }.set_attr(m.clone(), func);

    let obj = alloc_instance(ty);
    let dict = materialize_instance_dict(obj);
    unsafe { &*dict }.set(&intern("payload"), Value::from_int(5));

    let code = attr_code(1, Opcode::LoadAttr, "m");
    let mut arena = init_shadow(&code);

    // Specializing execution: `m` resolves on the type, not the instance.
    let bound = load_attr(&mut arena, 0, obj, &m).unwrap();
    assert_eq!(kind_of(bound), Some(ObjectKind::BoundMethod));
    bound.decref();

    let unit = arena.unit(0);
    assert_eq!(unit.opcode, Opcode::LoadAttrSplitDictDescr);
    let entry = arena.instance_entry(unit.arg);
    assert_eq!(entry.splitoffset(), -1);
    // Poisoned keys address: low bit set.
    assert_eq!(entry.keys() & 1, 1);

    // Negative hits: the dict is not re-probed, the descriptor answers.
    let before = stats_snapshot().opcode(Opcode::LoadAttrSplitDictDescr);
    for _ in 0..100 {
        let bound = load_attr(&mut arena, 0, obj, &m).unwrap();
        let method = unsafe { object_ref::<BoundMethodObject>(bound) };
        assert_eq!(method.func, func);
        assert_eq!(method.receiver, obj);
        bound.decref();
    }
    let after = stats_snapshot().opcode(Opcode::LoadAttrSplitDictDescr);
    assert_eq!(after.hits - before.hits, 100);
    assert_eq!(after.slight_misses, before.slight_misses);

    // Growing the shared keys table forces one refresh, then negative
    // hits resume.
    unsafe { &*dict }.set(&intern("extra"), Value::from_int(6));
    let bound = load_attr(&mut arena, 0, obj, &m).unwrap();
    bound.decref();
    let refreshed = stats_snapshot().opcode(Opcode::LoadAttrSplitDictDescr);
    assert_eq!(refreshed.slight_misses - after.slight_misses, 1);

    let bound = load_attr(&mut arena, 0, obj, &m).unwrap();
    bound.decref();
    let settled = stats_snapshot().opcode(Opcode::LoadAttrSplitDictDescr);
    assert_eq!(settled.hits - refreshed.hits, 1);

    obj.decref();
    func.decref();
}

#[test]
fn test_split_dict_instance_override() {
    let _guard = lock();
    let ty = ClassBuilder::new("Overridable").build();
    let name = intern("v");
    unsafe { &*ty }.set_attr(name.clone(), Value::from_int(1));
    let obj = alloc_instance(ty);

    let code = attr_code(1, Opcode::LoadAttr, "v");
    let mut arena = init_shadow(&code);
    assert_eq!(load_attr(&mut arena, 0, obj, &name).unwrap().as_int(), 1);
    assert_eq!(load_attr(&mut arena, 0, obj, &name).unwrap().as_int(), 1);

    // The instance dict now shadows the class attribute.
    let dict = materialize_instance_dict(obj);
    unsafe { &*dict }.set(&name, Value::from_int(2));
    assert_eq!(load_attr(&mut arena, 0, obj, &name).unwrap().as_int(), 2);
    assert_eq!(load_attr(&mut arena, 0, obj, &name).unwrap().as_int(), 2);

    obj.decref();
}

// =============================================================================
// Module attribute caching
// =============================================================================

#[test]
fn test_module_version_skip() {
    let _guard = lock();
    let module = ModuleObject::alloc(intern("toplevel"));
    let m = unsafe { object_ref::<ModuleObject>(module) };
    let name = intern("len");
    m.set(&name, Value::from_int(100));

    let code = attr_code(1, Opcode::LoadAttr, "len");
    let mut arena = init_shadow(&code);

    assert_eq!(load_attr(&mut arena, 0, module, &name).unwrap().as_int(), 100);
    assert_eq!(arena.unit(0).opcode, Opcode::LoadAttrModule);

    let before = stats_snapshot().opcode(Opcode::LoadAttrModule);
    for _ in 0..1000 {
        assert_eq!(load_attr(&mut arena, 0, module, &name).unwrap().as_int(), 100);
    }
    let mid = stats_snapshot().opcode(Opcode::LoadAttrModule);
    assert_eq!(mid.hits - before.hits, 1000);

    // Rebinding bumps the dict version: one slight miss, then hits again.
    m.set(&name, Value::from_int(200));
    assert_eq!(load_attr(&mut arena, 0, module, &name).unwrap().as_int(), 200);
    let refreshed = stats_snapshot().opcode(Opcode::LoadAttrModule);
    assert_eq!(refreshed.slight_misses - mid.slight_misses, 1);

    assert_eq!(load_attr(&mut arena, 0, module, &name).unwrap().as_int(), 200);
    let settled = stats_snapshot().opcode(Opcode::LoadAttrModule);
    assert_eq!(settled.hits - refreshed.hits, 1);

    module.decref();
}

// =============================================================================
// Globals
// =============================================================================

#[test]
fn test_global_cache_and_rebind() {
    let _guard = lock();
    let globals_v = DictObject::alloc_combined();
    let builtins_v = DictObject::alloc_combined();
    let globals = unsafe { object_ref::<DictObject>(globals_v) };
    let builtins = unsafe { object_ref::<DictObject>(builtins_v) };

    let name = intern("limit");
    builtins.set(&name, Value::from_int(7));

    let code = attr_code(1, Opcode::LoadGlobal, "limit");
    let mut arena = init_shadow(&code);

    assert_eq!(
        load_global(&mut arena, 0, globals, builtins, &name).unwrap().as_int(),
        7
    );
    assert_eq!(arena.unit(0).opcode, Opcode::LoadGlobalCached);

    let before = stats_snapshot().opcode(Opcode::LoadGlobalCached);
    for _ in 0..100 {
        assert_eq!(
            load_global(&mut arena, 0, globals, builtins, &name).unwrap().as_int(),
            7
        );
    }
    let mid = stats_snapshot().opcode(Opcode::LoadGlobalCached);
    assert_eq!(mid.hits - before.hits, 100);

    // A global now shadows the builtin; the version drift forces a
    // re-read.
    globals.set(&name, Value::from_int(8));
    assert_eq!(
        load_global(&mut arena, 0, globals, builtins, &name).unwrap().as_int(),
        8
    );
    let refreshed = stats_snapshot().opcode(Opcode::LoadGlobalCached);
    assert_eq!(refreshed.slight_misses - mid.slight_misses, 1);

    // Removing both bindings surfaces a NameError.
    globals.delete(&name);
    builtins.delete(&name);
    let err = load_global(&mut arena, 0, globals, builtins, &name).unwrap_err();
    assert_eq!(err.kind, umbra_vm::RuntimeErrorKind::NameError);

    globals_v.decref();
    builtins_v.decref();
}

// =============================================================================
// Stores
// =============================================================================

#[test]
fn test_store_attr_slot() {
    let _guard = lock();
    let ty = ClassBuilder::new("StoreSlot").slot("x").no_dict().build();
    let obj = alloc_instance(ty);
    let name = intern("x");

    let code = attr_code(1, Opcode::StoreAttr, "x");
    let mut arena = init_shadow(&code);

    store_attr(&mut arena, 0, obj, &name, Value::from_int(1)).unwrap();
    assert_eq!(arena.unit(0).opcode, Opcode::StoreAttrSlot);

    let before = stats_snapshot().opcode(Opcode::StoreAttrSlot);
    for i in 0..50 {
        store_attr(&mut arena, 0, obj, &name, Value::from_int(i)).unwrap();
    }
    let after = stats_snapshot().opcode(Opcode::StoreAttrSlot);
    assert_eq!(after.hits - before.hits, 50);

    let offset = unsafe { &*ty }.slots[0].1;
    assert_eq!(
        unsafe { umbra_runtime::object::instance::slot_load(obj, offset) }.as_int(),
        49
    );
    obj.decref();
}

#[test]
fn test_store_attr_split_dict_extends_in_order() {
    let _guard = lock();
    let ty = ClassBuilder::new("StoreSplit").build();
    let name = intern("field");

    let code = attr_code(1, Opcode::StoreAttr, "field");
    let mut arena = init_shadow(&code);

    let first = alloc_instance(ty);
    store_attr(&mut arena, 0, first, &name, Value::from_int(1)).unwrap();
    assert_eq!(arena.unit(0).opcode, Opcode::StoreAttrSplitDict);

    // The second store through the handler records the key's slot.
    store_attr(&mut arena, 0, first, &name, Value::from_int(11)).unwrap();
    let entry = arena.instance_entry(arena.unit(0).arg);
    assert!(entry.splitoffset() >= 0);

    // Sibling instances reuse the recorded slot.
    let before = stats_snapshot().opcode(Opcode::StoreAttrSplitDict);
    let second = alloc_instance(ty);
    store_attr(&mut arena, 0, second, &name, Value::from_int(2)).unwrap();
    let after = stats_snapshot().opcode(Opcode::StoreAttrSplitDict);
    assert_eq!(after.hits - before.hits, 1);

    let d2 = unsafe { &*materialize_instance_dict(second) };
    assert_eq!(d2.get(&name).unwrap().as_int(), 2);
    let d1 = unsafe { &*materialize_instance_dict(first) };
    assert_eq!(d1.get(&name).unwrap().as_int(), 11);

    first.decref();
    second.decref();
}

#[test]
fn test_store_attr_through_property() {
    let _guard = lock();

    fn set_payload(prop: &PropertyObject, _obj: Value, value: Value) -> umbra_core::UmbraResult<()> {
        let old = prop.payload.replace(value);
        value.incref();
        old.decref();
        Ok(())
    }
    fn get_payload(prop: &PropertyObject, _obj: Value) -> umbra_core::UmbraResult<Value> {
        let v = prop.payload.get();
        v.incref();
        Ok(v)
    }

    let prop = PropertyObject::alloc(Some(get_payload), Some(set_payload), Value::from_int(0));
    let ty = ClassBuilder::new("Propertied").no_dict().build();
    let name = intern("level");
    unsafe { &*ty }.set_attr(name.clone(), prop);
    let obj = alloc_instance(ty);

    let code = CodeObject::new(
        intern("prop_code"),
        vec![
            CodeUnit::new(Opcode::StoreAttr, 0),
            CodeUnit::new(Opcode::LoadAttr, 0),
        ],
        vec![name.clone()],
        vec![],
    );
    let mut arena = init_shadow(&code);

    store_attr(&mut arena, 0, obj, &name, Value::from_int(33)).unwrap();
    assert_eq!(arena.unit(0).opcode, Opcode::StoreAttrDescr);
    store_attr(&mut arena, 0, obj, &name, Value::from_int(44)).unwrap();

    assert_eq!(load_attr(&mut arena, 1, obj, &name).unwrap().as_int(), 44);
    assert_eq!(arena.unit(1).opcode, Opcode::LoadAttrNoDictDescr);
    assert_eq!(load_attr(&mut arena, 1, obj, &name).unwrap().as_int(), 44);

    obj.decref();
    prop.decref();
}

// =============================================================================
// Method loads
// =============================================================================

#[test]
fn test_load_method_no_dict_returns_unbound_pair() {
    let _guard = lock();
    let ty = ClassBuilder::new("Caller").no_dict().build();
    let name = intern("run");
    let func = FunctionObject::alloc(name.clone());
    unsafe { &*ty }.set_attr(name.clone(), func);
    let obj = alloc_instance(ty);

    let code = attr_code(1, Opcode::LoadMethod, "run");
    let mut arena = init_shadow(&code);

    let (self_v, meth) = load_method(&mut arena, 0, obj, &name).unwrap();
    assert_eq!(self_v, obj);
    assert_eq!(meth, func);
    self_v.decref();
    meth.decref();
    assert_eq!(arena.unit(0).opcode, Opcode::LoadMethodNoDictMethod);

    let before = stats_snapshot().opcode(Opcode::LoadMethodNoDictMethod);
    for _ in 0..10 {
        let (self_v, meth) = load_method(&mut arena, 0, obj, &name).unwrap();
        assert_eq!(self_v, obj);
        assert_eq!(meth, func);
        self_v.decref();
        meth.decref();
    }
    let after = stats_snapshot().opcode(Opcode::LoadMethodNoDictMethod);
    assert_eq!(after.hits - before.hits, 10);

    obj.decref();
    func.decref();
}

#[test]
fn test_load_method_instance_override_wins() {
    let _guard = lock();
    let ty = ClassBuilder::new("Overrider").build();
    let name = intern("hook");
    let class_func = FunctionObject::alloc(name.clone());
    unsafe { &*ty }.set_attr(name.clone(), class_func);
    let obj = alloc_instance(ty);

    let code = attr_code(1, Opcode::LoadMethod, "hook");
    let mut arena = init_shadow(&code);

    let (self_v, meth) = load_method(&mut arena, 0, obj, &name).unwrap();
    assert_eq!(self_v, obj);
    assert_eq!(meth, class_func);
    self_v.decref();
    meth.decref();
    assert_eq!(arena.unit(0).opcode, Opcode::LoadMethodSplitDictMethod);

    // An instance binding shadows the class method: bound form, no self.
    let replacement = FunctionObject::alloc(intern("hook_override"));
    let dict = materialize_instance_dict(obj);
    unsafe { &*dict }.set(&name, replacement);

    let (self_v, meth) = load_method(&mut arena, 0, obj, &name).unwrap();
    assert!(self_v.is_null());
    assert_eq!(meth, replacement);
    meth.decref();

    obj.decref();
    class_func.decref();
    replacement.decref();
}

#[test]
fn test_load_method_on_type_owner() {
    let _guard = lock();
    let ty = ClassBuilder::new("Factory").build();
    let name = intern("create");
    let func = FunctionObject::alloc(name.clone());
    unsafe { &*ty }.set_attr(name.clone(), func);

    let owner = Value::from_object(ty);
    let code = attr_code(1, Opcode::LoadMethod, "create");
    let mut arena = init_shadow(&code);

    let (self_v, meth) = load_method(&mut arena, 0, owner, &name).unwrap();
    assert!(self_v.is_null());
    assert_eq!(meth, func);
    meth.decref();
    assert_eq!(arena.unit(0).opcode, Opcode::LoadMethodType);

    let (self_v, meth) = load_method(&mut arena, 0, owner, &name).unwrap();
    assert!(self_v.is_null());
    assert_eq!(meth, func);
    meth.decref();

    func.decref();
}

// =============================================================================
// Type-owner attribute loads
// =============================================================================

#[test]
fn test_type_owner_attr_and_invalidation() {
    let _guard = lock();
    let ty = ClassBuilder::new("Config").build();
    let name = intern("default_size");
    unsafe { &*ty }.set_attr(name.clone(), Value::from_int(16));

    let owner = Value::from_object(ty);
    let code = attr_code(1, Opcode::LoadAttr, "default_size");
    let mut arena = init_shadow(&code);

    assert_eq!(load_attr(&mut arena, 0, owner, &name).unwrap().as_int(), 16);
    assert_eq!(arena.unit(0).opcode, Opcode::LoadAttrType);

    let before = stats_snapshot().opcode(Opcode::LoadAttrType);
    assert_eq!(load_attr(&mut arena, 0, owner, &name).unwrap().as_int(), 16);
    let after = stats_snapshot().opcode(Opcode::LoadAttrType);
    assert_eq!(after.hits - before.hits, 1);

    // Mutating the type clears the entry; the next read respecializes.
    unsafe { &*ty }.set_attr(name.clone(), Value::from_int(32));
    assert_eq!(load_attr(&mut arena, 0, owner, &name).unwrap().as_int(), 32);
    assert_eq!(load_attr(&mut arena, 0, owner, &name).unwrap().as_int(), 32);
}

#[test]
fn test_metatype_mutation_invalidates_type_owner_site() {
    let _guard = lock();
    let ty = ClassBuilder::new("MetaOwned").build();
    let name = intern("table_size");
    unsafe { &*ty }.set_attr(name.clone(), Value::from_int(64));

    let owner = Value::from_object(ty);
    let code = attr_code(1, Opcode::LoadAttr, "table_size");
    let mut arena = init_shadow(&code);

    assert_eq!(load_attr(&mut arena, 0, owner, &name).unwrap().as_int(), 64);
    assert_eq!(arena.unit(0).opcode, Opcode::LoadAttrType);
    let entry = arena.instance_entry(arena.unit(0).arg);
    assert!(entry.is_valid());

    // The owned type's directory recorded its metatype, and the entry was
    // registered as a dependent of the metatype as well.
    let metatype = type_of(owner);
    assert_eq!(metatype, builtin_types().type_type);
    let dir = umbra_vm::shadow::registry::find_for_type(ty).expect("directory");
    assert_eq!(dir.metatype(), metatype);

    // Mutating the metatype must reach the type-owner entry.
    let probe = intern("__meta_probe");
    let meta_count = shadow::invalidate_count(metatype);
    unsafe { &*metatype }.set_attr(probe.clone(), Value::from_int(1));
    assert_eq!(shadow::invalidate_count(metatype), meta_count + 1);
    assert!(!entry.is_valid());

    // Next execution takes the miss path, respecializes, and still
    // answers from the owned type.
    let before = stats_snapshot().opcode(Opcode::LoadAttrType);
    assert_eq!(load_attr(&mut arena, 0, owner, &name).unwrap().as_int(), 64);
    let after = stats_snapshot().opcode(Opcode::LoadAttrType);
    assert_eq!(after.misses - before.misses, 1);
    assert!(arena.instance_entry(arena.unit(0).arg).is_valid());
    assert_eq!(load_attr(&mut arena, 0, owner, &name).unwrap().as_int(), 64);

    unsafe { &*metatype }.del_attr(&probe);
}

// =============================================================================
// Uncacheable owners
// =============================================================================

#[test]
fn test_super_proxy_is_uncacheable() {
    let _guard = lock();
    let base = ClassBuilder::new("SuperBase").build();
    let name = intern("shared");
    unsafe { &*base }.set_attr(name.clone(), Value::from_int(5));
    let derived = ClassBuilder::new("SuperDerived").base(base).build();
    let obj = alloc_instance(derived);
    let proxy = umbra_runtime::object::super_obj::SuperObject::alloc(obj, derived);

    let code = attr_code(1, Opcode::LoadAttr, "shared");
    let mut arena = init_shadow(&code);

    let before = stats_snapshot();
    assert_eq!(load_attr(&mut arena, 0, proxy, &name).unwrap().as_int(), 5);
    let after = stats_snapshot();
    assert_eq!(
        after.uncachable.getattr_super - before.uncachable.getattr_super,
        1
    );
    assert_eq!(arena.unit(0).opcode, Opcode::LoadAttrUncachable);

    // The pinned site keeps resolving generically.
    assert_eq!(load_attr(&mut arena, 0, proxy, &name).unwrap().as_int(), 5);

    proxy.decref();
    obj.decref();
}

#[test]
fn test_custom_getattribute_is_uncacheable() {
    let _guard = lock();
    let ty = ClassBuilder::new("Dynamic").custom_getattribute().build();
    let name = intern("anything");
    unsafe { &*ty }.set_attr(name.clone(), Value::from_int(3));
    let obj = alloc_instance(ty);

    let code = attr_code(1, Opcode::LoadAttr, "anything");
    let mut arena = init_shadow(&code);

    let before = stats_snapshot();
    assert_eq!(load_attr(&mut arena, 0, obj, &name).unwrap().as_int(), 3);
    let after = stats_snapshot();
    assert_eq!(
        after.uncachable.getattr_type - before.uncachable.getattr_type,
        1
    );
    assert_eq!(arena.unit(0).opcode, Opcode::LoadAttrUncachable);
    obj.decref();
}

#[test]
fn test_tagged_int_owner_raises() {
    let _guard = lock();
    let code = attr_code(1, Opcode::LoadAttr, "bit_length");
    let mut arena = init_shadow(&code);
    let name = intern("bit_length");

    let err = load_attr(&mut arena, 0, Value::from_int(5), &name).unwrap_err();
    assert_eq!(err.kind, umbra_vm::RuntimeErrorKind::AttributeError);
    assert!(err.message.contains("'int'"));
}

// =============================================================================
// Respecialization budget
// =============================================================================

#[test]
fn test_update_budget_pins_sites() {
    let _guard = lock();
    let sites = shadow::MAX_CODE_UPDATES + 4;
    let ty = ClassBuilder::new("Budget").slot("x").no_dict().build();
    let obj = alloc_instance(ty);
    let offset = unsafe { &*ty }.slots[0].1;
    unsafe { slot_store(obj, offset, Value::from_int(1)) };
    let name = intern("x");

    let code = attr_code(sites, Opcode::LoadAttr, "x");
    let mut arena = init_shadow(&code);
    for ip in 0..sites {
        assert_eq!(load_attr(&mut arena, ip, obj, &name).unwrap().as_int(), 1);
    }

    // The first MAX_CODE_UPDATES sites got their specialized form; the
    // rest were pinned generic.
    assert_eq!(arena.unit(0).opcode, Opcode::LoadAttrSlot);
    assert_eq!(
        arena.unit(shadow::MAX_CODE_UPDATES).opcode,
        Opcode::LoadAttrUncachable
    );
    // Pinned sites still resolve.
    assert_eq!(
        load_attr(&mut arena, shadow::MAX_CODE_UPDATES, obj, &name)
            .unwrap()
            .as_int(),
        1
    );
    obj.decref();
}

// =============================================================================
// Arena teardown
// =============================================================================

#[test]
fn test_clear_shadow_restores_and_respecializes() {
    let _guard = lock();
    let ty = ClassBuilder::new("Cleared").slot("x").no_dict().build();
    let obj = alloc_instance(ty);
    let offset = unsafe { &*ty }.slots[0].1;
    unsafe { slot_store(obj, offset, Value::from_int(8)) };
    let name = intern("x");

    let code = attr_code(1, Opcode::LoadAttr, "x");
    let mut arena = init_shadow(&code);
    assert_eq!(load_attr(&mut arena, 0, obj, &name).unwrap().as_int(), 8);
    assert_eq!(arena.unit(0).opcode, Opcode::LoadAttrSlot);

    clear_shadow(&mut arena);
    assert_eq!(arena.unit(0).opcode, Opcode::LoadAttr);

    // The site respecializes cleanly after the wipe.
    assert_eq!(load_attr(&mut arena, 0, obj, &name).unwrap().as_int(), 8);
    assert_eq!(arena.unit(0).opcode, Opcode::LoadAttrSlot);
    obj.decref();
}

// =============================================================================
// Subscripts
// =============================================================================

#[test]
fn test_subscr_list_specialization() {
    let _guard = lock();
    let list = ListObject::alloc(vec![Value::from_int(10), Value::from_int(20)]);
    let code = attr_code(1, Opcode::BinarySubscr, "");
    let mut arena = init_shadow(&code);

    assert_eq!(
        binary_subscr(&mut arena, 0, list, Value::from_int(1), 0).unwrap().as_int(),
        20
    );
    assert_eq!(arena.unit(0).opcode, Opcode::BinarySubscrList);
    assert_eq!(
        binary_subscr(&mut arena, 0, list, Value::from_int(-2), 0).unwrap().as_int(),
        10
    );
    let err = binary_subscr(&mut arena, 0, list, Value::from_int(9), 0).unwrap_err();
    assert_eq!(err.kind, umbra_vm::RuntimeErrorKind::IndexError);
    list.decref();
}

#[test]
fn test_subscr_tuple_const_int() {
    let _guard = lock();
    let tuple = TupleObject::alloc(vec![Value::from_int(5), Value::from_int(6)]);
    let code = attr_code(1, Opcode::BinarySubscr, "");
    let mut arena = init_shadow(&code);

    // A repeating small constant index gets the dedicated form.
    assert_eq!(
        binary_subscr(&mut arena, 0, tuple, Value::from_int(1), 1).unwrap().as_int(),
        6
    );
    assert_eq!(arena.unit(0).opcode, Opcode::BinarySubscrTupleConstInt);
    assert_eq!(arena.unit(0).arg, 1);
    assert_eq!(
        binary_subscr(&mut arena, 0, tuple, Value::from_int(1), 1).unwrap().as_int(),
        6
    );

    // A different index demotes the site to the general tuple form.
    assert_eq!(
        binary_subscr(&mut arena, 0, tuple, Value::from_int(0), 0).unwrap().as_int(),
        5
    );
    assert_eq!(arena.unit(0).opcode, Opcode::BinarySubscrTuple);
    tuple.decref();
}

#[test]
fn test_subscr_dict_and_kind_switch() {
    let _guard = lock();
    let dict_v = DictObject::alloc_combined();
    let dict = unsafe { object_ref::<DictObject>(dict_v) };
    dict.set(&intern("k"), Value::from_int(3));
    let key = umbra_runtime::types::scalar::StrObject::alloc("k");

    let code = attr_code(1, Opcode::BinarySubscr, "");
    let mut arena = init_shadow(&code);

    assert_eq!(binary_subscr(&mut arena, 0, dict_v, key, 0).unwrap().as_int(), 3);
    assert_eq!(arena.unit(0).opcode, Opcode::BinarySubscrDict);

    let missing = umbra_runtime::types::scalar::StrObject::alloc("absent");
    let err = binary_subscr(&mut arena, 0, dict_v, missing, 0).unwrap_err();
    assert_eq!(err.kind, umbra_vm::RuntimeErrorKind::KeyError);

    // The same site observing a list respecializes.
    let list = ListObject::alloc(vec![Value::from_int(1)]);
    assert_eq!(
        binary_subscr(&mut arena, 0, list, Value::from_int(0), 0).unwrap().as_int(),
        1
    );
    assert_eq!(arena.unit(0).opcode, Opcode::BinarySubscrList);

    list.decref();
    missing.decref();
    key.decref();
    dict_v.decref();
}

// =============================================================================
// Casts and primitive fields
// =============================================================================

#[test]
fn test_cast_guard() {
    let _guard = lock();
    let base = ClassBuilder::new("CastBase").build();
    let derived = ClassBuilder::new("CastDerived").base(base).build();
    let other = ClassBuilder::new("CastOther").build();

    let code = attr_code(1, Opcode::Cast, "");
    let mut arena = init_shadow(&code);
    let idx = cache_cast_type(&mut arena, base).unwrap();
    assert_eq!(idx, 0);

    let obj = alloc_instance(derived);
    let passed = cast(&mut arena, 0, obj).unwrap();
    assert_eq!(passed, obj);
    passed.decref();

    let stranger = alloc_instance(other);
    let err = cast(&mut arena, 0, stranger).unwrap_err();
    assert_eq!(err.kind, umbra_vm::RuntimeErrorKind::TypeError);

    obj.decref();
    stranger.decref();
}

#[test]
fn test_primitive_field_round_trip() {
    let _guard = lock();
    // A boxed integer's payload sits right after the header; address it
    // as a raw 64-bit field.
    let boxed = IntObject::alloc(1 << 61);
    let offset = std::mem::size_of::<umbra_runtime::ObjectHeader>() as u32;

    let code = CodeObject::new(
        intern("field_code"),
        vec![
            CodeUnit::new(Opcode::LoadField, 0),
            CodeUnit::new(Opcode::StoreField, 0),
        ],
        vec![],
        vec![],
    );
    let mut arena = init_shadow(&code);
    let idx = cache_field(&mut arena, offset, PrimitiveField::Int64).unwrap();
    assert_eq!(idx, 0);

    // Out-of-immediate-range payload comes back boxed.
    let v = load_field(&mut arena, 0, boxed).unwrap();
    assert_eq!(umbra_runtime::unbox_int(v), Some(1 << 61));
    assert!(v.is_object());
    v.decref();

    store_field(&mut arena, 1, boxed, Value::from_int(12)).unwrap();
    let v = load_field(&mut arena, 0, boxed).unwrap();
    assert!(v.is_int());
    assert_eq!(v.as_int(), 12);

    let err = store_field(&mut arena, 1, boxed, umbra_runtime::types::scalar::StrObject::alloc("x"))
        .unwrap_err();
    assert_eq!(err.kind, umbra_vm::RuntimeErrorKind::TypeError);

    boxed.decref();
}

// =============================================================================
// Reference behavior
// =============================================================================

#[test]
fn test_load_attr_returns_new_reference() {
    let _guard = lock();
    let ty = ClassBuilder::new("RefCounted").slot("x").no_dict().build();
    let obj = alloc_instance(ty);
    let offset = unsafe { &*ty }.slots[0].1;
    let boxed = IntObject::alloc(i64::MAX);
    unsafe { slot_store(obj, offset, boxed) };

    let name = intern("x");
    let code = attr_code(1, Opcode::LoadAttr, "x");
    let mut arena = init_shadow(&code);

    let rc_before = boxed.refcount().unwrap();
    let v = load_attr(&mut arena, 0, obj, &name).unwrap();
    assert_eq!(v, boxed);
    assert_eq!(boxed.refcount().unwrap(), rc_before + 1);
    v.decref();
    assert_eq!(boxed.refcount().unwrap(), rc_before);

    obj.decref();
    boxed.decref();
}
