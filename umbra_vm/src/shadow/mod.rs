//! Shadow code: inline caching for attribute, global, and subscript
//! opcodes.
//!
//! The interpreter executes against a per-code-object [`ShadowCode`]
//! arena. Cache-aware sites start generic; the first execution classifies
//! the observed owner, builds a cache entry, and rewrites the site to a
//! specialized opcode whose operand indexes the arena's cache tables. A
//! specialized site checks a type (or version) guard and produces its
//! result in a handful of loads; a failed guard takes the miss path,
//! respecializes, and still produces the generic result.
//!
//! ```text
//!  generic opcode ──execute──▶ dispatcher ──patch──▶ specialized opcode
//!        ▲                        │                        │
//!        │                   cache entry ◀────guard────────┤
//!        │                        │                     hit│miss
//!        └──update budget──  invalidation ◀── type/dict/module mutation
//! ```
//!
//! Entry points mirror the opcode set: [`load_attr`], [`load_method`],
//! [`store_attr`], [`load_global`], [`binary_subscr`], plus the cast and
//! primitive-field guards. All take the arena and the site's instruction
//! offset; the rewritten opcode at that offset selects the path.

pub mod arena;
pub(crate) mod dispatch;
pub mod entries;
pub mod generic;
pub(crate) mod handlers;
pub mod invalidate;
pub mod registry;
pub mod stats;

use umbra_core::{InternedString, Value};
use umbra_runtime::types::dict::DictObject;
use umbra_runtime::TypeObject;

use crate::bytecode::{CodeObject, Opcode};
use crate::error::VmResult;
use stats::record_stat;

pub use arena::{CacheSlot, ShadowCode, CACHE_TABLE_LIMIT, MAX_CODE_UPDATES};
pub use entries::{
    CacheKind, FieldCache, GlobalCacheEntry, InstanceAttrEntry, ModuleAttrEntry,
    PolymorphicCache, PrimitiveField, POLYMORPHIC_CACHE_SIZE,
};
pub use invalidate::{invalidate_count, on_type_modified};
pub use registry::CacheDirectory;
pub use stats::{reset as reset_stats, snapshot as stats, CacheStatsSnapshot, OpcodeCacheStats};

/// Create the cache arena for a code object.
pub fn init_shadow(code: &CodeObject) -> ShadowCode {
    ShadowCode::new(code)
}

/// Release a code object's cache arena: unlink its registry dependencies,
/// drop all entries, and restore the pristine bytecode.
pub fn clear_shadow(shadow: &mut ShadowCode) {
    shadow.clear();
}

/// Execute the LOAD_ATTR site at `ip` against `owner`. Returns a new
/// reference.
pub fn load_attr(
    shadow: &mut ShadowCode,
    ip: usize,
    owner: Value,
    name: &InternedString,
) -> VmResult<Value> {
    shadow.note_ip(ip);
    let unit = shadow.unit(ip);
    match unit.opcode {
        Opcode::LoadAttr => {
            record_stat!(Opcode::LoadAttr, Misses);
            dispatch::load_attr_with_cache(shadow, ip, owner, name)
        }
        Opcode::LoadAttrUncachable => generic::get_attr(owner, name),
        Opcode::LoadAttrType => handlers::load_attr_type(shadow, ip, unit.arg, owner),
        Opcode::LoadAttrModule => handlers::load_attr_module(shadow, ip, unit.arg, owner),
        Opcode::LoadAttrPolymorphic => {
            handlers::load_attr_polymorphic(shadow, ip, unit.arg, owner, name)
        }
        op if op.is_instance_load_attr() => {
            let entry = shadow.instance_entry(unit.arg);
            (entry.kind.ops().load_attr)(shadow, ip, &entry, owner)
        }
        op => unreachable!("LOAD_ATTR dispatched on {op:?}"),
    }
}

/// Execute the LOAD_METHOD site at `ip` against `owner`.
///
/// Returns `(self_or_null, method)`: a null first component means the
/// method is already bound (or is a plain attribute); otherwise the
/// caller pairs the unbound function with the returned receiver.
pub fn load_method(
    shadow: &mut ShadowCode,
    ip: usize,
    owner: Value,
    name: &InternedString,
) -> VmResult<(Value, Value)> {
    shadow.note_ip(ip);
    let unit = shadow.unit(ip);
    match unit.opcode {
        Opcode::LoadMethod => {
            record_stat!(Opcode::LoadMethod, Misses);
            dispatch::load_method_with_cache(shadow, ip, owner, name)
        }
        Opcode::LoadMethodUncachable => generic::load_method(owner, name),
        Opcode::LoadMethodType => handlers::load_method_type(shadow, ip, unit.arg, owner),
        Opcode::LoadMethodModule => handlers::load_method_module(shadow, ip, unit.arg, owner),
        op if op.is_instance_load_method() => {
            let entry = shadow.instance_entry(unit.arg);
            (entry.kind.ops().load_method)(shadow, ip, &entry, owner)
        }
        op => unreachable!("LOAD_METHOD dispatched on {op:?}"),
    }
}

/// Execute the STORE_ATTR site at `ip`: `owner.name = value`.
pub fn store_attr(
    shadow: &mut ShadowCode,
    ip: usize,
    owner: Value,
    name: &InternedString,
    value: Value,
) -> VmResult<()> {
    shadow.note_ip(ip);
    let unit = shadow.unit(ip);
    match unit.opcode {
        Opcode::StoreAttr => {
            record_stat!(Opcode::StoreAttr, Misses);
            dispatch::store_attr_with_cache(shadow, ip, owner, name, value)
        }
        Opcode::StoreAttrUncachable => generic::set_attr(owner, name, value),
        op if op.is_instance_store_attr() => {
            let entry = shadow.instance_entry(unit.arg);
            (entry.kind.ops().store_attr)(shadow, ip, &entry, owner, value)
        }
        op => unreachable!("STORE_ATTR dispatched on {op:?}"),
    }
}

/// Execute the LOAD_GLOBAL site at `ip`: resolve `name` against the
/// globals and builtins dicts, caching the binding under their combined
/// version tag. Returns a new reference.
pub fn load_global(
    shadow: &mut ShadowCode,
    ip: usize,
    globals: &DictObject,
    builtins: &DictObject,
    name: &InternedString,
) -> VmResult<Value> {
    shadow.note_ip(ip);
    let unit = shadow.unit(ip);
    match unit.opcode {
        Opcode::LoadGlobal => {
            record_stat!(Opcode::LoadGlobal, Misses);
            dispatch::load_global_with_cache(shadow, ip, globals, builtins, name)
        }
        Opcode::LoadGlobalCached => {
            handlers::load_global_cached(shadow, unit.arg, globals, builtins)
        }
        op => unreachable!("LOAD_GLOBAL dispatched on {op:?}"),
    }
}

/// Execute the BINARY_SUBSCR site at `ip`: `container[sub]`. Returns a
/// new reference.
pub fn binary_subscr(
    shadow: &mut ShadowCode,
    ip: usize,
    container: Value,
    sub: Value,
    oparg: u8,
) -> VmResult<Value> {
    shadow.note_ip(ip);
    let unit = shadow.unit(ip);
    match unit.opcode {
        Opcode::BinarySubscr => {
            record_stat!(Opcode::BinarySubscr, Misses);
            dispatch::binary_subscr_with_cache(shadow, ip, container, sub, oparg)
        }
        Opcode::BinarySubscrList => handlers::binary_subscr_list(shadow, ip, container, sub),
        Opcode::BinarySubscrTuple => handlers::binary_subscr_tuple(shadow, ip, container, sub),
        Opcode::BinarySubscrTupleConstInt => {
            handlers::binary_subscr_tuple_const_int(shadow, ip, unit.arg, container, sub)
        }
        Opcode::BinarySubscrDict => handlers::binary_subscr_dict(shadow, ip, container, sub),
        op => unreachable!("BINARY_SUBSCR dispatched on {op:?}"),
    }
}

/// Record a type for a CAST guard site; the returned index goes in the
/// site's operand byte.
pub fn cache_cast_type(shadow: &mut ShadowCode, ty: *mut TypeObject) -> Option<u8> {
    shadow.cache_cast_type(ty)
}

/// Execute the CAST site at `ip`: pass `obj` through when its type
/// matches the cached guard type (or a subtype). Returns a new reference.
pub fn cast(shadow: &mut ShadowCode, ip: usize, obj: Value) -> VmResult<Value> {
    let unit = shadow.unit(ip);
    debug_assert_eq!(unit.opcode, Opcode::Cast);
    handlers::cast_check(shadow, unit.arg, obj)
}

/// Record a primitive field access; the returned index goes in the site's
/// operand byte.
pub fn cache_field(
    shadow: &mut ShadowCode,
    offset: u32,
    field_type: PrimitiveField,
) -> Option<u8> {
    shadow.cache_field(offset, field_type)
}

/// Execute the LOAD_FIELD site at `ip`: read the cached primitive field
/// from `owner` as a tagged (or boxed) integer.
pub fn load_field(shadow: &mut ShadowCode, ip: usize, owner: Value) -> VmResult<Value> {
    let unit = shadow.unit(ip);
    debug_assert_eq!(unit.opcode, Opcode::LoadField);
    handlers::load_field(shadow, unit.arg, owner)
}

/// Execute the STORE_FIELD site at `ip`: write an integer value into the
/// cached primitive field of `owner`.
pub fn store_field(
    shadow: &mut ShadowCode,
    ip: usize,
    owner: Value,
    value: Value,
) -> VmResult<()> {
    let unit = shadow.unit(ip);
    debug_assert_eq!(unit.opcode, Opcode::StoreField);
    handlers::store_field(shadow, unit.arg, owner, value)
}
