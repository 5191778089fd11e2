//! Shadow code arena.
//!
//! Each code object executed with caching enabled gets a `ShadowCode`: a
//! rewritable copy of its bytecode plus the typed cache tables the
//! specialized opcodes index into. Specialized opcodes carry a `u8` table
//! index in their operand byte, so each table holds at most 256 entries;
//! a site that cannot get a table slot simply stays generic.
//!
//! Patching writes one two-byte unit in place. Execution is
//! single-threaded per interpreter, so the rewrite needs no
//! synchronization with the executing opcode stream.

use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use umbra_runtime::object::module::ModuleObject;
use umbra_runtime::TypeObject;

use super::entries::{
    FieldCache, GlobalCacheEntry, InstanceAttrEntry, ModuleAttrEntry, PolymorphicCache,
    PrimitiveField,
};
use super::registry;
use crate::bytecode::{CodeObject, CodeUnit, Opcode};

use umbra_core::{InternedString, Value};

/// Bound on bytecode rewrites per arena. A site still churning past this
/// is pinned to its family's uncachable form.
pub const MAX_CODE_UPDATES: usize = 64;

/// Max entries per cache table (indices must fit the operand byte).
pub const CACHE_TABLE_LIMIT: usize = 256;

static NEXT_ARENA_ID: AtomicUsize = AtomicUsize::new(1);

/// One slot of the first-level cache table; LOAD_ATTR and LOAD_METHOD
/// sites share it, so it is heterogeneous.
pub enum CacheSlot {
    /// An instance attribute entry.
    Instance(Arc<InstanceAttrEntry>),
    /// A module attribute entry.
    Module(Arc<ModuleAttrEntry>),
}

/// Per-code-object cache arena.
pub struct ShadowCode {
    arena_id: usize,
    code: *const CodeObject,
    pub(crate) units: Box<[CodeUnit]>,
    pub(crate) globals: Vec<GlobalCacheEntry>,
    pub(crate) l1_cache: Vec<CacheSlot>,
    pub(crate) polymorphic_caches: Vec<PolymorphicCache>,
    pub(crate) cast_cache: Vec<*mut TypeObject>,
    pub(crate) field_caches: Vec<FieldCache>,
    update_count: usize,
    ip_root: Cell<usize>,
}

impl ShadowCode {
    /// Create an arena over `code` with a fresh bytecode copy and empty
    /// tables. The generic opcodes are already cache-aware; the copy is
    /// rewritten site by site as specializations land.
    pub fn new(code: &CodeObject) -> Self {
        registry::ensure_hooks();
        Self {
            arena_id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            code: code as *const CodeObject,
            units: code.units.clone(),
            globals: Vec::new(),
            l1_cache: Vec::new(),
            polymorphic_caches: Vec::new(),
            cast_cache: Vec::new(),
            field_caches: Vec::new(),
            update_count: 0,
            ip_root: Cell::new(0),
        }
    }

    /// Arena identity, used as the key in per-type dependency maps.
    #[inline]
    pub fn arena_id(&self) -> usize {
        self.arena_id
    }

    /// The backing code object.
    #[inline]
    pub fn code(&self) -> &CodeObject {
        unsafe { &*self.code }
    }

    /// Rewritten unit at an instruction offset.
    #[inline]
    pub fn unit(&self, ip: usize) -> CodeUnit {
        self.units[ip]
    }

    /// Pristine unit at an instruction offset, from the code object.
    #[inline]
    pub fn original_unit(&self, ip: usize) -> CodeUnit {
        self.code().unit(ip)
    }

    /// The name a (possibly rewritten) site originally referenced.
    pub fn original_name(&self, ip: usize) -> Option<InternedString> {
        let unit = self.original_unit(ip);
        self.code().names.get(unit.arg as usize).cloned()
    }

    /// Note the instruction offset being executed, for diagnostics.
    #[inline]
    pub(crate) fn note_ip(&self, ip: usize) {
        self.ip_root.set(ip);
    }

    /// Most recent cache-aware instruction offset executed in this arena.
    #[inline]
    pub fn current_ip(&self) -> usize {
        self.ip_root.get()
    }

    /// Total bytecode mutations applied to this arena.
    #[inline]
    pub fn update_count(&self) -> usize {
        self.update_count
    }

    /// Check whether the rewrite budget is spent.
    #[inline]
    pub fn updates_exhausted(&self) -> bool {
        self.update_count >= MAX_CODE_UPDATES
    }

    /// Rewrite one unit in place. Past the update budget the site is
    /// pinned to its family's uncachable form instead; returns whether the
    /// requested rewrite was applied.
    pub(crate) fn patch(&mut self, ip: usize, opcode: Opcode, arg: u8) -> bool {
        if self.updates_exhausted() {
            self.units[ip] = CodeUnit::new(opcode.family_uncachable(), 0);
            return false;
        }
        self.update_count += 1;
        self.units[ip] = CodeUnit::new(opcode, arg);
        true
    }

    // =========================================================================
    // Table access
    // =========================================================================

    /// Instance entry at a first-level index.
    #[inline]
    pub fn instance_entry(&self, idx: u8) -> Arc<InstanceAttrEntry> {
        match &self.l1_cache[idx as usize] {
            CacheSlot::Instance(e) => Arc::clone(e),
            CacheSlot::Module(_) => unreachable!("module entry at instance cache index"),
        }
    }

    /// Module entry at a first-level index.
    #[inline]
    pub fn module_entry(&self, idx: u8) -> Arc<ModuleAttrEntry> {
        match &self.l1_cache[idx as usize] {
            CacheSlot::Module(e) => Arc::clone(e),
            CacheSlot::Instance(_) => unreachable!("instance entry at module cache index"),
        }
    }

    /// Global entry at an index.
    #[inline]
    pub fn global_entry(&self, idx: u8) -> &GlobalCacheEntry {
        &self.globals[idx as usize]
    }

    /// Polymorphic array at an index.
    #[inline]
    pub fn polymorphic(&self, idx: u8) -> &PolymorphicCache {
        &self.polymorphic_caches[idx as usize]
    }

    /// Mutable polymorphic array at an index.
    #[inline]
    pub(crate) fn polymorphic_mut(&mut self, idx: u8) -> &mut PolymorphicCache {
        &mut self.polymorphic_caches[idx as usize]
    }

    /// Cast-guard type at an index.
    #[inline]
    pub fn cast_type(&self, idx: u8) -> *mut TypeObject {
        self.cast_cache[idx as usize]
    }

    /// Field cache at an index.
    #[inline]
    pub fn field_cache(&self, idx: u8) -> FieldCache {
        self.field_caches[idx as usize]
    }

    // =========================================================================
    // Table growth
    // =========================================================================

    fn table_index(len: usize) -> Option<u8> {
        if len >= CACHE_TABLE_LIMIT {
            None
        } else {
            Some(len as u8)
        }
    }

    /// Append an instance entry to the first-level table.
    pub(crate) fn add_instance_entry(&mut self, entry: Arc<InstanceAttrEntry>) -> Option<u8> {
        let idx = Self::table_index(self.l1_cache.len())?;
        self.l1_cache.push(CacheSlot::Instance(entry));
        Some(idx)
    }

    /// Replace the entry at an existing first-level index.
    pub(crate) fn replace_instance_entry(&mut self, idx: u8, entry: Arc<InstanceAttrEntry>) {
        self.l1_cache[idx as usize] = CacheSlot::Instance(entry);
    }

    /// Append a module entry to the first-level table.
    pub(crate) fn add_module_entry(&mut self, entry: Arc<ModuleAttrEntry>) -> Option<u8> {
        let idx = Self::table_index(self.l1_cache.len())?;
        self.l1_cache.push(CacheSlot::Module(entry));
        Some(idx)
    }

    /// Replace the module entry at an existing first-level index.
    pub(crate) fn replace_module_entry(&mut self, idx: u8, entry: Arc<ModuleAttrEntry>) {
        self.l1_cache[idx as usize] = CacheSlot::Module(entry);
    }

    /// Append a global entry.
    pub(crate) fn add_global_entry(&mut self, entry: GlobalCacheEntry) -> Option<u8> {
        let idx = Self::table_index(self.globals.len())?;
        self.globals.push(entry);
        Some(idx)
    }

    /// Allocate a polymorphic array seeded with the given entries.
    pub(crate) fn add_polymorphic(
        &mut self,
        seed: impl IntoIterator<Item = Arc<InstanceAttrEntry>>,
    ) -> Option<u8> {
        let idx = Self::table_index(self.polymorphic_caches.len())?;
        let mut poly = PolymorphicCache::new();
        for entry in seed {
            poly.insert(entry);
        }
        self.polymorphic_caches.push(poly);
        Some(idx)
    }

    /// Record a type for a cast guard, reusing an existing slot.
    pub(crate) fn cache_cast_type(&mut self, ty: *mut TypeObject) -> Option<u8> {
        if let Some(pos) = self.cast_cache.iter().position(|&t| t == ty) {
            return Some(pos as u8);
        }
        let idx = Self::table_index(self.cast_cache.len())?;
        Value::from_object(ty).incref();
        self.cast_cache.push(ty);
        Some(idx)
    }

    /// Record a primitive field access.
    pub(crate) fn cache_field(&mut self, offset: u32, field_type: PrimitiveField) -> Option<u8> {
        if let Some(pos) = self
            .field_caches
            .iter()
            .position(|f| f.offset == offset && f.field_type == field_type)
        {
            return Some(pos as u8);
        }
        let idx = Self::table_index(self.field_caches.len())?;
        self.field_caches.push(FieldCache { offset, field_type });
        Some(idx)
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Drop this arena's links out of every per-type dependency map.
    fn unlink_registry(&self) {
        let visit = |entry: &Arc<InstanceAttrEntry>| {
            let tp = entry.type_ptr();
            if tp.is_null() {
                return;
            }
            if let Some(dir) = registry::find_for_type(tp) {
                dir.remove_arena(self.arena_id);
            }
        };
        for slot in &self.l1_cache {
            match slot {
                CacheSlot::Instance(e) => visit(e),
                CacheSlot::Module(e) => {
                    let module = e.module_ptr();
                    if !module.is_null() {
                        if let Some(dir) =
                            registry::find_for_object(unsafe { &(*module).header })
                        {
                            dir.remove_arena(self.arena_id);
                        }
                    }
                }
            }
        }
        for poly in &self.polymorphic_caches {
            for entry in poly.entries() {
                visit(&entry);
            }
        }
    }

    /// Release all cache entries and restore the pristine bytecode.
    pub fn clear(&mut self) {
        self.unlink_registry();
        self.globals.clear();
        self.l1_cache.clear();
        self.polymorphic_caches.clear();
        for &ty in &self.cast_cache {
            Value::from_object(ty).decref();
        }
        self.cast_cache.clear();
        self.field_caches.clear();
        self.units = self.code().units.clone();
    }
}

impl Drop for ShadowCode {
    fn drop(&mut self) {
        self.unlink_registry();
        for &ty in &self.cast_cache {
            Value::from_object(ty).decref();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{CodeObject, CodeUnit, Opcode};
    use umbra_core::intern;

    fn code_with(units: Vec<CodeUnit>) -> CodeObject {
        CodeObject::new(intern("test"), units, vec![intern("x")], vec![])
    }

    #[test]
    fn test_arena_copies_units() {
        let code = code_with(vec![CodeUnit::new(Opcode::LoadAttr, 0)]);
        let mut shadow = ShadowCode::new(&code);

        shadow.patch(0, Opcode::LoadAttrSlot, 3);
        assert_eq!(shadow.unit(0).opcode, Opcode::LoadAttrSlot);
        assert_eq!(shadow.unit(0).arg, 3);
        // The code object keeps the original.
        assert_eq!(shadow.original_unit(0).opcode, Opcode::LoadAttr);
        assert_eq!(shadow.original_name(0).unwrap().as_str(), "x");
    }

    #[test]
    fn test_update_budget_pins_uncachable() {
        let code = code_with(vec![CodeUnit::new(Opcode::LoadAttr, 0)]);
        let mut shadow = ShadowCode::new(&code);

        for _ in 0..MAX_CODE_UPDATES {
            assert!(shadow.patch(0, Opcode::LoadAttrSlot, 0));
        }
        assert!(shadow.updates_exhausted());
        assert!(!shadow.patch(0, Opcode::LoadAttrSlot, 0));
        assert_eq!(shadow.unit(0).opcode, Opcode::LoadAttrUncachable);
    }

    #[test]
    fn test_clear_restores_bytecode() {
        let code = code_with(vec![CodeUnit::new(Opcode::LoadAttr, 0)]);
        let mut shadow = ShadowCode::new(&code);
        shadow.patch(0, Opcode::LoadAttrUncachable, 0);

        shadow.clear();
        assert_eq!(shadow.unit(0).opcode, Opcode::LoadAttr);
        assert!(shadow.l1_cache.is_empty());
    }

    #[test]
    fn test_table_limit() {
        let code = code_with(vec![CodeUnit::new(Opcode::LoadGlobal, 0)]);
        let mut shadow = ShadowCode::new(&code);
        for i in 0..CACHE_TABLE_LIMIT {
            let idx = shadow
                .add_global_entry(GlobalCacheEntry::new(intern("g"), 0, Value::null()))
                .expect("table slot");
            assert_eq!(idx as usize, i);
        }
        assert!(shadow
            .add_global_entry(GlobalCacheEntry::new(intern("g"), 0, Value::null()))
            .is_none());
    }
}
