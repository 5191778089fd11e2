//! Per-type cache directory.
//!
//! Every cache-observable object (a type or a module) lazily grows a
//! `CacheDirectory` hanging off its header. The directory is the
//! invalidation protocol's index: it maps each dependent arena to the
//! entries that assume something about this object, counts invalidations,
//! and keeps a second-level name → entry cache that lets new sites reuse
//! an already-resolved entry instead of re-probing the object model.
//!
//! The directory lives exactly as long as its owner: object finalization
//! runs the registered finalizer, which invalidates every dependent entry
//! before the owner's memory is released. Entries therefore never
//! dereference a dead type or module.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use umbra_core::InternedString;
use umbra_runtime::object::module::ModuleObject;
use umbra_runtime::{ObjectHeader, ObjectKind, TypeFlags, TypeObject};

use super::entries::{InstanceAttrEntry, ModuleAttrEntry};

/// One dependent cache entry.
pub enum Dependent {
    /// An instance attribute entry.
    Instance(Arc<InstanceAttrEntry>),
    /// A module attribute entry.
    Module(Arc<ModuleAttrEntry>),
}

impl Dependent {
    fn invalidate(&self) {
        match self {
            Dependent::Instance(e) => (e.kind.ops().invalidate)(e),
            Dependent::Module(e) => e.invalidate(),
        }
    }
}

type DependencyMap = FxHashMap<usize, FxHashMap<InternedString, SmallVec<[Dependent; 1]>>>;

/// Cache directory attached to one observable object.
pub struct CacheDirectory {
    invalidate_count: Cell<u64>,
    metatype: Cell<*mut TypeObject>,
    type_insts: RefCell<DependencyMap>,
    l2_cache: RefCell<FxHashMap<InternedString, Arc<InstanceAttrEntry>>>,
}

impl CacheDirectory {
    fn new() -> Self {
        Self {
            invalidate_count: Cell::new(0),
            metatype: Cell::new(std::ptr::null_mut()),
            type_insts: RefCell::new(FxHashMap::default()),
            l2_cache: RefCell::new(FxHashMap::default()),
        }
    }

    /// Number of invalidations applied to this directory. Non-decreasing.
    #[inline]
    pub fn invalidate_count(&self) -> u64 {
        self.invalidate_count.get()
    }

    /// Metatype back-link for type owners.
    #[inline]
    pub fn metatype(&self) -> *mut TypeObject {
        self.metatype.get()
    }

    /// Record the metatype back-link.
    #[inline]
    pub fn set_metatype(&self, metatype: *mut TypeObject) {
        self.metatype.set(metatype);
    }

    /// Link an entry into the per-arena dependency map.
    pub fn record_dependency(&self, arena_id: usize, name: &InternedString, dep: Dependent) {
        let mut deps = self.type_insts.borrow_mut();
        let by_name = deps.entry(arena_id).or_default();
        let bucket = by_name.entry(name.clone()).or_default();
        let duplicate = match &dep {
            Dependent::Instance(e) => bucket.iter().any(|d| match d {
                Dependent::Instance(existing) => Arc::ptr_eq(existing, e),
                Dependent::Module(_) => false,
            }),
            Dependent::Module(e) => bucket.iter().any(|d| match d {
                Dependent::Module(existing) => Arc::ptr_eq(existing, e),
                Dependent::Instance(_) => false,
            }),
        };
        if !duplicate {
            bucket.push(dep);
        }
    }

    /// Publish an entry for cross-site reuse.
    pub fn l2_insert(&self, name: &InternedString, entry: Arc<InstanceAttrEntry>) {
        self.l2_cache.borrow_mut().insert(name.clone(), entry);
    }

    /// Find a still-valid entry for cross-site reuse.
    pub fn l2_lookup(&self, name: &InternedString) -> Option<Arc<InstanceAttrEntry>> {
        let cache = self.l2_cache.borrow();
        let entry = cache.get(name)?;
        if entry.is_valid() {
            Some(Arc::clone(entry))
        } else {
            None
        }
    }

    /// Poison every dependent entry and bump the invalidation counter.
    ///
    /// Cleared entries fail their guards; affected sites take the miss
    /// path and respecialize on next execution. Invalidation then takes
    /// one hop along the recorded metatype back-link, sweeping
    /// dependencies registered before the link last changed; the hop
    /// consumes the link, and respecialization re-records it.
    pub fn invalidate_all(&self) {
        self.invalidate_count.set(self.invalidate_count.get() + 1);
        {
            let mut deps = self.type_insts.borrow_mut();
            for (_, by_name) in deps.drain() {
                for (_, bucket) in by_name {
                    for dep in &bucket {
                        dep.invalidate();
                    }
                }
            }
        }
        self.l2_cache.borrow_mut().clear();

        let meta = self.metatype.replace(std::ptr::null_mut());
        if !meta.is_null() {
            if let Some(meta_dir) = find_for_type(meta) {
                // `type` is its own metatype; don't re-enter ourselves.
                if !std::ptr::eq(meta_dir, self) {
                    meta_dir.invalidate_all();
                }
            }
        }
    }

    /// Drop one arena's links, e.g. when its code object is finalized.
    pub fn remove_arena(&self, arena_id: usize) {
        self.type_insts.borrow_mut().remove(&arena_id);
    }

    /// Total dependent entries currently linked.
    pub fn dependent_count(&self) -> usize {
        self.type_insts
            .borrow()
            .values()
            .flat_map(|by_name| by_name.values())
            .map(|bucket| bucket.len())
            .sum()
    }
}

// =============================================================================
// Attachment
// =============================================================================

fn supports_directory(header: &ObjectHeader) -> bool {
    match header.kind {
        ObjectKind::Type => {
            let ty = header as *const ObjectHeader as *const TypeObject;
            unsafe { &*ty }.flags.contains(TypeFlags::SUPPORTS_WEAKREFS)
        }
        ObjectKind::Module => true,
        _ => false,
    }
}

/// Directory for an object, creating it lazily. `None` when the object
/// cannot host one (its type does not support weak attachment).
pub fn get_or_create(header: &ObjectHeader) -> Option<&'static CacheDirectory> {
    if let Some(dir) = find_for_object(header) {
        return Some(dir);
    }
    if !supports_directory(header) {
        return None;
    }
    let dir = Box::into_raw(Box::new(CacheDirectory::new()));
    header.cache_link.set(dir as *mut ());
    Some(unsafe { &*dir })
}

/// Existing directory for an object, without allocating.
#[inline]
pub fn find_for_object(header: &ObjectHeader) -> Option<&'static CacheDirectory> {
    let link = header.cache_link.get();
    if link.is_null() {
        None
    } else {
        Some(unsafe { &*(link as *const CacheDirectory) })
    }
}

/// Existing directory for a type.
#[inline]
pub fn find_for_type(ty: *mut TypeObject) -> Option<&'static CacheDirectory> {
    find_for_object(unsafe { &(*ty).header })
}

/// Directory for a type, creating it lazily.
pub fn get_or_create_for_type(ty: *mut TypeObject) -> Option<&'static CacheDirectory> {
    get_or_create(unsafe { &(*ty).header })
}

/// Directory for a module, creating it lazily.
pub fn get_or_create_for_module(module: *mut ModuleObject) -> Option<&'static CacheDirectory> {
    get_or_create(unsafe { &(*module).header })
}

// =============================================================================
// Hook installation
// =============================================================================

/// Finalizer for a directory whose owner is being freed: every dependent
/// entry is invalidated before the owner's memory goes away.
unsafe fn finalize_directory(link: *mut ()) {
    let dir = unsafe { Box::from_raw(link as *mut CacheDirectory) };
    dir.invalidate_all();
}

/// Install the object-model hooks. Idempotent.
pub fn ensure_hooks() {
    umbra_runtime::object::register_cache_finalizer(finalize_directory);
    umbra_runtime::object::register_type_modified_hook(super::invalidate::on_type_modified);
}
