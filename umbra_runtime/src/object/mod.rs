//! Heap object representation.
//!
//! Every heap object starts with an [`ObjectHeader`]: reference count,
//! kind tag, type pointer, and one cache-attachment slot. The header's
//! refcount is the object's first word, which is what the value layer's
//! `incref`/`decref` rely on.
//!
//! Deallocation is dispatched on the kind tag through a hook registered
//! with `umbra_core::value` at startup; the caching layer registers two
//! further hooks here (cache-attachment finalization and type-modification
//! notification) so the object model never depends on it directly.

pub mod descriptor;
pub mod instance;
pub mod module;
pub mod super_obj;
pub mod type_obj;

use std::cell::Cell;
use std::sync::OnceLock;

use umbra_core::Value;

use self::type_obj::TypeObject;

// =============================================================================
// Object kinds
// =============================================================================

/// Discriminates the concrete struct behind an object pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectKind {
    /// A type object.
    Type,
    /// An instance of a user-defined class.
    Instance,
    /// A dictionary.
    Dict,
    /// A module.
    Module,
    /// A plain function (non-data descriptor).
    Function,
    /// A function bound to a receiver.
    BoundMethod,
    /// A property (data descriptor).
    Property,
    /// A slot descriptor (fixed-offset storage).
    SlotDescr,
    /// A boxed integer outside the immediate range.
    Int,
    /// A string.
    Str,
    /// A list.
    List,
    /// A tuple.
    Tuple,
    /// A super proxy.
    Super,
}

// =============================================================================
// Object header
// =============================================================================

/// Common header at the start of every heap object.
///
/// `refcount` must stay the first field: the tagged-value layer adjusts it
/// through the raw object pointer.
#[repr(C)]
pub struct ObjectHeader {
    refcount: Cell<usize>,
    /// Concrete object kind.
    pub kind: ObjectKind,
    /// The object's type. Null only during bootstrap of the type system.
    pub type_obj: *mut TypeObject,
    /// Lazily attached cache directory, owned by the caching layer.
    pub cache_link: Cell<*mut ()>,
}

const _: () = assert!(std::mem::offset_of!(ObjectHeader, refcount) == 0);
const _: () = assert!(std::mem::size_of::<ObjectHeader>() % 8 == 0);

impl ObjectHeader {
    /// Create a header with refcount 1.
    pub fn new(kind: ObjectKind, type_obj: *mut TypeObject) -> Self {
        Self {
            refcount: Cell::new(1),
            kind,
            type_obj,
            cache_link: Cell::new(std::ptr::null_mut()),
        }
    }

    /// Current reference count.
    #[inline]
    pub fn refcount(&self) -> usize {
        self.refcount.get()
    }
}

// =============================================================================
// Value helpers
// =============================================================================

/// Borrow the header behind an object-tagged value.
///
/// # Safety
///
/// The value must be object-tagged, non-null, and point at a live object.
#[inline]
pub unsafe fn header_of<'a>(v: Value) -> &'a ObjectHeader {
    debug_assert!(v.is_object() && !v.is_null());
    unsafe { &*v.as_object_ptr::<ObjectHeader>() }
}

/// Kind of the object behind a value; `None` for integers and null.
#[inline]
pub fn kind_of(v: Value) -> Option<ObjectKind> {
    if v.is_object() && !v.is_null() {
        Some(unsafe { header_of(v) }.kind)
    } else {
        None
    }
}

/// Type of a value. Immediate integers report the builtin int type; null
/// has no type.
#[inline]
pub fn type_of(v: Value) -> *mut TypeObject {
    if v.is_int() {
        type_obj::builtin_types().int_type
    } else if v.is_null() {
        std::ptr::null_mut()
    } else {
        unsafe { header_of(v) }.type_obj
    }
}

/// Name of a value's type, for error messages.
pub fn type_name_of(v: Value) -> &'static str {
    let ty = type_of(v);
    if ty.is_null() {
        return "NoneType";
    }
    // Type names are interned and live for the program.
    let name = unsafe { &(*ty).name };
    unsafe { std::mem::transmute::<&str, &'static str>(name.as_str()) }
}

/// Borrow the concrete object behind a value.
///
/// # Safety
///
/// The value must be object-tagged, non-null, and actually point at a `T`.
#[inline]
pub unsafe fn object_ref<'a, T>(v: Value) -> &'a T {
    debug_assert!(v.is_object() && !v.is_null());
    unsafe { &*v.as_object_ptr::<T>() }
}

/// Allocate a heap object and return its tagged value (refcount 1).
pub fn alloc<T>(obj: T) -> Value {
    let ptr = Box::into_raw(Box::new(obj));
    Value::from_object(ptr)
}

// =============================================================================
// Hooks installed by the caching layer
// =============================================================================

/// Finalizer for a header's `cache_link` attachment, invoked before the
/// owning object's memory is released.
pub type CacheFinalizerFn = unsafe fn(*mut ());

/// Notification that a type's attribute resolution may have changed.
pub type TypeModifiedFn = fn(*mut TypeObject);

static CACHE_FINALIZER: OnceLock<CacheFinalizerFn> = OnceLock::new();
static TYPE_MODIFIED: OnceLock<TypeModifiedFn> = OnceLock::new();

/// Install the cache-attachment finalizer. Later calls are ignored.
pub fn register_cache_finalizer(f: CacheFinalizerFn) {
    let _ = CACHE_FINALIZER.set(f);
}

/// Install the type-modification hook. Later calls are ignored.
pub fn register_type_modified_hook(f: TypeModifiedFn) {
    let _ = TYPE_MODIFIED.set(f);
}

/// Called by type mutation entry points.
pub(crate) fn notify_type_modified(ty: *mut TypeObject) {
    if let Some(f) = TYPE_MODIFIED.get() {
        f(ty);
    }
}

// =============================================================================
// Deallocation dispatch
// =============================================================================

/// Tear down an object whose refcount reached zero.
///
/// The cache attachment is finalized first: any cache entry that borrows
/// this object must be invalidated before the memory goes away.
pub(crate) unsafe fn dealloc_object(ptr: *mut ()) {
    let (kind, type_obj) = {
        let header = unsafe { &*(ptr as *const ObjectHeader) };
        let link = header.cache_link.get();
        if !link.is_null() {
            header.cache_link.set(std::ptr::null_mut());
            if let Some(f) = CACHE_FINALIZER.get() {
                unsafe { f(link) };
            }
        }
        (header.kind, header.type_obj)
    };

    unsafe {
        match kind {
            ObjectKind::Type => drop(Box::from_raw(ptr as *mut TypeObject)),
            ObjectKind::Instance => {
                instance::dealloc_instance(ptr as *mut ObjectHeader);
                // dealloc_instance released the type reference itself.
                return;
            }
            ObjectKind::Dict => drop(Box::from_raw(ptr as *mut crate::types::dict::DictObject)),
            ObjectKind::Module => drop(Box::from_raw(ptr as *mut module::ModuleObject)),
            ObjectKind::Function => {
                drop(Box::from_raw(ptr as *mut crate::types::function::FunctionObject))
            }
            ObjectKind::BoundMethod => drop(Box::from_raw(
                ptr as *mut crate::types::function::BoundMethodObject,
            )),
            ObjectKind::Property => drop(Box::from_raw(ptr as *mut descriptor::PropertyObject)),
            ObjectKind::SlotDescr => drop(Box::from_raw(ptr as *mut descriptor::SlotDescriptor)),
            ObjectKind::Int => drop(Box::from_raw(ptr as *mut crate::types::scalar::IntObject)),
            ObjectKind::Str => drop(Box::from_raw(ptr as *mut crate::types::scalar::StrObject)),
            ObjectKind::List => drop(Box::from_raw(ptr as *mut crate::types::sequence::ListObject)),
            ObjectKind::Tuple => {
                drop(Box::from_raw(ptr as *mut crate::types::sequence::TupleObject))
            }
            ObjectKind::Super => drop(Box::from_raw(ptr as *mut super_obj::SuperObject)),
        }
    }

    // Objects hold a reference to their type; types created during bootstrap
    // may have a null metatype link.
    if !type_obj.is_null() {
        Value::from_object(type_obj).decref();
    }
}

/// Install the value-layer deallocation hook. Idempotent; called from
/// [`type_obj::builtin_types`] before the first object is created.
pub(crate) fn init_dealloc() {
    umbra_core::value::register_dealloc(dealloc_object);
}
