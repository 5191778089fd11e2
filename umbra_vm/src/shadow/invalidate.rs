//! Invalidation protocol.
//!
//! Four event classes keep caches consistent with the object model:
//!
//! 1. **Type modified**: handled here, eagerly. Every entry depending on
//!    the type is cleared so its guard fails and the site respecializes.
//! 2. **Module dict rewritten**: handled lazily by version-tag compare
//!    in the module fast path.
//! 3. **Instance keys table replaced**: handled lazily by the keys
//!    identity compare in the split-dict fast path.
//! 4. **Arena cleared**: `ShadowCode::clear`/`Drop` unlink the arena
//!    from every directory it appears in.
//!
//! An entry is always invalidated before anything it borrows is freed:
//! type and module teardown funnels through the directory finalizer
//! installed by [`super::registry::ensure_hooks`].

use umbra_runtime::TypeObject;

use super::registry;

/// React to a mutation of a type's dict, MRO, or descriptor set.
///
/// Walks the type's directory, clears every dependent entry, drops the
/// second-level cache, and bumps the invalidation counter. Sites keep
/// their specialized opcodes; the cleared entries fail their guards, so
/// the next execution takes the miss path and respecializes against the
/// type's new state.
pub fn on_type_modified(ty: *mut TypeObject) {
    if ty.is_null() {
        return;
    }
    if let Some(dir) = registry::find_for_type(ty) {
        dir.invalidate_all();
    }
}

/// Invalidation counter of a type's directory; zero when the type has
/// never been cached against.
pub fn invalidate_count(ty: *mut TypeObject) -> u64 {
    registry::find_for_type(ty).map_or(0, |dir| dir.invalidate_count())
}
