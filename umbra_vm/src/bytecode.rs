//! Bytecode representation.
//!
//! Code is a sequence of two-byte units: one opcode byte and one operand
//! byte. The generic cache-aware opcodes (`LoadAttr`, `LoadMethod`,
//! `StoreAttr`, `LoadGlobal`, `BinarySubscr`) are what compilers emit; the
//! specialized variants are written in place by the shadow-code rewriter
//! and carry an index into one of the shadow arena's cache tables in their
//! operand byte.
//!
//! The `CodeObject` keeps the pristine units: a rewritten site's original
//! opcode and operand are always recoverable from it.

use umbra_core::{InternedString, Value};

/// Opcodes. Specialized variants are only ever produced by the rewriter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// No operation.
    Nop = 0,

    // Generic cache-aware opcodes.
    LoadAttr,
    LoadMethod,
    StoreAttr,
    LoadGlobal,
    BinarySubscr,
    Cast,
    LoadField,
    StoreField,

    // LOAD_ATTR specializations.
    LoadAttrSlot,
    LoadAttrDictNoDescr,
    LoadAttrDictDescr,
    LoadAttrSplitDict,
    LoadAttrSplitDictDescr,
    LoadAttrNoDictDescr,
    LoadAttrType,
    LoadAttrModule,
    LoadAttrPolymorphic,
    LoadAttrUncachable,

    // LOAD_METHOD specializations.
    LoadMethodDictDescr,
    LoadMethodSplitDictDescr,
    LoadMethodDictMethod,
    LoadMethodSplitDictMethod,
    LoadMethodNoDictMethod,
    LoadMethodNoDictDescr,
    LoadMethodType,
    LoadMethodModule,
    LoadMethodUncachable,

    // STORE_ATTR specializations.
    StoreAttrSlot,
    StoreAttrDict,
    StoreAttrDescr,
    StoreAttrSplitDict,
    StoreAttrUncachable,

    // LOAD_GLOBAL specialization.
    LoadGlobalCached,

    // BINARY_SUBSCR specializations.
    BinarySubscrList,
    BinarySubscrTuple,
    BinarySubscrDict,
    BinarySubscrTupleConstInt,
}

/// Number of opcodes; sizes the per-opcode statistics table.
pub const OPCODE_COUNT: usize = Opcode::BinarySubscrTupleConstInt as usize + 1;

impl Opcode {
    /// Specialized LOAD_ATTR variants backed by an instance cache entry.
    #[inline]
    pub fn is_instance_load_attr(self) -> bool {
        matches!(
            self,
            Opcode::LoadAttrSlot
                | Opcode::LoadAttrDictNoDescr
                | Opcode::LoadAttrDictDescr
                | Opcode::LoadAttrSplitDict
                | Opcode::LoadAttrSplitDictDescr
                | Opcode::LoadAttrNoDictDescr
        )
    }

    /// Specialized LOAD_METHOD variants backed by an instance cache entry.
    #[inline]
    pub fn is_instance_load_method(self) -> bool {
        matches!(
            self,
            Opcode::LoadMethodDictDescr
                | Opcode::LoadMethodSplitDictDescr
                | Opcode::LoadMethodDictMethod
                | Opcode::LoadMethodSplitDictMethod
                | Opcode::LoadMethodNoDictMethod
                | Opcode::LoadMethodNoDictDescr
        )
    }

    /// Specialized STORE_ATTR variants backed by an instance cache entry.
    #[inline]
    pub fn is_instance_store_attr(self) -> bool {
        matches!(
            self,
            Opcode::StoreAttrSlot
                | Opcode::StoreAttrDict
                | Opcode::StoreAttrDescr
                | Opcode::StoreAttrSplitDict
        )
    }

    /// The pinned-generic fallback for a cache-aware opcode family.
    ///
    /// A site that keeps respecializing past the arena's update budget is
    /// patched to this form and never touched again.
    #[inline]
    pub fn family_uncachable(self) -> Opcode {
        match self {
            Opcode::LoadAttr
            | Opcode::LoadAttrSlot
            | Opcode::LoadAttrDictNoDescr
            | Opcode::LoadAttrDictDescr
            | Opcode::LoadAttrSplitDict
            | Opcode::LoadAttrSplitDictDescr
            | Opcode::LoadAttrNoDictDescr
            | Opcode::LoadAttrType
            | Opcode::LoadAttrModule
            | Opcode::LoadAttrPolymorphic => Opcode::LoadAttrUncachable,
            Opcode::LoadMethod
            | Opcode::LoadMethodDictDescr
            | Opcode::LoadMethodSplitDictDescr
            | Opcode::LoadMethodDictMethod
            | Opcode::LoadMethodSplitDictMethod
            | Opcode::LoadMethodNoDictMethod
            | Opcode::LoadMethodNoDictDescr
            | Opcode::LoadMethodType
            | Opcode::LoadMethodModule => Opcode::LoadMethodUncachable,
            Opcode::StoreAttr
            | Opcode::StoreAttrSlot
            | Opcode::StoreAttrDict
            | Opcode::StoreAttrDescr
            | Opcode::StoreAttrSplitDict => Opcode::StoreAttrUncachable,
            other => other,
        }
    }
}

/// One bytecode unit: opcode byte plus operand byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CodeUnit {
    /// The opcode.
    pub opcode: Opcode,
    /// The operand byte. For specialized opcodes, an index into one of the
    /// shadow arena's cache tables.
    pub arg: u8,
}

const _: () = assert!(std::mem::size_of::<CodeUnit>() == 2);

impl CodeUnit {
    /// Build a unit.
    #[inline]
    pub const fn new(opcode: Opcode, arg: u8) -> Self {
        Self { opcode, arg }
    }
}

/// A compiled code object: pristine bytecode plus its name and constant
/// tables. Immutable once built; the shadow arena rewrites a copy.
pub struct CodeObject {
    /// Code name, for diagnostics.
    pub name: InternedString,
    /// Bytecode units.
    pub units: Box<[CodeUnit]>,
    /// Names referenced by attribute/global opcodes.
    pub names: Box<[InternedString]>,
    /// Constant pool.
    pub consts: Box<[Value]>,
}

impl CodeObject {
    /// Build a code object, retaining the constants.
    pub fn new(
        name: InternedString,
        units: Vec<CodeUnit>,
        names: Vec<InternedString>,
        consts: Vec<Value>,
    ) -> Self {
        for c in &consts {
            c.incref();
        }
        Self {
            name,
            units: units.into_boxed_slice(),
            names: names.into_boxed_slice(),
            consts: consts.into_boxed_slice(),
        }
    }

    /// Number of units.
    #[inline]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Check for empty code.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Unit at an instruction offset.
    #[inline]
    pub fn unit(&self, ip: usize) -> CodeUnit {
        self.units[ip]
    }

    /// Name table entry.
    #[inline]
    pub fn name_at(&self, idx: usize) -> &InternedString {
        &self.names[idx]
    }
}

impl Drop for CodeObject {
    fn drop(&mut self) {
        for c in self.consts.iter() {
            c.decref();
        }
    }
}
