//! Functions and bound methods.
//!
//! A `FunctionObject` is a callable non-data descriptor: resolving it
//! through an instance produces a `BoundMethodObject` pairing the function
//! with its receiver. Method-load opcodes avoid the pairing allocation by
//! returning the unbound function and the receiver separately.

use umbra_core::{InternedString, Value};

use crate::object::type_obj::builtin_types;
use crate::object::{alloc, ObjectHeader, ObjectKind};

/// A plain function.
#[repr(C)]
pub struct FunctionObject {
    /// Object header.
    pub header: ObjectHeader,
    /// Function name.
    pub name: InternedString,
}

impl FunctionObject {
    /// Allocate a function.
    pub fn alloc(name: InternedString) -> Value {
        let builtins = builtin_types();
        Value::from_object(builtins.function_type).incref();
        alloc(FunctionObject {
            header: ObjectHeader::new(ObjectKind::Function, builtins.function_type),
            name,
        })
    }
}

/// A function bound to a receiver.
#[repr(C)]
pub struct BoundMethodObject {
    /// Object header.
    pub header: ObjectHeader,
    /// The underlying function.
    pub func: Value,
    /// The receiver the function is bound to.
    pub receiver: Value,
}

impl BoundMethodObject {
    /// Allocate a bound method, retaining both components.
    pub fn alloc(func: Value, receiver: Value) -> Value {
        let builtins = builtin_types();
        Value::from_object(builtins.bound_method_type).incref();
        func.incref();
        receiver.incref();
        alloc(BoundMethodObject {
            header: ObjectHeader::new(ObjectKind::BoundMethod, builtins.bound_method_type),
            func,
            receiver,
        })
    }
}

impl Drop for BoundMethodObject {
    fn drop(&mut self) {
        self.func.decref();
        self.receiver.decref();
    }
}
