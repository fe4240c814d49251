pub mod string;
pub mod array;
pub mod object_map;
pub mod class;
pub mod instance;
pub mod closure;
pub mod bound_method;
pub mod proto;
pub mod upvalue;
pub mod module;
pub mod native;

pub use string::ObjString;
pub use array::ObjArray;
pub use object_map::ObjObject;
pub use class::ObjClass;
pub use instance::ObjInstance;
pub use closure::ObjClosure;
pub use bound_method::ObjBoundMethod;
pub use proto::FunctionProto;
pub use upvalue::{ObjUpvalue, UpvalueState};
pub use module::ObjModule;
pub use native::ObjNative;

use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    String,
    Array,
    Object,
    Class,
    Instance,
    Closure,
    BoundMethod,
    Proto,
    Upvalue,
    Module,
    Native,
}

/// Common prefix every heap object begins with. Every concrete struct in this
/// module places `header: Header` as its first field so a `*mut Header` and a
/// `*mut <Concrete>` point at the same address (the `repr(C)` tagged-object
/// pattern): the object manager only ever needs to look at `kind` to decide how
/// to cast back up.
#[repr(C)]
pub struct Header {
    pub kind: ObjectKind,
}

impl Header {
    pub fn new(kind: ObjectKind) -> Self {
        Self { kind }
    }
}

/// Uniform tracing interface every heap variant implements. `mark` is supplied
/// by the collector; a `trace` call pushes every `Value`/object reference the
/// receiver owns through it. Unknown/null pointers are the caller's problem,
/// not this trait's: the collector is the one that tolerates them.
pub trait Trace {
    fn trace(&self, mark: &mut dyn FnMut(Value));
    /// Approximate heap footprint, used only for GC statistics and the
    /// adaptive threshold; never load-bearing for correctness.
    fn deep_size(&self) -> usize {
        std::mem::size_of::<Self>()
    }
}

/// Cast a type-erased object pointer down to its concrete type. Callers must
/// have already checked `(*ptr).kind` matches `T`'s kind (each `as_*` helper
/// on `Header` below does that check).
///
/// # Safety
/// `ptr` must point at a live object whose concrete type is `T`.
pub unsafe fn cast<T>(ptr: *mut Header) -> *mut T {
    ptr as *mut T
}

macro_rules! header_accessor {
    ($name:ident, $ty:ty, $kind:ident) => {
        impl Header {
            pub fn $name(ptr: *mut Header) -> Option<*mut $ty> {
                unsafe {
                    if (*ptr).kind == ObjectKind::$kind {
                        Some(cast::<$ty>(ptr))
                    } else {
                        None
                    }
                }
            }
        }
    };
}

header_accessor!(as_string, ObjString, String);
header_accessor!(as_array, ObjArray, Array);
header_accessor!(as_object, ObjObject, Object);
header_accessor!(as_class, ObjClass, Class);
header_accessor!(as_instance, ObjInstance, Instance);
header_accessor!(as_closure, ObjClosure, Closure);
header_accessor!(as_bound_method, ObjBoundMethod, BoundMethod);
header_accessor!(as_proto, FunctionProto, Proto);
header_accessor!(as_upvalue, ObjUpvalue, Upvalue);
header_accessor!(as_module, ObjModule, Module);
header_accessor!(as_native, ObjNative, Native);

/// Dispatch `trace` on a type-erased pointer by first recovering its concrete type.
///
/// # Safety
/// `ptr` must point at a live, correctly-tagged heap object.
pub unsafe fn trace_object(ptr: *mut Header, mark: &mut dyn FnMut(Value)) {
    match (*ptr).kind {
        ObjectKind::String => (*cast::<ObjString>(ptr)).trace(mark),
        ObjectKind::Array => (*cast::<ObjArray>(ptr)).trace(mark),
        ObjectKind::Object => (*cast::<ObjObject>(ptr)).trace(mark),
        ObjectKind::Class => (*cast::<ObjClass>(ptr)).trace(mark),
        ObjectKind::Instance => (*cast::<ObjInstance>(ptr)).trace(mark),
        ObjectKind::Closure => (*cast::<ObjClosure>(ptr)).trace(mark),
        ObjectKind::BoundMethod => (*cast::<ObjBoundMethod>(ptr)).trace(mark),
        ObjectKind::Proto => (*cast::<FunctionProto>(ptr)).trace(mark),
        ObjectKind::Upvalue => (*cast::<ObjUpvalue>(ptr)).trace(mark),
        ObjectKind::Module => (*cast::<ObjModule>(ptr)).trace(mark),
        ObjectKind::Native => (*cast::<ObjNative>(ptr)).trace(mark),
    }
}

/// Byte accounting dispatch, mirrors `trace_object`.
///
/// # Safety
/// `ptr` must point at a live, correctly-tagged heap object.
pub unsafe fn deep_size_of(ptr: *mut Header) -> usize {
    match (*ptr).kind {
        ObjectKind::String => (*cast::<ObjString>(ptr)).deep_size(),
        ObjectKind::Array => (*cast::<ObjArray>(ptr)).deep_size(),
        ObjectKind::Object => (*cast::<ObjObject>(ptr)).deep_size(),
        ObjectKind::Class => (*cast::<ObjClass>(ptr)).deep_size(),
        ObjectKind::Instance => (*cast::<ObjInstance>(ptr)).deep_size(),
        ObjectKind::Closure => (*cast::<ObjClosure>(ptr)).deep_size(),
        ObjectKind::BoundMethod => (*cast::<ObjBoundMethod>(ptr)).deep_size(),
        ObjectKind::Proto => (*cast::<FunctionProto>(ptr)).deep_size(),
        ObjectKind::Upvalue => (*cast::<ObjUpvalue>(ptr)).deep_size(),
        ObjectKind::Module => (*cast::<ObjModule>(ptr)).deep_size(),
        ObjectKind::Native => (*cast::<ObjNative>(ptr)).deep_size(),
    }
}

/// Drop a type-erased pointer by recovering its concrete box type first.
///
/// # Safety
/// `ptr` must have been produced by `Box::into_raw` of the matching concrete
/// type and must not be used again afterwards.
pub unsafe fn drop_object(ptr: *mut Header) {
    match (*ptr).kind {
        ObjectKind::String => drop(Box::from_raw(cast::<ObjString>(ptr))),
        ObjectKind::Array => drop(Box::from_raw(cast::<ObjArray>(ptr))),
        ObjectKind::Object => drop(Box::from_raw(cast::<ObjObject>(ptr))),
        ObjectKind::Class => drop(Box::from_raw(cast::<ObjClass>(ptr))),
        ObjectKind::Instance => drop(Box::from_raw(cast::<ObjInstance>(ptr))),
        ObjectKind::Closure => drop(Box::from_raw(cast::<ObjClosure>(ptr))),
        ObjectKind::BoundMethod => drop(Box::from_raw(cast::<ObjBoundMethod>(ptr))),
        ObjectKind::Proto => drop(Box::from_raw(cast::<FunctionProto>(ptr))),
        ObjectKind::Upvalue => drop(Box::from_raw(cast::<ObjUpvalue>(ptr))),
        ObjectKind::Module => drop(Box::from_raw(cast::<ObjModule>(ptr))),
        ObjectKind::Native => drop(Box::from_raw(cast::<ObjNative>(ptr))),
    }
}

pub fn type_name(kind: ObjectKind) -> &'static str {
    match kind {
        ObjectKind::String => "string",
        ObjectKind::Array => "array",
        ObjectKind::Object => "object",
        ObjectKind::Class => "class",
        ObjectKind::Instance => "instance",
        ObjectKind::Closure => "function",
        ObjectKind::BoundMethod => "bound_method",
        ObjectKind::Proto => "proto",
        ObjectKind::Upvalue => "upvalue",
        ObjectKind::Module => "module",
        ObjectKind::Native => "native",
    }
}
