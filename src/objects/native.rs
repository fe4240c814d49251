use std::rc::Rc;

use super::{Header, ObjectKind, Trace};
use crate::error::VmError;
use crate::value::Value;
use crate::vm::Vm;

/// A native function as described in §3/§6: callable either as `(args)` or as
/// `(engine, args)`. Magic-method wrapping (§4.6, §9) always produces an
/// `Advanced` closure so it can re-enter the interpreter to invoke the
/// original callable with the receiver prepended.
#[derive(Clone)]
pub enum NativeFnImpl {
    Simple(Rc<dyn Fn(&[Value]) -> Result<Value, VmError>>),
    Advanced(Rc<dyn Fn(&mut Vm, &[Value]) -> Result<Value, VmError>>),
}

impl NativeFnImpl {
    pub fn call(&self, vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
        match self {
            NativeFnImpl::Simple(f) => f(args),
            NativeFnImpl::Advanced(f) => f(vm, args),
        }
    }
}

#[repr(C)]
pub struct ObjNative {
    pub header: Header,
    pub name: String,
    pub func: NativeFnImpl,
}

impl ObjNative {
    pub fn new(name: impl Into<String>, func: NativeFnImpl) -> Self {
        Self { header: Header::new(ObjectKind::Native), name: name.into(), func }
    }
}

impl Trace for ObjNative {
    fn trace(&self, _mark: &mut dyn FnMut(Value)) {}
}
