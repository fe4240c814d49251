use super::{Header, ObjectKind, Trace};
use crate::value::Value;

#[repr(C)]
pub struct ObjClosure {
    pub header: Header,
    pub proto: *mut Header,
    pub upvalues: Vec<*mut Header>,
}

impl ObjClosure {
    pub fn new(proto: *mut Header, upvalues: Vec<*mut Header>) -> Self {
        Self { header: Header::new(ObjectKind::Closure), proto, upvalues }
    }
}

impl Trace for ObjClosure {
    fn trace(&self, mark: &mut dyn FnMut(Value)) {
        mark(Value::object(self.proto));
        for up in &self.upvalues {
            mark(Value::object(*up));
        }
    }

    fn deep_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.upvalues.len() * std::mem::size_of::<*mut Header>()
    }
}
