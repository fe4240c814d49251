use super::{Header, ObjectKind, Trace};
use crate::table::Table;
use crate::value::Value;

#[repr(C)]
pub struct ObjInstance {
    pub header: Header,
    pub klass: *mut Header,
    pub fields: Table,
}

impl ObjInstance {
    pub fn new(klass: *mut Header) -> Self {
        Self { header: Header::new(ObjectKind::Instance), klass, fields: Table::new() }
    }
}

impl Trace for ObjInstance {
    fn trace(&self, mark: &mut dyn FnMut(Value)) {
        mark(Value::object(self.klass));
        for (_, v) in self.fields.iter() {
            mark(*v);
        }
    }
}
