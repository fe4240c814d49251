use super::{Header, ObjectKind, Trace};
use crate::table::Table;
use crate::value::Value;

#[repr(C)]
pub struct ObjClass {
    pub header: Header,
    pub name: String,
    pub superclass: Option<*mut Header>,
    pub methods: Table,
}

impl ObjClass {
    pub fn new(name: String) -> Self {
        Self {
            header: Header::new(ObjectKind::Class),
            name,
            superclass: None,
            methods: Table::new(),
        }
    }
}

impl Trace for ObjClass {
    fn trace(&self, mark: &mut dyn FnMut(Value)) {
        if let Some(sup) = self.superclass {
            mark(Value::object(sup));
        }
        for (_, v) in self.methods.iter() {
            mark(*v);
        }
    }
}
