use super::{Header, ObjectKind, Trace};
use crate::table::Table;
use crate::value::Value;

#[repr(C)]
pub struct ObjModule {
    pub header: Header,
    pub name: String,
    pub resolved_path: String,
    pub globals: Table,
    pub exports: Table,
    pub main_proto: Option<*mut Header>,
    pub is_executing: bool,
    pub is_executed: bool,
    pub is_binary: bool,
}

impl ObjModule {
    pub fn new(name: String, resolved_path: String) -> Self {
        Self {
            header: Header::new(ObjectKind::Module),
            name,
            resolved_path,
            globals: Table::new(),
            exports: Table::new(),
            main_proto: None,
            is_executing: false,
            is_executed: false,
            is_binary: false,
        }
    }
}

impl Trace for ObjModule {
    fn trace(&self, mark: &mut dyn FnMut(Value)) {
        for (_, v) in self.globals.iter() {
            mark(*v);
        }
        for (_, v) in self.exports.iter() {
            mark(*v);
        }
        if let Some(p) = self.main_proto {
            mark(Value::object(p));
        }
    }
}
