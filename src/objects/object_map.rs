use super::{Header, ObjectKind, Trace};
use crate::table::Table;
use crate::value::Value;

/// Heap-owned `String -> Value` map (the `object` literal type), distinct from
/// the [`Table`] type used for non-value bookkeeping maps like module globals.
#[repr(C)]
pub struct ObjObject {
    pub header: Header,
    pub fields: Table,
}

impl ObjObject {
    pub fn new() -> Self {
        Self { header: Header::new(ObjectKind::Object), fields: Table::new() }
    }
}

impl Default for ObjObject {
    fn default() -> Self {
        Self::new()
    }
}

impl Trace for ObjObject {
    fn trace(&self, mark: &mut dyn FnMut(Value)) {
        for (_, v) in self.fields.iter() {
            mark(*v);
        }
    }

    fn deep_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.fields.len() * (std::mem::size_of::<Value>() + 16)
    }
}
