use super::{Header, ObjectKind, Trace};
use crate::value::Value;

/// Safety cap on `SET_INDEX` auto-growth, per §4.5.
pub const MAX_ARRAY_LEN: usize = 10_000_000;

#[repr(C)]
pub struct ObjArray {
    pub header: Header,
    pub elements: Vec<Value>,
}

impl ObjArray {
    pub fn new(elements: Vec<Value>) -> Self {
        Self { header: Header::new(ObjectKind::Array), elements }
    }
}

impl Trace for ObjArray {
    fn trace(&self, mark: &mut dyn FnMut(Value)) {
        for v in &self.elements {
            mark(*v);
        }
    }

    fn deep_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.elements.len() * std::mem::size_of::<Value>()
    }
}
