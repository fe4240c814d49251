use super::{Header, ObjectKind, Trace};
use crate::value::Value;

/// Mutable-in-place-at-a-byte-index string, per §3. Stored as raw bytes rather
/// than `String` so `SET_INDEX` can overwrite a single byte without
/// re-validating the whole buffer as UTF-8 on every write (the language does
/// not promise its strings stay valid UTF-8 after such a write; `as_str`
/// uses lossy conversion for display).
#[repr(C)]
pub struct ObjString {
    pub header: Header,
    pub bytes: Vec<u8>,
}

impl ObjString {
    pub fn new(value: &str) -> Self {
        Self {
            header: Header::new(ObjectKind::String),
            bytes: value.as_bytes().to_vec(),
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { header: Header::new(ObjectKind::String), bytes }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

impl Trace for ObjString {
    fn trace(&self, _mark: &mut dyn FnMut(Value)) {}

    fn deep_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.bytes.len()
    }
}
