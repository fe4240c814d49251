use super::{Header, ObjectKind, Trace};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpvalueState {
    Open,
    Closed,
}

/// A by-reference capture of an enclosing local (§4.4). While `Open` it names
/// an absolute slot on the live operand stack; `closeUpvalues` copies the
/// current value out of that slot and transitions to `Closed`, at which point
/// the upvalue owns the value.
#[repr(C)]
pub struct ObjUpvalue {
    pub header: Header,
    pub state: UpvalueState,
    pub slot_index: usize,
    pub closed: Value,
}

impl ObjUpvalue {
    pub fn open(slot_index: usize) -> Self {
        Self {
            header: Header::new(ObjectKind::Upvalue),
            state: UpvalueState::Open,
            slot_index,
            closed: Value::Null,
        }
    }

    pub fn close(&mut self, value: Value) {
        self.closed = value;
        self.state = UpvalueState::Closed;
    }
}

impl Trace for ObjUpvalue {
    fn trace(&self, mark: &mut dyn FnMut(Value)) {
        if self.state == UpvalueState::Closed {
            mark(self.closed);
        }
        // While Open the stack slot itself is a root already walked by the VM;
        // tracing it again here would double-count but never miss it.
    }
}
