use crate::objects::{
    self, Header, ObjArray, ObjBoundMethod, ObjClass, ObjClosure, ObjInstance, ObjModule,
    ObjNative, ObjObject, ObjString, ObjUpvalue, FunctionProto,
};
use crate::objects::native::NativeFnImpl;
use crate::value::Value;

/// Owns every heap object and hands out raw pointers into them. Mirrors the
/// allocate-and-register-by-pointer pattern this codebase has always used for
/// its object manager; generalized here to the full variant set the spec
/// names instead of one hardcoded object type per `alloc_*`.
///
/// All allocations - including arrays and objects/maps - go through here; §9
/// flags the original's occasional non-GC allocation path for these two types
/// as a bug this implementation does not repeat.
pub struct Heap {
    objects: Vec<*mut Header>,
    pending_bytes: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self { objects: Vec::new(), pending_bytes: 0 }
    }

    pub fn drain_pending_bytes(&mut self) -> usize {
        let b = self.pending_bytes;
        self.pending_bytes = 0;
        b
    }

    fn register<T>(&mut self, obj: Box<T>) -> *mut Header {
        let ptr = Box::into_raw(obj) as *mut Header;
        let size = unsafe { objects::deep_size_of(ptr) };
        self.pending_bytes += size;
        self.objects.push(ptr);
        ptr
    }

    pub fn alloc_string(&mut self, s: &str) -> *mut Header {
        self.register(Box::new(ObjString::new(s)))
    }

    pub fn alloc_string_bytes(&mut self, bytes: Vec<u8>) -> *mut Header {
        self.register(Box::new(ObjString::from_bytes(bytes)))
    }

    pub fn alloc_array(&mut self, elements: Vec<Value>) -> *mut Header {
        self.register(Box::new(ObjArray::new(elements)))
    }

    pub fn alloc_object(&mut self) -> *mut Header {
        self.register(Box::new(ObjObject::new()))
    }

    pub fn alloc_class(&mut self, name: String) -> *mut Header {
        self.register(Box::new(ObjClass::new(name)))
    }

    pub fn alloc_instance(&mut self, klass: *mut Header) -> *mut Header {
        self.register(Box::new(ObjInstance::new(klass)))
    }

    pub fn alloc_closure(&mut self, proto: *mut Header, upvalues: Vec<*mut Header>) -> *mut Header {
        self.register(Box::new(ObjClosure::new(proto, upvalues)))
    }

    pub fn alloc_bound_method(&mut self, receiver: *mut Header, callable: *mut Header) -> *mut Header {
        self.register(Box::new(ObjBoundMethod::new(receiver, callable)))
    }

    pub fn alloc_proto(&mut self, name: String, source_name: String) -> *mut Header {
        self.register(Box::new(FunctionProto::new(name, source_name)))
    }

    pub fn alloc_upvalue(&mut self, slot_index: usize) -> *mut Header {
        self.register(Box::new(ObjUpvalue::open(slot_index)))
    }

    pub fn alloc_module(&mut self, name: String, resolved_path: String) -> *mut Header {
        self.register(Box::new(ObjModule::new(name, resolved_path)))
    }

    pub fn alloc_native(&mut self, name: impl Into<String>, func: NativeFnImpl) -> *mut Header {
        self.register(Box::new(ObjNative::new(name, func)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &*mut Header> {
        self.objects.iter()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn remove(&mut self, ptr: *mut Header) {
        if let Some(pos) = self.objects.iter().position(|&p| p == ptr) {
            self.objects.swap_remove(pos);
        }
    }

    /// # Safety
    /// Must only be called once, at VM teardown; every pointer handed out by
    /// this heap becomes dangling afterwards.
    pub unsafe fn free_all(&mut self) {
        for &ptr in &self.objects {
            objects::drop_object(ptr);
        }
        self.objects.clear();
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        unsafe { self.free_all(); }
    }
}
