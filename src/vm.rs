use std::collections::HashMap;

use log::{debug, trace, warn};

use crate::builtins;
use crate::call_frame::CallFrame;
use crate::error::VmError;
use crate::gc::GarbageCollector;
use crate::heap::Heap;
use crate::import::Importer;
use crate::objects::array::MAX_ARRAY_LEN;
use crate::objects::native::NativeFnImpl;
use crate::objects::{self, Header, ObjectKind};
use crate::opcode::{Instruction, OpCode};
use crate::operator;
use crate::table::Table;
use crate::value::{self, Value};

const INITIAL_GC_THRESHOLD: usize = 1 << 20;

/// A live exception handler installed by `SETUP_TRY`, per §4.7.
struct TryHandler {
    catch_ip: usize,
    frame_depth: usize,
    stack_depth: usize,
    error_reg: i64,
}

/// The interpreter. Owns the heap, the operand stack, the call stack, the
/// module cache, and the builtin method/getter registries - every piece of
/// process-wide state the root set (§4.2) needs to walk.
pub struct Vm {
    pub heap: Heap,
    gc: GarbageCollector,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    open_upvalues: Vec<*mut Header>,
    modules: HashMap<String, *mut Header>,
    native_module: *mut Header,
    builtin_methods: HashMap<&'static str, Table>,
    builtin_getters: HashMap<&'static str, Table>,
    try_handlers: Vec<TryHandler>,
    gc_suppress_depth: u32,
    bytes_since_gc: usize,
    gc_threshold: usize,
    pub argv: Vec<String>,
    pub importer: Importer,
}

impl Vm {
    pub fn new(base_dir: impl Into<String>, argv: Vec<String>) -> Self {
        let mut vm = Vm {
            heap: Heap::new(),
            gc: GarbageCollector::new(),
            stack: Vec::with_capacity(4096),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            modules: HashMap::new(),
            native_module: std::ptr::null_mut(),
            builtin_methods: HashMap::new(),
            builtin_getters: HashMap::new(),
            try_handlers: Vec::new(),
            gc_suppress_depth: 0,
            bytes_since_gc: 0,
            gc_threshold: INITIAL_GC_THRESHOLD,
            argv,
            importer: Importer::new(base_dir.into()),
        };
        vm.native_module = builtins::install_native_module(&mut vm);
        preload_stdlib(&mut vm);
        vm
    }

    // ---- allocation / GC -------------------------------------------------

    fn maybe_collect(&mut self) {
        let pending = self.heap.drain_pending_bytes();
        if pending == 0 {
            return;
        }
        self.bytes_since_gc += pending;
        if self.bytes_since_gc >= self.gc_threshold && self.gc_suppress_depth == 0 {
            self.collect_garbage();
        }
    }

    pub fn collect_garbage(&mut self) {
        let before = self.heap.len();
        self.gc.prepare_collection(&self.heap);
        self.mark_roots();
        self.gc.trace_references();
        let freed = self.gc.sweep(&mut self.heap);
        let after = self.heap.len();
        if freed == 0 || after * 4 > before.max(1) * 3 {
            self.gc_threshold *= 2;
        }
        self.gc.record_cycle(before, freed, after, self.gc_threshold);
        self.bytes_since_gc = 0;
        debug!("gc cycle: before={before} after={after} next_threshold={}", self.gc_threshold);
    }

    fn mark_roots(&mut self) {
        for &v in &self.stack {
            self.gc.mark_value(v);
        }
        for frame in &self.frames {
            self.gc.mark_object(frame.closure);
            self.gc.mark_object(frame.module);
        }
        for &up in &self.open_upvalues {
            self.gc.mark_object(up);
        }
        for m in self.modules.values() {
            self.gc.mark_object(*m);
        }
        self.gc.mark_object(self.native_module);
        for table in self.builtin_methods.values() {
            for (_, v) in table.iter() {
                self.gc.mark_value(*v);
            }
        }
        for table in self.builtin_getters.values() {
            for (_, v) in table.iter() {
                self.gc.mark_value(*v);
            }
        }
    }

    pub fn alloc_string(&mut self, s: &str) -> Value {
        let p = self.heap.alloc_string(s);
        self.maybe_collect();
        Value::object(p)
    }

    pub fn alloc_native(&mut self, name: impl Into<String>, f: NativeFnImpl) -> Value {
        let p = self.heap.alloc_native(name, f);
        self.maybe_collect();
        Value::object(p)
    }

    pub fn register_method(&mut self, type_name: &'static str, name: &str, value: Value) {
        self.builtin_methods.entry(type_name).or_insert_with(Table::new).set(name, value);
    }

    pub fn register_getter(&mut self, type_name: &'static str, name: &str, value: Value) {
        self.builtin_getters.entry(type_name).or_insert_with(Table::new).set(name, value);
    }

    pub fn native_module(&self) -> *mut Header {
        self.native_module
    }

    pub fn cache_module(&mut self, key: String, module: *mut Header) {
        self.modules.insert(key, module);
    }

    pub fn lookup_module(&self, key: &str) -> Option<*mut Header> {
        self.modules.get(key).copied()
    }

    // ---- top-level interpret ---------------------------------------------

    pub fn interpret(&mut self, entry_path: &str, is_binary: bool) -> Result<(), VmError> {
        let importer_ptr: *mut Importer = &mut self.importer;
        // SAFETY: `Importer`'s own fields (cache, stdlib root cell) live in a
        // heap allocation disjoint from every field this call touches on
        // `self`; this is the same self-referential pattern the interpreter
        // already uses for builtin dispatch through raw object pointers.
        let module = unsafe { (*importer_ptr).load_scripted_module(self, entry_path, is_binary, None) }
            .map_err(|e| VmError::import(e.to_string()))?;
        self.run_module_main(module)
    }

    /// Schedule and run a module's `@main`, used both by the entry point and
    /// by `IMPORT_MODULE`. Leaves `isExecuting`/`isExecuted` in the state
    /// §4.8/§9 specify: `isExecuting` set before the frame is pushed,
    /// `isExecuted` set only once that exact frame returns.
    pub fn run_module_main(&mut self, module: *mut Header) -> Result<(), VmError> {
        let main_proto = unsafe {
            let m = Header::as_module(module).unwrap();
            (*m).is_executing = true;
            (*m).main_proto
        };
        let Some(proto) = main_proto else {
            return Ok(());
        };
        let closure = self.heap.alloc_closure(proto, Vec::new());
        self.maybe_collect();
        let depth_before = self.frames.len();
        let slot_start = self.stack.len();
        let num_registers = unsafe { (*Header::as_proto(proto).unwrap()).num_registers };
        for _ in 0..num_registers {
            self.stack.push(Value::Null);
        }
        let mut frame = CallFrame::new(closure, module, slot_start, num_registers, -1);
        frame.is_module_main = true;
        self.frames.push(frame);
        let result = self.run_until_depth(depth_before);
        if result.is_err() {
            unsafe {
                let m = Header::as_module(module).unwrap();
                (*m).is_executing = false;
            }
        }
        result
    }

    /// Re-entrant call used by native code and magic-method dispatch (§4.5,
    /// §9). Pushes one destination slot plus the callee's frame (if any),
    /// runs the inner loop until the call stack returns to entry depth, then
    /// returns the destination slot's value.
    pub fn call(&mut self, callee: Value, args: &[Value]) -> Result<Value, VmError> {
        let depth_before = self.frames.len();
        let dest_slot = self.stack.len();
        self.stack.push(Value::Null);
        self.dispatch_call(callee, args, Some(dest_slot))?;
        if self.frames.len() > depth_before {
            self.run_until_depth(depth_before)?;
        }
        let result = self.stack[dest_slot];
        self.stack.truncate(dest_slot);
        Ok(result)
    }

    fn run_until_depth(&mut self, depth: usize) -> Result<(), VmError> {
        while self.frames.len() > depth {
            if let Err(err) = self.step() {
                self.handle_exception(err, depth)?;
            }
        }
        Ok(())
    }

    /// Route a runtime error through the exception protocol (§4.7). If no
    /// handler is active at or above `floor`, propagate to the caller (which,
    /// at the outermost interpret call, logs and terminates).
    fn handle_exception(&mut self, err: VmError, floor: usize) -> Result<(), VmError> {
        loop {
            let Some(handler) = self.try_handlers.last() else {
                return Err(err);
            };
            if handler.frame_depth < floor {
                return Err(err);
            }
            let handler = self.try_handlers.pop().unwrap();
            while self.frames.len() > handler.frame_depth + 1 {
                let frame = self.frames.pop().unwrap();
                self.close_upvalues(frame.slot_start);
            }
            self.stack.truncate(handler.stack_depth);
            if self.frames.is_empty() {
                return Err(err);
            }
            let message = err.to_string();
            let msg_value = self.alloc_string(&message);
            let frame = self.frames.last_mut().unwrap();
            frame.ip = handler.catch_ip;
            let reg = if handler.error_reg >= 0 { handler.error_reg as usize } else { 0 };
            if reg < frame.num_registers {
                self.stack[frame.slot_start + reg] = msg_value;
            }
            return Ok(());
        }
    }

    // ---- closures / upvalues ----------------------------------------------

    fn capture_upvalue(&mut self, abs_slot: usize) -> *mut Header {
        if let Some(&existing) = self
            .open_upvalues
            .iter()
            .find(|&&u| unsafe { (*Header::as_upvalue(u).unwrap()).slot_index == abs_slot })
        {
            return existing;
        }
        let up = self.heap.alloc_upvalue(abs_slot);
        self.maybe_collect();
        let pos = self
            .open_upvalues
            .iter()
            .position(|&u| unsafe { (*Header::as_upvalue(u).unwrap()).slot_index > abs_slot })
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(pos, up);
        up
    }

    fn close_upvalues(&mut self, threshold: usize) {
        while let Some(&last) = self.open_upvalues.last() {
            let slot = unsafe { (*Header::as_upvalue(last).unwrap()).slot_index };
            if slot < threshold {
                break;
            }
            self.open_upvalues.pop();
            let value = self.stack[slot];
            unsafe {
                (*Header::as_upvalue(last).unwrap()).close(value);
            }
        }
    }

    // ---- main loop ----------------------------------------------------

    fn step(&mut self) -> Result<(), VmError> {
        let frame_idx = self.frames.len() - 1;
        let inst = {
            let frame = &self.frames[frame_idx];
            let proto = unsafe { Header::as_proto((*Header::as_closure(frame.closure).unwrap()).proto).unwrap() };
            let code = unsafe { &(*proto).code };
            if frame.ip >= code.len() {
                drop(frame);
                self.do_return(None)?;
                return Ok(());
            }
            code[frame.ip].clone()
        };
        self.frames[frame_idx].ip += 1;
        trace!("ip={} op={:?} args={:?}", self.frames[frame_idx].ip - 1, inst.op, inst.args);
        self.gc_suppress_depth += 1;
        let result = self.dispatch(&inst, frame_idx);
        self.gc_suppress_depth = self.gc_suppress_depth.saturating_sub(1);
        result
    }

    fn reg(&self, frame_idx: usize, idx: i64) -> Value {
        let frame = &self.frames[frame_idx];
        self.stack[frame.slot_start + idx as usize]
    }

    fn set_reg(&mut self, frame_idx: usize, idx: i64, value: Value) {
        let frame = &self.frames[frame_idx];
        let slot = frame.slot_start + idx as usize;
        if slot >= self.stack.len() {
            self.stack.resize(slot + 1, Value::Null);
        }
        self.stack[slot] = value;
    }

    fn proto_of(&self, frame_idx: usize) -> *mut Header {
        unsafe { (*Header::as_closure(self.frames[frame_idx].closure).unwrap()).proto }
    }

    fn const_at(&self, frame_idx: usize, idx: i64) -> Result<Value, VmError> {
        let proto = unsafe { &*Header::as_proto(self.proto_of(frame_idx)).unwrap() };
        proto.constants.get(idx as usize).copied().ok_or_else(|| VmError::bounds("constant index out of range"))
    }

    fn module_of(&self, frame_idx: usize) -> *mut Header {
        self.frames[frame_idx].module
    }

    fn dispatch(&mut self, inst: &Instruction, f: usize) -> Result<(), VmError> {
        use OpCode::*;
        match inst.op {
            Move => {
                let v = self.reg(f, inst.arg(1));
                self.set_reg(f, inst.arg(0), v);
            }
            LoadConst => {
                let v = self.const_at(f, inst.arg(1))?;
                self.set_reg(f, inst.arg(0), v);
            }
            LoadInt => self.set_reg(f, inst.arg(0), Value::Int(inst.arg(1))),
            LoadNull => self.set_reg(f, inst.arg(0), Value::Null),
            LoadTrue => self.set_reg(f, inst.arg(0), Value::Bool(true)),
            LoadFalse => self.set_reg(f, inst.arg(0), Value::Bool(false)),

            Add | Sub | Mul | Div | Mod | Pow | BitAnd | BitOr | BitXor | Lshift | Rshift | Eq | Neq | Lt
            | Le | Gt | Ge => {
                let lhs = self.reg(f, inst.arg(1));
                let rhs = self.reg(f, inst.arg(2));
                let result = operator::apply_binary(inst.op, &mut self.heap, lhs, rhs)?;
                self.maybe_collect();
                self.set_reg(f, inst.arg(0), result);
            }
            Neg | Not | BitNot => {
                let v = self.reg(f, inst.arg(1));
                let result = operator::apply_unary(inst.op, &mut self.heap, v)?;
                self.set_reg(f, inst.arg(0), result);
            }

            GetGlobal => {
                let name = self.const_at(f, inst.arg(1))?;
                let name = name.as_str().unwrap_or("").to_string();
                let module = unsafe { &*Header::as_module(self.module_of(f)).unwrap() };
                let v = module.globals.get(&name).unwrap_or(Value::Null);
                self.set_reg(f, inst.arg(0), v);
            }
            SetGlobal => {
                let name = self.const_at(f, inst.arg(0))?;
                let name = name.as_str().unwrap_or("").to_string();
                let v = self.reg(f, inst.arg(1));
                let module = unsafe { &mut *Header::as_module(self.module_of(f)).unwrap() };
                module.globals.set(name, v);
            }

            GetUpvalue => {
                let closure = unsafe { &*Header::as_closure(self.frames[f].closure).unwrap() };
                let up = closure.upvalues[inst.arg(1) as usize];
                let v = self.read_upvalue(up);
                self.set_reg(f, inst.arg(0), v);
            }
            SetUpvalue => {
                let v = self.reg(f, inst.arg(1));
                let closure = unsafe { &*Header::as_closure(self.frames[f].closure).unwrap() };
                let up = closure.upvalues[inst.arg(0) as usize];
                self.write_upvalue(up, v);
            }
            Closure => {
                let proto_val = self.const_at(f, inst.arg(1))?;
                let proto_ptr = proto_val.as_object_ptr().ok_or_else(|| VmError::type_error("CLOSURE operand is not a prototype"))?;
                let descs = unsafe { (*Header::as_proto(proto_ptr).unwrap()).upvalue_descs.clone() };
                let base = self.frames[f].slot_start;
                let mut upvalues = Vec::with_capacity(descs.len());
                for d in descs {
                    match d.kind {
                        crate::objects::proto::UpvalueKind::Local => {
                            upvalues.push(self.capture_upvalue(base + d.index));
                        }
                        crate::objects::proto::UpvalueKind::ParentUpvalue => {
                            let parent = unsafe { &*Header::as_closure(self.frames[f].closure).unwrap() };
                            upvalues.push(parent.upvalues[d.index]);
                        }
                    }
                }
                let c = self.heap.alloc_closure(proto_ptr, upvalues);
                self.maybe_collect();
                self.set_reg(f, inst.arg(0), Value::object(c));
            }
            CloseUpvalues => {
                let base = self.frames[f].slot_start + inst.arg(0) as usize;
                self.close_upvalues(base);
            }

            Jump => self.frames[f].ip = inst.arg(0) as usize,
            JumpIfFalse => {
                if !self.reg(f, inst.arg(0)).is_truthy() {
                    self.frames[f].ip = inst.arg(1) as usize;
                }
            }
            JumpIfTrue => {
                if self.reg(f, inst.arg(0)).is_truthy() {
                    self.frames[f].ip = inst.arg(1) as usize;
                }
            }

            Call => {
                let callee = self.reg(f, inst.arg(1));
                let start = inst.arg(2);
                let argc = inst.arg(3) as usize;
                let args: Vec<Value> = (0..argc).map(|i| self.reg(f, start + i as i64)).collect();
                let ret_arg = inst.arg(0);
                let dest = if ret_arg < 0 { None } else { Some(self.frames[f].slot_start + ret_arg as usize) };
                self.dispatch_call(callee, &args, dest)?;
            }
            Return => {
                let v = if inst.args.is_empty() { None } else { Some(self.reg(f, inst.arg(0))) };
                self.do_return(v)?;
            }

            NewArray => {
                let start = inst.arg(1);
                let count = inst.arg(2) as usize;
                let elems: Vec<Value> = (0..count).map(|i| self.reg(f, start + i as i64)).collect();
                let arr = self.heap.alloc_array(elems);
                self.maybe_collect();
                self.set_reg(f, inst.arg(0), Value::object(arr));
            }
            NewHash => {
                let start = inst.arg(1);
                let count = inst.arg(2) as usize;
                let obj = self.heap.alloc_object();
                self.maybe_collect();
                for i in 0..count {
                    let key = self.reg(f, start + (i as i64) * 2);
                    let val = self.reg(f, start + (i as i64) * 2 + 1);
                    let key = self.stringify(key);
                    unsafe {
                        (*Header::as_object(obj).unwrap()).fields.set(key, val);
                    }
                }
                self.set_reg(f, inst.arg(0), Value::object(obj));
            }

            GetIndex => self.op_get_index(f, inst)?,
            SetIndex => self.op_set_index(f, inst)?,
            GetKeys => self.op_get_keys(f, inst)?,
            GetValues => self.op_get_values(f, inst)?,

            NewClass => {
                let name = self.const_at(f, inst.arg(1))?;
                let name = name.as_str().unwrap_or("").to_string();
                let c = self.heap.alloc_class(name);
                self.maybe_collect();
                self.set_reg(f, inst.arg(0), Value::object(c));
            }
            NewInstance => {
                let class_val = self.reg(f, inst.arg(1));
                let class_ptr = class_val.as_object_ptr().ok_or_else(|| VmError::type_error("NEW_INSTANCE operand is not a class"))?;
                let inst_ptr = self.heap.alloc_instance(class_ptr);
                self.maybe_collect();
                self.set_reg(f, inst.arg(0), Value::object(inst_ptr));
            }
            GetProp => self.op_get_prop(f, inst)?,
            SetProp => self.op_set_prop(f, inst)?,
            SetMethod => {
                let class_val = self.reg(f, inst.arg(0));
                let name = self.const_at(f, inst.arg(1))?;
                let method = self.reg(f, inst.arg(2));
                let class_ptr = class_val.as_object_ptr().ok_or_else(|| VmError::type_error("SET_METHOD target is not a class"))?;
                let name = name.as_str().unwrap_or("").to_string();
                unsafe {
                    (*Header::as_class(class_ptr).unwrap()).methods.set(name, method);
                }
            }
            Inherit => {
                let sub_val = self.reg(f, inst.arg(0));
                let sup_val = self.reg(f, inst.arg(1));
                let sub = sub_val.as_object_ptr().ok_or_else(|| VmError::type_error("INHERIT target is not a class"))?;
                let sup = sup_val.as_object_ptr().ok_or_else(|| VmError::type_error("INHERIT source is not a class"))?;
                let methods: Vec<(String, Value)> =
                    unsafe { (*Header::as_class(sup).unwrap()).methods.iter().map(|(k, v)| (k.clone(), *v)).collect() };
                unsafe {
                    let subc = &mut *Header::as_class(sub).unwrap();
                    for (name, method) in methods {
                        if !subc.methods.contains(&name) {
                            subc.methods.set(name, method);
                        }
                    }
                    subc.superclass = Some(sup);
                }
            }
            GetSuper => {
                let name = self.const_at(f, inst.arg(1))?;
                let name = name.as_str().unwrap_or("").to_string();
                let sup_val = self.reg(f, inst.arg(2));
                let sup = sup_val.as_object_ptr().ok_or_else(|| VmError::type_error("GET_SUPER operand is not a class"))?;
                let method = unsafe { (*Header::as_class(sup).unwrap()).methods.get(&name) };
                let Some(method) = method else {
                    self.set_reg(f, inst.arg(0), Value::Null);
                    return Ok(());
                };
                let receiver = self.reg(f, 0);
                let bound = self.bind_callable(receiver, method)?;
                self.set_reg(f, inst.arg(0), bound);
            }

            ImportModule => {
                let path = self.const_at(f, inst.arg(1))?;
                let path = path.as_str().unwrap_or("").to_string();
                let importer_dir = unsafe { (*Header::as_module(self.module_of(f)).unwrap()).resolved_path.clone() };
                let importer_ptr: *mut Importer = &mut self.importer;
                // SAFETY: see the note on `interpret`; `Importer` owns no
                // memory that overlaps any field touched while resolving.
                let module = unsafe { (*importer_ptr).resolve_and_load(self, &path, &importer_dir) }?;
                let importer_ptr2: *mut Importer = &mut self.importer;
                // SAFETY: see the note above; `ensure_executed` only reads
                // `Importer`'s own state before delegating back into `self`.
                unsafe { (*importer_ptr2).ensure_executed(self, module) }?;
                self.set_reg(f, inst.arg(0), Value::object(module));
            }
            Export => {
                let name = self.const_at(f, inst.arg(0))?;
                let name = name.as_str().unwrap_or("").to_string();
                let v = self.reg(f, inst.arg(1));
                let module = unsafe { &mut *Header::as_module(self.module_of(f)).unwrap() };
                module.exports.set(name, v);
            }
            GetExport => {
                let name = self.const_at(f, inst.arg(1))?;
                let name = name.as_str().unwrap_or("").to_string();
                let module = unsafe { &*Header::as_module(self.module_of(f)).unwrap() };
                let v = module.exports.get(&name).unwrap_or(Value::Null);
                self.set_reg(f, inst.arg(0), v);
            }
            GetModuleExport => {
                let module_val = self.reg(f, inst.arg(1));
                let name = self.const_at(f, inst.arg(2))?;
                let name = name.as_str().unwrap_or("").to_string();
                let module_ptr = module_val.as_object_ptr().ok_or_else(|| VmError::type_error("GET_MODULE_EXPORT operand is not a module"))?;
                let v = unsafe { (*Header::as_module(module_ptr).unwrap()).exports.get(&name).unwrap_or(Value::Null) };
                self.set_reg(f, inst.arg(0), v);
            }
            ImportAll => {
                let module_val = self.reg(f, inst.arg(0));
                let module_ptr = module_val.as_object_ptr().ok_or_else(|| VmError::type_error("IMPORT_ALL operand is not a module"))?;
                let exports: Vec<(String, Value)> =
                    unsafe { (*Header::as_module(module_ptr).unwrap()).exports.iter().map(|(k, v)| (k.clone(), *v)).collect() };
                let current = unsafe { &mut *Header::as_module(self.module_of(f)).unwrap() };
                for (k, v) in exports {
                    current.globals.set(k, v);
                }
            }

            SetupTry => {
                let catch_ip = inst.arg(0) as usize;
                let error_reg = if inst.args.len() > 1 { inst.arg(1) } else { 0 };
                self.try_handlers.push(TryHandler {
                    catch_ip,
                    frame_depth: self.frames.len() - 1,
                    stack_depth: self.stack.len(),
                    error_reg,
                });
            }
            PopTry => {
                self.try_handlers.pop();
            }
            Throw => {
                let v = self.reg(f, inst.arg(0));
                let message = self.stringify(v);
                return Err(VmError::User { message });
            }

            Halt => {
                self.frames.clear();
            }

            TotalOpcodes => return Err(VmError::Internal("TOTAL_OPCODES is a sentinel, not an instruction".into())),
        }
        Ok(())
    }

    fn read_upvalue(&self, up: *mut Header) -> Value {
        unsafe {
            let u = &*Header::as_upvalue(up).unwrap();
            match u.state {
                crate::objects::UpvalueState::Closed => u.closed,
                crate::objects::UpvalueState::Open => self.stack[u.slot_index],
            }
        }
    }

    fn write_upvalue(&mut self, up: *mut Header, value: Value) {
        unsafe {
            let u = &mut *Header::as_upvalue(up).unwrap();
            match u.state {
                crate::objects::UpvalueState::Closed => u.closed = value,
                crate::objects::UpvalueState::Open => self.stack[u.slot_index] = value,
            }
        }
    }

    fn do_return(&mut self, value: Option<Value>) -> Result<(), VmError> {
        let frame = self.frames.pop().unwrap();
        self.close_upvalues(frame.slot_start);
        let ret_val = value.unwrap_or(Value::Null);
        self.stack.truncate(frame.slot_start);
        if frame.is_module_main {
            unsafe {
                let m = &mut *Header::as_module(frame.module).unwrap();
                m.is_executing = false;
                m.is_executed = true;
            }
        }
        self.write_effective(frame.ret_reg, ret_val);
        Ok(())
    }

    /// Call dispatch by callee variant, per §4.5. `dest` is an absolute stack
    /// slot (not relative to any frame) to write the result into, or `None`
    /// to discard it - computed once at the call site (the `CALL`
    /// instruction adds its current frame's `slot_start`; the re-entrant
    /// `Vm::call` pushes a fresh slot at the top of the stack), so every
    /// downstream consumer (`CallFrame.ret_reg`, `write_effective`) can treat
    /// it as an opaque absolute address regardless of how deeply nested the
    /// call stack is.
    fn dispatch_call(&mut self, callee: Value, args: &[Value], dest: Option<usize>) -> Result<(), VmError> {
        let effective_ret_reg = dest.map(|s| s as i64).unwrap_or(-1);
        let Some(ptr) = callee.as_object_ptr() else {
            return Err(VmError::type_error(format!("value of type {} is not callable", callee.type_name())));
        };
        let kind = unsafe { (*ptr).kind };
        match kind {
            ObjectKind::Closure => self.call_closure(ptr, args, effective_ret_reg),
            ObjectKind::BoundMethod => {
                let bm = unsafe { &*Header::as_bound_method(ptr).unwrap() };
                let receiver = bm.receiver;
                let callable = bm.callable;
                let kind = unsafe { (*callable).kind };
                match kind {
                    ObjectKind::Closure => self.call_closure_with_receiver(callable, receiver, args, effective_ret_reg),
                    ObjectKind::Native => {
                        let mut full = Vec::with_capacity(args.len() + 1);
                        full.push(Value::object(receiver));
                        full.extend_from_slice(args);
                        self.call_native(callable, &full, effective_ret_reg)
                    }
                    _ => Err(VmError::type_error("bound method does not wrap a callable")),
                }
            }
            ObjectKind::Class => {
                let instance = self.heap.alloc_instance(ptr);
                self.maybe_collect();
                let init = unsafe { (*Header::as_class(ptr).unwrap()).methods.get("init") };
                if let Some(init_val) = init {
                    if let Some(init_ptr) = init_val.as_object_ptr() {
                        if unsafe { (*init_ptr).kind } == ObjectKind::Closure {
                            self.call_closure_with_receiver(init_ptr, instance, args, -1)?;
                            let depth = self.frames.len() - 1;
                            self.run_until_depth(depth)?;
                        }
                    }
                }
                self.write_effective(effective_ret_reg, Value::object(instance));
                Ok(())
            }
            ObjectKind::Native => self.call_native(ptr, args, effective_ret_reg),
            _ => Err(VmError::type_error(format!("value of type {} is not callable", callee.type_name()))),
        }
    }

    fn write_effective(&mut self, effective_ret_reg: i64, value: Value) {
        if effective_ret_reg < 0 {
            return;
        }
        let slot = effective_ret_reg as usize;
        if slot >= self.stack.len() {
            self.stack.resize(slot + 1, Value::Null);
        }
        self.stack[slot] = value;
    }

    fn call_closure(&mut self, closure: *mut Header, args: &[Value], ret_reg: i64) -> Result<(), VmError> {
        let proto = unsafe { (*Header::as_closure(closure).unwrap()).proto };
        let num_registers = unsafe { (*Header::as_proto(proto).unwrap()).num_registers };
        let module = self.frames.last().map(|f| f.module).unwrap_or(std::ptr::null_mut());
        let slot_start = self.stack.len();
        for _ in 0..num_registers {
            self.stack.push(Value::Null);
        }
        let n = args.len().min(num_registers);
        for i in 0..n {
            self.stack[slot_start + i] = args[i];
        }
        let frame = CallFrame::new(closure, module, slot_start, num_registers, ret_reg);
        self.frames.push(frame);
        Ok(())
    }

    fn call_closure_with_receiver(&mut self, closure: *mut Header, receiver: *mut Header, args: &[Value], ret_reg: i64) -> Result<(), VmError> {
        let proto = unsafe { (*Header::as_closure(closure).unwrap()).proto };
        let num_registers = unsafe { (*Header::as_proto(proto).unwrap()).num_registers };
        let module = self.frames.last().map(|f| f.module).unwrap_or(std::ptr::null_mut());
        let slot_start = self.stack.len();
        for _ in 0..num_registers {
            self.stack.push(Value::Null);
        }
        if num_registers > 0 {
            self.stack[slot_start] = Value::object(receiver);
        }
        let n = args.len().min(num_registers.saturating_sub(1));
        for i in 0..n {
            self.stack[slot_start + 1 + i] = args[i];
        }
        let frame = CallFrame::new(closure, module, slot_start, num_registers, ret_reg);
        self.frames.push(frame);
        Ok(())
    }

    fn call_native(&mut self, native: *mut Header, args: &[Value], ret_reg: i64) -> Result<(), VmError> {
        let func = unsafe { (*Header::as_native(native).unwrap()).func.clone() };
        let result = func.call(self, args)?;
        self.write_effective(ret_reg, result);
        Ok(())
    }

    // ---- property / index / keys-values -----------------------------------

    pub fn stringify(&mut self, v: Value) -> String {
        match v {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Real(r) => value::format_real(r),
            Value::Object(ptr) => unsafe {
                match (*ptr).kind {
                    ObjectKind::String => (*Header::as_string(ptr).unwrap()).as_str().to_string(),
                    ObjectKind::Instance => self.stringify_instance(ptr),
                    ObjectKind::Array => {
                        let elems = (*Header::as_array(ptr).unwrap()).elements.clone();
                        let parts: Vec<String> = elems.iter().map(|e| self.stringify(*e)).collect();
                        format!("[{}]", parts.join(", "))
                    }
                    ObjectKind::Object => {
                        let fields: Vec<(String, Value)> = (*Header::as_object(ptr).unwrap()).fields.iter().map(|(k, v)| (k.clone(), *v)).collect();
                        let parts: Vec<String> = fields.iter().map(|(k, v)| format!("{}: {}", k, self.stringify(*v))).collect();
                        format!("{{{}}}", parts.join(", "))
                    }
                    ObjectKind::Class => format!("<class {}>", (*Header::as_class(ptr).unwrap()).name),
                    _ => format!("<{} object>", objects::type_name((*ptr).kind)),
                }
            },
        }
    }

    fn stringify_instance(&mut self, ptr: *mut Header) -> String {
        if let Some(callable) = self.get_magic_method(Value::object(ptr), "__str__") {
            if let Ok(result) = self.call(callable, &[]) {
                if let Some(s) = result.as_str() {
                    return s.to_string();
                }
            }
        }
        let class_name = unsafe {
            let inst = &*Header::as_instance(ptr).unwrap();
            (*Header::as_class(inst.klass).unwrap()).name.clone()
        };
        format!("<{} object>", class_name)
    }

    fn op_get_index(&mut self, f: usize, inst: &Instruction) -> Result<(), VmError> {
        let recv = self.reg(f, inst.arg(1));
        let key = self.reg(f, inst.arg(2));
        if let Some(method) = self.get_magic_method(recv, "__getindex__") {
            let result = self.call(method, &[key])?;
            self.set_reg(f, inst.arg(0), result);
            return Ok(());
        }
        if let Value::Int(idx) = key {
            let result = self.direct_index(recv, idx)?;
            self.set_reg(f, inst.arg(0), result);
            return Ok(());
        }
        let name = self.stringify(key);
        let result = self.resolve_property(recv, &name)?.unwrap_or(Value::Null);
        self.set_reg(f, inst.arg(0), result);
        Ok(())
    }

    fn direct_index(&mut self, recv: Value, idx: i64) -> Result<Value, VmError> {
        match recv {
            Value::Object(ptr) => unsafe {
                match (*ptr).kind {
                    ObjectKind::Array => {
                        let arr = &*Header::as_array(ptr).unwrap();
                        if idx < 0 || idx as usize >= arr.elements.len() {
                            return Err(VmError::bounds(format!("array index {idx} out of range")));
                        }
                        Ok(arr.elements[idx as usize])
                    }
                    ObjectKind::String => {
                        let s = &*Header::as_string(ptr).unwrap();
                        if idx < 0 || idx as usize >= s.len() {
                            return Err(VmError::bounds(format!("string index {idx} out of range")));
                        }
                        let byte = s.bytes[idx as usize];
                        Ok(Value::object(self.heap.alloc_string_bytes(vec![byte])))
                    }
                    ObjectKind::Object => {
                        let obj = &*Header::as_object(ptr).unwrap();
                        Ok(obj.fields.get(&idx.to_string()).unwrap_or(Value::Null))
                    }
                    ObjectKind::Instance => {
                        let inst = &*Header::as_instance(ptr).unwrap();
                        Ok(inst.fields.get(&idx.to_string()).unwrap_or(Value::Null))
                    }
                    _ => Err(VmError::type_error(format!("cannot index into {}", recv.type_name()))),
                }
            },
            _ => Err(VmError::type_error(format!("cannot index into {}", recv.type_name()))),
        }
    }

    fn op_set_index(&mut self, f: usize, inst: &Instruction) -> Result<(), VmError> {
        let recv = self.reg(f, inst.arg(0));
        let key = self.reg(f, inst.arg(1));
        let value = self.reg(f, inst.arg(2));
        if let Some(method) = self.get_magic_method(recv, "__setindex__") {
            self.call(method, &[key, value])?;
            return Ok(());
        }
        match (recv, key) {
            (Value::Object(ptr), Value::Int(idx)) => unsafe {
                match (*ptr).kind {
                    ObjectKind::Array => {
                        let arr = &mut *Header::as_array(ptr).unwrap();
                        if idx < 0 {
                            return Err(VmError::bounds("negative array index"));
                        }
                        let idx = idx as usize;
                        if idx >= MAX_ARRAY_LEN {
                            return Err(VmError::bounds("array index exceeds growth cap"));
                        }
                        if idx >= arr.elements.len() {
                            arr.elements.resize(idx + 1, Value::Null);
                        }
                        arr.elements[idx] = value;
                        Ok(())
                    }
                    ObjectKind::String => {
                        let s = &mut *Header::as_string(ptr).unwrap();
                        if idx < 0 || idx as usize >= s.len() {
                            return Err(VmError::bounds(format!("string index {idx} out of range")));
                        }
                        let byte_val = match value {
                            Value::Int(b) => b as u8,
                            _ => value.as_str().and_then(|v| v.bytes().next()).unwrap_or(0),
                        };
                        s.bytes[idx as usize] = byte_val;
                        Ok(())
                    }
                    ObjectKind::Object => {
                        (*Header::as_object(ptr).unwrap()).fields.set(idx.to_string(), value);
                        Ok(())
                    }
                    ObjectKind::Instance => {
                        (*Header::as_instance(ptr).unwrap()).fields.set(idx.to_string(), value);
                        Ok(())
                    }
                    _ => Err(VmError::type_error(format!("cannot index-assign into {}", recv.type_name()))),
                }
            },
            (Value::Object(ptr), key) => {
                let name = self.stringify(key);
                unsafe {
                    match (*ptr).kind {
                        ObjectKind::Object => {
                            (*Header::as_object(ptr).unwrap()).fields.set(name, value);
                            Ok(())
                        }
                        ObjectKind::Instance => {
                            (*Header::as_instance(ptr).unwrap()).fields.set(name, value);
                            Ok(())
                        }
                        _ => Err(VmError::type_error(format!("cannot index-assign into {}", recv.type_name()))),
                    }
                }
            }
            _ => Err(VmError::type_error(format!("cannot index-assign into {}", recv.type_name()))),
        }
    }

    fn op_get_keys(&mut self, f: usize, inst: &Instruction) -> Result<(), VmError> {
        let recv = self.reg(f, inst.arg(1));
        let keys: Vec<Value> = match recv {
            Value::Object(ptr) => unsafe {
                match (*ptr).kind {
                    ObjectKind::Object => {
                        let names: Vec<String> = (*Header::as_object(ptr).unwrap()).fields.keys().cloned().collect();
                        names.into_iter().map(|k| Value::object(self.heap.alloc_string(&k))).collect()
                    }
                    ObjectKind::Instance => {
                        let names: Vec<String> = (*Header::as_instance(ptr).unwrap()).fields.keys().cloned().collect();
                        names.into_iter().map(|k| Value::object(self.heap.alloc_string(&k))).collect()
                    }
                    ObjectKind::Array => (0..(*Header::as_array(ptr).unwrap()).elements.len()).map(|i| Value::Int(i as i64)).collect(),
                    ObjectKind::String => (0..(*Header::as_string(ptr).unwrap()).len()).map(|i| Value::Int(i as i64)).collect(),
                    _ => Vec::new(),
                }
            },
            _ => Vec::new(),
        };
        let arr = self.heap.alloc_array(keys);
        self.maybe_collect();
        self.set_reg(f, inst.arg(0), Value::object(arr));
        Ok(())
    }

    fn op_get_values(&mut self, f: usize, inst: &Instruction) -> Result<(), VmError> {
        let recv = self.reg(f, inst.arg(1));
        let values: Vec<Value> = match recv {
            Value::Object(ptr) => unsafe {
                match (*ptr).kind {
                    ObjectKind::Object => (*Header::as_object(ptr).unwrap()).fields.iter().map(|(_, v)| *v).collect(),
                    ObjectKind::Instance => (*Header::as_instance(ptr).unwrap()).fields.iter().map(|(_, v)| *v).collect(),
                    ObjectKind::Array => (*Header::as_array(ptr).unwrap()).elements.clone(),
                    ObjectKind::String => {
                        let bytes = (*Header::as_string(ptr).unwrap()).bytes.clone();
                        bytes.into_iter().map(|b| Value::object(self.heap.alloc_string_bytes(vec![b]))).collect()
                    }
                    _ => Vec::new(),
                }
            },
            _ => Vec::new(),
        };
        let arr = self.heap.alloc_array(values);
        self.maybe_collect();
        self.set_reg(f, inst.arg(0), Value::object(arr));
        Ok(())
    }

    fn op_get_prop(&mut self, f: usize, inst: &Instruction) -> Result<(), VmError> {
        let recv = self.reg(f, inst.arg(1));
        let name = self.const_at(f, inst.arg(2))?;
        let name = name.as_str().unwrap_or("").to_string();
        if let Value::Object(ptr) = recv {
            if unsafe { (*ptr).kind } == ObjectKind::Instance {
                let fast = unsafe { (*Header::as_instance(ptr).unwrap()).fields.get(&name) };
                if let Some(v) = fast {
                    self.set_reg(f, inst.arg(0), v);
                    return Ok(());
                }
            }
        }
        let result = self.resolve_property(recv, &name)?.unwrap_or(Value::Null);
        self.set_reg(f, inst.arg(0), result);
        Ok(())
    }

    fn op_set_prop(&mut self, f: usize, inst: &Instruction) -> Result<(), VmError> {
        let recv = self.reg(f, inst.arg(0));
        let name = self.const_at(f, inst.arg(1))?;
        let name = name.as_str().unwrap_or("").to_string();
        let value = self.reg(f, inst.arg(2));
        match recv {
            Value::Object(ptr) => unsafe {
                match (*ptr).kind {
                    ObjectKind::Instance => {
                        (*Header::as_instance(ptr).unwrap()).fields.set(name, value);
                        Ok(())
                    }
                    ObjectKind::Object => {
                        (*Header::as_object(ptr).unwrap()).fields.set(name, value);
                        Ok(())
                    }
                    _ => Err(VmError::type_error(format!("cannot set property on {}", recv.type_name()))),
                }
            },
            _ => Err(VmError::type_error(format!("cannot set property on {}", recv.type_name()))),
        }
    }

    /// `getMagicMethod`, per §4.6: resolve `(receiver, name)` to a callable or
    /// plain value, applying the receiver-rebinding rules for each receiver
    /// kind. Returns `None` when nothing resolves.
    pub fn get_magic_method(&mut self, recv: Value, name: &str) -> Option<Value> {
        self.resolve_property(recv, name).ok().flatten()
    }

    fn resolve_property(&mut self, recv: Value, name: &str) -> Result<Option<Value>, VmError> {
        let ptr = match recv.as_object_ptr() {
            Some(p) => p,
            None => {
                let type_name = match recv {
                    Value::Int(_) => "Int",
                    Value::Real(_) => "Real",
                    Value::Bool(_) => "Bool",
                    _ => return Ok(None),
                };
                return Ok(self.builtin_lookup(type_name, recv, name));
            }
        };
        let kind = unsafe { (*ptr).kind };
        match kind {
            ObjectKind::Instance => {
                let field = unsafe { (*Header::as_instance(ptr).unwrap()).fields.get(name) };
                if let Some(v) = field {
                    return Ok(Some(self.bind_callable(recv, v)?));
                }
                let mut cur = unsafe { (*Header::as_instance(ptr).unwrap()).klass };
                loop {
                    let method = unsafe { (*Header::as_class(cur).unwrap()).methods.get(name) };
                    if let Some(m) = method {
                        return Ok(Some(self.bind_callable(recv, m)?));
                    }
                    let next = unsafe { (*Header::as_class(cur).unwrap()).superclass };
                    match next {
                        Some(s) => cur = s,
                        None => break,
                    }
                }
                Ok(None)
            }
            ObjectKind::Object => {
                let field = unsafe { (*Header::as_object(ptr).unwrap()).fields.get(name) };
                if field.is_some() {
                    return Ok(field);
                }
                Ok(self.builtin_lookup("Object", recv, name))
            }
            ObjectKind::Array => Ok(self.builtin_lookup("Array", recv, name)),
            ObjectKind::String => Ok(self.builtin_lookup("String", recv, name)),
            ObjectKind::Class => Ok(unsafe { (*Header::as_class(ptr).unwrap()).methods.get(name) }),
            _ => Ok(None),
        }
    }

    fn builtin_lookup(&mut self, type_name: &str, recv: Value, name: &str) -> Option<Value> {
        if let Some(getter) = self.builtin_getters.get(type_name).and_then(|t| t.get(name)) {
            return self.call(getter, &[recv]).ok();
        }
        let method = self.builtin_methods.get(type_name).and_then(|t| t.get(name))?;
        self.wrap_native_with_receiver(method, recv)
    }

    fn wrap_native_with_receiver(&mut self, method: Value, recv: Value) -> Option<Value> {
        let ptr = method.as_object_ptr()?;
        if unsafe { (*ptr).kind } != ObjectKind::Native {
            return Some(method);
        }
        let inner = unsafe { (*Header::as_native(ptr).unwrap()).func.clone() };
        let wrapped = NativeFnImpl::Advanced(std::rc::Rc::new(move |vm: &mut Vm, args: &[Value]| {
            let mut full = Vec::with_capacity(args.len() + 1);
            full.push(recv);
            full.extend_from_slice(args);
            inner.call(vm, &full)
        }));
        Some(self.alloc_native("<bound native>", wrapped))
    }

    /// Rebind a fetched member to `receiver`: closures/bound methods become a
    /// new `BoundMethod`, natives are wrapped to prepend the receiver,
    /// anything else passes through unchanged.
    fn bind_callable(&mut self, receiver: Value, value: Value) -> Result<Value, VmError> {
        let Some(ptr) = value.as_object_ptr() else {
            return Ok(value);
        };
        let recv_ptr = receiver.as_object_ptr();
        match unsafe { (*ptr).kind } {
            ObjectKind::Closure => {
                let Some(recv_ptr) = recv_ptr else { return Ok(value) };
                let bm = self.heap.alloc_bound_method(recv_ptr, ptr);
                self.maybe_collect();
                Ok(Value::object(bm))
            }
            ObjectKind::BoundMethod => {
                let Some(recv_ptr) = recv_ptr else { return Ok(value) };
                let callable = unsafe { (*Header::as_bound_method(ptr).unwrap()).callable };
                let bm = self.heap.alloc_bound_method(recv_ptr, callable);
                self.maybe_collect();
                Ok(Value::object(bm))
            }
            ObjectKind::Native => Ok(self.wrap_native_with_receiver(value, receiver).unwrap_or(value)),
            _ => Ok(value),
        }
    }
}

fn preload_stdlib(vm: &mut Vm) {
    for name in ["array", "object", "string"] {
        let importer_ptr: *mut Importer = &mut vm.importer;
        // SAFETY: see the note in `interpret`.
        match unsafe { (*importer_ptr).load_shared_library(vm, name) } {
            Ok(_) => debug!("preloaded stdlib module '{name}'"),
            Err(e) => warn!("stdlib module '{name}' not preloaded: {e}"),
        }
    }
}
