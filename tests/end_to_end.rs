//! End-to-end scenarios mirroring §8: each test drives the real
//! loader/interpreter/GC path rather than asserting on printed stdout (which
//! isn't capturable from inside the process), by reading the computed result
//! back through `Vm::call`'s return value or a module's exports.

use meowrt::objects::proto::{UpvalueDesc, UpvalueKind};
use meowrt::objects::Header;
use meowrt::opcode::{Instruction, OpCode};
use meowrt::value::Value;
use meowrt::vm::Vm;

fn new_vm() -> Vm {
    Vm::new(".".to_string(), Vec::new())
}

/// Allocates a prototype and fills it in, mirroring the loader's own
/// allocate-then-link two-step (`src/loader/text.rs`/`binary.rs`).
fn build_proto(
    vm: &mut Vm,
    name: &str,
    num_registers: usize,
    num_upvalues: usize,
    constants: Vec<Value>,
    upvalue_descs: Vec<UpvalueDesc>,
    code: Vec<Instruction>,
) -> *mut Header {
    let ptr = vm.heap.alloc_proto(name.to_string(), "<test>".to_string());
    unsafe {
        let p = Header::as_proto(ptr).unwrap();
        (*p).num_registers = num_registers;
        (*p).num_upvalues = num_upvalues;
        (*p).constants = constants;
        (*p).upvalue_descs = upvalue_descs;
        (*p).code = code;
    }
    ptr
}

fn inst(op: OpCode, args: &[i64]) -> Instruction {
    Instruction::new(op, args.to_vec())
}

#[test]
fn arithmetic_and_return() {
    let mut vm = new_vm();
    let proto = build_proto(
        &mut vm,
        "@main",
        2,
        0,
        vec![Value::Int(3), Value::Int(4)],
        vec![],
        vec![
            inst(OpCode::LoadConst, &[0, 0]),
            inst(OpCode::LoadConst, &[1, 1]),
            inst(OpCode::Add, &[0, 0, 1]),
            inst(OpCode::Return, &[0]),
        ],
    );
    let closure = vm.heap.alloc_closure(proto, Vec::new());
    let result = vm.call(Value::object(closure), &[]).unwrap();
    assert!(matches!(result, Value::Int(7)));
}

#[test]
fn closure_shares_an_upvalue_across_calls() {
    let mut vm = new_vm();
    let counter = build_proto(
        &mut vm,
        "counter",
        2,
        1,
        vec![],
        vec![UpvalueDesc { kind: UpvalueKind::Local, index: 0 }],
        vec![
            inst(OpCode::GetUpvalue, &[0, 0]),
            inst(OpCode::LoadInt, &[1, 1]),
            inst(OpCode::Add, &[0, 0, 1]),
            inst(OpCode::SetUpvalue, &[0, 0]),
            inst(OpCode::Return, &[0]),
        ],
    );

    let main = build_proto(&mut vm, "@main", 3, 0, vec![], vec![], vec![]);
    unsafe {
        let p = Header::as_proto(main).unwrap();
        (*p).constants = vec![Value::object(counter)];
        (*p).code = vec![
            inst(OpCode::LoadInt, &[0, 0]),
            inst(OpCode::Closure, &[1, 0]),
            inst(OpCode::Call, &[-1, 1, 0, 0]),
            inst(OpCode::Call, &[-1, 1, 0, 0]),
            inst(OpCode::Call, &[2, 1, 0, 0]),
            inst(OpCode::Return, &[2]),
        ];
    }

    let main_closure = vm.heap.alloc_closure(main, Vec::new());
    let result = vm.call(Value::object(main_closure), &[]).unwrap();
    assert!(matches!(result, Value::Int(3)), "expected 3 after three increments, got {result:?}");
}

#[test]
fn instance_method_resolves_through_the_superclass_chain() {
    let mut vm = new_vm();
    let hello_const = Value::object(vm.heap.alloc_string("A"));
    let hello_proto = build_proto(
        &mut vm,
        "hello",
        1,
        0,
        vec![hello_const],
        vec![],
        vec![inst(OpCode::LoadConst, &[0, 0]), inst(OpCode::Return, &[0])],
    );
    let hello_closure = Value::object(vm.heap.alloc_closure(hello_proto, Vec::new()));

    let class_a = vm.heap.alloc_class("A".to_string());
    unsafe {
        (*Header::as_class(class_a).unwrap()).methods.set("hello", hello_closure);
    }
    let class_b = vm.heap.alloc_class("B".to_string());
    unsafe {
        (*Header::as_class(class_b).unwrap()).superclass = Some(class_a);
    }
    let instance = Value::object(vm.heap.alloc_instance(class_b));

    let method = vm.get_magic_method(instance, "hello").expect("B inherits hello from A");
    let result = vm.call(method, &[]).unwrap();
    assert_eq!(result.as_str(), Some("A"));
}

#[test]
fn try_throw_unwinds_to_the_handler_and_binds_the_message() {
    let mut vm = new_vm();
    let boom = Value::object(vm.heap.alloc_string("boom"));
    let proto = build_proto(
        &mut vm,
        "@main",
        1,
        0,
        vec![boom],
        vec![],
        vec![
            inst(OpCode::LoadConst, &[0, 0]),
            inst(OpCode::SetupTry, &[3, 0]),
            inst(OpCode::Throw, &[0]),
            inst(OpCode::Return, &[0]),
        ],
    );
    let closure = vm.heap.alloc_closure(proto, Vec::new());
    let result = vm.call(Value::object(closure), &[]).unwrap();
    assert_eq!(result.as_str(), Some("boom"));
}

#[test]
fn string_indexing_in_and_out_of_range() {
    let mut vm = new_vm();
    let s = Value::object(vm.heap.alloc_string("abc"));

    let ok_proto = build_proto(
        &mut vm,
        "index_ok",
        2,
        0,
        vec![],
        vec![],
        vec![inst(OpCode::LoadInt, &[1, 1]), inst(OpCode::GetIndex, &[1, 0, 1]), inst(OpCode::Return, &[1])],
    );
    let ok_closure = vm.heap.alloc_closure(ok_proto, Vec::new());
    let result = vm.call(Value::object(ok_closure), &[s]).unwrap();
    assert_eq!(result.as_str(), Some("b"));

    let oob_proto = build_proto(
        &mut vm,
        "index_oob",
        2,
        0,
        vec![],
        vec![],
        vec![inst(OpCode::LoadInt, &[1, 3]), inst(OpCode::GetIndex, &[1, 0, 1]), inst(OpCode::Return, &[1])],
    );
    let oob_closure = vm.heap.alloc_closure(oob_proto, Vec::new());
    let err = vm.call(Value::object(oob_closure), &[s]).unwrap_err();
    assert!(matches!(err, meowrt::error::VmError::Bounds { .. }), "expected a bounds error, got {err:?}");
}

#[test]
fn module_import_caches_and_runs_main_at_most_once() {
    let dir = std::env::temp_dir().join(format!("meowrt-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let lib_path = dir.join("lib.meow");
    std::fs::write(
        &lib_path,
        r#".func @main
.registers 1
.const "value"
.const 42
LOAD_CONST 0 1
EXPORT 0 0
.endfunc
"#,
    )
    .unwrap();

    let mut vm = new_vm();
    let mut importer = meowrt::import::Importer::new(dir.to_string_lossy().to_string());

    let first = importer.load_scripted_module(&mut vm, "lib.meow", false, None).unwrap();
    unsafe {
        assert!(!(*Header::as_module(first).unwrap()).is_executed);
    }
    importer.ensure_executed(&mut vm, first).unwrap();
    unsafe {
        let m = &*Header::as_module(first).unwrap();
        assert!(m.is_executed);
        assert!(!m.is_executing);
        assert_eq!(m.exports.get("value").unwrap().as_int(), Some(42));
    }

    let second = importer.load_scripted_module(&mut vm, "lib.meow", false, None).unwrap();
    assert_eq!(first, second, "a second import of the same path must hit the module cache");

    // Re-running the already-executed module must be a no-op, not a second run.
    importer.ensure_executed(&mut vm, second).unwrap();
    unsafe {
        let m = &*Header::as_module(second).unwrap();
        assert!(m.is_executed);
        assert!(!m.is_executing);
    }

    std::fs::remove_dir_all(&dir).ok();
}
