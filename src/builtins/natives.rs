//! The `native` pseudo-module (§4.8): `print`, `typeof`, `len`, `assert`,
//! `int`, `real`, `bool`, `str`, `ord`, `char`, `range`. Every other stdlib
//! module copies these globals into its own namespace at load time
//! (`Importer::copy_native_globals`), matching the source engine defining
//! them once and splicing them into every module it loads.

use crate::error::VmError;
use crate::objects::native::NativeFnImpl;
use crate::objects::{Header, ObjectKind};
use crate::value::Value;
use crate::vm::Vm;

pub fn install_native_module(vm: &mut Vm) -> *mut Header {
    let module = vm.heap.alloc_module("native".to_string(), "native".to_string());

    macro_rules! def_simple {
        ($name:expr, $f:expr) => {{
            let f: NativeFnImpl = NativeFnImpl::Simple(std::rc::Rc::new($f));
            let v = vm.alloc_native($name, f);
            unsafe {
                (*Header::as_module(module).unwrap()).globals.set($name, v);
            }
        }};
    }
    macro_rules! def_advanced {
        ($name:expr, $f:expr) => {{
            let f: NativeFnImpl = NativeFnImpl::Advanced(std::rc::Rc::new($f));
            let v = vm.alloc_native($name, f);
            unsafe {
                (*Header::as_module(module).unwrap()).globals.set($name, v);
            }
        }};
    }

    def_advanced!("print", native_print);
    def_advanced!("typeof", native_typeof);
    def_simple!("len", native_len);
    def_simple!("assert", native_assert);
    def_simple!("int", native_to_int);
    def_simple!("real", native_to_real);
    def_simple!("bool", native_to_bool);
    def_advanced!("str", native_to_str);
    def_simple!("ord", native_ord);
    def_advanced!("char", native_char);
    def_advanced!("range", native_range);

    vm.cache_module("native".to_string(), module);
    module
}

fn arg0(args: &[Value]) -> Result<Value, VmError> {
    args.first().copied().ok_or_else(|| VmError::type_error("expected at least one argument"))
}

fn native_print(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    let mut parts = Vec::with_capacity(args.len());
    for a in args {
        parts.push(vm.stringify(*a));
    }
    println!("{}", parts.join(" "));
    Ok(Value::Null)
}

fn native_typeof(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    let v = arg0(args)?;
    Ok(vm.alloc_string(v.type_name()))
}

fn native_len(args: &[Value]) -> Result<Value, VmError> {
    let v = arg0(args)?;
    match v {
        Value::Object(ptr) => unsafe {
            match (*ptr).kind {
                ObjectKind::String => Ok(Value::Int((*Header::as_string(ptr).unwrap()).len() as i64)),
                ObjectKind::Array => Ok(Value::Int((*Header::as_array(ptr).unwrap()).elements.len() as i64)),
                ObjectKind::Object => Ok(Value::Int((*Header::as_object(ptr).unwrap()).fields.len() as i64)),
                _ => Ok(Value::Int(-1)),
            }
        },
        _ => Ok(Value::Int(-1)),
    }
}

fn native_assert(args: &[Value]) -> Result<Value, VmError> {
    let v = arg0(args)?;
    if !v.is_truthy() {
        let message = args.get(1).and_then(|m| m.as_str()).unwrap_or("Assertion failed.").to_string();
        return Err(VmError::User { message });
    }
    Ok(Value::Null)
}

fn native_to_int(args: &[Value]) -> Result<Value, VmError> {
    let v = arg0(args)?;
    let i = match v {
        Value::Int(i) => i,
        Value::Real(r) => r as i64,
        Value::Bool(b) => b as i64,
        Value::Object(_) => v
            .as_str()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .ok_or_else(|| VmError::type_error("cannot convert value to int"))?,
        Value::Null => return Err(VmError::type_error("cannot convert null to int")),
    };
    Ok(Value::Int(i))
}

fn native_to_real(args: &[Value]) -> Result<Value, VmError> {
    let v = arg0(args)?;
    let r = match v {
        Value::Int(i) => i as f64,
        Value::Real(r) => r,
        Value::Bool(b) => b as i64 as f64,
        Value::Object(_) => v
            .as_str()
            .and_then(|s| s.trim().parse::<f64>().ok())
            .ok_or_else(|| VmError::type_error("cannot convert value to real"))?,
        Value::Null => return Err(VmError::type_error("cannot convert null to real")),
    };
    Ok(Value::Real(r))
}

fn native_to_bool(args: &[Value]) -> Result<Value, VmError> {
    Ok(Value::Bool(arg0(args)?.is_truthy()))
}

fn native_to_str(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    let v = arg0(args)?;
    if let Value::Object(ptr) = v {
        if unsafe { (*ptr).kind } == ObjectKind::String {
            return Ok(v);
        }
    }
    let s = vm.stringify(v);
    Ok(vm.alloc_string(&s))
}

fn native_ord(args: &[Value]) -> Result<Value, VmError> {
    let v = arg0(args)?;
    let s = v.as_str().ok_or_else(|| VmError::type_error("ord() expects a string"))?;
    if s.chars().count() != 1 {
        return Err(VmError::type_error("ord() expects a string of length 1"));
    }
    let byte = s.as_bytes()[0];
    Ok(Value::Int(byte as i64))
}

fn native_char(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    let v = arg0(args)?;
    let code = match v {
        Value::Int(i) => i,
        _ => return Err(VmError::type_error("char() expects an int")),
    };
    if !(0..=255).contains(&code) {
        return Err(VmError::bounds("char() code must be within [0, 255]"));
    }
    let ptr = vm.heap.alloc_string_bytes(vec![code as u8]);
    Ok(Value::object(ptr))
}

fn native_range(vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
    let ints: Vec<i64> = args
        .iter()
        .map(|a| match a {
            Value::Int(i) => Ok(*i),
            _ => Err(VmError::type_error("range() expects int arguments")),
        })
        .collect::<Result<_, _>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => return Err(VmError::type_error("range() expects 1 to 3 arguments")),
    };
    if step == 0 {
        return Err(VmError::User { message: "range() step cannot be 0".to_string() });
    }
    let mut values = Vec::new();
    if step > 0 {
        let mut i = start;
        while i < stop {
            values.push(Value::Int(i));
            i += step;
        }
    } else {
        let mut i = start;
        while i > stop {
            values.push(Value::Int(i));
            i += step;
        }
    }
    let arr = vm.heap.alloc_array(values);
    Ok(Value::object(arr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Vm;

    fn new_vm() -> Vm {
        Vm::new(".".to_string(), Vec::new())
    }

    #[test]
    fn len_covers_strings_arrays_and_objects() {
        let mut vm = new_vm();
        let s = Value::object(vm.heap.alloc_string("hello"));
        assert_eq!(native_len(&[s]).unwrap().as_int(), Some(5));
        let arr = Value::object(vm.heap.alloc_array(vec![Value::Int(1), Value::Int(2)]));
        assert_eq!(native_len(&[arr]).unwrap().as_int(), Some(2));
    }

    #[test]
    fn int_of_str_of_int_round_trips() {
        let mut vm = new_vm();
        let i = Value::Int(1234);
        let s = native_to_str(&mut vm, &[i]).unwrap();
        assert_eq!(s.as_str(), Some("1234"));
        let back = native_to_int(&[s]).unwrap();
        assert_eq!(back.as_int(), Some(1234));
    }

    #[test]
    fn to_int_rejects_null() {
        let err = native_to_int(&[Value::Null]).unwrap_err();
        assert!(matches!(err, VmError::Type { .. }));
    }

    #[test]
    fn ord_and_char_are_inverses_within_byte_range() {
        let mut vm = new_vm();
        let c = native_char(&mut vm, &[Value::Int(65)]).unwrap();
        assert_eq!(c.as_str(), Some("A"));
        assert_eq!(native_ord(&[c]).unwrap().as_int(), Some(65));
        assert!(native_char(&mut vm, &[Value::Int(256)]).is_err());
    }

    #[test]
    fn range_supports_start_stop_step_forms() {
        let mut vm = new_vm();
        let r = native_range(&mut vm, &[Value::Int(5)]).unwrap();
        let arr = unsafe { &*Header::as_array(r.as_object_ptr().unwrap()).unwrap() };
        let ints: Vec<i64> = arr.elements.iter().map(|v| v.as_int().unwrap()).collect();
        assert_eq!(ints, vec![0, 1, 2, 3, 4]);

        let r = native_range(&mut vm, &[Value::Int(10), Value::Int(0), Value::Int(-3)]).unwrap();
        let arr = unsafe { &*Header::as_array(r.as_object_ptr().unwrap()).unwrap() };
        let ints: Vec<i64> = arr.elements.iter().map(|v| v.as_int().unwrap()).collect();
        assert_eq!(ints, vec![10, 7, 4, 1]);
    }

    #[test]
    fn assert_throws_a_user_error_with_the_supplied_message() {
        let mut vm = new_vm();
        let message = Value::object(vm.heap.alloc_string("nope"));
        let err = native_assert(&[Value::Bool(false), message]).unwrap_err();
        match err {
            VmError::User { message } => assert_eq!(message, "nope"),
            other => panic!("expected a user error, got {other:?}"),
        }
    }
}
