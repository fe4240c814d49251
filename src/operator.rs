//! The operator dispatch table described in §4.3: given an opcode and the
//! runtime type(s) of its operands, produce a computed `Value` or a
//! `VmError::Dispatch` naming the op and both operand type names.
//!
//! The source dispatches through a table keyed by `(OpCode, ValueType[,
//! ValueType])`. Expressed as a Rust `match` over `(OpCode, ValueType,
//! ValueType)` this is exactly that table - the compiler builds a jump table
//! for it without needing a const-context map crate built for a value type
//! (function pointers over `&mut Heap` contexts) such a crate isn't built to
//! hold. The name-keyed builtin method/getter registries such a crate would
//! otherwise suit live in the dynamically-loaded stdlib modules this crate
//! only consumes (`crate::builtins`), not in code built here, so this crate
//! declares no such dependency.

use crate::error::VmError;
use crate::heap::Heap;
use crate::opcode::OpCode;
use crate::value::{self, Value, ValueType};

fn type_name(t: ValueType) -> &'static str {
    match t {
        ValueType::Null => "null",
        ValueType::Int => "int",
        ValueType::Real => "real",
        ValueType::Bool => "bool",
        ValueType::String => "string",
        ValueType::Array => "array",
        ValueType::Object => "object",
        ValueType::Class => "class",
        ValueType::Instance => "instance",
        ValueType::Closure => "function",
        ValueType::BoundMethod => "bound_method",
        ValueType::Proto => "proto",
        ValueType::Upvalue => "upvalue",
        ValueType::Module => "module",
        ValueType::Native => "native",
    }
}

fn dispatch_miss(op: OpCode, lhs: ValueType, rhs: ValueType) -> VmError {
    VmError::dispatch(op.to_string(), type_name(lhs), type_name(rhs))
}

fn is_numeric(t: ValueType) -> bool {
    matches!(t, ValueType::Int | ValueType::Real | ValueType::Bool)
}

fn stringify(v: &Value) -> String {
    match v {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Real(r) => value::format_real(*r),
        Value::Object(_) => v.as_str().map(str::to_string).unwrap_or_default(),
    }
}

pub fn apply_binary(op: OpCode, heap: &mut Heap, lhs: Value, rhs: Value) -> Result<Value, VmError> {
    let lt = lhs.value_type();
    let rt = rhs.value_type();

    match op {
        OpCode::Add => {
            if lt == ValueType::String || rt == ValueType::String {
                if lt == ValueType::String && rt == ValueType::String {
                    let s = format!("{}{}", lhs.as_str().unwrap(), rhs.as_str().unwrap());
                    return Ok(Value::object(heap.alloc_string(&s)));
                }
                if lt == ValueType::String && is_numeric(rt) {
                    let s = format!("{}{}", lhs.as_str().unwrap(), stringify(&rhs));
                    return Ok(Value::object(heap.alloc_string(&s)));
                }
                if rt == ValueType::String && is_numeric(lt) {
                    let s = format!("{}{}", stringify(&lhs), rhs.as_str().unwrap());
                    return Ok(Value::object(heap.alloc_string(&s)));
                }
                return Err(dispatch_miss(op, lt, rt));
            }
            if is_numeric(lt) && is_numeric(rt) {
                return Ok(numeric_result(lt, rt, lhs.as_number().unwrap() + rhs.as_number().unwrap()));
            }
            Err(dispatch_miss(op, lt, rt))
        }
        OpCode::Sub => arith(op, lt, rt, lhs, rhs, |a, b| a - b),
        OpCode::Mul => {
            if lt == ValueType::String && is_numeric(rt) {
                return repeat_string(heap, lhs.as_str().unwrap(), rhs.as_number().unwrap());
            }
            if rt == ValueType::String && is_numeric(lt) {
                return repeat_string(heap, rhs.as_str().unwrap(), lhs.as_number().unwrap());
            }
            arith(op, lt, rt, lhs, rhs, |a, b| a * b)
        }
        OpCode::Div => {
            if !(is_numeric(lt) && is_numeric(rt)) {
                return Err(dispatch_miss(op, lt, rt));
            }
            let a = lhs.as_number().unwrap();
            let b = rhs.as_number().unwrap();
            Ok(Value::Real(a / b))
        }
        OpCode::Mod => {
            if !(is_numeric(lt) && is_numeric(rt)) {
                return Err(dispatch_miss(op, lt, rt));
            }
            let b = rhs.as_number().unwrap();
            if b == 0.0 {
                return Ok(Value::Real(f64::NAN));
            }
            let a = lhs.as_number().unwrap();
            if lt != ValueType::Real && rt != ValueType::Real {
                let ia = a as i64;
                let ib = b as i64;
                return Ok(Value::Int(ia.wrapping_rem(ib)));
            }
            Ok(Value::Real(a % b))
        }
        OpCode::Pow => {
            if !(is_numeric(lt) && is_numeric(rt)) {
                return Err(dispatch_miss(op, lt, rt));
            }
            Ok(Value::Real(lhs.as_number().unwrap().powf(rhs.as_number().unwrap())))
        }
        OpCode::BitAnd | OpCode::BitOr | OpCode::BitXor | OpCode::Lshift | OpCode::Rshift => {
            if !(is_numeric(lt) && is_numeric(rt)) || lt == ValueType::Real || rt == ValueType::Real {
                return Err(dispatch_miss(op, lt, rt));
            }
            let a = to_bit_int(&lhs);
            let b = to_bit_int(&rhs);
            Ok(Value::Int(match op {
                OpCode::BitAnd => a & b,
                OpCode::BitOr => a | b,
                OpCode::BitXor => a ^ b,
                OpCode::Lshift => a.wrapping_shl(b as u32),
                OpCode::Rshift => a.wrapping_shr(b as u32),
                _ => unreachable!(),
            }))
        }
        OpCode::Eq => Ok(Value::Bool(value::values_equal(&lhs, &rhs))),
        OpCode::Neq => Ok(Value::Bool(!value::values_equal(&lhs, &rhs))),
        OpCode::Lt | OpCode::Le | OpCode::Gt | OpCode::Ge => {
            let ord = value::compare_values(&lhs, &rhs).ok_or_else(|| dispatch_miss(op, lt, rt))?;
            use value::Ordering::*;
            Ok(Value::Bool(match op {
                OpCode::Lt => ord == Less,
                OpCode::Le => ord != Greater,
                OpCode::Gt => ord == Greater,
                OpCode::Ge => ord != Less,
                _ => unreachable!(),
            }))
        }
        _ => Err(VmError::Internal(format!("{op} is not a binary operator"))),
    }
}

fn to_bit_int(v: &Value) -> i64 {
    match v {
        Value::Int(i) => *i,
        Value::Bool(b) => *b as i64,
        Value::Real(r) => *r as i64,
        _ => 0,
    }
}

fn numeric_result(lt: ValueType, rt: ValueType, result: f64) -> Value {
    if lt == ValueType::Real || rt == ValueType::Real {
        Value::Real(result)
    } else {
        Value::Int(result as i64)
    }
}

fn arith(
    op: OpCode,
    lt: ValueType,
    rt: ValueType,
    lhs: Value,
    rhs: Value,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Value, VmError> {
    if !(is_numeric(lt) && is_numeric(rt)) {
        return Err(dispatch_miss(op, lt, rt));
    }
    Ok(numeric_result(lt, rt, f(lhs.as_number().unwrap(), rhs.as_number().unwrap())))
}

fn repeat_string(heap: &mut Heap, s: &str, count: f64) -> Result<Value, VmError> {
    if count.is_nan() || count < 0.0 || count.fract() != 0.0 {
        return Ok(Value::Real(f64::NAN));
    }
    let n = count as usize;
    Ok(Value::object(heap.alloc_string(&s.repeat(n))))
}

pub fn apply_unary(op: OpCode, heap: &mut Heap, operand: Value) -> Result<Value, VmError> {
    let t = operand.value_type();
    match op {
        OpCode::Neg => {
            if !is_numeric(t) {
                return Err(dispatch_miss(op, t, t));
            }
            match operand {
                Value::Int(i) => Ok(Value::Int(-i)),
                _ => Ok(Value::Real(-operand.as_number().unwrap())),
            }
        }
        OpCode::Not => Ok(Value::Bool(!operand.is_truthy())),
        OpCode::BitNot => {
            if !is_numeric(t) || t == ValueType::Real {
                return Err(dispatch_miss(op, t, t));
            }
            Ok(Value::Int(!to_bit_int(&operand)))
        }
        _ => {
            let _ = heap;
            Err(VmError::Internal(format!("{op} is not a unary operator")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn add_ints() {
        let mut heap = Heap::new();
        let r = apply_binary(OpCode::Add, &mut heap, Value::Int(3), Value::Int(4)).unwrap();
        assert!(matches!(r, Value::Int(7)));
    }

    #[test]
    fn add_string_and_int_coerces_to_string() {
        let mut heap = Heap::new();
        let s = Value::object(heap.alloc_string("x="));
        let r = apply_binary(OpCode::Add, &mut heap, s, Value::Int(5)).unwrap();
        assert_eq!(r.as_str(), Some("x=5"));
    }

    #[test]
    fn div_by_zero_follows_dividend_sign() {
        let mut heap = Heap::new();
        let pos = apply_binary(OpCode::Div, &mut heap, Value::Int(1), Value::Real(0.0)).unwrap();
        assert_eq!(pos.as_real(), Some(f64::INFINITY));
        let neg = apply_binary(OpCode::Div, &mut heap, Value::Int(-1), Value::Real(0.0)).unwrap();
        assert_eq!(neg.as_real(), Some(f64::NEG_INFINITY));
        let zero = apply_binary(OpCode::Div, &mut heap, Value::Int(0), Value::Int(0)).unwrap();
        assert!(zero.as_real().unwrap().is_nan());
    }

    #[test]
    fn dispatch_miss_names_both_operand_types() {
        let mut heap = Heap::new();
        let err = apply_binary(OpCode::Sub, &mut heap, Value::Bool(true), Value::object(heap.alloc_string("s"))).unwrap_err();
        match err {
            VmError::Dispatch { op, lhs, rhs } => {
                assert_eq!(op, "SUB");
                assert_eq!(lhs, "bool");
                assert_eq!(rhs, "string");
            }
            other => panic!("expected Dispatch, got {other:?}"),
        }
    }

    #[test]
    fn neg_preserves_int_vs_real() {
        let mut heap = Heap::new();
        assert!(matches!(apply_unary(OpCode::Neg, &mut heap, Value::Int(5)).unwrap(), Value::Int(-5)));
        assert!(matches!(apply_unary(OpCode::Neg, &mut heap, Value::Real(5.0)).unwrap(), Value::Real(r) if r == -5.0));
    }

    #[test]
    fn not_negates_truthiness() {
        let mut heap = Heap::new();
        assert!(matches!(apply_unary(OpCode::Not, &mut heap, Value::Int(0)).unwrap(), Value::Bool(true)));
        assert!(matches!(apply_unary(OpCode::Not, &mut heap, Value::Int(1)).unwrap(), Value::Bool(false)));
    }

    #[test]
    fn bitwise_ops_reject_reals_instead_of_truncating() {
        let mut heap = Heap::new();
        let err = apply_binary(OpCode::BitAnd, &mut heap, Value::Real(3.5), Value::Int(2)).unwrap_err();
        assert!(matches!(err, VmError::Dispatch { .. }));
        let err = apply_unary(OpCode::BitNot, &mut heap, Value::Real(1.0)).unwrap_err();
        assert!(matches!(err, VmError::Dispatch { .. }));

        let ok = apply_binary(OpCode::BitAnd, &mut heap, Value::Int(6), Value::Bool(true)).unwrap();
        assert!(matches!(ok, Value::Int(0)));
    }
}
