//! `.meowb` reader, per §6: little-endian `int64`-framed proto table.

use std::io::Read as _;
use std::path::Path;

use crate::error::LoadError;
use crate::heap::Heap;
use crate::objects::proto::{UpvalueDesc, UpvalueKind};
use crate::objects::Header;
use crate::opcode::{Instruction, OpCode};
use crate::value::Value;

use super::{ConstSlot, ProtoMap};

struct RawProto {
    source_name: String,
    num_registers: i64,
    num_upvalues: i64,
    constants: Vec<ConstSlot>,
    upvalue_descs: Vec<UpvalueDesc>,
    code: Vec<Instruction>,
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    source_name: String,
}

impl<'a> Reader<'a> {
    fn err(&self, what: impl Into<String>) -> LoadError {
        LoadError::Binary { source_name: self.source_name.clone(), what: what.into() }
    }

    fn read_i64(&mut self) -> Result<i64, LoadError> {
        if self.pos + 8 > self.bytes.len() {
            return Err(self.err("unexpected end of file reading int64"));
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.bytes[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(i64::from_le_bytes(buf))
    }

    fn read_f64(&mut self) -> Result<f64, LoadError> {
        Ok(f64::from_bits(self.read_i64()? as u64))
    }

    fn read_bool(&mut self) -> Result<bool, LoadError> {
        Ok(self.read_i64()? != 0)
    }

    fn read_string(&mut self) -> Result<String, LoadError> {
        let len = self.read_i64()?;
        if len < 0 {
            return Err(self.err("negative string length"));
        }
        let len = len as usize;
        if self.pos + len > self.bytes.len() {
            return Err(self.err("unexpected end of file reading string"));
        }
        let s = String::from_utf8_lossy(&self.bytes[self.pos..self.pos + len]).into_owned();
        self.pos += len;
        Ok(s)
    }
}

pub fn parse_file(path: &Path, heap: &mut Heap) -> Result<ProtoMap, LoadError> {
    let source_name = path.to_string_lossy().to_string();
    let mut file = std::fs::File::open(path).map_err(|e| LoadError::Io { path: source_name.clone(), source: e })?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).map_err(|e| LoadError::Io { path: source_name.clone(), source: e })?;

    let mut r = Reader { bytes: &bytes, pos: 0, source_name: source_name.clone() };
    let num_protos = r.read_i64()?;
    if num_protos < 0 {
        return Err(r.err("negative prototype count"));
    }

    let mut raws: Vec<RawProto> = Vec::with_capacity(num_protos as usize);
    for _ in 0..num_protos {
        let name = r.read_string()?;
        raws.push(parse_proto(&mut r, name, heap)?);
    }

    link(raws, heap, &source_name)
}

fn parse_proto(r: &mut Reader, source_name: String, heap: &mut Heap) -> Result<RawProto, LoadError> {
    let num_registers = r.read_i64()?;
    let num_upvalues = r.read_i64()?;

    let num_constants = r.read_i64()?;
    let mut constants = Vec::with_capacity(num_constants.max(0) as usize);
    for _ in 0..num_constants {
        let kind = r.read_i64()?;
        let slot = match kind {
            0 => ConstSlot::Value(Value::Null),
            1 => ConstSlot::Value(Value::Int(r.read_i64()?)),
            2 => ConstSlot::Value(Value::Real(r.read_f64()?)),
            3 => ConstSlot::Value(Value::Bool(r.read_bool()?)),
            4 => {
                let s = r.read_string()?;
                ConstSlot::Value(Value::object(heap.alloc_string(&s)))
            }
            5 => ConstSlot::ProtoRef(r.read_string()?),
            other => return Err(r.err(format!("invalid constant type {other}"))),
        };
        constants.push(slot);
    }

    let num_upvalue_descs = r.read_i64()?;
    let mut upvalue_descs = Vec::with_capacity(num_upvalue_descs.max(0) as usize);
    for _ in 0..num_upvalue_descs {
        let is_local = r.read_bool()?;
        let index = r.read_i64()?;
        upvalue_descs.push(UpvalueDesc {
            kind: if is_local { UpvalueKind::Local } else { UpvalueKind::ParentUpvalue },
            index: index as usize,
        });
    }

    let num_instructions = r.read_i64()?;
    let mut code = Vec::with_capacity(num_instructions.max(0) as usize);
    for _ in 0..num_instructions {
        let opcode = r.read_i64()?;
        let op = OpCode::from_u8(opcode as u8).ok_or_else(|| r.err(format!("out of range opcode {opcode}")))?;
        let num_args = r.read_i64()?;
        let mut args = Vec::with_capacity(num_args.max(0) as usize);
        for _ in 0..num_args {
            args.push(r.read_i64()?);
        }
        code.push(Instruction::new(op, args));
    }

    Ok(RawProto { source_name, num_registers, num_upvalues, constants, upvalue_descs, code })
}

fn link(raws: Vec<RawProto>, heap: &mut Heap, source_name: &str) -> Result<ProtoMap, LoadError> {
    let mut ptrs: ProtoMap = ProtoMap::new();
    for raw in &raws {
        let ptr = heap.alloc_proto(raw.source_name.clone(), raw.source_name.clone());
        ptrs.insert(raw.source_name.clone(), ptr);
    }

    for raw in raws {
        let ptr = ptrs[&raw.source_name];
        let constants: Vec<Value> = raw
            .constants
            .into_iter()
            .map(|slot| match slot {
                ConstSlot::Value(v) => Ok(v),
                ConstSlot::ProtoRef(name) => ptrs
                    .get(&name)
                    .map(|&p| Value::object(p))
                    .ok_or_else(|| LoadError::UnresolvedLabel {
                        source_name: source_name.to_string(),
                        func: raw.source_name.clone(),
                        label: name.clone(),
                    }),
            })
            .collect::<Result<_, _>>()?;

        unsafe {
            let p = Header::as_proto(ptr).unwrap();
            (*p).num_registers = raw.num_registers as usize;
            (*p).num_upvalues = raw.num_upvalues as usize;
            (*p).constants = constants;
            (*p).upvalue_descs = raw.upvalue_descs;
            (*p).code = raw.code;
        }
    }

    Ok(ptrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::OpCode;

    struct Writer(Vec<u8>);

    impl Writer {
        fn new() -> Self {
            Writer(Vec::new())
        }
        fn i64(&mut self, v: i64) -> &mut Self {
            self.0.extend_from_slice(&v.to_le_bytes());
            self
        }
        fn f64(&mut self, v: f64) -> &mut Self {
            self.0.extend_from_slice(&v.to_bits().to_le_bytes());
            self
        }
        fn bool(&mut self, v: bool) -> &mut Self {
            self.i64(if v { 1 } else { 0 })
        }
        fn string(&mut self, s: &str) -> &mut Self {
            self.i64(s.len() as i64);
            self.0.extend_from_slice(s.as_bytes());
            self
        }
    }

    fn parse(bytes: &[u8]) -> Result<ProtoMap, LoadError> {
        let mut heap = Heap::new();
        let mut r = Reader { bytes, pos: 0, source_name: "<test>".to_string() };
        let num_protos = r.read_i64()?;
        let mut raws = Vec::with_capacity(num_protos as usize);
        for _ in 0..num_protos {
            let name = r.read_string()?;
            raws.push(parse_proto(&mut r, name, &mut heap)?);
        }
        link(raws, &mut heap, "<test>")
    }

    #[test]
    fn round_trips_every_constant_type_tag() {
        let mut w = Writer::new();
        w.i64(1); // one proto
        w.string("main");
        w.i64(1); // num_registers
        w.i64(0); // num_upvalues
        w.i64(6); // num_constants
        w.i64(0); // null
        w.i64(1).i64(42); // int
        w.i64(2).f64(1.5); // real
        w.i64(3).bool(true); // bool
        w.i64(4).string("hi"); // string
        w.i64(5).string("main"); // proto-ref to itself
        w.i64(0); // num_upvalue_descs
        w.i64(0); // num_instructions

        let protos = parse(&w.0).unwrap();
        let ptr = protos["main"];
        unsafe {
            let p = Header::as_proto(ptr).unwrap();
            assert!(matches!((*p).constants[0], Value::Null));
            assert!(matches!((*p).constants[1], Value::Int(42)));
            assert!(matches!((*p).constants[2], Value::Real(r) if r == 1.5));
            assert!(matches!((*p).constants[3], Value::Bool(true)));
            assert_eq!((*p).constants[4].as_str(), Some("hi"));
            assert_eq!((*p).constants[5].as_object_ptr(), Some(ptr));
        }
    }

    #[test]
    fn upvalue_descs_and_instructions_decode() {
        let mut w = Writer::new();
        w.i64(1);
        w.string("f");
        w.i64(2); // num_registers
        w.i64(1); // num_upvalues
        w.i64(0); // num_constants
        w.i64(1); // num_upvalue_descs
        w.bool(true).i64(3); // local, slot 3
        w.i64(1); // num_instructions
        w.i64(OpCode::Return as i64).i64(1).i64(0);

        let protos = parse(&w.0).unwrap();
        let ptr = protos["f"];
        unsafe {
            let p = Header::as_proto(ptr).unwrap();
            assert_eq!((*p).upvalue_descs.len(), 1);
            assert_eq!((*p).upvalue_descs[0].kind, UpvalueKind::Local);
            assert_eq!((*p).upvalue_descs[0].index, 3);
            assert_eq!((*p).code[0].op, OpCode::Return);
            assert_eq!((*p).code[0].args, vec![0]);
        }
    }

    #[test]
    fn truncated_file_is_an_io_style_binary_error() {
        let mut w = Writer::new();
        w.i64(1).string("main").i64(1); // cut off mid-header
        let err = parse(&w.0).unwrap_err();
        assert!(matches!(err, LoadError::Binary { .. }));
    }

    #[test]
    fn out_of_range_opcode_is_rejected() {
        let mut w = Writer::new();
        w.i64(1);
        w.string("f");
        w.i64(1).i64(0).i64(0).i64(0); // registers, upvalues, constants, upvalue_descs
        w.i64(1); // num_instructions
        w.i64(200).i64(0); // bogus opcode byte
        let err = parse(&w.0).unwrap_err();
        assert!(matches!(err, LoadError::Binary { .. }));
    }
}
