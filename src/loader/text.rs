//! `.meow` textual assembler reader, per §6: `.func`/`.endfunc` blocks with
//! `.registers`/`.upvalues`/`.const`/`.upvalue` directives, labels, and
//! whitespace-separated mnemonic instructions.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use crate::error::LoadError;
use crate::heap::Heap;
use crate::objects::proto::{UpvalueDesc, UpvalueKind};
use crate::objects::Header;
use crate::opcode::{Instruction, OpCode};
use crate::value::Value;

use super::{ConstSlot, ProtoMap};

struct RawProto {
    name: String,
    num_registers: i64,
    num_upvalues: i64,
    constants: Vec<ConstSlot>,
    upvalue_descs: Vec<UpvalueDesc>,
    code: Vec<Instruction>,
    labels: HashMap<String, usize>,
    pending_jumps: Vec<(usize, usize, String)>,
}

impl RawProto {
    fn new(name: String) -> Self {
        RawProto {
            name,
            num_registers: 0,
            num_upvalues: 0,
            constants: Vec::new(),
            upvalue_descs: Vec::new(),
            code: Vec::new(),
            labels: HashMap::new(),
            pending_jumps: Vec::new(),
        }
    }
}

pub fn parse_file(path: &Path, heap: &mut Heap) -> Result<ProtoMap, LoadError> {
    let source_name = path.to_string_lossy().to_string();
    let text = std::fs::read_to_string(path).map_err(|e| LoadError::Io { path: source_name.clone(), source: e })?;
    parse_source(&text, &source_name, heap)
}

fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let bytes = line.as_bytes();
    let mut comment_at = None;
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'"' && (i == 0 || bytes[i - 1] != b'\\') {
            in_string = !in_string;
        }
        if b == b'#' && !in_string {
            comment_at = Some(i);
            break;
        }
    }
    comment_at.map(|i| &line[..i]).unwrap_or(line).trim()
}

fn parse_source(source: &str, source_name: &str, heap: &mut Heap) -> Result<ProtoMap, LoadError> {
    let mut protos: HashMap<String, RawProto> = HashMap::new();
    let mut current: Option<RawProto> = None;

    for (idx, raw_line) in source.lines().enumerate() {
        let lineno = idx + 1;
        let line = strip_comment(raw_line);
        if line.is_empty() {
            continue;
        }
        parse_line(line, source_name, lineno, &mut current, &mut protos, heap)?;
    }

    if current.is_some() {
        return Err(LoadError::Syntax {
            source_name: source_name.to_string(),
            line: source.lines().count(),
            message: "file ended but missed '.endfunc'".to_string(),
        });
    }

    resolve_labels(&mut protos, source_name)?;
    link(protos, heap)
}

fn parse_line(
    line: &str,
    source_name: &str,
    lineno: usize,
    current: &mut Option<RawProto>,
    protos: &mut HashMap<String, RawProto>,
    heap: &mut Heap,
) -> Result<(), LoadError> {
    if line.ends_with(':') {
        let label = &line[..line.len() - 1];
        let proto = current.as_mut().ok_or_else(|| syntax(source_name, lineno, "label must be inside a .func block"))?;
        if proto.labels.contains_key(label) {
            return Err(syntax(source_name, lineno, format!("label '{label}' already defined")));
        }
        proto.labels.insert(label.to_string(), proto.code.len());
        return Ok(());
    }

    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.is_empty() {
        return Ok(());
    }

    if parts[0].starts_with('.') {
        return parse_directive(&parts, source_name, lineno, current, protos, heap);
    }

    let proto = current.as_mut().ok_or_else(|| syntax(source_name, lineno, "instruction must be inside a .func block"))?;
    let upper = parts[0].to_ascii_uppercase();
    let op = OpCode::from_str(&upper).map_err(|_| syntax(source_name, lineno, format!("invalid opcode '{}'", parts[0])))?;

    let inst_index = proto.code.len();
    let mut args = Vec::new();
    match op {
        OpCode::Jump | OpCode::SetupTry => {
            if parts.len() < 2 {
                return Err(syntax(source_name, lineno, format!("'{}' needs a label or index", parts[0])));
            }
            if let Ok(n) = parts[1].parse::<i64>() {
                args.push(n);
            } else {
                proto.pending_jumps.push((inst_index, 0, parts[1].to_string()));
                args.push(0);
            }
            for p in &parts[2..] {
                args.push(p.parse::<i64>().map_err(|_| syntax(source_name, lineno, format!("invalid argument '{p}'")))?);
            }
        }
        OpCode::JumpIfFalse | OpCode::JumpIfTrue => {
            if parts.len() < 3 {
                return Err(syntax(source_name, lineno, format!("'{}' needs a register and a label/index", parts[0])));
            }
            args.push(parts[1].parse::<i64>().map_err(|_| syntax(source_name, lineno, format!("invalid register '{}'", parts[1])))?);
            if let Ok(n) = parts[2].parse::<i64>() {
                args.push(n);
            } else {
                proto.pending_jumps.push((inst_index, 1, parts[2].to_string()));
                args.push(0);
            }
        }
        _ => {
            for p in &parts[1..] {
                args.push(p.parse::<i64>().map_err(|_| syntax(source_name, lineno, format!("invalid argument '{p}' for '{}'", parts[0])))?);
            }
        }
    }
    proto.code.push(Instruction::new(op, args));
    Ok(())
}

fn parse_directive(
    parts: &[&str],
    source_name: &str,
    lineno: usize,
    current: &mut Option<RawProto>,
    protos: &mut HashMap<String, RawProto>,
    heap: &mut Heap,
) -> Result<(), LoadError> {
    let cmd = parts[0];
    if cmd == ".func" {
        if current.is_some() {
            return Err(syntax(source_name, lineno, "cannot start a new .func inside another .func"));
        }
        let name = parts.get(1).ok_or_else(|| syntax(source_name, lineno, ".func requires a function name"))?;
        *current = Some(RawProto::new(name.to_string()));
        return Ok(());
    }
    if cmd == ".endfunc" {
        let proto = current.take().ok_or_else(|| syntax(source_name, lineno, "no matching .func for .endfunc"))?;
        protos.insert(proto.name.clone(), proto);
        return Ok(());
    }

    let proto = current.as_mut().ok_or_else(|| syntax(source_name, lineno, format!("'{cmd}' directive must be inside a .func block")))?;
    match cmd {
        ".registers" => {
            let n = parts.get(1).ok_or_else(|| syntax(source_name, lineno, ".registers needs 1 argument"))?;
            proto.num_registers = n.parse().map_err(|_| syntax(source_name, lineno, "invalid .registers value"))?;
        }
        ".upvalues" => {
            let n = parts.get(1).ok_or_else(|| syntax(source_name, lineno, ".upvalues needs 1 argument"))?;
            proto.num_upvalues = n.parse().map_err(|_| syntax(source_name, lineno, "invalid .upvalues value"))?;
        }
        ".const" => {
            if parts.len() < 2 {
                return Err(syntax(source_name, lineno, ".const is missing its argument"));
            }
            let rest = parts[1..].join(" ");
            proto.constants.push(parse_const(&rest, source_name, lineno, heap)?);
        }
        ".upvalue" => {
            if parts.len() < 4 {
                return Err(syntax(source_name, lineno, ".upvalue requires 3 arguments"));
            }
            let idx: usize = parts[1].parse().map_err(|_| syntax(source_name, lineno, "invalid upvalue index"))?;
            let kind = match parts[2] {
                "local" => UpvalueKind::Local,
                "parent_upvalue" => UpvalueKind::ParentUpvalue,
                other => return Err(syntax(source_name, lineno, format!("invalid upvalue type '{other}'"))),
            };
            let slot: usize = parts[3].parse().map_err(|_| syntax(source_name, lineno, "invalid upvalue slot"))?;
            if proto.upvalue_descs.len() <= idx {
                proto.upvalue_descs.resize(idx + 1, UpvalueDesc { kind: UpvalueKind::Local, index: 0 });
            }
            proto.upvalue_descs[idx] = UpvalueDesc { kind, index: slot };
        }
        other => return Err(LoadError::UnknownDirective { source_name: source_name.to_string(), directive: other.to_string() }),
    }
    Ok(())
}

fn parse_const(token: &str, source_name: &str, lineno: usize, heap: &mut Heap) -> Result<ConstSlot, LoadError> {
    let s = token.trim();
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        let inner = &s[1..s.len() - 1];
        return Ok(ConstSlot::Value(Value::object(heap.alloc_string(&unescape(inner)))));
    }
    if let Some(name) = s.strip_prefix('@') {
        return Ok(ConstSlot::ProtoRef(name.to_string()));
    }
    if s.contains('.') {
        if let Ok(f) = s.parse::<f64>() {
            return Ok(ConstSlot::Value(Value::Real(f)));
        }
    }
    if let Ok(i) = s.parse::<i64>() {
        return Ok(ConstSlot::Value(Value::Int(i)));
    }
    match s {
        "true" => Ok(ConstSlot::Value(Value::Bool(true))),
        "false" => Ok(ConstSlot::Value(Value::Bool(false))),
        "null" => Ok(ConstSlot::Value(Value::Null)),
        _ => Err(syntax(source_name, lineno, format!("invalid constant literal '{s}'"))),
    }
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn syntax(source_name: &str, line: usize, message: impl Into<String>) -> LoadError {
    LoadError::Syntax { source_name: source_name.to_string(), line, message: message.into() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::OpCode;

    fn parse(src: &str) -> Result<ProtoMap, LoadError> {
        let mut heap = Heap::new();
        parse_source(src, "<test>", &mut heap)
    }

    #[test]
    fn registers_upvalues_and_code_land_on_the_proto() {
        let protos = parse(
            ".func @main\n.registers 2\n.upvalues 0\n.const 1\n.const \"hi\"\nLOAD_CONST 0 0\nRETURN 0\n.endfunc\n",
        )
        .unwrap();
        let ptr = protos["@main"];
        unsafe {
            let p = Header::as_proto(ptr).unwrap();
            assert_eq!((*p).num_registers, 2);
            assert_eq!((*p).code.len(), 2);
            assert_eq!((*p).code[0].op, OpCode::LoadConst);
            assert!(matches!((*p).constants[0], Value::Int(1)));
            assert_eq!((*p).constants[1].as_str(), Some("hi"));
        }
    }

    #[test]
    fn label_used_before_its_definition_resolves_to_the_right_offset() {
        let protos = parse(".func @main\n.registers 1\nJUMP done\nLOAD_INT 0 1\ndone:\nRETURN 0\n.endfunc\n").unwrap();
        let ptr = protos["@main"];
        unsafe {
            let p = Header::as_proto(ptr).unwrap();
            // JUMP, LOAD_INT, RETURN: `done` names the RETURN at index 2.
            assert_eq!((*p).code[0].args[0], 2);
        }
    }

    #[test]
    fn unknown_label_is_a_load_error() {
        let err = parse(".func @main\n.registers 1\nJUMP nowhere\n.endfunc\n").unwrap_err();
        assert!(matches!(err, LoadError::UnresolvedLabel { .. }));
    }

    #[test]
    fn proto_ref_constant_forward_references_a_later_func() {
        let protos = parse(
            ".func @main\n.registers 1\n.const @helper\nLOAD_CONST 0 0\nRETURN 0\n.endfunc\n.func helper\n.registers 1\nRETURN 0\n.endfunc\n",
        )
        .unwrap();
        let main = protos["@main"];
        let helper = protos["helper"];
        unsafe {
            let p = Header::as_proto(main).unwrap();
            match (*p).constants[0] {
                Value::Object(obj) => assert_eq!(obj, helper),
                other => panic!("expected a proto-ref constant, got {other:?}"),
            }
        }
    }

    #[test]
    fn escapes_and_comments_are_handled_in_const_strings() {
        let protos = parse(".func @main\n.registers 1\n.const \"a\\nb\" # trailing comment\nRETURN 0\n.endfunc\n").unwrap();
        let ptr = protos["@main"];
        unsafe {
            let p = Header::as_proto(ptr).unwrap();
            assert_eq!((*p).constants[0].as_str(), Some("a\nb"));
        }
    }

    #[test]
    fn missing_endfunc_is_a_syntax_error() {
        let err = parse(".func @main\n.registers 1\nRETURN 0\n").unwrap_err();
        assert!(matches!(err, LoadError::Syntax { .. }));
    }

    #[test]
    fn unknown_directive_is_rejected() {
        let err = parse(".func @main\n.bogus 1\n.endfunc\n").unwrap_err();
        assert!(matches!(err, LoadError::UnknownDirective { .. }));
    }
}

fn resolve_labels(protos: &mut HashMap<String, RawProto>, source_name: &str) -> Result<(), LoadError> {
    for proto in protos.values_mut() {
        for (inst_idx, arg_idx, label) in proto.pending_jumps.drain(..) {
            let target = *proto.labels.get(&label).ok_or_else(|| LoadError::UnresolvedLabel {
                source_name: source_name.to_string(),
                func: proto.name.clone(),
                label: label.clone(),
            })?;
            proto.code[inst_idx].args[arg_idx] = target as i64;
        }
    }
    Ok(())
}

fn link(protos: HashMap<String, RawProto>, heap: &mut Heap) -> Result<ProtoMap, LoadError> {
    let mut ptrs: ProtoMap = ProtoMap::new();
    for (name, _) in &protos {
        let ptr = heap.alloc_proto(name.clone(), name.clone());
        ptrs.insert(name.clone(), ptr);
    }

    for (name, raw) in protos {
        let ptr = ptrs[&name];
        let constants: Vec<Value> = raw
            .constants
            .into_iter()
            .map(|slot| match slot {
                ConstSlot::Value(v) => Ok(v),
                ConstSlot::ProtoRef(target) => ptrs.get(&target).map(|&p| Value::object(p)).ok_or_else(|| LoadError::UnresolvedLabel {
                    source_name: name.clone(),
                    func: name.clone(),
                    label: target.clone(),
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
            (*p).labels = raw.labels;
        }
    }

    Ok(ptrs)
}
