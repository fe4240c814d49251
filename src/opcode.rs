use strum_macros::{EnumString, EnumIter, Display};

/// Stable fixed enumeration of every instruction the interpreter can dispatch.
/// `TOTAL_OPCODES` is a sentinel used by the binary loader to reject out-of-range
/// opcode words in a `.meowb` stream.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, EnumIter, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum OpCode {
    Move,
    LoadConst,
    LoadInt,
    LoadNull,
    LoadTrue,
    LoadFalse,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    Lshift,
    Rshift,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    Neg,
    Not,
    GetGlobal,
    SetGlobal,
    GetUpvalue,
    SetUpvalue,
    Closure,
    CloseUpvalues,
    Jump,
    JumpIfFalse,
    JumpIfTrue,
    Call,
    Return,
    NewArray,
    NewHash,
    GetIndex,
    SetIndex,
    GetKeys,
    GetValues,
    NewClass,
    NewInstance,
    GetProp,
    SetProp,
    SetMethod,
    Inherit,
    GetSuper,
    ImportModule,
    Export,
    GetExport,
    GetModuleExport,
    ImportAll,
    SetupTry,
    PopTry,
    Throw,
    Halt,
    TotalOpcodes,
}

impl OpCode {
    pub fn from_u8(v: u8) -> Option<OpCode> {
        if v < OpCode::TotalOpcodes as u8 {
            // SAFETY: repr(u8) enum, value checked against the sentinel above.
            Some(unsafe { std::mem::transmute::<u8, OpCode>(v) })
        } else {
            None
        }
    }
}

/// A single decoded instruction: opcode plus a small fixed argument vector.
/// The loader fills `args` from either the textual mnemonic grammar or the
/// binary `numArgs`/`args[]` pair; the interpreter never cares which.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub op: OpCode,
    pub args: Vec<i64>,
}

impl Instruction {
    pub fn new(op: OpCode, args: Vec<i64>) -> Self {
        Self { op, args }
    }

    pub fn arg(&self, idx: usize) -> i64 {
        *self.args.get(idx).unwrap_or(&0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn from_u8_rejects_the_sentinel_and_beyond() {
        assert!(OpCode::from_u8(0).is_some());
        assert!(OpCode::from_u8(OpCode::TotalOpcodes as u8).is_none());
        assert!(OpCode::from_u8(255).is_none());
    }

    #[test]
    fn mnemonic_round_trips_through_display_and_from_str() {
        for op in [OpCode::Add, OpCode::GetUpvalue, OpCode::ImportModule, OpCode::SetupTry] {
            let mnemonic = op.to_string();
            let parsed = OpCode::from_str(&mnemonic).unwrap();
            assert_eq!(parsed as u8, op as u8);
        }
    }

    #[test]
    fn missing_args_default_to_zero() {
        let inst = Instruction::new(OpCode::Move, vec![1]);
        assert_eq!(inst.arg(0), 1);
        assert_eq!(inst.arg(1), 0);
    }
}
