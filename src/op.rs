//! Static opcode descriptors: classification, edge counts, operand kinds.
//!
//! The order below matches the source's `IR_OPS` X-macro table: foldable
//! ops first (so `op as u8 <= Opcode::Copy as u8` tests "is this
//! instruction foldable"), constants immediately after `Nop` so `CONST`
//! can be the single most common check, and the comparison operators
//! grouped so the equality/ordering inversions used by the folder
//! (`EQ<->NE`, `LT<->GT`, `LE<->GE`) are adjacent.

use std::fmt;

use crate::types::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Opcode {
    Nop,

    // constants, one per type, in `Type` order (skipping Void)
    ConstBool,
    ConstU8,
    ConstU16,
    ConstU32,
    ConstU64,
    ConstAddr,
    ConstChar,
    ConstI8,
    ConstI16,
    ConstI32,
    ConstI64,
    ConstDouble,
    ConstFloat,

    // equality
    Eq,
    Ne,

    // ordering (signed then unsigned, LT/GE/LE/GT groups of 4)
    Lt,
    Ge,
    Le,
    Gt,
    Ult,
    Uge,
    Ule,
    Ugt,

    // arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
    Abs,
    Min,
    Max,

    // casts
    Sext,
    Zext,
    Trunc,
    Bitcast,
    Int2Fp,
    Fp2Int,
    Fp2Fp,

    // overflow-checked arithmetic
    AddOv,
    SubOv,
    MulOv,
    Overflow,

    // bitwise
    Not,
    Or,
    And,
    Xor,
    Shl,
    Shr,
    Sar,

    // branchless select
    Cond,

    // data-flow / misc (Copy is the folding boundary: IR_LAST_FOLDABLE)
    Phi,
    Copy,

    // leaves
    Param,
    Var,
    Func,
    Str,

    // calls
    Call,
    TailCall,

    // memory
    Load,
    Store,
    Vload,
    Vstore,
    Rload,
    Rstore,
    Alloca,
    Tls,

    // control flow
    Start,
    Return,
    Unreachable,
    Begin,
    End,
    If,
    IfTrue,
    IfFalse,
    Switch,
    CaseVal,
    CaseDefault,
    Merge,
    LoopBegin,
    LoopEnd,
    LoopExit,
    GuardTrue,
    GuardFalse,
    Ijmp,
    Trap,
    Snapshot,
}

pub const OP_COUNT: usize = Opcode::Snapshot as usize + 1;

/// The last opcode eligible for local value numbering / rule folding.
pub const LAST_FOLDABLE: Opcode = Opcode::Copy;

impl Opcode {
    #[inline]
    pub fn is_const(self) -> bool {
        (Opcode::ConstBool as u8..=Opcode::ConstFloat as u8).contains(&(self as u8))
    }

    #[inline]
    pub fn is_foldable(self) -> bool {
        (self as u8) <= (LAST_FOLDABLE as u8)
    }

    /// Maps a `ConstXxx` opcode to the `Type` it produces.
    pub fn const_type(self) -> Option<Type> {
        if !self.is_const() {
            return None;
        }
        let idx = self as u8 - Opcode::ConstBool as u8;
        Some(Type::ALL[idx as usize + Type::Bool as usize])
    }

    /// Inverse of [`Opcode::const_type`]: the `ConstXxx` opcode for a type.
    pub fn const_for_type(ty: Type) -> Opcode {
        let idx = ty as u8 - Type::Bool as u8;
        let raw = Opcode::ConstBool as u8 + idx;
        // SAFETY-free: constructed only from indices within the Const* run.
        OP_TABLE[raw as usize].op
    }

    pub fn desc(self) -> &'static OpDesc {
        &OP_TABLE[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.desc().name
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Data/control/memory classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    Data,
    Control,
    MemLoad,
    MemStore,
    MemCall,
    MemAlloc,
}

/// How many input (def-use) edges an instruction has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeArity {
    Fixed(u8),
    /// count given by `inputs_count` on the node itself (MERGE, CALL, SWITCH)
    Variadic,
    /// count given by the number of predecessors of the controlling region (PHI)
    PhiLike,
}

/// Role of a single operand slot, matching the source's `IR_OPND_*` kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    Unused,
    Data,
    Control,
    ControlDep,
    ControlRef,
    Var,
    Str,
    Num,
    Prob,
}

pub struct OpDesc {
    pub op: Opcode,
    pub name: &'static str,
    pub class: OpClass,
    pub edges: EdgeArity,
    pub operands: [OperandKind; 3],
    pub commutative: bool,
    pub bb_start: bool,
    pub bb_end: bool,
    pub terminator: bool,
}

macro_rules! d {
    ($op:expr, $name:expr, $edges:expr, $o1:expr, $o2:expr, $o3:expr) => {
        OpDesc {
            op: $op,
            name: $name,
            class: OpClass::Data,
            edges: $edges,
            operands: [$o1, $o2, $o3],
            commutative: false,
            bb_start: false,
            bb_end: false,
            terminator: false,
        }
    };
}

macro_rules! c {
    ($op:expr, $name:expr, $edges:expr, $o1:expr, $o2:expr, $o3:expr) => {
        OpDesc {
            op: $op,
            name: $name,
            class: OpClass::Control,
            edges: $edges,
            operands: [$o1, $o2, $o3],
            commutative: false,
            bb_start: false,
            bb_end: false,
            terminator: false,
        }
    };
}

use OperandKind::*;

/// Static, program-lifetime opcode metadata, one row per `Opcode` variant,
/// indexed by discriminant. Commutative/bb-start/bb-end/terminator flags
/// and memory subkind are patched in by [`build_table`] rather than spelled
/// out per-macro-call, since only a handful of ops set each one.
fn build_table() -> [OpDesc; OP_COUNT] {
    let mut t: Vec<OpDesc> = vec![
        c!(Opcode::Nop, "NOP", EdgeArity::Fixed(0), Unused, Unused, Unused),
        d!(Opcode::ConstBool, "C_BOOL", EdgeArity::Fixed(0), Unused, Unused, Unused),
        d!(Opcode::ConstU8, "C_U8", EdgeArity::Fixed(0), Unused, Unused, Unused),
        d!(Opcode::ConstU16, "C_U16", EdgeArity::Fixed(0), Unused, Unused, Unused),
        d!(Opcode::ConstU32, "C_U32", EdgeArity::Fixed(0), Unused, Unused, Unused),
        d!(Opcode::ConstU64, "C_U64", EdgeArity::Fixed(0), Unused, Unused, Unused),
        d!(Opcode::ConstAddr, "C_ADDR", EdgeArity::Fixed(0), Unused, Unused, Unused),
        d!(Opcode::ConstChar, "C_CHAR", EdgeArity::Fixed(0), Unused, Unused, Unused),
        d!(Opcode::ConstI8, "C_I8", EdgeArity::Fixed(0), Unused, Unused, Unused),
        d!(Opcode::ConstI16, "C_I16", EdgeArity::Fixed(0), Unused, Unused, Unused),
        d!(Opcode::ConstI32, "C_I32", EdgeArity::Fixed(0), Unused, Unused, Unused),
        d!(Opcode::ConstI64, "C_I64", EdgeArity::Fixed(0), Unused, Unused, Unused),
        d!(Opcode::ConstDouble, "C_DOUBLE", EdgeArity::Fixed(0), Unused, Unused, Unused),
        d!(Opcode::ConstFloat, "C_FLOAT", EdgeArity::Fixed(0), Unused, Unused, Unused),
        d!(Opcode::Eq, "EQ", EdgeArity::Fixed(2), Data, Data, Unused),
        d!(Opcode::Ne, "NE", EdgeArity::Fixed(2), Data, Data, Unused),
        d!(Opcode::Lt, "LT", EdgeArity::Fixed(2), Data, Data, Unused),
        d!(Opcode::Ge, "GE", EdgeArity::Fixed(2), Data, Data, Unused),
        d!(Opcode::Le, "LE", EdgeArity::Fixed(2), Data, Data, Unused),
        d!(Opcode::Gt, "GT", EdgeArity::Fixed(2), Data, Data, Unused),
        d!(Opcode::Ult, "ULT", EdgeArity::Fixed(2), Data, Data, Unused),
        d!(Opcode::Uge, "UGE", EdgeArity::Fixed(2), Data, Data, Unused),
        d!(Opcode::Ule, "ULE", EdgeArity::Fixed(2), Data, Data, Unused),
        d!(Opcode::Ugt, "UGT", EdgeArity::Fixed(2), Data, Data, Unused),
        d!(Opcode::Add, "ADD", EdgeArity::Fixed(2), Data, Data, Unused),
        d!(Opcode::Sub, "SUB", EdgeArity::Fixed(2), Data, Data, Unused),
        d!(Opcode::Mul, "MUL", EdgeArity::Fixed(2), Data, Data, Unused),
        d!(Opcode::Div, "DIV", EdgeArity::Fixed(2), Data, Data, Unused),
        d!(Opcode::Mod, "MOD", EdgeArity::Fixed(2), Data, Data, Unused),
        d!(Opcode::Neg, "NEG", EdgeArity::Fixed(1), Data, Unused, Unused),
        d!(Opcode::Abs, "ABS", EdgeArity::Fixed(1), Data, Unused, Unused),
        d!(Opcode::Min, "MIN", EdgeArity::Fixed(2), Data, Data, Unused),
        d!(Opcode::Max, "MAX", EdgeArity::Fixed(2), Data, Data, Unused),
        d!(Opcode::Sext, "SEXT", EdgeArity::Fixed(1), Data, Unused, Unused),
        d!(Opcode::Zext, "ZEXT", EdgeArity::Fixed(1), Data, Unused, Unused),
        d!(Opcode::Trunc, "TRUNC", EdgeArity::Fixed(1), Data, Unused, Unused),
        d!(Opcode::Bitcast, "BITCAST", EdgeArity::Fixed(1), Data, Unused, Unused),
        d!(Opcode::Int2Fp, "INT2FP", EdgeArity::Fixed(1), Data, Unused, Unused),
        d!(Opcode::Fp2Int, "FP2INT", EdgeArity::Fixed(1), Data, Unused, Unused),
        d!(Opcode::Fp2Fp, "FP2FP", EdgeArity::Fixed(1), Data, Unused, Unused),
        d!(Opcode::AddOv, "ADD_OV", EdgeArity::Fixed(2), Data, Data, Unused),
        d!(Opcode::SubOv, "SUB_OV", EdgeArity::Fixed(2), Data, Data, Unused),
        d!(Opcode::MulOv, "MUL_OV", EdgeArity::Fixed(2), Data, Data, Unused),
        d!(Opcode::Overflow, "OVERFLOW", EdgeArity::Fixed(1), Data, Unused, Unused),
        d!(Opcode::Not, "NOT", EdgeArity::Fixed(1), Data, Unused, Unused),
        d!(Opcode::Or, "OR", EdgeArity::Fixed(2), Data, Data, Unused),
        d!(Opcode::And, "AND", EdgeArity::Fixed(2), Data, Data, Unused),
        d!(Opcode::Xor, "XOR", EdgeArity::Fixed(2), Data, Data, Unused),
        d!(Opcode::Shl, "SHL", EdgeArity::Fixed(2), Data, Data, Unused),
        d!(Opcode::Shr, "SHR", EdgeArity::Fixed(2), Data, Data, Unused),
        d!(Opcode::Sar, "SAR", EdgeArity::Fixed(2), Data, Data, Unused),
        d!(Opcode::Cond, "COND", EdgeArity::Fixed(3), Data, Data, Data),
        d!(Opcode::Phi, "PHI", EdgeArity::PhiLike, ControlDep, Data, Data),
        d!(Opcode::Copy, "COPY", EdgeArity::Fixed(1), Data, Unused, Unused),
        d!(Opcode::Param, "PARAM", EdgeArity::Fixed(0), ControlDep, Str, Num),
        d!(Opcode::Var, "VAR", EdgeArity::Fixed(0), ControlDep, Str, Unused),
        d!(Opcode::Func, "FUNC", EdgeArity::Fixed(0), Unused, Unused, Unused),
        d!(Opcode::Str, "STR", EdgeArity::Fixed(0), Unused, Unused, Unused),
        { let mut o = d!(Opcode::Call, "CALL", EdgeArity::Variadic, ControlRef, Data, Data); o.class = OpClass::MemCall; o },
        { let mut o = d!(Opcode::TailCall, "TAILCALL", EdgeArity::Variadic, ControlRef, Data, Data); o.class = OpClass::MemCall; o.terminator = true; o },
        { let mut o = d!(Opcode::Load, "LOAD", EdgeArity::Fixed(2), ControlRef, Data, Unused); o.class = OpClass::MemLoad; o },
        { let mut o = d!(Opcode::Store, "STORE", EdgeArity::Fixed(3), ControlRef, Data, Data); o.class = OpClass::MemStore; o },
        { let mut o = d!(Opcode::Vload, "VLOAD", EdgeArity::Fixed(2), ControlRef, Data, Unused); o.class = OpClass::MemLoad; o },
        { let mut o = d!(Opcode::Vstore, "VSTORE", EdgeArity::Fixed(3), ControlRef, Data, Data); o.class = OpClass::MemStore; o },
        { let mut o = d!(Opcode::Rload, "RLOAD", EdgeArity::Fixed(2), ControlRef, Num, Unused); o.class = OpClass::MemLoad; o },
        { let mut o = d!(Opcode::Rstore, "RSTORE", EdgeArity::Fixed(3), ControlRef, Num, Data); o.class = OpClass::MemStore; o },
        { let mut o = d!(Opcode::Alloca, "ALLOCA", EdgeArity::Fixed(1), ControlRef, Data, Unused); o.class = OpClass::MemAlloc; o },
        { let mut o = d!(Opcode::Tls, "TLS", EdgeArity::Fixed(1), ControlRef, Num, Unused); o.class = OpClass::MemLoad; o },
        { let mut o = c!(Opcode::Start, "START", EdgeArity::Fixed(0), Unused, Unused, Unused); o.bb_start = true; o },
        { let mut o = c!(Opcode::Return, "RETURN", EdgeArity::Fixed(2), Control, Data, ControlRef); o.bb_end = true; o.terminator = true; o },
        { let mut o = c!(Opcode::Unreachable, "UNREACHABLE", EdgeArity::Fixed(2), Control, Data, ControlRef); o.bb_end = true; o.terminator = true; o },
        { let mut o = c!(Opcode::Begin, "BEGIN", EdgeArity::Fixed(1), Control, Unused, Unused); o.bb_start = true; o },
        { let mut o = c!(Opcode::End, "END", EdgeArity::Fixed(1), Control, Unused, Unused); o.bb_end = true; o },
        { let mut o = c!(Opcode::If, "IF", EdgeArity::Fixed(2), Control, Data, Unused); o.bb_end = true; o },
        { let mut o = c!(Opcode::IfTrue, "IF_TRUE", EdgeArity::Fixed(1), Control, Unused, Unused); o.bb_start = true; o },
        { let mut o = c!(Opcode::IfFalse, "IF_FALSE", EdgeArity::Fixed(1), Control, Unused, Unused); o.bb_start = true; o },
        { let mut o = c!(Opcode::Switch, "SWITCH", EdgeArity::Fixed(2), Control, Data, Unused); o.bb_end = true; o },
        { let mut o = c!(Opcode::CaseVal, "CASE_VAL", EdgeArity::Fixed(2), Control, Data, Unused); o.bb_start = true; o },
        { let mut o = c!(Opcode::CaseDefault, "CASE_DEFAULT", EdgeArity::Fixed(1), Control, Unused, Unused); o.bb_start = true; o },
        { let mut o = c!(Opcode::Merge, "MERGE", EdgeArity::Variadic, Control, Control, Control); o.bb_start = true; o },
        { let mut o = c!(Opcode::LoopBegin, "LOOP_BEGIN", EdgeArity::Fixed(2), Control, Control, Unused); o.bb_start = true; o },
        { let mut o = c!(Opcode::LoopEnd, "LOOP_END", EdgeArity::Fixed(1), Control, Unused, Unused); o.bb_end = true; o },
        { let mut o = c!(Opcode::LoopExit, "LOOP_EXIT", EdgeArity::Fixed(1), Control, Unused, Unused); o },
        { let mut o = c!(Opcode::GuardTrue, "GUARD_TRUE", EdgeArity::Fixed(2), Control, Data, Unused); o.bb_end = true; o },
        { let mut o = c!(Opcode::GuardFalse, "GUARD_FALSE", EdgeArity::Fixed(2), Control, Data, Unused); o.bb_end = true; o },
        { let mut o = c!(Opcode::Ijmp, "IJMP", EdgeArity::Fixed(2), Control, Data, Unused); o.bb_end = true; o.terminator = true; o },
        { let mut o = c!(Opcode::Trap, "TRAP", EdgeArity::Fixed(1), Control, Unused, Unused); o.bb_end = true; o.terminator = true; o },
        c!(Opcode::Snapshot, "SNAPSHOT", EdgeArity::Variadic, Control, Unused, Unused),
    ];

    for commutative in [Opcode::Add, Opcode::Mul, Opcode::And, Opcode::Or, Opcode::Xor, Opcode::Eq, Opcode::Ne, Opcode::Min, Opcode::Max] {
        t[commutative as usize].commutative = true;
    }

    t.try_into().unwrap_or_else(|_| panic!("opcode table size mismatch"))
}

// `OpDesc` contains a `&'static str` only, so building the table once into
// a leaked static slice keeps `Opcode::desc` allocation-free without
// requiring the table literal to be `const`-evaluable (the macros above
// use struct-update syntax, which isn't allowed in `const fn`).
fn op_table() -> &'static [OpDesc; OP_COUNT] {
    use std::sync::OnceLock;
    static TABLE: OnceLock<[OpDesc; OP_COUNT]> = OnceLock::new();
    TABLE.get_or_init(build_table)
}

#[allow(non_upper_case_globals)]
struct OpTableProxy;
impl std::ops::Index<usize> for OpTableProxy {
    type Output = OpDesc;
    fn index(&self, i: usize) -> &OpDesc {
        &op_table()[i]
    }
}
static OP_TABLE: OpTableProxy = OpTableProxy;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn const_type_roundtrip() {
        for ty in [Type::I32, Type::Double, Type::Bool, Type::Addr] {
            let op = Opcode::const_for_type(ty);
            assert_eq!(op.const_type(), Some(ty));
        }
    }

    #[test]
    fn foldable_boundary() {
        assert!(Opcode::Add.is_foldable());
        assert!(Opcode::Copy.is_foldable());
        assert!(!Opcode::Param.is_foldable());
        assert!(!Opcode::Start.is_foldable());
    }

    #[test]
    fn commutative_flags() {
        assert!(Opcode::Add.desc().commutative);
        assert!(!Opcode::Sub.desc().commutative);
        assert!(!Opcode::Div.desc().commutative);
    }

    #[test]
    fn if_has_two_operand_roles() {
        let d = Opcode::If.desc();
        assert_eq!(d.operands[0], OperandKind::Control);
        assert_eq!(d.operands[1], OperandKind::Data);
    }
}
