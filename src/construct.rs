//! Construction API: `emit`, `fold`, per-type constant helpers, and
//! opcode-named convenience wrappers. This is the client-facing surface a
//! compiler front-end drives to build the sea-of-nodes graph.

use crate::arena::{Ref, REF_FALSE, REF_NULL, REF_TRUE, REF_UNUSED};
use crate::context::{Context, ContextFlags};
use crate::fold::fold_impl;
use crate::op::Opcode;
use crate::types::Type;

impl Context {
    /// Direct emission: appends the instruction with no folding or CSE,
    /// linking it into the per-opcode LVN chain if it's a foldable op (so
    /// a later `fold` call can still find it for local value numbering).
    pub fn emit(&mut self, op: Opcode, ty: Type, op1: Ref, op2: Ref, op3: Ref) -> Ref {
        let r = self.arena.push_insn(op, ty, op1, op2, op3);
        if op.is_foldable() {
            self.arena.lvn_chain_link(op, r);
        }
        r
    }

    pub fn emit_n(&mut self, op: Opcode, ty: Type, ops: Vec<Ref>) -> Ref {
        let (op1, op2, op3, extra) = split3(&ops);
        self.arena.push_insn_extra(op, ty, op1, op2, op3, extra)
    }

    pub fn set_op(&mut self, r: Ref, index: usize, val: Ref) {
        let insn = self.arena.get_mut(r);
        while insn.input_count() <= index {
            insn.extra.push(REF_UNUSED);
        }
        insn.set_input(index, val);
    }

    /// Folding surface: constant-folds, canonicalizes, and CSEs when
    /// `OPT_FOLDING` is set; otherwise behaves exactly like `emit`.
    pub fn fold(&mut self, op: Opcode, ty: Type, op1: Ref, op2: Ref, op3: Ref) -> Ref {
        if !self.folding_enabled() {
            return self.emit(op, ty, op1, op2, op3);
        }
        fold_impl(self, op, ty, op1, op2, op3)
    }

    // -- per-type constant constructors ------------------------------------

    pub fn const_bool(&mut self, v: bool) -> Ref {
        self.arena.const_bool(v)
    }
    pub fn const_u8(&mut self, v: u8) -> Ref {
        self.arena.const_u64(Type::U8, v as u64)
    }
    pub fn const_u16(&mut self, v: u16) -> Ref {
        self.arena.const_u64(Type::U16, v as u64)
    }
    pub fn const_u32(&mut self, v: u32) -> Ref {
        self.arena.const_u64(Type::U32, v as u64)
    }
    pub fn const_u64(&mut self, v: u64) -> Ref {
        self.arena.const_u64(Type::U64, v)
    }
    pub fn const_addr(&mut self, v: u64) -> Ref {
        self.arena.const_u64(Type::Addr, v)
    }
    pub fn const_char(&mut self, v: u8) -> Ref {
        self.arena.const_u64(Type::Char, v as u64)
    }
    pub fn const_i8(&mut self, v: i8) -> Ref {
        self.arena.const_i64(Type::I8, v as i64)
    }
    pub fn const_i16(&mut self, v: i16) -> Ref {
        self.arena.const_i64(Type::I16, v as i64)
    }
    pub fn const_i32(&mut self, v: i32) -> Ref {
        self.arena.const_i64(Type::I32, v as i64)
    }
    pub fn const_i64(&mut self, v: i64) -> Ref {
        self.arena.const_i64(Type::I64, v)
    }
    pub fn const_double(&mut self, v: f64) -> Ref {
        self.arena.const_f64(v)
    }
    pub fn const_float(&mut self, v: f32) -> Ref {
        self.arena.const_f32(v)
    }

    pub fn const_null(&self) -> Ref {
        REF_NULL
    }
    pub fn const_true(&self) -> Ref {
        REF_TRUE
    }
    pub fn const_false(&self) -> Ref {
        REF_FALSE
    }

    // -- opcode-named helpers ------------------------------------------------

    pub fn add(&mut self, ty: Type, a: Ref, b: Ref) -> Ref {
        self.fold(Opcode::Add, ty, a, b, REF_UNUSED)
    }
    pub fn sub(&mut self, ty: Type, a: Ref, b: Ref) -> Ref {
        self.fold(Opcode::Sub, ty, a, b, REF_UNUSED)
    }
    pub fn mul(&mut self, ty: Type, a: Ref, b: Ref) -> Ref {
        self.fold(Opcode::Mul, ty, a, b, REF_UNUSED)
    }

    pub fn cmp(&mut self, op: Opcode, a: Ref, b: Ref) -> Ref {
        debug_assert!(matches!(
            op,
            Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Ge | Opcode::Le | Opcode::Gt | Opcode::Ult | Opcode::Uge | Opcode::Ule | Opcode::Ugt
        ));
        self.fold(op, Type::Bool, a, b, REF_UNUSED)
    }

    /// `START` is the unique function entry; emitted once per context.
    pub fn start(&mut self) -> Ref {
        self.emit(Opcode::Start, Type::Void, REF_UNUSED, REF_UNUSED, REF_UNUSED)
    }

    pub fn begin(&mut self, ctrl: Ref) -> Ref {
        self.emit(Opcode::Begin, Type::Void, ctrl, REF_UNUSED, REF_UNUSED)
    }

    pub fn if_(&mut self, ctrl: Ref, cond: Ref) -> Ref {
        self.emit(Opcode::If, Type::Void, ctrl, cond, REF_UNUSED)
    }

    pub fn if_true(&mut self, if_ref: Ref) -> Ref {
        self.emit(Opcode::IfTrue, Type::Void, if_ref, REF_UNUSED, REF_UNUSED)
    }

    pub fn if_false(&mut self, if_ref: Ref) -> Ref {
        self.emit(Opcode::IfFalse, Type::Void, if_ref, REF_UNUSED, REF_UNUSED)
    }

    pub fn merge(&mut self, preds: Vec<Ref>) -> Ref {
        self.emit_n(Opcode::Merge, Type::Void, preds)
    }

    pub fn loop_begin(&mut self, entry: Ref) -> Ref {
        // op2 (the back-edge END) is patched via `set_op` once the back
        // edge is known, matching the source's two-phase LOOP_BEGIN
        // construction (the loop body isn't built yet when the header is).
        self.emit(Opcode::LoopBegin, Type::Void, entry, REF_UNUSED, REF_UNUSED)
    }

    pub fn loop_end(&mut self, ctrl: Ref, loop_begin: Ref) -> Ref {
        self.emit(Opcode::LoopEnd, Type::Void, ctrl, loop_begin, REF_UNUSED)
    }

    /// `n+1`-operand PHI: `region` is the controlling MERGE/LOOP_BEGIN,
    /// `values` has one entry per predecessor in matching order.
    pub fn phi(&mut self, ty: Type, region: Ref, values: Vec<Ref>) -> Ref {
        let mut ops = Vec::with_capacity(1 + values.len());
        ops.push(region);
        ops.extend(values);
        self.emit_n(Opcode::Phi, ty, ops)
    }

    pub fn param(&mut self, ty: Type, start: Ref, name: &str, index: u32) -> Ref {
        let str_id = self.arena.strtab.intern(name) as i32;
        self.emit(Opcode::Param, ty, start, str_id, index as i32)
    }

    /// `RETURN` is chained through op3 into `START`'s terminator list;
    /// `prev_terminator` is the previous terminator in that chain (or
    /// `START` itself for the first one).
    pub fn return_(&mut self, ctrl: Ref, value: Ref, prev_terminator: Ref) -> Ref {
        self.emit(Opcode::Return, Type::Void, ctrl, value, prev_terminator)
    }

    pub fn call_n(&mut self, ty: Type, ctrl: Ref, func: Ref, args: Vec<Ref>) -> Ref {
        let mut ops = vec![ctrl, func];
        ops.extend(args);
        self.emit_n(Opcode::Call, ty, ops)
    }
}

fn split3(ops: &[Ref]) -> (Ref, Ref, Ref, Vec<Ref>) {
    let op1 = ops.first().copied().unwrap_or(REF_UNUSED);
    let op2 = ops.get(1).copied().unwrap_or(REF_UNUSED);
    let op3 = ops.get(2).copied().unwrap_or(REF_UNUSED);
    let extra = if ops.len() > 3 { ops[3..].to_vec() } else { Vec::new() };
    (op1, op2, op3, extra)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Folding the same pair of constants is idempotent regardless of
        /// how many times it's repeated, and always agrees with directly
        /// interning the wrapped sum — `fold` never leaves a stray `Add`
        /// instruction behind when both operands are already constants.
        #[test]
        fn add_folding_is_idempotent(a_val: i32, b_val: i32) {
            let mut c = ctx();
            let a = c.const_i32(a_val);
            let b = c.const_i32(b_val);
            let r1 = c.add(Type::I32, a, b);
            let r2 = c.add(Type::I32, a, b);
            prop_assert_eq!(r1, r2);
            prop_assert_eq!(r1, c.const_i32(a_val.wrapping_add(b_val)));
            prop_assert!(c.arena.insn_refs().all(|r| c.arena.get(r).op != Opcode::Add));
        }
    }

    fn ctx() -> Context {
        Context::new(ContextFlags::FUNCTION | ContextFlags::OPT_FOLDING, 16, 16)
    }

    #[test]
    fn constant_fold_add() {
        let mut c = ctx();
        let two = c.const_i32(2);
        let three = c.const_i32(3);
        let r = c.add(Type::I32, two, three);
        assert_eq!(r, c.const_i32(5));
        assert!(c.arena.insn_refs().all(|r| c.arena.get(r).op != Opcode::Add));
    }

    #[test]
    fn folding_idempotent() {
        let mut c = ctx();
        let a = c.const_i32(10);
        let b = c.const_i32(20);
        let r1 = c.fold(Opcode::Add, Type::I32, a, b, REF_UNUSED);
        let r2 = c.fold(Opcode::Add, Type::I32, a, b, REF_UNUSED);
        assert_eq!(r1, r2);
    }
}
