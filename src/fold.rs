//! Rule-based folding engine.
//!
//! The source drives this from an offline-generated perfect-hash table
//! keyed on `(opcode_self, opcode_of_op1, opcode_of_op2)`; we re-express
//! the same dispatch as an open-coded `match` (the design notes call the
//! generated table "an opaque data resource" and say rule bodies are
//! hand-written regardless, so nothing is lost by skipping the perfect
//! hash itself and keeping only its effect: constant folding, algebraic
//! identities, canonicalization, and CSE, evaluated in that order).

use crate::arena::{is_const_ref, Ref, REF_UNUSED};
use crate::context::Context;
use crate::op::Opcode;
use crate::types::Type;

/// What the SCCP lattice evaluator sees back from a fold attempt made in
/// non-emitting mode: the folder never mutates the graph in this mode, it
/// only reports its decision and leaves installing it to the caller.
pub enum FoldOutcome {
    /// Fully evaluated to a constant bit pattern.
    Const(Type, u64),
    /// Copy-propagates to an existing ref (possibly another instruction).
    Copy(Ref),
    /// No improvement over BOTTOM could be derived.
    NoFold,
}

pub fn fold_impl(ctx: &mut Context, op: Opcode, ty: Type, op1: Ref, op2: Ref, op3: Ref) -> Ref {
    match try_fold(ctx, op, ty, op1, op2, op3) {
        FoldOutcome::Const(t, bits) => ctx.arena.intern_const(t, bits),
        FoldOutcome::Copy(r) => r,
        FoldOutcome::NoFold => {
            let (op1, op2, _op3) = canonicalize(ctx, op, op1, op2, op3);
            cse_lookup_or_emit(ctx, op, ty, op1, op2, op3)
        }
    }
}

/// Pure evaluation: constant folding and algebraic identities, with no
/// arena mutation. Used directly by SCCP's non-emitting evaluation mode
/// and as the first stage of [`fold_impl`].
pub fn try_fold(ctx: &Context, op: Opcode, ty: Type, op1: Ref, op2: Ref, op3: Ref) -> FoldOutcome {
    if op == Opcode::Copy {
        return FoldOutcome::Copy(op1);
    }

    if is_const_ref(op1) && (op2 == REF_UNUSED || is_const_ref(op2)) && (op3 == REF_UNUSED || is_const_ref(op3)) {
        if let Some(outcome) = const_eval(ctx, op, op1, op2, op3) {
            return outcome;
        }
    }

    if let Some(outcome) = algebraic_identity(ctx, op, ty, op1, op2) {
        return outcome;
    }

    FoldOutcome::NoFold
}

fn const_eval(ctx: &Context, op: Opcode, op1: Ref, op2: Ref, op3: Ref) -> Option<FoldOutcome> {
    let a = ctx.arena.get_const(op1);
    if op2 == REF_UNUSED {
        return unary_const(op, a);
    }
    let b = ctx.arena.get_const(op2);
    if a.ty.is_fp() || b.ty.is_fp() {
        return binary_const_fp(op, a.as_f64(), b.as_f64(), a.ty);
    }
    if a.ty.is_signed() {
        binary_const_signed(op, a.as_i64(), b.as_i64(), a.ty, op3)
    } else {
        binary_const_unsigned(op, a.as_u64(), b.as_u64(), a.ty, op3)
    }
}

fn unary_const(op: Opcode, a: &crate::arena::ConstSlot) -> Option<FoldOutcome> {
    let ty = a.ty;
    let out = match op {
        Opcode::Neg if ty.is_fp() => f64::to_bits(-a.as_f64()),
        Opcode::Neg => (a.as_i64().wrapping_neg()) as u64,
        Opcode::Not => !a.as_u64(),
        Opcode::Abs if ty.is_fp() => f64::to_bits(a.as_f64().abs()),
        Opcode::Abs => a.as_i64().wrapping_abs() as u64,
        _ => return None,
    };
    Some(FoldOutcome::Const(ty, out))
}

fn binary_const_fp(op: Opcode, a: f64, b: f64, ty: Type) -> Option<FoldOutcome> {
    let cmp = |v: bool| FoldOutcome::Const(Type::Bool, v as u64);
    Some(match op {
        Opcode::Add => FoldOutcome::Const(ty, f64::to_bits(a + b)),
        Opcode::Sub => FoldOutcome::Const(ty, f64::to_bits(a - b)),
        Opcode::Mul => FoldOutcome::Const(ty, f64::to_bits(a * b)),
        Opcode::Div => FoldOutcome::Const(ty, f64::to_bits(a / b)),
        Opcode::Min => FoldOutcome::Const(ty, f64::to_bits(a.min(b))),
        Opcode::Max => FoldOutcome::Const(ty, f64::to_bits(a.max(b))),
        Opcode::Eq => cmp(a == b),
        Opcode::Ne => cmp(a != b),
        Opcode::Lt => cmp(a < b),
        Opcode::Le => cmp(a <= b),
        Opcode::Gt => cmp(a > b),
        Opcode::Ge => cmp(a >= b),
        _ => return None,
    })
}

fn binary_const_signed(op: Opcode, a: i64, b: i64, ty: Type, op3: Ref) -> Option<FoldOutcome> {
    let cmp = |v: bool| FoldOutcome::Const(Type::Bool, v as u64);
    Some(match op {
        Opcode::Add => FoldOutcome::Const(ty, a.wrapping_add(b) as u64),
        Opcode::Sub => FoldOutcome::Const(ty, a.wrapping_sub(b) as u64),
        Opcode::Mul => FoldOutcome::Const(ty, a.wrapping_mul(b) as u64),
        Opcode::Div if b != 0 => FoldOutcome::Const(ty, a.wrapping_div(b) as u64),
        Opcode::Mod if b != 0 => FoldOutcome::Const(ty, a.wrapping_rem(b) as u64),
        Opcode::And => FoldOutcome::Const(ty, (a & b) as u64),
        Opcode::Or => FoldOutcome::Const(ty, (a | b) as u64),
        Opcode::Xor => FoldOutcome::Const(ty, (a ^ b) as u64),
        Opcode::Shl => FoldOutcome::Const(ty, a.wrapping_shl(b as u32) as u64),
        Opcode::Sar => FoldOutcome::Const(ty, a.wrapping_shr(b as u32) as u64),
        Opcode::Min => FoldOutcome::Const(ty, a.min(b) as u64),
        Opcode::Max => FoldOutcome::Const(ty, a.max(b) as u64),
        Opcode::Eq => cmp(a == b),
        Opcode::Ne => cmp(a != b),
        Opcode::Lt => cmp(a < b),
        Opcode::Ge => cmp(a >= b),
        Opcode::Le => cmp(a <= b),
        Opcode::Gt => cmp(a > b),
        Opcode::Cond => {
            debug_assert_ne!(op3, REF_UNUSED);
            return Some(FoldOutcome::Copy(if a != 0 { op3 } else { REF_UNUSED }));
        }
        _ => return None,
    })
}

fn binary_const_unsigned(op: Opcode, a: u64, b: u64, ty: Type, _op3: Ref) -> Option<FoldOutcome> {
    let cmp = |v: bool| FoldOutcome::Const(Type::Bool, v as u64);
    Some(match op {
        Opcode::Add => FoldOutcome::Const(ty, a.wrapping_add(b)),
        Opcode::Sub => FoldOutcome::Const(ty, a.wrapping_sub(b)),
        Opcode::Mul => FoldOutcome::Const(ty, a.wrapping_mul(b)),
        Opcode::Div if b != 0 => FoldOutcome::Const(ty, a / b),
        Opcode::Mod if b != 0 => FoldOutcome::Const(ty, a % b),
        Opcode::And => FoldOutcome::Const(ty, a & b),
        Opcode::Or => FoldOutcome::Const(ty, a | b),
        Opcode::Xor => FoldOutcome::Const(ty, a ^ b),
        Opcode::Shl => FoldOutcome::Const(ty, a.wrapping_shl(b as u32)),
        Opcode::Shr => FoldOutcome::Const(ty, a.wrapping_shr(b as u32)),
        Opcode::Min => FoldOutcome::Const(ty, a.min(b)),
        Opcode::Max => FoldOutcome::Const(ty, a.max(b)),
        Opcode::Eq => cmp(a == b),
        Opcode::Ne => cmp(a != b),
        Opcode::Ult => cmp(a < b),
        Opcode::Uge => cmp(a >= b),
        Opcode::Ule => cmp(a <= b),
        Opcode::Ugt => cmp(a > b),
        _ => return None,
    })
}

/// Identity eliminations that don't require both operands to be constant:
/// `x + 0`, `x * 1`, `x * 0`, `x - 0`, `x - x`, `x ^ x`, `x & x`, `x | x`.
fn algebraic_identity(ctx: &Context, op: Opcode, ty: Type, op1: Ref, op2: Ref) -> Option<FoldOutcome> {
    let const_zero = |r: Ref| is_const_ref(r) && ctx.arena.get_const(r).as_u64() == 0 && !ctx.arena.get_const(r).ty.is_fp();
    let const_one = |r: Ref| is_const_ref(r) && ctx.arena.get_const(r).as_u64() == 1 && !ctx.arena.get_const(r).ty.is_fp();

    match op {
        Opcode::Add | Opcode::Or | Opcode::Xor if const_zero(op2) => Some(FoldOutcome::Copy(op1)),
        Opcode::Add | Opcode::Or if const_zero(op1) => Some(FoldOutcome::Copy(op2)),
        Opcode::Sub if const_zero(op2) => Some(FoldOutcome::Copy(op1)),
        // x - x and x ^ x are only unconditionally 0 for integer types;
        // for fp, x - x is NaN when x is NaN.
        Opcode::Sub if op1 == op2 && !ty.is_fp() => Some(FoldOutcome::Const(ty, 0)),
        Opcode::Xor if op1 == op2 && !ty.is_fp() => Some(FoldOutcome::Const(ty, 0)),
        Opcode::And | Opcode::Or if op1 == op2 => Some(FoldOutcome::Copy(op1)),
        Opcode::Mul if const_one(op2) => Some(FoldOutcome::Copy(op1)),
        Opcode::Mul if const_one(op1) => Some(FoldOutcome::Copy(op2)),
        Opcode::Mul if const_zero(op2) => Some(FoldOutcome::Copy(op2)),
        Opcode::Mul if const_zero(op1) => Some(FoldOutcome::Copy(op1)),
        Opcode::Shl | Opcode::Shr | Opcode::Sar if const_zero(op2) => Some(FoldOutcome::Copy(op1)),
        Opcode::Eq if op1 == op2 => Some(FoldOutcome::Const(Type::Bool, 1)),
        Opcode::Ne if op1 == op2 => Some(FoldOutcome::Const(Type::Bool, 0)),
        _ => None,
    }
}

/// Moves a constant operand to `op2` for commutative ops, matching the
/// source's canonical form so CSE and later pattern matching see one
/// shape for `x+5` and `5+x`.
fn canonicalize(ctx: &Context, op: Opcode, op1: Ref, op2: Ref, op3: Ref) -> (Ref, Ref, Ref) {
    if op.desc().commutative && is_const_ref(op1) && !is_const_ref(op2) {
        (op2, op1, op3)
    } else {
        let _ = ctx;
        (op1, op2, op3)
    }
}

/// Walks the opcode's local-value-numbering chain backward looking for a
/// matching instruction: stops at the first ref below `fold_cse_limit`,
/// or once accumulated backward offsets would exceed 16 bits.
fn cse_lookup_or_emit(ctx: &mut Context, op: Opcode, ty: Type, op1: Ref, op2: Ref, op3: Ref) -> Ref {
    if op.is_foldable() {
        let mut cursor = ctx.arena.lvn_chain_head(op);
        let mut budget: i64 = u16::MAX as i64;
        while cursor != REF_UNUSED && cursor >= ctx.fold_cse_limit && budget > 0 {
            let insn = ctx.arena.get(cursor);
            if insn.op == op && insn.ty == ty && insn.op1 == op1 && insn.op2 == op2 && insn.op3 == op3 {
                return cursor;
            }
            let offset = insn.prev_insn_offset as i64;
            if offset == 0 {
                break;
            }
            budget -= offset;
            cursor -= offset as i32;
        }
    }
    ctx.emit(op, ty, op1, op2, op3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextFlags;

    fn ctx() -> Context {
        Context::new(ContextFlags::OPT_FOLDING, 16, 16)
    }

    #[test]
    fn identity_add_zero() {
        let mut c = ctx();
        let x = c.param(Type::I32, c.arena.insns_count() as Ref - 1, "x", 0);
        let zero = c.const_i32(0);
        let r = c.add(Type::I32, x, zero);
        assert_eq!(r, x);
    }

    #[test]
    fn cse_reuses_identical_add() {
        let mut c = ctx();
        let x = c.param(Type::I32, REF_UNUSED, "x", 0);
        let y = c.param(Type::I32, REF_UNUSED, "y", 1);
        let r1 = c.add(Type::I32, x, y);
        let r2 = c.add(Type::I32, x, y);
        assert_eq!(r1, r2);
    }

    #[test]
    fn commutative_canonicalization_enables_cse() {
        let mut c = ctx();
        let x = c.param(Type::I32, REF_UNUSED, "x", 0);
        let five = c.const_i32(5);
        let r1 = c.fold(Opcode::Add, Type::I32, five, x, REF_UNUSED);
        let r2 = c.fold(Opcode::Add, Type::I32, x, five, REF_UNUSED);
        assert_eq!(r1, r2);
    }
}
