//! The instruction arena: a bidirectional buffer holding both constants
//! and instructions, re-expressed as two growable side tables rather than
//! raw pointer arithmetic around a pivot — a single growable buffer with
//! an explicit base offset and a signed index type.
//!
//! A [`Ref`] is a signed index: zero means unused, positive indexes
//! [`Arena::insns`], negative indexes [`Arena::consts`]. Three negative
//! refs are pre-reserved so trivial constants never allocate a slot.

use std::fmt;

use crate::op::Opcode;
use crate::types::Type;

pub type Ref = i32;

pub const REF_UNUSED: Ref = 0;
pub const REF_NULL: Ref = -1;
pub const REF_FALSE: Ref = -2;
pub const REF_TRUE: Ref = -3;

/// First ref available for client-constructed constants; -1..-3 are reserved.
const FIRST_CONST_SLOT: usize = 3;

#[inline]
pub fn is_const_ref(r: Ref) -> bool {
    r < 0
}

/// One instruction record. Multi-operand instructions (`MERGE`, `PHI`,
/// `CALL`, `SWITCH`-family) carry operands beyond the third in `extra`
/// rather than spilling into following arena slots — the source's
/// "4 refs per extra slot" trick exists only to keep the C struct fixed
/// size; a `Vec` is the idiomatic equivalent the design notes call for.
#[derive(Debug, Clone)]
pub struct Insn {
    pub op: Opcode,
    pub ty: Type,
    /// Backward offset to the previous instruction of the same opcode in
    /// the local-value-numbering chain (bounded to `u16`). Instructions
    /// not participating in LVN leave this `0`.
    pub prev_insn_offset: u16,
    pub op1: Ref,
    pub op2: Ref,
    pub op3: Ref,
    /// Operands past the third: PHI values (after the control op1), MERGE
    /// predecessors past the third, CALL/TAILCALL arguments.
    pub extra: Vec<Ref>,
    /// Set by passes that remove an instruction but must preserve ref
    /// stability (SCCP dead-branch removal, folding replacement). A NOP'd
    /// instruction is skipped by every later pass.
    pub nop: bool,
}

impl Insn {
    fn new(op: Opcode, ty: Type, op1: Ref, op2: Ref, op3: Ref) -> Self {
        Insn {
            op,
            ty,
            prev_insn_offset: 0,
            op1,
            op2,
            op3,
            extra: Vec::new(),
            nop: false,
        }
    }

    /// All operand refs in positional order, including `extra`.
    pub fn inputs(&self) -> Vec<Ref> {
        let mut v = Vec::with_capacity(3 + self.extra.len());
        for r in [self.op1, self.op2, self.op3] {
            v.push(r);
        }
        v.extend_from_slice(&self.extra);
        v
    }

    pub fn set_input(&mut self, index: usize, value: Ref) {
        match index {
            0 => self.op1 = value,
            1 => self.op2 = value,
            2 => self.op3 = value,
            n => self.extra[n - 3] = value,
        }
    }

    pub fn input(&self, index: usize) -> Ref {
        match index {
            0 => self.op1,
            1 => self.op2,
            2 => self.op3,
            n => self.extra[n - 3],
        }
    }

    pub fn input_count(&self) -> usize {
        3 + self.extra.len()
    }
}

/// A constant value. `bits` holds the raw bit pattern of the value
/// reinterpreted per `ty` (matches the source's `op2/op3` 64-bit union).
#[derive(Debug, Clone, Copy)]
pub struct ConstSlot {
    pub ty: Type,
    pub bits: u64,
    /// Head-of-chain link for per-type uniqueness, mirroring
    /// `prev_const_chain`; kept even though `Arena` also never revisits a
    /// slot once interned, so walking the chain is the only lookup path
    /// (no auxiliary hash index — see DESIGN.md).
    pub prev_const: Ref,
}

impl ConstSlot {
    pub fn as_u64(&self) -> u64 {
        self.bits
    }
    pub fn as_i64(&self) -> i64 {
        self.bits as i64
    }
    pub fn as_f64(&self) -> f64 {
        f64::from_bits(self.bits)
    }
    pub fn as_f32(&self) -> f32 {
        f32::from_bits(self.bits as u32)
    }
    pub fn as_bool(&self) -> bool {
        self.bits != 0
    }

    fn from_bool(v: bool) -> u64 {
        v as u64
    }
}

pub struct StringTable {
    strings: Vec<String>,
    index: std::collections::HashMap<String, u32>,
}

impl StringTable {
    fn new() -> Self {
        StringTable {
            strings: Vec::new(),
            index: std::collections::HashMap::new(),
        }
    }

    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(&id) = self.index.get(s) {
            return id;
        }
        let id = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.index.insert(s.to_string(), id);
        id
    }

    pub fn get(&self, id: u32) -> &str {
        &self.strings[id as usize]
    }
}

/// The arena: instructions grow from ref 1 upward, constants grow from
/// ref -4 downward (refs -1..-3 are the reserved NULL/FALSE/TRUE slots).
pub struct Arena {
    insns: Vec<Insn>,
    consts: Vec<ConstSlot>,
    pub strtab: StringTable,
    /// Per-type head of the constant-dedup chain, indexed by `Type as usize`.
    prev_const_chain: [Ref; crate::types::TYPE_COUNT],
    /// Per-opcode head of the local-value-numbering chain, indexed by
    /// `Opcode as usize` for opcodes `<= LAST_FOLDABLE`.
    prev_insn_chain: Vec<Ref>,
}

impl Arena {
    pub fn new(consts_hint: usize, insns_hint: usize) -> Self {
        let mut consts = Vec::with_capacity(consts_hint.max(FIRST_CONST_SLOT));
        // Reserved slots for NULL, FALSE, TRUE at refs -1, -2, -3.
        consts.push(ConstSlot { ty: Type::Addr, bits: 0, prev_const: REF_UNUSED });
        consts.push(ConstSlot { ty: Type::Bool, bits: 0, prev_const: REF_UNUSED });
        consts.push(ConstSlot { ty: Type::Bool, bits: 1, prev_const: REF_UNUSED });

        let mut insns = Vec::with_capacity(insns_hint.max(1));
        insns.push(Insn::new(Opcode::Nop, Type::Void, REF_UNUSED, REF_UNUSED, REF_UNUSED)); // ref 0 is unused

        Arena {
            insns,
            consts,
            strtab: StringTable::new(),
            prev_const_chain: [REF_UNUSED; crate::types::TYPE_COUNT],
            prev_insn_chain: vec![REF_UNUSED; Opcode::Copy as usize + 1],
        }
    }

    #[inline]
    fn const_index(r: Ref) -> usize {
        debug_assert!(is_const_ref(r));
        (-r - 1) as usize
    }

    pub fn get(&self, r: Ref) -> &Insn {
        debug_assert!(!is_const_ref(r) && r != REF_UNUSED);
        &self.insns[r as usize]
    }

    pub fn get_mut(&mut self, r: Ref) -> &mut Insn {
        debug_assert!(!is_const_ref(r) && r != REF_UNUSED);
        &mut self.insns[r as usize]
    }

    pub fn get_const(&self, r: Ref) -> &ConstSlot {
        &self.consts[Self::const_index(r)]
    }

    pub fn insns_count(&self) -> usize {
        self.insns.len()
    }

    pub fn consts_count(&self) -> usize {
        self.consts.len()
    }

    /// Iterate over instruction refs 1..insns_count(), skipping none —
    /// callers filter NOPs themselves (cheaper than a filtering iterator
    /// when most passes need the raw index anyway).
    pub fn insn_refs(&self) -> impl Iterator<Item = Ref> {
        1..self.insns.len() as Ref
    }

    pub fn is_nop(&self, r: Ref) -> bool {
        !is_const_ref(r) && r != REF_UNUSED && self.get(r).nop
    }

    pub fn set_nop(&mut self, r: Ref) {
        let insn = self.get_mut(r);
        insn.op = Opcode::Nop;
        insn.nop = true;
        insn.op1 = REF_UNUSED;
        insn.op2 = REF_UNUSED;
        insn.op3 = REF_UNUSED;
        insn.extra.clear();
    }

    /// Appends a new instruction and returns its ref. Does not perform
    /// folding or value numbering — that is [`crate::construct::Constructor`]'s job.
    pub fn push_insn(&mut self, op: Opcode, ty: Type, op1: Ref, op2: Ref, op3: Ref) -> Ref {
        let r = self.insns.len() as Ref;
        self.insns.push(Insn::new(op, ty, op1, op2, op3));
        r
    }

    pub fn push_insn_extra(&mut self, op: Opcode, ty: Type, op1: Ref, op2: Ref, op3: Ref, extra: Vec<Ref>) -> Ref {
        let r = self.push_insn(op, ty, op1, op2, op3);
        self.get_mut(r).extra = extra;
        r
    }

    // -- local value numbering chain ------------------------------------

    pub fn lvn_chain_head(&self, op: Opcode) -> Ref {
        self.prev_insn_chain[op as usize]
    }

    /// Links `r` into op's LVN chain and records the backward offset, or
    /// leaves the offset `0` (meaning "no predecessor recorded") if the
    /// distance does not fit in 16 bits — matching the source's CSE-window
    /// bound exactly (see DESIGN.md on `fold_cse_limit`).
    pub fn lvn_chain_link(&mut self, op: Opcode, r: Ref) {
        let head = self.prev_insn_chain[op as usize];
        let offset = if head != REF_UNUSED && r > head {
            (r - head) as i64
        } else {
            0
        };
        if offset > 0 && offset <= u16::MAX as i64 {
            self.get_mut(r).prev_insn_offset = offset as u16;
        }
        self.prev_insn_chain[op as usize] = r;
    }

    // -- constants --------------------------------------------------------

    /// Interns a constant, walking the per-type chain for (type, bits)
    /// equality before appending a fresh slot — this is what keeps
    /// constants unique per `(type, bit-pattern)`.
    pub fn intern_const(&mut self, ty: Type, bits: u64) -> Ref {
        if ty == Type::Bool {
            return if bits != 0 { REF_TRUE } else { REF_FALSE };
        }
        if ty == Type::Addr && bits == 0 {
            return REF_NULL;
        }

        let mut cursor = self.prev_const_chain[ty as usize];
        while cursor != REF_UNUSED {
            let slot = self.get_const(cursor);
            if slot.ty == ty && slot.bits == bits {
                return cursor;
            }
            cursor = slot.prev_const;
        }

        let prev = self.prev_const_chain[ty as usize];
        self.consts.push(ConstSlot { ty, bits, prev_const: prev });
        let r = -(self.consts.len() as Ref);
        self.prev_const_chain[ty as usize] = r;
        r
    }

    pub fn const_bool(&mut self, v: bool) -> Ref {
        self.intern_const(Type::Bool, ConstSlot::from_bool(v))
    }
    pub fn const_i64(&mut self, ty: Type, v: i64) -> Ref {
        self.intern_const(ty, v as u64)
    }
    pub fn const_u64(&mut self, ty: Type, v: u64) -> Ref {
        self.intern_const(ty, v)
    }
    pub fn const_f64(&mut self, v: f64) -> Ref {
        self.intern_const(Type::Double, v.to_bits())
    }
    pub fn const_f32(&mut self, v: f32) -> Ref {
        self.intern_const(Type::Float, v.to_bits() as u64)
    }

    /// Shrinks `insns`/`consts` storage to the instructions actually used,
    /// compacting the arena to its actual size. A no-op today since we
    /// never over-allocate beyond `Vec`'s own growth, kept as the
    /// documented lifecycle hook so callers can depend on it existing.
    pub fn truncate(&mut self) {
        self.insns.shrink_to_fit();
        self.consts.shrink_to_fit();
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("insns_count", &self.insns.len())
            .field("consts_count", &self.consts.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Interning the same `(type, value)` pair any number of times
        /// always yields the same ref — the constant-uniqueness property
        /// `verify` checks for is a property of `intern_const` itself, not
        /// something later passes have to maintain by discipline.
        #[test]
        fn interning_i32_is_idempotent(v: i32, extra_calls in 0usize..5) {
            let mut a = Arena::new(0, 0);
            let first = a.const_i64(Type::I32, v as i64);
            for _ in 0..extra_calls {
                prop_assert_eq!(a.const_i64(Type::I32, v as i64), first);
            }
            let before = a.consts_count();
            a.const_i64(Type::I32, v as i64);
            prop_assert_eq!(a.consts_count(), before);
        }

        /// Distinct values of the same type never collide on a ref, and
        /// the same bit pattern under a different type never aliases the
        /// first type's constant (the `(type, bits)` key in `verify`'s
        /// `check_constant_uniqueness`).
        #[test]
        fn interning_distinguishes_type_and_value(a_val: i32, b_val: i32) {
            let mut a = Arena::new(0, 0);
            let r_i32 = a.const_i64(Type::I32, a_val as i64);
            let r_i64 = a.const_i64(Type::I64, a_val as i64);
            if a_val != b_val {
                let r_other = a.const_i64(Type::I32, b_val as i64);
                prop_assert_ne!(r_i32, r_other);
            }
            prop_assert_ne!(r_i32, r_i64);
        }
    }

    #[test]
    fn reserved_refs_do_not_allocate() {
        let mut a = Arena::new(0, 0);
        assert_eq!(a.const_bool(true), REF_TRUE);
        assert_eq!(a.const_bool(false), REF_FALSE);
        assert_eq!(a.intern_const(Type::Addr, 0), REF_NULL);
        assert_eq!(a.consts_count(), 3);
    }

    #[test]
    fn constant_uniqueness() {
        let mut a = Arena::new(0, 0);
        let r1 = a.const_i64(Type::I32, 5);
        let r2 = a.const_i64(Type::I32, 5);
        let r3 = a.const_i64(Type::I64, 5);
        assert_eq!(r1, r2);
        assert_ne!(r1, r3);
    }

    #[test]
    fn lvn_chain_offset_bounds() {
        let mut a = Arena::new(0, 0);
        let r1 = a.push_insn(Opcode::Add, Type::I32, 1, 2, REF_UNUSED);
        a.lvn_chain_link(Opcode::Add, r1);
        let r2 = a.push_insn(Opcode::Add, Type::I32, 1, 2, REF_UNUSED);
        a.lvn_chain_link(Opcode::Add, r2);
        assert_eq!(a.get(r2).prev_insn_offset, (r2 - r1) as u16);
        assert_eq!(a.lvn_chain_head(Opcode::Add), r2);
    }
}
