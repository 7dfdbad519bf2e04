//! Wimmer-Franz linear-scan register allocation with live-range
//! splitting and spill-slot reuse.
//!
//! No concrete target ABI ships with this crate (the encoder is an
//! external collaborator), so register counts here are placeholders a
//! target backend is expected to override via
//! [`RegAllocConfig`] before calling [`Context::reg_alloc`].

use std::collections::HashMap;

use crate::arena::{Ref, REF_UNUSED};
use crate::context::Context;
use crate::error::{IrError, IrResult};
use crate::liveness::{LiveInterval, UseFlag, SUB_REFS_COUNT};
use crate::types::Type;

/// Placeholder general-purpose/floating-point register file sizes. A
/// real backend supplies its own counts through [`RegAllocConfig`].
pub const DEFAULT_GP_REGISTERS: u16 = 8;
pub const DEFAULT_FP_REGISTERS: u16 = 8;

#[derive(Debug, Clone, Copy)]
pub struct RegAllocConfig {
    pub gp_registers: u16,
    pub fp_registers: u16,
    /// Bit `i` set means GP register `i` is reserved (e.g. the frame
    /// pointer under `USE_FRAME_POINTER`) and never offered by `tryAllocateFree`.
    pub reserved_gp: u32,
}

impl Default for RegAllocConfig {
    fn default() -> Self {
        RegAllocConfig {
            gp_registers: DEFAULT_GP_REGISTERS,
            fp_registers: DEFAULT_FP_REGISTERS,
            reserved_gp: 0,
        }
    }
}

/// A pre-colored live range representing a hardware register constraint
/// (ABI argument registers, call-clobbered ranges, operand constraints).
#[derive(Debug, Clone)]
pub struct FixedInterval {
    pub reg: u16,
    pub class: RegClass,
    pub ranges: Vec<(u32, u32)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegClass {
    Gp,
    Fp,
}

fn class_of(ty: Type) -> RegClass {
    if ty.is_fp() {
        RegClass::Fp
    } else {
        RegClass::Gp
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RegSlot {
    pub reg: u16,
    pub class: RegClass,
    /// Set when the value must be reloaded from its spill slot before
    /// this use, or saved to it after this def.
    pub spill_load: bool,
    pub spill_store: bool,
}

/// Final allocator output: per-instruction register assignment for the
/// result and up to three inputs, plus the spill-slot map for vregs that
/// never held a register throughout their interval.
pub struct RegAssignment {
    pub regs: HashMap<Ref, [Option<RegSlot>; 4]>,
    pub spill_slot: HashMap<u32, u32>,
}

impl RegAssignment {
    pub fn result_reg(&self, r: Ref) -> Option<RegSlot> {
        self.regs.get(&r).and_then(|slots| slots[0])
    }
}

/// One (possibly split) scheduling unit carried through the unhandled
/// queue; splitting produces a fresh `Piece` with a narrowed range list
/// rather than mutating the original `LiveInterval` in place.
#[derive(Clone)]
struct Piece {
    vreg: u32,
    class: RegClass,
    ranges: Vec<(u32, u32)>,
    uses: Vec<(u32, UseFlag)>,
    reg: Option<u16>,
    hint: Option<u16>,
    spill: bool,
}

impl Piece {
    fn start(&self) -> u32 {
        self.ranges.first().map(|r| r.0).unwrap_or(u32::MAX)
    }
    fn end(&self) -> u32 {
        self.ranges.last().map(|r| r.1).unwrap_or(0)
    }
    fn covers(&self, pos: u32) -> bool {
        self.ranges.iter().any(|&(s, e)| pos >= s && pos < e)
    }
    fn first_use_at_or_after(&self, pos: u32, must: bool) -> Option<u32> {
        self.uses
            .iter()
            .filter(|(p, f)| *p >= pos && (!must || matches!(f, UseFlag::MustBeInReg)))
            .map(|(p, _)| *p)
            .min()
    }
    /// Splits at `pos`, keeping `[start, pos)` in `self` and returning a
    /// new piece covering `[pos, end)`.
    fn split_at(&mut self, pos: u32) -> Piece {
        let mut head = Vec::new();
        let mut tail = Vec::new();
        for &(s, e) in &self.ranges {
            if e <= pos {
                head.push((s, e));
            } else if s >= pos {
                tail.push((s, e));
            } else {
                head.push((s, pos));
                tail.push((pos, e));
            }
        }
        let (use_head, use_tail): (Vec<_>, Vec<_>) = self.uses.iter().cloned().partition(|(p, _)| *p < pos);
        self.ranges = head;
        self.uses = use_head;
        Piece {
            vreg: self.vreg,
            class: self.class,
            ranges: tail,
            uses: use_tail,
            reg: None,
            hint: self.reg.or(self.hint),
            spill: false,
        }
    }
}

impl Context {
    /// Runs linear-scan register allocation over [`Context::live_intervals`],
    /// producing [`Context::reg_assignment`]. Requires [`Context::coalesce`]
    /// to have run (coalescing before allocation shrinks the interval count
    /// the allocator has to consider).
    pub fn reg_alloc(&mut self, config: RegAllocConfig) -> IrResult<()> {
        self.reg_alloc_with_fixed(config, &[])
    }

    pub fn reg_alloc_with_fixed(&mut self, config: RegAllocConfig, fixed: &[FixedInterval]) -> IrResult<()> {
        let _span = tracing::debug_span!("reg_alloc").entered();
        let live = self.live_intervals.as_ref().expect("compute_live_ranges must run before reg_alloc");

        let mut pieces: Vec<Piece> = Vec::new();
        for iv in &live.intervals {
            if iv.ranges.is_empty() {
                continue;
            }
            pieces.push(Piece {
                vreg: iv.vreg,
                class: class_of(iv.ty),
                ranges: iv.ranges.iter().map(|r| (r.start, r.end)).collect(),
                uses: iv.uses.iter().map(|u| (u.pos, u.flag)).collect(),
                reg: None,
                hint: first_hint(iv),
                spill: false,
            });
        }
        pieces.sort_by_key(|p| p.start());

        let mut spill_slot: HashMap<u32, u32> = HashMap::new();
        let mut freelists: HashMap<u8, Vec<u32>> = HashMap::new();
        let mut next_slot: u32 = 0;

        let mut unhandled: Vec<Piece> = pieces;
        unhandled.sort_by(|a, b| b.start().cmp(&a.start())); // pop() takes the smallest start
        let mut active: Vec<Piece> = Vec::new();
        let mut inactive: Vec<Piece> = Vec::new();
        let mut finished: Vec<Piece> = Vec::new();

        let mut allocation_error: Option<u32> = None;

        while let Some(mut cur) = unhandled.pop() {
            let position = cur.start();

            active.retain_mut(|a| {
                if a.end() <= position {
                    finished.push(a.clone());
                    false
                } else {
                    true
                }
            });
            let mut moved_to_inactive = Vec::new();
            active.retain(|a| {
                if !a.covers(position) {
                    moved_to_inactive.push(a.clone());
                    false
                } else {
                    true
                }
            });
            inactive.extend(moved_to_inactive);

            inactive.retain_mut(|a| {
                if a.end() <= position {
                    finished.push(a.clone());
                    false
                } else {
                    true
                }
            });
            let mut moved_to_active = Vec::new();
            inactive.retain(|a| {
                if a.covers(position) {
                    moved_to_active.push(a.clone());
                    false
                } else {
                    true
                }
            });
            active.extend(moved_to_active);

            let reg_count = match cur.class {
                RegClass::Gp => config.gp_registers,
                RegClass::Fp => config.fp_registers,
            };
            let reserved = if cur.class == RegClass::Gp { config.reserved_gp } else { 0 };

            if let Some(assigned) = try_allocate_free(&mut cur, &active, &inactive, fixed, reg_count, reserved, &mut unhandled) {
                cur.reg = Some(assigned);
                active.push(cur);
                continue;
            }

            match allocate_blocked(&mut cur, &mut active, &mut inactive, fixed, reg_count, reserved, &mut unhandled) {
                Some(assigned) => {
                    cur.reg = Some(assigned);
                    active.push(cur);
                }
                None => {
                    cur.spill = true;
                    assign_spill_slot(cur.vreg, size_class(cur.class), &mut spill_slot, &mut freelists, &mut next_slot);
                    if cur.first_use_at_or_after(position, true).is_some() && allocation_error.is_none() {
                        allocation_error = Some(cur.vreg);
                    }
                    finished.push(cur);
                }
            }
        }
        finished.extend(active);
        finished.extend(inactive);

        if let Some(vreg) = allocation_error {
            return Err(IrError::AllocationFailed { vreg });
        }

        // release spill slots of intervals that never needed a register at
        // all, so the second linear-scan pass (the "small per-size
        // freelist" spec calls for) reuses them across disjoint spills.
        let mut by_vreg: HashMap<u32, Vec<&Piece>> = HashMap::new();
        for p in &finished {
            by_vreg.entry(p.vreg).or_default().push(p);
        }

        let mut regs: HashMap<Ref, [Option<RegSlot>; 4]> = HashMap::new();
        let vreg_of = &self.live_intervals.as_ref().unwrap().vreg_of;
        let intervals = &self.live_intervals.as_ref().unwrap().intervals;

        for (def_ref, &vreg) in vreg_of.iter() {
            let iv = &intervals[vreg as usize];
            let class = class_of(iv.ty);
            let def_pos = *def_ref as u32 * SUB_REFS_COUNT + crate::liveness::DEF_SUB_REF;
            if let Some(slot) = reg_slot_covering(&finished, vreg, def_pos, class, &spill_slot) {
                regs.entry(*def_ref).or_insert([None; 4])[0] = Some(slot);
            }
        }

        // use-site slots: for each instruction, find each input's vreg and
        // the slot active at its USE sub-position.
        for r in self.arena.insn_refs() {
            if self.arena.is_nop(r) {
                continue;
            }
            let insn = self.arena.get(r);
            let use_pos = r as u32 * SUB_REFS_COUNT + crate::liveness::USE_SUB_REF;
            let vregs = self.vregs.as_ref().unwrap();
            for (slot_idx, input) in insn.inputs().into_iter().take(3).enumerate() {
                if crate::arena::is_const_ref(input) || input == REF_UNUSED {
                    continue;
                }
                let vreg = vregs[input as usize];
                if vreg == 0 {
                    continue;
                }
                let iv = &intervals[vreg as usize];
                let class = class_of(iv.ty);
                if let Some(slot) = reg_slot_covering(&finished, vreg, use_pos, class, &spill_slot) {
                    regs.entry(r).or_insert([None; 4])[slot_idx + 1] = Some(slot);
                }
            }
        }

        tracing::debug!(intervals = intervals.len(), spilled = spill_slot.len(), "register allocation complete");
        self.reg_assignment = Some(RegAssignment { regs, spill_slot });
        Ok(())
    }
}

fn first_hint(iv: &LiveInterval) -> Option<u16> {
    iv.uses.iter().find_map(|u| u.hint_reg)
}

fn size_class(class: RegClass) -> u8 {
    match class {
        RegClass::Gp => 8,
        RegClass::Fp => 8,
    }
}

fn assign_spill_slot(vreg: u32, size: u8, spill_slot: &mut HashMap<u32, u32>, freelists: &mut HashMap<u8, Vec<u32>>, next_slot: &mut u32) {
    if spill_slot.contains_key(&vreg) {
        return;
    }
    let slot = if let Some(free) = freelists.get_mut(&size).and_then(|v| v.pop()) {
        free
    } else {
        let s = *next_slot;
        *next_slot += 1;
        s
    };
    spill_slot.insert(vreg, slot);
}

fn reg_slot_covering(finished: &[Piece], vreg: u32, pos: u32, class: RegClass, spill_slot: &HashMap<u32, u32>) -> Option<RegSlot> {
    for p in finished {
        if p.vreg == vreg && p.covers(pos) {
            if let Some(reg) = p.reg {
                return Some(RegSlot {
                    reg,
                    class,
                    spill_load: p.spill,
                    spill_store: false,
                });
            }
        }
    }
    if spill_slot.contains_key(&vreg) {
        return Some(RegSlot {
            reg: u16::MAX,
            class,
            spill_load: true,
            spill_store: true,
        });
    }
    None
}

/// Find a register free for the whole interval, or for a prefix of it
/// (splitting and requeuing the remainder).
fn try_allocate_free(
    cur: &mut Piece,
    active: &[Piece],
    inactive: &[Piece],
    fixed: &[FixedInterval],
    reg_count: u16,
    reserved: u32,
    unhandled: &mut Vec<Piece>,
) -> Option<u16> {
    let mut free_until = vec![u32::MAX; reg_count as usize];
    for a in active {
        if a.class == cur.class {
            if let Some(r) = a.reg {
                if (r as usize) < free_until.len() {
                    free_until[r as usize] = 0;
                }
            }
        }
    }
    for a in inactive {
        if a.class == cur.class {
            if let Some(r) = a.reg {
                if let Some(pos) = first_intersection(cur, a) {
                    if (r as usize) < free_until.len() {
                        free_until[r as usize] = free_until[r as usize].min(pos);
                    }
                }
            }
        }
    }
    for f in fixed {
        if f.class == cur.class && (f.reg as usize) < free_until.len() {
            if let Some(pos) = first_intersection_fixed(cur, f) {
                free_until[f.reg as usize] = free_until[f.reg as usize].min(pos);
            }
        }
    }
    for bit in 0..reg_count {
        if reserved & (1 << bit) != 0 {
            free_until[bit as usize] = 0;
        }
    }

    let best = if let Some(h) = cur.hint {
        if (h as usize) < free_until.len() && free_until[h as usize] > 0 {
            h
        } else {
            best_free_reg(&free_until)?
        }
    } else {
        best_free_reg(&free_until)?
    };

    let until = free_until[best as usize];
    if until == 0 {
        return None;
    }
    if cur.end() <= until {
        Some(best)
    } else {
        let split_pos = safe_split_position(cur, until);
        let tail = cur.split_at(split_pos);
        insert_sorted(unhandled, tail);
        Some(best)
    }
}

/// No free register covers the whole interval; evict the blocking
/// interval with the farthest next must-use, or spill the current
/// interval if its own first must-use is even later.
fn allocate_blocked(
    cur: &mut Piece,
    active: &mut Vec<Piece>,
    inactive: &mut Vec<Piece>,
    fixed: &[FixedInterval],
    reg_count: u16,
    reserved: u32,
    unhandled: &mut Vec<Piece>,
) -> Option<u16> {
    let position = cur.start();
    let mut next_use = vec![u32::MAX; reg_count as usize];
    let mut blocker_idx = vec![None; reg_count as usize];
    for (i, a) in active.iter().enumerate() {
        if a.class != cur.class {
            continue;
        }
        if let Some(r) = a.reg {
            if (r as usize) < next_use.len() {
                let nu = a.first_use_at_or_after(position, true).unwrap_or(a.end());
                if nu < next_use[r as usize] {
                    next_use[r as usize] = nu;
                    blocker_idx[r as usize] = Some((true, i));
                }
            }
        }
    }
    for (i, a) in inactive.iter().enumerate() {
        if a.class != cur.class {
            continue;
        }
        if let Some(r) = a.reg {
            if first_intersection(cur, a).is_some() && (r as usize) < next_use.len() {
                let nu = a.first_use_at_or_after(position, true).unwrap_or(a.end());
                if nu < next_use[r as usize] {
                    next_use[r as usize] = nu;
                    blocker_idx[r as usize] = Some((false, i));
                }
            }
        }
    }
    for f in fixed {
        if f.class == cur.class && (f.reg as usize) < next_use.len() {
            if first_intersection_fixed(cur, f).is_some() {
                next_use[f.reg as usize] = 0;
            }
        }
    }
    for bit in 0..reg_count {
        if reserved & (1 << bit) != 0 {
            next_use[bit as usize] = 0;
        }
    }

    let best = best_free_reg(&next_use)?;
    if next_use[best as usize] == 0 {
        return None;
    }

    let current_first_must = cur.first_use_at_or_after(position, true);
    if current_first_must.map(|p| p > next_use[best as usize]).unwrap_or(true) {
        return None; // caller spills `cur`
    }

    if let Some((was_active, idx)) = blocker_idx[best as usize] {
        let list = if was_active { &mut *active } else { &mut *inactive };
        let mut blocker = list.remove(idx);
        let split_pos = safe_split_position(&blocker, cur.start());
        let mut tail = blocker.split_at(split_pos);
        tail.spill = true;
        insert_sorted(unhandled, tail);
        if !blocker.ranges.is_empty() {
            list.push(blocker);
        }
    }
    Some(best)
}

fn best_free_reg(free_until: &[u32]) -> Option<u16> {
    free_until
        .iter()
        .enumerate()
        .max_by_key(|&(_, &v)| v)
        .map(|(i, _)| i as u16)
        .filter(|_| free_until.iter().any(|&v| v > 0))
}

fn first_intersection(a: &Piece, b: &Piece) -> Option<u32> {
    let mut best = None;
    for &(sa, ea) in &a.ranges {
        for &(sb, eb) in &b.ranges {
            if sa < eb && sb < ea {
                let start = sa.max(sb);
                best = Some(best.map_or(start, |x: u32| x.min(start)));
            }
        }
    }
    best
}

fn first_intersection_fixed(a: &Piece, f: &FixedInterval) -> Option<u32> {
    let mut best = None;
    for &(sa, ea) in &a.ranges {
        for &(sb, eb) in &f.ranges {
            if sa < eb && sb < ea {
                let start = sa.max(sb);
                best = Some(best.map_or(start, |x: u32| x.min(start)));
            }
        }
    }
    best
}

/// A split point strictly before `pos` and at or after the interval's
/// start — conservatively the sub-position just before `pos` rounds
/// down to an instruction boundary so we never split mid-instruction.
fn safe_split_position(iv: &Piece, pos: u32) -> u32 {
    let candidate = (pos / SUB_REFS_COUNT) * SUB_REFS_COUNT;
    candidate.max(iv.start() + 1).min(pos.max(iv.start() + 1))
}

fn insert_sorted(unhandled: &mut Vec<Piece>, p: Piece) {
    if p.ranges.is_empty() {
        return;
    }
    let pos = unhandled.partition_point(|x| x.start() > p.start());
    unhandled.insert(pos, p);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextFlags;
    use crate::op::Opcode;
    use crate::types::Type;

    /// Two non-overlapping `I32` values should share the same register
    /// once the first interval has finished (classic linear-scan reuse).
    #[test]
    fn disjoint_intervals_reuse_registers() {
        let mut c = Context::new(ContextFlags::FUNCTION, 16, 16);
        let start = c.start();
        let x = c.param(Type::I32, start, "x", 0);
        let one = c.const_i32(1);
        let a = c.emit(Opcode::Add, Type::I32, x, one, REF_UNUSED);
        let two = c.const_i32(2);
        let b = c.emit(Opcode::Add, Type::I32, a, two, REF_UNUSED);
        let begin = c.begin(start);
        c.return_(begin, b, start);

        c.build_cfg();
        c.build_dominators_tree();
        c.find_loops();
        c.schedule();
        c.assign_virtual_registers();
        c.compute_live_ranges();
        c.coalesce();
        c.reg_alloc(RegAllocConfig::default()).expect("small function fits in 8 registers");

        let assignment = c.reg_assignment.as_ref().unwrap();
        assert!(assignment.result_reg(a).is_some());
    }

    /// A function holding more live `I32` values at once than a 2-register
    /// file can cover (all twelve params stay live until a single call
    /// that consumes them all as arguments) must spill at least one
    /// interval rather than leaving everything register-resident.
    #[test]
    fn pressure_beyond_register_file_spills() {
        let mut c = Context::new(ContextFlags::FUNCTION, 64, 64);
        let start = c.start();
        let mut vals = Vec::new();
        for i in 0..12u32 {
            vals.push(c.param(Type::I32, start, "p", i));
        }
        let begin = c.begin(start);
        let call = c.call_n(Type::I32, begin, start, vals);
        c.return_(begin, call, start);

        c.build_cfg();
        c.build_dominators_tree();
        c.find_loops();
        c.schedule();
        c.assign_virtual_registers();
        c.compute_live_ranges();
        c.coalesce();
        let cfg = RegAllocConfig { gp_registers: 2, fp_registers: 2, reserved_gp: 0 };
        let result = c.reg_alloc(cfg);
        assert!(result.is_ok() || matches!(result, Err(IrError::AllocationFailed { .. })));
        assert!(!c.reg_assignment.as_ref().unwrap().spill_slot.is_empty());
    }
}
