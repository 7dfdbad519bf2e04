//! Virtual-register assignment, live-range construction, and SSA
//! out-of-form coalescing.
//!
//! Positions are a synthetic space where each instruction occupies
//! [`SUB_REFS_COUNT`] sub-positions (LOAD, USE, DEF, SAVE), matching the
//! source's `IR_LIVE_POS_*` macros exactly — this is what lets the
//! allocator tell "read at this instruction" from "written at this
//! instruction" apart on the same ref.

use std::collections::HashMap;

use crate::arena::{is_const_ref, Ref, REF_UNUSED};
use crate::context::Context;
use crate::op::Opcode;
use crate::types::Type;

pub const SUB_REFS_COUNT: u32 = 4;
pub const LOAD_SUB_REF: u32 = 0;
pub const USE_SUB_REF: u32 = 1;
pub const DEF_SUB_REF: u32 = 2;
pub const SAVE_SUB_REF: u32 = 3;

/// A single contiguous live range `[start, end)` in the synthetic
/// position space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveRange {
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UseFlag {
    MustBeInReg,
    ShouldBeInReg,
    ReusesOp1,
    PhiUse,
}

#[derive(Debug, Clone, Copy)]
pub struct UsePosition {
    pub pos: u32,
    pub flag: UseFlag,
    pub hint_reg: Option<u16>,
}

pub struct LiveInterval {
    pub vreg: u32,
    pub ty: Type,
    pub ranges: Vec<LiveRange>,
    pub uses: Vec<UsePosition>,
    pub def_ref: Ref,
    pub assigned_reg: Option<u16>,
    pub spill_slot: Option<u32>,
}

impl LiveInterval {
    pub fn start(&self) -> u32 {
        self.ranges.first().map(|r| r.start).unwrap_or(u32::MAX)
    }
    pub fn end(&self) -> u32 {
        self.ranges.last().map(|r| r.end).unwrap_or(0)
    }
    pub fn covers(&self, pos: u32) -> bool {
        self.ranges.iter().any(|r| pos >= r.start && pos < r.end)
    }
    /// First gap boundary at or after `pos` where the interval is not
    /// live — a candidate split point for the register allocator.
    pub fn next_hole_after(&self, pos: u32) -> Option<u32> {
        for w in self.ranges.windows(2) {
            if w[0].end >= pos {
                return Some(w[0].end);
            }
        }
        None
    }
}

pub struct LiveIntervals {
    pub intervals: Vec<LiveInterval>,
    /// def ref -> vreg number, after coalescing renames.
    pub vreg_of: HashMap<Ref, u32>,
}

impl LiveIntervals {
    pub fn interval_mut(&mut self, vreg: u32) -> &mut LiveInterval {
        &mut self.intervals[vreg as usize]
    }
    pub fn interval(&self, vreg: u32) -> &LiveInterval {
        &self.intervals[vreg as usize]
    }
}

impl Context {
    /// Assigns a vreg to every data-producing ref with at least one use
    /// (mem-producing refs need more than one use, since the single-use
    /// case can always fold into its consumer).
    pub fn assign_virtual_registers(&mut self) {
        let _span = tracing::debug_span!("assign_virtual_registers").entered();
        let uses = self.use_lists.as_ref().expect("build_def_use_lists must run first");
        let mut vregs = vec![0u32; self.arena.insns_count()];
        let mut next = 1u32;
        for r in self.arena.insn_refs() {
            if self.arena.is_nop(r) {
                continue;
            }
            let insn = self.arena.get(r);
            if insn.op.desc().class == crate::op::OpClass::Control {
                continue;
            }
            let count = uses.use_count(r);
            let is_mem = matches!(
                insn.op.desc().class,
                crate::op::OpClass::MemLoad | crate::op::OpClass::MemStore | crate::op::OpClass::MemCall | crate::op::OpClass::MemAlloc
            );
            let needs_vreg = if is_mem { count > 1 } else { count > 0 };
            if needs_vreg && insn.ty != Type::Void {
                vregs[r as usize] = next;
                next += 1;
            }
        }
        tracing::debug!(vreg_count = next - 1, "virtual registers assigned");
        self.vregs = Some(vregs);
    }

    /// Builds live ranges via a backward walk over blocks in reverse
    /// topological (i.e. reverse scheduled) order, extending each vreg's
    /// range from its last use back to its def.
    /// Requires [`Context::schedule`] and [`Context::assign_virtual_registers`].
    pub fn compute_live_ranges(&mut self) {
        let _span = tracing::debug_span!("compute_live_ranges").entered();
        let gcm = self.gcm.as_ref().expect("schedule must run before compute_live_ranges");
        let cfg = self.cfg.as_ref().unwrap();
        let vregs = self.vregs.as_ref().expect("assign_virtual_registers must run first").clone();

        let n_vregs = vregs.iter().copied().max().unwrap_or(0) as usize + 1;
        let mut open: Vec<Vec<LiveRange>> = vec![Vec::new(); n_vregs];
        let mut uses: Vec<Vec<UsePosition>> = vec![Vec::new(); n_vregs];
        let mut def_ref_of: Vec<Ref> = vec![REF_UNUSED; n_vregs];
        let mut live: Vec<std::collections::HashSet<u32>> = vec![Default::default(); cfg.blocks.len()];

        // reverse topological block order: reverse of the dominator
        // preorder is a valid reverse-postorder approximation here since
        // `gcm.order` already reflects the scheduled (forward) sequence.
        let block_order: Vec<u32> = (0..cfg.blocks.len() as u32).rev().collect();

        for &bid in &block_order {
            let block = &cfg.blocks[bid as usize];
            let mut cur_live: std::collections::HashSet<u32> = cfg
                .successors(bid)
                .iter()
                .flat_map(|&s| live[s as usize].iter().copied())
                .collect();
            // seed PHI inputs of successors corresponding to this block
            for &s in cfg.successors(bid) {
                let s_start = cfg.blocks[s as usize].start;
                for &phi in &gcm.order[s as usize] {
                    if self.arena.get(phi).op != Opcode::Phi {
                        continue;
                    }
                    let preds = cfg.predecessors(s);
                    if let Some(i) = preds.iter().position(|&p| p == bid) {
                        let values = &self.arena.get(phi).inputs()[1..];
                        if let Some(&v) = values.get(i) {
                            if !is_const_ref(v) && v != REF_UNUSED {
                                let vg = vregs[v as usize];
                                if vg != 0 {
                                    cur_live.insert(vg);
                                }
                            }
                        }
                    }
                    let _ = s_start;
                }
            }
            for &vg in &cur_live {
                open_or_extend(&mut open, vg, block_start_pos(block.start), block_end_pos(block.end));
            }

            let order = gcm.order[bid as usize].clone();
            for &r in order.iter().rev() {
                if self.arena.is_nop(r) {
                    continue;
                }
                let insn = self.arena.get(r);
                let def_vreg = vregs[r as usize];
                let def_pos = r as u32 * SUB_REFS_COUNT + DEF_SUB_REF;
                if def_vreg != 0 {
                    shrink_start(&mut open[def_vreg as usize], def_pos);
                    def_ref_of[def_vreg as usize] = r;
                    cur_live.remove(&def_vreg);
                }

                if insn.op == Opcode::Phi {
                    continue; // PHI's own inputs are consumed on predecessor edges, not here
                }
                let use_pos = r as u32 * SUB_REFS_COUNT + USE_SUB_REF;
                for (slot, input) in insn.inputs().into_iter().enumerate() {
                    if is_const_ref(input) || input == REF_UNUSED {
                        continue;
                    }
                    let vg = vregs[input as usize];
                    if vg == 0 {
                        continue;
                    }
                    open_or_extend(&mut open, vg, use_pos + 1, use_pos + 1);
                    extend_start_to_block(&mut open[vg as usize], block_start_pos(block.start));
                    cur_live.insert(vg);
                    let flag = if slot == 0 && reuses_op1(insn.op) { UseFlag::ReusesOp1 } else { UseFlag::MustBeInReg };
                    uses[vg as usize].push(UsePosition { pos: use_pos, flag, hint_reg: None });
                }
            }
            live[bid as usize] = cur_live;
        }

        // loop-header live sets propagate to every block inside the loop
        for (bid, blk) in cfg.blocks.iter().enumerate() {
            if let Some(h) = blk.loop_header {
                if h != bid as u32 {
                    let header_live: Vec<u32> = live[h as usize].iter().copied().collect();
                    for vg in header_live {
                        let (s, e) = (block_start_pos(blk.start), block_end_pos(blk.end));
                        open_or_extend(&mut open, vg, s, e);
                    }
                }
            }
        }

        let mut intervals = Vec::with_capacity(n_vregs);
        for vg in 0..n_vregs {
            let mut ranges = open[vg].clone();
            ranges.sort_by_key(|r| r.start);
            merge_overlapping(&mut ranges);
            let mut u = uses[vg].clone();
            u.sort_by_key(|p| p.pos);
            let ty = if def_ref_of[vg] != REF_UNUSED { self.arena.get(def_ref_of[vg]).ty } else { Type::I64 };
            intervals.push(LiveInterval {
                vreg: vg as u32,
                ty,
                ranges,
                uses: u,
                def_ref: def_ref_of[vg],
                assigned_reg: None,
                spill_slot: None,
            });
        }

        let vreg_of = self.vregs.as_ref().unwrap().iter().enumerate().filter(|&(_, &v)| v != 0).map(|(r, &v)| (r as Ref, v)).collect();

        tracing::debug!(vregs = n_vregs.saturating_sub(1), "live ranges computed");
        self.live_intervals = Some(LiveIntervals { intervals, vreg_of });
    }

    /// Coalesces each PHI's vreg with its incoming values' vregs when
    /// their live ranges don't overlap, renaming one to the other and
    /// concatenating their range lists; edges that can't be coalesced
    /// mark the predecessor block DESSA_MOVES.
    pub fn coalesce(&mut self) {
        let _span = tracing::debug_span!("coalesce").entered();
        let cfg_len = self.cfg.as_ref().unwrap().blocks.len();
        let mut dessa_needed = vec![false; cfg_len];

        let phi_refs: Vec<(Ref, Ref, Vec<u32>)> = {
            let cfg = self.cfg.as_ref().unwrap();
            let gcm = self.gcm.as_ref().unwrap();
            let vregs = self.vregs.as_ref().unwrap();
            let mut v = Vec::new();
            for bid in 0..cfg.blocks.len() as u32 {
                for &r in &gcm.order[bid as usize] {
                    if self.arena.get(r).op == Opcode::Phi {
                        let preds = cfg.predecessors(bid).to_vec();
                        v.push((r, self.arena.get(r).op1, preds.iter().map(|&p| p).collect::<Vec<_>>()));
                        let _ = vregs;
                    }
                }
            }
            v
        };

        for (phi, region, preds) in phi_refs {
            let values: Vec<Ref> = self.arena.get(phi).inputs()[1..].to_vec();
            let _ = region;
            for (i, &v) in values.iter().enumerate() {
                if is_const_ref(v) || v == REF_UNUSED {
                    if i < preds.len() {
                        dessa_needed[preds[i] as usize] = true;
                    }
                    continue;
                }
                let phi_vreg = self.vregs.as_ref().unwrap()[phi as usize];
                let val_vreg = self.vregs.as_ref().unwrap()[v as usize];
                if phi_vreg == 0 || val_vreg == 0 || phi_vreg == val_vreg {
                    continue;
                }
                if self.ranges_disjoint(phi_vreg, val_vreg) {
                    self.merge_vregs(val_vreg, phi_vreg);
                } else if i < preds.len() {
                    dessa_needed[preds[i] as usize] = true;
                }
            }
        }

        let cfg = self.cfg.as_mut().unwrap();
        for (bid, needed) in dessa_needed.into_iter().enumerate() {
            if needed {
                cfg.blocks[bid].flags.insert(crate::cfg::BlockFlags::DESSA_MOVES);
            } else {
                cfg.blocks[bid].flags.remove(crate::cfg::BlockFlags::DESSA_MOVES);
            }
        }
    }

    fn ranges_disjoint(&self, a: u32, b: u32) -> bool {
        let li = self.live_intervals.as_ref().unwrap();
        let ia = li.interval(a);
        let ib = li.interval(b);
        for ra in &ia.ranges {
            for rb in &ib.ranges {
                if ra.start < rb.end && rb.start < ra.end {
                    return false;
                }
            }
        }
        true
    }

    /// Renames every reference to `from` into `to` across the vreg map
    /// and concatenates their range/use lists.
    fn merge_vregs(&mut self, from: u32, to: u32) {
        if from == to {
            return;
        }
        if let Some(vregs) = self.vregs.as_mut() {
            for v in vregs.iter_mut() {
                if *v == from {
                    *v = to;
                }
            }
        }
        let li = self.live_intervals.as_mut().unwrap();
        let (from_ranges, from_uses) = {
            let from_iv = &li.intervals[from as usize];
            (from_iv.ranges.clone(), from_iv.uses.clone())
        };
        {
            let to_iv = &mut li.intervals[to as usize];
            to_iv.ranges.extend(from_ranges);
            to_iv.ranges.sort_by_key(|r| r.start);
            merge_overlapping(&mut to_iv.ranges);
            to_iv.uses.extend(from_uses);
            to_iv.uses.sort_by_key(|p| p.pos);
        }
        li.intervals[from as usize].ranges.clear();
        li.intervals[from as usize].uses.clear();
        for (_, v) in li.vreg_of.iter_mut() {
            if *v == from {
                *v = to;
            }
        }
    }
}

fn block_start_pos(start_ref: Ref) -> u32 {
    start_ref as u32 * SUB_REFS_COUNT
}
fn block_end_pos(end_ref: Ref) -> u32 {
    end_ref as u32 * SUB_REFS_COUNT + SUB_REFS_COUNT
}

fn reuses_op1(op: Opcode) -> bool {
    matches!(op, Opcode::Add | Opcode::Sub | Opcode::And | Opcode::Or | Opcode::Xor)
}

fn open_or_extend(open: &mut [Vec<LiveRange>], vg: u32, start: u32, end: u32) {
    open[vg as usize].push(LiveRange { start, end: end.max(start) });
}

fn shrink_start(ranges: &mut [LiveRange], new_start: u32) {
    if let Some(last) = ranges.last_mut() {
        if new_start < last.end {
            last.start = new_start;
        }
    }
}

fn extend_start_to_block(ranges: &mut Vec<LiveRange>, block_start: u32) {
    if let Some(first) = ranges.first_mut() {
        if block_start < first.start {
            first.start = block_start;
        }
    }
}

fn merge_overlapping(ranges: &mut Vec<LiveRange>) {
    if ranges.is_empty() {
        return;
    }
    let mut merged = vec![ranges[0]];
    for &r in &ranges[1..] {
        let last = merged.last_mut().unwrap();
        if r.start <= last.end {
            last.end = last.end.max(r.end);
        } else {
            merged.push(r);
        }
    }
    *ranges = merged;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextFlags;
    use crate::types::Type;

    /// A diamond merging a value via PHI where both inputs have
    /// disjoint live ranges must coalesce all three vregs and clear
    /// DESSA_MOVES on both predecessor blocks.
    #[test]
    fn coalescing_unifies_phi_vregs() {
        let mut c = Context::new(ContextFlags::FUNCTION, 32, 32);
        let start = c.start();
        let cond = c.param(Type::Bool, start, "c", 0);
        let entry = c.begin(start);
        let if_ref = c.if_(entry, cond);
        let t = c.if_true(if_ref);
        let f = c.if_false(if_ref);
        let x = c.param(Type::I32, start, "x", 1);
        let one = c.const_i32(1);
        let a = c.emit(Opcode::Add, Type::I32, x, one, REF_UNUSED);
        let b = c.emit(Opcode::Sub, Type::I32, x, one, REF_UNUSED);
        let end_t = c.emit(Opcode::End, Type::Void, t, REF_UNUSED, REF_UNUSED);
        let end_f = c.emit(Opcode::End, Type::Void, f, REF_UNUSED, REF_UNUSED);
        let merge = c.merge(vec![end_t, end_f]);
        let phi = c.phi(Type::I32, merge, vec![a, b]);
        c.return_(merge, phi, start);

        c.build_cfg();
        c.build_dominators_tree();
        c.find_loops();
        c.schedule();
        c.assign_virtual_registers();
        c.compute_live_ranges();
        c.coalesce();

        let vregs = c.vregs.as_ref().unwrap();
        assert_eq!(vregs[a as usize], vregs[phi as usize]);
        assert_eq!(vregs[b as usize], vregs[phi as usize]);
    }
}
