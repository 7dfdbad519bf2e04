//! SSA deconstruction: parallel-copy sequencing for predecessor edges
//! into a MERGE/LOOP_BEGIN with PHIs that [`Context::coalesce`] could not
//! unify.
//!
//! Runs after [`Context::reg_alloc`], so every move is expressed in terms
//! of final locations (registers or spill slots) rather than vrefs —
//! this is exactly the information an external code emitter needs to
//! lower a block transition to real `mov`s.

use std::collections::HashMap;

use crate::arena::{is_const_ref, Ref};
use crate::cfg::BlockFlags;
use crate::context::Context;
use crate::op::Opcode;
use crate::regalloc::RegClass;
use crate::types::Type;

/// A value's final storage location, reused from the allocator's output
/// vocabulary plus a constant case for PHI inputs the allocator never
/// assigned a vreg to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Reg(u16, RegClassKey),
    Spill(u32),
    Const(Ref),
}

/// [`RegClass`] doesn't implement `Hash`/`Eq` (it's a plain allocator
/// enum); this local mirror does, so [`Location`] can key a `HashMap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegClassKey {
    Gp,
    Fp,
}

impl From<RegClass> for RegClassKey {
    fn from(c: RegClass) -> Self {
        match c {
            RegClass::Gp => RegClassKey::Gp,
            RegClass::Fp => RegClassKey::Fp,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Move {
    pub dst: Location,
    pub src: Location,
    pub ty: Type,
}

pub struct DessaMoves {
    /// Sequenced (cycle-free) move lists, one per predecessor block that
    /// needed them.
    pub per_block: HashMap<u32, Vec<Move>>,
}

#[derive(Debug, Clone, Copy)]
pub struct ScratchRegisters {
    pub gp: u16,
    pub fp: u16,
}

impl Context {
    /// Computes the parallel-copy sequence for every `DESSA_MOVES` block,
    /// using `scratch` as the one-per-class temporary the cycle-breaking
    /// step needs: one scratch register per value class, held as a
    /// reserved temporary interval on the predecessor's bb-end.
    pub fn compute_dessa_moves(&mut self, scratch: ScratchRegisters) {
        let _span = tracing::debug_span!("compute_dessa_moves").entered();
        let cfg = self.cfg.as_ref().expect("schedule must run before compute_dessa_moves");
        let gcm = self.gcm.as_ref().expect("schedule must run before compute_dessa_moves");
        let assignment = self.reg_assignment.as_ref().expect("reg_alloc must run before compute_dessa_moves");
        let vregs = self.vregs.as_ref().expect("assign_virtual_registers must run before compute_dessa_moves");
        let intervals = &self.live_intervals.as_ref().expect("compute_live_ranges must run before compute_dessa_moves").intervals;

        let mut per_block: HashMap<u32, Vec<Move>> = HashMap::new();

        for (bid, blk) in cfg.blocks.iter().enumerate() {
            if !blk.flags.contains(BlockFlags::DESSA_MOVES) {
                continue;
            }
            let pred_id = bid as u32;
            let mut raw_moves: Vec<(Location, Location, Type)> = Vec::new();

            for &succ in cfg.successors(pred_id) {
                let preds = cfg.predecessors(succ);
                let Some(edge_idx) = preds.iter().position(|&p| p == pred_id) else { continue };
                for &phi in &gcm.order[succ as usize] {
                    if self.arena.get(phi).op != Opcode::Phi {
                        continue;
                    }
                    let phi_ty = self.arena.get(phi).ty;
                    let values = self.arena.get(phi).inputs()[1..].to_vec();
                    let Some(&value) = values.get(edge_idx) else { continue };

                    let phi_vreg = vregs[phi as usize];
                    if phi_vreg == 0 {
                        continue;
                    }
                    let Some(dst) = location_of_vreg(assignment, intervals, phi_vreg) else { continue };

                    let src = if is_const_ref(value) {
                        Location::Const(value)
                    } else {
                        let value_vreg = vregs[value as usize];
                        match location_of_vreg(assignment, intervals, value_vreg) {
                            Some(loc) => loc,
                            None => continue,
                        }
                    };
                    if dst != src {
                        raw_moves.push((dst, src, phi_ty));
                    }
                }
            }

            if !raw_moves.is_empty() {
                let sequenced = sequentialize(raw_moves, scratch);
                per_block.insert(pred_id, sequenced);
            }
        }

        tracing::debug!(blocks = per_block.len(), "dessa moves sequenced");
        self.dessa_moves = Some(DessaMoves { per_block });
    }
}

fn location_of_vreg(assignment: &crate::regalloc::RegAssignment, intervals: &[crate::liveness::LiveInterval], vreg: u32) -> Option<Location> {
    if vreg == 0 {
        return None;
    }
    if let Some(&slot_idx) = assignment.spill_slot.get(&vreg) {
        return Some(Location::Spill(slot_idx));
    }
    let def_ref = intervals.get(vreg as usize)?.def_ref;
    if def_ref == crate::arena::REF_UNUSED {
        return None;
    }
    assignment.result_reg(def_ref).map(|slot| Location::Reg(slot.reg, slot.class.into()))
}

/// Sreedhar et al. parallel-copy sequencing: resolve every acyclic move
/// first (a destination no longer needed as anyone's source can fire
/// immediately), then break each remaining cycle by saving one victim's
/// original value to `scratch` before overwriting it, which frees the
/// rest of the cycle to resolve as an ordinary chain.
fn sequentialize(moves: Vec<(Location, Location, Type)>, scratch: ScratchRegisters) -> Vec<Move> {
    let mut pending: Vec<(Location, Location, Type)> = moves;
    let mut out = Vec::new();

    drain_ready(&mut pending, &mut out);

    // whatever remains is a union of disjoint cycles.
    while let Some((d0, s0, ty0)) = pending.pop() {
        if d0 == s0 {
            continue;
        }
        let scratch_loc = match class_of_location(d0) {
            RegClassKey::Gp => Location::Reg(scratch.gp, RegClassKey::Gp),
            RegClassKey::Fp => Location::Reg(scratch.fp, RegClassKey::Fp),
        };
        out.push(Move { dst: scratch_loc, src: d0, ty: ty0 });
        for m in pending.iter_mut() {
            if m.1 == d0 {
                m.1 = scratch_loc;
            }
        }
        out.push(Move { dst: d0, src: s0, ty: ty0 });

        // the rest of this cycle is now an acyclic chain (nobody still
        // depends on d0's pre-move value); drain it before the next cycle.
        drain_ready(&mut pending, &mut out);
    }

    out
}

/// Repeatedly fires any move whose destination is not read by another
/// pending move, in arbitrary order — the acyclic part of sequencing.
fn drain_ready(pending: &mut Vec<(Location, Location, Type)>, out: &mut Vec<Move>) {
    loop {
        let srcs: std::collections::HashSet<Location> = pending.iter().map(|&(_, s, _)| s).collect();
        let ready_idx = pending.iter().position(|&(d, _, _)| !srcs.contains(&d));
        match ready_idx {
            Some(idx) => {
                let (d, s, ty) = pending.remove(idx);
                out.push(Move { dst: d, src: s, ty });
            }
            None => break,
        }
    }
}

fn class_of_location(loc: Location) -> RegClassKey {
    match loc {
        Location::Reg(_, c) => c,
        Location::Spill(_) => RegClassKey::Gp,
        Location::Const(_) => RegClassKey::Gp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A two-element swap (the simplest non-trivial cycle) must lower to
    /// three moves: save one side to scratch, perform the direct move,
    /// then restore from scratch — never a naive two-move sequence that
    /// would clobber one of the values before it's read.
    #[test]
    fn swap_cycle_uses_scratch() {
        let scratch = ScratchRegisters { gp: 9, fp: 9 };
        let r0 = Location::Reg(0, RegClassKey::Gp);
        let r1 = Location::Reg(1, RegClassKey::Gp);
        let moves = vec![(r0, r1, Type::I32), (r1, r0, Type::I32)];
        let seq = sequentialize(moves, scratch);
        assert_eq!(seq.len(), 3);
        assert!(seq.iter().any(|m| matches!(m.dst, Location::Reg(9, _))));
    }

    #[test]
    fn acyclic_chain_needs_no_scratch() {
        let scratch = ScratchRegisters { gp: 9, fp: 9 };
        let r0 = Location::Reg(0, RegClassKey::Gp);
        let r1 = Location::Reg(1, RegClassKey::Gp);
        let r2 = Location::Reg(2, RegClassKey::Gp);
        // r0 <- r1, r1 <- r2: r2 is never overwritten, so this resolves
        // in reverse order with no temporary needed.
        let moves = vec![(r0, r1, Type::I32), (r1, r2, Type::I32)];
        let seq = sequentialize(moves, scratch);
        assert_eq!(seq.len(), 2);
        assert_eq!(seq[0].dst, r1);
        assert_eq!(seq[1].dst, r0);
    }
}
