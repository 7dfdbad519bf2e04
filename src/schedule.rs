//! Global Code Motion and per-block scheduling.
//!
//! GCM assigns every floating data node to a basic block; the scheduler
//! then fixes an execution order within each block. The source finishes
//! by physically renumbering the arena so ref order matches block order
//! (cheap pointer-comparison checks downstream). We keep the arena's ref
//! numbering stable and instead record the finalized order as an
//! auxiliary table (`GcmBlocks::order` + `position`) — every later pass
//! that needs "is `a` scheduled before `b`" asks `position`, which is
//! exactly as cheap as a ref comparison and avoids rewriting every
//! `Ref` field in the graph when a renumbering pass already has a
//! correctness-critical job to do (see DESIGN.md).

use std::collections::{HashMap, HashSet, VecDeque};

use crate::arena::{is_const_ref, Ref, REF_UNUSED};
use crate::context::{Context, ContextFlags};
use crate::op::{OpClass, Opcode};

/// GCM + scheduling output: a block assignment for every data node and
/// the finalized per-block instruction order.
pub struct GcmBlocks {
    /// Block id each instruction is placed in (control nodes are placed
    /// in their own block by construction; this covers floating nodes).
    pub block_of: Vec<Option<u32>>,
    /// Final per-block instruction order, pinned nodes (PARAM/VAR/PHI)
    /// first, bb-end last.
    pub order: Vec<Vec<Ref>>,
    /// ref -> (block, position-within-block), for fast "is `a` scheduled
    /// before `b`" queries used by liveness and the allocator.
    pub position: HashMap<Ref, (u32, u32)>,
}

impl GcmBlocks {
    pub fn block_of(&self, r: Ref) -> Option<u32> {
        self.block_of.get(r as usize).copied().flatten()
    }

    pub fn is_before(&self, a: Ref, b: Ref) -> bool {
        match (self.position.get(&a), self.position.get(&b)) {
            (Some(&(ba, pa)), Some(&(bb, pb))) => (ba, pa) < (bb, pb),
            _ => false,
        }
    }
}

impl Context {
    /// Pins control/mem/leaf nodes to their originating block and places
    /// every floating data node via the early/late split, leaving the
    /// result in `self.gcm` ready for [`Context::schedule`].
    pub fn gcm(&mut self) {
        let _span = tracing::debug_span!("gcm").entered();
        if self.cfg.is_none() {
            self.build_cfg();
        }
        if self.use_lists.is_none() {
            self.build_def_use_lists();
        }
        let n = self.arena.insns_count();
        let mut block_of: Vec<Option<u32>> = vec![None; n];

        self.pin_fixed_nodes(&mut block_of);
        let topo = self.data_topo_order(&block_of);
        self.schedule_early(&topo, &mut block_of);
        self.schedule_late(&topo, &mut block_of);

        tracing::debug!(placed = block_of.iter().filter(|b| b.is_some()).count(), "gcm placement complete");
        self.gcm = Some(GcmBlocks { block_of, order: Vec::new(), position: HashMap::new() });
    }

    /// Pins every control, PARAM/VAR/PHI/PI, and memory-touching node to
    /// the block it structurally belongs to.
    fn pin_fixed_nodes(&self, block_of: &mut [Option<u32>]) {
        let cfg = self.cfg.as_ref().unwrap();
        for (bid, blk) in cfg.blocks.iter().enumerate() {
            block_of[blk.start as usize] = Some(bid as u32);
            block_of[blk.end as usize] = Some(bid as u32);
        }
        // PHI and PARAM/VAR are pinned to the block owning their control region.
        for r in self.arena.insn_refs() {
            if self.arena.is_nop(r) {
                continue;
            }
            let insn = self.arena.get(r);
            match insn.op {
                Opcode::Phi => {
                    if let Some(b) = block_of[insn.op1 as usize] {
                        block_of[r as usize] = Some(b);
                    }
                }
                Opcode::Param | Opcode::Var => {
                    if !is_const_ref(insn.op1) && insn.op1 != REF_UNUSED {
                        if let Some(b) = block_of[insn.op1 as usize] {
                            block_of[r as usize] = Some(b);
                        }
                    }
                }
                _ if matches!(insn.op.desc().class, OpClass::MemLoad | OpClass::MemStore | OpClass::MemCall | OpClass::MemAlloc) => {
                    // memory ops carry a control-ref operand (op1) pinning them
                    // to the block that issued them.
                    if !is_const_ref(insn.op1) && insn.op1 != REF_UNUSED {
                        if let Some(b) = block_of[insn.op1 as usize] {
                            block_of[r as usize] = Some(b);
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Post-order over data inputs, used as the visitation order for
    /// both early and late scheduling.
    fn data_topo_order(&self, block_of: &[Option<u32>]) -> Vec<Ref> {
        let mut order = Vec::new();
        let mut visited = vec![false; self.arena.insns_count()];
        let mut work: Vec<(Ref, bool)> = self
            .arena
            .insn_refs()
            .filter(|&r| !self.arena.is_nop(r) && block_of[r as usize].is_none())
            .map(|r| (r, false))
            .collect();
        while let Some((r, expanded)) = work.pop() {
            if visited[r as usize] {
                continue;
            }
            if expanded {
                visited[r as usize] = true;
                order.push(r);
                continue;
            }
            work.push((r, true));
            for input in self.arena.get(r).inputs() {
                if !is_const_ref(input) && input != REF_UNUSED && block_of[input as usize].is_none() && !visited[input as usize] {
                    work.push((input, false));
                }
            }
        }
        order
    }

    /// Deepest dominator-depth block among a floating node's operand
    /// blocks — the earliest legal placement.
    fn schedule_early(&self, topo: &[Ref], block_of: &mut [Option<u32>]) {
        let cfg = self.cfg.as_ref().unwrap();
        for &r in topo {
            if block_of[r as usize].is_some() {
                continue;
            }
            let mut best = cfg.entry;
            let mut best_depth = cfg.blocks[cfg.entry as usize].dom_depth;
            for input in self.arena.get(r).inputs() {
                if is_const_ref(input) || input == REF_UNUSED {
                    continue;
                }
                if let Some(b) = block_of[input as usize] {
                    let d = cfg.blocks[b as usize].dom_depth;
                    if d > best_depth {
                        best = b;
                        best_depth = d;
                    }
                }
            }
            block_of[r as usize] = Some(best);
        }
    }

    /// LCA of use blocks (PHI uses mapped to the corresponding
    /// predecessor), then hoisted toward the shallowest loop depth
    /// between the late position and the early one.
    fn schedule_late(&self, topo: &[Ref], block_of: &mut [Option<u32>]) {
        let cfg = self.cfg.as_ref().unwrap();
        let uses = self.use_lists.as_ref().unwrap();
        for &r in topo.iter().rev() {
            let early = block_of[r as usize].unwrap_or(cfg.entry);
            let mut lca: Option<u32> = None;
            for &u in uses.uses_of(r) {
                if self.arena.is_nop(u) {
                    continue;
                }
                let u_insn = self.arena.get(u);
                let use_block = if u_insn.op == Opcode::Phi {
                    // map to the predecessor block corresponding to this
                    // operand's position in the PHI's value list.
                    let region = u_insn.op1;
                    let region_block = self.cfg.as_ref().unwrap().blocks.iter().position(|b| b.start == region || b.end == region).unwrap_or(0) as u32;
                    let values = &u_insn.inputs()[1..];
                    let pos = values.iter().position(|&v| v == r);
                    match pos {
                        Some(i) if i < cfg.predecessors(region_block).len() => cfg.predecessors(region_block)[i],
                        _ => region_block,
                    }
                } else {
                    block_of[u as usize].unwrap_or(early)
                };
                lca = Some(match lca {
                    None => use_block,
                    Some(cur) => lowest_common_ancestor(cfg, cur, use_block),
                });
            }
            let late = lca.unwrap_or(early);
            // walk from late up toward early, picking the shallowest loop depth
            let mut best = late;
            let mut best_depth = cfg.blocks[late as usize].loop_depth;
            let mut cur = late;
            while cur != early {
                let idom = match cfg.blocks[cur as usize].idom {
                    Some(i) if i != cur => i,
                    _ => break,
                };
                cur = idom;
                let d = cfg.blocks[cur as usize].loop_depth;
                if d <= best_depth {
                    best = cur;
                    best_depth = d;
                }
            }
            block_of[r as usize] = Some(best);
        }
    }

    /// Per-block local topological sort, fixing the final execution
    /// order, then stamps `position` for downstream passes.
    pub fn schedule(&mut self) {
        let _span = tracing::debug_span!("schedule").entered();
        if self.gcm.is_none() {
            self.gcm();
        }
        let cfg = self.cfg.as_ref().unwrap();
        let n_blocks = cfg.blocks.len();
        let block_of = self.gcm.as_ref().unwrap().block_of.clone();

        let mut members: Vec<Vec<Ref>> = vec![Vec::new(); n_blocks];
        for r in self.arena.insn_refs() {
            if self.arena.is_nop(r) {
                continue;
            }
            if let Some(b) = block_of[r as usize] {
                members[b as usize].push(r);
            }
        }

        let mut order = Vec::with_capacity(n_blocks);
        for (bid, refs) in members.into_iter().enumerate() {
            order.push(self.topo_sort_block(bid as u32, refs));
        }

        let mut position = HashMap::new();
        for (bid, refs) in order.iter().enumerate() {
            for (i, &r) in refs.iter().enumerate() {
                position.insert(r, (bid as u32, i as u32));
            }
        }

        let gcm = self.gcm.as_mut().unwrap();
        gcm.order = order;
        gcm.position = position;
        self.flags.insert(ContextFlags::LINEAR);
    }

    /// Orders one block's members: pinned leaves (PARAM/VAR/PHI) first,
    /// the bb-end last, everything else by a local topological sort that
    /// restarts at a def whenever it's found to occur later than one of
    /// its in-block uses.
    fn topo_sort_block(&self, bid: u32, refs: Vec<Ref>) -> Vec<Ref> {
        let cfg = self.cfg.as_ref().unwrap();
        let block = &cfg.blocks[bid as usize];
        let in_block: HashSet<Ref> = refs.iter().copied().collect();

        let mut leaders = Vec::new();
        let mut body = Vec::new();
        let mut end = None;
        for r in refs {
            if r == block.end {
                end = Some(r);
            } else if r == block.start || matches!(self.arena.get(r).op, Opcode::Phi | Opcode::Param | Opcode::Var) {
                leaders.push(r);
            } else {
                body.push(r);
            }
        }

        let mut placed: Vec<Ref> = Vec::with_capacity(body.len());
        let mut placed_set: HashSet<Ref> = HashSet::new();
        let mut queue: VecDeque<Ref> = body.into_iter().collect();
        let mut guard = 0usize;
        let max_guard = queue.len() * queue.len() + 1;
        while let Some(r) = queue.pop_front() {
            guard += 1;
            if guard > max_guard.max(1) {
                // malformed cyclic data dependency within a block; place
                // remaining refs in arbitrary but stable order rather than spin.
                placed.push(r);
                placed_set.insert(r);
                continue;
            }
            let ready = self.arena.get(r).inputs().into_iter().all(|inp| {
                !in_block.contains(&inp) || placed_set.contains(&inp) || leaders.contains(&inp)
            });
            if ready {
                placed_set.insert(r);
                placed.push(r);
            } else {
                queue.push_back(r);
            }
        }

        let mut out = Vec::with_capacity(leaders.len() + placed.len() + 1);
        out.extend(leaders);
        out.extend(placed);
        if let Some(e) = end {
            out.push(e);
        }
        out
    }
}

fn lowest_common_ancestor(cfg: &crate::cfg::Cfg, mut a: u32, mut b: u32) -> u32 {
    while cfg.blocks[a as usize].dom_depth > cfg.blocks[b as usize].dom_depth {
        a = cfg.blocks[a as usize].idom.unwrap_or(a);
    }
    while cfg.blocks[b as usize].dom_depth > cfg.blocks[a as usize].dom_depth {
        b = cfg.blocks[b as usize].idom.unwrap_or(b);
    }
    while a != b {
        a = cfg.blocks[a as usize].idom.unwrap_or(a);
        b = cfg.blocks[b as usize].idom.unwrap_or(b);
    }
    a
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextFlags;
    use crate::types::Type;

    #[test]
    fn floating_add_placed_in_entry_block() {
        let mut c = Context::new(ContextFlags::FUNCTION, 16, 16);
        let start = c.start();
        let x = c.param(Type::I32, start, "x", 0);
        let y = c.param(Type::I32, start, "y", 1);
        let sub = c.emit(Opcode::Sub, Type::I32, x, y, REF_UNUSED);
        let begin = c.begin(start);
        c.return_(begin, sub, start);

        c.build_cfg();
        c.build_dominators_tree();
        c.find_loops();
        c.schedule();

        let gcm = c.gcm.as_ref().unwrap();
        assert!(gcm.position.contains_key(&sub));
        let (block_of_sub, _) = gcm.position[&sub];
        assert_eq!(block_of_sub, c.cfg.as_ref().unwrap().entry);
        assert!(c.flags.contains(ContextFlags::LINEAR));
    }

    #[test]
    fn diamond_merge_value_scheduled_at_merge_block() {
        let mut c = Context::new(ContextFlags::FUNCTION, 32, 32);
        let start = c.start();
        let cond = c.param(Type::Bool, start, "c", 0);
        let entry = c.begin(start);
        let if_ref = c.if_(entry, cond);
        let t = c.if_true(if_ref);
        let f = c.if_false(if_ref);
        let one = c.const_i32(1);
        let two = c.const_i32(2);
        let end_t = c.emit(Opcode::End, Type::Void, t, REF_UNUSED, REF_UNUSED);
        let end_f = c.emit(Opcode::End, Type::Void, f, REF_UNUSED, REF_UNUSED);
        let merge = c.merge(vec![end_t, end_f]);
        let phi = c.phi(Type::I32, merge, vec![one, two]);
        c.return_(merge, phi, start);

        c.build_cfg();
        c.build_dominators_tree();
        c.find_loops();
        c.schedule();

        let gcm = c.gcm.as_ref().unwrap();
        let merge_block = c.cfg.as_ref().unwrap().blocks.iter().position(|b| b.start == merge).unwrap() as u32;
        assert_eq!(gcm.block_of(phi), Some(merge_block));
    }
}
