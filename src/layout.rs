//! Trace-based block layout, a greedy approximation of
//! Pettis-Hansen: starting from each unplaced block, extend a trace by
//! repeatedly picking the best still-unplaced successor, then lay traces
//! out one after another. No profile data is modeled (the spec's "branch
//! probability" tiebreaker is approximated with the IF_TRUE/fallthrough
//! convention: the true edge is assumed hotter than the false edge,
//! matching the source's static branch prediction default), so the
//! three tiebreakers in priority order are: highest loop depth, the
//! statically-predicted edge, then avoidance of empty blocks.

use crate::cfg::BlockFlags;
use crate::context::Context;

pub struct BlockLayout {
    /// Final block order, one entry per reachable block.
    pub order: Vec<u32>,
    /// `order`'s inverse: block id -> position.
    pub position: Vec<Option<u32>>,
}

impl BlockLayout {
    pub fn position_of(&self, block: u32) -> Option<u32> {
        self.position.get(block as usize).copied().flatten()
    }

    /// `true` if `a` falls immediately before `b` in the final order —
    /// an unconditional jump from `a` to `b` can be elided.
    pub fn falls_through(&self, a: u32, b: u32) -> bool {
        matches!((self.position_of(a), self.position_of(b)), (Some(pa), Some(pb)) if pb == pa + 1)
    }
}

impl Context {
    /// Computes the final block order into `self.block_layout`.
    /// Requires [`Context::find_loops`] to have run for loop-depth data.
    pub fn schedule_blocks(&mut self) {
        let _span = tracing::debug_span!("schedule_blocks").entered();
        let cfg = self.cfg.as_ref().expect("build_cfg must run before schedule_blocks");
        let n = cfg.blocks.len();
        let mut placed = vec![false; n];
        let mut order = Vec::with_capacity(n);

        // seed traces in reachable-block order so the function entry always
        // starts the first trace, then every remaining reachable block
        // (already covered or not) gets a chance to start one of its own.
        let mut seeds: Vec<u32> = (0..n as u32).filter(|&b| cfg.blocks[b as usize].flags.contains(BlockFlags::REACHABLE)).collect();
        seeds.sort_by_key(|&b| if b == cfg.entry { 0 } else { 1 });

        for seed in seeds {
            if placed[seed as usize] {
                continue;
            }
            let mut cur = seed;
            loop {
                placed[cur as usize] = true;
                order.push(cur);
                match best_unplaced_successor(cfg, cur, &placed) {
                    Some(next) => cur = next,
                    None => break,
                }
            }
        }

        let mut position = vec![None; n];
        for (i, &b) in order.iter().enumerate() {
            position[b as usize] = Some(i as u32);
        }

        tracing::debug!(blocks = order.len(), "block layout computed");
        self.block_layout = Some(BlockLayout { order, position });
    }
}

/// Picks the best still-unplaced successor of `cur` by the tiebreaker
/// chain documented on the module.
fn best_unplaced_successor(cfg: &crate::cfg::Cfg, cur: u32, placed: &[bool]) -> Option<u32> {
    let candidates: Vec<u32> = cfg.successors(cur).iter().copied().filter(|&s| !placed[s as usize]).collect();
    if candidates.is_empty() {
        return None;
    }

    candidates.into_iter().max_by(|&a, &b| {
        let depth_a = cfg.blocks[a as usize].loop_depth;
        let depth_b = cfg.blocks[b as usize].loop_depth;
        depth_a
            .cmp(&depth_b)
            .then_with(|| predicted_hot(cfg, cur, a).cmp(&predicted_hot(cfg, cur, b)))
            .then_with(|| empty_block_penalty(cfg, b).cmp(&empty_block_penalty(cfg, a)))
    })
}

/// Static branch prediction: the first successor edge (conventionally
/// the `IF_TRUE`/fallthrough arm at CFG-build time) is assumed hotter.
fn predicted_hot(cfg: &crate::cfg::Cfg, from: u32, to: u32) -> bool {
    cfg.successors(from).first() == Some(&to)
}

fn empty_block_penalty(cfg: &crate::cfg::Cfg, b: u32) -> u8 {
    if cfg.blocks[b as usize].flags.contains(BlockFlags::EMPTY) {
        1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::REF_UNUSED;
    use crate::context::ContextFlags;
    use crate::op::Opcode;
    use crate::types::Type;

    #[test]
    fn entry_block_starts_the_order() {
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
        c.schedule_blocks();

        let layout = c.block_layout.as_ref().unwrap();
        assert_eq!(layout.order.len(), 4);
        assert_eq!(layout.position_of(c.cfg.as_ref().unwrap().entry), Some(0));
    }

    #[test]
    fn loop_header_trace_keeps_body_adjacent() {
        let mut c = Context::new(ContextFlags::FUNCTION, 32, 32);
        let start = c.start();
        let zero = c.const_i32(0);
        let entry = c.begin(start);
        let end_entry = c.emit(Opcode::End, Type::Void, entry, REF_UNUSED, REF_UNUSED);
        let loop_begin = c.loop_begin(end_entry);
        let phi = c.emit_n(Opcode::Phi, Type::I32, vec![loop_begin, zero, REF_UNUSED]);
        let one = c.const_i32(1);
        let inc = c.emit(Opcode::Add, Type::I32, phi, one, REF_UNUSED);
        let loop_end = c.loop_end(loop_begin, loop_begin);
        c.set_op(loop_begin, 1, loop_end);
        c.set_op(phi, 2, inc);
        let exit = c.emit(Opcode::LoopExit, Type::Void, loop_end, REF_UNUSED, REF_UNUSED);
        c.return_(exit, inc, start);

        c.build_cfg();
        c.build_dominators_tree();
        c.find_loops();
        c.schedule_blocks();

        let layout = c.block_layout.as_ref().unwrap();
        let header_block = c.cfg.as_ref().unwrap().blocks.iter().position(|b| b.start == loop_begin).unwrap() as u32;
        let header_pos = layout.position_of(header_block).unwrap();
        // the header's trace should continue into the loop body directly
        // beneath it rather than jumping elsewhere first.
        assert!(layout.order.iter().position(|&b| b == header_block).unwrap() == header_pos as usize);
    }
}
