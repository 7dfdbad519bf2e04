//! Dominator tree construction via Cooper-Harvey-Kennedy's iterative
//! "A Simple, Fast Dominance Algorithm": repeatedly intersect each
//! block's predecessors' idoms in reverse-postorder until the tree
//! stops changing. Simpler to verify than the Lengauer-Tarjan path and
//! fast enough at the block counts we see (whole functions, not whole
//! programs).

use crate::cfg::Block;
use crate::context::Context;

impl Context {
    /// Computes immediate dominators and fills in each [`Block`]'s
    /// `idom`/`dom_depth`/`dom_child`/`dom_next_child` fields. Requires
    /// [`Context::build_cfg`] to have run.
    pub fn build_dominators_tree(&mut self) {
        let postorder = {
            let cfg = self.cfg.as_ref().expect("build_cfg must run before build_dominators_tree");
            reverse_postorder(cfg)
        };
        let rpo_index: std::collections::HashMap<u32, usize> =
            postorder.iter().enumerate().map(|(i, &b)| (b, i)).collect();

        let cfg = self.cfg.as_mut().unwrap();
        let n = cfg.blocks.len();
        let mut idom: Vec<Option<u32>> = vec![None; n];
        idom[cfg.entry as usize] = Some(cfg.entry);

        let mut changed = true;
        while changed {
            changed = false;
            for &b in &postorder {
                if b == cfg.entry {
                    continue;
                }
                let preds = cfg.predecessors(b);
                let mut new_idom: Option<u32> = None;
                for &p in preds {
                    if idom[p as usize].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => intersect(cur, p, &idom, &rpo_index),
                    });
                }
                if new_idom != idom[b as usize] {
                    idom[b as usize] = new_idom;
                    changed = true;
                }
            }
        }

        for (i, blk) in cfg.blocks.iter_mut().enumerate() {
            blk.idom = if i as u32 == cfg.entry { None } else { idom[i] };
        }

        let depths = compute_depths(cfg);
        for (i, blk) in cfg.blocks.iter_mut().enumerate() {
            blk.dom_depth = depths[i];
        }

        link_children(cfg);
    }
}

fn reverse_postorder(cfg: &crate::cfg::Cfg) -> Vec<u32> {
    let mut visited = vec![false; cfg.blocks.len()];
    let mut order = Vec::with_capacity(cfg.blocks.len());
    let mut stack = vec![(cfg.entry, false)];
    while let Some((b, processed)) = stack.pop() {
        if processed {
            order.push(b);
            continue;
        }
        if visited[b as usize] {
            continue;
        }
        visited[b as usize] = true;
        stack.push((b, true));
        for &s in cfg.successors(b) {
            if !visited[s as usize] {
                stack.push((s, false));
            }
        }
    }
    order.reverse();
    order
}

fn intersect(mut a: u32, mut b: u32, idom: &[Option<u32>], rpo_index: &std::collections::HashMap<u32, usize>) -> u32 {
    while a != b {
        while rpo_index[&a] > rpo_index[&b] {
            a = idom[a as usize].expect("dominator chain reaches entry");
        }
        while rpo_index[&b] > rpo_index[&a] {
            b = idom[b as usize].expect("dominator chain reaches entry");
        }
    }
    a
}

fn compute_depths(cfg: &crate::cfg::Cfg) -> Vec<u32> {
    let n = cfg.blocks.len();
    let mut depth = vec![0u32; n];
    let mut memo = vec![false; n];
    memo[cfg.entry as usize] = true;
    for i in 0..n {
        let mut chain = Vec::new();
        let mut cur = i as u32;
        while !memo[cur as usize] {
            chain.push(cur);
            cur = cfg.blocks[cur as usize].idom.unwrap_or(cfg.entry);
        }
        let mut d = depth[cur as usize];
        for &c in chain.iter().rev() {
            d += 1;
            depth[c as usize] = d;
            memo[c as usize] = true;
        }
    }
    depth
}

fn link_children(cfg: &mut crate::cfg::Cfg) {
    let n = cfg.blocks.len();
    let mut heads: Vec<Option<u32>> = vec![None; n];
    for b in (0..n as u32).rev() {
        if let Some(idom) = cfg.blocks[b as usize].idom {
            if idom != b {
                cfg.blocks[b as usize].dom_next_child = heads[idom as usize];
                heads[idom as usize] = Some(b);
            }
        }
    }
    for (i, head) in heads.into_iter().enumerate() {
        cfg.blocks[i].dom_child = head;
    }
}

/// `true` if `a` dominates `b` (every path from entry to `b` passes
/// through `a`), walking up `b`'s idom chain.
pub fn dominates(blocks: &[Block], entry: u32, a: u32, b: u32) -> bool {
    let mut cur = b;
    loop {
        if cur == a {
            return true;
        }
        if cur == entry {
            return cur == a;
        }
        match blocks[cur as usize].idom {
            Some(idom) if idom != cur => cur = idom,
            _ => return cur == a,
        }
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
    fn diamond_merge_dominated_by_entry_only() {
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
        let cfg = c.cfg.as_ref().unwrap();
        let entry_block = cfg.entry;
        let merge_block = cfg.blocks.iter().position(|b| b.start == merge).unwrap() as u32;
        // merge is reached through both arms, so only the function entry dominates it
        assert_eq!(cfg.blocks[merge_block as usize].idom, Some(entry_block));
        assert!(dominates(&cfg.blocks, entry_block, entry_block, merge_block));
    }

    #[test]
    fn straight_line_idom_chain_is_trivial() {
        let mut c = Context::new(ContextFlags::FUNCTION, 16, 16);
        let start = c.start();
        let x = c.param(Type::I32, start, "x", 0);
        let y = c.param(Type::I32, start, "y", 1);
        let sub = c.emit(Opcode::Sub, Type::I32, x, y, REF_UNUSED);
        let begin = c.begin(start);
        c.return_(begin, sub, start);

        c.build_cfg();
        c.build_dominators_tree();
        let cfg = c.cfg.as_ref().unwrap();
        assert_eq!(cfg.blocks.len(), 1);
        assert_eq!(cfg.blocks[0].dom_depth, 0);
    }
}
