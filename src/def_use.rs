//! Def→use list construction.
//!
//! One pass over the arena counts incoming edges per definition, then
//! allocates a single flat edge array with per-def `(first, count)`
//! slots. We keep a small amount of trailing slack per definition so
//! later passes (SCCP's copy-propagation rewrites, GCM) can append a use
//! without reallocating the whole array — mirroring the source's
//! "slack" discipline instead of a `Vec<Vec<Ref>>`, which would work but
//! lose the locality the slack array buys.

use crate::arena::{is_const_ref, Ref, REF_UNUSED};
use crate::context::Context;

const SLACK_PER_DEF: usize = 2;

#[derive(Debug, Clone, Copy, Default)]
struct UseSlot {
    first: u32,
    count: u32,
    capacity: u32,
}

pub struct UseLists {
    slots: Vec<UseSlot>, // indexed by instruction ref (0 unused)
    edges: Vec<Ref>,     // flat array of using refs, with slack
}

impl UseLists {
    pub fn uses_of(&self, def: Ref) -> &[Ref] {
        debug_assert!(!is_const_ref(def));
        let slot = self.slots[def as usize];
        &self.edges[slot.first as usize..slot.first as usize + slot.count as usize]
    }

    pub fn use_count(&self, def: Ref) -> usize {
        self.slots[def as usize].count as usize
    }

    /// Appends `user` to `def`'s use list, growing its slack region (or
    /// the whole edge array, per the source's documented fallback) if
    /// the reserved slack is exhausted.
    pub fn add_use(&mut self, def: Ref, user: Ref) {
        let idx = def as usize;
        let slot = self.slots[idx];
        if slot.count < slot.capacity {
            let pos = slot.first + slot.count;
            self.edges[pos as usize] = user;
            self.slots[idx].count += 1;
            return;
        }
        self.reallocate_with_extra(idx, user);
    }

    pub fn remove_use(&mut self, def: Ref, user: Ref) {
        let idx = def as usize;
        let slot = self.slots[idx];
        let start = slot.first as usize;
        let count = slot.count as usize;
        if let Some(pos) = self.edges[start..start + count].iter().position(|&r| r == user) {
            self.edges.copy_within(start + pos + 1..start + count, start + pos);
            self.slots[idx].count -= 1;
        }
    }

    pub fn replace_use(&mut self, def: Ref, old_user: Ref, new_user: Ref) {
        let slot = self.slots[def as usize];
        let start = slot.first as usize;
        let count = slot.count as usize;
        for e in &mut self.edges[start..start + count] {
            if *e == old_user {
                *e = new_user;
            }
        }
    }

    /// Reallocates the entire edge array, doubling every def's slack.
    /// Fallback for when a single definition's reserved slack runs out.
    fn reallocate_with_extra(&mut self, idx: usize, user: Ref) {
        let mut new_edges = Vec::with_capacity(self.edges.len() * 2 + SLACK_PER_DEF);
        let mut new_slots = vec![UseSlot::default(); self.slots.len()];
        for (i, slot) in self.slots.iter().enumerate() {
            let count = if i == idx { slot.count + 1 } else { slot.count };
            let capacity = count + SLACK_PER_DEF as u32;
            let new_first = new_edges.len() as u32;
            let start = slot.first as usize;
            new_edges.extend_from_slice(&self.edges[start..start + slot.count as usize]);
            if i == idx {
                new_edges.push(user);
            }
            new_edges.resize(new_first as usize + capacity as usize, REF_UNUSED);
            new_slots[i] = UseSlot { first: new_first, count, capacity };
        }
        self.edges = new_edges;
        self.slots = new_slots;
    }
}

impl Context {
    /// Builds [`UseLists`] for the current arena contents. Single pass
    /// over every non-NOP instruction's inputs.
    pub fn build_def_use_lists(&mut self) {
        let n = self.arena.insns_count();
        let mut counts = vec![0u32; n];

        let refs: Vec<Ref> = self.arena.insn_refs().collect();
        for &r in &refs {
            if self.arena.is_nop(r) {
                continue;
            }
            for input in self.arena.get(r).inputs() {
                if !is_const_ref(input) && input != REF_UNUSED {
                    counts[input as usize] += 1;
                }
            }
        }

        let mut slots = vec![UseSlot::default(); n];
        let mut edges = Vec::new();
        for i in 0..n {
            let capacity = counts[i] + SLACK_PER_DEF as u32;
            slots[i] = UseSlot { first: edges.len() as u32, count: 0, capacity };
            edges.resize(edges.len() + capacity as usize, REF_UNUSED);
        }

        let mut use_lists = UseLists { slots, edges };
        for &r in &refs {
            if self.arena.is_nop(r) {
                continue;
            }
            for input in self.arena.get(r).inputs() {
                if !is_const_ref(input) && input != REF_UNUSED {
                    use_lists.add_use(input, r);
                }
            }
        }

        self.use_lists = Some(use_lists);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextFlags;
    use crate::op::Opcode;
    use crate::types::Type;

    #[test]
    fn def_use_consistency() {
        let mut c = Context::new(ContextFlags::empty(), 8, 8);
        let x = c.emit(Opcode::Param, Type::I32, REF_UNUSED, 0, 0);
        let y = c.emit(Opcode::Param, Type::I32, REF_UNUSED, 0, 1);
        let add1 = c.emit(Opcode::Add, Type::I32, x, y, REF_UNUSED);
        let add2 = c.emit(Opcode::Add, Type::I32, x, add1, REF_UNUSED);
        c.build_def_use_lists();
        let uses = c.use_lists.as_ref().unwrap();
        assert_eq!(uses.use_count(x), 2);
        assert_eq!(uses.uses_of(x), &[add1, add2]);
        assert_eq!(uses.use_count(add1), 1);
    }
}
