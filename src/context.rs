//! The IR context: owns the arena plus every auxiliary array produced by
//! later passes, matching `ir_ctx` in the source.
//!
//! A `Context` is a plain value with no internal synchronization: callers
//! compiling multiple functions concurrently must use one `Context` per
//! thread.

use bitflags::bitflags;

use crate::arena::{Arena, Ref};
use crate::cfg::Cfg;
use crate::dessa::DessaMoves;
use crate::layout::BlockLayout;
use crate::liveness::LiveIntervals;
use crate::regalloc::RegAssignment;
use crate::schedule::GcmBlocks;

bitflags! {
    /// Recognized context options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ContextFlags: u32 {
        /// This context holds a function body (as opposed to, e.g., a
        /// throwaway expression context used only for constant folding).
        const FUNCTION       = 1 << 0;
        /// Reserve the frame-pointer register rather than treating it as
        /// general-purpose (consumed by the register allocator's
        /// fixed-interval setup).
        const USE_FRAME_POINTER = 1 << 1;
        /// Set by the loop finder when it finds a cross-join edge — a CFG
        /// edge whose endpoints have no dominator-tree ancestry relation
        /// either way; read-only to callers.
        const IRREDUCIBLE_CFG = 1 << 2;
        /// Enable on-the-fly rule-based folding in `emit`/`fold`.
        const OPT_FOLDING     = 1 << 3;
        /// Set internally while SCCP borrows the folder in non-emitting
        /// mode; never set by a caller directly.
        const OPT_IN_SCCP     = 1 << 4;
        /// Merge trivial `END -> BEGIN` chains during CFG construction.
        const OPT_CFG         = 1 << 5;
        /// Enable target pattern-matching instruction selection (external
        /// collaborator boundary; recognized but unimplemented here).
        const OPT_CODEGEN     = 1 << 6;
        /// Set by the scheduler once the arena reflects block order.
        const LINEAR          = 1 << 7;
        const GEN_NATIVE      = 1 << 8;
        const GEN_C           = 1 << 9;
        const AVX             = 1 << 10;
    }
}

/// Which pipeline stage produced the context's current state, for
/// `--dump-after-*`-style external tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Load,
    Construct,
    Sccp,
    Gcm,
    Schedule,
    LiveRanges,
    Coalescing,
    RegAlloc,
    Dessa,
    Layout,
    Final,
}

/// The compilation context: arena plus every pass's output arrays, all
/// owned together and freed together.
pub struct Context {
    pub arena: Arena,
    pub flags: ContextFlags,
    /// CSE search floor: local value numbering never walks back past this
    /// ref. Reset whenever `truncate` or a structural rewrite invalidates
    /// the chain (see DESIGN.md on `fold_cse_limit`).
    pub fold_cse_limit: Ref,
    pub use_lists: Option<crate::def_use::UseLists>,
    pub cfg: Option<Cfg>,
    pub gcm: Option<GcmBlocks>,
    pub vregs: Option<Vec<u32>>,
    pub live_intervals: Option<LiveIntervals>,
    pub reg_assignment: Option<RegAssignment>,
    pub dessa_moves: Option<DessaMoves>,
    pub block_layout: Option<BlockLayout>,
    pub stage: PipelineStage,
}

impl Context {
    pub fn new(flags: ContextFlags, consts_limit: usize, insns_limit: usize) -> Self {
        Context {
            arena: Arena::new(consts_limit, insns_limit),
            flags,
            fold_cse_limit: crate::arena::REF_UNUSED,
            use_lists: None,
            cfg: None,
            gcm: None,
            vregs: None,
            live_intervals: None,
            reg_assignment: None,
            dessa_moves: None,
            block_layout: None,
            stage: PipelineStage::Construct,
        }
    }

    #[inline]
    pub fn folding_enabled(&self) -> bool {
        self.flags.contains(ContextFlags::OPT_FOLDING) && !self.flags.contains(ContextFlags::OPT_IN_SCCP)
    }

    /// Compacts the arena to its actual size.
    pub fn truncate(&mut self) {
        self.arena.truncate();
        self.fold_cse_limit = self.arena.insns_count() as Ref;
    }

    /// Drops every pass-owned array, returning the context to
    /// post-construction state. Re-entering an earlier pass requires
    /// calling this first.
    pub fn reset_passes(&mut self) {
        self.use_lists = None;
        self.cfg = None;
        self.gcm = None;
        self.vregs = None;
        self.live_intervals = None;
        self.reg_assignment = None;
        self.dessa_moves = None;
        self.block_layout = None;
        self.flags.remove(ContextFlags::LINEAR | ContextFlags::IRREDUCIBLE_CFG);
        self.stage = PipelineStage::Construct;
    }
}
