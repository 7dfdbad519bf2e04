//! A lightweight JIT compilation framework: a sea-of-nodes intermediate
//! representation, an optimizer, and a linear-scan register allocator,
//! meant to sit between a front-end and a machine-code emitter.
//!
//! The pipeline a caller drives through a [`context::Context`] is, in
//! order:
//!
//! 1. **Construction** ([`construct`]) — build the graph with `emit`/
//!    `fold`-family calls; local value numbering and peephole folding
//!    happen inline as nodes are created.
//! 2. **CFG** ([`cfg`]) — partition the linear node stream into basic
//!    blocks and an edge table.
//! 3. **Dominators** ([`dominators`]) — Cooper-Harvey-Kennedy iterative
//!    dominator tree.
//! 4. **Loops** ([`loops`]) — identify natural/irreducible loops from the
//!    dominator tree and DFS entry/exit times.
//! 5. **SCCP** ([`sccp`]) — sparse conditional constant propagation,
//!    folding and dead-branch elimination over the whole graph.
//! 6. **Global code motion** ([`schedule`]) — pin every floating node to
//!    the block implied by its dominating inputs, then order each block.
//! 7. **Liveness** ([`liveness`]) — virtual register assignment, live
//!    range computation, and PHI coalescing.
//! 8. **Register allocation** ([`regalloc`]) — Wimmer-Franz linear scan
//!    over the live intervals.
//! 9. **SSA deconstruction** ([`dessa`]) — parallel-copy sequencing for
//!    whatever PHIs coalescing left unresolved.
//! 10. **Block layout** ([`layout`]) — trace-based final linear order.
//!
//! [`verify::verify`] can run after any stage to check the invariants
//! that stage is responsible for establishing. [`mem`] holds the
//! executable-memory boundary ([`mem::CodeBuffer`]/[`mem::ExecutableCode`])
//! a target-specific emitter writes its bytes into; this crate emits no
//! bytes itself — encoders are an out-of-scope collaborator.

pub mod arena;
pub mod cfg;
pub mod construct;
pub mod context;
pub mod def_use;
pub mod dessa;
pub mod dominators;
#[cfg(feature = "codegen")]
pub mod emit;
pub mod error;
pub mod fold;
pub mod layout;
pub mod liveness;
pub mod loops;
pub mod mem;
pub mod op;
pub mod regalloc;
pub mod sccp;
pub mod schedule;
pub mod types;
pub mod verify;

pub use arena::{Arena, Ref, REF_FALSE, REF_NULL, REF_TRUE, REF_UNUSED};
pub use cfg::{Block, BlockFlags, Cfg};
pub use context::{Context, ContextFlags, PipelineStage};
pub use def_use::UseLists;
pub use dessa::{DessaMoves, Location, Move, RegClassKey, ScratchRegisters};
#[cfg(feature = "codegen")]
pub use emit::{Emitter, MatchedInsn};
pub use error::{IrError, IrResult};
pub use layout::BlockLayout;
pub use liveness::{LiveInterval, LiveIntervals, LiveRange, UseFlag, UsePosition};
pub use mem::{Allocator, CodeBuffer, ExecutableCode, GlobalAllocator};
pub use op::{EdgeArity, OpClass, Opcode};
pub use regalloc::{FixedInterval, RegAllocConfig, RegAssignment, RegClass, RegSlot};
pub use schedule::GcmBlocks;
pub use types::Type;
pub use verify::verify;
