//! Code-emitter seam, the last component in the pipeline.
//!
//! This crate does not ship a target encoder — the DynAsm-style x86/
//! AArch64 back-ends are explicitly out of scope — but the pipeline
//! still needs a named boundary a downstream crate compiles against:
//! something that consumes the final scheduled/allocated IR plus the
//! `match`ed instruction-selection rules and produces bytes into a
//! [`crate::mem::CodeBuffer`]. [`Emitter`] is that seam, gated behind the
//! `codegen` feature per the `Cargo.toml` comment on it, so a crate with
//! no concrete target pays nothing for the trait's existence.

#![cfg(feature = "codegen")]

use crate::context::Context;
use crate::error::IrResult;
use crate::mem::CodeBuffer;

/// One target-selected instruction: the opcode this context's matcher
/// chose plus the register/immediate operands [`crate::regalloc`] and
/// [`crate::dessa`] finished assigning. Concrete encoders define their
/// own richer representation; this is only the shape the pipeline
/// guarantees is available by the time `emit_code` runs.
pub struct MatchedInsn {
    pub ir_ref: crate::arena::Ref,
    pub mnemonic: &'static str,
}

/// A target-specific encoder. `match_instructions` is the target
/// instruction-selection pass over the final, linearized, register-assigned
/// IR; `emit_code` lowers the matched instructions into bytes, re-expressed
/// as a fallible constructor of an already-allocated [`CodeBuffer`] rather
/// than a raw pointer plus an out-param size.
pub trait Emitter {
    /// Runs target-specific pattern matching over the context's final IR
    /// (post [`Context::schedule_blocks`]), producing one [`MatchedInsn`]
    /// per surviving instruction in block order.
    fn match_instructions(&self, ctx: &Context) -> IrResult<Vec<MatchedInsn>>;

    /// Encodes `matched` into `buf`, returning the number of bytes
    /// written. The caller is responsible for calling
    /// [`CodeBuffer::make_executable`] once every function sharing the
    /// buffer has been emitted.
    fn encode(&self, matched: &[MatchedInsn], buf: &mut CodeBuffer) -> IrResult<usize>;
}
