use thiserror::Error;

/// Errors surfaced at the public API boundary.
///
/// Most construction-contract violations (wrong operand count, type
/// mismatch on a foldable op) are only checked by `debug_assert!` in the
/// hot construction path and are undefined behavior on a release build
/// given malformed input — the API is contract-based. `IrError` is
/// reserved for the handful of failure modes that are genuinely
/// recoverable: textual-loader parse errors, register-allocator dead ends,
/// and code-emission failures.
#[derive(Debug, Error)]
pub enum IrError {
    #[error("parse error at {line}:{column}: {message}")]
    Parse {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("unknown type name: {0}")]
    UnknownType(String),

    #[error("unknown opcode: {0}")]
    UnknownOpcode(String),

    #[error("undefined reference: {0}")]
    UndefinedRef(String),

    #[error("register allocation failed: no free register or spill slot for a must-be-in-register interval (vreg {vreg})")]
    AllocationFailed { vreg: u32 },

    #[error("code emission failed: {0}")]
    CodeEmission(String),

    #[error("verification failed: {0}")]
    VerificationFailed(String),
}

pub type IrResult<T> = std::result::Result<T, IrError>;
