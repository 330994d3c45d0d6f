use thiserror::Error;

/// Errors produced anywhere in the decompilation pipeline.
///
/// Every kind here corresponds to one of the fatal error policies: there is
/// no partial output, the pipeline aborts as soon as one of these is raised.
#[derive(Debug, Error)]
pub enum Error {
    #[error("bad magic: expected 1B 4C 4A")]
    BadMagic,

    #[error("unsupported version 0x{0:02x} (proprietary modifications)")]
    UnsupportedVersion(u8),

    #[error("unknown flag bits set: {0:#010b}")]
    UnknownFlag(u32),

    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("read past end of stream")]
    TruncatedStream,

    #[error("invariant violated in prototype {prototype} at pc {pc}: {detail}")]
    InvariantViolation {
        prototype: usize,
        pc: usize,
        detail: String,
    },

    #[error("control-flow graph could not be reduced to a single block: {residual_blocks} blocks remain")]
    IrreducibleCfg { residual_blocks: usize },

    #[error("temporary elimination did not converge within {0} iterations")]
    InliningDivergence(usize),
}

pub type Result<T> = std::result::Result<T, Error>;
