//! Decompiles LuaJIT bytecode dumps back into readable Lua source.
//!
//! The pipeline runs eight stages, C1 through C8, mirrored roughly one
//! module per stage: [`stream`] and [`opcode`] are the wire-format
//! vocabulary, [`ir`] is the decoded in-memory representation produced by
//! [`decode`] and consumed by [`encode`], [`ast`] is the statement/
//! expression vocabulary built by [`builder`] from a control-flow graph
//! ([`cfg`]) and cleaned up by [`temporary`], and finally rendered by
//! [`emit`]. [`dump`] is a side-channel debug view of the decoded IR.
//! [`pipeline`] wires all of the above into the entry points a caller
//! actually needs.

pub mod ast;
pub mod builder;
pub mod cfg;
pub mod decode;
pub mod dump;
pub mod emit;
pub mod encode;
pub mod error;
pub mod ir;
pub mod opcode;
pub mod pipeline;
pub mod stream;
pub mod temporary;

pub use error::{Error, Result};
pub use pipeline::{decompile, dump_ir, reencode};
