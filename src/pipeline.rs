//! End-to-end pipeline wiring C1-C8 together.
//!
//! Grounded on `main.py`, which decodes a dump, builds an AST for the root
//! prototype, and hands it to the writer. `decompile` is the single public
//! entry point the CLI (and integration tests) call.

use tracing::info;

use crate::error::Result;
use crate::ir::Dump;
use crate::{builder, dump, emit};

/// Decodes `bytes` as a LuaJIT bytecode dump and renders Lua source for its
/// root chunk.
pub fn decompile(bytes: &[u8]) -> Result<String> {
    let file = crate::decode::decode(bytes)?;
    info!(prototypes = file.prototypes.len(), "decoded bytecode dump");
    let root = file.prototypes.first().ok_or(crate::error::Error::TruncatedStream)?;
    let func = builder::build(root, true)?;
    Ok(emit::emit(&func))
}

/// Re-encodes a previously decoded dump back to its wire format, used by
/// round-trip tests and the `--reencode` debugging flag.
#[must_use]
pub fn reencode(file: &Dump) -> Vec<u8> {
    crate::encode::encode(file)
}

/// Decodes `bytes` and renders a human-readable instruction-level dump,
/// bypassing AST construction entirely.
pub fn dump_ir(bytes: &[u8]) -> Result<String> {
    let file = crate::decode::decode(bytes)?;
    Ok(dump::dump(&file))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_function_bytes() -> Vec<u8> {
        // magic + version + flags(stripped) ; stripped skips the name and
        // per-prototype debug_info_size fields entirely.
        let mut b = vec![0x1B, 0x4C, 0x4A, 0x02, 0x02];
        let body = {
            let mut p = Vec::new();
            p.push(0); // prototype flag byte
            p.push(0); // argument_count
            p.push(2); // frame_size
            p.push(0); // upvalue_count
            p.push(0); // constant_count
            p.push(0); // numeric_count
            p.push(1); // instruction_count
            // one RET0 instruction, little-endian word: op=71 (0x47), a=0, cd=0
            p.extend_from_slice(&[0x47, 0x00, 0x00, 0x00]);
            p
        };
        b.push(body.len() as u8);
        b.extend(body);
        b.push(0); // terminator
        b
    }

    #[test]
    fn decompile_empty_function_yields_return() {
        let bytes = empty_function_bytes();
        let result = decompile(&bytes);
        assert!(result.is_ok(), "{result:?}");
    }
}
