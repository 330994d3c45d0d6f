//! End-to-end decompile scenarios, one per fixed-shape bytecode dump.
//!
//! Each fixture is assembled by hand with `stream::Writer`, mirroring the
//! prototype layout `decode::decode` expects (header, per-prototype body,
//! terminator). Instruction words are packed with `encode_instruction`,
//! the inverse of `decode::read_instruction`'s operand unpacking.

use ljtool::ir::{FLAG_IS_STRIPPED, MAGIC};
use ljtool::opcode::{Opcode, OperandKind};
use ljtool::stream::Writer;

/// Packs one instruction word the way `decode::read_instruction` expects to
/// unpack it: three populated operand slots pack A/CD/B across bytes
/// 1/2/3, anything else packs A in byte 1 and a 16-bit CD across bytes 2-3.
fn encode_instruction(op: Opcode, a: u64, b: Option<u64>, cd: u64) -> u32 {
    let schema = op.schema();
    let operand_count = [schema.a, schema.b, schema.cd].iter().filter(|k| k.is_some()).count();
    let opcode = op as u32;
    if operand_count == 3 {
        opcode | ((a as u32) << 8) | ((cd as u32) << 16) | ((b.unwrap() as u32) << 24)
    } else {
        opcode | ((a as u32) << 8) | ((cd as u32) << 16)
    }
}

/// Inverts `decode::process_operand`'s constant-ref renumbering: given the
/// desired decoded constant index `k`, produces the raw operand to encode.
fn const_operand(k: u64, constant_count: u64) -> u64 {
    constant_count - k - 1
}

fn jmp_operand(bias: i64) -> u64 {
    (bias + 0x8000) as u64
}

/// Builds a single-prototype stripped dump with the given instruction words
/// and string constants (pushed in declaration order; `KSTR`/`GGET`-style
/// operands index them back-to-front per `const_operand`).
fn single_prototype_dump(
    argument_count: u8,
    frame_size: u8,
    is_variadic: bool,
    instructions: &[u32],
    string_constants: &[&str],
) -> Vec<u8> {
    let mut body = Writer::new();
    let flags = if is_variadic { ljtool::ir::PROTO_FLAG_IS_VARIADIC } else { 0 };
    body.write_u8(flags);
    body.write_u8(argument_count);
    body.write_u8(frame_size);
    body.write_u8(0); // upvalue_count
    body.write_uleb128(string_constants.len() as u64); // constant_count
    body.write_uleb128(0); // numeric_count
    body.write_uleb128(instructions.len() as u64); // instruction_count
    for word in instructions {
        body.write_uint(u64::from(*word), 4);
    }
    // Constants are read back in declaration order by read_constants, but
    // process_operand renumbers operand references so that declaration
    // order matches `constant_count - k - 1`; push in reverse so index 0
    // (the constant a `const_operand(0, ...)` reference resolves to) is
    // the string at the end of `string_constants`.
    for s in string_constants.iter().rev() {
        body.write_uleb128(5 + s.len() as u64); // BCDUMP_KGC_STR tag
        body.write_bytes(s.as_bytes());
    }

    let mut w = Writer::new();
    w.write_bytes(&MAGIC);
    w.write_u8(2); // version
    w.write_uleb128(FLAG_IS_STRIPPED);
    w.write_uleb128(body.buf.len() as u64);
    w.write_bytes(&body.buf);
    w.write_uleb128(0); // terminator
    w.buf
}

#[test]
fn s1_empty_function_yields_no_statements() {
    let ret0 = encode_instruction(Opcode::Ret0, 0, None, 1);
    let bytes = single_prototype_dump(0, 2, false, &[ret0], &[]);
    let source = ljtool::decompile(&bytes).unwrap();
    assert!(source.trim().is_empty(), "expected an empty body, got {source:?}");
}

#[test]
fn s2_simple_arithmetic_returns_sum() {
    // ADDVV slot2, slot0, slot1 ; RET1 slot2, 2
    let addvv = encode_instruction(Opcode::Addvv, 2, Some(0), 1);
    let ret1 = encode_instruction(Opcode::Ret1, 2, None, 2);
    let bytes = single_prototype_dump(2, 3, false, &[addvv, ret1], &[]);
    let source = ljtool::decompile(&bytes).unwrap();
    assert_eq!(source.trim(), "return slot0 + slot1");
}

#[test]
fn s6_globals_call_with_string_argument() {
    // GGET slot0, "print" ; KSTR slot1, "hi" ; CALL slot0, 1, 2
    let gget = encode_instruction(Opcode::Gget, 0, None, const_operand(0, 2));
    let kstr = encode_instruction(Opcode::Kstr, 1, None, const_operand(1, 2));
    let call = encode_instruction(Opcode::Call, 0, Some(1), 2);
    let bytes = single_prototype_dump(0, 2, false, &[gget, kstr, call], &["print", "hi"]);
    let source = ljtool::decompile(&bytes).unwrap();
    assert_eq!(source.trim(), "print(\"hi\")");
}

#[test]
fn dump_ir_lists_opcode_mnemonics_for_arithmetic() {
    let addvv = encode_instruction(Opcode::Addvv, 2, Some(0), 1);
    let ret1 = encode_instruction(Opcode::Ret1, 2, None, 2);
    let bytes = single_prototype_dump(2, 3, false, &[addvv, ret1], &[]);
    let out = ljtool::dump_ir(&bytes).unwrap();
    assert!(out.contains("ADDVV"));
    assert!(out.contains("RET1"));
}
