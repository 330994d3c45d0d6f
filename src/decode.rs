//! Bytecode decoder (C3): header, then a forest of prototypes.
//!
//! Grounded on `bc/reader.py`'s `Reader` class. Byte order is little-endian
//! until the header flags are read, then switched per `is_big_endian`,
//! exactly as `_read_header` does by setting `stream.byteorder` only after
//! `_read_flags`.

use tracing::debug;

use crate::error::{Error, Result};
use crate::ir::{
    Const, ConstRef, DebugInfo, Dump, Instruction, Prototype, Table, TableValue, VariableInfo,
    VariableKind, FLAG_HAS_FFI, FLAG_IS_BIG_ENDIAN, FLAG_IS_STRIPPED, INTERNAL_VARNAMES, MAGIC,
    MAX_VERSION, PROTO_FLAG_HAS_CHILD, PROTO_FLAG_HAS_FFI, PROTO_FLAG_HAS_ILOOP,
    PROTO_FLAG_IS_VARIADIC, PROTO_FLAG_JIT_DISABLED,
};
use crate::opcode::{OperandKind, Opcode};
use crate::stream::{ByteOrder, Reader};

const BCDUMP_KGC_CHILD: u64 = 0;
const BCDUMP_KGC_TAB: u64 = 1;
const BCDUMP_KGC_I64: u64 = 2;
const BCDUMP_KGC_U64: u64 = 3;
const BCDUMP_KGC_COMPLEX: u64 = 4;
const BCDUMP_KGC_STR: u64 = 5;

const BCDUMP_KTAB_NIL: u64 = 0;
const BCDUMP_KTAB_FALSE: u64 = 1;
const BCDUMP_KTAB_TRUE: u64 = 2;
const BCDUMP_KTAB_INT: u64 = 3;
const BCDUMP_KTAB_NUM: u64 = 4;
const BCDUMP_KTAB_STR: u64 = 5;

const VARNAME_END: u8 = 0;
const VARNAME_MAX: u8 = 7;

pub fn decode(bytes: &[u8]) -> Result<Dump> {
    let mut r = Reader::new(bytes);

    if r.read_bytes(3)? != MAGIC {
        return Err(Error::BadMagic);
    }

    let version = r.read_u8()?;
    if version > MAX_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }

    let flags = r.read_uleb128()?;
    let is_big_endian = flags & FLAG_IS_BIG_ENDIAN != 0;
    let is_stripped = flags & FLAG_IS_STRIPPED != 0;
    let has_ffi = flags & FLAG_HAS_FFI != 0;
    let unknown = flags & !(FLAG_IS_BIG_ENDIAN | FLAG_IS_STRIPPED | FLAG_HAS_FFI);
    if unknown != 0 {
        return Err(Error::UnknownFlag(unknown as u32));
    }

    let name = if is_stripped {
        None
    } else {
        let length = r.read_uleb128()? as usize;
        let bytes = r.read_bytes(length)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    };

    r.byte_order = if is_big_endian { ByteOrder::Big } else { ByteOrder::Little };

    let mut prototypes = Vec::new();
    let mut number = 0usize;
    while let Some(prototype) = read_prototype(&mut r, number, is_stripped, &mut prototypes)? {
        prototypes.push(prototype);
        number += 1;
    }

    Ok(Dump { version, is_big_endian, is_stripped, has_ffi, name, prototypes })
}

/// Reads one prototype, popping already-parsed children off `siblings` in
/// reverse order as the wire format's child-first-parent-last layout
/// requires. Returns `None` when the zero-size terminator is hit.
fn read_prototype(
    r: &mut Reader,
    number: usize,
    dump_is_stripped: bool,
    siblings: &mut Vec<Prototype>,
) -> Result<Option<Prototype>> {
    let size = r.read_uleb128()?;
    if size == 0 {
        return Ok(None);
    }

    let _span = tracing::debug_span!("read_prototype", number).entered();

    let flag_byte = r.read_u8()?;
    let has_child = flag_byte & PROTO_FLAG_HAS_CHILD != 0;
    let is_variadic = flag_byte & PROTO_FLAG_IS_VARIADIC != 0;
    let has_ffi = flag_byte & PROTO_FLAG_HAS_FFI != 0;
    let is_jit_disabled = flag_byte & PROTO_FLAG_JIT_DISABLED != 0;
    let has_iloop = flag_byte & PROTO_FLAG_HAS_ILOOP != 0;
    let known = PROTO_FLAG_HAS_CHILD
        | PROTO_FLAG_IS_VARIADIC
        | PROTO_FLAG_HAS_FFI
        | PROTO_FLAG_JIT_DISABLED
        | PROTO_FLAG_HAS_ILOOP;
    if flag_byte & !known != 0 {
        return Err(Error::UnknownFlag(u32::from(flag_byte & !known)));
    }

    let argument_count = r.read_u8()?;
    let frame_size = r.read_u8()?;
    let upvalue_count = r.read_u8()?;
    let constant_count = r.read_uleb128()?;
    let numeric_count = r.read_uleb128()?;
    let instruction_count = r.read_uleb128()?;

    let debug_info_size = if dump_is_stripped { 0 } else { r.read_uleb128()? };
    let (first_line_number, line_count) = if debug_info_size > 0 {
        (r.read_uleb128()?, r.read_uleb128()?)
    } else {
        (0, 0)
    };

    let instructions = read_instructions(r, is_variadic, frame_size, instruction_count, constant_count)?;
    let upvalues = (0..upvalue_count).map(|_| r.read_uint(2).map(|v| v as u16)).collect::<Result<Vec<_>>>()?;
    let constants = read_constants(r, number, constant_count, siblings)?;
    let numerics = (0..numeric_count).map(|_| r.read_uleb128_33()).collect::<Result<Vec<_>>>()?;

    let debug_info = if debug_info_size > 0 {
        Some(read_debug_info(r, upvalue_count, instruction_count, first_line_number, line_count)?)
    } else {
        None
    };

    debug!(instructions = instruction_count, constants = constant_count, "decoded prototype");

    Ok(Some(Prototype {
        number,
        has_child,
        is_variadic,
        has_ffi,
        is_jit_disabled,
        has_iloop,
        argument_count,
        frame_size,
        upvalue_count,
        constant_count,
        numeric_count,
        instruction_count,
        debug_info_size,
        first_line_number,
        line_count,
        instructions,
        upvalues,
        constants,
        numerics,
        debug_info,
    }))
}

fn read_instructions(
    r: &mut Reader,
    is_variadic: bool,
    frame_size: u8,
    instruction_count: u64,
    constant_count: u64,
) -> Result<Vec<Instruction>> {
    let head_opcode = if is_variadic { Opcode::Funcv } else { Opcode::Funcf };
    let mut instructions = Vec::with_capacity(instruction_count as usize + 1);
    instructions.push(Instruction { opcode: head_opcode, a: Some(i64::from(frame_size)), b: None, cd: None });

    for _ in 0..instruction_count {
        instructions.push(read_instruction(r, constant_count)?);
    }
    Ok(instructions)
}

fn read_instruction(r: &mut Reader, constant_count: u64) -> Result<Instruction> {
    let codeword = r.read_uint(4)?;
    let opcode = Opcode::from_byte((codeword & 0xFF) as u8)?;
    let schema = opcode.schema();

    let operand_count =
        [schema.a, schema.b, schema.cd].iter().filter(|k| k.is_some()).count();

    let (raw_a, raw_b, raw_cd) = if operand_count == 3 {
        ((codeword >> 8) & 0xFF, Some((codeword >> 24) & 0xFF), (codeword >> 16) & 0xFF)
    } else {
        ((codeword >> 8) & 0xFF, None, (codeword >> 16) & 0xFFFF)
    };

    let a = schema.a.map(|kind| process_operand(kind, raw_a, constant_count));
    let b = match (schema.b, raw_b) {
        (Some(kind), Some(raw)) => Some(process_operand(kind, raw, constant_count)),
        _ => None,
    };
    let cd = schema.cd.map(|kind| process_operand(kind, raw_cd, constant_count));

    Ok(Instruction { opcode, a, b, cd })
}

fn process_operand(kind: OperandKind, op: u64, constant_count: u64) -> i64 {
    if kind.is_const_ref() {
        constant_count as i64 - op as i64 - 1
    } else if kind == OperandKind::Jmp {
        op as i64 - 0x8000
    } else if kind == OperandKind::SLit {
        if op & 0x8000 != 0 {
            op as i64 - 0x1_0000
        } else {
            op as i64
        }
    } else {
        op as i64
    }
}

fn read_constants(
    r: &mut Reader,
    prototype_number: usize,
    constant_count: u64,
    siblings: &mut Vec<Prototype>,
) -> Result<Vec<ConstRef>> {
    let mut constants = Vec::with_capacity(constant_count as usize);
    for index in 0..constant_count {
        let number = format!("{prototype_number}_{index}");
        let tag = r.read_uleb128()?;

        let value = if tag >= BCDUMP_KGC_STR {
            let length = (tag - BCDUMP_KGC_STR) as usize;
            let bytes = r.read_bytes(length)?;
            Const::Str(String::from_utf8_lossy(bytes).into_owned())
        } else if tag == BCDUMP_KGC_TAB {
            Const::Table(read_table(r)?)
        } else if tag != BCDUMP_KGC_CHILD {
            let first = r.read_float()?;
            match tag {
                BCDUMP_KGC_I64 => Const::I64(first),
                BCDUMP_KGC_U64 => Const::U64(first),
                BCDUMP_KGC_COMPLEX => Const::Complex(first, r.read_float()?),
                other => return Err(Error::InvariantViolation {
                    prototype: prototype_number,
                    pc: 0,
                    detail: format!("unknown constant tag {other}"),
                }),
            }
        } else {
            let child = siblings.pop().ok_or_else(|| Error::InvariantViolation {
                prototype: prototype_number,
                pc: 0,
                detail: "child constant with no parsed child prototype available".to_string(),
            })?;
            Const::Child(Box::new(child))
        };

        constants.push(ConstRef { number, value });
    }
    Ok(constants)
}

fn read_table(r: &mut Reader) -> Result<Table> {
    let array_count = r.read_uleb128()?;
    let hash_count = r.read_uleb128()?;

    let mut table = Table::default();
    for _ in 0..array_count {
        table.array.push(read_table_item(r)?);
    }
    for _ in 0..hash_count {
        let key = read_table_item(r)?;
        let value = read_table_item(r)?;
        table.dictionary.push((key, value));
    }
    Ok(table)
}

fn read_table_item(r: &mut Reader) -> Result<TableValue> {
    let tag = r.read_uleb128()?;
    if tag >= BCDUMP_KTAB_STR {
        let length = (tag - BCDUMP_KTAB_STR) as usize;
        let bytes = r.read_bytes(length)?;
        return Ok(TableValue::Str(String::from_utf8_lossy(bytes).into_owned()));
    }
    match tag {
        BCDUMP_KTAB_INT => Ok(TableValue::Int(r.read_signed_uleb128()?)),
        BCDUMP_KTAB_NUM => Ok(TableValue::Num(r.read_float()?)),
        BCDUMP_KTAB_TRUE => Ok(TableValue::Bool(true)),
        BCDUMP_KTAB_FALSE => Ok(TableValue::Bool(false)),
        BCDUMP_KTAB_NIL => Ok(TableValue::Nil),
        _ => Ok(TableValue::Nil),
    }
}

fn read_debug_info(
    r: &mut Reader,
    upvalue_count: u8,
    instruction_count: u64,
    first_line_number: u64,
    line_count: u64,
) -> Result<DebugInfo> {
    let line_info_size = if line_count >= 65536 {
        4
    } else if line_count >= 256 {
        2
    } else {
        1
    };

    let mut addr_to_line_map = Vec::with_capacity(instruction_count as usize + 1);
    addr_to_line_map.push(0);
    for _ in 0..instruction_count {
        addr_to_line_map.push(first_line_number + r.read_uint(line_info_size)?);
    }

    let mut upvalue_variable_names = Vec::with_capacity(upvalue_count as usize);
    for _ in 0..upvalue_count {
        let bytes = r.read_zstring()?;
        upvalue_variable_names.push(String::from_utf8_lossy(&bytes).into_owned());
    }

    let variable_infos = read_variable_info(r)?;

    Ok(DebugInfo { addr_to_line_map, upvalue_variable_names, variable_infos })
}

fn read_variable_info(r: &mut Reader) -> Result<Vec<VariableInfo>> {
    let mut infos = Vec::new();
    let mut last_addr = 0u64;

    loop {
        let tag = r.read_u8()?;
        let (kind, name) = if tag >= VARNAME_MAX {
            let mut name = vec![tag];
            name.extend(r.read_zstring()?);
            (VariableKind::Visible, String::from_utf8_lossy(&name).into_owned())
        } else if tag == VARNAME_END {
            break;
        } else {
            (VariableKind::Internal, INTERNAL_VARNAMES[tag as usize].to_string())
        };

        let start_addr = last_addr + r.read_uleb128()?;
        let end_addr = start_addr + r.read_uleb128()?;
        last_addr = start_addr;

        infos.push(VariableInfo { start_addr, end_addr, kind, name });
    }

    Ok(infos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Writer;

    fn empty_function_dump() -> Vec<u8> {
        // One prototype: argcount 0, a single RET0 instruction (decoded
        // alongside the synthetic FUNCF head), no debug info, stripped.
        let mut body = Writer::new();
        body.write_u8(PROTO_FLAG_IS_VARIADIC & 0); // flags = 0
        body.write_u8(0); // argcount
        body.write_u8(2); // framesize
        body.write_u8(0); // upvaluecount
        body.write_uleb128(0); // constcount
        body.write_uleb128(0); // numericcount
        body.write_uleb128(1); // instructioncount
        // debug_info_size omitted: dump is stripped
        let ret0 = Opcode::Ret0 as u64;
        let codeword: u64 = ret0 | (0 << 8) | (1 << 16); // a=0, cd=1
        body.write_uint(codeword, 4);

        let mut w = Writer::new();
        w.write_bytes(&MAGIC);
        w.write_u8(1); // version
        w.write_uleb128(FLAG_IS_STRIPPED);
        w.write_uleb128(body.buf.len() as u64); // prototype size
        w.write_bytes(&body.buf);
        w.write_uleb128(0); // terminator
        w.buf
    }

    #[test]
    fn decodes_empty_function() {
        let bytes = empty_function_dump();
        let dump = decode(&bytes).unwrap();
        assert_eq!(dump.version, 1);
        assert!(dump.is_stripped);
        assert_eq!(dump.prototypes.len(), 1);
        let proto = &dump.prototypes[0];
        assert_eq!(proto.argument_count, 0);
        assert_eq!(proto.instructions.len(), 2); // synthetic head + RET0
        assert_eq!(proto.instructions[0].opcode, Opcode::Funcf);
        assert_eq!(proto.instructions[1].opcode, Opcode::Ret0);
    }

    #[test]
    fn bad_magic_is_rejected() {
        assert!(matches!(decode(&[0, 0, 0]), Err(Error::BadMagic)));
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let mut w = Writer::new();
        w.write_bytes(&MAGIC);
        w.write_u8(0x80);
        assert!(matches!(decode(&w.buf), Err(Error::UnsupportedVersion(0x80))));
    }

    #[test]
    fn unknown_flag_is_rejected() {
        let mut w = Writer::new();
        w.write_bytes(&MAGIC);
        w.write_u8(0);
        w.write_uleb128(1 << 7);
        assert!(matches!(decode(&w.buf), Err(Error::UnknownFlag(_))));
    }

    #[test]
    fn constant_operand_is_normalised() {
        // GGET has a STR operand; wire value 0 with constcount 1 -> index 0.
        assert_eq!(process_operand(OperandKind::Str, 0, 1), 0);
        assert_eq!(process_operand(OperandKind::Str, 0, 3), 2);
    }

    #[test]
    fn jump_operand_is_unbiased() {
        assert_eq!(process_operand(OperandKind::Jmp, 0x8000, 0), 0);
        assert_eq!(process_operand(OperandKind::Jmp, 0x8005, 0), 5);
    }

    #[test]
    fn signed_literal_is_sign_extended() {
        assert_eq!(process_operand(OperandKind::SLit, 1, 0), 1);
        assert_eq!(process_operand(OperandKind::SLit, 0xFFFF, 0), -1);
    }
}
