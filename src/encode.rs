//! Byte-level re-serializer: the mirror of [`crate::decode`].
//!
//! External collaborator per the component table — mechanical by design,
//! used by the round-trip tests and by [`crate::dump`]. Grounded on
//! `bc/writer.py`'s `DumpWriter`. Counts for instructions/upvalues/constants
//! are recomputed from collection lengths on write, matching the original;
//! `debug_info_size` and `argument_count` are round-tripped as stored
//! fields since nothing downstream recomputes them (see DESIGN.md).

use crate::ir::{
    Const, Dump, Instruction, Prototype, Table, TableValue, VariableInfo, VariableKind,
    FLAG_HAS_FFI, FLAG_IS_BIG_ENDIAN, FLAG_IS_STRIPPED, INTERNAL_VARNAMES, MAGIC,
    PROTO_FLAG_HAS_CHILD, PROTO_FLAG_HAS_FFI, PROTO_FLAG_HAS_ILOOP, PROTO_FLAG_IS_VARIADIC,
    PROTO_FLAG_JIT_DISABLED,
};
use crate::opcode::OperandKind;
use crate::stream::{ByteOrder, Writer};

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

pub fn encode(dump: &Dump) -> Vec<u8> {
    let mut w = Writer::new();
    w.write_bytes(&MAGIC);
    w.write_u8(dump.version);

    let mut flags = 0u64;
    if dump.is_big_endian {
        flags |= FLAG_IS_BIG_ENDIAN;
    }
    if dump.is_stripped {
        flags |= FLAG_IS_STRIPPED;
    }
    if dump.has_ffi {
        flags |= FLAG_HAS_FFI;
    }
    w.write_uleb128(flags);

    if !dump.is_stripped {
        let name = dump.name.as_deref().unwrap_or_default();
        w.write_uleb128(name.len() as u64);
        w.write_bytes(name.as_bytes());
    }

    w.byte_order = if dump.is_big_endian { ByteOrder::Big } else { ByteOrder::Little };

    for prototype in sorted_prototypes(dump) {
        write_prototype(&mut w, prototype);
    }
    w.write_uleb128(0);

    w.buf
}

/// Flattens the prototype tree into the child-first wire order `decode`
/// expects: every nested `Const::Child` is written as its own preceding
/// block before its parent, and `decode`'s `siblings.pop()` unwinds it back
/// in the same order it was declared. Mirrors `bc/writer.py`'s
/// `_sorted_prototypes`/`get_prototypes`: a prototype's own children are
/// collected depth-first and prepended ahead of any already-collected
/// siblings, so the wire order for a parent's own constants comes out
/// reversed (last-declared child written first) and `decode`'s LIFO pop
/// reverses it back to declaration order.
fn sorted_prototypes(dump: &Dump) -> Vec<&Prototype> {
    let mut out = Vec::new();
    for prototype in &dump.prototypes {
        out.extend(collect_prototypes(prototype));
    }
    out
}

fn collect_prototypes(prototype: &Prototype) -> Vec<&Prototype> {
    let mut children: Vec<&Prototype> = Vec::new();
    for c in &prototype.constants {
        if let Const::Child(child) = &c.value {
            let mut sub = collect_prototypes(child);
            sub.extend(children);
            children = sub;
        }
    }
    children.push(prototype);
    children
}

fn write_prototype(w: &mut Writer, prototype: &Prototype) {
    let mut flags = 0u8;
    if prototype.has_child {
        flags |= PROTO_FLAG_HAS_CHILD;
    }
    if prototype.is_variadic {
        flags |= PROTO_FLAG_IS_VARIADIC;
    }
    if prototype.has_ffi {
        flags |= PROTO_FLAG_HAS_FFI;
    }
    if prototype.is_jit_disabled {
        flags |= PROTO_FLAG_JIT_DISABLED;
    }
    if prototype.has_iloop {
        flags |= PROTO_FLAG_HAS_ILOOP;
    }
    w.write_u8(flags);

    w.write_u8(prototype.argument_count);
    w.write_u8(prototype.frame_size);
    w.write_u8(prototype.upvalue_count);
    w.write_uleb128(prototype.constants.len() as u64);
    w.write_uleb128(prototype.numerics.len() as u64);
    w.write_uleb128((prototype.instructions.len() - 1) as u64);

    if prototype.debug_info_size > 0 {
        w.write_uleb128(prototype.debug_info_size);
        w.write_uleb128(prototype.first_line_number);
        w.write_uleb128(prototype.line_count);
    }

    let constant_count = prototype.constants.len() as i64;
    for ins in prototype.body_instructions() {
        write_instruction(w, ins, constant_count);
    }

    for &uv in &prototype.upvalues {
        w.write_uint(u64::from(uv), 2);
    }

    for c in &prototype.constants {
        write_const(w, &c.value);
    }

    for &n in &prototype.numerics {
        w.write_uleb128_33(n);
    }

    if let Some(debug_info) = &prototype.debug_info {
        write_line_info(w, prototype, debug_info);
        for name in &debug_info.upvalue_variable_names {
            w.write_zstring(name.as_bytes());
        }
        write_variable_info(w, &debug_info.variable_infos);
    }
}

fn write_instruction(w: &mut Writer, ins: &Instruction, constant_count: i64) {
    let schema = ins.opcode.schema();
    let mut a = 0u64;
    let mut b = 0u64;
    let mut cd = 0u64;
    let mut operand_count = 0;

    if let (Some(kind), Some(value)) = (schema.a, ins.a) {
        a = unprocess_operand(kind, value, constant_count);
        operand_count += 1;
    }
    if let (Some(kind), Some(value)) = (schema.b, ins.b) {
        b = unprocess_operand(kind, value, constant_count);
        operand_count += 1;
    }
    if let (Some(kind), Some(value)) = (schema.cd, ins.cd) {
        cd = unprocess_operand(kind, value, constant_count);
        operand_count += 1;
    }

    let opcode = ins.opcode as u64;
    let codeword = if operand_count == 3 {
        opcode | (a << 8) | (b << 24) | (cd << 16)
    } else {
        opcode | (a << 8) | (cd << 16)
    };
    w.write_uint(codeword, 4);
}

fn unprocess_operand(kind: OperandKind, value: i64, constant_count: i64) -> u64 {
    if kind.is_const_ref() {
        (constant_count - value - 1) as u64
    } else if kind == OperandKind::Jmp {
        (value + 0x8000) as u64
    } else if kind == OperandKind::SLit {
        (value as i32 as u16) as u64
    } else {
        value as u64
    }
}

fn write_const(w: &mut Writer, value: &Const) {
    match value {
        Const::Str(s) => {
            w.write_uleb128(s.len() as u64 + BCDUMP_KGC_STR);
            w.write_bytes(s.as_bytes());
        }
        Const::Table(table) => {
            w.write_uleb128(BCDUMP_KGC_TAB);
            write_table(w, table);
        }
        Const::Child(_) => {
            w.write_uleb128(BCDUMP_KGC_CHILD);
        }
        Const::I64(v) => {
            w.write_uleb128(BCDUMP_KGC_I64);
            w.write_float(*v);
        }
        Const::U64(v) => {
            w.write_uleb128(BCDUMP_KGC_U64);
            w.write_float(*v);
        }
        Const::Complex(re, im) => {
            w.write_uleb128(BCDUMP_KGC_COMPLEX);
            w.write_float(*re);
            w.write_float(*im);
        }
    }
}

fn write_table(w: &mut Writer, table: &Table) {
    w.write_uleb128(table.array.len() as u64);
    w.write_uleb128(table.dictionary.len() as u64);
    for item in &table.array {
        write_table_item(w, item);
    }
    for (key, value) in &table.dictionary {
        write_table_item(w, key);
        write_table_item(w, value);
    }
}

fn write_table_item(w: &mut Writer, value: &TableValue) {
    match value {
        TableValue::Nil => w.write_uleb128(BCDUMP_KTAB_NIL),
        TableValue::Bool(false) => w.write_uleb128(BCDUMP_KTAB_FALSE),
        TableValue::Bool(true) => w.write_uleb128(BCDUMP_KTAB_TRUE),
        TableValue::Str(s) => {
            w.write_uleb128(s.len() as u64 + BCDUMP_KTAB_STR);
            w.write_bytes(s.as_bytes());
        }
        TableValue::Int(v) => {
            w.write_uleb128(BCDUMP_KTAB_INT);
            w.write_signed_uleb128(*v);
        }
        TableValue::Num(v) => {
            w.write_uleb128(BCDUMP_KTAB_NUM);
            w.write_float(*v);
        }
    }
}

fn write_line_info(w: &mut Writer, prototype: &Prototype, debug_info: &crate::ir::DebugInfo) {
    let line_info_size = if prototype.line_count >= 65536 {
        4
    } else if prototype.line_count >= 256 {
        2
    } else {
        1
    };
    for &line in &debug_info.addr_to_line_map[1..] {
        w.write_uint(line - prototype.first_line_number, line_info_size);
    }
}

/// Unlike the original (which writes the full name, first byte included,
/// through `write_zstring` — inconsistent with what the reader expects for
/// visible names), this writes the tag byte raw and zstrings only the
/// remainder, so encode/decode round-trip.
fn write_variable_info(w: &mut Writer, infos: &[VariableInfo]) {
    let mut last_addr = 0u64;
    for info in infos {
        match info.kind {
            VariableKind::Visible => {
                let bytes = info.name.as_bytes();
                w.write_u8(bytes[0]);
                w.write_zstring(&bytes[1..]);
            }
            VariableKind::Internal => {
                let index = INTERNAL_VARNAMES
                    .iter()
                    .position(|&n| n == info.name)
                    .expect("internal variable name must be one of the reserved names") as u8;
                w.write_u8(index);
            }
        }
        w.write_uleb128(info.start_addr - last_addr);
        w.write_uleb128(info.end_addr - info.start_addr);
        last_addr = info.start_addr;
    }
    w.write_u8(VARNAME_END);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode;
    use crate::ir::ConstRef;

    #[test]
    fn empty_function_round_trips() {
        let dump = Dump {
            version: 2,
            is_big_endian: false,
            is_stripped: true,
            has_ffi: false,
            name: None,
            prototypes: vec![Prototype {
                number: 0,
                has_child: false,
                is_variadic: false,
                has_ffi: false,
                is_jit_disabled: false,
                has_iloop: false,
                argument_count: 0,
                frame_size: 2,
                upvalue_count: 0,
                constant_count: 0,
                numeric_count: 0,
                instruction_count: 1,
                debug_info_size: 0,
                first_line_number: 0,
                line_count: 0,
                instructions: vec![
                    Instruction { opcode: crate::opcode::Opcode::Funcf, a: Some(2), b: None, cd: None },
                    Instruction { opcode: crate::opcode::Opcode::Ret0, a: Some(0), b: None, cd: Some(1) },
                ],
                upvalues: vec![],
                constants: vec![],
                numerics: vec![],
                debug_info: None,
            }],
        };

        let bytes = encode(&dump);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.version, dump.version);
        assert_eq!(decoded.prototypes.len(), 1);
        assert_eq!(decoded.prototypes[0].instructions.len(), 2);
        assert_eq!(decoded.prototypes[0].instructions[1].opcode, crate::opcode::Opcode::Ret0);
    }

    fn leaf_prototype(number: usize) -> Prototype {
        Prototype {
            number,
            has_child: false,
            is_variadic: false,
            has_ffi: false,
            is_jit_disabled: false,
            has_iloop: false,
            argument_count: 0,
            frame_size: 2,
            upvalue_count: 0,
            constant_count: 0,
            numeric_count: 0,
            instruction_count: 1,
            debug_info_size: 0,
            first_line_number: 0,
            line_count: 0,
            instructions: vec![
                Instruction { opcode: crate::opcode::Opcode::Funcf, a: Some(2), b: None, cd: None },
                Instruction { opcode: crate::opcode::Opcode::Ret0, a: Some(0), b: None, cd: Some(1) },
            ],
            upvalues: vec![],
            constants: vec![],
            numerics: vec![],
            debug_info: None,
        }
    }

    #[test]
    fn nested_prototype_round_trips() {
        let child = leaf_prototype(1);
        let mut parent = leaf_prototype(0);
        parent.has_child = true;
        parent.constants = vec![ConstRef { number: "0_0".to_string(), value: Const::Child(Box::new(child)) }];
        parent.constant_count = 1;

        let dump = Dump { version: 2, is_big_endian: false, is_stripped: true, has_ffi: false, name: None, prototypes: vec![parent] };

        let bytes = encode(&dump);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.prototypes.len(), 1);
        let root = &decoded.prototypes[0];
        assert_eq!(root.constants.len(), 1);
        match &root.constants[0].value {
            Const::Child(child) => {
                assert_eq!(child.instructions.len(), 2);
                assert_eq!(child.instructions[1].opcode, crate::opcode::Opcode::Ret0);
            }
            other => panic!("expected a child prototype constant, got {other:?}"),
        }
    }
}
