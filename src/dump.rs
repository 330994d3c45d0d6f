//! Debug dumper (C8): a human-readable listing of a decoded [`Dump`].
//!
//! Grounded on `bc/formatter.py`'s `Formatter`, which serialises a decoded
//! dump back into re-runnable Python source calling the original's own
//! constructors. Rust has no equivalent "paste this back into the decoder"
//! use case, so this module keeps the original's structure (one block per
//! prototype, one line per instruction, operands resolved against the
//! constant pool) but renders it as plain indented text for a human reading
//! `--dump-ir` output rather than as re-executable code.

use std::fmt::Write as _;

use crate::ir::{Const, ConstRef, Dump, Instruction, Prototype, Table, TableValue};
use crate::opcode::OperandKind;

#[must_use]
pub fn dump(file: &Dump) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "version = 0x{:02x}", file.version);
    let _ = writeln!(out, "big_endian = {}", file.is_big_endian);
    let _ = writeln!(out, "stripped = {}", file.is_stripped);
    let _ = writeln!(out, "has_ffi = {}", file.has_ffi);
    let _ = writeln!(out, "name = {:?}", file.name.as_deref().unwrap_or(""));
    for prototype in &file.prototypes {
        dump_prototype(&mut out, prototype);
    }
    out
}

fn dump_prototype(out: &mut String, p: &Prototype) {
    let _ = writeln!(out, "\nprototype {} {{", p.number);
    let _ = writeln!(out, "\targuments = {}, frame_size = {}, upvalues = {}", p.argument_count, p.frame_size, p.upvalue_count);
    let _ = writeln!(
        out,
        "\tflags = variadic:{} ffi:{} jit_disabled:{} has_iloop:{}",
        p.is_variadic, p.has_ffi, p.is_jit_disabled, p.has_iloop
    );
    let _ = writeln!(out, "\tinstructions = {}, constants = {}, numerics = {}", p.instruction_count, p.constant_count, p.numeric_count);

    let _ = writeln!(out, "\tcode:");
    for (pc, ins) in p.instructions.iter().enumerate() {
        let _ = writeln!(out, "\t\t{:04} {}", pc, format_instruction(ins, p));
    }

    if !p.constants.is_empty() {
        let _ = writeln!(out, "\tconstants:");
        for c in &p.constants {
            let _ = writeln!(out, "\t\t{} = {}", c.number, format_const(&c.value));
        }
    }

    if let Some(info) = &p.debug_info {
        let _ = writeln!(out, "\tdebug:");
        let _ = writeln!(out, "\t\tfirst_line = {}, line_count = {}", p.first_line_number, p.line_count);
        for v in &info.variable_infos {
            let _ = writeln!(out, "\t\tvar {} [{}, {}) {:?}", v.name, v.start_addr, v.end_addr, v.kind);
        }
    }

    let _ = writeln!(out, "}}");
}

fn format_instruction(ins: &Instruction, p: &Prototype) -> String {
    let mut parts = Vec::new();
    if let Some(a) = ins.a {
        parts.push(format_operand(ins.opcode.schema().a, a, p));
    }
    if let Some(b) = ins.b {
        parts.push(format_operand(ins.opcode.schema().b, b, p));
    }
    if let Some(cd) = ins.cd {
        parts.push(format_operand(ins.opcode.schema().cd, cd, p));
    }
    format!("{}({})", ins.opcode.mnemonic(), parts.join(", "))
}

fn format_operand(kind: Option<OperandKind>, value: i64, p: &Prototype) -> String {
    match kind {
        Some(OperandKind::Str | OperandKind::Tab | OperandKind::Fun | OperandKind::Cdt) => p
            .constants
            .get(value as usize)
            .map_or_else(|| format!("const[{value}]"), |c| c.number.clone()),
        _ => value.to_string(),
    }
}

fn format_const(c: &Const) -> String {
    match c {
        Const::Child(proto) => format!("prototype_{}", proto.number),
        Const::Table(t) => format_table(t),
        Const::I64(v) => format!("{v}LL"),
        Const::U64(v) => format!("{v}ULL"),
        Const::Complex(re, im) => format!("{re}+{im}i"),
        Const::Str(s) => format!("{s:?}"),
    }
}

fn format_table(t: &Table) -> String {
    let mut parts: Vec<String> = t.array.iter().map(format_table_value).collect();
    for (k, v) in &t.dictionary {
        parts.push(format!("[{}] = {}", format_table_value(k), format_table_value(v)));
    }
    format!("{{{}}}", parts.join(", "))
}

fn format_table_value(v: &TableValue) -> String {
    match v {
        TableValue::Nil => "nil".to_string(),
        TableValue::Bool(b) => b.to_string(),
        TableValue::Int(n) => n.to_string(),
        TableValue::Num(n) => n.to_string(),
        TableValue::Str(s) => format!("{s:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ConstRef, Dump, Instruction, Prototype};
    use crate::opcode::Opcode;

    fn sample_prototype() -> Prototype {
        Prototype {
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
                Instruction { opcode: Opcode::Funcv, a: Some(2), b: None, cd: None },
                Instruction { opcode: Opcode::Ret0, a: None, b: None, cd: Some(0) },
            ],
            upvalues: vec![],
            constants: vec![],
            numerics: vec![],
            debug_info: None,
        }
    }

    #[test]
    fn dump_includes_opcode_mnemonics() {
        let file = Dump { version: 2, is_big_endian: false, is_stripped: false, has_ffi: false, name: Some("x.lua".to_string()), prototypes: vec![sample_prototype()] };
        let out = dump(&file);
        assert!(out.contains("FUNCV"));
        assert!(out.contains("RET0"));
        assert!(out.contains("prototype 0"));
    }

    #[test]
    fn const_ref_resolves_to_stable_name() {
        let c = ConstRef { number: "0_0".to_string(), value: Const::Str("hi".to_string()) };
        assert_eq!(format_const(&c.value), "\"hi\"");
    }
}
