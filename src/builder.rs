//! IR → AST builder (C4): per-instruction straight-line translation, plus
//! the top-level orchestration that turns one [`Prototype`] into a
//! [`FuncDef`] by handing the translated statements to the CFG reducer
//! (C5), the temporary-slot eliminator (C6), and the post-pass
//! `Transformer`.
//!
//! Grounded on `cfa/builder.py`'s `Builder`.

use tracing::debug_span;

use crate::ast::{Args, ArithOp, CmpOp, ConstValue, Decision, Exp, FuncDef, Primitive, Stmt, StmtKind, StmtList, UnOp};
use crate::cfg;
use crate::error::Result;
use crate::ir::{Const, Prototype, TableValue};
use crate::opcode::Opcode;
use crate::stream::Number;
use crate::temporary;

const MAX_RECURSION_DEPTH: usize = 256;

pub fn build(prototype: &Prototype, is_root: bool) -> Result<FuncDef> {
    build_depth(prototype, is_root, 0)
}

fn build_depth(prototype: &Prototype, is_root: bool, depth: usize) -> Result<FuncDef> {
    let _span = debug_span!("build_func_def", prototype = prototype.number).entered();
    if depth > MAX_RECURSION_DEPTH {
        return Err(crate::error::Error::InvariantViolation {
            prototype: prototype.number,
            pc: 0,
            detail: "nested function definitions exceeded the recursion cap".to_string(),
        });
    }

    let graph = cfg::build_graph(prototype, depth)?;
    let mut statements = cfg::reduce(graph, prototype.number)?;

    temporary::eliminate(&mut statements, prototype.number)?;
    temporary::transform(&mut statements);

    let args = if prototype.is_variadic {
        Args::Vararg
    } else {
        Args::Slots((0..i64::from(prototype.argument_count)).map(Exp::Slot).collect())
    };

    Ok(FuncDef { args, body: statements, is_root })
}

/// Translates instructions `[start, end)` of `prototype` into a flat
/// statement list, tagging each with its originating PC. Mirrors
/// `Builder.translate_statements`.
pub fn translate_statements(prototype: &Prototype, start: usize, end: usize, depth: usize) -> Result<StmtList> {
    let mut out = Vec::new();
    for addr in start..end {
        let ins = &prototype.instructions[addr];
        if let Some(kinds) = build_statement(prototype, ins, depth)? {
            for kind in kinds {
                out.push(Stmt::new(addr as u64, kind));
            }
        }
    }
    Ok(out)
}

fn slots(start: i64, end_inclusive: i64) -> Vec<Exp> {
    (start..=end_inclusive).map(Exp::Slot).collect()
}

fn bin_arith(op: ArithOp, l: Exp, r: Exp) -> Exp {
    Exp::BinArith(op, Box::new(l), Box::new(r))
}

fn cmp_op_for(opcode: Opcode) -> CmpOp {
    match opcode {
        Opcode::Islt => CmpOp::Lt,
        Opcode::Isge => CmpOp::Ge,
        Opcode::Isle => CmpOp::Le,
        Opcode::Isgt => CmpOp::Gt,
        Opcode::Iseqv | Opcode::Iseqs | Opcode::Iseqn | Opcode::Iseqp => CmpOp::Eq,
        Opcode::Isnev | Opcode::Isnes | Opcode::Isnen | Opcode::Isnep => CmpOp::Ne,
        other => unreachable!("{other:?} is not a comparison opcode"),
    }
}

fn arith_op_for(opcode: Opcode) -> ArithOp {
    match opcode {
        Opcode::Addvn | Opcode::Addnv | Opcode::Addvv => ArithOp::Add,
        Opcode::Subvn | Opcode::Subnv | Opcode::Subvv => ArithOp::Sub,
        Opcode::Mulvn | Opcode::Mulnv | Opcode::Mulvv => ArithOp::Mul,
        Opcode::Divvn | Opcode::Divnv | Opcode::Divvv => ArithOp::Div,
        Opcode::Modvn | Opcode::Modnv | Opcode::Modvv => ArithOp::Mod,
        Opcode::Pow => ArithOp::Pow,
        other => unreachable!("{other:?} is not an arithmetic opcode"),
    }
}

/// Builds the zero, one, or two statements a single instruction expands
/// to, or `None` for instructions that only shape control flow (`ISNEXT`,
/// `JMP`, loop/func markers, `UCLO`). Mirrors `Builder.build_statement`.
fn build_statement(prototype: &Prototype, ins: &crate::ir::Instruction, depth: usize) -> Result<Option<Vec<StmtKind>>> {
    use Opcode::*;

    let a = ins.a.unwrap_or(0);
    let b = ins.b.unwrap_or(0);
    let cd = ins.cd.unwrap_or(0);

    let kind = match ins.opcode {
        Islt | Isge | Isle | Isgt | Iseqv | Isnev | Iseqs | Isnes | Iseqn | Isnen | Iseqp | Isnep => {
            let op = cmp_op_for(ins.opcode);
            let right = build_operand(prototype, ins.opcode, cd)?;
            return Ok(Some(vec![StmtKind::Condition {
                decision: Decision::Compare { op, left: Exp::Slot(a), right },
            }]));
        }

        Istc | Isfc => {
            return Ok(Some(vec![
                StmtKind::Assign { targets: vec![Exp::Slot(a)], values: vec![Exp::Slot(cd)] },
                StmtKind::Condition {
                    decision: Decision::Test { truthy: ins.opcode == Istc, value: Exp::Slot(cd) },
                },
            ]));
        }

        Ist | Isf => {
            return Ok(Some(vec![StmtKind::Condition {
                decision: Decision::Test { truthy: ins.opcode == Ist, value: Exp::Slot(cd) },
            }]));
        }

        Mov | Not | Unm | Len => {
            let value = if ins.opcode == Mov {
                Exp::Slot(cd)
            } else {
                let op = match ins.opcode {
                    Not => UnOp::Not,
                    Unm => UnOp::Neg,
                    Len => UnOp::Len,
                    _ => unreachable!(),
                };
                Exp::Un(op, Box::new(Exp::Slot(cd)))
            };
            StmtKind::Assign { targets: vec![Exp::Slot(a)], values: vec![value] }
        }

        Addvn | Subvn | Mulvn | Divvn | Modvn | Addnv | Subnv | Mulnv | Divnv | Modnv | Addvv | Subvv
        | Mulvv | Divvv | Modvv | Pow => {
            let op = arith_op_for(ins.opcode);
            let right = build_operand(prototype, ins.opcode, cd)?;
            StmtKind::Assign { targets: vec![Exp::Slot(a)], values: vec![bin_arith(op, Exp::Slot(b), right)] }
        }

        Cat => {
            let mut iter = (b..=cd).map(Exp::Slot);
            let first = iter.next().expect("CAT requires at least one slot");
            let value = iter.fold(first, |acc, rhs| bin_arith(ArithOp::Concat, acc, rhs));
            StmtKind::Assign { targets: vec![Exp::Slot(a)], values: vec![value] }
        }

        Kstr | Kcdata | Kshort | Knum | Kpri => {
            let value = build_operand(prototype, ins.opcode, cd)?;
            StmtKind::Assign { targets: vec![Exp::Slot(a)], values: vec![value] }
        }

        Knil => StmtKind::Assign {
            targets: slots(a, cd),
            values: (a..=cd).map(|_| Exp::Primitive(Primitive::Nil)).collect(),
        },

        Uget | Usetv | Usets | Usetn | Usetp => {
            let lhs = build_a_operand(ins.opcode, a);
            let rhs = build_operand(prototype, ins.opcode, cd)?;
            StmtKind::Assign { targets: vec![lhs], values: vec![rhs] }
        }

        Fnew => {
            let child = child_prototype(prototype, cd)?;
            let func_def = build_depth(child, false, depth + 1)?;
            StmtKind::Assign { targets: vec![Exp::Slot(a)], values: vec![Exp::FuncDef(Box::new(func_def))] }
        }

        Tnew => StmtKind::Assign {
            targets: vec![Exp::Slot(a)],
            values: vec![Exp::TableConstructor { array: vec![], dictionary: vec![] }],
        },

        Tdup => {
            let table = table_template(prototype, cd)?;
            let array = table.array.iter().map(table_value_to_exp).collect();
            let dictionary = table
                .dictionary
                .iter()
                .map(|(k, v)| (table_value_to_exp(k), table_value_to_exp(v)))
                .collect();
            StmtKind::Assign {
                targets: vec![Exp::Slot(a)],
                values: vec![Exp::TableConstructor { array, dictionary }],
            }
        }

        Gget | Tgetv | Tgets | Tgetb => {
            let table = if ins.opcode == Gget { Exp::Constant(ConstValue::Env) } else { Exp::Slot(b) };
            let key = build_operand(prototype, ins.opcode, cd)?;
            StmtKind::Assign {
                targets: vec![build_a_operand(ins.opcode, a)],
                values: vec![Exp::TableElement { table: Box::new(table), key: Box::new(key) }],
            }
        }

        Gset | Tsetv | Tsets | Tsetb => {
            let table = if ins.opcode == Gset { Exp::Constant(ConstValue::Env) } else { Exp::Slot(b) };
            let key = build_operand(prototype, ins.opcode, cd)?;
            StmtKind::Assign {
                targets: vec![Exp::TableElement { table: Box::new(table), key: Box::new(key) }],
                values: vec![build_a_operand(ins.opcode, a)],
            }
        }

        Tsetm => StmtKind::Assign {
            targets: vec![Exp::TableElement { table: Box::new(Exp::Slot(a - 1)), key: Box::new(Exp::Vararg) }],
            values: vec![Exp::MultiRes],
        },

        Callm | Call | Callmt | Callt => {
            let is_variadic_call = matches!(ins.opcode, Callm | Callmt);
            let arg_hi = a + cd + i64::from(is_variadic_call);
            let mut args = slots(a + 1, arg_hi - 1);
            if is_variadic_call {
                args.push(Exp::MultiRes);
            }
            let call = Exp::FuncCall { func: Box::new(Exp::Slot(a)), args, is_variadic: is_variadic_call };

            if matches!(ins.opcode, Callm | Call) {
                if b > 0 {
                    StmtKind::Assign { targets: slots(a, a + b - 2), values: vec![call] }
                } else {
                    StmtKind::Assign { targets: vec![Exp::MultiRes], values: vec![call] }
                }
            } else {
                StmtKind::Return { values: vec![call] }
            }
        }

        Iterc | Itern => StmtKind::IterCall {
            generator: Exp::Slot(a - 3),
            state: Exp::Slot(a - 2),
            control: Exp::Slot(a - 1),
            values: slots(a, a + b - 2),
            iterator: None,
        },

        Varg => {
            if b - 2 < 0 {
                StmtKind::Assign { targets: vec![Exp::MultiRes], values: vec![Exp::Vararg] }
            } else {
                StmtKind::Assign { targets: slots(a, a + b - 2), values: vec![Exp::Vararg] }
            }
        }

        Retm => {
            let mut values = slots(a, a + cd - 1);
            values.push(Exp::MultiRes);
            StmtKind::Return { values }
        }

        Ret | Ret0 | Ret1 => StmtKind::Return { values: slots(a, a + cd - 2) },

        Fori | Jfori => StmtKind::ForInit {
            index: Exp::Slot(a + 3),
            start: Exp::Slot(a),
            stop: Exp::Slot(a + 1),
            step: Exp::Slot(a + 2),
        },

        Forl | Iforl | Jforl => StmtKind::ForLoop {
            index: Exp::Slot(a + 3),
            start: Exp::Slot(a),
            stop: Exp::Slot(a + 1),
            step: Exp::Slot(a + 2),
        },

        Iterl | Iiterl | Jiterl => StmtKind::IterLoop { index: Exp::Slot(a), control: Exp::Slot(a - 1) },

        Loop | Iloop | Jloop => StmtKind::LoopBody,

        Isnext | Jmp | Uclo | Funcf | Ifuncf | Jfuncf | Funcv | Ifuncv | Jfuncv | Funcc | Funccw => {
            return Ok(None)
        }
    };

    Ok(Some(vec![kind]))
}

fn build_a_operand(opcode: Opcode, a: i64) -> Exp {
    match opcode.schema().a {
        Some(crate::opcode::OperandKind::Uv) => Exp::Upvalue(a),
        _ => Exp::Slot(a),
    }
}

fn child_prototype(prototype: &Prototype, index: i64) -> Result<&Prototype> {
    match &prototype.constants[index as usize].value {
        Const::Child(child) => Ok(child),
        _ => Err(crate::error::Error::InvariantViolation {
            prototype: prototype.number,
            pc: 0,
            detail: format!("constant {index} is not a child prototype"),
        }),
    }
}

fn table_template(prototype: &Prototype, index: i64) -> Result<&crate::ir::Table> {
    match &prototype.constants[index as usize].value {
        Const::Table(table) => Ok(table),
        _ => Err(crate::error::Error::InvariantViolation {
            prototype: prototype.number,
            pc: 0,
            detail: format!("constant {index} is not a table template"),
        }),
    }
}

fn table_value_to_exp(value: &TableValue) -> Exp {
    match value {
        TableValue::Nil => Exp::Primitive(Primitive::Nil),
        TableValue::Bool(true) => Exp::Primitive(Primitive::True),
        TableValue::Bool(false) => Exp::Primitive(Primitive::False),
        TableValue::Int(v) => Exp::Constant(ConstValue::Int(*v)),
        TableValue::Num(v) => Exp::Constant(ConstValue::Num(*v)),
        TableValue::Str(v) => Exp::Constant(ConstValue::Str(v.clone())),
    }
}

/// Builds the expression for an operand whose kind comes from the
/// opcode's CD (or, for a handful of opcodes, A) schema slot. Mirrors
/// `Builder.build_operand`.
fn build_operand(prototype: &Prototype, opcode: Opcode, op: i64) -> Result<Exp> {
    use crate::opcode::OperandKind as K;

    let kind = opcode.schema().cd.unwrap_or(K::Lit);
    Ok(match kind {
        K::Str | K::Cdt => match &prototype.constants[op as usize].value {
            Const::Str(s) => Exp::Constant(ConstValue::Str(s.clone())),
            Const::I64(v) => Exp::Constant(ConstValue::Num(*v)),
            Const::U64(v) => Exp::Constant(ConstValue::Num(*v)),
            Const::Complex(re, im) => Exp::Constant(ConstValue::Complex(*re, *im)),
            Const::Table(_) | Const::Child(_) => {
                return Err(crate::error::Error::InvariantViolation {
                    prototype: prototype.number,
                    pc: 0,
                    detail: format!("constant {op} used as a scalar but is a table or child prototype"),
                })
            }
        },
        K::Num => match prototype.numerics[op as usize] {
            Number::Int(v) => Exp::Constant(ConstValue::Int(v)),
            Number::Double(v) => Exp::Constant(ConstValue::Num(v)),
        },
        K::Pri => match op {
            0 => Exp::Primitive(Primitive::Nil),
            1 => Exp::Primitive(Primitive::False),
            _ => Exp::Primitive(Primitive::True),
        },
        K::Var | K::Dst => Exp::Slot(op),
        K::Uv => Exp::Upvalue(op),
        K::Lit | K::SLit => Exp::Literal(op),
        K::Tab | K::Fun | K::Bs | K::Rbs | K::Jmp => Exp::Literal(op),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Instruction;

    fn proto() -> Prototype {
        Prototype {
            number: 0,
            has_child: false,
            is_variadic: false,
            has_ffi: false,
            is_jit_disabled: false,
            has_iloop: false,
            argument_count: 0,
            frame_size: 4,
            upvalue_count: 0,
            constant_count: 0,
            numeric_count: 0,
            instruction_count: 0,
            debug_info_size: 0,
            first_line_number: 0,
            line_count: 0,
            instructions: vec![],
            upvalues: vec![],
            constants: vec![],
            numerics: vec![],
            debug_info: None,
        }
    }

    #[test]
    fn addvv_becomes_assign_with_bin_arith() {
        let p = proto();
        let ins = Instruction { opcode: Opcode::Addvv, a: Some(2), b: Some(0), cd: Some(1) };
        let kinds = build_statement(&p, &ins, 0).unwrap().unwrap();
        assert_eq!(kinds.len(), 1);
        match &kinds[0] {
            StmtKind::Assign { targets, values } => {
                assert_eq!(targets, &[Exp::Slot(2)]);
                assert_eq!(values, &[bin_arith(ArithOp::Add, Exp::Slot(0), Exp::Slot(1))]);
            }
            _ => panic!("expected Assign"),
        }
    }

    #[test]
    fn ret0_becomes_empty_return() {
        let p = proto();
        let ins = Instruction { opcode: Opcode::Ret0, a: Some(0), b: None, cd: Some(1) };
        let kinds = build_statement(&p, &ins, 0).unwrap().unwrap();
        match &kinds[0] {
            StmtKind::Return { values } => assert!(values.is_empty()),
            _ => panic!("expected Return"),
        }
    }

    #[test]
    fn jmp_produces_no_statement() {
        let p = proto();
        let ins = Instruction { opcode: Opcode::Jmp, a: Some(0), b: None, cd: Some(5) };
        assert!(build_statement(&p, &ins, 0).unwrap().is_none());
    }
}
