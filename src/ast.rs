//! Shared AST vocabulary used by the builder (C4), the CFG reducer (C5),
//! and the temporary-slot eliminator (C6).
//!
//! Grounded on `cfa/ast.py`. Every node there that carries a source
//! position (`Statement.addr`) becomes a [`Stmt`] here — a thin
//! `{ addr, kind }` wrapper around [`StmtKind`], since Rust has no
//! free-form instance-attribute assignment to bolt `addr` onto an
//! arbitrary class the way the original does.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
    Len,
}

impl UnOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            UnOp::Not => "not",
            UnOp::Neg => "-",
            UnOp::Len => "#",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Ge,
    Le,
    Gt,
    Eq,
    Ne,
}

impl CmpOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Ge => ">=",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Eq => "==",
            CmpOp::Ne => "~=",
        }
    }

    #[must_use]
    pub fn reversed(self) -> CmpOp {
        match self {
            CmpOp::Lt => CmpOp::Ge,
            CmpOp::Ge => CmpOp::Lt,
            CmpOp::Le => CmpOp::Gt,
            CmpOp::Gt => CmpOp::Le,
            CmpOp::Eq => CmpOp::Ne,
            CmpOp::Ne => CmpOp::Eq,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Concat,
}

impl ArithOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
            ArithOp::Pow => "^",
            ArithOp::Concat => "..",
        }
    }

    /// Non-associative on the right, matching the `'-', '/', '%'` rule
    /// (`OP_PRECEDENCE`-adjacent behaviour in `cfa/writer.py`).
    #[must_use]
    pub fn right_associative_paren_required(self) -> bool {
        matches!(self, ArithOp::Sub | ArithOp::Div | ArithOp::Mod)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Or,
}

impl LogicOp {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LogicOp::And => "and",
            LogicOp::Or => "or",
        }
    }
}

/// Operator precedence, lowest binds loosest: `or < and < comparison < ..
/// < +/- < */// < unary < ^`.
#[must_use]
pub fn precedence_logic(op: LogicOp) -> u8 {
    match op {
        LogicOp::Or => 0,
        LogicOp::And => 1,
    }
}

#[must_use]
pub fn precedence_cmp(_op: CmpOp) -> u8 {
    2
}

#[must_use]
pub fn precedence_arith(op: ArithOp) -> u8 {
    match op {
        ArithOp::Concat => 3,
        ArithOp::Add | ArithOp::Sub => 4,
        ArithOp::Mul | ArithOp::Div | ArithOp::Mod => 5,
        ArithOp::Pow => 7,
    }
}

pub const PRECEDENCE_UNARY: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Primitive {
    Nil,
    False,
    True,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Str(String),
    Int(i64),
    Num(f64),
    Complex(f64, f64),
    /// Synthetic `_env` global-table marker (`Constant('_env')` in the
    /// original).
    Env,
}

/// An expression node. `Slot`/`Upvalue` carry a slot index; negative slot
/// indices never occur for real slots, so [`MultiRes`](Exp::MultiRes) reuses
/// the original's convention of representing itself as `Slot(-1)` only in
/// spirit — here it is its own variant instead, since Rust doesn't need the
/// sentinel trick to keep a closed type open.
#[derive(Debug, Clone, PartialEq)]
pub enum Exp {
    Un(UnOp, Box<Exp>),
    BinArith(ArithOp, Box<Exp>, Box<Exp>),
    Slot(i64),
    Upvalue(i64),
    Constant(ConstValue),
    Literal(i64),
    Primitive(Primitive),
    TableConstructor { array: Vec<Exp>, dictionary: Vec<(Exp, Exp)> },
    TableElement { table: Box<Exp>, key: Box<Exp> },
    MultiRes,
    Vararg,
    FuncCall { func: Box<Exp>, args: Vec<Exp>, is_variadic: bool },
    FuncDef(Box<FuncDef>),
}

impl Exp {
    #[must_use]
    pub fn slot(n: i64) -> Exp {
        Exp::Slot(n)
    }

    /// Mirrors `TemporaryEliminator.can_inline`'s multi-use carve-out, which
    /// checks `value.key.value == '_env'` — the key, not the table. A real
    /// global read's key is the global's own name, so this only matches a
    /// source-level global literally named `_env`; it is not a general
    /// "is this a global read" predicate.
    #[must_use]
    pub fn is_global_read(&self) -> bool {
        matches!(self, Exp::TableElement { key, .. } if matches!(**key, Exp::Constant(ConstValue::Str(ref s)) if s == "_env"))
    }
}

/// A boolean-valued test, the payload of [`StmtKind::Condition`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// `IST`/`ISF`/`ISTC`/`ISFC`-derived truthiness test.
    Test { truthy: bool, value: Exp },
    Compare { op: CmpOp, left: Exp, right: Exp },
}

impl Decision {
    pub fn reverse(&mut self) {
        match self {
            Decision::Test { truthy, .. } => *truthy = !*truthy,
            Decision::Compare { op, .. } => *op = op.reversed(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub addr: u64,
    pub kind: StmtKind,
}

impl Stmt {
    #[must_use]
    pub fn new(addr: u64, kind: StmtKind) -> Stmt {
        Stmt { addr, kind }
    }

    /// Reverses the boolean sense of a `Condition` or `BinCondition`
    /// statement in place; panics if called on any other kind, matching
    /// the original's `Decision.reverse` being defined only on that
    /// subtree.
    pub fn reverse_decision(&mut self) {
        match &mut self.kind {
            StmtKind::Condition { decision } => decision.reverse(),
            StmtKind::BinCondition { op, left, right } => {
                *op = match op {
                    LogicOp::And => LogicOp::Or,
                    LogicOp::Or => LogicOp::And,
                };
                left.reverse_decision();
                if let Some(last) = right.last_mut() {
                    last.reverse_decision();
                }
            }
            _ => panic!("reverse_decision called on a non-decision statement"),
        }
    }
}

pub type StmtList = Vec<Stmt>;

#[must_use]
pub fn stmt_list_addr(list: &StmtList) -> u64 {
    list.first().map_or(0, |s| s.addr)
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Assign { targets: Vec<Exp>, values: Vec<Exp> },
    Return { values: Vec<Exp> },
    Condition { decision: Decision },
    BinCondition { op: LogicOp, left: Box<Stmt>, right: StmtList },
    If { condition: Box<Stmt>, then_branch: StmtList, else_branch: Option<StmtList>, else_ifs: Vec<(Stmt, StmtList)> },
    ForInit { index: Exp, start: Exp, stop: Exp, step: Exp },
    ForLoop { index: Exp, start: Exp, stop: Exp, step: Exp },
    IterCall { generator: Exp, state: Exp, control: Exp, values: Vec<Exp>, iterator: Option<Exp> },
    IterLoop { index: Exp, control: Exp },
    For { init: Box<Stmt>, body: StmtList },
    ForIn { call: Box<Stmt>, body: StmtList },
    While { condition: StmtList, body: StmtList },
    Repeat { condition: Box<Stmt>, body: StmtList },
    Break,
    LoopBody,
    Nop,
}

#[derive(Debug, Clone)]
pub enum Args {
    Vararg,
    Slots(Vec<Exp>),
}

#[derive(Debug, Clone)]
pub struct FuncDef {
    pub args: Args,
    pub body: StmtList,
    pub is_root: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmp_reverses_are_involutions() {
        for op in [CmpOp::Lt, CmpOp::Ge, CmpOp::Le, CmpOp::Gt, CmpOp::Eq, CmpOp::Ne] {
            assert_eq!(op.reversed().reversed(), op);
        }
    }

    #[test]
    fn decision_reverse_flips_test_polarity() {
        let mut d = Decision::Test { truthy: true, value: Exp::Slot(0) };
        d.reverse();
        assert_eq!(d, Decision::Test { truthy: false, value: Exp::Slot(0) });
    }

    #[test]
    fn precedence_order_matches_reference() {
        assert!(precedence_logic(LogicOp::Or) < precedence_logic(LogicOp::And));
        assert!(precedence_logic(LogicOp::And) < precedence_cmp(CmpOp::Lt));
        assert!(precedence_cmp(CmpOp::Lt) < precedence_arith(ArithOp::Concat));
        assert!(precedence_arith(ArithOp::Concat) < precedence_arith(ArithOp::Add));
        assert!(precedence_arith(ArithOp::Add) < precedence_arith(ArithOp::Mul));
        assert!(precedence_arith(ArithOp::Mul) < PRECEDENCE_UNARY);
        assert!(PRECEDENCE_UNARY < precedence_arith(ArithOp::Pow));
    }
}
