//! Static instruction schema: the fixed wire order of opcodes and the
//! operand-kind tags attached to each of the three operand slots.
//!
//! Grounded on the reference implementation's `Ins` table in `bc/data.py`,
//! where opcode number is simply position in the table. `OperandKind` is
//! `InsType` renamed; `None` operand slots (no operand at that position)
//! are represented with `Option<OperandKind>` exactly as the original does.

use num_enum::TryFromPrimitive;

use crate::error::Error;

/// The kind of value an operand slot holds, independent of which of the
/// three wire fields (A, B, CD) it occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// A variable/source register slot.
    Var,
    /// A destination register slot.
    Dst,
    /// A base register slot (start of a contiguous run, e.g. call args).
    Bs,
    /// Like `Bs` but read-only / "range" base slot (CAT, RET, UCLO, JMP).
    Rbs,
    /// Upvalue index.
    Uv,
    /// Raw unsigned literal.
    Lit,
    /// Signed literal, sign-extended from 16 bits.
    SLit,
    /// Primitive tag (nil / false / true).
    Pri,
    /// Index into the numeric constant pool.
    Num,
    /// Index into the constant pool, string payload.
    Str,
    /// Index into the constant pool, table template payload.
    Tab,
    /// Index into the constant pool, child-function payload.
    Fun,
    /// Index into the constant pool, cdata payload.
    Cdt,
    /// Jump offset, biased by 0x8000 on the wire.
    Jmp,
}

impl OperandKind {
    /// Whether this operand kind addresses the constant pool and must be
    /// normalised from `constcount - k - 1` to a direct index on decode.
    #[must_use]
    pub fn is_const_ref(self) -> bool {
        matches!(self, OperandKind::Str | OperandKind::Tab | OperandKind::Fun | OperandKind::Cdt)
    }
}

/// One row of the static instruction schema: a mnemonic plus the operand
/// kind occupying the A, B, and CD wire fields (absent where `None`).
#[derive(Debug, Clone, Copy)]
pub struct InstructionSchema {
    pub mnemonic: &'static str,
    pub a: Option<OperandKind>,
    pub b: Option<OperandKind>,
    pub cd: Option<OperandKind>,
}

macro_rules! schema {
    ($name:ident, $a:expr, $b:expr, $cd:expr) => {
        InstructionSchema { mnemonic: stringify!($name), a: $a, b: $b, cd: $cd }
    };
}

use OperandKind::*;

/// The full opcode table in wire order. Opcode value = index into this
/// array, exactly mirroring the reference implementation's `Ins` class
/// (table position defines `OPCODE`).
pub static SCHEMA: &[InstructionSchema] = &[
    schema!(ISLT, Some(Var), None, Some(Var)),
    schema!(ISGE, Some(Var), None, Some(Var)),
    schema!(ISLE, Some(Var), None, Some(Var)),
    schema!(ISGT, Some(Var), None, Some(Var)),
    schema!(ISEQV, Some(Var), None, Some(Var)),
    schema!(ISNEV, Some(Var), None, Some(Var)),
    schema!(ISEQS, Some(Var), None, Some(Str)),
    schema!(ISNES, Some(Var), None, Some(Str)),
    schema!(ISEQN, Some(Var), None, Some(Num)),
    schema!(ISNEN, Some(Var), None, Some(Num)),
    schema!(ISEQP, Some(Var), None, Some(Pri)),
    schema!(ISNEP, Some(Var), None, Some(Pri)),
    schema!(ISTC, Some(Dst), None, Some(Var)),
    schema!(ISFC, Some(Dst), None, Some(Var)),
    schema!(IST, None, None, Some(Var)),
    schema!(ISF, None, None, Some(Var)),
    schema!(MOV, Some(Dst), None, Some(Var)),
    schema!(NOT, Some(Dst), None, Some(Var)),
    schema!(UNM, Some(Dst), None, Some(Var)),
    schema!(LEN, Some(Dst), None, Some(Var)),
    schema!(ADDVN, Some(Dst), Some(Var), Some(Num)),
    schema!(SUBVN, Some(Dst), Some(Var), Some(Num)),
    schema!(MULVN, Some(Dst), Some(Var), Some(Num)),
    schema!(DIVVN, Some(Dst), Some(Var), Some(Num)),
    schema!(MODVN, Some(Dst), Some(Var), Some(Num)),
    schema!(ADDNV, Some(Dst), Some(Var), Some(Num)),
    schema!(SUBNV, Some(Dst), Some(Var), Some(Num)),
    schema!(MULNV, Some(Dst), Some(Var), Some(Num)),
    schema!(DIVNV, Some(Dst), Some(Var), Some(Num)),
    schema!(MODNV, Some(Dst), Some(Var), Some(Num)),
    schema!(ADDVV, Some(Dst), Some(Var), Some(Var)),
    schema!(SUBVV, Some(Dst), Some(Var), Some(Var)),
    schema!(MULVV, Some(Dst), Some(Var), Some(Var)),
    schema!(DIVVV, Some(Dst), Some(Var), Some(Var)),
    schema!(MODVV, Some(Dst), Some(Var), Some(Var)),
    schema!(POW, Some(Dst), Some(Var), Some(Var)),
    schema!(CAT, Some(Dst), Some(Rbs), Some(Rbs)),
    schema!(KSTR, Some(Dst), None, Some(Str)),
    schema!(KCDATA, Some(Dst), None, Some(Cdt)),
    schema!(KSHORT, Some(Dst), None, Some(SLit)),
    schema!(KNUM, Some(Dst), None, Some(Num)),
    schema!(KPRI, Some(Dst), None, Some(Pri)),
    schema!(KNIL, Some(Bs), None, Some(Bs)),
    schema!(UGET, Some(Dst), None, Some(Uv)),
    schema!(USETV, Some(Uv), None, Some(Var)),
    schema!(USETS, Some(Uv), None, Some(Str)),
    schema!(USETN, Some(Uv), None, Some(Num)),
    schema!(USETP, Some(Uv), None, Some(Pri)),
    schema!(UCLO, Some(Rbs), None, Some(Jmp)),
    schema!(FNEW, Some(Dst), None, Some(Fun)),
    schema!(TNEW, Some(Dst), None, Some(Lit)),
    schema!(TDUP, Some(Dst), None, Some(Tab)),
    schema!(GGET, Some(Dst), None, Some(Str)),
    schema!(GSET, Some(Var), None, Some(Str)),
    schema!(TGETV, Some(Dst), Some(Var), Some(Var)),
    schema!(TGETS, Some(Dst), Some(Var), Some(Str)),
    schema!(TGETB, Some(Dst), Some(Var), Some(Lit)),
    schema!(TSETV, Some(Var), Some(Var), Some(Var)),
    schema!(TSETS, Some(Var), Some(Var), Some(Str)),
    schema!(TSETB, Some(Var), Some(Var), Some(Lit)),
    schema!(TSETM, Some(Bs), None, Some(Num)),
    schema!(CALLM, Some(Bs), Some(Lit), Some(Lit)),
    schema!(CALL, Some(Bs), Some(Lit), Some(Lit)),
    schema!(CALLMT, Some(Bs), None, Some(Lit)),
    schema!(CALLT, Some(Bs), None, Some(Lit)),
    schema!(ITERC, Some(Bs), Some(Lit), Some(Lit)),
    schema!(ITERN, Some(Bs), Some(Lit), Some(Lit)),
    schema!(VARG, Some(Bs), Some(Lit), Some(Lit)),
    schema!(ISNEXT, Some(Bs), None, Some(Jmp)),
    schema!(RETM, Some(Bs), None, Some(Lit)),
    schema!(RET, Some(Rbs), None, Some(Lit)),
    schema!(RET0, Some(Rbs), None, Some(Lit)),
    schema!(RET1, Some(Rbs), None, Some(Lit)),
    schema!(FORI, Some(Bs), None, Some(Jmp)),
    schema!(JFORI, Some(Bs), None, Some(Jmp)),
    schema!(FORL, Some(Bs), None, Some(Jmp)),
    schema!(IFORL, Some(Bs), None, Some(Jmp)),
    schema!(JFORL, Some(Bs), None, Some(Jmp)),
    schema!(ITERL, Some(Bs), None, Some(Jmp)),
    schema!(IITERL, Some(Bs), None, Some(Jmp)),
    schema!(JITERL, Some(Bs), None, Some(Lit)),
    schema!(LOOP, Some(Rbs), None, Some(Jmp)),
    schema!(ILOOP, Some(Rbs), None, Some(Jmp)),
    schema!(JLOOP, Some(Rbs), None, Some(Lit)),
    schema!(JMP, Some(Rbs), None, Some(Jmp)),
    schema!(FUNCF, Some(Rbs), None, None),
    schema!(IFUNCF, Some(Rbs), None, None),
    schema!(JFUNCF, Some(Rbs), None, Some(Lit)),
    schema!(FUNCV, Some(Rbs), None, None),
    schema!(IFUNCV, Some(Rbs), None, None),
    schema!(JFUNCV, Some(Rbs), None, Some(Lit)),
    schema!(FUNCC, Some(Rbs), None, None),
    schema!(FUNCCW, Some(Rbs), None, None),
];

/// Numeric opcode, validated at construction against [`SCHEMA`]'s bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
#[non_exhaustive]
pub enum Opcode {
    Islt = 0,
    Isge = 1,
    Isle = 2,
    Isgt = 3,
    Iseqv = 4,
    Isnev = 5,
    Iseqs = 6,
    Isnes = 7,
    Iseqn = 8,
    Isnen = 9,
    Iseqp = 10,
    Isnep = 11,
    Istc = 12,
    Isfc = 13,
    Ist = 14,
    Isf = 15,
    Mov = 16,
    Not = 17,
    Unm = 18,
    Len = 19,
    Addvn = 20,
    Subvn = 21,
    Mulvn = 22,
    Divvn = 23,
    Modvn = 24,
    Addnv = 25,
    Subnv = 26,
    Mulnv = 27,
    Divnv = 28,
    Modnv = 29,
    Addvv = 30,
    Subvv = 31,
    Mulvv = 32,
    Divvv = 33,
    Modvv = 34,
    Pow = 35,
    Cat = 36,
    Kstr = 37,
    Kcdata = 38,
    Kshort = 39,
    Knum = 40,
    Kpri = 41,
    Knil = 42,
    Uget = 43,
    Usetv = 44,
    Usets = 45,
    Usetn = 46,
    Usetp = 47,
    Uclo = 48,
    Fnew = 49,
    Tnew = 50,
    Tdup = 51,
    Gget = 52,
    Gset = 53,
    Tgetv = 54,
    Tgets = 55,
    Tgetb = 56,
    Tsetv = 57,
    Tsets = 58,
    Tsetb = 59,
    Tsetm = 60,
    Callm = 61,
    Call = 62,
    Callmt = 63,
    Callt = 64,
    Iterc = 65,
    Itern = 66,
    Varg = 67,
    Isnext = 68,
    Retm = 69,
    Ret = 70,
    Ret0 = 71,
    Ret1 = 72,
    Fori = 73,
    Jfori = 74,
    Forl = 75,
    Iforl = 76,
    Jforl = 77,
    Iterl = 78,
    Iiterl = 79,
    Jiterl = 80,
    Loop = 81,
    Iloop = 82,
    Jloop = 83,
    Jmp = 84,
    Funcf = 85,
    Ifuncf = 86,
    Jfuncf = 87,
    Funcv = 88,
    Ifuncv = 89,
    Jfuncv = 90,
    Funcc = 91,
    Funccw = 92,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Result<Self, Error> {
        Opcode::try_from_primitive(byte).map_err(|_| Error::UnknownOpcode(byte))
    }

    #[must_use]
    pub fn schema(self) -> &'static InstructionSchema {
        &SCHEMA[self as usize]
    }

    #[must_use]
    pub fn mnemonic(self) -> &'static str {
        self.schema().mnemonic
    }

    /// Comparison / unary-test family: both instructions always have a
    /// fallthrough and a "conventionally following jump" successor.
    #[must_use]
    pub fn is_test_family(self) -> bool {
        matches!(
            self,
            Opcode::Islt
                | Opcode::Isge
                | Opcode::Isle
                | Opcode::Isgt
                | Opcode::Iseqv
                | Opcode::Isnev
                | Opcode::Iseqs
                | Opcode::Isnes
                | Opcode::Iseqn
                | Opcode::Isnen
                | Opcode::Iseqp
                | Opcode::Isnep
                | Opcode::Istc
                | Opcode::Isfc
                | Opcode::Ist
                | Opcode::Isf
        )
    }

    #[must_use]
    pub fn is_for_family(self) -> bool {
        matches!(
            self,
            Opcode::Fori | Opcode::Jfori | Opcode::Forl | Opcode::Iforl | Opcode::Jforl
        )
    }

    #[must_use]
    pub fn is_iter_family(self) -> bool {
        matches!(self, Opcode::Iterl | Opcode::Iiterl | Opcode::Jiterl)
    }

    #[must_use]
    pub fn is_return_family(self) -> bool {
        matches!(self, Opcode::Retm | Opcode::Ret | Opcode::Ret0 | Opcode::Ret1)
    }

    #[must_use]
    pub fn is_loop_marker(self) -> bool {
        matches!(self, Opcode::Loop | Opcode::Iloop | Opcode::Jloop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_table_matches_opcode_count() {
        assert_eq!(SCHEMA.len(), 93);
    }

    #[test]
    fn from_byte_round_trips() {
        assert_eq!(Opcode::from_byte(0).unwrap(), Opcode::Islt);
        assert_eq!(Opcode::from_byte(92).unwrap(), Opcode::Funccw);
        assert!(Opcode::from_byte(93).is_err());
    }

    #[test]
    fn const_ref_kinds() {
        assert!(OperandKind::Str.is_const_ref());
        assert!(OperandKind::Tab.is_const_ref());
        assert!(OperandKind::Fun.is_const_ref());
        assert!(OperandKind::Cdt.is_const_ref());
        assert!(!OperandKind::Num.is_const_ref());
    }

    #[test]
    fn family_classification() {
        assert!(Opcode::Islt.is_test_family());
        assert!(Opcode::Isf.is_test_family());
        assert!(!Opcode::Mov.is_test_family());
        assert!(Opcode::Forl.is_for_family());
        assert!(Opcode::Iterl.is_iter_family());
        assert!(Opcode::Ret0.is_return_family());
    }
}
