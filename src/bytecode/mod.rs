//! Accumulator bytecode: a compact postfix program executed by a small
//! dispatch loop.
//!
//! The machine keeps the most recent value in `top` and everything older on
//! a spill stack. Loads push the previous `top` before replacing it, binary
//! operators combine the popped value (the left operand in evaluation order)
//! with `top`.

mod compile;
mod fuse;
mod vm;

use std::fmt::Write as _;

use crate::symbol::{NativeFn, Variable};

pub use compile::compile;
pub use fuse::merge;
pub use vm::Machine;

macro_rules! opcodes {
    ($($name:ident = $width:literal, $mnemonic:literal;)*) => {
        /// One bytecode operation. The discriminant is the encoded byte.
        #[repr(u8)]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $($name,)*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name,)*];

            /// Encoded size in bytes, opcode included.
            pub fn width(self) -> usize {
                match self {
                    $(Opcode::$name => $width,)*
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemonic,)*
                }
            }
        }
    };
}

opcodes! {
    Input = 2, "in";
    Const = 2, "const";
    Variable = 2, "var";
    Temp = 2, "temp";
    Store = 2, "store";
    AssignVar = 2, "assign.var";
    AssignInput = 2, "assign.in";

    Add = 1, "add";
    Sub = 1, "sub";
    SubR = 1, "subr";
    Mul = 1, "mul";
    Div = 1, "div";
    DivR = 1, "divr";
    Pow = 1, "pow";
    Gt = 1, "gt";
    Ge = 1, "ge";
    Lt = 1, "lt";
    Le = 1, "le";
    Eq = 1, "eq";
    Ne = 1, "ne";
    Mins = 1, "neg";
    Comma = 1, "comma";

    IAdd = 2, "add.in";
    ISub = 2, "sub.in";
    ISubR = 2, "subr.in";
    IMul = 2, "mul.in";
    IDiv = 2, "div.in";
    IDivR = 2, "divr.in";
    CAdd = 2, "add.const";
    CSub = 2, "sub.const";
    CSubR = 2, "subr.const";
    CMul = 2, "mul.const";
    CDiv = 2, "div.const";
    CDivR = 2, "divr.const";
    VAdd = 2, "add.var";
    VSub = 2, "sub.var";
    VSubR = 2, "subr.var";
    VMul = 2, "mul.var";
    VDiv = 2, "div.var";
    VDivR = 2, "divr.var";

    SMul = 1, "sqr";
    SMulAdd = 1, "sqr.add";
    SMulSub = 1, "sqr.sub";
    SMulMul = 1, "sqr.mul";
    SMulDiv = 1, "sqr.div";

    MulAdd = 1, "muladd";
    MulSub = 1, "mulsub";
    AddMul = 1, "addmul";
    IMulAdd = 2, "muladd.in";
    IMulSub = 2, "mulsub.in";
    IAddMul = 2, "addmul.in";
    CMulAdd = 2, "muladd.const";
    CMulSub = 2, "mulsub.const";
    CAddMul = 2, "addmul.const";
    VMulAdd = 2, "muladd.var";
    VMulSub = 2, "mulsub.var";
    VAddMul = 2, "addmul.var";

    FuncSymbol = 2, "call.builtin";
    FuncCall = 3, "call";
}

impl Opcode {
    pub fn from_u8(b: u8) -> Option<Opcode> {
        Opcode::ALL.get(b as usize).copied()
    }
}

/// Stride of every instruction in fixed-width mode.
pub const FIXED_WIDTH: usize = 3;

/// A decoded instruction. Operand bytes beyond the opcode's width are zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instr {
    pub op: Opcode,
    pub a: u8,
    pub b: u8,
}

impl Instr {
    pub fn new(op: Opcode) -> Self {
        Self { op, a: 0, b: 0 }
    }

    pub fn with(op: Opcode, a: u8) -> Self {
        Self { op, a, b: 0 }
    }

    pub(crate) fn encode(self, out: &mut Vec<u8>, fixed_width: bool) {
        let bytes = [self.op as u8, self.a, self.b];
        let n = if fixed_width {
            FIXED_WIDTH
        } else {
            self.op.width()
        };
        out.extend_from_slice(&bytes[..n]);
    }
}

/// Address-like operands referenced by index from the instruction stream.
#[derive(Clone, Debug)]
pub enum Pointer {
    Var(Variable),
    Func(NativeFn),
}

/// A compiled bytecode program with its constant pool and pointer table.
#[derive(Clone, Debug, Default)]
pub struct Program {
    pub(crate) code: Vec<u8>,
    pub(crate) consts: Vec<f64>,
    pub(crate) pointers: Vec<Pointer>,
    pub(crate) temps: usize,
    pub(crate) fixed_width: bool,
}

impl Program {
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn consts(&self) -> &[f64] {
        &self.consts
    }

    pub fn is_fixed_width(&self) -> bool {
        self.fixed_width
    }

    /// Decodes the instruction stream.
    pub fn instructions(&self) -> Vec<Instr> {
        let mut out = Vec::new();
        let mut pc = 0;
        while let Some(ins) = self.decode(pc) {
            out.push(ins);
            pc += self.stride(ins.op);
        }
        out
    }

    #[inline]
    pub(crate) fn stride(&self, op: Opcode) -> usize {
        if self.fixed_width {
            FIXED_WIDTH
        } else {
            op.width()
        }
    }

    #[inline]
    pub(crate) fn decode(&self, pc: usize) -> Option<Instr> {
        let op = Opcode::from_u8(*self.code.get(pc)?)?;
        let w = op.width();
        let a = if w > 1 { self.code.get(pc + 1).copied()? } else { 0 };
        let b = if w > 2 { self.code.get(pc + 2).copied()? } else { 0 };
        Some(Instr { op, a, b })
    }

    /// Human readable listing, one instruction per line.
    pub fn disassemble(&self) -> String {
        let mut s = String::new();
        let mut pc = 0;
        while let Some(ins) = self.decode(pc) {
            let _ = write!(s, "{:04x}  {:<14}", pc, ins.op.mnemonic());
            match ins.op {
                Opcode::Const
                | Opcode::CAdd
                | Opcode::CSub
                | Opcode::CSubR
                | Opcode::CMul
                | Opcode::CDiv
                | Opcode::CDivR
                | Opcode::CMulAdd
                | Opcode::CMulSub
                | Opcode::CAddMul => {
                    let v = self.consts.get(ins.a as usize).copied().unwrap_or(f64::NAN);
                    let _ = write!(s, "#{} ({})", ins.a, v);
                }
                Opcode::FuncCall => {
                    let _ = write!(s, "argc={} fn#{}", ins.a, ins.b);
                }
                op if op.width() > 1 => {
                    let _ = write!(s, "{}", ins.a);
                }
                _ => {}
            }
            let line_end = s.trim_end().len();
            s.truncate(line_end);
            s.push('\n');
            pc += self.stride(ins.op);
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_bytes_round_trip_through_the_table() {
        for (i, op) in Opcode::ALL.iter().enumerate() {
            assert_eq!(*op as u8 as usize, i);
            assert_eq!(Opcode::from_u8(i as u8), Some(*op));
        }
        assert_eq!(Opcode::from_u8(Opcode::ALL.len() as u8), None);
    }

    #[test]
    fn widths_stay_within_three_bytes() {
        assert!(Opcode::ALL.iter().all(|op| (1..=FIXED_WIDTH).contains(&op.width())));
    }

    #[test]
    fn fixed_width_pads_every_instruction() {
        let mut var = Vec::new();
        let mut fixed = Vec::new();
        for ins in [Instr::with(Opcode::Input, 0), Instr::new(Opcode::Mins)] {
            ins.encode(&mut var, false);
            ins.encode(&mut fixed, true);
        }
        assert_eq!(var, [Opcode::Input as u8, 0, Opcode::Mins as u8]);
        assert_eq!(fixed.len(), 2 * FIXED_WIDTH);
    }
}
