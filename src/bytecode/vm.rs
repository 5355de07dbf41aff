use log::trace;

use super::{Instr, Opcode, Pointer, Program};
use crate::arith;
use crate::executable::Arg;
use crate::tree::Operator;

/// Register state of the bytecode machine.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Machine {
    pub top: f64,
    pub stack: Vec<f64>,
    pub temps: Vec<f64>,
}

impl Machine {
    pub fn new(temps: usize) -> Self {
        Self {
            top: 0.0,
            stack: Vec::with_capacity(16),
            temps: vec![0.0; temps],
        }
    }

    #[inline]
    fn load(&mut self, v: f64) {
        self.stack.push(self.top);
        self.top = v;
    }

    #[inline]
    fn pop(&mut self) -> f64 {
        self.stack.pop().unwrap_or(f64::NAN)
    }

    /// `top = pop OP top`
    #[inline]
    fn binary(&mut self, op: Operator) {
        let l = self.pop();
        self.top = arith::binary(op, l, self.top);
    }

    /// `top = top OP pop`
    #[inline]
    fn binary_rev(&mut self, op: Operator) {
        let r = self.pop();
        self.top = arith::binary(op, self.top, r);
    }
}

impl Program {
    #[inline]
    fn constant(&self, i: u8) -> f64 {
        self.consts.get(i as usize).copied().unwrap_or(f64::NAN)
    }

    #[inline]
    fn variable(&self, i: u8) -> f64 {
        match self.pointers.get(i as usize) {
            Some(Pointer::Var(v)) => v.get(),
            _ => f64::NAN,
        }
    }

    /// Executes a single instruction against `m`.
    pub fn step(&self, m: &mut Machine, ins: Instr, args: &[Arg<'_>]) {
        use Opcode::*;
        let input = |i: u8| args.get(i as usize).map_or(f64::NAN, Arg::value);
        match ins.op {
            Input => m.load(input(ins.a)),
            Const => m.load(self.constant(ins.a)),
            Variable => m.load(self.variable(ins.a)),
            Temp => {
                let v = m.temps.get(ins.a as usize).copied().unwrap_or(f64::NAN);
                m.load(v)
            }
            Store => {
                if let Some(t) = m.temps.get_mut(ins.a as usize) {
                    *t = m.top;
                }
            }
            AssignVar => {
                if let Some(Pointer::Var(v)) = self.pointers.get(ins.a as usize) {
                    v.set(m.top);
                }
            }
            AssignInput => {
                if let Some(a) = args.get(ins.a as usize) {
                    a.assign(m.top);
                }
            }

            Add => m.binary(Operator::Add),
            Sub => m.binary(Operator::Sub),
            SubR => m.binary_rev(Operator::Sub),
            Mul => m.binary(Operator::Mul),
            Div => m.binary(Operator::Div),
            DivR => m.binary_rev(Operator::Div),
            Pow => m.binary(Operator::Pow),
            Gt => m.binary(Operator::Gt),
            Ge => m.binary(Operator::Ge),
            Lt => m.binary(Operator::Lt),
            Le => m.binary(Operator::Le),
            Eq => m.binary(Operator::Eq),
            Ne => m.binary(Operator::Ne),
            Mins => m.top = -m.top,
            Comma => {
                m.pop();
            }

            IAdd => m.top += input(ins.a),
            ISub => m.top -= input(ins.a),
            ISubR => m.top = input(ins.a) - m.top,
            IMul => m.top *= input(ins.a),
            IDiv => m.top /= input(ins.a),
            IDivR => m.top = input(ins.a) / m.top,
            CAdd => m.top += self.constant(ins.a),
            CSub => m.top -= self.constant(ins.a),
            CSubR => m.top = self.constant(ins.a) - m.top,
            CMul => m.top *= self.constant(ins.a),
            CDiv => m.top /= self.constant(ins.a),
            CDivR => m.top = self.constant(ins.a) / m.top,
            VAdd => m.top += self.variable(ins.a),
            VSub => m.top -= self.variable(ins.a),
            VSubR => m.top = self.variable(ins.a) - m.top,
            VMul => m.top *= self.variable(ins.a),
            VDiv => m.top /= self.variable(ins.a),
            VDivR => m.top = self.variable(ins.a) / m.top,

            SMul => m.top *= m.top,
            SMulAdd => {
                let l = m.pop();
                m.top = l + m.top * m.top;
            }
            SMulSub => {
                let l = m.pop();
                m.top = l - m.top * m.top;
            }
            SMulMul => {
                let l = m.pop();
                m.top = l * (m.top * m.top);
            }
            SMulDiv => {
                let l = m.pop();
                m.top = l / (m.top * m.top);
            }

            MulAdd => {
                let rhs = m.pop();
                let lhs = m.pop();
                m.top = lhs + rhs * m.top;
            }
            MulSub => {
                let rhs = m.pop();
                let lhs = m.pop();
                m.top = lhs - rhs * m.top;
            }
            AddMul => {
                let rhs = m.pop();
                let lhs = m.pop();
                m.top = lhs * (rhs + m.top);
            }
            IMulAdd => fused_mul_add(m, input(ins.a)),
            IMulSub => fused_mul_sub(m, input(ins.a)),
            IAddMul => fused_add_mul(m, input(ins.a)),
            CMulAdd => fused_mul_add(m, self.constant(ins.a)),
            CMulSub => fused_mul_sub(m, self.constant(ins.a)),
            CAddMul => fused_add_mul(m, self.constant(ins.a)),
            VMulAdd => fused_mul_add(m, self.variable(ins.a)),
            VMulSub => fused_mul_sub(m, self.variable(ins.a)),
            VAddMul => fused_add_mul(m, self.variable(ins.a)),

            FuncSymbol => {
                if let Some(sym) = crate::symbol::FuncSymbol::from_id(ins.a) {
                    m.top = arith::func_symbol(sym, m.top);
                }
            }
            FuncCall => {
                let argc = ins.a as usize;
                let Some(Pointer::Func(f)) = self.pointers.get(ins.b as usize) else {
                    return;
                };
                if argc == 0 {
                    m.load(f.call(&[]));
                    return;
                }
                // the last argument is in `top`, the rest on the stack
                m.stack.push(m.top);
                let at = m.stack.len().saturating_sub(argc);
                let v = f.call(&m.stack[at..]);
                m.stack.truncate(at);
                m.top = v;
            }
        }
    }

    /// Runs the whole program and returns the accumulator.
    pub fn run(&self, args: &[Arg<'_>]) -> f64 {
        let mut m = Machine::new(self.temps);
        let mut pc = 0;
        while let Some(ins) = self.decode(pc) {
            self.step(&mut m, ins, args);
            pc += self.stride(ins.op);
        }
        trace!("bytecode run: top={} residual stack={}", m.top, m.stack.len());
        m.top
    }
}

#[inline]
fn fused_mul_add(m: &mut Machine, v: f64) {
    let l = m.pop();
    m.top = l + m.top * v;
}

#[inline]
fn fused_mul_sub(m: &mut Machine, v: f64) {
    let l = m.pop();
    m.top = l - m.top * v;
}

#[inline]
fn fused_add_mul(m: &mut Machine, v: f64) {
    let l = m.pop();
    m.top = l * (m.top + v);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::merge;
    use crate::symbol::Variable;

    fn program() -> Program {
        Program {
            consts: vec![2.5],
            pointers: vec![Pointer::Var(Variable::double(-1.75))],
            temps: 1,
            ..Program::default()
        }
    }

    fn machine() -> Machine {
        Machine {
            top: 0.625,
            stack: vec![3.0, -1.5, 4.25],
            temps: vec![0.0],
        }
    }

    #[test]
    fn every_fusible_pair_matches_its_expansion() {
        let p = program();
        let args = [Arg::Double(1.25)];
        let mut pairs = 0;
        for &a in Opcode::ALL {
            for &b in Opcode::ALL {
                let (first, second) = (Instr::with(a, 0), Instr::with(b, 0));
                let Some(fused) = merge(first, second) else {
                    continue;
                };
                pairs += 1;
                let mut seq = machine();
                p.step(&mut seq, first, &args);
                p.step(&mut seq, second, &args);
                let mut one = machine();
                p.step(&mut one, fused, &args);
                assert_eq!(seq.top.to_bits(), one.top.to_bits(), "{:?}+{:?}", a, b);
                assert_eq!(seq.stack, one.stack, "{:?}+{:?}", a, b);
            }
        }
        assert!(pairs >= 30);
    }

    #[test]
    fn subtraction_orders() {
        let p = program();
        let mut m = machine();
        p.step(&mut m, Instr::new(Opcode::Sub), &[]);
        assert_eq!(m.top, 4.25 - 0.625);
        let mut m = machine();
        p.step(&mut m, Instr::new(Opcode::SubR), &[]);
        assert_eq!(m.top, 0.625 - 4.25);
    }
}
