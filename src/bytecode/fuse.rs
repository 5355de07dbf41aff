use super::{Instr, Opcode};

/// Operand source of a load that may be folded into the following operator.
#[derive(Clone, Copy)]
enum Source {
    Input,
    Const,
    Var,
}

fn source(op: Opcode) -> Option<Source> {
    match op {
        Opcode::Input => Some(Source::Input),
        Opcode::Const => Some(Source::Const),
        Opcode::Variable => Some(Source::Var),
        _ => None,
    }
}

fn with_operand(src: Source, op: Opcode) -> Option<Opcode> {
    use Opcode::*;
    let table: [Opcode; 6] = match src {
        Source::Input => [IAdd, ISub, ISubR, IMul, IDiv, IDivR],
        Source::Const => [CAdd, CSub, CSubR, CMul, CDiv, CDivR],
        Source::Var => [VAdd, VSub, VSubR, VMul, VDiv, VDivR],
    };
    let slot = match op {
        Add => 0,
        Sub => 1,
        SubR => 2,
        Mul => 3,
        Div => 4,
        DivR => 5,
        _ => return None,
    };
    Some(table[slot])
}

/// The fused instruction equivalent to running `first` then `second`, if the
/// pair has one.
pub fn merge(first: Instr, second: Instr) -> Option<Instr> {
    use Opcode::*;
    if let Some(src) = source(first.op) {
        return with_operand(src, second.op).map(|op| Instr::with(op, first.a));
    }
    let op = match (first.op, second.op) {
        (Add, Mul) => AddMul,
        (Mul, Add) => MulAdd,
        (Mul, Sub) => MulSub,

        (IMul, Add) => IMulAdd,
        (IMul, Sub) => IMulSub,
        (IAdd, Mul) => IAddMul,
        (CMul, Add) => CMulAdd,
        (CMul, Sub) => CMulSub,
        (CAdd, Mul) => CAddMul,
        (VMul, Add) => VMulAdd,
        (VMul, Sub) => VMulSub,
        (VAdd, Mul) => VAddMul,

        (SMul, Add) => SMulAdd,
        (SMul, Sub) => SMulSub,
        (SMul, Mul) => SMulMul,
        (SMul, Div) => SMulDiv,
        _ => return None,
    };
    Some(Instr::with(op, first.a))
}

/// Appends `ins` to `out`, merging it into the tail for as long as the merge
/// table allows.
pub(crate) fn push_fused(out: &mut Vec<Instr>, mut ins: Instr) -> usize {
    let mut merges = 0;
    while let Some(prev) = out.last().copied() {
        match merge(prev, ins) {
            Some(fused) => {
                out.pop();
                ins = fused;
                merges += 1;
            }
            None => break,
        }
    }
    out.push(ins);
    merges
}
