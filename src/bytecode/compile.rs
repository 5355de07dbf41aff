use log::{debug, trace};

use super::fuse::push_fused;
use super::{Instr, Opcode, Pointer, Program};
use crate::error::ExprError;
use crate::symbol::{NativeFn, Variable};
use crate::tree::{Child, ExpressionTree, Func, Operator, Unit, Value};

/// Lowers `tree` to bytecode.
pub fn compile(
    tree: &ExpressionTree,
    fusion: bool,
    fixed_width: bool,
) -> Result<Program, ExprError> {
    let mut c = Compiler {
        tree,
        fusion,
        instrs: Vec::new(),
        consts: Vec::new(),
        pointers: Vec::new(),
        emitted: 0,
    };
    c.child(tree.root())?;

    let temps = tree.temp_slot_count();
    if temps > u8::MAX as usize + 1 {
        return Err(ExprError::CodeGen(format!("{} temporaries exceed 256", temps)));
    }
    let mut code = Vec::new();
    for ins in &c.instrs {
        ins.encode(&mut code, fixed_width);
    }
    let program = Program {
        code,
        consts: c.consts,
        pointers: c.pointers,
        temps,
        fixed_width,
    };
    debug!(
        "bytecode: {} instructions emitted, {} after fusion, {} bytes",
        c.emitted,
        c.instrs.len(),
        program.code.len()
    );
    trace!("\n{}", program.disassemble());
    Ok(program)
}

struct Compiler<'a> {
    tree: &'a ExpressionTree,
    fusion: bool,
    instrs: Vec<Instr>,
    consts: Vec<f64>,
    pointers: Vec<Pointer>,
    emitted: usize,
}

fn index(i: usize, what: &str) -> Result<u8, ExprError> {
    u8::try_from(i).map_err(|_| ExprError::CodeGen(format!("more than 256 {}", what)))
}

impl Compiler<'_> {
    fn emit(&mut self, ins: Instr) {
        self.emitted += 1;
        if self.fusion {
            push_fused(&mut self.instrs, ins);
        } else {
            self.instrs.push(ins);
        }
    }

    fn const_index(&mut self, v: f64) -> Result<u8, ExprError> {
        let i = match self.consts.iter().position(|c| c.to_bits() == v.to_bits()) {
            Some(i) => i,
            None => {
                self.consts.push(v);
                self.consts.len() - 1
            }
        };
        index(i, "constants")
    }

    fn var_index(&mut self, var: &Variable) -> Result<u8, ExprError> {
        let found = self
            .pointers
            .iter()
            .position(|p| matches!(p, Pointer::Var(v) if v.ptr_eq(var)));
        let i = found.unwrap_or_else(|| {
            self.pointers.push(Pointer::Var(var.clone()));
            self.pointers.len() - 1
        });
        index(i, "pointers")
    }

    fn func_index(&mut self, f: NativeFn) -> Result<u8, ExprError> {
        let found = self
            .pointers
            .iter()
            .position(|p| matches!(p, Pointer::Func(g) if *g == f));
        let i = found.unwrap_or_else(|| {
            self.pointers.push(Pointer::Func(f));
            self.pointers.len() - 1
        });
        index(i, "pointers")
    }

    fn load(&mut self, v: &Value) -> Result<(), ExprError> {
        let ins = match v {
            Value::Const(c) => Instr::with(Opcode::Const, self.const_index(*c)?),
            Value::Var(var) => Instr::with(Opcode::Variable, self.var_index(var)?),
            Value::Input(i) => Instr::with(Opcode::Input, index(*i as usize, "inputs")?),
            Value::Temp(t) => Instr::with(Opcode::Temp, index(*t as usize, "temporaries")?),
        };
        self.emit(ins);
        Ok(())
    }

    fn child(&mut self, c: Child) -> Result<(), ExprError> {
        let tree = self.tree;
        match c {
            Child::None => Ok(()),
            Child::Leaf(i) => match &tree.units[i] {
                Unit::Value(v) => self.load(v),
                _ => Err(ExprError::CodeGen("operator unit used as a leaf".into())),
            },
            Child::Node(n) => self.node(n),
        }
    }

    fn node(&mut self, n: usize) -> Result<(), ExprError> {
        let tree = self.tree;
        let node = tree.nodes[n];
        let [l, r] = node.children;
        let store = match &tree.units[node.op] {
            Unit::Op {
                op,
                reversed,
                store,
            } => {
                self.op(*op, *reversed, l, r)?;
                *store
            }
            Unit::Func { func, store } => {
                self.child(l)?;
                match func {
                    Func::Symbol(sym) => self.emit(Instr::with(Opcode::FuncSymbol, sym.id())),
                    Func::Native(f) => {
                        let p = self.func_index(*f)?;
                        self.emit(Instr {
                            op: Opcode::FuncCall,
                            a: f.arity() as u8,
                            b: p,
                        });
                    }
                }
                *store
            }
            Unit::Value(v) => {
                self.load(v)?;
                None
            }
        };
        if let Some(t) = store {
            self.emit(Instr::with(Opcode::Store, index(t as usize, "temporaries")?));
        }
        Ok(())
    }

    fn op(&mut self, op: Operator, reversed: bool, l: Child, r: Child) -> Result<(), ExprError> {
        match op {
            Operator::Plus => self.child(r),
            Operator::Neg => {
                self.child(r)?;
                self.emit(Instr::new(Opcode::Mins));
                Ok(())
            }
            Operator::Assign => {
                self.child(r)?;
                let tree = self.tree;
                let ins = match tree.value_of(l) {
                    Some(Value::Var(var)) => Instr::with(Opcode::AssignVar, self.var_index(var)?),
                    Some(Value::Input(i)) => {
                        Instr::with(Opcode::AssignInput, index(*i as usize, "inputs")?)
                    }
                    _ => return Err(ExprError::CodeGen("invalid assignment target".into())),
                };
                self.emit(ins);
                Ok(())
            }
            Operator::Separator => {
                self.child(l)?;
                self.child(r)
            }
            Operator::Comma => {
                self.child(l)?;
                self.child(r)?;
                self.emit(Instr::new(Opcode::Comma));
                Ok(())
            }
            _ => {
                let square = self.fusion
                    && op == Operator::Mul
                    && matches!((l, r), (Child::Leaf(_), Child::Leaf(_)))
                    && self.tree.subtree_eq(l, r);
                self.child(l)?;
                if square {
                    self.emit(Instr::new(Opcode::SMul));
                    return Ok(());
                }
                self.child(r)?;
                let code = binary_opcode(op, reversed).ok_or_else(|| {
                    ExprError::CodeGen(format!("no reversed form of '{}'", op.symbol()))
                })?;
                self.emit(Instr::new(code));
                Ok(())
            }
        }
    }
}

/// Opcode combining the popped value (first evaluated) with `top`.
fn binary_opcode(op: Operator, reversed: bool) -> Option<Opcode> {
    Some(match (op, reversed) {
        (Operator::Add, _) => Opcode::Add,
        (Operator::Mul, _) => Opcode::Mul,
        (Operator::Sub, false) => Opcode::Sub,
        (Operator::Sub, true) => Opcode::SubR,
        (Operator::Div, false) => Opcode::Div,
        (Operator::Div, true) => Opcode::DivR,
        (Operator::Eq, _) => Opcode::Eq,
        (Operator::Ne, _) => Opcode::Ne,
        (_, true) => return None,
        (Operator::Pow, false) => Opcode::Pow,
        (Operator::Gt, false) => Opcode::Gt,
        (Operator::Ge, false) => Opcode::Ge,
        (Operator::Lt, false) => Opcode::Lt,
        (Operator::Le, false) => Opcode::Le,
        _ => return None,
    })
}
