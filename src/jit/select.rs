//! Instruction selection for a register-stack FPU.
//!
//! Walks the tree and produces a flat list of [`FpuOp`]s while simulating
//! the eight-entry hardware stack. Nothing here touches machine code, so the
//! depth bookkeeping can be tested on any host.

use log::trace;

use crate::arith;
use crate::error::ExprError;
use crate::symbol::{FuncSymbol, ValueLayout, Variable};
use crate::tree::{Child, ExpressionTree, Func, Operator, Unit, Value};

/// Hardware depth of the x87 register stack.
pub const FPU_DEPTH: usize = 8;

/// A memory-resident operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mem {
    /// Non-pointer input, read from its frame slot.
    Input(u16),
    /// The location a pointer input refers to.
    InputPtr(u16),
    /// Constant pool entry.
    Const(u16),
    /// Variable table entry.
    Var(u16),
    Temp(u16),
    /// Shadow slot of an abstract stack position.
    Spill(u16),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Mul,
    /// `dest - src`
    Sub,
    /// `src - dest`
    SubR,
    /// `dest / src`
    Div,
    /// `src / dest`
    DivR,
}

impl ArithOp {
    /// The operation computing `op` with `dest` as the left operand, or with
    /// `src` as the left operand when `swap` is set.
    fn of(op: Operator, swap: bool) -> Option<ArithOp> {
        Some(match (op, swap) {
            (Operator::Add, _) => ArithOp::Add,
            (Operator::Mul, _) => ArithOp::Mul,
            (Operator::Sub, false) => ArithOp::Sub,
            (Operator::Sub, true) => ArithOp::SubR,
            (Operator::Div, false) => ArithOp::Div,
            (Operator::Div, true) => ArithOp::DivR,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    /// `st(1) = st(1) op st(0)`, then pop.
    Pop,
    /// `st(0) = st(0) op [mem]`
    Mem(Mem),
}

#[derive(Clone, Debug, PartialEq)]
pub enum FpuOp {
    /// Push a memory operand.
    Load(Mem),
    Arith { op: ArithOp, src: Source },
    /// `st(0) = st(0) * st(0)`
    Square,
    Neg,
    Sqrt,
    /// Pop `st(0)` into the shadow slot of an abstract position.
    Spill(u16),
    /// Convert a memory operand into a double in a shadow slot.
    Copy { from: Mem, to: u16 },
    /// Write `st(0)` to a temporary without popping.
    StoreTemp(u16),
    /// Write `st(0)` to a variable or through a pointer input without popping.
    Assign(Mem),
    /// Pop `st(0)`.
    Discard,
    /// `st(1) = st(0)`, then pop.
    DiscardBelow,
    /// Call `addr` with the given doubles and push its result. The register
    /// stack is empty when this executes.
    Call { addr: usize, args: Vec<Mem> },
}

/// Output of instruction selection.
#[derive(Clone, Debug, Default)]
pub struct Selection {
    pub ops: Vec<FpuOp>,
    pub consts: Vec<f64>,
    pub vars: Vec<Variable>,
    /// Number of shadow slots, one per abstract stack position reached.
    pub spill_slots: usize,
    pub temps: usize,
    /// Highest simultaneous register count.
    pub max_regs: usize,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Entry {
    Reg,
    Mem(Mem),
}

/// Selects FPU operations for `tree` given the layouts of its inputs.
pub fn select(tree: &ExpressionTree, layouts: &[ValueLayout]) -> Result<Selection, ExprError> {
    let mut s = Selector {
        tree,
        layouts,
        sel: Selection {
            temps: tree.temp_slot_count(),
            ..Selection::default()
        },
        stack: Vec::new(),
        regs: 0,
    };
    s.child(tree.root())?;
    if s.stack.len() != 1 {
        return Err(ExprError::CodeGen(format!(
            "expression leaves {} values",
            s.stack.len()
        )));
    }
    s.top_to_reg();
    trace!("selected {} fpu ops: {:?}", s.sel.ops.len(), s.sel.ops);
    Ok(s.sel)
}

struct Selector<'a> {
    tree: &'a ExpressionTree,
    layouts: &'a [ValueLayout],
    sel: Selection,
    stack: Vec<Entry>,
    regs: usize,
}

impl Selector<'_> {
    fn slot(pos: usize) -> u16 {
        pos as u16
    }

    fn note_depth(&mut self) {
        self.sel.spill_slots = self.sel.spill_slots.max(self.stack.len());
        self.sel.max_regs = self.sel.max_regs.max(self.regs);
    }

    fn layout_of(&self, m: Mem) -> ValueLayout {
        match m {
            Mem::Input(i) => self.layouts[i as usize],
            Mem::InputPtr(i) => self.layouts[i as usize].base(),
            Mem::Var(k) => self.sel.vars[k as usize].layout(),
            Mem::Const(_) | Mem::Temp(_) | Mem::Spill(_) => ValueLayout::Double,
        }
    }

    fn push_mem(&mut self, m: Mem) {
        self.stack.push(Entry::Mem(m));
        self.note_depth();
    }

    /// Frees a hardware register by spilling the most recently pushed one.
    fn make_room(&mut self) {
        if self.regs < FPU_DEPTH {
            return;
        }
        if let Some(p) = self.stack.iter().rposition(|e| *e == Entry::Reg) {
            self.sel.ops.push(FpuOp::Spill(Self::slot(p)));
            self.stack[p] = Entry::Mem(Mem::Spill(Self::slot(p)));
            self.regs -= 1;
        }
    }

    /// Loads the entry at `pos` into `st(0)`. Every entry above `pos` must be
    /// memory resident.
    fn load_at(&mut self, pos: usize) {
        if let Entry::Mem(m) = self.stack[pos] {
            self.make_room();
            self.sel.ops.push(FpuOp::Load(m));
            self.stack[pos] = Entry::Reg;
            self.regs += 1;
            self.note_depth();
        }
    }

    fn top_to_reg(&mut self) {
        if let Some(top) = self.stack.len().checked_sub(1) {
            self.load_at(top);
        }
    }

    /// Moves lazily read copies of `m` into shadow slots before `m` is
    /// overwritten.
    fn clobber(&mut self, m: Mem) {
        for pos in 0..self.stack.len() {
            if self.stack[pos] == Entry::Mem(m) {
                self.make_room();
                self.sel.ops.push(FpuOp::Copy {
                    from: m,
                    to: Self::slot(pos),
                });
                self.stack[pos] = Entry::Mem(Mem::Spill(Self::slot(pos)));
            }
        }
    }

    /// Prepares `st(0)` to be written to `m`. Lazy copies are settled first:
    /// a spill they force may evict the value, which is then reloaded.
    fn write_top(&mut self, m: Mem) {
        self.clobber(m);
        self.top_to_reg();
    }

    fn leaf(&mut self, v: &Value) -> Result<(), ExprError> {
        let m = match v {
            Value::Const(c) => {
                let i = match self.sel.consts.iter().position(|x| x.to_bits() == c.to_bits()) {
                    Some(i) => i,
                    None => {
                        self.sel.consts.push(*c);
                        self.sel.consts.len() - 1
                    }
                };
                Mem::Const(i as u16)
            }
            Value::Var(var) => Mem::Var(self.var_index(var)),
            Value::Input(i) => match self.layouts.get(*i as usize) {
                Some(l) if l.is_pointer() => Mem::InputPtr(*i),
                Some(_) => Mem::Input(*i),
                None => {
                    return Err(ExprError::CodeGen(format!(
                        "input {} has no declared layout",
                        i
                    )));
                }
            },
            Value::Temp(t) => Mem::Temp(*t),
        };
        self.push_mem(m);
        Ok(())
    }

    fn var_index(&mut self, var: &Variable) -> u16 {
        let i = match self.sel.vars.iter().position(|v| v.ptr_eq(var)) {
            Some(i) => i,
            None => {
                self.sel.vars.push(var.clone());
                self.sel.vars.len() - 1
            }
        };
        i as u16
    }

    fn child(&mut self, c: Child) -> Result<(), ExprError> {
        let tree = self.tree;
        match c {
            Child::None => Ok(()),
            Child::Leaf(i) => match &tree.units[i] {
                Unit::Value(v) => self.leaf(v),
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
                    Func::Symbol(FuncSymbol::Sqrt) => {
                        self.top_to_reg();
                        self.sel.ops.push(FpuOp::Sqrt);
                    }
                    Func::Symbol(sym) => {
                        let addr = arith::symbol_helper(*sym).ok_or_else(|| {
                            ExprError::CodeGen(format!("no helper for '{}'", sym.name()))
                        })?;
                        self.call(addr, 1);
                    }
                    Func::Native(f) => self.call(f.addr(), f.arity()),
                }
                *store
            }
            Unit::Value(v) => {
                self.leaf(v)?;
                None
            }
        };
        if let Some(t) = store {
            self.write_top(Mem::Temp(t));
            self.sel.ops.push(FpuOp::StoreTemp(t));
        }
        Ok(())
    }

    fn op(&mut self, op: Operator, reversed: bool, l: Child, r: Child) -> Result<(), ExprError> {
        let tree = self.tree;
        match op {
            Operator::Plus => self.child(r),
            Operator::Neg => {
                self.child(r)?;
                self.top_to_reg();
                self.sel.ops.push(FpuOp::Neg);
                Ok(())
            }
            Operator::Separator => {
                self.child(l)?;
                self.child(r)
            }
            Operator::Assign => {
                self.child(r)?;
                let target = match tree.value_of(l) {
                    Some(Value::Var(var)) => Mem::Var(self.var_index(var)),
                    Some(Value::Input(i)) => match self.layouts.get(*i as usize) {
                        Some(layout) if layout.is_pointer() => Mem::InputPtr(*i),
                        _ => {
                            return Err(ExprError::CodeGen(format!(
                                "input {} is assigned but not passed by pointer",
                                i
                            )));
                        }
                    },
                    _ => return Err(ExprError::CodeGen("invalid assignment target".into())),
                };
                self.write_top(target);
                self.sel.ops.push(FpuOp::Assign(target));
                Ok(())
            }
            Operator::Comma => {
                self.child(l)?;
                self.child(r)?;
                self.comma();
                Ok(())
            }
            Operator::Mul
                if matches!((l, r), (Child::Leaf(_), Child::Leaf(_)))
                    && tree.subtree_eq(l, r) =>
            {
                self.child(l)?;
                self.top_to_reg();
                self.sel.ops.push(FpuOp::Square);
                Ok(())
            }
            _ => {
                self.child(l)?;
                self.child(r)?;
                match arith::binary_helper(op) {
                    Some(addr) => {
                        if reversed {
                            return Err(ExprError::CodeGen(format!(
                                "no reversed form of '{}'",
                                op.symbol()
                            )));
                        }
                        self.call(addr, 2);
                        Ok(())
                    }
                    None => self.binary(op, reversed),
                }
            }
        }
    }

    fn binary(&mut self, op: Operator, reversed: bool) -> Result<(), ExprError> {
        let n = self.stack.len();
        if n < 2 {
            return Err(ExprError::CodeGen("binary operator lacks operands".into()));
        }
        let unsupported = || ExprError::CodeGen(format!("operator '{}'", op.symbol()));
        if let (Entry::Mem(_), Entry::Mem(_)) = (self.stack[n - 2], self.stack[n - 1]) {
            self.load_at(n - 2);
        }
        let (left, right) = (self.stack[n - 2], self.stack[n - 1]);
        let ins = match (left, right) {
            (Entry::Reg, Entry::Reg) => {
                self.regs -= 1;
                FpuOp::Arith {
                    op: ArithOp::of(op, reversed).ok_or_else(unsupported)?,
                    src: Source::Pop,
                }
            }
            (Entry::Reg, Entry::Mem(m)) => FpuOp::Arith {
                op: ArithOp::of(op, reversed).ok_or_else(unsupported)?,
                src: Source::Mem(m),
            },
            (Entry::Mem(m), Entry::Reg) => FpuOp::Arith {
                op: ArithOp::of(op, !reversed).ok_or_else(unsupported)?,
                src: Source::Mem(m),
            },
            (Entry::Mem(_), Entry::Mem(_)) => unreachable!("left operand was loaded"),
        };
        self.sel.ops.push(ins);
        self.stack.truncate(n - 2);
        self.stack.push(Entry::Reg);
        Ok(())
    }

    /// Drops the left operand of a comma and keeps the right one.
    fn comma(&mut self) {
        let n = self.stack.len();
        if n < 2 {
            return;
        }
        match (self.stack[n - 2], self.stack[n - 1]) {
            (Entry::Reg, Entry::Reg) => {
                self.sel.ops.push(FpuOp::DiscardBelow);
                self.regs -= 1;
            }
            (Entry::Reg, Entry::Mem(_)) => {
                self.sel.ops.push(FpuOp::Discard);
                self.regs -= 1;
            }
            (Entry::Mem(_), _) => {}
        }
        let right = self.stack.remove(n - 1);
        self.stack[n - 2] = right;
        // a shadow slot belongs to its position
        if matches!(right, Entry::Mem(Mem::Spill(_))) {
            self.top_to_reg();
        }
    }

    /// Spills the whole register stack, converts the top `argc` entries to
    /// doubles in memory and calls `addr`.
    fn call(&mut self, addr: usize, argc: usize) {
        for pos in (0..self.stack.len()).rev() {
            if self.stack[pos] == Entry::Reg {
                self.sel.ops.push(FpuOp::Spill(Self::slot(pos)));
                self.stack[pos] = Entry::Mem(Mem::Spill(Self::slot(pos)));
            }
        }
        self.regs = 0;
        let first = self.stack.len().saturating_sub(argc);
        let mut args = Vec::with_capacity(argc);
        for pos in first..self.stack.len() {
            let Entry::Mem(m) = self.stack[pos] else {
                continue;
            };
            if self.layout_of(m) == ValueLayout::Double {
                args.push(m);
            } else {
                let to = Self::slot(pos);
                self.sel.ops.push(FpuOp::Copy { from: m, to });
                args.push(Mem::Spill(to));
            }
        }
        self.stack.truncate(first);
        self.sel.ops.push(FpuOp::Call { addr, args });
        self.stack.push(Entry::Reg);
        self.regs = 1;
        self.note_depth();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;
    use crate::symbol::SymbolTable;

    fn table() -> SymbolTable {
        let mut t = SymbolTable::new();
        t.define_input("x", 0).define_input("y", 1);
        t
    }

    const XY: [ValueLayout; 2] = [ValueLayout::Double, ValueLayout::Double];

    #[test]
    fn leaf_operands_become_memory_forms() {
        let tree = parse("x*2 - y", &table()).unwrap();
        let sel = select(&tree, &XY).unwrap();
        assert_eq!(
            sel.ops,
            [
                FpuOp::Load(Mem::Input(0)),
                FpuOp::Arith {
                    op: ArithOp::Mul,
                    src: Source::Mem(Mem::Const(0))
                },
                FpuOp::Arith {
                    op: ArithOp::Sub,
                    src: Source::Mem(Mem::Input(1))
                },
            ]
        );
        assert_eq!(sel.max_regs, 1);
    }

    #[test]
    fn computed_right_operand_flips_memory_form() {
        let tree = parse("x - y*y", &table()).unwrap();
        let sel = select(&tree, &XY).unwrap();
        assert_eq!(
            sel.ops.last(),
            Some(&FpuOp::Arith {
                op: ArithOp::SubR,
                src: Source::Mem(Mem::Input(0))
            })
        );
    }

    #[test]
    fn deep_nesting_spills_and_stays_within_depth() {
        let mut expr = String::from("x");
        for k in 0..12 {
            expr = format!("(x-y*{})*({})", k, expr);
        }
        let tree = parse(&expr, &table()).unwrap();
        let sel = select(&tree, &XY).unwrap();
        assert!(sel.max_regs <= FPU_DEPTH);
        assert!(sel.ops.iter().any(|op| matches!(op, FpuOp::Spill(_))));
    }

    #[test]
    fn calls_start_from_an_empty_register_stack() {
        let tree = parse("x*y + sin(x*y)", &table()).unwrap();
        let sel = select(&tree, &XY).unwrap();
        let call = sel
            .ops
            .iter()
            .position(|op| matches!(op, FpuOp::Call { .. }))
            .unwrap();
        assert_eq!(sel.ops[call - 2], FpuOp::Spill(1));
        assert_eq!(sel.ops[call - 1], FpuOp::Spill(0));
    }

    #[test]
    fn assignment_to_value_input_is_rejected() {
        let tree = parse("x = 2", &table()).unwrap();
        assert!(matches!(select(&tree, &XY), Err(ExprError::CodeGen(_))));
        let ptr = [ValueLayout::DoublePtr, ValueLayout::Double];
        let sel = select(&tree, &ptr).unwrap();
        assert_eq!(sel.ops.last(), Some(&FpuOp::Assign(Mem::InputPtr(0))));
    }

    #[test]
    fn assignment_with_full_stack_writes_the_assigned_value() {
        let mut t = table();
        let v = Variable::double(1.0);
        t.define_var("v", &v);
        let tree = parse(
            "v + (x*2 + (x*3 + (x*4 + (x*5 + (x*6 + (x*7 + (x*8 + (v = x+1))))))))",
            &t,
        )
        .unwrap();
        let sel = select(&tree, &XY).unwrap();
        assert_eq!(sel.max_regs, FPU_DEPTH);
        let assign = sel
            .ops
            .iter()
            .position(|op| matches!(op, FpuOp::Assign(_)))
            .unwrap();
        // `x+1` was spilled to make room for the copy of `v` and comes back
        let Some(FpuOp::Spill(slot)) = sel.ops[..assign]
            .iter()
            .rev()
            .find(|op| matches!(op, FpuOp::Spill(_)))
        else {
            panic!("no spill before the assignment: {:?}", sel.ops);
        };
        assert_eq!(sel.ops[assign - 1], FpuOp::Load(Mem::Spill(*slot)));
    }

    #[test]
    fn overwritten_lazy_operand_is_copied_first() {
        let mut t = table();
        let v = Variable::double(1.0);
        t.define_var("v", &v);
        let tree = parse("v + (v = 3)", &t).unwrap();
        let sel = select(&tree, &XY).unwrap();
        let copy = sel
            .ops
            .iter()
            .position(|op| matches!(op, FpuOp::Copy { .. }))
            .unwrap();
        let assign = sel
            .ops
            .iter()
            .position(|op| matches!(op, FpuOp::Assign(_)))
            .unwrap();
        assert!(copy < assign);
    }
}
