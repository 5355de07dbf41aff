use crate::arith;
use crate::executable::Arg;
use crate::tree::{ExpressionTree, Func, Operator, PostfixItem, Unit, Value};

/// Evaluates a tree by walking its postfix form with an operand stack.
#[derive(Clone, Debug)]
pub struct Interpreter {
    tree: ExpressionTree,
    code: Vec<PostfixItem>,
    temps: usize,
}

impl Interpreter {
    pub fn new(tree: ExpressionTree) -> Self {
        let code = tree.postfix();
        let temps = tree.temp_slot_count();
        Self { tree, code, temps }
    }

    pub fn tree(&self) -> &ExpressionTree {
        &self.tree
    }

    pub fn eval(&self, args: &[Arg<'_>]) -> f64 {
        let mut temps = vec![0.0; self.temps];
        let mut stack: Vec<f64> = Vec::with_capacity(16);
        for item in &self.code {
            match *item {
                PostfixItem::Value(i) => {
                    if let Unit::Value(v) = &self.tree.units[i] {
                        stack.push(read_value(v, args, &temps));
                    }
                }
                PostfixItem::Op(i) => {
                    let Unit::Op {
                        op,
                        reversed,
                        store,
                    } = self.tree.units[i]
                    else {
                        continue;
                    };
                    let r = stack.pop().unwrap_or(f64::NAN);
                    let v = if op.is_unary() {
                        arith::unary(op, r)
                    } else {
                        let l = stack.pop().unwrap_or(f64::NAN);
                        match op {
                            Operator::Comma => r,
                            _ => arith::binary_ordered(op, reversed, l, r),
                        }
                    };
                    stack.push(v);
                    if let Some(k) = store {
                        temps[k as usize] = v;
                    }
                }
                PostfixItem::Func(i) => {
                    let Unit::Func { func, store } = self.tree.units[i] else {
                        continue;
                    };
                    let n = func.arity();
                    let at = stack.len().saturating_sub(n);
                    let v = match func {
                        Func::Symbol(s) => {
                            arith::func_symbol(s, stack.get(at).copied().unwrap_or(f64::NAN))
                        }
                        Func::Native(f) => f.call(&stack[at..]),
                    };
                    stack.truncate(at);
                    stack.push(v);
                    if let Some(k) = store {
                        temps[k as usize] = v;
                    }
                }
                PostfixItem::Assign { target, .. } => {
                    let v = stack.last().copied().unwrap_or(f64::NAN);
                    match &self.tree.units[target] {
                        Unit::Value(Value::Var(var)) => var.set(v),
                        Unit::Value(Value::Input(idx)) => {
                            if let Some(a) = args.get(*idx as usize) {
                                a.assign(v);
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        stack.pop().unwrap_or(f64::NAN)
    }
}

pub(crate) fn read_value(v: &Value, args: &[Arg<'_>], temps: &[f64]) -> f64 {
    match v {
        Value::Const(c) => *c,
        Value::Var(var) => var.get(),
        Value::Input(i) => args.get(*i as usize).map_or(f64::NAN, Arg::value),
        Value::Temp(t) => temps[*t as usize],
    }
}

/// Evaluates `tree` once without building an interpreter.
pub fn eval_tree(tree: &ExpressionTree, args: &[Arg<'_>]) -> f64 {
    Interpreter::new(tree.clone()).eval(args)
}
