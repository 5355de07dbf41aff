use log::debug;

use crate::arith;
use crate::error::ExprError;
use crate::symbol::FuncSymbol;
use crate::tree::{Child, ExpressionTree, Func, Operator, Unit, Value};

/// A derivative under construction. The identities are kept symbolic until
/// an operation needs a concrete leaf.
#[derive(Clone, Copy, Debug, PartialEq)]
enum D {
    Zero,
    One,
    Expr(Child),
}

/// Builds the derivative of `src` with respect to positional input `input`.
///
/// The result is a fresh tree; `src` is not modified. Temporaries in `src`
/// are expanded back into the subtrees that stored them.
pub fn differentiate(src: &ExpressionTree, input: u16) -> Result<ExpressionTree, ExprError> {
    let mut d = Differentiator {
        src,
        out: ExpressionTree::new(),
        input,
    };
    let root = d.eval(src.root())?;
    let root = d.materialize(root);
    d.out.set_root(root);
    d.out.compact();
    debug!("d/d(in{}) {} = {}", input, src, d.out);
    Ok(d.out)
}

struct Differentiator<'a> {
    src: &'a ExpressionTree,
    out: ExpressionTree,
    input: u16,
}

impl Differentiator<'_> {
    fn eval(&mut self, c: Child) -> Result<D, ExprError> {
        let src = self.src;
        let n = match c {
            Child::None => return Ok(D::Zero),
            Child::Leaf(i) => {
                return Ok(match &src.units[i] {
                    Unit::Value(Value::Input(k)) if *k == self.input => D::One,
                    Unit::Value(Value::Temp(t)) => match self.stored(*t) {
                        Some(s) => self.eval(s)?,
                        None => D::Zero,
                    },
                    _ => D::Zero,
                });
            }
            Child::Node(n) => n,
        };
        let node = src.nodes[n];
        match src.units[node.op] {
            Unit::Func { func, .. } => {
                let args = src.func_args(n);
                match func {
                    Func::Symbol(sym) => {
                        let arg = args.first().copied().unwrap_or(Child::None);
                        let darg = self.eval(arg)?;
                        if darg == D::Zero {
                            return Ok(D::Zero);
                        }
                        let outer = self.symbol_derivative(sym, arg);
                        Ok(self.mul(outer, darg))
                    }
                    Func::Native(_) => {
                        for a in args {
                            if self.eval(a)? != D::Zero {
                                return Err(ExprError::Unsupported(
                                    "derivative of a native function".into(),
                                ));
                            }
                        }
                        Ok(D::Zero)
                    }
                }
            }
            Unit::Op { op, reversed, .. } => {
                let [l, r] = node.children;
                if op.is_unary() {
                    let dr = self.eval(r)?;
                    return Ok(match op {
                        Operator::Neg => self.neg(dr),
                        _ => dr,
                    });
                }
                let (a, b) = if reversed { (r, l) } else { (l, r) };
                match op {
                    Operator::Add => {
                        let (da, db) = (self.eval(a)?, self.eval(b)?);
                        Ok(self.add(da, db))
                    }
                    Operator::Sub => {
                        let (da, db) = (self.eval(a)?, self.eval(b)?);
                        Ok(self.sub(da, db))
                    }
                    Operator::Mul => {
                        let (da, db) = (self.eval(a)?, self.eval(b)?);
                        let t1 = if da == D::Zero {
                            D::Zero
                        } else {
                            let eb = self.copy(b);
                            self.mul(da, eb)
                        };
                        let t2 = if db == D::Zero {
                            D::Zero
                        } else {
                            let ea = self.copy(a);
                            self.mul(ea, db)
                        };
                        Ok(self.add(t1, t2))
                    }
                    Operator::Div => self.div_rule(a, b),
                    Operator::Pow => self.pow_rule(a, b),
                    Operator::Comma | Operator::Assign => self.eval(r),
                    _ => Ok(D::Zero),
                }
            }
            Unit::Value(_) => Ok(D::Zero),
        }
    }

    fn div_rule(&mut self, a: Child, b: Child) -> Result<D, ExprError> {
        let (da, db) = (self.eval(a)?, self.eval(b)?);
        let t1 = if da == D::Zero {
            D::Zero
        } else {
            let eb = self.copy(b);
            self.div(da, eb)
        };
        if db == D::Zero {
            return Ok(t1);
        }
        // dL/R - L*dR/R^2
        let ea = self.copy(a);
        let num = self.mul(ea, db);
        let eb = self.copy(b);
        let two = self.constant(2.0);
        let den = self.pow(eb, two);
        let t2 = self.div(num, den);
        Ok(self.sub(t1, t2))
    }

    fn pow_rule(&mut self, a: Child, b: Child) -> Result<D, ExprError> {
        let (da, db) = (self.eval(a)?, self.eval(b)?);
        if db == D::Zero {
            if da == D::Zero {
                return Ok(D::Zero);
            }
            // R * L^(R-1) * dL
            let r = self.copy(b);
            let l = self.copy(a);
            let r2 = self.copy(b);
            let e = self.sub(r2, D::One);
            let p = self.pow(l, e);
            let rp = self.mul(r, p);
            return Ok(self.mul(rp, da));
        }
        // L^R * (ln(L)*dR + R/L*dL)
        let l = self.copy(a);
        let r = self.copy(b);
        let p = self.pow(l, r);
        let l2 = self.copy(a);
        let ln = self.func(FuncSymbol::Ln, l2);
        let t1 = self.mul(ln, db);
        let t2 = if da == D::Zero {
            D::Zero
        } else {
            let r2 = self.copy(b);
            let l3 = self.copy(a);
            let q = self.div(r2, l3);
            self.mul(q, da)
        };
        let s = self.add(t1, t2);
        Ok(self.mul(p, s))
    }

    /// Closed-form derivative of a built-in function at `arg`.
    fn symbol_derivative(&mut self, sym: FuncSymbol, arg: Child) -> D {
        use FuncSymbol::*;
        match sym {
            Exp => {
                let u = self.copy(arg);
                self.func(Exp, u)
            }
            Ln => {
                let u = self.copy(arg);
                self.div(D::One, u)
            }
            Sin => {
                let u = self.copy(arg);
                self.func(Cos, u)
            }
            Cos => {
                let u = self.copy(arg);
                let s = self.func(Sin, u);
                self.neg(s)
            }
            Tan => {
                let u = self.copy(arg);
                let s = self.func(Sec, u);
                let two = self.constant(2.0);
                self.pow(s, two)
            }
            Cot => {
                let u = self.copy(arg);
                let c = self.func(Csc, u);
                let two = self.constant(2.0);
                let p = self.pow(c, two);
                self.neg(p)
            }
            Sec => {
                let u = self.copy(arg);
                let s = self.func(Sec, u);
                let u2 = self.copy(arg);
                let t = self.func(Tan, u2);
                self.mul(s, t)
            }
            Csc => {
                let u = self.copy(arg);
                let c = self.func(Csc, u);
                let u2 = self.copy(arg);
                let t = self.func(Cot, u2);
                let m = self.mul(c, t);
                self.neg(m)
            }
            Sqrt => {
                let u = self.copy(arg);
                let e = self.constant(-0.5);
                let p = self.pow(u, e);
                let half = self.constant(0.5);
                self.mul(half, p)
            }
        }
    }

    fn stored(&self, slot: u16) -> Option<Child> {
        let mut found = None;
        self.src.visit(self.src.root(), &mut |c| {
            if let Child::Node(n) = c {
                if self.src.units[self.src.nodes[n].op].store() == Some(slot) {
                    found = Some(c);
                }
            }
        });
        found
    }

    /// Copies a source subtree into the output, dropping CSE annotations.
    fn copy(&mut self, c: Child) -> D {
        D::Expr(self.copy_child(c))
    }

    fn copy_child(&mut self, c: Child) -> Child {
        let src = self.src;
        match c {
            Child::None => Child::None,
            Child::Leaf(i) => match &src.units[i] {
                Unit::Value(Value::Temp(t)) => match self.stored(*t) {
                    Some(s) => self.copy_child(s),
                    None => self.out.push_leaf(Value::Const(f64::NAN)),
                },
                u => {
                    let u = u.clone();
                    Child::Leaf(self.out.push_unit(u))
                }
            },
            Child::Node(n) => {
                let node = src.nodes[n];
                let l = self.copy_child(node.children[0]);
                let r = self.copy_child(node.children[1]);
                let mut unit = src.units[node.op].clone();
                unit.set_store(None);
                self.out.push_node(unit, l, r)
            }
        }
    }

    fn materialize(&mut self, d: D) -> Child {
        match d {
            D::Zero => self.out.push_leaf(Value::Const(0.0)),
            D::One => self.out.push_leaf(Value::Const(1.0)),
            D::Expr(c) => c,
        }
    }

    fn const_value(&self, d: D) -> Option<f64> {
        match d {
            D::Zero => Some(0.0),
            D::One => Some(1.0),
            D::Expr(c) => self.out.const_of(c),
        }
    }

    fn constant(&mut self, v: f64) -> D {
        if v == 0.0 {
            D::Zero
        } else if v == 1.0 {
            D::One
        } else {
            D::Expr(self.out.push_leaf(Value::Const(v)))
        }
    }

    fn same(&self, a: D, b: D) -> bool {
        match (a, b) {
            (D::Expr(x), D::Expr(y)) => self.out.subtree_eq(x, y),
            _ => a == b,
        }
    }

    fn binary(&mut self, op: Operator, a: D, b: D) -> D {
        if let (Some(x), Some(y)) = (self.const_value(a), self.const_value(b)) {
            return self.constant(arith::binary(op, x, y));
        }
        let l = self.materialize(a);
        let r = self.materialize(b);
        D::Expr(self.out.push_node(Unit::op(op), l, r))
    }

    fn add(&mut self, a: D, b: D) -> D {
        match (a, b) {
            (D::Zero, x) | (x, D::Zero) => x,
            _ => self.binary(Operator::Add, a, b),
        }
    }

    fn sub(&mut self, a: D, b: D) -> D {
        match (a, b) {
            (x, D::Zero) => x,
            (D::Zero, x) => self.neg(x),
            _ if self.same(a, b) => D::Zero,
            _ => self.binary(Operator::Sub, a, b),
        }
    }

    fn mul(&mut self, a: D, b: D) -> D {
        match (a, b) {
            (D::Zero, _) | (_, D::Zero) => D::Zero,
            (D::One, x) | (x, D::One) => x,
            _ => self.binary(Operator::Mul, a, b),
        }
    }

    fn div(&mut self, a: D, b: D) -> D {
        match (a, b) {
            (D::Zero, _) => D::Zero,
            (x, D::One) => x,
            _ if self.same(a, b) => D::One,
            _ => self.binary(Operator::Div, a, b),
        }
    }

    fn pow(&mut self, a: D, b: D) -> D {
        match (a, b) {
            (_, D::Zero) => D::One,
            (x, D::One) => x,
            _ => self.binary(Operator::Pow, a, b),
        }
    }

    fn neg(&mut self, a: D) -> D {
        match a {
            D::Zero => D::Zero,
            _ => match self.const_value(a) {
                Some(v) => self.constant(-v),
                None => {
                    let r = self.materialize(a);
                    D::Expr(self.out.push_node(Unit::op(Operator::Neg), Child::None, r))
                }
            },
        }
    }

    fn func(&mut self, sym: FuncSymbol, arg: D) -> D {
        if let Some(v) = self.const_value(arg) {
            return self.constant(arith::func_symbol(sym, v));
        }
        let a = self.materialize(arg);
        D::Expr(
            self.out
                .push_node(Unit::func(Func::Symbol(sym)), a, Child::None),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executable::Arg;
    use crate::interp::eval_tree;
    use crate::parser::parse;
    use crate::symbol::SymbolTable;

    fn table() -> SymbolTable {
        let mut t = SymbolTable::new();
        t.define_input("x", 0).define_input("y", 1);
        t
    }

    #[test]
    fn identities_stay_symbolic() {
        let t = table();
        let d = differentiate(&parse("x + y*3", &t).unwrap(), 0).unwrap();
        assert_eq!(d.to_string(), "1");
        let d = differentiate(&parse("y", &t).unwrap(), 0).unwrap();
        assert_eq!(d.to_string(), "0");
    }

    #[test]
    fn product_rule_at_point() {
        let t = table();
        let d = differentiate(&parse("x*x", &t).unwrap(), 0).unwrap();
        let v = eval_tree(&d, &[Arg::Double(5.0)]);
        assert!((v - 10.0).abs() < 1e-12);
    }

    #[test]
    fn source_is_untouched() {
        let t = table();
        let src = parse("sin(x)*x", &t).unwrap();
        let before = src.to_string();
        let _ = differentiate(&src, 0).unwrap();
        assert_eq!(src.to_string(), before);
    }
}
