use std::fmt::{self, Write as _};
use std::hash::{Hash, Hasher};

use crate::symbol::{FuncSymbol, NativeFn, SymbolTable, Variable};

/// Precedence class of a function call.
pub const FUNC_PRECEDENCE: u8 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operator {
    /// Chains function arguments; never evaluated on its own.
    Separator,
    /// Top-level `,`: evaluates both sides, yields the right one.
    Comma,
    Assign,
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Neg,
    Plus,
}

impl Operator {
    pub fn precedence(self) -> u8 {
        use Operator::*;
        match self {
            Separator | Comma => 0,
            Assign => 1,
            Gt | Ge | Lt | Le | Eq | Ne => 2,
            Add | Sub => 3,
            Mul | Div => 6,
            Pow => 8,
            Neg | Plus => 9,
        }
    }

    /// Ties between equal-precedence operators of this kind split at the leftmost.
    pub fn is_assoc_lr(self) -> bool {
        matches!(self, Operator::Assign | Operator::Neg | Operator::Plus)
    }

    pub fn is_unary(self) -> bool {
        matches!(self, Operator::Neg | Operator::Plus)
    }

    /// Operators whose operands may be swapped by toggling the reversed flag.
    pub fn is_reversible(self) -> bool {
        matches!(
            self,
            Operator::Add | Operator::Sub | Operator::Mul | Operator::Div
        )
    }

    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Operator::Add | Operator::Mul | Operator::Eq | Operator::Ne
        )
    }

    pub fn symbol(self) -> &'static str {
        use Operator::*;
        match self {
            Separator | Comma => ",",
            Assign => "=",
            Gt => ">",
            Ge => ">=",
            Lt => "<",
            Le => "<=",
            Eq => "==",
            Ne => "!=",
            Add | Plus => "+",
            Sub | Neg => "-",
            Mul => "*",
            Div => "/",
            Pow => "^",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Func {
    Symbol(FuncSymbol),
    Native(NativeFn),
}

impl Func {
    pub fn arity(&self) -> usize {
        match self {
            Func::Symbol(_) => 1,
            Func::Native(f) => f.arity(),
        }
    }
}

#[derive(Clone, Debug)]
pub enum Value {
    Const(f64),
    Var(Variable),
    Input(u16),
    /// Read of a CSE temporary slot.
    Temp(u16),
}

impl Value {
    /// Structural identity: constants by bit pattern, variables by storage.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Const(a), Value::Const(b)) => a.to_bits() == b.to_bits(),
            (Value::Var(a), Value::Var(b)) => a.ptr_eq(b),
            (Value::Input(a), Value::Input(b)) => a == b,
            (Value::Temp(a), Value::Temp(b)) => a == b,
            _ => false,
        }
    }

    fn hash_into<H: Hasher>(&self, h: &mut H) {
        match self {
            Value::Const(v) => {
                0u8.hash(h);
                v.to_bits().hash(h);
            }
            Value::Var(v) => {
                1u8.hash(h);
                v.addr().hash(h);
            }
            Value::Input(i) => {
                2u8.hash(h);
                i.hash(h);
            }
            Value::Temp(t) => {
                3u8.hash(h);
                t.hash(h);
            }
        }
    }
}

/// One entry of a tree's flat unit table.
#[derive(Clone, Debug)]
pub enum Unit {
    Op {
        op: Operator,
        /// When set the node computes `right OP left`.
        reversed: bool,
        /// CSE annotation: store the result into this temporary slot.
        store: Option<u16>,
    },
    Func {
        func: Func,
        store: Option<u16>,
    },
    Value(Value),
}

impl Unit {
    pub fn op(op: Operator) -> Unit {
        Unit::Op {
            op,
            reversed: false,
            store: None,
        }
    }

    pub fn func(func: Func) -> Unit {
        Unit::Func { func, store: None }
    }

    pub fn operator(&self) -> Option<Operator> {
        match self {
            Unit::Op { op, .. } => Some(*op),
            _ => None,
        }
    }

    pub fn store(&self) -> Option<u16> {
        match self {
            Unit::Op { store, .. } | Unit::Func { store, .. } => *store,
            Unit::Value(_) => None,
        }
    }

    pub(crate) fn set_store(&mut self, slot: Option<u16>) {
        match self {
            Unit::Op { store, .. } | Unit::Func { store, .. } => *store = slot,
            Unit::Value(_) => {}
        }
    }

    pub fn is_reversed(&self) -> bool {
        matches!(self, Unit::Op { reversed: true, .. })
    }

    pub fn precedence(&self) -> u8 {
        match self {
            Unit::Op { op, .. } => op.precedence(),
            Unit::Func { .. } | Unit::Value(_) => FUNC_PRECEDENCE,
        }
    }

    /// Same operation or value, ignoring CSE annotations.
    fn same_kind(&self, other: &Unit) -> bool {
        match (self, other) {
            (
                Unit::Op {
                    op: a, reversed: ra, ..
                },
                Unit::Op {
                    op: b, reversed: rb, ..
                },
            ) => a == b && ra == rb,
            (Unit::Func { func: a, .. }, Unit::Func { func: b, .. }) => a == b,
            (Unit::Value(a), Unit::Value(b)) => a.same(b),
            _ => false,
        }
    }

    fn hash_into<H: Hasher>(&self, h: &mut H) {
        match self {
            Unit::Op { op, reversed, .. } => {
                0u8.hash(h);
                op.hash(h);
                reversed.hash(h);
            }
            Unit::Func { func, .. } => {
                1u8.hash(h);
                match func {
                    Func::Symbol(s) => s.hash(h),
                    Func::Native(f) => f.addr().hash(h),
                }
            }
            Unit::Value(v) => {
                2u8.hash(h);
                v.hash_into(h);
            }
        }
    }
}

/// Reference from a node to one of its operands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Child {
    None,
    Leaf(usize),
    Node(usize),
}

impl Child {
    pub fn is_none(self) -> bool {
        matches!(self, Child::None)
    }
}

/// An operator or function node. Unary operators keep their operand in
/// `children[1]`; functions chain their arguments from `children[0]`.
#[derive(Clone, Copy, Debug)]
pub struct Node {
    pub op: usize,
    pub children: [Child; 2],
}

/// Linearised evaluation order. Indices refer to the unit table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PostfixItem {
    Value(usize),
    Op(usize),
    Func(usize),
    /// The assigned value is on the stack; `target` is the value unit written to.
    Assign { op: usize, target: usize },
}

/// Owns the unit and node tables of one expression.
#[derive(Clone, Debug)]
pub struct ExpressionTree {
    pub(crate) units: Vec<Unit>,
    pub(crate) nodes: Vec<Node>,
}

impl Default for ExpressionTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpressionTree {
    pub const ROOT: usize = 0;

    pub fn new() -> Self {
        // unit 0 is the root's identity operator
        Self {
            units: vec![Unit::op(Operator::Plus)],
            nodes: vec![Node {
                op: 0,
                children: [Child::None, Child::None],
            }],
        }
    }

    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn root(&self) -> Child {
        self.nodes[Self::ROOT].children[0]
    }

    pub(crate) fn set_root(&mut self, c: Child) {
        self.nodes[Self::ROOT].children[0] = c;
    }

    pub fn is_empty(&self) -> bool {
        self.root().is_none()
    }

    pub(crate) fn push_unit(&mut self, u: Unit) -> usize {
        self.units.push(u);
        self.units.len() - 1
    }

    pub(crate) fn push_leaf(&mut self, v: Value) -> Child {
        Child::Leaf(self.push_unit(Unit::Value(v)))
    }

    pub(crate) fn push_node(&mut self, unit: Unit, left: Child, right: Child) -> Child {
        let op = self.push_unit(unit);
        self.nodes.push(Node {
            op,
            children: [left, right],
        });
        Child::Node(self.nodes.len() - 1)
    }

    pub fn unit_of(&self, c: Child) -> Option<&Unit> {
        match c {
            Child::None => None,
            Child::Leaf(i) => Some(&self.units[i]),
            Child::Node(n) => Some(&self.units[self.nodes[n].op]),
        }
    }

    pub fn value_of(&self, c: Child) -> Option<&Value> {
        match c {
            Child::Leaf(i) => match &self.units[i] {
                Unit::Value(v) => Some(v),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn const_of(&self, c: Child) -> Option<f64> {
        match self.value_of(c) {
            Some(Value::Const(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn depth(&self, c: Child) -> usize {
        match c {
            Child::None => 0,
            Child::Leaf(_) => 1,
            Child::Node(n) => {
                let [l, r] = self.nodes[n].children;
                1 + self.depth(l).max(self.depth(r))
            }
        }
    }

    pub fn subtree_eq(&self, a: Child, b: Child) -> bool {
        match (a, b) {
            (Child::None, Child::None) => true,
            (Child::Leaf(x), Child::Leaf(y)) => self.units[x].same_kind(&self.units[y]),
            (Child::Node(x), Child::Node(y)) => {
                if x == y {
                    return true;
                }
                let (nx, ny) = (self.nodes[x], self.nodes[y]);
                self.units[nx.op].same_kind(&self.units[ny.op])
                    && self.subtree_eq(nx.children[0], ny.children[0])
                    && self.subtree_eq(nx.children[1], ny.children[1])
            }
            _ => false,
        }
    }

    pub(crate) fn hash_subtree<H: Hasher>(&self, c: Child, h: &mut H) {
        match c {
            Child::None => 0u8.hash(h),
            Child::Leaf(i) => {
                1u8.hash(h);
                self.units[i].hash_into(h);
            }
            Child::Node(n) => {
                2u8.hash(h);
                let node = self.nodes[n];
                self.units[node.op].hash_into(h);
                self.hash_subtree(node.children[0], h);
                self.hash_subtree(node.children[1], h);
            }
        }
    }

    /// True when evaluating `c` writes to a variable or input.
    pub fn has_assign(&self, c: Child) -> bool {
        match c {
            Child::Node(n) => {
                let node = self.nodes[n];
                matches!(self.units[node.op].operator(), Some(Operator::Assign))
                    || self.has_assign(node.children[0])
                    || self.has_assign(node.children[1])
            }
            _ => false,
        }
    }

    /// Collects the leaves and nodes reachable from `c`, in no particular order.
    pub(crate) fn visit<F: FnMut(Child)>(&self, c: Child, f: &mut F) {
        if let Child::Node(n) = c {
            let [l, r] = self.nodes[n].children;
            self.visit(l, f);
            self.visit(r, f);
        }
        if !c.is_none() {
            f(c);
        }
    }

    pub fn is_using_input(&self, index: u16) -> bool {
        let mut found = false;
        self.visit(self.root(), &mut |c| {
            if let Some(Value::Input(i)) = self.value_of(c) {
                found |= *i == index;
            }
        });
        found
    }

    pub fn is_using_var(&self, var: &Variable) -> bool {
        let mut found = false;
        self.visit(self.root(), &mut |c| {
            if let Some(Value::Var(v)) = self.value_of(c) {
                found |= v.ptr_eq(var);
            }
        });
        found
    }

    /// Number of temporary slots the tree's CSE annotations refer to.
    pub fn temp_slot_count(&self) -> usize {
        let mut count = 0usize;
        self.visit(self.root(), &mut |c| {
            let slot = match self.unit_of(c) {
                Some(Unit::Value(Value::Temp(t))) => Some(*t),
                Some(u) => u.store(),
                None => None,
            };
            if let Some(t) = slot {
                count = count.max(t as usize + 1);
            }
        });
        count
    }

    /// Arguments of a function node in call order.
    pub fn func_args(&self, node: usize) -> Vec<Child> {
        let mut args = Vec::new();
        self.collect_args(self.nodes[node].children[0], &mut args);
        args
    }

    fn collect_args(&self, c: Child, out: &mut Vec<Child>) {
        match c {
            Child::None => {}
            Child::Node(n)
                if matches!(
                    self.units[self.nodes[n].op].operator(),
                    Some(Operator::Separator)
                ) =>
            {
                let [l, r] = self.nodes[n].children;
                self.collect_args(l, out);
                self.collect_args(r, out);
            }
            other => out.push(other),
        }
    }

    /// Linearises the tree into evaluation order.
    pub fn postfix(&self) -> Vec<PostfixItem> {
        let mut out = Vec::new();
        self.postfix_into(self.root(), &mut out);
        out
    }

    fn postfix_into(&self, c: Child, out: &mut Vec<PostfixItem>) {
        match c {
            Child::None => {}
            Child::Leaf(i) => out.push(PostfixItem::Value(i)),
            Child::Node(n) => {
                let node = self.nodes[n];
                let [l, r] = node.children;
                match &self.units[node.op] {
                    Unit::Op {
                        op: Operator::Assign,
                        ..
                    } => {
                        self.postfix_into(r, out);
                        if let Child::Leaf(target) = l {
                            out.push(PostfixItem::Assign {
                                op: node.op,
                                target,
                            });
                        }
                    }
                    Unit::Op {
                        op: Operator::Separator,
                        ..
                    } => {
                        self.postfix_into(l, out);
                        self.postfix_into(r, out);
                    }
                    Unit::Op { .. } => {
                        self.postfix_into(l, out);
                        self.postfix_into(r, out);
                        out.push(PostfixItem::Op(node.op));
                    }
                    Unit::Func { .. } => {
                        self.postfix_into(l, out);
                        self.postfix_into(r, out);
                        out.push(PostfixItem::Func(node.op));
                    }
                    Unit::Value(_) => out.push(PostfixItem::Value(node.op)),
                }
            }
        }
    }

    /// Copies the subtree `c` of `src` into this tree, re-indexing every unit
    /// and node.
    pub fn import(&mut self, src: &ExpressionTree, c: Child) -> Child {
        match c {
            Child::None => Child::None,
            Child::Leaf(i) => Child::Leaf(self.push_unit(src.units[i].clone())),
            Child::Node(n) => {
                let node = src.nodes[n];
                let l = self.import(src, node.children[0]);
                let r = self.import(src, node.children[1]);
                self.push_node(src.units[node.op].clone(), l, r)
            }
        }
    }

    /// Drops units and nodes no longer reachable from the root.
    pub fn compact(&mut self) {
        let mut fresh = ExpressionTree::new();
        let root = fresh.import(self, self.root());
        fresh.set_root(root);
        *self = fresh;
    }

    /// Prints the expression back as infix text, resolving names through `symbols`.
    pub fn to_text(&self, symbols: &SymbolTable) -> String {
        let mut s = String::new();
        self.write_child(&mut s, self.root(), Some(symbols));
        s
    }

    fn write_child(&self, s: &mut String, c: Child, symbols: Option<&SymbolTable>) {
        match c {
            Child::None => {}
            Child::Leaf(i) => self.write_unit_value(s, &self.units[i], symbols),
            Child::Node(n) => {
                let node = self.nodes[n];
                let [l, r] = node.children;
                match &self.units[node.op] {
                    Unit::Op { op, reversed, .. } => {
                        let prec = op.precedence();
                        if op.is_unary() {
                            s.push_str(op.symbol());
                            self.write_operand(s, r, symbols, |p| p < prec);
                            return;
                        }
                        let (a, b) = if *reversed { (r, l) } else { (l, r) };
                        let lr = op.is_assoc_lr();
                        self.write_operand(s, a, symbols, |p| p < prec || (lr && p == prec));
                        s.push_str(op.symbol());
                        self.write_operand(s, b, symbols, |p| p < prec || (!lr && p == prec));
                    }
                    Unit::Func { func, .. } => {
                        match func {
                            Func::Symbol(sym) => s.push_str(sym.name()),
                            Func::Native(f) => {
                                let name = symbols.and_then(|t| t.func_name(f));
                                s.push_str(name.unwrap_or("fn"));
                            }
                        }
                        s.push('(');
                        for (k, arg) in self.func_args(n).into_iter().enumerate() {
                            if k > 0 {
                                s.push(',');
                            }
                            self.write_child(s, arg, symbols);
                        }
                        s.push(')');
                    }
                    Unit::Value(_) => self.write_unit_value(s, &self.units[node.op], symbols),
                }
            }
        }
    }

    fn write_operand<P: Fn(u8) -> bool>(
        &self,
        s: &mut String,
        c: Child,
        symbols: Option<&SymbolTable>,
        needs_bracket: P,
    ) {
        let prec = match c {
            Child::Node(n) => self.units[self.nodes[n].op].precedence(),
            _ => FUNC_PRECEDENCE,
        };
        if needs_bracket(prec) {
            s.push('(');
            self.write_child(s, c, symbols);
            s.push(')');
        } else {
            self.write_child(s, c, symbols);
        }
    }

    fn write_unit_value(&self, s: &mut String, u: &Unit, symbols: Option<&SymbolTable>) {
        let Unit::Value(v) = u else {
            return;
        };
        match v {
            Value::Const(c) if *c < 0.0 => {
                let _ = write!(s, "({})", c);
            }
            Value::Const(c) => {
                let _ = write!(s, "{}", c);
            }
            Value::Var(var) => match symbols.and_then(|t| t.var_name(var)) {
                Some(name) => s.push_str(name),
                None => {
                    let _ = write!(s, "var@{:x}", var.addr());
                }
            },
            Value::Input(i) => match symbols.and_then(|t| t.input_name(*i)) {
                Some(name) => s.push_str(name),
                None => {
                    let _ = write!(s, "in{}", i);
                }
            },
            Value::Temp(t) => {
                let _ = write!(s, "$t{}", t);
            }
        }
    }
}

impl fmt::Display for ExpressionTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::new();
        self.write_child(&mut s, self.root(), None);
        f.write_str(&s)
    }
}
