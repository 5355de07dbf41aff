use foldhash::{HashMap, HashMapExt};
use log::debug;
use std::hash::BuildHasher;

use crate::arith;
use crate::tree::{Child, ExpressionTree, Func, Operator, PostfixItem, Unit, Value};

const MAX_ROUNDS: usize = 64;

/// Which passes changed the tree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OptimizeReport {
    pub simplified: bool,
    pub folded: bool,
    pub reordered_operands: bool,
    pub cse: bool,
    pub reordered_nodes: bool,
    pub packed_temps: bool,
}

impl OptimizeReport {
    pub fn changed(&self) -> bool {
        self.simplified
            || self.folded
            || self.reordered_operands
            || self.cse
            || self.reordered_nodes
            || self.packed_temps
    }
}

/// Runs the fixed pass pipeline. Every pass runs to its own fixpoint before
/// the next one starts.
pub fn optimize(tree: &mut ExpressionTree, cse: bool) -> OptimizeReport {
    let mut report = OptimizeReport {
        simplified: fixpoint(tree, simplify),
        folded: fixpoint(tree, fold_constants),
        reordered_operands: fixpoint(tree, reorder_operands),
        ..Default::default()
    };
    if report.reordered_operands {
        report.folded |= fixpoint(tree, fold_constants);
        report.simplified |= fixpoint(tree, simplify);
    }
    if cse {
        report.cse = fixpoint(tree, eliminate_common_subexpressions);
    }
    report.reordered_nodes = fixpoint(tree, reorder_nodes);
    report.packed_temps = pack_temp_slots(tree);
    tree.compact();
    debug!("optimized -> {} ({:?})", tree, report);
    report
}

fn fixpoint(tree: &mut ExpressionTree, pass: fn(&mut ExpressionTree) -> bool) -> bool {
    let mut any = false;
    for _ in 0..MAX_ROUNDS {
        if !pass(tree) {
            break;
        }
        any = true;
    }
    any
}

/// Bottom-up rewrite driver. `rule` sees a node whose children are already
/// rewritten and returns its replacement, `Some(Child::Node(n))` meaning the
/// node was edited in place.
fn rewrite<F>(tree: &mut ExpressionTree, c: Child, rule: &mut F) -> (Child, bool)
where
    F: FnMut(&mut ExpressionTree, usize) -> Option<Child>,
{
    let Child::Node(n) = c else {
        return (c, false);
    };
    let mut changed = false;
    for k in 0..2 {
        let (nc, ch) = rewrite(tree, tree.nodes[n].children[k], rule);
        tree.nodes[n].children[k] = nc;
        changed |= ch;
    }
    match rule(tree, n) {
        Some(new) => (new, true),
        None => (c, changed),
    }
}

fn run_rule<F>(tree: &mut ExpressionTree, mut rule: F) -> bool
where
    F: FnMut(&mut ExpressionTree, usize) -> Option<Child>,
{
    let (root, changed) = rewrite(tree, tree.root(), &mut rule);
    tree.set_root(root);
    changed
}

/// Operand order as written, undoing the reversed flag.
fn logical(tree: &ExpressionTree, n: usize, reversed: bool) -> (Child, Child) {
    let [l, r] = tree.nodes[n].children;
    if reversed { (r, l) } else { (l, r) }
}

fn plain_op(tree: &ExpressionTree, n: usize) -> Option<(Operator, bool)> {
    match tree.units[tree.nodes[n].op] {
        Unit::Op {
            op,
            reversed,
            store: None,
        } => Some((op, reversed)),
        _ => None,
    }
}

/// Identity rewrites such as `x+0`, `x*1` or `x/x`.
pub fn simplify(tree: &mut ExpressionTree) -> bool {
    run_rule(tree, simplify_node)
}

fn simplify_node(tree: &mut ExpressionTree, n: usize) -> Option<Child> {
    let (op, reversed) = plain_op(tree, n)?;
    let [_, r] = tree.nodes[n].children;
    match op {
        Operator::Plus => return Some(r),
        Operator::Neg => {
            if let Child::Node(m) = r {
                if plain_op(tree, m) == Some((Operator::Neg, false)) {
                    return Some(tree.nodes[m].children[1]);
                }
            }
            return None;
        }
        _ => {}
    }
    let (a, b) = logical(tree, n, reversed);
    let (ca, cb) = (tree.const_of(a), tree.const_of(b));
    let (pure_a, pure_b) = (!tree.has_assign(a), !tree.has_assign(b));
    let same = matches!(op, Operator::Sub | Operator::Div)
        && pure_a
        && pure_b
        && tree.subtree_eq(a, b);
    match op {
        Operator::Add if cb == Some(0.0) => Some(a),
        Operator::Add if ca == Some(0.0) => Some(b),
        Operator::Sub if cb == Some(0.0) => Some(a),
        Operator::Sub if same => Some(tree.push_leaf(Value::Const(0.0))),
        Operator::Mul if cb == Some(1.0) => Some(a),
        Operator::Mul if ca == Some(1.0) => Some(b),
        Operator::Mul if (cb == Some(0.0) && pure_a) || (ca == Some(0.0) && pure_b) => {
            Some(tree.push_leaf(Value::Const(0.0)))
        }
        Operator::Div if cb == Some(1.0) => Some(a),
        Operator::Div if same => Some(tree.push_leaf(Value::Const(1.0))),
        Operator::Pow if cb == Some(1.0) => Some(a),
        Operator::Pow if cb == Some(0.0) && pure_a => Some(tree.push_leaf(Value::Const(1.0))),
        _ => None,
    }
}

/// Replaces operator and function nodes whose operands are all constants.
pub fn fold_constants(tree: &mut ExpressionTree) -> bool {
    run_rule(tree, fold_node)
}

fn fold_node(tree: &mut ExpressionTree, n: usize) -> Option<Child> {
    let [l, r] = tree.nodes[n].children;
    let v = match tree.units[tree.nodes[n].op] {
        Unit::Op {
            op,
            reversed,
            store: None,
        } => match op {
            Operator::Separator | Operator::Assign => return None,
            Operator::Comma => {
                return if tree.has_assign(l) { None } else { Some(r) };
            }
            op if op.is_unary() => arith::unary(op, tree.const_of(r)?),
            op => arith::binary_ordered(op, reversed, tree.const_of(l)?, tree.const_of(r)?),
        },
        Unit::Func { func, store: None } => {
            if func.arity() == 0 {
                return None;
            }
            let args = tree
                .func_args(n)
                .into_iter()
                .map(|a| tree.const_of(a))
                .collect::<Option<Vec<f64>>>()?;
            match func {
                Func::Symbol(s) => arith::func_symbol(s, args[0]),
                Func::Native(f) => f.call(&args),
            }
        }
        _ => return None,
    };
    Some(tree.push_leaf(Value::Const(v)))
}

/// Moves constants to the right of reversible operators, merges chained
/// power-of-two scalings (`(a*2)*4 -> a*8`) and expands `x^2` over a leaf
/// into `x*x`. Any other chain keeps its grouping, so results stay
/// bit-identical.
pub fn reorder_operands(tree: &mut ExpressionTree) -> bool {
    run_rule(tree, reorder_operand_node)
}

fn reorder_operand_node(tree: &mut ExpressionTree, n: usize) -> Option<Child> {
    let (op, reversed) = plain_op(tree, n)?;
    let [l, r] = tree.nodes[n].children;
    if op == Operator::Pow && !reversed && tree.const_of(r) == Some(2.0) {
        if let Child::Leaf(i) = l {
            let dup = tree.push_unit(tree.units[i].clone());
            tree.units[tree.nodes[n].op] = Unit::op(Operator::Mul);
            tree.nodes[n].children = [l, Child::Leaf(dup)];
            return Some(Child::Node(n));
        }
        return None;
    }
    if !op.is_reversible() {
        return None;
    }
    if tree.const_of(l).is_some() && tree.const_of(r).is_none() {
        tree.nodes[n].children = [r, l];
        tree.units[tree.nodes[n].op] = Unit::Op {
            op,
            reversed: !reversed,
            store: None,
        };
        return Some(Child::Node(n));
    }
    if reversed {
        return None;
    }
    let c2 = tree.const_of(r)?;
    let Child::Node(m) = l else {
        return None;
    };
    let (inner, inner_rev) = plain_op(tree, m)?;
    if inner_rev {
        return None;
    }
    if (inner, op) != (Operator::Mul, Operator::Mul) {
        return None;
    }
    let [a, k1] = tree.nodes[m].children;
    let c1 = tree.const_of(k1)?;
    if !(exact_upscale(c1) && exact_upscale(c2)) {
        return None;
    }
    let kc = tree.push_leaf(Value::Const(c1 * c2));
    tree.nodes[n].children = [a, kc];
    Some(Child::Node(n))
}

/// A power of two of magnitude at least one: multiplying by it is exact
/// unless the product overflows, and overflow of `(a*c1)*c2` and
/// `a*(c1*c2)` coincides.
fn exact_upscale(c: f64) -> bool {
    const MANTISSA: u64 = (1 << 52) - 1;
    c.is_finite() && c.abs() >= 1.0 && c.to_bits() & MANTISSA == 0
}

fn subtree_size(tree: &ExpressionTree, c: Child) -> usize {
    let mut size = 0;
    tree.visit(c, &mut |_| size += 1);
    size
}

/// Position of every op/func unit in the evaluation order.
fn postfix_positions(tree: &ExpressionTree) -> HashMap<usize, usize> {
    let mut pos = HashMap::new();
    for (p, item) in tree.postfix().into_iter().enumerate() {
        match item {
            PostfixItem::Op(u) | PostfixItem::Func(u) | PostfixItem::Assign { op: u, .. } => {
                pos.insert(u, p);
            }
            PostfixItem::Value(_) => {}
        }
    }
    pos
}

/// Values whose reads cannot be shared: assignment targets, and temporaries
/// whose slot is stored more than once.
fn unstable_values(tree: &ExpressionTree) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    let mut stores: HashMap<u16, usize> = HashMap::new();
    tree.visit(tree.root(), &mut |c| {
        let Child::Node(n) = c else {
            return;
        };
        let unit = &tree.units[tree.nodes[n].op];
        if unit.operator() == Some(Operator::Assign) {
            if let Some(v) = tree.value_of(tree.nodes[n].children[0]) {
                out.push(v.clone());
            }
        }
        if let Some(t) = unit.store() {
            *stores.entry(t).or_default() += 1;
        }
    });
    out.extend(
        stores
            .into_iter()
            .filter(|&(_, k)| k > 1)
            .map(|(t, _)| Value::Temp(t)),
    );
    out
}

fn cse_eligible(tree: &ExpressionTree, n: usize, unstable: &[Value]) -> bool {
    let ok = match &tree.units[tree.nodes[n].op] {
        Unit::Op { op, store, .. } => {
            store.is_none() && !matches!(op, Operator::Separator | Operator::Assign)
        }
        Unit::Func { func, store } => store.is_none() && func.arity() > 0,
        Unit::Value(_) => false,
    };
    if !ok || tree.has_assign(Child::Node(n)) {
        return false;
    }
    let mut reads_unstable = false;
    tree.visit(Child::Node(n), &mut |c| {
        if let Some(v) = tree.value_of(c) {
            reads_unstable |= unstable.iter().any(|u| u.same(v));
        }
    });
    !reads_unstable
}

/// Replaces repeated subtrees by reads of a temporary stored by their first
/// evaluation. Each call eliminates the largest repeated subtree.
pub fn eliminate_common_subexpressions(tree: &mut ExpressionTree) -> bool {
    let unstable = unstable_values(tree);
    let state = foldhash::fast::FixedState::with_seed(0x5eed);
    let mut buckets: HashMap<u64, Vec<usize>> = HashMap::new();
    let mut parents: HashMap<usize, (usize, usize)> = HashMap::new();
    let mut stack = vec![ExpressionTree::ROOT];
    while let Some(p) = stack.pop() {
        for (slot, c) in tree.nodes[p].children.into_iter().enumerate() {
            if let Child::Node(n) = c {
                parents.insert(n, (p, slot));
                stack.push(n);
                if cse_eligible(tree, n, &unstable) {
                    let mut h = state.build_hasher();
                    tree.hash_subtree(c, &mut h);
                    buckets
                        .entry(std::hash::Hasher::finish(&h))
                        .or_default()
                        .push(n);
                }
            }
        }
    }

    let pos = postfix_positions(tree);
    let mut best: Option<(usize, Vec<usize>)> = None;
    for bucket in buckets.values().filter(|b| b.len() > 1) {
        let mut rest = bucket.clone();
        while let Some(first) = rest.pop() {
            let (same, other): (Vec<usize>, Vec<usize>) = rest
                .iter()
                .partition(|&&m| tree.subtree_eq(Child::Node(first), Child::Node(m)));
            rest = other;
            if same.is_empty() {
                continue;
            }
            let mut class = same;
            class.push(first);
            class.sort_by_key(|m| pos.get(&tree.nodes[*m].op).copied().unwrap_or(usize::MAX));
            let size = subtree_size(tree, Child::Node(first));
            let better = match &best {
                None => true,
                Some((bs, bc)) => {
                    size > *bs
                        || (size == *bs
                            && pos.get(&tree.nodes[class[0]].op)
                                < pos.get(&tree.nodes[bc[0]].op))
                }
            };
            if better {
                best = Some((size, class));
            }
        }
    }

    let Some((_, class)) = best else {
        return false;
    };
    let slot = tree.temp_slot_count() as u16;
    let first = class[0];
    let op_unit = tree.nodes[first].op;
    tree.units[op_unit].set_store(Some(slot));
    for &m in &class[1..] {
        if let Some(&(p, s)) = parents.get(&m) {
            let leaf = tree.push_leaf(Value::Temp(slot));
            tree.nodes[p].children[s] = leaf;
        }
    }
    debug!("cse: {} occurrences -> temp {}", class.len(), slot);
    true
}

fn collect_temps(tree: &ExpressionTree, c: Child, stores: &mut Vec<u16>, reads: &mut Vec<u16>) {
    tree.visit(c, &mut |x| match tree.unit_of(x) {
        Some(Unit::Value(Value::Temp(t))) => reads.push(*t),
        Some(u) => {
            if let Some(t) = u.store() {
                stores.push(t);
            }
        }
        None => {}
    });
}

/// Evaluates the deeper operand first for reversible operators, toggling the
/// reversed flag. Swaps that would move a temporary read ahead of its store,
/// let a store overwrite a slot before its last read, or reorder assignments
/// are skipped.
pub fn reorder_nodes(tree: &mut ExpressionTree) -> bool {
    run_rule(tree, reorder_node)
}

fn reorder_node(tree: &mut ExpressionTree, n: usize) -> Option<Child> {
    let Unit::Op {
        op,
        reversed,
        store,
    } = tree.units[tree.nodes[n].op]
    else {
        return None;
    };
    if !op.is_reversible() {
        return None;
    }
    let [l, r] = tree.nodes[n].children;
    let leaf_first = tree.value_of(l).is_some() && matches!(r, Child::Node(_));
    if !(leaf_first || tree.depth(l) < tree.depth(r)) {
        return None;
    }
    if tree.has_assign(l) || tree.has_assign(r) {
        return None;
    }
    let (mut l_stores, mut l_reads) = (Vec::new(), Vec::new());
    let (mut r_stores, mut r_reads) = (Vec::new(), Vec::new());
    collect_temps(tree, l, &mut l_stores, &mut l_reads);
    collect_temps(tree, r, &mut r_stores, &mut r_reads);
    // shared slots: the right side must not overwrite what the left still reads
    if l_stores.iter().any(|s| r_reads.contains(s))
        || r_stores.iter().any(|s| l_reads.contains(s))
    {
        return None;
    }
    tree.nodes[n].children = [r, l];
    tree.units[tree.nodes[n].op] = Unit::Op {
        op,
        reversed: !reversed,
        store,
    };
    Some(Child::Node(n))
}

/// One stored temporary value: where it is written, the units that read it
/// and the position of its last read.
struct LiveTemp {
    at: usize,
    unit: usize,
    reads: Vec<usize>,
    end: Option<usize>,
}

/// Renumbers temporaries so that slots are shared by temporaries whose live
/// ranges in evaluation order do not overlap. Stores never read are dropped.
///
/// A read belongs to the latest store of its slot before it, so a tree that
/// already shares slots packs to itself.
pub fn pack_temp_slots(tree: &mut ExpressionTree) -> bool {
    let mut lives: Vec<LiveTemp> = Vec::new();
    let mut current: HashMap<u16, usize> = HashMap::new();
    for (p, item) in tree.postfix().into_iter().enumerate() {
        match item {
            PostfixItem::Value(u) => {
                if let Unit::Value(Value::Temp(t)) = tree.units[u] {
                    if let Some(&k) = current.get(&t) {
                        lives[k].reads.push(u);
                        lives[k].end = Some(p);
                    }
                }
            }
            PostfixItem::Op(u) | PostfixItem::Func(u) => {
                if let Some(t) = tree.units[u].store() {
                    current.insert(t, lives.len());
                    lives.push(LiveTemp {
                        at: p,
                        unit: u,
                        reads: Vec::new(),
                        end: None,
                    });
                }
            }
            PostfixItem::Assign { .. } => {}
        }
    }

    let mut changed = false;
    let mut slot_free_after: Vec<usize> = Vec::new();
    for live in lives {
        let Some(end) = live.end else {
            tree.units[live.unit].set_store(None);
            changed = true;
            continue;
        };
        let slot = match slot_free_after.iter().position(|&e| e < live.at) {
            Some(s) => {
                slot_free_after[s] = end;
                s
            }
            None => {
                slot_free_after.push(end);
                slot_free_after.len() - 1
            }
        } as u16;
        changed |= tree.units[live.unit].store() != Some(slot);
        tree.units[live.unit].set_store(Some(slot));
        for u in live.reads {
            tree.units[u] = Unit::Value(Value::Temp(slot));
        }
    }
    if changed {
        debug!("temp slots packed into {}", slot_free_after.len());
    }
    changed
}
