use log::debug;

use crate::error::{ExprError, ParseErrorKind};
use crate::lexer::{Lexer, Token};
use crate::symbol::SymbolTable;
use crate::tree::{Child, ExpressionTree, FUNC_PRECEDENCE, Operator, Unit, Value};

/// Parses `expr` against `symbols` into a validated expression tree.
pub fn parse(expr: &str, symbols: &SymbolTable) -> Result<ExpressionTree, ExprError> {
    let tokens = Lexer::new(expr, symbols).tokenize()?;
    let parser = Parser::new(tokens)?;
    let tree = parser.build()?;
    debug!("parsed '{}' -> {}", expr, tree);
    Ok(tree)
}

/// Operator-precedence tree builder over a token span.
pub(crate) struct Parser {
    tokens: Vec<Token>,
    /// For each `(`, the index of its matching `)`.
    matching: Vec<usize>,
    tree: ExpressionTree,
}

enum Split {
    Op(usize, Operator),
    Func(usize),
}

impl Parser {
    pub(crate) fn new(tokens: Vec<Token>) -> Result<Self, ExprError> {
        let mut matching = vec![usize::MAX; tokens.len()];
        let mut open = Vec::new();
        for (i, t) in tokens.iter().enumerate() {
            match t {
                Token::LParen => open.push(i),
                Token::RParen => {
                    let o = open.pop().ok_or_else(|| {
                        ExprError::parse(
                            ParseErrorKind::UnmatchedBracket,
                            format!("')' at token {} has no matching '('", i),
                        )
                    })?;
                    matching[o] = i;
                }
                _ => {}
            }
        }
        if let Some(o) = open.pop() {
            return Err(ExprError::parse(
                ParseErrorKind::UnmatchedBracket,
                format!("'(' at token {} is never closed", o),
            ));
        }
        Ok(Self {
            tokens,
            matching,
            tree: ExpressionTree::new(),
        })
    }

    pub(crate) fn build(mut self) -> Result<ExpressionTree, ExprError> {
        let root = self.build_span(0, self.tokens.len(), false)?;
        if root.is_none() {
            return Err(ExprError::parse(ParseErrorKind::Format, "empty expression"));
        }
        self.tree.set_root(root);
        Ok(self.tree)
    }

    /// Finds the operator to split `[start, end)` at, skipping bracket groups.
    fn find_split(&self, start: usize, end: usize) -> Option<Split> {
        let mut best: Option<(u8, Split)> = None;
        let mut i = start;
        while i < end {
            let cand = match &self.tokens[i] {
                Token::LParen => {
                    i = self.matching[i] + 1;
                    continue;
                }
                Token::Op(op) => Some((op.precedence(), Split::Op(i, *op))),
                Token::Func { .. } => Some((FUNC_PRECEDENCE, Split::Func(i))),
                _ => None,
            };
            if let Some((prec, split)) = cand {
                let replace = match &best {
                    None => true,
                    Some((bp, _)) => {
                        let lr = matches!(split, Split::Op(_, op) if op.is_assoc_lr());
                        prec < *bp || (prec == *bp && !lr)
                    }
                };
                if replace {
                    best = Some((prec, split));
                }
            }
            i += 1;
        }
        best.map(|(_, s)| s)
    }

    fn build_span(&mut self, start: usize, end: usize, in_args: bool) -> Result<Child, ExprError> {
        if start >= end {
            return Ok(Child::None);
        }
        match self.find_split(start, end) {
            None => self.build_atom(start, end),
            Some(Split::Func(i)) => self.build_func(i, start, end),
            Some(Split::Op(i, op)) => self.build_op(i, op, start, end, in_args),
        }
    }

    fn build_atom(&mut self, start: usize, end: usize) -> Result<Child, ExprError> {
        if matches!(self.tokens[start], Token::LParen) && self.matching[start] == end - 1 {
            if end - start == 2 {
                return Err(ExprError::parse(
                    ParseErrorKind::Format,
                    format!("empty brackets at token {}", start),
                ));
            }
            return self.build_span(start + 1, end - 1, false);
        }
        if end - start == 1 {
            if let Token::Value(v) = &self.tokens[start] {
                let v = v.clone();
                return Ok(self.tree.push_leaf(v));
            }
        }
        Err(ExprError::parse(
            ParseErrorKind::Format,
            format!("expected a single operand between tokens {} and {}", start, end),
        ))
    }

    fn build_func(&mut self, i: usize, start: usize, end: usize) -> Result<Child, ExprError> {
        let (func, name) = match &self.tokens[i] {
            Token::Func { func, name } => (*func, name.clone()),
            _ => unreachable!("split index is a function token"),
        };
        let well_formed = i == start
            && matches!(self.tokens.get(i + 1), Some(Token::LParen))
            && self.matching[i + 1] == end - 1;
        if !well_formed {
            return Err(ExprError::parse(
                ParseErrorKind::Format,
                format!("function '{}' must be called as {}(...)", name, name),
            ));
        }
        let args = self.build_span(i + 2, end - 1, true)?;
        let node = self.tree.push_node(Unit::func(func), args, Child::None);
        let Child::Node(n) = node else {
            unreachable!("push_node returns a node");
        };
        let got = self.tree.func_args(n).len();
        if got != func.arity() {
            return Err(ExprError::parse(
                ParseErrorKind::ArityMismatch,
                format!(
                    "function '{}' takes {} argument(s), got {}",
                    name,
                    func.arity(),
                    got
                ),
            ));
        }
        Ok(node)
    }

    fn build_op(
        &mut self,
        i: usize,
        op: Operator,
        start: usize,
        end: usize,
        in_args: bool,
    ) -> Result<Child, ExprError> {
        let missing = |side: &str| {
            ExprError::parse(
                ParseErrorKind::MissingOperand,
                format!("operator '{}' has no {} operand", op.symbol(), side),
            )
        };
        if op.is_unary() {
            if i != start {
                return Err(ExprError::parse(
                    ParseErrorKind::Format,
                    format!("unary '{}' follows an operand", op.symbol()),
                ));
            }
            let r = self.build_span(i + 1, end, in_args)?;
            if r.is_none() {
                return Err(missing("right"));
            }
            return Ok(self.tree.push_node(Unit::op(op), Child::None, r));
        }

        let op = if op == Operator::Comma && in_args {
            Operator::Separator
        } else {
            op
        };
        let l = self.build_span(start, i, in_args)?;
        let r = self.build_span(i + 1, end, in_args)?;
        if l.is_none() {
            return Err(missing("left"));
        }
        if r.is_none() {
            return Err(missing("right"));
        }
        if op == Operator::Assign
            && !matches!(
                self.tree.value_of(l),
                Some(Value::Var(_) | Value::Input(_))
            )
        {
            return Err(ExprError::parse(
                ParseErrorKind::InvalidAssignTarget,
                "left side of '=' is not a variable or input",
            ));
        }
        Ok(self.tree.push_node(Unit::op(op), l, r))
    }
}
