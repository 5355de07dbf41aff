use log::debug;

use crate::bytecode;
use crate::diff;
use crate::error::ExprError;
use crate::executable::{Backing, ExecutableCode};
use crate::interp::Interpreter;
use crate::jit;
use crate::optimizer::{self, OptimizeReport};
use crate::parser;
use crate::symbol::{SymbolTable, ValueLayout};
use crate::tree::{ExpressionTree, PostfixItem, Unit, Value};

/// Code generator used by [`ExpressionCompiler`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Interpreter,
    Bytecode,
    Native,
}

impl Default for Backend {
    fn default() -> Self {
        if jit::SUPPORTED {
            Backend::Native
        } else {
            Backend::Bytecode
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompileOptions {
    pub backend: Backend,
    pub optimize: bool,
    pub cse: bool,
    pub fusion: bool,
    pub fixed_width: bool,
    /// Starting size of the native code buffer in bytes.
    pub initial_code_size: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            optimize: cfg!(feature = "optimize"),
            cse: true,
            fusion: true,
            fixed_width: false,
            initial_code_size: 64,
        }
    }
}

impl CompileOptions {
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_optimize(mut self, on: bool) -> Self {
        self.optimize = on;
        self
    }

    pub fn with_cse(mut self, on: bool) -> Self {
        self.cse = on;
        self
    }

    pub fn with_fusion(mut self, on: bool) -> Self {
        self.fusion = on;
        self
    }

    pub fn with_fixed_width(mut self, on: bool) -> Self {
        self.fixed_width = on;
        self
    }

    pub fn with_initial_code_size(mut self, bytes: usize) -> Self {
        self.initial_code_size = bytes;
        self
    }
}

/// Parses, optimizes and compiles expressions with one set of options.
#[derive(Clone, Debug, Default)]
pub struct ExpressionCompiler {
    options: CompileOptions,
    last_report: OptimizeReport,
}

impl ExpressionCompiler {
    pub fn new(options: CompileOptions) -> Self {
        Self {
            options,
            last_report: OptimizeReport::default(),
        }
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut CompileOptions {
        &mut self.options
    }

    /// What the optimizer changed during the last compile.
    pub fn last_report(&self) -> OptimizeReport {
        self.last_report
    }

    pub fn parse(&self, expr: &str, symbols: &SymbolTable) -> Result<ExpressionTree, ExprError> {
        parser::parse(expr, symbols)
    }

    /// Compiles `expr` into `code`. On error `code` keeps what it held.
    pub fn compile(
        &mut self,
        expr: &str,
        symbols: &SymbolTable,
        layouts: &[ValueLayout],
        code: &mut ExecutableCode,
    ) -> Result<(), ExprError> {
        let tree = self.parse(expr, symbols)?;
        self.compile_tree(tree, layouts, code)
    }

    /// Compiles an already built tree, such as a derivative.
    pub fn compile_tree(
        &mut self,
        mut tree: ExpressionTree,
        layouts: &[ValueLayout],
        code: &mut ExecutableCode,
    ) -> Result<(), ExprError> {
        check_inputs(&tree, layouts)?;
        if self.options.optimize {
            self.last_report = optimizer::optimize(&mut tree, self.options.cse);
            debug!("optimized: {} ({:?})", tree, self.last_report);
        } else {
            self.last_report = OptimizeReport::default();
        }
        let backing = match self.options.backend {
            Backend::Interpreter => Backing::Interpreter(Interpreter::new(tree)),
            Backend::Bytecode => Backing::Bytecode(bytecode::compile(
                &tree,
                self.options.fusion,
                self.options.fixed_width,
            )?),
            Backend::Native => Backing::Native(jit::compile(
                &tree,
                layouts,
                self.options.initial_code_size,
            )?),
        };
        code.replace(backing, layouts.to_vec());
        Ok(())
    }

    /// Derivative of `tree` with respect to positional input `input`.
    pub fn differentiate(
        &self,
        tree: &ExpressionTree,
        input: u16,
    ) -> Result<ExpressionTree, ExprError> {
        let d = diff::differentiate(tree, input)?;
        debug!("d/d#{}: {}", input, d);
        Ok(d)
    }
}

/// Every input read needs a declared layout, and inputs written by an
/// assignment need a pointer layout.
fn check_inputs(tree: &ExpressionTree, layouts: &[ValueLayout]) -> Result<(), ExprError> {
    let layout_of = |i: u16| {
        layouts.get(i as usize).copied().ok_or_else(|| {
            ExprError::CodeGen(format!(
                "input #{} is used but only {} layouts were given",
                i,
                layouts.len()
            ))
        })
    };
    for item in tree.postfix() {
        let (PostfixItem::Value(u) | PostfixItem::Assign { target: u, .. }) = item else {
            continue;
        };
        let Unit::Value(Value::Input(i)) = tree.units[u] else {
            continue;
        };
        let layout = layout_of(i)?;
        if matches!(item, PostfixItem::Assign { .. }) && !layout.is_pointer() {
            return Err(ExprError::CodeGen(format!(
                "cannot assign to input #{} of value layout {:?}",
                i, layout
            )));
        }
    }
    Ok(())
}
