//! Compiles algebraic expressions over named constants, variables, positional
//! inputs and native callbacks, and evaluates them through an interpreter, a
//! fused bytecode VM or native x86-64 code. Expressions can be differentiated
//! symbolically with respect to any input.
//!
//! ```no_run
//! use exprjit::{Arg, ExecutableCode, ExpressionCompiler, SymbolTable, ValueLayout};
//!
//! let mut symbols = SymbolTable::new();
//! symbols.define_input("x", 0);
//! let mut compiler = ExpressionCompiler::default();
//! let mut code = ExecutableCode::new();
//! compiler.compile("x*x+1", &symbols, &[ValueLayout::Double], &mut code)?;
//! assert_eq!(code.evaluate::<f64>(&[Arg::Double(3.0)])?, 10.0);
//! # Ok::<(), exprjit::ExprError>(())
//! ```

mod arith;
pub mod bytecode;
mod diff;
mod engine;
mod error;
mod executable;
mod interp;
pub mod jit;
mod lexer;
pub mod optimizer;
mod parser;
mod symbol;
pub mod tree;

pub use diff::differentiate;
pub use engine::{Backend, CompileOptions, ExpressionCompiler};
pub use error::{ExprError, ParseErrorKind};
pub use executable::{Arg, Backing, ExecutableCode, Scalar};
pub use interp::{Interpreter, eval_tree};
pub use parser::parse;
pub use symbol::{
    Fn0, Fn1, Fn2, Fn3, Fn4, Fn5, FuncSymbol, NativeFn, SymbolEntry, SymbolTable, ValueLayout,
    Variable,
};
pub use tree::ExpressionTree;
