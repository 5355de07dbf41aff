#![allow(dead_code)]

use exprjit::{
    Arg, Backend, CompileOptions, ExecutableCode, ExpressionCompiler, SymbolTable, ValueLayout,
    jit,
};
use rand::Rng;

pub const XYZ: [ValueLayout; 3] = [ValueLayout::Double; 3];

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn xyz_symbols() -> SymbolTable {
    let mut s = SymbolTable::new();
    s.define_input("x", 0).define_input("y", 1).define_input("z", 2);
    s
}

/// Backends that can run here.
pub fn backends() -> Vec<Backend> {
    let mut v = vec![Backend::Interpreter, Backend::Bytecode];
    if jit::SUPPORTED {
        v.push(Backend::Native);
    }
    v
}

pub fn compile_with(
    options: CompileOptions,
    expr: &str,
    symbols: &SymbolTable,
    layouts: &[ValueLayout],
) -> ExecutableCode {
    let mut compiler = ExpressionCompiler::new(options);
    let mut code = ExecutableCode::new();
    compiler
        .compile(expr, symbols, layouts, &mut code)
        .unwrap_or_else(|e| panic!("compiling {:?} with {:?}: {}", expr, options.backend, e));
    code
}

pub fn compile_on(
    backend: Backend,
    expr: &str,
    symbols: &SymbolTable,
    layouts: &[ValueLayout],
) -> ExecutableCode {
    compile_with(
        CompileOptions::default().with_backend(backend),
        expr,
        symbols,
        layouts,
    )
}

pub fn eval(code: &ExecutableCode, values: &[f64]) -> f64 {
    let args: Vec<Arg> = values.iter().map(|&v| Arg::Double(v)).collect();
    code.evaluate::<f64>(&args).unwrap()
}

/// Equal within a relative tolerance, or the same non-finite class.
pub fn close(a: f64, b: f64, tol: f64) -> bool {
    if a.is_nan() || b.is_nan() {
        return a.is_nan() && b.is_nan();
    }
    if a.is_infinite() || b.is_infinite() {
        return a == b;
    }
    (a - b).abs() <= tol * (1.0 + a.abs().max(b.abs()))
}

/// Random infix expression over `x`, `y`, `z`.
pub fn random_expr<R: Rng>(rng: &mut R, depth: u32) -> String {
    if depth == 0 || rng.gen_range(0..4) == 0 {
        return match rng.gen_range(0..5) {
            0 => "x".into(),
            1 => "y".into(),
            2 => "z".into(),
            3 => format!("{:.1}", rng.gen_range(0.0..4.0)),
            _ => format!("(-{:.1})", rng.gen_range(0.1..4.0)),
        };
    }
    let a = random_expr(rng, depth - 1);
    match rng.gen_range(0..12) {
        0..=2 => format!("({} + {})", a, random_expr(rng, depth - 1)),
        3..=4 => format!("({} - {})", a, random_expr(rng, depth - 1)),
        5..=7 => format!("({} * {})", a, random_expr(rng, depth - 1)),
        8 => format!("({} / {})", a, random_expr(rng, depth - 1)),
        9 => format!("-{}", a),
        10 => {
            let f = ["sin", "cos", "sqrt", "exp"][rng.gen_range(0..4)];
            format!("{}({})", f, a)
        }
        _ => format!("({}^2)", a),
    }
}

/// Random expression over `x`, `y`, `z` and the variable `v` with at least
/// one assignment to `v`. A term reading `v` appears on both sides of the
/// assignment so that common subexpressions straddle it.
pub fn random_stateful_expr<R: Rng>(rng: &mut R, depth: u32) -> String {
    let shared = format!("(v*{} + 1)", random_expr(rng, depth));
    let mut terms = vec![shared.clone()];
    for _ in 0..rng.gen_range(1..4) {
        let t = random_expr(rng, depth);
        terms.push(match rng.gen_range(0..4) {
            0 => format!("(v = {})", t),
            1 => format!("(v - {})", t),
            2 => shared.clone(),
            _ => t,
        });
    }
    let at = rng.gen_range(1..=terms.len());
    terms.insert(at, format!("(v = {})", random_expr(rng, depth)));
    terms.push(shared);
    let mut expr = terms[0].clone();
    for t in &terms[1..] {
        let op = ["+", "-", "*"][rng.gen_range(0..3)];
        expr = format!("{} {} {}", expr, op, t);
    }
    expr
}

pub fn random_inputs<R: Rng>(rng: &mut R) -> [f64; 3] {
    [
        rng.gen_range(-2.0..2.0),
        rng.gen_range(-2.0..2.0),
        rng.gen_range(0.1..2.0),
    ]
}
