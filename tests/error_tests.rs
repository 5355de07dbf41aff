mod common;

use common::*;
use exprjit::{
    Arg, Backend, CompileOptions, ExecutableCode, ExprError, ExpressionCompiler, ParseErrorKind,
    ValueLayout, jit,
};

fn parse_kind(expr: &str) -> ParseErrorKind {
    let compiler = ExpressionCompiler::default();
    match compiler.parse(expr, &xyz_symbols()) {
        Ok(tree) => panic!("{:?} parsed as {}", expr, tree),
        Err(e) => e
            .parse_kind()
            .unwrap_or_else(|| panic!("{:?}: not a parse error: {}", expr, e)),
    }
}

#[test]
fn each_parse_failure_has_its_own_kind() {
    assert_eq!(parse_kind("(x+1"), ParseErrorKind::UnmatchedBracket);
    assert_eq!(parse_kind("x+1)"), ParseErrorKind::UnmatchedBracket);
    assert_eq!(parse_kind("x+"), ParseErrorKind::MissingOperand);
    assert_eq!(parse_kind("*y"), ParseErrorKind::MissingOperand);
    assert_eq!(parse_kind("2 = x"), ParseErrorKind::InvalidAssignTarget);
    assert_eq!(parse_kind("(x+y) = 1"), ParseErrorKind::InvalidAssignTarget);
    assert_eq!(parse_kind("sin(x, y)"), ParseErrorKind::ArityMismatch);
    assert_eq!(parse_kind("foo + 1"), ParseErrorKind::UndefinedSymbol);
    assert_eq!(parse_kind("x # 2"), ParseErrorKind::UnknownToken);
    assert_eq!(parse_kind(""), ParseErrorKind::Format);
}

#[test]
fn parse_errors_carry_a_message() {
    let err = ExpressionCompiler::default()
        .parse("foo + 1", &xyz_symbols())
        .unwrap_err();
    assert!(err.to_string().contains("foo"), "{}", err);
}

#[test]
fn wrong_argument_count_on_evaluate() {
    let code = compile_on(Backend::Bytecode, "x + y + z", &xyz_symbols(), &XYZ);
    let err = code
        .evaluate::<f64>(&[Arg::Double(1.0), Arg::Double(2.0)])
        .unwrap_err();
    match err {
        ExprError::InputsLen { expected, got } => {
            assert_eq!(expected, 3);
            assert_eq!(got, 2);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn wrong_argument_layout_on_evaluate() {
    let layouts = [ValueLayout::Double, ValueLayout::Int32];
    let code = compile_on(Backend::Interpreter, "x + y", &xyz_symbols(), &layouts);
    let err = code
        .evaluate::<f64>(&[Arg::Double(1.0), Arg::Double(2.0)])
        .unwrap_err();
    match err {
        ExprError::ArgLayout { index, expected } => {
            assert_eq!(index, 1);
            assert_eq!(expected, ValueLayout::Int32);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn cleared_code_is_empty() {
    let mut code = compile_on(Backend::Bytecode, "x", &xyz_symbols(), &XYZ[..1]);
    assert!(!code.is_empty());
    code.clear();
    assert!(matches!(
        code.evaluate::<f64>(&[]),
        Err(ExprError::Empty)
    ));
}

#[test]
fn failed_compile_keeps_the_previous_code() {
    let symbols = xyz_symbols();
    for b in backends() {
        let mut compiler = ExpressionCompiler::new(CompileOptions::default().with_backend(b));
        let mut code = ExecutableCode::new();
        compiler
            .compile("x + 1", &symbols, &XYZ[..1], &mut code)
            .unwrap();
        assert!(compiler.compile("x +", &symbols, &XYZ[..1], &mut code).is_err());
        assert!(compiler
            .compile("x + w", &symbols, &XYZ[..1], &mut code)
            .is_err());
        // y has no layout
        assert!(compiler.compile("x + y", &symbols, &XYZ[..1], &mut code).is_err());
        assert_eq!(eval(&code, &[4.0]), 5.0, "{:?}", b);
        assert_eq!(code.layouts(), &XYZ[..1]);
    }
}

#[test]
fn native_backend_reports_unsupported_hosts() {
    if jit::SUPPORTED {
        return;
    }
    let mut compiler =
        ExpressionCompiler::new(CompileOptions::default().with_backend(Backend::Native));
    let mut code = ExecutableCode::new();
    let err = compiler
        .compile("1", &xyz_symbols(), &[], &mut code)
        .unwrap_err();
    assert!(matches!(err, ExprError::Unsupported(_)));
}

#[test]
fn too_many_native_inputs() {
    if !jit::SUPPORTED {
        return;
    }
    let mut symbols = xyz_symbols();
    let layouts = vec![ValueLayout::Double; 17];
    let mut expr = String::from("0");
    for i in 0..17u16 {
        let name = format!("a{}", i);
        symbols.define_input(&name, i);
        expr.push_str(&format!("+{}", name));
    }
    let mut compiler =
        ExpressionCompiler::new(CompileOptions::default().with_backend(Backend::Native));
    let mut code = ExecutableCode::new();
    let err = compiler
        .compile(&expr, &symbols, &layouts, &mut code)
        .unwrap_err();
    assert!(matches!(err, ExprError::CodeGen(_)), "{:?}", err);
}
