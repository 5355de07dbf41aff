mod common;

use common::*;
use exprjit::bytecode::{self, Instr, Opcode};
use exprjit::{Arg, NativeFn, parse};

fn args(values: &[f64]) -> Vec<Arg<'static>> {
    values.iter().map(|&v| Arg::Double(v)).collect()
}

#[test]
fn loads_fuse_into_multiply_add() {
    init_logs();
    let tree = parse("z + x*y", &xyz_symbols()).unwrap();
    let plain = bytecode::compile(&tree, false, false).unwrap();
    let fused = bytecode::compile(&tree, true, false).unwrap();
    assert_eq!(plain.instructions().len(), 5);
    assert_eq!(
        fused.instructions(),
        [
            Instr::with(Opcode::Input, 2),
            Instr::with(Opcode::Input, 0),
            Instr::with(Opcode::IMulAdd, 1),
        ]
    );
    assert_eq!(fused.code().len(), 6);
    assert!(fused.disassemble().contains("muladd.in"));
    let a = args(&[2.0, 3.0, 4.0]);
    assert_eq!(plain.run(&a), 10.0);
    assert_eq!(fused.run(&a), 10.0);
}

#[test]
fn squares_use_the_square_opcode() {
    let tree = parse("x*x - y", &xyz_symbols()).unwrap();
    let fused = bytecode::compile(&tree, true, false).unwrap();
    let listing = fused.disassemble();
    assert!(listing.contains("sqr"), "{}", listing);
    assert_eq!(fused.run(&args(&[3.0, 1.0])), 8.0);
}

#[test]
fn fixed_width_encoding_uses_a_constant_stride() {
    let tree = parse("z + x*y - 2.5", &xyz_symbols()).unwrap();
    let packed = bytecode::compile(&tree, true, false).unwrap();
    let fixed = bytecode::compile(&tree, true, true).unwrap();
    assert!(fixed.is_fixed_width());
    assert_eq!(fixed.code().len(), 3 * fixed.instructions().len());
    assert!(packed.code().len() < fixed.code().len());
    assert_eq!(packed.instructions(), fixed.instructions());
    let a = args(&[2.0, 3.0, 4.0]);
    assert_eq!(packed.run(&a), fixed.run(&a));
}

#[test]
fn constants_are_pooled_once() {
    let tree = parse("x*2.5 + y*2.5 + 2.5", &xyz_symbols()).unwrap();
    let program = bytecode::compile(&tree, true, false).unwrap();
    assert_eq!(program.consts(), &[2.5]);
}

extern "C" fn mix(a: f64, b: f64, c: f64) -> f64 {
    a * 100.0 + b * 10.0 + c
}

#[test]
fn calls_take_arguments_in_order() {
    let mut symbols = xyz_symbols();
    symbols.define_func("mix", NativeFn::F3(mix));
    let tree = parse("1 + mix(x, y, x*y)", &symbols).unwrap();
    for fusion in [false, true] {
        let program = bytecode::compile(&tree, fusion, false).unwrap();
        assert_eq!(program.run(&args(&[1.0, 2.0])), 1.0 + 100.0 + 20.0 + 2.0);
        assert!(program.disassemble().contains("call"));
    }
}

#[test]
fn fused_programs_run_like_plain_ones() {
    let mut rng = rand::thread_rng();
    let symbols = xyz_symbols();
    for _ in 0..200 {
        let expr = random_expr(&mut rng, 5);
        let tree = parse(&expr, &symbols).unwrap();
        let plain = bytecode::compile(&tree, false, false).unwrap();
        let fused = bytecode::compile(&tree, true, false).unwrap();
        assert!(fused.instructions().len() <= plain.instructions().len());
        let a = args(&random_inputs(&mut rng));
        let (p, f) = (plain.run(&a), fused.run(&a));
        assert!(p.to_bits() == f.to_bits() || (p.is_nan() && f.is_nan()), "{}", expr);
    }
}
