mod common;

use common::*;
use exprjit::{Arg, Backend, CompileOptions, SymbolTable, ValueLayout, Variable};
use rand::Rng;

#[test]
fn variables_are_read_at_evaluation_time() {
    let v = Variable::double(1.0);
    let mut symbols = xyz_symbols();
    symbols.define_var("v", &v);
    for b in backends() {
        let code = compile_on(b, "v*x", &symbols, &XYZ[..1]);
        assert_eq!(eval(&code, &[3.0]), 3.0);
        v.set(4.0);
        assert_eq!(eval(&code, &[3.0]), 12.0, "{:?}", b);
        v.set(1.0);
    }
}

#[test]
fn assignment_writes_the_variable_and_yields_the_value() {
    for b in backends() {
        let v = Variable::double(0.0);
        let mut symbols = xyz_symbols();
        symbols.define_var("v", &v);
        let code = compile_on(b, "v = x*2", &symbols, &XYZ[..1]);
        assert_eq!(eval(&code, &[3.0]), 6.0);
        assert_eq!(v.get(), 6.0, "{:?}", b);
        // right side first, then the write
        let code = compile_on(b, "v = v + 1, v*10", &symbols, &XYZ[..1]);
        assert_eq!(eval(&code, &[0.0]), 70.0, "{:?}", b);
        assert_eq!(v.get(), 7.0);
    }
}

#[test]
fn int32_variables_round_half_to_even() {
    for b in backends() {
        let i = Variable::int32(0);
        let mut symbols = xyz_symbols();
        symbols.define_var("i", &i);
        let code = compile_on(b, "i = x", &symbols, &XYZ[..1]);
        for (x, want) in [(2.5, 2.0), (3.5, 4.0), (-2.5, -2.0), (1.25, 1.0)] {
            eval(&code, &[x]);
            assert_eq!(i.get(), want, "{} on {:?}", x, b);
        }
        assert_eq!(i.layout(), ValueLayout::Int32);
    }
}

#[test]
fn float_variables_store_single_precision() {
    for b in backends() {
        let f = Variable::float(0.0);
        let mut symbols = xyz_symbols();
        symbols.define_var("f", &f);
        let code = compile_on(b, "f = x/3", &symbols, &XYZ[..1]);
        eval(&code, &[1.0]);
        assert_eq!(f.get(), (1.0f64 / 3.0) as f32 as f64, "{:?}", b);
        let code = compile_on(b, "f*3", &symbols, &XYZ[..1]);
        assert!(close(eval(&code, &[0.0]), 1.0, 1e-7));
    }
}

#[test]
fn pointer_inputs_are_read_and_written() {
    let mut symbols = SymbolTable::new();
    symbols.define_input("p", 0).define_input("x", 1);
    let layouts = [ValueLayout::DoublePtr, ValueLayout::Double];
    for b in backends() {
        let cell = Variable::double(1.5);
        let code = compile_on(b, "p = p + x", &symbols, &layouts);
        let v = code
            .evaluate::<f64>(&[Arg::Ref(&cell), Arg::Double(2.0)])
            .unwrap();
        assert_eq!(v, 3.5);
        assert_eq!(cell.get(), 3.5, "{:?}", b);
        let other = Variable::double(-1.0);
        code.evaluate::<f64>(&[Arg::Ref(&other), Arg::Double(2.0)])
            .unwrap();
        assert_eq!(other.get(), 1.0);
        assert_eq!(cell.get(), 3.5);
    }
}

#[test]
fn narrow_pointer_inputs() {
    let mut symbols = SymbolTable::new();
    symbols.define_input("n", 0).define_input("f", 1);
    let layouts = [ValueLayout::Int32Ptr, ValueLayout::FloatPtr];
    for b in backends() {
        let n = Variable::int32(3);
        let f = Variable::float(0.5);
        let code = compile_on(b, "n = n*f + 2*f", &symbols, &layouts);
        let v = code
            .evaluate::<f64>(&[Arg::Ref(&n), Arg::Ref(&f)])
            .unwrap();
        assert_eq!(v, 2.5);
        assert_eq!(n.get(), 2.0, "{:?}", b);
    }
}

#[test]
fn chained_assignment_is_right_associative() {
    for b in backends() {
        let u = Variable::double(0.0);
        let w = Variable::double(0.0);
        let mut symbols = xyz_symbols();
        symbols.define_var("u", &u).define_var("w", &w);
        let code = compile_on(b, "u = w = x + 1", &symbols, &XYZ[..1]);
        assert_eq!(eval(&code, &[4.0]), 5.0);
        assert_eq!((u.get(), w.get()), (5.0, 5.0), "{:?}", b);
    }
}

#[test]
fn assignment_sees_values_read_before_it() {
    // the first term must see v before the assignment overwrites it
    for b in backends() {
        let v = Variable::double(2.0);
        let mut symbols = xyz_symbols();
        symbols.define_var("v", &v);
        let code = compile_on(b, "v*x + (v = 10)", &symbols, &XYZ[..1]);
        assert_eq!(eval(&code, &[3.0]), 16.0, "{:?}", b);
        assert_eq!(v.get(), 10.0);
    }
}

#[test]
fn variables_outlive_their_symbol_table() {
    for b in backends() {
        let v = Variable::double(2.0);
        let code = {
            let mut symbols = xyz_symbols();
            symbols.define_var("v", &v);
            compile_on(b, "v + x", &symbols, &XYZ[..1])
        };
        drop(v);
        assert_eq!(eval(&code, &[1.0]), 3.0, "{:?}", b);
    }
}

/// `v + (x*2 + (x*3 + ... (v = x+1)))` with `levels` pending products.
fn nested_assignment(levels: usize) -> String {
    let mut s = String::from("(v = x+1)");
    for k in (2..levels + 2).rev() {
        s = format!("x*{} + ({})", k, s);
    }
    format!("v + ({})", s)
}

#[test]
fn assignment_under_full_register_stack() {
    let v = Variable::double(1.0);
    let mut symbols = xyz_symbols();
    symbols.define_var("v", &v);
    for levels in 4..12 {
        let expr = nested_assignment(levels);
        let products: f64 = (2..levels + 2).map(|k| k as f64).sum();
        for b in backends() {
            for optimize in [false, true] {
                let options = CompileOptions::default()
                    .with_backend(b)
                    .with_optimize(optimize);
                let code = compile_with(options, &expr, &symbols, &XYZ[..1]);
                v.set(1.0);
                let got = eval(&code, &[1.0]);
                assert_eq!(v.get(), 2.0, "{} on {:?}", expr, b);
                assert_eq!(got, 1.0 + products + 2.0, "{} on {:?}", expr, b);
            }
        }
    }
}

#[test]
fn random_assignments_agree_across_backends_and_cse() {
    init_logs();
    let v = Variable::double(0.0);
    let mut symbols = xyz_symbols();
    symbols.define_var("v", &v);
    let mut rng = rand::thread_rng();
    for _ in 0..150 {
        let expr = random_stateful_expr(&mut rng, 2);
        let input = random_inputs(&mut rng);
        let start = rng.gen_range(-2.0..2.0);
        let mut runs = Vec::new();
        for cse in [false, true] {
            for b in backends() {
                let options = CompileOptions::default().with_backend(b).with_cse(cse);
                let code = compile_with(options, &expr, &symbols, &XYZ);
                v.set(start);
                let got = eval(&code, &input);
                runs.push((b, cse, got, v.get()));
            }
        }
        let (reference, _, want, want_v) = runs[0];
        assert_eq!(reference, Backend::Interpreter);
        for (b, cse, got, got_v) in &runs[1..] {
            assert!(
                close(*got, want, 1e-6) && close(*got_v, want_v, 1e-6),
                "{} at {:?}, v={}: {:?} cse={} gave ({}, {}), expected ({}, {})",
                expr,
                input,
                start,
                b,
                cse,
                got,
                got_v,
                want,
                want_v
            );
        }
    }
}
