//! Scalar semantics shared by constant folding and every backend.

use crate::symbol::FuncSymbol;
use crate::tree::Operator;

#[inline]
fn truth(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

/// Applies a binary operator to its logical operands.
#[inline]
pub fn binary(op: Operator, l: f64, r: f64) -> f64 {
    match op {
        Operator::Add => l + r,
        Operator::Sub => l - r,
        Operator::Mul => l * r,
        Operator::Div => l / r,
        Operator::Pow => l.powf(r),
        Operator::Gt => truth(l > r),
        Operator::Ge => truth(l >= r),
        Operator::Lt => truth(l < r),
        Operator::Le => truth(l <= r),
        Operator::Eq => truth(l == r),
        Operator::Ne => truth(l != r),
        Operator::Comma | Operator::Separator | Operator::Assign => r,
        Operator::Neg => -r,
        Operator::Plus => r,
    }
}

/// Applies `op` to operands in evaluation order, honouring the reversed flag.
#[inline]
pub fn binary_ordered(op: Operator, reversed: bool, first: f64, second: f64) -> f64 {
    if reversed {
        binary(op, second, first)
    } else {
        binary(op, first, second)
    }
}

#[inline]
pub fn unary(op: Operator, v: f64) -> f64 {
    match op {
        Operator::Neg => -v,
        _ => v,
    }
}

#[inline]
pub fn func_symbol(sym: FuncSymbol, v: f64) -> f64 {
    match sym {
        FuncSymbol::Exp => v.exp(),
        FuncSymbol::Ln => v.ln(),
        FuncSymbol::Sin => v.sin(),
        FuncSymbol::Cos => v.cos(),
        FuncSymbol::Tan => v.tan(),
        FuncSymbol::Cot => 1.0 / v.tan(),
        FuncSymbol::Sec => 1.0 / v.cos(),
        FuncSymbol::Csc => 1.0 / v.sin(),
        FuncSymbol::Sqrt => v.sqrt(),
    }
}

/// Conversion used when assigning to an `Int32` location. Matches the x87
/// default rounding mode.
#[inline]
pub fn to_int32(v: f64) -> i32 {
    v.round_ties_even() as i32
}

// Entry points called from native code.

pub(crate) extern "C" fn rt_pow(l: f64, r: f64) -> f64 {
    binary(Operator::Pow, l, r)
}
pub(crate) extern "C" fn rt_gt(l: f64, r: f64) -> f64 {
    binary(Operator::Gt, l, r)
}
pub(crate) extern "C" fn rt_ge(l: f64, r: f64) -> f64 {
    binary(Operator::Ge, l, r)
}
pub(crate) extern "C" fn rt_lt(l: f64, r: f64) -> f64 {
    binary(Operator::Lt, l, r)
}
pub(crate) extern "C" fn rt_le(l: f64, r: f64) -> f64 {
    binary(Operator::Le, l, r)
}
pub(crate) extern "C" fn rt_eq(l: f64, r: f64) -> f64 {
    binary(Operator::Eq, l, r)
}
pub(crate) extern "C" fn rt_ne(l: f64, r: f64) -> f64 {
    binary(Operator::Ne, l, r)
}
pub(crate) extern "C" fn rt_exp(v: f64) -> f64 {
    func_symbol(FuncSymbol::Exp, v)
}
pub(crate) extern "C" fn rt_ln(v: f64) -> f64 {
    func_symbol(FuncSymbol::Ln, v)
}
pub(crate) extern "C" fn rt_sin(v: f64) -> f64 {
    func_symbol(FuncSymbol::Sin, v)
}
pub(crate) extern "C" fn rt_cos(v: f64) -> f64 {
    func_symbol(FuncSymbol::Cos, v)
}
pub(crate) extern "C" fn rt_tan(v: f64) -> f64 {
    func_symbol(FuncSymbol::Tan, v)
}
pub(crate) extern "C" fn rt_cot(v: f64) -> f64 {
    func_symbol(FuncSymbol::Cot, v)
}
pub(crate) extern "C" fn rt_sec(v: f64) -> f64 {
    func_symbol(FuncSymbol::Sec, v)
}
pub(crate) extern "C" fn rt_csc(v: f64) -> f64 {
    func_symbol(FuncSymbol::Csc, v)
}

/// Address of the runtime helper implementing a binary operator, if any.
pub(crate) fn binary_helper(op: Operator) -> Option<usize> {
    let f: extern "C" fn(f64, f64) -> f64 = match op {
        Operator::Pow => rt_pow,
        Operator::Gt => rt_gt,
        Operator::Ge => rt_ge,
        Operator::Lt => rt_lt,
        Operator::Le => rt_le,
        Operator::Eq => rt_eq,
        Operator::Ne => rt_ne,
        _ => return None,
    };
    Some(f as usize)
}

/// Address of the runtime helper for a built-in function. `sqrt` has none:
/// it maps to a single instruction.
pub(crate) fn symbol_helper(sym: FuncSymbol) -> Option<usize> {
    let f: extern "C" fn(f64) -> f64 = match sym {
        FuncSymbol::Exp => rt_exp,
        FuncSymbol::Ln => rt_ln,
        FuncSymbol::Sin => rt_sin,
        FuncSymbol::Cos => rt_cos,
        FuncSymbol::Tan => rt_tan,
        FuncSymbol::Cot => rt_cot,
        FuncSymbol::Sec => rt_sec,
        FuncSymbol::Csc => rt_csc,
        FuncSymbol::Sqrt => return None,
    };
    Some(f as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reversed_swaps_operands() {
        assert_eq!(binary_ordered(Operator::Sub, false, 5.0, 2.0), 3.0);
        assert_eq!(binary_ordered(Operator::Sub, true, 5.0, 2.0), -3.0);
        assert_eq!(binary_ordered(Operator::Div, true, 2.0, 8.0), 4.0);
    }

    #[test]
    fn int32_rounding_is_ties_even() {
        assert_eq!(to_int32(2.5), 2);
        assert_eq!(to_int32(3.5), 4);
        assert_eq!(to_int32(-1.4), -1);
    }

    #[test]
    fn comparisons_yield_unit_values() {
        assert_eq!(binary(Operator::Ge, 1.0, 1.0), 1.0);
        assert_eq!(binary(Operator::Ne, 1.0, 1.0), 0.0);
    }
}
