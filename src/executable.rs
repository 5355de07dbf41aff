use log::trace;

use crate::arith;
use crate::bytecode::Program;
use crate::error::ExprError;
use crate::interp::Interpreter;
use crate::jit::NativeCode;
use crate::symbol::{ValueLayout, Variable};

/// One positional argument. Pointer layouts take a [`Variable`] reference.
#[derive(Clone, Copy, Debug)]
pub enum Arg<'a> {
    Int32(i32),
    Float(f32),
    Double(f64),
    Ref(&'a Variable),
}

impl Arg<'_> {
    pub fn value(&self) -> f64 {
        match *self {
            Arg::Int32(v) => v as f64,
            Arg::Float(v) => v as f64,
            Arg::Double(v) => v,
            Arg::Ref(var) => var.get(),
        }
    }

    /// Writes through a pointer argument. Value arguments ignore the write.
    pub fn assign(&self, v: f64) {
        if let Arg::Ref(var) = self {
            var.set(v);
        }
    }

    /// The 64-bit register image of this argument.
    pub(crate) fn raw_bits(&self) -> u64 {
        match *self {
            Arg::Int32(v) => v as i64 as u64,
            Arg::Float(v) => v.to_bits() as u64,
            Arg::Double(v) => v.to_bits(),
            Arg::Ref(var) => var.addr() as u64,
        }
    }

    fn fits(&self, layout: ValueLayout) -> bool {
        match (self, layout) {
            (Arg::Int32(_), ValueLayout::Int32)
            | (Arg::Float(_), ValueLayout::Float)
            | (Arg::Double(_), ValueLayout::Double) => true,
            (Arg::Ref(var), l) => l.is_pointer() && var.layout() == l.base(),
            _ => false,
        }
    }
}

impl From<f64> for Arg<'_> {
    fn from(v: f64) -> Self {
        Arg::Double(v)
    }
}

impl From<f32> for Arg<'_> {
    fn from(v: f32) -> Self {
        Arg::Float(v)
    }
}

impl From<i32> for Arg<'_> {
    fn from(v: i32) -> Self {
        Arg::Int32(v)
    }
}

impl<'a> From<&'a Variable> for Arg<'a> {
    fn from(v: &'a Variable) -> Self {
        Arg::Ref(v)
    }
}

/// Numeric result types of [`ExecutableCode::evaluate`].
pub trait Scalar: Copy {
    fn from_f64(v: f64) -> Self;
}

impl Scalar for f64 {
    fn from_f64(v: f64) -> Self {
        v
    }
}

impl Scalar for f32 {
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl Scalar for i32 {
    fn from_f64(v: f64) -> Self {
        arith::to_int32(v)
    }
}

/// The artifact of one backend.
#[derive(Debug, Default)]
pub enum Backing {
    #[default]
    Empty,
    Native(NativeCode),
    Bytecode(Program),
    Interpreter(Interpreter),
}

/// A compiled expression together with the input layouts it was compiled
/// for. Holds at most one backend artifact.
#[derive(Debug, Default)]
pub struct ExecutableCode {
    backing: Backing,
    layouts: Vec<ValueLayout>,
}

impl ExecutableCode {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn replace(&mut self, backing: Backing, layouts: Vec<ValueLayout>) {
        self.backing = backing;
        self.layouts = layouts;
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn layouts(&self) -> &[ValueLayout] {
        &self.layouts
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.backing, Backing::Empty)
    }

    /// Drops the artifact, releasing native code memory if there was any.
    pub fn clear(&mut self) {
        self.backing = Backing::Empty;
        self.layouts.clear();
    }

    /// Evaluates with one argument per declared input.
    pub fn evaluate<T: Scalar>(&self, args: &[Arg<'_>]) -> Result<T, ExprError> {
        if args.len() != self.layouts.len() {
            return Err(ExprError::InputsLen {
                expected: self.layouts.len(),
                got: args.len(),
            });
        }
        for (index, (arg, &expected)) in args.iter().zip(&self.layouts).enumerate() {
            if !arg.fits(expected) {
                return Err(ExprError::ArgLayout { index, expected });
            }
        }
        let v = match &self.backing {
            Backing::Empty => return Err(ExprError::Empty),
            Backing::Native(code) => code.invoke(args),
            Backing::Bytecode(program) => program.run(args),
            Backing::Interpreter(interp) => interp.eval(args),
        };
        trace!("evaluated to {}", v);
        Ok(T::from_f64(v))
    }

    /// Evaluates over a buffer of doubles, each converted to its input's
    /// value layout. Pointer inputs cannot be fed this way.
    pub fn evaluate_values<T: Scalar>(&self, values: &[f64]) -> Result<T, ExprError> {
        if values.len() != self.layouts.len() {
            return Err(ExprError::InputsLen {
                expected: self.layouts.len(),
                got: values.len(),
            });
        }
        let args = values
            .iter()
            .zip(&self.layouts)
            .enumerate()
            .map(|(index, (&v, &layout))| match layout {
                ValueLayout::Int32 => Ok(Arg::Int32(arith::to_int32(v))),
                ValueLayout::Float => Ok(Arg::Float(v as f32)),
                ValueLayout::Double => Ok(Arg::Double(v)),
                expected => Err(ExprError::ArgLayout {
                    index,
                    expected,
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.evaluate(&args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_code_refuses_to_run() {
        let code = ExecutableCode::new();
        assert!(code.is_empty());
        assert!(matches!(code.evaluate::<f64>(&[]), Err(ExprError::Empty)));
    }

    #[test]
    fn arguments_must_match_layouts() {
        let mut code = ExecutableCode::new();
        code.replace(
            Backing::Empty,
            vec![ValueLayout::Double, ValueLayout::FloatPtr],
        );
        let d = Variable::double(1.0);
        let f = Variable::float(1.0);
        let err = code.evaluate::<f64>(&[Arg::Double(1.0)]).unwrap_err();
        assert!(matches!(err, ExprError::InputsLen { expected: 2, got: 1 }));
        let err = code
            .evaluate::<f64>(&[Arg::Double(1.0), Arg::Ref(&d)])
            .unwrap_err();
        assert!(matches!(err, ExprError::ArgLayout { index: 1, .. }));
        let err = code
            .evaluate::<f64>(&[Arg::Float(1.0), Arg::Ref(&f)])
            .unwrap_err();
        assert!(matches!(err, ExprError::ArgLayout { index: 0, .. }));
        let err = code.evaluate_values::<f64>(&[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, ExprError::ArgLayout { index: 1, .. }));
    }

    #[test]
    fn value_buffers_check_their_length_first() {
        let mut code = ExecutableCode::new();
        code.replace(
            Backing::Empty,
            vec![ValueLayout::FloatPtr, ValueLayout::Double],
        );
        let err = code.evaluate_values::<f64>(&[1.0]).unwrap_err();
        assert!(matches!(err, ExprError::InputsLen { expected: 2, got: 1 }));
        let err = code.evaluate_values::<f64>(&[1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, ExprError::InputsLen { expected: 2, got: 3 }));
        let err = code.evaluate_values::<f64>(&[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, ExprError::ArgLayout { index: 0, .. }));
    }

    #[test]
    fn integer_results_round_half_to_even() {
        assert_eq!(i32::from_f64(2.5), 2);
        assert_eq!(i32::from_f64(3.5), 4);
        assert_eq!(i32::from_f64(-2.5), -2);
    }

    #[test]
    fn float_arguments_use_the_low_half() {
        assert_eq!(Arg::Float(1.0).raw_bits(), 0x3f80_0000);
        assert_eq!(Arg::Int32(-1).raw_bits(), u64::MAX);
    }
}
