//! Native x86-64 backend.
//!
//! [`select`] decides the FPU operations independent of encoding; `emit`
//! turns them into machine code with the encoder in `asm`, resolving
//! constant references through `label` and placing the result in memory
//! owned by `memory`.

pub mod asm;
mod emit;
pub mod label;
pub mod memory;
pub mod select;

use log::debug;

use crate::error::ExprError;
use crate::executable::Arg;
use crate::symbol::{ValueLayout, Variable};
use crate::tree::ExpressionTree;
use memory::ExecBuffer;

pub use select::{FpuOp, Selection, select};

/// True when generated code can run on this host.
pub const SUPPORTED: bool = cfg!(all(target_arch = "x86_64", unix));

const INT_REGS: usize = 6;
const XMM_REGS: usize = 8;
const STACK_SLOTS: usize = 8;

/// Where a positional input arrives under the System V convention.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ArgSlot {
    Int(usize),
    Xmm(usize),
    Stack(usize),
}

/// Argument placement for a fixed list of input layouts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ArgPlan {
    pub(crate) slots: Vec<ArgSlot>,
}

impl ArgPlan {
    pub(crate) fn new(layouts: &[ValueLayout]) -> Result<Self, ExprError> {
        let (mut ints, mut xmms, mut stack) = (0, 0, 0);
        let mut slots = Vec::with_capacity(layouts.len());
        for layout in layouts {
            let slot = if layout.is_float_class() && xmms < XMM_REGS {
                xmms += 1;
                ArgSlot::Xmm(xmms - 1)
            } else if !layout.is_float_class() && ints < INT_REGS {
                ints += 1;
                ArgSlot::Int(ints - 1)
            } else if stack < STACK_SLOTS {
                stack += 1;
                ArgSlot::Stack(stack - 1)
            } else {
                return Err(ExprError::CodeGen(format!(
                    "{} inputs do not fit the native calling convention",
                    layouts.len()
                )));
            };
            slots.push(slot);
        }
        Ok(Self { slots })
    }
}

type Entry = unsafe extern "C" fn(
    i64, i64, i64, i64, i64, i64,
    f64, f64, f64, f64, f64, f64, f64, f64,
    u64, u64, u64, u64, u64, u64, u64, u64,
) -> f64;

/// A compiled native function together with everything its code refers to.
#[derive(Debug)]
pub struct NativeCode {
    buf: ExecBuffer,
    plan: ArgPlan,
    /// Variables whose addresses are embedded in the code.
    _vars: Vec<Variable>,
}

impl NativeCode {
    pub fn code(&self) -> &[u8] {
        self.buf.bytes()
    }

    /// Calls the generated function. `args` must already match the layouts
    /// the code was compiled for.
    pub(crate) fn invoke(&self, args: &[Arg<'_>]) -> f64 {
        let mut ints = [0i64; INT_REGS];
        let mut xmms = [0f64; XMM_REGS];
        let mut stack = [0u64; STACK_SLOTS];
        for (slot, arg) in self.plan.slots.iter().zip(args) {
            let bits = arg.raw_bits();
            match *slot {
                ArgSlot::Int(k) => ints[k] = bits as i64,
                ArgSlot::Xmm(k) => xmms[k] = f64::from_bits(bits),
                ArgSlot::Stack(j) => stack[j] = bits,
            }
        }
        // SAFETY: the buffer holds a complete function with the `Entry`
        // signature, and it stays mapped for as long as `self` lives.
        unsafe {
            let f = std::mem::transmute::<*const u8, Entry>(self.buf.as_ptr());
            f(
                ints[0], ints[1], ints[2], ints[3], ints[4], ints[5],
                xmms[0], xmms[1], xmms[2], xmms[3], xmms[4], xmms[5], xmms[6], xmms[7],
                stack[0], stack[1], stack[2], stack[3], stack[4], stack[5], stack[6], stack[7],
            )
        }
    }
}

/// Compiles `tree` to native code for inputs of the given layouts.
pub fn compile(
    tree: &ExpressionTree,
    layouts: &[ValueLayout],
    initial_code_size: usize,
) -> Result<NativeCode, ExprError> {
    if !SUPPORTED {
        return Err(ExprError::Unsupported(
            "native code generation needs x86-64 System V".into(),
        ));
    }
    let plan = ArgPlan::new(layouts)?;
    let sel = select(tree, layouts)?;
    debug!(
        "native selection: {} ops, {} spill slots, {} registers at most",
        sel.ops.len(),
        sel.spill_slots,
        sel.max_regs
    );
    let buf = emit::lower(&sel, layouts, &plan, initial_code_size)?;
    Ok(NativeCode {
        buf,
        plan,
        _vars: sel.vars,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_follow_register_classes() {
        use ValueLayout::*;
        let plan = ArgPlan::new(&[Double, Int32, DoublePtr, Float]).unwrap();
        assert_eq!(
            plan.slots,
            [
                ArgSlot::Xmm(0),
                ArgSlot::Int(0),
                ArgSlot::Int(1),
                ArgSlot::Xmm(1)
            ]
        );
    }

    #[test]
    fn surplus_arguments_go_to_the_stack() {
        let layouts = vec![ValueLayout::Double; 10];
        let plan = ArgPlan::new(&layouts).unwrap();
        assert_eq!(plan.slots[8], ArgSlot::Stack(0));
        assert_eq!(plan.slots[9], ArgSlot::Stack(1));
        assert!(ArgPlan::new(&vec![ValueLayout::Double; 17]).is_err());
    }
}
