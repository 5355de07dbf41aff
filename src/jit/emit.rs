use log::debug;

use super::asm::{ARG_REGS, Addr, Assembler, CodeSink, FpuMem, Reg, Xmm};
use super::label::Label;
use super::memory::{CodeBuffer, ExecBuffer};
use super::select::{ArithOp, FpuOp, Mem, Selection, Source};
use super::{ArgPlan, ArgSlot};
use crate::error::ExprError;
use crate::symbol::ValueLayout;

/// Frame slot assignment below `rbp`.
struct Frame {
    input_disp: Vec<i32>,
    temp_base: i32,
    spill_base: i32,
    size: i32,
}

impl Frame {
    fn new(plan: &ArgPlan, sel: &Selection) -> Result<Frame, ExprError> {
        let mut saved = 0i32;
        let input_disp = plan
            .slots
            .iter()
            .map(|slot| match slot {
                ArgSlot::Int(_) | ArgSlot::Xmm(_) => {
                    saved += 1;
                    -8 * saved
                }
                ArgSlot::Stack(j) => 16 + 8 * *j as i32,
            })
            .collect();
        let slots = saved as usize + sel.temps + sel.spill_slots;
        // one scratch qword at [rsp] for moving values between x87 and xmm
        let size = ((slots + 1) * 8).next_multiple_of(16);
        let size = i32::try_from(size)
            .map_err(|_| ExprError::CodeGen("stack frame too large".into()))?;
        Ok(Frame {
            input_disp,
            temp_base: saved,
            spill_base: saved + sel.temps as i32,
            size,
        })
    }

    fn temp(&self, t: u16) -> Addr {
        Addr::base(Reg::Rbp, -8 * (self.temp_base + t as i32 + 1))
    }

    fn spill(&self, p: u16) -> Addr {
        Addr::base(Reg::Rbp, -8 * (self.spill_base + p as i32 + 1))
    }
}

fn fpu_size(layout: ValueLayout) -> FpuMem {
    match layout.base() {
        ValueLayout::Int32 => FpuMem::I32,
        ValueLayout::Float => FpuMem::F32,
        _ => FpuMem::F64,
    }
}

fn arith_ext(op: ArithOp) -> u8 {
    match op {
        ArithOp::Add => 0,
        ArithOp::Mul => 1,
        ArithOp::Sub => 4,
        ArithOp::SubR => 5,
        ArithOp::Div => 6,
        ArithOp::DivR => 7,
    }
}

struct Lowering<'a> {
    asm: Assembler<CodeBuffer>,
    sel: &'a Selection,
    layouts: &'a [ValueLayout],
    frame: Frame,
    pool: Label,
}

/// Encodes a selection into executable memory.
pub(crate) fn lower(
    sel: &Selection,
    layouts: &[ValueLayout],
    plan: &ArgPlan,
    initial_size: usize,
) -> Result<ExecBuffer, ExprError> {
    let mut asm = Assembler::new(CodeBuffer::with_capacity(initial_size)?);
    let pool = asm.new_label();
    let mut l = Lowering {
        asm,
        sel,
        layouts,
        frame: Frame::new(plan, sel)?,
        pool,
    };
    l.prologue(plan)?;
    for op in &sel.ops {
        l.op(op)?;
    }
    l.epilogue()?;

    let (mut buf, labels) = l.asm.into_parts();
    labels.resolve(|at, bytes| buf.patch(at, &bytes))?;
    debug!(
        "native code: {} bytes ({} fpu ops, {} constants, frame {} bytes)",
        buf.bytes().len(),
        sel.ops.len(),
        sel.consts.len(),
        l.frame.size
    );
    buf.finalize()
}

impl Lowering<'_> {
    fn prologue(&mut self, plan: &ArgPlan) -> Result<(), ExprError> {
        self.asm.push(Reg::Rbp)?;
        self.asm.mov_rr(Reg::Rbp, Reg::Rsp)?;
        self.asm.sub_imm(Reg::Rsp, self.frame.size)?;
        for (i, slot) in plan.slots.iter().enumerate() {
            let at = Addr::base(Reg::Rbp, self.frame.input_disp[i]);
            match *slot {
                ArgSlot::Int(k) => self.asm.mov_store(at, ARG_REGS[k])?,
                ArgSlot::Xmm(k) => self.asm.movsd_store(at, Xmm(k as u8))?,
                ArgSlot::Stack(_) => {}
            }
        }
        Ok(())
    }

    fn epilogue(&mut self) -> Result<(), ExprError> {
        let scratch = Addr::base(Reg::Rsp, 0);
        self.asm.fstp_f64(scratch)?;
        self.asm.movsd_load(Xmm(0), scratch)?;
        self.asm.leave()?;
        self.asm.ret()?;
        self.asm.align(8, 0xCC)?;
        self.asm.bind(self.pool);
        for c in &self.sel.consts {
            self.asm.data_f64(*c)?;
        }
        Ok(())
    }

    /// Address and size of a memory operand. Operands reached through a
    /// pointer load it into `rax` first.
    fn addr(&mut self, m: Mem) -> Result<(Addr, FpuMem), ExprError> {
        Ok(match m {
            Mem::Input(i) => {
                let disp = self.frame.input_disp[i as usize];
                (Addr::base(Reg::Rbp, disp), fpu_size(self.layouts[i as usize]))
            }
            Mem::InputPtr(i) => {
                let disp = self.frame.input_disp[i as usize];
                self.asm.mov_load(Reg::Rax, Addr::base(Reg::Rbp, disp))?;
                (Addr::base(Reg::Rax, 0), fpu_size(self.layouts[i as usize]))
            }
            Mem::Var(k) => {
                let var = &self.sel.vars[k as usize];
                self.asm.mov_imm64(Reg::Rax, var.addr() as u64)?;
                (Addr::base(Reg::Rax, 0), fpu_size(var.layout()))
            }
            Mem::Const(c) => (
                Addr::Rip {
                    label: self.pool,
                    addend: 8 * c as i32,
                },
                FpuMem::F64,
            ),
            Mem::Temp(t) => (self.frame.temp(t), FpuMem::F64),
            Mem::Spill(p) => (self.frame.spill(p), FpuMem::F64),
        })
    }

    fn op(&mut self, op: &FpuOp) -> Result<(), ExprError> {
        match op {
            FpuOp::Load(m) => {
                let (addr, size) = self.addr(*m)?;
                self.asm.fld(size, addr)
            }
            FpuOp::Arith { op, src } => match src {
                Source::Pop => self.asm.farith_pop(arith_ext(*op)),
                Source::Mem(m) => {
                    let (addr, size) = self.addr(*m)?;
                    self.asm.farith_mem(arith_ext(*op), size, addr)
                }
            },
            FpuOp::Square => self.asm.fsquare(),
            FpuOp::Neg => self.asm.fchs(),
            FpuOp::Sqrt => self.asm.fsqrt(),
            FpuOp::Spill(p) => {
                let at = self.frame.spill(*p);
                self.asm.fstp_f64(at)
            }
            FpuOp::Copy { from, to } => {
                let (addr, size) = self.addr(*from)?;
                self.asm.fld(size, addr)?;
                let at = self.frame.spill(*to);
                self.asm.fstp_f64(at)
            }
            FpuOp::StoreTemp(t) => {
                let at = self.frame.temp(*t);
                self.asm.fst(FpuMem::F64, at)
            }
            FpuOp::Assign(target) => {
                let (addr, size) = self.addr(*target)?;
                self.asm.fst(size, addr)
            }
            FpuOp::Discard => self.asm.fstp_st(0),
            FpuOp::DiscardBelow => self.asm.fstp_st(1),
            FpuOp::Call { addr, args } => {
                for (k, m) in args.iter().enumerate() {
                    let (at, _) = self.addr(*m)?;
                    self.asm.movsd_load(Xmm(k as u8), at)?;
                }
                self.asm.mov_imm64(Reg::Rax, *addr as u64)?;
                self.asm.call_r(Reg::Rax)?;
                let scratch = Addr::base(Reg::Rsp, 0);
                self.asm.movsd_store(scratch, Xmm(0))?;
                self.asm.fld(FpuMem::F64, scratch)
            }
        }
    }
}
