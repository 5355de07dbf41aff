//! Minimal x86-64 encoder: the general purpose, SSE and x87 forms the
//! expression lowering needs.

use super::label::{Label, Labels};
use crate::error::ExprError;

/// Destination for encoded bytes.
pub trait CodeSink {
    fn put(&mut self, bytes: &[u8]) -> Result<(), ExprError>;
    fn offset(&self) -> usize;
    fn patch(&mut self, at: usize, bytes: &[u8]);
}

impl CodeSink for Vec<u8> {
    fn put(&mut self, bytes: &[u8]) -> Result<(), ExprError> {
        self.extend_from_slice(bytes);
        Ok(())
    }

    fn offset(&self) -> usize {
        self.len()
    }

    fn patch(&mut self, at: usize, bytes: &[u8]) {
        if let Some(dst) = self.get_mut(at..at + bytes.len()) {
            dst.copy_from_slice(bytes);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    fn low(self) -> u8 {
        self as u8 & 7
    }

    fn high(self) -> u8 {
        (self as u8 >> 3) & 1
    }
}

/// Integer argument registers of the System V calling convention.
pub const ARG_REGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Xmm(pub u8);

/// A memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addr {
    Base { base: Reg, disp: i32 },
    Indexed { base: Reg, index: Reg, scale: u8, disp: i32 },
    /// `[rip + label + addend]`
    Rip { label: Label, addend: i32 },
}

impl Addr {
    pub fn base(base: Reg, disp: i32) -> Addr {
        Addr::Base { base, disp }
    }

    fn rex_xb(&self) -> (u8, u8) {
        match *self {
            Addr::Base { base, .. } => (0, base.high()),
            Addr::Indexed { base, index, .. } => (index.high(), base.high()),
            Addr::Rip { .. } => (0, 0),
        }
    }
}

/// x87 memory operand sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FpuMem {
    I32,
    F32,
    F64,
}

pub struct Assembler<S: CodeSink> {
    pub(crate) sink: S,
    pub(crate) labels: Labels,
}

impl<S: CodeSink> Assembler<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            labels: Labels::default(),
        }
    }

    pub fn offset(&self) -> usize {
        self.sink.offset()
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.new_label()
    }

    pub fn bind(&mut self, label: Label) {
        let at = self.sink.offset();
        self.labels.bind(label, at);
    }

    pub fn into_parts(self) -> (S, Labels) {
        (self.sink, self.labels)
    }

    fn emit(&mut self, bytes: &[u8]) -> Result<(), ExprError> {
        self.sink.put(bytes)
    }

    pub fn align(&mut self, to: usize, fill: u8) -> Result<(), ExprError> {
        while self.sink.offset() % to != 0 {
            self.emit(&[fill])?;
        }
        Ok(())
    }

    pub fn data_f64(&mut self, v: f64) -> Result<(), ExprError> {
        self.emit(&v.to_le_bytes())
    }

    /// Emits a REX prefix when any bit is set or `w` is requested.
    fn rex(&mut self, w: bool, r: u8, x: u8, b: u8) -> Result<(), ExprError> {
        let bits = (u8::from(w) << 3) | (r << 2) | (x << 1) | b;
        if bits != 0 {
            self.emit(&[0x40 | bits])?;
        }
        Ok(())
    }

    fn rex_mem(&mut self, w: bool, reg: u8, addr: &Addr) -> Result<(), ExprError> {
        let (x, b) = addr.rex_xb();
        self.rex(w, (reg >> 3) & 1, x, b)
    }

    /// ModRM (plus SIB and displacement) for `reg` against a memory operand.
    fn modrm_mem(&mut self, reg: u8, addr: &Addr) -> Result<(), ExprError> {
        let reg = (reg & 7) << 3;
        match *addr {
            Addr::Rip { label, addend } => {
                self.emit(&[reg | 0b101])?;
                let at = self.sink.offset();
                self.labels.link(label, at, addend);
                self.emit(&[0; 4])
            }
            Addr::Base { base, disp } => {
                let sib = (base.low() == 4).then_some(0x24);
                self.modrm_disp(reg, base, base.low(), sib, disp)
            }
            Addr::Indexed {
                base,
                index,
                scale,
                disp,
            } => {
                let ss = match scale {
                    1 => 0,
                    2 => 1,
                    4 => 2,
                    _ => 3,
                };
                let sib = (ss << 6) | (index.low() << 3) | base.low();
                self.modrm_disp(reg, base, 0b100, Some(sib), disp)
            }
        }
    }

    fn modrm_disp(
        &mut self,
        reg: u8,
        base: Reg,
        rm: u8,
        sib: Option<u8>,
        disp: i32,
    ) -> Result<(), ExprError> {
        // rbp and r13 have no zero-displacement form
        let mode = if disp == 0 && base.low() != 5 {
            0b00
        } else if i8::try_from(disp).is_ok() {
            0b01
        } else {
            0b10
        };
        self.emit(&[(mode << 6) | reg | rm])?;
        if let Some(sib) = sib {
            self.emit(&[sib])?;
        }
        match mode {
            0b01 => self.emit(&[disp as i8 as u8]),
            0b10 => self.emit(&disp.to_le_bytes()),
            _ => Ok(()),
        }
    }

    pub fn push(&mut self, r: Reg) -> Result<(), ExprError> {
        self.rex(false, 0, 0, r.high())?;
        self.emit(&[0x50 | r.low()])
    }

    /// `mov dst, src` (64-bit)
    pub fn mov_rr(&mut self, dst: Reg, src: Reg) -> Result<(), ExprError> {
        self.rex(true, src.high(), 0, dst.high())?;
        self.emit(&[0x89, 0xC0 | (src.low() << 3) | dst.low()])
    }

    /// `mov dst, [addr]` (64-bit)
    pub fn mov_load(&mut self, dst: Reg, addr: Addr) -> Result<(), ExprError> {
        self.rex_mem(true, dst as u8, &addr)?;
        self.emit(&[0x8B])?;
        self.modrm_mem(dst as u8, &addr)
    }

    /// `mov [addr], src` (64-bit)
    pub fn mov_store(&mut self, addr: Addr, src: Reg) -> Result<(), ExprError> {
        self.rex_mem(true, src as u8, &addr)?;
        self.emit(&[0x89])?;
        self.modrm_mem(src as u8, &addr)
    }

    /// `mov dst, imm64`
    pub fn mov_imm64(&mut self, dst: Reg, imm: u64) -> Result<(), ExprError> {
        self.rex(true, 0, 0, dst.high())?;
        self.emit(&[0xB8 | dst.low()])?;
        self.emit(&imm.to_le_bytes())
    }

    /// `sub r, imm32`
    pub fn sub_imm(&mut self, r: Reg, imm: i32) -> Result<(), ExprError> {
        self.rex(true, 0, 0, r.high())?;
        self.emit(&[0x81, 0xE8 | r.low()])?;
        self.emit(&imm.to_le_bytes())
    }

    /// `call r`
    pub fn call_r(&mut self, r: Reg) -> Result<(), ExprError> {
        self.rex(false, 0, 0, r.high())?;
        self.emit(&[0xFF, 0xD0 | r.low()])
    }

    pub fn leave(&mut self) -> Result<(), ExprError> {
        self.emit(&[0xC9])
    }

    pub fn ret(&mut self) -> Result<(), ExprError> {
        self.emit(&[0xC3])
    }

    /// `movsd xmm, [addr]`
    pub fn movsd_load(&mut self, dst: Xmm, addr: Addr) -> Result<(), ExprError> {
        self.emit(&[0xF2])?;
        self.rex_mem(false, dst.0, &addr)?;
        self.emit(&[0x0F, 0x10])?;
        self.modrm_mem(dst.0, &addr)
    }

    /// `movsd [addr], xmm`
    pub fn movsd_store(&mut self, addr: Addr, src: Xmm) -> Result<(), ExprError> {
        self.emit(&[0xF2])?;
        self.rex_mem(false, src.0, &addr)?;
        self.emit(&[0x0F, 0x11])?;
        self.modrm_mem(src.0, &addr)
    }

    fn fpu_mem(&mut self, opcode: u8, ext: u8, addr: Addr) -> Result<(), ExprError> {
        self.rex_mem(false, 0, &addr)?;
        self.emit(&[opcode])?;
        self.modrm_mem(ext, &addr)
    }

    /// `fld` / `fild` from memory.
    pub fn fld(&mut self, size: FpuMem, addr: Addr) -> Result<(), ExprError> {
        match size {
            FpuMem::F64 => self.fpu_mem(0xDD, 0, addr),
            FpuMem::F32 => self.fpu_mem(0xD9, 0, addr),
            FpuMem::I32 => self.fpu_mem(0xDB, 0, addr),
        }
    }

    /// `fst` / `fist` to memory, keeping `st(0)`.
    pub fn fst(&mut self, size: FpuMem, addr: Addr) -> Result<(), ExprError> {
        match size {
            FpuMem::F64 => self.fpu_mem(0xDD, 2, addr),
            FpuMem::F32 => self.fpu_mem(0xD9, 2, addr),
            FpuMem::I32 => self.fpu_mem(0xDB, 2, addr),
        }
    }

    /// `fstp qword [addr]`
    pub fn fstp_f64(&mut self, addr: Addr) -> Result<(), ExprError> {
        self.fpu_mem(0xDD, 3, addr)
    }

    /// `st(0) = st(0) op [addr]` where `ext` is the x87 arithmetic group
    /// selector (0 add, 1 mul, 4 sub, 5 subr, 6 div, 7 divr).
    pub fn farith_mem(&mut self, ext: u8, size: FpuMem, addr: Addr) -> Result<(), ExprError> {
        let opcode = match size {
            FpuMem::F64 => 0xDC,
            FpuMem::F32 => 0xD8,
            FpuMem::I32 => 0xDA,
        };
        self.fpu_mem(opcode, ext, addr)
    }

    /// `st(1) = st(1) op st(0)` and pop, same `ext` selector as
    /// [`Assembler::farith_mem`].
    pub fn farith_pop(&mut self, ext: u8) -> Result<(), ExprError> {
        let second = match ext {
            0 => 0xC1, // faddp
            1 => 0xC9, // fmulp
            4 => 0xE9, // fsubp: st1 - st0
            5 => 0xE1, // fsubrp: st0 - st1
            6 => 0xF9, // fdivp: st1 / st0
            _ => 0xF1, // fdivrp: st0 / st1
        };
        self.emit(&[0xDE, second])
    }

    /// `fmul st(0), st(0)`
    pub fn fsquare(&mut self) -> Result<(), ExprError> {
        self.emit(&[0xD8, 0xC8])
    }

    pub fn fchs(&mut self) -> Result<(), ExprError> {
        self.emit(&[0xD9, 0xE0])
    }

    pub fn fsqrt(&mut self) -> Result<(), ExprError> {
        self.emit(&[0xD9, 0xFA])
    }

    /// `fstp st(i)`
    pub fn fstp_st(&mut self, i: u8) -> Result<(), ExprError> {
        self.emit(&[0xDD, 0xD8 + (i & 7)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asm() -> Assembler<Vec<u8>> {
        Assembler::new(Vec::new())
    }

    fn bytes(f: impl FnOnce(&mut Assembler<Vec<u8>>) -> Result<(), ExprError>) -> Vec<u8> {
        let mut a = asm();
        f(&mut a).unwrap();
        a.sink
    }

    #[test]
    fn prologue_forms() {
        assert_eq!(bytes(|a| a.push(Reg::Rbp)), [0x55]);
        assert_eq!(bytes(|a| a.mov_rr(Reg::Rbp, Reg::Rsp)), [0x48, 0x89, 0xE5]);
        assert_eq!(
            bytes(|a| a.sub_imm(Reg::Rsp, 32)),
            [0x48, 0x81, 0xEC, 32, 0, 0, 0]
        );
        assert_eq!(bytes(|a| a.leave()), [0xC9]);
    }

    #[test]
    fn frame_and_extended_registers() {
        assert_eq!(
            bytes(|a| a.mov_store(Addr::base(Reg::Rbp, -8), Reg::Rdi)),
            [0x48, 0x89, 0x7D, 0xF8]
        );
        assert_eq!(
            bytes(|a| a.mov_store(Addr::base(Reg::Rbp, -8), Reg::R8)),
            [0x4C, 0x89, 0x45, 0xF8]
        );
        assert_eq!(
            bytes(|a| a.mov_load(Reg::Rax, Addr::base(Reg::Rbp, 16))),
            [0x48, 0x8B, 0x45, 0x10]
        );
        assert_eq!(
            bytes(|a| a.mov_load(Reg::Rax, Addr::base(Reg::Rbp, -512))),
            [0x48, 0x8B, 0x85, 0x00, 0xFE, 0xFF, 0xFF]
        );
    }

    #[test]
    fn rsp_base_needs_sib() {
        assert_eq!(
            bytes(|a| a.movsd_load(Xmm(0), Addr::base(Reg::Rsp, 0))),
            [0xF2, 0x0F, 0x10, 0x04, 0x24]
        );
        assert_eq!(
            bytes(|a| a.fld(FpuMem::F64, Addr::base(Reg::Rsp, 0))),
            [0xDD, 0x04, 0x24]
        );
    }

    #[test]
    fn scaled_index() {
        let addr = Addr::Indexed {
            base: Reg::Rax,
            index: Reg::Rcx,
            scale: 8,
            disp: 0,
        };
        assert_eq!(bytes(|a| a.fld(FpuMem::F64, addr)), [0xDD, 0x04, 0xC8]);
    }

    #[test]
    fn x87_forms() {
        assert_eq!(
            bytes(|a| a.fld(FpuMem::I32, Addr::base(Reg::Rax, 0))),
            [0xDB, 0x00]
        );
        assert_eq!(
            bytes(|a| a.farith_mem(4, FpuMem::F64, Addr::base(Reg::Rbp, -16))),
            [0xDC, 0x65, 0xF0]
        );
        assert_eq!(bytes(|a| a.farith_pop(5)), [0xDE, 0xE1]);
        assert_eq!(bytes(|a| a.fstp_st(1)), [0xDD, 0xD9]);
        assert_eq!(
            bytes(|a| a.fst(FpuMem::I32, Addr::base(Reg::Rax, 0))),
            [0xDB, 0x10]
        );
    }

    #[test]
    fn call_through_register() {
        assert_eq!(
            bytes(|a| a.mov_imm64(Reg::Rax, 0x1122_3344_5566_7788)),
            [0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
        assert_eq!(bytes(|a| a.call_r(Reg::Rax)), [0xFF, 0xD0]);
    }

    #[test]
    fn rip_relative_operand_links_its_displacement() {
        let mut a = asm();
        let pool = a.new_label();
        a.fld(FpuMem::F64, Addr::Rip { label: pool, addend: 8 }).unwrap();
        a.align(8, 0xCC).unwrap();
        a.bind(pool);
        a.data_f64(1.0).unwrap();
        a.data_f64(2.0).unwrap();
        let (mut code, labels) = a.into_parts();
        labels
            .resolve(|at, b| code.patch(at, &b))
            .unwrap();
        assert_eq!(&code[..2], &[0xDD, 0x05]);
        let disp = i32::from_le_bytes([code[2], code[3], code[4], code[5]]);
        // next instruction at 6, pool at 8, second constant at 16
        assert_eq!(6 + disp, 16);
    }
}
