// This module wraps the iced-x86 CodeAssembler with the handful of instruction shapes the code
// generator needs. Every IR value lives in a stack slot addressed from rbp, the CPU state
// pointer is kept in rbx for the whole function, and rax/rcx are the only scratch registers,
// so the encoder works on the two-register Reg enum plus an access Width rather than on an
// allocator's view of the register file. Calls come in two forms: calls to functions in the
// same object go through labels, calls to external declarations are emitted as a raw E8 with
// a zero displacement behind a label so the object writer can attach a PLT32 relocation at
// the label's final offset. Assembling returns the code plus a lookup for label offsets.

//! x86-64 instruction encoding using iced-x86.

use crate::ir::{BinOp, CmpPred, Segment, Width};
use iced_x86::code_asm::*;
use iced_x86::{BlockEncoderOptions, IcedError};
use thiserror::Error;

/// Error types for instruction encoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// Assembly error from iced-x86.
    #[error("Assembly error: {0}")]
    AssemblyError(String),

    /// A stack slot displacement does not fit the rbp-relative encoding.
    #[error("stack frame of {slots} slots is too large")]
    FrameTooLarge { slots: usize },
}

fn asm_err(e: IcedError) -> EncodingError {
    EncodingError::AssemblyError(e.to_string())
}

/// Scratch registers available to instruction lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    Rax,
    Rcx,
}

impl Reg {
    fn r64(self) -> AsmRegister64 {
        match self {
            Reg::Rax => rax,
            Reg::Rcx => rcx,
        }
    }

    fn r32(self) -> AsmRegister32 {
        match self {
            Reg::Rax => eax,
            Reg::Rcx => ecx,
        }
    }

    fn r8(self) -> AsmRegister8 {
        match self {
            Reg::Rax => al,
            Reg::Rcx => cl,
        }
    }
}

/// Register holding the CPU state pointer inside every generated function.
const STATE: AsmRegister64 = rbx;

/// x86-64 instruction encoder using iced-x86.
pub struct X64Encoder {
    assembler: CodeAssembler,
}

impl X64Encoder {
    pub fn new() -> Result<Self, EncodingError> {
        let assembler = CodeAssembler::new(64).map_err(asm_err)?;
        Ok(Self { assembler })
    }

    pub fn create_label(&mut self) -> CodeLabel {
        self.assembler.create_label()
    }

    /// Bind `label` to the next emitted instruction.
    pub fn place_label(&mut self, label: &mut CodeLabel) -> Result<(), EncodingError> {
        self.assembler.set_label(label).map_err(asm_err)
    }

    // ==== FRAME ====

    /// Set up the frame and move the state pointer from `sptr` into its home register.
    pub fn emit_prologue(&mut self, frame_size: u32, sptr: AsmRegister64) -> Result<(), EncodingError> {
        let a = &mut self.assembler;
        a.push(rbp).map_err(asm_err)?;
        a.mov(rbp, rsp).map_err(asm_err)?;
        a.push(STATE).map_err(asm_err)?;
        if frame_size > 0 {
            a.sub(rsp, frame_size as i32).map_err(asm_err)?;
        }
        a.mov(STATE, sptr).map_err(asm_err)?;
        Ok(())
    }

    pub fn emit_epilogue(&mut self) -> Result<(), EncodingError> {
        let a = &mut self.assembler;
        a.lea(rsp, rbp - 8).map_err(asm_err)?;
        a.pop(STATE).map_err(asm_err)?;
        a.pop(rbp).map_err(asm_err)?;
        a.ret().map_err(asm_err)?;
        Ok(())
    }

    // ==== DATA MOVEMENT ====

    pub fn mov_imm(&mut self, dst: Reg, value: u64) -> Result<(), EncodingError> {
        if value <= u32::MAX as u64 {
            // 32-bit moves zero-extend
            self.assembler.mov(dst.r32(), value as u32).map_err(asm_err)
        } else {
            self.assembler.mov(dst.r64(), value as i64).map_err(asm_err)
        }
    }

    pub fn load_slot(&mut self, dst: Reg, disp: i32) -> Result<(), EncodingError> {
        self.assembler
            .mov(dst.r64(), qword_ptr(rbp + disp))
            .map_err(asm_err)
    }

    pub fn store_slot(&mut self, disp: i32, src: Reg) -> Result<(), EncodingError> {
        self.assembler
            .mov(qword_ptr(rbp + disp), src.r64())
            .map_err(asm_err)
    }

    /// Zero-extending load of `width` bytes from `base + disp`.
    fn load(&mut self, dst: Reg, base: AsmRegister64, disp: i32, width: Width) -> Result<(), EncodingError> {
        let a = &mut self.assembler;
        match width {
            Width::W8 => a.movzx(dst.r32(), byte_ptr(base + disp)),
            Width::W32 => a.mov(dst.r32(), dword_ptr(base + disp)),
            Width::W64 => a.mov(dst.r64(), qword_ptr(base + disp)),
        }
        .map_err(asm_err)
    }

    /// Truncating store of the low `width` bytes of `src` to `base + disp`.
    fn store(&mut self, base: AsmRegister64, disp: i32, src: Reg, width: Width) -> Result<(), EncodingError> {
        let a = &mut self.assembler;
        match width {
            Width::W8 => a.mov(byte_ptr(base + disp), src.r8()),
            Width::W32 => a.mov(dword_ptr(base + disp), src.r32()),
            Width::W64 => a.mov(qword_ptr(base + disp), src.r64()),
        }
        .map_err(asm_err)
    }

    pub fn load_state(&mut self, dst: Reg, offset: u16, width: Width) -> Result<(), EncodingError> {
        self.load(dst, STATE, offset as i32, width)
    }

    pub fn store_state(&mut self, offset: u16, src: Reg, width: Width) -> Result<(), EncodingError> {
        self.store(STATE, offset as i32, src, width)
    }

    /// Load from the guest address held in `addr`.
    pub fn load_mem(&mut self, dst: Reg, addr: Reg, width: Width) -> Result<(), EncodingError> {
        self.load(dst, addr.r64(), 0, width)
    }

    pub fn store_mem(&mut self, addr: Reg, src: Reg, width: Width) -> Result<(), EncodingError> {
        self.store(addr.r64(), 0, src, width)
    }

    pub fn segment_base(&mut self, dst: Reg, segment: Segment) -> Result<(), EncodingError> {
        match segment {
            Segment::Fs => self.assembler.rdfsbase(dst.r64()),
            Segment::Gs => self.assembler.rdgsbase(dst.r64()),
        }
        .map_err(asm_err)
    }

    // ==== ARITHMETIC ====

    /// `rax = rax op rcx`; shifts take their count from cl.
    pub fn binary(&mut self, op: BinOp) -> Result<(), EncodingError> {
        let a = &mut self.assembler;
        match op {
            BinOp::Add => a.add(rax, rcx),
            BinOp::Sub => a.sub(rax, rcx),
            BinOp::And => a.and(rax, rcx),
            BinOp::Or => a.or(rax, rcx),
            BinOp::Xor => a.xor(rax, rcx),
            BinOp::Shl => a.shl(rax, cl),
            BinOp::Shr => a.shr(rax, cl),
            BinOp::Sar => a.sar(rax, cl),
        }
        .map_err(asm_err)
    }

    /// `rax = (rax pred rcx) as u64`.
    pub fn compare(&mut self, pred: CmpPred) -> Result<(), EncodingError> {
        let a = &mut self.assembler;
        a.cmp(rax, rcx).map_err(asm_err)?;
        match pred {
            CmpPred::Eq => a.sete(al),
            CmpPred::Ne => a.setne(al),
            CmpPred::Ult => a.setb(al),
            CmpPred::Slt => a.setl(al),
        }
        .map_err(asm_err)?;
        a.movzx(eax, al).map_err(asm_err)
    }

    // ==== CONTROL FLOW ====

    pub fn jmp(&mut self, target: CodeLabel) -> Result<(), EncodingError> {
        self.assembler.jmp(target).map_err(asm_err)
    }

    /// Branch to `then_label` if `cond` is non-zero, otherwise to `else_label`.
    pub fn branch(&mut self, cond: Reg, then_label: CodeLabel, else_label: CodeLabel) -> Result<(), EncodingError> {
        let a = &mut self.assembler;
        a.test(cond.r64(), cond.r64()).map_err(asm_err)?;
        a.jne(then_label).map_err(asm_err)?;
        a.jmp(else_label).map_err(asm_err)
    }

    pub fn ud2(&mut self) -> Result<(), EncodingError> {
        self.assembler.ud2().map_err(asm_err)
    }

    /// Call a function of this object with the state pointer as first System V argument.
    pub fn call_label(&mut self, target: CodeLabel) -> Result<(), EncodingError> {
        self.assembler.mov(rdi, STATE).map_err(asm_err)?;
        self.assembler.call(target).map_err(asm_err)
    }

    /// Call an external symbol. Returns the label of the call instruction; its rel32 field
    /// starts one byte after the label.
    pub fn call_external(&mut self) -> Result<CodeLabel, EncodingError> {
        self.assembler.mov(rdi, STATE).map_err(asm_err)?;
        let mut site = self.assembler.create_label();
        self.assembler.set_label(&mut site).map_err(asm_err)?;
        self.assembler.db(&[0xE8, 0, 0, 0, 0]).map_err(asm_err)?;
        Ok(site)
    }

    /// Generate the final machine code, laid out from offset 0.
    pub fn finalize(mut self) -> Result<Assembled, EncodingError> {
        let result = self
            .assembler
            .assemble_options(0, BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS)
            .map_err(asm_err)?;
        Ok(Assembled { result })
    }
}

/// Assembled code with resolvable label offsets.
pub struct Assembled {
    result: CodeAssemblerResult,
}

impl Assembled {
    pub fn code(&self) -> &[u8] {
        &self.result.inner.code_buffer
    }

    pub fn label_offset(&self, label: &CodeLabel) -> Result<u64, EncodingError> {
        self.result.label_ip(label).map_err(asm_err)
    }
}
