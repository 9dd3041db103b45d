//! Lowering of one function body to machine code.

use super::calling_convention::FunctionFrame;
use super::encoder::{Reg, X64Encoder};
use crate::core::error::CodegenError;
use crate::ir::{Body, FuncId, Inst, Terminator, Value};
use hashbrown::HashMap;
use iced_x86::code_asm::{AsmRegister64, CodeLabel};

/// How a call to a module function is emitted.
#[derive(Debug, Clone, Copy)]
pub(super) enum Callee {
    /// Function with a body in the same object.
    Local(CodeLabel),
    /// Declaration resolved by the linker.
    External,
}

/// A call to an external declaration awaiting its relocation.
#[derive(Debug, Clone, Copy)]
pub(super) struct CallSite {
    pub label: CodeLabel,
    pub callee: FuncId,
}

/// Function code generator for the one-slot-per-value frame model.
pub(super) struct FunctionCodegen<'e, 't> {
    encoder: &'e mut X64Encoder,
    callees: &'t HashMap<FuncId, Callee>,
    frame: FunctionFrame,
    block_labels: Vec<CodeLabel>,
}

impl<'e, 't> FunctionCodegen<'e, 't> {
    pub(super) fn new(
        encoder: &'e mut X64Encoder,
        callees: &'t HashMap<FuncId, Callee>,
        body: &Body,
    ) -> Result<Self, CodegenError> {
        let frame = FunctionFrame::new(body.insts.len())?;
        let block_labels = body.blocks.iter().map(|_| encoder.create_label()).collect();
        Ok(Self {
            encoder,
            callees,
            frame,
            block_labels,
        })
    }

    fn disp(&self, value: Value) -> i32 {
        self.frame.slot_disp(value.0)
    }

    /// Emit the body at `entry`, receiving the state pointer in `sptr`. Calls to external
    /// declarations are appended to `sites`.
    pub(super) fn emit(
        mut self,
        body: &Body,
        entry: &mut CodeLabel,
        sptr: AsmRegister64,
        sites: &mut Vec<CallSite>,
    ) -> Result<(), CodegenError> {
        self.encoder.place_label(entry)?;
        self.encoder.emit_prologue(self.frame.frame_size(), sptr)?;

        for (idx, block) in body.blocks.iter().enumerate() {
            let mut label = self.block_labels[idx];
            self.encoder.place_label(&mut label)?;
            for &value in &block.insts {
                self.emit_inst(value, body.inst(value), sites)?;
            }
            self.emit_terminator(&block.term)?;
        }
        Ok(())
    }

    fn emit_inst(&mut self, value: Value, inst: &Inst, sites: &mut Vec<CallSite>) -> Result<(), CodegenError> {
        match *inst {
            Inst::Const(c) => self.encoder.mov_imm(Reg::Rax, c)?,
            Inst::LoadState { offset, width } => self.encoder.load_state(Reg::Rax, offset, width)?,
            Inst::StoreState {
                offset,
                width,
                value: stored,
            } => {
                self.encoder.load_slot(Reg::Rax, self.disp(stored))?;
                self.encoder.store_state(offset, Reg::Rax, width)?;
            }
            Inst::Load { addr, width } => {
                self.encoder.load_slot(Reg::Rax, self.disp(addr))?;
                self.encoder.load_mem(Reg::Rax, Reg::Rax, width)?;
            }
            Inst::Store {
                addr,
                value: stored,
                width,
            } => {
                self.encoder.load_slot(Reg::Rax, self.disp(addr))?;
                self.encoder.load_slot(Reg::Rcx, self.disp(stored))?;
                self.encoder.store_mem(Reg::Rax, Reg::Rcx, width)?;
            }
            Inst::Binary { op, lhs, rhs } => {
                self.encoder.load_slot(Reg::Rax, self.disp(lhs))?;
                self.encoder.load_slot(Reg::Rcx, self.disp(rhs))?;
                self.encoder.binary(op)?;
            }
            Inst::Cmp { pred, lhs, rhs } => {
                self.encoder.load_slot(Reg::Rax, self.disp(lhs))?;
                self.encoder.load_slot(Reg::Rcx, self.disp(rhs))?;
                self.encoder.compare(pred)?;
            }
            Inst::SegmentBase(segment) => self.encoder.segment_base(Reg::Rax, segment)?,
            Inst::Call { callee } => match self.callees.get(&callee) {
                Some(Callee::Local(label)) => self.encoder.call_label(*label)?,
                Some(Callee::External) => {
                    let label = self.encoder.call_external()?;
                    sites.push(CallSite { label, callee });
                }
                None => return Err(CodegenError::UnknownCallee { callee }),
            },
        }

        if inst.has_result() {
            self.encoder.store_slot(self.disp(value), Reg::Rax)?;
        }
        Ok(())
    }

    fn emit_terminator(&mut self, term: &Terminator) -> Result<(), CodegenError> {
        match *term {
            Terminator::Unreachable => self.encoder.ud2()?,
            Terminator::Jump(target) => self.encoder.jmp(self.block_labels[target.0 as usize])?,
            Terminator::Branch {
                cond,
                then_block,
                else_block,
            } => {
                self.encoder.load_slot(Reg::Rax, self.disp(cond))?;
                self.encoder.branch(
                    Reg::Rax,
                    self.block_labels[then_block.0 as usize],
                    self.block_labels[else_block.0 as usize],
                )?;
            }
            Terminator::Return { .. } => self.encoder.emit_epilogue()?,
        }
        Ok(())
    }
}
