//! Instruction semantics.
//!
//! Registers and flags are read from and written to the CPU state on every access; the
//! optimizer forwards the redundant accesses within a block.

use super::cpu_state::{self, Flag};
use super::fetch::CodeFetcher;
use super::{DecodePolicy, LiftConfig, MAX_INSTRUCTIONS};
use crate::ir::{BinOp, BlockId, Body, CmpPred, FunctionBuilder, Segment, Value, Width};
use bumpalo::Bump;
use iced_x86::{ConditionCode, Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};

/// The instruction is outside the supported subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Unsupported;

type LiftResult<T> = Result<T, Unsupported>;

enum Flow {
    Continue,
    /// The instruction terminated the current block.
    Exit,
}

/// Register or memory operand resolved to a location.
#[derive(Clone, Copy)]
enum Place {
    Reg(u8, Width),
    Mem(Value, Width),
}

impl Place {
    fn width(self) -> Width {
        match self {
            Place::Reg(_, width) | Place::Mem(_, width) => width,
        }
    }
}

fn width_from_bytes(bytes: usize) -> LiftResult<Width> {
    match bytes {
        1 => Ok(Width::W8),
        4 => Ok(Width::W32),
        8 => Ok(Width::W64),
        _ => Err(Unsupported),
    }
}

/// Map an iced register to (GPR number, access width).
fn gpr_operand(reg: Register) -> LiftResult<(u8, Width)> {
    // High byte registers would need a shifted merge.
    if !reg.is_gpr() || matches!(reg, Register::AH | Register::CH | Register::DH | Register::BH) {
        return Err(Unsupported);
    }
    let width = width_from_bytes(reg.size())?;
    Ok((reg.full_register().number() as u8, width))
}

pub(super) struct FunctionLifter<'c, 's, 'b> {
    config: &'c LiftConfig,
    policy: DecodePolicy,
    fetcher: CodeFetcher<'s, 'b>,
    b: FunctionBuilder,
    blocks: hashbrown::HashMap<u64, BlockId>,
    worklist: bumpalo::collections::Vec<'b, (u64, BlockId)>,
    decoded: usize,
}

impl<'c, 's, 'b> FunctionLifter<'c, 's, 'b> {
    pub(super) fn new(
        config: &'c LiftConfig,
        policy: DecodePolicy,
        fetcher: CodeFetcher<'s, 'b>,
        scratch: &'b Bump,
    ) -> Self {
        Self {
            config,
            policy,
            fetcher,
            b: FunctionBuilder::new(),
            blocks: hashbrown::HashMap::new(),
            worklist: bumpalo::collections::Vec::new_in(scratch),
            decoded: 0,
        }
    }

    /// Lift the function starting at `entry`; `None` if nothing could be lifted.
    pub(super) fn lift(mut self, entry: u64) -> Option<(Body, usize)> {
        let entry_block = self.b.current_block();
        self.blocks.insert(entry, entry_block);
        self.worklist.push((entry, entry_block));

        while let Some((addr, block)) = self.worklist.pop() {
            self.b.switch_to(block);
            self.lift_block(addr);
        }

        if self.decoded == 0 {
            return None;
        }
        Some((self.b.finish(), self.decoded))
    }

    fn lift_block(&mut self, start: u64) {
        let mut ip = start;
        loop {
            if self.decoded >= MAX_INSTRUCTIONS {
                self.exit_to(ip, false);
                return;
            }
            let Some(instr) = self.decode_at(ip) else {
                self.exit_to(ip, false);
                return;
            };
            log::trace!("{ip:#x}: {instr}");

            let mark = self.b.mark();
            match self.lift_instruction(&instr) {
                Ok(Flow::Continue) => self.decoded += 1,
                Ok(Flow::Exit) => {
                    self.decoded += 1;
                    return;
                }
                Err(Unsupported) => {
                    log::debug!("unsupported instruction at {ip:#x}: {instr}");
                    self.b.rollback(mark);
                    self.exit_to(ip, false);
                    return;
                }
            }

            ip = instr.next_ip();
            if self.policy == DecodePolicy::All {
                if let Some(&next) = self.blocks.get(&ip) {
                    self.b.jump(next);
                    return;
                }
            }
        }
    }

    fn decode_at(&mut self, ip: u64) -> Option<Instruction> {
        let bytes = self.fetcher.bytes_at(ip)?;
        let mut decoder = Decoder::with_ip(64, bytes, ip, DecoderOptions::NONE);
        let instr = decoder.decode();
        if instr.is_invalid() {
            log::debug!("undecodable bytes at {ip:#x}: {:?}", decoder.last_error());
            return None;
        }
        Some(instr)
    }

    // ==== BLOCKS AND EXITS ====

    /// Store `target` as the next guest RIP and return.
    fn exit_to(&mut self, target: u64, clobbers_flags: bool) {
        let rip = self.b.iconst(target);
        self.b.store_state(cpu_state::RIP, Width::W64, rip);
        self.b.ret(clobbers_flags);
    }

    /// Block that continues at `target`: a lifted block when the policy follows branches,
    /// otherwise a block exiting to `target`.
    fn branch_target(&mut self, target: u64) -> BlockId {
        let follow = self.policy == DecodePolicy::All
            && self.decoded + self.worklist.len() < MAX_INSTRUCTIONS;
        if follow {
            if let Some(&block) = self.blocks.get(&target) {
                return block;
            }
            let block = self.b.create_block();
            self.blocks.insert(target, block);
            self.worklist.push((target, block));
            return block;
        }

        let current = self.b.current_block();
        let block = self.b.create_block();
        self.b.switch_to(block);
        self.exit_to(target, false);
        self.b.switch_to(current);
        block
    }

    // ==== OPERANDS ====

    fn read_gpr(&mut self, n: u8, width: Width) -> Value {
        self.b.load_state(cpu_state::gpr(n), width)
    }

    fn write_gpr(&mut self, n: u8, width: Width, value: Value) {
        match width {
            // Byte stores merge into the low byte of the register.
            Width::W8 => self.b.store_state(cpu_state::gpr(n), Width::W8, value),
            // 32-bit writes clear the upper half.
            Width::W32 => {
                let low = self.mask(value, Width::W32);
                self.b.store_state(cpu_state::gpr(n), Width::W64, low);
            }
            Width::W64 => self.b.store_state(cpu_state::gpr(n), Width::W64, value),
        }
    }

    fn read_reg64(&mut self, reg: Register) -> LiftResult<Value> {
        match gpr_operand(reg)? {
            (n, Width::W64) => Ok(self.read_gpr(n, Width::W64)),
            _ => Err(Unsupported),
        }
    }

    fn segment_base(&mut self, segment: Segment) -> Value {
        if self.config.use_native_segment_base {
            return self.b.segment_base(segment);
        }
        let offset = match segment {
            Segment::Fs => cpu_state::FS_BASE,
            Segment::Gs => cpu_state::GS_BASE,
        };
        self.b.load_state(offset, Width::W64)
    }

    /// Effective address of the memory operand, including the FS/GS base.
    fn address(&mut self, instr: &Instruction) -> LiftResult<Value> {
        let disp = instr.memory_displacement64();
        let mut addr = match instr.memory_base() {
            Register::None => None,
            // iced already resolved RIP-relative displacements to absolute addresses.
            Register::RIP => Some(self.b.iconst(disp)),
            base => Some(self.read_reg64(base)?),
        };

        if instr.memory_index() != Register::None {
            let mut index = self.read_reg64(instr.memory_index())?;
            let shift = instr.memory_index_scale().trailing_zeros() as u64;
            if shift > 0 {
                index = self.b.binary_imm(BinOp::Shl, index, shift);
            }
            addr = Some(match addr {
                Some(base) => self.b.binary(BinOp::Add, base, index),
                None => index,
            });
        }

        let mut addr = match addr {
            Some(addr) if instr.memory_base() != Register::RIP && disp != 0 => {
                self.b.binary_imm(BinOp::Add, addr, disp)
            }
            Some(addr) => addr,
            None => self.b.iconst(disp),
        };

        let segment = match instr.memory_segment() {
            Register::FS => Some(Segment::Fs),
            Register::GS => Some(Segment::Gs),
            _ => None,
        };
        if let Some(segment) = segment {
            let base = self.segment_base(segment);
            addr = self.b.binary(BinOp::Add, addr, base);
        }
        Ok(addr)
    }

    fn place(&mut self, instr: &Instruction, operand: u32) -> LiftResult<Place> {
        match instr.op_kind(operand) {
            OpKind::Register => {
                let (n, width) = gpr_operand(instr.op_register(operand))?;
                Ok(Place::Reg(n, width))
            }
            OpKind::Memory => {
                let width = width_from_bytes(instr.memory_size().size())?;
                let addr = self.address(instr)?;
                Ok(Place::Mem(addr, width))
            }
            _ => Err(Unsupported),
        }
    }

    fn read_place(&mut self, place: Place) -> Value {
        match place {
            Place::Reg(n, width) => self.read_gpr(n, width),
            Place::Mem(addr, width) => self.b.load(addr, width),
        }
    }

    fn write_place(&mut self, place: Place, value: Value) {
        match place {
            Place::Reg(n, width) => self.write_gpr(n, width, value),
            Place::Mem(addr, width) => self.b.store(addr, value, width),
        }
    }

    /// Source operand zero-extended from `width`.
    fn source(&mut self, instr: &Instruction, operand: u32, width: Width) -> LiftResult<Value> {
        match instr.op_kind(operand) {
            OpKind::Immediate8
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64 => Ok(self.b.iconst(instr.immediate(operand) & width.mask())),
            OpKind::Register | OpKind::Memory => {
                let place = self.place(instr, operand)?;
                if place.width() != width {
                    return Err(Unsupported);
                }
                Ok(self.read_place(place))
            }
            _ => Err(Unsupported),
        }
    }

    // ==== FLAGS ====

    fn mask(&mut self, value: Value, width: Width) -> Value {
        match width {
            Width::W64 => value,
            _ => self.b.binary_imm(BinOp::And, value, width.mask()),
        }
    }

    fn sign_bit(&mut self, value: Value, width: Width) -> Value {
        let shifted = self.b.binary_imm(BinOp::Shr, value, (width.bits() - 1) as u64);
        self.b.binary_imm(BinOp::And, shifted, 1)
    }

    fn set_flag(&mut self, flag: Flag, value: Value) {
        self.b.store_state(flag.offset(), Width::W8, value);
    }

    fn get_flag(&mut self, flag: Flag) -> Value {
        self.b.load_state(flag.offset(), Width::W8)
    }

    /// Store `value` to `flag` when `taken` is 1 and keep the old flag when it is 0.
    fn set_flag_if(&mut self, flag: Flag, value: Value, taken: Value) {
        let old = self.get_flag(flag);
        let diff = self.b.binary(BinOp::Xor, old, value);
        let keep = self.b.binary(BinOp::And, diff, taken);
        let merged = self.b.binary(BinOp::Xor, old, keep);
        self.set_flag(flag, merged);
    }

    /// ZF and SF from a result already masked to `width`.
    fn set_zf_sf(&mut self, result: Value, width: Width) {
        let zero = self.b.iconst(0);
        let zf = self.b.cmp(CmpPred::Eq, result, zero);
        self.set_flag(Flag::Zf, zf);
        let sf = self.sign_bit(result, width);
        self.set_flag(Flag::Sf, sf);
    }

    fn set_logic_flags(&mut self, result: Value, width: Width) {
        self.set_zf_sf(result, width);
        let zero = self.b.iconst(0);
        self.set_flag(Flag::Cf, zero);
        self.set_flag(Flag::Of, zero);
    }

    fn set_add_flags(&mut self, lhs: Value, rhs: Value, result: Value, width: Width, cf: bool) {
        self.set_zf_sf(result, width);
        if cf {
            let carry = self.b.cmp(CmpPred::Ult, result, lhs);
            self.set_flag(Flag::Cf, carry);
        }
        // Overflow when both inputs share a sign the result lacks.
        let inputs = self.b.binary(BinOp::Xor, lhs, rhs);
        let same_sign = self.b.binary_imm(BinOp::Xor, inputs, u64::MAX);
        let changed = self.b.binary(BinOp::Xor, lhs, result);
        let both = self.b.binary(BinOp::And, same_sign, changed);
        let of = self.sign_bit(both, width);
        self.set_flag(Flag::Of, of);
    }

    fn set_sub_flags(&mut self, lhs: Value, rhs: Value, result: Value, width: Width, cf: bool) {
        self.set_zf_sf(result, width);
        if cf {
            let borrow = self.b.cmp(CmpPred::Ult, lhs, rhs);
            self.set_flag(Flag::Cf, borrow);
        }
        let inputs = self.b.binary(BinOp::Xor, lhs, rhs);
        let changed = self.b.binary(BinOp::Xor, lhs, result);
        let both = self.b.binary(BinOp::And, inputs, changed);
        let of = self.sign_bit(both, width);
        self.set_flag(Flag::Of, of);
    }

    fn condition(&mut self, cc: ConditionCode) -> LiftResult<Value> {
        let (base, negate) = match cc {
            ConditionCode::o | ConditionCode::no => (self.get_flag(Flag::Of), cc == ConditionCode::no),
            ConditionCode::b | ConditionCode::ae => (self.get_flag(Flag::Cf), cc == ConditionCode::ae),
            ConditionCode::e | ConditionCode::ne => (self.get_flag(Flag::Zf), cc == ConditionCode::ne),
            ConditionCode::s | ConditionCode::ns => (self.get_flag(Flag::Sf), cc == ConditionCode::ns),
            ConditionCode::be | ConditionCode::a => {
                let cf = self.get_flag(Flag::Cf);
                let zf = self.get_flag(Flag::Zf);
                (self.b.binary(BinOp::Or, cf, zf), cc == ConditionCode::a)
            }
            ConditionCode::l | ConditionCode::ge => {
                let sf = self.get_flag(Flag::Sf);
                let of = self.get_flag(Flag::Of);
                (self.b.binary(BinOp::Xor, sf, of), cc == ConditionCode::ge)
            }
            ConditionCode::le | ConditionCode::g => {
                let sf = self.get_flag(Flag::Sf);
                let of = self.get_flag(Flag::Of);
                let less = self.b.binary(BinOp::Xor, sf, of);
                let zf = self.get_flag(Flag::Zf);
                (self.b.binary(BinOp::Or, zf, less), cc == ConditionCode::g)
            }
            // Parity is not tracked.
            _ => return Err(Unsupported),
        };
        Ok(if negate {
            self.b.binary_imm(BinOp::Xor, base, 1)
        } else {
            base
        })
    }

    // ==== STACK ====

    fn push(&mut self, value: Value) {
        let rsp = self.b.load_state(cpu_state::RSP, Width::W64);
        let rsp = self.b.binary_imm(BinOp::Sub, rsp, 8);
        self.b.store(rsp, value, Width::W64);
        self.b.store_state(cpu_state::RSP, Width::W64, rsp);
    }

    fn pop(&mut self, extra: u64) -> Value {
        let rsp = self.b.load_state(cpu_state::RSP, Width::W64);
        let value = self.b.load(rsp, Width::W64);
        let rsp = self.b.binary_imm(BinOp::Add, rsp, 8 + extra);
        self.b.store_state(cpu_state::RSP, Width::W64, rsp);
        value
    }

    // ==== INSTRUCTIONS ====

    fn lift_instruction(&mut self, instr: &Instruction) -> LiftResult<Flow> {
        let impls = self.config.instr_impls;
        match instr.mnemonic() {
            Mnemonic::Nop => {}
            Mnemonic::Mov => {
                let dst = self.place(instr, 0)?;
                let value = self.source(instr, 1, dst.width())?;
                self.write_place(dst, value);
            }
            Mnemonic::Movzx => {
                let dst = self.place(instr, 0)?;
                if dst.width() == Width::W8 {
                    return Err(Unsupported);
                }
                let value = self.source(instr, 1, Width::W8)?;
                self.write_place(dst, value);
            }
            Mnemonic::Lea => {
                let dst = self.place(instr, 0)?;
                let addr = self.address(instr)?;
                let addr = self.mask(addr, dst.width());
                self.write_place(dst, addr);
            }
            Mnemonic::Add
            | Mnemonic::Sub
            | Mnemonic::And
            | Mnemonic::Or
            | Mnemonic::Xor
            | Mnemonic::Cmp
            | Mnemonic::Test => self.lift_binary(instr)?,
            Mnemonic::Inc | Mnemonic::Dec | Mnemonic::Neg | Mnemonic::Not => {
                self.lift_unary(instr)?
            }
            Mnemonic::Shl | Mnemonic::Shr | Mnemonic::Sar => self.lift_shift(instr)?,
            Mnemonic::Push => {
                let value = self.source(instr, 0, Width::W64)?;
                self.push(value);
            }
            Mnemonic::Pop => {
                let dst = self.place(instr, 0)?;
                if dst.width() != Width::W64 {
                    return Err(Unsupported);
                }
                let value = self.pop(0);
                self.write_place(dst, value);
            }
            Mnemonic::Jmp => {
                if instr.op_kind(0) == OpKind::NearBranch64 {
                    let target = self.branch_target(instr.near_branch_target());
                    self.b.jump(target);
                } else {
                    let target = self.source(instr, 0, Width::W64)?;
                    self.b.store_state(cpu_state::RIP, Width::W64, target);
                    self.b.ret(false);
                }
                return Ok(Flow::Exit);
            }
            Mnemonic::Jo
            | Mnemonic::Jno
            | Mnemonic::Jb
            | Mnemonic::Jae
            | Mnemonic::Je
            | Mnemonic::Jne
            | Mnemonic::Jbe
            | Mnemonic::Ja
            | Mnemonic::Js
            | Mnemonic::Jns
            | Mnemonic::Jl
            | Mnemonic::Jge
            | Mnemonic::Jle
            | Mnemonic::Jg => {
                if instr.op_kind(0) != OpKind::NearBranch64 {
                    return Err(Unsupported);
                }
                let cond = self.condition(instr.condition_code())?;
                let taken = self.branch_target(instr.near_branch_target());
                let fallthrough = self.branch_target(instr.next_ip());
                self.b.branch(cond, taken, fallthrough);
                return Ok(Flow::Exit);
            }
            Mnemonic::Call => {
                let target = if instr.op_kind(0) == OpKind::NearBranch64 {
                    self.b.iconst(instr.near_branch_target())
                } else {
                    self.source(instr, 0, Width::W64)?
                };
                let ret_addr = self.b.iconst(instr.next_ip());
                self.push(ret_addr);
                self.b.store_state(cpu_state::RIP, Width::W64, target);
                self.b.ret(self.config.call_ret_clobber_flags);
                return Ok(Flow::Exit);
            }
            Mnemonic::Ret => {
                let extra = if instr.op_count() == 1 {
                    instr.immediate(0)
                } else {
                    0
                };
                let target = self.pop(extra);
                self.b.store_state(cpu_state::RIP, Width::W64, target);
                self.b.ret(self.config.call_ret_clobber_flags);
                return Ok(Flow::Exit);
            }
            Mnemonic::Syscall => {
                let next = self.b.iconst(instr.next_ip());
                self.b.store_state(cpu_state::RIP, Width::W64, next);
                self.b.call(impls.syscall);
            }
            Mnemonic::Cpuid => self.b.call(impls.cpuid),
            Mnemonic::Rdtsc => self.b.call(impls.rdtsc),
            Mnemonic::Fldcw => self.b.call(impls.fldcw),
            Mnemonic::Ldmxcsr => self.b.call(impls.ldmxcsr),
            _ => return Err(Unsupported),
        }
        Ok(Flow::Continue)
    }

    fn lift_binary(&mut self, instr: &Instruction) -> LiftResult<()> {
        let dst = self.place(instr, 0)?;
        let width = dst.width();
        let rhs = self.source(instr, 1, width)?;
        let lhs = self.read_place(dst);

        let mnemonic = instr.mnemonic();
        let op = match mnemonic {
            Mnemonic::Add => BinOp::Add,
            Mnemonic::Sub | Mnemonic::Cmp => BinOp::Sub,
            Mnemonic::And | Mnemonic::Test => BinOp::And,
            Mnemonic::Or => BinOp::Or,
            _ => BinOp::Xor,
        };
        let result = self.b.binary(op, lhs, rhs);
        let result = self.mask(result, width);

        match op {
            BinOp::Add => self.set_add_flags(lhs, rhs, result, width, true),
            BinOp::Sub => self.set_sub_flags(lhs, rhs, result, width, true),
            _ => self.set_logic_flags(result, width),
        }

        if !matches!(mnemonic, Mnemonic::Cmp | Mnemonic::Test) {
            self.write_place(dst, result);
        }
        Ok(())
    }

    fn lift_unary(&mut self, instr: &Instruction) -> LiftResult<()> {
        let dst = self.place(instr, 0)?;
        let width = dst.width();
        let value = self.read_place(dst);

        let result = match instr.mnemonic() {
            Mnemonic::Inc | Mnemonic::Dec => {
                let one = self.b.iconst(1);
                let op = if instr.mnemonic() == Mnemonic::Inc {
                    BinOp::Add
                } else {
                    BinOp::Sub
                };
                let result = self.b.binary(op, value, one);
                let result = self.mask(result, width);
                // inc and dec leave CF alone
                if op == BinOp::Add {
                    self.set_add_flags(value, one, result, width, false);
                } else {
                    self.set_sub_flags(value, one, result, width, false);
                }
                result
            }
            Mnemonic::Neg => {
                let zero = self.b.iconst(0);
                let result = self.b.binary(BinOp::Sub, zero, value);
                let result = self.mask(result, width);
                self.set_sub_flags(zero, value, result, width, true);
                result
            }
            // not leaves every flag alone
            _ => self.b.binary_imm(BinOp::Xor, value, width.mask()),
        };
        self.write_place(dst, result);
        Ok(())
    }

    /// Shifts update ZF and SF; CF and OF keep their previous values. A `cl` count that masks
    /// to zero at run time leaves every flag unchanged.
    fn lift_shift(&mut self, instr: &Instruction) -> LiftResult<()> {
        let dst = self.place(instr, 0)?;
        let width = dst.width();
        let count_mask = if width == Width::W64 { 63 } else { 31 };

        let count = match instr.op_kind(1) {
            OpKind::Immediate8 => {
                let count = instr.immediate(1) & count_mask;
                if count == 0 {
                    return Ok(());
                }
                self.b.iconst(count)
            }
            OpKind::Register if instr.op_register(1) == Register::CL => {
                let cl = self.b.load_state(cpu_state::RCX, Width::W8);
                self.b.binary_imm(BinOp::And, cl, count_mask)
            }
            _ => return Err(Unsupported),
        };

        let value = self.read_place(dst);
        let result = match instr.mnemonic() {
            Mnemonic::Shl => self.b.binary(BinOp::Shl, value, count),
            Mnemonic::Shr => self.b.binary(BinOp::Shr, value, count),
            _ => {
                // Sign-extend narrow operands before the arithmetic shift.
                let pad = (64 - width.bits()) as u64;
                let extended = if pad == 0 {
                    value
                } else {
                    let high = self.b.binary_imm(BinOp::Shl, value, pad);
                    self.b.binary_imm(BinOp::Sar, high, pad)
                };
                self.b.binary(BinOp::Sar, extended, count)
            }
        };
        let result = self.mask(result, width);
        if instr.op_kind(1) == OpKind::Immediate8 {
            self.set_zf_sf(result, width);
        } else {
            let zero = self.b.iconst(0);
            let shifted = self.b.cmp(CmpPred::Ne, count, zero);
            let zf = self.b.cmp(CmpPred::Eq, result, zero);
            self.set_flag_if(Flag::Zf, zf, shifted);
            let sf = self.sign_bit(result, width);
            self.set_flag_if(Flag::Sf, sf, shifted);
        }
        self.write_place(dst, result);
        Ok(())
    }
}
