// This module defines the small SSA IR that sits between the lifter and the x86-64 backend.
// A Function either is a declaration (external helper implemented by the client) or owns a
// Body: an instruction arena indexed by Value plus a list of basic blocks that reference
// those instructions in program order. Every function has the same signature, a single
// pointer to the guest CPU state ("sptr"), so calls carry no explicit arguments. Guest
// registers and flags are accessed through LoadState/StoreState at fixed offsets into that
// structure; guest memory is accessed through Load/Store on plain addresses. All values are
// 64 bits wide at the IR level; narrower widths only exist at memory boundaries where loads
// zero-extend and stores truncate.

//! Lifter IR.
//!
//! A deliberately small SSA representation: one signature (`fn(sptr)`), 64-bit values,
//! explicit CPU state accesses. See [`module::Module`] for the persistent container.

use std::fmt;

pub mod builder;
pub mod module;
mod print;

pub use builder::FunctionBuilder;
pub use module::{Module, ModuleError};

/// Stable identity of a function slot in a [`Module`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u32);

/// Index of a basic block within a function body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// Index of an instruction (and its result) within a function body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(pub u32);

impl fmt::Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn{}", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Access width at a memory or CPU state boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    W8,
    W32,
    W64,
}

impl Width {
    pub const fn bytes(self) -> u32 {
        match self {
            Width::W8 => 1,
            Width::W32 => 4,
            Width::W64 => 8,
        }
    }

    pub const fn bits(self) -> u32 {
        self.bytes() * 8
    }

    /// All-ones mask covering the width.
    pub const fn mask(self) -> u64 {
        match self {
            Width::W8 => 0xff,
            Width::W32 => 0xffff_ffff,
            Width::W64 => u64::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
}

impl BinOp {
    pub const fn name(self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Xor => "xor",
            BinOp::Shl => "shl",
            BinOp::Shr => "shr",
            BinOp::Sar => "sar",
        }
    }

    /// Evaluate on constants. Shift counts are masked to 6 bits like the hardware does.
    pub fn eval(self, lhs: u64, rhs: u64) -> u64 {
        match self {
            BinOp::Add => lhs.wrapping_add(rhs),
            BinOp::Sub => lhs.wrapping_sub(rhs),
            BinOp::And => lhs & rhs,
            BinOp::Or => lhs | rhs,
            BinOp::Xor => lhs ^ rhs,
            BinOp::Shl => lhs << (rhs & 63),
            BinOp::Shr => lhs >> (rhs & 63),
            BinOp::Sar => ((lhs as i64) >> (rhs & 63)) as u64,
        }
    }
}

/// Comparison predicate; the result is 0 or 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpPred {
    Eq,
    Ne,
    Ult,
    Slt,
}

impl CmpPred {
    pub const fn name(self) -> &'static str {
        match self {
            CmpPred::Eq => "eq",
            CmpPred::Ne => "ne",
            CmpPred::Ult => "ult",
            CmpPred::Slt => "slt",
        }
    }

    pub fn eval(self, lhs: u64, rhs: u64) -> u64 {
        let result = match self {
            CmpPred::Eq => lhs == rhs,
            CmpPred::Ne => lhs != rhs,
            CmpPred::Ult => lhs < rhs,
            CmpPred::Slt => (lhs as i64) < (rhs as i64),
        };
        result as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Segment {
    Fs,
    Gs,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    Const(u64),
    /// Zero-extending load from the CPU state at `offset`.
    LoadState { offset: u16, width: Width },
    StoreState { offset: u16, width: Width, value: Value },
    /// Zero-extending load from guest memory.
    Load { addr: Value, width: Width },
    Store { addr: Value, value: Value, width: Width },
    Binary { op: BinOp, lhs: Value, rhs: Value },
    Cmp { pred: CmpPred, lhs: Value, rhs: Value },
    /// Host segment base register, used in native segment mode.
    SegmentBase(Segment),
    /// Call another function of the module with the current CPU state pointer.
    Call { callee: FuncId },
}

impl Inst {
    /// Whether the instruction defines a value usable as an operand.
    pub fn has_result(&self) -> bool {
        !matches!(
            self,
            Inst::StoreState { .. } | Inst::Store { .. } | Inst::Call { .. }
        )
    }

    /// Instructions that must not be removed even when their result is unused.
    pub fn has_side_effects(&self) -> bool {
        // Guest loads may fault, so they stay.
        matches!(
            self,
            Inst::StoreState { .. } | Inst::Store { .. } | Inst::Call { .. } | Inst::Load { .. }
        )
    }

    pub fn operands(&self) -> Vec<Value> {
        match *self {
            Inst::Const(_) | Inst::LoadState { .. } | Inst::SegmentBase(_) | Inst::Call { .. } => {
                Vec::new()
            }
            Inst::StoreState { value, .. } => vec![value],
            Inst::Load { addr, .. } => vec![addr],
            Inst::Store { addr, value, .. } => vec![addr, value],
            Inst::Binary { lhs, rhs, .. } | Inst::Cmp { lhs, rhs, .. } => vec![lhs, rhs],
        }
    }

    /// Rewrite every operand through `f`.
    pub fn map_operands(&mut self, mut f: impl FnMut(Value) -> Value) {
        match self {
            Inst::Const(_) | Inst::LoadState { .. } | Inst::SegmentBase(_) | Inst::Call { .. } => {}
            Inst::StoreState { value, .. } => *value = f(*value),
            Inst::Load { addr, .. } => *addr = f(*addr),
            Inst::Store { addr, value, .. } => {
                *addr = f(*addr);
                *value = f(*value);
            }
            Inst::Binary { lhs, rhs, .. } | Inst::Cmp { lhs, rhs, .. } => {
                *lhs = f(*lhs);
                *rhs = f(*rhs);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    /// Block not terminated yet; lowered to a trap.
    Unreachable,
    Jump(BlockId),
    /// Branch to `then_block` if `cond` is non-zero.
    Branch {
        cond: Value,
        then_block: BlockId,
        else_block: BlockId,
    },
    /// Return to the caller. `clobbers_flags` marks exits after which guest flags are dead.
    Return { clobbers_flags: bool },
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match *self {
            Terminator::Jump(target) => vec![target],
            Terminator::Branch {
                then_block,
                else_block,
                ..
            } => vec![then_block, else_block],
            Terminator::Unreachable | Terminator::Return { .. } => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    /// Instructions in program order, as indices into [`Body::insts`].
    pub insts: Vec<Value>,
    pub term: Terminator,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Body {
    pub insts: Vec<Inst>,
    pub blocks: Vec<Block>,
}

impl Body {
    pub fn inst(&self, value: Value) -> &Inst {
        &self.insts[value.0 as usize]
    }

    pub fn block(&self, block: BlockId) -> &Block {
        &self.blocks[block.0 as usize]
    }

    /// Instructions still placed in a block, in block order.
    pub fn placed_insts(&self) -> impl Iterator<Item = (Value, &Inst)> + '_ {
        self.blocks
            .iter()
            .flat_map(|block| block.insts.iter())
            .map(move |&value| (value, self.inst(value)))
    }

    /// Number of calls to `callee` in this body.
    pub fn calls_to(&self, callee: FuncId) -> usize {
        self.placed_insts()
            .filter(|(_, inst)| matches!(inst, Inst::Call { callee: c } if *c == callee))
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    External,
    Private,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub linkage: Linkage,
    pub always_inline: bool,
    /// `None` for declarations.
    pub body: Option<Body>,
}

impl Function {
    pub fn declaration(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            linkage: Linkage::External,
            always_inline: false,
            body: None,
        }
    }

    pub fn is_declaration(&self) -> bool {
        self.body.is_none()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }
}
