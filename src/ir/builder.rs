//! Incremental construction of function bodies.

use super::{BinOp, Block, BlockId, Body, CmpPred, FuncId, Inst, Segment, Terminator, Value, Width};

/// Appends instructions to the current block of a [`Body`].
pub struct FunctionBuilder {
    body: Body,
    current: BlockId,
}

impl FunctionBuilder {
    /// Start a body with an (empty) entry block selected.
    pub fn new() -> Self {
        let mut builder = Self {
            body: Body::default(),
            current: BlockId(0),
        };
        builder.create_block();
        builder
    }

    pub fn create_block(&mut self) -> BlockId {
        let id = BlockId(self.body.blocks.len() as u32);
        self.body.blocks.push(Block {
            insts: Vec::new(),
            term: Terminator::Unreachable,
        });
        id
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    pub fn current_block(&self) -> BlockId {
        self.current
    }

    /// Whether the current block already has its terminator.
    pub fn is_terminated(&self) -> bool {
        self.body.blocks[self.current.0 as usize].term != Terminator::Unreachable
    }

    /// Position in the current block, for [`Self::rollback`].
    pub fn mark(&self) -> usize {
        self.body.blocks[self.current.0 as usize].insts.len()
    }

    /// Drop instructions appended to the current block since `mark`.
    pub fn rollback(&mut self, mark: usize) {
        self.body.blocks[self.current.0 as usize].insts.truncate(mark);
    }

    fn push(&mut self, inst: Inst) -> Value {
        let value = Value(self.body.insts.len() as u32);
        self.body.insts.push(inst);
        self.body.blocks[self.current.0 as usize].insts.push(value);
        value
    }

    fn terminate(&mut self, term: Terminator) {
        self.body.blocks[self.current.0 as usize].term = term;
    }

    pub fn iconst(&mut self, value: u64) -> Value {
        self.push(Inst::Const(value))
    }

    pub fn load_state(&mut self, offset: u16, width: Width) -> Value {
        self.push(Inst::LoadState { offset, width })
    }

    pub fn store_state(&mut self, offset: u16, width: Width, value: Value) {
        self.push(Inst::StoreState {
            offset,
            width,
            value,
        });
    }

    pub fn load(&mut self, addr: Value, width: Width) -> Value {
        self.push(Inst::Load { addr, width })
    }

    pub fn store(&mut self, addr: Value, value: Value, width: Width) {
        self.push(Inst::Store { addr, value, width });
    }

    pub fn binary(&mut self, op: BinOp, lhs: Value, rhs: Value) -> Value {
        self.push(Inst::Binary { op, lhs, rhs })
    }

    /// `lhs op imm` with the immediate materialized as a constant.
    pub fn binary_imm(&mut self, op: BinOp, lhs: Value, imm: u64) -> Value {
        let rhs = self.iconst(imm);
        self.binary(op, lhs, rhs)
    }

    pub fn cmp(&mut self, pred: CmpPred, lhs: Value, rhs: Value) -> Value {
        self.push(Inst::Cmp { pred, lhs, rhs })
    }

    pub fn segment_base(&mut self, segment: Segment) -> Value {
        self.push(Inst::SegmentBase(segment))
    }

    pub fn call(&mut self, callee: FuncId) {
        self.push(Inst::Call { callee });
    }

    pub fn jump(&mut self, target: BlockId) {
        self.terminate(Terminator::Jump(target));
    }

    pub fn branch(&mut self, cond: Value, then_block: BlockId, else_block: BlockId) {
        self.terminate(Terminator::Branch {
            cond,
            then_block,
            else_block,
        });
    }

    pub fn ret(&mut self, clobbers_flags: bool) {
        self.terminate(Terminator::Return { clobbers_flags });
    }

    pub fn finish(self) -> Body {
        self.body
    }
}

impl Default for FunctionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
