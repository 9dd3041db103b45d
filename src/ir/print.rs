//! Textual IR output used by the `debug_dump_ir` toggle.

use super::{Body, Function, Inst, Linkage, Module, Terminator, Width};
use std::fmt;

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.bits())
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inst::Const(value) => write!(f, "const {value:#x}"),
            Inst::LoadState { offset, width } => write!(f, "load.state {width} [sptr+{offset}]"),
            Inst::StoreState {
                offset,
                width,
                value,
            } => write!(f, "store.state {width} [sptr+{offset}], {value}"),
            Inst::Load { addr, width } => write!(f, "load {width} [{addr}]"),
            Inst::Store { addr, value, width } => write!(f, "store {width} [{addr}], {value}"),
            Inst::Binary { op, lhs, rhs } => write!(f, "{} {lhs}, {rhs}", op.name()),
            Inst::Cmp { pred, lhs, rhs } => write!(f, "cmp.{} {lhs}, {rhs}", pred.name()),
            Inst::SegmentBase(segment) => write!(f, "segbase {segment:?}"),
            Inst::Call { callee } => write!(f, "call @{callee}"),
        }
    }
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminator::Unreachable => write!(f, "unreachable"),
            Terminator::Jump(target) => write!(f, "jump {target}"),
            Terminator::Branch {
                cond,
                then_block,
                else_block,
            } => write!(f, "branch {cond}, {then_block}, {else_block}"),
            Terminator::Return { clobbers_flags } => {
                if *clobbers_flags {
                    write!(f, "ret clobber_flags")
                } else {
                    write!(f, "ret")
                }
            }
        }
    }
}

fn write_body(f: &mut fmt::Formatter<'_>, body: &Body) -> fmt::Result {
    for (idx, block) in body.blocks.iter().enumerate() {
        writeln!(f, "b{idx}:")?;
        for &value in &block.insts {
            let inst = body.inst(value);
            if inst.has_result() {
                writeln!(f, "  {value} = {inst}")?;
            } else {
                writeln!(f, "  {inst}")?;
            }
        }
        writeln!(f, "  {}", block.term)?;
    }
    Ok(())
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let linkage = match self.linkage {
            Linkage::External => "external",
            Linkage::Private => "private",
        };
        let inline = if self.always_inline { " alwaysinline" } else { "" };

        match &self.body {
            None => writeln!(f, "declare {linkage} @{}(sptr)", self.name),
            Some(body) => {
                writeln!(f, "define {linkage} @{}(sptr){inline} {{", self.name)?;
                write_body(f, body)?;
                writeln!(f, "}}")
            }
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; module {}", self.name())?;
        for (id, function) in self.functions() {
            writeln!(f, "; {id}")?;
            write!(f, "{function}")?;
        }
        Ok(())
    }
}
