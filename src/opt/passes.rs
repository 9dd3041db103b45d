//! Individual optimization passes. Each returns whether it changed the body.

use crate::ir::{BinOp, Body, Inst, Module, Terminator, Value, Width};
use crate::lifter::cpu_state::{Flag, FLAGS};

/// Resolve `value` through a chain of replacements.
fn resolve(replacements: &[Option<Value>], mut value: Value) -> Value {
    while let Some(Some(next)) = replacements.get(value.0 as usize) {
        value = *next;
    }
    value
}

/// Rewrite every use of a replaced value, including branch conditions.
fn apply_replacements(body: &mut Body, replacements: &[Option<Value>]) {
    for inst in &mut body.insts {
        inst.map_operands(|v| resolve(replacements, v));
    }
    for block in &mut body.blocks {
        if let Terminator::Branch { cond, .. } = &mut block.term {
            *cond = resolve(replacements, *cond);
        }
    }
}

/// Whether `value` is known to be zero above `width`.
fn fits(body: &Body, value: Value, width: Width) -> bool {
    if width == Width::W64 {
        return true;
    }
    let small = |v: Value| matches!(body.inst(v), Inst::Const(c) if *c <= width.mask());
    match *body.inst(value) {
        Inst::Const(c) => c <= width.mask(),
        Inst::Cmp { .. } => true,
        Inst::LoadState { width: w, .. } | Inst::Load { width: w, .. } => w.bytes() <= width.bytes(),
        Inst::Binary {
            op: BinOp::And,
            lhs,
            rhs,
        } => small(lhs) || small(rhs),
        _ => false,
    }
}

fn overlaps(a: u16, a_width: Width, b: u16, b_width: Width) -> bool {
    let a_end = a + a_width.bytes() as u16;
    let b_end = b + b_width.bytes() as u16;
    a < b_end && b < a_end
}

/// Replace calls to always-inline helpers with a copy of their single-block body.
pub(super) fn inline_helpers(body: &mut Body, module: &Module) -> bool {
    let mut changed = false;
    for block_idx in 0..body.blocks.len() {
        let original = std::mem::take(&mut body.blocks[block_idx].insts);
        let mut rewritten = Vec::with_capacity(original.len());

        for value in original {
            let Inst::Call { callee } = *body.inst(value) else {
                rewritten.push(value);
                continue;
            };
            let inlinable = module
                .function(callee)
                .filter(|f| f.always_inline)
                .and_then(|f| f.body.as_ref())
                .filter(|b| {
                    b.blocks.len() == 1 && matches!(b.blocks[0].term, Terminator::Return { .. })
                });
            let Some(helper) = inlinable else {
                rewritten.push(value);
                continue;
            };

            let mut map: Vec<Option<Value>> = vec![None; helper.insts.len()];
            for &helper_value in &helper.blocks[0].insts {
                let mut inst = helper.inst(helper_value).clone();
                inst.map_operands(|v| map[v.0 as usize].unwrap_or(v));
                let copy = Value(body.insts.len() as u32);
                body.insts.push(inst);
                map[helper_value.0 as usize] = Some(copy);
                rewritten.push(copy);
            }
            changed = true;
        }
        body.blocks[block_idx].insts = rewritten;
    }
    changed
}

/// Forward CPU state stores and loads to later loads of the same slot within a block.
pub(super) fn forward_state(body: &mut Body) -> bool {
    let mut replacements: Vec<Option<Value>> = vec![None; body.insts.len()];
    let mut changed = false;

    for block_idx in 0..body.blocks.len() {
        // (offset, width, value) currently held by the state slot
        let mut known: Vec<(u16, Width, Value)> = Vec::new();
        let mut kept = Vec::with_capacity(body.blocks[block_idx].insts.len());

        for &value in &body.blocks[block_idx].insts {
            match *body.inst(value) {
                Inst::LoadState { offset, width } => {
                    let hit = known
                        .iter()
                        .find(|(o, w, _)| *o == offset && *w == width)
                        .map(|&(_, _, v)| v);
                    match hit {
                        Some(v) => {
                            replacements[value.0 as usize] = Some(v);
                            changed = true;
                            continue;
                        }
                        None => known.push((offset, width, value)),
                    }
                }
                Inst::StoreState {
                    offset,
                    width,
                    value: stored,
                } => {
                    let stored = resolve(&replacements, stored);
                    known.retain(|&(o, w, _)| !overlaps(o, w, offset, width));
                    if fits(body, stored, width) {
                        known.push((offset, width, stored));
                    }
                }
                Inst::Call { .. } => known.clear(),
                _ => {}
            }
            kept.push(value);
        }
        body.blocks[block_idx].insts = kept;
    }

    if changed {
        apply_replacements(body, &replacements);
    }
    changed
}

/// Drop flag stores that are overwritten later in the block, or that reach an exit
/// which clobbers flags, without an intervening read.
pub(super) fn dead_flag_stores(body: &mut Body) -> bool {
    let mut changed = false;

    for block_idx in 0..body.blocks.len() {
        let clobbers = matches!(
            body.blocks[block_idx].term,
            Terminator::Return {
                clobbers_flags: true
            }
        );
        let mut dead = [clobbers; Flag::ALL.len()];
        let insts = &body.blocks[block_idx].insts;
        let mut kept = Vec::with_capacity(insts.len());

        for &value in insts.iter().rev() {
            match *body.inst(value) {
                Inst::StoreState {
                    offset,
                    width: Width::W8,
                    ..
                } if Flag::is_flag_offset(offset) => {
                    let idx = (offset - FLAGS) as usize;
                    if dead[idx] {
                        changed = true;
                        continue;
                    }
                    dead[idx] = true;
                }
                Inst::LoadState { offset, width } | Inst::StoreState { offset, width, .. } => {
                    for flag in Flag::ALL {
                        if overlaps(offset, width, flag.offset(), Width::W8) {
                            dead[(flag.offset() - FLAGS) as usize] = false;
                        }
                    }
                }
                // helpers may read the flags
                Inst::Call { .. } => dead = [false; Flag::ALL.len()],
                _ => {}
            }
            kept.push(value);
        }
        kept.reverse();
        body.blocks[block_idx].insts = kept;
    }
    changed
}

fn as_const(insts: &[Inst], value: Value) -> Option<u64> {
    match insts.get(value.0 as usize) {
        Some(Inst::Const(c)) => Some(*c),
        _ => None,
    }
}

/// Evaluate operations on constants and simplify identities.
pub(super) fn const_fold(body: &mut Body) -> bool {
    let mut replacements: Vec<Option<Value>> = vec![None; body.insts.len()];
    let mut changed = false;

    // Operands always precede their users in the arena.
    for idx in 0..body.insts.len() {
        let (before, rest) = body.insts.split_at_mut(idx);
        let inst = &mut rest[0];
        inst.map_operands(|v| resolve(&replacements, v));

        match *inst {
            Inst::Binary { op, lhs, rhs } => {
                match (as_const(before, lhs), as_const(before, rhs)) {
                    (Some(a), Some(b)) => *inst = Inst::Const(op.eval(a, b)),
                    (_, Some(0)) if op != BinOp::And => replacements[idx] = Some(lhs),
                    (_, Some(u64::MAX)) if op == BinOp::And => replacements[idx] = Some(lhs),
                    _ => continue,
                }
                changed = true;
            }
            Inst::Cmp { pred, lhs, rhs } => {
                if let (Some(a), Some(b)) = (as_const(before, lhs), as_const(before, rhs)) {
                    *inst = Inst::Const(pred.eval(a, b));
                    changed = true;
                }
            }
            _ => {}
        }
    }

    for block in &mut body.blocks {
        if let Terminator::Branch {
            cond,
            then_block,
            else_block,
        } = block.term
        {
            let cond = resolve(&replacements, cond);
            if let Some(c) = as_const(&body.insts, cond) {
                block.term = Terminator::Jump(if c != 0 { then_block } else { else_block });
                changed = true;
            }
        }
    }

    if changed {
        apply_replacements(body, &replacements);
    }
    changed
}

/// Remove side-effect free instructions whose results are unused.
pub(super) fn dead_code(body: &mut Body) -> bool {
    let mut changed = false;
    loop {
        let mut used = vec![false; body.insts.len()];
        for (_, inst) in body.placed_insts() {
            for operand in inst.operands() {
                used[operand.0 as usize] = true;
            }
        }
        for block in &body.blocks {
            if let Terminator::Branch { cond, .. } = block.term {
                used[cond.0 as usize] = true;
            }
        }

        let mut removed = false;
        let insts = &body.insts;
        for block in &mut body.blocks {
            block.insts.retain(|&value| {
                let inst = &insts[value.0 as usize];
                let dead = inst.has_result() && !inst.has_side_effects() && !used[value.0 as usize];
                removed |= dead;
                !dead
            });
        }
        if !removed {
            return changed;
        }
        changed = true;
    }
}
