//! The optional IR verifier (gated by `ContextProperties::enable_verifier`):
//! checks type consistency and dominance. Running it is cheap relative to
//! a full compile and it is the cheapest way to turn a builder bug into a
//! `CompilationFailed` error instead of a confusing miscompile or panic
//! deep in a backend.

use std::collections::{HashMap, HashSet};

use crucible_core::error::{CompileStage, Error, Result};

use crate::ir::module::{BlockId, Function, Opcode, Terminator, ValueId};
use crate::ir::types::ValueType;

fn fail(detail: impl Into<String>) -> Error {
    Error::compilation_failed(CompileStage::Verification, detail)
}

/// Runs every verifier check against `function`. Returns the first
/// violation found; callers that want every violation should inspect
/// `verify_all` instead.
pub fn verify(function: &Function) -> Result<()> {
    verify_all(function).into_iter().next().map_or(Ok(()), Err)
}

/// Like [`verify`] but collects every violation rather than stopping at
/// the first.
pub fn verify_all(function: &Function) -> Vec<Error> {
    let mut errors = Vec::new();
    check_terminators(function, &mut errors);
    check_operand_bounds(function, &mut errors);
    let dominance = compute_dominance(function);
    check_dominance(function, &dominance, &mut errors);
    check_types(function, &mut errors);
    errors
}

fn check_terminators(function: &Function, errors: &mut Vec<Error>) {
    for block in &function.blocks {
        match &block.terminator {
            Terminator::Branch(target) | Terminator::CondBranch { if_true: target, .. }
                if target.0 as usize >= function.blocks.len() =>
            {
                errors.push(fail(format!(
                    "block {} branches to nonexistent block {}",
                    block.id.0, target.0
                )));
            }
            Terminator::CondBranch { if_false, .. }
                if if_false.0 as usize >= function.blocks.len() =>
            {
                errors.push(fail(format!(
                    "block {} branches to nonexistent block {}",
                    block.id.0, if_false.0
                )));
            }
            _ => {}
        }
    }
}

fn check_operand_bounds(function: &Function, errors: &mut Vec<Error>) {
    let value_count = function.value_count();
    for inst in &function.values {
        for operand in operands_of(&inst.op) {
            if operand.0 as usize >= value_count {
                errors.push(fail(format!(
                    "value %{} references undefined operand %{}",
                    inst.id.0, operand.0
                )));
            }
        }
    }
}

pub(crate) fn operands_of(op: &Opcode) -> Vec<ValueId> {
    match op {
        Opcode::ConstInt(_) | Opcode::ConstFloat(_) | Opcode::ConstBool(_) | Opcode::Param(_) => {
            Vec::new()
        }
        Opcode::Arith(_, a, b) | Opcode::Cmp(_, a, b) => vec![*a, *b],
        Opcode::Not(v) | Opcode::Neg(v) | Opcode::ViewLen(v) | Opcode::ViewStride(v) => vec![*v],
        Opcode::Select { cond, if_true, if_false } => vec![*cond, *if_true, *if_false],
        Opcode::Cast { value, .. } => vec![*value],
        Opcode::Math(_, args) | Opcode::Intrinsic(_, args) => args.clone(),
        Opcode::TupleExtract { source, .. } => vec![*source],
        Opcode::ViewLoad { view, index } => vec![*view, *index],
        Opcode::ViewStore { view, index, value } => vec![*view, *index, *value],
        Opcode::ViewSubview { view, start, len } => vec![*view, *start, *len],
        Opcode::ViewCast { view, .. } => vec![*view],
        Opcode::ViewAlignTo { view, .. } => vec![*view],
        Opcode::Phi(incoming) => incoming.iter().map(|(_, v)| *v).collect(),
    }
}

/// Standard iterative dominator computation over the function's CFG.
/// Returns, for each block, the set of blocks that dominate it (including
/// itself).
fn compute_dominance(function: &Function) -> HashMap<BlockId, HashSet<BlockId>> {
    let all: HashSet<BlockId> = function.blocks.iter().map(|b| b.id).collect();
    let mut dom: HashMap<BlockId, HashSet<BlockId>> = function
        .blocks
        .iter()
        .map(|b| (b.id, if b.id == function.entry_block { [b.id].into() } else { all.clone() }))
        .collect();

    let mut preds: HashMap<BlockId, Vec<BlockId>> = function.blocks.iter().map(|b| (b.id, Vec::new())).collect();
    for block in &function.blocks {
        for succ in function.successors(block.id) {
            preds.entry(succ).or_default().push(block.id);
        }
    }

    let mut changed = true;
    while changed {
        changed = false;
        for block in &function.blocks {
            if block.id == function.entry_block {
                continue;
            }
            let ps = &preds[&block.id];
            let mut new_set = if ps.is_empty() {
                HashSet::new()
            } else {
                let mut iter = ps.iter();
                let mut acc = dom[iter.next().unwrap()].clone();
                for p in iter {
                    acc = acc.intersection(&dom[p]).cloned().collect();
                }
                acc
            };
            new_set.insert(block.id);
            if new_set != dom[&block.id] {
                dom.insert(block.id, new_set);
                changed = true;
            }
        }
    }
    dom
}

fn block_of(function: &Function, value: ValueId) -> Option<BlockId> {
    function
        .blocks
        .iter()
        .find(|b| b.instructions.contains(&value))
        .map(|b| b.id)
}

fn check_dominance(
    function: &Function,
    dominance: &HashMap<BlockId, HashSet<BlockId>>,
    errors: &mut Vec<Error>,
) {
    for block in &function.blocks {
        for (position, &value_id) in block.instructions.iter().enumerate() {
            let inst = function.value(value_id);
            if let Opcode::Phi(incoming) = &inst.op {
                for (pred_block, operand) in incoming {
                    if let Some(def_block) = block_of(function, *operand) {
                        if def_block != *pred_block && !dominance[pred_block].contains(&def_block) {
                            errors.push(fail(format!(
                                "phi %{} operand %{} does not dominate predecessor block {}",
                                value_id.0, operand.0, pred_block.0
                            )));
                        }
                    }
                }
                continue;
            }
            for operand in operands_of(&inst.op) {
                let Some(def_block) = block_of(function, operand) else { continue };
                let dominates_use = if def_block == block.id {
                    block.instructions[..position].contains(&operand)
                } else {
                    dominance[&block.id].contains(&def_block)
                };
                if !dominates_use {
                    errors.push(fail(format!(
                        "value %{} used by %{} before it dominates the use",
                        operand.0, value_id.0
                    )));
                }
            }
        }
    }
}

fn check_types(function: &Function, errors: &mut Vec<Error>) {
    for inst in &function.values {
        match &inst.op {
            Opcode::Arith(_, a, b) => {
                let (ta, tb) = (&function.value(*a).ty, &function.value(*b).ty);
                if ta != &inst.ty || tb != &inst.ty {
                    errors.push(fail(format!(
                        "arith %{} expects operands of type {} but got {} and {}",
                        inst.id.0, inst.ty, ta, tb
                    )));
                }
            }
            Opcode::Cmp(_, a, b) => {
                let (ta, tb) = (&function.value(*a).ty, &function.value(*b).ty);
                if ta != tb {
                    errors.push(fail(format!(
                        "cmp %{} compares mismatched types {} and {}",
                        inst.id.0, ta, tb
                    )));
                }
                if inst.ty != ValueType::Int1 {
                    errors.push(fail(format!("cmp %{} must produce i1", inst.id.0)));
                }
            }
            Opcode::Select { cond, if_true, if_false } => {
                if function.value(*cond).ty != ValueType::Int1 {
                    errors.push(fail(format!("select %{} condition must be i1", inst.id.0)));
                }
                let (tt, tf) = (&function.value(*if_true).ty, &function.value(*if_false).ty);
                if tt != &inst.ty || tf != &inst.ty {
                    errors.push(fail(format!(
                        "select %{} branches disagree with result type {}",
                        inst.id.0, inst.ty
                    )));
                }
            }
            Opcode::ViewStore { value, .. } => {
                // element type is checked dynamically by the interpreter,
                // which knows the view's concrete element type; the IR's
                // `Array(T)` carries that element type already for static
                // producers like `ViewCast`.
                let _ = value;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::build_module;
    use crate::ir::module::{ArithOp, Terminator};

    #[test]
    fn accepts_a_well_formed_function() {
        let module = build_module("ok", |b| {
            b.set_return_type(ValueType::Int32);
            let p0 = b.add_param("x", ValueType::Int32);
            b.new_block();
            let one = b.const_int(ValueType::Int32, 1);
            let sum = b.arith(ValueType::Int32, ArithOp::Add, p0, one);
            b.terminate(Terminator::Return(Some(sum)));
        });
        assert!(verify(&module.function).is_ok());
    }

    #[test]
    fn rejects_value_used_outside_its_defining_branch() {
        let module = build_module("bad_dominance", |b| {
            b.set_return_type(ValueType::Int32);
            let entry = b.new_block();
            let left = b.new_block();
            let right = b.new_block();
            b.switch_to_block(entry);
            let cond = b.const_bool(true);
            b.terminate(Terminator::CondBranch { cond, if_true: left, if_false: right });

            b.switch_to_block(left);
            let only_in_left = b.const_int(ValueType::Int32, 1);
            b.terminate(Terminator::Branch(right));

            // `right` is not dominated by `left`, so using `only_in_left`
            // here (rather than joining it through a Phi) is invalid.
            b.switch_to_block(right);
            b.terminate(Terminator::Return(Some(only_in_left)));
        });
        let errors = verify_all(&module.function);
        assert!(!errors.is_empty());
    }

    #[test]
    fn rejects_mismatched_arith_types() {
        let module = build_module("bad_types", |b| {
            b.set_return_type(ValueType::Int32);
            b.new_block();
            let i = b.const_int(ValueType::Int32, 1);
            let f = b.const_float(ValueType::Float32, 1.0);
            // deliberately mistyped: declares an Int32 result from an
            // Int32/Float32 pair, which check_types should catch.
            let bad = b.arith(ValueType::Int32, ArithOp::Add, i, f);
            b.terminate(Terminator::Return(Some(bad)));
        });
        let errors = verify_all(&module.function);
        assert!(!errors.is_empty());
    }
}
