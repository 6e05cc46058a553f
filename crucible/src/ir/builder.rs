//! `Builder`: the programmatic construction API for Kernel IR. Capturing a
//! kernel body written in a source language into IR is out of scope;
//! this builder is how the in-core producer of IR — today,
//! only the Scan/Reduce Engine — assembles a function a block at a
//! time while staying in the arena/SSA discipline the IR requires.

use crate::ir::module::{
    ArithOp, BasicBlock, BlockId, CmpOp, Function, Instruction, IntrinsicOp, MathOp, Module,
    Opcode, Param, Terminator, ValueId,
};
use crate::ir::types::ValueType;

pub struct Builder {
    name: String,
    params: Vec<Param>,
    return_type: ValueType,
    values: Vec<Instruction>,
    blocks: Vec<BasicBlock>,
    current: Option<BlockId>,
}

impl Builder {
    pub fn new(name: impl Into<String>) -> Builder {
        Builder {
            name: name.into(),
            params: Vec::new(),
            return_type: ValueType::Unit,
            values: Vec::new(),
            blocks: Vec::new(),
            current: None,
        }
    }

    /// Params are declared before the entry block exists (`new_block` has
    /// not run yet), so they live outside every block's instruction list —
    /// matching how the verifier's `block_of` already treats them as
    /// always-dominating (a `None` block lookup short-circuits the
    /// dominance check rather than failing it).
    pub fn add_param(&mut self, name: impl Into<String>, ty: ValueType) -> ValueId {
        let index = self.params.len() as u32;
        self.params.push(Param { name: name.into(), ty: ty.clone() });
        self.push_free(ty, Opcode::Param(index))
    }

    pub fn set_return_type(&mut self, ty: ValueType) {
        self.return_type = ty;
    }

    /// Starts a new, empty block and makes it current. The caller is
    /// responsible for terminating the previously current block (if any)
    /// before starting another, and for terminating the last block before
    /// calling [`Builder::finish`]; [`crate::ir::verifier::verify`] checks
    /// both.
    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock {
            id,
            instructions: Vec::new(),
            terminator: Terminator::Unreachable,
        });
        self.current = Some(id);
        id
    }

    pub fn current_block(&self) -> BlockId {
        self.current.expect("no current block: call new_block() first")
    }

    pub fn switch_to_block(&mut self, block: BlockId) {
        self.current = Some(block);
    }

    fn push_free(&mut self, ty: ValueType, op: Opcode) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(Instruction { id, ty, op });
        id
    }

    fn push(&mut self, ty: ValueType, op: Opcode) -> ValueId {
        let id = self.push_free(ty, op);
        let block = self.current_block();
        self.blocks[block.0 as usize].instructions.push(id);
        id
    }

    /// The `BlockId` the next `new_block()` call will hand back, for
    /// building a terminator that branches to a block before it exists
    /// (loop headers, forward edges).
    pub fn next_block_id(&self) -> BlockId {
        BlockId(self.blocks.len() as u32)
    }

    /// Reserves a Phi with an empty incoming list, so a loop header can
    /// reference its own value before the loop body (which supplies one of
    /// the incoming edges) has been built. Pair with `set_phi_incoming`
    /// once every incoming block/value is known.
    pub fn reserve_phi(&mut self, ty: ValueType) -> ValueId {
        self.push(ty, Opcode::Phi(Vec::new()))
    }

    /// Fills in a phi reserved with `reserve_phi`. Rewriting `values` in
    /// place is safe here: the phi's position in its block's instruction
    /// list was already fixed at `reserve_phi` time.
    pub fn set_phi_incoming(&mut self, id: ValueId, incoming: Vec<(BlockId, ValueId)>) {
        self.values[id.0 as usize].op = Opcode::Phi(incoming);
    }

    pub fn const_int(&mut self, ty: ValueType, value: i64) -> ValueId {
        debug_assert!(ty.is_integral());
        self.push(ty, Opcode::ConstInt(value))
    }

    pub fn const_float(&mut self, ty: ValueType, value: f64) -> ValueId {
        debug_assert!(ty.is_float());
        self.push(ty, Opcode::ConstFloat(value))
    }

    pub fn const_bool(&mut self, value: bool) -> ValueId {
        self.push(ValueType::Int1, Opcode::ConstBool(value))
    }

    pub fn arith(&mut self, ty: ValueType, op: ArithOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.push(ty, Opcode::Arith(op, lhs, rhs))
    }

    pub fn cmp(&mut self, op: CmpOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.push(ValueType::Int1, Opcode::Cmp(op, lhs, rhs))
    }

    pub fn select(&mut self, ty: ValueType, cond: ValueId, if_true: ValueId, if_false: ValueId) -> ValueId {
        self.push(ty, Opcode::Select { cond, if_true, if_false })
    }

    pub fn cast(&mut self, value: ValueId, target: ValueType) -> ValueId {
        self.push(target.clone(), Opcode::Cast { value, target })
    }

    pub fn math(&mut self, ty: ValueType, op: MathOp, args: Vec<ValueId>) -> ValueId {
        debug_assert_eq!(args.len(), op.arity());
        self.push(ty, Opcode::Math(op, args))
    }

    pub fn intrinsic(&mut self, ty: ValueType, op: IntrinsicOp, args: Vec<ValueId>) -> ValueId {
        self.push(ty, Opcode::Intrinsic(op, args))
    }

    pub fn tuple_extract(&mut self, ty: ValueType, source: ValueId, index: u32) -> ValueId {
        self.push(ty, Opcode::TupleExtract { source, index })
    }

    pub fn view_load(&mut self, ty: ValueType, view: ValueId, index: ValueId) -> ValueId {
        self.push(ty, Opcode::ViewLoad { view, index })
    }

    pub fn view_store(&mut self, view: ValueId, index: ValueId, value: ValueId) -> ValueId {
        self.push(ValueType::Unit, Opcode::ViewStore { view, index, value })
    }

    pub fn view_subview(&mut self, ty: ValueType, view: ValueId, start: ValueId, len: ValueId) -> ValueId {
        self.push(ty, Opcode::ViewSubview { view, start, len })
    }

    pub fn view_len(&mut self, view: ValueId) -> ValueId {
        self.push(ValueType::Int64, Opcode::ViewLen(view))
    }

    pub fn view_stride(&mut self, view: ValueId) -> ValueId {
        self.push(ValueType::Int64, Opcode::ViewStride(view))
    }

    pub fn phi(&mut self, ty: ValueType, incoming: Vec<(BlockId, ValueId)>) -> ValueId {
        self.push(ty, Opcode::Phi(incoming))
    }

    pub fn terminate(&mut self, terminator: Terminator) {
        let block = self.current_block();
        self.blocks[block.0 as usize].terminator = terminator;
    }

    pub fn finish(self) -> Function {
        let entry_block = self.blocks.first().map(|b| b.id).unwrap_or(BlockId(0));
        Function {
            name: self.name,
            params: self.params,
            return_type: self.return_type,
            blocks: self.blocks,
            values: self.values,
            entry_block,
        }
    }
}

/// Builds a complete single-function `Module` with entry symbol
/// `entry_name`.
pub fn build_module(entry_name: impl Into<String>, build: impl FnOnce(&mut Builder)) -> Module {
    let entry_name = entry_name.into();
    let mut builder = Builder::new(entry_name.clone());
    build(&mut builder);
    Module { entry_name, function: builder.finish() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_trivial_add_and_return_function() {
        let module = build_module("add_one", |b| {
            b.set_return_type(ValueType::Int32);
            let p0 = b.add_param("x", ValueType::Int32);
            b.new_block();
            let one = b.const_int(ValueType::Int32, 1);
            let sum = b.arith(ValueType::Int32, ArithOp::Add, p0, one);
            b.terminate(Terminator::Return(Some(sum)));
        });
        assert_eq!(module.function.blocks.len(), 1);
        assert_eq!(module.function.value_count(), 3);
        assert!(matches!(
            module.function.block(module.function.entry_block).terminator,
            Terminator::Return(Some(_))
        ));
    }
}
