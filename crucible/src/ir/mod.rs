//! Kernel IR: a language-neutral, SSA-form, arena-addressed
//! intermediate representation for a single kernel body, plus its
//! programmatic builder, optional verifier, and transform passes.

pub mod builder;
pub mod module;
pub mod passes;
pub mod types;
pub mod verifier;

pub use builder::{build_module, Builder};
pub use module::{
    ArithOp, BasicBlock, BlockId, CmpOp, Function, Instruction, IntrinsicOp, MathOp, Module,
    Opcode, Param, ReduceOpKind, Terminator, ValueId,
};
pub use types::ValueType;
