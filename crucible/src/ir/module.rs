//! The Kernel IR itself: a single-entry-function module in SSA
//! form, stored as a dense arena of instructions addressed by integer
//! handles rather than an owning pointer graph: back-edges in control flow
//! are just handles, so the graph stays plain-old-data and cheap to clone.

use crucible_core::atomic::AtomicOp;

use crate::ir::types::ValueType;

/// Handle to an SSA value (= the instruction that defines it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

/// Handle to a basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Math intrinsics. Unary unless noted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MathOp {
    Abs,
    Min,
    Max,
    Clamp,
    Sqrt,
    Rsqrt,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Atan2,
    Sinh,
    Cosh,
    Tanh,
    Exp,
    Exp2,
    Exp10,
    Log,
    Log2,
    Log10,
    Pow,
    Floor,
    Ceiling,
    Truncate,
    Round,
    IsNaN,
    IsInfinity,
    IsFinite,
    PopCount,
    LeadingZeros,
    TrailingZeros,
}

impl MathOp {
    /// Number of value arguments this op consumes.
    pub fn arity(&self) -> usize {
        match self {
            MathOp::Min | MathOp::Max | MathOp::Pow | MathOp::Atan2 => 2,
            MathOp::Clamp => 3,
            _ => 1,
        }
    }
}

/// The associative operator a reduce/scan intrinsic is instantiated with,
/// at the IR level (element-type-erased; the backend/interpreter resolves
/// it to a concrete `ScanReduceOperation<T>` for the value's `ValueType`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOpKind {
    Add,
    Min,
    Max,
    And,
    Or,
    Xor,
}

/// The device-model intrinsic set, as IR opcodes. Argument
/// conventions are documented per-variant; all are collective (every lane
/// in the warp/group must execute the same intrinsic in program order)
/// except the plain index/dimension queries.
#[derive(Debug, Clone, PartialEq)]
pub enum IntrinsicOp {
    GridIndex,
    GridDimension,
    GlobalIndex,
    GroupIndex,
    GroupDimension,
    WarpIndex,
    WarpDimension,
    LaneIndex,
    IsFirstLane,
    /// args: `[predicate]`. Result type matches the predicate's ask:
    /// `GroupBarrier` itself takes no predicate and produces `Unit`.
    GroupBarrier,
    BarrierPopCount,
    BarrierAnd,
    BarrierOr,
    WarpBarrier,
    /// args: `[value, src_lane]`.
    Shuffle { width: Option<i32> },
    /// args: `[value, delta]`.
    ShuffleDown { width: Option<i32> },
    /// args: `[value, delta]`.
    ShuffleUp { width: Option<i32> },
    /// args: `[value, mask]`.
    ShuffleXor { width: Option<i32> },
    /// args: `[value, src_lane]`.
    Broadcast,
    /// args: `[value]`.
    WarpReduce(ReduceOpKind),
    WarpAllReduce(ReduceOpKind),
    WarpExclusiveScan(ReduceOpKind),
    WarpInclusiveScan(ReduceOpKind),
    /// Produces `Struct([T, T])`: `(result, right_boundary)`.
    GroupInclusiveScan(ReduceOpKind),
    GroupExclusiveScan(ReduceOpKind),
    GroupAllReduce(ReduceOpKind),
    /// Allocates `count` elements of `elem` in group-scoped local memory.
    /// Produces an `Array(elem)`-typed value.
    LocalMemoryAllocate { elem: ValueType, count: i64 },
    /// args: `[view, index, operand]` (and `expected` too, for
    /// `CompareExchange`). Produces the element type (the value observed
    /// before the op).
    Atomic(AtomicOp),
    /// args: `[view, index, expected, desired]`.
    AtomicCompareExchange,
}

/// A single SSA instruction. Every instruction defines exactly one value
/// (`id`); instructions with no meaningful result use `ValueType::Unit`.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub id: ValueId,
    pub ty: ValueType,
    pub op: Opcode,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Opcode {
    ConstInt(i64),
    ConstFloat(f64),
    ConstBool(bool),
    /// References the `n`th parameter of the enclosing function.
    Param(u32),
    Arith(ArithOp, ValueId, ValueId),
    Not(ValueId),
    Neg(ValueId),
    Cmp(CmpOp, ValueId, ValueId),
    Select {
        cond: ValueId,
        if_true: ValueId,
        if_false: ValueId,
    },
    /// Narrowing/widening numeric cast to `target`.
    Cast {
        value: ValueId,
        target: ValueType,
    },
    Math(MathOp, Vec<ValueId>),
    Intrinsic(IntrinsicOp, Vec<ValueId>),
    /// Pulls component `index` out of a `Struct`-typed value.
    TupleExtract {
        source: ValueId,
        index: u32,
    },
    ViewLoad {
        view: ValueId,
        index: ValueId,
    },
    /// Produces `Unit`; the only instruction with a write side effect
    /// besides atomics and local-memory writes through `ViewStore` itself.
    ViewStore {
        view: ValueId,
        index: ValueId,
        value: ValueId,
    },
    ViewSubview {
        view: ValueId,
        start: ValueId,
        len: ValueId,
    },
    /// Produces `Array(target)`.
    ViewCast {
        view: ValueId,
        target: ValueType,
    },
    /// Produces `Struct([Array(elem), Array(elem)])`: `(prefix, main)`.
    ViewAlignTo {
        view: ValueId,
        alignment_bytes: i32,
    },
    ViewLen(ValueId),
    ViewStride(ValueId),
    /// SSA join. `incoming[i] = (predecessor block, value in that block)`.
    Phi(Vec<(BlockId, ValueId)>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Return(Option<ValueId>),
    Branch(BlockId),
    CondBranch {
        cond: ValueId,
        if_true: BlockId,
        if_false: BlockId,
    },
    Unreachable,
}

#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: BlockId,
    pub instructions: Vec<ValueId>,
    pub terminator: Terminator,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub ty: ValueType,
}

/// A function body: a graph of basic blocks plus the arena of every
/// instruction defined anywhere in it, addressed by `ValueId`.
#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    pub return_type: ValueType,
    pub blocks: Vec<BasicBlock>,
    pub(crate) values: Vec<Instruction>,
    pub entry_block: BlockId,
}

impl Function {
    pub fn value(&self, id: ValueId) -> &Instruction {
        &self.values[id.0 as usize]
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn value_count(&self) -> usize {
        self.values.len()
    }

    /// Instructions in program order across every block (entry block
    /// first), the iteration order the passes in [`crate::ir::passes`]
    /// rely on.
    pub fn instructions_in_order(&self) -> impl Iterator<Item = &Instruction> + '_ {
        self.blocks
            .iter()
            .flat_map(move |b| b.instructions.iter().map(move |id| self.value(*id)))
    }

    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        match &self.block(block).terminator {
            Terminator::Return(_) | Terminator::Unreachable => Vec::new(),
            Terminator::Branch(target) => vec![*target],
            Terminator::CondBranch { if_true, if_false, .. } => vec![*if_true, *if_false],
        }
    }
}

/// A module: one entry function. The module also carries the registered
/// kernel name used by backends to emit the `.entry`/`__kernel` symbol.
#[derive(Debug, Clone)]
pub struct Module {
    pub entry_name: String,
    pub function: Function,
}

impl Module {
    pub fn entry(&self) -> &Function {
        &self.function
    }
}
