//! The CPU Emulator backend: the reference executor. Unlike the PTX
//! and OpenCL-C backends, this one's "compiled program" is the optimized IR
//! itself — there is no lowering to a second language, so divergence between
//! "what the emulator ran" and "what the IR says" cannot happen. Every
//! `Context` carries one of these regardless of which accelerator a kernel
//! targets, both to execute CPU-class launches and to cross-check GPU
//! backends in tests.
//!
//! Concurrency model: the grid's groups are interpreted one at a time — a
//! bounded-concurrency policy with the bound fixed at 1, which is the
//! simplest instance the Stream & Launcher contract permits. Within a
//! single group, every lane gets a real OS thread (`crossbeam::scope`), and
//! collective intrinsics (barriers, shuffles, broadcasts, warp/group
//! reduce and scan) are implemented with a shared `Barrier` and a small
//! per-lane mailbox: a lane writes its contribution, the whole group
//! rendezvouses, every lane reads whatever mailbox slots it needs, and the
//! group rendezvouses again before any lane is allowed to overwrite its
//! slot for the next collective. This only works if every lane reaches the
//! same collective call at the same point, which is exactly the
//! warp-coherence contract requires: divergence across a collective
//! intrinsic is a contract violation.

use std::sync::{Arc, Barrier, Mutex};

use crucible_core::atomic::AtomicOp;
use crucible_core::error::{CompileStage, Error, Result};

use crate::backend::{argument_layout, static_shared_memory_bytes, Backend, CompiledKernel, CompiledTarget};
use crate::config::{ContextProperties, OptimizationLevel};
use crate::device::{DeviceClass, DeviceInfo};
use crate::fingerprint::Fingerprint;
use crate::ir::module::{
    ArithOp, BlockId, CmpOp, Function, IntrinsicOp, MathOp, Opcode, ReduceOpKind, Terminator, ValueId,
};
use crate::ir::types::ValueType;
use crate::ir::{passes, verifier, Module};
use crate::value::{DynView, RtValue};

pub struct CpuEmulatorBackend;

impl Backend for CpuEmulatorBackend {
    fn device_class(&self) -> DeviceClass {
        DeviceClass::Cpu
    }

    fn compile(
        &self,
        module: &Module,
        _device: &DeviceInfo,
        props: &ContextProperties,
        fingerprint: Fingerprint,
    ) -> Result<CompiledKernel> {
        let mut function = module.function.clone();
        passes::construct_ssa(&mut function);
        passes::inline(&mut function, props.inlining_mode);
        passes::propagate_constants(&mut function, !matches!(props.optimization_level, OptimizationLevel::Debug));
        passes::simplify_cfg(&mut function);
        passes::eliminate_dead_code(&mut function);
        if props.enable_verifier {
            verifier::verify(&function)?;
        }

        let argument_layout = argument_layout(&function);
        let static_shared_memory_bytes = static_shared_memory_bytes(&function);
        let entry_symbol = module.entry_name.clone();
        Ok(CompiledKernel {
            target: CompiledTarget::Interpreted(Arc::new(Module {
                entry_name: entry_symbol.clone(),
                function,
            })),
            entry_symbol,
            argument_layout,
            static_shared_memory_bytes,
            fingerprint,
        })
    }
}

/// Runs `function` over a 1D grid of `grid_size` groups of `group_size`
/// lanes each, `warp_size` lanes per warp. `args` is one [`RtValue`] per
/// declared parameter, shared read-only across every lane. Groups execute
/// strictly in sequence; within a group every lane runs on its own thread.
///
/// Only 1D launches are supported: the only producer of kernel IR in this
/// core, the Scan/Reduce Engine, is itself strictly 1D, and the
/// index-family intrinsics (`GridIndex`, `GroupIndex`, ...) are defined
/// here to report only that single axis.
pub fn execute(
    function: &Function,
    grid_size: i32,
    group_size: i32,
    warp_size: i32,
    args: &[RtValue],
) -> Result<()> {
    if group_size <= 0 || warp_size <= 0 || grid_size < 0 {
        return Err(Error::config_invalid("grid size, group size and warp size must be positive"));
    }
    for grid_index in 0..grid_size {
        run_group(function, grid_index, grid_size, group_size, warp_size, args)?;
    }
    Ok(())
}

struct GroupContext {
    grid_index: i32,
    grid_size: i32,
    group_size: i32,
    warp_size: i32,
    barrier: Barrier,
    mailbox: Vec<Mutex<Option<RtValue>>>,
    local_memory: Mutex<Option<DynView>>,
}

impl GroupContext {
    /// First rendezvous of a two-barrier exchange: publish `value` to this
    /// lane's mailbox slot, then wait for every lane to do the same.
    fn publish(&self, lane: i32, value: RtValue) {
        *self.mailbox[lane as usize].lock().unwrap() = Some(value);
        self.barrier.wait();
    }

    /// Read another lane's published value. Must only be called between the
    /// two `barrier.wait()` calls of an exchange (after `publish`, before
    /// the trailing rendezvous that lets lanes overwrite their slot).
    fn read(&self, lane: i32) -> RtValue {
        self.mailbox[lane as usize].lock().unwrap().clone().expect("lane did not publish before being read")
    }

    /// Second rendezvous: every lane has finished reading what it needs, so
    /// the mailbox is safe to reuse for the next collective.
    fn settle(&self) {
        self.barrier.wait();
    }
}

fn run_group(
    function: &Function,
    grid_index: i32,
    grid_size: i32,
    group_size: i32,
    warp_size: i32,
    args: &[RtValue],
) -> Result<()> {
    let group = GroupContext {
        grid_index,
        grid_size,
        group_size,
        warp_size,
        barrier: Barrier::new(group_size as usize),
        mailbox: (0..group_size).map(|_| Mutex::new(None)).collect(),
        local_memory: Mutex::new(None),
    };

    crossbeam::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(group_size as usize);
        for lane in 0..group_size {
            let group = &group;
            handles.push(scope.spawn(move |_| {
                let mut interp = Interpreter {
                    function,
                    group,
                    lane,
                    args,
                    values: vec![None; function.value_count()],
                };
                interp.run()
            }));
        }
        let mut first_err = None;
        for handle in handles {
            let result = handle.join().expect("emulated lane thread panicked");
            if let Err(e) = result {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    })
    .expect("crossbeam scope join failed")
}

struct Interpreter<'a> {
    function: &'a Function,
    group: &'a GroupContext,
    lane: i32,
    args: &'a [RtValue],
    values: Vec<Option<RtValue>>,
}

impl<'a> Interpreter<'a> {
    fn run(&mut self) -> Result<()> {
        let mut current = self.function.entry_block;
        let mut prev: Option<BlockId> = None;
        loop {
            let block = self.function.block(current);
            let instructions = block.instructions.clone();
            for id in &instructions {
                let value = self.eval(*id, prev)?;
                self.values[id.0 as usize] = Some(value);
            }
            match &self.function.block(current).terminator {
                Terminator::Return(_) => return Ok(()),
                Terminator::Branch(target) => {
                    prev = Some(current);
                    current = *target;
                }
                Terminator::CondBranch { cond, if_true, if_false } => {
                    let taken = self.value(*cond)?.as_bool()?;
                    prev = Some(current);
                    current = if taken { *if_true } else { *if_false };
                }
                Terminator::Unreachable => {
                    return Err(Error::intrinsic_misuse("execution reached an unreachable terminator"));
                }
            }
        }
    }

    fn value(&self, id: ValueId) -> Result<RtValue> {
        self.values[id.0 as usize]
            .clone()
            .ok_or_else(|| Error::compilation_failed(CompileStage::Verification, format!("value %{} read before it was defined", id.0)))
    }

    fn view(&self, id: ValueId) -> Result<DynView> {
        self.value(id)?.as_view().cloned()
    }

    fn eval(&mut self, id: ValueId, prev: Option<BlockId>) -> Result<RtValue> {
        let inst = self.function.value(id).clone();
        match &inst.op {
            Opcode::ConstInt(v) => {
                if inst.ty == ValueType::Int1 {
                    Ok(RtValue::Bool(*v != 0))
                } else {
                    Ok(RtValue::Int(*v))
                }
            }
            Opcode::ConstFloat(v) => Ok(RtValue::Float(*v)),
            Opcode::ConstBool(v) => Ok(RtValue::Bool(*v)),
            Opcode::Param(index) => Ok(self.args[*index as usize].clone()),
            Opcode::Arith(op, a, b) => self.eval_arith(*op, &inst.ty, *a, *b),
            Opcode::Not(v) => Ok(RtValue::Bool(!self.value(*v)?.as_bool()?)),
            Opcode::Neg(v) => match self.value(*v)? {
                RtValue::Int(x) => Ok(RtValue::Int(-x)),
                RtValue::Float(x) => Ok(RtValue::Float(-x)),
                _ => Err(Error::intrinsic_misuse("neg requires a numeric operand")),
            },
            Opcode::Cmp(op, a, b) => self.eval_cmp(*op, *a, *b),
            Opcode::Select { cond, if_true, if_false } => {
                if self.value(*cond)?.as_bool()? { self.value(*if_true) } else { self.value(*if_false) }
            }
            Opcode::Cast { value, target } => self.eval_cast(*value, target),
            Opcode::Math(op, args) => self.eval_math(*op, &inst.ty, args),
            Opcode::Intrinsic(op, args) => self.eval_intrinsic(op, args),
            Opcode::TupleExtract { source, index } => {
                Ok(self.value(*source)?.as_struct()?[*index as usize].clone())
            }
            Opcode::ViewLoad { view, index } => {
                let v = self.view(*view)?;
                let i = self.value(*index)?.as_int()?;
                v.get(i)
            }
            Opcode::ViewStore { view, index, value } => {
                let v = self.view(*view)?;
                let i = self.value(*index)?.as_int()?;
                let val = self.value(*value)?;
                v.set(i, &val)?;
                Ok(RtValue::Unit)
            }
            Opcode::ViewSubview { view, start, len } => {
                let v = self.view(*view)?;
                let s = self.value(*start)?.as_int()?;
                let l = self.value(*len)?.as_int()?;
                Ok(RtValue::View(v.subview(s, l)?))
            }
            Opcode::ViewCast { view, target } => {
                let v = self.view(*view)?;
                Ok(RtValue::View(v.cast_to(target)?))
            }
            Opcode::ViewAlignTo { view, alignment_bytes } => {
                let v = self.view(*view)?;
                let (prefix, main) = v.align_to(*alignment_bytes)?;
                Ok(RtValue::Struct(vec![RtValue::View(prefix), RtValue::View(main)]))
            }
            Opcode::ViewLen(v) => Ok(RtValue::Int(self.view(*v)?.len())),
            Opcode::ViewStride(_) => Ok(RtValue::Int(1)),
            Opcode::Phi(incoming) => {
                let pred = prev.ok_or_else(|| {
                    Error::compilation_failed(CompileStage::Verification, "phi reached with no predecessor block")
                })?;
                let (_, operand) = incoming
                    .iter()
                    .find(|(b, _)| *b == pred)
                    .ok_or_else(|| Error::compilation_failed(CompileStage::Verification, "phi has no entry for the predecessor actually taken"))?;
                self.value(*operand)
            }
        }
    }

    fn eval_arith(&self, op: ArithOp, ty: &ValueType, a: ValueId, b: ValueId) -> Result<RtValue> {
        let (a, b) = (self.value(a)?, self.value(b)?);
        if ty.is_float() {
            let (a, b) = (a.as_float()?, b.as_float()?);
            let v = match op {
                ArithOp::Add => a + b,
                ArithOp::Sub => a - b,
                ArithOp::Mul => a * b,
                ArithOp::Div => a / b,
                ArithOp::Rem => a % b,
                _ => return Err(Error::intrinsic_misuse("bitwise arith op on a float-typed value")),
            };
            Ok(RtValue::Float(v))
        } else {
            let (a, b) = (a.as_int()?, b.as_int()?);
            let v = match op {
                ArithOp::Add => a.wrapping_add(b),
                ArithOp::Sub => a.wrapping_sub(b),
                ArithOp::Mul => a.wrapping_mul(b),
                ArithOp::Div => {
                    if b == 0 {
                        return Err(Error::intrinsic_misuse("integer division by zero"));
                    }
                    a.wrapping_div(b)
                }
                ArithOp::Rem => {
                    if b == 0 {
                        return Err(Error::intrinsic_misuse("integer remainder by zero"));
                    }
                    a.wrapping_rem(b)
                }
                ArithOp::And => a & b,
                ArithOp::Or => a | b,
                ArithOp::Xor => a ^ b,
                ArithOp::Shl => a.wrapping_shl(b as u32),
                ArithOp::Shr => a.wrapping_shr(b as u32),
            };
            Ok(RtValue::Int(v))
        }
    }

    fn eval_cmp(&self, op: CmpOp, a: ValueId, b: ValueId) -> Result<RtValue> {
        let (a, b) = (self.value(a)?, self.value(b)?);
        let ordering = match (&a, &b) {
            (RtValue::Int(x), RtValue::Int(y)) => x.partial_cmp(y),
            (RtValue::Float(x), RtValue::Float(y)) => x.partial_cmp(y),
            (RtValue::Bool(x), RtValue::Bool(y)) => x.partial_cmp(y),
            _ => return Err(Error::intrinsic_misuse("cmp requires two operands of the same scalar type")),
        };
        let Some(ordering) = ordering else {
            // NaN comparisons: every relation but `Ne` is false.
            return Ok(RtValue::Bool(matches!(op, CmpOp::Ne)));
        };
        use std::cmp::Ordering::*;
        let result = match op {
            CmpOp::Eq => ordering == Equal,
            CmpOp::Ne => ordering != Equal,
            CmpOp::Lt => ordering == Less,
            CmpOp::Le => ordering != Greater,
            CmpOp::Gt => ordering == Greater,
            CmpOp::Ge => ordering != Less,
        };
        Ok(RtValue::Bool(result))
    }

    fn eval_cast(&self, value: ValueId, target: &ValueType) -> Result<RtValue> {
        let v = self.value(value)?;
        match (&v, target) {
            (RtValue::Int(x), t) if t.is_float() => Ok(RtValue::Float(*x as f64)),
            (RtValue::Int(x), _) => Ok(RtValue::Int(*x)),
            (RtValue::Float(x), t) if t.is_integral() => Ok(RtValue::Int(*x as i64)),
            (RtValue::Float(x), _) => Ok(RtValue::Float(*x)),
            (RtValue::Bool(b), t) if t.is_integral() => Ok(RtValue::Int(*b as i64)),
            _ => Err(Error::intrinsic_misuse("unsupported scalar cast")),
        }
    }

    /// Integral bit-counting ops and the NaN/Inf/finite predicates read
    /// their argument by its declared kind rather than coercing through
    /// `f64`: a `PopCount` on a value that happens to carry a float bit
    /// pattern would silently produce nonsense, so those two families are
    /// dispatched before the general float path below. `ty` is the
    /// instruction's declared result type, used to decide whether the
    /// general path's `f64` result narrows back to an integer (e.g.
    /// `Floor`/`Round` applied to an integral-typed operand, which is
    /// legal but a no-op).
    fn eval_math(&self, op: MathOp, ty: &ValueType, args: &[ValueId]) -> Result<RtValue> {
        match op {
            MathOp::PopCount | MathOp::LeadingZeros | MathOp::TrailingZeros => {
                let x = self.value(args[0])?.as_int()? as u64;
                let v = match op {
                    MathOp::PopCount => x.count_ones(),
                    MathOp::LeadingZeros => x.leading_zeros(),
                    MathOp::TrailingZeros => x.trailing_zeros(),
                    _ => unreachable!(),
                };
                Ok(RtValue::Int(v as i64))
            }
            MathOp::IsNaN | MathOp::IsInfinity | MathOp::IsFinite => {
                let x = self.value(args[0])?.as_float()?;
                let v = match op {
                    MathOp::IsNaN => x.is_nan(),
                    MathOp::IsInfinity => x.is_infinite(),
                    MathOp::IsFinite => x.is_finite(),
                    _ => unreachable!(),
                };
                Ok(RtValue::Bool(v))
            }
            _ => {
                let operands: Vec<f64> =
                    args.iter().map(|a| self.value(*a).and_then(|v| v.as_float())).collect::<Result<_>>()?;
                let x = operands[0];
                let v = match op {
                    MathOp::Abs => x.abs(),
                    MathOp::Min => x.min(operands[1]),
                    MathOp::Max => x.max(operands[1]),
                    MathOp::Clamp => x.max(operands[1]).min(operands[2]),
                    MathOp::Sqrt => x.sqrt(),
                    MathOp::Rsqrt => 1.0 / x.sqrt(),
                    MathOp::Sin => x.sin(),
                    MathOp::Cos => x.cos(),
                    MathOp::Tan => x.tan(),
                    MathOp::Asin => x.asin(),
                    MathOp::Acos => x.acos(),
                    MathOp::Atan => x.atan(),
                    MathOp::Atan2 => x.atan2(operands[1]),
                    MathOp::Sinh => x.sinh(),
                    MathOp::Cosh => x.cosh(),
                    MathOp::Tanh => x.tanh(),
                    MathOp::Exp => x.exp(),
                    MathOp::Exp2 => x.exp2(),
                    MathOp::Exp10 => 10f64.powf(x),
                    MathOp::Log => x.ln(),
                    MathOp::Log2 => x.log2(),
                    MathOp::Log10 => x.log10(),
                    MathOp::Pow => x.powf(operands[1]),
                    MathOp::Floor => x.floor(),
                    MathOp::Ceiling => x.ceil(),
                    MathOp::Truncate => x.trunc(),
                    MathOp::Round => x.round(),
                    MathOp::PopCount | MathOp::LeadingZeros | MathOp::TrailingZeros
                    | MathOp::IsNaN | MathOp::IsInfinity | MathOp::IsFinite => unreachable!(
                        "handled by the integral/predicate arm above"
                    ),
                };
                if ty.is_integral() {
                    Ok(RtValue::Int(v as i64))
                } else {
                    Ok(RtValue::Float(v))
                }
            }
        }
    }

    fn eval_intrinsic(&self, op: &IntrinsicOp, args: &[ValueId]) -> Result<RtValue> {
        let g = self.group;
        match op {
            IntrinsicOp::GridIndex => Ok(RtValue::Int(g.grid_index as i64)),
            IntrinsicOp::GridDimension => Ok(RtValue::Int(g.grid_size as i64)),
            IntrinsicOp::GroupIndex => Ok(RtValue::Int(self.lane as i64)),
            IntrinsicOp::GroupDimension => Ok(RtValue::Int(g.group_size as i64)),
            IntrinsicOp::GlobalIndex => Ok(RtValue::Int((g.grid_index as i64) * (g.group_size as i64) + self.lane as i64)),
            IntrinsicOp::WarpIndex => Ok(RtValue::Int((self.lane / g.warp_size) as i64)),
            IntrinsicOp::WarpDimension => Ok(RtValue::Int(g.warp_size as i64)),
            IntrinsicOp::LaneIndex => Ok(RtValue::Int((self.lane % g.warp_size) as i64)),
            IntrinsicOp::IsFirstLane => Ok(RtValue::Bool(self.lane % g.warp_size == 0)),

            IntrinsicOp::GroupBarrier => {
                g.barrier.wait();
                Ok(RtValue::Unit)
            }
            IntrinsicOp::BarrierPopCount => {
                let pred = self.value(args[0])?.as_bool()?;
                g.publish(self.lane, RtValue::Bool(pred));
                let count = (0..g.group_size).filter(|&l| g.read(l).as_bool().unwrap_or(false)).count();
                g.settle();
                Ok(RtValue::Int(count as i64))
            }
            IntrinsicOp::BarrierAnd => {
                let pred = self.value(args[0])?.as_bool()?;
                g.publish(self.lane, RtValue::Bool(pred));
                let result = (0..g.group_size).all(|l| g.read(l).as_bool().unwrap_or(false));
                g.settle();
                Ok(RtValue::Bool(result))
            }
            IntrinsicOp::BarrierOr => {
                let pred = self.value(args[0])?.as_bool()?;
                g.publish(self.lane, RtValue::Bool(pred));
                let result = (0..g.group_size).any(|l| g.read(l).as_bool().unwrap_or(false));
                g.settle();
                Ok(RtValue::Bool(result))
            }
            IntrinsicOp::WarpBarrier => {
                // No sub-group barrier primitive exists on a CPU thread
                // pool; the group barrier is a sound (if coarser)
                // substitute since every lane in the group participates.
                g.barrier.wait();
                Ok(RtValue::Unit)
            }

            IntrinsicOp::Shuffle { width } => {
                let value = self.value(args[0])?;
                let source_lane = self.value(args[1])?.as_int()? as i32;
                let width = width.unwrap_or(g.warp_size);
                let warp_base = (self.lane / width) * width;
                g.publish(self.lane, value);
                let result = g.read(warp_base + source_lane.rem_euclid(width));
                g.settle();
                Ok(result)
            }
            IntrinsicOp::ShuffleDown { width } => {
                let value = self.value(args[0])?;
                let delta = self.value(args[1])?.as_int()? as i32;
                let width = width.unwrap_or(g.warp_size);
                let warp_base = (self.lane / width) * width;
                let lane_in_warp = self.lane - warp_base;
                g.publish(self.lane, value.clone());
                let target = lane_in_warp + delta;
                let result = if target < width { g.read(warp_base + target) } else { value };
                g.settle();
                Ok(result)
            }
            IntrinsicOp::ShuffleUp { width } => {
                let value = self.value(args[0])?;
                let delta = self.value(args[1])?.as_int()? as i32;
                let width = width.unwrap_or(g.warp_size);
                let warp_base = (self.lane / width) * width;
                let lane_in_warp = self.lane - warp_base;
                g.publish(self.lane, value.clone());
                let target = lane_in_warp - delta;
                let result = if target >= 0 { g.read(warp_base + target) } else { value };
                g.settle();
                Ok(result)
            }
            IntrinsicOp::ShuffleXor { width } => {
                let value = self.value(args[0])?;
                let mask = self.value(args[1])?.as_int()? as i32;
                let width = width.unwrap_or(g.warp_size);
                let warp_base = (self.lane / width) * width;
                let lane_in_warp = self.lane - warp_base;
                g.publish(self.lane, value);
                let result = g.read(warp_base + (lane_in_warp ^ mask));
                g.settle();
                Ok(result)
            }
            IntrinsicOp::Broadcast => {
                let value = self.value(args[0])?;
                let source_lane = self.value(args[1])?.as_int()? as i32;
                g.publish(self.lane, value);
                let result = g.read(source_lane);
                g.settle();
                Ok(result)
            }

            // `Reduce` and `AllReduce` compute the same fold; hardware only
            // distinguishes them by which lanes receive the result
            // (typically lane 0 only for `Reduce`). The emulator exposes
            // the result to every participating lane for both, which is a
            // superset of what a `Reduce`-only kernel may rely on and
            // therefore never hides a bug a stricter oracle would catch.
            IntrinsicOp::WarpReduce(kind) | IntrinsicOp::WarpAllReduce(kind) => {
                let value = self.value(args[0])?;
                let width = g.warp_size;
                let warp_base = (self.lane / width) * width;
                g.publish(self.lane, value);
                let folded = (warp_base..warp_base + width).map(|l| g.read(l)).try_fold(None, |acc: Option<RtValue>, v| {
                    Ok::<_, Error>(Some(match acc {
                        None => v,
                        Some(a) => fold_reduce(*kind, a, v)?,
                    }))
                })?;
                g.settle();
                Ok(folded.expect("warp width is always positive"))
            }
            IntrinsicOp::WarpExclusiveScan(kind) | IntrinsicOp::WarpInclusiveScan(kind) => {
                let inclusive = matches!(op, IntrinsicOp::WarpInclusiveScan(_));
                let value = self.value(args[0])?;
                let width = g.warp_size;
                let warp_base = (self.lane / width) * width;
                g.publish(self.lane, value);
                let values: Vec<RtValue> = (warp_base..warp_base + width).map(|l| g.read(l)).collect();
                let lane_in_warp = (self.lane - warp_base) as usize;
                let take = if inclusive { lane_in_warp + 1 } else { lane_in_warp };
                let mut acc: Option<RtValue> = None;
                for v in &values[..take] {
                    acc = Some(match acc {
                        None => v.clone(),
                        Some(a) => fold_reduce(*kind, a, v.clone())?,
                    });
                }
                g.settle();
                Ok(acc.unwrap_or_else(|| identity_for(*kind, &values[0])))
            }

            IntrinsicOp::GroupInclusiveScan(kind) | IntrinsicOp::GroupExclusiveScan(kind) => {
                let inclusive = matches!(op, IntrinsicOp::GroupInclusiveScan(_));
                let value = self.value(args[0])?;
                g.publish(self.lane, value);
                let values: Vec<RtValue> = (0..g.group_size).map(|l| g.read(l)).collect();
                let take = if inclusive { self.lane as usize + 1 } else { self.lane as usize };
                let mut running: Option<RtValue> = None;
                for v in &values[..take] {
                    running = Some(match running {
                        None => v.clone(),
                        Some(a) => fold_reduce(*kind, a, v.clone())?,
                    });
                }
                let mut total: Option<RtValue> = None;
                for v in &values {
                    total = Some(match total {
                        None => v.clone(),
                        Some(a) => fold_reduce(*kind, a, v.clone())?,
                    });
                }
                g.settle();
                let scanned = running.unwrap_or_else(|| identity_for(*kind, &values[0]));
                Ok(RtValue::Struct(vec![scanned, total.expect("group size is always positive")]))
            }
            IntrinsicOp::GroupAllReduce(kind) => {
                let value = self.value(args[0])?;
                g.publish(self.lane, value);
                let folded = (0..g.group_size).map(|l| g.read(l)).try_fold(None, |acc: Option<RtValue>, v| {
                    Ok::<_, Error>(Some(match acc {
                        None => v,
                        Some(a) => fold_reduce(*kind, a, v)?,
                    }))
                })?;
                g.settle();
                Ok(folded.expect("group size is always positive"))
            }

            IntrinsicOp::LocalMemoryAllocate { elem, count } => self.allocate_local_memory(elem, *count),

            IntrinsicOp::Atomic(atomic_op) => {
                let view = self.view(args[0])?;
                let index = self.value(args[1])?.as_int()?;
                let operand = self.value(args[2])?;
                view.atomic_rmw(index, *atomic_op, &operand)
            }
            IntrinsicOp::AtomicCompareExchange => {
                let view = self.view(args[0])?;
                let index = self.value(args[1])?.as_int()?;
                let expected = self.value(args[2])?;
                let desired = self.value(args[3])?;
                view.atomic_compare_exchange(index, &expected, &desired)
            }
        }
    }

    /// Lane 0 constructs the shared temporary view and publishes it through
    /// the mailbox; every other lane just reads it back. A plain
    /// `Mutex<Option<DynView>>` (rather than the mailbox) is used here
    /// because the allocation must persist for the rest of the group's
    /// lifetime, not just a single exchange.
    fn allocate_local_memory(&self, elem: &ValueType, count: i64) -> Result<RtValue> {
        let g = self.group;
        if self.lane == 0 {
            let backing = make_local_view(elem, count)?;
            *g.local_memory.lock().unwrap() = Some(backing);
        }
        g.barrier.wait();
        let view = g.local_memory.lock().unwrap().clone().expect("lane 0 always publishes before the barrier releases");
        g.barrier.wait();
        Ok(RtValue::View(view))
    }
}

/// `Op.Identity` for an exclusive scan's lane 0 (which has no predecessors
/// to fold), inferred from whether a sibling value in the same scan is
/// integral or floating-point since `ReduceOpKind` is element-type-erased
/// at the IR level.
fn identity_for(kind: ReduceOpKind, sample: &RtValue) -> RtValue {
    let is_float = matches!(sample, RtValue::Float(_));
    match (kind, is_float) {
        (ReduceOpKind::Add, false) => RtValue::Int(0),
        (ReduceOpKind::Add, true) => RtValue::Float(0.0),
        (ReduceOpKind::Min, false) => RtValue::Int(i64::MAX),
        (ReduceOpKind::Min, true) => RtValue::Float(f64::INFINITY),
        (ReduceOpKind::Max, false) => RtValue::Int(i64::MIN),
        (ReduceOpKind::Max, true) => RtValue::Float(f64::NEG_INFINITY),
        (ReduceOpKind::And, _) => RtValue::Int(-1),
        (ReduceOpKind::Or, _) => RtValue::Int(0),
        (ReduceOpKind::Xor, _) => RtValue::Int(0),
    }
}

fn fold_reduce(kind: ReduceOpKind, a: RtValue, b: RtValue) -> Result<RtValue> {
    match (kind, &a, &b) {
        (ReduceOpKind::Add, RtValue::Int(x), RtValue::Int(y)) => Ok(RtValue::Int(x.wrapping_add(*y))),
        (ReduceOpKind::Add, _, _) => Ok(RtValue::Float(a.as_float()? + b.as_float()?)),
        (ReduceOpKind::Min, RtValue::Int(x), RtValue::Int(y)) => Ok(RtValue::Int((*x).min(*y))),
        (ReduceOpKind::Min, _, _) => Ok(RtValue::Float(a.as_float()?.min(b.as_float()?))),
        (ReduceOpKind::Max, RtValue::Int(x), RtValue::Int(y)) => Ok(RtValue::Int((*x).max(*y))),
        (ReduceOpKind::Max, _, _) => Ok(RtValue::Float(a.as_float()?.max(b.as_float()?))),
        (ReduceOpKind::And, _, _) => Ok(RtValue::Int(a.as_int()? & b.as_int()?)),
        (ReduceOpKind::Or, _, _) => Ok(RtValue::Int(a.as_int()? | b.as_int()?)),
        (ReduceOpKind::Xor, _, _) => Ok(RtValue::Int(a.as_int()? ^ b.as_int()?)),
    }
}

/// Backing storage for a `LocalMemory.Allocate` request: a private buffer
/// that lives only for the group's duration, addressed the same way a
/// kernel argument view would be.
fn make_local_view(elem: &ValueType, count: i64) -> Result<DynView> {
    use crucible_core::view::ArrayView;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex as StdMutex};

    #[derive(Debug)]
    struct LocalBuffer {
        bytes: StdMutex<Vec<u8>>,
        disposed: AtomicBool,
    }
    impl crucible_core::view::MemoryHandle for LocalBuffer {
        fn len_bytes(&self) -> i64 {
            self.bytes.lock().unwrap().len() as i64
        }
        fn is_disposed(&self) -> bool {
            self.disposed.load(Ordering::SeqCst)
        }
        fn identity(&self) -> u64 {
            self as *const _ as u64
        }
        fn read_bytes(&self, byte_offset: i64, len: i64) -> Option<Vec<u8>> {
            let buf = self.bytes.lock().unwrap();
            buf.get(byte_offset as usize..(byte_offset + len) as usize).map(|s| s.to_vec())
        }
        fn write_bytes(&self, byte_offset: i64, data: &[u8]) -> bool {
            let mut buf = self.bytes.lock().unwrap();
            match buf.get_mut(byte_offset as usize..byte_offset as usize + data.len()) {
                Some(slice) => {
                    slice.copy_from_slice(data);
                    true
                }
                None => false,
            }
        }
        fn atomic_rmw(&self, byte_offset: i64, len: i64, op: &mut dyn FnMut(&mut [u8])) -> Option<Vec<u8>> {
            let mut buf = self.bytes.lock().unwrap();
            let slice = buf.get_mut(byte_offset as usize..(byte_offset + len) as usize)?;
            let before = slice.to_vec();
            op(slice);
            Some(before)
        }
    }

    let elem_size = elem.byte_size().ok_or_else(|| Error::config_invalid("local memory element type has no fixed size"))? as usize;
    let handle: Arc<dyn crucible_core::view::MemoryHandle> =
        Arc::new(LocalBuffer { bytes: StdMutex::new(vec![0u8; elem_size * count.max(0) as usize]), disposed: AtomicBool::new(false) });

    match elem {
        ValueType::Int8 => Ok(DynView::I8(ArrayView::from_buffer(handle, count))),
        ValueType::Int16 => Ok(DynView::I16(ArrayView::from_buffer(handle, count))),
        ValueType::Int32 => Ok(DynView::I32(ArrayView::from_buffer(handle, count))),
        ValueType::Int64 => Ok(DynView::I64(ArrayView::from_buffer(handle, count))),
        ValueType::Float32 => Ok(DynView::F32(ArrayView::from_buffer(handle, count))),
        ValueType::Float64 => Ok(DynView::F64(ArrayView::from_buffer(handle, count))),
        other => Err(Error::config_invalid(format!("unsupported local memory element type {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::build_module;
    use crate::ir::module::{ArithOp as A, Terminator as T};

    #[test]
    fn runs_a_trivial_add_kernel_over_every_lane() {
        let module = build_module("add_one", |b| {
            b.set_return_type(ValueType::Unit);
            let out = b.add_param("out", ValueType::Array(Box::new(ValueType::Int32)));
            b.new_block();
            let lane = b.intrinsic(ValueType::Int32, IntrinsicOp::GlobalIndex, vec![]);
            let one = b.const_int(ValueType::Int32, 1);
            let value = b.arith(ValueType::Int32, A::Add, lane, one);
            b.view_store(out, lane, value);
            b.terminate(T::Return(None));
        });

        let buf = crate::buffer::MemoryBuffer::<i32>::allocate(1, 8).unwrap();
        let view = buf.as_view();
        let args = vec![RtValue::View(DynView::I32(view))];
        execute(&module.function, 2, 4, 4, &args).unwrap();

        let mut out = vec![0i32; 8];
        crate::buffer::copy_to_host(&view, &mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4, 1, 2, 3, 4]);
    }

    #[test]
    fn group_barrier_and_all_reduce_agree_across_lanes() {
        let module = build_module("sum_group", |b| {
            b.set_return_type(ValueType::Unit);
            let out = b.add_param("out", ValueType::Array(Box::new(ValueType::Int32)));
            b.new_block();
            let lane = b.intrinsic(ValueType::Int32, IntrinsicOp::GroupIndex, vec![]);
            let one = b.const_int(ValueType::Int32, 1);
            let contribution = b.arith(ValueType::Int32, A::Add, lane, one);
            let total = b.intrinsic(ValueType::Int32, IntrinsicOp::GroupAllReduce(ReduceOpKind::Add), vec![contribution]);
            let idx = b.intrinsic(ValueType::Int32, IntrinsicOp::GroupIndex, vec![]);
            b.view_store(out, idx, total);
            b.terminate(T::Return(None));
        });

        let buf = crate::buffer::MemoryBuffer::<i32>::allocate(1, 4).unwrap();
        let view = buf.as_view();
        let args = vec![RtValue::View(DynView::I32(view))];
        execute(&module.function, 1, 4, 4, &args).unwrap();

        let mut out = vec![0i32; 4];
        crate::buffer::copy_to_host(&view, &mut out).unwrap();
        assert_eq!(out, vec![10, 10, 10, 10]);
    }
}
