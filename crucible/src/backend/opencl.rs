//! The OpenCL-C backend: lowers Kernel IR to OpenCL C 1.2/2.0
//! kernel source text. Like [`crate::backend::ptx`], this backend never
//! dispatches the text it produces to a real driver (driver bindings are
//! an external collaborator) — `Stream::launch` just logs and acknowledges
//! a `CompiledTarget::Source` kernel.

use std::fmt::Write as _;

use crucible_core::error::Result;

use crate::backend::{argument_layout, static_shared_memory_bytes, Backend, CompiledKernel, CompiledTarget};
use crate::config::{ContextProperties, OptimizationLevel};
use crate::device::{DeviceClass, DeviceInfo};
use crate::fingerprint::Fingerprint;
use crate::ir::module::{
    ArithOp, BlockId, CmpOp, Function, IntrinsicOp, MathOp, Opcode, ReduceOpKind, Terminator, ValueId,
};
use crate::ir::types::ValueType;
use crate::ir::{passes, verifier, Module};

pub struct OpenClBackend;

impl Backend for OpenClBackend {
    fn device_class(&self) -> DeviceClass {
        DeviceClass::OpenCl
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
        let source = emit_kernel(&function, &entry_symbol);

        Ok(CompiledKernel {
            target: CompiledTarget::Source(source),
            entry_symbol,
            argument_layout,
            static_shared_memory_bytes,
            fingerprint,
        })
    }
}

fn c_type(ty: &ValueType) -> String {
    match ty {
        ValueType::Int1 => "bool".to_string(),
        ValueType::Int8 => "char".to_string(),
        ValueType::Int16 => "short".to_string(),
        ValueType::Int32 => "int".to_string(),
        ValueType::Int64 => "long".to_string(),
        ValueType::Float16 => "half".to_string(),
        ValueType::Float32 => "float".to_string(),
        ValueType::Float64 => "double".to_string(),
        ValueType::Bf16 => "ushort".to_string(),
        ValueType::F8E4M3 | ValueType::F8E5M2 => "uchar".to_string(),
        ValueType::Ptr => "void*".to_string(),
        ValueType::Array(elem) => format!("__global {}*", c_type(elem)),
        ValueType::Struct(_) => "void*".to_string(),
        ValueType::Unit => "void".to_string(),
    }
}

fn v(id: ValueId) -> String {
    format!("v{}", id.0)
}

fn arith_op(op: ArithOp) -> &'static str {
    match op {
        ArithOp::Add => "+",
        ArithOp::Sub => "-",
        ArithOp::Mul => "*",
        ArithOp::Div => "/",
        ArithOp::Rem => "%",
        ArithOp::And => "&",
        ArithOp::Or => "|",
        ArithOp::Xor => "^",
        ArithOp::Shl => "<<",
        ArithOp::Shr => ">>",
    }
}

fn cmp_op(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Eq => "==",
        CmpOp::Ne => "!=",
        CmpOp::Lt => "<",
        CmpOp::Le => "<=",
        CmpOp::Gt => ">",
        CmpOp::Ge => ">=",
    }
}

fn math_call(op: MathOp) -> &'static str {
    match op {
        MathOp::Abs => "fabs",
        MathOp::Min => "min",
        MathOp::Max => "max",
        MathOp::Clamp => "clamp",
        MathOp::Sqrt => "sqrt",
        MathOp::Rsqrt => "rsqrt",
        MathOp::Sin => "sin",
        MathOp::Cos => "cos",
        MathOp::Tan => "tan",
        MathOp::Asin => "asin",
        MathOp::Acos => "acos",
        MathOp::Atan => "atan",
        MathOp::Atan2 => "atan2",
        MathOp::Sinh => "sinh",
        MathOp::Cosh => "cosh",
        MathOp::Tanh => "tanh",
        MathOp::Exp => "exp",
        MathOp::Exp2 => "exp2",
        MathOp::Exp10 => "exp10",
        MathOp::Log => "log",
        MathOp::Log2 => "log2",
        MathOp::Log10 => "log10",
        MathOp::Pow => "pow",
        MathOp::Floor => "floor",
        MathOp::Ceiling => "ceil",
        MathOp::Truncate => "trunc",
        MathOp::Round => "round",
        MathOp::IsNaN => "isnan",
        MathOp::IsInfinity => "isinf",
        MathOp::IsFinite => "isfinite",
        MathOp::PopCount => "popcount",
        MathOp::LeadingZeros => "clz",
        MathOp::TrailingZeros => "ctz",
    }
}

fn reduce_op_builtin(op: ReduceOpKind) -> &'static str {
    match op {
        ReduceOpKind::Add => "add",
        ReduceOpKind::Min => "min",
        ReduceOpKind::Max => "max",
        ReduceOpKind::And => "and",
        ReduceOpKind::Or => "or",
        ReduceOpKind::Xor => "xor",
    }
}

/// Lowers one collective/index intrinsic to an OpenCL built-in call or
/// extension-style function name. Sub-group collectives (`Shuffle*`,
/// `*Reduce`, `*Scan`) map to the `cl_khr_subgroups`/`cl_intel_subgroups`
/// extension surface; group-wide collectives are expressed in terms of
/// `__local` scratch this emitter declares alongside the kernel.
fn emit_intrinsic(op: &IntrinsicOp, args: &[ValueId], dest: ValueId, out: &mut String) {
    let a: Vec<String> = args.iter().map(|id| v(*id)).collect();
    match op {
        IntrinsicOp::GridIndex | IntrinsicOp::GlobalIndex => {
            let _ = writeln!(out, "    int {} = get_global_id(0);", v(dest));
        }
        IntrinsicOp::GridDimension => {
            let _ = writeln!(out, "    int {} = get_global_size(0);", v(dest));
        }
        IntrinsicOp::GroupIndex => {
            let _ = writeln!(out, "    int {} = get_group_id(0);", v(dest));
        }
        IntrinsicOp::GroupDimension => {
            let _ = writeln!(out, "    int {} = get_local_size(0);", v(dest));
        }
        IntrinsicOp::WarpIndex => {
            let _ = writeln!(out, "    int {} = get_sub_group_id();", v(dest));
        }
        IntrinsicOp::WarpDimension => {
            let _ = writeln!(out, "    int {} = get_sub_group_size();", v(dest));
        }
        IntrinsicOp::LaneIndex => {
            let _ = writeln!(out, "    int {} = get_sub_group_local_id();", v(dest));
        }
        IntrinsicOp::IsFirstLane => {
            let _ = writeln!(out, "    bool {} = (get_sub_group_local_id() == 0);", v(dest));
        }
        IntrinsicOp::GroupBarrier => {
            let _ = writeln!(out, "    barrier(CLK_LOCAL_MEM_FENCE);");
        }
        IntrinsicOp::BarrierPopCount => {
            let _ = writeln!(out, "    int {} = work_group_reduce_add((int){});", v(dest), a[0]);
        }
        IntrinsicOp::BarrierAnd => {
            let _ = writeln!(out, "    bool {} = work_group_all({});", v(dest), a[0]);
        }
        IntrinsicOp::BarrierOr => {
            let _ = writeln!(out, "    bool {} = work_group_any({});", v(dest), a[0]);
        }
        IntrinsicOp::WarpBarrier => {
            let _ = writeln!(out, "    sub_group_barrier(CLK_LOCAL_MEM_FENCE);");
        }
        IntrinsicOp::Shuffle { .. } => {
            let _ = writeln!(out, "    {} = sub_group_shuffle({}, {});", v(dest), a[0], a[1]);
        }
        IntrinsicOp::ShuffleDown { .. } => {
            let _ = writeln!(out, "    {} = sub_group_shuffle_down({}, {});", v(dest), a[0], a[1]);
        }
        IntrinsicOp::ShuffleUp { .. } => {
            let _ = writeln!(out, "    {} = sub_group_shuffle_up({}, {});", v(dest), a[0], a[1]);
        }
        IntrinsicOp::ShuffleXor { .. } => {
            let _ = writeln!(out, "    {} = sub_group_shuffle_xor({}, {});", v(dest), a[0], a[1]);
        }
        IntrinsicOp::Broadcast => {
            let _ = writeln!(out, "    {} = sub_group_broadcast({}, {});", v(dest), a[0], a[1]);
        }
        IntrinsicOp::WarpReduce(k) | IntrinsicOp::WarpAllReduce(k) => {
            let _ = writeln!(out, "    {} = sub_group_reduce_{}({});", v(dest), reduce_op_builtin(*k), a[0]);
        }
        IntrinsicOp::WarpExclusiveScan(k) => {
            let _ = writeln!(out, "    {} = sub_group_scan_exclusive_{}({});", v(dest), reduce_op_builtin(*k), a[0]);
        }
        IntrinsicOp::WarpInclusiveScan(k) => {
            let _ = writeln!(out, "    {} = sub_group_scan_inclusive_{}({});", v(dest), reduce_op_builtin(*k), a[0]);
        }
        IntrinsicOp::GroupInclusiveScan(k) | IntrinsicOp::GroupExclusiveScan(k) => {
            let prefix = if matches!(op, IntrinsicOp::GroupInclusiveScan(_)) { "inclusive" } else { "exclusive" };
            let _ = writeln!(
                out,
                "    {} = (struct {{ typeof({}) result, right_boundary; }}){{ work_group_scan_{}_{}({}), work_group_reduce_{}({}) }};",
                v(dest), a[0], prefix, reduce_op_builtin(*k), a[0], reduce_op_builtin(*k), a[0]
            );
        }
        IntrinsicOp::GroupAllReduce(k) => {
            let _ = writeln!(out, "    {} = work_group_reduce_{}({});", v(dest), reduce_op_builtin(*k), a[0]);
        }
        IntrinsicOp::LocalMemoryAllocate { elem, count } => {
            let _ = writeln!(out, "    __local {} {}[{}];", c_type(elem), v(dest), count);
        }
        IntrinsicOp::Atomic(atomic_op) => {
            let _ = writeln!(
                out,
                "    {} = atomic_{}(&{}[{}], {});",
                v(dest),
                format!("{:?}", atomic_op).to_lowercase(),
                a[0],
                a[1],
                a[2]
            );
        }
        IntrinsicOp::AtomicCompareExchange => {
            let _ = writeln!(
                out,
                "    {} = atomic_cmpxchg(&{}[{}], {}, {});",
                v(dest), a[0], a[1], a[2], a[3]
            );
        }
    }
}

fn emit_block_body(function: &Function, block: BlockId, out: &mut String) {
    let _ = writeln!(out, "block_{}:", block.0);
    for &id in &function.block(block).instructions {
        let inst = function.value(id);
        let ty = c_type(&inst.ty);
        match &inst.op {
            Opcode::ConstInt(n) => {
                let _ = writeln!(out, "    {} {} = {};", ty, v(id), n);
            }
            Opcode::ConstFloat(n) => {
                let _ = writeln!(out, "    {} {} = {};", ty, v(id), n);
            }
            Opcode::ConstBool(b) => {
                let _ = writeln!(out, "    {} {} = {};", ty, v(id), b);
            }
            Opcode::Param(index) => {
                let _ = writeln!(out, "    {} {} = p{};", ty, v(id), index);
            }
            Opcode::Arith(op, lhs, rhs) => {
                let _ = writeln!(out, "    {} {} = {} {} {};", ty, v(id), v(*lhs), arith_op(*op), v(*rhs));
            }
            Opcode::Not(value) => {
                let _ = writeln!(out, "    {} {} = !{};", ty, v(id), v(*value));
            }
            Opcode::Neg(value) => {
                let _ = writeln!(out, "    {} {} = -{};", ty, v(id), v(*value));
            }
            Opcode::Cmp(op, lhs, rhs) => {
                let _ = writeln!(out, "    {} {} = {} {} {};", ty, v(id), v(*lhs), cmp_op(*op), v(*rhs));
            }
            Opcode::Select { cond, if_true, if_false } => {
                let _ = writeln!(out, "    {} {} = {} ? {} : {};", ty, v(id), v(*cond), v(*if_true), v(*if_false));
            }
            Opcode::Cast { value, target } => {
                let _ = writeln!(out, "    {} {} = ({}){};", ty, v(id), c_type(target), v(*value));
            }
            Opcode::Math(op, args) => {
                let call_args: Vec<String> = args.iter().map(|a| v(*a)).collect();
                let _ = writeln!(out, "    {} {} = {}({});", ty, v(id), math_call(*op), call_args.join(", "));
            }
            Opcode::Intrinsic(op, args) => emit_intrinsic(op, args, id, out),
            Opcode::TupleExtract { source, index } => {
                let field = ["result", "right_boundary"].get(*index as usize).copied().unwrap_or("field");
                let _ = writeln!(out, "    {} {} = {}.{};", ty, v(id), v(*source), field);
            }
            Opcode::ViewLoad { view, index } => {
                let _ = writeln!(out, "    {} {} = {}[{}];", ty, v(id), v(*view), v(*index));
            }
            Opcode::ViewStore { view, index, value } => {
                let _ = writeln!(out, "    {}[{}] = {};", v(*view), v(*index), v(*value));
            }
            Opcode::ViewSubview { view, start, len: _ } => {
                let _ = writeln!(out, "    {} {} = {} + {};", ty, v(id), v(*view), v(*start));
            }
            Opcode::ViewCast { view, target } => {
                let _ = writeln!(out, "    {} {} = ({}*){};", ty, v(id), c_type(target), v(*view));
            }
            Opcode::ViewAlignTo { view, alignment_bytes } => {
                let _ = writeln!(
                    out,
                    "    {} {} = {{ {}, {} }}; // aligned to {} bytes",
                    ty, v(id), v(*view), v(*view), alignment_bytes
                );
            }
            Opcode::ViewLen(view) => {
                let _ = writeln!(out, "    long {} = (long){}_len;", v(id), v(*view));
            }
            Opcode::ViewStride(view) => {
                let _ = writeln!(out, "    long {} = (long){}_stride;", v(id), v(*view));
            }
            Opcode::Phi(incoming) => {
                let branches: Vec<String> =
                    incoming.iter().map(|(b, val)| format!("/* from block_{} */ {}", b.0, v(*val))).collect();
                let _ = writeln!(out, "    {} {}; // phi({})", ty, v(id), branches.join(", "));
            }
        }
    }

    match &function.block(block).terminator {
        Terminator::Return(Some(value)) => {
            let _ = writeln!(out, "    return {};", v(*value));
        }
        Terminator::Return(None) => {
            let _ = writeln!(out, "    return;");
        }
        Terminator::Branch(target) => {
            let _ = writeln!(out, "    goto block_{};", target.0);
        }
        Terminator::CondBranch { cond, if_true, if_false } => {
            let _ = writeln!(out, "    if ({}) goto block_{}; else goto block_{};", v(*cond), if_true.0, if_false.0);
        }
        Terminator::Unreachable => {
            let _ = writeln!(out, "    __builtin_unreachable();");
        }
    }
}

fn emit_kernel(function: &Function, entry_name: &str) -> String {
    let mut out = String::new();
    let params: Vec<String> =
        function.params.iter().enumerate().map(|(i, p)| format!("{} p{}", c_type(&p.ty), i)).collect();
    let _ = writeln!(out, "__kernel void {}({}) {{", entry_name, params.join(", "));
    for block in &function.blocks {
        emit_block_body(function, block.id, &mut out);
    }
    let _ = writeln!(out, "}}");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::build_module;
    use crate::ir::module::{ArithOp, Terminator};

    #[test]
    fn emits_a_kernel_wrapper_and_an_arithmetic_line() {
        let module = build_module("add_one", |b| {
            b.set_return_type(ValueType::Int32);
            let p0 = b.add_param("x", ValueType::Int32);
            b.new_block();
            let one = b.const_int(ValueType::Int32, 1);
            let sum = b.arith(ValueType::Int32, ArithOp::Add, p0, one);
            b.terminate(Terminator::Return(Some(sum)));
        });
        let source = emit_kernel(&module.function, &module.entry_name);
        assert!(source.contains("__kernel void add_one"));
        assert!(source.contains(" + "));
        assert!(source.contains("return"));
    }

    #[test]
    fn backend_reports_the_opencl_device_class() {
        assert_eq!(OpenClBackend.device_class(), DeviceClass::OpenCl);
    }
}
