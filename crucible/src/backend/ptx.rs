//! The PTX backend: lowers Kernel IR to a textual PTX-flavored
//! sketch. This is not validated against the real PTX ISA grammar — it is
//! the same "acknowledge, do not dispatch" contract as
//! [`crate::backend::opencl`], just with NVIDIA's register/instruction
//! naming instead of OpenCL C's C-like syntax, so a reader can tell which
//! target a given `CompiledTarget::Source` came from.

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

pub struct PtxBackend;

impl Backend for PtxBackend {
    fn device_class(&self) -> DeviceClass {
        DeviceClass::Ptx
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
        let source = emit_entry(&function, &entry_symbol, props);

        Ok(CompiledKernel {
            target: CompiledTarget::Source(source),
            entry_symbol,
            argument_layout,
            static_shared_memory_bytes,
            fingerprint,
        })
    }
}

fn ptx_type(ty: &ValueType) -> &'static str {
    match ty {
        ValueType::Int1 => "pred",
        ValueType::Int8 => "s8",
        ValueType::Int16 => "s16",
        ValueType::Int32 => "s32",
        ValueType::Int64 => "s64",
        ValueType::Float16 | ValueType::Bf16 => "f16",
        ValueType::Float32 => "f32",
        ValueType::Float64 => "f64",
        ValueType::F8E4M3 | ValueType::F8E5M2 => "b8",
        ValueType::Ptr | ValueType::Array(_) => "u64",
        ValueType::Struct(_) => "b64",
        ValueType::Unit => "b0",
    }
}

fn reg(id: ValueId) -> String {
    format!("%r{}", id.0)
}

fn arith_mnemonic(op: ArithOp) -> &'static str {
    match op {
        ArithOp::Add => "add",
        ArithOp::Sub => "sub",
        ArithOp::Mul => "mul.lo",
        ArithOp::Div => "div",
        ArithOp::Rem => "rem",
        ArithOp::And => "and",
        ArithOp::Or => "or",
        ArithOp::Xor => "xor",
        ArithOp::Shl => "shl",
        ArithOp::Shr => "shr",
    }
}

fn cmp_mnemonic(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Eq => "setp.eq",
        CmpOp::Ne => "setp.ne",
        CmpOp::Lt => "setp.lt",
        CmpOp::Le => "setp.le",
        CmpOp::Gt => "setp.gt",
        CmpOp::Ge => "setp.ge",
    }
}

fn math_mnemonic(op: MathOp) -> &'static str {
    match op {
        MathOp::Abs => "abs",
        MathOp::Min => "min",
        MathOp::Max => "max",
        MathOp::Clamp => "clamp",
        MathOp::Sqrt => "sqrt.rn",
        MathOp::Rsqrt => "rsqrt.approx",
        MathOp::Sin => "sin.approx",
        MathOp::Cos => "cos.approx",
        MathOp::Tan => "tan.approx",
        MathOp::Asin => "asin.approx",
        MathOp::Acos => "acos.approx",
        MathOp::Atan => "atan.approx",
        MathOp::Atan2 => "atan2.approx",
        MathOp::Sinh => "sinh.approx",
        MathOp::Cosh => "cosh.approx",
        MathOp::Tanh => "tanh.approx",
        MathOp::Exp => "ex2.approx.scaled",
        MathOp::Exp2 => "ex2.approx",
        MathOp::Exp10 => "ex10.approx",
        MathOp::Log => "lg2.approx.scaled",
        MathOp::Log2 => "lg2.approx",
        MathOp::Log10 => "lg10.approx",
        MathOp::Pow => "pow.approx",
        MathOp::Floor => "cvt.rmi",
        MathOp::Ceiling => "cvt.rpi",
        MathOp::Truncate => "cvt.rzi",
        MathOp::Round => "cvt.rni",
        MathOp::IsNaN => "testp.notanumber",
        MathOp::IsInfinity => "testp.infinite",
        MathOp::IsFinite => "testp.finite",
        MathOp::PopCount => "popc",
        MathOp::LeadingZeros => "clz",
        MathOp::TrailingZeros => "brev.clz",
    }
}

fn reduce_op_suffix(op: ReduceOpKind) -> &'static str {
    match op {
        ReduceOpKind::Add => "add",
        ReduceOpKind::Min => "min",
        ReduceOpKind::Max => "max",
        ReduceOpKind::And => "and",
        ReduceOpKind::Or => "or",
        ReduceOpKind::Xor => "xor",
    }
}

fn emit_intrinsic(op: &IntrinsicOp, args: &[ValueId], dest: ValueId, out: &mut String) {
    let a: Vec<String> = args.iter().map(|id| reg(*id)).collect();
    let dst = reg(dest);
    match op {
        IntrinsicOp::GridIndex | IntrinsicOp::GlobalIndex => {
            let _ = writeln!(out, "    mov.u32 {}, %ctaid.x_abs;", dst);
        }
        IntrinsicOp::GridDimension => {
            let _ = writeln!(out, "    mov.u32 {}, %nctaid.x_total;", dst);
        }
        IntrinsicOp::GroupIndex => {
            let _ = writeln!(out, "    mov.u32 {}, %ctaid.x;", dst);
        }
        IntrinsicOp::GroupDimension => {
            let _ = writeln!(out, "    mov.u32 {}, %ntid.x;", dst);
        }
        IntrinsicOp::WarpIndex => {
            let _ = writeln!(out, "    mov.u32 {}, %warpid;", dst);
        }
        IntrinsicOp::WarpDimension => {
            let _ = writeln!(out, "    mov.u32 {}, WARP_SZ;", dst);
        }
        IntrinsicOp::LaneIndex => {
            let _ = writeln!(out, "    mov.u32 {}, %laneid;", dst);
        }
        IntrinsicOp::IsFirstLane => {
            let _ = writeln!(out, "    setp.eq.u32 {}, %laneid, 0;", dst);
        }
        IntrinsicOp::GroupBarrier => {
            let _ = writeln!(out, "    bar.sync 0;");
        }
        IntrinsicOp::BarrierPopCount => {
            let _ = writeln!(out, "    bar.red.popc.u32 {}, {};", dst, a[0]);
        }
        IntrinsicOp::BarrierAnd => {
            let _ = writeln!(out, "    bar.red.and.pred {}, {};", dst, a[0]);
        }
        IntrinsicOp::BarrierOr => {
            let _ = writeln!(out, "    bar.red.or.pred {}, {};", dst, a[0]);
        }
        IntrinsicOp::WarpBarrier => {
            let _ = writeln!(out, "    bar.warp.sync 0xffffffff;");
        }
        IntrinsicOp::Shuffle { .. } => {
            let _ = writeln!(out, "    shfl.sync.idx.b32 {}, {}, {}, 0x1f, 0xffffffff;", dst, a[0], a[1]);
        }
        IntrinsicOp::ShuffleDown { .. } => {
            let _ = writeln!(out, "    shfl.sync.down.b32 {}, {}, {}, 0x1f, 0xffffffff;", dst, a[0], a[1]);
        }
        IntrinsicOp::ShuffleUp { .. } => {
            let _ = writeln!(out, "    shfl.sync.up.b32 {}, {}, {}, 0x0, 0xffffffff;", dst, a[0], a[1]);
        }
        IntrinsicOp::ShuffleXor { .. } => {
            let _ = writeln!(out, "    shfl.sync.bfly.b32 {}, {}, {}, 0x1f, 0xffffffff;", dst, a[0], a[1]);
        }
        IntrinsicOp::Broadcast => {
            let _ = writeln!(out, "    shfl.sync.idx.b32 {}, {}, {}, 0x1f, 0xffffffff;", dst, a[0], a[1]);
        }
        IntrinsicOp::WarpReduce(k) | IntrinsicOp::WarpAllReduce(k) => {
            let _ = writeln!(out, "    redux.sync.{}.s32 {}, {}, 0xffffffff;", reduce_op_suffix(*k), dst, a[0]);
        }
        IntrinsicOp::WarpExclusiveScan(k) => {
            let _ = writeln!(out, "    // warp.scan.exclusive.{} {}, {}", reduce_op_suffix(*k), dst, a[0]);
        }
        IntrinsicOp::WarpInclusiveScan(k) => {
            let _ = writeln!(out, "    // warp.scan.inclusive.{} {}, {}", reduce_op_suffix(*k), dst, a[0]);
        }
        IntrinsicOp::GroupInclusiveScan(k) | IntrinsicOp::GroupExclusiveScan(k) => {
            let prefix = if matches!(op, IntrinsicOp::GroupInclusiveScan(_)) { "inclusive" } else { "exclusive" };
            let _ = writeln!(
                out,
                "    // group.scan.{}.{} {}.result, {}.right_boundary, {}",
                prefix, reduce_op_suffix(*k), dst, dst, a[0]
            );
        }
        IntrinsicOp::GroupAllReduce(k) => {
            let _ = writeln!(out, "    // group.reduce.{} {}, {}", reduce_op_suffix(*k), dst, a[0]);
        }
        IntrinsicOp::LocalMemoryAllocate { elem, count } => {
            let _ = writeln!(
                out,
                "    .shared .align 4 .b8 {}_storage[{}];",
                dst.trim_start_matches('%'),
                (elem.byte_size().unwrap_or(1) as i64) * count
            );
            let _ = writeln!(out, "    mov.u64 {}, {}_storage;", dst, dst.trim_start_matches('%'));
        }
        IntrinsicOp::Atomic(atomic_op) => {
            let _ = writeln!(
                out,
                "    atom.global.{}.s32 {}, [{}+{}], {};",
                format!("{:?}", atomic_op).to_lowercase(),
                dst,
                a[0],
                a[1],
                a[2]
            );
        }
        IntrinsicOp::AtomicCompareExchange => {
            let _ = writeln!(out, "    atom.global.cas.b32 {}, [{}+{}], {}, {};", dst, a[0], a[1], a[2], a[3]);
        }
    }
}

fn emit_block(function: &Function, block: BlockId, out: &mut String) {
    let _ = writeln!(out, "block_{}:", block.0);
    for &id in &function.block(block).instructions {
        let inst = function.value(id);
        let ty = ptx_type(&inst.ty);
        let dst = reg(id);
        match &inst.op {
            Opcode::ConstInt(n) => {
                let _ = writeln!(out, "    mov.{} {}, {};", ty, dst, n);
            }
            Opcode::ConstFloat(n) => {
                let _ = writeln!(out, "    mov.{} {}, 0d{:016X};", ty, dst, n.to_bits());
            }
            Opcode::ConstBool(b) => {
                let _ = writeln!(out, "    mov.pred {}, {};", dst, if *b { 1 } else { 0 });
            }
            Opcode::Param(index) => {
                let _ = writeln!(out, "    ld.param.{} {}, [param_{}];", ty, dst, index);
            }
            Opcode::Arith(op, lhs, rhs) => {
                let _ = writeln!(out, "    {}.{} {}, {}, {};", arith_mnemonic(*op), ty, dst, reg(*lhs), reg(*rhs));
            }
            Opcode::Not(value) => {
                let _ = writeln!(out, "    not.{} {}, {};", ty, dst, reg(*value));
            }
            Opcode::Neg(value) => {
                let _ = writeln!(out, "    neg.{} {}, {};", ty, dst, reg(*value));
            }
            Opcode::Cmp(op, lhs, rhs) => {
                let _ = writeln!(out, "    {}.{} {}, {}, {};", cmp_mnemonic(*op), ty, dst, reg(*lhs), reg(*rhs));
            }
            Opcode::Select { cond, if_true, if_false } => {
                let _ = writeln!(out, "    selp.{} {}, {}, {}, {};", ty, dst, reg(*if_true), reg(*if_false), reg(*cond));
            }
            Opcode::Cast { value, target } => {
                let _ = writeln!(out, "    cvt.{}.{} {}, {};", ptx_type(target), ty, dst, reg(*value));
            }
            Opcode::Math(op, args) => {
                let call_args: Vec<String> = args.iter().map(|a| reg(*a)).collect();
                let _ = writeln!(out, "    {}.{} {}, {};", math_mnemonic(*op), ty, dst, call_args.join(", "));
            }
            Opcode::Intrinsic(op, args) => emit_intrinsic(op, args, id, out),
            Opcode::TupleExtract { source, index } => {
                let _ = writeln!(out, "    ld.local.{} {}, [{}+{}];", ty, dst, reg(*source), index * 8);
            }
            Opcode::ViewLoad { view, index } => {
                let _ = writeln!(out, "    mad.wide.s32 %addr, {}, {}, {};", reg(*index), inst.ty.byte_size().unwrap_or(4), reg(*view));
                let _ = writeln!(out, "    ld.global.{} {}, [%addr];", ty, dst);
            }
            Opcode::ViewStore { view, index, value } => {
                let _ = writeln!(out, "    mad.wide.s32 %addr, {}, 4, {};", reg(*index), reg(*view));
                let _ = writeln!(out, "    st.global.{} [%addr], {};", ty, reg(*value));
            }
            Opcode::ViewSubview { view, start, len: _ } => {
                let _ = writeln!(out, "    add.u64 {}, {}, {};", dst, reg(*view), reg(*start));
            }
            Opcode::ViewCast { view, target: _ } => {
                let _ = writeln!(out, "    mov.u64 {}, {};", dst, reg(*view));
            }
            Opcode::ViewAlignTo { view, alignment_bytes } => {
                let _ = writeln!(out, "    and.b64 {}, {}, {}; // align {}", dst, reg(*view), -(*alignment_bytes as i64), alignment_bytes);
            }
            Opcode::ViewLen(view) => {
                let _ = writeln!(out, "    ld.global.u64 {}, [{}+-8];", dst, reg(*view));
            }
            Opcode::ViewStride(view) => {
                let _ = writeln!(out, "    ld.global.u64 {}, [{}+-16];", dst, reg(*view));
            }
            Opcode::Phi(incoming) => {
                let _ = writeln!(
                    out,
                    "    // phi {} <- {}",
                    dst,
                    incoming.iter().map(|(b, val)| format!("block_{}:{}", b.0, reg(*val))).collect::<Vec<_>>().join(", ")
                );
            }
        }
    }

    match &function.block(block).terminator {
        Terminator::Return(Some(value)) => {
            let _ = writeln!(out, "    st.param.b64 [retval0], {};", reg(*value));
            let _ = writeln!(out, "    ret;");
        }
        Terminator::Return(None) => {
            let _ = writeln!(out, "    ret;");
        }
        Terminator::Branch(target) => {
            let _ = writeln!(out, "    bra.uni block_{};", target.0);
        }
        Terminator::CondBranch { cond, if_true, if_false } => {
            let _ = writeln!(out, "    @{} bra.uni block_{};", reg(*cond), if_true.0);
            let _ = writeln!(out, "    bra.uni block_{};", if_false.0);
        }
        Terminator::Unreachable => {
            let _ = writeln!(out, "    trap;");
        }
    }
}

fn emit_entry(function: &Function, entry_name: &str, props: &ContextProperties) -> String {
    let mut out = String::new();
    let _ = writeln!(out, ".version 8.0");
    let _ = writeln!(out, ".target sm_80");
    let _ = writeln!(out, ".address_size 64");
    if props.fast_math {
        let _ = writeln!(out, "// fast_math enabled: approximate transcendentals are acceptable");
    }
    let _ = writeln!(out);
    let param_decls: Vec<String> = function
        .params
        .iter()
        .enumerate()
        .map(|(i, p)| format!(".param .{} param_{} // {}", ptx_type(&p.ty), i, p.name))
        .collect();
    let _ = writeln!(out, ".visible .entry {}(", entry_name);
    let _ = writeln!(out, "    {}", param_decls.join(",\n    "));
    let _ = writeln!(out, ")");
    let _ = writeln!(out, "{{");
    for block in &function.blocks {
        emit_block(function, block.id, &mut out);
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
    fn emits_a_versioned_entry_with_an_arithmetic_mnemonic() {
        let module = build_module("add_one", |b| {
            b.set_return_type(ValueType::Int32);
            let p0 = b.add_param("x", ValueType::Int32);
            b.new_block();
            let one = b.const_int(ValueType::Int32, 1);
            let sum = b.arith(ValueType::Int32, ArithOp::Add, p0, one);
            b.terminate(Terminator::Return(Some(sum)));
        });
        let source = emit_entry(&module.function, &module.entry_name, &ContextProperties::new());
        assert!(source.contains(".visible .entry add_one"));
        assert!(source.contains("add.s32"));
        assert!(source.contains("ret;"));
    }

    #[test]
    fn backend_reports_the_ptx_device_class() {
        assert_eq!(PtxBackend.device_class(), DeviceClass::Ptx);
    }
}
