//! Scan/Reduce Engine: the canonical hardest consumer of the whole
//! pipeline. Builds Kernel IR by hand (there is no kernel-source frontend)
//! for three module shapes — a right-boundary pass, a finalize
//! pass, and a single-pass variant — declares them against a [`Context`],
//! and launches them through a [`Stream`] to compute an inclusive or
//! exclusive scan of an associative [`ScanReduceOperation<T>`] over a
//! source view into a target view.
//!
//! The tiling model: a grid of `grid_dim.x` groups, each owning a
//! contiguous tile of `group_dim.x * iterations_per_group` elements. Lane
//! `t` of group `g` starts at `g * tile_size + t` and steps by
//! `group_dim.x` each sweep. Two strategies cover a tile's cross-group
//! dependency (every element's scanned value depends on every element
//! before it, not just its own tile):
//!
//! - Multi-pass (devices without `supports_single_pass_scan`): pass 1
//!   computes each group's tile total into a `group_right_boundaries`
//!   buffer; pass 2 has every group redundantly scan that whole buffer to
//!   learn its own exclusive prefix, then streams its tile into `target`
//!   starting from that prefix.
//! - Single-pass (`SequentialGroupExecutor`, devices with
//!   `supports_single_pass_scan`): groups take turns publishing a running
//!   total to one shared scalar, gated by a spin-wait on a turn counter;
//!   each group streams its tile the moment it observes its turn, folding
//!   boundary computation and output writing into one pass.

use crucible_core::error::{Error, Result};
use crucible_core::ops::ScanReduceOperation;
use crucible_core::view::{ArrayView, ViewElement};
use crucible_core::Index3D;

use crate::buffer::copy_from_host;
use crate::context::{Context, KernelHandle};
use crate::device::{DeviceClass, DeviceInfo};
use crate::ir::builder::{build_module, Builder};
use crate::ir::module::{ArithOp, CmpOp, IntrinsicOp, ReduceOpKind, Terminator, ValueId};
use crate::ir::types::ValueType;
use crate::ir::Module;
use crate::stream::{arg_view, compute_grid_stride_kernel_config, AllocationBuilder, KernelConfig, Stream};
use crate::value::{IntoDynView, IntoRtValue, RtValue};

/// Bridges a host-side [`ScanReduceOperation<T>`] marker type to the
/// element-type-erased [`ReduceOpKind`] the IR's collective scan/reduce
/// intrinsics carry. A kernel author supplies a concrete op (`AddOp`,
/// `MinOp`, ...), the same way [`crucible_core::ops`]'s own tests do;
/// `KIND` is what lets the engine pick the matching intrinsic once `T` and
/// `Op` are known.
pub trait KernelOperator<T>: ScanReduceOperation<T> {
    const KIND: ReduceOpKind;
}

macro_rules! kernel_operator {
    ($op:path, $kind:expr) => {
        impl<T> KernelOperator<T> for $op
        where
            $op: ScanReduceOperation<T>,
        {
            const KIND: ReduceOpKind = $kind;
        }
    };
}

kernel_operator!(crucible_core::ops::AddOp, ReduceOpKind::Add);
kernel_operator!(crucible_core::ops::MinOp, ReduceOpKind::Min);
kernel_operator!(crucible_core::ops::MaxOp, ReduceOpKind::Max);
kernel_operator!(crucible_core::ops::AndOp, ReduceOpKind::And);
kernel_operator!(crucible_core::ops::OrOp, ReduceOpKind::Or);
kernel_operator!(crucible_core::ops::XorOp, ReduceOpKind::Xor);

/// Every bound a scan element type needs: storage (`ViewElement`),
/// marshalling into a kernel argument (`IntoDynView`), and converting a
/// host-computed `Op.Identity()`/`Op.Apply()` result into an IR constant
/// (`IntoRtValue`).
pub trait ScanElement: ViewElement + IntoDynView + IntoRtValue {}
impl<T: ViewElement + IntoDynView + IntoRtValue> ScanElement for T {}

/// Combines two partial fold results at the IR level. `Add`/`And`/`Or`/
/// `Xor` go through plain `Arith`; `Min`/`Max` go through `Cmp` + `Select`
/// rather than `MathOp::Min`/`Max` (the interpreter's `eval_math` coerces
/// both operands through `as_float`, which fails for an integral value).
fn apply_reduce(b: &mut Builder, ty: ValueType, kind: ReduceOpKind, lhs: ValueId, rhs: ValueId) -> ValueId {
    match kind {
        ReduceOpKind::Add => b.arith(ty, ArithOp::Add, lhs, rhs),
        ReduceOpKind::And => b.arith(ty, ArithOp::And, lhs, rhs),
        ReduceOpKind::Or => b.arith(ty, ArithOp::Or, lhs, rhs),
        ReduceOpKind::Xor => b.arith(ty, ArithOp::Xor, lhs, rhs),
        ReduceOpKind::Min => {
            let cond = b.cmp(CmpOp::Lt, lhs, rhs);
            b.select(ty, cond, lhs, rhs)
        }
        ReduceOpKind::Max => {
            let cond = b.cmp(CmpOp::Gt, lhs, rhs);
            b.select(ty, cond, lhs, rhs)
        }
    }
}

fn emit_const(b: &mut Builder, ty: &ValueType, value: &RtValue) -> ValueId {
    match value {
        RtValue::Int(v) => b.const_int(ty.clone(), *v),
        RtValue::Float(v) => b.const_float(ty.clone(), *v),
        other => unreachable!("scan op identities are always scalar ints or floats, got {other:?}"),
    }
}

/// Emits `if cond { body }` with no else, as a one-sided branch around a
/// side-effecting `body` (typically a guarded store). Returns with the
/// builder positioned in the merge block.
fn emit_guarded(b: &mut Builder, cond: ValueId, body: impl FnOnce(&mut Builder)) {
    let guard_block = b.current_block();
    let then_id = b.new_block();
    body(b);
    let after_id = b.next_block_id();
    b.terminate(Terminator::Branch(after_id));
    b.new_block();

    b.switch_to_block(guard_block);
    b.terminate(Terminator::CondBranch { cond, if_true: then_id, if_false: after_id });
    b.switch_to_block(after_id);
}

/// Emits `while !check() { }`: a self-looping header block with no
/// separate body, re-evaluating `check` on every visit. No collective
/// intrinsic may run inside `check` — lanes are allowed to resolve the
/// spin after a different number of iterations (they always do so in
/// lockstep on a backend that runs groups strictly in sequence, but need
/// not on real concurrent hardware), and a collective requires every lane
/// to reach it at the same point in program order.
fn emit_spin_wait(b: &mut Builder, check: impl FnOnce(&mut Builder) -> ValueId) {
    let header_id = b.next_block_id();
    b.terminate(Terminator::Branch(header_id));
    b.new_block();
    let cond = check(b);
    let after_id = b.next_block_id();
    b.terminate(Terminator::CondBranch { cond, if_true: after_id, if_false: header_id });
    b.new_block();
}

/// Builds a `for iter in 0..iterations { ... }` loop whose induction
/// variable and a single scalar "carry" are threaded through as `Phi`s:
/// the header's phis are reserved (`Builder::reserve_phi`) before the body
/// exists, then patched (`Builder::set_phi_incoming`) once the body's
/// final values are known — the standard way to build a loop header over
/// an arena that only ever grows. `body_fn` may emit an arbitrary number
/// of blocks (e.g. a guarded store); the edge back to the header is taken
/// from whatever block it leaves current, not necessarily the block the
/// body started in. Returns the carry's final value, valid for use in the
/// block the builder is left positioned in (the loop's exit block, which
/// the header dominates).
fn emit_tile_loop(
    b: &mut Builder,
    ty: ValueType,
    iterations: ValueId,
    initial_carry: ValueId,
    body_fn: impl FnOnce(&mut Builder, ValueId, ValueId) -> (ValueId, ValueId),
) -> ValueId {
    let zero = b.const_int(ValueType::Int32, 0);
    let entry = b.current_block();
    let header_id = b.next_block_id();
    b.terminate(Terminator::Branch(header_id));

    b.new_block();
    let iter_phi = b.reserve_phi(ValueType::Int32);
    let carry_phi = b.reserve_phi(ty);
    let cond = b.cmp(CmpOp::Lt, iter_phi, iterations);

    let body_id = b.new_block();
    let (iter_next, carry_next) = body_fn(b, iter_phi, carry_phi);
    let body_end = b.current_block();
    b.terminate(Terminator::Branch(header_id));

    let after_id = b.new_block();

    b.switch_to_block(header_id);
    b.terminate(Terminator::CondBranch { cond, if_true: body_id, if_false: after_id });
    b.switch_to_block(after_id);

    b.set_phi_incoming(iter_phi, vec![(entry, zero), (body_end, iter_next)]);
    b.set_phi_incoming(carry_phi, vec![(entry, initial_carry), (body_end, carry_next)]);

    carry_phi
}

fn ceil_div(a: i64, b: i64) -> i64 {
    if b <= 0 {
        0
    } else {
        (a + b - 1) / b
    }
}

/// Like `stream::compute_grid_stride_kernel_config`, but caps `grid_dim.x`
/// at `group_dim.x` (widening the tile instead of the grid past that
/// point): the finalize pass puts one `group_right_boundaries` entry per
/// lane within a single group, which only works if there are no more
/// groups than lanes.
fn multi_pass_config(device: &DeviceInfo, total_elements: i64) -> (KernelConfig, i32) {
    let group_x = device.max_group_size.max(1);
    let k = device.grid_stride_factor.max(1) as i64;
    let elements_per_full_grid_sweep = (group_x as i64) * k;
    let ideal_grid_x = if total_elements <= 0 {
        1
    } else {
        ceil_div(total_elements, elements_per_full_grid_sweep).max(1)
    };
    let grid_x = ideal_grid_x.min(group_x as i64).max(1) as i32;
    let total_lanes = (grid_x as i64) * (group_x as i64);
    let iterations_per_group = if total_elements <= 0 {
        1
    } else {
        ceil_div(total_elements, total_lanes).max(1) as i32
    };
    let config = KernelConfig::new(Index3D::new(grid_x, 1, 1), Index3D::new(group_x, 1, 1));
    (config, iterations_per_group)
}

fn pass1_entry_name(ty: &ValueType, kind: ReduceOpKind) -> String {
    format!("crucible_scan_boundary_{ty}_{kind:?}")
}

fn pass2_entry_name(ty: &ValueType, kind: ReduceOpKind, inclusive: bool) -> String {
    format!("crucible_scan_finalize_{ty}_{kind:?}_{}", if inclusive { "inclusive" } else { "exclusive" })
}

fn single_pass_entry_name(ty: &ValueType, kind: ReduceOpKind, inclusive: bool) -> String {
    format!("crucible_scan_single_{ty}_{kind:?}_{}", if inclusive { "inclusive" } else { "exclusive" })
}

/// Computes, for every lane in a group, the masked element index/value for
/// tile-sweep `iter`: `tile_base + iter * group_dim_x + lane`, or
/// `identity` past `total_len` (the tail tile of a source whose length
/// isn't a multiple of the tile size). Returns `(in_range, safe_index,
/// value)`; `safe_index` is always a valid load index even when
/// `in_range` is false, clamped to 0, so a masked-out lane never reads out
/// of bounds.
#[allow(clippy::too_many_arguments)]
fn load_tile_element(
    b: &mut Builder,
    ty: ValueType,
    source: ValueId,
    total_len: ValueId,
    tile_base: ValueId,
    group_dim_x64: ValueId,
    iter_phi: ValueId,
    identity_const: ValueId,
) -> (ValueId, ValueId, ValueId) {
    let lane = b.intrinsic(ValueType::Int32, IntrinsicOp::GroupIndex, vec![]);
    let lane64 = b.cast(lane, ValueType::Int64);
    let iter64 = b.cast(iter_phi, ValueType::Int64);
    let offset = b.arith(ValueType::Int64, ArithOp::Mul, iter64, group_dim_x64);
    let offset = b.arith(ValueType::Int64, ArithOp::Add, offset, lane64);
    let element_index = b.arith(ValueType::Int64, ArithOp::Add, tile_base, offset);
    let in_range = b.cmp(CmpOp::Lt, element_index, total_len);
    let zero64 = b.const_int(ValueType::Int64, 0);
    let safe_index = b.select(ValueType::Int64, in_range, element_index, zero64);
    let loaded = b.view_load(ty.clone(), source, safe_index);
    let value = b.select(ty, in_range, loaded, identity_const);
    (in_range, safe_index, value)
}

/// Pass 1 of the multi-pass path: each group folds its whole tile through
/// `GroupAllReduce` (no per-element output) and writes the result into
/// `group_right_boundaries[group_index]`.
fn build_right_boundary_module(entry_name: String, ty: ValueType, kind: ReduceOpKind, identity: RtValue) -> Module {
    build_module(entry_name, |b| {
        b.set_return_type(ValueType::Unit);
        let source = b.add_param("source", ValueType::Array(Box::new(ty.clone())));
        let boundaries = b.add_param("group_right_boundaries", ValueType::Array(Box::new(ty.clone())));
        let iterations = b.add_param("iterations_per_group", ValueType::Int32);
        b.new_block();

        let total_len = b.view_len(source);
        let group_index = b.intrinsic(ValueType::Int32, IntrinsicOp::GridIndex, vec![]);
        let group_index64 = b.cast(group_index, ValueType::Int64);
        let group_dim_x = b.intrinsic(ValueType::Int32, IntrinsicOp::GroupDimension, vec![]);
        let group_dim_x64 = b.cast(group_dim_x, ValueType::Int64);
        let iterations64 = b.cast(iterations, ValueType::Int64);
        let tile_size = b.arith(ValueType::Int64, ArithOp::Mul, group_dim_x64, iterations64);
        let tile_base = b.arith(ValueType::Int64, ArithOp::Mul, group_index64, tile_size);
        let identity_const = emit_const(b, &ty, &identity);

        let ty_body = ty.clone();
        let final_total = emit_tile_loop(b, ty.clone(), iterations, identity_const, move |b, iter_phi, carry_phi| {
            let (_, _, value) =
                load_tile_element(b, ty_body.clone(), source, total_len, tile_base, group_dim_x64, iter_phi, identity_const);
            let total = b.intrinsic(ty_body.clone(), IntrinsicOp::GroupAllReduce(kind), vec![value]);
            let carry_next = apply_reduce(b, ty_body.clone(), kind, carry_phi, total);
            let one = b.const_int(ValueType::Int32, 1);
            let iter_next = b.arith(ValueType::Int32, ArithOp::Add, iter_phi, one);
            (iter_next, carry_next)
        });

        let lane = b.intrinsic(ValueType::Int32, IntrinsicOp::GroupIndex, vec![]);
        let zero32 = b.const_int(ValueType::Int32, 0);
        let is_first_lane = b.cmp(CmpOp::Eq, lane, zero32);
        emit_guarded(b, is_first_lane, |b| {
            b.view_store(boundaries, group_index64, final_total);
        });
        b.terminate(Terminator::Return(None));
    })
}

/// Pass 2 of the multi-pass path: every group redundantly scans the whole
/// `group_right_boundaries` buffer to learn its own exclusive prefix
/// (`GroupExclusiveScan` over one boundary value per lane, masked past
/// `num_groups`), broadcasts that one lane's result out to the rest of the
/// group, then streams its tile into `target` starting from that prefix.
/// Requires `grid_dim.x <= group_dim.x` (`multi_pass_config` guarantees
/// this): one lane per boundary entry.
fn build_finalize_module(
    entry_name: String,
    ty: ValueType,
    kind: ReduceOpKind,
    identity: RtValue,
    inclusive: bool,
) -> Module {
    build_module(entry_name, |b| {
        b.set_return_type(ValueType::Unit);
        let view_ty = ValueType::Array(Box::new(ty.clone()));
        let source = b.add_param("source", view_ty.clone());
        let target = b.add_param("target", view_ty.clone());
        let boundaries = b.add_param("group_right_boundaries", view_ty);
        let iterations = b.add_param("iterations_per_group", ValueType::Int32);
        b.new_block();

        let total_len = b.view_len(source);
        let identity_const = emit_const(b, &ty, &identity);

        let lane = b.intrinsic(ValueType::Int32, IntrinsicOp::GroupIndex, vec![]);
        let lane64 = b.cast(lane, ValueType::Int64);
        let num_groups = b.view_len(boundaries);
        let lane_in_range = b.cmp(CmpOp::Lt, lane64, num_groups);
        let zero64 = b.const_int(ValueType::Int64, 0);
        let safe_lane_index = b.select(ValueType::Int64, lane_in_range, lane64, zero64);
        let loaded_boundary = b.view_load(ty.clone(), boundaries, safe_lane_index);
        let boundary_value = b.select(ty.clone(), lane_in_range, loaded_boundary, identity_const);
        let scan_struct_ty = ValueType::Struct(vec![ty.clone(), ty.clone()]);
        let prefix_struct = b.intrinsic(scan_struct_ty, IntrinsicOp::GroupExclusiveScan(kind), vec![boundary_value]);
        // Lane 0's `scanned` component here is the interpreter's generic
        // (not element-width-aware) identity placeholder, not `identity`
        // itself; harmless for every `ReduceOpKind` this engine supports
        // since `apply_reduce` always folds it against a same-kind,
        // correctly-typed `identity`/`left_boundary` downstream, and an
        // over-wide identity-like sentinel never wins that fold.
        let exclusive_prefix = b.tuple_extract(ty.clone(), prefix_struct, 0);
        let group_index = b.intrinsic(ValueType::Int32, IntrinsicOp::GridIndex, vec![]);
        let left_boundary = b.intrinsic(ty.clone(), IntrinsicOp::Broadcast, vec![exclusive_prefix, group_index]);

        let group_index64 = b.cast(group_index, ValueType::Int64);
        let group_dim_x = b.intrinsic(ValueType::Int32, IntrinsicOp::GroupDimension, vec![]);
        let group_dim_x64 = b.cast(group_dim_x, ValueType::Int64);
        let iterations64 = b.cast(iterations, ValueType::Int64);
        let tile_size = b.arith(ValueType::Int64, ArithOp::Mul, group_dim_x64, iterations64);
        let tile_base = b.arith(ValueType::Int64, ArithOp::Mul, group_index64, tile_size);

        let ty_body = ty.clone();
        let scan_op = if inclusive { IntrinsicOp::GroupInclusiveScan(kind) } else { IntrinsicOp::GroupExclusiveScan(kind) };
        emit_tile_loop(b, ty.clone(), iterations, left_boundary, move |b, iter_phi, carry_phi| {
            let (in_range, safe_index, value) = load_tile_element(
                b,
                ty_body.clone(),
                source,
                total_len,
                tile_base,
                group_dim_x64,
                iter_phi,
                identity_const,
            );
            let result_ty = ValueType::Struct(vec![ty_body.clone(), ty_body.clone()]);
            let scan_result = b.intrinsic(result_ty, scan_op, vec![value]);
            let scanned = b.tuple_extract(ty_body.clone(), scan_result, 0);
            let sweep_total = b.tuple_extract(ty_body.clone(), scan_result, 1);
            let out_value = apply_reduce(b, ty_body.clone(), kind, carry_phi, scanned);
            let carry_next = apply_reduce(b, ty_body.clone(), kind, carry_phi, sweep_total);
            let one = b.const_int(ValueType::Int32, 1);
            let iter_next = b.arith(ValueType::Int32, ArithOp::Add, iter_phi, one);
            emit_guarded(b, in_range, |b| {
                b.view_store(target, safe_index, out_value);
            });
            (iter_next, carry_next)
        });

        b.terminate(Terminator::Return(None));
    })
}

/// The `SequentialGroupExecutor` single-pass kernel: groups take turns
/// (gated by a spin-wait on `turn_counter` against their own `GridIndex`)
/// reading `shared_value` as their left boundary, then stream their tile
/// into `target` the same way the finalize pass does, finally publishing
/// the tile-inclusive running total back to `shared_value` and handing the
/// turn to the next group. On a backend that interprets groups strictly in
/// sequence the spin resolves with zero iterations every time — the value
/// is already published by the time a later group runs — but the kernel
/// still encodes a real spin wait, correct for genuinely concurrent
/// hardware too.
fn build_single_pass_module(
    entry_name: String,
    ty: ValueType,
    kind: ReduceOpKind,
    identity: RtValue,
    inclusive: bool,
) -> Module {
    build_module(entry_name, |b| {
        b.set_return_type(ValueType::Unit);
        let view_ty = ValueType::Array(Box::new(ty.clone()));
        let source = b.add_param("source", view_ty.clone());
        let target = b.add_param("target", view_ty);
        let shared_value = b.add_param("shared_value", ValueType::Array(Box::new(ty.clone())));
        let turn_counter = b.add_param("turn_counter", ValueType::Array(Box::new(ValueType::Int32)));
        let iterations = b.add_param("iterations_per_group", ValueType::Int32);
        b.new_block();

        let total_len = b.view_len(source);
        let identity_const = emit_const(b, &ty, &identity);
        let group_index = b.intrinsic(ValueType::Int32, IntrinsicOp::GridIndex, vec![]);
        let zero64 = b.const_int(ValueType::Int64, 0);

        emit_spin_wait(b, |b| {
            let turn = b.view_load(ValueType::Int32, turn_counter, zero64);
            b.cmp(CmpOp::Eq, turn, group_index)
        });
        b.intrinsic(ValueType::Unit, IntrinsicOp::GroupBarrier, vec![]);

        let left_boundary = b.view_load(ty.clone(), shared_value, zero64);

        let group_index64 = b.cast(group_index, ValueType::Int64);
        let group_dim_x = b.intrinsic(ValueType::Int32, IntrinsicOp::GroupDimension, vec![]);
        let group_dim_x64 = b.cast(group_dim_x, ValueType::Int64);
        let iterations64 = b.cast(iterations, ValueType::Int64);
        let tile_size = b.arith(ValueType::Int64, ArithOp::Mul, group_dim_x64, iterations64);
        let tile_base = b.arith(ValueType::Int64, ArithOp::Mul, group_index64, tile_size);

        let ty_body = ty.clone();
        let scan_op = if inclusive { IntrinsicOp::GroupInclusiveScan(kind) } else { IntrinsicOp::GroupExclusiveScan(kind) };
        let final_carry = emit_tile_loop(b, ty.clone(), iterations, left_boundary, move |b, iter_phi, carry_phi| {
            let (in_range, safe_index, value) = load_tile_element(
                b,
                ty_body.clone(),
                source,
                total_len,
                tile_base,
                group_dim_x64,
                iter_phi,
                identity_const,
            );
            let result_ty = ValueType::Struct(vec![ty_body.clone(), ty_body.clone()]);
            let scan_result = b.intrinsic(result_ty, scan_op, vec![value]);
            let scanned = b.tuple_extract(ty_body.clone(), scan_result, 0);
            let sweep_total = b.tuple_extract(ty_body.clone(), scan_result, 1);
            let out_value = apply_reduce(b, ty_body.clone(), kind, carry_phi, scanned);
            let carry_next = apply_reduce(b, ty_body.clone(), kind, carry_phi, sweep_total);
            let one = b.const_int(ValueType::Int32, 1);
            let iter_next = b.arith(ValueType::Int32, ArithOp::Add, iter_phi, one);
            emit_guarded(b, in_range, |b| {
                b.view_store(target, safe_index, out_value);
            });
            (iter_next, carry_next)
        });

        let lane = b.intrinsic(ValueType::Int32, IntrinsicOp::GroupIndex, vec![]);
        let zero32 = b.const_int(ValueType::Int32, 0);
        let is_first_lane = b.cmp(CmpOp::Eq, lane, zero32);
        emit_guarded(b, is_first_lane, |b| {
            b.view_store(shared_value, zero64, final_carry);
            let one32 = b.const_int(ValueType::Int32, 1);
            let next_turn = b.arith(ValueType::Int32, ArithOp::Add, group_index, one32);
            b.view_store(turn_counter, zero64, next_turn);
        });

        b.terminate(Terminator::Return(None));
    })
}

/// The Scan/Reduce Engine: declares and launches the kernels above
/// against a [`Context`]'s device registry. Cheap to construct — it only
/// borrows the `Context` it declares kernels against.
pub struct ScanEngine<'ctx> {
    context: &'ctx Context,
}

impl<'ctx> ScanEngine<'ctx> {
    pub fn new(context: &'ctx Context) -> ScanEngine<'ctx> {
        ScanEngine { context }
    }

    /// Registers the temporary-buffer requests a scan of `len` elements of
    /// `T` will need on `device`, so a caller can fold them into one
    /// `OutOfMemory` check before allocating anything.
    pub fn plan<T: ViewElement>(&self, device: &DeviceInfo, len: i64) -> AllocationBuilder {
        let mut builder = AllocationBuilder::new();
        let elem_size = T::size_of() as i64;
        if device.supports_single_pass_scan {
            builder.request("scan_shared_value", elem_size, 1);
            builder.request("scan_turn_counter", 4, 1);
        } else {
            let (config, _) = multi_pass_config(device, len);
            builder.request("scan_group_right_boundaries", elem_size, config.grid_dim.x as i64);
        }
        builder
    }

    pub fn inclusive_scan<T: ScanElement, Op: KernelOperator<T>>(
        &self,
        stream: &Stream,
        op: Op,
        source: &ArrayView<T>,
        target: &ArrayView<T>,
    ) -> Result<()> {
        self.run(stream, op, source, target, true)
    }

    pub fn exclusive_scan<T: ScanElement, Op: KernelOperator<T>>(
        &self,
        stream: &Stream,
        op: Op,
        source: &ArrayView<T>,
        target: &ArrayView<T>,
    ) -> Result<()> {
        self.run(stream, op, source, target, false)
    }

    fn run<T: ScanElement, Op: KernelOperator<T>>(
        &self,
        stream: &Stream,
        op: Op,
        source: &ArrayView<T>,
        target: &ArrayView<T>,
        inclusive: bool,
    ) -> Result<()> {
        if target.len() < source.len() {
            return Err(Error::config_invalid(format!(
                "scan target length {} is smaller than source length {}",
                target.len(),
                source.len()
            )));
        }
        if source.is_empty() {
            return Ok(());
        }
        if stream.device().supports_single_pass_scan {
            self.run_single_pass(stream, op, source, target, inclusive)
        } else {
            self.run_multi_pass(stream, op, source, target, inclusive)
        }
    }

    /// Runs the `SequentialGroupExecutor` single-pass kernel directly,
    /// regardless of `stream.device().supports_single_pass_scan`. Exposed
    /// alongside [`ScanEngine::run_multi_pass`] so both paths can be
    /// exercised and cross-checked against the same device.
    pub fn run_single_pass<T: ScanElement, Op: KernelOperator<T>>(
        &self,
        stream: &Stream,
        op: Op,
        source: &ArrayView<T>,
        target: &ArrayView<T>,
        inclusive: bool,
    ) -> Result<()> {
        let device = stream.device().clone();
        let device_class = device.class;
        let ty = ValueType::element_type_of::<T>();
        let kind = Op::KIND;
        let identity = RtValue::from_element(op.identity());
        let (config, iterations) = compute_grid_stride_kernel_config(&device, source.len());

        let name = single_pass_entry_name(&ty, kind, inclusive);
        let kernel = self.declare_or_get(
            &name,
            || build_single_pass_module(name.clone(), ty.clone(), kind, identity.clone(), inclusive),
            vec![ty.to_string()],
            device_class,
        );

        let shared_value = stream.allocate_temporary::<T>(1)?;
        copy_from_host(&[op.identity()], &shared_value.view())?;
        let turn_counter = stream.allocate_temporary::<i32>(1)?;
        copy_from_host(&[0i32], &turn_counter.view())?;

        stream.launch(
            &kernel,
            &config,
            vec![
                arg_view(source.clone()),
                arg_view(target.clone()),
                arg_view(shared_value.view()),
                arg_view(turn_counter.view()),
                RtValue::Int(iterations as i64),
            ],
        )
    }

    /// Runs the two-pass kernel pair directly, regardless of
    /// `stream.device().supports_single_pass_scan`. See
    /// [`ScanEngine::run_single_pass`].
    pub fn run_multi_pass<T: ScanElement, Op: KernelOperator<T>>(
        &self,
        stream: &Stream,
        op: Op,
        source: &ArrayView<T>,
        target: &ArrayView<T>,
        inclusive: bool,
    ) -> Result<()> {
        let device = stream.device().clone();
        let device_class = device.class;
        let ty = ValueType::element_type_of::<T>();
        let kind = Op::KIND;
        let identity = RtValue::from_element(op.identity());
        let (config, iterations) = multi_pass_config(&device, source.len());
        let num_groups = config.grid_dim.x as i64;

        let pass1_name = pass1_entry_name(&ty, kind);
        let pass1 = self.declare_or_get(
            &pass1_name,
            || build_right_boundary_module(pass1_name.clone(), ty.clone(), kind, identity.clone()),
            vec![ty.to_string()],
            device_class,
        );

        let pass2_name = pass2_entry_name(&ty, kind, inclusive);
        let pass2 = self.declare_or_get(
            &pass2_name,
            || build_finalize_module(pass2_name.clone(), ty.clone(), kind, identity.clone(), inclusive),
            vec![ty.to_string()],
            device_class,
        );

        let boundaries = stream.allocate_temporary::<T>(num_groups)?;
        let iterations_arg = RtValue::Int(iterations as i64);

        stream.launch(
            &pass1,
            &config,
            vec![arg_view(source.clone()), arg_view(boundaries.view()), iterations_arg.clone()],
        )?;
        stream.launch(
            &pass2,
            &config,
            vec![arg_view(source.clone()), arg_view(target.clone()), arg_view(boundaries.view()), iterations_arg],
        )
    }

    fn declare_or_get(
        &self,
        entry_name: &str,
        build: impl FnOnce() -> Module,
        type_args: Vec<String>,
        device_class: DeviceClass,
    ) -> KernelHandle {
        if let Some(handle) = self.context.kernel(entry_name) {
            return handle;
        }
        self.context.declare_kernel(build(), type_args, device_class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::copy_to_host;
    use crate::cache::CompileCache;
    use crate::config::ContextProperties;
    use crate::device::DeviceClass;
    use std::sync::Arc;

    fn scan_context_and_stream() -> (Context, Stream) {
        let ctx = Context::default();
        let stream = ctx.open_stream(DeviceClass::Cpu).unwrap();
        (ctx, stream)
    }

    #[test]
    fn inclusive_scan_matches_known_sequence() {
        let (ctx, stream) = scan_context_and_stream();
        let engine = ScanEngine::new(&ctx);

        let source = stream.allocate::<i32>(5).unwrap();
        let target = stream.allocate::<i32>(5).unwrap();
        copy_from_host(&[1, 2, 3, 4, 5], &source.as_view()).unwrap();

        engine.inclusive_scan(&stream, crucible_core::ops::AddOp, &source.as_view(), &target.as_view()).unwrap();

        let mut out = [0i32; 5];
        copy_to_host(&target.as_view(), &mut out).unwrap();
        assert_eq!(out, [1, 3, 6, 10, 15]);
    }

    #[test]
    fn exclusive_scan_matches_known_sequence() {
        let (ctx, stream) = scan_context_and_stream();
        let engine = ScanEngine::new(&ctx);

        let source = stream.allocate::<i32>(5).unwrap();
        let target = stream.allocate::<i32>(5).unwrap();
        copy_from_host(&[1, 2, 3, 4, 5], &source.as_view()).unwrap();

        engine.exclusive_scan(&stream, crucible_core::ops::AddOp, &source.as_view(), &target.as_view()).unwrap();

        let mut out = [0i32; 5];
        copy_to_host(&target.as_view(), &mut out).unwrap();
        assert_eq!(out, [0, 1, 3, 6, 10]);
    }

    #[test]
    fn min_scan_picks_up_the_running_minimum() {
        let (ctx, stream) = scan_context_and_stream();
        let engine = ScanEngine::new(&ctx);

        let source = stream.allocate::<i32>(5).unwrap();
        let target = stream.allocate::<i32>(5).unwrap();
        copy_from_host(&[5, 3, 4, 1, 2], &source.as_view()).unwrap();

        engine.inclusive_scan(&stream, crucible_core::ops::MinOp, &source.as_view(), &target.as_view()).unwrap();

        let mut out = [0i32; 5];
        copy_to_host(&target.as_view(), &mut out).unwrap();
        assert_eq!(out, [5, 3, 3, 1, 1]);
    }

    #[test]
    fn empty_source_is_a_no_op() {
        let (ctx, stream) = scan_context_and_stream();
        let engine = ScanEngine::new(&ctx);

        let source = stream.allocate::<i32>(0).unwrap();
        let target = stream.allocate::<i32>(0).unwrap();
        engine.inclusive_scan(&stream, crucible_core::ops::AddOp, &source.as_view(), &target.as_view()).unwrap();
    }

    #[test]
    fn target_shorter_than_source_is_config_invalid() {
        let (ctx, stream) = scan_context_and_stream();
        let engine = ScanEngine::new(&ctx);

        let source = stream.allocate::<i32>(5).unwrap();
        let target = stream.allocate::<i32>(3).unwrap();
        let err = engine
            .inclusive_scan(&stream, crucible_core::ops::AddOp, &source.as_view(), &target.as_view())
            .unwrap_err();
        assert!(matches!(err, Error::ConfigInvalid { .. }));
    }

    #[test]
    fn multi_pass_path_agrees_with_a_hand_checked_sequence_across_several_groups() {
        let device = DeviceInfo {
            class: DeviceClass::Cpu,
            name: "test-multi-pass".to_string(),
            memory_bytes: 0,
            max_group_size: 8,
            preferred_group_size: 8,
            warp_size: 4,
            max_grid_size: i32::MAX,
            grid_stride_factor: 2,
            supports_single_pass_scan: false,
            opencl_version: None,
            max_shared_memory_bytes: 48 * 1024,
        };
        let stream = Stream::new(
            1,
            Arc::new(device),
            Arc::new(crate::backend::cpu_emulator::CpuEmulatorBackend),
            Arc::new(CompileCache::new()),
            ContextProperties::new(),
        );
        let ctx = Context::default();
        let engine = ScanEngine::new(&ctx);

        let n = 50i64;
        let source = stream.allocate::<i64>(n).unwrap();
        let target = stream.allocate::<i64>(n).unwrap();
        copy_from_host(&vec![1i64; n as usize], &source.as_view()).unwrap();

        engine
            .run_multi_pass(&stream, crucible_core::ops::AddOp, &source.as_view(), &target.as_view(), true)
            .unwrap();

        let mut out = vec![0i64; n as usize];
        copy_to_host(&target.as_view(), &mut out).unwrap();
        let expected: Vec<i64> = (1..=n).collect();
        assert_eq!(out, expected);
    }
}
