//! End-to-end exercise of warp-scoped collective intrinsics through the
//! CPU Emulator, built directly against the IR builder rather than through
//! the Scan/Reduce Engine, so the device model's collective-intrinsic
//! contracts are tested independently of any one consumer of them.

use crucible::backend::cpu_emulator::execute;
use crucible::buffer::{copy_to_host, MemoryBuffer};
use crucible::ir::module::{ArithOp, IntrinsicOp, ReduceOpKind, Terminator};
use crucible::ir::{build_module, ValueType};
use crucible::value::DynView;
use crucible::RtValue;

#[test]
fn warp_all_reduce_over_a_full_warp_sums_one_through_thirty_two() {
    let module = build_module("warp_all_reduce_sum", |b| {
        b.set_return_type(ValueType::Unit);
        let out = b.add_param("out", ValueType::Array(Box::new(ValueType::Int32)));
        b.new_block();
        let lane = b.intrinsic(ValueType::Int32, IntrinsicOp::LaneIndex, vec![]);
        let one = b.const_int(ValueType::Int32, 1);
        let contribution = b.arith(ValueType::Int32, ArithOp::Add, lane, one);
        let total =
            b.intrinsic(ValueType::Int32, IntrinsicOp::WarpAllReduce(ReduceOpKind::Add), vec![contribution]);
        let idx = b.intrinsic(ValueType::Int32, IntrinsicOp::GroupIndex, vec![]);
        b.view_store(out, idx, total);
        b.terminate(Terminator::Return(None));
    });

    let buf = MemoryBuffer::<i32>::allocate(1, 32).unwrap();
    let view = buf.as_view();
    let args = vec![RtValue::View(DynView::I32(view.clone()))];
    // One group, 32 lanes, a single 32-lane warp: every lane contributes
    // lane_index + 1, so the warp-wide sum is 1 + 2 + ... + 32 = 528.
    execute(&module.function, 1, 32, 32, &args).unwrap();

    let mut out = vec![0i32; 32];
    copy_to_host(&view, &mut out).unwrap();
    assert_eq!(out, vec![528; 32]);
}

#[test]
fn warp_all_reduce_is_scoped_per_warp_not_per_group() {
    // Two 16-lane warps in one 32-lane group: each warp should only see its
    // own contributions, not the other warp's.
    let module = build_module("per_warp_reduce", |b| {
        b.set_return_type(ValueType::Unit);
        let out = b.add_param("out", ValueType::Array(Box::new(ValueType::Int32)));
        b.new_block();
        let lane = b.intrinsic(ValueType::Int32, IntrinsicOp::LaneIndex, vec![]);
        let one = b.const_int(ValueType::Int32, 1);
        let contribution = b.arith(ValueType::Int32, ArithOp::Add, lane, one);
        let total =
            b.intrinsic(ValueType::Int32, IntrinsicOp::WarpAllReduce(ReduceOpKind::Add), vec![contribution]);
        let idx = b.intrinsic(ValueType::Int32, IntrinsicOp::GroupIndex, vec![]);
        b.view_store(out, idx, total);
        b.terminate(Terminator::Return(None));
    });

    let buf = MemoryBuffer::<i32>::allocate(1, 32).unwrap();
    let view = buf.as_view();
    let args = vec![RtValue::View(DynView::I32(view.clone()))];
    execute(&module.function, 1, 32, 16, &args).unwrap();

    let mut out = vec![0i32; 32];
    copy_to_host(&view, &mut out).unwrap();
    // lane_index resets at each warp boundary (LaneIndex = lane % warp_size),
    // so each 16-lane warp independently sums 1..=16 = 136.
    assert_eq!(out, vec![136; 32]);
}

#[test]
fn shuffle_down_by_zero_is_the_identity() {
    let module = build_module("shuffle_down_zero", |b| {
        b.set_return_type(ValueType::Unit);
        let out = b.add_param("out", ValueType::Array(Box::new(ValueType::Int32)));
        b.new_block();
        let lane = b.intrinsic(ValueType::Int32, IntrinsicOp::GroupIndex, vec![]);
        let zero = b.const_int(ValueType::Int32, 0);
        let shuffled = b.intrinsic(ValueType::Int32, IntrinsicOp::ShuffleDown { width: None }, vec![lane, zero]);
        b.view_store(out, lane, shuffled);
        b.terminate(Terminator::Return(None));
    });

    let buf = MemoryBuffer::<i32>::allocate(1, 8).unwrap();
    let view = buf.as_view();
    let args = vec![RtValue::View(DynView::I32(view.clone()))];
    execute(&module.function, 1, 8, 8, &args).unwrap();

    let mut out = vec![0i32; 8];
    copy_to_host(&view, &mut out).unwrap();
    assert_eq!(out, (0..8).collect::<Vec<i32>>());
}

#[test]
fn shuffle_down_by_warp_size_returns_the_lanes_own_value() {
    // delta == warp_size means every lane's target index falls outside the
    // warp for every lane, so the shuffle must fall back to the lane's own
    // value rather than reading past the warp (or panicking).
    let module = build_module("shuffle_down_out_of_warp", |b| {
        b.set_return_type(ValueType::Unit);
        let out = b.add_param("out", ValueType::Array(Box::new(ValueType::Int32)));
        b.new_block();
        let lane = b.intrinsic(ValueType::Int32, IntrinsicOp::GroupIndex, vec![]);
        let warp_size = b.intrinsic(ValueType::Int32, IntrinsicOp::WarpDimension, vec![]);
        let shuffled =
            b.intrinsic(ValueType::Int32, IntrinsicOp::ShuffleDown { width: None }, vec![lane, warp_size]);
        b.view_store(out, lane, shuffled);
        b.terminate(Terminator::Return(None));
    });

    let buf = MemoryBuffer::<i32>::allocate(1, 8).unwrap();
    let view = buf.as_view();
    let args = vec![RtValue::View(DynView::I32(view.clone()))];
    execute(&module.function, 1, 8, 8, &args).unwrap();

    let mut out = vec![0i32; 8];
    copy_to_host(&view, &mut out).unwrap();
    assert_eq!(out, (0..8).collect::<Vec<i32>>());
}
