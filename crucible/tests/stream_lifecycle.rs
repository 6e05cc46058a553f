//! End-to-end exercise of `Stream`'s poison/reset lifecycle: a failing
//! launch must leave the stream refusing further work until an explicit
//! `reset`, and the compile cache must actually be reused across repeated
//! launches of the same declared kernel rather than rebuilding every time.

use crucible::device::DeviceClass;
use crucible::ir::module::{ArithOp, Terminator};
use crucible::ir::{build_module, ValueType};
use crucible::stream::KernelConfig;
use crucible::{Context, Error, RtValue};
use crucible_core::index::Index3D;

fn divide_by_zero_module() -> crucible::ir::Module {
    build_module("divide_by_zero", |b| {
        b.set_return_type(ValueType::Unit);
        let dividend = b.add_param("dividend", ValueType::Int32);
        let divisor = b.add_param("divisor", ValueType::Int32);
        b.new_block();
        let _ = b.arith(ValueType::Int32, ArithOp::Div, dividend, divisor);
        b.terminate(Terminator::Return(None));
    })
}

#[test]
fn a_failed_launch_poisons_the_stream_until_reset() {
    let ctx = Context::default();
    let stream = ctx.open_stream(DeviceClass::Cpu).unwrap();
    let handle = ctx.declare_kernel(divide_by_zero_module(), vec![], DeviceClass::Cpu);
    let config = KernelConfig::new(Index3D::new(1, 1, 1), Index3D::new(1, 1, 1));

    let err = stream
        .launch(&handle, &config, vec![RtValue::Int(10), RtValue::Int(0)])
        .unwrap_err();
    assert!(matches!(err, Error::IntrinsicMisuse { .. }));
    assert!(stream.is_poisoned());

    // A poisoned stream rejects any further submission, even one that
    // would otherwise succeed, until it is explicitly reset.
    let again = stream.launch(&handle, &config, vec![RtValue::Int(10), RtValue::Int(2)]);
    assert!(matches!(again, Err(Error::Canceled)));

    stream.reset();
    assert!(!stream.is_poisoned());
    stream.launch(&handle, &config, vec![RtValue::Int(10), RtValue::Int(2)]).unwrap();
}

#[test]
fn repeated_launches_of_the_same_kernel_share_one_compiled_build() {
    let ctx = Context::default();
    let stream = ctx.open_stream(DeviceClass::Cpu).unwrap();
    let handle = ctx.declare_kernel(divide_by_zero_module(), vec![], DeviceClass::Cpu);
    let config = KernelConfig::new(Index3D::new(1, 1, 1), Index3D::new(1, 1, 1));

    assert_eq!(ctx.compile_cache().len(), 0);
    stream.launch(&handle, &config, vec![RtValue::Int(10), RtValue::Int(2)]).unwrap();
    assert_eq!(ctx.compile_cache().len(), 1);
    stream.launch(&handle, &config, vec![RtValue::Int(20), RtValue::Int(4)]).unwrap();
    assert_eq!(ctx.compile_cache().len(), 1);
}
