//! Backends: translators from Kernel IR to a target program. Every
//! backend consumes the same `crate::ir::Module` and returns a
//! [`CompiledKernel`]; the Compile Cache and Stream only ever
//! see this trait, never a backend-specific type.

pub mod cpu_emulator;
pub mod opencl;
pub mod ptx;

use std::sync::Arc;

use crucible_core::error::Result;

use crate::config::ContextProperties;
use crate::device::{DeviceClass, DeviceInfo};
use crate::fingerprint::Fingerprint;
use crate::ir::module::{Function, IntrinsicOp, Opcode};
use crate::ir::types::ValueType;
use crate::ir::Module;

/// The target program a backend produced. The CPU emulator's "program" is
/// the verified, pass-pipelined IR itself (it is its own reference
/// executor); GPU backends produce target source text. Dispatching that
/// text to a driver is out of scope — device-driver bindings are an
/// external collaborator — so `Stream` logs and acknowledges the submission
/// instead of interpreting it.
#[derive(Debug, Clone)]
pub enum CompiledTarget {
    Interpreted(Arc<Module>),
    Source(String),
}

/// Whether a kernel parameter is a plain scalar or a view, per the
/// argument marshalling rule: each argument is either a scalar or a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgKind {
    Scalar(ValueType),
    View(ValueType),
}

/// A Compiled Kernel: an opaque handle owned by the Compile Cache and
/// shared (via the cache's `Arc`) across concurrent launches.
#[derive(Debug, Clone)]
pub struct CompiledKernel {
    pub target: CompiledTarget,
    pub entry_symbol: String,
    pub argument_layout: Vec<ArgKind>,
    pub static_shared_memory_bytes: u32,
    pub fingerprint: Fingerprint,
}

pub trait Backend: Send + Sync {
    fn device_class(&self) -> DeviceClass;

    fn compile(
        &self,
        module: &Module,
        device: &DeviceInfo,
        props: &ContextProperties,
        fingerprint: Fingerprint,
    ) -> Result<CompiledKernel>;
}

pub(crate) fn argument_layout(function: &Function) -> Vec<ArgKind> {
    function
        .params
        .iter()
        .map(|p| match &p.ty {
            ValueType::Array(elem) => ArgKind::View((**elem).clone()),
            other => ArgKind::Scalar(other.clone()),
        })
        .collect()
}

/// Sums the constant-sized `LocalMemory.Allocate` requests in `function`,
/// giving the static shared-memory specification derived from IR
/// `LocalMemory.Allocate` calls with constant sizes.
pub(crate) fn static_shared_memory_bytes(function: &Function) -> u32 {
    function
        .instructions_in_order()
        .filter_map(|inst| match &inst.op {
            Opcode::Intrinsic(IntrinsicOp::LocalMemoryAllocate { elem, count }, _) => {
                let elem_size = elem.byte_size().unwrap_or(0) as u64;
                Some((elem_size * (*count).max(0) as u64) as u32)
            }
            _ => None,
        })
        .sum()
}
