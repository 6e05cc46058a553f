//! Value types, kernel IR contracts, and device-model primitives shared
//! between the `crucible` runtime and anything that authors kernels
//! against it.
//!
//! This crate is intentionally free of anything that depends on a specific
//! accelerator backend, a thread pool, or I/O: it is the vocabulary (index
//! arithmetic, strides, the non-owning `ArrayView`, atomics, and the
//! associative-operator contract used by scans/reductions) that the
//! compilation pipeline and the device backends in `crucible` both build
//! on top of.

pub mod atomic;
pub mod error;
pub mod index;
pub mod narrow_float;
pub mod ops;
pub mod stride;
pub mod view;

pub use atomic::{AtomicElement, AtomicOp, IntegralAtomicElement};
pub use error::{CompileStage, Error, Result};
pub use index::{
    linearize, linearize_long, reconstruct, reconstruct_long, Extent, Index1D, Index2D, Index3D,
    LongIndex1D, LongIndex2D, LongIndex3D,
};
pub use narrow_float::{Bf16, F8E4M3, F8E5M2};
pub use ops::{AddOp, AndOp, MaxOp, MinOp, OrOp, ScanReduceOperation, XorOp};
pub use stride::{Stride, StridedShape};
pub use view::{ArrayView, MemoryHandle, ViewElement};
