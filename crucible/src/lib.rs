//! A JIT compiler and runtime for data-parallel kernels on heterogeneous
//! accelerators.
//!
//! `crucible` compiles a single, language-neutral kernel IR (see [`ir`]) to
//! one of several backends (a CPU reference emulator today; PTX and
//! OpenCL-C text generation for actual accelerators) behind a content-
//! addressed [`cache`], and exposes the result through a [`stream`] that
//! allocates device memory, marshals arguments, and launches work. A
//! [`Context`](context::Context) ties a device registry, the cache, and
//! stream creation together into the single entry point most callers need.
//!
//! The [`crucible_core`] crate carries the dependency-light vocabulary
//! (index arithmetic, strides, [`ArrayView`](crucible_core::ArrayView),
//! atomics, and the scan/reduce operator contract) that both this crate and
//! kernel authors build on.

pub mod backend;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod context;
pub mod device;
pub mod fingerprint;
pub mod ir;
pub mod scan;
pub mod stream;
pub mod value;

pub use buffer::MemoryBuffer;
pub use cache::CompileCache;
pub use config::{ContextProperties, DebugSymbols, InliningMode, OptimizationLevel, PtxFeatures};
pub use context::{Context, KernelHandle, KernelState};
pub use device::{DeviceClass, DeviceInfo, OpenClVersion};
pub use fingerprint::Fingerprint;
pub use stream::{KernelConfig, ScopedBuffer, Stream};
pub use value::{DynView, RtValue};

pub use crucible_core::error::{CompileStage, Error, Result};
