//! The error taxonomy shared by every layer of the runtime.
//!
//! Each variant carries the structured payload called for by the error
//! taxonomy: enough to let a caller recover programmatically rather than
//! just format a message.

use std::fmt;

/// Crucible result type.
pub type Result<T> = ::std::result::Result<T, Error>;

/// The stage of compilation at which a `CompilationFailed` error originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompileStage {
    Inlining,
    ConstantPropagation,
    SsaConstruction,
    CfgSimplification,
    DeadCodeElimination,
    Verification,
    Codegen,
}

impl fmt::Display for CompileStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompileStage::Inlining => "inlining",
            CompileStage::ConstantPropagation => "constant propagation",
            CompileStage::SsaConstruction => "SSA construction",
            CompileStage::CfgSimplification => "CFG simplification",
            CompileStage::DeadCodeElimination => "dead code elimination",
            CompileStage::Verification => "verification",
            CompileStage::Codegen => "codegen",
        };
        f.write_str(s)
    }
}

/// The runtime's complete error taxonomy (see the error handling design).
///
/// Contract violations that assertions mode does not catch are undefined
/// behavior and intentionally have no corresponding variant here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A 64-bit index component did not fit in an `i32`, or a component was
    /// negative, or a grid/group extent overflowed.
    #[error("index out of representable range: {detail}")]
    IndexRange { detail: String },

    /// A sub-view or element access fell outside a view's valid range.
    #[error("view access out of bounds: index {index}, len {len}")]
    ViewBounds { index: i64, len: i64 },

    /// `cast<U>()` or `align_to()` violated its precondition.
    #[error("view cast/alignment precondition violated: {detail}")]
    ViewCastAlignment { detail: String },

    /// An operation was issued against a disposed `MemoryBuffer`.
    #[error("operation issued on a disposed buffer")]
    BufferDisposed,

    /// A launch or scan configuration was invalid.
    #[error("invalid configuration: {detail}")]
    ConfigInvalid { detail: String },

    /// A collective intrinsic was invoked outside a kernel or with
    /// arguments that diverge across participating lanes/threads.
    #[error("collective intrinsic misuse: {detail}")]
    IntrinsicMisuse { detail: String },

    /// Compilation failed at the named stage.
    #[error("compilation failed at {stage}: {detail}")]
    CompilationFailed {
        stage: CompileStage,
        detail: String,
    },

    /// The requested accelerator/device class is not present.
    #[error("accelerator unavailable: {detail}")]
    AcceleratorUnavailable { detail: String },

    /// The owning stream was aborted.
    #[error("operation canceled: stream was aborted")]
    Canceled,

    /// An allocator could not satisfy a request.
    #[error("out of memory: requested {requested_bytes} bytes")]
    OutOfMemory { requested_bytes: i64 },
}

impl Error {
    pub fn index_range<S: Into<String>>(detail: S) -> Error {
        Error::IndexRange { detail: detail.into() }
    }

    pub fn view_bounds(index: i64, len: i64) -> Error {
        Error::ViewBounds { index, len }
    }

    pub fn view_cast_alignment<S: Into<String>>(detail: S) -> Error {
        Error::ViewCastAlignment { detail: detail.into() }
    }

    pub fn config_invalid<S: Into<String>>(detail: S) -> Error {
        Error::ConfigInvalid { detail: detail.into() }
    }

    pub fn intrinsic_misuse<S: Into<String>>(detail: S) -> Error {
        Error::IntrinsicMisuse { detail: detail.into() }
    }

    pub fn compilation_failed<S: Into<String>>(stage: CompileStage, detail: S) -> Error {
        Error::CompilationFailed { stage, detail: detail.into() }
    }

    /// `true` for errors that leave the originating `Stream` in a state
    /// where every subsequent submission must fail with `Canceled` until
    /// the stream is reset (see the concurrency model's ordering rules).
    pub fn poisons_stream(&self) -> bool {
        !matches!(self, Error::Canceled)
    }
}
