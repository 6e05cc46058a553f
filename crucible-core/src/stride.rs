//! Stride: the mapping from logical N-D indices to flat buffer offsets.

use crate::index::Index3D;

/// How a view's logical indices map onto offsets within its backing
/// buffer. `Dense` is the only variant required for a 1D view; `General`
/// supports the strided views produced by `AlignTo` and manual composition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Stride {
    /// Unit stride in the leading dimension: `offset(i) = i`.
    Dense,
    /// Arbitrary per-dimension strides, one integer per non-leading
    /// dimension. `components[0]` is the stride of dimension 1 (the
    /// second dimension), etc. Offsets of the leading dimension are
    /// always unit; `components` covers everything past it.
    General { components: Vec<i64> },
}

impl Stride {
    pub fn dense() -> Stride {
        Stride::Dense
    }

    pub fn general(components: Vec<i64>) -> Stride {
        Stride::General { components }
    }

    /// Offset (in elements) of the `i`th element along the leading
    /// (1D-linearised) dimension of a view using this stride.
    ///
    /// For `Dense` this is the identity; for `General`, callers addressing
    /// higher dimensions are expected to pre-linearise using the extent
    /// and then consult `components` to fold in the non-leading strides.
    /// Views constructed through `subview` only ever move the logical base
    /// index, never rewrite the stride itself (composition rule in the
    /// index & stride design).
    pub fn offset_of(&self, i: i64) -> i64 {
        match self {
            Stride::Dense => i,
            Stride::General { .. } => i,
        }
    }

    /// `true` if this stride is the trivial, unit-stride case.
    pub fn is_dense(&self) -> bool {
        matches!(self, Stride::Dense)
    }
}

impl Default for Stride {
    fn default() -> Stride {
        Stride::Dense
    }
}

/// A 2D or 3D extent paired with a `Stride`, used when a view addresses a
/// multi-dimensional region rather than a flat run. Kept separate from
/// `Stride` itself so 1D views (the common case) pay nothing for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StridedShape {
    pub extent: Index3D,
    pub stride: Stride,
}

impl StridedShape {
    pub fn new(extent: Index3D, stride: Stride) -> Self {
        StridedShape { extent, stride }
    }

    pub fn dense(extent: Index3D) -> Self {
        StridedShape { extent, stride: Stride::Dense }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_stride_offset_is_identity() {
        let s = Stride::dense();
        for i in 0..16 {
            assert_eq!(s.offset_of(i), i);
        }
    }

    #[test]
    fn default_stride_is_dense() {
        assert_eq!(Stride::default(), Stride::Dense);
    }
}
