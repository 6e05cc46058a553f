//! Index, extent, and linearisation arithmetic.
//!
//! Two families of tuple types are provided: the 32-bit `Index{1,2,3}D`
//! family used for in-kernel arithmetic, and the 64-bit `LongIndex{1,2,3}D`
//! family used for host-side addressing. Conversions between the two
//! families verify range and fail with `Error::IndexRange` rather than
//! silently truncating.

use crate::error::{Error, Result};

/// Extent (shape) of a 3D iteration space, always using the 32-bit family;
/// hosts addressing buffers larger than `i32::MAX` per-dimension should use
/// `LongIndex3D` directly rather than go through `Extent`.
pub type Extent = Index3D;

macro_rules! index_type {
    ($name:ident, $long_name:ident, $component:ty, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name {
            pub x: $component,
            pub y: $component,
            pub z: $component,
        }

        impl $name {
            pub const fn new(x: $component, y: $component, z: $component) -> Self {
                $name { x, y, z }
            }

            pub const fn splat(v: $component) -> Self {
                $name { x: v, y: v, z: v }
            }

            pub const fn one() -> Self {
                Self::splat(1)
            }

            /// `x * y * z`, the total number of points covered by this
            /// tuple when interpreted as an extent.
            pub fn size(&self) -> i64 {
                (self.x as i64) * (self.y as i64) * (self.z as i64)
            }

            pub fn add(&self, other: &Self) -> Self {
                $name::new(self.x + other.x, self.y + other.y, self.z + other.z)
            }

            pub fn sub(&self, other: &Self) -> Self {
                $name::new(self.x - other.x, self.y - other.y, self.z - other.z)
            }

            pub fn mul_scalar(&self, scalar: $component) -> Self {
                $name::new(self.x * scalar, self.y * scalar, self.z * scalar)
            }

            /// Componentwise containment in `[0, extent)`. Lexicographic
            /// ordering is deliberately not provided; only this and
            /// `in_bounds_inclusive` are legal ways to compare against an
            /// extent.
            pub fn in_bounds(&self, extent: &Self) -> bool {
                self.x >= 0 && self.x < extent.x &&
                self.y >= 0 && self.y < extent.y &&
                self.z >= 0 && self.z < extent.z
            }

            /// Componentwise containment in `[0, extent]`.
            pub fn in_bounds_inclusive(&self, extent: &Self) -> bool {
                self.x >= 0 && self.x <= extent.x &&
                self.y >= 0 && self.y <= extent.y &&
                self.z >= 0 && self.z <= extent.z
            }
        }

        #[doc = "64-bit counterpart of"]
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $long_name {
            pub x: i64,
            pub y: i64,
            pub z: i64,
        }

        impl $long_name {
            pub const fn new(x: i64, y: i64, z: i64) -> Self {
                $long_name { x, y, z }
            }

            pub const fn splat(v: i64) -> Self {
                $long_name { x: v, y: v, z: v }
            }

            pub fn size(&self) -> i64 {
                self.x * self.y * self.z
            }

            pub fn add(&self, other: &Self) -> Self {
                $long_name::new(self.x + other.x, self.y + other.y, self.z + other.z)
            }

            pub fn sub(&self, other: &Self) -> Self {
                $long_name::new(self.x - other.x, self.y - other.y, self.z - other.z)
            }

            pub fn in_bounds(&self, extent: &Self) -> bool {
                self.x >= 0 && self.x < extent.x &&
                self.y >= 0 && self.y < extent.y &&
                self.z >= 0 && self.z < extent.z
            }

            pub fn in_bounds_inclusive(&self, extent: &Self) -> bool {
                self.x >= 0 && self.x <= extent.x &&
                self.y >= 0 && self.y <= extent.y &&
                self.z >= 0 && self.z <= extent.z
            }

            /// Narrows to the 32-bit family, failing with `IndexRange` if
            /// any component does not fit in a signed 32-bit integer.
            pub fn try_into_narrow(&self) -> Result<$name> {
                Ok($name::new(
                    narrow_component(self.x)?,
                    narrow_component(self.y)?,
                    narrow_component(self.z)?,
                ))
            }
        }

        impl From<$name> for $long_name {
            fn from(v: $name) -> $long_name {
                $long_name::new(v.x as i64, v.y as i64, v.z as i64)
            }
        }

        impl std::convert::TryFrom<$long_name> for $name {
            type Error = Error;

            fn try_from(v: $long_name) -> Result<$name> {
                v.try_into_narrow()
            }
        }
    };
}

fn narrow_component(v: i64) -> Result<i32> {
    if v > i32::MAX as i64 || v < i32::MIN as i64 {
        Err(Error::index_range(format!(
            "component {} does not fit in a signed 32-bit integer",
            v
        )))
    } else {
        Ok(v as i32)
    }
}

index_type!(Index1D, LongIndex1D, i32, "A 1D index/extent (32-bit).");
index_type!(Index2D, LongIndex2D, i32, "A 2D index/extent (32-bit), `z` unused.");
index_type!(Index3D, LongIndex3D, i32, "A 3D index/extent (32-bit).");

/// `linear(p, extent) = ((p.z * extent.y) + p.y) * extent.x + p.x`
pub fn linearize(point: &Index3D, extent: &Index3D) -> i64 {
    (((point.z as i64) * (extent.y as i64)) + point.y as i64) * (extent.x as i64) + point.x as i64
}

/// Inverse of `linearize`: recovers the point whose linear index under
/// `extent` is `linear`.
pub fn reconstruct(linear: i64, extent: &Index3D) -> Index3D {
    let plane = (extent.x as i64) * (extent.y as i64);
    let z = if plane == 0 { 0 } else { linear / plane };
    let rem = if plane == 0 { linear } else { linear % plane };
    let y = if extent.x == 0 { 0 } else { rem / (extent.x as i64) };
    let x = if extent.x == 0 { 0 } else { rem % (extent.x as i64) };
    Index3D::new(x as i32, y as i32, z as i32)
}

/// 64-bit counterpart of [`linearize`], used for host-side addressing where
/// the extent itself may exceed `i32::MAX` in a dimension.
pub fn linearize_long(point: &LongIndex3D, extent: &LongIndex3D) -> i64 {
    ((point.z * extent.y) + point.y) * extent.x + point.x
}

pub fn reconstruct_long(linear: i64, extent: &LongIndex3D) -> LongIndex3D {
    let plane = extent.x * extent.y;
    let z = if plane == 0 { 0 } else { linear / plane };
    let rem = if plane == 0 { linear } else { linear % plane };
    let y = if extent.x == 0 { 0 } else { rem / extent.x };
    let x = if extent.x == 0 { 0 } else { rem % extent.x };
    LongIndex3D::new(x, y, z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;

    #[test]
    fn linearize_reconstruct_round_trip() {
        let extent = Index3D::new(7, 5, 3);
        for z in 0..extent.z {
            for y in 0..extent.y {
                for x in 0..extent.x {
                    let p = Index3D::new(x, y, z);
                    let lin = linearize(&p, &extent);
                    assert_eq!(reconstruct(lin, &extent), p);
                }
            }
        }
    }

    #[test]
    fn in_bounds_excludes_extent_itself() {
        let extent = Index3D::new(4, 4, 4);
        assert!(Index3D::new(3, 3, 3).in_bounds(&extent));
        assert!(!Index3D::new(4, 0, 0).in_bounds(&extent));
        assert!(Index3D::new(4, 0, 0).in_bounds_inclusive(&extent));
    }

    #[test]
    fn narrowing_conversion_detects_overflow() {
        let big = LongIndex3D::new(i64::from(i32::MAX) + 1, 0, 0);
        assert!(Index3D::try_from(big).is_err());
        let ok = LongIndex3D::new(42, 1, 1);
        assert_eq!(Index3D::try_from(ok).unwrap(), Index3D::new(42, 1, 1));
    }

    #[test]
    fn index1d_size_is_x_only_meaningful_when_y_z_are_one() {
        let e = Index1D::new(1024, 1, 1);
        assert_eq!(e.size(), 1024);
    }
}
