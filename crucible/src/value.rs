//! Runtime values: the dynamically-typed value the CPU emulator's
//! interpreter (`backend::cpu_emulator`) carries per SSA value, and
//! `DynView`, a type-erased `ArrayView<T>` so the interpreter and the
//! Stream's argument marshalling — which flattens a view to
//! `(base_ptr, base_offset, length, stride_components)` — can both work
//! uniformly over whatever element type a kernel parameter names.

use crucible_core::atomic::AtomicOp;
use crucible_core::error::{Error, Result};
use crucible_core::view::ArrayView;

use crate::ir::types::ValueType;

/// One SSA value's runtime content. Integers and floats are always widened
/// to the widest native representation the emulator has on hand;
/// `ir::types::ValueType` (carried alongside every `Instruction`) is the
/// source of truth for the value's declared width and signedness.
#[derive(Debug, Clone, PartialEq)]
pub enum RtValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    View(DynView),
    Struct(Vec<RtValue>),
    Unit,
}

impl RtValue {
    pub fn as_bool(&self) -> Result<bool> {
        match self {
            RtValue::Bool(b) => Ok(*b),
            _ => Err(Error::intrinsic_misuse("expected a boolean value")),
        }
    }

    pub fn as_int(&self) -> Result<i64> {
        match self {
            RtValue::Int(v) => Ok(*v),
            _ => Err(Error::intrinsic_misuse("expected an integer value")),
        }
    }

    pub fn as_float(&self) -> Result<f64> {
        match self {
            RtValue::Float(v) => Ok(*v),
            _ => Err(Error::intrinsic_misuse("expected a floating-point value")),
        }
    }

    pub fn as_view(&self) -> Result<&DynView> {
        match self {
            RtValue::View(v) => Ok(v),
            _ => Err(Error::intrinsic_misuse("expected a view value")),
        }
    }

    pub fn as_struct(&self) -> Result<&[RtValue]> {
        match self {
            RtValue::Struct(fields) => Ok(fields),
            _ => Err(Error::intrinsic_misuse("expected a struct value")),
        }
    }
}

macro_rules! dyn_view {
    ($($variant:ident($t:ty)),* $(,)?) => {
        /// A type-erased `ArrayView<T>`, one variant per primitive element
        /// type the runtime supports as a kernel argument.
        #[derive(Debug, Clone)]
        pub enum DynView {
            $($variant(ArrayView<$t>)),*
        }

        impl DynView {
            pub fn len(&self) -> i64 {
                match self {
                    $(DynView::$variant(v) => v.len()),*
                }
            }

            pub fn element_value_type(&self) -> ValueType {
                match self {
                    $(DynView::$variant(_) => ValueType::element_type_of::<$t>()),*
                }
            }

            pub fn get(&self, i: i64) -> Result<RtValue> {
                match self {
                    $(DynView::$variant(v) => Ok(RtValue::from_element(v.get(i)?))),*
                }
            }

            pub fn set(&self, i: i64, value: &RtValue) -> Result<()> {
                match self {
                    $(DynView::$variant(v) => v.set(i, <$t>::from_rt_value(value)?)),*
                }
            }

            pub fn subview(&self, start: i64, len: i64) -> Result<DynView> {
                match self {
                    $(DynView::$variant(v) => Ok(DynView::$variant(v.subview(start, len)?))),*
                }
            }

            pub fn as_raw_bytes(&self) -> Result<DynView> {
                match self {
                    $(DynView::$variant(v) => Ok(DynView::U8(v.as_raw_bytes()?))),*
                }
            }

            pub fn align_to(&self, alignment_bytes: i32) -> Result<(DynView, DynView)> {
                match self {
                    $(DynView::$variant(v) => {
                        let (prefix, main) = v.align_to(alignment_bytes)?;
                        Ok((DynView::$variant(prefix), DynView::$variant(main)))
                    }),*
                }
            }

            pub fn atomic_compare_exchange(
                &self,
                i: i64,
                expected: &RtValue,
                desired: &RtValue,
            ) -> Result<RtValue> {
                match self {
                    $(DynView::$variant(v) => {
                        let expected = <$t>::from_rt_value(expected)?;
                        let desired = <$t>::from_rt_value(desired)?;
                        Ok(RtValue::from_element(v.atomic_compare_exchange(i, expected, desired)?))
                    }),*
                }
            }
        }
    };
}

dyn_view!(I8(i8), I16(i16), I32(i32), I64(i64), U8(u8), U16(u16), U32(u32), U64(u64), F32(f32), F64(f64));

/// Erases a concrete `ArrayView<T>` into a [`DynView`], the direction the
/// Stream's argument marshalling needs when a caller hands it a
/// typed view to pass as a kernel argument.
pub trait IntoDynView: Sized {
    fn into_dyn_view(view: ArrayView<Self>) -> DynView;
}

macro_rules! impl_into_dyn_view {
    ($($variant:ident($t:ty)),* $(,)?) => {
        $(
            impl IntoDynView for $t {
                fn into_dyn_view(view: ArrayView<$t>) -> DynView {
                    DynView::$variant(view)
                }
            }
        )*
    };
}

impl_into_dyn_view!(
    I8(i8), I16(i16), I32(i32), I64(i64), U8(u8), U16(u16), U32(u32), U64(u64), F32(f32), F64(f64),
);

/// Bridges a concrete element type to/from the interpreter's dynamically
/// typed `RtValue`. Implemented for every primitive `DynView` carries.
trait RuntimeElement: Sized {
    fn from_rt_value(value: &RtValue) -> Result<Self>;
}

impl RtValue {
    pub(crate) fn from_element<T: IntoRtValue>(value: T) -> RtValue {
        value.into_rt_value()
    }
}

/// `pub(crate)` rather than private: the Scan/Reduce Engine (`crate::scan`)
/// needs it to turn a host-computed `Op.Identity()`/`Op.Apply()` result into
/// the constant it embeds in the IR it builds.
pub(crate) trait IntoRtValue {
    fn into_rt_value(self) -> RtValue;
}

macro_rules! impl_int_element {
    ($($t:ty),*) => {
        $(
            impl RuntimeElement for $t {
                fn from_rt_value(value: &RtValue) -> Result<$t> {
                    Ok(value.as_int()? as $t)
                }
            }
            impl IntoRtValue for $t {
                fn into_rt_value(self) -> RtValue {
                    RtValue::Int(self as i64)
                }
            }
        )*
    };
}

impl_int_element!(i8, i16, i32, i64, u8, u16, u32, u64);

macro_rules! impl_float_element {
    ($($t:ty),*) => {
        $(
            impl RuntimeElement for $t {
                fn from_rt_value(value: &RtValue) -> Result<$t> {
                    Ok(value.as_float()? as $t)
                }
            }
            impl IntoRtValue for $t {
                fn into_rt_value(self) -> RtValue {
                    RtValue::Float(self as f64)
                }
            }
        )*
    };
}

impl_float_element!(f32, f64);

/// Integral atomics (`Min`/`Max`/`And`/`Or`/`Xor`) go through this second
/// pass since they are only implemented for `IntegralAtomicElement`, not
/// every `AtomicElement` (float views legally only support `Add`/`Exchange`
/// /`CompareExchange`).
impl DynView {
    /// Applies an atomic read-modify-write at element `i`, returning the
    /// value observed before the operation. `Min`/`Max`/`And`/`Or`/`Xor`
    /// fail with `IntrinsicMisuse` against a floating-point view, which is
    /// restricted to integral element types for these operations.
    pub fn atomic_rmw(&self, i: i64, op: AtomicOp, operand: &RtValue) -> Result<RtValue> {
        macro_rules! integral_dispatch {
            ($v:expr, $t:ty) => {{
                let operand = <$t as RuntimeElement>::from_rt_value(operand)?;
                let before = match op {
                    AtomicOp::Add => $v.atomic_add(i, operand)?,
                    AtomicOp::Exchange => $v.atomic_exchange(i, operand)?,
                    AtomicOp::Min => $v.atomic_min(i, operand)?,
                    AtomicOp::Max => $v.atomic_max(i, operand)?,
                    AtomicOp::And => $v.atomic_and(i, operand)?,
                    AtomicOp::Or => $v.atomic_or(i, operand)?,
                    AtomicOp::Xor => $v.atomic_xor(i, operand)?,
                };
                Ok(RtValue::from_element(before))
            }};
        }
        match self {
            DynView::I8(v) => integral_dispatch!(v, i8),
            DynView::I16(v) => integral_dispatch!(v, i16),
            DynView::I32(v) => integral_dispatch!(v, i32),
            DynView::I64(v) => integral_dispatch!(v, i64),
            DynView::U8(v) => integral_dispatch!(v, u8),
            DynView::U16(v) => integral_dispatch!(v, u16),
            DynView::U32(v) => integral_dispatch!(v, u32),
            DynView::U64(v) => integral_dispatch!(v, u64),
            DynView::F32(v) => match op {
                AtomicOp::Add => Ok(RtValue::from_element(v.atomic_add(i, operand.as_float()? as f32)?)),
                AtomicOp::Exchange => {
                    Ok(RtValue::from_element(v.atomic_exchange(i, operand.as_float()? as f32)?))
                }
                _ => Err(Error::intrinsic_misuse(
                    "min/max/and/or/xor atomics require an integral element type",
                )),
            },
            DynView::F64(v) => match op {
                AtomicOp::Add => Ok(RtValue::from_element(v.atomic_add(i, operand.as_float()?)?)),
                AtomicOp::Exchange => Ok(RtValue::from_element(v.atomic_exchange(i, operand.as_float()?)?)),
                _ => Err(Error::intrinsic_misuse(
                    "min/max/and/or/xor atomics require an integral element type",
                )),
            },
        }
    }
}

impl DynView {
    /// Reinterprets this view's backing bytes as `target`, mirroring
    /// `ArrayView::cast`'s no-copy, pointer-cast-like reinterpretation.
    /// Fails with `ViewCastAlignment` through the
    /// same path `ArrayView::cast` would if `target`'s size does not evenly
    /// divide the view's byte length.
    pub fn cast_to(&self, target: &ValueType) -> Result<DynView> {
        macro_rules! cast_from {
            ($v:expr) => {
                match target {
                    ValueType::Int8 => Ok(DynView::I8($v.cast::<i8>()?)),
                    ValueType::Int16 => Ok(DynView::I16($v.cast::<i16>()?)),
                    ValueType::Int32 => Ok(DynView::I32($v.cast::<i32>()?)),
                    ValueType::Int64 => Ok(DynView::I64($v.cast::<i64>()?)),
                    ValueType::Float32 => Ok(DynView::F32($v.cast::<f32>()?)),
                    ValueType::Float64 => Ok(DynView::F64($v.cast::<f64>()?)),
                    other => Err(Error::view_cast_alignment(format!(
                        "cannot cast a view onto unsupported element type {other}"
                    ))),
                }
            };
        }
        match self {
            DynView::I8(v) => cast_from!(v),
            DynView::I16(v) => cast_from!(v),
            DynView::I32(v) => cast_from!(v),
            DynView::I64(v) => cast_from!(v),
            DynView::U8(v) => cast_from!(v),
            DynView::U16(v) => cast_from!(v),
            DynView::U32(v) => cast_from!(v),
            DynView::U64(v) => cast_from!(v),
            DynView::F32(v) => cast_from!(v),
            DynView::F64(v) => cast_from!(v),
        }
    }
}

impl ValueType {
    /// The `ValueType` corresponding to a native element type, used to tag
    /// a `DynView`'s element type for type-checking view parameters against
    /// a function's declared `Array(ValueType)` parameter type.
    pub fn element_type_of<T: 'static>() -> ValueType {
        use std::any::TypeId;
        let id = TypeId::of::<T>();
        if id == TypeId::of::<i8>() {
            ValueType::Int8
        } else if id == TypeId::of::<i16>() {
            ValueType::Int16
        } else if id == TypeId::of::<i32>() {
            ValueType::Int32
        } else if id == TypeId::of::<i64>() {
            ValueType::Int64
        } else if id == TypeId::of::<u8>() {
            ValueType::Int8
        } else if id == TypeId::of::<u16>() {
            ValueType::Int16
        } else if id == TypeId::of::<u32>() {
            ValueType::Int32
        } else if id == TypeId::of::<u64>() {
            ValueType::Int64
        } else if id == TypeId::of::<f32>() {
            ValueType::Float32
        } else if id == TypeId::of::<f64>() {
            ValueType::Float64
        } else {
            unreachable!("DynView is only ever instantiated over the primitives above")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crucible_core::view::MemoryHandle;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Debug)]
    struct TestBuffer {
        bytes: Mutex<Vec<u8>>,
        disposed: AtomicBool,
    }

    impl TestBuffer {
        fn new(len: usize) -> Arc<TestBuffer> {
            Arc::new(TestBuffer { bytes: Mutex::new(vec![0u8; len]), disposed: AtomicBool::new(false) })
        }
    }

    impl MemoryHandle for TestBuffer {
        fn len_bytes(&self) -> i64 {
            self.bytes.lock().unwrap().len() as i64
        }
        fn is_disposed(&self) -> bool {
            self.disposed.load(Ordering::SeqCst)
        }
        fn identity(&self) -> u64 {
            1
        }
        fn read_bytes(&self, byte_offset: i64, len: i64) -> Option<Vec<u8>> {
            let buf = self.bytes.lock().unwrap();
            buf.get(byte_offset as usize..(byte_offset + len) as usize).map(|s| s.to_vec())
        }
        fn write_bytes(&self, byte_offset: i64, data: &[u8]) -> bool {
            let mut buf = self.bytes.lock().unwrap();
            match buf.get_mut(byte_offset as usize..byte_offset as usize + data.len()) {
                Some(slice) => {
                    slice.copy_from_slice(data);
                    true
                }
                None => false,
            }
        }
        fn atomic_rmw(
            &self,
            byte_offset: i64,
            len: i64,
            op: &mut dyn FnMut(&mut [u8]),
        ) -> Option<Vec<u8>> {
            let mut buf = self.bytes.lock().unwrap();
            let slice = buf.get_mut(byte_offset as usize..(byte_offset + len) as usize)?;
            let before = slice.to_vec();
            op(slice);
            Some(before)
        }
    }

    #[test]
    fn dyn_view_round_trips_through_rt_value() {
        let buf = TestBuffer::new(16);
        let view: ArrayView<i32> = ArrayView::from_buffer(buf, 4);
        let dyn_view = DynView::I32(view);
        dyn_view.set(0, &RtValue::Int(42)).unwrap();
        assert_eq!(dyn_view.get(0).unwrap(), RtValue::Int(42));
    }

    #[test]
    fn atomic_add_through_dyn_view() {
        let buf = TestBuffer::new(16);
        let view: ArrayView<i32> = ArrayView::from_buffer(buf, 4);
        let dyn_view = DynView::I32(view);
        dyn_view.set(0, &RtValue::Int(10)).unwrap();
        let before = dyn_view.atomic_rmw(0, AtomicOp::Add, &RtValue::Int(5)).unwrap();
        assert_eq!(before, RtValue::Int(10));
        assert_eq!(dyn_view.get(0).unwrap(), RtValue::Int(15));
    }
}
