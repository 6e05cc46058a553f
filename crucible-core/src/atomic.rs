//! Atomic operations over a view element, addressed by `(view, index)`
//! rather than a raw reference (see the `index_element` design note in
//! `view`).

use crate::error::{Error, Result};
use crate::view::{ArrayView, ViewElement};

/// The atomic read-modify-write operations a kernel may perform on a
/// single element. `Add`, `Exchange`, and `CompareExchange` are legal for
/// both integral and floating-point element types; the bitwise and
/// min/max operations are integral-only (enforced by `AtomicElement`'s
/// two sub-traits rather than at this enum's use sites).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomicOp {
    Add,
    Exchange,
    Min,
    Max,
    And,
    Or,
    Xor,
}

/// Element types that support the common atomic subset (`Add`,
/// `Exchange`, `CompareExchange`): every integral and floating-point
/// `ViewElement`.
pub trait AtomicElement: ViewElement {
    fn atomic_add(self, other: Self) -> Self;
}

/// Element types that additionally support `Min`, `Max`, `And`, `Or`,
/// `Xor` — the integral subset.
pub trait IntegralAtomicElement: AtomicElement {
    fn atomic_min(self, other: Self) -> Self;
    fn atomic_max(self, other: Self) -> Self;
    fn atomic_and(self, other: Self) -> Self;
    fn atomic_or(self, other: Self) -> Self;
    fn atomic_xor(self, other: Self) -> Self;
}

macro_rules! impl_integral_atomics {
    ($($t:ty),* $(,)?) => {
        $(
            impl AtomicElement for $t {
                fn atomic_add(self, other: Self) -> Self { self.wrapping_add(other) }
            }
            impl IntegralAtomicElement for $t {
                fn atomic_min(self, other: Self) -> Self { std::cmp::min(self, other) }
                fn atomic_max(self, other: Self) -> Self { std::cmp::max(self, other) }
                fn atomic_and(self, other: Self) -> Self { self & other }
                fn atomic_or(self, other: Self) -> Self { self | other }
                fn atomic_xor(self, other: Self) -> Self { self ^ other }
            }
        )*
    };
}

impl_integral_atomics!(u8, i8, u16, i16, u32, i32, u64, i64, usize, isize);

macro_rules! impl_float_atomics {
    ($($t:ty),* $(,)?) => {
        $(
            impl AtomicElement for $t {
                fn atomic_add(self, other: Self) -> Self { self + other }
            }
        )*
    };
}

impl_float_atomics!(f32, f64);

fn to_bytes<T: ViewElement>(value: T) -> Vec<u8> {
    let size = std::mem::size_of::<T>();
    let mut out = vec![0u8; size];
    unsafe {
        std::ptr::copy_nonoverlapping(&value as *const T as *const u8, out.as_mut_ptr(), size);
    }
    out
}

fn from_bytes<T: ViewElement>(bytes: &[u8]) -> T {
    unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const T) }
}

impl<T: AtomicElement> ArrayView<T> {
    fn atomic_generic(&self, i: i64, apply: impl FnOnce(T) -> T) -> Result<T> {
        if i < 0 || i >= self.len() {
            return Err(Error::view_bounds(i, self.len()));
        }
        let elem_size = Self::element_size() as i64;
        let byte_offset = self.stride().offset_of(self.base_offset() + i) * elem_size;
        let mut apply = Some(apply);
        let mut old_value: Option<T> = None;
        let observed = self.buffer_atomic_rmw(byte_offset, elem_size, &mut |bytes| {
            let current: T = from_bytes(bytes);
            old_value = Some(current);
            let next = (apply.take().expect("atomic closure runs exactly once"))(current);
            bytes.copy_from_slice(&to_bytes(next));
        });
        observed.ok_or_else(|| {
            Error::intrinsic_misuse("atomic operation on a handle with no atomic support")
        })?;
        Ok(old_value.expect("atomic closure always sets old_value"))
    }

    /// Adds `operand` at `i`, returning the value observed before the add.
    pub fn atomic_add(&self, i: i64, operand: T) -> Result<T> {
        self.atomic_generic(i, move |current| current.atomic_add(operand))
    }

    /// Stores `operand` at `i`, returning the value observed before the
    /// store.
    pub fn atomic_exchange(&self, i: i64, operand: T) -> Result<T> {
        self.atomic_generic(i, move |_current| operand)
    }

    /// Stores `desired` at `i` only if the current value equals
    /// `expected`; returns the value observed before the attempt either
    /// way (CAS-style, matching the hardware intrinsic's contract).
    pub fn atomic_compare_exchange(&self, i: i64, expected: T, desired: T) -> Result<T>
    where
        T: PartialEq,
    {
        self.atomic_generic(i, move |current| if current == expected { desired } else { current })
    }
}

impl<T: IntegralAtomicElement> ArrayView<T> {
    pub fn atomic_min(&self, i: i64, operand: T) -> Result<T> {
        self.atomic_generic(i, move |current| current.atomic_min(operand))
    }

    pub fn atomic_max(&self, i: i64, operand: T) -> Result<T> {
        self.atomic_generic(i, move |current| current.atomic_max(operand))
    }

    pub fn atomic_and(&self, i: i64, operand: T) -> Result<T> {
        self.atomic_generic(i, move |current| current.atomic_and(operand))
    }

    pub fn atomic_or(&self, i: i64, operand: T) -> Result<T> {
        self.atomic_generic(i, move |current| current.atomic_or(operand))
    }

    pub fn atomic_xor(&self, i: i64, operand: T) -> Result<T> {
        self.atomic_generic(i, move |current| current.atomic_xor(operand))
    }
}

// Bridges to the private field accessors needed above without widening
// `ArrayView`'s public surface; kept as a tiny extension trait so this
// module owns all atomic-specific plumbing.
trait AtomicBufferAccess {
    fn buffer_atomic_rmw(
        &self,
        byte_offset: i64,
        len: i64,
        op: &mut dyn FnMut(&mut [u8]),
    ) -> Option<Vec<u8>>;
}

impl<T: ViewElement> AtomicBufferAccess for ArrayView<T> {
    fn buffer_atomic_rmw(
        &self,
        byte_offset: i64,
        len: i64,
        op: &mut dyn FnMut(&mut [u8]),
    ) -> Option<Vec<u8>> {
        self.raw_buffer().atomic_rmw(byte_offset, len, op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::MemoryHandle;
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
    fn atomic_add_returns_previous_value() {
        let buf = TestBuffer::new(4);
        let v: ArrayView<u32> = ArrayView::from_buffer(buf, 1);
        v.set(0, 10).unwrap();
        let prev = v.atomic_add(0, 5).unwrap();
        assert_eq!(prev, 10);
        assert_eq!(v.get(0).unwrap(), 15);
    }

    #[test]
    fn compare_exchange_only_swaps_on_match() {
        let buf = TestBuffer::new(4);
        let v: ArrayView<i32> = ArrayView::from_buffer(buf, 1);
        v.set(0, 7).unwrap();
        let prev = v.atomic_compare_exchange(0, 99, 1).unwrap();
        assert_eq!(prev, 7);
        assert_eq!(v.get(0).unwrap(), 7);
        let prev2 = v.atomic_compare_exchange(0, 7, 1).unwrap();
        assert_eq!(prev2, 7);
        assert_eq!(v.get(0).unwrap(), 1);
    }
}
