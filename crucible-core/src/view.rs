//! `ArrayView<T>`: the non-owning, typed, strided handle that is the sole
//! legal way to address memory from inside a kernel.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::stride::Stride;

/// Marker for types that may populate an `ArrayView`.
///
/// A primitive marker trait: implementing it is an assertion that `Self`
/// has no padding, no interior pointers, and no `Drop` glue, so views may
/// reinterpret raw bytes freely.
///
/// # Safety
///
/// Implementors must be `Copy`, contain no padding bytes that participate
/// in equality/hashing expectations, and be safe to reinterpret as an
/// arbitrary byte pattern (and vice versa).
pub unsafe trait ViewElement: fmt::Debug + Copy + Send + Sync + 'static {
    /// Size in bytes. A free function rather than relying on
    /// `mem::size_of` at call sites keeps the cast/alignment arithmetic in
    /// one place.
    fn size_of() -> i32 {
        std::mem::size_of::<Self>() as i32
    }
}

macro_rules! impl_view_element {
    ($($t:ty),* $(,)?) => {
        $(unsafe impl ViewElement for $t {})*
    };
}

impl_view_element!(u8, i8, u16, i16, u32, i32, u64, i64, usize, isize, f32, f64);

/// An owning allocation's identity and disposal state, as seen from a
/// view. `MemoryBuffer` (in the `crucible` crate) is the only thing that
/// constructs and disposes these; `ArrayView` only reads them.
pub trait MemoryHandle: fmt::Debug + Send + Sync {
    /// Length of the backing allocation in bytes.
    fn len_bytes(&self) -> i64;

    /// `true` once `dispose()` has run; any further access through a view
    /// derived from this handle is a contract violation (detected here in
    /// assertions mode, undefined otherwise).
    fn is_disposed(&self) -> bool;

    /// Opaque identity, stable for the handle's lifetime, used only for
    /// equality/debugging (e.g. to confirm two views share a buffer).
    fn identity(&self) -> u64;

    /// Reads `len` bytes starting at `byte_offset`. Only implemented by
    /// handles backed by host-accessible storage (the CPU emulator); the
    /// default returns `None` to signal an opaque, driver-owned
    /// allocation.
    fn read_bytes(&self, _byte_offset: i64, _len: i64) -> Option<Vec<u8>> {
        None
    }

    /// Writes `data` starting at `byte_offset`. See `read_bytes`.
    fn write_bytes(&self, _byte_offset: i64, _data: &[u8]) -> bool {
        false
    }

    /// Applies `op` to the `len`-byte window at `byte_offset` as a single
    /// atomic read-modify-write, returning the bytes observed *before*
    /// `op` ran. The CPU emulator backs this with a per-buffer lock;
    /// opaque driver-owned handles return `None`.
    fn atomic_rmw(
        &self,
        _byte_offset: i64,
        _len: i64,
        _op: &mut dyn FnMut(&mut [u8]),
    ) -> Option<Vec<u8>> {
        None
    }
}

/// A non-owning typed handle over a slice of a `MemoryHandle`'s storage:
/// `(buffer, base_offset_in_elements, length, stride)`.
#[derive(Clone)]
pub struct ArrayView<T: ViewElement> {
    buffer: Arc<dyn MemoryHandle>,
    base_offset: i64,
    length: i64,
    stride: Stride,
    _marker: PhantomData<T>,
}

impl<T: ViewElement> fmt::Debug for ArrayView<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayView")
            .field("buffer", &self.buffer.identity())
            .field("base_offset", &self.base_offset)
            .field("length", &self.length)
            .field("stride", &self.stride)
            .finish()
    }
}

impl<T: ViewElement> ArrayView<T> {
    /// Constructs a view over the full extent of `buffer`, interpreted
    /// with a dense stride. `MemoryBuffer::as_view` is the usual caller.
    pub fn from_buffer(buffer: Arc<dyn MemoryHandle>, length: i64) -> ArrayView<T> {
        ArrayView {
            buffer,
            base_offset: 0,
            length,
            stride: Stride::dense(),
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> i64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn len_bytes(&self) -> i64 {
        self.length * Self::element_size() as i64
    }

    pub fn element_size() -> i32 {
        T::size_of()
    }

    /// `buffer present (always true in this type system) && length > 0`.
    /// Disposal is a separate, dynamic contract tracked by `MemoryHandle`.
    pub fn is_valid(&self) -> bool {
        self.length > 0
    }

    pub fn base_offset(&self) -> i64 {
        self.base_offset
    }

    pub fn stride(&self) -> &Stride {
        &self.stride
    }

    pub fn buffer_identity(&self) -> u64 {
        self.buffer.identity()
    }

    pub(crate) fn raw_buffer(&self) -> &Arc<dyn MemoryHandle> {
        &self.buffer
    }

    fn check_disposed(&self) -> Result<()> {
        if self.buffer.is_disposed() {
            Err(Error::BufferDisposed)
        } else {
            Ok(())
        }
    }

    /// Reads the element at `i`. Precondition: `0 <= i < len`.
    pub fn get(&self, i: i64) -> Result<T> {
        self.check_disposed()?;
        if i < 0 || i >= self.length {
            return Err(Error::view_bounds(i, self.length));
        }
        let elem_size = Self::element_size() as i64;
        let byte_offset = self.stride.offset_of(self.base_offset + i) * elem_size;
        let bytes = self.buffer.read_bytes(byte_offset, elem_size).ok_or_else(|| {
            Error::intrinsic_misuse(
                "element access attempted on a handle with no host-accessible storage",
            )
        })?;
        Ok(bytes_to_value(&bytes))
    }

    /// Writes `value` at `i`. Precondition: `0 <= i < len`.
    pub fn set(&self, i: i64, value: T) -> Result<()> {
        self.check_disposed()?;
        if i < 0 || i >= self.length {
            return Err(Error::view_bounds(i, self.length));
        }
        let elem_size = Self::element_size() as i64;
        let byte_offset = self.stride.offset_of(self.base_offset + i) * elem_size;
        let bytes = value_to_bytes(&value);
        if !self.buffer.write_bytes(byte_offset, &bytes) {
            return Err(Error::intrinsic_misuse(
                "element access attempted on a handle with no host-accessible storage",
            ));
        }
        Ok(())
    }

    /// `sv = v.subview(i, n)`: `0 <= i && i + n <= v.len`. The stride is
    /// preserved; only the logical base index moves (composition rule).
    pub fn subview(&self, i: i64, n: i64) -> Result<ArrayView<T>> {
        if i < 0 || n < 0 || i + n > self.length {
            return Err(Error::view_bounds(i, self.length));
        }
        Ok(ArrayView {
            buffer: self.buffer.clone(),
            base_offset: self.base_offset + i,
            length: n,
            stride: self.stride.clone(),
            _marker: PhantomData,
        })
    }

    /// Reinterprets this view's elements as `U`, requiring that `U`'s size
    /// evenly divide this view's byte length. Only well-defined for
    /// `Dense`-strided views; strided casts fail since there is no single
    /// well-defined stride for the new element width.
    pub fn cast<U: ViewElement>(&self) -> Result<ArrayView<U>> {
        if !self.stride.is_dense() {
            return Err(Error::view_cast_alignment(
                "cannot cast a non-dense (strided) view",
            ));
        }
        let total_bytes = self.len_bytes();
        let new_elem_size = U::size_of() as i64;
        if new_elem_size == 0 || total_bytes % new_elem_size != 0 {
            return Err(Error::view_cast_alignment(format!(
                "element size {} does not evenly divide {} bytes",
                new_elem_size, total_bytes
            )));
        }
        let new_len = total_bytes / new_elem_size;
        let old_elem_size = Self::element_size() as i64;
        // base_offset is expressed in elements of T; convert through bytes
        // so the cast is correct regardless of the relative element sizes.
        let base_bytes = self.base_offset * old_elem_size;
        if base_bytes % new_elem_size != 0 {
            return Err(Error::view_cast_alignment(
                "view's base offset is not aligned to the target element size",
            ));
        }
        Ok(ArrayView {
            buffer: self.buffer.clone(),
            base_offset: base_bytes / new_elem_size,
            length: new_len,
            stride: Stride::dense(),
            _marker: PhantomData,
        })
    }

    /// Reinterprets this view as a view of bytes. The inverse (`cast`-ing
    /// back to `T`) is legal but must be spelled out explicitly; there is
    /// no automatic un-erasure.
    pub fn as_raw_bytes(&self) -> Result<ArrayView<u8>> {
        self.cast::<u8>()
    }

    /// Splits into `(prefix, main)` such that `main`'s first element
    /// starts at a multiple of `alignment_bytes`. `alignment_bytes` must
    /// be a power of two and a multiple of `sizeof(T)`.
    pub fn align_to(&self, alignment_bytes: i32) -> Result<(ArrayView<T>, ArrayView<T>)> {
        let elem_size = Self::element_size();
        if alignment_bytes <= 0 || (alignment_bytes as u32).count_ones() != 1 {
            return Err(Error::view_cast_alignment(
                "alignment must be a power of two",
            ));
        }
        if alignment_bytes % elem_size != 0 {
            return Err(Error::view_cast_alignment(
                "alignment must be a multiple of the element size",
            ));
        }
        let elems_per_alignment = (alignment_bytes / elem_size) as i64;
        // We have no real device address to align to; the base offset
        // (in elements) stands in for it, matching how `MemoryBuffer`
        // allocations are always aligned to at least `elem_size`.
        let misalignment = (self.base_offset * elem_size as i64) % alignment_bytes as i64;
        let prefix_len = if misalignment == 0 {
            0
        } else {
            let pad_bytes = alignment_bytes as i64 - misalignment;
            (pad_bytes / elem_size as i64).min(self.length)
        };
        let prefix = self.subview(0, prefix_len)?;
        let main = self.subview(prefix_len, self.length - prefix_len)?;
        debug_assert!(main.length >= self.length - (elems_per_alignment - 1));
        Ok((prefix, main))
    }
}

fn value_to_bytes<T: ViewElement>(value: &T) -> Vec<u8> {
    let size = std::mem::size_of::<T>();
    let mut out = vec![0u8; size];
    unsafe {
        std::ptr::copy_nonoverlapping(value as *const T as *const u8, out.as_mut_ptr(), size);
    }
    out
}

fn bytes_to_value<T: ViewElement>(bytes: &[u8]) -> T {
    debug_assert_eq!(bytes.len(), std::mem::size_of::<T>());
    unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const T) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Debug)]
    struct TestBuffer {
        bytes: Mutex<Vec<u8>>,
        disposed: AtomicBool,
        id: u64,
    }

    impl TestBuffer {
        fn new(len_bytes: usize) -> Arc<TestBuffer> {
            Arc::new(TestBuffer {
                bytes: Mutex::new(vec![0u8; len_bytes]),
                disposed: AtomicBool::new(false),
                id: 1,
            })
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
            self.id
        }

        fn read_bytes(&self, byte_offset: i64, len: i64) -> Option<Vec<u8>> {
            let buf = self.bytes.lock().unwrap();
            let start = byte_offset as usize;
            let end = start + len as usize;
            buf.get(start..end).map(|s| s.to_vec())
        }

        fn write_bytes(&self, byte_offset: i64, data: &[u8]) -> bool {
            let mut buf = self.bytes.lock().unwrap();
            let start = byte_offset as usize;
            let end = start + data.len();
            match buf.get_mut(start..end) {
                Some(slice) => {
                    slice.copy_from_slice(data);
                    true
                }
                None => false,
            }
        }
    }

    fn view_of_u32s(n: i64) -> ArrayView<u32> {
        let buf = TestBuffer::new((n * 4) as usize);
        ArrayView::from_buffer(buf, n)
    }

    #[test]
    fn get_set_round_trip() {
        let v = view_of_u32s(8);
        for i in 0..8 {
            v.set(i, (i * 3) as u32).unwrap();
        }
        for i in 0..8 {
            assert_eq!(v.get(i).unwrap(), (i * 3) as u32);
        }
    }

    #[test]
    fn subview_round_trip_matches_spec_scenario() {
        let v = view_of_u32s(1024);
        let a = v.subview(256, 512).unwrap().subview(0, 128).unwrap();
        let b = v.subview(256, 128).unwrap();
        assert_eq!(a.len(), b.len());
        assert_eq!(a.base_offset(), b.base_offset());
    }

    #[test]
    fn subview_out_of_range_fails() {
        let v = view_of_u32s(16);
        assert!(v.subview(10, 10).is_err());
        assert!(v.subview(-1, 1).is_err());
    }

    #[test]
    fn cast_u8_to_u32_requires_multiple_of_four() {
        let buf = TestBuffer::new(10);
        let v: ArrayView<u8> = ArrayView::from_buffer(buf, 10);
        assert!(v.cast::<u32>().is_err());
        let buf2 = TestBuffer::new(12);
        let v2: ArrayView<u8> = ArrayView::from_buffer(buf2, 12);
        let casted = v2.cast::<u32>().unwrap();
        assert_eq!(casted.len(), 3);
    }

    #[test]
    fn align_to_already_aligned_yields_empty_prefix() {
        let v = view_of_u32s(64);
        let (prefix, main) = v.align_to(16).unwrap();
        assert_eq!(prefix.len(), 0);
        assert_eq!(main.len(), 64);
    }

    #[test]
    fn align_to_rejects_non_power_of_two() {
        let v = view_of_u32s(64);
        assert!(v.align_to(12).is_err());
    }

    #[test]
    fn disposed_buffer_denies_access() {
        let buf = TestBuffer::new(16);
        buf.disposed.store(true, Ordering::SeqCst);
        let v: ArrayView<u32> = ArrayView::from_buffer(buf, 4);
        assert!(matches!(v.get(0), Err(Error::BufferDisposed)));
    }
}
