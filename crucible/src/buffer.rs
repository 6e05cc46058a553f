//! `MemoryBuffer<T>`: an owning, contiguous, device-side allocation
//! and the copy/fill primitives that operate through views derived from
//! it. Lifecycle: created by stream allocation, disposed
//! exactly once (idempotent on a second call), and any further access
//! through a derived view after disposal fails with `BufferDisposed`.
//!
//! Real device-driver-backed allocations are out of scope; this
//! module's `BufferState` is always host-resident, which is sufficient to
//! back the CPU Emulator and to stand in for the opaque device handle a
//! GPU backend would need.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crucible_core::error::{Error, Result};
use crucible_core::view::{ArrayView, MemoryHandle, ViewElement};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

struct BufferState {
    bytes: Mutex<Vec<u8>>,
    disposed: AtomicBool,
    id: u64,
    owning_accelerator: u64,
}

impl fmt::Debug for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferState")
            .field("id", &self.id)
            .field("owning_accelerator", &self.owning_accelerator)
            .field("disposed", &self.disposed.load(Ordering::SeqCst))
            .finish()
    }
}

impl MemoryHandle for BufferState {
    fn len_bytes(&self) -> i64 {
        self.bytes.lock().expect("buffer lock poisoned").len() as i64
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn identity(&self) -> u64 {
        self.id
    }

    fn read_bytes(&self, byte_offset: i64, len: i64) -> Option<Vec<u8>> {
        if self.is_disposed() {
            return None;
        }
        let buf = self.bytes.lock().expect("buffer lock poisoned");
        buf.get(byte_offset as usize..(byte_offset + len) as usize)
            .map(|s| s.to_vec())
    }

    fn write_bytes(&self, byte_offset: i64, data: &[u8]) -> bool {
        if self.is_disposed() {
            return false;
        }
        let mut buf = self.bytes.lock().expect("buffer lock poisoned");
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
        if self.is_disposed() {
            return None;
        }
        let mut buf = self.bytes.lock().expect("buffer lock poisoned");
        let slice = buf.get_mut(byte_offset as usize..(byte_offset + len) as usize)?;
        let before = slice.to_vec();
        op(slice);
        Some(before)
    }
}

/// An owning allocation of `elems` elements of `T` on a specific
/// accelerator (identified by `owning_accelerator`, an opaque id supplied
/// by the owning `Stream`).
pub struct MemoryBuffer<T: ViewElement> {
    state: Arc<BufferState>,
    elems: i64,
    _marker: PhantomData<T>,
}

impl<T: ViewElement> fmt::Debug for MemoryBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBuffer")
            .field("elems", &self.elems)
            .field("state", &self.state)
            .finish()
    }
}

impl<T: ViewElement> MemoryBuffer<T> {
    /// Allocates `elems` zero-initialized elements of `T` on the
    /// accelerator identified by `owning_accelerator`.
    pub fn allocate(owning_accelerator: u64, elems: i64) -> Result<MemoryBuffer<T>> {
        if elems < 0 {
            return Err(Error::index_range("allocation length must be non-negative"));
        }
        let len_bytes = (elems as i64)
            .checked_mul(T::size_of() as i64)
            .ok_or_else(|| Error::OutOfMemory { requested_bytes: i64::MAX })?;
        let state = Arc::new(BufferState {
            bytes: Mutex::new(vec![0u8; len_bytes as usize]),
            disposed: AtomicBool::new(false),
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
            owning_accelerator,
        });
        log::debug!(
            "allocated buffer #{} ({} bytes) on accelerator {}",
            state.id,
            len_bytes,
            owning_accelerator
        );
        Ok(MemoryBuffer { state, elems, _marker: PhantomData })
    }

    pub fn len(&self) -> i64 {
        self.elems
    }

    pub fn is_empty(&self) -> bool {
        self.elems == 0
    }

    pub fn owning_accelerator(&self) -> u64 {
        self.state.owning_accelerator
    }

    pub fn is_disposed(&self) -> bool {
        self.state.is_disposed()
    }

    /// A dense view over the full allocation.
    pub fn as_view(&self) -> ArrayView<T> {
        ArrayView::from_buffer(self.state.clone(), self.elems)
    }

    /// Releases the allocation. Idempotent: a second call is a no-op.
    pub fn dispose(&self) {
        if !self.state.disposed.swap(true, Ordering::SeqCst) {
            log::debug!("disposed buffer #{}", self.state.id);
            let mut bytes = self.state.bytes.lock().expect("buffer lock poisoned");
            bytes.clear();
            bytes.shrink_to_fit();
        }
    }
}

impl<T: ViewElement> Drop for MemoryBuffer<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// `copy_from_host(src, dst_view)`: copies `src` into the elements
/// addressed by `dst_view`. `src.len() != dst_view.len()` is a contract
/// violation surfaced as `ViewBounds`.
pub fn copy_from_host<T: ViewElement>(src: &[T], dst_view: &ArrayView<T>) -> Result<()> {
    if src.len() as i64 != dst_view.len() {
        return Err(Error::view_bounds(src.len() as i64, dst_view.len()));
    }
    for (i, value) in src.iter().enumerate() {
        dst_view.set(i as i64, *value)?;
    }
    Ok(())
}

/// `copy_to_host(src_view, dst)`: the inverse of [`copy_from_host`].
pub fn copy_to_host<T: ViewElement>(src_view: &ArrayView<T>, dst: &mut [T]) -> Result<()> {
    if dst.len() as i64 != src_view.len() {
        return Err(Error::view_bounds(dst.len() as i64, src_view.len()));
    }
    for (i, slot) in dst.iter_mut().enumerate() {
        *slot = src_view.get(i as i64)?;
    }
    Ok(())
}

/// `fill(dst_view, value)`: writes `value` to every element of
/// `dst_view`.
pub fn fill<T: ViewElement>(dst_view: &ArrayView<T>, value: T) -> Result<()> {
    for i in 0..dst_view.len() {
        dst_view.set(i, value)?;
    }
    Ok(())
}

/// `memset_zero(dst_view)`: zero-fills `dst_view`. Implemented in
/// terms of [`fill`] over the view's raw bytes so it works uniformly
/// regardless of `T`.
pub fn memset_zero<T: ViewElement>(dst_view: &ArrayView<T>) -> Result<()> {
    let bytes = dst_view.as_raw_bytes()?;
    fill(&bytes, 0u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_round_trips_through_a_buffer() {
        let buf: MemoryBuffer<i32> = MemoryBuffer::allocate(1, 4).unwrap();
        let view = buf.as_view();
        copy_from_host(&[1, 2, 3, 4], &view).unwrap();
        let mut out = [0i32; 4];
        copy_to_host(&view, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn fill_writes_every_element() {
        let buf: MemoryBuffer<u32> = MemoryBuffer::allocate(1, 8).unwrap();
        let view = buf.as_view();
        fill(&view, 7u32).unwrap();
        let mut out = [0u32; 8];
        copy_to_host(&view, &mut out).unwrap();
        assert_eq!(out, [7u32; 8]);
    }

    #[test]
    fn memset_zero_clears_nonzero_contents() {
        let buf: MemoryBuffer<u32> = MemoryBuffer::allocate(1, 4).unwrap();
        let view = buf.as_view();
        fill(&view, 0xFFFF_FFFFu32).unwrap();
        memset_zero(&view).unwrap();
        let mut out = [1u32; 4];
        copy_to_host(&view, &mut out).unwrap();
        assert_eq!(out, [0u32; 4]);
    }

    #[test]
    fn dispose_is_idempotent_and_denies_further_access() {
        let buf: MemoryBuffer<u32> = MemoryBuffer::allocate(1, 4).unwrap();
        let view = buf.as_view();
        buf.dispose();
        buf.dispose();
        assert!(matches!(view.get(0), Err(Error::BufferDisposed)));
    }

    #[test]
    fn mismatched_lengths_fail_with_view_bounds() {
        let buf: MemoryBuffer<u32> = MemoryBuffer::allocate(1, 4).unwrap();
        let view = buf.as_view();
        assert!(copy_from_host(&[1, 2], &view).is_err());
    }
}
