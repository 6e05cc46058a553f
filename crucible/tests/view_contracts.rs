//! End-to-end exercise of the array-view contract against a real
//! `MemoryBuffer`-backed allocation, rather than the in-crate test doubles
//! `crucible-core`'s own unit tests use.

use crucible::buffer::{copy_from_host, copy_to_host, MemoryBuffer};
use crucible::Error;

#[test]
fn subview_and_cast_compose_over_a_real_buffer() {
    let buf = MemoryBuffer::<i32>::allocate(1, 8).unwrap();
    let view = buf.as_view();
    copy_from_host(&[0, 1, 2, 3, 4, 5, 6, 7], &view).unwrap();

    let middle = view.subview(2, 4).unwrap();
    let mut out = [0i32; 4];
    copy_to_host(&middle, &mut out).unwrap();
    assert_eq!(out, [2, 3, 4, 5]);

    // Reinterpreting the sub-view's bytes as u8 quadruples its element
    // count and must still see the same underlying bytes.
    let bytes = middle.as_raw_bytes().unwrap();
    assert_eq!(bytes.len(), 16);
    let recast: crucible_core::ArrayView<i32> = bytes.cast().unwrap();
    let mut round_tripped = [0i32; 4];
    copy_to_host(&recast, &mut round_tripped).unwrap();
    assert_eq!(round_tripped, out);
}

#[test]
fn subview_past_the_end_is_rejected() {
    let buf = MemoryBuffer::<i32>::allocate(1, 4).unwrap();
    let view = buf.as_view();
    let err = view.subview(2, 4).unwrap_err();
    assert!(matches!(err, Error::ViewBounds { .. }));
}

#[test]
fn a_view_outlives_disposal_as_a_value_but_not_as_an_accessor() {
    let buf = MemoryBuffer::<i32>::allocate(1, 4).unwrap();
    let view = buf.as_view();
    buf.dispose();
    assert!(matches!(view.get(0), Err(Error::BufferDisposed)));
    assert!(matches!(view.set(0, 1), Err(Error::BufferDisposed)));
}
