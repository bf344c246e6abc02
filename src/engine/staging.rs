// Block staging between bulk memory and lane scratchpads
//
// These copies are the only way a running lane touches bulk memory. They are
// byte-exact: `byte_count` bytes starting at the address of `src_point` move
// to the origin of the scratch accessor (or back).
use std::mem::size_of;

use crate::engine::accessor::AffineAccessor;
use crate::engine::element::Element;
use crate::engine::geometry::Point;
use crate::engine::memory::{BulkMemory, ByteSpace, ByteSpaceMut, ScratchBuffer};
use crate::error::{PimError, Result};

/// Bytes occupied by `count` elements of `T`.
pub const fn block_bytes<T>(count: usize) -> usize {
    count * size_of::<T>()
}

/// Validate one transfer and return `(bulk address, scratch offset)`.
fn check_transfer<T: Element, const N: usize>(
    bulk: &BulkMemory,
    bulk_acc: &AffineAccessor<T, N>,
    bulk_point: Point<N>,
    scratch: &ScratchBuffer,
    scratch_acc: &AffineAccessor<T, 1>,
    byte_count: usize,
) -> Result<(usize, usize)> {
    if byte_count % size_of::<T>() != 0 {
        return Err(PimError::Staging(format!(
            "{byte_count} bytes is not a whole number of {} elements",
            std::any::type_name::<T>()
        )));
    }
    let origin = scratch_acc.element_pointer(Point::new([0]));
    let origin = usize::try_from(origin)
        .map_err(|_| PimError::Staging(format!("scratch origin {origin} is negative")))?;
    if origin + byte_count > scratch.capacity() {
        return Err(PimError::Staging(format!(
            "{byte_count} bytes at scratch offset {origin} exceed the {}-byte buffer",
            scratch.capacity()
        )));
    }
    let addr = bulk.check_range(bulk_acc.element_pointer(bulk_point), byte_count)?;
    Ok((addr, origin))
}

/// Copy `byte_count` bytes from bulk memory at `src_point` into `dst`.
///
/// # Safety
/// No other lane may write any byte of the source range while the copy runs.
pub unsafe fn stage_in<T: Element, const N: usize>(
    bulk: &BulkMemory,
    src_acc: &AffineAccessor<T, N>,
    src_point: Point<N>,
    dst: &mut ScratchBuffer,
    dst_acc: &AffineAccessor<T, 1>,
    byte_count: usize,
) -> Result<()> {
    let (addr, origin) = check_transfer(bulk, src_acc, src_point, dst, dst_acc, byte_count)?;
    if byte_count > 0 {
        bulk.read_raw(addr, &mut dst.bytes_mut()[origin..origin + byte_count]);
    }
    Ok(())
}

/// Copy `byte_count` bytes from the origin of `src` back to bulk memory at
/// `dst_point`.
///
/// # Safety
/// No other lane may read or write any byte of the destination range while
/// the copy runs.
pub unsafe fn stage_out<T: Element, const N: usize>(
    bulk: &BulkMemory,
    dst_acc: &AffineAccessor<T, N>,
    dst_point: Point<N>,
    src: &ScratchBuffer,
    src_acc: &AffineAccessor<T, 1>,
    byte_count: usize,
) -> Result<()> {
    let (addr, origin) = check_transfer(bulk, dst_acc, dst_point, src, src_acc, byte_count)?;
    if byte_count > 0 {
        bulk.write_raw(addr, &src.bytes()[origin..origin + byte_count]);
    }
    Ok(())
}
