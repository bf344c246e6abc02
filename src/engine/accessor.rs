// Affine address translation
use std::fmt;
use std::marker::PhantomData;
use std::mem::size_of;

use crate::engine::element::Element;
use crate::engine::geometry::{Point, Rect};
use crate::engine::memory::{ByteSpace, ByteSpaceMut, RegionHandle};
use crate::error::{PimError, Result};

/// Maps a point of an index space to a byte address:
/// `address(p) = base + Σ strides[i] * p[i]`.
///
/// Accessors are descriptors, not owners. The base may point before the
/// region it describes so that an instance covering only a sub-rectangle is
/// still addressed in global coordinates.
pub struct AffineAccessor<T, const N: usize> {
    base: i64,
    strides: [i64; N],
    bounds: Option<Rect<N>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T, const N: usize> Clone for AffineAccessor<T, N> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, const N: usize> Copy for AffineAccessor<T, N> {}

impl<T, const N: usize> PartialEq for AffineAccessor<T, N> {
    fn eq(&self, other: &Self) -> bool {
        self.base == other.base && self.strides == other.strides
    }
}

impl<T, const N: usize> fmt::Debug for AffineAccessor<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AffineAccessor")
            .field("elem", &std::any::type_name::<T>())
            .field("base", &self.base)
            .field("strides", &self.strides)
            .field("bounds", &self.bounds)
            .finish()
    }
}

impl<T: Element, const N: usize> AffineAccessor<T, N> {
    pub fn new(base: i64, strides: [i64; N]) -> Self {
        Self {
            base,
            strides,
            bounds: None,
            _marker: PhantomData,
        }
    }

    /// Row-major dense strides for a rectangle, last dimension contiguous.
    pub fn dense_strides(bounds: &Rect<N>) -> [i64; N] {
        let mut strides = [0i64; N];
        let mut step = size_of::<T>() as i64;
        for d in (0..N).rev() {
            strides[d] = step;
            step *= bounds.extent(d).max(1) as i64;
        }
        strides
    }

    /// Dense row-major layout where `bounds.lo` sits at byte `origin`.
    pub fn dense_at(origin: i64, bounds: Rect<N>) -> Self {
        let strides = Self::dense_strides(&bounds);
        let shift: i64 = (0..N).map(|d| strides[d] * bounds.lo[d]).sum();
        Self::new(origin - shift, strides).with_bounds(bounds)
    }

    /// Dense row-major layout starting at byte 0.
    pub fn dense(bounds: Rect<N>) -> Self {
        Self::dense_at(0, bounds)
    }

    /// Dense instance of `bounds` stored at the start of `region`.
    pub fn for_region(region: &RegionHandle, bounds: Rect<N>) -> Result<Self> {
        let needed = bounds.volume() as usize * size_of::<T>();
        if needed > region.bytes {
            return Err(PimError::InvalidRegion(format!(
                "{bounds} of {} needs {needed} bytes, region holds {}",
                std::any::type_name::<T>(),
                region.bytes
            )));
        }
        Ok(Self::dense_at(region.offset as i64, bounds))
    }

    /// Attach logical bounds, checked by debug assertions on every access.
    pub fn with_bounds(mut self, bounds: Rect<N>) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn base(&self) -> i64 {
        self.base
    }

    pub fn strides(&self) -> [i64; N] {
        self.strides
    }

    pub fn bounds(&self) -> Option<Rect<N>> {
        self.bounds
    }

    /// True when both accessors lay the array out identically.
    pub fn is_compatible(&self, other: &Self) -> bool {
        self.strides == other.strides
    }

    /// True when consecutive points along the last axis are adjacent in memory.
    pub fn is_innermost_dense(&self) -> bool {
        self.strides
            .last()
            .map_or(true, |inner| *inner == size_of::<T>() as i64)
    }

    pub fn element_pointer(&self, p: Point<N>) -> i64 {
        if let Some(bounds) = self.bounds {
            debug_assert!(bounds.contains(p), "{p} outside accessor bounds {bounds}");
        }
        let mut addr = self.base;
        for d in 0..N {
            addr += self.strides[d] * p[d];
        }
        addr
    }

    fn byte_range(&self, p: Point<N>, mem_len: usize) -> std::ops::Range<usize> {
        let addr = self.element_pointer(p);
        let start = usize::try_from(addr).ok();
        match start {
            Some(start) if start + size_of::<T>() <= mem_len => start..start + size_of::<T>(),
            _ => panic!(
                "address {addr} of {p} outside a memory of {mem_len} bytes ({:?})",
                self
            ),
        }
    }

    /// Read the element at `p`.
    ///
    /// # Panics
    /// When the computed address falls outside `mem`.
    pub fn read<M: ByteSpace + ?Sized>(&self, mem: &M, p: Point<N>) -> T {
        let bytes = mem.bytes();
        let range = self.byte_range(p, bytes.len());
        bytemuck::pod_read_unaligned(&bytes[range])
    }

    /// Write `value` at `p`.
    ///
    /// # Panics
    /// When the computed address falls outside `mem`.
    pub fn write<M: ByteSpaceMut + ?Sized>(&self, mem: &mut M, p: Point<N>, value: T) {
        let bytes = mem.bytes_mut();
        let range = self.byte_range(p, bytes.len());
        bytes[range].copy_from_slice(bytemuck::bytes_of(&value));
    }
}

impl<T: Element> AffineAccessor<T, 1> {
    /// The dense 1-D accessor used for every lane staging buffer.
    pub fn scratch() -> Self {
        Self::new(0, [size_of::<T>() as i64])
    }

    /// Element `i` of a 1-D accessor.
    pub fn get<M: ByteSpace + ?Sized>(&self, mem: &M, i: i64) -> T {
        self.read(mem, Point::new([i]))
    }

    pub fn set<M: ByteSpaceMut + ?Sized>(&self, mem: &mut M, i: i64, value: T) {
        self.write(mem, Point::new([i]), value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_2d_addresses() {
        let bounds = Rect::new(Point::new([0, 0]), Point::new([3, 4]));
        let acc = AffineAccessor::<f64, 2>::dense(bounds);
        assert_eq!(acc.strides(), [40, 8]);
        assert_eq!(acc.element_pointer(Point::new([0, 0])), 0);
        assert_eq!(acc.element_pointer(Point::new([1, 2])), 56);
        assert!(acc.is_innermost_dense());
    }

    #[test]
    fn sub_rect_instance_uses_global_coordinates() {
        let region = RegionHandle {
            node: 0,
            offset: 64,
            bytes: 4 * 4,
        };
        let acc = AffineAccessor::<i32, 1>::for_region(&region, Rect::span(100, 103)).unwrap();
        assert_eq!(acc.element_pointer(Point::new([100])), 64);
        assert_eq!(acc.element_pointer(Point::new([103])), 76);
        assert_eq!(acc.base(), 64 - 400);
    }

    #[test]
    fn region_too_small_rejected() {
        let region = RegionHandle {
            node: 0,
            offset: 0,
            bytes: 8,
        };
        assert!(AffineAccessor::<f64, 1>::for_region(&region, Rect::span(0, 1)).is_err());
    }

    #[test]
    fn read_after_write() {
        let bounds = Rect::new(Point::new([0, 0]), Point::new([2, 2]));
        let acc = AffineAccessor::<u32, 2>::dense(bounds);
        let mut mem = vec![0u8; 9 * 4];
        for p in bounds.points() {
            acc.write(&mut mem, p, (p[0] * 10 + p[1]) as u32);
        }
        assert_eq!(acc.read(&mem, Point::new([2, 1])), 21);
        assert_eq!(u32::from_le_bytes(mem[4..8].try_into().unwrap()), 1);
    }

    #[test]
    fn scratch_accessor_is_dense() {
        let acc = AffineAccessor::<f32, 1>::scratch();
        let mut mem = vec![0u8; 16];
        acc.set(&mut mem, 3, 1.5);
        assert_eq!(acc.get(&mem, 3), 1.5);
        assert_eq!(acc.strides(), [4]);
    }

    #[test]
    #[should_panic]
    fn out_of_memory_access_panics() {
        let acc = AffineAccessor::<u64, 1>::scratch();
        let mem = vec![0u8; 16];
        let _ = acc.get(&mem, 2);
    }

    #[test]
    fn compatibility_is_about_strides() {
        let bounds = Rect::span(0, 7);
        let a = AffineAccessor::<i32, 1>::dense_at(0, bounds);
        let b = AffineAccessor::<i32, 1>::dense_at(128, bounds);
        assert!(a.is_compatible(&b));
        assert_ne!(a, b);
    }
}
