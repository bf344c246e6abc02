// Node memories: bulk memory, regions and the lane scratchpad
use memmap2::{MmapMut, MmapOptions};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{PimError, Result};

/// Granularity of every bulk region and scratchpad allocation.
pub const ALLOC_ALIGN: usize = 8;

pub(crate) const fn align_up(bytes: usize) -> usize {
    (bytes + ALLOC_ALIGN - 1) & !(ALLOC_ALIGN - 1)
}

/// Anything an accessor can address: a flat run of bytes.
pub trait ByteSpace {
    fn bytes(&self) -> &[u8];
}

pub trait ByteSpaceMut: ByteSpace {
    fn bytes_mut(&mut self) -> &mut [u8];
}

impl ByteSpace for [u8] {
    fn bytes(&self) -> &[u8] {
        self
    }
}

impl ByteSpaceMut for [u8] {
    fn bytes_mut(&mut self) -> &mut [u8] {
        self
    }
}

impl ByteSpace for Vec<u8> {
    fn bytes(&self) -> &[u8] {
        self
    }
}

impl ByteSpaceMut for Vec<u8> {
    fn bytes_mut(&mut self) -> &mut [u8] {
        self
    }
}

/// The large, slow memory of one execution node.
///
/// Backed by an anonymous mapping. The host reaches it through `&mut` while it
/// holds the node lock; lanes of a running kernel share `&BulkMemory` and
/// reach it only through the raw staging copies.
pub struct BulkMemory {
    mapping: MmapMut,
    base: *mut u8,
    len: usize,
}

// Safety: the raw base pointer aliases `mapping`, which lives as long as the
// struct. Concurrent lane access goes through `read_raw`/`write_raw`, whose
// callers uphold the disjoint-write invariant.
unsafe impl Send for BulkMemory {}
unsafe impl Sync for BulkMemory {}

impl BulkMemory {
    pub fn new(len: usize) -> std::io::Result<Self> {
        let mut mapping = MmapOptions::new().len(len).map_anon()?;
        let base = mapping.as_mut_ptr();
        // Kernels move whole blocks at arbitrary offsets, no sequential read-ahead
        #[cfg(unix)]
        unsafe {
            let rc = libc::madvise(base as *mut libc::c_void, len, libc::MADV_RANDOM);
            if rc != 0 {
                tracing::debug!("madvise(MADV_RANDOM) failed on bulk memory of {} bytes", len);
            }
        }
        Ok(Self { mapping, base, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Validate that `addr..addr+len` lies inside this memory.
    pub fn check_range(&self, addr: i64, len: usize) -> Result<usize> {
        let end = addr.checked_add(len as i64);
        match end {
            Some(end) if addr >= 0 && end as u64 <= self.len as u64 => Ok(addr as usize),
            _ => Err(PimError::OutOfBulkMemory {
                offset: addr,
                end: end.unwrap_or(i64::MAX),
                capacity: self.len,
            }),
        }
    }

    /// Copy `dst.len()` bytes starting at `addr` out of bulk memory.
    ///
    /// # Safety
    /// `addr..addr+dst.len()` must be in range and no other lane may be
    /// writing any of those bytes concurrently.
    pub(crate) unsafe fn read_raw(&self, addr: usize, dst: &mut [u8]) {
        debug_assert!(addr + dst.len() <= self.len);
        std::ptr::copy_nonoverlapping(self.base.add(addr), dst.as_mut_ptr(), dst.len());
    }

    /// Copy `src` into bulk memory starting at `addr`.
    ///
    /// # Safety
    /// `addr..addr+src.len()` must be in range and no other lane may be
    /// reading or writing any of those bytes concurrently.
    pub(crate) unsafe fn write_raw(&self, addr: usize, src: &[u8]) {
        debug_assert!(addr + src.len() <= self.len);
        std::ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(addr), src.len());
    }
}

impl ByteSpace for BulkMemory {
    fn bytes(&self) -> &[u8] {
        &self.mapping[..]
    }
}

impl ByteSpaceMut for BulkMemory {
    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.mapping[..]
    }
}

/// A contiguous span of one node's bulk memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionHandle {
    pub node: usize,
    pub offset: usize,
    pub bytes: usize,
}

impl RegionHandle {
    pub fn end(&self) -> usize {
        self.offset + self.bytes
    }

    /// Number of whole `T` elements the region holds.
    pub fn capacity_of<T>(&self) -> usize {
        self.bytes / std::mem::size_of::<T>()
    }

    /// The sub-region `offset..offset+bytes`, relative to this region.
    pub fn slice(&self, offset: usize, bytes: usize) -> Result<RegionHandle> {
        if offset % ALLOC_ALIGN != 0 || offset + bytes > self.bytes {
            return Err(PimError::InvalidRegion(format!(
                "slice {offset}+{bytes} of a {}-byte region at {}",
                self.bytes, self.offset
            )));
        }
        Ok(RegionHandle {
            node: self.node,
            offset: self.offset + offset,
            bytes,
        })
    }
}

/// Bump allocator over a node's bulk memory. Regions are never freed; a node
/// is sized for one run.
#[derive(Debug)]
pub struct RegionAllocator {
    capacity: usize,
    next: AtomicUsize,
}

impl RegionAllocator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next: AtomicUsize::new(0),
        }
    }

    pub fn allocate(&self, node: usize, bytes: usize) -> Result<RegionHandle> {
        if bytes == 0 {
            return Err(PimError::InvalidRegion("zero-sized region".into()));
        }
        let rounded = align_up(bytes);
        let capacity = self.capacity;
        let offset = self
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                next.checked_add(rounded).filter(|end| *end <= capacity)
            })
            .map_err(|next| PimError::OutOfBulkMemory {
                offset: next as i64,
                end: (next + rounded) as i64,
                capacity,
            })?;
        Ok(RegionHandle {
            node,
            offset,
            bytes,
        })
    }

    pub fn free_bytes(&self) -> usize {
        self.capacity - self.next.load(Ordering::Acquire)
    }
}

/// The scratchpad budget of one node, handed out to lanes by a bump
/// allocator. Lane 0 resets it at kernel entry.
#[derive(Debug)]
pub struct ScratchpadPool {
    capacity: usize,
    used: AtomicUsize,
}

impl ScratchpadPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.used.store(0, Ordering::Release);
    }

    /// Carve `bytes` (rounded up to 8) out of the budget.
    pub fn alloc(&self, bytes: usize) -> Result<ScratchBuffer> {
        let rounded = align_up(bytes);
        let capacity = self.capacity;
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(rounded).filter(|end| *end <= capacity)
            })
            .map_err(|used| PimError::ScratchpadExhausted {
                requested: rounded,
                available: capacity - used,
                capacity,
            })?;
        Ok(ScratchBuffer::zeroed(bytes))
    }
}

/// A lane-private scratchpad buffer, 8-byte aligned.
#[derive(Debug, Clone)]
pub struct ScratchBuffer {
    words: Vec<u64>,
    len: usize,
}

impl ScratchBuffer {
    fn zeroed(len: usize) -> Self {
        Self {
            words: vec![0; align_up(len) / ALLOC_ALIGN],
            len,
        }
    }

    pub fn capacity(&self) -> usize {
        self.len
    }
}

impl ByteSpace for ScratchBuffer {
    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.len]
    }
}

impl ByteSpaceMut for ScratchBuffer {
    fn bytes_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut bytemuck::cast_slice_mut(&mut self.words)[..len]
    }
}
