// Dump I/O
// Flat binary element files through file-backed memory maps
use memmap2::{Mmap, MmapMut};
use std::fs::{File, OpenOptions};
use std::mem::size_of;
use std::path::Path;

use crate::engine::element::Element;
use crate::error::{PimError, Result};

/// Write the raw little-endian bytes of `values` to `path`, replacing it.
pub fn dump_elements<T: Element>(path: impl AsRef<Path>, values: &[T]) -> Result<()> {
    let path = path.as_ref();
    let bytes: &[u8] = bytemuck::cast_slice(values);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(bytes.len() as u64)?;
    // an empty file cannot be mapped
    if !bytes.is_empty() {
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        map.copy_from_slice(bytes);
        map.flush()?;
    }
    tracing::debug!(path = %path.display(), elements = values.len(), dtype = %T::DTYPE, "dumped");
    Ok(())
}

/// Read back a file written by [`dump_elements`].
pub fn load_elements<T: Element>(path: impl AsRef<Path>) -> Result<Vec<T>> {
    let file = File::open(path.as_ref())?;
    let len = file.metadata()?.len() as usize;
    if len % size_of::<T>() != 0 {
        return Err(PimError::ElementMismatch(format!(
            "{len}-byte file is not a whole number of {} elements",
            T::DTYPE
        )));
    }
    if len == 0 {
        return Ok(Vec::new());
    }
    let map = unsafe { Mmap::map(&file)? };
    Ok(map
        .chunks_exact(size_of::<T>())
        .map(bytemuck::pod_read_unaligned)
        .collect())
}
