//! # Region Mapping
//!
//! Both store files are accessed exclusively through memory-mapped
//! regions: the page-aligned file header, per-chunk bitmap regions, and
//! individual pages. A region is mapped on demand and lives inside a
//! cache entry (or the file handle, for headers) until evicted; dropping
//! the [`MmapMut`] unmaps it.
//!
//! ## Growth by file-hole allocation
//!
//! Files grow on demand: before mapping a region that extends past the
//! file's logical size, the backing range is materialized with
//! `posix_fallocate`, which extends the file with zeroed blocks without
//! writing them. Chunks that are never touched therefore cost nothing,
//! even though chunk addresses are hundreds of gigabytes apart.
//!
//! The caller owns the logical size (persisted in the file header) and
//! passes it by value; mapping a region entirely below the high-water
//! mark performs no allocation at all.

use std::fs::File;
use std::os::fd::AsRawFd;

use eyre::{ensure, Result, WrapErr};
use memmap2::{MmapMut, MmapOptions};

/// Maps `len` bytes at byte offset `off` of `file`, extending the file
/// first when the region lies past `file_size`. Returns the mapping and
/// the (possibly grown) logical file size. `off` must be host-page
/// aligned.
pub fn map_region(file: &File, file_size: u64, off: u64, len: usize) -> Result<(MmapMut, u64)> {
    let mut size = file_size;

    if size < off + len as u64 {
        // posix_fallocate returns the error number directly and
        // guarantees the new blocks read as zeros.
        let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), off as i64, len as i64) };
        ensure!(
            rc == 0,
            "posix_fallocate of {} bytes at offset {} failed: {}",
            len,
            off,
            std::io::Error::from_raw_os_error(rc)
        );
        size = off + len as u64;
    }

    // SAFETY: map_mut is unsafe because the file could be modified
    // externally. The store is single-process by contract and every
    // region is owned by exactly one cache entry or file handle, so no
    // aliasing mappings of the same range are created.
    let map = unsafe {
        MmapOptions::new()
            .offset(off)
            .len(len)
            .map_mut(file)
            .wrap_err_with(|| format!("failed to map {} bytes at offset {}", len, off))?
    };

    Ok((map, size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_region_grows_file_with_zeros() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grow.bin");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();

        let (map, size) = map_region(&file, 0, 8192, 4096).unwrap();
        assert_eq!(size, 8192 + 4096);
        assert!(map.iter().all(|&b| b == 0));
        assert!(file.metadata().unwrap().len() >= 8192 + 4096);
    }

    #[test]
    fn map_region_below_high_water_does_not_grow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cover.bin");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();

        let (_m, size) = map_region(&file, 0, 0, 16384).unwrap();
        assert_eq!(size, 16384);

        let (_m2, size2) = map_region(&file, size, 4096, 4096).unwrap();
        assert_eq!(size2, size);
    }

    #[test]
    fn writes_persist_through_remap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist.bin");
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();

        let (mut map, size) = map_region(&file, 0, 4096, 4096).unwrap();
        map[0] = 0xAB;
        map[4095] = 0xCD;
        map.flush().unwrap();
        drop(map);

        let (map, _) = map_region(&file, size, 4096, 4096).unwrap();
        assert_eq!(map[0], 0xAB);
        assert_eq!(map[4095], 0xCD);
    }
}
