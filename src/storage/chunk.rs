//! # Chunk Bitmap Allocator
//!
//! Each 512 MiB chunk of a store file begins with a reserved region
//! holding a bitmap, one bit per page slot. A [`Chunk`] owns the live
//! mapping of that region plus a scan cursor, and hands out runs of
//! consecutive free slots.
//!
//! The bitmap covers every slot in the chunk, including the slots the
//! bitmap region itself occupies; those leading slots are never offered
//! (the scan range starts past them), so bits below `first` stay zero.
//!
//! Allocation is first-fit from the cursor: remembering the last
//! handed-out bit makes consecutive allocations contiguous and avoids
//! rescanning the densely packed prefix every time. The scan wraps to
//! the start of the allocatable range exactly once; a run in progress at
//! the wrap point restarts, so no extent straddles the wrap.
//!
//! `mask`/`unmask` are not idempotent — the file-level allocator owns
//! the discipline of never double-freeing an extent.

use eyre::{Result, WrapErr};
use memmap2::MmapMut;

use super::cache::CacheItem;
use super::pointer::{Ptr, PTR_NULL};

pub struct Chunk {
    id: u64,
    bits: MmapMut,
    /// First allocatable bit (slots below are the bitmap region itself).
    first: u32,
    /// Total bits, one per page slot in the chunk.
    total: u32,
    /// Last handed-out bit; scans resume here.
    cursor: u32,
    dirty: bool,
}

impl Chunk {
    pub fn new(id: u64, bits: MmapMut, first: u32, total: u32) -> Self {
        debug_assert!(first < total);
        debug_assert!(bits.len() * 8 >= total as usize);
        Self {
            id,
            bits,
            first,
            total,
            cursor: first,
            dirty: false,
        }
    }

    /// Finds and returns the start of a run of `n` consecutive free
    /// slots, or [`PTR_NULL`] when no such run exists. Does not mask.
    pub fn get(&mut self, n: u32) -> Ptr {
        debug_assert!(n > 0);

        let mut r = self.cursor;
        let mut l = r;
        let mut i = self.first;

        while i < self.total {
            if r == self.total {
                r = self.first;
                l = r; // runs never cross the wrap point
            }
            if self.test(r as u64) {
                l = r + 1;
            } else if r - l + 1 == n {
                self.cursor = r;
                return l as Ptr;
            }
            i += 1;
            r += 1;
        }

        PTR_NULL
    }

    #[inline]
    pub fn test(&self, bit: u64) -> bool {
        self.bits[(bit >> 3) as usize] & (1 << (bit & 7)) != 0
    }

    /// Sets `n` consecutive bits starting at `p`.
    pub fn mask(&mut self, p: Ptr, n: u64) {
        for bit in p..p + n {
            self.bits[(bit >> 3) as usize] |= 1 << (bit & 7);
        }
    }

    /// Clears `n` consecutive bits starting at `p`.
    pub fn unmask(&mut self, p: Ptr, n: u64) {
        for bit in p..p + n {
            self.bits[(bit >> 3) as usize] &= !(1 << (bit & 7));
        }
        self.dirty = true;
    }

    #[inline]
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

impl CacheItem for Chunk {
    fn id(&self) -> u64 {
        self.id
    }

    fn sync(&mut self, unmap: bool) -> Result<()> {
        // Bitmaps always flush synchronously: a stale bitmap after crash
        // would resurrect freed extents under live ones.
        if unmap {
            return self.bits.flush().wrap_err("msync of chunk bitmap failed");
        }
        if self.dirty {
            self.bits.flush().wrap_err("msync of chunk bitmap failed")?;
            self.dirty = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_chunk(first: u32, total: u32) -> Chunk {
        let bits = MmapMut::map_anon((total as usize + 7) / 8).unwrap();
        Chunk::new(0, bits, first, total)
    }

    #[test]
    fn allocates_from_first_allocatable_slot() {
        let mut c = test_chunk(4, 256);
        let p = c.get(1);
        assert_eq!(p, 4);
        c.mask(p, 1);
        assert!(c.test(4));
        assert!(!c.test(3));
    }

    #[test]
    fn sequential_allocations_are_contiguous() {
        let mut c = test_chunk(0, 64);
        for expect in 0..8 {
            let p = c.get(1);
            assert_eq!(p, expect);
            c.mask(p, 1);
        }
    }

    #[test]
    fn finds_multi_slot_runs_past_fragmentation() {
        let mut c = test_chunk(0, 16);
        // Free slots: a 2-slot hole at 4..6, a single slot at 15.
        c.mask(0, 4);
        c.mask(6, 9);

        // Too small at 15; the scan wraps and lands in the hole.
        let p = c.get(2);
        assert_eq!(p, 4);
        c.mask(p, 2);

        assert_eq!(c.get(2), PTR_NULL);
        assert_eq!(c.get(1), 15);
    }

    #[test]
    fn wraps_once_and_fails_when_full() {
        let mut c = test_chunk(0, 16);
        c.mask(0, 16);
        assert_eq!(c.get(1), PTR_NULL);

        c.unmask(5, 1);
        assert_eq!(c.get(1), 5);
    }

    #[test]
    fn runs_do_not_cross_the_wrap_point() {
        let mut c = test_chunk(0, 16);
        // Leave free: slots 14,15 (at the end) and 0,1 (at the start).
        c.mask(2, 12);

        // A 4-slot run exists only by crossing the wrap; must fail.
        assert_eq!(c.get(4), PTR_NULL);
        // A 2-slot run is found on one side.
        let p = c.get(2);
        assert!(p == 0 || p == 14, "got {}", p);
    }

    #[test]
    fn unmask_clears_and_dirties() {
        let mut c = test_chunk(0, 32);
        c.mask(8, 4);
        c.sync(false).unwrap();

        c.unmask(8, 4);
        for bit in 8..12 {
            assert!(!c.test(bit));
        }
        assert!(c.dirty);
    }

    #[test]
    fn cursor_resumes_after_last_allocation() {
        let mut c = test_chunk(0, 64);
        let p = c.get(4);
        assert_eq!(p, 0);
        c.mask(p, 4);

        // Without consulting the cursor a fresh scan would restart at 0;
        // with it the next run begins where the last one ended.
        let p = c.get(4);
        assert_eq!(p, 4);
    }
}
