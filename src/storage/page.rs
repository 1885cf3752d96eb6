//! # Cached Page Mappings
//!
//! A [`Page`] is one live mapping: a whole node page of the index file,
//! or one host page of the data file covering 64 payload slots. Pages
//! live in an LRU [`Cache`](super::Cache) and are flushed on demand:
//! dirty pages on `sync()`, every page on eviction.
//!
//! Headers, bitmaps, and index pages flush synchronously; payload pages
//! flush asynchronously. Payloads are only reachable through tree nodes,
//! so scheduling their writeback without waiting is enough — the final
//! fsync on `flush()` settles everything.

use eyre::{Result, WrapErr};
use memmap2::MmapMut;

use super::cache::CacheItem;

/// msync discipline for a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Synchronous writeback (MS_SYNC): headers, bitmaps, node pages.
    Sync,
    /// Asynchronous writeback (MS_ASYNC): payload pages.
    Async,
}

#[derive(Debug)]
pub struct Page {
    id: u64,
    map: MmapMut,
    mode: FlushMode,
    dirty: bool,
}

impl Page {
    pub fn new(id: u64, map: MmapMut, mode: FlushMode) -> Self {
        Self {
            id,
            map,
            mode,
            dirty: false,
        }
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }

    #[inline]
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn flush(&self) -> Result<()> {
        match self.mode {
            FlushMode::Sync => self.map.flush().wrap_err("msync failed"),
            FlushMode::Async => self.map.flush_async().wrap_err("msync (async) failed"),
        }
    }
}

impl CacheItem for Page {
    fn id(&self) -> u64 {
        self.id
    }

    fn sync(&mut self, unmap: bool) -> Result<()> {
        if unmap {
            // Final flush; the mapping is dropped (unmapped) by the
            // cache right after.
            return self.flush();
        }
        if self.dirty {
            self.flush()?;
            self.dirty = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anon_page(id: u64, mode: FlushMode) -> Page {
        Page::new(id, MmapMut::map_anon(4096).unwrap(), mode)
    }

    #[test]
    fn page_tracks_dirty_bit() {
        let mut page = anon_page(1, FlushMode::Sync);
        assert!(!page.is_dirty());

        page.bytes_mut()[0] = 42;
        page.mark_dirty();
        assert!(page.is_dirty());

        page.sync(false).unwrap();
        assert!(!page.is_dirty());
    }

    #[test]
    fn clean_page_sync_is_noop() {
        let mut page = anon_page(2, FlushMode::Async);
        page.sync(false).unwrap();
        assert!(!page.is_dirty());
    }

    #[test]
    fn id_round_trips() {
        let page = anon_page(77, FlushMode::Sync);
        assert_eq!(page.id(), 77);
    }
}
