//! # Data File
//!
//! The data file (`{name}.data`) stores variable-length key and value
//! payloads. A payload of N bytes occupies `ceil(N / 64)` consecutive
//! 64-byte data pages within a single chunk; the fat pointer returned by
//! [`DataFile::store`] carries N in its length field, so a pointer alone
//! is enough to read the payload back.
//!
//! ## Striping
//!
//! Payload I/O is mapped at host-page (4 KiB) granularity: an extent is
//! walked host page by host page, and the cache key of each step is
//! `(chunk, host page index)`, so neighboring payloads share mappings.
//! The walk is pure arithmetic ([`ExtentWalker`]); the copy loops fetch
//! one cached page per step:
//!
//! ```text
//! extent: |--p0--|--p1--|--p2--| ... (64 B data pages)
//!          \______________________/
//!            host page (4 KiB, one cache entry, one mmap)
//! ```
//!
//! Payload pages flush asynchronously; the final fsync in `sync()`
//! settles them.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use tracing::debug;

use crate::config::{
    CHUNK_SIZE, DATA_BITMAP_BITS, DATA_BITMAP_PAGES, DATA_CHUNK_HDR_SIZE, HOST_PAGE_SIZE,
    MAX_CACHE_CHUNKS, MAX_CACHE_DATA_PAGES, NR_DATA_CHUNKS,
};
use crate::storage::cache::Cache;
use crate::storage::chunk::Chunk;
use crate::storage::headers::{DataFileHeader, DATA_HDR_SIZE};
use crate::storage::mmap::map_region;
use crate::storage::page::{FlushMode, Page};
use crate::storage::pointer::{self, Ptr, PTR_NULL};

/// Data pages a chunk can hold outside its reserved bitmap region.
const CHUNK_CAPACITY: u32 = (DATA_BITMAP_BITS - DATA_BITMAP_PAGES) as u32;

pub struct DataFile {
    file: File,
    hdr_map: memmap2::MmapMut,
    chunks: Cache<Chunk>,
    pages: Cache<Page>,
    closed: bool,
}

/// One host-page step of a payload extent.
struct Step {
    /// Cache key: `(chunk, host page index)`.
    key: u64,
    /// Host-page-aligned file offset to map.
    map_off: u64,
    /// Byte offset of the payload's continuation within the host page.
    in_page: usize,
    /// Bytes of payload covered by this step.
    nbytes: usize,
}

/// Pure arithmetic walk over the host pages covering an extent.
struct ExtentWalker {
    remaining: usize,
    ckid: u32,
    page_off: u64,
    in_page: usize,
    file_off: u64,
}

impl ExtentWalker {
    fn new(id: Ptr) -> Self {
        let page_off = pointer::page_off(id);
        Self {
            remaining: pointer::length(id) as usize,
            ckid: pointer::chunk(id),
            page_off,
            in_page: pointer::in_host_page_off(page_off),
            file_off: pointer::data_file_off(DATA_HDR_SIZE, id),
        }
    }

    fn next(&mut self) -> Option<Step> {
        if self.remaining == 0 {
            return None;
        }

        let nbytes = self.remaining.min(HOST_PAGE_SIZE - self.in_page);
        let step = Step {
            key: pointer::host_page_key(self.ckid, self.page_off),
            map_off: pointer::round_down(self.file_off, HOST_PAGE_SIZE as u64),
            in_page: self.in_page,
            nbytes,
        };

        self.remaining -= nbytes;
        self.file_off += nbytes as u64;
        self.page_off += pointer::size_to_pages(nbytes);
        self.in_page = 0;
        Some(step)
    }
}

impl DataFile {
    /// Creates (or truncates) and formats the data file.
    pub fn format(path: &Path) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create data file '{}'", path.display()))?;

        let (mut map, _) = map_region(&file, 0, 0, DATA_HDR_SIZE as usize)?;
        DataFileHeader::from_bytes_mut(&mut map)?.init();
        map.flush().wrap_err("msync of data header failed")?;
        drop(map);

        file.sync_all().wrap_err("fsync of data file failed")?;
        Ok(())
    }

    /// Opens a formatted data file, validating magic and size.
    pub fn open(path: &Path) -> Result<DataFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open data file '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat data file '{}'", path.display()))?
            .len();
        ensure!(
            len >= DATA_HDR_SIZE,
            "data file '{}' is {} bytes, too small for its header",
            path.display(),
            len
        );

        let (map, _) = map_region(&file, DATA_HDR_SIZE, 0, DATA_HDR_SIZE as usize)?;
        DataFileHeader::from_bytes(&map)
            .wrap_err_with(|| format!("data file '{}' is corrupt", path.display()))?;

        Ok(DataFile {
            file,
            hdr_map: map,
            chunks: Cache::new(MAX_CACHE_CHUNKS),
            pages: Cache::new(MAX_CACHE_DATA_PAGES),
            closed: false,
        })
    }

    pub fn hdr(&self) -> &DataFileHeader {
        DataFileHeader::from_bytes(&self.hdr_map).expect("header validated at open")
    }

    pub fn hdr_mut(&mut self) -> &mut DataFileHeader {
        DataFileHeader::from_bytes_mut(&mut self.hdr_map).expect("header validated at open")
    }

    /// Allocates an extent for `data` and writes the payload into it.
    /// Returns [`PTR_NULL`] when no chunk can hold the run.
    pub fn store(&mut self, data: &[u8]) -> Result<Ptr> {
        ensure!(
            data.len() <= crate::config::MAX_KV_SIZE,
            "payload of {} bytes exceeds the pointer length field",
            data.len()
        );

        let id = self.find_space(data.len())?;
        if id == PTR_NULL {
            debug!("data file has no space for {} bytes", data.len());
            return Ok(PTR_NULL);
        }

        let mut walker = ExtentWalker::new(id);
        let mut done = 0;
        while let Some(s) = walker.next() {
            let page = self.page_at(s.key, s.map_off)?;
            page.bytes_mut()[s.in_page..s.in_page + s.nbytes]
                .copy_from_slice(&data[done..done + s.nbytes]);
            page.mark_dirty();
            done += s.nbytes;
        }

        Ok(id)
    }

    /// Reads the payload named by `id` back into a fresh buffer.
    pub fn load(&mut self, id: Ptr) -> Result<Vec<u8>> {
        let mut out = vec![0u8; pointer::length(id) as usize];

        let mut walker = ExtentWalker::new(id);
        let mut done = 0;
        while let Some(s) = walker.next() {
            let page = self.page_at(s.key, s.map_off)?;
            out[done..done + s.nbytes].copy_from_slice(&page.bytes()[s.in_page..s.in_page + s.nbytes]);
            done += s.nbytes;
        }

        Ok(out)
    }

    /// Frees the extent named by `id`: evicts covered cache pages,
    /// clears the bitmap run, and decrements the chunk's usage counter.
    pub fn free(&mut self, id: Ptr) -> Result<()> {
        let mut walker = ExtentWalker::new(id);
        while let Some(s) = walker.next() {
            self.pages.evict(s.key)?;
        }

        let ckid = pointer::chunk(id) as usize;
        let npages = pointer::size_to_pages(pointer::length(id) as usize);
        {
            let ck = self.chunk(ckid)?;
            ck.unmask(pointer::page_off(id), npages);
        }
        self.hdr_mut().sub_chunk_used(ckid, npages as u32);
        Ok(())
    }

    /// Flushes dirty bitmaps and pages, the header, and the file itself.
    pub fn sync(&mut self) -> Result<()> {
        self.pages.sync()?;
        self.chunks.sync()?;
        self.hdr_map.flush().wrap_err("msync of data header failed")?;
        self.file.sync_all().wrap_err("fsync of data file failed")
    }

    /// Tears down: evicts every mapping, then flushes header and file.
    /// Idempotent; also invoked (best effort) on drop.
    pub fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.chunks.clear()?;
        self.pages.clear()?;
        self.hdr_map.flush().wrap_err("msync of data header failed")?;
        self.file.sync_all().wrap_err("fsync of data file failed")
    }

    fn find_space(&mut self, size: usize) -> Result<Ptr> {
        let n = pointer::size_to_pages(size);

        for i in 0..NR_DATA_CHUNKS {
            let ckid = (self.hdr().last_chunk() as usize + i) % NR_DATA_CHUNKS;
            if self.hdr().chunk_used(ckid) as u64 + n > CHUNK_CAPACITY as u64 {
                continue;
            }

            let bit = {
                let ck = self.chunk(ckid)?;
                let bit = ck.get(n as u32);
                if bit != PTR_NULL {
                    ck.mask(bit, n);
                    ck.mark_dirty();
                }
                bit
            };

            if bit != PTR_NULL {
                let hdr = self.hdr_mut();
                hdr.add_chunk_used(ckid, n as u32);
                hdr.set_last_chunk(ckid as u64);
                return Ok(pointer::encode(size as u32, ckid as u32, bit));
            }
        }

        Ok(PTR_NULL)
    }

    /// Maps (or fetches from cache) the host page with cache key `key`
    /// at file offset `map_off`.
    fn page_at(&mut self, key: u64, map_off: u64) -> Result<&mut Page> {
        if !self.pages.contains(key) {
            let (map, new_size) =
                map_region(&self.file, self.hdr().file_size(), map_off, HOST_PAGE_SIZE)?;
            self.hdr_mut().set_file_size(new_size);
            self.pages.put(Page::new(key, map, FlushMode::Async))?;
        }
        Ok(self.pages.get(key).expect("page just inserted"))
    }

    fn chunk(&mut self, ckid: usize) -> Result<&mut Chunk> {
        let id = ckid as u64;
        if !self.chunks.contains(id) {
            let off = DATA_HDR_SIZE + ckid as u64 * CHUNK_SIZE;
            let (map, new_size) =
                map_region(&self.file, self.hdr().file_size(), off, DATA_CHUNK_HDR_SIZE)?;
            self.hdr_mut().set_file_size(new_size);
            self.chunks.put(Chunk::new(
                id,
                map,
                DATA_BITMAP_PAGES as u32,
                DATA_BITMAP_BITS as u32,
            ))?;
        }
        Ok(self.chunks.get(id).expect("chunk just inserted"))
    }
}

impl Drop for DataFile {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                tracing::warn!("data file teardown failed: {:#}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DATA_PAGE_SIZE;

    fn temp_data_file() -> (tempfile::TempDir, DataFile) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.data");
        DataFile::format(&path).unwrap();
        let df = DataFile::open(&path).unwrap();
        (dir, df)
    }

    #[test]
    fn store_and_load_small_payload() {
        let (_dir, mut df) = temp_data_file();
        let id = df.store(b"hello").unwrap();
        assert_ne!(id, PTR_NULL);
        assert_eq!(pointer::length(id), 5);
        assert_eq!(df.load(id).unwrap(), b"hello");
        assert_eq!(df.hdr().chunk_used(0), 1);
    }

    #[test]
    fn payloads_share_host_pages() {
        let (_dir, mut df) = temp_data_file();
        let a = df.store(b"aaaa").unwrap();
        let b = df.store(b"bbbb").unwrap();

        // Consecutive slots, same host page, both intact.
        assert_eq!(pointer::page_off(b), pointer::page_off(a) + 1);
        assert_eq!(df.load(a).unwrap(), b"aaaa");
        assert_eq!(df.load(b).unwrap(), b"bbbb");
    }

    #[test]
    fn payload_crossing_host_page_boundary() {
        let (_dir, mut df) = temp_data_file();

        // Park the cursor just short of a host-page boundary, then store
        // a payload large enough to cross it.
        let fill = DATA_PAGE_SIZE * 62;
        let a = df.store(&vec![0x11; fill]).unwrap();
        let big: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
        let b = df.store(&big).unwrap();

        assert_eq!(df.load(b).unwrap(), big);
        assert_eq!(df.load(a).unwrap(), vec![0x11; fill]);
    }

    #[test]
    fn exact_page_multiple_round_trip() {
        let (_dir, mut df) = temp_data_file();
        let payload = vec![0xA5u8; DATA_PAGE_SIZE * 3];
        let id = df.store(&payload).unwrap();
        assert_eq!(pointer::length(id) as usize, payload.len());
        assert_eq!(df.load(id).unwrap(), payload);
        assert_eq!(df.hdr().chunk_used(0), 3);
    }

    #[test]
    fn free_returns_counter_and_slots() {
        let (_dir, mut df) = temp_data_file();
        let id = df.store(&vec![7u8; 300]).unwrap();
        assert_eq!(df.hdr().chunk_used(0), 5);

        df.free(id).unwrap();
        assert_eq!(df.hdr().chunk_used(0), 0);

        let id2 = df.store(b"x").unwrap();
        assert_ne!(id2, PTR_NULL);
    }

    #[test]
    fn payloads_survive_sync_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.data");
        DataFile::format(&path).unwrap();

        let id;
        {
            let mut df = DataFile::open(&path).unwrap();
            id = df.store(b"durable bytes").unwrap();
            df.sync().unwrap();
            df.close().unwrap();
        }

        let mut df = DataFile::open(&path).unwrap();
        assert_eq!(df.load(id).unwrap(), b"durable bytes");
        assert_eq!(df.hdr().chunk_used(0), 1);
    }
}
