//! # Index File
//!
//! The index file (`{name}.db`) persists the B+tree: a page-aligned
//! header (magic, kv count, logical size, root pointer, per-chunk usage
//! counters) followed by up to 1024 chunks of 4 KiB node pages, each
//! chunk fronted by its allocation bitmap.
//!
//! [`NodeFile`] owns the header mapping and two caches: one for chunk
//! bitmaps, one for node pages. Node pages are always flushed
//! synchronously; tree structure must not lag payload data on disk.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use tracing::debug;

use crate::config::{
    CHUNK_SIZE, INDEX_BITMAP_BITS, INDEX_BITMAP_PAGES, INDEX_CHUNK_HDR_SIZE, INDEX_PAGE_SIZE,
    MAX_CACHE_CHUNKS, MAX_CACHE_INDEX_PAGES, NR_INDEX_CHUNKS,
};
use crate::storage::cache::Cache;
use crate::storage::chunk::Chunk;
use crate::storage::headers::{IndexFileHeader, INDEX_HDR_SIZE};
use crate::storage::mmap::map_region;
use crate::storage::page::{FlushMode, Page};
use crate::storage::pointer::{self, Ptr, PTR_NULL};

/// Node pages a chunk can hold outside its reserved bitmap region.
const CHUNK_CAPACITY: u32 = (INDEX_BITMAP_BITS - INDEX_BITMAP_PAGES) as u32;

pub struct NodeFile {
    file: File,
    hdr_map: memmap2::MmapMut,
    chunks: Cache<Chunk>,
    pages: Cache<Page>,
    closed: bool,
}

impl NodeFile {
    /// Creates (or truncates) and formats the index file.
    pub fn format(path: &Path) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create index file '{}'", path.display()))?;

        let (mut map, _) = map_region(&file, 0, 0, INDEX_HDR_SIZE as usize)?;
        IndexFileHeader::from_bytes_mut(&mut map)?.init();
        map.flush().wrap_err("msync of index header failed")?;
        drop(map);

        file.sync_all().wrap_err("fsync of index file failed")?;
        Ok(())
    }

    /// Opens a formatted index file, validating magic and size.
    pub fn open(path: &Path) -> Result<NodeFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open index file '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat index file '{}'", path.display()))?
            .len();
        ensure!(
            len >= INDEX_HDR_SIZE,
            "index file '{}' is {} bytes, too small for its header",
            path.display(),
            len
        );

        let (map, _) = map_region(&file, INDEX_HDR_SIZE, 0, INDEX_HDR_SIZE as usize)?;
        IndexFileHeader::from_bytes(&map)
            .wrap_err_with(|| format!("index file '{}' is corrupt", path.display()))?;

        Ok(NodeFile {
            file,
            hdr_map: map,
            chunks: Cache::new(MAX_CACHE_CHUNKS),
            pages: Cache::new(MAX_CACHE_INDEX_PAGES),
            closed: false,
        })
    }

    pub fn hdr(&self) -> &IndexFileHeader {
        IndexFileHeader::from_bytes(&self.hdr_map).expect("header validated at open")
    }

    pub fn hdr_mut(&mut self) -> &mut IndexFileHeader {
        IndexFileHeader::from_bytes_mut(&mut self.hdr_map).expect("header validated at open")
    }

    /// Allocates one node page: probes chunks round-robin from the last
    /// chunk that satisfied an allocation, scanning each candidate's
    /// bitmap. Returns [`PTR_NULL`] when every chunk is full.
    pub fn allocate(&mut self) -> Result<Ptr> {
        for i in 0..NR_INDEX_CHUNKS {
            let ckid = (self.hdr().last_chunk() as usize + i) % NR_INDEX_CHUNKS;
            if self.hdr().chunk_used(ckid) >= CHUNK_CAPACITY {
                continue;
            }

            let bit = {
                let ck = self.chunk(ckid)?;
                let bit = ck.get(1);
                if bit != PTR_NULL {
                    ck.mask(bit, 1);
                    ck.mark_dirty();
                }
                bit
            };

            if bit != PTR_NULL {
                let hdr = self.hdr_mut();
                hdr.add_chunk_used(ckid, 1);
                hdr.set_last_chunk(ckid as u32);
                return Ok(pointer::encode(INDEX_PAGE_SIZE as u32, ckid as u32, bit));
            }
        }

        debug!("index file has no space available");
        Ok(PTR_NULL)
    }

    /// Maps (or fetches from cache) the node page named by `id`.
    pub fn page(&mut self, id: Ptr) -> Result<&mut Page> {
        if !self.pages.contains(id) {
            let off = pointer::node_file_off(INDEX_HDR_SIZE, id);
            let (map, new_size) = map_region(&self.file, self.hdr().file_size(), off, INDEX_PAGE_SIZE)?;
            self.hdr_mut().set_file_size(new_size);
            self.pages.put(Page::new(id, map, FlushMode::Sync))?;
        }
        Ok(self.pages.get(id).expect("page just inserted"))
    }

    /// Frees the node page named by `id`: clears its bitmap bit, drops
    /// any cached mapping, and decrements the chunk's usage counter.
    pub fn free(&mut self, id: Ptr) -> Result<()> {
        let ckid = pointer::chunk(id) as usize;
        {
            let ck = self.chunk(ckid)?;
            ck.unmask(pointer::page_off(id), 1);
        }
        self.pages.evict(id)?;
        self.hdr_mut().sub_chunk_used(ckid, 1);
        Ok(())
    }

    /// Flushes dirty bitmaps and pages, the header, and the file itself.
    pub fn sync(&mut self) -> Result<()> {
        self.chunks.sync()?;
        self.pages.sync()?;
        self.hdr_map.flush().wrap_err("msync of index header failed")?;
        self.file.sync_all().wrap_err("fsync of index file failed")
    }

    /// Tears down: evicts every mapping, then flushes header and file.
    /// Idempotent; also invoked (best effort) on drop.
    pub fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.chunks.clear()?;
        self.pages.clear()?;
        self.hdr_map.flush().wrap_err("msync of index header failed")?;
        self.file.sync_all().wrap_err("fsync of index file failed")
    }

    fn chunk(&mut self, ckid: usize) -> Result<&mut Chunk> {
        let id = ckid as u64;
        if !self.chunks.contains(id) {
            let off = INDEX_HDR_SIZE + ckid as u64 * CHUNK_SIZE;
            let (map, new_size) =
                map_region(&self.file, self.hdr().file_size(), off, INDEX_CHUNK_HDR_SIZE)?;
            self.hdr_mut().set_file_size(new_size);
            self.chunks.put(Chunk::new(
                id,
                map,
                INDEX_BITMAP_PAGES as u32,
                INDEX_BITMAP_BITS as u32,
            ))?;
        }
        Ok(self.chunks.get(id).expect("chunk just inserted"))
    }
}

impl Drop for NodeFile {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                tracing::warn!("index file teardown failed: {:#}", e);
            }
        }
    }
}
