//! # File Header Definitions
//!
//! Both store files begin with a page-aligned, memory-mapped header that
//! makes the file self-describing: a magic, the logical file size (the
//! high-water mark of hole allocation), the last chunk that satisfied an
//! allocation, and one usage counter per chunk. The index file header
//! additionally persists the key/value count and the tree's root
//! pointer.
//!
//! Headers are `#[repr(C)]` zerocopy structs viewed directly over the
//! header mapping; every mutation writes through to the mapped bytes.
//! Multi-byte fields use little-endian wrappers.
//!
//! ## Layout
//!
//! ```text
//! index header (4136 bytes, mapped as 8192):
//!   magic | nr_kv | file_size | last_chunk | pad | root | chunk[1024]
//!
//! data header (8216 bytes, mapped as 12288):
//!   magic | file_size | last_chunk | chunk[2048]
//! ```

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{DATA_MAGIC, DB_MAGIC, HOST_PAGE_SIZE, NR_DATA_CHUNKS, NR_INDEX_CHUNKS};
use crate::storage::pointer::{round_up, Ptr, PTR_NULL};

/// Mapped size of the index file header.
pub const INDEX_HDR_SIZE: u64 = round_up(
    std::mem::size_of::<IndexFileHeader>() as u64,
    HOST_PAGE_SIZE as u64,
);

/// Mapped size of the data file header.
pub const DATA_HDR_SIZE: u64 = round_up(
    std::mem::size_of::<DataFileHeader>() as u64,
    HOST_PAGE_SIZE as u64,
);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct IndexFileHeader {
    magic: U64,
    nr_kv: U64,
    file_size: U64,
    last_chunk: U32,
    _pad: U32,
    root: U64,
    chunk: [U32; NR_INDEX_CHUNKS],
}

const _: () = assert!(std::mem::size_of::<IndexFileHeader>() == 40 + 4 * NR_INDEX_CHUNKS);
const _: () = assert!(INDEX_HDR_SIZE == 8192);

impl IndexFileHeader {
    /// Initializes a freshly formatted header in place. The mapping is
    /// zero-filled, so only nonzero fields need setting; a null root is
    /// all ones and must be written explicitly.
    pub fn init(&mut self) {
        self.magic = U64::new(DB_MAGIC);
        self.nr_kv = U64::new(0);
        self.file_size = U64::new(INDEX_HDR_SIZE);
        self.last_chunk = U32::new(0);
        self.root = U64::new(PTR_NULL);
        self.chunk = [U32::new(0); NR_INDEX_CHUNKS];
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let size = std::mem::size_of::<Self>();
        ensure!(
            bytes.len() >= size,
            "buffer too small for IndexFileHeader: {} < {}",
            bytes.len(),
            size
        );
        let header = Self::ref_from_bytes(&bytes[..size])
            .map_err(|e| eyre::eyre!("failed to parse IndexFileHeader: {:?}", e))?;

        ensure!(
            header.magic.get() == DB_MAGIC,
            "invalid magic in index file"
        );
        ensure!(
            header.file_size.get() >= INDEX_HDR_SIZE,
            "index file size {} below header size",
            header.file_size.get()
        );

        Ok(header)
    }

    pub fn from_bytes_mut(bytes: &mut [u8]) -> Result<&mut Self> {
        let size = std::mem::size_of::<Self>();
        ensure!(
            bytes.len() >= size,
            "buffer too small for IndexFileHeader: {} < {}",
            bytes.len(),
            size
        );
        Self::mut_from_bytes(&mut bytes[..size])
            .map_err(|e| eyre::eyre!("failed to parse IndexFileHeader: {:?}", e))
    }

    zerocopy_accessors! {
        nr_kv: u64,
        file_size: u64,
        last_chunk: u32,
    }

    pub fn root(&self) -> Ptr {
        self.root.get()
    }

    pub fn set_root(&mut self, root: Ptr) {
        self.root = U64::new(root);
    }

    pub fn chunk_used(&self, ck: usize) -> u32 {
        self.chunk[ck].get()
    }

    pub fn add_chunk_used(&mut self, ck: usize, n: u32) {
        self.chunk[ck] = U32::new(self.chunk[ck].get() + n);
    }

    pub fn sub_chunk_used(&mut self, ck: usize, n: u32) {
        self.chunk[ck] = U32::new(self.chunk[ck].get() - n);
    }

    /// Total pages in use across all chunks.
    pub fn used_total(&self) -> u64 {
        self.chunk.iter().map(|c| c.get() as u64).sum()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct DataFileHeader {
    magic: U64,
    file_size: U64,
    last_chunk: U64,
    chunk: [U32; NR_DATA_CHUNKS],
}

const _: () = assert!(std::mem::size_of::<DataFileHeader>() == 24 + 4 * NR_DATA_CHUNKS);
const _: () = assert!(DATA_HDR_SIZE == 12288);

impl DataFileHeader {
    pub fn init(&mut self) {
        self.magic = U64::new(DATA_MAGIC);
        self.file_size = U64::new(DATA_HDR_SIZE);
        self.last_chunk = U64::new(0);
        self.chunk = [U32::new(0); NR_DATA_CHUNKS];
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let size = std::mem::size_of::<Self>();
        ensure!(
            bytes.len() >= size,
            "buffer too small for DataFileHeader: {} < {}",
            bytes.len(),
            size
        );
        let header = Self::ref_from_bytes(&bytes[..size])
            .map_err(|e| eyre::eyre!("failed to parse DataFileHeader: {:?}", e))?;

        ensure!(
            header.magic.get() == DATA_MAGIC,
            "invalid magic in data file"
        );
        ensure!(
            header.file_size.get() >= DATA_HDR_SIZE,
            "data file size {} below header size",
            header.file_size.get()
        );

        Ok(header)
    }

    pub fn from_bytes_mut(bytes: &mut [u8]) -> Result<&mut Self> {
        let size = std::mem::size_of::<Self>();
        ensure!(
            bytes.len() >= size,
            "buffer too small for DataFileHeader: {} < {}",
            bytes.len(),
            size
        );
        Self::mut_from_bytes(&mut bytes[..size])
            .map_err(|e| eyre::eyre!("failed to parse DataFileHeader: {:?}", e))
    }

    zerocopy_accessors! {
        file_size: u64,
        last_chunk: u64,
    }

    pub fn chunk_used(&self, ck: usize) -> u32 {
        self.chunk[ck].get()
    }

    pub fn add_chunk_used(&mut self, ck: usize, n: u32) {
        self.chunk[ck] = U32::new(self.chunk[ck].get() + n);
    }

    pub fn sub_chunk_used(&mut self, ck: usize, n: u32) {
        self.chunk[ck] = U32::new(self.chunk[ck].get() - n);
    }

    /// Total pages in use across all chunks.
    pub fn used_total(&self) -> u64 {
        self.chunk.iter().map(|c| c.get() as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_header_init_and_parse() {
        let mut bytes = vec![0u8; INDEX_HDR_SIZE as usize];
        IndexFileHeader::from_bytes_mut(&mut bytes).unwrap().init();

        let hdr = IndexFileHeader::from_bytes(&bytes).unwrap();
        assert_eq!(hdr.nr_kv(), 0);
        assert_eq!(hdr.file_size(), INDEX_HDR_SIZE);
        assert_eq!(hdr.root(), PTR_NULL);
        assert_eq!(hdr.chunk_used(0), 0);
        assert_eq!(hdr.chunk_used(NR_INDEX_CHUNKS - 1), 0);
    }

    #[test]
    fn index_header_rejects_bad_magic() {
        let bytes = vec![0u8; INDEX_HDR_SIZE as usize];
        assert!(IndexFileHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn index_header_rejects_absurd_file_size() {
        let mut bytes = vec![0u8; INDEX_HDR_SIZE as usize];
        IndexFileHeader::from_bytes_mut(&mut bytes).unwrap().init();
        IndexFileHeader::from_bytes_mut(&mut bytes)
            .unwrap()
            .set_file_size(16);
        assert!(IndexFileHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn index_header_field_round_trip() {
        let mut bytes = vec![0u8; INDEX_HDR_SIZE as usize];
        {
            let hdr = IndexFileHeader::from_bytes_mut(&mut bytes).unwrap();
            hdr.init();
            hdr.set_nr_kv(42);
            hdr.set_last_chunk(9);
            hdr.set_root(0xABCD);
            hdr.add_chunk_used(9, 3);
            hdr.sub_chunk_used(9, 1);
        }

        let hdr = IndexFileHeader::from_bytes(&bytes).unwrap();
        assert_eq!(hdr.nr_kv(), 42);
        assert_eq!(hdr.last_chunk(), 9);
        assert_eq!(hdr.root(), 0xABCD);
        assert_eq!(hdr.chunk_used(9), 2);
    }

    #[test]
    fn data_header_init_and_parse() {
        let mut bytes = vec![0u8; DATA_HDR_SIZE as usize];
        DataFileHeader::from_bytes_mut(&mut bytes).unwrap().init();

        let hdr = DataFileHeader::from_bytes(&bytes).unwrap();
        assert_eq!(hdr.file_size(), DATA_HDR_SIZE);
        assert_eq!(hdr.last_chunk(), 0);
        assert_eq!(hdr.chunk_used(NR_DATA_CHUNKS - 1), 0);
    }

    #[test]
    fn data_header_rejects_bad_magic() {
        let bytes = vec![0u8; DATA_HDR_SIZE as usize];
        assert!(DataFileHeader::from_bytes(&bytes).is_err());
    }
}
