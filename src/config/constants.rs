//! # Layout Constants
//!
//! This module centralizes every constant that defines the on-disk
//! format. Constants that depend on each other are co-located and the
//! derivations are spelled out; compile-time assertions guard the
//! relationships that must hold for the format to be self-consistent.
//!
//! ## Fat pointer layout
//!
//! ```text
//! +----------+---------+-----------------------+
//! |  length  | chunk   |  page offset in chunk |
//! +----------+---------+-----------------------+
//! | 24 bits  | 11 bits |        29 bits        |
//! +----------+---------+-----------------------+
//! ```
//!
//! The 24-bit length field caps key and value sizes at ~16 MiB. The
//! 29-bit offset field, at the data file's 64-byte page granularity,
//! caps a chunk at 512 MiB.
//!
//! ## Dependency graph
//!
//! ```text
//! CHUNK_SIZE (1 << DATA_BITS = 512 MiB)
//!       │
//!       ├─> INDEX_BITMAP_BITS (CHUNK_SIZE / INDEX_PAGE_SIZE)
//!       │         one bit per 4 KiB node-page slot
//!       │
//!       └─> DATA_BITMAP_BITS (CHUNK_SIZE / DATA_PAGE_SIZE)
//!                 one bit per 64 B data-page slot
//!
//! INDEX_PAGE_SIZE (4096)
//!       │
//!       └─> BPT_ORDER ((INDEX_PAGE_SIZE - NODE_HDR_SIZE) / 16 - 1)
//!             both node shapes must exactly fill one page; asserted in
//!             btree::node
//! ```
//!
//! Changing any of the pointer field widths changes the file format;
//! stores written with different constants are mutually unreadable (the
//! magic does not version them).

/// Assumed host page size; mapping granularity for payload I/O.
pub const HOST_PAGE_SIZE: usize = 4096;

/// Size of one index-file page (one B+tree node).
pub const INDEX_PAGE_SIZE: usize = 4096;

/// Size of one data-file page (payload striping granularity).
pub const DATA_PAGE_SIZE: usize = 64;

/// Data pages per host page; payload cache entries map one host page.
pub const DATA_PAGES_PER_HOST_PAGE: usize = HOST_PAGE_SIZE / DATA_PAGE_SIZE;

pub const LENGTH_BITS: u32 = 24;
pub const CHUNK_BITS: u32 = 11;
pub const DATA_BITS: u32 = 29;

/// Maximum key or value size in bytes (~16 MiB).
pub const MAX_KV_SIZE: usize = (1 << LENGTH_BITS) - 1;

/// Size of one chunk in bytes (512 MiB).
pub const CHUNK_SIZE: u64 = 1 << DATA_BITS;

pub const NR_INDEX_CHUNKS: usize = 1024;
pub const NR_DATA_CHUNKS: usize = 1 << CHUNK_BITS;

/// Page slots (and bitmap bits) per index-file chunk.
pub const INDEX_BITMAP_BITS: usize = (CHUNK_SIZE as usize) / INDEX_PAGE_SIZE;

/// Index pages reserved at the head of each chunk for its bitmap.
pub const INDEX_BITMAP_PAGES: usize = INDEX_BITMAP_BITS / 8 / INDEX_PAGE_SIZE;

/// Byte size of an index chunk's reserved bitmap region.
pub const INDEX_CHUNK_HDR_SIZE: usize = INDEX_BITMAP_PAGES * INDEX_PAGE_SIZE;

/// Page slots (and bitmap bits) per data-file chunk.
pub const DATA_BITMAP_BITS: usize = (CHUNK_SIZE as usize) / DATA_PAGE_SIZE;

/// Data pages reserved at the head of each chunk for its bitmap.
pub const DATA_BITMAP_PAGES: usize = DATA_BITMAP_BITS / 8 / DATA_PAGE_SIZE;

/// Byte size of a data chunk's reserved bitmap region (1 MiB).
pub const DATA_CHUNK_HDR_SIZE: usize = DATA_BITMAP_PAGES * DATA_PAGE_SIZE;

const _: () = assert!(INDEX_BITMAP_PAGES > 0);
const _: () = assert!(INDEX_CHUNK_HDR_SIZE % HOST_PAGE_SIZE == 0);
const _: () = assert!(DATA_CHUNK_HDR_SIZE % HOST_PAGE_SIZE == 0);

/// Index file magic ("CHAOS-DB").
pub const DB_MAGIC: u64 = 0x4348414F532D4442;

/// Data file magic ("CHAOS-DA").
pub const DATA_MAGIC: u64 = 0x4348414F532D4441;

/// Default store name; files become `chaos.db` and `chaos.data`.
pub const DEFAULT_NAME: &str = "chaos";

pub const INDEX_FILE_EXTENSION: &str = "db";
pub const DATA_FILE_EXTENSION: &str = "data";

/// Cached chunk-bitmap mappings per file.
pub const MAX_CACHE_CHUNKS: usize = 32;

/// Cached node-page mappings for the index file.
pub const MAX_CACHE_INDEX_PAGES: usize = 256;

/// Cached host-page mappings for the data file. The payload cache is the
/// largest of the three: payload access has far less locality than node
/// access, and each entry is only one host page.
pub const MAX_CACHE_DATA_PAGES: usize = 16384;
