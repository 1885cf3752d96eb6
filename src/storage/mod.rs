//! # Storage Layer
//!
//! Everything below the B+tree: the fat-pointer codec, memory-mapped
//! region management, the LRU mapping cache, per-chunk bitmap
//! allocators, and the two file formats.
//!
//! ## Layering
//!
//! ```text
//! NodeFile / DataFile      file headers, chunk round-robin, extents
//!   ├── Cache<Chunk>       bitmap regions (allocation state)
//!   ├── Cache<Page>        node pages / payload host pages
//!   └── map_region         posix_fallocate + mmap
//! pointer                  (length, chunk, page offset) codec
//! ```
//!
//! Both files follow the same scheme: a page-aligned self-describing
//! header, then fixed-size chunks, each fronted by a bitmap of its page
//! slots. The index file's pages are 4 KiB tree nodes; the data file's
//! are 64-byte payload slots grouped 64-to-a-mapping.
//!
//! Nothing in this layer knows about keys, values, or tree structure;
//! it deals in extents named by fat pointers.

mod cache;
mod chunk;
mod data_file;
mod headers;
mod mmap;
mod node_file;
mod page;
pub mod pointer;

pub use cache::{Cache, CacheItem};
pub use chunk::Chunk;
pub use data_file::DataFile;
pub use headers::{DataFileHeader, IndexFileHeader, DATA_HDR_SIZE, INDEX_HDR_SIZE};
pub use mmap::map_region;
pub use node_file::NodeFile;
pub use page::{FlushMode, Page};
pub use pointer::{Ptr, PTR_NULL};
