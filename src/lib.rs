//! # bkv - Embedded On-Disk Ordered Key/Value Store
//!
//! bkv is a single-process embedded store exposing point reads, point
//! writes, deletes, existence checks, and range iteration over byte
//! strings, with durability on explicit flush.
//!
//! ## Quick Start
//!
//! ```ignore
//! use bkv::Db;
//!
//! let mut db = Db::open("./mydb")?;
//! db.put(b"alpha", b"1")?;
//! assert_eq!(db.get(b"alpha")?, b"1");
//! db.flush()?;
//! ```
//!
//! ## Architecture
//!
//! The store is backed by two memory-mapped files:
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │          Public API (Db)            │
//! ├─────────────────────────────────────┤
//! │    B+Tree Engine (split/merge)      │
//! ├──────────────────┬──────────────────┤
//! │   Index File     │    Data File     │
//! │  (tree nodes)    │   (payloads)     │
//! ├──────────────────┴──────────────────┤
//! │  Chunk Bitmap Allocator + LRU Cache │
//! ├─────────────────────────────────────┤
//! │   Memory-Mapped File I/O (mmap)     │
//! └─────────────────────────────────────┘
//! ```
//!
//! The *index file* (`{name}.db`) holds fixed-size (4 KiB) pages, each a
//! leaf or internal B+tree node. The *data file* (`{name}.data`) holds
//! variable-length key and value payloads striped across 64-byte data
//! pages. Every persistent object is named by a 64-bit fat pointer
//! encoding `(length, chunk, page offset)`.
//!
//! Both files are divided into 512 MiB chunks, each starting with a
//! bitmap that tracks its page slots. Allocation is a first-fit scan for
//! a run of free bits; files grow on demand by file-hole allocation, so
//! unused chunks cost nothing.
//!
//! ## Module Overview
//!
//! - [`storage`]: fat pointers, mmap regions, the LRU page cache, chunk
//!   bitmaps, and the two file formats
//! - [`btree`]: the on-disk B+tree engine and range iterator
//! - [`config`]: layout constants
//!
//! ## Concurrency
//!
//! None. The store is single-threaded and single-process: every
//! operation takes `&mut self`, there is no internal synchronization,
//! and no operation may run concurrently with another on the same store.

#[macro_use]
mod macros;

pub mod btree;
pub mod config;
pub mod storage;

mod db;

pub use btree::{BpTree, RangeIter};
pub use db::Db;
