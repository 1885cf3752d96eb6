//! # Fat Pointer Codec
//!
//! Every persistent object (tree node, key payload, value payload) is
//! named by a 64-bit fat pointer encoding `(length, chunk, page offset)`:
//!
//! ```text
//! bit 63                40 39      29 28                    0
//! +----------------------+----------+----------------------+
//! |   length (24 bits)   | chunk(11)|  page offset (29)    |
//! +----------------------+----------+----------------------+
//! ```
//!
//! The codec is total and reversible: `encode(length(p), chunk(p),
//! page_off(p)) == p` for any well-formed `p`. The distinguished value
//! [`PTR_NULL`] (all ones) denotes absence; its decoded page offset lies
//! beyond any chunk's bitmap, so no allocator ever produces it.
//!
//! For tree nodes the length field is fixed at the index page size; for
//! payloads it stores the exact byte length, which doubles as the decode
//! stride for striping.

use crate::config::{
    CHUNK_BITS, CHUNK_SIZE, DATA_BITS, DATA_PAGES_PER_HOST_PAGE, DATA_PAGE_SIZE, INDEX_PAGE_SIZE,
    LENGTH_BITS,
};

/// A fat pointer (or a raw bit/slot index where noted by context).
pub type Ptr = u64;

/// Absence marker; never produced by the allocators.
pub const PTR_NULL: Ptr = u64::MAX;

const LENGTH_MASK: u64 = (1 << LENGTH_BITS) - 1;
const CHUNK_MASK: u64 = (1 << CHUNK_BITS) - 1;
const OFFSET_MASK: u64 = (1 << DATA_BITS) - 1;

/// Packs `(length, chunk, page offset)` into a fat pointer.
#[inline]
pub const fn encode(len: u32, chunk: u32, page_off: u64) -> Ptr {
    let mut p = len as u64 & LENGTH_MASK;
    p <<= CHUNK_BITS;
    p |= chunk as u64 & CHUNK_MASK;
    p <<= DATA_BITS;
    p |= page_off & OFFSET_MASK;
    p
}

/// Byte length of the payload named by `p`.
#[inline]
pub const fn length(p: Ptr) -> u32 {
    ((p >> (CHUNK_BITS + DATA_BITS)) & LENGTH_MASK) as u32
}

/// Chunk index within the owning file.
#[inline]
pub const fn chunk(p: Ptr) -> u32 {
    ((p >> DATA_BITS) & CHUNK_MASK) as u32
}

/// Starting page slot within the chunk.
#[inline]
pub const fn page_off(p: Ptr) -> u64 {
    p & OFFSET_MASK
}

/// Byte offset of a node page within the index file.
#[inline]
pub const fn node_file_off(hdr_size: u64, p: Ptr) -> u64 {
    hdr_size + chunk(p) as u64 * CHUNK_SIZE + page_off(p) * INDEX_PAGE_SIZE as u64
}

/// Byte offset of a payload's first data page within the data file.
#[inline]
pub const fn data_file_off(hdr_size: u64, p: Ptr) -> u64 {
    hdr_size + chunk(p) as u64 * CHUNK_SIZE + page_off(p) * DATA_PAGE_SIZE as u64
}

/// Number of data pages covering a payload of `n` bytes.
#[inline]
pub const fn size_to_pages(n: usize) -> u64 {
    ((n + DATA_PAGE_SIZE - 1) / DATA_PAGE_SIZE) as u64
}

/// Cache key for the host page containing data-page slot `page_off` of
/// chunk `chunk`. Neighboring payloads within one host page share a key,
/// and therefore a mapping.
#[inline]
pub const fn host_page_key(chunk: u32, page_off: u64) -> u64 {
    ((chunk as u64) << 32) | (page_off / DATA_PAGES_PER_HOST_PAGE as u64)
}

/// Byte offset of data-page slot `page_off` within its host page.
#[inline]
pub const fn in_host_page_off(page_off: u64) -> usize {
    (page_off as usize % DATA_PAGES_PER_HOST_PAGE) * DATA_PAGE_SIZE
}

/// Rounds `size` down to a multiple of `align` (a power of two).
#[inline]
pub const fn round_down(size: u64, align: u64) -> u64 {
    size & !(align - 1)
}

/// Rounds `size` up to a multiple of `align` (a power of two).
#[inline]
pub const fn round_up(size: u64, align: u64) -> u64 {
    (size + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let p = encode(4096, 7, 12345);
        assert_eq!(length(p), 4096);
        assert_eq!(chunk(p), 7);
        assert_eq!(page_off(p), 12345);
        assert_eq!(encode(length(p), chunk(p), page_off(p)), p);
    }

    #[test]
    fn encode_decode_extremes() {
        let p = encode((1 << LENGTH_BITS) - 1, (1 << CHUNK_BITS) - 1, (1 << DATA_BITS) - 1);
        assert_eq!(length(p), (1 << LENGTH_BITS) - 1);
        assert_eq!(chunk(p), (1 << CHUNK_BITS) - 1);
        assert_eq!(page_off(p), (1 << DATA_BITS) - 1);

        let z = encode(0, 0, 0);
        assert_eq!(length(z), 0);
        assert_eq!(chunk(z), 0);
        assert_eq!(page_off(z), 0);
    }

    #[test]
    fn null_offset_is_unallocatable() {
        // PTR_NULL must never collide with a real extent: its page offset
        // exceeds any chunk's bitmap range.
        assert!(page_off(PTR_NULL) >= crate::config::DATA_BITMAP_BITS as u64);
        assert!(page_off(PTR_NULL) >= crate::config::INDEX_BITMAP_BITS as u64);
    }

    #[test]
    fn file_offsets() {
        let p = encode(64, 2, 10);
        assert_eq!(
            node_file_off(8192, p),
            8192 + 2 * CHUNK_SIZE + 10 * INDEX_PAGE_SIZE as u64
        );
        assert_eq!(
            data_file_off(12288, p),
            12288 + 2 * CHUNK_SIZE + 10 * DATA_PAGE_SIZE as u64
        );
    }

    #[test]
    fn payload_page_counts() {
        assert_eq!(size_to_pages(1), 1);
        assert_eq!(size_to_pages(64), 1);
        assert_eq!(size_to_pages(65), 2);
        assert_eq!(size_to_pages(4096), 64);
        assert_eq!(size_to_pages(4097), 65);
    }

    #[test]
    fn host_page_grouping() {
        // 64 data pages share one host page.
        assert_eq!(host_page_key(3, 0), host_page_key(3, 63));
        assert_ne!(host_page_key(3, 63), host_page_key(3, 64));
        assert_ne!(host_page_key(3, 0), host_page_key(4, 0));

        assert_eq!(in_host_page_off(0), 0);
        assert_eq!(in_host_page_off(1), 64);
        assert_eq!(in_host_page_off(63), 4032);
        assert_eq!(in_host_page_off(64), 0);
    }

    #[test]
    fn rounding() {
        assert_eq!(round_up(4136, 4096), 8192);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_down(5000, 4096), 4096);
    }
}
