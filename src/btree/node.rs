//! # Node Page Layout
//!
//! Every index-file page is one B+tree node. Leaf and internal nodes
//! share a 48-byte header so a page can be inspected before narrowing to
//! its concrete shape; the remainder is an entry array that makes both
//! shapes exactly fill the page:
//!
//! ```text
//! +--------------------------------------------------+
//! | NodeHdr: type | count | self | parent | prev | next | pad |
//! +--------------------------------------------------+
//! | leaf:     kv[253]  (key ptr, value ptr)          |
//! | internal: kc[253]  (separator ptr, child ptr)    |
//! +--------------------------------------------------+
//! ```
//!
//! The order M = 252 falls out of the page size: a leaf is full at
//! M - 1 entries and an internal node at M children, so either shape can
//! absorb the transient extra entry a split inserts before it divides.
//!
//! An internal node with `count` children stores `count - 1` live
//! separators; the key in its last occupied slot is dead storage.
//!
//! Nodes at the same level form a doubly linked sibling list through
//! `prev`/`next`, terminated by [`PTR_NULL`] on both ends.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::INDEX_PAGE_SIZE;
use crate::storage::pointer::{Ptr, PTR_NULL};
use crate::storage::NodeFile;

pub const NODE_HDR_SIZE: usize = 48;
pub const ENTRY_SIZE: usize = 16;

/// B+tree order: maximum children of an internal node.
pub const BPT_ORDER: usize = (INDEX_PAGE_SIZE - NODE_HDR_SIZE) / ENTRY_SIZE - 1;

/// Entry slots per node; one more than the order so a split can insert
/// before dividing.
pub const NODE_SLOTS: usize = BPT_ORDER + 1;

/// A non-root node must hold more than this many entries.
pub const HALF_FLOOR: u32 = ((BPT_ORDER + 1) / 2) as u32;

const NODE_TYPE_LEAF: u32 = 3;
const NODE_TYPE_INTL: u32 = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Leaf,
    Internal,
}

impl NodeType {
    pub fn from_raw(raw: u32) -> Result<NodeType> {
        match raw {
            NODE_TYPE_LEAF => Ok(NodeType::Leaf),
            NODE_TYPE_INTL => Ok(NodeType::Internal),
            other => eyre::bail!("invalid node type tag {}", other),
        }
    }

    fn raw(self) -> u32 {
        match self {
            NodeType::Leaf => NODE_TYPE_LEAF,
            NodeType::Internal => NODE_TYPE_INTL,
        }
    }
}

/// Shared prefix of leaf and internal nodes.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct NodeHdr {
    node_type: U32,
    count: U32,
    self_id: U64,
    parent: U64,
    prev: U64,
    next: U64,
    _pad: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<NodeHdr>() == NODE_HDR_SIZE);

impl NodeHdr {
    pub fn node_type(&self) -> Result<NodeType> {
        NodeType::from_raw(self.node_type.get())
    }

    pub fn is_leaf(&self) -> bool {
        self.node_type.get() == NODE_TYPE_LEAF
    }

    zerocopy_accessors! {
        count: u32,
        self_id: u64,
        parent: u64,
        prev: u64,
        next: u64,
    }
}

/// One leaf entry: pointers to a key payload and its value payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct KvPair {
    key: U64,
    val: U64,
}

const _: () = assert!(std::mem::size_of::<KvPair>() == ENTRY_SIZE);

impl KvPair {
    pub fn new(key: Ptr, val: Ptr) -> Self {
        Self {
            key: U64::new(key),
            val: U64::new(val),
        }
    }

    zerocopy_accessors! {
        key: u64,
        val: u64,
    }
}

/// One internal entry: a separator key pointer and the child left of it
/// (the slot after the last separator holds only a child).
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct KcPair {
    key: U64,
    child: U64,
}

const _: () = assert!(std::mem::size_of::<KcPair>() == ENTRY_SIZE);

impl KcPair {
    pub fn new(key: Ptr, child: Ptr) -> Self {
        Self {
            key: U64::new(key),
            child: U64::new(child),
        }
    }

    zerocopy_accessors! {
        key: u64,
        child: u64,
    }
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct LeafNode {
    pub hdr: NodeHdr,
    pub kv: [KvPair; NODE_SLOTS],
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct IntlNode {
    pub hdr: NodeHdr,
    pub kc: [KcPair; NODE_SLOTS],
}

// Both shapes must exactly fill one index page.
const _: () = assert!(std::mem::size_of::<LeafNode>() == INDEX_PAGE_SIZE);
const _: () = assert!(std::mem::size_of::<IntlNode>() == std::mem::size_of::<LeafNode>());

/// Shared-header view of the node page `id`.
pub(crate) fn node_ref(file: &mut NodeFile, id: Ptr) -> Result<&NodeHdr> {
    let page = file.page(id)?;
    NodeHdr::ref_from_bytes(&page.bytes()[..NODE_HDR_SIZE])
        .map_err(|e| eyre::eyre!("failed to view node header {}: {:?}", id, e))
}

/// Mutable shared-header view; marks the page dirty.
pub(crate) fn node_mut(file: &mut NodeFile, id: Ptr) -> Result<&mut NodeHdr> {
    let page = file.page(id)?;
    page.mark_dirty();
    NodeHdr::mut_from_bytes(&mut page.bytes_mut()[..NODE_HDR_SIZE])
        .map_err(|e| eyre::eyre!("failed to view node header {}: {:?}", id, e))
}

pub(crate) fn leaf_ref(file: &mut NodeFile, id: Ptr) -> Result<&LeafNode> {
    let page = file.page(id)?;
    let node = LeafNode::ref_from_bytes(page.bytes())
        .map_err(|e| eyre::eyre!("failed to view leaf {}: {:?}", id, e))?;
    ensure!(node.hdr.is_leaf(), "node {} is not a leaf", id);
    Ok(node)
}

pub(crate) fn leaf_mut(file: &mut NodeFile, id: Ptr) -> Result<&mut LeafNode> {
    let page = file.page(id)?;
    page.mark_dirty();
    let node = LeafNode::mut_from_bytes(page.bytes_mut())
        .map_err(|e| eyre::eyre!("failed to view leaf {}: {:?}", id, e))?;
    ensure!(node.hdr.is_leaf(), "node {} is not a leaf", id);
    Ok(node)
}

pub(crate) fn intl_ref(file: &mut NodeFile, id: Ptr) -> Result<&IntlNode> {
    let page = file.page(id)?;
    let node = IntlNode::ref_from_bytes(page.bytes())
        .map_err(|e| eyre::eyre!("failed to view internal node {}: {:?}", id, e))?;
    ensure!(!node.hdr.is_leaf(), "node {} is not internal", id);
    Ok(node)
}

pub(crate) fn intl_mut(file: &mut NodeFile, id: Ptr) -> Result<&mut IntlNode> {
    let page = file.page(id)?;
    page.mark_dirty();
    let node = IntlNode::mut_from_bytes(page.bytes_mut())
        .map_err(|e| eyre::eyre!("failed to view internal node {}: {:?}", id, e))?;
    ensure!(!node.hdr.is_leaf(), "node {} is not internal", id);
    Ok(node)
}

/// Allocates a fresh node page of kind `t` with an initialized header.
/// Index-file exhaustion is a hard error: the tree cannot proceed.
pub(crate) fn node_alloc(file: &mut NodeFile, t: NodeType) -> Result<Ptr> {
    let id = file.allocate()?;
    ensure!(id != PTR_NULL, "index file is full");

    let page = file.page(id)?;
    page.mark_dirty();
    let hdr = NodeHdr::mut_from_bytes(&mut page.bytes_mut()[..NODE_HDR_SIZE])
        .map_err(|e| eyre::eyre!("failed to view node header {}: {:?}", id, e))?;
    // A reused page may carry a stale header; reset every field.
    hdr.node_type = U32::new(t.raw());
    hdr.set_count(0);
    hdr.set_self_id(id);
    hdr.set_parent(PTR_NULL);
    hdr.set_prev(PTR_NULL);
    hdr.set_next(PTR_NULL);
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_fills_the_page_exactly() {
        assert_eq!(BPT_ORDER, 252);
        assert_eq!(NODE_SLOTS, 253);
        assert_eq!(NODE_HDR_SIZE + NODE_SLOTS * ENTRY_SIZE, INDEX_PAGE_SIZE);
        assert_eq!(HALF_FLOOR, 126);
    }

    #[test]
    fn header_views_share_layout() {
        let mut buf = vec![0u8; INDEX_PAGE_SIZE];

        {
            let leaf = LeafNode::mut_from_bytes(&mut buf).unwrap();
            leaf.hdr.node_type = U32::new(3);
            leaf.hdr.set_count(5);
            leaf.hdr.set_self_id(0xAA);
            leaf.hdr.set_next(0xBB);
            leaf.kv[0] = KvPair::new(1, 2);
        }

        // The shared header reads identically before narrowing.
        let hdr = NodeHdr::ref_from_bytes(&buf[..NODE_HDR_SIZE]).unwrap();
        assert!(hdr.is_leaf());
        assert_eq!(hdr.count(), 5);
        assert_eq!(hdr.self_id(), 0xAA);
        assert_eq!(hdr.next(), 0xBB);

        let leaf = LeafNode::ref_from_bytes(&buf).unwrap();
        assert_eq!(leaf.kv[0].key(), 1);
        assert_eq!(leaf.kv[0].val(), 2);
    }

    #[test]
    fn node_type_tags() {
        assert_eq!(NodeType::from_raw(3).unwrap(), NodeType::Leaf);
        assert_eq!(NodeType::from_raw(11).unwrap(), NodeType::Internal);
        assert!(NodeType::from_raw(0).is_err());
    }

    #[test]
    fn entry_shift_with_copy_within() {
        let mut buf = vec![0u8; INDEX_PAGE_SIZE];
        let leaf = LeafNode::mut_from_bytes(&mut buf).unwrap();
        for i in 0..4 {
            leaf.kv[i] = KvPair::new(i as u64 * 10, i as u64 * 10 + 1);
        }

        leaf.kv.copy_within(1..4, 2);
        assert_eq!(leaf.kv[0].key(), 0);
        assert_eq!(leaf.kv[1].key(), 10);
        assert_eq!(leaf.kv[2].key(), 10);
        assert_eq!(leaf.kv[3].key(), 20);
        assert_eq!(leaf.kv[4].key(), 30);
    }
}
