//! # B+Tree Engine
//!
//! The on-disk B+tree over the index and data files. All entries live in
//! leaves; internal nodes hold separator keys and child pointers, with
//! one more child than separators. Nodes at each level are linked into a
//! doubly linked sibling list, which gives range scans their forward and
//! backward steps.
//!
//! ## Structural operations
//!
//! Insertion descends to a leaf and inserts in place when it fits. A
//! full leaf splits around its midpoint: the new entry goes into the
//! left (original) node first, the upper half moves to a fresh right
//! sibling, and the right sibling's first key is pushed into the parent,
//! recursing as parents fill up. A root split grows the tree by one
//! level.
//!
//! Deletion removes in place while the leaf stays above the half-full
//! floor; otherwise it borrows from, or merges with, a sibling chosen by
//! [`which_side`], rotating separators through the parent so the
//! separator invariant holds. Merges remove a separator from the parent
//! and recurse; a root internal node reduced to a single child promotes
//! that child and the tree shrinks by one level.
//!
//! ## Node access discipline
//!
//! Nodes are reached by id through the page cache; every helper borrows
//! the file mutably for exactly one node view at a time, copying the few
//! entries that must travel between nodes. The borrow checker enforces
//! the allocator's contract: no node view survives an allocation that
//! could recycle or evict its page.

use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::btree::iter::RangeIter;
use crate::btree::node::{
    intl_mut, intl_ref, leaf_mut, leaf_ref, node_alloc, node_mut, node_ref, KcPair, KvPair,
    NodeType, BPT_ORDER, HALF_FLOOR,
};
use crate::config::{DATA_FILE_EXTENSION, INDEX_FILE_EXTENSION};
use crate::storage::pointer::{Ptr, PTR_NULL};
use crate::storage::{DataFile, NodeFile};

/// A leaf inserts in place below this count.
const LEAF_FULL_AT: u32 = (BPT_ORDER - 1) as u32;

/// An internal node inserts in place below this count.
const INTL_FULL_AT: u32 = BPT_ORDER as u32;

/// Entry buffer for split/merge moves; spills for the big halves.
type KvBuf = SmallVec<[KvPair; 32]>;
type KcBuf = SmallVec<[KcPair; 32]>;

pub struct BpTree {
    node: NodeFile,
    data: DataFile,
}

impl BpTree {
    /// Opens the store under `root`, creating the directory and
    /// formatting both files if either is missing (a store is never
    /// opened half-formatted).
    pub fn open(root: &Path, name: &str) -> Result<BpTree> {
        ensure!(!name.is_empty(), "empty store name is not allowed");
        std::fs::create_dir_all(root)
            .wrap_err_with(|| format!("failed to create store directory '{}'", root.display()))?;

        let node_path = root.join(format!("{}.{}", name, INDEX_FILE_EXTENSION));
        let data_path = root.join(format!("{}.{}", name, DATA_FILE_EXTENSION));

        if !node_path.exists() || !data_path.exists() {
            debug!("formatting fresh store under '{}'", root.display());
            NodeFile::format(&node_path)?;
            DataFile::format(&data_path)?;
        }

        let node = NodeFile::open(&node_path)?;
        let data = DataFile::open(&data_path)?;
        Ok(BpTree { node, data })
    }

    /// Inserts `key` -> `val`. Returns `false` when the key is already
    /// present (no overwrite) or when payload space is exhausted.
    pub fn put(&mut self, key: &[u8], val: &[u8]) -> Result<bool> {
        if self.root() == PTR_NULL {
            let Some((pk, pv)) = self.store_kv(key, val)? else {
                warn!("put failed: no payload space");
                return Ok(false);
            };
            let leaf = node_alloc(&mut self.node, NodeType::Leaf)?;
            {
                let l = leaf_mut(&mut self.node, leaf)?;
                l.hdr.set_count(1);
                l.kv[0] = KvPair::new(pk, pv);
            }
            self.kv_inc();
            self.set_root(leaf);
            return Ok(true);
        }

        let leaf = self.search(key)?;
        self.leaf_put(leaf, key, val)
    }

    /// Point lookup; the empty vector means absent (values are at least
    /// one byte).
    pub fn get(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        let leaf = self.search(key)?;
        if leaf == PTR_NULL {
            return Ok(Vec::new());
        }
        let (found, pos) = self.leaf_search(leaf, key)?;
        if !found {
            return Ok(Vec::new());
        }
        let val = leaf_ref(&mut self.node, leaf)?.kv[pos].val();
        self.data.load(val)
    }

    pub fn contains(&mut self, key: &[u8]) -> Result<bool> {
        let leaf = self.search(key)?;
        if leaf == PTR_NULL {
            return Ok(false);
        }
        Ok(self.leaf_search(leaf, key)?.0)
    }

    /// Deletes `key`; absent keys are a no-op.
    pub fn del(&mut self, key: &[u8]) -> Result<()> {
        let leaf = self.search(key)?;
        if leaf != PTR_NULL {
            self.leaf_del(leaf, key)?;
        }
        Ok(())
    }

    /// Range scan between `from` and `to` (swapped when reversed). The
    /// upper endpoint is inclusive when present and exclusive when
    /// absent; the lower endpoint is always inclusive.
    pub fn range(&mut self, from: &[u8], to: &[u8]) -> Result<RangeIter<'_>> {
        if self.root() == PTR_NULL {
            return Ok(RangeIter::empty(self));
        }

        let (from, to) = if from > to { (to, from) } else { (from, to) };
        let pf = self.search(from)?;
        let pt = self.search(to)?;

        let (found_b, mut beg) = self.leaf_search(pf, from)?;
        let (found_e, mut end) = self.leaf_search(pt, to)?;
        let fcount = leaf_ref(&mut self.node, pf)?.hdr.count() as usize;
        let tcount = leaf_ref(&mut self.node, pt)?.hdr.count() as usize;

        let mut head = pf;
        let mut tail = pt;

        // Both endpoints missing and resolving past the same leaf: the
        // window is empty.
        if !found_b && !found_e && pf == pt && beg == fcount && end == tcount {
            return Ok(RangeIter::empty(self));
        }

        if !found_b && beg == fcount {
            head = leaf_ref(&mut self.node, pf)?.hdr.next();
            if head == PTR_NULL {
                return Ok(RangeIter::empty(self));
            }
            beg = 0;
        }

        if !found_e {
            if end == 0 {
                tail = leaf_ref(&mut self.node, pt)?.hdr.prev();
                if tail == PTR_NULL {
                    return Ok(RangeIter::empty(self));
                }
                end = leaf_ref(&mut self.node, tail)?.hdr.count() as usize - 1;
            } else {
                end -= 1;
            }
        }

        Ok(RangeIter::new(self, head, tail, beg as i64, end as i64))
    }

    /// Persistent key/value count, read from the index header. O(1).
    pub fn items(&self) -> u64 {
        self.node.hdr().nr_kv()
    }

    /// Whether the tree holds no entries (null root).
    pub fn is_empty(&self) -> bool {
        self.root() == PTR_NULL
    }

    /// Pages in use per the chunk usage counters, as
    /// `(index pages, data pages)`. A diagnostic.
    pub fn allocated_pages(&self) -> (u64, u64) {
        (self.node.hdr().used_total(), self.data.hdr().used_total())
    }

    /// Recounts by walking the leaf list. O(leaves); a diagnostic cross
    /// check against [`items`](Self::items).
    pub fn count(&mut self) -> Result<u64> {
        let mut cur = self.root();
        if cur == PTR_NULL {
            return Ok(0);
        }

        // Descend the left spine to the first leaf before walking the
        // sibling list.
        while node_ref(&mut self.node, cur)?.node_type()? == NodeType::Internal {
            cur = intl_ref(&mut self.node, cur)?.kc[0].child();
        }

        let mut n = 0u64;
        loop {
            let l = leaf_ref(&mut self.node, cur)?;
            n += l.hdr.count() as u64;
            if l.hdr.next() == PTR_NULL {
                return Ok(n);
            }
            cur = l.hdr.next();
        }
    }

    /// Flushes dirty cache entries, headers, and both files.
    pub fn flush(&mut self) -> Result<()> {
        self.node.sync()?;
        self.data.sync()
    }

    /// Explicit teardown with error reporting; dropping does the same
    /// best-effort.
    pub fn close(mut self) -> Result<()> {
        self.node.close()?;
        self.data.close()
    }

    fn root(&self) -> Ptr {
        self.node.hdr().root()
    }

    fn set_root(&mut self, root: Ptr) {
        self.node.hdr_mut().set_root(root);
    }

    fn kv_inc(&mut self) {
        let hdr = self.node.hdr_mut();
        let n = hdr.nr_kv();
        hdr.set_nr_kv(n + 1);
    }

    fn kv_dec(&mut self) {
        let hdr = self.node.hdr_mut();
        let n = hdr.nr_kv();
        hdr.set_nr_kv(n - 1);
    }

    /// Descends from the root to the leaf that owns `key`. Returns
    /// [`PTR_NULL`] iff the tree is empty.
    fn search(&mut self, key: &[u8]) -> Result<Ptr> {
        let mut cur = self.root();
        while cur != PTR_NULL {
            match node_ref(&mut self.node, cur)?.node_type()? {
                NodeType::Leaf => return Ok(cur),
                NodeType::Internal => {
                    let (found, pos) = self.intl_search(cur, key)?;
                    // An exact separator match descends right of it.
                    let pos = if found { pos + 1 } else { pos };
                    cur = intl_ref(&mut self.node, cur)?.kc[pos].child();
                }
            }
        }
        Ok(PTR_NULL)
    }

    /// Binary search over a leaf's keys. Returns `(found, pos)` where
    /// `pos` is the first index whose key is `>= key`.
    fn leaf_search(&mut self, leaf: Ptr, key: &[u8]) -> Result<(bool, usize)> {
        let count = leaf_ref(&mut self.node, leaf)?.hdr.count() as usize;

        let (mut lo, mut hi) = (0i64, count as i64 - 1);
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            let kp = leaf_ref(&mut self.node, leaf)?.kv[mid as usize].key();
            if self.data.load(kp)?.as_slice() >= key {
                hi = mid - 1;
            } else {
                lo = mid + 1;
            }
        }

        let pos = lo as usize;
        if pos < count {
            let kp = leaf_ref(&mut self.node, leaf)?.kv[pos].key();
            if self.data.load(kp)? == key {
                return Ok((true, pos));
            }
        }
        Ok((false, pos))
    }

    /// Binary search over an internal node's separators (one fewer than
    /// its children).
    fn intl_search(&mut self, node: Ptr, key: &[u8]) -> Result<(bool, usize)> {
        let seps = intl_ref(&mut self.node, node)?.hdr.count() as usize - 1;

        let (mut lo, mut hi) = (0i64, seps as i64 - 1);
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            let kp = intl_ref(&mut self.node, node)?.kc[mid as usize].key();
            if self.data.load(kp)?.as_slice() >= key {
                hi = mid - 1;
            } else {
                lo = mid + 1;
            }
        }

        let pos = lo as usize;
        if pos < seps {
            let kp = intl_ref(&mut self.node, node)?.kc[pos].key();
            if self.data.load(kp)? == key {
                return Ok((true, pos));
            }
        }
        Ok((false, pos))
    }

    /// Stores both payloads, value first. Rolls the value back if the
    /// key allocation fails, so a failed put leaves no orphan extents.
    fn store_kv(&mut self, key: &[u8], val: &[u8]) -> Result<Option<(Ptr, Ptr)>> {
        let pv = self.data.store(val)?;
        if pv == PTR_NULL {
            return Ok(None);
        }
        let pk = self.data.store(key)?;
        if pk == PTR_NULL {
            self.data.free(pv)?;
            return Ok(None);
        }
        Ok(Some((pk, pv)))
    }

    /// Frees a removed entry's extents, value first.
    fn data_del(&mut self, kv: KvPair) -> Result<()> {
        self.data.free(kv.val())?;
        self.data.free(kv.key())
    }

    fn leaf_put(&mut self, leaf: Ptr, key: &[u8], val: &[u8]) -> Result<bool> {
        let (found, pos) = self.leaf_search(leaf, key)?;
        if found {
            return Ok(false);
        }

        let Some((pk, pv)) = self.store_kv(key, val)? else {
            warn!("put failed: no payload space");
            return Ok(false);
        };
        let pair = KvPair::new(pk, pv);

        let count = leaf_ref(&mut self.node, leaf)?.hdr.count();
        if count < LEAF_FULL_AT {
            let l = leaf_mut(&mut self.node, leaf)?;
            let c = l.hdr.count() as usize;
            l.kv.copy_within(pos..c, pos + 1);
            l.kv[pos] = pair;
            l.hdr.set_count(c as u32 + 1);
            self.kv_inc();
            return Ok(true);
        }

        let right = self.leaf_split(leaf, pos, pair)?;
        let sep = leaf_ref(&mut self.node, right)?.kv[0].key();
        self.insert_fixup(leaf, right, sep)?;
        Ok(true)
    }

    /// Splits a full leaf around its midpoint: insert into the left
    /// first, then move the upper half into a fresh right sibling.
    /// Returns the right sibling's id.
    fn leaf_split(&mut self, leaf: Ptr, pos: usize, pair: KvPair) -> Result<Ptr> {
        let mid = leaf_ref(&mut self.node, leaf)?.hdr.count() as usize / 2;

        let right = node_alloc(&mut self.node, NodeType::Leaf)?;
        self.node_append(leaf, right)?;

        let count = {
            let l = leaf_mut(&mut self.node, leaf)?;
            let c = l.hdr.count() as usize;
            l.kv.copy_within(pos..c, pos + 1);
            l.kv[pos] = pair;
            l.hdr.set_count(c as u32 + 1);
            c + 1
        };
        self.kv_inc();

        let moved: KvBuf = {
            let l = leaf_ref(&mut self.node, leaf)?;
            l.kv[mid..count].iter().copied().collect()
        };
        leaf_mut(&mut self.node, leaf)?.hdr.set_count(mid as u32);
        {
            let r = leaf_mut(&mut self.node, right)?;
            r.kv[..moved.len()].copy_from_slice(&moved);
            r.hdr.set_count(moved.len() as u32);
        }

        Ok(right)
    }

    /// Hooks a freshly split right node into the tree: either grows a
    /// new root above both halves, or pushes the separator into the
    /// shared parent.
    fn insert_fixup(&mut self, left: Ptr, right: Ptr, sep: Ptr) -> Result<()> {
        let lparent = node_ref(&mut self.node, left)?.parent();
        let rparent = node_ref(&mut self.node, right)?.parent();

        if lparent == PTR_NULL && rparent == PTR_NULL {
            let parent = node_alloc(&mut self.node, NodeType::Internal)?;
            {
                let p = intl_mut(&mut self.node, parent)?;
                p.hdr.set_count(2);
                p.kc[0] = KcPair::new(sep, left);
                p.kc[1].set_child(right);
            }
            node_mut(&mut self.node, left)?.set_parent(parent);
            node_mut(&mut self.node, right)?.set_parent(parent);
            self.set_root(parent);
            return Ok(());
        }

        ensure!(
            rparent == PTR_NULL,
            "split sibling {} already has a parent",
            right
        );
        node_mut(&mut self.node, right)?.set_parent(lparent);
        self.intl_put(lparent, right, sep)
    }

    /// Inserts separator `sep` (owning the subtree `child` to its right)
    /// into an internal node, splitting it when full.
    fn intl_put(&mut self, node: Ptr, child: Ptr, sep: Ptr) -> Result<()> {
        let key = self.data.load(sep)?;
        let (found, pos) = self.intl_search(node, &key)?;
        ensure!(!found, "separator already present at {}", pos);

        let count = intl_ref(&mut self.node, node)?.hdr.count();
        if count < INTL_FULL_AT {
            let n = intl_mut(&mut self.node, node)?;
            let c = n.hdr.count() as usize;
            n.kc.copy_within(pos..c, pos + 1);
            n.kc[pos].set_key(sep);
            n.kc[pos + 1].set_child(child);
            n.hdr.set_count(c as u32 + 1);
            return Ok(());
        }

        let (promoted, right) = self.intl_split(node, child, pos, sep)?;
        self.insert_fixup(node, right, promoted)
    }

    /// Splits a full internal node. The insertion lands in the left
    /// node first; entries from the midpoint up move to a fresh right
    /// sibling (reparenting their subtrees), and the key left of the
    /// midpoint is promoted as the new separator.
    fn intl_split(&mut self, node: Ptr, child: Ptr, pos: usize, sep: Ptr) -> Result<(Ptr, Ptr)> {
        let mid = (intl_ref(&mut self.node, node)?.hdr.count() as usize + 1) / 2;

        let right = node_alloc(&mut self.node, NodeType::Internal)?;
        self.node_append(node, right)?;

        let count = {
            let n = intl_mut(&mut self.node, node)?;
            let c = n.hdr.count() as usize;
            n.kc.copy_within(pos..c, pos + 1);
            n.kc[pos].set_key(sep);
            n.kc[pos + 1].set_child(child);
            n.hdr.set_count(c as u32 + 1);
            c + 1
        };

        let (promoted, moved) = {
            let n = intl_ref(&mut self.node, node)?;
            let moved: KcBuf = n.kc[mid..count].iter().copied().collect();
            (n.kc[mid - 1].key(), moved)
        };

        intl_mut(&mut self.node, node)?.hdr.set_count(mid as u32);
        {
            let r = intl_mut(&mut self.node, right)?;
            r.kc[..moved.len()].copy_from_slice(&moved);
            r.hdr.set_count(moved.len() as u32);
        }
        for kc in &moved {
            node_mut(&mut self.node, kc.child())?.set_parent(right);
        }

        Ok((promoted, right))
    }

    fn leaf_del(&mut self, leaf: Ptr, key: &[u8]) -> Result<()> {
        let (found, pos) = self.leaf_search(leaf, key)?;
        if !found {
            return Ok(());
        }

        let (count, parent) = {
            let l = leaf_ref(&mut self.node, leaf)?;
            (l.hdr.count(), l.hdr.parent())
        };

        if count > HALF_FLOOR {
            return self.leaf_simple_del(leaf, pos);
        }

        if parent == PTR_NULL {
            // Root leaf: allowed below the floor; dropping the last
            // entry empties the tree.
            if count == 1 {
                let kv = leaf_ref(&mut self.node, leaf)?.kv[0];
                self.data_del(kv)?;
                self.kv_dec();
                self.tree_del(leaf)?;
                self.set_root(PTR_NULL);
                ensure!(
                    self.items() == 0,
                    "kv count {} nonzero after last delete",
                    self.items()
                );
            } else {
                self.leaf_simple_del(leaf, pos)?;
            }
            return Ok(());
        }

        let first_key = leaf_ref(&mut self.node, leaf)?.kv[0].key();
        let idx = self.key_index_in_parent(parent, first_key)?;
        let (prev, next) = {
            let l = leaf_ref(&mut self.node, leaf)?;
            (l.hdr.prev(), l.hdr.next())
        };
        let lcount = if prev == PTR_NULL {
            0
        } else {
            leaf_ref(&mut self.node, prev)?.hdr.count()
        };
        let rcount = if next == PTR_NULL {
            0
        } else {
            leaf_ref(&mut self.node, next)?.hdr.count()
        };
        let pcount = intl_ref(&mut self.node, parent)?.hdr.count();

        let go_right = which_side(pcount, idx, lcount, rcount);

        self.leaf_simple_del(leaf, pos)?;

        if go_right {
            let idx = (idx + 1) as usize;
            if rcount > HALF_FLOOR {
                self.leaf_borrow_rhs(parent, leaf, next, idx)
            } else {
                self.leaf_merge_rhs(leaf, next)?;
                self.intl_del(parent, idx)
            }
        } else {
            let idx = idx as usize;
            if lcount > HALF_FLOOR {
                self.leaf_borrow_lhs(parent, leaf, prev, idx)
            } else {
                self.leaf_merge_lhs(leaf, prev)?;
                self.intl_del(parent, idx)
            }
        }
    }

    /// Removes entry `pos` from a leaf and frees its payload extents.
    /// The only place (with the root-last-key path) where payloads are
    /// freed, so every removed entry frees its extents exactly once.
    fn leaf_simple_del(&mut self, leaf: Ptr, pos: usize) -> Result<()> {
        let kv = leaf_ref(&mut self.node, leaf)?.kv[pos];
        self.data_del(kv)?;

        let l = leaf_mut(&mut self.node, leaf)?;
        let c = l.hdr.count() as usize;
        l.kv.copy_within(pos + 1..c, pos);
        l.hdr.set_count(c as u32 - 1);
        self.kv_dec();
        Ok(())
    }

    /// Takes the right sibling's first entry; the parent separator at
    /// `idx` becomes the sibling's new first key.
    fn leaf_borrow_rhs(&mut self, parent: Ptr, leaf: Ptr, right: Ptr, idx: usize) -> Result<()> {
        let first = leaf_ref(&mut self.node, right)?.kv[0];
        {
            let l = leaf_mut(&mut self.node, leaf)?;
            let c = l.hdr.count() as usize;
            l.kv[c] = first;
            l.hdr.set_count(c as u32 + 1);
        }
        {
            let r = leaf_mut(&mut self.node, right)?;
            let c = r.hdr.count() as usize;
            r.kv.copy_within(1..c, 0);
            r.hdr.set_count(c as u32 - 1);
        }
        let new_first = leaf_ref(&mut self.node, right)?.kv[0].key();
        intl_mut(&mut self.node, parent)?.kc[idx].set_key(new_first);
        Ok(())
    }

    /// Absorbs the right sibling into `leaf` and frees it.
    fn leaf_merge_rhs(&mut self, leaf: Ptr, right: Ptr) -> Result<()> {
        let moved: KvBuf = {
            let r = leaf_ref(&mut self.node, right)?;
            r.kv[..r.hdr.count() as usize].iter().copied().collect()
        };
        {
            let l = leaf_mut(&mut self.node, leaf)?;
            let c = l.hdr.count() as usize;
            l.kv[c..c + moved.len()].copy_from_slice(&moved);
            l.hdr.set_count((c + moved.len()) as u32);
        }
        self.tree_del(right)
    }

    /// Takes the left sibling's last entry as the new first entry; the
    /// parent separator at `idx` becomes that key.
    fn leaf_borrow_lhs(&mut self, parent: Ptr, leaf: Ptr, left: Ptr, idx: usize) -> Result<()> {
        let last = {
            let l = leaf_ref(&mut self.node, left)?;
            l.kv[l.hdr.count() as usize - 1]
        };
        {
            let n = leaf_mut(&mut self.node, leaf)?;
            let c = n.hdr.count() as usize;
            n.kv.copy_within(0..c, 1);
            n.kv[0] = last;
            n.hdr.set_count(c as u32 + 1);
        }
        {
            let l = leaf_mut(&mut self.node, left)?;
            let c = l.hdr.count();
            l.hdr.set_count(c - 1);
        }
        intl_mut(&mut self.node, parent)?.kc[idx].set_key(last.key());
        Ok(())
    }

    /// Moves `leaf`'s entries into the left sibling and frees `leaf`.
    fn leaf_merge_lhs(&mut self, leaf: Ptr, left: Ptr) -> Result<()> {
        let moved: KvBuf = {
            let l = leaf_ref(&mut self.node, leaf)?;
            l.kv[..l.hdr.count() as usize].iter().copied().collect()
        };
        {
            let l = leaf_mut(&mut self.node, left)?;
            let c = l.hdr.count() as usize;
            l.kv[c..c + moved.len()].copy_from_slice(&moved);
            l.hdr.set_count((c + moved.len()) as u32);
        }
        self.tree_del(leaf)
    }

    /// Removes separator `pos` (and the child right of it) from an
    /// internal node, rebalancing or collapsing the root as needed.
    fn intl_del(&mut self, node: Ptr, pos: usize) -> Result<()> {
        let (count, parent) = {
            let n = intl_ref(&mut self.node, node)?;
            (n.hdr.count(), n.hdr.parent())
        };

        if count > HALF_FLOOR {
            return self.intl_simple_del(node, pos);
        }

        if parent == PTR_NULL {
            if count == 2 {
                // The surviving child becomes the root; the tree loses
                // a level.
                let child = intl_ref(&mut self.node, node)?.kc[0].child();
                node_mut(&mut self.node, child)?.set_parent(PTR_NULL);
                self.set_root(child);
                self.tree_del(node)?;
            } else {
                self.intl_simple_del(node, pos)?;
            }
            return Ok(());
        }

        let first_key = intl_ref(&mut self.node, node)?.kc[0].key();
        let idx = self.key_index_in_parent(parent, first_key)?;
        let (prev, next) = {
            let n = node_ref(&mut self.node, node)?;
            (n.prev(), n.next())
        };
        let lcount = if prev == PTR_NULL {
            0
        } else {
            intl_ref(&mut self.node, prev)?.hdr.count()
        };
        let rcount = if next == PTR_NULL {
            0
        } else {
            intl_ref(&mut self.node, next)?.hdr.count()
        };
        let pcount = intl_ref(&mut self.node, parent)?.hdr.count();

        let go_right = which_side(pcount, idx, lcount, rcount);

        if go_right {
            let idx = (idx + 1) as usize;
            self.intl_simple_del(node, pos)?;
            if rcount > HALF_FLOOR {
                self.intl_borrow_rhs(parent, node, next, idx)
            } else {
                self.intl_merge_rhs(parent, node, next, idx)?;
                self.intl_del(parent, idx)
            }
        } else {
            let idx = idx as usize;
            if lcount > HALF_FLOOR {
                self.intl_borrow_lhs(parent, node, prev, pos, idx)
            } else {
                self.intl_merge_lhs(parent, node, prev, pos, idx)?;
                self.intl_del(parent, idx)
            }
        }
    }

    /// Splices separator `pos` and child `pos + 1` out of an internal
    /// node.
    fn intl_simple_del(&mut self, node: Ptr, pos: usize) -> Result<()> {
        let n = intl_mut(&mut self.node, node)?;
        let c = n.hdr.count() as usize;
        ensure!(c >= 2, "internal node with {} children", c);

        for i in pos..c - 2 {
            let k = n.kc[i + 1].key();
            n.kc[i].set_key(k);
            let ch = n.kc[i + 2].child();
            n.kc[i + 1].set_child(ch);
        }
        n.hdr.set_count(c as u32 - 1);
        Ok(())
    }

    /// Rotates one child in from the right sibling through the parent
    /// separator at `idx`.
    fn intl_borrow_rhs(&mut self, parent: Ptr, node: Ptr, right: Ptr, idx: usize) -> Result<()> {
        let psep = intl_ref(&mut self.node, parent)?.kc[idx].key();
        let (rkey, rchild) = {
            let r = intl_ref(&mut self.node, right)?;
            (r.kc[0].key(), r.kc[0].child())
        };

        {
            let n = intl_mut(&mut self.node, node)?;
            let c = n.hdr.count() as usize;
            n.kc[c - 1].set_key(psep);
            n.kc[c].set_child(rchild);
            n.hdr.set_count(c as u32 + 1);
        }
        node_mut(&mut self.node, rchild)?.set_parent(node);
        intl_mut(&mut self.node, parent)?.kc[idx].set_key(rkey);

        {
            let r = intl_mut(&mut self.node, right)?;
            let c = r.hdr.count() as usize;
            for i in 0..c - 2 {
                let k = r.kc[i + 1].key();
                r.kc[i].set_key(k);
            }
            for i in 0..c - 1 {
                let ch = r.kc[i + 1].child();
                r.kc[i].set_child(ch);
            }
            r.hdr.set_count(c as u32 - 1);
        }
        Ok(())
    }

    /// Concatenates node ∪ parent separator ∪ right sibling into `node`,
    /// reparenting the moved subtrees, and frees the sibling.
    fn intl_merge_rhs(&mut self, parent: Ptr, node: Ptr, right: Ptr, idx: usize) -> Result<()> {
        let psep = intl_ref(&mut self.node, parent)?.kc[idx].key();
        let moved: KcBuf = {
            let r = intl_ref(&mut self.node, right)?;
            r.kc[..r.hdr.count() as usize].iter().copied().collect()
        };

        {
            let n = intl_mut(&mut self.node, node)?;
            let c = n.hdr.count() as usize;
            n.kc[c - 1].set_key(psep);
            for (j, kc) in moved.iter().enumerate() {
                if j < moved.len() - 1 {
                    n.kc[c + j].set_key(kc.key());
                }
                n.kc[c + j].set_child(kc.child());
            }
            n.hdr.set_count((c + moved.len()) as u32);
        }
        for kc in &moved {
            node_mut(&mut self.node, kc.child())?.set_parent(node);
        }
        self.tree_del(right)
    }

    /// Rotates one child in from the left sibling; `pos` is spliced out
    /// while the front entry is made room for in one pass.
    fn intl_borrow_lhs(
        &mut self,
        parent: Ptr,
        node: Ptr,
        left: Ptr,
        pos: usize,
        idx: usize,
    ) -> Result<()> {
        let psep = intl_ref(&mut self.node, parent)?.kc[idx].key();
        let (lkey, lchild) = {
            let l = intl_ref(&mut self.node, left)?;
            let c = l.hdr.count() as usize;
            (l.kc[c - 2].key(), l.kc[c - 1].child())
        };

        {
            let n = intl_mut(&mut self.node, node)?;
            for i in (1..=pos).rev() {
                let k = n.kc[i - 1].key();
                n.kc[i].set_key(k);
            }
            for i in (1..=pos + 1).rev() {
                let ch = n.kc[i - 1].child();
                n.kc[i].set_child(ch);
            }
            n.kc[0].set_key(psep);
            n.kc[0].set_child(lchild);
        }
        node_mut(&mut self.node, lchild)?.set_parent(node);
        intl_mut(&mut self.node, parent)?.kc[idx].set_key(lkey);
        {
            let l = intl_mut(&mut self.node, left)?;
            let c = l.hdr.count();
            l.hdr.set_count(c - 1);
        }
        Ok(())
    }

    /// Concatenates left sibling ∪ parent separator ∪ node (minus the
    /// spliced entry at `pos`) into the left sibling, and frees `node`.
    fn intl_merge_lhs(
        &mut self,
        parent: Ptr,
        node: Ptr,
        left: Ptr,
        pos: usize,
        idx: usize,
    ) -> Result<()> {
        let psep = intl_ref(&mut self.node, parent)?.kc[idx].key();
        let entries: KcBuf = {
            let n = intl_ref(&mut self.node, node)?;
            n.kc[..n.hdr.count() as usize].iter().copied().collect()
        };

        {
            let l = intl_mut(&mut self.node, left)?;
            let c = l.hdr.count() as usize;
            l.kc[c - 1].set_key(psep);

            let mut i = c;
            for (j, kc) in entries.iter().enumerate().take(entries.len() - 1) {
                if j != pos {
                    l.kc[i].set_key(kc.key());
                    i += 1;
                }
            }
            let mut i = c;
            for (j, kc) in entries.iter().enumerate() {
                // The child right of the spliced separator is the one
                // the lower-level merge already freed.
                if j == pos + 1 {
                    continue;
                }
                l.kc[i].set_child(kc.child());
                i += 1;
            }
            l.hdr.set_count((c + entries.len() - 1) as u32);
        }
        for (j, kc) in entries.iter().enumerate() {
            if j != pos + 1 {
                node_mut(&mut self.node, kc.child())?.set_parent(left);
            }
        }
        self.tree_del(node)
    }

    /// Index of the separator governing the child whose first key is
    /// `key_ptr`; -1 for the leftmost child.
    fn key_index_in_parent(&mut self, parent: Ptr, key_ptr: Ptr) -> Result<i64> {
        let key = self.data.load(key_ptr)?;
        let (found, pos) = self.intl_search(parent, &key)?;
        Ok(if found { pos as i64 } else { pos as i64 - 1 })
    }

    /// Links `node` into the sibling list right after `head`.
    fn node_append(&mut self, head: Ptr, node: Ptr) -> Result<()> {
        let head_next = node_ref(&mut self.node, head)?.next();
        {
            let n = node_mut(&mut self.node, node)?;
            n.set_prev(head);
            n.set_next(head_next);
        }
        node_mut(&mut self.node, head)?.set_next(node);
        if head_next != PTR_NULL {
            node_mut(&mut self.node, head_next)?.set_prev(node);
        }
        Ok(())
    }

    /// Unlinks `node` from its sibling list and frees its page.
    fn tree_del(&mut self, node: Ptr) -> Result<()> {
        let (prev, next) = {
            let n = node_ref(&mut self.node, node)?;
            (n.prev(), n.next())
        };
        if prev != PTR_NULL {
            node_mut(&mut self.node, prev)?.set_next(next);
        }
        if next != PTR_NULL {
            node_mut(&mut self.node, next)?.set_prev(prev);
        }
        self.node.free(node)
    }

    pub(crate) fn leaf_shape(&mut self, leaf: Ptr) -> Result<(u32, Ptr, Ptr)> {
        let l = leaf_ref(&mut self.node, leaf)?;
        Ok((l.hdr.count(), l.hdr.prev(), l.hdr.next()))
    }

    pub(crate) fn leaf_entry(&mut self, leaf: Ptr, slot: usize) -> Result<KvPair> {
        let l = leaf_ref(&mut self.node, leaf)?;
        ensure!(
            slot < l.hdr.count() as usize,
            "slot {} out of range for leaf {}",
            slot,
            leaf
        );
        Ok(l.kv[slot])
    }

    pub(crate) fn load_payload(&mut self, p: Ptr) -> Result<Vec<u8>> {
        self.data.load(p)
    }
}

/// Sibling choice for rebalancing: forced right for the leftmost child,
/// forced left for the rightmost, otherwise whichever sibling is larger
/// (better borrow viability and balance). Returns true for right.
fn which_side(parent_count: u32, idx: i64, lcount: u32, rcount: u32) -> bool {
    if idx == -1 {
        return true;
    }
    if idx == parent_count as i64 - 2 {
        return false;
    }
    lcount < rcount
}

// Invariant checking, exposed for tests and diagnostics.
impl BpTree {
    /// Walks the whole tree verifying structural invariants: header
    /// back-references, same-depth leaves, in-node key ordering,
    /// separator bounds, sibling-chain consistency, and the persistent
    /// kv count. Loads every key; intended for tests.
    pub fn validate(&mut self) -> Result<()> {
        let root = self.root();
        if root == PTR_NULL {
            ensure!(self.items() == 0, "empty tree with nr_kv {}", self.items());
            return Ok(());
        }

        let mut leaf_depth = None;
        let (total, _, _) = self.validate_node(root, PTR_NULL, 0, &mut leaf_depth)?;
        ensure!(
            total == self.items(),
            "tree holds {} entries but header says {}",
            total,
            self.items()
        );

        self.validate_leaf_chain()?;
        Ok(())
    }

    /// Returns (entries, min key, max key) of the subtree at `id`.
    fn validate_node(
        &mut self,
        id: Ptr,
        expected_parent: Ptr,
        depth: usize,
        leaf_depth: &mut Option<usize>,
    ) -> Result<(u64, Vec<u8>, Vec<u8>)> {
        let hdr = *node_ref(&mut self.node, id)?;
        ensure!(hdr.self_id() == id, "node {} has self id {}", id, hdr.self_id());
        ensure!(
            hdr.parent() == expected_parent,
            "node {} has parent {} expected {}",
            id,
            hdr.parent(),
            expected_parent
        );

        match hdr.node_type()? {
            NodeType::Leaf => {
                let count = hdr.count() as usize;
                ensure!(count >= 1, "empty leaf {}", id);
                match leaf_depth {
                    Some(d) => ensure!(*d == depth, "leaf {} at depth {} expected {}", id, depth, d),
                    None => *leaf_depth = Some(depth),
                }

                let mut keys = Vec::with_capacity(count);
                for i in 0..count {
                    let kp = leaf_ref(&mut self.node, id)?.kv[i].key();
                    keys.push(self.data.load(kp)?);
                }
                for w in keys.windows(2) {
                    ensure!(w[0] < w[1], "leaf {} keys out of order", id);
                }
                let min = keys.first().cloned().expect("count >= 1");
                let max = keys.last().cloned().expect("count >= 1");
                Ok((count as u64, min, max))
            }
            NodeType::Internal => {
                let count = hdr.count() as usize;
                ensure!(count >= 2, "internal node {} with {} children", id, count);

                let mut seps = Vec::with_capacity(count - 1);
                for i in 0..count - 1 {
                    let kp = intl_ref(&mut self.node, id)?.kc[i].key();
                    seps.push(self.data.load(kp)?);
                }
                for w in seps.windows(2) {
                    ensure!(w[0] < w[1], "node {} separators out of order", id);
                }

                let mut total = 0;
                let mut bounds = Vec::with_capacity(count);
                for i in 0..count {
                    let child = intl_ref(&mut self.node, id)?.kc[i].child();
                    let (n, min, max) = self.validate_node(child, id, depth + 1, leaf_depth)?;
                    total += n;
                    bounds.push((min, max));
                }

                // Separator i strictly bounds subtree i from above and
                // admits subtree i+1 from below.
                for (i, sep) in seps.iter().enumerate() {
                    ensure!(
                        &bounds[i].1 < sep,
                        "node {} separator {} not above left subtree",
                        id,
                        i
                    );
                    ensure!(
                        sep <= &bounds[i + 1].0,
                        "node {} separator {} above right subtree",
                        id,
                        i
                    );
                }

                let min = bounds.first().cloned().expect("count >= 2").0;
                let max = bounds.last().cloned().expect("count >= 2").1;
                Ok((total, min, max))
            }
        }
    }

    fn validate_leaf_chain(&mut self) -> Result<()> {
        let mut cur = self.root();
        while node_ref(&mut self.node, cur)?.node_type()? == NodeType::Internal {
            cur = intl_ref(&mut self.node, cur)?.kc[0].child();
        }

        let mut prev_id = PTR_NULL;
        let mut prev_last: Option<Vec<u8>> = None;
        let mut sum = 0u64;
        loop {
            let (count, prev, next) = self.leaf_shape(cur)?;
            ensure!(
                prev == prev_id,
                "leaf {} prev {} expected {}",
                cur,
                prev,
                prev_id
            );
            sum += count as u64;

            let first_ptr = leaf_ref(&mut self.node, cur)?.kv[0].key();
            let first = self.data.load(first_ptr)?;
            if let Some(last) = &prev_last {
                ensure!(*last < first, "leaf chain out of order at {}", cur);
            }
            let last_ptr = leaf_ref(&mut self.node, cur)?.kv[count as usize - 1].key();
            prev_last = Some(self.data.load(last_ptr)?);

            if next == PTR_NULL {
                break;
            }
            prev_id = cur;
            cur = next;
        }

        ensure!(
            sum == self.items(),
            "leaf chain holds {} entries but header says {}",
            sum,
            self.items()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tree() -> (tempfile::TempDir, BpTree) {
        let dir = tempfile::tempdir().unwrap();
        let tree = BpTree::open(dir.path(), "t").unwrap();
        (dir, tree)
    }

    #[test]
    fn empty_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(BpTree::open(dir.path(), "").is_err());
    }

    #[test]
    fn empty_tree_lookups() {
        let (_dir, mut t) = open_tree();
        assert_eq!(t.get(b"nope").unwrap(), b"");
        assert!(!t.contains(b"nope").unwrap());
        t.del(b"nope").unwrap();
        assert_eq!(t.items(), 0);
        assert_eq!(t.count().unwrap(), 0);
        t.validate().unwrap();
    }

    #[test]
    fn single_put_get() {
        let (_dir, mut t) = open_tree();
        assert!(t.put(b"hello", b"world").unwrap());
        assert_eq!(t.get(b"hello").unwrap(), b"world");
        assert!(t.contains(b"hello").unwrap());
        assert_eq!(t.items(), 1);
        assert_eq!(t.count().unwrap(), 1);
        t.validate().unwrap();
    }

    #[test]
    fn duplicate_put_is_rejected() {
        let (_dir, mut t) = open_tree();
        assert!(t.put(b"k", b"v1").unwrap());
        assert!(!t.put(b"k", b"v2").unwrap());
        assert_eq!(t.get(b"k").unwrap(), b"v1");
        assert_eq!(t.items(), 1);
    }

    #[test]
    fn delete_last_key_empties_the_tree() {
        let (_dir, mut t) = open_tree();
        t.put(b"only", b"one").unwrap();
        t.del(b"only").unwrap();
        assert_eq!(t.items(), 0);
        assert_eq!(t.count().unwrap(), 0);
        assert!(!t.contains(b"only").unwrap());
        t.validate().unwrap();

        // The tree is usable again afterward.
        assert!(t.put(b"again", b"x").unwrap());
        assert_eq!(t.get(b"again").unwrap(), b"x");
    }

    #[test]
    fn inserts_across_leaf_splits() {
        let (_dir, mut t) = open_tree();
        for i in 0..600u32 {
            let key = format!("key{:05}", i);
            let val = format!("val{:05}", i);
            assert!(t.put(key.as_bytes(), val.as_bytes()).unwrap(), "{}", key);
        }

        assert_eq!(t.items(), 600);
        assert_eq!(t.count().unwrap(), 600);
        t.validate().unwrap();

        for i in 0..600u32 {
            let key = format!("key{:05}", i);
            let val = format!("val{:05}", i);
            assert_eq!(t.get(key.as_bytes()).unwrap(), val.into_bytes(), "{}", key);
        }
    }

    #[test]
    fn reverse_insertion_order() {
        let (_dir, mut t) = open_tree();
        for i in (0..400u32).rev() {
            let key = format!("key{:05}", i);
            t.put(key.as_bytes(), key.as_bytes()).unwrap();
        }
        t.validate().unwrap();
        for i in 0..400u32 {
            let key = format!("key{:05}", i);
            assert!(t.contains(key.as_bytes()).unwrap());
        }
    }

    #[test]
    fn deletes_across_merges() {
        let (_dir, mut t) = open_tree();
        for i in 0..600u32 {
            let key = format!("key{:05}", i);
            t.put(key.as_bytes(), key.as_bytes()).unwrap();
        }
        for i in 0..600u32 {
            let key = format!("key{:05}", i);
            t.del(key.as_bytes()).unwrap();
            assert!(!t.contains(key.as_bytes()).unwrap(), "{} survived", key);
        }

        assert_eq!(t.items(), 0);
        assert_eq!(t.count().unwrap(), 0);
        t.validate().unwrap();
    }

    #[test]
    fn interleaved_puts_and_dels() {
        let (_dir, mut t) = open_tree();
        for i in 0..500u32 {
            let key = format!("key{:05}", i);
            t.put(key.as_bytes(), key.as_bytes()).unwrap();
        }
        for i in (0..500u32).step_by(2) {
            let key = format!("key{:05}", i);
            t.del(key.as_bytes()).unwrap();
        }
        t.validate().unwrap();

        for i in 0..500u32 {
            let key = format!("key{:05}", i);
            assert_eq!(t.contains(key.as_bytes()).unwrap(), i % 2 == 1, "{}", key);
        }
        assert_eq!(t.items(), 250);
        assert_eq!(t.count().unwrap(), 250);
    }

    #[test]
    fn large_payloads_round_trip() {
        let (_dir, mut t) = open_tree();
        let key = vec![b'k'; 9000];
        let val: Vec<u8> = (0..30_000).map(|i| (i % 253) as u8).collect();
        assert!(t.put(&key, &val).unwrap());
        assert_eq!(t.get(&key).unwrap(), val);
        t.del(&key).unwrap();
        assert_eq!(t.items(), 0);
    }
}
