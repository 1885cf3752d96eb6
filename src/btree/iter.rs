//! # Range Iterator
//!
//! A window over the leaf sibling list, bounded by `(head leaf, begin
//! slot)` and `(tail leaf, end slot)` inclusive on both sides once the
//! endpoints are resolved by [`BpTree::range`].
//!
//! The iterator is a cursor: [`advance`](RangeIter::advance) and
//! [`retreat`](RangeIter::retreat) move one entry at a time, following
//! the leaf chain at node boundaries; [`valid`](RangeIter::valid)
//! reports whether the cursor is inside the window. Stepping past either
//! end leaves the cursor invalid, and seeking returns to the window.
//!
//! The iterator borrows the tree mutably (reads go through the page
//! cache), so it cannot outlive the store handle, and the tree cannot be
//! mutated while a range is open.

use eyre::{ensure, Result};

use crate::btree::tree::BpTree;
use crate::storage::pointer::{Ptr, PTR_NULL};

pub struct RangeIter<'a> {
    tree: &'a mut BpTree,
    /// Current leaf; [`PTR_NULL`] for the empty iterator.
    cursor: Ptr,
    /// Current slot; transiently -1 or `count` just outside the window.
    off: i64,
    b_off: i64,
    e_off: i64,
    head: Ptr,
    tail: Ptr,
}

impl<'a> RangeIter<'a> {
    pub(crate) fn new(tree: &'a mut BpTree, head: Ptr, tail: Ptr, b_off: i64, e_off: i64) -> Self {
        Self {
            tree,
            cursor: head,
            off: b_off,
            b_off,
            e_off,
            head,
            tail,
        }
    }

    pub(crate) fn empty(tree: &'a mut BpTree) -> Self {
        Self {
            tree,
            cursor: PTR_NULL,
            off: 0,
            b_off: 0,
            e_off: 0,
            head: PTR_NULL,
            tail: PTR_NULL,
        }
    }

    /// Whether the cursor currently addresses an entry of the window.
    pub fn valid(&self) -> bool {
        if self.cursor == PTR_NULL {
            return false;
        }
        if self.cursor == self.head && self.off < self.b_off {
            return false;
        }
        if self.cursor == self.tail && self.off > self.e_off {
            return false;
        }
        true
    }

    /// Key at the cursor.
    pub fn key(&mut self) -> Result<Vec<u8>> {
        ensure!(self.valid(), "iterator is out of range");
        let kv = self.tree.leaf_entry(self.cursor, self.off as usize)?;
        self.tree.load_payload(kv.key())
    }

    /// Value at the cursor.
    pub fn val(&mut self) -> Result<Vec<u8>> {
        ensure!(self.valid(), "iterator is out of range");
        let kv = self.tree.leaf_entry(self.cursor, self.off as usize)?;
        self.tree.load_payload(kv.val())
    }

    /// Steps forward one entry, following the leaf chain past the end of
    /// the current leaf. Stepping past the tail slot invalidates.
    pub fn advance(&mut self) -> Result<()> {
        if self.cursor == PTR_NULL {
            return Ok(());
        }
        self.off += 1;
        let (count, _, next) = self.tree.leaf_shape(self.cursor)?;
        if self.off >= count as i64 && self.cursor != self.tail {
            self.cursor = next;
            self.off = 0;
        }
        Ok(())
    }

    /// Steps backward one entry, landing on the previous leaf's last
    /// slot at leaf boundaries. Stepping past the begin slot invalidates.
    pub fn retreat(&mut self) -> Result<()> {
        if self.cursor == PTR_NULL {
            return Ok(());
        }
        self.off -= 1;
        if self.off < 0 && self.cursor != self.head {
            let (_, prev, _) = self.tree.leaf_shape(self.cursor)?;
            let (prev_count, _, _) = self.tree.leaf_shape(prev)?;
            self.cursor = prev;
            self.off = prev_count as i64 - 1;
        }
        Ok(())
    }

    /// Repositions at the first entry of the window.
    pub fn seek_first(&mut self) {
        self.cursor = self.head;
        self.off = self.b_off;
    }

    /// Repositions at the last entry of the window.
    pub fn seek_last(&mut self) {
        self.cursor = self.tail;
        self.off = self.e_off;
    }

    /// Reads the current entry and advances: `None` once exhausted.
    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if !self.valid() {
            return Ok(None);
        }
        let key = self.key()?;
        let val = self.val()?;
        self.advance()?;
        Ok(Some((key, val)))
    }
}
