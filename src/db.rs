//! # Public Facade
//!
//! [`Db`] owns the tree handle and validates key/value sizes before
//! anything touches the allocators. Everything else delegates.

use std::path::Path;

use eyre::Result;
use tracing::warn;

use crate::btree::{BpTree, RangeIter};
use crate::config::{DEFAULT_NAME, MAX_KV_SIZE};

/// An open store. Every operation takes `&mut self`; one at a time.
pub struct Db {
    tree: BpTree,
}

impl Db {
    /// Opens (creating and formatting if needed) the store named
    /// "chaos" under `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Db> {
        Self::open_named(root, DEFAULT_NAME)
    }

    /// Opens a store with an explicit name; its files are `{name}.db`
    /// and `{name}.data` under `root`. Empty names are rejected.
    pub fn open_named<P: AsRef<Path>>(root: P, name: &str) -> Result<Db> {
        Ok(Db {
            tree: BpTree::open(root.as_ref(), name)?,
        })
    }

    /// Inserts `key` -> `val`. Returns `false` without side effects when
    /// either size is outside `[1, MAX_KV_SIZE]`, when the key already
    /// exists, or when payload space is exhausted.
    pub fn put(&mut self, key: &[u8], val: &[u8]) -> Result<bool> {
        if !valid_size(key) || !valid_size(val) {
            warn!(
                key_len = key.len(),
                val_len = val.len(),
                "key or value size outside [1, {}]",
                MAX_KV_SIZE
            );
            return Ok(false);
        }
        self.tree.put(key, val)
    }

    /// Returns the value for `key`, empty iff absent.
    pub fn get(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        self.tree.get(key)
    }

    pub fn contains(&mut self, key: &[u8]) -> Result<bool> {
        self.tree.contains(key)
    }

    /// Deletes `key`; deleting an absent key is a no-op.
    pub fn del(&mut self, key: &[u8]) -> Result<()> {
        self.tree.del(key)
    }

    /// Iterates entries between `from` and `to`; see
    /// [`BpTree::range`] for the endpoint rules.
    pub fn range(&mut self, from: &[u8], to: &[u8]) -> Result<RangeIter<'_>> {
        self.tree.range(from, to)
    }

    /// Makes every mutation so far durable.
    pub fn flush(&mut self) -> Result<()> {
        self.tree.flush()
    }

    /// Persistent entry count. O(1).
    pub fn items(&self) -> u64 {
        self.tree.items()
    }

    /// Recounted entry count (walks the leaves); a diagnostic.
    pub fn count(&mut self) -> Result<u64> {
        self.tree.count()
    }

    /// Flushes and closes both files. Dropping without calling this
    /// performs the same teardown best-effort.
    pub fn close(self) -> Result<()> {
        self.tree.close()
    }
}

fn valid_size(bytes: &[u8]) -> bool {
    !bytes.is_empty() && bytes.len() <= MAX_KV_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_db() -> (tempfile::TempDir, Db) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_named(dir.path(), "t").unwrap();
        (dir, db)
    }

    #[test]
    fn rejects_empty_key_or_value() {
        let (_dir, mut db) = open_db();
        assert!(!db.put(b"", b"v").unwrap());
        assert!(!db.put(b"k", b"").unwrap());
        assert_eq!(db.items(), 0);
    }

    #[test]
    fn rejects_oversized_key() {
        let (_dir, mut db) = open_db();
        let huge = vec![0u8; MAX_KV_SIZE + 1];
        assert!(!db.put(&huge, b"v").unwrap());
        assert!(!db.put(b"k", &huge).unwrap());
        assert_eq!(db.items(), 0);
    }

    #[test]
    fn accepts_boundary_sizes() {
        let (_dir, mut db) = open_db();
        assert!(db.put(b"a", b"b").unwrap());
        assert_eq!(db.get(b"a").unwrap(), b"b");
    }

    #[test]
    fn open_default_name_creates_chaos_files() {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open(dir.path()).unwrap();
        drop(db);
        assert!(dir.path().join("chaos.db").exists());
        assert!(dir.path().join("chaos.data").exists());
    }

    #[test]
    fn reopen_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut db = Db::open_named(dir.path(), "t").unwrap();
            db.put(b"k", b"v").unwrap();
            db.close().unwrap();
        }
        let mut db = Db::open_named(dir.path(), "t").unwrap();
        assert_eq!(db.get(b"k").unwrap(), b"v");
        assert_eq!(db.items(), 1);
    }
}
