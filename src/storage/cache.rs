//! # Mapping Cache
//!
//! A fixed-capacity LRU over live mmap regions, keyed by integer id.
//! Three instances exist per store: the index file's chunk-bitmap cache
//! and node-page cache, and the data file's payload-page cache. The
//! cache amortizes kernel page-table churn (map/unmap per access would
//! dominate) and batches writeback: `sync()` walks MRU to LRU flushing
//! only dirty entries, while eviction always flushes before unmapping.
//!
//! Capacity is a policy knob: larger caches reduce mmap churn but widen
//! the window of dirty, unsynced state lost on crash.
//!
//! Items are anything exposing `id()` and `sync(unmap)` — concretely
//! [`Page`](super::Page) and [`Chunk`](super::Chunk). The list is
//! intrusive over a slab of slots, so promotion and eviction never
//! reallocate.

use eyre::{ensure, Result};
use hashbrown::HashMap;

const NIL: usize = usize::MAX;

/// Capability set the cache requires of its items.
pub trait CacheItem {
    fn id(&self) -> u64;

    /// `unmap = false`: flush if dirty, keep mapped. `unmap = true`:
    /// final flush before the cache drops (and thereby unmaps) the item.
    fn sync(&mut self, unmap: bool) -> Result<()>;
}

struct Slot<T> {
    item: T,
    prev: usize,
    next: usize,
}

pub struct Cache<T: CacheItem> {
    map: HashMap<u64, usize>,
    slots: Vec<Option<Slot<T>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    limit: usize,
}

impl<T: CacheItem> Cache<T> {
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "cache capacity must be nonzero");
        Self {
            map: HashMap::with_capacity(limit + 1),
            slots: Vec::with_capacity(limit + 1),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.map.contains_key(&id)
    }

    /// Inserts at MRU, evicting the LRU entry if the cache is over
    /// capacity. Caching the same id twice is a caller bug.
    pub fn put(&mut self, item: T) -> Result<()> {
        let id = item.id();
        ensure!(!self.map.contains_key(&id), "id {} cached twice", id);

        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(Slot {
                    item,
                    prev: NIL,
                    next: NIL,
                });
                idx
            }
            None => {
                self.slots.push(Some(Slot {
                    item,
                    prev: NIL,
                    next: NIL,
                }));
                self.slots.len() - 1
            }
        };

        self.attach_front(idx);
        self.map.insert(id, idx);

        if self.map.len() > self.limit {
            let lru = self.tail;
            self.evict_slot(lru)?;
        }
        Ok(())
    }

    /// Returns the item and promotes it to MRU.
    pub fn get(&mut self, id: u64) -> Option<&mut T> {
        let idx = *self.map.get(&id)?;
        self.detach(idx);
        self.attach_front(idx);
        self.slots[idx].as_mut().map(|s| &mut s.item)
    }

    /// Flushes and unmaps one entry; absent ids are a no-op.
    pub fn evict(&mut self, id: u64) -> Result<()> {
        if let Some(&idx) = self.map.get(&id) {
            self.evict_slot(idx)?;
        }
        Ok(())
    }

    /// Flushes dirty entries in place, MRU to LRU.
    pub fn sync(&mut self) -> Result<()> {
        let mut cur = self.head;
        while cur != NIL {
            let slot = self.slots[cur].as_mut().expect("cache list corrupt");
            slot.item.sync(false)?;
            cur = slot.next;
        }
        Ok(())
    }

    /// Evicts everything (flush + unmap each entry).
    pub fn clear(&mut self) -> Result<()> {
        while self.head != NIL {
            self.evict_slot(self.head)?;
        }
        Ok(())
    }

    fn evict_slot(&mut self, idx: usize) -> Result<()> {
        self.detach(idx);
        let mut slot = self.slots[idx].take().expect("cache slot vacant");
        self.map.remove(&slot.item.id());
        self.free.push(idx);
        // Flush after unlinking so a failed msync still leaves the cache
        // consistent; the mapping is dropped either way.
        slot.item.sync(true)
    }

    fn attach_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let slot = self.slots[idx].as_mut().expect("cache slot vacant");
            slot.prev = NIL;
            slot.next = old_head;
        }
        if old_head != NIL {
            self.slots[old_head].as_mut().expect("cache list corrupt").prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let slot = self.slots[idx].as_ref().expect("cache slot vacant");
            (slot.prev, slot.next)
        };
        if prev != NIL {
            self.slots[prev].as_mut().expect("cache list corrupt").next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.slots[next].as_mut().expect("cache list corrupt").prev = prev;
        } else {
            self.tail = prev;
        }
        let slot = self.slots[idx].as_mut().expect("cache slot vacant");
        slot.prev = NIL;
        slot.next = NIL;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Log {
        evicted: Vec<u64>,
        synced: Vec<u64>,
    }

    struct TestItem {
        id: u64,
        dirty: bool,
        log: Rc<RefCell<Log>>,
    }

    impl TestItem {
        fn new(id: u64, log: &Rc<RefCell<Log>>) -> Self {
            Self {
                id,
                dirty: false,
                log: Rc::clone(log),
            }
        }
    }

    impl CacheItem for TestItem {
        fn id(&self) -> u64 {
            self.id
        }

        fn sync(&mut self, unmap: bool) -> Result<()> {
            if unmap {
                self.log.borrow_mut().evicted.push(self.id);
            } else if self.dirty {
                self.log.borrow_mut().synced.push(self.id);
                self.dirty = false;
            }
            Ok(())
        }
    }

    #[test]
    fn evicts_least_recently_used() {
        let log = Rc::new(RefCell::new(Log::default()));
        let mut cache = Cache::new(2);

        cache.put(TestItem::new(1, &log)).unwrap();
        cache.put(TestItem::new(2, &log)).unwrap();
        cache.put(TestItem::new(3, &log)).unwrap();

        assert_eq!(log.borrow().evicted, vec![1]);
        assert!(!cache.contains(1));
        assert!(cache.contains(2));
        assert!(cache.contains(3));
    }

    #[test]
    fn get_promotes_to_mru() {
        let log = Rc::new(RefCell::new(Log::default()));
        let mut cache = Cache::new(2);

        cache.put(TestItem::new(1, &log)).unwrap();
        cache.put(TestItem::new(2, &log)).unwrap();
        assert!(cache.get(1).is_some());
        cache.put(TestItem::new(3, &log)).unwrap();

        // 2 was LRU after 1's promotion.
        assert_eq!(log.borrow().evicted, vec![2]);
        assert!(cache.contains(1));
    }

    #[test]
    fn get_absent_returns_none() {
        let log = Rc::new(RefCell::new(Log::default()));
        let mut cache: Cache<TestItem> = Cache::new(2);
        cache.put(TestItem::new(1, &log)).unwrap();
        assert!(cache.get(99).is_none());
    }

    #[test]
    fn duplicate_put_is_rejected() {
        let log = Rc::new(RefCell::new(Log::default()));
        let mut cache = Cache::new(4);
        cache.put(TestItem::new(1, &log)).unwrap();
        assert!(cache.put(TestItem::new(1, &log)).is_err());
    }

    #[test]
    fn sync_flushes_only_dirty_entries() {
        let log = Rc::new(RefCell::new(Log::default()));
        let mut cache = Cache::new(4);

        cache.put(TestItem::new(1, &log)).unwrap();
        cache.put(TestItem::new(2, &log)).unwrap();
        cache.get(2).unwrap().dirty = true;

        cache.sync().unwrap();
        assert_eq!(log.borrow().synced, vec![2]);

        // Second sync: nothing left dirty.
        cache.sync().unwrap();
        assert_eq!(log.borrow().synced, vec![2]);
    }

    #[test]
    fn forced_evict_and_clear() {
        let log = Rc::new(RefCell::new(Log::default()));
        let mut cache = Cache::new(4);

        for id in 1..=3 {
            cache.put(TestItem::new(id, &log)).unwrap();
        }

        cache.evict(2).unwrap();
        assert_eq!(log.borrow().evicted, vec![2]);
        assert_eq!(cache.len(), 2);

        cache.evict(42).unwrap();
        assert_eq!(cache.len(), 2);

        cache.clear().unwrap();
        assert!(cache.is_empty());
        assert_eq!(log.borrow().evicted, vec![2, 3, 1]);
    }

    #[test]
    fn slot_reuse_after_eviction() {
        let log = Rc::new(RefCell::new(Log::default()));
        let mut cache = Cache::new(2);

        for id in 1..=10 {
            cache.put(TestItem::new(id, &log)).unwrap();
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.contains(9));
        assert!(cache.contains(10));
    }
}
