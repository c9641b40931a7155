//! LRU buffer pool for B+ tree pages.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use log::warn;
use lru::LruCache;

use vellum_common::page::{Node, PageId};
use vellum_common::Result;

use crate::store::NodeStore;

/// Default pool capacity in pages.
pub const DEFAULT_CAPACITY: usize = 100;

/// Maximum pool capacity in pages.
pub const MAX_CAPACITY: usize = 1000;

/// A cached page with its pool-side state.
struct PoolEntry {
    /// The cached node. Callers hold clones of this handle for the
    /// duration of a single operation.
    node: Rc<RefCell<Node>>,
    /// Whether the cached state has diverged from the store.
    dirty: bool,
    /// Whether the page is exempt from eviction.
    pinned: bool,
}

/// Bounded in-memory cache of pages with LRU eviction.
///
/// The pool is the sole path by which the tree engine acquires pages.
/// It tracks dirty and pinned state per entry; dirty pages are written
/// back through the injected [`NodeStore`] before being dropped.
///
/// Eviction happens only when an insertion finds the pool at capacity:
/// the least recently used unpinned clean page goes first, and only if
/// no clean candidate exists is a dirty page flushed and dropped.
pub struct BufferPool {
    /// Maximum number of resident pages.
    capacity: usize,
    /// Resident pages in recency order (most recent first).
    pages: LruCache<PageId, PoolEntry>,
    /// Number of `get_page` calls served from the cache.
    hit_count: u64,
    /// Number of `get_page` calls that went to the store.
    miss_count: u64,
}

impl BufferPool {
    /// Creates a pool holding at most `capacity` pages.
    ///
    /// Zero falls back to [`DEFAULT_CAPACITY`]; anything above
    /// [`MAX_CAPACITY`] is capped there.
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            capacity.min(MAX_CAPACITY)
        };
        Self {
            capacity,
            pages: LruCache::unbounded(),
            hit_count: 0,
            miss_count: 0,
        }
    }

    /// Returns the maximum number of resident pages.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of resident pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Returns true if no pages are resident.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Returns true if `id` is resident, without touching recency.
    pub fn contains(&self, id: PageId) -> bool {
        self.pages.contains(&id)
    }

    /// Fetches a page, loading it through the store on a miss.
    ///
    /// A hit moves the page to the front of the recency list. A miss
    /// asks the store for the node; `Ok(None)` from the store is a
    /// miss with no page to return.
    pub fn get_page(
        &mut self,
        id: PageId,
        store: &mut dyn NodeStore,
    ) -> Result<Option<Rc<RefCell<Node>>>> {
        if let Some(entry) = self.pages.get(&id) {
            self.hit_count += 1;
            return Ok(Some(Rc::clone(&entry.node)));
        }

        self.miss_count += 1;
        match store.load(id)? {
            Some(node) => {
                let node = Rc::new(RefCell::new(node));
                self.put_page(id, Rc::clone(&node), store)?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    /// Inserts a page at the front of the recency list.
    ///
    /// If `id` is already resident its node is replaced in place. At
    /// capacity, eviction runs first; if every resident page is pinned
    /// the insertion is skipped with a warning, per the capacity
    /// contract that callers pin at most `capacity - 1` pages.
    pub fn put_page(
        &mut self,
        id: PageId,
        node: Rc<RefCell<Node>>,
        store: &mut dyn NodeStore,
    ) -> Result<()> {
        if let Some(entry) = self.pages.get_mut(&id) {
            entry.node = node;
            return Ok(());
        }

        while self.pages.len() >= self.capacity {
            if !self.evict_one(store)? {
                warn!(
                    "buffer pool full with all {} pages pinned; page {} not cached",
                    self.capacity, id
                );
                return Ok(());
            }
        }

        self.pages.push(
            id,
            PoolEntry {
                node,
                dirty: false,
                pinned: false,
            },
        );
        Ok(())
    }

    /// Marks a resident page dirty and moves it to the recency front.
    pub fn mark_dirty(&mut self, id: PageId) {
        if let Some(entry) = self.pages.get_mut(&id) {
            entry.dirty = true;
            entry.node.borrow_mut().dirty = true;
        }
    }

    /// Pins a resident page, exempting it from eviction.
    pub fn pin(&mut self, id: PageId) {
        if let Some(entry) = self.pages.peek_mut(&id) {
            entry.pinned = true;
        }
    }

    /// Unpins a resident page.
    pub fn unpin(&mut self, id: PageId) {
        if let Some(entry) = self.pages.peek_mut(&id) {
            entry.pinned = false;
        }
    }

    /// Writes a dirty page back and clears its dirty bit.
    ///
    /// Returns true iff the page was written.
    pub fn flush_page(&mut self, id: PageId, store: &mut dyn NodeStore) -> Result<bool> {
        let Some(entry) = self.pages.peek_mut(&id) else {
            return Ok(false);
        };
        if !entry.dirty {
            return Ok(false);
        }
        store.store(&entry.node.borrow())?;
        entry.dirty = false;
        entry.node.borrow_mut().dirty = false;
        Ok(true)
    }

    /// Writes every dirty resident page back.
    ///
    /// Returns the number of pages flushed.
    pub fn flush_all(&mut self, store: &mut dyn NodeStore) -> Result<usize> {
        let dirty: Vec<PageId> = self
            .pages
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(id, _)| *id)
            .collect();

        let mut flushed = 0;
        for id in dirty {
            if self.flush_page(id, store)? {
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Drops a page from the pool.
    ///
    /// A pinned page is only dropped when `force` is set. A dirty page
    /// is flushed first unless forced, in which case its state is
    /// discarded. Returns true iff the page was resident and dropped.
    pub fn remove_page(
        &mut self,
        id: PageId,
        force: bool,
        store: &mut dyn NodeStore,
    ) -> Result<bool> {
        let Some(entry) = self.pages.peek(&id) else {
            return Ok(false);
        };
        if entry.pinned && !force {
            return Ok(false);
        }
        if entry.dirty && !force {
            self.flush_page(id, store)?;
        }
        self.pages.pop(&id);
        Ok(true)
    }

    /// Flushes all dirty pages, then drops everything.
    pub fn clear(&mut self, store: &mut dyn NodeStore) -> Result<()> {
        self.flush_all(store)?;
        self.pages.clear();
        Ok(())
    }

    /// Returns a snapshot of pool statistics.
    pub fn stats(&self) -> Stats {
        let mut dirty_pages = 0;
        let mut pinned_pages = 0;
        for (_, entry) in self.pages.iter() {
            if entry.dirty {
                dirty_pages += 1;
            }
            if entry.pinned {
                pinned_pages += 1;
            }
        }

        let total_access = self.hit_count + self.miss_count;
        let hit_ratio = if total_access > 0 {
            self.hit_count as f64 / total_access as f64
        } else {
            0.0
        };

        Stats {
            total_pages: self.pages.len(),
            dirty_pages,
            pinned_pages,
            max_size: self.capacity,
            hit_count: self.hit_count,
            miss_count: self.miss_count,
            hit_ratio,
        }
    }

    /// Evicts one page, walking from the LRU end toward the front.
    ///
    /// First pass takes the oldest unpinned clean page; second pass
    /// takes the oldest unpinned dirty page after writing it back.
    /// Returns false if every resident page is pinned.
    fn evict_one(&mut self, store: &mut dyn NodeStore) -> Result<bool> {
        let clean_victim = self
            .pages
            .iter()
            .rev()
            .find(|(_, entry)| !entry.pinned && !entry.dirty)
            .map(|(id, _)| *id);
        if let Some(id) = clean_victim {
            self.pages.pop(&id);
            return Ok(true);
        }

        let dirty_victim = self
            .pages
            .iter()
            .rev()
            .find(|(_, entry)| !entry.pinned && entry.dirty)
            .map(|(id, _)| *id);
        if let Some(id) = dirty_victim {
            self.flush_page(id, store)?;
            self.pages.pop(&id);
            return Ok(true);
        }

        Ok(false)
    }
}

/// Statistics about the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stats {
    /// Number of resident pages.
    pub total_pages: usize,
    /// Number of dirty resident pages.
    pub dirty_pages: usize,
    /// Number of pinned resident pages.
    pub pinned_pages: usize,
    /// Pool capacity.
    pub max_size: usize,
    /// Cache hits since creation.
    pub hit_count: u64,
    /// Cache misses since creation.
    pub miss_count: u64,
    /// Hits over total accesses; 0.0 before any access.
    pub hit_ratio: f64,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== BufferPool Status ===")?;
        writeln!(f, "pages:  {}/{}", self.total_pages, self.max_size)?;
        writeln!(f, "dirty:  {}", self.dirty_pages)?;
        writeln!(f, "pinned: {}", self.pinned_pages)?;
        writeln!(f, "hits:   {}", self.hit_count)?;
        writeln!(f, "misses: {}", self.miss_count)?;
        write!(f, "ratio:  {:.1}%", self.hit_ratio * 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryNodeStore;
    use vellum_common::page::KeyValue;

    fn new_node(id: i32) -> Rc<RefCell<Node>> {
        Rc::new(RefCell::new(Node::new(PageId(id), true)))
    }

    fn fill_pool(pool: &mut BufferPool, store: &mut MemoryNodeStore, count: i32) {
        for i in 0..count {
            pool.put_page(PageId(i), new_node(i), store).unwrap();
        }
    }

    #[test]
    fn test_pool_new_clamps_capacity() {
        assert_eq!(BufferPool::new(10).capacity(), 10);
        assert_eq!(BufferPool::new(0).capacity(), DEFAULT_CAPACITY);
        assert_eq!(BufferPool::new(50_000).capacity(), MAX_CAPACITY);
    }

    #[test]
    fn test_get_page_miss_loads_from_store() {
        let mut store = MemoryNodeStore::new();
        let mut node = Node::new(PageId(7), true);
        node.insert_leaf_entry(KeyValue::new("a", "r", "v"));
        store.store(&node).unwrap();

        let mut pool = BufferPool::new(10);
        let handle = pool.get_page(PageId(7), &mut store).unwrap().unwrap();
        assert_eq!(handle.borrow().entries[0].key(), "a");
        assert_eq!(pool.len(), 1);

        let stats = pool.stats();
        assert_eq!(stats.hit_count, 0);
        assert_eq!(stats.miss_count, 1);
    }

    #[test]
    fn test_get_page_hit_counts_and_shares_handle() {
        let mut store = MemoryNodeStore::new();
        let mut pool = BufferPool::new(10);
        pool.put_page(PageId(1), new_node(1), &mut store).unwrap();

        let first = pool.get_page(PageId(1), &mut store).unwrap().unwrap();
        let second = pool.get_page(PageId(1), &mut store).unwrap().unwrap();
        assert!(Rc::ptr_eq(&first, &second));

        let stats = pool.stats();
        assert_eq!(stats.hit_count, 2);
        assert_eq!(stats.miss_count, 0);
    }

    #[test]
    fn test_get_page_unknown_is_a_miss() {
        let mut store = MemoryNodeStore::new();
        let mut pool = BufferPool::new(10);

        assert!(pool.get_page(PageId(42), &mut store).unwrap().is_none());
        assert_eq!(pool.stats().miss_count, 1);
    }

    #[test]
    fn test_eviction_prefers_clean_lru_page() {
        let mut store = MemoryNodeStore::new();
        let mut pool = BufferPool::new(3);
        fill_pool(&mut pool, &mut store, 3);

        // Page 0 is the LRU entry; touch it so page 1 becomes LRU.
        pool.get_page(PageId(0), &mut store).unwrap();
        pool.put_page(PageId(3), new_node(3), &mut store).unwrap();

        assert_eq!(pool.len(), 3);
        assert!(pool.contains(PageId(0)));
        assert!(!pool.contains(PageId(1)));
        assert!(pool.contains(PageId(3)));
        // The clean victim was dropped without write-back.
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn test_eviction_skips_dirty_when_clean_exists() {
        let mut store = MemoryNodeStore::new();
        let mut pool = BufferPool::new(3);
        fill_pool(&mut pool, &mut store, 3);

        // Dirty page 0, then touch the others so it sits at the LRU
        // end; the oldest clean page should still be the victim.
        pool.mark_dirty(PageId(0));
        pool.get_page(PageId(1), &mut store).unwrap();
        pool.get_page(PageId(2), &mut store).unwrap();
        pool.put_page(PageId(3), new_node(3), &mut store).unwrap();

        assert!(pool.contains(PageId(0)));
        assert!(!pool.contains(PageId(1)));
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn test_eviction_flushes_dirty_when_no_clean_candidate() {
        let mut store = MemoryNodeStore::new();
        let mut pool = BufferPool::new(2);
        fill_pool(&mut pool, &mut store, 2);
        pool.mark_dirty(PageId(0));
        pool.mark_dirty(PageId(1));

        pool.put_page(PageId(2), new_node(2), &mut store).unwrap();

        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(PageId(0)));
        assert!(store.contains(PageId(0)));
        assert_eq!(store.write_count(), 1);
    }

    #[test]
    fn test_eviction_skips_pinned_pages() {
        let mut store = MemoryNodeStore::new();
        let mut pool = BufferPool::new(2);
        fill_pool(&mut pool, &mut store, 2);
        pool.pin(PageId(0));

        pool.put_page(PageId(2), new_node(2), &mut store).unwrap();

        assert!(pool.contains(PageId(0)));
        assert!(!pool.contains(PageId(1)));
        assert!(pool.contains(PageId(2)));
    }

    #[test]
    fn test_put_page_all_pinned_does_not_insert() {
        let mut store = MemoryNodeStore::new();
        let mut pool = BufferPool::new(2);
        fill_pool(&mut pool, &mut store, 2);
        pool.pin(PageId(0));
        pool.pin(PageId(1));

        pool.put_page(PageId(2), new_node(2), &mut store).unwrap();

        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(PageId(2)));
    }

    #[test]
    fn test_put_page_existing_replaces_node() {
        let mut store = MemoryNodeStore::new();
        let mut pool = BufferPool::new(2);
        pool.put_page(PageId(1), new_node(1), &mut store).unwrap();
        pool.mark_dirty(PageId(1));

        let replacement = new_node(1);
        replacement
            .borrow_mut()
            .insert_leaf_entry(KeyValue::new("x", "r", "v"));
        pool.put_page(PageId(1), Rc::clone(&replacement), &mut store)
            .unwrap();

        assert_eq!(pool.len(), 1);
        let handle = pool.get_page(PageId(1), &mut store).unwrap().unwrap();
        assert!(Rc::ptr_eq(&handle, &replacement));
        // The entry keeps its dirty bit across replacement.
        assert_eq!(pool.stats().dirty_pages, 1);
    }

    #[test]
    fn test_mark_dirty_sets_node_flag() {
        let mut store = MemoryNodeStore::new();
        let mut pool = BufferPool::new(2);
        let node = new_node(1);
        pool.put_page(PageId(1), Rc::clone(&node), &mut store)
            .unwrap();

        pool.mark_dirty(PageId(1));
        assert!(node.borrow().dirty);
        assert_eq!(pool.stats().dirty_pages, 1);
    }

    #[test]
    fn test_flush_page_clears_dirty_state() {
        let mut store = MemoryNodeStore::new();
        let mut pool = BufferPool::new(2);
        let node = new_node(1);
        pool.put_page(PageId(1), Rc::clone(&node), &mut store)
            .unwrap();
        pool.mark_dirty(PageId(1));

        assert!(pool.flush_page(PageId(1), &mut store).unwrap());
        assert!(store.contains(PageId(1)));
        assert!(!node.borrow().dirty);
        assert_eq!(pool.stats().dirty_pages, 0);

        // A second flush has nothing to write.
        assert!(!pool.flush_page(PageId(1), &mut store).unwrap());
    }

    #[test]
    fn test_flush_all_returns_count() {
        let mut store = MemoryNodeStore::new();
        let mut pool = BufferPool::new(10);
        fill_pool(&mut pool, &mut store, 5);
        pool.mark_dirty(PageId(1));
        pool.mark_dirty(PageId(3));

        assert_eq!(pool.flush_all(&mut store).unwrap(), 2);
        assert_eq!(pool.stats().dirty_pages, 0);
        assert_eq!(store.write_count(), 2);
    }

    #[test]
    fn test_remove_page_pinned_requires_force() {
        let mut store = MemoryNodeStore::new();
        let mut pool = BufferPool::new(2);
        pool.put_page(PageId(1), new_node(1), &mut store).unwrap();
        pool.pin(PageId(1));

        assert!(!pool.remove_page(PageId(1), false, &mut store).unwrap());
        assert!(pool.contains(PageId(1)));

        assert!(pool.remove_page(PageId(1), true, &mut store).unwrap());
        assert!(!pool.contains(PageId(1)));
    }

    #[test]
    fn test_remove_page_flushes_dirty_first() {
        let mut store = MemoryNodeStore::new();
        let mut pool = BufferPool::new(2);
        pool.put_page(PageId(1), new_node(1), &mut store).unwrap();
        pool.mark_dirty(PageId(1));

        assert!(pool.remove_page(PageId(1), false, &mut store).unwrap());
        assert!(store.contains(PageId(1)));
    }

    #[test]
    fn test_remove_page_forced_discards_dirty_state() {
        let mut store = MemoryNodeStore::new();
        let mut pool = BufferPool::new(2);
        pool.put_page(PageId(1), new_node(1), &mut store).unwrap();
        pool.mark_dirty(PageId(1));

        assert!(pool.remove_page(PageId(1), true, &mut store).unwrap());
        assert!(!store.contains(PageId(1)));
    }

    #[test]
    fn test_unpin_makes_page_evictable_again() {
        let mut store = MemoryNodeStore::new();
        let mut pool = BufferPool::new(2);
        fill_pool(&mut pool, &mut store, 2);
        pool.pin(PageId(0));
        pool.unpin(PageId(0));

        pool.put_page(PageId(2), new_node(2), &mut store).unwrap();
        assert!(!pool.contains(PageId(0)));
    }

    #[test]
    fn test_clear_flushes_then_empties() {
        let mut store = MemoryNodeStore::new();
        let mut pool = BufferPool::new(10);
        fill_pool(&mut pool, &mut store, 4);
        pool.mark_dirty(PageId(2));

        pool.clear(&mut store).unwrap();

        assert!(pool.is_empty());
        assert!(store.contains(PageId(2)));
    }

    #[test]
    fn test_resident_count_never_exceeds_capacity() {
        let mut store = MemoryNodeStore::new();
        let mut pool = BufferPool::new(20);

        for i in 0..500 {
            pool.put_page(PageId(i), new_node(i), &mut store).unwrap();
            pool.mark_dirty(PageId(i));
            assert!(pool.len() <= 20);
        }

        // Everything evicted along the way was written back.
        for i in 0..480 {
            assert!(store.contains(PageId(i)));
        }
    }

    #[test]
    fn test_stats_display() {
        let pool = BufferPool::new(5);
        let rendered = pool.stats().to_string();
        assert!(rendered.contains("BufferPool Status"));
        assert!(rendered.contains("pages:  0/5"));
    }
}
