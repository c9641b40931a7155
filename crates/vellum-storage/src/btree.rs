//! Disk-backed B+ tree index.
//!
//! The engine fetches every page through the buffer pool, which in turn
//! reads and writes through the pager. Separator convention: a key equal
//! to a separator lives at the leftmost leaf of the separator's right
//! subtree, so descent takes the right child on an exact separator match
//! and splits promote a copy of the right sibling's first key.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::rc::Rc;

use log::{error, warn};

use vellum_buffer::{BufferPool, Stats};
use vellum_common::config::StorageConfig;
use vellum_common::page::{KeyValue, Node, PageId, MAX_KEYS, MIN_KEYS};
use vellum_common::{Result, VellumError};

use crate::pager::Pager;

/// Shared handle to a pooled node, scoped to a single operation.
type NodeHandle = Rc<RefCell<Node>>;

/// Tree-level statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TreeStats {
    /// Levels from root to leaves, counting the leaf level.
    pub height: u32,
    /// Number of live pages in the tree.
    pub node_count: i32,
    /// Total node splits over the file's lifetime.
    pub split_count: i32,
    /// Total node merges over the file's lifetime.
    pub merge_count: i32,
    /// Stored records over total record capacity of live pages.
    pub fill_factor: f64,
    /// Pages written to disk since open.
    pub file_write_count: u64,
}

/// A disk-backed ordered index from string keys to a value and row id.
///
/// Single-threaded. Mutations become durable on eviction, on
/// [`BTreeIndex::flush_buffer`], and on [`BTreeIndex::close`]; dropping
/// the index closes it.
pub struct BTreeIndex {
    pager: Pager,
    pool: BufferPool,
}

impl BTreeIndex {
    /// Opens or creates an index file with the given pool capacity.
    pub fn create(path: impl AsRef<Path>, buffer_pool_pages: usize) -> Result<Self> {
        Self::with_config(
            path,
            StorageConfig {
                buffer_pool_pages,
                ..Default::default()
            },
        )
    }

    /// Opens or creates an index file with an explicit configuration.
    pub fn with_config(path: impl AsRef<Path>, config: StorageConfig) -> Result<Self> {
        let pager = Pager::open(path, config.fsync_enabled)?;
        let pool = BufferPool::new(config.clamped_pool_pages());
        Ok(Self { pager, pool })
    }

    /// Flushes all dirty pages and persists metadata.
    pub fn close(&mut self) -> Result<()> {
        self.pool.clear(&mut self.pager)?;
        self.pager.save_metadata()
    }

    /// Returns the current root page id; invalid while the tree is empty.
    pub fn root_page_id(&self) -> PageId {
        self.pager.metadata().root_page_id
    }

    /// Inserts or overwrites a record (upsert).
    ///
    /// Only the first element of `values` is stored; the record payload
    /// is a single value plus the row id. An existing key has its value
    /// and row id overwritten in place.
    pub fn insert(&mut self, key: &str, values: &[&str], row_id: &str) -> Result<()> {
        let value = values.first().copied().unwrap_or("");
        let kv = KeyValue::new(key, row_id, value);

        if !self.pager.metadata().root_page_id.is_valid() {
            let root = self.create_page(true)?;
            let root_id = {
                let mut node = root.borrow_mut();
                node.insert_leaf_entry(kv);
                node.page_id
            };
            self.pool.mark_dirty(root_id);
            self.pager.metadata_mut().root_page_id = root_id;
            self.pager.save_metadata()?;
            self.pool.unpin(root_id);
            return Ok(());
        }

        let key_bytes = KeyValue::clamp_key(key).to_vec();
        let Some(leaf) = self.find_leaf(&key_bytes)? else {
            return Err(VellumError::InvariantViolation(format!(
                "no leaf reachable for key {key:?}"
            )));
        };
        let leaf_id = leaf.borrow().page_id;
        self.pool.pin(leaf_id);
        let mut pinned = vec![leaf_id];

        let needs_split = {
            let mut node = leaf.borrow_mut();
            let pos = node.lower_bound(&key_bytes);
            if pos < node.entries.len() && node.entries[pos].key_bytes() == key_bytes {
                node.entries[pos] = kv;
                node.dirty = true;
                false
            } else {
                node.insert_leaf_entry(kv);
                node.is_full()
            }
        };
        self.pool.mark_dirty(leaf_id);

        let result = if needs_split {
            self.run_overflow(leaf, &mut pinned)
        } else {
            Ok(())
        };
        for id in pinned {
            self.pool.unpin(id);
        }
        result
    }

    /// Returns the value(s) stored under `key`.
    ///
    /// One inner vector per matching record; with unique keys the
    /// result is empty or single-element.
    pub fn get(&mut self, key: &str) -> Result<Vec<Vec<String>>> {
        let key_bytes = KeyValue::clamp_key(key).to_vec();
        let Some(leaf) = self.find_leaf(&key_bytes)? else {
            return Ok(Vec::new());
        };

        let node = leaf.borrow();
        let mut result = Vec::new();
        for entry in &node.entries {
            if entry.key_bytes() == key_bytes {
                result.push(vec![entry.value()]);
            }
        }
        Ok(result)
    }

    /// Removes the record stored under `key`.
    ///
    /// Returns `Ok(false)` iff the key is absent.
    pub fn remove(&mut self, key: &str) -> Result<bool> {
        let key_bytes = KeyValue::clamp_key(key).to_vec();
        let Some(leaf) = self.find_leaf(&key_bytes)? else {
            return Ok(false);
        };
        let leaf_id = leaf.borrow().page_id;

        let (removed, remaining) = {
            let mut node = leaf.borrow_mut();
            let pos = node.lower_bound(&key_bytes);
            if pos < node.entries.len() && node.entries[pos].key_bytes() == key_bytes {
                node.remove_entry(pos);
                (true, node.entries.len())
            } else {
                (false, node.entries.len())
            }
        };
        if !removed {
            return Ok(false);
        }
        self.pool.mark_dirty(leaf_id);

        if leaf_id == self.pager.metadata().root_page_id {
            if remaining == 0 {
                // The last key is gone: collapse to an empty tree.
                self.pager.metadata_mut().root_page_id = PageId::INVALID;
                self.pager.metadata_mut().page_count -= 1;
                self.pager.save_metadata()?;
                self.pool.remove_page(leaf_id, true, &mut self.pager)?;
            }
            return Ok(true);
        }
        if remaining >= MIN_KEYS {
            return Ok(true);
        }

        self.pool.pin(leaf_id);
        let mut pinned = vec![leaf_id];
        let result = self.run_underflow(leaf, &mut pinned);
        for id in pinned {
            self.pool.unpin(id);
        }
        result.map(|_| true)
    }

    /// Returns records with `start <= key <= end`, in key order.
    ///
    /// `None` bounds are open; the scan walks the leaf linked list.
    pub fn scan_range(
        &mut self,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<Vec<(String, String, String)>> {
        let start_key: Option<Vec<u8>> = start.map(|s| KeyValue::clamp_key(s).to_vec());
        let end_key: Option<Vec<u8>> = end.map(|s| KeyValue::clamp_key(s).to_vec());

        let first = match &start_key {
            Some(key) => self.find_leaf(key)?,
            None => self.leftmost_leaf()?,
        };
        let Some(mut leaf) = first else {
            return Ok(Vec::new());
        };

        let mut results = Vec::new();
        loop {
            let next_id = {
                let node = leaf.borrow();
                for entry in &node.entries {
                    if let Some(start) = &start_key {
                        if entry.key_bytes() < start.as_slice() {
                            continue;
                        }
                    }
                    if let Some(end) = &end_key {
                        if entry.key_bytes() > end.as_slice() {
                            return Ok(results);
                        }
                    }
                    results.push((entry.key(), entry.row_id(), entry.value()));
                }
                node.next_leaf_id
            };
            if !next_id.is_valid() {
                break;
            }
            leaf = match self.load_page(next_id)? {
                Some(node) => node,
                None => break,
            };
        }
        Ok(results)
    }

    /// Computes tree statistics; all zeros for an empty tree.
    pub fn get_stat(&mut self) -> Result<TreeStats> {
        let md = *self.pager.metadata();
        if !md.root_page_id.is_valid() {
            return Ok(TreeStats::default());
        }
        Ok(TreeStats {
            height: self.height()?,
            node_count: md.page_count,
            split_count: md.split_count,
            merge_count: md.merge_count,
            fill_factor: self.fill_factor()?,
            file_write_count: self.pager.file_write_count(),
        })
    }

    /// Returns buffer pool statistics.
    pub fn buffer_pool_stats(&self) -> Stats {
        self.pool.stats()
    }

    /// Flushes all dirty pages; returns the number written.
    pub fn flush_buffer(&mut self) -> Result<usize> {
        self.pool.flush_all(&mut self.pager)
    }

    /// Replaces the buffer pool with one of the given capacity.
    ///
    /// Dirty pages are flushed through the old pool first.
    pub fn set_buffer_pool_size(&mut self, pages: usize) -> Result<()> {
        self.pool.flush_all(&mut self.pager)?;
        self.pool = BufferPool::new(pages);
        Ok(())
    }

    /// Writes an indented dump of the tree to `out`.
    pub fn dump(&mut self, out: &mut dyn io::Write) -> Result<()> {
        let root_id = self.pager.metadata().root_page_id;
        if !root_id.is_valid() {
            writeln!(out, "Empty tree")?;
            return Ok(());
        }
        self.dump_node(root_id, 0, out)
    }

    /// Prints the tree to stdout.
    pub fn print_tree(&mut self) -> Result<()> {
        let mut out = io::stdout();
        self.dump(&mut out)
    }

    // ------------------------------------------------------------------
    // Page access
    // ------------------------------------------------------------------

    fn load_page(&mut self, id: PageId) -> Result<Option<NodeHandle>> {
        self.pool.get_page(id, &mut self.pager)
    }

    /// Allocates a page and registers it with the pool, pinned and dirty.
    fn create_page(&mut self, is_leaf: bool) -> Result<NodeHandle> {
        let id = self.pager.allocate_page()?;
        self.pager.metadata_mut().page_count += 1;
        let node = Rc::new(RefCell::new(Node::new(id, is_leaf)));
        self.pool.put_page(id, Rc::clone(&node), &mut self.pager)?;
        self.pool.mark_dirty(id);
        self.pool.pin(id);
        Ok(node)
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    /// Descends from the root to the leaf responsible for `key`.
    fn find_leaf(&mut self, key: &[u8]) -> Result<Option<NodeHandle>> {
        let root_id = self.pager.metadata().root_page_id;
        if !root_id.is_valid() {
            return Ok(None);
        }
        let Some(mut current) = self.load_page(root_id)? else {
            return Ok(None);
        };

        loop {
            let next_id = {
                let node = current.borrow();
                if node.is_leaf {
                    break;
                }
                let mut pos = node.lower_bound(key);
                if pos < node.entries.len() && node.entries[pos].key_bytes() == key {
                    // Exact separator match: the key lives in the right subtree.
                    pos += 1;
                }
                match node.children.get(pos) {
                    Some(&child) if child.is_valid() => child,
                    _ => return Ok(None),
                }
            };
            current = match self.load_page(next_id)? {
                Some(node) => node,
                None => return Ok(None),
            };
        }
        Ok(Some(current))
    }

    /// Descends leftmost children down to the first leaf.
    fn leftmost_leaf(&mut self) -> Result<Option<NodeHandle>> {
        let root_id = self.pager.metadata().root_page_id;
        if !root_id.is_valid() {
            return Ok(None);
        }
        let Some(mut current) = self.load_page(root_id)? else {
            return Ok(None);
        };

        loop {
            let next_id = {
                let node = current.borrow();
                if node.is_leaf {
                    break;
                }
                match node.children.first() {
                    Some(&child) if child.is_valid() => child,
                    _ => return Ok(None),
                }
            };
            current = match self.load_page(next_id)? {
                Some(node) => node,
                None => return Ok(None),
            };
        }
        Ok(Some(current))
    }

    // ------------------------------------------------------------------
    // Overflow (split) handling
    // ------------------------------------------------------------------

    /// Splits full nodes, climbing until no node is over capacity.
    ///
    /// A work list stands in for recursion since a cascade can reach
    /// the root. Every node touched stays pinned via `pinned`; the
    /// caller releases the set when the operation completes.
    fn run_overflow(&mut self, node: NodeHandle, pinned: &mut Vec<PageId>) -> Result<()> {
        let mut work = vec![node];

        while let Some(current) = work.pop() {
            if !current.borrow().is_full() {
                continue;
            }
            let current_id = current.borrow().page_id;
            let is_leaf = current.borrow().is_leaf;

            let sibling = self.create_page(is_leaf)?;
            let sibling_id = sibling.borrow().page_id;
            pinned.push(sibling_id);

            let promoted = Self::split_node(&mut current.borrow_mut(), &mut sibling.borrow_mut());
            self.pager.metadata_mut().split_count += 1;
            self.pool.mark_dirty(current_id);
            self.pool.mark_dirty(sibling_id);

            // Children handed to the sibling must point back at it.
            if !is_leaf {
                let moved: Vec<PageId> = sibling.borrow().children.clone();
                self.reparent(&moved, sibling_id)?;
            }

            if current_id == self.pager.metadata().root_page_id {
                let new_root = self.create_page(false)?;
                let new_root_id = new_root.borrow().page_id;
                pinned.push(new_root_id);
                {
                    let mut root = new_root.borrow_mut();
                    root.entries.push(promoted);
                    root.children.push(current_id);
                    root.children.push(sibling_id);
                }
                current.borrow_mut().parent_id = new_root_id;
                sibling.borrow_mut().parent_id = new_root_id;
                self.pool.mark_dirty(new_root_id);
                self.pool.mark_dirty(current_id);
                self.pool.mark_dirty(sibling_id);

                self.pager.metadata_mut().root_page_id = new_root_id;
                self.pager.save_metadata()?;
            } else {
                let parent_id = current.borrow().parent_id;
                let Some(parent) = self.load_page(parent_id)? else {
                    return Err(VellumError::InvariantViolation(format!(
                        "page {current_id} has unreachable parent {parent_id}"
                    )));
                };
                self.pool.pin(parent_id);
                pinned.push(parent_id);

                sibling.borrow_mut().parent_id = parent_id;
                self.pool.mark_dirty(sibling_id);
                parent.borrow_mut().insert_internal_entry(promoted, sibling_id);
                self.pool.mark_dirty(parent_id);

                if parent.borrow().is_full() {
                    work.push(parent);
                }
            }
        }
        Ok(())
    }

    /// Moves the upper half of `node` into the empty `sibling` and
    /// returns the key to promote into the parent.
    ///
    /// Leaves keep the promoted key: it is a copy of the sibling's
    /// first record. Internal nodes surrender it: the median moves up.
    fn split_node(node: &mut Node, sibling: &mut Node) -> KeyValue {
        let total = node.entries.len();
        let promoted;

        if node.is_leaf {
            let mid = (total + 1) / 2;
            sibling.entries = node.entries.split_off(mid);
            promoted = sibling.entries[0];

            // Splice the sibling into the leaf chain.
            sibling.next_leaf_id = node.next_leaf_id;
            node.next_leaf_id = sibling.page_id;
        } else {
            let mid = total / 2;
            let mut upper = node.entries.split_off(mid);
            promoted = upper.remove(0);
            sibling.entries = upper;
            sibling.children = node.children.split_off(mid + 1);
        }

        node.dirty = true;
        sibling.dirty = true;
        promoted
    }

    // ------------------------------------------------------------------
    // Underflow (redistribute / merge) handling
    // ------------------------------------------------------------------

    /// Restores minimum occupancy, climbing as merges shrink parents.
    fn run_underflow(&mut self, node: NodeHandle, pinned: &mut Vec<PageId>) -> Result<()> {
        let mut current = node;

        loop {
            let current_id = current.borrow().page_id;

            if current_id == self.pager.metadata().root_page_id {
                self.collapse_root(&current)?;
                return Ok(());
            }
            if current.borrow().entries.len() >= MIN_KEYS {
                return Ok(());
            }

            let parent_id = current.borrow().parent_id;
            let Some(parent) = self.load_page(parent_id)? else {
                return Err(VellumError::InvariantViolation(format!(
                    "page {current_id} has unreachable parent {parent_id}"
                )));
            };
            self.pool.pin(parent_id);
            pinned.push(parent_id);

            let Some(node_index) = parent
                .borrow()
                .children
                .iter()
                .position(|&c| c == current_id)
            else {
                return Err(VellumError::InvariantViolation(format!(
                    "parent {parent_id} does not list child {current_id}"
                )));
            };
            let child_count = parent.borrow().children.len();

            // Borrow from a sibling that can spare a key, left first.
            if node_index > 0 {
                let left_id = parent.borrow().children[node_index - 1];
                if let Some(left) = self.load_page(left_id)? {
                    if left.borrow().entries.len() > MIN_KEYS {
                        self.pool.pin(left_id);
                        pinned.push(left_id);
                        self.redistribute_from_left(&current, &left, &parent, node_index - 1)?;
                        return Ok(());
                    }
                }
            }
            if node_index + 1 < child_count {
                let right_id = parent.borrow().children[node_index + 1];
                if let Some(right) = self.load_page(right_id)? {
                    if right.borrow().entries.len() > MIN_KEYS {
                        self.pool.pin(right_id);
                        pinned.push(right_id);
                        self.redistribute_from_right(&current, &right, &parent, node_index)?;
                        return Ok(());
                    }
                }
            }

            // No sibling can spare a key: merge, preferring the left.
            // An internal merge also pulls the separator down, and the
            // result must still fit a page image with one child pointer
            // per key plus one; when it would not, shift a key through
            // the parent instead of merging.
            let is_leaf = current.borrow().is_leaf;
            let merge_cap = if is_leaf { MAX_KEYS } else { MAX_KEYS - 1 };
            if node_index > 0 {
                let left_id = parent.borrow().children[node_index - 1];
                let Some(left) = self.load_page(left_id)? else {
                    return Err(VellumError::InvariantViolation(format!(
                        "parent {parent_id} lists unreachable child {left_id}"
                    )));
                };
                self.pool.pin(left_id);
                pinned.push(left_id);
                let combined =
                    left.borrow().entries.len() + current.borrow().entries.len() + usize::from(!is_leaf);
                if combined > merge_cap {
                    self.redistribute_from_left(&current, &left, &parent, node_index - 1)?;
                    return Ok(());
                }
                self.merge_nodes(&left, &current, &parent, node_index - 1)?;
            } else if node_index + 1 < child_count {
                let right_id = parent.borrow().children[node_index + 1];
                let Some(right) = self.load_page(right_id)? else {
                    return Err(VellumError::InvariantViolation(format!(
                        "parent {parent_id} lists unreachable child {right_id}"
                    )));
                };
                self.pool.pin(right_id);
                pinned.push(right_id);
                let combined =
                    current.borrow().entries.len() + right.borrow().entries.len() + usize::from(!is_leaf);
                if combined > merge_cap {
                    self.redistribute_from_right(&current, &right, &parent, node_index)?;
                    return Ok(());
                }
                self.merge_nodes(&current, &right, &parent, node_index)?;
            } else {
                warn!("page {current_id} underfull with no siblings under parent {parent_id}");
                return Ok(());
            }

            // The parent lost a separator; it may now be underfull too.
            current = parent;
        }
    }

    /// Shrinks the root where the structure allows it.
    ///
    /// An internal root left with zero keys promotes its sole child;
    /// a root leaf may hold any count down to zero (the last removal
    /// is handled in `remove` by emptying the tree).
    fn collapse_root(&mut self, root: &NodeHandle) -> Result<()> {
        let promote = {
            let node = root.borrow();
            if !node.is_leaf
                && node.entries.is_empty()
                && node.children.first().is_some_and(|c| c.is_valid())
            {
                Some((node.page_id, node.children[0]))
            } else {
                None
            }
        };
        let Some((old_root_id, child_id)) = promote else {
            return Ok(());
        };

        self.pager.metadata_mut().root_page_id = child_id;
        if let Some(child) = self.load_page(child_id)? {
            child.borrow_mut().parent_id = PageId::INVALID;
            self.pool.mark_dirty(child_id);
        }
        self.pager.metadata_mut().page_count -= 1;
        self.pager.save_metadata()?;
        self.pool.remove_page(old_root_id, true, &mut self.pager)?;
        Ok(())
    }

    /// Moves one key from a richer left sibling into `node`.
    fn redistribute_from_left(
        &mut self,
        node: &NodeHandle,
        left: &NodeHandle,
        parent: &NodeHandle,
        parent_key_index: usize,
    ) -> Result<()> {
        let moved_child = {
            let mut n = node.borrow_mut();
            let mut l = left.borrow_mut();
            let mut p = parent.borrow_mut();

            if n.is_leaf {
                let kv = l.entries.pop().ok_or_else(|| {
                    VellumError::InvariantViolation(format!("left sibling of {} is empty", n.page_id))
                })?;
                n.entries.insert(0, kv);
                // The separator tracks the right child's first key.
                p.entries[parent_key_index] = n.entries[0];
                None
            } else {
                let separator = p.entries[parent_key_index];
                n.entries.insert(0, separator);
                let up = l.entries.pop().ok_or_else(|| {
                    VellumError::InvariantViolation(format!("left sibling of {} is empty", n.page_id))
                })?;
                p.entries[parent_key_index] = up;
                let child = l.children.pop().ok_or_else(|| {
                    VellumError::InvariantViolation(format!(
                        "left sibling of {} has no children",
                        n.page_id
                    ))
                })?;
                n.children.insert(0, child);
                Some(child)
            }
        };

        let node_id = node.borrow().page_id;
        if let Some(child_id) = moved_child {
            self.reparent(&[child_id], node_id)?;
        }
        let left_id = left.borrow().page_id;
        let parent_id = parent.borrow().page_id;
        self.pool.mark_dirty(node_id);
        self.pool.mark_dirty(left_id);
        self.pool.mark_dirty(parent_id);
        Ok(())
    }

    /// Moves one key from a richer right sibling into `node`.
    fn redistribute_from_right(
        &mut self,
        node: &NodeHandle,
        right: &NodeHandle,
        parent: &NodeHandle,
        parent_key_index: usize,
    ) -> Result<()> {
        let moved_child = {
            let mut n = node.borrow_mut();
            let mut r = right.borrow_mut();
            let mut p = parent.borrow_mut();

            if n.is_leaf {
                if r.entries.is_empty() {
                    return Err(VellumError::InvariantViolation(format!(
                        "right sibling of {} is empty",
                        n.page_id
                    )));
                }
                let kv = r.entries.remove(0);
                n.entries.push(kv);
                p.entries[parent_key_index] = r.entries[0];
                None
            } else {
                let separator = p.entries[parent_key_index];
                n.entries.push(separator);
                if r.entries.is_empty() {
                    return Err(VellumError::InvariantViolation(format!(
                        "right sibling of {} is empty",
                        n.page_id
                    )));
                }
                p.entries[parent_key_index] = r.entries.remove(0);
                if r.children.is_empty() {
                    return Err(VellumError::InvariantViolation(format!(
                        "right sibling of {} has no children",
                        n.page_id
                    )));
                }
                let child = r.children.remove(0);
                n.children.push(child);
                Some(child)
            }
        };

        let node_id = node.borrow().page_id;
        if let Some(child_id) = moved_child {
            self.reparent(&[child_id], node_id)?;
        }
        let right_id = right.borrow().page_id;
        let parent_id = parent.borrow().page_id;
        self.pool.mark_dirty(node_id);
        self.pool.mark_dirty(right_id);
        self.pool.mark_dirty(parent_id);
        Ok(())
    }

    /// Folds `right` into `left` and drops it from the parent.
    ///
    /// `parent_key_index` names the separator between the two; for an
    /// internal merge it is pulled down into `left`. The right page is
    /// abandoned: its id disappears from the parent and its file slot
    /// is never referenced again.
    fn merge_nodes(
        &mut self,
        left: &NodeHandle,
        right: &NodeHandle,
        parent: &NodeHandle,
        parent_key_index: usize,
    ) -> Result<()> {
        let moved_children = {
            let mut l = left.borrow_mut();
            let mut r = right.borrow_mut();
            let mut p = parent.borrow_mut();

            let moved = if l.is_leaf {
                l.entries.append(&mut r.entries);
                l.next_leaf_id = r.next_leaf_id;
                Vec::new()
            } else {
                l.entries.push(p.entries[parent_key_index]);
                l.entries.append(&mut r.entries);
                let moved = r.children.clone();
                l.children.append(&mut r.children);
                moved
            };

            // Drops the separator and the pointer to the right node.
            p.remove_entry(parent_key_index);
            l.dirty = true;
            moved
        };

        let left_id = left.borrow().page_id;
        let parent_id = parent.borrow().page_id;
        self.reparent(&moved_children, left_id)?;
        self.pool.mark_dirty(left_id);
        self.pool.mark_dirty(parent_id);

        let right_id = right.borrow().page_id;
        self.pool.remove_page(right_id, true, &mut self.pager)?;
        self.pager.metadata_mut().page_count -= 1;
        self.pager.metadata_mut().merge_count += 1;
        Ok(())
    }

    /// Points each listed child's `parent_id` at `new_parent`.
    fn reparent(&mut self, children: &[PageId], new_parent: PageId) -> Result<()> {
        for &child_id in children {
            if !child_id.is_valid() {
                continue;
            }
            if let Some(child) = self.load_page(child_id)? {
                child.borrow_mut().parent_id = new_parent;
                self.pool.mark_dirty(child_id);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statistics and debugging
    // ------------------------------------------------------------------

    /// Walks the leftmost spine; leaf-only trees have height 1.
    fn height(&mut self) -> Result<u32> {
        let root_id = self.pager.metadata().root_page_id;
        if !root_id.is_valid() {
            return Ok(0);
        }
        let Some(mut current) = self.load_page(root_id)? else {
            return Ok(0);
        };

        let mut height = 1;
        loop {
            let next_id = {
                let node = current.borrow();
                if node.is_leaf {
                    break;
                }
                match node.children.first() {
                    Some(&child) if child.is_valid() => child,
                    _ => break,
                }
            };
            height += 1;
            current = match self.load_page(next_id)? {
                Some(node) => node,
                None => break,
            };
        }
        Ok(height)
    }

    /// Breadth-first ratio of stored records to record capacity.
    fn fill_factor(&mut self) -> Result<f64> {
        let root_id = self.pager.metadata().root_page_id;
        if !root_id.is_valid() || self.pager.metadata().page_count == 0 {
            return Ok(0.0);
        }

        let mut total_keys = 0usize;
        let mut total_capacity = 0usize;
        let mut queue = VecDeque::from([root_id]);

        while let Some(id) = queue.pop_front() {
            let Some(handle) = self.load_page(id)? else {
                continue;
            };
            let node = handle.borrow();
            total_keys += node.entries.len();
            total_capacity += MAX_KEYS;
            if !node.is_leaf {
                for &child in &node.children {
                    if child.is_valid() {
                        queue.push_back(child);
                    }
                }
            }
        }

        if total_capacity == 0 {
            return Ok(0.0);
        }
        Ok(total_keys as f64 / total_capacity as f64)
    }

    fn dump_node(&mut self, id: PageId, level: usize, out: &mut dyn io::Write) -> Result<()> {
        let Some(handle) = self.load_page(id)? else {
            return Ok(());
        };

        let (line, children) = {
            let node = handle.borrow();
            let keys: Vec<String> = node.entries.iter().map(|e| e.key()).collect();
            let line = format!(
                "{}Page {} ({}, keys: {}): {}",
                "  ".repeat(level),
                node.page_id,
                if node.is_leaf { "Leaf" } else { "Internal" },
                node.key_count(),
                keys.join(" "),
            );
            let children = if node.is_leaf {
                Vec::new()
            } else {
                node.children.clone()
            };
            (line, children)
        };
        writeln!(out, "{line}")?;

        for child in children {
            if child.is_valid() {
                self.dump_node(child, level + 1, out)?;
            }
        }
        Ok(())
    }
}

impl Drop for BTreeIndex {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("index close failed: {e}");
        }
    }
}
