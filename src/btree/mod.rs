//! Persistent B+Tree index I: 64-bit key → blob-file offset, stored as fixed-size
//! nodes in an equi-record file. Order `N` is fixed at create time and implied by the
//! node record length; it must be passed identically on every reopen
//! (`crate::config::StoreConfig` carries it for exactly that reason).
//!
//! Descent, split-on-the-way-down insertion, and borrow/merge removal all route node
//! reads and writes through `crate::cache::Cache`, which registers every node
//! mutation as modified -- callers of `insert`/`remove`/`get` never touch the
//! equi-record file directly.

mod node;

use std::path::Path;

use crate::cache::Cache;
use crate::equi::{CustomFieldId, EquiFile};
use crate::error::{Result, StoreError};
pub use node::{Node, NodeCodec};

pub struct BTreeIndex {
    e: EquiFile,
    codec: NodeCodec,
    cache: Cache<Node>,
    root: u64,
    size: u64,
    first_leaf_field: CustomFieldId,
    last_leaf_field: CustomFieldId,
    size_field: CustomFieldId,
}

impl BTreeIndex {
    pub fn open(
        path: impl AsRef<Path>,
        order: u16,
        cache_capacity: usize,
        flush_delay: u32,
    ) -> Result<Self> {
        let codec = NodeCodec::new(order);
        let mut e = EquiFile::open(path, codec.record_bytes())?;
        let first_leaf_field = e.register_custom_field("first_leaf", 0)?;
        let last_leaf_field = e.register_custom_field("last_leaf", 0)?;
        let size_field = e.register_custom_field("btree_size", 0)?;
        let root = e.first_entry();
        let size = e.get_custom_field(size_field)?;
        Ok(BTreeIndex {
            e,
            codec,
            cache: Cache::new(cache_capacity, flush_delay),
            root,
            size,
            first_leaf_field,
            last_leaf_field,
            size_field,
        })
    }

    pub fn close(mut self) -> Result<()> {
        self.sync()?;
        self.e.close()
    }

    pub fn erase(mut self) -> Result<()> {
        self.cache.clear();
        self.e.erase()
    }

    pub fn sync(&mut self) -> Result<()> {
        self.flush_cache(true)?;
        self.e.sync()
    }

    pub fn clear(&mut self) -> Result<()> {
        self.cache.clear();
        self.e.clear()?;
        self.root = 0;
        self.size = 0;
        Ok(())
    }

    pub fn entries_count(&self) -> u64 {
        self.size
    }

    // -- node access -----------------------------------------------------------

    fn read_node(&mut self, addr: u64) -> Result<Node> {
        if addr == 0 {
            return Err(StoreError::InvalidAddress(0));
        }
        let codec = self.codec;
        let e = &mut self.e;
        self.cache.get(addr, || {
            let buf = e.retrieve(addr)?;
            codec.decode(&buf)
        })
    }

    fn write_node(&mut self, addr: u64, node: Node) -> Result<()> {
        self.cache.insert_modified(addr, node);
        self.flush_cache(false)
    }

    fn flush_cache(&mut self, force: bool) -> Result<()> {
        let codec = self.codec;
        let e = &mut self.e;
        self.cache.flush(force, |addr, node| e.store(addr, &codec.encode(node)))
    }

    fn new_node_addr(&mut self, node: &Node) -> Result<u64> {
        let addr = self.e.allocate_slot()?;
        self.e.store(addr, &self.codec.encode(node))?;
        self.cache.insert_unmodified(addr, node.clone());
        Ok(addr)
    }

    fn free_node(&mut self, addr: u64) -> Result<()> {
        self.cache.delete(addr);
        self.e.delete(addr)
    }

    fn set_parent(&mut self, addr: u64, parent: u64) -> Result<()> {
        let mut node = self.read_node(addr)?;
        node.parent = parent;
        self.write_node(addr, node)
    }

    fn set_first_leaf_addr(&mut self, addr: u64) -> Result<()> {
        self.e.set_custom_field(self.first_leaf_field, addr)
    }

    fn set_last_leaf_addr(&mut self, addr: u64) -> Result<()> {
        self.e.set_custom_field(self.last_leaf_field, addr)
    }

    pub fn first_leaf_addr(&mut self) -> Result<u64> {
        self.e.get_custom_field(self.first_leaf_field)
    }

    pub fn last_leaf_addr(&mut self) -> Result<u64> {
        self.e.get_custom_field(self.last_leaf_field)
    }

    fn set_size(&mut self, size: u64) -> Result<()> {
        self.size = size;
        self.e.set_custom_field(self.size_field, size)
    }

    // -- lookup ------------------------------------------------------------

    fn find_leaf(&mut self, key: u64) -> Result<u64> {
        let mut addr = self.root;
        while addr != 0 {
            let node = self.read_node(addr)?;
            if node.is_leaf {
                return Ok(addr);
            }
            let idx = node.keys.partition_point(|&k| k <= key);
            addr = node.ptrs[idx];
        }
        Ok(0)
    }

    pub fn get(&mut self, key: u64) -> Result<Option<u64>> {
        let leaf = self.find_leaf(key)?;
        if leaf == 0 {
            return Ok(None);
        }
        let node = self.read_node(leaf)?;
        Ok(node
            .keys
            .binary_search(&key)
            .ok()
            .map(|idx| node.ptrs[idx]))
    }

    /// Exact match if present; else the first entry whose key is `>= key +
    /// min_miss_increment`, scanning forward along the leaf chain.
    pub fn get_best_match(
        &mut self,
        key: u64,
        min_miss_increment: u64,
    ) -> Result<Option<(u64, u64)>> {
        let mut addr = self.find_leaf(key)?;
        if addr == 0 {
            return Ok(None);
        }
        let threshold = key.saturating_add(min_miss_increment);
        loop {
            let node = self.read_node(addr)?;
            if let Ok(idx) = node.keys.binary_search(&key) {
                return Ok(Some((node.keys[idx], node.ptrs[idx])));
            }
            if let Some(idx) = node.keys.iter().position(|&k| k >= threshold) {
                return Ok(Some((node.keys[idx], node.ptrs[idx])));
            }
            if node.next == 0 {
                return Ok(None);
            }
            addr = node.next;
        }
    }

    /// All (key, offset) pairs in ascending key order, following the leaf chain.
    /// Collected eagerly rather than returned as a lazy iterator, since every node
    /// fetch needs `&mut self` (the cache is not `Sync`/re-entrant).
    pub fn each(&mut self) -> Result<Vec<(u64, u64)>> {
        let mut out = Vec::with_capacity(self.size as usize);
        let mut addr = self.first_leaf_addr()?;
        while addr != 0 {
            let node = self.read_node(addr)?;
            for (k, v) in node.keys.iter().zip(node.ptrs.iter()) {
                out.push((*k, *v));
            }
            addr = node.next;
        }
        Ok(out)
    }

    // -- insert --------------------------------------------------------------

    /// Returns `true` if this inserted a new key, `false` if it overwrote an existing
    /// one (only the former increments `entries_count`).
    pub fn insert(&mut self, key: u64, offset: u64) -> Result<bool> {
        if self.root == 0 {
            let mut leaf = Node::new_leaf(0);
            leaf.keys.push(key);
            leaf.ptrs.push(offset);
            let addr = self.new_node_addr(&leaf)?;
            self.root = addr;
            self.e.set_first_entry(addr)?;
            self.set_first_leaf_addr(addr)?;
            self.set_last_leaf_addr(addr)?;
            self.set_size(1)?;
            return Ok(true);
        }

        if self.node_is_full(self.root)? {
            self.split_root()?;
        }
        let inserted = self.insert_non_full(self.root, key, offset)?;
        if inserted {
            let size = self.size;
            self.set_size(size + 1)?;
        }
        Ok(inserted)
    }

    fn node_is_full(&mut self, addr: u64) -> Result<bool> {
        Ok(self.read_node(addr)?.keys.len() >= self.codec.max_keys())
    }

    fn split_root(&mut self) -> Result<()> {
        let old_root = self.root;
        let (median_key, new_addr) = self.split_child(old_root)?;
        let mut new_root = Node::new_branch(0);
        new_root.keys.push(median_key);
        new_root.ptrs.push(old_root);
        new_root.ptrs.push(new_addr);
        let new_root_addr = self.new_node_addr(&new_root)?;
        self.set_parent(old_root, new_root_addr)?;
        self.set_parent(new_addr, new_root_addr)?;
        self.root = new_root_addr;
        self.e.set_first_entry(new_root_addr)
    }

    /// Split a full node in place: `addr` keeps the left half, a new sibling holds the
    /// right half. Returns `(separator_key, new_sibling_addr)`.
    fn split_child(&mut self, addr: u64) -> Result<(u64, u64)> {
        let mut node = self.read_node(addr)?;
        let mid = node.keys.len() / 2;
        if node.is_leaf {
            let median_key = node.keys[mid];
            let right_keys = node.keys.split_off(mid);
            let right_ptrs = node.ptrs.split_off(mid);
            let mut right = Node::new_leaf(node.parent);
            right.keys = right_keys;
            right.ptrs = right_ptrs;
            right.prev = addr;
            right.next = node.next;
            let right_addr = self.new_node_addr(&right)?;
            if right.next != 0 {
                let mut nxt = self.read_node(right.next)?;
                nxt.prev = right_addr;
                self.write_node(right.next, nxt)?;
            } else {
                self.set_last_leaf_addr(right_addr)?;
            }
            node.next = right_addr;
            self.write_node(addr, node)?;
            Ok((median_key, right_addr))
        } else {
            let median_key = node.keys[mid];
            let right_keys = node.keys.split_off(mid + 1);
            let right_ptrs = node.ptrs.split_off(mid + 1);
            node.keys.truncate(mid);
            let mut right = Node::new_branch(node.parent);
            right.keys = right_keys;
            right.ptrs = right_ptrs;
            let right_addr = self.new_node_addr(&right)?;
            let children = right.ptrs.clone();
            self.write_node(addr, node)?;
            for child in children {
                self.set_parent(child, right_addr)?;
            }
            Ok((median_key, right_addr))
        }
    }

    fn insert_non_full(&mut self, addr: u64, key: u64, offset: u64) -> Result<bool> {
        let mut node = self.read_node(addr)?;
        if node.is_leaf {
            match node.keys.binary_search(&key) {
                Ok(idx) => {
                    node.ptrs[idx] = offset;
                    self.write_node(addr, node)?;
                    Ok(false)
                }
                Err(idx) => {
                    node.keys.insert(idx, key);
                    node.ptrs.insert(idx, offset);
                    self.write_node(addr, node)?;
                    Ok(true)
                }
            }
        } else {
            let idx = node.keys.partition_point(|&k| k <= key);
            let mut child = node.ptrs[idx];
            if self.node_is_full(child)? {
                let (median, new_addr) = self.split_child(child)?;
                node.keys.insert(idx, median);
                node.ptrs.insert(idx + 1, new_addr);
                self.set_parent(new_addr, addr)?;
                self.write_node(addr, node)?;
                if key >= median {
                    child = new_addr;
                }
            }
            self.insert_non_full(child, key, offset)
        }
    }

    // -- remove --------------------------------------------------------------

    pub fn remove(&mut self, key: u64) -> Result<Option<u64>> {
        let leaf = self.find_leaf(key)?;
        if leaf == 0 {
            return Ok(None);
        }
        let mut node = self.read_node(leaf)?;
        let idx = match node.keys.binary_search(&key) {
            Ok(i) => i,
            Err(_) => return Ok(None),
        };
        let value = node.ptrs[idx];
        node.keys.remove(idx);
        node.ptrs.remove(idx);
        self.write_node(leaf, node)?;
        let size = self.size;
        self.set_size(size - 1)?;
        self.rebalance_from(leaf)?;
        Ok(Some(value))
    }

    fn rebalance_from(&mut self, mut addr: u64) -> Result<()> {
        loop {
            if addr == self.root {
                return self.collapse_root_if_needed();
            }
            let node = self.read_node(addr)?;
            if node.keys.len() >= self.codec.min_keys() {
                return Ok(());
            }
            let parent_addr = node.parent;
            let parent = self.read_node(parent_addr)?;
            let my_idx = parent
                .ptrs
                .iter()
                .position(|&p| p == addr)
                .ok_or_else(|| StoreError::invariant("node missing from its parent's child list"))?;

            if my_idx > 0 {
                let left_addr = parent.ptrs[my_idx - 1];
                let left = self.read_node(left_addr)?;
                if left.keys.len() > self.codec.min_keys() {
                    self.borrow_from_left(addr, left_addr, parent_addr, my_idx)?;
                    return Ok(());
                }
            }
            if my_idx + 1 < parent.ptrs.len() {
                let right_addr = parent.ptrs[my_idx + 1];
                let right = self.read_node(right_addr)?;
                if right.keys.len() > self.codec.min_keys() {
                    self.borrow_from_right(addr, right_addr, parent_addr, my_idx)?;
                    return Ok(());
                }
            }

            if my_idx > 0 {
                let left_addr = parent.ptrs[my_idx - 1];
                self.merge_nodes(left_addr, addr, parent_addr, my_idx - 1)?;
            } else {
                let right_addr = parent.ptrs[my_idx + 1];
                self.merge_nodes(addr, right_addr, parent_addr, my_idx)?;
            }
            addr = parent_addr;
        }
    }

    fn borrow_from_left(
        &mut self,
        addr: u64,
        left_addr: u64,
        parent_addr: u64,
        my_idx: usize,
    ) -> Result<()> {
        let mut node = self.read_node(addr)?;
        let mut left = self.read_node(left_addr)?;
        let mut parent = self.read_node(parent_addr)?;
        if node.is_leaf {
            let k = left.keys.pop().expect("left sibling has spare keys");
            let v = left.ptrs.pop().expect("left sibling has spare values");
            node.keys.insert(0, k);
            node.ptrs.insert(0, v);
            parent.keys[my_idx - 1] = node.keys[0];
        } else {
            let borrowed_key = left.keys.pop().expect("left sibling has spare keys");
            let borrowed_child = left.ptrs.pop().expect("left sibling has spare children");
            node.keys.insert(0, parent.keys[my_idx - 1]);
            node.ptrs.insert(0, borrowed_child);
            parent.keys[my_idx - 1] = borrowed_key;
            self.set_parent(borrowed_child, addr)?;
        }
        self.write_node(left_addr, left)?;
        self.write_node(addr, node)?;
        self.write_node(parent_addr, parent)
    }

    fn borrow_from_right(
        &mut self,
        addr: u64,
        right_addr: u64,
        parent_addr: u64,
        my_idx: usize,
    ) -> Result<()> {
        let mut node = self.read_node(addr)?;
        let mut right = self.read_node(right_addr)?;
        let mut parent = self.read_node(parent_addr)?;
        if node.is_leaf {
            let k = right.keys.remove(0);
            let v = right.ptrs.remove(0);
            node.keys.push(k);
            node.ptrs.push(v);
            parent.keys[my_idx] = right.keys[0];
        } else {
            let borrowed_key = right.keys.remove(0);
            let borrowed_child = right.ptrs.remove(0);
            node.keys.push(parent.keys[my_idx]);
            node.ptrs.push(borrowed_child);
            parent.keys[my_idx] = borrowed_key;
            self.set_parent(borrowed_child, addr)?;
        }
        self.write_node(right_addr, right)?;
        self.write_node(addr, node)?;
        self.write_node(parent_addr, parent)
    }

    fn merge_nodes(
        &mut self,
        left_addr: u64,
        right_addr: u64,
        parent_addr: u64,
        sep_idx: usize,
    ) -> Result<()> {
        let mut left = self.read_node(left_addr)?;
        let right = self.read_node(right_addr)?;
        let mut parent = self.read_node(parent_addr)?;
        if left.is_leaf {
            left.keys.extend(right.keys);
            left.ptrs.extend(right.ptrs);
            left.next = right.next;
            if right.next != 0 {
                let mut nxt = self.read_node(right.next)?;
                nxt.prev = left_addr;
                self.write_node(right.next, nxt)?;
            } else {
                self.set_last_leaf_addr(left_addr)?;
            }
        } else {
            left.keys.push(parent.keys[sep_idx]);
            left.keys.extend(right.keys);
            for &c in &right.ptrs {
                self.set_parent(c, left_addr)?;
            }
            left.ptrs.extend(right.ptrs);
        }
        parent.keys.remove(sep_idx);
        parent.ptrs.remove(sep_idx + 1);
        self.write_node(left_addr, left)?;
        self.write_node(parent_addr, parent)?;
        self.free_node(right_addr)
    }

    fn collapse_root_if_needed(&mut self) -> Result<()> {
        loop {
            if self.root == 0 {
                return Ok(());
            }
            let root = self.read_node(self.root)?;
            if !root.is_leaf && root.keys.is_empty() && root.ptrs.len() == 1 {
                let old_root = self.root;
                let new_root = root.ptrs[0];
                self.set_parent(new_root, 0)?;
                self.root = new_root;
                self.e.set_first_entry(new_root)?;
                self.free_node(old_root)?;
            } else {
                return Ok(());
            }
        }
    }

    // -- check ----------------------------------------------------------------

    /// Verify §3.2/§8 invariants, reporting each violation to `report` rather than
    /// failing fast. Returns the number of violations found.
    pub fn check(&mut self, mut report: impl FnMut(String)) -> Result<usize> {
        let mut errors = 0usize;
        if self.root != 0 {
            let mut leaf_depths = Vec::new();
            self.check_subtree(self.root, 0, &mut leaf_depths, &mut |msg| {
                errors += 1;
                report(msg);
            })?;
            if let Some(first) = leaf_depths.first() {
                if leaf_depths.iter().any(|d| d != first) {
                    errors += 1;
                    report("not all leaves are at the same depth".to_string());
                }
            }
        }

        let mut addr = self.first_leaf_addr()?;
        let mut prev_addr = 0u64;
        let mut last_key: Option<u64> = None;
        let mut total_keys = 0u64;
        while addr != 0 {
            let node = self.read_node(addr)?;
            if node.prev != prev_addr {
                errors += 1;
                report(format!("leaf {addr} has prev={} but expected {prev_addr}", node.prev));
            }
            for &k in &node.keys {
                if let Some(last) = last_key {
                    if k <= last {
                        errors += 1;
                        report(format!("leaf chain out of order at key {k}"));
                    }
                }
                last_key = Some(k);
            }
            total_keys += node.keys.len() as u64;
            prev_addr = addr;
            addr = node.next;
        }
        if prev_addr != self.last_leaf_addr()? {
            errors += 1;
            report(format!(
                "last_leaf field {} does not match actual chain tail {prev_addr}",
                self.last_leaf_addr()?
            ));
        }
        if total_keys != self.size {
            errors += 1;
            report(format!(
                "btree_size={} but leaf chain has {total_keys} keys",
                self.size
            ));
        }
        Ok(errors)
    }

    fn check_subtree(
        &mut self,
        addr: u64,
        depth: usize,
        leaf_depths: &mut Vec<usize>,
        report: &mut impl FnMut(String),
    ) -> Result<()> {
        let node = self.read_node(addr)?;
        if !node.keys.windows(2).all(|w| w[0] < w[1]) {
            report(format!("node {addr} keys are not strictly ascending"));
        }
        if addr != self.root && node.keys.len() < self.codec.min_keys() {
            report(format!(
                "node {addr} has {} keys, below the minimum {}",
                node.keys.len(),
                self.codec.min_keys()
            ));
        }
        if node.is_leaf {
            leaf_depths.push(depth);
        } else {
            for &child in &node.ptrs {
                let child_node = self.read_node(child)?;
                if child_node.parent != addr {
                    report(format!("child {child} parent field does not point back to {addr}"));
                }
                self.check_subtree(child, depth + 1, leaf_depths, report)?;
            }
        }
        Ok(())
    }
}
