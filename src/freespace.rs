//! Free-space manager F: a size-indexed ternary search tree over free `(offset, size)`
//! regions of the blob file. Nodes are stored as fixed-size records in an equi-record
//! file (`crate::equi`), the same primitive the B+Tree index builds on.
//!
//! Node layout (48 bytes, six `u64` fields): `size`, `offset`, `parent`, `smaller`,
//! `equal`, `larger`. A node with an equal-sized sibling chains it off `equal`; per the
//! ternary-tree invariant, a pure chain node (reached only via another node's `equal`
//! link) never has a `smaller`/`larger` child of its own — only the node reachable from
//! the main size-ordered spine does.
//!
//! `get_space` collapses the two lookup variants
//! (`find_matching_space`/`find_equal_or_larger_space`) into one method: try an exact
//! match first, then the smallest region whose leftover (after satisfying `need`) is
//! either zero or large enough to host its own hole header
//! (`crate::blob::HEADER_SIZE`), matching the single placement rule `place_and_write`
//! actually applies. Keeping one search path avoids duplicating the tree-descent/
//! rebalance machinery for two policies that the blob file only ever consumes through
//! a single gate.

use std::path::Path;

use crate::blob;
use crate::equi::EquiFile;
use crate::error::Result;

const FIELD_COUNT: usize = 6;
const RECORD_BYTES: usize = FIELD_COUNT * 8;

#[derive(Debug, Clone, Copy, Default)]
struct Node {
    size: u64,
    offset: u64,
    parent: u64,
    smaller: u64,
    equal: u64,
    larger: u64,
}

impl Node {
    fn to_bytes(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RECORD_BYTES);
        for field in [
            self.size,
            self.offset,
            self.parent,
            self.smaller,
            self.equal,
            self.larger,
        ] {
            buf.extend_from_slice(&field.to_le_bytes());
        }
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        let f = |i: usize| u64::from_le_bytes(buf[i * 8..i * 8 + 8].try_into().unwrap());
        Node {
            size: f(0),
            offset: f(1),
            parent: f(2),
            smaller: f(3),
            equal: f(4),
            larger: f(5),
        }
    }
}

pub struct FreeSpace {
    e: EquiFile,
    root: u64,
}

impl FreeSpace {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let e = EquiFile::open(path, RECORD_BYTES)?;
        let root = e.first_entry();
        Ok(FreeSpace { e, root })
    }

    pub fn close(self) -> Result<()> {
        self.e.close()
    }

    pub fn erase(self) -> Result<()> {
        self.e.erase()
    }

    pub fn sync(&mut self) -> Result<()> {
        self.e.sync()
    }

    pub fn clear(&mut self) -> Result<()> {
        self.e.clear()?;
        self.root = 0;
        Ok(())
    }

    fn read(&mut self, addr: u64) -> Result<Node> {
        let buf = self.e.retrieve(addr)?;
        Ok(Node::from_bytes(&buf))
    }

    fn write(&mut self, addr: u64, node: &Node) -> Result<()> {
        self.e.store(addr, &node.to_bytes())
    }

    fn set_root(&mut self, addr: u64) -> Result<()> {
        self.root = addr;
        self.e.set_first_entry(addr)
    }

    /// Record a newly freed `(offset, size)` region.
    pub fn add_space(&mut self, offset: u64, size: u64) -> Result<()> {
        if self.root == 0 {
            let addr = self.new_node(size, offset, 0)?;
            self.set_root(addr)?;
            return Ok(());
        }

        let mut cur = self.root;
        loop {
            let node = self.read(cur)?;
            if size < node.size {
                if node.smaller == 0 {
                    let addr = self.new_node(size, offset, cur)?;
                    let mut node = node;
                    node.smaller = addr;
                    self.write(cur, &node)?;
                    return Ok(());
                }
                cur = node.smaller;
            } else if size > node.size {
                if node.larger == 0 {
                    let addr = self.new_node(size, offset, cur)?;
                    let mut node = node;
                    node.larger = addr;
                    self.write(cur, &node)?;
                    return Ok(());
                }
                cur = node.larger;
            } else {
                // Equal size: descend the chain and prepend.
                let mut chain_head = cur;
                loop {
                    let chain_node = self.read(chain_head)?;
                    if chain_node.equal == 0 {
                        break;
                    }
                    chain_head = chain_node.equal;
                }
                let addr = self.new_node(size, offset, chain_head)?;
                let mut chain_node = self.read(chain_head)?;
                chain_node.equal = addr;
                self.write(chain_head, &chain_node)?;
                return Ok(());
            }
        }
    }

    fn new_node(&mut self, size: u64, offset: u64, parent: u64) -> Result<u64> {
        let node = Node {
            size,
            offset,
            parent,
            ..Default::default()
        };
        let addr = self.e.allocate_slot()?;
        self.e.store(addr, &node.to_bytes())?;
        Ok(addr)
    }

    /// True if a free region with exactly this `(offset, size)` is currently tracked.
    pub fn has_space(&mut self, offset: u64, size: u64) -> Result<bool> {
        let mut cur = self.root;
        while cur != 0 {
            let node = self.read(cur)?;
            if size == node.size {
                let mut probe = cur;
                loop {
                    let n = self.read(probe)?;
                    if n.offset == offset {
                        return Ok(true);
                    }
                    if n.equal == 0 {
                        return Ok(false);
                    }
                    probe = n.equal;
                }
            } else if size < node.size {
                cur = node.smaller;
            } else {
                cur = node.larger;
            }
        }
        Ok(false)
    }

    /// Take a region usable for a payload of `need` bytes: an exact match, or
    /// failing that the smallest region whose leftover is either zero or at least
    /// `blob::HEADER_SIZE`. Returns `(offset, size)` of the region taken.
    pub fn get_space(&mut self, need: u64) -> Result<Option<(u64, u64)>> {
        if let Some(addr) = self.locate_exact(need)? {
            return self.take(addr);
        }
        if let Some(addr) = self.locate_smallest_at_least(need + blob::HEADER_SIZE)? {
            return self.take(addr);
        }
        Ok(None)
    }

    fn locate_exact(&mut self, size: u64) -> Result<Option<u64>> {
        let mut cur = self.root;
        while cur != 0 {
            let node = self.read(cur)?;
            if size == node.size {
                return Ok(Some(cur));
            } else if size < node.size {
                cur = node.smaller;
            } else {
                cur = node.larger;
            }
        }
        Ok(None)
    }

    /// Smallest node with `size >= threshold`, by ordinary BST descent keeping the
    /// best candidate seen so far.
    fn locate_smallest_at_least(&mut self, threshold: u64) -> Result<Option<u64>> {
        let mut cur = self.root;
        let mut best: Option<(u64, u64)> = None; // (addr, size)
        while cur != 0 {
            let node = self.read(cur)?;
            if node.size >= threshold {
                if best.is_none_or(|(_, best_size)| node.size < best_size) {
                    best = Some((cur, node.size));
                }
                cur = node.smaller;
            } else {
                cur = node.larger;
            }
        }
        Ok(best.map(|(addr, _)| addr))
    }

    /// Remove the region at `addr` from the tree and return its `(offset, size)`.
    fn take(&mut self, addr: u64) -> Result<Option<(u64, u64)>> {
        let node = self.read(addr)?;
        let result = (node.offset, node.size);

        if node.equal != 0 {
            // addr is the head of (or within) an equal-size group: splice its chain
            // head forward, it inherits addr's tree position.
            let mut eq = self.read(node.equal)?;
            eq.parent = node.parent;
            eq.smaller = node.smaller;
            eq.larger = node.larger;
            self.write(node.equal, &eq)?;
            self.reparent(node.smaller, node.equal)?;
            self.reparent(node.larger, node.equal)?;
            self.hook_into_parent(node.parent, addr, node.equal)?;
        } else {
            self.remove_from_spine(addr, &node)?;
        }

        self.e.delete(addr)?;
        Ok(Some(result))
    }

    fn remove_from_spine(&mut self, addr: u64, node: &Node) -> Result<()> {
        let replacement = match (node.smaller, node.larger) {
            (0, 0) => 0,
            (s, 0) => s,
            (0, l) => l,
            (_, _) => {
                // Largest node in the smaller subtree, spliced into addr's position.
                let mut cur = node.smaller;
                loop {
                    let n = self.read(cur)?;
                    if n.larger == 0 {
                        break;
                    }
                    cur = n.larger;
                }
                let max_addr = cur;
                let max_node = self.read(max_addr)?;
                if max_addr != node.smaller {
                    let max_parent = max_node.parent;
                    let mut mp = self.read(max_parent)?;
                    mp.larger = max_node.smaller;
                    self.write(max_parent, &mp)?;
                    self.reparent(max_node.smaller, max_parent)?;
                }
                let new_smaller = if max_addr == node.smaller {
                    max_node.smaller
                } else {
                    node.smaller
                };
                let mut replaced = max_node;
                replaced.parent = node.parent;
                replaced.smaller = new_smaller;
                replaced.larger = node.larger;
                self.write(max_addr, &replaced)?;
                self.reparent(new_smaller, max_addr)?;
                self.reparent(node.larger, max_addr)?;
                max_addr
            }
        };
        self.hook_into_parent(node.parent, addr, replacement)
    }

    fn reparent(&mut self, child: u64, new_parent: u64) -> Result<()> {
        if child == 0 {
            return Ok(());
        }
        let mut n = self.read(child)?;
        n.parent = new_parent;
        self.write(child, &n)
    }

    fn hook_into_parent(&mut self, parent: u64, old_child: u64, new_child: u64) -> Result<()> {
        if parent == 0 {
            self.set_root(new_child)?;
        } else {
            let mut p = self.read(parent)?;
            if p.smaller == old_child {
                p.smaller = new_child;
            } else if p.larger == old_child {
                p.larger = new_child;
            } else if p.equal == old_child {
                p.equal = new_child;
            }
            self.write(parent, &p)?;
        }
        if new_child != 0 {
            self.reparent(new_child, parent)?;
        }
        Ok(())
    }

    /// Walk the whole tree (main spine and equal-chains), invoking `f(offset, size)`.
    pub fn for_each(&mut self, mut f: impl FnMut(u64, u64)) -> Result<()> {
        let mut stack = vec![self.root];
        while let Some(addr) = stack.pop() {
            if addr == 0 {
                continue;
            }
            let node = self.read(addr)?;
            f(node.offset, node.size);
            stack.push(node.smaller);
            stack.push(node.larger);
            stack.push(node.equal);
        }
        Ok(())
    }

    /// Rebuild the tree from scratch out of a fresh region list (used by `repair`).
    pub fn rebuild(&mut self, regions: impl IntoIterator<Item = (u64, u64)>) -> Result<()> {
        self.clear()?;
        for (offset, size) in regions {
            self.add_space(offset, size)?;
        }
        Ok(())
    }

    /// Verify that in-order traversal yields non-decreasing sizes, and that every
    /// node's equal chain holds identical sizes. Never mutates.
    pub fn check(&mut self) -> Result<Vec<String>> {
        let mut errors = Vec::new();
        let mut sizes = Vec::new();
        self.check_subtree(self.root, &mut sizes, &mut errors)?;
        if !sizes.windows(2).all(|w| w[0] <= w[1]) {
            errors.push("free-space tree in-order traversal is not non-decreasing".to_string());
        }
        Ok(errors)
    }

    fn check_subtree(&mut self, addr: u64, sizes: &mut Vec<u64>, errors: &mut Vec<String>) -> Result<()> {
        if addr == 0 {
            return Ok(());
        }
        let node = self.read(addr)?;
        self.check_subtree(node.smaller, sizes, errors)?;
        sizes.push(node.size);
        let mut chain = node.equal;
        while chain != 0 {
            let chain_node = self.read(chain)?;
            if chain_node.size != node.size {
                errors.push(format!(
                    "equal-chain node at {chain} has size {} but head has size {}",
                    chain_node.size, node.size
                ));
            }
            if chain_node.smaller != 0 || chain_node.larger != 0 {
                errors.push(format!("equal-chain node at {chain} unexpectedly has a smaller/larger child"));
            }
            chain = chain_node.equal;
        }
        self.check_subtree(node.larger, sizes, errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fixture() -> (tempfile::TempDir, FreeSpace) {
        let dir = tempdir().unwrap();
        let fs = FreeSpace::open(dir.path().join("spaces.blobs")).unwrap();
        (dir, fs)
    }

    #[test]
    fn exact_match_is_found_and_removed() {
        let (_d, mut fs) = fixture();
        fs.add_space(1000, 100).unwrap();
        fs.add_space(2000, 50).unwrap();
        let got = fs.get_space(50).unwrap();
        assert_eq!(got, Some((2000, 50)));
        assert!(!fs.has_space(2000, 50).unwrap());
        assert!(fs.has_space(1000, 100).unwrap());
    }

    #[test]
    fn equal_sized_regions_chain_and_both_are_eventually_returned() {
        let (_d, mut fs) = fixture();
        fs.add_space(1000, 64).unwrap();
        fs.add_space(2000, 64).unwrap();
        fs.add_space(3000, 64).unwrap();

        let mut seen = vec![];
        for _ in 0..3 {
            let (off, size) = fs.get_space(64).unwrap().unwrap();
            assert_eq!(size, 64);
            seen.push(off);
        }
        seen.sort();
        assert_eq!(seen, vec![1000, 2000, 3000]);
        assert_eq!(fs.get_space(64).unwrap(), None);
    }

    #[test]
    fn falls_back_to_smallest_region_with_room_for_a_hole_header() {
        let (_d, mut fs) = fixture();
        fs.add_space(1000, 500).unwrap();
        // Only admits a fit whose leftover is >= HEADER_SIZE; need=400 leaves 100,
        // comfortably above HEADER_SIZE (25).
        let got = fs.get_space(400).unwrap();
        assert_eq!(got, Some((1000, 500)));
    }

    #[test]
    fn rejects_a_region_whose_leftover_would_be_too_small_for_a_hole_header() {
        let (_d, mut fs) = fixture();
        // leftover = 500 - 480 = 20, below HEADER_SIZE (25): not usable.
        fs.add_space(1000, 500).unwrap();
        let got = fs.get_space(480).unwrap();
        assert_eq!(got, None);
        assert!(fs.has_space(1000, 500).unwrap());
    }

    #[test]
    fn remove_node_with_two_children_splices_predecessor() {
        let (_d, mut fs) = fixture();
        for size in [50u64, 30, 70, 20, 40, 60, 80] {
            fs.add_space(size * 10, size).unwrap();
        }
        let got = fs.get_space(50).unwrap();
        assert_eq!(got, Some((500, 50)));
        for size in [30u64, 70, 20, 40, 60, 80] {
            assert!(fs.has_space(size * 10, size).unwrap());
        }
    }

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("spaces.blobs");
        {
            let mut fs = FreeSpace::open(&path).unwrap();
            fs.add_space(1000, 100).unwrap();
            fs.sync().unwrap();
        }
        let mut fs = FreeSpace::open(&path).unwrap();
        assert!(fs.has_space(1000, 100).unwrap());
    }
}
