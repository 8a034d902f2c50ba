//! On-disk node layout for the persistent B+Tree index.
//!
//! Every node — leaf or branch — is stored as one fixed-size record in the shared
//! equi-record file (`crate::equi`), sized for the configured order so reopening a
//! tree with a different order would silently misread it (the caller is responsible
//! for keeping the order stable across opens, same contract `EquiFile` itself has for
//! `record_bytes`).
//!
//! Layout (order `N`, all integers little-endian):
//! `is_leaf`(1) `key_count`(2) `data_count`(2) `parent_addr`(8) `prev_leaf_addr`(8)
//! `next_leaf_addr`(8) `keys`(8·N) `values_or_children`(8·(N+1)) `crc`(4, CRC-32 of
//! everything before it).
//!
//! Branch nodes hold `key_count` separator keys and `key_count + 1` child addresses.
//! Leaf nodes hold `key_count` key/value (offset) pairs plus `prev`/`next` addresses
//! that thread every leaf into one doubly linked chain in key order. Both variants
//! carry a `parent` address so rebalancing never needs an in-memory path stack — it
//! walks back up via persisted links.

use crc32fast::Hasher;

use crate::error::{Result, StoreError};

#[derive(Debug, Clone)]
pub struct Node {
    pub is_leaf: bool,
    pub parent: u64,
    /// Leaf-only sibling chain; 0 = none. Left 0 on branch nodes.
    pub prev: u64,
    pub next: u64,
    pub keys: Vec<u64>,
    /// Branch: child addresses, `keys.len() + 1` of them. Leaf: value offsets,
    /// `keys.len()` of them.
    pub ptrs: Vec<u64>,
}

impl Node {
    pub fn new_leaf(parent: u64) -> Self {
        Node {
            is_leaf: true,
            parent,
            prev: 0,
            next: 0,
            keys: Vec::new(),
            ptrs: Vec::new(),
        }
    }

    pub fn new_branch(parent: u64) -> Self {
        Node {
            is_leaf: false,
            parent,
            prev: 0,
            next: 0,
            keys: Vec::new(),
            ptrs: Vec::new(),
        }
    }

    pub fn children(&self) -> &[u64] {
        debug_assert!(!self.is_leaf);
        &self.ptrs
    }

    pub fn values(&self) -> &[u64] {
        debug_assert!(self.is_leaf);
        &self.ptrs
    }
}

/// Record byte layout for a given tree order `N` (the maximum key count a node may
/// hold before it must split).
#[derive(Debug, Clone, Copy)]
pub struct NodeCodec {
    pub order: u16,
}

impl NodeCodec {
    const FIXED_HEADER: usize = 1 + 2 + 2 + 8 + 8 + 8;
    const CRC_BYTES: usize = 4;

    pub fn new(order: u16) -> Self {
        NodeCodec { order }
    }

    pub fn max_keys(&self) -> usize {
        self.order as usize
    }

    pub fn min_keys(&self) -> usize {
        // Uniform threshold for leaves and branches (DESIGN.md open-question decision;
        // branches could tolerate one fewer after a split pre-balances, but a single
        // constant keeps the rebalance invariant simple).
        self.order as usize / 2
    }

    fn keys_region_bytes(&self) -> usize {
        self.max_keys() * 8
    }

    fn ptrs_region_bytes(&self) -> usize {
        (self.max_keys() + 1) * 8
    }

    pub fn record_bytes(&self) -> usize {
        Self::FIXED_HEADER + self.keys_region_bytes() + self.ptrs_region_bytes() + Self::CRC_BYTES
    }

    pub fn encode(&self, node: &Node) -> Vec<u8> {
        let crc_at = self.record_bytes() - Self::CRC_BYTES;
        let mut buf = vec![0u8; self.record_bytes()];
        buf[0] = node.is_leaf as u8;
        buf[1..3].copy_from_slice(&(node.keys.len() as u16).to_le_bytes());
        buf[3..5].copy_from_slice(&(node.ptrs.len() as u16).to_le_bytes());
        buf[5..13].copy_from_slice(&node.parent.to_le_bytes());
        buf[13..21].copy_from_slice(&node.prev.to_le_bytes());
        buf[21..29].copy_from_slice(&node.next.to_le_bytes());
        let keys_off = Self::FIXED_HEADER;
        for (i, k) in node.keys.iter().enumerate() {
            let at = keys_off + i * 8;
            buf[at..at + 8].copy_from_slice(&k.to_le_bytes());
        }
        let ptrs_off = keys_off + self.keys_region_bytes();
        for (i, p) in node.ptrs.iter().enumerate() {
            let at = ptrs_off + i * 8;
            buf[at..at + 8].copy_from_slice(&p.to_le_bytes());
        }
        let mut hasher = Hasher::new();
        hasher.update(&buf[..crc_at]);
        buf[crc_at..crc_at + 4].copy_from_slice(&hasher.finalize().to_le_bytes());
        buf
    }

    /// Decode a node, verifying its trailing CRC. Node-CRC failure is fatal on read.
    pub fn decode(&self, buf: &[u8]) -> Result<Node> {
        let expected_len = self.record_bytes();
        if buf.len() != expected_len {
            return Err(StoreError::RecordSizeMismatch {
                expected: expected_len,
                got: buf.len(),
            });
        }
        let crc_at = expected_len - Self::CRC_BYTES;
        let stored = u32::from_le_bytes(buf[crc_at..crc_at + 4].try_into().unwrap());
        let mut hasher = Hasher::new();
        hasher.update(&buf[..crc_at]);
        if hasher.finalize() != stored {
            return Err(StoreError::invariant("b+tree node CRC mismatch"));
        }

        let is_leaf = buf[0] != 0;
        let key_count = u16::from_le_bytes(buf[1..3].try_into().unwrap()) as usize;
        let data_count = u16::from_le_bytes(buf[3..5].try_into().unwrap()) as usize;
        let parent = u64::from_le_bytes(buf[5..13].try_into().unwrap());
        let prev = u64::from_le_bytes(buf[13..21].try_into().unwrap());
        let next = u64::from_le_bytes(buf[21..29].try_into().unwrap());

        let keys_off = Self::FIXED_HEADER;
        let mut keys = Vec::with_capacity(key_count);
        for i in 0..key_count {
            let at = keys_off + i * 8;
            keys.push(u64::from_le_bytes(buf[at..at + 8].try_into().unwrap()));
        }
        let ptrs_off = keys_off + self.keys_region_bytes();
        let mut ptrs = Vec::with_capacity(data_count);
        for i in 0..data_count {
            let at = ptrs_off + i * 8;
            ptrs.push(u64::from_le_bytes(buf[at..at + 8].try_into().unwrap()));
        }
        Ok(Node {
            is_leaf,
            parent,
            prev,
            next,
            keys,
            ptrs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_round_trips() {
        let codec = NodeCodec::new(5);
        let mut node = Node::new_leaf(7);
        node.keys = vec![1, 2, 3];
        node.ptrs = vec![100, 200, 300];
        node.prev = 1;
        node.next = 2;
        let buf = codec.encode(&node);
        assert_eq!(buf.len(), codec.record_bytes());
        let back = codec.decode(&buf).unwrap();
        assert_eq!(back.keys, node.keys);
        assert_eq!(back.ptrs, node.ptrs);
        assert_eq!(back.parent, 7);
        assert!(back.is_leaf);
    }

    #[test]
    fn branch_round_trips_with_one_more_ptr_than_keys() {
        let codec = NodeCodec::new(5);
        let mut node = Node::new_branch(0);
        node.keys = vec![10, 20];
        node.ptrs = vec![1, 2, 3];
        let buf = codec.encode(&node);
        let back = codec.decode(&buf).unwrap();
        assert_eq!(back.ptrs.len(), back.keys.len() + 1);
        assert!(!back.is_leaf);
    }

    #[test]
    fn corrupted_byte_fails_crc_check() {
        let codec = NodeCodec::new(5);
        let mut node = Node::new_leaf(0);
        node.keys = vec![1];
        node.ptrs = vec![42];
        let mut buf = codec.encode(&node);
        buf[5] ^= 0xff;
        assert!(codec.decode(&buf).is_err());
    }
}
