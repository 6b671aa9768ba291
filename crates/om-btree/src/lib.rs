#![forbid(unsafe_code)]
//! Persistent, concurrent B+tree.
//!
//! In-place node updates with crash-consistent parent→child links: split
//! and merge follow a strict write order, and a parity bit embedded in
//! node ids (`pc_gen_flag`) exposes the torn window so the first descent
//! after a crash repairs it.

pub mod btree;
pub mod node;
pub mod store;

pub use btree::{Btree, BtreeQueryRequest, BtreeRange, QueryMode};
pub use node::{BNodeId, FindResult, Node, NodeData};
pub use store::{MemNodeStore, NodeStore, VdevNodeStore};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Serialized node header bytes (magic, flags, ids, gen, links, checksum).
pub const NODE_HDR_SIZE: usize = 64;

/// Key codec contract. Keys order the tree and serialize into node pages.
pub trait BtreeKey: Clone + Ord + fmt::Debug + Send + Sync + 'static {
    fn serialized_size(&self) -> usize;
    fn serialize_into(&self, out: &mut Vec<u8>);
    fn deserialize(bytes: &[u8]) -> Self;
}

/// Value codec contract.
pub trait BtreeValue: Clone + fmt::Debug + Send + Sync + 'static {
    fn serialized_size(&self) -> usize;
    fn serialize_into(&self, out: &mut Vec<u8>);
    fn deserialize(bytes: &[u8]) -> Self;
}

impl BtreeKey for u64 {
    fn serialized_size(&self) -> usize {
        8
    }

    fn serialize_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn deserialize(bytes: &[u8]) -> Self {
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(&bytes[..8]);
        Self::from_le_bytes(raw)
    }
}

impl BtreeValue for u64 {
    fn serialized_size(&self) -> usize {
        8
    }

    fn serialize_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }

    fn deserialize(bytes: &[u8]) -> Self {
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(&bytes[..8]);
        Self::from_le_bytes(raw)
    }
}

impl BtreeValue for Vec<u8> {
    fn serialized_size(&self) -> usize {
        self.len()
    }

    fn serialize_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }

    fn deserialize(bytes: &[u8]) -> Self {
        bytes.to_vec()
    }
}

/// Kind of a `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutType {
    /// Fail if the key exists.
    Insert,
    /// Insert or overwrite.
    Upsert,
    /// Overwrite only an existing key.
    Replace,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BtreeConfig {
    /// Full serialized node size including the header.
    pub node_size: usize,
    /// A node under this fill percentage asks for a merge.
    pub merge_fill_pct: u8,
}

impl Default for BtreeConfig {
    fn default() -> Self {
        Self {
            node_size: 4096,
            merge_fill_pct: 40,
        }
    }
}

impl BtreeConfig {
    /// Bytes available to entries in one node.
    #[must_use]
    pub fn node_capacity(&self) -> usize {
        self.node_size.saturating_sub(NODE_HDR_SIZE)
    }

    /// Byte target moved to the new sibling on split.
    #[must_use]
    pub fn split_size(&self) -> usize {
        self.node_capacity() / 2
    }

    /// Byte target each survivor is balanced to during merge.
    #[must_use]
    pub fn ideal_fill_size(&self) -> usize {
        self.node_capacity() * 90 / 100
    }
}

/// Point-in-time btree counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BtreeStats {
    pub obj_count: u64,
    pub leaf_nodes: u64,
    pub interior_nodes: u64,
    pub splits: u64,
    pub merges: u64,
    pub repairs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u64_codec_round_trip() {
        let k = 0xDEAD_BEEF_u64;
        let mut buf = Vec::new();
        BtreeKey::serialize_into(&k, &mut buf);
        assert_eq!(buf.len(), 8);
        assert_eq!(<u64 as BtreeKey>::deserialize(&buf), k);
    }

    #[test]
    fn bytes_codec_round_trip() {
        let v = vec![1_u8, 2, 3, 4, 5];
        let mut buf = Vec::new();
        BtreeValue::serialize_into(&v, &mut buf);
        assert_eq!(<Vec<u8> as BtreeValue>::deserialize(&buf), v);
    }

    #[test]
    fn config_derived_sizes() {
        let cfg = BtreeConfig::default();
        assert_eq!(cfg.node_capacity(), 4096 - NODE_HDR_SIZE);
        assert!(cfg.split_size() < cfg.node_capacity());
        assert!(cfg.ideal_fill_size() <= cfg.node_capacity());
    }
}
