//! Node store abstraction: the btree borrows nodes by id under latch; the
//! store owns the bytes.
//!
//! Two implementations: an in-memory arena, and a page store over a vdev
//! whose allocator state checkpoints through the caller.

use crate::node::{BNodeId, Node, NodeData};
use crate::{BtreeConfig, BtreeKey, BtreeValue};
use om_blkalloc::{Bitmap, BlkAllocConfig, FixedBlkAllocator};
use om_device::VirtualDev;
use om_error::{OmError, Result};
use om_types::{read_le_u16, read_le_u32, read_le_u64, write_le_u16, write_le_u32, write_le_u64, BlkId, ChunkId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const NODE_MAGIC: u32 = 0x4254_4E44; // "BTND"
const NODE_VERSION: u32 = 1;
const FLAG_LEAF: u8 = 0x01;
const FLAG_PC_GEN: u8 = 0x02;
const FLAG_VALID: u8 = 0x04;
const FLAG2_NEXT: u8 = 0x01;
const FLAG2_EDGE: u8 = 0x02;

/// Storage backend for btree nodes.
pub trait NodeStore<K: BtreeKey, V: BtreeValue>: Send + Sync {
    /// Reserve an address and hand back an empty node bound to it.
    fn alloc_node(&self, is_leaf: bool) -> Result<Node<K, V>>;

    /// Persist a node at its address.
    fn write_node(&self, node: &Node<K, V>) -> Result<()>;

    /// Load the node stored at `addr`. `NotFound` for freed addresses.
    fn read_node(&self, addr: u64) -> Result<Node<K, V>>;

    /// Release an address.
    fn free_node(&self, addr: u64) -> Result<()>;
}

// ── In-memory arena ─────────────────────────────────────────────────────────

/// HashMap arena store; nodes survive only as long as the process.
pub struct MemNodeStore<K, V> {
    nodes: Mutex<HashMap<u64, Node<K, V>>>,
    next_id: AtomicU64,
}

impl<K, V> MemNodeStore<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.lock().len()
    }
}

impl<K, V> Default for MemNodeStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: BtreeKey, V: BtreeValue> NodeStore<K, V> for MemNodeStore<K, V> {
    fn alloc_node(&self, is_leaf: bool) -> Result<Node<K, V>> {
        let id = BNodeId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        Ok(if is_leaf {
            Node::new_leaf(id)
        } else {
            Node::new_interior(id)
        })
    }

    fn write_node(&self, node: &Node<K, V>) -> Result<()> {
        self.nodes.lock().insert(node.node_id.id, node.clone());
        Ok(())
    }

    fn read_node(&self, addr: u64) -> Result<Node<K, V>> {
        self.nodes.lock().get(&addr).cloned().ok_or(OmError::NotFound)
    }

    fn free_node(&self, addr: u64) -> Result<()> {
        self.nodes.lock().remove(&addr);
        Ok(())
    }
}

// ── Vdev-backed page store ──────────────────────────────────────────────────

struct ChunkPages {
    chunk_id: ChunkId,
    base: u64,
    total: u32,
    alloc: FixedBlkAllocator,
}

/// Fixed-page node store over a vdev.
///
/// Node addresses are flat page indices across the vdev's chunks. A freed
/// page gets a tombstone write so stale reads fail instead of resurrecting
/// an old node.
pub struct VdevNodeStore {
    vdev: Arc<VirtualDev>,
    chunks: Vec<ChunkPages>,
    node_size: usize,
}

impl VdevNodeStore {
    /// Build over a freshly created vdev.
    pub fn format(vdev: Arc<VirtualDev>, cfg: &BtreeConfig) -> Result<Self> {
        Self::build(vdev, cfg, None)
    }

    /// Rebuild from checkpointed allocator bitmaps keyed by chunk.
    pub fn recover(
        vdev: Arc<VirtualDev>,
        cfg: &BtreeConfig,
        bitmaps: &HashMap<ChunkId, Vec<u8>>,
    ) -> Result<Self> {
        Self::build(vdev, cfg, Some(bitmaps))
    }

    fn build(
        vdev: Arc<VirtualDev>,
        cfg: &BtreeConfig,
        bitmaps: Option<&HashMap<ChunkId, Vec<u8>>>,
    ) -> Result<Self> {
        if cfg.node_size != vdev.blk_size() as usize {
            return Err(OmError::IncompatibleLayout {
                detail: format!(
                    "btree node size {} disagrees with vdev block size {}",
                    cfg.node_size,
                    vdev.blk_size()
                ),
            });
        }
        let mut chunks = Vec::new();
        let mut base = 0_u64;
        for c in vdev.chunks() {
            let total = vdev.total_blks(c.chunk_id)?;
            let alloc_cfg = BlkAllocConfig::new(c.chunk_id, total);
            let alloc = match bitmaps.and_then(|m| m.get(&c.chunk_id)) {
                Some(bytes) => {
                    let a = FixedBlkAllocator::recover(alloc_cfg, bytes);
                    a.inited();
                    a
                }
                None => FixedBlkAllocator::new(alloc_cfg),
            };
            chunks.push(ChunkPages {
                chunk_id: c.chunk_id,
                base,
                total,
                alloc,
            });
            base += u64::from(total);
        }
        Ok(Self {
            vdev,
            chunks,
            node_size: cfg.node_size,
        })
    }

    /// Current allocator bitmaps, snapshotting cache into disk state.
    #[must_use]
    pub fn cp_take_snapshots(&self) -> HashMap<ChunkId, Vec<u8>> {
        self.chunks
            .iter()
            .map(|c| (c.chunk_id, c.alloc.cp_take_disk_snapshot()))
            .collect()
    }

    fn addr_to_bid(&self, addr: u64) -> Result<BlkId> {
        for c in &self.chunks {
            if addr >= c.base && addr < c.base + u64::from(c.total) {
                let blk = u32::try_from(addr - c.base).map_err(|_| OmError::NotFound)?;
                return Ok(BlkId::new(c.chunk_id, blk, 1));
            }
        }
        Err(OmError::NotFound)
    }

    fn bid_to_addr(&self, bid: BlkId) -> Result<u64> {
        self.chunks
            .iter()
            .find(|c| c.chunk_id == bid.chunk_id)
            .map(|c| c.base + u64::from(bid.blk_num))
            .ok_or(OmError::NotFound)
    }

    fn encode_node<K: BtreeKey, V: BtreeValue>(&self, node: &Node<K, V>) -> Result<Vec<u8>> {
        let mut page = vec![0_u8; self.node_size];
        write_le_u32(&mut page, 0, NODE_MAGIC);
        write_le_u32(&mut page, 4, NODE_VERSION);
        let mut flags = FLAG_VALID;
        if node.is_leaf() {
            flags |= FLAG_LEAF;
        }
        if node.node_id.pc_gen_flag {
            flags |= FLAG_PC_GEN;
        }
        page[8] = flags;
        write_le_u64(&mut page, 16, node.node_id.id);
        write_le_u64(&mut page, 24, node.gen);
        write_le_u64(&mut page, 32, node.next_bnode.id);
        write_le_u64(&mut page, 40, node.get_edge().id);
        write_le_u32(
            &mut page,
            48,
            u32::try_from(node.total_entries()).map_err(|_| OmError::IncompatibleLayout {
                detail: "node entry count overflows u32".to_owned(),
            })?,
        );
        let mut flags2 = 0_u8;
        if node.next_bnode.pc_gen_flag {
            flags2 |= FLAG2_NEXT;
        }
        if node.get_edge().pc_gen_flag {
            flags2 |= FLAG2_EDGE;
        }
        page[52] = flags2;

        let mut body = Vec::with_capacity(node.occupied_size());
        match &node.data {
            NodeData::Leaf(entries) => {
                for (k, v) in entries {
                    push_entry(&mut body, k, Some(v), None);
                }
            }
            NodeData::Interior { entries, .. } => {
                for (k, child) in entries {
                    push_entry::<K, V>(&mut body, k, None, Some(*child));
                }
            }
        }
        let avail = self.node_size - crate::NODE_HDR_SIZE;
        if body.len() > avail {
            return Err(OmError::IncompatibleLayout {
                detail: format!("node body {} exceeds page capacity {avail}", body.len()),
            });
        }
        page[crate::NODE_HDR_SIZE..crate::NODE_HDR_SIZE + body.len()].copy_from_slice(&body);
        let checksum = crc32c::crc32c(&page[16..]);
        write_le_u32(&mut page, 12, checksum);
        Ok(page)
    }

    fn decode_node<K: BtreeKey, V: BtreeValue>(&self, page: &[u8]) -> Result<Node<K, V>> {
        let corrupt = |detail: String| OmError::CorruptHeader { detail };
        let magic = read_le_u32(page, 0).map_err(|e| corrupt(e.to_string()))?;
        if magic != NODE_MAGIC {
            return Err(OmError::NotFound);
        }
        let flags = page[8];
        if flags & FLAG_VALID == 0 {
            return Err(OmError::NotFound);
        }
        let stored = read_le_u32(page, 12).map_err(|e| corrupt(e.to_string()))?;
        if crc32c::crc32c(&page[16..]) != stored {
            return Err(corrupt("btree node checksum mismatch".to_owned()));
        }
        let id = read_le_u64(page, 16).map_err(|e| corrupt(e.to_string()))?;
        let gen = read_le_u64(page, 24).map_err(|e| corrupt(e.to_string()))?;
        let next_id = read_le_u64(page, 32).map_err(|e| corrupt(e.to_string()))?;
        let edge_id = read_le_u64(page, 40).map_err(|e| corrupt(e.to_string()))?;
        let nentries = read_le_u32(page, 48).map_err(|e| corrupt(e.to_string()))? as usize;
        let flags2 = page[52];

        let node_id = BNodeId {
            id,
            pc_gen_flag: flags & FLAG_PC_GEN != 0,
        };
        let next_bnode = BNodeId {
            id: next_id,
            pc_gen_flag: flags2 & FLAG2_NEXT != 0,
        };
        let mut node: Node<K, V> = if flags & FLAG_LEAF != 0 {
            Node::new_leaf(node_id)
        } else {
            Node::new_interior(node_id)
        };
        node.gen = gen;
        node.next_bnode = next_bnode;

        let mut at = crate::NODE_HDR_SIZE;
        for _ in 0..nentries {
            let klen = read_le_u16(page, at).map_err(|e| corrupt(e.to_string()))? as usize;
            let vlen = read_le_u16(page, at + 2).map_err(|e| corrupt(e.to_string()))? as usize;
            at += 4;
            if at + klen + vlen > page.len() {
                return Err(corrupt("btree node entry overruns page".to_owned()));
            }
            let key = K::deserialize(&page[at..at + klen]);
            at += klen;
            match &mut node.data {
                NodeData::Leaf(entries) => {
                    entries.push((key, V::deserialize(&page[at..at + vlen])));
                }
                NodeData::Interior { entries, .. } => {
                    let child_id = read_le_u64(page, at).map_err(|e| corrupt(e.to_string()))?;
                    let child = BNodeId {
                        id: child_id,
                        pc_gen_flag: page[at + 8] != 0,
                    };
                    entries.push((key, child));
                }
            }
            at += vlen;
        }
        node.set_edge(BNodeId {
            id: edge_id,
            pc_gen_flag: flags2 & FLAG2_EDGE != 0,
        });
        Ok(node)
    }
}

fn push_entry<K: BtreeKey, V: BtreeValue>(
    body: &mut Vec<u8>,
    key: &K,
    value: Option<&V>,
    child: Option<BNodeId>,
) {
    let klen = key.serialized_size();
    let vlen = value.map_or(crate::node::CHILD_REF_SIZE, BtreeValue::serialized_size);
    let mut frame = [0_u8; 4];
    write_le_u16(&mut frame, 0, u16::try_from(klen).unwrap_or(u16::MAX));
    write_le_u16(&mut frame, 2, u16::try_from(vlen).unwrap_or(u16::MAX));
    body.extend_from_slice(&frame);
    key.serialize_into(body);
    if let Some(v) = value {
        v.serialize_into(body);
    }
    if let Some(c) = child {
        body.extend_from_slice(&c.id.to_le_bytes());
        body.push(u8::from(c.pc_gen_flag));
    }
}

impl<K: BtreeKey, V: BtreeValue> NodeStore<K, V> for VdevNodeStore {
    fn alloc_node(&self, is_leaf: bool) -> Result<Node<K, V>> {
        for c in &self.chunks {
            if let Ok(bid) = c.alloc.alloc_contiguous() {
                let addr = self.bid_to_addr(bid)?;
                let id = BNodeId::new(addr);
                return Ok(if is_leaf {
                    Node::new_leaf(id)
                } else {
                    Node::new_interior(id)
                });
            }
        }
        Err(OmError::SpaceFull)
    }

    fn write_node(&self, node: &Node<K, V>) -> Result<()> {
        let bid = self.addr_to_bid(node.node_id.id)?;
        let page = self.encode_node(node)?;
        self.vdev.sync_write_blk(bid, &page)
    }

    fn read_node(&self, addr: u64) -> Result<Node<K, V>> {
        let bid = self.addr_to_bid(addr)?;
        let page = self.vdev.sync_read_blk(bid)?;
        self.decode_node(&page)
    }

    fn free_node(&self, addr: u64) -> Result<()> {
        let bid = self.addr_to_bid(addr)?;
        // Tombstone first so a stale link cannot resurrect the old node.
        let tombstone = vec![0_u8; self.node_size];
        self.vdev.sync_write_blk(bid, &tombstone)?;
        let c = self
            .chunks
            .iter()
            .find(|c| c.chunk_id == bid.chunk_id)
            .ok_or(OmError::NotFound)?;
        c.alloc.free(bid)
    }
}

/// Bitmap helper re-exported for checkpoint plumbing tests.
#[must_use]
pub fn used_pages(bitmap_bytes: &[u8], total: u32) -> u32 {
    let bm = Bitmap::from_bytes(bitmap_bytes, total);
    total - bm.count_free()
}
