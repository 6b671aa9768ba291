//! Virtual device view: resolves `BlkId`s to `(endpoint, byte offset)` pairs
//! over the chunks of one vdev.

use crate::endpoint::DriveEndpoint;
use crate::manager::DeviceManager;
use om_error::{OmError, Result};
use om_types::{BlkId, ChunkId, VdevId};
use std::collections::HashMap;
use std::sync::Arc;

/// One chunk as seen through a vdev.
#[derive(Clone)]
pub struct VdevChunk {
    pub chunk_id: ChunkId,
    pub endpoint: Arc<dyn DriveEndpoint>,
    pub start_offset: u64,
    pub size: u64,
}

/// Read-side handle over a vdev's chunk membership.
///
/// Chunk membership is fixed once the vdev is opened; resizing requires
/// reopening the view.
pub struct VirtualDev {
    vdev_id: VdevId,
    blk_size: u32,
    chunks: Vec<VdevChunk>,
    by_id: HashMap<ChunkId, usize>,
}

impl VirtualDev {
    /// Materialize the view of `vdev_id` from the device manager.
    pub fn open(dm: &DeviceManager, vdev_id: VdevId) -> Result<Self> {
        let info = dm.vdev_info(vdev_id).ok_or(OmError::NotFound)?;
        let mut chunks = Vec::new();
        let mut by_id = HashMap::new();
        for c in dm.chunks_of_vdev(vdev_id) {
            let endpoint = dm.endpoint(c.pdev_id)?;
            by_id.insert(c.chunk_id, chunks.len());
            chunks.push(VdevChunk {
                chunk_id: c.chunk_id,
                endpoint,
                start_offset: c.start_offset.0,
                size: c.size,
            });
        }
        if chunks.is_empty() {
            return Err(OmError::NotFound);
        }
        Ok(Self {
            vdev_id,
            blk_size: info.blk_size,
            chunks,
            by_id,
        })
    }

    /// Assemble a view from explicit parts (tests, endpoint wrappers).
    #[must_use]
    pub fn from_parts(vdev_id: VdevId, blk_size: u32, chunks: Vec<VdevChunk>) -> Self {
        let by_id = chunks
            .iter()
            .enumerate()
            .map(|(i, c)| (c.chunk_id, i))
            .collect();
        Self {
            vdev_id,
            blk_size,
            chunks,
            by_id,
        }
    }

    #[must_use]
    pub fn vdev_id(&self) -> VdevId {
        self.vdev_id
    }

    #[must_use]
    pub fn blk_size(&self) -> u32 {
        self.blk_size
    }

    #[must_use]
    pub fn chunks(&self) -> &[VdevChunk] {
        &self.chunks
    }

    #[must_use]
    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunk(&self, chunk_id: ChunkId) -> Result<&VdevChunk> {
        self.by_id
            .get(&chunk_id)
            .map(|&i| &self.chunks[i])
            .ok_or_else(|| OmError::InvalidBlkId {
                detail: format!("chunk {chunk_id} not part of vdev {}", self.vdev_id),
            })
    }

    /// Blocks per chunk at this vdev's block size.
    pub fn total_blks(&self, chunk_id: ChunkId) -> Result<u32> {
        let c = self.chunk(chunk_id)?;
        u32::try_from(c.size / u64::from(self.blk_size)).map_err(|_| OmError::InvalidBlkId {
            detail: format!("chunk {chunk_id} too large for u32 block count"),
        })
    }

    /// Resolve a `BlkId` to its endpoint, absolute byte offset, and length.
    pub fn resolve(&self, bid: BlkId) -> Result<(Arc<dyn DriveEndpoint>, u64, usize)> {
        let c = self.chunk(bid.chunk_id)?;
        let blk_size = u64::from(self.blk_size);
        let rel = u64::from(bid.blk_num) * blk_size;
        let len = u64::from(bid.blk_count) * blk_size;
        if rel + len > c.size {
            return Err(OmError::InvalidBlkId {
                detail: format!("{bid} exceeds chunk of {} bytes", c.size),
            });
        }
        let len = usize::try_from(len).map_err(|_| OmError::InvalidBlkId {
            detail: format!("{bid} length overflows usize"),
        })?;
        Ok((Arc::clone(&c.endpoint), c.start_offset + rel, len))
    }

    /// Synchronous positional write of `data` at `bid`.
    pub fn sync_write_blk(&self, bid: BlkId, data: &[u8]) -> Result<()> {
        let (ep, offset, len) = self.resolve(bid)?;
        if data.len() != len {
            return Err(OmError::InvalidBlkId {
                detail: format!("{bid} expects {len} bytes, got {}", data.len()),
            });
        }
        ep.sync_write_at(offset, data)
    }

    /// Synchronous positional read of the full extent named by `bid`.
    pub fn sync_read_blk(&self, bid: BlkId) -> Result<Vec<u8>> {
        let (ep, offset, len) = self.resolve(bid)?;
        let mut buf = vec![0_u8; len];
        ep.sync_read_at(offset, &mut buf)?;
        Ok(buf)
    }
}
