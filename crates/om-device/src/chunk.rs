//! Chunk metadata: a contiguous byte range on exactly one physical device.
//!
//! Chunks on a pdev form a doubly-linked list ordered by start offset,
//! covering `[data_offset, size)` with free and busy chunks interleaved.
//! Links carry ids, not handles; the device manager owns the slot table.

use om_types::{
    read_le_u32, read_le_u64, write_le_u32, write_le_u64, ByteOffset, ChunkId, ParseError, PdevId,
    VdevId,
};
use std::fmt;

/// Serialized size of one chunk info slot.
pub const CHUNK_INFO_SIZE: usize = 64;

const FLAG_SLOT_ALLOCATED: u8 = 0x01;
const FLAG_SB_CHUNK: u8 = 0x02;
const FLAG_BUSY: u8 = 0x04;

/// Per-chunk on-disk record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    pub chunk_id: ChunkId,
    pub pdev_id: PdevId,
    pub vdev_id: VdevId,
    pub prev_chunk_id: ChunkId,
    pub next_chunk_id: ChunkId,
    /// For mirror chunks, the chunk this one mirrors.
    pub primary_chunk_id: ChunkId,
    pub start_offset: ByteOffset,
    pub size: u64,
    pub slot_allocated: bool,
    pub is_sb_chunk: bool,
    pub busy: bool,
}

impl ChunkInfo {
    /// A fresh, unlinked chunk record.
    #[must_use]
    pub fn new(chunk_id: ChunkId, pdev_id: PdevId, start_offset: ByteOffset, size: u64) -> Self {
        Self {
            chunk_id,
            pdev_id,
            vdev_id: VdevId::INVALID,
            prev_chunk_id: ChunkId::INVALID,
            next_chunk_id: ChunkId::INVALID,
            primary_chunk_id: ChunkId::INVALID,
            start_offset,
            size,
            slot_allocated: true,
            is_sb_chunk: false,
            busy: false,
        }
    }

    /// Whether this chunk is in use (owned by a vdev or holding DM state).
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy || self.is_sb_chunk || self.vdev_id.is_valid()
    }

    /// One past the last byte of this chunk.
    #[must_use]
    pub fn end_offset(&self) -> u64 {
        self.start_offset.0 + self.size
    }

    pub fn encode_into(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= CHUNK_INFO_SIZE);
        write_le_u32(out, 0, self.chunk_id.0);
        write_le_u32(out, 4, self.pdev_id.0);
        write_le_u32(out, 8, self.vdev_id.0);
        write_le_u32(out, 12, self.prev_chunk_id.0);
        write_le_u32(out, 16, self.next_chunk_id.0);
        write_le_u32(out, 20, self.primary_chunk_id.0);
        write_le_u64(out, 24, self.start_offset.0);
        write_le_u64(out, 32, self.size);
        let mut flags = 0_u8;
        if self.slot_allocated {
            flags |= FLAG_SLOT_ALLOCATED;
        }
        if self.is_sb_chunk {
            flags |= FLAG_SB_CHUNK;
        }
        if self.busy {
            flags |= FLAG_BUSY;
        }
        out[40] = flags;
        out[41..CHUNK_INFO_SIZE].fill(0);
    }

    pub fn decode(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        let flags = *om_types::ensure_slice(data, offset + 40, 1)?.first().ok_or(
            ParseError::InvalidField {
                field: "chunk_flags",
                reason: "missing",
            },
        )?;
        Ok(Self {
            chunk_id: ChunkId(read_le_u32(data, offset)?),
            pdev_id: PdevId(read_le_u32(data, offset + 4)?),
            vdev_id: VdevId(read_le_u32(data, offset + 8)?),
            prev_chunk_id: ChunkId(read_le_u32(data, offset + 12)?),
            next_chunk_id: ChunkId(read_le_u32(data, offset + 16)?),
            primary_chunk_id: ChunkId(read_le_u32(data, offset + 20)?),
            start_offset: ByteOffset(read_le_u64(data, offset + 24)?),
            size: read_le_u64(data, offset + 32)?,
            slot_allocated: flags & FLAG_SLOT_ALLOCATED != 0,
            is_sb_chunk: flags & FLAG_SB_CHUNK != 0,
            busy: flags & FLAG_BUSY != 0,
        })
    }
}

impl fmt::Display for ChunkInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chunk_id={} pdev={} vdev={} start={} size={} busy={} sb={}",
            self.chunk_id,
            self.pdev_id,
            self.vdev_id.0,
            self.start_offset,
            self.size,
            self.is_busy(),
            self.is_sb_chunk,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let mut info = ChunkInfo::new(ChunkId(3), PdevId(1), ByteOffset(1 << 20), 16 << 20);
        info.vdev_id = VdevId(7);
        info.next_chunk_id = ChunkId(4);
        info.busy = true;
        let mut buf = [0_u8; CHUNK_INFO_SIZE];
        info.encode_into(&mut buf);
        let back = ChunkInfo::decode(&buf, 0).expect("decode");
        assert_eq!(info, back);
    }

    #[test]
    fn busy_accounts_for_sb_and_vdev() {
        let mut info = ChunkInfo::new(ChunkId(0), PdevId(0), ByteOffset(0), 4096);
        assert!(!info.is_busy());
        info.is_sb_chunk = true;
        assert!(info.is_busy());
        info.is_sb_chunk = false;
        info.vdev_id = VdevId(0);
        assert!(info.is_busy());
    }
}
