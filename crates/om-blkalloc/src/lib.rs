#![forbid(unsafe_code)]
//! Block allocators.
//!
//! Two variants implement a common contract over a chunk's block range:
//!
//! 1. **Fixed**: single-block allocations served from a bounded MPMC queue
//!    of free block ids, seeded from the persisted bitmap at init.
//! 2. **Varsize**: run allocations out of a portioned cache bitmap, with
//!    multi-piece fallback under caller hints.
//!
//! Three bitmaps per allocator: `disk_bm` (occupied as of the last
//! checkpoint), the authoritative in-memory cache, and an optional
//! `realtime_bm` shadow updated on every alloc/free and persisted more
//! frequently than the checkpoint.

pub mod bitmap;
pub mod fixed;
pub mod varsize;

pub use bitmap::Bitmap;
pub use fixed::FixedBlkAllocator;
pub use varsize::VarsizeBlkAllocator;

use om_error::Result;
use om_types::{BlkId, ChunkId, MultiBlkId};
use serde::{Deserialize, Serialize};

/// Default locking granule within an allocator bitmap.
pub const DEFAULT_BLKS_PER_PORTION: u32 = 8192;

/// Static configuration of one chunk's allocator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlkAllocConfig {
    pub chunk_id: ChunkId,
    pub total_blks: u32,
    pub blks_per_portion: u32,
    /// Maintain the realtime shadow bitmap on every alloc/free.
    pub realtime_bm_on: bool,
}

impl BlkAllocConfig {
    #[must_use]
    pub fn new(chunk_id: ChunkId, total_blks: u32) -> Self {
        Self {
            chunk_id,
            total_blks,
            blks_per_portion: DEFAULT_BLKS_PER_PORTION,
            realtime_bm_on: true,
        }
    }

    #[must_use]
    pub fn num_portions(&self) -> u32 {
        self.total_blks.div_ceil(self.blks_per_portion.max(1))
    }
}

/// Caller guidance for varsize allocations.
#[derive(Debug, Clone, Copy)]
pub struct BlkAllocHints {
    /// Maximum pieces a `MultiBlkId` result may carry.
    pub max_pieces: u32,
    /// Reject pieces smaller than this (except a shorter final remainder).
    pub min_blks_per_piece: u32,
}

impl Default for BlkAllocHints {
    fn default() -> Self {
        Self {
            max_pieces: 1,
            min_blks_per_piece: 1,
        }
    }
}

/// The closed set of allocator variants, dispatched as a tagged union.
pub enum BlkAllocator {
    Fixed(FixedBlkAllocator),
    Varsize(VarsizeBlkAllocator),
}

impl BlkAllocator {
    pub fn alloc(&self, nblks: u32, hints: &BlkAllocHints) -> Result<MultiBlkId> {
        match self {
            Self::Fixed(a) => a.alloc(nblks, hints),
            Self::Varsize(a) => a.alloc(nblks, hints),
        }
    }

    pub fn free(&self, bid: BlkId) -> Result<()> {
        match self {
            Self::Fixed(a) => a.free(bid),
            Self::Varsize(a) => a.free(bid),
        }
    }

    #[must_use]
    pub fn is_allocated(&self, bid: BlkId) -> bool {
        match self {
            Self::Fixed(a) => a.is_allocated(bid),
            Self::Varsize(a) => a.is_allocated(bid),
        }
    }

    #[must_use]
    pub fn available_blks(&self) -> u32 {
        match self {
            Self::Fixed(a) => a.available_blks(),
            Self::Varsize(a) => a.available_blks(),
        }
    }

    #[must_use]
    pub fn get_used_blks(&self) -> u32 {
        match self {
            Self::Fixed(a) => a.get_used_blks(),
            Self::Varsize(a) => a.get_used_blks(),
        }
    }

    #[must_use]
    pub fn total_blks(&self) -> u32 {
        match self {
            Self::Fixed(a) => a.total_blks(),
            Self::Varsize(a) => a.total_blks(),
        }
    }

    #[must_use]
    pub fn chunk_id(&self) -> ChunkId {
        match self {
            Self::Fixed(a) => a.chunk_id(),
            Self::Varsize(a) => a.chunk_id(),
        }
    }

    /// Snapshot the authoritative cache bitmap as the new checkpoint image.
    #[must_use]
    pub fn cp_take_disk_snapshot(&self) -> Vec<u8> {
        match self {
            Self::Fixed(a) => a.cp_take_disk_snapshot(),
            Self::Varsize(a) => a.cp_take_disk_snapshot(),
        }
    }

    /// Bytes of the realtime shadow, if enabled.
    #[must_use]
    pub fn realtime_bm_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Self::Fixed(a) => a.realtime_bm_bytes(),
            Self::Varsize(a) => a.realtime_bm_bytes(),
        }
    }
}
