#![forbid(unsafe_code)]
//! Shared identifiers, on-disk constants, and codec helpers for OmStore.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Magic written as the first bytes of every formatted physical device.
pub const OMSTORE_MAGIC: u32 = 0xCEED_DEEB;

/// Product string stamped into the first block.
pub const PRODUCT_NAME: &str = "OmStore";

/// Size of the product name field in the first block (NUL padded).
pub const PRODUCT_NAME_SIZE: usize = 64;

/// First block on-disk format version.
pub const SUPERBLOCK_VERSION: u32 = 4;

/// Size of the I/O unit used for the first block (with padding).
pub const FIRST_BLOCK_SIZE: usize = 4096;

/// Minimum chunk size on a data-class device.
pub const MIN_CHUNK_SIZE_DATA: u64 = 16 * 1024 * 1024;

/// Minimum chunk size on a fast-class device.
pub const MIN_CHUNK_SIZE_FAST: u64 = 32 * 1024 * 1024;

/// Maximum number of chunks across all devices (BlkId addressing limit).
pub const MAX_CHUNKS_IN_SYSTEM: u32 = 65536;

/// Maximum number of virtual devices in the system.
pub const MAX_VDEVS_IN_SYSTEM: u32 = 1024;

/// Future-reserved padding after the superblock area, data-class devices.
pub const EXTRA_SB_SIZE_DATA: u64 = 8 * 1024 * 1024;

/// Future-reserved padding after the superblock area, fast-class devices.
pub const EXTRA_SB_SIZE_FAST: u64 = 1024 * 1024;

/// Device class. Fast devices trade superblock area for fewer, larger chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DevClass {
    Data,
    Fast,
}

impl DevClass {
    #[must_use]
    pub fn min_chunk_size(self) -> u64 {
        match self {
            Self::Data => MIN_CHUNK_SIZE_DATA,
            Self::Fast => MIN_CHUNK_SIZE_FAST,
        }
    }

    #[must_use]
    pub fn future_padding_size(self) -> u64 {
        match self {
            Self::Data => EXTRA_SB_SIZE_DATA,
            Self::Fast => EXTRA_SB_SIZE_FAST,
        }
    }
}

// ── Identifiers ─────────────────────────────────────────────────────────────

/// Physical device id, unique within a system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PdevId(pub u32);

impl PdevId {
    pub const INVALID: Self = Self(u32::MAX);

    #[must_use]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// Virtual device id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VdevId(pub u32);

impl VdevId {
    pub const INVALID: Self = Self(u32::MAX);

    #[must_use]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// System-unique chunk id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId(pub u32);

impl ChunkId {
    pub const INVALID: Self = Self(u32::MAX);

    #[must_use]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

/// Byte offset on a physical device (pread/pwrite semantics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Round up to the nearest multiple of `alignment`.
    #[must_use]
    pub fn align_up(self, alignment: u64) -> Option<Self> {
        align_up(self.0, alignment).map(Self)
    }
}

// ── Block identifiers ───────────────────────────────────────────────────────

/// Names an allocation within a chunk: `(chunk_id, blk_num, blk_count)`.
///
/// Fixed across its lifetime; the triple uniquely identifies the allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlkId {
    pub chunk_id: ChunkId,
    pub blk_num: u32,
    pub blk_count: u32,
}

impl BlkId {
    pub const INVALID: Self = Self {
        chunk_id: ChunkId::INVALID,
        blk_num: 0,
        blk_count: 0,
    };

    #[must_use]
    pub fn new(chunk_id: ChunkId, blk_num: u32, blk_count: u32) -> Self {
        Self {
            chunk_id,
            blk_num,
            blk_count,
        }
    }

    #[must_use]
    pub fn is_valid(self) -> bool {
        self.chunk_id.is_valid() && self.blk_count > 0
    }

    /// One block past the end of this allocation.
    #[must_use]
    pub fn end_blk_num(self) -> u32 {
        self.blk_num.saturating_add(self.blk_count)
    }

    /// Whether this id and `other` name overlapping blocks of the same chunk.
    #[must_use]
    pub fn overlaps(self, other: Self) -> bool {
        self.chunk_id == other.chunk_id
            && self.blk_num < other.end_blk_num()
            && other.blk_num < self.end_blk_num()
    }

    /// Pack into a fixed 12-byte little-endian representation.
    #[must_use]
    pub fn encode(self) -> [u8; 12] {
        let mut out = [0_u8; 12];
        out[0..4].copy_from_slice(&self.chunk_id.0.to_le_bytes());
        out[4..8].copy_from_slice(&self.blk_num.to_le_bytes());
        out[8..12].copy_from_slice(&self.blk_count.to_le_bytes());
        out
    }

    /// Decode from the representation produced by [`BlkId::encode`].
    pub fn decode(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            chunk_id: ChunkId(read_le_u32(data, offset)?),
            blk_num: read_le_u32(data, offset + 4)?,
            blk_count: read_le_u32(data, offset + 8)?,
        })
    }

    pub const ENCODED_SIZE: usize = 12;
}

impl fmt::Display for BlkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chunk={} blk={} nblks={}",
            self.chunk_id.0, self.blk_num, self.blk_count
        )
    }
}

/// Ordered list of [`BlkId`] pieces produced when an allocation could not be
/// satisfied contiguously.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiBlkId {
    pieces: Vec<BlkId>,
}

impl MultiBlkId {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn single(bid: BlkId) -> Self {
        Self { pieces: vec![bid] }
    }

    pub fn add(&mut self, bid: BlkId) {
        self.pieces.push(bid);
    }

    #[must_use]
    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pieces.is_empty()
    }

    /// Total number of blocks across all pieces.
    #[must_use]
    pub fn blk_count(&self) -> u32 {
        self.pieces.iter().map(|p| p.blk_count).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlkId> {
        self.pieces.iter()
    }

    #[must_use]
    pub fn pieces(&self) -> &[BlkId] {
        &self.pieces
    }

    #[must_use]
    pub fn into_pieces(self) -> Vec<BlkId> {
        self.pieces
    }
}

impl fmt::Display for MultiBlkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, p) in self.pieces.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{p}")?;
        }
        write!(f, "]")
    }
}

impl fmt::Display for PdevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for VdevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Parse errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Read a NUL-padded fixed-width string field.
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

// ── Checked arithmetic and alignment ────────────────────────────────────────

/// Round `value` down to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` otherwise.
#[must_use]
pub fn align_down(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    Some(value & !(alignment - 1))
}

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a non-zero power of two; returns `None` on overflow
/// or if `alignment` is invalid.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Narrow a `u64` to `u32` with an explicit error path.
pub fn u64_to_u32(value: u64, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Maximum chunk slots a pdev of `dev_size` can carry, given its class.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // bounded by MAX_CHUNKS_IN_SYSTEM
pub fn max_chunks_in_pdev(dev_size: u64, class: DevClass) -> u32 {
    let per_chunk = class.min_chunk_size();
    let raw = (dev_size.saturating_sub(1)) / per_chunk + 1;
    raw.min(u64::from(MAX_CHUNKS_IN_SYSTEM)) as u32
}
