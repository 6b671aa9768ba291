//! Per-pdev superblock area layout.
//!
//! ```text
//! [0 .. 4096)        first block
//! [.. +vdev_sb)      vdev info table (max_vdevs slots)
//! [.. +chunk_bm)     chunk-slot bitmap (1 bit per slot, 4 KiB rounded)
//! [.. +chunk_tbl)    chunk info table
//! [.. +padding)      future-reserved (8 MiB data / 1 MiB fast)
//! [data_offset ..)   payload region (chunks live here)
//! ```

use om_types::{align_up, max_chunks_in_pdev, ByteOffset, DevClass, FIRST_BLOCK_SIZE};

use crate::chunk::CHUNK_INFO_SIZE;
use crate::manager::VDEV_INFO_SIZE;

/// Static layout of one pdev, derived from its size, class and limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdevLayout {
    pub max_pdev_chunks: u32,
    pub vdev_sb_size: u64,
    pub chunk_bitmap_size: u64,
    pub chunk_table_size: u64,
    pub future_padding_size: u64,
    pub data_offset: ByteOffset,
}

impl PdevLayout {
    /// Compute the layout for a pdev of `dev_size` bytes.
    ///
    /// `data_offset` is rounded up to the physical page size so every
    /// chunk starts page-aligned.
    #[must_use]
    pub fn compute(dev_size: u64, class: DevClass, max_vdevs: u32, phys_page_size: u32) -> Self {
        let max_pdev_chunks = max_chunks_in_pdev(dev_size, class);
        let vdev_sb_size = u64::from(max_vdevs) * VDEV_INFO_SIZE as u64;
        let chunk_bitmap_size = align_up(u64::from(max_pdev_chunks.max(8)).div_ceil(8), 4096)
            .unwrap_or(4096);
        let chunk_table_size = u64::from(max_pdev_chunks) * CHUNK_INFO_SIZE as u64;
        let future_padding_size = class.future_padding_size();
        let used = FIRST_BLOCK_SIZE as u64
            + vdev_sb_size
            + chunk_bitmap_size
            + chunk_table_size
            + future_padding_size;
        let data_offset = ByteOffset(align_up(used, u64::from(phys_page_size)).unwrap_or(used));
        Self {
            max_pdev_chunks,
            vdev_sb_size,
            chunk_bitmap_size,
            chunk_table_size,
            future_padding_size,
            data_offset,
        }
    }

    /// Bytes of the payload region.
    #[must_use]
    pub fn data_size(&self, dev_size: u64) -> u64 {
        dev_size.saturating_sub(self.data_offset.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_offset_page_aligned_and_past_header() {
        let layout = PdevLayout::compute(1 << 30, DevClass::Data, 1024, 4096);
        assert_eq!(layout.data_offset.0 % 4096, 0);
        assert!(layout.data_offset.0 > FIRST_BLOCK_SIZE as u64);
        assert!(layout.data_size(1 << 30) > 0);
    }

    #[test]
    fn fast_class_reserves_less_padding() {
        let data = PdevLayout::compute(1 << 30, DevClass::Data, 1024, 4096);
        let fast = PdevLayout::compute(1 << 30, DevClass::Fast, 1024, 4096);
        assert!(fast.future_padding_size < data.future_padding_size);
        assert!(fast.max_pdev_chunks < data.max_pdev_chunks);
    }

    #[test]
    fn bitmap_rounded_to_page() {
        let layout = PdevLayout::compute(1 << 30, DevClass::Data, 1024, 4096);
        assert_eq!(layout.chunk_bitmap_size % 4096, 0);
        assert!(layout.chunk_bitmap_size >= 4096);
    }
}
