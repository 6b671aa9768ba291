//! Fixed-size allocator: every allocation is exactly one block.
//!
//! Free blocks live in a bounded lock-free MPMC queue sized to the chunk's
//! total block count. `inited()` walks each portion under its lock,
//! consults the persisted bitmap, and pushes free blocks to the queue.

use crate::bitmap::Bitmap;
use crate::{BlkAllocConfig, BlkAllocHints};
use crossbeam_queue::ArrayQueue;
use om_error::{OmError, Result};
use om_types::{BlkId, ChunkId, MultiBlkId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

pub struct FixedBlkAllocator {
    cfg: BlkAllocConfig,
    blk_q: ArrayQueue<BlkId>,
    /// Authoritative occupied set, portion-striped locking is not needed on
    /// the queue path; the bitmap keeps `is_allocated` exact.
    cache_bm: Mutex<Bitmap>,
    disk_bm: Mutex<Bitmap>,
    realtime_bm: Option<Mutex<Bitmap>>,
    inited: AtomicBool,
}

impl FixedBlkAllocator {
    /// Fresh allocator over an empty chunk; immediately serviceable.
    #[must_use]
    pub fn new(cfg: BlkAllocConfig) -> Self {
        let alloc = Self::with_disk_bm(cfg, None);
        alloc.inited();
        alloc
    }

    /// Allocator recovered against a persisted bitmap. Not serviceable until
    /// [`FixedBlkAllocator::inited`] seeds the free queue.
    #[must_use]
    pub fn recover(cfg: BlkAllocConfig, disk_bm_bytes: &[u8]) -> Self {
        Self::with_disk_bm(cfg, Some(disk_bm_bytes))
    }

    fn with_disk_bm(cfg: BlkAllocConfig, disk_bm_bytes: Option<&[u8]>) -> Self {
        let total = cfg.total_blks;
        let disk_bm = disk_bm_bytes.map_or_else(
            || Bitmap::new(total),
            |bytes| Bitmap::from_bytes(bytes, total),
        );
        let realtime_bm = cfg.realtime_bm_on.then(|| Mutex::new(disk_bm.clone()));
        debug!(
            target: "om::blkalloc",
            event = "fixed_new",
            chunk_id = cfg.chunk_id.0,
            total_blks = total,
        );
        Self {
            blk_q: ArrayQueue::new(total.max(1) as usize),
            cache_bm: Mutex::new(Bitmap::new(total)),
            disk_bm: Mutex::new(disk_bm),
            realtime_bm,
            cfg,
            inited: AtomicBool::new(false),
        }
    }

    /// Seed the free queue from the persisted bitmap, one portion at a time.
    pub fn inited(&self) {
        if self.inited.swap(true, Ordering::AcqRel) {
            return;
        }
        let disk = self.disk_bm.lock();
        let mut cache = self.cache_bm.lock();
        let per_portion = self.cfg.blks_per_portion.max(1);
        let mut blk_num = 0_u32;
        while blk_num < self.cfg.total_blks {
            let portion_end = (blk_num + per_portion).min(self.cfg.total_blks);
            for blk in blk_num..portion_end {
                if disk.is_set(blk) {
                    cache.set_range(blk, 1);
                } else {
                    let pushed = self
                        .blk_q
                        .push(BlkId::new(self.cfg.chunk_id, blk, 1))
                        .is_ok();
                    debug_assert!(pushed, "fixed capacity queue overflow at init");
                }
            }
            blk_num = portion_end;
        }
        debug!(
            target: "om::blkalloc",
            event = "fixed_inited",
            chunk_id = self.cfg.chunk_id.0,
            free = self.blk_q.len(),
        );
    }

    /// Pop one free block.
    pub fn alloc_contiguous(&self) -> Result<BlkId> {
        let Some(bid) = self.blk_q.pop() else {
            return Err(OmError::SpaceFull);
        };
        self.cache_bm.lock().set_range(bid.blk_num, 1);
        if let Some(rt) = &self.realtime_bm {
            rt.lock().set_range(bid.blk_num, 1);
        }
        trace!(target: "om::blkalloc", event = "fixed_alloc", blk = bid.blk_num);
        Ok(bid)
    }

    /// The fixed variant only hands out single blocks.
    pub fn alloc(&self, nblks: u32, _hints: &BlkAllocHints) -> Result<MultiBlkId> {
        if nblks != 1 {
            return Err(OmError::InvalidBlkId {
                detail: format!("fixed allocator cannot serve {nblks}-block requests"),
            });
        }
        Ok(MultiBlkId::single(self.alloc_contiguous()?))
    }

    pub fn free(&self, bid: BlkId) -> Result<()> {
        if bid.blk_count != 1 || bid.chunk_id != self.cfg.chunk_id {
            return Err(OmError::InvalidBlkId {
                detail: format!("fixed free of {bid}"),
            });
        }
        {
            let mut cache = self.cache_bm.lock();
            if bid.blk_num >= self.cfg.total_blks || !cache.is_set(bid.blk_num) {
                return Err(OmError::InvalidBlkId {
                    detail: format!("free of unallocated {bid}"),
                });
            }
            cache.clear_range(bid.blk_num, 1);
        }
        if let Some(rt) = &self.realtime_bm {
            rt.lock().clear_range(bid.blk_num, 1);
        }
        // Before init the disk bitmap is still authoritative; recovery will
        // reseed the queue.
        if self.inited.load(Ordering::Acquire) {
            let pushed = self.blk_q.push(bid).is_ok();
            debug_assert!(pushed, "fixed capacity queue overflow on free");
        }
        Ok(())
    }

    #[must_use]
    pub fn is_allocated(&self, bid: BlkId) -> bool {
        bid.chunk_id == self.cfg.chunk_id
            && self.cache_bm.lock().is_range_set(bid.blk_num, bid.blk_count)
    }

    #[must_use]
    pub fn available_blks(&self) -> u32 {
        u32::try_from(self.blk_q.len()).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn get_used_blks(&self) -> u32 {
        self.total_blks() - self.available_blks()
    }

    #[must_use]
    pub fn total_blks(&self) -> u32 {
        self.cfg.total_blks
    }

    #[must_use]
    pub fn chunk_id(&self) -> ChunkId {
        self.cfg.chunk_id
    }

    #[must_use]
    pub fn cp_take_disk_snapshot(&self) -> Vec<u8> {
        let cache = self.cache_bm.lock();
        let mut disk = self.disk_bm.lock();
        *disk = cache.clone();
        disk.to_bytes()
    }

    #[must_use]
    pub fn realtime_bm_bytes(&self) -> Option<Vec<u8>> {
        self.realtime_bm.as_ref().map(|rt| rt.lock().to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(total: u32) -> BlkAllocConfig {
        BlkAllocConfig::new(ChunkId(1), total)
    }

    #[test]
    fn exhaustion_and_reuse() {
        let n = 32_u32;
        let alloc = FixedBlkAllocator::new(cfg(n));

        let mut got = Vec::new();
        for _ in 0..n {
            got.push(alloc.alloc_contiguous().expect("alloc"));
        }
        assert!(matches!(alloc.alloc_contiguous(), Err(OmError::SpaceFull)));
        assert_eq!(alloc.available_blks(), 0);
        assert_eq!(alloc.get_used_blks(), n);

        alloc.free(got[5]).expect("free");
        let again = alloc.alloc_contiguous().expect("after one free");
        assert_eq!(again, got[5]);
        assert!(matches!(alloc.alloc_contiguous(), Err(OmError::SpaceFull)));
    }

    #[test]
    fn available_plus_used_is_total() {
        let alloc = FixedBlkAllocator::new(cfg(100));
        let a = alloc.alloc_contiguous().expect("a");
        let _b = alloc.alloc_contiguous().expect("b");
        assert_eq!(alloc.available_blks() + alloc.get_used_blks(), 100);
        alloc.free(a).expect("free");
        assert_eq!(alloc.available_blks() + alloc.get_used_blks(), 100);
    }

    #[test]
    fn is_allocated_tracks_outstanding() {
        let alloc = FixedBlkAllocator::new(cfg(8));
        let bid = alloc.alloc_contiguous().expect("alloc");
        assert!(alloc.is_allocated(bid));
        alloc.free(bid).expect("free");
        assert!(!alloc.is_allocated(bid));
    }

    #[test]
    fn double_free_rejected() {
        let alloc = FixedBlkAllocator::new(cfg(8));
        let bid = alloc.alloc_contiguous().expect("alloc");
        alloc.free(bid).expect("first free");
        assert!(matches!(
            alloc.free(bid),
            Err(OmError::InvalidBlkId { .. })
        ));
    }

    #[test]
    fn multi_block_request_rejected() {
        let alloc = FixedBlkAllocator::new(cfg(8));
        assert!(alloc.alloc(2, &BlkAllocHints::default()).is_err());
    }

    #[test]
    fn recovery_respects_disk_bitmap() {
        let mut disk = Bitmap::new(16);
        disk.set_range(0, 4);
        disk.set_range(10, 2);
        let alloc = FixedBlkAllocator::recover(cfg(16), &disk.to_bytes());
        alloc.inited();
        assert_eq!(alloc.available_blks(), 10);
        assert!(alloc.is_allocated(BlkId::new(ChunkId(1), 0, 1)));
        assert!(!alloc.is_allocated(BlkId::new(ChunkId(1), 5, 1)));
        // Every popped block must come from the free set.
        for _ in 0..10 {
            let bid = alloc.alloc_contiguous().expect("alloc");
            assert!(!(bid.blk_num < 4 || (10..12).contains(&bid.blk_num)));
        }
        assert!(alloc.alloc_contiguous().is_err());
    }

    #[test]
    fn realtime_bitmap_shadows_ops() {
        let alloc = FixedBlkAllocator::new(cfg(8));
        let bid = alloc.alloc_contiguous().expect("alloc");
        let rt = Bitmap::from_bytes(&alloc.realtime_bm_bytes().expect("rt"), 8);
        assert!(rt.is_set(bid.blk_num));
        alloc.free(bid).expect("free");
        let rt = Bitmap::from_bytes(&alloc.realtime_bm_bytes().expect("rt"), 8);
        assert!(!rt.is_set(bid.blk_num));
    }

    #[test]
    fn checkpoint_snapshot_matches_cache() {
        let alloc = FixedBlkAllocator::new(cfg(8));
        let bid = alloc.alloc_contiguous().expect("alloc");
        let snap = Bitmap::from_bytes(&alloc.cp_take_disk_snapshot(), 8);
        assert!(snap.is_set(bid.blk_num));
        assert_eq!(snap.count_free(), 7);
    }
}
