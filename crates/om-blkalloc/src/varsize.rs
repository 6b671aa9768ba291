//! Variable-size allocator: run allocations out of a portioned cache bitmap.
//!
//! The block range is striped into portions, each guarded by its own lock;
//! a free run never crosses a portion boundary, so a search holds exactly
//! one portion lock at a time and allocator operations never block on I/O.

use crate::bitmap::Bitmap;
use crate::{BlkAllocConfig, BlkAllocHints};
use om_error::{OmError, Result};
use om_types::{BlkId, ChunkId, MultiBlkId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::{debug, trace};

struct Portion {
    start_blk: u32,
    nblks: u32,
    bm: Mutex<Bitmap>,
    free: AtomicU32,
}

pub struct VarsizeBlkAllocator {
    cfg: BlkAllocConfig,
    portions: Vec<Portion>,
    disk_bm: Mutex<Bitmap>,
    realtime_bm: Option<Mutex<Bitmap>>,
    inited: AtomicBool,
}

impl VarsizeBlkAllocator {
    /// Fresh allocator over an empty chunk; immediately serviceable.
    #[must_use]
    pub fn new(cfg: BlkAllocConfig) -> Self {
        let alloc = Self::with_disk_bm(cfg, None);
        alloc.inited();
        alloc
    }

    /// Allocator recovered against a persisted bitmap; call
    /// [`VarsizeBlkAllocator::inited`] before serving allocations.
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
        let per_portion = cfg.blks_per_portion.max(1);
        let mut portions = Vec::with_capacity(cfg.num_portions() as usize);
        let mut start = 0_u32;
        while start < total {
            let nblks = per_portion.min(total - start);
            portions.push(Portion {
                start_blk: start,
                nblks,
                bm: Mutex::new(Bitmap::new(nblks)),
                free: AtomicU32::new(0),
            });
            start += nblks;
        }
        debug!(
            target: "om::blkalloc",
            event = "varsize_new",
            chunk_id = cfg.chunk_id.0,
            total_blks = total,
            portions = portions.len(),
        );
        Self {
            cfg,
            portions,
            disk_bm: Mutex::new(disk_bm),
            realtime_bm,
            inited: AtomicBool::new(false),
        }
    }

    /// Copy the persisted bitmap into the cache portions and open for
    /// business. After recovery the cache equals the disk image; journal
    /// replay layers further allocations on top through `mark_allocated`.
    pub fn inited(&self) {
        if self.inited.swap(true, Ordering::AcqRel) {
            return;
        }
        let disk = self.disk_bm.lock();
        for portion in &self.portions {
            let mut bm = portion.bm.lock();
            let mut free = 0_u32;
            for i in 0..portion.nblks {
                if disk.is_set(portion.start_blk + i) {
                    bm.set_range(i, 1);
                } else {
                    free += 1;
                }
            }
            portion.free.store(free, Ordering::Release);
        }
    }

    /// Replay hook: force a range into the allocated state.
    pub fn mark_allocated(&self, bid: BlkId) -> Result<()> {
        let portion = self.portion_of(bid)?;
        let rel = bid.blk_num - portion.start_blk;
        let mut bm = portion.bm.lock();
        let newly_set = (rel..rel + bid.blk_count).filter(|&i| !bm.is_set(i)).count();
        bm.set_range(rel, bid.blk_count);
        portion
            .free
            .fetch_sub(u32::try_from(newly_set).unwrap_or(0), Ordering::AcqRel);
        self.shadow_set(bid, true);
        Ok(())
    }

    /// Allocate `nblks`, contiguously when possible.
    ///
    /// With `hints.max_pieces > 1` the result may be split into pieces, each
    /// at least `hints.min_blks_per_piece` blocks (a shorter final remainder
    /// is allowed). Candidate runs are taken lowest start block first.
    pub fn alloc(&self, nblks: u32, hints: &BlkAllocHints) -> Result<MultiBlkId> {
        if nblks == 0 || nblks > self.cfg.total_blks {
            return Err(OmError::SpaceFull);
        }

        if let Some(bid) = self.try_alloc_contiguous(nblks) {
            return Ok(MultiBlkId::single(bid));
        }
        if hints.max_pieces <= 1 {
            return Err(OmError::SpaceFull);
        }
        self.alloc_pieces(nblks, hints)
    }

    /// Single contiguous run or nothing.
    pub fn alloc_contiguous(&self, nblks: u32) -> Result<BlkId> {
        self.try_alloc_contiguous(nblks).ok_or(OmError::SpaceFull)
    }

    fn try_alloc_contiguous(&self, nblks: u32) -> Option<BlkId> {
        for portion in &self.portions {
            if portion.free.load(Ordering::Acquire) < nblks {
                continue;
            }
            let mut bm = portion.bm.lock();
            if let Some(rel) = bm.find_contiguous(nblks, 0) {
                bm.set_range(rel, nblks);
                portion.free.fetch_sub(nblks, Ordering::AcqRel);
                let bid = BlkId::new(self.cfg.chunk_id, portion.start_blk + rel, nblks);
                drop(bm);
                self.shadow_set(bid, true);
                trace!(target: "om::blkalloc", event = "varsize_alloc", %bid);
                return Some(bid);
            }
        }
        None
    }

    fn alloc_pieces(&self, nblks: u32, hints: &BlkAllocHints) -> Result<MultiBlkId> {
        let mut out = MultiBlkId::new();
        let mut remaining = nblks;

        'portions: for portion in &self.portions {
            if remaining == 0 {
                break;
            }
            if portion.free.load(Ordering::Acquire) == 0 {
                continue;
            }
            let mut bm = portion.bm.lock();
            let mut search = 0_u32;
            while remaining > 0 {
                if out.num_pieces() >= hints.max_pieces as usize {
                    break 'portions;
                }
                let min_piece = hints.min_blks_per_piece.max(1).min(remaining);
                let Some((run_start, run_len)) = bm.first_free_run(search, remaining) else {
                    break;
                };
                if run_len < min_piece {
                    search = run_start + run_len;
                    continue;
                }
                bm.set_range(run_start, run_len);
                portion.free.fetch_sub(run_len, Ordering::AcqRel);
                out.add(BlkId::new(
                    self.cfg.chunk_id,
                    portion.start_blk + run_start,
                    run_len,
                ));
                remaining -= run_len;
                search = run_start + run_len;
            }
        }

        if remaining > 0 {
            // Unwind partial progress; nothing escapes a failed allocation.
            for bid in out.iter() {
                self.clear_range_internal(*bid);
            }
            return Err(OmError::SpaceFull);
        }
        for bid in out.iter() {
            self.shadow_set(*bid, true);
        }
        trace!(
            target: "om::blkalloc",
            event = "varsize_alloc_pieces",
            pieces = out.num_pieces(),
            nblks,
        );
        Ok(out)
    }

    pub fn free(&self, bid: BlkId) -> Result<()> {
        let portion = self.portion_of(bid)?;
        let rel = bid.blk_num - portion.start_blk;
        {
            let mut bm = portion.bm.lock();
            if !bm.is_range_set(rel, bid.blk_count) {
                return Err(OmError::InvalidBlkId {
                    detail: format!("free of unallocated {bid}"),
                });
            }
            bm.clear_range(rel, bid.blk_count);
        }
        portion.free.fetch_add(bid.blk_count, Ordering::AcqRel);
        self.shadow_set(bid, false);
        Ok(())
    }

    #[must_use]
    pub fn is_allocated(&self, bid: BlkId) -> bool {
        let Ok(portion) = self.portion_of(bid) else {
            return false;
        };
        let rel = bid.blk_num - portion.start_blk;
        portion.bm.lock().is_range_set(rel, bid.blk_count)
    }

    #[must_use]
    pub fn available_blks(&self) -> u32 {
        self.portions
            .iter()
            .map(|p| p.free.load(Ordering::Acquire))
            .sum()
    }

    #[must_use]
    pub fn get_used_blks(&self) -> u32 {
        self.cfg.total_blks - self.available_blks()
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
        let mut snapshot = Bitmap::new(self.cfg.total_blks);
        for portion in &self.portions {
            let bm = portion.bm.lock();
            for i in 0..portion.nblks {
                if bm.is_set(i) {
                    snapshot.set_range(portion.start_blk + i, 1);
                }
            }
        }
        let mut disk = self.disk_bm.lock();
        *disk = snapshot;
        disk.to_bytes()
    }

    #[must_use]
    pub fn realtime_bm_bytes(&self) -> Option<Vec<u8>> {
        self.realtime_bm.as_ref().map(|rt| rt.lock().to_bytes())
    }

    fn portion_of(&self, bid: BlkId) -> Result<&Portion> {
        if bid.chunk_id != self.cfg.chunk_id || bid.blk_count == 0 {
            return Err(OmError::InvalidBlkId {
                detail: format!("{bid} does not belong to chunk {}", self.cfg.chunk_id),
            });
        }
        let per_portion = self.cfg.blks_per_portion.max(1);
        let idx = (bid.blk_num / per_portion) as usize;
        let portion = self.portions.get(idx).ok_or_else(|| OmError::InvalidBlkId {
            detail: format!("{bid} out of range"),
        })?;
        let rel = bid.blk_num - portion.start_blk;
        if rel + bid.blk_count > portion.nblks {
            return Err(OmError::InvalidBlkId {
                detail: format!("{bid} crosses portion boundary"),
            });
        }
        Ok(portion)
    }

    fn clear_range_internal(&self, bid: BlkId) {
        if let Ok(portion) = self.portion_of(bid) {
            let rel = bid.blk_num - portion.start_blk;
            portion.bm.lock().clear_range(rel, bid.blk_count);
            portion.free.fetch_add(bid.blk_count, Ordering::AcqRel);
        }
    }

    fn shadow_set(&self, bid: BlkId, allocated: bool) {
        if let Some(rt) = &self.realtime_bm {
            let mut rt = rt.lock();
            if allocated {
                rt.set_range(bid.blk_num, bid.blk_count);
            } else {
                rt.clear_range(bid.blk_num, bid.blk_count);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(total: u32) -> BlkAllocConfig {
        let mut cfg = BlkAllocConfig::new(ChunkId(2), total);
        cfg.blks_per_portion = 64;
        cfg
    }

    #[test]
    fn contiguous_takes_lowest_start() {
        let alloc = VarsizeBlkAllocator::new(cfg(256));
        let a = alloc.alloc(16, &BlkAllocHints::default()).expect("a");
        assert_eq!(a.num_pieces(), 1);
        assert_eq!(a.pieces()[0].blk_num, 0);
        let b = alloc.alloc(16, &BlkAllocHints::default()).expect("b");
        assert_eq!(b.pieces()[0].blk_num, 16);
    }

    #[test]
    fn freed_hole_is_reused_first() {
        let alloc = VarsizeBlkAllocator::new(cfg(256));
        let a = alloc.alloc_contiguous(16).expect("a");
        let _b = alloc.alloc_contiguous(16).expect("b");
        alloc.free(a).expect("free a");
        let c = alloc.alloc_contiguous(8).expect("c");
        assert_eq!(c.blk_num, 0);
    }

    #[test]
    fn multi_piece_fallback() {
        let alloc = VarsizeBlkAllocator::new(cfg(64));
        // Fragment: occupy blocks so only runs of 8 remain at 8..16 and 24..32.
        let all = alloc.alloc_contiguous(64).expect("all");
        alloc.free(BlkId::new(ChunkId(2), 8, 8)).expect("hole 1");
        alloc.free(BlkId::new(ChunkId(2), 24, 8)).expect("hole 2");

        // Contiguous 16 is impossible; two pieces of 8 satisfy it.
        assert!(alloc.alloc(16, &BlkAllocHints::default()).is_err());
        let hints = BlkAllocHints {
            max_pieces: 4,
            min_blks_per_piece: 4,
        };
        let got = alloc.alloc(16, &hints).expect("pieces");
        assert_eq!(got.num_pieces(), 2);
        assert_eq!(got.blk_count(), 16);
        let _ = all;
    }

    #[test]
    fn min_piece_size_rejects_tiny_runs() {
        let alloc = VarsizeBlkAllocator::new(cfg(64));
        let _all = alloc.alloc_contiguous(64).expect("all");
        // Two free runs of 2 blocks each.
        alloc.free(BlkId::new(ChunkId(2), 10, 2)).expect("hole 1");
        alloc.free(BlkId::new(ChunkId(2), 20, 2)).expect("hole 2");

        let hints = BlkAllocHints {
            max_pieces: 4,
            min_blks_per_piece: 4,
        };
        // No piece of at least 4 exists; partial progress must unwind.
        let before = alloc.available_blks();
        assert!(alloc.alloc(4, &hints).is_err());
        assert_eq!(alloc.available_blks(), before);
    }

    #[test]
    fn piece_budget_respected() {
        let alloc = VarsizeBlkAllocator::new(cfg(64));
        let _all = alloc.alloc_contiguous(64).expect("all");
        for start in [4_u32, 12, 20, 28] {
            alloc.free(BlkId::new(ChunkId(2), start, 2)).expect("hole");
        }
        let hints = BlkAllocHints {
            max_pieces: 2,
            min_blks_per_piece: 1,
        };
        // Eight free blocks exist but only in four 2-block runs; a 2-piece
        // budget cannot cover 8 blocks.
        assert!(alloc.alloc(8, &hints).is_err());
        let got = alloc.alloc(4, &hints).expect("two pieces of two");
        assert_eq!(got.num_pieces(), 2);
    }

    #[test]
    fn accounting_invariant_holds() {
        let alloc = VarsizeBlkAllocator::new(cfg(128));
        let a = alloc.alloc(10, &BlkAllocHints::default()).expect("a");
        let b = alloc.alloc(20, &BlkAllocHints::default()).expect("b");
        assert_eq!(alloc.available_blks() + alloc.get_used_blks(), 128);
        for bid in a.iter() {
            alloc.free(*bid).expect("free a");
        }
        assert_eq!(alloc.available_blks() + alloc.get_used_blks(), 128);
        for bid in b.iter() {
            assert!(alloc.is_allocated(*bid));
        }
    }

    #[test]
    fn free_of_unallocated_is_invalid() {
        let alloc = VarsizeBlkAllocator::new(cfg(64));
        let err = alloc.free(BlkId::new(ChunkId(2), 0, 4)).unwrap_err();
        assert!(matches!(err, OmError::InvalidBlkId { .. }));
        let err = alloc.free(BlkId::new(ChunkId(9), 0, 4)).unwrap_err();
        assert!(matches!(err, OmError::InvalidBlkId { .. }));
    }

    #[test]
    fn recovery_then_replay() {
        let alloc = VarsizeBlkAllocator::new(cfg(64));
        let a = alloc.alloc_contiguous(8).expect("a");
        let snapshot = alloc.cp_take_disk_snapshot();

        // Allocation after the checkpoint, present only in a journal.
        let b = alloc.alloc_contiguous(8).expect("b");

        let recovered = VarsizeBlkAllocator::recover(cfg(64), &snapshot);
        recovered.inited();
        assert!(recovered.is_allocated(a));
        assert!(!recovered.is_allocated(b));
        // Journal replay brings the cache to disk ∪ replayed ops.
        recovered.mark_allocated(b).expect("replay");
        assert!(recovered.is_allocated(b));
        assert_eq!(recovered.available_blks(), 64 - 16);
    }
}
