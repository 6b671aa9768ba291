#![forbid(unsafe_code)]
//! Block data service: asynchronous write/read/free over allocator-assigned
//! block ids.
//!
//! `async_alloc_write` asks the allocators for space, translates block ids
//! to `(endpoint, offset)` pairs and issues one write per contiguous piece;
//! the returned future resolves when every piece completed. A free is
//! observed as completed strictly after all reads of the same blocks that
//! were in flight when the free was issued.

use bytes::Bytes;
use om_blkalloc::{BlkAllocConfig, BlkAllocHints, VarsizeBlkAllocator};
use om_cache::{Cache, Fingerprint};
use om_device::VirtualDev;
use om_error::{OmError, Result};
use om_types::{BlkId, ChunkId, MultiBlkId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Scatter-gather list: an ordered set of buffers forming one logical
/// payload.
#[derive(Debug, Clone, Default)]
pub struct SgList {
    pub iovs: Vec<Bytes>,
}

impl SgList {
    #[must_use]
    pub fn single(data: Bytes) -> Self {
        Self { iovs: vec![data] }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.iovs.iter().map(Bytes::len).sum()
    }

    /// Concatenate into one contiguous buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        if self.iovs.len() == 1 {
            return self.iovs[0].clone();
        }
        let mut out = Vec::with_capacity(self.size());
        for iov in &self.iovs {
            out.extend_from_slice(iov);
        }
        Bytes::from(out)
    }
}

/// The block data service over one data vdev.
pub struct BlkDataService {
    vdev: Arc<VirtualDev>,
    allocators: Vec<Arc<VarsizeBlkAllocator>>,
    /// Outstanding read counts per exact block id.
    inflight_reads: Mutex<HashMap<BlkId, usize>>,
    read_drained: Notify,
    cache: Option<Arc<Cache>>,
}

impl BlkDataService {
    /// Stand up the service over a freshly created vdev.
    pub fn new(vdev: Arc<VirtualDev>) -> Result<Self> {
        Self::build(vdev, None)
    }

    /// Recover against checkpointed allocator bitmaps keyed by chunk.
    pub fn recover(vdev: Arc<VirtualDev>, bitmaps: &HashMap<ChunkId, Vec<u8>>) -> Result<Self> {
        Self::build(vdev, Some(bitmaps))
    }

    fn build(
        vdev: Arc<VirtualDev>,
        bitmaps: Option<&HashMap<ChunkId, Vec<u8>>>,
    ) -> Result<Self> {
        let mut allocators = Vec::with_capacity(vdev.num_chunks());
        for c in vdev.chunks() {
            let total = vdev.total_blks(c.chunk_id)?;
            let cfg = BlkAllocConfig::new(c.chunk_id, total);
            let alloc = match bitmaps.and_then(|m| m.get(&c.chunk_id)) {
                Some(bytes) => {
                    let a = VarsizeBlkAllocator::recover(cfg, bytes);
                    a.inited();
                    a
                }
                None => VarsizeBlkAllocator::new(cfg),
            };
            allocators.push(Arc::new(alloc));
        }
        debug!(
            target: "om::data",
            event = "service_up",
            vdev = vdev.vdev_id().0,
            chunks = allocators.len(),
        );
        Ok(Self {
            vdev,
            allocators,
            inflight_reads: Mutex::new(HashMap::new()),
            read_drained: Notify::new(),
            cache: None,
        })
    }

    /// Invalidate cache records of freed blocks through this cache.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn get_blk_size(&self) -> u32 {
        self.vdev.blk_size()
    }

    #[must_use]
    pub fn available_blks(&self) -> u32 {
        self.allocators.iter().map(|a| a.available_blks()).sum()
    }

    #[must_use]
    pub fn get_used_blks(&self) -> u32 {
        self.allocators.iter().map(|a| a.get_used_blks()).sum()
    }

    #[must_use]
    pub fn is_allocated(&self, bid: BlkId) -> bool {
        self.allocator_of(bid.chunk_id)
            .map(|a| a.is_allocated(bid))
            .unwrap_or(false)
    }

    /// Checkpoint hook: snapshot every chunk's cache bitmap.
    #[must_use]
    pub fn cp_take_snapshots(&self) -> HashMap<ChunkId, Vec<u8>> {
        self.allocators
            .iter()
            .map(|a| (a.chunk_id(), a.cp_take_disk_snapshot()))
            .collect()
    }

    /// Replay hook: re-apply an allocation found in a higher-level journal.
    pub fn mark_allocated(&self, bid: &MultiBlkId) -> Result<()> {
        for piece in bid.iter() {
            self.allocator_of(piece.chunk_id)
                .ok_or_else(|| invalid(*piece))?
                .mark_allocated(*piece)?;
        }
        Ok(())
    }

    // ── Data path ───────────────────────────────────────────────────────

    /// Allocate blocks for `sgl` and write it out; resolves when every
    /// piece completed. On any piece failure the whole operation fails and
    /// already-written pieces are freed.
    pub async fn async_alloc_write(
        &self,
        sgl: &SgList,
        hints: &BlkAllocHints,
        _part_of_batch: bool,
    ) -> Result<MultiBlkId> {
        let blk_size = self.get_blk_size() as usize;
        let size = sgl.size();
        if size == 0 || size % blk_size != 0 {
            return Err(OmError::InvalidBlkId {
                detail: format!("write size {size} is not a multiple of the {blk_size}-byte block"),
            });
        }
        let nblks = u32::try_from(size / blk_size).map_err(|_| OmError::SpaceFull)?;

        let bids = self.alloc_blks(nblks, hints)?;
        let payload = sgl.to_bytes();

        let mut offset = 0_usize;
        let mut writes = Vec::with_capacity(bids.num_pieces());
        for piece in bids.iter() {
            let (ep, dev_offset, len) = self.vdev.resolve(*piece)?;
            let chunk = payload.slice(offset..offset + len);
            offset += len;
            writes.push(tokio::spawn(async move {
                ep.async_write(dev_offset, chunk).await
            }));
        }

        let mut failed: Option<OmError> = None;
        for handle in writes {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failed = Some(e),
                Err(_) => failed = Some(OmError::Cancelled),
            }
        }
        if let Some(e) = failed {
            warn!(target: "om::data", event = "alloc_write_failed", error = %e);
            self.free_now(&bids);
            return Err(e);
        }
        trace!(
            target: "om::data",
            event = "alloc_write",
            pieces = bids.num_pieces(),
            nblks,
        );
        Ok(bids)
    }

    /// Read the blocks named by `bid`; resolves only after all piece reads
    /// complete. `total_size` must match the id's extent.
    pub async fn async_read(&self, bid: &MultiBlkId, total_size: usize) -> Result<SgList> {
        let blk_size = self.get_blk_size() as usize;
        if total_size != bid.blk_count() as usize * blk_size {
            return Err(OmError::InvalidBlkId {
                detail: format!(
                    "read of {total_size} bytes disagrees with {} blocks",
                    bid.blk_count()
                ),
            });
        }

        let _inflight = InflightReads::enter(self, bid);
        let mut iovs = Vec::with_capacity(bid.num_pieces());
        let mut reads = Vec::with_capacity(bid.num_pieces());
        for piece in bid.iter() {
            let (ep, dev_offset, len) = self.vdev.resolve(*piece)?;
            reads.push(tokio::spawn(async move { ep.async_read(dev_offset, len).await }));
        }
        for handle in reads {
            match handle.await {
                Ok(Ok(data)) => iovs.push(data),
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(OmError::Cancelled),
            }
        }
        Ok(SgList { iovs })
    }

    /// Free the blocks named by `bid`.
    ///
    /// Completes strictly after every read of the same blocks that was in
    /// flight when this call was made.
    pub async fn async_free_blk(&self, bid: &MultiBlkId) -> Result<()> {
        loop {
            let drained = self.read_drained.notified();
            if !self.has_inflight_overlap(bid) {
                break;
            }
            drained.await;
        }
        self.free_now(bid);
        trace!(target: "om::data", event = "free_blk", pieces = bid.num_pieces());
        Ok(())
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn allocator_of(&self, chunk_id: ChunkId) -> Option<&Arc<VarsizeBlkAllocator>> {
        self.allocators.iter().find(|a| a.chunk_id() == chunk_id)
    }

    /// Pick blocks for `nblks`: prefer a contiguous run; candidate chunks
    /// are tried most-free first so equal-start candidates resolve to the
    /// chunk with the most free space.
    fn alloc_blks(&self, nblks: u32, hints: &BlkAllocHints) -> Result<MultiBlkId> {
        let mut order: Vec<&Arc<VarsizeBlkAllocator>> = self.allocators.iter().collect();
        order.sort_by_key(|a| std::cmp::Reverse(a.available_blks()));

        for alloc in &order {
            if let Ok(bid) = alloc.alloc_contiguous(nblks) {
                return Ok(MultiBlkId::single(bid));
            }
        }
        if hints.max_pieces > 1 {
            for alloc in &order {
                if let Ok(bids) = alloc.alloc(nblks, hints) {
                    return Ok(bids);
                }
            }
        }
        Err(OmError::SpaceFull)
    }

    fn free_now(&self, bid: &MultiBlkId) {
        for piece in bid.iter() {
            if let Some(alloc) = self.allocator_of(piece.chunk_id) {
                if let Err(e) = alloc.free(*piece) {
                    warn!(target: "om::data", event = "free_failed", bid = %piece, error = %e);
                }
            }
            if let Some(cache) = &self.cache {
                cache.invalidate(&Fingerprint::of_blkid(self.vdev.vdev_id(), *piece));
            }
        }
    }

    fn has_inflight_overlap(&self, bid: &MultiBlkId) -> bool {
        let inflight = self.inflight_reads.lock();
        inflight
            .keys()
            .any(|r| bid.iter().any(|piece| piece.overlaps(*r)))
    }
}

fn invalid(bid: BlkId) -> OmError {
    OmError::InvalidBlkId {
        detail: format!("{bid} names no chunk of this service"),
    }
}

/// RAII registration of an in-flight read; dropping (including future
/// cancellation) releases the blocks for pending frees.
struct InflightReads<'a> {
    svc: &'a BlkDataService,
    pieces: Vec<BlkId>,
}

impl<'a> InflightReads<'a> {
    fn enter(svc: &'a BlkDataService, bid: &MultiBlkId) -> Self {
        let pieces: Vec<BlkId> = bid.iter().copied().collect();
        let mut inflight = svc.inflight_reads.lock();
        for piece in &pieces {
            *inflight.entry(*piece).or_insert(0) += 1;
        }
        Self { svc, pieces }
    }
}

impl Drop for InflightReads<'_> {
    fn drop(&mut self) {
        let mut inflight = self.svc.inflight_reads.lock();
        for piece in &self.pieces {
            if let Some(count) = inflight.get_mut(piece) {
                *count -= 1;
                if *count == 0 {
                    inflight.remove(piece);
                }
            }
        }
        drop(inflight);
        self.svc.read_drained.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use om_device::{
        DevSpec, DeviceConfig, DeviceManager, DriveAttrs, DriveEndpoint, VdevChunk, VdevParams,
    };
    use om_types::VdevId;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn data_vdev() -> (tempfile::NamedTempFile, Arc<VirtualDev>) {
        let mut f = tempfile::NamedTempFile::new().expect("tempfile");
        f.write_all(&vec![0_u8; 64 * 1024 * 1024]).expect("fill");
        f.flush().expect("flush");
        let cfg = DeviceConfig {
            attrs: DriveAttrs::default(),
            max_vdevs: 8,
            max_system_chunks: 64,
        };
        let mgr = DeviceManager::format(&[DevSpec::data(f.path())], cfg).expect("format");
        let vdev_id = mgr
            .create_vdev(&VdevParams {
                name: "data".to_owned(),
                size: 16 << 20,
                blk_size: 4096,
                num_mirrors: 0,
                chunk_size: Some(8 << 20),
            })
            .expect("vdev");
        let vdev = Arc::new(VirtualDev::open(&mgr, vdev_id).expect("open vdev"));
        (f, vdev)
    }

    fn fill_data(len: usize, seed: u8) -> Bytes {
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            out.push(seed.wrapping_add((i % 251) as u8));
        }
        Bytes::from(out)
    }

    /// Endpoint wrapper injecting a fixed delay before each read completes.
    struct DelayedDrive {
        inner: Arc<dyn DriveEndpoint>,
        read_delay: Duration,
    }

    #[async_trait]
    impl DriveEndpoint for DelayedDrive {
        fn len_bytes(&self) -> u64 {
            self.inner.len_bytes()
        }

        fn devname(&self) -> &str {
            self.inner.devname()
        }

        fn sync_read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
            self.inner.sync_read_at(offset, buf)
        }

        fn sync_write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
            self.inner.sync_write_at(offset, buf)
        }

        fn sync_flush(&self) -> Result<()> {
            self.inner.sync_flush()
        }

        async fn async_read(&self, offset: u64, len: usize) -> Result<Bytes> {
            tokio::time::sleep(self.read_delay).await;
            self.inner.async_read(offset, len).await
        }

        async fn async_write(&self, offset: u64, data: Bytes) -> Result<()> {
            self.inner.async_write(offset, data).await
        }
    }

    fn delayed_view(vdev: &VirtualDev, read_delay: Duration) -> Arc<VirtualDev> {
        let chunks = vdev
            .chunks()
            .iter()
            .map(|c| VdevChunk {
                chunk_id: c.chunk_id,
                endpoint: Arc::new(DelayedDrive {
                    inner: Arc::clone(&c.endpoint),
                    read_delay,
                }),
                start_offset: c.start_offset,
                size: c.size,
            })
            .collect();
        Arc::new(VirtualDev::from_parts(
            vdev.vdev_id(),
            vdev.blk_size(),
            chunks,
        ))
    }

    #[tokio::test]
    async fn write_then_read_returns_identical_bytes() {
        let (_f, vdev) = data_vdev();
        let svc = BlkDataService::new(vdev).expect("service");

        let payload = fill_data(4096, 3);
        let sgl = SgList::single(payload.clone());
        let bids = svc
            .async_alloc_write(&sgl, &BlkAllocHints::default(), false)
            .await
            .expect("write");
        assert!(bids.num_pieces() >= 1);
        assert!(svc.is_allocated(*bids.iter().next().expect("piece")));

        let read = svc.async_read(&bids, 4096).await.expect("read");
        assert_eq!(read.to_bytes(), payload);
    }

    #[tokio::test]
    async fn multi_block_write_round_trip() {
        let (_f, vdev) = data_vdev();
        let svc = BlkDataService::new(vdev).expect("service");

        let payload = fill_data(1 << 20, 9);
        let sgl = SgList {
            iovs: vec![payload.slice(0..512 * 1024), payload.slice(512 * 1024..)],
        };
        let bids = svc
            .async_alloc_write(&sgl, &BlkAllocHints::default(), false)
            .await
            .expect("write");
        assert_eq!(bids.blk_count(), 256);

        let read = svc.async_read(&bids, 1 << 20).await.expect("read");
        assert_eq!(read.to_bytes(), payload);
    }

    #[tokio::test]
    async fn write_free_without_reads_completes() {
        let (_f, vdev) = data_vdev();
        let svc = BlkDataService::new(vdev).expect("service");
        let used_before = svc.get_used_blks();

        let sgl = SgList::single(fill_data(8192, 1));
        let bids = svc
            .async_alloc_write(&sgl, &BlkAllocHints::default(), false)
            .await
            .expect("write");
        assert_eq!(svc.get_used_blks(), used_before + 2);

        svc.async_free_blk(&bids).await.expect("free");
        assert_eq!(svc.get_used_blks(), used_before);
        for piece in bids.iter() {
            assert!(!svc.is_allocated(*piece));
        }
    }

    #[tokio::test]
    async fn free_blk_resolves_after_inflight_read() {
        let (_f, vdev) = data_vdev();
        // Writes land immediately; reads take 500 ms at the drive level.
        let svc = Arc::new(
            BlkDataService::new(delayed_view(&vdev, Duration::from_millis(500)))
                .expect("service"),
        );

        let sgl = SgList::single(fill_data(4096, 7));
        let bids = Arc::new(
            svc.async_alloc_write(&sgl, &BlkAllocHints::default(), false)
                .await
                .expect("write"),
        );

        let read_done = Arc::new(AtomicBool::new(false));
        let read_task = {
            let svc = Arc::clone(&svc);
            let bids = Arc::clone(&bids);
            let read_done = Arc::clone(&read_done);
            tokio::spawn(async move {
                let out = svc.async_read(&bids, 4096).await.expect("read");
                read_done.store(true, Ordering::SeqCst);
                out
            })
        };

        // Let the read get registered before freeing.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!read_done.load(Ordering::SeqCst));

        let free_started = std::time::Instant::now();
        svc.async_free_blk(&bids).await.expect("free");
        // The free could not have resolved before the delayed read drained.
        assert!(
            free_started.elapsed() >= Duration::from_millis(400),
            "free_blk resolved while a read was still in flight"
        );
        let read = read_task.await.expect("join");
        assert!(read_done.load(Ordering::SeqCst));
        assert_eq!(read.size(), 4096);
    }

    #[tokio::test]
    async fn exhaustion_surfaces_space_full() {
        let (_f, vdev) = data_vdev();
        let svc = BlkDataService::new(vdev).expect("service");
        let total = svc.available_blks() as usize;
        let huge = SgList::single(Bytes::from(vec![0_u8; (total + 1) * 4096]));
        let err = svc
            .async_alloc_write(&huge, &BlkAllocHints::default(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, OmError::SpaceFull));
    }

    #[tokio::test]
    async fn recovery_restores_allocator_state() {
        let (_f, vdev) = data_vdev();
        let svc = BlkDataService::new(Arc::clone(&vdev)).expect("service");
        let sgl = SgList::single(fill_data(16384, 5));
        let bids = svc
            .async_alloc_write(&sgl, &BlkAllocHints::default(), false)
            .await
            .expect("write");
        let snapshots = svc.cp_take_snapshots();
        let used = svc.get_used_blks();
        drop(svc);

        let svc = BlkDataService::recover(vdev, &snapshots).expect("recover");
        assert_eq!(svc.get_used_blks(), used);
        for piece in bids.iter() {
            assert!(svc.is_allocated(*piece));
        }
        // The persisted image still reads back.
        let read = svc.async_read(&bids, 16384).await.expect("read");
        assert_eq!(read.to_bytes(), fill_data(16384, 5));
    }
}
