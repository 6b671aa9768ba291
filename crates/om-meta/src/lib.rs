#![forbid(unsafe_code)]
//! Meta-block manager: a transactional registry of typed sub-superblocks.
//!
//! The meta vdev is divided into pages. Each meta block (mblk) occupies one
//! page; payloads larger than the per-page capacity continue into an
//! overflow chain whose bodies concatenate into the logical payload.
//! Payloads compress through LZ4 when the ratio clears a runtime threshold.
//!
//! The meta superblock (`meta_ssb`) lives at a fixed page and enumerates
//! the head block of every live entry; publication rewrites continuation
//! pages first and flips the fixed head page last, so a crash leaves either
//! the old or the new enumeration visible, never a mix.

use om_blkalloc::{Bitmap, BlkAllocConfig, FixedBlkAllocator};
use om_device::VirtualDev;
use om_error::{OmError, Result};
use om_types::{
    read_le_u32, read_le_u64, trim_nul_padded, write_le_u32, write_le_u64, BlkId, ParseError,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Magic at the top of every mblk page.
pub const META_BLK_MAGIC: u32 = 0x4D42_4C4B; // "MBLK"
/// Magic of the meta superblock page.
pub const META_SSB_MAGIC: u32 = 0x4D53_5342; // "MSSB"
/// On-disk format version of meta pages.
pub const META_BLK_VERSION: u32 = 1;
/// Size of the per-page header.
pub const META_BLK_HDR_SIZE: usize = 128;

const TYPE_FIELD_SIZE: usize = 64;
const SSB_HDR_SIZE: usize = 32;
const FLAG_COMPRESSED: u8 = 0x01;

/// Runtime settings of the meta-block manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    /// Store compressed only when `compressed_len * 100 <= limit * raw_len`.
    pub compress_ratio_limit: u32,
    /// Payloads below this size are never compressed.
    pub min_compress_size: usize,
    /// Tolerate scanned headers whose recorded size disagrees with the
    /// materialized chain: log and skip instead of failing the boot.
    pub skip_header_size_check: bool,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            compress_ratio_limit: 75,
            min_compress_size: 4096,
            skip_header_size_check: false,
        }
    }
}

/// Opaque handle to a live meta entry; stable across updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MetaCookie(BlkId);

impl MetaCookie {
    #[must_use]
    pub fn bid(self) -> BlkId {
        self.0
    }
}

type RecoverCb = Box<dyn Fn(MetaCookie, &[u8]) + Send + Sync>;
type RecoveryDoneCb = Box<dyn Fn() + Send + Sync>;

struct MetaHandler {
    on_recover: RecoverCb,
    on_recovery_done: RecoveryDoneCb,
}

#[derive(Debug, Clone)]
struct MetaEntry {
    type_name: String,
    head: BlkId,
    /// Overflow pages in chain order (head excluded).
    ovf_chain: Vec<BlkId>,
    /// Bytes stored on disk across the chain (compressed length when
    /// compressed).
    stored_len: u64,
    compressed: bool,
}

struct PageHeader {
    type_name: String,
    bid: BlkId,
    next_bid: BlkId,
    context_sz: u64,
    compressed: bool,
    checksum: u32,
}

struct MetaState {
    entries: HashMap<BlkId, MetaEntry>,
    /// Head bids in ssb enumeration order.
    ssb_order: Vec<BlkId>,
    /// Continuation pages of the ssb chain itself.
    ssb_chain: Vec<BlkId>,
    handlers: HashMap<String, MetaHandler>,
}

/// The meta-block manager.
pub struct MetaBlkMgr {
    vdev: Arc<VirtualDev>,
    allocators: Vec<FixedBlkAllocator>,
    cfg: MetaConfig,
    ssb_bid: BlkId,
    state: Mutex<MetaState>,
}

impl MetaBlkMgr {
    /// Initialize a freshly created meta vdev: reserves the ssb page and
    /// writes an empty enumeration.
    pub fn format(vdev: Arc<VirtualDev>, cfg: MetaConfig) -> Result<Self> {
        let allocators = Self::fresh_allocators(&vdev)?;
        let ssb_bid = BlkId::new(vdev.chunks()[0].chunk_id, 0, 1);
        let mgr = Self {
            vdev,
            allocators,
            cfg,
            ssb_bid,
            state: Mutex::new(MetaState {
                entries: HashMap::new(),
                ssb_order: Vec::new(),
                ssb_chain: Vec::new(),
                handlers: HashMap::new(),
            }),
        };
        // Pin the ssb page before anything else can claim it.
        let got = mgr.allocators[0].alloc_contiguous()?;
        debug_assert_eq!(got, ssb_bid);
        mgr.write_ssb(&[])?;
        info!(target: "om::meta", event = "format", pages = mgr.total_pages());
        Ok(mgr)
    }

    /// Open an existing meta vdev and run the initial recovery scan.
    ///
    /// Follows the ssb, reads every head, validates magic, version and
    /// checksum, and rebuilds the allocator state from the live chains.
    pub fn scan_meta_blks(vdev: Arc<VirtualDev>, cfg: MetaConfig) -> Result<Self> {
        let ssb_bid = BlkId::new(vdev.chunks()[0].chunk_id, 0, 1);
        let page_size = vdev.blk_size() as usize;

        // The ssb chain enumerates the heads.
        let (heads, ssb_chain) = read_ssb_chain(&vdev, ssb_bid)?;

        let mut entries = HashMap::new();
        let mut ssb_order = Vec::new();
        let mut used: Vec<BlkId> = vec![ssb_bid];
        used.extend_from_slice(&ssb_chain);

        for head in heads {
            match Self::scan_one(&vdev, head, page_size) {
                Ok(entry) => {
                    used.push(entry.head);
                    used.extend_from_slice(&entry.ovf_chain);
                    ssb_order.push(entry.head);
                    entries.insert(entry.head, entry);
                }
                Err(e) if cfg.skip_header_size_check => {
                    warn!(
                        target: "om::meta",
                        event = "scan_skip",
                        head = %head,
                        error = %e,
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let allocators = Self::recovered_allocators(&vdev, &used)?;
        info!(
            target: "om::meta",
            event = "scan_done",
            entries = entries.len(),
            used_pages = used.len(),
        );
        Ok(Self {
            vdev,
            allocators,
            cfg,
            ssb_bid,
            state: Mutex::new(MetaState {
                entries,
                ssb_order,
                ssb_chain,
                handlers: HashMap::new(),
            }),
        })
    }

    fn scan_one(vdev: &VirtualDev, head: BlkId, page_size: usize) -> Result<MetaEntry> {
        let page = vdev.sync_read_blk(head)?;
        let hdr = decode_page_header(&page, META_BLK_MAGIC)?;
        if hdr.bid != head {
            return Err(OmError::CorruptHeader {
                detail: format!("mblk at {head} claims bid {}", hdr.bid),
            });
        }
        let cap = page_size - META_BLK_HDR_SIZE;
        let mut stored = Vec::with_capacity(usize::try_from(hdr.context_sz).unwrap_or(0));
        let take = (hdr.context_sz as usize).min(cap);
        stored.extend_from_slice(&page[META_BLK_HDR_SIZE..META_BLK_HDR_SIZE + take]);

        let mut ovf_chain = Vec::new();
        let mut next = hdr.next_bid;
        while next.is_valid() {
            let ovf_page = vdev.sync_read_blk(next)?;
            let ovf = decode_page_header(&ovf_page, META_BLK_MAGIC)?;
            let n = (ovf.context_sz as usize).min(cap);
            stored.extend_from_slice(&ovf_page[META_BLK_HDR_SIZE..META_BLK_HDR_SIZE + n]);
            ovf_chain.push(next);
            next = ovf.next_bid;
        }

        if stored.len() as u64 != hdr.context_sz {
            return Err(OmError::CorruptHeader {
                detail: format!(
                    "mblk {head} header size {} disagrees with materialized {}",
                    hdr.context_sz,
                    stored.len()
                ),
            });
        }
        let checksum = crc32c::crc32c(&stored);
        if checksum != hdr.checksum {
            return Err(OmError::CorruptHeader {
                detail: format!("mblk {head} payload checksum mismatch"),
            });
        }
        Ok(MetaEntry {
            type_name: hdr.type_name,
            head,
            ovf_chain,
            stored_len: hdr.context_sz,
            compressed: hdr.compressed,
        })
    }

    fn fresh_allocators(vdev: &VirtualDev) -> Result<Vec<FixedBlkAllocator>> {
        vdev.chunks()
            .iter()
            .map(|c| {
                let total = vdev.total_blks(c.chunk_id)?;
                Ok(FixedBlkAllocator::new(BlkAllocConfig::new(c.chunk_id, total)))
            })
            .collect()
    }

    fn recovered_allocators(vdev: &VirtualDev, used: &[BlkId]) -> Result<Vec<FixedBlkAllocator>> {
        vdev.chunks()
            .iter()
            .map(|c| {
                let total = vdev.total_blks(c.chunk_id)?;
                let mut bm = Bitmap::new(total);
                for bid in used.iter().filter(|b| b.chunk_id == c.chunk_id) {
                    bm.set_range(bid.blk_num, bid.blk_count);
                }
                let alloc =
                    FixedBlkAllocator::recover(BlkAllocConfig::new(c.chunk_id, total), &bm.to_bytes());
                alloc.inited();
                Ok(alloc)
            })
            .collect()
    }

    // ── Registry ────────────────────────────────────────────────────────

    /// Register recovery callbacks for a meta type.
    pub fn register_handler(
        &self,
        type_name: &str,
        on_recover: impl Fn(MetaCookie, &[u8]) + Send + Sync + 'static,
        on_recovery_done: impl Fn() + Send + Sync + 'static,
    ) {
        let mut state = self.state.lock();
        state.handlers.insert(
            type_name.to_owned(),
            MetaHandler {
                on_recover: Box::new(on_recover),
                on_recovery_done: Box::new(on_recovery_done),
            },
        );
    }

    pub fn deregister_handler(&self, type_name: &str) {
        let mut state = self.state.lock();
        state.handlers.remove(type_name);
    }

    // ── Entry lifecycle ─────────────────────────────────────────────────

    /// Persist a new sub-superblock of `type_name` and link it into the
    /// ssb enumeration. Returns the cookie for later update/remove.
    pub fn add_sub_sb(&self, type_name: &str, bytes: &[u8]) -> Result<MetaCookie> {
        if type_name.len() >= TYPE_FIELD_SIZE {
            return Err(OmError::InvalidBlkId {
                detail: format!("meta type name {type_name:?} too long"),
            });
        }
        let mut state = self.state.lock();
        let (stored, compressed) = self.maybe_compress(bytes);
        let npages = self.pages_needed(stored.len());
        let pages = self.alloc_pages(npages)?;
        let head = pages[0];
        self.write_chain(type_name, &pages, &stored, compressed)?;

        state.ssb_order.push(head);
        let new_chain = self.publish_ssb(&mut state)?;
        state.ssb_chain = new_chain;
        state.entries.insert(
            head,
            MetaEntry {
                type_name: type_name.to_owned(),
                head,
                ovf_chain: pages[1..].to_vec(),
                stored_len: stored.len() as u64,
                compressed,
            },
        );
        debug!(
            target: "om::meta",
            event = "add_sub_sb",
            meta_type = type_name,
            head = %head,
            raw_len = bytes.len(),
            stored_len = stored.len(),
            compressed,
        );
        Ok(MetaCookie(head))
    }

    /// In-place update of an entry: the head bid is preserved, the overflow
    /// chain is reallocated, and previous overflow pages are freed only
    /// after the new head is durable.
    pub fn update_sub_sb(&self, cookie: MetaCookie, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get(&cookie.0)
            .cloned()
            .ok_or(OmError::NotFound)?;

        let (stored, compressed) = self.maybe_compress(bytes);
        let npages = self.pages_needed(stored.len());
        // Head page is reused; only the overflow pages are fresh.
        let mut pages = vec![entry.head];
        pages.extend(self.alloc_pages(npages - 1)?);
        self.write_chain(&entry.type_name, &pages, &stored, compressed)?;

        for old in &entry.ovf_chain {
            self.free_page(*old)?;
        }
        state.entries.insert(
            entry.head,
            MetaEntry {
                type_name: entry.type_name.clone(),
                head: entry.head,
                ovf_chain: pages[1..].to_vec(),
                stored_len: stored.len() as u64,
                compressed,
            },
        );
        debug!(
            target: "om::meta",
            event = "update_sub_sb",
            meta_type = %entry.type_name,
            head = %entry.head,
            stored_len = stored.len(),
            compressed,
        );
        Ok(())
    }

    /// Unlink an entry and free its whole chain.
    pub fn remove_sub_sb(&self, cookie: MetaCookie) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state.entries.remove(&cookie.0).ok_or(OmError::NotFound)?;
        state.ssb_order.retain(|b| *b != entry.head);
        let new_chain = self.publish_ssb(&mut state)?;
        state.ssb_chain = new_chain;

        self.free_page(entry.head)?;
        for ovf in &entry.ovf_chain {
            self.free_page(*ovf)?;
        }
        debug!(
            target: "om::meta",
            event = "remove_sub_sb",
            meta_type = %entry.type_name,
            head = %entry.head,
        );
        Ok(())
    }

    /// Invoke the registered handler with materialized bytes for every live
    /// entry of `type_name`.
    pub fn read_sub_sb(&self, type_name: &str) -> Result<()> {
        let state = self.state.lock();
        let heads: Vec<BlkId> = state
            .ssb_order
            .iter()
            .filter(|h| {
                state
                    .entries
                    .get(h)
                    .is_some_and(|e| e.type_name == type_name)
            })
            .copied()
            .collect();
        let handler = state.handlers.get(type_name).ok_or(OmError::NotFound)?;
        for head in heads {
            let entry = &state.entries[&head];
            let payload = self.materialize(entry)?;
            (handler.on_recover)(MetaCookie(head), &payload);
        }
        Ok(())
    }

    /// Drive per-type handler callbacks after a scan. Every live entry is
    /// delivered exactly once; unknown types are recorded, not fatal.
    pub fn recover(&self, do_callbacks: bool) -> Result<()> {
        let state = self.state.lock();
        if do_callbacks {
            for head in &state.ssb_order {
                let entry = &state.entries[head];
                let Some(handler) = state.handlers.get(&entry.type_name) else {
                    warn!(
                        target: "om::meta",
                        event = "recover_unknown_type",
                        meta_type = %entry.type_name,
                        head = %head,
                    );
                    continue;
                };
                let payload = self.materialize(entry)?;
                (handler.on_recover)(MetaCookie(*head), &payload);
            }
        }
        for handler in state.handlers.values() {
            (handler.on_recovery_done)();
        }
        info!(target: "om::meta", event = "recover_done", entries = state.ssb_order.len());
        Ok(())
    }

    // ── Introspection ───────────────────────────────────────────────────

    /// Payload bytes a single page carries.
    #[must_use]
    pub fn meta_blk_context_sz(&self) -> usize {
        self.vdev.blk_size() as usize - META_BLK_HDR_SIZE
    }

    #[must_use]
    pub fn total_pages(&self) -> u32 {
        self.allocators.iter().map(FixedBlkAllocator::total_blks).sum()
    }

    #[must_use]
    pub fn get_size(&self) -> u64 {
        u64::from(self.total_pages()) * u64::from(self.vdev.blk_size())
    }

    #[must_use]
    pub fn get_used_size(&self) -> u64 {
        let used: u32 = self.allocators.iter().map(FixedBlkAllocator::get_used_blks).sum();
        u64::from(used) * u64::from(self.vdev.blk_size())
    }

    #[must_use]
    pub fn get_free_size(&self) -> u64 {
        self.get_size() - self.get_used_size()
    }

    /// Number of live entries of a given type.
    #[must_use]
    pub fn count_of_type(&self, type_name: &str) -> usize {
        let state = self.state.lock();
        state
            .entries
            .values()
            .filter(|e| e.type_name == type_name)
            .count()
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn maybe_compress(&self, bytes: &[u8]) -> (Vec<u8>, bool) {
        if bytes.len() < self.cfg.min_compress_size {
            return (bytes.to_vec(), false);
        }
        let compressed = lz4_flex::compress_prepend_size(bytes);
        // Backoff: a payload that does not clear the ratio is stored raw.
        let limit = u64::from(self.cfg.compress_ratio_limit);
        if (compressed.len() as u64) * 100 <= limit * (bytes.len() as u64) {
            (compressed, true)
        } else {
            debug!(
                target: "om::meta",
                event = "compress_backoff",
                raw_len = bytes.len(),
                compressed_len = compressed.len(),
            );
            (bytes.to_vec(), false)
        }
    }

    fn decompress(&self, entry: &MetaEntry, stored: Vec<u8>) -> Result<Vec<u8>> {
        if !entry.compressed {
            return Ok(stored);
        }
        lz4_flex::decompress_size_prepended(&stored).map_err(|e| OmError::CorruptHeader {
            detail: format!("mblk {} decompression failed: {e}", entry.head),
        })
    }

    fn materialize(&self, entry: &MetaEntry) -> Result<Vec<u8>> {
        let cap = self.meta_blk_context_sz();
        let mut stored = Vec::with_capacity(usize::try_from(entry.stored_len).unwrap_or(0));
        let head_page = self.vdev.sync_read_blk(entry.head)?;
        let take = (entry.stored_len as usize).min(cap);
        stored.extend_from_slice(&head_page[META_BLK_HDR_SIZE..META_BLK_HDR_SIZE + take]);
        for ovf in &entry.ovf_chain {
            let page = self.vdev.sync_read_blk(*ovf)?;
            let hdr = decode_page_header(&page, META_BLK_MAGIC)?;
            let n = (hdr.context_sz as usize).min(cap);
            stored.extend_from_slice(&page[META_BLK_HDR_SIZE..META_BLK_HDR_SIZE + n]);
        }
        if stored.len() as u64 != entry.stored_len {
            return Err(OmError::CorruptHeader {
                detail: format!("mblk {} chain is partial", entry.head),
            });
        }
        self.decompress(entry, stored)
    }

    fn pages_needed(&self, stored_len: usize) -> usize {
        let cap = self.meta_blk_context_sz();
        stored_len.div_ceil(cap).max(1)
    }

    fn alloc_pages(&self, n: usize) -> Result<Vec<BlkId>> {
        let mut pages = Vec::with_capacity(n);
        for _ in 0..n {
            let mut got = None;
            for alloc in &self.allocators {
                match alloc.alloc_contiguous() {
                    Ok(bid) => {
                        got = Some(bid);
                        break;
                    }
                    Err(OmError::SpaceFull) => {}
                    Err(e) => return Err(e),
                }
            }
            match got {
                Some(bid) => pages.push(bid),
                None => {
                    for bid in &pages {
                        let _ = self.free_page(*bid);
                    }
                    return Err(OmError::SpaceFull);
                }
            }
        }
        Ok(pages)
    }

    fn free_page(&self, bid: BlkId) -> Result<()> {
        let alloc = self
            .allocators
            .iter()
            .find(|a| a.chunk_id() == bid.chunk_id)
            .ok_or_else(|| OmError::InvalidBlkId {
                detail: format!("meta page {bid} belongs to no meta chunk"),
            })?;
        alloc.free(bid)
    }

    /// Write a chain: overflow pages first, the head page last, so a crash
    /// mid-write never exposes a head pointing at unwritten pages.
    fn write_chain(
        &self,
        type_name: &str,
        pages: &[BlkId],
        stored: &[u8],
        compressed: bool,
    ) -> Result<()> {
        let page_size = self.vdev.blk_size() as usize;
        let cap = page_size - META_BLK_HDR_SIZE;
        let checksum = crc32c::crc32c(stored);

        for i in (0..pages.len()).rev() {
            let body = chunk_of(stored, i, cap);
            let context_sz = if i == 0 { stored.len() as u64 } else { body.len() as u64 };
            let next_bid = pages.get(i + 1).copied().unwrap_or(BlkId::INVALID);
            let mut page = vec![0_u8; page_size];
            encode_page_header(
                &mut page,
                META_BLK_MAGIC,
                type_name,
                pages[i],
                next_bid,
                context_sz,
                compressed,
                checksum,
            );
            page[META_BLK_HDR_SIZE..META_BLK_HDR_SIZE + body.len()].copy_from_slice(body);
            self.vdev.sync_write_blk(pages[i], &page)?;
        }
        Ok(())
    }

    /// Rewrite the ssb enumeration. Continuation pages are written first and
    /// the fixed head page flips last; old continuation pages are freed only
    /// after the head is durable.
    fn publish_ssb(&self, state: &mut MetaState) -> Result<Vec<BlkId>> {
        let new_chain = self.write_ssb(&state.ssb_order)?;
        let old_chain = std::mem::take(&mut state.ssb_chain);
        for old in old_chain {
            if !new_chain.contains(&old) {
                self.free_page(old)?;
            }
        }
        Ok(new_chain)
    }

    fn write_ssb(&self, heads: &[BlkId]) -> Result<Vec<BlkId>> {
        let page_size = self.vdev.blk_size() as usize;
        let per_page = (page_size - SSB_HDR_SIZE) / BlkId::ENCODED_SIZE;
        let npages = heads.len().div_ceil(per_page).max(1);
        let cont_pages = self.alloc_pages(npages - 1)?;

        let mut pages = vec![self.ssb_bid];
        pages.extend_from_slice(&cont_pages);

        for i in (0..npages).rev() {
            let slice = &heads[(i * per_page).min(heads.len())..((i + 1) * per_page).min(heads.len())];
            let next = pages.get(i + 1).copied().unwrap_or(BlkId::INVALID);
            let mut page = vec![0_u8; page_size];
            write_le_u32(&mut page, 0, META_SSB_MAGIC);
            write_le_u32(&mut page, 4, META_BLK_VERSION);
            write_le_u32(&mut page, 12, u32::try_from(slice.len()).unwrap_or(0));
            page[16..16 + BlkId::ENCODED_SIZE].copy_from_slice(&next.encode());
            let mut at = SSB_HDR_SIZE;
            for bid in slice {
                page[at..at + BlkId::ENCODED_SIZE].copy_from_slice(&bid.encode());
                at += BlkId::ENCODED_SIZE;
            }
            let checksum = crc32c::crc32c(&page[12..]);
            write_le_u32(&mut page, 8, checksum);
            self.vdev.sync_write_blk(pages[i], &page)?;
        }
        Ok(cont_pages)
    }
}

fn chunk_of(stored: &[u8], i: usize, cap: usize) -> &[u8] {
    let start = (i * cap).min(stored.len());
    let end = ((i + 1) * cap).min(stored.len());
    &stored[start..end]
}

fn read_ssb_chain(vdev: &VirtualDev, ssb_bid: BlkId) -> Result<(Vec<BlkId>, Vec<BlkId>)> {
    let mut heads = Vec::new();
    let mut chain = Vec::new();
    let mut cur = ssb_bid;
    loop {
        let page = vdev.sync_read_blk(cur)?;
        let magic = read_le_u32(&page, 0).map_err(parse_err)?;
        if magic != META_SSB_MAGIC {
            return Err(OmError::CorruptHeader {
                detail: format!("meta ssb page {cur} magic {magic:#x}"),
            });
        }
        let stored_csum = read_le_u32(&page, 8).map_err(parse_err)?;
        if crc32c::crc32c(&page[12..]) != stored_csum {
            return Err(OmError::CorruptHeader {
                detail: format!("meta ssb page {cur} checksum mismatch"),
            });
        }
        let count = read_le_u32(&page, 12).map_err(parse_err)? as usize;
        let next = BlkId::decode(&page, 16).map_err(parse_err)?;
        let mut at = SSB_HDR_SIZE;
        for _ in 0..count {
            heads.push(BlkId::decode(&page, at).map_err(parse_err)?);
            at += BlkId::ENCODED_SIZE;
        }
        if !next.is_valid() {
            break;
        }
        chain.push(next);
        cur = next;
    }
    Ok((heads, chain))
}

#[allow(clippy::too_many_arguments)]
fn encode_page_header(
    page: &mut [u8],
    magic: u32,
    type_name: &str,
    bid: BlkId,
    next_bid: BlkId,
    context_sz: u64,
    compressed: bool,
    checksum: u32,
) {
    write_le_u32(page, 0, magic);
    write_le_u32(page, 4, META_BLK_VERSION);
    let name = type_name.as_bytes();
    let n = name.len().min(TYPE_FIELD_SIZE - 1);
    page[8..8 + n].copy_from_slice(&name[..n]);
    page[8 + n..8 + TYPE_FIELD_SIZE].fill(0);
    page[72..84].copy_from_slice(&bid.encode());
    page[84..96].copy_from_slice(&next_bid.encode());
    write_le_u64(page, 96, context_sz);
    page[104] = if compressed { FLAG_COMPRESSED } else { 0 };
    write_le_u32(page, 108, checksum);
}

fn decode_page_header(page: &[u8], expect_magic: u32) -> Result<PageHeader> {
    let magic = read_le_u32(page, 0).map_err(parse_err)?;
    if magic != expect_magic {
        return Err(OmError::CorruptHeader {
            detail: format!("mblk magic {magic:#x}"),
        });
    }
    let version = read_le_u32(page, 4).map_err(parse_err)?;
    if version != META_BLK_VERSION {
        return Err(OmError::CorruptHeader {
            detail: format!("mblk version {version}"),
        });
    }
    let type_field = om_types::read_fixed::<TYPE_FIELD_SIZE>(page, 8).map_err(parse_err)?;
    Ok(PageHeader {
        type_name: trim_nul_padded(&type_field),
        bid: BlkId::decode(page, 72).map_err(parse_err)?,
        next_bid: BlkId::decode(page, 84).map_err(parse_err)?,
        context_sz: read_le_u64(page, 96).map_err(parse_err)?,
        compressed: page.get(104).copied().unwrap_or(0) & FLAG_COMPRESSED != 0,
        checksum: read_le_u32(page, 108).map_err(parse_err)?,
    })
}

fn parse_err(e: ParseError) -> OmError {
    OmError::CorruptHeader {
        detail: e.to_string(),
    }
}
