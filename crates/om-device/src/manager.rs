//! Device manager: formats and validates pdevs, owns the chunk slot table
//! and vdev table, and publishes device-manager state through two
//! alternating DM chunks per pdev.
//!
//! Publication protocol: write the new DM image to the non-current slot,
//! then overwrite the first block with `cur_indx + 1` and `gen_cnt + 1`.
//! A torn DM write leaves the previous slot authoritative.

use crate::chunk::{ChunkInfo, CHUNK_INFO_SIZE};
use crate::endpoint::{DriveEndpoint, FileDrive};
use crate::first_block::{DriveAttrs, FirstBlock};
use crate::layout::PdevLayout;
use om_error::{OmError, Result};
use om_types::{
    align_up, read_fixed, read_le_u32, read_le_u64, trim_nul_padded, write_le_u32, write_le_u64,
    ByteOffset, ChunkId, DevClass, ParseError, PdevId, VdevId, FIRST_BLOCK_SIZE,
    MAX_CHUNKS_IN_SYSTEM, MAX_VDEVS_IN_SYSTEM, OMSTORE_MAGIC, PRODUCT_NAME, SUPERBLOCK_VERSION,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Serialized size of one vdev info slot.
pub const VDEV_INFO_SIZE: usize = 64;

const DM_IMAGE_VERSION: u32 = 1;
const DM_HEADER_SIZE: usize = 32;
const VDEV_NAME_SIZE: usize = 32;

/// A physical device to format or open.
#[derive(Debug, Clone)]
pub struct DevSpec {
    pub path: PathBuf,
    pub class: DevClass,
}

impl DevSpec {
    #[must_use]
    pub fn data(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            class: DevClass::Data,
        }
    }
}

/// Format-time limits and drive attributes.
///
/// `max_vdevs` and `max_system_chunks` are baked into the first block and
/// cannot change after formatting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub attrs: DriveAttrs,
    pub max_vdevs: u32,
    pub max_system_chunks: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            attrs: DriveAttrs::default(),
            max_vdevs: MAX_VDEVS_IN_SYSTEM,
            max_system_chunks: MAX_CHUNKS_IN_SYSTEM,
        }
    }
}

impl DeviceConfig {
    /// Unpadded size of a serialized DM image under this config.
    #[must_use]
    pub fn dm_info_raw_size(&self) -> u64 {
        DM_HEADER_SIZE as u64
            + u64::from(self.max_vdevs) * VDEV_INFO_SIZE as u64
            + u64::from(self.max_system_chunks.max(8)).div_ceil(8)
            + u64::from(self.max_system_chunks) * CHUNK_INFO_SIZE as u64
    }

    /// DM chunk size: the raw image rounded up to the physical page.
    #[must_use]
    pub fn dm_info_size(&self) -> u64 {
        let raw = self.dm_info_raw_size();
        align_up(raw, u64::from(self.attrs.phys_page_size)).unwrap_or(raw)
    }
}

/// Per-vdev record in the DM image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VdevInfo {
    pub vdev_id: VdevId,
    pub blk_size: u32,
    pub num_mirrors: u8,
    pub num_chunks: u32,
    pub size: u64,
    pub name: String,
}

impl VdevInfo {
    fn encode_into(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= VDEV_INFO_SIZE);
        out[..VDEV_INFO_SIZE].fill(0);
        write_le_u32(out, 0, self.vdev_id.0);
        write_le_u32(out, 4, self.blk_size);
        out[8] = self.num_mirrors;
        out[9] = 1; // allocated
        write_le_u32(out, 12, self.num_chunks);
        write_le_u64(out, 16, self.size);
        let name = self.name.as_bytes();
        let n = name.len().min(VDEV_NAME_SIZE - 1);
        out[24..24 + n].copy_from_slice(&name[..n]);
    }

    fn decode(data: &[u8], offset: usize) -> std::result::Result<Option<Self>, ParseError> {
        let allocated = om_types::ensure_slice(data, offset + 9, 1)?[0];
        if allocated == 0 {
            return Ok(None);
        }
        let name = read_fixed::<VDEV_NAME_SIZE>(data, offset + 24)?;
        Ok(Some(Self {
            vdev_id: VdevId(read_le_u32(data, offset)?),
            blk_size: read_le_u32(data, offset + 4)?,
            num_mirrors: om_types::ensure_slice(data, offset + 8, 1)?[0],
            num_chunks: read_le_u32(data, offset + 12)?,
            size: read_le_u64(data, offset + 16)?,
            name: trim_nul_padded(&name),
        }))
    }
}

/// Parameters for creating a vdev.
#[derive(Debug, Clone)]
pub struct VdevParams {
    pub name: String,
    pub size: u64,
    pub blk_size: u32,
    pub num_mirrors: u8,
    /// Size of each constituent chunk. Defaults to the whole requested
    /// size allocated from a single pdev.
    pub chunk_size: Option<u64>,
}

struct Pdev {
    id: PdevId,
    devname: String,
    endpoint: Arc<dyn DriveEndpoint>,
    size: u64,
    layout: PdevLayout,
}

#[derive(Debug, Clone, Copy)]
struct PdevDyn {
    first_chunk_id: ChunkId,
    cur_indx: u32,
    dm_chunk_ids: [ChunkId; 2],
}

struct DmState {
    gen_cnt: u64,
    chunks: Vec<Option<ChunkInfo>>,
    vdevs: Vec<Option<VdevInfo>>,
    pdev_dyn: Vec<PdevDyn>,
}

/// Owner of all pdevs, chunks and vdevs of one OmStore instance.
pub struct DeviceManager {
    cfg: DeviceConfig,
    system_uuid: Uuid,
    pdevs: Vec<Pdev>,
    state: RwLock<DmState>,
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager").finish_non_exhaustive()
    }
}

impl DeviceManager {
    /// Format the given devices from scratch.
    ///
    /// The first block of each pdev is not written until its first DM image
    /// write succeeds; a device without DM info is meaningless.
    pub fn format(specs: &[DevSpec], cfg: DeviceConfig) -> Result<Self> {
        let system_uuid = Uuid::new_v4();
        Self::format_with_uuid(specs, cfg, system_uuid)
    }

    /// Format with a caller-chosen system uuid (tests, re-format flows).
    pub fn format_with_uuid(specs: &[DevSpec], cfg: DeviceConfig, system_uuid: Uuid) -> Result<Self> {
        let pdevs = Self::open_pdevs(specs, &cfg)?;
        let dm_info_size = cfg.dm_info_size();

        let mut state = DmState {
            gen_cnt: 0,
            chunks: vec![None; cfg.max_system_chunks as usize],
            vdevs: vec![None; cfg.max_vdevs as usize],
            pdev_dyn: Vec::with_capacity(pdevs.len()),
        };

        for pdev in &pdevs {
            let data_size = pdev.layout.data_size(pdev.size);
            if data_size < 2 * dm_info_size {
                return Err(OmError::IncompatibleLayout {
                    detail: format!(
                        "device {} too small: {} data bytes cannot hold two {}-byte DM chunks",
                        pdev.devname, data_size, dm_info_size
                    ),
                });
            }

            // One free chunk covering the whole payload region.
            let head = alloc_chunk_slot(&mut state.chunks)?;
            state.chunks[head.0 as usize] =
                Some(ChunkInfo::new(head, pdev.id, pdev.layout.data_offset, data_size));
            state.pdev_dyn.push(PdevDyn {
                first_chunk_id: head,
                cur_indx: 0,
                dm_chunk_ids: [ChunkId::INVALID; 2],
            });

            // Two DM chunks, carved out of the payload region.
            for slot in 0..2 {
                let cid = alloc_chunk_inner(
                    &mut state,
                    pdev.id,
                    VdevId::INVALID,
                    dm_info_size,
                )?;
                let info = state.chunks[cid.0 as usize]
                    .as_mut()
                    .ok_or_else(|| OmError::IncompatibleLayout {
                        detail: "freshly allocated chunk slot vanished".to_owned(),
                    })?;
                info.is_sb_chunk = true;
                info.busy = true;
                state.pdev_dyn[pdev.id.0 as usize].dm_chunk_ids[slot] = cid;
            }
            info!(
                target: "om::device",
                event = "format_pdev",
                dev = %pdev.devname,
                data_offset = pdev.layout.data_offset.0,
                data_size,
            );
        }

        let mgr = Self {
            cfg,
            system_uuid,
            pdevs,
            state: RwLock::new(state),
        };
        {
            let mut state = mgr.state.write();
            mgr.publish_locked(&mut state)?;
        }
        info!(target: "om::device", event = "format_done", uuid = %system_uuid);
        Ok(mgr)
    }

    /// Open previously formatted devices and reload the DM state.
    pub fn open(specs: &[DevSpec], cfg: DeviceConfig, expected_uuid: Uuid) -> Result<Self> {
        let pdevs = Self::open_pdevs(specs, &cfg)?;
        let dm_info_size = cfg.dm_info_size();

        let mut first_blocks = Vec::with_capacity(pdevs.len());
        for pdev in &pdevs {
            let mut buf = vec![0_u8; FIRST_BLOCK_SIZE];
            pdev.endpoint.sync_read_at(0, &mut buf)?;
            let fb = FirstBlock::decode(&buf).map_err(|e| {
                debug!(target: "om::device", event = "first_block_reject", dev = %pdev.devname, error = %e);
                OmError::NotFormatted {
                    dev: pdev.devname.clone(),
                }
            })?;
            if !fb.is_valid() {
                return Err(OmError::NotFormatted {
                    dev: pdev.devname.clone(),
                });
            }
            if fb.system_uuid != expected_uuid {
                return Err(OmError::UuidMismatch {
                    dev: pdev.devname.clone(),
                    expected: expected_uuid.to_string(),
                    found: fb.system_uuid.to_string(),
                });
            }
            for dm in &fb.dm_chunk {
                if dm.size != dm_info_size {
                    return Err(OmError::IncompatibleLayout {
                        detail: format!(
                            "device {}: DM chunk size {} disagrees with configured {}",
                            pdev.devname, dm.size, dm_info_size
                        ),
                    });
                }
            }
            first_blocks.push(fb);
        }

        // The slot with the higher generation is authoritative; the other is
        // torn or stale.
        let mut best: Option<(u64, DmState)> = None;
        for (pdev, fb) in pdevs.iter().zip(&first_blocks) {
            for dm in &fb.dm_chunk {
                let mut img = vec![0_u8; dm_info_size as usize];
                if pdev.endpoint.sync_read_at(dm.start_offset.0, &mut img).is_err() {
                    continue;
                }
                match decode_dm_image(&img, &cfg, &first_blocks) {
                    Ok((gen, state)) => {
                        if best.as_ref().map_or(true, |(g, _)| gen > *g) {
                            best = Some((gen, state));
                        }
                    }
                    Err(e) => {
                        warn!(
                            target: "om::device",
                            event = "dm_image_reject",
                            dev = %pdev.devname,
                            error = %e,
                        );
                    }
                }
            }
        }
        let (gen, mut state) = best.ok_or_else(|| OmError::CorruptHeader {
            detail: "no valid DM image found on any device".to_owned(),
        })?;
        state.gen_cnt = gen;

        info!(target: "om::device", event = "open_done", uuid = %expected_uuid, gen);
        Ok(Self {
            cfg,
            system_uuid: expected_uuid,
            pdevs,
            state: RwLock::new(state),
        })
    }

    fn open_pdevs(specs: &[DevSpec], cfg: &DeviceConfig) -> Result<Vec<Pdev>> {
        if !cfg.attrs.is_valid() {
            return Err(OmError::IncompatibleLayout {
                detail: "drive attributes must be powers of two".to_owned(),
            });
        }
        specs
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let endpoint = FileDrive::open(&spec.path)?;
                let size = endpoint.len_bytes();
                let layout = PdevLayout::compute(
                    size,
                    spec.class,
                    cfg.max_vdevs,
                    cfg.attrs.phys_page_size,
                );
                Ok(Pdev {
                    id: PdevId(u32::try_from(i).map_err(|_| OmError::IncompatibleLayout {
                        detail: "too many devices".to_owned(),
                    })?),
                    devname: spec.path.display().to_string(),
                    endpoint: Arc::new(endpoint),
                    size,
                    layout,
                })
            })
            .collect()
    }

    // ── Accessors ───────────────────────────────────────────────────────

    #[must_use]
    pub fn system_uuid(&self) -> Uuid {
        self.system_uuid
    }

    #[must_use]
    pub fn num_pdevs(&self) -> usize {
        self.pdevs.len()
    }

    #[must_use]
    pub fn config(&self) -> &DeviceConfig {
        &self.cfg
    }

    pub fn endpoint(&self, pdev_id: PdevId) -> Result<Arc<dyn DriveEndpoint>> {
        self.pdevs
            .get(pdev_id.0 as usize)
            .map(|p| Arc::clone(&p.endpoint))
            .ok_or(OmError::NotFound)
    }

    #[must_use]
    pub fn get_chunk(&self, chunk_id: ChunkId) -> Option<ChunkInfo> {
        let state = self.state.read();
        state.chunks.get(chunk_id.0 as usize).copied().flatten()
    }

    /// Chunks belonging to `vdev_id`, in allocation (chunk id) order.
    #[must_use]
    pub fn chunks_of_vdev(&self, vdev_id: VdevId) -> Vec<ChunkInfo> {
        let state = self.state.read();
        let mut out: Vec<ChunkInfo> = state
            .chunks
            .iter()
            .flatten()
            .filter(|c| c.vdev_id == vdev_id)
            .copied()
            .collect();
        out.sort_by_key(|c| c.chunk_id);
        out
    }

    #[must_use]
    pub fn vdev_info(&self, vdev_id: VdevId) -> Option<VdevInfo> {
        let state = self.state.read();
        state.vdevs.get(vdev_id.0 as usize).cloned().flatten()
    }

    #[must_use]
    pub fn find_vdev(&self, name: &str) -> Option<VdevInfo> {
        let state = self.state.read();
        state
            .vdevs
            .iter()
            .flatten()
            .find(|v| v.name == name)
            .cloned()
    }

    /// Free space summed over all non-busy chunks of a pdev.
    #[must_use]
    pub fn free_space(&self, pdev_id: PdevId) -> u64 {
        let state = self.state.read();
        state
            .chunks
            .iter()
            .flatten()
            .filter(|c| c.pdev_id == pdev_id && !c.is_busy())
            .map(|c| c.size)
            .sum()
    }

    // ── Chunk lifecycle ─────────────────────────────────────────────────

    /// Allocate a `size`-byte chunk on `pdev_id`, owned by `vdev_id`.
    pub fn alloc_chunk(&self, pdev_id: PdevId, vdev_id: VdevId, size: u64) -> Result<ChunkInfo> {
        let mut state = self.state.write();
        let cid = alloc_chunk_inner(&mut state, pdev_id, vdev_id, size)?;
        let info = state.chunks[cid.0 as usize].ok_or(OmError::SpaceFull)?;
        self.publish_locked(&mut state)?;
        Ok(info)
    }

    /// Release a chunk back to the free pool, coalescing free neighbours.
    pub fn free_chunk(&self, chunk_id: ChunkId) -> Result<()> {
        let mut state = self.state.write();
        let Some(mut info) = state.chunks.get(chunk_id.0 as usize).copied().flatten() else {
            return Err(OmError::InvalidBlkId {
                detail: format!("free of unknown chunk {chunk_id}"),
            });
        };
        if info.is_sb_chunk {
            return Err(OmError::InvalidBlkId {
                detail: format!("chunk {chunk_id} holds DM state and cannot be freed"),
            });
        }
        info.vdev_id = VdevId::INVALID;
        info.busy = false;
        info.primary_chunk_id = ChunkId::INVALID;
        state.chunks[chunk_id.0 as usize] = Some(info);
        let freed = merge_free_chunks(&mut state, chunk_id);
        debug!(
            target: "om::device",
            event = "free_chunk",
            chunk_id = chunk_id.0,
            merged = ?freed,
        );
        self.publish_locked(&mut state)?;
        Ok(())
    }

    // ── Vdev lifecycle ──────────────────────────────────────────────────

    /// Create a vdev, allocating chunks round-robin across pdevs.
    pub fn create_vdev(&self, params: &VdevParams) -> Result<VdevId> {
        let mut state = self.state.write();
        let slot = state
            .vdevs
            .iter()
            .position(Option::is_none)
            .ok_or(OmError::SpaceFull)?;
        let vdev_id = VdevId(u32::try_from(slot).map_err(|_| OmError::SpaceFull)?);

        let chunk_size = params.chunk_size.unwrap_or(params.size).max(1);
        let mut remaining = params.size;
        let mut num_chunks = 0_u32;
        let mut pdev_cursor = 0_usize;
        while remaining > 0 {
            let this_size = remaining.min(chunk_size);
            // Round-robin with fallback: try each pdev once before giving up.
            let mut placed = false;
            for probe in 0..self.pdevs.len() {
                let pdev_id = PdevId(((pdev_cursor + probe) % self.pdevs.len()) as u32);
                match alloc_chunk_inner(&mut state, pdev_id, vdev_id, this_size) {
                    Ok(_) => {
                        placed = true;
                        pdev_cursor = (pdev_cursor + probe + 1) % self.pdevs.len();
                        break;
                    }
                    Err(OmError::SpaceFull) => {}
                    Err(e) => return Err(e),
                }
            }
            if !placed {
                return Err(OmError::SpaceFull);
            }
            num_chunks += 1;
            remaining -= this_size;
        }

        state.vdevs[slot] = Some(VdevInfo {
            vdev_id,
            blk_size: params.blk_size,
            num_mirrors: params.num_mirrors,
            num_chunks,
            size: params.size,
            name: params.name.clone(),
        });
        self.publish_locked(&mut state)?;
        info!(
            target: "om::device",
            event = "create_vdev",
            vdev_id = vdev_id.0,
            name = %params.name,
            num_chunks,
        );
        Ok(vdev_id)
    }

    // ── DM publication ──────────────────────────────────────────────────

    /// Serialize the current state and publish it atomically on every pdev.
    pub fn publish_dm_info(&self) -> Result<()> {
        let mut state = self.state.write();
        self.publish_locked(&mut state)
    }

    fn publish_locked(&self, state: &mut DmState) -> Result<()> {
        state.gen_cnt += 1;
        let image = encode_dm_image(state, &self.cfg);
        for pdev in &self.pdevs {
            let pd = state.pdev_dyn[pdev.id.0 as usize];
            let next = ((pd.cur_indx + 1) % 2) as usize;
            let dm_id = pd.dm_chunk_ids[next];
            let dm = state.chunks[dm_id.0 as usize].ok_or_else(|| OmError::CorruptHeader {
                detail: format!("DM chunk {dm_id} missing from slot table"),
            })?;
            pdev.endpoint.sync_write_at(dm.start_offset.0, &image)?;

            state.pdev_dyn[pdev.id.0 as usize].cur_indx = pd.cur_indx + 1;
            let fb = self.build_first_block(state, pdev)?;
            pdev.endpoint.sync_write_at(0, &fb.encode())?;
            pdev.endpoint.sync_flush()?;
        }
        debug!(target: "om::device", event = "dm_publish", gen = state.gen_cnt);
        Ok(())
    }

    fn build_first_block(&self, state: &DmState, pdev: &Pdev) -> Result<FirstBlock> {
        let pd = state.pdev_dyn[pdev.id.0 as usize];
        let dm0 = state.chunks[pd.dm_chunk_ids[0].0 as usize].ok_or(OmError::NotFound)?;
        let dm1 = state.chunks[pd.dm_chunk_ids[1].0 as usize].ok_or(OmError::NotFound)?;
        Ok(FirstBlock {
            gen_cnt: state.gen_cnt,
            version: SUPERBLOCK_VERSION,
            product_name: PRODUCT_NAME.to_owned(),
            num_pdevs: u32::try_from(self.pdevs.len()).unwrap_or(0),
            max_vdevs: self.cfg.max_vdevs,
            max_chunks: self.cfg.max_system_chunks,
            system_uuid: self.system_uuid,
            pdev_id: pdev.id,
            data_offset: pdev.layout.data_offset,
            pdev_size: pdev.size,
            attrs: self.cfg.attrs,
            first_chunk_id: pd.first_chunk_id,
            cur_indx: pd.cur_indx,
            dm_chunk: [dm0, dm1],
        })
    }

    /// Walk a pdev's chunk list in offset order, for diagnostics and tests.
    #[must_use]
    pub fn chunk_list(&self, pdev_id: PdevId) -> Vec<ChunkInfo> {
        let state = self.state.read();
        let mut out = Vec::new();
        let mut cur = state
            .pdev_dyn
            .get(pdev_id.0 as usize)
            .map_or(ChunkId::INVALID, |p| p.first_chunk_id);
        while cur.is_valid() {
            let Some(info) = state.chunks.get(cur.0 as usize).copied().flatten() else {
                break;
            };
            cur = info.next_chunk_id;
            out.push(info);
        }
        out
    }
}

// ── Slot and list management (free functions over the locked state) ────────

fn alloc_chunk_slot(chunks: &mut [Option<ChunkInfo>]) -> Result<ChunkId> {
    let slot = chunks.iter().position(Option::is_none).ok_or(OmError::SpaceFull)?;
    Ok(ChunkId(u32::try_from(slot).map_err(|_| OmError::SpaceFull)?))
}

/// Best-fit search over a pdev's free chunks.
///
/// Tie-break on equal sizes: lower chunk id.
fn find_free_chunk(state: &DmState, pdev_id: PdevId, req_size: u64) -> Option<ChunkId> {
    let mut closest: Option<ChunkInfo> = None;
    let mut cur = state.pdev_dyn.get(pdev_id.0 as usize)?.first_chunk_id;
    while cur.is_valid() {
        let info = state.chunks.get(cur.0 as usize).copied().flatten()?;
        if !info.is_busy() && info.size >= req_size {
            let better = match closest {
                None => true,
                Some(best) => {
                    info.size < best.size || (info.size == best.size && info.chunk_id < best.chunk_id)
                }
            };
            if better {
                closest = Some(info);
            }
        }
        cur = info.next_chunk_id;
    }
    closest.map(|c| c.chunk_id)
}

/// Carve `size` bytes out of the best-fit free chunk on `pdev_id`.
///
/// The found chunk is truncated in place; the remainder becomes a new free
/// chunk attached right after it.
fn alloc_chunk_inner(
    state: &mut DmState,
    pdev_id: PdevId,
    vdev_id: VdevId,
    size: u64,
) -> Result<ChunkId> {
    let found_id = find_free_chunk(state, pdev_id, size).ok_or(OmError::SpaceFull)?;
    let mut found = state.chunks[found_id.0 as usize].ok_or(OmError::SpaceFull)?;

    if found.size > size {
        let rem_id = alloc_chunk_slot(&mut state.chunks)?;
        let mut rem = ChunkInfo::new(
            rem_id,
            pdev_id,
            ByteOffset(found.start_offset.0 + size),
            found.size - size,
        );
        found.size = size;

        // O(1) list insert after `found`.
        rem.prev_chunk_id = found.chunk_id;
        rem.next_chunk_id = found.next_chunk_id;
        if found.next_chunk_id.is_valid() {
            if let Some(next) = state.chunks[found.next_chunk_id.0 as usize].as_mut() {
                next.prev_chunk_id = rem_id;
            }
        }
        found.next_chunk_id = rem_id;
        state.chunks[rem_id.0 as usize] = Some(rem);
    }

    found.vdev_id = vdev_id;
    found.busy = true;
    state.chunks[found_id.0 as usize] = Some(found);
    Ok(found_id)
}

/// Coalesce `chunk_id` with free neighbours; returns up to two freed slot ids.
fn merge_free_chunks(state: &mut DmState, chunk_id: ChunkId) -> [ChunkId; 2] {
    let mut freed = [ChunkId::INVALID; 2];
    let mut nfreed = 0_usize;
    let Some(mut cur) = state.chunks.get(chunk_id.0 as usize).copied().flatten() else {
        return freed;
    };

    // Merge into the previous chunk if free: prev absorbs our bytes and the
    // current slot is released.
    if cur.prev_chunk_id.is_valid() {
        if let Some(prev) = state.chunks.get(cur.prev_chunk_id.0 as usize).copied().flatten() {
            if !prev.is_busy() {
                let mut prev = prev;
                prev.size += cur.size;
                prev.next_chunk_id = cur.next_chunk_id;
                if cur.next_chunk_id.is_valid() {
                    if let Some(next) = state.chunks[cur.next_chunk_id.0 as usize].as_mut() {
                        next.prev_chunk_id = prev.chunk_id;
                    }
                }
                state.chunks[prev.chunk_id.0 as usize] = Some(prev);
                state.chunks[cur.chunk_id.0 as usize] = None;
                freed[nfreed] = cur.chunk_id;
                nfreed += 1;
                cur = prev;
            }
        }
    }

    // Merge the next chunk into ours if free.
    if cur.next_chunk_id.is_valid() {
        if let Some(next) = state.chunks.get(cur.next_chunk_id.0 as usize).copied().flatten() {
            if !next.is_busy() {
                cur.size += next.size;
                cur.next_chunk_id = next.next_chunk_id;
                if next.next_chunk_id.is_valid() {
                    if let Some(nn) = state.chunks[next.next_chunk_id.0 as usize].as_mut() {
                        nn.prev_chunk_id = cur.chunk_id;
                    }
                }
                state.chunks[cur.chunk_id.0 as usize] = Some(cur);
                state.chunks[next.chunk_id.0 as usize] = None;
                freed[nfreed] = next.chunk_id;
            }
        }
    }
    state.chunks[cur.chunk_id.0 as usize] = Some(cur);
    freed
}

// ── DM image codec ──────────────────────────────────────────────────────────

fn encode_dm_image(state: &DmState, cfg: &DeviceConfig) -> Vec<u8> {
    let raw = cfg.dm_info_raw_size() as usize;
    let total = cfg.dm_info_size() as usize;
    let mut buf = vec![0_u8; total];
    write_le_u32(&mut buf, 0, OMSTORE_MAGIC);
    write_le_u32(&mut buf, 4, DM_IMAGE_VERSION);
    write_le_u64(&mut buf, 16, state.gen_cnt);
    write_le_u32(&mut buf, 24, cfg.max_vdevs);
    write_le_u32(&mut buf, 28, cfg.max_system_chunks);

    let mut at = DM_HEADER_SIZE;
    for slot in &state.vdevs {
        if let Some(v) = slot {
            v.encode_into(&mut buf[at..at + VDEV_INFO_SIZE]);
        }
        at += VDEV_INFO_SIZE;
    }

    let bitmap_len = (cfg.max_system_chunks.max(8) as usize).div_ceil(8);
    for (i, slot) in state.chunks.iter().enumerate() {
        if slot.is_some() {
            buf[at + i / 8] |= 1 << (i % 8);
        }
    }
    at += bitmap_len;

    for slot in &state.chunks {
        if let Some(c) = slot {
            c.encode_into(&mut buf[at..at + CHUNK_INFO_SIZE]);
        }
        at += CHUNK_INFO_SIZE;
    }
    debug_assert_eq!(at, raw);

    let checksum = crc32c::crc32c(&buf[16..raw]);
    write_le_u32(&mut buf, 8, checksum);
    buf
}

fn decode_dm_image(
    data: &[u8],
    cfg: &DeviceConfig,
    first_blocks: &[FirstBlock],
) -> Result<(u64, DmState)> {
    let corrupt = |detail: String| OmError::CorruptHeader { detail };
    let magic = read_le_u32(data, 0).map_err(|e| corrupt(e.to_string()))?;
    if magic != OMSTORE_MAGIC {
        return Err(corrupt(format!("DM image magic {magic:#x}")));
    }
    let version = read_le_u32(data, 4).map_err(|e| corrupt(e.to_string()))?;
    if version != DM_IMAGE_VERSION {
        return Err(corrupt(format!("DM image version {version}")));
    }
    let raw = cfg.dm_info_raw_size() as usize;
    if data.len() < raw {
        return Err(corrupt(format!(
            "DM image truncated: {} < {raw}",
            data.len()
        )));
    }
    let stored = read_le_u32(data, 8).map_err(|e| corrupt(e.to_string()))?;
    let actual = crc32c::crc32c(&data[16..raw]);
    if stored != actual {
        return Err(corrupt("DM image checksum mismatch".to_owned()));
    }
    let gen = read_le_u64(data, 16).map_err(|e| corrupt(e.to_string()))?;
    let max_vdevs = read_le_u32(data, 24).map_err(|e| corrupt(e.to_string()))?;
    let max_chunks = read_le_u32(data, 28).map_err(|e| corrupt(e.to_string()))?;
    if max_vdevs != cfg.max_vdevs || max_chunks != cfg.max_system_chunks {
        return Err(OmError::IncompatibleLayout {
            detail: format!(
                "DM image limits ({max_vdevs} vdevs, {max_chunks} chunks) disagree with config"
            ),
        });
    }

    let mut at = DM_HEADER_SIZE;
    let mut vdevs = Vec::with_capacity(max_vdevs as usize);
    for _ in 0..max_vdevs {
        vdevs.push(VdevInfo::decode(data, at).map_err(|e| corrupt(e.to_string()))?);
        at += VDEV_INFO_SIZE;
    }

    let bitmap_len = (max_chunks.max(8) as usize).div_ceil(8);
    let bitmap = &data[at..at + bitmap_len];
    at += bitmap_len;

    let mut chunks = vec![None; max_chunks as usize];
    for (i, chunk) in chunks.iter_mut().enumerate() {
        if bitmap[i / 8] & (1 << (i % 8)) != 0 {
            let info = ChunkInfo::decode(data, at + i * CHUNK_INFO_SIZE)
                .map_err(|e| corrupt(e.to_string()))?;
            *chunk = Some(info);
        }
    }

    let pdev_dyn = first_blocks
        .iter()
        .map(|fb| PdevDyn {
            first_chunk_id: fb.first_chunk_id,
            cur_indx: fb.cur_indx,
            dm_chunk_ids: [fb.dm_chunk[0].chunk_id, fb.dm_chunk[1].chunk_id],
        })
        .collect();

    Ok((
        gen,
        DmState {
            gen_cnt: gen,
            chunks,
            vdevs,
            pdev_dyn,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn small_cfg() -> DeviceConfig {
        DeviceConfig {
            attrs: DriveAttrs::default(),
            max_vdevs: 8,
            max_system_chunks: 64,
        }
    }

    fn make_dev(size: usize) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().expect("tempfile");
        f.write_all(&vec![0_u8; size]).expect("fill");
        f.flush().expect("flush");
        f
    }

    fn dev_size() -> usize {
        64 * 1024 * 1024
    }

    #[test]
    fn format_then_open_round_trip() {
        let f = make_dev(dev_size());
        let specs = vec![DevSpec::data(f.path())];
        let mgr = DeviceManager::format(&specs, small_cfg()).expect("format");
        let uuid = mgr.system_uuid();
        drop(mgr);

        let mgr = DeviceManager::open(&specs, small_cfg(), uuid).expect("open");
        let list = mgr.chunk_list(PdevId(0));
        // Two DM chunks plus the remaining free chunk.
        assert_eq!(list.iter().filter(|c| c.is_sb_chunk).count(), 2);
        assert!(list.iter().any(|c| !c.is_busy()));
    }

    #[test]
    fn open_unformatted_fails() {
        let f = make_dev(dev_size());
        let specs = vec![DevSpec::data(f.path())];
        let err = DeviceManager::open(&specs, small_cfg(), Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, OmError::NotFormatted { .. }));
    }

    #[test]
    fn open_with_wrong_uuid_fails() {
        let f = make_dev(dev_size());
        let specs = vec![DevSpec::data(f.path())];
        let mgr = DeviceManager::format(&specs, small_cfg()).expect("format");
        drop(mgr);
        let err = DeviceManager::open(&specs, small_cfg(), Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, OmError::UuidMismatch { .. }));
    }

    #[test]
    fn open_with_wrong_dm_size_fails() {
        let f = make_dev(dev_size());
        let specs = vec![DevSpec::data(f.path())];
        let mgr = DeviceManager::format(&specs, small_cfg()).expect("format");
        let uuid = mgr.system_uuid();
        drop(mgr);
        let mut bigger = small_cfg();
        bigger.max_system_chunks = 128;
        let err = DeviceManager::open(&specs, bigger, uuid).unwrap_err();
        assert!(matches!(err, OmError::IncompatibleLayout { .. }));
    }

    #[test]
    fn alloc_free_chunk_merges_neighbours() {
        let f = make_dev(dev_size());
        let specs = vec![DevSpec::data(f.path())];
        let mgr = DeviceManager::format(&specs, small_cfg()).expect("format");

        let free_before: Vec<_> = mgr
            .chunk_list(PdevId(0))
            .into_iter()
            .filter(|c| !c.is_busy())
            .collect();
        assert_eq!(free_before.len(), 1);

        let a = mgr.alloc_chunk(PdevId(0), VdevId(0), 1 << 20).expect("alloc a");
        let b = mgr.alloc_chunk(PdevId(0), VdevId(0), 1 << 20).expect("alloc b");
        assert_ne!(a.chunk_id, b.chunk_id);

        mgr.free_chunk(a.chunk_id).expect("free a");
        mgr.free_chunk(b.chunk_id).expect("free b");

        let free_after: Vec<_> = mgr
            .chunk_list(PdevId(0))
            .into_iter()
            .filter(|c| !c.is_busy())
            .collect();
        // Both frees coalesced back into a single free run.
        assert_eq!(free_after.len(), 1);
        assert_eq!(free_after[0].size, free_before[0].size);
    }

    #[test]
    fn best_fit_prefers_closest_size() {
        let f = make_dev(dev_size());
        let specs = vec![DevSpec::data(f.path())];
        let mgr = DeviceManager::format(&specs, small_cfg()).expect("format");

        // Carve [a(1M)][b(4M)][c(1M)][rest]; free a and c to create two holes.
        let a = mgr.alloc_chunk(PdevId(0), VdevId(0), 1 << 20).expect("a");
        let _b = mgr.alloc_chunk(PdevId(0), VdevId(0), 4 << 20).expect("b");
        let c = mgr.alloc_chunk(PdevId(0), VdevId(0), 1 << 20).expect("c");
        mgr.free_chunk(a.chunk_id).expect("free a");
        mgr.free_chunk(c.chunk_id).expect("free c");

        // A 1 MiB request must take a 1 MiB hole, not split the large tail.
        let d = mgr.alloc_chunk(PdevId(0), VdevId(0), 1 << 20).expect("d");
        assert!(
            d.start_offset == a.start_offset || d.start_offset == c.start_offset,
            "expected re-use of a freed hole, got {d}"
        );
    }

    #[test]
    fn vdev_chunks_survive_reopen() {
        let f = make_dev(dev_size());
        let specs = vec![DevSpec::data(f.path())];
        let mgr = DeviceManager::format(&specs, small_cfg()).expect("format");
        let uuid = mgr.system_uuid();
        let vdev_id = mgr
            .create_vdev(&VdevParams {
                name: "data".to_owned(),
                size: 8 << 20,
                blk_size: 4096,
                num_mirrors: 0,
                chunk_size: Some(4 << 20),
            })
            .expect("create vdev");
        let chunks = mgr.chunks_of_vdev(vdev_id);
        assert_eq!(chunks.len(), 2);
        drop(mgr);

        let mgr = DeviceManager::open(&specs, small_cfg(), uuid).expect("open");
        let info = mgr.find_vdev("data").expect("vdev persisted");
        assert_eq!(info.vdev_id, vdev_id);
        assert_eq!(info.num_chunks, 2);
        assert_eq!(mgr.chunks_of_vdev(vdev_id), chunks);
    }

    #[test]
    fn torn_dm_write_falls_back_to_previous_slot() {
        let f = make_dev(dev_size());
        let specs = vec![DevSpec::data(f.path())];
        let mgr = DeviceManager::format(&specs, small_cfg()).expect("format");
        let uuid = mgr.system_uuid();
        let _ = mgr
            .alloc_chunk(PdevId(0), VdevId(0), 1 << 20)
            .expect("alloc");
        // Find the slot that the NEXT publish would overwrite and corrupt it,
        // as a torn in-progress write would.
        let (victim_off, cur_chunks) = {
            let state = mgr.state.read();
            let pd = state.pdev_dyn[0];
            let next = ((pd.cur_indx + 1) % 2) as usize;
            let dm = state.chunks[pd.dm_chunk_ids[next].0 as usize].expect("dm chunk");
            (dm.start_offset.0, state.chunks.iter().flatten().count())
        };
        drop(mgr);

        let drive = FileDrive::open(f.path()).expect("reopen file");
        drive
            .sync_write_at(victim_off, &vec![0xFF_u8; 4096])
            .expect("corrupt");

        let mgr = DeviceManager::open(&specs, small_cfg(), uuid).expect("open survives");
        let state = mgr.state.read();
        assert_eq!(state.chunks.iter().flatten().count(), cur_chunks);
    }
}
