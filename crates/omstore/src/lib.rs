#![forbid(unsafe_code)]
//! OmStore: a local, block-oriented storage engine.
//!
//! Turns raw devices into a structured substrate: a device and chunk layer
//! with atomic DM publication, typed block allocators, a sharded cache, a
//! meta-block registry, a persistent B+tree and an asynchronous block data
//! service. This crate wires the services into one explicit handle created
//! during boot and threaded through; components receive references rather
//! than reading globals.
//!
//! Boot order: validate first blocks, reload chunk and vdev tables from the
//! DM chunks, rebuild allocator state, scan the meta area, then drive
//! consumer recovery callbacks.

pub use om_blkalloc::{Bitmap, BlkAllocConfig, BlkAllocHints, BlkAllocator};
pub use om_btree::{
    BNodeId, Btree, BtreeConfig, BtreeQueryRequest, BtreeRange, MemNodeStore, NodeStore, PutType,
    QueryMode, VdevNodeStore,
};
pub use om_cache::{Cache, CacheConfig, CacheMetrics, EvictionPolicy, Fingerprint};
pub use om_data::{BlkDataService, SgList};
pub use om_device::{
    DevSpec, DeviceConfig, DeviceManager, DriveAttrs, DriveEndpoint, FileDrive, VirtualDev,
};
pub use om_error::{OmError, Result};
pub use om_meta::{MetaBlkMgr, MetaConfig, MetaCookie};
pub use om_types::{BlkId, ChunkId, DevClass, MultiBlkId, PdevId, VdevId};

use om_types::{read_le_u32, write_le_u32};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const META_VDEV_NAME: &str = "meta";
const DATA_VDEV_NAME: &str = "data";
const DATA_ALLOC_META_TYPE: &str = "data_alloc_bm";

/// Sizing and tuning for one OmStore instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OmStoreConfig {
    pub device: DeviceConfig,
    pub cache: CacheConfig,
    pub meta: MetaConfig,
    pub btree: BtreeConfig,
    /// Share of usable space given to the meta vdev, in percent.
    pub meta_size_pct: u8,
    /// Share of usable space given to the data vdev, in percent.
    pub data_size_pct: u8,
    /// Block size of the data and meta vdevs.
    pub blk_size: u32,
}

impl Default for OmStoreConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            cache: CacheConfig::default(),
            meta: MetaConfig::default(),
            btree: BtreeConfig::default(),
            meta_size_pct: 5,
            data_size_pct: 80,
            blk_size: 4096,
        }
    }
}

/// The engine handle. One per formatted device set.
pub struct OmStore {
    cfg: OmStoreConfig,
    dm: Arc<DeviceManager>,
    cache: Arc<Cache>,
    meta: Arc<MetaBlkMgr>,
    data: Arc<BlkDataService>,
    data_alloc_cookie: Mutex<Option<MetaCookie>>,
}

impl std::fmt::Debug for OmStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OmStore").finish_non_exhaustive()
    }
}

impl OmStore {
    /// First boot: format the devices and stand every service up empty.
    pub fn format(specs: &[DevSpec], cfg: OmStoreConfig) -> Result<Self> {
        let dm = Arc::new(DeviceManager::format(specs, cfg.device.clone())?);
        let usable: u64 = (0..dm.num_pdevs())
            .map(|i| dm.free_space(PdevId(i as u32)))
            .sum();

        let meta_size = align_vdev_size(usable * u64::from(cfg.meta_size_pct) / 100, cfg.blk_size);
        let data_size = align_vdev_size(usable * u64::from(cfg.data_size_pct) / 100, cfg.blk_size);
        let meta_vdev_id = dm.create_vdev(&om_device::VdevParams {
            name: META_VDEV_NAME.to_owned(),
            size: meta_size,
            blk_size: cfg.blk_size,
            num_mirrors: 0,
            chunk_size: None,
        })?;
        let data_vdev_id = dm.create_vdev(&om_device::VdevParams {
            name: DATA_VDEV_NAME.to_owned(),
            size: data_size,
            blk_size: cfg.blk_size,
            num_mirrors: 0,
            chunk_size: None,
        })?;

        let cache = Arc::new(Cache::new(&cfg.cache));
        let meta_vdev = Arc::new(VirtualDev::open(&dm, meta_vdev_id)?);
        let meta = Arc::new(MetaBlkMgr::format(meta_vdev, cfg.meta.clone())?);
        let data_vdev = Arc::new(VirtualDev::open(&dm, data_vdev_id)?);
        let data = Arc::new(BlkDataService::new(data_vdev)?.with_cache(Arc::clone(&cache)));

        info!(
            target: "om::store",
            event = "format_done",
            uuid = %dm.system_uuid(),
            meta_size,
            data_size,
        );
        Ok(Self {
            cfg,
            dm,
            cache,
            meta,
            data,
            data_alloc_cookie: Mutex::new(None),
        })
    }

    /// Subsequent boots: validate the devices, reload DM state, scan meta
    /// and rebuild allocator state from the last checkpoint.
    pub fn open(specs: &[DevSpec], cfg: OmStoreConfig, uuid: Uuid) -> Result<Self> {
        let dm = Arc::new(DeviceManager::open(specs, cfg.device.clone(), uuid)?);
        let meta_info = dm.find_vdev(META_VDEV_NAME).ok_or(OmError::NotFound)?;
        let data_info = dm.find_vdev(DATA_VDEV_NAME).ok_or(OmError::NotFound)?;

        let cache = Arc::new(Cache::new(&cfg.cache));
        let meta_vdev = Arc::new(VirtualDev::open(&dm, meta_info.vdev_id)?);
        let meta = Arc::new(MetaBlkMgr::scan_meta_blks(meta_vdev, cfg.meta.clone())?);

        // The data allocators restart from the checkpointed bitmaps; any
        // later operation is replayed by its consumer through
        // `BlkDataService::mark_allocated`.
        let captured: Arc<Mutex<Option<(MetaCookie, Vec<u8>)>>> = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&captured);
        meta.register_handler(
            DATA_ALLOC_META_TYPE,
            move |cookie, bytes| {
                *sink.lock() = Some((cookie, bytes.to_vec()));
            },
            || {},
        );
        meta.read_sub_sb(DATA_ALLOC_META_TYPE).ok();
        let (cookie, bitmaps) = match captured.lock().take() {
            Some((cookie, bytes)) => (Some(cookie), decode_bitmaps(&bytes)?),
            None => (None, HashMap::new()),
        };
        meta.deregister_handler(DATA_ALLOC_META_TYPE);

        let data_vdev = Arc::new(VirtualDev::open(&dm, data_info.vdev_id)?);
        let data = Arc::new(
            BlkDataService::recover(data_vdev, &bitmaps)?.with_cache(Arc::clone(&cache)),
        );

        info!(target: "om::store", event = "open_done", uuid = %uuid);
        Ok(Self {
            cfg,
            dm,
            cache,
            meta,
            data,
            data_alloc_cookie: Mutex::new(cookie),
        })
    }

    /// Drive registered meta recovery callbacks. Call after consumers
    /// registered their handlers.
    pub fn recover(&self, do_callbacks: bool) -> Result<()> {
        self.meta.recover(do_callbacks)
    }

    /// Persist a checkpoint of the data allocators into the meta area.
    pub fn checkpoint(&self) -> Result<()> {
        let snapshots = self.data.cp_take_snapshots();
        let payload = encode_bitmaps(&snapshots);
        let mut cookie = self.data_alloc_cookie.lock();
        match *cookie {
            Some(c) => self.meta.update_sub_sb(c, &payload)?,
            None => *cookie = Some(self.meta.add_sub_sb(DATA_ALLOC_META_TYPE, &payload)?),
        }
        info!(target: "om::store", event = "checkpoint", chunks = snapshots.len());
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────────

    #[must_use]
    pub fn system_uuid(&self) -> Uuid {
        self.dm.system_uuid()
    }

    #[must_use]
    pub fn config(&self) -> &OmStoreConfig {
        &self.cfg
    }

    #[must_use]
    pub fn device_manager(&self) -> &Arc<DeviceManager> {
        &self.dm
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    #[must_use]
    pub fn meta_service(&self) -> &Arc<MetaBlkMgr> {
        &self.meta
    }

    #[must_use]
    pub fn data_service(&self) -> &Arc<BlkDataService> {
        &self.data
    }

    /// Open a vdev view by name, for consumers layering their own state
    /// (e.g. a btree node store) on a dedicated vdev.
    pub fn open_vdev(&self, name: &str) -> Result<VirtualDev> {
        let info = self.dm.find_vdev(name).ok_or(OmError::NotFound)?;
        VirtualDev::open(&self.dm, info.vdev_id)
    }

    /// Create an additional vdev for a consumer.
    pub fn create_vdev(&self, name: &str, size: u64) -> Result<VdevId> {
        self.dm.create_vdev(&om_device::VdevParams {
            name: name.to_owned(),
            size: align_vdev_size(size, self.cfg.blk_size),
            blk_size: self.cfg.blk_size,
            num_mirrors: 0,
            chunk_size: None,
        })
    }
}

fn align_vdev_size(size: u64, blk_size: u32) -> u64 {
    let unit = u64::from(blk_size);
    (size / unit).max(1) * unit
}

fn encode_bitmaps(snapshots: &HashMap<ChunkId, Vec<u8>>) -> Vec<u8> {
    let mut ordered: Vec<(&ChunkId, &Vec<u8>)> = snapshots.iter().collect();
    ordered.sort_by_key(|(id, _)| **id);
    let mut out = vec![0_u8; 4];
    write_le_u32(&mut out, 0, u32::try_from(ordered.len()).unwrap_or(0));
    for (chunk_id, bytes) in ordered {
        let mut hdr = [0_u8; 8];
        write_le_u32(&mut hdr, 0, chunk_id.0);
        write_le_u32(&mut hdr, 4, u32::try_from(bytes.len()).unwrap_or(0));
        out.extend_from_slice(&hdr);
        out.extend_from_slice(bytes);
    }
    out
}

fn decode_bitmaps(payload: &[u8]) -> Result<HashMap<ChunkId, Vec<u8>>> {
    let corrupt = |detail: &str| OmError::CorruptHeader {
        detail: detail.to_owned(),
    };
    let count = read_le_u32(payload, 0).map_err(|_| corrupt("bitmap payload truncated"))?;
    let mut out = HashMap::new();
    let mut at = 4_usize;
    for _ in 0..count {
        let chunk_id = read_le_u32(payload, at).map_err(|_| corrupt("bitmap entry truncated"))?;
        let len =
            read_le_u32(payload, at + 4).map_err(|_| corrupt("bitmap entry truncated"))? as usize;
        at += 8;
        if at + len > payload.len() {
            return Err(corrupt("bitmap bytes truncated"));
        }
        out.insert(ChunkId(chunk_id), payload[at..at + len].to_vec());
        at += len;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::io::Write;

    struct Rig {
        _file: tempfile::NamedTempFile,
        specs: Vec<DevSpec>,
        cfg: OmStoreConfig,
    }

    fn rig() -> (Rig, OmStore) {
        let mut f = tempfile::NamedTempFile::new().expect("tempfile");
        f.write_all(&vec![0_u8; 128 * 1024 * 1024]).expect("fill");
        f.flush().expect("flush");
        let cfg = OmStoreConfig {
            device: DeviceConfig {
                attrs: DriveAttrs::default(),
                max_vdevs: 8,
                max_system_chunks: 64,
            },
            ..OmStoreConfig::default()
        };
        let specs = vec![DevSpec::data(f.path())];
        let store = OmStore::format(&specs, cfg.clone()).expect("format");
        (
            Rig {
                _file: f,
                specs,
                cfg,
            },
            store,
        )
    }

    fn payload(len: usize, seed: u8) -> Bytes {
        let mut out = Vec::with_capacity(len);
        for i in 0..len {
            out.push(seed.wrapping_mul(31).wrapping_add((i % 239) as u8));
        }
        Bytes::from(out)
    }

    #[test]
    fn format_creates_meta_and_data_vdevs() {
        let (_rig, store) = rig();
        assert!(store.device_manager().find_vdev("meta").is_some());
        assert!(store.device_manager().find_vdev("data").is_some());
        assert!(store.data_service().available_blks() > 0);
        assert!(store.meta_service().get_free_size() > 0);
    }

    #[tokio::test]
    async fn data_survives_reboot_with_checkpoint() {
        let (rig, store) = rig();
        let uuid = store.system_uuid();

        let bytes = payload(16384, 11);
        let bids = store
            .data_service()
            .async_alloc_write(&SgList::single(bytes.clone()), &BlkAllocHints::default(), false)
            .await
            .expect("write");
        store.checkpoint().expect("checkpoint");
        drop(store);

        let store = OmStore::open(&rig.specs, rig.cfg.clone(), uuid).expect("open");
        store.recover(true).expect("recover");
        for piece in bids.iter() {
            assert!(store.data_service().is_allocated(*piece));
        }
        let read = store
            .data_service()
            .async_read(&bids, 16384)
            .await
            .expect("read");
        assert_eq!(read.to_bytes(), bytes);
    }

    #[test]
    fn meta_round_trip_through_facade() {
        let (rig, store) = rig();
        let uuid = store.system_uuid();
        let _ = store
            .meta_service()
            .add_sub_sb("volume", b"volume-config-v1")
            .expect("add");
        drop(store);

        let store = OmStore::open(&rig.specs, rig.cfg.clone(), uuid).expect("open");
        let seen: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store.meta_service().register_handler(
            "volume",
            move |_c, b| sink.lock().push(b.to_vec()),
            || {},
        );
        store.recover(true).expect("recover");
        assert_eq!(seen.lock().as_slice(), &[b"volume-config-v1".to_vec()]);
    }

    #[test]
    fn open_with_wrong_uuid_is_rejected() {
        let (rig, store) = rig();
        drop(store);
        let err = OmStore::open(&rig.specs, rig.cfg.clone(), Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, OmError::UuidMismatch { .. }));
    }

    #[test]
    fn btree_over_dedicated_vdev() {
        let (_rig, store) = rig();
        let _ = store.create_vdev("index", 4 << 20).expect("index vdev");
        let vdev = Arc::new(store.open_vdev("index").expect("open index"));
        let node_store =
            VdevNodeStore::format(vdev, &store.config().btree).expect("node store");
        let tree: Btree<u64, u64, VdevNodeStore> =
            Btree::create(node_store, store.config().btree.clone()).expect("tree");
        for k in 0..500_u64 {
            assert!(tree.put(k, k * 7, PutType::Insert).expect("put"));
        }
        assert_eq!(tree.get(&123).expect("get"), 861);
    }

    #[test]
    fn bitmap_codec_round_trip() {
        let mut snapshots = HashMap::new();
        snapshots.insert(ChunkId(3), vec![1_u8, 2, 3]);
        snapshots.insert(ChunkId(1), vec![0xFF_u8; 16]);
        let enc = encode_bitmaps(&snapshots);
        let dec = decode_bitmaps(&enc).expect("decode");
        assert_eq!(dec, snapshots);
    }

    #[test]
    fn checkpoint_updates_in_place() {
        let (_rig, store) = rig();
        store.checkpoint().expect("first");
        let count_after_first = store.meta_service().count_of_type(DATA_ALLOC_META_TYPE);
        store.checkpoint().expect("second");
        assert_eq!(
            store.meta_service().count_of_type(DATA_ALLOC_META_TYPE),
            count_after_first
        );
    }
}
