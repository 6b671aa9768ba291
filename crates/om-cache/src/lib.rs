#![forbid(unsafe_code)]
//! Concurrent cache with pluggable eviction.
//!
//! Size-bounded, sharded mapping from fingerprint to reference-counted
//! buffer. Each partition owns a hash index, an eviction policy instance
//! and a size budget of `max_size / partitions`. At most one concurrent
//! materialization runs per fingerprint.

pub mod evictor;

pub use evictor::{EjectVerdict, EvictionPolicy, LruPolicy};

use om_error::Result;
use om_types::{BlkId, VdevId};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Opaque cache key, typically derived from `(vdev, BlkId)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(Box<[u8]>);

impl Fingerprint {
    /// Conventional fingerprint of a block range on a vdev.
    #[must_use]
    pub fn of_blkid(vdev: VdevId, bid: BlkId) -> Self {
        let mut bytes = Vec::with_capacity(4 + BlkId::ENCODED_SIZE);
        bytes.extend_from_slice(&vdev.0.to_le_bytes());
        bytes.extend_from_slice(&bid.encode());
        Self(bytes.into_boxed_slice())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for Fingerprint {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }
}

/// Reference-counted cache buffer.
pub type CacheBuf = Arc<Vec<u8>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Total byte budget across all partitions.
    pub max_size: usize,
    /// Number of partitions; 0 means one per available worker thread.
    pub num_partitions: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 64 * 1024 * 1024,
            num_partitions: 0,
        }
    }
}

/// Monotonic cache counters plus a point-in-time size view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    pub obj_count: u64,
    pub hit_count: u64,
    pub miss_count: u64,
    pub evict_count: u64,
    pub failed_evict_count: u64,
    pub current_size: usize,
    pub max_size: usize,
}

impl CacheMetrics {
    /// Hit ratio in percent, 0 when nothing was accessed yet.
    #[must_use]
    pub fn hit_ratio(&self) -> u64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0
        } else {
            self.hit_count * 100 / total
        }
    }
}

struct CacheRecord {
    buf: CacheBuf,
    size: usize,
}

struct Partition {
    index: HashMap<Fingerprint, CacheRecord>,
    policy: EvictionPolicy,
    cur_size: usize,
    max_size: usize,
    /// Fingerprints with a materialization in flight.
    loading: HashSet<Fingerprint>,
}

impl Partition {
    fn new(max_size: usize) -> Self {
        Self {
            index: HashMap::new(),
            policy: EvictionPolicy::lru(),
            cur_size: 0,
            max_size,
            loading: HashSet::new(),
        }
    }
}

struct Stats {
    objs: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evicts: AtomicU64,
    failed_evicts: AtomicU64,
}

/// Sharded fingerprint → buffer cache.
pub struct Cache {
    partitions: Vec<(Mutex<Partition>, Condvar)>,
    stats: Stats,
    max_size: usize,
}

impl Cache {
    #[must_use]
    pub fn new(cfg: &CacheConfig) -> Self {
        let nparts = if cfg.num_partitions == 0 {
            std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
        } else {
            cfg.num_partitions
        };
        let per_part = (cfg.max_size / nparts).max(1);
        let partitions = (0..nparts)
            .map(|_| (Mutex::new(Partition::new(per_part)), Condvar::new()))
            .collect();
        Self {
            partitions,
            stats: Stats {
                objs: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evicts: AtomicU64::new(0),
                failed_evicts: AtomicU64::new(0),
            },
            max_size: cfg.max_size,
        }
    }

    fn partition_of(&self, fp: &Fingerprint) -> &(Mutex<Partition>, Condvar) {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        fp.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.partitions.len();
        &self.partitions[idx]
    }

    /// Look up a fingerprint; a hit upvotes the record.
    #[must_use]
    pub fn get(&self, fp: &Fingerprint) -> Option<CacheBuf> {
        let (lock, _) = self.partition_of(fp);
        let mut part = lock.lock();
        if let Some(rec) = part.index.get(fp) {
            let buf = Arc::clone(&rec.buf);
            part.policy.upvote(fp);
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            Some(buf)
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Insert a buffer, evicting as needed. Returns false when the
    /// admission failed because eviction could not reclaim enough bytes.
    pub fn insert(&self, fp: Fingerprint, buf: CacheBuf) -> bool {
        let (lock, _) = self.partition_of(&fp);
        let mut part = lock.lock();
        self.insert_locked(&mut part, fp, buf)
    }

    fn insert_locked(&self, part: &mut Partition, fp: Fingerprint, buf: CacheBuf) -> bool {
        let size = buf.len();
        if let Some(old) = part.index.remove(&fp) {
            part.cur_size -= old.size;
            part.policy.remove(&fp);
            self.stats.objs.fetch_sub(1, Ordering::Relaxed);
        }

        if part.cur_size + size > part.max_size {
            let needed = part.cur_size + size - part.max_size;
            if !self.do_evict(part, needed) {
                warn!(
                    target: "om::cache",
                    event = "admission_reject",
                    needed,
                    cur_size = part.cur_size,
                );
                return false;
            }
        }

        part.cur_size += size;
        part.index.insert(fp.clone(), CacheRecord { buf, size });
        part.policy.add(fp);
        self.stats.objs.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Walk eviction candidates until at least `needed` bytes come free.
    ///
    /// A record still referenced outside the cache cannot be evicted; such
    /// a record is kept and counted as a failed eviction.
    fn do_evict(&self, part: &mut Partition, needed: usize) -> bool {
        let mut reclaimed = 0_usize;
        let mut victims: Vec<Fingerprint> = Vec::new();
        let index = &part.index;
        let stats = &self.stats;
        part.policy.eject_next_candidate(|fp| {
            let Some(rec) = index.get(fp) else {
                // Stale policy entry; treat as already gone.
                return EjectVerdict::Evict;
            };
            if Arc::strong_count(&rec.buf) > 1 {
                stats.failed_evicts.fetch_add(1, Ordering::Relaxed);
                return EjectVerdict::Keep;
            }
            reclaimed += rec.size;
            victims.push(fp.clone());
            if reclaimed >= needed {
                EjectVerdict::EvictAndStop
            } else {
                EjectVerdict::Evict
            }
        });

        for fp in &victims {
            if let Some(rec) = part.index.remove(fp) {
                part.cur_size -= rec.size;
                self.stats.objs.fetch_sub(1, Ordering::Relaxed);
                self.stats.evicts.fetch_add(1, Ordering::Relaxed);
                trace!(target: "om::cache", event = "evict", size = rec.size);
            }
        }
        reclaimed >= needed
    }

    /// Drop a record, e.g. when the underlying blocks are freed.
    pub fn invalidate(&self, fp: &Fingerprint) {
        let (lock, _) = self.partition_of(fp);
        let mut part = lock.lock();
        if let Some(rec) = part.index.remove(fp) {
            part.cur_size -= rec.size;
            part.policy.remove(fp);
            self.stats.objs.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Get the record, or materialize it with `loader` on first touch.
    ///
    /// For any key, concurrent callers produce exactly one materialization:
    /// later arrivals block until the winner finishes, then observe its
    /// result (or retry the load themselves if the winner failed).
    pub fn get_or_load(
        &self,
        fp: &Fingerprint,
        loader: impl FnOnce() -> Result<Vec<u8>>,
    ) -> Result<CacheBuf> {
        let (lock, cond) = self.partition_of(fp);
        let mut part = lock.lock();
        loop {
            if let Some(rec) = part.index.get(fp) {
                let buf = Arc::clone(&rec.buf);
                part.policy.upvote(fp);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(buf);
            }
            if part.loading.contains(fp) {
                cond.wait(&mut part);
                continue;
            }
            break;
        }
        part.loading.insert(fp.clone());
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        drop(part);

        let loaded = loader();

        let mut part = lock.lock();
        part.loading.remove(fp);
        cond.notify_all();
        let bytes = loaded?;
        let buf = Arc::new(bytes);
        let _ = self.insert_locked(&mut part, fp.clone(), Arc::clone(&buf));
        Ok(buf)
    }

    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        let current_size = self
            .partitions
            .iter()
            .map(|(lock, _)| lock.lock().cur_size)
            .sum();
        CacheMetrics {
            obj_count: self.stats.objs.load(Ordering::Relaxed),
            hit_count: self.stats.hits.load(Ordering::Relaxed),
            miss_count: self.stats.misses.load(Ordering::Relaxed),
            evict_count: self.stats.evicts.load(Ordering::Relaxed),
            failed_evict_count: self.stats.failed_evicts.load(Ordering::Relaxed),
            current_size,
            max_size: self.max_size,
        }
    }

    #[must_use]
    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use om_types::ChunkId;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    fn fp(n: u32) -> Fingerprint {
        Fingerprint::of_blkid(VdevId(0), BlkId::new(ChunkId(0), n, 1))
    }

    fn one_partition(max_size: usize) -> Cache {
        Cache::new(&CacheConfig {
            max_size,
            num_partitions: 1,
        })
    }

    #[test]
    fn insert_get_round_trip() {
        let cache = one_partition(1 << 20);
        assert!(cache.insert(fp(1), Arc::new(vec![7_u8; 128])));
        let got = cache.get(&fp(1)).expect("hit");
        assert_eq!(got.len(), 128);
        assert!(cache.get(&fp(2)).is_none());
        let m = cache.metrics();
        assert_eq!(m.hit_count, 1);
        assert_eq!(m.miss_count, 1);
    }

    #[test]
    fn size_bound_holds_under_eviction() {
        let cache = one_partition(1024);
        for i in 0..64_u32 {
            assert!(cache.insert(fp(i), Arc::new(vec![0_u8; 128])));
            assert!(cache.metrics().current_size <= 1024);
        }
        assert!(cache.metrics().evict_count > 0);
    }

    #[test]
    fn lru_victim_is_coldest() {
        let cache = one_partition(256);
        assert!(cache.insert(fp(1), Arc::new(vec![0_u8; 128])));
        assert!(cache.insert(fp(2), Arc::new(vec![0_u8; 128])));
        // Touch 1 so 2 becomes the eviction candidate.
        let _ = cache.get(&fp(1));
        assert!(cache.insert(fp(3), Arc::new(vec![0_u8; 128])));
        assert!(cache.get(&fp(1)).is_some());
        assert!(cache.get(&fp(2)).is_none());
    }

    #[test]
    fn pinned_record_fails_eviction() {
        let cache = one_partition(256);
        let pinned = Arc::new(vec![0_u8; 200]);
        assert!(cache.insert(fp(1), Arc::clone(&pinned)));
        // The only candidate is referenced outside the cache; admission of
        // a buffer that needs its bytes must fail.
        assert!(!cache.insert(fp(2), Arc::new(vec![0_u8; 200])));
        assert!(cache.metrics().failed_evict_count > 0);
        drop(pinned);
        assert!(cache.insert(fp(2), Arc::new(vec![0_u8; 200])));
    }

    #[test]
    fn invalidate_removes_record() {
        let cache = one_partition(1024);
        assert!(cache.insert(fp(1), Arc::new(vec![0_u8; 64])));
        cache.invalidate(&fp(1));
        assert!(cache.get(&fp(1)).is_none());
        assert_eq!(cache.metrics().current_size, 0);
    }

    #[test]
    fn get_or_load_materializes_once() {
        let cache = Arc::new(one_partition(1 << 20));
        let loads = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let loads = Arc::clone(&loads);
            let barrier = Arc::clone(&barrier);
            handles.push(std::thread::spawn(move || {
                barrier.wait();
                let buf = cache
                    .get_or_load(&fp(9), || {
                        loads.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(20));
                        Ok(vec![0xEE_u8; 512])
                    })
                    .expect("load");
                assert_eq!(buf.len(), 512);
            }));
        }
        for h in handles {
            h.join().expect("join");
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_load_releases_waiters() {
        let cache = one_partition(1 << 20);
        let err = cache
            .get_or_load(&fp(3), || Err(om_error::OmError::NotFound))
            .unwrap_err();
        assert!(matches!(err, om_error::OmError::NotFound));
        // The key is loadable again after the failure.
        let buf = cache
            .get_or_load(&fp(3), || Ok(vec![1_u8; 16]))
            .expect("second load");
        assert_eq!(buf.len(), 16);
    }

    #[test]
    fn hit_ratio_reported() {
        let cache = one_partition(1 << 20);
        assert!(cache.insert(fp(1), Arc::new(vec![0_u8; 16])));
        let _ = cache.get(&fp(1));
        let _ = cache.get(&fp(1));
        let _ = cache.get(&fp(2));
        assert_eq!(cache.metrics().hit_ratio(), 66);
    }
}
