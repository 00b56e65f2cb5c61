//! Reusable byte buffers grouped into size bands
//!
//! Blocks move free -> in-use -> free. The pool keeps bookkeeping for every
//! pooled block; the bytes themselves travel with the `PooledBlock` while it
//! is held and sit in the band's free list otherwise. Unpooled blocks are
//! plain allocations the pool forgets about.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{RawError, Result};

const MB: usize = 1024 * 1024;

/// Leading bytes cleared on release of large blocks
const ZERO_PREFIX: usize = 1024;
const ZERO_MIN_CAPACITY: usize = MB;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SizeBand {
    Small,
    Medium,
    Large,
    XLarge,
}

impl SizeBand {
    pub const ALL: [SizeBand; 4] = [SizeBand::Small, SizeBand::Medium, SizeBand::Large, SizeBand::XLarge];

    pub fn for_size(bytes: usize) -> Self {
        if bytes <= 5 * MB {
            SizeBand::Small
        } else if bytes <= 25 * MB {
            SizeBand::Medium
        } else if bytes <= 100 * MB {
            SizeBand::Large
        } else {
            SizeBand::XLarge
        }
    }

    /// Largest capacity a block in this band is rounded up to
    pub fn ceiling(self) -> usize {
        match self {
            SizeBand::Small => 5 * MB,
            SizeBand::Medium => 25 * MB,
            SizeBand::Large => 100 * MB,
            SizeBand::XLarge => usize::MAX,
        }
    }

    fn index(self) -> usize {
        match self {
            SizeBand::Small => 0,
            SizeBand::Medium => 1,
            SizeBand::Large => 2,
            SizeBand::XLarge => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BlockId(u64);

/// A buffer on loan from the pool. Hand it back with `MemoryBlockPool::release`.
#[derive(Debug)]
pub struct PooledBlock {
    id: BlockId,
    bytes: Vec<u8>,
    band: Option<SizeBand>,
    requested: usize,
    reuse_count: u64,
}

impl PooledBlock {
    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// `None` for pass-through blocks that bypass the pool
    pub fn band(&self) -> Option<SizeBand> {
        self.band
    }

    pub fn is_pooled(&self) -> bool {
        self.band.is_some()
    }

    pub fn reuse_count(&self) -> u64 {
        self.reuse_count
    }

    /// The requested prefix of the buffer
    pub fn data(&self) -> &[u8] {
        &self.bytes[..self.requested]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[..self.requested]
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LeakReport {
    pub id: BlockId,
    pub band: SizeBand,
    pub capacity: usize,
    pub held_for_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub unpooled: u64,
    pub evicted: u64,
    pub emergency_reclaims: u64,
    pub pooled_bytes: usize,
    pub in_use_blocks: usize,
    pub free_blocks: usize,
    pub blocks_per_band: [usize; 4],
}

impl PoolStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct BlockMeta {
    band: SizeBand,
    capacity: usize,
    in_use: bool,
    last_used: Instant,
    acquired_at: Instant,
    reuse_count: u64,
}

struct FreeBlock {
    id: BlockId,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct PoolState {
    meta: HashMap<BlockId, BlockMeta>,
    free: [Vec<FreeBlock>; 4],
    pooled_bytes: usize,
    next_id: u64,
    hits: u64,
    misses: u64,
    unpooled: u64,
    evicted: u64,
    emergency_reclaims: u64,
}

impl PoolState {
    fn next_id(&mut self) -> BlockId {
        self.next_id += 1;
        BlockId(self.next_id)
    }

    fn band_count(&self, band: SizeBand) -> usize {
        self.meta.values().filter(|m| m.band == band).count()
    }

    fn evict(&mut self, band: SizeBand, position: usize) -> usize {
        let block = self.free[band.index()].remove(position);
        let capacity = block.bytes.len();
        self.meta.remove(&block.id);
        self.pooled_bytes = self.pooled_bytes.saturating_sub(capacity);
        self.evicted += 1;
        capacity
    }
}

/// Outcome of the pooled path under the lock
enum Pooled {
    Hit(PooledBlock),
    /// Slot reserved; the caller allocates outside the lock
    Reserved { id: BlockId, capacity: usize },
    Exhausted,
}

pub struct MemoryBlockPool {
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl MemoryBlockPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Borrow a block with at least `requested` bytes of capacity
    pub fn acquire(&self, requested: usize) -> PooledBlock {
        let band = SizeBand::for_size(requested);

        let first = self.try_pooled(band, requested);
        let outcome = match first {
            Pooled::Exhausted => {
                self.emergency_reclaim();
                self.try_pooled(band, requested)
            }
            other => other,
        };

        match outcome {
            Pooled::Hit(block) => block,
            Pooled::Reserved { id, capacity } => {
                debug!("Pool allocated {:?} block {:?} ({} bytes)", band, id, capacity);
                PooledBlock {
                    id,
                    bytes: vec![0; capacity],
                    band: Some(band),
                    requested,
                    reuse_count: 0,
                }
            }
            Pooled::Exhausted => {
                let id = {
                    let mut state = self.lock_state();
                    state.unpooled += 1;
                    state.next_id()
                };
                debug!("Pool exhausted for {:?}, unpooled allocation of {} bytes", band, requested);
                PooledBlock {
                    id,
                    bytes: vec![0; requested],
                    band: None,
                    requested,
                    reuse_count: 0,
                }
            }
        }
    }

    /// Return a block. Unpooled or forgotten blocks are simply dropped.
    pub fn release(&self, mut block: PooledBlock) {
        let Some(band) = block.band else {
            return;
        };

        if block.bytes.len() >= ZERO_MIN_CAPACITY {
            block.bytes[..ZERO_PREFIX].fill(0);
        }

        let mut state = self.lock_state();
        let Some(meta) = state.meta.get_mut(&block.id) else {
            return;
        };
        meta.in_use = false;
        meta.last_used = Instant::now();
        state.free[band.index()].push(FreeBlock {
            id: block.id,
            bytes: block.bytes,
        });
    }

    fn try_pooled(&self, band: SizeBand, requested: usize) -> Pooled {
        let mut state = self.lock_state();

        let best_fit = state.free[band.index()]
            .iter()
            .enumerate()
            .filter(|(_, b)| b.bytes.len() >= requested)
            .min_by_key(|(_, b)| b.bytes.len())
            .map(|(i, _)| i);

        if let Some(position) = best_fit {
            let free = state.free[band.index()].swap_remove(position);
            state.hits += 1;
            let now = Instant::now();
            let reuse_count = match state.meta.get_mut(&free.id) {
                Some(meta) => {
                    meta.in_use = true;
                    meta.reuse_count += 1;
                    meta.last_used = now;
                    meta.acquired_at = now;
                    meta.reuse_count
                }
                None => 0,
            };
            return Pooled::Hit(PooledBlock {
                id: free.id,
                bytes: free.bytes,
                band: Some(band),
                requested,
                reuse_count,
            });
        }

        let capacity = block_capacity(band, requested);
        let under_cap = state.band_count(band) < self.config.max_blocks_per_band[band.index()];
        let under_limit = state.pooled_bytes.saturating_add(capacity) <= self.config.emergency_limit_bytes();
        if !(under_cap && under_limit) {
            return Pooled::Exhausted;
        }

        state.misses += 1;
        state.pooled_bytes += capacity;
        let id = state.next_id();
        let now = Instant::now();
        state.meta.insert(
            id,
            BlockMeta {
                band,
                capacity,
                in_use: true,
                last_used: now,
                acquired_at: now,
                reuse_count: 0,
            },
        );
        Pooled::Reserved { id, capacity }
    }

    /// Evict the least recently used half of every band's free blocks
    fn emergency_reclaim(&self) {
        let mut state = self.lock_state();
        state.emergency_reclaims += 1;

        let mut freed = 0usize;
        for band in SizeBand::ALL {
            let mut order: Vec<(BlockId, Instant)> = state.free[band.index()]
                .iter()
                .map(|b| {
                    let last = state.meta.get(&b.id).map(|m| m.last_used).unwrap_or_else(Instant::now);
                    (b.id, last)
                })
                .collect();
            order.sort_by_key(|(_, last)| *last);

            let evict_count = order.len().div_ceil(2);
            for (id, _) in order.into_iter().take(evict_count) {
                if let Some(position) = state.free[band.index()].iter().position(|b| b.id == id) {
                    freed += state.evict(band, position);
                }
            }
        }

        info!("Pool emergency reclamation freed {} bytes", freed);
    }

    /// Read a whole file into a borrowed block and hand its bytes to `f`.
    /// The block is returned to the pool whatever `f` yields.
    pub fn with_file<T>(&self, path: &Path, f: impl FnOnce(&[u8]) -> Result<T>) -> Result<T> {
        let mut file = std::fs::File::open(path)?;
        let len = usize::try_from(file.metadata()?.len())
            .map_err(|_| RawError::Processing(format!("{} is too large to buffer", path.display())))?;

        let mut block = self.acquire(len);
        let result = file
            .read_exact(block.data_mut())
            .map_err(RawError::from)
            .and_then(|()| f(block.data()));
        self.release(block);
        result
    }

    /// Drop free blocks idle for at least `max_age` that were reused fewer than twice
    pub fn evict_idle(&self, max_age: Duration) -> usize {
        let mut state = self.lock_state();
        let now = Instant::now();
        let mut evicted = 0;

        for band in SizeBand::ALL {
            let stale: Vec<BlockId> = state.free[band.index()]
                .iter()
                .filter(|b| {
                    state.meta.get(&b.id).is_some_and(|m| {
                        m.reuse_count < 2 && now.duration_since(m.last_used) >= max_age
                    })
                })
                .map(|b| b.id)
                .collect();

            for id in stale {
                if let Some(position) = state.free[band.index()].iter().position(|b| b.id == id) {
                    state.evict(band, position);
                    evicted += 1;
                }
            }
        }

        if evicted > 0 {
            debug!("Evicted {} idle pool blocks", evicted);
        }
        evicted
    }

    /// Report blocks held longer than `threshold`. Signal only; nothing is reclaimed.
    pub fn detect_leaks(&self, threshold: Duration) -> Vec<LeakReport> {
        let now = Instant::now();
        let reports: Vec<LeakReport> = self
            .lock_state()
            .meta
            .iter()
            .filter(|(_, m)| m.in_use && now.duration_since(m.acquired_at) >= threshold)
            .map(|(id, m)| LeakReport {
                id: *id,
                band: m.band,
                capacity: m.capacity,
                held_for_secs: now.duration_since(m.acquired_at).as_secs(),
            })
            .collect();

        for leak in &reports {
            warn!(
                "Possible pool leak: {:?} block {:?} ({} bytes) held for {}s",
                leak.band, leak.id, leak.capacity, leak.held_for_secs
            );
        }
        reports
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        let mut blocks_per_band = [0usize; 4];
        for meta in state.meta.values() {
            blocks_per_band[meta.band.index()] += 1;
        }

        PoolStats {
            hits: state.hits,
            misses: state.misses,
            unpooled: state.unpooled,
            evicted: state.evicted,
            emergency_reclaims: state.emergency_reclaims,
            pooled_bytes: state.pooled_bytes,
            in_use_blocks: state.meta.values().filter(|m| m.in_use).count(),
            free_blocks: state.free.iter().map(Vec::len).sum(),
            blocks_per_band,
        }
    }

    /// Forget every block. Outstanding blocks become pass-through on release.
    /// Block ids keep counting up, so a stale block never matches a new one.
    pub fn reset(&self) {
        let mut state = self.lock_state();
        let next_id = state.next_id;
        *state = PoolState {
            next_id,
            ..PoolState::default()
        };
    }

    /// Periodic idle eviction and leak detection on the tokio runtime
    pub fn spawn_maintenance(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.maintenance_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.evict_idle(self.config.idle_max_age);
                self.detect_leaks(self.config.leak_threshold);
            }
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryBlockPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

/// `min(nextPowerOfTwo, requested * 1.2, band ceiling)`, never below `requested`
fn block_capacity(band: SizeBand, requested: usize) -> usize {
    let next_pow2 = requested.checked_next_power_of_two().unwrap_or(usize::MAX);
    let padded = requested.saturating_add(requested.div_ceil(5));
    next_pow2.min(padded).min(band.ceiling()).max(requested)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(max_blocks: [usize; 4]) -> MemoryBlockPool {
        MemoryBlockPool::new(PoolConfig {
            max_blocks_per_band: max_blocks,
            ..PoolConfig::default()
        })
    }

    #[test]
    fn test_band_mapping() {
        assert_eq!(SizeBand::for_size(MB), SizeBand::Small);
        assert_eq!(SizeBand::for_size(5 * MB), SizeBand::Small);
        assert_eq!(SizeBand::for_size(10 * MB), SizeBand::Medium);
        assert_eq!(SizeBand::for_size(50 * MB), SizeBand::Large);
        assert_eq!(SizeBand::for_size(200 * MB), SizeBand::XLarge);
    }

    #[test]
    fn test_block_capacity_rounding() {
        assert_eq!(block_capacity(SizeBand::Small, 1024), 1024);
        assert_eq!(block_capacity(SizeBand::Small, 1000), 1024);
        assert_eq!(block_capacity(SizeBand::Small, 3000), 3600);
        // clamped to the band ceiling
        assert_eq!(block_capacity(SizeBand::Small, 5 * MB - 1), 5 * MB);
        assert_eq!(block_capacity(SizeBand::Small, 0), 0);
    }

    #[test]
    fn test_acquire_capacity_covers_request() {
        let pool = MemoryBlockPool::default();
        for size in [1, 777, 4096, 300_000, 2 * MB + 3] {
            let mut block = pool.acquire(size);
            assert!(block.capacity() >= size);
            assert_eq!(block.data().len(), size);
            block.data_mut()[size - 1] = 7;
            pool.release(block);
        }
    }

    #[test]
    fn test_release_then_acquire_returns_same_block() {
        let pool = MemoryBlockPool::default();
        let block = pool.acquire(64 * 1024);
        let id = block.id();
        pool.release(block);

        let again = pool.acquire(32 * 1024);
        assert_eq!(again.id(), id);
        assert_eq!(again.reuse_count(), 1);
        assert_eq!(pool.stats().hits, 1);
    }

    #[test]
    fn test_band_cap_falls_back_to_unpooled() {
        let pool = pool_with([1, 1, 1, 1]);
        let held = pool.acquire(1024);
        let extra = pool.acquire(1024);

        assert!(held.is_pooled());
        assert!(!extra.is_pooled());
        assert_eq!(extra.capacity(), 1024);

        pool.release(extra);
        let stats = pool.stats();
        assert_eq!(stats.unpooled, 1);
        assert_eq!(stats.free_blocks, 0);
        assert_eq!(stats.emergency_reclaims, 1);
    }

    #[test]
    fn test_emergency_reclaim_evicts_oldest_free_blocks() {
        let pool = pool_with([2, 10, 4, 2]);
        let a = pool.acquire(1024);
        let b = pool.acquire(1024);
        let (a_id, b_id) = (a.id(), b.id());
        pool.release(a);
        std::thread::sleep(Duration::from_millis(5));
        pool.release(b);

        // neither free block fits and the band is full
        let big = pool.acquire(4096);
        assert!(big.is_pooled());
        assert_ne!(big.id(), a_id);
        assert_ne!(big.id(), b_id);

        let stats = pool.stats();
        assert_eq!(stats.emergency_reclaims, 1);
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.free_blocks, 1);

        // the more recently used block survived
        let small = pool.acquire(512);
        assert_eq!(small.id(), b_id);
    }

    #[test]
    fn test_emergency_limit_blocks_new_pooled_allocations() {
        let pool = MemoryBlockPool::new(PoolConfig {
            memory_ceiling_bytes: 4096,
            ..PoolConfig::default()
        });
        let first = pool.acquire(2048);
        let second = pool.acquire(2048);
        assert!(first.is_pooled());
        assert!(!second.is_pooled());
    }

    #[test]
    fn test_release_zeroes_leading_bytes_of_large_blocks() {
        let pool = MemoryBlockPool::default();
        let mut block = pool.acquire(MB);
        block.data_mut().fill(0xFF);
        pool.release(block);

        let block = pool.acquire(MB);
        assert!(block.data()[..ZERO_PREFIX].iter().all(|&b| b == 0));
        assert_eq!(block.data()[ZERO_PREFIX], 0xFF);
    }

    #[test]
    fn test_small_blocks_are_not_zeroed() {
        let pool = MemoryBlockPool::default();
        let mut block = pool.acquire(2048);
        block.data_mut().fill(0xAB);
        pool.release(block);

        let block = pool.acquire(2048);
        assert_eq!(block.data()[0], 0xAB);
    }

    #[test]
    fn test_leak_detection_reports_without_reclaiming() {
        let pool = MemoryBlockPool::default();
        let held = pool.acquire(4096);
        let returned = pool.acquire(4096);
        pool.release(returned);

        let leaks = pool.detect_leaks(Duration::ZERO);
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].id, held.id());
        assert!(pool.detect_leaks(Duration::from_secs(600)).is_empty());
        assert_eq!(pool.stats().in_use_blocks, 1);
    }

    #[test]
    fn test_evict_idle_spares_frequently_reused_blocks() {
        let pool = MemoryBlockPool::default();
        let once = pool.acquire(1000);
        let hot = pool.acquire(100_000);
        let hot_id = hot.id();
        pool.release(once);
        pool.release(hot);
        for _ in 0..2 {
            let again = pool.acquire(100_000);
            assert_eq!(again.id(), hot_id);
            pool.release(again);
        }

        assert_eq!(pool.evict_idle(Duration::from_secs(3600)), 0);
        assert_eq!(pool.evict_idle(Duration::ZERO), 1);
        assert_eq!(pool.stats().free_blocks, 1);
    }

    #[test]
    fn test_with_file_returns_block_even_on_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("frame.tiff");
        std::fs::write(&path, vec![9u8; 3000]).unwrap();

        let pool = MemoryBlockPool::default();
        let sum = pool.with_file(&path, |bytes| Ok(bytes.iter().map(|&b| b as u64).sum::<u64>())).unwrap();
        assert_eq!(sum, 27_000);

        let err = pool
            .with_file(&path, |_| Err::<(), _>(RawError::Processing("decode failed".into())))
            .unwrap_err();
        assert!(matches!(err, RawError::Processing(_)));

        let stats = pool.stats();
        assert_eq!(stats.in_use_blocks, 0);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn test_reset_turns_outstanding_blocks_into_pass_through() {
        let pool = MemoryBlockPool::default();
        let block = pool.acquire(4096);
        pool.reset();
        pool.release(block);

        let stats = pool.stats();
        assert_eq!(stats.free_blocks, 0);
        assert_eq!(stats.pooled_bytes, 0);
    }

    #[test]
    fn test_block_from_before_reset_never_aliases_a_live_block() {
        let pool = MemoryBlockPool::default();
        let stale = pool.acquire(4096);
        pool.reset();

        let live = pool.acquire(4096);
        assert_ne!(stale.id(), live.id());

        pool.release(stale);
        let next = pool.acquire(4096);
        assert_ne!(next.id(), live.id());

        let stats = pool.stats();
        assert_eq!(stats.in_use_blocks, 2);
        assert_eq!(stats.free_blocks, 0);
    }
}
