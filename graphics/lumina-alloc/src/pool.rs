//! # Block Allocator
//!
//! Owns the blocks of every memory type and places regions into them.
//!
//! ## Locking
//!
//! ```text
//! pool (per memory type)   RwLock<Vec<Arc<MemoryBlock>>>
//!   └── block              Mutex<BlockState>
//! ```
//!
//! Locks are always taken pool first, then block. Fits are searched under the
//! pool read lock so allocations in different blocks proceed in parallel.
//! Creating or removing a block takes the pool write lock, which also
//! guarantees no reservation races with the emptiness check on release.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::RwLock;

use crate::block::{Allocation, BlockId, BlockInfo, MemoryBlock};
use crate::config::{AllocatorConfig, ReleasePolicy};
use crate::device::{MemoryDevice, MemoryProperties, MemoryType};
use crate::error::{Error, Result};
use crate::region::align_up;
use crate::stats::{HeapStatistics, MemoryTypeStatistics};

// =============================================================================
// MEMORY TYPE POOL
// =============================================================================

/// Blocks of one memory type, in creation order
#[derive(Debug)]
struct MemoryTypePool {
    memory_type: MemoryType,
    blocks: RwLock<Vec<Arc<MemoryBlock>>>,
}

impl MemoryTypePool {
    fn reserve_in(blocks: &[Arc<MemoryBlock>], size: u64, alignment: u64) -> Option<Allocation> {
        blocks
            .iter()
            .filter(|b| !b.is_dedicated())
            .find_map(|b| {
                b.try_reserve(size, alignment)
                    .map(|offset| Allocation::new(Arc::clone(b), offset, size, alignment))
            })
    }

    fn empty_shareable_count(&self) -> usize {
        self.blocks
            .read()
            .iter()
            .filter(|b| !b.is_dedicated() && b.is_unused())
            .count()
    }
}

// =============================================================================
// BLOCK ALLOCATOR
// =============================================================================

/// Per-memory-type block pools
#[derive(Debug)]
pub struct BlockAllocator {
    pools: Vec<MemoryTypePool>,
    heaps: Vec<(u64, AtomicU64)>,
    config: AllocatorConfig,
    allocation_granularity: u64,
    next_block_id: AtomicU64,
}

impl BlockAllocator {
    /// Create empty pools for every enumerated memory type
    pub fn new(properties: &MemoryProperties, config: AllocatorConfig) -> Self {
        let pools = properties
            .memory_types
            .iter()
            .map(|memory_type| MemoryTypePool {
                memory_type: *memory_type,
                blocks: RwLock::new(Vec::new()),
            })
            .collect();

        let heaps = properties
            .memory_heaps
            .iter()
            .map(|heap| (heap.size, AtomicU64::new(0)))
            .collect();

        Self {
            pools,
            heaps,
            config,
            allocation_granularity: properties.allocation_granularity.max(1),
            next_block_id: AtomicU64::new(1),
        }
    }

    /// Configuration in effect
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    fn pool(&self, memory_type_index: u32) -> Result<&MemoryTypePool> {
        self.pools
            .get(memory_type_index as usize)
            .ok_or(Error::InvalidRequest("memory type index out of range"))
    }

    fn round_to_granularity(&self, size: u64) -> Result<u64> {
        align_up(size, self.allocation_granularity)
            .ok_or(Error::InvalidRequest("allocation size overflows"))
    }

    /// Place `size` bytes aligned to `alignment` in memory of the given type
    ///
    /// Shareable requests go first-fit into existing blocks, oldest first; a
    /// new block of at least the default block size is created when none
    /// fits. Dedicated requests always get a fresh block of their own.
    pub fn acquire_region<D: MemoryDevice>(
        &self,
        device: &D,
        memory_type_index: u32,
        size: u64,
        alignment: u64,
        dedicated: bool,
    ) -> Result<Allocation> {
        if size == 0 {
            return Err(Error::InvalidRequest("allocation size must be non-zero"));
        }
        if !alignment.is_power_of_two() {
            return Err(Error::InvalidRequest("alignment must be a power of two"));
        }

        let pool = self.pool(memory_type_index)?;
        if dedicated {
            return self.acquire_dedicated(device, pool, size, alignment);
        }

        {
            let blocks = pool.blocks.read();
            if let Some(allocation) = MemoryTypePool::reserve_in(&blocks, size, alignment) {
                return Ok(allocation);
            }
        }

        let mut blocks = pool.blocks.write();

        // Another thread may have grown the pool while we waited
        if let Some(allocation) = MemoryTypePool::reserve_in(&blocks, size, alignment) {
            return Ok(allocation);
        }

        let block_size = self.round_to_granularity(size.max(self.config.default_block_size))?;
        let block = Arc::new(self.create_block(device, &pool.memory_type, block_size, false)?);
        blocks.push(Arc::clone(&block));

        let offset = block
            .try_reserve(size, alignment)
            .ok_or(Error::InvalidRequest("request does not fit a new block"))?;

        Ok(Allocation::new(block, offset, size, alignment))
    }

    fn acquire_dedicated<D: MemoryDevice>(
        &self,
        device: &D,
        pool: &MemoryTypePool,
        size: u64,
        alignment: u64,
    ) -> Result<Allocation> {
        let block_size = self.round_to_granularity(size)?;
        let block = Arc::new(self.create_block(device, &pool.memory_type, block_size, true)?);
        block.claim_dedicated();

        pool.blocks.write().push(Arc::clone(&block));

        Ok(Allocation::new(block, 0, block_size, alignment))
    }

    fn create_block<D: MemoryDevice>(
        &self,
        device: &D,
        memory_type: &MemoryType,
        size: u64,
        dedicated: bool,
    ) -> Result<MemoryBlock> {
        let memory = device
            .allocate_memory(memory_type.index, size)
            .map_err(|err| {
                log::warn!(
                    "memory type {}: native allocation of {} bytes failed: {}",
                    memory_type.index,
                    size,
                    err
                );
                if err.is_out_of_memory() {
                    Error::DeviceOutOfMemory {
                        memory_type_index: memory_type.index,
                        size,
                    }
                } else {
                    Error::Device(err)
                }
            })?;

        let id = BlockId(self.next_block_id.fetch_add(1, Ordering::Relaxed));
        if let Some((_, used)) = self.heaps.get(memory_type.heap_index as usize) {
            used.fetch_add(size, Ordering::Relaxed);
        }

        log::debug!(
            "block {}: allocated {} bytes of memory type {}{}",
            id.0,
            size,
            memory_type.index,
            if dedicated { " (dedicated)" } else { "" }
        );

        Ok(MemoryBlock::new(
            id,
            memory,
            memory_type.index,
            memory_type.heap_index,
            memory_type.property_flags,
            size,
            dedicated,
        ))
    }

    /// Give a region back to its block
    ///
    /// Dedicated blocks are returned to the device immediately. A shareable
    /// block left empty is kept or released according to the release policy.
    pub fn release_region<D: MemoryDevice>(&self, device: &D, allocation: Allocation) {
        let block = Arc::clone(allocation.block());
        let (offset, size) = (allocation.offset(), allocation.size());
        drop(allocation);

        let Ok(pool) = self.pool(block.memory_type_index()) else {
            return;
        };

        if block.is_dedicated() {
            block.release(offset, size);
            self.remove_if_unused(device, pool, &block);
            return;
        }

        if block.release(offset, size) > 0 {
            return;
        }

        let release = match self.config.release_policy {
            ReleasePolicy::Eager => true,
            ReleasePolicy::Retain => {
                let cap = self.config.max_retained_blocks_per_type;
                cap > 0 && pool.empty_shareable_count() > cap
            },
        };
        if release {
            self.remove_if_unused(device, pool, &block);
        }
    }

    fn remove_if_unused<D: MemoryDevice>(
        &self,
        device: &D,
        pool: &MemoryTypePool,
        block: &Arc<MemoryBlock>,
    ) -> bool {
        let mut blocks = pool.blocks.write();

        // A reservation may have landed between the release and this lock
        if !block.is_unused() {
            return false;
        }
        let Some(position) = blocks.iter().position(|b| Arc::ptr_eq(b, block)) else {
            return false;
        };
        let removed = blocks.remove(position);
        drop(blocks);

        self.destroy_block(device, &removed);
        true
    }

    fn destroy_block<D: MemoryDevice>(&self, device: &D, block: &MemoryBlock) {
        block.destroy(device);
        if let Some((_, used)) = self.heaps.get(block.heap_index() as usize) {
            used.fetch_sub(block.size(), Ordering::Relaxed);
        }
    }

    /// Release every empty shareable block; returns how many were released
    pub fn trim<D: MemoryDevice>(&self, device: &D) -> usize {
        let mut released = 0;
        for pool in &self.pools {
            let unused: Vec<Arc<MemoryBlock>> = {
                let mut blocks = pool.blocks.write();
                let (keep, unused) = core::mem::take(&mut *blocks)
                    .into_iter()
                    .partition(|b| b.is_dedicated() || !b.is_unused());
                *blocks = keep;
                unused
            };

            for block in &unused {
                self.destroy_block(device, block);
            }
            released += unused.len();
        }
        released
    }

    /// Destroy every block at teardown; returns how many were left alive
    ///
    /// Blocks still backing raw allocations keep their native memory so the
    /// caller's handles stay valid.
    pub(crate) fn destroy_all<D: MemoryDevice>(&self, device: &D) -> usize {
        let mut kept = 0;
        for pool in &self.pools {
            let blocks = core::mem::take(&mut *pool.blocks.write());
            for block in &blocks {
                let info = block.info();
                if info.allocation_count == 0 {
                    self.destroy_block(device, block);
                } else {
                    log::error!(
                        "{:?} still backs {} raw allocations; its memory is not freed",
                        info.id,
                        info.allocation_count
                    );
                    kept += 1;
                }
            }
        }
        kept
    }

    /// Number of live blocks, dedicated included, of a memory type
    pub fn block_count(&self, memory_type_index: u32) -> usize {
        self.pools
            .get(memory_type_index as usize)
            .map_or(0, |pool| pool.blocks.read().len())
    }

    /// Snapshot of the blocks of a memory type, in creation order
    pub fn blocks(&self, memory_type_index: u32) -> Vec<BlockInfo> {
        self.pools
            .get(memory_type_index as usize)
            .map(|pool| pool.blocks.read().iter().map(|b| b.info()).collect())
            .unwrap_or_default()
    }

    /// Verify the free-list invariants of every block
    pub fn check_invariants(&self) -> core::result::Result<(), &'static str> {
        for pool in &self.pools {
            for block in pool.blocks.read().iter() {
                block.check_invariants()?;
            }
        }
        Ok(())
    }

    /// Bytes allocated from a heap
    pub fn heap_usage(&self, heap_index: u32) -> u64 {
        self.heaps
            .get(heap_index as usize)
            .map_or(0, |(_, used)| used.load(Ordering::Relaxed))
    }

    /// Per-memory-type statistics
    pub fn memory_type_statistics(&self) -> Vec<MemoryTypeStatistics> {
        self.pools
            .iter()
            .map(|pool| {
                let blocks: Vec<BlockInfo> = pool.blocks.read().iter().map(|b| b.info()).collect();
                MemoryTypeStatistics::from_blocks(&pool.memory_type, &blocks)
            })
            .collect()
    }

    /// Per-heap statistics
    pub fn heap_statistics(&self) -> Vec<HeapStatistics> {
        self.heaps
            .iter()
            .enumerate()
            .map(|(index, (size, used))| HeapStatistics {
                heap_index: index as u32,
                size: *size,
                allocated_bytes: used.load(Ordering::Relaxed),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDevice;

    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;

    fn allocator(device: &MockDevice, config: AllocatorConfig) -> BlockAllocator {
        BlockAllocator::new(&device.memory_properties(), config)
    }

    #[test]
    fn test_first_request_creates_default_block() {
        let device = MockDevice::discrete();
        let blocks = allocator(&device, AllocatorConfig::default());

        let allocation = blocks.acquire_region(&device, 0, MB, 256, false).unwrap();
        assert_eq!(allocation.offset(), 0);
        assert_eq!(blocks.block_count(0), 1);
        assert!(blocks.blocks(0)[0].size >= AllocatorConfig::default().default_block_size);

        blocks.release_region(&device, allocation);
    }

    #[test]
    fn test_oldest_block_first() {
        let device = MockDevice::discrete();
        let blocks = allocator(&device, AllocatorConfig::default().with_block_size(4 * KB));

        let a = blocks.acquire_region(&device, 1, 4 * KB, 1, false).unwrap();
        let b = blocks.acquire_region(&device, 1, 2 * KB, 1, false).unwrap();
        assert_eq!(blocks.block_count(1), 2);
        assert_ne!(a.block().id(), b.block().id());

        blocks.release_region(&device, a);

        // Oldest block is empty again and wins over the half-used newer one
        let c = blocks.acquire_region(&device, 1, KB, 1, false).unwrap();
        assert_eq!(c.block().id(), blocks.blocks(1)[0].id);

        blocks.release_region(&device, b);
        blocks.release_region(&device, c);
    }

    #[test]
    fn test_oversized_request_gets_larger_block() {
        let device = MockDevice::discrete();
        let blocks = allocator(&device, AllocatorConfig::default().with_block_size(4 * KB));

        let allocation = blocks.acquire_region(&device, 0, 10 * KB, 1, false).unwrap();
        assert_eq!(blocks.blocks(0)[0].size, 10 * KB);
        blocks.release_region(&device, allocation);
    }

    #[test]
    fn test_block_size_rounded_to_granularity() {
        let device = MockDevice::discrete().with_allocation_granularity(64 * KB);
        let blocks = allocator(&device, AllocatorConfig::default().with_block_size(4 * KB));

        let shared = blocks.acquire_region(&device, 0, 100, 1, false).unwrap();
        let dedicated = blocks.acquire_region(&device, 0, 65 * KB, 1, true).unwrap();

        assert_eq!(shared.block().size(), 64 * KB);
        assert_eq!(dedicated.size(), 128 * KB);

        blocks.release_region(&device, shared);
        blocks.release_region(&device, dedicated);
    }

    #[test]
    fn test_retain_policy_keeps_empty_block() {
        let device = MockDevice::discrete();
        let blocks = allocator(&device, AllocatorConfig::default());

        let allocation = blocks.acquire_region(&device, 0, MB, 256, false).unwrap();
        blocks.release_region(&device, allocation);

        assert_eq!(blocks.block_count(0), 1);
        assert_eq!(device.live_memory_count(), 1);

        assert_eq!(blocks.trim(&device), 1);
        assert_eq!(blocks.block_count(0), 0);
        assert_eq!(device.live_memory_count(), 0);
    }

    #[test]
    fn test_eager_policy_releases_empty_block() {
        let device = MockDevice::discrete();
        let blocks = allocator(
            &device,
            AllocatorConfig::default().with_release_policy(ReleasePolicy::Eager),
        );

        let a = blocks.acquire_region(&device, 0, MB, 256, false).unwrap();
        let b = blocks.acquire_region(&device, 0, MB, 256, false).unwrap();
        assert_eq!(blocks.block_count(0), 1);

        blocks.release_region(&device, a);
        assert_eq!(blocks.block_count(0), 1);

        blocks.release_region(&device, b);
        assert_eq!(blocks.block_count(0), 0);
        assert_eq!(device.live_memory_count(), 0);
        assert_eq!(blocks.heap_usage(0), 0);
    }

    #[test]
    fn test_retain_cap_releases_excess() {
        let device = MockDevice::discrete();
        let blocks = allocator(
            &device,
            AllocatorConfig::default()
                .with_block_size(4 * KB)
                .with_max_retained_blocks(1),
        );

        let a = blocks.acquire_region(&device, 1, 4 * KB, 1, false).unwrap();
        let b = blocks.acquire_region(&device, 1, 4 * KB, 1, false).unwrap();
        assert_eq!(blocks.block_count(1), 2);

        blocks.release_region(&device, a);
        assert_eq!(blocks.block_count(1), 2);

        blocks.release_region(&device, b);
        assert_eq!(blocks.block_count(1), 1);
    }

    #[test]
    fn test_dedicated_block_isolated_and_released() {
        let device = MockDevice::discrete();
        let blocks = allocator(&device, AllocatorConfig::default());

        let dedicated = blocks.acquire_region(&device, 0, 64 * MB, 256, true).unwrap();
        assert!(dedicated.is_dedicated());
        assert_eq!(dedicated.offset(), 0);
        assert_eq!(blocks.block_count(0), 1);

        // Shared requests never land in the dedicated block
        let shared = blocks.acquire_region(&device, 0, KB, 1, false).unwrap();
        assert_ne!(shared.block().id(), dedicated.block().id());
        assert_eq!(blocks.block_count(0), 2);

        blocks.release_region(&device, dedicated);
        assert_eq!(blocks.block_count(0), 1);

        blocks.release_region(&device, shared);
    }

    #[test]
    fn test_out_of_memory_leaves_no_block() {
        let device = MockDevice::discrete().with_heap_size(0, 16 * MB);
        let blocks = allocator(&device, AllocatorConfig::default());

        let err = blocks.acquire_region(&device, 0, MB, 1, false).unwrap_err();
        assert_eq!(
            err,
            Error::DeviceOutOfMemory {
                memory_type_index: 0,
                size: AllocatorConfig::default().default_block_size,
            }
        );
        assert_eq!(blocks.block_count(0), 0);
        assert_eq!(blocks.heap_usage(0), 0);
    }

    #[test]
    fn test_rejects_bad_requests() {
        let device = MockDevice::discrete();
        let blocks = allocator(&device, AllocatorConfig::default());

        assert!(blocks.acquire_region(&device, 0, 0, 1, false).is_err());
        assert!(blocks.acquire_region(&device, 0, 16, 3, false).is_err());
        assert!(blocks.acquire_region(&device, 99, 16, 1, false).is_err());
        assert_eq!(device.live_memory_count(), 0);
    }

    #[test]
    fn test_statistics_reflect_blocks() {
        let device = MockDevice::discrete();
        let blocks = allocator(&device, AllocatorConfig::default().with_block_size(MB));

        let a = blocks.acquire_region(&device, 0, 256 * KB, 1, false).unwrap();
        let b = blocks.acquire_region(&device, 0, 2 * MB, 1, true).unwrap();

        let stats = &blocks.memory_type_statistics()[0];
        assert_eq!(stats.block_count, 2);
        assert_eq!(stats.dedicated_block_count, 1);
        assert_eq!(stats.reserved_bytes, 3 * MB);
        assert_eq!(stats.used_bytes, 256 * KB + 2 * MB);
        assert_eq!(blocks.heap_statistics()[0].allocated_bytes, 3 * MB);

        blocks.release_region(&device, a);
        blocks.release_region(&device, b);
        blocks.check_invariants().unwrap();
    }
}
