//! # Allocator Statistics

use alloc::vec::Vec;

use crate::block::BlockInfo;
use crate::device::MemoryType;

/// Usage of one memory type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryTypeStatistics {
    /// Memory type index
    pub memory_type_index: u32,
    /// Heap index
    pub heap_index: u32,
    /// Live blocks
    pub block_count: u32,
    /// Live dedicated blocks
    pub dedicated_block_count: u32,
    /// Shareable blocks with no live allocation
    pub empty_block_count: u32,
    /// Bytes held from the device
    pub reserved_bytes: u64,
    /// Bytes in live allocations
    pub used_bytes: u64,
    /// Live allocations
    pub allocation_count: u32,
    /// Free ranges across shareable blocks
    pub free_range_count: u32,
    /// Largest free range in any shareable block
    pub largest_free_range: u64,
}

impl MemoryTypeStatistics {
    /// Aggregate a snapshot of the blocks of one memory type
    pub fn from_blocks(memory_type: &MemoryType, blocks: &[BlockInfo]) -> Self {
        let mut stats = Self {
            memory_type_index: memory_type.index,
            heap_index: memory_type.heap_index,
            ..Self::default()
        };

        for block in blocks {
            stats.block_count += 1;
            stats.reserved_bytes += block.size;
            stats.used_bytes += block.used;
            stats.allocation_count += block.allocation_count;
            if block.is_dedicated {
                stats.dedicated_block_count += 1;
                continue;
            }
            if block.allocation_count == 0 {
                stats.empty_block_count += 1;
            }
            stats.free_range_count += block.free_range_count;
            stats.largest_free_range = stats.largest_free_range.max(block.largest_free_range);
        }
        stats
    }

    /// Bytes held but not in use
    pub fn wasted_bytes(&self) -> u64 {
        self.reserved_bytes.saturating_sub(self.used_bytes)
    }

    /// Fragmentation estimate: 0.0 when free space is one range
    pub fn fragmentation(&self) -> f32 {
        let free = self.wasted_bytes();
        if free == 0 {
            0.0
        } else {
            1.0 - (self.largest_free_range as f32 / free as f32)
        }
    }
}

/// Usage of one memory heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStatistics {
    /// Heap index
    pub heap_index: u32,
    /// Heap size reported by the device
    pub size: u64,
    /// Bytes allocated from the heap by this allocator
    pub allocated_bytes: u64,
}

impl HeapStatistics {
    /// Remaining heap capacity
    pub fn available(&self) -> u64 {
        self.size.saturating_sub(self.allocated_bytes)
    }

    /// Utilization ratio
    pub fn utilization(&self) -> f32 {
        if self.size == 0 {
            0.0
        } else {
            self.allocated_bytes as f32 / self.size as f32
        }
    }
}

/// Allocator-wide statistics
#[derive(Debug, Clone, PartialEq)]
pub struct AllocatorStatistics {
    /// Per memory type, indexed by native type index
    pub memory_types: Vec<MemoryTypeStatistics>,
    /// Per heap, indexed by native heap index
    pub heaps: Vec<HeapStatistics>,
    /// Resources in the registry
    pub resource_count: usize,
}

impl AllocatorStatistics {
    /// Statistics of one memory type
    pub fn memory_type(&self, index: u32) -> Option<&MemoryTypeStatistics> {
        self.memory_types.get(index as usize)
    }

    /// Live blocks across all memory types
    pub fn total_blocks(&self) -> u32 {
        self.memory_types.iter().map(|t| t.block_count).sum()
    }

    /// Bytes held from the device
    pub fn total_reserved_bytes(&self) -> u64 {
        self.memory_types.iter().map(|t| t.reserved_bytes).sum()
    }

    /// Bytes in live allocations
    pub fn total_used_bytes(&self) -> u64 {
        self.memory_types.iter().map(|t| t.used_bytes).sum()
    }

    /// Overall utilization ratio
    pub fn utilization(&self) -> f32 {
        let reserved = self.total_reserved_bytes();
        if reserved == 0 {
            0.0
        } else {
            self.total_used_bytes() as f32 / reserved as f32
        }
    }
}
