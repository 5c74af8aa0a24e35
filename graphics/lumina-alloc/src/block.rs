//! # Memory Blocks
//!
//! A block is one native device-memory allocation. Shareable blocks carry a
//! region tracker; dedicated blocks back exactly one resource.
//!
//! Each block guards its own free list and mapping state, so allocations in
//! different blocks never contend.

use alloc::sync::Arc;
use core::ptr::NonNull;

use spin::Mutex;

use crate::device::{DeviceMemory, MemoryDevice, MemoryPropertyFlags};
use crate::error::{Error, Result};
use crate::region::{FreeRange, RegionTracker};

// =============================================================================
// BLOCK ID
// =============================================================================

/// Block identifier, monotonically increasing in creation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u64);

// =============================================================================
// MAPPING
// =============================================================================

/// Host pointer to a mapped block
#[derive(Debug, Clone, Copy)]
struct MappedPtr(NonNull<u8>);

// SAFETY: the pointer is only an address into device memory owned by the
// block; every access through it is serialized by the block lock or by the
// caller that received it from `map`.
unsafe impl Send for MappedPtr {}

#[derive(Debug)]
struct Mapping {
    ptr: MappedPtr,
    count: u32,
}

// =============================================================================
// MEMORY BLOCK
// =============================================================================

#[derive(Debug)]
struct BlockState {
    /// `None` for dedicated blocks
    regions: Option<RegionTracker>,
    /// Live allocations
    live: u32,
    mapping: Option<Mapping>,
}

/// A contiguous block of device memory
#[derive(Debug)]
pub struct MemoryBlock {
    id: BlockId,
    memory: DeviceMemory,
    memory_type_index: u32,
    heap_index: u32,
    property_flags: MemoryPropertyFlags,
    size: u64,
    dedicated: bool,
    state: Mutex<BlockState>,
}

impl MemoryBlock {
    /// Wrap freshly allocated device memory
    pub(crate) fn new(
        id: BlockId,
        memory: DeviceMemory,
        memory_type_index: u32,
        heap_index: u32,
        property_flags: MemoryPropertyFlags,
        size: u64,
        dedicated: bool,
    ) -> Self {
        let regions = (!dedicated).then(|| RegionTracker::new(size));
        Self {
            id,
            memory,
            memory_type_index,
            heap_index,
            property_flags,
            size,
            dedicated,
            state: Mutex::new(BlockState {
                regions,
                live: 0,
                mapping: None,
            }),
        }
    }

    /// Block id
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// Native memory handle
    pub fn memory(&self) -> DeviceMemory {
        self.memory
    }

    /// Memory type index
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// Heap index
    pub fn heap_index(&self) -> u32 {
        self.heap_index
    }

    /// Property flags of the memory type
    pub fn property_flags(&self) -> MemoryPropertyFlags {
        self.property_flags
    }

    /// Block size
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Check if the block belongs to a single resource
    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }

    /// Check if the block has no live allocations
    pub fn is_unused(&self) -> bool {
        self.state.lock().live == 0
    }

    /// Reserve a range; `None` for dedicated blocks or when nothing fits
    pub(crate) fn try_reserve(&self, size: u64, alignment: u64) -> Option<u64> {
        let mut state = self.state.lock();
        let offset = state.regions.as_mut()?.reserve(size, alignment).ok()?;
        state.live += 1;
        Some(offset)
    }

    /// Claim the whole dedicated block
    pub(crate) fn claim_dedicated(&self) {
        debug_assert!(self.dedicated);
        self.state.lock().live = 1;
    }

    /// Release a range; returns live allocations remaining
    pub(crate) fn release(&self, offset: u64, size: u64) -> u32 {
        let mut state = self.state.lock();
        if let Some(regions) = state.regions.as_mut() {
            regions.release(offset, size);
        }
        state.live = state.live.saturating_sub(1);
        state.live
    }

    /// Map the whole block, or bump the map count if already mapped
    pub(crate) fn map<D: MemoryDevice>(&self, device: &D) -> Result<NonNull<u8>> {
        let mut state = self.state.lock();
        if let Some(mapping) = state.mapping.as_mut() {
            mapping.count += 1;
            return Ok(mapping.ptr.0);
        }

        let ptr = device.map_memory(self.memory, 0, self.size)?;
        state.mapping = Some(Mapping {
            ptr: MappedPtr(ptr),
            count: 1,
        });
        Ok(ptr)
    }

    /// Drop one map reference, unmapping at zero
    pub(crate) fn unmap<D: MemoryDevice>(&self, device: &D) -> Result<()> {
        let mut state = self.state.lock();
        let mapping = state
            .mapping
            .as_mut()
            .ok_or(Error::InvalidRequest("block is not mapped"))?;

        mapping.count -= 1;
        if mapping.count == 0 {
            state.mapping = None;
            device.unmap_memory(self.memory);
        }
        Ok(())
    }

    /// Return the native memory to the device
    ///
    /// Callers must have removed the block from its pool first.
    pub(crate) fn destroy<D: MemoryDevice>(&self, device: &D) {
        let mut state = self.state.lock();
        if state.mapping.take().is_some() {
            device.unmap_memory(self.memory);
        }
        log::debug!(
            "block {}: freeing {} bytes of memory type {}{}",
            self.id.0,
            self.size,
            self.memory_type_index,
            if self.dedicated { " (dedicated)" } else { "" }
        );
        device.free_memory(self.memory);
    }

    /// Snapshot of the block
    pub fn info(&self) -> BlockInfo {
        let state = self.state.lock();
        let (used, free_range_count, largest_free_range) = match &state.regions {
            Some(regions) => (
                regions.allocated(),
                regions.free_ranges().len() as u32,
                regions.largest_free_range(),
            ),
            None if state.live > 0 => (self.size, 0, 0),
            None => (0, 1, self.size),
        };

        BlockInfo {
            id: self.id,
            memory_type_index: self.memory_type_index,
            size: self.size,
            used,
            allocation_count: state.live,
            free_range_count,
            largest_free_range,
            is_dedicated: self.dedicated,
            is_mapped: state.mapping.is_some(),
        }
    }

    /// Copy of the free list (empty for dedicated blocks)
    pub fn free_ranges(&self) -> alloc::vec::Vec<FreeRange> {
        self.state
            .lock()
            .regions
            .as_ref()
            .map(|r| r.free_ranges().to_vec())
            .unwrap_or_default()
    }

    /// Verify the region tracker invariants
    pub fn check_invariants(&self) -> core::result::Result<(), &'static str> {
        match &self.state.lock().regions {
            Some(regions) => regions.check_invariants(),
            None => Ok(()),
        }
    }
}

// =============================================================================
// BLOCK INFO
// =============================================================================

/// Memory block information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Block id
    pub id: BlockId,
    /// Memory type index
    pub memory_type_index: u32,
    /// Block size
    pub size: u64,
    /// Bytes in live allocations
    pub used: u64,
    /// Live allocations
    pub allocation_count: u32,
    /// Number of free ranges
    pub free_range_count: u32,
    /// Largest free range
    pub largest_free_range: u64,
    /// Is dedicated
    pub is_dedicated: bool,
    /// Is mapped
    pub is_mapped: bool,
}

impl BlockInfo {
    /// Available bytes
    pub fn available(&self) -> u64 {
        self.size.saturating_sub(self.used)
    }

    /// Utilization ratio
    pub fn utilization(&self) -> f32 {
        if self.size == 0 {
            0.0
        } else {
            self.used as f32 / self.size as f32
        }
    }
}

// =============================================================================
// ALLOCATION
// =============================================================================

/// One resource's claim on a block's byte range
///
/// Not `Clone`: exactly one owner releases it.
#[derive(Debug)]
pub struct Allocation {
    block: Arc<MemoryBlock>,
    offset: u64,
    size: u64,
    alignment: u64,
}

impl Allocation {
    pub(crate) fn new(block: Arc<MemoryBlock>, offset: u64, size: u64, alignment: u64) -> Self {
        Self {
            block,
            offset,
            size,
            alignment,
        }
    }

    /// Backing block
    pub fn block(&self) -> &Arc<MemoryBlock> {
        &self.block
    }

    /// Native memory handle
    pub fn memory(&self) -> DeviceMemory {
        self.block.memory()
    }

    /// Offset within the block
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reserved size
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Alignment the offset satisfies
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Memory type index
    pub fn memory_type_index(&self) -> u32 {
        self.block.memory_type_index()
    }

    /// Check if the allocation owns its whole block
    pub fn is_dedicated(&self) -> bool {
        self.block.is_dedicated()
    }

    /// Plain-data snapshot
    pub fn info(&self) -> AllocationInfo {
        AllocationInfo {
            memory: self.memory(),
            memory_type_index: self.memory_type_index(),
            block: self.block.id(),
            offset: self.offset,
            size: self.size,
            dedicated: self.is_dedicated(),
        }
    }
}

/// Copyable description of an allocation, for bind and copy commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationInfo {
    /// Native memory handle
    pub memory: DeviceMemory,
    /// Memory type index
    pub memory_type_index: u32,
    /// Backing block
    pub block: BlockId,
    /// Offset within the memory object
    pub offset: u64,
    /// Size
    pub size: u64,
    /// Whole-block allocation
    pub dedicated: bool,
}

impl AllocationInfo {
    /// End offset (exclusive)
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Check if two allocations share bytes
    pub fn overlaps(&self, other: &AllocationInfo) -> bool {
        self.memory == other.memory && self.offset < other.end() && other.offset < self.end()
    }
}
