//! # Resource Allocator
//!
//! Front door of the crate. Ties the memory type selector, the block pools
//! and the resource registry together behind one object that can be shared
//! between threads.
//!
//! ## Create
//!
//! ```text
//! request ──► select_memory_types ──► BlockAllocator::acquire_region ──► bind ──► registry
//!                (ranked types)         (first type that has memory)
//! ```
//!
//! ## Destroy
//!
//! ```text
//! registry::on_destroy ──► unmap leftovers ──► BlockAllocator::release_region
//! ```
//!
//! Lock order is registry, then pool, then block. No path takes the registry
//! while holding a pool or block lock.

use alloc::vec::Vec;
use core::fmt;
use core::ptr::NonNull;

use crate::block::{Allocation, AllocationInfo, BlockInfo};
use crate::config::AllocatorConfig;
use crate::device::{
    BufferCreateInfo, BufferHandle, DeviceError, DeviceMemory, ImageCreateInfo, ImageHandle,
    ImageTiling, MappedRange, MemoryDevice, MemoryProperties, MemoryPropertyFlags,
    ResourceHandle,
};
use crate::error::{Error, Result};
use crate::pool::BlockAllocator;
use crate::region::{align_down, align_up};
use crate::registry::{QueueFamilies, ResourceEntry, ResourceInfo, ResourceRegistry};
use crate::stats::AllocatorStatistics;
use crate::usage::{select_memory_types, AllocationDesc, MemoryRequest, ResourceKind};

/// Size meaning "up to the end of the resource" for flush and invalidate
pub const WHOLE_SIZE: u64 = u64::MAX;

// =============================================================================
// RESOURCE ALLOCATOR
// =============================================================================

/// Device memory allocator for buffers and images
pub struct ResourceAllocator<D: MemoryDevice> {
    device: D,
    properties: MemoryProperties,
    blocks: BlockAllocator,
    registry: ResourceRegistry,
}

impl<D: MemoryDevice> fmt::Debug for ResourceAllocator<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceAllocator")
            .field("properties", &self.properties)
            .field("blocks", &self.blocks)
            .field("resources", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl<D: MemoryDevice> ResourceAllocator<D> {
    /// Create an allocator over a device
    pub fn new(device: D, config: AllocatorConfig) -> Result<Self> {
        config.validate()?;

        let properties = device.memory_properties();
        validate_properties(&properties)?;

        for memory_type in &properties.memory_types {
            log::debug!(
                "memory type {}: heap {} flags {:?}",
                memory_type.index,
                memory_type.heap_index,
                memory_type.property_flags
            );
        }

        Ok(Self {
            blocks: BlockAllocator::new(&properties, config),
            registry: ResourceRegistry::new(),
            properties,
            device,
        })
    }

    /// Underlying device
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Memory properties enumerated at creation
    pub fn memory_properties(&self) -> &MemoryProperties {
        &self.properties
    }

    /// Configuration in effect
    pub fn config(&self) -> &AllocatorConfig {
        self.blocks.config()
    }

    // =========================================================================
    // RAW ALLOCATIONS
    // =========================================================================

    /// Allocate memory that is not tied to a registered resource
    ///
    /// Candidate memory types are tried in rank order. Running out of memory
    /// in one type moves on to the next; any other failure stops the search.
    pub fn allocate(&self, desc: &AllocationDesc) -> Result<Allocation> {
        desc.validate()?;

        let candidates = select_memory_types(&self.properties, desc.usage, desc.memory_type_bits)?;
        let (size, alignment) = self.placement(desc)?;
        let dedicated = desc.dedicated || self.config().forces_dedicated(size);

        let mut last_error = None;
        for memory_type_index in candidates {
            match self.blocks.acquire_region(
                &self.device,
                memory_type_index,
                size,
                alignment,
                dedicated,
            ) {
                Ok(allocation) => {
                    log::trace!(
                        "allocated {} bytes at {:#x} in block {} (type {})",
                        allocation.size(),
                        allocation.offset(),
                        allocation.block().id().0,
                        memory_type_index
                    );
                    return Ok(allocation);
                },
                Err(err) if err.is_out_of_memory() => last_error = Some(err),
                Err(err) => return Err(err),
            }
        }

        Err(last_error.unwrap_or(Error::NoCompatibleMemoryType {
            usage: desc.usage,
            type_bits: desc.memory_type_bits,
        }))
    }

    /// Return memory obtained from [`allocate`](Self::allocate)
    pub fn free(&self, allocation: Allocation) {
        self.blocks.release_region(&self.device, allocation);
    }

    /// Size and alignment actually reserved for a description
    ///
    /// Optimal-tiled resources occupy whole `buffer_image_granularity` pages
    /// so they never share a page with linear resources.
    fn placement(&self, desc: &AllocationDesc) -> Result<(u64, u64)> {
        let granularity = self.properties.buffer_image_granularity;
        match desc.kind {
            ResourceKind::Optimal if granularity > 1 => {
                let size = align_up(desc.size, granularity)
                    .ok_or(Error::InvalidRequest("allocation size overflows"))?;
                Ok((size, desc.alignment.max(granularity)))
            },
            _ => Ok((desc.size, desc.alignment)),
        }
    }

    // =========================================================================
    // RESOURCE MEMORY
    // =========================================================================

    /// Allocate memory for a resource the caller created and register it
    ///
    /// The caller binds the resource using the returned placement.
    pub fn create_resource_memory(
        &self,
        resource: ResourceHandle,
        desc: &AllocationDesc,
        queue_families: QueueFamilies,
    ) -> Result<AllocationInfo> {
        let allocation = self.allocate(desc)?;
        let info = allocation.info();
        self.register(resource, ResourceEntry::new(allocation, desc.usage, queue_families))?;
        Ok(info)
    }

    /// Unregister a resource and release its memory
    pub fn destroy_resource_memory(&self, resource: ResourceHandle) -> Result<()> {
        let entry = self.registry.on_destroy(resource)?;
        self.release_entry(resource, entry);
        Ok(())
    }

    /// Placement and accessibility of a registered resource
    pub fn lookup(&self, resource: ResourceHandle) -> Result<ResourceInfo> {
        self.registry.lookup(resource)
    }

    /// Number of registered resources
    pub fn resource_count(&self) -> usize {
        self.registry.len()
    }

    fn register(&self, resource: ResourceHandle, entry: ResourceEntry) -> Result<()> {
        self.registry.on_create(resource, entry).map_err(|entry| {
            self.free(entry.allocation);
            Error::InvalidRequest("resource handle already registered")
        })
    }

    fn release_entry(&self, resource: ResourceHandle, entry: ResourceEntry) {
        let block = entry.allocation.block();
        for _ in 0..entry.map_count() {
            if let Err(err) = block.unmap(&self.device) {
                log::error!("{:?}: dropping mapping failed: {}", resource, err);
            }
        }
        self.free(entry.allocation);
    }

    /// Allocate, bind and register in one step, undoing everything on failure
    fn bind_and_register(
        &self,
        resource: ResourceHandle,
        desc: &AllocationDesc,
        queue_families: QueueFamilies,
        bind: impl FnOnce(DeviceMemory, u64) -> core::result::Result<(), DeviceError>,
    ) -> Result<()> {
        let allocation = self.allocate(desc)?;

        if let Err(err) = bind(allocation.memory(), allocation.offset()) {
            self.free(allocation);
            return Err(err.into());
        }

        self.register(resource, ResourceEntry::new(allocation, desc.usage, queue_families))
    }

    // =========================================================================
    // BUFFERS AND IMAGES
    // =========================================================================

    /// Create a buffer with memory bound
    pub fn create_buffer(
        &self,
        info: &BufferCreateInfo,
        request: impl Into<MemoryRequest>,
    ) -> Result<BufferHandle> {
        let buffer = self.device.create_buffer(info)?;
        let requirements = self.device.buffer_memory_requirements(buffer);
        let desc =
            AllocationDesc::from_requirements(request.into(), &requirements, ResourceKind::Linear);

        let result = self.bind_and_register(
            buffer.into(),
            &desc,
            QueueFamilies::from_indices(&info.queue_family_indices),
            |memory, offset| self.device.bind_buffer_memory(buffer, memory, offset),
        );

        match result {
            Ok(()) => Ok(buffer),
            Err(err) => {
                self.device.destroy_buffer(buffer);
                Err(err)
            },
        }
    }

    /// Destroy a buffer created by [`create_buffer`](Self::create_buffer)
    pub fn destroy_buffer(&self, buffer: BufferHandle) -> Result<()> {
        let resource = ResourceHandle::from(buffer);
        let entry = self.registry.on_destroy(resource)?;
        self.device.destroy_buffer(buffer);
        self.release_entry(resource, entry);
        Ok(())
    }

    /// Create an image with memory bound
    pub fn create_image(
        &self,
        info: &ImageCreateInfo,
        request: impl Into<MemoryRequest>,
    ) -> Result<ImageHandle> {
        let image = self.device.create_image(info)?;
        let requirements = self.device.image_memory_requirements(image);
        let kind = match info.tiling {
            ImageTiling::Optimal => ResourceKind::Optimal,
            ImageTiling::Linear => ResourceKind::Linear,
        };
        let desc = AllocationDesc::from_requirements(request.into(), &requirements, kind);

        let result = self.bind_and_register(
            image.into(),
            &desc,
            QueueFamilies::from_indices(&info.queue_family_indices),
            |memory, offset| self.device.bind_image_memory(image, memory, offset),
        );

        match result {
            Ok(()) => Ok(image),
            Err(err) => {
                self.device.destroy_image(image);
                Err(err)
            },
        }
    }

    /// Destroy an image created by [`create_image`](Self::create_image)
    pub fn destroy_image(&self, image: ImageHandle) -> Result<()> {
        let resource = ResourceHandle::from(image);
        let entry = self.registry.on_destroy(resource)?;
        self.device.destroy_image(image);
        self.release_entry(resource, entry);
        Ok(())
    }

    // =========================================================================
    // HOST ACCESS
    // =========================================================================

    /// Pointer to the first byte of a resource's memory
    ///
    /// The block is mapped once and shared; every `map` needs a matching
    /// [`unmap`](Self::unmap). Mappings still open at destroy are dropped.
    pub fn map(&self, resource: ResourceHandle) -> Result<NonNull<u8>> {
        self.registry.with_mut(resource, |entry| {
            let block = entry.allocation.block();
            if !block.property_flags().contains(MemoryPropertyFlags::HOST_VISIBLE) {
                return Err(Error::MemoryNotHostVisible(resource));
            }

            let base = block.map(&self.device)?;
            let offset = entry.allocation.offset() as usize;
            entry.mapped();

            // SAFETY: the allocation lies inside the block and the whole
            // block is mapped, so the offset stays within the mapping.
            Ok(unsafe { NonNull::new_unchecked(base.as_ptr().add(offset)) })
        })?
    }

    /// Release one `map` of a resource
    pub fn unmap(&self, resource: ResourceHandle) -> Result<()> {
        self.registry.with_mut(resource, |entry| {
            entry.unmapped()?;
            entry.allocation.block().unmap(&self.device)
        })?
    }

    /// Make host writes to `offset..offset + size` of a resource visible to
    /// the device; a no-op on coherent memory
    pub fn flush(&self, resource: ResourceHandle, offset: u64, size: u64) -> Result<()> {
        match self.mapped_range(resource, offset, size)? {
            Some(range) => Ok(self.device.flush_mapped_ranges(&[range])?),
            None => Ok(()),
        }
    }

    /// Make device writes to `offset..offset + size` of a resource visible to
    /// the host; a no-op on coherent memory
    pub fn invalidate(&self, resource: ResourceHandle, offset: u64, size: u64) -> Result<()> {
        match self.mapped_range(resource, offset, size)? {
            Some(range) => Ok(self.device.invalidate_mapped_ranges(&[range])?),
            None => Ok(()),
        }
    }

    /// Native range to flush or invalidate, widened to whole atoms
    fn mapped_range(
        &self,
        resource: ResourceHandle,
        offset: u64,
        size: u64,
    ) -> Result<Option<MappedRange>> {
        let atom = self.properties.non_coherent_atom_size;
        self.registry.with(resource, |entry| {
            let allocation = &entry.allocation;
            let block = allocation.block();
            let flags = block.property_flags();

            if !flags.contains(MemoryPropertyFlags::HOST_VISIBLE) {
                return Err(Error::MemoryNotHostVisible(resource));
            }
            if entry.map_count() == 0 {
                return Err(Error::InvalidRequest("resource is not mapped"));
            }
            if offset > allocation.size() {
                return Err(Error::InvalidRequest("range starts past the resource"));
            }
            let size = if size == WHOLE_SIZE {
                allocation.size() - offset
            } else {
                size
            };
            if size > allocation.size() - offset {
                return Err(Error::InvalidRequest("range ends past the resource"));
            }
            if size == 0 || flags.contains(MemoryPropertyFlags::HOST_COHERENT) {
                return Ok(None);
            }

            let start = align_down(allocation.offset() + offset, atom);
            let end = align_up(allocation.offset() + offset + size, atom)
                .unwrap_or(u64::MAX)
                .min(block.size());

            Ok(Some(MappedRange {
                memory: allocation.memory(),
                offset: start,
                size: end - start,
            }))
        })?
    }

    // =========================================================================
    // MAINTENANCE
    // =========================================================================

    /// Release every empty shareable block; returns how many were released
    pub fn trim(&self) -> usize {
        let released = self.blocks.trim(&self.device);
        if released > 0 {
            log::debug!("trim released {} empty blocks", released);
        }
        released
    }

    /// Live blocks of a memory type, dedicated included
    pub fn block_count(&self, memory_type_index: u32) -> usize {
        self.blocks.block_count(memory_type_index)
    }

    /// Snapshot of the blocks of a memory type
    pub fn blocks(&self, memory_type_index: u32) -> Vec<BlockInfo> {
        self.blocks.blocks(memory_type_index)
    }

    /// Usage snapshot
    pub fn statistics(&self) -> AllocatorStatistics {
        AllocatorStatistics {
            memory_types: self.blocks.memory_type_statistics(),
            heaps: self.blocks.heap_statistics(),
            resource_count: self.registry.len(),
        }
    }

    /// Verify the free lists of every block
    pub fn check_invariants(&self) -> core::result::Result<(), &'static str> {
        self.blocks.check_invariants()
    }
}

impl<D: MemoryDevice> Drop for ResourceAllocator<D> {
    fn drop(&mut self) {
        for (resource, entry) in self.registry.drain() {
            log::warn!(
                "{:?} still registered at teardown ({} bytes)",
                resource,
                entry.allocation.size()
            );
            self.release_entry(resource, entry);
        }

        let kept = self.blocks.destroy_all(&self.device);
        if kept > 0 {
            log::error!("{} blocks outlive the allocator behind unfreed raw allocations", kept);
        }
    }
}

/// Reject property tables the pools cannot index
fn validate_properties(properties: &MemoryProperties) -> Result<()> {
    if properties.memory_types.len() > 32 {
        return Err(Error::InvalidRequest("more than 32 memory types"));
    }
    for (position, memory_type) in properties.memory_types.iter().enumerate() {
        if memory_type.index as usize != position {
            return Err(Error::InvalidRequest("memory type index does not match its position"));
        }
        if properties.memory_heap(memory_type.heap_index).is_none() {
            return Err(Error::InvalidRequest("memory type refers to a missing heap"));
        }
    }
    Ok(())
}
