//! # Native Device Boundary
//!
//! The slice of the explicit graphics API the allocator consumes: memory
//! type/heap enumeration, raw device-memory allocation, mapping, and the
//! create/query/bind entry points for buffers and images.
//!
//! Native handles are opaque `u64` values wrapped in newtypes. The allocator
//! never interprets them beyond equality and hashing.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;

use bitflags::bitflags;
use thiserror::Error;

// =============================================================================
// PROPERTY FLAGS
// =============================================================================

bitflags! {
    /// Memory type property flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryPropertyFlags: u32 {
        /// Memory is device-local (VRAM)
        const DEVICE_LOCAL = 1 << 0;
        /// Memory can be mapped by the host
        const HOST_VISIBLE = 1 << 1;
        /// Host writes need no explicit flush
        const HOST_COHERENT = 1 << 2;
        /// Host reads go through the CPU cache
        const HOST_CACHED = 1 << 3;
    }
}

bitflags! {
    /// Memory heap flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryHeapFlags: u32 {
        /// Heap is device-local (VRAM)
        const DEVICE_LOCAL = 1 << 0;
    }
}

// =============================================================================
// MEMORY TYPES AND HEAPS
// =============================================================================

/// A native memory type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    /// Native memory type index
    pub index: u32,
    /// Heap this type allocates from
    pub heap_index: u32,
    /// Property flags
    pub property_flags: MemoryPropertyFlags,
}

impl MemoryType {
    /// Create a new memory type
    pub const fn new(index: u32, heap_index: u32, property_flags: MemoryPropertyFlags) -> Self {
        Self {
            index,
            heap_index,
            property_flags,
        }
    }

    /// Check if device local
    pub fn is_device_local(&self) -> bool {
        self.property_flags.contains(MemoryPropertyFlags::DEVICE_LOCAL)
    }

    /// Check if host visible
    pub fn is_host_visible(&self) -> bool {
        self.property_flags.contains(MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Check if host coherent
    pub fn is_host_coherent(&self) -> bool {
        self.property_flags.contains(MemoryPropertyFlags::HOST_COHERENT)
    }

    /// Check if host cached
    pub fn is_host_cached(&self) -> bool {
        self.property_flags.contains(MemoryPropertyFlags::HOST_CACHED)
    }
}

/// A native memory heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryHeap {
    /// Heap size in bytes
    pub size: u64,
    /// Heap flags
    pub flags: MemoryHeapFlags,
}

/// Memory properties of a device, enumerated once at allocator creation
#[derive(Debug, Clone)]
pub struct MemoryProperties {
    /// Memory types, indexed by native type index
    pub memory_types: Vec<MemoryType>,
    /// Memory heaps, indexed by native heap index
    pub memory_heaps: Vec<MemoryHeap>,
    /// Size granularity of raw device allocations
    pub allocation_granularity: u64,
    /// Page size separating linear and optimal resources in one block
    pub buffer_image_granularity: u64,
    /// Alignment of flush/invalidate ranges on non-coherent memory
    pub non_coherent_atom_size: u64,
}

impl MemoryProperties {
    /// Create memory properties with unit granularities
    pub fn new(memory_types: Vec<MemoryType>, memory_heaps: Vec<MemoryHeap>) -> Self {
        Self {
            memory_types,
            memory_heaps,
            allocation_granularity: 1,
            buffer_image_granularity: 1,
            non_coherent_atom_size: 1,
        }
    }

    /// Set raw allocation granularity
    pub fn with_allocation_granularity(mut self, granularity: u64) -> Self {
        self.allocation_granularity = granularity.max(1);
        self
    }

    /// Set linear/optimal page granularity
    pub fn with_buffer_image_granularity(mut self, granularity: u64) -> Self {
        self.buffer_image_granularity = granularity.max(1);
        self
    }

    /// Set non-coherent atom size
    pub fn with_non_coherent_atom_size(mut self, atom: u64) -> Self {
        self.non_coherent_atom_size = atom.max(1);
        self
    }

    /// Get a memory type by native index
    pub fn memory_type(&self, index: u32) -> Option<&MemoryType> {
        self.memory_types.get(index as usize)
    }

    /// Get a heap by native index
    pub fn memory_heap(&self, index: u32) -> Option<&MemoryHeap> {
        self.memory_heaps.get(index as usize)
    }

    /// Mask with one bit set per enumerated memory type
    pub fn all_types_mask(&self) -> u32 {
        match self.memory_types.len() {
            0 => 0,
            n if n >= 32 => u32::MAX,
            n => (1u32 << n) - 1,
        }
    }
}

/// Memory requirements reported for a native resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequirements {
    /// Required size in bytes
    pub size: u64,
    /// Required offset alignment
    pub alignment: u64,
    /// Bit `i` set when memory type `i` may back the resource
    pub memory_type_bits: u32,
    /// Driver hint that the resource performs better in its own block
    pub prefers_dedicated: bool,
}

// =============================================================================
// HANDLES
// =============================================================================

/// Native device memory handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct DeviceMemory(pub u64);

/// Native buffer handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct BufferHandle(pub u64);

/// Native image handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ImageHandle(pub u64);

/// Any resource that owns memory through the allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceHandle {
    /// A buffer
    Buffer(BufferHandle),
    /// An image
    Image(ImageHandle),
}

impl From<BufferHandle> for ResourceHandle {
    fn from(handle: BufferHandle) -> Self {
        ResourceHandle::Buffer(handle)
    }
}

impl From<ImageHandle> for ResourceHandle {
    fn from(handle: ImageHandle) -> Self {
        ResourceHandle::Image(handle)
    }
}

// =============================================================================
// RESOURCE DESCRIPTIONS
// =============================================================================

bitflags! {
    /// How a buffer will be used
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Transfer source
        const TRANSFER_SRC = 1 << 0;
        /// Transfer destination
        const TRANSFER_DST = 1 << 1;
        /// Uniform buffer
        const UNIFORM = 1 << 2;
        /// Storage buffer
        const STORAGE = 1 << 3;
        /// Index data
        const INDEX = 1 << 4;
        /// Vertex data
        const VERTEX = 1 << 5;
        /// Indirect commands
        const INDIRECT = 1 << 6;
    }
}

bitflags! {
    /// How an image will be used
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        /// Transfer source
        const TRANSFER_SRC = 1 << 0;
        /// Transfer destination
        const TRANSFER_DST = 1 << 1;
        /// Sampled in shader
        const SAMPLED = 1 << 2;
        /// Storage image
        const STORAGE = 1 << 3;
        /// Color attachment
        const COLOR_ATTACHMENT = 1 << 4;
        /// Depth/stencil attachment
        const DEPTH_STENCIL_ATTACHMENT = 1 << 5;
    }
}

/// Image texel layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageTiling {
    /// Implementation-defined layout
    #[default]
    Optimal,
    /// Row-major layout
    Linear,
}

/// Buffer creation parameters forwarded to the native API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferCreateInfo {
    /// Size in bytes
    pub size: u64,
    /// Usage flags
    pub usage: BufferUsage,
    /// Queue families allowed to access the buffer; empty means all
    pub queue_family_indices: Vec<u32>,
}

impl BufferCreateInfo {
    /// Create a buffer description accessible from every queue family
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            size,
            usage,
            queue_family_indices: Vec::new(),
        }
    }

    /// Restrict access to the given queue families
    pub fn with_queue_families(mut self, families: &[u32]) -> Self {
        self.queue_family_indices = families.to_vec();
        self
    }
}

/// Image creation parameters forwarded to the native API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCreateInfo {
    /// Native format code
    pub format: u32,
    /// Width, height, depth
    pub extent: [u32; 3],
    /// Mip levels
    pub mip_levels: u32,
    /// Array layers
    pub array_layers: u32,
    /// Sample count
    pub samples: u32,
    /// Texel layout
    pub tiling: ImageTiling,
    /// Usage flags
    pub usage: ImageUsage,
    /// Queue families allowed to access the image; empty means all
    pub queue_family_indices: Vec<u32>,
}

impl ImageCreateInfo {
    /// Create a single-level 2D image description
    pub fn new_2d(format: u32, width: u32, height: u32, usage: ImageUsage) -> Self {
        Self {
            format,
            extent: [width, height, 1],
            mip_levels: 1,
            array_layers: 1,
            samples: 1,
            tiling: ImageTiling::Optimal,
            usage,
            queue_family_indices: Vec::new(),
        }
    }

    /// Set tiling
    pub fn with_tiling(mut self, tiling: ImageTiling) -> Self {
        self.tiling = tiling;
        self
    }

    /// Restrict access to the given queue families
    pub fn with_queue_families(mut self, families: &[u32]) -> Self {
        self.queue_family_indices = families.to_vec();
        self
    }
}

/// A byte range of mapped device memory for flush/invalidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedRange {
    /// Device memory
    pub memory: DeviceMemory,
    /// Offset from the start of the memory object
    pub offset: u64,
    /// Size in bytes
    pub size: u64,
}

// =============================================================================
// DEVICE ERRORS
// =============================================================================

/// Failure reported by a native call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum DeviceError {
    /// Device memory exhausted
    #[error("out of device memory")]
    OutOfDeviceMemory,
    /// Host memory exhausted
    #[error("out of host memory")]
    OutOfHostMemory,
    /// Mapping failed
    #[error("memory map failed")]
    MemoryMapFailed,
    /// Handle not known to the device
    #[error("invalid handle")]
    InvalidHandle,
    /// Driver-specific failure code
    #[error("native error code {0}")]
    Native(i32),
}

impl DeviceError {
    /// Whether the failure means the device ran out of memory
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            DeviceError::OutOfDeviceMemory | DeviceError::OutOfHostMemory
        )
    }
}

// =============================================================================
// DEVICE TRAIT
// =============================================================================

/// The native graphics device as seen by the allocator
///
/// Implementations wrap a logical device. Every method may be called
/// concurrently from multiple threads.
pub trait MemoryDevice: Send + Sync {
    /// Enumerate memory types, heaps and granularity limits
    fn memory_properties(&self) -> MemoryProperties;

    /// Allocate a raw block of device memory
    fn allocate_memory(
        &self,
        memory_type_index: u32,
        size: u64,
    ) -> Result<DeviceMemory, DeviceError>;

    /// Free a raw block of device memory
    fn free_memory(&self, memory: DeviceMemory);

    /// Map a range of host-visible memory
    fn map_memory(
        &self,
        memory: DeviceMemory,
        offset: u64,
        size: u64,
    ) -> Result<NonNull<u8>, DeviceError>;

    /// Unmap previously mapped memory
    fn unmap_memory(&self, memory: DeviceMemory);

    /// Make host writes visible to the device
    fn flush_mapped_ranges(&self, ranges: &[MappedRange]) -> Result<(), DeviceError>;

    /// Make device writes visible to the host
    fn invalidate_mapped_ranges(&self, ranges: &[MappedRange]) -> Result<(), DeviceError>;

    /// Create a native buffer with no memory bound
    fn create_buffer(&self, info: &BufferCreateInfo) -> Result<BufferHandle, DeviceError>;

    /// Destroy a native buffer
    fn destroy_buffer(&self, buffer: BufferHandle);

    /// Query buffer memory requirements
    fn buffer_memory_requirements(&self, buffer: BufferHandle) -> MemoryRequirements;

    /// Bind a buffer to device memory at an offset
    fn bind_buffer_memory(
        &self,
        buffer: BufferHandle,
        memory: DeviceMemory,
        offset: u64,
    ) -> Result<(), DeviceError>;

    /// Create a native image with no memory bound
    fn create_image(&self, info: &ImageCreateInfo) -> Result<ImageHandle, DeviceError>;

    /// Destroy a native image
    fn destroy_image(&self, image: ImageHandle);

    /// Query image memory requirements
    fn image_memory_requirements(&self, image: ImageHandle) -> MemoryRequirements;

    /// Bind an image to device memory at an offset
    fn bind_image_memory(
        &self,
        image: ImageHandle,
        memory: DeviceMemory,
        offset: u64,
    ) -> Result<(), DeviceError>;
}

/// A shared device can back several allocators
impl<D: MemoryDevice + ?Sized> MemoryDevice for Arc<D> {
    fn memory_properties(&self) -> MemoryProperties {
        (**self).memory_properties()
    }

    fn allocate_memory(
        &self,
        memory_type_index: u32,
        size: u64,
    ) -> Result<DeviceMemory, DeviceError> {
        (**self).allocate_memory(memory_type_index, size)
    }

    fn free_memory(&self, memory: DeviceMemory) {
        (**self).free_memory(memory);
    }

    fn map_memory(
        &self,
        memory: DeviceMemory,
        offset: u64,
        size: u64,
    ) -> Result<NonNull<u8>, DeviceError> {
        (**self).map_memory(memory, offset, size)
    }

    fn unmap_memory(&self, memory: DeviceMemory) {
        (**self).unmap_memory(memory);
    }

    fn flush_mapped_ranges(&self, ranges: &[MappedRange]) -> Result<(), DeviceError> {
        (**self).flush_mapped_ranges(ranges)
    }

    fn invalidate_mapped_ranges(&self, ranges: &[MappedRange]) -> Result<(), DeviceError> {
        (**self).invalidate_mapped_ranges(ranges)
    }

    fn create_buffer(&self, info: &BufferCreateInfo) -> Result<BufferHandle, DeviceError> {
        (**self).create_buffer(info)
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        (**self).destroy_buffer(buffer);
    }

    fn buffer_memory_requirements(&self, buffer: BufferHandle) -> MemoryRequirements {
        (**self).buffer_memory_requirements(buffer)
    }

    fn bind_buffer_memory(
        &self,
        buffer: BufferHandle,
        memory: DeviceMemory,
        offset: u64,
    ) -> Result<(), DeviceError> {
        (**self).bind_buffer_memory(buffer, memory, offset)
    }

    fn create_image(&self, info: &ImageCreateInfo) -> Result<ImageHandle, DeviceError> {
        (**self).create_image(info)
    }

    fn destroy_image(&self, image: ImageHandle) {
        (**self).destroy_image(image);
    }

    fn image_memory_requirements(&self, image: ImageHandle) -> MemoryRequirements {
        (**self).image_memory_requirements(image)
    }

    fn bind_image_memory(
        &self,
        image: ImageHandle,
        memory: DeviceMemory,
        offset: u64,
    ) -> Result<(), DeviceError> {
        (**self).bind_image_memory(image, memory, offset)
    }
}
