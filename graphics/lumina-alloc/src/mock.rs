//! # Mock Device
//!
//! In-memory stand-in for a native device. Tracks heap capacity, mapping,
//! flushes and binds so tests can observe what the allocator asks for.

use alloc::vec;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use spin::Mutex;

use crate::device::{
    BufferCreateInfo, BufferHandle, DeviceError, DeviceMemory, ImageCreateInfo, ImageHandle,
    ImageTiling, MemoryDevice, MemoryHeap, MemoryHeapFlags, MemoryProperties, MemoryPropertyFlags,
    MappedRange, MemoryRequirements, MemoryType,
};
use crate::region::align_up;

const DL: MemoryPropertyFlags = MemoryPropertyFlags::DEVICE_LOCAL;
const HV: MemoryPropertyFlags = MemoryPropertyFlags::HOST_VISIBLE;
const HC: MemoryPropertyFlags = MemoryPropertyFlags::HOST_COHERENT;
const CACHED: MemoryPropertyFlags = MemoryPropertyFlags::HOST_CACHED;

/// Alignment reported for buffers
pub(crate) const BUFFER_ALIGNMENT: u64 = 256;
/// Alignment reported for optimal images
pub(crate) const IMAGE_ALIGNMENT: u64 = 4096;

#[derive(Debug)]
struct MockMemory {
    heap_index: u32,
    size: u64,
    backing: Option<Vec<u8>>,
    mapped: bool,
}

#[derive(Debug)]
struct MockResource {
    requirements: MemoryRequirements,
    bound: Option<(DeviceMemory, u64)>,
}

#[derive(Debug, Default)]
struct MockState {
    heap_used: Vec<u64>,
    memories: HashMap<DeviceMemory, MockMemory>,
    buffers: HashMap<BufferHandle, MockResource>,
    images: HashMap<ImageHandle, MockResource>,
    map_calls: u32,
    invalid_frees: u32,
    flushed: Vec<MappedRange>,
    invalidated: Vec<MappedRange>,
    fail_binds: bool,
}

/// Simulated device
#[derive(Debug)]
pub(crate) struct MockDevice {
    properties: MemoryProperties,
    buffer_type_bits: u32,
    image_prefers_dedicated: bool,
    next_handle: AtomicU64,
    state: Mutex<MockState>,
}

impl MockDevice {
    fn with_properties(properties: MemoryProperties) -> Self {
        let state = MockState {
            heap_used: vec![0; properties.memory_heaps.len()],
            ..MockState::default()
        };
        Self {
            buffer_type_bits: properties.all_types_mask(),
            properties,
            image_prefers_dedicated: false,
            next_handle: AtomicU64::new(1),
            state: Mutex::new(state),
        }
    }

    /// Discrete GPU layout
    ///
    /// | type | flags                  | heap           |
    /// |------|------------------------|----------------|
    /// | 0    | device local           | 0: 1GB VRAM    |
    /// | 1    | host visible, coherent | 1: 1GB system  |
    /// | 2    | + cached               | 1              |
    /// | 3    | device local + host    | 2: 256MB BAR   |
    pub(crate) fn discrete() -> Self {
        Self::with_properties(MemoryProperties::new(
            vec![
                MemoryType::new(0, 0, DL),
                MemoryType::new(1, 1, HV | HC),
                MemoryType::new(2, 1, HV | HC | CACHED),
                MemoryType::new(3, 2, DL | HV | HC),
            ],
            vec![
                MemoryHeap {
                    size: 1 << 30,
                    flags: MemoryHeapFlags::DEVICE_LOCAL,
                },
                MemoryHeap {
                    size: 1 << 30,
                    flags: MemoryHeapFlags::empty(),
                },
                MemoryHeap {
                    size: 256 << 20,
                    flags: MemoryHeapFlags::DEVICE_LOCAL,
                },
            ],
        ))
    }

    /// Device whose only host-visible type is not coherent
    pub(crate) fn non_coherent() -> Self {
        Self::with_properties(
            MemoryProperties::new(
                vec![MemoryType::new(0, 0, DL), MemoryType::new(1, 1, HV | CACHED)],
                vec![
                    MemoryHeap {
                        size: 1 << 30,
                        flags: MemoryHeapFlags::DEVICE_LOCAL,
                    },
                    MemoryHeap {
                        size: 1 << 30,
                        flags: MemoryHeapFlags::empty(),
                    },
                ],
            )
            .with_non_coherent_atom_size(64),
        )
    }

    /// Override a heap's capacity
    pub(crate) fn with_heap_size(mut self, heap_index: u32, size: u64) -> Self {
        if let Some(heap) = self.properties.memory_heaps.get_mut(heap_index as usize) {
            heap.size = size;
        }
        self
    }

    /// Set raw allocation granularity
    pub(crate) fn with_allocation_granularity(mut self, granularity: u64) -> Self {
        self.properties = self.properties.with_allocation_granularity(granularity);
        self
    }

    /// Set linear/optimal page granularity
    pub(crate) fn with_buffer_image_granularity(mut self, granularity: u64) -> Self {
        self.properties = self.properties.with_buffer_image_granularity(granularity);
        self
    }

    /// Restrict the memory types buffers report as compatible
    pub(crate) fn with_buffer_type_bits(mut self, bits: u32) -> Self {
        self.buffer_type_bits = bits;
        self
    }

    /// Make image requirements carry the dedicated hint
    pub(crate) fn with_image_prefers_dedicated(mut self) -> Self {
        self.image_prefers_dedicated = true;
        self
    }

    /// Make every subsequent bind fail
    pub(crate) fn fail_binds(&self) {
        self.state.lock().fail_binds = true;
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Native map calls so far
    pub(crate) fn map_calls(&self) -> u32 {
        self.state.lock().map_calls
    }

    /// Check if a memory object is currently mapped
    pub(crate) fn is_mapped(&self, memory: DeviceMemory) -> bool {
        self.state
            .lock()
            .memories
            .get(&memory)
            .is_some_and(|m| m.mapped)
    }

    /// Memory objects not yet freed
    pub(crate) fn live_memory_count(&self) -> usize {
        self.state.lock().memories.len()
    }

    /// Bytes currently allocated from a heap
    pub(crate) fn heap_used(&self, heap_index: u32) -> u64 {
        self.state
            .lock()
            .heap_used
            .get(heap_index as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Frees of unknown memory objects
    pub(crate) fn invalid_frees(&self) -> u32 {
        self.state.lock().invalid_frees
    }

    /// Buffers not yet destroyed
    pub(crate) fn live_buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Images not yet destroyed
    pub(crate) fn live_image_count(&self) -> usize {
        self.state.lock().images.len()
    }

    /// Memory and offset a buffer is bound to
    pub(crate) fn buffer_binding(&self, buffer: BufferHandle) -> Option<(DeviceMemory, u64)> {
        self.state.lock().buffers.get(&buffer).and_then(|b| b.bound)
    }

    /// Memory and offset an image is bound to
    pub(crate) fn image_binding(&self, image: ImageHandle) -> Option<(DeviceMemory, u64)> {
        self.state.lock().images.get(&image).and_then(|i| i.bound)
    }

    /// Ranges flushed so far
    pub(crate) fn flushed_ranges(&self) -> Vec<MappedRange> {
        self.state.lock().flushed.clone()
    }

    /// Ranges invalidated so far
    pub(crate) fn invalidated_ranges(&self) -> Vec<MappedRange> {
        self.state.lock().invalidated.clone()
    }
}

fn bind(
    resource: Option<&mut MockResource>,
    memory_size: Option<u64>,
    memory: DeviceMemory,
    offset: u64,
) -> Result<(), DeviceError> {
    let resource = resource.ok_or(DeviceError::InvalidHandle)?;
    let memory_size = memory_size.ok_or(DeviceError::InvalidHandle)?;

    if resource.bound.is_some()
        || offset % resource.requirements.alignment != 0
        || offset + resource.requirements.size > memory_size
    {
        return Err(DeviceError::Native(-1));
    }
    resource.bound = Some((memory, offset));
    Ok(())
}

impl MemoryDevice for MockDevice {
    fn memory_properties(&self) -> MemoryProperties {
        self.properties.clone()
    }

    fn allocate_memory(
        &self,
        memory_type_index: u32,
        size: u64,
    ) -> Result<DeviceMemory, DeviceError> {
        let memory_type = self
            .properties
            .memory_type(memory_type_index)
            .ok_or(DeviceError::InvalidHandle)?;
        let heap_index = memory_type.heap_index;
        let capacity = self
            .properties
            .memory_heap(heap_index)
            .map_or(0, |h| h.size);

        let mut state = self.state.lock();
        let used = &mut state.heap_used[heap_index as usize];
        if *used + size > capacity {
            return Err(DeviceError::OutOfDeviceMemory);
        }
        *used += size;

        let memory = DeviceMemory(self.next_handle());
        state.memories.insert(
            memory,
            MockMemory {
                heap_index,
                size,
                backing: None,
                mapped: false,
            },
        );
        Ok(memory)
    }

    fn free_memory(&self, memory: DeviceMemory) {
        let mut state = self.state.lock();
        match state.memories.remove(&memory) {
            Some(m) => state.heap_used[m.heap_index as usize] -= m.size,
            None => state.invalid_frees += 1,
        }
    }

    fn map_memory(
        &self,
        memory: DeviceMemory,
        offset: u64,
        size: u64,
    ) -> Result<NonNull<u8>, DeviceError> {
        let mut state = self.state.lock();
        state.map_calls += 1;
        let m = state
            .memories
            .get_mut(&memory)
            .ok_or(DeviceError::InvalidHandle)?;
        if m.mapped || offset + size > m.size {
            return Err(DeviceError::MemoryMapFailed);
        }

        let total = m.size as usize;
        let backing = m.backing.get_or_insert_with(|| vec![0u8; total]);
        m.mapped = true;
        NonNull::new(backing[offset as usize..].as_mut_ptr()).ok_or(DeviceError::MemoryMapFailed)
    }

    fn unmap_memory(&self, memory: DeviceMemory) {
        if let Some(m) = self.state.lock().memories.get_mut(&memory) {
            m.mapped = false;
        }
    }

    fn flush_mapped_ranges(&self, ranges: &[MappedRange]) -> Result<(), DeviceError> {
        self.state.lock().flushed.extend_from_slice(ranges);
        Ok(())
    }

    fn invalidate_mapped_ranges(&self, ranges: &[MappedRange]) -> Result<(), DeviceError> {
        self.state.lock().invalidated.extend_from_slice(ranges);
        Ok(())
    }

    fn create_buffer(&self, info: &BufferCreateInfo) -> Result<BufferHandle, DeviceError> {
        if info.size == 0 {
            return Err(DeviceError::Native(-2));
        }
        let requirements = MemoryRequirements {
            size: align_up(info.size, BUFFER_ALIGNMENT).ok_or(DeviceError::OutOfHostMemory)?,
            alignment: BUFFER_ALIGNMENT,
            memory_type_bits: self.buffer_type_bits,
            prefers_dedicated: false,
        };
        let handle = BufferHandle(self.next_handle());
        self.state.lock().buffers.insert(
            handle,
            MockResource {
                requirements,
                bound: None,
            },
        );
        Ok(handle)
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        self.state.lock().buffers.remove(&buffer);
    }

    fn buffer_memory_requirements(&self, buffer: BufferHandle) -> MemoryRequirements {
        self.state
            .lock()
            .buffers
            .get(&buffer)
            .map(|b| b.requirements)
            .unwrap_or(MemoryRequirements {
                size: 0,
                alignment: 1,
                memory_type_bits: 0,
                prefers_dedicated: false,
            })
    }

    fn bind_buffer_memory(
        &self,
        buffer: BufferHandle,
        memory: DeviceMemory,
        offset: u64,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.fail_binds {
            return Err(DeviceError::Native(-3));
        }
        let state = &mut *state;
        let memory_size = state.memories.get(&memory).map(|m| m.size);
        bind(state.buffers.get_mut(&buffer), memory_size, memory, offset)
    }

    fn create_image(&self, info: &ImageCreateInfo) -> Result<ImageHandle, DeviceError> {
        let [w, h, d] = info.extent;
        let texels = u64::from(w) * u64::from(h) * u64::from(d) * u64::from(info.array_layers);
        if texels == 0 {
            return Err(DeviceError::Native(-2));
        }
        let alignment = match info.tiling {
            ImageTiling::Optimal => IMAGE_ALIGNMENT,
            ImageTiling::Linear => BUFFER_ALIGNMENT,
        };
        let requirements = MemoryRequirements {
            size: align_up(texels * 4, alignment).ok_or(DeviceError::OutOfHostMemory)?,
            alignment,
            memory_type_bits: self.properties.all_types_mask(),
            prefers_dedicated: self.image_prefers_dedicated,
        };
        let handle = ImageHandle(self.next_handle());
        self.state.lock().images.insert(
            handle,
            MockResource {
                requirements,
                bound: None,
            },
        );
        Ok(handle)
    }

    fn destroy_image(&self, image: ImageHandle) {
        self.state.lock().images.remove(&image);
    }

    fn image_memory_requirements(&self, image: ImageHandle) -> MemoryRequirements {
        self.state
            .lock()
            .images
            .get(&image)
            .map(|i| i.requirements)
            .unwrap_or(MemoryRequirements {
                size: 0,
                alignment: 1,
                memory_type_bits: 0,
                prefers_dedicated: false,
            })
    }

    fn bind_image_memory(
        &self,
        image: ImageHandle,
        memory: DeviceMemory,
        offset: u64,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.fail_binds {
            return Err(DeviceError::Native(-3));
        }
        let state = &mut *state;
        let memory_size = state.memories.get(&memory).map(|m| m.size);
        bind(state.images.get_mut(&image), memory_size, memory, offset)
    }
}
