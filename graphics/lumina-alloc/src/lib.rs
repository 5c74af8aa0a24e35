//! LUMINA Alloc - GPU Resource Memory Placement
//!
//! This crate places buffers and images into device memory on top of an
//! explicit graphics API. Callers declare how a resource is used; the crate
//! picks a memory type, packs the resource into a shared block or grants it
//! a block of its own, and returns the memory when the resource goes away.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   ResourceAllocator                      │
//! ├──────────────────┬──────────────────┬───────────────────┤
//! │  Type Selector   │  Block Allocator │ Resource Registry │
//! │  (usage → rank)  │  (per-type pools)│ (handle → region) │
//! ├──────────────────┴────────┬─────────┴───────────────────┤
//! │   Memory Blocks           │   Region Tracker            │
//! │   (shared / dedicated)    │   (first-fit free list)     │
//! ├───────────────────────────┴─────────────────────────────┤
//! │                 MemoryDevice (native API)                │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Usage-driven placement**: `GpuOnly`, `CpuOnly`, `CpuToGpu`, `GpuToCpu`
//! - **Sub-allocation**: first-fit with coalescing inside shared blocks
//! - **Dedicated blocks**: whole-block allocations released on destroy
//! - **Host access**: reference-counted block mapping, flush/invalidate
//! - **Concurrency**: per-block locks, shareable across threads
//!
//! # Example
//!
//! ```ignore
//! use lumina_alloc::prelude::*;
//!
//! let allocator = ResourceAllocator::new(device, AllocatorConfig::default())?;
//! let buffer = allocator.create_buffer(
//!     &BufferCreateInfo::new(64 * 1024, BufferUsage::UNIFORM),
//!     MemoryUsage::CpuToGpu,
//! )?;
//! let ptr = allocator.map(buffer.into())?;
//! // ... write uniforms through `ptr` ...
//! allocator.unmap(buffer.into())?;
//! allocator.destroy_buffer(buffer)?;
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod allocator;
pub mod block;
pub mod config;
pub mod device;
pub mod error;
pub mod pool;
pub mod region;
pub mod registry;
pub mod stats;
pub mod usage;

#[cfg(test)]
mod mock;

pub use allocator::{ResourceAllocator, WHOLE_SIZE};
pub use error::{Error, Result};

/// Prelude for common imports
pub mod prelude {
    pub use crate::allocator::{ResourceAllocator, WHOLE_SIZE};
    pub use crate::block::{Allocation, AllocationInfo, BlockId, BlockInfo};
    pub use crate::config::{AllocatorConfig, ReleasePolicy};
    pub use crate::device::{
        BufferCreateInfo, BufferHandle, BufferUsage, DeviceError, DeviceMemory, ImageCreateInfo,
        ImageHandle, ImageTiling, ImageUsage, MemoryDevice, MemoryHeap, MemoryProperties,
        MemoryPropertyFlags, MemoryType, ResourceHandle,
    };
    pub use crate::error::{Error, Result};
    pub use crate::registry::{QueueFamilies, ResourceInfo};
    pub use crate::stats::AllocatorStatistics;
    pub use crate::usage::{AllocationDesc, MemoryRequest, MemoryUsage, ResourceKind};
}
