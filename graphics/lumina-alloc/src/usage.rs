//! # Memory Usage and Type Selection
//!
//! Maps a declared usage to a ranked list of native memory types.
//!
//! Ranking is tiered. Within a tier, lower native indices come first, which
//! matches the order drivers use to advertise their preferred types.
//!
//! | Usage      | Tier 0                   | Tier 1                | Tier 2          |
//! |------------|--------------------------|-----------------------|-----------------|
//! | `GpuOnly`  | device-local, no host    | device-local          | anything        |
//! | `CpuOnly`  | host visible + coherent  | host visible + device | host visible    |
//! | `CpuToGpu` | host visible + device    | host visible + coherent | host visible  |
//! | `GpuToCpu` | host visible + cached    | host visible          |                 |

use alloc::vec::Vec;

use crate::device::{MemoryProperties, MemoryRequirements, MemoryType};
use crate::error::{Error, Result};

// =============================================================================
// MEMORY USAGE
// =============================================================================

/// Declared usage of a resource's memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryUsage {
    /// Only the GPU touches the memory
    #[default]
    GpuOnly,
    /// The CPU reads and writes, the GPU reads rarely
    CpuOnly,
    /// The CPU writes, the GPU reads (staging, per-frame uniforms)
    CpuToGpu,
    /// The GPU writes, the CPU reads back
    GpuToCpu,
}

impl MemoryUsage {
    /// Whether the memory must be host visible
    pub const fn requires_host_visible(self) -> bool {
        !matches!(self, MemoryUsage::GpuOnly)
    }

    /// Rank a memory type for this usage; `None` if unacceptable
    fn tier(self, memory_type: &MemoryType) -> Option<u8> {
        let device = memory_type.is_device_local();
        let visible = memory_type.is_host_visible();
        let coherent = memory_type.is_host_coherent();
        let cached = memory_type.is_host_cached();

        if self.requires_host_visible() && !visible {
            return None;
        }

        Some(match self {
            MemoryUsage::GpuOnly => match (device, visible) {
                (true, false) => 0,
                (true, true) => 1,
                _ => 2,
            },
            MemoryUsage::CpuOnly => {
                if coherent && !device {
                    0
                } else if device {
                    1
                } else {
                    2
                }
            },
            MemoryUsage::CpuToGpu => {
                if device {
                    0
                } else if coherent {
                    1
                } else {
                    2
                }
            },
            MemoryUsage::GpuToCpu => {
                if cached {
                    0
                } else {
                    1
                }
            },
        })
    }
}

/// Usage plus the orthogonal dedication modifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MemoryRequest {
    /// Declared usage
    pub usage: MemoryUsage,
    /// Grant the resource its own block
    pub dedicated: bool,
}

impl MemoryRequest {
    /// Shared-block request for a usage
    pub const fn new(usage: MemoryUsage) -> Self {
        Self {
            usage,
            dedicated: false,
        }
    }

    /// Request a dedicated block
    pub const fn dedicated(mut self) -> Self {
        self.dedicated = true;
        self
    }
}

impl From<MemoryUsage> for MemoryRequest {
    fn from(usage: MemoryUsage) -> Self {
        Self::new(usage)
    }
}

// =============================================================================
// ALLOCATION DESCRIPTION
// =============================================================================

/// Layout class of the resource, for linear/optimal page separation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResourceKind {
    /// Buffers and linear-tiled images
    #[default]
    Linear,
    /// Optimal-tiled images
    Optimal,
}

/// Everything needed to place one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationDesc {
    /// Declared usage
    pub usage: MemoryUsage,
    /// Grant a dedicated block
    pub dedicated: bool,
    /// Size in bytes
    pub size: u64,
    /// Offset alignment (power of two)
    pub alignment: u64,
    /// Compatible memory types mask
    pub memory_type_bits: u32,
    /// Layout class
    pub kind: ResourceKind,
}

impl AllocationDesc {
    /// Create a shared-block description
    pub const fn new(usage: MemoryUsage, size: u64, alignment: u64, memory_type_bits: u32) -> Self {
        Self {
            usage,
            dedicated: false,
            size,
            alignment,
            memory_type_bits,
            kind: ResourceKind::Linear,
        }
    }

    /// Build from native requirements; the driver's dedication hint is honored
    pub fn from_requirements(
        request: MemoryRequest,
        requirements: &MemoryRequirements,
        kind: ResourceKind,
    ) -> Self {
        Self {
            usage: request.usage,
            dedicated: request.dedicated || requirements.prefers_dedicated,
            size: requirements.size,
            alignment: requirements.alignment,
            memory_type_bits: requirements.memory_type_bits,
            kind,
        }
    }

    /// Request a dedicated block
    pub const fn dedicated(mut self) -> Self {
        self.dedicated = true;
        self
    }

    /// Set layout class
    pub const fn with_kind(mut self, kind: ResourceKind) -> Self {
        self.kind = kind;
        self
    }

    /// Reject malformed descriptions
    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(Error::InvalidRequest("allocation size must be non-zero"));
        }
        if !self.alignment.is_power_of_two() {
            return Err(Error::InvalidRequest("alignment must be a power of two"));
        }
        Ok(())
    }
}

// =============================================================================
// MEMORY TYPE SELECTOR
// =============================================================================

/// Ranked candidate memory type indices for `usage` within `type_bits`
///
/// Fails with `NoCompatibleMemoryType` when nothing acceptable remains.
pub fn select_memory_types(
    properties: &MemoryProperties,
    usage: MemoryUsage,
    type_bits: u32,
) -> Result<Vec<u32>> {
    let mut ranked: Vec<(u8, u32)> = properties
        .memory_types
        .iter()
        .filter(|t| t.index < 32 && type_bits & (1 << t.index) != 0)
        .filter_map(|t| usage.tier(t).map(|tier| (tier, t.index)))
        .collect();

    if ranked.is_empty() {
        return Err(Error::NoCompatibleMemoryType { usage, type_bits });
    }

    ranked.sort_unstable();
    Ok(ranked.into_iter().map(|(_, index)| index).collect())
}
