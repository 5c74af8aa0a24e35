//! # Allocator Errors
//!
//! Error taxonomy surfaced by resource memory creation and destruction.
//!
//! Callers are expected to react differently per variant:
//! - `DeviceOutOfMemory`: free unused resources and retry
//! - `NoCompatibleMemoryType` / `InvalidRequest`: fix the request
//! - `UnknownResource`: a double free or a stale handle in the caller

use thiserror::Error;

use crate::device::{DeviceError, ResourceHandle};
use crate::usage::MemoryUsage;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// Allocator result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Allocator error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    /// No enumerated memory type is both allowed by the resource's type mask
    /// and acceptable for the requested usage
    #[error("no memory type compatible with {usage:?} in type mask {type_bits:#x}")]
    NoCompatibleMemoryType {
        /// Requested usage
        usage: MemoryUsage,
        /// Compatibility mask reported by the native API
        type_bits: u32,
    },

    /// The native API could not allocate a new block
    #[error("device out of memory allocating {size} bytes from memory type {memory_type_index}")]
    DeviceOutOfMemory {
        /// Memory type the block was requested from
        memory_type_index: u32,
        /// Requested block size
        size: u64,
    },

    /// Destroy or lookup on a handle that is not registered
    #[error("unknown resource {0:?}")]
    UnknownResource(ResourceHandle),

    /// Malformed request (zero size, bad alignment, duplicate handle, ...)
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    /// Host access requested on memory the CPU cannot see
    #[error("memory backing {0:?} is not host visible")]
    MemoryNotHostVisible(ResourceHandle),

    /// Any other native call failure
    #[error("device call failed: {0}")]
    Device(#[from] DeviceError),
}

impl Error {
    /// Whether freeing resources and retrying can make the request succeed
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Error::DeviceOutOfMemory { .. })
    }
}
