//! # Allocator Configuration

use static_assertions::const_assert;

use crate::error::{Error, Result};

/// Default size of a shareable block (64MB)
pub const DEFAULT_BLOCK_SIZE: u64 = 64 * 1024 * 1024;

const_assert!(DEFAULT_BLOCK_SIZE.is_power_of_two());

/// What happens to a shareable block once its last allocation is freed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReleasePolicy {
    /// Keep the block for future allocations; `trim` releases it
    #[default]
    Retain,
    /// Return the block to the device immediately
    Eager,
}

/// Allocator configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Minimum size of newly created shareable blocks
    pub default_block_size: u64,
    /// Empty-block policy
    pub release_policy: ReleasePolicy,
    /// Under `Retain`, empty blocks kept per memory type (0 = unlimited)
    pub max_retained_blocks_per_type: usize,
    /// Requests at least this large always get a dedicated block
    pub dedicated_threshold: Option<u64>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            default_block_size: DEFAULT_BLOCK_SIZE,
            release_policy: ReleasePolicy::Retain,
            max_retained_blocks_per_type: 0,
            dedicated_threshold: None,
        }
    }
}

impl AllocatorConfig {
    /// Set default block size
    pub fn with_block_size(mut self, size: u64) -> Self {
        self.default_block_size = size;
        self
    }

    /// Set release policy
    pub fn with_release_policy(mut self, policy: ReleasePolicy) -> Self {
        self.release_policy = policy;
        self
    }

    /// Cap retained empty blocks per memory type
    pub fn with_max_retained_blocks(mut self, count: usize) -> Self {
        self.max_retained_blocks_per_type = count;
        self
    }

    /// Promote large requests to dedicated blocks
    pub fn with_dedicated_threshold(mut self, threshold: u64) -> Self {
        self.dedicated_threshold = Some(threshold);
        self
    }

    /// Check the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.default_block_size.is_power_of_two() {
            return Err(Error::InvalidRequest(
                "default block size must be a non-zero power of two",
            ));
        }
        if self.dedicated_threshold == Some(0) {
            return Err(Error::InvalidRequest("dedicated threshold must be non-zero"));
        }
        Ok(())
    }

    /// Whether a request of `size` bytes is forced onto the dedicated path
    pub fn forces_dedicated(&self, size: u64) -> bool {
        self.dedicated_threshold.is_some_and(|t| size >= t)
    }
}
