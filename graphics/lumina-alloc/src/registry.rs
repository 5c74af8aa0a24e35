//! # Resource Registry
//!
//! Maps live buffer and image handles to the allocation backing them.
//!
//! The table sits behind one reader-writer lock. Lookups share it; create and
//! destroy take it exclusively, so a lookup can never succeed once the
//! destroy of the same handle has removed its entry.

use alloc::vec::Vec;

use hashbrown::HashMap;
use spin::RwLock;

use crate::block::{Allocation, AllocationInfo};
use crate::device::ResourceHandle;
use crate::error::{Error, Result};
use crate::usage::MemoryUsage;

// =============================================================================
// QUEUE FAMILIES
// =============================================================================

/// Queue families allowed to access a resource; empty means all
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct QueueFamilies(Vec<u32>);

impl QueueFamilies {
    /// Accessible from every queue family
    pub const fn all() -> Self {
        Self(Vec::new())
    }

    /// Restrict to a set of queue families, kept exactly as given
    pub fn from_indices(indices: &[u32]) -> Self {
        Self(indices.to_vec())
    }

    /// Check if no restriction applies
    pub fn is_unrestricted(&self) -> bool {
        self.0.is_empty()
    }

    /// Check if a queue family may access the resource
    pub fn contains(&self, family: u32) -> bool {
        self.is_unrestricted() || self.0.contains(&family)
    }

    /// Explicit indices in caller order; empty when unrestricted
    pub fn indices(&self) -> &[u32] {
        &self.0
    }
}

// =============================================================================
// ENTRIES
// =============================================================================

/// What the registry keeps per resource
#[derive(Debug)]
pub struct ResourceEntry {
    /// Backing allocation
    pub allocation: Allocation,
    /// Declared usage
    pub usage: MemoryUsage,
    /// Queue-family accessibility, stored as given
    pub queue_families: QueueFamilies,
    map_count: u32,
}

impl ResourceEntry {
    /// Create an unmapped entry
    pub fn new(allocation: Allocation, usage: MemoryUsage, queue_families: QueueFamilies) -> Self {
        Self {
            allocation,
            usage,
            queue_families,
            map_count: 0,
        }
    }

    /// Outstanding `map` calls on this resource
    pub fn map_count(&self) -> u32 {
        self.map_count
    }

    pub(crate) fn mapped(&mut self) {
        self.map_count += 1;
    }

    pub(crate) fn unmapped(&mut self) -> Result<()> {
        self.map_count = self
            .map_count
            .checked_sub(1)
            .ok_or(Error::InvalidRequest("resource is not mapped"))?;
        Ok(())
    }
}

/// Snapshot of a registered resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    /// Resource handle
    pub handle: ResourceHandle,
    /// Backing allocation
    pub allocation: AllocationInfo,
    /// Declared usage
    pub usage: MemoryUsage,
    /// Queue-family accessibility
    pub queue_families: QueueFamilies,
    /// Outstanding `map` calls
    pub map_count: u32,
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Live resources and their backing allocations
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    entries: RwLock<HashMap<ResourceHandle, ResourceEntry>>,
}

impl ResourceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new resource
    ///
    /// A handle that is already registered is refused and the entry handed
    /// back, so the caller can release its allocation.
    pub fn on_create(
        &self,
        handle: ResourceHandle,
        entry: ResourceEntry,
    ) -> core::result::Result<(), ResourceEntry> {
        let mut entries = self.entries.write();
        if entries.contains_key(&handle) {
            log::warn!("{:?} registered twice", handle);
            return Err(entry);
        }
        entries.insert(handle, entry);
        Ok(())
    }

    /// Remove a resource and hand back its entry for release
    pub fn on_destroy(&self, handle: ResourceHandle) -> Result<ResourceEntry> {
        self.entries.write().remove(&handle).ok_or_else(|| {
            log::warn!("destroy of unregistered {:?}", handle);
            Error::UnknownResource(handle)
        })
    }

    /// Snapshot of a registered resource
    pub fn lookup(&self, handle: ResourceHandle) -> Result<ResourceInfo> {
        self.with(handle, |entry| ResourceInfo {
            handle,
            allocation: entry.allocation.info(),
            usage: entry.usage,
            queue_families: entry.queue_families.clone(),
            map_count: entry.map_count,
        })
    }

    /// Run `f` on an entry under the shared lock
    pub fn with<R>(
        &self,
        handle: ResourceHandle,
        f: impl FnOnce(&ResourceEntry) -> R,
    ) -> Result<R> {
        let entries = self.entries.read();
        match entries.get(&handle) {
            Some(entry) => Ok(f(entry)),
            None => {
                log::warn!("lookup of unregistered {:?}", handle);
                Err(Error::UnknownResource(handle))
            },
        }
    }

    /// Run `f` on an entry under the exclusive lock
    pub fn with_mut<R>(
        &self,
        handle: ResourceHandle,
        f: impl FnOnce(&mut ResourceEntry) -> R,
    ) -> Result<R> {
        let mut entries = self.entries.write();
        match entries.get_mut(&handle) {
            Some(entry) => Ok(f(entry)),
            None => {
                log::warn!("access to unregistered {:?}", handle);
                Err(Error::UnknownResource(handle))
            },
        }
    }

    /// Number of live resources
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if no resource is registered
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Remove every entry
    pub fn drain(&self) -> Vec<(ResourceHandle, ResourceEntry)> {
        self.entries.write().drain().collect()
    }
}
