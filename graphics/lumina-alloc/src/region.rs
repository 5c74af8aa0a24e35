//! # Region Tracker
//!
//! First-fit free-list sub-allocator for the byte range of one block.
//!
//! The free list is kept sorted by offset and fully coalesced: no two free
//! ranges overlap or touch. Alignment padding in front of a reservation stays
//! in the free list as its own range.

use alloc::vec::Vec;

// =============================================================================
// HELPERS
// =============================================================================

/// Round `value` up to a power-of-two `alignment`
#[inline]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    let mask = alignment.max(1) - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Round `value` down to a power-of-two `alignment`
#[inline]
pub fn align_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment.max(1) - 1)
}

// =============================================================================
// FREE RANGE
// =============================================================================

/// A free byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRange {
    /// Offset
    pub offset: u64,
    /// Size
    pub size: u64,
}

impl FreeRange {
    /// Create a new range
    pub const fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// End offset (exclusive)
    pub const fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// No free range can hold the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoFit;

// =============================================================================
// REGION TRACKER
// =============================================================================

/// Free-list tracker for one block
#[derive(Debug, Clone)]
pub struct RegionTracker {
    /// Total size
    size: u64,
    /// Free ranges, sorted by offset, coalesced
    free: Vec<FreeRange>,
    /// Bytes in live reservations
    allocated: u64,
    /// Live reservations
    allocation_count: u32,
}

impl RegionTracker {
    /// Create a tracker whose whole range is free
    pub fn new(size: u64) -> Self {
        let mut free = Vec::new();
        if size > 0 {
            free.push(FreeRange::new(0, size));
        }
        Self {
            size,
            free,
            allocated: 0,
            allocation_count: 0,
        }
    }

    /// Reserve `size` bytes at an offset aligned to `alignment`
    pub fn reserve(&mut self, size: u64, alignment: u64) -> Result<u64, NoFit> {
        if size == 0 {
            return Err(NoFit);
        }

        for index in 0..self.free.len() {
            let range = self.free[index];
            let Some(aligned) = align_up(range.offset, alignment) else {
                continue;
            };
            let padding = aligned - range.offset;
            if padding >= range.size || range.size - padding < size {
                continue;
            }

            let leading = FreeRange::new(range.offset, padding);
            let trailing = FreeRange::new(aligned + size, range.size - padding - size);
            self.free.splice(
                index..=index,
                [leading, trailing].into_iter().filter(|r| r.size > 0),
            );

            self.allocated += size;
            self.allocation_count += 1;
            log::trace!("region: reserved {:#x}+{:#x}", aligned, size);
            return Ok(aligned);
        }

        Err(NoFit)
    }

    /// Return a reserved range to the free list, coalescing with neighbours
    pub fn release(&mut self, offset: u64, size: u64) {
        debug_assert!(offset + size <= self.size, "release past end of block");
        debug_assert!(size <= self.allocated, "release of unreserved bytes");

        let index = self.free.partition_point(|r| r.offset < offset);

        let merges_prev = index > 0 && self.free[index - 1].end() == offset;
        let merges_next = index < self.free.len() && offset + size == self.free[index].offset;

        debug_assert!(
            index == 0 || self.free[index - 1].end() <= offset,
            "release overlaps preceding free range"
        );
        debug_assert!(
            index == self.free.len() || offset + size <= self.free[index].offset,
            "release overlaps following free range"
        );

        match (merges_prev, merges_next) {
            (true, true) => {
                let next = self.free.remove(index);
                self.free[index - 1].size += size + next.size;
            },
            (true, false) => self.free[index - 1].size += size,
            (false, true) => {
                let next = &mut self.free[index];
                next.offset = offset;
                next.size += size;
            },
            (false, false) => self.free.insert(index, FreeRange::new(offset, size)),
        }

        self.allocated -= size;
        self.allocation_count -= 1;
        log::trace!("region: released {:#x}+{:#x}", offset, size);
    }

    /// Total size
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes in live reservations
    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    /// Free bytes, including alignment padding
    pub fn available(&self) -> u64 {
        self.size - self.allocated
    }

    /// Live reservations
    pub fn allocation_count(&self) -> u32 {
        self.allocation_count
    }

    /// Check if nothing is reserved
    pub fn is_empty(&self) -> bool {
        self.allocation_count == 0
    }

    /// Free ranges in offset order
    pub fn free_ranges(&self) -> &[FreeRange] {
        &self.free
    }

    /// Largest free range
    pub fn largest_free_range(&self) -> u64 {
        self.free.iter().map(|r| r.size).max().unwrap_or(0)
    }

    /// Verify ordering, coalescing and conservation of the free list
    pub fn check_invariants(&self) -> Result<(), &'static str> {
        for pair in self.free.windows(2) {
            if pair[0].end() > pair[1].offset {
                return Err("free ranges overlap or are unsorted");
            }
            if pair[0].end() == pair[1].offset {
                return Err("adjacent free ranges not coalesced");
            }
        }
        if self.free.iter().any(|r| r.size == 0) {
            return Err("empty free range");
        }
        if self.free.last().is_some_and(|r| r.end() > self.size) {
            return Err("free range past end of block");
        }
        let free: u64 = self.free.iter().map(|r| r.size).sum();
        if free + self.allocated != self.size {
            return Err("free + allocated != block size");
        }
        Ok(())
    }
}
