// SCAL Accelerator Runtime Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Offset allocators backing memory pools.
//!
//! An allocator hands out `(offset, size)` ranges inside `[0, size)`. It never
//! touches memory itself; the owning [`Pool`](crate::pool::Pool) turns offsets
//! into addresses.

use std::collections::BTreeMap;

/// Snapshot of an allocator's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorInfo {
    pub total_size: u64,
    pub free_size: u64,
}

/// Range allocator over a fixed-size address space.
pub trait Allocator: Send {
    /// Reserve `size` bytes aligned to `alignment` (a power of two).
    ///
    /// Returns the offset of the block, or `None` if no free block fits.
    fn alloc(&mut self, size: u64, alignment: u64) -> Option<u64>;

    /// Release the block starting at `offset`. Returns `false` if `offset`
    /// does not start a live allocation.
    fn free(&mut self, offset: u64) -> bool;

    fn info(&self) -> AllocatorInfo;
}

/// First-fit allocator with free-block coalescing.
#[derive(Debug)]
pub struct HeapAllocator {
    size: u64,
    /// start -> length
    free: BTreeMap<u64, u64>,
    /// start -> length
    used: BTreeMap<u64, u64>,
}

fn align_up(value: u64, alignment: u64) -> Option<u64> {
    value
        .checked_add(alignment - 1)
        .map(|v| v & !(alignment - 1))
}

impl HeapAllocator {
    pub fn new(size: u64) -> Self {
        let mut free = BTreeMap::new();
        if size > 0 {
            free.insert(0, size);
        }
        Self {
            size,
            free,
            used: BTreeMap::new(),
        }
    }

    /// Number of disjoint free blocks.
    pub fn fragments(&self) -> usize {
        self.free.len()
    }
}

impl Allocator for HeapAllocator {
    fn alloc(&mut self, size: u64, alignment: u64) -> Option<u64> {
        if size == 0 || !alignment.is_power_of_two() {
            return None;
        }

        let (start, len, offset, end) = self.free.iter().find_map(|(&start, &len)| {
            let offset = align_up(start, alignment)?;
            let end = offset.checked_add(size)?;
            (end <= start + len).then_some((start, len, offset, end))
        })?;

        self.free.remove(&start);
        if offset > start {
            self.free.insert(start, offset - start);
        }
        if end < start + len {
            self.free.insert(end, start + len - end);
        }
        self.used.insert(offset, size);
        Some(offset)
    }

    fn free(&mut self, offset: u64) -> bool {
        let Some(size) = self.used.remove(&offset) else {
            return false;
        };

        let mut start = offset;
        let mut end = offset + size;

        let prev = self
            .free
            .range(..start)
            .next_back()
            .map(|(&s, &l)| (s, l));
        if let Some((prev_start, prev_len)) = prev {
            if prev_start + prev_len == start {
                self.free.remove(&prev_start);
                start = prev_start;
            }
        }
        if let Some(next_len) = self.free.remove(&end) {
            end += next_len;
        }

        self.free.insert(start, end - start);
        true
    }

    fn info(&self) -> AllocatorInfo {
        AllocatorInfo {
            total_size: self.size,
            free_size: self.free.values().sum(),
        }
    }
}
