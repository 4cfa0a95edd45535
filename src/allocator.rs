// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Free block allocation and wear leveling.
//!
//! A block is free if it has never been programmed (its sector
//! 0 age still reads all-ones) or if its invalidation sector
//! carries a timestamp.  The allocator finds such blocks with a
//! rotating cursor over the whole device, and keeps the
//! youngest candidates it has seen in a small list sorted by
//! age, so that subsequent allocations prefer the least-worn
//! blocks without rescanning flash.
//!
//! Allocation hands out a lease, not a finished block: the
//! caller owns the "dirty" block until it programs a sector 0
//! header into it.  At most one dirty block exists at any time;
//! whoever needs the next allocation first forces the current
//! lease holder to flush.  All state here is guarded by the
//! allocate lock.

use crate::cache::Dev;
use crate::flash::{NandFlash, NUM_BLOCKS, PREALLOCATE_SIZE};
use crate::records::{
    BlockAge, BlockIdx, FileSector0Header, FileSectorSpare, InodeSector0,
    InvalidationSector, AGE_INVALID, BLOCK_IDX_INVALID, BLOCK_TYPE_FILE,
    BLOCK_TYPE_INODE, BLOCK_TYPE_UNALLOCATED, FILE_INVALIDATION_SECTOR,
    TIMESTAMP_INVALID,
};

/// A claimable block and the age recorded by its previous
/// incarnation.  The next incarnation is written with age + 1.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct BlockAllocation {
    pub block: BlockIdx,
    pub age: BlockAge,
}

/// The one outstanding allocation without a sector 0 header.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DirtyLease {
    pub block: BlockIdx,
    pub owner: u32,
}

/// Bounded cache of free blocks, sorted ascending by age so the
/// youngest block is always at index 0.
pub(crate) struct PreallocList {
    blocks: [BlockAllocation; PREALLOCATE_SIZE],
    n: usize,
    age_sum: u32,
}

impl PreallocList {
    pub(crate) fn new() -> PreallocList {
        PreallocList {
            blocks: [BlockAllocation { block: BLOCK_IDX_INVALID, age: 0 };
                PREALLOCATE_SIZE],
            n: 0,
            age_sum: 0,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.n
    }

    pub(crate) fn is_full(&self) -> bool {
        self.n == PREALLOCATE_SIZE
    }

    #[cfg(test)]
    pub(crate) fn age_sum(&self) -> u32 {
        self.age_sum
    }

    pub(crate) fn clear(&mut self) {
        self.n = 0;
        self.age_sum = 0;
    }

    fn contains(&self, block: BlockIdx) -> bool {
        self.blocks[..self.n].iter().any(|b| b.block == block)
    }

    /// Inserts a candidate in age order.  When the list is full
    /// a candidate no younger than the oldest member is
    /// dropped; otherwise the oldest member is shifted out.
    pub(crate) fn push(&mut self, block: BlockIdx, age: BlockAge) {
        if self.contains(block) {
            return;
        }
        if self.n == PREALLOCATE_SIZE {
            if age >= self.blocks[self.n - 1].age {
                return;
            }
            self.age_sum -= self.blocks[self.n - 1].age;
            self.n -= 1;
        }
        let pos = self.blocks[..self.n]
            .iter()
            .position(|b| age < b.age)
            .unwrap_or(self.n);
        for i in (pos..self.n).rev() {
            self.blocks[i + 1] = self.blocks[i];
        }
        self.blocks[pos] = BlockAllocation { block, age };
        self.n += 1;
        self.age_sum += age;
    }

    /// Removes and returns the youngest member.
    pub(crate) fn pop(&mut self) -> Option<BlockAllocation> {
        if self.n == 0 {
            return None;
        }
        let out = self.blocks[0];
        self.n -= 1;
        for i in 0..self.n {
            self.blocks[i] = self.blocks[i + 1];
        }
        self.age_sum -= out.age;
        Some(out)
    }
}

pub(crate) struct Allocator {
    pub(crate) prealloc: PreallocList,
    pub(crate) dirty: Option<DirtyLease>,
    head: BlockIdx,
}

impl Allocator {
    pub(crate) fn new() -> Allocator {
        Allocator { prealloc: PreallocList::new(), dirty: None, head: 0 }
    }

    pub(crate) fn reset(&mut self) {
        self.prealloc.clear();
        self.dirty = None;
        self.head = 0;
    }

    /// Examines the block under the cursor and advances the
    /// cursor.  Returns the block and its recorded age when it
    /// is free.  Unreadable and bad blocks are skipped.
    fn scan_step<F: NandFlash>(
        &mut self,
        dev: &mut Dev<F>,
    ) -> Option<BlockAllocation> {
        let block = self.head;
        self.head = (self.head + 1) % NUM_BLOCKS as BlockIdx;

        if dev.open_sector(block, 0).is_err() {
            return None;
        }
        if dev.block_is_bad().unwrap_or(true) {
            return None;
        }
        let spare: FileSectorSpare = dev.read_spare_obj(0).ok()?;
        let age = match spare.type_id {
            // Never been allocated.
            BLOCK_TYPE_UNALLOCATED => return Some(BlockAllocation { block, age: 0 }),
            // The age field sits after the file id in a FILE
            // block header but leads an INODE block header.
            BLOCK_TYPE_FILE => dev.read_obj::<FileSector0Header>(0, 0).ok()?.age,
            BLOCK_TYPE_INODE => dev.read_obj::<InodeSector0>(0, 0).ok()?.age,
            _ => return None,
        };
        if age == AGE_INVALID {
            return Some(BlockAllocation { block, age: 0 });
        }
        dev.open_sector(block, FILE_INVALIDATION_SECTOR).ok()?;
        let inv: InvalidationSector =
            dev.read_obj(FILE_INVALIDATION_SECTOR, 0).ok()?;
        if inv.timestamp != TIMESTAMP_INVALID {
            // Freed by an invalidation record.
            return Some(BlockAllocation { block, age });
        }
        None
    }

    /// Claims a free block, youngest first.  The preallocation
    /// list is consulted before flash; when it is empty, one
    /// full cursor sweep finds a result and refills the list
    /// with the other free blocks it passes.
    ///
    /// The caller must have flushed the dirty block first and
    /// must hold the allocate lock.
    pub(crate) fn allocate<F: NandFlash>(
        &mut self,
        dev: &mut Dev<F>,
        num_free_blocks: u32,
    ) -> Option<BlockAllocation> {
        if num_free_blocks == 0 {
            return None;
        }
        if let Some(found) = self.prealloc.pop() {
            return Some(found);
        }
        let mut found: Option<BlockAllocation> = None;
        for _ in 0..NUM_BLOCKS {
            if let Some(cand) = self.scan_step(dev) {
                if found.is_none() {
                    found = Some(cand);
                } else {
                    self.prealloc.push(cand.block, cand.age);
                    if self.prealloc.is_full() {
                        break;
                    }
                }
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_keeps_ascending_age_order() {
        let mut list = PreallocList::new();
        list.push(10, 7);
        list.push(11, 3);
        list.push(12, 5);
        assert_eq!(list.len(), 3);
        assert_eq!(list.age_sum(), 15);
        assert_eq!(list.pop(), Some(BlockAllocation { block: 11, age: 3 }));
        assert_eq!(list.pop(), Some(BlockAllocation { block: 12, age: 5 }));
        assert_eq!(list.pop(), Some(BlockAllocation { block: 10, age: 7 }));
        assert_eq!(list.pop(), None);
        assert_eq!(list.age_sum(), 0);
    }

    #[test]
    fn full_list_drops_old_candidates() {
        let mut list = PreallocList::new();
        for (block, age) in [(1, 10), (2, 20), (3, 30), (4, 40)] {
            list.push(block, age);
        }
        assert!(list.is_full());
        // Not younger than the oldest member: dropped.
        list.push(5, 40);
        assert_eq!(list.age_sum(), 100);
        // Younger: evicts block 4 (age 40).
        list.push(6, 15);
        assert_eq!(list.age_sum(), 75);
        assert_eq!(list.pop(), Some(BlockAllocation { block: 1, age: 10 }));
        assert_eq!(list.pop(), Some(BlockAllocation { block: 6, age: 15 }));
        assert_eq!(list.pop(), Some(BlockAllocation { block: 2, age: 20 }));
        assert_eq!(list.pop(), Some(BlockAllocation { block: 3, age: 30 }));
    }

    #[test]
    fn duplicate_blocks_are_not_tracked_twice() {
        let mut list = PreallocList::new();
        list.push(7, 2);
        list.push(7, 2);
        assert_eq!(list.len(), 1);
        assert_eq!(list.age_sum(), 2);
    }
}
