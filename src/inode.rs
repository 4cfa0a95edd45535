// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Iteration over the directory's inode entry chain.
//!
//! Directory entries are stored as pairs of sectors in INODE
//! blocks, starting at the second page of each block; when one
//! block's pairs are exhausted the chain continues in the block
//! named by its tail sector.  The iterator walks entry by entry
//! and carries enough chain state to cross block boundaries
//! without re-reading headers.

use crate::cache::Dev;
use crate::flash::{NandFlash, SECTORS_PER_BLOCK};
use crate::records::{
    chain_next_block, BlockIdx, InodeSector0Spare, InodeTailSector,
    BLOCK_IDX_INVALID, INODE_FIRST_ENTRY_SECTOR, INODE_TAIL_SECTOR,
};
use crate::result::Result;

pub(crate) struct InodeIter {
    /// Block holding the current entry.
    pub block: BlockIdx,
    /// Sector of the current entry's allocation record; the
    /// invalidation record is at `sector + 1`.
    pub sector: u16,
    /// Ordinal of the current entry across the whole chain.
    #[allow(dead_code)]
    pub inode_idx: u16,
    /// Chain position of `block`; 0 is the chain head.
    pub inode_block_idx: u16,
    /// Successor of `block`, invalid at the chain's end.
    pub next_block: BlockIdx,
    /// Set when iteration ran off the end of the chain.
    pub end: bool,
}

impl InodeIter {
    pub(crate) fn new<F: NandFlash>(
        dev: &mut Dev<F>,
        inode0: BlockIdx,
    ) -> Result<InodeIter> {
        dev.open_sector(inode0, INODE_TAIL_SECTOR)?;
        let tail: InodeTailSector = dev.read_obj(INODE_TAIL_SECTOR, 0)?;
        dev.open_sector(inode0, 0)?;
        let spare: InodeSector0Spare = dev.read_spare_obj(0)?;
        Ok(InodeIter {
            block: inode0,
            sector: INODE_FIRST_ENTRY_SECTOR,
            inode_idx: 0,
            inode_block_idx: spare.inode_index,
            next_block: tail.next_block,
            end: false,
        })
    }

    /// Steps to the next entry, following the chain into the
    /// successor block when this block's pairs run out.  With
    /// no successor the iterator holds its position and reports
    /// the end; the caller must extend the chain before using
    /// the entry.
    pub(crate) fn advance<F: NandFlash>(
        &mut self,
        dev: &mut Dev<F>,
    ) -> Result<()> {
        self.sector += 2;
        self.inode_idx += 1;
        if self.sector as usize >= SECTORS_PER_BLOCK {
            if self.next_block != BLOCK_IDX_INVALID {
                self.block = self.next_block;
                self.next_block = chain_next_block(dev, self.block)?;
                self.sector = INODE_FIRST_ENTRY_SECTOR;
            } else {
                self.sector -= 2;
                self.end = true;
            }
        }
        Ok(())
    }

    /// True when the current entry is the last pair of its
    /// block, the point at which the chain must be extended.
    pub(crate) fn at_last_entry(&self) -> bool {
        self.sector as usize == SECTORS_PER_BLOCK - 2
    }
}
