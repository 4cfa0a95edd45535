// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-flash record layouts.
//!
//! Every block of the file system is one of three kinds, and
//! the kind is recorded in the spare area of its first sector:
//!
//! * an INODE block, one link of the directory chain;
//! * a FILE block, one link of some file's content chain;
//! * an unallocated block, still in the erased all-ones state.
//!
//! All records here are fixed-size, little-endian, naturally
//! packed plain-old-data structures, 32-bit aligned, with any
//! C-style implicit padding made explicit as reserved fields.
//! A record is distinguished by where it is read from, not by a
//! discriminator inside it; the type used at a call site is the
//! whole story about what the bytes mean.
//!
//! Because programming NAND can only clear bits, the maximum
//! value of each integer width doubles as the "never written"
//! sentinel.  A record read back as all-ones is a record that
//! was never programmed, and several algorithms (end-of-file
//! detection, free block classification, crash recovery) lean
//! on exactly that test.
//!
//! Within a block, sectors are consumed in a fixed logical
//! order produced by [`next_sector`]: the data sectors of page
//! zero first, then every sector of the remaining pages, and
//! the tail sector last.  The tail and invalidation sectors
//! both live in page zero so that a single page open suffices
//! to classify a block, and the invalidation sector is excluded
//! from the data order entirely: it is programmed exactly once,
//! when the block is freed.

use crate::cache::Dev;
use crate::flash::{
    NandFlash, PAGES_PER_BLOCK, MAX_FNAME_LEN, SECTORS_PER_BLOCK,
    SECTORS_PER_PAGE, SECTOR_SIZE, SECTOR_SPARE_SIZE,
};
use crate::result::Result;
use bytemuck::{Pod, Zeroable};
use core::mem::size_of;
use static_assertions::const_assert;

pub(crate) type BlockIdx = u16;
pub(crate) type BlockAge = u32;
pub(crate) type Timestamp = u32;
pub(crate) type FileId = u32;
pub(crate) type SectorNbytes = u16;

pub(crate) const BLOCK_IDX_INVALID: BlockIdx = BlockIdx::MAX;
pub(crate) const AGE_INVALID: BlockAge = BlockAge::MAX;
pub(crate) const TIMESTAMP_INVALID: Timestamp = Timestamp::MAX;
pub(crate) const FILE_ID_INVALID: FileId = FileId::MAX;
pub(crate) const SECTOR_NBYTES_INVALID: SectorNbytes = SectorNbytes::MAX;

/// Block type tags, kept clear of the all-ones erased value.
pub(crate) const BLOCK_TYPE_INODE: u8 = 1;
pub(crate) const BLOCK_TYPE_FILE: u8 = 2;
pub(crate) const BLOCK_TYPE_UNALLOCATED: u8 = 0xff;

/// Sector sealing a FILE block with the link to its successor.
pub(crate) const FILE_TAIL_SECTOR: u16 = 2;
/// Sector declaring a FILE block free once programmed.
pub(crate) const FILE_INVALIDATION_SECTOR: u16 = 3;
/// Sector sealing an INODE block with the link to its successor.
pub(crate) const INODE_TAIL_SECTOR: u16 = 2;
/// Sector declaring an INODE block free once programmed.
pub(crate) const INODE_INVALIDATION_SECTOR: u16 = 3;

/// First sector holding inode entries: the start of the second
/// page.  Entries occupy pairs of sectors from here to the end
/// of the block.
pub(crate) const INODE_FIRST_ENTRY_SECTOR: u16 = SECTORS_PER_PAGE as u16;

// Block classification and chain walking read page 0 only.
const_assert!((FILE_TAIL_SECTOR as usize) < SECTORS_PER_PAGE);
const_assert!((FILE_INVALIDATION_SECTOR as usize) < SECTORS_PER_PAGE);
const_assert!((INODE_TAIL_SECTOR as usize) < SECTORS_PER_PAGE);
const_assert!((INODE_INVALIDATION_SECTOR as usize) < SECTORS_PER_PAGE);
// Inode entries come in pairs and must fill the block exactly.
const_assert!((SECTORS_PER_BLOCK - SECTORS_PER_PAGE) % 2 == 0);

/// Sector 0 of an INODE block.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct InodeSector0 {
    pub age: BlockAge,
    pub timestamp: Timestamp,
}

/// Spare area of sector 0 of an INODE block.  `inode_index` is
/// the block's position in the directory chain; index 0 is the
/// chain head.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct InodeSector0Spare {
    pub type_id: u8,
    pub _nothing: u8,
    pub inode_index: u16,
}

/// Tail sector of an INODE block, naming its successor.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct InodeTailSector {
    pub next_block: BlockIdx,
    pub _resv: u16,
    pub next_age: BlockAge,
    pub timestamp: Timestamp,
}

/// Fixed-width prefix of an inode allocation record.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct InodeAllocHeader {
    pub file_id: FileId,
    pub first_block: BlockIdx,
    pub _resv: u16,
    pub first_block_age: BlockAge,
    pub timestamp: Timestamp,
}

/// An inode allocation record: the even sector of an entry
/// pair.  `file_id` still reading all-ones marks the end of the
/// used entries.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub(crate) struct InodeAllocRecord {
    pub header: InodeAllocHeader,
    pub filename: [u8; MAX_FNAME_LEN],
}

/// An inode invalidation record: the odd sector of an entry
/// pair.  Unwritten means the file still exists; `last_block`
/// lets mount finish a half-completed deletion.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct InodeInvalidationRecord {
    pub timestamp: Timestamp,
    pub last_block: BlockIdx,
    pub _resv: u16,
}

/// In-body header of sector 0 of a FILE block.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct FileSector0Header {
    pub file_id: FileId,
    pub age: BlockAge,
}

/// Spare area of a FILE block sector.  `nbytes` counts payload
/// bytes stored in the sector, excluding any in-sector header;
/// all-ones means the sector was never programmed.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct FileSectorSpare {
    pub type_id: u8,
    pub _nothing: u8,
    pub nbytes: SectorNbytes,
}

/// Tail sector header of a FILE block.  Programming this seals
/// the block: `next_block` is the successor in the file chain
/// and `bytes_in_block` the total payload stored in this block.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct FileTailHeader {
    pub next_block: BlockIdx,
    pub _resv: u16,
    pub next_age: BlockAge,
    pub timestamp: Timestamp,
    pub bytes_in_block: u32,
}

/// Invalidation sector contents, shared by FILE and INODE
/// blocks.  A written timestamp declares the block free;
/// `next_age` carries the age the chain successor was promised,
/// all-ones on the last block of a chain.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub(crate) struct InvalidationSector {
    pub timestamp: Timestamp,
    pub next_age: BlockAge,
}

const_assert!(size_of::<InodeSector0>() == 8);
const_assert!(size_of::<InodeSector0Spare>() == SECTOR_SPARE_SIZE);
const_assert!(size_of::<InodeTailSector>() == 12);
const_assert!(size_of::<InodeAllocRecord>() == 16 + MAX_FNAME_LEN);
const_assert!(size_of::<InodeInvalidationRecord>() == 8);
const_assert!(size_of::<FileSector0Header>() == 8);
const_assert!(size_of::<FileSectorSpare>() == SECTOR_SPARE_SIZE);
const_assert!(size_of::<FileTailHeader>() == 16);
const_assert!(size_of::<InvalidationSector>() == 8);
const_assert!(size_of::<FileTailHeader>() < SECTOR_SIZE);

/// The canonical successor function for the sectors of a FILE
/// block.  Both the reader and the writer follow this order:
/// the data sectors of page 0 before the tail, then all of the
/// remaining pages, then the tail sector last.
pub(crate) fn next_sector(sector: u16) -> u16 {
    if sector == FILE_TAIL_SECTOR - 1 {
        SECTORS_PER_PAGE as u16
    } else if sector as usize == PAGES_PER_BLOCK * SECTORS_PER_PAGE - 1 {
        FILE_TAIL_SECTOR
    } else {
        sector + 1
    }
}

/// Bytes of in-sector header preceding payload in the given
/// sector of a FILE block.
pub(crate) fn sector_header_size(sector: u16) -> usize {
    match sector {
        FILE_TAIL_SECTOR => size_of::<FileTailHeader>(),
        0 => size_of::<FileSector0Header>(),
        _ => 0,
    }
}

/// Reads the successor link out of any block's tail sector.
/// Valid for FILE and INODE blocks alike: both store the next
/// block index in the leading bytes of the tail.  An invalid
/// index is passed through.
pub(crate) fn chain_next_block<F: NandFlash>(
    dev: &mut Dev<F>,
    block: BlockIdx,
) -> Result<BlockIdx> {
    if block == BLOCK_IDX_INVALID {
        return Ok(block);
    }
    dev.open_sector(block, FILE_TAIL_SECTOR)?;
    dev.read_obj::<BlockIdx>(FILE_TAIL_SECTOR, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_order_visits_everything_but_invalidation() {
        let mut seen = [false; SECTORS_PER_BLOCK];
        let mut sector = 0u16;
        let mut count = 0;
        loop {
            assert!(!seen[sector as usize]);
            seen[sector as usize] = true;
            count += 1;
            if sector == FILE_TAIL_SECTOR {
                break;
            }
            sector = next_sector(sector);
        }
        assert_eq!(count, SECTORS_PER_BLOCK - 1);
        assert!(!seen[FILE_INVALIDATION_SECTOR as usize]);
    }

    #[test]
    fn sector_order_ends_at_the_tail() {
        // The data order holds every sector except the
        // invalidation sector; the tail is its final element.
        let mut sector = 0u16;
        for _ in 0..SECTORS_PER_BLOCK - 3 {
            sector = next_sector(sector);
            assert_ne!(sector, FILE_TAIL_SECTOR);
        }
        assert_eq!(next_sector(sector), FILE_TAIL_SECTOR);
    }

    #[test]
    fn header_sizes() {
        assert_eq!(sector_header_size(0), 8);
        assert_eq!(sector_header_size(1), 0);
        assert_eq!(sector_header_size(FILE_TAIL_SECTOR), 16);
        assert_eq!(sector_header_size(SECTORS_PER_PAGE as u16), 0);
    }
}
