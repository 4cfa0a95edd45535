// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The NAND flash driver contract and the device geometry.
//!
//! The file system is written against a small driver interface
//! modeled on raw NAND parts: reads and programs move whole
//! pages through an on-device buffer, erases clear whole blocks
//! to the all-ones state, and every page carries a few spare
//! out-of-band bytes next to the data area.  Two properties of
//! NAND are load-bearing for the file system and must hold for
//! any implementation of [`NandFlash`]:
//!
//! 1. Erased flash reads as all-ones, in both the data area and
//!    the spare area.
//! 2. Programming can only clear bits, never set them.
//!
//! Every "is this record written yet?" test in the file system
//! is a comparison against the all-ones pattern, and those
//! tests are only sound under the two rules above.

use crate::result::Result;

/// Size of a sector, the file system's unit of access, in
/// bytes.
pub const SECTOR_SIZE: usize = 512;

/// Number of sectors in a program page.
pub const SECTORS_PER_PAGE: usize = 4;

/// Number of pages in an erase block.
pub const PAGES_PER_BLOCK: usize = 64;

/// Number of erase blocks occupied by the file system.
pub const NUM_BLOCKS: usize = 16;

/// Number of sectors in an erase block.
pub const SECTORS_PER_BLOCK: usize = SECTORS_PER_PAGE * PAGES_PER_BLOCK;

/// Spare out-of-band bytes used per sector.
pub const SECTOR_SPARE_SIZE: usize = 4;

/// Maximum file name length, including the terminating NUL.
pub const MAX_FNAME_LEN: usize = 32;

/// Capacity of the in-memory free block cache.
pub const PREALLOCATE_SIZE: usize = 4;

/// The driver interface consumed by the file system.
///
/// A page must be opened with [`open_page`] before its sectors
/// or spare bytes are read.  Writes are staged against the open
/// page and reach the array only on [`commit`].  The driver may
/// be shared with other users of the device; [`lock`] and
/// [`unlock`] bracket every file system operation.
///
/// [`open_page`]: NandFlash::open_page
/// [`commit`]: NandFlash::commit
/// [`lock`]: NandFlash::lock
/// [`unlock`]: NandFlash::unlock
pub trait NandFlash {
    /// Brings the device to a known state.
    fn init(&mut self) -> Result<()>;

    /// Takes exclusive use of the device.
    fn lock(&mut self) {}

    /// Releases exclusive use of the device.
    fn unlock(&mut self) {}

    /// Reads the given page into the device buffer.
    fn open_page(&mut self, block: u16, page: u16) -> Result<()>;

    /// Copies `dst.len()` bytes from the given sector of the
    /// open page, starting at `offset` within the sector.
    fn read_sector(
        &mut self,
        dst: &mut [u8],
        sector: u16,
        offset: usize,
    ) -> Result<()>;

    /// Copies the leading `dst.len()` spare bytes of the given
    /// sector of the open page.
    fn read_spare(&mut self, dst: &mut [u8], sector: u16) -> Result<()>;

    /// Stages `src` for programming into the given sector of
    /// the open page at `offset`.
    fn write_sector(
        &mut self,
        src: &[u8],
        sector: u16,
        offset: usize,
    ) -> Result<()>;

    /// Stages `src` for programming into the spare bytes of the
    /// given sector of the open page.
    fn write_spare(&mut self, src: &[u8], sector: u16) -> Result<()>;

    /// Programs all staged writes into the open page.
    fn commit(&mut self) -> Result<()>;

    /// Erases the given block to all-ones.
    fn erase_block(&mut self, block: u16) -> Result<()>;

    /// Consults the bad-block marker of the block whose page is
    /// currently open.
    fn block_is_bad(&mut self) -> Result<bool>;

    /// Diagnostic sink for recoverable oddities.
    fn debug_warn(&mut self, _msg: &str) {}

    /// Diagnostic sink for fatal conditions.
    fn debug_error(&mut self, _msg: &str) {}
}
