// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Streaming reads over a file's block chain.
//!
//! A read cursor names a block, a sector within it, and an
//! offset within the sector.  Reads drain the current sector
//! and then advance along the canonical sector order, crossing
//! into the next chain block when the tail sector is consumed.
//! End of file is detected from the flash itself: a sector
//! whose spare byte count was never programmed, or a chain
//! successor that was never given this file's header, ends the
//! stream.

use crate::cache::Dev;
use crate::flash::{NandFlash, MAX_FNAME_LEN};
use crate::fs::Inner;
use crate::records::{
    next_sector, sector_header_size, BlockIdx, FileId, FileSector0Header,
    FileSectorSpare, FileTailHeader, BLOCK_IDX_INVALID, FILE_TAIL_SECTOR,
    SECTOR_NBYTES_INVALID,
};
use crate::result::{Error, Result};
use core::mem::size_of;

/// An open file being read.
pub(crate) struct ReadFile {
    pub(crate) block: BlockIdx,
    pub(crate) sector: u16,
    pub(crate) offset: usize,
    pub(crate) read_head: u32,
    pub(crate) sector_remaining: usize,
    pub(crate) id: FileId,
}

impl<F: NandFlash> Inner<F> {
    pub(crate) fn open_read_inner(&mut self, name: &str) -> Result<u32> {
        let name = name.as_bytes();
        if name.len() >= MAX_FNAME_LEN {
            return Err(Error::NameTooLong);
        }
        let (found, _iter) = self.find_file(name)?;
        let found = found.ok_or(Error::NotFound)?;

        let mut file = ReadFile {
            block: found.first_block,
            sector: 0,
            offset: 0,
            read_head: 0,
            sector_remaining: 0,
            id: found.file_id,
        };

        // File data starts in sector 0 only if that sector
        // carries payload beyond its header.
        self.dev.open_sector(file.block, 0)?;
        let spare: FileSectorSpare = self.dev.read_spare_obj(0)?;
        if spare.nbytes != 0 && spare.nbytes != SECTOR_NBYTES_INVALID {
            file.offset = size_of::<FileSector0Header>();
            file.sector_remaining = spare.nbytes as usize;
        } else {
            let spare1: FileSectorSpare = self.dev.read_spare_obj(1)?;
            file.sector = 1;
            file.sector_remaining = if spare1.nbytes == SECTOR_NBYTES_INVALID {
                0
            } else {
                spare1.nbytes as usize
            };
        }

        let h = self.next_handle();
        self.read_files.insert(h, file);
        Ok(h)
    }

    pub(crate) fn read_inner(
        &mut self,
        h: u32,
        dst: &mut [u8],
    ) -> Result<usize> {
        let Inner { dev, read_files, .. } = self;
        let file = read_files.get_mut(&h).ok_or(Error::BadHandle)?;
        Self::read_file(dev, file, dst)
    }

    /// Copies up to `dst.len()` bytes at the cursor, advancing
    /// sector by sector.  Returns the number of bytes copied,
    /// short at end of file.
    fn read_file(
        dev: &mut Dev<F>,
        file: &mut ReadFile,
        dst: &mut [u8],
    ) -> Result<usize> {
        let mut count = 0;
        while count < dst.len() {
            if file.sector_remaining == 0 && !Self::advance_sector(dev, file)? {
                break;
            }
            let n = (dst.len() - count).min(file.sector_remaining);
            if n == 0 {
                continue;
            }
            dev.open_sector(file.block, file.sector)?;
            dev.read_sector(&mut dst[count..count + n], file.sector, file.offset)?;
            count += n;
            file.offset += n;
            file.sector_remaining -= n;
            file.read_head += n as u32;
        }
        Ok(count)
    }

    /// Moves the cursor to the next sector carrying data.
    /// Returns false at end of file, leaving the cursor where
    /// it was so a later append can be picked up by a fresh
    /// probe.
    fn advance_sector(dev: &mut Dev<F>, file: &mut ReadFile) -> Result<bool> {
        if file.sector == FILE_TAIL_SECTOR {
            // The tail is consumed; the stream continues in the
            // chain successor if it was ever adopted by this
            // file.
            dev.open_sector(file.block, FILE_TAIL_SECTOR)?;
            let tail: FileTailHeader = dev.read_obj(FILE_TAIL_SECTOR, 0)?;
            if tail.next_block == BLOCK_IDX_INVALID {
                return Ok(false);
            }
            dev.open_sector(tail.next_block, 0)?;
            let hdr: FileSector0Header = dev.read_obj(0, 0)?;
            if hdr.file_id != file.id {
                return Ok(false);
            }
            file.block = tail.next_block;
            let spare: FileSectorSpare = dev.read_spare_obj(0)?;
            if spare.nbytes != 0 && spare.nbytes != SECTOR_NBYTES_INVALID {
                file.sector = 0;
                file.offset = size_of::<FileSector0Header>();
                file.sector_remaining = spare.nbytes as usize;
            } else {
                // Sector 0 holds no payload; the stream picks
                // up at sector 1, which may itself be empty.
                let spare1: FileSectorSpare = dev.read_spare_obj(1)?;
                file.sector = 1;
                file.offset = 0;
                file.sector_remaining = if spare1.nbytes == SECTOR_NBYTES_INVALID
                {
                    0
                } else {
                    spare1.nbytes as usize
                };
            }
        } else {
            let sector = next_sector(file.sector);
            dev.open_sector(file.block, sector)?;
            let spare: FileSectorSpare = dev.read_spare_obj(sector)?;
            if spare.nbytes == SECTOR_NBYTES_INVALID {
                return Ok(false);
            }
            file.sector = sector;
            file.offset = sector_header_size(sector);
            file.sector_remaining = spare.nbytes as usize;
        }
        Ok(true)
    }
}
