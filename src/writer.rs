// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Buffered, append-only writes into a file's block chain.
//!
//! A write cursor buffers partial sectors in RAM and programs a
//! whole sector at a time.  Committing the tail sector of a
//! block is the interesting case: the next chain block must be
//! allocated first, because the tail header that seals the
//! block also names its successor.  The successor is handed out
//! as a dirty lease; it carries no sector 0 header until its
//! owner's first commit, and anyone else who needs an
//! allocation before then forces the owner to flush.
//!
//! Metadata naming a freshly claimed block (the inode entry for
//! a new file, the sealed tail for a chain extension) is always
//! programmed before the block is erased.  If power is lost in
//! between, the mount scan finds the announcement, notices the
//! missing header and completes the erase and header write
//! itself.

use crate::allocator::{Allocator, BlockAllocation, DirtyLease};
use crate::flash::{NandFlash, MAX_FNAME_LEN, SECTOR_SIZE};
use crate::fs::Inner;
use crate::records::{
    next_sector, sector_header_size, BlockAge, BlockIdx, FileId,
    FileSector0Header, FileSectorSpare, FileTailHeader, InodeAllocHeader,
    InodeAllocRecord, TIMESTAMP_INVALID, BLOCK_TYPE_FILE, FILE_TAIL_SECTOR,
    SECTOR_NBYTES_INVALID,
};
use crate::result::{Error, Result};
use bytemuck::Zeroable;
use core::mem::size_of;
use spin::Mutex;

/// An open file being written.  `buffer` holds the unflushed
/// bytes of the current sector, headers included.
pub(crate) struct WriteFile {
    pub(crate) block: BlockIdx,
    pub(crate) block_age: BlockAge,
    pub(crate) sector: u16,
    pub(crate) offset: usize,
    pub(crate) write_head: u32,
    pub(crate) bytes_in_block: u32,
    pub(crate) sector_remaining: usize,
    pub(crate) id: FileId,
    pub(crate) buffer: [u8; SECTOR_SIZE],
}

impl<F: NandFlash> Inner<F> {
    pub(crate) fn open_write_inner(
        &mut self,
        alloc: &Mutex<Allocator>,
        name: &str,
    ) -> Result<u32> {
        // Over-long names are truncated; the stored name always
        // leaves room for its terminating NUL.
        let name = name.as_bytes();
        let name = &name[..name.len().min(MAX_FNAME_LEN - 1)];
        let (found, mut iter) = self.find_file(name)?;

        if let Some(found) = found {
            if self.write_files.values().any(|w| w.id == found.file_id) {
                return Err(Error::Busy);
            }
            let h = self.next_handle();
            let file = self.resume_write(found.first_block, found.file_id)?;
            self.write_files.insert(h, file);
            return Ok(h);
        }

        // New file: claim the inode entry the iterator stopped
        // at, then a first content block.
        let mut al = alloc.lock();
        self.inode_prepare_new(&mut al, &mut iter)?;
        self.flush_dirty_block(&mut al)?;
        let next = self.allocate_block(&mut al).ok_or(Error::Full)?;

        self.max_file_id += 1;
        let t = self.next_timestamp();
        let mut record = InodeAllocRecord::zeroed();
        record.header = InodeAllocHeader {
            file_id: self.max_file_id,
            first_block: next.block,
            _resv: !0,
            first_block_age: next.age + 1,
            timestamp: t,
        };
        record.filename[..name.len()].copy_from_slice(name);

        // The allocation record must land before the erase so a
        // power cut in between is recoverable at mount.
        self.dev.open_sector(iter.block, iter.sector)?;
        self.dev.write_obj(&record, iter.sector, 0)?;
        self.dev.commit()?;
        self.dev.erase_block(next.block)?;

        let h = self.next_handle();
        al.dirty = Some(DirtyLease { block: next.block, owner: h });
        drop(al);

        let file = WriteFile {
            block: next.block,
            block_age: next.age + 1,
            sector: 0,
            offset: size_of::<FileSector0Header>(),
            write_head: 0,
            bytes_in_block: 0,
            sector_remaining: SECTOR_SIZE - size_of::<FileSector0Header>(),
            id: self.max_file_id,
            buffer: [0xff; SECTOR_SIZE],
        };
        self.write_files.insert(h, file);
        self.num_files += 1;
        Ok(h)
    }

    /// Positions a write cursor at the logical end of an
    /// existing file: past every sealed block, then past every
    /// programmed sector of the unsealed one.
    fn resume_write(
        &mut self,
        first_block: BlockIdx,
        id: FileId,
    ) -> Result<WriteFile> {
        let mut file = WriteFile {
            block: first_block,
            block_age: 0,
            sector: 0,
            offset: 0,
            write_head: 0,
            bytes_in_block: 0,
            sector_remaining: 0,
            id,
            buffer: [0xff; SECTOR_SIZE],
        };

        loop {
            self.dev.open_sector(file.block, FILE_TAIL_SECTOR)?;
            let tail: FileTailHeader = self.dev.read_obj(FILE_TAIL_SECTOR, 0)?;
            if tail.timestamp == TIMESTAMP_INVALID {
                break;
            }
            file.write_head += tail.bytes_in_block;
            file.block = tail.next_block;
        }

        self.dev.open_sector(file.block, 0)?;
        let hdr: FileSector0Header = self.dev.read_obj(0, 0)?;
        file.block_age = hdr.age;
        let spare: FileSectorSpare = self.dev.read_spare_obj(0)?;
        if spare.nbytes == SECTOR_NBYTES_INVALID {
            file.offset = size_of::<FileSector0Header>();
        } else {
            file.write_head += spare.nbytes as u32;
            file.bytes_in_block += spare.nbytes as u32;
            file.sector = next_sector(0);
            loop {
                self.dev.open_sector(file.block, file.sector)?;
                let sp: FileSectorSpare =
                    self.dev.read_spare_obj(file.sector)?;
                if sp.nbytes == SECTOR_NBYTES_INVALID {
                    file.offset = sector_header_size(file.sector);
                    break;
                }
                file.write_head += sp.nbytes as u32;
                file.bytes_in_block += sp.nbytes as u32;
                file.sector = next_sector(file.sector);
            }
        }
        file.sector_remaining = SECTOR_SIZE - file.offset;
        Ok(file)
    }

    pub(crate) fn write_inner(
        &mut self,
        alloc: &Mutex<Allocator>,
        h: u32,
        src: &[u8],
    ) -> Result<usize> {
        let mut file = self.write_files.remove(&h).ok_or(Error::BadHandle)?;
        let result = self.write_loop(alloc, h, &mut file, src);
        self.write_files.insert(h, file);
        result
    }

    fn write_loop(
        &mut self,
        alloc: &Mutex<Allocator>,
        h: u32,
        file: &mut WriteFile,
        src: &[u8],
    ) -> Result<usize> {
        let mut count = 0;
        while count < src.len() {
            let nrem = src.len() - count;
            if nrem >= file.sector_remaining {
                let n = file.sector_remaining;
                let mut al = alloc.lock();
                let committed =
                    self.commit_sector(&mut al, h, file, &src[count..count + n]);
                drop(al);
                if committed.is_err() {
                    // Out of blocks or the device failed; the
                    // caller keeps whatever was accepted.
                    return Ok(count);
                }
                count += n;
            } else {
                file.buffer[file.offset..file.offset + nrem]
                    .copy_from_slice(&src[count..]);
                file.offset += nrem;
                file.sector_remaining -= nrem;
                file.bytes_in_block += nrem as u32;
                file.write_head += nrem as u32;
                count += nrem;
            }
        }
        Ok(count)
    }

    /// Programs the current sector: the buffered prefix, `data`
    /// appended to it, and the spare byte count.  Sealing the
    /// tail sector additionally allocates the chain successor
    /// and advances the cursor into it.
    pub(crate) fn commit_sector(
        &mut self,
        al: &mut Allocator,
        h: u32,
        file: &mut WriteFile,
        data: &[u8],
    ) -> Result<()> {
        let n = data.len();
        if file.sector == FILE_TAIL_SECTOR {
            self.flush_dirty_block(al)?;
            let next = self.allocate_block(al).ok_or(Error::Full)?;

            let t = self.next_timestamp();
            file.bytes_in_block += n as u32;
            let payload = file.offset + n - size_of::<FileTailHeader>();
            let tail = FileTailHeader {
                next_block: next.block,
                _resv: !0,
                next_age: next.age + 1,
                timestamp: t,
                bytes_in_block: file.bytes_in_block,
            };
            file.buffer[..size_of::<FileTailHeader>()]
                .copy_from_slice(bytemuck::bytes_of(&tail));
            let spare = FileSectorSpare {
                type_id: BLOCK_TYPE_FILE,
                _nothing: 0,
                nbytes: payload as u16,
            };

            self.dev.open_sector(file.block, FILE_TAIL_SECTOR)?;
            self.dev.write_sector(
                &file.buffer[..file.offset],
                FILE_TAIL_SECTOR,
                0,
            )?;
            if n > 0 {
                self.dev.write_sector(data, FILE_TAIL_SECTOR, file.offset)?;
            }
            self.dev.write_spare_obj(&spare, FILE_TAIL_SECTOR)?;
            self.dev.commit()?;
            // Announced by the sealed tail; now safe to erase.
            self.dev.erase_block(next.block)?;
            al.dirty = Some(DirtyLease { block: next.block, owner: h });

            file.block = next.block;
            file.block_age = next.age + 1;
            file.sector = 0;
            file.offset = size_of::<FileSector0Header>();
            file.sector_remaining = SECTOR_SIZE - file.offset;
            file.bytes_in_block = 0;
            file.write_head += n as u32;
        } else {
            if file.sector == 0 {
                let hdr = FileSector0Header {
                    file_id: file.id,
                    age: file.block_age,
                };
                file.buffer[..size_of::<FileSector0Header>()]
                    .copy_from_slice(bytemuck::bytes_of(&hdr));
            }
            let payload = file.offset + n - sector_header_size(file.sector);
            let spare = FileSectorSpare {
                type_id: BLOCK_TYPE_FILE,
                _nothing: 0,
                nbytes: payload as u16,
            };

            self.dev.open_sector(file.block, file.sector)?;
            if file.offset > 0 {
                self.dev.write_sector(&file.buffer[..file.offset], file.sector, 0)?;
            }
            if n > 0 {
                self.dev.write_sector(data, file.sector, file.offset)?;
            }
            self.dev.write_spare_obj(&spare, file.sector)?;
            self.dev.commit()?;

            // A sector 0 header makes the block durable: the
            // lease is consumed and the block leaves the free
            // population.
            if matches!(al.dirty, Some(DirtyLease { owner, .. }) if owner == h)
            {
                al.dirty = None;
                self.num_free_blocks -= 1;
            }

            file.sector = next_sector(file.sector);
            file.offset = sector_header_size(file.sector);
            file.sector_remaining = SECTOR_SIZE - file.offset;
            file.bytes_in_block += n as u32;
            file.write_head += n as u32;
        }
        Ok(())
    }

    /// Persists the cursor's partial sector.  A cursor with
    /// nothing buffered and no lease to consume has nothing to
    /// flush; in particular an empty tail sector is never
    /// sealed just to satisfy a close.
    pub(crate) fn flush_write(
        &mut self,
        al: &mut Allocator,
        h: u32,
        file: &mut WriteFile,
    ) -> Result<()> {
        let dirty_owned =
            matches!(al.dirty, Some(DirtyLease { owner, .. }) if owner == h);
        if !dirty_owned && file.offset == sector_header_size(file.sector) {
            return Ok(());
        }
        self.commit_sector(al, h, file, &[])
    }

    /// Forces the dirty block's owner to program its sector 0
    /// header, so a new allocation can proceed.  The owner's
    /// cursor always sits in a non-tail sector of the leased
    /// block, so this never recurses into allocation.
    pub(crate) fn flush_dirty_block(&mut self, al: &mut Allocator) -> Result<()> {
        let Some(lease) = al.dirty else {
            return Ok(());
        };
        if let Some(mut file) = self.write_files.remove(&lease.owner) {
            let r = self.flush_write(al, lease.owner, &mut file);
            self.write_files.insert(lease.owner, file);
            r
        } else {
            self.dev.debug_error("flogfs: dirty block has no open owner");
            al.dirty = None;
            Ok(())
        }
    }

    pub(crate) fn allocate_block(
        &mut self,
        al: &mut Allocator,
    ) -> Option<BlockAllocation> {
        al.allocate(&mut self.dev, self.num_free_blocks)
    }

    pub(crate) fn close_write_inner(
        &mut self,
        alloc: &Mutex<Allocator>,
        h: u32,
    ) -> Result<()> {
        let mut file = self.write_files.remove(&h).ok_or(Error::BadHandle)?;
        let mut al = alloc.lock();
        let r = self.flush_write(&mut al, h, &mut file);
        drop(al);
        r
    }
}
