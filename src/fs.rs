// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The file system proper: process-wide state, the public
//! operation surface, the directory, and mount-time recovery.
//!
//! All state lives in a single [`Flogfs`] value behind two
//! locks.  The FS lock serializes every public operation and is
//! taken before the flash driver's own lock; the allocate lock
//! guards the allocator, the preallocation list and the dirty
//! block lease, and is only ever taken while the other two are
//! held.
//!
//! Durability comes from write ordering rather than journaling.
//! Every record that matters is programmed after the records
//! that make it discoverable, and the mount scan classifies
//! every block, finds the newest allocation and deletion the
//! directory knows about, and completes whichever of the two
//! was cut short by a power loss.

use crate::allocator::Allocator;
use crate::cache::Dev;
use crate::flash::{NandFlash, MAX_FNAME_LEN, NUM_BLOCKS};
use crate::inode::InodeIter;
use crate::reader::ReadFile;
use crate::records::{
    chain_next_block, BlockAge, BlockIdx, FileId, FileSector0Header,
    FileSectorSpare, FileTailHeader, InodeAllocRecord, InodeInvalidationRecord,
    InodeSector0, InodeSector0Spare, InodeTailSector, InvalidationSector,
    Timestamp, AGE_INVALID, BLOCK_IDX_INVALID, BLOCK_TYPE_FILE,
    BLOCK_TYPE_INODE, BLOCK_TYPE_UNALLOCATED, FILE_ID_INVALID,
    FILE_INVALIDATION_SECTOR, FILE_TAIL_SECTOR, INODE_INVALIDATION_SECTOR,
    INODE_TAIL_SECTOR, TIMESTAMP_INVALID,
};
use crate::result::{Error, Result};
use crate::writer::WriteFile;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use spin::Mutex;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum State {
    Reset,
    Mounted,
}

/// Handle to a file opened for reading.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReadHandle(pub(crate) u32);

/// Handle to a file opened for writing.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WriteHandle(pub(crate) u32);

pub(crate) struct FileFind {
    pub file_id: FileId,
    pub first_block: BlockIdx,
}

/// Everything guarded by the FS lock.
pub(crate) struct Inner<F> {
    pub(crate) dev: Dev<F>,
    pub(crate) state: State,
    pub(crate) t: Timestamp,
    pub(crate) max_file_id: FileId,
    pub(crate) inode0: BlockIdx,
    pub(crate) num_files: u32,
    pub(crate) num_free_blocks: u32,
    pub(crate) mean_block_age: u32,
    pub(crate) read_files: BTreeMap<u32, ReadFile>,
    pub(crate) write_files: BTreeMap<u32, WriteFile>,
    pub(crate) handle_seq: u32,
}

/// A log-structured file system over one NAND flash device.
pub struct Flogfs<F> {
    pub(crate) inner: Mutex<Inner<F>>,
    pub(crate) alloc: Mutex<Allocator>,
}

impl<F: NandFlash> Inner<F> {
    fn new(flash: F) -> Inner<F> {
        Inner {
            dev: Dev::new(flash),
            state: State::Reset,
            t: 0,
            max_file_id: 0,
            inode0: BLOCK_IDX_INVALID,
            num_files: 0,
            num_free_blocks: 0,
            mean_block_age: 0,
            read_files: BTreeMap::new(),
            write_files: BTreeMap::new(),
            handle_seq: 0,
        }
    }

    fn reset(&mut self) {
        self.state = State::Reset;
        self.t = 0;
        self.max_file_id = 0;
        self.inode0 = BLOCK_IDX_INVALID;
        self.num_files = 0;
        self.num_free_blocks = 0;
        self.mean_block_age = 0;
        self.read_files.clear();
        self.write_files.clear();
        self.dev.close_sector();
    }

    /// Hands out the next stamp.  Stamps are preincremented so
    /// `t` always names the most recent completed operation.
    pub(crate) fn next_timestamp(&mut self) -> Timestamp {
        self.t += 1;
        self.t
    }

    pub(crate) fn next_handle(&mut self) -> u32 {
        self.handle_seq += 1;
        self.handle_seq
    }

    /// Looks a name up in the directory.  On a miss the
    /// returned iterator rests on the first unused entry, ready
    /// for a create.
    pub(crate) fn find_file(
        &mut self,
        name: &[u8],
    ) -> Result<(Option<FileFind>, InodeIter)> {
        let mut iter = InodeIter::new(&mut self.dev, self.inode0)?;
        loop {
            if iter.end {
                return Ok((None, iter));
            }
            self.dev.open_sector(iter.block, iter.sector)?;
            let rec: InodeAllocRecord = self.dev.read_obj(iter.sector, 0)?;
            if rec.header.file_id == FILE_ID_INVALID {
                return Ok((None, iter));
            }
            if name_matches(&rec.filename, name) {
                self.dev.open_sector(iter.block, iter.sector + 1)?;
                let inv: InodeInvalidationRecord =
                    self.dev.read_obj(iter.sector + 1, 0)?;
                if inv.timestamp == TIMESTAMP_INVALID {
                    let found = FileFind {
                        file_id: rec.header.file_id,
                        first_block: rec.header.first_block,
                    };
                    return Ok((Some(found), iter));
                }
            }
            iter.advance(&mut self.dev)?;
        }
    }

    /// Extends the directory chain when the iterator rests on
    /// the last entry pair of its block, so that the entry can
    /// be used and iteration can continue past it later.
    pub(crate) fn inode_prepare_new(
        &mut self,
        al: &mut Allocator,
        iter: &mut InodeIter,
    ) -> Result<()> {
        if !iter.at_last_entry() {
            return Ok(());
        }
        if iter.next_block != BLOCK_IDX_INVALID {
            // A successor already exists; nothing to do.
            self.dev.debug_warn("flogfs: inode chain already extended");
            return Ok(());
        }

        self.flush_dirty_block(al)?;
        let next = self.allocate_block(al).ok_or(Error::Full)?;

        let t = self.next_timestamp();
        let tail = InodeTailSector {
            next_block: next.block,
            _resv: !0,
            next_age: next.age + 1,
            timestamp: t,
        };
        self.dev.open_sector(iter.block, INODE_TAIL_SECTOR)?;
        self.dev.write_obj(&tail, INODE_TAIL_SECTOR, 0)?;
        self.dev.commit()?;

        // The tail names the new block; now erase and header it.
        self.dev.erase_block(next.block)?;
        self.dev.open_page(next.block, 0)?;
        let hdr = InodeSector0 { age: next.age + 1, timestamp: t };
        self.dev.write_obj(&hdr, 0, 0)?;
        iter.inode_block_idx += 1;
        let spare = InodeSector0Spare {
            type_id: BLOCK_TYPE_INODE,
            _nothing: 0,
            inode_index: iter.inode_block_idx,
        };
        self.dev.write_spare_obj(&spare, 0)?;
        self.dev.commit()?;
        self.num_free_blocks -= 1;

        iter.next_block = next.block;
        Ok(())
    }

    fn rm_inner(&mut self, name: &str) -> Result<()> {
        let name = name.as_bytes();
        let (found, iter) = self.find_file(name)?;
        let found = found.ok_or(Error::NotFound)?;
        if self.write_files.values().any(|w| w.id == found.file_id)
            || self.read_files.values().any(|r| r.id == found.file_id)
        {
            return Err(Error::Busy);
        }

        // Find the last block of the chain, then write the
        // inode invalidation first: if power fails while the
        // chain is being torn down, mount can finish the job
        // from `last_block`.
        let mut last = found.first_block;
        loop {
            let next = chain_next_block(&mut self.dev, last)?;
            if next == BLOCK_IDX_INVALID {
                break;
            }
            last = next;
        }

        let t = self.next_timestamp();
        let inv = InodeInvalidationRecord {
            timestamp: t,
            last_block: last,
            _resv: !0,
        };
        self.dev.open_sector(iter.block, iter.sector + 1)?;
        self.dev.write_obj(&inv, iter.sector + 1, 0)?;
        self.dev.commit()?;

        self.invalidate_chain(found.first_block)?;
        self.num_files -= 1;
        Ok(())
    }

    /// Programs the invalidation sector of every block in a
    /// chain, skipping blocks already invalidated so the walk
    /// can resume a half-finished deletion.
    pub(crate) fn invalidate_chain(&mut self, base: BlockIdx) -> Result<()> {
        let mut block = base;
        loop {
            self.dev.open_sector(block, FILE_TAIL_SECTOR)?;
            let tail: FileTailHeader = self.dev.read_obj(FILE_TAIL_SECTOR, 0)?;
            self.dev.open_sector(block, FILE_INVALIDATION_SECTOR)?;
            let inv: InvalidationSector =
                self.dev.read_obj(FILE_INVALIDATION_SECTOR, 0)?;

            if inv.timestamp != TIMESTAMP_INVALID {
                // Already freed by an earlier, interrupted walk.
                if inv.next_age == AGE_INVALID
                    || tail.next_block == BLOCK_IDX_INVALID
                {
                    return Ok(());
                }
                block = tail.next_block;
                continue;
            }

            let t = self.next_timestamp();
            let inv = InvalidationSector {
                timestamp: t,
                // All-ones on the chain's unsealed last block.
                next_age: tail.next_age,
            };
            self.dev.write_obj(&inv, FILE_INVALIDATION_SECTOR, 0)?;
            self.dev.commit()?;
            self.num_free_blocks += 1;

            if tail.next_block == BLOCK_IDX_INVALID {
                return Ok(());
            }
            block = tail.next_block;
        }
    }

    fn format_inner(&mut self) -> Result<()> {
        let mut first_valid = BLOCK_IDX_INVALID;
        for i in 0..NUM_BLOCKS as BlockIdx {
            if self.dev.open_page(i, 0).is_err() {
                continue;
            }
            match self.dev.block_is_bad() {
                Ok(false) => {}
                Ok(true) | Err(_) => continue,
            }
            self.dev.erase_block(i)?;
            if first_valid == BLOCK_IDX_INVALID {
                first_valid = i;
            }
        }
        if first_valid == BLOCK_IDX_INVALID {
            self.dev.debug_error("flogfs: no usable block to format");
            return Err(Error::Io);
        }

        // The fresh directory head: age 0, stamp 0, chain
        // position 0.
        self.dev.open_page(first_valid, 0)?;
        let hdr = InodeSector0 { age: 0, timestamp: 0 };
        self.dev.write_obj(&hdr, 0, 0)?;
        let spare = InodeSector0Spare {
            type_id: BLOCK_TYPE_INODE,
            _nothing: 0,
            inode_index: 0,
        };
        self.dev.write_spare_obj(&spare, 0)?;
        self.dev.commit()
    }

    fn mount_scan(&mut self) -> Result<()> {
        struct LastAllocation {
            block: BlockIdx,
            age: BlockAge,
            file_id: FileId,
            timestamp: Timestamp,
        }
        struct LastDeletion {
            first_block: BlockIdx,
            last_block: BlockIdx,
            file_id: FileId,
            timestamp: Timestamp,
        }

        let mut last_alloc = LastAllocation {
            block: BLOCK_IDX_INVALID,
            age: 0,
            file_id: FILE_ID_INVALID,
            timestamp: 0,
        };
        let mut last_del = LastDeletion {
            first_block: BLOCK_IDX_INVALID,
            last_block: BLOCK_IDX_INVALID,
            file_id: FILE_ID_INVALID,
            timestamp: 0,
        };
        let mut inode0 = BLOCK_IDX_INVALID;
        let mut t_max: Timestamp = 0;
        let mut age_sum: u64 = 0;
        let mut age_cnt: u32 = 0;

        self.num_free_blocks = 0;
        self.num_files = 0;
        self.max_file_id = 0;

        // Pass 1: classify every block from page 0 alone.
        for i in 0..NUM_BLOCKS as BlockIdx {
            if self.dev.open_page(i, 0).is_err() {
                continue;
            }
            match self.dev.block_is_bad() {
                Ok(false) => {}
                Ok(true) => {
                    self.dev.debug_warn("flogfs: skipping bad block");
                    continue;
                }
                Err(_) => continue,
            }
            let spare: InodeSector0Spare = self.dev.read_spare_obj(0)?;
            match spare.type_id {
                BLOCK_TYPE_INODE => {
                    self.dev.open_sector(i, INODE_INVALIDATION_SECTOR)?;
                    let inv: InvalidationSector =
                        self.dev.read_obj(INODE_INVALIDATION_SECTOR, 0)?;
                    self.dev.open_sector(i, 0)?;
                    let hdr: InodeSector0 = self.dev.read_obj(0, 0)?;
                    if inv.timestamp == TIMESTAMP_INVALID {
                        if spare.inode_index == 0 {
                            inode0 = i;
                        }
                    } else {
                        t_max = t_max.max(inv.timestamp);
                        self.num_free_blocks += 1;
                    }
                    if hdr.timestamp != TIMESTAMP_INVALID {
                        t_max = t_max.max(hdr.timestamp);
                    }
                    if hdr.age != AGE_INVALID {
                        age_sum += hdr.age as u64;
                        age_cnt += 1;
                    }
                }
                BLOCK_TYPE_FILE => {
                    self.dev.open_sector(i, FILE_TAIL_SECTOR)?;
                    let tail: FileTailHeader =
                        self.dev.read_obj(FILE_TAIL_SECTOR, 0)?;
                    self.dev.open_sector(i, 0)?;
                    let hdr: FileSector0Header = self.dev.read_obj(0, 0)?;
                    if tail.timestamp != TIMESTAMP_INVALID {
                        t_max = t_max.max(tail.timestamp);
                        if tail.timestamp > last_alloc.timestamp {
                            // The youngest sealed tail names
                            // the youngest announced block.
                            last_alloc = LastAllocation {
                                block: tail.next_block,
                                age: tail.next_age,
                                file_id: hdr.file_id,
                                timestamp: tail.timestamp,
                            };
                        }
                    }
                    self.dev.open_sector(i, FILE_INVALIDATION_SECTOR)?;
                    let inv: InvalidationSector =
                        self.dev.read_obj(FILE_INVALIDATION_SECTOR, 0)?;
                    if inv.timestamp != TIMESTAMP_INVALID {
                        t_max = t_max.max(inv.timestamp);
                        self.num_free_blocks += 1;
                    }
                    if hdr.age != AGE_INVALID {
                        age_sum += hdr.age as u64;
                        age_cnt += 1;
                    }
                }
                BLOCK_TYPE_UNALLOCATED => self.num_free_blocks += 1,
                _ => {
                    self.dev.debug_error("flogfs: unknown block type");
                    return Err(Error::Corrupt);
                }
            }
        }

        if inode0 == BLOCK_IDX_INVALID {
            self.dev.debug_error("flogfs: no directory head found");
            return Err(Error::NoFilesystem);
        }
        self.inode0 = inode0;

        // Pass 2: walk the directory for the newest allocation
        // and deletion, the file count, and the top file id.
        let mut iter = InodeIter::new(&mut self.dev, inode0)?;
        loop {
            if iter.end {
                break;
            }
            self.dev.open_sector(iter.block, iter.sector)?;
            let rec: InodeAllocRecord = self.dev.read_obj(iter.sector, 0)?;
            if rec.header.file_id == FILE_ID_INVALID {
                break;
            }
            // Entries are issued sequentially.
            self.max_file_id = rec.header.file_id;
            t_max = t_max.max(rec.header.timestamp);

            self.dev.open_sector(iter.block, iter.sector + 1)?;
            let inv: InodeInvalidationRecord =
                self.dev.read_obj(iter.sector + 1, 0)?;
            if inv.timestamp == TIMESTAMP_INVALID {
                self.num_files += 1;
                if rec.header.timestamp > last_alloc.timestamp {
                    last_alloc = LastAllocation {
                        block: rec.header.first_block,
                        age: rec.header.first_block_age,
                        file_id: rec.header.file_id,
                        timestamp: rec.header.timestamp,
                    };
                }
            } else {
                t_max = t_max.max(inv.timestamp);
                if inv.timestamp > last_del.timestamp {
                    last_del = LastDeletion {
                        first_block: rec.header.first_block,
                        last_block: inv.last_block,
                        file_id: rec.header.file_id,
                        timestamp: inv.timestamp,
                    };
                }
            }
            iter.advance(&mut self.dev)?;
        }

        self.t = t_max;

        // Pass 3: the youngest announced block must carry its
        // owner's header.  If it does not, power was lost
        // between the announcement and the block's
        // initialization; finish the job.
        if last_alloc.timestamp > 0 {
            self.dev.open_sector(last_alloc.block, 0)?;
            let hdr: FileSector0Header = self.dev.read_obj(0, 0)?;
            if hdr.file_id != last_alloc.file_id {
                self.dev.erase_block(last_alloc.block)?;
                self.dev.open_page(last_alloc.block, 0)?;
                let hdr = FileSector0Header {
                    file_id: last_alloc.file_id,
                    age: last_alloc.age,
                };
                self.dev.write_obj(&hdr, 0, 0)?;
                let spare = FileSectorSpare {
                    type_id: BLOCK_TYPE_FILE,
                    _nothing: 0,
                    nbytes: 0,
                };
                self.dev.write_spare_obj(&spare, 0)?;
                self.dev.commit()?;
                self.num_free_blocks -= 1;
                self.t = self.t.max(last_alloc.timestamp + 1);
            }
        }

        // Pass 4: the youngest deletion must have invalidated
        // its whole chain.  The last block still carrying the
        // file's header with an unwritten invalidation sector
        // means the walk was cut short; run it again.
        if last_del.timestamp > 0 {
            self.dev.open_sector(last_del.last_block, 0)?;
            let hdr: FileSector0Header = self.dev.read_obj(0, 0)?;
            if hdr.file_id == last_del.file_id {
                self.dev
                    .open_sector(last_del.last_block, FILE_INVALIDATION_SECTOR)?;
                let inv: InvalidationSector =
                    self.dev.read_obj(FILE_INVALIDATION_SECTOR, 0)?;
                if inv.timestamp == TIMESTAMP_INVALID {
                    self.dev.debug_warn("flogfs: completing deletion");
                    self.invalidate_chain(last_del.first_block)?;
                }
            }
        }

        self.mean_block_age =
            if age_cnt > 0 { (age_sum / age_cnt as u64) as u32 } else { 0 };
        Ok(())
    }
}

impl<F: NandFlash> Flogfs<F> {
    /// Creates a file system over the given flash driver.  The
    /// device is untouched until [`init`](Flogfs::init).
    pub fn new(flash: F) -> Flogfs<F> {
        Flogfs {
            inner: Mutex::new(Inner::new(flash)),
            alloc: Mutex::new(Allocator::new()),
        }
    }

    /// Resets in-memory state and brings the flash driver up.
    pub fn init(&self) -> Result<()> {
        let mut fs = self.inner.lock();
        self.alloc.lock().reset();
        fs.reset();
        fs.dev.flash_mut().init()
    }

    /// Erases every usable block and writes a fresh directory
    /// head into the first of them.  Refused while mounted.
    pub fn format(&self) -> Result<()> {
        let mut fs = self.inner.lock();
        if fs.state == State::Mounted {
            return Err(Error::Mounted);
        }
        fs.dev.flash_lock();
        let r = fs.format_inner();
        fs.dev.flash_unlock();
        r
    }

    /// Scans the device, recovers from any interrupted
    /// operation, and brings the file system online.  Mounting
    /// twice is an idempotent success.
    pub fn mount(&self) -> Result<()> {
        let mut fs = self.inner.lock();
        if fs.state == State::Mounted {
            return Ok(());
        }
        self.alloc.lock().reset();
        fs.dev.flash_lock();
        let r = fs.mount_scan();
        fs.dev.flash_unlock();
        if r.is_ok() {
            fs.state = State::Mounted;
        }
        r
    }

    /// Opens a file for reading, positioned at its first byte.
    pub fn open_read(&self, name: &str) -> Result<ReadHandle> {
        let mut fs = self.mounted()?;
        fs.dev.flash_lock();
        let r = fs.open_read_inner(name);
        fs.dev.flash_unlock();
        r.map(ReadHandle)
    }

    /// Closes a read handle.  Closing twice fails.
    pub fn close_read(&self, h: ReadHandle) -> Result<()> {
        let mut fs = self.mounted()?;
        fs.read_files.remove(&h.0).map(|_| ()).ok_or(Error::BadHandle)
    }

    /// Reads up to `dst.len()` bytes at the read head.  Returns
    /// the number of bytes read, short at end of file.
    pub fn read(&self, h: ReadHandle, dst: &mut [u8]) -> Result<usize> {
        let mut fs = self.mounted()?;
        fs.dev.flash_lock();
        let r = fs.read_inner(h.0, dst);
        fs.dev.flash_unlock();
        r
    }

    /// Opens a file for appending, creating it if necessary.
    /// Over-long names are truncated; a file already open for
    /// writing is refused.
    pub fn open_write(&self, name: &str) -> Result<WriteHandle> {
        let mut fs = self.mounted()?;
        fs.dev.flash_lock();
        let r = fs.open_write_inner(&self.alloc, name);
        fs.dev.flash_unlock();
        r.map(WriteHandle)
    }

    /// Flushes and closes a write handle.  Closing twice fails.
    pub fn close_write(&self, h: WriteHandle) -> Result<()> {
        let mut fs = self.mounted()?;
        fs.dev.flash_lock();
        let r = fs.close_write_inner(&self.alloc, h.0);
        fs.dev.flash_unlock();
        r
    }

    /// Appends bytes at the write head.  Returns the number of
    /// bytes accepted, short if the device fills up.
    pub fn write(&self, h: WriteHandle, src: &[u8]) -> Result<usize> {
        let mut fs = self.mounted()?;
        fs.dev.flash_lock();
        let r = fs.write_inner(&self.alloc, h.0, src);
        fs.dev.flash_unlock();
        r
    }

    /// Random access is not supported.
    pub fn seek(&self, _h: ReadHandle, _pos: u32) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// Deletes a file.  Fails while the file is open.
    pub fn rm(&self, name: &str) -> Result<()> {
        let mut fs = self.mounted()?;
        fs.dev.flash_lock();
        let r = fs.rm_inner(name);
        fs.dev.flash_unlock();
        r
    }

    /// True when the directory holds a live entry for `name`.
    pub fn exists(&self, name: &str) -> Result<bool> {
        let mut fs = self.mounted()?;
        fs.dev.flash_lock();
        let r = fs.find_file(name.as_bytes());
        fs.dev.flash_unlock();
        Ok(r?.0.is_some())
    }

    /// Starts a directory listing.  The iterator yields file
    /// names in creation order, skipping deleted entries.
    pub fn ls(&self) -> Result<Ls<'_, F>> {
        let mut fs = self.mounted()?;
        fs.dev.flash_lock();
        let inode0 = fs.inode0;
        let r = InodeIter::new(&mut fs.dev, inode0);
        fs.dev.flash_unlock();
        Ok(Ls { fs: self, iter: r?, done: false })
    }

    /// Collects the directory listing.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for name in self.ls()? {
            out.push(name);
        }
        Ok(out)
    }

    /// Number of live files.
    pub fn file_count(&self) -> Result<u32> {
        Ok(self.mounted()?.num_files)
    }

    /// Number of blocks available to allocation.
    pub fn free_block_count(&self) -> Result<u32> {
        Ok(self.mounted()?.num_free_blocks)
    }

    /// Mean recorded age of the allocated blocks, from the last
    /// mount scan.
    pub fn mean_block_age(&self) -> Result<u32> {
        Ok(self.mounted()?.mean_block_age)
    }

    /// Current position of a read handle.
    pub fn read_head(&self, h: ReadHandle) -> Result<u32> {
        let fs = self.mounted()?;
        fs.read_files.get(&h.0).map(|f| f.read_head).ok_or(Error::BadHandle)
    }

    /// Current position of a write handle: the file's size in
    /// bytes.
    pub fn write_head(&self, h: WriteHandle) -> Result<u32> {
        let fs = self.mounted()?;
        fs.write_files.get(&h.0).map(|f| f.write_head).ok_or(Error::BadHandle)
    }

    fn mounted(&self) -> Result<spin::MutexGuard<'_, Inner<F>>> {
        let fs = self.inner.lock();
        if fs.state != State::Mounted {
            return Err(Error::NotMounted);
        }
        Ok(fs)
    }
}

/// Directory listing iterator, created by [`Flogfs::ls`].
pub struct Ls<'a, F> {
    fs: &'a Flogfs<F>,
    iter: InodeIter,
    done: bool,
}

impl<F: NandFlash> Ls<'_, F> {
    fn step(fs: &mut Inner<F>, iter: &mut InodeIter) -> Result<Option<String>> {
        loop {
            if iter.end {
                return Ok(None);
            }
            fs.dev.open_sector(iter.block, iter.sector)?;
            let rec: InodeAllocRecord = fs.dev.read_obj(iter.sector, 0)?;
            if rec.header.file_id == FILE_ID_INVALID {
                return Ok(None);
            }
            fs.dev.open_sector(iter.block, iter.sector + 1)?;
            let inv: InodeInvalidationRecord =
                fs.dev.read_obj(iter.sector + 1, 0)?;
            let name = if inv.timestamp == TIMESTAMP_INVALID {
                Some(stored_name(&rec.filename))
            } else {
                None
            };
            iter.advance(&mut fs.dev)?;
            if let Some(name) = name {
                return Ok(Some(name));
            }
        }
    }
}

impl<F: NandFlash> Iterator for Ls<'_, F> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        if self.done {
            return None;
        }
        let mut fs = self.fs.inner.lock();
        if fs.state != State::Mounted {
            self.done = true;
            return None;
        }
        fs.dev.flash_lock();
        let r = Self::step(&mut fs, &mut self.iter);
        fs.dev.flash_unlock();
        match r {
            Ok(Some(name)) => Some(name),
            _ => {
                self.done = true;
                None
            }
        }
    }
}

/// Compares a caller's name against a stored, NUL-terminated
/// name field.
fn name_matches(stored: &[u8; MAX_FNAME_LEN], name: &[u8]) -> bool {
    let len = stored.iter().position(|&b| b == 0).unwrap_or(MAX_FNAME_LEN);
    &stored[..len] == name
}

fn stored_name(stored: &[u8; MAX_FNAME_LEN]) -> String {
    let len = stored.iter().position(|&b| b == 0).unwrap_or(MAX_FNAME_LEN);
    String::from_utf8_lossy(&stored[..len]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::{SECTORS_PER_BLOCK, SECTORS_PER_PAGE, SECTOR_SIZE};
    use crate::ramnand::RamNand;

    /// Payload capacity of sector 0, past its header.
    const S0_CAP: usize = SECTOR_SIZE - 8;
    /// Payload capacity of the tail sector, past its header.
    const TAIL_CAP: usize = SECTOR_SIZE - 16;
    /// Total payload capacity of one block: sector 0, the plain
    /// sectors, and the tail.
    const BLOCK_CAP: usize =
        S0_CAP + (SECTORS_PER_BLOCK - SECTORS_PER_PAGE + 1) * SECTOR_SIZE + TAIL_CAP;

    fn fresh() -> Flogfs<RamNand> {
        let fs = Flogfs::new(RamNand::new());
        fs.init().unwrap();
        fs.format().unwrap();
        fs.mount().unwrap();
        fs
    }

    fn put(fs: &Flogfs<RamNand>, name: &str, data: &[u8]) {
        let h = fs.open_write(name).unwrap();
        assert_eq!(fs.write(h, data).unwrap(), data.len());
        fs.close_write(h).unwrap();
    }

    fn get(fs: &Flogfs<RamNand>, name: &str) -> Vec<u8> {
        let h = fs.open_read(name).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = fs.read(h, &mut buf).unwrap();
            out.extend_from_slice(&buf[..n]);
            if n < buf.len() {
                break;
            }
        }
        fs.close_read(h).unwrap();
        out
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    /// Recomputes the free block population from flash alone:
    /// unallocated blocks plus blocks with a programmed
    /// invalidation sector.
    fn recount_free(fs: &Flogfs<RamNand>) -> u32 {
        let mut inner = fs.inner.lock();
        let mut n = 0;
        for i in 0..NUM_BLOCKS as BlockIdx {
            inner.dev.open_page(i, 0).unwrap();
            if inner.dev.block_is_bad().unwrap() {
                continue;
            }
            let spare: InodeSector0Spare = inner.dev.read_spare_obj(0).unwrap();
            match spare.type_id {
                BLOCK_TYPE_UNALLOCATED => n += 1,
                BLOCK_TYPE_INODE | BLOCK_TYPE_FILE => {
                    inner.dev.open_sector(i, FILE_INVALIDATION_SECTOR).unwrap();
                    let inv: InvalidationSector = inner
                        .dev
                        .read_obj(FILE_INVALIDATION_SECTOR, 0)
                        .unwrap();
                    if inv.timestamp != TIMESTAMP_INVALID {
                        n += 1;
                    }
                }
                other => panic!("unexpected block type {other}"),
            }
        }
        n
    }

    /// Simulates a reboot: the array as committed so far, in a
    /// brand new file system instance.
    fn remount(fs: &Flogfs<RamNand>) -> Flogfs<RamNand> {
        let img = fs.inner.lock().dev.flash_mut().snapshot();
        let fs2 = Flogfs::new(img);
        fs2.init().unwrap();
        fs2.mount().unwrap();
        fs2
    }

    #[test]
    fn format_and_mount_yield_an_empty_directory() {
        let fs = fresh();
        assert_eq!(fs.list().unwrap(), Vec::<String>::new());
        assert_eq!(fs.file_count().unwrap(), 0);
        // Every block but the directory head is free.
        assert_eq!(fs.free_block_count().unwrap(), NUM_BLOCKS as u32 - 1);
    }

    #[test]
    fn mount_is_idempotent() {
        let fs = fresh();
        put(&fs, "a", b"abc");
        let free = fs.free_block_count().unwrap();
        fs.mount().unwrap();
        assert_eq!(fs.free_block_count().unwrap(), free);
        assert_eq!(fs.file_count().unwrap(), 1);
    }

    #[test]
    fn mount_without_a_filesystem_fails() {
        let fs = Flogfs::new(RamNand::new());
        fs.init().unwrap();
        assert_eq!(fs.mount(), Err(Error::NoFilesystem));
    }

    #[test]
    fn operations_before_mount_are_rejected() {
        let fs = Flogfs::new(RamNand::new());
        fs.init().unwrap();
        assert_eq!(fs.open_read("a").unwrap_err(), Error::NotMounted);
        assert_eq!(fs.open_write("a").unwrap_err(), Error::NotMounted);
        assert_eq!(fs.rm("a").unwrap_err(), Error::NotMounted);
        assert_eq!(fs.list().unwrap_err(), Error::NotMounted);
    }

    #[test]
    fn format_is_refused_while_mounted() {
        let fs = fresh();
        assert_eq!(fs.format(), Err(Error::Mounted));
    }

    #[test]
    fn small_write_reads_back_short() {
        let fs = fresh();
        put(&fs, "a", &[0x41; 100]);
        let h = fs.open_read("a").unwrap();
        let mut buf = [0u8; 200];
        assert_eq!(fs.read(h, &mut buf).unwrap(), 100);
        assert!(buf[..100].iter().all(|&b| b == 0x41));
        // Past end of file: no error, nothing read.
        assert_eq!(fs.read(h, &mut buf).unwrap(), 0);
        assert_eq!(fs.read_head(h).unwrap(), 100);
        fs.close_read(h).unwrap();
    }

    #[test]
    fn write_crossing_the_first_sector_reads_back() {
        let fs = fresh();
        let data = pattern(S0_CAP + 1);
        put(&fs, "a", &data);
        assert_eq!(get(&fs, "a"), data);
    }

    #[test]
    fn empty_file_exists_and_reads_nothing() {
        let fs = fresh();
        let h = fs.open_write("empty").unwrap();
        fs.close_write(h).unwrap();
        assert!(fs.exists("empty").unwrap());
        assert_eq!(get(&fs, "empty"), Vec::<u8>::new());
        assert_eq!(fs.list().unwrap(), vec!["empty".to_string()]);
    }

    #[test]
    fn file_spanning_two_blocks() {
        let fs = fresh();
        let before = fs.free_block_count().unwrap();
        let data = pattern(BLOCK_CAP + 100);
        put(&fs, "big", &data);
        // The sealed first block and its successor.
        assert_eq!(fs.free_block_count().unwrap(), before - 2);
        assert_eq!(get(&fs, "big"), data);
        let fs2 = remount(&fs);
        assert_eq!(get(&fs2, "big"), data);
        assert_eq!(fs2.free_block_count().unwrap(), before - 2);
    }

    #[test]
    fn interleaved_writers_do_not_mix() {
        let fs = fresh();
        let ha = fs.open_write("a").unwrap();
        assert_eq!(fs.write(ha, &[0x61; 100]).unwrap(), 100);
        let hb = fs.open_write("b").unwrap();
        assert_eq!(fs.write(hb, &[0x62; 100]).unwrap(), 100);
        fs.close_write(hb).unwrap();
        fs.close_write(ha).unwrap();
        assert_eq!(get(&fs, "a"), vec![0x61; 100]);
        assert_eq!(get(&fs, "b"), vec![0x62; 100]);
    }

    #[test]
    fn opening_a_second_writer_flushes_the_first() {
        let fs = fresh();
        let ha = fs.open_write("a").unwrap();
        assert_eq!(fs.write(ha, &[7; 10]).unwrap(), 10);
        // Claiming a block for "b" forces "a"'s buffered sector
        // out; the data becomes visible to readers.
        let hb = fs.open_write("b").unwrap();
        assert_eq!(get(&fs, "a"), vec![7; 10]);
        fs.close_write(hb).unwrap();
        fs.close_write(ha).unwrap();
        assert_eq!(get(&fs, "a"), vec![7; 10]);
    }

    #[test]
    fn delete_middle_file_and_remount() {
        let fs = fresh();
        put(&fs, "a", b"one");
        put(&fs, "b", b"two");
        put(&fs, "c", b"three");
        fs.rm("b").unwrap();
        assert!(!fs.exists("b").unwrap());

        let fs2 = remount(&fs);
        assert_eq!(fs2.list().unwrap(), vec!["a".to_string(), "c".to_string()]);
        assert_eq!(fs2.file_count().unwrap(), 2);
        assert_eq!(fs2.inner.lock().max_file_id, 3);

        // A re-created name gets a fresh, larger file id.
        put(&fs2, "b", b"again");
        assert_eq!(fs2.inner.lock().max_file_id, 4);
        assert_eq!(
            fs2.list().unwrap(),
            vec!["a".to_string(), "c".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn reopening_appends_at_the_end() {
        let fs = fresh();
        let data = pattern(300);
        put(&fs, "log", &data);
        let h = fs.open_write("log").unwrap();
        assert_eq!(fs.write_head(h).unwrap(), 300);
        assert_eq!(fs.write(h, &data).unwrap(), 300);
        fs.close_write(h).unwrap();
        let mut expect = data.clone();
        expect.extend_from_slice(&data);
        assert_eq!(get(&fs, "log"), expect);
    }

    #[test]
    fn append_across_a_remount() {
        let fs = fresh();
        let a = pattern(S0_CAP + 40);
        put(&fs, "log", &a);
        let fs2 = remount(&fs);
        let b = pattern(100);
        let h = fs2.open_write("log").unwrap();
        assert_eq!(fs2.write_head(h).unwrap(), a.len() as u32);
        assert_eq!(fs2.write(h, &b).unwrap(), 100);
        fs2.close_write(h).unwrap();
        let mut expect = a.clone();
        expect.extend_from_slice(&b);
        assert_eq!(get(&fs2, "log"), expect);
    }

    #[test]
    fn missing_files_fail() {
        let fs = fresh();
        assert_eq!(fs.open_read("nope").unwrap_err(), Error::NotFound);
        assert_eq!(fs.rm("nope").unwrap_err(), Error::NotFound);
        assert!(!fs.exists("nope").unwrap());
    }

    #[test]
    fn long_names_reject_on_read_truncate_on_write() {
        let fs = fresh();
        let long = "x".repeat(MAX_FNAME_LEN + 8);
        assert_eq!(fs.open_read(&long).unwrap_err(), Error::NameTooLong);
        let h = fs.open_write(&long).unwrap();
        fs.close_write(h).unwrap();
        assert!(fs.exists(&long[..MAX_FNAME_LEN - 1]).unwrap());
        // The truncated spelling names the same file.
        let h = fs.open_write(&long[..MAX_FNAME_LEN - 1]).unwrap();
        fs.close_write(h).unwrap();
        assert_eq!(fs.file_count().unwrap(), 1);
    }

    #[test]
    fn double_close_fails() {
        let fs = fresh();
        put(&fs, "a", b"data");
        let h = fs.open_read("a").unwrap();
        fs.close_read(h).unwrap();
        assert_eq!(fs.close_read(h).unwrap_err(), Error::BadHandle);
        let w = fs.open_write("a").unwrap();
        fs.close_write(w).unwrap();
        assert_eq!(fs.close_write(w).unwrap_err(), Error::BadHandle);
        assert_eq!(fs.write(w, b"x").unwrap_err(), Error::BadHandle);
    }

    #[test]
    fn seek_is_unsupported() {
        let fs = fresh();
        put(&fs, "a", b"data");
        let h = fs.open_read("a").unwrap();
        assert_eq!(fs.seek(h, 2).unwrap_err(), Error::Unsupported);
    }

    #[test]
    fn concurrent_writers_and_rm_of_open_files_are_refused() {
        let fs = fresh();
        let h = fs.open_write("a").unwrap();
        assert_eq!(fs.open_write("a").unwrap_err(), Error::Busy);
        fs.write(h, b"data").unwrap();
        assert_eq!(fs.rm("a").unwrap_err(), Error::Busy);
        fs.close_write(h).unwrap();
        fs.rm("a").unwrap();
    }

    #[test]
    fn device_fills_up_with_a_short_write() {
        let fs = fresh();
        let h = fs.open_write("big").unwrap();
        let chunk = pattern(4096);
        let mut total = 0usize;
        loop {
            let n = fs.write(h, &chunk).unwrap();
            total += n;
            if n < chunk.len() {
                break;
            }
        }
        // Well over a dozen blocks of payload made it in.
        assert!(total > 12 * BLOCK_CAP);
        let _ = fs.close_write(h);
        assert_eq!(fs.free_block_count().unwrap(), recount_free(&fs));
        // Deleting the file makes the space reusable.
        fs.rm("big").unwrap();
        assert_eq!(fs.free_block_count().unwrap(), recount_free(&fs));
        put(&fs, "after", b"still alive");
        assert_eq!(get(&fs, "after"), b"still alive".to_vec());
    }

    #[test]
    fn free_count_matches_a_recount_after_mixed_ops() {
        let fs = fresh();
        put(&fs, "a", &pattern(100));
        put(&fs, "b", &pattern(BLOCK_CAP + 5));
        put(&fs, "c", &pattern(2000));
        assert_eq!(fs.free_block_count().unwrap(), recount_free(&fs));
        fs.rm("b").unwrap();
        assert_eq!(fs.free_block_count().unwrap(), recount_free(&fs));
        let fs2 = remount(&fs);
        assert_eq!(fs2.free_block_count().unwrap(), recount_free(&fs2));
        assert_eq!(
            fs2.free_block_count().unwrap(),
            fs.free_block_count().unwrap()
        );
    }

    #[test]
    fn a_bad_block_is_never_used() {
        let mut nand = RamNand::new();
        nand.mark_bad(0);
        let fs = Flogfs::new(nand);
        fs.init().unwrap();
        fs.format().unwrap();
        fs.mount().unwrap();
        // The directory head skipped block 0, and block 0 is
        // not in the free population.
        assert_eq!(fs.free_block_count().unwrap(), NUM_BLOCKS as u32 - 2);
        put(&fs, "a", &pattern(5000));
        assert_eq!(get(&fs, "a"), pattern(5000));
    }

    #[test]
    fn power_cut_during_create_recovers() {
        for cut in 0..=3 {
            let fs = fresh();
            put(&fs, "a", b"hello");
            fs.inner.lock().dev.flash_mut().power_cut_after(cut);
            let _ = fs.open_write("b");

            let fs2 = remount(&fs);
            assert_eq!(get(&fs2, "a"), b"hello".to_vec());
            assert_eq!(fs2.free_block_count().unwrap(), recount_free(&fs2));
            match fs2.open_read("b") {
                // The entry landed; recovery gave the file its
                // first block, still empty.
                Ok(h) => {
                    let mut buf = [0u8; 8];
                    assert_eq!(fs2.read(h, &mut buf).unwrap(), 0);
                }
                // The entry never landed; the create never
                // happened.
                Err(e) => assert_eq!(e, Error::NotFound),
            }
        }
    }

    #[test]
    fn power_cut_during_delete_recovers() {
        for cut in 0..=4 {
            let fs = fresh();
            let data = pattern(BLOCK_CAP + 100);
            put(&fs, "a", &data);
            fs.inner.lock().dev.flash_mut().power_cut_after(cut);
            let _ = fs.rm("a");

            let fs2 = remount(&fs);
            assert_eq!(fs2.free_block_count().unwrap(), recount_free(&fs2));
            if fs2.exists("a").unwrap() {
                // The deletion never started.
                assert_eq!(get(&fs2, "a"), data);
            } else {
                // The deletion completed, at mount if need be.
                assert_eq!(
                    fs2.free_block_count().unwrap(),
                    NUM_BLOCKS as u32 - 1
                );
            }
        }
    }

    #[test]
    fn power_cut_during_write_keeps_other_files_intact() {
        for cut in 0..=6 {
            let fs = fresh();
            put(&fs, "a", b"hello");
            fs.inner.lock().dev.flash_mut().power_cut_after(cut);
            if let Ok(h) = fs.open_write("b") {
                let _ = fs.write(h, &pattern(2000));
                let _ = fs.close_write(h);
            }

            let fs2 = remount(&fs);
            assert_eq!(get(&fs2, "a"), b"hello".to_vec());
            assert_eq!(fs2.free_block_count().unwrap(), recount_free(&fs2));
            if fs2.exists("b").unwrap() {
                // Whatever survived is a committed prefix.
                let got = get(&fs2, "b");
                assert_eq!(got, pattern(2000)[..got.len()].to_vec());
            }
        }
    }

    #[test]
    fn many_create_delete_cycles_extend_the_directory() {
        let fs = fresh();
        // More entries than one inode block holds, so the
        // directory chain grows a second block along the way.
        for i in 0..130 {
            let name = format!("t{i}");
            put(&fs, &name, format!("payload {i}").as_bytes());
            fs.rm(&name).unwrap();
        }
        put(&fs, "final", b"made it");
        assert_eq!(fs.free_block_count().unwrap(), recount_free(&fs));

        let fs2 = remount(&fs);
        assert_eq!(fs2.list().unwrap(), vec!["final".to_string()]);
        assert_eq!(get(&fs2, "final"), b"made it".to_vec());
        // Blocks have been reused many times by now.
        assert!(fs2.mean_block_age().unwrap() > 0);
    }

    #[test]
    fn random_chunks_round_trip() {
        use rand::Rng;
        let mut rng = rand::rng();
        let fs = fresh();
        let mut expect = Vec::new();
        let h = fs.open_write("r").unwrap();
        for _ in 0..64 {
            let len = rng.random_range(1..1500);
            let mut chunk = vec![0u8; len];
            rng.fill(&mut chunk[..]);
            assert_eq!(fs.write(h, &chunk).unwrap(), len);
            expect.extend_from_slice(&chunk);
        }
        fs.close_write(h).unwrap();
        assert_eq!(get(&fs, "r"), expect);
        let fs2 = remount(&fs);
        assert_eq!(get(&fs2, "r"), expect);
    }
}
