// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! FLogFS, a log-structured file system for raw NAND flash.
//!
//! Raw NAND is a hostile place for a file system: programming
//! happens a page at a time and can only clear bits, erasing
//! happens a block at a time, each block survives a bounded
//! number of erase cycles, and the only metadata annex is a
//! handful of spare bytes per page.  FLogFS embraces those
//! constraints instead of hiding them.  Storage is append-only:
//! a file is a singly-linked chain of blocks, a directory is a
//! chain of inode blocks holding allocation and invalidation
//! record pairs, and nothing is ever rewritten in place.
//! Deleting or superseding data means programming a record that
//! declares the old data dead; reclaiming it means erasing the
//! block and reusing it, youngest first, so wear spreads over
//! the whole device.
//!
//! Crash safety follows from write ordering alone.  Records are
//! programmed in an order that makes every intermediate state
//! recognizable, and the mount scan rolls any interrupted
//! operation forward or discards it.  RAM usage is bounded: one
//! sector buffer per open write, a small fixed free-block
//! cache, and a handful of counters.
//!
//! The flash device itself sits behind the [`NandFlash`] trait;
//! [`RamNand`] provides a RAM-backed stand-in for hosted use
//! and tests.

#![cfg_attr(not(any(test, clippy)), no_std)]
#![forbid(unsafe_op_in_unsafe_fn)]

extern crate alloc;

mod allocator;
mod cache;
mod flash;
mod fs;
mod inode;
mod ramnand;
mod reader;
mod records;
mod result;
mod writer;

pub use flash::{
    NandFlash, MAX_FNAME_LEN, NUM_BLOCKS, PAGES_PER_BLOCK, PREALLOCATE_SIZE,
    SECTORS_PER_BLOCK, SECTORS_PER_PAGE, SECTOR_SIZE, SECTOR_SPARE_SIZE,
};
pub use fs::{Flogfs, Ls, ReadHandle, WriteHandle};
pub use ramnand::RamNand;
pub use result::{Error, Result};
