// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Single-page read cache over the flash driver.
//!
//! Opening a NAND page is the expensive step of every access,
//! and the file system's scan loops tend to touch the same page
//! many times in a row.  [`Dev`] remembers the last page it
//! opened and the result of that open, and elides the driver
//! call when a matching open is requested again.  Everything
//! else passes straight through to the driver.

use crate::flash::{NandFlash, SECTORS_PER_PAGE};
use crate::result::Result;
use bytemuck::{Pod, Zeroable};

pub(crate) struct Dev<F> {
    flash: F,
    page_open: bool,
    current_block: u16,
    current_page: u16,
    open_result: Result<()>,
}

impl<F: NandFlash> Dev<F> {
    pub(crate) fn new(flash: F) -> Dev<F> {
        Dev {
            flash,
            page_open: false,
            current_block: 0,
            current_page: 0,
            open_result: Ok(()),
        }
    }

    pub(crate) fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Opens a page only if it is not the page already open.
    /// A repeated open replays the recorded outcome.
    pub(crate) fn open_page(&mut self, block: u16, page: u16) -> Result<()> {
        if self.page_open
            && self.current_block == block
            && self.current_page == page
        {
            return self.open_result;
        }
        self.open_result = self.flash.open_page(block, page);
        self.page_open = true;
        self.current_block = block;
        self.current_page = page;
        self.open_result
    }

    /// Opens the page containing the given sector.
    pub(crate) fn open_sector(&mut self, block: u16, sector: u16) -> Result<()> {
        self.open_page(block, sector / SECTORS_PER_PAGE as u16)
    }

    pub(crate) fn close_sector(&mut self) {
        self.page_open = false;
    }

    pub(crate) fn read_sector(
        &mut self,
        dst: &mut [u8],
        sector: u16,
        offset: usize,
    ) -> Result<()> {
        self.flash.read_sector(dst, sector, offset)
    }

    pub(crate) fn write_sector(
        &mut self,
        src: &[u8],
        sector: u16,
        offset: usize,
    ) -> Result<()> {
        self.flash.write_sector(src, sector, offset)
    }

    /// Reads one on-flash record from the open page.
    pub(crate) fn read_obj<T: Pod>(
        &mut self,
        sector: u16,
        offset: usize,
    ) -> Result<T> {
        let mut val = T::zeroed();
        self.flash
            .read_sector(bytemuck::bytes_of_mut(&mut val), sector, offset)?;
        Ok(val)
    }

    /// Stages one on-flash record into the open page.
    pub(crate) fn write_obj<T: Pod>(
        &mut self,
        val: &T,
        sector: u16,
        offset: usize,
    ) -> Result<()> {
        self.flash.write_sector(bytemuck::bytes_of(val), sector, offset)
    }

    /// Reads one spare-area record for the given sector.
    pub(crate) fn read_spare_obj<T: Pod>(&mut self, sector: u16) -> Result<T> {
        let mut val = T::zeroed();
        self.flash
            .read_spare(bytemuck::bytes_of_mut(&mut val), sector)?;
        Ok(val)
    }

    /// Stages one spare-area record for the given sector.
    pub(crate) fn write_spare_obj<T: Pod>(
        &mut self,
        val: &T,
        sector: u16,
    ) -> Result<()> {
        self.flash.write_spare(bytemuck::bytes_of(val), sector)
    }

    pub(crate) fn commit(&mut self) -> Result<()> {
        self.flash.commit()
    }

    /// Erases a block.  The cached page is dropped so a stale
    /// pre-erase open cannot satisfy a post-erase access.
    pub(crate) fn erase_block(&mut self, block: u16) -> Result<()> {
        self.page_open = false;
        self.flash.erase_block(block)
    }

    pub(crate) fn block_is_bad(&mut self) -> Result<bool> {
        self.flash.block_is_bad()
    }

    pub(crate) fn flash_lock(&mut self) {
        self.flash.lock();
    }

    pub(crate) fn flash_unlock(&mut self) {
        self.flash.unlock();
    }

    pub(crate) fn debug_warn(&mut self, msg: &str) {
        self.flash.debug_warn(msg);
    }

    pub(crate) fn debug_error(&mut self, msg: &str) {
        self.flash.debug_error(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::Error;

    /// A flash stub that counts page opens and fails on
    /// request.
    struct CountingFlash {
        opens: usize,
        fail_next: bool,
    }

    impl NandFlash for CountingFlash {
        fn init(&mut self) -> Result<()> {
            Ok(())
        }

        fn open_page(&mut self, _block: u16, _page: u16) -> Result<()> {
            self.opens += 1;
            if self.fail_next { Err(Error::Io) } else { Ok(()) }
        }

        fn read_sector(
            &mut self,
            _dst: &mut [u8],
            _sector: u16,
            _offset: usize,
        ) -> Result<()> {
            Ok(())
        }

        fn read_spare(&mut self, _dst: &mut [u8], _sector: u16) -> Result<()> {
            Ok(())
        }

        fn write_sector(
            &mut self,
            _src: &[u8],
            _sector: u16,
            _offset: usize,
        ) -> Result<()> {
            Ok(())
        }

        fn write_spare(&mut self, _src: &[u8], _sector: u16) -> Result<()> {
            Ok(())
        }

        fn commit(&mut self) -> Result<()> {
            Ok(())
        }

        fn erase_block(&mut self, _block: u16) -> Result<()> {
            Ok(())
        }

        fn block_is_bad(&mut self) -> Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn repeated_open_is_elided() {
        let mut dev = Dev::new(CountingFlash { opens: 0, fail_next: false });
        dev.open_page(3, 7).unwrap();
        dev.open_page(3, 7).unwrap();
        dev.open_sector(3, 7 * SECTORS_PER_PAGE as u16).unwrap();
        assert_eq!(dev.flash_mut().opens, 1);
        dev.open_page(3, 8).unwrap();
        assert_eq!(dev.flash_mut().opens, 2);
    }

    #[test]
    fn close_forces_reopen() {
        let mut dev = Dev::new(CountingFlash { opens: 0, fail_next: false });
        dev.open_page(0, 0).unwrap();
        dev.close_sector();
        dev.open_page(0, 0).unwrap();
        assert_eq!(dev.flash_mut().opens, 2);
    }

    #[test]
    fn failed_open_result_is_replayed() {
        let mut dev = Dev::new(CountingFlash { opens: 0, fail_next: true });
        assert_eq!(dev.open_page(1, 1), Err(Error::Io));
        dev.flash_mut().fail_next = false;
        // Still the cached failure until the page changes.
        assert_eq!(dev.open_page(1, 1), Err(Error::Io));
        assert_eq!(dev.flash_mut().opens, 1);
        assert_eq!(dev.open_page(1, 2), Ok(()));
    }

    #[test]
    fn erase_drops_the_cached_page() {
        let mut dev = Dev::new(CountingFlash { opens: 0, fail_next: false });
        dev.open_page(2, 0).unwrap();
        dev.erase_block(2).unwrap();
        dev.open_page(2, 0).unwrap();
        assert_eq!(dev.flash_mut().opens, 2);
    }
}
