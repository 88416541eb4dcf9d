// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One-page write-back flash cache.
//!
//! Holds exactly one logical page. A read for an address matching the
//! cached line is served from memory; any other address first flushes a
//! dirty line, then loads the target page. A write loads the target page
//! first if it isn't already cached (so partial writes see surrounding
//! bytes), checks that the new bytes are programmable over the old ones,
//! and marks the line dirty without flushing.

use crate::address::Address;
use crate::config::ERASED_BYTE;
use crate::driver::FlashDriver;
use crate::result::{Error, Result};

/// Returns `true` iff writing `new` over `old` only transitions bits from
/// the erased polarity (`1`) to the programmed polarity (`0`) — i.e.
/// `new & !old == 0` bytewise, given `ERASED_BYTE == 0xFF`.
pub fn is_programmable(old: &[u8], new: &[u8]) -> bool {
    old.len() == new.len() && old.iter().zip(new).all(|(&o, &n)| n & !o == 0)
}

/// True iff every byte in `buf` is in the erased polarity.
pub fn is_erased(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == ERASED_BYTE)
}

/// A single logical-page write-back cache line, sized by the caller's
/// page-size constant.
pub struct Cache<const PAGE_SIZE: usize> {
    addr: Option<Address>,
    buf: [u8; PAGE_SIZE],
    dirty: bool,
}

impl<const PAGE_SIZE: usize> Default for Cache<PAGE_SIZE> {
    fn default() -> Self {
        Cache { addr: None, buf: [ERASED_BYTE; PAGE_SIZE], dirty: false }
    }
}

impl<const PAGE_SIZE: usize> Cache<PAGE_SIZE> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes back the cached line if dirty.
    pub fn flush(&mut self, driver: &mut (impl FlashDriver + ?Sized)) -> Result<()> {
        if self.dirty {
            let addr = self.addr.expect("dirty cache line always has an address");
            driver.write(addr, 0, &self.buf).map_err(|_| Error::FlashWrite)?;
            self.dirty = false;
        }
        Ok(())
    }

    fn load(&mut self, driver: &mut (impl FlashDriver + ?Sized), addr: Address) -> Result<()> {
        if self.addr != Some(addr) {
            self.flush(driver)?;
            driver.read(addr, 0, &mut self.buf).map_err(|_| Error::FlashRead)?;
            self.addr = Some(addr);
        }
        Ok(())
    }

    /// Reads `size` bytes at `offset` within the logical page at `addr`.
    pub fn read(
        &mut self,
        driver: &mut (impl FlashDriver + ?Sized),
        addr: Address,
        offset: usize,
        out: &mut [u8],
    ) -> Result<()> {
        self.load(driver, addr)?;
        let size = out.len();
        out.copy_from_slice(&self.buf[offset..offset + size]);
        Ok(())
    }

    /// Writes `data` at `offset` within the logical page at `addr`. Fails
    /// with [`Error::NotProgrammable`] if the page is already cached with
    /// conflicting bits that cannot be programmed to the requested value;
    /// callers that expect this (overwrites) must route through the delta
    /// map instead.
    pub fn write(
        &mut self,
        driver: &mut (impl FlashDriver + ?Sized),
        addr: Address,
        offset: usize,
        data: &[u8],
    ) -> Result<()> {
        self.load(driver, addr)?;
        let size = data.len();
        if !is_programmable(&self.buf[offset..offset + size], data) {
            return Err(Error::NotProgrammable);
        }
        self.buf[offset..offset + size].copy_from_slice(data);
        self.dirty = true;
        Ok(())
    }

    /// Discards the cached line without writing it back. Used after a
    /// block erase invalidates any cached page within that block.
    pub fn invalidate(&mut self, block: u32) {
        if let Some(addr) = self.addr {
            if addr.block == block {
                self.addr = None;
                self.dirty = false;
            }
        }
    }
}
