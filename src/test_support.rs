// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test-only fakes. Exercises the same pattern the teacher uses to test
//! `ufs` against a plain byte slice instead of real hardware: a small,
//! in-memory stand-in for the flash device, with no dependency on the
//! production no-allocation constraint (tests are free to use `std`).

use crate::address::Address;
use crate::config::ERASED_BYTE;
use crate::driver::FlashDriver;
use crate::result::{Error, Result};

/// An in-memory flash device: `BLOCK_COUNT` blocks of `PAGES_PER_BLOCK`
/// pages of `PAGE_SIZE` bytes each, starting fully erased.
pub struct RamFlash<const PAGE_SIZE: usize, const PAGES_PER_BLOCK: usize, const BLOCK_COUNT: usize>
{
    blocks: Box<[[[u8; PAGE_SIZE]; PAGES_PER_BLOCK]; BLOCK_COUNT]>,
    pub erase_counts: [u32; BLOCK_COUNT],
    /// If set, the `n`th flash operation (0-indexed, across read/write/
    /// erase) fails with the given error instead of completing — used to
    /// simulate power loss mid-operation.
    pub fail_after: Option<usize>,
    ops: usize,
}

impl<const PAGE_SIZE: usize, const PAGES_PER_BLOCK: usize, const BLOCK_COUNT: usize>
    RamFlash<PAGE_SIZE, PAGES_PER_BLOCK, BLOCK_COUNT>
{
    pub fn new() -> Self {
        RamFlash {
            blocks: Box::new([[[ERASED_BYTE; PAGE_SIZE]; PAGES_PER_BLOCK]; BLOCK_COUNT]),
            erase_counts: [0; BLOCK_COUNT],
            fail_after: None,
            ops: 0,
        }
    }

    fn tick(&mut self) -> Result<()> {
        self.ops += 1;
        if Some(self.ops) == self.fail_after {
            return Err(Error::FlashWrite);
        }
        Ok(())
    }
}

impl<const PAGE_SIZE: usize, const PAGES_PER_BLOCK: usize, const BLOCK_COUNT: usize> FlashDriver
    for RamFlash<PAGE_SIZE, PAGES_PER_BLOCK, BLOCK_COUNT>
{
    fn read(&mut self, addr: Address, offset: u32, buf: &mut [u8]) -> Result<()> {
        let page = &self.blocks[addr.block as usize][addr.page as usize];
        let offset = offset as usize;
        buf.copy_from_slice(&page[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, addr: Address, offset: u32, buf: &[u8]) -> Result<()> {
        self.tick()?;
        let page = &mut self.blocks[addr.block as usize][addr.page as usize];
        let offset = offset as usize;
        for (dst, &src) in page[offset..offset + buf.len()].iter_mut().zip(buf) {
            if src & !*dst != 0 {
                return Err(Error::NotProgrammable);
            }
            *dst = src;
        }
        Ok(())
    }

    fn erase(&mut self, block: u32) -> Result<()> {
        self.tick()?;
        self.blocks[block as usize] = [[ERASED_BYTE; PAGE_SIZE]; PAGES_PER_BLOCK];
        self.erase_counts[block as usize] += 1;
        Ok(())
    }
}
