// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Free space bitmap (FSBM).
//!
//! Two bits per logical page in the file-system area, packed across a
//! run of logical pages starting at the bitmap's base address. Bit 0 is
//! the free bit (`1` = free, `0` = allocated); bit 1 is the
//! not-to-be-released bit (`1` = keep, `0` = release pending). Only the
//! erased → allocated → released direction is reachable by programming
//! alone: `11` (erased) → `10` (allocated) → `00` (released). `01` never
//! occurs on a healthy device and is treated as corruption.

use crate::address::Address;
use crate::cache::Cache;
use crate::config::Geometry;
use crate::driver::FlashDriver;
use crate::result::{Error, Result};

fn fs_linear_page(geometry: &Geometry, addr: Address) -> u64 {
    (addr.block - geometry.reserved_blocks) as u64 * geometry.pages_per_block as u64
        + addr.page as u64
}

struct BitLocation {
    page: Address,
    byte_in_page: usize,
    bit_in_byte: u32,
}

fn locate(geometry: &Geometry, fsbm_base: Address, addr: Address) -> Result<BitLocation> {
    let bit_pos = fs_linear_page(geometry, addr) * 2;
    let byte_pos = bit_pos / 8;
    let page_size = geometry.page_size as u64;
    let page_offset = (byte_pos / page_size) as u32;
    let byte_in_page = (byte_pos % page_size) as usize;
    let bit_in_byte = (bit_pos % 8) as u32;
    let page = fsbm_base.advance(geometry, page_offset)?;
    Ok(BitLocation { page, byte_in_page, bit_in_byte })
}

fn read_byte<const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    loc: &BitLocation,
) -> Result<u8> {
    let mut b = [0u8; 1];
    cache.read(driver, loc.page, loc.byte_in_page, &mut b)?;
    Ok(b[0])
}

/// True if the page at `addr` is marked free.
pub fn is_free<const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    fsbm_base: Address,
    addr: Address,
) -> Result<bool> {
    let loc = locate(geometry, fsbm_base, addr)?;
    let byte = read_byte(driver, cache, &loc)?;
    Ok(byte & (1 << loc.bit_in_byte) != 0)
}

/// True if the page at `addr` is marked to be released by the next merge.
pub fn is_to_be_released<const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    fsbm_base: Address,
    addr: Address,
) -> Result<bool> {
    let loc = locate(geometry, fsbm_base, addr)?;
    let byte = read_byte(driver, cache, &loc)?;
    Ok(byte & (1 << (loc.bit_in_byte + 1)) == 0)
}

/// Marks `page_count` consecutive pages starting at `addr` used,
/// released, or both. Marking a page already in the target state is an
/// internal-allocation error — it means a caller double-booked a page.
pub fn mark_pages<const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    fsbm_base: Address,
    mut addr: Address,
    page_count: u32,
    mark_used: bool,
    mark_released: bool,
) -> Result<()> {
    for _ in 0..page_count {
        let loc = locate(geometry, fsbm_base, addr)?;
        let mut byte = read_byte(driver, cache, &loc)?;
        let free_bit = 1u8 << loc.bit_in_byte;
        let keep_bit = 1u8 << (loc.bit_in_byte + 1);

        if mark_used {
            if byte & free_bit == 0 {
                return Err(Error::InternalAllocation);
            }
            byte &= !free_bit;
        }
        if mark_released {
            if byte & free_bit != 0 || byte & keep_bit == 0 {
                return Err(Error::InternalAllocation);
            }
            byte &= !keep_bit;
        }

        cache.write(driver, loc.page, loc.byte_in_page, &[byte])?;
        addr = addr.next(geometry)?;
    }
    cache.flush(driver)
}

/// A contiguous run of free pages found by [`find_free_run`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FreeRun {
    pub addr: Address,
    pub page_count: u32,
}

/// Scans pages in `block` from page 0 looking for a run of at least
/// `min_pages` free pages, preferring the longest run up to
/// `desired_pages`.
pub fn find_free_run_in_block<const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    fsbm_base: Address,
    block: u32,
    min_pages: u32,
    desired_pages: u32,
) -> Result<Option<FreeRun>> {
    let mut best: Option<FreeRun> = None;
    let mut run_start: Option<Address> = None;
    let mut run_len: u32 = 0;

    for page in 0..geometry.pages_per_block {
        let addr = Address::new(block, page);
        let free = is_free(driver, cache, geometry, fsbm_base, addr)?;
        if free {
            if run_start.is_none() {
                run_start = Some(addr);
            }
            run_len += 1;
            if run_len >= desired_pages {
                return Ok(Some(FreeRun { addr: run_start.unwrap(), page_count: run_len }));
            }
        } else {
            if run_len >= min_pages {
                let candidate = FreeRun { addr: run_start.unwrap(), page_count: run_len };
                if best.map(|b| b.page_count < candidate.page_count).unwrap_or(true) {
                    best = Some(candidate);
                }
            }
            run_start = None;
            run_len = 0;
        }
    }
    if run_len >= min_pages {
        let candidate = FreeRun { addr: run_start.unwrap(), page_count: run_len };
        if best.map(|b| b.page_count < candidate.page_count).unwrap_or(true) {
            best = Some(candidate);
        }
    }
    Ok(best)
}

/// Scans `blocks` in order, returning the first run satisfying
/// `min_pages` in any one of them. Callers pick the block order (e.g.
/// least-worn-first for dynamic wear leveling); this function never
/// crosses a block boundary within one run.
pub fn find_free_run<const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    fsbm_base: Address,
    blocks: impl Iterator<Item = u32>,
    min_pages: u32,
    desired_pages: u32,
) -> Result<FreeRun> {
    for block in blocks {
        if let Some(run) =
            find_free_run_in_block(driver, cache, geometry, fsbm_base, block, min_pages, desired_pages)?
        {
            return Ok(run);
        }
    }
    Err(Error::NoMoreSpace)
}

/// Counts free and to-be-released pages across `blocks`.
pub fn count_pages<const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    fsbm_base: Address,
    blocks: impl Iterator<Item = u32> + Clone,
) -> Result<(u32, u32)> {
    let mut free = 0;
    let mut released = 0;
    for block in blocks {
        for page in 0..geometry.pages_per_block {
            let addr = Address::new(block, page);
            if is_free(driver, cache, geometry, fsbm_base, addr)? {
                free += 1;
            } else if is_to_be_released(driver, cache, geometry, fsbm_base, addr)? {
                released += 1;
            }
        }
    }
    Ok((free, released))
}
