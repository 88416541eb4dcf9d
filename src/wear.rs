// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wear-level table: one [`layout::WearLevelEntry`] per data block.
//!
//! Each entry carries a base erase count plus an 8-bit extension: every
//! erase flips one more bit of `wear_level_bits` from its erased `1` to
//! `0` rather than rewriting `wear_level_cntr`, so seven out of eight
//! erases touch only a single already-programmable byte. The eighth
//! erase of a block forces a full list rebase (new base counters, fresh
//! erased bits), which only happens during [`crate::merge`].

use crate::address::Address;
use crate::cache::Cache;
use crate::checksum::Checksum;
use crate::config::Geometry;
use crate::driver::FlashDriver;
use crate::layout::{WearLevelEntry, WEAR_LEVEL_BITS_ERASED, WEAR_LEVEL_CNTR_MAX};
use crate::result::{Error, Result};

pub(crate) const ENTRY_SIZE: usize = core::mem::size_of::<u16>() + 1 + core::mem::size_of::<u32>();

fn entry_location(geometry: &Geometry, list_base: Address, block: u32) -> Result<(Address, usize)> {
    let entries_per_page = geometry.page_size as usize / ENTRY_SIZE;
    let index = block as usize;
    let page_offset = (index / entries_per_page) as u32;
    let byte_in_page = (index % entries_per_page) * ENTRY_SIZE;
    let page = list_base.advance(geometry, page_offset)?;
    Ok((page, byte_in_page))
}

fn read_entry<CK: Checksum, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    list_base: Address,
    block: u32,
) -> Result<WearLevelEntry> {
    let (page, offset) = entry_location(geometry, list_base, block)?;
    let mut buf = [0u8; ENTRY_SIZE];
    cache.read(driver, page, offset, &mut buf)?;
    let entry = WearLevelEntry {
        wear_level_cntr: u16::from_le_bytes([buf[0], buf[1]]),
        wear_level_bits: buf[2],
        checksum: u32::from_le_bytes([buf[3], buf[4], buf[5], buf[6]]),
    };
    if entry.wear_level_cntr == WEAR_LEVEL_CNTR_MAX && entry.wear_level_bits == WEAR_LEVEL_BITS_ERASED {
        // Never written: base count 0, nothing flipped yet.
        return Ok(WearLevelEntry { wear_level_cntr: 0, wear_level_bits: WEAR_LEVEL_BITS_ERASED, checksum: 0 });
    }
    if CK::compute(&buf[0..3]) != entry.checksum {
        return Err(Error::Checksum);
    }
    Ok(entry)
}

fn write_entry<CK: Checksum, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    list_base: Address,
    block: u32,
    entry: &WearLevelEntry,
) -> Result<()> {
    let (page, offset) = entry_location(geometry, list_base, block)?;
    let mut buf = [0u8; ENTRY_SIZE];
    buf[0..2].copy_from_slice(&entry.wear_level_cntr.to_le_bytes());
    buf[2] = entry.wear_level_bits;
    let checksum = CK::compute(&buf[0..3]);
    buf[3..7].copy_from_slice(&checksum.to_le_bytes());
    cache.write(driver, page, offset, &buf)?;
    cache.flush(driver)
}

/// Effective erase count: base counter plus the number of extension bits
/// already flipped from their erased polarity.
pub fn effective_count(entry: &WearLevelEntry) -> u32 {
    let flipped = 8 - entry.wear_level_bits.count_ones();
    entry.wear_level_cntr as u32 + flipped
}

/// Reads the effective erase count of `block`.
pub fn get<CK: Checksum, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    list_base: Address,
    block: u32,
) -> Result<u32> {
    Ok(effective_count(&read_entry::<CK, PAGE_SIZE>(driver, cache, geometry, list_base, block)?))
}

/// Flips the next available extension bit, incrementing the block's
/// effective erase count by one. Returns [`Error::NoMoreSpace`] once all
/// eight extension bits are used — the caller must then rebase the list
/// (see [`rebase`]) during the next merge.
pub fn increment<CK: Checksum, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    list_base: Address,
    block: u32,
) -> Result<()> {
    let mut entry = read_entry::<CK, PAGE_SIZE>(driver, cache, geometry, list_base, block)?;
    if entry.wear_level_bits == 0 {
        return Err(Error::NoMoreSpace);
    }
    let bit = entry.wear_level_bits.trailing_zeros();
    entry.wear_level_bits &= !(1 << bit);
    write_entry::<CK, PAGE_SIZE>(driver, cache, geometry, list_base, block, &entry)
}

/// Writes a fresh entry for `block` with `cntr` as the new base counter
/// and every extension bit back in the erased polarity. Used when
/// copying the wear-level list to a new management area during merge.
pub fn rebase<CK: Checksum, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    list_base: Address,
    block: u32,
    cntr: u32,
) -> Result<()> {
    let entry = WearLevelEntry {
        wear_level_cntr: cntr.min(u16::MAX as u32) as u16,
        wear_level_bits: 0xFF,
        checksum: 0,
    };
    write_entry::<CK, PAGE_SIZE>(driver, cache, geometry, list_base, block, &entry)
}

/// Fills `out` with the `out.len()` least-worn data blocks (ascending
/// effective erase count) and returns the maximum effective erase count
/// observed across every data block scanned.
pub fn least_worn<CK: Checksum, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    list_base: Address,
    data_blocks: impl Iterator<Item = u32> + Clone,
    out: &mut [u32],
) -> Result<u32> {
    rank_worn::<CK, PAGE_SIZE>(driver, cache, geometry, list_base, data_blocks, out, true)
}

/// Fills `out` with the `out.len()` most-worn data blocks (descending
/// effective erase count) and returns the maximum effective erase count.
pub fn most_worn<CK: Checksum, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    list_base: Address,
    data_blocks: impl Iterator<Item = u32> + Clone,
    out: &mut [u32],
) -> Result<u32> {
    rank_worn::<CK, PAGE_SIZE>(driver, cache, geometry, list_base, data_blocks, out, false)
}

fn rank_worn<CK: Checksum, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    list_base: Address,
    data_blocks: impl Iterator<Item = u32> + Clone,
    out: &mut [u32],
    ascending: bool,
) -> Result<u32> {
    let slots = out.len();
    let mut picked: [(u32, u32); 16] = [(u32::MAX, 0); 16];
    assert!(slots <= picked.len(), "wear-level list caches are small by configuration");
    let mut filled = 0;
    let mut max_cntr = 0;

    for block in data_blocks {
        let cntr = get::<CK, PAGE_SIZE>(driver, cache, geometry, list_base, block)?;
        max_cntr = max_cntr.max(cntr);
        let rank_key = if ascending { cntr } else { u32::MAX - cntr };

        if filled < slots {
            picked[filled] = (rank_key, block);
            filled += 1;
            if filled == slots {
                picked[..filled].sort_unstable_by_key(|&(k, _)| k);
            }
        } else if rank_key < picked[slots - 1].0 {
            picked[slots - 1] = (rank_key, block);
            picked[..slots].sort_unstable_by_key(|&(k, _)| k);
        }
    }

    if filled < slots {
        picked[..filled].sort_unstable_by_key(|&(k, _)| k);
    }
    for (slot, &(_, block)) in out.iter_mut().zip(picked.iter()).take(filled) {
        *slot = block;
    }
    Ok(max_cntr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Additive;
    use crate::test_support::RamFlash;

    fn geo() -> Geometry {
        Geometry { block_count: 8, reserved_blocks: 1, pages_per_block: 4, page_size: 32, management_blocks: 1 }
    }

    #[test]
    fn fresh_entry_counts_zero() {
        let g = geo();
        let mut flash = RamFlash::<32, 4, 8>::new();
        let mut cache = Cache::<32>::new();
        let base = Address::new(1, 0);
        assert_eq!(get::<Additive, 32>(&mut flash, &mut cache, &g, base, 2).unwrap(), 0);
    }

    #[test]
    fn increment_advances_count() {
        let g = geo();
        let mut flash = RamFlash::<32, 4, 8>::new();
        let mut cache = Cache::<32>::new();
        let base = Address::new(1, 0);
        for _ in 0..5 {
            increment::<Additive, 32>(&mut flash, &mut cache, &g, base, 2).unwrap();
        }
        assert_eq!(get::<Additive, 32>(&mut flash, &mut cache, &g, base, 2).unwrap(), 5);
    }

    #[test]
    fn increment_exhausts_after_eight() {
        let g = geo();
        let mut flash = RamFlash::<32, 4, 8>::new();
        let mut cache = Cache::<32>::new();
        let base = Address::new(1, 0);
        for _ in 0..8 {
            increment::<Additive, 32>(&mut flash, &mut cache, &g, base, 2).unwrap();
        }
        assert_eq!(
            increment::<Additive, 32>(&mut flash, &mut cache, &g, base, 2),
            Err(Error::NoMoreSpace)
        );
    }

    #[test]
    fn rebase_resets_extension_bits() {
        let g = geo();
        let mut flash = RamFlash::<32, 4, 8>::new();
        let mut cache = Cache::<32>::new();
        let base = Address::new(1, 0);
        for _ in 0..8 {
            increment::<Additive, 32>(&mut flash, &mut cache, &g, base, 2).unwrap();
        }
        rebase::<Additive, 32>(&mut flash, &mut cache, &g, base, 2, 8).unwrap();
        assert_eq!(get::<Additive, 32>(&mut flash, &mut cache, &g, base, 2).unwrap(), 8);
        increment::<Additive, 32>(&mut flash, &mut cache, &g, base, 2).unwrap();
        assert_eq!(get::<Additive, 32>(&mut flash, &mut cache, &g, base, 2).unwrap(), 9);
    }

    #[test]
    fn least_worn_picks_lowest() {
        let g = geo();
        let mut flash = RamFlash::<32, 4, 8>::new();
        let mut cache = Cache::<32>::new();
        let base = Address::new(1, 0);
        increment::<Additive, 32>(&mut flash, &mut cache, &g, base, 2).unwrap();
        increment::<Additive, 32>(&mut flash, &mut cache, &g, base, 2).unwrap();
        increment::<Additive, 32>(&mut flash, &mut cache, &g, base, 3).unwrap();
        let mut out = [0u32; 1];
        least_worn::<Additive, 32>(&mut flash, &mut cache, &g, base, [2u32, 3, 4].into_iter(), &mut out)
            .unwrap();
        assert_eq!(out[0], 4);
    }
}
