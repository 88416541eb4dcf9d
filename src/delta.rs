// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Delta map: page-level redirection for in-place overwrites.
//!
//! NOR flash can only clear bits, never set them, so overwriting a page
//! with bytes that aren't programmable over what's already there can't
//! happen in place. Instead the new bytes land on a fresh page and a
//! [`layout::DeltaEntry`] records the redirection; every reader resolves
//! through [`resolve`] first. The map itself is a flat array of entries
//! spanning a fixed run of pages fixed at format time — unlike the
//! original's single in-memory scratch buffer, lookups here go straight
//! to the one-page [`Cache`], which is cheap enough at the scale this
//! crate targets and keeps one fewer piece of mutable state to get wrong.

use crate::address::Address;
use crate::cache::{is_programmable, Cache};
use crate::checksum::Checksum;
use crate::config::Geometry;
use crate::driver::FlashDriver;
use crate::layout::{DeltaEntry, RawAddress};
use crate::result::{Error, Result};

const ENTRY_SIZE: usize = 8 + 8 + 4;

fn entries_per_page(geometry: &Geometry) -> usize {
    geometry.page_size as usize / ENTRY_SIZE
}

fn is_erased_bytes(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == crate::config::ERASED_BYTE)
}

fn slot_location(geometry: &Geometry, base: Address, index: usize) -> Result<(Address, usize)> {
    let per_page = entries_per_page(geometry);
    let page_offset = (index / per_page) as u32;
    let byte_in_page = (index % per_page) * ENTRY_SIZE;
    let page = base.advance(geometry, page_offset)?;
    Ok((page, byte_in_page))
}

fn decode(buf: &[u8]) -> DeltaEntry {
    DeltaEntry {
        delta_address: RawAddress {
            block: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            page: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        },
        orig_address: RawAddress {
            block: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            page: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        },
        checksum: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
    }
}

fn encode(entry: &DeltaEntry, buf: &mut [u8]) {
    buf[0..4].copy_from_slice(&entry.delta_address.block.to_le_bytes());
    buf[4..8].copy_from_slice(&entry.delta_address.page.to_le_bytes());
    buf[8..12].copy_from_slice(&entry.orig_address.block.to_le_bytes());
    buf[12..16].copy_from_slice(&entry.orig_address.page.to_le_bytes());
    buf[16..20].copy_from_slice(&entry.checksum.to_le_bytes());
}

fn read_slot<CK: Checksum, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    base: Address,
    index: usize,
) -> Result<Option<DeltaEntry>> {
    let (page, offset) = slot_location(geometry, base, index)?;
    let mut buf = [0u8; ENTRY_SIZE];
    cache.read(driver, page, offset, &mut buf)?;
    if is_erased_bytes(&buf) {
        return Ok(None);
    }
    let entry = decode(&buf);
    if CK::compute(&buf[..ENTRY_SIZE - 4]) != entry.checksum {
        return Err(Error::Checksum);
    }
    Ok(Some(entry))
}

/// Resolves `addr` through the delta map: returns the page actually
/// holding current data for `addr`, which is `addr` itself if no delta
/// entry redirects it. Also reports whether the map has any free slot
/// left (all `delta_pages` scanned, as the original does, since a later
/// delta page can hold a more recent redirection than an earlier one).
pub fn resolve<CK: Checksum, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    base: Address,
    delta_pages: usize,
    addr: Address,
) -> Result<(Address, bool)> {
    let slots = delta_pages * entries_per_page(geometry);
    let mut resolved = addr;
    let mut has_room = false;
    for index in 0..slots {
        match read_slot::<CK, PAGE_SIZE>(driver, cache, geometry, base, index)? {
            None => has_room = true,
            Some(entry) => {
                let orig: Address = entry.orig_address.into();
                if orig == addr {
                    resolved = entry.delta_address.into();
                }
            }
        }
    }
    Ok((resolved, has_room))
}

/// Appends a new redirection. Fails with [`Error::NoMoreSpace`] if every
/// slot across `delta_pages` is occupied.
pub fn append<CK: Checksum, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    base: Address,
    delta_pages: usize,
    orig: Address,
    delta: Address,
) -> Result<()> {
    let slots = delta_pages * entries_per_page(geometry);
    for index in 0..slots {
        if read_slot::<CK, PAGE_SIZE>(driver, cache, geometry, base, index)?.is_none() {
            let (page, offset) = slot_location(geometry, base, index)?;
            let entry = DeltaEntry { delta_address: delta.into(), orig_address: orig.into(), checksum: 0 };
            let mut buf = [0u8; ENTRY_SIZE];
            encode(&entry, &mut buf);
            let checksum = CK::compute(&buf[..ENTRY_SIZE - 4]);
            buf[ENTRY_SIZE - 4..].copy_from_slice(&checksum.to_le_bytes());
            cache.write(driver, page, offset, &buf)?;
            return cache.flush(driver);
        }
    }
    Err(Error::NoMoreSpace)
}

/// Outcome of [`write`]: whether the write landed on a freshly allocated
/// delta page or went straight to the resolved page in place.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteOutcome {
    InPlace,
    Delta { new_page: Address, old_page: Address },
}

/// Writes `data` at `offset` within the logical page `addr` names,
/// transparently redirecting through a fresh page when the bytes aren't
/// programmable over what's there.
///
/// `alloc` must return a fresh, as-yet-unmarked data page; `merge_if_full`
/// is invoked once, before allocating, if the delta map has no free slot
/// left (mirroring the original's "management blocks shall be merged"
/// path) — callers wire it to [`crate::merge`].
pub fn write<CK: Checksum, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    base: Address,
    delta_pages: usize,
    addr: Address,
    offset: usize,
    data: &[u8],
    mut alloc: impl FnMut(&mut dyn FlashDriver, &mut Cache<PAGE_SIZE>) -> Result<Address>,
    mut merge_if_full: impl FnMut(&mut dyn FlashDriver, &mut Cache<PAGE_SIZE>) -> Result<()>,
) -> Result<WriteOutcome> {
    let (resolved, has_room) = resolve::<CK, PAGE_SIZE>(driver, cache, geometry, base, delta_pages, addr)?;

    let mut existing = [0u8; PAGE_SIZE];
    cache.read(driver, resolved, 0, &mut existing)?;

    if is_programmable(&existing[offset..offset + data.len()], data) {
        cache.write(driver, resolved, offset, data)?;
        cache.flush(driver)?;
        return Ok(WriteOutcome::InPlace);
    }

    if !has_room {
        merge_if_full(driver, cache)?;
    }
    let new_page = alloc(driver, cache)?;
    let mut new_contents = existing;
    new_contents[offset..offset + data.len()].copy_from_slice(data);
    cache.write(driver, new_page, 0, &new_contents)?;
    cache.flush(driver)?;
    append::<CK, PAGE_SIZE>(driver, cache, geometry, base, delta_pages, addr, new_page)?;
    Ok(WriteOutcome::Delta { new_page, old_page: resolved })
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
    fn resolve_without_delta_returns_original() {
        let g = geo();
        let mut flash = RamFlash::<32, 4, 8>::new();
        let mut cache = Cache::<32>::new();
        let base = Address::new(1, 0);
        let addr = Address::new(2, 0);
        let (resolved, has_room) =
            resolve::<Additive, 32>(&mut flash, &mut cache, &g, base, 1, addr).unwrap();
        assert_eq!(resolved, addr);
        assert!(has_room);
    }

    #[test]
    fn append_then_resolve_redirects() {
        let g = geo();
        let mut flash = RamFlash::<32, 4, 8>::new();
        let mut cache = Cache::<32>::new();
        let base = Address::new(1, 0);
        let orig = Address::new(2, 0);
        let delta = Address::new(2, 1);
        append::<Additive, 32>(&mut flash, &mut cache, &g, base, 1, orig, delta).unwrap();
        let (resolved, _) = resolve::<Additive, 32>(&mut flash, &mut cache, &g, base, 1, orig).unwrap();
        assert_eq!(resolved, delta);
    }

    #[test]
    fn full_map_rejects_append() {
        let g = geo();
        let mut flash = RamFlash::<32, 4, 8>::new();
        let mut cache = Cache::<32>::new();
        let base = Address::new(1, 0);
        let per_page = entries_per_page(&g);
        for i in 0..per_page {
            append::<Additive, 32>(&mut flash, &mut cache, &g, base, 1, Address::new(2, i as u32), Address::new(3, 0))
                .unwrap();
        }
        assert_eq!(
            append::<Additive, 32>(&mut flash, &mut cache, &g, base, 1, Address::new(2, 99), Address::new(3, 0)),
            Err(Error::NoMoreSpace)
        );
    }

    #[test]
    fn write_goes_in_place_when_programmable() {
        let g = geo();
        let mut flash = RamFlash::<32, 4, 8>::new();
        let mut cache = Cache::<32>::new();
        let base = Address::new(1, 0);
        let addr = Address::new(2, 0);
        let outcome = write::<Additive, 32>(
            &mut flash,
            &mut cache,
            &g,
            base,
            1,
            addr,
            0,
            &[0x00, 0x00],
            |_, _| unreachable!("no delta expected"),
            |_, _| unreachable!("map isn't full"),
        )
        .unwrap();
        assert_eq!(outcome, WriteOutcome::InPlace);
    }

    #[test]
    fn write_redirects_when_not_programmable() {
        let g = geo();
        let mut flash = RamFlash::<32, 4, 8>::new();
        let mut cache = Cache::<32>::new();
        let base = Address::new(1, 0);
        let addr = Address::new(2, 0);
        cache.write(&mut flash, addr, 0, &[0x0F, 0x0F]).unwrap();
        cache.flush(&mut flash).unwrap();

        let outcome = write::<Additive, 32>(
            &mut flash,
            &mut cache,
            &g,
            base,
            1,
            addr,
            0,
            &[0xF0, 0xF0],
            |_, _| Ok(Address::new(2, 1)),
            |_, _| unreachable!("map isn't full"),
        )
        .unwrap();
        assert_eq!(outcome, WriteOutcome::Delta { new_page: Address::new(2, 1), old_page: addr });

        let (resolved, _) = resolve::<Additive, 32>(&mut flash, &mut cache, &g, base, 1, addr).unwrap();
        assert_eq!(resolved, Address::new(2, 1));
    }
}
