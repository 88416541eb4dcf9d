// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! File map chains.
//!
//! A file's first map page is reachable from its entry. Each map page
//! opens with a [`MapHeader`] linking to the previous and next map page
//! in the chain, followed by a flat array of [`MapEntry`] page-run
//! records. A page fills up entry by entry as a file grows; once full,
//! a new page is allocated and linked in via `next_map_address`.

use crate::address::Address;
use crate::cache::Cache;
use crate::checksum::Checksum;
use crate::config::Geometry;
use crate::driver::FlashDriver;
use crate::layout::{MapEntry, MapHeader, RawAddress, MAP_PAGE_COUNT_ERASED};
use crate::result::{Error, Result};

const HEADER_SIZE: usize = 8 + 4 + 8 + 4;
const ENTRY_SIZE: usize = 8 + 2 + 4;

pub(crate) fn entries_per_page(geometry: &Geometry) -> usize {
    (geometry.page_size as usize - HEADER_SIZE) / ENTRY_SIZE
}

fn is_erased_bytes(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == crate::config::ERASED_BYTE)
}

fn decode_header(buf: &[u8]) -> MapHeader {
    MapHeader {
        prev_map_address: RawAddress {
            block: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            page: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        },
        prev_map_checksum: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        next_map_address: RawAddress {
            block: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
            page: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
        },
        next_map_checksum: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
    }
}

/// Reads the `(prev, next)` links of the map page at `addr`. Either side
/// is `None` at the start/end of the chain. A link whose address bytes
/// are erased is never checksum-checked; a programmed link is.
pub fn read_links<CK: Checksum, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    addr: Address,
) -> Result<(Option<Address>, Option<Address>)> {
    let mut buf = [0u8; HEADER_SIZE];
    cache.read(driver, addr, 0, &mut buf)?;
    let header = decode_header(&buf);

    let prev = if is_erased_bytes(&buf[0..8]) {
        None
    } else {
        if CK::compute(&buf[0..8]) != header.prev_map_checksum {
            return Err(Error::Checksum);
        }
        Some(header.prev_map_address.into())
    };
    let next = if is_erased_bytes(&buf[12..20]) {
        None
    } else {
        if CK::compute(&buf[12..20]) != header.next_map_checksum {
            return Err(Error::Checksum);
        }
        Some(header.next_map_address.into())
    };
    Ok((prev, next))
}

/// Links `addr`'s `next` pointer to `next`, and `next`'s `prev` pointer
/// back to `addr`, each with its own checksum.
pub fn link<CK: Checksum, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    addr: Address,
    next: Address,
) -> Result<()> {
    let mut next_buf = [0u8; 8];
    next_buf[0..4].copy_from_slice(&next.block.to_le_bytes());
    next_buf[4..8].copy_from_slice(&next.page.to_le_bytes());
    cache.write(driver, addr, 12, &next_buf)?;
    let checksum = CK::compute(&next_buf);
    cache.write(driver, addr, 20, &checksum.to_le_bytes())?;

    let mut prev_buf = [0u8; 8];
    prev_buf[0..4].copy_from_slice(&addr.block.to_le_bytes());
    prev_buf[4..8].copy_from_slice(&addr.page.to_le_bytes());
    cache.write(driver, next, 0, &prev_buf)?;
    let checksum = CK::compute(&prev_buf);
    cache.write(driver, next, 8, &checksum.to_le_bytes())?;
    cache.flush(driver)
}

fn entry_offset(index: usize) -> usize {
    HEADER_SIZE + index * ENTRY_SIZE
}

fn decode_entry(buf: &[u8]) -> MapEntry {
    MapEntry {
        address: RawAddress {
            block: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            page: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        },
        page_count: u16::from_le_bytes(buf[8..10].try_into().unwrap()),
        checksum: u32::from_le_bytes(buf[10..14].try_into().unwrap()),
    }
}

fn encode_entry(entry: &MapEntry, buf: &mut [u8]) {
    buf[0..4].copy_from_slice(&entry.address.block.to_le_bytes());
    buf[4..8].copy_from_slice(&entry.address.page.to_le_bytes());
    buf[8..10].copy_from_slice(&entry.page_count.to_le_bytes());
    buf[10..14].copy_from_slice(&entry.checksum.to_le_bytes());
}

/// Reads map entry `index` on the page at `addr`. Returns `None` if the
/// slot has never been written.
pub fn read_entry<CK: Checksum, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    addr: Address,
    index: usize,
) -> Result<Option<MapEntry>> {
    let mut buf = [0u8; ENTRY_SIZE];
    cache.read(driver, addr, entry_offset(index), &mut buf)?;
    if is_erased_bytes(&buf) {
        return Ok(None);
    }
    let entry = decode_entry(&buf);
    if entry.page_count == MAP_PAGE_COUNT_ERASED {
        return Ok(None);
    }
    if CK::compute(&buf[..ENTRY_SIZE - 4]) != entry.checksum {
        return Err(Error::Checksum);
    }
    Ok(Some(entry))
}

fn write_entry<CK: Checksum, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    addr: Address,
    index: usize,
    entry: &MapEntry,
) -> Result<()> {
    let mut buf = [0u8; ENTRY_SIZE];
    let mut entry = *entry;
    let checksum = {
        encode_entry(&entry, &mut buf);
        CK::compute(&buf[..ENTRY_SIZE - 4])
    };
    entry.checksum = checksum;
    encode_entry(&entry, &mut buf);
    cache.write(driver, addr, entry_offset(index), &buf)?;
    cache.flush(driver)
}

/// Initializes a fresh map page at `addr` with both links erased.
pub fn init_page<const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    addr: Address,
) -> Result<()> {
    // Nothing to do: a freshly erased page already reads back as "no
    // links, no entries". This exists so callers have one place to
    // extend if that ever stops being true.
    let _ = (driver, cache, addr);
    Ok(())
}

/// Appends one page-run entry to the map chain starting at
/// `first_page`, allocating and linking a new map page via `alloc` when
/// the last page in the chain is full.
pub fn append<CK: Checksum, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    first_page: Address,
    entry: MapEntry,
    mut alloc: impl FnMut(&mut dyn FlashDriver, &mut Cache<PAGE_SIZE>) -> Result<Address>,
) -> Result<Address> {
    let per_page = entries_per_page(geometry);
    let mut page = first_page;
    loop {
        let mut free_index = None;
        for i in 0..per_page {
            if read_entry::<CK, PAGE_SIZE>(driver, cache, page, i)?.is_none() {
                free_index = Some(i);
                break;
            }
        }
        if let Some(i) = free_index {
            write_entry::<CK, PAGE_SIZE>(driver, cache, page, i, &entry)?;
            return Ok(page);
        }
        let (_, next) = read_links::<CK, PAGE_SIZE>(driver, cache, page)?;
        match next {
            Some(next_page) => page = next_page,
            None => {
                let new_page = alloc(driver, cache)?;
                init_page(driver, cache, new_page)?;
                link::<CK, PAGE_SIZE>(driver, cache, page, new_page)?;
                page = new_page;
            }
        }
    }
}

/// Walks every page-run entry across the whole map chain starting at
/// `first_page`, calling `visit` for each.
pub fn walk<CK: Checksum, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    first_page: Address,
    mut visit: impl FnMut(MapEntry) -> Result<()>,
) -> Result<()> {
    let per_page = entries_per_page(geometry);
    let mut page = first_page;
    loop {
        for i in 0..per_page {
            match read_entry::<CK, PAGE_SIZE>(driver, cache, page, i)? {
                Some(entry) => visit(entry)?,
                None => break,
            }
        }
        let (_, next) = read_links::<CK, PAGE_SIZE>(driver, cache, page)?;
        match next {
            Some(next_page) => page = next_page,
            None => return Ok(()),
        }
    }
}

/// Marks every page in every run of a file's map chain as to-be-released,
/// and every map page in the chain itself too, via `release`, which the
/// caller wires to [`crate::fsbm::mark_pages`].
pub fn release_file_pages<CK: Checksum, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    first_page: Address,
    mut release: impl FnMut(&mut dyn FlashDriver, &mut Cache<PAGE_SIZE>, Address, u32) -> Result<()>,
) -> Result<()> {
    let per_page = entries_per_page(geometry);
    let mut page = first_page;
    loop {
        for i in 0..per_page {
            match read_entry::<CK, PAGE_SIZE>(driver, cache, page, i)? {
                Some(entry) => release(driver, cache, entry.address.into(), entry.page_count as u32)?,
                None => break,
            }
        }
        let (_, next) = read_links::<CK, PAGE_SIZE>(driver, cache, page)?;
        release(driver, cache, page, 1)?;
        match next {
            Some(next_page) => page = next_page,
            None => return Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Additive;
    use crate::test_support::RamFlash;

    fn geo() -> Geometry {
        Geometry { block_count: 8, reserved_blocks: 1, pages_per_block: 4, page_size: 64, management_blocks: 1 }
    }

    fn mk_entry(block: u32, page: u32, page_count: u16) -> MapEntry {
        MapEntry { address: RawAddress { block, page }, page_count, checksum: 0 }
    }

    #[test]
    fn append_then_walk_roundtrips() {
        let g = geo();
        let mut flash = RamFlash::<64, 4, 8>::new();
        let mut cache = Cache::<64>::new();
        let first = Address::new(2, 0);

        append::<Additive, 64>(&mut flash, &mut cache, &g, first, mk_entry(3, 0, 2), |_, _| {
            unreachable!("first page has room")
        })
        .unwrap();

        let mut seen = 0;
        let mut last_page_count = 0;
        walk::<Additive, 64>(&mut flash, &mut cache, &g, first, |e| {
            seen += 1;
            last_page_count = e.page_count;
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, 1);
        assert_eq!(last_page_count, 2);
    }

    #[test]
    fn append_fills_one_page_then_links_next() {
        let g = geo();
        let mut flash = RamFlash::<64, 4, 8>::new();
        let mut cache = Cache::<64>::new();
        let first = Address::new(2, 0);
        let per_page = entries_per_page(&g);

        let mut next_free_page = 1u32;
        for i in 0..per_page + 1 {
            append::<Additive, 64>(
                &mut flash,
                &mut cache,
                &g,
                first,
                mk_entry(3, i as u32, 1),
                |_, _| {
                    next_free_page += 1;
                    Ok(Address::new(2, next_free_page))
                },
            )
            .unwrap();
        }

        let mut seen = 0;
        walk::<Additive, 64>(&mut flash, &mut cache, &g, first, |_entry| {
            seen += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, per_page + 1);
    }

    #[test]
    fn release_file_pages_invokes_callback_per_run() {
        let g = geo();
        let mut flash = RamFlash::<64, 4, 8>::new();
        let mut cache = Cache::<64>::new();
        let first = Address::new(2, 0);
        append::<Additive, 64>(&mut flash, &mut cache, &g, first, mk_entry(3, 0, 2), |_, _| {
            unreachable!()
        })
        .unwrap();
        append::<Additive, 64>(&mut flash, &mut cache, &g, first, mk_entry(3, 2, 1), |_, _| {
            unreachable!()
        })
        .unwrap();

        let mut released = 0u32;
        release_file_pages::<Additive, 64>(&mut flash, &mut cache, &g, first, |_, _, _addr, count| {
            released += count;
            Ok(())
        })
        .unwrap();
        assert_eq!(released, 4);
    }
}
