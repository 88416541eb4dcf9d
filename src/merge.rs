// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Merge: rebuilds the management area into a fresh block pair, reclaiming
//! released pages and tombstoned entries.
//!
//! Quiescing and reopening the caller's open files (the first and last of
//! the ordered phases below) is the file-handle table's job, not this
//! module's — everything here operates purely in terms of addresses and
//! entry lists, so [`crate::fs`] wraps `run` with that bookkeeping. The
//! remaining phases all happen here, in order: erase the new management
//! blocks, copy the wear-level table (resetting each entry's extension
//! bits), copy the free-space bitmap (reclaiming any data block that is
//! now entirely released), copy the entry list recursively (recreating
//! every file's map with its data-page runs coalesced into freshly
//! allocated contiguous runs), regenerate the least/most-worn caches, and
//! finally erase the old management blocks once the new header is the
//! only one with a valid checksum and the higher generation counter.

use crate::address::Address;
use crate::cache::Cache;
use crate::checksum::Checksum;
use crate::config::Geometry;
use crate::dir;
use crate::driver::FlashDriver;
use crate::entry;
use crate::fsbm;
use crate::layout::{Attrib, Entry, Header, MapEntry, RawAddress, MAGIC, MAJOR_VERSION, MINOR_VERSION};
use crate::map;
use crate::result::{Error, Result};
use crate::wear;

pub(crate) const HEADER_SIZE: usize = 4 + 1 + 1 + 2 + 4 + 4 + 8 + 8 + 8 + 8 + 4 + 4;

fn decode_header(buf: &[u8]) -> Header {
    Header {
        magic: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
        major_version: buf[4],
        minor_version: buf[5],
        _pad: [buf[6], buf[7]],
        counter: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        next_management_block: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        free_space_bitmap_address: RawAddress {
            block: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            page: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
        },
        root_entry_list_address: RawAddress {
            block: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
            page: u32::from_le_bytes(buf[28..32].try_into().unwrap()),
        },
        delta_map_address: RawAddress {
            block: u32::from_le_bytes(buf[32..36].try_into().unwrap()),
            page: u32::from_le_bytes(buf[36..40].try_into().unwrap()),
        },
        wear_level_list_address: RawAddress {
            block: u32::from_le_bytes(buf[40..44].try_into().unwrap()),
            page: u32::from_le_bytes(buf[44..48].try_into().unwrap()),
        },
        wear_level_cntr_max: u32::from_le_bytes(buf[48..52].try_into().unwrap()),
        checksum: u32::from_le_bytes(buf[52..56].try_into().unwrap()),
    }
}

fn encode_header(header: &Header, buf: &mut [u8]) {
    buf[0..4].copy_from_slice(&header.magic.to_le_bytes());
    buf[4] = header.major_version;
    buf[5] = header.minor_version;
    buf[6..8].copy_from_slice(&header._pad);
    buf[8..12].copy_from_slice(&header.counter.to_le_bytes());
    buf[12..16].copy_from_slice(&header.next_management_block.to_le_bytes());
    buf[16..20].copy_from_slice(&header.free_space_bitmap_address.block.to_le_bytes());
    buf[20..24].copy_from_slice(&header.free_space_bitmap_address.page.to_le_bytes());
    buf[24..28].copy_from_slice(&header.root_entry_list_address.block.to_le_bytes());
    buf[28..32].copy_from_slice(&header.root_entry_list_address.page.to_le_bytes());
    buf[32..36].copy_from_slice(&header.delta_map_address.block.to_le_bytes());
    buf[36..40].copy_from_slice(&header.delta_map_address.page.to_le_bytes());
    buf[40..44].copy_from_slice(&header.wear_level_list_address.block.to_le_bytes());
    buf[44..48].copy_from_slice(&header.wear_level_list_address.page.to_le_bytes());
    buf[48..52].copy_from_slice(&header.wear_level_cntr_max.to_le_bytes());
    buf[52..56].copy_from_slice(&header.checksum.to_le_bytes());
}

/// Reads and validates the header at `addr`. `Error::NotInitialized` means
/// the page is still erased; `Error::Checksum` means it was written but is
/// corrupt.
pub fn read_header<CK: Checksum, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    addr: Address,
) -> Result<Header> {
    let mut buf = [0u8; HEADER_SIZE];
    cache.read(driver, addr, 0, &mut buf)?;
    if crate::cache::is_erased(&buf) {
        return Err(Error::NotInitialized);
    }
    let header = decode_header(&buf);
    if CK::compute(&buf[..HEADER_SIZE - 4]) != header.checksum {
        return Err(Error::Checksum);
    }
    if header.magic != MAGIC {
        return Err(Error::Checksum);
    }
    Ok(header)
}

/// Writes `header` to `addr`, computing its checksum.
pub fn write_header<CK: Checksum, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    addr: Address,
    header: &Header,
) -> Result<()> {
    let mut header = *header;
    let mut buf = [0u8; HEADER_SIZE];
    encode_header(&header, &mut buf);
    header.checksum = CK::compute(&buf[..HEADER_SIZE - 4]);
    encode_header(&header, &mut buf);
    cache.write(driver, addr, 0, &buf)?;
    cache.flush(driver)
}

/// Picks the authoritative header among `candidates`: the one with a
/// valid checksum and the highest generation counter. A partial merge
/// that crashed before finalizing its header leaves the old generation
/// still the only valid one, so it is recovered automatically.
pub fn find_authoritative<CK: Checksum, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    candidates: &[Address],
) -> Result<(Address, Header)> {
    let mut best: Option<(Address, Header)> = None;
    for &addr in candidates {
        if let Ok(header) = read_header::<CK, PAGE_SIZE>(driver, cache, addr) {
            let better = match &best {
                Some((_, current)) => header.counter > current.counter,
                None => true,
            };
            if better {
                best = Some((addr, header));
            }
        }
    }
    best.ok_or(Error::NotInitialized)
}

/// The block/page addresses making up one generation's management area.
#[derive(Clone, Copy, Debug)]
pub struct Regions {
    pub header: Address,
    pub entry_list: Address,
    pub fsbm: Address,
    pub delta_map: Address,
    pub wear_level_list: Address,
}

fn region_blocks(r: &Regions) -> [u32; 5] {
    [r.header.block, r.entry_list.block, r.fsbm.block, r.delta_map.block, r.wear_level_list.block]
}

fn erase_regions<const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    regions: &Regions,
) -> Result<()> {
    let blocks = region_blocks(regions);
    for (i, &block) in blocks.iter().enumerate() {
        if blocks[..i].contains(&block) {
            continue;
        }
        driver.erase(block)?;
        cache.invalidate(block);
    }
    Ok(())
}

fn is_dot_name<const NAME_LEN: usize>(name: &[u8; NAME_LEN]) -> bool {
    let end = name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    &name[..end] == b"." || &name[..end] == b".."
}

/// Copies one file's data and map, resolving every page through the old
/// delta map, coalescing each contiguous on-flash run into as few
/// destination runs as the new free-space bitmap allows, and returns the
/// new first map page address.
fn copy_file<CK: Checksum, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    old_first_map: Address,
    old_delta_base: Address,
    old_delta_pages: usize,
    new_fsbm: Address,
    data_blocks: impl Iterator<Item = u32> + Clone,
    alloc_page: &mut impl FnMut(&mut dyn FlashDriver, &mut Cache<PAGE_SIZE>) -> Result<Address>,
) -> Result<Address> {
    let per_page = map::entries_per_page(geometry);
    let mut page = old_first_map;
    let mut new_first_map: Option<Address> = None;

    loop {
        for i in 0..per_page {
            let Some(old_entry) = map::read_entry::<CK, PAGE_SIZE>(driver, cache, page, i)? else { break };
            let mut src: Address = old_entry.address.into();
            let mut remaining = old_entry.page_count as u32;

            while remaining > 0 {
                let run = fsbm::find_free_run::<PAGE_SIZE>(
                    driver,
                    cache,
                    geometry,
                    new_fsbm,
                    data_blocks.clone(),
                    1,
                    remaining,
                )?;
                fsbm::mark_pages::<PAGE_SIZE>(driver, cache, geometry, new_fsbm, run.addr, run.page_count, true, false)?;

                let mut dst = run.addr;
                for _ in 0..run.page_count {
                    let (resolved, _) =
                        crate::delta::resolve::<CK, PAGE_SIZE>(driver, cache, geometry, old_delta_base, old_delta_pages, src)?;
                    let mut buf = [0u8; PAGE_SIZE];
                    cache.read(driver, resolved, 0, &mut buf)?;
                    cache.write(driver, dst, 0, &buf)?;
                    cache.flush(driver)?;
                    src = src.next(geometry)?;
                    dst = dst.next(geometry)?;
                }

                let new_entry = MapEntry { address: run.addr.into(), page_count: run.page_count as u16, checksum: 0 };
                new_first_map = Some(match new_first_map {
                    Some(first) => {
                        map::append::<CK, PAGE_SIZE>(driver, cache, geometry, first, new_entry, &mut *alloc_page)?;
                        first
                    }
                    None => {
                        let first = alloc_page(driver, cache)?;
                        map::init_page::<PAGE_SIZE>(driver, cache, first)?;
                        map::append::<CK, PAGE_SIZE>(driver, cache, geometry, first, new_entry, &mut *alloc_page)?;
                        first
                    }
                });
                remaining -= run.page_count;
            }
        }
        let (_, next) = map::read_links::<CK, PAGE_SIZE>(driver, cache, page)?;
        match next {
            Some(next_page) => page = next_page,
            None => break,
        }
    }

    match new_first_map {
        Some(addr) => Ok(addr),
        None => {
            let first = alloc_page(driver, cache)?;
            map::init_page::<PAGE_SIZE>(driver, cache, first)?;
            Ok(first)
        }
    }
}

/// Copies every non-deleted, non-dot entry of `old_list` into `new_list`,
/// recursing into subdirectories, then appends `.`/`..` to `new_list`
/// pointing at itself and at `new_parent`.
#[allow(clippy::too_many_arguments)]
fn copy_dir<CK: Checksum, const NAME_LEN: usize, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    max_entries: usize,
    old_list: Address,
    new_list: Address,
    new_parent: Address,
    old_delta_base: Address,
    old_delta_pages: usize,
    new_fsbm: Address,
    data_blocks: impl Iterator<Item = u32> + Clone,
    alloc_page: &mut impl FnMut(&mut dyn FlashDriver, &mut Cache<PAGE_SIZE>) -> Result<Address>,
) -> Result<()> {
    for index in 0..max_entries {
        let Some(old_entry) = entry::read::<CK, NAME_LEN, PAGE_SIZE>(driver, cache, geometry, old_list, index)? else {
            continue;
        };
        if old_entry.attrib_flags().contains(Attrib::DELETED) {
            continue;
        }
        if is_dot_name(&old_entry.name) {
            continue;
        }

        if old_entry.attrib_flags().contains(Attrib::DIRECTORY) {
            let new_sub = alloc_page(driver, cache)?;
            let new_entry: Entry<NAME_LEN> = Entry { first_map_address: new_sub.into(), ..old_entry };
            entry::append::<CK, NAME_LEN, PAGE_SIZE>(driver, cache, geometry, new_list, max_entries, 0, &new_entry)?;
            copy_dir::<CK, NAME_LEN, PAGE_SIZE>(
                driver,
                cache,
                geometry,
                max_entries,
                old_entry.first_map_address.into(),
                new_sub,
                new_list,
                old_delta_base,
                old_delta_pages,
                new_fsbm,
                data_blocks.clone(),
                alloc_page,
            )?;
        } else {
            let new_first_map = copy_file::<CK, PAGE_SIZE>(
                driver,
                cache,
                geometry,
                old_entry.first_map_address.into(),
                old_delta_base,
                old_delta_pages,
                new_fsbm,
                data_blocks.clone(),
                alloc_page,
            )?;
            let new_entry: Entry<NAME_LEN> = Entry { first_map_address: new_first_map.into(), ..old_entry };
            entry::append::<CK, NAME_LEN, PAGE_SIZE>(driver, cache, geometry, new_list, max_entries, 0, &new_entry)?;
        }
    }
    dir::append_dot_entries::<CK, NAME_LEN, PAGE_SIZE>(driver, cache, geometry, new_list, max_entries, new_parent)
}

/// Runs the merge procedure, rebuilding `old`'s management area into
/// `new`. `old_header_addr` is `old`'s own location, needed to erase it
/// once `new` becomes authoritative. `data_blocks` must enumerate every
/// data block (never a management block) in a stable order; the same
/// iterator is reused across every phase that needs to rank or scan
/// blocks. `next_management_block` is the block the caller has already
/// chosen (typically the globally least-worn non-management block) to
/// host the generation after this one. `least_worn_out`/`most_worn_out`
/// are filled from the freshly copied wear-level table.
#[allow(clippy::too_many_arguments)]
pub fn run<CK: Checksum, const NAME_LEN: usize, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    max_entries: usize,
    delta_pages: usize,
    old_header_addr: Address,
    old: &Header,
    new: Regions,
    data_blocks: impl Iterator<Item = u32> + Clone,
    next_management_block: u32,
    mut alloc_page: impl FnMut(&mut dyn FlashDriver, &mut Cache<PAGE_SIZE>) -> Result<Address>,
    least_worn_out: &mut [u32],
    most_worn_out: &mut [u32],
) -> Result<Header> {
    // Phase 2: erase the secondary management blocks.
    erase_regions::<PAGE_SIZE>(driver, cache, &new)?;

    // Phase 4: copy the wear-level table, resetting extension bits.
    for block in data_blocks.clone() {
        let cntr = wear::get::<CK, PAGE_SIZE>(driver, cache, geometry, old.wear_level_list_address.into(), block)?;
        wear::rebase::<CK, PAGE_SIZE>(driver, cache, geometry, new.wear_level_list, block, cntr)?;
    }

    // Phase 5: copy the free-space bitmap, reclaiming fully-released blocks.
    let old_fsbm: Address = old.free_space_bitmap_address.into();
    for block in data_blocks.clone() {
        let mut fully_released = true;
        for page in 0..geometry.pages_per_block {
            let addr = Address::new(block, page);
            let free = fsbm::is_free::<PAGE_SIZE>(driver, cache, geometry, old_fsbm, addr)?;
            let released = !free && fsbm::is_to_be_released::<PAGE_SIZE>(driver, cache, geometry, old_fsbm, addr)?;
            if free || !released {
                fully_released = false;
                break;
            }
        }
        if fully_released {
            driver.erase(block)?;
            cache.invalidate(block);
            wear::increment::<CK, PAGE_SIZE>(driver, cache, geometry, new.wear_level_list, block)?;
            continue;
        }
        for page in 0..geometry.pages_per_block {
            let addr = Address::new(block, page);
            let free = fsbm::is_free::<PAGE_SIZE>(driver, cache, geometry, old_fsbm, addr)?;
            if !free {
                let released = fsbm::is_to_be_released::<PAGE_SIZE>(driver, cache, geometry, old_fsbm, addr)?;
                fsbm::mark_pages::<PAGE_SIZE>(driver, cache, geometry, new.fsbm, addr, 1, true, released)?;
            }
        }
    }

    // Phase 7: copy the entry list recursively, files and subdirectories alike.
    copy_dir::<CK, NAME_LEN, PAGE_SIZE>(
        driver,
        cache,
        geometry,
        max_entries,
        old.root_entry_list_address.into(),
        new.entry_list,
        new.entry_list,
        old.delta_map_address.into(),
        delta_pages,
        new.fsbm,
        data_blocks.clone(),
        &mut alloc_page,
    )?;

    // Phase 8: the new delta map stays erased; nothing to reset.

    // Phase 10: regenerate the least/most-worn caches from the new table.
    wear::least_worn::<CK, PAGE_SIZE>(driver, cache, geometry, new.wear_level_list, data_blocks.clone(), least_worn_out)?;
    wear::most_worn::<CK, PAGE_SIZE>(driver, cache, geometry, new.wear_level_list, data_blocks, most_worn_out)?;

    // Phases 6+11: write the finished header once; this crate's header has
    // a single checksum covering the whole record, so there is no
    // partially-committed state to stage through in two separate writes
    // the way a header with an independent next-management-block checksum
    // could. From this write onward the new generation is authoritative.
    let new_header = Header {
        magic: MAGIC,
        major_version: MAJOR_VERSION,
        minor_version: MINOR_VERSION,
        _pad: [0, 0],
        counter: old.counter.wrapping_add(1),
        next_management_block,
        free_space_bitmap_address: new.fsbm.into(),
        root_entry_list_address: new.entry_list.into(),
        delta_map_address: new.delta_map.into(),
        wear_level_list_address: new.wear_level_list.into(),
        wear_level_cntr_max: old.wear_level_cntr_max,
        checksum: 0,
    };
    write_header::<CK, PAGE_SIZE>(driver, cache, new.header, &new_header)?;

    // Phase 12: erase the old management blocks.
    let old_regions = Regions {
        header: old_header_addr,
        entry_list: old.root_entry_list_address.into(),
        fsbm: old.free_space_bitmap_address.into(),
        delta_map: old.delta_map_address.into(),
        wear_level_list: old.wear_level_list_address.into(),
    };
    erase_regions::<PAGE_SIZE>(driver, cache, &old_regions)?;

    Ok(new_header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Additive;
    use crate::test_support::RamFlash;

    const NAME_LEN: usize = 16;
    const PAGE_SIZE: usize = 128;

    fn geo() -> Geometry {
        Geometry { block_count: 20, reserved_blocks: 1, pages_per_block: 4, page_size: PAGE_SIZE as u32, management_blocks: 1 }
    }

    fn mk_name(name: &[u8]) -> [u8; NAME_LEN] {
        let mut n = [0u8; NAME_LEN];
        n[..name.len()].copy_from_slice(name);
        n
    }

    #[test]
    fn header_round_trips_through_encode_decode() {
        let g = geo();
        let mut flash = RamFlash::<PAGE_SIZE, 4, 20>::new();
        let mut cache = Cache::<PAGE_SIZE>::new();
        let addr = Address::new(1, 0);
        let header = Header {
            magic: MAGIC,
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            _pad: [0, 0],
            counter: 7,
            next_management_block: 9,
            free_space_bitmap_address: RawAddress { block: 2, page: 0 },
            root_entry_list_address: RawAddress { block: 3, page: 0 },
            delta_map_address: RawAddress { block: 4, page: 0 },
            wear_level_list_address: RawAddress { block: 5, page: 0 },
            wear_level_cntr_max: 1000,
            checksum: 0,
        };
        write_header::<Additive, PAGE_SIZE>(&mut flash, &mut cache, addr, &header).unwrap();
        let read_back = read_header::<Additive, PAGE_SIZE>(&mut flash, &mut cache, addr).unwrap();
        assert_eq!(read_back.counter, 7);
        assert_eq!(read_back.next_management_block, 9);
        assert_eq!(Address::from(read_back.root_entry_list_address), Address::new(3, 0));
    }

    #[test]
    fn find_authoritative_picks_higher_counter() {
        let g = geo();
        let mut flash = RamFlash::<PAGE_SIZE, 4, 20>::new();
        let mut cache = Cache::<PAGE_SIZE>::new();
        let a = Address::new(1, 0);
        let b = Address::new(6, 0);
        let base = Header {
            magic: MAGIC,
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            _pad: [0, 0],
            next_management_block: 0,
            free_space_bitmap_address: RawAddress { block: 2, page: 0 },
            root_entry_list_address: RawAddress { block: 3, page: 0 },
            delta_map_address: RawAddress { block: 4, page: 0 },
            wear_level_list_address: RawAddress { block: 5, page: 0 },
            wear_level_cntr_max: 1000,
            checksum: 0,
            counter: 3,
        };
        write_header::<Additive, PAGE_SIZE>(&mut flash, &mut cache, a, &base).unwrap();
        write_header::<Additive, PAGE_SIZE>(&mut flash, &mut cache, b, &Header { counter: 4, ..base }).unwrap();

        let (addr, header) = find_authoritative::<Additive, PAGE_SIZE>(&mut flash, &mut cache, &[a, b]).unwrap();
        assert_eq!(addr, b);
        assert_eq!(header.counter, 4);
        let _ = g;
    }

    #[test]
    fn run_reclaims_released_block_and_preserves_files() {
        let g = geo();
        let mut flash = RamFlash::<PAGE_SIZE, 4, 20>::new();
        let mut cache = Cache::<PAGE_SIZE>::new();

        let old_header_addr = Address::new(1, 0);
        let old_entries = Address::new(2, 0);
        let old_fsbm = Address::new(3, 0);
        let old_delta = Address::new(4, 0);
        let old_wear = Address::new(5, 0);
        let old_data_block = 6u32;
        let old_map = Address::new(7, 0);

        let new_header_addr = Address::new(8, 0);
        let new_entries = Address::new(9, 0);
        let new_fsbm = Address::new(10, 0);
        let new_delta = Address::new(11, 0);
        let new_wear = Address::new(12, 0);

        // Seed one file with two adjacent runs and a released neighbor
        // block that should be reclaimed whole.
        let file_entry: Entry<NAME_LEN> =
            Entry { name: mk_name(b"a.txt"), attrib: 0, first_map_address: old_map.into(), file_size: 8, checksum: 0 };
        entry::append::<Additive, NAME_LEN, PAGE_SIZE>(&mut flash, &mut cache, &g, old_entries, 4, 0, &file_entry)
            .unwrap();

        map::append::<Additive, PAGE_SIZE>(
            &mut flash,
            &mut cache,
            &g,
            old_map,
            MapEntry { address: RawAddress { block: old_data_block, page: 0 }, page_count: 2, checksum: 0 },
            |_, _| unreachable!(),
        )
        .unwrap();

        fsbm::mark_pages::<PAGE_SIZE>(&mut flash, &mut cache, &g, old_fsbm, Address::new(old_data_block, 0), 2, true, false)
            .unwrap();

        let released_block = 13u32;
        fsbm::mark_pages::<PAGE_SIZE>(&mut flash, &mut cache, &g, old_fsbm, Address::new(released_block, 0), 4, true, false)
            .unwrap();
        fsbm::mark_pages::<PAGE_SIZE>(&mut flash, &mut cache, &g, old_fsbm, Address::new(released_block, 0), 4, false, true)
            .unwrap();

        let old = Header {
            magic: MAGIC,
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            _pad: [0, 0],
            counter: 1,
            next_management_block: 0,
            free_space_bitmap_address: old_fsbm.into(),
            root_entry_list_address: old_entries.into(),
            delta_map_address: old_delta.into(),
            wear_level_list_address: old_wear.into(),
            wear_level_cntr_max: u32::MAX,
            checksum: 0,
        };
        write_header::<Additive, PAGE_SIZE>(&mut flash, &mut cache, old_header_addr, &old).unwrap();

        let new = Regions {
            header: new_header_addr,
            entry_list: new_entries,
            fsbm: new_fsbm,
            delta_map: new_delta,
            wear_level_list: new_wear,
        };

        let data_blocks = [old_data_block, released_block, 14u32];
        let mut next_free = 15u32;
        let mut least = [0u32; 1];
        let mut most = [0u32; 1];

        let new_header = run::<Additive, NAME_LEN, PAGE_SIZE>(
            &mut flash,
            &mut cache,
            &g,
            4,
            1,
            old_header_addr,
            &old,
            new,
            data_blocks.into_iter(),
            20,
            |_, _| {
                let b = next_free;
                next_free += 1;
                Ok(Address::new(b, 0))
            },
            &mut least,
            &mut most,
        )
        .unwrap();

        assert_eq!(new_header.counter, 2);
        assert_eq!(new_header.next_management_block, 20);

        let (_, found) =
            entry::find::<Additive, NAME_LEN, PAGE_SIZE>(&mut flash, &mut cache, &g, new_entries, 4, b"a.txt")
                .unwrap()
                .unwrap();
        assert_eq!(found.file_size, 8);

        let mut seen_pages = 0;
        map::walk::<Additive, PAGE_SIZE>(&mut flash, &mut cache, &g, found.first_map_address.into(), |e| {
            seen_pages += e.page_count as u32;
            Ok(())
        })
        .unwrap();
        assert_eq!(seen_pages, 2);

        assert_eq!(flash.erase_counts[released_block as usize], 1);
        assert_eq!(
            wear::get::<Additive, PAGE_SIZE>(&mut flash, &mut cache, &g, new_wear, released_block).unwrap(),
            1
        );

        assert!(read_header::<Additive, PAGE_SIZE>(&mut flash, &mut cache, old_header_addr).is_err());
    }
}
