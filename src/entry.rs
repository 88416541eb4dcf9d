// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entry lists: the flat, page-spanning array backing one directory.
//!
//! A deleted entry is never reclaimed in place — it is zeroed to the
//! programmed (all-zero) byte pattern, which the attribute byte and
//! checksum both decode as "invalid", and a later merge drops it for
//! good. Looking a name up and deleting it by name are therefore linear
//! scans over every slot in the list.

use crate::address::Address;
use crate::cache::Cache;
use crate::checksum::Checksum;
use crate::config::Geometry;
use crate::driver::FlashDriver;
use crate::layout::{Attrib, Entry, RawAddress};
use crate::result::{Error, Result};

pub(crate) const fn raw_size(name_len: usize) -> usize {
    name_len + 1 + 8 + 4 + 4
}

fn entry_location(geometry: &Geometry, list_base: Address, entry_size: usize, index: usize) -> Result<(Address, usize)> {
    let entries_per_page = geometry.page_size as usize / entry_size;
    let page_offset = (index / entries_per_page) as u32;
    let byte_in_page = (index % entries_per_page) * entry_size;
    let page = list_base.advance(geometry, page_offset)?;
    Ok((page, byte_in_page))
}

fn decode<const NAME_LEN: usize>(buf: &[u8]) -> Entry<NAME_LEN> {
    let mut name = [0u8; NAME_LEN];
    name.copy_from_slice(&buf[0..NAME_LEN]);
    let attrib = buf[NAME_LEN];
    let first_map_address = RawAddress {
        block: u32::from_le_bytes(buf[NAME_LEN + 1..NAME_LEN + 5].try_into().unwrap()),
        page: u32::from_le_bytes(buf[NAME_LEN + 5..NAME_LEN + 9].try_into().unwrap()),
    };
    let file_size = u32::from_le_bytes(buf[NAME_LEN + 9..NAME_LEN + 13].try_into().unwrap());
    let checksum = u32::from_le_bytes(buf[NAME_LEN + 13..NAME_LEN + 17].try_into().unwrap());
    Entry { name, attrib, first_map_address, file_size, checksum }
}

fn encode<const NAME_LEN: usize>(entry: &Entry<NAME_LEN>, buf: &mut [u8]) {
    buf[0..NAME_LEN].copy_from_slice(&entry.name);
    buf[NAME_LEN] = entry.attrib;
    buf[NAME_LEN + 1..NAME_LEN + 5].copy_from_slice(&entry.first_map_address.block.to_le_bytes());
    buf[NAME_LEN + 5..NAME_LEN + 9].copy_from_slice(&entry.first_map_address.page.to_le_bytes());
    buf[NAME_LEN + 9..NAME_LEN + 13].copy_from_slice(&entry.file_size.to_le_bytes());
    buf[NAME_LEN + 13..NAME_LEN + 17].copy_from_slice(&entry.checksum.to_le_bytes());
}

fn is_erased_bytes(buf: &[u8]) -> bool {
    buf.iter().all(|&b| b == crate::config::ERASED_BYTE)
}

/// Reads entry `index` from the list at `list_base`. Returns `None` if
/// the slot has never been written.
pub fn read<CK: Checksum, const NAME_LEN: usize, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    list_base: Address,
    index: usize,
) -> Result<Option<Entry<NAME_LEN>>> {
    let size = raw_size(NAME_LEN);
    let (page, offset) = entry_location(geometry, list_base, size, index)?;
    let mut buf = [0u8; 256];
    let buf = &mut buf[..size];
    cache.read(driver, page, offset, buf)?;
    if is_erased_bytes(buf) {
        return Ok(None);
    }
    if buf.iter().all(|&b| b == 0) {
        // Tombstone sentinel written by `clear`: a deleted slot, not an
        // erased one, and not subject to checksum validation.
        let mut entry = decode::<NAME_LEN>(buf);
        entry.attrib = Attrib::DELETED.bits();
        return Ok(Some(entry));
    }
    let entry = decode::<NAME_LEN>(buf);
    if CK::compute(&buf[..size - 4]) != entry.checksum {
        return Err(Error::Checksum);
    }
    Ok(Some(entry))
}

fn write<CK: Checksum, const NAME_LEN: usize, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    list_base: Address,
    index: usize,
    entry: &Entry<NAME_LEN>,
) -> Result<()> {
    let size = raw_size(NAME_LEN);
    let (page, offset) = entry_location(geometry, list_base, size, index)?;
    let mut buf = [0u8; 256];
    let buf = &mut buf[..size];
    encode(entry, buf);
    let checksum = CK::compute(&buf[..size - 4]);
    buf[size - 4..].copy_from_slice(&checksum.to_le_bytes());
    cache.write(driver, page, offset, buf)?;
    cache.flush(driver)
}

/// Zeroes entry `index` in place, the tombstone representation: a
/// zeroed name never matches a lookup and a zeroed checksum never
/// validates, so it reads back as gone without needing an erase.
fn clear<const NAME_LEN: usize, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    list_base: Address,
    index: usize,
) -> Result<()> {
    let size = raw_size(NAME_LEN);
    let (page, offset) = entry_location(geometry, list_base, size, index)?;
    let zero = [0u8; 256];
    cache.write(driver, page, offset, &zero[..size])?;
    cache.flush(driver)
}

fn name_matches<const NAME_LEN: usize>(entry_name: &[u8; NAME_LEN], name: &[u8]) -> bool {
    if name.len() > NAME_LEN {
        return false;
    }
    &entry_name[..name.len()] == name && entry_name[name.len()..].iter().all(|&b| b == 0)
}

/// Finds the entry named `name`, skipping deleted entries. Returns its
/// slot index alongside the decoded entry.
pub fn find<CK: Checksum, const NAME_LEN: usize, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    list_base: Address,
    max_entries: usize,
    name: &[u8],
) -> Result<Option<(usize, Entry<NAME_LEN>)>> {
    for index in 0..max_entries {
        if let Some(entry) = read::<CK, NAME_LEN, PAGE_SIZE>(driver, cache, geometry, list_base, index)? {
            let deleted = Attrib::from_bits_truncate(entry.attrib).contains(Attrib::DELETED);
            if !deleted && name_matches(&entry.name, name) {
                return Ok(Some((index, entry)));
            }
        }
    }
    Ok(None)
}

/// Appends `entry` to the first erased slot, failing with
/// [`Error::NoMoreEntry`] once every slot in `0..max_entries` is
/// occupied, or once writing would leave fewer than `reserve` slots
/// free. Normal-operation callers pass `Config::MAX_OPEN_FILES` as
/// `reserve`, keeping that many slots free at all times so a later merge
/// can always append a fresh copy of every currently open file's entry
/// without itself running out of room; callers rebuilding a brand-new,
/// still-empty list during merge pass `0`.
pub fn append<CK: Checksum, const NAME_LEN: usize, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    list_base: Address,
    max_entries: usize,
    reserve: usize,
    entry: &Entry<NAME_LEN>,
) -> Result<usize> {
    let mut first_free = None;
    let mut free_count = 0;
    for index in 0..max_entries {
        if read::<CK, NAME_LEN, PAGE_SIZE>(driver, cache, geometry, list_base, index)?.is_none() {
            free_count += 1;
            if first_free.is_none() {
                first_free = Some(index);
            }
        }
    }
    let index = first_free.ok_or(Error::NoMoreEntry)?;
    if free_count - 1 < reserve {
        return Err(Error::NoMoreEntry);
    }
    write::<CK, NAME_LEN, PAGE_SIZE>(driver, cache, geometry, list_base, index, entry)?;
    Ok(index)
}

/// Overwrites the content of an existing entry slot, e.g. to update a
/// file's size or map pointer after a write.
pub fn update<CK: Checksum, const NAME_LEN: usize, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    list_base: Address,
    index: usize,
    entry: &Entry<NAME_LEN>,
) -> Result<()> {
    write::<CK, NAME_LEN, PAGE_SIZE>(driver, cache, geometry, list_base, index, entry)
}

/// Removes the entry named `name`. Fails with [`Error::FileNotFound`]
/// if no live entry matches.
pub fn delete<CK: Checksum, const NAME_LEN: usize, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    list_base: Address,
    max_entries: usize,
    name: &[u8],
) -> Result<()> {
    match find::<CK, NAME_LEN, PAGE_SIZE>(driver, cache, geometry, list_base, max_entries, name)? {
        Some((index, _)) => clear::<NAME_LEN, PAGE_SIZE>(driver, cache, geometry, list_base, index),
        None => Err(Error::FileNotFound),
    }
}

/// Counts free (never-written) and used-but-tombstoned slots across
/// `0..max_entries`, used by merge to decide whether an entry-list page
/// needs compacting.
pub fn count<CK: Checksum, const NAME_LEN: usize, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    list_base: Address,
    max_entries: usize,
) -> Result<(usize, usize)> {
    let mut free = 0;
    let mut deleted = 0;
    for index in 0..max_entries {
        match read::<CK, NAME_LEN, PAGE_SIZE>(driver, cache, geometry, list_base, index)? {
            None => free += 1,
            Some(entry) if Attrib::from_bits_truncate(entry.attrib).contains(Attrib::DELETED) => deleted += 1,
            Some(_) => {}
        }
    }
    Ok((free, deleted))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Additive;
    use crate::test_support::RamFlash;

    fn geo() -> Geometry {
        Geometry { block_count: 8, reserved_blocks: 1, pages_per_block: 4, page_size: 128, management_blocks: 1 }
    }

    fn mk_entry(name: &[u8]) -> Entry<16> {
        let mut n = [0u8; 16];
        n[..name.len()].copy_from_slice(name);
        Entry { name: n, attrib: 0, first_map_address: RawAddress { block: 2, page: 0 }, file_size: 0, checksum: 0 }
    }

    #[test]
    fn append_then_find_roundtrips() {
        let g = geo();
        let mut flash = RamFlash::<128, 4, 8>::new();
        let mut cache = Cache::<128>::new();
        let base = Address::new(1, 0);
        let e = mk_entry(b"a.txt");
        append::<Additive, 16, 128>(&mut flash, &mut cache, &g, base, 4, 0, &e).unwrap();
        let (idx, found) = find::<Additive, 16, 128>(&mut flash, &mut cache, &g, base, 4, b"a.txt")
            .unwrap()
            .unwrap();
        assert_eq!(idx, 0);
        assert_eq!(found.name, e.name);
    }

    #[test]
    fn delete_then_find_misses() {
        let g = geo();
        let mut flash = RamFlash::<128, 4, 8>::new();
        let mut cache = Cache::<128>::new();
        let base = Address::new(1, 0);
        let e = mk_entry(b"a.txt");
        append::<Additive, 16, 128>(&mut flash, &mut cache, &g, base, 4, 0, &e).unwrap();
        delete::<Additive, 16, 128>(&mut flash, &mut cache, &g, base, 4, b"a.txt").unwrap();
        assert!(find::<Additive, 16, 128>(&mut flash, &mut cache, &g, base, 4, b"a.txt").unwrap().is_none());
    }

    #[test]
    fn full_list_rejects_append() {
        let g = geo();
        let mut flash = RamFlash::<128, 4, 8>::new();
        let mut cache = Cache::<128>::new();
        let base = Address::new(1, 0);
        for i in 0..4 {
            let e = mk_entry(&[b'a' + i as u8]);
            append::<Additive, 16, 128>(&mut flash, &mut cache, &g, base, 4, 0, &e).unwrap();
        }
        let e = mk_entry(b"z");
        assert_eq!(
            append::<Additive, 16, 128>(&mut flash, &mut cache, &g, base, 4, 0, &e),
            Err(Error::NoMoreEntry)
        );
    }

    #[test]
    fn append_reserves_trailing_slots_for_open_files() {
        let g = geo();
        let mut flash = RamFlash::<128, 4, 8>::new();
        let mut cache = Cache::<128>::new();
        let base = Address::new(1, 0);
        // 4 slots total, reserve 2: only 2 are available to ordinary appends.
        let e = mk_entry(b"a");
        append::<Additive, 16, 128>(&mut flash, &mut cache, &g, base, 4, 2, &e).unwrap();
        let e = mk_entry(b"b");
        append::<Additive, 16, 128>(&mut flash, &mut cache, &g, base, 4, 2, &e).unwrap();
        let e = mk_entry(b"c");
        assert_eq!(
            append::<Additive, 16, 128>(&mut flash, &mut cache, &g, base, 4, 2, &e),
            Err(Error::NoMoreEntry)
        );
        // The reserved slots are still physically free, just off-limits
        // to this reserve level.
        assert_eq!(append::<Additive, 16, 128>(&mut flash, &mut cache, &g, base, 4, 0, &e).unwrap(), 2);
    }
}
