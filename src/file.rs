// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Byte-granular file handles over a file's map chain.
//!
//! A [`Handle`] tracks a read/write cursor as a (logical page, page
//! count remaining in the current map run) pair, advanced one page at a
//! time exactly like the original's `rw_address`/`rw_page_count`
//! bookkeeping. Reads and writes that don't land on a page boundary are
//! split into a partial first chunk, whole middle pages, and a partial
//! last chunk.

use crate::address::Address;
use crate::cache::Cache;
use crate::checksum::Checksum;
use crate::config::Geometry;
use crate::delta;
use crate::driver::FlashDriver;
use crate::layout::Entry;
use crate::map::{self, MapEntry};
use crate::result::{Error, Result};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct OpenMode: u8 {
        const READ   = 0b0001;
        const WRITE  = 0b0010;
        const APPEND = 0b0100;
    }
}

/// Cursor position within a file's map chain: the page the next
/// operation starts at, and how many more pages remain in that page's
/// run (including the current one).
#[derive(Clone, Copy, Debug)]
struct Cursor {
    addr: Address,
    remaining_in_run: u32,
    /// Map page and slot index of the run `addr` currently falls within,
    /// so the next run can be found by index rather than by re-deriving
    /// it from `addr` (which, once a run is exhausted, no longer matches
    /// that run's own starting address).
    map_page: Address,
    map_index: usize,
}

/// An open file: the decoded entry, its slot in the entry list, and a
/// byte-granular read/write cursor.
pub struct Handle<const NAME_LEN: usize> {
    pub entry: Entry<NAME_LEN>,
    entry_index: usize,
    list_base: Address,
    mode: OpenMode,
    pos: u64,
    cursor: Option<Cursor>,
    size_changed: bool,
}

impl<const NAME_LEN: usize> Handle<NAME_LEN> {
    pub fn len(&self) -> u64 {
        self.entry.file_size as u64
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn at_eof(&self) -> bool {
        self.pos >= self.len()
    }

    /// The entry list this handle's entry lives in, e.g. so a caller can
    /// tell two handles apart that name the same underlying file.
    pub fn list_base(&self) -> Address {
        self.list_base
    }

    /// This handle's slot index within its entry list.
    pub fn entry_index(&self) -> usize {
        self.entry_index
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }
}

/// Opens an existing file's entry as a [`Handle`], positioning the
/// cursor at the start of its map chain.
pub fn open<CK: Checksum, const NAME_LEN: usize, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    list_base: Address,
    max_entries: usize,
    name: &[u8],
    mode: OpenMode,
) -> Result<Handle<NAME_LEN>> {
    let (entry_index, entry) =
        crate::entry::find::<CK, NAME_LEN, PAGE_SIZE>(driver, cache, geometry, list_base, max_entries, name)?
            .ok_or(Error::FileNotFound)?;

    let first_map_page: Address = entry.first_map_address.into();
    let cursor = first_run::<CK, PAGE_SIZE>(driver, cache, first_map_page)?;

    let mut handle =
        Handle { entry, entry_index, list_base, mode, pos: 0, cursor, size_changed: false };
    if mode.contains(OpenMode::APPEND) {
        seek_to::<CK, PAGE_SIZE>(driver, cache, geometry, &mut handle, handle.len())?;
    }
    Ok(handle)
}

fn first_run<CK: Checksum, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    first_map_page: Address,
) -> Result<Option<Cursor>> {
    match map::read_entry::<CK, PAGE_SIZE>(driver, cache, first_map_page, 0)? {
        Some(MapEntry { address, page_count }) => Ok(Some(Cursor {
            addr: address.into(),
            remaining_in_run: page_count as u32,
            map_page: first_map_page,
            map_index: 0,
        })),
        None => Ok(None),
    }
}

/// Repositions the cursor to byte offset `pos`, walking the map chain
/// from the start. `pos == len()` (append position, or an empty file)
/// is always valid even though it names no page yet.
pub fn seek_to<CK: Checksum, const NAME_LEN: usize, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    handle: &mut Handle<NAME_LEN>,
    pos: u64,
) -> Result<()> {
    if pos > handle.len() {
        return Err(Error::SeekNotPossible);
    }
    let first_map_page: Address = handle.entry.first_map_address.into();
    let page_size = geometry.page_size as u64;
    let target_page = pos / page_size;

    let mut page = first_map_page;
    let mut consumed: u64 = 0;
    let mut found: Option<Cursor> = None;
    'chain: loop {
        let per_page = map::entries_per_page(geometry);
        for i in 0..per_page {
            match map::read_entry::<CK, PAGE_SIZE>(driver, cache, page, i)? {
                Some(entry) => {
                    let run_len = entry.page_count as u64;
                    if target_page < consumed + run_len || (pos == handle.len() && target_page == consumed + run_len) {
                        let offset_in_run = (target_page - consumed) as u32;
                        let addr: Address = entry.address.into();
                        let addr = addr.advance(geometry, offset_in_run)?;
                        found = Some(Cursor {
                            addr,
                            remaining_in_run: entry.page_count as u32 - offset_in_run,
                            map_page: page,
                            map_index: i,
                        });
                        break 'chain;
                    }
                    consumed += run_len;
                }
                None => break,
            }
        }
        let (_, next) = map::read_links::<CK, PAGE_SIZE>(driver, cache, page)?;
        match next {
            Some(next_page) => page = next_page,
            None => break,
        }
    }
    handle.pos = pos;
    handle.cursor = found;
    Ok(())
}

fn advance_cursor<CK: Checksum, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    cursor: &mut Cursor,
) -> Result<bool> {
    cursor.remaining_in_run -= 1;
    if cursor.remaining_in_run > 0 {
        cursor.addr = cursor.addr.next(geometry)?;
        return Ok(true);
    }
    // Current run exhausted: the next slot in the same map page holds
    // the next run, or the first slot of the next linked map page does.
    if let Some(entry) = map::read_entry::<CK, PAGE_SIZE>(driver, cache, cursor.map_page, cursor.map_index + 1)? {
        cursor.addr = entry.address.into();
        cursor.remaining_in_run = entry.page_count as u32;
        cursor.map_index += 1;
        return Ok(true);
    }
    let (_, next) = map::read_links::<CK, PAGE_SIZE>(driver, cache, cursor.map_page)?;
    match next {
        Some(next_page) => match map::read_entry::<CK, PAGE_SIZE>(driver, cache, next_page, 0)? {
            Some(entry) => {
                cursor.addr = entry.address.into();
                cursor.remaining_in_run = entry.page_count as u32;
                cursor.map_page = next_page;
                cursor.map_index = 0;
                Ok(true)
            }
            None => Ok(false),
        },
        None => Ok(false),
    }
}

/// Reads up to `buf.len()` bytes at the cursor, advancing it. Returns
/// the number of bytes actually read (less than requested only at EOF).
pub fn read<CK: Checksum, const NAME_LEN: usize, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    delta_base: Address,
    delta_pages: usize,
    handle: &mut Handle<NAME_LEN>,
    buf: &mut [u8],
) -> Result<usize> {
    if !handle.mode.contains(OpenMode::READ) {
        return Err(Error::InvalidOpenMode);
    }
    let page_size = geometry.page_size as usize;
    let remaining_in_file = (handle.len() - handle.pos) as usize;
    let mut to_read = buf.len().min(remaining_in_file);
    let mut done = 0;

    while to_read > 0 {
        let Some(mut cursor) = handle.cursor else { break };
        let po = (handle.pos as usize) % page_size;
        let chunk = to_read.min(page_size - po);

        let (resolved, _) = delta::resolve::<CK, PAGE_SIZE>(driver, cache, geometry, delta_base, delta_pages, cursor.addr)?;
        cache.read(driver, resolved, po, &mut buf[done..done + chunk])?;

        done += chunk;
        to_read -= chunk;
        handle.pos += chunk as u64;

        if po + chunk >= page_size {
            advance_cursor::<CK, PAGE_SIZE>(driver, cache, geometry, &mut cursor)?;
        }
        handle.cursor = Some(cursor);
    }
    Ok(done)
}

/// Overwrites `data` at the cursor, within the file's current length
/// only — growing the file is [`append`]'s job. Advances the cursor.
pub fn write_within<CK: Checksum, const NAME_LEN: usize, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    delta_base: Address,
    delta_pages: usize,
    handle: &mut Handle<NAME_LEN>,
    data: &[u8],
    mut alloc_data_page: impl FnMut(&mut dyn FlashDriver, &mut Cache<PAGE_SIZE>) -> Result<Address>,
    mut merge_if_full: impl FnMut(&mut dyn FlashDriver, &mut Cache<PAGE_SIZE>) -> Result<()>,
) -> Result<usize> {
    if !handle.mode.contains(OpenMode::WRITE) {
        return Err(Error::InvalidOpenMode);
    }
    let page_size = geometry.page_size as usize;
    let within_file = (handle.len() - handle.pos) as usize;
    let mut to_write = data.len().min(within_file);
    let mut done = 0;

    while to_write > 0 {
        let Some(mut cursor) = handle.cursor else { break };
        let po = (handle.pos as usize) % page_size;
        let chunk = to_write.min(page_size - po);

        delta::write::<CK, PAGE_SIZE>(
            driver,
            cache,
            geometry,
            delta_base,
            delta_pages,
            cursor.addr,
            po,
            &data[done..done + chunk],
            &mut alloc_data_page,
            &mut merge_if_full,
        )?;

        done += chunk;
        to_write -= chunk;
        handle.pos += chunk as u64;

        if po + chunk >= page_size {
            advance_cursor::<CK, PAGE_SIZE>(driver, cache, geometry, &mut cursor)?;
        }
        handle.cursor = Some(cursor);
    }
    Ok(done)
}

/// Appends `data` past the file's current end. If the file's last page
/// still has erased room past `file_size`, that room is filled in place
/// first (it's programmable, same as any other in-bounds write); only
/// the bytes that don't fit get fresh pages and map-chain growth.
#[allow(clippy::too_many_arguments)]
pub fn append<CK: Checksum, const NAME_LEN: usize, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    delta_base: Address,
    delta_pages: usize,
    handle: &mut Handle<NAME_LEN>,
    data: &[u8],
    mut alloc_data_page: impl FnMut(&mut dyn FlashDriver, &mut Cache<PAGE_SIZE>) -> Result<Address>,
    mut merge_if_full: impl FnMut(&mut dyn FlashDriver, &mut Cache<PAGE_SIZE>) -> Result<()>,
    mut alloc_run: impl FnMut(&mut dyn FlashDriver, &mut Cache<PAGE_SIZE>, u32) -> Result<(Address, u32)>,
    mut mark_used: impl FnMut(&mut dyn FlashDriver, &mut Cache<PAGE_SIZE>, Address, u32) -> Result<()>,
    mut alloc_map_page: impl FnMut(&mut dyn FlashDriver, &mut Cache<PAGE_SIZE>) -> Result<Address>,
) -> Result<usize> {
    if !handle.mode.contains(OpenMode::WRITE) {
        return Err(Error::InvalidOpenMode);
    }
    let page_size = geometry.page_size as usize;
    let mut remaining = data.len();
    let mut done = 0;
    let first_map_page: Address = handle.entry.first_map_address.into();

    if let Some(cursor) = handle.cursor {
        let po = (handle.pos as usize) % page_size;
        if po != 0 && remaining > 0 {
            let chunk = remaining.min(page_size - po);
            delta::write::<CK, PAGE_SIZE>(
                driver,
                cache,
                geometry,
                delta_base,
                delta_pages,
                cursor.addr,
                po,
                &data[done..done + chunk],
                &mut alloc_data_page,
                &mut merge_if_full,
            )?;
            done += chunk;
            remaining -= chunk;
        }
    }

    while remaining > 0 {
        let pages_needed = ((remaining + page_size - 1) / page_size) as u32;
        let (addr, page_count) = alloc_run(driver, cache, pages_needed)?;

        let mut a = addr;
        for i in 0..page_count {
            let chunk = remaining.min(page_size);
            cache.write(driver, a, 0, &data[done..done + chunk])?;
            cache.flush(driver)?;
            mark_used(driver, cache, a, 1)?;
            done += chunk;
            remaining -= chunk;
            if i + 1 < page_count {
                a = a.next(geometry)?;
            }
            if remaining == 0 {
                break;
            }
        }

        map::append::<CK, PAGE_SIZE>(
            driver,
            cache,
            geometry,
            first_map_page,
            MapEntry { address: addr.into(), page_count: page_count as u16, checksum: 0 },
            &mut alloc_map_page,
        )?;
    }

    handle.pos += data.len() as u64;
    handle.entry.file_size = handle.pos as u32;
    handle.size_changed = true;
    // Cursor invalidated by the growth; caller re-seeks if it keeps writing.
    handle.cursor = None;
    Ok(done)
}

/// Flushes the entry's size back to its list slot if it changed. The
/// underlying cache line is written back by every individual operation
/// already; this only updates bookkeeping metadata.
pub fn flush<CK: Checksum, const NAME_LEN: usize, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    handle: &mut Handle<NAME_LEN>,
) -> Result<()> {
    if handle.size_changed {
        crate::entry::update::<CK, NAME_LEN, PAGE_SIZE>(
            driver,
            cache,
            geometry,
            handle.list_base,
            handle.entry_index,
            &handle.entry,
        )?;
        handle.size_changed = false;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Additive;
    use crate::layout::RawAddress;
    use crate::test_support::RamFlash;

    fn geo() -> Geometry {
        Geometry { block_count: 8, reserved_blocks: 1, pages_per_block: 4, page_size: 64, management_blocks: 1 }
    }

    fn mk_file_entry(block: u32, page: u32) -> Entry<16> {
        let mut name = [0u8; 16];
        name[..5].copy_from_slice(b"a.txt");
        Entry { name, attrib: 0, first_map_address: RawAddress { block, page }, file_size: 0, checksum: 0 }
    }

    #[test]
    fn append_then_seek_and_read_roundtrips() {
        let g = geo();
        let mut flash = RamFlash::<64, 4, 8>::new();
        let mut cache = Cache::<64>::new();
        let list_base = Address::new(1, 0);
        let map_page = Address::new(2, 0);

        let e = mk_file_entry(map_page.block, map_page.page);
        crate::entry::append::<Additive, 16, 64>(&mut flash, &mut cache, &g, list_base, 2, 0, &e).unwrap();

        let mut handle = open::<Additive, 16, 64>(
            &mut flash,
            &mut cache,
            &g,
            list_base,
            2,
            b"a.txt",
            OpenMode::READ | OpenMode::WRITE,
        )
        .unwrap();
        assert!(handle.cursor.is_none());

        let data: [u8; 70] = core::array::from_fn(|i| (i % 251) as u8);
        let mut next_free_page = 0u32;
        let written = append::<Additive, 16, 64>(
            &mut flash,
            &mut cache,
            &g,
            Address::new(4, 0),
            1,
            &mut handle,
            &data,
            |_, _| unreachable!("empty file has no partial page to fill"),
            |_, _| unreachable!("empty file has no partial page to fill"),
            |_, _, pages_needed| {
                let addr = Address::new(3, next_free_page);
                next_free_page += pages_needed;
                Ok((addr, pages_needed))
            },
            |_, _, _, _| Ok(()),
            |_, _| unreachable!("one map page holds both runs"),
        )
        .unwrap();
        assert_eq!(written, 70);
        assert_eq!(handle.entry.file_size, 70);

        flush::<Additive, 16, 64>(&mut flash, &mut cache, &g, &mut handle).unwrap();

        seek_to::<Additive, 16, 64>(&mut flash, &mut cache, &g, &mut handle, 0).unwrap();
        let mut out = [0u8; 70];
        let read_count = read::<Additive, 16, 64>(
            &mut flash,
            &mut cache,
            &g,
            Address::new(1, 2),
            1,
            &mut handle,
            &mut out,
        )
        .unwrap();
        assert_eq!(read_count, 70);
        assert_eq!(out, data);
        assert_eq!(handle.pos, 70);
        assert!(handle.at_eof());
    }

    /// A reopened handle's append must land in the current final page's
    /// erased tail before any fresh page is allocated, so concatenated
    /// writes across separate opens read back contiguous.
    #[test]
    fn append_past_eof_fills_existing_partial_page_first() {
        let g = geo();
        let mut flash = RamFlash::<64, 4, 8>::new();
        let mut cache = Cache::<64>::new();
        let list_base = Address::new(1, 0);
        let map_page = Address::new(2, 0);

        let e = mk_file_entry(map_page.block, map_page.page);
        crate::entry::append::<Additive, 16, 64>(&mut flash, &mut cache, &g, list_base, 2, 0, &e).unwrap();

        let mut next_free_page = 0u32;
        let mut alloc_run = |_: &mut dyn FlashDriver, _: &mut Cache<64>, pages_needed: u32| -> Result<(Address, u32)> {
            let addr = Address::new(3, next_free_page);
            next_free_page += pages_needed;
            Ok((addr, pages_needed))
        };

        let mut handle = open::<Additive, 16, 64>(
            &mut flash,
            &mut cache,
            &g,
            list_base,
            2,
            b"a.txt",
            OpenMode::READ | OpenMode::WRITE | OpenMode::APPEND,
        )
        .unwrap();
        append::<Additive, 16, 64>(
            &mut flash,
            &mut cache,
            &g,
            Address::new(4, 0),
            1,
            &mut handle,
            b"first-",
            |_, _| unreachable!("empty file has no partial page to fill"),
            |_, _| unreachable!("empty file has no partial page to fill"),
            &mut alloc_run,
            |_, _, _, _| Ok(()),
            |_, _| unreachable!("one map page holds the single run"),
        )
        .unwrap();
        flush::<Additive, 16, 64>(&mut flash, &mut cache, &g, &mut handle).unwrap();

        // Reopen, as a real append-law caller would across separate
        // program invocations: the cursor is rebuilt by seek_to, not
        // carried over from the handle above.
        let mut handle = open::<Additive, 16, 64>(
            &mut flash,
            &mut cache,
            &g,
            list_base,
            2,
            b"a.txt",
            OpenMode::READ | OpenMode::WRITE | OpenMode::APPEND,
        )
        .unwrap();
        assert!(handle.cursor.is_some());

        append::<Additive, 16, 64>(
            &mut flash,
            &mut cache,
            &g,
            Address::new(4, 0),
            1,
            &mut handle,
            b"second",
            |_, _| unreachable!("\"first-second\" still fits in one 64-byte page"),
            |_, _| unreachable!("\"first-second\" still fits in one 64-byte page"),
            &mut alloc_run,
            |_, _, _, _| Ok(()),
            |_, _| unreachable!("still one run, one map page"),
        )
        .unwrap();
        flush::<Additive, 16, 64>(&mut flash, &mut cache, &g, &mut handle).unwrap();
        assert_eq!(handle.entry.file_size, 12);

        seek_to::<Additive, 16, 64>(&mut flash, &mut cache, &g, &mut handle, 0).unwrap();
        let mut out = [0u8; 12];
        let n = read::<Additive, 16, 64>(&mut flash, &mut cache, &g, Address::new(1, 2), 1, &mut handle, &mut out)
            .unwrap();
        assert_eq!(n, 12);
        assert_eq!(&out, b"first-second");
    }

    #[test]
    fn seek_past_end_is_rejected() {
        let g = geo();
        let mut flash = RamFlash::<64, 4, 8>::new();
        let mut cache = Cache::<64>::new();
        let list_base = Address::new(1, 0);
        let map_page = Address::new(2, 0);
        let e = mk_file_entry(map_page.block, map_page.page);
        crate::entry::append::<Additive, 16, 64>(&mut flash, &mut cache, &g, list_base, 2, 0, &e).unwrap();
        let mut handle = open::<Additive, 16, 64>(
            &mut flash,
            &mut cache,
            &g,
            list_base,
            2,
            b"a.txt",
            OpenMode::READ,
        )
        .unwrap();
        assert_eq!(
            seek_to::<Additive, 16, 64>(&mut flash, &mut cache, &g, &mut handle, 1),
            Err(Error::SeekNotPossible)
        );
    }
}
