// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The public file-system facade: ties cache, FSBM, wear-level list, entry
//! lists, file maps, delta map and merge together behind one
//! [`spin::Mutex`]-guarded surface.
//!
//! Every operation locks the whole file system for its duration — there is
//! no per-file or per-directory locking, matching the original's single
//! reentrancy guard around the whole API. [`FileSystem`] is the type
//! callers hold; it delegates every method straight to the private
//! [`Inner`] it wraps, which does the actual work and is free to borrow its
//! own fields without fighting a public API's borrow checker.

use core::marker::PhantomData;
use core::ops::Range;

use crate::address::Address;
use crate::cache::Cache;
use crate::checksum::Checksum;
use crate::config::{Config, Geometry};
use crate::dir;
use crate::driver::FlashDriver;
use crate::entry;
use crate::file;
use crate::fsbm;
use crate::layout::{self, Attrib, Entry, Header};
use crate::map;
use crate::merge;
use crate::result::{Error, Result};
use crate::wear;

fn pages_for_bytes(bytes: usize, page_size: u32) -> u32 {
    ((bytes as u64 + page_size as u64 - 1) / page_size as u64) as u32
}

/// The base address of management generation `which` (0 or 1).
fn management_base(geometry: &Geometry, which: u32) -> Address {
    Address::new(geometry.reserved_blocks + geometry.management_blocks * which, 0)
}

/// First block past both management generations — where data blocks start.
fn data_block_start(geometry: &Geometry) -> u32 {
    geometry.reserved_blocks + geometry.management_blocks * 2
}

/// Every data block, in ascending order.
fn data_blocks(geometry: &Geometry) -> Range<u32> {
    data_block_start(geometry)..geometry.block_count
}

/// Lays out one management generation's five regions back to back,
/// starting at `base`: header, entry list, free-space bitmap, delta map,
/// wear-level list.
fn layout_regions<CFG: Config, const NAME_LEN: usize>(geometry: &Geometry, base: Address) -> Result<merge::Regions> {
    let header = base;
    let header_pages = pages_for_bytes(merge::HEADER_SIZE, geometry.page_size);
    let entry_list = header.advance(geometry, header_pages)?;

    let entry_list_bytes = CFG::MAX_ENTRIES * entry::raw_size(NAME_LEN);
    let entry_list_pages = pages_for_bytes(entry_list_bytes, geometry.page_size);
    let fsbm = entry_list.advance(geometry, entry_list_pages)?;

    let fsbm_bytes = ((geometry.fs_page_count() as u64 * 2 + 7) / 8) as usize;
    let fsbm_pages = pages_for_bytes(fsbm_bytes, geometry.page_size);
    let delta_map = fsbm.advance(geometry, fsbm_pages)?;

    let wear_level_list = delta_map.advance(geometry, CFG::MAX_DELTA_PAGES as u32)?;

    Ok(merge::Regions { header, entry_list, fsbm, delta_map, wear_level_list })
}

/// Names that are empty, `.`/`..`, or carry a byte the original's
/// directory entry format can't round-trip are rejected up front rather
/// than discovered later as a corrupt-looking entry.
fn valid_filename(name: &[u8]) -> bool {
    !name.is_empty()
        && name != b"."
        && name != b".."
        && !name
            .iter()
            .any(|&b| matches!(b, b' ' | b'\'' | b'*' | b',' | b':' | b';' | b'<' | b'=' | b'>' | b'?' | b'[' | b']' | b'|' | b'\\'))
}

fn offset_u64(base: u64, delta: i64) -> Result<u64> {
    if delta >= 0 {
        base.checked_add(delta as u64)
    } else {
        delta.checked_neg().and_then(|d| base.checked_sub(d as u64))
    }
    .ok_or(Error::SeekNotPossible)
}

/// Yields `cached[..count]` first (when `has_cache`), then every other
/// data block. `cached` is whichever ranked cache — least- or most-worn —
/// the caller is biasing an allocation toward.
fn preferred_data_blocks(geometry: Geometry, cached: [u32; 16], has_cache: bool, count: usize) -> impl Iterator<Item = u32> + Clone {
    let n = if has_cache { count.min(16) } else { 0 };
    (0..n).map(move |i| cached[i]).chain(data_blocks(&geometry).filter(move |b| !cached[..n].contains(b)))
}

fn alloc_single_page<const PAGE_SIZE: usize>(
    geometry: Geometry,
    fsbm_base: Address,
    preferred: [u32; 16],
    has_preferred: bool,
    preferred_count: usize,
) -> impl FnMut(&mut dyn FlashDriver, &mut Cache<PAGE_SIZE>) -> Result<Address> {
    move |driver, cache| {
        let blocks = preferred_data_blocks(geometry, preferred, has_preferred, preferred_count);
        let run = fsbm::find_free_run::<PAGE_SIZE>(driver, cache, &geometry, fsbm_base, blocks, 1, 1)?;
        fsbm::mark_pages::<PAGE_SIZE>(driver, cache, &geometry, fsbm_base, run.addr, 1, true, false)?;
        Ok(run.addr)
    }
}

/// Finds a run of up to `pages_needed` free pages without marking them
/// used — the caller marks each page used only after writing its data, so
/// a power loss mid-write never leaves a page marked used with garbage
/// in it.
fn alloc_run<const PAGE_SIZE: usize>(
    geometry: Geometry,
    fsbm_base: Address,
    preferred: [u32; 16],
    has_preferred: bool,
    preferred_count: usize,
) -> impl FnMut(&mut dyn FlashDriver, &mut Cache<PAGE_SIZE>, u32) -> Result<(Address, u32)> {
    move |driver, cache, pages_needed| {
        let blocks = preferred_data_blocks(geometry, preferred, has_preferred, preferred_count);
        let run = fsbm::find_free_run::<PAGE_SIZE>(driver, cache, &geometry, fsbm_base, blocks, 1, pages_needed)?;
        Ok((run.addr, run.page_count))
    }
}

fn mark_used_closure<const PAGE_SIZE: usize>(
    geometry: Geometry,
    fsbm_base: Address,
) -> impl FnMut(&mut dyn FlashDriver, &mut Cache<PAGE_SIZE>, Address, u32) -> Result<()> {
    move |driver, cache, addr, count| fsbm::mark_pages::<PAGE_SIZE>(driver, cache, &geometry, fsbm_base, addr, count, true, false)
}

/// Where a [`FileSystem::seek`] should land, relative to the start,
/// the current position, or the end of the file.
#[derive(Clone, Copy, Debug)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

/// Builder for [`FileSystem::open`]'s flags, mirroring `std::fs::OpenOptions`
/// rather than the original's C-string `fopen` modes.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenOptions {
    read: bool,
    write: bool,
    append: bool,
    create: bool,
    create_new: bool,
    truncate: bool,
}

impl OpenOptions {
    pub fn read(mut self, v: bool) -> Self {
        self.read = v;
        self
    }
    pub fn write(mut self, v: bool) -> Self {
        self.write = v;
        self
    }
    pub fn append(mut self, v: bool) -> Self {
        self.append = v;
        self
    }
    pub fn create(mut self, v: bool) -> Self {
        self.create = v;
        self
    }
    pub fn create_new(mut self, v: bool) -> Self {
        self.create_new = v;
        self
    }
    pub fn truncate(mut self, v: bool) -> Self {
        self.truncate = v;
        self
    }

    fn mode(&self) -> file::OpenMode {
        let mut m = file::OpenMode::empty();
        if self.read {
            m |= file::OpenMode::READ;
        }
        if self.write || self.append {
            m |= file::OpenMode::WRITE;
        }
        if self.append {
            m |= file::OpenMode::APPEND;
        }
        m
    }
}

struct OpenFileSlot<const NAME_LEN: usize> {
    handle: file::Handle<NAME_LEN>,
    last_error: Option<Error>,
}

#[allow(clippy::too_many_arguments)]
struct Inner<D, CK, CFG, const NAME_LEN: usize, const PAGE_SIZE: usize, const MAX_OPEN_FILES: usize, const MAX_OPEN_DIRS: usize, const MAX_TASKS: usize> {
    driver: D,
    cache: Cache<PAGE_SIZE>,
    geometry: Geometry,
    header_addr: Address,
    header: Header,
    least_worn: [u32; 16],
    most_worn: [u32; 16],
    has_wear_cache: bool,
    open_files: [Option<OpenFileSlot<NAME_LEN>>; MAX_OPEN_FILES],
    open_dirs: [Option<dir::Directory>; MAX_OPEN_DIRS],
    cwd: [Address; MAX_TASKS],
    last_error: Option<Error>,
    _marker: PhantomData<(CK, CFG)>,
}

impl<D, CK, CFG, const NAME_LEN: usize, const PAGE_SIZE: usize, const MAX_OPEN_FILES: usize, const MAX_OPEN_DIRS: usize, const MAX_TASKS: usize>
    Inner<D, CK, CFG, NAME_LEN, PAGE_SIZE, MAX_OPEN_FILES, MAX_OPEN_DIRS, MAX_TASKS>
where
    D: FlashDriver,
    CK: Checksum,
    CFG: Config,
{
    fn format(mut driver: D, geometry: Geometry) -> Result<Self> {
        let mut cache = Cache::<PAGE_SIZE>::new();
        for block in geometry.reserved_blocks..geometry.block_count {
            driver.erase(block)?;
            cache.invalidate(block);
        }

        let regions = layout_regions::<CFG, NAME_LEN>(&geometry, management_base(&geometry, 0))?;
        let header = Header {
            magic: layout::MAGIC,
            major_version: layout::MAJOR_VERSION,
            minor_version: layout::MINOR_VERSION,
            _pad: [0, 0],
            counter: 0,
            next_management_block: management_base(&geometry, 1).block,
            free_space_bitmap_address: regions.fsbm.into(),
            root_entry_list_address: regions.entry_list.into(),
            delta_map_address: regions.delta_map.into(),
            wear_level_list_address: regions.wear_level_list.into(),
            wear_level_cntr_max: 0,
            checksum: 0,
        };
        merge::write_header::<CK, PAGE_SIZE>(&mut driver, &mut cache, regions.header, &header)?;

        let mut inner = Inner {
            driver,
            cache,
            geometry,
            header_addr: regions.header,
            header,
            least_worn: [0; 16],
            most_worn: [0; 16],
            has_wear_cache: false,
            open_files: core::array::from_fn(|_| None),
            open_dirs: core::array::from_fn(|_| None),
            cwd: [regions.entry_list; MAX_TASKS],
            last_error: None,
            _marker: PhantomData,
        };
        inner.refresh_wear_cache()?;
        Ok(inner)
    }

    fn mount(mut driver: D, geometry: Geometry) -> Result<Self> {
        let mut cache = Cache::<PAGE_SIZE>::new();
        let candidates = [management_base(&geometry, 0), management_base(&geometry, 1)];
        let (header_addr, header) = merge::find_authoritative::<CK, PAGE_SIZE>(&mut driver, &mut cache, &candidates)?;
        let root: Address = header.root_entry_list_address.into();

        let mut inner = Inner {
            driver,
            cache,
            geometry,
            header_addr,
            header,
            least_worn: [0; 16],
            most_worn: [0; 16],
            has_wear_cache: false,
            open_files: core::array::from_fn(|_| None),
            open_dirs: core::array::from_fn(|_| None),
            cwd: [root; MAX_TASKS],
            last_error: None,
            _marker: PhantomData,
        };
        inner.refresh_wear_cache()?;
        Ok(inner)
    }

    fn refresh_wear_cache(&mut self) -> Result<()> {
        let geometry = self.geometry;
        let list_base: Address = self.header.wear_level_list_address.into();
        let n_least = CFG::LEAST_WORN_COUNT.min(16);
        let n_most = CFG::MOST_WORN_COUNT.min(16);
        wear::least_worn::<CK, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, list_base, data_blocks(&geometry), &mut self.least_worn[..n_least])?;
        wear::most_worn::<CK, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, list_base, data_blocks(&geometry), &mut self.most_worn[..n_most])?;
        self.has_wear_cache = true;
        Ok(())
    }

    fn active_slot(&self) -> u32 {
        if self.header_addr.block == management_base(&self.geometry, 0).block {
            0
        } else {
            1
        }
    }

    fn note(&mut self, fd: usize, e: Error) {
        if let Some(slot_opt) = self.open_files.get_mut(fd) {
            if let Some(slot) = slot_opt.as_mut() {
                slot.last_error = Some(e);
            }
        }
        self.last_error = Some(e);
    }

    fn fail<T>(&mut self, e: Error) -> Result<T> {
        self.last_error = Some(e);
        Err(e)
    }

    fn find_free_file_slot(&self) -> Result<usize> {
        self.open_files.iter().position(Option::is_none).ok_or(Error::NoMoreResource)
    }

    fn find_free_dir_slot(&self) -> Result<usize> {
        self.open_dirs.iter().position(Option::is_none).ok_or(Error::NoMoreResource)
    }

    fn create_file(&mut self, dir_list: Address, name: &[u8]) -> Result<()> {
        let geometry = self.geometry;
        let fsbm_base: Address = self.header.free_space_bitmap_address.into();
        let mut alloc = alloc_single_page::<PAGE_SIZE>(geometry, fsbm_base, self.least_worn, self.has_wear_cache, CFG::LEAST_WORN_COUNT.min(16));
        let map_page = alloc(&mut self.driver, &mut self.cache)?;

        let mut raw_name = [0u8; NAME_LEN];
        raw_name[..name.len()].copy_from_slice(name);
        let entry = Entry { name: raw_name, attrib: 0, first_map_address: map_page.into(), file_size: 0, checksum: 0 };
        entry::append::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, dir_list, CFG::MAX_ENTRIES, CFG::MAX_OPEN_FILES, &entry)?;
        Ok(())
    }

    fn truncate_entry(&mut self, parent: Address, name: &[u8]) -> Result<()> {
        let geometry = self.geometry;
        let fsbm_base: Address = self.header.free_space_bitmap_address.into();
        let (index, mut entry) = entry::find::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, parent, CFG::MAX_ENTRIES, name)?
            .ok_or(Error::FileNotFound)?;
        if entry.attrib_flags().contains(Attrib::DIRECTORY) {
            return Err(Error::IsDirectory);
        }
        let old_map: Address = entry.first_map_address.into();
        map::release_file_pages::<CK, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, old_map, |driver, cache, addr, count| {
            fsbm::mark_pages::<PAGE_SIZE>(driver, cache, &geometry, fsbm_base, addr, count, false, true)
        })?;

        let mut alloc = alloc_single_page::<PAGE_SIZE>(geometry, fsbm_base, self.least_worn, self.has_wear_cache, CFG::LEAST_WORN_COUNT.min(16));
        let new_map = alloc(&mut self.driver, &mut self.cache)?;
        entry.first_map_address = new_map.into();
        entry.file_size = 0;
        entry::update::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, parent, index, &entry)
    }

    fn open(&mut self, task: usize, path: &[u8], opts: OpenOptions) -> Result<usize> {
        let root: Address = self.header.root_entry_list_address.into();
        let cwd = self.cwd[task];
        let geometry = self.geometry;
        let (parent, name) = dir::resolve_path::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, root, cwd, CFG::MAX_ENTRIES, path)?;
        if !valid_filename(name) || name.len() > NAME_LEN {
            return self.fail(Error::InvalidFileName);
        }

        let existing = entry::find::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, parent, CFG::MAX_ENTRIES, name)?;
        match existing {
            Some((_, e)) if e.attrib_flags().contains(Attrib::DIRECTORY) => return self.fail(Error::IsDirectory),
            Some(_) if opts.create_new => return self.fail(Error::FileAlreadyExists),
            None if !opts.create => return self.fail(Error::FileNotFound),
            None => self.create_file(parent, name)?,
            _ => {}
        }
        if opts.truncate {
            self.truncate_entry(parent, name)?;
        }

        let slot = self.find_free_file_slot()?;
        let mode = opts.mode();
        let handle = file::open::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, parent, CFG::MAX_ENTRIES, name, mode)?;
        self.open_files[slot] = Some(OpenFileSlot { handle, last_error: None });
        Ok(slot)
    }

    fn maybe_merge_before_write(&mut self) -> Result<()> {
        let geometry = self.geometry;
        let fsbm_base: Address = self.header.free_space_bitmap_address.into();
        let (free, _) = fsbm::count_pages::<PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, fsbm_base, data_blocks(&geometry))?;
        if (free as usize) < CFG::MERGE_DATA_PAGE_THRESHOLD {
            self.merge()?;
        }
        Ok(())
    }

    fn read(&mut self, fd: usize, buf: &mut [u8]) -> Result<usize> {
        let geometry = self.geometry;
        let delta_base: Address = self.header.delta_map_address.into();
        let delta_pages = CFG::MAX_DELTA_PAGES;
        let result = (|| {
            let slot = self.open_files.get_mut(fd).and_then(Option::as_mut).ok_or(Error::FileNotFound)?;
            file::read::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, delta_base, delta_pages, &mut slot.handle, buf)
        })();
        if let Err(e) = result {
            self.note(fd, e);
        }
        result
    }

    fn write_inner(&mut self, fd: usize, data: &[u8]) -> Result<usize> {
        self.maybe_merge_before_write()?;
        let geometry = self.geometry;
        let delta_base: Address = self.header.delta_map_address.into();
        let delta_pages = CFG::MAX_DELTA_PAGES;
        let fsbm_base: Address = self.header.free_space_bitmap_address.into();
        let preferred = self.least_worn;
        let has_pref = self.has_wear_cache;
        let pref_n = CFG::LEAST_WORN_COUNT.min(16);

        let slot = self.open_files.get_mut(fd).and_then(Option::as_mut).ok_or(Error::FileNotFound)?;
        let within_len = (slot.handle.len().saturating_sub(slot.handle.position())) as usize;
        let in_place = within_len.min(data.len());
        let mut written = 0;

        if in_place > 0 {
            let alloc = alloc_single_page::<PAGE_SIZE>(geometry, fsbm_base, preferred, has_pref, pref_n);
            written += file::write_within::<CK, NAME_LEN, PAGE_SIZE>(
                &mut self.driver,
                &mut self.cache,
                &geometry,
                delta_base,
                delta_pages,
                &mut slot.handle,
                &data[..in_place],
                alloc,
                |_, _| Ok(()),
            )?;
        }

        let rest = &data[in_place..];
        if !rest.is_empty() {
            let alloc_tail = alloc_single_page::<PAGE_SIZE>(geometry, fsbm_base, preferred, has_pref, pref_n);
            let alloc_run_c = alloc_run::<PAGE_SIZE>(geometry, fsbm_base, preferred, has_pref, pref_n);
            let mark_used_c = mark_used_closure::<PAGE_SIZE>(geometry, fsbm_base);
            let alloc_map_c = alloc_single_page::<PAGE_SIZE>(geometry, fsbm_base, preferred, has_pref, pref_n);
            written += file::append::<CK, NAME_LEN, PAGE_SIZE>(
                &mut self.driver,
                &mut self.cache,
                &geometry,
                delta_base,
                delta_pages,
                &mut slot.handle,
                rest,
                alloc_tail,
                |_, _| Ok(()),
                alloc_run_c,
                mark_used_c,
                alloc_map_c,
            )?;
        }

        file::flush::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, &mut slot.handle)?;
        Ok(written)
    }

    fn write(&mut self, fd: usize, data: &[u8]) -> Result<usize> {
        let result = self.write_inner(fd, data);
        if let Err(e) = result {
            self.note(fd, e);
        }
        result
    }

    fn seek_inner(&mut self, fd: usize, pos: SeekFrom) -> Result<u64> {
        let geometry = self.geometry;
        let slot = self.open_files.get_mut(fd).and_then(Option::as_mut).ok_or(Error::FileNotFound)?;
        let target = match pos {
            SeekFrom::Start(p) => p,
            SeekFrom::Current(d) => offset_u64(slot.handle.position(), d)?,
            SeekFrom::End(d) => offset_u64(slot.handle.len(), d)?,
        };
        file::seek_to::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, &mut slot.handle, target)?;
        Ok(target)
    }

    fn seek(&mut self, fd: usize, pos: SeekFrom) -> Result<u64> {
        let result = self.seek_inner(fd, pos);
        if let Err(e) = result {
            self.note(fd, e);
        }
        result
    }

    fn tell(&self, fd: usize) -> Result<u64> {
        self.open_files.get(fd).and_then(Option::as_ref).map(|s| s.handle.position()).ok_or(Error::FileNotFound)
    }

    fn flush(&mut self, fd: usize) -> Result<()> {
        let geometry = self.geometry;
        let slot = self.open_files.get_mut(fd).and_then(Option::as_mut).ok_or(Error::FileNotFound)?;
        let result = file::flush::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, &mut slot.handle);
        if let Err(e) = result {
            self.note(fd, e);
        }
        result
    }

    fn close(&mut self, fd: usize) -> Result<()> {
        self.flush(fd)?;
        self.open_files[fd] = None;
        Ok(())
    }

    fn eof(&self, fd: usize) -> Result<bool> {
        self.open_files.get(fd).and_then(Option::as_ref).map(|s| s.handle.at_eof()).ok_or(Error::FileNotFound)
    }

    fn last_error(&self) -> Option<Error> {
        self.last_error
    }

    fn handle_last_error(&self, fd: usize) -> Result<Option<Error>> {
        self.open_files.get(fd).and_then(Option::as_ref).map(|s| s.last_error).ok_or(Error::FileNotFound)
    }

    fn remove(&mut self, task: usize, path: &[u8]) -> Result<()> {
        let root: Address = self.header.root_entry_list_address.into();
        let cwd = self.cwd[task];
        let geometry = self.geometry;
        let fsbm_base: Address = self.header.free_space_bitmap_address.into();
        let (parent, name) = dir::resolve_path::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, root, cwd, CFG::MAX_ENTRIES, path)?;
        let (_, entry) = entry::find::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, parent, CFG::MAX_ENTRIES, name)?
            .ok_or(Error::FileNotFound)?;
        if entry.attrib_flags().contains(Attrib::DIRECTORY) {
            return Err(Error::IsDirectory);
        }
        let first_map: Address = entry.first_map_address.into();
        map::release_file_pages::<CK, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, first_map, |driver, cache, addr, count| {
            fsbm::mark_pages::<PAGE_SIZE>(driver, cache, &geometry, fsbm_base, addr, count, false, true)
        })?;
        entry::delete::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, parent, CFG::MAX_ENTRIES, name)
    }

    fn rename(&mut self, task: usize, old_path: &[u8], new_path: &[u8]) -> Result<()> {
        let root: Address = self.header.root_entry_list_address.into();
        let cwd = self.cwd[task];
        let geometry = self.geometry;
        let (old_parent, old_name) =
            dir::resolve_path::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, root, cwd, CFG::MAX_ENTRIES, old_path)?;
        let (new_parent, new_name) =
            dir::resolve_path::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, root, cwd, CFG::MAX_ENTRIES, new_path)?;
        if !valid_filename(new_name) || new_name.len() > NAME_LEN {
            return Err(Error::InvalidFileName);
        }
        if entry::find::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, new_parent, CFG::MAX_ENTRIES, new_name)?.is_some() {
            return Err(Error::FileAlreadyExists);
        }
        let (_, mut entry) = entry::find::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, old_parent, CFG::MAX_ENTRIES, old_name)?
            .ok_or(Error::FileNotFound)?;
        entry::delete::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, old_parent, CFG::MAX_ENTRIES, old_name)?;

        let mut raw_name = [0u8; NAME_LEN];
        raw_name[..new_name.len()].copy_from_slice(new_name);
        entry.name = raw_name;
        entry::append::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, new_parent, CFG::MAX_ENTRIES, CFG::MAX_OPEN_FILES, &entry)?;
        Ok(())
    }

    fn copy(&mut self, task: usize, src_path: &[u8], dst_path: &[u8]) -> Result<()> {
        let root: Address = self.header.root_entry_list_address.into();
        let cwd = self.cwd[task];
        let geometry = self.geometry;
        let (src_parent, src_name) =
            dir::resolve_path::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, root, cwd, CFG::MAX_ENTRIES, src_path)?;
        let (dst_parent, dst_name) =
            dir::resolve_path::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, root, cwd, CFG::MAX_ENTRIES, dst_path)?;
        if !valid_filename(dst_name) || dst_name.len() > NAME_LEN {
            return Err(Error::InvalidFileName);
        }
        if entry::find::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, dst_parent, CFG::MAX_ENTRIES, dst_name)?.is_some() {
            return Err(Error::FileAlreadyExists);
        }

        let mut src_handle =
            file::open::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, src_parent, CFG::MAX_ENTRIES, src_name, file::OpenMode::READ)?;
        self.create_file(dst_parent, dst_name)?;
        let mut dst_handle = file::open::<CK, NAME_LEN, PAGE_SIZE>(
            &mut self.driver,
            &mut self.cache,
            &geometry,
            dst_parent,
            CFG::MAX_ENTRIES,
            dst_name,
            file::OpenMode::WRITE,
        )?;

        let delta_base: Address = self.header.delta_map_address.into();
        let delta_pages = CFG::MAX_DELTA_PAGES;
        let fsbm_base: Address = self.header.free_space_bitmap_address.into();
        let preferred = self.least_worn;
        let has_pref = self.has_wear_cache;
        let pref_n = CFG::LEAST_WORN_COUNT.min(16);

        let mut buf = [0u8; PAGE_SIZE];
        loop {
            let n = file::read::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, delta_base, delta_pages, &mut src_handle, &mut buf)?;
            if n == 0 {
                break;
            }
            let alloc_tail = alloc_single_page::<PAGE_SIZE>(geometry, fsbm_base, preferred, has_pref, pref_n);
            let alloc_run_c = alloc_run::<PAGE_SIZE>(geometry, fsbm_base, preferred, has_pref, pref_n);
            let mark_used_c = mark_used_closure::<PAGE_SIZE>(geometry, fsbm_base);
            let alloc_map_c = alloc_single_page::<PAGE_SIZE>(geometry, fsbm_base, preferred, has_pref, pref_n);
            file::append::<CK, NAME_LEN, PAGE_SIZE>(
                &mut self.driver,
                &mut self.cache,
                &geometry,
                delta_base,
                delta_pages,
                &mut dst_handle,
                &buf[..n],
                alloc_tail,
                |_, _| Ok(()),
                alloc_run_c,
                mark_used_c,
                alloc_map_c,
            )?;
        }
        file::flush::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, &mut dst_handle)
    }

    fn file_size(&mut self, task: usize, path: &[u8]) -> Result<u64> {
        let root: Address = self.header.root_entry_list_address.into();
        let cwd = self.cwd[task];
        let geometry = self.geometry;
        let (parent, name) = dir::resolve_path::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, root, cwd, CFG::MAX_ENTRIES, path)?;
        let (_, entry) = entry::find::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, parent, CFG::MAX_ENTRIES, name)?
            .ok_or(Error::FileNotFound)?;
        Ok(entry.file_size as u64)
    }

    fn exists(&mut self, task: usize, path: &[u8]) -> Result<bool> {
        let root: Address = self.header.root_entry_list_address.into();
        let cwd = self.cwd[task];
        let geometry = self.geometry;
        let (parent, name) = match dir::resolve_path::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, root, cwd, CFG::MAX_ENTRIES, path) {
            Ok(v) => v,
            Err(Error::FileNotFound) | Err(Error::IsNotDirectory) => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(entry::find::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, parent, CFG::MAX_ENTRIES, name)?.is_some())
    }

    fn mkdir(&mut self, task: usize, path: &[u8]) -> Result<()> {
        let root: Address = self.header.root_entry_list_address.into();
        let cwd = self.cwd[task];
        let geometry = self.geometry;
        let (parent, name) = dir::resolve_path::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, root, cwd, CFG::MAX_ENTRIES, path)?;
        if !valid_filename(name) || name.len() > NAME_LEN {
            return Err(Error::InvalidFileName);
        }
        let fsbm_base: Address = self.header.free_space_bitmap_address.into();
        let mut alloc = alloc_single_page::<PAGE_SIZE>(geometry, fsbm_base, self.least_worn, self.has_wear_cache, CFG::LEAST_WORN_COUNT.min(16));
        let new_list = alloc(&mut self.driver, &mut self.cache)?;
        dir::mkdir::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, parent, CFG::MAX_ENTRIES, CFG::MAX_OPEN_FILES, name, new_list)
    }

    fn rmdir(&mut self, task: usize, path: &[u8]) -> Result<()> {
        let root: Address = self.header.root_entry_list_address.into();
        let cwd = self.cwd[task];
        let geometry = self.geometry;
        let fsbm_base: Address = self.header.free_space_bitmap_address.into();
        let (parent, name) = dir::resolve_path::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, root, cwd, CFG::MAX_ENTRIES, path)?;
        let (_, entry) = entry::find::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, parent, CFG::MAX_ENTRIES, name)?
            .ok_or(Error::FileNotFound)?;
        let list: Address = entry.first_map_address.into();
        dir::rmdir::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, parent, CFG::MAX_ENTRIES, name)?;
        fsbm::mark_pages::<PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, fsbm_base, list, 1, false, true)
    }

    fn chdir(&mut self, task: usize, path: &[u8]) -> Result<()> {
        let root: Address = self.header.root_entry_list_address.into();
        let cwd = self.cwd[task];
        let geometry = self.geometry;
        let new_cwd = dir::resolve_dir::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, root, cwd, CFG::MAX_ENTRIES, path)?;
        self.cwd[task] = new_cwd;
        Ok(())
    }

    fn task_cwd(&self, task: usize) -> Address {
        self.cwd[task]
    }

    fn open_dir(&mut self, task: usize, path: &[u8]) -> Result<usize> {
        let root: Address = self.header.root_entry_list_address.into();
        let cwd = self.cwd[task];
        let geometry = self.geometry;
        let list = dir::resolve_dir::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, root, cwd, CFG::MAX_ENTRIES, path)?;
        let slot = self.find_free_dir_slot()?;
        self.open_dirs[slot] = Some(dir::open_dir(list));
        Ok(slot)
    }

    fn read_dir(&mut self, dh: usize) -> Result<Option<dir::DirEntry<NAME_LEN>>> {
        let geometry = self.geometry;
        let max_entries = CFG::MAX_ENTRIES;
        let d = self.open_dirs.get_mut(dh).and_then(Option::as_mut).ok_or(Error::FileNotFound)?;
        dir::read_dir::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, d, max_entries)
    }

    fn close_dir(&mut self, dh: usize) -> Result<()> {
        if self.open_dirs.get(dh).map(Option::is_some) != Some(true) {
            return Err(Error::FileNotFound);
        }
        self.open_dirs[dh] = None;
        Ok(())
    }

    fn free_space(&mut self) -> Result<u64> {
        let geometry = self.geometry;
        let fsbm_base: Address = self.header.free_space_bitmap_address.into();
        let (free, _) = fsbm::count_pages::<PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, fsbm_base, data_blocks(&geometry))?;
        Ok(free as u64 * geometry.page_size as u64)
    }

    fn to_be_released_space(&mut self) -> Result<u64> {
        let geometry = self.geometry;
        let fsbm_base: Address = self.header.free_space_bitmap_address.into();
        let (_, released) = fsbm::count_pages::<PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, fsbm_base, data_blocks(&geometry))?;
        Ok(released as u64 * geometry.page_size as u64)
    }

    fn merge(&mut self) -> Result<()> {
        if self.open_files.iter().any(Option::is_some) || self.open_dirs.iter().any(Option::is_some) {
            return Err(Error::NoMoreResource);
        }
        let geometry = self.geometry;
        let new_slot = 1 - self.active_slot();
        let new_regions = layout_regions::<CFG, NAME_LEN>(&geometry, management_base(&geometry, new_slot))?;
        let next_management_block = management_base(&geometry, self.active_slot()).block;

        let alloc_page = alloc_single_page::<PAGE_SIZE>(geometry, new_regions.fsbm, self.least_worn, self.has_wear_cache, CFG::LEAST_WORN_COUNT.min(16));

        let n_least = CFG::LEAST_WORN_COUNT.min(16);
        let n_most = CFG::MOST_WORN_COUNT.min(16);
        let mut least_out = [0u32; 16];
        let mut most_out = [0u32; 16];

        let new_header = merge::run::<CK, NAME_LEN, PAGE_SIZE>(
            &mut self.driver,
            &mut self.cache,
            &geometry,
            CFG::MAX_ENTRIES,
            CFG::MAX_DELTA_PAGES,
            self.header_addr,
            &self.header,
            new_regions,
            data_blocks(&geometry),
            next_management_block,
            alloc_page,
            &mut least_out[..n_least],
            &mut most_out[..n_most],
        )?;

        self.header_addr = new_regions.header;
        self.header = new_header;
        self.least_worn = least_out;
        self.most_worn = most_out;
        self.has_wear_cache = true;
        for cwd in self.cwd.iter_mut() {
            *cwd = new_regions.entry_list;
        }
        Ok(())
    }

    fn static_wear_level(&mut self, max_blocks: usize) -> Result<usize> {
        let geometry = self.geometry;
        let wear_base: Address = self.header.wear_level_list_address.into();
        let fsbm_base: Address = self.header.free_space_bitmap_address.into();
        let mut no_out: [u32; 0] = [];
        let max_cntr = wear::least_worn::<CK, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, wear_base, data_blocks(&geometry), &mut no_out)?;
        let limit = CFG::STATIC_WEAR_LIMIT.max(max_cntr * CFG::STATIC_WEAR_PERCENT / 100);

        let mut migrated = 0;
        for block in data_blocks(&geometry) {
            if migrated >= max_blocks {
                break;
            }
            let cntr = wear::get::<CK, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, wear_base, block)?;
            if max_cntr.saturating_sub(cntr) <= limit {
                continue;
            }
            let mut has_free = false;
            for page in 0..geometry.pages_per_block {
                if fsbm::is_free::<PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, fsbm_base, Address::new(block, page))? {
                    has_free = true;
                    break;
                }
            }
            if has_free {
                continue;
            }
            let root: Address = self.header.root_entry_list_address.into();
            migrated += self.migrate_block_files(root, block)?;
        }
        Ok(migrated)
    }

    fn migrate_block_files(&mut self, list: Address, worn_block: u32) -> Result<usize> {
        let geometry = self.geometry;
        let max_entries = CFG::MAX_ENTRIES;
        let mut migrated = 0;
        for index in 0..max_entries {
            let Some(entry) = entry::read::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, list, index)? else {
                continue;
            };
            if entry.attrib_flags().contains(Attrib::DELETED) {
                continue;
            }
            let end = entry.name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
            if &entry.name[..end] == b"." || &entry.name[..end] == b".." {
                continue;
            }

            if entry.attrib_flags().contains(Attrib::DIRECTORY) {
                migrated += self.migrate_block_files(entry.first_map_address.into(), worn_block)?;
            } else {
                let first_map: Address = entry.first_map_address.into();
                let mut touches = false;
                map::walk::<CK, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, first_map, |e| {
                    let a: Address = e.address.into();
                    if a.block == worn_block {
                        touches = true;
                    }
                    Ok(())
                })?;
                if touches {
                    self.migrate_one_file(list, &entry)?;
                    migrated += 1;
                }
            }
        }
        Ok(migrated)
    }

    fn migrate_one_file(&mut self, list: Address, old_entry: &Entry<NAME_LEN>) -> Result<()> {
        let geometry = self.geometry;
        let fsbm_base: Address = self.header.free_space_bitmap_address.into();
        let delta_base: Address = self.header.delta_map_address.into();
        let delta_pages = CFG::MAX_DELTA_PAGES;
        let preferred = self.most_worn;
        let has_pref = self.has_wear_cache;
        let pref_n = CFG::MOST_WORN_COUNT.min(16);

        let old_name_len = old_entry.name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        let old_name_buf = old_entry.name;
        let old_name = &old_name_buf[..old_name_len];

        let mut tmp_name = [0u8; NAME_LEN];
        tmp_name[0] = b'~';
        let copy_len = old_name_len.min(NAME_LEN - 1);
        tmp_name[1..1 + copy_len].copy_from_slice(&old_name[..copy_len]);
        let tmp_len = 1 + copy_len;

        self.create_file(list, &tmp_name[..tmp_len])?;

        let mut src = file::open::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, list, CFG::MAX_ENTRIES, old_name, file::OpenMode::READ)?;
        let mut dst = file::open::<CK, NAME_LEN, PAGE_SIZE>(
            &mut self.driver,
            &mut self.cache,
            &geometry,
            list,
            CFG::MAX_ENTRIES,
            &tmp_name[..tmp_len],
            file::OpenMode::WRITE,
        )?;

        let mut buf = [0u8; PAGE_SIZE];
        loop {
            let n = file::read::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, delta_base, delta_pages, &mut src, &mut buf)?;
            if n == 0 {
                break;
            }
            let alloc_tail = alloc_single_page::<PAGE_SIZE>(geometry, fsbm_base, preferred, has_pref, pref_n);
            let alloc_run_c = alloc_run::<PAGE_SIZE>(geometry, fsbm_base, preferred, has_pref, pref_n);
            let mark_used_c = mark_used_closure::<PAGE_SIZE>(geometry, fsbm_base);
            let alloc_map_c = alloc_single_page::<PAGE_SIZE>(geometry, fsbm_base, preferred, has_pref, pref_n);
            file::append::<CK, NAME_LEN, PAGE_SIZE>(
                &mut self.driver,
                &mut self.cache,
                &geometry,
                delta_base,
                delta_pages,
                &mut dst,
                &buf[..n],
                alloc_tail,
                |_, _| Ok(()),
                alloc_run_c,
                mark_used_c,
                alloc_map_c,
            )?;
        }
        file::flush::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, &mut dst)?;

        let old_first_map: Address = old_entry.first_map_address.into();
        map::release_file_pages::<CK, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, old_first_map, |driver, cache, addr, count| {
            fsbm::mark_pages::<PAGE_SIZE>(driver, cache, &geometry, fsbm_base, addr, count, false, true)
        })?;
        entry::delete::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, list, CFG::MAX_ENTRIES, old_name)?;

        let (tmp_index, mut tmp_entry) =
            entry::find::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, list, CFG::MAX_ENTRIES, &tmp_name[..tmp_len])?
                .ok_or(Error::FileNotFound)?;
        let mut restored_name = [0u8; NAME_LEN];
        restored_name[..old_name_len].copy_from_slice(old_name);
        tmp_entry.name = restored_name;
        entry::update::<CK, NAME_LEN, PAGE_SIZE>(&mut self.driver, &mut self.cache, &geometry, list, tmp_index, &tmp_entry)
    }
}

/// A mounted log-structured file system over a [`FlashDriver`]. Every
/// operation locks the single internal [`spin::Mutex`] for its duration;
/// `D`, `CK` and `CFG` pin the flash driver, checksum, and compile-time
/// table sizes this instance was formatted or mounted with.
pub struct FileSystem<D, CK, CFG, const NAME_LEN: usize, const PAGE_SIZE: usize, const MAX_OPEN_FILES: usize, const MAX_OPEN_DIRS: usize, const MAX_TASKS: usize> {
    inner: spin::Mutex<Inner<D, CK, CFG, NAME_LEN, PAGE_SIZE, MAX_OPEN_FILES, MAX_OPEN_DIRS, MAX_TASKS>>,
}

impl<D, CK, CFG, const NAME_LEN: usize, const PAGE_SIZE: usize, const MAX_OPEN_FILES: usize, const MAX_OPEN_DIRS: usize, const MAX_TASKS: usize>
    FileSystem<D, CK, CFG, NAME_LEN, PAGE_SIZE, MAX_OPEN_FILES, MAX_OPEN_DIRS, MAX_TASKS>
where
    D: FlashDriver,
    CK: Checksum,
    CFG: Config,
{
    /// Erases every block the file system owns and writes a fresh, empty
    /// primary generation.
    pub fn format(driver: D, geometry: Geometry) -> Result<Self> {
        Ok(FileSystem { inner: spin::Mutex::new(Inner::format(driver, geometry)?) })
    }

    /// Mounts an existing file system, picking the authoritative
    /// management generation by the higher of the two generation
    /// counters.
    pub fn mount(driver: D, geometry: Geometry) -> Result<Self> {
        Ok(FileSystem { inner: spin::Mutex::new(Inner::mount(driver, geometry)?) })
    }

    pub fn open(&self, task: usize, path: &[u8], opts: OpenOptions) -> Result<usize> {
        self.inner.lock().open(task, path, opts)
    }

    pub fn read(&self, fd: usize, buf: &mut [u8]) -> Result<usize> {
        self.inner.lock().read(fd, buf)
    }

    pub fn write(&self, fd: usize, data: &[u8]) -> Result<usize> {
        self.inner.lock().write(fd, data)
    }

    pub fn seek(&self, fd: usize, pos: SeekFrom) -> Result<u64> {
        self.inner.lock().seek(fd, pos)
    }

    pub fn tell(&self, fd: usize) -> Result<u64> {
        self.inner.lock().tell(fd)
    }

    pub fn flush(&self, fd: usize) -> Result<()> {
        self.inner.lock().flush(fd)
    }

    pub fn close(&self, fd: usize) -> Result<()> {
        self.inner.lock().close(fd)
    }

    pub fn eof(&self, fd: usize) -> Result<bool> {
        self.inner.lock().eof(fd)
    }

    pub fn last_error(&self) -> Option<Error> {
        self.inner.lock().last_error()
    }

    pub fn handle_last_error(&self, fd: usize) -> Result<Option<Error>> {
        self.inner.lock().handle_last_error(fd)
    }

    pub fn remove(&self, task: usize, path: &[u8]) -> Result<()> {
        self.inner.lock().remove(task, path)
    }

    pub fn rename(&self, task: usize, old_path: &[u8], new_path: &[u8]) -> Result<()> {
        self.inner.lock().rename(task, old_path, new_path)
    }

    pub fn copy(&self, task: usize, src: &[u8], dst: &[u8]) -> Result<()> {
        self.inner.lock().copy(task, src, dst)
    }

    pub fn file_size(&self, task: usize, path: &[u8]) -> Result<u64> {
        self.inner.lock().file_size(task, path)
    }

    pub fn exists(&self, task: usize, path: &[u8]) -> Result<bool> {
        self.inner.lock().exists(task, path)
    }

    pub fn mkdir(&self, task: usize, path: &[u8]) -> Result<()> {
        self.inner.lock().mkdir(task, path)
    }

    pub fn rmdir(&self, task: usize, path: &[u8]) -> Result<()> {
        self.inner.lock().rmdir(task, path)
    }

    pub fn chdir(&self, task: usize, path: &[u8]) -> Result<()> {
        self.inner.lock().chdir(task, path)
    }

    pub fn task_cwd(&self, task: usize) -> Address {
        self.inner.lock().task_cwd(task)
    }

    pub fn open_dir(&self, task: usize, path: &[u8]) -> Result<usize> {
        self.inner.lock().open_dir(task, path)
    }

    pub fn read_dir(&self, dh: usize) -> Result<Option<dir::DirEntry<NAME_LEN>>> {
        self.inner.lock().read_dir(dh)
    }

    pub fn close_dir(&self, dh: usize) -> Result<()> {
        self.inner.lock().close_dir(dh)
    }

    /// Bytes in never-allocated pages across the data area.
    pub fn free_space(&self) -> Result<u64> {
        self.inner.lock().free_space()
    }

    /// Bytes in pages released but not yet reclaimed by [`merge`](Self::merge).
    pub fn to_be_released_space(&self) -> Result<u64> {
        self.inner.lock().to_be_released_space()
    }

    /// Rebuilds the management area into the other generation, reclaiming
    /// released pages and tombstoned entries. Fails with
    /// [`Error::NoMoreResource`] while any file or directory is open.
    pub fn merge(&self) -> Result<()> {
        self.inner.lock().merge()
    }

    /// Migrates files off up to `max_blocks` over-worn data blocks that
    /// have no free page of their own, returning how many files moved.
    pub fn static_wear_level(&self, max_blocks: usize) -> Result<usize> {
        self.inner.lock().static_wear_level(max_blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Additive;
    use crate::test_support::RamFlash;

    struct TestCfg;
    impl Config for TestCfg {
        const MAX_OPEN_FILES: usize = 4;
        const MAX_OPEN_DIRS: usize = 2;
        const MAX_ENTRIES: usize = 8;
        const MAX_FILENAME_LEN: usize = 15;
        const MAX_DELTA_PAGES: usize = 1;
        const LEAST_WORN_COUNT: usize = 2;
        const MOST_WORN_COUNT: usize = 2;
        const MAX_TASKS: usize = 1;
        const MERGE_DATA_PAGE_THRESHOLD: usize = 1;
        const STATIC_WEAR_LIMIT: u32 = 100;
        const STATIC_WEAR_PERCENT: u32 = 50;
    }

    const NAME_LEN: usize = 16;
    const PAGE_SIZE: usize = 128;

    type Fs = FileSystem<RamFlash<PAGE_SIZE, 4, 14>, Additive, TestCfg, NAME_LEN, PAGE_SIZE, 4, 2, 1>;

    fn geo() -> Geometry {
        Geometry { block_count: 14, reserved_blocks: 1, pages_per_block: 4, page_size: PAGE_SIZE as u32, management_blocks: 2 }
    }

    #[test]
    fn format_then_write_and_read_roundtrips() {
        let flash = RamFlash::<PAGE_SIZE, 4, 14>::new();
        let fs: Fs = FileSystem::format(flash, geo()).unwrap();

        let fd = fs.open(0, b"a.txt", OpenOptions::default().write(true).create(true)).unwrap();
        let written = fs.write(fd, b"hello, flash").unwrap();
        assert_eq!(written, 12);
        fs.close(fd).unwrap();

        let fd = fs.open(0, b"a.txt", OpenOptions::default().read(true)).unwrap();
        let mut buf = [0u8; 12];
        let read = fs.read(fd, &mut buf).unwrap();
        assert_eq!(read, 12);
        assert_eq!(&buf, b"hello, flash");
        fs.close(fd).unwrap();
    }

    #[test]
    fn mkdir_and_list_roundtrips() {
        let flash = RamFlash::<PAGE_SIZE, 4, 14>::new();
        let fs: Fs = FileSystem::format(flash, geo()).unwrap();

        fs.mkdir(0, b"docs").unwrap();
        fs.chdir(0, b"docs").unwrap();
        let fd = fs.open(0, b"note.txt", OpenOptions::default().write(true).create(true)).unwrap();
        fs.write(fd, b"hi").unwrap();
        fs.close(fd).unwrap();

        let dh = fs.open_dir(0, b".").unwrap();
        let mut names = 0;
        while fs.read_dir(dh).unwrap().is_some() {
            names += 1;
        }
        fs.close_dir(dh).unwrap();
        assert_eq!(names, 3); // ".", "..", "note.txt"
    }

    #[test]
    fn remove_reclaims_space() {
        let flash = RamFlash::<PAGE_SIZE, 4, 14>::new();
        let fs: Fs = FileSystem::format(flash, geo()).unwrap();

        let before = fs.free_space().unwrap();
        let fd = fs.open(0, b"a.txt", OpenOptions::default().write(true).create(true)).unwrap();
        fs.write(fd, &[0xAAu8; 40]).unwrap();
        fs.close(fd).unwrap();
        let after_write = fs.free_space().unwrap();
        assert!(after_write < before);

        fs.remove(0, b"a.txt").unwrap();
        assert!(!fs.exists(0, b"a.txt").unwrap());
    }

    #[test]
    fn rejects_invalid_filename() {
        let flash = RamFlash::<PAGE_SIZE, 4, 14>::new();
        let fs: Fs = FileSystem::format(flash, geo()).unwrap();
        assert_eq!(
            fs.open(0, b"bad:name", OpenOptions::default().write(true).create(true)),
            Err(Error::InvalidFileName)
        );
    }
}
