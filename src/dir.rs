// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Directories: path resolution and entry-list iteration.
//!
//! A directory is nothing but an entry list like any other, addressed by
//! its owning entry's `first_map_address`. `.` and `..` are ordinary
//! entries appended at [`mkdir`] time, pointing back at the directory's
//! own list and at its parent's, so looking either up is just another
//! [`crate::entry::find`] call — no special-casing needed once they
//! exist.

use crate::address::Address;
use crate::cache::Cache;
use crate::checksum::Checksum;
use crate::config::Geometry;
use crate::driver::FlashDriver;
use crate::entry;
use crate::layout::{Attrib, Entry, RawAddress};
use crate::result::{Error, Result};

pub const SEPARATOR: u8 = b'/';

fn is_absolute(path: &[u8]) -> bool {
    path.first() == Some(&SEPARATOR)
}

fn split_first_component(path: &[u8]) -> (&[u8], Option<&[u8]>) {
    match path.iter().position(|&b| b == SEPARATOR) {
        Some(i) => (&path[..i], Some(&path[i + 1..])),
        None => (path, None),
    }
}

fn is_dot_name<const NAME_LEN: usize>(name: &[u8; NAME_LEN]) -> bool {
    let trimmed: &[u8] = {
        let end = name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        &name[..end]
    };
    trimmed == b"." || trimmed == b".."
}

/// Walks every directory component of `path`, resolving `.`/`..` and
/// nested names against entry lists, and returns the entry list address
/// of the last directory named. `path` itself (not the last path
/// component) must resolve entirely to directories. An empty path or a
/// bare separator names `root`.
pub fn resolve_dir<CK: Checksum, const NAME_LEN: usize, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    root: Address,
    cwd: Address,
    max_entries: usize,
    path: &[u8],
) -> Result<Address> {
    if path.is_empty() || path == [SEPARATOR] {
        return Ok(root);
    }
    let mut rest = if is_absolute(path) { &path[1..] } else { path };
    let mut list = if is_absolute(path) { root } else { cwd };
    loop {
        let (component, tail) = split_first_component(rest);
        if component != b"." {
            let (_, found) =
                entry::find::<CK, NAME_LEN, PAGE_SIZE>(driver, cache, geometry, list, max_entries, component)?
                    .ok_or(Error::FileNotFound)?;
            if !found.attrib_flags().contains(Attrib::DIRECTORY) {
                return Err(Error::IsNotDirectory);
            }
            list = found.first_map_address.into();
        }
        match tail {
            Some(t) => rest = t,
            None => return Ok(list),
        }
    }
}

/// Resolves every directory component of `path` except the last, and
/// returns the containing directory's entry list address alongside the
/// final path component as a name (which may name a file or a
/// directory — the caller decides which it expects).
pub fn resolve_path<'p, CK: Checksum, const NAME_LEN: usize, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    root: Address,
    cwd: Address,
    max_entries: usize,
    path: &'p [u8],
) -> Result<(Address, &'p [u8])> {
    let mut rest = if is_absolute(path) { &path[1..] } else { path };
    let mut list = if is_absolute(path) { root } else { cwd };
    loop {
        let (component, tail) = split_first_component(rest);
        match tail {
            None => return Ok((list, component)),
            Some(t) => {
                if component != b"." {
                    let (_, found) = entry::find::<CK, NAME_LEN, PAGE_SIZE>(
                        driver,
                        cache,
                        geometry,
                        list,
                        max_entries,
                        component,
                    )?
                    .ok_or(Error::FileNotFound)?;
                    if !found.attrib_flags().contains(Attrib::DIRECTORY) {
                        return Err(Error::IsNotDirectory);
                    }
                    list = found.first_map_address.into();
                }
                rest = t;
            }
        }
    }
}

/// Creates a new, empty directory named `name` in `parent_list`, with
/// its own list at `new_list` (allocated and marked used by the
/// caller, as every other module's page-consuming operation expects).
/// Appends `.` and `..` to the new list pointing at itself and at
/// `parent_list` respectively.
pub fn mkdir<CK: Checksum, const NAME_LEN: usize, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    parent_list: Address,
    max_entries: usize,
    reserve: usize,
    name: &[u8],
    new_list: Address,
) -> Result<()> {
    if entry::find::<CK, NAME_LEN, PAGE_SIZE>(driver, cache, geometry, parent_list, max_entries, name)?.is_some() {
        return Err(Error::FileAlreadyExists);
    }
    if name.len() > NAME_LEN {
        return Err(Error::InvalidFileName);
    }

    let mut raw_name = [0u8; NAME_LEN];
    raw_name[..name.len()].copy_from_slice(name);
    let dir_entry = Entry {
        name: raw_name,
        attrib: Attrib::DIRECTORY.bits(),
        first_map_address: new_list.into(),
        file_size: 0,
        checksum: 0,
    };
    entry::append::<CK, NAME_LEN, PAGE_SIZE>(driver, cache, geometry, parent_list, max_entries, reserve, &dir_entry)?;

    // The new list is freshly allocated and still entirely erased, so
    // nothing else can be contending for its slots.
    append_dot_entries::<CK, NAME_LEN, PAGE_SIZE>(driver, cache, geometry, new_list, max_entries, parent_list)
}

pub(crate) fn append_dot_entries<CK: Checksum, const NAME_LEN: usize, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    new_list: Address,
    max_entries: usize,
    parent_list: Address,
) -> Result<()> {
    let mut dot_name = [0u8; NAME_LEN];
    dot_name[0] = b'.';
    let dot = Entry {
        name: dot_name,
        attrib: (Attrib::DIRECTORY | Attrib::SPECIAL).bits(),
        first_map_address: new_list.into(),
        file_size: 0,
        checksum: 0,
    };
    entry::append::<CK, NAME_LEN, PAGE_SIZE>(driver, cache, geometry, new_list, max_entries, 0, &dot)?;

    let mut dotdot_name = [0u8; NAME_LEN];
    dotdot_name[0] = b'.';
    dotdot_name[1] = b'.';
    let dotdot = Entry {
        name: dotdot_name,
        attrib: (Attrib::DIRECTORY | Attrib::SPECIAL).bits(),
        first_map_address: parent_list.into(),
        file_size: 0,
        checksum: 0,
    };
    entry::append::<CK, NAME_LEN, PAGE_SIZE>(driver, cache, geometry, new_list, max_entries, 0, &dotdot)
}

/// True if `list` holds nothing but `.` and `..`.
pub fn is_empty<CK: Checksum, const NAME_LEN: usize, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    list: Address,
    max_entries: usize,
) -> Result<bool> {
    for index in 0..max_entries {
        if let Some(found) = entry::read::<CK, NAME_LEN, PAGE_SIZE>(driver, cache, geometry, list, index)? {
            if found.attrib_flags().contains(Attrib::DELETED) {
                continue;
            }
            if !is_dot_name(&found.name) {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Removes the directory named `name` from `parent_list`. Fails with
/// [`Error::DirectoryNotEmpty`] unless the target holds only `.`/`..`,
/// and refuses to remove `.` or `..` themselves.
pub fn rmdir<CK: Checksum, const NAME_LEN: usize, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    parent_list: Address,
    max_entries: usize,
    name: &[u8],
) -> Result<()> {
    if name == b"." || name == b".." {
        return Err(Error::InvalidFileName);
    }
    let (_, found) = entry::find::<CK, NAME_LEN, PAGE_SIZE>(driver, cache, geometry, parent_list, max_entries, name)?
        .ok_or(Error::FileNotFound)?;
    if !found.attrib_flags().contains(Attrib::DIRECTORY) {
        return Err(Error::IsNotDirectory);
    }
    let list: Address = found.first_map_address.into();
    if !is_empty::<CK, NAME_LEN, PAGE_SIZE>(driver, cache, geometry, list, max_entries)? {
        return Err(Error::DirectoryNotEmpty);
    }
    entry::delete::<CK, NAME_LEN, PAGE_SIZE>(driver, cache, geometry, parent_list, max_entries, name)
}

/// One entry as surfaced to directory iteration.
#[derive(Clone, Copy, Debug)]
pub struct DirEntry<const NAME_LEN: usize> {
    pub name: [u8; NAME_LEN],
    pub attrib: Attrib,
    pub file_size: u32,
    pub first_map_address: Address,
}

/// Iteration state for one open directory: just the list being walked
/// and the next slot index to read. Unlike `bldb::ufs::dir::Iter`, which
/// borrows an owned `Inode` and so can implement `core::iter::Iterator`
/// directly, every read here needs the driver and cache passed in
/// explicitly, so advancing is a plain function rather than a trait
/// method.
#[derive(Clone, Copy, Debug)]
pub struct Directory {
    list: Address,
    index: usize,
}

/// Opens `list` (already resolved by [`resolve_dir`]) for iteration.
pub fn open_dir(list: Address) -> Directory {
    Directory { list, index: 0 }
}

/// Returns the directory's own entry list address, e.g. so a caller can
/// re-resolve `.` against it.
pub fn list_address(dir: &Directory) -> Address {
    dir.list
}

/// Reads the next live entry, skipping tombstoned slots, or `None` once
/// every slot up to `max_entries` has been visited.
pub fn read_dir<CK: Checksum, const NAME_LEN: usize, const PAGE_SIZE: usize>(
    driver: &mut (impl FlashDriver + ?Sized),
    cache: &mut Cache<PAGE_SIZE>,
    geometry: &Geometry,
    dir: &mut Directory,
    max_entries: usize,
) -> Result<Option<DirEntry<NAME_LEN>>> {
    while dir.index < max_entries {
        let index = dir.index;
        dir.index += 1;
        if let Some(found) = entry::read::<CK, NAME_LEN, PAGE_SIZE>(driver, cache, geometry, dir.list, index)? {
            if found.attrib_flags().contains(Attrib::DELETED) {
                continue;
            }
            return Ok(Some(DirEntry {
                name: found.name,
                attrib: found.attrib_flags(),
                file_size: found.file_size,
                first_map_address: found.first_map_address.into(),
            }));
        }
    }
    Ok(None)
}
