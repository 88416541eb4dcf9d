// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! On-flash record layouts.
//!
//! Every record here ends with a checksum field, and every multi-byte
//! field is little-endian — both match the original layout so that an
//! existing image can be read back byte-for-byte by a differently
//! generic-parameterized build reading the same geometry.

use bitflags::bitflags;
use static_assertions::const_assert;

use crate::address::Address;

/// Magic number stored in every management header, little-endian `"PIFS"`.
pub const MAGIC: u32 = 0x5346_4950;

pub const MAJOR_VERSION: u8 = 1;
pub const MINOR_VERSION: u8 = 0;

bitflags! {
    /// Attribute bits carried alongside each entry.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Attrib: u8 {
        /// Entry denotes a directory rather than a regular file.
        const DIRECTORY = 0b0000_0001;
        /// Entry has been marked deleted (tombstoned) but its slot has not
        /// yet been reclaimed by a merge.
        const DELETED   = 0b0000_0010;
        /// Entry is the special `.` or `..` directory alias.
        const SPECIAL   = 0b0000_0100;
    }
}

/// An address as stored on flash: block and page, each as narrow a field
/// as the geometry allows in the original, always `u32` here since this
/// crate favors one const-generic layout over macro-selected widths.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RawAddress {
    pub block: u32,
    pub page: u32,
}

impl From<Address> for RawAddress {
    fn from(a: Address) -> RawAddress {
        RawAddress { block: a.block, page: a.page }
    }
}

impl From<RawAddress> for Address {
    fn from(r: RawAddress) -> Address {
        Address { block: r.block, page: r.page }
    }
}

/// Management-area header. One generation of this record, plus its
/// trailing checksum, occupies the first logical page(s) of the active
/// management block.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Header {
    pub magic: u32,
    pub major_version: u8,
    pub minor_version: u8,
    pub _pad: [u8; 2],
    /// Generation counter. Incremented every switchover; the header with
    /// the higher counter (mod wraparound) among the two management
    /// blocks is the active one.
    pub counter: u32,
    pub next_management_block: u32,
    pub free_space_bitmap_address: RawAddress,
    pub root_entry_list_address: RawAddress,
    pub delta_map_address: RawAddress,
    pub wear_level_list_address: RawAddress,
    pub wear_level_cntr_max: u32,
    pub checksum: u32,
}

const_assert!(core::mem::size_of::<Header>() <= 128);

/// One entry in an entry list (a directory's file/subdirectory table).
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Entry<const NAME_LEN: usize> {
    pub name: [u8; NAME_LEN],
    pub attrib: u8,
    pub first_map_address: RawAddress,
    pub file_size: u32,
    pub checksum: u32,
}

impl<const NAME_LEN: usize> Entry<NAME_LEN> {
    pub fn attrib_flags(&self) -> Attrib {
        Attrib::from_bits_truncate(self.attrib)
    }
}

/// Header of one map page in a file's map chain.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct MapHeader {
    pub prev_map_address: RawAddress,
    pub prev_map_checksum: u32,
    pub next_map_address: RawAddress,
    pub next_map_checksum: u32,
}

/// One run of contiguous pages in a file's map chain.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct MapEntry {
    pub address: RawAddress,
    pub page_count: u16,
    pub checksum: u32,
}

/// Sentinel `page_count` meaning "this slot has never been written".
pub const MAP_PAGE_COUNT_ERASED: u16 = u16::MAX;
/// Sentinel `page_count` meaning "invalid run", distinct from erased so a
/// corrupt-but-programmed slot can still be told apart from a truly empty
/// one.
pub const MAP_PAGE_COUNT_INVALID: u16 = u16::MAX - 1;

/// One entry in the wear-level list: one record per data block.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct WearLevelEntry {
    pub wear_level_cntr: u16,
    /// Bit-extension byte: each programmed bit (erased polarity flipped)
    /// adds one to the effective erase count without requiring a
    /// rewrite of `wear_level_cntr` itself. See [`crate::wear`].
    pub wear_level_bits: u8,
    pub checksum: u32,
}

/// Sentinel meaning "never erased", i.e. this block has not entered
/// rotation yet.
pub const WEAR_LEVEL_CNTR_MAX: u16 = u16::MAX;
pub const WEAR_LEVEL_BITS_ERASED: u8 = u8::MAX;

/// One redirection record in the delta map: `orig_address` has been
/// logically overwritten; readers should fetch `delta_address` instead.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct DeltaEntry {
    pub delta_address: RawAddress,
    pub orig_address: RawAddress,
    pub checksum: u32,
}
